use std::sync::Arc;

use crate::config::BrainConfig;
use crate::core::{ScriptedProducer, TurnProducer};

/// Application state that can be shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: BrainConfig,
    /// Producer every new session hands its turns to.
    pub producer: Arc<dyn TurnProducer>,
}

impl AppState {
    pub fn new(config: BrainConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            producer: Arc::new(ScriptedProducer),
        })
    }

    pub fn with_producer(config: BrainConfig, producer: Arc<dyn TurnProducer>) -> Arc<Self> {
        Arc::new(Self { config, producer })
    }
}
