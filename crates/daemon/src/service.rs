//! Shared state handed to every HTTP handler.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;

use crate::config::Config;
use crate::recognition::RecognitionProxy;
use crate::session::{CommandDispatcher, SessionRegistry};

/// The engine service: one registry, its dispatcher, and the recognition proxy.
///
/// Cheap to clone; clones share the same registry.
#[derive(Debug, Clone)]
pub struct EngineService {
    config: Arc<Config>,
    registry: Arc<SessionRegistry>,
    dispatcher: CommandDispatcher,
    recognizer: RecognitionProxy,
    started_at: Instant,
}

impl EngineService {
    /// Builds the service from configuration.
    pub fn new(config: Config) -> Result<Self> {
        let registry = Arc::new(SessionRegistry::new(config.engine.clone()));
        let dispatcher = CommandDispatcher::new(Arc::clone(&registry));
        let recognizer = RecognitionProxy::new(&config.recognition)?;

        Ok(Self {
            config: Arc::new(config),
            registry,
            dispatcher,
            recognizer,
            started_at: Instant::now(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    pub fn recognizer(&self) -> &RecognitionProxy {
        &self.recognizer
    }

    /// Seconds since the service was built.
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Stops every engine session.
    pub async fn shutdown(&self) {
        self.registry.shutdown_all().await;
    }
}
