//! Runtime Builder API
//!
//! Provides a builder-style API for consumers (UI shells, tests) to hand over
//! a transport and get a [`RuntimeHandle`] back.

use crate::managers::create_shared_timeline;
use crate::runtime::RuntimeHandle;
use crate::tasks::SessionDriverTask;
use dropline_core::{
    create_event_channel, generate_identity, DroplineConfig, DroplineResult, LaunchRequest,
    SessionIdentity, Transport,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, Level};

// ----------------------------------------------------------------------------
// Runtime Builder
// ----------------------------------------------------------------------------

/// Builder for a Dropline runtime driving one transport
pub struct RuntimeBuilder {
    transport: Arc<dyn Transport>,
    config: DroplineConfig,
    identity: Option<SessionIdentity>,
    launch_url: Option<String>,
    log_level: Option<Level>,
}

impl RuntimeBuilder {
    pub fn new<T: Transport + 'static>(transport: T) -> Self {
        Self {
            transport: Arc::new(transport),
            config: DroplineConfig::default(),
            identity: None,
            launch_url: None,
            log_level: None,
        }
    }

    /// Set the Dropline configuration
    pub fn with_config(mut self, config: DroplineConfig) -> Self {
        self.config = config;
        self
    }

    /// Register under a fixed identity instead of a generated one
    pub fn with_identity(mut self, identity: SessionIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// URL the app was opened with; a `connect` parameter is honored once
    pub fn with_launch_url(mut self, url: impl Into<String>) -> Self {
        self.launch_url = Some(url.into());
        self
    }

    /// Configure console logging
    pub fn with_console_logging(mut self, level: Level) -> Self {
        self.log_level = Some(level);
        self
    }

    /// Disable logging
    pub fn with_no_logging(mut self) -> Self {
        self.log_level = None;
        self
    }

    /// Build and start the runtime
    pub async fn build_and_start(self) -> DroplineResult<RuntimeHandle> {
        if let Some(level) = self.log_level {
            setup_logging(level);
        }
        self.config.validate()?;

        let launch = self
            .launch_url
            .as_deref()
            .map(LaunchRequest::parse)
            .transpose()?;
        let identity = self.identity.unwrap_or_else(generate_identity);
        info!("Building Dropline runtime as {}", identity);

        let (command_sender, command_receiver) =
            mpsc::channel(self.config.channels.command_buffer_size);
        let (event_sender, event_receiver) = create_event_channel(&self.config.channels);
        let timeline = create_shared_timeline();

        let driver = SessionDriverTask::start(
            self.config,
            self.transport,
            identity,
            launch,
            command_receiver,
            event_sender.clone(),
            timeline.clone(),
        )
        .await?;
        let driver_handle = tokio::spawn(driver.run());

        info!("Dropline runtime started");
        Ok(RuntimeHandle::new(
            command_sender,
            event_sender,
            event_receiver,
            timeline,
            driver_handle,
        ))
    }
}

/// Install a console subscriber; later calls keep the first one
fn setup_logging(level: Level) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init();
}

// ----------------------------------------------------------------------------
// Convenience Functions
// ----------------------------------------------------------------------------

/// Create a runtime with testing configuration
pub async fn create_test_runtime<T: Transport + 'static>(
    transport: T,
) -> DroplineResult<RuntimeHandle> {
    RuntimeBuilder::new(transport)
        .with_config(DroplineConfig::testing())
        .with_no_logging()
        .build_and_start()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use dropline_harness::LoopbackBroker;

    #[tokio::test]
    async fn test_runtime_builder() {
        let broker = LoopbackBroker::default();
        let identity = SessionIdentity::parse("local-1").unwrap();

        let mut runtime = RuntimeBuilder::new(broker.transport())
            .with_identity(identity.clone())
            .with_no_logging()
            .build_and_start()
            .await
            .expect("Failed to build runtime");

        assert!(runtime.is_running());
        assert_eq!(runtime.identity().await.unwrap(), identity);
        assert_eq!(broker.endpoints_created().await, vec![identity.clone()]);

        runtime.shutdown().await.expect("Failed to shutdown");
        assert!(!runtime.is_running());
        assert_eq!(broker.destroyed().await, vec![identity]);
    }

    #[tokio::test]
    async fn test_invalid_launch_url_fails_the_build() {
        let broker = LoopbackBroker::default();
        let result = RuntimeBuilder::new(broker.transport())
            .with_launch_url("not a url")
            .build_and_start()
            .await;
        assert!(result.is_err());
        assert!(broker.endpoints_created().await.is_empty());
    }

    #[tokio::test]
    async fn test_event_receiver_can_be_taken_once() {
        let broker = LoopbackBroker::default();
        let mut runtime = create_test_runtime(broker.transport()).await.unwrap();

        let _events = runtime.take_event_receiver().expect("receiver");
        assert!(runtime.take_event_receiver().is_none());

        runtime.shutdown().await.unwrap();
    }
}
