//! Test doubles for the streaming client
//!
//! An in-process KV node speaking just enough of the binary protocol to
//! exercise the full client, plus recording callback handlers and a
//! scriptable config provider. Useful for embedder test suites as well
//! as this crate's own integration tests.


pub use mock_server::{MockKvNode, StreamReqAction};

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use riptide_protocol::DataEvent;
use tokio::sync::mpsc;

use crate::delay::Delay;
use crate::error::{ClientError, Result};
use crate::events::SystemEvent;
use crate::handler::{
    AckHandle, ControlEvent, ControlEventHandler, DataEventHandler, SystemEventHandler,
};
use crate::provider::{BucketConfig, ConfigProvider};

/// Data handler that acks every frame and forwards it to a channel
pub struct RecordingDataHandler {
    tx: mpsc::UnboundedSender<DataEvent>,
}

impl RecordingDataHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DataEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl DataEventHandler for RecordingDataHandler {
    fn on_data_event(&self, ack: AckHandle, event: DataEvent) {
        ack.ack();
        let _ = self.tx.send(event);
    }
}

/// Control handler that acks every frame and forwards it to a channel
pub struct RecordingControlHandler {
    tx: mpsc::UnboundedSender<ControlEvent>,
}

impl RecordingControlHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ControlEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ControlEventHandler for RecordingControlHandler {
    fn on_control_event(&self, ack: AckHandle, event: ControlEvent) {
        ack.ack();
        let _ = self.tx.send(event);
    }
}

/// System-event observer forwarding to a channel
pub struct RecordingSystemHandler {
    tx: mpsc::UnboundedSender<SystemEvent>,
}

impl RecordingSystemHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SystemEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl SystemEventHandler for RecordingSystemHandler {
    fn on_system_event(&self, event: &SystemEvent) {
        let _ = self.tx.send(event.clone());
    }
}

/// Config provider backed by a mutable in-memory topology
pub struct MockConfigProvider {
    config: Mutex<BucketConfig>,
    fail_refreshes: AtomicU32,
    refreshes: AtomicU32,
}

impl MockConfigProvider {
    pub fn new(config: BucketConfig) -> Self {
        Self {
            config: Mutex::new(config),
            fail_refreshes: AtomicU32::new(0),
            refreshes: AtomicU32::new(0),
        }
    }

    /// Replace the topology, as a rebalance would
    pub fn set_config(&self, config: BucketConfig) {
        *self.config.lock().expect("mock config") = config;
    }

    /// Make the next `count` refreshes fail
    pub fn fail_next_refreshes(&self, count: u32) {
        self.fail_refreshes.store(count, Ordering::SeqCst);
    }

    pub fn refresh_count(&self) -> u32 {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConfigProvider for MockConfigProvider {
    async fn refresh(
        &self,
        _attempt_timeout: Duration,
        _total_timeout: Duration,
        _delay: Delay,
    ) -> Result<()> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_refreshes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_refreshes.store(remaining - 1, Ordering::SeqCst);
            return Err(ClientError::ConfigProvider("scripted refresh failure".into()));
        }
        Ok(())
    }

    fn config(&self) -> BucketConfig {
        self.config.lock().expect("mock config").clone()
    }
}
