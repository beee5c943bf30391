//! Tests for channel plumbing that needs no live socket

use std::sync::Arc;

use riptide_protocol::StreamEndReason;
use tokio::sync::mpsc;

use super::*;
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::events::{EventBus, SystemEvent};
use crate::handler::{AckHandle, ControlEvent, DataEventHandler};
use crate::provider::StaticCredentials;
use crate::state::{SessionState, StreamRequest};

struct NullDataHandler;

impl DataEventHandler for NullDataHandler {
    fn on_data_event(&self, ack: AckHandle, _event: riptide_protocol::DataEvent) {
        ack.ack();
    }
}

struct NullControlHandler;

impl crate::handler::ControlEventHandler for NullControlHandler {
    fn on_control_event(&self, ack: AckHandle, _event: ControlEvent) {
        ack.ack();
    }
}

fn test_channel() -> (Arc<DcpChannel>, mpsc::UnboundedReceiver<SystemEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let config = Arc::new(ClientConfig::new("bucket"));
    let session = Arc::new(SessionState::new(4));
    let channel = DcpChannel::new(
        "127.0.0.1:11210".parse().unwrap(),
        config,
        session,
        Arc::new(StaticCredentials::new("user", "pass")),
        Arc::new(NullDataHandler),
        Arc::new(NullControlHandler),
        EventBus::new(tx, None),
    )
    .unwrap();
    (channel, rx)
}

#[tokio::test]
async fn test_open_stream_on_disconnected_channel_synthesises_stream_end() {
    let (channel, mut events) = test_channel();
    assert_eq!(channel.state(), ChannelState::Disconnected);

    let request = StreamRequest {
        vbid: 2,
        start_seqno: 0,
        end_seqno: u64::MAX,
        vbuuid: 0,
        snapshot_start_seqno: 0,
        snapshot_end_seqno: 0,
        manifest_uid: 0,
        stream_id: 0,
        collection_id: None,
    };
    channel.open_stream(&request);

    let event = events.try_recv().unwrap();
    assert_eq!(
        event,
        SystemEvent::StreamEnd {
            vbid: 2,
            reason: StreamEndReason::ChannelDropped,
            failover_logs_requested: false,
            seqnos_requested: false,
        }
    );
    assert!(!channel.stream_is_open(2));
}

#[tokio::test]
async fn test_close_stream_requires_connection() {
    let (channel, _events) = test_channel();
    assert!(matches!(
        channel.close_stream(1),
        Err(ClientError::NotConnected { .. })
    ));
}

#[tokio::test]
async fn test_failover_log_on_disconnected_channel_fails_the_wait() {
    let (channel, _events) = test_channel();
    channel.get_failover_log(3);
    assert!(channel.failover_log_pending(3));
}

#[test]
fn test_bitset_set_get() {
    let mut bits = Bitset::new(130);
    assert!(!bits.any());
    bits.set(0, true);
    bits.set(64, true);
    bits.set(129, true);
    assert!(bits.get(0));
    assert!(bits.get(64));
    assert!(bits.get(129));
    assert!(!bits.get(1));
    assert!(bits.any());
    assert_eq!(bits.ones(), vec![0, 64, 129]);

    bits.set(64, false);
    assert_eq!(bits.ones(), vec![0, 129]);
}

#[test]
fn test_bitset_ignores_out_of_range() {
    let mut bits = Bitset::new(4);
    bits.set(9, true);
    assert!(!bits.get(9));
    assert!(!bits.any());
}
