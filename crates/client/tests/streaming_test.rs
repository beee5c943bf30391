//! End-to-end tests against the in-process KV node
//!
//! Each test drives the full client (conductor, channels, fixer, flow
//! control) against one or more mock nodes and asserts on the frames
//! that crossed the wire plus the resulting partition state.

use std::sync::Arc;
use std::time::Duration;

use riptide_client::test::{
    MockConfigProvider, MockKvNode, RecordingControlHandler, RecordingDataHandler,
    RecordingSystemHandler, StreamReqAction,
};
use riptide_client::{
    BucketConfig, ClientConfig, Conductor, ControlEvent, DataEvent, SessionState,
    StaticCredentials, SystemEvent,
};
use riptide_protocol::{FailoverEntry, Frame, Opcode, Status, StreamEndReason};
use tokio::sync::mpsc;

/// Wire value of the STATE_CHANGED stream-end reason
const STATE_CHANGED: u32 = 0x02;

struct Harness {
    conductor: Arc<Conductor>,
    provider: Arc<MockConfigProvider>,
    data: mpsc::UnboundedReceiver<DataEvent>,
    control: mpsc::UnboundedReceiver<ControlEvent>,
    system: mpsc::UnboundedReceiver<SystemEvent>,
}

fn topology(nodes: &[&MockKvNode], vbucket_map: Vec<i16>) -> BucketConfig {
    BucketConfig::new(1, nodes.iter().map(|node| node.addr()).collect(), vbucket_map)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn harness(config: ClientConfig, bucket_config: BucketConfig) -> Harness {
    init_tracing();
    let provider = Arc::new(MockConfigProvider::new(bucket_config));
    let (data_handler, data) = RecordingDataHandler::new();
    let (control_handler, control) = RecordingControlHandler::new();
    let (system_handler, system) = RecordingSystemHandler::new();
    let provider_dyn: Arc<dyn riptide_client::ConfigProvider> = Arc::clone(&provider) as Arc<dyn riptide_client::ConfigProvider>;
    let conductor = Conductor::new(
        config,
        provider_dyn,
        Arc::new(StaticCredentials::new("reader", "password")),
        Arc::new(data_handler),
        Arc::new(control_handler),
        Some(Arc::new(system_handler)),
    )
    .expect("conductor construction");
    Harness {
        conductor,
        provider,
        data,
        control,
        system,
    }
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn stream_req_u64(frame: &Frame, offset: usize) -> u64 {
    let extras = frame.extras();
    u64::from_be_bytes(extras[offset..offset + 8].try_into().unwrap())
}

fn stream_req_start(frame: &Frame) -> u64 {
    stream_req_u64(frame, 8)
}

fn stream_req_vbuuid(frame: &Frame) -> u64 {
    stream_req_u64(frame, 24)
}

#[tokio::test]
async fn test_cold_start_two_vbuckets_one_node() {
    let node = MockKvNode::start().await;
    let mut h = harness(ClientConfig::new("events"), topology(&[&node], vec![0, 0]));

    h.conductor.connect().await.unwrap();
    h.conductor.start_streaming().await.unwrap();

    wait_until("two stream requests", || {
        node.count_received(Opcode::DcpStreamReq) == 2
    })
    .await;
    assert_eq!(node.connection_count(), 1, "one channel per node");

    let session = h.conductor.session_state().unwrap();
    wait_until("both streams connected", || {
        session.get(0).phase().is_connected() && session.get(1).phase().is_connected()
    })
    .await;

    for vbid in [0u16, 1] {
        node.push_snapshot(vbid, 0, 10);
        for seqno in 1..=10u64 {
            node.push_mutation(vbid, seqno, b"key", b"{}");
        }
    }

    wait_until("both partitions at seqno 10", || {
        session.get(0).seqno() == 10 && session.get(1).seqno() == 10
    })
    .await;

    let mut delivered = 0;
    while h.data.try_recv().is_ok() {
        delivered += 1;
    }
    assert_eq!(delivered, 20);

    h.conductor.disconnect(true).await;
    node.shutdown();
}

#[tokio::test]
async fn test_connect_twice_is_noop() {
    let node = MockKvNode::start().await;
    let h = harness(ClientConfig::new("events"), topology(&[&node], vec![0]));

    h.conductor.connect().await.unwrap();
    let refreshes = h.provider.refresh_count();
    h.conductor.connect().await.unwrap();
    assert_eq!(h.provider.refresh_count(), refreshes, "second connect is a no-op");
    assert_eq!(node.count_received(Opcode::SaslAuth), 1);

    h.conductor.disconnect(true).await;
    node.shutdown();
}

#[tokio::test]
async fn test_start_streaming_twice_sends_one_request_per_partition() {
    let node = MockKvNode::start().await;
    let h = harness(ClientConfig::new("events"), topology(&[&node], vec![0]));

    h.conductor.connect().await.unwrap();
    h.conductor.start_streaming().await.unwrap();
    let session = h.conductor.session_state().unwrap();
    wait_until("stream connected", || session.get(0).phase().is_connected()).await;

    h.conductor.start_streaming().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(node.count_received(Opcode::DcpStreamReq), 1);

    h.conductor.disconnect(true).await;
    node.shutdown();
}

#[tokio::test]
async fn test_rebalance_moves_stream_to_new_master() {
    let node1 = MockKvNode::start().await;
    let node2 = MockKvNode::start().await;
    let mut h = harness(
        ClientConfig::new("events"),
        topology(&[&node1, &node2], vec![0]),
    );

    h.conductor.connect().await.unwrap();
    h.conductor.start_streaming().await.unwrap();
    let session = h.conductor.session_state().unwrap();
    wait_until("stream on first master", || {
        session.get(0).phase().is_connected()
    })
    .await;

    node1.push_snapshot(0, 0, 5);
    for seqno in 1..=5u64 {
        node1.push_mutation(0, seqno, b"key", b"{}");
    }
    wait_until("partition at seqno 5", || session.get(0).seqno() == 5).await;

    // rebalance: vbucket 0 moves to the second node
    h.provider
        .set_config(topology(&[&node1, &node2], vec![1]));
    node1.push_stream_end(0, STATE_CHANGED);

    wait_until("stream re-opened on new master", || {
        node2.count_received(Opcode::DcpStreamReq) == 1
    })
    .await;
    let request = node2.last_stream_request(0).unwrap();
    assert_eq!(stream_req_start(&request), 5, "resumes from the last seqno");

    node2.push_snapshot(0, 5, 8);
    node2.push_mutation(0, 6, b"key", b"{}");
    wait_until("stream advances past the rebalance", || {
        session.get(0).seqno() == 6
    })
    .await;

    let saw_state_changed = std::iter::from_fn(|| h.system.try_recv().ok()).any(|event| {
        matches!(
            event,
            SystemEvent::StreamEnd {
                vbid: 0,
                reason: StreamEndReason::StateChanged,
                ..
            }
        )
    });
    assert!(saw_state_changed);

    h.conductor.disconnect(true).await;
    node1.shutdown();
    node2.shutdown();
}

#[tokio::test]
async fn test_rollback_disconnects_and_notifies_once() {
    let node = MockKvNode::start().await;
    let mut h = harness(ClientConfig::new("events"), topology(&[&node], vec![0]));
    node.set_stream_action(0, StreamReqAction::Rollback { seqno: 3 });

    h.conductor.connect().await.unwrap();
    h.conductor.start_streaming().await.unwrap();

    wait_until("client disconnected by rollback", || {
        !h.conductor.is_connected()
    })
    .await;

    let rollbacks: Vec<ControlEvent> = std::iter::from_fn(|| h.control.try_recv().ok())
        .filter(|event| matches!(event, ControlEvent::Rollback { .. }))
        .collect();
    assert_eq!(rollbacks.len(), 1, "rollback surfaced exactly once");
    assert!(matches!(
        rollbacks[0],
        ControlEvent::Rollback { vbid: 0, seqno: 3 }
    ));

    let saw_system_rollback = std::iter::from_fn(|| h.system.try_recv().ok())
        .any(|event| matches!(event, SystemEvent::Rollback { vbid: 0, seqno: 3 }));
    assert!(saw_system_rollback);

    // the stream is gone; nothing may be delivered afterwards
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.data.try_recv().is_err());

    node.shutdown();
}

#[tokio::test]
async fn test_dead_connection_detection_reconnects() {
    let node = MockKvNode::start().await;
    let config = ClientConfig::new("events")
        .with_dead_connection_detection(Duration::from_millis(500));
    let mut h = harness(config, topology(&[&node], vec![0]));

    h.conductor.connect().await.unwrap();
    h.conductor.start_streaming().await.unwrap();
    let session = h.conductor.session_state().unwrap();
    wait_until("stream connected", || session.get(0).phase().is_connected()).await;

    node.push_snapshot(0, 0, 3);
    for seqno in 1..=3u64 {
        node.push_mutation(0, seqno, b"key", b"{}");
    }
    wait_until("partition at seqno 3", || session.get(0).seqno() == 3).await;

    // go silent; the detector must fire and the fixer must reconnect
    wait_until("stream re-opened after dead connection", || {
        node.count_received(Opcode::DcpStreamReq) >= 2
    })
    .await;

    let drops: Vec<SystemEvent> = std::iter::from_fn(|| h.system.try_recv().ok())
        .filter(|event| matches!(event, SystemEvent::ChannelDropped { .. }))
        .collect();
    assert_eq!(drops.len(), 1, "exactly one drop per silent episode");

    let request = node.last_stream_request(0).unwrap();
    assert_eq!(stream_req_start(&request), 3, "re-opened from stored seqno");
    assert_eq!(
        stream_req_vbuuid(&request),
        0xfeed,
        "re-opened with the stored vbuuid"
    );

    h.conductor.disconnect(true).await;
    node.shutdown();
}

#[tokio::test]
async fn test_abrupt_socket_close_reopens_streams() {
    let node = MockKvNode::start().await;
    let mut h = harness(ClientConfig::new("events"), topology(&[&node], vec![0]));

    h.conductor.connect().await.unwrap();
    h.conductor.start_streaming().await.unwrap();
    let session = h.conductor.session_state().unwrap();
    wait_until("stream connected", || session.get(0).phase().is_connected()).await;

    node.push_snapshot(0, 0, 2);
    node.push_mutation(0, 1, b"key", b"{}");
    node.push_mutation(0, 2, b"key", b"{}");
    wait_until("partition at seqno 2", || session.get(0).seqno() == 2).await;

    // the config refresh after the drop fails once; the fixer must back
    // off and fix the channel on its second attempt
    h.provider.fail_next_refreshes(1);
    node.drop_connections();

    wait_until("channel drop reported", || {
        matches!(h.system.try_recv(), Ok(SystemEvent::ChannelDropped { .. }))
    })
    .await;

    wait_until("stream re-opened after socket close", || {
        node.count_received(Opcode::DcpStreamReq) >= 2
    })
    .await;
    let request = node.last_stream_request(0).unwrap();
    assert_eq!(stream_req_start(&request), 2);
    assert!(h.provider.refresh_count() >= 2);

    h.conductor.disconnect(true).await;
    node.shutdown();
}

#[tokio::test]
async fn test_flow_control_saturation_acks_once() {
    let node = MockKvNode::start().await;
    let config = ClientConfig::new("events").with_flow_control(1024, 50);
    let h = harness(config, topology(&[&node], vec![0]));

    h.conductor.connect().await.unwrap();
    h.conductor.start_streaming().await.unwrap();
    let session = h.conductor.session_state().unwrap();
    wait_until("stream connected", || session.get(0).phase().is_connected()).await;

    // three mutations of exactly 200 wire bytes each: 600 total, which
    // crosses the 512-byte watermark on the final ack only
    for seqno in 1..=3u64 {
        let wire_len = node.push_mutation(0, seqno, b"k", &[b'x'; 144]);
        assert_eq!(wire_len, 200);
    }

    wait_until("buffer ack on the wire", || {
        node.count_received(Opcode::DcpBufferAck) == 1
    })
    .await;
    assert_eq!(node.buffer_ack_total(), 600);

    let channel = h.conductor.channel_for_partition(0).unwrap();
    assert_eq!(channel.flow().unacked_bytes(), 0);
    assert_eq!(channel.flow().leaked_handles(), 0);

    h.conductor.disconnect(true).await;
    node.shutdown();
}

#[tokio::test]
async fn test_oso_snapshot_promotes_window_maximum() {
    let node = MockKvNode::start().await;
    let mut h = harness(ClientConfig::new("events"), topology(&[&node], vec![0]));

    h.conductor.connect().await.unwrap();
    h.conductor.start_streaming().await.unwrap();
    let session = h.conductor.session_state().unwrap();
    wait_until("stream connected", || session.get(0).phase().is_connected()).await;

    node.push_oso(0, true);
    for seqno in [7u64, 5, 9] {
        node.push_mutation(0, seqno, b"key", b"{}");
    }

    let mut seen = 0;
    while seen < 3 {
        if h.data.recv().await.is_some() {
            seen += 1;
        }
    }
    let partition = session.get(0);
    assert_eq!(partition.seqno(), 0, "seqno frozen inside the OSO window");
    assert_eq!(partition.oso_max_seqno(), 9);

    node.push_oso(0, false);
    wait_until("OSO promotion", || session.get(0).seqno() == 9).await;
    assert_eq!(partition.snapshot_start_seqno(), 9);
    assert_eq!(partition.snapshot_end_seqno(), 9);

    h.conductor.disconnect(true).await;
    node.shutdown();
}

#[tokio::test]
async fn test_stop_stream_and_wait() {
    let node = MockKvNode::start().await;
    let h = harness(ClientConfig::new("events"), topology(&[&node], vec![0]));

    h.conductor.connect().await.unwrap();
    h.conductor.start_streaming().await.unwrap();
    let session = h.conductor.session_state().unwrap();
    wait_until("stream connected", || session.get(0).phase().is_connected()).await;

    h.conductor.request_stop_stream(0).unwrap();
    h.conductor
        .wait_for_stop(0, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(node.count_received(Opcode::DcpCloseStream), 1);

    h.conductor.disconnect(true).await;
    node.shutdown();
}

#[tokio::test]
async fn test_failover_log_request_roundtrip() {
    let node = MockKvNode::start().await;
    node.set_stream_action(
        0,
        StreamReqAction::Accept {
            failover: vec![
                FailoverEntry { uuid: 0xa, seqno: 0 },
                FailoverEntry { uuid: 0xb, seqno: 50 },
            ],
        },
    );
    let h = harness(ClientConfig::new("events"), topology(&[&node], vec![0]));

    h.conductor.connect().await.unwrap();
    h.conductor.request_failover_log(0).unwrap();
    let log = h
        .conductor
        .wait_for_failover_log(0, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(
        log,
        vec![
            FailoverEntry { uuid: 0xa, seqno: 0 },
            FailoverEntry { uuid: 0xb, seqno: 50 },
        ]
    );
    assert_eq!(h.conductor.session_state().unwrap().get(0).uuid(), 0xb);

    h.conductor.disconnect(true).await;
    node.shutdown();
}

#[tokio::test]
async fn test_get_seqnos_samples_remote_watermarks() {
    let node = MockKvNode::start().await;
    node.set_seqno(0, 42);
    node.set_seqno(1, 7);
    let h = harness(ClientConfig::new("events"), topology(&[&node], vec![0, 0]));

    h.conductor.connect().await.unwrap();
    h.conductor.get_seqnos(Duration::from_secs(5)).await.unwrap();

    let session = h.conductor.session_state().unwrap();
    assert_eq!(session.get(0).master_seqno(), 42);
    assert_eq!(session.get(1).master_seqno(), 7);

    h.conductor.disconnect(true).await;
    node.shutdown();
}

#[tokio::test]
async fn test_session_resume_uses_persisted_position() {
    let node = MockKvNode::start().await;
    let h = harness(ClientConfig::new("events"), topology(&[&node], vec![0]));

    h.conductor.connect().await.unwrap();
    h.conductor.start_streaming().await.unwrap();
    let session = h.conductor.session_state().unwrap();
    wait_until("stream connected", || session.get(0).phase().is_connected()).await;

    node.push_snapshot(0, 0, 5);
    for seqno in 1..=5u64 {
        node.push_mutation(0, seqno, b"key", b"{}");
    }
    wait_until("partition at seqno 5", || session.get(0).seqno() == 5).await;

    let persisted = session.to_json().unwrap();
    h.conductor.disconnect(true).await;
    node.shutdown();

    // a fresh client resumes from the persisted state
    let node2 = MockKvNode::start().await;
    let provider: Arc<dyn riptide_client::ConfigProvider> =
        Arc::new(MockConfigProvider::new(topology(&[&node2], vec![0])));
    let (data_handler, _data) = RecordingDataHandler::new();
    let (control_handler, _control) = RecordingControlHandler::new();
    let conductor = Conductor::with_session(
        ClientConfig::new("events"),
        provider,
        Arc::new(StaticCredentials::new("reader", "password")),
        Arc::new(data_handler),
        Arc::new(control_handler),
        None,
        SessionState::from_json(&persisted).unwrap(),
    )
    .unwrap();

    conductor.connect().await.unwrap();
    conductor.start_streaming().await.unwrap();
    wait_until("resumed stream request", || {
        node2.count_received(Opcode::DcpStreamReq) == 1
    })
    .await;

    let request = node2.last_stream_request(0).unwrap();
    assert_eq!(stream_req_start(&request), 5);
    assert_eq!(stream_req_vbuuid(&request), 0xfeed);

    conductor.disconnect(true).await;
    node2.shutdown();
}

#[tokio::test]
async fn test_open_stream_failure_is_retried_via_fixer() {
    let node = MockKvNode::start().await;
    node.set_stream_action(0, StreamReqAction::Fail { status: Status::NotMyVbucket });
    let mut h = harness(ClientConfig::new("events"), topology(&[&node], vec![0]));

    h.conductor.connect().await.unwrap();
    h.conductor.start_streaming().await.unwrap();

    wait_until("not-my-vbucket surfaced", || {
        matches!(
            h.system.try_recv(),
            Ok(SystemEvent::OpenStreamFailed {
                vbid: 0,
                status: Status::NotMyVbucket,
                ..
            })
        )
    })
    .await;

    // the server now owns the vbucket; the fixer's retry must land after
    // the partition's 1s backoff
    node.set_stream_action(0, StreamReqAction::Accept { failover: vec![] });
    let session = h.conductor.session_state().unwrap();
    wait_until("stream recovered", || session.get(0).phase().is_connected()).await;

    h.conductor.disconnect(true).await;
    node.shutdown();
}

#[tokio::test]
async fn test_fixer_gives_up_after_retry_budget() {
    let node = MockKvNode::start().await;
    let mut h = harness(ClientConfig::new("events"), topology(&[&node], vec![0]));

    h.conductor.connect().await.unwrap();
    h.conductor.start_streaming().await.unwrap();
    let session = h.conductor.session_state().unwrap();
    wait_until("stream connected", || session.get(0).phase().is_connected()).await;

    // the master vanishes for good; retries must stop at the budget
    h.provider.set_config(topology(&[&node], vec![-1]));
    tokio::time::pause();
    node.push_stream_end(0, STATE_CHANGED);

    let failure = tokio::time::timeout(Duration::from_secs(100_000), async {
        loop {
            match h.system.recv().await {
                Some(SystemEvent::UnexpectedFailure { cause }) => break cause,
                Some(_) => continue,
                None => panic!("system event stream closed"),
            }
        }
    })
    .await
    .expect("fixer never gave up");
    assert!(failure.contains("101 attempts"), "cause was: {failure}");
    assert!(!h.conductor.is_connected());

    node.shutdown();
}
