//! The conductor: single authority over channels and session state
//!
//! Owns the channel set keyed by node address behind one coarse lock,
//! drives bootstrap against the config provider, routes stream requests
//! to the owning channel and brokers the caller-facing waits. Recovery
//! actions live in the fixer; the conductor only exposes the levers the
//! fixer pulls.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use riptide_protocol::FailoverEntry;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::channel::{ChannelState, DcpChannel};
use crate::config::ClientConfig;
use crate::delay::Delay;
use crate::error::{ClientError, Result};
use crate::events::{EventBus, SystemEvent};
use crate::fixer::Fixer;
use crate::handler::{ControlEventHandler, DataEventHandler, SystemEventHandler};
use crate::provider::{BucketConfig, ConfigProvider, CredentialsProvider};
use crate::state::{SessionState, StreamRequest, StreamState};

/// Orchestrator tying channels to the cluster topology
pub struct Conductor {
    config: Arc<ClientConfig>,
    provider: Arc<dyn ConfigProvider>,
    credentials: Arc<dyn CredentialsProvider>,
    data_handler: Arc<dyn DataEventHandler>,
    control_handler: Arc<dyn ControlEventHandler>,
    events: EventBus,
    session: OnceLock<Arc<SessionState>>,
    /// The channels lock: all additions/removals and routing reads
    channels: Mutex<HashMap<SocketAddr, Arc<DcpChannel>>>,
    connected: AtomicBool,
    fixer_rx: Mutex<Option<mpsc::UnboundedReceiver<SystemEvent>>>,
    fixer_task: Mutex<Option<JoinHandle<()>>>,
}

impl Conductor {
    pub fn new(
        config: ClientConfig,
        provider: Arc<dyn ConfigProvider>,
        credentials: Arc<dyn CredentialsProvider>,
        data_handler: Arc<dyn DataEventHandler>,
        control_handler: Arc<dyn ControlEventHandler>,
        system_handler: Option<Arc<dyn SystemEventHandler>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let (fixer_tx, fixer_rx) = mpsc::unbounded_channel();
        Ok(Arc::new(Self {
            config: Arc::new(config),
            provider,
            credentials,
            data_handler,
            control_handler,
            events: EventBus::new(fixer_tx, system_handler),
            session: OnceLock::new(),
            channels: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(false),
            fixer_rx: Mutex::new(Some(fixer_rx)),
            fixer_task: Mutex::new(None),
        }))
    }

    /// Build a conductor around a previously persisted session
    ///
    /// Streams opened after `connect` resume at each partition's stored
    /// seqno with its stored failover history.
    pub fn with_session(
        config: ClientConfig,
        provider: Arc<dyn ConfigProvider>,
        credentials: Arc<dyn CredentialsProvider>,
        data_handler: Arc<dyn DataEventHandler>,
        control_handler: Arc<dyn ControlEventHandler>,
        system_handler: Option<Arc<dyn SystemEventHandler>>,
        session: SessionState,
    ) -> Result<Arc<Self>> {
        let conductor = Self::new(
            config,
            provider,
            credentials,
            data_handler,
            control_handler,
            system_handler,
        )?;
        let _ = conductor.session.set(Arc::new(session));
        Ok(conductor)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Session state, available once `connect` has bootstrapped
    pub fn session_state(&self) -> Result<Arc<SessionState>> {
        self.session
            .get()
            .cloned()
            .ok_or_else(|| ClientError::InvalidState("client is not connected".into()))
    }

    pub(crate) fn bucket_config(&self) -> BucketConfig {
        self.provider.config()
    }

    /// Config refresh on the fixer's behalf
    pub(crate) async fn provider_refresh(
        &self,
        attempt_timeout: Duration,
        total_timeout: Duration,
        delay: Delay,
    ) -> Result<()> {
        self.provider
            .refresh(attempt_timeout, total_timeout, delay)
            .await
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) fn publish(&self, event: SystemEvent) {
        self.events.publish(event);
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Bootstrap the session: fetch the config, start the fixer and open
    /// one channel per master node. Calling this twice without an
    /// intervening disconnect is a no-op.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        if self.connected.swap(true, Ordering::AcqRel) {
            tracing::debug!("connect called while already connected");
            return Ok(());
        }

        if let Err(e) = self
            .provider
            .refresh(
                self.config.config_provider_attempt_timeout,
                self.config.config_provider_total_timeout,
                self.config.config_provider_reconnect_delay,
            )
            .await
        {
            self.connected.store(false, Ordering::Release);
            return Err(e);
        }

        let bucket_config = self.provider.config();
        let session = self.session.get_or_init(|| {
            Arc::new(SessionState::with_streams(
                bucket_config.num_partitions(),
                streams_for(&self.config),
            ))
        });
        session.set_client_disconnected(false);

        if let Some(rx) = self.fixer_rx.lock().expect("fixer rx").take() {
            let fixer = Fixer::new(Arc::clone(self), rx);
            *self.fixer_task.lock().expect("fixer task") = Some(tokio::spawn(fixer.run()));
        }

        let established = self.establish_dcp_connections().await;
        if established.is_err() {
            self.connected.store(false, Ordering::Release);
        }
        established
    }

    /// Ensure a connected channel per master node; close orphans
    pub(crate) async fn establish_dcp_connections(self: &Arc<Self>) -> Result<()> {
        let bucket_config = self.provider.config();
        let selected = self.selected_vbuckets(&bucket_config);
        let masters = bucket_config.masters_for(selected);
        tracing::debug!(masters = masters.len(), "establishing DCP connections");
        for address in masters {
            self.ensure_channel_connected(
                address,
                self.config.dcp_channel_attempt_timeout,
                self.config.dcp_channel_total_timeout,
                self.config.dcp_channels_reconnect_delay,
            )
            .await?;
        }

        // drop channels that neither own vbuckets nor carry open streams
        let orphans: Vec<Arc<DcpChannel>> = {
            let channels = self.channels.lock().expect("channels lock");
            channels
                .values()
                .filter(|channel| {
                    !bucket_config.has_primary_partitions_on(channel.address())
                        && !channel.has_open_streams()
                })
                .cloned()
                .collect()
        };
        for orphan in orphans {
            tracing::info!(address = %orphan.address(), "closing orphan channel");
            orphan.disconnect(false).await;
            self.remove_channel(orphan.address());
        }
        Ok(())
    }

    /// The vbucket subset this client streams
    pub(crate) fn selected_vbuckets(&self, bucket_config: &BucketConfig) -> Vec<u16> {
        if self.config.vbuckets.is_empty() {
            (0..bucket_config.num_partitions()).collect()
        } else {
            self.config.vbuckets.clone()
        }
    }

    fn ensure_channel(&self, address: SocketAddr) -> Result<Arc<DcpChannel>> {
        let mut channels = self.channels.lock().expect("channels lock");
        if let Some(channel) = channels.get(&address) {
            return Ok(Arc::clone(channel));
        }
        let channel = DcpChannel::new(
            address,
            Arc::clone(&self.config),
            self.session_state()?,
            Arc::clone(&self.credentials),
            Arc::clone(&self.data_handler),
            Arc::clone(&self.control_handler),
            self.events.clone(),
        )?;
        channels.insert(address, Arc::clone(&channel));
        Ok(channel)
    }

    /// Channel for a node, connected; connects it when necessary
    pub(crate) async fn ensure_channel_connected(
        &self,
        address: SocketAddr,
        attempt_timeout: Duration,
        total_timeout: Duration,
        delay: Delay,
    ) -> Result<Arc<DcpChannel>> {
        let channel = self.ensure_channel(address)?;
        if channel.state() == ChannelState::Disconnected {
            match channel.connect(attempt_timeout, total_timeout, delay).await {
                Ok(()) => {}
                // someone else won the connect race; the channel is live
                Err(ClientError::InvalidState(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(channel)
    }

    pub(crate) fn channel_by_address(&self, address: SocketAddr) -> Option<Arc<DcpChannel>> {
        self.channels
            .lock()
            .expect("channels lock")
            .get(&address)
            .cloned()
    }

    /// Channel currently owning a partition per the latest config
    pub fn channel_for_partition(&self, vbid: u16) -> Option<Arc<DcpChannel>> {
        let address = self.provider.config().master_for(vbid)?;
        self.channel_by_address(address)
    }

    pub(crate) fn channels_snapshot(&self) -> Vec<Arc<DcpChannel>> {
        self.channels
            .lock()
            .expect("channels lock")
            .values()
            .cloned()
            .collect()
    }

    pub(crate) fn remove_channel(&self, address: SocketAddr) -> Option<Arc<DcpChannel>> {
        self.channels
            .lock()
            .expect("channels lock")
            .remove(&address)
    }

    /// Tear the client down: poison the fixer, cancel waits, close
    /// channels. With `wait` the call joins the fixer and every channel.
    pub async fn disconnect(self: &Arc<Self>, wait: bool) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        tracing::info!("disconnecting client");
        if let Some(session) = self.session.get() {
            session.set_client_disconnected(true);
        }
        self.events.publish(SystemEvent::Disconnect);

        let channels: Vec<Arc<DcpChannel>> = {
            let mut map = self.channels.lock().expect("channels lock");
            map.drain().map(|(_, channel)| channel).collect()
        };
        for channel in channels {
            channel.disconnect(wait).await;
        }
        if wait {
            let task = self.fixer_task.lock().expect("fixer task").take();
            if let Some(task) = task {
                let _ = task.await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Streams
    // ------------------------------------------------------------------

    /// Open a stream for every selected partition from its stored state
    pub async fn start_streaming(self: &Arc<Self>) -> Result<()> {
        let session = self.session_state()?;
        let bucket_config = self.provider.config();
        let stream = session.default_stream();
        for vbid in self.selected_vbuckets(&bucket_config) {
            let partition = session.get(vbid);
            if partition.phase().is_active() {
                continue;
            }
            let request = partition.prepare_next_stream_request(&stream);
            self.start_stream_for_partition(&request)?;
        }
        Ok(())
    }

    /// Route a stream-open to the channel owning the partition
    ///
    /// A partition that is already streaming is left alone.
    pub fn start_stream_for_partition(&self, request: &StreamRequest) -> Result<()> {
        let session = self.session_state()?;
        let partition = session.get(request.vbid);
        if partition.phase().is_active() {
            tracing::debug!(vbid = request.vbid, "stream already open, ignoring");
            return Ok(());
        }
        let address = self
            .provider
            .config()
            .master_for(request.vbid)
            .ok_or(ClientError::NoMaster { vbid: request.vbid })?;
        let channel = self
            .channel_by_address(address)
            .ok_or(ClientError::NoChannel { address })?;
        channel.open_stream(request);
        Ok(())
    }

    /// Ask the owning channel to close a partition's stream
    pub fn request_stop_stream(&self, vbid: u16) -> Result<()> {
        let channel = self
            .channels_snapshot()
            .into_iter()
            .find(|channel| channel.stream_is_open(vbid))
            .ok_or_else(|| ClientError::InvalidState(format!("no open stream for vbucket {vbid}")))?;
        channel.close_stream(vbid)
    }

    /// Wait until the partition has fully disconnected
    pub async fn wait_for_stop(&self, vbid: u16, timeout: Duration) -> Result<()> {
        let session = self.session_state()?;
        session
            .get(vbid)
            .wait_for_phase(crate::state::PartitionPhase::Disconnected, timeout)
            .await
    }

    // ------------------------------------------------------------------
    // Metadata requests
    // ------------------------------------------------------------------

    pub fn request_failover_log(&self, vbid: u16) -> Result<()> {
        let session = self.session_state()?;
        match self.channel_for_partition(vbid) {
            Some(channel) => {
                channel.get_failover_log(vbid);
                Ok(())
            }
            None => {
                session
                    .get(vbid)
                    .failover_request_failed("no channel for partition");
                Err(ClientError::NoMaster { vbid })
            }
        }
    }

    /// Wait for the outstanding failover-log request and return the log
    pub async fn wait_for_failover_log(
        &self,
        vbid: u16,
        timeout: Duration,
    ) -> Result<Vec<FailoverEntry>> {
        let session = self.session_state()?;
        let partition = session.get(vbid);
        partition.wait_failover_updated(timeout).await?;
        Ok(partition.failover_log())
    }

    /// Sample remote seqnos on every channel and wait for all answers
    pub async fn get_seqnos(&self, timeout: Duration) -> Result<()> {
        let channels = self.channels_snapshot();
        for channel in &channels {
            channel.get_seqnos();
        }
        for channel in channels {
            let mut fetched = channel.state_fetched_watch();
            tokio::time::timeout(timeout, fetched.wait_for(|done| *done))
                .await
                .map_err(|_| ClientError::Timeout {
                    operation: "get seqnos",
                    elapsed: timeout,
                })?
                .map_err(|_| ClientError::Disconnected {
                    operation: "get seqnos",
                })?;
        }
        Ok(())
    }

    /// Fetch the collections manifest via the partition's channel
    pub async fn request_collections_manifest(
        &self,
        vbid: u16,
        timeout: Duration,
    ) -> Result<Bytes> {
        let channel = self
            .channel_for_partition(vbid)
            .ok_or(ClientError::NoMaster { vbid })?;
        channel.get_collections_manifest(timeout).await
    }
}

impl std::fmt::Debug for Conductor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conductor")
            .field("bucket", &self.config.bucket)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Streams derived from the collection filter configuration
fn streams_for(config: &ClientConfig) -> Vec<StreamState> {
    if config.cids.is_empty() {
        vec![StreamState::default()]
    } else {
        config
            .cids
            .iter()
            .enumerate()
            .map(|(index, cid)| StreamState {
                stream_id: index as u16,
                collection_id: Some(*cid),
            })
            .collect()
    }
}
