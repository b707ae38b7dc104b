//! Session orchestrator: owns the participant database and wires the wire
//! codec, jitter buffer, sender, listener and RTCP handler together, the
//! way an owning struct holds a socket and its send/recv task handles.
//! Ownership flows one way, session -> everything else, with the observer
//! list on the participant database as the only feedback path.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::config::SdesConfig;
use crate::error::CoreError;
use crate::jitter::{JitterPacket, Status as JitterStatus};
use crate::listener::{JitterBufferTable, RtpListener};
use crate::participant::{ParticipantDatabase, ParticipantObserver};
use crate::rtcp_handler::RtcpHandler;
use crate::sender::RtpSender;
use crate::transport::Transport;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub self_ssrc: u32,
    pub initial_rtp_timestamp: u32,
    pub payload_type: u8,
    pub initial_seq: u16,
    pub mtu: usize,
    pub jitter_capacity: usize,
    pub jitter_min_buffer_packages: usize,
    pub jitter_max_delay: Duration,
    pub shutdown_on_last_remote: bool,
    /// Whether this side sends audio and therefore reports via SR rather
    /// than RR. Fixed for the lifetime of the session, not inferred from
    /// whether a first frame has gone out yet.
    pub is_active_sender: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            self_ssrc: random_ssrc(),
            initial_rtp_timestamp: random_ssrc(),
            payload_type: 0,
            initial_seq: (random_ssrc() & 0xFFFF) as u16,
            mtu: 1500,
            jitter_capacity: 64,
            jitter_min_buffer_packages: 3,
            jitter_max_delay: Duration::from_millis(200),
            shutdown_on_last_remote: true,
            is_active_sender: true,
        }
    }
}

/// 32 bits drawn from a UUIDv4, a quick way to mint an SSRC without pulling
/// in a `rand` dependency.
fn random_ssrc() -> u32 {
    let id = uuid::Uuid::new_v4();
    let bytes = id.as_bytes();
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

pub struct Session {
    config: SessionConfig,
    rtp_transport: Arc<dyn Transport>,
    database: Arc<ParticipantDatabase>,
    jitter_buffers: Arc<JitterBufferTable>,
    sender: AsyncMutex<RtpSender>,
    listener: Arc<RtpListener>,
    rtcp_handler: Arc<RtcpHandler>,
    running: Arc<AtomicBool>,
    session_packets_lost: AtomicU32,
    listener_handle: Option<JoinHandle<()>>,
    rtcp_handle: Option<JoinHandle<()>>,
}

impl Session {
    pub fn new(
        rtp_transport: Arc<dyn Transport>,
        rtcp_transport: Arc<dyn Transport>,
        sdes_config: Arc<dyn SdesConfig>,
        silence_frame: Arc<dyn Fn() -> Vec<u8> + Send + Sync>,
        config: SessionConfig,
    ) -> Self {
        let database = Arc::new(ParticipantDatabase::new(config.self_ssrc, config.initial_rtp_timestamp));
        let jitter_buffers = Arc::new(JitterBufferTable::new(
            config.jitter_capacity,
            config.jitter_min_buffer_packages,
            config.jitter_max_delay,
            silence_frame,
        ));
        let sender = AsyncMutex::new(RtpSender::new(
            config.self_ssrc,
            config.payload_type,
            config.initial_rtp_timestamp,
            config.initial_seq,
        ));
        let listener = Arc::new(RtpListener::new(
            rtp_transport.clone(),
            database.clone(),
            jitter_buffers.clone(),
        ));
        let rtcp_handler = Arc::new(RtcpHandler::new(
            rtcp_transport,
            database.clone(),
            sdes_config,
            config.shutdown_on_last_remote,
            config.is_active_sender,
        ));

        Session {
            config,
            rtp_transport,
            database,
            jitter_buffers,
            sender,
            listener,
            rtcp_handler,
            running: Arc::new(AtomicBool::new(false)),
            session_packets_lost: AtomicU32::new(0),
            listener_handle: None,
            rtcp_handle: None,
        }
    }

    pub fn database(&self) -> &Arc<ParticipantDatabase> {
        &self.database
    }

    pub fn session_packets_lost(&self) -> u32 {
        self.session_packets_lost.load(Ordering::Relaxed)
    }

    pub fn register_listener(&self, observer: Arc<dyn ParticipantObserver>) {
        self.database.register_listener(observer);
    }

    /// Spawn the listener and RTCP handler tasks. Idempotent only once per
    /// session: calling `start` twice leaks the first pair of tasks.
    pub fn start(&mut self) {
        self.running.store(true, Ordering::Relaxed);

        let listener = self.listener.clone();
        let running = self.running.clone();
        self.listener_handle = Some(tokio::spawn(async move {
            listener.run(running).await;
        }));

        let rtcp_handler = self.rtcp_handler.clone();
        let running = self.running.clone();
        self.rtcp_handle = Some(tokio::spawn(async move {
            rtcp_handler.run(running).await;
        }));

        tracing::info!("session started (ssrc {:#010x})", self.config.self_ssrc);
    }

    pub async fn send_audio_frame(&self, payload: &[u8], marker: bool) -> Result<(), CoreError> {
        let mut sender = self.sender.lock().await;
        sender
            .send_frame(&*self.rtp_transport, &self.database, payload, marker, self.config.mtu)
            .await
    }

    /// Pull the next playable (or concealment) frame for `ssrc`. Returns
    /// `None` if no jitter buffer has been created for that SSRC yet (no
    /// RTP has arrived from it).
    pub fn read_audio_frame(&self, ssrc: u32) -> Option<(JitterStatus, JitterPacket)> {
        let outcome = self
            .jitter_buffers
            .with_buffer_mut(ssrc, |jb| (jb.read(), jb.last_loss_delta()))?;
        let ((status, packet), delta) = outcome;
        if delta > 0 {
            self.database.with_remote_mut(ssrc, |record| {
                record.packets_lost = record.packets_lost.saturating_add(delta);
            });
            self.session_packets_lost.fetch_add(delta, Ordering::Relaxed);
        }
        Some((status, packet))
    }

    pub async fn shutdown(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        self.rtcp_handler.shutdown("Program exit").await;
        self.rtp_transport.close();

        if let Some(h) = self.listener_handle.take() {
            h.abort();
            let _ = h.await;
        }
        if let Some(h) = self.rtcp_handle.take() {
            h.abort();
            let _ = h.await;
        }
        tracing::info!("session shut down");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(h) = self.listener_handle.take() {
            h.abort();
        }
        if let Some(h) = self.rtcp_handle.take() {
            h.abort();
        }
    }
}
