//! RTP listener: the receive loop that demuxes RTP from RTCP, updates
//! per-participant statistics, and feeds the jitter buffer.
//!
//! A `tokio::spawn`ed task blocking in `recv_timeout` so it can periodically
//! re-check `running` without a separate cancellation channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::jitter::{JitterBuffer, JitterPacket, SilenceFrameFn};
use crate::participant::ParticipantDatabase;
use crate::transport::{RecvOutcome, Transport};
use crate::wire::rtcp::is_rtcp;
use crate::wire::rtp::decode_rtp;

const RECV_TIMEOUT: Duration = Duration::from_millis(1000);
const RECV_BUF_SIZE: usize = 1500;

/// Per-remote jitter buffers, created lazily on first inbound RTP for an
/// SSRC, since a single jitter buffer only ever tracks one remote source.
pub struct JitterBufferTable {
    buffers: Mutex<HashMap<u32, JitterBuffer>>,
    capacity: usize,
    min_buffer_packages: usize,
    max_delay: Duration,
    silence_frame: Arc<dyn Fn() -> Vec<u8> + Send + Sync>,
}

impl JitterBufferTable {
    pub fn new(
        capacity: usize,
        min_buffer_packages: usize,
        max_delay: Duration,
        silence_frame: Arc<dyn Fn() -> Vec<u8> + Send + Sync>,
    ) -> Self {
        JitterBufferTable {
            buffers: Mutex::new(HashMap::new()),
            capacity,
            min_buffer_packages,
            max_delay,
            silence_frame,
        }
    }

    fn write(&self, ssrc: u32, payload_type: u8, packet: JitterPacket) -> crate::jitter::Status {
        let mut buffers = self.buffers.lock().unwrap();
        let silence_frame = self.silence_frame.clone();
        let factory: SilenceFrameFn = Box::new(move || silence_frame());
        let buffer = buffers.entry(ssrc).or_insert_with(|| {
            JitterBuffer::new(
                ssrc,
                payload_type,
                self.capacity,
                self.min_buffer_packages,
                self.max_delay,
                factory,
            )
        });
        buffer.write(packet)
    }

    /// Run `f` against the jitter buffer for `ssrc`, if one exists yet.
    pub fn with_buffer_mut<F, R>(&self, ssrc: u32, f: F) -> Option<R>
    where
        F: FnOnce(&mut JitterBuffer) -> R,
    {
        let mut buffers = self.buffers.lock().unwrap();
        buffers.get_mut(&ssrc).map(f)
    }

    pub fn remove(&self, ssrc: u32) {
        self.buffers.lock().unwrap().remove(&ssrc);
    }
}

pub struct RtpListener {
    transport: Arc<dyn Transport>,
    database: Arc<ParticipantDatabase>,
    jitter_buffers: Arc<JitterBufferTable>,
    clock_started_at: Instant,
}

impl RtpListener {
    pub fn new(
        transport: Arc<dyn Transport>,
        database: Arc<ParticipantDatabase>,
        jitter_buffers: Arc<JitterBufferTable>,
    ) -> Self {
        RtpListener {
            transport,
            database,
            jitter_buffers,
            clock_started_at: Instant::now(),
        }
    }

    /// Receive loop. Returns when `running` is cleared or the transport
    /// reports an invalid socket.
    pub async fn run(&self, running: Arc<AtomicBool>) {
        let mut buf = vec![0u8; RECV_BUF_SIZE];
        tracing::info!("RTP listener started");
        while running.load(Ordering::Relaxed) {
            match self.transport.recv_timeout(&mut buf, RECV_TIMEOUT).await {
                Ok(RecvOutcome::Timeout) => continue,
                Ok(RecvOutcome::InvalidSocket) => {
                    tracing::info!("RTP transport closed, listener exiting");
                    break;
                }
                Ok(RecvOutcome::Received(n)) => self.handle_datagram(&buf[..n]),
                Err(e) => {
                    tracing::warn!("RTP receive error: {}", e);
                    break;
                }
            }
        }
    }

    fn handle_datagram(&self, data: &[u8]) {
        if is_rtcp(data) {
            // RTCP shares demux only for deciding which side handles a
            // datagram; the RTCP handler owns its own socket/thread.
            return;
        }

        let (header, range) = match decode_rtp(data) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::debug!("dropping unparseable RTP datagram: {}", e);
                return;
            }
        };

        let recv_ts = self.clock_started_at.elapsed().as_millis() as u32;
        let sent_ts = header.timestamp;
        let ssrc = header.ssrc;
        let payload_type = header.payload_type;
        let seq = header.sequence_number;

        self.database.with_remote_mut(ssrc, |record| {
            record.last_seen = Instant::now();
            record.packets_received += 1;
            record.observe_sequence(seq);
            record.update_jitter(sent_ts, recv_ts);
        });

        let payload = data[range].to_vec();
        let status = self.jitter_buffers.write(ssrc, payload_type, JitterPacket { header, payload });
        if status == crate::jitter::Status::InputOverflow {
            tracing::debug!("jitter buffer overflow for ssrc {:#010x}, dropping packet", ssrc);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use crate::wire::rtp::{encode_rtp, RtpHeader};

    fn make_table() -> Arc<JitterBufferTable> {
        Arc::new(JitterBufferTable::new(
            8,
            1,
            Duration::from_millis(200),
            Arc::new(|| vec![0xFF]),
        ))
    }

    #[tokio::test]
    async fn inbound_rtp_updates_participant_and_jitter_buffer() {
        let transport = Arc::new(MockTransport::new());
        let database = Arc::new(ParticipantDatabase::new(1, 0));
        let jitter_buffers = make_table();
        let listener = RtpListener::new(transport.clone(), database.clone(), jitter_buffers.clone());

        let header = RtpHeader::new(0, 5, 800, 0xAABB_CCDD);
        let packet = encode_rtp(&header, &[9, 9, 9], 1500).unwrap();
        listener.handle_datagram(&packet);

        assert!(database.is_in_database(0xAABB_CCDD));
        let remotes = database.get_all_remote();
        assert_eq!(remotes[0].1.packets_received, 1);

        let size = jitter_buffers
            .with_buffer_mut(0xAABB_CCDD, |jb| jb.size())
            .unwrap();
        assert_eq!(size, 1);
    }

    #[tokio::test]
    async fn rtcp_datagrams_are_not_handed_to_jitter_buffer() {
        let transport = Arc::new(MockTransport::new());
        let database = Arc::new(ParticipantDatabase::new(1, 0));
        let jitter_buffers = make_table();
        let listener = RtpListener::new(transport, database.clone(), jitter_buffers.clone());

        let rtcp_like = [0x80u8, 200, 0, 6, 0, 0, 0, 0, 0, 0, 0, 0];
        listener.handle_datagram(&rtcp_like);

        assert_eq!(database.remote_count(), 0);
    }

    #[tokio::test]
    async fn malformed_rtp_is_dropped_without_panicking() {
        let transport = Arc::new(MockTransport::new());
        let database = Arc::new(ParticipantDatabase::new(1, 0));
        let jitter_buffers = make_table();
        let listener = RtpListener::new(transport, database.clone(), jitter_buffers);

        listener.handle_datagram(&[0x40, 0, 0]);
        assert_eq!(database.remote_count(), 0);
    }
}
