//! RTP sender: packetizes outgoing audio frames.
//!
//! Sequence number and timestamp wrap on overflow; per-packet counters are
//! only bumped on a successful send. Payload and clock rate are supplied by
//! whichever codec is plugged in, not fixed to one format.

use std::sync::Arc;
use std::time::Instant;

use crate::error::CoreError;
use crate::participant::ParticipantDatabase;
use crate::transport::Transport;
use crate::wire::rtp::{encode_rtp, RtpHeader};

/// Default RTP clock rate used when the codec does not specify one.
pub const DEFAULT_CLOCK_RATE_HZ: u32 = 1000;

pub struct RtpSender {
    ssrc: u32,
    payload_type: u8,
    clock_rate_hz: u32,
    seq: u16,
    initial_rtp_timestamp: u32,
    started_at: Instant,
}

impl RtpSender {
    pub fn new(ssrc: u32, payload_type: u8, initial_rtp_timestamp: u32, initial_seq: u16) -> Self {
        RtpSender {
            ssrc,
            payload_type,
            clock_rate_hz: DEFAULT_CLOCK_RATE_HZ,
            seq: initial_seq,
            initial_rtp_timestamp,
            started_at: Instant::now(),
        }
    }

    pub fn with_clock_rate(mut self, clock_rate_hz: u32) -> Self {
        self.clock_rate_hz = clock_rate_hz;
        self
    }

    fn current_timestamp(&self) -> u32 {
        let elapsed_ms = self.started_at.elapsed().as_millis() as u64;
        let ticks = elapsed_ms * self.clock_rate_hz as u64 / 1000;
        self.initial_rtp_timestamp.wrapping_add(ticks as u32)
    }

    /// Send one encoded audio frame. `marker` is set by the caller on the
    /// first packet after a silent interval (voice-activity detection lives
    /// in the audio boundary, not here).
    pub async fn send_frame(
        &mut self,
        transport: &dyn Transport,
        database: &ParticipantDatabase,
        payload: &[u8],
        marker: bool,
        mtu: usize,
    ) -> Result<(), CoreError> {
        let mut header = RtpHeader::new(self.payload_type, self.seq, self.current_timestamp(), self.ssrc);
        header.marker = marker;

        let packet = encode_rtp(&header, payload, mtu)?;
        transport.send(&packet).await?;
        database.record_self_sent(payload.len() as u32);
        self.seq = self.seq.wrapping_add(1);
        Ok(())
    }
}

/// Shared handle so the audio-capture driver and the session orchestrator
/// can both reach the sender without a second mutable borrow path.
pub type SharedRtpSender = Arc<tokio::sync::Mutex<RtpSender>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use crate::wire::rtp::decode_rtp;

    #[tokio::test]
    async fn send_frame_increments_sequence_and_counters() {
        let transport = MockTransport::new();
        let database = ParticipantDatabase::new(0x1, 0);
        let mut sender = RtpSender::new(0x1, 0, 1000, 42);

        sender
            .send_frame(&transport, &database, &[1, 2, 3], true, 1500)
            .await
            .unwrap();
        sender
            .send_frame(&transport, &database, &[4, 5, 6], false, 1500)
            .await
            .unwrap();

        let sent = transport.sent_datagrams().await;
        assert_eq!(sent.len(), 2);

        let (h0, _) = decode_rtp(&sent[0]).unwrap();
        assert_eq!(h0.sequence_number, 42);
        assert!(h0.marker);

        let (h1, _) = decode_rtp(&sent[1]).unwrap();
        assert_eq!(h1.sequence_number, 43);
        assert!(!h1.marker);

        assert_eq!(database.self_total_packets(), 2);
        assert_eq!(database.self_total_bytes(), 6);
    }

    #[tokio::test]
    async fn sequence_wraps_past_65535() {
        let transport = MockTransport::new();
        let database = ParticipantDatabase::new(0x1, 0);
        let mut sender = RtpSender::new(0x1, 0, 0, 65535);

        sender.send_frame(&transport, &database, &[0], false, 1500).await.unwrap();
        sender.send_frame(&transport, &database, &[0], false, 1500).await.unwrap();

        let sent = transport.sent_datagrams().await;
        let (h0, _) = decode_rtp(&sent[0]).unwrap();
        let (h1, _) = decode_rtp(&sent[1]).unwrap();
        assert_eq!(h0.sequence_number, 65535);
        assert_eq!(h1.sequence_number, 0);
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected_and_not_counted() {
        let transport = MockTransport::new();
        let database = ParticipantDatabase::new(0x1, 0);
        let mut sender = RtpSender::new(0x1, 0, 0, 0);

        let big_payload = vec![0u8; 2000];
        let err = sender
            .send_frame(&transport, &database, &big_payload, false, 1500)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::OversizedPayload { .. }));
        assert_eq!(database.self_total_packets(), 0);
    }
}
