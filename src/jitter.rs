//! Jitter buffer: a sequence-ordered ring buffer of RTP packets for exactly
//! one remote SSRC, with playout-delay adaptation and loss concealment.

use std::time::{Duration, Instant};

use crate::wire::rtp::RtpHeader;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    InputOverflow,
    OutputUnderflow,
}

#[derive(Debug, Clone)]
pub struct JitterPacket {
    pub header: RtpHeader,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FillState {
    Filling,
    Playing,
}

struct Slot {
    valid: bool,
    header: RtpHeader,
    payload: Vec<u8>,
    reception_time: Instant,
}

impl Slot {
    fn empty() -> Self {
        Slot {
            valid: false,
            header: RtpHeader::new(0, 0, 0, 0),
            payload: Vec::new(),
            reception_time: Instant::now(),
        }
    }
}

/// Injected canonical "silence" payload, supplied by the owning codec
/// rather than hardcoded here, so the buffer never needs to know which
/// codec it's concealing for.
pub type SilenceFrameFn = Box<dyn Fn() -> Vec<u8> + Send>;

pub struct JitterBuffer {
    ssrc: u32,
    payload_type: u8,
    slots: Vec<Slot>,
    next_read_index: usize,
    size: usize,
    min_seq: u16,
    min_seq_initialized: bool,
    min_buffer_packages: usize,
    max_delay: Duration,
    state: FillState,
    suppress_next_advance: bool,
    /// Sequence-number gap accounted for on the most recent `Ok` read,
    /// for the caller to add to the remote's and session's loss counters.
    last_loss_delta: u32,
    silence_frame: SilenceFrameFn,
}

impl JitterBuffer {
    pub fn new(
        ssrc: u32,
        payload_type: u8,
        capacity: usize,
        min_buffer_packages: usize,
        max_delay: Duration,
        silence_frame: SilenceFrameFn,
    ) -> Self {
        assert!(capacity > 0, "jitter buffer capacity must be positive");
        JitterBuffer {
            ssrc,
            payload_type,
            slots: (0..capacity).map(|_| Slot::empty()).collect(),
            next_read_index: 0,
            size: 0,
            min_seq: 0,
            min_seq_initialized: false,
            min_buffer_packages,
            max_delay,
            state: FillState::Filling,
            suppress_next_advance: true,
            last_loss_delta: 0,
            silence_frame,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Sequence-number gap accounted for by the last successful `read`.
    pub fn last_loss_delta(&self) -> u32 {
        self.last_loss_delta
    }

    fn make_concealment(&self, seq: u16) -> JitterPacket {
        JitterPacket {
            header: RtpHeader::new(self.payload_type, seq, 0, self.ssrc),
            payload: (self.silence_frame)(),
        }
    }

    pub fn write(&mut self, packet: JitterPacket) -> Status {
        let seq = packet.header.sequence_number;
        let n = self.slots.len() as u16;

        if !self.min_seq_initialized {
            self.min_seq = seq;
            self.min_seq_initialized = true;
        } else if packet.header.marker {
            // Marker bit after a silent period: start a fresh window.
            self.min_seq = seq;
        }

        let wrap_danger = self.min_seq >= u16::MAX.wrapping_sub(n);
        if !wrap_danger && seq < self.min_seq {
            // Late-loss packet: playout has already moved past this seq.
            return Status::Ok;
        }

        let delta = seq.wrapping_sub(self.min_seq);
        if delta as usize >= self.slots.len() {
            return Status::InputOverflow;
        }
        if self.size >= self.slots.len() {
            return Status::InputOverflow;
        }

        let idx = (self.next_read_index + delta as usize) % self.slots.len();
        let slot = &mut self.slots[idx];
        let was_valid = slot.valid;
        slot.payload.clear();
        if slot.payload.capacity() < packet.payload.len() {
            slot.payload.reserve(packet.payload.len() - slot.payload.capacity());
        }
        slot.payload.extend_from_slice(&packet.payload);
        slot.header = packet.header;
        slot.reception_time = Instant::now();
        slot.valid = true;
        if !was_valid {
            self.size += 1;
        }
        Status::Ok
    }

    pub fn read(&mut self) -> (Status, JitterPacket) {
        self.last_loss_delta = 0;

        if self.state == FillState::Filling {
            if self.size < self.min_buffer_packages {
                let concealment = self.make_concealment(self.min_seq);
                return (Status::OutputUnderflow, concealment);
            }
            self.state = FillState::Playing;
        }

        let n = self.slots.len();
        for i in 0..n {
            let idx = (self.next_read_index + i) % n;
            if !self.slots[idx].valid {
                continue;
            }
            if self.slots[idx].reception_time.elapsed() > self.max_delay {
                self.slots[idx].valid = false;
                self.size -= 1;
                continue;
            }

            let seq = self.slots[idx].header.sequence_number;
            let header = self.slots[idx].header.clone();
            let payload = std::mem::take(&mut self.slots[idx].payload);
            self.slots[idx].valid = false;
            self.size -= 1;
            self.next_read_index = (idx + 1) % n;

            let skipped = seq.wrapping_sub(self.min_seq) as u32;
            self.last_loss_delta = skipped;
            self.min_seq = seq.wrapping_add(1);
            self.suppress_next_advance = true;

            return (Status::Ok, JitterPacket { header, payload });
        }

        // Nothing usable anywhere in the ring: conceal and re-enter filling.
        let concealment = self.make_concealment(self.min_seq);
        if self.suppress_next_advance {
            self.suppress_next_advance = false;
        } else {
            self.min_seq = self.min_seq.wrapping_add(1);
        }
        self.state = FillState::Filling;
        (Status::OutputUnderflow, concealment)
    }

    /// Walk the ring backwards for a still-valid slot matching `seq`,
    /// without invalidating it. Used for limited retransmission.
    pub fn repeat_last(&self, seq: u16) -> Option<JitterPacket> {
        let n = self.slots.len();
        for i in 0..n {
            let idx = (self.next_read_index + n - 1 - i) % n;
            let slot = &self.slots[idx];
            if slot.valid && slot.header.sequence_number == seq {
                return Some(JitterPacket {
                    header: slot.header.clone(),
                    payload: slot.payload.clone(),
                });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkt(seq: u16, marker: bool) -> JitterPacket {
        let mut header = RtpHeader::new(0, seq, seq as u32 * 160, 1);
        header.marker = marker;
        JitterPacket {
            header,
            payload: vec![seq as u8],
        }
    }

    fn buf(capacity: usize, min_fill: usize) -> JitterBuffer {
        JitterBuffer::new(1, 0, capacity, min_fill, Duration::from_millis(200), Box::new(|| vec![0xFF]))
    }

    #[test]
    fn out_of_order_packets_are_replayed_in_sequence() {
        let mut b = buf(8, 3);
        assert_eq!(b.write(pkt(101, true)), Status::Ok);
        assert_eq!(b.write(pkt(103, false)), Status::Ok);
        assert_eq!(b.write(pkt(102, false)), Status::Ok);
        assert_eq!(b.write(pkt(104, false)), Status::Ok);

        let mut seqs = Vec::new();
        for _ in 0..4 {
            let (status, p) = b.read();
            if status == Status::Ok {
                seqs.push(p.header.sequence_number);
            }
        }
        assert_eq!(seqs, vec![101, 102, 103, 104]);
    }

    #[test]
    fn loss_concealment_and_counter() {
        let mut b = buf(8, 1);
        b.write(pkt(200, true));
        b.write(pkt(202, false));
        b.write(pkt(203, false));

        // 201 never arrives; read() folds the whole gap into the single
        // read that lands on the next valid slot rather than emitting one
        // concealment packet per missing sequence number.
        let (s0, p0) = b.read();
        assert_eq!(s0, Status::Ok);
        assert_eq!(p0.header.sequence_number, 200);
        assert_eq!(b.last_loss_delta(), 0);

        let (s1, p1) = b.read();
        assert_eq!(s1, Status::Ok);
        assert_eq!(p1.header.sequence_number, 202);
        assert_eq!(b.last_loss_delta(), 1);

        let (s2, p2) = b.read();
        assert_eq!(s2, Status::Ok);
        assert_eq!(p2.header.sequence_number, 203);
        assert_eq!(b.last_loss_delta(), 0);

        let (s3, _) = b.read();
        assert_eq!(s3, Status::OutputUnderflow);
    }

    #[test]
    fn overflow_at_capacity() {
        let mut b = buf(4, 10); // high fill target so we purely test write()
        assert_eq!(b.write(pkt(10, true)), Status::Ok);
        assert_eq!(b.write(pkt(11, false)), Status::Ok);
        assert_eq!(b.write(pkt(12, false)), Status::Ok);
        assert_eq!(b.write(pkt(13, false)), Status::Ok);
        assert_eq!(b.write(pkt(14, false)), Status::InputOverflow);
    }

    #[test]
    fn late_packet_is_dropped_silently() {
        let mut b = buf(8, 1);
        b.write(pkt(50, true));
        let (status, first) = b.read();
        assert_eq!(status, Status::Ok);
        assert_eq!(first.header.sequence_number, 50);

        // min_seq is now 51; a packet for 49 is late.
        assert_eq!(b.write(pkt(49, false)), Status::Ok);
        assert_eq!(b.size(), 0);
    }

    #[test]
    fn marker_after_silence_resets_min_seq() {
        let mut b = buf(8, 1);
        b.write(pkt(10, true));
        let _ = b.read();
        // New talkspurt begins far ahead; marker bit resets the window.
        assert_eq!(b.write(pkt(500, true)), Status::Ok);
        let (status, p) = b.read();
        assert_eq!(status, Status::Ok);
        assert_eq!(p.header.sequence_number, 500);
    }

    #[test]
    fn sequence_wrap_adjacent_slots() {
        let mut b = buf(8, 2);
        assert_eq!(b.write(pkt(65535, true)), Status::Ok);
        assert_eq!(b.write(pkt(0, false)), Status::Ok);
        let (s0, p0) = b.read();
        assert_eq!(s0, Status::Ok);
        assert_eq!(p0.header.sequence_number, 65535);
        let (s1, p1) = b.read();
        assert_eq!(s1, Status::Ok);
        assert_eq!(p1.header.sequence_number, 0);
    }

    #[test]
    fn repeat_last_returns_without_invalidating() {
        let mut b = buf(8, 10);
        b.write(pkt(5, true));
        let first = b.repeat_last(5).unwrap();
        assert_eq!(first.header.sequence_number, 5);
        let second = b.repeat_last(5).unwrap();
        assert_eq!(second.header.sequence_number, 5);
        assert!(b.repeat_last(6).is_none());
    }

    #[test]
    fn underflow_before_any_write_does_not_panic_or_advance() {
        let mut b = buf(4, 1);
        let (status, _) = b.read();
        assert_eq!(status, Status::OutputUnderflow);
        assert_eq!(b.size(), 0);
    }
}
