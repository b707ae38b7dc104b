//! Participant database: shared per-SSRC state coupling the wire codec,
//! the jitter buffer and the RTCP reporter.
//!
//! Session-scoped rather than a process-wide singleton: owned by `Session`
//! and handed to the sender, listener and RTCP handler at construction,
//! which keeps lifecycle local and allows more than one session to exist
//! in a process (e.g. in tests).
//! Observer notifications are delivered by value (SSRC) rather than by
//! pointer, so there's no back-reference from record to database to keep
//! alive.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// RTCP-derived state for a remote participant.
#[derive(Debug, Clone, Default)]
pub struct RtcpData {
    pub last_sr_timestamp: Option<Instant>,
    pub last_sr_middle_ntp: u32,
    pub sdes_items: HashMap<u8, String>,
}

/// Bookkeeping needed to compute fraction-lost for the *next* RTCP report,
/// reset each time a report is built for this remote (RFC 3550 §6.4.1).
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportPrior {
    pub expected_prior: u32,
    pub received_prior: u32,
}

#[derive(Debug, Clone)]
pub struct ParticipantRecord {
    pub ssrc: u32,
    pub is_self: bool,
    pub initial_rtp_timestamp: u32,
    pub packets_lost: u32,
    pub packets_received: u32,
    pub extended_highest_seq: u32,
    pub interarrival_jitter: f32,
    pub last_seen: Instant,
    pub rtcp_data: Option<RtcpData>,
    pub report_prior: ReportPrior,
    /// RFC 3550 §6.4.1 running state: previous transit time and cycle count.
    pub(crate) prev_transit: i64,
    pub(crate) seq_cycles: u16,
    pub(crate) highest_seq_seen: u16,
    pub(crate) seq_initialized: bool,
}

impl ParticipantRecord {
    fn new_remote(ssrc: u32, now: Instant) -> Self {
        ParticipantRecord {
            ssrc,
            is_self: false,
            initial_rtp_timestamp: 0,
            packets_lost: 0,
            packets_received: 0,
            extended_highest_seq: 0,
            interarrival_jitter: 0.0,
            last_seen: now,
            rtcp_data: Some(RtcpData::default()),
            report_prior: ReportPrior::default(),
            prev_transit: 0,
            seq_cycles: 0,
            highest_seq_seen: 0,
            seq_initialized: false,
        }
    }

    fn new_self(ssrc: u32, initial_rtp_timestamp: u32, now: Instant) -> Self {
        ParticipantRecord {
            ssrc,
            is_self: true,
            initial_rtp_timestamp,
            packets_lost: 0,
            packets_received: 0,
            extended_highest_seq: 0,
            interarrival_jitter: 0.0,
            last_seen: now,
            rtcp_data: Some(RtcpData::default()),
            report_prior: ReportPrior::default(),
            prev_transit: 0,
            seq_cycles: 0,
            highest_seq_seen: 0,
            seq_initialized: false,
        }
    }

    /// Fraction lost since the last report built for this remote, in
    /// units of 1/256, saturating at [0, 255]. Zero when nothing was lost.
    pub fn fraction_lost_and_advance(&mut self) -> u8 {
        let expected = self.extended_highest_seq.wrapping_sub(self.report_prior.expected_prior);
        let received = self
            .packets_received
            .wrapping_sub(self.report_prior.received_prior);
        let lost = expected.saturating_sub(received);
        let fraction = if expected == 0 {
            0
        } else {
            ((lost as u64 * 256) / expected as u64).min(255) as u8
        };
        self.report_prior.expected_prior = self.extended_highest_seq;
        self.report_prior.received_prior = self.packets_received;
        fraction
    }

    /// Update the extended highest sequence number and detect 16-bit wrap.
    pub fn observe_sequence(&mut self, seq: u16) {
        if !self.seq_initialized {
            self.highest_seq_seen = seq;
            self.seq_initialized = true;
        } else {
            let delta = seq as i32 - self.highest_seq_seen as i32;
            if delta < -(1 << 15) {
                // seq wrapped past 65535 -> 0.
                self.seq_cycles = self.seq_cycles.wrapping_add(1);
                self.highest_seq_seen = seq;
            } else if delta > 0 {
                self.highest_seq_seen = seq;
            }
            // delta in (-32768, 0]: a reordered/late packet within the
            // current cycle -- does not advance the highest seen.
        }
        self.extended_highest_seq = ((self.seq_cycles as u32) << 16) | self.highest_seq_seen as u32;
    }

    /// RFC 3550 §6.4.1 interarrival jitter update.
    pub fn update_jitter(&mut self, sent: u32, recv: u32) {
        let transit = recv as i64 - sent as i64;
        if self.packets_received > 0 {
            let d = (transit - self.prev_transit).unsigned_abs() as f32;
            self.interarrival_jitter += (d - self.interarrival_jitter) / 16.0;
        }
        self.prev_transit = transit;
    }
}

pub trait ParticipantObserver: Send + Sync {
    fn on_remote_added(&self, ssrc: u32);
    fn on_remote_removed(&self, ssrc: u32);
}

struct Inner {
    remotes: HashMap<u32, ParticipantRecord>,
    listeners: Vec<Arc<dyn ParticipantObserver>>,
}

/// Session-scoped SSRC -> ParticipantRecord map with a distinguished self
/// entry. All mutation goes through the single mutex guarding `remotes`;
/// `self`'s send counters are atomics so the RTCP thread can read them
/// without contending with the sender thread.
pub struct ParticipantDatabase {
    self_ssrc: u32,
    self_initial_rtp_timestamp: u32,
    self_started_at: Instant,
    total_packets: AtomicU32,
    total_bytes: AtomicU32,
    inner: Mutex<Inner>,
}

impl ParticipantDatabase {
    pub fn new(self_ssrc: u32, initial_rtp_timestamp: u32) -> Self {
        ParticipantDatabase {
            self_ssrc,
            self_initial_rtp_timestamp: initial_rtp_timestamp,
            self_started_at: Instant::now(),
            total_packets: AtomicU32::new(0),
            total_bytes: AtomicU32::new(0),
            inner: Mutex::new(Inner {
                remotes: HashMap::new(),
                listeners: Vec::new(),
            }),
        }
    }

    pub fn self_ssrc(&self) -> u32 {
        self.self_ssrc
    }

    /// Snapshot of the self participant record (infallible: self always
    /// exists from session start to end).
    pub fn self_record(&self) -> ParticipantRecord {
        let mut record = ParticipantRecord::new_self(
            self.self_ssrc,
            self.self_initial_rtp_timestamp,
            self.self_started_at,
        );
        record.packets_lost = 0;
        record
    }

    pub fn self_total_packets(&self) -> u32 {
        self.total_packets.load(Ordering::Relaxed)
    }

    pub fn self_total_bytes(&self) -> u32 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    pub fn record_self_sent(&self, payload_len: u32) {
        self.total_packets.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(payload_len, Ordering::Relaxed);
    }

    /// Run `f` against the existing remote record for `ssrc`, creating it
    /// (and notifying observers) if this is the first time it's seen.
    pub fn with_remote_mut<F, R>(&self, ssrc: u32, f: F) -> R
    where
        F: FnOnce(&mut ParticipantRecord) -> R,
    {
        let mut inner = self.inner.lock().unwrap();
        let is_new = !inner.remotes.contains_key(&ssrc);
        let now = Instant::now();
        let record = inner
            .remotes
            .entry(ssrc)
            .or_insert_with(|| ParticipantRecord::new_remote(ssrc, now));
        let result = f(record);
        if is_new {
            for listener in inner.listeners.clone() {
                listener.on_remote_added(ssrc);
            }
        }
        result
    }

    /// Read-only snapshot of all remotes, taken under the mutex and
    /// released before the caller performs any I/O.
    pub fn get_all_remote(&self) -> Vec<(u32, ParticipantRecord)> {
        let inner = self.inner.lock().unwrap();
        inner
            .remotes
            .iter()
            .map(|(ssrc, record)| (*ssrc, record.clone()))
            .collect()
    }

    pub fn remove(&self, ssrc: u32) {
        let mut inner = self.inner.lock().unwrap();
        if inner.remotes.remove(&ssrc).is_some() {
            for listener in inner.listeners.clone() {
                listener.on_remote_removed(ssrc);
            }
        }
    }

    pub fn is_in_database(&self, ssrc: u32) -> bool {
        self.inner.lock().unwrap().remotes.contains_key(&ssrc)
    }

    pub fn remote_count(&self) -> usize {
        self.inner.lock().unwrap().remotes.len()
    }

    pub fn register_listener(&self, listener: Arc<dyn ParticipantObserver>) {
        self.inner.lock().unwrap().listeners.push(listener);
    }

    pub fn unregister_listener(&self, listener: &Arc<dyn ParticipantObserver>) {
        let mut inner = self.inner.lock().unwrap();
        inner.listeners.retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Remove every remote whose `last_seen` predates `now - timeout`.
    /// Returns the SSRCs removed, for the caller to log/BYE.
    pub fn sweep_timed_out(&self, timeout: std::time::Duration) -> Vec<u32> {
        let now = Instant::now();
        let mut removed = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            let stale: Vec<u32> = inner
                .remotes
                .iter()
                .filter(|(_, r)| now.duration_since(r.last_seen) > timeout)
                .map(|(ssrc, _)| *ssrc)
                .collect();
            for ssrc in stale {
                inner.remotes.remove(&ssrc);
                removed.push(ssrc);
            }
        }
        if !removed.is_empty() {
            let inner = self.inner.lock().unwrap();
            for ssrc in &removed {
                for listener in &inner.listeners {
                    listener.on_remote_removed(*ssrc);
                }
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingObserver {
        added: AtomicUsize,
        removed: AtomicUsize,
    }

    impl ParticipantObserver for CountingObserver {
        fn on_remote_added(&self, _ssrc: u32) {
            self.added.fetch_add(1, Ordering::SeqCst);
        }
        fn on_remote_removed(&self, _ssrc: u32) {
            self.removed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn self_is_always_present() {
        let db = ParticipantDatabase::new(1, 0);
        let record = db.self_record();
        assert!(record.is_self);
        assert_eq!(record.ssrc, 1);
    }

    #[test]
    fn remote_created_on_first_touch_and_notifies() {
        let db = ParticipantDatabase::new(1, 0);
        let observer = Arc::new(CountingObserver {
            added: AtomicUsize::new(0),
            removed: AtomicUsize::new(0),
        });
        db.register_listener(observer.clone());

        assert!(!db.is_in_database(42));
        db.with_remote_mut(42, |r| r.packets_received += 1);
        assert!(db.is_in_database(42));
        assert_eq!(observer.added.load(Ordering::SeqCst), 1);

        // Second touch must not re-create / re-notify.
        db.with_remote_mut(42, |r| r.packets_received += 1);
        assert_eq!(observer.added.load(Ordering::SeqCst), 1);

        db.remove(42);
        assert!(!db.is_in_database(42));
        assert_eq!(observer.removed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fraction_lost_zero_when_nothing_lost() {
        let mut record = ParticipantRecord::new_remote(1, Instant::now());
        record.extended_highest_seq = 10;
        record.packets_received = 10;
        assert_eq!(record.fraction_lost_and_advance(), 0);
    }

    #[test]
    fn fraction_lost_in_range_when_some_lost() {
        let mut record = ParticipantRecord::new_remote(1, Instant::now());
        record.extended_highest_seq = 10;
        record.packets_received = 5;
        let fraction = record.fraction_lost_and_advance();
        assert!(fraction > 0 && fraction <= 255);
    }

    #[test]
    fn at_most_one_participant_per_ssrc() {
        let db = ParticipantDatabase::new(1, 0);
        db.with_remote_mut(7, |_| {});
        db.with_remote_mut(7, |_| {});
        assert_eq!(db.remote_count(), 1);
    }

    #[test]
    fn self_counters_are_atomic_and_isolated_from_remote_mutex() {
        let db = ParticipantDatabase::new(1, 0);
        db.record_self_sent(160);
        db.record_self_sent(160);
        assert_eq!(db.self_total_packets(), 2);
        assert_eq!(db.self_total_bytes(), 320);
    }
}
