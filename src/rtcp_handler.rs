//! RTCP handler: periodic reporter, liveness sweep, and protocol state
//! machine (`idle -> running -> draining -> closed`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::config::{SdesConfig, USER_EMAIL, USER_LOC, USER_NAME, USER_NOTE, USER_PHONE};
use crate::participant::ParticipantDatabase;
use crate::transport::{RecvOutcome, Transport};
use crate::wire::rtcp::{
    build_compound_rtcp, parse_compound_rtcp, ReceptionReport, RtcpPacket, SdesChunk, SenderInfo,
    SDES_CNAME, SDES_EMAIL, SDES_LOC, SDES_NAME, SDES_NOTE, SDES_PHONE, SDES_TOOL,
};

const RTCP_INTERVAL: Duration = Duration::from_secs(5);
const PARTICIPANT_TIMEOUT: Duration = Duration::from_secs(60);
const RECV_TIMEOUT: Duration = Duration::from_millis(1000);
const RECV_BUF_SIZE: usize = 1500;
const NTP_UNIX_EPOCH_OFFSET: u64 = 2_208_988_800;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtcpState {
    Idle,
    Running,
    Draining,
    Closed,
}

fn ntp_now() -> u64 {
    let since_epoch = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    let secs = since_epoch.as_secs() + NTP_UNIX_EPOCH_OFFSET;
    let frac = ((since_epoch.subsec_nanos() as u64) << 32) / 1_000_000_000;
    (secs << 32) | frac
}

fn middle_32(ntp_timestamp: u64) -> u32 {
    ((ntp_timestamp >> 16) & 0xFFFF_FFFF) as u32
}

pub struct RtcpHandler {
    transport: Arc<dyn Transport>,
    database: Arc<ParticipantDatabase>,
    config: Arc<dyn SdesConfig>,
    state: Mutex<RtcpState>,
    shutdown_on_last_remote: bool,
    is_active_sender: bool,
}

impl RtcpHandler {
    pub fn new(
        transport: Arc<dyn Transport>,
        database: Arc<ParticipantDatabase>,
        config: Arc<dyn SdesConfig>,
        shutdown_on_last_remote: bool,
        is_active_sender: bool,
    ) -> Self {
        RtcpHandler {
            transport,
            database,
            config,
            state: Mutex::new(RtcpState::Idle),
            shutdown_on_last_remote,
            is_active_sender,
        }
    }

    pub fn state(&self) -> RtcpState {
        *self.state.lock().unwrap()
    }

    fn build_sdes(&self) -> RtcpPacket {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        let user = std::env::var("USER").unwrap_or_else(|_| "user".to_string());
        let mut items = vec![(SDES_CNAME, format!("{user}@{host}"))];

        if self.config.is_set(USER_NAME) {
            items.push((SDES_NAME, self.config.get(USER_NAME, "", "")));
        }
        if self.config.is_set(USER_EMAIL) {
            items.push((SDES_EMAIL, self.config.get(USER_EMAIL, "", "")));
        }
        if self.config.is_set(USER_PHONE) {
            items.push((SDES_PHONE, self.config.get(USER_PHONE, "", "")));
        }
        if self.config.is_set(USER_LOC) {
            items.push((SDES_LOC, self.config.get(USER_LOC, "", "")));
        }
        if self.config.is_set(USER_NOTE) {
            items.push((SDES_NOTE, self.config.get(USER_NOTE, "", "")));
        }
        items.push((SDES_TOOL, "rtp-conf-core".to_string()));

        RtcpPacket::Sdes {
            chunks: vec![SdesChunk {
                ssrc: self.database.self_ssrc(),
                items,
            }],
        }
    }

    fn build_reception_reports(&self) -> Vec<ReceptionReport> {
        let ssrcs: Vec<u32> = self
            .database
            .get_all_remote()
            .into_iter()
            .map(|(ssrc, _)| ssrc)
            .filter(|ssrc| *ssrc != 0)
            .collect();

        ssrcs
            .into_iter()
            .map(|ssrc| {
                self.database.with_remote_mut(ssrc, |record| {
                    let fraction = record.fraction_lost_and_advance();
                    let (lsr, dlsr) = match &record.rtcp_data {
                        Some(data) => {
                            let lsr = data.last_sr_middle_ntp;
                            let dlsr = match data.last_sr_timestamp {
                                Some(t) => (t.elapsed().as_secs_f64() * 65536.0) as u32,
                                None => 0,
                            };
                            (lsr, dlsr)
                        }
                        None => (0, 0),
                    };
                    ReceptionReport {
                        ssrc,
                        fraction_lost: fraction,
                        cumulative_lost: record.packets_lost & 0x00FF_FFFF,
                        extended_highest_seq: record.extended_highest_seq,
                        jitter: record.interarrival_jitter as u32,
                        lsr,
                        dlsr,
                    }
                })
            })
            .collect()
    }

    fn build_report_part(&self) -> RtcpPacket {
        let reports = self.build_reception_reports();
        let ssrc = self.database.self_ssrc();
        if self.is_active_sender {
            RtcpPacket::Sr {
                ssrc,
                info: SenderInfo {
                    ntp_timestamp: ntp_now(),
                    rtp_timestamp: 0,
                    packet_count: self.database.self_total_packets(),
                    octet_count: self.database.self_total_bytes(),
                },
                reports,
            }
        } else {
            RtcpPacket::Rr { ssrc, reports }
        }
    }

    async fn send_periodic_report(&self) {
        let parts = vec![self.build_report_part(), self.build_sdes()];
        match build_compound_rtcp(&parts) {
            Ok(bytes) => {
                if let Err(e) = self.transport.send(&bytes).await {
                    tracing::warn!("RTCP send failed: {}", e);
                }
            }
            Err(e) => tracing::warn!("failed to build RTCP report: {}", e),
        }
    }

    async fn send_farewell(&self, reason: &str) {
        let parts = vec![
            self.build_report_part(),
            self.build_sdes(),
            RtcpPacket::Bye {
                sources: vec![self.database.self_ssrc()],
                reason: Some(reason.to_string()),
            },
        ];
        match build_compound_rtcp(&parts) {
            Ok(bytes) => {
                if let Err(e) = self.transport.send(&bytes).await {
                    tracing::warn!("RTCP farewell send failed: {}", e);
                }
            }
            Err(e) => tracing::warn!("failed to build RTCP farewell: {}", e),
        }
    }

    async fn on_timer_tick(&self) -> bool {
        let timed_out = self.database.sweep_timed_out(PARTICIPANT_TIMEOUT);
        for ssrc in &timed_out {
            tracing::info!("participant {:#010x} timed out, removed locally", ssrc);
        }
        if !timed_out.is_empty() && self.shutdown_on_last_remote && self.database.remote_count() == 0 {
            return true;
        }
        self.send_periodic_report().await;
        false
    }

    async fn handle_datagram(&self, data: &[u8]) -> bool {
        let parts = match parse_compound_rtcp(data) {
            Ok(parts) => parts,
            Err(e) => {
                tracing::debug!("dropping malformed RTCP datagram: {}", e);
                return false;
            }
        };

        let mut should_shutdown = false;
        for part in parts {
            match part {
                RtcpPacket::Sr { ssrc, info, reports } => {
                    tracing::debug!(
                        "SR from {:#010x}: packets={} octets={} reports={}",
                        ssrc,
                        info.packet_count,
                        info.octet_count,
                        reports.len()
                    );
                    let middle = middle_32(info.ntp_timestamp);
                    self.database.with_remote_mut(ssrc, |record| {
                        record.last_seen = Instant::now();
                        let data = record.rtcp_data.get_or_insert_with(Default::default);
                        data.last_sr_timestamp = Some(Instant::now());
                        data.last_sr_middle_ntp = middle;
                    });
                }
                RtcpPacket::Rr { ssrc, reports } => {
                    tracing::debug!("RR from {:#010x}: {} reports", ssrc, reports.len());
                    self.database.with_remote_mut(ssrc, |record| {
                        record.last_seen = Instant::now();
                    });
                }
                RtcpPacket::Sdes { chunks } => {
                    for chunk in chunks {
                        self.database.with_remote_mut(chunk.ssrc, |record| {
                            record.last_seen = Instant::now();
                            let data = record.rtcp_data.get_or_insert_with(Default::default);
                            data.sdes_items = chunk.items.into_iter().collect();
                        });
                    }
                }
                RtcpPacket::Bye { sources, reason } => {
                    for ssrc in sources {
                        tracing::info!("BYE from {:#010x}: {:?}", ssrc, reason);
                        self.database.remove(ssrc);
                    }
                    if self.shutdown_on_last_remote && self.database.remote_count() == 0 {
                        should_shutdown = true;
                    }
                }
                RtcpPacket::App { ssrc, subtype, .. } => {
                    tracing::debug!("ignoring APP packet from {:#010x} (subtype {})", ssrc, subtype);
                }
            }
        }
        should_shutdown
    }

    /// Drive the handler until `running` is cleared, a farewell-triggering
    /// event occurs, or the transport closes. Runs the 5 s report timer and
    /// the RTCP receive loop on one task, one thread per socket.
    pub async fn run(&self, running: Arc<AtomicBool>) {
        *self.state.lock().unwrap() = RtcpState::Running;
        tracing::info!("RTCP handler started");

        let mut ticker = tokio::time::interval(RTCP_INTERVAL);
        ticker.tick().await; // first tick fires immediately; discard it

        let mut buf = vec![0u8; RECV_BUF_SIZE];
        let mut shutdown_reason = "Program exit";

        while running.load(Ordering::Relaxed) {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.on_timer_tick().await {
                        shutdown_reason = "last remote timed out";
                        break;
                    }
                }
                outcome = self.transport.recv_timeout(&mut buf, RECV_TIMEOUT) => {
                    match outcome {
                        Ok(RecvOutcome::Received(n)) => {
                            if self.handle_datagram(&buf[..n]).await {
                                shutdown_reason = "last remote left";
                                break;
                            }
                        }
                        Ok(RecvOutcome::Timeout) => {}
                        Ok(RecvOutcome::InvalidSocket) => break,
                        Err(e) => {
                            tracing::warn!("RTCP receive error: {}", e);
                            break;
                        }
                    }
                }
            }
        }

        self.shutdown(shutdown_reason).await;
    }

    pub async fn shutdown(&self, reason: &str) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == RtcpState::Closed {
                return;
            }
            *state = RtcpState::Draining;
        }
        self.send_farewell(reason).await;
        self.transport.close();
        *self.state.lock().unwrap() = RtcpState::Closed;
        tracing::info!("RTCP handler closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticSdesConfig;
    use crate::transport::MockTransport;
    use crate::wire::rtcp::parse_compound_rtcp;
    use std::sync::atomic::AtomicUsize;

    struct CountingObserver {
        removed: AtomicUsize,
    }

    impl crate::participant::ParticipantObserver for CountingObserver {
        fn on_remote_added(&self, _ssrc: u32) {}
        fn on_remote_removed(&self, _ssrc: u32) {
            self.removed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn handler(
        shutdown_on_last_remote: bool,
        is_active_sender: bool,
    ) -> (Arc<MockTransport>, Arc<ParticipantDatabase>, RtcpHandler) {
        let transport = Arc::new(MockTransport::new());
        let database = Arc::new(ParticipantDatabase::new(0x1, 0));
        let config = Arc::new(StaticSdesConfig::default());
        let h = RtcpHandler::new(
            transport.clone(),
            database.clone(),
            config,
            shutdown_on_last_remote,
            is_active_sender,
        );
        (transport, database, h)
    }

    #[tokio::test]
    async fn sr_round_trip_via_periodic_report() {
        let (transport, database, h) = handler(true, true);
        database.record_self_sent(0);
        h.send_periodic_report().await;

        let sent = transport.sent_datagrams().await;
        assert_eq!(sent.len(), 1);
        let parsed = parse_compound_rtcp(&sent[0]).unwrap();
        match &parsed[0] {
            RtcpPacket::Sr { ssrc, info, reports } => {
                assert_eq!(*ssrc, 0x1);
                assert_eq!(info.packet_count, 1);
                assert!(reports.is_empty());
            }
            other => panic!("expected SR, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn active_sender_sends_sr_before_first_frame_is_sent() {
        let (transport, _database, h) = handler(true, true);
        h.send_periodic_report().await;

        let sent = transport.sent_datagrams().await;
        let parsed = parse_compound_rtcp(&sent[0]).unwrap();
        match &parsed[0] {
            RtcpPacket::Sr { info, .. } => assert_eq!(info.packet_count, 0),
            other => panic!("expected SR, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn non_sender_sends_rr_even_after_sending_a_packet() {
        let (transport, database, h) = handler(true, false);
        database.record_self_sent(0);
        h.send_periodic_report().await;

        let sent = transport.sent_datagrams().await;
        let parsed = parse_compound_rtcp(&sent[0]).unwrap();
        assert!(matches!(parsed[0], RtcpPacket::Rr { .. }));
    }

    #[tokio::test]
    async fn timeout_removes_participant_and_notifies_observer() {
        let (_transport, database, h) = handler(false, true);
        let observer = Arc::new(CountingObserver {
            removed: AtomicUsize::new(0),
        });
        database.register_listener(observer.clone());
        database.with_remote_mut(0xAAAA, |r| {
            r.last_seen = Instant::now() - Duration::from_secs(61);
        });

        let should_shutdown = h.on_timer_tick().await;
        assert!(!database.is_in_database(0xAAAA));
        assert_eq!(observer.removed.load(Ordering::SeqCst), 1);
        assert!(!should_shutdown); // shutdown_on_last_remote is false here
    }

    #[tokio::test]
    async fn timeout_triggers_shutdown_when_last_remote_leaves() {
        let (_transport, database, h) = handler(true, true);
        database.with_remote_mut(0xBBBB, |r| {
            r.last_seen = Instant::now() - Duration::from_secs(61);
        });

        let should_shutdown = h.on_timer_tick().await;
        assert!(should_shutdown);
    }

    #[tokio::test]
    async fn bye_removes_participant_and_logs_reason() {
        let (transport, database, h) = handler(false, true);
        database.with_remote_mut(0xCCCC, |_| {});

        let parts = vec![
            RtcpPacket::Rr {
                ssrc: 0xCCCC,
                reports: vec![],
            },
            RtcpPacket::Bye {
                sources: vec![0xCCCC],
                reason: Some("adios".to_string()),
            },
        ];
        let datagram = build_compound_rtcp(&parts).unwrap();
        h.handle_datagram(&datagram).await;

        assert!(!database.is_in_database(0xCCCC));
        let _ = transport; // no report expected to be sent by handle_datagram directly
    }

    #[tokio::test]
    async fn shutdown_sends_farewell_with_bye_and_closes_transport() {
        let (transport, database, h) = handler(true, true);
        database.with_remote_mut(0xDDDD, |_| {});
        h.shutdown("Program exit").await;

        let sent = transport.sent_datagrams().await;
        assert_eq!(sent.len(), 1);
        let parsed = parse_compound_rtcp(&sent[0]).unwrap();
        let has_bye = parsed.iter().any(|p| matches!(p, RtcpPacket::Bye { reason, .. } if reason.as_deref() == Some("Program exit")));
        assert!(has_bye);
        assert_eq!(h.state(), RtcpState::Closed);
    }

    #[tokio::test]
    async fn sdes_includes_configured_optional_items() {
        let transport = Arc::new(MockTransport::new());
        let database = Arc::new(ParticipantDatabase::new(0x1, 0));
        let mut map = std::collections::HashMap::new();
        map.insert(USER_NAME.to_string(), "Ada".to_string());
        let config = Arc::new(StaticSdesConfig(map));
        let h = RtcpHandler::new(transport, database, config, true, true);

        match h.build_sdes() {
            RtcpPacket::Sdes { chunks } => {
                let names: Vec<u8> = chunks[0].items.iter().map(|(t, _)| *t).collect();
                assert!(names.contains(&SDES_NAME));
                assert!(names.contains(&SDES_TOOL));
                assert!(names.contains(&SDES_CNAME));
            }
            other => panic!("expected SDES, got {:?}", other),
        }
    }
}
