//! Session group
//!
//! Holds every active session and joins the two worlds: the network
//! thread routes parsed packets in by SSRC (creating sessions on first
//! contact, within the admission limit), and the audio thread pulls
//! mixed frames out. Dead sessions are skipped on reads and pruned on
//! the next maintenance pass.
//!
//! Locking follows the narrow-critical-section rule: the session table
//! lock is only held to snapshot or mutate the table, and each session
//! has separate ingress and pipeline locks so the network thread never
//! waits on the audio thread.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::pipeline::{build_session, SessionConfig, SessionIngress, SessionPipeline};
use crate::audio::{Frame, FrameReader, Mixer, SampleSpec};
use crate::error::{Error, Result};
use crate::fec::payload_id;
use crate::packet::{FecScheme, PacketHandle, FLAG_AUDIO, FLAG_REPAIR, FLAG_RTP};
use crate::rtcp::{parse_sender_report, rtt_from_report, SenderReport};
use crate::rtp::EncodingMap;
use crate::units::Nanoseconds;

/// One session: id plus its two independently-locked halves.
pub struct SessionSlot {
    source_id: u32,
    payload_type: u8,
    ingress: Mutex<SessionIngress>,
    pipeline: Mutex<SessionPipeline>,
    dead: AtomicBool,
}

impl SessionSlot {
    /// Stream SSRC.
    pub fn source_id(&self) -> u32 {
        self.source_id
    }

    /// Payload type the session was created with.
    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }

    /// True once the watchdog or latency monitor killed the session.
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Relaxed)
    }

    /// Last measured latency in stream samples, when measurable.
    pub fn latency(&self) -> Option<i32> {
        self.pipeline.lock().latency()
    }
}

/// All sessions of one receiver, summed into a single output.
pub struct SessionGroup {
    config: SessionConfig,
    encodings: EncodingMap,
    fec_scheme: Option<FecScheme>,
    max_sessions: usize,
    sessions: Mutex<Vec<Arc<SessionSlot>>>,
    mixer: Mutex<Mixer>,
    n_dropped_no_session: AtomicU64,
    n_dropped_unroutable: AtomicU64,
}

impl SessionGroup {
    /// New group. The output spec must be valid: a zero channel mask
    /// can never produce a frame and is rejected here.
    pub fn new(
        config: SessionConfig,
        encodings: EncodingMap,
        fec_scheme: Option<FecScheme>,
        max_sessions: usize,
    ) -> Result<Self> {
        if !config.output_spec.is_valid() {
            return Err(Error::InvalidConfig(
                "output sample spec has zero rate or empty channel mask".to_string(),
            ));
        }
        if fec_scheme.is_some() != config.fec.is_some() {
            return Err(Error::InvalidConfig(
                "fec scheme and fec parameters must be configured together".to_string(),
            ));
        }

        let frame_len = config.output_spec.num_channels() * 1024;
        Ok(SessionGroup {
            config,
            encodings,
            fec_scheme,
            max_sessions,
            sessions: Mutex::new(Vec::new()),
            mixer: Mutex::new(Mixer::new(frame_len)),
            n_dropped_no_session: AtomicU64::new(0),
            n_dropped_unroutable: AtomicU64::new(0),
        })
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().iter().filter(|s| !s.is_dead()).count()
    }

    /// Snapshot of the session handles.
    pub fn sessions(&self) -> Vec<Arc<SessionSlot>> {
        self.sessions.lock().clone()
    }

    fn find_session(&self, source_id: u32) -> Option<Arc<SessionSlot>> {
        self.sessions
            .lock()
            .iter()
            .find(|s| s.source_id == source_id && !s.is_dead())
            .cloned()
    }

    fn create_session(&self, source_id: u32, payload_type: u8) -> Option<Arc<SessionSlot>> {
        let encoding = self.encodings.find_by_pt(payload_type)?;
        let packet_spec = encoding.sample_spec;

        let mut sessions = self.sessions.lock();
        // Lost a race with another packet of the same stream?
        if let Some(existing) = sessions
            .iter()
            .find(|s| s.source_id == source_id && !s.is_dead())
        {
            return Some(existing.clone());
        }
        if sessions.iter().filter(|s| !s.is_dead()).count() >= self.max_sessions {
            warn!(
                "session group: rejecting session: ssrc={} limit={}",
                source_id, self.max_sessions
            );
            return None;
        }

        let (ingress, pipeline) =
            match build_session(&self.config, packet_spec, &self.encodings) {
                Ok(parts) => parts,
                Err(e) => {
                    warn!("session group: cannot build session: {}", e);
                    return None;
                }
            };

        info!(
            "session group: creating session: ssrc={} pt={} rate={}",
            source_id,
            payload_type,
            packet_spec.sample_rate()
        );

        let slot = Arc::new(SessionSlot {
            source_id,
            payload_type,
            ingress: Mutex::new(ingress),
            pipeline: Mutex::new(pipeline),
            dead: AtomicBool::new(false),
        });
        sessions.push(slot.clone());
        Some(slot)
    }

    /// Route a parsed packet to its session, creating one on first
    /// contact with a new SSRC.
    pub fn route_packet(&self, packet: PacketHandle) {
        if packet.has_flags(FLAG_REPAIR) {
            self.route_repair(packet);
            return;
        }
        if !packet.has_flags(FLAG_RTP | FLAG_AUDIO) {
            self.n_dropped_unroutable.fetch_add(1, Ordering::Relaxed);
            debug!("session group: unroutable packet: flags={:#x}", packet.flags());
            return;
        }

        let rtp = packet.rtp();
        let slot = match self.find_session(rtp.source_id) {
            Some(slot) => slot,
            None => match self.create_session(rtp.source_id, rtp.payload_type) {
                Some(slot) => slot,
                None => {
                    self.n_dropped_no_session.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            },
        };

        slot.ingress.lock().write_source(packet);
    }

    /// Repair packets carry no SSRC, so they can only be attributed
    /// when a single session is active on the repair endpoint.
    fn route_repair(&self, packet: PacketHandle) {
        let sessions = self.sessions();
        let mut live = sessions.iter().filter(|s| !s.is_dead());
        match (live.next(), live.next()) {
            (Some(slot), None) => slot.ingress.lock().write_repair(packet),
            (Some(_), Some(_)) => {
                self.n_dropped_unroutable.fetch_add(1, Ordering::Relaxed);
                debug!("session group: ambiguous repair packet with multiple sessions");
            }
            _ => {
                self.n_dropped_no_session.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Parse and route a source-endpoint datagram.
    pub fn write_source_datagram(
        &self,
        buffer: Bytes,
        recv_timestamp: Nanoseconds,
    ) -> Result<()> {
        let mut packet = crate::rtp::parse(buffer, &self.encodings)?;
        if let Some(scheme) = self.fec_scheme {
            payload_id::parse_source(&mut packet, scheme, &self.encodings)?;
        }
        packet.queue_timestamp = recv_timestamp;
        self.route_packet(packet.into_handle());
        Ok(())
    }

    /// Parse and route a repair-endpoint datagram.
    pub fn write_repair_datagram(
        &self,
        buffer: Bytes,
        recv_timestamp: Nanoseconds,
    ) -> Result<()> {
        let scheme = self
            .fec_scheme
            .ok_or(Error::UnsupportedFormat("repair endpoint without fec scheme"))?;
        let mut packet = payload_id::parse_repair(buffer, scheme)?;
        packet.queue_timestamp = recv_timestamp;
        self.route_packet(packet.into_handle());
        Ok(())
    }

    /// Ingest a control-endpoint datagram (RTCP sender report).
    pub fn write_control_datagram(
        &self,
        buffer: &[u8],
        recv_timestamp: Nanoseconds,
    ) -> Result<()> {
        let sr = parse_sender_report(buffer)?;
        self.process_sender_report(&sr, recv_timestamp);
        Ok(())
    }

    /// Apply a sender report to its session: capture-timestamp mapping
    /// and, when the report echoes our own reports, RTT.
    pub fn process_sender_report(&self, sr: &SenderReport, now_ns: Nanoseconds) {
        let Some(slot) = self.find_session(sr.ssrc) else {
            return;
        };
        slot.pipeline.lock().process_sender_report(sr, now_ns);

        for report in &sr.reports {
            if let Some(rtt) = rtt_from_report(report, now_ns) {
                slot.ingress.lock().set_rtt(rtt);
            }
        }
    }

    /// Build reception report blocks for all live sessions.
    pub fn build_reports(&self, now_ns: Nanoseconds) -> Vec<crate::rtcp::ReceptionReport> {
        self.sessions()
            .iter()
            .filter(|s| !s.is_dead())
            .map(|slot| {
                let metrics = slot.ingress.lock().metrics();
                slot.pipeline
                    .lock()
                    .build_report(slot.source_id, &metrics, now_ns)
            })
            .collect()
    }

    /// Drop sessions whose watchdog or latency monitor fired.
    pub fn prune_dead_sessions(&self) {
        let mut sessions = self.sessions.lock();
        sessions.retain(|slot| {
            if slot.is_dead() {
                info!("session group: removing dead session: ssrc={}", slot.source_id);
                false
            } else {
                true
            }
        });
    }

    /// Packets dropped for lack of a session or a route.
    pub fn drop_counts(&self) -> (u64, u64) {
        (
            self.n_dropped_no_session.load(Ordering::Relaxed),
            self.n_dropped_unroutable.load(Ordering::Relaxed),
        )
    }
}

impl SessionGroup {
    /// Fill a frame with the mixed output of all live sessions.
    ///
    /// Called from the audio thread at the device pace. Never blocks on
    /// the network thread: only the per-session pipeline locks and the
    /// table snapshot are taken.
    pub fn read(&self, frame: &mut Frame<'_>) {
        let sessions = self.sessions();
        let mut guards: Vec<_> = sessions
            .iter()
            .filter(|s| !s.is_dead())
            .map(|s| (s, s.pipeline.lock()))
            .collect();

        {
            let mut mixer = self.mixer.lock();
            mixer.mix_into(
                frame,
                guards
                    .iter_mut()
                    .map(|(_, g)| &mut **g as &mut (dyn FrameReader + '_)),
            );
        }

        // Liveness changes surface after the read that detected them.
        for (slot, guard) in &guards {
            if !guard.is_alive() {
                slot.dead.store(true, Ordering::Relaxed);
            }
        }
    }

    /// Output sample spec frames must match.
    pub fn output_spec(&self) -> SampleSpec {
        self.config.output_spec
    }
}
