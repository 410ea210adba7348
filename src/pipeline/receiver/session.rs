//! Per-sender liveness and readiness state machine

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, info, warn};

use super::assembler::{AssembledFrame, FRAME_WINDOW, VideoFrameAssembler};
use super::audio_feed::AudioOrderingFeed;
use super::demux::PacketSet;
use crate::config::ReceiverConfig;
use crate::decoder::AudioDecoder;
use crate::display::AudioRingBuffer;
use crate::error::{SessionError, TransportError};
use crate::pipeline::health::SessionHealth;
use crate::pipeline::state::PrepareState;
use crate::protocol::receiver::FrameTiming;
use crate::protocol::{FloorPlane, ReceiverPacket};
use crate::transport::DatagramSink;

/// One connected sender: its reassembly state, audio feed and timers.
pub struct SenderSession {
    receiver_session_id: u32,
    sender_session_id: u32,
    endpoint: SocketAddr,
    heartbeat_interval: Duration,
    receive_timeout: Duration,
    last_heartbeat_sent: Instant,
    last_received: Instant,
    state: PrepareState,
    assembler: VideoFrameAssembler,
    audio: AudioOrderingFeed,
    completed: VecDeque<AssembledFrame>,
    last_rendered: Option<u32>,
    calibration: Option<Bytes>,
    floor: Option<FloorPlane>,
    keyframe_seen: bool,
    health: Arc<SessionHealth>,
}

impl SenderSession {
    pub fn new(
        receiver_session_id: u32,
        sender_session_id: u32,
        endpoint: SocketAddr,
        config: &ReceiverConfig,
        decoder: Box<dyn AudioDecoder>,
        now: Instant,
    ) -> Self {
        let health = Arc::new(SessionHealth::new());
        let ring = Arc::new(AudioRingBuffer::new(config.audio_ring_capacity));

        Self {
            receiver_session_id,
            sender_session_id,
            endpoint,
            heartbeat_interval: config.heartbeat_interval(),
            receive_timeout: config.receive_timeout(),
            last_heartbeat_sent: now,
            last_received: now,
            state: PrepareState::Unprepared,
            assembler: VideoFrameAssembler::new(config.protocol, config.assembler(), health.clone()),
            audio: AudioOrderingFeed::new(decoder, ring, health.clone()),
            completed: VecDeque::new(),
            last_rendered: None,
            calibration: None,
            floor: None,
            keyframe_seen: false,
            health,
        }
    }

    pub fn receiver_session_id(&self) -> u32 {
        self.receiver_session_id
    }

    pub fn sender_session_id(&self) -> u32 {
        self.sender_session_id
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn state(&self) -> PrepareState {
        self.state
    }

    pub fn health(&self) -> &Arc<SessionHealth> {
        &self.health
    }

    /// Ring the audio output callback drains.
    pub fn audio_ring(&self) -> &Arc<AudioRingBuffer> {
        self.audio.ring()
    }

    pub fn calibration(&self) -> Option<&Bytes> {
        self.calibration.as_ref()
    }

    pub fn floor(&self) -> Option<FloorPlane> {
        self.floor
    }

    pub fn assembler(&self) -> &VideoFrameAssembler {
        &self.assembler
    }

    /// Advance one tick.
    ///
    /// Sends a heartbeat when one is due, feeds whatever arrived into the
    /// assembler and audio feed, and fails once nothing has been heard from
    /// the sender for longer than the receive timeout.
    pub fn update(
        &mut self,
        now: Instant,
        packets: PacketSet,
        sink: &dyn DatagramSink,
    ) -> Result<(), SessionError> {
        let since_heartbeat = now.saturating_duration_since(self.last_heartbeat_sent);
        if since_heartbeat >= self.heartbeat_interval {
            self.send(sink, ReceiverPacket::heartbeat(self.receiver_session_id))?;
            // Keep the cadence fixed unless we fell a whole interval behind.
            self.last_heartbeat_sent = if since_heartbeat < self.heartbeat_interval * 2 {
                self.last_heartbeat_sent + self.heartbeat_interval
            } else {
                now
            };
        }

        if packets.received_any {
            self.last_received = now;
            return self.ingest(packets, sink);
        }

        let silent_for = now.saturating_duration_since(self.last_received);
        if silent_for > self.receive_timeout {
            warn!(
                "sender session {} ({}) timed out after {:?}",
                self.sender_session_id, self.endpoint, silent_for
            );
            return Err(SessionError::Timeout {
                elapsed: silent_for,
                timeout: self.receive_timeout,
            });
        }

        Ok(())
    }

    fn ingest(&mut self, packets: PacketSet, sink: &dyn DatagramSink) -> Result<(), SessionError> {
        if let Some(calibration) = packets.init {
            if self.calibration.is_none() {
                info!("sender session {}: calibration received", self.sender_session_id);
            }
            self.calibration = Some(calibration);
        }
        if let Some(floor) = packets.floors.last() {
            self.floor = Some(*floor);
        }

        let output = self
            .assembler
            .assemble(packets.video, packets.parity, self.last_rendered);

        for request in output.requests {
            let packet = ReceiverPacket::request(
                self.receiver_session_id,
                request.frame_id,
                request.video_indices,
                request.parity_indices,
            );
            if self.send(sink, packet)? {
                SessionHealth::incr(&self.health.requests_sent);
            }
        }

        if let Some(newest) = output.frames.last().map(|f| f.frame_id) {
            self.send(sink, ReceiverPacket::report(self.receiver_session_id, newest, None))?;
        }
        for assembled in output.frames {
            self.keyframe_seen |= assembled.frame.keyframe;
            if let Some(calibration) = &assembled.frame.calibration {
                self.calibration = Some(calibration.clone());
            }
            if let Some(floor) = assembled.frame.floor {
                self.floor = Some(floor);
            }
            if self.completed.len() == FRAME_WINDOW {
                self.completed.pop_front();
                SessionHealth::incr(&self.health.frames_dropped);
            }
            self.completed.push_back(assembled);
        }

        if self.state.is_prepared() {
            self.audio.feed(packets.audio);
        } else if !packets.audio.is_empty() {
            SessionHealth::add(&self.health.audio_dropped, packets.audio.len() as u64);
        }

        Ok(())
    }

    /// Returns `Ok(false)` when the datagram was dropped because the socket
    /// would block.
    fn send(&self, sink: &dyn DatagramSink, packet: ReceiverPacket) -> Result<bool, SessionError> {
        match sink.send_datagram(&packet.to_bytes(), self.endpoint) {
            Ok(true) => Ok(true),
            Ok(false) => {
                debug!("socket busy, dropped {:?} to {}", packet.packet_type(), self.endpoint);
                Ok(false)
            }
            Err(e) => Err(TransportError::Send(e).into()),
        }
    }

    /// Completed frames not yet taken by the consumer, oldest first.
    pub fn completed_video_frames(&mut self) -> impl Iterator<Item = AssembledFrame> + '_ {
        self.completed.drain(..)
    }

    /// Record the newest frame the consumer has displayed. Never moves back.
    pub fn set_last_rendered(&mut self, frame_id: u32) {
        self.last_rendered = self.last_rendered.max(Some(frame_id));
    }

    pub fn last_rendered(&self) -> Option<u32> {
        self.last_rendered
    }

    /// True once enough has arrived for the consumer to start preparing.
    pub fn prepare_trigger_ready(&self) -> bool {
        self.calibration.is_some() || self.keyframe_seen
    }

    pub fn begin_preparing(&mut self, now: Instant) -> Result<(), SessionError> {
        self.transition(PrepareState::Preparing { started_at: now })
    }

    pub fn mark_prepared(&mut self) -> Result<(), SessionError> {
        self.transition(PrepareState::Prepared)
    }

    fn transition(&mut self, target: PrepareState) -> Result<(), SessionError> {
        if !self.state.can_transition_to(&target) {
            return Err(SessionError::InvalidTransition {
                from: self.state,
                to: target,
            });
        }
        if self.state.description() != target.description() {
            match self.state.preparing_duration() {
                Some(took) => info!(
                    "sender session {}: {} -> {} after {:?}",
                    self.sender_session_id, self.state, target, took
                ),
                None => info!(
                    "sender session {}: {} -> {}",
                    self.sender_session_id, self.state, target
                ),
            }
            self.state = target;
        }
        Ok(())
    }

    /// Send a Report carrying the consumer's decode timing.
    pub fn send_report_with_timing(
        &self,
        sink: &dyn DatagramSink,
        frame_id: u32,
        decoder_time_ms: f32,
        frame_time_ms: f32,
    ) -> Result<(), SessionError> {
        let timing = FrameTiming {
            decoder_time_ms,
            frame_time_ms,
        };
        self.send(
            sink,
            ReceiverPacket::report(self.receiver_session_id, frame_id, Some(timing)),
        )
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::PcmDecoder;
    use crate::protocol::receiver::ReceiverBody;
    use crate::protocol::sender::SenderBody;
    use crate::protocol::{AudioFragment, ProtocolParams, VideoFrame, split_video_message};
    use std::cell::RefCell;
    use std::io;

    #[derive(Default)]
    struct RecordingSink {
        sent: RefCell<Vec<ReceiverPacket>>,
        fail: bool,
    }

    impl DatagramSink for RecordingSink {
        fn send_datagram(&self, payload: &[u8], _addr: SocketAddr) -> io::Result<bool> {
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "nope"));
            }
            let packet = ReceiverPacket::parse(Bytes::copy_from_slice(payload)).unwrap();
            self.sent.borrow_mut().push(packet);
            Ok(true)
        }
    }

    impl RecordingSink {
        fn count(&self, pred: impl Fn(&ReceiverBody) -> bool) -> usize {
            self.sent.borrow().iter().filter(|p| pred(&p.body)).count()
        }

        fn heartbeats(&self) -> usize {
            self.count(|b| matches!(b, ReceiverBody::Heartbeat))
        }
    }

    fn config() -> ReceiverConfig {
        ReceiverConfig {
            audio_samples_per_frame: 4,
            audio_ring_capacity: 64,
            ..ReceiverConfig::default()
        }
    }

    fn session(now: Instant) -> SenderSession {
        let config = config();
        SenderSession::new(
            1,
            42,
            "127.0.0.1:9000".parse().unwrap(),
            &config,
            Box::new(PcmDecoder::new(config.audio_samples_per_frame)),
            now,
        )
    }

    fn heartbeat_only() -> PacketSet {
        PacketSet {
            received_any: true,
            ..Default::default()
        }
    }

    fn frame_packets(frame_id: u32, keyframe: bool) -> PacketSet {
        sized_frame_packets(frame_id, keyframe, 1)
    }

    fn sized_frame_packets(frame_id: u32, keyframe: bool, color_len: usize) -> PacketSet {
        let message = VideoFrame {
            timestamp_ms: frame_id as f32,
            keyframe,
            color: Bytes::from(vec![7u8; color_len]),
            depth: Bytes::from_static(b"d"),
            floor: None,
            calibration: None,
        }
        .to_bytes();
        let mut set = heartbeat_only();
        for packet in split_video_message(42, frame_id, &message, &ProtocolParams::default()) {
            match packet.body {
                SenderBody::Video(f) => set.video.push(f),
                SenderBody::Parity(f) => set.parity.push(f),
                _ => {}
            }
        }
        set
    }

    #[test]
    fn test_timeout_only_after_threshold() {
        let start = Instant::now();
        let mut session = session(start);
        let sink = RecordingSink::default();

        for ms in (0..=5000).step_by(250) {
            let now = start + Duration::from_millis(ms);
            assert!(session.update(now, PacketSet::default(), &sink).is_ok(), "tick at {}ms", ms);
        }

        let err = session
            .update(start + Duration::from_millis(5001), PacketSet::default(), &sink)
            .unwrap_err();
        assert!(matches!(err, SessionError::Timeout { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_heartbeat_packets_keep_session_alive() {
        let start = Instant::now();
        let mut session = session(start);
        let sink = RecordingSink::default();

        for s in 1..=20 {
            let now = start + Duration::from_secs(s);
            let packets = if s % 4 == 0 {
                heartbeat_only()
            } else {
                PacketSet::default()
            };
            assert!(session.update(now, packets, &sink).is_ok());
        }
    }

    #[test]
    fn test_heartbeat_cadence_independent_of_tick_rate() {
        let start = Instant::now();
        let mut session = session(start);
        let sink = RecordingSink::default();

        // 3.5s of ticks every 70ms, all with traffic so nothing times out.
        let mut ms = 0;
        while ms <= 3500 {
            session
                .update(start + Duration::from_millis(ms), heartbeat_only(), &sink)
                .unwrap();
            ms += 70;
        }
        assert_eq!(sink.heartbeats(), 3);

        let sink = RecordingSink::default();
        let mut session = self::session(start);
        let mut ms = 0;
        while ms <= 3500 {
            session
                .update(start + Duration::from_millis(ms), heartbeat_only(), &sink)
                .unwrap();
            ms += 7;
        }
        assert_eq!(sink.heartbeats(), 3);
    }

    #[test]
    fn test_report_after_completion() {
        let start = Instant::now();
        let mut session = session(start);
        let sink = RecordingSink::default();

        session.update(start, frame_packets(3, true), &sink).unwrap();
        assert_eq!(
            sink.count(|b| matches!(b, ReceiverBody::Report { frame_id: 3, timing: None })),
            1
        );

        let frames: Vec<_> = session.completed_video_frames().collect();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame_id, 3);
        assert!(session.completed_video_frames().next().is_none());
        assert!(session.prepare_trigger_ready());
    }

    #[test]
    fn test_request_sent_for_unrecoverable_frame() {
        let start = Instant::now();
        let mut session = session(start);
        let sink = RecordingSink::default();

        // Three video fragments in one group; two lost, parity cannot cover it.
        let mut set = sized_frame_packets(1, true, 3500);
        assert_eq!(set.video.len(), 3);
        set.video.retain(|f| f.index == 2);
        session.update(start, set, &sink).unwrap();
        // Frame 2 starts arriving but is not complete yet.
        let mut next = sized_frame_packets(2, false, 3500);
        next.video.truncate(1);
        next.parity.clear();
        session.update(start, next, &sink).unwrap();

        assert_eq!(
            sink.count(|b| matches!(b, ReceiverBody::Request { frame_id: 1, .. })),
            1
        );
        assert_eq!(session.health().requests_sent(), 1);
        let requested = sink.sent.borrow().iter().find_map(|p| match &p.body {
            ReceiverBody::Request { video_indices, .. } => Some(video_indices.clone()),
            _ => None,
        });
        assert_eq!(requested, Some(vec![0, 1]));
    }

    #[test]
    fn test_prepare_state_is_monotonic() {
        let start = Instant::now();
        let mut session = session(start);
        assert!(!session.prepare_trigger_ready());

        let mut set = heartbeat_only();
        set.init = Some(Bytes::from_static(b"calibration"));
        session.update(start, set, &RecordingSink::default()).unwrap();
        assert!(session.prepare_trigger_ready());

        session.begin_preparing(start).unwrap();
        session.mark_prepared().unwrap();
        assert!(session.state().is_prepared());
        assert!(matches!(
            session.begin_preparing(start),
            Err(SessionError::InvalidTransition { .. })
        ));
        assert!(session.state().is_prepared());
    }

    #[test]
    fn test_audio_gated_until_prepared() {
        let start = Instant::now();
        let mut session = session(start);
        let sink = RecordingSink::default();
        let audio = |id| AudioFragment {
            frame_id: id,
            payload: Bytes::from_static(&[0, 1, 0, 1, 0, 1, 0, 1]),
        };

        let mut set = heartbeat_only();
        set.audio.push(audio(1));
        session.update(start, set, &sink).unwrap();
        assert_eq!(session.audio_ring().available(), 0);

        session.mark_prepared().unwrap();
        let mut set = heartbeat_only();
        set.audio.push(audio(2));
        session.update(start, set, &sink).unwrap();
        assert_eq!(session.audio_ring().available(), 4);
    }

    #[test]
    fn test_send_failure_is_fatal() {
        let start = Instant::now();
        let mut session = session(start);
        let sink = RecordingSink {
            fail: true,
            ..Default::default()
        };
        let err = session
            .update(start + Duration::from_secs(2), heartbeat_only(), &sink)
            .unwrap_err();
        assert!(matches!(err, SessionError::Transport(_)));
    }

    #[test]
    fn test_last_rendered_never_moves_back() {
        let mut session = session(Instant::now());
        session.set_last_rendered(10);
        session.set_last_rendered(4);
        assert_eq!(session.last_rendered(), Some(10));
    }

    #[test]
    fn test_report_with_timing() {
        let session = session(Instant::now());
        let sink = RecordingSink::default();
        session.send_report_with_timing(&sink, 8, 3.0, 33.0).unwrap();
        assert_eq!(
            sink.count(|b| matches!(b, ReceiverBody::Report { frame_id: 8, timing: Some(_) })),
            1
        );
    }
}
