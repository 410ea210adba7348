//! Per-session reliability counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one sender session.
///
/// All fields use atomic operations so a monitoring task can read them while
/// the receive loop updates them.
#[derive(Debug, Default)]
pub struct SessionHealth {
    /// Video fragments accepted by the assembler
    pub video_fragments: AtomicU64,

    /// Parity fragments accepted by the assembler
    pub parity_fragments: AtomicU64,

    /// Fragments dropped as stale, duplicate or inconsistent
    pub fragments_dropped: AtomicU64,

    /// Video fragments rebuilt from parity
    pub fragments_recovered: AtomicU64,

    /// Request datagrams sent
    pub requests_sent: AtomicU64,

    /// Video frames fully assembled
    pub frames_completed: AtomicU64,

    /// Frames discarded before completing, or completed but unparseable
    pub frames_dropped: AtomicU64,

    /// Audio frames written to the ring buffer
    pub audio_decoded: AtomicU64,

    /// Audio frames skipped for backpressure or decode failure
    pub audio_dropped: AtomicU64,

    /// Datagrams that failed to parse
    pub malformed_packets: AtomicU64,
}

impl SessionHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_completed(&self) -> u64 {
        self.frames_completed.load(Ordering::Relaxed)
    }

    pub fn fragments_recovered(&self) -> u64 {
        self.fragments_recovered.load(Ordering::Relaxed)
    }

    pub fn requests_sent(&self) -> u64 {
        self.requests_sent.load(Ordering::Relaxed)
    }

    /// Share of video fragments that had to be rebuilt, as a percentage
    pub fn recovery_rate(&self) -> f64 {
        let received = self.video_fragments.load(Ordering::Relaxed);
        if received == 0 {
            return 0.0;
        }
        (self.fragments_recovered() as f64 / received as f64) * 100.0
    }

    /// Get a summary of health metrics
    pub fn summary(&self) -> HealthSummary {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        HealthSummary {
            video_fragments: load(&self.video_fragments),
            parity_fragments: load(&self.parity_fragments),
            fragments_dropped: load(&self.fragments_dropped),
            fragments_recovered: load(&self.fragments_recovered),
            requests_sent: load(&self.requests_sent),
            frames_completed: load(&self.frames_completed),
            frames_dropped: load(&self.frames_dropped),
            audio_decoded: load(&self.audio_decoded),
            audio_dropped: load(&self.audio_dropped),
            malformed_packets: load(&self.malformed_packets),
            recovery_rate: self.recovery_rate(),
        }
    }
}

/// Snapshot of health metrics
#[derive(Debug, Clone, PartialEq)]
pub struct HealthSummary {
    pub video_fragments: u64,
    pub parity_fragments: u64,
    pub fragments_dropped: u64,
    pub fragments_recovered: u64,
    pub requests_sent: u64,
    pub frames_completed: u64,
    pub frames_dropped: u64,
    pub audio_decoded: u64,
    pub audio_dropped: u64,
    pub malformed_packets: u64,
    pub recovery_rate: f64,
}

impl std::fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Health: {} frames ({} dropped), {} video + {} parity fragments ({} recovered, {:.2}%), {} requests, audio {} decoded / {} dropped, {} malformed",
            self.frames_completed,
            self.frames_dropped,
            self.video_fragments,
            self.parity_fragments,
            self.fragments_recovered,
            self.recovery_rate,
            self.requests_sent,
            self.audio_decoded,
            self.audio_dropped,
            self.malformed_packets
        )
    }
}
