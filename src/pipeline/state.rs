//! Decoder readiness state for a sender session

use std::time::Instant;

/// Readiness lifecycle of one sender session.
///
/// Transitions only move forward: `Unprepared → Preparing → Prepared`.
/// The receiver core only reports when preparation may start; the work
/// itself (decoder setup, mesh creation) belongs to the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareState {
    /// Waiting for calibration or a first keyframe
    Unprepared,

    /// The consumer is setting up decoders
    Preparing {
        /// When preparation began
        started_at: Instant,
    },

    /// Decoding may run
    Prepared,
}

impl PrepareState {
    fn rank(&self) -> u8 {
        match self {
            PrepareState::Unprepared => 0,
            PrepareState::Preparing { .. } => 1,
            PrepareState::Prepared => 2,
        }
    }

    /// Check if this state transition is valid
    pub fn can_transition_to(&self, target: &PrepareState) -> bool {
        use PrepareState::*;

        match (self, target) {
            (Unprepared, Preparing { .. }) => true,
            (Preparing { .. }, Prepared) => true,
            // Skipping Preparing is allowed when setup is synchronous.
            (Unprepared, Prepared) => true,
            (a, b) => a.rank() == b.rank(),
        }
    }

    /// Get a human-readable description of this state
    pub fn description(&self) -> &'static str {
        match self {
            PrepareState::Unprepared => "Unprepared",
            PrepareState::Preparing { .. } => "Preparing",
            PrepareState::Prepared => "Prepared",
        }
    }

    pub fn is_prepared(&self) -> bool {
        matches!(self, PrepareState::Prepared)
    }

    /// How long preparation has been running (if preparing)
    pub fn preparing_duration(&self) -> Option<std::time::Duration> {
        if let PrepareState::Preparing { started_at } = self {
            Some(started_at.elapsed())
        } else {
            None
        }
    }
}

impl std::fmt::Display for PrepareState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}
