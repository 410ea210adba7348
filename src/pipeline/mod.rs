//! Receive pipeline
//!
//! Separates the concerns of the receiver:
//! - Control: per-sender liveness and readiness state machines
//! - Data: fragment reassembly, FEC recovery and audio ordering
//! - Health: counters a monitoring task can read while the loop runs
//!
//! Everything below `receiver` is synchronous and driven by an explicit
//! `now`; `ReceiveStage` runs it on a tokio tick for background use.

pub mod health;
pub mod receiver;
pub mod stage;
pub mod state;

pub use health::{HealthSummary, SessionHealth};
pub use stage::PipelineStage;
pub use state::PrepareState;
