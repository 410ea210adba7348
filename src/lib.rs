//! Receiver-side reliability core for depth video and audio streamed over UDP.
//!
//! Datagrams from each sender are routed to a [`SenderSession`], which keeps
//! the sender alive with heartbeats, reassembles video frames (rebuilding
//! single losses from XOR parity and asking for the rest again) and streams
//! ordered PCM into a lock-free ring for the audio callback.
//!
//! [`SenderSession`]: pipeline::receiver::SenderSession

pub mod config;
pub mod decoder;
pub mod display;
pub mod error;
pub mod pipeline;
pub mod protocol;
pub mod transport;

pub use config::ReceiverConfig;
pub use error::{PacketError, SessionError, TransportError};
pub use pipeline::receiver::{ReceiveStage, ReceiverCoordinator, ReceiverEvent, SenderSession};
