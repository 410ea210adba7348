//! Receiver-side reliability core
//!
//! The receive flow for one tick:
//! ```text
//! Socket → demultiplex → SenderSession ─┬→ VideoFrameAssembler → completed frames
//!                                       └→ AudioOrderingFeed   → AudioRingBuffer
//! ```

pub mod assembler;
pub mod audio_feed;
pub mod coordinator;
pub mod demux;
pub mod receive_stage;
pub mod session;

pub use assembler::{AssembledFrame, AssemblerConfig, FragmentRequest, VideoFrameAssembler};
pub use audio_feed::AudioOrderingFeed;
pub use coordinator::{ReceiverCoordinator, ReceiverEvent};
pub use demux::{ConfirmPacket, PacketSet, demultiplex};
pub use receive_stage::{ReceiveStage, ReceivedFrame};
pub use session::SenderSession;
