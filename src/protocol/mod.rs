//! Wire protocol shared by senders and receivers
//!
//! Every datagram starts with a 5-byte header: a little-endian `u32` session
//! id followed by a one-byte packet type. Sender packets carry the sender's
//! session id, receiver packets carry the receiver-assigned id. All integers
//! are little-endian and there is no padding between fields.

pub mod packetizer;
pub mod reader;
pub mod receiver;
pub mod sender;
pub mod video;

use serde::{Deserialize, Serialize};

use crate::error::PacketError;

pub use packetizer::split_video_message;
pub use reader::WireReader;
pub use receiver::ReceiverPacket;
pub use sender::{AudioFragment, Fragment, SenderPacket};
pub use video::{FloorPlane, VideoFrame};

/// Largest datagram either end will send.
pub const MAX_PACKET_SIZE: usize = 1472;

/// Session id (4) + packet type (1).
pub const HEADER_SIZE: usize = 5;

/// Header + frame_id + fragment_index + fragment_count.
pub const FRAGMENT_HEADER_SIZE: usize = HEADER_SIZE + 12;

/// Default number of video fragments protected by one parity fragment.
pub const DEFAULT_FEC_GROUP_SIZE: usize = 5;

/// Protocol parameters fixed once per deployment.
///
/// Both ends must agree on these; nothing here is inferred from packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolParams {
    pub fec_group_size: usize,
    pub max_packet_size: usize,
}

impl Default for ProtocolParams {
    fn default() -> Self {
        Self {
            fec_group_size: DEFAULT_FEC_GROUP_SIZE,
            max_packet_size: MAX_PACKET_SIZE,
        }
    }
}

impl ProtocolParams {
    /// Largest fragment payload that fits one datagram.
    pub fn max_fragment_payload(&self) -> usize {
        self.max_packet_size.saturating_sub(FRAGMENT_HEADER_SIZE)
    }

    /// Number of parity fragments protecting `video_count` video fragments.
    pub fn parity_count(&self, video_count: usize) -> usize {
        video_count.div_ceil(self.fec_group_size.max(1))
    }

    /// Range of video indices covered by parity fragment `parity_index`.
    pub fn group_range(&self, parity_index: usize, video_count: usize) -> std::ops::Range<usize> {
        let group = self.fec_group_size.max(1);
        let start = (parity_index * group).min(video_count);
        let end = ((parity_index + 1) * group).min(video_count);
        start..end
    }
}

/// Discriminant of a sender → receiver datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SenderPacketType {
    Confirm = 0,
    Heartbeat = 1,
    VideoInit = 2,
    VideoFragment = 3,
    ParityFragment = 4,
    Audio = 5,
    Floor = 6,
}

impl TryFrom<u8> for SenderPacketType {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => SenderPacketType::Confirm,
            1 => SenderPacketType::Heartbeat,
            2 => SenderPacketType::VideoInit,
            3 => SenderPacketType::VideoFragment,
            4 => SenderPacketType::ParityFragment,
            5 => SenderPacketType::Audio,
            6 => SenderPacketType::Floor,
            _ => {
                return Err(PacketError::UnknownType {
                    direction: "sender",
                    value,
                });
            }
        })
    }
}

/// Discriminant of a receiver → sender datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReceiverPacketType {
    Connect = 0,
    Heartbeat = 1,
    Report = 2,
    Request = 3,
}

impl TryFrom<u8> for ReceiverPacketType {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => ReceiverPacketType::Connect,
            1 => ReceiverPacketType::Heartbeat,
            2 => ReceiverPacketType::Report,
            3 => ReceiverPacketType::Request,
            _ => {
                return Err(PacketError::UnknownType {
                    direction: "receiver",
                    value,
                });
            }
        })
    }
}

/// XOR `src` into `dst`, growing `dst` with zeros when `src` is longer.
pub fn xor_into(dst: &mut Vec<u8>, src: &[u8]) {
    if dst.len() < src.len() {
        dst.resize(src.len(), 0);
    }
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= *s;
    }
}
