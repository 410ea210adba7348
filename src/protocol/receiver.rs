//! Receiver → sender control datagrams

use bytes::{BufMut, Bytes, BytesMut};

use super::reader::WireReader;
use super::{HEADER_SIZE, ReceiverPacketType};
use crate::error::PacketError;

/// Decoder-side timing attached to a Report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameTiming {
    pub decoder_time_ms: f32,
    pub frame_time_ms: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReceiverBody {
    Connect {
        video_requested: bool,
        audio_requested: bool,
    },
    Heartbeat,
    /// Acknowledges the highest fully assembled frame.
    Report {
        frame_id: u32,
        timing: Option<FrameTiming>,
    },
    /// Asks for specific fragments of one frame to be sent again.
    Request {
        frame_id: u32,
        all_packets: bool,
        video_indices: Vec<u32>,
        parity_indices: Vec<u32>,
    },
}

/// A receiver datagram, addressed with the receiver-assigned session id.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiverPacket {
    pub session_id: u32,
    pub body: ReceiverBody,
}

impl ReceiverPacket {
    pub fn connect(session_id: u32, video_requested: bool, audio_requested: bool) -> Self {
        Self {
            session_id,
            body: ReceiverBody::Connect {
                video_requested,
                audio_requested,
            },
        }
    }

    pub fn heartbeat(session_id: u32) -> Self {
        Self {
            session_id,
            body: ReceiverBody::Heartbeat,
        }
    }

    pub fn report(session_id: u32, frame_id: u32, timing: Option<FrameTiming>) -> Self {
        Self {
            session_id,
            body: ReceiverBody::Report { frame_id, timing },
        }
    }

    pub fn request(
        session_id: u32,
        frame_id: u32,
        video_indices: Vec<u32>,
        parity_indices: Vec<u32>,
    ) -> Self {
        Self {
            session_id,
            body: ReceiverBody::Request {
                frame_id,
                all_packets: false,
                video_indices,
                parity_indices,
            },
        }
    }

    pub fn packet_type(&self) -> ReceiverPacketType {
        match self.body {
            ReceiverBody::Connect { .. } => ReceiverPacketType::Connect,
            ReceiverBody::Heartbeat => ReceiverPacketType::Heartbeat,
            ReceiverBody::Report { .. } => ReceiverPacketType::Report,
            ReceiverBody::Request { .. } => ReceiverPacketType::Request,
        }
    }

    pub fn parse(datagram: Bytes) -> Result<Self, PacketError> {
        let mut reader = WireReader::new(datagram);
        let session_id = reader.read_u32("session_id")?;
        let packet_type = ReceiverPacketType::try_from(reader.read_u8("packet_type")?)?;

        let body = match packet_type {
            ReceiverPacketType::Connect => ReceiverBody::Connect {
                video_requested: reader.read_bool("video_requested")?,
                audio_requested: reader.read_bool("audio_requested")?,
            },
            ReceiverPacketType::Heartbeat => ReceiverBody::Heartbeat,
            ReceiverPacketType::Report => {
                let frame_id = reader.read_u32("frame_id")?;
                let timing = if reader.read_bool("has_timing")? {
                    Some(FrameTiming {
                        decoder_time_ms: reader.read_f32("decoder_time_ms")?,
                        frame_time_ms: reader.read_f32("frame_time_ms")?,
                    })
                } else {
                    None
                };
                ReceiverBody::Report { frame_id, timing }
            }
            ReceiverPacketType::Request => {
                let frame_id = reader.read_u32("frame_id")?;
                let all_packets = reader.read_bool("all_packets")?;
                let video_count = reader.read_len("video_count")?;
                let parity_count = reader.read_len("parity_count")?;
                let video_indices = reader.read_u32_list("video_indices", video_count)?;
                let parity_indices = reader.read_u32_list("parity_indices", parity_count)?;
                ReceiverBody::Request {
                    frame_id,
                    all_packets,
                    video_indices,
                    parity_indices,
                }
            }
        };

        Ok(Self { session_id, body })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + 16);
        buf.put_u32_le(self.session_id);
        buf.put_u8(self.packet_type() as u8);

        match &self.body {
            ReceiverBody::Connect {
                video_requested,
                audio_requested,
            } => {
                buf.put_u8(*video_requested as u8);
                buf.put_u8(*audio_requested as u8);
            }
            ReceiverBody::Heartbeat => {}
            ReceiverBody::Report { frame_id, timing } => {
                buf.put_u32_le(*frame_id);
                match timing {
                    Some(timing) => {
                        buf.put_u8(1);
                        buf.put_f32_le(timing.decoder_time_ms);
                        buf.put_f32_le(timing.frame_time_ms);
                    }
                    None => buf.put_u8(0),
                }
            }
            ReceiverBody::Request {
                frame_id,
                all_packets,
                video_indices,
                parity_indices,
            } => {
                buf.reserve(4 * (video_indices.len() + parity_indices.len()));
                buf.put_u32_le(*frame_id);
                buf.put_u8(*all_packets as u8);
                buf.put_u32_le(video_indices.len() as u32);
                buf.put_u32_le(parity_indices.len() as u32);
                for index in video_indices.iter().chain(parity_indices) {
                    buf.put_u32_le(*index);
                }
            }
        }

        buf.freeze()
    }
}
