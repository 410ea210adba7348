//! Sender → receiver datagrams

use bytes::{BufMut, Bytes, BytesMut};

use super::reader::WireReader;
use super::video::FloorPlane;
use super::{HEADER_SIZE, SenderPacketType};
use crate::error::PacketError;

/// One slice of a video message, or the XOR parity of a group of slices.
///
/// For parity fragments `count` is the number of video fragments in the
/// frame, which is enough to size both fragment arrays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub frame_id: u32,
    pub index: u32,
    pub count: u32,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFragment {
    pub frame_id: u32,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SenderBody {
    /// Answer to a Connect, echoing the receiver-assigned id.
    Confirm { receiver_session_id: u32 },
    Heartbeat,
    /// Camera calibration / intrinsics, sent once per stream.
    VideoInit { calibration: Bytes },
    Video(Fragment),
    Parity(Fragment),
    Audio(AudioFragment),
    Floor(FloorPlane),
}

/// A parsed sender datagram.
#[derive(Debug, Clone, PartialEq)]
pub struct SenderPacket {
    pub session_id: u32,
    pub body: SenderBody,
}

impl SenderPacket {
    pub fn new(session_id: u32, body: SenderBody) -> Self {
        Self { session_id, body }
    }

    pub fn packet_type(&self) -> SenderPacketType {
        match self.body {
            SenderBody::Confirm { .. } => SenderPacketType::Confirm,
            SenderBody::Heartbeat => SenderPacketType::Heartbeat,
            SenderBody::VideoInit { .. } => SenderPacketType::VideoInit,
            SenderBody::Video(_) => SenderPacketType::VideoFragment,
            SenderBody::Parity(_) => SenderPacketType::ParityFragment,
            SenderBody::Audio(_) => SenderPacketType::Audio,
            SenderBody::Floor(_) => SenderPacketType::Floor,
        }
    }

    pub fn parse(datagram: Bytes) -> Result<Self, PacketError> {
        let mut reader = WireReader::new(datagram);
        let session_id = reader.read_u32("session_id")?;
        let packet_type = SenderPacketType::try_from(reader.read_u8("packet_type")?)?;

        let body = match packet_type {
            SenderPacketType::Confirm => SenderBody::Confirm {
                receiver_session_id: reader.read_u32("receiver_session_id")?,
            },
            SenderPacketType::Heartbeat => SenderBody::Heartbeat,
            SenderPacketType::VideoInit => SenderBody::VideoInit {
                calibration: reader.read_rest(),
            },
            SenderPacketType::VideoFragment => SenderBody::Video(read_fragment(&mut reader, false)?),
            SenderPacketType::ParityFragment => SenderBody::Parity(read_fragment(&mut reader, true)?),
            SenderPacketType::Audio => SenderBody::Audio(AudioFragment {
                frame_id: reader.read_u32("frame_id")?,
                payload: reader.read_rest(),
            }),
            SenderPacketType::Floor => SenderBody::Floor(FloorPlane::read(&mut reader)?),
        };

        Ok(Self { session_id, body })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.body_len());
        buf.put_u32_le(self.session_id);
        buf.put_u8(self.packet_type() as u8);

        match &self.body {
            SenderBody::Confirm {
                receiver_session_id,
            } => buf.put_u32_le(*receiver_session_id),
            SenderBody::Heartbeat => {}
            SenderBody::VideoInit { calibration } => buf.put_slice(calibration),
            SenderBody::Video(fragment) | SenderBody::Parity(fragment) => {
                buf.put_u32_le(fragment.frame_id);
                buf.put_u32_le(fragment.index);
                buf.put_u32_le(fragment.count);
                buf.put_slice(&fragment.payload);
            }
            SenderBody::Audio(audio) => {
                buf.put_u32_le(audio.frame_id);
                buf.put_slice(&audio.payload);
            }
            SenderBody::Floor(floor) => floor.write(&mut buf),
        }

        buf.freeze()
    }

    fn body_len(&self) -> usize {
        match &self.body {
            SenderBody::Confirm { .. } => 4,
            SenderBody::Heartbeat => 0,
            SenderBody::VideoInit { calibration } => calibration.len(),
            SenderBody::Video(f) | SenderBody::Parity(f) => 12 + f.payload.len(),
            SenderBody::Audio(a) => 4 + a.payload.len(),
            SenderBody::Floor(_) => 16,
        }
    }
}

/// Parity indices are bounded by the FEC group size, which only the
/// assembler knows; here only video indices are checked against the count.
fn read_fragment(reader: &mut WireReader, parity: bool) -> Result<Fragment, PacketError> {
    let frame_id = reader.read_u32("frame_id")?;
    let index = reader.read_u32("fragment_index")?;
    let count = reader.read_u32("fragment_count")?;
    if count == 0 {
        return Err(PacketError::Invalid {
            field: "fragment_count",
            reason: "frame has no fragments".to_string(),
        });
    }
    if !parity && index >= count {
        return Err(PacketError::Invalid {
            field: "fragment_index",
            reason: format!("{} out of range for {} fragments", index, count),
        });
    }
    Ok(Fragment {
        frame_id,
        index,
        count,
        payload: reader.read_rest(),
    })
}
