//! The application-level video message carried by a run of fragments

use bytes::{BufMut, Bytes, BytesMut};

use super::reader::WireReader;
use crate::error::PacketError;

/// Floor plane `a*x + b*y + c*z + d = 0` in camera space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FloorPlane {
    pub a: f32,
    pub b: f32,
    pub c: f32,
    pub d: f32,
}

impl FloorPlane {
    pub(crate) fn read(reader: &mut WireReader) -> Result<Self, PacketError> {
        Ok(Self {
            a: reader.read_f32("floor.a")?,
            b: reader.read_f32("floor.b")?,
            c: reader.read_f32("floor.c")?,
            d: reader.read_f32("floor.d")?,
        })
    }

    pub(crate) fn write(&self, buf: &mut BytesMut) {
        buf.put_f32_le(self.a);
        buf.put_f32_le(self.b);
        buf.put_f32_le(self.c);
        buf.put_f32_le(self.d);
    }
}

/// One complete video message: encoded color and depth for a single capture.
///
/// Layout: `timestamp_ms: f32`, `keyframe: u8`, `color_len: u32` + bytes,
/// `depth_len: u32` + bytes, `has_floor: u8` (+ 4 × `f32`),
/// `has_calibration: u8` (+ `u32` length + bytes). Anything after the last
/// field is ignored, since an XOR-recovered tail fragment is zero-padded.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    pub timestamp_ms: f32,
    pub keyframe: bool,
    pub color: Bytes,
    pub depth: Bytes,
    pub floor: Option<FloorPlane>,
    pub calibration: Option<Bytes>,
}

impl VideoFrame {
    pub fn parse(message: Bytes) -> Result<Self, PacketError> {
        let mut reader = WireReader::new(message);
        let timestamp_ms = reader.read_f32("timestamp_ms")?;
        let keyframe = reader.read_bool("keyframe")?;
        let color = reader.read_prefixed("color")?;
        let depth = reader.read_prefixed("depth")?;
        let floor = if reader.read_bool("has_floor")? {
            Some(FloorPlane::read(&mut reader)?)
        } else {
            None
        };
        let calibration = if reader.read_bool("has_calibration")? {
            Some(reader.read_prefixed("calibration")?)
        } else {
            None
        };

        Ok(Self {
            timestamp_ms,
            keyframe,
            color,
            depth,
            floor,
            calibration,
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        let calibration_len = self.calibration.as_ref().map_or(0, |c| 4 + c.len());
        let mut buf =
            BytesMut::with_capacity(4 + 1 + 8 + self.color.len() + self.depth.len() + 18 + calibration_len);

        buf.put_f32_le(self.timestamp_ms);
        buf.put_u8(self.keyframe as u8);
        buf.put_u32_le(self.color.len() as u32);
        buf.put_slice(&self.color);
        buf.put_u32_le(self.depth.len() as u32);
        buf.put_slice(&self.depth);

        match &self.floor {
            Some(floor) => {
                buf.put_u8(1);
                floor.write(&mut buf);
            }
            None => buf.put_u8(0),
        }

        match &self.calibration {
            Some(calibration) => {
                buf.put_u8(1);
                buf.put_u32_le(calibration.len() as u32);
                buf.put_slice(calibration);
            }
            None => buf.put_u8(0),
        }

        buf.freeze()
    }
}
