use anyhow::{Result, bail};

use super::AudioDecoder;

const I16_TO_F32: f32 = 1.0 / 32768.0;

/// Decoder for uncompressed interleaved `i16` little-endian PCM.
pub struct PcmDecoder {
    samples_per_frame: usize,
}

impl PcmDecoder {
    /// `samples_per_frame` counts every channel, e.g. 960 for 10ms of
    /// 48kHz stereo.
    pub fn new(samples_per_frame: usize) -> Self {
        Self { samples_per_frame }
    }
}

impl AudioDecoder for PcmDecoder {
    fn samples_per_frame(&self) -> usize {
        self.samples_per_frame
    }

    fn decode(&mut self, payload: &[u8]) -> Result<Vec<f32>> {
        if payload.len() % 2 != 0 {
            bail!("odd PCM payload length {}", payload.len());
        }
        if payload.len() / 2 > self.samples_per_frame {
            bail!(
                "PCM payload holds {} samples, frame is {}",
                payload.len() / 2,
                self.samples_per_frame
            );
        }

        let mut samples: Vec<f32> = payload
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 * I16_TO_F32)
            .collect();
        // A short frame is padded with silence so every frame has the same length.
        samples.resize(self.samples_per_frame, 0.0);
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decodes_and_pads() {
        let mut decoder = PcmDecoder::new(4);
        let payload: Vec<u8> = [i16::MIN, 16384]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let samples = decoder.decode(&payload).unwrap();
        assert_eq!(samples, vec![-1.0, 0.5, 0.0, 0.0]);
    }

    #[test]
    fn test_rejects_bad_payloads() {
        let mut decoder = PcmDecoder::new(2);
        assert!(decoder.decode(&[0, 1, 2]).is_err());
        assert!(decoder.decode(&[0; 6]).is_err());
    }
}
