//! Decoder boundary
//!
//! Codec internals live outside this crate. The receive loop only needs
//! "encoded bytes in, PCM out" for audio; video payloads are handed to the
//! consumer still encoded.

mod pcm;

pub use pcm::PcmDecoder;

/// Decodes one audio fragment into interleaved `f32` samples.
pub trait AudioDecoder: Send + Sync {
    /// Samples (all channels) produced by one decoded frame.
    fn samples_per_frame(&self) -> usize;

    fn decode(&mut self, payload: &[u8]) -> anyhow::Result<Vec<f32>>;
}
