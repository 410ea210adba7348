//! Consumer-facing buffers for decoded media

pub mod audio_buffer;

pub use audio_buffer::AudioRingBuffer;
