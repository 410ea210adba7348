//! Orders audio fragments and streams decoded PCM into the playback ring

use std::sync::Arc;

use log::debug;

use crate::decoder::AudioDecoder;
use crate::display::AudioRingBuffer;
use crate::pipeline::health::SessionHealth;
use crate::protocol::AudioFragment;

/// Feeds decoded audio into a fixed-capacity ring, in frame id order.
///
/// Nothing is queued between calls: fragments that arrive too late, or that
/// do not fit in the ring this tick, are lost and heard as a short gap.
pub struct AudioOrderingFeed {
    decoder: Box<dyn AudioDecoder>,
    ring: Arc<AudioRingBuffer>,
    last_decoded: Option<u32>,
    health: Arc<SessionHealth>,
}

impl AudioOrderingFeed {
    pub fn new(
        decoder: Box<dyn AudioDecoder>,
        ring: Arc<AudioRingBuffer>,
        health: Arc<SessionHealth>,
    ) -> Self {
        Self {
            decoder,
            ring,
            last_decoded: None,
            health,
        }
    }

    /// Ring the consumer drains PCM from.
    pub fn ring(&self) -> &Arc<AudioRingBuffer> {
        &self.ring
    }

    pub fn last_decoded(&self) -> Option<u32> {
        self.last_decoded
    }

    /// Decode as much of `fragments` as the ring has room for.
    /// Returns the number of frames written.
    pub fn feed(&mut self, mut fragments: Vec<AudioFragment>) -> usize {
        fragments.sort_by_key(|f| f.frame_id);

        let frame_samples = self.decoder.samples_per_frame().max(1);
        let mut written = 0;
        let mut pending = fragments.into_iter();

        for fragment in pending.by_ref() {
            if self.last_decoded.is_some_and(|last| fragment.frame_id <= last) {
                continue;
            }
            if self.ring.free_space() < frame_samples {
                SessionHealth::incr(&self.health.audio_dropped);
                break;
            }

            self.last_decoded = Some(fragment.frame_id);
            match self.decoder.decode(&fragment.payload) {
                Ok(samples) => {
                    self.ring.write(&samples);
                    SessionHealth::incr(&self.health.audio_decoded);
                    written += 1;
                }
                Err(e) => {
                    debug!("audio frame {}: decode failed: {}", fragment.frame_id, e);
                    SessionHealth::incr(&self.health.audio_dropped);
                }
            }
        }

        let skipped = pending
            .filter(|f| self.last_decoded.is_none_or(|last| f.frame_id > last))
            .count();
        if skipped > 0 {
            debug!("audio ring full, dropped {} frame(s)", skipped + 1);
            SessionHealth::add(&self.health.audio_dropped, skipped as u64);
        }

        written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::PcmDecoder;
    use bytes::Bytes;

    const FRAME: usize = 4;

    fn fragment(frame_id: u32, value: i16) -> AudioFragment {
        let payload: Vec<u8> = std::iter::repeat_n(value, FRAME)
            .flat_map(|s| s.to_le_bytes())
            .collect();
        AudioFragment {
            frame_id,
            payload: Bytes::from(payload),
        }
    }

    fn feed(capacity: usize) -> AudioOrderingFeed {
        AudioOrderingFeed::new(
            Box::new(PcmDecoder::new(FRAME)),
            Arc::new(AudioRingBuffer::new(capacity)),
            Arc::new(SessionHealth::new()),
        )
    }

    #[test]
    fn test_sorted_by_frame_id() {
        let mut feed = feed(64);
        let written = feed.feed(vec![fragment(3, 300), fragment(1, 100), fragment(2, 200)]);
        assert_eq!(written, 3);
        assert_eq!(feed.last_decoded(), Some(3));

        let mut out = [0.0f32; 12];
        feed.ring().read(&mut out);
        let firsts: Vec<f32> = out.chunks(FRAME).map(|c| c[0] * 32768.0).collect();
        assert_eq!(firsts, vec![100.0, 200.0, 300.0]);
    }

    #[test]
    fn test_stale_and_duplicates_skipped() {
        let mut feed = feed(64);
        feed.feed(vec![fragment(5, 1)]);
        let written = feed.feed(vec![fragment(4, 1), fragment(5, 1), fragment(6, 1), fragment(6, 1)]);
        assert_eq!(written, 1);
        assert_eq!(feed.ring().available(), 2 * FRAME);
    }

    #[test]
    fn test_backpressure_drops_without_overrun() {
        // 18 slots -> 17 free samples -> room for 4 frames of 4.
        let mut feed = feed(18);
        let free = feed.ring().free_space();
        let batch: Vec<AudioFragment> = (1..=10).map(|id| fragment(id, 7)).collect();

        let written = feed.feed(batch);
        assert_eq!(written, free / FRAME);
        assert_eq!(feed.ring().available(), written * FRAME);
        assert_eq!(feed.last_decoded(), Some(written as u32));
        assert_eq!(
            feed.health.audio_dropped.load(std::sync::atomic::Ordering::Relaxed),
            10 - written as u64
        );

        // Dropped frames are gone: after draining, the next batch starts fresh.
        let mut sink = [0.0f32; 32];
        feed.ring().read(&mut sink);
        assert_eq!(feed.feed(vec![fragment(5, 7)]), 1);
        assert_eq!(feed.feed(vec![fragment(5, 7)]), 0);
    }

    #[test]
    fn test_decode_failure_skips_frame() {
        let mut feed = feed(64);
        let bad = AudioFragment {
            frame_id: 1,
            payload: Bytes::from_static(&[1, 2, 3]),
        };
        assert_eq!(feed.feed(vec![bad, fragment(2, 1)]), 1);
        assert_eq!(feed.last_decoded(), Some(2));
    }
}
