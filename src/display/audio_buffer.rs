//! Fixed-capacity ring buffer for decoded PCM
//!
//! The audio feed writes decoded frames from the receive loop and the audio
//! output callback drains them, with no lock between the two.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Single-producer / single-consumer ring of `f32` samples.
///
/// One slot is always left empty so that `read_pos == write_pos` means
/// "empty". The writer never overwrites unread samples: when the ring is full
/// the excess is dropped and `write` reports how much was taken. The reader
/// pads with silence on underrun.
pub struct AudioRingBuffer {
    slots: Box<[UnsafeCell<f32>]>,
    write_pos: AtomicUsize,
    read_pos: AtomicUsize,
}

// Safety: the producer only touches slots in [write_pos, read_pos) and the
// consumer only touches slots in [read_pos, write_pos); the positions are
// published with release/acquire ordering, so the two regions never overlap.
unsafe impl Send for AudioRingBuffer {}
unsafe impl Sync for AudioRingBuffer {}

impl std::fmt::Debug for AudioRingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioRingBuffer")
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .finish()
    }
}

impl AudioRingBuffer {
    /// Create a ring holding up to `capacity - 1` samples.
    ///
    /// For stereo 48kHz with 100ms of buffering:
    /// capacity = 48000 * 2 * 0.1 = 9600 samples
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            slots: (0..capacity).map(|_| UnsafeCell::new(0.0)).collect(),
            write_pos: AtomicUsize::new(0),
            read_pos: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of samples waiting to be read.
    pub fn available(&self) -> usize {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);
        if write >= read {
            write - read
        } else {
            self.capacity() - read + write
        }
    }

    /// Number of samples that can be written without dropping any.
    pub fn free_space(&self) -> usize {
        self.capacity() - 1 - self.available()
    }

    /// Write samples, returning how many were accepted. Producer side only.
    pub fn write(&self, samples: &[f32]) -> usize {
        let write = self.write_pos.load(Ordering::Relaxed);
        let to_write = samples.len().min(self.free_space());
        if to_write == 0 {
            return 0;
        }

        let capacity = self.capacity();
        for (i, &sample) in samples[..to_write].iter().enumerate() {
            // SAFETY: slot lies in the free region owned by the producer.
            unsafe { *self.slots[(write + i) % capacity].get() = sample };
        }

        self.write_pos
            .store((write + to_write) % capacity, Ordering::Release);
        to_write
    }

    /// Fill `output`, padding with silence. Returns the number of real
    /// samples read. Consumer side only.
    pub fn read(&self, output: &mut [f32]) -> usize {
        let read = self.read_pos.load(Ordering::Relaxed);
        let to_read = output.len().min(self.available());

        let capacity = self.capacity();
        for (i, sample) in output[..to_read].iter_mut().enumerate() {
            // SAFETY: slot lies in the filled region owned by the consumer.
            *sample = unsafe { *self.slots[(read + i) % capacity].get() };
        }
        output[to_read..].fill(0.0);

        if to_read > 0 {
            self.read_pos
                .store((read + to_read) % capacity, Ordering::Release);
        }
        to_read
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_write_read() {
        let buf = AudioRingBuffer::new(1024);

        let samples = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(buf.write(&samples), 4);
        assert_eq!(buf.available(), 4);
        assert_eq!(buf.free_space(), 1019);

        let mut output = [0.0f32; 4];
        assert_eq!(buf.read(&mut output), 4);
        assert_eq!(output, [1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_underrun_silence() {
        let buf = AudioRingBuffer::new(1024);
        buf.write(&[1.0, 2.0]);

        let mut output = [9.0f32; 4];
        assert_eq!(buf.read(&mut output), 2);
        assert_eq!(output, [1.0, 2.0, 0.0, 0.0]);
    }

    #[test]
    fn test_full_ring_drops_excess() {
        let buf = AudioRingBuffer::new(5);
        assert_eq!(buf.write(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]), 4);
        assert_eq!(buf.free_space(), 0);
        assert_eq!(buf.write(&[7.0]), 0);

        let mut output = [0.0f32; 6];
        assert_eq!(buf.read(&mut output), 4);
        assert_eq!(output[..4], [1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_wrap_around() {
        let buf = AudioRingBuffer::new(8);
        buf.write(&[1.0, 2.0, 3.0, 4.0, 5.0]);

        let mut out = [0.0f32; 3];
        buf.read(&mut out);
        assert_eq!(out, [1.0, 2.0, 3.0]);

        assert_eq!(buf.write(&[6.0, 7.0, 8.0, 9.0]), 4);

        let mut out2 = [0.0f32; 6];
        assert_eq!(buf.read(&mut out2), 6);
        assert_eq!(out2, [4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
    }

    #[test]
    fn test_concurrent_access() {
        use std::sync::Arc;
        use std::thread;
        use std::time::Duration;

        let buf = Arc::new(AudioRingBuffer::new(4800));
        let buf_writer = buf.clone();
        let buf_reader = buf.clone();

        let writer = thread::spawn(move || {
            let samples: Vec<f32> = (0..48000).map(|i| i as f32).collect();
            let mut total_written = 0;
            for chunk in samples.chunks(480) {
                total_written += buf_writer.write(chunk);
                thread::sleep(Duration::from_micros(100));
            }
            total_written
        });

        let reader = thread::spawn(move || {
            let mut total_read = 0;
            let mut last = -1.0f32;
            let mut output = [0.0f32; 480];
            for _ in 0..200 {
                let n = buf_reader.read(&mut output);
                for &sample in &output[..n] {
                    // Samples come out in the order they went in.
                    assert!(sample > last);
                    last = sample;
                }
                total_read += n;
                thread::sleep(Duration::from_micros(200));
            }
            total_read
        });

        let written = writer.join().unwrap();
        let read = reader.join().unwrap();

        assert!(written > 0);
        assert!(read > 0);
        assert!(read <= written);
    }
}
