//! # Transcription Buffer
//!
//! Accumulates resampled audio and cuts it into fixed-duration windows for the
//! transcriber.
//!
//! ## Windowing rules:
//! - A window is emitted every time `window_seconds` of audio has accumulated
//! - Whatever is left over stays in the buffer for the next window
//! - A single large push may emit several windows at once
//! - When the stream ends, `flush()` emits the remainder only if it is at least
//!   `min_flush_seconds` long; shorter tails are discarded
//!
//! ## Ownership:
//! Each call owns exactly one buffer inside its ingest task. Windows are moved
//! out to the transcription queue, never shared, so no locking is needed here.

/// A fixed-duration slice of normalized mono samples.
#[derive(Debug, Clone)]
pub struct AudioWindow {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Position of this window in the call's stream, starting at 0
    pub sequence: u64,
    /// True for the shorter window produced by `flush()`
    pub is_flush: bool,
}

impl AudioWindow {
    pub fn duration_seconds(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Window-cutting accumulator for one call.
#[derive(Debug)]
pub struct TranscriptionBuffer {
    pending: Vec<f32>,
    sample_rate: u32,
    window_samples: usize,
    min_flush_samples: usize,
    next_sequence: u64,
}

impl TranscriptionBuffer {
    /// Create a buffer for audio at `sample_rate`.
    ///
    /// ## Calculations:
    /// For a 3 second window at 16kHz: 3.0 * 16000 = 48,000 samples per window.
    /// The 0.5 second flush minimum is 8,000 samples.
    pub fn new(sample_rate: u32, window_seconds: f64, min_flush_seconds: f64) -> Self {
        let window_samples = ((window_seconds * sample_rate as f64).round() as usize).max(1);
        let min_flush_samples = (min_flush_seconds * sample_rate as f64).round() as usize;

        Self {
            pending: Vec::with_capacity(window_samples),
            sample_rate,
            window_samples,
            min_flush_samples,
            next_sequence: 0,
        }
    }

    /// Append samples and return every window that is now complete.
    pub fn push(&mut self, samples: &[f32]) -> Vec<AudioWindow> {
        self.pending.extend_from_slice(samples);

        let mut windows = Vec::new();
        while self.pending.len() >= self.window_samples {
            let remainder = self.pending.split_off(self.window_samples);
            let full = std::mem::replace(&mut self.pending, remainder);
            windows.push(self.make_window(full, false));
        }
        windows
    }

    /// Emit the remainder at end of stream, if it is long enough to transcribe.
    ///
    /// The buffer is empty afterwards either way.
    pub fn flush(&mut self) -> Option<AudioWindow> {
        let remainder = std::mem::take(&mut self.pending);
        if remainder.is_empty() || remainder.len() < self.min_flush_samples {
            return None;
        }
        Some(self.make_window(remainder, true))
    }

    /// Duration of the audio waiting for the next window, in seconds.
    pub fn pending_seconds(&self) -> f64 {
        self.pending.len() as f64 / self.sample_rate as f64
    }

    fn make_window(&mut self, samples: Vec<f32>, is_flush: bool) -> AudioWindow {
        let window = AudioWindow {
            samples,
            sample_rate: self.sample_rate,
            sequence: self.next_sequence,
            is_flush,
        };
        self.next_sequence += 1;
        window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 16000;

    fn ramp(start: usize, len: usize) -> Vec<f32> {
        (start..start + len).map(|i| (i % 1000) as f32 / 1000.0).collect()
    }

    #[test]
    fn test_five_seconds_in_three_chunks_gives_two_windows() {
        let mut buffer = TranscriptionBuffer::new(RATE, 3.0, 0.5);
        let chunks = [RATE as usize * 2, RATE as usize * 2, RATE as usize];

        let mut windows = Vec::new();
        let mut offset = 0;
        for len in chunks {
            windows.extend(buffer.push(&ramp(offset, len)));
            offset += len;
        }
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].duration_seconds(), 3.0);

        let tail = buffer.flush().expect("2s remainder should be flushed");
        assert!(tail.is_flush);
        assert!(tail.duration_seconds() <= 3.0);
        assert_eq!(tail.duration_seconds(), 2.0);
        windows.push(tail);

        assert_eq!(windows.len(), 2);
        assert_eq!(windows[1].sequence, 1);
    }

    #[test]
    fn test_windows_and_flush_reproduce_the_stream() {
        let mut buffer = TranscriptionBuffer::new(RATE, 3.0, 0.5);
        let stream = ramp(0, RATE as usize * 7 + 12_345);

        let mut rebuilt = Vec::new();
        for chunk in stream.chunks(7_777) {
            for window in buffer.push(chunk) {
                rebuilt.extend(window.samples);
            }
        }
        if let Some(tail) = buffer.flush() {
            rebuilt.extend(tail.samples);
        }

        assert_eq!(rebuilt, stream);
    }

    #[test]
    fn test_large_push_emits_multiple_windows() {
        let mut buffer = TranscriptionBuffer::new(RATE, 3.0, 0.5);
        let windows = buffer.push(&ramp(0, RATE as usize * 10));
        assert_eq!(windows.len(), 3);
        assert_eq!(buffer.pending_seconds(), 1.0);
        assert_eq!(
            windows.iter().map(|w| w.sequence).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn test_short_remainder_is_discarded_on_flush() {
        let mut buffer = TranscriptionBuffer::new(RATE, 3.0, 0.5);
        assert!(buffer.push(&ramp(0, RATE as usize / 4)).is_empty());
        assert!(buffer.flush().is_none());
        assert_eq!(buffer.pending_seconds(), 0.0);
    }

    #[test]
    fn test_flush_on_empty_buffer() {
        let mut buffer = TranscriptionBuffer::new(RATE, 3.0, 0.0);
        assert!(buffer.flush().is_none());
    }
}
