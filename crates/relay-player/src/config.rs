use std::time::Duration;

/// Transport encoding parameters shared by the codec and stream controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TranscodeConfig {
    /// Transport sample rate in Hz.
    pub sample_rate: u32,
    /// Transport channel count.
    pub channels: usize,
    /// Duration of one transport frame in milliseconds.
    pub frame_duration_ms: u32,
    /// Target encoder bitrate in bits per second.
    pub bitrate_bps: u32,
    /// Upper bound for one encoded frame in bytes.
    pub max_packet_bytes: usize,
}

impl Default for TranscodeConfig {
    /// Voice transport defaults: 48 kHz stereo, 20 ms frames.
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            frame_duration_ms: 20,
            bitrate_bps: 128_000,
            max_packet_bytes: 4_000,
        }
    }
}

impl TranscodeConfig {
    /// Samples per channel in one transport frame.
    pub fn frame_size(&self) -> usize {
        (self.sample_rate as usize * self.frame_duration_ms as usize) / 1000
    }

    /// Interleaved samples (all channels) in one transport frame.
    pub fn samples_per_frame(&self) -> usize {
        self.frame_size() * self.channels
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.frame_duration_ms as u64)
    }

    /// Frame channel capacity: roughly one second of audio.
    pub fn buffer_frames(&self) -> usize {
        (1000 / self.frame_duration_ms.max(1) as usize).max(1)
    }
}
