//! Transport frame encode stage.
//!
//! Opus is the transport codec; raw PCM stays available for debugging and for
//! sinks that do their own encoding.

use crate::config::TranscodeConfig;
use crate::error::CodecError;

/// Which encoder the default codec chain uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FrameEncoding {
    #[default]
    Opus,
    Pcm,
}

impl FrameEncoding {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "opus" => Some(Self::Opus),
            "pcm" => Some(Self::Pcm),
            _ => None,
        }
    }
}

/// Build the encoder for `encoding` from the transport settings.
pub fn build_encoder(
    encoding: FrameEncoding,
    config: &TranscodeConfig,
) -> Result<Box<dyn FrameEncoder>, CodecError> {
    match encoding {
        FrameEncoding::Pcm => Ok(Box::new(PcmFrameEncoder::new(
            config.bitrate_bps,
            config.max_packet_bytes,
        ))),
        #[cfg(feature = "opus")]
        FrameEncoding::Opus => Ok(Box::new(OpusFrameEncoder::new(config)?)),
        #[cfg(not(feature = "opus"))]
        FrameEncoding::Opus => Err(CodecError::Encode(
            "built without the `opus` feature".to_string(),
        )),
    }
}

/// Encodes one fixed-size block of interleaved samples into a transport frame.
pub trait FrameEncoder: Send {
    fn encode(&mut self, pcm: &[f32]) -> Result<Vec<u8>, CodecError>;

    /// Release encoder resources. Must tolerate repeated calls.
    fn close(&mut self) {}
}

/// Packs samples as signed 16-bit little-endian PCM. The bitrate is only reported.
#[derive(Debug, Clone)]
pub struct PcmFrameEncoder {
    bitrate_bps: u32,
    max_packet_bytes: usize,
}

impl PcmFrameEncoder {
    pub fn new(bitrate_bps: u32, max_packet_bytes: usize) -> Self {
        Self {
            bitrate_bps,
            max_packet_bytes,
        }
    }

    pub fn bitrate_bps(&self) -> u32 {
        self.bitrate_bps
    }
}

impl FrameEncoder for PcmFrameEncoder {
    fn encode(&mut self, pcm: &[f32]) -> Result<Vec<u8>, CodecError> {
        let len = pcm.len() * 2;
        if len > self.max_packet_bytes {
            return Err(CodecError::Encode(format!(
                "frame of {len} bytes exceeds packet limit {}",
                self.max_packet_bytes
            )));
        }
        let mut out = Vec::with_capacity(len);
        for sample in pcm {
            let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            out.extend_from_slice(&value.to_le_bytes());
        }
        Ok(out)
    }
}

/// Opus encoder over libopus, one packet per transport frame.
#[cfg(feature = "opus")]
pub struct OpusFrameEncoder {
    encoder: Option<audiopus::coder::Encoder>,
    frame_samples: usize,
    packet: Vec<u8>,
}

#[cfg(feature = "opus")]
impl OpusFrameEncoder {
    pub fn new(config: &TranscodeConfig) -> Result<Self, CodecError> {
        use audiopus::{Application, Bitrate, Channels, SampleRate};

        let rate = match config.sample_rate {
            8_000 => SampleRate::Hz8000,
            12_000 => SampleRate::Hz12000,
            16_000 => SampleRate::Hz16000,
            24_000 => SampleRate::Hz24000,
            48_000 => SampleRate::Hz48000,
            other => {
                return Err(CodecError::Encode(format!(
                    "opus cannot encode at {other} Hz"
                )));
            }
        };
        let channels = match config.channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            other => {
                return Err(CodecError::Encode(format!(
                    "opus cannot encode {other} channels"
                )));
            }
        };
        if ![5, 10, 20, 40, 60].contains(&config.frame_duration_ms) {
            return Err(CodecError::Encode(format!(
                "opus frames cannot last {} ms",
                config.frame_duration_ms
            )));
        }

        let mut encoder = audiopus::coder::Encoder::new(rate, channels, Application::Audio)
            .map_err(|err| CodecError::Encode(err.to_string()))?;
        let bitrate = i32::try_from(config.bitrate_bps)
            .map_err(|_| CodecError::Encode(format!("bitrate {} too large", config.bitrate_bps)))?;
        encoder
            .set_bitrate(Bitrate::BitsPerSecond(bitrate))
            .map_err(|err| CodecError::Encode(err.to_string()))?;
        Ok(Self {
            encoder: Some(encoder),
            frame_samples: config.samples_per_frame(),
            packet: vec![0; config.max_packet_bytes],
        })
    }
}

#[cfg(feature = "opus")]
impl FrameEncoder for OpusFrameEncoder {
    fn encode(&mut self, pcm: &[f32]) -> Result<Vec<u8>, CodecError> {
        let encoder = self.encoder.as_ref().ok_or(CodecError::Closed)?;
        if pcm.len() != self.frame_samples {
            return Err(CodecError::Encode(format!(
                "expected {} samples per frame, got {}",
                self.frame_samples,
                pcm.len()
            )));
        }
        let len = encoder
            .encode_float(pcm, &mut self.packet)
            .map_err(|err| CodecError::Encode(err.to_string()))?;
        Ok(self.packet[..len].to_vec())
    }

    fn close(&mut self) {
        self.encoder = None;
    }
}

/// Split interleaved samples into `frame_len`-sample blocks, zero-padding the last one.
pub fn split_padded(samples: &[f32], frame_len: usize) -> Vec<Vec<f32>> {
    if frame_len == 0 {
        return Vec::new();
    }
    samples
        .chunks(frame_len)
        .map(|chunk| {
            let mut frame = chunk.to_vec();
            frame.resize(frame_len, 0.0);
            frame
        })
        .collect()
}
