//! Per-stream segment transcoder.
//!
//! [`FrameCodec`] chains the demux, decode, resample and encode stages for one
//! segment at a time. It holds no threads of its own; the stream controller calls
//! it synchronously from its fetch loop.

use crate::config::TranscodeConfig;
use crate::decode::{AacDecoder, DecodedFrame, FrameDecoder};
use crate::demux::{SegmentDemuxer, TsDemuxer};
use crate::encode::{FrameEncoder, FrameEncoding, build_encoder, split_padded};
use crate::error::CodecError;
use crate::resample::{remix_channels, resample_linear};

/// Stateful demuxer/decoder/encoder chain for one stream.
pub struct FrameCodec {
    config: TranscodeConfig,
    demuxer: Box<dyn SegmentDemuxer>,
    decoder: Box<dyn FrameDecoder>,
    encoder: Box<dyn FrameEncoder>,
    closed: bool,
}

impl FrameCodec {
    pub fn new(
        config: TranscodeConfig,
        demuxer: Box<dyn SegmentDemuxer>,
        decoder: Box<dyn FrameDecoder>,
        encoder: Box<dyn FrameEncoder>,
    ) -> Self {
        Self {
            config,
            demuxer,
            decoder,
            encoder,
            closed: false,
        }
    }

    /// Transport-stream AAC in, `encoding` transport frames out.
    pub fn with_defaults(config: TranscodeConfig, encoding: FrameEncoding) -> Result<Self, CodecError> {
        let encoder = build_encoder(encoding, &config)?;
        Ok(Self::new(
            config,
            Box::new(TsDemuxer),
            Box::new(AacDecoder::new()),
            encoder,
        ))
    }

    pub fn config(&self) -> &TranscodeConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn extract_compressed_frames(&mut self, segment: &[u8]) -> Result<Vec<Vec<u8>>, CodecError> {
        self.ensure_open()?;
        self.demuxer.extract_frames(segment)
    }

    pub fn decode(&mut self, frame: &[u8]) -> Result<Option<DecodedFrame>, CodecError> {
        self.ensure_open()?;
        self.decoder.decode(frame)
    }

    /// Resample interleaved transport-layout samples from `source_rate` to the transport rate.
    pub fn resample(&self, samples: &[f32], source_rate: u32) -> Vec<f32> {
        resample_linear(samples, self.config.channels, source_rate, self.config.sample_rate)
    }

    /// Slice into transport frames (zero-padding the tail) and encode each one.
    pub fn encode(&mut self, samples: &[f32]) -> Result<Vec<Vec<u8>>, CodecError> {
        self.ensure_open()?;
        split_padded(samples, self.config.samples_per_frame())
            .iter()
            .map(|pcm| self.encoder.encode(pcm))
            .collect()
    }

    /// Turn one container segment into ordered transport frames.
    ///
    /// Frames that fail to decode are dropped; the segment only fails when no
    /// samples survive at all.
    pub fn process_segment(&mut self, segment: &[u8]) -> Result<Vec<Vec<u8>>, CodecError> {
        let frames = self.extract_compressed_frames(segment)?;
        let total = frames.len();

        let mut pcm = Vec::new();
        let mut run = Vec::new();
        let mut run_rate: Option<u32> = None;
        let mut dropped = 0usize;

        for frame in &frames {
            let decoded = match self.decode(frame) {
                Ok(Some(decoded)) => decoded,
                Ok(None) => continue,
                Err(CodecError::Closed) => return Err(CodecError::Closed),
                Err(err) => {
                    dropped += 1;
                    tracing::debug!(error = %err, "dropping undecodable frame");
                    continue;
                }
            };
            if run_rate != Some(decoded.sample_rate) {
                if let Some(rate) = run_rate {
                    pcm.extend(self.resample(&run, rate));
                    run.clear();
                }
                run_rate = Some(decoded.sample_rate);
            }
            run.extend(remix_channels(
                &decoded.samples,
                decoded.channels,
                self.config.channels,
            ));
        }
        if let Some(rate) = run_rate {
            pcm.extend(self.resample(&run, rate));
        }

        if dropped > 0 {
            tracing::debug!(dropped, total, "segment decoded with dropped frames");
        }
        if pcm.is_empty() {
            return Err(CodecError::NoSamples);
        }
        self.encode(&pcm)
    }

    /// Release decoder and encoder. Later calls are no-ops.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.decoder.close();
        self.encoder.close();
    }

    fn ensure_open(&self) -> Result<(), CodecError> {
        if self.closed {
            Err(CodecError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Drop for FrameCodec {
    fn drop(&mut self) {
        self.close();
    }
}

/// Builds a fresh [`FrameCodec`] for every stream.
pub trait CodecFactory: Send + Sync {
    fn create(&self) -> Result<FrameCodec, CodecError>;
}

/// Factory for [`FrameCodec::with_defaults`].
#[derive(Clone, Debug, Default)]
pub struct DefaultCodecFactory {
    config: TranscodeConfig,
    encoding: FrameEncoding,
}

impl DefaultCodecFactory {
    /// Opus-encoding factory.
    pub fn new(config: TranscodeConfig) -> Self {
        Self::with_encoding(config, FrameEncoding::default())
    }

    pub fn with_encoding(config: TranscodeConfig, encoding: FrameEncoding) -> Self {
        Self { config, encoding }
    }

    pub fn encoding(&self) -> FrameEncoding {
        self.encoding
    }
}

impl CodecFactory for DefaultCodecFactory {
    fn create(&self) -> Result<FrameCodec, CodecError> {
        FrameCodec::with_defaults(self.config.clone(), self.encoding)
    }
}
