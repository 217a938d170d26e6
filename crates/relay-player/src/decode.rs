//! Compressed frame decode stage.
//!
//! [`AacDecoder`] feeds ADTS frames to Symphonia's AAC decoder one packet at a
//! time. The decoder is (re)built lazily from the first header it sees and
//! whenever the stream parameters change mid-segment.

use symphonia::core::audio::{AudioBufferRef, Channels, SampleBuffer};
use symphonia::core::codecs::{CODEC_TYPE_AAC, CodecParameters, Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::Packet;

use crate::demux::AdtsHeader;
use crate::error::CodecError;

/// Samples produced by decoding one compressed frame, at the frame's native format.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedFrame {
    /// Interleaved samples.
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: usize,
}

/// Decodes single compressed frames to raw samples.
///
/// `Ok(None)` means the decoder needs more input before it can emit samples.
pub trait FrameDecoder: Send {
    fn decode(&mut self, frame: &[u8]) -> Result<Option<DecodedFrame>, CodecError>;

    /// Release decoder resources. Must tolerate repeated calls.
    fn close(&mut self) {}
}

/// Stream parameters the active Symphonia decoder was built for.
#[derive(Clone, Copy, PartialEq, Eq)]
struct StreamKey {
    profile: u8,
    sample_rate_index: u8,
    channel_config: u8,
}

/// AAC decoder for ADTS-framed input.
#[derive(Default)]
pub struct AacDecoder {
    inner: Option<(StreamKey, Box<dyn Decoder>)>,
    next_ts: u64,
}

impl AacDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn decoder_for(&mut self, header: &AdtsHeader) -> Result<&mut Box<dyn Decoder>, CodecError> {
        let key = StreamKey {
            profile: header.profile,
            sample_rate_index: header.sample_rate_index,
            channel_config: header.channel_config,
        };
        let stale = !matches!(&self.inner, Some((current, _)) if *current == key);
        if stale {
            let mut params = CodecParameters::new();
            params
                .for_codec(CODEC_TYPE_AAC)
                .with_sample_rate(header.sample_rate())
                .with_extra_data(header.audio_specific_config().to_vec().into_boxed_slice());
            if let Some(layout) = channel_layout(header.channels()) {
                params.with_channels(layout);
            }
            let decoder = symphonia::default::get_codecs()
                .make(&params, &DecoderOptions::default())
                .map_err(|err| CodecError::Decode(format!("create AAC decoder: {err}")))?;
            tracing::debug!(
                sample_rate = header.sample_rate(),
                channels = header.channels(),
                "AAC decoder configured"
            );
            self.inner = Some((key, decoder));
        }
        match self.inner.as_mut() {
            Some((_, decoder)) => Ok(decoder),
            None => Err(CodecError::Closed),
        }
    }
}

impl FrameDecoder for AacDecoder {
    fn decode(&mut self, frame: &[u8]) -> Result<Option<DecodedFrame>, CodecError> {
        let header = AdtsHeader::parse(frame)
            .ok_or_else(|| CodecError::Decode("invalid ADTS header".into()))?;
        let payload = frame
            .get(header.header_length..header.frame_length)
            .ok_or_else(|| CodecError::Decode("truncated ADTS frame".into()))?;

        let ts = self.next_ts;
        let mut reset = false;
        loop {
            let decoder = self.decoder_for(&header)?;
            let packet = Packet::new_from_slice(0, ts, 1024, payload);
            let err = match decoder.decode(&packet).map(copy_interleaved) {
                Ok(Some(frame)) => {
                    self.next_ts += (frame.samples.len() / frame.channels.max(1)) as u64;
                    return Ok(Some(frame));
                }
                Ok(None) => return Ok(None),
                Err(err) => err,
            };
            match classify(err) {
                DecodeFailure::NeedMoreData => return Ok(None),
                DecodeFailure::Reset => {
                    self.inner = None;
                    if reset {
                        tracing::debug!(ts, "AAC decoder reset twice, dropping frame");
                        return Ok(None);
                    }
                    tracing::debug!(ts, "AAC decoder reset, retrying frame");
                    reset = true;
                }
                DecodeFailure::Fatal(message) => return Err(CodecError::Decode(message)),
            }
        }
    }

    fn close(&mut self) {
        self.inner = None;
    }
}

#[derive(Debug, PartialEq)]
enum DecodeFailure {
    NeedMoreData,
    /// Rebuild the decoder and feed the same packet again.
    Reset,
    Fatal(String),
}

fn classify(err: SymphoniaError) -> DecodeFailure {
    match err {
        SymphoniaError::IoError(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            DecodeFailure::NeedMoreData
        }
        SymphoniaError::ResetRequired => DecodeFailure::Reset,
        err => DecodeFailure::Fatal(err.to_string()),
    }
}

fn copy_interleaved(decoded: AudioBufferRef<'_>) -> Option<DecodedFrame> {
    let spec = *decoded.spec();
    let frames = decoded.frames();
    if frames == 0 {
        return None;
    }
    let mut buffer = SampleBuffer::<f32>::new(frames as u64, spec);
    buffer.copy_interleaved_ref(decoded);
    Some(DecodedFrame {
        samples: buffer.samples().to_vec(),
        sample_rate: spec.rate,
        channels: spec.channels.count(),
    })
}

/// Speaker layout for an ADTS channel count.
fn channel_layout(channels: usize) -> Option<Channels> {
    let front = Channels::FRONT_LEFT | Channels::FRONT_RIGHT;
    let layout = match channels {
        1 => Channels::FRONT_CENTRE,
        2 => front,
        3 => front | Channels::FRONT_CENTRE,
        4 => front | Channels::FRONT_CENTRE | Channels::REAR_CENTRE,
        5 => front | Channels::FRONT_CENTRE | Channels::REAR_LEFT | Channels::REAR_RIGHT,
        6 => {
            front
                | Channels::FRONT_CENTRE
                | Channels::REAR_LEFT
                | Channels::REAR_RIGHT
                | Channels::LFE1
        }
        8 => {
            front
                | Channels::FRONT_CENTRE
                | Channels::REAR_LEFT
                | Channels::REAR_RIGHT
                | Channels::SIDE_LEFT
                | Channels::SIDE_RIGHT
                | Channels::LFE1
        }
        _ => return None,
    };
    Some(layout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demux::test_support::adts_frame;

    #[test]
    fn rejects_frames_without_adts_header() {
        let mut decoder = AacDecoder::new();
        let err = decoder.decode(&[0x00, 0x01, 0x02]).unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }

    #[test]
    fn rejects_truncated_frames() {
        let mut decoder = AacDecoder::new();
        let frame = adts_frame(3, 2, 64);
        let err = decoder.decode(&frame[..40]).unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }

    #[test]
    fn channel_layouts_match_counts() {
        assert_eq!(channel_layout(1).map(|c| c.count()), Some(1));
        assert_eq!(channel_layout(2).map(|c| c.count()), Some(2));
        assert_eq!(channel_layout(6).map(|c| c.count()), Some(6));
        assert_eq!(channel_layout(8).map(|c| c.count()), Some(8));
        assert!(channel_layout(0).is_none());
    }

    #[test]
    fn reset_requests_retry_the_frame() {
        assert_eq!(classify(SymphoniaError::ResetRequired), DecodeFailure::Reset);
        let eof = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short");
        assert_eq!(classify(SymphoniaError::IoError(eof)), DecodeFailure::NeedMoreData);
        assert!(matches!(
            classify(SymphoniaError::DecodeError("bad bits")),
            DecodeFailure::Fatal(_)
        ));
    }

    #[test]
    fn close_is_repeatable() {
        let mut decoder = AacDecoder::new();
        decoder.close();
        decoder.close();
        assert!(decoder.inner.is_none());
    }
}
