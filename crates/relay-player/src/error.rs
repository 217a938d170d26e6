use thiserror::Error;

/// Failures raised while turning a segment into transport frames.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("no audio track found in segment")]
    NoAudioTrack,
    #[error("no audio data found in segment")]
    NoFrames,
    #[error("segment decoded to zero usable samples")]
    NoSamples,
    #[error("malformed segment: {0}")]
    Demux(String),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("codec closed")]
    Closed,
}
