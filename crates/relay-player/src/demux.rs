//! Container demultiplexing for HLS audio segments.
//!
//! Segments arrive as MPEG transport streams carrying one AAC elementary stream.
//! The demuxer walks PAT → PMT to find the audio PID, reassembles that PID's PES
//! payloads and slices the result into ADTS frames. A segment that already is a
//! raw ADTS stream is sliced directly.

use crate::error::CodecError;

const TS_PACKET_LEN: usize = 188;
const TS_SYNC: u8 = 0x47;
const PAT_PID: u16 = 0x0000;
const STREAM_TYPE_AAC_ADTS: u8 = 0x0F;
const STREAM_TYPE_AAC_LATM: u8 = 0x11;

/// ADTS sampling-frequency table, indexed by the header's 4-bit index.
const ADTS_SAMPLE_RATES: [u32; 13] = [
    96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025,
    8_000, 7_350,
];

/// Splits one container segment into compressed audio frames.
pub trait SegmentDemuxer: Send {
    fn extract_frames(&mut self, segment: &[u8]) -> Result<Vec<Vec<u8>>, CodecError>;
}

/// MPEG-TS demuxer yielding ADTS frames.
///
/// Stateless across segments: every HLS segment repeats its own PAT/PMT.
#[derive(Debug, Default)]
pub struct TsDemuxer;

impl SegmentDemuxer for TsDemuxer {
    fn extract_frames(&mut self, segment: &[u8]) -> Result<Vec<Vec<u8>>, CodecError> {
        if segment.is_empty() {
            return Err(CodecError::Demux("empty segment".into()));
        }
        let elementary = if segment[0] == TS_SYNC {
            audio_elementary_stream(segment)?
        } else if AdtsHeader::parse(segment).is_some() {
            segment.to_vec()
        } else {
            return Err(CodecError::Demux("neither transport stream nor ADTS".into()));
        };

        let frames = split_adts_frames(&elementary);
        if frames.is_empty() {
            return Err(CodecError::NoFrames);
        }
        Ok(frames)
    }
}

/// Parsed fixed part of an ADTS frame header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdtsHeader {
    /// MPEG-4 audio object type minus one.
    pub profile: u8,
    pub sample_rate_index: u8,
    pub channel_config: u8,
    /// Whole frame length, header included.
    pub frame_length: usize,
    pub header_length: usize,
}

impl AdtsHeader {
    /// Parse the header at the start of `data`; `None` when it is not a valid ADTS header.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 7 || data[0] != 0xFF || data[1] & 0xF0 != 0xF0 {
            return None;
        }
        let protection_absent = data[1] & 0x01 == 1;
        let profile = (data[2] >> 6) & 0x03;
        let sample_rate_index = (data[2] >> 2) & 0x0F;
        let channel_config = ((data[2] & 0x01) << 2) | (data[3] >> 6);
        let frame_length = (((data[3] & 0x03) as usize) << 11)
            | ((data[4] as usize) << 3)
            | ((data[5] as usize) >> 5);
        let header_length = if protection_absent { 7 } else { 9 };

        if sample_rate_index as usize >= ADTS_SAMPLE_RATES.len() || frame_length < header_length {
            return None;
        }
        Some(Self {
            profile,
            sample_rate_index,
            channel_config,
            frame_length,
            header_length,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        ADTS_SAMPLE_RATES[self.sample_rate_index as usize]
    }

    /// Channel count implied by the channel configuration (config 7 is 7.1).
    pub fn channels(&self) -> usize {
        match self.channel_config {
            7 => 8,
            n => n as usize,
        }
    }

    /// Two-byte AudioSpecificConfig equivalent to this header.
    pub fn audio_specific_config(&self) -> [u8; 2] {
        let object_type = self.profile + 1;
        [
            (object_type << 3) | (self.sample_rate_index >> 1),
            ((self.sample_rate_index & 0x01) << 7) | (self.channel_config << 3),
        ]
    }
}

/// Slice back-to-back ADTS frames, skipping one byte whenever no valid header is found.
///
/// A truncated trailing frame is dropped.
pub fn split_adts_frames(data: &[u8]) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    let mut offset = 0;
    while offset + 7 <= data.len() {
        match AdtsHeader::parse(&data[offset..]) {
            Some(header) => {
                let end = offset + header.frame_length;
                if end > data.len() {
                    break;
                }
                frames.push(data[offset..end].to_vec());
                offset = end;
            }
            None => offset += 1,
        }
    }
    frames
}

/// Header fields of one 188-byte transport packet.
struct TsPacket<'a> {
    pid: u16,
    payload_start: bool,
    payload: &'a [u8],
}

fn parse_ts_packet(packet: &[u8]) -> Option<TsPacket<'_>> {
    if packet.len() != TS_PACKET_LEN || packet[0] != TS_SYNC {
        return None;
    }
    if packet[1] & 0x80 != 0 {
        // transport error indicator
        return None;
    }
    let payload_start = packet[1] & 0x40 != 0;
    let pid = (((packet[1] & 0x1F) as u16) << 8) | packet[2] as u16;
    let adaptation = (packet[3] >> 4) & 0x03;
    let payload_offset = match adaptation {
        0b01 => 4,
        0b11 => 5 + packet[4] as usize,
        _ => return Some(TsPacket { pid, payload_start, payload: &[] }),
    };
    if payload_offset > TS_PACKET_LEN {
        return None;
    }
    Some(TsPacket {
        pid,
        payload_start,
        payload: &packet[payload_offset..],
    })
}

/// Iterate aligned transport packets, resynchronising on the sync byte after garbage.
fn ts_packets(data: &[u8]) -> impl Iterator<Item = TsPacket<'_>> {
    let mut offset = 0;
    std::iter::from_fn(move || {
        while offset + TS_PACKET_LEN <= data.len() {
            if data[offset] != TS_SYNC {
                offset += 1;
                continue;
            }
            let packet = &data[offset..offset + TS_PACKET_LEN];
            offset += TS_PACKET_LEN;
            if let Some(parsed) = parse_ts_packet(packet) {
                return Some(parsed);
            }
        }
        None
    })
}

/// Return the PSI section carried by a payload-unit-start packet (pointer field skipped).
fn psi_section(payload: &[u8]) -> Option<&[u8]> {
    let pointer = *payload.first()? as usize;
    let section = payload.get(1 + pointer..)?;
    if section.len() < 3 {
        return None;
    }
    let section_length = (((section[1] & 0x0F) as usize) << 8) | section[2] as usize;
    // CRC is not verified; truncated sections are rejected.
    section.get(..3 + section_length)
}

fn parse_pat(section: &[u8]) -> Vec<u16> {
    if section[0] != 0x00 || section.len() < 12 {
        return Vec::new();
    }
    let entries = &section[8..section.len() - 4];
    entries
        .chunks_exact(4)
        .filter_map(|entry| {
            let program = ((entry[0] as u16) << 8) | entry[1] as u16;
            let pid = (((entry[2] & 0x1F) as u16) << 8) | entry[3] as u16;
            (program != 0).then_some(pid)
        })
        .collect()
}

fn parse_pmt_audio_pid(section: &[u8]) -> Option<u16> {
    if section[0] != 0x02 || section.len() < 16 {
        return None;
    }
    let program_info_length = (((section[10] & 0x0F) as usize) << 8) | section[11] as usize;
    let end = section.len() - 4;
    let mut offset = 12 + program_info_length;
    while offset + 5 <= end {
        let stream_type = section[offset];
        let pid = (((section[offset + 1] & 0x1F) as u16) << 8) | section[offset + 2] as u16;
        let es_info_length =
            (((section[offset + 3] & 0x0F) as usize) << 8) | section[offset + 4] as usize;
        if stream_type == STREAM_TYPE_AAC_ADTS || stream_type == STREAM_TYPE_AAC_LATM {
            return Some(pid);
        }
        offset += 5 + es_info_length;
    }
    None
}

fn find_audio_pid(segment: &[u8]) -> Result<u16, CodecError> {
    let mut seen_packets = false;
    let mut pmt_pids = Vec::new();
    for packet in ts_packets(segment) {
        seen_packets = true;
        if !packet.payload_start {
            continue;
        }
        if packet.pid == PAT_PID && pmt_pids.is_empty() {
            if let Some(section) = psi_section(packet.payload) {
                pmt_pids = parse_pat(section);
            }
        } else if pmt_pids.contains(&packet.pid) {
            if let Some(pid) = psi_section(packet.payload).and_then(parse_pmt_audio_pid) {
                return Ok(pid);
            }
        }
    }
    if !seen_packets {
        return Err(CodecError::Demux("no transport packets".into()));
    }
    Err(CodecError::NoAudioTrack)
}

/// Concatenate the PES payloads of the segment's audio stream.
fn audio_elementary_stream(segment: &[u8]) -> Result<Vec<u8>, CodecError> {
    let audio_pid = find_audio_pid(segment)?;
    let mut elementary = Vec::with_capacity(segment.len());
    let mut in_pes = false;

    for packet in ts_packets(segment).filter(|p| p.pid == audio_pid) {
        if packet.payload_start {
            match pes_payload(packet.payload) {
                Some(payload) => {
                    elementary.extend_from_slice(payload);
                    in_pes = true;
                }
                None => {
                    tracing::debug!(pid = audio_pid, "dropping malformed PES header");
                    in_pes = false;
                }
            }
        } else if in_pes {
            elementary.extend_from_slice(packet.payload);
        }
    }
    Ok(elementary)
}

fn pes_payload(data: &[u8]) -> Option<&[u8]> {
    if data.len() < 9 || data[..3] != [0x00, 0x00, 0x01] {
        return None;
    }
    let header_data_length = data[8] as usize;
    data.get(9 + header_data_length..)
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn parses_adts_header_fields() {
        let frame = adts_frame(3, 2, 100);
        let header = AdtsHeader::parse(&frame).unwrap();
        assert_eq!(header.sample_rate(), 48_000);
        assert_eq!(header.channels(), 2);
        assert_eq!(header.frame_length, 107);
        assert_eq!(header.header_length, 7);
        assert_eq!(header.audio_specific_config(), [0x11, 0x90]);
    }

    #[test]
    fn split_skips_garbage_between_frames() {
        let mut data = adts_frame(4, 2, 20);
        data.extend_from_slice(&[0x00, 0x13, 0x37]);
        data.extend(adts_frame(4, 2, 30));
        let frames = split_adts_frames(&data);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].len(), 37);
    }

    #[test]
    fn split_drops_truncated_tail() {
        let mut data = adts_frame(4, 2, 20);
        let second = adts_frame(4, 2, 50);
        data.extend_from_slice(&second[..20]);
        assert_eq!(split_adts_frames(&data).len(), 1);
    }

    #[test]
    fn extracts_frames_spanning_many_packets() {
        let frames: Vec<Vec<u8>> = (0..12).map(|i| adts_frame(3, 2, 90 + i)).collect();
        let segment = ts_segment(&frames);
        let extracted = TsDemuxer.extract_frames(&segment).unwrap();
        assert_eq!(extracted, frames);
    }

    #[test]
    fn missing_audio_stream_is_reported() {
        let segment = ts_segment_with_stream_type(&[adts_frame(3, 2, 10)], 0x1B);
        let err = TsDemuxer.extract_frames(&segment).unwrap_err();
        assert!(matches!(err, CodecError::NoAudioTrack));
    }

    #[test]
    fn audio_stream_without_frames_is_an_error() {
        let segment = ts_segment(&[]);
        let err = TsDemuxer.extract_frames(&segment).unwrap_err();
        assert!(matches!(err, CodecError::NoFrames));
    }

    #[test]
    fn raw_adts_segments_are_accepted() {
        let mut data = adts_frame(3, 1, 40);
        data.extend(adts_frame(3, 1, 41));
        assert_eq!(TsDemuxer.extract_frames(&data).unwrap().len(), 2);
    }

    #[test]
    fn garbage_is_rejected() {
        let err = TsDemuxer.extract_frames(&[0x01, 0x02, 0x03]).unwrap_err();
        assert!(matches!(err, CodecError::Demux(_)));
    }
}
