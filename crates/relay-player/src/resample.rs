//! Sample-rate and channel-layout conversion.
//!
//! Both helpers operate on interleaved `f32` buffers and are deterministic: the
//! same input always yields the same output, which keeps frame counts stable
//! across runs.

/// Linearly interpolate `samples` from `source_rate` to `target_rate`, per channel.
///
/// Produces exactly `floor(input_frames * target_rate / source_rate)` frames. The
/// last input frame is held when interpolation would read past the end.
pub fn resample_linear(
    samples: &[f32],
    channels: usize,
    source_rate: u32,
    target_rate: u32,
) -> Vec<f32> {
    if source_rate == target_rate || channels == 0 || source_rate == 0 || samples.is_empty() {
        return samples.to_vec();
    }

    let in_frames = samples.len() / channels;
    let out_frames = (in_frames as u64 * target_rate as u64 / source_rate as u64) as usize;
    let ratio = source_rate as f64 / target_rate as f64;

    let mut out = Vec::with_capacity(out_frames * channels);
    for frame in 0..out_frames {
        let pos = frame as f64 * ratio;
        let idx = (pos.floor() as usize).min(in_frames - 1);
        let next = (idx + 1).min(in_frames - 1);
        let frac = (pos - idx as f64) as f32;
        for ch in 0..channels {
            let a = samples[idx * channels + ch];
            let b = samples[next * channels + ch];
            out.push(a + (b - a) * frac);
        }
    }
    out
}

/// Convert interleaved audio between channel counts.
///
/// Mono is duplicated to every output channel; wider layouts are folded by
/// averaging source channel `c` into output channel `c % to` (for stereo output:
/// even channels left, odd channels right).
pub fn remix_channels(samples: &[f32], from: usize, to: usize) -> Vec<f32> {
    if from == to || from == 0 || to == 0 {
        return samples.to_vec();
    }

    let frames = samples.len() / from;
    let mut out = Vec::with_capacity(frames * to);
    for frame in samples.chunks_exact(from) {
        if from == 1 {
            out.extend(std::iter::repeat_n(frame[0], to));
        } else if from > to {
            for target in 0..to {
                let (sum, count) = frame
                    .iter()
                    .enumerate()
                    .filter(|(ch, _)| ch % to == target)
                    .fold((0.0f32, 0usize), |(sum, count), (_, s)| (sum + s, count + 1));
                out.push(sum / count.max(1) as f32);
            }
        } else {
            for target in 0..to {
                out.push(frame[target % from]);
            }
        }
    }
    out
}
