//! Impulse-response file loading
//!
//! Multi-channel WAV files, deinterleaved into one buffer per channel.
//! Sample-rate validation against the engine happens here so that all
//! renderers raise the same configuration errors.

use std::path::Path;

use sf_core::{ConfigError, Sample};

use crate::{RenderError, RenderResult};

/// Deinterleaved impulse-response data.
#[derive(Debug, Clone)]
pub struct IrData {
    pub sample_rate: u32,
    /// One buffer per channel, all the same length
    pub channels: Vec<Vec<Sample>>,
}

impl IrData {
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn frames(&self) -> usize {
        self.channels.first().map(|c| c.len()).unwrap_or(0)
    }

    /// Verify the sample rate against the engine's.
    pub fn check_sample_rate(&self, engine_rate: u32) -> RenderResult<()> {
        if self.sample_rate != engine_rate {
            return Err(ConfigError::SampleRateMismatch {
                expected: engine_rate,
                got: self.sample_rate,
            }
            .into());
        }
        Ok(())
    }

    /// Truncate all channels to at most `frames` samples (0 keeps the full
    /// length).
    pub fn truncate(&mut self, frames: usize) {
        if frames == 0 {
            return;
        }
        for channel in &mut self.channels {
            channel.truncate(frames);
        }
    }
}

/// Load a WAV file and deinterleave its channels.
pub fn load_wav(path: impl AsRef<Path>) -> RenderResult<IrData> {
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    let channel_count = spec.channels as usize;

    let interleaved: Vec<Sample> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<Vec<_>, _>>()?,
        hound::SampleFormat::Int => {
            let scale = 1.0 / (1i64 << (spec.bits_per_sample - 1)) as Sample;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as Sample * scale))
                .collect::<Result<Vec<_>, _>>()?
        }
    };

    let frames = interleaved.len() / channel_count.max(1);
    let mut channels = vec![Vec::with_capacity(frames); channel_count];
    for frame in interleaved.chunks_exact(channel_count) {
        for (channel, &sample) in channels.iter_mut().zip(frame) {
            channel.push(sample);
        }
    }

    log::debug!(
        "loaded IR: {} channels, {} frames at {} Hz",
        channel_count,
        frames,
        spec.sample_rate
    );

    Ok(IrData {
        sample_rate: spec.sample_rate,
        channels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_test_wav(path: &Path, channels: u16, data: &[f32]) {
        let spec = hound::WavSpec {
            channels,
            sample_rate: 44100,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for &s in data {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_deinterleave() {
        let dir = std::env::temp_dir();
        let path = dir.join("sf_render_irfile_test.wav");
        // two channels, three frames
        write_test_wav(&path, 2, &[0.1, 0.2, 0.3, 0.4, 0.5, 0.6]);

        let ir = load_wav(&path).unwrap();
        assert_eq!(ir.sample_rate, 44100);
        assert_eq!(ir.channel_count(), 2);
        assert_eq!(ir.frames(), 3);
        assert!((ir.channels[0][1] - 0.3).abs() < 1e-6);
        assert!((ir.channels[1][2] - 0.6).abs() < 1e-6);

        assert!(ir.check_sample_rate(44100).is_ok());
        assert!(matches!(
            ir.check_sample_rate(48000),
            Err(RenderError::Config(ConfigError::SampleRateMismatch { .. }))
        ));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_truncate() {
        let mut ir = IrData {
            sample_rate: 44100,
            channels: vec![vec![1.0; 10], vec![2.0; 10]],
        };
        ir.truncate(0);
        assert_eq!(ir.frames(), 10);
        ir.truncate(4);
        assert_eq!(ir.frames(), 4);
    }
}
