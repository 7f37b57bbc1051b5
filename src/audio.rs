use std::io::Cursor;
use std::path::Path;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

use crate::error::AudioError;

/// Mono PCM audio as `f32` samples in `[-1.0, 1.0]`.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub sample_rate: u32,
    pub samples: Vec<f32>,
}

impl AudioBuffer {
    pub fn new(sample_rate: u32, samples: Vec<f32>) -> Self {
        Self {
            sample_rate,
            samples,
        }
    }

    pub fn silence(sample_rate: u32, ms: u32) -> Self {
        Self::new(sample_rate, vec![0.0; ms_to_samples(sample_rate, ms)])
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// RMS level relative to full scale. `None` for digital silence.
    pub fn dbfs(&self) -> Option<f32> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: f64 = self.samples.iter().map(|s| (*s as f64) * (*s as f64)).sum();
        let rms = (sum / self.samples.len() as f64).sqrt();
        if rms <= f64::EPSILON {
            return None;
        }
        Some((20.0 * rms.log10()) as f32)
    }

    pub fn apply_gain_db(&mut self, gain_db: f32) {
        let factor = 10f32.powf(gain_db / 20.0);
        for s in &mut self.samples {
            *s = (*s * factor).clamp(-1.0, 1.0);
        }
    }

    pub fn resampled(self, to_rate: u32) -> Self {
        // a zero rate has no meaningful ratio
        if self.sample_rate == to_rate || self.sample_rate == 0 || to_rate == 0 || self.samples.is_empty() {
            return Self::new(to_rate, self.samples);
        }
        Self::new(to_rate, resample(&self.samples, self.sample_rate, to_rate))
    }
}

pub fn ms_to_samples(sample_rate: u32, ms: u32) -> usize {
    (sample_rate as u64 * ms as u64 / 1000) as usize
}

/// Linear interpolation resampling.
fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    let ratio = from_rate as f64 / to_rate as f64;
    let output_len = (samples.len() as f64 / ratio).floor() as usize;
    let last = samples.len() - 1;

    (0..output_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = (pos.floor() as usize).min(last);
            let fraction = (pos - idx as f64) as f32;
            if idx >= last {
                samples[last]
            } else {
                samples[idx] + (samples[idx + 1] - samples[idx]) * fraction
            }
        })
        .collect()
}

/// Decode WAV bytes of any integer or float format, downmixing to mono.
pub fn decode_wav(bytes: &[u8]) -> Result<AudioBuffer, AudioError> {
    let mut reader = WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();
    if spec.sample_rate == 0 {
        return Err(AudioError::SampleRate(0));
    }

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<Vec<_>, _>>()?,
        SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<Vec<_>, _>>()?
        }
    };

    let channels = spec.channels.max(1) as usize;
    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    };

    Ok(AudioBuffer::new(spec.sample_rate, samples))
}

/// Encode as 16-bit mono PCM.
pub fn encode_wav(buffer: &AudioBuffer) -> Result<Vec<u8>, AudioError> {
    let spec = WavSpec {
        channels: 1,
        sample_rate: buffer.sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut cursor, spec)?;
        for s in &buffer.samples {
            writer.write_sample((s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

pub fn write_wav(path: &Path, buffer: &AudioBuffer) -> Result<(), AudioError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let bytes = encode_wav(buffer)?;
    std::fs::write(path, bytes)?;
    Ok(())
}

pub fn read_wav(path: &Path) -> Result<AudioBuffer, AudioError> {
    let bytes = std::fs::read(path)?;
    decode_wav(&bytes)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) fn tone(sample_rate: u32, ms: u32, amplitude: f32) -> AudioBuffer {
        let n = ms_to_samples(sample_rate, ms);
        let samples = (0..n)
            .map(|i| {
                let t = i as f32 / sample_rate as f32;
                amplitude * (2.0 * std::f32::consts::PI * 220.0 * t).sin()
            })
            .collect();
        AudioBuffer::new(sample_rate, samples)
    }

    fn make_wav_data(sample_rate: u32, channels: u16, samples: &[i16]) -> Vec<u8> {
        let spec = WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = WavWriter::new(&mut cursor, spec).unwrap();
            for s in samples {
                writer.write_sample(*s).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn test_decode_downmixes_stereo() {
        let data = make_wav_data(24000, 2, &[16384, 0, -16384, 0]);
        let buffer = decode_wav(&data).unwrap();
        assert_eq!(buffer.sample_rate, 24000);
        assert_eq!(buffer.samples.len(), 2);
        assert!((buffer.samples[0] - 0.25).abs() < 1e-3);
        assert!((buffer.samples[1] + 0.25).abs() < 1e-3);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_wav(b"definitely not a wav file").is_err());
    }

    #[test]
    fn test_write_read_and_duration() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/out.wav");
        let buffer = tone(24000, 1500, 0.5);
        write_wav(&path, &buffer).unwrap();

        let back = read_wav(&path).unwrap();
        assert_eq!(back.samples.len(), buffer.samples.len());
        assert!((back.duration_secs() - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_dbfs_and_gain() {
        assert_eq!(AudioBuffer::silence(24000, 100).dbfs(), None);

        let mut buffer = tone(24000, 1000, 0.5);
        let before = buffer.dbfs().unwrap();
        // a sine at 0.5 peak sits near -9 dBFS RMS
        assert!((before + 9.03).abs() < 0.1);
        buffer.apply_gain_db(-6.0);
        let after = buffer.dbfs().unwrap();
        assert!((after - (before - 6.0)).abs() < 0.05);
    }

    #[test]
    fn test_decode_rejects_zero_sample_rate() {
        let mut data = make_wav_data(24000, 1, &[100, -100, 200]);
        // sample rate field of the fmt chunk
        data[24..28].copy_from_slice(&0u32.to_le_bytes());
        assert!(decode_wav(&data).is_err());
    }

    #[test]
    fn test_resample_with_zero_rate_keeps_samples() {
        let buffer = AudioBuffer::new(0, vec![0.1, 0.2, 0.3]).resampled(24000);
        assert_eq!(buffer.samples.len(), 3);
        let buffer = tone(24000, 100, 0.3).resampled(0);
        assert_eq!(buffer.samples.len(), 2400);
    }

    #[test]
    fn test_resample_changes_length_not_duration() {
        let buffer = tone(48000, 1000, 0.3).resampled(24000);
        assert_eq!(buffer.sample_rate, 24000);
        assert!((buffer.duration_secs() - 1.0).abs() < 0.001);
    }
}
