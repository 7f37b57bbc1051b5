use tracing::debug;

use crate::audio::{AudioBuffer, ms_to_samples};
use crate::config::AssemblyConfig;
use crate::error::AudioError;

/// How two consecutive chunks are joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Join {
    /// Overlap the boundary by this many milliseconds.
    Crossfade(u32),
    /// Insert this much silence.
    Silence(u32),
}

/// Join rules for an ordered list of chunks: `joins[i]` sits between chunk
/// `i` and chunk `i + 1`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PausePlan {
    pub lead_in_ms: u32,
    pub joins: Vec<Join>,
    pub tail_ms: u32,
}

impl PausePlan {
    /// Total silence the plan inserts, in milliseconds.
    pub fn silence_ms(&self) -> u32 {
        self.lead_in_ms
            + self.tail_ms
            + self
                .joins
                .iter()
                .map(|j| match j {
                    Join::Silence(ms) => *ms,
                    Join::Crossfade(_) => 0,
                })
                .sum::<u32>()
    }
}

#[derive(Debug, Clone)]
pub struct Assembled {
    pub buffer: AudioBuffer,
    pub duration_secs: f64,
    pub loudness_dbfs: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct Assembler {
    config: AssemblyConfig,
}

impl Assembler {
    pub fn new(config: AssemblyConfig) -> Self {
        Self { config }
    }

    /// Stitch chunk audio in order, bring it to the target loudness and fade
    /// both ends. Chunks at other sample rates are resampled to the first
    /// chunk's rate.
    pub fn assemble(&self, chunks: Vec<AudioBuffer>, plan: &PausePlan) -> Result<Assembled, AudioError> {
        let Some(rate) = chunks.first().map(|c| c.sample_rate) else {
            return Err(AudioError::Empty);
        };
        let expected = chunks.len() - 1;
        if plan.joins.len() != expected {
            return Err(AudioError::PlanMismatch {
                expected,
                got: plan.joins.len(),
            });
        }

        let total: usize = chunks.iter().map(|c| c.samples.len()).sum();
        let mut out = Vec::with_capacity(total + ms_to_samples(rate, plan.silence_ms()));
        out.extend(std::iter::repeat_n(0.0, ms_to_samples(rate, plan.lead_in_ms)));

        let mut prev_len = 0usize;
        for (i, chunk) in chunks.into_iter().enumerate() {
            let chunk = chunk.resampled(rate);
            match i.checked_sub(1).and_then(|j| plan.joins.get(j)) {
                Some(Join::Silence(ms)) => {
                    out.extend(std::iter::repeat_n(0.0, ms_to_samples(rate, *ms)));
                    out.extend_from_slice(&chunk.samples);
                }
                Some(Join::Crossfade(ms)) => {
                    let n = ms_to_samples(rate, *ms)
                        .min(prev_len)
                        .min(chunk.samples.len());
                    crossfade_into(&mut out, &chunk.samples, n);
                }
                None => out.extend_from_slice(&chunk.samples),
            }
            prev_len = chunk.samples.len();
        }
        out.extend(std::iter::repeat_n(0.0, ms_to_samples(rate, plan.tail_ms)));

        let mut buffer = AudioBuffer::new(rate, out);
        if let Some(level) = buffer.dbfs() {
            let gain = self.config.target_dbfs - level;
            debug!("Applying {:.2} dB gain (measured {:.2} dBFS)", gain, level);
            buffer.apply_gain_db(gain);
        }
        self.apply_fades(&mut buffer);

        Ok(Assembled {
            duration_secs: buffer.duration_secs(),
            loudness_dbfs: buffer.dbfs(),
            buffer,
        })
    }

    fn apply_fades(&self, buffer: &mut AudioBuffer) {
        let len = buffer.samples.len();
        let fade_in = ms_to_samples(buffer.sample_rate, self.config.fade_in_ms)
            .min((len as f32 * self.config.fade_in_max_fraction) as usize);
        let fade_out = ms_to_samples(buffer.sample_rate, self.config.fade_out_ms)
            .min((len as f32 * self.config.fade_out_max_fraction) as usize);

        for i in 0..fade_in {
            buffer.samples[i] *= i as f32 / fade_in as f32;
        }
        for i in 0..fade_out {
            buffer.samples[len - 1 - i] *= i as f32 / fade_out as f32;
        }
    }
}

/// Overlap the last `n` samples of `out` with the first `n` of `next`.
fn crossfade_into(out: &mut Vec<f32>, next: &[f32], n: usize) {
    let start = out.len() - n;
    for j in 0..n {
        let t = (j + 1) as f32 / (n + 1) as f32;
        out[start + j] = out[start + j] * (1.0 - t) + next[j] * t;
    }
    out.extend_from_slice(&next[n..]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::tests::tone;

    fn assembler() -> Assembler {
        Assembler::new(AssemblyConfig::default())
    }

    #[test]
    fn test_duration_is_chunks_plus_pauses_minus_overlap() {
        let chunks = vec![
            tone(24000, 1000, 0.3),
            tone(24000, 2000, 0.3),
            tone(24000, 500, 0.3),
        ];
        let plan = PausePlan {
            lead_in_ms: 200,
            joins: vec![Join::Silence(1000), Join::Crossfade(40)],
            tail_ms: 0,
        };
        let out = assembler().assemble(chunks, &plan).unwrap();
        // 3.5 s audio + 1.2 s silence - 40 ms overlap
        assert!((out.duration_secs - 4.66).abs() < 1e-6, "{}", out.duration_secs);
    }

    #[test]
    fn test_normalizes_to_target() {
        let plan = PausePlan::default();
        let out = assembler()
            .assemble(vec![tone(24000, 5000, 0.05)], &plan)
            .unwrap();
        // fades pull the measured level slightly under the target
        let level = out.loudness_dbfs.unwrap();
        assert!(level < -16.0 && level > -18.0, "{level}");
    }

    #[test]
    fn test_fades_are_capped_for_short_pieces() {
        let plan = PausePlan::default();
        let out = assembler().assemble(vec![tone(24000, 400, 0.5)], &plan).unwrap();
        let samples = &out.buffer.samples;
        assert_eq!(samples[0], 0.0);
        // 400 ms piece: fade-in capped at 100 ms, fade-out at ~133 ms
        let mid = samples.len() / 2;
        let window = &samples[mid - 600..mid + 600];
        let peak = window.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!(peak > 0.1);
    }

    #[test]
    fn test_resamples_to_first_rate() {
        let plan = PausePlan {
            joins: vec![Join::Silence(0)],
            ..PausePlan::default()
        };
        let out = assembler()
            .assemble(vec![tone(24000, 1000, 0.3), tone(48000, 1000, 0.3)], &plan)
            .unwrap();
        assert_eq!(out.buffer.sample_rate, 24000);
        assert!((out.duration_secs - 2.0).abs() < 0.001);
    }

    #[test]
    fn test_rejects_empty_and_mismatched_plan() {
        assert!(matches!(
            assembler().assemble(Vec::new(), &PausePlan::default()),
            Err(AudioError::Empty)
        ));
        let err = assembler()
            .assemble(vec![tone(24000, 100, 0.3), tone(24000, 100, 0.3)], &PausePlan::default())
            .unwrap_err();
        assert!(matches!(err, AudioError::PlanMismatch { expected: 1, got: 0 }));
    }

    #[test]
    fn test_crossfade_keeps_order() {
        let mut out = vec![1.0; 10];
        crossfade_into(&mut out, &[-1.0; 10], 4);
        assert_eq!(out.len(), 16);
        assert_eq!(out[5], 1.0);
        assert!(out[6] < 1.0 && out[9] > -1.0);
        assert_eq!(out[15], -1.0);
    }
}
