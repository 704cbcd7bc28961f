//! Polyphase rational resampler.
//!
//! Rate conversion by `up/down` (the reduced ratio of the two rates) using
//! a Kaiser-windowed sinc anti-aliasing filter. Input is processed in
//! batches of `in_rate / gcd * 100` samples so the polyphase work is
//! amortized over a useful block; ticks with less than one batch
//! accumulate. Equal rates pass samples through untouched.

use serde::Deserialize;

use crate::engine::step::{Step, StepData};
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResamplingFilterConfig {
    pub in_sample_rate: u32,
    pub out_sample_rate: u32,
}

pub struct ResamplingFilter {
    filter_is_off: bool,
    in_batch_size: usize,
    out_batch_size: usize,

    up: usize,
    down: usize,
    /// Centered FIR taps, length `2 * half_len + 1`, pre-scaled by `up`.
    taps: Vec<f64>,
    half_len: usize,

    leftover_samples: Vec<f32>,
}

fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

/// Zeroth-order modified Bessel function, by its power series.
fn bessel_i0(x: f64) -> f64 {
    let mut sum = 1.0;
    let mut term = 1.0;

    for k in 1..=30 {
        let factor = x / (2.0 * k as f64);
        term *= factor * factor;
        sum += term;

        if term < sum * 1e-18 {
            break;
        }
    }

    sum
}

fn sinc(x: f64) -> f64 {
    if x == 0.0 {
        1.0
    } else {
        let px = std::f64::consts::PI * x;
        px.sin() / px
    }
}

/// Kaiser-windowed sinc low-pass with cutoff at the tighter of the two
/// Nyquist limits, unity DC gain, beta = 5.0.
fn design_taps(up: usize, down: usize) -> (Vec<f64>, usize) {
    let max_rate = up.max(down);
    let cutoff = 1.0 / max_rate as f64;
    let half_len = 10 * max_rate;
    let num_taps = 2 * half_len + 1;

    const BETA: f64 = 5.0;
    let i0_beta = bessel_i0(BETA);
    let m = half_len as f64;

    let mut taps: Vec<f64> = (0..num_taps)
        .map(|i| {
            let offset = i as f64 - m;
            let ratio = offset / m;
            let window = bessel_i0(BETA * (1.0 - ratio * ratio).max(0.0).sqrt()) / i0_beta;
            cutoff * sinc(cutoff * offset) * window
        })
        .collect();

    let dc_gain: f64 = taps.iter().sum();
    let scale = up as f64 / dc_gain;
    for tap in taps.iter_mut() {
        *tap *= scale;
    }

    (taps, half_len)
}

impl ResamplingFilter {
    pub fn new(config: &ResamplingFilterConfig) -> Result<Self> {
        if config.in_sample_rate == 0 || config.out_sample_rate == 0 {
            return Err(EngineError::BadStepConfig(
                "sample rates must be positive".into(),
            ));
        }

        if config.in_sample_rate == config.out_sample_rate {
            return Ok(Self {
                filter_is_off: true,
                in_batch_size: 0,
                out_batch_size: 0,
                up: 1,
                down: 1,
                taps: Vec::new(),
                half_len: 0,
                leftover_samples: Vec::new(),
            });
        }

        let gcd_rate = gcd(config.in_sample_rate, config.out_sample_rate);
        let up = (config.out_sample_rate / gcd_rate) as usize;
        let down = (config.in_sample_rate / gcd_rate) as usize;
        let (taps, half_len) = design_taps(up, down);

        Ok(Self {
            filter_is_off: false,
            in_batch_size: down * 100,
            out_batch_size: up * 100,
            up,
            down,
            taps,
            half_len,
            leftover_samples: Vec::new(),
        })
    }

    /// Resample one whole batch: `y[m] = sum_k x[k] h[half_len + m*down - k*up]`.
    fn resample_batch(&self, batch: &[f64], output: &mut Vec<f32>) {
        let n_in = batch.len() as isize;
        let up = self.up as isize;
        let down = self.down as isize;
        let half_len = self.half_len as isize;
        let num_taps = self.taps.len() as isize;

        for m in 0..self.out_batch_size as isize {
            let center = m * down + half_len;

            // Tap index center - k*up must stay inside the filter.
            let k_min = ((center - num_taps + 1) + up - 1).div_euclid(up).max(0);
            let k_max = (center / up).min(n_in - 1);

            let mut acc = 0.0;
            for k in k_min..=k_max {
                acc += batch[k as usize] * self.taps[(center - k * up) as usize];
            }

            output.push(acc as f32);
        }
    }
}

impl Step for ResamplingFilter {
    fn do_step(&mut self, input: Option<&StepData>) -> Option<StepData> {
        if self.filter_is_off {
            return input.cloned();
        }

        let data = input?.as_samples()?;
        if data.is_empty() {
            return None;
        }

        let mut samples = std::mem::take(&mut self.leftover_samples);
        samples.extend_from_slice(data);

        let num_batches = samples.len() / self.in_batch_size;
        if num_batches == 0 {
            self.leftover_samples = samples;
            return None;
        }

        let mut resampled = Vec::with_capacity(num_batches * self.out_batch_size);

        for i in 0..num_batches {
            let from = i * self.in_batch_size;
            let batch: Vec<f64> = samples[from..from + self.in_batch_size]
                .iter()
                .map(|&x| f64::from(x))
                .collect();
            self.resample_batch(&batch, &mut resampled);
        }

        self.leftover_samples = samples[num_batches * self.in_batch_size..].to_vec();
        Some(StepData::Samples(resampled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    #[test]
    fn test_batch_sizes_from_gcd() {
        let filter = ResamplingFilter::new(&ResamplingFilterConfig {
            in_sample_rate: 44_100,
            out_sample_rate: 48_000,
        })
        .unwrap();

        assert_eq!(filter.up, 160);
        assert_eq!(filter.down, 147);
        assert_eq!(filter.in_batch_size, 14_700);
        assert_eq!(filter.out_batch_size, 16_000);
    }

    #[test]
    fn test_44100_to_48000_sample_counts() {
        let mut filter = ResamplingFilter::new(&ResamplingFilterConfig {
            in_sample_rate: 44_100,
            out_sample_rate: 48_000,
        })
        .unwrap();

        let tone: Vec<f32> = (0..44_100)
            .map(|i| (2.0 * PI * 440.0 * i as f64 / 44_100.0).sin() as f32)
            .collect();

        let input = StepData::Samples(tone);
        let Some(StepData::Samples(out)) = filter.do_step(Some(&input)) else {
            panic!("no output");
        };

        // One second in, one second out.
        assert_eq!(out.len(), 48_000);

        // Mid-batch samples of the resampled tone still follow the sine.
        for m in 20_000..20_100 {
            let t = m as f64 / 48_000.0;
            let expected = (2.0 * PI * 440.0 * t).sin();
            assert!(
                (f64::from(out[m]) - expected).abs() < 1e-3,
                "sample {m}: {} vs {expected}",
                out[m]
            );
        }
    }

    #[test]
    fn test_accumulates_until_one_batch() {
        let mut filter = ResamplingFilter::new(&ResamplingFilterConfig {
            in_sample_rate: 2000,
            out_sample_rate: 1000,
        })
        .unwrap();

        // in_batch = 200; two short ticks accumulate, the third crosses.
        assert!(filter
            .do_step(Some(&StepData::Samples(vec![0.0; 80])))
            .is_none());
        assert!(filter
            .do_step(Some(&StepData::Samples(vec![0.0; 80])))
            .is_none());

        let Some(StepData::Samples(out)) =
            filter.do_step(Some(&StepData::Samples(vec![0.0; 80])))
        else {
            panic!("no output");
        };
        assert_eq!(out.len(), 100);
    }

    #[test]
    fn test_equal_rates_pass_through() {
        let mut filter = ResamplingFilter::new(&ResamplingFilterConfig {
            in_sample_rate: 1000,
            out_sample_rate: 1000,
        })
        .unwrap();

        let input = StepData::Samples(vec![1.0, 2.0, 3.0]);
        let Some(StepData::Samples(out)) = filter.do_step(Some(&input)) else {
            panic!("no output");
        };
        assert_eq!(out, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_downsample_preserves_low_frequency_content() {
        let mut filter = ResamplingFilter::new(&ResamplingFilterConfig {
            in_sample_rate: 4000,
            out_sample_rate: 1000,
        })
        .unwrap();

        // in_batch = 400, out_batch = 100.
        let tone: Vec<f32> = (0..4000)
            .map(|i| (2.0 * PI * 50.0 * i as f64 / 4000.0).sin() as f32)
            .collect();

        let input = StepData::Samples(tone);
        let Some(StepData::Samples(out)) = filter.do_step(Some(&input)) else {
            panic!("no output");
        };
        assert_eq!(out.len(), 1000);

        // Interior of a batch, clear of the per-batch filter transients.
        for m in 320..380 {
            let t = m as f64 / 1000.0;
            let expected = (2.0 * PI * 50.0 * t).sin();
            assert!(
                (f64::from(out[m]) - expected).abs() < 1e-3,
                "sample {m}: {} vs {expected}",
                out[m]
            );
        }
    }
}
