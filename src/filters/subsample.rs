//! Min/max subsampling for display.
//!
//! Not a decimator: for every window of `subsample_rate` samples the filter
//! emits the window's `[min, max]` pair, so a plot of the output still
//! shows every peak and trough of the original signal. The window width
//! `2 * fs * window_sec / max_subsamples` is generally fractional; the
//! fractional remainder is carried forward and grants an occasional "leap"
//! sample, keeping the long-run window boundary exact.

use serde::Deserialize;

use crate::engine::step::{Step, StepData};
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubsamplingFilterConfig {
    pub samples_per_sec: f64,
    pub max_subsamples: usize,
    pub window_length_sec: f64,
}

pub struct SubsamplingFilter {
    subsample_rate: f64,
    /// Fraction of a sample carried into the next window, `0 <= x < 1`.
    leftover_sample_fraction: f64,
    leftover_samples: Vec<f32>,
}

impl SubsamplingFilter {
    pub fn new(config: &SubsamplingFilterConfig) -> Result<Self> {
        if config.max_subsamples == 0 {
            return Err(EngineError::BadStepConfig("maxSubsamples must be > 0".into()));
        }

        let num_samples_in_window = config.samples_per_sec * config.window_length_sec;
        let subsample_rate = 2.0 * num_samples_in_window / config.max_subsamples as f64;

        if subsample_rate < 1.0 {
            return Err(EngineError::BadStepConfig(format!(
                "subsampling window of {subsample_rate} samples is under one sample"
            )));
        }

        Ok(Self {
            subsample_rate,
            leftover_sample_fraction: 0.0,
            leftover_samples: Vec::new(),
        })
    }
}

impl Step for SubsamplingFilter {
    fn do_step(&mut self, input: Option<&StepData>) -> Option<StepData> {
        let data = input?.as_samples()?;
        if data.is_empty() {
            return None;
        }

        let mut samples = std::mem::take(&mut self.leftover_samples);
        samples.extend_from_slice(data);

        let samples_available = samples.len() as f64 - self.leftover_sample_fraction;
        let num_subsamples = (samples_available / self.subsample_rate).floor() as usize;

        if num_subsamples == 0 {
            self.leftover_samples = samples;
            return None;
        }

        let mut subsamples = Vec::with_capacity(num_subsamples * 2);
        let mut from_sample = 0usize;
        let mut leftover_fraction = self.leftover_sample_fraction;

        for _ in 0..num_subsamples {
            // The fractional carry occasionally grants this window a leap
            // sample.
            let should_include = leftover_fraction + self.subsample_rate;
            let actual_included = should_include.floor() as usize;
            let to_sample = (from_sample + actual_included).min(samples.len());

            let window = &samples[from_sample..to_sample];
            let mut min_value = f32::INFINITY;
            let mut max_value = f32::NEG_INFINITY;
            for &x in window {
                min_value = min_value.min(x);
                max_value = max_value.max(x);
            }

            subsamples.push(min_value);
            subsamples.push(max_value);

            from_sample = to_sample;
            leftover_fraction = should_include - actual_included as f64;
        }

        self.leftover_sample_fraction = leftover_fraction;
        self.leftover_samples = samples[from_sample..].to_vec();
        Some(StepData::Samples(subsamples))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(fs: f64, max_subsamples: usize, window_sec: f64) -> SubsamplingFilter {
        SubsamplingFilter::new(&SubsamplingFilterConfig {
            samples_per_sec: fs,
            max_subsamples,
            window_length_sec: window_sec,
        })
        .unwrap()
    }

    #[test]
    fn test_emits_min_max_pairs() {
        // Window = 2 * 100 * 1 / 50 = 4 samples per pair.
        let mut filter = filter(100.0, 50, 1.0);

        let input = StepData::Samples(vec![1.0, -3.0, 2.0, 0.0, 5.0, 4.0, -1.0, 4.5]);
        let Some(StepData::Samples(out)) = filter.do_step(Some(&input)) else {
            panic!("no output");
        };

        assert_eq!(out, vec![-3.0, 2.0, -1.0, 5.0]);
    }

    #[test]
    fn test_output_length_tracks_total_input() {
        // Window = 2 * 1000 * 0.01 / 8 = 2.5 samples: fractional.
        let mut filter = filter(1000.0, 8, 0.01);

        let mut total_in = 0usize;
        let mut total_pairs = 0usize;

        for chunk_len in [7usize, 13, 5, 42, 3, 30] {
            total_in += chunk_len;
            let input = StepData::Samples(vec![1.0; chunk_len]);
            if let Some(StepData::Samples(out)) = filter.do_step(Some(&input)) {
                assert_eq!(out.len() % 2, 0);
                total_pairs += out.len() / 2;
            }
        }

        // 100 samples at 2.5 per window = 40 windows exactly.
        assert_eq!(total_in, 100);
        assert_eq!(total_pairs, 40);
    }

    #[test]
    fn test_leap_sample_keeps_boundaries_exact() {
        // Window 2.5: windows alternate 2 and 3 wide.
        let mut filter = filter(1000.0, 8, 0.01);

        let data: Vec<f32> = (0..10).map(|i| i as f32).collect();
        let input = StepData::Samples(data);
        let Some(StepData::Samples(out)) = filter.do_step(Some(&input)) else {
            panic!("no output");
        };

        // Windows: [0,1], [2,3,4], [5,6], [7,8,9].
        assert_eq!(out, vec![0.0, 1.0, 2.0, 4.0, 5.0, 6.0, 7.0, 9.0]);
    }

    #[test]
    fn test_under_one_window_accumulates() {
        let mut filter = filter(100.0, 50, 1.0);

        let input = StepData::Samples(vec![1.0, 2.0, 3.0]);
        assert!(filter.do_step(Some(&input)).is_none());

        let input = StepData::Samples(vec![4.0]);
        let Some(StepData::Samples(out)) = filter.do_step(Some(&input)) else {
            panic!("no output");
        };
        assert_eq!(out, vec![1.0, 4.0]);
    }
}
