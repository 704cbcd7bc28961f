//! Notching comb filter.
//!
//! `y[n] = b0*x[n] + bN*x[n-N] - aN*y[n-N]` with the notch period
//! `N = round(fs / f0)`. The recursion needs whole-N history, so output is
//! produced in whole-N batches and up to N-1 samples are carried between
//! ticks. A frequency of zero turns the filter off (pass-through).

use std::f64::consts::PI;

use serde::Deserialize;

use crate::engine::step::{Step, StepData};
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CombFilterConfig {
    pub samples_per_sec: f64,
    pub freq: f64,
    pub q_factor: f64,
}

pub struct CombFilter {
    b0: f64,
    b_n: f64,
    a_n: f64,
    n: usize,

    leftover_in: Vec<f32>,
    prev_in: Vec<f64>,
    prev_out: Vec<f64>,
}

impl CombFilter {
    pub fn new(config: &CombFilterConfig) -> Result<Self> {
        if config.freq == 0.0 {
            return Ok(Self {
                b0: 0.0,
                b_n: 0.0,
                a_n: 0.0,
                n: 0,
                leftover_in: Vec::new(),
                prev_in: Vec::new(),
                prev_out: Vec::new(),
            });
        }

        if config.freq < 0.0 || config.q_factor <= 0.0 || config.samples_per_sec <= 0.0 {
            return Err(EngineError::BadStepConfig(format!(
                "bad comb parameters: freq {}, q {}, fs {}",
                config.freq, config.q_factor, config.samples_per_sec
            )));
        }

        let n = (config.samples_per_sec / config.freq).round() as usize;
        if n == 0 {
            return Err(EngineError::BadStepConfig(
                "comb frequency above the sampling rate".into(),
            ));
        }

        // Single-notch comb design: the -3 dB bandwidth freq/Q sets the
        // pole radius through the usual tan mapping.
        let w_delta = 2.0 * PI * (config.freq / config.q_factor) / config.samples_per_sec;
        let beta = (n as f64 * w_delta / 4.0).tan();
        let ax = (1.0 - beta) / (1.0 + beta);

        Ok(Self {
            b0: (1.0 + ax) / 2.0,
            b_n: -(1.0 + ax) / 2.0,
            a_n: -ax,
            n,
            leftover_in: Vec::new(),
            prev_in: vec![0.0; n],
            prev_out: vec![0.0; n],
        })
    }
}

impl Step for CombFilter {
    fn do_step(&mut self, input: Option<&StepData>) -> Option<StepData> {
        let data = input?.as_samples()?;
        if data.is_empty() {
            return None;
        }

        if self.n == 0 {
            // The filter is off.
            return Some(StepData::Samples(data.to_vec()));
        }

        let mut samples = std::mem::take(&mut self.leftover_in);
        samples.extend_from_slice(data);

        let num_batches = samples.len() / self.n;
        if num_batches == 0 {
            self.leftover_in = samples;
            return None;
        }

        let mut result = Vec::with_capacity(num_batches * self.n);

        for batch in 0..num_batches {
            let from = batch * self.n;

            for i in 0..self.n {
                let x = f64::from(samples[from + i]);
                let y = x * self.b0 + self.prev_in[i] * self.b_n - self.prev_out[i] * self.a_n;
                self.prev_in[i] = x;
                self.prev_out[i] = y;
                result.push(y as f32);
            }
        }

        self.leftover_in = samples[num_batches * self.n..].to_vec();
        Some(StepData::Samples(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(freq: f64, q: f64) -> CombFilterConfig {
        CombFilterConfig {
            samples_per_sec: 1000.0,
            freq,
            q_factor: q,
        }
    }

    fn sine(freq: f64, fs: f64, n: usize) -> Vec<f32> {
        (0..n)
            .map(|i| (2.0 * PI * freq * i as f64 / fs).sin() as f32)
            .collect()
    }

    #[test]
    fn test_notch_removes_mains_and_harmonics() {
        let mut filter = CombFilter::new(&config(50.0, 30.0)).unwrap();

        // 50 Hz and its 150 Hz harmonic both sit on comb notches.
        let hum: Vec<f32> = sine(50.0, 1000.0, 8000)
            .iter()
            .zip(sine(150.0, 1000.0, 8000))
            .map(|(a, b)| a + b)
            .collect();

        let input = StepData::Samples(hum);
        let Some(StepData::Samples(out)) = filter.do_step(Some(&input)) else {
            panic!("no output");
        };

        let tail = &out[6000..];
        let peak = tail.iter().fold(0.0f32, |m, &x| m.max(x.abs()));
        assert!(peak < 0.05, "hum survived the comb: {peak}");

        // A mid-bin tone passes.
        let mut filter = CombFilter::new(&config(50.0, 30.0)).unwrap();
        let tone = StepData::Samples(sine(73.0, 1000.0, 8000));
        let Some(StepData::Samples(out)) = filter.do_step(Some(&tone)) else {
            panic!("no output");
        };
        let tail = &out[6000..];
        let peak = tail.iter().fold(0.0f32, |m, &x| m.max(x.abs()));
        assert!(peak > 0.8, "mid-bin tone attenuated: {peak}");
    }

    #[test]
    fn test_emits_whole_periods_and_carries_leftovers() {
        // N = 1000 / 50 = 20.
        let mut filter = CombFilter::new(&config(50.0, 30.0)).unwrap();

        let input = StepData::Samples(vec![0.5; 30]);
        let Some(StepData::Samples(out)) = filter.do_step(Some(&input)) else {
            panic!("no output");
        };
        assert_eq!(out.len(), 20);

        // 10 carried + 15 new: still one whole period.
        let input = StepData::Samples(vec![0.5; 15]);
        let Some(StepData::Samples(out)) = filter.do_step(Some(&input)) else {
            panic!("no output");
        };
        assert_eq!(out.len(), 20);

        // 5 carried + 10 new: under one period, nothing to emit.
        let input = StepData::Samples(vec![0.5; 10]);
        assert!(filter.do_step(Some(&input)).is_none());
    }

    #[test]
    fn test_split_equals_whole() {
        let signal = sine(60.0, 1000.0, 1000);

        let mut whole_filter = CombFilter::new(&config(50.0, 35.0)).unwrap();
        let whole_input = StepData::Samples(signal.clone());
        let Some(StepData::Samples(whole)) = whole_filter.do_step(Some(&whole_input)) else {
            panic!("no output");
        };

        let mut split_filter = CombFilter::new(&config(50.0, 35.0)).unwrap();
        let mut split = Vec::new();
        for chunk in signal.chunks(37) {
            let input = StepData::Samples(chunk.to_vec());
            if let Some(StepData::Samples(out)) = split_filter.do_step(Some(&input)) {
                split.extend(out);
            }
        }

        // The whole run emits all 50 periods; the split run retains under
        // one period of leftovers.
        assert_eq!(whole.len(), 1000);
        assert!(split.len() >= 980);
        for (a, b) in whole.iter().zip(&split) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_zero_freq_is_identity() {
        let mut filter = CombFilter::new(&config(0.0, 30.0)).unwrap();
        let input = StepData::Samples(vec![1.0, 2.0, 3.0]);
        let Some(StepData::Samples(out)) = filter.do_step(Some(&input)) else {
            panic!("no output");
        };
        assert_eq!(out, vec![1.0, 2.0, 3.0]);
    }
}
