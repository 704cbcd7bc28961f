//! Spectrogram: per-period spectral density magnitudes.
//!
//! For every `round(fs * period)` samples, a real-input DFT is taken; the
//! magnitudes of the first `floor(max_freq * period) + 1` bins, normalized
//! to spectral density (forward-normalized DFT divided by the square root
//! of the bin bandwidth), are concatenated into one flat output. Leftover
//! samples carry across ticks.

use std::sync::Arc;

use num_complex::Complex64;
use realfft::{RealFftPlanner, RealToComplex};
use serde::Deserialize;

use crate::engine::step::{Step, StepData};
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpectrogramFilterConfig {
    pub samples_per_sec: f64,
    pub calculation_period: f64,
    pub max_freq: f64,
}

pub struct SpectrogramFilter {
    samples_per_period: usize,
    num_frequencies: usize,
    sqrt_bandwidth: f64,

    fft: Arc<dyn RealToComplex<f64>>,
    leftover_samples: Vec<f32>,
}

impl SpectrogramFilter {
    pub fn new(config: &SpectrogramFilterConfig) -> Result<Self> {
        let samples_per_period =
            (config.samples_per_sec * config.calculation_period).round() as usize;
        if samples_per_period == 0 {
            return Err(EngineError::BadStepConfig(
                "calculation period is under one sample".into(),
            ));
        }

        // One bin per 1/period Hz, plus the DC bin.
        let num_frequencies = (config.max_freq * config.calculation_period).floor() as usize + 1;
        if num_frequencies > samples_per_period / 2 + 1 {
            return Err(EngineError::BadStepConfig(format!(
                "maxFreq {} exceeds the Nyquist bins of a {}-sample period",
                config.max_freq, samples_per_period
            )));
        }

        let fft = RealFftPlanner::<f64>::new().plan_fft_forward(samples_per_period);

        Ok(Self {
            samples_per_period,
            num_frequencies,
            sqrt_bandwidth: (1.0 / config.calculation_period).sqrt(),
            fft,
            leftover_samples: Vec::new(),
        })
    }
}

impl Step for SpectrogramFilter {
    fn do_step(&mut self, input: Option<&StepData>) -> Option<StepData> {
        let data = input?.as_samples()?;
        if data.is_empty() {
            return None;
        }

        let mut samples = std::mem::take(&mut self.leftover_samples);
        samples.extend_from_slice(data);

        let num_periods = samples.len() / self.samples_per_period;
        if num_periods == 0 {
            self.leftover_samples = samples;
            return None;
        }

        let mut spectrogram = Vec::with_capacity(num_periods * self.num_frequencies);
        let mut input_buf = self.fft.make_input_vec();
        let mut spectrum: Vec<Complex64> = self.fft.make_output_vec();

        let scale = 1.0 / (self.samples_per_period as f64 * self.sqrt_bandwidth);

        for period in 0..num_periods {
            let from = period * self.samples_per_period;

            for (slot, &sample) in input_buf
                .iter_mut()
                .zip(&samples[from..from + self.samples_per_period])
            {
                *slot = f64::from(sample);
            }

            if self.fft.process(&mut input_buf, &mut spectrum).is_err() {
                return None;
            }

            spectrogram.extend(
                spectrum[..self.num_frequencies]
                    .iter()
                    .map(|bin| (bin.norm() * scale) as f32),
            );
        }

        self.leftover_samples = samples[num_periods * self.samples_per_period..].to_vec();
        Some(StepData::Samples(spectrogram))
    }
}
