//! Band filter: a cascaded-biquad IIR low-pass followed by a high-pass.
//!
//! Either stage can be disabled with the `"none"` family marker. Section
//! state is carried across ticks, so the stream is filtered continuously no
//! matter how the input is split.

use serde::Deserialize;

use crate::engine::step::{Step, StepData};
use crate::error::Result;
use crate::filters::design::{design_iir, sosfilt, BandType, FilterFamily, Sos};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BandFilterConfig {
    pub samples_per_sec: f64,

    #[serde(default)]
    pub low_order: usize,
    #[serde(default, rename = "low3dbFreq")]
    pub low_3db_freq: f64,
    #[serde(default)]
    pub low_rp: Option<f64>,
    #[serde(default)]
    pub low_rs: Option<f64>,
    #[serde(default, rename = "lowFType")]
    pub low_ftype: String,

    #[serde(default)]
    pub high_order: usize,
    #[serde(default, rename = "high3dbFreq")]
    pub high_3db_freq: f64,
    #[serde(default)]
    pub high_rp: Option<f64>,
    #[serde(default)]
    pub high_rs: Option<f64>,
    #[serde(default, rename = "highFType")]
    pub high_ftype: String,
}

struct Stage {
    sos: Vec<Sos>,
    /// Carried section state, `zi`/`zf` style.
    zi: Vec<[f64; 2]>,
}

impl Stage {
    fn design(
        order: usize,
        freq: f64,
        rp: Option<f64>,
        rs: Option<f64>,
        ftype: &str,
        band: BandType,
        fs: f64,
    ) -> Result<Option<Self>> {
        let Some(family) = FilterFamily::parse(ftype)? else {
            return Ok(None);
        };

        let sos = design_iir(order, freq, rp, rs, family, band, fs)?;
        let zi = vec![[0.0; 2]; sos.len()];
        Ok(Some(Self { sos, zi }))
    }

    fn run(&mut self, samples: &[f64]) -> Vec<f64> {
        sosfilt(&self.sos, samples, &mut self.zi)
    }
}

pub struct BandFilter {
    low: Option<Stage>,
    high: Option<Stage>,
}

impl BandFilter {
    pub fn new(config: &BandFilterConfig) -> Result<Self> {
        let low = Stage::design(
            config.low_order,
            config.low_3db_freq,
            config.low_rp,
            config.low_rs,
            &config.low_ftype,
            BandType::Lowpass,
            config.samples_per_sec,
        )?;

        let high = Stage::design(
            config.high_order,
            config.high_3db_freq,
            config.high_rp,
            config.high_rs,
            &config.high_ftype,
            BandType::Highpass,
            config.samples_per_sec,
        )?;

        Ok(Self { low, high })
    }
}

impl Step for BandFilter {
    fn do_step(&mut self, input: Option<&StepData>) -> Option<StepData> {
        let samples = input?.as_samples()?;
        if samples.is_empty() {
            return None;
        }

        let mut data: Vec<f64> = samples.iter().map(|&x| f64::from(x)).collect();

        if let Some(low) = self.low.as_mut() {
            data = low.run(&data);
        }

        if let Some(high) = self.high.as_mut() {
            data = high.run(&data);
        }

        Some(StepData::Samples(data.iter().map(|&x| x as f32).collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn config(low_ftype: &str, high_ftype: &str) -> BandFilterConfig {
        BandFilterConfig {
            samples_per_sec: 1000.0,
            low_order: 4,
            low_3db_freq: 100.0,
            low_rp: None,
            low_rs: None,
            low_ftype: low_ftype.to_string(),
            high_order: 4,
            high_3db_freq: 10.0,
            high_rp: None,
            high_rs: None,
            high_ftype: high_ftype.to_string(),
        }
    }

    fn sine(freq: f64, fs: f64, n: usize) -> Vec<f32> {
        (0..n)
            .map(|i| (2.0 * PI * freq * i as f64 / fs).sin() as f32)
            .collect()
    }

    #[test]
    fn test_band_pass_keeps_midband_kills_stopbands() {
        let mut filter = BandFilter::new(&config("butter", "butter")).unwrap();

        // 50 Hz rides through the 10-100 Hz band; 300 Hz does not.
        let passband = StepData::Samples(sine(50.0, 1000.0, 4000));
        let Some(StepData::Samples(out)) = filter.do_step(Some(&passband)) else {
            panic!("no output");
        };
        let tail = &out[2000..];
        let peak = tail.iter().fold(0.0f32, |m, &x| m.max(x.abs()));
        assert!(peak > 0.9, "passband attenuated to {peak}");

        let mut filter = BandFilter::new(&config("butter", "butter")).unwrap();
        let stopband = StepData::Samples(sine(300.0, 1000.0, 4000));
        let Some(StepData::Samples(out)) = filter.do_step(Some(&stopband)) else {
            panic!("no output");
        };
        let tail = &out[2000..];
        let peak = tail.iter().fold(0.0f32, |m, &x| m.max(x.abs()));
        assert!(peak < 0.01, "stopband leaked {peak}");
    }

    #[test]
    fn test_split_input_equals_whole_input() {
        let signal = sine(40.0, 1000.0, 2000);

        let mut whole_filter = BandFilter::new(&config("butter", "none")).unwrap();
        let whole_input = StepData::Samples(signal.clone());
        let Some(StepData::Samples(whole)) = whole_filter.do_step(Some(&whole_input)) else {
            panic!("no output");
        };

        let mut split_filter = BandFilter::new(&config("butter", "none")).unwrap();
        let mut split = Vec::new();
        for chunk in signal.chunks(123) {
            let input = StepData::Samples(chunk.to_vec());
            if let Some(StepData::Samples(out)) = split_filter.do_step(Some(&input)) {
                split.extend(out);
            }
        }

        assert_eq!(whole.len(), split.len());
        for (a, b) in whole.iter().zip(&split) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_both_stages_none_passes_samples_through() {
        let mut filter = BandFilter::new(&config("none", "none")).unwrap();
        let input = StepData::Samples(vec![1.0, -2.0, 3.0]);

        let Some(StepData::Samples(out)) = filter.do_step(Some(&input)) else {
            panic!("no output");
        };
        assert_eq!(out, vec![1.0, -2.0, 3.0]);
    }

    #[test]
    fn test_empty_input_short_circuits() {
        let mut filter = BandFilter::new(&config("butter", "none")).unwrap();
        assert!(filter.do_step(None).is_none());
        assert!(filter
            .do_step(Some(&StepData::Samples(Vec::new())))
            .is_none());
    }
}
