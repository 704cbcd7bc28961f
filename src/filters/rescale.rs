//! Rescaling: `y = (x + offset) * multiplier`, element-wise.

use serde::Deserialize;

use crate::engine::step::{Step, StepData};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RescalingFilterConfig {
    pub offset: f32,
    pub multiplier: f32,
}

pub struct RescalingFilter {
    offset: f32,
    multiplier: f32,
}

impl RescalingFilter {
    pub fn new(config: &RescalingFilterConfig) -> Self {
        Self {
            offset: config.offset,
            multiplier: config.multiplier,
        }
    }
}

impl Step for RescalingFilter {
    fn do_step(&mut self, input: Option<&StepData>) -> Option<StepData> {
        let samples = input?.as_samples()?;
        if samples.is_empty() {
            return None;
        }

        Some(StepData::Samples(
            samples
                .iter()
                .map(|&x| (x + self.offset) * self.multiplier)
                .collect(),
        ))
    }
}
