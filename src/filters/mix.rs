//! Add-another-series: `alpha * this + beta * other`, where the other
//! series is a published step resolved by name at configure time. The
//! shorter of the two tails decides the output length, aligned at the
//! newest end. Ring-buffered sources contribute their full cache; live
//! steps contribute their last-tick result.

use serde::Deserialize;

use crate::engine::step::{PublishedHandle, Step, StepData, StepRegistry};
use crate::error::Result;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddAnotherSeriesFilterConfig {
    #[serde(rename = "addSeriesName")]
    pub other_series_name: String,
    pub this_series_factor: f32,
    pub other_series_factor: f32,
}

pub struct AddAnotherSeriesFilter {
    other_series: PublishedHandle,
    this_series_factor: f32,
    other_series_factor: f32,
}

impl AddAnotherSeriesFilter {
    pub fn new(config: &AddAnotherSeriesFilterConfig, registry: &StepRegistry) -> Result<Self> {
        Ok(Self {
            other_series: registry.get(&config.other_series_name)?,
            this_series_factor: config.this_series_factor,
            other_series_factor: config.other_series_factor,
        })
    }

    fn mix(&self, this: &[f32], other: &[f32]) -> Option<StepData> {
        let num_to_include = this.len().min(other.len());
        if num_to_include == 0 {
            return None;
        }

        let this_tail = &this[this.len() - num_to_include..];
        let other_tail = &other[other.len() - num_to_include..];

        Some(StepData::Samples(
            this_tail
                .iter()
                .zip(other_tail)
                .map(|(&a, &b)| a * self.this_series_factor + b * self.other_series_factor)
                .collect(),
        ))
    }
}

impl Step for AddAnotherSeriesFilter {
    fn do_step(&mut self, input: Option<&StepData>) -> Option<StepData> {
        let this = input?.as_samples()?;
        if this.is_empty() {
            return None;
        }

        match &self.other_series {
            PublishedHandle::Buffer(buffer) => {
                let buffer = buffer.lock();
                self.mix(this, buffer.cache())
            }
            PublishedHandle::Latest(slot) => {
                let slot = slot.lock();
                let other = slot.as_ref().and_then(StepData::as_samples).unwrap_or(&[]);
                self.mix(this, other)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::data_buffer::DataBuffer;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn registry_with_buffer(samples: &[f32]) -> StepRegistry {
        let buffer = Arc::new(Mutex::new(DataBuffer::with_capacity(64)));
        buffer.lock().add_data(samples);

        let mut registry = StepRegistry::new();
        registry.insert("3_ac".to_string(), PublishedHandle::Buffer(buffer));
        registry
    }

    fn config() -> AddAnotherSeriesFilterConfig {
        AddAnotherSeriesFilterConfig {
            other_series_name: "3_ac".to_string(),
            this_series_factor: 1.0,
            other_series_factor: -1.0,
        }
    }

    #[test]
    fn test_mixes_newest_aligned_tails() {
        let registry = registry_with_buffer(&[10.0, 20.0, 30.0, 40.0]);
        let mut filter = AddAnotherSeriesFilter::new(&config(), &registry).unwrap();

        // This series is shorter: align both at the newest end.
        let input = StepData::Samples(vec![1.0, 2.0]);
        let Some(StepData::Samples(out)) = filter.do_step(Some(&input)) else {
            panic!("no output");
        };
        assert_eq!(out, vec![1.0 - 30.0, 2.0 - 40.0]);
    }

    #[test]
    fn test_other_series_shorter_than_this() {
        let registry = registry_with_buffer(&[5.0]);
        let mut filter = AddAnotherSeriesFilter::new(&config(), &registry).unwrap();

        let input = StepData::Samples(vec![1.0, 2.0, 3.0]);
        let Some(StepData::Samples(out)) = filter.do_step(Some(&input)) else {
            panic!("no output");
        };
        assert_eq!(out, vec![3.0 - 5.0]);
    }

    #[test]
    fn test_unknown_series_rejected_at_configure() {
        let registry = StepRegistry::new();
        assert!(AddAnotherSeriesFilter::new(&config(), &registry).is_err());
    }

    #[test]
    fn test_empty_other_cache_yields_none() {
        let buffer = Arc::new(Mutex::new(DataBuffer::with_capacity(64)));
        let mut registry = StepRegistry::new();
        registry.insert("3_ac".to_string(), PublishedHandle::Buffer(buffer));

        let mut filter = AddAnotherSeriesFilter::new(&config(), &registry).unwrap();
        let input = StepData::Samples(vec![1.0]);
        assert!(filter.do_step(Some(&input)).is_none());
    }
}
