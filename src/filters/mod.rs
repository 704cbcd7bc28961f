//! DSP steps and the step factory.
//!
//! Pipelines are configured as JSON arrays of step specs: a bare string
//! names a published step (a source), an object names a step type plus its
//! parameters.

use serde_json::Value;

use crate::electrode::DeviceProps;
use crate::engine::pipeline::PipelineStage;
use crate::engine::step::StepRegistry;
use crate::error::{EngineError, Result};
use crate::sink::nwb_writer::{NwbFileWriter, NwbFileWriterConfig};

pub mod band;
pub mod comb;
pub mod design;
pub mod mix;
pub mod resample;
pub mod rescale;
pub mod spectrogram;
pub mod subsample;

pub use band::{BandFilter, BandFilterConfig};
pub use comb::{CombFilter, CombFilterConfig};
pub use mix::{AddAnotherSeriesFilter, AddAnotherSeriesFilterConfig};
pub use resample::{ResamplingFilter, ResamplingFilterConfig};
pub use rescale::{RescalingFilter, RescalingFilterConfig};
pub use spectrogram::{SpectrogramFilter, SpectrogramFilterConfig};
pub use subsample::{SubsamplingFilter, SubsamplingFilterConfig};

fn parse_config<T: serde::de::DeserializeOwned>(spec: &Value) -> Result<T> {
    serde_json::from_value(spec.clone()).map_err(|e| EngineError::BadStepConfig(e.to_string()))
}

/// Build one pipeline stage from its JSON spec.
pub fn build_stage(
    spec: &Value,
    registry: &StepRegistry,
    device_props: &DeviceProps,
) -> Result<PipelineStage> {
    if let Some(name) = spec.as_str() {
        return Ok(PipelineStage::published(registry.get(name)?));
    }

    let step_type = spec
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::BadStepConfig("step spec has no name".into()))?;

    let step: Box<dyn crate::engine::step::Step> = match step_type {
        "AddAnotherSeriesFilter" => Box::new(AddAnotherSeriesFilter::new(
            &parse_config::<AddAnotherSeriesFilterConfig>(spec)?,
            registry,
        )?),
        "BandFilter" => Box::new(BandFilter::new(&parse_config::<BandFilterConfig>(spec)?)?),
        "CombFilter" => Box::new(CombFilter::new(&parse_config::<CombFilterConfig>(spec)?)?),
        "NwbFileWriter" => Box::new(NwbFileWriter::new(
            &parse_config::<NwbFileWriterConfig>(spec)?,
            device_props,
        )?),
        "ResamplingFilter" => Box::new(ResamplingFilter::new(&parse_config::<
            ResamplingFilterConfig,
        >(spec)?)?),
        "RescalingFilter" => Box::new(RescalingFilter::new(&parse_config::<RescalingFilterConfig>(
            spec,
        )?)),
        "SpectrogramFilter" => Box::new(SpectrogramFilter::new(&parse_config::<
            SpectrogramFilterConfig,
        >(spec)?)?),
        "SubsamplingFilter" => Box::new(SubsamplingFilter::new(&parse_config::<
            SubsamplingFilterConfig,
        >(spec)?)?),
        other => return Err(EngineError::UnknownStepType(other.to_string())),
    };

    Ok(PipelineStage::filter(step))
}
