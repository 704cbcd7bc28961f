//! Archival writer: chunked per-electrode recording.
//!
//! Each electrode gets two fixed-size append buffers (AC, and DC when the
//! device samples it). The tick loop copies samples in; when a buffer
//! would overflow, the filled buffer is handed to a background writer
//! thread and a fresh one takes its place, with the overflow tail carried
//! over. The writer thread owns the single long-lived file handle and
//! serializes every write: it extends each electrode's dataset by the
//! chunk size and writes at the old tail.
//!
//! Buffer size tuning: larger buffers make the UI pause during writes,
//! smaller ones stop helping past a point.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam_channel::{bounded, Receiver, Sender};
use hdf5::types::VarLenUnicode;
use hdf5::{Extent, File};
use log::{error, info, warn};
use serde::Deserialize;

use crate::electrode::{electrode_name, DeviceProps};
use crate::engine::step::{Step, StepData};
use crate::error::{EngineError, Result};

/// Samples per chunk, per channel. 1 MiB of f32 per channel buffer.
pub const BUFFER_SIZE: usize = 262_144;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NwbFileWriterConfig {
    pub file_path: String,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub resolution: f64,
    #[serde(default = "default_conversion")]
    pub conversion: f64,
    pub samples_per_sec: f64,
    pub num_electrodes: usize,
}

fn default_conversion() -> f64 {
    1.0
}

/// Saturated (or residual) chunks for one background write.
struct WriteJob {
    chunks_ac: Vec<Option<Vec<f32>>>,
    chunks_dc: Vec<Option<Vec<f32>>>,
    chunk_sizes: Vec<usize>,
}

enum WriterMessage {
    Write(WriteJob),
    Finish,
}

pub struct NwbFileWriter {
    num_electrodes: usize,
    can_sample_dc: bool,

    buffers_ac: Vec<Vec<f32>>,
    buffers_dc: Vec<Vec<f32>>,
    buffer_space_used: Vec<usize>,

    job_tx: Option<Sender<WriterMessage>>,
    writer_thread: Option<JoinHandle<()>>,
}

impl NwbFileWriter {
    pub fn new(config: &NwbFileWriterConfig, device_props: &DeviceProps) -> Result<Self> {
        let num_electrodes = config.num_electrodes;
        let can_sample_dc = device_props.can_sample_dc;

        let file = create_recording_file(config, device_props)?;
        info!(
            "recording {} electrodes to {}",
            num_electrodes, config.file_path
        );

        let (job_tx, job_rx) = bounded(64);
        let writer_thread = thread::Builder::new()
            .name("nwb-writer".to_string())
            .spawn(move || writer_loop(file, num_electrodes, can_sample_dc, job_rx))?;

        Ok(Self {
            num_electrodes,
            can_sample_dc,
            buffers_ac: (0..num_electrodes).map(|_| vec![0.0; BUFFER_SIZE]).collect(),
            buffers_dc: if can_sample_dc {
                (0..num_electrodes).map(|_| vec![0.0; BUFFER_SIZE]).collect()
            } else {
                Vec::new()
            },
            buffer_space_used: vec![0; num_electrodes],
            job_tx: Some(job_tx),
            writer_thread: Some(writer_thread),
        })
    }

    fn write_channels(&mut self, channels: &HashMap<String, Vec<f32>>) {
        if self.job_tx.is_none() {
            return;
        }

        let mut chunks_ac: Vec<Option<Vec<f32>>> = vec![None; self.num_electrodes];
        let mut chunks_dc: Vec<Option<Vec<f32>>> = vec![None; self.num_electrodes];
        let mut has_chunks_to_write = false;

        for i in 0..self.num_electrodes {
            let empty: &[f32] = &[];
            let samples_ac = channels
                .get(&electrode_name(i, "ac"))
                .map_or(empty, Vec::as_slice);
            let samples_dc = channels
                .get(&electrode_name(i, "dc"))
                .map_or(empty, Vec::as_slice);

            // AC and DC arrive in equal counts.
            let num_samples = samples_ac.len();
            if num_samples == 0 {
                continue;
            }

            let used = self.buffer_space_used[i];

            if used + num_samples > BUFFER_SIZE {
                // Saturate the buffer, hand it off, carry the tail over.
                let num_to_copy = BUFFER_SIZE - used;
                let num_left_over = num_samples - num_to_copy;

                self.buffers_ac[i][used..].copy_from_slice(&samples_ac[..num_to_copy]);
                let mut fresh = vec![0.0; BUFFER_SIZE];
                fresh[..num_left_over].copy_from_slice(&samples_ac[num_to_copy..]);
                chunks_ac[i] = Some(std::mem::replace(&mut self.buffers_ac[i], fresh));

                if self.can_sample_dc {
                    self.buffers_dc[i][used..].copy_from_slice(&samples_dc[..num_to_copy]);
                    let mut fresh = vec![0.0; BUFFER_SIZE];
                    fresh[..num_left_over].copy_from_slice(&samples_dc[num_to_copy..]);
                    chunks_dc[i] = Some(std::mem::replace(&mut self.buffers_dc[i], fresh));
                }

                self.buffer_space_used[i] = num_left_over;
                has_chunks_to_write = true;
            } else {
                self.buffers_ac[i][used..used + num_samples].copy_from_slice(samples_ac);

                if self.can_sample_dc {
                    self.buffers_dc[i][used..used + num_samples].copy_from_slice(samples_dc);
                }

                self.buffer_space_used[i] += num_samples;
            }
        }

        if !has_chunks_to_write {
            return;
        }

        let job = WriteJob {
            chunks_ac,
            chunks_dc,
            chunk_sizes: vec![BUFFER_SIZE; self.num_electrodes],
        };

        if let Some(job_tx) = &self.job_tx {
            // The bounded queue paces the tick loop against slow disks.
            if job_tx.send(WriterMessage::Write(job)).is_err() {
                error!("recording writer thread is gone; chunk dropped");
            }
        }
    }
}

impl Step for NwbFileWriter {
    fn do_step(&mut self, input: Option<&StepData>) -> Option<StepData> {
        if let Some(StepData::Channels(channels)) = input {
            if !channels.is_empty() {
                self.write_channels(channels);
            }
        }

        None
    }

    /// Flush residual partial buffers and stop the writer thread.
    fn finalize(&mut self) {
        let Some(job_tx) = self.job_tx.take() else {
            return;
        };

        let residual = WriteJob {
            chunks_ac: self.buffers_ac.drain(..).map(Some).collect(),
            chunks_dc: if self.can_sample_dc {
                self.buffers_dc.drain(..).map(Some).collect()
            } else {
                vec![None; self.num_electrodes]
            },
            chunk_sizes: std::mem::take(&mut self.buffer_space_used),
        };

        let _ = job_tx.send(WriterMessage::Write(residual));
        let _ = job_tx.send(WriterMessage::Finish);
        drop(job_tx);

        if let Some(writer_thread) = self.writer_thread.take() {
            let _ = writer_thread.join();
        }
    }
}

impl Drop for NwbFileWriter {
    fn drop(&mut self) {
        self.finalize();
    }
}

/// Create the recording file: extendible compressed datasets per series,
/// device metadata, and the device-properties JSON in `notes`.
fn create_recording_file(config: &NwbFileWriterConfig, device_props: &DeviceProps) -> Result<File> {
    let path = Path::new(&config.file_path);

    if path.exists() {
        if !path.is_file() {
            return Err(EngineError::FormatRejected {
                path: config.file_path.clone(),
                reason: "not a regular file".to_string(),
            });
        }

        warn!("overwriting existing recording {}", config.file_path);
        fs::remove_file(path)?;
    }

    let file = File::create(path)?;

    let notes_json = serde_json::to_string(device_props)
        .map_err(|e| EngineError::Recording(e.to_string()))?;
    let notes: VarLenUnicode = notes_json
        .parse()
        .map_err(|_| EngineError::Recording("device properties are not valid UTF-8".into()))?;
    file.new_attr::<VarLenUnicode>()
        .create("notes")?
        .write_scalar(&notes)?;

    let device_name: VarLenUnicode = device_props
        .name
        .parse()
        .map_err(|_| EngineError::Recording("bad device name".into()))?;
    file.new_attr::<VarLenUnicode>()
        .create("device")?
        .write_scalar(&device_name)?;

    // Electrode positions: one (x, 0, 0, 1) row per electrode.
    let positions: Vec<f64> = (0..config.num_electrodes)
        .flat_map(|i| [i as f64, 0.0, 0.0, 1.0])
        .collect();
    let electrodes = file
        .new_dataset::<f64>()
        .shape([config.num_electrodes, 4])
        .create("electrodes")?;
    electrodes.write_raw(&positions)?;

    let acquisition = file.create_group("acquisition")?;
    let starting_time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);

    let mut series_names = Vec::with_capacity(config.num_electrodes * 2);
    for i in 0..config.num_electrodes {
        series_names.push(electrode_name(i, "ac"));
        if device_props.can_sample_dc {
            series_names.push(electrode_name(i, "dc"));
        }
    }

    for name in &series_names {
        let dataset = acquisition
            .new_dataset::<f32>()
            .chunk(BUFFER_SIZE)
            .shape(Extent::resizable(0))
            .deflate(4)
            .shuffle()
            .fill_value(f32::NAN)
            .create(name.as_str())?;

        dataset
            .new_attr::<f64>()
            .create("rate")?
            .write_scalar(&config.samples_per_sec)?;
        dataset
            .new_attr::<f64>()
            .create("resolution")?
            .write_scalar(&config.resolution)?;
        dataset
            .new_attr::<f64>()
            .create("conversion")?
            .write_scalar(&config.conversion)?;
        dataset
            .new_attr::<f64>()
            .create("starting_time")?
            .write_scalar(&starting_time)?;
    }

    Ok(file)
}

/// Background writer: the only place the file is written. Jobs arrive in
/// order; each extends the datasets by its chunk sizes.
fn writer_loop(file: File, num_electrodes: usize, can_dc: bool, job_rx: Receiver<WriterMessage>) {
    let mut samples_written = vec![0usize; num_electrodes];

    while let Ok(message) = job_rx.recv() {
        match message {
            WriterMessage::Write(job) => {
                if let Err(e) = write_job(&file, can_dc, &mut samples_written, &job) {
                    error!("recording write failed: {e}");
                }
            }
            WriterMessage::Finish => break,
        }
    }

    if let Err(e) = file.flush() {
        error!("recording flush failed: {e}");
    }
}

fn write_job(
    file: &File,
    can_dc: bool,
    samples_written: &mut [usize],
    job: &WriteJob,
) -> Result<()> {
    for (i, chunk_ac) in job.chunks_ac.iter().enumerate() {
        let chunk_size = job.chunk_sizes[i];
        let Some(chunk_ac) = chunk_ac else {
            continue;
        };
        if chunk_size == 0 {
            continue;
        }

        let old_length = samples_written[i];
        let new_length = old_length + chunk_size;

        let dataset_ac = file.dataset(&format!("acquisition/{}", electrode_name(i, "ac")))?;
        dataset_ac.resize(new_length)?;
        dataset_ac.write_slice(&chunk_ac[..chunk_size], old_length..new_length)?;

        if can_dc {
            if let Some(chunk_dc) = &job.chunks_dc[i] {
                let dataset_dc =
                    file.dataset(&format!("acquisition/{}", electrode_name(i, "dc")))?;
                dataset_dc.resize(new_length)?;
                dataset_dc.write_slice(&chunk_dc[..chunk_size], old_length..new_length)?;
            }
        }

        samples_written[i] = new_length;
    }

    Ok(())
}
