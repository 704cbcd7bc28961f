//! Waveform-file stimulation.
//!
//! Each configured 8-bit mono PCM file drives a set of electrodes. The
//! emitter keeps a rolling three-second lookahead of command words queued in
//! the chip FIFOs: every call reads just enough frames to top the lookahead
//! up, converts each frame into per-electrode current writes, and closes
//! the frame with one triggered polarity write per chip. Frames stay 4-word
//! aligned and equally sized across chips so all chips step together.

use std::fs::File;
use std::io::BufReader;
use std::time::Instant;

use hound::WavReader;
use log::{debug, info};

use crate::electrode::{chip_electrode_of, chip_of, NUM_CHIPS};
use crate::error::{EngineError, Result};
use crate::stim::rhs2116::{
    electrode_bit, read_chip_id, write_current, write_register, REG_CHARGE_RECOV_SWITCH,
    REG_STIM_ON, REG_STIM_POLARITY,
};
use crate::stim::{ChipCommands, StimConfig, Stimulator};

/// Seconds of command stream kept queued ahead of real time.
const EMIT_AHEAD_SEC: f64 = 3.0;

type FileReader = WavReader<BufReader<File>>;

pub struct WavStimulator {
    max_freq: u32,
    file_paths: Vec<String>,
    files: Vec<Option<FileReader>>,

    emit_start_time: Option<Instant>,
    prev_emit_time: Option<Instant>,
    frames_emitted: u64,
    is_done_emitting: bool,
    stop_requested: bool,

    electrodes_by_file: Vec<Vec<usize>>,
    all_electrode_flags: [u32; NUM_CHIPS],
    num_electrodes_per_chip: [usize; NUM_CHIPS],
    pad_commands: [usize; NUM_CHIPS],
    chips_used: Vec<usize>,
    loop_forever: bool,
}

impl WavStimulator {
    pub fn new(config: &StimConfig) -> Result<Self> {
        let mut stimulator = Self {
            max_freq: 0,
            file_paths: Vec::new(),
            files: Vec::new(),
            emit_start_time: None,
            prev_emit_time: None,
            frames_emitted: 0,
            is_done_emitting: true,
            stop_requested: false,
            electrodes_by_file: Vec::new(),
            all_electrode_flags: [0; NUM_CHIPS],
            num_electrodes_per_chip: [0; NUM_CHIPS],
            pad_commands: [0; NUM_CHIPS],
            chips_used: Vec::new(),
            loop_forever: false,
        };

        stimulator.update_config(config)?;
        Ok(stimulator)
    }

    fn open_files(&mut self) -> Result<()> {
        self.files.clear();

        for path in &self.file_paths {
            let reader = WavReader::open(path).map_err(|e| {
                EngineError::BadStimConfig(format!("cannot open waveform file {path}: {e}"))
            })?;

            let spec = reader.spec();
            if spec.bits_per_sample != 8 || spec.channels != 1 {
                return Err(EngineError::BadStimConfig(format!(
                    "waveform file {path} must be 8-bit mono PCM, got {}-bit x{}",
                    spec.bits_per_sample, spec.channels
                )));
            }

            self.files.push(Some(reader));
        }

        Ok(())
    }

    /// Read up to `n` frames from one file; a short result means the file
    /// ran out.
    fn read_frames(reader: &mut FileReader, n: usize) -> Vec<i8> {
        reader
            .samples::<i8>()
            .take(n)
            .map_while(|s| s.ok())
            .collect()
    }

    fn turn_off_electrodes(&self, commands: &mut ChipCommands) {
        for &chip in &self.chips_used {
            let stream = commands.entry(chip).or_default();

            for _ in 0..3 {
                stream.extend_from_slice(&read_chip_id());
            }
            stream.extend_from_slice(&write_register(REG_STIM_ON, 0, true));

            stream.extend_from_slice(&write_register(
                REG_CHARGE_RECOV_SWITCH,
                self.all_electrode_flags[chip],
                true,
            ));
            for _ in 0..10 {
                stream.extend_from_slice(&read_chip_id());
            }
            stream.extend_from_slice(&write_register(REG_CHARGE_RECOV_SWITCH, 0, true));
        }
    }
}

impl Stimulator for WavStimulator {
    fn pulse_type(&self) -> &'static str {
        "wav_files"
    }

    fn update_config(&mut self, config: &StimConfig) -> Result<()> {
        self.on_stimulation_done();

        self.max_freq = config.max_frequency;
        self.file_paths = config.pulse_config.file_paths.clone();
        self.electrodes_by_file = config.electrodes_by_pulse.clone();
        self.loop_forever = config.loop_forever;
        Ok(())
    }

    fn on_stimulation_starting(&mut self) -> Result<()> {
        self.open_files()?;

        self.emit_start_time = None;
        self.prev_emit_time = None;
        self.frames_emitted = 0;
        self.is_done_emitting = false;
        self.stop_requested = false;

        // Gather per-chip electrode stats so every frame's commands can be
        // padded to the same 4-word-aligned width on every chip.
        self.all_electrode_flags = [0; NUM_CHIPS];
        self.num_electrodes_per_chip = [0; NUM_CHIPS];

        for electrodes in &self.electrodes_by_file {
            for &electrode in electrodes {
                let chip = chip_of(electrode);
                self.num_electrodes_per_chip[chip] += 1;
                self.all_electrode_flags[chip] |= electrode_bit(chip_electrode_of(electrode));
            }
        }

        self.chips_used = (0..NUM_CHIPS)
            .filter(|&chip| self.num_electrodes_per_chip[chip] > 0)
            .collect();

        if self.chips_used.is_empty() {
            self.is_done_emitting = true;
            return Ok(());
        }

        // Frame width: electrode writes plus one polarity trigger, rounded
        // up to a whole 4-word block.
        let max_chip_commands = self.num_electrodes_per_chip.iter().copied().max().unwrap_or(0) + 1;
        let pad_to_commands = max_chip_commands + (4 - (max_chip_commands % 4)) % 4;

        for &chip in &self.chips_used {
            self.pad_commands[chip] = pad_to_commands - self.num_electrodes_per_chip[chip] - 1;
        }

        Ok(())
    }

    fn emit_next_commands(&mut self) -> Result<ChipCommands> {
        if self.is_done_emitting {
            return Ok(ChipCommands::new());
        }

        let now = Instant::now();
        let mut commands = ChipCommands::new();

        let emit_start = match self.emit_start_time {
            Some(start) => start,
            None => {
                self.emit_start_time = Some(now);
                self.prev_emit_time = Some(now);

                // Arm all electrodes without triggering; the first frame's
                // polarity write fires them.
                for &chip in &self.chips_used {
                    let stream = commands.entry(chip).or_default();
                    for _ in 0..3 {
                        stream.extend_from_slice(&read_chip_id());
                    }
                    stream.extend_from_slice(&write_register(
                        REG_STIM_ON,
                        self.all_electrode_flags[chip],
                        false,
                    ));
                }

                now
            }
        };

        if self.stop_requested {
            self.is_done_emitting = true;
            let mut off = ChipCommands::new();
            self.turn_off_electrodes(&mut off);
            return Ok(off);
        }

        // Top the lookahead up to EMIT_AHEAD_SEC of frames.
        let emit_to_sec = now.duration_since(emit_start).as_secs_f64() + EMIT_AHEAD_SEC;
        let should_be_at_frames = (emit_to_sec * f64::from(self.max_freq)).round() as u64;
        let mut num_frames_to_emit = (should_be_at_frames - self.frames_emitted) as usize;

        let mut frames: Vec<Vec<i8>> = Vec::with_capacity(self.files.len());
        let mut max_frames_read = 0usize;

        for slot in self.files.iter_mut() {
            let Some(reader) = slot.as_mut() else {
                frames.push(Vec::new());
                continue;
            };

            let mut file_frames = Self::read_frames(reader, num_frames_to_emit);

            if file_frames.len() < num_frames_to_emit {
                if self.loop_forever {
                    reader
                        .seek(0)
                        .map_err(|e| EngineError::BadStimConfig(format!("rewind failed: {e}")))?;
                    let remainder =
                        Self::read_frames(reader, num_frames_to_emit - file_frames.len());
                    file_frames.extend_from_slice(&remainder);
                    max_frames_read = num_frames_to_emit;
                } else {
                    max_frames_read = max_frames_read.max(file_frames.len());
                    *slot = None;
                }
            } else {
                max_frames_read = num_frames_to_emit;
            }

            frames.push(file_frames);
        }

        // The shortest file decides when the whole stimulation ends.
        let mut will_be_done = false;

        if max_frames_read < num_frames_to_emit {
            will_be_done = true;
            num_frames_to_emit = max_frames_read;
        }

        if let Some(prev) = self.prev_emit_time {
            debug!(
                "emitting {} waveform frames ({:.1} ms since last emit)",
                num_frames_to_emit,
                now.duration_since(prev).as_secs_f64() * 1000.0
            );
        }

        // Translate frames into chip commands.
        for frame_num in 0..num_frames_to_emit {
            let mut pos_electrode_flags = [0u32; NUM_CHIPS];

            for (file_num, electrodes) in self.electrodes_by_file.iter().enumerate() {
                let value = frames
                    .get(file_num)
                    .and_then(|f| f.get(frame_num))
                    .map(|&s| i32::from(s))
                    .unwrap_or(0);

                for &electrode in electrodes {
                    let chip_electrode = chip_electrode_of(electrode);
                    let chip = chip_of(electrode);

                    commands
                        .entry(chip)
                        .or_default()
                        .extend_from_slice(&write_current(chip_electrode, value, false));

                    if value >= 0 {
                        pos_electrode_flags[chip] |= electrode_bit(chip_electrode);
                    }
                }
            }

            for &chip in &self.chips_used {
                let stream = commands.entry(chip).or_default();

                for _ in 0..self.pad_commands[chip] {
                    stream.extend_from_slice(&read_chip_id());
                }

                stream.extend_from_slice(&write_register(
                    REG_STIM_POLARITY,
                    pos_electrode_flags[chip],
                    true,
                ));
            }
        }

        if will_be_done {
            info!("waveform stimulation reached end of file");
            self.is_done_emitting = true;
            self.turn_off_electrodes(&mut commands);
        }

        self.frames_emitted = should_be_at_frames;
        self.prev_emit_time = Some(now);
        Ok(commands)
    }

    fn is_done(&self) -> bool {
        self.is_done_emitting
    }

    fn stop_stimulation(&mut self) {
        self.stop_requested = true;
    }

    fn on_stimulation_done(&mut self) {
        self.emit_start_time = None;
        self.files.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stim::words;
    use std::io::Cursor;

    fn write_wav(samples: &[u8]) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 20_000,
            bits_per_sample: 8,
            sample_format: hound::SampleFormat::Int,
        };

        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for &s in samples {
                // Raw PCM bytes are unsigned; hound stores 8-bit samples
                // through their signed midpoint-centered value.
                writer.write_sample((i16::from(s) - 128) as i8).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    fn config_with_file(path: &str) -> StimConfig {
        StimConfig {
            pulse_type: "wav_files".to_string(),
            max_frequency: 20_000,
            stim_step_size_index: 6,
            electrodes_by_pulse: vec![vec![0, 1]],
            inverse_electrodes: Vec::new(),
            loop_forever: false,
            pulse_config: crate::stim::PulseConfig {
                file_paths: vec![path.to_string()],
                ..Default::default()
            },
        }
    }

    fn temp_wav(samples: &[u8]) -> tempfile::NamedTempFile {
        let file = tempfile::Builder::new().suffix(".wav").tempfile().unwrap();
        std::fs::write(file.path(), write_wav(samples)).unwrap();
        file
    }

    #[test]
    fn test_emit_arms_electrodes_then_streams_frames() {
        // Midpoint (0x80) decodes to current 0; 0x82 to +2.
        let wav = temp_wav(&[0x80, 0x82, 0x7e]);
        let config = config_with_file(wav.path().to_str().unwrap());

        let mut stim = WavStimulator::new(&config).unwrap();
        stim.on_stimulation_starting().unwrap();
        assert!(!stim.is_done());

        let commands = stim.emit_next_commands().unwrap();
        let chip0 = words(&commands[&0]);

        // Arming block: three pads and a non-triggered STIM_ON with both
        // electrode bits.
        assert_eq!(chip0[0], 0xc0ff_0000);
        assert_eq!(chip0[3], 0x802a_0003);

        // Frame width: 2 current writes + 1 pad + 1 polarity trigger.
        // Three file frames then the shutdown block (file is exhausted).
        assert_eq!(chip0.len(), 4 + 3 * 4 + 16);
        assert_eq!(chip0.len() % 4, 0);

        // Frame 0: value 0 -> positive bank, magnitude 0, both electrodes
        // positive in the polarity trigger.
        assert_eq!(chip0[4], 0x8060_8000);
        assert_eq!(chip0[5], 0x8061_8000);
        assert_eq!(chip0[6], 0xc0ff_0000);
        assert_eq!(chip0[7], 0xa02c_0003);

        // Frame 2: value -2 -> negative bank, polarity mask empty.
        assert_eq!(chip0[12], 0x8040_8002);
        assert_eq!(chip0[15], 0xa02c_0000);

        assert!(stim.is_done());
    }

    #[test]
    fn test_stop_request_turns_off_electrodes() {
        let samples = vec![0x80u8; 200_000];
        let wav = temp_wav(&samples);
        let mut config = config_with_file(wav.path().to_str().unwrap());
        config.loop_forever = true;

        let mut stim = WavStimulator::new(&config).unwrap();
        stim.on_stimulation_starting().unwrap();

        let _ = stim.emit_next_commands().unwrap();
        assert!(!stim.is_done());

        stim.stop_stimulation();
        let off = stim.emit_next_commands().unwrap();
        assert!(stim.is_done());

        let chip0 = words(&off[&0]);
        assert_eq!(chip0.len(), 16);
        assert_eq!(chip0[3], 0xa02a_0000); // STIM_ON = 0, triggered
        assert_eq!(chip0[4], 0xa02e_0003); // charge recovery on
        assert_eq!(chip0[15], 0xa02e_0000); // charge recovery off
    }

    #[test]
    fn test_loop_forever_rewinds_instead_of_stopping() {
        let wav = temp_wav(&[0x90, 0x70]);
        let mut config = config_with_file(wav.path().to_str().unwrap());
        config.loop_forever = true;
        config.electrodes_by_pulse = vec![vec![0]];

        let mut stim = WavStimulator::new(&config).unwrap();
        stim.on_stimulation_starting().unwrap();
        let commands = stim.emit_next_commands().unwrap();

        // 3 s lookahead at 20 kHz wants 60 000 frames from a 2-frame file;
        // looping keeps the stream going and the stimulator alive.
        assert!(!stim.is_done());
        let chip0 = words(&commands[&0]);
        // Arming block + 60 000 frames x 4 words.
        assert_eq!(chip0.len(), 4 + 60_000 * 4);
    }
}
