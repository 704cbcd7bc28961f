//! Biphasic pulse command generation.
//!
//! One emit call produces the full command stream for a single pulse:
//! phase-1 current setup, synchronized trigger, phase-2 preload, timed
//! padding, optional interphase gap, phase-2 trigger, and charge recovery.
//! Pulse timing is expressed in command words: the FIFO hardware consumes
//! four words per sample period, so one sample period of delay costs
//! `4 × max_freq` words per second.

use log::warn;

use crate::electrode::{chip_electrode_of, chip_of, NUM_CHIPS};
use crate::error::Result;
use crate::stim::rhs2116::{
    electrode_bit, read_chip_id, write_current, write_register, REG_CHARGE_RECOV_SWITCH,
    REG_STIM_ON, REG_STIM_POLARITY, STIM_STEP_SIZES,
};
use crate::stim::{ChipCommands, StimConfig, Stimulator};

pub struct BiphasicStimulator {
    config: StimConfig,
    stim_step_size_index: usize,
    max_freq: u32,
}

impl BiphasicStimulator {
    pub fn new(config: &StimConfig, stim_step_size_index: usize, max_freq: u32) -> Self {
        Self {
            config: config.clone(),
            stim_step_size_index,
            max_freq,
        }
    }
}

impl Stimulator for BiphasicStimulator {
    fn pulse_type(&self) -> &'static str {
        "biphasic"
    }

    fn update_config(&mut self, config: &StimConfig) -> Result<()> {
        self.config = config.clone();
        self.max_freq = config.max_frequency;
        self.stim_step_size_index = config.stim_step_size_index;
        Ok(())
    }

    fn emit_next_commands(&mut self) -> Result<ChipCommands> {
        let stim_step_size = STIM_STEP_SIZES[self.stim_step_size_index];
        let empty = Vec::new();
        let main_electrodes = self
            .config
            .electrodes_by_pulse
            .first()
            .unwrap_or(&empty);
        let inverse_electrodes = &self.config.inverse_electrodes;
        let pulse = &self.config.pulse_config;

        if main_electrodes.is_empty() && inverse_electrodes.is_empty() {
            warn!("biphasic pulse requested with no electrodes selected");
            return Ok(ChipCommands::new());
        }

        let phase1_current = (pulse.phase1_current / stim_step_size).round() as i32;

        let mut commands: Vec<Vec<u8>> = vec![Vec::new(); NUM_CHIPS];
        let mut main_electrode_flags = [0u32; NUM_CHIPS];
        let mut inverse_electrode_flags = [0u32; NUM_CHIPS];
        let mut all_electrode_flags = [0u32; NUM_CHIPS];
        let mut setup_steps_counts = [0usize; NUM_CHIPS];
        let mut chips_used = [false; NUM_CHIPS];

        // Phase 1 setup: program every electrode's current magnitude.
        for &electrode in main_electrodes {
            let chip_electrode = chip_electrode_of(electrode);
            let chip = chip_of(electrode);
            chips_used[chip] = true;

            commands[chip].extend_from_slice(&write_current(chip_electrode, phase1_current, false));
            let bit = electrode_bit(chip_electrode);
            main_electrode_flags[chip] |= bit;
            all_electrode_flags[chip] |= bit;
            setup_steps_counts[chip] += 1;
        }

        for &electrode in inverse_electrodes {
            let chip_electrode = chip_electrode_of(electrode);
            let chip = chip_of(electrode);
            chips_used[chip] = true;

            commands[chip].extend_from_slice(&write_current(chip_electrode, -phase1_current, false));
            let bit = electrode_bit(chip_electrode);
            inverse_electrode_flags[chip] |= bit;
            all_electrode_flags[chip] |= bit;
            setup_steps_counts[chip] += 1;
        }

        // All electrodes must start together, and chip commands must line up
        // on 4-word blocks after the two trigger words below.
        let num_phase1_setup_commands = setup_steps_counts.iter().copied().max().unwrap_or(0);
        let extra_pad_commands = (4 - (num_phase1_setup_commands + 2) % 4) % 4;
        let pad_to_steps = num_phase1_setup_commands + extra_pad_commands;

        for chip in 0..NUM_CHIPS {
            if !chips_used[chip] {
                continue;
            }

            for _ in setup_steps_counts[chip]..pad_to_steps {
                commands[chip].extend_from_slice(&read_chip_id());
            }
        }

        // Trigger phase 1.
        for chip in 0..NUM_CHIPS {
            if !chips_used[chip] {
                continue;
            }

            let positive_current_electrodes = if phase1_current > 0 {
                main_electrode_flags[chip]
            } else {
                inverse_electrode_flags[chip]
            };

            commands[chip].extend_from_slice(&write_register(
                REG_STIM_POLARITY,
                positive_current_electrodes,
                false,
            ));
            commands[chip].extend_from_slice(&write_register(
                REG_STIM_ON,
                all_electrode_flags[chip],
                true,
            ));
        }

        // Preload phase 2 currents right away; they are triggered later.
        let phase2_current = (pulse.phase2_current / stim_step_size).round() as i32;

        for &electrode in main_electrodes {
            commands[chip_of(electrode)].extend_from_slice(&write_current(
                chip_electrode_of(electrode),
                phase2_current,
                false,
            ));
        }

        for &electrode in inverse_electrodes {
            commands[chip_of(electrode)].extend_from_slice(&write_current(
                chip_electrode_of(electrode),
                -phase2_current,
                false,
            ));
        }

        // Wait out the rest of phase 1.
        let phase1_duration_steps =
            4 * (pulse.phase1_duration * f64::from(self.max_freq)).round() as i64;
        let pad_phase1_steps =
            (phase1_duration_steps - num_phase1_setup_commands as i64 - 2).max(2);

        for _ in 0..pad_phase1_steps {
            for chip in 0..NUM_CHIPS {
                if chips_used[chip] {
                    commands[chip].extend_from_slice(&read_chip_id());
                }
            }
        }

        // At this point each chip is two commands short of a 4-word block;
        // the next trigger pair completes it.

        let interphase_duration_steps =
            4 * (pulse.interphase_duration * f64::from(self.max_freq)).round() as i64;

        if interphase_duration_steps > 0 {
            for chip in 0..NUM_CHIPS {
                if !chips_used[chip] {
                    continue;
                }

                commands[chip].extend_from_slice(&read_chip_id());
                commands[chip].extend_from_slice(&write_register(REG_STIM_ON, 0, true));

                for _ in 0..interphase_duration_steps {
                    commands[chip].extend_from_slice(&read_chip_id());
                }
            }
        }

        // Trigger phase 2.
        for chip in 0..NUM_CHIPS {
            if !chips_used[chip] {
                continue;
            }

            let positive_current_electrodes = if phase2_current > 0 {
                main_electrode_flags[chip]
            } else {
                inverse_electrode_flags[chip]
            };

            commands[chip].extend_from_slice(&write_register(
                REG_STIM_POLARITY,
                positive_current_electrodes,
                false,
            ));
            commands[chip].extend_from_slice(&write_register(
                REG_STIM_ON,
                all_electrode_flags[chip],
                true,
            ));
        }

        // Wait out phase 2, stop it, then run charge recovery.
        let phase2_duration_steps =
            (4 * (pulse.phase2_duration * f64::from(self.max_freq)).round() as i64).max(4);

        for chip in 0..NUM_CHIPS {
            if !chips_used[chip] {
                continue;
            }

            // One word short to account for the stop command.
            for _ in 0..phase2_duration_steps - 1 {
                commands[chip].extend_from_slice(&read_chip_id());
            }

            commands[chip].extend_from_slice(&write_register(REG_STIM_ON, 0, true));

            commands[chip].extend_from_slice(&write_register(
                REG_CHARGE_RECOV_SWITCH,
                all_electrode_flags[chip],
                true,
            ));

            for _ in 0..10 {
                commands[chip].extend_from_slice(&read_chip_id());
            }

            commands[chip].extend_from_slice(&write_register(REG_CHARGE_RECOV_SWITCH, 0, true));
        }

        Ok(commands
            .into_iter()
            .enumerate()
            .filter(|(_, stream)| !stream.is_empty())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stim::{words, PulseConfig};

    fn test_config() -> StimConfig {
        StimConfig {
            pulse_type: "biphasic".to_string(),
            max_frequency: 20_000,
            stim_step_size_index: 6, // 1 uA steps
            electrodes_by_pulse: vec![vec![0, 17]],
            inverse_electrodes: Vec::new(),
            loop_forever: false,
            pulse_config: PulseConfig {
                phase1_current: 1e-6,
                phase2_current: -1e-6,
                phase1_duration: 100e-6,
                phase2_duration: 100e-6,
                interphase_duration: 0.0,
                ..PulseConfig::default()
            },
        }
    }

    #[test]
    fn test_pulse_streams_are_4_word_aligned_and_equal_length() {
        let config = test_config();
        let mut stim = BiphasicStimulator::new(&config, 6, 20_000);
        let commands = stim.emit_next_commands().unwrap();

        assert_eq!(commands.len(), 2);
        let chip0 = words(&commands[&0]);
        let chip1 = words(&commands[&1]);

        assert_eq!(chip0.len(), chip1.len());
        assert_eq!(chip0.len() % 4, 0);
    }

    #[test]
    fn test_pulse_command_sequence() {
        let config = test_config();
        let mut stim = BiphasicStimulator::new(&config, 6, 20_000);
        let commands = stim.emit_next_commands().unwrap();
        let chip0 = words(&commands[&0]);
        let chip1 = words(&commands[&1]);

        // Phase-1 current write: 1 uA in 1 uA steps = magnitude 1 with the
        // default trim, positive bank register 96.
        assert_eq!(chip0[0], 0x8060_8001);

        // One pad word, then the polarity write and the STIM_ON trigger with
        // this chip's electrode bit.
        assert_eq!(chip0[1], 0xc0ff_0000);
        assert_eq!(chip0[2], 0x802c_0001); // reg 44, electrode 0 positive
        assert_eq!(chip0[3], 0xa02a_0001); // reg 42, triggered, bit 0

        // Chip 1 drives electrode 17 -> local channel 1.
        assert_eq!(chip1[2], 0x802c_0002);
        assert_eq!(chip1[3], 0xa02a_0002);

        // Phase 2 preload goes to the negative bank (reg 64 + electrode).
        assert_eq!(chip0[4], 0x8040_8001);

        // Phase 1 lasts 100 us at 20 kHz = 2 sample periods = 8 words; the
        // setup word and the two triggers already account for 3, so 5 pads
        // follow the preload before the phase-2 trigger pair.
        for i in 5..10 {
            assert_eq!(chip0[i], 0xc0ff_0000);
        }
        assert_eq!(chip0[10], 0x802c_0000); // phase 2 polarity: negative current
        assert_eq!(chip0[11], 0xa02a_0001); // phase 2 STIM_ON trigger

        // Tail: stop trigger, charge recovery on, 10 pads, recovery off.
        let n = chip0.len();
        assert_eq!(chip0[n - 13], 0xa02a_0000);
        assert_eq!(chip0[n - 12], 0xa02e_0001);
        assert_eq!(chip0[n - 1], 0xa02e_0000);
    }

    #[test]
    fn test_no_electrodes_emits_nothing() {
        let mut config = test_config();
        config.electrodes_by_pulse = vec![vec![]];
        let mut stim = BiphasicStimulator::new(&config, 6, 20_000);
        assert!(stim.emit_next_commands().unwrap().is_empty());
    }

    #[test]
    fn test_single_pulse_is_done_immediately() {
        let stim = BiphasicStimulator::new(&test_config(), 6, 20_000);
        assert!(stim.is_done());
    }
}
