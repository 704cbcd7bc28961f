//! Command word encoding for the RHS2116-class stimulator chips.
//!
//! Every command is one 32-bit little-endian word. The FIFO hardware
//! consumes commands in blocks of four, so emitters pad their streams with
//! the benign "read chip id" command to stay 4-word aligned.
//!
//! Word layout:
//! - write register: `0x8000_0000 | (reg << 16) | value`, plus
//!   `0x2000_0000` when the write should trigger the stimulation update.
//! - read register:  `0xC000_0000 | (reg << 16)`.

pub const REG_STIM_ENABLE_A: u32 = 32;
pub const REG_STIM_ENABLE_B: u32 = 33;
pub const REG_STIM_STEP_SIZE: u32 = 34;
pub const REG_STIM_BIAS_VOLTAGES: u32 = 35;
pub const REG_STIM_ON: u32 = 42;
pub const REG_STIM_POLARITY: u32 = 44;
pub const REG_CHARGE_RECOV_SWITCH: u32 = 46;

pub const REG_STIM_NEG_CURRENT_BASE: u32 = 64;
pub const REG_STIM_POS_CURRENT_BASE: u32 = 96;

pub const REG_CHIP_ID: u32 = 255;

pub const STIM_ENABLE_A_MAGIC_NUMBER: u32 = 0xaaaa;
pub const STIM_ENABLE_B_MAGIC_NUMBER: u32 = 0x00ff;

/// Per-index register codes for the stimulation current step size,
/// 10 nA through 10 uA.
pub const STIM_STEP_SIZE_CODES: [u32; 10] = [
    64 + (19 << 7) + (3 << 13),  // 10 nA
    40 + (40 << 7) + (1 << 13),  // 20 nA
    64 + (40 << 7),              // 50 nA
    30 + (20 << 7),              // 100 nA
    25 + (10 << 7),              // 200 nA
    101 + (3 << 7),              // 500 nA
    98 + (1 << 7),               // 1 uA
    94,                          // 2 uA
    38,                          // 5 uA
    15,                          // 10 uA
];

/// Bias voltage codes matched to each step size index.
pub const STIM_PBIAS_AND_NBIAS: [u32; 10] = [
    6 + (6 << 4),
    7 + (7 << 4),
    7 + (7 << 4),
    7 + (7 << 4),
    8 + (8 << 4),
    9 + (9 << 4),
    10 + (10 << 4),
    11 + (11 << 4),
    14 + (14 << 4),
    15 + (15 << 4),
];

/// Step size in amps per current-magnitude unit, by step size index.
pub const STIM_STEP_SIZES: [f64; 10] = [
    0.000_000_01,
    0.000_000_02,
    0.000_000_05,
    0.000_000_1,
    0.000_000_2,
    0.000_000_5,
    0.000_001,
    0.000_002,
    0.000_005,
    0.000_01,
];

pub const STIM_STEP_SIZE_1_UA: usize = 6;

const WRITE_FLAG: u32 = 0x8000_0000;
const READ_FLAG: u32 = 0xC000_0000;
const TRIGGER_FLAG: u32 = 0x2000_0000;

/// Default current trim, ORed into every current-magnitude write.
const CURRENT_TRIM: u32 = 0x80 << 8;

/// Encode a register write, optionally triggering the stimulation update.
pub fn write_register(register: u32, value: u32, trigger: bool) -> [u8; 4] {
    let mut command = WRITE_FLAG | (register << 16) | value;

    if trigger {
        command |= TRIGGER_FLAG;
    }

    command.to_le_bytes()
}

/// Encode a register read.
pub fn read_register(register: u32) -> [u8; 4] {
    (READ_FLAG | (register << 16)).to_le_bytes()
}

/// Benign command used for 4-word padding.
pub fn read_chip_id() -> [u8; 4] {
    read_register(REG_CHIP_ID)
}

/// Encode a current-magnitude write for one chip-local electrode. Negative
/// values address the negative-current register bank, non-negative values
/// the positive bank; the magnitude rides with the default trim.
pub fn write_current(chip_electrode: usize, value: i32, trigger: bool) -> [u8; 4] {
    let base = if value < 0 {
        REG_STIM_NEG_CURRENT_BASE
    } else {
        REG_STIM_POS_CURRENT_BASE
    };

    let write_value = CURRENT_TRIM | value.unsigned_abs();
    write_register(base + chip_electrode as u32, write_value, trigger)
}

/// Bit mask selecting one chip-local electrode.
pub fn electrode_bit(chip_electrode: usize) -> u32 {
    1 << chip_electrode
}

/// The 4-word block that stops stimulation and programs a new step size and
/// bias; sent to every chip before the first pulse and on step-size change.
pub fn set_stim_step_size(step_size_index: usize) -> Vec<u8> {
    let mut commands = Vec::with_capacity(16);
    commands.extend_from_slice(&write_register(REG_STIM_ON, 0, true));
    commands.extend_from_slice(&write_register(
        REG_STIM_STEP_SIZE,
        STIM_STEP_SIZE_CODES[step_size_index],
        false,
    ));
    commands.extend_from_slice(&write_register(
        REG_STIM_BIAS_VOLTAGES,
        STIM_PBIAS_AND_NBIAS[step_size_index],
        false,
    ));
    commands.extend_from_slice(&read_chip_id());
    commands
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(bytes: &[u8; 4]) -> u32 {
        u32::from_le_bytes(*bytes)
    }

    #[test]
    fn test_write_register_encoding() {
        assert_eq!(word(&write_register(42, 0x0003, false)), 0x802a_0003);
        assert_eq!(word(&write_register(42, 0x0003, true)), 0xa02a_0003);
    }

    #[test]
    fn test_read_register_encoding() {
        assert_eq!(word(&read_register(REG_CHIP_ID)), 0xc0ff_0000);
    }

    #[test]
    fn test_write_current_picks_register_bank() {
        // Positive current at electrode 0: positive bank, reg 96,
        // value = trim | magnitude.
        assert_eq!(word(&write_current(0, 1, false)), 0x8060_8001);
        // Negative current: negative bank, reg 64, same magnitude.
        assert_eq!(word(&write_current(0, -1, false)), 0x8040_8001);
        // Electrode offset lands in the register field.
        assert_eq!(word(&write_current(3, 5, false)), 0x8063_8005);
    }

    #[test]
    fn test_set_stim_step_size_is_one_block() {
        let commands = set_stim_step_size(STIM_STEP_SIZE_1_UA);
        assert_eq!(commands.len(), 16);

        // First word stops stimulation with a trigger.
        let first = u32::from_le_bytes([commands[0], commands[1], commands[2], commands[3]]);
        assert_eq!(first, 0xa02a_0000);
    }
}
