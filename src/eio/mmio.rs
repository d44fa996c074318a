// Licensed under the Apache-2.0 license

//! Memory-mapped EIO register block.

use super::hw::{
    BufferMode, EioHardware, PinConfig, PinPolarity, ShifterConfig, ShifterControl, ShifterMode,
    ShifterSource, ShifterStart, ShifterStop, TimerConfig, TimerControl, TimerDecrement,
    TimerDisable, TimerEnable, TimerMode, TimerOutput, TimerPolarity, TimerReset, TimerStart,
    TimerStop, TriggerPolarity, TriggerSource,
};

const PARAM: usize = 0x04;
const CTRL: usize = 0x08;
const PIN: usize = 0x0C;
const SHIFTSTAT: usize = 0x10;
const SHIFTERR: usize = 0x14;
const TIMSTAT: usize = 0x18;
const SHIFTSIEN: usize = 0x20;
const SHIFTEIEN: usize = 0x24;
const TIMIEN: usize = 0x28;
const SHIFTSDEN: usize = 0x30;
const SHIFTCTL: usize = 0x80;
const SHIFTCFG: usize = 0x100;
const SHIFTBUF: usize = 0x200;
const SHIFTBUFBIS: usize = 0x280;
const SHIFTBUFBYS: usize = 0x300;
const TIMCTL: usize = 0x400;
const TIMCFG: usize = 0x480;
const TIMCMP: usize = 0x500;

const CTRL_ENABLE: u32 = 1 << 0;
const CTRL_SWRST: u32 = 1 << 1;

/// Extract `width` bits at `shift`.
const fn field(value: u32, shift: u32, width: u32) -> u32 {
    (value >> shift) & ((1 << width) - 1)
}

pub(crate) fn encode_shifter_config(config: ShifterConfig) -> u32 {
    config.start.bits() | (config.stop.bits() << 4) | (config.source.bits() << 8)
}

pub(crate) fn decode_shifter_config(raw: u32) -> ShifterConfig {
    let default = ShifterConfig::default();
    ShifterConfig {
        start: ShifterStart::from_bits(field(raw, 0, 2)).unwrap_or(default.start),
        stop: ShifterStop::from_bits(field(raw, 4, 2)).unwrap_or(default.stop),
        source: ShifterSource::from_bits(field(raw, 8, 1)).unwrap_or(default.source),
    }
}

pub(crate) fn encode_shifter_control(control: ShifterControl) -> u32 {
    control.mode.bits()
        | (control.pin_polarity.bits() << 7)
        | ((u32::from(control.pin) & 0x1F) << 8)
        | (control.pin_config.bits() << 16)
        | (control.timer_polarity.bits() << 23)
        | ((u32::from(control.timer) & 0x7) << 24)
}

#[allow(clippy::cast_possible_truncation)]
pub(crate) fn decode_shifter_control(raw: u32) -> ShifterControl {
    let default = ShifterControl::default();
    ShifterControl {
        mode: ShifterMode::from_bits(field(raw, 0, 3)).unwrap_or(default.mode),
        pin_polarity: PinPolarity::from_bits(field(raw, 7, 1)).unwrap_or(default.pin_polarity),
        pin: field(raw, 8, 5) as u8,
        pin_config: PinConfig::from_bits(field(raw, 16, 2)).unwrap_or(default.pin_config),
        timer_polarity: TimerPolarity::from_bits(field(raw, 23, 1))
            .unwrap_or(default.timer_polarity),
        timer: field(raw, 24, 3) as u8,
    }
}

pub(crate) fn encode_timer_config(config: TimerConfig) -> u32 {
    (config.start.bits() << 1)
        | (config.stop.bits() << 4)
        | (config.enable.bits() << 8)
        | (config.disable.bits() << 12)
        | (config.reset.bits() << 16)
        | (config.decrement.bits() << 20)
        | (config.output.bits() << 24)
}

pub(crate) fn decode_timer_config(raw: u32) -> TimerConfig {
    let default = TimerConfig::default();
    TimerConfig {
        start: TimerStart::from_bits(field(raw, 1, 1)).unwrap_or(default.start),
        stop: TimerStop::from_bits(field(raw, 4, 2)).unwrap_or(default.stop),
        enable: TimerEnable::from_bits(field(raw, 8, 3)).unwrap_or(default.enable),
        disable: TimerDisable::from_bits(field(raw, 12, 3)).unwrap_or(default.disable),
        reset: TimerReset::from_bits(field(raw, 16, 3)).unwrap_or(default.reset),
        decrement: TimerDecrement::from_bits(field(raw, 20, 2)).unwrap_or(default.decrement),
        output: TimerOutput::from_bits(field(raw, 24, 2)).unwrap_or(default.output),
    }
}

pub(crate) fn encode_timer_control(control: TimerControl) -> u32 {
    control.mode.bits()
        | (control.pin_polarity.bits() << 7)
        | ((u32::from(control.pin) & 0x1F) << 8)
        | (control.pin_config.bits() << 16)
        | (control.trigger_source.bits() << 22)
        | (control.trigger_polarity.bits() << 23)
        | ((u32::from(control.trigger) & 0x3F) << 24)
}

#[allow(clippy::cast_possible_truncation)]
pub(crate) fn decode_timer_control(raw: u32) -> TimerControl {
    let default = TimerControl::default();
    TimerControl {
        mode: TimerMode::from_bits(field(raw, 0, 2)).unwrap_or(default.mode),
        pin_polarity: PinPolarity::from_bits(field(raw, 7, 1)).unwrap_or(default.pin_polarity),
        pin: field(raw, 8, 5) as u8,
        pin_config: PinConfig::from_bits(field(raw, 16, 2)).unwrap_or(default.pin_config),
        trigger_source: TriggerSource::from_bits(field(raw, 22, 1))
            .unwrap_or(default.trigger_source),
        trigger_polarity: TriggerPolarity::from_bits(field(raw, 23, 1))
            .unwrap_or(default.trigger_polarity),
        trigger: field(raw, 24, 6) as u8,
    }
}

/// EIO block at a fixed bus address.
#[derive(Debug)]
pub struct EioRegisters {
    base: usize,
}

impl EioRegisters {
    /// # Safety
    ///
    /// `base` must be the address of an EIO register block that stays mapped
    /// for the life of the value, and no other code may access it directly.
    #[must_use]
    pub const unsafe fn new(base: usize) -> Self {
        Self { base }
    }

    fn read(&self, offset: usize) -> u32 {
        // SAFETY: offset lies inside the block mapped at `base` (see `new`).
        unsafe { core::ptr::read_volatile((self.base + offset) as *const u32) }
    }

    fn write(&self, offset: usize, value: u32) {
        // SAFETY: offset lies inside the block mapped at `base` (see `new`).
        unsafe { core::ptr::write_volatile((self.base + offset) as *mut u32, value) }
    }

    fn modify(&self, offset: usize, mask: u32, set: bool) {
        let value = self.read(offset);
        self.write(offset, if set { value | mask } else { value & !mask });
    }

    fn buffer_offset(index: u8, mode: BufferMode) -> usize {
        let bank = match mode {
            BufferMode::Normal => SHIFTBUF,
            BufferMode::BitSwap => SHIFTBUFBIS,
            BufferMode::ByteSwap => SHIFTBUFBYS,
        };
        bank + 4 * usize::from(index)
    }
}

// Status registers are write-one-to-clear.
macro_rules! flag_register {
    ($name:ident, $offset:expr) => {
        paste::paste! {
            fn $name(&self) -> u32 {
                self.read($offset)
            }

            fn [<clear_ $name>](&self, mask: u32) {
                self.write($offset, mask);
            }
        }
    };
}

macro_rules! enable_register {
    ($name:ident, $offset:expr) => {
        paste::paste! {
            fn $name(&self) -> u32 {
                self.read($offset)
            }

            fn [<set_ $name>](&self, mask: u32, enable: bool) {
                self.modify($offset, mask, enable);
            }
        }
    };
}

#[allow(clippy::cast_possible_truncation)]
impl EioHardware for EioRegisters {
    fn shifter_count(&self) -> u8 {
        (self.read(PARAM) & 0xFF) as u8
    }

    fn timer_count(&self) -> u8 {
        ((self.read(PARAM) >> 8) & 0xFF) as u8
    }

    fn reset(&self) {
        self.write(CTRL, CTRL_SWRST);
        self.write(CTRL, 0);
    }

    fn set_enabled(&self, enabled: bool) {
        self.modify(CTRL, CTRL_ENABLE, enabled);
    }

    fn shifter_config(&self, index: u8) -> ShifterConfig {
        decode_shifter_config(self.read(SHIFTCFG + 4 * usize::from(index)))
    }

    fn set_shifter_config(&self, index: u8, config: ShifterConfig) {
        self.write(SHIFTCFG + 4 * usize::from(index), encode_shifter_config(config));
    }

    fn shifter_control(&self, index: u8) -> ShifterControl {
        decode_shifter_control(self.read(SHIFTCTL + 4 * usize::from(index)))
    }

    fn set_shifter_control(&self, index: u8, control: ShifterControl) {
        self.write(SHIFTCTL + 4 * usize::from(index), encode_shifter_control(control));
    }

    fn timer_config(&self, index: u8) -> TimerConfig {
        decode_timer_config(self.read(TIMCFG + 4 * usize::from(index)))
    }

    fn set_timer_config(&self, index: u8, config: TimerConfig) {
        self.write(TIMCFG + 4 * usize::from(index), encode_timer_config(config));
    }

    fn timer_control(&self, index: u8) -> TimerControl {
        decode_timer_control(self.read(TIMCTL + 4 * usize::from(index)))
    }

    fn set_timer_control(&self, index: u8, control: TimerControl) {
        self.write(TIMCTL + 4 * usize::from(index), encode_timer_control(control));
    }

    fn timer_compare(&self, index: u8) -> u16 {
        (self.read(TIMCMP + 4 * usize::from(index)) & 0xFFFF) as u16
    }

    fn set_timer_compare(&self, index: u8, value: u16) {
        self.write(TIMCMP + 4 * usize::from(index), u32::from(value));
    }

    flag_register!(shifter_status, SHIFTSTAT);
    flag_register!(shifter_error, SHIFTERR);
    flag_register!(timer_status, TIMSTAT);

    enable_register!(shifter_interrupts, SHIFTSIEN);
    enable_register!(shifter_error_interrupts, SHIFTEIEN);
    enable_register!(timer_interrupts, TIMIEN);
    enable_register!(shifter_dma_requests, SHIFTSDEN);

    fn read_buffer(&self, index: u8, mode: BufferMode) -> u32 {
        self.read(Self::buffer_offset(index, mode))
    }

    fn write_buffer(&self, index: u8, mode: BufferMode, value: u32) {
        self.write(Self::buffer_offset(index, mode), value);
    }

    fn buffer_address(&self, index: u8, mode: BufferMode) -> usize {
        self.base + Self::buffer_offset(index, mode)
    }

    fn pin_data(&self) -> u32 {
        self.read(PIN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uart_tx_timer_config_encoding() {
        let config = TimerConfig {
            start: TimerStart::Enabled,
            stop: TimerStop::OnDisable,
            enable: TimerEnable::TriggerHigh,
            disable: TimerDisable::OnCompare,
            reset: TimerReset::Never,
            decrement: TimerDecrement::ClockShiftTimer,
            output: TimerOutput::OneOnEnable,
        };
        assert_eq!(encode_timer_config(config), 0x0000_2222);
        assert_eq!(decode_timer_config(0x0000_2222), config);
    }

    #[test]
    fn shifter_control_fields_land_in_place() {
        let control = ShifterControl {
            mode: ShifterMode::Transmit,
            pin: 5,
            pin_polarity: PinPolarity::ActiveLow,
            pin_config: PinConfig::OpenDrain,
            timer: 1,
            timer_polarity: TimerPolarity::Negedge,
        };
        assert_eq!(encode_shifter_control(control), 0x0181_0582);
    }

    #[test]
    fn reserved_encodings_fall_back_to_defaults() {
        // SMOD = 3 and SSTOP = 1 are reserved
        assert_eq!(decode_shifter_control(0x3).mode, ShifterMode::Disabled);
        assert_eq!(decode_shifter_config(0x10).stop, ShifterStop::Disabled);
    }

    #[test]
    fn registers_are_accessed_at_block_offsets() {
        let mut block = [0u32; 0x600 / 4];
        block[PARAM / 4] = 0x0000_0404;
        // SAFETY: the array outlives the register view and is only accessed through it.
        let regs = unsafe { EioRegisters::new(block.as_mut_ptr() as usize) };
        assert_eq!(regs.shifter_count(), 4);
        assert_eq!(regs.timer_count(), 4);

        regs.set_timer_compare(2, 0x0F0C);
        regs.set_shifter_interrupts(0b0101, true);
        regs.set_shifter_interrupts(0b0001, false);
        regs.write_buffer(1, BufferMode::BitSwap, 0xAB00_0000);
        assert_eq!(regs.timer_compare(2), 0x0F0C);
        assert_eq!(regs.shifter_interrupts(), 0b0100);
        assert_eq!(
            regs.buffer_address(1, BufferMode::BitSwap),
            block.as_ptr() as usize + 0x284
        );
        assert_eq!(block[(TIMCMP + 8) / 4], 0x0F0C);
        assert_eq!(block[(SHIFTBUFBIS + 4) / 4], 0xAB00_0000);
    }
}
