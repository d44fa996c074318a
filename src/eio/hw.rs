// Licensed under the Apache-2.0 license

//! # EIO Hardware Interface
//!
//! The EIO block is a pool of generic *shifters* (serial/parallel registers)
//! and *timers* (bit-clock and framing counters). Protocol drivers never touch
//! registers directly; they describe what each shifter and timer should do with
//! the typed settings in this module and push them through [`EioHardware`].
//!
//! ## Register model
//!
//! ```text
//! per shifter n:  config (start/stop bit, input source)
//!                 control (mode, pin, pin polarity/config, timer, shift edge)
//!                 buffer  (normal / bit-swapped / byte-swapped aliases)
//! per timer n:    config (start/stop bit, enable/disable/reset/decrement, output)
//!                 control (mode, pin, trigger select/polarity/source)
//!                 compare (16 bit)
//! global:         shifter status, shifter error, timer status      (write 1 to clear)
//!                 shifter irq, shifter error irq, timer irq, dma    (enable masks)
//!                 pin input data
//! ```
//!
//! Bit `n` of every global mask refers to shifter `n` or timer `n`.

macro_rules! field_enum {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident = $value:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        #[repr(u8)]
        pub enum $name {
            $($(#[$vmeta])* $variant = $value),+
        }

        impl $name {
            /// Raw field encoding.
            #[must_use]
            pub const fn bits(self) -> u32 {
                self as u32
            }

            /// Decode a raw field, `None` for reserved encodings.
            #[must_use]
            pub const fn from_bits(bits: u32) -> Option<Self> {
                match bits {
                    $(x if x == $value => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

field_enum!(
    /// Shifter operating mode.
    ShifterMode {
        Disabled = 0,
        Receive = 1,
        Transmit = 2,
        MatchStore = 4,
        MatchContinuous = 5,
    }
);

field_enum!(
    /// Start bit inserted (transmit) or checked (receive) by a shifter.
    ShifterStart {
        /// No start bit, buffer loaded when the timer is enabled.
        Disabled = 0,
        /// No start bit, buffer loaded on the first shift.
        DisabledShift = 1,
        Zero = 2,
        One = 3,
    }
);

field_enum!(
    /// Stop bit appended (transmit) or checked (receive) by a shifter.
    ShifterStop {
        Disabled = 0,
        Zero = 2,
        One = 3,
    }
);

field_enum!(
    ShifterSource {
        Pin = 0,
        NextShifter = 1,
    }
);

field_enum!(
    PinConfig {
        Disabled = 0,
        OpenDrain = 1,
        Bidirectional = 2,
        Output = 3,
    }
);

field_enum!(
    PinPolarity {
        ActiveHigh = 0,
        ActiveLow = 1,
    }
);

field_enum!(
    /// Timer clock edge a shifter samples or drives on.
    TimerPolarity {
        Posedge = 0,
        Negedge = 1,
    }
);

field_enum!(
    TimerMode {
        Disabled = 0,
        /// Low byte divides the clock, high byte counts edges.
        Baud8Bit = 1,
        Pwm8Bit = 2,
        Counter16Bit = 3,
    }
);

field_enum!(
    TimerStart {
        Disabled = 0,
        Enabled = 1,
    }
);

field_enum!(
    TimerStop {
        Disabled = 0,
        OnCompare = 1,
        OnDisable = 2,
        OnCompareAndDisable = 3,
    }
);

field_enum!(
    TimerEnable {
        Always = 0,
        OnPreviousEnable = 1,
        TriggerHigh = 2,
        TriggerHighPinHigh = 3,
        PinRising = 4,
        PinRisingTriggerHigh = 5,
        TriggerRising = 6,
        TriggerBothEdges = 7,
    }
);

field_enum!(
    TimerDisable {
        Never = 0,
        OnPreviousDisable = 1,
        OnCompare = 2,
        OnCompareTriggerLow = 3,
        PinBothEdges = 4,
        PinBothEdgesTriggerHigh = 5,
        TriggerFalling = 6,
    }
);

field_enum!(
    TimerReset {
        Never = 0,
        /// Restart whenever the pin reads back the timer's own output.
        PinEqualsOutput = 2,
        TriggerEqualsOutput = 3,
        PinRising = 4,
        TriggerRising = 6,
        TriggerBothEdges = 7,
    }
);

field_enum!(
    TimerDecrement {
        /// Count the module clock, shift on the timer output.
        ClockShiftTimer = 0,
        TriggerShiftTimer = 1,
        /// Count pin edges, shift on the pin.
        PinShiftPin = 2,
        TriggerShiftTrigger = 3,
    }
);

field_enum!(
    TimerOutput {
        OneOnEnable = 0,
        ZeroOnEnable = 1,
        OneOnEnableAndReset = 2,
        ZeroOnEnableAndReset = 3,
    }
);

field_enum!(
    TriggerPolarity {
        ActiveHigh = 0,
        ActiveLow = 1,
    }
);

field_enum!(
    TriggerSource {
        External = 0,
        Internal = 1,
    }
);

/// Shifter buffer alias used for a read or a write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferMode {
    Normal,
    BitSwap,
    ByteSwap,
}

/// Internal trigger selecting the status flag of shifter `index`.
#[must_use]
pub const fn shifter_trigger(index: u8) -> u8 {
    (index << 2) + 1
}

/// Internal trigger selecting the input of pin `pin`.
#[must_use]
pub const fn pin_trigger(pin: u8) -> u8 {
    pin << 1
}

/// Internal trigger selecting the output of timer `index`.
#[must_use]
pub const fn timer_trigger(index: u8) -> u8 {
    (index << 2) + 3
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShifterConfig {
    pub start: ShifterStart,
    pub stop: ShifterStop,
    pub source: ShifterSource,
}

impl Default for ShifterConfig {
    fn default() -> Self {
        Self {
            start: ShifterStart::Disabled,
            stop: ShifterStop::Disabled,
            source: ShifterSource::Pin,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShifterControl {
    pub mode: ShifterMode,
    pub pin: u8,
    pub pin_polarity: PinPolarity,
    pub pin_config: PinConfig,
    pub timer: u8,
    pub timer_polarity: TimerPolarity,
}

impl Default for ShifterControl {
    fn default() -> Self {
        Self {
            mode: ShifterMode::Disabled,
            pin: 0,
            pin_polarity: PinPolarity::ActiveHigh,
            pin_config: PinConfig::Disabled,
            timer: 0,
            timer_polarity: TimerPolarity::Posedge,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerConfig {
    pub start: TimerStart,
    pub stop: TimerStop,
    pub enable: TimerEnable,
    pub disable: TimerDisable,
    pub reset: TimerReset,
    pub decrement: TimerDecrement,
    pub output: TimerOutput,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            start: TimerStart::Disabled,
            stop: TimerStop::Disabled,
            enable: TimerEnable::Always,
            disable: TimerDisable::Never,
            reset: TimerReset::Never,
            decrement: TimerDecrement::ClockShiftTimer,
            output: TimerOutput::OneOnEnable,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerControl {
    pub mode: TimerMode,
    pub pin: u8,
    pub pin_polarity: PinPolarity,
    pub pin_config: PinConfig,
    pub trigger: u8,
    pub trigger_polarity: TriggerPolarity,
    pub trigger_source: TriggerSource,
}

impl Default for TimerControl {
    fn default() -> Self {
        Self {
            mode: TimerMode::Disabled,
            pin: 0,
            pin_polarity: PinPolarity::ActiveHigh,
            pin_config: PinConfig::Disabled,
            trigger: 0,
            trigger_polarity: TriggerPolarity::ActiveHigh,
            trigger_source: TriggerSource::External,
        }
    }
}

/// Register access to one EIO block.
///
/// Every method takes `&self`: the block is shared by all drivers bound to it
/// and is touched from interrupt context. Implementations perform single
/// register accesses; read-modify-write sequences are composed by the default
/// helpers below and must be called with the owning driver's state locked.
pub trait EioHardware {
    /// Number of shifters implemented by the block.
    fn shifter_count(&self) -> u8;

    /// Number of timers implemented by the block.
    fn timer_count(&self) -> u8;

    /// Software reset of every register, back to power-on values.
    fn reset(&self);

    /// Gate the whole block.
    fn set_enabled(&self, enabled: bool);

    fn shifter_config(&self, index: u8) -> ShifterConfig;
    fn set_shifter_config(&self, index: u8, config: ShifterConfig);
    fn shifter_control(&self, index: u8) -> ShifterControl;
    fn set_shifter_control(&self, index: u8, control: ShifterControl);

    fn timer_config(&self, index: u8) -> TimerConfig;
    fn set_timer_config(&self, index: u8, config: TimerConfig);
    fn timer_control(&self, index: u8) -> TimerControl;
    fn set_timer_control(&self, index: u8, control: TimerControl);
    fn timer_compare(&self, index: u8) -> u16;
    fn set_timer_compare(&self, index: u8, value: u16);

    /// Shifter status flags: transmit buffer empty or receive buffer full.
    fn shifter_status(&self) -> u32;
    fn clear_shifter_status(&self, mask: u32);
    /// Shifter error flags: transmit underrun, receive overrun or
    /// start/stop bit mismatch.
    fn shifter_error(&self) -> u32;
    fn clear_shifter_error(&self, mask: u32);
    fn timer_status(&self) -> u32;
    fn clear_timer_status(&self, mask: u32);

    fn shifter_interrupts(&self) -> u32;
    fn set_shifter_interrupts(&self, mask: u32, enable: bool);
    fn shifter_error_interrupts(&self) -> u32;
    fn set_shifter_error_interrupts(&self, mask: u32, enable: bool);
    fn timer_interrupts(&self) -> u32;
    fn set_timer_interrupts(&self, mask: u32, enable: bool);
    fn shifter_dma_requests(&self) -> u32;
    fn set_shifter_dma_requests(&self, mask: u32, enable: bool);

    fn read_buffer(&self, index: u8, mode: BufferMode) -> u32;
    fn write_buffer(&self, index: u8, mode: BufferMode, value: u32);

    /// Bus address of a shifter buffer alias, for DMA descriptors.
    fn buffer_address(&self, index: u8, mode: BufferMode) -> usize;

    /// Input state of every pin, bit `n` for pin `n`.
    fn pin_data(&self) -> u32;

    fn shifter_flag(&self, index: u8) -> bool {
        self.shifter_status() & bit(index) != 0
    }

    fn shifter_error_flag(&self, index: u8) -> bool {
        self.shifter_error() & bit(index) != 0
    }

    fn timer_flag(&self, index: u8) -> bool {
        self.timer_status() & bit(index) != 0
    }

    fn set_shifter_mode(&self, index: u8, mode: ShifterMode) {
        let mut control = self.shifter_control(index);
        control.mode = mode;
        self.set_shifter_control(index, control);
    }

    fn set_shifter_pin_config(&self, index: u8, pin_config: PinConfig) {
        let mut control = self.shifter_control(index);
        control.pin_config = pin_config;
        self.set_shifter_control(index, control);
    }

    fn set_shifter_start(&self, index: u8, start: ShifterStart) {
        let mut config = self.shifter_config(index);
        config.start = start;
        self.set_shifter_config(index, config);
    }

    fn set_shifter_stop(&self, index: u8, stop: ShifterStop) {
        let mut config = self.shifter_config(index);
        config.stop = stop;
        self.set_shifter_config(index, config);
    }

    fn set_timer_mode(&self, index: u8, mode: TimerMode) {
        let mut control = self.timer_control(index);
        control.mode = mode;
        self.set_timer_control(index, control);
    }
}

/// Single-bit mask for resource `index`, zero when out of range.
#[must_use]
pub const fn bit(index: u8) -> u32 {
    match 1u32.checked_shl(index as u32) {
        Some(mask) => mask,
        None => 0,
    }
}
