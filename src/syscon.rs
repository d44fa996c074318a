// Licensed under the Apache-2.0 license

//! System control services used while bringing an EIO device up or down.
//!
//! Clock gating, soft reset and interrupt-line masking belong to the SoC, not
//! to the EIO block, so the device layer only talks to them through these
//! traits.

use fugit::HertzU32;

/// Clock gating, soft-reset and frequency queries for named clocks.
pub trait ClockControl {
    type ClockId: Copy;
    type Error: core::fmt::Debug;

    /// Ungate `clock`.
    ///
    /// # Errors
    ///
    /// Returns an implementation error when the clock cannot be enabled.
    fn enable(&mut self, clock: Self::ClockId) -> Result<(), Self::Error>;

    /// Gate `clock`.
    ///
    /// # Errors
    ///
    /// Returns an implementation error when the clock cannot be disabled.
    fn disable(&mut self, clock: Self::ClockId) -> Result<(), Self::Error>;

    /// Hold the peripheral behind `clock` in reset.
    ///
    /// # Errors
    ///
    /// Returns an implementation error when the reset line cannot be driven.
    fn reset_assert(&mut self, clock: Self::ClockId) -> Result<(), Self::Error>;

    /// Release the peripheral behind `clock` from reset.
    ///
    /// # Errors
    ///
    /// Returns an implementation error when the reset line cannot be driven.
    fn reset_deassert(&mut self, clock: Self::ClockId) -> Result<(), Self::Error>;

    /// Current frequency of `clock`.
    ///
    /// # Errors
    ///
    /// Returns an implementation error when the clock is unknown or gated.
    fn frequency(&self, clock: Self::ClockId) -> Result<HertzU32, Self::Error>;

    /// Assert then release the reset of `clock`.
    ///
    /// # Errors
    ///
    /// Propagates the first failing reset operation.
    fn reset_pulse(&mut self, clock: Self::ClockId) -> Result<(), Self::Error> {
        self.reset_assert(clock)?;
        self.reset_deassert(clock)
    }
}

/// Interrupt controller line masking.
pub trait InterruptControl {
    type Irq: Copy;

    fn enable_irq(&mut self, irq: Self::Irq);
    fn disable_irq(&mut self, irq: Self::Irq);
}

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub use nvic::{IrqLine, NvicControl};

#[cfg(all(target_arch = "arm", target_os = "none"))]
mod nvic {
    use super::InterruptControl;
    use cortex_m::interrupt::InterruptNumber;
    use cortex_m::peripheral::NVIC;

    /// Raw NVIC interrupt number.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct IrqLine(pub u16);

    // SAFETY: the wrapped value is the position of the line in the NVIC.
    unsafe impl InterruptNumber for IrqLine {
        fn number(self) -> u16 {
            self.0
        }
    }

    /// Interrupt control through the Cortex-M NVIC.
    #[derive(Debug, Default)]
    pub struct NvicControl;

    impl InterruptControl for NvicControl {
        type Irq = IrqLine;

        fn enable_irq(&mut self, irq: IrqLine) {
            // SAFETY: unmasking can break mask-based critical sections; the EIO
            // handler only takes closure-scoped critical sections.
            unsafe { NVIC::unmask(irq) };
        }

        fn disable_irq(&mut self, irq: IrqLine) {
            NVIC::mask(irq);
        }
    }
}
