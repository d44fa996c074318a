// Licensed under the Apache-2.0 license

//! EIO protocol emulation.
//!
//! An EIO block is a pool of programmable shifters and timers. This module
//! allocates them to protocol drivers ([`uart`], [`spi`], [`i2c`], [`i2s`]),
//! programs them to reproduce each protocol's bit timing, and runs transfers
//! in one of three modes ([`DriverType`]): interrupt driven, caller polled, or
//! DMA assisted.
//!
//! ```text
//! EioDevice (allocator, slot table, irq dispatch)
//!     ├── UartDriver   1 shifter + 1 timer
//!     ├── SpiDriver    2 shifters + 2 timers (SCK, SS)
//!     ├── I2cMaster    2 shifters + 2 timers (SCL, clock-stretch control)
//!     └── I2sDriver    2 shifters + 2 timers (SCK, WS)
//! ```

pub mod common;
pub mod device;
pub mod hw;
pub mod i2c;
pub mod i2s;
pub mod mmio;
#[cfg(test)]
pub(crate) mod sim;
pub mod spi;
pub(crate) mod transfer;
pub mod uart;

pub use common::{CommonDriverState, DriverEvent, DriverType, EioIsr, Error, MAX_RESOURCES};
pub use device::{DeviceRegistry, EioDevice, EioDeviceConfig};
pub use hw::EioHardware;
pub use i2c::{I2cConfig, I2cConfigBuilder, I2cMaster};
pub use i2s::{I2sConfig, I2sConfigBuilder, I2sDriver, I2sPins, I2sRole};
pub use mmio::EioRegisters;
pub use spi::{BitOrder, SpiConfig, SpiConfigBuilder, SpiDriver, SpiPins, SpiRole};
pub use uart::{UartConfig, UartConfigBuilder, UartDirection, UartDriver};
