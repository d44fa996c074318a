// Licensed under the Apache-2.0 license

//! DMA collaborator interface.
//!
//! The EIO drivers never program a DMA controller directly. They describe a
//! one-shot transfer with [`DmaTransfer`], hand it to a [`DmaService`], and
//! expect the owner of the DMA interrupt to forward channel completion back to
//! them through the driver's `on_dma_event` method.

/// Direction of a DMA transfer relative to the EIO shifter buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DmaDirection {
    MemoryToPeripheral,
    PeripheralToMemory,
}

/// Element size moved per request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum DmaWidth {
    Byte = 1,
    HalfWord = 2,
    Word = 4,
}

impl DmaWidth {
    /// Width matching a 1, 2 or 4 byte element.
    #[must_use]
    pub fn from_bytes(bytes: u8) -> Option<Self> {
        match bytes {
            1 => Some(Self::Byte),
            2 => Some(Self::HalfWord),
            4 => Some(Self::Word),
            _ => None,
        }
    }

    #[must_use]
    pub fn bytes(self) -> u32 {
        self as u32
    }
}

/// One-shot transfer descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DmaTransfer {
    pub direction: DmaDirection,
    pub source: usize,
    pub destination: usize,
    pub width: DmaWidth,
    /// Number of elements of `width` to move.
    pub count: u32,
    pub source_increment: bool,
    pub destination_increment: bool,
    /// Peripheral request line that paces the transfer.
    pub request: u8,
}

/// Channel notification forwarded to the driver that owns the channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DmaEvent {
    Complete,
    Error,
}

/// Failure reported by a [`DmaService`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DmaError {
    InvalidChannel,
    InvalidTransfer,
}

/// DMA controller operations consumed by the EIO drivers.
///
/// All methods take `&self` because channels are shared between foreground
/// code and the interrupt handlers that finish transfers.
pub trait DmaService {
    /// Load a descriptor into `channel` without starting it.
    ///
    /// # Errors
    ///
    /// Returns [`DmaError`] when the channel or descriptor is rejected.
    fn configure(&self, channel: u8, transfer: &DmaTransfer) -> Result<(), DmaError>;

    fn start(&self, channel: u8);
    fn stop(&self, channel: u8);

    /// Elements the channel has not moved yet.
    fn remaining(&self, channel: u8) -> u32;

    fn set_source(&self, channel: u8, address: usize);
    fn set_destination(&self, channel: u8, address: usize);
    fn set_count(&self, channel: u8, count: u32);

    /// Whether `[address, address + len)` lies in memory the DMA engine can reach.
    fn is_dma_capable(&self, _address: usize, _len: usize) -> bool {
        true
    }
}

/// Placeholder service for drivers that never use DMA.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoDma;

impl DmaService for NoDma {
    fn configure(&self, _channel: u8, _transfer: &DmaTransfer) -> Result<(), DmaError> {
        Err(DmaError::InvalidChannel)
    }

    fn start(&self, _channel: u8) {}
    fn stop(&self, _channel: u8) {}

    fn remaining(&self, _channel: u8) -> u32 {
        0
    }

    fn set_source(&self, _channel: u8, _address: usize) {}
    fn set_destination(&self, _channel: u8, _address: usize) {}
    fn set_count(&self, _channel: u8, _count: u32) {}

    fn is_dma_capable(&self, _address: usize, _len: usize) -> bool {
        false
    }
}
