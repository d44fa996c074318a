// Licensed under the Apache-2.0 license

//! Common types shared by the EIO device layer and the protocol drivers.

use core::marker::PhantomData;

/// Upper bound on shifter/timer pairs tracked per device.
pub const MAX_RESOURCES: usize = 16;

/// Capacity of the per-driver event queue.
pub const EVENT_QUEUE_DEPTH: usize = 8;

/// Errors reported by the EIO device layer and protocol drivers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// Device used before `init`, or instance unknown to the registry.
    NotInitialized,
    /// Configuration rejected before any register was touched.
    InvalidConfig,
    /// No contiguous run of free shifter/timer slots.
    NotEnoughResources,
    /// A transfer is already in flight.
    Busy,
    /// Blocking call exceeded its deadline; the transfer was stopped.
    Timeout,
    /// I2C lines were not both idle-high before a start condition.
    BusBusy,
    /// I2C target did not acknowledge.
    Nack,
    /// Transmit buffer ran dry while the shifter needed data.
    TxUnderrun,
    /// Receive buffer overwritten before it was read.
    RxOverrun,
    /// Buffer outside DMA-capable memory, or operation not offered by this role.
    Unsupported,
    /// DMA channel reported an error.
    Dma,
    /// Clock or reset service failure.
    Hardware,
    /// Transfer cancelled with `abort`.
    Aborted,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let text = match self {
            Self::NotInitialized => "device not initialized",
            Self::InvalidConfig => "invalid configuration",
            Self::NotEnoughResources => "not enough shifter/timer resources",
            Self::Busy => "transfer in progress",
            Self::Timeout => "transfer timed out",
            Self::BusBusy => "bus busy",
            Self::Nack => "no acknowledge",
            Self::TxUnderrun => "transmit underrun",
            Self::RxOverrun => "receive overrun",
            Self::Unsupported => "unsupported",
            Self::Dma => "DMA error",
            Self::Hardware => "clock or reset failure",
            Self::Aborted => "transfer aborted",
        };
        f.write_str(text)
    }
}

impl embedded_hal::i2c::Error for Error {
    fn kind(&self) -> embedded_hal::i2c::ErrorKind {
        use embedded_hal::i2c::{ErrorKind, NoAcknowledgeSource};
        match self {
            Self::Nack => ErrorKind::NoAcknowledge(NoAcknowledgeSource::Unknown),
            Self::RxOverrun | Self::TxUnderrun => ErrorKind::Overrun,
            Self::BusBusy => ErrorKind::Bus,
            _ => ErrorKind::Other,
        }
    }
}

impl embedded_hal::spi::Error for Error {
    fn kind(&self) -> embedded_hal::spi::ErrorKind {
        use embedded_hal::spi::ErrorKind;
        match self {
            Self::RxOverrun | Self::TxUnderrun => ErrorKind::Overrun,
            Self::InvalidConfig => ErrorKind::FrameFormat,
            _ => ErrorKind::Other,
        }
    }
}

impl embedded_io::Error for Error {
    fn kind(&self) -> embedded_io::ErrorKind {
        use embedded_io::ErrorKind;
        match self {
            Self::Timeout => ErrorKind::TimedOut,
            Self::InvalidConfig => ErrorKind::InvalidInput,
            Self::Unsupported => ErrorKind::Unsupported,
            Self::Aborted => ErrorKind::Interrupted,
            Self::NotEnoughResources => ErrorKind::OutOfMemory,
            _ => ErrorKind::Other,
        }
    }
}

/// Execution strategy of a driver, fixed at init.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DriverType {
    /// The device interrupt runs the state machine.
    Interrupts,
    /// The caller runs the state machine through `poll`.
    Polling,
    /// DMA moves data; interrupts only handle protocol edges.
    Dma,
}

/// Notification queued by a transfer engine.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DriverEvent {
    /// Transmit buffer consumed. A staged buffer, if any, was swapped in.
    TxEmpty,
    /// Receive buffer filled. A staged buffer, if any, was swapped in.
    RxFull,
    /// Transfer finished; `status()` holds the outcome.
    EndTransfer,
}

pub(crate) type EventQueue = heapless::Deque<DriverEvent, EVENT_QUEUE_DEPTH>;

/// Queue `event`, dropping the oldest entry when full.
pub(crate) fn push_event(queue: &mut EventQueue, event: DriverEvent) {
    if queue.is_full() {
        let _ = queue.pop_front();
    }
    let _ = queue.push_back(event);
}

/// Resource binding every protocol driver carries.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CommonDriverState {
    /// Device instance the driver is bound to.
    pub instance: u8,
    /// Contiguous shifter/timer pairs needed by the protocol.
    pub resource_count: u8,
    /// First pair granted by the allocator.
    pub resource_index: u8,
    /// Whether the device interrupt should be routed to this driver.
    pub isr: bool,
}

impl CommonDriverState {
    /// Mask covering `[resource_index, resource_index + resource_count)`.
    #[must_use]
    pub fn resource_mask(&self) -> u32 {
        resource_mask(self.resource_index, self.resource_count)
    }
}

#[must_use]
pub(crate) fn resource_mask(index: u8, count: u8) -> u32 {
    let width = 1u32.checked_shl(u32::from(count)).map_or(u32::MAX, |v| v - 1);
    width.checked_shl(u32::from(index)).unwrap_or(0)
}

/// Interrupt service capability the device dispatcher calls into.
pub trait EioIsr {
    fn common(&self) -> CommonDriverState;

    /// Run one step of the transfer state machine from interrupt context.
    fn service(&self);
}

/// `round(input / (2 * baud))`, the raw half-period count before protocol bias.
fn half_period(input_clock: u32, baud: u32) -> i64 {
    let input = i64::from(input_clock);
    let baud = i64::from(baud.max(1));
    (input + baud) / (2 * baud)
}

/// Baud divider for a timer in 8-bit baud mode.
///
/// `bias` is subtracted from the rounded half period, the result is clamped
/// to `[min, 255]`.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn baud_divider(input_clock: u32, baud: u32, bias: u8, min: u8) -> u8 {
    let raw = half_period(input_clock, baud) - i64::from(bias);
    raw.clamp(i64::from(min), 255) as u8
}

/// Baud rate produced by `divider`, the inverse of [`baud_divider`].
#[must_use]
pub fn divider_baud(input_clock: u32, divider: u8, bias: u8) -> u32 {
    let period = 2 * (u32::from(divider) + u32::from(bias));
    input_clock / period.max(1)
}

/// Cursor over a caller buffer that the engine reads from.
///
/// The engine keeps cursors in interrupt-shared state, so they hold raw parts
/// instead of borrows. Whoever builds one guarantees the memory outlives every
/// access: `'static` buffers for non-blocking calls, or a blocking call that
/// tears the transfer down before it returns.
#[derive(Clone, Copy, Debug)]
pub(crate) struct TxCursor {
    ptr: *const u8,
    len: usize,
    pos: usize,
}

// SAFETY: the cursor is only dereferenced under the driver's critical section.
unsafe impl Send for TxCursor {}

impl TxCursor {
    pub(crate) fn new(data: &[u8]) -> Self {
        Self {
            ptr: data.as_ptr(),
            len: data.len(),
            pos: 0,
        }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.len - self.pos
    }

    pub(crate) fn address(&self) -> usize {
        self.ptr as usize + self.pos
    }

    pub(crate) fn advance(&mut self, bytes: usize) {
        self.pos = (self.pos + bytes).min(self.len);
    }

    /// Next little-endian unit of `width` bytes, short units zero-extended.
    pub(crate) fn next(&mut self, width: u8) -> Option<u32> {
        if self.pos >= self.len {
            return None;
        }
        let take = usize::from(width).min(self.remaining());
        let mut value = 0u32;
        for i in 0..take {
            // SAFETY: pos + i < len, inside the buffer the cursor was built from.
            let byte = unsafe { *self.ptr.add(self.pos + i) };
            value |= u32::from(byte) << (8 * i);
        }
        self.pos += take;
        Some(value)
    }
}

/// Cursor over a caller buffer that the engine writes into. Same ownership
/// rules as [`TxCursor`].
#[derive(Debug)]
pub(crate) struct RxCursor {
    ptr: *mut u8,
    len: usize,
    pos: usize,
}

// SAFETY: the cursor is only dereferenced under the driver's critical section.
unsafe impl Send for RxCursor {}

impl RxCursor {
    pub(crate) fn new(data: &mut [u8]) -> Self {
        Self {
            ptr: data.as_mut_ptr(),
            len: data.len(),
            pos: 0,
        }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.len - self.pos
    }

    pub(crate) fn address(&self) -> usize {
        self.ptr as usize + self.pos
    }

    pub(crate) fn advance(&mut self, bytes: usize) {
        self.pos = (self.pos + bytes).min(self.len);
    }

    /// Read cursor over the same memory, for transfers that send a buffer
    /// and receive into it in place. The writer must never overtake the reader.
    pub(crate) fn reader(&self) -> TxCursor {
        TxCursor {
            ptr: self.ptr.cast_const(),
            len: self.len,
            pos: self.pos,
        }
    }

    /// Store the low `width` bytes of `value` little-endian; returns whether
    /// anything was stored.
    pub(crate) fn push(&mut self, width: u8, value: u32) -> bool {
        if self.pos >= self.len {
            return false;
        }
        let take = usize::from(width).min(self.remaining());
        for i in 0..take {
            // SAFETY: pos + i < len, inside the buffer the cursor was built from.
            unsafe { *self.ptr.add(self.pos + i) = (value >> (8 * i)) as u8 };
        }
        self.pos += take;
        true
    }
}

/// A `'static` receive buffer handed to a non-blocking call, kept as raw
/// parts while the engine owns it.
#[derive(Debug)]
pub(crate) struct LeasedBuffer {
    ptr: *mut u8,
    len: usize,
    _lease: PhantomData<&'static mut [u8]>,
}

// SAFETY: the lease is the unique owner of the 'static buffer it came from.
unsafe impl Send for LeasedBuffer {}

impl LeasedBuffer {
    pub(crate) fn new(buffer: &'static mut [u8]) -> (Self, RxCursor) {
        let len = buffer.len();
        let ptr = buffer.as_mut_ptr();
        let cursor = RxCursor { ptr, len, pos: 0 };
        let lease = Self {
            ptr,
            len,
            _lease: PhantomData,
        };
        (lease, cursor)
    }

    pub(crate) fn release(self) -> &'static mut [u8] {
        // SAFETY: rebuilt from the unique 'static borrow consumed by `new`;
        // the engine stopped writing through its cursor before releasing.
        unsafe { core::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}
