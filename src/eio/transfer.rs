// Licensed under the Apache-2.0 license

//! Pieces of the transfer engine shared by every protocol driver.

use fugit::MillisDurationU32;

use super::common::{DriverType, Error, LeasedBuffer, RxCursor};
use crate::osif::Semaphore;

/// Busy gate and outcome of the transfer owned by one driver.
#[derive(Debug)]
pub(crate) struct TransferStatus {
    pub(crate) idle: bool,
    pub(crate) blocking: bool,
    /// First error recorded for the current or last transfer.
    pub(crate) error: Option<Error>,
}

impl TransferStatus {
    pub(crate) const fn new() -> Self {
        Self {
            idle: true,
            blocking: false,
            error: None,
        }
    }

    /// Claim the driver for a new transfer.
    pub(crate) fn begin(&mut self, blocking: bool) -> Result<(), Error> {
        if !self.idle {
            return Err(Error::Busy);
        }
        self.idle = false;
        self.blocking = blocking;
        self.error = None;
        Ok(())
    }

    /// Record a soft error; the transfer keeps running.
    pub(crate) fn record(&mut self, error: Error) {
        self.error = Some(error);
    }

    pub(crate) fn result(&self) -> nb::Result<(), Error> {
        if !self.idle {
            return Err(nb::Error::WouldBlock);
        }
        match self.error {
            None => Ok(()),
            Some(e) => Err(nb::Error::Other(e)),
        }
    }
}

/// Receive buffer in use by a transfer, with the lease to hand back when it
/// came from a non-blocking call.
#[derive(Debug)]
pub(crate) struct RxSlot {
    pub(crate) cursor: RxCursor,
    pub(crate) lease: Option<LeasedBuffer>,
}

impl RxSlot {
    pub(crate) fn borrowed(cursor: RxCursor) -> Self {
        Self {
            cursor,
            lease: None,
        }
    }

    pub(crate) fn leased(buffer: &'static mut [u8]) -> Self {
        let (lease, cursor) = LeasedBuffer::new(buffer);
        Self {
            cursor,
            lease: Some(lease),
        }
    }
}

/// Receive buffers the engine is done with, waiting for `take_rx_buffer`.
pub(crate) type FilledBuffers = heapless::Deque<LeasedBuffer, 2>;

pub(crate) fn retire(filled: &mut FilledBuffers, slot: Option<RxSlot>) {
    if let Some(lease) = slot.and_then(|slot| slot.lease) {
        if filled.is_full() {
            let _ = filled.pop_front();
        }
        let _ = filled.push_back(lease);
    }
}

/// Hooks a driver exposes so [`wait_blocking`] can drive it to completion.
pub(crate) trait BlockingTransfer {
    type Semaphore: Semaphore;

    fn driver_type(&self) -> DriverType;
    fn semaphore(&self) -> &Self::Semaphore;
    fn millis(&self) -> u32;

    /// One polling-mode step of the state machine.
    fn step(&self);

    fn is_busy(&self) -> bool;

    /// Force-stop an in-flight transfer with a timeout status.
    fn expire(&self);

    /// Clear the blocking flag and return the terminal status.
    fn finish(&self) -> Result<(), Error>;
}

/// Wait for a transfer started in blocking mode, semaphore based in interrupt
/// and DMA mode, spinning on `step` in polling mode. On return the transfer
/// is idle and its buffers are no longer referenced.
pub(crate) fn wait_blocking<T: BlockingTransfer>(
    transfer: &T,
    timeout: MillisDurationU32,
) -> Result<(), Error> {
    let completed = match transfer.driver_type() {
        DriverType::Polling => {
            let start = transfer.millis();
            loop {
                transfer.step();
                if !transfer.is_busy() {
                    break true;
                }
                if transfer.millis().wrapping_sub(start) >= timeout.ticks() {
                    break false;
                }
            }
        }
        DriverType::Interrupts | DriverType::Dma => transfer.semaphore().wait(timeout).is_ok(),
    };
    if !completed {
        transfer.expire();
    }
    transfer.finish()
}

/// Static DMA endpoints for transfers that have no caller buffer on one side.
pub(crate) mod fill {
    use core::sync::atomic::AtomicU32;

    static ONES: u32 = u32::MAX;
    static ZEROS: u32 = 0;
    static SINK: AtomicU32 = AtomicU32::new(0);

    pub(crate) fn ones() -> usize {
        core::ptr::addr_of!(ONES) as usize
    }

    pub(crate) fn zeros() -> usize {
        core::ptr::addr_of!(ZEROS) as usize
    }

    pub(crate) fn sink() -> usize {
        SINK.as_ptr() as usize
    }
}
