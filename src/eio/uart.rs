// Licensed under the Apache-2.0 license

//! UART emulation on one shifter and one timer.
//!
//! A driver instance is unidirectional: a transmitter drives the data pin
//! from its shifter, a receiver samples it. Full duplex takes two instances.
//! The timer runs in 8-bit baud mode, its low byte dividing the module clock
//! and its high byte counting the `2 * bits` edges of one character. The
//! shifter adds the start and stop bits itself.

use core::cell::RefCell;

use fugit::{HertzU32, MillisDurationU32, RateExtU32};

use super::common::{
    baud_divider, divider_baud, push_event, CommonDriverState, DriverEvent, DriverType, EioIsr,
    Error, EventQueue, RxCursor, TxCursor,
};
use super::device::EioDevice;
use super::hw::{
    bit, shifter_trigger, BufferMode, EioHardware, PinConfig, PinPolarity, ShifterConfig,
    ShifterControl, ShifterMode, ShifterSource, ShifterStart, ShifterStop, TimerConfig,
    TimerControl, TimerDecrement, TimerDisable, TimerEnable, TimerMode, TimerOutput,
    TimerPolarity, TimerReset, TimerStart, TimerStop, TriggerPolarity, TriggerSource,
};
use super::transfer::{
    retire, wait_blocking, BlockingTransfer, FilledBuffers, RxSlot, TransferStatus,
};
use crate::common::{Logger, NoOpLogger};
use crate::dma::{DmaDirection, DmaEvent, DmaService, DmaTransfer, DmaWidth, NoDma};
use crate::osif::{Osif, Semaphore};

const DIVIDER_BIAS: u8 = 1;
const DIVIDER_MIN: u8 = 0;
const MAX_BITS: u8 = 16;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UartDirection {
    Tx,
    Rx,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UartConfig {
    pub baud_rate: HertzU32,
    /// Data bits per character, 1..=16. DMA mode accepts 8 or 16 only.
    pub bits: u8,
    pub direction: UartDirection,
    pub data_pin: u8,
    pub driver_type: DriverType,
    pub dma_channel: u8,
    /// Deadline used by the `embedded-io` implementations.
    pub timeout: MillisDurationU32,
}

pub struct UartConfigBuilder {
    baud_rate: HertzU32,
    bits: u8,
    direction: UartDirection,
    data_pin: u8,
    driver_type: DriverType,
    dma_channel: u8,
    timeout: MillisDurationU32,
}

impl Default for UartConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl UartConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            baud_rate: 115_200.Hz(),
            bits: 8,
            direction: UartDirection::Tx,
            data_pin: 0,
            driver_type: DriverType::Interrupts,
            dma_channel: 0,
            timeout: MillisDurationU32::millis(100),
        }
    }
    #[must_use]
    pub fn baud_rate(mut self, baud_rate: HertzU32) -> Self {
        self.baud_rate = baud_rate;
        self
    }
    #[must_use]
    pub fn bits(mut self, bits: u8) -> Self {
        self.bits = bits;
        self
    }
    #[must_use]
    pub fn direction(mut self, direction: UartDirection) -> Self {
        self.direction = direction;
        self
    }
    #[must_use]
    pub fn data_pin(mut self, pin: u8) -> Self {
        self.data_pin = pin;
        self
    }
    #[must_use]
    pub fn driver_type(mut self, driver_type: DriverType) -> Self {
        self.driver_type = driver_type;
        self
    }
    #[must_use]
    pub fn dma_channel(mut self, channel: u8) -> Self {
        self.dma_channel = channel;
        self
    }
    #[must_use]
    pub fn timeout(mut self, timeout: MillisDurationU32) -> Self {
        self.timeout = timeout;
        self
    }
    #[must_use]
    pub fn build(self) -> UartConfig {
        UartConfig {
            baud_rate: self.baud_rate,
            bits: self.bits,
            direction: self.direction,
            data_pin: self.data_pin,
            driver_type: self.driver_type,
            dma_channel: self.dma_channel,
            timeout: self.timeout,
        }
    }
}

/// Bytes per character in the caller's buffer.
fn unit_bytes(bits: u8) -> u8 {
    if bits <= 8 {
        1
    } else {
        2
    }
}

fn check_bits(bits: u8, driver_type: DriverType) -> Result<(), Error> {
    if bits == 0 || bits > MAX_BITS {
        return Err(Error::InvalidConfig);
    }
    if driver_type == DriverType::Dma && bits != 8 && bits != 16 {
        return Err(Error::InvalidConfig);
    }
    Ok(())
}

/// Baud-mode compare value: edge count in the high byte, divider in the low.
fn timer_compare(bits: u8, divider: u8) -> u16 {
    ((u16::from(bits) * 2 - 1) << 8) + u16::from(divider)
}

#[derive(Debug)]
struct UartState {
    status: TransferStatus,
    bits: u8,
    divider: u8,
    tx: Option<TxCursor>,
    rx: Option<RxSlot>,
    staged_tx: Option<TxCursor>,
    staged_rx: Option<RxSlot>,
    /// Bytes of the current buffer not yet moved by software.
    remaining: usize,
    /// Timer events still expected after the last character was queued.
    tx_flush: u8,
    dma_active: bool,
    events: EventQueue,
    filled: FilledBuffers,
}

/// One direction of a UART.
pub struct UartDriver<'d, H, O, L = NoOpLogger, D = NoDma>
where
    H: EioHardware,
    O: Osif,
    L: Logger,
    D: DmaService,
{
    device: &'d EioDevice<H, O, L>,
    dma: Option<&'d D>,
    common: CommonDriverState,
    config: UartConfig,
    semaphore: O::Semaphore,
    state: critical_section::Mutex<RefCell<UartState>>,
}

impl<'d, H, O, L> UartDriver<'d, H, O, L, NoDma>
where
    H: EioHardware,
    O: Osif,
    L: Logger,
{
    /// Bind a UART without DMA.
    ///
    /// # Errors
    ///
    /// See [`UartDriver::with_dma`].
    pub fn new(device: &'d EioDevice<H, O, L>, config: UartConfig) -> Result<Self, Error> {
        Self::init(device, config, None)
    }
}

impl<'d, H, O, L, D> UartDriver<'d, H, O, L, D>
where
    H: EioHardware,
    O: Osif,
    L: Logger,
    D: DmaService,
{
    /// Bind a UART whose DMA-mode transfers run on `dma`.
    ///
    /// # Errors
    ///
    /// * `Error::InvalidConfig` - bit count out of range, or DMA mode without
    ///   8 or 16 bits or without a DMA service
    /// * `Error::NotInitialized` / `Error::NotEnoughResources` - from allocation
    pub fn with_dma(
        device: &'d EioDevice<H, O, L>,
        config: UartConfig,
        dma: &'d D,
    ) -> Result<Self, Error> {
        Self::init(device, config, Some(dma))
    }

    fn init(
        device: &'d EioDevice<H, O, L>,
        config: UartConfig,
        dma: Option<&'d D>,
    ) -> Result<Self, Error> {
        check_bits(config.bits, config.driver_type)?;
        if config.driver_type == DriverType::Dma && dma.is_none() {
            return Err(Error::InvalidConfig);
        }

        let mut common = device.init_driver(1)?;
        if config.driver_type != DriverType::Polling {
            device.set_isr(&mut common, true);
        }
        let divider = baud_divider(
            device.input_clock().raw(),
            config.baud_rate.raw(),
            DIVIDER_BIAS,
            DIVIDER_MIN,
        );
        let driver = Self {
            device,
            dma,
            common,
            config,
            semaphore: device.osif().semaphore_create(0),
            state: critical_section::Mutex::new(RefCell::new(UartState {
                status: TransferStatus::new(),
                bits: config.bits,
                divider,
                tx: None,
                rx: None,
                staged_tx: None,
                staged_rx: None,
                remaining: 0,
                tx_flush: 0,
                dma_active: false,
                events: EventQueue::new(),
                filled: FilledBuffers::new(),
            })),
        };
        driver.configure(config.bits, divider);
        device.logger().debug_fmt(format_args!(
            "uart{}: {:?} at {} baud, divider {}",
            common.resource_index,
            config.direction,
            config.baud_rate.raw(),
            divider
        ));
        Ok(driver)
    }

    /// Release the shifter and timer. Refused while a transfer is in flight.
    ///
    /// # Errors
    ///
    /// Hands the driver back when it is busy.
    pub fn deinit(self) -> Result<(), Self> {
        if self.is_busy() {
            return Err(self);
        }
        let hw = self.device.hw();
        let index = self.common.resource_index;
        hw.set_shifter_mode(index, ShifterMode::Disabled);
        hw.set_timer_mode(index, TimerMode::Disabled);
        self.device.deinit_driver(&self.common);
        Ok(())
    }

    fn configure(&self, bits: u8, divider: u8) {
        let hw = self.device.hw();
        let index = self.common.resource_index;
        hw.set_timer_compare(index, timer_compare(bits, divider));
        match self.config.direction {
            UartDirection::Tx => {
                hw.set_shifter_config(
                    index,
                    ShifterConfig {
                        start: ShifterStart::Zero,
                        stop: ShifterStop::One,
                        source: ShifterSource::Pin,
                    },
                );
                hw.set_shifter_control(
                    index,
                    ShifterControl {
                        mode: ShifterMode::Disabled,
                        pin: self.config.data_pin,
                        pin_polarity: PinPolarity::ActiveHigh,
                        pin_config: PinConfig::Output,
                        timer: index,
                        timer_polarity: TimerPolarity::Posedge,
                    },
                );
                hw.set_timer_config(
                    index,
                    TimerConfig {
                        start: TimerStart::Enabled,
                        stop: TimerStop::OnDisable,
                        enable: TimerEnable::TriggerHigh,
                        disable: TimerDisable::OnCompare,
                        reset: TimerReset::Never,
                        decrement: TimerDecrement::ClockShiftTimer,
                        output: TimerOutput::OneOnEnable,
                    },
                );
                hw.set_timer_control(
                    index,
                    TimerControl {
                        mode: TimerMode::Disabled,
                        pin: 0,
                        pin_polarity: PinPolarity::ActiveHigh,
                        pin_config: PinConfig::Disabled,
                        trigger: shifter_trigger(index),
                        trigger_polarity: TriggerPolarity::ActiveLow,
                        trigger_source: TriggerSource::Internal,
                    },
                );
            }
            UartDirection::Rx => {
                hw.set_shifter_config(
                    index,
                    ShifterConfig {
                        start: ShifterStart::Zero,
                        stop: ShifterStop::One,
                        source: ShifterSource::Pin,
                    },
                );
                hw.set_shifter_control(
                    index,
                    ShifterControl {
                        mode: ShifterMode::Disabled,
                        pin: self.config.data_pin,
                        pin_polarity: PinPolarity::ActiveHigh,
                        pin_config: PinConfig::Disabled,
                        timer: index,
                        timer_polarity: TimerPolarity::Negedge,
                    },
                );
                // the start bit's falling edge arms the timer, so it resyncs on
                // every character
                hw.set_timer_config(
                    index,
                    TimerConfig {
                        start: TimerStart::Enabled,
                        stop: TimerStop::OnDisable,
                        enable: TimerEnable::PinRising,
                        disable: TimerDisable::OnCompare,
                        reset: TimerReset::PinRising,
                        decrement: TimerDecrement::ClockShiftTimer,
                        output: TimerOutput::OneOnEnableAndReset,
                    },
                );
                hw.set_timer_control(
                    index,
                    TimerControl {
                        mode: TimerMode::Disabled,
                        pin: self.config.data_pin,
                        pin_polarity: PinPolarity::ActiveLow,
                        pin_config: PinConfig::Disabled,
                        trigger: 0,
                        trigger_polarity: TriggerPolarity::ActiveHigh,
                        trigger_source: TriggerSource::External,
                    },
                );
            }
        }
    }

    pub fn common(&self) -> CommonDriverState {
        self.common
    }

    pub fn config(&self) -> &UartConfig {
        &self.config
    }

    /// Change baud rate and character size between transfers.
    ///
    /// # Errors
    ///
    /// * `Error::Busy` - a transfer is in flight
    /// * `Error::InvalidConfig` - bit count not accepted in this driver mode
    pub fn set_config(&self, baud_rate: HertzU32, bits: u8) -> Result<(), Error> {
        check_bits(bits, self.config.driver_type)?;
        let divider = baud_divider(
            self.device.input_clock().raw(),
            baud_rate.raw(),
            DIVIDER_BIAS,
            DIVIDER_MIN,
        );
        critical_section::with(|cs| {
            let mut st = self.state.borrow_ref_mut(cs);
            if !st.status.idle {
                return Err(Error::Busy);
            }
            st.bits = bits;
            st.divider = divider;
            self.device
                .hw()
                .set_timer_compare(self.common.resource_index, timer_compare(bits, divider));
            Ok(())
        })
    }

    /// Baud rate the current divider actually produces.
    pub fn baud_rate(&self) -> HertzU32 {
        let divider = critical_section::with(|cs| self.state.borrow_ref(cs).divider);
        HertzU32::from_raw(divider_baud(
            self.device.input_clock().raw(),
            divider,
            DIVIDER_BIAS,
        ))
    }

    /// Start sending `data` and return immediately.
    ///
    /// # Errors
    ///
    /// * `Error::Busy` - a transfer is already in flight
    /// * `Error::Unsupported` - receiver instance, or buffer outside DMA memory
    /// * `Error::InvalidConfig` - empty buffer or not a whole number of characters
    pub fn send(&self, data: &'static [u8]) -> Result<(), Error> {
        self.start_tx(TxCursor::new(data), false)
    }

    /// Send `data` and wait until the last stop bit is on the wire.
    ///
    /// # Errors
    ///
    /// As [`UartDriver::send`], plus `Error::Timeout` when `timeout` passes
    /// first; the transfer is stopped in that case.
    pub fn send_blocking(&self, data: &[u8], timeout: MillisDurationU32) -> Result<(), Error> {
        self.semaphore.drain();
        self.start_tx(TxCursor::new(data), true)?;
        wait_blocking(self, timeout)
    }

    /// Start filling `buffer` and return immediately. Get the buffer back with
    /// [`UartDriver::take_rx_buffer`].
    ///
    /// # Errors
    ///
    /// As [`UartDriver::send`], with `Error::Unsupported` for a transmitter.
    pub fn receive(&self, buffer: &'static mut [u8]) -> Result<(), Error> {
        self.start_rx(RxSlot::leased(buffer), false)
    }

    /// Fill `buffer`, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// As [`UartDriver::receive`], plus `Error::Timeout`.
    pub fn receive_blocking(
        &self,
        buffer: &mut [u8],
        timeout: MillisDurationU32,
    ) -> Result<(), Error> {
        self.semaphore.drain();
        self.start_rx(RxSlot::borrowed(RxCursor::new(buffer)), true)?;
        wait_blocking(self, timeout)
    }

    fn check_buffer(&self, bits: u8, address: usize, len: usize) -> Result<(), Error> {
        if len == 0 || len % usize::from(unit_bytes(bits)) != 0 {
            return Err(Error::InvalidConfig);
        }
        if self.config.driver_type == DriverType::Dma
            && !self.dma.is_some_and(|dma| dma.is_dma_capable(address, len))
        {
            return Err(Error::Unsupported);
        }
        Ok(())
    }

    fn dma_transfer(
        &self,
        bits: u8,
        direction: DmaDirection,
        memory: usize,
        len: usize,
    ) -> Result<DmaTransfer, Error> {
        let hw = self.device.hw();
        let index = self.common.resource_index;
        let unit = unit_bytes(bits);
        let width = DmaWidth::from_bytes(unit).ok_or(Error::InvalidConfig)?;
        let count = u32::try_from(len / usize::from(unit)).map_err(|_| Error::InvalidConfig)?;
        let buffer = hw.buffer_address(index, BufferMode::Normal);
        let (source, destination) = match direction {
            DmaDirection::MemoryToPeripheral => (memory, buffer),
            // received characters sit in the top bits of the buffer register
            DmaDirection::PeripheralToMemory => (buffer + usize::from(4 - unit), memory),
        };
        Ok(DmaTransfer {
            direction,
            source,
            destination,
            width,
            count,
            source_increment: direction == DmaDirection::MemoryToPeripheral,
            destination_increment: direction == DmaDirection::PeripheralToMemory,
            request: self.device.dma_request(index),
        })
    }

    fn start_dma(&self, transfer: &DmaTransfer) -> Result<(), Error> {
        let dma = self.dma.ok_or(Error::InvalidConfig)?;
        dma.configure(self.config.dma_channel, transfer).map_err(|e| {
            self.device.logger().error_fmt(format_args!(
                "uart{}: dma setup failed: {e:?}",
                self.common.resource_index
            ));
            Error::Dma
        })?;
        dma.start(self.config.dma_channel);
        Ok(())
    }

    fn start_tx(&self, cursor: TxCursor, blocking: bool) -> Result<(), Error> {
        if self.config.direction != UartDirection::Tx {
            return Err(Error::Unsupported);
        }
        let hw = self.device.hw();
        let index = self.common.resource_index;
        critical_section::with(|cs| {
            let mut st = self.state.borrow_ref_mut(cs);
            if !st.status.idle {
                return Err(Error::Busy);
            }
            let len = cursor.remaining();
            self.check_buffer(st.bits, cursor.address(), len)?;
            let unit = usize::from(unit_bytes(st.bits));
            if self.config.driver_type == DriverType::Dma {
                let transfer = self.dma_transfer(
                    st.bits,
                    DmaDirection::MemoryToPeripheral,
                    cursor.address(),
                    len,
                )?;
                self.start_dma(&transfer)?;
                st.dma_active = true;
            }
            st.status.begin(blocking)?;
            st.tx = Some(cursor);
            st.remaining = len;
            st.tx_flush = if len > unit { 2 } else { 1 };

            hw.set_timer_mode(index, TimerMode::Baud8Bit);
            hw.set_shifter_mode(index, ShifterMode::Transmit);
            match self.config.driver_type {
                DriverType::Interrupts => hw.set_shifter_interrupts(bit(index), true),
                DriverType::Dma => hw.set_shifter_dma_requests(bit(index), true),
                DriverType::Polling => {}
            }
            self.device.logger().debug_fmt(format_args!(
                "uart{index}: send {len} bytes{}",
                if blocking { " (blocking)" } else { "" }
            ));
            Ok(())
        })
    }

    fn start_rx(&self, slot: RxSlot, blocking: bool) -> Result<(), Error> {
        if self.config.direction != UartDirection::Rx {
            return Err(Error::Unsupported);
        }
        let hw = self.device.hw();
        let index = self.common.resource_index;
        critical_section::with(|cs| {
            let mut st = self.state.borrow_ref_mut(cs);
            if !st.status.idle {
                return Err(Error::Busy);
            }
            let len = slot.cursor.remaining();
            self.check_buffer(st.bits, slot.cursor.address(), len)?;
            if self.config.driver_type == DriverType::Dma {
                let transfer = self.dma_transfer(
                    st.bits,
                    DmaDirection::PeripheralToMemory,
                    slot.cursor.address(),
                    len,
                )?;
                self.start_dma(&transfer)?;
                st.dma_active = true;
            }
            st.status.begin(blocking)?;
            st.rx = Some(slot);
            st.remaining = len;

            hw.set_timer_mode(index, TimerMode::Baud8Bit);
            hw.set_shifter_mode(index, ShifterMode::Receive);
            match self.config.driver_type {
                DriverType::Interrupts => {
                    hw.set_shifter_interrupts(bit(index), true);
                    hw.set_shifter_error_interrupts(bit(index), true);
                }
                DriverType::Dma => {
                    hw.set_shifter_error_interrupts(bit(index), true);
                    hw.set_shifter_dma_requests(bit(index), true);
                }
                DriverType::Polling => {}
            }
            self.device.logger().debug_fmt(format_args!(
                "uart{index}: receive {len} bytes{}",
                if blocking { " (blocking)" } else { "" }
            ));
            Ok(())
        })
    }

    /// Queue the buffer to send once the current one is exhausted, for
    /// gap-free streaming. Call while a send is in flight, typically after a
    /// [`DriverEvent::TxEmpty`].
    ///
    /// # Errors
    ///
    /// * `Error::Unsupported` - receiver instance
    /// * `Error::InvalidConfig` - no send in flight, or bad buffer length
    /// * `Error::Busy` - a buffer is already staged
    pub fn set_tx_buffer(&self, data: &'static [u8]) -> Result<(), Error> {
        if self.config.direction != UartDirection::Tx {
            return Err(Error::Unsupported);
        }
        critical_section::with(|cs| {
            let mut st = self.state.borrow_ref_mut(cs);
            if st.status.idle {
                return Err(Error::InvalidConfig);
            }
            if st.staged_tx.is_some() {
                return Err(Error::Busy);
            }
            self.check_buffer(st.bits, data.as_ptr() as usize, data.len())?;
            st.staged_tx = Some(TxCursor::new(data));
            Ok(())
        })
    }

    /// Queue the buffer to fill once the current one is full.
    ///
    /// # Errors
    ///
    /// As [`UartDriver::set_tx_buffer`], with `Error::Unsupported` for a
    /// transmitter.
    pub fn set_rx_buffer(&self, buffer: &'static mut [u8]) -> Result<(), Error> {
        if self.config.direction != UartDirection::Rx {
            return Err(Error::Unsupported);
        }
        critical_section::with(|cs| {
            let mut st = self.state.borrow_ref_mut(cs);
            if st.status.idle {
                return Err(Error::InvalidConfig);
            }
            if st.staged_rx.is_some() {
                return Err(Error::Busy);
            }
            self.check_buffer(st.bits, buffer.as_ptr() as usize, buffer.len())?;
            st.staged_rx = Some(RxSlot::leased(buffer));
            Ok(())
        })
    }

    /// Advance a polling-mode transfer by one step and report its status.
    /// In the other modes this only reports.
    pub fn poll(&self) -> nb::Result<(), Error> {
        if self.config.driver_type == DriverType::Polling {
            self.step();
        }
        self.status()
    }

    /// `WouldBlock` while busy, then the outcome of the last transfer.
    pub fn status(&self) -> nb::Result<(), Error> {
        critical_section::with(|cs| self.state.borrow_ref(cs).status.result())
    }

    /// Bytes of the current buffer not transferred yet. After a transfer it
    /// tells how far a failed one got.
    pub fn remaining(&self) -> usize {
        critical_section::with(|cs| {
            let st = self.state.borrow_ref(cs);
            match self.dma.filter(|_| st.dma_active) {
                Some(dma) => {
                    let units = dma.remaining(self.config.dma_channel) as usize;
                    units * usize::from(unit_bytes(st.bits))
                }
                None => st.remaining,
            }
        })
    }

    pub fn is_busy(&self) -> bool {
        critical_section::with(|cs| !self.state.borrow_ref(cs).status.idle)
    }

    /// Stop the transfer in flight with `Error::Aborted`. No-op when idle.
    ///
    /// # Errors
    ///
    /// Never fails; the `Result` mirrors the other transfer calls.
    pub fn abort(&self) -> Result<(), Error> {
        critical_section::with(|cs| {
            let mut st = self.state.borrow_ref_mut(cs);
            if !st.status.idle {
                st.status.record(Error::Aborted);
                self.stop(&mut st);
            }
        });
        Ok(())
    }

    pub fn next_event(&self) -> Option<DriverEvent> {
        critical_section::with(|cs| self.state.borrow_ref_mut(cs).events.pop_front())
    }

    /// Oldest receive buffer handed back by the engine.
    pub fn take_rx_buffer(&self) -> Option<&'static mut [u8]> {
        critical_section::with(|cs| self.state.borrow_ref_mut(cs).filled.pop_front())
            .map(|lease| lease.release())
    }

    /// Forward a completion or error notification of the driver's DMA channel.
    pub fn on_dma_event(&self, channel: u8, event: DmaEvent) {
        if channel != self.config.dma_channel {
            return;
        }
        critical_section::with(|cs| {
            let mut st = self.state.borrow_ref_mut(cs);
            if st.status.idle || !st.dma_active {
                return;
            }
            match event {
                DmaEvent::Error => {
                    self.device.logger().error_fmt(format_args!(
                        "uart{}: dma channel {channel} error",
                        self.common.resource_index
                    ));
                    st.status.record(Error::Dma);
                    self.stop(&mut st);
                }
                DmaEvent::Complete => match self.config.direction {
                    UartDirection::Tx => self.tx_dma_complete(&mut st),
                    UartDirection::Rx => self.rx_dma_complete(&mut st),
                },
            }
        });
    }

    fn tx_dma_complete(&self, st: &mut UartState) {
        let hw = self.device.hw();
        let index = self.common.resource_index;
        push_event(&mut st.events, DriverEvent::TxEmpty);
        if let (Some(next), Some(dma)) = (st.staged_tx.take(), self.dma) {
            let units = next.remaining() / usize::from(unit_bytes(st.bits));
            dma.set_source(self.config.dma_channel, next.address());
            dma.set_count(self.config.dma_channel, u32::try_from(units).unwrap_or(u32::MAX));
            dma.start(self.config.dma_channel);
            st.remaining = next.remaining();
            st.tx = Some(next);
            st.tx_flush = 2;
            return;
        }
        // data is all in the shifter; the timer tells when it has left
        st.dma_active = false;
        st.remaining = 0;
        hw.set_shifter_dma_requests(bit(index), false);
        hw.clear_timer_status(bit(index));
        hw.set_timer_interrupts(bit(index), true);
    }

    fn rx_dma_complete(&self, st: &mut UartState) {
        push_event(&mut st.events, DriverEvent::RxFull);
        let done = st.rx.take();
        retire(&mut st.filled, done);
        if let (Some(next), Some(dma)) = (st.staged_rx.take(), self.dma) {
            let units = next.cursor.remaining() / usize::from(unit_bytes(st.bits));
            dma.set_destination(self.config.dma_channel, next.cursor.address());
            dma.set_count(self.config.dma_channel, u32::try_from(units).unwrap_or(u32::MAX));
            dma.start(self.config.dma_channel);
            st.remaining = next.cursor.remaining();
            st.rx = Some(next);
            return;
        }
        st.dma_active = false;
        st.remaining = 0;
        self.stop(st);
    }

    fn check_status(&self, st: &mut UartState) {
        let hw = self.device.hw();
        let status = hw.shifter_status();
        let errors = hw.shifter_error();
        let timers = hw.timer_status();
        match self.config.direction {
            UartDirection::Tx => self.check_status_tx(st, status, timers),
            UartDirection::Rx => self.check_status_rx(st, status, errors),
        }
    }

    fn check_status_tx(&self, st: &mut UartState, status: u32, timers: u32) {
        let hw = self.device.hw();
        let index = self.common.resource_index;
        let mask = bit(index);

        if st.remaining == 0 {
            // draining: wait for the queued characters to leave the shifter
            if timers & mask != 0 {
                hw.clear_timer_status(mask);
                st.tx_flush = st.tx_flush.saturating_sub(1);
                if st.tx_flush == 0 {
                    self.stop(st);
                    return;
                }
            }
            if status & mask != 0 {
                // keep the line idle high without framing a character
                hw.set_shifter_start(index, ShifterStart::One);
                hw.write_buffer(index, BufferMode::Normal, u32::MAX);
            }
            return;
        }
        if st.dma_active || status & mask == 0 {
            return;
        }

        let unit = unit_bytes(st.bits);
        if let Some(tx) = st.tx.as_mut() {
            if let Some(value) = tx.next(unit) {
                hw.write_buffer(index, BufferMode::Normal, value);
            }
            st.remaining = tx.remaining();
        }
        if st.remaining > 0 {
            return;
        }

        push_event(&mut st.events, DriverEvent::TxEmpty);
        if let Some(next) = st.staged_tx.take() {
            st.remaining = next.remaining();
            st.tx = Some(next);
            st.tx_flush = 2;
            return;
        }
        hw.clear_timer_status(mask);
        if self.config.driver_type == DriverType::Interrupts {
            hw.set_shifter_interrupts(mask, false);
            hw.set_timer_interrupts(mask, true);
        }
    }

    fn check_status_rx(&self, st: &mut UartState, status: u32, errors: u32) {
        let hw = self.device.hw();
        let index = self.common.resource_index;
        let mask = bit(index);

        if errors & mask != 0 {
            st.status.record(Error::RxOverrun);
            hw.clear_shifter_error(mask);
        }
        if st.dma_active || status & mask == 0 || st.remaining == 0 {
            return;
        }

        let value = hw.read_buffer(index, BufferMode::Normal) >> (32 - u32::from(st.bits));
        let unit = unit_bytes(st.bits);
        if let Some(rx) = st.rx.as_mut() {
            rx.cursor.push(unit, value);
            st.remaining = rx.cursor.remaining();
        }
        if st.remaining > 0 {
            return;
        }

        push_event(&mut st.events, DriverEvent::RxFull);
        let done = st.rx.take();
        retire(&mut st.filled, done);
        if let Some(next) = st.staged_rx.take() {
            st.remaining = next.cursor.remaining();
            st.rx = Some(next);
            return;
        }
        self.stop(st);
    }

    /// Force the hardware back to its configured idle state and end the
    /// transfer with whatever status has been recorded.
    fn stop(&self, st: &mut UartState) {
        let hw = self.device.hw();
        let index = self.common.resource_index;
        let mask = bit(index);

        hw.set_shifter_mode(index, ShifterMode::Disabled);
        hw.set_timer_mode(index, TimerMode::Disabled);
        if self.config.direction == UartDirection::Tx {
            hw.set_shifter_start(index, ShifterStart::Zero);
        }
        hw.clear_timer_status(mask);
        hw.clear_shifter_error(mask);

        if st.dma_active {
            if let Some(dma) = self.dma {
                dma.stop(self.config.dma_channel);
                let units = dma.remaining(self.config.dma_channel) as usize;
                st.remaining = units * usize::from(unit_bytes(st.bits));
            }
            st.dma_active = false;
        }
        self.end_transfer(st);
    }

    fn end_transfer(&self, st: &mut UartState) {
        let hw = self.device.hw();
        let mask = bit(self.common.resource_index);
        match self.config.driver_type {
            DriverType::Interrupts => {
                hw.set_shifter_interrupts(mask, false);
                hw.set_shifter_error_interrupts(mask, false);
                hw.set_timer_interrupts(mask, false);
            }
            DriverType::Dma => {
                hw.set_shifter_dma_requests(mask, false);
                hw.set_shifter_error_interrupts(mask, false);
                hw.set_timer_interrupts(mask, false);
            }
            DriverType::Polling => {}
        }

        st.status.idle = true;
        st.tx = None;
        st.staged_tx = None;
        let current = st.rx.take();
        retire(&mut st.filled, current);
        let staged = st.staged_rx.take();
        retire(&mut st.filled, staged);
        if st.status.blocking {
            self.semaphore.post();
        }
        push_event(&mut st.events, DriverEvent::EndTransfer);

        match st.status.error {
            None => self.device.logger().debug_fmt(format_args!(
                "uart{}: transfer done",
                self.common.resource_index
            )),
            Some(e) => self.device.logger().error_fmt(format_args!(
                "uart{}: transfer ended: {e}",
                self.common.resource_index
            )),
        }
    }

    fn step(&self) {
        critical_section::with(|cs| {
            let mut st = self.state.borrow_ref_mut(cs);
            if !st.status.idle {
                self.check_status(&mut st);
            }
        });
    }
}

impl<H, O, L, D> EioIsr for UartDriver<'_, H, O, L, D>
where
    H: EioHardware,
    O: Osif,
    L: Logger,
    D: DmaService,
{
    fn common(&self) -> CommonDriverState {
        self.common
    }

    fn service(&self) {
        self.step();
    }
}

impl<H, O, L, D> BlockingTransfer for UartDriver<'_, H, O, L, D>
where
    H: EioHardware,
    O: Osif,
    L: Logger,
    D: DmaService,
{
    type Semaphore = O::Semaphore;

    fn driver_type(&self) -> DriverType {
        self.config.driver_type
    }

    fn semaphore(&self) -> &O::Semaphore {
        &self.semaphore
    }

    fn millis(&self) -> u32 {
        self.device.osif().millis()
    }

    fn step(&self) {
        UartDriver::step(self);
    }

    fn is_busy(&self) -> bool {
        UartDriver::is_busy(self)
    }

    fn expire(&self) {
        critical_section::with(|cs| {
            let mut st = self.state.borrow_ref_mut(cs);
            if !st.status.idle {
                st.status.record(Error::Timeout);
                self.stop(&mut st);
            }
        });
    }

    fn finish(&self) -> Result<(), Error> {
        critical_section::with(|cs| {
            let mut st = self.state.borrow_ref_mut(cs);
            st.status.blocking = false;
            match st.status.result() {
                Ok(()) => Ok(()),
                Err(nb::Error::Other(e)) => Err(e),
                Err(nb::Error::WouldBlock) => Err(Error::Timeout),
            }
        })
    }
}

impl<H, O, L, D> embedded_io::ErrorType for UartDriver<'_, H, O, L, D>
where
    H: EioHardware,
    O: Osif,
    L: Logger,
    D: DmaService,
{
    type Error = Error;
}

impl<H, O, L, D> embedded_io::Write for UartDriver<'_, H, O, L, D>
where
    H: EioHardware,
    O: Osif,
    L: Logger,
    D: DmaService,
{
    fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.send_blocking(buf, self.config.timeout)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Error> {
        // send_blocking only returns once the stop bit is out
        Ok(())
    }
}

impl<H, O, L, D> embedded_io::Read for UartDriver<'_, H, O, L, D>
where
    H: EioHardware,
    O: Osif,
    L: Logger,
    D: DmaService,
{
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.receive_blocking(buf, self.config.timeout)?;
        Ok(buf.len())
    }
}
