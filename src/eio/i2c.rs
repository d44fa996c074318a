// Licensed under the Apache-2.0 license

//! I2C master emulation on two shifters and two timers.
//!
//! Shifter `n` drives SDA open drain, shifter `n + 1` reads every bit back,
//! which is how the driver sees both the target's data and its ACK/NACK.
//! Timer `n` generates SCL and is loaded with the number of SCL edges of the
//! whole transfer, so it stops on its own after the last byte. Timer `n + 1`
//! counts SCL edges on the pin and clocks the shifters; because it follows
//! the pin and the SCL timer restarts whenever the pin disagrees with its
//! output, a target stretching the clock holds the master back.
//!
//! The SCL edge counter is only eight bits wide. Transfers longer than that
//! are split into several reloads of 256 edges, and the last reload is
//! patched in from the timer interrupt once the previous one expires.

use core::cell::RefCell;

use embedded_hal::i2c::{Operation, SevenBitAddress};
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
    fill, retire, wait_blocking, BlockingTransfer, FilledBuffers, RxSlot, TransferStatus,
};
use crate::common::{Logger, NoOpLogger};
use crate::dma::{DmaDirection, DmaEvent, DmaService, DmaTransfer, DmaWidth, NoDma};
use crate::osif::{Osif, Semaphore};

/// One extra unit compensates the SCL timer restart used for clock stretching.
const DIVIDER_BIAS: u8 = 2;
const DIVIDER_MIN: u8 = 1;
/// Control timer: 8 data bits plus ACK, two edges each, minus one.
const CONTROL_COMPARE: u16 = 0x000F;
/// Largest merged run of same-direction operations in an `I2c` transaction.
const MERGE_CAPACITY: usize = 64;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct I2cConfig {
    pub baud_rate: HertzU32,
    /// 7-bit target address.
    pub slave_address: u8,
    pub sda_pin: u8,
    pub scl_pin: u8,
    pub driver_type: DriverType,
    pub tx_dma_channel: u8,
    pub rx_dma_channel: u8,
    /// Deadline used by the `embedded-hal` implementation.
    pub timeout: MillisDurationU32,
}

pub struct I2cConfigBuilder {
    baud_rate: HertzU32,
    slave_address: u8,
    sda_pin: u8,
    scl_pin: u8,
    driver_type: DriverType,
    tx_dma_channel: u8,
    rx_dma_channel: u8,
    timeout: MillisDurationU32,
}

impl Default for I2cConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl I2cConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            baud_rate: 100.kHz(),
            slave_address: 0,
            sda_pin: 0,
            scl_pin: 1,
            driver_type: DriverType::Interrupts,
            tx_dma_channel: 0,
            rx_dma_channel: 1,
            timeout: MillisDurationU32::millis(100),
        }
    }
    #[must_use]
    pub fn baud_rate(mut self, baud_rate: HertzU32) -> Self {
        self.baud_rate = baud_rate;
        self
    }
    #[must_use]
    pub fn slave_address(mut self, address: u8) -> Self {
        self.slave_address = address;
        self
    }
    #[must_use]
    pub fn pins(mut self, sda: u8, scl: u8) -> Self {
        self.sda_pin = sda;
        self.scl_pin = scl;
        self
    }
    #[must_use]
    pub fn driver_type(mut self, driver_type: DriverType) -> Self {
        self.driver_type = driver_type;
        self
    }
    #[must_use]
    pub fn dma_channels(mut self, tx: u8, rx: u8) -> Self {
        self.tx_dma_channel = tx;
        self.rx_dma_channel = rx;
        self
    }
    #[must_use]
    pub fn timeout(mut self, timeout: MillisDurationU32) -> Self {
        self.timeout = timeout;
        self
    }
    #[must_use]
    pub fn build(self) -> I2cConfig {
        I2cConfig {
            baud_rate: self.baud_rate,
            slave_address: self.slave_address,
            sda_pin: self.sda_pin,
            scl_pin: self.scl_pin,
            driver_type: self.driver_type,
            tx_dma_channel: self.tx_dma_channel,
            rx_dma_channel: self.rx_dma_channel,
            timeout: self.timeout,
        }
    }
}

/// How the SCL edges of a transfer are spread over 8-bit counter reloads.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct EdgePlan {
    /// Timer expirations until the transfer is over.
    pub reloads: u16,
    /// Edges counted by the final reload.
    pub last: u16,
}

impl EdgePlan {
    /// Plan for `wire_bytes` bytes on the bus, address included: 9 clocks
    /// per byte, two edges per clock, plus the stop condition.
    pub(crate) fn new(wire_bytes: usize) -> Self {
        let cap = u32::from(u16::MAX);
        let bytes = u32::try_from(wire_bytes).map_or(cap, |b| b.min(cap));
        let edges = 18 * bytes + 2;
        // the compare register holds the count minus one
        let counted = edges - 1;
        let reloads = counted.div_ceil(256);
        let last = counted - 256 * (reloads - 1);
        Self {
            reloads: u16::try_from(reloads).unwrap_or(u16::MAX),
            last: u16::try_from(last).unwrap_or(256),
        }
    }

    /// Upper byte of the SCL compare value for the first reload.
    fn first_count(self) -> u16 {
        if self.reloads > 1 {
            0xFF
        } else {
            self.last - 1
        }
    }
}

#[derive(Debug)]
struct I2cState {
    status: TransferStatus,
    divider: u8,
    slave_address: u8,
    receive: bool,
    send_stop: bool,
    tx: Option<TxCursor>,
    rx: Option<RxSlot>,
    /// Data bytes still to write, plus the trailing stop/restart filler.
    tx_remaining: usize,
    /// Data bytes still to read back.
    rx_remaining: usize,
    addr_received: bool,
    plan: EdgePlan,
    reloads_left: u16,
    /// Bytes handed to DMA on each side; zero when the transfer is too short.
    dma_bulk: usize,
    tx_dma_active: bool,
    rx_dma_active: bool,
    events: EventQueue,
    filled: FilledBuffers,
}

/// I2C bus master.
pub struct I2cMaster<'d, H, O, L = NoOpLogger, D = NoDma>
where
    H: EioHardware,
    O: Osif,
    L: Logger,
    D: DmaService,
{
    device: &'d EioDevice<H, O, L>,
    dma: Option<&'d D>,
    common: CommonDriverState,
    config: I2cConfig,
    semaphore: O::Semaphore,
    state: critical_section::Mutex<RefCell<I2cState>>,
}

impl<'d, H, O, L> I2cMaster<'d, H, O, L, NoDma>
where
    H: EioHardware,
    O: Osif,
    L: Logger,
{
    /// # Errors
    ///
    /// See [`I2cMaster::with_dma`].
    pub fn new(device: &'d EioDevice<H, O, L>, config: I2cConfig) -> Result<Self, Error> {
        Self::init(device, config, None)
    }
}

impl<'d, H, O, L, D> I2cMaster<'d, H, O, L, D>
where
    H: EioHardware,
    O: Osif,
    L: Logger,
    D: DmaService,
{
    /// Bind an I2C master.
    ///
    /// # Errors
    ///
    /// * `Error::InvalidConfig` - address wider than 7 bits, or DMA mode
    ///   without a DMA service
    /// * `Error::NotInitialized` / `Error::NotEnoughResources` - from allocation
    pub fn with_dma(
        device: &'d EioDevice<H, O, L>,
        config: I2cConfig,
        dma: &'d D,
    ) -> Result<Self, Error> {
        Self::init(device, config, Some(dma))
    }

    fn init(
        device: &'d EioDevice<H, O, L>,
        config: I2cConfig,
        dma: Option<&'d D>,
    ) -> Result<Self, Error> {
        if config.slave_address > 0x7F {
            return Err(Error::InvalidConfig);
        }
        if config.driver_type == DriverType::Dma && dma.is_none() {
            return Err(Error::InvalidConfig);
        }

        let mut common = device.init_driver(2)?;
        if config.driver_type != DriverType::Polling {
            device.set_isr(&mut common, true);
        }
        let divider = baud_divider(
            device.input_clock().raw(),
            config.baud_rate.raw(),
            DIVIDER_BIAS,
            DIVIDER_MIN,
        );
        let plan = EdgePlan::new(1);
        let driver = Self {
            device,
            dma,
            common,
            config,
            semaphore: device.osif().semaphore_create(0),
            state: critical_section::Mutex::new(RefCell::new(I2cState {
                status: TransferStatus::new(),
                divider,
                slave_address: config.slave_address,
                receive: false,
                send_stop: true,
                tx: None,
                rx: None,
                tx_remaining: 0,
                rx_remaining: 0,
                addr_received: false,
                plan,
                reloads_left: 0,
                dma_bulk: 0,
                tx_dma_active: false,
                rx_dma_active: false,
                events: EventQueue::new(),
                filled: FilledBuffers::new(),
            })),
        };
        driver.configure(divider);
        device.logger().debug_fmt(format_args!(
            "i2c{}: {} Hz, divider {}",
            common.resource_index,
            config.baud_rate.raw(),
            divider
        ));
        Ok(driver)
    }

    /// Release shifters and timers. Refused while a transfer is in flight.
    ///
    /// # Errors
    ///
    /// Hands the driver back when it is busy.
    pub fn deinit(self) -> Result<(), Self> {
        if self.is_busy() {
            return Err(self);
        }
        self.disable_resources();
        self.device.deinit_driver(&self.common);
        Ok(())
    }

    fn tx_index(&self) -> u8 {
        self.common.resource_index
    }

    fn rx_index(&self) -> u8 {
        self.common.resource_index + 1
    }

    fn scl_timer(&self) -> u8 {
        self.common.resource_index
    }

    fn control_timer(&self) -> u8 {
        self.common.resource_index + 1
    }

    fn configure(&self, divider: u8) {
        let hw = self.device.hw();
        let sda = self.config.sda_pin;
        let scl = self.config.scl_pin;

        hw.set_shifter_config(
            self.tx_index(),
            ShifterConfig {
                start: ShifterStart::Zero,
                stop: ShifterStop::One,
                source: ShifterSource::Pin,
            },
        );
        hw.set_shifter_control(
            self.tx_index(),
            ShifterControl {
                mode: ShifterMode::Disabled,
                pin: sda,
                pin_polarity: PinPolarity::ActiveLow,
                pin_config: PinConfig::Disabled,
                timer: self.control_timer(),
                timer_polarity: TimerPolarity::Posedge,
            },
        );
        hw.set_shifter_config(
            self.rx_index(),
            ShifterConfig {
                start: ShifterStart::Disabled,
                stop: ShifterStop::Zero,
                source: ShifterSource::Pin,
            },
        );
        hw.set_shifter_control(
            self.rx_index(),
            ShifterControl {
                mode: ShifterMode::Disabled,
                pin: sda,
                pin_polarity: PinPolarity::ActiveHigh,
                pin_config: PinConfig::Disabled,
                timer: self.control_timer(),
                timer_polarity: TimerPolarity::Negedge,
            },
        );

        hw.set_timer_compare(self.scl_timer(), u16::from(divider));
        hw.set_timer_config(
            self.scl_timer(),
            TimerConfig {
                start: TimerStart::Enabled,
                stop: TimerStop::OnCompare,
                enable: TimerEnable::TriggerHigh,
                disable: TimerDisable::OnCompare,
                reset: TimerReset::PinEqualsOutput,
                decrement: TimerDecrement::ClockShiftTimer,
                output: TimerOutput::ZeroOnEnable,
            },
        );
        hw.set_timer_control(
            self.scl_timer(),
            TimerControl {
                mode: TimerMode::Disabled,
                pin: scl,
                pin_polarity: PinPolarity::ActiveHigh,
                pin_config: PinConfig::OpenDrain,
                trigger: shifter_trigger(self.tx_index()),
                trigger_polarity: TriggerPolarity::ActiveLow,
                trigger_source: TriggerSource::Internal,
            },
        );

        hw.set_timer_compare(self.control_timer(), CONTROL_COMPARE);
        hw.set_timer_config(
            self.control_timer(),
            TimerConfig {
                start: TimerStart::Enabled,
                stop: TimerStop::OnCompare,
                enable: TimerEnable::OnPreviousEnable,
                disable: TimerDisable::OnPreviousDisable,
                reset: TimerReset::Never,
                decrement: TimerDecrement::PinShiftPin,
                output: TimerOutput::OneOnEnable,
            },
        );
        hw.set_timer_control(
            self.control_timer(),
            TimerControl {
                mode: TimerMode::Disabled,
                pin: scl,
                pin_polarity: PinPolarity::ActiveLow,
                pin_config: PinConfig::Disabled,
                trigger: 0,
                trigger_polarity: TriggerPolarity::ActiveHigh,
                trigger_source: TriggerSource::External,
            },
        );
    }

    pub fn common(&self) -> CommonDriverState {
        self.common
    }

    pub fn config(&self) -> &I2cConfig {
        &self.config
    }

    /// Target for subsequent transfers.
    ///
    /// # Errors
    ///
    /// * `Error::InvalidConfig` - address wider than 7 bits
    /// * `Error::Busy` - a transfer is in flight
    pub fn set_slave_address(&self, address: u8) -> Result<(), Error> {
        if address > 0x7F {
            return Err(Error::InvalidConfig);
        }
        critical_section::with(|cs| {
            let mut st = self.state.borrow_ref_mut(cs);
            if !st.status.idle {
                return Err(Error::Busy);
            }
            st.slave_address = address;
            Ok(())
        })
    }

    pub fn slave_address(&self) -> u8 {
        critical_section::with(|cs| self.state.borrow_ref(cs).slave_address)
    }

    /// # Errors
    ///
    /// * `Error::Busy` - a transfer is in flight
    pub fn set_baud_rate(&self, baud_rate: HertzU32) -> Result<(), Error> {
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
            st.divider = divider;
            Ok(())
        })
    }

    /// SCL frequency the current divider produces.
    pub fn baud_rate(&self) -> HertzU32 {
        let divider = critical_section::with(|cs| self.state.borrow_ref(cs).divider);
        HertzU32::from_raw(divider_baud(
            self.device.input_clock().raw(),
            divider,
            DIVIDER_BIAS,
        ))
    }

    /// Start writing `data` to the target and return immediately.
    /// `send_stop = false` leaves the bus claimed for a repeated start.
    ///
    /// # Errors
    ///
    /// * `Error::Busy` - a transfer is already in flight
    /// * `Error::BusBusy` - SDA or SCL is held low
    /// * `Error::Unsupported` - buffer outside DMA-capable memory
    pub fn write(&self, data: &'static [u8], send_stop: bool) -> Result<(), Error> {
        self.start(Some(TxCursor::new(data)), None, data.len(), send_stop, false)
    }

    /// Write `data` and wait for the transfer to finish.
    ///
    /// # Errors
    ///
    /// As [`I2cMaster::write`], plus `Error::Nack` when the target does not
    /// answer and `Error::Timeout`.
    pub fn write_blocking(
        &self,
        data: &[u8],
        send_stop: bool,
        timeout: MillisDurationU32,
    ) -> Result<(), Error> {
        self.semaphore.drain();
        self.start(Some(TxCursor::new(data)), None, data.len(), send_stop, true)?;
        wait_blocking(self, timeout)
    }

    /// Start reading into `buffer` and return immediately. The buffer comes
    /// back through [`I2cMaster::take_rx_buffer`].
    ///
    /// # Errors
    ///
    /// As [`I2cMaster::write`], plus `Error::InvalidConfig` for an empty buffer.
    pub fn read(&self, buffer: &'static mut [u8], send_stop: bool) -> Result<(), Error> {
        let len = buffer.len();
        self.start(None, Some(RxSlot::leased(buffer)), len, send_stop, false)
    }

    /// Fill `buffer` from the target, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// As [`I2cMaster::read`], plus `Error::Nack` and `Error::Timeout`.
    pub fn read_blocking(
        &self,
        buffer: &mut [u8],
        send_stop: bool,
        timeout: MillisDurationU32,
    ) -> Result<(), Error> {
        self.semaphore.drain();
        let len = buffer.len();
        let slot = RxSlot::borrowed(RxCursor::new(buffer));
        self.start(None, Some(slot), len, send_stop, true)?;
        wait_blocking(self, timeout)
    }

    fn start(
        &self,
        tx: Option<TxCursor>,
        rx: Option<RxSlot>,
        len: usize,
        send_stop: bool,
        blocking: bool,
    ) -> Result<(), Error> {
        let receive = rx.is_some();
        if receive && len == 0 {
            return Err(Error::InvalidConfig);
        }
        let hw = self.device.hw();
        let tx_bit = bit(self.tx_index());
        let rx_bit = bit(self.rx_index());
        let scl_bit = bit(self.scl_timer());

        critical_section::with(|cs| {
            let mut st = self.state.borrow_ref_mut(cs);
            if !st.status.idle {
                return Err(Error::Busy);
            }
            let pins = hw.pin_data();
            if pins & bit(self.config.sda_pin) == 0 || pins & bit(self.config.scl_pin) == 0 {
                self.device.logger().error_fmt(format_args!(
                    "i2c{}: bus busy, pins {pins:#x}",
                    self.common.resource_index
                ));
                return Err(Error::BusBusy);
            }

            let use_dma = self.config.driver_type == DriverType::Dma && len >= 2;
            let bulk = if use_dma { len - 1 } else { 0 };
            if use_dma {
                let memory = tx.as_ref().map(TxCursor::address);
                self.start_tx_dma(memory, bulk)?;
            }
            st.status.begin(blocking)?;

            st.receive = receive;
            st.send_stop = send_stop;
            st.tx = tx;
            st.rx = rx;
            st.tx_remaining = len + 1;
            st.rx_remaining = len;
            st.addr_received = false;
            st.plan = EdgePlan::new(len + 1);
            st.reloads_left = st.plan.reloads;
            st.dma_bulk = bulk;
            st.tx_dma_active = use_dma;
            st.rx_dma_active = false;

            hw.set_shifter_stop(self.tx_index(), ShifterStop::One);
            hw.set_shifter_stop(self.rx_index(), ShifterStop::Zero);
            hw.set_timer_compare(
                self.scl_timer(),
                (st.plan.first_count() << 8) | u16::from(st.divider),
            );
            hw.clear_shifter_error(tx_bit | rx_bit);
            hw.clear_shifter_status(rx_bit);
            hw.clear_timer_status(scl_bit);

            hw.set_shifter_pin_config(self.tx_index(), PinConfig::OpenDrain);
            hw.set_shifter_mode(self.tx_index(), ShifterMode::Transmit);
            hw.set_shifter_mode(self.rx_index(), ShifterMode::Receive);
            hw.set_timer_mode(self.scl_timer(), TimerMode::Baud8Bit);
            hw.set_timer_mode(self.control_timer(), TimerMode::Counter16Bit);

            let address = (u32::from(st.slave_address) << 1) | u32::from(receive);
            hw.write_buffer(self.tx_index(), BufferMode::BitSwap, address << 24);

            match self.config.driver_type {
                DriverType::Interrupts | DriverType::Dma => {
                    let tx_irq = if use_dma { 0 } else { tx_bit };
                    hw.set_shifter_interrupts(tx_irq | rx_bit, true);
                    hw.set_shifter_error_interrupts(tx_bit | rx_bit, true);
                    hw.set_timer_interrupts(scl_bit, true);
                    if use_dma {
                        hw.set_shifter_dma_requests(tx_bit, true);
                    }
                }
                DriverType::Polling => {}
            }
            self.device.logger().debug_fmt(format_args!(
                "i2c{}: {} {len} bytes at {:#04x}{}",
                self.common.resource_index,
                if receive { "read" } else { "write" },
                st.slave_address,
                if send_stop { "" } else { ", no stop" }
            ));
            Ok(())
        })
    }

    fn start_tx_dma(&self, memory: Option<usize>, bulk: usize) -> Result<(), Error> {
        let dma = self.dma.ok_or(Error::InvalidConfig)?;
        if let Some(address) = memory {
            if !dma.is_dma_capable(address, bulk) {
                return Err(Error::Unsupported);
            }
        }
        let transfer = DmaTransfer {
            direction: DmaDirection::MemoryToPeripheral,
            source: memory.unwrap_or_else(fill::ones),
            destination: self.device.hw().buffer_address(self.tx_index(), BufferMode::BitSwap) + 3,
            width: DmaWidth::Byte,
            count: u32::try_from(bulk).map_err(|_| Error::InvalidConfig)?,
            source_increment: memory.is_some(),
            destination_increment: false,
            request: self.device.dma_request(self.tx_index()),
        };
        self.configure_dma(dma, self.config.tx_dma_channel, &transfer)
    }

    fn start_rx_dma(&self, st: &mut I2cState) -> Result<(), Error> {
        let dma = self.dma.ok_or(Error::InvalidConfig)?;
        let destination = st.rx.as_ref().map(|slot| slot.cursor.address());
        if let Some(address) = destination {
            if !dma.is_dma_capable(address, st.dma_bulk) {
                return Err(Error::Unsupported);
            }
        }
        let transfer = DmaTransfer {
            direction: DmaDirection::PeripheralToMemory,
            source: self.device.hw().buffer_address(self.rx_index(), BufferMode::BitSwap),
            destination: destination.unwrap_or_else(fill::sink),
            width: DmaWidth::Byte,
            count: u32::try_from(st.dma_bulk).map_err(|_| Error::InvalidConfig)?,
            source_increment: false,
            destination_increment: destination.is_some(),
            request: self.device.dma_request(self.rx_index()),
        };
        self.configure_dma(dma, self.config.rx_dma_channel, &transfer)?;
        st.rx_dma_active = true;
        let hw = self.device.hw();
        hw.set_shifter_interrupts(bit(self.rx_index()), false);
        hw.set_shifter_dma_requests(bit(self.rx_index()), true);
        Ok(())
    }

    fn configure_dma(&self, dma: &D, channel: u8, transfer: &DmaTransfer) -> Result<(), Error> {
        dma.configure(channel, transfer).map_err(|e| {
            self.device.logger().error_fmt(format_args!(
                "i2c{}: dma channel {channel} setup failed: {e:?}",
                self.common.resource_index
            ));
            Error::Dma
        })?;
        dma.start(channel);
        Ok(())
    }

    /// Advance a polling-mode transfer by one step and report its status.
    pub fn poll(&self) -> nb::Result<(), Error> {
        if self.config.driver_type == DriverType::Polling {
            self.step();
        }
        self.status()
    }

    pub fn status(&self) -> nb::Result<(), Error> {
        critical_section::with(|cs| self.state.borrow_ref(cs).status.result())
    }

    /// Data bytes not transferred yet.
    pub fn remaining(&self) -> usize {
        critical_section::with(|cs| {
            let st = self.state.borrow_ref(cs);
            let moved = match self.dma.filter(|_| st.rx_dma_active) {
                Some(dma) => st
                    .dma_bulk
                    .saturating_sub(dma.remaining(self.config.rx_dma_channel) as usize),
                None => 0,
            };
            st.rx_remaining.saturating_sub(moved)
        })
    }

    pub fn is_busy(&self) -> bool {
        critical_section::with(|cs| !self.state.borrow_ref(cs).status.idle)
    }

    /// Stop the transfer in flight with `Error::Aborted`. No-op when idle.
    ///
    /// Stopping in the middle of a byte can leave a target holding SDA low;
    /// keep this for recovery.
    ///
    /// # Errors
    ///
    /// Never fails.
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

    pub fn take_rx_buffer(&self) -> Option<&'static mut [u8]> {
        critical_section::with(|cs| self.state.borrow_ref_mut(cs).filled.pop_front())
            .map(|lease| lease.release())
    }

    /// Forward a notification of either DMA channel. DMA only moves the bulk
    /// of the data; the last byte and the stop condition are always handled
    /// by the interrupt path.
    pub fn on_dma_event(&self, channel: u8, event: DmaEvent) {
        let tx_channel = self.config.tx_dma_channel;
        let rx_channel = self.config.rx_dma_channel;
        if channel != tx_channel && channel != rx_channel {
            return;
        }
        let hw = self.device.hw();
        critical_section::with(|cs| {
            let mut st = self.state.borrow_ref_mut(cs);
            if st.status.idle {
                return;
            }
            match event {
                DmaEvent::Error => {
                    self.device.logger().error_fmt(format_args!(
                        "i2c{}: dma channel {channel} error",
                        self.common.resource_index
                    ));
                    st.status.record(Error::Dma);
                    self.stop(&mut st);
                }
                DmaEvent::Complete if channel == tx_channel && st.tx_dma_active => {
                    st.tx_dma_active = false;
                    let bulk = st.dma_bulk;
                    st.tx_remaining = st.tx_remaining.saturating_sub(bulk);
                    if let Some(tx) = st.tx.as_mut() {
                        tx.advance(bulk);
                    }
                    hw.set_shifter_dma_requests(bit(self.tx_index()), false);
                    hw.set_shifter_interrupts(bit(self.tx_index()), true);
                }
                DmaEvent::Complete if channel == rx_channel && st.rx_dma_active => {
                    st.rx_dma_active = false;
                    let bulk = st.dma_bulk;
                    st.rx_remaining = st.rx_remaining.saturating_sub(bulk);
                    if let Some(rx) = st.rx.as_mut() {
                        rx.cursor.advance(bulk);
                    }
                    hw.set_shifter_dma_requests(bit(self.rx_index()), false);
                    hw.set_shifter_interrupts(bit(self.rx_index()), true);
                    if st.receive && st.rx_remaining == 1 {
                        self.nack_next_byte();
                    }
                }
                DmaEvent::Complete => {}
            }
        });
    }

    /// Master NACKs the byte being received and expects no ACK on readback.
    fn nack_next_byte(&self) {
        let hw = self.device.hw();
        hw.set_shifter_stop(self.tx_index(), ShifterStop::One);
        hw.set_shifter_stop(self.rx_index(), ShifterStop::One);
    }

    fn read_data(&self, st: &mut I2cState) {
        let hw = self.device.hw();
        let byte = hw.read_buffer(self.rx_index(), BufferMode::BitSwap) & 0xFF;

        if !st.addr_received {
            // first readback is our own address byte
            st.addr_received = true;
            if st.receive {
                hw.set_shifter_stop(self.tx_index(), ShifterStop::Zero);
            }
            if st.dma_bulk > 0 {
                if let Err(e) = self.start_rx_dma(st) {
                    st.status.record(e);
                    self.stop(st);
                    return;
                }
            }
        } else {
            st.rx_remaining = st.rx_remaining.saturating_sub(1);
            if st.receive {
                if let Some(rx) = st.rx.as_mut() {
                    rx.cursor.push(1, byte);
                }
            }
        }

        if st.receive && st.rx_remaining == 1 && !st.rx_dma_active {
            self.nack_next_byte();
        }
    }

    fn write_data(&self, st: &mut I2cState) {
        if st.tx_remaining == 0 {
            return;
        }
        let hw = self.device.hw();
        st.tx_remaining -= 1;
        let byte = if st.tx_remaining == 0 {
            // the filler shifts out after the last ACK and shapes the bus end
            if st.send_stop {
                hw.set_shifter_stop(self.tx_index(), ShifterStop::Zero);
                0x00
            } else {
                hw.set_shifter_stop(self.tx_index(), ShifterStop::One);
                0xFF
            }
        } else if st.receive {
            0xFF
        } else {
            st.tx.as_mut().and_then(|tx| tx.next(1)).unwrap_or(0xFF)
        };
        hw.write_buffer(self.tx_index(), BufferMode::BitSwap, byte << 24);
    }

    fn check_status(&self, st: &mut I2cState) {
        let hw = self.device.hw();
        let status = hw.shifter_status();
        let errors = hw.shifter_error();
        let timers = hw.timer_status();
        let tx_bit = bit(self.tx_index());
        let rx_bit = bit(self.rx_index());
        let scl_bit = bit(self.scl_timer());

        if errors & tx_bit != 0 {
            st.status.record(Error::TxUnderrun);
            hw.clear_shifter_error(tx_bit);
        }
        if errors & rx_bit != 0 {
            // an unread readback and a NACK raise the same flag; a transmit
            // buffer still waiting for data means software kept up, so the
            // target must have NACKed
            if status & tx_bit != 0 {
                st.status.record(Error::Nack);
                self.stop(st);
                return;
            }
            st.status.record(Error::RxOverrun);
            hw.clear_shifter_error(rx_bit);
        }

        if status & rx_bit != 0 && !st.rx_dma_active {
            self.read_data(st);
            if st.status.idle {
                return;
            }
        }
        if status & tx_bit != 0 && !st.tx_dma_active {
            self.write_data(st);
            if st.tx_remaining == 0 && self.config.driver_type != DriverType::Polling {
                hw.set_shifter_interrupts(tx_bit, false);
            }
        }
        if timers & scl_bit != 0 {
            hw.clear_timer_status(scl_bit);
            st.reloads_left = st.reloads_left.saturating_sub(1);
            match st.reloads_left {
                0 => self.stop(st),
                1 => {
                    let low = hw.timer_compare(self.scl_timer()) & 0xFF;
                    hw.set_timer_compare(self.scl_timer(), ((st.plan.last - 1) << 8) | low);
                }
                _ => {}
            }
        }
    }

    fn disable_resources(&self) {
        let hw = self.device.hw();
        hw.set_shifter_mode(self.tx_index(), ShifterMode::Disabled);
        hw.set_shifter_mode(self.rx_index(), ShifterMode::Disabled);
        hw.set_timer_mode(self.scl_timer(), TimerMode::Disabled);
        hw.set_timer_mode(self.control_timer(), TimerMode::Disabled);
    }

    fn stop(&self, st: &mut I2cState) {
        let hw = self.device.hw();
        let mask = self.common.resource_mask();

        hw.set_shifter_pin_config(self.tx_index(), PinConfig::Disabled);
        self.disable_resources();
        hw.clear_shifter_error(mask);
        hw.clear_shifter_status(bit(self.rx_index()));
        hw.clear_timer_status(mask);
        hw.set_shifter_stop(self.tx_index(), ShifterStop::One);
        hw.set_shifter_stop(self.rx_index(), ShifterStop::Zero);

        if st.tx_dma_active || st.rx_dma_active {
            if let Some(dma) = self.dma {
                if st.tx_dma_active {
                    dma.stop(self.config.tx_dma_channel);
                }
                if st.rx_dma_active {
                    dma.stop(self.config.rx_dma_channel);
                    let left = dma.remaining(self.config.rx_dma_channel) as usize;
                    let moved = st.dma_bulk.saturating_sub(left);
                    st.rx_remaining = st.rx_remaining.saturating_sub(moved);
                }
            }
            st.tx_dma_active = false;
            st.rx_dma_active = false;
        }
        self.end_transfer(st);
    }

    fn end_transfer(&self, st: &mut I2cState) {
        let hw = self.device.hw();
        let mask = self.common.resource_mask();
        match self.config.driver_type {
            DriverType::Interrupts => {
                hw.set_shifter_interrupts(mask, false);
                hw.set_shifter_error_interrupts(mask, false);
                hw.set_timer_interrupts(mask, false);
            }
            DriverType::Dma => {
                hw.set_shifter_dma_requests(mask, false);
                hw.set_shifter_interrupts(mask, false);
                hw.set_shifter_error_interrupts(mask, false);
                hw.set_timer_interrupts(mask, false);
            }
            DriverType::Polling => {}
        }

        st.status.idle = true;
        st.tx = None;
        let current = st.rx.take();
        retire(&mut st.filled, current);
        if st.status.blocking {
            self.semaphore.post();
        }
        push_event(&mut st.events, DriverEvent::EndTransfer);
        match st.status.error {
            None => self.device.logger().debug_fmt(format_args!(
                "i2c{}: transfer done",
                self.common.resource_index
            )),
            Some(e) => self.device.logger().error_fmt(format_args!(
                "i2c{}: transfer to {:#04x} ended: {e}",
                self.common.resource_index, st.slave_address
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

    /// Run `ops`, all of one direction, as a single bus operation.
    fn run_merged(&mut self, ops: &mut [Operation<'_>], send_stop: bool) -> Result<(), Error> {
        let timeout = self.config.timeout;
        match ops {
            [Operation::Write(bytes)] => self.write_blocking(bytes, send_stop, timeout),
            [Operation::Read(buffer)] => self.read_blocking(buffer, send_stop, timeout),
            [Operation::Write(_), ..] => {
                let mut merged = heapless::Vec::<u8, MERGE_CAPACITY>::new();
                for op in ops.iter() {
                    if let Operation::Write(bytes) = op {
                        merged
                            .extend_from_slice(bytes)
                            .map_err(|()| Error::InvalidConfig)?;
                    }
                }
                self.write_blocking(&merged, send_stop, timeout)
            }
            [Operation::Read(_), ..] => {
                let total: usize = ops
                    .iter()
                    .map(|op| match op {
                        Operation::Read(buffer) => buffer.len(),
                        Operation::Write(_) => 0,
                    })
                    .sum();
                let mut merged = heapless::Vec::<u8, MERGE_CAPACITY>::new();
                merged
                    .resize(total, 0)
                    .map_err(|()| Error::InvalidConfig)?;
                self.read_blocking(&mut merged, send_stop, timeout)?;
                let mut rest: &[u8] = &merged;
                for op in ops.iter_mut() {
                    if let Operation::Read(buffer) = op {
                        let (head, tail) = rest.split_at(buffer.len().min(rest.len()));
                        buffer.copy_from_slice(head);
                        rest = tail;
                    }
                }
                Ok(())
            }
            [] => Ok(()),
        }
    }
}

impl<H, O, L, D> EioIsr for I2cMaster<'_, H, O, L, D>
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

impl<H, O, L, D> BlockingTransfer for I2cMaster<'_, H, O, L, D>
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
        I2cMaster::step(self);
    }

    fn is_busy(&self) -> bool {
        I2cMaster::is_busy(self)
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

impl<H, O, L, D> embedded_hal::i2c::ErrorType for I2cMaster<'_, H, O, L, D>
where
    H: EioHardware,
    O: Osif,
    L: Logger,
    D: DmaService,
{
    type Error = Error;
}

impl<H, O, L, D> embedded_hal::i2c::I2c for I2cMaster<'_, H, O, L, D>
where
    H: EioHardware,
    O: Osif,
    L: Logger,
    D: DmaService,
{
    /// Adjacent operations of one direction go out as one bus operation;
    /// a direction change is a repeated start, and the last operation ends
    /// with a stop. Empty reads are skipped.
    fn transaction(
        &mut self,
        address: SevenBitAddress,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        self.set_slave_address(address)?;
        let mut rest = operations;
        while !rest.is_empty() {
            let reading = matches!(rest.first(), Some(Operation::Read(_)));
            let run = rest
                .iter()
                .take_while(|op| matches!(op, Operation::Read(_)) == reading)
                .count();
            let (group, tail) = core::mem::take(&mut rest).split_at_mut(run);
            // Trailing empty reads put nothing on the wire, so the stop
            // belongs to the last group that does.
            let send_stop = tail.iter().all(is_empty_read);
            if !group.iter().all(is_empty_read) {
                self.run_merged(group, send_stop)?;
            }
            rest = tail;
        }
        Ok(())
    }
}

fn is_empty_read(op: &Operation<'_>) -> bool {
    matches!(op, Operation::Read(buffer) if buffer.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eio::sim::{
        sim_device, with_irq_thread, MockDma, SimDevice, SimModel, SimRegs, SIM_BASE,
    };
    use embedded_hal::i2c::I2c;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// A target on the bus. Each tick shifts the pending master byte: the
    /// address is read back (and NACKed when nobody answers), data slots read
    /// back the master's byte or the target's, and the trailing filler ends
    /// the SCL edge count.
    #[derive(Default)]
    struct Target {
        present: bool,
        /// Data bytes per transfer, in order.
        lengths: VecDeque<usize>,
        replies: VecDeque<u8>,
        received: Vec<u8>,
        addresses: Vec<u8>,
        endings: Vec<ShifterStop>,
        pending: Option<u32>,
        slot: usize,
        len: usize,
        address: u8,
    }

    impl Target {
        fn new(lengths: &[usize], replies: &[u8]) -> Self {
            Self {
                present: true,
                lengths: lengths.iter().copied().collect(),
                replies: replies.iter().copied().collect(),
                ..Self::default()
            }
        }
    }

    impl SimModel for Target {
        fn on_write(&mut self, _regs: &mut SimRegs, index: u8, _mode: BufferMode, value: u32) {
            if index == 0 {
                self.pending = Some(value);
            }
        }

        fn tick(&mut self, regs: &mut SimRegs) {
            let shifting = regs.shifter_ctl[0].mode == ShifterMode::Transmit;
            if !shifting || regs.shifter_status & 0b10 != 0 {
                return;
            }
            let Some(value) = self.pending.take() else {
                regs.shifter_status |= 0b01;
                return;
            };
            let byte = (value >> 24) as u8;
            regs.shifter_status |= 0b01;
            if self.slot == 0 {
                self.address = byte;
                self.addresses.push(byte);
                self.len = self.lengths.pop_front().unwrap_or(0);
                regs.buffers[1] = u32::from(byte);
                regs.shifter_status |= 0b10;
                if !self.present {
                    regs.shifter_error |= 0b10;
                }
                self.slot = 1;
            } else if self.slot <= self.len {
                let wire = if self.address & 1 == 1 {
                    self.replies.pop_front().unwrap_or(0xFF)
                } else {
                    self.received.push(byte);
                    byte
                };
                regs.buffers[1] = u32::from(wire);
                regs.shifter_status |= 0b10;
                self.slot += 1;
            } else {
                self.endings.push(regs.shifter_cfg[0].stop);
                regs.timer_status |= 0b01;
                self.slot = 0;
            }
        }
    }

    /// Shares a model with the test so it can be inspected afterwards.
    struct Shared(Arc<Mutex<Target>>);

    impl SimModel for Shared {
        fn on_write(&mut self, regs: &mut SimRegs, index: u8, mode: BufferMode, value: u32) {
            self.0.lock().unwrap().on_write(regs, index, mode, value);
        }

        fn tick(&mut self, regs: &mut SimRegs) {
            self.0.lock().unwrap().tick(regs);
        }
    }

    fn attach(device: &SimDevice, target: Target) -> Arc<Mutex<Target>> {
        let shared = Arc::new(Mutex::new(target));
        device.hw().set_model(Shared(shared.clone()));
        shared
    }

    fn config(driver_type: DriverType) -> I2cConfig {
        I2cConfigBuilder::new()
            .slave_address(0x50)
            .driver_type(driver_type)
            .build()
    }

    fn timeout() -> MillisDurationU32 {
        MillisDurationU32::millis(100)
    }

    #[test]
    fn edge_plan_reload_arithmetic_holds() {
        for n in 1..=300usize {
            let plan = EdgePlan::new(n);
            let total = 18 * n as u32 + 2;
            assert!((1..=256).contains(&plan.last), "n = {n}");
            assert_eq!(
                u32::from(plan.reloads - 1) * 256 + u32::from(plan.last),
                total - 1,
                "n = {n}"
            );
        }
        assert_eq!(EdgePlan::new(1), EdgePlan { reloads: 1, last: 19 });
        assert_eq!(EdgePlan::new(14), EdgePlan { reloads: 1, last: 253 });
        assert_eq!(EdgePlan::new(15), EdgePlan { reloads: 2, last: 15 });
    }

    #[test]
    fn configures_scl_and_control_timers() {
        let device = sim_device(4);
        let i2c = I2cMaster::new(&device, config(DriverType::Polling)).unwrap();
        device.hw().regs(|r| {
            // 48 MHz / (2 * 100 kHz) = 240, minus the stretch bias
            assert_eq!(r.timer_cmp[0], 238);
            assert_eq!(r.timer_cfg[0].reset, TimerReset::PinEqualsOutput);
            assert_eq!(r.timer_ctl[0].pin_config, PinConfig::OpenDrain);
            assert_eq!(r.timer_cmp[1], CONTROL_COMPARE);
            assert_eq!(r.timer_cfg[1].decrement, TimerDecrement::PinShiftPin);
            assert_eq!(r.shifter_ctl[0].timer, 1);
            assert_eq!(r.shifter_cfg[1].stop, ShifterStop::Zero);
        });
        assert_eq!(i2c.baud_rate().raw(), 100_000);
    }

    #[test]
    fn write_sends_address_data_and_stop() {
        let device = sim_device(4);
        let i2c = I2cMaster::new(&device, config(DriverType::Polling)).unwrap();
        let target = attach(&device, Target::new(&[3], &[]));

        i2c.write_blocking(&[0xDE, 0xAD, 0x01], true, timeout()).unwrap();
        assert_eq!(i2c.remaining(), 0);
        let target = target.lock().unwrap();
        assert_eq!(target.addresses, [0xA0]);
        assert_eq!(target.received, [0xDE, 0xAD, 0x01]);
        assert_eq!(target.endings, [ShifterStop::Zero]);
        device.hw().regs(|r| {
            // 4 bytes on the wire: 18 * 4 + 1 edges, minus one for the compare
            assert_eq!(r.timer_cmp[0] >> 8, 72);
            assert_eq!(r.shifter_ctl[0].pin_config, PinConfig::Disabled);
            assert_eq!(r.shifter_cfg[0].stop, ShifterStop::One);
        });
    }

    #[test]
    fn read_acks_all_but_the_last_byte() {
        let device = sim_device(4);
        let i2c = I2cMaster::new(&device, config(DriverType::Polling)).unwrap();
        let _target = attach(&device, Target::new(&[3], &[0x11, 0x22, 0x33]));

        let mut buffer = [0u8; 3];
        i2c.read_blocking(&mut buffer, true, timeout()).unwrap();
        assert_eq!(buffer, [0x11, 0x22, 0x33]);
        // dummy bytes release SDA, the filler makes the stop
        let dummy = 0xFF << 24;
        device.hw().regs(|r| assert_eq!(r.written(0), [0xA1 << 24, dummy, dummy, dummy, 0]));
    }

    #[test]
    fn empty_read_is_rejected_empty_write_is_a_probe() {
        let device = sim_device(4);
        let i2c = I2cMaster::new(&device, config(DriverType::Polling)).unwrap();
        let _target = attach(&device, Target::new(&[0], &[]));
        assert_eq!(i2c.read_blocking(&mut [], true, timeout()), Err(Error::InvalidConfig));
        i2c.write_blocking(&[], true, timeout()).unwrap();
    }

    #[test]
    fn missing_target_is_reported_as_nack_once() {
        let device = sim_device(4);
        let i2c = I2cMaster::new(&device, config(DriverType::Polling)).unwrap();
        let target = Target {
            present: false,
            ..Target::new(&[2], &[])
        };
        let _target = attach(&device, target);

        assert_eq!(i2c.write_blocking(&[1, 2], true, timeout()), Err(Error::Nack));
        assert_eq!(i2c.next_event(), Some(DriverEvent::EndTransfer));
        assert_eq!(i2c.next_event(), None);
        assert_eq!(i2c.poll(), Err(nb::Error::Other(Error::Nack)));
        device.hw().regs(|r| {
            assert_eq!(r.shifter_error, 0);
            assert_eq!(r.shifter_ctl[0].mode, ShifterMode::Disabled);
        });
    }

    #[test]
    fn unread_readback_counts_as_overrun_not_nack() {
        let device = sim_device(4);
        let i2c = I2cMaster::new(&device, config(DriverType::Polling)).unwrap();
        i2c.write(b"xy", true).unwrap();
        // transmit buffer full, readback error: software fell behind
        device.hw().regs(|r| r.shifter_error = 0b10);
        assert_eq!(i2c.poll(), Err(nb::Error::WouldBlock));
        i2c.abort().unwrap();
        assert_eq!(i2c.status(), Err(nb::Error::Other(Error::Aborted)));
    }

    #[test]
    fn held_lines_refuse_to_start() {
        let device = sim_device(4);
        let i2c = I2cMaster::new(&device, config(DriverType::Polling)).unwrap();
        device.hw().regs(|r| r.pins = !bit(1));
        assert_eq!(i2c.write(b"a", true), Err(Error::BusBusy));
        assert!(!i2c.is_busy());
        device.hw().regs(|r| assert!(r.writes.is_empty()));
    }

    #[test]
    fn long_transfer_patches_the_last_reload() {
        let device = sim_device(4);
        let i2c = I2cMaster::new(&device, config(DriverType::Polling)).unwrap();
        i2c.write(&[0u8; 20], true).unwrap();
        // 21 bytes on the wire: 379 counted edges, 256 + 123
        assert_eq!(device.hw().regs(|r| r.timer_cmp[0]), 0xFF00 | 238);
        device.hw().regs(|r| r.timer_status = 0b01);
        assert_eq!(i2c.poll(), Err(nb::Error::WouldBlock));
        assert_eq!(device.hw().regs(|r| r.timer_cmp[0]), (122 << 8) | 238);
        device.hw().regs(|r| r.timer_status = 0b01);
        assert_eq!(i2c.poll(), Ok(()));
    }

    #[test]
    fn busy_master_rejects_reconfiguration() {
        let device = sim_device(4);
        let i2c = I2cMaster::new(&device, config(DriverType::Polling)).unwrap();
        assert_eq!(i2c.set_slave_address(0x80), Err(Error::InvalidConfig));
        i2c.set_slave_address(0x21).unwrap();
        i2c.write(b"q", true).unwrap();
        assert_eq!(i2c.set_slave_address(0x22), Err(Error::Busy));
        assert_eq!(i2c.set_baud_rate(400.kHz()), Err(Error::Busy));
        assert_eq!(i2c.write(b"r", true), Err(Error::Busy));
        assert_eq!(i2c.slave_address(), 0x21);
        assert_eq!(device.hw().regs(|r| r.written(0)), [0x42 << 24]);
    }

    #[test]
    fn write_read_uses_repeated_start() {
        let device = sim_device(4);
        let mut i2c = I2cMaster::new(&device, config(DriverType::Polling)).unwrap();
        let target = attach(&device, Target::new(&[1, 2], &[0xC0, 0xDE]));

        let mut data = [0u8; 2];
        i2c.write_read(0x3C, &[0x10], &mut data).unwrap();
        assert_eq!(data, [0xC0, 0xDE]);
        let target = target.lock().unwrap();
        assert_eq!(target.addresses, [0x78, 0x79]);
        assert_eq!(target.endings, [ShifterStop::One, ShifterStop::Zero]);
    }

    #[test]
    fn trailing_empty_read_still_ends_with_stop() {
        let device = sim_device(4);
        let mut i2c = I2cMaster::new(&device, config(DriverType::Polling)).unwrap();
        let target = attach(&device, Target::new(&[1], &[]));

        let mut nothing = [0u8; 0];
        let mut ops = [Operation::Write(&[0x10]), Operation::Read(&mut nothing)];
        i2c.transaction(0x3C, &mut ops).unwrap();
        let target = target.lock().unwrap();
        assert_eq!(target.received, [0x10]);
        assert_eq!(target.addresses, [0x78]);
        assert_eq!(target.endings, [ShifterStop::Zero]);
        assert!(!i2c.is_busy());
    }

    #[test]
    fn transaction_merges_adjacent_operations() {
        let device = sim_device(4);
        let mut i2c = I2cMaster::new(&device, config(DriverType::Polling)).unwrap();
        let target = attach(&device, Target::new(&[3, 3], &[1, 2, 3]));

        let (mut a, mut b) = ([0u8; 1], [0u8; 2]);
        let mut ops = [
            Operation::Write(&[0xAA]),
            Operation::Write(&[0xBB, 0xCC]),
            Operation::Read(&mut a),
            Operation::Read(&mut b),
        ];
        i2c.transaction(0x50, &mut ops).unwrap();
        assert_eq!((a, b), ([1], [2, 3]));
        let target = target.lock().unwrap();
        assert_eq!(target.received, [0xAA, 0xBB, 0xCC]);
        assert_eq!(target.addresses.len(), 2);
    }

    #[test]
    fn interrupt_mode_read_completes_from_isr() {
        let device = sim_device(4);
        let i2c = I2cMaster::new(&device, config(DriverType::Interrupts)).unwrap();
        let _target = attach(&device, Target::new(&[4], &[9, 8, 7, 6]));

        let mut buffer = [0u8; 4];
        let result = with_irq_thread(&device, &[&i2c], || {
            i2c.read_blocking(&mut buffer, true, MillisDurationU32::millis(500))
        });
        assert_eq!(result, Ok(()));
        assert_eq!(buffer, [9, 8, 7, 6]);
        device.hw().regs(|r| {
            assert_eq!(r.sien | r.eien | r.tien, 0);
        });
    }

    #[test]
    fn dma_moves_the_bulk_and_isr_finishes() {
        let device = sim_device(4);
        let dma = MockDma::default();
        let cfg = I2cConfigBuilder::new()
            .slave_address(0x50)
            .driver_type(DriverType::Dma)
            .dma_channels(2, 3)
            .build();
        let i2c = I2cMaster::with_dma(&device, cfg, &dma).unwrap();
        let data: &'static [u8] = &[1, 2, 3, 4];
        i2c.write(data, true).unwrap();

        let send = dma.with(|s| s.configured[&2]);
        assert_eq!(send.source, data.as_ptr() as usize);
        assert_eq!(send.destination, SIM_BASE + 0x280 + 3);
        assert_eq!(send.count, 3);
        device.hw().regs(|r| {
            assert_eq!(r.dma, 0b01);
            assert_eq!(r.sien, 0b10);
        });
        let irq = |setup: fn(&mut SimRegs)| {
            device.hw().regs(setup);
            device.irq_handler(&[&i2c]);
        };

        // address readback hands the receive side to DMA
        irq(|r| {
            r.buffers[1] = 0xA0;
            r.shifter_status |= 0b10;
        });
        let receive = dma.with(|s| s.configured[&3]);
        assert_eq!(receive.source, SIM_BASE + 0x280 + 4);
        assert_eq!(receive.destination, fill::sink());
        assert_eq!(receive.count, 3);
        device.hw().regs(|r| {
            assert_eq!(r.dma, 0b11);
            assert_eq!(r.sien, 0);
        });

        dma.drain(2);
        i2c.on_dma_event(2, DmaEvent::Complete);
        dma.drain(3);
        i2c.on_dma_event(3, DmaEvent::Complete);
        assert_eq!(i2c.remaining(), 1);
        assert_eq!(device.hw().regs(|r| r.sien), 0b11);

        // last data byte, then the stop filler, then the final readback
        irq(|r| r.shifter_status |= 0b01);
        irq(|r| r.shifter_status |= 0b01);
        irq(|r| {
            r.buffers[1] = 4;
            r.shifter_status |= 0b10;
        });
        assert_eq!(
            device.hw().regs(|r| r.written(0)),
            [0xA0 << 24, 4 << 24, 0]
        );
        assert!(i2c.is_busy());
        irq(|r| r.timer_status |= 0b01);
        assert_eq!(i2c.status(), Ok(()));
        assert_eq!(i2c.remaining(), 0);
        device.hw().regs(|r| assert_eq!(r.dma | r.sien | r.eien | r.tien, 0));
    }

    #[test]
    fn dma_error_aborts_with_dma_status() {
        let device = sim_device(4);
        let dma = MockDma::default();
        let cfg = I2cConfigBuilder::new().driver_type(DriverType::Dma).build();
        let i2c = I2cMaster::with_dma(&device, cfg, &dma).unwrap();
        let buffer: &'static mut [u8] = Box::leak(vec![0u8; 3].into_boxed_slice());
        i2c.read(buffer, true).unwrap();
        // the dummy bytes come from the all-ones fill word
        let send = dma.with(|s| s.configured[&0]);
        assert_eq!(send.source, fill::ones());
        assert!(!send.source_increment);

        i2c.on_dma_event(0, DmaEvent::Error);
        assert_eq!(i2c.status(), Err(nb::Error::Other(Error::Dma)));
        assert!(dma.with(|s| s.stops.contains(&0)));
        assert_eq!(i2c.take_rx_buffer().map(|b| b.len()), Some(3));
    }
}
