// Licensed under the Apache-2.0 license

//! SPI emulation on two shifters and two timers.
//!
//! Shifter `n` transmits, shifter `n + 1` receives. As master, timer `n`
//! generates SCK and timer `n + 1` drives SS for as long as SCK runs. As
//! slave, timer `n` counts SCK edges on the pin while SS is asserted.

use core::cell::RefCell;

use embedded_hal::spi::{Phase, Polarity};
use fugit::{HertzU32, MillisDurationU32, RateExtU32};

use super::common::{
    baud_divider, divider_baud, push_event, CommonDriverState, DriverEvent, DriverType, EioIsr,
    Error, EventQueue, RxCursor, TxCursor,
};
use super::device::EioDevice;
use super::hw::{
    bit, pin_trigger, shifter_trigger, BufferMode, EioHardware, PinConfig, PinPolarity,
    ShifterConfig, ShifterControl, ShifterMode, ShifterSource, ShifterStart, ShifterStop,
    TimerConfig, TimerControl, TimerDecrement, TimerDisable, TimerEnable, TimerMode, TimerOutput,
    TimerPolarity, TimerReset, TimerStart, TimerStop, TriggerPolarity, TriggerSource,
};
use super::transfer::{
    fill, retire, wait_blocking, BlockingTransfer, FilledBuffers, RxSlot, TransferStatus,
};
use crate::common::{Logger, NoOpLogger};
use crate::dma::{DmaDirection, DmaEvent, DmaService, DmaTransfer, DmaWidth, NoDma};
use crate::osif::{Osif, Semaphore};

const DIVIDER_BIAS: u8 = 1;
const DIVIDER_MIN: u8 = 1;
const DUMMY: u32 = u32::MAX;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SpiRole {
    Master,
    Slave,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BitOrder {
    MsbFirst,
    LsbFirst,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SpiPins {
    pub mosi: u8,
    pub miso: u8,
    pub sck: u8,
    pub ss: u8,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SpiConfig {
    pub role: SpiRole,
    /// SCK frequency; ignored by a slave.
    pub baud_rate: HertzU32,
    /// Bytes per frame: 1, 2 or 4.
    pub transfer_size: u8,
    pub bit_order: BitOrder,
    pub polarity: Polarity,
    pub phase: Phase,
    pub pins: SpiPins,
    pub driver_type: DriverType,
    pub tx_dma_channel: u8,
    pub rx_dma_channel: u8,
    /// Deadline used by the `SpiBus` implementation.
    pub timeout: MillisDurationU32,
}

pub struct SpiConfigBuilder {
    config: SpiConfig,
}

impl Default for SpiConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SpiConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: SpiConfig {
                role: SpiRole::Master,
                baud_rate: 1.MHz(),
                transfer_size: 1,
                bit_order: BitOrder::MsbFirst,
                polarity: Polarity::IdleLow,
                phase: Phase::CaptureOnFirstTransition,
                pins: SpiPins {
                    mosi: 0,
                    miso: 1,
                    sck: 2,
                    ss: 3,
                },
                driver_type: DriverType::Interrupts,
                tx_dma_channel: 0,
                rx_dma_channel: 1,
                timeout: MillisDurationU32::millis(100),
            },
        }
    }
    #[must_use]
    pub fn role(mut self, role: SpiRole) -> Self {
        self.config.role = role;
        self
    }
    #[must_use]
    pub fn baud_rate(mut self, baud_rate: HertzU32) -> Self {
        self.config.baud_rate = baud_rate;
        self
    }
    #[must_use]
    pub fn transfer_size(mut self, bytes: u8) -> Self {
        self.config.transfer_size = bytes;
        self
    }
    #[must_use]
    pub fn bit_order(mut self, order: BitOrder) -> Self {
        self.config.bit_order = order;
        self
    }
    #[must_use]
    pub fn mode(mut self, mode: embedded_hal::spi::Mode) -> Self {
        self.config.polarity = mode.polarity;
        self.config.phase = mode.phase;
        self
    }
    #[must_use]
    pub fn pins(mut self, pins: SpiPins) -> Self {
        self.config.pins = pins;
        self
    }
    #[must_use]
    pub fn driver_type(mut self, driver_type: DriverType) -> Self {
        self.config.driver_type = driver_type;
        self
    }
    #[must_use]
    pub fn dma_channels(mut self, tx: u8, rx: u8) -> Self {
        self.config.tx_dma_channel = tx;
        self.config.rx_dma_channel = rx;
        self
    }
    #[must_use]
    pub fn timeout(mut self, timeout: MillisDurationU32) -> Self {
        self.config.timeout = timeout;
        self
    }
    #[must_use]
    pub fn build(self) -> SpiConfig {
        self.config
    }
}

fn frame_bits(transfer_size: u8) -> u32 {
    8 * u32::from(transfer_size)
}

fn master_compare(transfer_size: u8, divider: u8) -> u16 {
    let edges = u16::from(transfer_size) * 16 - 1;
    (edges << 8) + u16::from(divider)
}

#[derive(Debug)]
struct SpiState {
    status: TransferStatus,
    divider: u8,
    /// `None` sends dummy frames.
    tx: Option<TxCursor>,
    /// `None` discards received frames.
    rx: Option<RxSlot>,
    tx_remaining: usize,
    rx_remaining: usize,
    dma_active: bool,
    events: EventQueue,
    filled: FilledBuffers,
}

/// SPI master or slave.
pub struct SpiDriver<'d, H, O, L = NoOpLogger, D = NoDma>
where
    H: EioHardware,
    O: Osif,
    L: Logger,
    D: DmaService,
{
    device: &'d EioDevice<H, O, L>,
    dma: Option<&'d D>,
    common: CommonDriverState,
    config: SpiConfig,
    semaphore: O::Semaphore,
    state: critical_section::Mutex<RefCell<SpiState>>,
}

impl<'d, H, O, L> SpiDriver<'d, H, O, L, NoDma>
where
    H: EioHardware,
    O: Osif,
    L: Logger,
{
    /// # Errors
    ///
    /// See [`SpiDriver::with_dma`].
    pub fn new(device: &'d EioDevice<H, O, L>, config: SpiConfig) -> Result<Self, Error> {
        Self::init(device, config, None)
    }
}

impl<'d, H, O, L, D> SpiDriver<'d, H, O, L, D>
where
    H: EioHardware,
    O: Osif,
    L: Logger,
    D: DmaService,
{
    /// Bind an SPI driver.
    ///
    /// The transfer size is checked before anything is allocated or written.
    ///
    /// # Errors
    ///
    /// * `Error::InvalidConfig` - transfer size not 1, 2 or 4, or DMA mode
    ///   without a DMA service
    /// * `Error::NotInitialized` / `Error::NotEnoughResources` - from allocation
    pub fn with_dma(
        device: &'d EioDevice<H, O, L>,
        config: SpiConfig,
        dma: &'d D,
    ) -> Result<Self, Error> {
        Self::init(device, config, Some(dma))
    }

    fn init(
        device: &'d EioDevice<H, O, L>,
        config: SpiConfig,
        dma: Option<&'d D>,
    ) -> Result<Self, Error> {
        if !matches!(config.transfer_size, 1 | 2 | 4) {
            device.logger().error_fmt(format_args!(
                "spi: transfer size {} not supported",
                config.transfer_size
            ));
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
        let driver = Self {
            device,
            dma,
            common,
            config,
            semaphore: device.osif().semaphore_create(0),
            state: critical_section::Mutex::new(RefCell::new(SpiState {
                status: TransferStatus::new(),
                divider,
                tx: None,
                rx: None,
                tx_remaining: 0,
                rx_remaining: 0,
                dma_active: false,
                events: EventQueue::new(),
                filled: FilledBuffers::new(),
            })),
        };
        match config.role {
            SpiRole::Master => driver.configure_master(divider),
            SpiRole::Slave => driver.configure_slave(),
        }
        device.logger().debug_fmt(format_args!(
            "spi{}: {:?}, {} byte frames, divider {}",
            common.resource_index, config.role, config.transfer_size, divider
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

    /// Shifter edges for the configured clock phase: (tx, rx, tx start bit).
    fn phase_setup(&self) -> (TimerPolarity, TimerPolarity, ShifterStart) {
        match self.config.phase {
            Phase::CaptureOnFirstTransition => (
                TimerPolarity::Negedge,
                TimerPolarity::Posedge,
                ShifterStart::Disabled,
            ),
            Phase::CaptureOnSecondTransition => (
                TimerPolarity::Posedge,
                TimerPolarity::Negedge,
                ShifterStart::DisabledShift,
            ),
        }
    }

    fn clock_polarity(&self) -> PinPolarity {
        match self.config.polarity {
            Polarity::IdleLow => PinPolarity::ActiveHigh,
            Polarity::IdleHigh => PinPolarity::ActiveLow,
        }
    }

    fn configure_shifters(&self, out_pin: u8, in_pin: u8) {
        let hw = self.device.hw();
        let timer = self.common.resource_index;
        let (tx_edge, rx_edge, tx_start) = self.phase_setup();
        hw.set_shifter_config(
            self.tx_index(),
            ShifterConfig {
                start: tx_start,
                stop: ShifterStop::Disabled,
                source: ShifterSource::Pin,
            },
        );
        hw.set_shifter_control(
            self.tx_index(),
            ShifterControl {
                mode: ShifterMode::Disabled,
                pin: out_pin,
                pin_polarity: PinPolarity::ActiveHigh,
                pin_config: PinConfig::Output,
                timer,
                timer_polarity: tx_edge,
            },
        );
        hw.set_shifter_config(self.rx_index(), ShifterConfig::default());
        hw.set_shifter_control(
            self.rx_index(),
            ShifterControl {
                mode: ShifterMode::Disabled,
                pin: in_pin,
                pin_polarity: PinPolarity::ActiveHigh,
                pin_config: PinConfig::Disabled,
                timer,
                timer_polarity: rx_edge,
            },
        );
    }

    fn configure_master(&self, divider: u8) {
        let hw = self.device.hw();
        let pins = self.config.pins;
        let sck = self.common.resource_index;
        let ss = sck + 1;
        self.configure_shifters(pins.mosi, pins.miso);

        let (start, stop) = match self.config.phase {
            Phase::CaptureOnFirstTransition => (TimerStart::Disabled, TimerStop::Disabled),
            Phase::CaptureOnSecondTransition => (TimerStart::Enabled, TimerStop::OnCompare),
        };
        hw.set_timer_compare(sck, master_compare(self.config.transfer_size, divider));
        hw.set_timer_config(
            sck,
            TimerConfig {
                start,
                stop,
                enable: TimerEnable::TriggerHigh,
                disable: TimerDisable::OnCompare,
                reset: TimerReset::Never,
                decrement: TimerDecrement::ClockShiftTimer,
                output: TimerOutput::ZeroOnEnable,
            },
        );
        hw.set_timer_control(
            sck,
            TimerControl {
                mode: TimerMode::Disabled,
                pin: pins.sck,
                pin_polarity: self.clock_polarity(),
                pin_config: PinConfig::Output,
                trigger: shifter_trigger(self.tx_index()),
                trigger_polarity: TriggerPolarity::ActiveLow,
                trigger_source: TriggerSource::Internal,
            },
        );

        // SS follows the SCK timer: asserted while it runs
        hw.set_timer_compare(ss, 0xFFFF);
        hw.set_timer_config(
            ss,
            TimerConfig {
                start: TimerStart::Disabled,
                stop: TimerStop::Disabled,
                enable: TimerEnable::OnPreviousEnable,
                disable: TimerDisable::OnPreviousDisable,
                reset: TimerReset::Never,
                decrement: TimerDecrement::ClockShiftTimer,
                output: TimerOutput::OneOnEnable,
            },
        );
        hw.set_timer_control(
            ss,
            TimerControl {
                mode: TimerMode::Disabled,
                pin: pins.ss,
                pin_polarity: PinPolarity::ActiveLow,
                pin_config: PinConfig::Output,
                trigger: 0,
                trigger_polarity: TriggerPolarity::ActiveHigh,
                trigger_source: TriggerSource::External,
            },
        );
    }

    fn configure_slave(&self) {
        let hw = self.device.hw();
        let pins = self.config.pins;
        let sck = self.common.resource_index;
        self.configure_shifters(pins.miso, pins.mosi);

        let (enable, output) = match self.config.phase {
            Phase::CaptureOnFirstTransition => {
                (TimerEnable::TriggerRising, TimerOutput::ZeroOnEnable)
            }
            Phase::CaptureOnSecondTransition => {
                (TimerEnable::TriggerBothEdges, TimerOutput::OneOnEnable)
            }
        };
        let edges = u16::from(self.config.transfer_size) * 16 - 1;
        hw.set_timer_compare(sck, edges);
        hw.set_timer_config(
            sck,
            TimerConfig {
                start: TimerStart::Disabled,
                stop: TimerStop::Disabled,
                enable,
                disable: TimerDisable::TriggerFalling,
                reset: TimerReset::Never,
                decrement: TimerDecrement::PinShiftPin,
                output,
            },
        );
        hw.set_timer_control(
            sck,
            TimerControl {
                mode: TimerMode::Disabled,
                pin: pins.sck,
                pin_polarity: self.clock_polarity(),
                pin_config: PinConfig::Disabled,
                trigger: pin_trigger(pins.ss),
                trigger_polarity: TriggerPolarity::ActiveLow,
                trigger_source: TriggerSource::Internal,
            },
        );
    }

    pub fn common(&self) -> CommonDriverState {
        self.common
    }

    pub fn config(&self) -> &SpiConfig {
        &self.config
    }

    /// Change the SCK frequency between transfers. Master only.
    ///
    /// # Errors
    ///
    /// * `Error::Unsupported` - slave role
    /// * `Error::Busy` - a transfer is in flight
    pub fn set_baud_rate(&self, baud_rate: HertzU32) -> Result<(), Error> {
        if self.config.role != SpiRole::Master {
            return Err(Error::Unsupported);
        }
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
            self.device.hw().set_timer_compare(
                self.common.resource_index,
                master_compare(self.config.transfer_size, divider),
            );
            Ok(())
        })
    }

    /// SCK frequency the current divider produces.
    pub fn baud_rate(&self) -> HertzU32 {
        let divider = critical_section::with(|cs| self.state.borrow_ref(cs).divider);
        HertzU32::from_raw(divider_baud(
            self.device.input_clock().raw(),
            divider,
            DIVIDER_BIAS,
        ))
    }

    /// Start a full-duplex transfer and return immediately.
    ///
    /// Either side may be `None`: without `tx` all-ones frames are sent,
    /// without `rx` received frames are dropped. When both are given they
    /// must have the same length. The receive buffer comes back through
    /// [`SpiDriver::take_rx_buffer`].
    ///
    /// # Errors
    ///
    /// * `Error::Busy` - a transfer is already in flight
    /// * `Error::InvalidConfig` - no buffer, mismatched lengths, or a length
    ///   that is not a whole number of frames
    /// * `Error::Unsupported` - buffer outside DMA-capable memory
    pub fn transfer(
        &self,
        tx: Option<&'static [u8]>,
        rx: Option<&'static mut [u8]>,
    ) -> Result<(), Error> {
        self.start(tx.map(TxCursor::new), rx.map(RxSlot::leased), false)
    }

    /// Run a transfer to completion, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// As [`SpiDriver::transfer`], plus `Error::Timeout`.
    pub fn transfer_blocking(
        &self,
        tx: Option<&[u8]>,
        rx: Option<&mut [u8]>,
        timeout: MillisDurationU32,
    ) -> Result<(), Error> {
        self.semaphore.drain();
        self.start(
            tx.map(TxCursor::new),
            rx.map(|buffer| RxSlot::borrowed(RxCursor::new(buffer))),
            true,
        )?;
        wait_blocking(self, timeout)
    }

    /// Send `words` and overwrite them with what comes back.
    ///
    /// # Errors
    ///
    /// As [`SpiDriver::transfer_blocking`].
    pub fn transfer_in_place_blocking(
        &self,
        words: &mut [u8],
        timeout: MillisDurationU32,
    ) -> Result<(), Error> {
        self.semaphore.drain();
        let rx = RxCursor::new(words);
        let tx = rx.reader();
        self.start(Some(tx), Some(RxSlot::borrowed(rx)), true)?;
        wait_blocking(self, timeout)
    }

    fn check_buffers(&self, tx: Option<&TxCursor>, rx: Option<&RxSlot>) -> Result<usize, Error> {
        let len = match (tx.map(TxCursor::remaining), rx.map(|slot| slot.cursor.remaining())) {
            (Some(t), Some(r)) if t == r => t,
            (Some(_), Some(_)) | (None, None) => return Err(Error::InvalidConfig),
            (Some(len), None) | (None, Some(len)) => len,
        };
        if len == 0 || len % usize::from(self.config.transfer_size) != 0 {
            return Err(Error::InvalidConfig);
        }
        if self.config.driver_type == DriverType::Dma {
            let reachable = |address: usize| {
                self.dma
                    .is_some_and(|dma| dma.is_dma_capable(address, len))
            };
            let tx_ok = tx.map_or(true, |t| reachable(t.address()));
            let rx_ok = rx.map_or(true, |r| reachable(r.cursor.address()));
            if !(tx_ok && rx_ok) {
                return Err(Error::Unsupported);
            }
        }
        Ok(len)
    }

    fn start(&self, tx: Option<TxCursor>, rx: Option<RxSlot>, blocking: bool) -> Result<(), Error> {
        let hw = self.device.hw();
        let tx_bit = bit(self.tx_index());
        let rx_bit = bit(self.rx_index());
        critical_section::with(|cs| {
            let mut st = self.state.borrow_ref_mut(cs);
            if !st.status.idle {
                return Err(Error::Busy);
            }
            let len = self.check_buffers(tx.as_ref(), rx.as_ref())?;
            if self.config.driver_type == DriverType::Dma {
                self.start_dma(tx.as_ref(), rx.as_ref(), len)?;
                st.dma_active = true;
            }
            st.status.begin(blocking)?;
            st.tx = tx;
            st.rx = rx;
            st.tx_remaining = len;
            st.rx_remaining = len;

            hw.clear_shifter_error(tx_bit | rx_bit);
            hw.set_shifter_mode(self.tx_index(), ShifterMode::Transmit);
            hw.set_shifter_mode(self.rx_index(), ShifterMode::Receive);
            match self.config.role {
                SpiRole::Master => {
                    hw.set_timer_mode(self.common.resource_index, TimerMode::Baud8Bit);
                    hw.set_timer_mode(self.common.resource_index + 1, TimerMode::Counter16Bit);
                }
                SpiRole::Slave => {
                    hw.set_timer_mode(self.common.resource_index, TimerMode::Counter16Bit);
                }
            }
            match self.config.driver_type {
                DriverType::Interrupts => {
                    hw.set_shifter_interrupts(tx_bit | rx_bit, true);
                    hw.set_shifter_error_interrupts(tx_bit | rx_bit, true);
                }
                DriverType::Dma => {
                    hw.set_shifter_error_interrupts(tx_bit | rx_bit, true);
                    hw.set_shifter_dma_requests(tx_bit | rx_bit, true);
                }
                DriverType::Polling => {}
            }
            self.device.logger().debug_fmt(format_args!(
                "spi{}: transfer {len} bytes{}",
                self.common.resource_index,
                if blocking { " (blocking)" } else { "" }
            ));
            Ok(())
        })
    }

    fn start_dma(
        &self,
        tx: Option<&TxCursor>,
        rx: Option<&RxSlot>,
        len: usize,
    ) -> Result<(), Error> {
        let dma = self.dma.ok_or(Error::InvalidConfig)?;
        let hw = self.device.hw();
        let size = self.config.transfer_size;
        let lane = usize::from(4 - size);
        let width = DmaWidth::from_bytes(size).ok_or(Error::InvalidConfig)?;
        let count = u32::try_from(len / usize::from(size)).map_err(|_| Error::InvalidConfig)?;
        let (tx_register, rx_register) = match self.config.bit_order {
            BitOrder::LsbFirst => (
                hw.buffer_address(self.tx_index(), BufferMode::Normal),
                hw.buffer_address(self.rx_index(), BufferMode::Normal) + lane,
            ),
            BitOrder::MsbFirst => (
                hw.buffer_address(self.tx_index(), BufferMode::BitSwap) + lane,
                hw.buffer_address(self.rx_index(), BufferMode::BitSwap),
            ),
        };

        let receive = DmaTransfer {
            direction: DmaDirection::PeripheralToMemory,
            source: rx_register,
            destination: rx.map_or_else(fill::sink, |slot| slot.cursor.address()),
            width,
            count,
            source_increment: false,
            destination_increment: rx.is_some(),
            request: self.device.dma_request(self.rx_index()),
        };
        let send = DmaTransfer {
            direction: DmaDirection::MemoryToPeripheral,
            source: tx.map_or_else(fill::ones, TxCursor::address),
            destination: tx_register,
            width,
            count,
            source_increment: tx.is_some(),
            destination_increment: false,
            request: self.device.dma_request(self.tx_index()),
        };
        let setup = dma
            .configure(self.config.rx_dma_channel, &receive)
            .and_then(|()| dma.configure(self.config.tx_dma_channel, &send));
        if let Err(e) = setup {
            self.device.logger().error_fmt(format_args!(
                "spi{}: dma setup failed: {e:?}",
                self.common.resource_index
            ));
            return Err(Error::Dma);
        }
        dma.start(self.config.rx_dma_channel);
        dma.start(self.config.tx_dma_channel);
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

    /// Bytes not exchanged yet.
    pub fn remaining(&self) -> usize {
        critical_section::with(|cs| {
            let st = self.state.borrow_ref(cs);
            match self.dma.filter(|_| st.dma_active) {
                Some(dma) => {
                    dma.remaining(self.config.rx_dma_channel) as usize
                        * usize::from(self.config.transfer_size)
                }
                None => st.rx_remaining.max(st.tx_remaining),
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

    /// Forward a notification of either DMA channel. The receive channel
    /// finishing ends the transfer.
    pub fn on_dma_event(&self, channel: u8, event: DmaEvent) {
        let rx_channel = self.config.rx_dma_channel;
        if channel != rx_channel && channel != self.config.tx_dma_channel {
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
                        "spi{}: dma channel {channel} error",
                        self.common.resource_index
                    ));
                    st.status.record(Error::Dma);
                    self.stop(&mut st);
                }
                DmaEvent::Complete if channel == rx_channel => {
                    st.dma_active = false;
                    st.tx_remaining = 0;
                    st.rx_remaining = 0;
                    self.stop(&mut st);
                }
                DmaEvent::Complete => {
                    let hw = self.device.hw();
                    let tx_bit = bit(self.tx_index());
                    hw.set_shifter_dma_requests(tx_bit, false);
                    hw.set_shifter_error_interrupts(tx_bit, false);
                    st.tx_remaining = 0;
                    push_event(&mut st.events, DriverEvent::TxEmpty);
                }
            }
        });
    }

    fn write_frame(&self, value: u32) {
        let hw = self.device.hw();
        match self.config.bit_order {
            BitOrder::LsbFirst => hw.write_buffer(self.tx_index(), BufferMode::Normal, value),
            BitOrder::MsbFirst => hw.write_buffer(
                self.tx_index(),
                BufferMode::BitSwap,
                value << (32 - frame_bits(self.config.transfer_size)),
            ),
        }
    }

    fn read_frame(&self) -> u32 {
        let hw = self.device.hw();
        let bits = frame_bits(self.config.transfer_size);
        match self.config.bit_order {
            BitOrder::LsbFirst => {
                hw.read_buffer(self.rx_index(), BufferMode::Normal) >> (32 - bits)
            }
            BitOrder::MsbFirst => {
                let mask = u32::MAX >> (32 - bits);
                hw.read_buffer(self.rx_index(), BufferMode::BitSwap) & mask
            }
        }
    }

    fn check_status(&self, st: &mut SpiState) {
        let hw = self.device.hw();
        let status = hw.shifter_status();
        let errors = hw.shifter_error();
        let tx_bit = bit(self.tx_index());
        let rx_bit = bit(self.rx_index());
        let size = self.config.transfer_size;

        if errors & tx_bit != 0 {
            // the last frame still shifting out leaves the buffer empty
            if st.tx_remaining > 0 {
                st.status.record(Error::TxUnderrun);
            }
            hw.clear_shifter_error(tx_bit);
        }
        if errors & rx_bit != 0 {
            st.status.record(Error::RxOverrun);
            hw.clear_shifter_error(rx_bit);
        }
        if st.dma_active {
            return;
        }

        if status & rx_bit != 0 && st.rx_remaining > 0 {
            let value = self.read_frame();
            if let Some(rx) = st.rx.as_mut() {
                rx.cursor.push(size, value);
            }
            st.rx_remaining = st.rx_remaining.saturating_sub(usize::from(size));
        }
        if status & tx_bit != 0 && st.tx_remaining > 0 {
            let value = st.tx.as_mut().map_or(Some(DUMMY), |tx| tx.next(size));
            self.write_frame(value.unwrap_or(DUMMY));
            st.tx_remaining = st.tx_remaining.saturating_sub(usize::from(size));
            if st.tx_remaining == 0 && self.config.driver_type == DriverType::Interrupts {
                hw.set_shifter_interrupts(tx_bit, false);
                hw.set_shifter_error_interrupts(tx_bit, false);
            }
        }
        if st.tx_remaining == 0 && st.rx_remaining == 0 {
            self.stop(st);
        }
    }

    fn disable_resources(&self) {
        let hw = self.device.hw();
        hw.set_shifter_mode(self.tx_index(), ShifterMode::Disabled);
        hw.set_shifter_mode(self.rx_index(), ShifterMode::Disabled);
        hw.set_timer_mode(self.common.resource_index, TimerMode::Disabled);
        hw.set_timer_mode(self.common.resource_index + 1, TimerMode::Disabled);
    }

    fn stop(&self, st: &mut SpiState) {
        let hw = self.device.hw();
        let mask = self.common.resource_mask();
        self.disable_resources();
        hw.clear_shifter_error(mask);
        hw.clear_shifter_status(bit(self.rx_index()));
        hw.clear_timer_status(mask);

        if st.dma_active {
            if let Some(dma) = self.dma {
                dma.stop(self.config.tx_dma_channel);
                dma.stop(self.config.rx_dma_channel);
                let frames = dma.remaining(self.config.rx_dma_channel) as usize;
                st.rx_remaining = frames * usize::from(self.config.transfer_size);
            }
            st.dma_active = false;
        }
        self.end_transfer(st);
    }

    fn end_transfer(&self, st: &mut SpiState) {
        let hw = self.device.hw();
        let mask = self.common.resource_mask();
        match self.config.driver_type {
            DriverType::Interrupts => {
                hw.set_shifter_interrupts(mask, false);
                hw.set_shifter_error_interrupts(mask, false);
            }
            DriverType::Dma => {
                hw.set_shifter_dma_requests(mask, false);
                hw.set_shifter_error_interrupts(mask, false);
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
        if let Some(e) = st.status.error {
            self.device.logger().error_fmt(format_args!(
                "spi{}: transfer ended: {e}",
                self.common.resource_index
            ));
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

impl<H, O, L, D> EioIsr for SpiDriver<'_, H, O, L, D>
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

impl<H, O, L, D> BlockingTransfer for SpiDriver<'_, H, O, L, D>
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
        SpiDriver::step(self);
    }

    fn is_busy(&self) -> bool {
        SpiDriver::is_busy(self)
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

impl<H, O, L, D> embedded_hal::spi::ErrorType for SpiDriver<'_, H, O, L, D>
where
    H: EioHardware,
    O: Osif,
    L: Logger,
    D: DmaService,
{
    type Error = Error;
}

impl<H, O, L, D> embedded_hal::spi::SpiBus<u8> for SpiDriver<'_, H, O, L, D>
where
    H: EioHardware,
    O: Osif,
    L: Logger,
    D: DmaService,
{
    fn read(&mut self, words: &mut [u8]) -> Result<(), Error> {
        if words.is_empty() {
            return Ok(());
        }
        self.transfer_blocking(None, Some(words), self.config.timeout)
    }

    fn write(&mut self, words: &[u8]) -> Result<(), Error> {
        if words.is_empty() {
            return Ok(());
        }
        self.transfer_blocking(Some(words), None, self.config.timeout)
    }

    fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Error> {
        let common = read.len().min(write.len());
        let (read_head, read_tail) = read.split_at_mut(common);
        let (write_head, write_tail) = write.split_at(common);
        if common > 0 {
            self.transfer_blocking(Some(write_head), Some(read_head), self.config.timeout)?;
        }
        if !read_tail.is_empty() {
            self.transfer_blocking(None, Some(read_tail), self.config.timeout)?;
        }
        if !write_tail.is_empty() {
            self.transfer_blocking(Some(write_tail), None, self.config.timeout)?;
        }
        Ok(())
    }

    fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Error> {
        if words.is_empty() {
            return Ok(());
        }
        self.transfer_in_place_blocking(words, self.config.timeout)
    }

    fn flush(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eio::sim::{sim_device, with_irq_thread, MockDma, SimModel, SimRegs, SIM_BASE};
    use embedded_hal::spi::{SpiBus, MODE_0, MODE_3};

    /// MOSI wired to MISO: each tick moves the pending frame into the
    /// receive shifter, formatted the way the receive alias presents it.
    struct Wire {
        tx: u8,
        size: u8,
        pending: Option<(BufferMode, u32)>,
    }

    impl Wire {
        fn new(tx: u8, size: u8) -> Self {
            Self { tx, size, pending: None }
        }
    }

    impl SimModel for Wire {
        fn on_write(&mut self, _regs: &mut SimRegs, index: u8, mode: BufferMode, value: u32) {
            if index == self.tx {
                self.pending = Some((mode, value));
            }
        }

        fn tick(&mut self, regs: &mut SimRegs) {
            let tx = usize::from(self.tx);
            let rx = tx + 1;
            if regs.shifter_ctl[tx].mode != ShifterMode::Transmit {
                return;
            }
            let shift = 32 - 8 * u32::from(self.size);
            if regs.shifter_status & bit(self.tx + 1) == 0 {
                if let Some((mode, value)) = self.pending.take() {
                    regs.buffers[rx] = match mode {
                        BufferMode::BitSwap => value >> shift,
                        _ => value << shift,
                    };
                    regs.shifter_status |= bit(self.tx + 1);
                }
            }
            if self.pending.is_none() {
                regs.shifter_status |= bit(self.tx);
            }
        }
    }

    fn polled(size: u8, order: BitOrder) -> SpiConfig {
        SpiConfigBuilder::new()
            .transfer_size(size)
            .bit_order(order)
            .driver_type(DriverType::Polling)
            .build()
    }

    fn timeout() -> MillisDurationU32 {
        MillisDurationU32::millis(100)
    }

    #[test]
    fn transfer_size_is_checked_before_touching_hardware() {
        let device = sim_device(4);
        for size in [0, 3, 8] {
            let cfg = SpiConfigBuilder::new().transfer_size(size).build();
            assert_eq!(SpiDriver::new(&device, cfg).err(), Some(Error::InvalidConfig));
        }
        assert_eq!(device.allocated(), 0);
        device.hw().regs(|r| {
            assert!(r.timer_cmp.iter().all(|&c| c == 0));
            assert!(r.shifter_ctl.iter().all(|c| *c == ShifterControl::default()));
        });
    }

    #[test]
    fn master_mode_3_programs_phase_and_polarity() {
        let device = sim_device(4);
        let cfg = SpiConfigBuilder::new().mode(MODE_3).baud_rate(2.MHz()).build();
        let spi = SpiDriver::new(&device, cfg).unwrap();
        device.hw().regs(|r| {
            assert_eq!(r.shifter_cfg[0].start, ShifterStart::DisabledShift);
            assert_eq!(r.shifter_ctl[0].timer_polarity, TimerPolarity::Posedge);
            assert_eq!(r.shifter_ctl[1].timer_polarity, TimerPolarity::Negedge);
            assert_eq!(r.timer_cfg[0].stop, TimerStop::OnCompare);
            assert_eq!(r.timer_ctl[0].pin_polarity, PinPolarity::ActiveLow);
            // 48 MHz / 4 MHz = 12, minus one
            assert_eq!(r.timer_cmp[0], (15 << 8) + 11);
            assert_eq!(r.timer_cmp[1], 0xFFFF);
            assert_eq!(r.timer_cfg[1].enable, TimerEnable::OnPreviousEnable);
        });
        assert_eq!(spi.baud_rate().raw(), 2_000_000);
        spi.set_baud_rate(100.MHz()).unwrap();
        // far too fast clamps to the minimum divider
        assert_eq!(device.hw().regs(|r| r.timer_cmp[0]), (15 << 8) + 1);
    }

    #[test]
    fn slave_counts_pin_edges_under_chip_select() {
        let device = sim_device(4);
        let cfg = SpiConfigBuilder::new()
            .role(SpiRole::Slave)
            .mode(MODE_0)
            .transfer_size(2)
            .build();
        let spi = SpiDriver::new(&device, cfg).unwrap();
        device.hw().regs(|r| {
            assert_eq!(r.timer_cmp[0], 31);
            assert_eq!(r.timer_ctl[0].trigger, pin_trigger(3));
            assert_eq!(r.timer_cfg[0].decrement, TimerDecrement::PinShiftPin);
            assert_eq!(r.shifter_ctl[0].pin, 1);
            assert_eq!(r.shifter_ctl[1].pin, 0);
        });
        assert_eq!(spi.set_baud_rate(1.MHz()), Err(Error::Unsupported));
    }

    #[test]
    fn msb_first_loopback_uses_bit_swapped_lane() {
        let device = sim_device(4);
        let spi = SpiDriver::new(&device, polled(2, BitOrder::MsbFirst)).unwrap();
        device.hw().set_model(Wire::new(0, 2));

        let out: [u8; 4] = [0x34, 0x12, 0x78, 0x56];
        let mut back = [0u8; 4];
        spi.transfer_blocking(Some(&out), Some(&mut back), timeout()).unwrap();
        assert_eq!(back, out);
        assert_eq!(spi.remaining(), 0);
        device.hw().regs(|r| {
            assert_eq!(r.writes[0], (0, BufferMode::BitSwap, 0x1234_0000));
            assert_eq!(r.writes[1], (0, BufferMode::BitSwap, 0x5678_0000));
            assert_eq!(r.shifter_ctl[0].mode, ShifterMode::Disabled);
        });
    }

    #[test]
    fn receive_only_clocks_out_dummy_frames() {
        let device = sim_device(4);
        let spi = SpiDriver::new(&device, polled(1, BitOrder::LsbFirst)).unwrap();
        device.hw().set_model(Wire::new(0, 1));

        let mut back = [0u8; 3];
        spi.transfer_blocking(None, Some(&mut back), timeout()).unwrap();
        assert_eq!(back, [0xFF; 3]);
        device.hw().regs(|r| assert!(r.written(0).iter().all(|&v| v == DUMMY)));
    }

    #[test]
    fn buffer_shape_is_validated() {
        let device = sim_device(4);
        let spi = SpiDriver::new(&device, polled(2, BitOrder::MsbFirst)).unwrap();
        let mut rx = [0u8; 2];
        let mismatched = spi.transfer_blocking(Some(&[1, 2, 3, 4]), Some(&mut rx), timeout());
        assert_eq!(mismatched, Err(Error::InvalidConfig));
        let odd = spi.transfer_blocking(Some(&[1, 2, 3]), None, timeout());
        assert_eq!(odd, Err(Error::InvalidConfig));
        assert_eq!(spi.transfer_blocking(None, None, timeout()), Err(Error::InvalidConfig));
        assert!(!spi.is_busy());
    }

    #[test]
    fn spi_bus_transfer_handles_uneven_lengths_and_in_place() {
        let device = sim_device(4);
        let mut spi = SpiDriver::new(&device, polled(1, BitOrder::MsbFirst)).unwrap();
        device.hw().set_model(Wire::new(0, 1));

        let mut read = [0u8; 4];
        SpiBus::transfer(&mut spi, &mut read, &[1, 2]).unwrap();
        assert_eq!(read, [1, 2, 0xFF, 0xFF]);

        let mut words = [9, 8, 7];
        SpiBus::transfer_in_place(&mut spi, &mut words).unwrap();
        assert_eq!(words, [9, 8, 7]);
        SpiBus::flush(&mut spi).unwrap();
    }

    #[test]
    fn interrupt_mode_transfer_is_serviced_by_irq() {
        let device = sim_device(4);
        let cfg = SpiConfigBuilder::new().transfer_size(4).bit_order(BitOrder::LsbFirst).build();
        let spi = SpiDriver::new(&device, cfg).unwrap();
        device.hw().set_model(Wire::new(0, 4));

        let out: [u8; 8] = [1, 2, 3, 4, 5, 6, 7, 8];
        let mut back = [0u8; 8];
        let result = with_irq_thread(&device, &[&spi], || {
            spi.transfer_blocking(Some(&out), Some(&mut back), MillisDurationU32::millis(500))
        });
        assert_eq!(result, Ok(()));
        assert_eq!(back, out);
        device.hw().regs(|r| {
            assert_eq!(r.sien, 0);
            assert_eq!(r.eien, 0);
        });
    }

    #[test]
    fn overrun_is_recorded_but_transfer_finishes() {
        let device = sim_device(4);
        let spi = SpiDriver::new(&device, polled(1, BitOrder::MsbFirst)).unwrap();
        device.hw().set_model(Wire::new(0, 1));
        let rx: &'static mut [u8] = Box::leak(vec![0u8; 2].into_boxed_slice());
        spi.transfer(Some(&[5, 6]), Some(rx)).unwrap();
        device.hw().regs(|r| r.shifter_error = 0b10);

        let mut outcome = Err(nb::Error::WouldBlock);
        for _ in 0..100 {
            outcome = spi.poll();
            if outcome != Err(nb::Error::WouldBlock) {
                break;
            }
        }
        assert_eq!(outcome, Err(nb::Error::Other(Error::RxOverrun)));
        assert_eq!(spi.take_rx_buffer().unwrap(), [5, 6]);
        assert_eq!(device.hw().regs(|r| r.shifter_error), 0);
    }

    #[test]
    fn dma_descriptors_follow_bit_order_lanes() {
        let device = sim_device(4);
        let dma = MockDma::default();
        let cfg = SpiConfigBuilder::new()
            .driver_type(DriverType::Dma)
            .dma_channels(4, 5)
            .build();
        let spi = SpiDriver::with_dma(&device, cfg, &dma).unwrap();
        let rx: &'static mut [u8] = Box::leak(vec![0u8; 6].into_boxed_slice());
        let rx_address = rx.as_ptr() as usize;
        spi.transfer(None, Some(rx)).unwrap();

        let (send, receive) = dma.with(|s| (s.configured[&4], s.configured[&5]));
        assert_eq!(send.source, fill::ones());
        assert!(!send.source_increment);
        assert_eq!(send.destination, SIM_BASE + 0x280 + 3);
        assert_eq!(receive.source, SIM_BASE + 0x280 + 4);
        assert_eq!(receive.destination, rx_address);
        assert_eq!(receive.count, 6);
        assert_eq!(device.hw().regs(|r| r.dma), 0b11);

        dma.drain(4);
        spi.on_dma_event(4, DmaEvent::Complete);
        assert!(spi.is_busy());
        dma.drain(5);
        spi.on_dma_event(5, DmaEvent::Complete);
        assert_eq!(spi.status(), Ok(()));
        assert_eq!(spi.remaining(), 0);
        assert_eq!(spi.take_rx_buffer().map(|b| b.len()), Some(6));
        assert_eq!(device.hw().regs(|r| r.dma), 0);
    }

    #[test]
    fn dma_shifter_errors_are_reported_at_the_end() {
        let device = sim_device(4);
        let dma = MockDma::default();
        let cfg = SpiConfigBuilder::new()
            .driver_type(DriverType::Dma)
            .dma_channels(4, 5)
            .build();
        let spi = SpiDriver::with_dma(&device, cfg, &dma).unwrap();
        let rx: &'static mut [u8] = Box::leak(vec![0u8; 4].into_boxed_slice());
        spi.transfer(Some(&[1, 2, 3, 4]), Some(rx)).unwrap();
        device.hw().regs(|r| assert_eq!((r.dma, r.eien), (0b11, 0b11)));

        // received frame not collected in time
        device.hw().regs(|r| r.shifter_error |= 0b10);
        device.irq_handler(&[&spi]);
        assert_eq!(device.hw().regs(|r| r.shifter_error), 0);
        assert_eq!(spi.status(), Err(nb::Error::WouldBlock));

        // transmitter done: it running dry afterwards is not an underrun
        dma.drain(4);
        spi.on_dma_event(4, DmaEvent::Complete);
        device.hw().regs(|r| assert_eq!((r.dma, r.eien), (0b10, 0b10)));
        device.hw().regs(|r| r.shifter_error |= 0b11);
        device.irq_handler(&[&spi]);

        dma.drain(5);
        spi.on_dma_event(5, DmaEvent::Complete);
        assert_eq!(spi.status(), Err(nb::Error::Other(Error::RxOverrun)));
        assert_eq!(spi.take_rx_buffer().map(|b| b.len()), Some(4));
        device.hw().regs(|r| assert_eq!(r.dma | r.eien, 0));

        // the next transfer reprograms both channels and starts clean
        spi.transfer(Some(&[9, 9]), None).unwrap();
        let (send, receive) = dma.with(|s| (s.configured[&4], s.configured[&5]));
        assert_eq!((send.count, receive.count), (2, 2));
        assert_eq!(receive.destination, fill::sink());
        device.hw().regs(|r| r.shifter_error |= 0b01);
        device.irq_handler(&[&spi]);
        dma.drain(4);
        spi.on_dma_event(4, DmaEvent::Complete);
        dma.drain(5);
        spi.on_dma_event(5, DmaEvent::Complete);
        assert_eq!(spi.status(), Err(nb::Error::Other(Error::TxUnderrun)));
    }

    #[test]
    fn dma_error_stops_both_channels() {
        let device = sim_device(4);
        let dma = MockDma::default();
        let cfg = SpiConfigBuilder::new()
            .driver_type(DriverType::Dma)
            .bit_order(BitOrder::LsbFirst)
            .transfer_size(2)
            .dma_channels(0, 1)
            .build();
        let spi = SpiDriver::with_dma(&device, cfg, &dma).unwrap();
        spi.transfer(Some(&[1, 2, 3, 4]), None).unwrap();
        let (send, receive) = dma.with(|s| (s.configured[&0], s.configured[&1]));
        assert_eq!(send.destination, SIM_BASE + 0x200);
        assert_eq!(receive.source, SIM_BASE + 0x200 + 4 + 2);
        assert_eq!(receive.destination, fill::sink());
        assert_eq!(send.width, DmaWidth::HalfWord);

        spi.on_dma_event(0, DmaEvent::Error);
        assert_eq!(spi.status(), Err(nb::Error::Other(Error::Dma)));
        assert_eq!(spi.remaining(), 4);
        dma.with(|s| {
            assert!(s.stops.contains(&0));
            assert!(s.stops.contains(&1));
        });
    }
}
