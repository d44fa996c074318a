// Licensed under the Apache-2.0 license

//! I2S emulation on two shifters and two timers.
//!
//! Shifter `n` transmits on the TX data pin and shifter `n + 1` samples the
//! RX data pin, both clocked by timer `n` (SCK). Timer `n + 1` produces the
//! word select line as master, or follows it as slave.
//!
//! The shifters run in lockstep, so every transmitted word is matched by a
//! received one. Sends are complete once as many words came back as went out;
//! receives keep the transmitter fed with zero words to keep the clocks going.

use core::cell::RefCell;

use fugit::{HertzU32, MillisDurationU32, RateExtU32};

use super::common::{
    baud_divider, divider_baud, push_event, CommonDriverState, DriverEvent, DriverType, EioIsr,
    Error, EventQueue, RxCursor, TxCursor,
};
use super::device::EioDevice;
use super::hw::{
    bit, pin_trigger, shifter_trigger, timer_trigger, BufferMode, EioHardware, PinConfig,
    PinPolarity, ShifterConfig, ShifterControl, ShifterMode, ShifterSource, ShifterStart,
    ShifterStop, TimerConfig, TimerControl, TimerDecrement, TimerDisable, TimerEnable, TimerMode,
    TimerOutput, TimerPolarity, TimerReset, TimerStart, TimerStop, TriggerPolarity, TriggerSource,
};
use super::transfer::{
    fill, retire, wait_blocking, BlockingTransfer, FilledBuffers, RxSlot, TransferStatus,
};
use crate::common::{Logger, NoOpLogger};
use crate::dma::{DmaDirection, DmaEvent, DmaService, DmaTransfer, DmaWidth, NoDma};
use crate::osif::{Osif, Semaphore};

const DIVIDER_BIAS: u8 = 1;
const DIVIDER_MIN: u8 = 1;
const MAX_BITS: u8 = 32;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum I2sRole {
    /// Drives SCK and WS.
    Master,
    /// Clocked by an external master on the SCK and WS pins.
    Slave,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct I2sPins {
    pub tx: u8,
    pub rx: u8,
    pub sck: u8,
    pub ws: u8,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct I2sConfig {
    pub role: I2sRole,
    /// Bit clock. Ignored by a slave.
    pub baud_rate: HertzU32,
    /// Bits per word, 1..=32. DMA mode accepts 8, 16 or 32 only.
    pub bits: u8,
    pub pins: I2sPins,
    pub driver_type: DriverType,
    pub tx_dma_channel: u8,
    pub rx_dma_channel: u8,
}

pub struct I2sConfigBuilder {
    config: I2sConfig,
}

impl Default for I2sConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl I2sConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: I2sConfig {
                role: I2sRole::Master,
                baud_rate: 1_536.kHz(),
                bits: 16,
                pins: I2sPins {
                    tx: 0,
                    rx: 1,
                    sck: 2,
                    ws: 3,
                },
                driver_type: DriverType::Interrupts,
                tx_dma_channel: 0,
                rx_dma_channel: 1,
            },
        }
    }
    #[must_use]
    pub fn role(mut self, role: I2sRole) -> Self {
        self.config.role = role;
        self
    }
    #[must_use]
    pub fn baud_rate(mut self, baud_rate: HertzU32) -> Self {
        self.config.baud_rate = baud_rate;
        self
    }
    #[must_use]
    pub fn bits(mut self, bits: u8) -> Self {
        self.config.bits = bits;
        self
    }
    #[must_use]
    pub fn pins(mut self, pins: I2sPins) -> Self {
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
    pub fn build(self) -> I2sConfig {
        self.config
    }
}

/// Bytes one word occupies in a caller buffer.
fn word_bytes(bits: u8) -> u8 {
    match bits {
        0..=8 => 1,
        9..=16 => 2,
        _ => 4,
    }
}

fn word_mask(bits: u8) -> u32 {
    u32::MAX >> (32 - u32::from(bits))
}

fn check_bits(bits: u8, driver_type: DriverType) -> Result<(), Error> {
    if bits == 0 || bits > MAX_BITS {
        return Err(Error::InvalidConfig);
    }
    if driver_type == DriverType::Dma && !matches!(bits, 8 | 16 | 32) {
        return Err(Error::InvalidConfig);
    }
    Ok(())
}

/// SCK compare in baud mode: `2 * bits` edges per word, divider in the low byte.
fn sck_compare(bits: u8, divider: u8) -> u16 {
    ((u16::from(bits) * 2 - 1) << 8) + u16::from(divider)
}

/// WS compare: module clocks in one word.
fn ws_compare(bits: u8, divider: u8) -> u16 {
    u16::from(bits) * ((u16::from(divider) + 1) * 2) - 1
}

#[derive(Debug)]
struct I2sState {
    status: TransferStatus,
    bits: u8,
    divider: u8,
    /// Send in flight; otherwise a receive.
    sending: bool,
    tx: Option<TxCursor>,
    rx: Option<RxSlot>,
    staged_tx: Option<TxCursor>,
    staged_rx: Option<RxSlot>,
    /// Bytes the transmitter still has to load, zero words included.
    tx_remaining: usize,
    /// Bytes still expected back; the transfer ends when this reaches zero.
    rx_remaining: usize,
    /// Bytes programmed into the running DMA descriptors.
    tx_chunk: usize,
    rx_chunk: usize,
    tx_dma_active: bool,
    rx_dma_active: bool,
    events: EventQueue,
    filled: FilledBuffers,
}

/// I2S master or slave, full duplex on one resource pair.
pub struct I2sDriver<'d, H, O, L = NoOpLogger, D = NoDma>
where
    H: EioHardware,
    O: Osif,
    L: Logger,
    D: DmaService,
{
    device: &'d EioDevice<H, O, L>,
    dma: Option<&'d D>,
    common: CommonDriverState,
    config: I2sConfig,
    semaphore: O::Semaphore,
    state: critical_section::Mutex<RefCell<I2sState>>,
}

impl<'d, H, O, L> I2sDriver<'d, H, O, L, NoDma>
where
    H: EioHardware,
    O: Osif,
    L: Logger,
{
    /// # Errors
    ///
    /// See [`I2sDriver::with_dma`].
    pub fn new(device: &'d EioDevice<H, O, L>, config: I2sConfig) -> Result<Self, Error> {
        Self::init(device, config, None)
    }
}

impl<'d, H, O, L, D> I2sDriver<'d, H, O, L, D>
where
    H: EioHardware,
    O: Osif,
    L: Logger,
    D: DmaService,
{
    /// Bind an I2S driver.
    ///
    /// # Errors
    ///
    /// * `Error::InvalidConfig` - word size out of range or not DMA-able,
    ///   DMA mode without a service or with one channel for both directions
    /// * `Error::NotInitialized` / `Error::NotEnoughResources` - from allocation
    pub fn with_dma(
        device: &'d EioDevice<H, O, L>,
        config: I2sConfig,
        dma: &'d D,
    ) -> Result<Self, Error> {
        Self::init(device, config, Some(dma))
    }

    fn init(
        device: &'d EioDevice<H, O, L>,
        config: I2sConfig,
        dma: Option<&'d D>,
    ) -> Result<Self, Error> {
        check_bits(config.bits, config.driver_type)?;
        if config.driver_type == DriverType::Dma
            && (dma.is_none() || config.tx_dma_channel == config.rx_dma_channel)
        {
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
            state: critical_section::Mutex::new(RefCell::new(I2sState {
                status: TransferStatus::new(),
                bits: config.bits,
                divider,
                sending: false,
                tx: None,
                rx: None,
                staged_tx: None,
                staged_rx: None,
                tx_remaining: 0,
                rx_remaining: 0,
                tx_chunk: 0,
                rx_chunk: 0,
                tx_dma_active: false,
                rx_dma_active: false,
                events: EventQueue::new(),
                filled: FilledBuffers::new(),
            })),
        };
        driver.configure_shifters();
        driver.configure_timers(config.bits, divider);
        device.logger().debug_fmt(format_args!(
            "i2s{}: {:?}, {} bits, divider {}",
            common.resource_index, config.role, config.bits, divider
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

    fn sck_timer(&self) -> u8 {
        self.common.resource_index
    }

    fn ws_timer(&self) -> u8 {
        self.common.resource_index + 1
    }

    fn configure_shifters(&self) {
        let hw = self.device.hw();
        let pins = self.config.pins;
        // master: data changes on the falling SCK edge, slave samples it on
        // the rising one
        let (tx_edge, rx_edge) = match self.config.role {
            I2sRole::Master => (TimerPolarity::Posedge, TimerPolarity::Negedge),
            I2sRole::Slave => (TimerPolarity::Negedge, TimerPolarity::Posedge),
        };
        for (index, pin, pin_config, timer_polarity) in [
            (self.tx_index(), pins.tx, PinConfig::Output, tx_edge),
            (self.rx_index(), pins.rx, PinConfig::Disabled, rx_edge),
        ] {
            hw.set_shifter_config(
                index,
                ShifterConfig {
                    start: ShifterStart::Disabled,
                    stop: ShifterStop::Disabled,
                    source: ShifterSource::Pin,
                },
            );
            hw.set_shifter_control(
                index,
                ShifterControl {
                    mode: ShifterMode::Disabled,
                    pin,
                    pin_polarity: PinPolarity::ActiveHigh,
                    pin_config,
                    timer: self.sck_timer(),
                    timer_polarity,
                },
            );
        }
    }

    fn configure_timers(&self, bits: u8, divider: u8) {
        let hw = self.device.hw();
        let pins = self.config.pins;
        match self.config.role {
            I2sRole::Master => {
                hw.set_timer_compare(self.sck_timer(), sck_compare(bits, divider));
                hw.set_timer_config(
                    self.sck_timer(),
                    TimerConfig {
                        start: TimerStart::Disabled,
                        stop: TimerStop::Disabled,
                        enable: TimerEnable::TriggerHigh,
                        disable: TimerDisable::Never,
                        reset: TimerReset::Never,
                        decrement: TimerDecrement::ClockShiftTimer,
                        output: TimerOutput::OneOnEnable,
                    },
                );
                hw.set_timer_control(
                    self.sck_timer(),
                    TimerControl {
                        mode: TimerMode::Disabled,
                        pin: pins.sck,
                        pin_polarity: PinPolarity::ActiveLow,
                        pin_config: PinConfig::Output,
                        trigger: shifter_trigger(self.tx_index()),
                        trigger_polarity: TriggerPolarity::ActiveLow,
                        trigger_source: TriggerSource::Internal,
                    },
                );
                hw.set_timer_compare(self.ws_timer(), ws_compare(bits, divider));
                hw.set_timer_config(
                    self.ws_timer(),
                    TimerConfig {
                        start: TimerStart::Disabled,
                        stop: TimerStop::Disabled,
                        enable: TimerEnable::OnPreviousEnable,
                        disable: TimerDisable::Never,
                        reset: TimerReset::Never,
                        decrement: TimerDecrement::ClockShiftTimer,
                        output: TimerOutput::OneOnEnable,
                    },
                );
                hw.set_timer_control(
                    self.ws_timer(),
                    TimerControl {
                        mode: TimerMode::Disabled,
                        pin: pins.ws,
                        pin_polarity: PinPolarity::ActiveLow,
                        pin_config: PinConfig::Output,
                        trigger: 0,
                        trigger_polarity: TriggerPolarity::ActiveHigh,
                        trigger_source: TriggerSource::External,
                    },
                );
            }
            I2sRole::Slave => {
                // SCK counts the word's edges once the WS timer has seen a frame start
                hw.set_timer_compare(self.sck_timer(), u16::from(bits) * 2 - 1);
                hw.set_timer_config(
                    self.sck_timer(),
                    TimerConfig {
                        start: TimerStart::Disabled,
                        stop: TimerStop::Disabled,
                        enable: TimerEnable::TriggerRising,
                        disable: TimerDisable::Never,
                        reset: TimerReset::Never,
                        decrement: TimerDecrement::PinShiftPin,
                        output: TimerOutput::OneOnEnable,
                    },
                );
                hw.set_timer_control(
                    self.sck_timer(),
                    TimerControl {
                        mode: TimerMode::Disabled,
                        pin: pins.sck,
                        pin_polarity: PinPolarity::ActiveHigh,
                        pin_config: PinConfig::Disabled,
                        trigger: timer_trigger(self.ws_timer()),
                        trigger_polarity: TriggerPolarity::ActiveHigh,
                        trigger_source: TriggerSource::Internal,
                    },
                );
                hw.set_timer_compare(self.ws_timer(), u16::from(bits) * 4 - 1);
                hw.set_timer_config(
                    self.ws_timer(),
                    TimerConfig {
                        start: TimerStart::Disabled,
                        stop: TimerStop::Disabled,
                        enable: TimerEnable::PinRising,
                        disable: TimerDisable::OnCompare,
                        reset: TimerReset::Never,
                        decrement: TimerDecrement::TriggerShiftTrigger,
                        output: TimerOutput::OneOnEnable,
                    },
                );
                hw.set_timer_control(
                    self.ws_timer(),
                    TimerControl {
                        mode: TimerMode::Disabled,
                        pin: pins.ws,
                        pin_polarity: PinPolarity::ActiveLow,
                        pin_config: PinConfig::Disabled,
                        trigger: pin_trigger(pins.sck),
                        trigger_polarity: TriggerPolarity::ActiveHigh,
                        trigger_source: TriggerSource::Internal,
                    },
                );
            }
        }
    }

    pub fn common(&self) -> CommonDriverState {
        self.common
    }

    pub fn config(&self) -> &I2sConfig {
        &self.config
    }

    /// Change bit clock and word size between transfers. A slave only takes
    /// the word size.
    ///
    /// # Errors
    ///
    /// * `Error::InvalidConfig` - word size not accepted in this driver mode
    /// * `Error::Busy` - a transfer is in flight
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
            self.configure_timers(bits, divider);
            Ok(())
        })
    }

    /// Bit clock the current divider produces.
    pub fn baud_rate(&self) -> HertzU32 {
        let divider = critical_section::with(|cs| self.state.borrow_ref(cs).divider);
        HertzU32::from_raw(divider_baud(
            self.device.input_clock().raw(),
            divider,
            DIVIDER_BIAS,
        ))
    }

    pub fn bits(&self) -> u8 {
        critical_section::with(|cs| self.state.borrow_ref(cs).bits)
    }

    /// Start sending `data`, little-endian words of the configured size.
    ///
    /// # Errors
    ///
    /// * `Error::Busy` - a transfer is already in flight
    /// * `Error::InvalidConfig` - empty buffer or not a whole number of words
    /// * `Error::Unsupported` - buffer outside DMA-capable memory
    pub fn send(&self, data: &'static [u8]) -> Result<(), Error> {
        self.start(Some(TxCursor::new(data)), None, data.len(), false)
    }

    /// Send `data` and wait until every word has gone through the shifters.
    ///
    /// # Errors
    ///
    /// As [`I2sDriver::send`], plus `Error::Timeout`.
    pub fn send_blocking(&self, data: &[u8], timeout: MillisDurationU32) -> Result<(), Error> {
        self.semaphore.drain();
        self.start(Some(TxCursor::new(data)), None, data.len(), true)?;
        wait_blocking(self, timeout)
    }

    /// Start filling `buffer`; get it back with [`I2sDriver::take_rx_buffer`].
    ///
    /// # Errors
    ///
    /// As [`I2sDriver::send`].
    pub fn receive(&self, buffer: &'static mut [u8]) -> Result<(), Error> {
        let len = buffer.len();
        self.start(None, Some(RxSlot::leased(buffer)), len, false)
    }

    /// Fill `buffer`, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// As [`I2sDriver::receive`], plus `Error::Timeout`.
    pub fn receive_blocking(
        &self,
        buffer: &mut [u8],
        timeout: MillisDurationU32,
    ) -> Result<(), Error> {
        self.semaphore.drain();
        let len = buffer.len();
        let slot = RxSlot::borrowed(RxCursor::new(buffer));
        self.start(None, Some(slot), len, true)?;
        wait_blocking(self, timeout)
    }

    /// Queue the buffer to send once the current one runs out.
    ///
    /// # Errors
    ///
    /// * `Error::InvalidConfig` - nothing in flight, or bad buffer length
    /// * `Error::Unsupported` - a receive is in flight
    /// * `Error::Busy` - a buffer is already staged
    pub fn set_tx_buffer(&self, data: &'static [u8]) -> Result<(), Error> {
        critical_section::with(|cs| {
            let mut st = self.state.borrow_ref_mut(cs);
            if st.status.idle {
                return Err(Error::InvalidConfig);
            }
            if !st.sending {
                return Err(Error::Unsupported);
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
    /// As [`I2sDriver::set_tx_buffer`], with `Error::Unsupported` while sending.
    pub fn set_rx_buffer(&self, buffer: &'static mut [u8]) -> Result<(), Error> {
        critical_section::with(|cs| {
            let mut st = self.state.borrow_ref_mut(cs);
            if st.status.idle {
                return Err(Error::InvalidConfig);
            }
            if st.sending {
                return Err(Error::Unsupported);
            }
            if st.staged_rx.is_some() {
                return Err(Error::Busy);
            }
            self.check_buffer(st.bits, buffer.as_ptr() as usize, buffer.len())?;
            st.staged_rx = Some(RxSlot::leased(buffer));
            Ok(())
        })
    }

    fn check_buffer(&self, bits: u8, address: usize, len: usize) -> Result<(), Error> {
        if len == 0 || len % usize::from(word_bytes(bits)) != 0 {
            return Err(Error::InvalidConfig);
        }
        if self.config.driver_type == DriverType::Dma
            && !self.dma.is_some_and(|dma| dma.is_dma_capable(address, len))
        {
            return Err(Error::Unsupported);
        }
        Ok(())
    }

    fn start(
        &self,
        tx: Option<TxCursor>,
        rx: Option<RxSlot>,
        len: usize,
        blocking: bool,
    ) -> Result<(), Error> {
        let hw = self.device.hw();
        let tx_bit = bit(self.tx_index());
        let rx_bit = bit(self.rx_index());
        let sending = tx.is_some();
        let address = match (&tx, &rx) {
            (Some(cursor), _) => cursor.address(),
            (None, Some(slot)) => slot.cursor.address(),
            (None, None) => 0,
        };

        critical_section::with(|cs| {
            let mut st = self.state.borrow_ref_mut(cs);
            if !st.status.idle {
                return Err(Error::Busy);
            }
            self.check_buffer(st.bits, address, len)?;
            st.status.begin(blocking)?;
            st.sending = sending;
            st.tx = tx;
            st.rx = rx;
            st.staged_tx = None;
            st.staged_rx = None;
            st.tx_remaining = len;
            st.rx_remaining = len;
            st.tx_chunk = 0;
            st.rx_chunk = 0;

            hw.clear_shifter_error(tx_bit | rx_bit);
            hw.clear_shifter_status(rx_bit);
            let pin_config = if sending {
                PinConfig::Output
            } else {
                PinConfig::Disabled
            };
            hw.set_shifter_pin_config(self.tx_index(), pin_config);
            hw.set_shifter_mode(self.tx_index(), ShifterMode::Transmit);
            hw.set_shifter_mode(self.rx_index(), ShifterMode::Receive);
            match self.config.role {
                I2sRole::Master => {
                    hw.set_timer_mode(self.sck_timer(), TimerMode::Baud8Bit);
                    hw.set_timer_mode(self.ws_timer(), TimerMode::Counter16Bit);
                }
                I2sRole::Slave => {
                    hw.set_timer_mode(self.sck_timer(), TimerMode::Counter16Bit);
                    hw.set_timer_mode(self.ws_timer(), TimerMode::Counter16Bit);
                }
            }

            match self.config.driver_type {
                DriverType::Interrupts => {
                    hw.set_shifter_interrupts(tx_bit | rx_bit, true);
                    hw.set_shifter_error_interrupts(tx_bit | rx_bit, true);
                }
                DriverType::Dma => {
                    // receive side first so no word is missed
                    let started = self
                        .program_rx(&mut st)
                        .and_then(|()| self.program_tx(&mut st));
                    if let Err(e) = started {
                        st.status.record(e);
                        self.stop(&mut st);
                        st.status.blocking = false;
                        return Err(e);
                    }
                    hw.set_shifter_error_interrupts(tx_bit | rx_bit, true);
                }
                DriverType::Polling => {}
            }
            self.device.logger().debug_fmt(format_args!(
                "i2s{}: {} {len} bytes",
                self.common.resource_index,
                if sending { "send" } else { "receive" }
            ));
            Ok(())
        })
    }

    fn dma_width(bits: u8) -> Result<DmaWidth, Error> {
        DmaWidth::from_bytes(word_bytes(bits)).ok_or(Error::InvalidConfig)
    }

    fn dma_count(bytes: usize, bits: u8) -> Result<u32, Error> {
        u32::try_from(bytes / usize::from(word_bytes(bits))).map_err(|_| Error::InvalidConfig)
    }

    fn program_tx(&self, st: &mut I2sState) -> Result<(), Error> {
        let dma = self.dma.ok_or(Error::InvalidConfig)?;
        let hw = self.device.hw();
        let width = word_bytes(st.bits);
        let memory = st.tx.as_ref().map(TxCursor::address);
        // words go to the top of the bit-swapped buffer, MSB first on the wire
        let transfer = DmaTransfer {
            direction: DmaDirection::MemoryToPeripheral,
            source: memory.unwrap_or_else(fill::zeros),
            destination: hw.buffer_address(self.tx_index(), BufferMode::BitSwap)
                + usize::from(4 - width),
            width: Self::dma_width(st.bits)?,
            count: Self::dma_count(st.tx_remaining, st.bits)?,
            source_increment: memory.is_some(),
            destination_increment: false,
            request: self.device.dma_request(self.tx_index()),
        };
        self.configure_dma(dma, self.config.tx_dma_channel, &transfer)?;
        st.tx_chunk = st.tx_remaining;
        st.tx_dma_active = true;
        hw.set_shifter_dma_requests(bit(self.tx_index()), true);
        Ok(())
    }

    fn program_rx(&self, st: &mut I2sState) -> Result<(), Error> {
        let dma = self.dma.ok_or(Error::InvalidConfig)?;
        let hw = self.device.hw();
        let memory = st.rx.as_ref().map(|slot| slot.cursor.address());
        let transfer = DmaTransfer {
            direction: DmaDirection::PeripheralToMemory,
            source: hw.buffer_address(self.rx_index(), BufferMode::BitSwap),
            destination: memory.unwrap_or_else(fill::sink),
            width: Self::dma_width(st.bits)?,
            count: Self::dma_count(st.rx_remaining, st.bits)?,
            source_increment: false,
            destination_increment: memory.is_some(),
            request: self.device.dma_request(self.rx_index()),
        };
        self.configure_dma(dma, self.config.rx_dma_channel, &transfer)?;
        st.rx_chunk = st.rx_remaining;
        st.rx_dma_active = true;
        hw.set_shifter_dma_requests(bit(self.rx_index()), true);
        Ok(())
    }

    fn configure_dma(&self, dma: &D, channel: u8, transfer: &DmaTransfer) -> Result<(), Error> {
        dma.configure(channel, transfer).map_err(|e| {
            self.device.logger().error_fmt(format_args!(
                "i2s{}: dma channel {channel} setup failed: {e:?}",
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

    /// Bytes of the current buffers not through the shifters yet.
    pub fn remaining(&self) -> usize {
        critical_section::with(|cs| {
            let st = self.state.borrow_ref(cs);
            let moved = match self.dma.filter(|_| st.rx_dma_active) {
                Some(dma) => {
                    let left = dma.remaining(self.config.rx_dma_channel) as usize
                        * usize::from(word_bytes(st.bits));
                    st.rx_chunk.saturating_sub(left)
                }
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

    /// Forward a notification of either DMA channel.
    pub fn on_dma_event(&self, channel: u8, event: DmaEvent) {
        let tx_channel = self.config.tx_dma_channel;
        let rx_channel = self.config.rx_dma_channel;
        if channel != tx_channel && channel != rx_channel {
            return;
        }
        critical_section::with(|cs| {
            let mut st = self.state.borrow_ref_mut(cs);
            if st.status.idle {
                return;
            }
            let outcome = match event {
                DmaEvent::Error => Err(Error::Dma),
                DmaEvent::Complete if channel == tx_channel && st.tx_dma_active => {
                    self.tx_dma_complete(&mut st)
                }
                DmaEvent::Complete if channel == rx_channel && st.rx_dma_active => {
                    self.rx_dma_complete(&mut st)
                }
                DmaEvent::Complete => Ok(()),
            };
            if let Err(e) = outcome {
                self.device.logger().error_fmt(format_args!(
                    "i2s{}: dma channel {channel}: {e}",
                    self.common.resource_index
                ));
                st.status.record(e);
                self.stop(&mut st);
            }
        });
    }

    fn tx_dma_complete(&self, st: &mut I2sState) -> Result<(), Error> {
        st.tx_dma_active = false;
        st.tx_remaining = st.tx_remaining.saturating_sub(st.tx_chunk);
        st.tx_chunk = 0;
        if st.sending {
            self.tx_exhausted(st);
        }
        if st.tx_remaining > 0 {
            self.program_tx(st)
        } else {
            self.device
                .hw()
                .set_shifter_dma_requests(bit(self.tx_index()), false);
            Ok(())
        }
    }

    fn rx_dma_complete(&self, st: &mut I2sState) -> Result<(), Error> {
        st.rx_dma_active = false;
        st.rx_remaining = st.rx_remaining.saturating_sub(st.rx_chunk);
        st.rx_chunk = 0;
        if !st.sending {
            if let Some(rx) = st.rx.as_mut() {
                rx.cursor.advance(rx.cursor.remaining());
            }
            self.rx_exhausted(st);
            if st.tx_remaining > 0 && !st.tx_dma_active {
                self.program_tx(st)?;
            }
        }
        if st.rx_remaining > 0 {
            self.program_rx(st)
        } else {
            self.stop(st);
            Ok(())
        }
    }

    /// Current send buffer ran out: report it and move on to the staged one.
    fn tx_exhausted(&self, st: &mut I2sState) {
        push_event(&mut st.events, DriverEvent::TxEmpty);
        if let Some(next) = st.staged_tx.take() {
            let len = next.remaining();
            st.tx = Some(next);
            st.tx_remaining += len;
            st.rx_remaining += len;
        }
    }

    /// Current receive buffer is full: hand it back and move on to the staged one.
    fn rx_exhausted(&self, st: &mut I2sState) {
        push_event(&mut st.events, DriverEvent::RxFull);
        let current = st.rx.take();
        retire(&mut st.filled, current);
        if let Some(next) = st.staged_rx.take() {
            let len = next.cursor.remaining();
            st.rx = Some(next);
            st.rx_remaining += len;
            st.tx_remaining += len;
            if self.config.driver_type == DriverType::Interrupts {
                self.device
                    .hw()
                    .set_shifter_interrupts(bit(self.tx_index()), true);
            }
        }
    }

    fn read_word(&self, st: &mut I2sState) {
        let value = self.device.hw().read_buffer(self.rx_index(), BufferMode::BitSwap)
            & word_mask(st.bits);
        if st.rx_remaining == 0 {
            return;
        }
        let width = word_bytes(st.bits);
        if let Some(rx) = st.rx.as_mut() {
            rx.cursor.push(width, value);
        }
        st.rx_remaining = st.rx_remaining.saturating_sub(usize::from(width));
        if st.rx_remaining == 0 && !st.sending {
            self.rx_exhausted(st);
        }
        if st.rx_remaining == 0 {
            self.stop(st);
        }
    }

    fn write_word(&self, st: &mut I2sState) {
        let hw = self.device.hw();
        if st.tx_remaining == 0 {
            if self.config.driver_type == DriverType::Interrupts {
                hw.set_shifter_interrupts(bit(self.tx_index()), false);
            }
            return;
        }
        let width = word_bytes(st.bits);
        let value = st.tx.as_mut().and_then(|tx| tx.next(width)).unwrap_or(0);
        let word = (value & word_mask(st.bits)) << (32 - u32::from(st.bits));
        hw.write_buffer(self.tx_index(), BufferMode::BitSwap, word);
        st.tx_remaining = st.tx_remaining.saturating_sub(usize::from(width));
        if st.tx_remaining == 0 && st.sending {
            self.tx_exhausted(st);
        }
    }

    fn check_status(&self, st: &mut I2sState) {
        let hw = self.device.hw();
        let status = hw.shifter_status();
        let errors = hw.shifter_error();
        let tx_bit = bit(self.tx_index());
        let rx_bit = bit(self.rx_index());

        if errors & tx_bit != 0 {
            // the transmitter runs dry after the last word; that is expected
            if st.tx_remaining > 0 {
                st.status.record(Error::TxUnderrun);
            }
            hw.clear_shifter_error(tx_bit);
        }
        if errors & rx_bit != 0 {
            st.status.record(Error::RxOverrun);
            hw.clear_shifter_error(rx_bit);
        }
        if self.config.driver_type == DriverType::Dma {
            return;
        }
        if status & rx_bit != 0 {
            self.read_word(st);
            if st.status.idle {
                return;
            }
        }
        if status & tx_bit != 0 {
            self.write_word(st);
        }
    }

    fn disable_resources(&self) {
        let hw = self.device.hw();
        hw.set_shifter_mode(self.tx_index(), ShifterMode::Disabled);
        hw.set_shifter_mode(self.rx_index(), ShifterMode::Disabled);
        hw.set_timer_mode(self.sck_timer(), TimerMode::Disabled);
        hw.set_timer_mode(self.ws_timer(), TimerMode::Disabled);
    }

    fn stop(&self, st: &mut I2sState) {
        let hw = self.device.hw();
        let mask = self.common.resource_mask();
        self.disable_resources();
        hw.clear_shifter_error(mask);
        hw.clear_shifter_status(bit(self.rx_index()));
        hw.clear_timer_status(mask);

        if let Some(dma) = self.dma {
            if st.tx_dma_active {
                dma.stop(self.config.tx_dma_channel);
            }
            if st.rx_dma_active {
                dma.stop(self.config.rx_dma_channel);
                let left = dma.remaining(self.config.rx_dma_channel) as usize
                    * usize::from(word_bytes(st.bits));
                let moved = st.rx_chunk.saturating_sub(left);
                st.rx_remaining = st.rx_remaining.saturating_sub(moved);
            }
        }
        st.tx_dma_active = false;
        st.rx_dma_active = false;
        self.end_transfer(st);
    }

    fn end_transfer(&self, st: &mut I2sState) {
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
                "i2s{}: transfer done",
                self.common.resource_index
            )),
            Some(e) => self.device.logger().error_fmt(format_args!(
                "i2s{}: transfer ended: {e}",
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

impl<H, O, L, D> EioIsr for I2sDriver<'_, H, O, L, D>
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

impl<H, O, L, D> BlockingTransfer for I2sDriver<'_, H, O, L, D>
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
        I2sDriver::step(self);
    }

    fn is_busy(&self) -> bool {
        I2sDriver::is_busy(self)
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
