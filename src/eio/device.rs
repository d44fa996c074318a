// Licensed under the Apache-2.0 license

//! EIO device layer.
//!
//! One [`EioDevice`] owns one physical EIO block: its shifter/timer allocation
//! bitmask, the table of drivers currently bound to it, and the interrupt
//! dispatcher that routes the shared device interrupt to those drivers.
//! Protocol drivers borrow the device; [`DeviceRegistry`] maps instance
//! numbers to devices for code that looks them up by number.

use core::cell::RefCell;

use fugit::HertzU32;

use super::common::{resource_mask, CommonDriverState, EioIsr, Error, MAX_RESOURCES};
use super::hw::{EioHardware, ShifterConfig, ShifterControl, TimerConfig, TimerControl};
use crate::common::{Logger, NoOpLogger};
use crate::osif::{Osif, OsifMutex};
use crate::syscon::{ClockControl, InterruptControl};

/// Static description of a device instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EioDeviceConfig {
    pub instance: u8,
    /// DMA request line raised by shifter `n`, indexed by resource slot.
    pub dma_requests: [u8; MAX_RESOURCES],
}

impl EioDeviceConfig {
    /// Configuration whose DMA request for slot `n` is `n`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(instance: u8) -> Self {
        let mut dma_requests = [0u8; MAX_RESOURCES];
        for (slot, request) in dma_requests.iter_mut().enumerate() {
            *request = slot as u8;
        }
        Self {
            instance,
            dma_requests,
        }
    }

    #[must_use]
    pub fn dma_requests(mut self, requests: [u8; MAX_RESOURCES]) -> Self {
        self.dma_requests = requests;
        self
    }
}

#[derive(Debug)]
struct DeviceState {
    initialized: bool,
    capacity: u8,
    input_clock: HertzU32,
    slots: [Option<CommonDriverState>; MAX_RESOURCES],
}

impl DeviceState {
    const fn new() -> Self {
        Self {
            initialized: false,
            capacity: 0,
            input_clock: HertzU32::from_raw(0),
            slots: [None; MAX_RESOURCES],
        }
    }
}

pub struct EioDevice<H: EioHardware, O: Osif, L: Logger = NoOpLogger> {
    hw: H,
    osif: O,
    logger: L,
    config: EioDeviceConfig,
    allocation: OsifMutex<O::Mutex, u32>,
    state: critical_section::Mutex<RefCell<DeviceState>>,
}

impl<H: EioHardware, O: Osif, L: Logger> EioDevice<H, O, L> {
    pub fn new(hw: H, osif: O, logger: L, config: EioDeviceConfig) -> Self {
        let allocation = OsifMutex::new(osif.mutex_create(), 0);
        Self {
            hw,
            osif,
            logger,
            config,
            allocation,
            state: critical_section::Mutex::new(RefCell::new(DeviceState::new())),
        }
    }

    /// Bring the device up.
    ///
    /// Idempotent: a second call on an initialized device returns `Ok` without
    /// touching the hardware, so several protocol drivers can share a block.
    ///
    /// # Errors
    ///
    /// * `Error::Hardware` - the clock could not be enabled or queried
    pub fn init<C, I>(
        &self,
        clock: &mut C,
        clock_id: C::ClockId,
        intc: &mut I,
        irq: I::Irq,
    ) -> Result<(), Error>
    where
        C: ClockControl,
        I: InterruptControl,
    {
        if self.is_initialized() {
            return Ok(());
        }

        clock.enable(clock_id).map_err(|e| {
            self.logger
                .error_fmt(format_args!("eio{}: clock enable failed: {e:?}", self.instance()));
            Error::Hardware
        })?;
        let input_clock = clock.frequency(clock_id).map_err(|_| Error::Hardware)?;

        self.hw.reset();
        self.hw.set_enabled(true);
        intc.enable_irq(irq);

        let capacity = self
            .hw
            .shifter_count()
            .min(self.hw.timer_count())
            .min(MAX_RESOURCES as u8);
        self.allocation.lock(|mask| *mask = 0);
        critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            state.slots = [None; MAX_RESOURCES];
            state.capacity = capacity;
            state.input_clock = input_clock;
            state.initialized = true;
        });

        self.logger.debug_fmt(format_args!(
            "eio{}: up, {} resource pairs, input clock {} Hz",
            self.instance(),
            capacity,
            input_clock.raw()
        ));
        Ok(())
    }

    /// Tear the device down unconditionally.
    ///
    /// # Errors
    ///
    /// * `Error::Hardware` - the clock could not be gated
    pub fn deinit<C, I>(
        &self,
        clock: &mut C,
        clock_id: C::ClockId,
        intc: &mut I,
        irq: I::Irq,
    ) -> Result<(), Error>
    where
        C: ClockControl,
        I: InterruptControl,
    {
        intc.disable_irq(irq);
        self.hw.set_enabled(false);
        self.hw.reset();
        self.allocation.lock(|mask| *mask = 0);
        critical_section::with(|cs| {
            *self.state.borrow_ref_mut(cs) = DeviceState::new();
        });
        self.logger
            .debug_fmt(format_args!("eio{}: down", self.instance()));
        clock.disable(clock_id).map_err(|_| Error::Hardware)
    }

    /// Re-run the register reset. Clock, interrupt line and allocations are kept.
    pub fn reset(&self) {
        self.hw.reset();
        self.hw.set_enabled(true);
    }

    pub fn is_initialized(&self) -> bool {
        critical_section::with(|cs| self.state.borrow_ref(cs).initialized)
    }

    pub fn instance(&self) -> u8 {
        self.config.instance
    }

    /// Shifter/timer pairs available for allocation.
    pub fn capacity(&self) -> u8 {
        critical_section::with(|cs| self.state.borrow_ref(cs).capacity)
    }

    /// Module clock frequency sampled at `init`.
    pub fn input_clock(&self) -> HertzU32 {
        critical_section::with(|cs| self.state.borrow_ref(cs).input_clock)
    }

    pub fn hw(&self) -> &H {
        &self.hw
    }

    pub fn osif(&self) -> &O {
        &self.osif
    }

    pub fn logger(&self) -> &L {
        &self.logger
    }

    /// DMA request line of shifter `resource`.
    pub fn dma_request(&self, resource: u8) -> u8 {
        self.config
            .dma_requests
            .get(usize::from(resource))
            .copied()
            .unwrap_or(resource)
    }

    /// Reserve the lowest run of `count` free resource pairs.
    ///
    /// # Errors
    ///
    /// * `Error::NotInitialized` - `init` has not run
    /// * `Error::NotEnoughResources` - no contiguous run of `count` free pairs
    pub fn allocate(&self, count: u8) -> Result<u8, Error> {
        let capacity = critical_section::with(|cs| {
            let state = self.state.borrow_ref(cs);
            state.initialized.then_some(state.capacity)
        })
        .ok_or(Error::NotInitialized)?;
        if count == 0 || count > capacity {
            return Err(Error::NotEnoughResources);
        }

        self.allocation.lock(|busy| {
            let window = resource_mask(0, count);
            for index in 0..=(capacity - count) {
                let mask = window << index;
                if *busy & mask == 0 {
                    *busy |= mask;
                    return Ok(index);
                }
            }
            Err(Error::NotEnoughResources)
        })
    }

    /// Release `[index, index + count)`.
    pub fn deallocate(&self, index: u8, count: u8) {
        self.allocation
            .lock(|busy| *busy &= !resource_mask(index, count));
    }

    /// Current allocation bitmask.
    pub fn allocated(&self) -> u32 {
        self.allocation.lock(|busy| *busy)
    }

    /// Allocate resources for a driver, reset them to a disabled baseline and
    /// bind the driver to the first free slot.
    ///
    /// # Errors
    ///
    /// Propagates allocation failures from [`EioDevice::allocate`].
    ///
    /// # Panics
    ///
    /// When the slot table is full although allocation succeeded, which means
    /// the resource accounting is broken.
    pub fn init_driver(&self, resource_count: u8) -> Result<CommonDriverState, Error> {
        let resource_index = self.allocate(resource_count).map_err(|e| {
            self.logger.error_fmt(format_args!(
                "eio{}: cannot allocate {} resource pairs",
                self.instance(),
                resource_count
            ));
            e
        })?;

        let mask = resource_mask(resource_index, resource_count);
        for index in resource_index..resource_index + resource_count {
            self.hw.set_shifter_control(index, ShifterControl::default());
            self.hw.set_shifter_config(index, ShifterConfig::default());
            self.hw.set_timer_control(index, TimerControl::default());
            self.hw.set_timer_config(index, TimerConfig::default());
            self.hw.set_timer_compare(index, 0);
        }
        self.hw.set_shifter_interrupts(mask, false);
        self.hw.set_shifter_error_interrupts(mask, false);
        self.hw.set_timer_interrupts(mask, false);
        self.hw.set_shifter_dma_requests(mask, false);
        self.hw.clear_shifter_status(mask);
        self.hw.clear_shifter_error(mask);
        self.hw.clear_timer_status(mask);

        let common = CommonDriverState {
            instance: self.instance(),
            resource_count,
            resource_index,
            isr: false,
        };
        critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            match state.slots.iter_mut().find(|slot| slot.is_none()) {
                Some(slot) => *slot = Some(common),
                None => panic!("eio slot table full after successful allocation"),
            }
        });

        self.logger.debug_fmt(format_args!(
            "eio{}: bound driver to resources {}..{}",
            self.instance(),
            resource_index,
            resource_index + resource_count
        ));
        Ok(common)
    }

    /// Unbind a driver and release its resources.
    ///
    /// # Panics
    ///
    /// When the driver is not bound to this device.
    pub fn deinit_driver(&self, common: &CommonDriverState) {
        critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            let slot = state.slots.iter_mut().find(|slot| {
                slot.is_some_and(|bound| bound.resource_index == common.resource_index)
            });
            match slot {
                Some(slot) => *slot = None,
                None => panic!("eio driver not bound to this device"),
            }
        });
        self.deallocate(common.resource_index, common.resource_count);
    }

    /// Route (or stop routing) the device interrupt to the driver bound at
    /// `common.resource_index`.
    pub fn set_isr(&self, common: &mut CommonDriverState, isr: bool) {
        common.isr = isr;
        critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            for bound in state.slots.iter_mut().flatten() {
                if bound.resource_index == common.resource_index {
                    bound.isr = isr;
                }
            }
        });
    }

    /// Drivers currently bound, in slot order.
    pub fn bound_drivers(&self) -> [Option<CommonDriverState>; MAX_RESOURCES] {
        critical_section::with(|cs| self.state.borrow_ref(cs).slots)
    }

    /// Shared interrupt handler for the device.
    ///
    /// Samples the shifter, shifter-error and timer event masks once, then
    /// services every bound driver with an ISR whose resources intersect them,
    /// in slot order. `drivers` lists the driver objects that may be bound to
    /// this device; slots without a matching entry are skipped.
    pub fn irq_handler(&self, drivers: &[&dyn EioIsr]) {
        let shifters = self.hw.shifter_status() & self.hw.shifter_interrupts();
        let errors = self.hw.shifter_error() & self.hw.shifter_error_interrupts();
        let timers = self.hw.timer_status() & self.hw.timer_interrupts();
        let events = shifters | errors | timers;
        if events == 0 {
            return;
        }

        let slots = self.bound_drivers();
        for bound in slots.iter().flatten().filter(|bound| bound.isr) {
            if bound.resource_mask() & events == 0 {
                continue;
            }
            for driver in drivers {
                let common = driver.common();
                if common.instance == bound.instance
                    && common.resource_index == bound.resource_index
                {
                    driver.service();
                }
            }
        }
    }
}

/// Instance-number lookup over the devices of a system.
pub struct DeviceRegistry<'a, H: EioHardware, O: Osif, L: Logger, const N: usize> {
    devices: [Option<&'a EioDevice<H, O, L>>; N],
}

impl<H: EioHardware, O: Osif, L: Logger, const N: usize> Default
    for DeviceRegistry<'_, H, O, L, N>
{
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, H: EioHardware, O: Osif, L: Logger, const N: usize> DeviceRegistry<'a, H, O, L, N> {
    #[must_use]
    pub fn new() -> Self {
        Self { devices: [None; N] }
    }

    /// Register `device` under its instance number.
    ///
    /// # Errors
    ///
    /// * `Error::Busy` - another device already claims the same instance
    /// * `Error::NotEnoughResources` - the registry is full
    pub fn register(&mut self, device: &'a EioDevice<H, O, L>) -> Result<(), Error> {
        if self.get(device.instance()).is_ok() {
            return Err(Error::Busy);
        }
        let slot = self
            .devices
            .iter_mut()
            .find(|slot| slot.is_none())
            .ok_or(Error::NotEnoughResources)?;
        *slot = Some(device);
        Ok(())
    }

    pub fn unregister(&mut self, instance: u8) {
        for slot in &mut self.devices {
            if slot.is_some_and(|device| device.instance() == instance) {
                *slot = None;
            }
        }
    }

    /// # Errors
    ///
    /// * `Error::NotInitialized` - no device registered under `instance`
    pub fn get(&self, instance: u8) -> Result<&'a EioDevice<H, O, L>, Error> {
        self.devices
            .iter()
            .flatten()
            .find(|device| device.instance() == instance)
            .copied()
            .ok_or(Error::NotInitialized)
    }
}
