// Licensed under the Apache-2.0 license

//! Behavioural model of an EIO block and mock collaborators for host tests.
//!
//! [`SimEio`] keeps registers as typed values. Buffer writes clear the
//! shifter status flag and are logged; everything else that real hardware
//! does on its own (shifting, timer events, errors) comes from a pluggable
//! [`SimModel`], which is stepped once per read of the shifter status
//! register.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};

use super::common::{EioIsr, MAX_RESOURCES};
use super::device::{EioDevice, EioDeviceConfig};
use super::hw::{
    bit, BufferMode, EioHardware, ShifterConfig, ShifterControl, TimerConfig, TimerControl,
};
use crate::common::{Logger, NoOpLogger};
use crate::dma::{DmaError, DmaService, DmaTransfer};
use crate::osif::StdOsif;
use crate::syscon::{ClockControl, InterruptControl};
use fugit::HertzU32;

pub(crate) const SIM_BASE: usize = 0x4005_A000;
pub(crate) const CLOCK_ID: u8 = 7;
pub(crate) const IRQ_LINE: u16 = 69;
pub(crate) const INPUT_CLOCK: u32 = 48_000_000;

#[derive(Debug)]
pub(crate) struct SimRegs {
    pub shifters: u8,
    pub timers: u8,
    pub enabled: bool,
    pub resets: u32,
    pub shifter_cfg: [ShifterConfig; MAX_RESOURCES],
    pub shifter_ctl: [ShifterControl; MAX_RESOURCES],
    pub timer_cfg: [TimerConfig; MAX_RESOURCES],
    pub timer_ctl: [TimerControl; MAX_RESOURCES],
    pub timer_cmp: [u16; MAX_RESOURCES],
    pub shifter_status: u32,
    pub shifter_error: u32,
    pub timer_status: u32,
    pub sien: u32,
    pub eien: u32,
    pub tien: u32,
    pub dma: u32,
    pub buffers: [u32; MAX_RESOURCES],
    pub writes: Vec<(u8, BufferMode, u32)>,
    pub pins: u32,
}

impl SimRegs {
    fn new(count: u8) -> Self {
        Self {
            shifters: count,
            timers: count,
            enabled: false,
            resets: 0,
            shifter_cfg: [ShifterConfig::default(); MAX_RESOURCES],
            shifter_ctl: [ShifterControl::default(); MAX_RESOURCES],
            timer_cfg: [TimerConfig::default(); MAX_RESOURCES],
            timer_ctl: [TimerControl::default(); MAX_RESOURCES],
            timer_cmp: [0; MAX_RESOURCES],
            shifter_status: 0,
            shifter_error: 0,
            timer_status: 0,
            sien: 0,
            eien: 0,
            tien: 0,
            dma: 0,
            buffers: [0; MAX_RESOURCES],
            writes: Vec::new(),
            pins: u32::MAX,
        }
    }

    /// Values written to shifter `index`, in order.
    pub fn written(&self, index: u8) -> Vec<u32> {
        self.writes
            .iter()
            .filter(|(i, _, _)| *i == index)
            .map(|&(_, _, v)| v)
            .collect()
    }
}

/// What the simulated block does on its own.
pub(crate) trait SimModel: Send {
    fn on_write(&mut self, _regs: &mut SimRegs, _index: u8, _mode: BufferMode, _value: u32) {}
    fn tick(&mut self, _regs: &mut SimRegs) {}
}

struct SimInner {
    regs: SimRegs,
    model: Option<Box<dyn SimModel>>,
}

pub(crate) struct SimEio {
    inner: Mutex<SimInner>,
}

impl SimEio {
    pub fn new(count: u8) -> Self {
        Self {
            inner: Mutex::new(SimInner {
                regs: SimRegs::new(count),
                model: None,
            }),
        }
    }

    pub fn set_model(&self, model: impl SimModel + 'static) {
        self.lock().model = Some(Box::new(model));
    }

    /// Inspect or poke registers directly, bypassing the model.
    pub fn regs<R>(&self, f: impl FnOnce(&mut SimRegs) -> R) -> R {
        f(&mut self.lock().regs)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn set_mask(reg: &mut u32, mask: u32, enable: bool) {
    if enable {
        *reg |= mask;
    } else {
        *reg &= !mask;
    }
}

impl EioHardware for SimEio {
    fn shifter_count(&self) -> u8 {
        self.lock().regs.shifters
    }

    fn timer_count(&self) -> u8 {
        self.lock().regs.timers
    }

    fn reset(&self) {
        let mut inner = self.lock();
        let fresh = SimRegs::new(inner.regs.shifters);
        let resets = inner.regs.resets + 1;
        let pins = inner.regs.pins;
        inner.regs = SimRegs { resets, pins, ..fresh };
    }

    fn set_enabled(&self, enabled: bool) {
        self.lock().regs.enabled = enabled;
    }

    fn shifter_config(&self, index: u8) -> ShifterConfig {
        self.lock().regs.shifter_cfg[usize::from(index)]
    }

    fn set_shifter_config(&self, index: u8, config: ShifterConfig) {
        self.lock().regs.shifter_cfg[usize::from(index)] = config;
    }

    fn shifter_control(&self, index: u8) -> ShifterControl {
        self.lock().regs.shifter_ctl[usize::from(index)]
    }

    fn set_shifter_control(&self, index: u8, control: ShifterControl) {
        self.lock().regs.shifter_ctl[usize::from(index)] = control;
    }

    fn timer_config(&self, index: u8) -> TimerConfig {
        self.lock().regs.timer_cfg[usize::from(index)]
    }

    fn set_timer_config(&self, index: u8, config: TimerConfig) {
        self.lock().regs.timer_cfg[usize::from(index)] = config;
    }

    fn timer_control(&self, index: u8) -> TimerControl {
        self.lock().regs.timer_ctl[usize::from(index)]
    }

    fn set_timer_control(&self, index: u8, control: TimerControl) {
        self.lock().regs.timer_ctl[usize::from(index)] = control;
    }

    fn timer_compare(&self, index: u8) -> u16 {
        self.lock().regs.timer_cmp[usize::from(index)]
    }

    fn set_timer_compare(&self, index: u8, value: u16) {
        self.lock().regs.timer_cmp[usize::from(index)] = value;
    }

    fn shifter_status(&self) -> u32 {
        let mut guard = self.lock();
        let SimInner { regs, model } = &mut *guard;
        if let Some(model) = model.as_mut() {
            model.tick(regs);
        }
        regs.shifter_status
    }

    fn clear_shifter_status(&self, mask: u32) {
        self.lock().regs.shifter_status &= !mask;
    }

    fn shifter_error(&self) -> u32 {
        self.lock().regs.shifter_error
    }

    fn clear_shifter_error(&self, mask: u32) {
        self.lock().regs.shifter_error &= !mask;
    }

    fn timer_status(&self) -> u32 {
        self.lock().regs.timer_status
    }

    fn clear_timer_status(&self, mask: u32) {
        self.lock().regs.timer_status &= !mask;
    }

    fn shifter_interrupts(&self) -> u32 {
        self.lock().regs.sien
    }

    fn set_shifter_interrupts(&self, mask: u32, enable: bool) {
        set_mask(&mut self.lock().regs.sien, mask, enable);
    }

    fn shifter_error_interrupts(&self) -> u32 {
        self.lock().regs.eien
    }

    fn set_shifter_error_interrupts(&self, mask: u32, enable: bool) {
        set_mask(&mut self.lock().regs.eien, mask, enable);
    }

    fn timer_interrupts(&self) -> u32 {
        self.lock().regs.tien
    }

    fn set_timer_interrupts(&self, mask: u32, enable: bool) {
        set_mask(&mut self.lock().regs.tien, mask, enable);
    }

    fn shifter_dma_requests(&self) -> u32 {
        self.lock().regs.dma
    }

    fn set_shifter_dma_requests(&self, mask: u32, enable: bool) {
        set_mask(&mut self.lock().regs.dma, mask, enable);
    }

    fn read_buffer(&self, index: u8, _mode: BufferMode) -> u32 {
        let mut inner = self.lock();
        inner.regs.shifter_status &= !bit(index);
        inner.regs.buffers[usize::from(index)]
    }

    fn write_buffer(&self, index: u8, mode: BufferMode, value: u32) {
        let mut guard = self.lock();
        let SimInner { regs, model } = &mut *guard;
        regs.shifter_status &= !bit(index);
        regs.buffers[usize::from(index)] = value;
        regs.writes.push((index, mode, value));
        if let Some(model) = model.as_mut() {
            model.on_write(regs, index, mode, value);
        }
    }

    fn buffer_address(&self, index: u8, mode: BufferMode) -> usize {
        let bank = match mode {
            BufferMode::Normal => 0x200,
            BufferMode::BitSwap => 0x280,
            BufferMode::ByteSwap => 0x300,
        };
        SIM_BASE + bank + 4 * usize::from(index)
    }

    fn pin_data(&self) -> u32 {
        self.lock().regs.pins
    }
}

pub(crate) struct MockClock {
    pub frequency: u32,
    pub enabled: HashSet<u8>,
    pub enable_calls: u32,
    pub resets: Vec<(u8, bool)>,
}

impl MockClock {
    pub fn new(frequency: u32) -> Self {
        Self {
            frequency,
            enabled: HashSet::new(),
            enable_calls: 0,
            resets: Vec::new(),
        }
    }
}

impl ClockControl for MockClock {
    type ClockId = u8;
    type Error = ();

    fn enable(&mut self, clock: u8) -> Result<(), ()> {
        self.enable_calls += 1;
        self.enabled.insert(clock);
        Ok(())
    }

    fn disable(&mut self, clock: u8) -> Result<(), ()> {
        self.enabled.remove(&clock);
        Ok(())
    }

    fn reset_assert(&mut self, clock: u8) -> Result<(), ()> {
        self.resets.push((clock, true));
        Ok(())
    }

    fn reset_deassert(&mut self, clock: u8) -> Result<(), ()> {
        self.resets.push((clock, false));
        Ok(())
    }

    fn frequency(&self, clock: u8) -> Result<HertzU32, ()> {
        if self.enabled.contains(&clock) {
            Ok(HertzU32::from_raw(self.frequency))
        } else {
            Err(())
        }
    }
}

#[derive(Default)]
pub(crate) struct MockIntc {
    pub enabled: HashSet<u16>,
}

impl InterruptControl for MockIntc {
    type Irq = u16;

    fn enable_irq(&mut self, irq: u16) {
        self.enabled.insert(irq);
    }

    fn disable_irq(&mut self, irq: u16) {
        self.enabled.remove(&irq);
    }
}

#[derive(Default)]
pub(crate) struct MockDmaState {
    pub configured: HashMap<u8, DmaTransfer>,
    pub remaining: HashMap<u8, u32>,
    pub running: HashSet<u8>,
    pub starts: Vec<u8>,
    pub stops: Vec<u8>,
    pub incapable: bool,
}

/// DMA service that records descriptors; completion is driven by the test.
#[derive(Default)]
pub(crate) struct MockDma {
    state: Mutex<MockDmaState>,
}

impl MockDma {
    pub fn with<R>(&self, f: impl FnOnce(&mut MockDmaState) -> R) -> R {
        f(&mut self.state.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Pretend the channel moved everything.
    pub fn drain(&self, channel: u8) {
        self.with(|s| {
            s.remaining.insert(channel, 0);
            s.running.remove(&channel);
        });
    }
}

impl DmaService for MockDma {
    fn configure(&self, channel: u8, transfer: &DmaTransfer) -> Result<(), DmaError> {
        self.with(|s| {
            s.configured.insert(channel, *transfer);
            s.remaining.insert(channel, transfer.count);
        });
        Ok(())
    }

    fn start(&self, channel: u8) {
        self.with(|s| {
            s.running.insert(channel);
            s.starts.push(channel);
        });
    }

    fn stop(&self, channel: u8) {
        self.with(|s| {
            s.running.remove(&channel);
            s.stops.push(channel);
        });
    }

    fn remaining(&self, channel: u8) -> u32 {
        self.with(|s| s.remaining.get(&channel).copied().unwrap_or(0))
    }

    fn set_source(&self, channel: u8, address: usize) {
        self.with(|s| {
            if let Some(t) = s.configured.get_mut(&channel) {
                t.source = address;
            }
        });
    }

    fn set_destination(&self, channel: u8, address: usize) {
        self.with(|s| {
            if let Some(t) = s.configured.get_mut(&channel) {
                t.destination = address;
            }
        });
    }

    fn set_count(&self, channel: u8, count: u32) {
        self.with(|s| {
            if let Some(t) = s.configured.get_mut(&channel) {
                t.count = count;
            }
            s.remaining.insert(channel, count);
        });
    }

    fn is_dma_capable(&self, _address: usize, _len: usize) -> bool {
        !self.with(|s| s.incapable)
    }
}

/// Logger that keeps every line, for asserting on diagnostics.
#[derive(Default)]
pub(crate) struct RecordingLogger {
    pub lines: Mutex<Vec<String>>,
}

impl Logger for RecordingLogger {
    fn debug(&self, msg: &str) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(format!("debug: {msg}"));
    }

    fn error(&self, msg: &str) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(format!("error: {msg}"));
    }
}

pub(crate) type SimDevice = EioDevice<SimEio, StdOsif, NoOpLogger>;

/// Initialized instance-0 device over a block with `count` resource pairs.
pub(crate) fn sim_device(count: u8) -> SimDevice {
    let device = EioDevice::new(
        SimEio::new(count),
        StdOsif::new(),
        NoOpLogger,
        EioDeviceConfig::new(0),
    );
    let mut clock = MockClock::new(INPUT_CLOCK);
    let mut intc = MockIntc::default();
    device
        .init(&mut clock, CLOCK_ID, &mut intc, IRQ_LINE)
        .unwrap();
    device
}

/// Run `device.irq_handler` for `drivers` on a background thread until `body`
/// returns.
pub(crate) fn with_irq_thread<R>(
    device: &SimDevice,
    drivers: &[&(dyn EioIsr + Sync)],
    body: impl FnOnce() -> R,
) -> R {
    use std::sync::atomic::{AtomicBool, Ordering};
    let done = AtomicBool::new(false);
    std::thread::scope(|s| {
        s.spawn(|| {
            let list: Vec<&dyn EioIsr> = drivers.iter().map(|d| *d as &dyn EioIsr).collect();
            while !done.load(Ordering::SeqCst) {
                device.irq_handler(&list);
                std::thread::yield_now();
            }
        });
        let result = body();
        done.store(true, Ordering::SeqCst);
        result
    })
}
