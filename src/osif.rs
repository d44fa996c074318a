// Licensed under the Apache-2.0 license

//! OS interface consumed by the EIO drivers.
//!
//! The drivers need three services from whatever runs underneath them: a mutex
//! to serialize resource allocation, a counting semaphore to park a blocking
//! caller until the transfer-end path releases it, and a millisecond tick for
//! polling-mode deadlines. [`SpinOsif`] provides all three on bare metal using
//! critical sections; [`StdOsif`] maps them onto `std::sync` for host builds.

use core::cell::{Cell, UnsafeCell};
use fugit::MillisDurationU32;

/// Returned by [`Semaphore::wait`] when the deadline passes without a post.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaitTimeout;

/// Mutual exclusion primitive, closure-scoped so that the lock can never leak.
pub trait RawMutex {
    fn lock<R>(&self, f: impl FnOnce() -> R) -> R;
}

/// Counting semaphore.
pub trait Semaphore {
    /// Take one count, waiting at most `timeout` for a post.
    ///
    /// # Errors
    ///
    /// Returns [`WaitTimeout`] when no count became available in time.
    fn wait(&self, timeout: MillisDurationU32) -> Result<(), WaitTimeout>;

    fn post(&self);

    /// Drop every pending count.
    fn drain(&self) {
        while self.wait(MillisDurationU32::from_ticks(0)).is_ok() {}
    }
}

/// Factory for the OS primitives plus the tick source.
pub trait Osif {
    type Mutex: RawMutex;
    type Semaphore: Semaphore;

    fn mutex_create(&self) -> Self::Mutex;
    fn semaphore_create(&self, initial: u32) -> Self::Semaphore;

    /// Free-running millisecond counter. Wraps.
    fn millis(&self) -> u32;
}

/// Data guarded by an OS mutex.
pub struct OsifMutex<M, T> {
    raw: M,
    data: UnsafeCell<T>,
}

// SAFETY: every access to `data` goes through `lock`, which holds `raw`.
unsafe impl<M: RawMutex + Sync, T: Send> Sync for OsifMutex<M, T> {}

impl<M: RawMutex, T> OsifMutex<M, T> {
    pub const fn new(raw: M, data: T) -> Self {
        Self {
            raw,
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        self.raw.lock(|| {
            // SAFETY: the raw mutex is held for the duration of the closure and
            // the reference does not escape it.
            let data = unsafe { &mut *self.data.get() };
            f(data)
        })
    }
}

/// Mutex backed by a critical section.
#[derive(Debug, Default)]
pub struct CsMutex;

impl RawMutex for CsMutex {
    fn lock<R>(&self, f: impl FnOnce() -> R) -> R {
        critical_section::with(|_| f())
    }
}

/// Counting semaphore that spins on a critical-section protected counter.
pub struct SpinSemaphore {
    count: critical_section::Mutex<Cell<u32>>,
    tick: fn() -> u32,
}

impl SpinSemaphore {
    fn try_take(&self) -> bool {
        critical_section::with(|cs| {
            let count = self.count.borrow(cs);
            let current = count.get();
            if current > 0 {
                count.set(current - 1);
                true
            } else {
                false
            }
        })
    }
}

impl Semaphore for SpinSemaphore {
    fn wait(&self, timeout: MillisDurationU32) -> Result<(), WaitTimeout> {
        let start = (self.tick)();
        loop {
            if self.try_take() {
                return Ok(());
            }
            if (self.tick)().wrapping_sub(start) >= timeout.ticks() {
                return Err(WaitTimeout);
            }
            core::hint::spin_loop();
        }
    }

    fn post(&self) {
        critical_section::with(|cs| {
            let count = self.count.borrow(cs);
            count.set(count.get().saturating_add(1));
        });
    }
}

/// Bare-metal OS interface: critical-section mutexes and spinning semaphores
/// timed by a caller-supplied millisecond tick.
#[derive(Clone, Copy)]
pub struct SpinOsif {
    tick: fn() -> u32,
}

impl SpinOsif {
    #[must_use]
    pub const fn new(tick: fn() -> u32) -> Self {
        Self { tick }
    }
}

impl Osif for SpinOsif {
    type Mutex = CsMutex;
    type Semaphore = SpinSemaphore;

    fn mutex_create(&self) -> CsMutex {
        CsMutex
    }

    fn semaphore_create(&self, initial: u32) -> SpinSemaphore {
        SpinSemaphore {
            count: critical_section::Mutex::new(Cell::new(initial)),
            tick: self.tick,
        }
    }

    fn millis(&self) -> u32 {
        (self.tick)()
    }
}

#[cfg(any(test, feature = "std"))]
pub use host::{StdMutex, StdOsif, StdSemaphore};

#[cfg(any(test, feature = "std"))]
mod host {
    use super::{MillisDurationU32, Osif, RawMutex, Semaphore, WaitTimeout};
    use std::sync::{Condvar, Mutex, PoisonError};
    use std::time::{Duration, Instant};

    #[derive(Debug, Default)]
    pub struct StdMutex(Mutex<()>);

    impl RawMutex for StdMutex {
        fn lock<R>(&self, f: impl FnOnce() -> R) -> R {
            let _guard = self.0.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        }
    }

    #[derive(Debug, Default)]
    pub struct StdSemaphore {
        count: Mutex<u32>,
        posted: Condvar,
    }

    impl Semaphore for StdSemaphore {
        fn wait(&self, timeout: MillisDurationU32) -> Result<(), WaitTimeout> {
            let deadline = Duration::from_millis(u64::from(timeout.ticks()));
            let count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
            let (mut count, _) = self
                .posted
                .wait_timeout_while(count, deadline, |c| *c == 0)
                .unwrap_or_else(PoisonError::into_inner);
            if *count == 0 {
                return Err(WaitTimeout);
            }
            *count -= 1;
            Ok(())
        }

        fn post(&self) {
            let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
            *count = count.saturating_add(1);
            self.posted.notify_one();
        }
    }

    /// Host OS interface on top of `std::sync`.
    #[derive(Debug)]
    pub struct StdOsif {
        epoch: Instant,
    }

    impl Default for StdOsif {
        fn default() -> Self {
            Self::new()
        }
    }

    impl StdOsif {
        #[must_use]
        pub fn new() -> Self {
            Self {
                epoch: Instant::now(),
            }
        }
    }

    impl Osif for StdOsif {
        type Mutex = StdMutex;
        type Semaphore = StdSemaphore;

        fn mutex_create(&self) -> StdMutex {
            StdMutex::default()
        }

        fn semaphore_create(&self, initial: u32) -> StdSemaphore {
            StdSemaphore {
                count: Mutex::new(initial),
                posted: Condvar::new(),
            }
        }

        #[allow(clippy::cast_possible_truncation)]
        fn millis(&self) -> u32 {
            self.epoch.elapsed().as_millis() as u32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;
    use std::time::Instant;

    fn host_tick() -> u32 {
        static EPOCH: OnceLock<Instant> = OnceLock::new();
        let elapsed = EPOCH.get_or_init(Instant::now).elapsed().as_millis();
        u32::try_from(elapsed).unwrap()
    }

    #[test]
    fn std_semaphore_counts_posts() {
        let osif = StdOsif::new();
        let sem = osif.semaphore_create(0);
        sem.post();
        sem.post();
        assert!(sem.wait(MillisDurationU32::from_ticks(0)).is_ok());
        assert!(sem.wait(MillisDurationU32::from_ticks(0)).is_ok());
        assert_eq!(sem.wait(MillisDurationU32::from_ticks(5)), Err(WaitTimeout));
    }

    #[test]
    fn std_semaphore_wakes_waiter_from_other_thread() {
        let osif = StdOsif::new();
        let sem = osif.semaphore_create(0);
        std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::sleep(std::time::Duration::from_millis(10));
                sem.post();
            });
            assert!(sem.wait(MillisDurationU32::from_ticks(2_000)).is_ok());
        });
    }

    #[test]
    fn drain_discards_stale_posts() {
        let sem = StdOsif::new().semaphore_create(3);
        sem.drain();
        assert!(sem.wait(MillisDurationU32::from_ticks(0)).is_err());
    }

    #[test]
    fn spin_semaphore_times_out_and_counts() {
        let osif = SpinOsif::new(host_tick);
        let sem = osif.semaphore_create(1);
        assert!(sem.wait(MillisDurationU32::from_ticks(0)).is_ok());
        let start = Instant::now();
        assert_eq!(sem.wait(MillisDurationU32::from_ticks(20)), Err(WaitTimeout));
        assert!(start.elapsed().as_millis() >= 19);
        sem.post();
        assert!(sem.wait(MillisDurationU32::from_ticks(20)).is_ok());
    }

    #[test]
    fn osif_mutex_serializes_updates() {
        let osif = StdOsif::new();
        let cell = OsifMutex::new(osif.mutex_create(), 0u32);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        cell.lock(|v| *v += 1);
                    }
                });
            }
        });
        assert_eq!(cell.lock(|v| *v), 4000);
    }
}
