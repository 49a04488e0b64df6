//! Minimal OS contract and internal synchronization primitives
//!
//! The driver needs three things from its environment: fixed delays for bus
//! timing sequences, a yield point for the spots where a command blocks, and
//! a critical section (supplied separately by the `critical-section` crate).
//! Everything else is built here: a one-shot, single-waiter notification
//! slot used by the blocking DISABLE and HALT commands, and the mutex that
//! serializes port commands.

use crate::error::{HcdError, Result};
use core::marker::PhantomData;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Timing and scheduling services the platform must provide
///
/// On a bare-metal target `yield_now` can simply be a spin hint; under an
/// RTOS it should yield to the scheduler so the interrupt dispatcher's task
/// context can run.
pub trait HostOs {
    /// Block the calling task for at least `ms` milliseconds
    fn delay_ms(ms: u32);
    /// Busy-wait for at least `us` microseconds
    fn delay_us(us: u32);
    /// Give other tasks a chance to run while spinning on a wait
    fn yield_now();
}

const SLOT_IDLE: u8 = 0;
const SLOT_ARMED: u8 = 1;
const SLOT_SIGNALED: u8 = 2;

/// One-shot notification slot with at most one waiter
///
/// A command arms the slot while holding the critical section, releases the
/// section, and blocks on the returned [`Waiter`]. The interrupt dispatcher
/// signals the slot (also under the critical section), which guarantees the
/// woken command observes exactly the state the dispatcher left behind.
///
/// Arming an already armed slot is a caller bug and is reported as an
/// error rather than silently queueing a second waiter.
pub struct EventSlot {
    state: AtomicU8,
}

impl EventSlot {
    /// An idle slot
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(SLOT_IDLE),
        }
    }

    /// Register the calling task as the slot's single waiter
    ///
    /// Must be called before the operation that will cause the wake is
    /// started, under the same critical section.
    pub fn arm(&self) -> Result<Waiter<'_>> {
        self.state
            .compare_exchange(SLOT_IDLE, SLOT_ARMED, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| HcdError::InvalidState)?;
        Ok(Waiter { slot: self })
    }

    /// Wake the registered waiter; returns `false` if nobody was waiting
    pub fn notify(&self) -> bool {
        self.state
            .compare_exchange(SLOT_ARMED, SLOT_SIGNALED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether a waiter is currently registered
    pub fn is_armed(&self) -> bool {
        self.state.load(Ordering::Acquire) == SLOT_ARMED
    }
}

impl Default for EventSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Token proving the holder is the slot's registered waiter
///
/// Consumed by [`Waiter::wait`]; dropping it without waiting disarms the
/// slot.
#[must_use]
pub struct Waiter<'a> {
    slot: &'a EventSlot,
}

impl Waiter<'_> {
    /// Block until the slot is signaled
    ///
    /// Must be called without the critical section held.
    pub fn wait<O: HostOs>(self) {
        while self.slot.state.load(Ordering::Acquire) != SLOT_SIGNALED {
            O::yield_now();
        }
        // Drop resets the slot to idle
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        self.slot.state.store(SLOT_IDLE, Ordering::Release);
    }
}

/// Mutex serializing commands, one per port
///
/// Plain spin acquisition with an OS yield; port commands are rare and
/// short-held, contention means another task is mid-command.
pub struct CommandMutex {
    locked: AtomicBool,
}

impl CommandMutex {
    /// An unlocked mutex
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Acquire, yielding while another task holds the mutex
    pub fn lock<O: HostOs>(&self) -> CommandGuard<'_> {
        while self.locked.swap(true, Ordering::Acquire) {
            O::yield_now();
        }
        CommandGuard {
            mutex: self,
            _not_send: PhantomData,
        }
    }
}

impl Default for CommandMutex {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped ownership of a [`CommandMutex`]; released on drop
pub struct CommandGuard<'a> {
    mutex: &'a CommandMutex,
    _not_send: PhantomData<*const ()>,
}

impl Drop for CommandGuard<'_> {
    fn drop(&mut self) {
        self.mutex.locked.store(false, Ordering::Release);
    }
}
