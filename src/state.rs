//! Packed gate state and the slot lock guarding its transitions.
//!
//! The whole lifecycle of a gate lives in a single `AtomicU8`:
//! - Bit 0: LOADED - The inner handler is installed (terminal)
//! - Bit 1: LOADING - An attempt is in flight
//! - Bit 2: LOCKED - The slot lock is held
//! - Bit 3: WAITING - At least one thread is parked on the slot lock
//! - Bits 4-7: EPOCH - Generation counter, bumped on every unlock
//!
//! LOADED is read without any locking, which gives loaded gates a lock-free
//! dispatch path. The slot lock only ever covers short synchronous sections
//! (check the state, join or start an attempt), never an `.await`, so parking
//! a contended thread through `parking_lot_core` is cheap and rare.

use core::mem;
use core::sync::atomic::{AtomicU8, Ordering};

use parking_lot_core::{DEFAULT_PARK_TOKEN, DEFAULT_UNPARK_TOKEN};

/// Observable lifecycle of a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
   /// No attempt in flight and none has succeeded yet.
   Unloaded,
   /// A factory invocation is in flight; callers wait on it.
   Loading,
   /// The inner handler is installed. Never left once entered.
   Loaded,
}

/// Atomic state word of a gate.
#[repr(transparent)]
pub(crate) struct GateLock(AtomicU8);

impl GateLock {
   const LOADED: u8 = 1;
   const LOADING: u8 = 2;
   const LOCKED: u8 = 4;
   const WAITING: u8 = 8;
   const EPOCH_1: u8 = 16;
   const EPOCH_MASK: u8 = !(Self::LOADED | Self::LOADING | Self::LOCKED | Self::WAITING);

   /// Spins attempted before parking on a held slot lock.
   const SPIN_LIMIT: u32 = 64;

   #[inline(always)]
   const fn next_epoch(current_state: u8) -> u8 {
      (current_state & Self::EPOCH_MASK).wrapping_add(Self::EPOCH_1) & Self::EPOCH_MASK
   }

   #[inline]
   pub(crate) const fn new() -> Self {
      Self(AtomicU8::new(0))
   }

   /// Checks the LOADED flag.
   ///
   /// Callers that go on to read the installed handler must pass `Acquire`.
   #[inline]
   pub(crate) fn is_loaded(&self, ordering: Ordering) -> bool {
      self.0.load(ordering) & Self::LOADED != 0
   }

   /// Snapshot of the lifecycle. May be stale by the time it is returned.
   pub(crate) fn snapshot(&self) -> GateState {
      let state = self.0.load(Ordering::Acquire);
      if state & Self::LOADED != 0 {
         GateState::Loaded
      } else if state & Self::LOADING != 0 {
         GateState::Loading
      } else {
         GateState::Unloaded
      }
   }

   #[inline]
   fn notify_all(&self) {
      // SAFETY: The address passed to unpark matches the one used by `park` in `wait`.
      unsafe {
         parking_lot_core::unpark_all(self.0.as_ptr() as usize, DEFAULT_UNPARK_TOKEN);
      }
   }

   /// Parks the current thread until the state word differs from `expected_state`.
   #[inline]
   fn wait(&self, expected_state: u8) {
      // SAFETY: See `notify_all`.
      unsafe {
         // park() validates before sleeping, so a wake-up between our load and
         // the park call is never lost.
         let _ = parking_lot_core::park(
            self.0.as_ptr() as usize,
            || self.0.load(Ordering::Acquire) == expected_state,
            || {},
            |_, _| {},
            DEFAULT_PARK_TOKEN,
            None,
         );
      }
   }

   /// One attempt at taking the slot lock.
   ///
   /// - `Ok(None)`: the gate is loaded, nothing to lock.
   /// - `Ok(Some(guard))`: lock acquired.
   /// - `Err(state)`: lock held elsewhere; `state` is what to wait on. WAITING is
   ///   only requested when `park` is set.
   #[inline]
   fn lock_step(&self, park: bool) -> Result<Option<SlotGuard<'_>>, u8> {
      loop {
         let current_state = self.0.load(Ordering::Relaxed);
         if current_state & Self::LOADED != 0 {
            return Ok(None);
         }

         if current_state & Self::LOCKED == 0 {
            match self.0.compare_exchange_weak(
               current_state,
               current_state | Self::LOCKED,
               Ordering::Acquire,
               Ordering::Relaxed,
            ) {
               Ok(_) => return Ok(Some(SlotGuard { state: self })),
               Err(_) => {
                  std::hint::spin_loop();
                  continue;
               }
            }
         }

         if park && current_state & Self::WAITING == 0 {
            let new_state = current_state | Self::WAITING;
            match self.0.compare_exchange_weak(
               current_state,
               new_state,
               Ordering::Relaxed,
               Ordering::Relaxed,
            ) {
               Ok(_) => return Err(new_state),
               Err(_) => {
                  std::hint::spin_loop();
                  continue;
               }
            }
         }
         return Err(current_state);
      }
   }

   /// Acquires the slot lock, spinning briefly and then parking.
   ///
   /// Returns `None` once the gate is loaded; loaded gates have no slot to guard.
   pub(crate) fn lock(&self) -> Option<SlotGuard<'_>> {
      for _ in 0..Self::SPIN_LIMIT {
         match self.lock_step(false) {
            Ok(guard) => return guard,
            Err(_) => std::hint::spin_loop(),
         }
      }
      loop {
         match self.lock_step(true) {
            Ok(guard) => return guard,
            Err(state) => self.wait(state),
         }
      }
   }

   /// Clears `clear`, sets `set`, releases LOCKED and bumps the epoch in one swap.
   #[inline]
   fn release(&self, clear: u8, set: u8) {
      let prev_state = self
         .0
         .fetch_update(Ordering::Release, Ordering::Relaxed, |current_state| {
            let flags = current_state & !(Self::EPOCH_MASK | Self::LOCKED | Self::WAITING | clear);
            Some(flags | set | Self::next_epoch(current_state))
         })
         .unwrap_or_else(|state| state);
      if prev_state & Self::WAITING != 0 {
         self.notify_all();
      }
   }
}

/// RAII guard over the slot lock.
///
/// Dropping it unlocks without touching LOADED/LOADING. [`SlotGuard::publish`]
/// and [`SlotGuard::reset`] end the in-flight attempt while unlocking.
pub(crate) struct SlotGuard<'a> {
   state: &'a GateLock,
}

impl SlotGuard<'_> {
   /// Marks an attempt as in flight. The lock stays held.
   #[inline]
   pub(crate) fn begin_loading(&self) {
      self.state.0.fetch_or(GateLock::LOADING, Ordering::Relaxed);
   }

   /// Sets LOADED, clears LOADING and unlocks.
   ///
   /// Everything written before this call (the installed handler) happens-before
   /// any `Acquire` observation of LOADED.
   #[inline]
   pub(crate) fn publish(self) {
      self.state.release(GateLock::LOADING, GateLock::LOADED);
      mem::forget(self);
   }

   /// Clears LOADING and unlocks, returning the gate to `Unloaded`.
   #[inline]
   pub(crate) fn reset(self) {
      self.state.release(GateLock::LOADING, 0);
      mem::forget(self);
   }
}

impl Drop for SlotGuard<'_> {
   #[inline]
   fn drop(&mut self) {
      self.state.release(0, 0);
   }
}
