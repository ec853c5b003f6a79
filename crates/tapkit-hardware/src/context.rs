//! Exclusive ownership of the RF front-end.
//!
//! There is one transceiver per device and only one user may drive it at a
//! time. [`HardwareContext`] owns it; [`HardwareContext::try_acquire`] moves
//! it into a [`TransceiverLease`] and the lease puts it back when released
//! or dropped.
//!
//! # Examples
//!
//! ```
//! use tapkit_hardware::context::HardwareContext;
//! use tapkit_hardware::mock::MockTransceiver;
//! use tapkit_hardware::HardwareError;
//!
//! let (transceiver, _handle) = MockTransceiver::new();
//! let context = HardwareContext::new(transceiver);
//!
//! let lease = context.try_acquire().unwrap();
//! assert!(matches!(context.try_acquire(), Err(HardwareError::Busy)));
//!
//! lease.release();
//! assert!(context.is_available());
//! ```

use crate::error::{HardwareError, Result};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Shared owner of one transceiver. Cloning shares the same device.
#[derive(Debug)]
pub struct HardwareContext<T> {
    slot: Arc<Mutex<Option<T>>>,
}

impl<T> Clone for HardwareContext<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> HardwareContext<T> {
    pub fn new(transceiver: T) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(transceiver))),
        }
    }

    /// Take exclusive use of the transceiver.
    ///
    /// # Errors
    /// Returns `HardwareError::Busy` while another lease is alive.
    pub fn try_acquire(&self) -> Result<TransceiverLease<T>> {
        let transceiver = lock(&self.slot).take().ok_or(HardwareError::Busy)?;
        debug!("Transceiver acquired");
        Ok(TransceiverLease {
            transceiver: Some(transceiver),
            slot: Arc::clone(&self.slot),
        })
    }

    /// Whether no lease is alive.
    pub fn is_available(&self) -> bool {
        lock(&self.slot).is_some()
    }
}

fn lock<T>(slot: &Mutex<Option<T>>) -> MutexGuard<'_, Option<T>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Exclusive use of the transceiver. Dereferences to it.
#[derive(Debug)]
pub struct TransceiverLease<T> {
    transceiver: Option<T>,
    slot: Arc<Mutex<Option<T>>>,
}

impl<T> TransceiverLease<T> {
    /// Give the transceiver back to its context.
    pub fn release(self) {
        drop(self);
    }
}

impl<T> Deref for TransceiverLease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.transceiver {
            Some(transceiver) => transceiver,
            None => unreachable!("transceiver is only taken on drop"),
        }
    }
}

impl<T> DerefMut for TransceiverLease<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.transceiver {
            Some(transceiver) => transceiver,
            None => unreachable!("transceiver is only taken on drop"),
        }
    }
}

impl<T> Drop for TransceiverLease<T> {
    fn drop(&mut self) {
        if let Some(transceiver) = self.transceiver.take() {
            *lock(&self.slot) = Some(transceiver);
            debug!("Transceiver released");
        }
    }
}
