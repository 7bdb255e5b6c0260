//! Process-wide meter handle.
//!
//! Optional convenience for hosts that cannot thread a [`Meter`] through
//! their call sites. Nothing else in this crate depends on it.

use std::sync::{PoisonError, RwLock};

use z_meter_core::{CallObservation, EventId};

use crate::error::ClientError;
use crate::meter::Meter;

static GLOBAL: RwLock<Option<Meter>> = RwLock::new(None);

/// Install `meter` as the global meter.
///
/// # Errors
///
/// Returns `ClientError::AlreadyInstalled` if one is already installed.
pub fn install(meter: Meter) -> Result<(), ClientError> {
    let mut slot = GLOBAL.write().unwrap_or_else(PoisonError::into_inner);
    if slot.is_some() {
        return Err(ClientError::AlreadyInstalled);
    }
    *slot = Some(meter);
    Ok(())
}

/// The global meter, if installed.
#[must_use]
pub fn get() -> Option<Meter> {
    GLOBAL.read().unwrap_or_else(PoisonError::into_inner).clone()
}

/// Remove and return the global meter, typically to shut it down.
pub fn take() -> Option<Meter> {
    GLOBAL.write().unwrap_or_else(PoisonError::into_inner).take()
}

/// Record through the global meter. Does nothing if none is installed.
pub fn record(observation: &CallObservation) -> Option<EventId> {
    get().and_then(|meter| meter.record(observation))
}
