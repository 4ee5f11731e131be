//! The steppable contract and shared unit handles.
//!
//! A unit is anything that can advance by one cycle. The scheduler only ever
//! sees units through [`UnitHandle`], which pairs a stable [`UnitId`] with the
//! unit's exclusive lock. The same lock serializes advancing, recording and
//! restoring that unit.

use crate::id::UnitId;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Steppable
// ---------------------------------------------------------------------------

/// A unit that advances by one cycle per call.
pub trait Steppable: Send {
    /// Advance by one cycle. `Ok(false)` asks to be taken out of future
    /// rounds; `Ok(true)` keeps the unit scheduled.
    fn step(&mut self) -> Result<bool, StepError>;
}

/// Errors raised by a unit while advancing.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StepError {
    /// A model behavior failed.
    #[error("behavior `{behavior}` failed at cycle {cycle}: {reason}")]
    Behavior {
        behavior: String,
        cycle: u64,
        reason: String,
    },
    #[error("{0}")]
    Message(String),
}

impl StepError {
    pub fn msg(reason: impl Into<String>) -> Self {
        StepError::Message(reason.into())
    }
}

// ---------------------------------------------------------------------------
// UnitHandle
// ---------------------------------------------------------------------------

/// A shared, lockable unit.
#[derive(Debug)]
pub struct UnitHandle<S> {
    id: UnitId,
    inner: Arc<Mutex<S>>,
}

impl<S> Clone for UnitHandle<S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> UnitHandle<S> {
    /// Wrap `unit` under a freshly allocated id.
    pub fn new(unit: S) -> Self {
        Self {
            id: UnitId::next(),
            inner: Arc::new(Mutex::new(unit)),
        }
    }

    pub fn id(&self) -> UnitId {
        self.id
    }

    /// Take the unit's exclusive lock.
    pub fn lock(&self) -> MutexGuard<'_, S> {
        self.inner.lock()
    }
}

impl<S: Steppable> UnitHandle<S> {
    /// Advance the unit by one cycle under its lock.
    pub fn advance(&self) -> Result<bool, StepError> {
        self.inner.lock().step()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Countdown(u32);

    impl Steppable for Countdown {
        fn step(&mut self) -> Result<bool, StepError> {
            match self.0 {
                0 => Err(StepError::msg("already finished")),
                n => {
                    self.0 = n - 1;
                    Ok(self.0 > 0)
                }
            }
        }
    }

    #[test]
    fn advance_reports_halt_and_errors() {
        let unit = UnitHandle::new(Countdown(2));
        assert_eq!(unit.advance(), Ok(true));
        assert_eq!(unit.advance(), Ok(false));
        assert_eq!(unit.advance(), Err(StepError::msg("already finished")));
    }

    #[test]
    fn clones_share_state_and_id() {
        let a = UnitHandle::new(Countdown(5));
        let b = a.clone();
        b.advance().unwrap();
        assert_eq!(a.lock().0, 4);
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), UnitHandle::new(Countdown(1)).id());
    }

    #[test]
    fn behavior_error_display() {
        let e = StepError::Behavior {
            behavior: "forage".into(),
            cycle: 12,
            reason: "no food".into(),
        };
        assert_eq!(e.to_string(), "behavior `forage` failed at cycle 12: no food");
    }
}
