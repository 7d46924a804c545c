// src/printer/context.rs - Admission-controlled handles for submitting commands
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard};

use super::{CommandHandle, PrinterError, Response, Session};
use crate::gcode::Instruction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContextOptions {
    /// Only one exclusive context may exist at a time, and never alongside
    /// concurrent ones.
    pub exclusive: bool,
    pub disable_bed_level: bool,
    pub disable_backlash: bool,
    pub disable_feed_rate_conversion: bool,
}

impl ContextOptions {
    pub fn exclusive() -> Self {
        Self { exclusive: true, ..Self::default() }
    }

    pub fn concurrent() -> Self {
        Self::default()
    }

    /// Concurrent and transparent: nothing is rewritten.
    pub fn raw() -> Self {
        Self {
            exclusive: false,
            disable_bed_level: true,
            disable_backlash: true,
            disable_feed_rate_conversion: true,
        }
    }

    pub fn without_compensation(self) -> Self {
        Self { disable_bed_level: true, disable_backlash: true, ..self }
    }
}

/// The admission lock guard a context holds until it is invalidated.
pub(crate) struct Admission {
    exclusive: bool,
    _write: Option<OwnedRwLockWriteGuard<()>>,
    _read: Option<OwnedRwLockReadGuard<()>>,
}

impl Admission {
    pub(crate) fn exclusive(guard: OwnedRwLockWriteGuard<()>) -> Self {
        Self { exclusive: true, _write: Some(guard), _read: None }
    }

    pub(crate) fn concurrent(guard: OwnedRwLockReadGuard<()>) -> Self {
        Self { exclusive: false, _write: None, _read: Some(guard) }
    }
}

/// Authorisation to submit commands under a fixed option set.
///
/// Holds only a weak reference to the printer. After [`Context::invalidate`]
/// nothing new is accepted, while commands already submitted still complete.
pub struct Context {
    id: u64,
    session: Weak<Session>,
    options: ContextOptions,
    admission: Mutex<Option<Admission>>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("options", &self.options)
            .field("valid", &self.is_valid())
            .finish()
    }
}

impl Context {
    pub(crate) fn new(id: u64, session: Weak<Session>, options: ContextOptions, admission: Admission) -> Self {
        Self { id, session, options, admission: Mutex::new(Some(admission)) }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn options(&self) -> ContextOptions {
        self.options
    }

    pub fn is_valid(&self) -> bool {
        self.admission.lock().map(|slot| slot.is_some()).unwrap_or(false)
    }

    /// Release admission. Safe to call more than once.
    pub fn invalidate(&self) {
        let released = match self.admission.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(admission) = released {
            let kind = if admission.exclusive { "exclusive" } else { "concurrent" };
            tracing::debug!("Context {} ({}) invalidated", self.id, kind);
        }
    }

    pub(crate) fn session(&self) -> Result<Arc<Session>, PrinterError> {
        if !self.is_valid() {
            return Err(PrinterError::ContextInvalidated);
        }
        self.session.upgrade().ok_or(PrinterError::Disconnected)
    }

    /// Queue one instruction. The returned handle completes once the
    /// printer has confirmed every line it expanded into.
    ///
    /// Submission runs on its own task, so a caller that stops waiting (a
    /// `select!` or timeout) never leaves a line half written: the line still
    /// goes out under its number and the next one gets the following number.
    pub async fn send(&self, code: Instruction) -> Result<CommandHandle, PrinterError> {
        let session = self.session()?;
        let options = self.options;
        tokio::spawn(async move { session.submit_through(&options, code).await })
            .await
            .map_err(|_| PrinterError::Cancelled)?
    }

    /// Send and wait for the confirmation.
    pub async fn execute(&self, code: Instruction) -> Result<Response, PrinterError> {
        self.send(code).await?.wait().await
    }

    /// Queue all instructions, then wait for all of them.
    pub async fn execute_all(&self, codes: impl IntoIterator<Item = Instruction>) -> Result<(), PrinterError> {
        let mut handles = Vec::new();
        for code in codes {
            handles.push(self.send(code).await?);
        }
        for handle in handles {
            handle.wait().await?;
        }
        Ok(())
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.invalidate();
    }
}
