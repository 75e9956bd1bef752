//! Self-recovery hook
//!
//! The receive path calls [`SelfRecovery::trigger`] when it detects state it
//! cannot continue from (descriptor corruption, a ring reporting an
//! unrecoverable error). The hook decides what happens next: the default
//! [`PanicRecovery`] panics, a supervisor may restart the device instead.
//! The datapath never retries past a trigger.

use std::sync::Mutex;

/// Reason passed to the recovery hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HangReason {
    /// Completion referenced a descriptor that is not in use or fails its
    /// sanity check
    RxDescCorruption,
    /// Completion ring reported an error status
    ReoRingError,
    /// Replenisher found a free descriptor already armed
    RefillCorruption,
}

impl std::fmt::Display for HangReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HangReason::RxDescCorruption => write!(f, "rx descriptor corruption"),
            HangReason::ReoRingError => write!(f, "reo ring error"),
            HangReason::RefillCorruption => write!(f, "refill descriptor corruption"),
        }
    }
}

/// Fatal-assert hook
pub trait SelfRecovery: Send + Sync {
    /// Called once per unrecoverable condition with the reporting location
    fn trigger(&self, reason: HangReason, func: &'static str, line: u32);

    /// Whether a recovery is in progress; workers stop polling meanwhile
    fn is_recovering(&self) -> bool {
        false
    }
}

/// Invoke `$hook.trigger` with the current module and line
#[macro_export]
macro_rules! trigger_self_recovery {
    ($hook:expr, $reason:expr) => {
        $hook.trigger($reason, module_path!(), line!())
    };
}

/// Default hook: panic
#[derive(Debug, Default)]
pub struct PanicRecovery;

impl SelfRecovery for PanicRecovery {
    fn trigger(&self, reason: HangReason, func: &'static str, line: u32) {
        panic!("self recovery triggered: {reason} at {func}:{line}");
    }
}

/// Hook that records triggers and reports recovery until cleared
#[derive(Debug, Default)]
pub struct RecordingRecovery {
    events: Mutex<Vec<(HangReason, &'static str, u32)>>,
}

impl RecordingRecovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<HangReason> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(reason, _, _)| *reason)
            .collect()
    }

    /// Recovery finished; resume normal operation
    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl SelfRecovery for RecordingRecovery {
    fn trigger(&self, reason: HangReason, func: &'static str, line: u32) {
        tracing::error!(%reason, func, line, "Self recovery triggered");
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((reason, func, line));
    }

    fn is_recovering(&self) -> bool {
        !self.events.lock().unwrap_or_else(|e| e.into_inner()).is_empty()
    }
}
