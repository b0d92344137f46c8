use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Atomic boolean with compare-and-set transitions.
#[derive(Debug, Default)]
pub struct Flag(AtomicBool);

impl Flag {
    pub const fn new() -> Self {
        Flag(AtomicBool::new(false))
    }

    /// Performs false -> true. Only the caller that flipped the flag gets `true`.
    pub fn set_if_unset(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Performs true -> false. Only the caller that flipped the flag gets `true`.
    pub fn unset_if_set(&self) -> bool {
        self.0
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// How widely capture windows exclude each other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionScope {
    /// One capture at a time in the whole process, whatever the resource kind.
    #[default]
    Process,
    /// Each scheduler only excludes its own windows.
    Sampler,
}

/// Shared exclusion token over the capture facility. Clones refer to the same
/// underlying flag; not reentrant.
#[derive(Debug, Clone, Default)]
pub struct CaptureGuard(Arc<Flag>);

impl CaptureGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self) -> bool {
        self.0.set_if_unset()
    }

    pub fn release(&self) {
        self.0.unset_if_set();
    }

    pub fn is_held(&self) -> bool {
        self.0.is_set()
    }

    /// The guard a scheduler should use: the shared one for
    /// [`ExclusionScope::Process`], a fresh private one otherwise.
    pub fn for_scope(&self, scope: ExclusionScope) -> CaptureGuard {
        match scope {
            ExclusionScope::Process => self.clone(),
            ExclusionScope::Sampler => CaptureGuard::new(),
        }
    }
}
