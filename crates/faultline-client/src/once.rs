//! Run-scoped "exactly once" flags.
//!
//! Every process calls `setup` and `teardown`, but the schema must be created
//! and dropped only once per cluster. The flags live in a [`SetupGuard`] that
//! is created per run and cloned into every process's client.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A flag that can be claimed exactly once.
#[derive(Debug, Default)]
pub struct OnceFlag(AtomicBool);

impl OnceFlag {
    /// Creates an unclaimed flag.
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Claims the flag. Returns true for exactly one caller.
    pub fn try_claim(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Returns whether the flag has been claimed.
    pub fn is_claimed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Setup and teardown flags shared by every process of one run.
#[derive(Debug, Clone, Default)]
pub struct SetupGuard {
    setup: Arc<OnceFlag>,
    teardown: Arc<OnceFlag>,
}

impl SetupGuard {
    /// Creates a fresh guard for a new run.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the right to run setup.
    pub fn claim_setup(&self) -> bool {
        self.setup.try_claim()
    }

    /// Claims the right to run teardown.
    pub fn claim_teardown(&self) -> bool {
        self.teardown.try_claim()
    }

    /// Returns whether setup has been claimed.
    pub fn setup_claimed(&self) -> bool {
        self.setup.is_claimed()
    }
}
