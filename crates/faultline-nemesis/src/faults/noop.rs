//! The fault that does nothing, for baseline runs.

use async_trait::async_trait;

use crate::context::FaultContext;
use crate::error::Result;
use crate::traits::{Fault, FaultStatus};

/// A fault with no effect.
#[derive(Debug, Clone, Copy, Default)]
pub struct Noop;

#[async_trait]
impl Fault for Noop {
    fn name(&self) -> &str {
        "none"
    }

    fn description(&self) -> &str {
        "Injects no faults"
    }

    async fn start(&self, _ctx: &FaultContext) -> Result<FaultStatus> {
        Ok(FaultStatus::Noop)
    }

    async fn stop(&self, _ctx: &FaultContext) -> Result<FaultStatus> {
        Ok(FaultStatus::Noop)
    }

    fn is_active(&self) -> bool {
        false
    }
}
