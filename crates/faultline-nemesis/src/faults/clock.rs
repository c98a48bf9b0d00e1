//! Clock skew faults.
//!
//! Bumps shift the wall clock of a random subset of nodes by a random number
//! of milliseconds. Small shifts are far more likely than large ones: the
//! magnitude is `2^x` for `x` uniform in `[2, log2(max)]`, so the maximum is
//! only reached in the tail. The accumulated offset of every node is tracked
//! and kept within `[-max, max]`, which bounds each applied bump as well.
//! A reset resynchronizes the clocks of every node and drives the tracked
//! offsets to zero.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use faultline_core::NodeId;
use rand::Rng;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::context::FaultContext;
use crate::error::Result;
use crate::traits::{Fault, FaultStatus};

/// Clock state of the nodes as far as the fault knows it.
#[derive(Debug, Default)]
struct Ledger {
    /// Confirmed offset per node, in milliseconds.
    offsets: BTreeMap<NodeId, i64>,
    /// Nodes whose last clock command did not confirm. Their offset is
    /// unknown until the next successful reset.
    unsure: BTreeSet<NodeId>,
}

impl Ledger {
    fn offset(&self, node: &NodeId) -> i64 {
        self.offsets.get(node).copied().unwrap_or(0)
    }

    fn is_skewed(&self) -> bool {
        !self.unsure.is_empty() || self.offsets.values().any(|v| *v != 0)
    }
}

type Offsets = Arc<Mutex<Ledger>>;

/// Named maximum skews.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkewLevel {
    /// Up to 100 ms.
    Small,
    /// Up to 250 ms.
    Medium,
    /// Up to 500 ms.
    Large,
    /// Up to 1000 ms.
    XLarge,
}

impl SkewLevel {
    /// All levels, smallest first.
    pub const ALL: [SkewLevel; 4] = [
        SkewLevel::Small,
        SkewLevel::Medium,
        SkewLevel::Large,
        SkewLevel::XLarge,
    ];

    /// Returns the maximum skew in milliseconds.
    pub fn max_skew_ms(&self) -> u64 {
        match self {
            SkewLevel::Small => 100,
            SkewLevel::Medium => 250,
            SkewLevel::Large => 500,
            SkewLevel::XLarge => 1000,
        }
    }

    /// Returns the registry name.
    pub fn name(&self) -> &'static str {
        match self {
            SkewLevel::Small => "small-skew",
            SkewLevel::Medium => "medium-skew",
            SkewLevel::Large => "large-skew",
            SkewLevel::XLarge => "xlarge-skew",
        }
    }
}

/// Draws a signed skew in `[-max_ms, max_ms]`, small magnitudes first.
pub fn sample_skew<R: Rng + ?Sized>(rng: &mut R, max_ms: u64) -> i64 {
    if max_ms == 0 {
        return 0;
    }
    let max = max_ms as f64;
    let hi = max.log2();
    let lo = hi.min(2.0);
    let exponent = rng.gen_range(lo..=hi);
    let magnitude = (2f64.powf(exponent).round() as i64).clamp(1, max_ms as i64);
    if rng.gen_bool(0.5) { magnitude } else { -magnitude }
}

/// Shifts the clocks of a random node subset.
///
/// Bumps accumulate: starting an already skewed fault bumps again, keeping
/// every node's total offset within the maximum.
#[derive(Debug)]
pub struct ClockBump {
    max_skew_ms: u64,
    offsets: Offsets,
}

impl ClockBump {
    /// Creates a bump fault with its own offset ledger.
    pub fn new(max_skew_ms: u64) -> Self {
        Self::sharing(max_skew_ms, Offsets::default())
    }

    fn sharing(max_skew_ms: u64, offsets: Offsets) -> Self {
        Self {
            max_skew_ms,
            offsets,
        }
    }

    /// Returns the maximum skew in milliseconds.
    pub fn max_skew_ms(&self) -> u64 {
        self.max_skew_ms
    }

    /// Returns the tracked offset of a node.
    pub async fn offset(&self, node: &NodeId) -> i64 {
        self.offsets.lock().await.offset(node)
    }
}

#[async_trait]
impl Fault for ClockBump {
    fn name(&self) -> &str {
        "clock-bump"
    }

    fn description(&self) -> &str {
        "Shifts the wall clock of random nodes"
    }

    async fn start(&self, ctx: &FaultContext) -> Result<FaultStatus> {
        let mut ledger = self.offsets.lock().await;
        let targets = ctx.random_subset()?;
        let max = self.max_skew_ms as i64;

        let mut applied = Map::new();
        let mut failures = Vec::new();
        for node in &targets {
            let delta = ctx.with_rng(|rng| sample_skew(rng, self.max_skew_ms));
            let current = ledger.offset(node);
            let next = (current + delta).clamp(-max, max);
            let step = next - current;

            info!(node = %node, delta_ms = step, offset_ms = next, "Bumping clock");
            // Stays marked if the call fails or is cancelled midway.
            ledger.unsure.insert(node.clone());
            match ctx.controller().bump_clock(node, step).await {
                Ok(()) => {
                    ledger.offsets.insert(node.clone(), next);
                    ledger.unsure.remove(node);
                    applied.insert(node.to_string(), Value::from(step));
                }
                Err(e) => {
                    warn!(node = %node, error = %e, "Failed to bump clock");
                    failures.push(e.to_string());
                }
            }
        }

        Ok(FaultStatus::applied_with(targets, Value::Object(applied), failures))
    }

    async fn stop(&self, ctx: &FaultContext) -> Result<FaultStatus> {
        ClockReset::sharing(self.offsets.clone()).reset_all(ctx).await
    }

    fn is_active(&self) -> bool {
        self.offsets.try_lock().map_or(true, |l| l.is_skewed())
    }
}

/// Resynchronizes the clocks of every node.
#[derive(Debug)]
pub struct ClockReset {
    offsets: Offsets,
}

impl Default for ClockReset {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockReset {
    /// Creates a reset fault with its own offset ledger.
    pub fn new() -> Self {
        Self::sharing(Offsets::default())
    }

    fn sharing(offsets: Offsets) -> Self {
        Self { offsets }
    }

    async fn reset_nodes(&self, ctx: &FaultContext, nodes: &[NodeId]) -> Vec<String> {
        let mut ledger = self.offsets.lock().await;
        let mut failures = Vec::new();
        for node in nodes {
            info!(node = %node, "Resetting clock");
            ledger.unsure.insert(node.clone());
            match ctx.controller().reset_clock(node).await {
                Ok(()) => {
                    ledger.offsets.insert(node.clone(), 0);
                    ledger.unsure.remove(node);
                }
                Err(e) => {
                    warn!(node = %node, error = %e, "Failed to reset clock");
                    failures.push(e.to_string());
                }
            }
        }
        failures
    }

    /// Resets every node. Reports `NotActive` when nothing was known to be
    /// skewed beforehand.
    async fn reset_all(&self, ctx: &FaultContext) -> Result<FaultStatus> {
        let was_skewed = self.offsets.lock().await.is_skewed();
        let failures = self.reset_nodes(ctx, ctx.nodes()).await;
        if !was_skewed && failures.is_empty() {
            debug!("No clock skew to reset");
            return Ok(FaultStatus::NotActive);
        }
        Ok(FaultStatus::recovered(ctx.nodes().to_vec(), failures))
    }
}

#[async_trait]
impl Fault for ClockReset {
    fn name(&self) -> &str {
        "clock-reset"
    }

    fn description(&self) -> &str {
        "Resynchronizes the wall clock of every node"
    }

    async fn start(&self, ctx: &FaultContext) -> Result<FaultStatus> {
        let failures = self.reset_nodes(ctx, ctx.nodes()).await;
        Ok(FaultStatus::applied_with(ctx.nodes().to_vec(), Value::Null, failures))
    }

    async fn stop(&self, _ctx: &FaultContext) -> Result<FaultStatus> {
        Ok(FaultStatus::Noop)
    }

    fn is_active(&self) -> bool {
        false
    }
}

/// The clock nemesis: `start` bumps, `stop` resets what was bumped.
#[derive(Debug)]
pub struct ClockSkew {
    level: SkewLevel,
    bump: ClockBump,
    reset: ClockReset,
}

impl ClockSkew {
    /// Creates the clock nemesis for a skew level.
    pub fn new(level: SkewLevel) -> Self {
        let offsets = Offsets::default();
        Self {
            level,
            bump: ClockBump::sharing(level.max_skew_ms(), offsets.clone()),
            reset: ClockReset::sharing(offsets),
        }
    }

    /// Returns the skew level.
    pub fn level(&self) -> SkewLevel {
        self.level
    }

    /// Returns the tracked offset of a node.
    pub async fn offset(&self, node: &NodeId) -> i64 {
        self.bump.offset(node).await
    }
}

#[async_trait]
impl Fault for ClockSkew {
    fn name(&self) -> &str {
        self.level.name()
    }

    fn description(&self) -> &str {
        "Randomly bumps and resets node clocks"
    }

    async fn start(&self, ctx: &FaultContext) -> Result<FaultStatus> {
        self.bump.start(ctx).await
    }

    async fn stop(&self, ctx: &FaultContext) -> Result<FaultStatus> {
        self.reset.reset_all(ctx).await
    }

    fn is_active(&self) -> bool {
        self.bump.is_active()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::dry_context;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_sample_skew_bounds() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        for level in SkewLevel::ALL {
            let max = level.max_skew_ms() as i64;
            for _ in 0..2000 {
                let skew = sample_skew(&mut rng, level.max_skew_ms());
                assert!(skew != 0 && skew.abs() <= max, "{skew} out of bounds for {max}");
            }
        }
        assert_eq!(sample_skew(&mut rng, 0), 0);
        assert_eq!(sample_skew(&mut rng, 1).abs(), 1);
    }

    #[test]
    fn test_sample_skew_favors_small_values() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let samples: Vec<i64> = (0..4000).map(|_| sample_skew(&mut rng, 1000).abs()).collect();
        let small = samples.iter().filter(|s| **s <= 100).count();
        let large = samples.iter().filter(|s| **s > 500).count();
        assert!(small > large * 2, "small={small} large={large}");
        assert!(samples.iter().any(|s| *s > 500));
    }

    #[tokio::test]
    async fn test_bumps_stay_within_max() {
        let (ctl, ctx) = dry_context(&["n1", "n2", "n3", "n4", "n5"]);
        let fault = ClockSkew::new(SkewLevel::Small);

        for _ in 0..100 {
            let status = fault.start(&ctx).await.unwrap();
            let FaultStatus::Applied { detail, .. } = status else {
                panic!("unexpected status {status:?}");
            };
            for applied in detail.as_object().unwrap().values() {
                assert!(applied.as_i64().unwrap().abs() <= 100);
            }
            for node in ctx.nodes() {
                assert!(ctl.clock_offset(node).abs() <= 100);
                assert_eq!(ctl.clock_offset(node), fault.offset(node).await);
            }
        }
        assert!(fault.is_active());
    }

    #[tokio::test]
    async fn test_reset_drives_skew_to_zero() {
        let (ctl, ctx) = dry_context(&["n1", "n2", "n3"]);
        let fault = ClockSkew::new(SkewLevel::Large);

        let status = fault.start(&ctx).await.unwrap();
        let bumped = status.targets().to_vec();
        assert!(!bumped.is_empty());

        let status = fault.stop(&ctx).await.unwrap();
        assert!(matches!(status, FaultStatus::Recovered { .. }));
        for node in ctx.nodes() {
            assert_eq!(ctl.clock_offset(node), 0);
            assert_eq!(fault.offset(node).await, 0);
        }
        assert!(!fault.is_active());
        assert_eq!(fault.stop(&ctx).await.unwrap(), FaultStatus::NotActive);
    }

    #[tokio::test]
    async fn test_reset_covers_nodes_with_failed_bumps() {
        let (ctl, ctx) = dry_context(&["n1", "n2", "n3"]);
        for node in ctx.nodes() {
            ctl.fail_next(node, "bump_clock", 1);
        }
        let fault = ClockSkew::new(SkewLevel::Medium);

        let status = fault.start(&ctx).await.unwrap();
        assert!(matches!(status, FaultStatus::Partial { .. }));
        // Nothing confirmed, but the outcome of the bumps is unknown.
        assert!(fault.is_active());

        let status = fault.stop(&ctx).await.unwrap();
        assert_eq!(status, FaultStatus::Recovered { targets: ctx.nodes().to_vec() });
        assert_eq!(ctl.calls_for("reset_clock").len(), 3);
        for node in ctx.nodes() {
            assert_eq!(ctl.clock_offset(node), 0);
        }
        assert!(!fault.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_bump_is_reset() {
        let (ctl, ctx) = crate::testing::hanging_context(&["n1", "n2", "n3"], "bump_clock");
        let fault = ClockSkew::new(SkewLevel::XLarge);

        let cut = tokio::time::timeout(std::time::Duration::from_secs(1), fault.start(&ctx)).await;
        assert!(cut.is_err());
        assert!(fault.is_active());

        fault.stop(&ctx).await.unwrap();
        for node in ctx.nodes() {
            assert_eq!(ctl.clock_offset(node), 0);
        }
        assert!(!fault.is_active());
    }

    #[tokio::test]
    async fn test_failed_reset_is_retried() {
        let (ctl, ctx) = dry_context(&["n1"]);
        let n1 = NodeId::from("n1");
        let fault = ClockSkew::new(SkewLevel::Small);
        fault.start(&ctx).await.unwrap();

        ctl.fail_next(&n1, "reset_clock", 1);
        let status = fault.stop(&ctx).await.unwrap();
        assert!(matches!(status, FaultStatus::Partial { .. }));
        assert!(fault.is_active());

        let status = fault.stop(&ctx).await.unwrap();
        assert!(matches!(status, FaultStatus::Recovered { .. }));
        assert_eq!(ctl.clock_offset(&n1), 0);
    }

    #[tokio::test]
    async fn test_clock_reset_fault_resets_every_node() {
        let (ctl, ctx) = dry_context(&["n1", "n2"]);
        let fault = ClockReset::new();
        let status = fault.start(&ctx).await.unwrap();
        assert_eq!(status.targets().len(), 2);
        assert_eq!(ctl.calls_for("reset_clock").len(), 2);
        assert_eq!(fault.stop(&ctx).await.unwrap(), FaultStatus::Noop);
    }

    #[tokio::test]
    async fn test_standalone_bump_resets_on_stop() {
        let (ctl, ctx) = dry_context(&["n1"]);
        let fault = ClockBump::new(250);
        fault.start(&ctx).await.unwrap();
        assert_ne!(ctl.clock_offset(&NodeId::from("n1")), 0);
        fault.stop(&ctx).await.unwrap();
        assert_eq!(ctl.clock_offset(&NodeId::from("n1")), 0);
    }
}
