//! End-to-end reconciliation scenarios.
//!
//! Drives a `Reconciler` against the in-memory driver, probe board and
//! metric registry, tick by tick, checking fleet invariants after every
//! tick.

use std::sync::Arc;

use fleetgrid_health::{HealthConfig, ProbeBoard, ProbeStatus};
use fleetgrid_metrics::{MetricScope, MetricsRegistry};
use fleetgrid_reconcile::*;
use fleetgrid_rollout::*;
use fleetgrid_state::*;

struct Fleet {
    rec: Reconciler,
    driver: Arc<SimDriver>,
    probes: Arc<ProbeBoard>,
    metrics: Arc<MetricsRegistry>,
}

impl Fleet {
    fn new(desired: u32, max: u32) -> Self {
        Self::with_config(desired, max, ReconcilerConfig {
            max_attempts: 1,
            ..Default::default()
        })
    }

    fn with_config(desired: u32, max: u32, config: ReconcilerConfig) -> Self {
        let probes = Arc::new(ProbeBoard::default());
        let driver = Arc::new(SimDriver::with_probes(probes.clone()));
        let metrics = Arc::new(MetricsRegistry::default());
        let state = FleetState::new("v1", 1, max, desired).unwrap();
        let rec = Reconciler::new(state, metrics.clone(), probes.clone(), driver.clone(), config);
        Self {
            rec,
            driver,
            probes,
            metrics,
        }
    }

    /// Provision the stable cohort and let it become ready.
    async fn bootstrap(mut self) -> Self {
        self.tick(0).await;
        self.tick(5).await;
        assert_eq!(
            self.rec.state().ready_of_version("v1"),
            self.rec.state().desired_capacity
        );
        self
    }

    async fn tick(&mut self, now: Timestamp) -> TickReport {
        let report = self.rec.tick(now).await;
        assert_eq!(report.conflict, None, "tick at {now} rejected its plan");
        self.assert_invariants();
        report
    }

    fn assert_invariants(&self) {
        let state = self.rec.state();
        assert!(state.min_capacity <= state.desired_capacity);
        assert!(state.desired_capacity <= state.max_capacity);
        let cohorts = state
            .active_rollout
            .as_ref()
            .map(|id| &self.rec.rollout(id).unwrap().cohorts);
        if let Some(cohorts) = cohorts {
            assert_eq!(cohorts.total_weight(), 100);
        }
        check_invariants(state, cohorts).unwrap();
    }

    fn phase(&self, id: &str) -> RolloutPhase {
        self.rec.rollout(id).unwrap().phase.clone()
    }

    fn weight(&self, version: &str) -> u8 {
        self.driver.weights().get(version).copied().unwrap_or(0)
    }
}

fn blue_green(drain_window_secs: u64) -> RolloutStrategy {
    RolloutStrategy::BlueGreen(BlueGreenConfig {
        drain_window_secs,
        ..Default::default()
    })
}

fn canary() -> RolloutStrategy {
    canary_strategy(vec![25, 100])
}

fn canary_strategy(steps: Vec<u8>) -> RolloutStrategy {
    RolloutStrategy::Canary(CanaryConfig {
        steps,
        canary_instances: 1,
        bake_secs: 60,
        thresholds: vec![MetricThreshold::new("error_rate", 5.0)],
        ..Default::default()
    })
}

// ── Autoscaling ───────────────────────────────────────────────────

#[tokio::test]
async fn sustained_load_reaches_four_over_successive_samples() {
    let mut fleet = Fleet::new(2, 6).bootstrap().await;
    fleet
        .rec
        .set_policy(Some(ScalingPolicy::target_tracking("cpu", 70.0).with_cooldown(60)))
        .unwrap();

    // One sample takes 2 to 3; the next outside the cooldown takes 3 to 4.
    let mut sizes = Vec::new();
    for t in [100, 130, 160] {
        fleet.metrics.record("cpu", MetricScope::Fleet, 90.0, t);
        fleet.tick(t).await;
        sizes.push(fleet.rec.state().desired_capacity);
    }
    assert_eq!(sizes, [3, 3, 4]);

    assert_eq!(fleet.rec.state().desired_capacity, 4);
    assert_eq!(fleet.driver.running_of("v1"), 4);
    assert_eq!(fleet.rec.state().last_scale_action, Some(160));
}

#[tokio::test]
async fn cooldown_suppresses_second_scale_out() {
    let mut fleet = Fleet::new(2, 6).bootstrap().await;
    fleet
        .rec
        .set_policy(Some(ScalingPolicy::target_tracking("cpu", 70.0).with_cooldown(300)))
        .unwrap();

    fleet.metrics.record("cpu", MetricScope::Fleet, 90.0, 100);
    let first = fleet.tick(100).await;
    assert_eq!(first.scaling.map(|d| d.delta), Some(1));

    fleet.metrics.record("cpu", MetricScope::Fleet, 92.0, 150);
    let second = fleet.tick(150).await;
    let decision = second.scaling.unwrap();
    assert!(decision.is_noop());
    assert!(matches!(decision.reason, fleetgrid_autoscale::ScaleReason::Cooldown { .. }));
    assert_eq!(fleet.rec.state().desired_capacity, 3);
}

#[tokio::test]
async fn emergency_ceiling_overrides_cooldown() {
    let mut fleet = Fleet::new(2, 6).bootstrap().await;
    fleet
        .rec
        .set_policy(Some(ScalingPolicy::target_tracking("cpu", 70.0).with_cooldown(300)))
        .unwrap();

    fleet.metrics.record("cpu", MetricScope::Fleet, 90.0, 100);
    fleet.tick(100).await;
    assert_eq!(fleet.rec.state().desired_capacity, 3);

    fleet.metrics.record("cpu", MetricScope::Fleet, 99.0, 110);
    let report = fleet.tick(110).await;
    assert!(matches!(
        report.scaling.unwrap().reason,
        fleetgrid_autoscale::ScaleReason::Emergency { .. }
    ));
    // ceil(3 * (99 / 70 - 1)) = 2
    assert_eq!(fleet.rec.state().desired_capacity, 5);
}

#[tokio::test]
async fn invalid_policy_is_rejected() {
    let mut fleet = Fleet::new(2, 6);
    let err = fleet
        .rec
        .set_policy(Some(ScalingPolicy::target_tracking("cpu", -1.0)))
        .unwrap_err();
    assert!(matches!(err, FleetError::Config(_)));
}

// ── Rollouts ──────────────────────────────────────────────────────

#[tokio::test]
async fn blue_green_flips_in_one_tick_and_tears_down_after_drain() {
    let mut fleet = Fleet::new(3, 6).bootstrap().await;
    let id = fleet
        .rec
        .start_rollout(RolloutSpec::new("v2", blue_green(60)), 10)
        .unwrap();

    let report = fleet.tick(20).await;
    assert_eq!(report.applied.len(), 3);
    assert_eq!(fleet.driver.running_of("v2"), 3);
    assert_eq!(fleet.phase(&id), RolloutPhase::InProgress);
    assert_eq!(fleet.weight("v2"), 0);

    // All three green workers report ready: the flip happens in this tick.
    fleet.tick(30).await;
    assert_eq!(fleet.weight("v2"), 100);
    assert_eq!(fleet.weight("v1"), 0);
    assert_eq!(fleet.phase(&id), RolloutPhase::Baking);
    assert_eq!(fleet.driver.running_of("v1"), 3);

    fleet.tick(60).await;
    assert_eq!(fleet.driver.running_of("v1"), 3, "drain window still open");

    fleet.tick(90).await;
    assert_eq!(fleet.phase(&id), RolloutPhase::Completed);
    assert_eq!(fleet.driver.running_of("v1"), 0);
    assert_eq!(fleet.rec.state().stable_version, "v2");
    assert_eq!(fleet.rec.state().active_rollout, None);
    assert_eq!(fleet.rec.state().live_count(), 3);

    // Settled: nothing left to do.
    let report = fleet.tick(100).await;
    assert!(report.applied.is_empty());
}

#[tokio::test]
async fn blue_green_health_drop_rolls_back() {
    let mut fleet = Fleet::new(2, 6);
    fleet.rec = fleet.rec.with_health(HealthConfig {
        unhealthy_threshold: 1,
        healthy_threshold: 1,
    });
    let mut fleet = fleet.bootstrap().await;

    let id = fleet
        .rec
        .start_rollout(RolloutSpec::new("v2", blue_green(600)), 10)
        .unwrap();
    fleet.tick(20).await;
    fleet.tick(30).await;
    assert_eq!(fleet.phase(&id), RolloutPhase::Baking);

    let green: Vec<WorkerId> = fleet
        .driver
        .running()
        .into_iter()
        .filter(|(_, v)| v == "v2")
        .map(|(id, _)| id)
        .collect();
    for worker in &green {
        fleet.probes.report(worker, ProbeStatus::DOWN);
    }

    fleet.tick(40).await;
    assert!(matches!(fleet.phase(&id), RolloutPhase::RolledBack { .. }));
    assert_eq!(fleet.weight("v1"), 100);
    assert_eq!(fleet.driver.running_of("v2"), 0);
    assert_eq!(fleet.rec.state().ready_of_version("v1"), 2);
    assert_eq!(fleet.rec.state().active_rollout, None);
}

#[tokio::test]
async fn canary_breach_returns_weight_to_zero_within_one_tick() {
    let mut fleet = Fleet::new(2, 4).bootstrap().await;
    let id = fleet
        .rec
        .start_rollout(RolloutSpec::new("v2", canary()), 10)
        .unwrap();

    fleet.tick(20).await;
    assert_eq!(fleet.rec.state().desired_capacity, 3, "canary bonus claimed");
    assert_eq!(fleet.driver.running_of("v2"), 1);

    fleet.tick(30).await;
    assert_eq!(fleet.phase(&id), RolloutPhase::Baking);
    assert_eq!(fleet.weight("v2"), 25);

    fleet
        .metrics
        .record("error_rate", MetricScope::Cohort("v2".into()), 12.0, 35);
    fleet.tick(40).await;

    assert!(matches!(fleet.phase(&id), RolloutPhase::RolledBack { .. }));
    assert_eq!(fleet.weight("v2"), 0);
    assert_eq!(fleet.weight("v1"), 100);
    assert_eq!(fleet.driver.running_of("v2"), 0);
    assert_eq!(fleet.rec.state().desired_capacity, 2, "bonus released");
    assert_eq!(fleet.rec.state().active_rollout, None);
}

#[tokio::test]
async fn canary_clean_bake_completes() {
    let mut fleet = Fleet::new(2, 4).bootstrap().await;
    let id = fleet
        .rec
        .start_rollout(RolloutSpec::new("v2", canary()), 10)
        .unwrap();

    fleet.tick(20).await;
    fleet.tick(30).await;
    fleet
        .metrics
        .record("error_rate", MetricScope::Cohort("v2".into()), 0.5, 40);
    fleet.tick(60).await;
    assert_eq!(fleet.phase(&id), RolloutPhase::Baking);

    // Bake over: the final step needs a full-size target cohort.
    fleet.tick(90).await;
    assert_eq!(fleet.phase(&id), RolloutPhase::InProgress);
    assert_eq!(fleet.driver.running_of("v2"), 2);

    fleet.tick(100).await;
    assert_eq!(fleet.phase(&id), RolloutPhase::Completed);
    assert_eq!(fleet.weight("v2"), 100);
    assert_eq!(fleet.driver.running_of("v1"), 0);
    assert_eq!(fleet.rec.state().desired_capacity, 2);
    assert_eq!(fleet.rec.state().stable_version, "v2");
}

#[tokio::test]
async fn canary_at_max_capacity_never_exceeds_bounds() {
    let mut fleet = Fleet::new(4, 4).bootstrap().await;
    let id = fleet
        .rec
        .start_rollout(RolloutSpec::new("v2", canary_strategy(vec![50, 100])), 10)
        .unwrap();

    for t in (20..=300).step_by(10) {
        fleet.tick(t).await;
        let state = fleet.rec.state();
        assert!(state.live_count() <= state.max_capacity, "live above max at t={t}");
        assert!(fleet.driver.running().len() <= 4, "driver above max at t={t}");
        assert_eq!(state.desired_capacity, 4);
        if state.active_rollout.is_none() {
            break;
        }
    }

    assert_eq!(fleet.phase(&id), RolloutPhase::Completed);
    assert_eq!(fleet.driver.running_of("v2"), 4);
    assert_eq!(fleet.driver.running_of("v1"), 0);
    assert_eq!(fleet.rec.state().stable_version, "v2");
}

#[tokio::test]
async fn breach_overwritten_before_the_tick_still_rolls_back() {
    let mut fleet = Fleet::new(2, 4).bootstrap().await;
    let id = fleet
        .rec
        .start_rollout(RolloutSpec::new("v2", canary()), 10)
        .unwrap();
    fleet.tick(20).await;
    fleet.tick(30).await;
    assert_eq!(fleet.phase(&id), RolloutPhase::Baking);

    let scope = MetricScope::Cohort("v2".into());
    fleet.metrics.record("error_rate", scope.clone(), 12.0, 35);
    fleet.metrics.record("error_rate", scope, 0.5, 38);
    fleet.tick(40).await;

    assert!(matches!(fleet.phase(&id), RolloutPhase::RolledBack { .. }));
    assert_eq!(fleet.weight("v2"), 0);
    assert_eq!(fleet.driver.running_of("v2"), 0);
}

#[tokio::test]
async fn rolling_replaces_one_at_a_time() {
    let mut fleet = Fleet::new(2, 6).bootstrap().await;
    let id = fleet
        .rec
        .start_rollout(RolloutSpec::new("v2", RolloutStrategy::default()), 10)
        .unwrap();

    fleet.tick(20).await;
    assert_eq!(fleet.driver.running_of("v2"), 1);
    assert_eq!(fleet.driver.running_of("v1"), 2, "surge before removal");

    fleet.tick(30).await;
    assert_eq!(fleet.driver.running_of("v2"), 2);
    assert_eq!(fleet.driver.running_of("v1"), 1);
    assert_eq!(fleet.weight("v2"), 50);

    fleet.tick(40).await;
    assert_eq!(fleet.driver.running_of("v1"), 0);
    assert_eq!(fleet.weight("v2"), 100);

    fleet.tick(50).await;
    assert_eq!(fleet.phase(&id), RolloutPhase::Completed);
    assert_eq!(fleet.rec.state().stable_version, "v2");
}

#[tokio::test]
async fn second_rollout_conflicts_without_state_change() {
    let mut fleet = Fleet::new(2, 6).bootstrap().await;
    fleet
        .rec
        .start_rollout(RolloutSpec::new("v2", blue_green(60)), 10)
        .unwrap();
    fleet.tick(20).await;

    let before = fleet.rec.fleet_status();
    let err = fleet
        .rec
        .start_rollout(RolloutSpec::new("v3", canary()), 25)
        .unwrap_err();
    assert!(matches!(err, FleetError::Conflict(_)));
    assert!(err.is_rejection());
    assert_eq!(fleet.rec.fleet_status(), before);
    assert_eq!(fleet.rec.rollouts().len(), 1);
}

#[tokio::test]
async fn rollout_to_stable_version_is_a_config_error() {
    let mut fleet = Fleet::new(2, 6).bootstrap().await;
    let err = fleet
        .rec
        .start_rollout(RolloutSpec::new("v1", RolloutStrategy::default()), 10)
        .unwrap_err();
    assert!(matches!(err, FleetError::Config(_)));
    assert_eq!(fleet.rec.state().active_rollout, None);
}

#[tokio::test]
async fn approval_gates_start() {
    let mut fleet = Fleet::new(2, 6).bootstrap().await;
    let id = fleet
        .rec
        .start_rollout(
            RolloutSpec::new("v2", RolloutStrategy::default()).with_approval(Some(600)),
            10,
        )
        .unwrap();

    let report = fleet.tick(20).await;
    assert!(report.applied.is_empty());
    assert_eq!(fleet.phase(&id), RolloutPhase::Pending);

    fleet.rec.approve(&id).unwrap();
    assert!(matches!(fleet.rec.approve(&id), Err(FleetError::Conflict(_))));

    fleet.tick(30).await;
    assert_eq!(fleet.phase(&id), RolloutPhase::InProgress);
    assert_eq!(fleet.driver.running_of("v2"), 1);
}

#[tokio::test]
async fn approval_timeout_fails_rollout() {
    let mut fleet = Fleet::new(2, 6).bootstrap().await;
    let id = fleet
        .rec
        .start_rollout(
            RolloutSpec::new("v2", RolloutStrategy::default()).with_approval(Some(100)),
            10,
        )
        .unwrap();

    fleet.tick(50).await;
    assert_eq!(fleet.phase(&id), RolloutPhase::Pending);

    fleet.tick(110).await;
    assert_eq!(
        fleet.phase(&id),
        RolloutPhase::Failed {
            reason: "approval timeout".to_string()
        }
    );
    assert_eq!(fleet.rec.state().active_rollout, None);
    assert_eq!(fleet.driver.running_of("v2"), 0);

    // The fleet accepts a new rollout afterwards.
    assert!(
        fleet
            .rec
            .start_rollout(RolloutSpec::new("v2", RolloutStrategy::default()), 120)
            .is_ok()
    );
}

#[tokio::test]
async fn cancel_rolls_back_and_removes_target_workers() {
    let mut fleet = Fleet::new(2, 6).bootstrap().await;
    let id = fleet
        .rec
        .start_rollout(RolloutSpec::new("v2", RolloutStrategy::default()), 10)
        .unwrap();
    fleet.tick(20).await;
    assert_eq!(fleet.driver.running_of("v2"), 1);

    fleet.rec.cancel(&id).unwrap();
    fleet.tick(30).await;

    assert_eq!(
        fleet.phase(&id),
        RolloutPhase::RolledBack {
            reason: "cancelled by operator".to_string()
        }
    );
    assert_eq!(fleet.driver.running_of("v2"), 0);
    assert_eq!(fleet.driver.running_of("v1"), 2);
    assert_eq!(fleet.weight("v1"), 100);
    assert!(!fleet.rec.cancel_board().is_requested(&id));

    // Cancelling a finished rollout is a conflict.
    assert!(matches!(fleet.rec.cancel(&id), Err(FleetError::Conflict(_))));
}

#[tokio::test]
async fn driver_failure_fails_rollout_and_restores_baseline() {
    let mut fleet = Fleet::new(3, 6).bootstrap().await;
    fleet
        .driver
        .fail_version("v2", DriverError::Rejected("image pull failed".into()));
    let id = fleet
        .rec
        .start_rollout(RolloutSpec::new("v2", blue_green(60)), 10)
        .unwrap();

    let report = fleet.tick(20).await;
    assert_eq!(report.failures.len(), 1, "remaining creates are skipped");
    match fleet.phase(&id) {
        RolloutPhase::Failed { reason } => assert!(reason.starts_with("driver error"), "{reason}"),
        other => panic!("expected Failed, got {other:?}"),
    }
    assert!(fleet.rec.rollout(&id).unwrap().restore.pending);

    fleet.tick(30).await;
    assert!(!fleet.rec.rollout(&id).unwrap().restore.pending);
    assert_eq!(fleet.rec.state().active_rollout, None);
    assert_eq!(fleet.rec.state().ready_of_version("v1"), 3);
    assert_eq!(fleet.weight("v1"), 100);
}

#[tokio::test]
async fn failed_restoration_is_retried() {
    let mut fleet = Fleet::new(2, 4).bootstrap().await;
    let id = fleet
        .rec
        .start_rollout(RolloutSpec::new("v2", canary()), 10)
        .unwrap();
    fleet.tick(20).await;
    fleet.tick(30).await;

    fleet
        .metrics
        .record("error_rate", MetricScope::Cohort("v2".into()), 50.0, 35);
    fleet
        .driver
        .fail_next(1, DriverError::Unavailable("router restarting".into()));
    fleet.tick(40).await;
    assert!(matches!(fleet.phase(&id), RolloutPhase::RolledBack { .. }));
    let rollout = fleet.rec.rollout(&id).unwrap();
    assert!(rollout.restore.pending);
    assert_eq!(rollout.restore.attempts, 1);
    assert_eq!(fleet.rec.state().active_rollout.as_deref(), Some(id.as_str()));

    fleet.tick(50).await;
    assert!(!fleet.rec.rollout(&id).unwrap().restore.pending);
    assert_eq!(fleet.weight("v2"), 0);
    assert_eq!(fleet.driver.running_of("v2"), 0);
    assert_eq!(fleet.rec.state().active_rollout, None);
}

#[tokio::test]
async fn scale_out_during_rollout_joins_the_right_cohort() {
    let mut fleet = Fleet::new(2, 6).bootstrap().await;
    let id = fleet
        .rec
        .start_rollout(RolloutSpec::new("v2", blue_green(600)), 10)
        .unwrap();
    fleet.tick(20).await;
    fleet.tick(30).await;
    assert_eq!(fleet.phase(&id), RolloutPhase::Baking);

    // Traffic is on green, so added capacity is green.
    fleet.rec.override_capacity(3).unwrap();
    fleet.tick(40).await;
    assert_eq!(fleet.driver.running_of("v2"), 3);
    assert_eq!(fleet.rec.rollout(&id).unwrap().cohorts.size_of("v2"), 3);
}

#[tokio::test]
async fn capacity_changes_converge_without_a_rollout() {
    let mut fleet = Fleet::new(3, 6).bootstrap().await;

    fleet.rec.override_capacity(2).unwrap();
    let report = fleet.tick(20).await;
    assert_eq!(report.applied.len(), 1);
    assert_eq!(fleet.driver.running_of("v1"), 2);

    // Raising the floor pulls desired capacity up with it.
    fleet.rec.set_bounds(4, 6).unwrap();
    assert_eq!(fleet.rec.state().desired_capacity, 4);
    fleet.tick(30).await;
    assert_eq!(fleet.driver.running_of("v1"), 4);

    assert!(matches!(fleet.rec.set_bounds(5, 2), Err(FleetError::Config(_))));
}
