//! Controller loop and persistence tests.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use fleetgrid_health::ProbeBoard;
use fleetgrid_metrics::MetricsRegistry;
use fleetgrid_reconcile::*;
use fleetgrid_rollout::{BlueGreenConfig, RolloutPhase, RolloutSpec, RolloutStrategy};
use fleetgrid_state::{FleetError, FleetState, FleetStore, WorkerLifecycle};

fn config() -> ReconcilerConfig {
    ReconcilerConfig {
        tick_interval_secs: 3600,
        max_attempts: 1,
        ..Default::default()
    }
}

fn reconciler(driver: Arc<SimDriver>, probes: Arc<ProbeBoard>) -> Reconciler {
    Reconciler::new(
        FleetState::new("v1", 1, 6, 2).unwrap(),
        Arc::new(MetricsRegistry::default()),
        probes,
        driver,
        config(),
    )
}

fn blue_green() -> RolloutSpec {
    RolloutSpec::new(
        "v2",
        RolloutStrategy::BlueGreen(BlueGreenConfig {
            drain_window_secs: 60,
            ..Default::default()
        }),
    )
}

#[tokio::test]
async fn handle_drives_a_rollout() {
    let probes = Arc::new(ProbeBoard::default());
    let driver = Arc::new(SimDriver::with_probes(probes.clone()));
    let clock = Arc::new(ManualClock::new(0));
    let (controller, handle) = FleetController::new(reconciler(driver.clone(), probes), &config());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(controller.with_clock(clock.clone()).run(shutdown_rx));

    handle.tick().await.unwrap();
    clock.set(5);
    handle.tick().await.unwrap();
    let status = handle.fleet_status().await.unwrap();
    assert_eq!(status.live, 2);
    assert_eq!(status.ready, 2);

    // Starting a rollout reconciles immediately.
    clock.set(10);
    let id = handle.start_rollout(blue_green()).await.unwrap();
    // Replies go out before the tick they trigger; a query waits for it.
    handle.fleet_status().await.unwrap();
    assert_eq!(driver.running_of("v2"), 2);

    clock.set(20);
    let report = handle.tick().await.unwrap();
    assert_eq!(report.rollout, Some((id.clone(), RolloutPhase::Baking)));

    let view = handle.rollout_status(&id).await.unwrap();
    assert_eq!(view.weights.get("v2"), Some(&100));
    let status = handle.fleet_status().await.unwrap();
    assert_eq!(status.active_rollout.map(|r| r.id), Some(id.clone()));

    let text = handle.prometheus().await.unwrap();
    assert!(text.contains("fleetgrid_cohort_weight{version=\"v2\"} 100"));

    let err = handle.start_rollout(blue_green()).await.unwrap_err();
    assert!(matches!(err, FleetError::Conflict(_)));

    shutdown_tx.send(true).unwrap();
    let rec = task.await.unwrap();
    assert_eq!(rec.state().active_rollout, Some(id));
}

#[tokio::test]
async fn cancel_through_handle() {
    let probes = Arc::new(ProbeBoard::default());
    let driver = Arc::new(SimDriver::with_probes(probes.clone()));
    let clock = Arc::new(ManualClock::new(0));
    let (controller, handle) = FleetController::new(reconciler(driver.clone(), probes), &config());
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(controller.with_clock(clock.clone()).run(shutdown_rx));

    handle.tick().await.unwrap();
    clock.set(5);
    handle.tick().await.unwrap();

    clock.set(10);
    let id = handle.start_rollout(blue_green()).await.unwrap();
    assert!(matches!(
        handle.approve(&id).await,
        Err(FleetError::Conflict(_))
    ));
    assert!(matches!(
        handle.cancel("ro-404").await,
        Err(FleetError::NotFound(_))
    ));

    clock.set(20);
    handle.cancel(&id).await.unwrap();
    let view = handle.rollout_status(&id).await.unwrap();
    assert!(matches!(view.phase, RolloutPhase::RolledBack { .. }));
    assert!(!view.restore_pending);
    assert_eq!(driver.running_of("v2"), 0);

    // Dropping the last handle stops the loop.
    drop(handle);
    let rec = task.await.unwrap();
    assert_eq!(rec.state().active_rollout, None);
}

#[tokio::test]
async fn cancel_during_slow_create_drains_the_late_worker() {
    let probes = Arc::new(ProbeBoard::default());
    let driver = Arc::new(SimDriver::with_probes(probes.clone()));
    let clock = Arc::new(ManualClock::new(0));
    let (controller, handle) = FleetController::new(reconciler(driver.clone(), probes), &config());
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(controller.with_clock(clock.clone()).run(shutdown_rx));

    handle.tick().await.unwrap();
    clock.set(5);
    handle.tick().await.unwrap();

    driver.set_latency(Duration::from_millis(100));
    clock.set(10);
    let id = handle.start_rollout(blue_green()).await.unwrap();

    // The status query queues behind the tick creating v2 workers; the
    // cancel lands on the board while those creates are still pending.
    let (mid, cancelled) = tokio::join!(handle.fleet_status(), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel(&id).await
    });
    cancelled.unwrap();
    let mid = mid.unwrap();
    let late: Vec<_> = mid.workers.iter().filter(|w| w.version == "v2").collect();
    assert_eq!(late.len(), 2);
    assert!(late.iter().all(|w| w.lifecycle == WorkerLifecycle::Draining));
    assert_eq!(mid.live, 2);
    assert_eq!(mid.traffic.get("v2").copied().unwrap_or(0), 0);
    let late: Vec<_> = late.into_iter().map(|w| w.id.clone()).collect();

    let view = handle.rollout_status(&id).await.unwrap();
    assert!(matches!(view.phase, RolloutPhase::RolledBack { .. }));
    assert!(!view.restore_pending);
    assert_eq!(driver.running_of("v2"), 0);
    let calls = driver.calls();
    for late_id in &late {
        assert!(calls
            .iter()
            .any(|c| matches!(c, SimCall::Terminate { worker, .. } if worker == late_id)));
    }
    let status = handle.fleet_status().await.unwrap();
    assert!(status
        .workers
        .iter()
        .filter(|w| late.contains(&w.id))
        .all(|w| w.lifecycle == WorkerLifecycle::Terminated));
    assert_eq!(status.live, 2);

    drop(handle);
    task.await.unwrap();
}

#[tokio::test]
async fn override_and_bounds_through_handle() {
    let probes = Arc::new(ProbeBoard::default());
    let driver = Arc::new(SimDriver::with_probes(probes.clone()));
    let clock = Arc::new(ManualClock::new(0));
    let (controller, handle) = FleetController::new(reconciler(driver.clone(), probes), &config());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(controller.with_clock(clock).run(shutdown_rx));

    handle.override_capacity(5).await.unwrap();
    handle.fleet_status().await.unwrap();
    assert_eq!(driver.running_of("v1"), 5);
    assert!(matches!(
        handle.override_capacity(7).await,
        Err(FleetError::Config(_))
    ));

    handle.set_bounds(1, 3).await.unwrap();
    let status = handle.fleet_status().await.unwrap();
    assert_eq!(status.desired_capacity, 3);
    assert_eq!(driver.running_of("v1"), 3);

    handle.notify();
    shutdown_tx.send(true).unwrap();
    task.await.unwrap();
    assert!(matches!(handle.tick().await, Err(FleetError::Stopped)));
}

#[tokio::test]
async fn checkpoint_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fleet.redb");
    let probes = Arc::new(ProbeBoard::default());
    let driver = Arc::new(SimDriver::with_probes(probes.clone()));

    let id = {
        let store = FleetStore::open(&path).unwrap();
        let mut rec = reconciler(driver.clone(), probes.clone())
            .with_store(store)
            .unwrap();
        rec.tick(0).await;
        rec.tick(5).await;
        let id = rec.start_rollout(blue_green(), 10).unwrap();
        rec.tick(20).await;
        id
    };

    let store = FleetStore::open(&path).unwrap();
    let mut rec = reconciler(driver.clone(), probes).with_store(store).unwrap();
    assert_eq!(rec.state().active_rollout.as_deref(), Some(id.as_str()));
    assert_eq!(rec.state().live_count(), 4);
    assert_eq!(rec.rollout(&id).unwrap().phase, RolloutPhase::InProgress);

    // The resumed controller carries on where the old one stopped.
    let report = rec.tick(30).await;
    assert_eq!(report.rollout, Some((id.clone(), RolloutPhase::Baking)));
    assert_eq!(driver.weights().get("v2"), Some(&100));
    assert!(matches!(
        rec.start_rollout(blue_green(), 40),
        Err(FleetError::Conflict(_))
    ));
}
