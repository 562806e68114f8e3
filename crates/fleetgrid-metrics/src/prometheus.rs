//! Prometheus text exposition format.
//!
//! Renders the fleet record into gauges for scraping by a Prometheus server
//! or compatible agent.

use std::collections::BTreeMap;

use fleetgrid_state::{FleetState, Version, WorkerLifecycle};

/// Render fleet capacity, worker counts, and cohort weights.
///
/// `weights` is the active rollout's weight table; without one the stable
/// version is reported at 100.
pub fn render_prometheus(fleet: &FleetState, weights: Option<&BTreeMap<Version, u8>>) -> String {
    let mut out = String::new();

    out.push_str("# HELP fleetgrid_desired_capacity Desired number of workers.\n");
    out.push_str("# TYPE fleetgrid_desired_capacity gauge\n");
    out.push_str(&format!(
        "fleetgrid_desired_capacity{{fleet=\"{}\"}} {}\n",
        fleet.stable_version, fleet.desired_capacity
    ));

    out.push_str("# HELP fleetgrid_capacity_bound Capacity bounds of the fleet.\n");
    out.push_str("# TYPE fleetgrid_capacity_bound gauge\n");
    out.push_str(&format!(
        "fleetgrid_capacity_bound{{bound=\"min\"}} {}\n",
        fleet.min_capacity
    ));
    out.push_str(&format!(
        "fleetgrid_capacity_bound{{bound=\"max\"}} {}\n",
        fleet.max_capacity
    ));

    out.push_str("# HELP fleetgrid_workers Workers by version and lifecycle state.\n");
    out.push_str("# TYPE fleetgrid_workers gauge\n");
    let mut counts: BTreeMap<(&str, String), u32> = BTreeMap::new();
    for w in &fleet.workers {
        if w.lifecycle == WorkerLifecycle::Terminated {
            continue;
        }
        *counts
            .entry((w.version.as_str(), w.lifecycle.to_string()))
            .or_default() += 1;
    }
    for ((version, lifecycle), count) in &counts {
        out.push_str(&format!(
            "fleetgrid_workers{{version=\"{version}\",state=\"{lifecycle}\"}} {count}\n"
        ));
    }

    out.push_str("# HELP fleetgrid_cohort_weight Traffic weight per version (0-100).\n");
    out.push_str("# TYPE fleetgrid_cohort_weight gauge\n");
    match weights {
        Some(weights) => {
            for (version, weight) in weights {
                out.push_str(&format!(
                    "fleetgrid_cohort_weight{{version=\"{version}\"}} {weight}\n"
                ));
            }
        }
        None => {
            out.push_str(&format!(
                "fleetgrid_cohort_weight{{version=\"{}\"}} 100\n",
                fleet.stable_version
            ));
        }
    }

    out.push_str("# HELP fleetgrid_rollout_active Whether a rollout owns the fleet.\n");
    out.push_str("# TYPE fleetgrid_rollout_active gauge\n");
    out.push_str(&format!(
        "fleetgrid_rollout_active{{}} {}\n",
        u8::from(fleet.active_rollout.is_some())
    ));

    out
}
