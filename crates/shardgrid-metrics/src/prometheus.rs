//! Prometheus text exposition format.
//!
//! Renders a fleet snapshot as `shardgrid_*` gauges for scraping by a
//! Prometheus server or compatible agent.

use std::fmt::Write;

use crate::aggregator::FleetSnapshot;

fn header(out: &mut String, name: &str, help: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
}

/// Render a snapshot into Prometheus text format.
pub fn render_prometheus(s: &FleetSnapshot) -> String {
    let mut out = String::new();

    header(&mut out, "shardgrid_nodes", "Search nodes by liveness.");
    let _ = writeln!(out, "shardgrid_nodes{{liveness=\"alive\"}} {}", s.nodes_alive);
    let _ = writeln!(out, "shardgrid_nodes{{liveness=\"lost\"}} {}", s.nodes_lost);

    header(&mut out, "shardgrid_storage_bytes", "Fleet storage in bytes.");
    for (kind, value) in [
        ("capacity", s.capacity_bytes),
        ("used", s.used_bytes),
        ("reserved", s.reserved_bytes),
        ("unclaimed", s.unclaimed_bytes),
    ] {
        let _ = writeln!(out, "shardgrid_storage_bytes{{kind=\"{kind}\"}} {value}");
    }

    header(&mut out, "shardgrid_indices", "Indices by state.");
    for (state, count) in &s.indices {
        let _ = writeln!(out, "shardgrid_indices{{state=\"{state}\"}} {count}");
    }

    header(&mut out, "shardgrid_repositories", "Repositories by state.");
    for (state, count) in &s.repositories {
        let _ = writeln!(out, "shardgrid_repositories{{state=\"{state}\"}} {count}");
    }

    header(&mut out, "shardgrid_tasks", "Tasks by type and state.");
    for t in &s.tasks {
        let _ = writeln!(
            out,
            "shardgrid_tasks{{type=\"{}\",state=\"{}\"}} {}",
            t.task_type.as_str(),
            t.state.as_str(),
            t.count
        );
    }

    header(&mut out, "shardgrid_task_queue_depth", "Pending plus processing tasks.");
    let _ = writeln!(out, "shardgrid_task_queue_depth {}", s.queue_depth);

    header(&mut out, "shardgrid_enabled_namespaces", "Namespaces onboarded onto the fleet.");
    let _ = writeln!(out, "shardgrid_enabled_namespaces {}", s.enabled_namespaces);

    header(
        &mut out,
        "shardgrid_percent_complete",
        "Ready repositories as a percentage of repositories not being deleted.",
    );
    let _ = writeln!(out, "shardgrid_percent_complete {:.2}", s.percent_complete);

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::TaskCount;
    use shardgrid_state::{IndexState, TaskState, TaskType};

    fn test_snapshot() -> FleetSnapshot {
        FleetSnapshot {
            taken_at: 1000,
            nodes_alive: 3,
            nodes_lost: 1,
            capacity_bytes: 4_000,
            used_bytes: 1_000,
            reserved_bytes: 2_500,
            unclaimed_bytes: 1_500,
            indices: IndexState::ALL.iter().map(|s| (s.as_str(), 2)).collect(),
            repositories: Default::default(),
            tasks: vec![TaskCount {
                task_type: TaskType::IndexRepo,
                state: TaskState::Processing,
                count: 12,
            }],
            queue_depth: 12,
            enabled_namespaces: 9,
            percent_complete: 62.5,
        }
    }

    #[test]
    fn render_empty() {
        let output = render_prometheus(&FleetSnapshot::default());
        assert!(output.contains("# HELP shardgrid_indices"));
        assert!(output.contains("# TYPE shardgrid_task_queue_depth gauge"));
        assert!(output.contains("shardgrid_percent_complete 0.00"));
    }

    #[test]
    fn render_values() {
        let output = render_prometheus(&test_snapshot());

        assert!(output.contains("shardgrid_nodes{liveness=\"lost\"} 1"));
        assert!(output.contains("shardgrid_storage_bytes{kind=\"unclaimed\"} 1500"));
        assert!(output.contains("shardgrid_indices{state=\"pending_eviction\"} 2"));
        assert!(output.contains("shardgrid_tasks{type=\"index_repo\",state=\"processing\"} 12"));
        assert!(output.contains("shardgrid_enabled_namespaces 9"));
        assert!(output.contains("shardgrid_percent_complete 62.50"));
    }

    #[test]
    fn every_sample_is_a_shardgrid_gauge() {
        let output = render_prometheus(&test_snapshot());
        for line in output.lines() {
            if line.starts_with('#') {
                continue;
            }
            assert!(line.starts_with("shardgrid_"), "unexpected sample: {line}");
            assert_eq!(line.split(' ').count(), 2, "malformed sample: {line}");
        }
    }
}
