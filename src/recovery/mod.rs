//! Recovery lifecycle
//!
//! Phases move Pending -> Running -> {Succeeded, Failed}; Pending may also go
//! straight to a terminal phase. Succeeded and Failed are never left. Per
//! path results are kept independently of the aggregate phase, so a failed
//! path never hides paths that were restored.

use std::time::Duration;

use chrono::Utc;

use crate::crd::{RecoveryPhase, RecoveryStatus, RestoreStats};
use crate::error::{Error, Result};

/// Whether a Recovery may move from `from` to `to`
pub fn can_transition(from: RecoveryPhase, to: RecoveryPhase) -> bool {
    use RecoveryPhase::*;
    match (from, to) {
        (Pending, Running) | (Pending, Succeeded) | (Pending, Failed) => true,
        (Running, Succeeded) | (Running, Failed) => true,
        _ => false,
    }
}

/// Status after moving to `to`, keeping the per-path stats
pub fn transition(
    status: Option<&RecoveryStatus>,
    to: RecoveryPhase,
    message: impl Into<String>,
    observed_generation: Option<i64>,
) -> Result<RecoveryStatus> {
    let current = status.cloned().unwrap_or_default();
    let from = current.phase.unwrap_or_default();
    if !can_transition(from, to) {
        return Err(Error::validation(format!(
            "illegal recovery phase transition {} -> {}",
            from, to
        )));
    }
    Ok(RecoveryStatus {
        phase: Some(to),
        message: Some(message.into()),
        last_transition_time: Some(Utc::now()),
        observed_generation: observed_generation.or(current.observed_generation),
        ..current
    })
}

/// Replace the entry for the same path, or append
pub fn upsert_stats(stats: &mut Vec<RestoreStats>, entry: RestoreStats) {
    match stats.iter_mut().find(|s| s.path == entry.path) {
        Some(existing) => *existing = entry,
        None => stats.push(entry),
    }
}

pub fn format_duration(duration: Duration) -> String {
    format!("{:?}", duration)
}

/// Aggregates per-path outcomes of one recovery run
#[derive(Clone, Debug)]
pub struct RecoveryTracker {
    paths: Vec<String>,
    stats: Vec<RestoreStats>,
}

impl RecoveryTracker {
    /// Track the declared `paths`, starting from stats already recorded.
    ///
    /// Stats of paths no longer declared are dropped.
    pub fn new(paths: Vec<String>, mut stats: Vec<RestoreStats>) -> Self {
        stats.retain(|s| paths.contains(&s.path));
        Self { paths, stats }
    }

    /// Record the outcome of one path and return its stats entry
    pub fn record(&mut self, path: &str, duration: Duration, succeeded: bool) -> RestoreStats {
        let entry = RestoreStats {
            path: path.to_string(),
            duration: format_duration(duration),
            phase: if succeeded {
                RecoveryPhase::Succeeded
            } else {
                RecoveryPhase::Failed
            },
        };
        upsert_stats(&mut self.stats, entry.clone());
        entry
    }

    pub fn stats(&self) -> &[RestoreStats] {
        &self.stats
    }

    pub fn failed_paths(&self) -> Vec<&str> {
        self.stats
            .iter()
            .filter(|s| s.phase == RecoveryPhase::Failed)
            .map(|s| s.path.as_str())
            .collect()
    }

    /// Failed if any path failed, Succeeded once every declared path
    /// succeeded, Running otherwise
    pub fn phase(&self) -> RecoveryPhase {
        if !self.failed_paths().is_empty() {
            return RecoveryPhase::Failed;
        }
        let done = self.paths.iter().all(|p| {
            self.stats
                .iter()
                .any(|s| &s.path == p && s.phase == RecoveryPhase::Succeeded)
        });
        if done {
            RecoveryPhase::Succeeded
        } else {
            RecoveryPhase::Running
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use RecoveryPhase::*;

    fn paths() -> Vec<String> {
        vec!["/data/a".to_string(), "/data/b".to_string()]
    }

    #[test]
    fn terminal_phases_are_never_left() {
        for to in [Pending, Running, Succeeded, Failed] {
            assert!(!can_transition(Succeeded, to));
            assert!(!can_transition(Failed, to));
        }
        assert!(can_transition(Pending, Running));
        assert!(can_transition(Running, Failed));
        assert!(!can_transition(Running, Pending));
        assert!(!can_transition(Running, Running));
    }

    #[test]
    fn transition_keeps_stats() {
        let status = RecoveryStatus {
            phase: Some(Running),
            stats: vec![RestoreStats {
                path: "/data/a".to_string(),
                duration: "1s".to_string(),
                phase: Succeeded,
            }],
            ..Default::default()
        };
        let next = transition(Some(&status), Succeeded, "done", Some(2)).unwrap();
        assert_eq!(next.phase, Some(Succeeded));
        assert_eq!(next.stats, status.stats);
        assert_eq!(next.observed_generation, Some(2));
        assert!(next.last_transition_time.is_some());
    }

    #[test]
    fn transition_from_unset_phase_starts_at_pending() {
        let next = transition(None, Running, "job created", None).unwrap();
        assert_eq!(next.phase, Some(Running));
        assert!(transition(Some(&next), Pending, "", None).is_err());
    }

    #[test]
    fn all_paths_succeeded() {
        let mut tracker = RecoveryTracker::new(paths(), Vec::new());
        tracker.record("/data/a", Duration::from_millis(20), true);
        assert_eq!(tracker.phase(), Running);
        tracker.record("/data/b", Duration::from_millis(30), true);
        assert_eq!(tracker.phase(), Succeeded);
        assert_eq!(tracker.stats().len(), 2);
    }

    #[test]
    fn one_failure_fails_the_aggregate_but_keeps_every_entry() {
        let mut tracker = RecoveryTracker::new(paths(), Vec::new());
        let failed = tracker.record("/data/a", Duration::from_millis(15), false);
        tracker.record("/data/b", Duration::from_millis(30), true);

        assert_eq!(failed.phase, Failed);
        assert_ne!(failed.duration, format_duration(Duration::ZERO));
        assert_eq!(tracker.phase(), Failed);
        assert_eq!(tracker.stats().len(), 2);
        assert_eq!(tracker.failed_paths(), vec!["/data/a"]);
    }

    #[test]
    fn stats_of_undeclared_paths_are_dropped() {
        let stale = RestoreStats {
            path: "/data/old".to_string(),
            duration: "1s".to_string(),
            phase: Failed,
        };
        let mut tracker = RecoveryTracker::new(paths(), vec![stale]);
        assert!(tracker.stats().is_empty());

        tracker.record("/data/a", Duration::from_secs(1), true);
        tracker.record("/data/b", Duration::from_secs(1), true);
        assert!(tracker.failed_paths().is_empty());
        assert_eq!(tracker.phase(), Succeeded);
    }

    #[test]
    fn rerecording_a_path_replaces_its_entry() {
        let mut tracker = RecoveryTracker::new(paths(), Vec::new());
        tracker.record("/data/a", Duration::from_secs(1), false);
        tracker.record("/data/a", Duration::from_secs(2), true);
        assert_eq!(tracker.stats().len(), 1);
        assert_eq!(tracker.stats()[0].phase, Succeeded);
        assert_eq!(tracker.stats()[0].duration, "2s");
    }
}
