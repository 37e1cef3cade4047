//! Snapshot-vs-stream decision, consulted once at connector startup.

use serde::{Deserialize, Serialize};
use tracing::info;

/// Persisted position state relevant to the snapshot decision, recovered
/// from the checkpoint file when one exists.
#[derive(Debug, Clone, Copy)]
pub struct OffsetState {
    /// True when a previous snapshot started but never completed.
    pub snapshot_in_effect: bool,
}

/// How the connector bootstraps before streaming.
///
/// A closed set of interchangeable strategies selected by configuration;
/// every one of them streams after the (optional) snapshot phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotMode {
    /// Snapshot a new datasource or resume an incomplete snapshot, then stream.
    #[default]
    Initial,
    /// Snapshot on every startup.
    Always,
    /// Stream from the persisted position without snapshotting.
    Never,
}

impl SnapshotMode {
    /// Pure function of the persisted offset state to a "must snapshot"
    /// decision. Not invoked again during steady-state streaming.
    pub fn should_snapshot(&self, offset: Option<&OffsetState>) -> bool {
        match self {
            SnapshotMode::Always => true,
            SnapshotMode::Never => false,
            SnapshotMode::Initial => match offset {
                None => {
                    info!("taking initial snapshot for new datasource");
                    true
                }
                Some(state) if state.snapshot_in_effect => {
                    info!("found previous incomplete snapshot");
                    true
                }
                Some(_) => {
                    info!(
                        "previous snapshot completed successfully, \
                         streaming logical changes from last known position"
                    );
                    false
                }
            },
        }
    }

    /// Whether streaming follows the startup phase. Every strategy in this
    /// set answers yes.
    pub fn should_stream(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_snapshots_new_datasource() {
        assert!(SnapshotMode::Initial.should_snapshot(None));
    }

    #[test]
    fn initial_resumes_incomplete_snapshot() {
        let state = OffsetState {
            snapshot_in_effect: true,
        };
        assert!(SnapshotMode::Initial.should_snapshot(Some(&state)));
    }

    #[test]
    fn initial_skips_completed_snapshot() {
        let state = OffsetState {
            snapshot_in_effect: false,
        };
        assert!(!SnapshotMode::Initial.should_snapshot(Some(&state)));
    }

    #[test]
    fn always_and_never_ignore_offset_state() {
        let state = OffsetState {
            snapshot_in_effect: false,
        };
        assert!(SnapshotMode::Always.should_snapshot(Some(&state)));
        assert!(SnapshotMode::Always.should_snapshot(None));
        assert!(!SnapshotMode::Never.should_snapshot(None));
    }

    #[test]
    fn every_mode_streams() {
        assert!(SnapshotMode::Initial.should_stream());
        assert!(SnapshotMode::Always.should_stream());
        assert!(SnapshotMode::Never.should_stream());
    }
}
