//! When a CRUD change is worth recording.

use serde::{Deserialize, Serialize};

use crate::canonical::Snapshot;
use crate::types::RecordKind;

/// Decides whether a snapshot change should produce an audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingPolicy {
    /// Progress is recorded each time it enters a new bucket of this width
    #[serde(default = "default_progress_step")]
    pub progress_step_percent: f64,

    /// Progress snapshot field holding the percentage
    #[serde(default = "default_progress_field")]
    pub progress_field: String,

    /// Progress snapshot field holding the completion flag
    #[serde(default = "default_completed_field")]
    pub completed_field: String,

    /// Voice interactions below this confidence are not recorded
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    /// Voice snapshot field holding the confidence score
    #[serde(default = "default_confidence_field")]
    pub confidence_field: String,
}

fn default_progress_step() -> f64 { 10.0 }
fn default_progress_field() -> String { "progress_percentage".to_string() }
fn default_completed_field() -> String { "completed".to_string() }
fn default_min_confidence() -> f64 { 0.6 }
fn default_confidence_field() -> String { "confidence_score".to_string() }

impl Default for RecordingPolicy {
    fn default() -> Self {
        Self {
            progress_step_percent: default_progress_step(),
            progress_field: default_progress_field(),
            completed_field: default_completed_field(),
            min_confidence: default_min_confidence(),
            confidence_field: default_confidence_field(),
        }
    }
}

impl RecordingPolicy {
    /// A policy that records every change.
    pub fn always() -> Self {
        Self {
            progress_step_percent: 0.0,
            min_confidence: f64::NEG_INFINITY,
            ..Self::default()
        }
    }

    /// Whether moving from `previous` to `current` should be recorded.
    ///
    /// `previous` is the snapshot the CRUD layer held before its save, or
    /// `None` for a newly created entity.
    pub fn should_record(
        &self,
        kind: RecordKind,
        previous: Option<&Snapshot>,
        current: &Snapshot,
    ) -> bool {
        match kind {
            RecordKind::Progress => self.progress_changed(previous, current),
            RecordKind::Voice => self.confident_enough(current),
            _ => true,
        }
    }

    fn progress_changed(&self, previous: Option<&Snapshot>, current: &Snapshot) -> bool {
        let Some(previous) = previous else {
            return true;
        };

        let completed = |s: &Snapshot| s.get(&self.completed_field).and_then(|v| v.as_bool());
        if completed(previous) != completed(current) {
            return true;
        }

        let progress = |s: &Snapshot| s.get(&self.progress_field).and_then(|v| v.as_f64());
        match (progress(previous), progress(current)) {
            (Some(before), Some(after)) => self.bucket(before) != self.bucket(after),
            // Field appeared, vanished or became non-numeric
            (before, after) => before.is_some() != after.is_some(),
        }
    }

    fn bucket(&self, percent: f64) -> i64 {
        if self.progress_step_percent <= 0.0 {
            // Zero step: every distinct value is its own bucket
            return (percent * 1_000_000.0).round() as i64;
        }
        (percent / self.progress_step_percent).floor() as i64
    }

    fn confident_enough(&self, current: &Snapshot) -> bool {
        match current.get(&self.confidence_field).and_then(|v| v.as_f64()) {
            Some(confidence) => confidence >= self.min_confidence,
            None => self.min_confidence == f64::NEG_INFINITY,
        }
    }
}
