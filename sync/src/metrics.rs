//! Per-run statistics for reconciliation units

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, SystemTime};
use tracing::{info, warn};
use uuid::Uuid;

/// Remote or local mutation performed by a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mutation {
    OwnerAdded,
    OwnerRemoved,
    MemberAdded,
    MemberRemoved,
    GroupCreated,
    GroupDeleted,
    GroupRestored,
    EventCreated,
    EventUpdated,
    EventDeleted,
    EventImported,
    UserProvisioned,
    UserRemoved,
}

impl Mutation {
    pub fn as_str(self) -> &'static str {
        match self {
            Mutation::OwnerAdded => "owner_added",
            Mutation::OwnerRemoved => "owner_removed",
            Mutation::MemberAdded => "member_added",
            Mutation::MemberRemoved => "member_removed",
            Mutation::GroupCreated => "group_created",
            Mutation::GroupDeleted => "group_deleted",
            Mutation::GroupRestored => "group_restored",
            Mutation::EventCreated => "event_created",
            Mutation::EventUpdated => "event_updated",
            Mutation::EventDeleted => "event_deleted",
            Mutation::EventImported => "event_imported",
            Mutation::UserProvisioned => "user_provisioned",
            Mutation::UserRemoved => "user_removed",
        }
    }
}

/// Error statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorStats {
    pub total_errors: usize,
    /// Errors by operation name
    pub errors_by_operation: HashMap<String, usize>,
    /// Item-level errors that were logged and skipped
    pub recoverable_errors: Vec<String>,
}

/// Summary of one reconciliation run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileMetrics {
    pub run_id: Uuid,
    /// Name of the unit of work, e.g. `group_membership`
    pub operation: String,
    pub start_time: SystemTime,
    pub end_time: Option<SystemTime>,
    pub duration: Duration,
    /// Items examined
    pub processed: usize,
    /// Items with nothing to do or missing prerequisites
    pub skipped: usize,
    pub mutations: HashMap<Mutation, usize>,
    pub errors: ErrorStats,
}

impl ReconcileMetrics {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            operation: operation.into(),
            start_time: SystemTime::now(),
            end_time: None,
            duration: Duration::default(),
            processed: 0,
            skipped: 0,
            mutations: HashMap::new(),
            errors: ErrorStats::default(),
        }
    }

    /// Mark the run as completed and log a summary
    pub fn complete(&mut self) {
        let end = SystemTime::now();
        self.end_time = Some(end);
        self.duration = end.duration_since(self.start_time).unwrap_or_default();

        info!(
            run_id = %self.run_id,
            operation = %self.operation,
            duration_secs = self.duration.as_secs_f64(),
            processed = self.processed,
            skipped = self.skipped,
            mutations = self.total_mutations(),
            errors = self.errors.total_errors,
            "Reconciliation run completed"
        );
    }

    pub fn record_processed(&mut self) {
        self.processed += 1;
    }

    pub fn record_skip(&mut self) {
        self.skipped += 1;
    }

    pub fn record_mutation(&mut self, mutation: Mutation) {
        *self.mutations.entry(mutation).or_insert(0) += 1;
    }

    /// Record an item-level failure that did not abort the run
    pub fn record_error(&mut self, operation: impl Into<String>, message: impl Into<String>) {
        let operation = operation.into();
        let message = message.into();

        warn!(
            run_id = %self.run_id,
            operation = %operation,
            message = %message,
            "Recoverable reconciliation error"
        );

        self.errors.total_errors += 1;
        *self.errors.errors_by_operation.entry(operation).or_insert(0) += 1;
        self.errors.recoverable_errors.push(message);
    }

    pub fn count(&self, mutation: Mutation) -> usize {
        self.mutations.get(&mutation).copied().unwrap_or(0)
    }

    pub fn total_mutations(&self) -> usize {
        self.mutations.values().sum()
    }

    pub fn has_errors(&self) -> bool {
        self.errors.total_errors > 0
    }

    /// Fold another run's counters into this one
    pub fn merge(&mut self, other: &ReconcileMetrics) {
        self.processed += other.processed;
        self.skipped += other.skipped;
        for (mutation, count) in &other.mutations {
            *self.mutations.entry(*mutation).or_insert(0) += count;
        }
        self.errors.total_errors += other.errors.total_errors;
        for (operation, count) in &other.errors.errors_by_operation {
            *self.errors.errors_by_operation.entry(operation.clone()).or_insert(0) += count;
        }
        self.errors
            .recoverable_errors
            .extend(other.errors.recoverable_errors.iter().cloned());
    }

    /// Success rate as a percentage of processed items
    pub fn success_rate(&self) -> f64 {
        if self.processed == 0 {
            100.0
        } else {
            let failed = self.errors.total_errors.min(self.processed);
            ((self.processed - failed) as f64 / self.processed as f64) * 100.0
        }
    }
}
