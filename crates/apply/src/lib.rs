//! kman apply: diff, readiness and the reconcile lifecycle

#![forbid(unsafe_code)]

pub mod diff;
pub mod readiness;
pub mod reconcile;

pub use diff::{diff, ChangeSet, DiffSummary};
pub use readiness::{evaluate, NotReadyReason, Readiness, ReadinessState, ReadinessTracker, StatusSnapshot, StatusViewer, StatusViewers};
pub use reconcile::{Created, Plan, Reconciler, Updated};
