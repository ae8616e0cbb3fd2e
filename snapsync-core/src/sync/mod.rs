//! Three-way comparison: classification, planning and conflict files.

pub mod conflict;
pub mod plan;
pub mod state;

pub use conflict::{ConflictCase, ConflictError, Resolution, ResolutionMap};
pub use plan::{action_for, PlanItem, PlanSummary, SyncAction, SyncPlan};
pub use state::{classify, SyncState};
