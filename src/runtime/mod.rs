/// Runtime reconciliation layer
///
/// Everything that talks to the live scheduler and turns its view of a workflow
/// into a platform version:
/// - Fetching exports and datasources from the scheduler
/// - Normalizing export shapes into the canonical model
/// - Inferring table lineage and reconciling it with declared dependencies
/// - The sync state machine that previews and commits

// Runtime-side definition types, issues and rename plans
pub mod types;

// Scheduler export parsing
pub mod normalizer;

// SQL lineage boundary and lineage-derived edges
pub mod lineage;

// Declared vs. inferred edge comparison
pub mod reconcile;

// Scheduler access behind a capability trait
pub mod source;

// Preview / execute orchestration
pub mod sync;

pub use lineage::{HttpLineageInferencer, LineageEdgeInferencer, LineageInferencer};
pub use source::{RuntimeSource, SchedulerClient};
pub use sync::{RuntimeSyncOrchestrator, SyncSettings};
