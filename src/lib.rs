/// Mechasync: reconciles scheduler workflows with their declared platform copies
///
/// This library provides the runtime sync engine: export normalization, SQL lineage
/// based edge inference, edge reconciliation, structural diffing and an
/// append-only version history with optimistic commits.

// Error taxonomy shared by every layer
pub mod error;

// Core configuration and setup
pub mod config;

// Workflow model, versioning and persistence
pub mod workflow;

// Runtime reconciliation - scheduler access, lineage and the sync state machine
pub mod runtime;

// HTTP API layer - thin REST adapters
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use error::{Result, SyncError};
pub use runtime::RuntimeSyncOrchestrator;
pub use server::start_server;
pub use workflow::{Edge, NodeType, Task, VersionManager, WorkflowDefinition};
