/// Workflow Management Layer
///
/// Declared workflow model and everything that operates on it:
/// - Type definitions (Task, Edge, WorkflowDefinition, Schedule)
/// - Topology analysis and structural diffing
/// - Versioning with optimistic commits over a narrow store interface
/// - SQLite persistence with sqlx
/// - Lock-free table catalog using ArcSwap

// Core workflow type definitions
pub mod types;

// Adjacency and entry/exit computation over petgraph
pub mod topology;

// Order-independent hashing and field-level diffs
pub mod diff;

// Version snapshots, compare and rollback
pub mod version;

// Store interface plus the in-process implementation
pub mod store;

// SQLite persistence layer
pub mod storage;

// Hot-reload table catalog for lineage resolution
pub mod registry;

// Re-export commonly used types
pub use types::{Edge, NodeType, Task, TaskCode, WorkflowDefinition, ENTRY_SENTINEL};
pub use version::{TriggerSource, VersionManager};
