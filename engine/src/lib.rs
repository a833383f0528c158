//! # Shopsync Engine
//!
//! A deterministic offline-first mutation queue and reconciliation engine
//! for shop-management data (products, customers, sales, transactions and
//! debt payments).
//!
//! The engine keeps a local cache that is always readable, applies every
//! mutation optimistically, queues it for the remote backend and reconciles
//! the authoritative result when connectivity allows.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine never touches files, sockets or clocks. Durable
//!   storage is injected through the [`Storage`] trait and time is passed in
//!   as a millisecond [`Timestamp`].
//! - **Deterministic**: the same inputs always produce the same cache, queue
//!   and event outbox.
//! - **Step-driven sync**: remote calls are described as [`SyncStep`]s; the
//!   host performs them and reports a [`RemoteOutcome`] back.
//!
//! ## Components
//!
//! - [`LocalCacheStore`] - write-through entity cache with observers
//! - [`PendingQueue`] - ordered, coalescing log of deferred mutations
//! - [`NetworkMonitor`] - debounced online/offline state machine
//! - [`optimistic`] - immediate local application of mutations
//! - [`reconcile`] - planning remote calls and resolving their outcomes
//! - [`ChangeListener`] - buffering and debouncing of realtime changes
//!
//! ## Quick Start
//!
//! ```rust
//! use shopsync_engine::{Engine, EngineConfig, EntityType, MemoryStorage, Mutation};
//! use serde_json::json;
//!
//! let mut engine = Engine::open(
//!     EngineConfig::new("till-1"),
//!     Box::new(MemoryStorage::new()),
//! )
//! .unwrap();
//!
//! let fields = json!({"name": "Rice 5kg", "current_stock": 10});
//! let product = engine
//!     .mutate(Mutation::create(EntityType::Product, fields.as_object().unwrap().clone()), 1_000)
//!     .unwrap();
//!
//! // Optimistic: visible immediately, field names normalized at the boundary.
//! assert!(product.is_temporary());
//! assert_eq!(product.fields["currentStock"], json!(10));
//! assert_eq!(engine.entities(EntityType::Product).len(), 1);
//! assert_eq!(engine.queue().len(), 1);
//! ```

pub mod cache;
pub mod engine;
pub mod entity;
pub mod error;
pub mod events;
pub mod monitor;
pub mod operation;
pub mod optimistic;
pub mod queue;
pub mod realtime;
pub mod reconcile;
pub mod schema;
pub mod sequence;
pub mod snapshot;
pub mod storage;

// Re-export main types at crate root
pub use cache::{CacheChange, LocalCacheStore, SubscriptionId};
pub use engine::{Engine, EngineConfig, EntityStatus};
pub use entity::{Confirmed, Entity, EntityKey, EntityType, Fields, SyncState, TEMP_ID_PREFIX};
pub use error::Error;
pub use events::{ConflictPolicy, EngineEvent};
pub use monitor::{NetworkMonitor, Transition};
pub use operation::{
    Adjustment, Change, LinkedUpdate, Mutation, OperationKind, OperationStatus, PendingOperation,
    Phase, Priority,
};
pub use optimistic::AppliedLog;
pub use queue::{EnqueueOutcome, FailureOutcome, PendingQueue};
pub use realtime::{ChangeEventType, ChangeListener, RemoteChange};
pub use reconcile::{RemoteOutcome, RemoteRequest, Stage, StepResult, SyncStep};
pub use schema::{EntitySchema, FieldDef, FieldType, Schema};
pub use sequence::OpSequence;
pub use snapshot::{CollectionSnapshot, QueueSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use storage::{MemoryStorage, Storage};

/// Type aliases for clarity
pub type EntityId = String;
pub type OperationId = String;
pub type NodeId = String;
pub type Timestamp = u64;
