//! Synchronization core.
//!
//! Keeps local work items and their remote tracker copies consistent
//! without silently discarding either side's edits:
//!
//! - **Normalize**: tracker payloads and local entities → [`NormalizedSnapshot`](crate::model::NormalizedSnapshot)
//! - **Cache**: last fetched remote snapshot per entity, with a TTL
//! - **Links**: bijective local ↔ remote identity table
//! - **Detect**: three-way field classification against the last synced base
//! - **Orchestrate**: fetch → normalize → compare → apply, one atomic commit per entity
//!
//! # Example
//!
//! ```ignore
//! use tl::sync::{Collection, SyncOrchestrator};
//!
//! let orchestrator = SyncOrchestrator::builder(client, local, store).build();
//! let report = orchestrator.run(&Collection::for_kind(EntityKind::Issue)).await?;
//! println!("{} fields applied", report.total_applied());
//! ```

pub mod cache;
pub mod conflict;
pub mod events;
mod hash;
pub mod links;
pub mod normalize;
pub mod orchestrator;
pub mod report;
pub mod state;

pub use cache::{CacheEntry, CacheScope, CacheSummary, Clock, ManualClock, SyncCache, SystemClock};
pub use conflict::{
    Classification, ConflictDetector, ConflictRecord, Detection, Direction, EntityStatus,
    FieldChange, FieldVerdict, SeedPolicy,
};
pub use events::{default_sink, EventSink, RecordingSink, SharedSink, SyncEvent, TracingSink};
pub use hash::fingerprint;
pub use links::{LinkError, LinkRecord, LinkTable};
pub use normalize::{DegradeReason, Degraded, Normalized, StateNormalizer, TimestampSource};
pub use orchestrator::{
    CancelFlag, Collection, OrchestratorBuilder, RunPhase, SyncError, SyncOptions,
    SyncOrchestrator, DEFAULT_CONCURRENCY,
};
pub use report::{EntityReport, Outcome, SyncReport};
pub use state::{list_conflicts, load_base, ConflictSet, StoredBase};
