//! Strata Chunk - chunk lifecycle, archival and search
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         ChunkStore                           │
//! │                                                              │
//! │  append ─▶ active Chunk ─▶ RolloverPolicy ─▶ seal + swap     │
//! │                                                   │          │
//! │  query ─▶ [sealed…, active] ─▶ spawn_blocking      ▼          │
//! │              (snapshot)       per chunk        Archiver       │
//! └──────────────────────────────────────────────────┬───────────┘
//!                                                    │
//!                        ┌───────────────────────────┼──────────────┐
//!                        ▼                           ▼              │
//!                   BlobStore               CoordinationDirectory   │
//!                (framed index export)   (LIVE marker → blob path) ◀┘
//! ```

pub mod archive;
pub mod blob;
pub mod chunk;
pub mod index;
pub mod retry;
pub mod rollover;
pub mod search;
pub mod store;

pub use archive::{ArchiveContext, Archiver, decode_archive, encode_archive};
pub use blob::{BlobStore, FsBlobStore};
pub use chunk::{Chunk, ChunkState};
pub use index::{IndexFactory, IndexStore, TantivyIndex, TantivyIndexFactory};
pub use retry::{RetryPolicy, retry_with_backoff};
pub use rollover::RolloverPolicy;
pub use search::{DateHistogram, FieldFilter, HistogramBucket, SearchQuery, SearchResult};
pub use store::{ChunkStore, ChunkStoreConfig};
