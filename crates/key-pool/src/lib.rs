//! API-key pool and resilient operation wrapper
//!
//! Manages a fixed list of Gemini API keys, tracks per-key health, and rotates
//! away from throttled or broken keys under a cooldown. `Resilient` wraps any
//! credential-scoped operation (embedding, chat model construction, text
//! generation) with probe, classification, pool notification and a bounded
//! retry loop.
//!
//! Key lifecycle:
//! 1. Keys are loaded once at startup → all `Healthy`, the first one active
//! 2. An operation fails with a quota error → key marked `QuotaExceeded`
//! 3. An operation fails any other way → key marked `Failed`
//! 4. Marking the active key triggers a rotation to the next healthy key in
//!    declared order, unless the last rotation is still within the cooldown
//! 5. Once every key is marked the pool is exhausted; the active key stays put

pub mod error;
pub mod operations;
pub mod pool;
pub mod resilient;

pub use error::{Error, Result};
pub use operations::{ChatModel, EmbedDocuments, EmbedQuery, Generate};
pub use pool::{Failure, KeyPool, KeyStatus, PoolKey, PoolSnapshot, Rotation, SelectedKey};
pub use resilient::{DEFAULT_MAX_RETRIES, Operation, Resilient};
