//! codeassist cache - response cache and invalidation engine for LLM completions

pub mod cache;
pub mod clock;
pub mod entry;
pub mod fingerprint;
pub mod inflight;
pub mod invalidation;
pub mod metrics;
pub mod persistence;
pub mod refresh;
pub mod store;

pub use cache::*;
pub use clock::*;
pub use entry::*;
pub use fingerprint::*;
pub use inflight::*;
pub use invalidation::*;
pub use metrics::*;
pub use refresh::*;
