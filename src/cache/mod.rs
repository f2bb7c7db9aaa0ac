//! Content-addressed build cache
//!
//! Compiled build trees are stored under the SHA-256 of the exact component
//! source that produced them. Same source = same cache entry.
//!
//! # Consistency Model
//!
//! - Entries are staged under a hidden name and renamed into place, so a
//!   lookup sees either a complete tree or nothing
//! - At most one writer per digest; any number of readers
//! - The janitor evicts under a per-entry try-lock and skips entries in use
//! - A reader that finds an entry gone treats it as a miss and rebuilds
//!
//! # Entry Lifecycle
//!
//! | State | Location | Visible to lookup |
//! |-------|----------|-------------------|
//! | Staging | `<cache>/.partial-<digest>-<uuid>` | no |
//! | Complete | `<cache>/<digest>` | yes |
//! | Expired | removed by the janitor | no |

pub mod digest;
pub mod janitor;
pub mod lock;
pub mod store;

pub use digest::{ContentDigest, SourceSubmission};
pub use janitor::{CacheJanitor, JanitorHandle, SweepReport};
pub use store::{CacheEntry, CachePin, CacheStore, Eviction};
