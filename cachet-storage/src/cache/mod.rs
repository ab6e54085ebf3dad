//! Fetch-through cache entries.
//!
//! A [`CacheEntry`] turns a key function and a fetch function into a cached
//! call. The read path differs by mode:
//!
//! - **Server**: local memo layer, then the shared store through the
//!   circuit breaker, then the fetch function. Stale values inside their
//!   window are served at once and refreshed in the background.
//! - **Serverless**: the versioned payload for the current counter, then the
//!   fetch function. Nothing runs after the call returns.
//!
//! The mode is fixed when the entry is created; each mode is one
//! [`EntryStrategy`](strategy::EntryStrategy) implementation.
//!
//! # Example
//!
//! ```ignore
//! let users = registry.entry(
//!     "users",
//!     EntryOptions::<u64, User>::new()
//!         .fetch(move |id| { let db = db.clone(); async move { db.user(id).await } })
//!         .ttl(TtlPolicy::Fixed(Duration::from_secs(300)))
//!         .swr(Duration::from_secs(30)),
//! )?;
//!
//! let user = users.get(42).await?;
//! users.invalidate(&42).await?;
//! ```

mod engine;
mod entry;
mod options;
mod server;
mod serverless;
mod strategy;

pub use engine::{CacheArgs, CacheValue};
pub use entry::CacheEntry;
pub use options::{default_key, EntryOptions, FetchFn, KeyFn, Tags, WarmEntry};

pub(crate) use engine::EntryCore;
pub(crate) use server::ServerStrategy;
pub(crate) use serverless::ServerlessStrategy;
pub(crate) use strategy::EntryStrategy;
