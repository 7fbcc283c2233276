//! Compile-time sizing of the bounded engine tables.
//!
//! Everything tunable at runtime lives in [`crate::tcp::Config`]; the
//! constants here size fixed-capacity storage and therefore have to be
//! known at compile time.

/// Number of slots in the Path-MTU cache.
///
/// Entries without observers are evicted LRU-first once all slots are
/// taken; a connection to a remote that cannot get a slot fails to open.
pub const PMTU_CACHE_COUNT: usize = 32;
