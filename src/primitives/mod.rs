//! Low-level primitives shared by the store layers.

/// Upgradeable lock ladder and its scoped guards.
///
/// Every index read or write happens under a [`concurrency::LadderGuard`].
pub mod concurrency;
