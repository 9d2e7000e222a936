//! Explicit limits for Shoal deployments.
//!
//! All resources are bounded up front; exceeding a limit is a configuration
//! error caught at construction time, not a runtime surprise.

/// Maximum number of shards a deployment may configure.
///
/// The shard universe is fixed for the lifetime of a deployment, so this is
/// checked once when a member is created.
pub const SHARDS_MAX: u32 = 65_536;

/// Number of random bytes in a generated member identifier.
///
/// Hex encoding doubles this, producing 32-character identifiers.
pub const MEMBER_ID_RANDOM_LEN: usize = 16;
