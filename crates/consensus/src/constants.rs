//! Consensus-wide constants shared across validation.

/// The maximum allowed size for a serialized block, in bytes (network rule).
pub const MAX_BLOCK_SIZE: usize = 1_000_000;
/// The maximum allowed number of signature check operations in a block (network rule).
pub const MAX_BLOCK_SIGOPS: usize = MAX_BLOCK_SIZE / 50;
/// The maximum size of a transaction the default relay policy accepts.
pub const MAX_STANDARD_TX_SIZE: usize = 100_000;
/// Coinbase transaction outputs can only be spent after this number of new blocks.
pub const COINBASE_MATURITY: i32 = 100;
/// Lock times below this value are block heights, at or above it unix timestamps.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;
/// Coinbase script_sig length bounds (network rule).
pub const MIN_COINBASE_SCRIPT_LEN: usize = 2;
pub const MAX_COINBASE_SCRIPT_LEN: usize = 100;
/// Pseudo-height given to coins synthesized from unconfirmed pool transactions.
pub const MEMPOOL_HEIGHT: i32 = 0x7fff_ffff;
/// How far a block timestamp may run ahead of adjusted time, in seconds.
pub const MAX_FUTURE_BLOCK_TIME: i64 = 2 * 60 * 60;
/// Number of ancestors sampled for the median-time-past rule.
pub const MEDIAN_TIME_SPAN: usize = 11;
/// Timestamp at which pay-to-script-hash evaluation becomes mandatory.
pub const P2SH_SWITCH_TIME: u32 = 1_333_238_400;

/// Default maximum serialized size of a generated block template.
pub const DEFAULT_BLOCK_MAX_SIZE: usize = 250_000;
/// Default minimum size a generated block is padded to with free transactions.
pub const DEFAULT_BLOCK_MIN_SIZE: usize = 0;
/// Portion of a generated block reserved for high-priority transactions.
pub const DEFAULT_BLOCK_PRIORITY_SIZE: usize = 27_000;
/// Priority above which a transaction may enter a block without paying fees.
pub const FREE_TX_PRIORITY: f64 = 100_000_000.0 * 144.0 / 250.0;

/// Default minimum relay fee, per 1000 bytes.
pub const MIN_RELAY_TX_FEE: i64 = 10_000;
/// Default free-relay budget, in thousand-bytes-per-minute.
pub const DEFAULT_FREE_RELAY_LIMIT: i64 = 15;

/// Orphan transaction pool bounds.
pub const MAX_ORPHAN_TRANSACTIONS: usize = 100;
pub const MAX_ORPHAN_TX_SIZE: usize = 5_000;
/// Orphan block pool bound.
pub const MAX_ORPHAN_BLOCKS: usize = 750;

/// Target number of coin records kept in the in-memory tip cache.
pub const DEFAULT_COIN_CACHE_SIZE: usize = 5_000;
