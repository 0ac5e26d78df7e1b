//! Constants and configuration defaults for the XArray

/// Widest supported node: 64 slots, so one `u64` covers a tag bitmap.
pub const MAX_CHUNK_SHIFT: u8 = 6;
pub const MAX_CHUNK_SIZE: usize = 1 << MAX_CHUNK_SHIFT;
pub const MIN_CHUNK_SHIFT: u8 = 2;
pub const DEFAULT_CHUNK_SHIFT: u8 = 6;

pub const MAX_TAGS: usize = 8;
pub const DEFAULT_TAGS: u8 = 3;

pub const CACHE_LINE: usize = 64;

/// Bits in an index.
pub const INDEX_BITS: u32 = usize::BITS;

/// Largest payload a `Value` entry can carry (top bit is the discriminant).
pub const MAX_VALUE: usize = usize::MAX >> 1;

// Internal entry payloads. Below `INTERNAL_NODE_MIN` an internal entry is a
// sentinel; at or above it, a node pointer.
pub const SIBLING_LIMIT: usize = MAX_CHUNK_SIZE;
pub const RETRY_CODE: usize = 256;
pub const DELETED_CODE: usize = 257;
pub const INTERNAL_NODE_MIN: usize = 4096;

// Environment knobs read by `XArrayConfig::from_env`.
pub const ENV_CHUNK_SHIFT: &str = "XARRAY_CHUNK_SHIFT";
pub const ENV_TAGS: &str = "XARRAY_TAGS";
pub const ENV_ALLOC: &str = "XARRAY_ALLOC";
