//! Magic numbers and default tunables for the cache engine.

// ============================================================================
// Kind vocabulary
// ============================================================================

/// Info blob kind character.
pub const KIND_INFO: u8 = b'i';
/// Asset blob kind character.
pub const KIND_ASSET: u8 = b'a';
/// Resource blob kind character.
pub const KIND_RESOURCE: u8 = b'r';

// ============================================================================
// Key sizes
// ============================================================================

/// Size in bytes of a GUID.
pub const GUID_SIZE: usize = 16;
/// Size in bytes of a content hash.
pub const HASH_SIZE: usize = 16;

// ============================================================================
// Memory backend defaults
// ============================================================================

/// Default page size for the memory backend (1 MiB).
pub const DEFAULT_PAGE_SIZE: usize = 1024 * 1024;

/// Default minimum free block size (1 KiB). Residuals smaller than this
/// after an allocation are absorbed into the allocated block rather than
/// tracked in the free list.
pub const DEFAULT_MIN_FREE_BLOCK_SIZE: usize = 1024;

// ============================================================================
// Persistence metadata framing
// ============================================================================

/// Magic bytes for the JSON persistence adapter's on-disk frame: "VCDB".
pub const MAGIC_PERSISTED_INDEX: u32 = 0x42444356;

/// Current version of the persisted index metadata format.
pub const VERSION_PERSISTED_INDEX: u32 = 1;

// ============================================================================
// Reliability filter defaults
// ============================================================================

/// Default reliability threshold: admit on the second matching observation.
pub const DEFAULT_RELIABILITY_THRESHOLD: u32 = 1;

// ============================================================================
// Filesystem backend layout
// ============================================================================

/// Name of the staging directory under `cachePath`.
pub const STAGING_DIR: &str = ".staging";

/// Number of hex characters of the GUID used as the prefix directory.
pub const GUID_PREFIX_LEN: usize = 2;
