//! Core value types: blob addressing and file metadata.

use std::convert::TryFrom;
use std::fmt;

use crate::constants::{GUID_SIZE, HASH_SIZE, KIND_ASSET, KIND_INFO, KIND_RESOURCE};
use crate::error::{CacheError, Result};

// ============================================================================
// Kind
// ============================================================================

/// The role a file plays within a version: info, asset, or resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FileKind {
  Info,
  Asset,
  Resource,
}

impl FileKind {
  pub fn as_char(self) -> char {
    self.as_byte() as char
  }

  pub fn as_byte(self) -> u8 {
    match self {
      FileKind::Info => KIND_INFO,
      FileKind::Asset => KIND_ASSET,
      FileKind::Resource => KIND_RESOURCE,
    }
  }
}

impl fmt::Display for FileKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.as_char())
  }
}

impl TryFrom<u8> for FileKind {
  type Error = CacheError;

  fn try_from(value: u8) -> Result<Self> {
    match value {
      KIND_INFO => Ok(FileKind::Info),
      KIND_ASSET => Ok(FileKind::Asset),
      KIND_RESOURCE => Ok(FileKind::Resource),
      other => Err(CacheError::invalid_argument(format!(
        "unknown file kind byte: {other:#04x}"
      ))),
    }
  }
}

impl TryFrom<char> for FileKind {
  type Error = CacheError;

  fn try_from(value: char) -> Result<Self> {
    if !value.is_ascii() {
      return Err(CacheError::invalid_argument(format!(
        "non-ascii file kind: {value:?}"
      )));
    }
    FileKind::try_from(value as u8)
  }
}

// ============================================================================
// Guid / Hash128
// ============================================================================

/// A 16-byte opaque asset identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Guid(pub [u8; GUID_SIZE]);

/// A 16-byte content digest accompanying a [`Guid`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash128(pub [u8; HASH_SIZE]);

macro_rules! impl_byte16 {
  ($name:ident, $size:expr) => {
    impl $name {
      pub fn zero() -> Self {
        $name([0u8; $size])
      }

      pub fn as_bytes(&self) -> &[u8; $size] {
        &self.0
      }

      pub fn to_hex(&self) -> String {
        crate::util::hexpath::encode_hex(&self.0)
      }
    }

    impl TryFrom<&[u8]> for $name {
      type Error = CacheError;

      fn try_from(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != $size {
          return Err(CacheError::invalid_argument(format!(
            "expected {} bytes, got {}",
            $size,
            bytes.len()
          )));
        }
        let mut arr = [0u8; $size];
        arr.copy_from_slice(bytes);
        Ok($name(arr))
      }
    }

    impl fmt::Debug for $name {
      fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", stringify!($name), self.to_hex())
      }
    }
  };
}

impl_byte16!(Guid, GUID_SIZE);
impl_byte16!(Hash128, HASH_SIZE);

// ============================================================================
// FileKey
// ============================================================================

/// Deterministic address of a single file within a version: `(kind, guid, hash)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileKey {
  pub kind: FileKind,
  pub guid: Guid,
  pub hash: Hash128,
}

impl FileKey {
  pub fn new(kind: FileKind, guid: Guid, hash: Hash128) -> Self {
    Self { kind, guid, hash }
  }

  /// The `(guid, hash)` this key belongs to, without the kind discriminant.
  pub fn version(&self) -> VersionKey {
    VersionKey {
      guid: self.guid,
      hash: self.hash,
    }
  }
}

/// A `(guid, hash)` pair naming a version, independent of file kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VersionKey {
  pub guid: Guid,
  pub hash: Hash128,
}

impl VersionKey {
  pub fn new(guid: Guid, hash: Hash128) -> Self {
    Self { guid, hash }
  }

  pub fn key(&self, kind: FileKind) -> FileKey {
    FileKey::new(kind, self.guid, self.hash)
  }
}

// ============================================================================
// FileInfo
// ============================================================================

/// Size of a committed file, returned by `getFileInfo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
  pub size: u64,
}
