//! Pluggable persistence adapter for the memory backend's index metadata
//! (spec.md §6: `persistenceOptions.adapter`).
//!
//! This is a configuration seam, not a third backend: it persists *layout*
//! metadata (page/free-list/index), never blob contents, so a process
//! restart can rebuild the index without rescanning page bytes. The
//! in-memory backend's content itself is not durable across a crash
//! (spec.md §1 non-goals).

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, WriteBytesExt};
use parking_lot::Mutex;

use crate::constants::{MAGIC_PERSISTED_INDEX, VERSION_PERSISTED_INDEX};
use crate::error::{CacheError, Result};

/// An opaque collaborator implementing `saveDatabase(blob)` /
/// `loadDatabase() -> blob` for index metadata.
pub trait PersistenceAdapter: Send + Sync {
  fn save_database(&self, blob: &[u8]) -> Result<()>;
  fn load_database(&self) -> Result<Option<Vec<u8>>>;
}

/// A no-op adapter: discards writes, always reports no prior state. Used by
/// default and in tests.
#[derive(Debug, Default)]
pub struct NoopPersistenceAdapter;

impl PersistenceAdapter for NoopPersistenceAdapter {
  fn save_database(&self, _blob: &[u8]) -> Result<()> {
    Ok(())
  }

  fn load_database(&self) -> Result<Option<Vec<u8>>> {
    Ok(None)
  }
}

/// Persists the index metadata to a single file on disk, framed with a
/// magic/version header and a `crc32fast` checksum, mirroring the framing
/// `kitedb` applies to its own on-disk structures.
pub struct JsonFilePersistenceAdapter {
  path: PathBuf,
  write_lock: Mutex<()>,
}

impl JsonFilePersistenceAdapter {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      write_lock: Mutex::new(()),
    }
  }
}

fn frame(blob: &[u8]) -> Result<Vec<u8>> {
  let mut out = Vec::with_capacity(blob.len() + 16);
  out.write_u32::<LittleEndian>(MAGIC_PERSISTED_INDEX)?;
  out.write_u32::<LittleEndian>(VERSION_PERSISTED_INDEX)?;
  out.write_u32::<LittleEndian>(crc32fast::hash(blob))?;
  out.write_u32::<LittleEndian>(blob.len() as u32)?;
  out.extend_from_slice(blob);
  Ok(out)
}

fn unframe(bytes: &[u8]) -> Result<Vec<u8>> {
  use byteorder::ReadBytesExt;
  let mut cursor = std::io::Cursor::new(bytes);
  let magic = cursor.read_u32::<LittleEndian>()?;
  if magic != MAGIC_PERSISTED_INDEX {
    return Err(CacheError::invalid_argument("bad persisted index magic"));
  }
  let _version = cursor.read_u32::<LittleEndian>()?;
  let checksum = cursor.read_u32::<LittleEndian>()?;
  let len = cursor.read_u32::<LittleEndian>()? as usize;
  let start = cursor.position() as usize;
  let blob = bytes
    .get(start..start + len)
    .ok_or_else(|| CacheError::invalid_argument("truncated persisted index"))?;
  if crc32fast::hash(blob) != checksum {
    return Err(CacheError::invalid_argument("persisted index checksum mismatch"));
  }
  Ok(blob.to_vec())
}

impl PersistenceAdapter for JsonFilePersistenceAdapter {
  fn save_database(&self, blob: &[u8]) -> Result<()> {
    let _guard = self.write_lock.lock();
    let framed = frame(blob)?;
    let tmp = tmp_path(&self.path);
    {
      let mut file = fs::File::create(&tmp)?;
      file.write_all(&framed)?;
      file.sync_all()?;
    }
    fs::rename(&tmp, &self.path)?;
    Ok(())
  }

  fn load_database(&self) -> Result<Option<Vec<u8>>> {
    match fs::read(&self.path) {
      Ok(bytes) => Ok(Some(unframe(&bytes)?)),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
      Err(e) => Err(e.into()),
    }
  }
}

fn tmp_path(path: &Path) -> PathBuf {
  let mut os = path.as_os_str().to_owned();
  os.push(".tmp");
  PathBuf::from(os)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn roundtrips_through_file() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = JsonFilePersistenceAdapter::new(dir.path().join("index.bin"));
    assert!(adapter.load_database().unwrap().is_none());
    adapter.save_database(b"{\"hello\":true}").unwrap();
    assert_eq!(
      adapter.load_database().unwrap().unwrap(),
      b"{\"hello\":true}".to_vec()
    );
  }

  #[test]
  fn noop_adapter_discards() {
    let adapter = NoopPersistenceAdapter;
    adapter.save_database(b"whatever").unwrap();
    assert!(adapter.load_database().unwrap().is_none());
  }
}
