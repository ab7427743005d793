//! Filesystem backend: blobs as files under a directory tree keyed by
//! `(guid, hash, kind)` (spec.md §4.3).

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::engine::{absorb_locked, CacheEngine, CacheOptions};
use crate::error::{CacheError, Result};
use crate::reliability::{Admission, ReliabilityFilter};
use crate::transaction::{CompletedFile, PutTransaction, StagedPayload, StagingMode};
use crate::types::{FileInfo, FileKey, FileKind, Guid, Hash128, VersionKey};
use crate::util::hexpath;

struct FsState {
  cache_path: PathBuf,
  reliability: Option<ReliabilityFilter>,
}

/// Blobs stored as files under a directory tree. `clustering = false`: the
/// filesystem provides no cross-process exclusion here (spec.md §5).
pub struct FilesystemCacheEngine {
  state: RwLock<Option<FsState>>,
  next_trx_id: AtomicU64,
}

impl Default for FilesystemCacheEngine {
  fn default() -> Self {
    Self::new()
  }
}

impl FilesystemCacheEngine {
  pub fn new() -> Self {
    Self {
      state: RwLock::new(None),
      next_trx_id: AtomicU64::new(1),
    }
  }

  fn with_state<T>(&self, f: impl FnOnce(&FsState) -> Result<T>) -> Result<T> {
    let guard = self.state.read();
    let state = guard
      .as_ref()
      .ok_or_else(|| CacheError::invalid_argument("engine not initialized; call init() first"))?;
    f(state)
  }

  fn commit_files(&self, cache_path: &Path, key: VersionKey, files: Vec<CompletedFile>, trx_id: u64) -> Result<()> {
    for file in &files {
      let staged_path = match &file.payload {
        StagedPayload::File(path) => path.clone(),
        StagedPayload::Memory(bytes) => {
          // Defensive: the filesystem backend always stages through temp
          // files, but honor an in-memory payload if one ever arrives.
          let path = hexpath::staging_path(cache_path, trx_id, file.kind);
          if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
          }
          fs::write(&path, bytes)?;
          path
        }
      };
      let final_path = hexpath::final_path(cache_path, &FileKey::new(file.kind, key.guid, key.hash));
      if let Some(parent) = final_path.parent() {
        fs::create_dir_all(parent)?;
      }
      fs::rename(&staged_path, &final_path)?;
      fsync_parent_dir(&final_path)?;
    }
    cleanup_staging(cache_path, trx_id);
    Ok(())
  }
}

#[cfg(unix)]
fn fsync_parent_dir(path: &Path) -> Result<()> {
  use std::os::unix::io::AsRawFd;

  if let Some(parent) = path.parent() {
    let dir = fs::File::open(parent)?;
    // Matches the belt-and-suspenders durability the page-pool layer applies
    // around its own writes: the rename is the publish step, this fsync is
    // what makes it survive a crash before `end_put_transaction` returns.
    let ret = unsafe { libc::fsync(dir.as_raw_fd()) };
    if ret != 0 {
      return Err(std::io::Error::last_os_error().into());
    }
  }
  Ok(())
}

#[cfg(not(unix))]
fn fsync_parent_dir(_path: &Path) -> Result<()> {
  Ok(())
}

fn cleanup_staging(cache_path: &Path, trx_id: u64) {
  let dir = hexpath::staging_dir(cache_path, trx_id);
  if let Err(e) = fs::remove_dir_all(&dir) {
    if e.kind() != std::io::ErrorKind::NotFound {
      debug!(error = %e, trx_id, "failed to clean up staging directory (ignored)");
    }
  }
}

impl CacheEngine for FilesystemCacheEngine {
  const CLUSTERING: bool = false;

  fn init(&self, options: CacheOptions) -> Result<()> {
    let mut guard = self.state.write();

    if let Some(existing) = guard.as_mut() {
      existing.reliability = if options.high_reliability {
        Some(ReliabilityFilter::new(
          options.high_reliability_options.reliability_threshold,
        ))
      } else {
        None
      };
      info!("filesystem backend reconfigured (reliability toggled)");
      return Ok(());
    }

    fs::create_dir_all(&options.cache_path)?;
    let reliability = options
      .high_reliability
      .then(|| ReliabilityFilter::new(options.high_reliability_options.reliability_threshold));

    *guard = Some(FsState {
      cache_path: options.cache_path,
      reliability,
    });
    debug!("filesystem backend initialized");
    Ok(())
  }

  fn shutdown(&self) -> Result<()> {
    let mut guard = self.state.write();
    if let Some(state) = guard.take() {
      let staging_root = state.cache_path.join(crate::constants::STAGING_DIR);
      let _ = fs::remove_dir_all(&staging_root);
    }
    Ok(())
  }

  fn create_put_transaction(&self, guid: Guid, hash: Hash128) -> Result<PutTransaction> {
    self.with_state(|state| {
      let trx_id = self.next_trx_id.fetch_add(1, Ordering::SeqCst);
      Ok(PutTransaction::new(
        guid,
        hash,
        trx_id,
        StagingMode::Filesystem(state.cache_path.clone()),
      ))
    })
  }

  fn end_put_transaction(&self, trx: PutTransaction) -> Result<()> {
    trx.finalize()?;
    let trx_id = trx.trx_id;
    let key = VersionKey::new(trx.guid(), trx.hash());
    let files = trx.files();

    let outcome = self.with_state(|state| {
      if let Some(filter) = &state.reliability {
        match filter.submit(key, &files) {
          Admission::Publish => Ok(true),
          Admission::Hold => Ok(false),
          Admission::Discard => Err(CacheError::Locked),
        }
      } else {
        Ok(true)
      }
    });

    match outcome {
      Ok(true) => self.with_state(|state| self.commit_files(&state.cache_path, key, files, trx_id)),
      Ok(false) => {
        self.with_state(|state| {
          cleanup_staging(&state.cache_path, trx_id);
          Ok(())
        })
      }
      Err(e) => {
        let cache_path = self.with_state(|state| Ok(state.cache_path.clone()));
        if let Ok(path) = cache_path {
          cleanup_staging(&path, trx_id);
        }
        absorb_locked(Err(e))
      }
    }
  }

  fn get_file_info(&self, kind: FileKind, guid: Guid, hash: Hash128) -> Result<FileInfo> {
    self.with_state(|state| {
      let path = hexpath::final_path(&state.cache_path, &FileKey::new(kind, guid, hash));
      let meta = fs::metadata(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
          CacheError::NotFound
        } else {
          CacheError::Io(e)
        }
      })?;
      Ok(FileInfo { size: meta.len() })
    })
  }

  fn get_file_stream(&self, kind: FileKind, guid: Guid, hash: Hash128) -> Result<Box<dyn Read + Send>> {
    self.with_state(|state| {
      let path = hexpath::final_path(&state.cache_path, &FileKey::new(kind, guid, hash));
      let file = fs::File::open(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
          CacheError::NotFound
        } else {
          CacheError::Io(e)
        }
      })?;
      Ok(Box::new(file) as Box<dyn Read + Send>)
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::{Read as _, Write as _};

  fn engine(dir: &Path) -> FilesystemCacheEngine {
    let engine = FilesystemCacheEngine::new();
    engine.init(CacheOptions::new(dir)).unwrap();
    engine
  }

  #[test]
  fn round_trip_basic_commit() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    let guid = Guid::zero();
    let hash = Hash128::zero();

    let trx = engine.create_put_transaction(guid, hash).unwrap();
    {
      let mut w = trx.get_write_stream(FileKind::Asset, 3).unwrap();
      w.write_all(b"bbb").unwrap();
    }
    engine.end_put_transaction(trx).unwrap();

    let info = engine.get_file_info(FileKind::Asset, guid, hash).unwrap();
    assert_eq!(info.size, 3);

    let mut stream = engine.get_file_stream(FileKind::Asset, guid, hash).unwrap();
    let mut out = Vec::new();
    stream.read_to_end(&mut out).unwrap();
    assert_eq!(out, b"bbb");
  }

  #[test]
  fn partial_write_never_becomes_visible() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    let guid = Guid::zero();
    let hash = Hash128::zero();

    let trx = engine.create_put_transaction(guid, hash).unwrap();
    {
      let mut w = trx.get_write_stream(FileKind::Info, 1024).unwrap();
      w.write_all(&[1u8]).unwrap();
    }
    assert!(engine.end_put_transaction(trx).is_err());
    assert!(matches!(
      engine.get_file_info(FileKind::Info, guid, hash).unwrap_err(),
      CacheError::NotFound
    ));
  }

  #[test]
  fn replace_overwrites_final_path_atomically() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    let guid = Guid::zero();
    let hash = Hash128::zero();

    for payload in [&b"first"[..], &b"second-longer"[..]] {
      let trx = engine.create_put_transaction(guid, hash).unwrap();
      {
        let mut w = trx.get_write_stream(FileKind::Info, payload.len() as u64).unwrap();
        w.write_all(payload).unwrap();
      }
      engine.end_put_transaction(trx).unwrap();
    }

    let mut out = Vec::new();
    engine
      .get_file_stream(FileKind::Info, guid, hash)
      .unwrap()
      .read_to_end(&mut out)
      .unwrap();
    assert_eq!(out, b"second-longer");
  }
}
