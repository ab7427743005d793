//! Put-transaction state machine: buffers a version's files and atomically
//! commits them (spec.md §4.4).

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crossbeam_channel::Receiver;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{CacheError, Result};
use crate::types::{FileKind, Guid, Hash128};
use crate::util::events::FinalizeBroadcaster;
use crate::util::hexpath;

/// `Open -> Finalizing -> {Committed, Failed, Invalidated}` (spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
  Open,
  Finalizing,
  Committed,
  Failed,
  Invalidated,
}

/// Where a transaction's pending writes land while open. Chosen by the
/// engine that created the transaction; the memory backend stages in RAM,
/// the filesystem backend stages under `<cachePath>/.staging/<trxid>/`.
#[derive(Clone)]
pub(crate) enum StagingMode {
  Memory,
  Filesystem(PathBuf),
}

enum WriteSink {
  Memory(Vec<u8>),
  File { file: fs::File, path: PathBuf },
}

impl WriteSink {
  fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
    match self {
      WriteSink::Memory(v) => {
        v.extend_from_slice(buf);
        Ok(())
      }
      WriteSink::File { file, .. } => file.write_all(buf),
    }
  }

  fn into_payload(self) -> io::Result<StagedPayload> {
    match self {
      WriteSink::Memory(v) => Ok(StagedPayload::Memory(v)),
      WriteSink::File { mut file, path } => {
        file.flush()?;
        file.sync_all()?;
        Ok(StagedPayload::File(path))
      }
    }
  }
}

/// A pending write slot: declared size, bytes written so far, and its
/// staging sink.
struct PendingWrite {
  declared_size: u64,
  written: u64,
  sink: WriteSink,
}

/// The end result of a completed pending write.
#[derive(Debug, Clone)]
pub enum StagedPayload {
  /// Bytes staged entirely in memory (memory backend).
  Memory(Vec<u8>),
  /// Bytes staged in a temp file under the staging directory (filesystem backend).
  File(PathBuf),
}

/// A file that finished writing and passed the `bytesWritten == declaredSize`
/// check at finalize time.
#[derive(Debug, Clone)]
pub struct CompletedFile {
  pub kind: FileKind,
  pub size: u64,
  pub payload: StagedPayload,
}

struct TxInner {
  state: TransactionState,
  mode: StagingMode,
  pending: IndexMap<FileKind, PendingWrite>,
  manifest: Vec<FileKind>,
  files: Vec<CompletedFile>,
}

/// An ephemeral staging object holding up to three pending writes for a
/// single `(guid, hash)` (spec.md §3).
pub struct PutTransaction {
  pub(crate) guid: Guid,
  pub(crate) hash: Hash128,
  pub(crate) trx_id: u64,
  inner: Mutex<TxInner>,
  events: FinalizeBroadcaster,
}

/// A writable handle returned by [`PutTransaction::get_write_stream`]. Counts
/// bytes written as the caller streams data in; implements [`std::io::Write`].
pub struct WriteStream<'a> {
  trx: &'a PutTransaction,
  kind: FileKind,
}

impl PutTransaction {
  pub(crate) fn new(guid: Guid, hash: Hash128, trx_id: u64, mode: StagingMode) -> Self {
    Self {
      guid,
      hash,
      trx_id,
      inner: Mutex::new(TxInner {
        state: TransactionState::Open,
        mode,
        pending: IndexMap::new(),
        manifest: Vec::new(),
        files: Vec::new(),
      }),
      events: FinalizeBroadcaster::new(),
    }
  }

  pub fn guid(&self) -> Guid {
    self.guid
  }

  pub fn hash(&self) -> Hash128 {
    self.hash
  }

  pub fn state(&self) -> TransactionState {
    self.inner.lock().state
  }

  pub fn is_valid(&self) -> bool {
    matches!(self.inner.lock().state, TransactionState::Committed)
  }

  /// Kinds completed, in the order their writes finished (spec.md §4.4).
  pub fn manifest(&self) -> Vec<FileKind> {
    self.inner.lock().manifest.clone()
  }

  /// Resulting file descriptors. Empty until a successful `finalize()`.
  pub fn files(&self) -> Vec<CompletedFile> {
    self.inner.lock().files.clone()
  }

  pub fn subscribe_finalize(&self) -> Receiver<()> {
    self.events.subscribe()
  }

  /// Allocate a pending-write slot and return a stream that counts bytes.
  ///
  /// `kind` must be one of `i`, `a`, `r`; `size` must be > 0.
  pub fn get_write_stream(&self, kind: FileKind, size: u64) -> Result<WriteStream<'_>> {
    if size == 0 {
      return Err(CacheError::invalid_argument("declared size must be > 0"));
    }
    let mut inner = self.inner.lock();
    if inner.state != TransactionState::Open {
      return Err(CacheError::AlreadyFinalized);
    }
    let sink = match &inner.mode {
      StagingMode::Memory => WriteSink::Memory(Vec::with_capacity(size.min(1 << 20) as usize)),
      StagingMode::Filesystem(cache_path) => {
        let path = hexpath::staging_path(cache_path, self.trx_id, kind);
        if let Some(parent) = path.parent() {
          fs::create_dir_all(parent)?;
        }
        let file = fs::File::create(&path)?;
        WriteSink::File { file, path }
      }
    };
    inner.pending.insert(
      kind,
      PendingWrite {
        declared_size: size,
        written: 0,
        sink,
      },
    );
    drop(inner);
    trace!(trx_id = self.trx_id, kind = %kind, size, "write stream opened");
    Ok(WriteStream { trx: self, kind })
  }

  fn write_chunk(&self, kind: FileKind, buf: &[u8]) -> io::Result<usize> {
    let mut inner = self.inner.lock();
    let pending = inner
      .pending
      .get_mut(&kind)
      .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no pending write for kind"))?;
    pending.sink.write_all(buf)?;
    pending.written += buf.len() as u64;
    Ok(buf.len())
  }

  /// Mark a kind's write as finished, appending it to the completion order.
  /// Called when the caller is done writing a given kind (idempotent).
  pub fn close_write_stream(&self, kind: FileKind) {
    let mut inner = self.inner.lock();
    if !inner.manifest.contains(&kind) && inner.pending.contains_key(&kind) {
      inner.manifest.push(kind);
    }
  }

  /// Require `bytesWritten == declaredSize` for every pending write; on
  /// success populate `manifest`/`files` and fire the `finalize` event.
  pub fn finalize(&self) -> Result<()> {
    let mut inner = self.inner.lock();
    if inner.state != TransactionState::Open {
      return Err(CacheError::AlreadyFinalized);
    }
    inner.state = TransactionState::Finalizing;

    for (&kind, pending) in inner.pending.iter() {
      if pending.written != pending.declared_size {
        inner.state = TransactionState::Failed;
        debug!(
          trx_id = self.trx_id,
          kind = %kind,
          declared = pending.declared_size,
          written = pending.written,
          "incomplete write at finalize"
        );
        return Err(CacheError::IncompleteWrite {
          declared: pending.declared_size,
          written: pending.written,
        });
      }
    }

    // Completion order: whatever was explicitly closed, then any
    // not-yet-closed (but fully written) kinds in insertion order.
    let mut manifest = std::mem::take(&mut inner.manifest);
    for &kind in inner.pending.keys() {
      if !manifest.contains(&kind) {
        manifest.push(kind);
      }
    }

    let mut files = Vec::with_capacity(inner.pending.len());
    let pending = std::mem::take(&mut inner.pending);
    for (kind, pending_write) in pending {
      let size = pending_write.written;
      let payload = pending_write.sink.into_payload()?;
      files.push(CompletedFile { kind, size, payload });
    }

    inner.manifest = manifest;
    inner.files = files;
    inner.state = TransactionState::Committed;
    drop(inner);

    self.events.fire();
    debug!(trx_id = self.trx_id, "transaction finalized");
    Ok(())
  }

  /// Force the transaction to `Invalidated`, clearing `files`/`manifest` and
  /// making `is_valid()` report false, even after a successful finalize.
  pub fn invalidate(&self) {
    let mut inner = self.inner.lock();
    inner.state = TransactionState::Invalidated;
    inner.files.clear();
    inner.manifest.clear();
    inner.pending.clear();
  }

  /// Copy or materialize each completed file into `target_dir`, returning
  /// the written paths. Valid only after a successful `finalize()`.
  pub fn write_files_to_path(&self, target_dir: &Path) -> Result<Vec<PathBuf>> {
    let inner = self.inner.lock();
    if inner.state != TransactionState::Committed {
      return Err(CacheError::invalid_argument(
        "write_files_to_path requires a finalized transaction",
      ));
    }
    fs::create_dir_all(target_dir)?;
    let mut out = Vec::with_capacity(inner.files.len());
    for file in &inner.files {
      let dest = target_dir.join(format!(
        "{}{}{}",
        self.guid.to_hex(),
        self.hash.to_hex(),
        file.kind.as_char()
      ));
      match &file.payload {
        StagedPayload::Memory(bytes) => {
          fs::write(&dest, bytes)?;
        }
        StagedPayload::File(path) => {
          fs::copy(path, &dest)?;
        }
      }
      out.push(dest);
    }
    Ok(out)
  }
}

impl Write for WriteStream<'_> {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    self.trx.write_chunk(self.kind, buf)
  }

  fn flush(&mut self) -> io::Result<()> {
    Ok(())
  }
}

impl Drop for WriteStream<'_> {
  fn drop(&mut self) {
    self.trx.close_write_stream(self.kind);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn partial_write_fails_finalize() {
    let trx = PutTransaction::new(Guid::zero(), Hash128::zero(), 1, StagingMode::Memory);
    {
      let mut w = trx.get_write_stream(FileKind::Info, 1024).unwrap();
      w.write_all(&[0xAAu8; 1]).unwrap();
    }
    let err = trx.finalize().unwrap_err();
    assert!(matches!(err, CacheError::IncompleteWrite { .. }));
    assert!(!trx.is_valid());
    assert!(trx.files().is_empty());
  }

  #[test]
  fn full_write_finalizes_and_preserves_manifest_order() {
    let trx = PutTransaction::new(Guid::zero(), Hash128::zero(), 2, StagingMode::Memory);
    {
      let mut w = trx.get_write_stream(FileKind::Asset, 4).unwrap();
      w.write_all(b"BBBB").unwrap();
    }
    {
      let mut w = trx.get_write_stream(FileKind::Info, 4).unwrap();
      w.write_all(b"AAAA").unwrap();
    }
    trx.finalize().unwrap();
    assert!(trx.is_valid());
    assert_eq!(trx.manifest(), vec![FileKind::Asset, FileKind::Info]);
    assert_eq!(trx.files().len(), 2);
  }

  #[test]
  fn invalidate_clears_after_finalize() {
    let trx = PutTransaction::new(Guid::zero(), Hash128::zero(), 3, StagingMode::Memory);
    {
      let mut w = trx.get_write_stream(FileKind::Info, 2).unwrap();
      w.write_all(b"hi").unwrap();
    }
    trx.finalize().unwrap();
    trx.invalidate();
    assert!(!trx.is_valid());
    assert!(trx.files().is_empty());
  }

  #[test]
  fn finalize_fires_event() {
    let trx = PutTransaction::new(Guid::zero(), Hash128::zero(), 4, StagingMode::Memory);
    let rx = trx.subscribe_finalize();
    {
      let mut w = trx.get_write_stream(FileKind::Info, 2).unwrap();
      w.write_all(b"hi").unwrap();
    }
    trx.finalize().unwrap();
    assert!(rx.try_recv().is_ok());
  }
}
