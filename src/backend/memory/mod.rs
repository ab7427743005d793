//! Memory backend: a fixed-size paged pool with free-list allocation
//! (spec.md §4.2).

mod pager;

use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::engine::{absorb_locked, CacheEngine, CacheOptions, PersistenceAdapter};
use crate::error::{CacheError, Result};
use crate::reliability::{Admission, ReliabilityFilter};
use crate::transaction::{PutTransaction, StagedPayload, StagingMode};
use crate::types::{FileInfo, FileKey, FileKind, Guid, Hash128};

use pager::{MemRegion, PagePoolState};

struct EngineState {
  pool: Arc<Mutex<PagePoolState>>,
  reliability: Option<ReliabilityFilter>,
  persistence: Arc<dyn PersistenceAdapter>,
}

/// A fixed-size paged pool with free-block allocation, matching spec.md
/// §4.2. `clustering = false`: state lives in this process only.
pub struct MemoryCacheEngine {
  state: RwLock<Option<EngineState>>,
  next_trx_id: AtomicU64,
}

impl Default for MemoryCacheEngine {
  fn default() -> Self {
    Self::new()
  }
}

impl MemoryCacheEngine {
  pub fn new() -> Self {
    Self {
      state: RwLock::new(None),
      next_trx_id: AtomicU64::new(1),
    }
  }

  fn with_state<T>(&self, f: impl FnOnce(&EngineState) -> Result<T>) -> Result<T> {
    let guard = self.state.read();
    let state = guard.as_ref().ok_or_else(|| {
      CacheError::invalid_argument("engine not initialized; call init() first")
    })?;
    f(state)
  }

  fn commit_files(&self, key: crate::types::VersionKey, files: Vec<crate::transaction::CompletedFile>) -> Result<()> {
    self.with_state(|state| {
      for file in files {
        let bytes = match &file.payload {
          StagedPayload::Memory(bytes) => bytes.clone(),
          StagedPayload::File(path) => std::fs::read(path)?,
        };
        let region = PagePoolState::allocate_and_write(&state.pool, &bytes);
        let file_key = FileKey::new(file.kind, key.guid, key.hash);
        state.pool.lock().index.insert(file_key, region);
      }
      Ok(())
    })
  }
}

impl CacheEngine for MemoryCacheEngine {
  const CLUSTERING: bool = false;

  fn init(&self, options: CacheOptions) -> Result<()> {
    let mut guard = self.state.write();

    if let Some(existing) = guard.as_mut() {
      // Soft reconfiguration: preserve the index, reconfigure reliability
      // only, abort no in-flight transactions (spec.md §9 open questions).
      existing.reliability = if options.high_reliability {
        Some(ReliabilityFilter::new(
          options.high_reliability_options.reliability_threshold,
        ))
      } else {
        None
      };
      info!("memory backend reconfigured (reliability toggled)");
      return Ok(());
    }

    if let Some(persisted) = options.persistence.adapter.load_database()? {
      info!(
        bytes = persisted.len(),
        "found persisted index metadata from a previous session; memory backend \
         content is not durable across restarts (spec non-goal), starting empty"
      );
    }

    let pool = Arc::new(Mutex::new(PagePoolState::new(
      options.page_size,
      options.min_free_block_size,
    )));
    let reliability = options
      .high_reliability
      .then(|| ReliabilityFilter::new(options.high_reliability_options.reliability_threshold));

    *guard = Some(EngineState {
      pool,
      reliability,
      persistence: options.persistence.adapter,
    });
    debug!(page_size = options.page_size, "memory backend initialized");
    Ok(())
  }

  fn shutdown(&self) -> Result<()> {
    let mut guard = self.state.write();
    if let Some(state) = guard.take() {
      let pool = state.pool.lock();
      let summary = serde_json::json!({
        "page_count": pool.page_count(),
        "page_size": pool.page_size(),
        "entry_count": pool.index.len(),
      });
      drop(pool);
      if let Ok(bytes) = serde_json::to_vec(&summary) {
        if let Err(e) = state.persistence.save_database(&bytes) {
          debug!(error = %e, "persistence adapter failed to save on shutdown (ignored)");
        }
      }
    }
    Ok(())
  }

  fn create_put_transaction(&self, guid: Guid, hash: Hash128) -> Result<PutTransaction> {
    self.with_state(|_state| {
      let trx_id = self.next_trx_id.fetch_add(1, Ordering::SeqCst);
      Ok(PutTransaction::new(guid, hash, trx_id, StagingMode::Memory))
    })
  }

  fn end_put_transaction(&self, trx: PutTransaction) -> Result<()> {
    trx.finalize()?;
    let key = crate::types::VersionKey::new(trx.guid(), trx.hash());
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
      Ok(true) => self.commit_files(key, files),
      Ok(false) => Ok(()),
      Err(e) => absorb_locked(Err(e)),
    }
  }

  fn get_file_info(&self, kind: FileKind, guid: Guid, hash: Hash128) -> Result<FileInfo> {
    self.with_state(|state| {
      let key = FileKey::new(kind, guid, hash);
      let pool = state.pool.lock();
      pool
        .index
        .get(&key)
        .map(|region| FileInfo { size: region.payload_len })
        .ok_or(CacheError::NotFound)
    })
  }

  fn get_file_stream(&self, kind: FileKind, guid: Guid, hash: Hash128) -> Result<Box<dyn Read + Send>> {
    self.with_state(|state| {
      let key = FileKey::new(kind, guid, hash);
      let region = state
        .pool
        .lock()
        .index
        .get(&key)
        .cloned()
        .ok_or(CacheError::NotFound)?;
      Ok(Box::new(MemReadStream { region, pos: 0 }) as Box<dyn Read + Send>)
    })
  }
}

/// A read stream over a single reference-counted region snapshot. Holding
/// this alive keeps the underlying block allocated even if the index is
/// later swapped to a newer version for the same key (spec.md §3, §5).
struct MemReadStream {
  region: Arc<MemRegion>,
  pos: u64,
}

impl Read for MemReadStream {
  fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
    let n = self.region.read_at(self.pos, buf)?;
    self.pos += n as u64;
    Ok(n)
  }
}
