//! Shared cache-engine contract (spec.md §4.1) and configuration types.

pub mod persistence;

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use crate::constants::{DEFAULT_MIN_FREE_BLOCK_SIZE, DEFAULT_PAGE_SIZE, DEFAULT_RELIABILITY_THRESHOLD};
use crate::error::Result;
use crate::transaction::PutTransaction;
use crate::types::{FileInfo, FileKind, Guid, Hash128};

pub use persistence::{NoopPersistenceAdapter, PersistenceAdapter};

/// Options controlling high-reliability admission (spec.md §6).
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct HighReliabilityOptions {
  pub reliability_threshold: u32,
}

impl Default for HighReliabilityOptions {
  fn default() -> Self {
    Self {
      reliability_threshold: DEFAULT_RELIABILITY_THRESHOLD,
    }
  }
}

/// Persistence configuration for the memory backend's index metadata.
#[derive(Clone)]
pub struct PersistenceOptions {
  pub adapter: Arc<dyn PersistenceAdapter>,
}

impl Default for PersistenceOptions {
  fn default() -> Self {
    Self {
      adapter: Arc::new(NoopPersistenceAdapter),
    }
  }
}

/// `init(options)` configuration (spec.md §6).
#[derive(Clone)]
pub struct CacheOptions {
  pub cache_path: PathBuf,
  pub page_size: usize,
  pub min_free_block_size: usize,
  pub persistence: PersistenceOptions,
  pub high_reliability: bool,
  pub high_reliability_options: HighReliabilityOptions,
}

impl CacheOptions {
  pub fn new(cache_path: impl Into<PathBuf>) -> Self {
    Self {
      cache_path: cache_path.into(),
      page_size: DEFAULT_PAGE_SIZE,
      min_free_block_size: DEFAULT_MIN_FREE_BLOCK_SIZE,
      persistence: PersistenceOptions::default(),
      high_reliability: false,
      high_reliability_options: HighReliabilityOptions::default(),
    }
  }

  pub fn page_size(mut self, value: usize) -> Self {
    self.page_size = value;
    self
  }

  pub fn min_free_block_size(mut self, value: usize) -> Self {
    self.min_free_block_size = value;
    self
  }

  pub fn persistence(mut self, adapter: Arc<dyn PersistenceAdapter>) -> Self {
    self.persistence = PersistenceOptions { adapter };
    self
  }

  pub fn high_reliability(mut self, value: bool) -> Self {
    self.high_reliability = value;
    self
  }

  pub fn reliability_threshold(mut self, value: u32) -> Self {
    self.high_reliability_options.reliability_threshold = value;
    self
  }
}

/// The capability set both backends implement (spec.md §4.1, §9 "dynamic
/// dispatch across backends"). Not a marker of runtime type identity: each
/// concrete backend is a distinct type bound by this trait.
pub trait CacheEngine: Send + Sync {
  /// Whether multiple engine instances may safely share the same
  /// `cachePath`. Both backends answer `false`: the filesystem backend has
  /// no cross-process exclusion, and the memory backend's state is
  /// process-local.
  const CLUSTERING: bool;

  fn init(&self, options: CacheOptions) -> Result<()>;

  fn shutdown(&self) -> Result<()>;

  fn create_put_transaction(&self, guid: Guid, hash: Hash128) -> Result<PutTransaction>;

  /// Finalize and commit `trx`. `Locked` is absorbed here: a write against
  /// a reliability-locked version is accepted syntactically but leaves the
  /// stored bytes untouched.
  fn end_put_transaction(&self, trx: PutTransaction) -> Result<()>;

  fn get_file_info(&self, kind: FileKind, guid: Guid, hash: Hash128) -> Result<FileInfo>;

  fn get_file_stream(&self, kind: FileKind, guid: Guid, hash: Hash128) -> Result<Box<dyn Read + Send>>;
}

/// Absorb a `Locked` error into a successful no-op, logging it for
/// diagnostics (spec.md §7).
pub(crate) fn absorb_locked(result: Result<()>) -> Result<()> {
  match result {
    Err(e) if e.is_locked() => {
      tracing::debug!("write against locked version absorbed as no-op");
      Ok(())
    }
    other => other,
  }
}
