//! High-reliability admission filter (spec.md §4.5).
//!
//! Gates new versions behind an N-of-N matching-payload check: a version is
//! admitted only once the same manifest and per-kind payload digests have
//! been observed `reliability_threshold + 1` times consecutively.

use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::transaction::{CompletedFile, StagedPayload};
use crate::types::{FileKind, VersionKey};
use crate::util::digest::PayloadDigest;

/// Per-`(guid, hash)` bookkeeping kept until the version is admitted and
/// locked.
struct ReliabilityRecord {
  manifest: Vec<FileKind>,
  digests: HashMap<FileKind, PayloadDigest>,
  match_count: u32,
  locked: bool,
}

/// The outcome of submitting a finalized transaction to the filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
  /// Publish the payload now.
  Publish,
  /// Do not publish; the filter is still accumulating matching observations.
  Hold,
  /// The version is already locked; the transaction is discarded outright.
  Discard,
}

pub struct ReliabilityFilter {
  threshold: u32,
  records: Mutex<HashMap<VersionKey, ReliabilityRecord>>,
}

fn digest_manifest(files: &[CompletedFile]) -> (Vec<FileKind>, HashMap<FileKind, PayloadDigest>) {
  let mut manifest = Vec::with_capacity(files.len());
  let mut digests = HashMap::with_capacity(files.len());
  for file in files {
    manifest.push(file.kind);
    let digest = match &file.payload {
      StagedPayload::Memory(bytes) => PayloadDigest::of(bytes),
      StagedPayload::File(path) => {
        let bytes = std::fs::read(path).unwrap_or_default();
        PayloadDigest::of(&bytes)
      }
    };
    digests.insert(file.kind, digest);
  }
  (manifest, digests)
}

fn manifest_sets_equal(a: &[FileKind], b: &[FileKind]) -> bool {
  if a.len() != b.len() {
    return false;
  }
  a.iter().all(|k| b.contains(k))
}

impl ReliabilityFilter {
  pub fn new(threshold: u32) -> Self {
    Self {
      threshold,
      records: Mutex::new(HashMap::new()),
    }
  }

  pub fn threshold(&self) -> u32 {
    self.threshold
  }

  /// Whether `key` has already been admitted and locked.
  pub fn is_locked(&self, key: VersionKey) -> bool {
    self
      .records
      .lock()
      .get(&key)
      .map(|r| r.locked)
      .unwrap_or(false)
  }

  /// Submit a finalized transaction's completed files for admission
  /// consideration. See spec.md §4.5 for the full algorithm.
  pub fn submit(&self, key: VersionKey, files: &[CompletedFile]) -> Admission {
    let mut records = self.records.lock();
    let (manifest, digests) = digest_manifest(files);

    match records.get_mut(&key) {
      Some(record) if record.locked => {
        debug!(guid = %key.guid.to_hex(), hash = %key.hash.to_hex(), "discarding transaction against locked version");
        Admission::Discard
      }
      Some(record) => {
        let matches = manifest_sets_equal(&manifest, &record.manifest)
          && manifest
            .iter()
            .all(|k| digests.get(k) == record.digests.get(k));

        if matches {
          record.match_count += 1;
          if record.match_count > self.threshold {
            record.locked = true;
            info!(
              guid = %key.guid.to_hex(),
              hash = %key.hash.to_hex(),
              match_count = record.match_count,
              "version admitted and locked"
            );
            Admission::Publish
          } else {
            debug!(
              guid = %key.guid.to_hex(),
              hash = %key.hash.to_hex(),
              match_count = record.match_count,
              threshold = self.threshold,
              "matching observation recorded, holding"
            );
            Admission::Hold
          }
        } else {
          debug!(guid = %key.guid.to_hex(), hash = %key.hash.to_hex(), "manifest or payload mismatch, resetting counter");
          record.manifest = manifest;
          record.digests = digests;
          record.match_count = 1;
          Admission::Hold
        }
      }
      None => {
        let locked = 1 > self.threshold;
        records.insert(
          key,
          ReliabilityRecord {
            manifest,
            digests,
            match_count: 1,
            locked,
          },
        );
        if locked {
          info!(
            guid = %key.guid.to_hex(),
            hash = %key.hash.to_hex(),
            match_count = 1,
            "version admitted and locked"
          );
          Admission::Publish
        } else {
          debug!(
            guid = %key.guid.to_hex(),
            hash = %key.hash.to_hex(),
            match_count = 1,
            threshold = self.threshold,
            "first observation recorded, holding"
          );
          Admission::Hold
        }
      }
    }
  }

  /// Drop all bookkeeping. Used when reliability mode is toggled off.
  pub fn clear(&self) {
    self.records.lock().clear();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::transaction::{CompletedFile, StagedPayload};
  use crate::types::{Guid, Hash128};

  fn file(kind: FileKind, bytes: &[u8]) -> CompletedFile {
    CompletedFile {
      kind,
      size: bytes.len() as u64,
      payload: StagedPayload::Memory(bytes.to_vec()),
    }
  }

  #[test]
  fn requires_threshold_plus_one_matches() {
    let filter = ReliabilityFilter::new(1);
    let key = VersionKey::new(Guid::zero(), Hash128::zero());
    let files = vec![file(FileKind::Info, b"abc"), file(FileKind::Asset, b"xyz")];

    assert_eq!(filter.submit(key, &files), Admission::Hold);
    assert!(!filter.is_locked(key));
    assert_eq!(filter.submit(key, &files), Admission::Publish);
    assert!(filter.is_locked(key));
  }

  #[test]
  fn manifest_mismatch_resets_counter() {
    let filter = ReliabilityFilter::new(1);
    let key = VersionKey::new(Guid::zero(), Hash128::zero());
    let full = vec![file(FileKind::Info, b"abc"), file(FileKind::Asset, b"xyz")];
    let partial = vec![file(FileKind::Info, b"abc")];

    assert_eq!(filter.submit(key, &full), Admission::Hold);
    assert_eq!(filter.submit(key, &partial), Admission::Hold);
    assert!(!filter.is_locked(key));
    // Needs two more consecutive matches on `partial` from here.
    assert_eq!(filter.submit(key, &partial), Admission::Publish);
  }

  #[test]
  fn locked_version_discards_further_transactions() {
    let filter = ReliabilityFilter::new(0);
    let key = VersionKey::new(Guid::zero(), Hash128::zero());
    let files = vec![file(FileKind::Info, b"abc")];
    assert_eq!(filter.submit(key, &files), Admission::Publish);

    let different = vec![file(FileKind::Info, b"different-and-longer")];
    assert_eq!(filter.submit(key, &different), Admission::Discard);
  }
}
