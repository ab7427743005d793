//! Payload digesting for the reliability filter.
//!
//! The admission filter only needs byte-identity comparisons across
//! observations, not a cryptographically strong digest (spec leaves the
//! algorithm unspecified). `xxhash-rust`'s Xxh3 is already part of the
//! dependency stack this crate is grounded on, so it is reused here instead
//! of pulling in `sha2`.

use xxhash_rust::xxh3::Xxh3;

/// A 128-bit content digest, compared for equality only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadDigest(u128);

impl PayloadDigest {
  pub fn of(bytes: &[u8]) -> Self {
    let mut hasher = Xxh3::new();
    hasher.update(bytes);
    PayloadDigest(hasher.digest128())
  }
}
