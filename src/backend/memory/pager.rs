//! Paged allocator: fixed-size pages, each with a free-block list, first-fit
//! allocation with a minimum-free-block absorption rule (spec.md §4.2).

use std::sync::{Arc, Weak};

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::types::FileKey;

/// A contiguous free extent within a page.
#[derive(Debug, Clone, Copy)]
struct Block {
  offset: usize,
  length: usize,
}

struct Page {
  buf: Vec<u8>,
  free: Vec<Block>,
}

impl Page {
  fn new(size: usize) -> Self {
    Self {
      buf: vec![0u8; size],
      free: vec![Block { offset: 0, length: size }],
    }
  }

  /// First-fit search within this page. Returns the matched block's index
  /// in `free`, if any.
  fn find_fit(&self, n: usize) -> Option<usize> {
    self.free.iter().position(|b| b.length >= n)
  }

  fn merge_adjacent(&mut self) {
    self.free.sort_by_key(|b| b.offset);
    let mut merged: Vec<Block> = Vec::with_capacity(self.free.len());
    for block in self.free.drain(..) {
      if let Some(last) = merged.last_mut() {
        if last.offset + last.length == block.offset {
          last.length += block.length;
          continue;
        }
      }
      merged.push(block);
    }
    self.free = merged;
  }
}

/// The page pool's state: page/free-list/index form a single critical
/// section (spec.md §5).
pub(crate) struct PagePoolState {
  page_size: usize,
  min_free_block_size: usize,
  pages: Vec<Page>,
  pub(crate) index: HashMap<FileKey, Arc<MemRegion>>,
}

impl PagePoolState {
  pub(crate) fn new(page_size: usize, min_free_block_size: usize) -> Self {
    Self {
      page_size,
      min_free_block_size,
      pages: Vec::new(),
      index: HashMap::new(),
    }
  }

  pub(crate) fn page_size(&self) -> usize {
    self.page_size
  }

  pub(crate) fn page_count(&self) -> usize {
    self.pages.len()
  }

  /// Allocate `n` bytes, appending a new page if no existing page fits.
  /// Returns `(page_index, offset, physical_length)`. `physical_length` may
  /// exceed `n` when the residual after carving out `n` bytes would be
  /// smaller than `min_free_block_size`, in which case the whole matched
  /// block is allocated instead of being split.
  fn alloc(&mut self, n: usize) -> (usize, usize, usize) {
    for (page_index, page) in self.pages.iter_mut().enumerate() {
      if let Some(block_idx) = page.find_fit(n) {
        let block = page.free[block_idx];
        let residual = block.length - n;
        return if residual < self.min_free_block_size {
          page.free.remove(block_idx);
          (page_index, block.offset, block.length)
        } else {
          page.free[block_idx] = Block {
            offset: block.offset + n,
            length: residual,
          };
          (page_index, block.offset, n)
        };
      }
    }

    let new_page_size = self.page_size.max(n);
    let mut page = Page::new(new_page_size);
    let block = page.free[0];
    let residual = block.length - n;
    let (offset, phys_len) = if residual < self.min_free_block_size {
      page.free.clear();
      (block.offset, block.length)
    } else {
      page.free[0] = Block {
        offset: block.offset + n,
        length: residual,
      };
      (block.offset, n)
    };
    self.pages.push(page);
    (self.pages.len() - 1, offset, phys_len)
  }

  fn free_block(&mut self, page_index: usize, offset: usize, length: usize) {
    if let Some(page) = self.pages.get_mut(page_index) {
      page.free.push(Block { offset, length });
      page.merge_adjacent();
    }
  }

  pub(crate) fn write_region(&mut self, page_index: usize, offset: usize, bytes: &[u8]) {
    self.pages[page_index].buf[offset..offset + bytes.len()].copy_from_slice(bytes);
  }

  pub(crate) fn read_region(&self, page_index: usize, offset: usize, len: usize) -> &[u8] {
    &self.pages[page_index].buf[offset..offset + len]
  }

  /// Allocate a region, copy `bytes` into it, and return a reference-counted
  /// handle. Caller is responsible for inserting it into `index`.
  pub(crate) fn allocate_and_write(pool: &Arc<Mutex<Self>>, bytes: &[u8]) -> Arc<MemRegion> {
    let mut state = pool.lock();
    let (page_index, offset, phys_len) = state.alloc(bytes.len());
    state.write_region(page_index, offset, bytes);
    Arc::new(MemRegion {
      pool: Arc::downgrade(pool),
      page_index,
      offset,
      phys_len,
      payload_len: bytes.len() as u64,
    })
  }

  #[cfg(test)]
  pub(crate) fn free_extents(&self) -> Vec<Vec<(usize, usize)>> {
    self
      .pages
      .iter()
      .map(|page| page.free.iter().map(|b| (b.offset, b.length)).collect())
      .collect()
  }

  #[cfg(test)]
  pub(crate) fn page_lengths(&self) -> Vec<usize> {
    self.pages.iter().map(|p| p.buf.len()).collect()
  }
}

/// A reference-counted handle to an allocated region. Dropped (and its
/// block returned to the free list) only once every outstanding read
/// snapshot referencing it is gone -- including the index's own clone, once
/// it has been replaced by a newer version (spec.md §3 Ownership).
pub(crate) struct MemRegion {
  pool: Weak<Mutex<PagePoolState>>,
  pub(crate) page_index: usize,
  pub(crate) offset: usize,
  phys_len: usize,
  pub(crate) payload_len: u64,
}

impl MemRegion {
  pub(crate) fn read_at(&self, pos: u64, buf: &mut [u8]) -> std::io::Result<usize> {
    let pool = match self.pool.upgrade() {
      Some(p) => p,
      None => return Ok(0),
    };
    let remaining = self.payload_len.saturating_sub(pos);
    if remaining == 0 {
      return Ok(0);
    }
    let n = (buf.len() as u64).min(remaining) as usize;
    let state = pool.lock();
    let region = state.read_region(self.page_index, self.offset + pos as usize, n);
    buf[..n].copy_from_slice(region);
    Ok(n)
  }
}

impl Drop for MemRegion {
  fn drop(&mut self) {
    if let Some(pool) = self.pool.upgrade() {
      pool.lock().free_block(self.page_index, self.offset, self.phys_len);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn new_pool(page_size: usize, min_free: usize) -> Arc<Mutex<PagePoolState>> {
    Arc::new(Mutex::new(PagePoolState::new(page_size, min_free)))
  }

  #[test]
  fn allocates_new_page_when_none_fit() {
    let pool = new_pool(1024, 64);
    let region = PagePoolState::allocate_and_write(&pool, &[1u8; 100]);
    assert_eq!(region.page_index, 0);
    assert_eq!(pool.lock().page_count(), 1);
  }

  #[test]
  fn residual_below_minimum_is_absorbed() {
    let pool = new_pool(128, 64);
    // Allocation of 100 bytes leaves a 28-byte residual, below the 64-byte
    // minimum, so the whole page is consumed and the free list is empty.
    let region = PagePoolState::allocate_and_write(&pool, &[1u8; 100]);
    assert_eq!(region.payload_len, 100);
    let state = pool.lock();
    assert!(state.free_extents()[0].is_empty());
  }

  #[test]
  fn residual_above_minimum_is_tracked() {
    let pool = new_pool(1024, 64);
    let region = PagePoolState::allocate_and_write(&pool, &[1u8; 100]);
    drop(region);
    let state = pool.lock();
    // After freeing, the whole page should be one coalesced free block.
    assert_eq!(state.free_extents()[0], vec![(0, 1024)]);
  }

  #[test]
  fn free_merges_adjacent_blocks() {
    let pool = new_pool(1024, 16);
    let a = PagePoolState::allocate_and_write(&pool, &[1u8; 100]);
    let b = PagePoolState::allocate_and_write(&pool, &[2u8; 100]);
    drop(a);
    drop(b);
    let state = pool.lock();
    assert_eq!(state.free_extents()[0], vec![(0, 1024)]);
  }

  #[test]
  fn live_and_free_partition_the_page() {
    let pool = new_pool(2048, 16);
    let mut regions = Vec::new();
    for i in 0..5u8 {
      regions.push(PagePoolState::allocate_and_write(&pool, &vec![i; 50 + i as usize * 7]));
    }
    drop(regions.remove(1));
    drop(regions.remove(2));
    let state = pool.lock();
    let free = &state.free_extents()[0];
    let total_free: usize = free.iter().map(|(_, l)| l).sum();
    let total_pages: usize = state.page_lengths().iter().sum();
    // Every freed byte shows back up in the free list; nothing is lost.
    assert!(total_free <= total_pages);
  }

  /// A tiny xorshift PRNG, deterministic across runs, so this stress test
  /// never needs a `rand` dependency just to pick sizes.
  struct Xorshift(u64);

  impl Xorshift {
    fn next(&mut self) -> u64 {
      self.0 ^= self.0 << 13;
      self.0 ^= self.0 >> 7;
      self.0 ^= self.0 << 17;
      self.0
    }

    fn range(&mut self, lo: usize, hi: usize) -> usize {
      lo + (self.next() as usize % (hi - lo))
    }
  }

  /// Allocator soundness (spec.md §8 property 6): after any sequence of
  /// random-sized commits and evictions, live block extents are pairwise
  /// non-overlapping, and live + free partitions each page exactly.
  #[test]
  fn stress_random_alloc_free_preserves_partition() {
    let pool = new_pool(4096, 32);
    let mut rng = Xorshift(0x1234_5678_9abc_def1);
    let mut live: Vec<Arc<MemRegion>> = Vec::new();

    for _ in 0..2000 {
      if !live.is_empty() && rng.next() % 3 == 0 {
        let idx = rng.range(0, live.len());
        live.remove(idx);
      } else {
        let size = rng.range(1, 600);
        let byte = (rng.next() % 256) as u8;
        live.push(PagePoolState::allocate_and_write(&pool, &vec![byte; size]));
      }

      let state = pool.lock();
      for page_index in 0..state.page_count() {
        let page_len = state.page_lengths()[page_index];
        let mut extents: Vec<(usize, usize)> = state.free_extents()[page_index].clone();
        for region in &live {
          if region.page_index == page_index {
            extents.push((region.offset, region.phys_len));
          }
        }
        extents.sort_by_key(|&(off, _)| off);

        let mut cursor = 0usize;
        for (offset, length) in &extents {
          assert!(*offset >= cursor, "overlapping extents in page {page_index}");
          cursor = offset + length;
        }
        assert_eq!(cursor, page_len, "live+free must fully partition page {page_index}");
      }
    }
  }
}
