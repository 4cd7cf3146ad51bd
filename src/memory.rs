//! Preallocated slab allocator backing frame buffers, sized in buckets
//! with a free list per bucket (spec.md §5, "Memory is drawn from a
//! preallocated slab"). Tracks high-water marks and allocation failures
//! for the statistics block.

use super::config::MemConfig;
use super::error::Error;

#[derive(Debug, Clone, Copy, Default)]
pub struct BucketStats {
    pub size: usize,
    pub in_use: usize,
    pub high_water: usize,
}

/// A size-classed slab: `total_size` bytes are notionally divided across
/// `bucket_sizes`; each bucket tracks how many blocks are checked out. The
/// engine doesn't actually carve a raw arena (Rust's allocator already
/// gives us that safely) — this tracks accounting only, the same figures
/// `trdp_stats.c`'s `MEM_STATISTICS` wants to report.
pub struct Memory {
    buckets: Vec<BucketStats>,
    total_size: usize,
    alloc_err: u32,
    free_err: u32,
}

impl Memory {
    pub fn new(cfg: &MemConfig) -> Memory {
        let buckets = cfg
            .bucket_sizes
            .iter()
            .map(|&size| BucketStats { size, in_use: 0, high_water: 0 })
            .collect();
        Memory { buckets, total_size: cfg.total_size, alloc_err: 0, free_err: 0 }
    }

    fn bucket_for(&self, size: usize) -> Option<usize> {
        self.buckets.iter().position(|b| b.size >= size)
    }

    /// Accounts for an allocation of `size` bytes, rounding up to the
    /// smallest bucket that fits. Returns the bucket index used so the
    /// caller can `free` it later.
    pub fn alloc(&mut self, size: usize) -> Result<usize, Error> {
        match self.bucket_for(size) {
            Some(idx) => {
                let b = &mut self.buckets[idx];
                b.in_use += 1;
                if b.in_use > b.high_water {
                    b.high_water = b.in_use;
                }
                Ok(idx)
            }
            None => {
                self.alloc_err += 1;
                Err(Error::Mem)
            }
        }
    }

    pub fn free(&mut self, bucket: usize) -> Result<(), Error> {
        match self.buckets.get_mut(bucket) {
            Some(b) if b.in_use > 0 => {
                b.in_use -= 1;
                Ok(())
            }
            _ => {
                self.free_err += 1;
                Err(Error::Mem)
            }
        }
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn free_size(&self) -> usize {
        let used: usize = self.buckets.iter().map(|b| b.size * b.in_use).sum();
        self.total_size.saturating_sub(used)
    }

    pub fn min_free_size(&self) -> usize {
        let peak_used: usize = self.buckets.iter().map(|b| b.size * b.high_water).sum();
        self.total_size.saturating_sub(peak_used)
    }

    pub fn alloc_errors(&self) -> u32 {
        self.alloc_err
    }

    pub fn free_errors(&self) -> u32 {
        self.free_err
    }

    pub fn bucket_stats(&self) -> &[BucketStats] {
        &self.buckets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_rounds_up_to_bucket_and_tracks_high_water() {
        let mut mem = Memory::new(&MemConfig::default());
        let idx = mem.alloc(100).unwrap();
        assert_eq!(mem.bucket_stats()[idx].size, 128);
        assert_eq!(mem.bucket_stats()[idx].in_use, 1);
        mem.free(idx).unwrap();
        assert_eq!(mem.bucket_stats()[idx].in_use, 0);
        assert_eq!(mem.bucket_stats()[idx].high_water, 1);
    }

    #[test]
    fn oversized_alloc_counts_as_error() {
        let mut mem = Memory::new(&MemConfig::default().bucket_sizes(vec![32, 64]));
        assert!(mem.alloc(128).is_err());
        assert_eq!(mem.alloc_errors(), 1);
    }

    #[test]
    fn double_free_counts_as_error() {
        let mut mem = Memory::new(&MemConfig::default());
        let idx = mem.alloc(10).unwrap();
        mem.free(idx).unwrap();
        assert!(mem.free(idx).is_err());
        assert_eq!(mem.free_errors(), 1);
    }
}
