//! In-memory mirror of block allocation across all groups.

#[derive(Debug, Clone)]
pub struct BlockMap {
    words: Vec<u64>,
    len: u32,
}

impl BlockMap {
    /// A map of `len` blocks, all free.
    pub fn new(len: u32) -> Self {
        Self {
            words: vec![0; (len as usize).div_ceil(64)],
            len,
        }
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    /// Blocks outside the map are never free.
    pub fn is_free(&self, block: u32) -> bool {
        if block >= self.len {
            return false;
        }
        self.words[(block / 64) as usize] & (1 << (block % 64)) == 0
    }

    pub fn mark_busy(&mut self, block: u32) {
        if block < self.len {
            self.words[(block / 64) as usize] |= 1 << (block % 64);
        }
    }

    pub fn mark_free(&mut self, block: u32) {
        if block < self.len {
            self.words[(block / 64) as usize] &= !(1 << (block % 64));
        }
    }

    /// Free blocks in `[start, end)`.
    pub fn count_free(&self, start: u32, end: u32) -> u32 {
        (start..end.min(self.len)).filter(|b| self.is_free(*b)).count() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_and_count() {
        let mut map = BlockMap::new(130);
        assert_eq!(map.count_free(0, 130), 130);

        map.mark_busy(0);
        map.mark_busy(64);
        map.mark_busy(129);
        map.mark_busy(64);

        assert!(!map.is_free(64));
        assert!(map.is_free(65));
        assert_eq!(map.count_free(0, 130), 127);
        assert_eq!(map.count_free(60, 70), 9);

        map.mark_free(64);
        assert!(map.is_free(64));
        assert_eq!(map.count_free(0, 130), 128);
    }

    #[test]
    fn test_out_of_range_is_busy() {
        let mut map = BlockMap::new(10);
        map.mark_busy(50);
        assert!(!map.is_free(10));
        assert_eq!(map.count_free(0, 100), 10);
    }
}
