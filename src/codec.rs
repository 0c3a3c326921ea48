//! Binary codec layer shared by every on-disk structure.
//!
//! [`ByteArena`] is a growable byte buffer addressed by absolute offset.
//! Writes past the current end grow the buffer (zero-filled); reads past the
//! end observe zeros. All integers are little-endian, matching both ext2 and
//! SquashFs. Fixed-layout records are `zerocopy` structs defined next to the
//! format that owns them.

/// Growable, offset-addressed byte buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ByteArena {
    data: Vec<u8>,
}

impl ByteArena {
    #[cfg(test)]
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    /// Create an arena of `len` zero bytes.
    pub fn zeroed(len: usize) -> Self {
        Self { data: vec![0; len] }
    }

    #[cfg(test)]
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[cfg(test)]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Append bytes at the end, returning the offset they were written at.
    pub fn append(&mut self, bytes: &[u8]) -> usize {
        let offset = self.data.len();
        self.data.extend_from_slice(bytes);
        offset
    }

    /// Pad with zeros until the length is a multiple of `alignment`.
    pub fn pad_to(&mut self, alignment: usize) {
        let len = align_up(self.data.len(), alignment);
        self.data.resize(len, 0);
    }

    fn ensure(&mut self, end: usize) {
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
    }

    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.ensure(offset + bytes.len());
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn write_u8(&mut self, offset: usize, value: u8) {
        self.write_bytes(offset, &[value]);
    }

    #[cfg(test)]
    pub fn write_u16(&mut self, offset: usize, value: u16) {
        self.write_bytes(offset, &value.to_le_bytes());
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) {
        self.write_bytes(offset, &value.to_le_bytes());
    }

    #[cfg(test)]
    pub fn write_u64(&mut self, offset: usize, value: u64) {
        self.write_bytes(offset, &value.to_le_bytes());
    }

    /// Copy `len` bytes starting at `offset`; bytes past the end read as zero.
    fn read_bytes(&self, offset: usize, len: usize) -> Vec<u8> {
        let mut out = vec![0; len];
        if offset < self.data.len() {
            let available = (self.data.len() - offset).min(len);
            out[..available].copy_from_slice(&self.data[offset..offset + available]);
        }
        out
    }

    pub fn read_u8(&self, offset: usize) -> u8 {
        self.data.get(offset).copied().unwrap_or(0)
    }

    #[cfg(test)]
    pub fn read_u16(&self, offset: usize) -> u16 {
        let mut raw = [0u8; 2];
        raw.copy_from_slice(&self.read_bytes(offset, 2));
        u16::from_le_bytes(raw)
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.read_bytes(offset, 4));
        u32::from_le_bytes(raw)
    }

    #[cfg(test)]
    pub fn read_u64(&self, offset: usize) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.read_bytes(offset, 8));
        u64::from_le_bytes(raw)
    }
}

/// Round `value` up to the next multiple of `alignment` (a power of two or any non-zero value).
pub fn align_up(value: usize, alignment: usize) -> usize {
    if alignment == 0 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}
