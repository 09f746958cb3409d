//! Fixed-capacity accumulation buffer for outgoing batches.

/// An append-only byte buffer whose capacity never changes.
///
/// Writes that do not fit are rejected whole; nothing is ever truncated.
/// Clearing resets the offset without touching the storage, the next
/// writer simply overwrites it.
#[derive(Debug)]
pub struct FrameBuffer {
    storage: Box<[u8]>,
    offset: usize,
}

impl FrameBuffer {
    /// Allocate a buffer holding exactly `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            storage: vec![0u8; capacity].into_boxed_slice(),
            offset: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Number of bytes written since the last clear.
    pub fn len(&self) -> usize {
        self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.offset == 0
    }

    /// Bytes still available before the buffer is full.
    pub fn remaining(&self) -> usize {
        self.capacity() - self.offset
    }

    pub fn can_write(&self, len: usize) -> bool {
        self.offset
            .checked_add(len)
            .is_some_and(|end| end <= self.capacity())
    }

    /// Append `data`. Returns `false` and leaves the buffer untouched when it does not fit.
    pub fn write(&mut self, data: &[u8]) -> bool {
        if !self.can_write(data.len()) {
            return false;
        }

        let end = self.offset + data.len();
        self.storage[self.offset..end].copy_from_slice(data);
        self.offset = end;
        true
    }

    /// Append several slices as one unit: either all of them are written or none is.
    pub fn write_parts(&mut self, parts: &[&[u8]]) -> bool {
        let total = parts.iter().map(|part| part.len()).sum();
        if !self.can_write(total) {
            return false;
        }

        for part in parts {
            self.write(part);
        }
        true
    }

    /// The written portion of the buffer.
    pub fn as_bytes(&self) -> &[u8] {
        &self.storage[..self.offset]
    }

    pub fn clear(&mut self) {
        self.offset = 0;
    }
}
