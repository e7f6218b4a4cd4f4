//! Fixed-capacity byte buffers.
//!
//! Every size the host declares is checked against the buffer's capacity
//! before a single byte is copied, so an untrusted count can never cause an
//! oversized allocation or a silent truncation.

use std::io;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    #[error("declared size {declared} exceeds buffer capacity {capacity}")]
    Oversize { declared: usize, capacity: usize },

    #[error("declared size {declared} exceeds the {available} bytes supplied")]
    Truncated { declared: usize, available: usize },
}

/// A byte buffer that never holds more than `capacity` bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundedBuf {
    data: Vec<u8>,
    capacity: usize,
}

impl BoundedBuf {
    /// An empty buffer. Nothing is allocated until it is filled.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::new(),
            capacity,
        }
    }

    /// Copy the first `declared` bytes of `source`.
    pub fn from_declared(
        declared: usize,
        source: &[u8],
        capacity: usize,
    ) -> Result<Self, BufferError> {
        if declared > capacity {
            return Err(BufferError::Oversize { declared, capacity });
        }
        if declared > source.len() {
            return Err(BufferError::Truncated {
                declared,
                available: source.len(),
            });
        }
        Ok(Self {
            data: source[..declared].to_vec(),
            capacity,
        })
    }

    /// Copy all of `source`.
    pub fn from_slice(source: &[u8], capacity: usize) -> Result<Self, BufferError> {
        Self::from_declared(source.len(), source, capacity)
    }

    /// Replace the contents with whatever `fill` writes into a
    /// capacity-sized scratch area. `fill` returns the number of valid bytes.
    pub fn fill_with<F>(&mut self, fill: F) -> io::Result<usize>
    where
        F: FnOnce(&mut [u8]) -> io::Result<usize>,
    {
        self.data.clear();
        self.data.resize(self.capacity, 0);
        match fill(&mut self.data) {
            Ok(n) => {
                let n = n.min(self.capacity);
                self.data.truncate(n);
                Ok(n)
            }
            Err(e) => {
                self.data.clear();
                Err(e)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

impl AsRef<[u8]> for BoundedBuf {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}
