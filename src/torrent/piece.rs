use std::fmt::{Debug, Formatter};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, Weak};

/// The index of a piece within a torrent.
pub type PieceIndex = usize;

/// A single piece of the torrent payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Piece {
    /// The byte offset of the piece within the torrent payload.
    pub offset: u64,
    /// The length of the piece in bytes.
    pub length: usize,
}

/// Calculate the pieces of a torrent payload.
/// The last piece is truncated to the remainder of the total length.
pub fn build_pieces(total_length: u64, piece_length: u64) -> Vec<Piece> {
    let mut pieces = Vec::new();
    let mut offset = 0u64;

    while offset < total_length {
        let length = piece_length.min(total_length - offset) as usize;
        pieces.push(Piece { offset, length });
        offset += length as u64;
    }

    pieces
}

/// A file within the torrent payload.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentFile {
    /// The relative path of the file within the torrent.
    pub path: String,
    /// The length of the file in bytes.
    pub length: u64,
    /// The byte offset of the file within the torrent payload.
    pub offset: u64,
}

/// A pool of reusable piece-sized buffers.
/// Buffers handed out by the pool return to it when the [PieceBuffer] is dropped.
#[derive(Debug, Clone)]
pub struct BufferPool {
    inner: Arc<InnerBufferPool>,
}

#[derive(Debug, Default)]
struct InnerBufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(InnerBufferPool::default()),
        }
    }

    /// Get a buffer of the given length from the pool.
    /// A pooled buffer is reused when available, otherwise a new one is allocated.
    pub fn get(&self, length: usize) -> PieceBuffer {
        let mut data = self
            .inner
            .buffers
            .lock()
            .expect("buffer pool lock poisoned")
            .pop()
            .unwrap_or_default();
        data.resize(length, 0);

        PieceBuffer {
            data: Some(data),
            pool: Arc::downgrade(&self.inner),
        }
    }

    /// Get the number of buffers currently held by the pool.
    pub fn len(&self) -> usize {
        self.inner
            .buffers
            .lock()
            .expect("buffer pool lock poisoned")
            .len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A piece-sized buffer owned by whoever currently holds it.
/// Ownership moves along with emitted piece results; dropping the buffer returns it to its pool.
pub struct PieceBuffer {
    data: Option<Vec<u8>>,
    pool: Weak<InnerBufferPool>,
}

impl Deref for PieceBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PieceBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Debug for PieceBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PieceBuffer")
            .field("length", &self.len())
            .finish()
    }
}

impl Drop for PieceBuffer {
    fn drop(&mut self) {
        if let (Some(data), Some(pool)) = (self.data.take(), self.pool.upgrade()) {
            pool.buffers
                .lock()
                .expect("buffer pool lock poisoned")
                .push(data);
        }
    }
}
