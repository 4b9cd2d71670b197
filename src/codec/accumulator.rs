//! Byte accumulator shared by the transport read loops.
//!
//! Reads arrive in arbitrary fragments; a single response may span several
//! physical reads, or one read may carry several frames back to back. The
//! window buffers everything and lets a codec consume exact frame lengths.

const COMPACT_THRESHOLD: usize = 4096;

/// Append-only byte window with a read cursor.
///
/// Invariant: `read <= buf.len()`; the unread region `buf[read..]` is what
/// remains to be matched against frame boundaries. The cursor only moves
/// forward, via [`ByteWindow::consume`].
#[derive(Debug, Default)]
pub struct ByteWindow {
    buf: Vec<u8>,
    read: usize,
}

impl ByteWindow {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            read: 0,
        }
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes not yet consumed by a codec.
    pub fn unread(&self) -> &[u8] {
        &self.buf[self.read..]
    }

    pub fn len(&self) -> usize {
        self.buf.len() - self.read
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Advance the read cursor past `n` consumed bytes.
    pub fn consume(&mut self, n: usize) {
        self.read = (self.read + n).min(self.buf.len());
        if self.read == self.buf.len() {
            self.buf.clear();
            self.read = 0;
        } else if self.read > COMPACT_THRESHOLD {
            self.buf.drain(..self.read);
            self.read = 0;
        }
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.read = 0;
    }

    /// Discard unread bytes preceding the two-byte sync marker.
    ///
    /// Returns `true` when the marker now heads the unread region. When the
    /// marker is absent, everything is discarded except a trailing byte that
    /// matches the first marker byte (it may be the start of a marker split
    /// across reads).
    pub fn seek_marker(&mut self, marker: [u8; 2]) -> bool {
        let unread = self.unread();
        if let Some(pos) = unread.windows(2).position(|w| w == marker) {
            self.consume(pos);
            true
        } else {
            let keep = usize::from(unread.last() == Some(&marker[0]));
            let discard = self.len() - keep;
            if discard > 0 {
                log::trace!("Discarding {} bytes without sync marker", discard);
            }
            self.consume(discard);
            false
        }
    }
}
