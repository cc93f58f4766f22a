//! ABOUTME: Bounded output capture buffer
//! ABOUTME: Keeps the trailing window of bytes once the cap is exceeded

/// Byte buffer that retains only the newest `cap` bytes.
#[derive(Debug)]
pub struct BoundedBuffer {
    bytes: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl BoundedBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            bytes: Vec::new(),
            cap,
            truncated: false,
        }
    }

    /// Append a chunk, dropping oldest bytes past the cap
    pub fn push(&mut self, chunk: &[u8]) {
        if chunk.len() >= self.cap {
            self.bytes.clear();
            self.bytes.extend_from_slice(&chunk[chunk.len() - self.cap..]);
            self.truncated = self.truncated || chunk.len() > self.cap;
            return;
        }
        self.bytes.extend_from_slice(chunk);
        if self.bytes.len() > self.cap {
            let excess = self.bytes.len() - self.cap;
            self.bytes.drain(..excess);
            self.truncated = true;
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Whether older bytes were dropped
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Contents as lossy UTF-8
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}
