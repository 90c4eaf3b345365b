use std::sync::Mutex;

/// A free list of scratch buffers for parameter decoding.
///
/// Sessions borrow a buffer for the lifetime of their `PARAMS` stream and
/// hand it back whole when the stream ends. The pool grows on demand and
/// never shrinks.
pub(crate) struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    buffer_size: usize,
}

impl BufferPool {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            buffer_size,
        }
    }

    pub fn acquire(&self) -> Vec<u8> {
        self.free
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.buffer_size))
    }

    pub fn release(&self, mut buffer: Vec<u8>) {
        buffer.clear();
        self.free.lock().unwrap().push(buffer);
    }
}
