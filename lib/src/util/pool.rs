use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::Mutex;
use std::sync::OnceLock;

const DEFAULT_BUF_SIZE: usize = 32 * 1024;

/// Process-wide pool of byte buffers used by the transfer copy loops.
///
/// Buffers are returned on drop of the [`PooledBuf`] guard, so release
/// happens on every exit path.
pub struct BytesPool {
    bufs: Mutex<Vec<Vec<u8>>>,
}

impl BytesPool {
    const fn new() -> Self {
        Self {
            bufs: Mutex::new(Vec::new()),
        }
    }

    /// Acquires a buffer of at least `size` bytes, `size = 0` meaning the
    /// default copy size.
    pub fn get(&'static self, size: usize) -> PooledBuf {
        let size = if size == 0 { DEFAULT_BUF_SIZE } else { size };

        let mut bufs = self.bufs.lock().expect("bytes pool poisoned");
        let mut buf = bufs.pop().unwrap_or_default();
        drop(bufs);

        if buf.capacity() < size {
            buf.reserve(size - buf.len());
        }
        buf.clear();
        buf.resize(size, 0);

        PooledBuf { pool: self, buf }
    }

    fn put(&self, mut buf: Vec<u8>) {
        buf.clear();
        let mut bufs = self.bufs.lock().expect("bytes pool poisoned");
        bufs.push(buf);
    }
}

/// The shared pool instance.
pub fn shared() -> &'static BytesPool {
    static POOL: OnceLock<BytesPool> = OnceLock::new();
    POOL.get_or_init(BytesPool::new)
}

/// Guard over a pooled buffer. Dereferences to `[u8]` sized to the
/// requested length; the backing storage goes back to the pool on drop.
pub struct PooledBuf {
    pool: &'static BytesPool,
    buf: Vec<u8>,
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.buf));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaked() -> &'static BytesPool {
        Box::leak(Box::new(BytesPool::new()))
    }

    #[test]
    fn reuses_returned_buffers() {
        let pool = leaked();

        let ptr = {
            let buf = pool.get(0);
            assert_eq!(buf.len(), DEFAULT_BUF_SIZE);
            buf.as_ptr()
        };

        let buf = pool.get(0);
        assert_eq!(buf.as_ptr(), ptr);
    }

    #[test]
    fn grows_to_requested_size() {
        let buf = leaked().get(DEFAULT_BUF_SIZE * 2);
        assert_eq!(buf.len(), DEFAULT_BUF_SIZE * 2);
    }
}
