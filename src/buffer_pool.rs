use tokio::sync::Mutex;

/// Size of every relay buffer.
pub const RELAY_BUFFER_SIZE: usize = 16 * 1024;

const MAX_POOL_SIZE: usize = 100;

/// Reusable relay buffers behind an async-aware mutex.
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            buffers: Mutex::new(Vec::with_capacity(MAX_POOL_SIZE)),
        }
    }

    /// Pops a pooled buffer or allocates a fresh one.
    pub async fn get_buffer(&self) -> Vec<u8> {
        let mut pool = self.buffers.lock().await;
        match pool.pop() {
            Some(buffer) if buffer.len() == RELAY_BUFFER_SIZE => buffer,
            _ => vec![0u8; RELAY_BUFFER_SIZE],
        }
    }

    /// Zeroes and keeps `buffer` unless the pool is full or the size is wrong.
    pub async fn return_buffer(&self, mut buffer: Vec<u8>) {
        if buffer.capacity() < RELAY_BUFFER_SIZE || buffer.capacity() > RELAY_BUFFER_SIZE * 2 {
            return;
        }

        // Relayed bytes must not leak into the next tunnel.
        buffer.clear();
        buffer.resize(RELAY_BUFFER_SIZE, 0);

        let mut pool = self.buffers.lock().await;
        if pool.len() < MAX_POOL_SIZE {
            pool.push(buffer);
        }
    }

    pub async fn available(&self) -> usize {
        self.buffers.lock().await.len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

pub static BUFFER_POOL: std::sync::OnceLock<BufferPool> = std::sync::OnceLock::new();

pub fn get_buffer_pool() -> &'static BufferPool {
    BUFFER_POOL.get_or_init(BufferPool::new)
}

/// A buffer borrowed from the global pool, handed back on drop.
#[derive(Debug)]
pub struct BufferLease {
    buffer: Option<Vec<u8>>,
}

impl BufferLease {
    pub async fn new() -> Self {
        Self {
            buffer: Some(get_buffer_pool().get_buffer().await),
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buffer.as_deref_mut().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.buffer.as_ref().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            // Drop cannot await; hand the buffer back on the runtime.
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    get_buffer_pool().return_buffer(buffer).await;
                });
            }
        }
    }
}

pub async fn lease_buffer() -> BufferLease {
    BufferLease::new().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reuses_returned_buffers() {
        let pool = BufferPool::new();
        let buf = pool.get_buffer().await;
        assert_eq!(buf.len(), RELAY_BUFFER_SIZE);
        pool.return_buffer(buf).await;
        assert_eq!(pool.available().await, 1);
        let _again = pool.get_buffer().await;
        assert_eq!(pool.available().await, 0);
    }

    #[tokio::test]
    async fn pool_size_is_capped() {
        let pool = BufferPool::new();
        let mut held = Vec::new();
        for _ in 0..150 {
            held.push(pool.get_buffer().await);
        }
        for buf in held {
            pool.return_buffer(buf).await;
        }
        assert_eq!(pool.available().await, MAX_POOL_SIZE);
    }

    #[tokio::test]
    async fn wrong_size_is_rejected() {
        let pool = BufferPool::new();
        pool.return_buffer(vec![0u8; 4096]).await;
        assert_eq!(pool.available().await, 0);
    }

    #[tokio::test]
    async fn returned_buffers_are_zeroed() {
        let pool = BufferPool::new();
        let mut buf = pool.get_buffer().await;
        buf.fill(0xAA);
        buf.truncate(128);
        pool.return_buffer(buf).await;

        let reused = pool.get_buffer().await;
        assert_eq!(reused.len(), RELAY_BUFFER_SIZE);
        assert!(reused.iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn lease_exposes_full_buffer() {
        let mut lease = lease_buffer().await;
        assert_eq!(lease.len(), RELAY_BUFFER_SIZE);
        lease.as_mut_slice()[0] = 1;
        assert!(!lease.is_empty());
    }
}
