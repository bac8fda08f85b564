use std::sync::atomic::{AtomicUsize, Ordering};

/// Tunnels currently relaying bytes, process wide.
pub static ACTIVE_TUNNELS: AtomicUsize = AtomicUsize::new(0);

pub fn active_tunnels() -> usize {
    ACTIVE_TUNNELS.load(Ordering::Relaxed)
}

/// RAII guard to ensure the tunnel count is decremented exactly once.
#[derive(Debug)]
pub struct TunnelGuard {
    counter: &'static AtomicUsize,
    released: bool,
}

impl TunnelGuard {
    pub fn new() -> Self {
        Self::register(&ACTIVE_TUNNELS)
    }

    pub fn register(counter: &'static AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self {
            counter,
            released: false,
        }
    }

    pub fn release(&mut self) {
        if !self.released {
            self.counter.fetch_sub(1, Ordering::Relaxed);
            self.released = true;
        }
    }
}

impl Default for TunnelGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TunnelGuard {
    fn drop(&mut self) {
        self.release();
    }
}
