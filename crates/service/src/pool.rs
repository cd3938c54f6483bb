use std::{
    collections::VecDeque,
    io,
    time::{Duration, Instant},
};

use ahash::{HashMap, HashMapExt};
use parking_lot::Mutex;
use tokio::{net::TcpStream, time};

use crate::Address;

/// Persistent backend connections, one FIFO per backend address.
///
/// A stream lives in exactly one place at a time: either a connection owns
/// it or it sits in a queue here. Queues are bounded by `max_size`, releases
/// beyond the bound close the stream immediately, and entries idle for
/// `max_lifetime` are discarded on fetch or by the periodic [`cleanup`].
///
/// [`cleanup`]: ConnectionPool::cleanup
pub struct ConnectionPool {
    max_size: usize,
    max_lifetime: Duration,
    queues: Mutex<HashMap<Address, VecDeque<(TcpStream, Instant)>>>,
}

impl ConnectionPool {
    pub fn new(max_size: usize, max_lifetime: Duration) -> Self {
        Self {
            max_size,
            max_lifetime,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch a connection for a backend, reusing an idle one when possible.
    ///
    /// Pooled candidates past their lifetime or failing the liveness probe
    /// are closed and skipped. Once the queue runs dry a fresh stream is
    /// connected; the connect error is the caller's failure signal. The lock
    /// is never held across the probe or the connect.
    pub async fn get(&self, address: &Address) -> io::Result<TcpStream> {
        loop {
            let candidate = self
                .queues
                .lock()
                .get_mut(address)
                .and_then(|queue| queue.pop_front());

            let Some((stream, released)) = candidate else {
                break;
            };

            if released.elapsed() >= self.max_lifetime {
                log::debug!("pooled connection expired: addr={address}");
                continue;
            }

            if is_alive(&stream).await {
                return Ok(stream);
            }

            log::debug!("pooled connection dead: addr={address}");
        }

        log::debug!("opening fresh backend connection: addr={address}");
        TcpStream::connect((address.host.as_str(), address.port)).await
    }

    /// Return a stream to its queue. Full queues close the stream instead.
    pub fn put(&self, address: Address, stream: TcpStream) {
        let mut queues = self.queues.lock();
        let queue = queues.entry(address).or_default();
        if queue.len() < self.max_size {
            queue.push_back((stream, Instant::now()));
        }
    }

    /// Evict everything past its lifetime, across all backends.
    pub fn cleanup(&self) {
        let mut queues = self.queues.lock();

        let before: usize = queues.values().map(|queue| queue.len()).sum();
        for queue in queues.values_mut() {
            queue.retain(|(_, released)| released.elapsed() < self.max_lifetime);
        }
        queues.retain(|_, queue| !queue.is_empty());

        let after: usize = queues.values().map(|queue| queue.len()).sum();
        if before != after {
            log::debug!("pool cleanup evicted connections: before={before}, after={after}");
        }
    }

    /// Idle connections currently queued for one backend.
    pub fn len(&self, address: &Address) -> usize {
        self.queues
            .lock()
            .get(address)
            .map(|queue| queue.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.queues.lock().values().all(|queue| queue.is_empty())
    }
}

/// One-byte non-destructive peek.
///
/// An idle pooled socket must have nothing to read: pending readability is
/// either an EOF from the backend, an error, or stale bytes from a previous
/// exchange, and in all three cases the socket cannot be reused. The same
/// probe guards backend streams a connection keeps across keep-alive
/// requests.
pub async fn is_alive(stream: &TcpStream) -> bool {
    let mut byte = [0u8; 1];
    match time::timeout(Duration::ZERO, stream.peek(&mut byte)).await {
        // Nothing buffered and the peer did not hang up.
        Err(_) => true,
        Ok(Ok(0)) => false,
        Ok(Ok(_)) => false,
        Ok(Err(_)) => false,
    }
}
