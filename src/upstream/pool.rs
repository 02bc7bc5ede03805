//! Keep-alive pool of backend connections.
//!
//! # Responsibilities
//! - Hand out an idle connection for a (scheme, host:port) key, or dial a new one
//! - Take connections back after a clean exchange
//! - Close anything that failed, expired, or overflows the idle caps
//!
//! # Design Decisions
//! - LIFO reuse: the most recently released connection is the warmest
//! - Expired entries are evicted lazily on acquire, never by a background task
//! - A connection is returned to the pool only by an explicit healthy release;
//!   every other path drops it, which closes it

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use axum::body::Body;
use hyper::body::Incoming;
use hyper::client::conn::http1::{self, SendRequest};
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::task::AbortHandle;

use crate::config::{PoolConfig, TimeoutConfig};
use crate::observability::metrics;
use crate::upstream::connector::Connector;
use crate::upstream::error::{classify_hyper, ConnectError};
use crate::upstream::target::{BackendTarget, PoolKey};

/// Limits applied to idle connections.
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub max_idle_per_host: usize,
    pub max_idle_total: usize,
    pub idle_timeout: Duration,
}

impl PoolSettings {
    pub fn from_config(pool: &PoolConfig, timeouts: &TimeoutConfig) -> Self {
        Self {
            max_idle_per_host: pool.max_idle_conns_per_host,
            max_idle_total: pool.max_idle_conns,
            idle_timeout: timeouts.idle_conn(),
        }
    }
}

/// Shared handle to the backend connection pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    settings: PoolSettings,
    connector: Connector,
    idle: Mutex<IdleSet>,
    next_id: AtomicU64,
}

#[derive(Default)]
struct IdleSet {
    hosts: HashMap<PoolKey, VecDeque<IdleEntry>>,
    total: usize,
}

struct IdleEntry {
    conn: Connection,
    since: Instant,
}

/// An open HTTP/1.1 client connection. Dropping it closes the socket.
struct Connection {
    id: u64,
    key: PoolKey,
    sender: SendRequest<Body>,
    driver: AbortHandle,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// A connection checked out of the pool for one exchange.
pub struct PooledConnection {
    connection: Connection,
    reused: bool,
}

impl PooledConnection {
    pub fn id(&self) -> u64 {
        self.connection.id
    }

    /// Whether this connection already served an earlier request.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    /// Wait until the connection can take a request.
    pub async fn ready(&mut self) -> Result<(), hyper::Error> {
        self.connection.sender.ready().await
    }

    pub async fn send_request(
        &mut self,
        request: Request<Body>,
    ) -> Result<Response<Incoming>, hyper::Error> {
        self.connection.sender.send_request(request).await
    }
}

impl ConnectionPool {
    pub fn new(settings: PoolSettings, connector: Connector) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                settings,
                connector,
                idle: Mutex::new(IdleSet::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Check out a connection to `target`, reusing an idle one when possible.
    pub async fn acquire(&self, target: &BackendTarget) -> Result<PooledConnection, ConnectError> {
        let key = target.pool_key();

        if let Some(connection) = self.take_idle(&key) {
            tracing::debug!(connection_id = connection.id, backend = %key, "Reusing backend connection");
            metrics::record_pool_reuse();
            return Ok(PooledConnection {
                connection,
                reused: true,
            });
        }

        let connection = self.dial(target, key).await?;
        Ok(PooledConnection {
            connection,
            reused: false,
        })
    }

    /// Return a connection after an exchange.
    ///
    /// Unhealthy connections, connections the backend already closed, and
    /// anything over the idle caps are closed instead of pooled.
    pub fn release(&self, conn: PooledConnection, healthy: bool) {
        let connection = conn.connection;
        let id = connection.id;

        if !healthy || connection.sender.is_closed() {
            tracing::debug!(connection_id = id, healthy, "Closing backend connection");
            return;
        }

        let settings = self.inner.settings;
        let mut idle = self.lock_idle();

        if idle.total >= settings.max_idle_total {
            tracing::debug!(connection_id = id, "Idle pool full, closing backend connection");
            return;
        }
        let per_host = idle.hosts.get(&connection.key).map_or(0, VecDeque::len);
        if per_host >= settings.max_idle_per_host {
            tracing::debug!(connection_id = id, "Per-host idle cap reached, closing backend connection");
            return;
        }

        let queue = idle.hosts.entry(connection.key.clone()).or_default();
        queue.push_back(IdleEntry {
            conn: connection,
            since: Instant::now(),
        });
        idle.total += 1;
        metrics::set_pool_idle(idle.total);
    }

    /// Number of idle connections across all keys.
    pub fn idle_count(&self) -> usize {
        self.lock_idle().total
    }

    fn lock_idle(&self) -> MutexGuard<'_, IdleSet> {
        self.inner.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_idle(&self, key: &PoolKey) -> Option<Connection> {
        let idle_timeout = self.inner.settings.idle_timeout;
        let mut stale = Vec::new();

        let found = {
            let mut idle = self.lock_idle();
            let IdleSet { hosts, total } = &mut *idle;
            let mut found = None;

            if let Some(queue) = hosts.get_mut(key) {
                // oldest at the front
                while queue
                    .front()
                    .is_some_and(|entry| entry.since.elapsed() >= idle_timeout)
                {
                    stale.extend(queue.pop_front());
                }
                while let Some(entry) = queue.pop_back() {
                    if entry.conn.sender.is_closed() {
                        stale.push(entry);
                        continue;
                    }
                    found = Some(entry.conn);
                    break;
                }
                if queue.is_empty() {
                    hosts.remove(key);
                }
            }

            *total -= stale.len() + usize::from(found.is_some());
            metrics::set_pool_idle(*total);
            found
        };

        if !stale.is_empty() {
            tracing::debug!(evicted = stale.len(), backend = %key, "Evicted stale backend connections");
        }
        drop(stale);
        found
    }

    async fn dial(&self, target: &BackendTarget, key: PoolKey) -> Result<Connection, ConnectError> {
        let stream = self.inner.connector.connect(target).await?;

        let (sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| ConnectError::new(classify_hyper(&e), key.clone(), e))?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let driver = tokio::spawn(async move {
            if let Err(err) = conn.await {
                tracing::debug!(connection_id = id, error = %err, "Backend connection ended with error");
            }
        })
        .abort_handle();

        tracing::debug!(connection_id = id, backend = %key, "Dialed backend connection");
        metrics::record_backend_dial();

        Ok(Connection {
            id,
            key,
            sender,
            driver,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::tls::backend_client_config;
    use crate::upstream::error::ErrorKind;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;

    /// A backend that accepts connections and holds them open without speaking.
    async fn silent_backend() -> (BackendTarget, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();

        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                held.push(socket);
            }
        });

        let target = BackendTarget::parse(&format!("http://{addr}")).unwrap();
        (target, accepted)
    }

    fn pool(max_idle_per_host: usize, max_idle_total: usize, idle_timeout: Duration) -> ConnectionPool {
        let connector = Connector::new(
            backend_client_config(None).unwrap(),
            Duration::from_secs(1),
            Duration::from_secs(1),
            Duration::from_secs(30),
        );
        ConnectionPool::new(
            PoolSettings {
                max_idle_per_host,
                max_idle_total,
                idle_timeout,
            },
            connector,
        )
    }

    #[tokio::test]
    async fn healthy_connection_is_reused() {
        let (target, accepted) = silent_backend().await;
        let pool = pool(4, 16, Duration::from_secs(60));

        let first = pool.acquire(&target).await.unwrap();
        let first_id = first.id();
        assert!(!first.is_reused());
        pool.release(first, true);
        assert_eq!(pool.idle_count(), 1);

        let second = pool.acquire(&target).await.unwrap();
        assert!(second.is_reused());
        assert_eq!(second.id(), first_id);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unhealthy_connection_is_never_reused() {
        let (target, _) = silent_backend().await;
        let pool = pool(4, 16, Duration::from_secs(60));

        let first = pool.acquire(&target).await.unwrap();
        let first_id = first.id();
        pool.release(first, false);
        assert_eq!(pool.idle_count(), 0);

        let second = pool.acquire(&target).await.unwrap();
        assert!(!second.is_reused());
        assert_ne!(second.id(), first_id);
    }

    #[tokio::test]
    async fn per_host_cap_closes_overflow() {
        let (target, _) = silent_backend().await;
        let pool = pool(1, 16, Duration::from_secs(60));

        let a = pool.acquire(&target).await.unwrap();
        let b = pool.acquire(&target).await.unwrap();
        pool.release(a, true);
        pool.release(b, true);

        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn zero_per_host_cap_pools_nothing() {
        let (target, _) = silent_backend().await;
        let pool = pool(0, 16, Duration::from_secs(60));

        let conn = pool.acquire(&target).await.unwrap();
        pool.release(conn, true);

        assert_eq!(pool.idle_count(), 0);
        assert!(pool.lock_idle().hosts.is_empty());
    }

    #[tokio::test]
    async fn total_cap_closes_overflow() {
        let (target, _) = silent_backend().await;
        let pool = pool(8, 2, Duration::from_secs(60));

        let conns = vec![
            pool.acquire(&target).await.unwrap(),
            pool.acquire(&target).await.unwrap(),
            pool.acquire(&target).await.unwrap(),
        ];
        for conn in conns {
            pool.release(conn, true);
        }

        assert_eq!(pool.idle_count(), 2);
    }

    #[tokio::test]
    async fn expired_idle_connection_is_evicted() {
        let (target, accepted) = silent_backend().await;
        let pool = pool(4, 16, Duration::from_millis(50));

        let first = pool.acquire(&target).await.unwrap();
        pool.release(first, true);
        tokio::time::sleep(Duration::from_millis(120)).await;

        let second = pool.acquire(&target).await.unwrap();
        assert!(!second.is_reused());
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn refused_dial_is_classified() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let target = BackendTarget::parse(&format!("http://{addr}")).unwrap();
        let err = pool(4, 16, Duration::from_secs(60))
            .acquire(&target)
            .await
            .err()
            .unwrap();

        assert_eq!(err.kind(), ErrorKind::DialRefused);
    }
}
