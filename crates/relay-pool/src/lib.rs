//! Per-account outbound HTTPS connection pool.
//!
//! A pool holds `N` warmed `reqwest::Client` transports (default 3) for one
//! upstream account. `reqwest`/`hyper` already pool TCP connections beneath
//! a `Client`, so "connection" here means one independently-configured
//! client (its own proxy, if any) that the round-robin policy treats as a
//! unit of health — a fatal transport-level error on one client marks it
//! unhealthy and schedules its replacement without affecting the others.
//!
//! redesign notes realized here:
//!   - Socket listeners → an explicit `broadcast::Sender<PoolEvent>`.
//!   - Weak-reference tricks → a `generation` counter per slot; a reconnect
//!     task captures the generation it observed and silently no-ops if the
//!     slot has since moved on to a newer generation.

pub mod error;
pub mod event;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

pub use error::PoolError;
pub use event::{PoolEvent, PoolStatus};

const DEFAULT_POOL_SIZE: usize = 3;
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// A single pooled transport. `generation` increments every time this slot
/// is rebuilt after a failure; in-flight tasks that captured an older
/// generation compare-and-bail instead of mutating a slot they no longer own.
struct Slot {
    id: u64,
    generation: AtomicU64,
    client: RwLock<Option<reqwest::Client>>,
    healthy: std::sync::atomic::AtomicBool,
}

/// A pooled outbound transport handed back by [`ConnectionPool::get_connection`].
#[derive(Clone)]
pub struct PooledConnection {
    pub slot_id: u64,
    pub client: reqwest::Client,
}

/// Per-account pool of warmed outbound transports.
pub struct ConnectionPool {
    account_id: String,
    proxy: Option<String>,
    size: usize,
    slots: Vec<Arc<Slot>>,
    next: AtomicUsize,
    events: broadcast::Sender<PoolEvent>,
}

impl ConnectionPool {
    pub fn new(account_id: impl Into<String>, proxy: Option<String>) -> Self {
        Self::with_size(account_id, proxy, DEFAULT_POOL_SIZE)
    }

    pub fn with_size(account_id: impl Into<String>, proxy: Option<String>, size: usize) -> Self {
        let size = size.max(1);
        let (tx, _rx) = broadcast::channel(64);
        let slots = (0..size as u64)
            .map(|id| {
                Arc::new(Slot {
                    id,
                    generation: AtomicU64::new(0),
                    client: RwLock::new(None),
                    healthy: std::sync::atomic::AtomicBool::new(false),
                })
            })
            .collect();

        Self {
            account_id: account_id.into(),
            proxy,
            size,
            slots,
            next: AtomicUsize::new(0),
            events: tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    fn build_client(&self) -> Result<reqwest::Client, PoolError> {
        let mut builder = reqwest::Client::builder();
        if let Some(proxy_url) = &self.proxy {
            let proxy = reqwest::Proxy::all(proxy_url).map_err(|e| PoolError::Build {
                account_id: self.account_id.clone(),
                reason: e.to_string(),
            })?;
            builder = builder.proxy(proxy);
        }
        builder.build().map_err(|e| PoolError::Build {
            account_id: self.account_id.clone(),
            reason: e.to_string(),
        })
    }

    /// Warms all `N` transports concurrently.
    pub async fn initialize(&self) -> Result<(), PoolError> {
        let mut tasks = Vec::with_capacity(self.size);
        for slot in &self.slots {
            let slot = Arc::clone(slot);
            let client = self.build_client()?;
            tasks.push(async move {
                let started = Instant::now();
                *slot.client.write().await = Some(client);
                slot.healthy.store(true, Ordering::SeqCst);
                (slot.id, started.elapsed())
            });
        }

        let results = futures_join_all(tasks).await;
        for (slot_id, latency) in results {
            let _ = self.events.send(PoolEvent::Connected { slot_id, latency });
        }
        let healthy = self.healthy_count().await;
        let _ = self.events.send(PoolEvent::StatusChanged {
            status: if healthy == self.size {
                PoolStatus::Healthy
            } else {
                PoolStatus::Degraded
            },
            healthy_connections: healthy,
        });
        info!(account_id = %self.account_id, healthy, size = self.size, "connection pool initialized");
        Ok(())
    }

    async fn healthy_count(&self) -> usize {
        let mut count = 0;
        for slot in &self.slots {
            if slot.healthy.load(Ordering::SeqCst) {
                count += 1;
            }
        }
        count
    }

    /// Round-robin over healthy slots. Returns [`PoolError::Degraded`] when
    /// none are healthy, so the scheduler can pick another account.
    pub async fn get_connection(&self) -> Result<PooledConnection, PoolError> {
        for _ in 0..self.size {
            let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.size;
            let slot = &self.slots[idx];
            if slot.healthy.load(Ordering::SeqCst) {
                if let Some(client) = slot.client.read().await.clone() {
                    return Ok(PooledConnection {
                        slot_id: slot.id,
                        client,
                    });
                }
            }
        }
        Err(PoolError::Degraded {
            account_id: self.account_id.clone(),
        })
    }

    /// Classifies a transport-level failure as fatal (reset, refused, timed
    /// out, unreachable, "socket hang up") and, if fatal, removes and
    /// schedules replacement of the owning slot.
    pub fn is_fatal(error: &reqwest::Error) -> bool {
        error.is_connect() || error.is_timeout() || error.is_request()
    }

    /// Marks `slot_id` unhealthy and spawns the exponential-backoff
    /// reconnect loop.
    pub fn mark_unhealthy(self: &Arc<Self>, slot_id: u64, reason: String) {
        let Some(slot) = self.slots.iter().find(|s| s.id == slot_id).cloned() else {
            return;
        };
        let was_healthy = slot.healthy.swap(false, Ordering::SeqCst);
        let generation = slot.generation.fetch_add(1, Ordering::SeqCst) + 1;

        if was_healthy {
            let _ = self.events.send(PoolEvent::Disconnected {
                slot_id,
                reason: reason.clone(),
            });
        }
        warn!(account_id = %self.account_id, slot_id, reason, "transport marked unhealthy");

        let pool = Arc::clone(self);
        tokio::spawn(async move {
            pool.reconnect_with_backoff(slot, generation).await;
        });
    }

    async fn reconnect_with_backoff(self: Arc<Self>, slot: Arc<Slot>, generation: u64) {
        let started = Instant::now();
        let mut delay = BACKOFF_BASE;

        for attempt in 1..=MAX_RECONNECT_ATTEMPTS {
            tokio::time::sleep(delay).await;

            // A newer failure/replacement superseded this attempt; self-detach.
            if slot.generation.load(Ordering::SeqCst) != generation {
                return;
            }

            match self.build_client() {
                Ok(client) => {
                    *slot.client.write().await = Some(client);
                    slot.healthy.store(true, Ordering::SeqCst);
                    let _ = self.events.send(PoolEvent::Reconnected {
                        slot_id: slot.id,
                        downtime: started.elapsed(),
                    });
                    info!(account_id = %self.account_id, slot_id = slot.id, attempt, "transport reconnected");
                    return;
                }
                Err(err) => {
                    let _ = self.events.send(PoolEvent::Error {
                        slot_id: slot.id,
                        error: err.to_string(),
                    });
                    warn!(account_id = %self.account_id, slot_id = slot.id, attempt, %err, "reconnect attempt failed");
                }
            }

            delay = (delay * 2).min(BACKOFF_CAP);
        }

        warn!(account_id = %self.account_id, slot_id = slot.id, "reconnect attempts exhausted");
    }

    /// Closes every transport within `timeout`. `reqwest::Client` has no
    /// explicit close; dropping the last handle tears down its connection
    /// pool, so this clears the slots and lets drop do the rest.
    pub async fn destroy(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, async {
            for slot in &self.slots {
                *slot.client.write().await = None;
                slot.healthy.store(false, Ordering::SeqCst);
            }
        })
        .await;
    }
}

/// Small local stand-in for `futures::future::join_all` to avoid pulling in
/// the `futures` crate for a single call site.
async fn futures_join_all<F, T>(tasks: Vec<F>) -> Vec<T>
where
    F: std::future::Future<Output = T>,
{
    let mut out = Vec::with_capacity(tasks.len());
    for task in tasks {
        out.push(task.await);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn initialize_warms_all_slots() {
        let pool = ConnectionPool::with_size("acct-1", None, 3);
        pool.initialize().await.unwrap();
        assert_eq!(pool.healthy_count().await, 3);
    }

    #[tokio::test]
    async fn get_connection_round_robins() {
        let pool = ConnectionPool::with_size("acct-1", None, 3);
        pool.initialize().await.unwrap();
        let first = pool.get_connection().await.unwrap();
        let second = pool.get_connection().await.unwrap();
        assert_ne!(first.slot_id, second.slot_id);
    }

    #[tokio::test]
    async fn degraded_pool_returns_error() {
        let pool = ConnectionPool::with_size("acct-1", None, 1);
        // Never initialized: no healthy transports.
        let err = pool.get_connection().await.unwrap_err();
        assert!(matches!(err, PoolError::Degraded { .. }));
    }

    #[tokio::test]
    async fn mark_unhealthy_removes_slot_from_rotation() {
        let pool = Arc::new(ConnectionPool::with_size("acct-1", None, 2));
        pool.initialize().await.unwrap();
        pool.mark_unhealthy(0, "connection reset".to_owned());
        assert_eq!(pool.healthy_count().await, 1);
        // Both remaining round-robin picks land on the still-healthy slot.
        let a = pool.get_connection().await.unwrap();
        let b = pool.get_connection().await.unwrap();
        assert_eq!(a.slot_id, 1);
        assert_eq!(b.slot_id, 1);
    }

    #[tokio::test]
    async fn destroy_clears_all_slots() {
        let pool = ConnectionPool::with_size("acct-1", None, 2);
        pool.initialize().await.unwrap();
        pool.destroy(Duration::from_secs(1)).await;
        assert_eq!(pool.healthy_count().await, 0);
    }
}
