//! Bounded pool of upstream client handles
//!
//! Capacity and protocol mode are fixed at construction. In single-stream
//! mode `lease()` suspends once all handles are checked out; multiplexed
//! handles carry many in-flight requests at once, so leasing one never
//! blocks. A lease returns its handle on every exit path; a poisoned lease
//! replaces the handle with a fresh one instead of returning it dirty.

mod client;

pub use client::{HttpMetadataClient, MetadataClient, UpstreamError, VideoMetadata};

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Semaphore, TryAcquireError};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool exhausted: no handle released within {0:?}")]
    Exhausted(Duration),

    #[error("failed to build upstream handle: {0}")]
    Build(String),
}

/// Transport negotiated per handle at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolMode {
    /// One request in flight per handle (HTTP/1)
    Single,
    /// Many concurrent requests per handle (HTTP/2)
    Multiplexed,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub capacity: usize,
    pub mode: PoolMode,
    /// How long `lease()` may wait under exhaustion; `None` waits forever
    pub lease_timeout: Option<Duration>,
    /// Bounds every leased use, independent of pool contention
    pub request_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            mode: PoolMode::Single,
            lease_timeout: None,
            request_timeout: Duration::from_secs(10),
        }
    }
}

struct PoolInner {
    mode: PoolMode,
    lease_timeout: Option<Duration>,
    request_timeout: Duration,
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<reqwest::Client>>,
    // Multiplexed mode shares one handle across all leases
    shared: Option<reqwest::Client>,
}

/// Fixed-capacity set of persistent upstream handles
#[derive(Clone)]
pub struct UpstreamPool {
    inner: Arc<PoolInner>,
}

impl UpstreamPool {
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        let (idle, shared) = match config.mode {
            PoolMode::Single => {
                let mut handles = Vec::with_capacity(config.capacity);
                for _ in 0..config.capacity {
                    handles.push(build_handle(config.mode)?);
                }
                (handles, None)
            }
            PoolMode::Multiplexed => (Vec::new(), Some(build_handle(config.mode)?)),
        };

        Ok(Self {
            inner: Arc::new(PoolInner {
                mode: config.mode,
                lease_timeout: config.lease_timeout,
                request_timeout: config.request_timeout,
                semaphore: Arc::new(Semaphore::new(config.capacity)),
                idle: Mutex::new(idle),
                shared,
            }),
        })
    }

    /// Check out a handle, suspending under exhaustion (single mode only)
    pub async fn lease(&self) -> Result<Lease, PoolError> {
        if let Some(client) = &self.inner.shared {
            // Multiplexed transport: no contention on lease
            return Ok(Lease {
                client: Some(client.clone()),
                permit: None,
                pool: self.inner.clone(),
                poisoned: false,
            });
        }

        let permit = match self.inner.lease_timeout {
            None => self
                .inner
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("pool semaphore never closed"),
            Some(wait) => tokio::time::timeout(
                wait,
                self.inner.semaphore.clone().acquire_owned(),
            )
            .await
            .map_err(|_| PoolError::Exhausted(wait))?
            .expect("pool semaphore never closed"),
        };

        // A failed poison replacement may have left the slot empty; reseed
        let client = match self.inner.idle.lock().pop() {
            Some(client) => client,
            None => build_handle(self.inner.mode)?,
        };

        Ok(Lease {
            client: Some(client),
            permit: Some(permit),
            pool: self.inner.clone(),
            poisoned: false,
        })
    }

    /// Non-blocking lease attempt; used where suspension is unacceptable
    pub fn try_lease(&self) -> Option<Lease> {
        if self.inner.shared.is_some() {
            return Some(Lease {
                client: self.inner.shared.clone(),
                permit: None,
                pool: self.inner.clone(),
                poisoned: false,
            });
        }

        match self.inner.semaphore.clone().try_acquire_owned() {
            Ok(permit) => {
                let client = match self.inner.idle.lock().pop() {
                    Some(client) => client,
                    None => match build_handle(self.inner.mode) {
                        Ok(client) => client,
                        Err(e) => {
                            warn!(error = %e, "failed to reseed upstream handle");
                            return None;
                        }
                    },
                };
                Some(Lease {
                    client: Some(client),
                    permit: Some(permit),
                    pool: self.inner.clone(),
                    poisoned: false,
                })
            }
            Err(TryAcquireError::NoPermits) => None,
            Err(TryAcquireError::Closed) => None,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        self.inner.request_timeout
    }

    pub fn mode(&self) -> PoolMode {
        self.inner.mode
    }

    /// Handles currently leasable (multiplexed pools never run out)
    pub fn available(&self) -> usize {
        match self.inner.mode {
            PoolMode::Single => self.inner.semaphore.available_permits(),
            PoolMode::Multiplexed => usize::MAX,
        }
    }
}

/// Exclusive checkout of one pooled handle
///
/// Dropping the lease releases the slot on every exit path. A poisoned
/// lease discards its handle and seeds a replacement.
pub struct Lease {
    client: Option<reqwest::Client>,
    permit: Option<tokio::sync::OwnedSemaphorePermit>,
    pool: Arc<PoolInner>,
    poisoned: bool,
}

impl Lease {
    pub fn client(&self) -> &reqwest::Client {
        self.client.as_ref().expect("lease holds a handle until drop")
    }

    /// Mark the handle unfit for reuse (timed-out or failed request)
    pub fn poison(&mut self) {
        self.poisoned = true;
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let Some(client) = self.client.take() else {
            return;
        };

        if self.pool.shared.is_some() {
            // Shared multiplexed handle: nothing to return
            return;
        }

        if self.poisoned {
            drop(client);
            match build_handle(self.pool.mode) {
                Ok(fresh) => {
                    debug!("replaced poisoned upstream handle");
                    self.pool.idle.lock().push(fresh);
                }
                Err(e) => {
                    // Slot released empty; the next lease reseeds it
                    warn!(error = %e, "failed to replace poisoned handle");
                }
            }
        } else {
            self.pool.idle.lock().push(client);
        }
        // Releasing the permit (implicit drop) wakes one waiting lease
        drop(self.permit.take());
    }
}

fn build_handle(mode: PoolMode) -> Result<reqwest::Client, PoolError> {
    let builder = match mode {
        PoolMode::Single => reqwest::Client::builder().http1_only(),
        PoolMode::Multiplexed => reqwest::Client::builder().http2_prior_knowledge(),
    };
    builder
        .connect_timeout(Duration::from_secs(5))
        .build()
        .map_err(|e| PoolError::Build(e.to_string()))
}
