//! Bounded-concurrency admission and per-host connection accounting.
//!
//! One counting semaphore gates all in-flight requests of a client. Waiting
//! for a permit races the caller's cancellation token, so a canceled request
//! leaves the queue immediately and never counts as an attempt. Per-host
//! counts are plain atomics behind a read-mostly map; the `max_conns_per_host`
//! cap is claimed per attempt so a saturated host surfaces as a retryable
//! [`Error::ConnLimit`] and backoff provides natural queuing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::Error;

#[derive(Debug)]
pub(crate) struct Admission {
    semaphore: Arc<Semaphore>,
    per_host: RwLock<HashMap<String, Arc<AtomicU32>>>,
    max_conns_per_host: u32,
}

/// A slot on the global semaphore, held for one logical request.
#[derive(Debug)]
pub(crate) struct GlobalPermit {
    _permit: OwnedSemaphorePermit,
}

/// A per-host connection slot, held for one attempt.
#[derive(Debug)]
pub(crate) struct HostSlot {
    counter: Arc<AtomicU32>,
}

impl Drop for HostSlot {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Admission {
    pub(crate) fn new(max_concurrent: usize, max_conns_per_host: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            per_host: RwLock::new(HashMap::new()),
            max_conns_per_host: u32::try_from(max_conns_per_host).unwrap_or(u32::MAX),
        }
    }

    /// Waits for a global slot.
    ///
    /// Returns [`Error::Canceled`] if the token fires while queued; the wait
    /// never counts as an attempt.
    pub(crate) async fn acquire(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<GlobalPermit, Error> {
        let acquired = match cancel {
            Some(token) => tokio::select! {
                () = token.cancelled() => return Err(Error::Canceled),
                permit = Arc::clone(&self.semaphore).acquire_owned() => permit,
            },
            None => Arc::clone(&self.semaphore).acquire_owned().await,
        };
        let permit = acquired.map_err(|_| Error::Closed)?;
        Ok(GlobalPermit { _permit: permit })
    }

    /// Claims a connection slot for one host, failing with the retryable
    /// [`Error::ConnLimit`] when the host is saturated.
    pub(crate) fn claim_host(&self, host: &str) -> Result<HostSlot, Error> {
        let counter = self.host_counter(host);
        let previous = counter.fetch_add(1, Ordering::AcqRel);
        if previous >= self.max_conns_per_host {
            counter.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::ConnLimit {
                host: host.to_string(),
            });
        }
        Ok(HostSlot { counter })
    }

    fn host_counter(&self, host: &str) -> Arc<AtomicU32> {
        {
            let map = match self.per_host.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(counter) = map.get(host) {
                return Arc::clone(counter);
            }
        }
        let mut map = match self.per_host.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(map.entry(host.to_string()).or_default())
    }

    /// Current in-flight count for one host.
    pub(crate) fn in_flight_for(&self, host: &str) -> u32 {
        let map = match self.per_host.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.get(host).map_or(0, |c| c.load(Ordering::Acquire))
    }

    /// Snapshot of all per-host in-flight counts, for metrics.
    pub(crate) fn snapshot(&self) -> HashMap<String, u32> {
        let map = match self.per_host.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.iter()
            .map(|(host, counter)| (host.clone(), counter.load(Ordering::Acquire)))
            .filter(|(_, count)| *count > 0)
            .collect()
    }

    /// Free permits on the global semaphore.
    pub(crate) fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}
