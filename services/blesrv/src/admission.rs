//! Adapter admission control
//!
//! A BLE adapter holds only a few connections at once and misbehaves when
//! several connections start in the same instant. Each adapter therefore has
//! a slot pool: a connection may start only while `occupied < capacity` and
//! at least `min_spacing` after the previous start. Waiters are served in
//! arrival order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::AdapterConfig;
use crate::error::{BleSrvError, Result};

#[derive(Debug, Default)]
struct SlotState {
    occupied: usize,
    last_start: Option<Instant>,
    granted: u64,
}

#[derive(Debug)]
struct AdapterSlots {
    id: String,
    capacity: usize,
    min_spacing: Duration,
    /// Held by the waiter at the head of the queue; tokio's mutex is FIFO
    turn: tokio::sync::Mutex<()>,
    state: Mutex<SlotState>,
    released: Notify,
}

enum Admission {
    Granted,
    WaitUntil(Instant),
    WaitForRelease,
}

impl AdapterSlots {
    fn try_admit(&self) -> Admission {
        let mut state = self.state.lock();
        if state.occupied >= self.capacity {
            return Admission::WaitForRelease;
        }
        let now = Instant::now();
        if let Some(last) = state.last_start {
            let ready_at = last + self.min_spacing;
            if now < ready_at {
                return Admission::WaitUntil(ready_at);
            }
        }
        state.occupied += 1;
        state.last_start = Some(now);
        state.granted += 1;
        Admission::Granted
    }
}

/// One occupied connection slot; released on drop
#[derive(Debug)]
pub struct AdapterPermit {
    slots: Arc<AdapterSlots>,
}

impl AdapterPermit {
    pub fn adapter_id(&self) -> &str {
        &self.slots.id
    }
}

impl Drop for AdapterPermit {
    fn drop(&mut self) {
        let occupied = {
            let mut state = self.slots.state.lock();
            state.occupied = state.occupied.saturating_sub(1);
            state.occupied
        };
        trace!(
            "Adapter {} slot released ({}/{})",
            self.slots.id,
            occupied,
            self.slots.capacity
        );
        self.slots.released.notify_one();
    }
}

/// Point-in-time view of one adapter's slot pool
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdapterSnapshot {
    pub id: String,
    pub capacity: usize,
    pub occupied: usize,
    pub min_spacing: Duration,
    pub since_last_start: Option<Duration>,
    pub granted_total: u64,
}

/// Per-adapter connection slot pools
#[derive(Debug, Default)]
pub struct AdmissionController {
    adapters: HashMap<String, Arc<AdapterSlots>>,
}

impl AdmissionController {
    pub fn new(adapters: &[AdapterConfig]) -> Self {
        let adapters = adapters
            .iter()
            .map(|adapter| {
                let slots = AdapterSlots {
                    id: adapter.id.clone(),
                    capacity: adapter.capacity.max(1),
                    min_spacing: adapter.min_spacing(),
                    turn: tokio::sync::Mutex::new(()),
                    state: Mutex::new(SlotState::default()),
                    released: Notify::new(),
                };
                (adapter.id.clone(), Arc::new(slots))
            })
            .collect();
        Self { adapters }
    }

    fn slots(&self, adapter_id: &str) -> Result<&Arc<AdapterSlots>> {
        self.adapters
            .get(adapter_id)
            .ok_or_else(|| BleSrvError::UnknownAdapter(adapter_id.to_string()))
    }

    /// Wait for a connection slot on `adapter_id`
    ///
    /// Capacity and spacing are checked together under one lock, so a grant
    /// never violates either. Dropping the returned future gives up the
    /// place in the queue.
    pub async fn acquire(&self, adapter_id: &str) -> Result<AdapterPermit> {
        let slots = Arc::clone(self.slots(adapter_id)?);
        let _turn = slots.turn.lock().await;

        loop {
            match slots.try_admit() {
                Admission::Granted => {
                    debug!("Adapter {} slot granted", slots.id);
                    return Ok(AdapterPermit {
                        slots: Arc::clone(&slots),
                    });
                },
                Admission::WaitUntil(ready_at) => {
                    trace!("Adapter {} spacing, waiting", slots.id);
                    tokio::time::sleep_until(ready_at).await;
                },
                Admission::WaitForRelease => {
                    trace!("Adapter {} full, waiting for release", slots.id);
                    slots.released.notified().await;
                },
            }
        }
    }

    pub fn min_spacing(&self, adapter_id: &str) -> Result<Duration> {
        Ok(self.slots(adapter_id)?.min_spacing)
    }

    pub fn snapshot(&self, adapter_id: &str) -> Result<AdapterSnapshot> {
        let slots = self.slots(adapter_id)?;
        let state = slots.state.lock();
        Ok(AdapterSnapshot {
            id: slots.id.clone(),
            capacity: slots.capacity,
            occupied: state.occupied,
            min_spacing: slots.min_spacing,
            since_last_start: state.last_start.map(|last| last.elapsed()),
            granted_total: state.granted,
        })
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn controller(capacity: usize, spacing_secs: u64) -> Arc<AdmissionController> {
        Arc::new(AdmissionController::new(&[AdapterConfig {
            id: "hci0".into(),
            capacity,
            min_spacing_secs: spacing_secs,
        }]))
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_enforced() {
        let admission = controller(2, 0);
        let first = admission.acquire("hci0").await.unwrap();
        let _second = admission.acquire("hci0").await.unwrap();
        assert_eq!(admission.snapshot("hci0").unwrap().occupied, 2);

        let waiter = {
            let admission = admission.clone();
            tokio::spawn(async move { admission.acquire("hci0").await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!waiter.is_finished());

        drop(first);
        waiter.await.unwrap().unwrap();
        assert_eq!(admission.snapshot("hci0").unwrap().granted_total, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spacing_between_starts() {
        let admission = controller(4, 10);
        let start = Instant::now();
        let _a = admission.acquire("hci0").await.unwrap();
        let _b = admission.acquire("hci0").await.unwrap();
        let _c = admission.acquire("hci0").await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_keeps_spacing() {
        let admission = controller(1, 10);
        let start = Instant::now();
        drop(admission.acquire("hci0").await.unwrap());
        let _b = admission.acquire("hci0").await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_served_in_order() {
        let admission = controller(1, 0);
        let held = admission.acquire("hci0").await.unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..3 {
            let admission = admission.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _permit = admission.acquire("hci0").await.unwrap();
                order.lock().push(i);
            }));
            tokio::task::yield_now().await;
        }

        drop(held);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_unknown_adapter() {
        let admission = controller(1, 0);
        assert!(matches!(
            admission.acquire("hci7").await,
            Err(BleSrvError::UnknownAdapter(_))
        ));
        assert!(admission.snapshot("hci7").is_err());
    }
}
