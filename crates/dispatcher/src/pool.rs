use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use workerhub_core::{
    DispatchResult, RequestId, WorkerCapabilities, WorkerInfo, WorkerStatus,
};

/// Write side of a worker connection, as seen by the pool.
#[cfg_attr(test, mockall::automock)]
pub trait WorkerSocket: Send + Sync {
    fn is_open(&self) -> bool;
    fn send(&self, text: String) -> DispatchResult<()>;
    fn close(&self);
}

/// A registered worker. Owned by [`WorkerPool`] for as long as it is connected.
pub struct ConnectedWorker {
    pub id: String,
    pub name: String,
    pub session_id: String,
    pub socket: Box<dyn WorkerSocket>,
    pub capabilities: WorkerCapabilities,
    pub status: WorkerStatus,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub active_requests: u32,
    pub pending_requests: HashSet<RequestId>,
    pub completed_requests: u64,
    pub request_categories: HashMap<RequestId, String>,
    pub category_active_requests: HashMap<String, u32>,
}

impl ConnectedWorker {
    pub fn new(
        id: String,
        name: String,
        session_id: String,
        capabilities: WorkerCapabilities,
        socket: Box<dyn WorkerSocket>,
    ) -> Self {
        let now = Utc::now();
        let mut worker = Self {
            id,
            name,
            session_id,
            socket,
            capabilities,
            status: WorkerStatus::Available,
            connected_at: now,
            last_heartbeat: now,
            active_requests: 0,
            pending_requests: HashSet::new(),
            completed_requests: 0,
            request_categories: HashMap::new(),
            category_active_requests: HashMap::new(),
        };
        worker.refresh_status();
        worker
    }

    fn refresh_status(&mut self) {
        if self.status == WorkerStatus::Unhealthy {
            return;
        }
        self.status = if self.active_requests >= self.capabilities.max_concurrent_requests {
            WorkerStatus::Busy
        } else {
            WorkerStatus::Available
        };
    }

    fn free_slots(&self) -> u32 {
        self.capabilities
            .max_concurrent_requests
            .saturating_sub(self.active_requests)
    }

    /// Remaining room in `category`, or `None` when the category is uncapped.
    fn category_headroom(&self, category: Option<&str>) -> Option<u32> {
        let category = category?;
        let limit = self.capabilities.category_limit(category)?;
        let active = self
            .category_active_requests
            .get(category)
            .copied()
            .unwrap_or(0);
        Some(limit.saturating_sub(active))
    }

    fn can_serve(&self, model_id: &str, category: Option<&str>) -> bool {
        self.status == WorkerStatus::Available
            && self.capabilities.supports_model(model_id)
            && self.free_slots() > 0
            && self.category_headroom(category).map_or(true, |room| room > 0)
    }

    /// Snapshot without the socket.
    pub fn info(&self) -> WorkerInfo {
        let mut pending: Vec<RequestId> = self.pending_requests.iter().cloned().collect();
        pending.sort();
        WorkerInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            session_id: self.session_id.clone(),
            capabilities: self.capabilities.clone(),
            status: self.status,
            connected_at: self.connected_at,
            last_heartbeat: self.last_heartbeat,
            active_requests: self.active_requests,
            pending_requests: pending,
            completed_requests: self.completed_requests,
            category_active_requests: self.category_active_requests.clone(),
        }
    }
}

impl std::fmt::Debug for ConnectedWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectedWorker")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("status", &self.status)
            .field("active_requests", &self.active_requests)
            .finish_non_exhaustive()
    }
}

/// In-memory registry of connected workers.
///
/// Iteration follows registration order, so selection ties always resolve to
/// the earliest registered worker. The pool never performs network I/O beyond
/// writing to sockets that are already open, and never evicts on its own.
#[derive(Default)]
pub struct WorkerPool {
    workers: Vec<ConnectedWorker>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `worker`, returning any entry previously registered under the same id.
    pub fn add(&mut self, worker: ConnectedWorker) -> Option<ConnectedWorker> {
        match self.workers.iter().position(|w| w.id == worker.id) {
            Some(idx) => Some(std::mem::replace(&mut self.workers[idx], worker)),
            None => {
                self.workers.push(worker);
                None
            }
        }
    }

    pub fn remove(&mut self, worker_id: &str) -> Option<ConnectedWorker> {
        let idx = self.workers.iter().position(|w| w.id == worker_id)?;
        Some(self.workers.remove(idx))
    }

    pub fn get(&self, worker_id: &str) -> Option<&ConnectedWorker> {
        self.workers.iter().find(|w| w.id == worker_id)
    }

    fn get_mut(&mut self, worker_id: &str) -> Option<&mut ConnectedWorker> {
        self.workers.iter_mut().find(|w| w.id == worker_id)
    }

    pub fn has(&self, worker_id: &str) -> bool {
        self.get(worker_id).is_some()
    }

    pub fn get_count(&self) -> usize {
        self.workers.len()
    }

    /// Least-loaded available worker serving `model_id` with room in `category`.
    pub fn get_available_worker(
        &self,
        model_id: &str,
        category: Option<&str>,
    ) -> Option<&ConnectedWorker> {
        self.workers
            .iter()
            .filter(|w| w.can_serve(model_id, category))
            .min_by_key(|w| w.active_requests)
    }

    /// Least-loaded worker that is not unhealthy, regardless of model or load.
    pub fn get_any_available_worker(&self) -> Option<&ConnectedWorker> {
        self.workers
            .iter()
            .filter(|w| matches!(w.status, WorkerStatus::Available | WorkerStatus::Busy))
            .min_by_key(|w| w.active_requests)
    }

    /// Requests of `model_id` (in `category`) the pool could admit right now.
    pub fn get_available_slot_count(&self, model_id: &str, category: Option<&str>) -> u32 {
        self.workers
            .iter()
            .filter(|w| w.can_serve(model_id, category))
            .map(|w| match w.category_headroom(category) {
                Some(room) => w.free_slots().min(room),
                None => w.free_slots(),
            })
            .sum()
    }

    /// Assigns `request_id` to a worker. Returns `false` if the worker is unknown.
    pub fn track_request(
        &mut self,
        worker_id: &str,
        request_id: &str,
        category: Option<&str>,
    ) -> bool {
        let Some(worker) = self.get_mut(worker_id) else {
            debug!(worker_id, request_id, "track_request for unknown worker");
            return false;
        };

        if !worker.pending_requests.insert(request_id.to_string()) {
            warn!(worker_id, request_id, "request already tracked on worker");
            return true;
        }
        worker.active_requests += 1;

        if let Some(category) = category {
            *worker
                .category_active_requests
                .entry(category.to_string())
                .or_insert(0) += 1;
            worker
                .request_categories
                .insert(request_id.to_string(), category.to_string());
        }

        worker.refresh_status();
        true
    }

    /// Releases `request_id` from whichever worker holds it.
    ///
    /// Unknown ids are ignored: the owning worker may already have been
    /// removed by disconnect handling. Returns whether a worker was found.
    pub fn release_request(&mut self, request_id: &str, increment_completed: bool) -> bool {
        let Some(worker) = self
            .workers
            .iter_mut()
            .find(|w| w.pending_requests.contains(request_id))
        else {
            debug!(request_id, "release_request for unknown request");
            return false;
        };

        worker.pending_requests.remove(request_id);
        worker.active_requests = worker.active_requests.saturating_sub(1);

        if let Some(category) = worker.request_categories.remove(request_id) {
            if let Some(count) = worker.category_active_requests.get_mut(&category) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    worker.category_active_requests.remove(&category);
                }
            }
        }

        if increment_completed {
            worker.completed_requests += 1;
        }

        worker.refresh_status();
        true
    }

    /// Refreshes a worker's heartbeat and lifts an unhealthy mark.
    pub fn record_heartbeat(&mut self, worker_id: &str) -> bool {
        let Some(worker) = self.get_mut(worker_id) else {
            return false;
        };
        worker.last_heartbeat = Utc::now();
        if worker.status == WorkerStatus::Unhealthy {
            debug!(worker_id, "worker recovered from unhealthy");
            worker.status = WorkerStatus::Available;
        }
        worker.refresh_status();
        true
    }

    /// Marks stale workers unhealthy and returns the ids of dead ones.
    ///
    /// Heartbeat older than `timeout`: unhealthy. Older than `3 * timeout`:
    /// also reported as dead. Eviction is left to the caller.
    pub fn check_health(&mut self, timeout: Duration) -> Vec<String> {
        self.check_health_at(Utc::now(), timeout)
    }

    pub fn check_health_at(&mut self, now: DateTime<Utc>, timeout: Duration) -> Vec<String> {
        let soft = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        let hard = soft.checked_mul(3).unwrap_or(chrono::Duration::MAX);
        let mut dead = Vec::new();

        for worker in &mut self.workers {
            let age = now - worker.last_heartbeat;
            if age > soft {
                if worker.status != WorkerStatus::Unhealthy {
                    warn!(
                        worker_id = %worker.id,
                        age_ms = age.num_milliseconds(),
                        "worker heartbeat stale, marking unhealthy"
                    );
                }
                worker.status = WorkerStatus::Unhealthy;
            }
            if age > hard {
                dead.push(worker.id.clone());
            }
        }

        dead
    }

    /// Writes `message` to the worker's socket if it is open.
    ///
    /// Returns whether a send was attempted, not whether it was delivered.
    pub fn send<T: Serialize + ?Sized>(&self, worker_id: &str, message: &T) -> bool {
        let Some(worker) = self.get(worker_id) else {
            return false;
        };
        if !worker.socket.is_open() {
            return false;
        }
        match serde_json::to_string(message) {
            Ok(text) => {
                if let Err(e) = worker.socket.send(text) {
                    warn!(worker_id, error = %e, "failed to write to worker socket");
                }
                true
            }
            Err(e) => {
                warn!(worker_id, error = %e, "failed to serialize message");
                false
            }
        }
    }

    /// Sends `message` to every worker with an open socket; returns how many were attempted.
    pub fn broadcast<T: Serialize + ?Sized>(&self, message: &T) -> usize {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "failed to serialize broadcast message");
                return 0;
            }
        };

        let mut attempted = 0;
        for worker in self.workers.iter().filter(|w| w.socket.is_open()) {
            attempted += 1;
            if let Err(e) = worker.socket.send(text.clone()) {
                warn!(worker_id = %worker.id, error = %e, "broadcast to worker failed");
            }
        }
        attempted
    }

    pub fn get_info(&self, worker_id: &str) -> Option<WorkerInfo> {
        self.get(worker_id).map(ConnectedWorker::info)
    }

    pub fn get_worker_info_list(&self) -> Vec<WorkerInfo> {
        self.workers.iter().map(ConnectedWorker::info).collect()
    }

    /// Closes every socket and empties the registry.
    pub fn close_all(&mut self) {
        for worker in self.workers.drain(..) {
            worker.socket.close();
        }
    }
}
