//! In-memory container engine with fault injection and call recording.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use tracing::debug;
use uuid::Uuid;

use super::{ContainerHandle, ContainerInspection, ContainerRuntime, ContainerSpec, RuntimeError};

const FIRST_HOST_PORT: u16 = 30000;

struct ContainerRecord {
    spec: ContainerSpec,
    health: String,
    host_port: u16,
}

/// Containers live in a map; "running" means present in it.
pub struct InMemoryContainerRuntime {
    containers: DashMap<ContainerHandle, ContainerRecord>,
    next_port: AtomicU16,
    fail_creates: AtomicBool,
    fail_stops: AtomicBool,
    /// Stop succeeds but the container keeps running.
    ignore_stops: AtomicBool,
    created: Mutex<Vec<ContainerSpec>>,
    stops: Mutex<Vec<ContainerHandle>>,
    kills: Mutex<Vec<ContainerHandle>>,
}

impl InMemoryContainerRuntime {
    #[must_use]
    pub fn new() -> Self {
        Self {
            containers: DashMap::new(),
            next_port: AtomicU16::new(FIRST_HOST_PORT),
            fail_creates: AtomicBool::new(false),
            fail_stops: AtomicBool::new(false),
            ignore_stops: AtomicBool::new(false),
            created: Mutex::new(Vec::new()),
            stops: Mutex::new(Vec::new()),
            kills: Mutex::new(Vec::new()),
        }
    }

    pub fn set_fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_stops(&self, fail: bool) {
        self.fail_stops.store(fail, Ordering::SeqCst);
    }

    pub fn set_ignore_stops(&self, ignore: bool) {
        self.ignore_stops.store(ignore, Ordering::SeqCst);
    }

    /// Set the health status reported by `inspect`.
    pub fn set_health(&self, handle: &ContainerHandle, status: &str) -> bool {
        match self.containers.get_mut(handle) {
            Some(mut record) => {
                record.health = status.to_string();
                true
            }
            None => false,
        }
    }

    /// Simulate the container exiting on its own.
    pub fn remove(&self, handle: &ContainerHandle) -> bool {
        self.containers.remove(handle).is_some()
    }

    #[must_use]
    pub fn is_running(&self, handle: &ContainerHandle) -> bool {
        self.containers.contains_key(handle)
    }

    #[must_use]
    pub fn running_count(&self) -> usize {
        self.containers.len()
    }

    #[must_use]
    pub fn created_specs(&self) -> Vec<ContainerSpec> {
        self.created.lock().clone()
    }

    #[must_use]
    pub fn stop_log(&self) -> Vec<ContainerHandle> {
        self.stops.lock().clone()
    }

    #[must_use]
    pub fn kill_log(&self) -> Vec<ContainerHandle> {
        self.kills.lock().clone()
    }
}

impl Default for InMemoryContainerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for InMemoryContainerRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(RuntimeError::Request(format!(
                "cannot create {} from {}",
                spec.name, spec.image
            )));
        }
        let id = Uuid::new_v4().simple().to_string();
        let handle = ContainerHandle::new(&id[..12]);
        let host_port = self.next_port.fetch_add(1, Ordering::Relaxed);

        self.containers.insert(
            handle.clone(),
            ContainerRecord {
                spec: spec.clone(),
                health: "starting".to_string(),
                host_port,
            },
        );
        self.created.lock().push(spec.clone());
        debug!(container = %handle, name = %spec.name, "Created container");
        Ok(handle)
    }

    async fn inspect(&self, handle: &ContainerHandle) -> Result<ContainerInspection, RuntimeError> {
        let record = self
            .containers
            .get(handle)
            .ok_or_else(|| RuntimeError::NotFound(handle.clone()))?;
        Ok(ContainerInspection {
            ports: HashMap::from([(record.spec.published_port, record.host_port)]),
            health_status: Some(record.health.clone()),
        })
    }

    async fn stop(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        if self.fail_stops.load(Ordering::SeqCst) {
            return Err(RuntimeError::Request(format!("cannot stop {handle}")));
        }
        if !self.containers.contains_key(handle) {
            return Err(RuntimeError::NotFound(handle.clone()));
        }
        self.stops.lock().push(handle.clone());
        if !self.ignore_stops.load(Ordering::SeqCst) {
            self.containers.remove(handle);
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ContainerHandle>, RuntimeError> {
        let mut handles: Vec<ContainerHandle> =
            self.containers.iter().map(|e| e.key().clone()).collect();
        handles.sort();
        Ok(handles)
    }

    async fn kill(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        self.kills.lock().push(handle.clone());
        self.containers
            .remove(handle)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::NotFound(handle.clone()))
    }
}
