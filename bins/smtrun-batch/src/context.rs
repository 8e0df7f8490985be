use crate::pool::ResourcePool;
use crate::topology::{SysfsTopology, TopologyProbe};
use smtrun_common::Config;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info};

/// Registry key of the CPU pool shared by native backends
pub const NATIVE_POOL: &str = "native.resource_pool";
/// Registry key of the CPU + client pool shared by container backends
pub const CONTAINER_POOL: &str = "container.resource_pool";

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("shared object \"{0}\" exists with a different type")]
    TypeMismatch(String),
}

/// Anything the context can own and tear down at batch end
pub trait SharedObject: Any + Send + Sync {
    fn shutdown(&self);

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<C: Send + Sync + 'static> SharedObject for ResourcePool<C> {
    fn shutdown(&self) {
        self.close();
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Batch-wide state shared by every job
///
/// Owns the resource pools, the configured parallelism and the
/// process-level `Config`. Passed by `Arc` to every job and backend.
pub struct SharedContext {
    parallelism: usize,
    config: Config,
    topology: Arc<dyn TopologyProbe>,
    objects: Mutex<HashMap<String, Arc<dyn SharedObject>>>,
}

impl SharedContext {
    pub fn new(parallelism: usize, config: Config) -> Self {
        Self {
            parallelism,
            config,
            topology: Arc::new(SysfsTopology::new()),
            objects: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the host topology probe used by pools created later
    pub fn with_topology(mut self, topology: Arc<dyn TopologyProbe>) -> Self {
        self.topology = topology;
        self
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn topology(&self) -> Arc<dyn TopologyProbe> {
        Arc::clone(&self.topology)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<dyn SharedObject>>> {
        self.objects.lock().expect("shared context mutex poisoned")
    }

    /// Look up `name`, returning `None` if absent or of another type
    pub fn get_object<T: SharedObject>(&self, name: &str) -> Option<Arc<T>> {
        let object = self.lock().get(name).cloned()?;
        object.into_any().downcast::<T>().ok()
    }

    /// Insert `object` under `name` unless something is already there
    pub fn add_object_if_absent(&self, name: &str, object: Arc<dyn SharedObject>) -> bool {
        let mut objects = self.lock();
        if objects.contains_key(name) {
            return false;
        }
        objects.insert(name.to_string(), object);
        true
    }

    /// Fetch `name`, constructing it with `create` on first use
    ///
    /// `create` runs outside the lock. If two callers race, the loser's
    /// object is dropped and both get the winner's.
    pub fn get_or_create<T, E, F>(&self, name: &str, create: F) -> Result<Arc<T>, E>
    where
        T: SharedObject,
        E: From<ContextError>,
        F: FnOnce() -> Result<T, E>,
    {
        if let Some(existing) = self.get_object::<T>(name) {
            return Ok(existing);
        }

        let candidate = Arc::new(create()?);
        if self.add_object_if_absent(name, candidate.clone()) {
            debug!(object = name, "Registered shared object");
            return Ok(candidate);
        }

        debug!(object = name, "Lost construction race, using existing object");
        self.get_object::<T>(name)
            .ok_or_else(|| ContextError::TypeMismatch(name.to_string()).into())
    }

    /// Shut down every registered object and empty the registry
    pub fn shutdown(&self) {
        let objects: Vec<(String, Arc<dyn SharedObject>)> = self.lock().drain().collect();
        for (name, object) in objects {
            object.shutdown();
            info!(object = %name, "Shared object shut down");
        }
    }
}
