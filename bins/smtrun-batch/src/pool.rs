/// Resource Pool - Shared Inventory of Scarce Host Resources
///
/// **Core Responsibility:**
/// Hand out CPU sets (with the NUMA node each CPU came from) and
/// container-client handles to concurrently running jobs, and take them
/// back exactly once.
///
/// **Locking:**
/// One mutex per pool guards all bookkeeping. It is held only for the
/// O(pool size) acquire/release work, never across a run.
///
/// **Integrity:**
/// Releasing an id or handle the pool does not own, or releasing it twice,
/// is a programming error in the acquire/release discipline and is
/// reported as a `PoolError` rather than absorbed.

use crate::topology::TopologyProbe;
use smtrun_common::{ConfigError, ResourcePinning};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::io;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("pool \"{0}\" has no cpu pinning configured")]
    NotPinned(String),

    #[error("failed to discover host cpu topology: {0}")]
    Topology(#[source] io::Error),

    #[error("cpu {0} is not present in the host topology")]
    UnknownCpu(u32),

    #[error("no single NUMA node has {requested} free cpus")]
    NoSingleNodeFits { requested: usize },

    #[error("pool exhausted: requested {requested} cpus but only {free} are free")]
    Exhausted { requested: usize, free: usize },

    #[error("cpu {0} does not belong to the pool")]
    ForeignCpu(u32),

    #[error("cpu {0} released while not in use")]
    CpuDoubleRelease(u32),

    #[error("pool \"{0}\" has no client factory")]
    NoClientFactory(String),

    #[error("failed to create client: {0:#}")]
    ClientFactory(anyhow::Error),

    #[error("no free client handle")]
    NoFreeClient,

    #[error("client handle {0} does not belong to the pool")]
    ForeignClient(usize),

    #[error("client handle {0} released while not in use")]
    ClientDoubleRelease(usize),

    #[error("pool is closed")]
    Closed,
}

/// CPUs borrowed from a pool, each paired with its NUMA node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuLease {
    slots: Vec<(u32, u32)>,
}

impl CpuLease {
    #[cfg(test)]
    pub(crate) fn for_tests(slots: Vec<(u32, u32)>) -> Self {
        Self { slots }
    }

    pub fn slots(&self) -> &[(u32, u32)] {
        &self.slots
    }

    pub fn cpu_ids(&self) -> Vec<u32> {
        self.slots.iter().map(|(cpu, _)| *cpu).collect()
    }

    pub fn nodes(&self) -> BTreeSet<u32> {
        self.slots.iter().map(|(_, node)| *node).collect()
    }

    /// Comma separated cpu ids, as accepted by `taskset`, `numactl` and
    /// the container cpuset field
    pub fn cpu_list(&self) -> String {
        join_ids(self.cpu_ids())
    }

    pub fn node_list(&self) -> String {
        join_ids(self.nodes())
    }
}

fn join_ids(ids: impl IntoIterator<Item = u32>) -> String {
    ids.into_iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// A client borrowed from a pool
pub struct ClientLease<C> {
    id: usize,
    client: Arc<C>,
}

impl<C> ClientLease<C> {
    pub fn id(&self) -> usize {
        self.id
    }
}

impl<C> Clone for ClientLease<C> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            client: Arc::clone(&self.client),
        }
    }
}

impl<C> Deref for ClientLease<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.client
    }
}

impl<C> fmt::Debug for ClientLease<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientLease").field("id", &self.id).finish()
    }
}

type ClientFactory<C> = Box<dyn Fn() -> anyhow::Result<C> + Send + Sync>;

struct CpuInventory {
    /// Every pinned cpu → the node it belongs to
    origin: HashMap<u32, u32>,
    /// node → cpus currently free on it
    free: BTreeMap<u32, BTreeSet<u32>>,
}

impl CpuInventory {
    fn free_count(&self) -> usize {
        self.free.values().map(BTreeSet::len).sum()
    }
}

struct PoolState<C> {
    cpus: Option<CpuInventory>,
    clients: Option<Vec<Arc<C>>>,
    free_clients: BTreeSet<usize>,
    closed: bool,
}

pub struct ResourcePool<C> {
    name: String,
    parallelism: usize,
    pinning: Option<ResourcePinning>,
    topology: Arc<dyn TopologyProbe>,
    client_factory: Option<ClientFactory<C>>,
    state: Mutex<PoolState<C>>,
}

/// Pool used by the native substrate: CPUs only
pub type NativePool = ResourcePool<()>;

/// Pool used by the container substrate: CPUs plus daemon clients
pub type ContainerPool = ResourcePool<bollard::Docker>;

impl<C> ResourcePool<C> {
    /// Build a pool sized for `parallelism` concurrent jobs
    ///
    /// Fails if `parallelism × cpus_per_job` exceeds the pinned cpu count.
    pub fn new(
        name: impl Into<String>,
        parallelism: usize,
        pinning: Option<ResourcePinning>,
        topology: Arc<dyn TopologyProbe>,
    ) -> Result<Self, PoolError> {
        if let Some(pinning) = &pinning {
            pinning.validate(parallelism)?;
        }
        Ok(Self {
            name: name.into(),
            parallelism,
            pinning,
            topology,
            client_factory: None,
            state: Mutex::new(PoolState {
                cpus: None,
                clients: None,
                free_clients: BTreeSet::new(),
                closed: false,
            }),
        })
    }

    /// Attach the factory used to lazily build `parallelism` clients
    pub fn with_clients<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> anyhow::Result<C> + Send + Sync + 'static,
    {
        self.client_factory = Some(Box::new(factory));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pinning(&self) -> Option<&ResourcePinning> {
        self.pinning.as_ref()
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<C>> {
        self.state.lock().expect("resource pool mutex poisoned")
    }

    pub fn acquire_cpus(&self) -> Result<CpuLease, PoolError> {
        let pinning = self
            .pinning
            .as_ref()
            .ok_or_else(|| PoolError::NotPinned(self.name.clone()))?;
        let requested = pinning.cpus_per_job;

        let mut state = self.lock();
        if state.closed {
            return Err(PoolError::Closed);
        }
        if state.cpus.is_none() {
            state.cpus = Some(self.map_topology(pinning)?);
        }
        let Some(inventory) = state.cpus.as_mut() else {
            unreachable!("cpu inventory initialised above");
        };

        let slots = if pinning.use_memset_of_nearest_node {
            // Whole request from one node; never split across nodes
            let (node, free) = inventory
                .free
                .iter_mut()
                .find(|(_, free)| free.len() >= requested)
                .ok_or(PoolError::NoSingleNodeFits { requested })?;
            let taken: Vec<u32> = free.iter().take(requested).copied().collect();
            for cpu in &taken {
                free.remove(cpu);
            }
            taken.into_iter().map(|cpu| (cpu, *node)).collect::<Vec<_>>()
        } else {
            let free = inventory.free_count();
            if free < requested {
                return Err(PoolError::Exhausted { requested, free });
            }
            let mut slots = Vec::with_capacity(requested);
            for (node, cpus) in inventory.free.iter_mut() {
                while slots.len() < requested {
                    match cpus.pop_first() {
                        Some(cpu) => slots.push((cpu, *node)),
                        None => break,
                    }
                }
            }
            slots
        };

        let lease = CpuLease { slots };
        debug!(
            pool = %self.name,
            cpus = %lease.cpu_list(),
            nodes = %lease.node_list(),
            free = inventory.free_count(),
            "Acquired cpus"
        );
        Ok(lease)
    }

    pub fn release_cpus(&self, lease: &CpuLease) -> Result<(), PoolError> {
        let mut state = self.lock();
        let inventory = state
            .cpus
            .as_mut()
            .ok_or_else(|| PoolError::ForeignCpu(lease.slots.first().map_or(0, |s| s.0)))?;

        // Validate everything before touching the free sets
        let mut seen = BTreeSet::new();
        for (cpu, _) in &lease.slots {
            let node = inventory.origin.get(cpu).ok_or(PoolError::ForeignCpu(*cpu))?;
            let already_free = inventory.free.get(node).is_some_and(|f| f.contains(cpu));
            if already_free || !seen.insert(*cpu) {
                return Err(PoolError::CpuDoubleRelease(*cpu));
            }
        }

        for (cpu, _) in &lease.slots {
            if let Some(node) = inventory.origin.get(cpu) {
                inventory.free.entry(*node).or_default().insert(*cpu);
            }
        }
        debug!(
            pool = %self.name,
            cpus = %lease.cpu_list(),
            free = inventory.free_count(),
            "Released cpus"
        );
        Ok(())
    }

    fn map_topology(&self, pinning: &ResourcePinning) -> Result<CpuInventory, PoolError> {
        let nodes = self.topology.discover().map_err(PoolError::Topology)?;
        let host: HashMap<u32, u32> = nodes
            .iter()
            .flat_map(|(node, cpus)| cpus.iter().map(move |cpu| (*cpu, *node)))
            .collect();

        let mut origin = HashMap::new();
        let mut free: BTreeMap<u32, BTreeSet<u32>> = BTreeMap::new();
        for cpu in &pinning.cpu_ids {
            let node = *host.get(cpu).ok_or(PoolError::UnknownCpu(*cpu))?;
            origin.insert(*cpu, node);
            free.entry(node).or_default().insert(*cpu);
        }

        info!(
            pool = %self.name,
            nodes = ?free,
            "Mapped pinned cpus onto NUMA topology"
        );
        Ok(CpuInventory { origin, free })
    }

    pub fn acquire_client(&self) -> Result<ClientLease<C>, PoolError> {
        let mut state = self.lock();
        if state.closed {
            return Err(PoolError::Closed);
        }
        if state.clients.is_none() {
            let factory = self
                .client_factory
                .as_ref()
                .ok_or_else(|| PoolError::NoClientFactory(self.name.clone()))?;
            let mut clients = Vec::with_capacity(self.parallelism);
            for _ in 0..self.parallelism {
                clients.push(Arc::new(factory().map_err(PoolError::ClientFactory)?));
            }
            info!(pool = %self.name, count = clients.len(), "Created client inventory");
            state.free_clients = (0..clients.len()).collect();
            state.clients = Some(clients);
        }

        let id = state.free_clients.pop_first().ok_or(PoolError::NoFreeClient)?;
        let client = match state.clients.as_ref().and_then(|c| c.get(id)) {
            Some(client) => Arc::clone(client),
            None => return Err(PoolError::ForeignClient(id)),
        };
        debug!(pool = %self.name, client = id, free = state.free_clients.len(), "Acquired client");
        Ok(ClientLease { id, client })
    }

    pub fn release_client(&self, lease: ClientLease<C>) -> Result<(), PoolError> {
        let mut state = self.lock();
        if state.closed {
            debug!(pool = %self.name, client = lease.id, "Client returned to closed pool");
            return Ok(());
        }
        let owned = state
            .clients
            .as_ref()
            .and_then(|c| c.get(lease.id))
            .is_some_and(|c| Arc::ptr_eq(c, &lease.client));
        if !owned {
            return Err(PoolError::ForeignClient(lease.id));
        }
        if !state.free_clients.insert(lease.id) {
            return Err(PoolError::ClientDoubleRelease(lease.id));
        }
        debug!(pool = %self.name, client = lease.id, free = state.free_clients.len(), "Released client");
        Ok(())
    }

    /// Drop every client and refuse further acquisitions
    pub fn close(&self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        let in_use = state
            .clients
            .as_ref()
            .map_or(0, |c| c.len() - state.free_clients.len());
        if in_use > 0 {
            warn!(pool = %self.name, in_use, "Closing pool with clients still in use");
        }
        state.clients = None;
        state.free_clients.clear();
        info!(pool = %self.name, "Pool closed");
    }

    pub fn free_cpu_count(&self) -> usize {
        let state = self.lock();
        match &state.cpus {
            Some(inventory) => inventory.free_count(),
            None => self.pinning.as_ref().map_or(0, |p| p.cpu_ids.len()),
        }
    }

    pub fn free_client_count(&self) -> usize {
        let state = self.lock();
        match &state.clients {
            Some(_) => state.free_clients.len(),
            None if state.closed => 0,
            None => self.parallelism,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::StaticTopology;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn pinning(cpus: impl IntoIterator<Item = u32>, per_job: usize, nearest: bool) -> ResourcePinning {
        ResourcePinning {
            cpu_ids: cpus.into_iter().collect(),
            cpus_per_job: per_job,
            use_memset_of_nearest_node: nearest,
        }
    }

    fn pinned_pool(parallelism: usize, pinning: ResourcePinning, topology: StaticTopology) -> NativePool {
        ResourcePool::new("test", parallelism, Some(pinning), Arc::new(topology)).unwrap()
    }

    #[test]
    fn test_capacity_enforced_at_construction() {
        let result = NativePool::new(
            "test",
            3,
            Some(pinning(0..4, 2, false)),
            Arc::new(StaticTopology::uniform(1, 4)),
        );
        assert!(matches!(
            result,
            Err(PoolError::Config(ConfigError::InsufficientCpus { required: 6, available: 4 }))
        ));
    }

    #[test]
    fn test_acquire_returns_exact_count_in_order() {
        let pool = pinned_pool(2, pinning(0..4, 2, false), StaticTopology::uniform(2, 2));
        let first = pool.acquire_cpus().unwrap();
        assert_eq!(first.slots(), &[(0, 0), (1, 0)]);
        let second = pool.acquire_cpus().unwrap();
        assert_eq!(second.slots(), &[(2, 1), (3, 1)]);
        assert_eq!(second.cpu_list(), "2,3");
        assert_eq!(second.node_list(), "1");
        assert_eq!(pool.free_cpu_count(), 0);
    }

    #[test]
    fn test_unbiased_allocation_spans_nodes() {
        // cpus 1 and 2 live on different nodes
        let pool = pinned_pool(1, pinning([1, 2], 2, false), StaticTopology::uniform(2, 2));
        let lease = pool.acquire_cpus().unwrap();
        assert_eq!(lease.slots(), &[(1, 0), (2, 1)]);
        assert_eq!(lease.node_list(), "0,1");
    }

    #[test]
    fn test_exhaustion_is_reported() {
        let pool = pinned_pool(2, pinning(0..4, 2, false), StaticTopology::uniform(1, 4));
        let _a = pool.acquire_cpus().unwrap();
        let _b = pool.acquire_cpus().unwrap();
        assert!(matches!(
            pool.acquire_cpus(),
            Err(PoolError::Exhausted { requested: 2, free: 0 })
        ));
    }

    #[test]
    fn test_nearest_node_never_splits() {
        // Node 0 owns {0, 1}, node 1 owns {2, 3}; pin {1, 2, 3}
        let pool = pinned_pool(1, pinning([1, 2, 3], 2, true), StaticTopology::uniform(2, 2));
        let lease = pool.acquire_cpus().unwrap();
        assert_eq!(lease.slots(), &[(2, 1), (3, 1)]);
        assert_eq!(pool.free_cpu_count(), 1);

        // Enough free cpus overall, but split one per node
        let split = pinned_pool(1, pinning([1, 2], 2, true), StaticTopology::uniform(2, 2));
        assert!(matches!(
            split.acquire_cpus(),
            Err(PoolError::NoSingleNodeFits { requested: 2 })
        ));
    }

    #[test]
    fn test_unknown_cpu_is_a_configuration_error() {
        let pool = pinned_pool(1, pinning([0, 64], 1, false), StaticTopology::uniform(1, 4));
        assert!(matches!(pool.acquire_cpus(), Err(PoolError::UnknownCpu(64))));
    }

    #[test]
    fn test_release_restores_pool() {
        let pool = pinned_pool(2, pinning(0..4, 2, true), StaticTopology::uniform(2, 2));
        let before = pool.free_cpu_count();
        let a = pool.acquire_cpus().unwrap();
        let b = pool.acquire_cpus().unwrap();
        pool.release_cpus(&a).unwrap();
        pool.release_cpus(&b).unwrap();
        assert_eq!(pool.free_cpu_count(), before);

        // Cpus went back to their own nodes: a node-biased request fits again
        let again = pool.acquire_cpus().unwrap();
        assert_eq!(again.slots(), &[(0, 0), (1, 0)]);
    }

    #[test]
    fn test_double_and_foreign_release_fail() {
        let pool = pinned_pool(1, pinning(0..2, 2, false), StaticTopology::uniform(1, 4));
        let lease = pool.acquire_cpus().unwrap();
        pool.release_cpus(&lease).unwrap();
        assert!(matches!(
            pool.release_cpus(&lease),
            Err(PoolError::CpuDoubleRelease(0))
        ));

        let foreign = CpuLease { slots: vec![(3, 0)] };
        assert!(matches!(pool.release_cpus(&foreign), Err(PoolError::ForeignCpu(3))));
        assert_eq!(pool.free_cpu_count(), 2);
    }

    #[test]
    fn test_concurrent_leases_are_disjoint() {
        let pool = Arc::new(pinned_pool(4, pinning(0..8, 2, false), StaticTopology::uniform(2, 4)));
        let held = Arc::new(Mutex::new(BTreeSet::new()));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let held = Arc::clone(&held);
                thread::spawn(move || {
                    for _ in 0..200 {
                        let lease = pool.acquire_cpus().unwrap();
                        {
                            let mut held = held.lock().unwrap();
                            for cpu in lease.cpu_ids() {
                                assert!(held.insert(cpu), "cpu {} handed out twice", cpu);
                            }
                        }
                        {
                            let mut held = held.lock().unwrap();
                            for cpu in lease.cpu_ids() {
                                held.remove(&cpu);
                            }
                        }
                        pool.release_cpus(&lease).unwrap();
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(pool.free_cpu_count(), 8);
    }

    #[test]
    fn test_unpinned_pool_refuses_cpu_requests() {
        let pool = NativePool::new("test", 2, None, Arc::new(StaticTopology::default())).unwrap();
        assert!(matches!(pool.acquire_cpus(), Err(PoolError::NotPinned(_))));
    }

    #[test]
    fn test_clients_created_lazily_once() {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);
        let pool = ResourcePool::<usize>::new("clients", 2, None, Arc::new(StaticTopology::default()))
            .unwrap()
            .with_clients(move || Ok(counter.fetch_add(1, Ordering::SeqCst)));
        assert_eq!(created.load(Ordering::SeqCst), 0);

        let a = pool.acquire_client().unwrap();
        let b = pool.acquire_client().unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_ne!(*a, *b);
        assert!(matches!(pool.acquire_client(), Err(PoolError::NoFreeClient)));

        pool.release_client(a).unwrap();
        assert_eq!(pool.free_client_count(), 1);
        let c = pool.acquire_client().unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 2);
        pool.release_client(c).unwrap();
        pool.release_client(b).unwrap();
        assert_eq!(pool.free_client_count(), 2);
    }

    #[test]
    fn test_client_double_and_foreign_release_fail() {
        let pool = ResourcePool::<u8>::new("clients", 1, None, Arc::new(StaticTopology::default()))
            .unwrap()
            .with_clients(|| Ok(7));
        let lease = pool.acquire_client().unwrap();
        pool.release_client(lease.clone()).unwrap();
        assert!(matches!(
            pool.release_client(lease),
            Err(PoolError::ClientDoubleRelease(0))
        ));

        let foreign = ClientLease { id: 0, client: Arc::new(7u8) };
        assert!(matches!(pool.release_client(foreign), Err(PoolError::ForeignClient(0))));
    }

    #[test]
    fn test_client_factory_failure_surfaces() {
        let pool = ResourcePool::<u8>::new("clients", 1, None, Arc::new(StaticTopology::default()))
            .unwrap()
            .with_clients(|| Err(anyhow::anyhow!("socket missing")));
        let err = pool.acquire_client().unwrap_err();
        assert!(err.to_string().contains("socket missing"));
    }

    #[test]
    fn test_close_drops_clients_and_refuses_acquisition() {
        let pool = ResourcePool::<u8>::new(
            "clients",
            1,
            Some(pinning(0..1, 1, false)),
            Arc::new(StaticTopology::uniform(1, 1)),
        )
        .unwrap()
        .with_clients(|| Ok(1));
        let lease = pool.acquire_client().unwrap();
        pool.close();
        assert!(matches!(pool.acquire_client(), Err(PoolError::Closed)));
        assert!(matches!(pool.acquire_cpus(), Err(PoolError::Closed)));
        // Late returns from jobs still finishing are tolerated
        pool.release_client(lease).unwrap();
        assert_eq!(pool.free_client_count(), 0);
    }
}
