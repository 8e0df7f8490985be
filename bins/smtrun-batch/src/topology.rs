use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// NUMA node id → every CPU id the node owns
pub type NodeMap = BTreeMap<u32, Vec<u32>>;

/// Source of the host's CPU/NUMA layout
///
/// The pool only asks once, on the first CPU acquisition.
pub trait TopologyProbe: Send + Sync {
    fn discover(&self) -> io::Result<NodeMap>;
}

/// Reads the layout exposed by the kernel under `/sys/devices/system`
#[derive(Debug, Clone)]
pub struct SysfsTopology {
    root: PathBuf,
}

impl SysfsTopology {
    pub fn new() -> Self {
        Self::with_root("/sys/devices/system")
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for SysfsTopology {
    fn default() -> Self {
        Self::new()
    }
}

impl TopologyProbe for SysfsTopology {
    fn discover(&self) -> io::Result<NodeMap> {
        let mut nodes = NodeMap::new();

        let node_dir = self.root.join("node");
        if let Ok(entries) = fs::read_dir(&node_dir) {
            for entry in entries {
                let entry = entry?;
                let name = entry.file_name();
                let Some(id) = name
                    .to_str()
                    .and_then(|n| n.strip_prefix("node"))
                    .and_then(|n| n.parse::<u32>().ok())
                else {
                    continue;
                };
                let cpus = read_cpu_list(&entry.path().join("cpulist"))?;
                nodes.insert(id, cpus);
            }
        }

        // Kernels built without NUMA support expose no node directories
        if nodes.is_empty() {
            let cpus = read_cpu_list(&self.root.join("cpu").join("online"))?;
            nodes.insert(0, cpus);
        }

        Ok(nodes)
    }
}

/// Fixed layout, for hosts where sysfs is not authoritative and for tests
#[derive(Debug, Clone, Default)]
pub struct StaticTopology {
    nodes: NodeMap,
}

impl StaticTopology {
    pub fn new(nodes: NodeMap) -> Self {
        Self { nodes }
    }

    /// `nodes` equally sized nodes with consecutive CPU ids
    pub fn uniform(nodes: u32, cpus_per_node: u32) -> Self {
        let map = (0..nodes)
            .map(|node| {
                let first = node * cpus_per_node;
                (node, (first..first + cpus_per_node).collect())
            })
            .collect();
        Self::new(map)
    }
}

impl TopologyProbe for StaticTopology {
    fn discover(&self) -> io::Result<NodeMap> {
        Ok(self.nodes.clone())
    }
}

fn read_cpu_list(path: &Path) -> io::Result<Vec<u32>> {
    let raw = fs::read_to_string(path)?;
    parse_cpu_list(&raw).map_err(|reason| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{}: {}", path.display(), reason),
        )
    })
}

/// Parse the kernel's cpu list format, e.g. `0-3,8,10-11`
pub fn parse_cpu_list(raw: &str) -> Result<Vec<u32>, String> {
    let mut cpus = Vec::new();
    for part in raw.trim().split(',').filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: u32 = lo.parse().map_err(|_| format!("bad range start in \"{}\"", part))?;
                let hi: u32 = hi.parse().map_err(|_| format!("bad range end in \"{}\"", part))?;
                if lo > hi {
                    return Err(format!("descending range \"{}\"", part));
                }
                cpus.extend(lo..=hi);
            }
            None => cpus.push(part.parse().map_err(|_| format!("bad cpu id \"{}\"", part))?),
        }
    }
    cpus.sort_unstable();
    cpus.dedup();
    Ok(cpus)
}
