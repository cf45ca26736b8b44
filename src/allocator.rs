//! Server allocation for new placements.

use std::collections::HashSet;
use std::sync::Arc;

use rand::seq::SliceRandom;

use crate::directory::{ConfigDirectory, ServerStatus};
use crate::error::{Error, Result};

/// How strictly an allocation request must be satisfied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocationPolicy {
    /// Fail unless the full requested count can be allocated.
    MustAllocate,
    /// Return as many healthy servers as exist, possibly fewer than asked.
    BestEffort,
}

/// Picks replica servers for new partitions and split children.
///
/// Candidates are the directory's `Up` servers minus the exclude set,
/// shuffled so that repeated allocations spread placements across the
/// cluster instead of piling onto the lexicographically first servers.
pub struct ServerAllocator {
    directory: Arc<dyn ConfigDirectory>,
}

impl ServerAllocator {
    pub fn new(directory: Arc<dyn ConfigDirectory>) -> Self {
        Self { directory }
    }

    pub fn allocate(
        &self,
        policy: AllocationPolicy,
        count: usize,
        exclude: &HashSet<String>,
    ) -> Result<Vec<String>> {
        let mut candidates: Vec<String> = self
            .directory
            .list_servers()?
            .into_iter()
            .filter(|s| s.status == ServerStatus::Up && !exclude.contains(&s.server_id))
            .map(|s| s.server_id)
            .collect();

        if policy == AllocationPolicy::MustAllocate && candidates.len() < count {
            return Err(Error::Runtime(format!(
                "not enough healthy servers: need {count}, have {}",
                candidates.len()
            )));
        }

        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(count);
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{ClusterConfig, MemoryDirectory, ServerConfig};

    fn directory_with_servers(up: usize, down: usize) -> Arc<MemoryDirectory> {
        let dir = Arc::new(MemoryDirectory::new("local", ClusterConfig::default()));
        for i in 0..up {
            dir.put_server(ServerConfig {
                server_id: format!("up{i}"),
                addr: format!("127.0.0.1:{}", 7000 + i),
                status: ServerStatus::Up,
            });
        }
        for i in 0..down {
            dir.put_server(ServerConfig {
                server_id: format!("down{i}"),
                addr: String::new(),
                status: ServerStatus::Down,
            });
        }
        dir
    }

    #[test]
    fn test_allocates_requested_count() {
        let allocator = ServerAllocator::new(directory_with_servers(5, 2));
        let servers = allocator
            .allocate(AllocationPolicy::MustAllocate, 3, &HashSet::new())
            .unwrap();
        assert_eq!(servers.len(), 3);
        assert!(servers.iter().all(|s| s.starts_with("up")));
    }

    #[test]
    fn test_must_allocate_fails_when_short() {
        let allocator = ServerAllocator::new(directory_with_servers(2, 3));
        let result = allocator.allocate(AllocationPolicy::MustAllocate, 3, &HashSet::new());
        assert!(matches!(result, Err(Error::Runtime(_))));
    }

    #[test]
    fn test_best_effort_returns_what_exists() {
        let allocator = ServerAllocator::new(directory_with_servers(2, 0));
        let servers = allocator
            .allocate(AllocationPolicy::BestEffort, 5, &HashSet::new())
            .unwrap();
        assert_eq!(servers.len(), 2);
    }

    #[test]
    fn test_exclude_set_is_honored() {
        let allocator = ServerAllocator::new(directory_with_servers(4, 0));
        let exclude: HashSet<String> = ["up0".to_string(), "up1".to_string()].into();
        let servers = allocator
            .allocate(AllocationPolicy::MustAllocate, 2, &exclude)
            .unwrap();
        assert_eq!(servers.len(), 2);
        assert!(servers.iter().all(|s| !exclude.contains(s)));
    }
}
