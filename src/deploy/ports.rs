use std::collections::HashMap;

use tokio::net::TcpListener;
use tokio::sync::Mutex;

use super::DeployKey;

#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("No free port found at or above {lower_port}")]
    Exhausted { lower_port: u16 },
}

/// Hands out one stable host port per deployment key.
///
/// Assignments live for the lifetime of the process and are never removed:
/// a branch keeps its port across redeploys even while no container is
/// bound to it.
#[derive(Debug, Default)]
pub struct PortAllocator {
    assignments: Mutex<HashMap<DeployKey, u16>>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the port assigned to `key`, probing the OS for the first
    /// free TCP port at or above `lower_port` on first resolution.
    ///
    /// The table lock is held across the probe, so two first-time
    /// resolutions never race for the same port and a second concurrent
    /// call for the same key waits and reuses the first result.
    pub async fn resolve(&self, key: &DeployKey, lower_port: u16) -> Result<u16, PortError> {
        let mut assignments = self.assignments.lock().await;
        if let Some(&port) = assignments.get(key) {
            return Ok(port);
        }

        let mut port = lower_port;
        loop {
            // A port assigned to another key stays reserved for that key
            // even if its container has exited in the meantime.
            let taken = assignments.values().any(|&assigned| assigned == port);
            if !taken && TcpListener::bind(("0.0.0.0", port)).await.is_ok() {
                assignments.insert(key.clone(), port);
                return Ok(port);
            }
            port = port
                .checked_add(1)
                .ok_or(PortError::Exhausted { lower_port })?;
        }
    }

    /// Snapshot of every key-to-port assignment.
    pub async fn snapshot(&self) -> Vec<(DeployKey, u16)> {
        self.assignments
            .lock()
            .await
            .iter()
            .map(|(key, &port)| (key.clone(), port))
            .collect()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::quiet_base;
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_distinct_keys_get_distinct_ports() {
        let base = quiet_base(49090, 2).await;
        let allocator = PortAllocator::new();
        let main = DeployKey::new("r", "main");
        let feature = DeployKey::new("r", "feature");

        let p1 = allocator.resolve(&main, base).await.unwrap();
        let p2 = allocator.resolve(&feature, base).await.unwrap();
        assert_eq!(p1, base);
        assert_eq!(p2, base + 1);
    }

    #[tokio::test]
    async fn test_resolution_is_stable_per_key() {
        let base = quiet_base(49110, 1).await;
        let allocator = PortAllocator::new();
        let key = DeployKey::new("r", "main");

        let first = allocator.resolve(&key, base).await.unwrap();
        // Occupy the port; a repeat resolution must not probe again.
        let _listener = TcpListener::bind(("0.0.0.0", first)).await.unwrap();
        let second = allocator.resolve(&key, base).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_occupied_port_is_skipped() {
        let base = quiet_base(49130, 2).await;
        let allocator = PortAllocator::new();
        let _listener = TcpListener::bind(("0.0.0.0", base)).await.unwrap();

        let port = allocator
            .resolve(&DeployKey::new("r", "main"), base)
            .await
            .unwrap();
        assert_eq!(port, base + 1);
    }

    #[tokio::test]
    async fn test_concurrent_resolution_same_key_single_assignment() {
        let base = quiet_base(49150, 1).await;
        let allocator = Arc::new(PortAllocator::new());
        let key = DeployKey::new("r", "main");

        let a = tokio::spawn({
            let allocator = Arc::clone(&allocator);
            let key = key.clone();
            async move { allocator.resolve(&key, base).await.unwrap() }
        });
        let b = tokio::spawn({
            let allocator = Arc::clone(&allocator);
            let key = key.clone();
            async move { allocator.resolve(&key, base).await.unwrap() }
        });

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert_eq!(a, b);
        assert_eq!(allocator.snapshot().await.len(), 1);
    }
}
