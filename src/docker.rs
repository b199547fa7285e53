//! Shared Docker client using bollard.

use bollard::Docker;
use std::sync::OnceLock;

static DOCKER_CLIENT: OnceLock<Docker> = OnceLock::new();

/// Shared Docker client, connected lazily on first use over the local
/// socket.
pub fn get_docker() -> &'static Docker {
    DOCKER_CLIENT.get_or_init(|| {
        Docker::connect_with_local_defaults().expect("Failed to connect to Docker daemon")
    })
}
