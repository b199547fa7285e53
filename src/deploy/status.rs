use bollard::query_parameters::{InspectContainerOptions, InspectContainerOptionsBuilder};
use serde::Serialize;

use crate::docker::get_docker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Running,
    Exited(i64),
    Missing,
}

/// Query the live state of a container by name.
/// A 404 from the daemon maps to `Missing`.
pub async fn container_state(
    container_name: &str,
) -> Result<ContainerState, bollard::errors::Error> {
    let docker = get_docker();

    let options: InspectContainerOptions = InspectContainerOptionsBuilder::new().build();

    match docker
        .inspect_container(container_name, Some(options))
        .await
    {
        Ok(info) => {
            if let Some(state) = info.state {
                if state.running.unwrap_or(false) {
                    return Ok(ContainerState::Running);
                }
                return Ok(ContainerState::Exited(state.exit_code.unwrap_or(-1)));
            }
            Ok(ContainerState::Missing)
        }
        Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        }) => Ok(ContainerState::Missing),
        Err(e) => Err(e),
    }
}
