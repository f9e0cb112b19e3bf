use async_trait::async_trait;

use crate::error::Error;
use crate::snapshot::ConfigDescriptor;
use crate::types::{ContainerRecord, ImageReference};

pub mod docker;
pub use docker::DockerRuntime;

#[cfg(test)]
pub mod mock;

/// Probed state of a single container, used during replacement verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunState {
    pub running: bool,
    pub exit_code: Option<i64>,
}

/// The daemon seam. Everything above this trait speaks domain types only;
/// the bollard implementation lives in [`docker`], the in-memory one used
/// by tests in [`mock`].
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// List containers, running only or all (stopped included).
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerRecord>, Error>;

    /// Capture the full creation configuration of a container.
    /// Fails with [`Error::Inspect`] if the container vanished, or with
    /// [`Error::Snapshot`] if its configuration cannot be fully represented.
    async fn snapshot(&self, id: &str) -> Result<ConfigDescriptor, Error>;

    /// Pull the floating form of a reference and return the digest/id the
    /// daemon resolved it to.
    async fn pull_image(&self, reference: &ImageReference) -> Result<String, Error>;

    /// Create (without starting) a container from a descriptor with the
    /// given name and image reference substituted. Returns the new id.
    async fn create_container(
        &self,
        name: &str,
        image: &str,
        descriptor: &ConfigDescriptor,
    ) -> Result<String, Error>;

    async fn start_container(&self, id: &str) -> Result<(), Error>;
    async fn stop_container(&self, id: &str, timeout_secs: i64) -> Result<(), Error>;
    async fn rename_container(&self, id: &str, new_name: &str) -> Result<(), Error>;
    async fn remove_container(&self, id: &str) -> Result<(), Error>;

    async fn container_state(&self, id: &str) -> Result<RunState, Error>;

    /// Remove an image by digest/id. The caller is responsible for checking
    /// that nothing references it any more.
    async fn remove_image(&self, digest: &str) -> Result<(), Error>;
}
