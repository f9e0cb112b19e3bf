//! In-memory [`ContainerRuntime`] used by the engine tests. Mutations go
//! through the same trait surface the bollard implementation exposes, so
//! the reconciler state machine is exercised end to end without a daemon.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{ContainerRuntime, RunState};
use crate::error::Error;
use crate::snapshot::ConfigDescriptor;
use crate::types::{ContainerRecord, ImageReference};

#[derive(Debug, Clone)]
pub struct MockContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub image_id: String,
    pub labels: HashMap<String, String>,
    pub running: bool,
    pub exit_code: Option<i64>,
    pub descriptor: ConfigDescriptor,
}

#[derive(Default)]
struct MockState {
    containers: Vec<MockContainer>,
    /// Registry view: floating reference -> digest a pull resolves to.
    registry: HashMap<String, String>,
    pulls: Vec<String>,
    removed_images: Vec<String>,
    fail_pull: HashSet<String>,
    /// Containers (by name) whose start call returns an error.
    fail_start: HashSet<String>,
    /// Containers (by name) that start but exit immediately.
    exit_on_start: HashSet<String>,
    /// Containers (by id) that vanish between listing and snapshot.
    vanish_on_snapshot: HashSet<String>,
    /// Containers (by name) whose remove call never completes.
    hang_remove: HashSet<String>,
    fail_list: bool,
    next_id: u64,
}

#[derive(Default)]
pub struct MockRuntime {
    state: Mutex<MockState>,
    /// When set, `list_containers` blocks until notified. Used to hold a
    /// cycle open while another trigger fires.
    pub list_gate: Mutex<Option<Arc<Notify>>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_container(
        &self,
        name: &str,
        image: &str,
        image_id: &str,
        labels: HashMap<String, String>,
        running: bool,
    ) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("{:016x}{:048x}", state.next_id, state.next_id);
        state.containers.push(MockContainer {
            id: id.clone(),
            name: name.to_string(),
            image: image.to_string(),
            image_id: image_id.to_string(),
            labels: labels.clone(),
            running,
            exit_code: None,
            descriptor: ConfigDescriptor {
                name: name.to_string(),
                labels: labels.into_iter().collect(),
                ..Default::default()
            },
        });
        id
    }

    /// Point a floating reference at the digest a pull will resolve to.
    pub fn set_registry(&self, floating: &str, digest: &str) {
        self.state
            .lock()
            .unwrap()
            .registry
            .insert(floating.to_string(), digest.to_string());
    }

    pub fn fail_pull(&self, floating: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_pull
            .insert(floating.to_string());
    }

    pub fn fail_start(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_start
            .insert(name.to_string());
    }

    pub fn exit_on_start(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .exit_on_start
            .insert(name.to_string());
    }

    pub fn vanish_on_snapshot(&self, id: &str) {
        self.state
            .lock()
            .unwrap()
            .vanish_on_snapshot
            .insert(id.to_string());
    }

    pub fn hang_remove(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .hang_remove
            .insert(name.to_string());
    }

    pub fn fail_list(&self) {
        self.state.lock().unwrap().fail_list = true;
    }

    pub fn container(&self, name: &str) -> Option<MockContainer> {
        self.state
            .lock()
            .unwrap()
            .containers
            .iter()
            .find(|c| c.name == name)
            .cloned()
    }

    pub fn container_count(&self) -> usize {
        self.state.lock().unwrap().containers.len()
    }

    pub fn pulls(&self) -> Vec<String> {
        self.state.lock().unwrap().pulls.clone()
    }

    pub fn removed_images(&self) -> Vec<String> {
        self.state.lock().unwrap().removed_images.clone()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerRecord>, Error> {
        let gate = self.list_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let state = self.state.lock().unwrap();
        if state.fail_list {
            return Err(Error::DaemonUnreachable("connection refused".into()));
        }
        Ok(state
            .containers
            .iter()
            .filter(|c| all || c.running)
            .map(|c| ContainerRecord {
                id: c.id.clone(),
                name: c.name.clone(),
                image: c.image.clone(),
                image_id: c.image_id.clone(),
                labels: c.labels.clone(),
                running: c.running,
            })
            .collect())
    }

    async fn snapshot(&self, id: &str) -> Result<ConfigDescriptor, Error> {
        let mut state = self.state.lock().unwrap();
        if state.vanish_on_snapshot.remove(id) {
            state.containers.retain(|c| c.id != id);
            return Err(Error::Inspect(format!("no such container: {}", id)));
        }
        state
            .containers
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.descriptor.clone())
            .ok_or_else(|| Error::Inspect(format!("no such container: {}", id)))
    }

    async fn pull_image(&self, reference: &ImageReference) -> Result<String, Error> {
        let floating = reference.floating();
        let mut state = self.state.lock().unwrap();
        if state.fail_pull.contains(&floating) {
            return Err(Error::Pull {
                reference: floating,
                message: "registry unavailable".into(),
            });
        }
        let digest = state.registry.get(&floating).cloned().ok_or_else(|| Error::Pull {
            reference: floating.clone(),
            message: "manifest unknown".into(),
        })?;
        state.pulls.push(floating);
        Ok(digest)
    }

    async fn create_container(
        &self,
        name: &str,
        image: &str,
        descriptor: &ConfigDescriptor,
    ) -> Result<String, Error> {
        let mut state = self.state.lock().unwrap();
        if state.containers.iter().any(|c| c.name == name) {
            return Err(Error::Replacement(format!("name {} already in use", name)));
        }
        let image_id = state
            .registry
            .get(&ImageReference::parse(image).floating())
            .cloned()
            .unwrap_or_else(|| format!("sha256:unresolved-{}", image));
        state.next_id += 1;
        let id = format!("{:016x}{:048x}", state.next_id, state.next_id);
        state.containers.push(MockContainer {
            id: id.clone(),
            name: name.to_string(),
            image: image.to_string(),
            image_id,
            labels: descriptor.labels.clone().into_iter().collect(),
            running: false,
            exit_code: None,
            descriptor: descriptor.clone(),
        });
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let fail_start = state.fail_start.clone();
        let exit_on_start = state.exit_on_start.clone();
        let c = state
            .containers
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| Error::Replacement(format!("no such container: {}", id)))?;
        if fail_start.contains(&c.name) {
            return Err(Error::Replacement(format!("cannot start {}", c.name)));
        }
        if exit_on_start.contains(&c.name) {
            c.running = false;
            c.exit_code = Some(1);
        } else {
            c.running = true;
            c.exit_code = None;
        }
        Ok(())
    }

    async fn stop_container(&self, id: &str, _timeout_secs: i64) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let c = state
            .containers
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| Error::Replacement(format!("no such container: {}", id)))?;
        c.running = false;
        c.exit_code = Some(0);
        Ok(())
    }

    async fn rename_container(&self, id: &str, new_name: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if state.containers.iter().any(|c| c.name == new_name && c.id != id) {
            return Err(Error::Replacement(format!(
                "name {} already in use",
                new_name
            )));
        }
        let c = state
            .containers
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| Error::Replacement(format!("no such container: {}", id)))?;
        c.name = new_name.to_string();
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), Error> {
        let hang = {
            let state = self.state.lock().unwrap();
            state
                .containers
                .iter()
                .any(|c| c.id == id && state.hang_remove.contains(&c.name))
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let mut state = self.state.lock().unwrap();
        let before = state.containers.len();
        state.containers.retain(|c| c.id != id);
        if state.containers.len() == before {
            return Err(Error::Replacement(format!("no such container: {}", id)));
        }
        Ok(())
    }

    async fn container_state(&self, id: &str) -> Result<RunState, Error> {
        let state = self.state.lock().unwrap();
        state
            .containers
            .iter()
            .find(|c| c.id == id)
            .map(|c| RunState {
                running: c.running,
                exit_code: c.exit_code,
            })
            .ok_or_else(|| Error::Inspect(format!("no such container: {}", id)))
    }

    async fn remove_image(&self, digest: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if state.containers.iter().any(|c| c.image_id == digest) {
            return Err(Error::Cleanup(format!("image {} is in use", digest)));
        }
        state.removed_images.push(digest.to_string());
        Ok(())
    }
}
