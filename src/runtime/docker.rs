use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    NetworkingConfig, RemoveContainerOptions, RenameContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::image::{CreateImageOptions, RemoveImageOptions};
use bollard::models::{
    ContainerInspectResponse, EndpointSettings, HostConfig, Mount, MountTypeEnum, PortBinding,
    RestartPolicy, RestartPolicyNameEnum,
};
use bollard::Docker;
use futures_util::stream::StreamExt;
use log::{debug, warn};

use super::{ContainerRuntime, RunState};
use crate::error::Error;
use crate::snapshot::{
    env_to_map, map_to_env, ConfigDescriptor, EndpointSpec, MountKind, MountSpec,
    PortBindingSpec, RestartPolicyKind, RestartPolicySpec,
};
use crate::types::{ContainerRecord, ImageReference};

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon using default settings.
    /// This handles the unix socket on Linux.
    pub fn connect() -> Result<Self, Error> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::DaemonUnreachable(e.to_string()))?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerRecord>, Error> {
        let opts = ListContainersOptions::<String> {
            all,
            ..Default::default()
        };
        let summaries = self
            .docker
            .list_containers(Some(opts))
            .await
            .map_err(|e| Error::DaemonUnreachable(e.to_string()))?;

        let mut records = Vec::with_capacity(summaries.len());
        for c in summaries {
            let id = match c.id {
                Some(id) => id,
                None => continue,
            };
            let name = c
                .names
                .as_ref()
                .and_then(|n| n.first())
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_else(|| id.clone());
            records.push(ContainerRecord {
                id,
                name,
                image: c.image.unwrap_or_default(),
                image_id: c.image_id.unwrap_or_default(),
                labels: c.labels.unwrap_or_default(),
                running: c.state.as_deref() == Some("running"),
            });
        }
        Ok(records)
    }

    async fn snapshot(&self, id: &str) -> Result<ConfigDescriptor, Error> {
        let inspect = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| Error::Inspect(e.to_string()))?;
        descriptor_from_inspect(&inspect)
    }

    async fn pull_image(&self, reference: &ImageReference) -> Result<String, Error> {
        let floating = reference.floating();
        let opts = CreateImageOptions {
            from_image: reference.repository.clone(),
            tag: reference.tag.clone().unwrap_or_else(|| "latest".into()),
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(opts), None, None);
        while let Some(progress) = stream.next().await {
            match progress {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!("pull {}: {}", floating, status);
                    }
                }
                Err(e) => {
                    return Err(Error::Pull {
                        reference: floating,
                        message: e.to_string(),
                    })
                }
            }
        }

        // The digest the tag now points to locally.
        let image = self
            .docker
            .inspect_image(&floating)
            .await
            .map_err(|e| Error::Pull {
                reference: floating.clone(),
                message: e.to_string(),
            })?;
        image.id.ok_or_else(|| Error::Pull {
            reference: floating,
            message: "daemon returned image without id".into(),
        })
    }

    async fn create_container(
        &self,
        name: &str,
        image: &str,
        descriptor: &ConfigDescriptor,
    ) -> Result<String, Error> {
        let opts = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };
        let config = create_config(descriptor, image);
        let created = self
            .docker
            .create_container(Some(opts), config)
            .await
            .map_err(|e| Error::Replacement(format!("create {}: {}", name, e)))?;
        for w in &created.warnings {
            warn!("create {}: {}", name, w);
        }
        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), Error> {
        match self
            .docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            // 304: already running.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(Error::Replacement(format!("start {}: {}", id, e))),
        }
    }

    async fn stop_container(&self, id: &str, timeout_secs: i64) -> Result<(), Error> {
        match self
            .docker
            .stop_container(id, Some(StopContainerOptions { t: timeout_secs }))
            .await
        {
            Ok(()) => Ok(()),
            // 304: already stopped.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(Error::Replacement(format!("stop {}: {}", id, e))),
        }
    }

    async fn rename_container(&self, id: &str, new_name: &str) -> Result<(), Error> {
        self.docker
            .rename_container(
                id,
                RenameContainerOptions {
                    name: new_name.to_string(),
                },
            )
            .await
            .map_err(|e| Error::Replacement(format!("rename {} -> {}: {}", id, new_name, e)))
    }

    async fn remove_container(&self, id: &str) -> Result<(), Error> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| Error::Replacement(format!("remove {}: {}", id, e)))
    }

    async fn container_state(&self, id: &str) -> Result<RunState, Error> {
        let inspect = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| Error::Inspect(e.to_string()))?;
        let state = inspect.state.unwrap_or_default();
        Ok(RunState {
            running: state.running.unwrap_or(false),
            exit_code: state.exit_code,
        })
    }

    async fn remove_image(&self, digest: &str) -> Result<(), Error> {
        self.docker
            .remove_image(
                digest,
                Some(RemoveImageOptions {
                    force: false,
                    noprune: false,
                }),
                None,
            )
            .await
            .map(|_| ())
            .map_err(|e| Error::Cleanup(format!("remove image {}: {}", digest, e)))
    }
}

/// HostConfig fields the descriptor does not model. A non-empty value in any
/// of these makes the snapshot fail closed: rejecting the update is better
/// than recreating the container without them.
fn check_unrepresented(host: &HostConfig) -> Result<(), Error> {
    fn reject<T>(field: &Option<Vec<T>>, name: &str) -> Result<(), Error> {
        match field {
            Some(v) if !v.is_empty() => Err(Error::Snapshot(format!(
                "unsupported host configuration: {}",
                name
            ))),
            _ => Ok(()),
        }
    }
    fn reject_map<V>(field: &Option<HashMap<String, V>>, name: &str) -> Result<(), Error> {
        match field {
            Some(m) if !m.is_empty() => Err(Error::Snapshot(format!(
                "unsupported host configuration: {}",
                name
            ))),
            _ => Ok(()),
        }
    }

    reject(&host.devices, "devices")?;
    reject(&host.device_requests, "device_requests")?;
    reject(&host.ulimits, "ulimits")?;
    reject(&host.links, "links")?;
    reject(&host.volumes_from, "volumes_from")?;
    reject(&host.group_add, "group_add")?;
    reject(&host.security_opt, "security_opt")?;
    reject_map(&host.sysctls, "sysctls")?;
    reject_map(&host.storage_opt, "storage_opt")?;
    reject_map(&host.tmpfs, "tmpfs")?;
    Ok(())
}

/// Build a closed descriptor from the daemon's sprawling inspect response.
pub fn descriptor_from_inspect(
    inspect: &ContainerInspectResponse,
) -> Result<ConfigDescriptor, Error> {
    let name = inspect
        .name
        .as_deref()
        .map(|n| n.trim_start_matches('/').to_string())
        .ok_or_else(|| Error::Inspect("container has no name".into()))?;
    let short_id: String = inspect.id.as_deref().unwrap_or("").chars().take(12).collect();

    let config = inspect.config.clone().unwrap_or_default();
    let host = inspect.host_config.clone().unwrap_or_default();
    check_unrepresented(&host)?;

    // The hostname defaults to the container id; carrying that over would
    // pin a stale identity, so only an operator-set hostname survives.
    let hostname = config
        .hostname
        .filter(|h| !h.is_empty() && *h != short_id);

    let mut mounts = Vec::new();
    for m in host.mounts.iter().flatten() {
        mounts.push(mount_spec(m)?);
    }

    let mut port_bindings = std::collections::BTreeMap::new();
    for (port, bindings) in host.port_bindings.iter().flatten() {
        let specs = bindings
            .iter()
            .flatten()
            .map(|b| PortBindingSpec {
                host_ip: b.host_ip.clone().filter(|s| !s.is_empty()),
                host_port: b.host_port.clone().filter(|s| !s.is_empty()),
            })
            .collect();
        port_bindings.insert(port.clone(), specs);
    }

    let restart_policy = match host.restart_policy {
        Some(RestartPolicy {
            name: Some(kind),
            maximum_retry_count,
        }) => restart_kind(kind).map(|kind| RestartPolicySpec {
            kind,
            maximum_retry_count: maximum_retry_count.unwrap_or(0),
        }),
        _ => None,
    };

    let network_mode = host
        .network_mode
        .filter(|m| !m.is_empty() && m != "default");

    // Endpoint settings only replay on user-defined networks; host/none and
    // container-mode networking carry no per-network configuration.
    let replay_endpoints = !matches!(
        network_mode.as_deref(),
        Some("host") | Some("none")
    ) && !network_mode
        .as_deref()
        .map(|m| m.starts_with("container:"))
        .unwrap_or(false);

    let mut networks = std::collections::BTreeMap::new();
    if replay_endpoints {
        let attached = inspect
            .network_settings
            .as_ref()
            .and_then(|s| s.networks.as_ref());
        for (net, endpoint) in attached.into_iter().flatten() {
            // Docker injects the short container id as an alias; it belongs
            // to the old container and must not be replayed.
            let aliases = endpoint
                .aliases
                .clone()
                .unwrap_or_default()
                .into_iter()
                .filter(|a| *a != short_id)
                .collect();
            let (ipv4_address, ipv6_address) = endpoint
                .ipam_config
                .as_ref()
                .map(|ipam| {
                    (
                        ipam.ipv4_address.clone().filter(|s| !s.is_empty()),
                        ipam.ipv6_address.clone().filter(|s| !s.is_empty()),
                    )
                })
                .unwrap_or((None, None));
            networks.insert(
                net.clone(),
                EndpointSpec {
                    aliases,
                    ipv4_address,
                    ipv6_address,
                },
            );
        }
    }

    Ok(ConfigDescriptor {
        name,
        hostname,
        user: config.user.filter(|u| !u.is_empty()),
        working_dir: config.working_dir.filter(|w| !w.is_empty()),
        env: env_to_map(&config.env.unwrap_or_default()),
        cmd: config.cmd,
        entrypoint: config.entrypoint,
        labels: config.labels.unwrap_or_default().into_iter().collect(),
        exposed_ports: config
            .exposed_ports
            .unwrap_or_default()
            .into_keys()
            .collect(),
        port_bindings,
        binds: host.binds.unwrap_or_default(),
        mounts,
        network_mode,
        networks,
        restart_policy,
        privileged: host.privileged.unwrap_or(false),
        cap_add: host.cap_add.unwrap_or_default(),
        cap_drop: host.cap_drop.unwrap_or_default(),
        memory: host.memory.filter(|m| *m > 0),
        nano_cpus: host.nano_cpus.filter(|n| *n > 0),
        extra_hosts: host.extra_hosts.unwrap_or_default(),
        dns: host.dns.unwrap_or_default(),
        init: host.init,
        stop_signal: config.stop_signal.filter(|s| !s.is_empty()),
    })
}

fn mount_spec(m: &Mount) -> Result<MountSpec, Error> {
    let kind = match m.typ {
        Some(MountTypeEnum::BIND) => MountKind::Bind,
        Some(MountTypeEnum::VOLUME) => MountKind::Volume,
        Some(MountTypeEnum::TMPFS) => MountKind::Tmpfs,
        other => {
            return Err(Error::Snapshot(format!(
                "unsupported mount type: {:?}",
                other
            )))
        }
    };
    if m.bind_options
        .as_ref()
        .map(|b| b.propagation.is_some())
        .unwrap_or(false)
    {
        return Err(Error::Snapshot("bind mount propagation".into()));
    }
    if m.volume_options
        .as_ref()
        .map(|v| v.driver_config.is_some())
        .unwrap_or(false)
    {
        return Err(Error::Snapshot("volume driver configuration".into()));
    }
    let target = m
        .target
        .clone()
        .ok_or_else(|| Error::Snapshot("mount without target".into()))?;
    Ok(MountSpec {
        source: m.source.clone().filter(|s| !s.is_empty()),
        target,
        kind,
        read_only: m.read_only.unwrap_or(false),
    })
}

fn restart_kind(name: RestartPolicyNameEnum) -> Option<RestartPolicyKind> {
    match name {
        RestartPolicyNameEnum::EMPTY => None,
        RestartPolicyNameEnum::NO => Some(RestartPolicyKind::No),
        RestartPolicyNameEnum::ALWAYS => Some(RestartPolicyKind::Always),
        RestartPolicyNameEnum::UNLESS_STOPPED => Some(RestartPolicyKind::UnlessStopped),
        RestartPolicyNameEnum::ON_FAILURE => Some(RestartPolicyKind::OnFailure),
    }
}

fn restart_name(kind: RestartPolicyKind) -> RestartPolicyNameEnum {
    match kind {
        RestartPolicyKind::No => RestartPolicyNameEnum::NO,
        RestartPolicyKind::Always => RestartPolicyNameEnum::ALWAYS,
        RestartPolicyKind::UnlessStopped => RestartPolicyNameEnum::UNLESS_STOPPED,
        RestartPolicyKind::OnFailure => RestartPolicyNameEnum::ON_FAILURE,
    }
}

/// Replay a descriptor into the create-container request body, with the
/// image reference substituted.
pub fn create_config(descriptor: &ConfigDescriptor, image: &str) -> Config<String> {
    let mounts: Vec<Mount> = descriptor
        .mounts
        .iter()
        .map(|m| Mount {
            target: Some(m.target.clone()),
            source: m.source.clone(),
            typ: Some(match m.kind {
                MountKind::Bind => MountTypeEnum::BIND,
                MountKind::Volume => MountTypeEnum::VOLUME,
                MountKind::Tmpfs => MountTypeEnum::TMPFS,
            }),
            read_only: Some(m.read_only),
            ..Default::default()
        })
        .collect();

    let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = descriptor
        .port_bindings
        .iter()
        .map(|(port, specs)| {
            (
                port.clone(),
                Some(
                    specs
                        .iter()
                        .map(|s| PortBinding {
                            host_ip: s.host_ip.clone(),
                            host_port: s.host_port.clone(),
                        })
                        .collect(),
                ),
            )
        })
        .collect();

    let host_config = HostConfig {
        binds: (!descriptor.binds.is_empty()).then(|| descriptor.binds.clone()),
        mounts: (!mounts.is_empty()).then_some(mounts),
        port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
        network_mode: descriptor.network_mode.clone(),
        restart_policy: descriptor.restart_policy.as_ref().map(|p| RestartPolicy {
            name: Some(restart_name(p.kind)),
            maximum_retry_count: Some(p.maximum_retry_count),
        }),
        privileged: Some(descriptor.privileged),
        cap_add: (!descriptor.cap_add.is_empty()).then(|| descriptor.cap_add.clone()),
        cap_drop: (!descriptor.cap_drop.is_empty()).then(|| descriptor.cap_drop.clone()),
        memory: descriptor.memory,
        nano_cpus: descriptor.nano_cpus,
        extra_hosts: (!descriptor.extra_hosts.is_empty()).then(|| descriptor.extra_hosts.clone()),
        dns: (!descriptor.dns.is_empty()).then(|| descriptor.dns.clone()),
        init: descriptor.init,
        ..Default::default()
    };

    let networking_config = (!descriptor.networks.is_empty()).then(|| NetworkingConfig {
        endpoints_config: descriptor
            .networks
            .iter()
            .map(|(net, spec)| {
                let ipam = (spec.ipv4_address.is_some() || spec.ipv6_address.is_some()).then(
                    || bollard::models::EndpointIpamConfig {
                        ipv4_address: spec.ipv4_address.clone(),
                        ipv6_address: spec.ipv6_address.clone(),
                        ..Default::default()
                    },
                );
                (
                    net.clone(),
                    EndpointSettings {
                        aliases: (!spec.aliases.is_empty()).then(|| spec.aliases.clone()),
                        ipam_config: ipam,
                        ..Default::default()
                    },
                )
            })
            .collect(),
    });

    Config {
        hostname: descriptor.hostname.clone(),
        user: descriptor.user.clone(),
        env: Some(map_to_env(&descriptor.env)),
        cmd: descriptor.cmd.clone(),
        entrypoint: descriptor.entrypoint.clone(),
        image: Some(image.to_string()),
        working_dir: descriptor.working_dir.clone(),
        labels: Some(descriptor.labels.clone().into_iter().collect()),
        exposed_ports: (!descriptor.exposed_ports.is_empty()).then(|| {
            descriptor
                .exposed_ports
                .iter()
                .map(|p| (p.clone(), HashMap::new()))
                .collect()
        }),
        stop_signal: descriptor.stop_signal.clone(),
        host_config: Some(host_config),
        networking_config,
        ..Default::default()
    }
}
