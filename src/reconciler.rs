//! The reconciliation engine.
//!
//! One cycle lists the daemon's running containers, filters excluded ones,
//! asks the resolver whether each remaining container's image is stale, and
//! replaces stale containers while preserving their full configuration.
//! Per-container failures never abort a cycle; every container contributes
//! exactly one entry to the [`CycleReport`].
//!
//! The per-container state machine:
//!
//! ```text
//! Pending -> Checking -> (UpToDate | Excluded
//!                        | Staging -> Replacing -> Verifying -> Done
//!                                                \-> RollingBack -> Failed)
//! ```
//!
//! The destructive remove of the old container happens last, only after the
//! replacement is confirmed running. Up to that point every step (stop,
//! rename) is reversible, so a crash mid-replacement leaves a recoverable
//! `.displaced` / `.new` pair that [`Reconciler::recover_interrupted`]
//! resolves at the next startup.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::cleanup;
use crate::config::Config;
use crate::error::Error;
use crate::resolver::{DigestResolver, Staleness};
use crate::runtime::ContainerRuntime;
use crate::types::{short_digest, ContainerRecord, ContainerResult, CycleReport, Outcome};

/// Suffix the old container is renamed to while its replacement starts.
const DISPLACED_SUFFIX: &str = ".displaced";
/// Suffix the replacement container is created under until the old one is
/// removed and the original name becomes free.
const STAGING_SUFFIX: &str = ".new";

pub struct Reconciler<R> {
    runtime: Arc<R>,
    config: Arc<Config>,
    /// Process-wide mutual exclusion: two cycles never overlap. An
    /// overlapping trigger is skipped, not queued.
    cycle_lock: Mutex<()>,
}

impl<R: ContainerRuntime> Reconciler<R> {
    pub fn new(runtime: Arc<R>, config: Arc<Config>) -> Self {
        Self {
            runtime,
            config,
            cycle_lock: Mutex::new(()),
        }
    }

    /// Run one full reconciliation cycle. Returns `None` when a cycle is
    /// already in progress. All other failure modes produce a report: only
    /// an unreachable daemon aborts, and even that is reported.
    pub async fn run_cycle(&self) -> Option<CycleReport> {
        let _guard = match self.cycle_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                warn!("reconciliation cycle already in progress, skipping this trigger");
                return None;
            }
        };

        let started_at = Utc::now();
        info!("starting reconciliation cycle");

        let mut errors = Vec::new();
        let records = match self.runtime.list_containers(false).await {
            Ok(records) => records,
            Err(e) => {
                error!("aborting cycle: {}", e);
                errors.push(e.to_string());
                return Some(CycleReport {
                    hostname: self.config.hostname(),
                    started_at,
                    finished_at: Utc::now(),
                    results: Vec::new(),
                    errors,
                });
            }
        };
        debug!("found {} running container(s)", records.len());

        let resolver = DigestResolver::new(
            self.runtime.as_ref(),
            Duration::from_secs(self.config.pull_timeout_secs),
        );

        // Containers are grouped by floating image reference; a group is
        // processed strictly sequentially so the same container or image
        // reference is never replaced twice concurrently, and each
        // reference is pulled once per cycle.
        let mut slots: Vec<Option<ContainerResult>> = (0..records.len()).map(|_| None).collect();
        let mut groups: HashMap<String, Vec<(usize, ContainerRecord)>> = HashMap::new();

        for (idx, record) in records.into_iter().enumerate() {
            if self.config.is_excluded(&record.labels) {
                info!("skipping {} (excluded by label)", record.name);
                slots[idx] = Some(result_for(
                    &record,
                    Outcome::Skipped {
                        reason: "excluded by label".into(),
                    },
                ));
            } else if record.is_local_only() {
                info!("skipping {}: local-only image", record.name);
                slots[idx] = Some(result_for(
                    &record,
                    Outcome::Skipped {
                        reason: "local-only image".into(),
                    },
                ));
            } else {
                groups
                    .entry(record.reference().floating())
                    .or_default()
                    .push((idx, record));
            }
        }

        let concurrency = self.config.concurrency.max(1);
        let processed: Vec<Vec<(usize, ContainerResult)>> = stream::iter(groups.into_values())
            .map(|group| self.process_group(&resolver, group))
            .buffer_unordered(concurrency)
            .collect()
            .await;
        for (idx, result) in processed.into_iter().flatten() {
            slots[idx] = Some(result);
        }

        let report = CycleReport {
            hostname: self.config.hostname(),
            started_at,
            finished_at: Utc::now(),
            results: slots.into_iter().flatten().collect(),
            errors,
        };
        info!(
            "cycle complete: {} checked, {} updated, {} failed, {} skipped",
            report.checked(),
            report.updated(),
            report.failed(),
            report.skipped()
        );
        Some(report)
    }

    async fn process_group(
        &self,
        resolver: &DigestResolver<'_, R>,
        group: Vec<(usize, ContainerRecord)>,
    ) -> Vec<(usize, ContainerResult)> {
        let mut out = Vec::with_capacity(group.len());
        for (idx, record) in group {
            let outcome = self.reconcile_container(resolver, &record).await;
            out.push((idx, result_for(&record, outcome)));
        }
        out
    }

    async fn reconcile_container(
        &self,
        resolver: &DigestResolver<'_, R>,
        record: &ContainerRecord,
    ) -> Outcome {
        match resolver.check(record).await {
            Ok(Staleness::Fresh) => {
                info!("{} is up to date", record.name);
                Outcome::UpToDate
            }
            Ok(Staleness::Pinned) => {
                info!("{} is pinned by digest, not eligible for updates", record.name);
                Outcome::UpToDate
            }
            Ok(Staleness::Stale { latest }) => {
                if self.is_self(record) {
                    info!(
                        "self-update available for {}; restart deferred until the cycle completes",
                        record.name
                    );
                    return Outcome::PendingRestart;
                }
                let outcome = self.replace(record, &latest).await;
                if self.config.cleanup_images {
                    if let Outcome::Updated { old_digest, .. } = &outcome {
                        cleanup::prune_displaced_image(self.runtime.as_ref(), old_digest).await;
                    }
                }
                outcome
            }
            Err(e) => {
                warn!("check failed for {}: {}", record.name, e);
                Outcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Staging -> Replacing -> Verifying -> Done, rolling back on any
    /// failure past the point where the old container was touched.
    async fn replace(&self, record: &ContainerRecord, latest: &str) -> Outcome {
        info!(
            "updating {} ({} -> {})",
            record.name,
            short_digest(&record.image_id),
            short_digest(latest)
        );
        let op = Duration::from_secs(self.config.op_timeout_secs);

        // Staging: snapshot, then create the replacement (stopped) under a
        // temporary name. The original name is not reused until the old
        // container is removed.
        let descriptor = match with_timeout(op, self.runtime.snapshot(&record.id), "snapshot").await
        {
            Ok(descriptor) => descriptor,
            Err(e @ Error::Snapshot(_)) => {
                warn!("rejecting update of {}: {}", record.name, e);
                return Outcome::Failed {
                    reason: e.to_string(),
                };
            }
            Err(e @ Error::Inspect(_)) => {
                info!("{} vanished before snapshot: {}", record.name, e);
                return Outcome::Skipped {
                    reason: "container vanished before snapshot".into(),
                };
            }
            Err(e) => {
                warn!("could not snapshot {}: {}", record.name, e);
                return Outcome::Failed {
                    reason: e.to_string(),
                };
            }
        };

        let staging_name = format!("{}{}", record.name, STAGING_SUFFIX);
        let new_id = match with_timeout(
            op,
            self.runtime
                .create_container(&staging_name, &record.image, &descriptor),
            "create",
        )
        .await
        {
            Ok(id) => id,
            // The old container is untouched at this point.
            Err(e) => {
                warn!("could not create replacement for {}: {}", record.name, e);
                return Outcome::Failed {
                    reason: e.to_string(),
                };
            }
        };

        // Replacing: stop and rename the old container to free its name
        // and network aliases. Both steps stay reversible until the final
        // remove.
        let stop = Duration::from_secs(self.config.stop_timeout_secs);
        if let Err(e) = with_timeout(
            stop + op,
            self.runtime
                .stop_container(&record.id, self.config.stop_timeout_secs as i64),
            "stop",
        )
        .await
        {
            return self.roll_back(record, &new_id, false, e).await;
        }
        let displaced_name = format!("{}{}", record.name, DISPLACED_SUFFIX);
        if let Err(e) = with_timeout(
            op,
            self.runtime.rename_container(&record.id, &displaced_name),
            "rename",
        )
        .await
        {
            return self.roll_back(record, &new_id, false, e).await;
        }

        if let Err(e) = with_timeout(op, self.runtime.start_container(&new_id), "start").await {
            return self.roll_back(record, &new_id, true, e).await;
        }

        // Verifying: the replacement must reach a running state within the
        // bounded wait and not exit immediately.
        if let Err(e) = self.verify(&new_id).await {
            return self.roll_back(record, &new_id, true, e).await;
        }

        // Done: the destructive remove happens last, once the replacement
        // is confirmed running. A crash before this point is recoverable.
        match with_timeout(op, self.runtime.remove_container(&record.id), "remove").await {
            Ok(()) => {
                if let Err(e) = with_timeout(
                    op,
                    self.runtime.rename_container(&new_id, &record.name),
                    "rename replacement",
                )
                .await
                {
                    warn!(
                        "replacement for {} keeps temporary name {}: {}",
                        record.name, staging_name, e
                    );
                }
            }
            Err(e) => {
                warn!(
                    "leftover displaced container {} not removed: {}",
                    displaced_name, e
                );
            }
        }

        info!("updated {}", record.name);
        Outcome::Updated {
            old_digest: record.image_id.clone(),
            new_digest: latest.to_string(),
        }
    }

    /// Undo a partial replacement: drop the new container and restore the
    /// old one to its original name and state. `renamed` says whether the
    /// old container was already renamed to its displaced name.
    async fn roll_back(
        &self,
        record: &ContainerRecord,
        new_id: &str,
        renamed: bool,
        cause: Error,
    ) -> Outcome {
        warn!("rolling back replacement of {}: {}", record.name, cause);
        let op = Duration::from_secs(self.config.op_timeout_secs);

        if let Err(e) = with_timeout(
            op,
            self.runtime.remove_container(new_id),
            "remove replacement",
        )
        .await
        {
            warn!("could not remove replacement container {}: {}", new_id, e);
        }
        if renamed {
            if let Err(e) = with_timeout(
                op,
                self.runtime.rename_container(&record.id, &record.name),
                "restore name",
            )
            .await
            {
                error!("rollback failed for {}: {}", record.name, e);
                return Outcome::RollbackFailed {
                    reason: format!("original name not restored: {}", e),
                };
            }
        }
        if record.running {
            if let Err(e) =
                with_timeout(op, self.runtime.start_container(&record.id), "restart").await
            {
                error!(
                    "rollback failed for {}: old container not restarted: {}",
                    record.name, e
                );
                return Outcome::RollbackFailed {
                    reason: format!("old container not restarted: {}", e),
                };
            }
        }

        info!("rolled back {}", record.name);
        Outcome::Failed {
            reason: cause.to_string(),
        }
    }

    /// Wait for the container to reach a running state within the bounded
    /// verification window, then confirm it did not exit immediately.
    async fn verify(&self, id: &str) -> Result<(), Error> {
        let window = Duration::from_secs(self.config.verify_timeout_secs);
        let poll = (window / 10).max(Duration::from_millis(50));
        let grace = (window / 5).max(Duration::from_millis(100));
        let deadline = Instant::now() + window;

        loop {
            let state = self
                .runtime
                .container_state(id)
                .await
                .map_err(|e| Error::Verification(e.to_string()))?;

            if state.running {
                tokio::time::sleep(grace).await;
                let settled = self
                    .runtime
                    .container_state(id)
                    .await
                    .map_err(|e| Error::Verification(e.to_string()))?;
                if settled.running {
                    return Ok(());
                }
                return Err(Error::Verification(format!(
                    "container exited immediately (exit code {:?})",
                    settled.exit_code
                )));
            }
            if let Some(code) = state.exit_code {
                return Err(Error::Verification(format!(
                    "container exited with code {}",
                    code
                )));
            }
            if Instant::now() >= deadline {
                return Err(Error::Verification(format!(
                    "not running after {:?}",
                    window
                )));
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Resolve `.new` / `.displaced` leftovers from a replacement that was
    /// interrupted by a process shutdown. Idempotent; called at startup.
    pub async fn recover_interrupted(&self) -> Result<(), Error> {
        let op = Duration::from_secs(self.config.op_timeout_secs);
        let all = self.runtime.list_containers(true).await?;

        // Staging containers first: any with a displaced sibling belongs
        // to an unconfirmed replacement and is dropped before the old
        // container is restored.
        for c in &all {
            let Some(orig) = c.name.strip_suffix(STAGING_SUFFIX) else {
                continue;
            };
            let displaced = format!("{}{}", orig, DISPLACED_SUFFIX);
            let displaced_exists = all.iter().any(|o| o.name == displaced);
            let orig_taken = all.iter().any(|o| o.name == orig);

            if !displaced_exists && !orig_taken {
                // The old container was already removed, so this is the only
                // copy of the service left. Adopt it even if it has since
                // exited; dropping it would lose the container.
                info!("adopting confirmed replacement as {}", orig);
                if let Err(e) =
                    with_timeout(op, self.runtime.rename_container(&c.id, orig), "adopt").await
                {
                    warn!("could not adopt {}: {}", c.name, e);
                    continue;
                }
                if !c.running {
                    if let Err(e) =
                        with_timeout(op, self.runtime.start_container(&c.id), "start adopted")
                            .await
                    {
                        warn!("could not start adopted container {}: {}", orig, e);
                    }
                }
            } else {
                info!("removing staging container {}", c.name);
                if let Err(e) =
                    with_timeout(op, self.runtime.remove_container(&c.id), "remove staging").await
                {
                    warn!("could not remove {}: {}", c.name, e);
                }
            }
        }

        let all = self.runtime.list_containers(true).await?;
        for c in &all {
            let Some(orig) = c.name.strip_suffix(DISPLACED_SUFFIX) else {
                continue;
            };
            if all.iter().any(|o| o.name == orig) {
                // Replacement completed; only the displaced remove was lost.
                info!("removing leftover displaced container {}", c.name);
                if let Err(e) =
                    with_timeout(op, self.runtime.remove_container(&c.id), "remove displaced")
                        .await
                {
                    warn!("could not remove {}: {}", c.name, e);
                }
            } else {
                info!("restoring {}: replacement was interrupted", orig);
                if let Err(e) =
                    with_timeout(op, self.runtime.rename_container(&c.id, orig), "restore").await
                {
                    error!("could not restore name of {}: {}", c.name, e);
                    continue;
                }
                if let Err(e) =
                    with_timeout(op, self.runtime.start_container(&c.id), "restart restored")
                        .await
                {
                    error!("could not restart restored container {}: {}", orig, e);
                }
            }
        }
        Ok(())
    }

    /// Stop our own container; the Docker restart policy brings it back up
    /// on the new image. Called after the cycle report has been dispatched.
    pub async fn restart_self(&self) {
        let Some(hostname) = self.config.hostname.clone().filter(|h| !h.is_empty()) else {
            error!("cannot self-restart: own container unknown");
            return;
        };
        let containers = match self.runtime.list_containers(false).await {
            Ok(c) => c,
            Err(e) => {
                error!("cannot self-restart: {}", e);
                return;
            }
        };
        let Some(me) = containers.iter().find(|c| c.id.starts_with(&hostname)) else {
            error!("cannot self-restart: container {} not found", hostname);
            return;
        };
        info!("self-update: stopping own container, restart policy takes over");
        let wait = Duration::from_secs(10 + self.config.op_timeout_secs);
        if let Err(e) = with_timeout(wait, self.runtime.stop_container(&me.id, 10), "stop").await {
            error!("self-restart failed: {}", e);
        }
    }

    fn is_self(&self, record: &ContainerRecord) -> bool {
        self.config
            .hostname
            .as_deref()
            .map(|h| !h.is_empty() && record.id.starts_with(h))
            .unwrap_or(false)
    }
}

fn result_for(record: &ContainerRecord, outcome: Outcome) -> ContainerResult {
    ContainerResult {
        name: record.name.clone(),
        image: record.image.clone(),
        outcome,
    }
}

async fn with_timeout<T, F>(duration: Duration, fut: F, what: &str) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Replacement(format!(
            "{} timed out after {:?}",
            what, duration
        ))),
    }
}
