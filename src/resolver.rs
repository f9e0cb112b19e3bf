//! Staleness resolution: is the image a container runs behind the digest
//! its registry reference resolves to right now?

use std::collections::HashMap;
use std::time::Duration;

use log::debug;
use tokio::sync::Mutex;

use crate::error::Error;
use crate::runtime::ContainerRuntime;
use crate::types::{ContainerRecord, ImageReference};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Staleness {
    /// The running digest matches the registry's latest.
    Fresh,
    /// A newer image exists; `latest` is the digest the reference resolves to.
    Stale { latest: String },
    /// Pinned-by-digest reference: there is no "latest" to compare against.
    /// Always reported not stale. Explicit policy, not an oversight.
    Pinned,
}

/// Resolves references for the duration of one cycle. Pull results (and
/// pull failures) are memoized per floating reference so a reference shared
/// by several containers is pulled exactly once per cycle.
pub struct DigestResolver<'a, R: ?Sized> {
    runtime: &'a R,
    pull_timeout: Duration,
    cache: Mutex<HashMap<String, Result<String, String>>>,
}

impl<'a, R: ContainerRuntime + ?Sized> DigestResolver<'a, R> {
    pub fn new(runtime: &'a R, pull_timeout: Duration) -> Self {
        Self {
            runtime,
            pull_timeout,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Pull the reference and return the digest the daemon resolved it to.
    pub async fn resolve_latest(&self, reference: &ImageReference) -> Result<String, Error> {
        let floating = reference.floating();

        if let Some(cached) = self.cache.lock().await.get(&floating) {
            debug!("resolver cache hit for {}", floating);
            return cached.clone().map_err(|message| Error::Pull {
                reference: floating.clone(),
                message,
            });
        }

        let result = match tokio::time::timeout(
            self.pull_timeout,
            self.runtime.pull_image(reference),
        )
        .await
        {
            Ok(Ok(digest)) => Ok(digest),
            Ok(Err(Error::Pull { message, .. })) => Err(message),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("pull timed out after {:?}", self.pull_timeout)),
        };

        self.cache
            .lock()
            .await
            .insert(floating.clone(), result.clone());
        result.map_err(|message| Error::Pull {
            reference: floating,
            message,
        })
    }

    /// Compare a container's running digest against the registry's latest.
    pub async fn check(&self, record: &ContainerRecord) -> Result<Staleness, Error> {
        let reference = record.reference();
        if reference.is_pinned() {
            return Ok(Staleness::Pinned);
        }
        let latest = self.resolve_latest(&reference).await?;
        if latest == record.image_id {
            Ok(Staleness::Fresh)
        } else {
            Ok(Staleness::Stale { latest })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::mock::MockRuntime;
    use std::collections::HashMap as StdHashMap;

    fn record(image: &str, image_id: &str) -> ContainerRecord {
        ContainerRecord {
            id: "cafebabe".into(),
            name: "web".into(),
            image: image.into(),
            image_id: image_id.into(),
            labels: StdHashMap::new(),
            running: true,
        }
    }

    #[tokio::test]
    async fn test_pinned_reference_is_never_stale() {
        let runtime = MockRuntime::new();
        let resolver = DigestResolver::new(&runtime, Duration::from_secs(5));
        // Any digest value: no pull must happen, equal or not.
        let staleness = resolver
            .check(&record("app:1.0@sha256:d1", "sha256:d9"))
            .await
            .unwrap();
        assert_eq!(staleness, Staleness::Pinned);
        assert!(runtime.pulls().is_empty());
    }

    #[tokio::test]
    async fn test_fresh_and_stale() {
        let runtime = MockRuntime::new();
        runtime.set_registry("app:1.0", "sha256:d2");
        let resolver = DigestResolver::new(&runtime, Duration::from_secs(5));

        let fresh = resolver.check(&record("app:1.0", "sha256:d2")).await.unwrap();
        assert_eq!(fresh, Staleness::Fresh);

        let stale = resolver.check(&record("app:1.0", "sha256:d1")).await.unwrap();
        assert_eq!(
            stale,
            Staleness::Stale {
                latest: "sha256:d2".into()
            }
        );
    }

    #[tokio::test]
    async fn test_pull_memoized_per_reference() {
        let runtime = MockRuntime::new();
        runtime.set_registry("app:1.0", "sha256:d2");
        let resolver = DigestResolver::new(&runtime, Duration::from_secs(5));

        resolver.check(&record("app:1.0", "sha256:d1")).await.unwrap();
        resolver.check(&record("app:1.0", "sha256:d2")).await.unwrap();
        assert_eq!(runtime.pulls().len(), 1);
    }

    #[tokio::test]
    async fn test_pull_failure_surfaces_and_is_cached() {
        let runtime = MockRuntime::new();
        runtime.fail_pull("app:1.0");
        let resolver = DigestResolver::new(&runtime, Duration::from_secs(5));

        for _ in 0..2 {
            let err = resolver.check(&record("app:1.0", "sha256:d1")).await;
            assert!(matches!(err, Err(Error::Pull { .. })));
        }
        // The failed pull is not retried within the cycle.
        assert!(runtime.pulls().is_empty());
    }

    #[tokio::test]
    async fn test_implicit_latest_tag_is_floating() {
        let runtime = MockRuntime::new();
        runtime.set_registry("nginx:latest", "sha256:d2");
        let resolver = DigestResolver::new(&runtime, Duration::from_secs(5));

        let staleness = resolver.check(&record("nginx", "sha256:d1")).await.unwrap();
        assert_eq!(
            staleness,
            Staleness::Stale {
                latest: "sha256:d2".into()
            }
        );
    }
}
