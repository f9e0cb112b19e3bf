//! Removal of images displaced by a successful replacement.

use log::{debug, info, warn};

use crate::runtime::ContainerRuntime;

/// Remove a displaced image unless some container still references it.
///
/// The container list is re-read at prune time: a container created since
/// the cycle started (for example by hand, from the same image) must keep
/// the image alive. Failures are warnings, never cycle failures.
pub async fn prune_displaced_image<R: ContainerRuntime + ?Sized>(runtime: &R, displaced: &str) {
    if displaced.is_empty() {
        return;
    }

    let containers = match runtime.list_containers(true).await {
        Ok(c) => c,
        Err(e) => {
            warn!("skipping prune of {}: {}", displaced, e);
            return;
        }
    };

    if containers.iter().any(|c| c.image_id == displaced) {
        debug!("keeping displaced image {}: still referenced", displaced);
        return;
    }

    match runtime.remove_image(displaced).await {
        Ok(()) => info!("removed displaced image {}", displaced),
        Err(e) => warn!("{}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::mock::MockRuntime;
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_prunes_unreferenced_image() {
        let runtime = MockRuntime::new();
        runtime.add_container("web", "app:1.0", "sha256:d2", HashMap::new(), true);

        prune_displaced_image(&runtime, "sha256:d1").await;
        assert_eq!(runtime.removed_images(), vec!["sha256:d1".to_string()]);
    }

    #[tokio::test]
    async fn test_never_prunes_referenced_image() {
        let runtime = MockRuntime::new();
        runtime.add_container("web", "app:1.0", "sha256:d2", HashMap::new(), true);
        // A stopped container counts as a reference too.
        runtime.add_container("batch", "app:0.9", "sha256:d1", HashMap::new(), false);

        prune_displaced_image(&runtime, "sha256:d1").await;
        assert!(runtime.removed_images().is_empty());
    }

    #[tokio::test]
    async fn test_prune_failure_is_swallowed() {
        let runtime = MockRuntime::new();
        runtime.fail_list();
        // Must not panic or propagate.
        prune_displaced_image(&runtime, "sha256:d1").await;
        assert!(runtime.removed_images().is_empty());
    }
}
