//! Data structures shared across the reconciliation engine.
//!
//! These types are serialised with [`serde`](https://serde.rs/) because the
//! generic JSON webhook format ships the whole cycle report verbatim. The
//! report is built up during one cycle and is immutable once handed to the
//! notification dispatcher.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A parsed image reference: repository, optional tag, optional digest pin.
///
/// Two references name the same logical image when repository and tag match.
/// A reference carrying a digest is pinned: there is no "latest" to compare
/// against, so it is never eligible for a staleness check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageReference {
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageReference {
    /// Lenient parse of `repo`, `repo:tag`, `repo@sha256:…` and
    /// `repo:tag@sha256:…`. Port-carrying registries (`host:5000/img`) are
    /// handled by only treating a colon after the last slash as a tag
    /// separator.
    pub fn parse(raw: &str) -> Self {
        let (name, digest) = match raw.split_once('@') {
            Some((n, d)) => (n, Some(d.to_string())),
            None => (raw, None),
        };

        let slash = name.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (repository, tag) = match name[slash..].rfind(':') {
            Some(i) => {
                let split = slash + i;
                (
                    name[..split].to_string(),
                    Some(name[split + 1..].to_string()),
                )
            }
            None => (name.to_string(), None),
        };

        Self {
            repository,
            tag,
            digest,
        }
    }

    /// True when the reference is pinned by digest.
    pub fn is_pinned(&self) -> bool {
        self.digest.is_some()
    }

    /// The floating `repo:tag` form used for pulls. An absent tag is an
    /// implicit `latest`; both are treated as floating.
    pub fn floating(&self) -> String {
        format!(
            "{}:{}",
            self.repository,
            self.tag.as_deref().unwrap_or("latest")
        )
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

/// One container as seen at the start of a cycle. Built fresh from the
/// daemon every cycle, never cached across cycles.
#[derive(Debug, Clone)]
pub struct ContainerRecord {
    pub id: String,
    pub name: String,
    /// Raw image reference string from the container config.
    pub image: String,
    /// Digest/id of the image the container currently runs.
    pub image_id: String,
    pub labels: HashMap<String, String>,
    pub running: bool,
}

impl ContainerRecord {
    pub fn reference(&self) -> ImageReference {
        ImageReference::parse(&self.image)
    }

    /// Containers running an untagged local build (`sha256:…` image, or no
    /// image reference at all) cannot be checked against a registry.
    pub fn is_local_only(&self) -> bool {
        self.image.is_empty() || self.image.starts_with("sha256:")
    }
}

/// Per-container outcome of one reconciliation cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum Outcome {
    UpToDate,
    Updated {
        old_digest: String,
        new_digest: String,
    },
    Skipped {
        reason: String,
    },
    Failed {
        reason: String,
    },
    /// Rollback after a failed replacement also failed. Distinct from
    /// [`Outcome::Failed`]: the container may be down and needs an operator.
    RollbackFailed {
        reason: String,
    },
    /// The daemon's own container has an update. It is restarted after the
    /// cycle completes instead of being replaced mid-cycle.
    PendingRestart,
}

/// One line of the cycle report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerResult {
    pub name: String,
    pub image: String,
    #[serde(flatten)]
    pub outcome: Outcome,
}

/// Aggregated outcome of one full reconciliation cycle. Sole input to the
/// notification dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    pub hostname: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub results: Vec<ContainerResult>,
    /// Cycle-level errors (daemon unreachable, rollback leftovers).
    pub errors: Vec<String>,
}

impl CycleReport {
    pub fn duration_seconds(&self) -> f64 {
        (self.finished_at - self.started_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }

    pub fn checked(&self) -> usize {
        self.results.len()
    }

    pub fn updated(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Updated { .. } | Outcome::PendingRestart))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Failed { .. } | Outcome::RollbackFailed { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Skipped { .. }))
    }

    pub fn up_to_date(&self) -> usize {
        self.count(|o| matches!(o, Outcome::UpToDate))
    }

    pub fn has_updates(&self) -> bool {
        self.updated() > 0
    }

    pub fn has_errors(&self) -> bool {
        self.failed() > 0 || !self.errors.is_empty()
    }

    pub fn pending_self_restart(&self) -> bool {
        self.results
            .iter()
            .any(|r| r.outcome == Outcome::PendingRestart)
    }

    fn count(&self, pred: impl Fn(&Outcome) -> bool) -> usize {
        self.results.iter().filter(|r| pred(&r.outcome)).count()
    }
}

/// Shorten a digest to its first 12 hex characters for log and report lines.
pub fn short_digest(digest: &str) -> &str {
    let trimmed = digest.strip_prefix("sha256:").unwrap_or(digest);
    &trimmed[..trimmed.len().min(12)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_digest() {
        assert_eq!(short_digest("sha256:0123456789abcdef0123"), "0123456789ab");
        assert_eq!(short_digest("0123456789abcdef0123"), "0123456789ab");
        assert_eq!(short_digest("abc"), "abc");
    }

    #[test]
    fn test_parse_plain_repo() {
        let r = ImageReference::parse("nginx");
        assert_eq!(r.repository, "nginx");
        assert_eq!(r.tag, None);
        assert!(!r.is_pinned());
        assert_eq!(r.floating(), "nginx:latest");
    }

    #[test]
    fn test_parse_repo_with_tag() {
        let r = ImageReference::parse("ghcr.io/acme/app:1.0");
        assert_eq!(r.repository, "ghcr.io/acme/app");
        assert_eq!(r.tag.as_deref(), Some("1.0"));
        assert_eq!(r.floating(), "ghcr.io/acme/app:1.0");
    }

    #[test]
    fn test_parse_registry_with_port() {
        let r = ImageReference::parse("localhost:5000/app");
        assert_eq!(r.repository, "localhost:5000/app");
        assert_eq!(r.tag, None);

        let r = ImageReference::parse("localhost:5000/app:2.1");
        assert_eq!(r.repository, "localhost:5000/app");
        assert_eq!(r.tag.as_deref(), Some("2.1"));
    }

    #[test]
    fn test_parse_digest_pinned() {
        let r = ImageReference::parse("redis:7@sha256:abc123");
        assert_eq!(r.repository, "redis");
        assert_eq!(r.tag.as_deref(), Some("7"));
        assert_eq!(r.digest.as_deref(), Some("sha256:abc123"));
        assert!(r.is_pinned());

        let r = ImageReference::parse("redis@sha256:abc123");
        assert_eq!(r.tag, None);
        assert!(r.is_pinned());
    }

    #[test]
    fn test_display_round_trip() {
        for raw in ["nginx", "nginx:1.25", "ghcr.io/a/b:1.0@sha256:deadbeef"] {
            assert_eq!(ImageReference::parse(raw).to_string(), raw);
        }
    }

    #[test]
    fn test_local_only_detection() {
        let mut rec = ContainerRecord {
            id: "1".into(),
            name: "c".into(),
            image: "sha256:abcdef".into(),
            image_id: "sha256:abcdef".into(),
            labels: HashMap::new(),
            running: true,
        };
        assert!(rec.is_local_only());
        rec.image = "nginx:1.25".into();
        assert!(!rec.is_local_only());
        rec.image = String::new();
        assert!(rec.is_local_only());
    }

    #[test]
    fn test_report_counters() {
        let now = Utc::now();
        let report = CycleReport {
            hostname: "host".into(),
            started_at: now,
            finished_at: now,
            results: vec![
                ContainerResult {
                    name: "a".into(),
                    image: "a:1".into(),
                    outcome: Outcome::Updated {
                        old_digest: "sha256:1".into(),
                        new_digest: "sha256:2".into(),
                    },
                },
                ContainerResult {
                    name: "b".into(),
                    image: "b:1".into(),
                    outcome: Outcome::UpToDate,
                },
                ContainerResult {
                    name: "c".into(),
                    image: "c:1".into(),
                    outcome: Outcome::Skipped {
                        reason: "excluded by label".into(),
                    },
                },
                ContainerResult {
                    name: "d".into(),
                    image: "d:1".into(),
                    outcome: Outcome::RollbackFailed {
                        reason: "old container gone".into(),
                    },
                },
            ],
            errors: vec![],
        };
        assert_eq!(report.checked(), 4);
        assert_eq!(report.updated(), 1);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.skipped(), 1);
        assert_eq!(report.up_to_date(), 1);
        assert!(report.has_updates());
        assert!(report.has_errors());
    }
}
