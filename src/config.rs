use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::notify::WebhookFormat;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Seconds between reconciliation cycles.
    pub interval_secs: u64,
    /// Run one cycle immediately at startup instead of waiting a full tick.
    pub run_on_startup: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    pub webhook_format: WebhookFormat,
    pub notify_on_update: bool,
    pub notify_on_error: bool,
    pub notify_always: bool,

    /// Label key whose presence with a truthy value excludes a container
    /// from all reconciliation.
    pub exclude_label: String,
    /// Number of image-reference groups processed concurrently within a
    /// cycle. 1 means strictly sequential.
    pub concurrency: usize,

    pub stop_timeout_secs: u64,
    pub pull_timeout_secs: u64,
    pub op_timeout_secs: u64,
    pub verify_timeout_secs: u64,

    /// Remove displaced images after a successful replacement.
    pub cleanup_images: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // Once a day, matching the common 4am-cron deployment.
            interval_secs: 86_400,
            run_on_startup: false,
            webhook_url: None,
            webhook_format: WebhookFormat::Auto,
            notify_on_update: true,
            notify_on_error: true,
            notify_always: false,
            exclude_label: "imagewatch.disable".into(),
            concurrency: 1,
            stop_timeout_secs: 30,
            pull_timeout_secs: 600,
            op_timeout_secs: 60,
            verify_timeout_secs: 15,
            cleanup_images: true,
            hostname: None,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let mut config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("imagewatch.toml"))
            .merge(Json::file("imagewatch.json"))
            .merge(Env::prefixed("IMAGEWATCH_"))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        if config.concurrency == 0 {
            config.concurrency = 1;
        }

        // In a container the hostname is usually our own container id; it
        // doubles as the self-detection key.
        if config.hostname.is_none() {
            config.hostname = std::env::var("HOSTNAME").ok();
        }

        Ok(config)
    }

    pub fn hostname(&self) -> String {
        self.hostname.clone().unwrap_or_else(|| "unknown".into())
    }

    /// A label value of `true`/`1`/`yes` (any case) marks the container as
    /// excluded; anything else, including a bare empty value, does not.
    pub fn is_excluded(&self, labels: &std::collections::HashMap<String, String>) -> bool {
        labels
            .get(&self.exclude_label)
            .map(|v| {
                let v = v.trim().to_ascii_lowercase();
                v == "true" || v == "1" || v == "yes"
            })
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.interval_secs, 86_400);
        assert_eq!(cfg.concurrency, 1);
        assert_eq!(cfg.exclude_label, "imagewatch.disable");
        assert!(cfg.notify_on_update);
        assert!(cfg.notify_on_error);
        assert!(!cfg.notify_always);
        assert_eq!(cfg.webhook_format, WebhookFormat::Auto);
    }

    #[test]
    fn test_exclusion_label_truthiness() {
        let cfg = Config::default();
        let mut labels = HashMap::new();
        assert!(!cfg.is_excluded(&labels));

        labels.insert("imagewatch.disable".to_string(), "true".to_string());
        assert!(cfg.is_excluded(&labels));

        labels.insert("imagewatch.disable".to_string(), "TRUE".to_string());
        assert!(cfg.is_excluded(&labels));

        labels.insert("imagewatch.disable".to_string(), "1".to_string());
        assert!(cfg.is_excluded(&labels));

        labels.insert("imagewatch.disable".to_string(), "false".to_string());
        assert!(!cfg.is_excluded(&labels));

        labels.insert("imagewatch.disable".to_string(), String::new());
        assert!(!cfg.is_excluded(&labels));
    }
}
