//! Webhook notification dispatch.
//!
//! A cycle report is rendered into one of several outbound formats and
//! POSTed to a configured webhook. Format auto-detection from the URL is a
//! best-effort classifier with a generic JSON fallback, not a guarantee.
//! Delivery failures are retried a bounded number of times and then logged;
//! they never fail the reconciliation cycle that produced the report.

use std::time::Duration;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use url::Url;

use crate::config::Config;
use crate::error::Error;
use crate::types::{short_digest, CycleReport, Outcome};

const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookFormat {
    Auto,
    Discord,
    Slack,
    Telegram,
    Markdown,
    Json,
}

/// Classify a webhook URL by its host shape. Unknown hosts (and unparsable
/// URLs) fall back to the generic JSON format.
pub fn detect_format(webhook_url: &str) -> WebhookFormat {
    let Ok(url) = Url::parse(webhook_url) else {
        return WebhookFormat::Json;
    };
    let host = url.host_str().unwrap_or("").to_ascii_lowercase();

    if (host == "discord.com" || host == "discordapp.com")
        && url.path().contains("/api/webhooks")
    {
        WebhookFormat::Discord
    } else if host == "hooks.slack.com" {
        WebhookFormat::Slack
    } else if host == "api.telegram.org" {
        WebhookFormat::Telegram
    } else {
        WebhookFormat::Json
    }
}

pub struct Notifier {
    client: reqwest::Client,
    webhook_url: Option<String>,
    format: WebhookFormat,
    on_update: bool,
    on_error: bool,
    always: bool,
}

impl Notifier {
    pub fn from_config(config: &Config) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_url: config.webhook_url.clone(),
            format: config.webhook_format,
            on_update: config.notify_on_update,
            on_error: config.notify_on_error,
            always: config.notify_always,
        }
    }

    fn should_send(&self, report: &CycleReport) -> bool {
        self.always
            || (self.on_update && report.has_updates())
            || (self.on_error && report.has_errors())
    }

    /// Send the report if the policy asks for it. Never fails the caller.
    pub async fn dispatch(&self, report: &CycleReport) {
        let Some(url) = self.webhook_url.as_deref() else {
            return;
        };
        if !self.should_send(report) {
            debug!("webhook skipped: no updates or errors to report");
            return;
        }

        let format = match self.format {
            WebhookFormat::Auto => detect_format(url),
            explicit => explicit,
        };
        let payload = payload_for(format, report);

        match self.deliver(url, &payload).await {
            Ok(status) => info!("webhook sent ({:?}, status {})", format, status),
            Err(e) => error!("{}", e),
        }
    }

    async fn deliver(&self, url: &str, payload: &Value) -> Result<u16, Error> {
        let mut backoff = INITIAL_BACKOFF;
        let mut last = String::new();

        for attempt in 1..=MAX_ATTEMPTS {
            match self.client.post(url).json(payload).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp.status().as_u16()),
                Ok(resp) => {
                    last = format!("status {}", resp.status());
                    warn!("webhook attempt {}/{}: {}", attempt, MAX_ATTEMPTS, last);
                }
                Err(e) => {
                    last = e.to_string();
                    warn!("webhook attempt {}/{}: {}", attempt, MAX_ATTEMPTS, last);
                }
            }
            if attempt < MAX_ATTEMPTS {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }
        Err(Error::Notification(format!(
            "giving up after {} attempts: {}",
            MAX_ATTEMPTS, last
        )))
    }
}

fn status_line(report: &CycleReport) -> &'static str {
    if report.has_errors() {
        "Completed with errors"
    } else if report.has_updates() {
        "Updates applied"
    } else {
        "No updates needed"
    }
}

/// Render the report as a self-contained Markdown message, used by the
/// telegram and markdown formats.
pub fn render_markdown(report: &CycleReport) -> String {
    let mut lines = vec![
        format!("## imagewatch report: {}", status_line(report)),
        String::new(),
        format!("**Host:** `{}`", report.hostname),
        format!("**Time:** {}", report.started_at.format("%Y-%m-%d %H:%M:%S")),
        format!("**Duration:** {:.1}s", report.duration_seconds()),
        String::new(),
        "| Metric | Value |".to_string(),
        "|--------|-------|".to_string(),
        format!("| Checked | {} |", report.checked()),
        format!("| Updated | {} |", report.updated()),
        format!("| Failed | {} |", report.failed()),
        format!("| Skipped | {} |", report.skipped()),
        format!("| Up to date | {} |", report.up_to_date()),
    ];

    let updated: Vec<String> = report
        .results
        .iter()
        .filter_map(|r| match &r.outcome {
            Outcome::Updated {
                old_digest,
                new_digest,
            } => Some(format!(
                "- `{}` ({}): {} -> {}",
                r.name,
                r.image,
                short_digest(old_digest),
                short_digest(new_digest)
            )),
            Outcome::PendingRestart => {
                Some(format!("- `{}` ({}): restart pending (self)", r.name, r.image))
            }
            _ => None,
        })
        .collect();
    if !updated.is_empty() {
        lines.push(String::new());
        lines.push("**Updated:**".to_string());
        lines.extend(updated);
    }

    let failed: Vec<String> = report
        .results
        .iter()
        .filter_map(|r| match &r.outcome {
            Outcome::Failed { reason } => Some(format!("- `{}`: {}", r.name, reason)),
            Outcome::RollbackFailed { reason } => {
                Some(format!("- `{}`: ROLLBACK FAILED: {}", r.name, reason))
            }
            _ => None,
        })
        .collect();
    if !failed.is_empty() {
        lines.push(String::new());
        lines.push("**Failed:**".to_string());
        lines.extend(failed);
    }

    if !report.errors.is_empty() {
        lines.push(String::new());
        lines.push("**Errors:**".to_string());
        lines.extend(report.errors.iter().map(|e| format!("- {}", e)));
    }

    lines.join("\n")
}

fn summary_counts(report: &CycleReport) -> String {
    format!(
        "{} checked, {} updated, {} failed, {} skipped, {} up to date",
        report.checked(),
        report.updated(),
        report.failed(),
        report.skipped(),
        report.up_to_date()
    )
}

fn updated_lines(report: &CycleReport) -> Vec<String> {
    report
        .results
        .iter()
        .filter_map(|r| match &r.outcome {
            Outcome::Updated {
                old_digest,
                new_digest,
            } => Some(format!(
                "`{}`: {} -> {}",
                r.name,
                short_digest(old_digest),
                short_digest(new_digest)
            )),
            _ => None,
        })
        .collect()
}

fn payload_for(format: WebhookFormat, report: &CycleReport) -> Value {
    match format {
        WebhookFormat::Discord => discord_payload(report),
        WebhookFormat::Slack => slack_payload(report),
        WebhookFormat::Telegram => json!({
            "text": render_markdown(report),
            "parse_mode": "Markdown",
        }),
        WebhookFormat::Markdown => {
            let body = render_markdown(report);
            json!({
                "text": body,
                "content": body,
                "message": body,
            })
        }
        // Auto is resolved before payload construction; an unresolved Auto
        // is the generic fallback.
        WebhookFormat::Json | WebhookFormat::Auto => {
            serde_json::to_value(report).unwrap_or_else(|_| json!({}))
        }
    }
}

fn discord_payload(report: &CycleReport) -> Value {
    let color: u32 = if report.has_errors() {
        0xFFA500
    } else if report.has_updates() {
        0x00FF00
    } else {
        0x36A64F
    };

    let mut fields = vec![
        json!({"name": "Host", "value": format!("`{}`", report.hostname), "inline": true}),
        json!({"name": "Duration", "value": format!("{:.1}s", report.duration_seconds()), "inline": true}),
        json!({"name": "Containers", "value": summary_counts(report), "inline": false}),
    ];
    let updated = updated_lines(report);
    if !updated.is_empty() {
        fields.push(json!({"name": "Updated", "value": updated.join("\n"), "inline": false}));
    }

    json!({
        "embeds": [{
            "title": format!("imagewatch: {}", status_line(report)),
            "color": color,
            "fields": fields,
            "timestamp": report.finished_at.to_rfc3339(),
            "footer": {"text": "imagewatch"},
        }]
    })
}

fn slack_payload(report: &CycleReport) -> Value {
    let color = if report.has_errors() {
        "warning"
    } else if report.has_updates() {
        "good"
    } else {
        "#36a64f"
    };

    let mut fields = vec![
        json!({"title": "Host", "value": report.hostname, "short": true}),
        json!({"title": "Duration", "value": format!("{:.1}s", report.duration_seconds()), "short": true}),
        json!({"title": "Containers", "value": summary_counts(report), "short": false}),
    ];
    let updated = updated_lines(report);
    if !updated.is_empty() {
        fields.push(json!({"title": "Updated", "value": updated.join("\n"), "short": false}));
    }

    json!({
        "attachments": [{
            "color": color,
            "title": format!("imagewatch: {}", status_line(report)),
            "fields": fields,
            "footer": "imagewatch",
            "ts": report.finished_at.timestamp(),
        }]
    })
}
