// Journal-entry notifications

//! Notifier
//!
//! Renders a confirmed move as a Markdown journal entry on the server's
//! inventory device. Initial alerts post with severity `warning`,
//! reminders with `info`. A failed post propagates to the poll loop so the
//! alert is not recorded as sent and retries next cycle.

use crate::config::Config;
use crate::retry::retry_async;
use crate::types::AlertInfo;
use anyhow::{bail, Context, Result};
use std::time::Duration;

const POST_ATTEMPTS: u32 = 3;
const POST_BACKOFF_MIN: Duration = Duration::from_secs(2);
const POST_BACKOFF_MAX: Duration = Duration::from_secs(10);

/// Posts journal entries to the inventory.
pub struct Notifier {
    http: reqwest::Client,
    base_url: String,
    auth_header: String,
}

impl Notifier {
    /// Build a notifier from the application configuration.
    pub fn new(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .danger_accept_invalid_certs(!config.netbox_verify_ssl)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: config.netbox_url.clone(),
            auth_header: format!("Token {}", config.netbox_token),
        })
    }

    /// Render the journal entry body for an alert.
    fn format_journal_entry(alert: &AlertInfo) -> String {
        let prefix = if alert.is_reminder { "REMINDER: " } else { "" };

        let mut lines = vec![
            format!("**{prefix}IPMI Move Detected**"),
            String::new(),
            "| Field | Value |".to_string(),
            "|:------|:------|".to_string(),
            format!("| IPMI MAC | `{}` |", alert.mac_address),
            format!(
                "| IPMI IP | {} |",
                alert.ip_address.as_deref().unwrap_or("N/A")
            ),
            format!(
                "| Expected (NetBox) | {}:{} |",
                alert.expected_switch, alert.expected_port
            ),
            format!(
                "| Observed (FDB) | {}:{} |",
                alert.observed_switch, alert.observed_port
            ),
        ];

        if let Some(vlan) = alert.observed_vlan {
            lines.push(format!("| Observed VLAN | {vlan} |"));
        }

        lines.extend([
            format!("| Consecutive Observations | {} |", alert.consecutive_count),
            format!(
                "| First Detected | {} |",
                alert.first_detected.format("%Y-%m-%d %H:%M UTC")
            ),
            String::new(),
            "---".to_string(),
            "_Detected by the IPMI move auditor_".to_string(),
        ]);

        lines.join("\n")
    }

    async fn create_journal_entry(&self, device_id: i64, comments: &str, kind: &str) -> Result<()> {
        let url = format!("{}/api/extras/journal-entries/", self.base_url);
        let payload = serde_json::json!({
            "assigned_object_type": "dcim.device",
            "assigned_object_id": device_id,
            "kind": kind,
            "comments": comments,
        });

        retry_async(
            POST_ATTEMPTS,
            POST_BACKOFF_MIN,
            POST_BACKOFF_MAX,
            "Journal entry creation",
            || async {
                let response = self
                    .http
                    .post(&url)
                    .header(reqwest::header::AUTHORIZATION, &self.auth_header)
                    .json(&payload)
                    .send()
                    .await
                    .with_context(|| format!("POST {url} failed"))?;
                let status = response.status();
                if status != reqwest::StatusCode::CREATED {
                    let body = response.text().await.unwrap_or_default();
                    bail!("POST {url} returned {status}: {body}");
                }
                Ok(())
            },
        )
        .await
    }

    /// Post an alert as a journal entry on the server's device.
    pub async fn send_alert(&self, device_id: i64, alert: &AlertInfo) -> Result<()> {
        let comments = Self::format_journal_entry(alert);
        let kind = if alert.is_reminder { "info" } else { "warning" };

        self.create_journal_entry(device_id, &comments, kind).await?;
        log::info!(
            "Journal entry created for {} (reminder: {})",
            alert.server_name,
            alert.is_reminder
        );
        Ok(())
    }

    /// Startup announcement; a log line only.
    pub fn send_startup_notification(&self) {
        log::info!("IPMI move auditor started");
    }

    /// Error report; a log line only.
    pub fn send_error_notification(&self, error_message: &str) {
        log::error!("Auditor error: {error_message}");
    }
}
