use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Webhook body sent by Alertmanager for one alert group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertManagerPayload {
    pub version: String,
    #[serde(rename = "groupKey")]
    pub group_key: String,
    #[serde(rename = "truncatedAlerts")]
    pub truncated_alerts: i64,
    pub status: String,
    pub receiver: String,
    #[serde(rename = "groupLabels")]
    pub group_labels: HashMap<String, String>,
    #[serde(rename = "commonLabels")]
    pub common_labels: HashMap<String, String>,
    #[serde(rename = "commonAnnotations")]
    pub common_annotations: HashMap<String, String>,
    #[serde(rename = "externalURL")]
    pub external_url: String,
    pub alerts: Vec<AlertManagerAlert>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertManagerAlert {
    pub status: String,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    #[serde(rename = "startsAt")]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(rename = "endsAt")]
    pub ends_at: Option<DateTime<Utc>>,
    #[serde(rename = "generatorURL")]
    pub generator_url: String,
    pub fingerprint: String,
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("status is required")]
    MissingStatus,
    #[error("at least one alert is required")]
    NoAlerts,
}

impl AlertManagerPayload {
    pub fn parse(body: &[u8]) -> Result<Self, PayloadError> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Minimal structural checks before the payload is used as template data.
    pub fn validate(&self) -> Result<(), PayloadError> {
        if self.status.is_empty() {
            return Err(PayloadError::MissingStatus);
        }
        if self.alerts.is_empty() {
            return Err(PayloadError::NoAlerts);
        }
        Ok(())
    }

    /// `alertname` label of the first alert, for diagnostics only.
    pub fn primary_alert_name(&self) -> &str {
        self.alerts
            .first()
            .and_then(|alert| alert.labels.get("alertname"))
            .map(String::as_str)
            .unwrap_or("")
    }
}
