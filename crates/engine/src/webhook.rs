//! Alertmanager webhook ingress.
//!
//! External alerts enter the same rule → executor pipeline as the watch
//! loop's own detections. The endpoint acknowledges the batch immediately
//! and processes it asynchronously. Firing alerts never touch the watch
//! loop's known-issues set; Alertmanager owns their lifecycle.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::event::{ClusterEvent, EventKind, Severity};
use crate::pipeline::Pipeline;

/// Alertmanager webhook payload.
///
/// Reference: <https://prometheus.io/docs/alerting/latest/configuration/#webhook_config>
///
/// Parsing is lenient: only the alert list is essential; everything else
/// defaults so unknown senders cannot crash the endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertmanagerPayload {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub group_key: String,
    /// Status of the group: "firing" or "resolved"
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub receiver: String,
    #[serde(default)]
    pub alerts: Vec<AlertmanagerAlert>,
}

/// Individual alert within a batch.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertmanagerAlert {
    /// "firing" or "resolved"
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    #[serde(default)]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub fingerprint: String,
}

impl AlertmanagerAlert {
    /// The alertname label.
    #[must_use]
    pub fn name(&self) -> &str {
        self.labels.get("alertname").map_or("unknown", String::as_str)
    }

    /// Whether this alert is firing.
    #[must_use]
    pub fn is_firing(&self) -> bool {
        self.status == "firing"
    }
}

/// Convert one firing alert into a cluster event.
///
/// Resource identity comes from labels with precedence
/// `pod` > `deployment` > `node`; missing labels leave the fields empty.
/// Every firing alert maps to `Critical`.
#[must_use]
pub fn event_from_alert(alert: &AlertmanagerAlert) -> ClusterEvent {
    let namespace = alert.labels.get("namespace").cloned().unwrap_or_default();
    let (resource_kind, resource_name) = if let Some(pod) = alert.labels.get("pod") {
        ("Pod".to_string(), pod.clone())
    } else if let Some(deployment) = alert.labels.get("deployment") {
        ("Deployment".to_string(), deployment.clone())
    } else if let Some(node) = alert.labels.get("node") {
        ("Node".to_string(), node.clone())
    } else {
        (String::new(), String::new())
    };

    let summary = alert
        .annotations
        .get("summary")
        .cloned()
        .unwrap_or_else(|| format!("Alert {} is firing", alert.name()));

    ClusterEvent::new(
        EventKind::AlertmanagerFiring,
        Severity::Critical,
        resource_kind,
        namespace,
        resource_name,
        summary,
    )
    .with_annotations(
        alert
            .labels
            .iter()
            .chain(alert.annotations.iter())
            .map(|(k, v)| (k.clone(), v.clone())),
    )
}

/// Acknowledgement returned as soon as a batch is accepted.
#[derive(Debug, Serialize)]
struct AcceptedResponse {
    status: &'static str,
}

/// Build the webhook router.
pub fn webhook_router(pipeline: Arc<Pipeline>) -> Router {
    Router::new()
        .route("/api/webhook/alertmanager", post(alertmanager_handler))
        .with_state(pipeline)
}

/// Alertmanager webhook handler: accept now, dispatch asynchronously.
async fn alertmanager_handler(
    State(pipeline): State<Arc<Pipeline>>,
    Json(payload): Json<AlertmanagerPayload>,
) -> impl IntoResponse {
    let firing: Vec<AlertmanagerAlert> = payload
        .alerts
        .into_iter()
        .filter(AlertmanagerAlert::is_firing)
        .collect();
    info!(
        firing = firing.len(),
        receiver = %payload.receiver,
        "Received Alertmanager webhook"
    );

    tokio::spawn(async move {
        for alert in firing {
            let event = event_from_alert(&alert);
            pipeline.dispatch(event).await;
        }
    });

    (StatusCode::OK, Json(AcceptedResponse { status: "accepted" }))
}
