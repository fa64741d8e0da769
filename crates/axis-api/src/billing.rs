use std::collections::HashMap;

use axum::{Json, body::Bytes, extract::State, http::HeaderMap, response::IntoResponse};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use axis_db::billing::{SubscriptionUpdate, WebhookOutcome};
use axis_types::api::WebhookAck;

use crate::auth::AppState;
use crate::blocking;
use crate::error::ApiError;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "stripe-signature";
/// Accepted clock skew between the signer and us, in seconds.
pub const TOLERANCE_SECS: i64 = 300;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("missing signature header")]
    Missing,
    #[error("malformed signature header")]
    Malformed,
    #[error("timestamp outside tolerance")]
    Stale,
    #[error("signature mismatch")]
    Mismatch,
}

/// Checks a `t=<unix>,v1=<hex>` header against HMAC-SHA256 of `"<t>.<body>"`.
/// Any of several `v1` entries may match.
pub fn verify_signature(
    secret: &str,
    header: &str,
    body: &[u8],
    now_unix: i64,
) -> Result<(), SignatureError> {
    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<Vec<u8>> = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", v)) => timestamp = Some(v.parse().map_err(|_| SignatureError::Malformed)?),
            Some(("v1", v)) => candidates.push(hex::decode(v).map_err(|_| SignatureError::Malformed)?),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
    if candidates.is_empty() {
        return Err(SignatureError::Malformed);
    }
    if (now_unix - timestamp).abs() > TOLERANCE_SECS {
        return Err(SignatureError::Stale);
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::Malformed)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);

    // verify_slice compares in constant time
    if candidates
        .iter()
        .any(|sig| mac.clone().verify_slice(sig).is_ok())
    {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

#[derive(Debug, Deserialize)]
struct WebhookEvent {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    data: EventData,
}

#[derive(Debug, Deserialize)]
struct EventData {
    object: EventObject,
}

#[derive(Debug, Deserialize)]
struct EventObject {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
    #[serde(default)]
    plan: Option<PlanRef>,
}

#[derive(Debug, Deserialize)]
struct PlanRef {
    id: String,
}

/// What an event does to the user's subscription row.
#[derive(Debug, PartialEq, Eq)]
enum BillingEvent {
    SubscriptionChanged { status: String, plan: Option<String> },
    SubscriptionDeleted,
    CheckoutCompleted,
    Ignored,
}

impl BillingEvent {
    fn from_parts(kind: &str, object: &EventObject) -> Self {
        let plan = object.plan.as_ref().map(|p| p.id.clone());
        match kind {
            "customer.subscription.created" | "customer.subscription.updated" => Self::SubscriptionChanged {
                status: object.status.clone().unwrap_or_else(|| "active".into()),
                plan,
            },
            "customer.subscription.deleted" => Self::SubscriptionDeleted,
            "checkout.session.completed" => Self::CheckoutCompleted,
            _ => Self::Ignored,
        }
    }

    /// (status, plan) to write, if any.
    fn update(self) -> Option<(String, Option<String>)> {
        match self {
            Self::SubscriptionChanged { status, plan } => Some((status, plan)),
            Self::SubscriptionDeleted => Some(("canceled".into(), None)),
            Self::CheckoutCompleted => Some(("active".into(), None)),
            Self::Ignored => None,
        }
    }
}

pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let Some(secret) = state.webhook_secret.as_deref() else {
        error!("Billing webhook called but AXIS_WEBHOOK_SECRET is not set");
        return Err(ApiError::Internal(anyhow::anyhow!("webhook secret not configured")));
    };

    let header = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(SignatureError::Missing);
    if let Err(e) = header.and_then(|h| verify_signature(secret, h, &body, chrono::Utc::now().timestamp())) {
        warn!("Rejected billing webhook: {}", e);
        return Err(ApiError::BadRequest(e.to_string()));
    }

    let event: WebhookEvent = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid event payload: {}", e)))?;

    let user_id = event
        .data
        .object
        .metadata
        .get("user_id")
        .and_then(|raw| raw.parse::<Uuid>().ok());
    let change = match (user_id, BillingEvent::from_parts(&event.kind, &event.data.object).update()) {
        (Some(uid), Some((status, plan))) => Some((uid.to_string(), status, plan)),
        _ => None,
    };
    let wants_update = change.is_some();
    let (event_id, kind) = (event.id, event.kind);

    let (id, event_kind) = (event_id.clone(), kind.clone());
    let outcome = blocking(&state, move |db| {
        let update = change.as_ref().map(|(user_id, status, plan)| SubscriptionUpdate {
            user_id: user_id.as_str(),
            status: status.as_str(),
            plan: plan.as_deref(),
        });
        db.apply_webhook_event(&id, &event_kind, update)
    })
    .await?;

    match outcome {
        WebhookOutcome::Duplicate => debug!("Billing event {} already processed", event_id),
        WebhookOutcome::Recorded if wants_update => {
            warn!("Billing event {} ({}) names unknown user {:?}", event_id, kind, user_id)
        }
        WebhookOutcome::Recorded => info!("Billing event {} ({}) recorded, nothing to apply", event_id, kind),
        WebhookOutcome::Applied => info!("Billing event {} ({}) applied", event_id, kind),
    }
    let duplicate = outcome == WebhookOutcome::Duplicate;
    Ok(Json(WebhookAck {
        received: true,
        duplicate,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, t: i64, body: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{}.{}", t, body).as_bytes());
        format!("t={},v1={}", t, hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn accepts_valid_signature() {
        let header = sign("whsec", 1_700_000_000, "{}");
        assert_eq!(verify_signature("whsec", &header, b"{}", 1_700_000_100), Ok(()));
    }

    #[test]
    fn rejects_tampered_body() {
        let header = sign("whsec", 1_700_000_000, r#"{"a":1}"#);
        assert_eq!(
            verify_signature("whsec", &header, br#"{"a":2}"#, 1_700_000_000),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn rejects_stale_timestamp() {
        let header = sign("whsec", 1_700_000_000, "{}");
        assert_eq!(
            verify_signature("whsec", &header, b"{}", 1_700_000_000 + TOLERANCE_SECS + 1),
            Err(SignatureError::Stale)
        );
    }

    #[test]
    fn rejects_malformed_header() {
        assert_eq!(verify_signature("whsec", "v1=zz", b"{}", 0), Err(SignatureError::Malformed));
        assert_eq!(verify_signature("whsec", "t=5", b"{}", 5), Err(SignatureError::Malformed));
    }

    #[test]
    fn any_v1_entry_may_match() {
        let good = sign("whsec", 10, "{}");
        let v1 = good.split(",v1=").nth(1).unwrap();
        let header = format!("t=10,v1={},v1={}", "00".repeat(32), v1);
        assert_eq!(verify_signature("whsec", &header, b"{}", 10), Ok(()));
    }

    #[test]
    fn deleted_subscription_cancels() {
        let object = EventObject {
            status: Some("active".into()),
            metadata: HashMap::new(),
            plan: None,
        };
        let action = BillingEvent::from_parts("customer.subscription.deleted", &object);
        assert_eq!(action.update(), Some(("canceled".to_string(), None)));
        assert_eq!(BillingEvent::from_parts("invoice.paid", &object).update(), None);
    }
}
