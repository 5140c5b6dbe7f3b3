use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

use super::service::EntitlementService;

/// Normalized billing-provider signal. Only two events reach this core; the
/// rest of the provider's vocabulary is billing-integration concern and stays
/// outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentEvent {
    Succeeded { account_id: i32 },
    Failed { account_id: i32 },
}

/// key: billing-adapter -> provider integration
#[async_trait]
pub trait BillingProviderAdapter: Send + Sync {
    fn event(&self, payload: &Value) -> Result<PaymentEvent>;

    async fn apply(
        &self,
        service: &EntitlementService,
        payload: Value,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match self.event(&payload)? {
            PaymentEvent::Succeeded { account_id } => {
                service.payment_succeeded(account_id).await?
            }
            PaymentEvent::Failed { account_id } => {
                service.payment_failed(account_id, now).await?
            }
        }
        Ok(())
    }
}

/// key: billing-adapter-stripe -> webhook payload mapping
pub struct StripeLikeAdapter;

#[async_trait]
impl BillingProviderAdapter for StripeLikeAdapter {
    fn event(&self, payload: &Value) -> Result<PaymentEvent> {
        let kind = payload
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("event type missing"))?;
        let account_id = payload
            .get("account_id")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| anyhow!("account_id missing"))?;
        let account_id = i32::try_from(account_id).map_err(|_| anyhow!("account_id out of range"))?;

        match kind {
            "payment_succeeded" => Ok(PaymentEvent::Succeeded { account_id }),
            "payment_failed" => Ok(PaymentEvent::Failed { account_id }),
            other => Err(anyhow!("unsupported event type {other}")),
        }
    }
}

/// Verify the provider's HMAC-SHA256 signature over the raw request body.
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC can use any key length");
    mac.update(body);
    let expected = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));
    expected == signature
}
