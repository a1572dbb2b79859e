//! Best-effort realtime notification. Publishes a `stock.changed` event to an
//! HTTP endpoint after the batch commits; failures are logged and counted but
//! never affect the sync response.

use std::env;
use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct PublishMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    pub source: &'static str,
}

#[derive(Clone)]
pub struct RealtimePublisher {
    client: Client,
    publish_url: Option<String>,
    secret: Option<String>,
}

impl RealtimePublisher {
    /// Reads REALTIME_PUBLISH_URL / REALTIME_SECRET / REALTIME_TIMEOUT_SECS.
    /// With no URL configured the publisher is a no-op.
    pub fn from_env() -> Self {
        let publish_url = env::var("REALTIME_PUBLISH_URL").ok().filter(|v| !v.is_empty());
        let secret = env::var("REALTIME_SECRET").ok().filter(|v| !v.is_empty());
        let timeout_secs = env::var("REALTIME_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(1)
            .max(1);
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .expect("failed to build realtime http client");
        RealtimePublisher { client, publish_url, secret }
    }

    pub fn disabled() -> Self {
        RealtimePublisher { client: Client::new(), publish_url: None, secret: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.publish_url.is_some()
    }

    pub async fn stock_changed(
        &self,
        product_ids: &[Uuid],
        meta: &PublishMeta,
    ) -> Result<(), reqwest::Error> {
        let Some(url) = self.publish_url.as_deref() else {
            return Ok(());
        };
        if product_ids.is_empty() {
            return Ok(());
        }
        let body = json!({
            "event": "stock.changed",
            "data": {
                "product_ids": product_ids,
                "at": Utc::now().to_rfc3339(),
                "meta": meta,
            },
        });
        let mut req = self.client.post(url).json(&body);
        if let Some(secret) = &self.secret {
            req = req.bearer_auth(secret);
        }
        req.send().await?.error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_publisher_is_a_no_op() {
        let publisher = RealtimePublisher::disabled();
        assert!(!publisher.is_enabled());
        let meta = PublishMeta { sync_id: None, device_id: None, user_id: None, source: "sync" };
        publisher
            .stock_changed(&[Uuid::new_v4()], &meta)
            .await
            .expect("no-op publish must not error");
    }

    #[test]
    fn meta_omits_absent_fields() {
        let meta = PublishMeta { sync_id: None, device_id: None, user_id: None, source: "sync" };
        let v = serde_json::to_value(&meta).unwrap();
        assert_eq!(v, serde_json::json!({"source": "sync"}));
    }
}
