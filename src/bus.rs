//! Message-bus gateway: channel subscribers and message delivery.
//!
//! The bus is addressed purely by channel identifiers derived from visitor and
//! staff ids. Delivery guarantees are the bus's own business; callers treat
//! every call here as best-effort once durable state has been written.

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{HandoffError, Result};

/// Channel type used for visitor/staff customer-service conversations.
pub const CUSTOMER_SERVICE_CHANNEL_TYPE: u8 = 251;
pub const SYSTEM_UID: &str = "system";

pub fn visitor_channel_id(visitor_id: Uuid) -> String {
    format!("cs_{visitor_id}")
}

pub fn staff_uid(staff_id: Uuid) -> String {
    format!("{staff_id}-staff")
}

pub fn visitor_uid(visitor_id: Uuid) -> String {
    format!("{visitor_id}-vtr")
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn create_or_update_channel(
        &self,
        channel_id: &str,
        channel_type: u8,
        subscribers: &[String],
    ) -> Result<()>;

    async fn add_subscribers(
        &self,
        channel_id: &str,
        channel_type: u8,
        subscribers: &[String],
    ) -> Result<()>;

    async fn remove_subscribers(
        &self,
        channel_id: &str,
        channel_type: u8,
        subscribers: &[String],
    ) -> Result<()>;

    async fn send_text_message(
        &self,
        from_uid: &str,
        channel_id: &str,
        channel_type: u8,
        content: &str,
    ) -> Result<()>;
}

/// HTTP client for a WuKongIM server.
pub struct WuKongImBus {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl WuKongImBus {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    async fn post(&self, path: &str, body: Value) -> Result<()> {
        let mut request = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(&body);
        if !self.api_key.is_empty() {
            request = request.header("token", &self.api_key);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(HandoffError::upstream(
                "message bus",
                format!("{path} returned {status}: {text}"),
            ));
        }
        Ok(())
    }
}

/// Encodes a plain-text message body the way bus clients expect it.
pub fn text_payload(content: &str) -> String {
    let body = json!({ "type": 1, "content": content });
    STANDARD.encode(body.to_string())
}

#[async_trait]
impl MessageBus for WuKongImBus {
    async fn create_or_update_channel(
        &self,
        channel_id: &str,
        channel_type: u8,
        subscribers: &[String],
    ) -> Result<()> {
        self.post(
            "/channel",
            json!({
                "channel_id": channel_id,
                "channel_type": channel_type,
                "subscribers": subscribers,
            }),
        )
        .await
    }

    async fn add_subscribers(
        &self,
        channel_id: &str,
        channel_type: u8,
        subscribers: &[String],
    ) -> Result<()> {
        self.post(
            "/channel/subscriber_add",
            json!({
                "channel_id": channel_id,
                "channel_type": channel_type,
                "reset": 0,
                "subscribers": subscribers,
            }),
        )
        .await
    }

    async fn remove_subscribers(
        &self,
        channel_id: &str,
        channel_type: u8,
        subscribers: &[String],
    ) -> Result<()> {
        self.post(
            "/channel/subscriber_remove",
            json!({
                "channel_id": channel_id,
                "channel_type": channel_type,
                "subscribers": subscribers,
            }),
        )
        .await
    }

    async fn send_text_message(
        &self,
        from_uid: &str,
        channel_id: &str,
        channel_type: u8,
        content: &str,
    ) -> Result<()> {
        self.post(
            "/message/send",
            json!({
                "header": { "no_persist": 0, "red_dot": 1, "sync_once": 0 },
                "from_uid": from_uid,
                "channel_id": channel_id,
                "channel_type": channel_type,
                "payload": text_payload(content),
            }),
        )
        .await
    }
}
