//! Push delivery behind a trait; the wire mechanics live outside this
//! process, behind an HTTP gateway.

use std::time::Duration;

use crate::constants::PUSH_TIMEOUT_SECS;
use crate::{AppError, AppResult};

pub trait PushSender: Send + Sync {
    fn send(&self, device_token: &str, title: &str, body: &str) -> AppResult<()>;
}

/// Posts one JSON message per notification to the configured gateway.
pub struct GatewayPush {
    url: String,
    auth_token: Option<String>,
}

impl GatewayPush {
    pub fn new(url: String, auth_token: Option<String>) -> Self {
        Self { url, auth_token }
    }
}

impl PushSender for GatewayPush {
    fn send(&self, device_token: &str, title: &str, body: &str) -> AppResult<()> {
        let payload = serde_json::json!({
            "device_token": device_token,
            "title": title,
            "body": body,
            "badge": 1,
            "sound": "default",
        });

        let mut request = ureq::post(&self.url).header("content-type", "application/json");
        if let Some(token) = &self.auth_token {
            request = request.header("Authorization", &format!("Bearer {}", token));
        }

        request
            .config()
            .timeout_global(Some(Duration::from_secs(PUSH_TIMEOUT_SECS)))
            .build()
            .send(serde_json::to_vec(&payload)?.as_slice())
            .map_err(|e| AppError::Push(format!("Gateway call failed: {}", e)))?;
        Ok(())
    }
}

/// Installed when no gateway is configured.
pub struct DisabledPush;

impl PushSender for DisabledPush {
    fn send(&self, _device_token: &str, _title: &str, _body: &str) -> AppResult<()> {
        Err(AppError::Push("push delivery not configured".into()))
    }
}
