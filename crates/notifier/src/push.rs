//! Web Push delivery.
//!
//! Messages are encrypted (aes128gcm) and VAPID-signed with the `web-push`
//! crate, then posted with `reqwest` so the worker sees the raw status code.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use web_push::{
    ContentEncoding, PartialVapidSignatureBuilder, SubscriptionInfo, URL_SAFE_NO_PAD as VAPID_KEY_ENCODING,
    VapidSignatureBuilder, WebPushMessageBuilder,
};

use transit_common::error::AppError;
use transit_common::types::PushPayload;

/// Status a push service returns when it accepted the message.
pub const PUSH_CREATED: u16 = 201;

/// How long the push service may hold an undelivered message (24 h).
const PUSH_TTL_SECS: u32 = 24 * 60 * 60;

/// Raw response from the push service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendResult {
    pub status: u16,
    pub body: String,
}

impl SendResult {
    pub fn is_created(&self) -> bool {
        self.status == PUSH_CREATED
    }
}

/// Delivers a payload to a browser push subscription.
#[async_trait]
pub trait PushGateway: Send + Sync {
    /// `subscription` is the opaque descriptor stored with the notification.
    async fn send(
        &self,
        subscription: &serde_json::Value,
        payload: &PushPayload,
    ) -> Result<SendResult, AppError>;
}

/// VAPID-authenticated Web Push client.
pub struct WebPushGateway {
    http: reqwest::Client,
    vapid: PartialVapidSignatureBuilder,
    contact: String,
}

impl WebPushGateway {
    /// Build a gateway from the VAPID key pair.
    ///
    /// Both keys are unpadded base64url, the encoding browsers expect for
    /// `applicationServerKey`. `public_key` must be the key derived from
    /// `private_key`; browsers were subscribed with it, so a mismatch would
    /// make every send fail.
    pub fn new(
        public_key: &str,
        private_key: &str,
        email: &str,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        let vapid = VapidSignatureBuilder::from_base64_no_sub(private_key.trim(), VAPID_KEY_ENCODING)
            .map_err(|e| AppError::Config(format!("Invalid VAPID private key: {}", e)))?;

        let derived = URL_SAFE_NO_PAD.encode(vapid.get_public_key());
        if derived != public_key.trim().trim_end_matches('=') {
            return Err(AppError::Config(
                "VAPID_PUBLIC_KEY does not match VAPID_PRIVATE_KEY".to_string(),
            ));
        }

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Internal(format!("Unable to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            vapid,
            contact: vapid_contact(email),
        })
    }
}

/// VAPID `sub` claim for a contact address.
fn vapid_contact(email: &str) -> String {
    let email = email.trim();
    if email.starts_with("mailto:") || email.starts_with("https:") {
        email.to_string()
    } else {
        format!("mailto:{}", email)
    }
}

#[async_trait]
impl PushGateway for WebPushGateway {
    async fn send(
        &self,
        subscription: &serde_json::Value,
        payload: &PushPayload,
    ) -> Result<SendResult, AppError> {
        let info: SubscriptionInfo = serde_json::from_value(subscription.clone())
            .map_err(|e| AppError::Validation(format!("Invalid push subscription: {}", e)))?;
        let content = serde_json::to_vec(payload)?;

        let mut signature = self.vapid.clone().add_sub_info(&info);
        signature.add_claim("sub", self.contact.clone());
        let signature = signature
            .build()
            .map_err(|e| AppError::Validation(format!("Unable to sign push message: {}", e)))?;

        let mut builder = WebPushMessageBuilder::new(&info);
        builder.set_ttl(PUSH_TTL_SECS);
        builder.set_payload(ContentEncoding::Aes128Gcm, &content);
        builder.set_vapid_signature(signature);
        let message = builder
            .build()
            .map_err(|e| AppError::Validation(format!("Unable to encrypt push message: {}", e)))?;

        let mut request = self
            .http
            .post(message.endpoint.to_string())
            .header("TTL", message.ttl.to_string());

        if let Some(encrypted) = message.payload {
            request = request
                .header(CONTENT_ENCODING, encrypted.content_encoding.to_str())
                .header(CONTENT_TYPE, "application/octet-stream");
            for (name, value) in encrypted.crypto_headers {
                request = request.header(name, value);
            }
            request = request.body(encrypted.content);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AppError::UpstreamUnavailable(format!("Push endpoint unreachable: {}", e)))?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();

        Ok(SendResult { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vapid_contact_adds_mailto() {
        assert_eq!(vapid_contact("ops@example.com"), "mailto:ops@example.com");
        assert_eq!(vapid_contact("mailto:ops@example.com"), "mailto:ops@example.com");
        assert_eq!(vapid_contact("https://example.com/contact"), "https://example.com/contact");
    }

    #[test]
    fn test_only_201_counts_as_delivered() {
        assert!(SendResult { status: 201, body: String::new() }.is_created());
        assert!(!SendResult { status: 200, body: String::new() }.is_created());
        assert!(!SendResult { status: 410, body: "Gone".into() }.is_created());
    }

    // P-256 key pair, unpadded base64url
    const PRIVATE_KEY: &str = "-IbZ1nf9HFm1I97vC4lFHUVZ3eEiuDqfRU08RakhtEY";
    const PUBLIC_KEY: &str =
        "BL39ISUi3eMXWCk4s-RiTYrqww0X63wiRKBO4UiF4EyML38Ke9XU_kOasRoO3n1INaOjg4KpwaWmQrGALN-fKjI";

    #[test]
    fn test_gateway_accepts_matching_key_pair() {
        let gateway =
            WebPushGateway::new(PUBLIC_KEY, PRIVATE_KEY, "ops@example.com", Duration::from_secs(1))
                .unwrap();
        assert_eq!(gateway.contact, "mailto:ops@example.com");
        assert_eq!(URL_SAFE_NO_PAD.encode(gateway.vapid.get_public_key()), PUBLIC_KEY);
    }

    #[test]
    fn test_gateway_accepts_padded_public_key() {
        let padded = format!("{}=", PUBLIC_KEY);
        assert!(WebPushGateway::new(&padded, PRIVATE_KEY, "ops@example.com", Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn test_gateway_rejects_mismatched_public_key() {
        let other = "BNcRdreALRFXTkOOUHK1EtK2wtaz5Ry4YfYCA_0QTpQtUbVlUls0VJXg7A8u-Ts1XbjhazAkj7I99e8QcYP7DkM";
        let result = WebPushGateway::new(other, PRIVATE_KEY, "ops@example.com", Duration::from_secs(1));
        assert!(matches!(result, Err(AppError::Config(msg)) if msg.contains("does not match")));
    }

    #[test]
    fn test_gateway_rejects_invalid_private_key() {
        let result = WebPushGateway::new("pub", "not-a-key", "ops@example.com", Duration::from_secs(1));
        assert!(matches!(result, Err(AppError::Config(_))));
    }
}
