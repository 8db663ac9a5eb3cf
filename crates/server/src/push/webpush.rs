//! Web-push delivery.
//!
//! Message encryption and VAPID signing come from the `web-push` crate; the
//! encrypted request is sent with the host's shared `reqwest` client.

use async_trait::async_trait;
use web_push::{
    ContentEncoding, SubscriptionInfo, VapidSignatureBuilder, WebPushMessageBuilder,
};

use super::store::PushSubscription;
use super::vapid::VapidKeys;
use super::PushError;

const DEFAULT_TTL_SECS: u32 = 24 * 60 * 60;

#[async_trait]
pub trait PushSender: Send + Sync + 'static {
    /// Deliver an already-serialized payload to one subscription.
    async fn send(&self, subscription: &PushSubscription, payload: &[u8]) -> Result<(), PushError>;
}

pub struct WebPushSender {
    http: reqwest::Client,
    keys: VapidKeys,
    subject: String,
}

impl WebPushSender {
    pub fn new(http: reqwest::Client, keys: VapidKeys, subject: impl Into<String>) -> Self {
        Self {
            http,
            keys,
            subject: subject.into(),
        }
    }
}

fn encoding_error(err: impl std::fmt::Display) -> PushError {
    PushError::Encoding(err.to_string())
}

#[async_trait]
impl PushSender for WebPushSender {
    async fn send(&self, subscription: &PushSubscription, payload: &[u8]) -> Result<(), PushError> {
        let info = SubscriptionInfo::new(
            &subscription.endpoint,
            &subscription.keys.p256dh,
            &subscription.keys.auth,
        );

        let mut signature =
            VapidSignatureBuilder::from_pem(self.keys.private_key_pem.as_bytes(), &info)
                .map_err(encoding_error)?;
        signature.add_claim("sub", self.subject.as_str());
        let signature = signature.build().map_err(encoding_error)?;

        let mut builder = WebPushMessageBuilder::new(&info);
        builder.set_ttl(DEFAULT_TTL_SECS);
        builder.set_payload(ContentEncoding::Aes128Gcm, payload);
        builder.set_vapid_signature(signature);
        let message = builder.build().map_err(encoding_error)?;

        let mut request = self
            .http
            .post(message.endpoint.to_string())
            .header("TTL", message.ttl.to_string());
        if let Some(body) = message.payload {
            request = request
                .header(reqwest::header::CONTENT_ENCODING, body.content_encoding.to_str())
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream");
            for (name, value) in body.crypto_headers {
                request = request.header(name, value);
            }
            request = request.body(body.content);
        }

        let response = request
            .send()
            .await
            .map_err(|e| PushError::Transport(e.to_string()))?;
        classify_status(response.status().as_u16())
    }
}

/// 404/410 mean the push service forgot the endpoint for good.
pub fn classify_status(status: u16) -> Result<(), PushError> {
    match status {
        200..=299 => Ok(()),
        404 | 410 => Err(PushError::Gone(status)),
        _ => Err(PushError::Rejected(status)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gone_statuses_are_distinguished() {
        assert!(classify_status(201).is_ok());
        assert!(matches!(classify_status(410), Err(PushError::Gone(410))));
        assert!(matches!(classify_status(404), Err(PushError::Gone(404))));
        assert!(matches!(classify_status(429), Err(PushError::Rejected(429))));
    }
}
