//! Webhook dispatcher: POSTs every bus event to a configured endpoint with
//! an HMAC-SHA256 body signature, retrying for at-least-once delivery.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio_util::sync::CancellationToken;

use super::EventBus;

type HmacSha256 = Hmac<Sha256>;

const DELIVERY_ATTEMPTS: u32 = 3;
const RETRY_DELAY_MS: u64 = 500;

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: String,
    /// Shared secret for the `X-Spindle-Signature` header.
    pub secret: String,
}

pub struct WebhookDispatcher;

impl WebhookDispatcher {
    /// Subscribe to the bus and deliver events until the token cancels.
    pub fn spawn(bus: &EventBus, config: WebhookConfig, shutdown: CancellationToken) {
        let mut receiver = bus.subscribe_all();
        let client = reqwest::Client::new();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = receiver.recv() => match received {
                        Ok(event) => event,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, url = %config.url, "webhook subscriber lagged");
                            continue;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                };

                let Ok(body) = serde_json::to_vec(&event) else {
                    continue;
                };
                let signature = sign(&config.secret, &body);

                for attempt in 1..=DELIVERY_ATTEMPTS {
                    let result = client
                        .post(&config.url)
                        .header("content-type", "application/json")
                        .header("X-Spindle-Signature", &signature)
                        .body(body.clone())
                        .send()
                        .await;
                    match result {
                        Ok(response) if response.status().is_success() => break,
                        Ok(response) => {
                            tracing::warn!(
                                url = %config.url,
                                status = %response.status(),
                                attempt,
                                "webhook delivery rejected"
                            );
                        }
                        Err(e) => {
                            tracing::warn!(url = %config.url, error = %e, attempt, "webhook delivery failed");
                        }
                    }
                    if attempt < DELIVERY_ATTEMPTS {
                        tokio::time::sleep(std::time::Duration::from_millis(
                            RETRY_DELAY_MS * attempt as u64,
                        ))
                        .await;
                    }
                }
            }
            tracing::debug!(url = %config.url, "webhook dispatcher stopped");
        });
    }
}

fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(body);
    hex_encode(&mac.finalize().into_bytes())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic_hex() {
        let a = sign("secret", b"payload");
        let b = sign("secret", b"payload");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(sign("other", b"payload"), a);
    }
}
