//! Messaging gateways: the transport the dispatch queue sends through.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::config::WhatsAppConfig;
use crate::dispatch::model::TemplateRef;
use crate::error::GatewayError;

/// One send attempt handed to the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendCommand {
    pub contact_id: String,
    pub body: String,
    /// Set when the message must go out as a pre-approved template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<TemplateRef>,
}

/// Gateway acknowledgement of a send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

#[async_trait]
pub trait Gateway: Send + Sync {
    fn name(&self) -> &str;

    /// Perform one delivery attempt.
    async fn send(&self, command: &SendCommand) -> Result<SendReceipt, GatewayError>;
}

/// Accepts every send and only logs it. Used when no real transport is
/// configured.
#[derive(Debug, Default)]
pub struct LogGateway;

#[async_trait]
impl Gateway for LogGateway {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, command: &SendCommand) -> Result<SendReceipt, GatewayError> {
        let message_id = format!("log-{}", Uuid::new_v4());
        info!(
            contact = %command.contact_id,
            template = command.template.as_ref().map(|t| t.name.as_str()),
            message_id = %message_id,
            chars = command.body.chars().count(),
            "Outbound message (log gateway)"
        );
        Ok(SendReceipt {
            message_id: Some(message_id),
        })
    }
}

/// WhatsApp Cloud API transport.
pub struct WhatsAppCloudGateway {
    config: WhatsAppConfig,
    client: reqwest::Client,
}

impl WhatsAppCloudGateway {
    pub fn new(config: WhatsAppConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn messages_url(&self) -> String {
        format!("{}/{}/messages", self.config.api_base, self.config.phone_number_id)
    }

    fn send_failed(reason: impl Into<String>) -> GatewayError {
        GatewayError::SendFailed {
            name: "whatsapp".into(),
            reason: reason.into(),
        }
    }
}

/// Request body for the Cloud API `messages` endpoint.
pub fn build_payload(command: &SendCommand) -> serde_json::Value {
    match &command.template {
        Some(template) => serde_json::json!({
            "messaging_product": "whatsapp",
            "to": command.contact_id,
            "type": "template",
            "template": {
                "name": template.name,
                "language": { "code": template.language },
            },
        }),
        None => serde_json::json!({
            "messaging_product": "whatsapp",
            "to": command.contact_id,
            "type": "text",
            "text": { "body": command.body, "preview_url": false },
        }),
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    messages: Vec<MessageId>,
}

#[derive(Debug, Deserialize)]
struct MessageId {
    id: String,
}

#[async_trait]
impl Gateway for WhatsAppCloudGateway {
    fn name(&self) -> &str {
        "whatsapp"
    }

    async fn send(&self, command: &SendCommand) -> Result<SendReceipt, GatewayError> {
        let resp = self
            .client
            .post(self.messages_url())
            .bearer_auth(self.config.access_token.expose_secret())
            .json(&build_payload(command))
            .send()
            .await
            .map_err(|e| Self::send_failed(e.to_string()))?;

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(GatewayError::RateLimited {
                name: "whatsapp".into(),
                retry_after,
            });
        }

        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Rejected {
                name: "whatsapp".into(),
                status: status.as_u16(),
                body,
            });
        }

        let parsed: MessagesResponse = resp.json().await?;
        Ok(SendReceipt {
            message_id: parsed.messages.into_iter().next().map(|m| m.id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::Json;
    use axum::Router;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::post;
    use secrecy::SecretString;
    use tokio::sync::Mutex;

    fn text_command() -> SendCommand {
        SendCommand {
            contact_id: "628123".into(),
            body: "Halo kak".into(),
            template: None,
        }
    }

    #[test]
    fn text_payload() {
        let payload = build_payload(&text_command());
        assert_eq!(payload["type"], "text");
        assert_eq!(payload["to"], "628123");
        assert_eq!(payload["text"]["body"], "Halo kak");
    }

    #[test]
    fn template_payload() {
        let command = SendCommand {
            template: Some(TemplateRef {
                id: 7,
                name: "promo_paket".into(),
                language: "id".into(),
            }),
            ..text_command()
        };
        let payload = build_payload(&command);
        assert_eq!(payload["type"], "template");
        assert_eq!(payload["template"]["name"], "promo_paket");
        assert_eq!(payload["template"]["language"]["code"], "id");
    }

    #[tokio::test]
    async fn log_gateway_accepts_everything() {
        let receipt = LogGateway.send(&text_command()).await.unwrap();
        assert!(receipt.message_id.unwrap().starts_with("log-"));
    }

    #[derive(Clone, Default)]
    struct Mock {
        status: Arc<Mutex<u16>>,
        auth: Arc<Mutex<Option<String>>>,
    }

    async fn mock_messages(
        State(mock): State<Mock>,
        headers: HeaderMap,
        Json(_body): Json<serde_json::Value>,
    ) -> axum::response::Response {
        *mock.auth.lock().await = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        match *mock.status.lock().await {
            200 => Json(serde_json::json!({ "messages": [{ "id": "wamid.1" }] })).into_response(),
            429 => (StatusCode::TOO_MANY_REQUESTS, [("retry-after", "7")], "slow down").into_response(),
            code => (
                StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                "bad",
            )
                .into_response(),
        }
    }

    async fn start_mock(mock: Mock) -> String {
        let app = Router::new()
            .route("/{phone}/messages", post(mock_messages))
            .with_state(mock);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn gateway(api_base: String) -> WhatsAppCloudGateway {
        WhatsAppCloudGateway::new(WhatsAppConfig {
            api_base,
            phone_number_id: "1001".into(),
            access_token: SecretString::from("token-abc".to_string()),
        })
    }

    #[tokio::test]
    async fn cloud_gateway_statuses() {
        let mock = Mock::default();
        *mock.status.lock().await = 200;
        let gw = gateway(start_mock(mock.clone()).await);

        let receipt = gw.send(&text_command()).await.unwrap();
        assert_eq!(receipt.message_id.as_deref(), Some("wamid.1"));
        assert_eq!(mock.auth.lock().await.as_deref(), Some("Bearer token-abc"));

        *mock.status.lock().await = 429;
        match gw.send(&text_command()).await {
            Err(GatewayError::RateLimited { retry_after, .. }) => {
                assert_eq!(retry_after, Some(Duration::from_secs(7)));
            }
            other => panic!("expected rate limit, got {other:?}"),
        }

        *mock.status.lock().await = 400;
        match gw.send(&text_command()).await {
            Err(GatewayError::Rejected { status, body, .. }) => {
                assert_eq!(status, 400);
                assert_eq!(body, "bad");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }
}
