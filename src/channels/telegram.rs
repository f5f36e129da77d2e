//! Telegram publisher — posts and edits orders through the Bot API.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::error::PublishError;
use crate::pipeline::types::{ChannelPublisher, PostRef};

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Bot API envelope shared by every method.
#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

/// Publishes through a Telegram bot that is an admin of the target channel.
pub struct TelegramPublisher {
    bot_token: SecretString,
    api_base: String,
    client: reqwest::Client,
}

impl TelegramPublisher {
    pub fn new(bot_token: SecretString) -> Self {
        Self {
            bot_token,
            api_base: DEFAULT_API_BASE.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Point the publisher at a different Bot API server.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.api_base,
            self.bot_token.expose_secret()
        )
    }

    async fn call(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, PublishError> {
        let resp = self
            .client
            .post(self.api_url(method))
            .json(&body)
            .send()
            .await
            .map_err(|e| PublishError::Transient {
                // Strip the URL so the token never reaches the logs.
                reason: format!("{method}: {}", e.without_url()),
                retry_after: None,
            })?;

        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();
        let parsed = serde_json::from_str::<ApiResponse>(&text).ok();
        classify(method, status, parsed)
    }
}

/// Map a Bot API reply onto success or a retry class.
fn classify(
    method: &str,
    status: u16,
    response: Option<ApiResponse>,
) -> Result<serde_json::Value, PublishError> {
    let Some(response) = response else {
        let reason = format!("{method}: HTTP {status} with unreadable body");
        return if status == 429 || status >= 500 || (200..300).contains(&status) {
            Err(PublishError::Transient {
                reason,
                retry_after: None,
            })
        } else {
            Err(PublishError::Permanent { reason })
        };
    };

    if response.ok {
        return Ok(response.result.unwrap_or(serde_json::Value::Null));
    }

    let description = response.description.unwrap_or_default();
    if description
        .to_ascii_lowercase()
        .contains("message is not modified")
    {
        return Ok(serde_json::Value::Null);
    }

    let reason = format!("{method}: HTTP {status}: {description}");
    if status == 429 || status >= 500 {
        Err(PublishError::Transient {
            reason,
            retry_after: response
                .parameters
                .and_then(|p| p.retry_after)
                .map(Duration::from_secs),
        })
    } else {
        Err(PublishError::Permanent { reason })
    }
}

/// Numeric ids go over the wire as numbers, `@channel` names as strings.
fn chat_id_value(target: &str) -> serde_json::Value {
    match target.trim().parse::<i64>() {
        Ok(id) => serde_json::Value::from(id),
        Err(_) => serde_json::Value::from(target.trim()),
    }
}

#[async_trait]
impl ChannelPublisher for TelegramPublisher {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn publish_new(&self, target: &str, text: &str) -> Result<PostRef, PublishError> {
        let body = serde_json::json!({
            "chat_id": chat_id_value(target),
            "text": text,
            "disable_web_page_preview": true,
        });
        let result = self.call("sendMessage", body).await?;
        let message_id = result
            .get("message_id")
            .and_then(serde_json::Value::as_i64)
            .ok_or_else(|| PublishError::Permanent {
                reason: "sendMessage: response has no message_id".into(),
            })?;

        tracing::debug!(target_chat = target, message_id, "Telegram post sent");
        Ok(PostRef {
            chat: target.to_string(),
            message_id,
        })
    }

    async fn edit_existing(&self, post: &PostRef, text: &str) -> Result<(), PublishError> {
        let body = serde_json::json!({
            "chat_id": chat_id_value(&post.chat),
            "message_id": post.message_id,
            "text": text,
            "disable_web_page_preview": true,
        });
        self.call("editMessageText", body).await?;
        tracing::debug!(target_chat = %post.chat, message_id = post.message_id, "Telegram post edited");
        Ok(())
    }

    async fn reply(&self, chat_id: i64, message_id: i64, text: &str) -> Result<(), PublishError> {
        let body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "reply_to_message_id": message_id,
        });
        self.call("sendMessage", body).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Option<ApiResponse> {
        serde_json::from_str(json).ok()
    }

    #[test]
    fn api_url_uses_token_and_base() {
        let publisher = TelegramPublisher::new(SecretString::from("123:abc"))
            .with_api_base("http://localhost:8081/");
        assert_eq!(
            publisher.api_url("sendMessage"),
            "http://localhost:8081/bot123:abc/sendMessage"
        );
    }

    #[test]
    fn success_returns_result() {
        let result = classify(
            "sendMessage",
            200,
            parse(r#"{"ok": true, "result": {"message_id": 42}}"#),
        )
        .unwrap();
        assert_eq!(result["message_id"], 42);
    }

    #[test]
    fn flood_wait_is_transient_with_retry_after() {
        let err = classify(
            "sendMessage",
            429,
            parse(
                r#"{"ok": false, "error_code": 429, "description": "Too Many Requests: retry after 7", "parameters": {"retry_after": 7}}"#,
            ),
        )
        .unwrap_err();
        match err {
            PublishError::Transient { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_secs(7)));
            }
            other => panic!("expected transient, got {other:?}"),
        }
    }

    #[test]
    fn server_errors_are_transient() {
        let err = classify(
            "sendMessage",
            502,
            parse(r#"{"ok": false, "description": "Bad Gateway"}"#),
        )
        .unwrap_err();
        assert!(err.is_transient());

        let err = classify("sendMessage", 503, None).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn client_errors_are_permanent() {
        let err = classify(
            "sendMessage",
            403,
            parse(r#"{"ok": false, "description": "Forbidden: bot is not a member of the channel chat"}"#),
        )
        .unwrap_err();
        assert!(!err.is_transient());

        let err = classify("sendMessage", 400, None).unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn unmodified_edit_is_success() {
        let result = classify(
            "editMessageText",
            400,
            parse(
                r#"{"ok": false, "description": "Bad Request: message is not modified: specified new message content and reply markup are exactly the same"}"#,
            ),
        );
        assert!(result.is_ok());
    }

    #[test]
    fn chat_ids_keep_their_wire_type() {
        assert_eq!(chat_id_value("-1001234"), serde_json::json!(-1001234));
        assert_eq!(chat_id_value("@taxi_orders"), serde_json::json!("@taxi_orders"));
    }
}
