//! LINE Messaging API channel
//!
//! Inbound: `X-Line-Signature` verification and webhook event translation.
//! Outbound: reply/push messages and profile lookup through [`LineClient`].

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use hmac::{Hmac, Mac};
use quotagate_billing::{BillingError, BillingEvent, BillingResult, MenuCommand, ProfileSource};
use quotagate_shared::PlanTier;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::error::{ApiError, ApiResult};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-line-signature";

/// Rich-menu text that asks for the current plan
pub const MENU_STATUS: &str = "サブスクリプション";
/// Rich-menu text that asks for a checkout link
pub const MENU_SUBSCRIBE: &str = "有料プランに登録";
/// Rich-menu text that asks for the billing portal
pub const MENU_MANAGE: &str = "契約管理";

/// Check the base64 HMAC-SHA256 of the raw body against the channel secret.
pub fn verify_signature(body: &[u8], signature: &str, channel_secret: &str) -> bool {
    let Ok(provided) = STANDARD.decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(channel_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let expected = mac.finalize().into_bytes();
    expected.as_slice().ct_eq(&provided).into()
}

/// Signature header value for `body`
pub fn sign_body(body: &[u8], channel_secret: &str) -> ApiResult<String> {
    let mut mac = HmacSha256::new_from_slice(channel_secret.as_bytes())
        .map_err(|_| ApiError::Internal("invalid channel secret".to_string()))?;
    mac.update(body);
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

// =============================================================================
// Webhook payload
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct WebhookBody {
    #[serde(default)]
    pub events: Vec<WebhookEvent>,
}

#[derive(Debug, Deserialize)]
pub struct Source {
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessageContent {
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub struct Postback {
    pub data: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WebhookEvent {
    Message {
        #[serde(rename = "replyToken")]
        reply_token: Option<String>,
        source: Source,
        timestamp: i64,
        message: MessageContent,
    },
    Follow {
        #[serde(rename = "replyToken")]
        reply_token: Option<String>,
        source: Source,
        timestamp: i64,
    },
    Postback {
        #[serde(rename = "replyToken")]
        reply_token: Option<String>,
        source: Source,
        timestamp: i64,
        postback: Postback,
    },
    #[serde(other)]
    Unsupported,
}

/// A webhook event the engine consumes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub identity: String,
    pub reply_token: Option<String>,
    pub event: BillingEvent,
}

fn occurred_at(timestamp_ms: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(timestamp_ms) * 1_000_000)
        .unwrap_or_else(|_| OffsetDateTime::now_utc())
}

fn menu_command(text: &str) -> Option<MenuCommand> {
    match text.trim() {
        MENU_STATUS => Some(MenuCommand::Status),
        MENU_SUBSCRIBE => Some(MenuCommand::Subscribe(None)),
        MENU_MANAGE => Some(MenuCommand::Manage),
        _ => None,
    }
}

/// `action=subscribe[&plan=yearly]` or `action=manage`
fn postback_command(data: &str) -> Option<MenuCommand> {
    let mut action = None;
    let mut plan = None;
    for pair in data.split('&') {
        match pair.split_once('=') {
            Some(("action", value)) => action = Some(value),
            Some(("plan", value)) => plan = value.parse::<PlanTier>().ok().filter(PlanTier::is_paid),
            _ => {}
        }
    }
    match action? {
        "subscribe" => Some(MenuCommand::Subscribe(plan)),
        "manage" => Some(MenuCommand::Manage),
        "status" => Some(MenuCommand::Status),
        _ => None,
    }
}

/// Translate one LINE event; `None` for events without a user or with no engine meaning.
pub fn adapt(event: WebhookEvent) -> Option<InboundEvent> {
    let (reply_token, identity, event) = match event {
        WebhookEvent::Message {
            reply_token,
            source,
            timestamp,
            message: MessageContent::Text { text },
        } => {
            let identity = source.user_id?;
            let occurred_at = occurred_at(timestamp);
            let event = match menu_command(&text) {
                Some(command) => BillingEvent::MenuRequested {
                    identity: identity.clone(),
                    command,
                    occurred_at,
                },
                None => BillingEvent::MessageReceived {
                    identity: identity.clone(),
                    text,
                    occurred_at,
                },
            };
            (reply_token, identity, event)
        }
        WebhookEvent::Follow {
            reply_token,
            source,
            timestamp,
        } => {
            let identity = source.user_id?;
            let event = BillingEvent::Follow {
                identity: identity.clone(),
                occurred_at: occurred_at(timestamp),
            };
            (reply_token, identity, event)
        }
        WebhookEvent::Postback {
            reply_token,
            source,
            timestamp,
            postback,
        } => {
            let identity = source.user_id?;
            let Some(command) = postback_command(&postback.data) else {
                tracing::debug!(identity = %identity, data = %postback.data, "Ignoring unknown postback");
                return None;
            };
            let event = BillingEvent::MenuRequested {
                identity: identity.clone(),
                command,
                occurred_at: occurred_at(timestamp),
            };
            (reply_token, identity, event)
        }
        WebhookEvent::Message { .. } | WebhookEvent::Unsupported => return None,
    };

    Some(InboundEvent {
        identity,
        reply_token,
        event,
    })
}

// =============================================================================
// Outbound
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LineMessage {
    Text {
        text: String,
    },
    Flex {
        #[serde(rename = "altText")]
        alt_text: String,
        contents: serde_json::Value,
    },
}

impl LineMessage {
    pub fn text(text: impl Into<String>) -> Self {
        LineMessage::Text { text: text.into() }
    }
}

/// Outbound side of the chat channel
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn reply(&self, reply_token: &str, messages: Vec<LineMessage>) -> ApiResult<()>;

    async fn push(&self, to: &str, messages: Vec<LineMessage>) -> ApiResult<()>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReplyRequest<'a> {
    reply_token: &'a str,
    messages: Vec<LineMessage>,
}

#[derive(Serialize)]
struct PushRequest<'a> {
    to: &'a str,
    messages: Vec<LineMessage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Profile {
    display_name: String,
}

/// LINE Messaging API client
#[derive(Clone)]
pub struct LineClient {
    http: reqwest::Client,
    api_base: String,
    access_token: String,
}

impl LineClient {
    pub fn new(http: reqwest::Client, api_base: &str, access_token: &str) -> Self {
        Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            access_token: access_token.to_string(),
        }
    }

    async fn post<T: Serialize>(&self, path: &str, body: &T) -> ApiResult<()> {
        let response = self
            .http
            .post(format!("{}{}", self.api_base, path))
            .bearer_auth(&self.access_token)
            .json(body)
            .send()
            .await
            .map_err(|e| ApiError::Upstream(format!("line: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Upstream(format!("line {} {}: {}", path, status, body)));
        }
        Ok(())
    }
}

#[async_trait]
impl ChatTransport for LineClient {
    async fn reply(&self, reply_token: &str, messages: Vec<LineMessage>) -> ApiResult<()> {
        self.post(
            "/v2/bot/message/reply",
            &ReplyRequest {
                reply_token,
                messages,
            },
        )
        .await
    }

    async fn push(&self, to: &str, messages: Vec<LineMessage>) -> ApiResult<()> {
        self.post("/v2/bot/message/push", &PushRequest { to, messages })
            .await
    }
}

#[async_trait]
impl ProfileSource for LineClient {
    async fn display_name(&self, identity: &str) -> BillingResult<String> {
        let upstream = |message: String| BillingError::Upstream {
            dependency: "line",
            message,
        };

        let response = self
            .http
            .get(format!("{}/v2/bot/profile/{}", self.api_base, identity))
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| upstream(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(upstream(format!("profile lookup returned {}", status)));
        }

        let profile: Profile = response.json().await.map_err(|e| upstream(e.to_string()))?;
        Ok(profile.display_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    fn parse(value: serde_json::Value) -> Vec<WebhookEvent> {
        serde_json::from_value::<WebhookBody>(value).unwrap().events
    }

    #[test]
    fn test_signature_roundtrip_and_tamper() {
        let body = br#"{"events":[]}"#;
        let signature = sign_body(body, "channel-secret").unwrap();

        assert!(verify_signature(body, &signature, "channel-secret"));
        assert!(!verify_signature(body, &signature, "other-secret"));
        assert!(!verify_signature(br#"{"events":[{}]}"#, &signature, "channel-secret"));
        assert!(!verify_signature(body, "not base64!", "channel-secret"));
    }

    #[test]
    fn test_adapt_text_and_menu_messages() {
        let events = parse(json!({
            "events": [
                {
                    "type": "message",
                    "replyToken": "rt-1",
                    "timestamp": 1_743_465_600_000_i64,
                    "source": {"type": "user", "userId": "U1"},
                    "message": {"type": "text", "id": "1", "text": "Hello"}
                },
                {
                    "type": "message",
                    "replyToken": "rt-2",
                    "timestamp": 1_743_465_600_000_i64,
                    "source": {"type": "user", "userId": "U1"},
                    "message": {"type": "text", "id": "2", "text": "契約管理"}
                }
            ]
        }));

        let adapted: Vec<_> = events.into_iter().filter_map(adapt).collect();
        assert_eq!(adapted.len(), 2);
        assert!(matches!(
            &adapted[0].event,
            BillingEvent::MessageReceived { text, .. } if text == "Hello"
        ));
        assert_eq!(adapted[0].reply_token.as_deref(), Some("rt-1"));
        assert!(matches!(
            adapted[1].event,
            BillingEvent::MenuRequested {
                command: MenuCommand::Manage,
                ..
            }
        ));
    }

    #[test]
    fn test_adapt_postback_with_plan() {
        let events = parse(json!({
            "events": [{
                "type": "postback",
                "replyToken": "rt",
                "timestamp": 0,
                "source": {"type": "user", "userId": "U1"},
                "postback": {"data": "action=subscribe&plan=yearly"}
            }]
        }));

        let adapted = events.into_iter().find_map(adapt).unwrap();
        assert!(matches!(
            adapted.event,
            BillingEvent::MenuRequested {
                command: MenuCommand::Subscribe(Some(PlanTier::Yearly)),
                ..
            }
        ));
    }

    #[test]
    fn test_adapt_skips_unsupported_events() {
        let events = parse(json!({
            "events": [
                {"type": "unfollow", "timestamp": 0, "source": {"type": "user", "userId": "U1"}},
                {
                    "type": "message",
                    "replyToken": "rt",
                    "timestamp": 0,
                    "source": {"type": "user", "userId": "U1"},
                    "message": {"type": "sticker", "id": "3", "packageId": "1", "stickerId": "1"}
                },
                {
                    "type": "follow",
                    "replyToken": "rt",
                    "timestamp": 0,
                    "source": {"type": "group", "groupId": "G1"}
                },
                {
                    "type": "postback",
                    "replyToken": "rt",
                    "timestamp": 0,
                    "source": {"type": "user", "userId": "U1"},
                    "postback": {"data": "action=unknown"}
                }
            ]
        }));

        assert_eq!(events.len(), 4);
        assert!(events.into_iter().filter_map(adapt).next().is_none());
    }

    #[test]
    fn test_flex_message_serialization() {
        let message = LineMessage::Flex {
            alt_text: "プラン選択".to_string(),
            contents: json!({"type": "bubble"}),
        };
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({"type": "flex", "altText": "プラン選択", "contents": {"type": "bubble"}})
        );
    }

    #[tokio::test]
    async fn test_reply_posts_with_bearer_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v2/bot/message/reply")
            .match_header("authorization", "Bearer line-token")
            .match_body(Matcher::PartialJson(json!({
                "replyToken": "rt-1",
                "messages": [{"type": "text", "text": "hi"}]
            })))
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let client = LineClient::new(reqwest::Client::new(), &server.url(), "line-token");
        client
            .reply("rt-1", vec![LineMessage::text("hi")])
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_push_failure_is_upstream_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v2/bot/message/push")
            .with_status(400)
            .with_body(r#"{"message":"Invalid to"}"#)
            .create_async()
            .await;

        let client = LineClient::new(reqwest::Client::new(), &server.url(), "line-token");
        let err = client
            .push("U1", vec![LineMessage::text("hi")])
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Upstream(_)));
    }

    #[tokio::test]
    async fn test_profile_lookup() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v2/bot/profile/U1")
            .with_status(200)
            .with_body(r#"{"userId":"U1","displayName":"Aki","pictureUrl":"https://x"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/v2/bot/profile/U2")
            .with_status(404)
            .create_async()
            .await;

        let client = LineClient::new(reqwest::Client::new(), &server.url(), "line-token");
        assert_eq!(client.display_name("U1").await.unwrap(), "Aki");
        let err = client.display_name("U2").await.unwrap_err();
        assert!(err.is_transient());
    }
}
