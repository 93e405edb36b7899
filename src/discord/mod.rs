//! Minimal Discord REST client used to post command-change notifications
//! and operator messages. No gateway.

use crate::api::ClientError;
use crate::notify::{Destination, NotificationSink, RenderedNotification};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, USER_AGENT};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";
const AGENT: &str = concat!("DiscordBot (https://uservault.cc, ", env!("CARGO_PKG_VERSION"), ")");

#[derive(Debug, Clone, Deserialize)]
pub struct Channel {
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CreateMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub embeds: Vec<Embed>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Embed {
    pub title: String,
    pub description: String,
    pub color: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer: Option<EmbedFooter>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbedFooter {
    pub text: String,
}

impl From<&RenderedNotification> for Embed {
    fn from(rendered: &RenderedNotification) -> Self {
        let now = crate::signing::now_ms() / 1000;
        let mut fields = vec![EmbedField {
            name: "⏰ Timestamp".to_string(),
            value: format!("<t:{now}:F>"),
            inline: true,
        }];
        if let Some(changes) = &rendered.changes {
            fields.push(EmbedField {
                name: "📋 Changes".to_string(),
                value: changes.clone(),
                inline: false,
            });
        }
        Self {
            title: rendered.title.clone(),
            description: rendered.description.clone(),
            color: rendered.colour,
            fields,
            footer: Some(EmbedFooter {
                text: rendered.footer.clone(),
            }),
        }
    }
}

pub struct DiscordClient {
    http: Client,
    api_base: Url,
}

impl DiscordClient {
    pub fn new(token: &str, api_base: &str, timeout: Duration) -> Result<Self, ClientError> {
        if token.trim().is_empty() {
            return Err(ClientError::Config("discord bot token must not be empty"));
        }
        let mut base = api_base.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let api_base = Url::parse(&base).map_err(|err| ClientError::Url(err.to_string()))?;

        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bot {}", token.trim()))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        headers.insert(USER_AGENT, HeaderValue::from_static(AGENT));

        let http = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;
        Ok(Self { http, api_base })
    }

    fn url(&self, path: &str) -> Result<Url, DeliveryError> {
        self.api_base
            .join(path)
            .map_err(|err| DeliveryError::Unavailable(format!("bad discord path {path}: {err}")))
    }

    pub async fn get_channel(&self, channel_id: u64) -> Result<Channel, DeliveryError> {
        let resp = self
            .http
            .get(self.url(&format!("channels/{channel_id}"))?)
            .send()
            .await?;
        let resp = check(resp).await?;
        Ok(resp.json().await?)
    }

    pub async fn create_message(&self, channel_id: u64, message: &CreateMessage) -> Result<(), DeliveryError> {
        let resp = self
            .http
            .post(self.url(&format!("channels/{channel_id}/messages"))?)
            .json(message)
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }
}

async fn check(resp: reqwest::Response) -> Result<reqwest::Response, DeliveryError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(DeliveryError::Api {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl NotificationSink for DiscordClient {
    async fn resolve(&self, channel_id: u64) -> Result<Destination, DeliveryError> {
        let channel = self.get_channel(channel_id).await?;
        Ok(Destination {
            channel_id,
            name: channel.name,
        })
    }

    async fn deliver(
        &self,
        destination: &Destination,
        notification: &RenderedNotification,
    ) -> Result<(), DeliveryError> {
        let message = CreateMessage {
            content: None,
            embeds: vec![Embed::from(notification)],
        };
        self.create_message(destination.channel_id, &message).await
    }

    async fn send_text(&self, destination: &Destination, text: &str) -> Result<(), DeliveryError> {
        let message = CreateMessage {
            content: Some(text.to_string()),
            embeds: Vec::new(),
        };
        self.create_message(destination.channel_id, &message).await
    }
}

#[derive(Debug)]
pub enum DeliveryError {
    Http(reqwest::Error),
    Api { status: u16, body: String },
    Unavailable(String),
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(err) => write!(f, "discord http error: {err}"),
            Self::Api { status, body } => write!(f, "discord api error {status}: {body}"),
            Self::Unavailable(msg) => write!(f, "discord unavailable: {msg}"),
        }
    }
}

impl std::error::Error for DeliveryError {}

impl From<reqwest::Error> for DeliveryError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NotificationAction;
    use httpmock::prelude::*;
    use serde_json::json;

    fn client(server: &MockServer) -> DiscordClient {
        DiscordClient::new("tok3n", &server.url("/api/v10"), Duration::from_secs(2)).unwrap()
    }

    fn rendered() -> RenderedNotification {
        RenderedNotification {
            id: "n1".to_string(),
            action: NotificationAction::Created,
            title: "✨ Command Created".to_string(),
            description: "**`?slots`** was created".to_string(),
            shown_usage: "?slots".to_string(),
            colour: 0x22c55e,
            changes: Some("• **usage**: ?slots".to_string()),
            footer: "UserVault Command System".to_string(),
        }
    }

    #[test]
    fn empty_token_is_rejected() {
        assert!(matches!(
            DiscordClient::new(" ", DEFAULT_API_BASE, Duration::from_secs(1)),
            Err(ClientError::Config(_))
        ));
    }

    #[tokio::test]
    async fn resolve_reads_channel_name() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/api/v10/channels/99")
                    .header("authorization", "Bot tok3n");
                then.status(200).json_body(json!({"id": "99", "name": "command-updates", "type": 0}));
            })
            .await;

        let dest = client(&server).resolve(99).await.unwrap();
        mock.assert_async().await;
        assert_eq!(dest.name.as_deref(), Some("command-updates"));
        assert_eq!(dest.to_string(), "#command-updates (id=99)");
    }

    #[tokio::test]
    async fn deliver_posts_embed() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/v10/channels/99/messages")
                    .header("authorization", "Bot tok3n")
                    .body_contains("\"title\":\"✨ Command Created\"")
                    .body_contains("\"color\":2278750");
                then.status(200).json_body(json!({"id": "1"}));
            })
            .await;

        let dest = Destination {
            channel_id: 99,
            name: None,
        };
        client(&server).deliver(&dest, &rendered()).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn rejected_send_is_a_delivery_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/v10/channels/99/messages");
                then.status(403).body(r#"{"message": "Missing Permissions", "code": 50013}"#);
            })
            .await;

        let dest = Destination {
            channel_id: 99,
            name: None,
        };
        let err = client(&server).send_text(&dest, "reload failed").await.unwrap_err();
        match err {
            DeliveryError::Api { status, body } => {
                assert_eq!(status, 403);
                assert!(body.contains("Missing Permissions"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
