//! Destination adapters: Telegram channels through the Bot API and blogs through a
//! bearer-authenticated HTTP endpoint.
//!
//! Item text arrives with markdown links (`[label](host/path)`). Telegram gets it
//! rendered as HTML; blogs take the markdown as is, plus the post's hashtags.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::{Captures, Regex};
use reposter_core::binding::Destination;
use reposter_core::contract::{Artifact, MediaKind, PublishError, Publisher};
use reposter_core::text::extract_tags;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::load_config::{BlogSection, TelegramSection};

/// Longest caption the Bot API accepts on a media message.
pub const CAPTION_LIMIT: usize = 1024;
/// Longest text the Bot API accepts in one message.
pub const MESSAGE_LIMIT: usize = 4096;
/// Most files one media group may hold.
pub const ALBUM_LIMIT: usize = 10;

/// Kinds that may share a media group. Photos and videos mix; audio and
/// documents only group with their own kind. Earlier groups get the caption.
const ALBUM_FAMILIES: [&[MediaKind]; 3] = [
    &[MediaKind::Photo, MediaKind::Video],
    &[MediaKind::Audio],
    &[MediaKind::Document],
];

async fn file_part(artifact: &Artifact) -> Result<Part, PublishError> {
    let bytes = tokio::fs::read(&artifact.path).await.map_err(|e| {
        PublishError::Rejected(format!("reading {}: {e}", artifact.path.display()))
    })?;
    Ok(Part::bytes(bytes).file_name(artifact.filename.clone()))
}

pub struct TelegramPublisher {
    client: reqwest::Client,
    base: String,
}

#[derive(Debug, Deserialize)]
struct BotResponse {
    ok: bool,
    #[serde(default)]
    error_code: Option<u16>,
    #[serde(default)]
    description: Option<String>,
}

impl TelegramPublisher {
    pub fn new(section: &TelegramSection, token: &str) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(section.timeout_seconds))
            .build()?;
        Ok(Self {
            client,
            base: format!("{}/bot{token}", section.api_base.trim_end_matches('/')),
        })
    }

    async fn call(&self, method: &str, form: Form) -> Result<(), PublishError> {
        let response = self
            .client
            .post(format!("{}/{method}", self.base))
            .multipart(form)
            .send()
            .await
            // The URL carries the token; keep it out of the error text.
            .map_err(|e| PublishError::Transport(format!("{method}: {}", e.without_url())))?;
        let status = response.status();
        let body: BotResponse = response.json().await.map_err(|e| {
            PublishError::Transport(format!("{method} returned HTTP {status} with an unreadable body: {}", e.without_url()))
        })?;
        check_bot_response(method, &body)
    }

    async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), PublishError> {
        let form = Form::new()
            .text("chat_id", chat_id.to_string())
            .text("text", render_html(text))
            .text("parse_mode", "HTML");
        self.call("sendMessage", form).await
    }

    async fn send_media(
        &self,
        chat_id: &str,
        artifact: &Artifact,
        caption: Option<&str>,
    ) -> Result<(), PublishError> {
        let (method, field) = media_method(artifact.media.kind);
        let mut form = Form::new()
            .text("chat_id", chat_id.to_string())
            .part(field, file_part(artifact).await?);
        if let Some(caption) = caption {
            form = form
                .text("caption", render_html(caption))
                .text("parse_mode", "HTML");
        }
        self.call(method, form).await
    }

    async fn send_album(
        &self,
        chat_id: &str,
        artifacts: &[&Artifact],
        caption: Option<&str>,
    ) -> Result<(), PublishError> {
        let mut form = Form::new().text("chat_id", chat_id.to_string());
        for (index, artifact) in artifacts.iter().enumerate() {
            form = form.part(format!("file{index}"), file_part(artifact).await?);
        }
        let media = album_media(artifacts, caption);
        self.call("sendMediaGroup", form.text("media", media.to_string()))
            .await
    }

    async fn send(&self, chat_id: &str, call: &Outgoing<'_>) -> Result<(), PublishError> {
        match call {
            Outgoing::Text(text) => self.send_message(chat_id, text).await,
            Outgoing::Single { artifact, caption } => {
                self.send_media(chat_id, artifact, caption.as_deref()).await
            }
            Outgoing::Album { artifacts, caption } => {
                self.send_album(chat_id, artifacts, caption.as_deref()).await
            }
        }
    }
}

/// One Bot API call making up part of a channel post.
#[derive(Debug, PartialEq, Eq)]
pub enum Outgoing<'a> {
    Text(String),
    Single {
        artifact: &'a Artifact,
        caption: Option<String>,
    },
    Album {
        artifacts: Vec<&'a Artifact>,
        caption: Option<String>,
    },
}

/// Lays a post out as Bot API calls.
///
/// Media goes out in groups of at most [`ALBUM_LIMIT`] compatible files, a group of
/// one as a plain media message. Text that fits becomes the caption of the first
/// group; otherwise it follows the media as messages of at most [`MESSAGE_LIMIT`].
pub fn plan_post<'a>(text: &str, artifacts: &'a [Artifact]) -> Vec<Outgoing<'a>> {
    let text = text.trim();
    let as_caption = !text.is_empty() && !artifacts.is_empty() && fits_caption(text);
    let mut caption = as_caption.then(|| text.to_string());

    let mut calls = Vec::new();
    for family in ALBUM_FAMILIES {
        let members: Vec<&Artifact> = artifacts
            .iter()
            .filter(|artifact| family.contains(&artifact.media.kind))
            .collect();
        for chunk in members.chunks(ALBUM_LIMIT) {
            let caption = caption.take();
            calls.push(match chunk {
                [artifact] => Outgoing::Single {
                    artifact: *artifact,
                    caption,
                },
                _ => Outgoing::Album {
                    artifacts: chunk.to_vec(),
                    caption,
                },
            });
        }
    }
    if !text.is_empty() && !as_caption {
        calls.extend(
            split_message(text, MESSAGE_LIMIT)
                .into_iter()
                .map(Outgoing::Text),
        );
    }
    calls
}

/// The `media` field of `sendMediaGroup`, naming the parts `file0`, `file1`, ...
fn album_media(artifacts: &[&Artifact], caption: Option<&str>) -> Value {
    let entries = artifacts
        .iter()
        .enumerate()
        .map(|(index, artifact)| {
            let (_, media_type) = media_method(artifact.media.kind);
            let mut entry = json!({
                "type": media_type,
                "media": format!("attach://file{index}"),
            });
            if let (0, Some(caption)) = (index, caption) {
                entry["caption"] = Value::from(render_html(caption));
                entry["parse_mode"] = Value::from("HTML");
            }
            entry
        })
        .collect();
    Value::Array(entries)
}

/// Splits `text` into chunks of at most `limit` characters, breaking at a line end
/// when possible, then at whitespace, and mid-word only as a last resort.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let mut chunks = Vec::new();
    let mut rest = text.trim();
    while !rest.is_empty() {
        let Some((hard_cut, _)) = rest.char_indices().nth(limit) else {
            chunks.push(rest.to_string());
            break;
        };
        let window = &rest[..hard_cut];
        let cut = window
            .rfind('\n')
            .or_else(|| window.rfind(char::is_whitespace))
            .filter(|&at| at > 0)
            .unwrap_or(hard_cut);
        chunks.push(rest[..cut].trim_end().to_string());
        rest = rest[cut..].trim_start();
    }
    chunks
}

fn markdown_link() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    CELL.get_or_init(|| {
        Regex::new(r"\[([^\]]+)\]\(([^)\s]+)\)").expect("link pattern is a valid regex")
    })
}

/// Escapes `text` for the Bot API's HTML mode and turns markdown links into anchors.
pub fn render_html(text: &str) -> String {
    let escaped = text
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;");
    markdown_link()
        .replace_all(&escaped, |caps: &Captures<'_>| {
            let target = &caps[2];
            let href = if target.starts_with("http://") || target.starts_with("https://") {
                target.to_string()
            } else {
                format!("https://{target}")
            };
            format!("<a href=\"{}\">{}</a>", href.replace('"', "&quot;"), &caps[1])
        })
        .into_owned()
}

fn media_method(kind: MediaKind) -> (&'static str, &'static str) {
    match kind {
        MediaKind::Photo => ("sendPhoto", "photo"),
        MediaKind::Video => ("sendVideo", "video"),
        MediaKind::Audio => ("sendAudio", "audio"),
        MediaKind::Document => ("sendDocument", "document"),
    }
}

fn check_bot_response(method: &str, body: &BotResponse) -> Result<(), PublishError> {
    if body.ok {
        return Ok(());
    }
    let reason = format!(
        "{method}: {}",
        body.description.as_deref().unwrap_or("request failed")
    );
    match body.error_code {
        Some(429) | Some(500..=599) => Err(PublishError::Transport(reason)),
        _ => Err(PublishError::Rejected(reason)),
    }
}

/// Whether `text` fits as a caption on the first media message.
pub fn fits_caption(text: &str) -> bool {
    text.chars().count() <= CAPTION_LIMIT
}

#[async_trait]
impl Publisher for TelegramPublisher {
    async fn publish(
        &self,
        destination: &Destination,
        text: &str,
        artifacts: &[Artifact],
    ) -> Result<(), PublishError> {
        let Destination::Channel { channel_id } = destination else {
            return Err(PublishError::Rejected(format!("{destination} is not a channel")));
        };
        let calls = plan_post(text, artifacts);
        if calls.is_empty() {
            debug!(%destination, "[PUBLISH] Nothing to post");
            return Ok(());
        }
        for call in &calls {
            self.send(channel_id, call).await?;
        }
        info!(
            %destination,
            files = artifacts.len(),
            messages = calls.len(),
            "[PUBLISH] Posted to channel"
        );
        Ok(())
    }
}

pub struct BlogPublisher {
    client: reqwest::Client,
    api_base: String,
    token: String,
}

impl BlogPublisher {
    pub fn new(section: &BlogSection, token: String) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(section.timeout_seconds))
            .build()?;
        Ok(Self {
            client,
            api_base: section.api_base.trim_end_matches('/').to_string(),
            token,
        })
    }
}

/// Server trouble and rate limits are worth retrying on the next run; the rest is a refusal.
pub fn classify_blog_status(status: u16, body: &str) -> PublishError {
    let reason = format!("blog returned HTTP {status}: {}", body.trim());
    if status == 429 || status >= 500 {
        PublishError::Transport(reason)
    } else {
        PublishError::Rejected(reason)
    }
}

#[async_trait]
impl Publisher for BlogPublisher {
    async fn publish(
        &self,
        destination: &Destination,
        text: &str,
        artifacts: &[Artifact],
    ) -> Result<(), PublishError> {
        let Destination::Blog { blog } = destination else {
            return Err(PublishError::Rejected(format!("{destination} is not a blog")));
        };
        let mut form = Form::new().text("text", text.to_string());
        let tags = extract_tags(text);
        if !tags.is_empty() {
            form = form.text("tags", json!(tags).to_string());
        }
        for artifact in artifacts {
            form = form.part("files", file_part(artifact).await?);
        }
        let response = self
            .client
            .post(format!("{}/blogs/{blog}/posts", self.api_base))
            .bearer_auth(&self.token)
            .multipart(form)
            .send()
            .await
            .map_err(|e| PublishError::Transport(format!("blog request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%destination, %status, "[PUBLISH] Blog refused the post");
            return Err(classify_blog_status(status.as_u16(), &body));
        }
        info!(%destination, files = artifacts.len(), "[PUBLISH] Posted to blog");
        Ok(())
    }
}
