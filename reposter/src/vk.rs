//! Reads community walls through the VK `wall.get` method.

use std::time::Duration;

use async_trait::async_trait;
use reposter_core::binding::{Binding, BindingId};
use reposter_core::contract::{FetchError, Fetcher, Item, ItemId, MediaKind, MediaRef};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::load_config::VkSection;

/// VK error codes meaning the token or the source is not usable.
const AUTH_ERROR_CODES: [i64; 3] = [5, 27, 28];

pub struct VkWallFetcher {
    client: reqwest::Client,
    api_base: String,
    api_version: String,
    token: String,
}

impl VkWallFetcher {
    pub fn new(section: &VkSection, token: String) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(section.timeout_seconds))
            .user_agent("reposter/0.1")
            .build()?;
        info!(api_base = %section.api_base, "[FETCH] VK client initialised");
        Ok(Self {
            client,
            api_base: section.api_base.trim_end_matches('/').to_string(),
            api_version: section.api_version.clone(),
            token,
        })
    }
}

#[async_trait]
impl Fetcher for VkWallFetcher {
    async fn fetch(
        &self,
        binding: &Binding,
        since: ItemId,
        max_count: u32,
    ) -> Result<Vec<Item>, FetchError> {
        let source = binding.source();
        let mut query: Vec<(&str, String)> = vec![
            ("domain", source.domain.clone()),
            ("count", max_count.to_string()),
            ("access_token", self.token.clone()),
            ("v", self.api_version.clone()),
        ];
        if source.feed == "donut" {
            query.push(("filter", "donut".to_string()));
        }
        debug!(domain = %source.domain, feed = %source.feed, since, "[FETCH] Requesting wall");

        let response = self
            .client
            .get(format!("{}/wall.get", self.api_base))
            .query(&query)
            .send()
            .await
            .map_err(|e| FetchError::Transient(format!("wall.get request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            warn!(%status, domain = %source.domain, "[FETCH] wall.get returned an HTTP error");
            return Err(FetchError::Transient(format!("wall.get returned HTTP {status}")));
        }
        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Transient(format!("reading wall.get response: {e}")))?;
        parse_wall_response(binding.id(), &body, since)
    }
}

#[derive(Debug, Deserialize)]
struct WallGetEnvelope {
    response: Option<WallGetResponse>,
    error: Option<VkApiError>,
}

#[derive(Debug, Deserialize)]
struct VkApiError {
    error_code: i64,
    #[serde(default)]
    error_msg: String,
}

#[derive(Debug, Deserialize)]
struct WallGetResponse {
    #[serde(default)]
    items: Vec<WallPost>,
}

#[derive(Debug, Deserialize)]
struct WallPost {
    id: ItemId,
    #[serde(default)]
    text: String,
    #[serde(default)]
    attachments: Vec<Attachment>,
}

#[derive(Debug, Deserialize)]
struct Attachment {
    #[serde(rename = "type")]
    kind: String,
    photo: Option<Photo>,
    video: Option<Video>,
    audio: Option<Audio>,
    doc: Option<Doc>,
}

#[derive(Debug, Deserialize)]
struct Photo {
    #[serde(default)]
    sizes: Vec<PhotoSize>,
}

#[derive(Debug, Deserialize)]
struct PhotoSize {
    url: String,
    #[serde(default)]
    width: u32,
}

#[derive(Debug, Deserialize)]
struct Video {
    id: i64,
    owner_id: i64,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Audio {
    url: String,
    #[serde(default)]
    artist: String,
    #[serde(default)]
    title: String,
}

#[derive(Debug, Deserialize)]
struct Doc {
    url: String,
    #[serde(default)]
    title: Option<String>,
}

impl Attachment {
    fn into_media(self) -> Option<MediaRef> {
        match self.kind.as_str() {
            "photo" => {
                let largest = self.photo?.sizes.into_iter().max_by_key(|s| s.width)?;
                Some(MediaRef::new(MediaKind::Photo, largest.url))
            }
            "video" => {
                let video = self.video?;
                Some(MediaRef {
                    kind: MediaKind::Video,
                    url: format!("https://vk.com/video{}_{}", video.owner_id, video.id),
                    title: video.title,
                })
            }
            "audio" => {
                let audio = self.audio?;
                Some(MediaRef {
                    kind: MediaKind::Audio,
                    url: audio.url,
                    title: Some(format!("{} - {}", audio.artist, audio.title)),
                })
            }
            "doc" => {
                let doc = self.doc?;
                Some(MediaRef {
                    kind: MediaKind::Document,
                    url: doc.url,
                    title: doc.title,
                })
            }
            _ => None,
        }
    }
}

/// Turns a `wall.get` body into items newer than `since`, oldest first.
///
/// VK returns the newest posts first and may put an old pinned post on top, so the
/// result is filtered and re-sorted here.
pub fn parse_wall_response(
    binding_id: &BindingId,
    body: &str,
    since: ItemId,
) -> Result<Vec<Item>, FetchError> {
    let envelope: WallGetEnvelope = serde_json::from_str(body)
        .map_err(|e| FetchError::Transient(format!("malformed wall.get response: {e}")))?;
    if let Some(error) = envelope.error {
        let reason = format!("VK error {}: {}", error.error_code, error.error_msg);
        return Err(if AUTH_ERROR_CODES.contains(&error.error_code) {
            FetchError::Auth(reason)
        } else {
            FetchError::Transient(reason)
        });
    }
    let response = envelope
        .response
        .ok_or_else(|| FetchError::Transient("wall.get response is empty".to_string()))?;

    let mut items: Vec<Item> = response
        .items
        .into_iter()
        .filter(|post| post.id > since)
        .map(|post| Item {
            binding_id: binding_id.clone(),
            item_id: post.id,
            text: post.text,
            media: post
                .attachments
                .into_iter()
                .filter_map(Attachment::into_media)
                .collect(),
        })
        .collect();
    items.sort_by_key(|item| item.item_id);
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    const WALL: &str = r#"{
      "response": {
        "count": 3,
        "items": [
          {"id": 12, "text": "newest", "attachments": [
            {"type": "photo", "photo": {"sizes": [
              {"url": "https://cdn.vk/s.jpg", "width": 130},
              {"url": "https://cdn.vk/x.jpg", "width": 1280}
            ]}},
            {"type": "video", "video": {"id": 456, "owner_id": -123, "title": "Clip"}},
            {"type": "poll", "poll": {"id": 1}}
          ]},
          {"id": 11, "text": "older"},
          {"id": 3, "text": "pinned and old", "is_pinned": 1}
        ]
      }
    }"#;

    #[test]
    fn posts_are_filtered_sorted_and_media_mapped() {
        let items = parse_wall_response(&BindingId::new("club1/wall"), WALL, 5).unwrap();

        let ids: Vec<ItemId> = items.iter().map(|i| i.item_id).collect();
        assert_eq!(ids, vec![11, 12]);
        let newest = &items[1];
        assert_eq!(newest.media.len(), 2, "polls are not media");
        assert_eq!(newest.media[0].url, "https://cdn.vk/x.jpg");
        assert_eq!(newest.media[1].kind, MediaKind::Video);
        assert_eq!(newest.media[1].url, "https://vk.com/video-123_456");
    }

    #[test]
    fn auth_error_codes_disable_and_others_are_transient() {
        let id = BindingId::new("club1/wall");
        let auth = r#"{"error": {"error_code": 5, "error_msg": "User authorization failed"}}"#;
        assert!(matches!(parse_wall_response(&id, auth, 0), Err(FetchError::Auth(_))));

        let flood = r#"{"error": {"error_code": 9, "error_msg": "Flood control"}}"#;
        assert!(matches!(parse_wall_response(&id, flood, 0), Err(FetchError::Transient(_))));

        assert!(matches!(
            parse_wall_response(&id, "<html>", 0),
            Err(FetchError::Transient(_))
        ));
    }
}
