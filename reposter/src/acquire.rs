//! Media acquisition: videos through an external download tool, everything else
//! through a plain HTTP download.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use reposter_core::contract::{AcquireError, Acquirer, Artifact, MediaKind, MediaRef};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::load_config::DownloaderSection;

pub struct MediaAcquirer {
    client: reqwest::Client,
    output_dir: PathBuf,
    command: String,
    args: Vec<String>,
    restart_command: Vec<String>,
    restart_markers: Vec<String>,
}

impl MediaAcquirer {
    pub fn new(section: &DownloaderSection) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(section.http_timeout_seconds))
            .build()?;
        Ok(Self {
            client,
            output_dir: section.output_dir.clone(),
            command: section.command.clone(),
            args: section.args.clone(),
            restart_command: section.restart_command.clone(),
            restart_markers: section
                .restart_markers
                .iter()
                .map(|m| m.to_lowercase())
                .collect(),
        })
    }

    async fn ensure_output_dir(&self) -> Result<(), AcquireError> {
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|e| AcquireError::Retryable(format!("creating {}: {e}", self.output_dir.display())))
    }

    async fn run_tool(&self, media: &MediaRef) -> Result<Artifact, AcquireError> {
        let template = self.output_dir.join(format!("{}.%(ext)s", Uuid::new_v4()));
        debug!(url = %media.url, tool = %self.command, "[ACQUIRE] Running download tool");
        let output = Command::new(&self.command)
            .args(&self.args)
            .arg("-o")
            .arg(&template)
            .args(["--print", "after_move:filepath"])
            .arg(&media.url)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    error!(tool = %self.command, "[ACQUIRE] Download tool is not installed");
                    AcquireError::Unsupported(format!("{} is not installed", self.command))
                } else {
                    AcquireError::Retryable(format!("spawning {}: {e}", self.command))
                }
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(classify_tool_failure(&stderr, &self.restart_markers));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let path = stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(PathBuf::from)
            .ok_or_else(|| AcquireError::Retryable("download tool printed no file path".to_string()))?;
        let filename = display_filename(media, &path);
        Ok(Artifact {
            media: media.clone(),
            path,
            filename,
        })
    }

    async fn download(&self, media: &MediaRef) -> Result<Artifact, AcquireError> {
        let mut response = self
            .client
            .get(&media.url)
            .send()
            .await
            .map_err(|e| AcquireError::Retryable(format!("GET {}: {e}", media.url)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_http_status(status.as_u16(), &media.url));
        }

        let name = url_basename(&media.url);
        let path = self.output_dir.join(format!("{}-{name}", Uuid::new_v4()));
        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| AcquireError::Retryable(format!("creating {}: {e}", path.display())))?;
        let written = async {
            while let Some(chunk) = response
                .chunk()
                .await
                .map_err(|e| AcquireError::Retryable(format!("reading {}: {e}", media.url)))?
            {
                file.write_all(&chunk)
                    .await
                    .map_err(|e| AcquireError::Retryable(format!("writing {}: {e}", path.display())))?;
            }
            file.flush()
                .await
                .map_err(|e| AcquireError::Retryable(format!("writing {}: {e}", path.display())))
        }
        .await;
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(e);
        }

        let filename = display_filename(media, &path);
        Ok(Artifact {
            media: media.clone(),
            path,
            filename,
        })
    }
}

#[async_trait]
impl Acquirer for MediaAcquirer {
    async fn acquire(&self, media: &MediaRef) -> Result<Artifact, AcquireError> {
        if !(media.url.starts_with("http://") || media.url.starts_with("https://")) {
            return Err(AcquireError::Unsupported(format!("not an http url: {}", media.url)));
        }
        self.ensure_output_dir().await?;
        let artifact = match media.kind {
            MediaKind::Video => self.run_tool(media).await?,
            MediaKind::Photo | MediaKind::Audio | MediaKind::Document => self.download(media).await?,
        };
        info!(url = %media.url, path = %artifact.path.display(), "[ACQUIRE] Media stored");
        Ok(artifact)
    }

    async fn restart(&self) -> Result<(), AcquireError> {
        let Some((program, args)) = self.restart_command.split_first() else {
            warn!("[ACQUIRE] Restart requested but no restart command is configured");
            return Ok(());
        };
        info!(command = %program, "[ACQUIRE] Restarting download dependency");
        let status = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .status()
            .await
            .map_err(|e| AcquireError::Retryable(format!("running {program}: {e}")))?;
        if status.success() {
            Ok(())
        } else {
            Err(AcquireError::Retryable(format!("{program} exited with {status}")))
        }
    }
}

/// Maps a failed tool run to an error kind by looking at its stderr.
pub fn classify_tool_failure(stderr: &str, restart_markers: &[String]) -> AcquireError {
    let lowered = stderr.to_lowercase();
    let reason = stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("download tool failed")
        .to_string();
    if restart_markers.iter().any(|marker| lowered.contains(marker.as_str())) {
        AcquireError::RestartRequired(reason)
    } else if lowered.contains("unsupported url") {
        AcquireError::Unsupported(reason)
    } else {
        AcquireError::Retryable(reason)
    }
}

/// Client errors are final, except the ones asking to come back later.
pub fn classify_http_status(status: u16, url: &str) -> AcquireError {
    let reason = format!("GET {url} returned HTTP {status}");
    match status {
        408 | 429 => AcquireError::Retryable(reason),
        400..=499 => AcquireError::Unsupported(reason),
        _ => AcquireError::Retryable(reason),
    }
}

/// Last path segment of `url` without the query, safe to use in a file name.
pub fn url_basename(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let segment = without_query
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default();
    let cleaned: String = segment
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "media".to_string()
    } else {
        cleaned
    }
}

fn display_filename(media: &MediaRef, path: &Path) -> String {
    let extension = path.extension().and_then(|e| e.to_str());
    match (&media.title, extension) {
        (Some(title), Some(ext)) if !title.trim().is_empty() => format!("{}.{ext}", title.trim()),
        (Some(title), None) if !title.trim().is_empty() => title.trim().to_string(),
        _ => path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "media".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn markers() -> Vec<String> {
        DownloaderSection::default().restart_markers
    }

    #[test]
    fn tool_stderr_is_classified() {
        let restart = classify_tool_failure("ERROR: [vk] 123: Private video\n", &markers());
        assert_eq!(restart, AcquireError::RestartRequired("ERROR: [vk] 123: Private video".into()));

        let unsupported = classify_tool_failure("ERROR: Unsupported URL: https://x", &markers());
        assert!(matches!(unsupported, AcquireError::Unsupported(_)));

        let other = classify_tool_failure("ERROR: timed out", &markers());
        assert!(matches!(other, AcquireError::Retryable(_)));
    }

    #[test]
    fn http_status_is_classified() {
        assert!(matches!(classify_http_status(404, "u"), AcquireError::Unsupported(_)));
        assert!(matches!(classify_http_status(429, "u"), AcquireError::Retryable(_)));
        assert!(matches!(classify_http_status(408, "u"), AcquireError::Retryable(_)));
        assert!(matches!(classify_http_status(503, "u"), AcquireError::Retryable(_)));
    }

    #[test]
    fn basename_drops_query_and_odd_characters() {
        assert_eq!(url_basename("https://cdn.vk/a/b/photo.jpg?size=x"), "photo.jpg");
        assert_eq!(url_basename("https://cdn.vk/a/my file.mp3"), "my_file.mp3");
        assert_eq!(url_basename("https://cdn.vk/"), "cdn.vk");
    }

    #[test]
    fn titled_media_keeps_the_stored_extension() {
        let media = MediaRef {
            kind: MediaKind::Audio,
            url: "https://cdn.vk/a.mp3".into(),
            title: Some("Artist - Song".into()),
        };
        let name = display_filename(&media, Path::new("/tmp/0f-a.mp3"));
        assert_eq!(name, "Artist - Song.mp3");

        let untitled = MediaRef::new(MediaKind::Photo, "https://cdn.vk/p.jpg");
        assert_eq!(display_filename(&untitled, Path::new("/tmp/0f-p.jpg")), "0f-p.jpg");
    }

    #[tokio::test]
    async fn non_http_reference_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let acquirer = MediaAcquirer::new(&DownloaderSection {
            output_dir: dir.path().to_path_buf(),
            ..DownloaderSection::default()
        })
        .unwrap();
        let result = acquirer
            .acquire(&MediaRef::new(MediaKind::Document, "ftp://example.org/f.pdf"))
            .await;
        assert!(matches!(result, Err(AcquireError::Unsupported(_))));
    }
}
