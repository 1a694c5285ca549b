//! # contract: narrow interfaces to the external collaborators
//!
//! The orchestration core never talks to a network or spawns a process itself.
//! Everything source-, media- or destination-specific sits behind one of three traits:
//!
//! - [`Fetcher`]: returns items of a binding's source newer than a watermark.
//! - [`Acquirer`]: turns a media reference into a local file.
//! - [`Publisher`]: delivers text plus local files to one destination.
//!
//! All traits are async, `Send + Sync`, and annotated for `mockall` so tests can
//! drive the pipeline deterministically (enable `test-export-mocks` to use the
//! generated `Mock*` types from other crates).
//!
//! Data carried between the stages (`Item`, `MediaRef`, `Artifact`,
//! `ProcessedItem`) is plain data and defined here as well.

use std::path::PathBuf;

use async_trait::async_trait;
#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;

use crate::binding::{Binding, BindingId, Destination};

/// Source-native item identifier, strictly increasing within a source.
pub type ItemId = u64;

/// What kind of media a reference points at; adapters pick a strategy from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Photo,
    Video,
    Audio,
    Document,
}

/// A media attachment of an item, not yet available locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRef {
    pub kind: MediaKind,
    pub url: String,
    /// Human-readable title, used to name the published file when present.
    pub title: Option<String>,
}

impl MediaRef {
    pub fn new(kind: MediaKind, url: impl Into<String>) -> Self {
        Self {
            kind,
            url: url.into(),
            title: None,
        }
    }
}

/// A discovered unit of content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub binding_id: BindingId,
    pub item_id: ItemId,
    pub text: String,
    /// Ordered media references.
    pub media: Vec<MediaRef>,
}

/// A media reference resolved to a local file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub media: MediaRef,
    pub path: PathBuf,
    /// File name to present to the destination.
    pub filename: String,
}

impl Artifact {
    /// Deletes the local file. A file that is already gone is not an error.
    pub async fn discard(&self) -> std::io::Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Discards every artifact, logging the ones that could not be removed.
pub(crate) async fn discard_all(artifacts: &[Artifact]) {
    for artifact in artifacts {
        if let Err(e) = artifact.discard().await {
            tracing::warn!(path = %artifact.path.display(), error = %e, "Could not remove artifact");
        }
    }
}

/// A media reference that could not be acquired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFailure {
    pub media: MediaRef,
    /// Number of acquisition attempts made.
    pub attempts: u32,
    pub reason: String,
}

/// An item with its media resolved as far as possible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedItem {
    pub item: Item,
    /// Resolved artifacts, in the order of `item.media`.
    pub artifacts: Vec<Artifact>,
    pub processing_errors: Vec<MediaFailure>,
}

/// Failure of a fetch call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// Network blip, rate limit, upstream 5xx. The binding is skipped this cycle.
    #[error("transient fetch failure: {0}")]
    Transient(String),
    /// Credentials rejected or the source is not accessible. Disables the binding.
    #[error("source rejected credentials: {0}")]
    Auth(String),
}

/// Failure of a single acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AcquireError {
    #[error("retryable acquisition failure: {0}")]
    Retryable(String),
    /// The reference can never be acquired (unsupported URL, gone for good).
    #[error("unsupported media reference: {0}")]
    Unsupported(String),
    /// The acquisition tool needs an external restart before the next attempt.
    #[error("acquisition tool needs a restart: {0}")]
    RestartRequired(String),
}

/// Failure of a publish call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    /// The destination refused the content.
    #[error("destination rejected the post: {0}")]
    Rejected(String),
    /// The destination could not be reached.
    #[error("destination unreachable: {0}")]
    Transport(String),
}

/// Reads new items from the source of a binding.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Returns at most `max_count` items with `item_id > since`, ordered by
    /// strictly increasing `item_id`.
    async fn fetch(
        &self,
        binding: &Binding,
        since: ItemId,
        max_count: u32,
    ) -> Result<Vec<Item>, FetchError>;
}

/// Downloads (and possibly transcodes) media into local files.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Acquirer: Send + Sync {
    /// Makes a single attempt at acquiring `media`.
    async fn acquire(&self, media: &MediaRef) -> Result<Artifact, AcquireError>;

    /// Relaunches whatever external dependency asked for a restart.
    async fn restart(&self) -> Result<(), AcquireError>;
}

/// Delivers an item to one destination.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        destination: &Destination,
        text: &str,
        artifacts: &[Artifact],
    ) -> Result<(), PublishError>;
}
