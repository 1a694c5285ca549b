//! Durable per-binding watermarks.
//!
//! The store is a YAML mapping `binding_id: watermark`, loaded once at startup and
//! rewritten wholesale after every advance. Rewrites go through a temporary file in
//! the same directory that is renamed over the target, so a crash mid-write leaves
//! the previously committed file intact.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, error, info, warn};

use crate::binding::BindingId;
use crate::contract::ItemId;
use crate::error::StateError;

pub type Watermarks = BTreeMap<BindingId, ItemId>;

/// Result of a successful [`StateStore::advance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    Advanced { from: ItemId, to: ItemId },
    Unchanged,
}

#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    watermarks: Mutex<Watermarks>,
    binding_locks: Mutex<HashMap<BindingId, Arc<tokio::sync::Mutex<()>>>>,
    /// Serialises file replacement; holders always write the latest snapshot.
    writer: tokio::sync::Mutex<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl StateStore {
    /// Loads the store from `path`. A missing or empty file yields empty state.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, StateError> {
        let path = path.into();
        info!(state_file = %path.display(), "[STATE] Loading watermarks");
        let watermarks = match tokio::fs::read_to_string(&path).await {
            Ok(content) => parse(&path, &content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(state_file = %path.display(), "[STATE] No state file yet, starting empty");
                Watermarks::new()
            }
            Err(e) => {
                error!(error = ?e, state_file = %path.display(), "[STATE][ERROR] Failed to read state file");
                return Err(e.into());
            }
        };
        debug!(?watermarks, "[STATE] Watermarks loaded");
        Ok(Self::with_watermarks(path, watermarks))
    }

    fn with_watermarks(path: PathBuf, watermarks: Watermarks) -> Self {
        Self {
            path,
            watermarks: Mutex::new(watermarks),
            binding_locks: Mutex::new(HashMap::new()),
            writer: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Highest item fully dispatched for `binding`, `0` when nothing was recorded.
    pub fn watermark(&self, binding: &BindingId) -> ItemId {
        lock(&self.watermarks).get(binding).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> Watermarks {
        lock(&self.watermarks).clone()
    }

    /// Moves the watermark of `binding` to `to` and persists it before returning.
    ///
    /// Moving backwards is rejected with [`StateError::Regression`] and leaves the
    /// stored value untouched. If persisting fails the in-memory value is restored.
    pub async fn advance(&self, binding: &BindingId, to: ItemId) -> Result<Advance, StateError> {
        let binding_lock = self.binding_lock(binding);
        let _guard = binding_lock.lock().await;

        let previous = lock(&self.watermarks).get(binding).copied();
        let current = previous.unwrap_or(0);
        if to < current {
            error!(
                binding = %binding,
                current,
                attempted = to,
                "[STATE][ERROR] Rejected watermark regression"
            );
            return Err(StateError::Regression {
                binding: binding.clone(),
                current,
                attempted: to,
            });
        }
        if to == current {
            return Ok(Advance::Unchanged);
        }

        lock(&self.watermarks).insert(binding.clone(), to);
        if let Err(e) = self.persist().await {
            error!(error = %e, binding = %binding, "[STATE][ERROR] Failed to persist watermark, rolling back");
            let mut watermarks = lock(&self.watermarks);
            match previous {
                Some(value) => watermarks.insert(binding.clone(), value),
                None => watermarks.remove(binding),
            };
            return Err(e);
        }
        info!(binding = %binding, from = current, to, "[STATE] Watermark advanced");
        Ok(Advance::Advanced { from: current, to })
    }

    fn binding_lock(&self, binding: &BindingId) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            lock(&self.binding_locks)
                .entry(binding.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    async fn persist(&self) -> Result<(), StateError> {
        let _writer = self.writer.lock().await;
        let snapshot = self.snapshot();
        let content = serde_yaml::to_string(&snapshot).map_err(StateError::Serialize)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, content.as_bytes()))
            .await
            .map_err(|e| StateError::Writer(e.to_string()))??;
        debug!(state_file = %self.path.display(), entries = snapshot.len(), "[STATE] State file replaced");
        Ok(())
    }
}

fn parse(path: &Path, content: &str) -> Result<Watermarks, StateError> {
    if content.trim().is_empty() {
        return Ok(Watermarks::new());
    }
    let parsed: Option<Watermarks> =
        serde_yaml::from_str(content).map_err(|source| StateError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    if parsed.is_none() {
        warn!(state_file = %path.display(), "[STATE] State file holds no mapping, starting empty");
    }
    Ok(parsed.unwrap_or_default())
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_or_null_content_parses_to_empty_state() {
        let path = Path::new("state.yaml");
        assert!(parse(path, "").unwrap().is_empty());
        assert!(parse(path, "~\n").unwrap().is_empty());
    }

    #[test]
    fn garbage_content_is_a_parse_error() {
        let err = parse(Path::new("state.yaml"), "club1/wall: [not, a, number]").unwrap_err();
        assert!(matches!(err, StateError::Parse { .. }));
    }
}
