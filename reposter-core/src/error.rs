//! Error types shared across the core that are not owned by a single adapter contract.
//!
//! Adapter errors (`FetchError`, `AcquireError`, `PublishError`) live next to their
//! traits in [`crate::contract`].

use std::path::PathBuf;

use crate::binding::BindingId;
use crate::contract::ItemId;

/// Configuration could not be turned into a runnable set of bindings.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no bindings configured")]
    NoBindings,
    #[error("binding {0} has no destinations")]
    NoDestinations(BindingId),
    #[error("binding {0} is declared more than once")]
    DuplicateBinding(BindingId),
    #[error("invalid channel id {channel:?} in binding {binding}")]
    InvalidChannelId { binding: BindingId, channel: String },
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Failures of the durable watermark store.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("state file i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("state file {path} is not a valid watermark mapping: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("failed to serialise watermarks: {0}")]
    Serialize(#[source] serde_yaml::Error),
    #[error("watermark for {binding} would move backwards ({current} -> {attempted})")]
    Regression {
        binding: BindingId,
        current: ItemId,
        attempted: ItemId,
    },
    #[error("state writer task failed: {0}")]
    Writer(String),
}
