//! Bindings: one content source paired with the destinations it is reposted to.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Stable identifier of a binding, derived from its source descriptor.
///
/// Used as the key of the watermark file, so changing the derivation
/// invalidates persisted state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BindingId(String);

impl BindingId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BindingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn default_feed() -> String {
    "wall".to_string()
}

fn default_max_count() -> u32 {
    10
}

/// Describes where items come from (e.g. a community wall).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    /// Source-native name of the owner (community short name, user id, ...).
    pub domain: String,
    /// Which feed of the owner to read (`wall`, `donut`, ...).
    #[serde(default = "default_feed")]
    pub feed: String,
    /// Upper bound on items requested per check.
    #[serde(default = "default_max_count")]
    pub max_count: u32,
}

impl SourceDescriptor {
    pub fn binding_id(&self) -> BindingId {
        BindingId(format!("{}/{}", self.domain, self.feed))
    }
}

/// The closed set of destination capabilities an item can be published to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Destination {
    /// A chat channel, addressed by `@username` or numeric id.
    Channel { channel_id: String },
    /// A blog, addressed by its name on the blog platform.
    Blog { blog: String },
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Channel { channel_id } => write!(f, "channel:{channel_id}"),
            Destination::Blog { blog } => write!(f, "blog:{blog}"),
        }
    }
}

/// A configured source with its non-empty set of destinations.
///
/// Immutable for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    id: BindingId,
    source: SourceDescriptor,
    destinations: Vec<Destination>,
}

impl Binding {
    pub fn new(
        source: SourceDescriptor,
        destinations: Vec<Destination>,
    ) -> Result<Self, ConfigError> {
        let id = source.binding_id();
        if destinations.is_empty() {
            return Err(ConfigError::NoDestinations(id));
        }
        Ok(Self {
            id,
            source,
            destinations,
        })
    }

    pub fn id(&self) -> &BindingId {
        &self.id
    }

    pub fn source(&self) -> &SourceDescriptor {
        &self.source
    }

    pub fn destinations(&self) -> &[Destination] {
        &self.destinations
    }
}
