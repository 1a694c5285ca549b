use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::binding::{Binding, Destination, SourceDescriptor};
use crate::error::ConfigError;

/// Core settings: everything the orchestration engine needs, nothing adapter-specific.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub retries: RetrySection,
    pub bindings: Vec<BindingSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub check_interval_seconds: u64,
    pub state_file: PathBuf,
    pub health_check_interval_seconds: u64,
    /// A binding without a successful cycle for this many check intervals is degraded.
    pub health_missed_cycles: u32,
    pub shutdown_grace_seconds: u64,
    /// Delete downloaded media once an item is settled.
    pub cleanup_artifacts: bool,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            check_interval_seconds: 600,
            state_file: PathBuf::from("state.yaml"),
            health_check_interval_seconds: 3600,
            health_missed_cycles: 3,
            shutdown_grace_seconds: 30,
            cleanup_artifacts: true,
        }
    }
}

impl AppSection {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_seconds)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_seconds)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    /// Maximum acquisition attempts per media reference.
    pub count: u32,
    pub delay_seconds: u64,
    /// Wait after the acquisition tool has been restarted.
    pub restart_cooldown_seconds: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            count: 3,
            delay_seconds: 10,
            restart_cooldown_seconds: 30,
        }
    }
}

/// One binding as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingSection {
    pub source: SourceDescriptor,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub blog: Option<String>,
}

impl BindingSection {
    fn destinations(&self) -> Vec<Destination> {
        let mut destinations: Vec<Destination> = self
            .channels
            .iter()
            .map(|channel_id| Destination::Channel {
                channel_id: channel_id.clone(),
            })
            .collect();
        if let Some(blog) = &self.blog {
            destinations.push(Destination::Blog { blog: blog.clone() });
        }
        destinations
    }
}

fn channel_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(@[A-Za-z0-9_]+|-?\d+)$").expect("channel id pattern is a valid regex")
    })
}

impl Settings {
    /// Checks the settings and builds the immutable bindings.
    pub fn bindings(&self) -> Result<Vec<Binding>, ConfigError> {
        self.validate()?;
        let mut seen = HashSet::new();
        let mut bindings = Vec::with_capacity(self.bindings.len());
        for section in &self.bindings {
            let binding = Binding::new(section.source.clone(), section.destinations())?;
            if !seen.insert(binding.id().clone()) {
                return Err(ConfigError::DuplicateBinding(binding.id().clone()));
            }
            for channel in &section.channels {
                if !channel_id_pattern().is_match(channel) {
                    return Err(ConfigError::InvalidChannelId {
                        binding: binding.id().clone(),
                        channel: channel.clone(),
                    });
                }
            }
            bindings.push(binding);
        }
        Ok(bindings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.bindings.is_empty() {
            return Err(ConfigError::NoBindings);
        }
        let positive = [
            ("app.check_interval_seconds", self.app.check_interval_seconds),
            (
                "app.health_check_interval_seconds",
                self.app.health_check_interval_seconds,
            ),
            ("app.health_missed_cycles", self.app.health_missed_cycles as u64),
            ("retries.count", self.retries.count as u64),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "must be at least 1".into(),
                });
            }
        }
        for section in &self.bindings {
            if section.source.domain.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "bindings.source.domain",
                    reason: "must not be empty".into(),
                });
            }
            if section.source.max_count == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "bindings.source.max_count",
                    reason: format!("must be at least 1 for {}", section.source.binding_id()),
                });
            }
        }
        Ok(())
    }

    pub fn trace_loaded(&self) {
        info!(
            bindings = self.bindings.len(),
            check_interval_seconds = self.app.check_interval_seconds,
            state_file = %self.app.state_file.display(),
            retries = self.retries.count,
            "Loaded Settings"
        );
        debug!(?self, "Settings loaded (full debug)");
    }
}
