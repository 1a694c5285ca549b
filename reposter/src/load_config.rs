/// `load_config` module: reads the YAML config file and the secrets from the environment.
///
/// The file holds everything static: the engine settings understood by
/// `reposter-core` (`app`, `retries`, `bindings`) plus the adapter sections
/// (`downloader`, `vk`, `telegram`, `blog`). Tokens are never read from the file;
/// they come from the environment (a `.env` file is honoured by `main`).
///
/// # Errors
/// Failures surface as `anyhow::Error` with the offending path in the message.
use anyhow::{Context, Result};
use reposter_core::config::{AppSection, BindingSection, RetrySection, Settings};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info};

pub const VK_TOKEN_VAR: &str = "VK_SERVICE_TOKEN";
pub const TELEGRAM_TOKEN_VAR: &str = "TELEGRAM_BOT_TOKEN";
pub const BLOG_TOKEN_VAR: &str = "BLOG_API_TOKEN";

#[derive(Debug, Clone, Deserialize)]
pub struct CliConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub retries: RetrySection,
    pub bindings: Vec<BindingSection>,
    #[serde(default)]
    pub downloader: DownloaderSection,
    #[serde(default)]
    pub vk: VkSection,
    #[serde(default)]
    pub telegram: TelegramSection,
    #[serde(default)]
    pub blog: Option<BlogSection>,
}

impl CliConfig {
    /// The part of the config the engine consumes.
    pub fn settings(&self) -> Settings {
        Settings {
            app: self.app.clone(),
            retries: self.retries.clone(),
            bindings: self.bindings.clone(),
        }
    }

    pub fn uses_channels(&self) -> bool {
        self.bindings.iter().any(|b| !b.channels.is_empty())
    }

    pub fn uses_blog(&self) -> bool {
        self.bindings.iter().any(|b| b.blog.is_some())
    }
}

/// How media files are obtained.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DownloaderSection {
    pub output_dir: PathBuf,
    /// Video download tool, invoked as `command args... -o <template> <url>`.
    pub command: String,
    pub args: Vec<String>,
    /// Run when the tool asks for a restart (e.g. to refresh browser cookies).
    pub restart_command: Vec<String>,
    /// Lower-case fragments of tool output that mean a restart is needed.
    pub restart_markers: Vec<String>,
    pub http_timeout_seconds: u64,
}

impl Default for DownloaderSection {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("downloads"),
            command: "yt-dlp".to_string(),
            args: vec!["--quiet".to_string(), "--no-warnings".to_string()],
            restart_command: Vec::new(),
            restart_markers: vec![
                "private video".to_string(),
                "only available for registered users".to_string(),
                "доступ ограничен".to_string(),
            ],
            http_timeout_seconds: 120,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VkSection {
    pub api_base: String,
    pub api_version: String,
    pub timeout_seconds: u64,
}

impl Default for VkSection {
    fn default() -> Self {
        Self {
            api_base: "https://api.vk.com/method".to_string(),
            api_version: "5.199".to_string(),
            timeout_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelegramSection {
    pub api_base: String,
    pub timeout_seconds: u64,
}

impl Default for TelegramSection {
    fn default() -> Self {
        Self {
            api_base: "https://api.telegram.org".to_string(),
            timeout_seconds: 120,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlogSection {
    pub api_base: String,
    #[serde(default = "default_blog_timeout")]
    pub timeout_seconds: u64,
}

fn default_blog_timeout() -> u64 {
    120
}

/// Tokens read from the environment.
#[derive(Clone, Default)]
pub struct Secrets {
    pub vk_service_token: String,
    pub telegram_bot_token: Option<String>,
    pub blog_api_token: Option<String>,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("vk_service_token", &"<redacted>")
            .field("telegram_bot_token", &self.telegram_bot_token.as_ref().map(|_| "<redacted>"))
            .field("blog_api_token", &self.blog_api_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.trim().is_empty())
}

impl Secrets {
    /// Reads the tokens `config` needs; a token for an unused destination kind is optional.
    pub fn from_env(config: &CliConfig) -> Result<Self> {
        let vk_service_token = env_var(VK_TOKEN_VAR).with_context(|| {
            error!(var = VK_TOKEN_VAR, "Missing required environment variable");
            format!("{VK_TOKEN_VAR} must be set")
        })?;
        let telegram_bot_token = env_var(TELEGRAM_TOKEN_VAR);
        if config.uses_channels() && telegram_bot_token.is_none() {
            error!(var = TELEGRAM_TOKEN_VAR, "Missing required environment variable");
            anyhow::bail!("{TELEGRAM_TOKEN_VAR} must be set when a binding posts to channels");
        }
        let blog_api_token = env_var(BLOG_TOKEN_VAR);
        if config.uses_blog() && blog_api_token.is_none() {
            error!(var = BLOG_TOKEN_VAR, "Missing required environment variable");
            anyhow::bail!("{BLOG_TOKEN_VAR} must be set when a binding posts to a blog");
        }
        info!(
            telegram = telegram_bot_token.is_some(),
            blog = blog_api_token.is_some(),
            "Secrets loaded from environment"
        );
        Ok(Self {
            vk_service_token,
            telegram_bot_token,
            blog_api_token,
        })
    }
}

/// Loads and validates the YAML config file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<CliConfig> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let config_content = match fs::read_to_string(path_ref) {
        Ok(content) => content,
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
            return Err(anyhow::anyhow!(
                "Failed to read config file {:?}: {}",
                path_ref,
                e
            ));
        }
    };

    let config: CliConfig = match serde_yaml::from_str(&config_content) {
        Ok(conf) => {
            info!(config_path = ?path_ref, "Parsed config YAML successfully");
            conf
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
            return Err(anyhow::anyhow!("Failed to parse config YAML: {e}"));
        }
    };

    let settings = config.settings();
    settings
        .bindings()
        .with_context(|| format!("Invalid bindings in {}", path_ref.display()))?;
    if config.uses_blog() && config.blog.is_none() {
        anyhow::bail!("A binding posts to a blog but the `blog` section is missing");
    }
    settings.trace_loaded();
    Ok(config)
}
