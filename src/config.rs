//! Configuration loader and validator for the enrollment bot.
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::batcher::DEFAULT_QUIET_WINDOW;
use crate::catalog::{is_valid_course_id, Catalog, CourseMeta};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    #[serde(default)]
    pub web: Web,
    pub telegram: Telegram,
    #[serde(default)]
    pub payment: Payment,
    #[serde(default)]
    pub courses: Vec<Course>,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Quiet window after the last approval before a student's batch is sent.
    #[serde(default = "default_approval_window_ms")]
    pub approval_window_ms: u64,
}

fn default_approval_window_ms() -> u64 {
    DEFAULT_QUIET_WINDOW.as_millis() as u64
}

/// Web front-end settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Web {
    pub enabled: bool,
    pub bind: String,
}

impl Default for Web {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: "0.0.0.0:8080".into(),
        }
    }
}

/// Telegram bot settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Telegram {
    pub bot_token: String,
    pub admin_id: i64,
}

/// Account numbers shown to students for each payment channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Payment {
    #[serde(default)]
    pub sham_number: String,
    #[serde(default)]
    pub haram_number: String,
}

/// One catalog entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Course {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub group_link: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` and its uploads dir).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.uploads_dir())
    }

    pub fn uploads_dir(&self) -> String {
        format!("{}/uploads", self.app.data_dir.trim_end_matches('/'))
    }

    pub fn approval_window(&self) -> Duration {
        Duration::from_millis(self.app.approval_window_ms)
    }

    pub fn web_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.web
            .bind
            .parse()
            .map_err(|_| invalid(format!("web.bind is not a socket address: {}", self.web.bind)))
    }

    pub fn catalog(&self) -> Catalog {
        Catalog::new(self.courses.iter().map(|c| {
            (
                CourseMeta {
                    id: c.id.clone(),
                    name: c.name.clone(),
                    group_link: c
                        .group_link
                        .clone()
                        .filter(|link| !link.trim().is_empty()),
                },
                c.aliases.clone(),
            )
        }))
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.approval_window_ms == 0 {
        return Err(invalid("app.approval_window_ms must be > 0"));
    }

    if cfg.telegram.bot_token.trim().is_empty() {
        return Err(invalid("telegram.bot_token must be non-empty"));
    }
    if cfg.telegram.admin_id <= 0 {
        return Err(invalid("telegram.admin_id must be a positive Telegram id"));
    }

    if cfg.web.enabled {
        cfg.web_addr()?;
    }

    let mut seen = HashSet::new();
    for course in &cfg.courses {
        if course.name.trim().is_empty() {
            return Err(invalid(format!("courses.{}.name must be non-empty", course.id)));
        }
        for id in std::iter::once(&course.id).chain(course.aliases.iter()) {
            if !is_valid_course_id(id) {
                return Err(invalid(format!("course id '{}' is not a valid identifier", id)));
            }
            if !seen.insert(id.as_str()) {
                return Err(invalid(format!("course id '{}' is declared twice", id)));
            }
        }
    }

    Ok(())
}

/// Returns the example YAML content shipped with the bot.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  approval_window_ms: 3000

web:
  enabled: true
  bind: "0.0.0.0:8080"

telegram:
  bot_token: "YOUR_TELEGRAM_BOT_TOKEN"
  admin_id: 123456789

payment:
  sham_number: "0999000000"
  haram_number: "0999111111"

courses:
  - id: "python_beginner"
    name: "Python for Beginners"
    group_link: "https://t.me/+python_beginner"
  - id: "year4_sem1_neural_nets"
    name: "Neural Networks"
    group_link: "https://t.me/+neural_networks"
    aliases:
      - "y4_s1_nn"
  - id: "year3_sem1_os"
    name: "Operating Systems 1"
    aliases:
      - "y3_s1_os1"
"#
}
