//! Line-oriented `key=value` store for the worker's configuration file.
//!
//! The file is kept as a list of raw lines so that comments, ordering, and
//! disabled entries (`#key=value`) survive every rewrite. Only the lines we
//! touch change.

use anyhow::{Context, Result};
use std::fmt::Display;
use std::path::{Path, PathBuf};

pub const KEY_DIR: &str = "dir";
pub const KEY_PORT: &str = "rpc-listen-port";
pub const KEY_SECRET: &str = "rpc-secret";
pub const KEY_ENABLE_RPC: &str = "enable-rpc";
pub const KEY_ALLOW_ORIGIN_ALL: &str = "rpc-allow-origin-all";
pub const KEY_INPUT_FILE: &str = "input-file";
pub const KEY_SAVE_SESSION: &str = "save-session";

/// Keys whose new value only takes effect after the worker restarts.
pub const RESTART_REQUIRED_KEYS: [&str; 3] = [KEY_PORT, KEY_SECRET, KEY_DIR];

pub fn requires_restart(key: &str) -> bool {
    RESTART_REQUIRED_KEYS.contains(&key)
}

/// A key as it appears in the file, enabled or commented out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigEntry {
    pub value: String,
    pub enabled: bool,
}

/// The worker settings the supervisor reads back as the source of truth.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelevantConfig {
    pub dir: Option<String>,
    pub port: Option<String>,
    pub secret: Option<String>,
    pub enable_rpc: Option<String>,
    pub rpc_allow_origin_all: Option<String>,
}

enum Line<'a> {
    Entry {
        key: &'a str,
        value: &'a str,
        enabled: bool,
    },
    Other,
}

fn parse_line(raw: &str) -> Line<'_> {
    let trimmed = raw.trim();
    let (body, enabled) = match trimmed.strip_prefix('#') {
        Some(rest) => (rest.trim_start(), false),
        None => (trimmed, true),
    };
    let Some((key, value)) = body.split_once('=') else {
        return Line::Other;
    };
    let key = key.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return Line::Other;
    }
    Line::Entry {
        key,
        value: value.trim(),
        enabled,
    }
}

/// Default file contents written when the config file does not exist yet.
pub fn default_config_text(download_dir: &Path) -> String {
    let dir = download_dir.to_string_lossy().replace('\\', "/");
    format!(
        "# aria2 configuration (managed by ariadock)\n\
         {KEY_DIR}={dir}\n\
         {KEY_PORT}=6800\n\
         {KEY_ALLOW_ORIGIN_ALL}=true\n\
         {KEY_ENABLE_RPC}=true\n\
         max-concurrent-downloads=5\n\
         max-connection-per-server=16\n\
         min-split-size=10M\n\
         split=16\n\
         continue=true\n\
         save-session-interval=60\n"
    )
}

/// File-backed worker configuration.
pub struct ConfigStore {
    path: PathBuf,
    lines: Vec<String>,
}

impl ConfigStore {
    /// Load an existing config file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            lines: data.lines().map(str::to_string).collect(),
        })
    }

    /// Load the config file, creating it with defaults if it is missing.
    pub fn open_or_create(path: &Path, download_dir: &Path) -> Result<Self> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            std::fs::write(path, default_config_text(download_dir))
                .with_context(|| format!("failed to write {}", path.display()))?;
            tracing::info!(path = %path.display(), "created default worker config");
        }
        Self::load(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Value of an enabled key. Commented-out entries are ignored.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.lines.iter().find_map(|raw| match parse_line(raw) {
            Line::Entry {
                key: k,
                value,
                enabled: true,
            } if k == key => Some(value),
            _ => None,
        })
    }

    /// The entry for a key, preferring an enabled line over a disabled one.
    pub fn entry(&self, key: &str) -> Option<ConfigEntry> {
        let mut disabled = None;
        for raw in &self.lines {
            if let Line::Entry {
                key: k,
                value,
                enabled,
            } = parse_line(raw)
                && k == key
            {
                let entry = ConfigEntry {
                    value: value.to_string(),
                    enabled,
                };
                if enabled {
                    return Some(entry);
                }
                disabled.get_or_insert(entry);
            }
        }
        disabled
    }

    /// Set a key and write the file.
    pub fn set(&mut self, key: &str, value: impl Display) -> Result<()> {
        self.set_in_memory(key, &value.to_string());
        self.save()
    }

    /// Set a key only if it has no enabled entry. Returns whether it wrote.
    pub fn set_if_absent(&mut self, key: &str, value: impl Display) -> Result<bool> {
        if self.get(key).is_some() {
            return Ok(false);
        }
        self.set(key, value)?;
        Ok(true)
    }

    /// Comment out a key so the worker ignores it, keeping its last value.
    pub fn disable(&mut self, key: &str) -> Result<()> {
        self.disable_in_memory(key);
        self.save()
    }

    /// Apply sets and disables together with a single write.
    pub fn apply(&mut self, sets: &[(&str, String)], disables: &[&str]) -> Result<()> {
        for (key, value) in sets {
            self.set_in_memory(key, value);
        }
        for key in disables {
            self.disable_in_memory(key);
        }
        self.save()
    }

    pub fn relevant(&self) -> RelevantConfig {
        let owned = |k: &str| self.get(k).map(str::to_string);
        RelevantConfig {
            dir: owned(KEY_DIR),
            port: owned(KEY_PORT),
            secret: owned(KEY_SECRET),
            enable_rpc: owned(KEY_ENABLE_RPC),
            rpc_allow_origin_all: owned(KEY_ALLOW_ORIGIN_ALL),
        }
    }

    fn find_line(&self, key: &str, enabled: bool) -> Option<usize> {
        self.lines.iter().position(|raw| {
            matches!(parse_line(raw), Line::Entry { key: k, enabled: e, .. } if k == key && e == enabled)
        })
    }

    fn set_in_memory(&mut self, key: &str, value: &str) {
        let line = format!("{key}={value}");
        match self
            .find_line(key, true)
            .or_else(|| self.find_line(key, false))
        {
            Some(idx) => self.lines[idx] = line,
            None => self.lines.push(line),
        }
    }

    fn disable_in_memory(&mut self, key: &str) {
        while let Some(idx) = self.find_line(key, true) {
            let current = self.lines[idx].trim().to_string();
            self.lines[idx] = format!("#{current}");
        }
        if self.find_line(key, false).is_none() {
            self.lines.push(format!("#{key}="));
        }
    }

    fn save(&self) -> Result<()> {
        let mut data = self.lines.join("\n");
        data.push('\n');
        std::fs::write(&self.path, data)
            .with_context(|| format!("failed to write {}", self.path.display()))
    }
}
