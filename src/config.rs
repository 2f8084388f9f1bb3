use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use directories::BaseDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::{
    errors::{AppError, Result},
    protocol::MAX_FRAME_SIZE,
};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub shared_secret: Option<String>,
    #[serde(default = "default_read_timeout_seconds")]
    pub read_timeout_seconds: u64,
    /// Zero leaves dispatch unbounded.
    #[serde(default)]
    pub dispatch_timeout_seconds: u64,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    #[serde(default)]
    pub repositories: Vec<String>,
    #[serde(default)]
    pub metrics_file: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shared_secret: None,
            read_timeout_seconds: default_read_timeout_seconds(),
            dispatch_timeout_seconds: 0,
            max_frame_size: default_max_frame_size(),
            repositories: Vec::new(),
            metrics_file: None,
        }
    }
}

impl Config {
    pub fn is_configured(&self) -> bool {
        self.shared_secret
            .as_deref()
            .map(str::trim)
            .is_some_and(|secret| !secret.is_empty())
    }

    pub fn secret(&self) -> Result<&str> {
        self.shared_secret
            .as_deref()
            .filter(|secret| !secret.trim().is_empty())
            .ok_or(AppError::NotConfigured)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        non_zero_seconds(self.read_timeout_seconds)
    }

    pub fn dispatch_timeout(&self) -> Option<Duration> {
        non_zero_seconds(self.dispatch_timeout_seconds)
    }
}

pub fn load() -> Result<Config> {
    load_from(&config_path()?)
}

pub fn load_from(path: &Path) -> Result<Config> {
    let mut figment =
        Figment::from(Serialized::defaults(Config::default())).merge(Env::prefixed("HOOKGATE_"));

    if path.exists() {
        figment = figment.merge(Toml::file(path));
    }

    figment.extract().map_err(|_| AppError::ConfigLoad)
}

pub fn save(config: &Config) -> Result<PathBuf> {
    let path = config_path()?;
    save_to(config, &path)?;
    Ok(path)
}

pub fn save_to(config: &Config, path: &Path) -> Result<()> {
    let Some(parent) = path.parent() else {
        return Err(AppError::HomeDirUnavailable);
    };

    fs::create_dir_all(parent).map_err(|_| AppError::WriteFile(parent.display().to_string()))?;

    let toml_text = toml::to_string_pretty(config).map_err(|_| AppError::ConfigSerialize)?;
    fs::write(path, toml_text).map_err(|_| AppError::WriteFile(path.display().to_string()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}

pub fn config_path() -> Result<PathBuf> {
    let Some(base_dirs) = BaseDirs::new() else {
        return Err(AppError::HomeDirUnavailable);
    };
    Ok(base_dirs.config_dir().join("hookgate").join("config.toml"))
}

fn non_zero_seconds(seconds: u64) -> Option<Duration> {
    (seconds > 0).then(|| Duration::from_secs(seconds))
}

fn default_read_timeout_seconds() -> u64 {
    30
}

fn default_max_frame_size() -> usize {
    MAX_FRAME_SIZE
}
