use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

pub const DEFAULT_BACKEND_URL: &str = "http://localhost:8000";
pub const BACKEND_URL_ENV: &str = "TAGPLAN_BACKEND_URL";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    pub backend_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
        }
    }
}

/// Environment variable wins, then the config file, then localhost.
pub fn backend_url() -> Result<String> {
    if let Ok(url) = env::var(BACKEND_URL_ENV) {
        let url = url.trim();
        if !url.is_empty() {
            return Ok(url.to_string());
        }
    }
    Ok(load_config()?.backend_url)
}

pub fn load_config() -> Result<Config> {
    let path = config_path()?;
    if path.exists() {
        let data =
            fs::read_to_string(&path).with_context(|| format!("reading {:?}", path))?;
        let config: Config = serde_yaml::from_str(&data).context("parsing config file")?;
        Ok(config)
    } else {
        let config = Config::default();
        save_config(&config)?;
        Ok(config)
    }
}

pub fn save_config(config: &Config) -> Result<()> {
    let path = config_path()?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {:?}", parent))?;
    }
    let serialized = serde_yaml::to_string(config).context("serializing config")?;
    fs::write(&path, serialized).with_context(|| format!("writing {:?}", path))?;
    Ok(())
}

pub fn data_dir() -> Result<PathBuf> {
    let dirs = project_dirs()?;
    Ok(dirs.data_dir().to_path_buf())
}

fn config_path() -> Result<PathBuf> {
    let dirs = project_dirs()?;
    Ok(dirs.config_dir().join("config.yml"))
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("", "", "tagplan").context("locating config directory")
}
