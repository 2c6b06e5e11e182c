use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::runtime::ResolvedPaths;

pub const DEFAULT_WP_CLI: &str = "wp";
pub const DEFAULT_SNAPSHOT_DIR: &str = "bootstrap/taxonomies";
pub const DEFAULT_POST_MAP: &str = "bootstrap/posts.json";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct BootstrapConfig {
    #[serde(default)]
    pub wordpress: WordpressSection,
    #[serde(default)]
    pub import: ImportSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct WordpressSection {
    /// WordPress installation directory passed to wp-cli as `--path`.
    pub path: Option<PathBuf>,
    pub cli: Option<String>,
    pub url: Option<String>,
    #[serde(default)]
    pub allow_root: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ImportSection {
    pub snapshot_dir: Option<PathBuf>,
    pub post_map: Option<PathBuf>,
}

impl BootstrapConfig {
    /// Resolve the WordPress path: env WP_PATH > config > None.
    pub fn wordpress_path(&self) -> Option<PathBuf> {
        self.wordpress_path_with_lookup(|key| env::var(key).ok())
    }

    /// Resolve the wp-cli binary: env WP_CLI > config > DEFAULT_WP_CLI.
    pub fn wp_cli(&self) -> String {
        self.wp_cli_with_lookup(|key| env::var(key).ok())
    }

    pub fn wordpress_url(&self) -> Option<String> {
        self.wordpress
            .url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_string)
    }

    pub fn snapshot_dir(&self, paths: &ResolvedPaths) -> PathBuf {
        let configured = self
            .import
            .snapshot_dir
            .as_deref()
            .unwrap_or(Path::new(DEFAULT_SNAPSHOT_DIR));
        paths.project_path(configured)
    }

    pub fn post_map_path(&self, paths: &ResolvedPaths) -> PathBuf {
        let configured = self
            .import
            .post_map
            .as_deref()
            .unwrap_or(Path::new(DEFAULT_POST_MAP));
        paths.project_path(configured)
    }

    fn wordpress_path_with_lookup<F>(&self, lookup_env: F) -> Option<PathBuf>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = env_value(&lookup_env, "WP_PATH") {
            return Some(PathBuf::from(value));
        }
        self.wordpress.path.clone()
    }

    fn wp_cli_with_lookup<F>(&self, lookup_env: F) -> String
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = env_value(&lookup_env, "WP_CLI") {
            return value;
        }
        self.wordpress
            .cli
            .clone()
            .unwrap_or_else(|| DEFAULT_WP_CLI.to_string())
    }
}

fn env_value<F>(lookup_env: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup_env(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Load and parse a BootstrapConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<BootstrapConfig> {
    if !config_path.exists() {
        return Ok(BootstrapConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: BootstrapConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}
