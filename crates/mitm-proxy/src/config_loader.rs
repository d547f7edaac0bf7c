use std::env;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::de::DeserializeOwned;

pub const CONFIG_DIR_ENV: &str = "GAME_MITM_CONFIG_DIR";

/// Locates and parses TOML files for the relay.
///
/// Search order:
/// 1) `GAME_MITM_CONFIG_DIR/<relative_path>`
/// 2) `./<relative_path>`
/// 3) `<repo_root>/config/<relative_path>` (repo-local convenience)
pub struct ConfigLoader;

impl ConfigLoader {
    pub fn parse_from_file<T: DeserializeOwned>(relative_path: &str) -> anyhow::Result<T> {
        let path = Self::resolve_path(relative_path)?;
        let text = Self::read(&path)?;
        Self::parse_from_string(text)
            .with_context(|| format!("Failed to parse config at {}", path.display()))
    }

    pub fn parse_from_string<T: DeserializeOwned>(text: String) -> anyhow::Result<T> {
        toml::from_str(&text).with_context(|| "Failed to parse TOML")
    }

    /// Reads a file found through the search order, or an absolute path as is.
    pub fn read_text(path: &Path) -> anyhow::Result<String> {
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            Self::resolve_path(&path.to_string_lossy())?
        };
        Self::read(&path)
    }

    pub fn exists(relative_path: &str) -> bool {
        Self::resolve_path(relative_path).is_ok()
    }

    fn read(path: &Path) -> anyhow::Result<String> {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config at {}", path.display()))
    }

    pub fn resolve_path(relative_path: &str) -> anyhow::Result<PathBuf> {
        let rel = Path::new(relative_path);

        if let Some(root) = env::var_os(CONFIG_DIR_ENV) {
            let candidate = PathBuf::from(root).join(rel);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }

        if let Ok(cwd) = env::current_dir() {
            let candidate = cwd.join(rel);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }

        // This crate lives at <repo_root>/crates/mitm-proxy.
        let candidate = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .ancestors()
            .nth(2)
            .ok_or_else(|| anyhow::anyhow!("CARGO_MANIFEST_DIR has insufficient ancestors"))?
            .join("config")
            .join(rel);
        if candidate.is_file() {
            return Ok(candidate);
        }

        anyhow::bail!("Config file not found for {:?}", rel);
    }
}
