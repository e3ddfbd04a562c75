//! Saved defaults plus CLI/env resolution.
//!
//! Precedence is flag (or its env var) over `config.json` over built-in default.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::ClientError;

pub const DEFAULT_SIGNAL_URL: &str = "ws://127.0.0.1:8080/ws";

/// `config.json` is expected to be tiny.
pub const MAX_CONFIG_BYTES: u64 = 64 * 1024;
const MAX_SIGNAL_URL_LEN: usize = 2048;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SavedConfig {
    #[serde(default)]
    pub signal_url: Option<String>,
    #[serde(default)]
    pub download_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConfig {
    pub signal_url: Url,
    pub download_dir: PathBuf,
}

pub fn parse_signal_url(raw: &str) -> Result<Url, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("Signal URL is required.".to_owned());
    }
    if raw.len() > MAX_SIGNAL_URL_LEN {
        return Err(format!(
            "Signal URL is too long ({} > {} chars).",
            raw.len(),
            MAX_SIGNAL_URL_LEN
        ));
    }
    let url = Url::parse(raw).map_err(|err| format!("Signal URL is invalid: {err}"))?;
    if url.scheme() != "ws" && url.scheme() != "wss" {
        return Err("Signal URL must start with ws:// or wss:// (WebSocket).".to_owned());
    }
    Ok(url)
}

pub fn validate_saved_config(cfg: &SavedConfig) -> Result<(), ClientError> {
    let mut errors: Vec<String> = Vec::new();

    if let Some(signal_url) = cfg.signal_url.as_deref()
        && let Err(err) = parse_signal_url(signal_url)
    {
        errors.push(err);
    }

    if let Some(download_dir) = cfg.download_dir.as_deref() {
        if download_dir.as_os_str().is_empty() {
            errors.push("Download directory must not be empty.".to_owned());
        } else if download_dir.is_file() {
            errors.push(format!(
                "Download directory {} is a file.",
                download_dir.display()
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ClientError::Config(format!(
            "please fix the following:\n- {}",
            errors.join("\n- ")
        )))
    }
}

pub fn config_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("PEERDROP_CONFIG_DIR") {
        return PathBuf::from(override_dir);
    }
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("peerdrop");
    }
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".config").join("peerdrop"))
        .unwrap_or_else(|| PathBuf::from(".peerdrop"))
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

pub fn default_download_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join("Downloads").join("PeerDrop"))
        .unwrap_or_else(|| PathBuf::from("downloads"))
}

/// `Ok(None)` when no config has been saved yet.
pub fn load_config_from_path(path: &Path) -> Result<Option<SavedConfig>, ClientError> {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    if meta.len() > MAX_CONFIG_BYTES {
        return Err(ClientError::Config(format!(
            "config file {} too large: {} bytes (max {MAX_CONFIG_BYTES})",
            path.display(),
            meta.len()
        )));
    }

    let data = fs::read_to_string(path)?;
    let cfg: SavedConfig = serde_json::from_str(&data).map_err(|err| {
        ClientError::Config(format!("failed to parse {}: {err}", path.display()))
    })?;
    validate_saved_config(&cfg)?;
    Ok(Some(cfg))
}

pub fn save_config_to_path(path: &Path, cfg: &SavedConfig) -> Result<(), ClientError> {
    const MAX_ATTEMPTS: u32 = 3;
    const BACKOFF_BASE_MS: u64 = 50;

    validate_saved_config(cfg)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("json.tmp");
    let payload = serde_json::to_string_pretty(cfg)
        .map_err(|err| ClientError::Config(format!("failed to serialize config: {err}")))?;

    let mut attempt = 1;
    loop {
        let result = fs::write(&tmp_path, payload.as_bytes()).and_then(|()| fs::rename(&tmp_path, path));
        match result {
            Ok(()) => return Ok(()),
            Err(err) if attempt >= MAX_ATTEMPTS => {
                let _ = fs::remove_file(&tmp_path);
                return Err(err.into());
            }
            Err(err) => {
                tracing::warn!(attempt, path = %path.display(), "config save failed: {err}");
                let backoff_ms = BACKOFF_BASE_MS.saturating_mul(1_u64 << (attempt - 1));
                std::thread::sleep(Duration::from_millis(backoff_ms));
                attempt += 1;
            }
        }
    }
}

pub fn resolve(
    signal_url: Option<&str>,
    download_dir: Option<&Path>,
    saved: Option<&SavedConfig>,
) -> Result<ResolvedConfig, ClientError> {
    let raw_url = signal_url
        .or_else(|| saved.and_then(|cfg| cfg.signal_url.as_deref()))
        .unwrap_or(DEFAULT_SIGNAL_URL);
    let signal_url = parse_signal_url(raw_url).map_err(ClientError::Config)?;

    let download_dir = download_dir
        .map(Path::to_path_buf)
        .or_else(|| saved.and_then(|cfg| cfg.download_dir.clone()))
        .unwrap_or_else(default_download_dir);

    Ok(ResolvedConfig {
        signal_url,
        download_dir,
    })
}
