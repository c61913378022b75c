// SPDX-License-Identifier: MIT

use std::path::PathBuf;

/// Runtime configuration for the daemon, assembled from CLI flags and
/// environment variables in `main`.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub log: String,
    /// Shared secret for bridge token validation and webhook signing.
    /// `None` means bridge auth is unavailable unless `dev_bypass` is set.
    pub bridge_secret: Option<String>,
    /// Grants admin to every request and accepts any bridge token.
    /// Local development only.
    pub dev_bypass: bool,
    /// Dispatcher poll interval in seconds.
    pub poll_interval_secs: u64,
}

impl DaemonConfig {
    pub fn new(
        port: u16,
        data_dir: Option<PathBuf>,
        log: String,
        bridge_secret: Option<String>,
        dev_bypass: bool,
    ) -> Self {
        Self {
            port,
            data_dir: data_dir.unwrap_or_else(default_data_dir),
            log,
            bridge_secret,
            dev_bypass,
            poll_interval_secs: 5,
        }
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        // ~/Library/Application Support/quackd
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("quackd");
        }
    }
    #[cfg(target_os = "linux")]
    {
        // $XDG_DATA_HOME/quackd or ~/.local/share/quackd
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("quackd");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("quackd");
        }
    }
    #[cfg(target_os = "windows")]
    {
        // %APPDATA%\quackd
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("quackd");
        }
    }
    // Fallback
    PathBuf::from(".quackd")
}
