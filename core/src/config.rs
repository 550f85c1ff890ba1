//! Global config singleton. Load settings.json once; the server binary and tests both call
//! `ensure_loaded()` so the first caller does the work, later callers get the same instance.
//! All deployment settings (working dir, push webhook) come from settings.json.

use std::path::PathBuf;
use std::sync::OnceLock;

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Cached config from settings.json.
pub struct Config {
    /// Root for workspace directories and the SQLite database. Default: ~/agentdeck.
    pub working_dir: PathBuf,
    /// Webhook URL that receives interaction push notifications as JSON POSTs.
    pub push_webhook_url: Option<String>,
}

/// Path to settings.json: $AGENTDECK_SETTINGS if set, else ./settings.json.
fn settings_path() -> PathBuf {
    std::env::var("AGENTDECK_SETTINGS")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("settings.json"))
}

/// Ensure config is loaded (idempotent). Loads settings.json on first call; returns the same instance afterwards.
pub fn ensure_loaded() -> &'static Config {
    CONFIG.get_or_init(|| load_settings_from(&settings_path()))
}

pub fn load_settings_from(path: &std::path::Path) -> Config {
    let Ok(data) = std::fs::read_to_string(path) else {
        return Config::default();
    };
    let Ok(root) = serde_json::from_str::<serde_json::Value>(&data) else {
        return Config::default();
    };

    let working_dir = root
        .get("working_dir")
        .and_then(|v| v.as_str())
        .map(|s| PathBuf::from(s.trim()))
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(default_working_dir);

    let push_webhook_url = root
        .get("push")
        .and_then(|p| p.get("webhook_url"))
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    Config {
        working_dir,
        push_webhook_url,
    }
}

/// Default working directory: ~/agentdeck.
fn default_working_dir() -> PathBuf {
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home).join("agentdeck")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            working_dir: default_working_dir(),
            push_webhook_url: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = load_settings_from(std::path::Path::new("/nonexistent/settings.json"));
        assert!(cfg.push_webhook_url.is_none());
        assert!(cfg.working_dir.ends_with("agentdeck") || cfg.working_dir.starts_with("/tmp"));
    }

    #[test]
    fn parses_working_dir_and_webhook() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut f = std::fs::File::create(&path).unwrap();
        write!(
            f,
            r#"{{"working_dir": "/srv/deck", "push": {{"webhook_url": "https://example.com/hook"}}}}"#
        )
        .unwrap();
        let cfg = load_settings_from(&path);
        assert_eq!(cfg.working_dir, PathBuf::from("/srv/deck"));
        assert_eq!(
            cfg.push_webhook_url.as_deref(),
            Some("https://example.com/hook")
        );
    }

    #[test]
    fn blank_values_fall_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"working_dir": "", "push": {"webhook_url": ""}}"#).unwrap();
        let cfg = load_settings_from(&path);
        assert!(cfg.push_webhook_url.is_none());
        assert!(!cfg.working_dir.as_os_str().is_empty());
    }
}
