use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{errors::Error, Result};

const DEFAULT_AUTO_REPLY: &str = "✅ Number received twice — matched in group.";

/// Typed configuration loaded from the environment.
#[derive(Clone, Debug)]
pub struct Config {
    // Telegram API credentials (from my.telegram.org)
    pub api_id: i32,
    pub api_hash: String,

    // Control surface
    pub http_bind: String,

    // Session persistence
    pub session_file: PathBuf,

    // Dispatch behavior
    pub send_delay: Duration,

    // Monitor behavior
    pub monitor_poll_interval: Duration,
    pub group_scan_limit: usize,
    pub monitor_fetch_limit: usize,
    pub auto_reply_text: String,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        // Required env vars
        let api_id_raw = env_str("TELEGRAM_API_ID").unwrap_or_default();
        let api_hash = env_str("TELEGRAM_API_HASH").unwrap_or_default();

        if api_id_raw.trim().is_empty() {
            return Err(Error::Config(
                "TELEGRAM_API_ID environment variable is required".to_string(),
            ));
        }
        let api_id = api_id_raw
            .trim()
            .parse::<i32>()
            .map_err(|_| Error::Config("TELEGRAM_API_ID must be a valid integer".to_string()))?;
        if api_hash.trim().is_empty() {
            return Err(Error::Config(
                "TELEGRAM_API_HASH environment variable is required".to_string(),
            ));
        }

        let http_bind = env_str("HTTP_BIND").unwrap_or("127.0.0.1:8080".to_string());

        let session_file =
            PathBuf::from(env_str("SESSION_FILE").unwrap_or("/tmp/volley-session".to_string()));

        let send_delay = Duration::from_millis(env_u64("SEND_DELAY_MS").unwrap_or(500));

        let monitor_poll_interval =
            Duration::from_secs(env_u64("MONITOR_POLL_SECS").unwrap_or(5).max(1));
        let group_scan_limit = env_usize("GROUP_SCAN_LIMIT").unwrap_or(50);
        let monitor_fetch_limit = env_usize("MONITOR_FETCH_LIMIT").unwrap_or(20).max(1);
        let auto_reply_text = env_str("AUTO_REPLY_TEXT")
            .and_then(non_empty)
            .unwrap_or(DEFAULT_AUTO_REPLY.to_string());

        Ok(Self {
            api_id,
            api_hash,
            http_bind,
            session_file,
            send_delay,
            monitor_poll_interval,
            group_scan_limit,
            monitor_fetch_limit,
            auto_reply_text,
        })
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
