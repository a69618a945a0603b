use anyhow::{Context, Result};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_TMDB_BASE: &str = "https://api.themoviedb.org/3";
const DEFAULT_LANGUAGE: &str = "en-US";
const DEFAULT_STORE_PATH: &str = "moviemate-store.json";
const DEFAULT_BIND: &str = "0.0.0.0:3146";
const DEFAULT_WATCH_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Clone)]
pub struct Config {
    pub tmdb_api_key: String,
    pub tmdb_base_url: String,
    pub tmdb_language: String,
    pub store_path: PathBuf,
    pub bind: SocketAddr,
    pub watch_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let tmdb_api_key = env::var("TMDB_API_KEY")
            .ok()
            .filter(|s| !s.is_empty())
            .context("Missing required environment variable: TMDB_API_KEY")?;

        let tmdb_base_url = optional("TMDB_BASE_URL")
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_TMDB_BASE.to_string());
        let tmdb_language =
            optional("TMDB_LANGUAGE").unwrap_or_else(|| DEFAULT_LANGUAGE.to_string());
        let store_path = optional("MOVIEMATE_STORE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_PATH));
        let bind = optional("MOVIEMATE_BIND")
            .unwrap_or_else(|| DEFAULT_BIND.to_string())
            .parse::<SocketAddr>()
            .context("MOVIEMATE_BIND must be a socket address like 0.0.0.0:3146")?;
        let watch_ms = match optional("MOVIEMATE_WATCH_INTERVAL_MS") {
            Some(v) => v
                .parse::<u64>()
                .context("MOVIEMATE_WATCH_INTERVAL_MS must be an integer")?,
            None => DEFAULT_WATCH_INTERVAL_MS,
        };

        Ok(Self {
            tmdb_api_key,
            tmdb_base_url,
            tmdb_language,
            store_path,
            bind,
            watch_interval: Duration::from_millis(watch_ms.max(50)),
        })
    }
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.trim().is_empty())
}
