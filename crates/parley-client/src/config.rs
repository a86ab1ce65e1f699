use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use url::Url;

use parley_realtime::ChannelConfig;

const DEFAULT_API_URL: &str = "http://localhost:5500/api/";
const DEFAULT_SOCKET_URL: &str = "http://localhost:5500";

/// Runtime settings, read from `PARLEY_*` environment variables.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_url: Url,
    pub socket_url: Url,
    pub timeout: Duration,
    pub credentials_path: PathBuf,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub page_size: u32,
}

impl ClientConfig {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let text = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let api_url = text("PARLEY_API_URL", DEFAULT_API_URL);
        let socket_url = text("PARLEY_SOCKET_URL", DEFAULT_SOCKET_URL);

        Ok(Self {
            api_url: Url::parse(&api_url).with_context(|| format!("PARLEY_API_URL '{}'", api_url))?,
            socket_url: Url::parse(&socket_url)
                .with_context(|| format!("PARLEY_SOCKET_URL '{}'", socket_url))?,
            timeout: Duration::from_secs(number(&lookup, "PARLEY_TIMEOUT_SECS", 30)?),
            credentials_path: PathBuf::from(text("PARLEY_CREDENTIALS_PATH", "parley-credentials.json")),
            reconnect_attempts: number(&lookup, "PARLEY_RECONNECT_ATTEMPTS", 5)?,
            reconnect_delay: Duration::from_millis(number(&lookup, "PARLEY_RECONNECT_DELAY_MS", 1000)?),
            page_size: number(&lookup, "PARLEY_PAGE_SIZE", 50)?,
        })
    }

    pub fn channel(&self) -> ChannelConfig {
        ChannelConfig {
            url: self.socket_url.clone(),
            reconnect_attempts: self.reconnect_attempts,
            reconnect_delay: self.reconnect_delay,
        }
    }
}

fn number<N>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: N) -> anyhow::Result<N>
where
    N: FromStr,
    N::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} '{}'", key, raw)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> anyhow::Result<ClientConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ClientConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.api_url.as_str(), "http://localhost:5500/api/");
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.page_size, 50);
        assert_eq!(config.reconnect_attempts, 5);
        assert_eq!(config.credentials_path, PathBuf::from("parley-credentials.json"));
    }

    #[test]
    fn overrides() {
        let config = config(&[
            ("PARLEY_SOCKET_URL", "https://chat.example.com"),
            ("PARLEY_RECONNECT_DELAY_MS", "250"),
            ("PARLEY_PAGE_SIZE", " 20 "),
        ])
        .unwrap();
        let channel = config.channel();
        assert_eq!(channel.url.as_str(), "https://chat.example.com/");
        assert_eq!(channel.reconnect_delay, Duration::from_millis(250));
        assert_eq!(config.page_size, 20);
    }

    #[test]
    fn bad_number_names_the_variable() {
        let err = config(&[("PARLEY_TIMEOUT_SECS", "soon")]).unwrap_err();
        assert!(err.to_string().contains("PARLEY_TIMEOUT_SECS"));
    }
}
