use std::{env, fmt, fs, path::Path, time::Duration};

use crate::{errors::Error, messaging::types::ChatType, Result};

pub const DEFAULT_API_URL: &str = "https://api.telegram.org";
pub const DEFAULT_ACCEPTED_STATUS_CODES: [u16; 8] = [200, 303, 400, 401, 403, 404, 429, 500];

/// Minimum spacing between sends, globally and per recipient kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacingConfig {
    /// Spacing between *any* two sends of this bot.
    pub global_min_interval: Duration,
    pub private_min_interval: Duration,
    pub group_min_interval: Duration,
    pub supergroup_min_interval: Duration,
    pub channel_min_interval: Duration,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            global_min_interval: Duration::from_millis(30),
            private_min_interval: Duration::from_millis(30),
            group_min_interval: Duration::from_secs(1),
            supergroup_min_interval: Duration::from_secs(1),
            channel_min_interval: Duration::ZERO,
        }
    }
}

impl PacingConfig {
    pub fn recipient_min_interval(&self, kind: ChatType) -> Duration {
        match kind {
            ChatType::Private => self.private_min_interval,
            ChatType::Group => self.group_min_interval,
            ChatType::Supergroup => self.supergroup_min_interval,
            ChatType::Channel => self.channel_min_interval,
        }
    }
}

/// Typed client configuration.
#[derive(Clone)]
pub struct Config {
    pub token: String,
    pub api_url: String,
    pub pacing: PacingConfig,

    // Retries
    pub max_retries: u32,
    /// Back-off before retry `n` is `retry_base * 2^n`.
    pub retry_base: Duration,

    // Timeouts
    pub answer_timeout: Duration,
    pub long_poll_timeout_secs: u64,
    pub media_timeout: Duration,

    /// HTTP statuses whose body carries an API envelope.
    pub accepted_status_codes: Vec<u16>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("token", &"<redacted>")
            .field("api_url", &self.api_url)
            .field("pacing", &self.pacing)
            .field("max_retries", &self.max_retries)
            .field("retry_base", &self.retry_base)
            .field("answer_timeout", &self.answer_timeout)
            .field("long_poll_timeout_secs", &self.long_poll_timeout_secs)
            .field("media_timeout", &self.media_timeout)
            .field("accepted_status_codes", &self.accepted_status_codes)
            .finish()
    }
}

impl Config {
    /// Defaults for everything except the credential.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            api_url: DEFAULT_API_URL.to_string(),
            pacing: PacingConfig::default(),
            max_retries: 3,
            retry_base: Duration::from_secs(1),
            answer_timeout: Duration::from_secs(60),
            long_poll_timeout_secs: 60,
            media_timeout: Duration::from_secs(15 * 60),
            accepted_status_codes: DEFAULT_ACCEPTED_STATUS_CODES.to_vec(),
        }
    }

    /// Load from the environment, reading `.env` first if present.
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_env()
    }

    /// Load from the process environment only.
    pub fn from_env() -> Result<Self> {
        let token = env_str("TELEGRAM_BOT_TOKEN").unwrap_or_default();
        if token.trim().is_empty() {
            return Err(Error::Config(
                "TELEGRAM_BOT_TOKEN environment variable is required".to_string(),
            ));
        }

        let mut cfg = Config::new(token.trim());
        if let Some(url) = env_str("TELEGRAM_API_URL").and_then(non_empty) {
            cfg.api_url = url.trim_end_matches('/').to_string();
        }

        let pacing = &mut cfg.pacing;
        if let Some(d) = env_millis("TGB_GLOBAL_MIN_INTERVAL_MS")? {
            pacing.global_min_interval = d;
        }
        if let Some(d) = env_millis("TGB_PRIVATE_MIN_INTERVAL_MS")? {
            pacing.private_min_interval = d;
        }
        if let Some(d) = env_millis("TGB_GROUP_MIN_INTERVAL_MS")? {
            pacing.group_min_interval = d;
        }
        if let Some(d) = env_millis("TGB_SUPERGROUP_MIN_INTERVAL_MS")? {
            pacing.supergroup_min_interval = d;
        }
        if let Some(d) = env_millis("TGB_CHANNEL_MIN_INTERVAL_MS")? {
            pacing.channel_min_interval = d;
        }

        if let Some(n) = env_u64("TGB_MAX_RETRIES")? {
            cfg.max_retries = u32::try_from(n)
                .map_err(|_| Error::Config(format!("TGB_MAX_RETRIES out of range: {n}")))?;
        }
        if let Some(d) = env_millis("TGB_RETRY_BASE_MS")? {
            cfg.retry_base = d;
        }
        if let Some(secs) = env_u64("TGB_ANSWER_TIMEOUT_SECS")? {
            cfg.answer_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("TGB_LONG_POLL_TIMEOUT_SECS")? {
            cfg.long_poll_timeout_secs = secs;
        }
        if let Some(secs) = env_u64("TGB_MEDIA_TIMEOUT_SECS")? {
            cfg.media_timeout = Duration::from_secs(secs);
        }
        if let Some(raw) = env_str("TGB_ACCEPTED_STATUS_CODES").and_then(non_empty) {
            cfg.accepted_status_codes = parse_csv_u16(&raw)?;
        }

        Ok(cfg)
    }

    /// Back-off before the `attempt`-th retry.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.retry_base
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
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

fn env_u64(key: &str) -> Result<Option<u64>> {
    let Some(raw) = env_str(key).and_then(non_empty) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<u64>()
        .map(Some)
        .map_err(|e| Error::Config(format!("{key}={raw:?}: {e}")))
}

fn env_millis(key: &str) -> Result<Option<Duration>> {
    Ok(env_u64(key)?.map(Duration::from_millis))
}

fn parse_csv_u16(v: &str) -> Result<Vec<u16>> {
    v.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u16>()
                .map_err(|e| Error::Config(format!("invalid status code {s:?}: {e}")))
        })
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_bot_api_limits() {
        let cfg = Config::new("t");
        assert_eq!(cfg.pacing.global_min_interval, Duration::from_millis(30));
        assert_eq!(
            cfg.pacing.recipient_min_interval(ChatType::Private),
            Duration::from_millis(30)
        );
        assert_eq!(
            cfg.pacing.recipient_min_interval(ChatType::Group),
            Duration::from_secs(1)
        );
        assert_eq!(
            cfg.pacing.recipient_min_interval(ChatType::Supergroup),
            Duration::from_secs(1)
        );
        assert_eq!(
            cfg.pacing.recipient_min_interval(ChatType::Channel),
            Duration::ZERO
        );
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.answer_timeout, Duration::from_secs(60));
        assert_eq!(cfg.accepted_status_codes.len(), 8);
    }

    #[test]
    fn backoff_doubles() {
        let mut cfg = Config::new("t");
        cfg.retry_base = Duration::from_millis(100);
        assert_eq!(cfg.backoff(1), Duration::from_millis(200));
        assert_eq!(cfg.backoff(3), Duration::from_millis(800));
    }

    #[test]
    fn debug_redacts_the_token() {
        let cfg = Config::new("123:secret");
        assert_eq!(cfg.api_url, "https://api.telegram.org");
        assert!(!format!("{cfg:?}").contains("secret"));
    }

    #[test]
    fn parses_status_code_lists() {
        assert_eq!(parse_csv_u16("200, 429,,500").unwrap(), vec![200, 429, 500]);
        assert!(parse_csv_u16("200,abc").is_err());
    }
}
