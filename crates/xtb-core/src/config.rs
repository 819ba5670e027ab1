use std::{env, fmt, fs, path::Path, time::Duration};

use crate::{errors::Error, reconcile::GroupSpec, supervisor::RetryPolicy, Result};

/// Display name of the shared group. There is exactly one per deployment.
pub const GROUP_NAME: &str = "Trader Chat ⭐";
pub const GROUP_DESCRIPTION: &str = "The Traders group";
pub const GROUP_IMAGE_URL: &str = "";

/// Identity that must end up as a super-admin of the group.
pub const ADMIN_IDENTITY: &str = "0x80245b9C0d2Ef322F2554922cA86Cf211a24047F";

pub const DEFAULT_STREAM_MAX_ATTEMPTS: u32 = 6;
pub const DEFAULT_STREAM_RETRY_DELAY: Duration = Duration::from_secs(10);
pub const DEFAULT_ADMIN_SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Which network deployment to talk to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NetworkEnv {
    #[default]
    Dev,
    Production,
}

impl NetworkEnv {
    /// Only the exact value `production` selects production.
    pub fn parse(v: Option<&str>) -> Self {
        match v.map(str::trim) {
            Some("production") => NetworkEnv::Production,
            _ => NetworkEnv::Dev,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NetworkEnv::Dev => "dev",
            NetworkEnv::Production => "production",
        }
    }
}

/// 32-byte signing key. `Debug` never prints the key.
#[derive(Clone, PartialEq, Eq)]
pub struct WalletKey([u8; 32]);

impl WalletKey {
    /// Accepts `0x`-prefixed or bare hex.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let hex_part = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);

        let bytes = hex::decode(hex_part)
            .map_err(|e| Error::Config(format!("WALLET_KEY is not valid hex: {e}")))?;
        let key: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
            Error::Config(format!("WALLET_KEY must be 32 bytes, got {}", b.len()))
        })?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for WalletKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WalletKey(<redacted>)")
    }
}

/// Typed configuration for the bot.
#[derive(Clone, Debug)]
pub struct Config {
    pub wallet_key: WalletKey,
    pub env: NetworkEnv,
    pub group: GroupSpec,
    pub retry: RetryPolicy,
    pub admin_settle_delay: Duration,
}

impl Config {
    /// Load from the process environment, after `.env` if one is present.
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let raw_key = lookup("WALLET_KEY").and_then(non_empty).ok_or_else(|| {
            Error::Config("WALLET_KEY environment variable is required".to_string())
        })?;
        let wallet_key = WalletKey::parse(&raw_key)?;

        let env = NetworkEnv::parse(lookup("XMTP_ENV").as_deref());

        let defaults = RetryPolicy::default();
        let max_attempts = parse_u64(&lookup, "STREAM_MAX_ATTEMPTS")?
            .map(|v| v.min(u32::MAX as u64) as u32)
            .unwrap_or(defaults.max_attempts);
        if max_attempts == 0 {
            return Err(Error::Config(
                "STREAM_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        let delay = parse_u64(&lookup, "STREAM_RETRY_DELAY_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.delay);
        let admin_settle_delay = parse_u64(&lookup, "ADMIN_SETTLE_DELAY_MS")?
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_ADMIN_SETTLE_DELAY);

        Ok(Self {
            wallet_key,
            env,
            group: GroupSpec::default(),
            retry: RetryPolicy {
                max_attempts,
                delay,
            },
            admin_settle_delay,
        })
    }
}

fn parse_u64(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<u64>> {
    let Some(raw) = lookup(key).and_then(non_empty) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<u64>()
        .map(Some)
        .map_err(|e| Error::Config(format!("{key} must be a non-negative integer: {e}")))
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for (key, val) in parse_dotenv(&contents) {
        if env::var_os(&key).is_some() {
            continue; // do not override existing env
        }
        env::set_var(key, val);
    }
}

fn parse_dotenv(contents: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        out.push((key.to_string(), val));
    }
    out
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
