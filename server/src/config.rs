//! Server configuration, read once from the environment at startup.

use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::warn;

pub const DEFAULT_GRACE_PERIOD_MS: u64 = 30_000;
pub const DEFAULT_MAX_GRACE_PERIOD_MS: u64 = 300_000;
pub const MIN_HMAC_SECRET_LEN: usize = 32;

/// Immutable runtime configuration. The grace period is the one exception:
/// it is re-read through an atomic every time a timer is armed so tests can
/// tighten it on a live server.
#[derive(Debug)]
pub struct ServerConfig {
    pub port: u16,
    pub address: IpAddr,
    pub secure: bool,
    pub domain: Option<String>,
    pub max_sockets: usize,
    pub admin_port: Option<u16>,
    pub admin_address: IpAddr,
    pub port_range: Option<(u16, u16)>,
    pub landing: String,
    pub http_proxy_port: Option<u16>,
    pub https_proxy_port: Option<u16>,
    pub retry_after_secs: u64,
    pub(crate) grace_period_ms: AtomicU64,
    pub max_grace_period_ms: u64,
    pub ip_validation_strict: bool,
    pub trust_proxy: bool,
    pub request_timeout: Duration,
    pub websocket_timeout: Duration,
    pub socket_check_interval: Duration,
    pub hmac_secret: Option<String>,
    pub hmac_timestamp_tolerance_secs: i64,
    pub hmac_nonce_threshold_secs: i64,
    pub hmac_nonce_cache_ttl: Duration,
    pub nonce_cleanup_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 80,
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            secure: false,
            domain: None,
            max_sockets: 10,
            admin_port: None,
            admin_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port_range: None,
            landing: "https://localtunnel.github.io/www/".to_string(),
            http_proxy_port: None,
            https_proxy_port: None,
            retry_after_secs: 5,
            grace_period_ms: AtomicU64::new(DEFAULT_GRACE_PERIOD_MS),
            max_grace_period_ms: DEFAULT_MAX_GRACE_PERIOD_MS,
            ip_validation_strict: false,
            trust_proxy: false,
            request_timeout: Duration::from_millis(5_000),
            websocket_timeout: Duration::from_millis(10_000),
            socket_check_interval: Duration::from_millis(100),
            hmac_secret: None,
            hmac_timestamp_tolerance_secs: 60,
            hmac_nonce_threshold_secs: 3_600,
            hmac_nonce_cache_ttl: Duration::from_secs(7_200),
            nonce_cleanup_interval: Duration::from_millis(60_000),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary key lookup. `from_env` passes
    /// the process environment; tests pass a closure over a map.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let max_grace_period_ms =
            parse_or(&get, "LT_MAX_GRACE_PERIOD", DEFAULT_MAX_GRACE_PERIOD_MS);
        let grace_period_ms = grace_period_from(&get, max_grace_period_ms);

        let port_range = port_range_from(&get);

        let hmac_secret = hmac_secret_from(&get)?;

        let hmac_nonce_threshold_secs =
            parse_or(&get, "LT_HMAC_NONCE_THRESHOLD", defaults.hmac_nonce_threshold_secs);
        let mut nonce_ttl_secs =
            parse_or(&get, "LT_HMAC_NONCE_CACHE_TTL", defaults.hmac_nonce_cache_ttl.as_secs());
        if (nonce_ttl_secs as i64) < hmac_nonce_threshold_secs {
            warn!(
                ttl = nonce_ttl_secs,
                threshold = hmac_nonce_threshold_secs,
                "nonce cache TTL below nonce threshold, raising TTL"
            );
            nonce_ttl_secs = hmac_nonce_threshold_secs.max(0) as u64;
        }

        Ok(Self {
            port: parse_or(&get, "LT_PORT", defaults.port),
            address: parse_or(&get, "LT_ADDRESS", defaults.address),
            secure: flag(&get, "LT_SECURE"),
            domain: get("LT_DOMAIN").map(|d| d.trim().to_string()).filter(|d| !d.is_empty()),
            max_sockets: parse_or(&get, "LT_MAX_SOCKETS", defaults.max_sockets).max(1),
            admin_port: get("LT_ADMIN_PORT").and_then(|v| v.trim().parse().ok()),
            admin_address: parse_or(&get, "LT_ADMIN_ADDRESS", defaults.admin_address),
            port_range,
            landing: get("LT_LANDING")
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty())
                .unwrap_or(defaults.landing),
            http_proxy_port: get("LT_HTTP_PROXY_PORT").and_then(|v| v.trim().parse().ok()),
            https_proxy_port: get("LT_HTTPS_PROXY_PORT").and_then(|v| v.trim().parse().ok()),
            retry_after_secs: parse_or(&get, "LT_RETRY_AFTER", defaults.retry_after_secs),
            grace_period_ms: AtomicU64::new(grace_period_ms),
            max_grace_period_ms,
            ip_validation_strict: flag(&get, "LT_IP_VALIDATION_STRICT"),
            trust_proxy: flag(&get, "LT_TRUST_PROXY"),
            request_timeout: Duration::from_millis(parse_or(&get, "LT_REQUEST_TIMEOUT", 5_000)),
            websocket_timeout: Duration::from_millis(parse_or(
                &get,
                "LT_WEBSOCKET_TIMEOUT",
                10_000,
            )),
            socket_check_interval: Duration::from_millis(parse_or(
                &get,
                "LT_SOCKET_CHECK_INTERVAL",
                100,
            )),
            hmac_secret,
            hmac_timestamp_tolerance_secs: parse_or(
                &get,
                "LT_HMAC_TIMESTAMP_TOLERANCE",
                defaults.hmac_timestamp_tolerance_secs,
            ),
            hmac_nonce_threshold_secs,
            hmac_nonce_cache_ttl: Duration::from_secs(nonce_ttl_secs),
            nonce_cleanup_interval: Duration::from_millis(parse_or(
                &get,
                "LT_NONCE_CLEANUP_INTERVAL",
                60_000,
            )),
        })
    }

    /// Current grace period, clamped to the configured maximum.
    pub fn grace_period(&self) -> Duration {
        let ms = self
            .grace_period_ms
            .load(Ordering::Relaxed)
            .min(self.max_grace_period_ms);
        Duration::from_millis(ms)
    }

    pub fn set_grace_period_ms(&self, ms: u64) {
        self.grace_period_ms.store(ms, Ordering::Relaxed);
    }
}

fn parse_or<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match get(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = %raw, "unparsable configuration value, using default");
                default
            }
        },
        None => default,
    }
}

fn flag(get: &impl Fn(&str) -> Option<String>, key: &str) -> bool {
    matches!(
        get(key).as_deref().map(str::trim),
        Some("true") | Some("1")
    )
}

/// Negative or non-numeric values fall back to the default; values over the
/// maximum clamp down.
fn grace_period_from(get: &impl Fn(&str) -> Option<String>, max_ms: u64) -> u64 {
    let ms = match get("LT_GRACE_PERIOD") {
        Some(raw) => match raw.trim().parse::<i64>() {
            Ok(v) if v >= 0 => v as u64,
            _ => {
                warn!(value = %raw, "invalid LT_GRACE_PERIOD, using default");
                DEFAULT_GRACE_PERIOD_MS
            }
        },
        None => DEFAULT_GRACE_PERIOD_MS,
    };
    ms.min(max_ms)
}

fn port_range_from(get: &impl Fn(&str) -> Option<String>) -> Option<(u16, u16)> {
    let lo: u16 = get("LT_PORT_RANGE_START")?.trim().parse().ok()?;
    let hi: u16 = get("LT_PORT_RANGE_END")?.trim().parse().ok()?;
    if lo == 0 || lo > hi {
        warn!(lo, hi, "invalid port range, ignoring");
        return None;
    }
    Some((lo, hi))
}

/// `LT_HMAC_SECRET` wins; otherwise the first line of the file named by
/// `FILE_LT_HMAC_SECRET`. A configured secret shorter than the minimum is a
/// startup fatal.
fn hmac_secret_from(get: &impl Fn(&str) -> Option<String>) -> Result<Option<String>> {
    let secret = match get("LT_HMAC_SECRET").map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
    {
        Some(secret) => Some(secret),
        None => match get("FILE_LT_HMAC_SECRET") {
            Some(path) => {
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading HMAC secret file {path}"))?;
                content
                    .lines()
                    .next()
                    .map(|line| line.trim().to_string())
                    .filter(|s| !s.is_empty())
            }
            None => None,
        },
    };
    if let Some(secret) = &secret {
        if secret.len() < MIN_HMAC_SECRET_LEN {
            bail!("HMAC secret must be at least {MIN_HMAC_SECRET_LEN} characters");
        }
    }
    Ok(secret)
}
