use std::time::Duration;

/// Utility configuration, loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Timeout for a single USB control transfer.
    pub timeout: Duration,
    /// Smallest frame width the negotiator will pick.
    pub min_width: u16,
    /// Smallest frame height the negotiator will pick.
    pub min_height: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(1000),
            min_width: 160,
            min_height: 120,
        }
    }
}

impl Config {
    /// Load configuration from `UVC_UTIL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            timeout: Duration::from_millis(parse_or(
                &lookup,
                "UVC_UTIL_TIMEOUT_MS",
                defaults.timeout.as_millis() as u64,
            )),
            min_width: parse_or(&lookup, "UVC_UTIL_MIN_WIDTH", defaults.min_width),
            min_height: parse_or(&lookup, "UVC_UTIL_MIN_HEIGHT", defaults.min_height),
        }
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
