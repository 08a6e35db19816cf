use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_or(key: &str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.to_string())
}

fn env_usize(key: &str, default: usize) -> usize {
    env_opt(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env_opt(key).as_deref().map(str::to_ascii_lowercase).as_deref() {
        Some("1") | Some("true") | Some("yes") | Some("on") => true,
        Some("0") | Some("false") | Some("no") | Some("off") => false,
        _ => default,
    }
}

fn env_duration(key: &str, default: Duration) -> Duration {
    match env_opt(key) {
        Some(raw) => match parse_duration(&raw) {
            Some(d) => d,
            None => {
                tracing::warn!(key, value = %raw, "unparseable duration, using default");
                default
            }
        },
        None => default,
    }
}

/// Parse a human-readable duration string into a [`Duration`].
///
/// Supports components: `Xd` (days), `Xh` (hours), `Xm` (minutes), `Xs` (seconds).
/// Components can be combined: "2h30m", "1d12h", "90s". A bare number is seconds.
/// Returns `None` if the string is empty or unparseable.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let mut total_secs: u64 = 0;
    let mut num_buf = String::new();
    let mut found_unit = false;

    for ch in s.chars() {
        if ch.is_ascii_digit() {
            num_buf.push(ch);
        } else {
            let n: u64 = num_buf.parse().ok()?;
            num_buf.clear();
            match ch {
                'd' => total_secs += n * 86_400,
                'h' => total_secs += n * 3_600,
                'm' => total_secs += n * 60,
                's' => total_secs += n,
                _ => return None,
            }
            found_unit = true;
        }
    }

    if !num_buf.is_empty() {
        // "30m15" is ambiguous.
        if found_unit {
            return None;
        }
        total_secs += num_buf.parse::<u64>().ok()?;
    }

    Some(Duration::from_secs(total_secs))
}

// ── Detection config ──────────────────────────────────────────

/// Runtime settings for the detection engine and its reprocessing pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Capacity of the bounded reprocessing task queue.
    pub queue_size: usize,
    /// Interval of the periodic full-fleet reprocessing pass.
    pub reprocess_interval: Duration,
    /// Window in which bursts of policy change notifications collapse.
    pub policy_throttle: Duration,
    /// Directory scanned for policy YAML documents.
    pub policy_dir: PathBuf,
    /// Whether SCALE_TO_ZERO enforcement may be emitted at all.
    pub scale_to_zero_enabled: bool,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            queue_size: 1024,
            reprocess_interval: Duration::from_secs(4 * 3_600),
            policy_throttle: Duration::from_secs(5),
            policy_dir: PathBuf::from("data/policies"),
            scale_to_zero_enabled: true,
        }
    }
}

impl DetectionConfig {
    /// Build config from environment variables (call `load_dotenv()` first).
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            queue_size: env_usize("STACKWATCH_QUEUE_SIZE", defaults.queue_size).max(1),
            reprocess_interval: env_duration(
                "STACKWATCH_REPROCESS_INTERVAL",
                defaults.reprocess_interval,
            ),
            policy_throttle: env_duration("STACKWATCH_POLICY_THROTTLE", defaults.policy_throttle),
            policy_dir: PathBuf::from(env_or("STACKWATCH_POLICY_DIR", "data/policies")),
            scale_to_zero_enabled: env_bool(
                "STACKWATCH_SCALE_TO_ZERO",
                defaults.scale_to_zero_enabled,
            ),
        }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Detection config loaded:");
        tracing::info!("  queue:       size={}", self.queue_size);
        tracing::info!("  reprocess:   interval={:?}", self.reprocess_interval);
        tracing::info!("  throttle:    window={:?}", self.policy_throttle);
        tracing::info!("  policies:    dir={}", self.policy_dir.display());
        tracing::info!("  enforcement: scale_to_zero={}", self.scale_to_zero_enabled);
    }
}
