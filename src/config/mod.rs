// src/config/mod.rs
// All tunables load from the environment; core components receive them as
// explicit values so tests can parameterize freely.

use once_cell::sync::Lazy;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct SleuthConfig {
    // ── Database
    pub database_url: String,
    pub sqlite_max_connections: u32,

    // ── Analyzer backends
    pub backend_base_url: String,
    pub backend_api_key: String,
    pub fast_model: String,
    pub deep_model: String,
    pub fast_max_tokens: u32,
    pub deep_max_tokens: u32,
    pub request_timeout_secs: u64,

    // ── Retry policy
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,

    // ── Cost budget (USD)
    pub run_budget_usd: f64,
    pub daily_budget_usd: f64,
    pub fast_call_estimate_usd: f64,
    pub deep_call_estimate_usd: f64,
    pub fast_price_per_ktok_usd: f64,
    pub deep_price_per_ktok_usd: f64,

    // ── Escalation & validation
    pub staleness_hours: i64,
    pub reliability_floor: f64,
    pub shortcircuit_confidence: u8,
    pub min_confidence: u8,
    pub complexity_marker_threshold: usize,
    pub reliability_smoothing: f64,

    // ── Signature
    pub signature_window_lines: usize,

    // ── Concurrency
    pub worker_count: usize,

    // ── Pattern library
    pub patterns_path: Option<String>,

    // ── Logging
    pub log_level: String,
}

fn env_var_or<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    match std::env::var(key) {
        Ok(val) => {
            // Trim whitespace and inline comments before parsing
            let clean_val = val.split('#').next().unwrap_or("").trim();
            match clean_val.parse::<T>() {
                Ok(parsed) => parsed,
                Err(_) => {
                    eprintln!("Config: {} = '{}' (parse failed, using default)", key, val);
                    default
                }
            }
        }
        Err(_) => default,
    }
}

impl SleuthConfig {
    pub fn from_env() -> Self {
        // A missing .env file is fine; plain environment variables still apply.
        let _ = dotenvy::dotenv();

        Self {
            database_url: env_var_or("DATABASE_URL", "sqlite:./sleuth.db".to_string()),
            sqlite_max_connections: env_var_or("SLEUTH_SQLITE_MAX_CONNECTIONS", 5),
            backend_base_url: env_var_or(
                "SLEUTH_BACKEND_BASE_URL",
                "https://api.anthropic.com".to_string(),
            ),
            backend_api_key: env_var_or("SLEUTH_BACKEND_API_KEY", String::new()),
            fast_model: env_var_or("SLEUTH_FAST_MODEL", "claude-3-5-haiku-latest".to_string()),
            deep_model: env_var_or("SLEUTH_DEEP_MODEL", "claude-sonnet-4-5".to_string()),
            fast_max_tokens: env_var_or("SLEUTH_FAST_MAX_TOKENS", 800),
            deep_max_tokens: env_var_or("SLEUTH_DEEP_MAX_TOKENS", 2000),
            request_timeout_secs: env_var_or("SLEUTH_REQUEST_TIMEOUT", 60),
            retry_attempts: env_var_or("SLEUTH_RETRY_ATTEMPTS", 3),
            retry_base_delay_ms: env_var_or("SLEUTH_RETRY_BASE_DELAY_MS", 250),
            run_budget_usd: env_var_or("SLEUTH_RUN_BUDGET_USD", 1.0),
            daily_budget_usd: env_var_or("SLEUTH_DAILY_BUDGET_USD", 5.0),
            fast_call_estimate_usd: env_var_or("SLEUTH_FAST_CALL_ESTIMATE_USD", 0.01),
            deep_call_estimate_usd: env_var_or("SLEUTH_DEEP_CALL_ESTIMATE_USD", 0.10),
            fast_price_per_ktok_usd: env_var_or("SLEUTH_FAST_PRICE_PER_KTOK_USD", 0.001),
            deep_price_per_ktok_usd: env_var_or("SLEUTH_DEEP_PRICE_PER_KTOK_USD", 0.015),
            staleness_hours: env_var_or("SLEUTH_STALENESS_HOURS", 2),
            reliability_floor: env_var_or("SLEUTH_RELIABILITY_FLOOR", 0.8),
            shortcircuit_confidence: env_var_or("SLEUTH_SHORTCIRCUIT_CONFIDENCE", 8),
            min_confidence: env_var_or("SLEUTH_MIN_CONFIDENCE", 7),
            complexity_marker_threshold: env_var_or("SLEUTH_COMPLEXITY_MARKER_THRESHOLD", 3),
            reliability_smoothing: env_var_or("SLEUTH_RELIABILITY_SMOOTHING", 0.2),
            signature_window_lines: env_var_or("SLEUTH_SIGNATURE_WINDOW_LINES", 20),
            worker_count: env_var_or("SLEUTH_WORKER_COUNT", 4),
            patterns_path: std::env::var("SLEUTH_PATTERNS_PATH").ok(),
            log_level: env_var_or("SLEUTH_LOG_LEVEL", "info".to_string()),
        }
    }
}

// Global config instance - loaded once at startup; the binary's view only.
// Library code takes explicit config values.
pub static CONFIG: Lazy<SleuthConfig> = Lazy::new(SleuthConfig::from_env);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = SleuthConfig::from_env();
        assert_eq!(config.retry_attempts, 3);
        assert_eq!(config.shortcircuit_confidence, 8);
        assert!(config.reliability_floor > 0.0 && config.reliability_floor <= 1.0);
    }

    #[test]
    fn test_env_var_or_strips_comments() {
        unsafe { std::env::set_var("SLEUTH_TEST_PARSE", "7 # lucky") };
        let parsed: u32 = env_var_or("SLEUTH_TEST_PARSE", 0);
        assert_eq!(parsed, 7);
        unsafe { std::env::remove_var("SLEUTH_TEST_PARSE") };
    }
}
