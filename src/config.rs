//! Configuration types.
//!
//! Every struct has a `Default` carrying the production policy and a
//! `from_env()` that overrides fields from `ENGAGE_*` variables. Values
//! that fail to parse are logged and replaced by the default.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::Weekday;
use regex::RegexSetBuilder;
use secrecy::SecretString;
use tracing::warn;

use crate::error::ConfigError;
use crate::model::Tier;

/// Top-level engine configuration.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub compliance: ComplianceConfig,
    pub rate_limit: RateLimitConfig,
    pub matcher: MatcherConfig,
    pub dispatch: DispatchConfig,
    pub server: ServerConfig,
    /// WhatsApp Cloud API credentials. `None` means log-only delivery.
    pub whatsapp: Option<WhatsAppConfig>,
}

impl EngineConfig {
    /// Load everything from the environment and validate it.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            compliance: ComplianceConfig::from_env(),
            rate_limit: RateLimitConfig::from_env(),
            matcher: MatcherConfig::from_env(),
            dispatch: DispatchConfig::from_env(),
            server: ServerConfig::from_env(),
            whatsapp: WhatsAppConfig::from_env(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.compliance.validate()?;
        if self.dispatch.concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "ENGAGE_DISPATCH_CONCURRENCY".into(),
                message: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

// ── Compliance ──────────────────────────────────────────────────────

/// Local business hours. Opening is inclusive, closing exclusive.
#[derive(Debug, Clone, PartialEq)]
pub struct BusinessHoursConfig {
    /// Offset of local time from UTC, in minutes. Jakarta is +420.
    pub utc_offset_minutes: i32,
    pub open_hour: u32,
    pub close_hour: u32,
    pub days: Vec<Weekday>,
}

impl Default for BusinessHoursConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: 7 * 60,
            open_hour: 8,
            close_hour: 20,
            days: vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
                Weekday::Sat,
            ],
        }
    }
}

impl BusinessHoursConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let days = match std::env::var("ENGAGE_BUSINESS_DAYS") {
            Ok(raw) => {
                let parsed: Vec<Weekday> = split_list(&raw, ',')
                    .iter()
                    .filter_map(|d| match d.parse::<Weekday>() {
                        Ok(day) => Some(day),
                        Err(_) => {
                            warn!(value = %d, "Ignoring unknown weekday in ENGAGE_BUSINESS_DAYS");
                            None
                        }
                    })
                    .collect();
                if parsed.is_empty() { defaults.days } else { parsed }
            }
            Err(_) => defaults.days,
        };

        Self {
            utc_offset_minutes: env_parse("ENGAGE_TZ_OFFSET_MINUTES", defaults.utc_offset_minutes),
            open_hour: env_parse("ENGAGE_BUSINESS_OPEN_HOUR", defaults.open_hour),
            close_hour: env_parse("ENGAGE_BUSINESS_CLOSE_HOUR", defaults.close_hour),
            days,
        }
    }
}

/// Compliance gate settings.
#[derive(Debug, Clone)]
pub struct ComplianceConfig {
    /// How long an inbound message keeps the conversation window open.
    pub window: Duration,
    /// Identical inbound bodies within this span are duplicates.
    pub duplicate_window: Duration,
    pub business_hours: BusinessHoursConfig,
    /// Case-insensitive regular expressions for prohibited content.
    pub prohibited_patterns: Vec<String>,
    pub opt_out_keywords: Vec<String>,
    pub opt_in_keywords: Vec<String>,
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(24 * 3600),
            duplicate_window: Duration::from_secs(5 * 60),
            business_hours: BusinessHoursConfig::default(),
            prohibited_patterns: Vec::new(),
            opt_out_keywords: vec!["stop".into(), "berhenti".into(), "unsubscribe".into()],
            opt_in_keywords: vec!["start".into(), "mulai".into(), "subscribe".into()],
        }
    }
}

impl ComplianceConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            window: Duration::from_secs(
                env_parse("ENGAGE_WINDOW_HOURS", defaults.window.as_secs() / 3600) * 3600,
            ),
            duplicate_window: Duration::from_secs(
                env_parse(
                    "ENGAGE_DUPLICATE_WINDOW_MINUTES",
                    defaults.duplicate_window.as_secs() / 60,
                ) * 60,
            ),
            business_hours: BusinessHoursConfig::from_env(),
            // `;` separated since patterns may contain commas.
            prohibited_patterns: env_list("ENGAGE_PROHIBITED_PATTERNS", ';')
                .unwrap_or(defaults.prohibited_patterns),
            opt_out_keywords: env_list("ENGAGE_OPT_OUT_KEYWORDS", ',')
                .unwrap_or(defaults.opt_out_keywords),
            opt_in_keywords: env_list("ENGAGE_OPT_IN_KEYWORDS", ',')
                .unwrap_or(defaults.opt_in_keywords),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let hours = &self.business_hours;
        if hours.open_hour >= hours.close_hour || hours.close_hour > 24 {
            return Err(ConfigError::InvalidValue {
                key: "ENGAGE_BUSINESS_OPEN_HOUR/ENGAGE_BUSINESS_CLOSE_HOUR".into(),
                message: format!("{}..{} is not a valid range", hours.open_hour, hours.close_hour),
            });
        }
        if hours.utc_offset_minutes.abs() >= 24 * 60 {
            return Err(ConfigError::InvalidValue {
                key: "ENGAGE_TZ_OFFSET_MINUTES".into(),
                message: format!("{} is out of range", hours.utc_offset_minutes),
            });
        }
        RegexSetBuilder::new(&self.prohibited_patterns)
            .case_insensitive(true)
            .build()?;
        Ok(())
    }
}

// ── Rate limits ─────────────────────────────────────────────────────

/// Caps per fixed window.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    pub per_minute: u64,
    pub per_hour: u64,
    pub daily_basic: u64,
    pub daily_premium: u64,
    pub daily_enterprise: u64,
    /// Shared by all contacts.
    pub global_per_minute: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_minute: 5,
            per_hour: 30,
            daily_basic: 100,
            daily_premium: 500,
            daily_enterprise: 2000,
            global_per_minute: 100,
        }
    }
}

impl RateLimitConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            per_minute: env_parse("ENGAGE_LIMIT_PER_MINUTE", d.per_minute),
            per_hour: env_parse("ENGAGE_LIMIT_PER_HOUR", d.per_hour),
            daily_basic: env_parse("ENGAGE_LIMIT_DAILY_BASIC", d.daily_basic),
            daily_premium: env_parse("ENGAGE_LIMIT_DAILY_PREMIUM", d.daily_premium),
            daily_enterprise: env_parse("ENGAGE_LIMIT_DAILY_ENTERPRISE", d.daily_enterprise),
            global_per_minute: env_parse("ENGAGE_LIMIT_GLOBAL_PER_MINUTE", d.global_per_minute),
        }
    }

    pub fn daily_cap(&self, tier: Tier) -> u64 {
        match tier {
            Tier::Basic => self.daily_basic,
            Tier::Premium => self.daily_premium,
            Tier::Enterprise => self.daily_enterprise,
        }
    }
}

// ── Rule matcher ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct MatcherConfig {
    /// Minimum keyword-overlap score for template-category rules.
    pub min_confidence: f32,
    /// Initial state of the master switch.
    pub automation_enabled: bool,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.7,
            automation_enabled: true,
        }
    }
}

impl MatcherConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            min_confidence: env_parse("ENGAGE_TEMPLATE_MIN_CONFIDENCE", d.min_confidence),
            automation_enabled: env_parse("ENGAGE_AUTOMATION_ENABLED", d.automation_enabled),
        }
    }
}

// ── Dispatch ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each further attempt.
    pub base_backoff: Duration,
    /// Upper bound of the random delay added to each backoff.
    pub max_jitter: Duration,
    /// A gateway call running longer than this counts as a failed attempt.
    pub send_timeout: Duration,
    /// Upper bound on a gateway `Retry-After` hint used as backoff.
    pub max_retry_hint: Duration,
    /// Contacts served in parallel.
    pub concurrency: usize,
    /// Average send time, used for queue position estimates.
    pub estimated_send: Duration,
    /// How long sent and terminally failed items stay in memory.
    pub retention: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_secs(2),
            max_jitter: Duration::from_millis(250),
            send_timeout: Duration::from_secs(15),
            max_retry_hint: Duration::from_secs(300),
            concurrency: 8,
            estimated_send: Duration::from_secs(1),
            retention: Duration::from_secs(24 * 3600),
        }
    }
}

impl DispatchConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_attempts: env_parse("ENGAGE_DISPATCH_MAX_ATTEMPTS", d.max_attempts).max(1),
            base_backoff: Duration::from_millis(env_parse(
                "ENGAGE_DISPATCH_BACKOFF_MS",
                d.base_backoff.as_millis() as u64,
            )),
            max_jitter: Duration::from_millis(env_parse(
                "ENGAGE_DISPATCH_JITTER_MS",
                d.max_jitter.as_millis() as u64,
            )),
            send_timeout: Duration::from_secs(env_parse(
                "ENGAGE_SEND_TIMEOUT_SECS",
                d.send_timeout.as_secs(),
            )),
            max_retry_hint: Duration::from_secs(env_parse(
                "ENGAGE_MAX_RETRY_HINT_SECS",
                d.max_retry_hint.as_secs(),
            )),
            concurrency: env_parse("ENGAGE_DISPATCH_CONCURRENCY", d.concurrency),
            estimated_send: Duration::from_millis(env_parse(
                "ENGAGE_ESTIMATED_SEND_MS",
                d.estimated_send.as_millis() as u64,
            )),
            retention: Duration::from_secs(
                env_parse("ENGAGE_RETENTION_HOURS", d.retention.as_secs() / 3600) * 3600,
            ),
        }
    }
}

// ── Server ──────────────────────────────────────────────────────────

/// Which counter store backs the rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterBackend {
    /// Shared `rate_counters` table in the database.
    Sql,
    /// Local to this process.
    Memory,
}

impl FromStr for CounterBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sql" | "libsql" => Ok(Self::Sql),
            "memory" | "in_process" => Ok(Self::Memory),
            other => Err(format!("unknown counter store: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub counter_backend: CounterBackend,
    /// Directory for daily-rolling log files. Stdout only when unset.
    pub log_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            db_path: PathBuf::from("./data/engage.db"),
            counter_backend: CounterBackend::Sql,
            log_dir: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            host: std::env::var("ENGAGE_HOST").unwrap_or(d.host),
            port: env_parse("ENGAGE_PORT", d.port),
            db_path: std::env::var("ENGAGE_DB_PATH").map(PathBuf::from).unwrap_or(d.db_path),
            counter_backend: env_parse("ENGAGE_COUNTER_STORE", d.counter_backend),
            log_dir: std::env::var("ENGAGE_LOG_DIR").ok().map(PathBuf::from),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// ── WhatsApp Cloud API ──────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct WhatsAppConfig {
    pub api_base: String,
    pub phone_number_id: String,
    pub access_token: SecretString,
}

impl WhatsAppConfig {
    /// Returns `None` unless both the phone number id and token are set.
    pub fn from_env() -> Option<Self> {
        let phone_number_id = std::env::var("WHATSAPP_PHONE_NUMBER_ID").ok()?;
        let access_token = std::env::var("WHATSAPP_ACCESS_TOKEN").ok()?;
        let api_base = std::env::var("WHATSAPP_API_BASE")
            .unwrap_or_else(|_| "https://graph.facebook.com/v21.0".to_string());

        Some(Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            phone_number_id,
            access_token: SecretString::from(access_token),
        })
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = %raw, "Invalid value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_list(key: &str, separator: char) -> Option<Vec<String>> {
    std::env::var(key).ok().map(|raw| split_list(&raw, separator))
}

fn split_list(raw: &str, separator: char) -> Vec<String> {
    raw.split(separator)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_policy() {
        let config = EngineConfig::default();
        assert_eq!(config.compliance.window, Duration::from_secs(86_400));
        assert_eq!(config.compliance.business_hours.utc_offset_minutes, 420);
        assert_eq!(config.rate_limit.daily_cap(Tier::Premium), 500);
        assert_eq!(config.rate_limit.global_per_minute, 100);
        assert_eq!(config.dispatch.max_attempts, 3);
        assert!((config.matcher.min_confidence - 0.7).abs() < f32::EPSILON);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn invalid_pattern_is_a_config_error() {
        let mut config = ComplianceConfig::default();
        config.prohibited_patterns = vec!["(unclosed".into()];
        assert!(matches!(config.validate(), Err(ConfigError::InvalidPattern(_))));
    }

    #[test]
    fn inverted_business_hours_rejected() {
        let mut config = ComplianceConfig::default();
        config.business_hours.open_hour = 20;
        config.business_hours.close_hour = 8;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn counter_backend_parses() {
        assert_eq!("SQL".parse::<CounterBackend>(), Ok(CounterBackend::Sql));
        assert_eq!("memory".parse::<CounterBackend>(), Ok(CounterBackend::Memory));
        assert!("redis".parse::<CounterBackend>().is_err());
    }

    #[test]
    fn split_list_drops_blanks() {
        assert_eq!(split_list(" stop, ,berhenti ", ','), vec!["stop", "berhenti"]);
    }

    #[test]
    fn whatsapp_config_requires_credentials() {
        // SAFETY: no other test reads these variables.
        unsafe {
            std::env::remove_var("WHATSAPP_PHONE_NUMBER_ID");
            std::env::remove_var("WHATSAPP_ACCESS_TOKEN");
        }
        assert!(WhatsAppConfig::from_env().is_none());
    }
}
