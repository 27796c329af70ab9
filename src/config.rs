use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::Weekday;
use rust_decimal::Decimal;

/// Process-level settings, read once at startup from `INNKEEP_*` variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub metrics_port: Option<u16>,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
    pub engine: EngineConfig,
}

/// Settings the engine consults while serving requests.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub pricing: PricingConfig,
    /// How long a `pending_payment` booking holds its nights.
    pub payment_timeout: Duration,
    /// Upper bound on waiting for a property's write lock.
    pub request_timeout: Duration,
    /// Bookable days ahead of today.
    pub horizon_days: i64,
    pub sync: SyncConfig,
    /// Login allowed to deliver payment results.
    pub payment_user: String,
}

#[derive(Debug, Clone)]
pub struct PricingConfig {
    /// Fraction of the subtotal charged as service fee (0.05 = 5%).
    pub service_fee_rate: Decimal,
    /// Fraction of subtotal + cleaning + service charged as tax.
    pub tax_rate: Decimal,
    pub currency: String,
    /// Decimal places of the currency's minor unit.
    pub minor_units: u32,
    /// Nights that count as weekend for `weekend_uplift` rules.
    pub weekend_days: Vec<Weekday>,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Pause between successful imports of the same link.
    pub interval: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Timeout for fetching one remote feed.
    pub fetch_timeout: Duration,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            service_fee_rate: Decimal::new(5, 2),
            tax_rate: Decimal::new(15, 2),
            currency: "USD".into(),
            minor_units: 2,
            weekend_days: vec![Weekday::Fri, Weekday::Sat],
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15 * 60),
            backoff_base: Duration::from_secs(30),
            backoff_cap: Duration::from_secs(6 * 60 * 60),
            fetch_timeout: Duration::from_secs(20),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pricing: PricingConfig::default(),
            payment_timeout: Duration::from_secs(15 * 60),
            request_timeout: Duration::from_secs(5),
            horizon_days: 730,
            sync: SyncConfig::default(),
            payment_user: "payments".into(),
        }
    }
}

impl SyncConfig {
    /// Delay before retrying a link after `failures` consecutive failures.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(20);
        self.backoff_base
            .saturating_mul(1u32 << exp)
            .min(self.backoff_cap)
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = EngineConfig::default();
        let pricing = PricingConfig {
            service_fee_rate: parse_or("INNKEEP_SERVICE_FEE_RATE", defaults.pricing.service_fee_rate)?,
            tax_rate: parse_or("INNKEEP_TAX_RATE", defaults.pricing.tax_rate)?,
            currency: env::var("INNKEEP_CURRENCY").unwrap_or(defaults.pricing.currency),
            minor_units: parse_or("INNKEEP_MINOR_UNITS", defaults.pricing.minor_units)?,
            weekend_days: match env::var("INNKEEP_WEEKEND_DAYS") {
                Ok(raw) => parse_weekdays(&raw)?,
                Err(_) => defaults.pricing.weekend_days,
            },
        };
        let rates = [pricing.service_fee_rate, pricing.tax_rate];
        if rates.iter().any(|r| r.is_sign_negative() || *r > Decimal::ONE) {
            return Err(ConfigError::Invalid(
                "INNKEEP_SERVICE_FEE_RATE/INNKEEP_TAX_RATE",
                "rate must be between 0 and 1".into(),
            ));
        }

        let sync = SyncConfig {
            interval: secs_or("INNKEEP_SYNC_INTERVAL_SECS", defaults.sync.interval)?,
            backoff_base: secs_or("INNKEEP_SYNC_BACKOFF_SECS", defaults.sync.backoff_base)?,
            backoff_cap: secs_or("INNKEEP_SYNC_BACKOFF_CAP_SECS", defaults.sync.backoff_cap)?,
            fetch_timeout: secs_or("INNKEEP_FETCH_TIMEOUT_SECS", defaults.sync.fetch_timeout)?,
        };

        let engine = EngineConfig {
            pricing,
            payment_timeout: secs_or("INNKEEP_PAYMENT_TIMEOUT_SECS", defaults.payment_timeout)?,
            request_timeout: Duration::from_millis(parse_or(
                "INNKEEP_REQUEST_TIMEOUT_MS",
                defaults.request_timeout.as_millis() as u64,
            )?),
            horizon_days: parse_or("INNKEEP_HORIZON_DAYS", defaults.horizon_days)?,
            sync,
            payment_user: env::var("INNKEEP_PAYMENT_USER").unwrap_or(defaults.payment_user),
        };
        if engine.payment_user.is_empty() {
            return Err(ConfigError::Invalid("INNKEEP_PAYMENT_USER", "must not be empty".into()));
        }

        Ok(Self {
            bind: env::var("INNKEEP_BIND").unwrap_or_else(|_| "0.0.0.0".into()),
            port: parse_or("INNKEEP_PORT", 5433)?,
            data_dir: PathBuf::from(env::var("INNKEEP_DATA_DIR").unwrap_or_else(|_| "./data".into())),
            password: env::var("INNKEEP_PASSWORD").unwrap_or_else(|_| "innkeep".into()),
            max_connections: parse_or("INNKEEP_MAX_CONNECTIONS", 256)?,
            metrics_port: match env::var("INNKEEP_METRICS_PORT") {
                Ok(raw) => Some(parse_value("INNKEEP_METRICS_PORT", &raw)?),
                Err(_) => None,
            },
            compact_threshold: parse_or("INNKEEP_COMPACT_THRESHOLD", 1000)?,
            engine,
        })
    }
}

fn parse_value<T: FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::Invalid(key, e.to_string()))
}

fn parse_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: fmt::Display,
{
    match env::var(key) {
        Ok(raw) => parse_value(key, &raw),
        Err(_) => Ok(default),
    }
}

fn secs_or(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(parse_or(key, default.as_secs())?))
}

pub fn parse_weekdays(raw: &str) -> Result<Vec<Weekday>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<Weekday>()
                .map_err(|_| ConfigError::Invalid("INNKEEP_WEEKEND_DAYS", format!("unknown weekday {s:?}")))
        })
        .collect()
}

#[derive(Debug)]
pub enum ConfigError {
    Invalid(&'static str, String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Invalid(key, reason) => write!(f, "invalid {key}: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weekday_list_parses() {
        assert_eq!(parse_weekdays("fri, sat").unwrap(), vec![Weekday::Fri, Weekday::Sat]);
        assert_eq!(parse_weekdays("Sunday").unwrap(), vec![Weekday::Sun]);
        assert!(parse_weekdays("").unwrap().is_empty());
        assert!(parse_weekdays("fri,blursday").is_err());
    }

    #[test]
    fn backoff_doubles_until_cap() {
        let sync = SyncConfig {
            interval: Duration::from_secs(60),
            backoff_base: Duration::from_secs(10),
            backoff_cap: Duration::from_secs(100),
            fetch_timeout: Duration::from_secs(5),
        };
        assert_eq!(sync.backoff(1), Duration::from_secs(10));
        assert_eq!(sync.backoff(2), Duration::from_secs(20));
        assert_eq!(sync.backoff(3), Duration::from_secs(40));
        assert_eq!(sync.backoff(4), Duration::from_secs(80));
        assert_eq!(sync.backoff(5), Duration::from_secs(100));
        assert_eq!(sync.backoff(60), Duration::from_secs(100));
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.pricing.service_fee_rate, Decimal::new(5, 2));
        assert_eq!(cfg.pricing.tax_rate, Decimal::new(15, 2));
        assert_eq!(cfg.pricing.weekend_days, vec![Weekday::Fri, Weekday::Sat]);
        assert_eq!(cfg.horizon_days, 730);
    }
}
