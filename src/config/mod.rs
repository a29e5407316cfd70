//! Configuration module for the surge driver.
//!
//! Configuration is loaded from environment variables using the figment
//! crate. Durations accept both numeric values (interpreted as seconds) and
//! duration strings with units; team tiers accept either a structured list
//! or a JSON string (the only practical encoding for an env var).

use fundu::{DurationParser, TimeUnit};
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;

/// Main driver configuration.
#[derive(Deserialize, Clone)]
pub struct Config {
    /// Log level for the application
    ///
    /// This value is used to set the log level for this application's target
    /// specifically, e.g. "debug" behaves like "warn,surge=debug".
    ///
    /// Valid values are: "trace", "debug", "info", "warn", "error"
    /// Defaults to "info" if not specified
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Base URL of the concurrency-queue service
    #[serde(default = "default_service_url")]
    pub service_url: String,
    /// How long the driver generates load before draining
    ///
    /// Accepts both numeric values (seconds) and duration strings
    #[serde(default = "default_duration", deserialize_with = "deserialize_duration")]
    pub duration: Duration,
    /// Maximum number of concurrently executing remote-call tasks
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    /// Per-operation metrics ring buffer capacity
    #[serde(default = "default_metrics_buffer_size")]
    pub metrics_buffer_size: usize,
    /// Interval between live progress reports
    #[serde(
        default = "default_report_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub report_interval: Duration,
    /// Whether the correctness oracle observes the run
    #[serde(default = "default_correctness_checking")]
    pub correctness_checking: bool,
    /// Simulated processing time of one job
    #[serde(
        default = "default_job_processing_delay",
        deserialize_with = "deserialize_duration"
    )]
    pub job_processing_delay: Duration,
    /// Tenant tier definitions
    #[serde(default = "default_team_tiers", deserialize_with = "deserialize_tiers")]
    pub team_tiers: Vec<TierConfig>,
    /// Log every failed remote operation as it happens
    #[serde(default)]
    pub verbose: bool,
    /// Flush every configured tenant's remote state before generating load
    #[serde(default = "default_flush_before_run")]
    pub flush_before_run: bool,
}

/// A class of tenants sharing a concurrency limit and generation rate.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct TierConfig {
    pub name: String,
    pub team_count: usize,
    pub concurrency_limit: usize,
    pub jobs_per_second: f64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_service_url() -> String {
    "http://localhost:8910".to_string()
}

fn default_duration() -> Duration {
    Duration::from_secs(60)
}

fn default_worker_concurrency() -> usize {
    50
}

fn default_metrics_buffer_size() -> usize {
    1000
}

fn default_report_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_correctness_checking() -> bool {
    true
}

fn default_job_processing_delay() -> Duration {
    Duration::from_millis(2000)
}

fn default_flush_before_run() -> bool {
    true
}

/// Default tier mix: many small tenants, a few large ones.
fn default_team_tiers() -> Vec<TierConfig> {
    vec![
        TierConfig {
            name: "free".to_string(),
            team_count: 20,
            concurrency_limit: 2,
            jobs_per_second: 1.0,
        },
        TierConfig {
            name: "standard".to_string(),
            team_count: 5,
            concurrency_limit: 8,
            jobs_per_second: 5.0,
        },
        TierConfig {
            name: "scale".to_string(),
            team_count: 2,
            concurrency_limit: 32,
            jobs_per_second: 10.0,
        },
    ]
}

/// Duration parser configured to handle various time units with seconds as default
///
/// Supports seconds (default), milliseconds, and minutes. Does not support
/// fractions, exponents, or infinity values. Allows whitespace between the
/// number and the time unit and multiple summed units ("1m 30s").
const DURATION_PARSER: DurationParser<'static> = DurationParser::builder()
    .time_units(&[TimeUnit::Second, TimeUnit::MilliSecond, TimeUnit::Minute])
    .parse_multiple(None)
    .allow_time_unit_delimiter()
    .disable_infinity()
    .disable_fraction()
    .disable_exponent()
    .default_unit(TimeUnit::Second)
    .build();

/// Custom deserializer for duration fields that accepts both numeric and string values
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Visitor;

    struct DurationVisitor;

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a duration string or number")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            DURATION_PARSER
                .parse(value)
                .map_err(|e| {
                    serde::de::Error::custom(format!(
                        "Invalid duration format '{}': {}. Examples: '5' (5 seconds), '3500ms', '30s', '2m'",
                        value, e
                    ))
                })?
                .try_into()
                .map_err(|e| serde::de::Error::custom(format!("Duration conversion error: {}", e)))
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(Duration::from_secs(value))
        }

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            if value < 0 {
                return Err(serde::de::Error::custom("Duration cannot be negative"));
            }
            Ok(Duration::from_secs(value as u64))
        }
    }

    deserializer.deserialize_any(DurationVisitor)
}

/// Deserializer for the tier list that accepts a structured sequence or a
/// JSON-encoded string (the form an env var takes).
fn deserialize_tiers<'de, D>(deserializer: D) -> Result<Vec<TierConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Visitor;

    struct TiersVisitor;

    impl<'de> Visitor<'de> for TiersVisitor {
        type Value = Vec<TierConfig>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a list of tier objects or a JSON string")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            serde_json::from_str(value).map_err(|e| {
                serde::de::Error::custom(format!("Invalid TEAM_TIERS JSON '{}': {}", value, e))
            })
        }

        fn visit_seq<A>(self, seq: A) -> Result<Self::Value, A::Error>
        where
            A: serde::de::SeqAccess<'de>,
        {
            Deserialize::deserialize(serde::de::value::SeqAccessDeserializer::new(seq))
        }
    }

    deserializer.deserialize_any(TiersVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::{Figment, providers::Env};

    #[test]
    fn test_defaults() {
        let config: Config = Figment::new().extract().expect("defaults should load");
        assert_eq!(config.log_level, "info");
        assert_eq!(config.worker_concurrency, 50);
        assert_eq!(config.metrics_buffer_size, 1000);
        assert!(config.correctness_checking);
        assert_eq!(config.duration, Duration::from_secs(60));
        assert_eq!(config.job_processing_delay, Duration::from_millis(2000));
        assert_eq!(config.team_tiers.len(), 3);
    }

    #[test]
    fn test_duration_string_forms() {
        #[derive(Deserialize)]
        struct Wrapper {
            #[serde(deserialize_with = "deserialize_duration")]
            d: Duration,
        }

        let w: Wrapper = serde_json::from_str(r#"{"d": "1500ms"}"#).unwrap();
        assert_eq!(w.d, Duration::from_millis(1500));
        let w: Wrapper = serde_json::from_str(r#"{"d": "2m"}"#).unwrap();
        assert_eq!(w.d, Duration::from_secs(120));
        let w: Wrapper = serde_json::from_str(r#"{"d": 30}"#).unwrap();
        assert_eq!(w.d, Duration::from_secs(30));
    }

    #[test]
    fn test_tiers_from_json_string() {
        #[derive(Deserialize)]
        struct Wrapper {
            #[serde(deserialize_with = "deserialize_tiers")]
            tiers: Vec<TierConfig>,
        }

        let raw = r#"{"tiers": "[{\"name\":\"small\",\"team_count\":4,\"concurrency_limit\":1,\"jobs_per_second\":2.0}]"}"#;
        let w: Wrapper = serde_json::from_str(raw).unwrap();
        assert_eq!(w.tiers.len(), 1);
        assert_eq!(w.tiers[0].name, "small");
        assert_eq!(w.tiers[0].concurrency_limit, 1);
    }

    #[test]
    fn test_tiers_from_sequence() {
        #[derive(Deserialize)]
        struct Wrapper {
            #[serde(deserialize_with = "deserialize_tiers")]
            tiers: Vec<TierConfig>,
        }

        let raw = r#"{"tiers": [{"name":"big","team_count":2,"concurrency_limit":10,"jobs_per_second":20.0}]}"#;
        let w: Wrapper = serde_json::from_str(raw).unwrap();
        assert_eq!(w.tiers[0].team_count, 2);
    }

    #[test]
    fn test_env_override() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("SERVICE_URL", "http://queue.internal:9000");
            jail.set_env("DURATION", "10s");
            jail.set_env("VERBOSE", "true");
            let config: Config = Figment::new()
                .merge(Env::raw())
                .extract()
                .expect("config should load");
            assert_eq!(config.service_url, "http://queue.internal:9000");
            assert_eq!(config.duration, Duration::from_secs(10));
            assert!(config.verbose);
            Ok(())
        });
    }
}
