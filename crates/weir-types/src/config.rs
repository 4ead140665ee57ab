use anyhow::{anyhow, bail};
use arc_swap::ArcSwapOption;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use regex::Regex;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Debug, Formatter};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::warn;

const DEFAULT_CONFIG: &str = include_str!("../default.toml");

static CONFIG: ArcSwapOption<Config> = ArcSwapOption::const_empty();

/// Loads the global configuration. Fails if it is invalid or has already been loaded.
pub fn initialize_config(path: Option<&Path>) -> anyhow::Result<()> {
    let mut paths = vec![];
    if let Some(path) = path {
        if !path.exists() {
            bail!(
                "cannot load configuration from {}; file does not exist",
                path.to_string_lossy()
            );
        }
        paths.push(path.to_path_buf());
    }

    let mut config: Config = load_config(&paths)
        .extract()
        .map_err(|errors| anyhow!("configuration is invalid: {}", errors))?;
    config.config_path = path.map(|p| p.to_path_buf());

    let current = CONFIG.load();
    if current.is_none()
        && CONFIG
            .compare_and_swap(current, Some(Arc::new(config)))
            .is_none()
    {
        return Ok(());
    }

    bail!("unable to initialize configuration; it's already initialized")
}

pub fn update<F: Fn(&mut Config)>(f: F) {
    CONFIG.rcu(|c| {
        let mut new = match c.as_ref() {
            Some(c) => (**c).clone(),
            None => default_config(),
        };
        f(&mut new);
        Some(Arc::new(new))
    });
}

pub fn config() -> Arc<Config> {
    let cur = CONFIG.load();
    if cur.is_none() {
        warn!("Config accessed before initialization! This should only happen in tests.");
        CONFIG.compare_and_swap(cur, Some(Arc::new(default_config())));
    } else {
        drop(cur);
    }

    CONFIG
        .load_full()
        .unwrap_or_else(|| Arc::new(default_config()))
}

fn default_config() -> Config {
    load_config(&[])
        .extract()
        .expect("embedded default configuration must be valid")
}

fn load_config(paths: &[PathBuf]) -> Figment {
    // Priority (from highest--overriding--to lowest--overridden) is:
    //   1. WEIR__* environment variables
    //   2. The config files passed in <paths>
    //   3. weir.toml in the current directory
    //   4. ../default.toml
    let mut figment = Figment::from(Toml::string(DEFAULT_CONFIG)).admerge(Toml::file("weir.toml"));

    for path in paths {
        figment = figment.admerge(Toml::file(path));
    }

    figment.admerge(
        Env::prefixed("WEIR__").map(|p| p.as_str().replace("__", ".").replace('_', "-").into()),
    )
}

/// Weir configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// URL of an object store or filesystem that externalized checkpoints are written under
    pub checkpoint_url: String,

    /// Checkpoint coordination settings
    pub checkpoint: CheckpointConfig,

    /// Logging config
    pub logging: LogConfig,

    /// Path to the config file
    pub config_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct CheckpointConfig {
    /// How long a checkpoint may stay pending before the coordinator expires it
    pub timeout: HumanReadableDuration,

    /// Number of messages that may queue up for a checkpoint actor before senders wait
    pub actor_queue_size: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct LogConfig {
    /// Set the log format
    #[serde(default)]
    pub format: LogFormat,

    /// Nonblocking logging may reduce tail latency at the cost of higher memory usage
    #[serde(default)]
    pub nonblocking: bool,

    /// Number of lines to buffer before dropping logs; only used when nonblocking is set
    pub buffered_lines_limit: usize,

    /// Whether to record the source line number in logs
    #[serde(default)]
    pub enable_file_line: bool,

    /// Whether to record the source file name in logs
    #[serde(default)]
    pub enable_file_name: bool,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Plaintext,
    Json,
    Logfmt,
}

#[derive(Clone)]
pub struct HumanReadableDuration {
    duration: Duration,
    original: String,
}

impl From<Duration> for HumanReadableDuration {
    fn from(value: Duration) -> Self {
        Self {
            duration: value,
            original: format!("{}ms", value.as_millis()),
        }
    }
}

impl Deref for HumanReadableDuration {
    type Target = Duration;

    fn deref(&self) -> &Self::Target {
        &self.duration
    }
}

impl Debug for HumanReadableDuration {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.original.fmt(f)
    }
}

impl Serialize for HumanReadableDuration {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.original)
    }
}

fn duration_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"^(\d+)\s*([a-zA-Zµ]+)$").expect("valid duration regex"))
}

impl<'de> Deserialize<'de> for HumanReadableDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let str = String::deserialize(deserializer)?;

        let invalid =
            || -> D::Error { de::Error::custom(format!("invalid duration specification '{str}'")) };
        let captures = duration_regex().captures(&str).ok_or_else(invalid)?;

        let n: u64 = captures
            .get(1)
            .and_then(|m| m.as_str().parse().ok())
            .ok_or_else(invalid)?;
        let unit = captures.get(2).map(|m| m.as_str()).ok_or_else(invalid)?;

        let duration = match unit {
            "ms" | "millis" => Duration::from_millis(n),
            "s" | "secs" | "seconds" => Duration::from_secs(n),
            "m" | "mins" | "minutes" => {
                Duration::from_secs(n.checked_mul(60).ok_or_else(invalid)?)
            }
            "h" | "hrs" | "hours" => {
                Duration::from_secs(n.checked_mul(60 * 60).ok_or_else(invalid)?)
            }
            x => return Err(de::Error::custom(format!("unknown time unit '{x}'"))),
        };

        Ok(HumanReadableDuration {
            duration,
            original: str,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_config() {
        figment::Jail::expect_with(|jail| {
            let config: Config = load_config(&[]).extract().unwrap();
            assert_eq!(*config.checkpoint.timeout, Duration::from_secs(600));
            assert_eq!(config.logging.format, LogFormat::Plaintext);

            jail.create_file(
                "weir.toml",
                r#"
            checkpoint-url = "s3://my-bucket/checkpoints"

            [logging]
            format = "logfmt"
            "#,
            )
            .unwrap();

            let config: Config = load_config(&[]).extract().unwrap();
            assert_eq!(config.checkpoint_url, "s3://my-bucket/checkpoints");
            assert_eq!(config.logging.format, LogFormat::Logfmt);

            jail.set_env("WEIR__CHECKPOINT__ACTOR_QUEUE_SIZE", 7);
            jail.set_env("WEIR__CHECKPOINT__TIMEOUT", "30s");
            let config: Config = load_config(&[]).extract().unwrap();
            assert_eq!(config.checkpoint.actor_queue_size, 7);
            assert_eq!(*config.checkpoint.timeout, Duration::from_secs(30));

            Ok(())
        });
    }

    #[test]
    fn test_unknown_keys_rejected() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("weir.toml", "not-a-setting = 5").unwrap();
            assert!(load_config(&[]).extract::<Config>().is_err());
            Ok(())
        });
    }

    #[test_case("250ms", Duration::from_millis(250))]
    #[test_case("15 s", Duration::from_secs(15))]
    #[test_case("2m", Duration::from_secs(120))]
    #[test_case("1h", Duration::from_secs(3600))]
    fn test_duration_parsing(input: &str, expected: Duration) {
        let parsed: HumanReadableDuration =
            parse_duration(input).expect("duration should parse");
        assert_eq!(*parsed, expected);
    }

    #[test]
    fn test_invalid_duration() {
        assert!(parse_duration("ten seconds").is_err());
        assert!(parse_duration("10 fortnights").is_err());
    }

    #[test_case("18446744073709551615m")]
    #[test_case("18446744073709551615h")]
    #[test_case("5124095576030432h")]
    fn test_overflowing_duration(input: &str) {
        let err = parse_duration(input).unwrap_err();
        assert!(err.to_string().contains("invalid duration"), "{}", err);
    }

    fn parse_duration(input: &str) -> Result<HumanReadableDuration, figment::Error> {
        Figment::from(("d", input)).extract_inner("d")
    }
}
