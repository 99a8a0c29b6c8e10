use std::{
    collections::HashMap,
    env,
    ffi::OsString,
    fmt, fs, io,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use clap::ValueEnum;
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;
use url::Url;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";
pub const DEFAULT_BRAND_ID: i64 = 25;
pub const DEFAULT_PAGES: u32 = 100;
pub const DEFAULT_START_PAGE: u32 = 0;
pub const DEFAULT_SIZE: u32 = 20;
pub const DEFAULT_REPEAT: u32 = 2;
pub const DEFAULT_SLEEP_SECS: f64 = 0.1;
pub const DEFAULT_TIMEOUT_SECS: f64 = 30.0;

/// Environment keys recognised by [`SettingsLayer::from_lookup`].
pub mod keys {
    pub const BASE_URL: &str = "BASE_URL";
    pub const BRAND_ID: &str = "BRAND_ID";
    pub const PAGES: &str = "PAGES";
    pub const START_PAGE: &str = "START_PAGE";
    pub const SIZE: &str = "SIZE";
    pub const SORT: &str = "SORT";
    pub const KEYWORD: &str = "KEYWORD";
    pub const REPEAT: &str = "REPEAT";
    pub const SLEEP_SEC: &str = "SLEEP_SEC";
    pub const TIMEOUT_SEC: &str = "TIMEOUT_SEC";

    pub const ALL: [&str; 10] = [
        BASE_URL,
        BRAND_ID,
        PAGES,
        START_PAGE,
        SIZE,
        SORT,
        KEYWORD,
        REPEAT,
        SLEEP_SEC,
        TIMEOUT_SEC,
    ];
}

/// Ranking modes understood by the product search endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "UPPERCASE")]
#[value(rename_all = "UPPER")]
pub enum SortMode {
    /// Most recently registered products first.
    Latest,
    /// Products ordered by popularity score.
    Popular,
    /// Cheapest products first.
    Cheap,
}

impl SortMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortMode::Latest => "LATEST",
            SortMode::Popular => "POPULAR",
            SortMode::Cheap => "CHEAP",
        }
    }
}

impl Default for SortMode {
    fn default() -> Self {
        SortMode::Popular
    }
}

impl fmt::Display for SortMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SortMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let needle = value.trim();
        [SortMode::Latest, SortMode::Popular, SortMode::Cheap]
            .into_iter()
            .find(|mode| mode.as_str().eq_ignore_ascii_case(needle))
            .ok_or_else(|| ConfigError::UnknownSort {
                value: value.to_string(),
            })
    }
}

/// Fatal configuration problems. Raised before any request is dispatched.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key}: expected {expected}, got {value:?}")]
    InvalidNumber {
        key: &'static str,
        value: String,
        expected: &'static str,
    },
    #[error("{key} must be {constraint}, got {value}")]
    OutOfRange {
        key: &'static str,
        value: String,
        constraint: &'static str,
    },
    #[error("{key}: value is not valid UTF-8")]
    NotUnicode { key: &'static str },
    #[error("unknown sort mode {value:?} (expected LATEST, POPULAR or CHEAP)")]
    UnknownSort { value: String },
    #[error("invalid base URL {value:?}: {reason}")]
    InvalidBaseUrl { value: String, reason: String },
    #[error("failed to read config file {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config file {}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Resolved configuration for a single run. Built once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunConfig {
    pub base_url: String,
    pub brand_id: i64,
    pub pages: u32,
    pub start_page: u32,
    pub size: u32,
    pub sort: SortMode,
    pub keyword: Option<String>,
    pub repeat: u32,
    #[serde(rename = "sleep_sec", serialize_with = "serialize_secs")]
    pub sleep: Duration,
    #[serde(rename = "timeout_sec", serialize_with = "serialize_secs")]
    pub timeout: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.into(),
            brand_id: DEFAULT_BRAND_ID,
            pages: DEFAULT_PAGES,
            start_page: DEFAULT_START_PAGE,
            size: DEFAULT_SIZE,
            sort: SortMode::default(),
            keyword: None,
            repeat: DEFAULT_REPEAT,
            sleep: Duration::from_secs_f64(DEFAULT_SLEEP_SECS),
            timeout: Duration::from_secs_f64(DEFAULT_TIMEOUT_SECS),
        }
    }
}

impl RunConfig {
    /// Resolve configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        SettingsLayer::from_env()?.resolve()
    }

    /// Resolve configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        SettingsLayer::from_lookup(lookup)?.resolve()
    }
}

fn serialize_secs<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(value.as_secs_f64())
}

/// One partially specified source of settings (file, environment or flags).
///
/// Layers are merged with [`SettingsLayer::merge`] and validated once by
/// [`SettingsLayer::resolve`].
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SettingsLayer {
    pub base_url: Option<String>,
    pub brand_id: Option<i64>,
    pub pages: Option<i64>,
    pub start_page: Option<i64>,
    pub size: Option<i64>,
    pub sort: Option<String>,
    pub keyword: Option<String>,
    pub repeat: Option<i64>,
    pub sleep_sec: Option<f64>,
    pub timeout_sec: Option<f64>,
}

impl SettingsLayer {
    /// Load a TOML settings file. Keys mirror the field names (`pages`, `sleep_sec`, ...).
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_os_lookup(|key| env::var_os(key))
    }

    /// Like [`SettingsLayer::from_lookup`], for raw OS strings. A value that is
    /// not valid UTF-8 is a configuration error, never "unset".
    pub fn from_os_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<OsString>,
    {
        let mut values = HashMap::new();
        for key in keys::ALL {
            if let Some(raw) = lookup(key) {
                let value = raw
                    .into_string()
                    .map_err(|_| ConfigError::NotUnicode { key })?;
                values.insert(key, value);
            }
        }
        Self::from_lookup(|key| values.get(key).cloned())
    }

    /// Read the recognised keys through `lookup`. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        Ok(Self {
            base_url: read(keys::BASE_URL),
            brand_id: parse_integer(keys::BRAND_ID, read(keys::BRAND_ID))?,
            pages: parse_integer(keys::PAGES, read(keys::PAGES))?,
            start_page: parse_integer(keys::START_PAGE, read(keys::START_PAGE))?,
            size: parse_integer(keys::SIZE, read(keys::SIZE))?,
            sort: read(keys::SORT),
            keyword: read(keys::KEYWORD),
            repeat: parse_integer(keys::REPEAT, read(keys::REPEAT))?,
            sleep_sec: parse_seconds(keys::SLEEP_SEC, read(keys::SLEEP_SEC))?,
            timeout_sec: parse_seconds(keys::TIMEOUT_SEC, read(keys::TIMEOUT_SEC))?,
        })
    }

    /// Overlay `other` on top of `self`; values present in `other` win.
    pub fn merge(self, other: SettingsLayer) -> SettingsLayer {
        SettingsLayer {
            base_url: other.base_url.or(self.base_url),
            brand_id: other.brand_id.or(self.brand_id),
            pages: other.pages.or(self.pages),
            start_page: other.start_page.or(self.start_page),
            size: other.size.or(self.size),
            sort: other.sort.or(self.sort),
            keyword: other.keyword.or(self.keyword),
            repeat: other.repeat.or(self.repeat),
            sleep_sec: other.sleep_sec.or(self.sleep_sec),
            timeout_sec: other.timeout_sec.or(self.timeout_sec),
        }
    }

    /// Apply defaults and validate every value.
    pub fn resolve(self) -> Result<RunConfig, ConfigError> {
        let defaults = RunConfig::default();

        let base_url = match self.base_url {
            Some(value) => normalize_base_url(&value)?,
            None => defaults.base_url,
        };
        let pages = bounded_u32(keys::PAGES, self.pages, defaults.pages, 1, "at least 1")?;
        let start_page = bounded_u32(
            keys::START_PAGE,
            self.start_page,
            defaults.start_page,
            0,
            "zero or greater",
        )?;
        let size = bounded_u32(keys::SIZE, self.size, defaults.size, 1, "at least 1")?;
        let repeat = bounded_u32(keys::REPEAT, self.repeat, defaults.repeat, 1, "at least 1")?;
        let sort = match self.sort {
            Some(value) => value.parse()?,
            None => defaults.sort,
        };
        let keyword = self.keyword.filter(|value| !value.is_empty());
        let sleep = seconds(keys::SLEEP_SEC, self.sleep_sec, defaults.sleep, true)?;
        let timeout = seconds(keys::TIMEOUT_SEC, self.timeout_sec, defaults.timeout, false)?;

        Ok(RunConfig {
            base_url,
            brand_id: self.brand_id.unwrap_or(defaults.brand_id),
            pages,
            start_page,
            size,
            sort,
            keyword,
            repeat,
            sleep,
            timeout,
        })
    }
}

fn parse_integer(key: &'static str, value: Option<String>) -> Result<Option<i64>, ConfigError> {
    value
        .map(|raw| {
            raw.parse::<i64>().map_err(|_| ConfigError::InvalidNumber {
                key,
                value: raw,
                expected: "an integer",
            })
        })
        .transpose()
}

fn parse_seconds(key: &'static str, value: Option<String>) -> Result<Option<f64>, ConfigError> {
    value
        .map(|raw| {
            raw.parse::<f64>().map_err(|_| ConfigError::InvalidNumber {
                key,
                value: raw,
                expected: "a number of seconds",
            })
        })
        .transpose()
}

fn bounded_u32(
    key: &'static str,
    value: Option<i64>,
    default: u32,
    min: u32,
    constraint: &'static str,
) -> Result<u32, ConfigError> {
    let Some(value) = value else {
        return Ok(default);
    };
    match u32::try_from(value) {
        Ok(parsed) if parsed >= min => Ok(parsed),
        Ok(_) => Err(ConfigError::OutOfRange {
            key,
            value: value.to_string(),
            constraint,
        }),
        Err(_) => Err(ConfigError::OutOfRange {
            key,
            value: value.to_string(),
            constraint: if value < 0 { constraint } else { "at most 4294967295" },
        }),
    }
}

fn seconds(
    key: &'static str,
    value: Option<f64>,
    default: Duration,
    allow_zero: bool,
) -> Result<Duration, ConfigError> {
    let Some(value) = value else {
        return Ok(default);
    };
    let valid = value.is_finite() && if allow_zero { value >= 0.0 } else { value > 0.0 };
    if !valid {
        return Err(ConfigError::OutOfRange {
            key,
            value: value.to_string(),
            constraint: if allow_zero {
                "a finite, non-negative number of seconds"
            } else {
                "a finite, positive number of seconds"
            },
        });
    }
    Duration::try_from_secs_f64(value).map_err(|_| ConfigError::OutOfRange {
        key,
        value: value.to_string(),
        constraint: "a representable duration",
    })
}

fn normalize_base_url(value: &str) -> Result<String, ConfigError> {
    let trimmed = value.trim().trim_end_matches('/');
    let invalid = |reason: String| ConfigError::InvalidBaseUrl {
        value: value.to_string(),
        reason,
    };
    let parsed = Url::parse(trimmed).map_err(|err| invalid(err.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme '{}'", parsed.scheme())));
    }
    if parsed.query().is_some() || parsed.fragment().is_some() {
        return Err(invalid("query strings and fragments are not allowed".into()));
    }
    Ok(trimmed.to_string())
}
