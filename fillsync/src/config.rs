//! Settings for every phase, loaded from the environment. Anything not set falls back to the
//! `DEFAULT_*` values below.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::datapoint::Timestamp;
use crate::error::{Error, Result};

const DEFAULT_BACKFILL_HORIZON: Duration = Duration::from_secs(7 * 24 * 60 * 60);
// the source only answers 10 minutes of history per query
const DEFAULT_MAX_QUERY_SPAN: Duration = Duration::from_secs(10 * 60);
const DEFAULT_PARALLELISM: usize = 2;
const DEFAULT_BACKFILL_PACING: Duration = Duration::from_millis(1500);
const DEFAULT_BACKFILL_TARGET_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_BACKFILL_COMPLETION_GRACE: Duration = Duration::from_secs(20);
const DEFAULT_STREAM_LOOKBACK: Duration = Duration::from_secs(10 * 60);
const DEFAULT_STREAM_PACING: Duration = Duration::from_millis(1200);
const DEFAULT_STREAM_TARGET_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_SINK_MAX_QUEUE_SIZE: usize = 50_000;
const DEFAULT_SINK_MAX_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_STATE_PERSIST_INTERVAL: Duration = Duration::from_secs(5);

const DEFAULT_FETCH_MAX_RETRY_ATTEMPTS: u16 = 5;
const DEFAULT_FETCH_INITIAL_RETRY_INTERVAL_IN_MS: u32 = 500;
const DEFAULT_FETCH_MAX_RETRY_INTERVAL_IN_MS: u32 = 30_000;
const DEFAULT_SINK_MAX_RETRY_ATTEMPTS: u16 = 10;
const DEFAULT_SINK_INITIAL_RETRY_INTERVAL_IN_MS: u32 = 100;
const DEFAULT_SINK_MAX_RETRY_INTERVAL_IN_MS: u32 = 60_000;
const DEFAULT_RETRY_FACTOR: f64 = 2.0;
const DEFAULT_RETRY_JITTER: f64 = 0.1;

const ENV_BACKFILL_ENABLED: &str = "FILLSYNC_BACKFILL_ENABLED";
const ENV_BACKFILL_HORIZON_SECS: &str = "FILLSYNC_BACKFILL_HORIZON_SECS";
const ENV_BACKFILL_HORIZON_AT: &str = "FILLSYNC_BACKFILL_HORIZON_AT";
const ENV_BACKFILL_STEP_SECS: &str = "FILLSYNC_BACKFILL_STEP_SECS";
const ENV_BACKFILL_PARALLELISM: &str = "FILLSYNC_BACKFILL_PARALLELISM";
const ENV_BACKFILL_PACING_MS: &str = "FILLSYNC_BACKFILL_PACING_MS";
const ENV_BACKFILL_INTERVAL_SECS: &str = "FILLSYNC_BACKFILL_INTERVAL_SECS";
const ENV_BACKFILL_GRACE_SECS: &str = "FILLSYNC_BACKFILL_GRACE_SECS";
const ENV_BACKFILL_STOP_ON_COMPLETE: &str = "FILLSYNC_BACKFILL_STOP_ON_COMPLETE";
const ENV_FRONTFILL_ENABLED: &str = "FILLSYNC_FRONTFILL_ENABLED";
const ENV_FRONTFILL_MAX_SPAN_SECS: &str = "FILLSYNC_FRONTFILL_MAX_SPAN_SECS";
const ENV_FRONTFILL_PARALLELISM: &str = "FILLSYNC_FRONTFILL_PARALLELISM";
const ENV_STREAM_ENABLED: &str = "FILLSYNC_STREAM_ENABLED";
const ENV_STREAM_LOOKBACK_SECS: &str = "FILLSYNC_STREAM_LOOKBACK_SECS";
const ENV_STREAM_ELEMENTS: &str = "FILLSYNC_STREAM_ELEMENTS";
const ENV_STREAM_INTERVAL_SECS: &str = "FILLSYNC_STREAM_INTERVAL_SECS";
const ENV_STREAM_PARALLELISM: &str = "FILLSYNC_STREAM_PARALLELISM";
const ENV_STREAM_PACING_MS: &str = "FILLSYNC_STREAM_PACING_MS";
const ENV_SINK_MAX_QUEUE_SIZE: &str = "FILLSYNC_SINK_MAX_QUEUE_SIZE";
const ENV_SINK_MAX_FLUSH_INTERVAL_MS: &str = "FILLSYNC_SINK_MAX_FLUSH_INTERVAL_MS";
const ENV_FETCH_MAX_RETRY_ATTEMPTS: &str = "FILLSYNC_FETCH_MAX_RETRY_ATTEMPTS";
const ENV_FETCH_RETRY_INTERVAL_MS: &str = "FILLSYNC_FETCH_RETRY_INTERVAL_MS";
const ENV_SINK_MAX_RETRY_ATTEMPTS: &str = "FILLSYNC_SINK_MAX_RETRY_ATTEMPTS";
const ENV_STATE_PERSIST_INTERVAL_SECS: &str = "FILLSYNC_STATE_PERSIST_INTERVAL_SECS";

/// The oldest point backfill has to reach.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Horizon {
    /// Absolute epoch milliseconds.
    At(Timestamp),
    /// Distance behind the time the backfill run started.
    Relative(Duration),
}

impl Horizon {
    pub fn resolve(&self, now: Timestamp) -> Timestamp {
        match self {
            Horizon::At(ts) => *ts,
            Horizon::Relative(d) => now.saturating_sub(duration_ms(*d)),
        }
    }
}

/// Duration in epoch-millisecond arithmetic.
pub(crate) fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_retry_attempts: u16,
    pub initial_retry_interval_in_ms: u32,
    pub max_retry_interval_in_ms: u32,
    pub retry_factor: f64,
    pub retry_jitter: f64,
}

impl RetryConfig {
    pub fn fetch_default() -> Self {
        Self {
            max_retry_attempts: DEFAULT_FETCH_MAX_RETRY_ATTEMPTS,
            initial_retry_interval_in_ms: DEFAULT_FETCH_INITIAL_RETRY_INTERVAL_IN_MS,
            max_retry_interval_in_ms: DEFAULT_FETCH_MAX_RETRY_INTERVAL_IN_MS,
            retry_factor: DEFAULT_RETRY_FACTOR,
            retry_jitter: DEFAULT_RETRY_JITTER,
        }
    }

    pub fn sink_default() -> Self {
        Self {
            max_retry_attempts: DEFAULT_SINK_MAX_RETRY_ATTEMPTS,
            initial_retry_interval_in_ms: DEFAULT_SINK_INITIAL_RETRY_INTERVAL_IN_MS,
            max_retry_interval_in_ms: DEFAULT_SINK_MAX_RETRY_INTERVAL_IN_MS,
            retry_factor: DEFAULT_RETRY_FACTOR,
            retry_jitter: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackfillConfig {
    pub enabled: bool,
    pub horizon: Horizon,
    /// Length of one backward step, bounded by what the source accepts per query.
    pub step: Duration,
    pub parallelism: usize,
    /// Delay between handing consecutive entities to the pool.
    pub pacing: Duration,
    pub target_interval: Duration,
    /// Wait before signalling completion so pending batches get flushed.
    pub completion_grace: Duration,
    /// Cancel the shared token once every entity has reached the horizon.
    pub stop_on_complete: bool,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            horizon: Horizon::Relative(DEFAULT_BACKFILL_HORIZON),
            step: DEFAULT_MAX_QUERY_SPAN,
            parallelism: DEFAULT_PARALLELISM,
            pacing: DEFAULT_BACKFILL_PACING,
            target_interval: DEFAULT_BACKFILL_TARGET_INTERVAL,
            completion_grace: DEFAULT_BACKFILL_COMPLETION_GRACE,
            stop_on_complete: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrontfillConfig {
    pub enabled: bool,
    pub max_span: Duration,
    pub parallelism: usize,
    pub pacing: Duration,
}

impl Default for FrontfillConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_span: DEFAULT_MAX_QUERY_SPAN,
            parallelism: DEFAULT_PARALLELISM,
            pacing: Duration::ZERO,
        }
    }
}

/// What the streamer asks the source for on every iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMode {
    /// Query `[now - lookback, now)` to pick up late arriving points.
    TrailingWindow { lookback: Duration },
    /// Ask for the latest value of the given elements.
    Latest { elements: Vec<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    pub enabled: bool,
    pub mode: StreamMode,
    pub target_interval: Duration,
    pub parallelism: usize,
    pub pacing: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: StreamMode::TrailingWindow {
                lookback: DEFAULT_STREAM_LOOKBACK,
            },
            target_interval: DEFAULT_STREAM_TARGET_INTERVAL,
            parallelism: DEFAULT_PARALLELISM,
            pacing: DEFAULT_STREAM_PACING,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SinkConfig {
    /// Flush once this many points are buffered. Also the backpressure bound.
    pub max_queue_size: usize,
    /// Flush a non-empty buffer at least this often.
    pub max_flush_interval: Duration,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            max_queue_size: DEFAULT_SINK_MAX_QUEUE_SIZE,
            max_flush_interval: DEFAULT_SINK_MAX_FLUSH_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateConfig {
    pub persist_interval: Duration,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            persist_interval: DEFAULT_STATE_PERSIST_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub backfill: BackfillConfig,
    pub frontfill: FrontfillConfig,
    pub stream: StreamConfig,
    pub sink: SinkConfig,
    pub state: StateConfig,
    pub fetch_retry: RetryConfig,
    pub sink_retry: RetryConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backfill: BackfillConfig::default(),
            frontfill: FrontfillConfig::default(),
            stream: StreamConfig::default(),
            sink: SinkConfig::default(),
            state: StateConfig::default(),
            fetch_retry: RetryConfig::fetch_default(),
            sink_retry: RetryConfig::sink_default(),
        }
    }
}

impl Settings {
    /// Builds the settings from `FILLSYNC_*` variables, everything else is ignored.
    pub fn load(
        env_vars: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Result<Self> {
        let env_vars: HashMap<String, String> = env_vars
            .into_iter()
            .map(|(key, val)| (key.into(), val.into()))
            .filter(|(key, _val)| key.starts_with("FILLSYNC_"))
            .collect();

        let env = Env(&env_vars);
        let mut settings = Settings::default();

        let backfill = &mut settings.backfill;
        env.set(ENV_BACKFILL_ENABLED, &mut backfill.enabled)?;
        if let Some(secs) = env.parse::<u64>(ENV_BACKFILL_HORIZON_SECS)? {
            backfill.horizon = Horizon::Relative(Duration::from_secs(secs));
        }
        if let Some(at) = env.get(ENV_BACKFILL_HORIZON_AT) {
            let at = chrono::DateTime::parse_from_rfc3339(at).map_err(|e| {
                Error::Config(format!("{ENV_BACKFILL_HORIZON_AT} is not RFC 3339: {e}"))
            })?;
            backfill.horizon = Horizon::At(at.timestamp_millis());
        }
        env.set_secs(ENV_BACKFILL_STEP_SECS, &mut backfill.step)?;
        env.set(ENV_BACKFILL_PARALLELISM, &mut backfill.parallelism)?;
        env.set_millis(ENV_BACKFILL_PACING_MS, &mut backfill.pacing)?;
        env.set_secs(ENV_BACKFILL_INTERVAL_SECS, &mut backfill.target_interval)?;
        env.set_secs(ENV_BACKFILL_GRACE_SECS, &mut backfill.completion_grace)?;
        env.set(ENV_BACKFILL_STOP_ON_COMPLETE, &mut backfill.stop_on_complete)?;

        let frontfill = &mut settings.frontfill;
        env.set(ENV_FRONTFILL_ENABLED, &mut frontfill.enabled)?;
        env.set_secs(ENV_FRONTFILL_MAX_SPAN_SECS, &mut frontfill.max_span)?;
        env.set(ENV_FRONTFILL_PARALLELISM, &mut frontfill.parallelism)?;

        let stream = &mut settings.stream;
        env.set(ENV_STREAM_ENABLED, &mut stream.enabled)?;
        if let Some(secs) = env.parse::<u64>(ENV_STREAM_LOOKBACK_SECS)? {
            stream.mode = StreamMode::TrailingWindow {
                lookback: Duration::from_secs(secs),
            };
        }
        if let Some(elements) = env.get(ENV_STREAM_ELEMENTS) {
            stream.mode = StreamMode::Latest {
                elements: elements
                    .split(',')
                    .map(str::trim)
                    .filter(|e| !e.is_empty())
                    .map(String::from)
                    .collect(),
            };
        }
        env.set_secs(ENV_STREAM_INTERVAL_SECS, &mut stream.target_interval)?;
        env.set(ENV_STREAM_PARALLELISM, &mut stream.parallelism)?;
        env.set_millis(ENV_STREAM_PACING_MS, &mut stream.pacing)?;

        env.set(ENV_SINK_MAX_QUEUE_SIZE, &mut settings.sink.max_queue_size)?;
        env.set_millis(
            ENV_SINK_MAX_FLUSH_INTERVAL_MS,
            &mut settings.sink.max_flush_interval,
        )?;

        env.set(
            ENV_FETCH_MAX_RETRY_ATTEMPTS,
            &mut settings.fetch_retry.max_retry_attempts,
        )?;
        env.set(
            ENV_FETCH_RETRY_INTERVAL_MS,
            &mut settings.fetch_retry.initial_retry_interval_in_ms,
        )?;
        env.set(
            ENV_SINK_MAX_RETRY_ATTEMPTS,
            &mut settings.sink_retry.max_retry_attempts,
        )?;
        env.set_secs(
            ENV_STATE_PERSIST_INTERVAL_SECS,
            &mut settings.state.persist_interval,
        )?;

        settings.validate()?;
        Ok(settings)
    }

    /// Rejects values the phases cannot work with.
    pub fn validate(&self) -> Result<()> {
        let non_zero_durations = [
            ("backfill step", self.backfill.step),
            ("frontfill max span", self.frontfill.max_span),
            ("sink max flush interval", self.sink.max_flush_interval),
            ("state persist interval", self.state.persist_interval),
        ];
        for (name, value) in non_zero_durations {
            if value.is_zero() {
                return Err(Error::Config(format!("{name} must be greater than zero")));
            }
        }

        let non_zero_sizes = [
            ("backfill parallelism", self.backfill.parallelism),
            ("frontfill parallelism", self.frontfill.parallelism),
            ("stream parallelism", self.stream.parallelism),
            ("sink max queue size", self.sink.max_queue_size),
        ];
        for (name, value) in non_zero_sizes {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be greater than zero")));
            }
        }

        match &self.stream.mode {
            StreamMode::TrailingWindow { lookback } if lookback.is_zero() => Err(Error::Config(
                "stream lookback must be greater than zero".to_string(),
            )),
            StreamMode::Latest { elements } if elements.is_empty() => Err(Error::Config(
                "stream elements must not be empty".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

struct Env<'a>(&'a HashMap<String, String>);

impl Env<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    fn parse<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .map(|raw| {
                raw.trim()
                    .parse::<T>()
                    .map_err(|e| Error::Config(format!("Invalid value {raw:?} for {key}: {e}")))
            })
            .transpose()
    }

    fn set<T>(&self, key: &str, target: &mut T) -> Result<()>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        if let Some(value) = self.parse(key)? {
            *target = value;
        }
        Ok(())
    }

    fn set_secs(&self, key: &str, target: &mut Duration) -> Result<()> {
        if let Some(secs) = self.parse::<u64>(key)? {
            *target = Duration::from_secs(secs);
        }
        Ok(())
    }

    fn set_millis(&self, key: &str, target: &mut Duration) -> Result<()> {
        if let Some(ms) = self.parse::<u64>(key)? {
            *target = Duration::from_millis(ms);
        }
        Ok(())
    }
}
