use std::{fs::File, io::BufReader, path::Path, time::Duration};

use anyhow::Context as _;
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::{ProfilerError, Result};
use crate::flag::ExclusionScope;

/// Upper bound on every configured duration.
pub const MAX_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Timing and budget knobs of one sampler scheduler. Durations are whole
/// seconds in serialized form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub log_prefix: String,
    /// Never open capture windows, only build and report.
    pub report_only: bool,
    /// Capture time allowed per report window.
    #[serde(with = "secs")]
    pub max_profile_duration: Duration,
    /// Hard bound of one capture window.
    #[serde(with = "secs")]
    pub max_span_duration: Duration,
    pub max_span_count: u32,
    #[serde(with = "secs")]
    pub sampling_interval: Duration,
    #[serde(with = "secs")]
    pub report_interval: Duration,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        SamplerConfig {
            log_prefix: "sampler:".to_string(),
            report_only: false,
            max_profile_duration: Duration::from_secs(20),
            max_span_duration: Duration::from_secs(2),
            max_span_count: 30,
            sampling_interval: Duration::from_secs(8),
            report_interval: Duration::from_secs(120),
        }
    }
}

impl SamplerConfig {
    pub fn allocation() -> Self {
        SamplerConfig {
            log_prefix: "allocation sampler:".to_string(),
            report_only: true,
            ..Default::default()
        }
    }

    /// Width of the jitter range drawn before every window attempt.
    pub fn jitter_bound(&self) -> Duration {
        self.sampling_interval.saturating_sub(self.max_span_duration)
    }

    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("max profile duration", self.max_profile_duration),
            ("max span duration", self.max_span_duration),
            ("sampling interval", self.sampling_interval),
            ("report interval", self.report_interval),
        ];
        for (name, duration) in durations {
            if duration > MAX_INTERVAL {
                return Err(ProfilerError::Config(format!(
                    "{} {name} {duration:?} exceeds {MAX_INTERVAL:?}",
                    self.log_prefix
                )));
            }
        }
        if self.report_interval.is_zero() {
            return Err(ProfilerError::Config(format!(
                "{} report interval must be positive",
                self.log_prefix
            )));
        }
        if !self.report_only && self.sampling_interval <= self.max_span_duration {
            return Err(ProfilerError::Config(format!(
                "{} sampling interval {:?} must exceed max span duration {:?}",
                self.log_prefix, self.sampling_interval, self.max_span_duration
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Keep frames of the agent itself in call graphs.
    pub include_agent_frames: bool,
    pub exclusion: ExclusionScope,
    /// Profiles kept while waiting for a flush; 0 disables recording.
    pub max_buffered_profiles: usize,
    #[serde(with = "secs")]
    pub flush_interval: Duration,
    /// Fields left out fall back to [`SamplerConfig::allocation`].
    #[serde(deserialize_with = "allocation_overrides")]
    pub allocation: SamplerConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            include_agent_frames: false,
            exclusion: ExclusionScope::Process,
            max_buffered_profiles: 100,
            flush_interval: Duration::from_secs(5),
            allocation: SamplerConfig::allocation(),
        }
    }
}

impl AgentConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let reader = BufReader::new(file);
        let config: AgentConfig = serde_json::from_reader(reader)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        config.allocation.validate()?;
        Ok(config)
    }
}

fn allocation_overrides<'de, D>(deserializer: D) -> std::result::Result<SamplerConfig, D::Error>
where
    D: Deserializer<'de>,
{
    let overrides = Map::<String, Value>::deserialize(deserializer)?;
    let mut fields = match serde_json::to_value(SamplerConfig::allocation()) {
        Ok(Value::Object(fields)) => fields,
        Ok(_) => Map::new(),
        Err(err) => return Err(de::Error::custom(err)),
    };
    fields.extend(overrides);
    serde_json::from_value(Value::Object(fields)).map_err(de::Error::custom)
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
