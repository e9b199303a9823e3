//! Idle holder eviction
//!
//! Tracks when each tree holder was last used by a watcher session and, when
//! the host is under resource pressure, releases holders that have sat idle
//! past a configured offset. Tracking and cleaning are gated independently so
//! tracking can be rolled out first and observed before eviction is enabled.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use metrics::counter;
use parking_lot::Mutex;
use sysinfo::System;
use tracing::{debug, info};

use crate::config::{ConfigError, ConfigResult, RegistryConfig};
use crate::tree::hub::{HolderKey, TreeHub};

/// One point-in-time reading of host resource usage, in percent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

/// Source of resource samples. Production uses [`SystemUsage`]; tests inject
/// fixed samples.
pub trait ResourceUsage: Send + Sync {
    fn sample(&self) -> ResourceSample;
}

/// Host-wide usage via `sysinfo`.
///
/// CPU usage is computed between consecutive refreshes, so the first sample
/// after construction reads near zero. The cleaner's period is long enough
/// that this only affects the first cycle.
pub struct SystemUsage {
    system: Mutex<System>,
}

impl SystemUsage {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SystemUsage {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceUsage for SystemUsage {
    fn sample(&self) -> ResourceSample {
        let mut system = self.system.lock();
        system.refresh_cpu_usage();
        system.refresh_memory();
        let total = system.total_memory();
        let memory_percent = if total == 0 {
            0.0
        } else {
            system.used_memory() as f64 / total as f64 * 100.0
        };
        ResourceSample {
            cpu_percent: system.global_cpu_usage() as f64,
            memory_percent,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PressureParseError {
    #[error("empty condition")]
    Empty,

    #[error("unknown metric '{value}' (expected 'cpu' or 'memory')")]
    UnknownMetric { value: String },

    #[error("unknown comparison '{value}'")]
    UnknownComparison { value: String },

    #[error("invalid threshold '{value}'")]
    InvalidThreshold { value: String },

    #[error("unexpected token '{value}'")]
    UnexpectedToken { value: String },

    #[error("condition ends mid-clause")]
    Truncated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Cpu,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Greater,
    GreaterEq,
    Less,
    LessEq,
}

/// Parsed resource-pressure gate, e.g. `"cpu > 80 or memory > 75"`.
///
/// Grammar: `or-expr := and-expr ('or' and-expr)*`,
/// `and-expr := clause ('and' clause)*`, `clause := metric op number`.
/// `and` binds tighter than `or`.
#[derive(Debug, Clone, PartialEq)]
pub enum PressureCondition {
    Compare {
        metric: Metric,
        op: CompareOp,
        threshold: f64,
    },
    AllOf(Vec<PressureCondition>),
    AnyOf(Vec<PressureCondition>),
}

impl PressureCondition {
    pub fn parse(input: &str) -> Result<Self, PressureParseError> {
        let tokens: Vec<&str> = input.split_whitespace().collect();
        if tokens.is_empty() {
            return Err(PressureParseError::Empty);
        }
        let mut cursor = 0;
        let condition = Self::parse_or(&tokens, &mut cursor)?;
        if cursor < tokens.len() {
            return Err(PressureParseError::UnexpectedToken {
                value: tokens[cursor].to_string(),
            });
        }
        Ok(condition)
    }

    fn parse_or(tokens: &[&str], cursor: &mut usize) -> Result<Self, PressureParseError> {
        let first = Self::parse_and(tokens, cursor)?;
        if tokens.get(*cursor) != Some(&"or") {
            return Ok(first);
        }
        let mut branches = vec![first];
        while tokens.get(*cursor) == Some(&"or") {
            *cursor += 1;
            branches.push(Self::parse_and(tokens, cursor)?);
        }
        Ok(PressureCondition::AnyOf(branches))
    }

    fn parse_and(tokens: &[&str], cursor: &mut usize) -> Result<Self, PressureParseError> {
        let first = Self::parse_clause(tokens, cursor)?;
        if tokens.get(*cursor) != Some(&"and") {
            return Ok(first);
        }
        let mut branches = vec![first];
        while tokens.get(*cursor) == Some(&"and") {
            *cursor += 1;
            branches.push(Self::parse_clause(tokens, cursor)?);
        }
        Ok(PressureCondition::AllOf(branches))
    }

    fn parse_clause(tokens: &[&str], cursor: &mut usize) -> Result<Self, PressureParseError> {
        let mut next = || {
            let token = tokens.get(*cursor).copied();
            *cursor += 1;
            token.ok_or(PressureParseError::Truncated)
        };
        let metric = match next()? {
            "cpu" => Metric::Cpu,
            "memory" => Metric::Memory,
            other => {
                return Err(PressureParseError::UnknownMetric {
                    value: other.to_string(),
                })
            }
        };
        let op = match next()? {
            ">" => CompareOp::Greater,
            ">=" => CompareOp::GreaterEq,
            "<" => CompareOp::Less,
            "<=" => CompareOp::LessEq,
            other => {
                return Err(PressureParseError::UnknownComparison {
                    value: other.to_string(),
                })
            }
        };
        let raw = next()?;
        let threshold = raw
            .parse::<f64>()
            .map_err(|_| PressureParseError::InvalidThreshold {
                value: raw.to_string(),
            })?;
        Ok(PressureCondition::Compare {
            metric,
            op,
            threshold,
        })
    }

    pub fn evaluate(&self, sample: ResourceSample) -> bool {
        match self {
            PressureCondition::Compare {
                metric,
                op,
                threshold,
            } => {
                let value = match metric {
                    Metric::Cpu => sample.cpu_percent,
                    Metric::Memory => sample.memory_percent,
                };
                match op {
                    CompareOp::Greater => value > *threshold,
                    CompareOp::GreaterEq => value >= *threshold,
                    CompareOp::Less => value < *threshold,
                    CompareOp::LessEq => value <= *threshold,
                }
            }
            PressureCondition::AllOf(branches) => {
                branches.iter().all(|branch| branch.evaluate(sample))
            }
            PressureCondition::AnyOf(branches) => {
                branches.iter().any(|branch| branch.evaluate(sample))
            }
        }
    }
}

impl FromStr for PressureCondition {
    type Err = PressureParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

pub struct TreeHolderCleaner {
    hub: TreeHub,
    config: Arc<RegistryConfig>,
    condition: PressureCondition,
    usage: Arc<dyn ResourceUsage>,
    last_used: DashMap<HolderKey, Instant>,
}

impl TreeHolderCleaner {
    pub fn new(hub: TreeHub, config: Arc<RegistryConfig>) -> ConfigResult<Self> {
        Self::with_usage(hub, config, Arc::new(SystemUsage::new()))
    }

    pub fn with_usage(
        hub: TreeHub,
        config: Arc<RegistryConfig>,
        usage: Arc<dyn ResourceUsage>,
    ) -> ConfigResult<Self> {
        let condition = PressureCondition::parse(&config.cleaner.pressure_condition).map_err(
            |error| ConfigError::InvalidValue {
                field: "cleaner.pressure_condition".to_string(),
                value: config.cleaner.pressure_condition.clone(),
                reason: error.to_string(),
            },
        )?;
        Ok(Self {
            hub,
            config,
            condition,
            usage,
            last_used: DashMap::new(),
        })
    }

    /// Record that a holder was just used by a session. No-op unless
    /// tracking is enabled.
    pub fn track(&self, application: &str, type_name: crate::store::NodeType) {
        if !self.config.cleaner.track_enabled {
            return;
        }
        self.last_used
            .insert((application.to_string(), type_name), Instant::now());
    }

    /// One eviction cycle. Returns how many holders were released.
    ///
    /// Holders stay resident unless cleaning is enabled, the pressure gate
    /// holds, and the holder sat idle past the offset. Evicted holders keep
    /// their tracking entry so an immediate re-create is not re-evicted
    /// before its next use.
    pub fn clean(&self) -> usize {
        if !self.config.cleaner.clean_enabled {
            return 0;
        }
        let sample = self.usage.sample();
        if !self.condition.evaluate(sample) {
            debug!(
                cpu = sample.cpu_percent,
                memory = sample.memory_percent,
                "no resource pressure, skipping eviction"
            );
            return 0;
        }

        let idle_offset = self.config.cleaner.idle_offset();
        let now = Instant::now();
        let mut evicted = 0;
        for entry in self.last_used.iter() {
            let (application, type_name) = entry.key();
            let idle = now.duration_since(*entry.value());
            if idle < idle_offset {
                continue;
            }
            if self.hub.contains(application, *type_name) {
                self.hub.release_tree_holder(application, *type_name);
                info!(
                    application = application.as_str(),
                    type_name = %type_name,
                    idle_secs = idle.as_secs(),
                    "evicted idle tree holder"
                );
                counter!("arbor_holders_evicted_total").increment(1);
                evicted += 1;
            }
        }
        // Entries idle far past the offset belong to holders long gone.
        self.last_used
            .retain(|_, used| now.duration_since(*used) < idle_offset * 3);
        evicted
    }

    /// Periodic eviction loop.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.cleaner.period());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.clean();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CleanerConfig;
    use crate::store::{MemoryStore, NodeType};
    use std::time::Duration;

    struct FixedUsage(ResourceSample);

    impl ResourceUsage for FixedUsage {
        fn sample(&self) -> ResourceSample {
            self.0
        }
    }

    fn sample(cpu: f64, memory: f64) -> ResourceSample {
        ResourceSample {
            cpu_percent: cpu,
            memory_percent: memory,
        }
    }

    fn cleaner(config: RegistryConfig, usage: ResourceSample) -> (TreeHub, Arc<TreeHolderCleaner>) {
        let config = Arc::new(config);
        let hub = TreeHub::new(config.clone(), Arc::new(MemoryStore::new()));
        let cleaner =
            TreeHolderCleaner::with_usage(hub.clone(), config, Arc::new(FixedUsage(usage)))
                .unwrap();
        (hub, Arc::new(cleaner))
    }

    fn pressured_config(idle_offset_secs: u64) -> RegistryConfig {
        RegistryConfig {
            cleaner: CleanerConfig {
                track_enabled: true,
                clean_enabled: true,
                idle_offset_secs,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_single_clause() {
        let condition = PressureCondition::parse("cpu > 80").unwrap();
        assert!(condition.evaluate(sample(81.0, 0.0)));
        assert!(!condition.evaluate(sample(80.0, 0.0)));
    }

    #[test]
    fn test_parse_or_of_ands() {
        let condition =
            PressureCondition::parse("cpu > 80 and memory > 50 or memory > 90").unwrap();
        assert!(condition.evaluate(sample(85.0, 60.0)));
        assert!(condition.evaluate(sample(0.0, 95.0)));
        assert!(!condition.evaluate(sample(85.0, 40.0)));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(PressureCondition::parse("").is_err());
        assert!(PressureCondition::parse("disk > 90").is_err());
        assert!(PressureCondition::parse("cpu >").is_err());
        assert!(PressureCondition::parse("cpu > eighty").is_err());
        assert!(PressureCondition::parse("cpu > 80 banana").is_err());
    }

    #[tokio::test]
    async fn test_clean_evicts_idle_holder_under_pressure() {
        let (hub, cleaner) = cleaner(pressured_config(0), sample(95.0, 10.0));
        hub.get_tree_holder("foo", NodeType::Service)
            .block_until_initialized(Duration::from_secs(1))
            .await
            .unwrap();
        cleaner.track("foo", NodeType::Service);

        assert_eq!(cleaner.clean(), 1);
        assert!(!hub.contains("foo", NodeType::Service));
    }

    #[tokio::test]
    async fn test_clean_skips_without_pressure() {
        let (hub, cleaner) = cleaner(pressured_config(0), sample(5.0, 10.0));
        hub.get_tree_holder("foo", NodeType::Service);
        cleaner.track("foo", NodeType::Service);

        assert_eq!(cleaner.clean(), 0);
        assert!(hub.contains("foo", NodeType::Service));
    }

    #[tokio::test]
    async fn test_clean_spares_recently_used_holder() {
        let (hub, cleaner) = cleaner(pressured_config(3600), sample(95.0, 10.0));
        hub.get_tree_holder("foo", NodeType::Service);
        cleaner.track("foo", NodeType::Service);

        assert_eq!(cleaner.clean(), 0);
        assert!(hub.contains("foo", NodeType::Service));
    }

    #[tokio::test]
    async fn test_clean_disabled_is_noop() {
        let config = RegistryConfig {
            cleaner: CleanerConfig {
                track_enabled: true,
                clean_enabled: false,
                idle_offset_secs: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let (hub, cleaner) = cleaner(config, sample(95.0, 95.0));
        hub.get_tree_holder("foo", NodeType::Service);
        cleaner.track("foo", NodeType::Service);
        assert_eq!(cleaner.clean(), 0);
    }
}
