use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use error_stack::ResultExt as _;
use serde::{Deserialize, Serialize};

use flowrun_queue::{ConcurrencyKey, QueueConfig};
use flowrun_sandbox::Limits;
use flowrun_worker::{WorkerConfig, WorkerId};

use crate::{MainError, Result};

pub const CONFIG_FILE_NAME: &str = "flowrun-config.yml";

/// Engine tuning loaded from `flowrun-config.yml`.
///
/// Every section defaults, so a missing config file means a default
/// engine.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowrunConfig {
    pub queue: QueueSection,
    pub worker: WorkerSection,
    pub limits: LimitsSection,
    /// Named connection values injected into steps that reference them.
    pub connections: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    pub max_deliveries: u32,
    pub lease_ttl_ms: u64,
    pub default_ceiling: usize,
    /// Per-key overrides, e.g. `"flow/<uuid>": 1`.
    pub ceilings: HashMap<String, usize>,
    pub sweep_interval_ms: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        let defaults = QueueConfig::default();
        Self {
            max_deliveries: defaults.max_deliveries,
            lease_ttl_ms: defaults.lease_ttl.as_millis() as u64,
            default_ceiling: defaults.default_ceiling,
            ceilings: HashMap::new(),
            sweep_interval_ms: defaults.sweep_interval.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    /// Stable worker id; a random one is minted when unset.
    pub id: Option<String>,
    pub max_parallel_runs: usize,
    pub poll_interval_ms: u64,
}

impl Default for WorkerSection {
    fn default() -> Self {
        let defaults = WorkerConfig::default();
        Self {
            id: None,
            max_parallel_runs: defaults.max_parallel_runs,
            poll_interval_ms: defaults.poll_interval.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsSection {
    pub step_timeout_ms: u64,
    pub max_output_bytes: usize,
    pub max_log_lines: usize,
    /// Wall-clock budget for a whole run, unbounded when unset.
    pub run_timeout_ms: Option<u64>,
}

impl Default for LimitsSection {
    fn default() -> Self {
        let defaults = Limits::default();
        Self {
            step_timeout_ms: defaults.timeout.as_millis() as u64,
            max_output_bytes: defaults.max_output_bytes,
            max_log_lines: defaults.max_log_lines,
            run_timeout_ms: None,
        }
    }
}

impl FlowrunConfig {
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_deliveries: self.queue.max_deliveries,
            lease_ttl: Duration::from_millis(self.queue.lease_ttl_ms),
            default_ceiling: self.queue.default_ceiling,
            ceilings: self
                .queue
                .ceilings
                .iter()
                .map(|(key, ceiling)| (ConcurrencyKey::new(key.clone()), *ceiling))
                .collect(),
            sweep_interval: Duration::from_millis(self.queue.sweep_interval_ms),
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            id: self
                .worker
                .id
                .as_ref()
                .map(WorkerId::new)
                .unwrap_or_else(WorkerId::random),
            max_parallel_runs: self.worker.max_parallel_runs,
            poll_interval: Duration::from_millis(self.worker.poll_interval_ms),
        }
    }

    pub fn limits(&self) -> Limits {
        Limits {
            timeout: Duration::from_millis(self.limits.step_timeout_ms),
            max_output_bytes: self.limits.max_output_bytes,
            max_log_lines: self.limits.max_log_lines,
        }
    }

    pub fn run_deadline(&self) -> Option<Duration> {
        self.limits.run_timeout_ms.map(Duration::from_millis)
    }
}

/// Load the config from `config_path`, or discover `flowrun-config.yml`
/// next to the flow file and then in the current directory. A config file
/// that does not exist anywhere yields the defaults; an explicit path
/// that does not exist is an error.
pub fn load_config(
    flow_path: Option<&Path>,
    config_path: Option<PathBuf>,
) -> Result<FlowrunConfig> {
    if let Some(path) = config_path {
        return read_config(&path);
    }

    let mut candidates = Vec::new();
    if let Some(flow_path) = flow_path {
        let flow_path = flow_path
            .canonicalize()
            .change_context_lazy(|| MainError::MissingFile(flow_path.to_owned()))?;
        if let Some(flow_dir) = flow_path.parent() {
            candidates.push(flow_dir.join(CONFIG_FILE_NAME));
        }
    }
    candidates.push(PathBuf::from(CONFIG_FILE_NAME));

    for candidate in candidates {
        if candidate.is_file() {
            return read_config(&candidate);
        }
    }
    tracing::debug!("no config file found, using defaults");
    Ok(FlowrunConfig::default())
}

fn read_config(path: &Path) -> Result<FlowrunConfig> {
    tracing::info!("loading config from {}", path.display());
    let rdr = std::fs::File::open(path)
        .change_context_lazy(|| MainError::MissingFile(path.to_owned()))?;
    serde_yml::from_reader(rdr).change_context_lazy(|| MainError::InvalidFile(path.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_fills_defaults() {
        let yaml = r#"
queue:
  default_ceiling: 2
  ceilings:
    "flow/priority": 1
worker:
  max_parallel_runs: 8
"#;
        let config: FlowrunConfig = serde_yml::from_str(yaml).unwrap();
        assert_eq!(config.queue.default_ceiling, 2);
        assert_eq!(config.queue.max_deliveries, 5);
        assert_eq!(config.worker.max_parallel_runs, 8);
        assert_eq!(config.limits.max_log_lines, 1_000);

        let queue = config.queue_config();
        assert_eq!(queue.ceiling(&ConcurrencyKey::new("flow/priority")), 1);
        assert_eq!(queue.ceiling(&ConcurrencyKey::new("flow/other")), 2);
    }

    #[test]
    fn test_empty_config_is_default() {
        let config: FlowrunConfig = serde_yml::from_str("{}").unwrap();
        assert_eq!(config.queue.max_deliveries, 5);
        assert!(config.run_deadline().is_none());
        assert_eq!(config.limits().timeout, Duration::from_secs(30));
    }
}
