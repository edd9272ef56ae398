//! Engine configuration

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::sandbox::ExecutionLimits;
use crate::types::EngineError;

/// Path of the worker executable
pub const ENV_WORKER: &str = "TRANSFORM_ENGINE_WORKER";
/// Default deadline in milliseconds
pub const ENV_DEADLINE_MS: &str = "TRANSFORM_ENGINE_DEADLINE_MS";
/// Default operation budget
pub const ENV_MAX_OPERATIONS: &str = "TRANSFORM_ENGINE_MAX_OPERATIONS";

/// Argument that puts the binary into worker mode
pub const WORKER_SUBCOMMAND: &str = "worker";

/// Where untrusted and resource-sensitive work runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingPolicy {
    /// Scripts and resource-sensitive tools go to a worker process
    #[default]
    Isolate,
    /// Everything runs in-process; for hosts that cannot spawn workers
    InProcess,
}

/// How to start an isolated context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker executable; the current executable when unset
    pub program: Option<PathBuf>,
    /// Arguments that select worker mode
    pub args: Vec<String>,
    /// Forward worker stderr (its logs) to ours
    pub inherit_stderr: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: vec![WORKER_SUBCOMMAND.to_string()],
            inherit_stderr: false,
        }
    }
}

impl WorkerConfig {
    /// Worker started from `program` with the default arguments
    pub fn program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: Some(program.into()),
            ..Default::default()
        }
    }

    /// Builder: set arguments
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Builder: forward worker stderr
    pub fn with_inherit_stderr(mut self, inherit: bool) -> Self {
        self.inherit_stderr = inherit;
        self
    }
}

/// Everything the dispatcher needs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub limits: ExecutionLimits,
    pub worker: WorkerConfig,
    pub policy: RoutingPolicy,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `TRANSFORM_ENGINE_*` environment variables
    pub fn from_env() -> Result<Self, EngineError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, EngineError> {
        let mut config = Self::default();
        if let Some(program) = lookup(ENV_WORKER).filter(|p| !p.is_empty()) {
            config.worker.program = Some(PathBuf::from(program));
        }
        if let Some(raw) = lookup(ENV_DEADLINE_MS) {
            config.limits.deadline_ms = parse_number(ENV_DEADLINE_MS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_MAX_OPERATIONS) {
            config.limits.max_operations = parse_number(ENV_MAX_OPERATIONS, &raw)?;
        }
        Ok(config)
    }

    /// Builder: set limits
    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Builder: set worker
    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    /// Builder: set routing policy
    pub fn with_policy(mut self, policy: RoutingPolicy) -> Self {
        self.policy = policy;
        self
    }
}

fn parse_number(name: &str, raw: &str) -> Result<u64, EngineError> {
    raw.trim()
        .parse()
        .map_err(|_| EngineError::InvalidConfig(format!("{} must be a number, got '{}'", name, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.policy, RoutingPolicy::Isolate);
        assert_eq!(config.worker.args, vec!["worker".to_string()]);
        assert!(config.worker.program.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let config = EngineConfig::from_lookup(lookup_from(&[
            (ENV_WORKER, "/opt/bin/transform-engine"),
            (ENV_DEADLINE_MS, "750"),
            (ENV_MAX_OPERATIONS, "1000"),
        ]))
        .unwrap();
        assert_eq!(
            config.worker.program,
            Some(PathBuf::from("/opt/bin/transform-engine"))
        );
        assert_eq!(config.limits.deadline_ms, 750);
        assert_eq!(config.limits.max_operations, 1000);
    }

    #[test]
    fn test_env_rejects_garbage() {
        let result = EngineConfig::from_lookup(lookup_from(&[(ENV_DEADLINE_MS, "soon")]));
        assert!(matches!(result, Err(EngineError::InvalidConfig(_))));
    }

    #[test]
    fn test_deserialize_partial() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "policy": "in-process", "limits": { "deadline_ms": 10 } }"#)
                .unwrap();
        assert_eq!(config.policy, RoutingPolicy::InProcess);
        assert_eq!(config.limits.deadline_ms, 10);
        assert_eq!(config.worker, WorkerConfig::default());
    }
}
