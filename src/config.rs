//! Policy configuration loading and the policy registry.
//!
//! Policies can be declared in YAML and loaded at startup, or taken from
//! the built-in set. Validation is fail-fast: malformed thresholds are a
//! configuration error at load time, never a runtime decision.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{RampartError, Result};
use crate::limiter::{
    BlockPolicy, BudgetConfig, FailureMode, Scope, ScoreDeltas, SignalClass, Thresholds,
};

/// A complete policy configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyFile {
    #[serde(default)]
    pub policies: Vec<PolicyEntry>,
}

/// One policy as declared in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyEntry {
    pub name: String,
    pub failure_mode: FailureMode,
    /// Threshold sets keyed by signal class (`k1`..`k5`) plus the required
    /// `default` entry. Unknown class keys are kept verbatim and simply
    /// never match a signal.
    #[serde(default)]
    pub thresholds: HashMap<String, Thresholds>,
    pub deltas: ScoreDeltas,
    #[serde(default)]
    pub budget: Option<BudgetConfig>,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<Scope>,
}

fn default_scopes() -> Vec<Scope> {
    vec![Scope::Account, Scope::Device, Scope::Ip]
}

impl PolicyEntry {
    /// Validate and convert into an immutable policy.
    fn build(mut self) -> Result<BlockPolicy> {
        let default_thresholds = self.thresholds.remove("default").ok_or_else(|| {
            RampartError::Config(format!("policy {}: missing default thresholds", self.name))
        })?;

        validate_thresholds(&self.name, "default", default_thresholds)?;
        let mut thresholds = HashMap::new();
        for (class, set) in self.thresholds {
            validate_thresholds(&self.name, &class, set)?;
            thresholds.insert(SignalClass::parse(&class), set);
        }

        if let Some(budget) = &self.budget {
            if !(1..=6).contains(&budget.block_level) {
                return Err(RampartError::Config(format!(
                    "policy {}: budget block level {} outside 1-6",
                    self.name, budget.block_level
                )));
            }
        }

        if self.scopes.is_empty() {
            return Err(RampartError::Config(format!(
                "policy {}: at least one scope is required",
                self.name
            )));
        }

        Ok(BlockPolicy {
            name: self.name,
            thresholds,
            default_thresholds,
            deltas: self.deltas,
            failure_mode: self.failure_mode,
            budget: self.budget,
            scopes: self.scopes,
        })
    }
}

fn validate_thresholds(policy: &str, class: &str, set: Thresholds) -> Result<()> {
    if set.l1 == 0 || set.l1 >= set.l2 || set.l2 >= set.l3 {
        return Err(RampartError::Config(format!(
            "policy {}: {} thresholds must satisfy 0 < l1 < l2 < l3",
            policy, class
        )));
    }
    Ok(())
}

/// Named lookup of immutable policies. Built once at startup and injected
/// into the limiter.
pub struct PolicyRegistry {
    policies: HashMap<String, Arc<BlockPolicy>>,
}

impl PolicyRegistry {
    /// Create a registry from already-built policies.
    pub fn new(policies: Vec<BlockPolicy>) -> Self {
        Self {
            policies: policies
                .into_iter()
                .map(|p| (p.name.clone(), Arc::new(p)))
                .collect(),
        }
    }

    /// The built-in policy set.
    pub fn builtin() -> Self {
        Self::new(vec![
            login_protection(),
            otp_protection(),
            api_heavy_protection(),
        ])
    }

    /// Load a registry from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading policy configuration");
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a registry from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: PolicyFile = serde_yaml::from_str(yaml)
            .map_err(|e| RampartError::Config(format!("failed to parse policy config: {}", e)))?;

        let mut policies = HashMap::new();
        for entry in file.policies {
            let policy = entry.build()?;
            policies.insert(policy.name.clone(), Arc::new(policy));
        }
        Ok(Self { policies })
    }

    /// Look up a policy by name. Unknown names are a configuration error.
    pub fn get(&self, name: &str) -> Result<Arc<BlockPolicy>> {
        self.policies
            .get(name)
            .cloned()
            .ok_or_else(|| RampartError::UnknownPolicy(name.to_string()))
    }

    /// Registered policy names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.policies.keys().map(String::as_str)
    }
}

fn login_protection() -> BlockPolicy {
    BlockPolicy {
        name: "login_protection".to_string(),
        thresholds: HashMap::from([(
            SignalClass::K4,
            Thresholds { l1: 5, l2: 8, l3: 12 },
        )]),
        default_thresholds: Thresholds { l1: 6, l2: 10, l3: 14 },
        deltas: ScoreDeltas {
            access: 1,
            spray: 4,
            missing_fingerprint: 2,
            failure: 3,
            repeated_missing_fingerprint: 4,
        },
        failure_mode: FailureMode::FailClosed,
        budget: None,
        scopes: vec![Scope::Account, Scope::Device, Scope::Ip],
    }
}

fn otp_protection() -> BlockPolicy {
    BlockPolicy {
        name: "otp_protection".to_string(),
        thresholds: HashMap::from([(
            SignalClass::K4,
            Thresholds { l1: 4, l2: 6, l3: 9 },
        )]),
        default_thresholds: Thresholds { l1: 5, l2: 8, l3: 11 },
        deltas: ScoreDeltas {
            access: 1,
            spray: 5,
            missing_fingerprint: 2,
            failure: 4,
            repeated_missing_fingerprint: 5,
        },
        failure_mode: FailureMode::FailClosed,
        budget: Some(BudgetConfig {
            threshold: 100,
            block_level: 3,
        }),
        scopes: vec![Scope::Account, Scope::Ip],
    }
}

fn api_heavy_protection() -> BlockPolicy {
    BlockPolicy {
        name: "api_heavy_protection".to_string(),
        thresholds: HashMap::new(),
        default_thresholds: Thresholds { l1: 30, l2: 60, l3: 120 },
        deltas: ScoreDeltas {
            access: 1,
            spray: 2,
            missing_fingerprint: 1,
            failure: 2,
            repeated_missing_fingerprint: 2,
        },
        failure_mode: FailureMode::FailOpen,
        budget: Some(BudgetConfig {
            threshold: 5_000,
            block_level: 4,
        }),
        scopes: vec![Scope::Device, Scope::Ip],
    }
}
