//! Policy file loading.
//!
//! Policies can be supplied as YAML instead of the built-in table. The file
//! is read once at startup.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use super::policy::{EndpointPolicy, IdentifierStrategy, PolicyTable};
use super::redis::window_secs;
use crate::error::{GatekeeperError, Result};

/// On-disk form of a [`PolicyTable`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyFile {
    /// Policy for methods without an explicit entry
    pub default: PolicyRule,
    /// Explicit policies keyed by full method name
    #[serde(default)]
    pub endpoints: BTreeMap<String, PolicyRule>,
}

/// A single policy entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Requests allowed per window
    pub limit: u64,
    /// Window length in seconds
    pub window_secs: u64,
    /// Identifier strategy
    #[serde(default)]
    pub strategy: IdentifierStrategy,
    /// Whether the policy is enforced
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl From<PolicyRule> for EndpointPolicy {
    fn from(rule: PolicyRule) -> Self {
        EndpointPolicy::new(rule.limit, Duration::from_secs(rule.window_secs), rule.strategy)
            .with_enabled(rule.enabled)
    }
}

impl From<EndpointPolicy> for PolicyRule {
    fn from(policy: EndpointPolicy) -> Self {
        PolicyRule {
            limit: policy.limit,
            // Same whole-second window the Redis store applies
            window_secs: window_secs(policy.window),
            strategy: policy.strategy,
            enabled: policy.enabled,
        }
    }
}

impl PolicyFile {
    /// Load a policy file from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse a policy file from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| GatekeeperError::Config(format!("Failed to parse policy file: {}", e)))
    }

    /// Snapshot a live table.
    pub fn from_table(table: &PolicyTable) -> Self {
        PolicyFile {
            default: table.default_policy().into(),
            endpoints: table
                .endpoints()
                .into_iter()
                .map(|(method, policy)| (method, policy.into()))
                .collect(),
        }
    }

    /// Validate every entry and build the table.
    pub fn into_table(self) -> Result<PolicyTable> {
        let default = EndpointPolicy::from(self.default);
        default.validate("default")?;

        let table = PolicyTable::new(default);
        for (method, rule) in self.endpoints {
            let policy = EndpointPolicy::from(rule);
            policy.validate(&method)?;
            table.insert(method, policy);
        }
        Ok(table)
    }
}

impl PolicyTable {
    /// Load and validate a table from a YAML policy file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        PolicyFile::from_file(path)?.into_table()
    }

    /// Load and validate a table from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        PolicyFile::from_yaml(yaml)?.into_table()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PolicyError;

    #[test]
    fn test_parse_policy_file() {
        let yaml = r#"
default:
  limit: 100
  window_secs: 60
endpoints:
  /svc/Method:
    limit: 5
    window_secs: 10
    strategy: by_user_id
  /svc/Combined:
    limit: 3
    window_secs: 1
    strategy: by_ip_and_user_id
    enabled: false
"#;
        let table = PolicyTable::from_yaml(yaml).unwrap();
        assert_eq!(table.len(), 2);

        let default = table.default_policy();
        assert_eq!(default.limit, 100);
        assert_eq!(default.strategy, IdentifierStrategy::ByIp);
        assert!(default.enabled);

        let method = table.policy("/svc/Method");
        assert_eq!(method.limit, 5);
        assert_eq!(method.window, Duration::from_secs(10));
        assert_eq!(method.strategy, IdentifierStrategy::ByUserId);

        assert!(!table.is_enabled("/svc/Combined"));
    }

    #[test]
    fn test_default_only() {
        let yaml = r#"
default:
  limit: 10
  window_secs: 1
  strategy: by_user_id
"#;
        let table = PolicyTable::from_yaml(yaml).unwrap();
        assert!(table.is_empty());
        assert_eq!(table.policy("/any/Method").strategy, IdentifierStrategy::ByUserId);
    }

    #[test]
    fn test_invalid_policy_rejected() {
        let yaml = r#"
default:
  limit: 10
  window_secs: 1
endpoints:
  /svc/Broken:
    limit: 0
    window_secs: 10
"#;
        let err = PolicyTable::from_yaml(yaml).unwrap_err();
        assert!(matches!(
            err,
            GatekeeperError::Policy(PolicyError::ZeroLimit { ref method }) if method == "/svc/Broken"
        ));
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let yaml = r#"
default:
  limit: 10
  window_secs: 1
  strategy: by_cookie
"#;
        assert!(matches!(
            PolicyTable::from_yaml(yaml),
            Err(GatekeeperError::Config(_))
        ));
    }

    #[test]
    fn test_snapshot_of_default_table() {
        let table = PolicyTable::default();
        let file = PolicyFile::from_table(&table);
        assert_eq!(file.endpoints.len(), table.len());
        assert_eq!(file.default.limit, table.default_policy().limit);

        let rebuilt = file.into_table().unwrap();
        for (method, policy) in table.endpoints() {
            assert_eq!(rebuilt.policy(&method), policy);
        }
    }

    #[test]
    fn test_sub_second_window_snapshot_stays_valid() {
        let table = PolicyTable::new(EndpointPolicy::new(
            10,
            Duration::from_millis(500),
            IdentifierStrategy::ByIp,
        ));
        let file = PolicyFile::from_table(&table);
        assert_eq!(file.default.window_secs, 1);

        let rebuilt = file.into_table().unwrap();
        assert_eq!(rebuilt.default_policy().window, Duration::from_secs(1));
    }

    #[test]
    fn test_overlong_window_rejected() {
        let yaml = r#"
default:
  limit: 10
  window_secs: 60
endpoints:
  /svc/Method:
    limit: 1
    window_secs: 18446744073709551615
"#;
        assert!(matches!(
            PolicyTable::from_yaml(yaml),
            Err(GatekeeperError::Policy(PolicyError::WindowTooLong { .. }))
        ));
    }
}
