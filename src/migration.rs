//! Migration functions between versions of the same function or type, and
//! multi-step path building along a `VersionChain`'s replacement links.

use std::collections::HashMap;
use std::sync::Arc;

use crate::value::Value;
use crate::version::Version;
use crate::version_registry::VersionChain;

#[derive(Debug, Clone, thiserror::Error)]
pub enum MigrationError {
    #[error("no migration registered for '{name}' from {from} to {to}")]
    MissingStep {
        name: String,
        from: Version,
        to: Version,
    },
    #[error("migration '{name}' failed: {reason}")]
    ExecutionFailed { name: String, reason: String },
}

/// A single migration step: takes the old-version value, produces the
/// new-version value, or a human-readable failure reason.
pub type MigrationFn = Arc<dyn Fn(&Value) -> Result<Value, String> + Send + Sync>;

#[derive(Clone, Default)]
pub struct MigrationRegistry {
    steps: HashMap<(String, Version, Version), MigrationFn>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, from: Version, to: Version, f: MigrationFn) {
        self.steps.insert((name.into(), from, to), f);
    }

    pub fn has_step(&self, name: &str, from: &Version, to: &Version) -> bool {
        self.steps
            .contains_key(&(name.to_string(), from.clone(), to.clone()))
    }

    /// Discover the hop-by-hop path from `from` to `to` along `chain`'s
    /// replacement links, and confirm a direct migration is registered for
    /// every hop.
    pub fn build_path<T>(
        &self,
        name: &str,
        chain: &VersionChain<T>,
        from: &Version,
        to: &Version,
    ) -> Result<Vec<(Version, Version)>, MigrationError> {
        let path = chain
            .chain_path(from, to)
            .ok_or_else(|| MigrationError::MissingStep {
                name: name.to_string(),
                from: from.clone(),
                to: to.clone(),
            })?;
        let mut steps = Vec::new();
        for pair in path.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            if !self.has_step(name, a, b) {
                return Err(MigrationError::MissingStep {
                    name: name.to_string(),
                    from: a.clone(),
                    to: b.clone(),
                });
            }
            steps.push((a.clone(), b.clone()));
        }
        Ok(steps)
    }

    /// Run a value through every hop from `from` to `to`.
    pub fn migrate<T>(
        &self,
        name: &str,
        chain: &VersionChain<T>,
        from: &Version,
        to: &Version,
        value: &Value,
    ) -> Result<Value, MigrationError> {
        let steps = self.build_path(name, chain, from, to)?;
        let mut current = value.clone();
        for (a, b) in steps {
            let f = self
                .steps
                .get(&(name.to_string(), a, b))
                .expect("build_path already validated this step exists");
            current = f(&current).map_err(|reason| MigrationError::ExecutionFailed {
                name: name.to_string(),
                reason,
            })?;
        }
        Ok(current)
    }

    /// For every direct replacement edge in `chain`, whether a migration
    /// step covers it. Used to report migration-coverage gaps.
    pub fn analyze_coverage<T>(&self, name: &str, chain: &VersionChain<T>) -> Vec<(Version, Version, bool)> {
        let mut report = Vec::new();
        for entry in chain.entries() {
            if let Some(replaces) = &entry.replaces {
                let covered = self.has_step(name, replaces, &entry.version);
                report.push((replaces.clone(), entry.version.clone(), covered));
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version_registry::VersionEntry;

    fn chain_with_versions(pairs: &[(Version, Option<Version>)]) -> VersionChain<()> {
        let mut chain = VersionChain::new();
        for (version, replaces) in pairs {
            chain.insert(VersionEntry {
                version: version.clone(),
                replaces: replaces.clone(),
                deprecated: false,
                item: (),
            });
        }
        chain
    }

    #[test]
    fn migrates_across_a_single_step() {
        let chain = chain_with_versions(&[
            (Version::new(1, 0, 0), None),
            (Version::new(2, 0, 0), Some(Version::new(1, 0, 0))),
        ]);
        let mut registry = MigrationRegistry::new();
        registry.register(
            "account",
            Version::new(1, 0, 0),
            Version::new(2, 0, 0),
            Arc::new(|v: &Value| match v {
                Value::Int(n) => Ok(Value::Int(n + 1)),
                other => Err(format!("unexpected value {:?}", other)),
            }),
        );
        let result = registry
            .migrate(
                "account",
                &chain,
                &Version::new(1, 0, 0),
                &Version::new(2, 0, 0),
                &Value::Int(41),
            )
            .unwrap();
        assert_eq!(result, Value::Int(42));
    }

    #[test]
    fn builds_multi_step_path_and_chains_execution() {
        let chain = chain_with_versions(&[
            (Version::new(1, 0, 0), None),
            (Version::new(2, 0, 0), Some(Version::new(1, 0, 0))),
            (Version::new(3, 0, 0), Some(Version::new(2, 0, 0))),
        ]);
        let mut registry = MigrationRegistry::new();
        registry.register(
            "f",
            Version::new(1, 0, 0),
            Version::new(2, 0, 0),
            Arc::new(|v: &Value| Ok(match v {
                Value::Int(n) => Value::Int(n * 2),
                other => other.clone(),
            })),
        );
        registry.register(
            "f",
            Version::new(2, 0, 0),
            Version::new(3, 0, 0),
            Arc::new(|v: &Value| Ok(match v {
                Value::Int(n) => Value::Int(n + 10),
                other => other.clone(),
            })),
        );
        let result = registry
            .migrate("f", &chain, &Version::new(1, 0, 0), &Version::new(3, 0, 0), &Value::Int(5))
            .unwrap();
        assert_eq!(result, Value::Int(20));
    }

    #[test]
    fn missing_step_is_reported() {
        let chain = chain_with_versions(&[
            (Version::new(1, 0, 0), None),
            (Version::new(2, 0, 0), Some(Version::new(1, 0, 0))),
        ]);
        let registry = MigrationRegistry::new();
        let err = registry
            .build_path("f", &chain, &Version::new(1, 0, 0), &Version::new(2, 0, 0))
            .unwrap_err();
        assert!(matches!(err, MigrationError::MissingStep { .. }));
    }

    #[test]
    fn coverage_report_flags_uncovered_edges() {
        let chain = chain_with_versions(&[
            (Version::new(1, 0, 0), None),
            (Version::new(2, 0, 0), Some(Version::new(1, 0, 0))),
        ]);
        let registry = MigrationRegistry::new();
        let report = registry.analyze_coverage("f", &chain);
        assert_eq!(report.len(), 1);
        assert!(!report[0].2);
    }
}
