//! Per-name version chains: the data structure `CompilerContext` builds
//! function and type registrations on top of.
//!
//! A chain tracks every registered version of one name, its `replaces`
//! back-link, and runs `latest`/`latest_stable` pointers incrementally as
//! entries are inserted rather than recomputing a max on every lookup.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::version::{satisfies, ConstraintKind, Version};

#[derive(Debug, Clone)]
pub struct VersionEntry<T> {
    pub version: Version,
    pub replaces: Option<Version>,
    pub deprecated: bool,
    pub item: T,
}

#[derive(Debug, Clone)]
pub struct VersionChain<T> {
    entries: Vec<VersionEntry<T>>,
    latest_version: Option<Version>,
    latest_stable_version: Option<Version>,
}

impl<T> Default for VersionChain<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            latest_version: None,
            latest_stable_version: None,
        }
    }
}

impl<T> VersionChain<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: VersionEntry<T>) {
        let is_stable = entry.version.is_stable();
        let v = entry.version.clone();
        self.entries.push(entry);
        if self
            .latest_version
            .as_ref()
            .map_or(true, |cur| v.compare(cur) == Ordering::Greater)
        {
            self.latest_version = Some(v.clone());
        }
        if is_stable
            && self
                .latest_stable_version
                .as_ref()
                .map_or(true, |cur| v.compare(cur) == Ordering::Greater)
        {
            self.latest_stable_version = Some(v);
        }
    }

    pub fn get(&self, version: &Version) -> Option<&T> {
        self.entries
            .iter()
            .find(|e| &e.version == version)
            .map(|e| &e.item)
    }

    pub fn contains(&self, version: &Version) -> bool {
        self.entries.iter().any(|e| &e.version == version)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn latest(&self) -> Option<&Version> {
        self.latest_version.as_ref()
    }

    pub fn latest_stable(&self) -> Option<&Version> {
        self.latest_stable_version.as_ref()
    }

    pub fn versions(&self) -> impl Iterator<Item = &Version> {
        self.entries.iter().map(|e| &e.version)
    }

    pub fn entries(&self) -> impl Iterator<Item = &VersionEntry<T>> {
        self.entries.iter()
    }

    /// The version, if any, whose `replaces` points at `version` (i.e. the
    /// entry that directly supersedes it).
    pub fn replaced_by(&self, version: &Version) -> Option<&Version> {
        self.entries
            .iter()
            .find(|e| e.replaces.as_ref() == Some(version))
            .map(|e| &e.version)
    }

    pub fn replaces_of(&self, version: &Version) -> Option<&Version> {
        self.entries
            .iter()
            .find(|e| &e.version == version)
            .and_then(|e| e.replaces.as_ref())
    }

    /// Walk the replacement chain forward from `from`. Returns the full
    /// path (inclusive of both ends) if `to` is reachable, `None` if the
    /// chain dead-ends or a guard trips (a cycle would otherwise loop
    /// forever — the registry is expected to reject cycles at registration
    /// time, but this walk stays defensive regardless).
    pub fn chain_path(&self, from: &Version, to: &Version) -> Option<Vec<Version>> {
        if from == to {
            return Some(vec![from.clone()]);
        }
        let mut path = vec![from.clone()];
        let mut current = from.clone();
        let guard_limit = self.entries.len() + 1;
        for _ in 0..guard_limit {
            match self.replaced_by(&current) {
                Some(next) => {
                    current = next.clone();
                    path.push(current.clone());
                    if &current == to {
                        return Some(path);
                    }
                }
                None => return None,
            }
        }
        None
    }

    /// Resolve a constraint to the single best-matching version in this
    /// chain, per the spec's "highest version satisfying the constraint"
    /// rule (`Latest`/`Stable` short-circuit to the cached pointers).
    pub fn resolve(&self, constraint: &ConstraintKind) -> Option<&Version> {
        match constraint {
            ConstraintKind::Latest => self.latest(),
            ConstraintKind::Stable => self.latest_stable(),
            _ => self
                .entries
                .iter()
                .map(|e| &e.version)
                .filter(|v| satisfies(v, constraint))
                .max_by(|a, b| a.compare(b)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct VersionRegistry<T> {
    chains: HashMap<String, VersionChain<T>>,
}

impl<T> VersionRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chain(&self, name: &str) -> Option<&VersionChain<T>> {
        self.chains.get(name)
    }

    pub fn chain_mut(&mut self, name: &str) -> &mut VersionChain<T> {
        self.chains.entry(name.to_string()).or_default()
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.chains.keys()
    }

    pub fn has_migration_path(&self, name: &str, from: &Version, to: &Version) -> bool {
        self.chain(name)
            .and_then(|c| c.chain_path(from, to))
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(major: u64, minor: u64, patch: u64, replaces: Option<Version>) -> VersionEntry<&'static str> {
        VersionEntry {
            version: Version::new(major, minor, patch),
            replaces,
            deprecated: false,
            item: "x",
        }
    }

    #[test]
    fn tracks_latest_as_entries_are_inserted() {
        let mut chain = VersionChain::new();
        chain.insert(entry(1, 0, 0, None));
        chain.insert(entry(2, 0, 0, None));
        chain.insert(entry(1, 5, 0, None));
        assert_eq!(chain.latest(), Some(&Version::new(2, 0, 0)));
    }

    #[test]
    fn latest_stable_ignores_prerelease() {
        let mut chain = VersionChain::new();
        chain.insert(entry(1, 0, 0, None));
        let mut pre = entry(2, 0, 0, None);
        pre.version.prerelease = Some("beta".to_string());
        chain.insert(pre);
        assert_eq!(chain.latest_stable(), Some(&Version::new(1, 0, 0)));
        assert_eq!(chain.latest().unwrap().prerelease.as_deref(), Some("beta"));
    }

    #[test]
    fn chain_path_follows_replacement_links() {
        let mut chain = VersionChain::new();
        chain.insert(entry(1, 0, 0, None));
        chain.insert(entry(2, 0, 0, Some(Version::new(1, 0, 0))));
        chain.insert(entry(3, 0, 0, Some(Version::new(2, 0, 0))));
        let path = chain
            .chain_path(&Version::new(1, 0, 0), &Version::new(3, 0, 0))
            .unwrap();
        assert_eq!(
            path,
            vec![Version::new(1, 0, 0), Version::new(2, 0, 0), Version::new(3, 0, 0)]
        );
    }

    #[test]
    fn chain_path_returns_none_when_unreachable() {
        let mut chain = VersionChain::new();
        chain.insert(entry(1, 0, 0, None));
        chain.insert(entry(2, 0, 0, None));
        assert!(chain
            .chain_path(&Version::new(1, 0, 0), &Version::new(2, 0, 0))
            .is_none());
    }

    #[test]
    fn resolve_latest_and_caret_constraint() {
        let mut chain = VersionChain::new();
        chain.insert(entry(1, 0, 0, None));
        chain.insert(entry(1, 4, 0, None));
        chain.insert(entry(2, 0, 0, None));
        let caret = ConstraintKind::Caret(Version::new(1, 0, 0));
        assert_eq!(chain.resolve(&caret), Some(&Version::new(1, 4, 0)));
        assert_eq!(chain.resolve(&ConstraintKind::Latest), Some(&Version::new(2, 0, 0)));
    }

    #[test]
    fn registry_tracks_independent_chains_per_name() {
        let mut registry: VersionRegistry<&'static str> = VersionRegistry::new();
        registry.chain_mut("calc").insert(entry(1, 0, 0, None));
        registry.chain_mut("greet").insert(entry(1, 0, 0, None));
        assert!(registry.has_migration_path("calc", &Version::new(1, 0, 0), &Version::new(1, 0, 0)));
        assert!(registry.chain("missing").is_none());
    }
}
