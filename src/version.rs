//! Semantic version parsing, ordering, and constraint matching.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum VersionError {
    #[error("invalid version string: {0}")]
    InvalidVersion(String),
    #[error("invalid version constraint: {0}")]
    InvalidConstraint(String),
}

/// A parsed semantic version: `major.minor.patch[-prerelease][+build]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub prerelease: Option<String>,
    pub build: Option<String>,
}

impl Version {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            prerelease: None,
            build: None,
        }
    }

    /// Canonical key used by the registry: `M.m.p[-pre]`. Build metadata is
    /// never part of the key or the ordering.
    pub fn canonical_key(&self) -> String {
        match &self.prerelease {
            Some(pre) => format!("{}.{}.{}-{}", self.major, self.minor, self.patch, pre),
            None => format!("{}.{}.{}", self.major, self.minor, self.patch),
        }
    }

    pub fn next_major(&self) -> Version {
        Version::new(self.major + 1, 0, 0)
    }

    pub fn next_minor(&self) -> Version {
        Version::new(self.major, self.minor + 1, 0)
    }

    pub fn is_stable(&self) -> bool {
        self.prerelease.is_none()
    }

    /// Total order per spec: lexicographic on `(major, minor, patch)`, then
    /// a version without a prerelease ranks above one with the same triple
    /// and a prerelease, then prereleases compare lexicographically.
    pub fn compare(&self, other: &Version) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| match (&self.prerelease, &other.prerelease) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => a.cmp(b),
            })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.prerelease {
            write!(f, "-{}", pre)?;
        }
        if let Some(build) = &self.build {
            write!(f, "+{}", build)?;
        }
        Ok(())
    }
}

/// Parse `v?M[.m[.p]][-pre][+build]`, with an optional leading `:` already
/// stripped by the lexer. Missing minor/patch default to 0.
pub fn parse_version(input: &str) -> Result<Version, VersionError> {
    let mut s = input.trim();
    s = s.strip_prefix(':').unwrap_or(s);
    s = s.strip_prefix('v').unwrap_or(s);

    let (core_and_pre, build) = match s.split_once('+') {
        Some((a, b)) => (a, Some(b.to_string())),
        None => (s, None),
    };
    let (core, prerelease) = match core_and_pre.split_once('-') {
        Some((a, b)) => (a, Some(b.to_string())),
        None => (core_and_pre, None),
    };

    let mut parts = core.split('.');
    let major = parts
        .next()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| VersionError::InvalidVersion(input.to_string()))?
        .parse::<u64>()
        .map_err(|_| VersionError::InvalidVersion(input.to_string()))?;
    let minor = match parts.next() {
        Some(p) => p
            .parse::<u64>()
            .map_err(|_| VersionError::InvalidVersion(input.to_string()))?,
        None => 0,
    };
    let patch = match parts.next() {
        Some(p) => p
            .parse::<u64>()
            .map_err(|_| VersionError::InvalidVersion(input.to_string()))?,
        None => 0,
    };
    if parts.next().is_some() {
        return Err(VersionError::InvalidVersion(input.to_string()));
    }
    if let Some(pre) = &prerelease {
        if pre.is_empty()
            || !pre
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
        {
            return Err(VersionError::InvalidVersion(input.to_string()));
        }
    }

    Ok(Version {
        major,
        minor,
        patch,
        prerelease,
        build,
    })
}

/// A resolved version constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintKind {
    Exact(Version),
    Caret(Version),
    Tilde(Version),
    Range {
        min: Option<Version>,
        max: Option<Version>,
        min_inclusive: bool,
        max_inclusive: bool,
    },
    Latest,
    Stable,
    Any,
}

pub fn parse_constraint(input: &str) -> Result<ConstraintKind, VersionError> {
    let s = input.trim();
    match s {
        "latest" | "*" => return Ok(ConstraintKind::Latest),
        "stable" | "stable-only" => return Ok(ConstraintKind::Stable),
        "any" | "all-versions" => return Ok(ConstraintKind::Any),
        _ => {}
    }
    if let Some(rest) = s.strip_prefix('^') {
        return Ok(ConstraintKind::Caret(parse_version(rest)?));
    }
    if let Some(rest) = s.strip_prefix('~') {
        return Ok(ConstraintKind::Tilde(parse_version(rest)?));
    }
    if s.starts_with(">=") || s.starts_with('>') || s.starts_with("<=") || s.starts_with('<') {
        return parse_range(s);
    }
    // Bare version, no operators.
    Ok(ConstraintKind::Exact(parse_version(s)?))
}

fn parse_range(s: &str) -> Result<ConstraintKind, VersionError> {
    let mut min = None;
    let mut max = None;
    let mut min_inclusive = false;
    let mut max_inclusive = false;

    let mut rest = s.trim();
    if let Some(r) = rest.strip_prefix(">=") {
        let (v, tail) = take_version_token(r)?;
        min = Some(v);
        min_inclusive = true;
        rest = tail;
    } else if let Some(r) = rest.strip_prefix('>') {
        let (v, tail) = take_version_token(r)?;
        min = Some(v);
        min_inclusive = false;
        rest = tail;
    }

    rest = rest.trim();
    if let Some(r) = rest.strip_prefix("<=") {
        let (v, tail) = take_version_token(r)?;
        max = Some(v);
        max_inclusive = true;
        rest = tail;
    } else if let Some(r) = rest.strip_prefix('<') {
        let (v, tail) = take_version_token(r)?;
        max = Some(v);
        max_inclusive = false;
        rest = tail;
    }

    if !rest.trim().is_empty() || (min.is_none() && max.is_none()) {
        return Err(VersionError::InvalidConstraint(s.to_string()));
    }

    Ok(ConstraintKind::Range {
        min,
        max,
        min_inclusive,
        max_inclusive,
    })
}

fn take_version_token(s: &str) -> Result<(Version, &str), VersionError> {
    let s = s.trim_start();
    let end = s
        .find(char::is_whitespace)
        .unwrap_or(s.len());
    let (token, tail) = s.split_at(end);
    Ok((parse_version(token)?, tail))
}

/// Does `version` satisfy `constraint`? `Latest` is vacuously true here; the
/// registry resolves it to its cached pointer separately.
pub fn satisfies(version: &Version, constraint: &ConstraintKind) -> bool {
    match constraint {
        ConstraintKind::Latest => true,
        ConstraintKind::Any => true,
        ConstraintKind::Stable => version.is_stable(),
        ConstraintKind::Exact(v) => version.compare(v) == Ordering::Equal,
        ConstraintKind::Caret(v) => {
            version.compare(v) != Ordering::Less && version.compare(&v.next_major()) == Ordering::Less
        }
        ConstraintKind::Tilde(v) => {
            version.compare(v) != Ordering::Less && version.compare(&v.next_minor()) == Ordering::Less
        }
        ConstraintKind::Range {
            min,
            max,
            min_inclusive,
            max_inclusive,
        } => {
            let min_ok = match min {
                None => true,
                Some(m) => {
                    let cmp = version.compare(m);
                    if *min_inclusive {
                        cmp != Ordering::Less
                    } else {
                        cmp == Ordering::Greater
                    }
                }
            };
            let max_ok = match max {
                None => true,
                Some(m) => {
                    let cmp = version.compare(m);
                    if *max_inclusive {
                        cmp != Ordering::Greater
                    } else {
                        cmp == Ordering::Less
                    }
                }
            };
            min_ok && max_ok
        }
    }
}
