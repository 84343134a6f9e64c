//! Version requests and candidate matching.

use std::str::FromStr;

use mdk_core::Node;

/// A `major.minor.patch` version. Missing components parse as `0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl FromStr for Version {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let s = s.strip_prefix('v').unwrap_or(s);
        let mut parts = s.split('.');
        let mut next = |required: bool| match parts.next() {
            Some(p) => p.parse::<u64>().map_err(|_| ()),
            None if required => Err(()),
            None => Ok(0),
        };
        let version = Self {
            major: next(true)?,
            minor: next(false)?,
            patch: next(false)?,
        };
        if parts.next().is_some() {
            return Err(());
        }
        Ok(version)
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// A parsed version request.
///
/// | form | meaning |
/// |------|---------|
/// | `*` | any version |
/// | `=1.2.3` | exactly that version |
/// | `>=1.2` | that version or newer |
/// | `^1.2` | same major, not older |
/// | `~1.2` | same major and minor, not older |
/// | `1.2` | exact if available, else as `^1.2` |
///
/// Anything unparseable is matched as a literal string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionReq {
    Any,
    Exact(Version),
    AtLeast(Version),
    Caret(Version),
    Tilde(Version),
    Preferred(Version),
    Literal(String),
}

impl VersionReq {
    /// Parse a request. Never fails; see `Literal`.
    #[must_use]
    pub fn parse(input: &str) -> Self {
        let s = input.trim();
        let parsed = if s == "*" || s.is_empty() {
            Ok(Self::Any)
        } else if let Some(rest) = s.strip_prefix(">=") {
            rest.parse().map(Self::AtLeast)
        } else if let Some(rest) = s.strip_prefix('=') {
            rest.parse().map(Self::Exact)
        } else if let Some(rest) = s.strip_prefix('^') {
            rest.parse().map(Self::Caret)
        } else if let Some(rest) = s.strip_prefix('~') {
            rest.parse().map(Self::Tilde)
        } else {
            s.parse().map(Self::Preferred)
        };
        parsed.unwrap_or_else(|()| Self::Literal(s.to_string()))
    }

    /// Whether a node advertising `version` satisfies this request.
    #[must_use]
    pub fn matches(&self, version: &str) -> bool {
        let Self::Literal(literal) = self else {
            return version.parse().is_ok_and(|v| self.matches_version(v));
        };
        literal == version.trim()
    }

    fn matches_version(&self, v: Version) -> bool {
        match *self {
            Self::Any => true,
            Self::Exact(want) => v == want,
            Self::AtLeast(min) => v >= min,
            Self::Caret(min) | Self::Preferred(min) => v.major == min.major && v >= min,
            Self::Tilde(min) => v.major == min.major && v.minor == min.minor && v >= min,
            Self::Literal(_) => false,
        }
    }

    /// Nodes eligible for selection: every satisfying node that shares the
    /// best available version.
    ///
    /// Exact matches win for `Preferred`; otherwise the highest satisfying
    /// version wins.
    #[must_use]
    pub fn best_candidates<'a>(&self, nodes: &'a [Node]) -> Vec<&'a Node> {
        if let Self::Literal(_) = self {
            return nodes.iter().filter(|n| self.matches(&n.version)).collect();
        }

        if let Self::Preferred(want) = *self {
            let exact: Vec<&Node> = nodes
                .iter()
                .filter(|n| n.version.parse::<Version>() == Ok(want))
                .collect();
            if !exact.is_empty() {
                return exact;
            }
        }

        let versioned: Vec<(Version, &Node)> = nodes
            .iter()
            .filter_map(|n| n.version.parse().ok().map(|v| (v, n)))
            .filter(|(v, _)| self.matches_version(*v))
            .collect();

        let Some(best) = versioned.iter().map(|(v, _)| *v).max() else {
            return Vec::new();
        };
        versioned
            .into_iter()
            .filter(|(v, _)| *v == best)
            .map(|(_, n)| n)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(versions: &[&str]) -> Vec<Node> {
        versions
            .iter()
            .enumerate()
            .map(|(i, v)| Node::new("svc", *v, format!("10.0.0.{i}:80")))
            .collect()
    }

    fn versions_of(candidates: &[&Node]) -> Vec<String> {
        candidates.iter().map(|n| n.version.clone()).collect()
    }

    #[test]
    fn test_version_parsing() {
        assert_eq!(
            "1".parse::<Version>(),
            Ok(Version { major: 1, minor: 0, patch: 0 })
        );
        assert_eq!(
            "v2.3.4".parse::<Version>(),
            Ok(Version { major: 2, minor: 3, patch: 4 })
        );
        assert!("1.2.3.4".parse::<Version>().is_err());
        assert!("one".parse::<Version>().is_err());
    }

    #[test]
    fn test_request_parsing() {
        assert_eq!(VersionReq::parse("*"), VersionReq::Any);
        assert!(matches!(VersionReq::parse(">=1.2"), VersionReq::AtLeast(_)));
        assert!(matches!(VersionReq::parse("=1.2"), VersionReq::Exact(_)));
        assert!(matches!(VersionReq::parse("^1"), VersionReq::Caret(_)));
        assert!(matches!(VersionReq::parse("~1.4"), VersionReq::Tilde(_)));
        assert!(matches!(VersionReq::parse("1.4"), VersionReq::Preferred(_)));
        assert_eq!(
            VersionReq::parse("canary"),
            VersionReq::Literal("canary".to_string())
        );
    }

    #[test]
    fn test_exact_match_is_preferred() {
        let all = nodes(&["1.2", "1.5", "1.2.0"]);
        let req = VersionReq::parse("1.2");
        assert_eq!(versions_of(&req.best_candidates(&all)), vec!["1.2", "1.2.0"]);
    }

    #[test]
    fn test_bare_version_falls_back_to_highest_compatible() {
        let all = nodes(&["1.3", "1.7.1", "2.0", "0.9"]);
        let req = VersionReq::parse("1.2");
        assert_eq!(versions_of(&req.best_candidates(&all)), vec!["1.7.1"]);
    }

    #[test]
    fn test_ranges_pick_highest_satisfying() {
        let all = nodes(&["1.0", "1.4.2", "1.4.9", "2.1", "3.0"]);
        assert_eq!(
            versions_of(&VersionReq::parse("~1.4").best_candidates(&all)),
            vec!["1.4.9"]
        );
        assert_eq!(
            versions_of(&VersionReq::parse(">=2").best_candidates(&all)),
            vec!["3.0"]
        );
        assert_eq!(
            versions_of(&VersionReq::parse("*").best_candidates(&all)),
            vec!["3.0"]
        );
        assert!(VersionReq::parse("^4").best_candidates(&all).is_empty());
    }

    #[test]
    fn test_literal_versions_match_by_string() {
        let all = nodes(&["canary", "1.0"]);
        let req = VersionReq::parse("canary");
        assert_eq!(versions_of(&req.best_candidates(&all)), vec!["canary"]);
        assert!(!req.matches("1.0"));
    }
}
