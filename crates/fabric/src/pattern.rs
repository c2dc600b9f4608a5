//! Topic binding patterns.
//!
//! `*` matches exactly one segment, `#` matches zero or more.

use crate::error::{FabricError, FabricResult};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Star,
    Hash,
}

/// A parsed binding pattern such as `*.catalog-put.start` or `#.index.init`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindingPattern {
    segments: Vec<Segment>,
    source: String,
}

impl BindingPattern {
    /// Whether the pattern matches a routing key.
    pub fn matches(&self, key: &str) -> bool {
        let key: Vec<&str> = key.split('.').collect();
        Self::matches_from(&self.segments, &key)
    }

    fn matches_from(pattern: &[Segment], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((Segment::Hash, rest)) => {
                // `#` absorbs zero or more leading segments
                (0..=key.len()).any(|skip| Self::matches_from(rest, &key[skip..]))
            }
            Some((head, rest)) => {
                let Some((first, tail)) = key.split_first() else {
                    return false;
                };
                let head_ok = match head {
                    Segment::Star => true,
                    Segment::Literal(lit) => lit == first,
                    Segment::Hash => unreachable!(),
                };
                head_ok && Self::matches_from(rest, tail)
            }
        }
    }
}

impl FromStr for BindingPattern {
    type Err = FabricError;

    fn from_str(s: &str) -> FabricResult<Self> {
        if s.is_empty() {
            return Err(FabricError::InvalidBinding(s.to_string()));
        }
        let segments = s
            .split('.')
            .map(|seg| match seg {
                "*" => Ok(Segment::Star),
                "#" => Ok(Segment::Hash),
                lit if !lit.is_empty()
                    && lit.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') =>
                {
                    Ok(Segment::Literal(lit.to_string()))
                }
                _ => Err(FabricError::InvalidBinding(s.to_string())),
            })
            .collect::<FabricResult<Vec<_>>>()?;
        Ok(Self {
            segments,
            source: s.to_string(),
        })
    }
}

impl fmt::Display for BindingPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(s: &str) -> BindingPattern {
        s.parse().unwrap()
    }

    #[test]
    fn literal_match() {
        let p = pattern("app.index.init");
        assert!(p.matches("app.index.init"));
        assert!(!p.matches("app.index.start"));
        assert!(!p.matches("app.index"));
    }

    #[test]
    fn star_matches_exactly_one_segment() {
        let p = pattern("*.catalog-put.start");
        assert!(p.matches("nearline-api.catalog-put.start"));
        assert!(p.matches("other-app.catalog-put.start"));
        assert!(!p.matches("a.b.catalog-put.start"));
        assert!(!p.matches("catalog-put.start"));
    }

    #[test]
    fn hash_matches_any_number_of_segments() {
        let p = pattern("#.index.init");
        assert!(p.matches("app.index.init"));
        assert!(p.matches("a.b.index.init"));
        assert!(p.matches("index.init"));
        assert!(!p.matches("app.index.start"));
    }

    #[test]
    fn hash_alone_matches_everything() {
        let p = pattern("#");
        assert!(p.matches("a"));
        assert!(p.matches("a.b.c"));
    }

    #[test]
    fn middle_wildcards() {
        let p = pattern("app.*.complete");
        assert!(p.matches("app.index.complete"));
        assert!(p.matches("app.transfer-put.complete"));
        assert!(!p.matches("app.index.failed"));
        assert!(!p.matches("other.index.complete"));
    }

    #[test]
    fn invalid_patterns_rejected() {
        assert!("".parse::<BindingPattern>().is_err());
        assert!("a..b".parse::<BindingPattern>().is_err());
        assert!("a.b!.c".parse::<BindingPattern>().is_err());
    }
}
