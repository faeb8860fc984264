//! Address parsing and wildcard pattern matching
//!
//! Addresses are slash-delimited paths with non-empty segments:
//!
//! ```text
//! /lights/kitchen/brightness
//! /midi/launchpad/cc/1/74
//! ```
//!
//! Subscription patterns may use `*` (exactly one segment) and `**`
//! (zero or more segments). `SET`/`PUBLISH` addresses must be concrete.

use crate::{Error, Result};

/// A validated concrete address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address(String);

impl Address {
    /// Parse and validate a concrete address (wildcards rejected).
    pub fn parse(s: &str) -> Result<Self> {
        validate_path(s)?;
        if s[1..].split('/').any(|seg| seg == "*" || seg == "**") {
            return Err(Error::InvalidAddress(format!(
                "wildcards not allowed in a concrete address: {s}"
            )));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0[1..].split('/')
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Shared path checks: leading slash, non-empty segments.
fn validate_path(s: &str) -> Result<()> {
    if s.is_empty() {
        return Err(Error::InvalidAddress("empty address".into()));
    }
    if !s.starts_with('/') {
        return Err(Error::InvalidAddress(format!(
            "address must start with '/': {s}"
        )));
    }
    if s[1..].split('/').any(str::is_empty) {
        return Err(Error::InvalidAddress(format!("empty segment in: {s}")));
    }
    Ok(())
}

/// True if the string contains wildcard segments.
pub fn is_pattern(s: &str) -> bool {
    s.split('/').any(|seg| seg == "*" || seg == "**")
}

/// One compiled pattern segment.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Seg {
    Literal(String),
    /// `*`: exactly one non-empty segment.
    AnyOne,
    /// `**`: zero or more segments.
    AnyDepth,
}

/// A compiled subscription pattern.
///
/// Compilation happens once per subscription; [`Pattern::matches`] runs in
/// O(|pattern| · |address|) with no heap allocation, walking the address
/// by byte offset and backtracking through the most recent `**`.
#[derive(Debug, Clone)]
pub struct Pattern {
    raw: String,
    segments: Vec<Seg>,
    exact: bool,
}

impl Pattern {
    pub fn compile(s: &str) -> Result<Self> {
        validate_path(s).map_err(|_| Error::InvalidPattern(format!("bad pattern: {s}")))?;
        let segments: Vec<Seg> = s[1..]
            .split('/')
            .map(|seg| match seg {
                "*" => Seg::AnyOne,
                "**" => Seg::AnyDepth,
                lit => Seg::Literal(lit.to_string()),
            })
            .collect();
        let exact = !segments
            .iter()
            .any(|seg| matches!(seg, Seg::AnyOne | Seg::AnyDepth));
        Ok(Self {
            raw: s.to_string(),
            segments,
            exact,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True when the pattern has no wildcards.
    pub fn is_exact(&self) -> bool {
        self.exact
    }

    /// Literal segments preceding the first wildcard, for prefix indexing.
    pub fn literal_prefix(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().map_while(|seg| match seg {
            Seg::Literal(lit) => Some(lit.as_str()),
            _ => None,
        })
    }

    /// Test a concrete address against this pattern.
    pub fn matches(&self, address: &str) -> bool {
        if self.exact {
            return self.raw == address;
        }
        let path = match address.strip_prefix('/') {
            Some(p) if !p.is_empty() => p,
            _ => return false,
        };

        let segs = &self.segments;
        let mut pi = 0usize;
        let mut pos = 0usize;
        // Most recent `**`: (index after it, path offset it has consumed to).
        let mut star: Option<(usize, usize)> = None;

        loop {
            if pi < segs.len() {
                if matches!(segs[pi], Seg::AnyDepth) {
                    star = Some((pi + 1, pos));
                    pi += 1;
                    continue;
                }
                if let Some((seg, next)) = next_segment(path, pos) {
                    let hit = match &segs[pi] {
                        Seg::Literal(lit) => lit == seg,
                        Seg::AnyOne => true,
                        Seg::AnyDepth => unreachable!(),
                    };
                    if hit {
                        pi += 1;
                        pos = next;
                        continue;
                    }
                }
            } else if next_segment(path, pos).is_none() {
                return true;
            }

            // Mismatch: widen the last `**` by one segment and retry.
            match star {
                Some((resume, consumed)) => match next_segment(path, consumed) {
                    Some((_, next)) => {
                        star = Some((resume, next));
                        pi = resume;
                        pos = next;
                    }
                    None => return false,
                },
                None => return false,
            }
        }
    }

    /// True when this pattern and `other` can match at least one common
    /// concrete address. Used to intersect SUBSCRIBE patterns with
    /// capability read sets.
    pub fn intersects(&self, other: &Pattern) -> bool {
        segs_intersect(&self.segments, &other.segments)
    }
}

impl std::fmt::Display for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Next segment of `path` starting at byte `pos`, with the offset just
/// past its trailing slash.
#[inline]
fn next_segment(path: &str, pos: usize) -> Option<(&str, usize)> {
    if pos >= path.len() {
        return None;
    }
    match path[pos..].find('/') {
        Some(i) => Some((&path[pos..pos + i], pos + i + 1)),
        None => Some((&path[pos..], path.len())),
    }
}

fn segs_intersect(a: &[Seg], b: &[Seg]) -> bool {
    match (a.first(), b.first()) {
        (None, None) => true,
        (Some(Seg::AnyDepth), _) => {
            // `**` absorbs zero segments, or one of b's.
            segs_intersect(&a[1..], b) || (!b.is_empty() && segs_intersect(a, &b[1..]))
        }
        (_, Some(Seg::AnyDepth)) => {
            segs_intersect(a, &b[1..]) || (!a.is_empty() && segs_intersect(&a[1..], b))
        }
        (None, Some(_)) | (Some(_), None) => false,
        (Some(x), Some(y)) => {
            let compatible = match (x, y) {
                (Seg::Literal(l), Seg::Literal(m)) => l == m,
                _ => true,
            };
            compatible && segs_intersect(&a[1..], &b[1..])
        }
    }
}
