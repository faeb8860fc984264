//! Capability grants
//!
//! A capability token is a string of semicolon-separated clauses:
//!
//! ```text
//! read:/lights/**;write:/user/**;range:/user/level=0..1;rate:/user/**=120
//! ```
//!
//! `read`/`write` clauses carry comma-separated patterns. `admin` grants
//! both on the given patterns. `range` and `rate` clauses attach
//! per-address constraints checked before a write is applied.
//!
//! Routers accept tokens two ways: a pre-shared registry mapping opaque
//! token strings to grants, or the self-describing `cap:` form above when
//! the deployment runs without a registry.

use crate::address::Pattern;
use crate::types::Value;
use crate::{Error, Result};
use std::collections::HashMap;

/// Why a write or subscribe was refused.
#[derive(Debug, Clone, PartialEq)]
pub enum Refusal {
    /// Address outside the grant's write set.
    Scope,
    /// Value violates a range constraint.
    Range { min: f64, max: f64 },
}

/// Per-address constraint attached to a grant.
#[derive(Debug, Clone)]
pub struct Constraint {
    pub pattern: Pattern,
    pub range: Option<(f64, f64)>,
    pub max_rate: Option<u32>,
}

/// Decoded capability set held by a session.
#[derive(Debug, Clone, Default)]
pub struct Grant {
    read: Vec<Pattern>,
    write: Vec<Pattern>,
    constraints: Vec<Constraint>,
}

impl Grant {
    /// Grant with unrestricted read and write. Used for sessions in open
    /// mode and for bridge pseudo-sessions.
    pub fn open() -> Self {
        let all = Pattern::compile("/**").expect("static pattern");
        Self {
            read: vec![all.clone()],
            write: vec![all],
            constraints: Vec::new(),
        }
    }

    /// Parse the clause grammar described in the module docs.
    pub fn parse(spec: &str) -> Result<Self> {
        let mut grant = Grant::default();
        for clause in spec.split(';').filter(|c| !c.is_empty()) {
            let (verb, rest) = clause
                .split_once(':')
                .ok_or_else(|| Error::InvalidToken(format!("clause without ':': {clause}")))?;
            match verb {
                "read" => {
                    for pat in rest.split(',') {
                        grant.read.push(Pattern::compile(pat)?);
                    }
                }
                "write" => {
                    for pat in rest.split(',') {
                        grant.write.push(Pattern::compile(pat)?);
                    }
                }
                "admin" => {
                    for pat in rest.split(',') {
                        let p = Pattern::compile(pat)?;
                        grant.read.push(p.clone());
                        grant.write.push(p);
                    }
                }
                "range" => {
                    let (pat, bounds) = rest.split_once('=').ok_or_else(|| {
                        Error::InvalidToken(format!("range clause without '=': {clause}"))
                    })?;
                    let (lo, hi) = bounds.split_once("..").ok_or_else(|| {
                        Error::InvalidToken(format!("range bounds must be lo..hi: {clause}"))
                    })?;
                    let min = lo
                        .parse::<f64>()
                        .map_err(|e| Error::InvalidToken(e.to_string()))?;
                    let max = hi
                        .parse::<f64>()
                        .map_err(|e| Error::InvalidToken(e.to_string()))?;
                    grant.constraints.push(Constraint {
                        pattern: Pattern::compile(pat)?,
                        range: Some((min, max)),
                        max_rate: None,
                    });
                }
                "rate" => {
                    let (pat, hz) = rest.split_once('=').ok_or_else(|| {
                        Error::InvalidToken(format!("rate clause without '=': {clause}"))
                    })?;
                    grant.constraints.push(Constraint {
                        pattern: Pattern::compile(pat)?,
                        range: None,
                        max_rate: Some(
                            hz.parse::<u32>()
                                .map_err(|e| Error::InvalidToken(e.to_string()))?,
                        ),
                    });
                }
                other => {
                    return Err(Error::InvalidToken(format!("unknown clause verb: {other}")));
                }
            }
        }
        Ok(grant)
    }

    pub fn allows_read(&self, address: &str) -> bool {
        self.read.iter().any(|p| p.matches(address))
    }

    pub fn allows_write(&self, address: &str) -> bool {
        self.write.iter().any(|p| p.matches(address))
    }

    /// Full write check including range constraints.
    pub fn check_write(&self, address: &str, value: &Value) -> std::result::Result<(), Refusal> {
        if !self.allows_write(address) {
            return Err(Refusal::Scope);
        }
        for c in &self.constraints {
            if let Some((min, max)) = c.range {
                if c.pattern.matches(address) {
                    if let Some(v) = value.as_f64() {
                        if v < min || v > max {
                            return Err(Refusal::Range { min, max });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Write rate ceiling for an address, if any constraint applies.
    pub fn write_rate_limit(&self, address: &str) -> Option<u32> {
        self.constraints
            .iter()
            .filter(|c| c.pattern.matches(address))
            .filter_map(|c| c.max_rate)
            .min()
    }

    /// True if a SUBSCRIBE pattern overlaps the read set at all.
    pub fn read_set_intersects(&self, pattern: &Pattern) -> bool {
        self.read.iter().any(|p| p.intersects(pattern))
    }
}

/// Pre-shared token registry: opaque token string → grant.
#[derive(Debug, Default)]
pub struct TokenBook {
    tokens: HashMap<String, Grant>,
}

impl TokenBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, token: impl Into<String>, grant: Grant) {
        self.tokens.insert(token.into(), grant);
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Resolve a presented token. Registry entries win; the
    /// self-describing `cap:` form is accepted as a fallback.
    pub fn resolve(&self, token: &str) -> Result<Grant> {
        if let Some(grant) = self.tokens.get(token) {
            return Ok(grant.clone());
        }
        if let Some(spec) = token.strip_prefix("cap:") {
            return Grant::parse(spec);
        }
        Err(Error::InvalidToken("unrecognized token".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_scope_check() {
        let g = Grant::parse("read:/lights/**;write:/user/**").unwrap();
        assert!(g.allows_read("/lights/kitchen"));
        assert!(!g.allows_read("/system/boot"));
        assert!(g.allows_write("/user/fader/1"));
        assert!(!g.allows_write("/lights/kitchen"));
    }

    #[test]
    fn admin_grants_both() {
        let g = Grant::parse("admin:/rig/**").unwrap();
        assert!(g.allows_read("/rig/a"));
        assert!(g.allows_write("/rig/a"));
    }

    #[test]
    fn range_constraint_rejects_out_of_bounds() {
        let g = Grant::parse("write:/user/**;range:/user/level=0..1").unwrap();
        assert!(g.check_write("/user/level", &Value::Float(0.5)).is_ok());
        assert_eq!(
            g.check_write("/user/level", &Value::Float(1.5)),
            Err(Refusal::Range { min: 0.0, max: 1.0 })
        );
        // Non-numeric values pass range checks untouched.
        assert!(g.check_write("/user/level", &Value::String("x".into())).is_ok());
    }

    #[test]
    fn scope_refusal_outside_write_set() {
        let g = Grant::parse("write:/user/**").unwrap();
        assert_eq!(
            g.check_write("/system/boot", &Value::Bool(true)),
            Err(Refusal::Scope)
        );
    }

    #[test]
    fn rate_constraint_minimum_wins() {
        let g = Grant::parse("write:/a/**;rate:/a/**=120;rate:/a/hot=30").unwrap();
        assert_eq!(g.write_rate_limit("/a/hot"), Some(30));
        assert_eq!(g.write_rate_limit("/a/cold"), Some(120));
    }

    #[test]
    fn subscribe_intersection() {
        let g = Grant::parse("read:/lights/**").unwrap();
        assert!(g.read_set_intersects(&Pattern::compile("/lights/*/level").unwrap()));
        assert!(g.read_set_intersects(&Pattern::compile("/**").unwrap()));
        assert!(!g.read_set_intersects(&Pattern::compile("/audio/**").unwrap()));
    }

    #[test]
    fn token_book_resolution() {
        let mut book = TokenBook::new();
        book.insert("opaque-1", Grant::parse("admin:/**").unwrap());
        assert!(book.resolve("opaque-1").is_ok());
        assert!(book.resolve("cap:read:/a/**").is_ok());
        assert!(book.resolve("nope").is_err());
    }
}
