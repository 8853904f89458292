//! Composite identity codec.
//!
//! A resource addressed by several keys (e.g. `service_id` + `environment_id`)
//! is stored under one opaque token. Components are joined with `:`; inside a
//! component `\` is written as `\\` and `:` as `\:`, so any identifier string
//! survives a round trip and distinct tuples never share a token.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use thiserror::Error;

use crate::IdentityToken;

const DELIM: char = ':';
const ESCAPE: char = '\\';

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("malformed identity {token:?}: {reason}")]
    Malformed { token: String, reason: String },
    #[error("identity expects {expected} component(s) ({names}), got {got}")]
    Arity { expected: usize, got: usize, names: String },
}

/// Ordered tuple of component keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompositeIdentity {
    components: SmallVec<[String; 2]>,
}

impl CompositeIdentity {
    pub fn new<I, S>(components: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { components: components.into_iter().map(Into::into).collect() }
    }

    pub fn single(id: impl Into<String>) -> Self { Self::new([id.into()]) }

    pub fn components(&self) -> &[String] { &self.components }
    pub fn get(&self, idx: usize) -> Option<&str> { self.components.get(idx).map(|s| s.as_str()) }
    pub fn len(&self) -> usize { self.components.len() }
    pub fn is_empty(&self) -> bool { self.components.is_empty() }
}

impl fmt::Display for CompositeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&join_escaped(&self.components))
    }
}

/// Codec for one resource kind. `names` fixes the arity and labels each component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityCodec {
    names: SmallVec<[String; 2]>,
}

impl IdentityCodec {
    /// Panics on an empty name list; an identity always has at least one component.
    pub fn new(names: &[&str]) -> Self {
        assert!(!names.is_empty(), "identity codec needs at least one component");
        Self { names: names.iter().map(|s| s.to_string()).collect() }
    }

    pub fn names(&self) -> &[String] { &self.names }
    pub fn arity(&self) -> usize { self.names.len() }

    pub fn encode(&self, id: &CompositeIdentity) -> Result<IdentityToken, IdentityError> {
        self.check_arity(id.len())?;
        Ok(IdentityToken(join_escaped(id.components())))
    }

    pub fn encode_parts(&self, parts: &[&str]) -> Result<IdentityToken, IdentityError> {
        self.encode(&CompositeIdentity::new(parts.iter().copied()))
    }

    pub fn decode(&self, token: &str) -> Result<CompositeIdentity, IdentityError> {
        let parts = split_escaped(token)?;
        self.check_arity(parts.len())?;
        Ok(CompositeIdentity { components: parts })
    }

    /// Name/value pairs, in codec order.
    pub fn labelled<'a>(&'a self, id: &'a CompositeIdentity) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        self.names.iter().map(|n| n.as_str()).zip(id.components().iter().map(|c| c.as_str()))
    }

    fn check_arity(&self, got: usize) -> Result<(), IdentityError> {
        if got != self.arity() {
            return Err(IdentityError::Arity { expected: self.arity(), got, names: self.names.join(",") });
        }
        Ok(())
    }
}

fn join_escaped(components: &[String]) -> String {
    let mut out = String::new();
    for (i, c) in components.iter().enumerate() {
        if i > 0 { out.push(DELIM); }
        for ch in c.chars() {
            if ch == DELIM || ch == ESCAPE { out.push(ESCAPE); }
            out.push(ch);
        }
    }
    out
}

fn split_escaped(token: &str) -> Result<SmallVec<[String; 2]>, IdentityError> {
    let malformed = |reason: &str| IdentityError::Malformed { token: token.to_string(), reason: reason.to_string() };
    let mut parts: SmallVec<[String; 2]> = SmallVec::new();
    let mut cur = String::new();
    let mut chars = token.chars();
    while let Some(ch) = chars.next() {
        match ch {
            ESCAPE => match chars.next() {
                Some(next @ (DELIM | ESCAPE)) => cur.push(next),
                Some(other) => return Err(malformed(&format!("invalid escape sequence \\{}", other))),
                None => return Err(malformed("dangling escape at end of token")),
            },
            DELIM => parts.push(std::mem::take(&mut cur)),
            other => cur.push(other),
        }
    }
    parts.push(cur);
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> IdentityCodec { IdentityCodec::new(&["service_id", "environment_id"]) }

    #[test]
    fn plain_pair_uses_colon() {
        let t = pair().encode_parts(&["svc", "env"]).unwrap();
        assert_eq!(t.as_str(), "svc:env");
        let id = pair().decode("svc:env").unwrap();
        assert_eq!(id.components(), &["svc".to_string(), "env".to_string()]);
    }

    #[test]
    fn delimiter_inside_component_is_escaped() {
        let t = pair().encode_parts(&["a:b", "c"]).unwrap();
        assert_eq!(t.as_str(), "a\\:b:c");
        assert_eq!(pair().decode(t.as_str()).unwrap().get(0), Some("a:b"));
    }

    #[test]
    fn wrong_arity_is_rejected() {
        assert!(matches!(pair().decode("only-one"), Err(IdentityError::Arity { expected: 2, got: 1, .. })));
        assert!(matches!(pair().decode("a:b:c"), Err(IdentityError::Arity { got: 3, .. })));
        assert!(pair().encode_parts(&["x"]).is_err());
    }

    #[test]
    fn bad_escapes_are_malformed() {
        assert!(matches!(pair().decode("a\\x:b"), Err(IdentityError::Malformed { .. })));
        assert!(matches!(pair().decode("a:b\\"), Err(IdentityError::Malformed { .. })));
    }

    #[test]
    fn labelled_pairs_follow_codec_order() {
        let c = pair();
        let id = CompositeIdentity::new(["s1", "e1"]);
        let v: Vec<_> = c.labelled(&id).collect();
        assert_eq!(v, vec![("service_id", "s1"), ("environment_id", "e1")]);
    }
}
