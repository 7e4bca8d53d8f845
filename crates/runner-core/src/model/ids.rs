//! Identifier newtypes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// System-assigned plan identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanId(pub Uuid);

impl PlanId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PlanId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PlanId {
    type Err = uuid::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// System-assigned node identifier. Also seeds the node's worktree branch
/// name (§4.3) so it is guaranteed never to collide with a user branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub Uuid);

impl NodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = uuid::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// User-assigned stable node identifier, unique within a plan. Validated
/// against `^[a-z0-9-]{3,64}$` (§3, §6.1) both at construction and on
/// deserialization, so a plan submitted with a malformed producerId is
/// rejected by serde itself rather than slipping past into
/// `validate_plan`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProducerId(String);

impl TryFrom<String> for ProducerId {
    type Error = ProducerIdError;
    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(raw)
    }
}

impl From<ProducerId> for String {
    fn from(id: ProducerId) -> Self {
        id.0
    }
}

#[derive(Debug, Error)]
pub enum ProducerIdError {
    #[error("producerId {0:?} must match [a-z0-9-]{{3,64}}")]
    InvalidFormat(String),
}

impl ProducerId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, ProducerIdError> {
        let raw = raw.into();
        let valid_len = (3..=64).contains(&raw.len());
        let valid_chars = raw
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
        if !valid_len || !valid_chars {
            return Err(ProducerIdError::InvalidFormat(raw));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn producer_id_accepts_valid() {
        assert!(ProducerId::parse("build-step").is_ok());
        assert!(ProducerId::parse("a12").is_ok());
    }

    #[test]
    fn producer_id_rejects_too_short() {
        assert!(ProducerId::parse("ab").is_err());
    }

    #[test]
    fn producer_id_rejects_uppercase() {
        assert!(ProducerId::parse("Build-Step").is_err());
    }

    #[test]
    fn producer_id_rejects_underscore() {
        assert!(ProducerId::parse("build_step").is_err());
    }

    #[test]
    fn producer_id_rejects_too_long() {
        let long = "a".repeat(65);
        assert!(ProducerId::parse(long).is_err());
    }
}
