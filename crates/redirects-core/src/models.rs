//! Core data models used throughout the redirects service.
//!
//! A [`RedirectDefinition`] maps a site-relative `source` path to a
//! `target` within one [`Dimension`]. Definitions are either derived from
//! content-tree moves ([`RedirectionType::Automatic`]) or authored by users
//! ([`RedirectionType::Manual`]).

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RedirectError;

/// All definitions of one dimension, keyed by `source`.
pub type RedirectsBySource = HashMap<String, RedirectDefinition>;

/// Globally unique, immutable identifier of a definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Generates a fresh UUID v4 identifier.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Partition key (e.g. site + locale). Uniqueness and matching are scoped
/// to a single dimension.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Dimension(String);

impl Dimension {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Dimension {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Dimension {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Dimension {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// HTTP status used when answering with a redirect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum RedirectCode {
    Permanent,
    Found,
    Temporary,
    NotFound,
    Gone,
}

impl RedirectCode {
    pub fn as_u16(self) -> u16 {
        match self {
            RedirectCode::Permanent => 301,
            RedirectCode::Found => 302,
            RedirectCode::Temporary => 307,
            RedirectCode::NotFound => 404,
            RedirectCode::Gone => 410,
        }
    }
}

impl TryFrom<u16> for RedirectCode {
    type Error = RedirectError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            301 => Ok(RedirectCode::Permanent),
            302 => Ok(RedirectCode::Found),
            307 => Ok(RedirectCode::Temporary),
            404 => Ok(RedirectCode::NotFound),
            410 => Ok(RedirectCode::Gone),
            other => Err(RedirectError::invalid(format!(
                "unsupported redirect code: {other}"
            ))),
        }
    }
}

impl From<RedirectCode> for u16 {
    fn from(code: RedirectCode) -> Self {
        code.as_u16()
    }
}

impl fmt::Display for RedirectCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

/// Origin of a definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedirectionType {
    /// Authored by a user; never rewritten or retired automatically.
    Manual,
    /// Derived from a content-tree move; subject to consolidation.
    Automatic,
}

impl RedirectionType {
    pub fn as_str(self) -> &'static str {
        match self {
            RedirectionType::Manual => "manual",
            RedirectionType::Automatic => "automatic",
        }
    }
}

impl std::str::FromStr for RedirectionType {
    type Err = RedirectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(RedirectionType::Manual),
            "automatic" => Ok(RedirectionType::Automatic),
            other => Err(RedirectError::invalid(format!(
                "invalid redirection type: '{other}'; should be 'manual' or 'automatic'"
            ))),
        }
    }
}

/// The central entity: one `source → target` redirect in one dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedirectDefinition {
    pub id: EntityId,
    /// Content node that produced this redirect; `None` for manual ones.
    #[serde(default)]
    pub content_id: Option<String>,
    pub source: String,
    pub target: String,
    pub code: RedirectCode,
    pub respect_params: bool,
    pub transfer_params: bool,
    pub redirection_type: RedirectionType,
    pub dimension: Dimension,
    /// Inactive but retained (cycle-affected or disabled by a user).
    #[serde(default)]
    pub stale: bool,
    #[serde(default)]
    pub updated: DateTime<Utc>,
    #[serde(default)]
    pub last_updated_by: String,
}

impl RedirectDefinition {
    /// A permanent redirect derived from a content move, carrying the
    /// request's parameters through.
    pub fn automatic(
        source: impl Into<String>,
        target: impl Into<String>,
        dimension: Dimension,
        content_id: Option<String>,
    ) -> Self {
        Self {
            id: EntityId::new(),
            content_id,
            source: source.into(),
            target: target.into(),
            code: RedirectCode::Permanent,
            respect_params: true,
            transfer_params: true,
            redirection_type: RedirectionType::Automatic,
            dimension,
            stale: false,
            updated: Utc::now(),
            last_updated_by: String::new(),
        }
    }

    /// A user-authored redirect with parameter handling disabled.
    pub fn manual(
        source: impl Into<String>,
        target: impl Into<String>,
        code: RedirectCode,
        dimension: Dimension,
    ) -> Self {
        Self {
            id: EntityId::new(),
            content_id: None,
            source: source.into(),
            target: target.into(),
            code,
            respect_params: false,
            transfer_params: false,
            redirection_type: RedirectionType::Manual,
            dimension,
            stale: false,
            updated: Utc::now(),
            last_updated_by: String::new(),
        }
    }

    /// Parses a raw status into one of the supported redirect codes.
    pub fn validate_code(raw: u16) -> Result<RedirectCode, RedirectError> {
        RedirectCode::try_from(raw)
    }

    pub fn is_automatic(&self) -> bool {
        self.redirection_type == RedirectionType::Automatic
    }

    /// Active definitions take part in live matching and flattening.
    pub fn is_active(&self) -> bool {
        !self.stale && !self.target.is_empty()
    }

    /// Records an audit stamp for a mutation.
    pub fn touch(&mut self, user: &str) {
        self.updated = Utc::now();
        self.last_updated_by = user.to_string();
    }
}

/// A resolved redirect response: where to send the client and how.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Redirect {
    pub location: String,
    pub code: RedirectCode,
}
