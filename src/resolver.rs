//! Request resolution: "does this URL redirect, and where to".
//!
//! Resolution reads only the in-memory [`RedirectIndex`] and never blocks
//! on I/O. Steps, short-circuiting on the first hit:
//!
//! 1. only `GET` is considered
//! 2. query parameters are put in stable key order
//! 3. the homepage, built-in routes, reserved prefixes and excluded
//!    substrings are skipped
//! 4. exact lookup of `path?query`
//! 5. path-only lookup, accepted when the definition respects params
//! 6. registered [`Matcher`]s in order
//! 7. optional standard redirect (lowercase, no trailing slash)
//!
//! A malformed request is logged and treated as "no redirect".

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::http::{HeaderMap, Method};
use regex::Regex;
use tracing::{debug, warn};
use url::form_urlencoded;

use redirects_core::{
    Dimension, Redirect, RedirectCode, RedirectDefinition, RedirectError, Result,
};

use crate::config::{DimensionsConfig, PatternConfig, ResolverConfig};
use crate::index::RedirectIndex;

/// A request after query normalization, scoped to one dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedRequest {
    pub path: String,
    /// Canonical query string without the leading `?`; `None` when absent
    /// or empty.
    pub query: Option<String>,
    pub dimension: Dimension,
}

impl NormalizedRequest {
    /// Builds a normalized request. Query pairs keep their original
    /// encoding and are reordered by decoded key (stable).
    pub fn new(path: &str, query: Option<&str>, dimension: Dimension) -> Result<Self> {
        let query = match query {
            Some(q) if !q.is_empty() => {
                check_escapes(q)?;
                let pairs = sorted_pairs(q);
                (!pairs.is_empty()).then(|| join_pairs(&pairs))
            }
            _ => None,
        };
        Ok(Self {
            path: path.to_string(),
            query,
            dimension,
        })
    }

    /// `path?query`, the exact-match key.
    pub fn uri(&self) -> String {
        match &self.query {
            Some(q) => format!("{}?{}", self.path, q),
            None => self.path.clone(),
        }
    }
}

/// Pluggable fallback matcher, consulted after index lookups fail.
pub trait Matcher: Send + Sync {
    fn match_request(&self, request: &NormalizedRequest) -> Result<Option<RedirectDefinition>>;
}

/// Regex matcher over the request path with capture expansion in the
/// target (`$1`, `$name`).
pub struct PatternMatcher {
    regex: Regex,
    target: String,
    code: RedirectCode,
}

impl PatternMatcher {
    pub fn new(pattern: &str, target: impl Into<String>, code: RedirectCode) -> Result<Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| RedirectError::invalid(format!("invalid pattern '{pattern}': {e}")))?;
        Ok(Self {
            regex,
            target: target.into(),
            code,
        })
    }

    pub fn from_config(config: &PatternConfig) -> Result<Self> {
        Self::new(
            &config.pattern,
            config.target.clone(),
            RedirectCode::try_from(config.code)?,
        )
    }
}

impl Matcher for PatternMatcher {
    fn match_request(&self, request: &NormalizedRequest) -> Result<Option<RedirectDefinition>> {
        let Some(captures) = self.regex.captures(&request.path) else {
            return Ok(None);
        };
        let mut target = String::new();
        captures.expand(&self.target, &mut target);

        if target.is_empty() {
            return Err(RedirectError::malformed(format!(
                "pattern '{}' expanded to an empty target for {}",
                self.regex.as_str(),
                request.path
            )));
        }
        if target == request.path {
            return Ok(None);
        }

        let mut def = RedirectDefinition::manual(
            request.path.clone(),
            target,
            self.code,
            request.dimension.clone(),
        );
        def.respect_params = true;
        def.transfer_params = true;
        Ok(Some(def))
    }
}

/// Maps a request to the dimension it belongs to.
pub trait DimensionProvider: Send + Sync {
    fn dimension(&self, headers: &HeaderMap) -> Dimension;
}

/// Resolves the dimension from the `Host` header (port ignored).
pub struct HostDimensionProvider {
    hosts: HashMap<String, Dimension>,
    default: Dimension,
}

impl HostDimensionProvider {
    pub fn new(hosts: HashMap<String, Dimension>, default: Dimension) -> Self {
        let hosts = hosts
            .into_iter()
            .map(|(host, dim)| (host.to_ascii_lowercase(), dim))
            .collect();
        Self { hosts, default }
    }

    pub fn from_config(config: &DimensionsConfig) -> Self {
        Self::new(
            config
                .hosts
                .iter()
                .map(|(host, dim)| (host.clone(), Dimension::new(dim.clone())))
                .collect(),
            config.default_dimension(),
        )
    }

    pub fn for_host(&self, host: Option<&str>) -> Dimension {
        host.map(|h| strip_port(h).to_ascii_lowercase())
            .and_then(|h| self.hosts.get(&h).cloned())
            .unwrap_or_else(|| self.default.clone())
    }
}

/// `host[:port]` → `host`. Bracketed IPv6 literals keep their colons.
fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port)) if !port.ends_with(']') && (!name.contains(':') || name.ends_with(']')) => {
            name
        }
        _ => host,
    }
}

impl DimensionProvider for HostDimensionProvider {
    fn dimension(&self, headers: &HeaderMap) -> Dimension {
        let host = headers
            .get(axum::http::header::HOST)
            .and_then(|v| v.to_str().ok());
        self.for_host(host)
    }
}

/// Routes served by this process; a stored redirect never shadows them.
const BUILTIN_ROUTES: &[&str] = &["/_redirects", "/health"];

/// Requests that are never redirected.
#[derive(Debug, Clone, Default)]
pub struct Blacklist {
    /// Matched against the start of the path.
    pub reserved_prefixes: Vec<String>,
    /// Matched anywhere in the raw request URI, query included.
    pub excluded_substrings: Vec<String>,
}

impl Blacklist {
    pub fn blocks(&self, path: &str, query: Option<&str>) -> bool {
        if path == "/" || BUILTIN_ROUTES.iter().any(|route| is_route(path, route)) {
            return true;
        }
        if self.reserved_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
            return true;
        }
        let uri = match query {
            Some(q) if !q.is_empty() => format!("{path}?{q}"),
            _ => path.to_string(),
        };
        self.excluded_substrings.iter().any(|s| uri.contains(s.as_str()))
    }
}

fn is_route(path: &str, route: &str) -> bool {
    path.strip_prefix(route)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

pub struct RequestResolver {
    index: Arc<RedirectIndex>,
    blacklist: Blacklist,
    standard_redirects: bool,
    matchers: Vec<Box<dyn Matcher>>,
}

impl RequestResolver {
    pub fn new(index: Arc<RedirectIndex>, blacklist: Blacklist, standard_redirects: bool) -> Self {
        Self {
            index,
            blacklist,
            standard_redirects,
            matchers: Vec::new(),
        }
    }

    /// Builds a resolver with the blacklist and the pattern matchers of
    /// `[resolver]`, in declaration order.
    pub fn from_config(index: Arc<RedirectIndex>, config: &ResolverConfig) -> Result<Self> {
        let blacklist = Blacklist {
            reserved_prefixes: config.reserved_prefixes.clone(),
            excluded_substrings: config.excluded_substrings.clone(),
        };
        let mut resolver = Self::new(index, blacklist, config.standard_redirects);
        for pattern in &config.patterns {
            resolver = resolver.with_matcher(PatternMatcher::from_config(pattern)?);
        }
        Ok(resolver)
    }

    /// Registers a matcher after the ones already present.
    pub fn with_matcher(mut self, matcher: impl Matcher + 'static) -> Self {
        self.matchers.push(Box::new(matcher));
        self
    }

    /// Resolves a request; any error means "no redirect".
    pub fn resolve(
        &self,
        method: &Method,
        path: &str,
        query: Option<&str>,
        dimension: &Dimension,
    ) -> Option<Redirect> {
        match self.try_resolve(method, path, query, dimension) {
            Ok(redirect) => redirect,
            Err(e) => {
                warn!(path, query = ?query, dimension = %dimension, error = %e, "could not resolve request");
                None
            }
        }
    }

    pub fn try_resolve(
        &self,
        method: &Method,
        path: &str,
        query: Option<&str>,
        dimension: &Dimension,
    ) -> Result<Option<Redirect>> {
        if *method != Method::GET {
            return Ok(None);
        }

        let request = NormalizedRequest::new(path, query, dimension.clone())?;
        if self.blacklist.blocks(path, query) {
            return Ok(None);
        }

        let Some(def) = self.find_definition(&request) else {
            return Ok(None);
        };

        let location = build_location(&def, &request)?;
        debug!(
            source = %request.uri(),
            location = %location,
            code = %def.code,
            dimension = %dimension,
            "redirect matched"
        );
        Ok(Some(Redirect {
            location,
            code: def.code,
        }))
    }

    fn find_definition(&self, request: &NormalizedRequest) -> Option<RedirectDefinition> {
        let dimension = request.dimension.as_str();

        if let Some(def) = self.index.lookup(dimension, &request.uri()) {
            if def.is_active() {
                return Some(def);
            }
        }

        if request.query.is_some() {
            if let Some(def) = self.index.lookup(dimension, &request.path) {
                if def.is_active() && def.respect_params {
                    return Some(def);
                }
            }
        }

        for matcher in &self.matchers {
            match matcher.match_request(request) {
                Ok(Some(def)) => return Some(def),
                Ok(None) => {}
                Err(e) => debug!(error = %e, path = %request.path, "matcher failed, skipping"),
            }
        }

        if self.standard_redirects {
            return standard_redirect(request);
        }
        None
    }
}

/// Lowercases the path and strips a trailing slash; yields a permanent
/// redirect when that changes the request. The query is kept as is.
fn standard_redirect(request: &NormalizedRequest) -> Option<RedirectDefinition> {
    let mut normalized = request.path.to_lowercase();
    while normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    if normalized == request.path {
        return None;
    }

    let target = match &request.query {
        Some(q) => format!("{normalized}?{q}"),
        None => normalized,
    };
    Some(RedirectDefinition::manual(
        request.uri(),
        target,
        RedirectCode::Permanent,
        request.dimension.clone(),
    ))
}

/// Computes the response location for a matched definition.
///
/// Without `transfer_params`, or without a request query, the target is
/// used verbatim. Otherwise request and target queries are merged, the
/// target winning on key collisions, and ordered by key.
pub fn build_location(def: &RedirectDefinition, request: &NormalizedRequest) -> Result<String> {
    let request_query = match (&request.query, def.transfer_params) {
        (Some(q), true) => q,
        _ => return Ok(def.target.clone()),
    };

    if def.target.contains("://") {
        url::Url::parse(&def.target).map_err(|e| {
            RedirectError::malformed(format!("invalid target URL '{}': {e}", def.target))
        })?;
    }

    let (without_fragment, fragment) = match def.target.split_once('#') {
        Some((rest, fragment)) => (rest, Some(fragment)),
        None => (def.target.as_str(), None),
    };
    let (base, target_query) = match without_fragment.split_once('?') {
        Some((base, query)) => (base, query),
        None => (without_fragment, ""),
    };
    check_escapes(target_query)?;

    let target_pairs = sorted_pairs(target_query);
    let target_keys: HashSet<&str> = target_pairs.iter().map(|p| p.key.as_str()).collect();
    let mut merged: Vec<QueryPair> = sorted_pairs(request_query)
        .into_iter()
        .filter(|p| !target_keys.contains(p.key.as_str()))
        .collect();
    merged.extend(target_pairs.iter().cloned());
    merged.sort_by(|a, b| a.key.cmp(&b.key));

    let mut location = base.to_string();
    if !merged.is_empty() {
        location.push('?');
        location.push_str(&join_pairs(&merged));
    }
    if let Some(fragment) = fragment {
        location.push('#');
        location.push_str(fragment);
    }
    Ok(location)
}

#[derive(Debug, Clone)]
struct QueryPair {
    /// Decoded key, used for ordering and collisions.
    key: String,
    /// Segment as it appeared on the wire.
    raw: String,
}

fn sorted_pairs(query: &str) -> Vec<QueryPair> {
    let mut pairs: Vec<QueryPair> = query
        .split('&')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            let raw_key = segment.split('=').next().unwrap_or(segment);
            let key = form_urlencoded::parse(raw_key.as_bytes())
                .next()
                .map(|(k, _)| k.into_owned())
                .unwrap_or_default();
            QueryPair {
                key,
                raw: segment.to_string(),
            }
        })
        .collect();
    pairs.sort_by(|a, b| a.key.cmp(&b.key));
    pairs
}

fn join_pairs(pairs: &[QueryPair]) -> String {
    pairs
        .iter()
        .map(|p| p.raw.as_str())
        .collect::<Vec<_>>()
        .join("&")
}

/// Rejects `%` sequences that are not followed by two hex digits.
fn check_escapes(query: &str) -> Result<()> {
    let bytes = query.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let valid = bytes.len() > i + 2
                && bytes[i + 1].is_ascii_hexdigit()
                && bytes[i + 2].is_ascii_hexdigit();
            if !valid {
                return Err(RedirectError::malformed(format!(
                    "invalid percent escape in query '{query}'"
                )));
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    Ok(())
}
