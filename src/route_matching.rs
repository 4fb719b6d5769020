//! Path templating and segment matching.
//!
//! Endpoints carry platform parameters (`/users/{id}`); the local router works
//! on `:name` segments (`/users/:id`). Only whole-segment parameters exist.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::LazyLock;

use percent_encoding::percent_decode_str;
use regex::Regex;
use smallvec::SmallVec;

static PLATFORM_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([^{}/]+)\}").expect("static regex"));

/// `/users/{id}` → `/users/:id`.
pub fn platform_to_local(endpoint: &str) -> String {
    PLATFORM_PARAM.replace_all(endpoint, ":$1").into_owned()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Static(String),
    Param(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePattern {
    local: String,
    segments: Vec<Segment>,
}

impl RoutePattern {
    /// Parse a local (`:name`) pattern.
    pub fn parse(local: &str) -> Self {
        let segments = split_segments(local)
            .map(|seg| match seg.strip_prefix(':') {
                Some(name) if !name.is_empty() => Segment::Param(name.to_string()),
                _ => Segment::Static(seg.to_string()),
            })
            .collect();
        Self {
            local: local.to_string(),
            segments,
        }
    }

    pub fn from_endpoint(endpoint: &str) -> Self {
        Self::parse(&platform_to_local(endpoint))
    }

    /// Match a request path, returning decoded parameters on success.
    pub fn matches(&self, path: &str) -> Option<BTreeMap<String, String>> {
        let path_segments: SmallVec<[&str; 8]> = split_segments(path).collect();
        if path_segments.len() != self.segments.len() {
            return None;
        }

        let mut params = BTreeMap::new();
        for (pattern, value) in self.segments.iter().zip(path_segments) {
            match pattern {
                Segment::Static(expected) => {
                    if decode(value) != *expected {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    params.insert(name.clone(), decode(value));
                }
            }
        }
        Some(params)
    }

    /// Two patterns with the same shape match exactly the same paths.
    pub fn shape(&self) -> String {
        let parts: Vec<&str> = self
            .segments
            .iter()
            .map(|s| match s {
                Segment::Static(name) => name.as_str(),
                Segment::Param(_) => ":",
            })
            .collect();
        format!("/{}", parts.join("/"))
    }

    /// Ordering used by the live table: earlier static segments win over
    /// parameters, then longer patterns win.
    pub fn precedence(&self, other: &Self) -> Ordering {
        for (a, b) in self.segments.iter().zip(&other.segments) {
            match (a, b) {
                (Segment::Static(_), Segment::Param(_)) => return Ordering::Less,
                (Segment::Param(_), Segment::Static(_)) => return Ordering::Greater,
                _ => {}
            }
        }
        other
            .segments
            .len()
            .cmp(&self.segments.len())
            .then_with(|| self.local.cmp(&other.local))
    }
}

fn split_segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

fn decode(segment: &str) -> String {
    percent_decode_str(segment).decode_utf8_lossy().into_owned()
}
