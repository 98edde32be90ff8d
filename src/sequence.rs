// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sequence tokens.
//!
//! A [`Sequence`] is the source's position marker for one change. The
//! replicator treats it as opaque apart from ordering, which must be total so
//! the checkpoint can only move forward.
//!
//! Two numeric shapes are recognized and compared numerically:
//!
//! ```text
//! "42"               → (42, 0)
//! "1700000000000-3"  → (1700000000000, 3)   Redis stream ID
//! ```
//!
//! A token with a numeric prefix and an opaque suffix, as emitted by change
//! feeds that encode a shard vector after the update count, orders by the
//! prefix first and then by the suffix text:
//!
//! ```text
//! "9-g1AAAA" < "12-g1AAAA"
//! ```
//!
//! It sorts after the purely numeric token with the same prefix. Anything
//! else is compared lexicographically and sorts after every token with a
//! numeric prefix.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Totally ordered position in a source's change stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sequence(String);

impl Sequence {
    /// Create a sequence from its textual token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The beginning of the stream.
    pub fn zero() -> Self {
        Self("0".to_string())
    }

    /// Check if this is the start-of-stream position.
    pub fn is_zero(&self) -> bool {
        matches!(self.numeric(), Some((0, 0)))
    }

    /// The raw token.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn numeric(&self) -> Option<(u64, u64)> {
        parse_numeric(&self.0)
    }
}

impl Default for Sequence {
    fn default() -> Self {
        Self::zero()
    }
}

fn parse_numeric(s: &str) -> Option<(u64, u64)> {
    match s.split_once('-') {
        Some((major, minor)) => Some((major.parse().ok()?, minor.parse().ok()?)),
        None => Some((s.parse().ok()?, 0)),
    }
}

/// Sort key. Variant order is significant.
#[derive(PartialEq, Eq, PartialOrd, Ord)]
enum SortKey<'a> {
    Positioned(u64, Shape<'a>),
    Opaque(&'a str),
}

#[derive(PartialEq, Eq, PartialOrd, Ord)]
enum Shape<'a> {
    Numeric(u64),
    Suffixed(&'a str),
}

fn sort_key(s: &str) -> SortKey<'_> {
    if let Some((major, minor)) = parse_numeric(s) {
        return SortKey::Positioned(major, Shape::Numeric(minor));
    }
    match s.split_once('-') {
        Some((major, suffix)) => match major.parse() {
            Ok(major) => SortKey::Positioned(major, Shape::Suffixed(suffix)),
            Err(_) => SortKey::Opaque(s),
        },
        None => SortKey::Opaque(s),
    }
}

impl Ord for Sequence {
    fn cmp(&self, other: &Self) -> Ordering {
        // "5" and "5-0" are distinct tokens at the same position
        sort_key(&self.0)
            .cmp(&sort_key(&other.0))
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for Sequence {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u64> for Sequence {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

impl From<&str> for Sequence {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Sequence {
    fn from(s: String) -> Self {
        Self(s)
    }
}
