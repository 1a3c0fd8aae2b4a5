//! Tunnel tag parsing
//!
//! Tags are supplied as a comma-separated `key=value` list, e.g.
//! `"env=prod,team=edge"`.

use std::fmt;

/// A single tunnel tag
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tag {
    pub name: String,
    pub value: String,
}

impl Tag {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

/// Parse a `key=value,...` list into ordered, deduplicated tags
///
/// - Pairs without `=`, with an empty key or an empty value are skipped
/// - A repeated key keeps its first position and takes the last value
/// - At most `limit` distinct keys are accepted
pub fn parse_tags(input: &str, limit: usize) -> Vec<Tag> {
    let mut tags: Vec<Tag> = Vec::new();

    for pair in input.split(',') {
        let Some((name, value)) = pair.split_once('=') else {
            continue;
        };
        let (name, value) = (name.trim(), value.trim());
        if name.is_empty() || value.is_empty() {
            continue;
        }

        if let Some(existing) = tags.iter_mut().find(|t| t.name == name) {
            existing.value = value.to_string();
        } else if tags.len() < limit {
            tags.push(Tag::new(name, value));
        }
    }

    tags
}
