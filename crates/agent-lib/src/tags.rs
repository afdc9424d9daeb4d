//! Tag sets attached to metrics, events and service checks

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A single `key:value` tag. Tags without a value render as the bare key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Parse a `key:value` string. The split happens on the first colon so
    /// values such as image references keep their own colons.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        match raw.split_once(':') {
            Some((key, _)) if key.is_empty() => None,
            Some((key, value)) => Some(Self::new(key, value)),
            None => Some(Self::new(raw, "")),
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.value.is_empty() {
            write!(f, "{}", self.key)
        } else {
            write!(f, "{}:{}", self.key, self.value)
        }
    }
}

/// Ordered, deduplicated set of tags.
///
/// A key may carry several values inside one layer (a pod behind two
/// services gets two `kube_service` tags). When layers are merged the later
/// layer owns the key outright, so a key never mixes values from two sources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TagSet {
    tags: BTreeSet<Tag>,
}

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from `key:value` strings, skipping empty entries
    pub fn from_strings<I, S>(raw: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::new();
        for tag in raw.into_iter().filter_map(|s| Tag::parse(s.as_ref())) {
            set.tags.insert(tag);
        }
        set
    }

    /// Add a value for `key`, keeping any existing values
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.tags.insert(Tag::new(key, value));
    }

    /// Replace every value of `key` with `value`
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let tag = Tag::new(key, value);
        self.remove(&tag.key);
        self.tags.insert(tag);
    }

    /// Drop all values of `key`
    pub fn remove(&mut self, key: &str) {
        self.tags.retain(|t| t.key != key);
    }

    /// Merge `other` into this set. Keys present in `other` replace the
    /// values this set holds for them.
    pub fn merge(&mut self, other: &TagSet) {
        let keys: BTreeSet<&str> = other.tags.iter().map(|t| t.key.as_str()).collect();
        self.tags.retain(|t| !keys.contains(t.key.as_str()));
        self.tags.extend(other.tags.iter().cloned());
    }

    /// Return a merged copy, `other` taking precedence
    pub fn merged(&self, other: &TagSet) -> TagSet {
        let mut out = self.clone();
        out.merge(other);
        out
    }

    pub fn contains(&self, key: &str, value: &str) -> bool {
        self.tags.iter().any(|t| t.key == key && t.value == value)
    }

    /// First value of `key` in sort order
    pub fn get(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.key == key)
            .map(|t| t.value.as_str())
    }

    pub fn values<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.key == key)
            .map(|t| t.value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tag> {
        self.tags.iter()
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Render as `key:value` strings for submission
    pub fn to_strings(&self) -> Vec<String> {
        self.tags.iter().map(Tag::to_string).collect()
    }
}

impl FromIterator<Tag> for TagSet {
    fn from_iter<I: IntoIterator<Item = Tag>>(iter: I) -> Self {
        Self {
            tags: iter.into_iter().collect(),
        }
    }
}

/// Value of the `pod_name` tag.
///
/// Some runtimes report pod names as `namespace/name`; the namespace already
/// has its own tag and must not be folded into `pod_name`.
pub fn pod_name_tag_value<'a>(namespace: &str, pod_name: &'a str) -> &'a str {
    if namespace.is_empty() {
        return pod_name;
    }
    pod_name
        .strip_prefix(namespace)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(pod_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_parse() {
        assert_eq!(Tag::parse("env:prod"), Some(Tag::new("env", "prod")));
        assert_eq!(
            Tag::parse("image:nginx:1.21"),
            Some(Tag::new("image", "nginx:1.21"))
        );
        assert_eq!(Tag::parse("standalone"), Some(Tag::new("standalone", "")));
        assert_eq!(Tag::parse("  "), None);
        assert_eq!(Tag::parse(":value"), None);
    }

    #[test]
    fn test_tag_display() {
        assert_eq!(Tag::new("env", "prod").to_string(), "env:prod");
        assert_eq!(Tag::new("standalone", "").to_string(), "standalone");
    }

    #[test]
    fn test_insert_deduplicates_pairs() {
        let mut tags = TagSet::new();
        tags.insert("kube_service", "web");
        tags.insert("kube_service", "web");
        tags.insert("kube_service", "web-internal");

        assert_eq!(tags.len(), 2);
        assert_eq!(
            tags.values("kube_service").collect::<Vec<_>>(),
            vec!["web", "web-internal"]
        );
    }

    #[test]
    fn test_set_replaces_key() {
        let mut tags = TagSet::new();
        tags.insert("env", "dev");
        tags.insert("env", "staging");
        tags.set("env", "prod");

        assert_eq!(tags.to_strings(), vec!["env:prod"]);
    }

    #[test]
    fn test_merge_later_layer_owns_key() {
        let mut base = TagSet::from_strings(["env:dev", "team:core", "kube_service:old"]);
        let overlay = TagSet::from_strings(["env:prod", "kube_service:a", "kube_service:b"]);
        base.merge(&overlay);

        assert_eq!(
            base.to_strings(),
            vec!["env:prod", "kube_service:a", "kube_service:b", "team:core"]
        );
    }

    #[test]
    fn test_pod_name_tag_value_strips_namespace() {
        assert_eq!(pod_name_tag_value("default", "default/web-1"), "web-1");
        assert_eq!(pod_name_tag_value("default", "web-1"), "web-1");
        assert_eq!(pod_name_tag_value("default", "default-web-1"), "default-web-1");
        assert_eq!(pod_name_tag_value("", "default/web-1"), "default/web-1");
    }
}
