use std::cmp::Ordering;
use std::fmt;
use std::fmt::Display;

use enquote::enquote;
use serde::{Deserialize, Serialize};

use vmquery_ast::expr::{AggregateModifier, VectorMatchModifier};
use vmquery_common::hash::{FastHashSet, Signature};

use crate::runtime_error::{RuntimeError, RuntimeResult};

pub const METRIC_NAME_LABEL: &str = "__name__";

/// Tag represents a (key, value) tag for metric.
#[derive(Debug, Default, PartialEq, Eq, Clone, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new<K: Into<String>, V: Into<String>>(key: K, value: V) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl PartialOrd for Tag {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Tag {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| self.value.cmp(&other.value))
    }
}

/// MetricName is the identity of a series: the metric group (the `__name__` tag) plus the
/// remaining tags.
///
/// Tags are kept sorted by key at all times, so the serialized form and the signature of two
/// names with the same tag set are identical regardless of insertion order.
#[derive(Debug, PartialEq, Eq, Clone, Default, Hash, Serialize, Deserialize)]
pub struct MetricName {
    pub metric_group: String,
    tags: Vec<Tag>,
}

impl MetricName {
    pub fn new(name: &str) -> Self {
        MetricName {
            metric_group: name.to_string(),
            tags: vec![],
        }
    }

    /// from_strings creates new labels from pairs of strings.
    pub fn from_strings(ss: &[&str]) -> RuntimeResult<Self> {
        if ss.len() % 2 != 0 {
            return Err(RuntimeError::from("invalid number of strings"));
        }

        let mut res = MetricName::default();
        for pair in ss.chunks_exact(2) {
            res.set_tag(pair[0], pair[1]);
        }

        Ok(res)
    }

    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    pub fn tag_count(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metric_group.is_empty() && self.tags.is_empty()
    }

    pub fn reset_metric_group(&mut self) {
        self.metric_group.clear();
    }

    pub fn set_metric_group(&mut self, value: &str) {
        self.metric_group = value.to_string();
    }

    /// Reset resets the mn.
    pub fn reset(&mut self) {
        self.metric_group.clear();
        self.tags.clear();
    }

    fn position(&self, key: &str) -> Result<usize, usize> {
        self.tags.binary_search_by(|tag| tag.key.as_str().cmp(key))
    }

    /// sets the tag with the given key to value, replacing any previous value.
    pub fn set_tag<S: Into<String>>(&mut self, key: &str, value: S) {
        if key == METRIC_NAME_LABEL {
            self.metric_group = value.into();
            return;
        }
        match self.position(key) {
            Ok(idx) => self.tags[idx].value = value.into(),
            Err(idx) => self.tags.insert(idx, Tag::new(key, value)),
        }
    }

    /// removes a tag with the given key
    pub fn remove_tag(&mut self, key: &str) {
        if key == METRIC_NAME_LABEL {
            self.reset_metric_group();
            return;
        }
        if let Ok(idx) = self.position(key) {
            self.tags.remove(idx);
        }
    }

    pub fn has_tag(&self, key: &str) -> bool {
        if key == METRIC_NAME_LABEL {
            return !self.metric_group.is_empty();
        }
        self.position(key).is_ok()
    }

    /// returns tag value for the given key.
    pub fn get_tag_value(&self, key: &str) -> Option<&str> {
        if key == METRIC_NAME_LABEL {
            return Some(&self.metric_group);
        }
        self.position(key)
            .ok()
            .map(|idx| self.tags[idx].value.as_str())
    }

    /// remove_tags_on removes all the tags not included to on_tags.
    pub fn remove_tags_on(&mut self, on_tags: &[String]) {
        let set: FastHashSet<&str> = on_tags.iter().map(|x| x.as_str()).collect();
        if !set.contains(METRIC_NAME_LABEL) {
            self.reset_metric_group()
        }
        self.tags.retain(|tag| set.contains(tag.key.as_str()));
    }

    /// remove_tags_ignoring removes all the tags included in ignoring_tags.
    pub fn remove_tags_ignoring(&mut self, ignoring_tags: &[String]) {
        let set: FastHashSet<&str> = ignoring_tags.iter().map(|x| x.as_str()).collect();
        if set.contains(METRIC_NAME_LABEL) {
            self.reset_metric_group();
        }
        self.tags.retain(|tag| !set.contains(tag.key.as_str()));
    }

    pub fn update_tags_by_group_modifier(&mut self, modifier: &Option<VectorMatchModifier>) {
        match modifier {
            Some(VectorMatchModifier::On(labels)) => self.remove_tags_on(labels),
            Some(VectorMatchModifier::Ignoring(labels)) => self.remove_tags_ignoring(labels),
            None => {}
        }
    }

    /// Strips the tags not participating in grouping for `aggr(...) by|without (...)`.
    pub fn remove_group_tags(&mut self, modifier: &Option<AggregateModifier>) {
        match modifier {
            Some(AggregateModifier::By(labels)) => self.remove_tags_on(labels),
            Some(AggregateModifier::Without(labels)) => {
                self.remove_tags_ignoring(labels);
                // Reset metric group as Prometheus does on `aggr(...) without (...)` call.
                self.reset_metric_group();
            }
            // Grouping by nothing: every series lands in the same group.
            None => self.remove_tags_on(&[]),
        }
    }

    /// copies tags listed in add_tags from src when they are missing in self.
    pub fn add_missing_tags(&mut self, add_tags: &[String], src: &MetricName) {
        for tag_name in add_tags {
            if self.has_tag(tag_name) {
                continue;
            }
            if let Some(value) = src.get_tag_value(tag_name) {
                if !value.is_empty() {
                    self.set_tag(tag_name, value);
                }
            }
        }
    }

    /// Stable hash of the metric group and the sorted tags.
    pub fn signature(&self) -> Signature {
        Signature::from_name_and_tags(
            &self.metric_group,
            self.tags.iter().map(|t| (t.key.as_str(), t.value.as_str())),
        )
    }

    /// Stable hash of the tags only, ignoring the metric group.
    pub fn tags_signature(&self) -> Signature {
        Signature::from_name_and_tags(
            "",
            self.tags.iter().map(|t| (t.key.as_str(), t.value.as_str())),
        )
    }

    /// Appends a deterministic, length-prefixed encoding of the name and its sorted tags.
    pub fn marshal(&self, dst: &mut Vec<u8>) {
        marshal_str(dst, &self.metric_group);
        dst.extend_from_slice(&(self.tags.len() as u64).to_le_bytes());
        for Tag { key, value } in self.tags.iter() {
            marshal_str(dst, key);
            marshal_str(dst, value);
        }
    }

    pub fn marshaled_size(&self) -> usize {
        let mut n = 8 + self.metric_group.len() + 8;
        for Tag { key, value } in self.tags.iter() {
            n += 16 + key.len() + value.len();
        }
        n
    }

    /// unmarshal decodes a name written by `marshal`, returning the unread tail.
    pub fn unmarshal(src: &[u8]) -> RuntimeResult<(MetricName, &[u8])> {
        let (metric_group, mut src) = unmarshal_str(src, "metric group")?;
        let (count, tail) = read_u64(src, "tag count")?;
        src = tail;
        let mut mn = MetricName {
            metric_group,
            tags: Vec::with_capacity(count.min(1024) as usize),
        };
        for _ in 0..count {
            let (key, tail) = unmarshal_str(src, "tag key")?;
            let (value, tail) = unmarshal_str(tail, "tag value")?;
            src = tail;
            mn.set_tag(&key, value);
        }
        Ok((mn, src))
    }
}

fn marshal_str(dst: &mut Vec<u8>, s: &str) {
    dst.extend_from_slice(&(s.len() as u64).to_le_bytes());
    dst.extend_from_slice(s.as_bytes());
}

pub(crate) fn read_u64<'a>(src: &'a [u8], what: &str) -> RuntimeResult<(u64, &'a [u8])> {
    if src.len() < 8 {
        return Err(RuntimeError::SerializationError(format!(
            "cannot read {what}: need 8 bytes; got {}",
            src.len()
        )));
    }
    let (head, tail) = src.split_at(8);
    let mut buf = [0u8; 8];
    buf.copy_from_slice(head);
    Ok((u64::from_le_bytes(buf), tail))
}

fn unmarshal_str<'a>(src: &'a [u8], what: &str) -> RuntimeResult<(String, &'a [u8])> {
    let (len, src) = read_u64(src, what)?;
    let len = len as usize;
    if src.len() < len {
        return Err(RuntimeError::SerializationError(format!(
            "cannot read {what}: need {len} bytes; got {}",
            src.len()
        )));
    }
    let (head, tail) = src.split_at(len);
    let s = String::from_utf8(head.to_vec())
        .map_err(|_| RuntimeError::SerializationError(format!("invalid utf8 in {what}")))?;
    Ok((s, tail))
}

impl Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{{", self.metric_group)?;
        for (i, Tag { key, value }) in self.tags.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", key, enquote('"', value))?;
        }
        write!(f, "}}")
    }
}

impl PartialOrd for MetricName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MetricName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.metric_group
            .cmp(&other.metric_group)
            .then_with(|| self.tags.cmp(&other.tags))
    }
}
