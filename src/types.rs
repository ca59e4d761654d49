//! Core types for the stream log and the long-poll multiplexer.

use crate::error::StoreError;
use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Name of an append-only stream.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamName(pub String);

impl StreamName {
    pub fn new(name: impl Into<String>) -> Self {
        StreamName(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StreamName {
    fn from(name: &str) -> Self {
        StreamName(name.to_string())
    }
}

impl From<String> for StreamName {
    fn from(name: String) -> Self {
        StreamName(name)
    }
}

impl fmt::Debug for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamName({})", self.0)
    }
}

impl fmt::Display for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Coarse position watermark: "seen everything up to and including this".
///
/// A cursor compares against the millisecond part of an [`EntryId`]; the
/// sequence part is not distinguished.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Cursor(pub u64);

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cursor({})", self.0)
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Cursor {
    type Err = StoreError;

    /// Accepts `"<ms>"` or a full `"<ms>-<seq>"` id; only `<ms>` is kept.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let coarse = s.split_once('-').map_or(s, |(ms, _)| ms);
        coarse
            .parse()
            .map(Cursor)
            .map_err(|_| StoreError::InvalidId(s.to_string()))
    }
}

/// Identifier the log assigns to an entry, ordered by `(ms, seq)`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct EntryId {
    pub ms: u64,
    pub seq: u64,
}

impl EntryId {
    pub const ZERO: EntryId = EntryId { ms: 0, seq: 0 };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// The coarse component used for cursor comparison.
    pub fn cursor(self) -> Cursor {
        Cursor(self.ms)
    }

    /// True when this entry is strictly newer than `cursor`.
    pub fn is_after(self, cursor: Cursor) -> bool {
        self.ms > cursor.0
    }

    /// Smallest id that sorts after `self`, if any.
    pub fn next(self) -> Option<Self> {
        match self.seq.checked_add(1) {
            Some(seq) => Some(EntryId::new(self.ms, seq)),
            None => self.ms.checked_add(1).map(|ms| EntryId::new(ms, 0)),
        }
    }
}

impl fmt::Debug for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryId({}-{})", self.ms, self.seq)
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = StoreError;

    /// Parses `"<ms>-<seq>"`; a bare `"<ms>"` means `"<ms>-0"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StoreError::InvalidId(s.to_string());
        match s.split_once('-') {
            Some((ms, seq)) => Ok(EntryId::new(
                ms.parse().map_err(|_| invalid())?,
                seq.parse().map_err(|_| invalid())?,
            )),
            None => Ok(EntryId::new(s.parse().map_err(|_| invalid())?, 0)),
        }
    }
}

/// How the id of an appended entry is chosen.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum IdRequest {
    /// `*`: wall-clock milliseconds, sequence assigned by the log.
    #[default]
    Auto,
    /// `<ms>-*`: caller picks the millisecond part, log assigns the sequence.
    AutoSequence(u64),
    /// Fully specified by the caller.
    Explicit(EntryId),
}

impl FromStr for IdRequest {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "*" {
            return Ok(IdRequest::Auto);
        }
        if let Some(ms) = s.strip_suffix("-*") {
            return ms
                .parse()
                .map(IdRequest::AutoSequence)
                .map_err(|_| StoreError::InvalidId(s.to_string()));
        }
        s.parse().map(IdRequest::Explicit)
    }
}

/// Field/value pairs of an entry, in insertion order.
///
/// Serializes as a map. When deserializing, numeric and boolean values are
/// accepted and kept in their textual form.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Fields(Vec<(String, String)>);

impl Fields {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, field: impl Into<String>, value: impl Into<String>) {
        self.0.push((field.into(), value.into()));
    }

    /// Builder-style [`Fields::push`].
    pub fn with(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(field, value);
        self
    }

    /// First value stored under `field`.
    pub fn get(&self, field: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Fields {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Fields(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl Serialize for Fields {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (field, value) in &self.0 {
            map.serialize_entry(field, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Fields {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(FieldsVisitor)
    }
}

struct FieldsVisitor;

impl<'de> Visitor<'de> for FieldsVisitor {
    type Value = Fields;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a map of field names to scalar values")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Fields, A::Error> {
        let mut pairs = Vec::with_capacity(access.size_hint().unwrap_or(0));
        while let Some((field, FieldValue(value))) = access.next_entry::<String, FieldValue>()? {
            pairs.push((field, value));
        }
        Ok(Fields(pairs))
    }
}

/// A scalar field value, kept as text.
struct FieldValue(String);

impl<'de> Deserialize<'de> for FieldValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(FieldValueVisitor)
    }
}

struct FieldValueVisitor;

impl<'de> Visitor<'de> for FieldValueVisitor {
    type Value = FieldValue;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a string, number, or boolean")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<FieldValue, E> {
        Ok(FieldValue(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<FieldValue, E> {
        Ok(FieldValue(v))
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<FieldValue, E> {
        Ok(FieldValue(v.to_string()))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<FieldValue, E> {
        Ok(FieldValue(v.to_string()))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<FieldValue, E> {
        Ok(FieldValue(v.to_string()))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<FieldValue, E> {
        Ok(FieldValue(v.to_string()))
    }
}

/// An immutable entry of a stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: EntryId,
    pub fields: Fields,
}

/// Per-stream cursors a blocking read waits past.
pub type CursorSet = BTreeMap<StreamName, Cursor>;

/// Entries returned by a blocking read, per stream, in append order.
pub type ReadBatch = BTreeMap<StreamName, Vec<Entry>>;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_id_parse() {
        assert_eq!("5-3".parse::<EntryId>().unwrap(), EntryId::new(5, 3));
        assert_eq!("5".parse::<EntryId>().unwrap(), EntryId::new(5, 0));
        assert!("5-".parse::<EntryId>().is_err());
        assert!("abc".parse::<EntryId>().is_err());
        assert_eq!(EntryId::new(12, 4).to_string(), "12-4");
    }

    #[test]
    fn test_entry_id_ordering_and_next() {
        assert!(EntryId::new(5, 9) < EntryId::new(6, 0));
        assert!(EntryId::new(5, 1) > EntryId::new(5, 0));
        assert_eq!(EntryId::new(5, 1).next(), Some(EntryId::new(5, 2)));
        assert_eq!(EntryId::new(5, u64::MAX).next(), Some(EntryId::new(6, 0)));
        assert_eq!(EntryId::new(u64::MAX, u64::MAX).next(), None);
    }

    #[test]
    fn test_cursor_uses_coarse_part() {
        assert_eq!("7".parse::<Cursor>().unwrap(), Cursor(7));
        assert_eq!("7-42".parse::<Cursor>().unwrap(), Cursor(7));
        assert!("".parse::<Cursor>().is_err());
        assert!("x-1".parse::<Cursor>().is_err());

        assert!(!EntryId::new(7, 42).is_after(Cursor(7)));
        assert!(EntryId::new(8, 0).is_after(Cursor(7)));
    }

    #[test]
    fn test_id_request_parse() {
        assert_eq!("*".parse::<IdRequest>().unwrap(), IdRequest::Auto);
        assert_eq!("9-*".parse::<IdRequest>().unwrap(), IdRequest::AutoSequence(9));
        assert_eq!(
            "9-1".parse::<IdRequest>().unwrap(),
            IdRequest::Explicit(EntryId::new(9, 1))
        );
        assert!("x-*".parse::<IdRequest>().is_err());
    }

    #[test]
    fn test_fields_keep_order_and_stringify_scalars() {
        let fields: Fields =
            serde_json::from_str(r#"{"z":"last","a":1,"ok":true,"ratio":0.5}"#).unwrap();
        let pairs: Vec<_> = fields.iter().collect();
        assert_eq!(
            pairs,
            vec![("z", "last"), ("a", "1"), ("ok", "true"), ("ratio", "0.5")]
        );

        let json = serde_json::to_string(&fields).unwrap();
        assert_eq!(json, r#"{"z":"last","a":"1","ok":"true","ratio":"0.5"}"#);
    }

    #[test]
    fn test_fields_reject_nested_values() {
        let result: Result<Fields, _> = serde_json::from_str(r#"{"a":{"b":"c"}}"#);
        assert!(result.is_err());
    }
}
