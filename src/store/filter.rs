//! Document filters, updates and sort options.
//!
//! Documents are JSON objects; fields are addressed by dotted paths such as
//! `processors_data.categorization.is_processing`. Semantics follow the
//! usual document-store conventions: `Eq(path, null)` also matches a
//! missing field and `Ne` matches whenever `Eq` does not.

use std::cmp::Ordering;

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};

/// A predicate over a JSON document.
#[derive(Debug, Clone)]
pub enum Filter {
    /// Matches every document
    All,
    Eq(String, Value),
    Ne(String, Value),
    In(String, Vec<Value>),
    Exists(String, bool),
    Lt(String, Value),
    Lte(String, Value),
    Gt(String, Value),
    Gte(String, Value),
    /// String field matching a regular expression
    Matches(String, Regex),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn eq(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq(path.into(), value.into())
    }

    pub fn ne(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Ne(path.into(), value.into())
    }

    /// Field is exactly `true`.
    pub fn is_true(path: impl Into<String>) -> Self {
        Self::Eq(path.into(), Value::Bool(true))
    }

    /// Field is `false`, null or missing.
    pub fn not_true(path: impl Into<String>) -> Self {
        Self::Ne(path.into(), Value::Bool(true))
    }

    /// Field is missing, null or the empty string.
    pub fn missing_or_empty(path: impl Into<String>) -> Self {
        let path = path.into();
        Self::Or(vec![
            Self::Exists(path.clone(), false),
            Self::Eq(path.clone(), Value::Null),
            Self::Eq(path, Value::String(String::new())),
        ])
    }

    /// Field is missing, null, or a time at or before `at`.
    pub fn unset_or_before(path: impl Into<String>, at: DateTime<Utc>) -> Self {
        let path = path.into();
        Self::Or(vec![
            Self::Eq(path.clone(), Value::Null),
            Self::Lte(path, time_value(at)),
        ])
    }

    pub fn lt(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Lt(path.into(), value.into())
    }

    pub fn lt_time(path: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self::Lt(path.into(), time_value(at))
    }

    pub fn and(filters: impl IntoIterator<Item = Filter>) -> Self {
        Self::And(filters.into_iter().collect())
    }

    pub fn or(filters: impl IntoIterator<Item = Filter>) -> Self {
        Self::Or(filters.into_iter().collect())
    }

    /// Conjunction with another filter, flattening nested `And`s.
    pub fn and_also(self, other: Filter) -> Self {
        match (self, other) {
            (Self::All, f) | (f, Self::All) => f,
            (Self::And(mut a), Self::And(b)) => {
                a.extend(b);
                Self::And(a)
            }
            (Self::And(mut a), f) => {
                a.push(f);
                Self::And(a)
            }
            (f, Self::And(mut b)) => {
                b.insert(0, f);
                Self::And(b)
            }
            (a, b) => Self::And(vec![a, b]),
        }
    }

    /// Evaluate against a document.
    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Self::All => true,
            Self::Eq(path, expected) => field_equals(lookup(doc, path), expected),
            Self::Ne(path, expected) => !field_equals(lookup(doc, path), expected),
            Self::In(path, options) => {
                let actual = lookup(doc, path);
                options.iter().any(|o| field_equals(actual, o))
            }
            Self::Exists(path, wanted) => lookup(doc, path).is_some() == *wanted,
            Self::Lt(path, v) => compare_field(doc, path, v) == Some(Ordering::Less),
            Self::Lte(path, v) => matches!(
                compare_field(doc, path, v),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Self::Gt(path, v) => compare_field(doc, path, v) == Some(Ordering::Greater),
            Self::Gte(path, v) => matches!(
                compare_field(doc, path, v),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Self::Matches(path, re) => lookup(doc, path)
                .and_then(Value::as_str)
                .map(|s| re.is_match(s))
                .unwrap_or(false),
            Self::And(filters) => filters.iter().all(|f| f.matches(doc)),
            Self::Or(filters) => filters.iter().any(|f| f.matches(doc)),
            Self::Not(inner) => !inner.matches(doc),
        }
    }
}

/// Serialize a timestamp the same way chrono's serde impl does.
pub fn time_value(at: DateTime<Utc>) -> Value {
    Value::String(at.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

/// Resolve a dotted path inside a document.
pub fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |current, key| current.get(key))
}

fn field_equals(actual: Option<&Value>, expected: &Value) -> bool {
    match (actual, expected) {
        (None, Value::Null) => true,
        (None, _) => false,
        (Some(a), e) => a == e || compare_values(a, e) == Some(Ordering::Equal),
    }
}

fn compare_field(doc: &Value, path: &str, expected: &Value) -> Option<Ordering> {
    lookup(doc, path).and_then(|actual| compare_values(actual, expected))
}

/// Order two JSON scalars; timestamps compare as instants.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => {
            match (DateTime::parse_from_rfc3339(x), DateTime::parse_from_rfc3339(y)) {
                (Ok(dx), Ok(dy)) => Some(dx.cmp(&dy)),
                _ => Some(x.cmp(y)),
            }
        }
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

/// A set of field mutations applied atomically to one document.
#[derive(Debug, Clone, Default)]
pub struct Update {
    set: Vec<(String, Value)>,
    unset: Vec<String>,
    inc: Vec<(String, i64)>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set.push((path.into(), value.into()));
        self
    }

    pub fn set_time(self, path: impl Into<String>, at: DateTime<Utc>) -> Self {
        self.set(path, time_value(at))
    }

    /// Set a field to any serializable value.
    pub fn set_json<T: Serialize>(
        self,
        path: impl Into<String>,
        value: &T,
    ) -> Result<Self, serde_json::Error> {
        let value = serde_json::to_value(value)?;
        Ok(self.set(path, value))
    }

    pub fn unset(mut self, path: impl Into<String>) -> Self {
        self.unset.push(path.into());
        self
    }

    pub fn inc(mut self, path: impl Into<String>, by: i64) -> Self {
        self.inc.push((path.into(), by));
        self
    }

    /// Stamp `updated_at`.
    pub fn touch(self, at: DateTime<Utc>) -> Self {
        self.set_time("updated_at", at)
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.unset.is_empty() && self.inc.is_empty()
    }

    /// Apply the mutations to a document in place.
    pub fn apply(&self, doc: &mut Value) {
        for (path, value) in &self.set {
            if let Some(slot) = slot_mut(doc, path) {
                *slot = value.clone();
            }
        }
        for path in &self.unset {
            remove_path(doc, path);
        }
        for (path, by) in &self.inc {
            if let Some(slot) = slot_mut(doc, path) {
                let current = slot.as_i64().unwrap_or(0);
                *slot = Value::from(current + by);
            }
        }
    }
}

/// Mutable slot for a dotted path, creating intermediate objects.
fn slot_mut<'a>(doc: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    let mut current = doc;
    for key in path.split('.') {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        current = current
            .as_object_mut()?
            .entry(key.to_string())
            .or_insert(Value::Null);
    }
    Some(current)
}

fn remove_path(doc: &mut Value, path: &str) {
    let (parent, leaf) = match path.rsplit_once('.') {
        Some((parent, leaf)) => (parent, leaf),
        None => ("", path),
    };
    let container = if parent.is_empty() {
        Some(doc)
    } else {
        parent
            .split('.')
            .try_fold(doc, |current, key| current.get_mut(key))
    };
    if let Some(Value::Object(map)) = container {
        map.remove(leaf);
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Sort, skip and limit applied after filtering.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub sort: Vec<(String, SortOrder)>,
    pub skip: usize,
    pub limit: Option<usize>,
}

impl FindOptions {
    pub fn sort_by(mut self, path: impl Into<String>, order: SortOrder) -> Self {
        self.sort.push((path.into(), order));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    /// Sort, skip and truncate a list of documents.
    pub fn apply(&self, docs: &mut Vec<Value>) {
        if !self.sort.is_empty() {
            docs.sort_by(|a, b| {
                for (path, order) in &self.sort {
                    let ord = match (lookup(a, path), lookup(b, path)) {
                        (None, None) => Ordering::Equal,
                        (None, Some(_)) => Ordering::Less,
                        (Some(_), None) => Ordering::Greater,
                        (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
                    };
                    let ord = match order {
                        SortOrder::Asc => ord,
                        SortOrder::Desc => ord.reverse(),
                    };
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            });
        }
        if self.skip > 0 {
            docs.drain(..self.skip.min(docs.len()));
        }
        if let Some(limit) = self.limit {
            docs.truncate(limit);
        }
    }
}
