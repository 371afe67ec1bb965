//! The structured document matcher shared by queries and subscriptions.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A structured matcher over document fields: `{ field -> condition }`.
///
/// A document matches iff every field's condition evaluates to `true`
/// against the document's value for that field (or `Value::Null` if the
/// field is absent). Fields are kept in a [`BTreeMap`] so two predicates
/// built from the same field/condition set always serialize identically,
/// which [`Predicate::canonical_key`] relies on to deduplicate subscriptions.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(transparent)]
pub struct Predicate(BTreeMap<String, Condition>);

impl Predicate {
    /// Builds a predicate from an iterator of `(field, condition)` pairs.
    pub fn new(fields: impl IntoIterator<Item = (String, Condition)>) -> Self {
        Self(fields.into_iter().collect())
    }

    /// Parses a predicate out of an arbitrary JSON query object, e.g.
    /// `{"name": {"$regex": "^John"}}` or `{"age": 30}`.
    pub fn from_value(value: &Value) -> Result<Self, String> {
        let obj = value
            .as_object()
            .ok_or_else(|| "predicate must be a JSON object".to_string())?;
        let mut fields = BTreeMap::new();
        for (field, cond) in obj {
            fields.insert(field.clone(), Condition::from_value(cond));
        }
        Ok(Self(fields))
    }

    /// Returns `true` iff `doc` matches every field condition.
    pub fn matches(&self, doc: &Value) -> bool {
        self.0
            .iter()
            .all(|(field, cond)| cond.evaluate(doc.get(field).unwrap_or(&Value::Null)))
    }

    /// A stable string key that two structurally identical predicates always
    /// produce the same value for, used to deduplicate subscriptions.
    pub fn canonical_key(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// An empty predicate, matching every document.
    pub fn matches_all() -> Self {
        Self(BTreeMap::new())
    }
}

/// A single field's matcher: either a literal (strict equality) or an
/// operator map such as `{"$gte": 18}`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(untagged)]
pub enum Condition {
    /// Bare value, matched with strict equality.
    Literal(OrdValue),
    /// `{ "$op": operand, ... }` — every listed operator must match.
    Ops(BTreeMap<String, OrdValue>),
}

impl Condition {
    fn from_value(value: &Value) -> Self {
        if let Some(obj) = value.as_object() {
            if obj.keys().all(|k| k.starts_with('$')) && !obj.is_empty() {
                return Condition::Ops(
                    obj.iter()
                        .map(|(k, v)| (k.clone(), OrdValue(v.clone())))
                        .collect(),
                );
            }
        }
        Condition::Literal(OrdValue(value.clone()))
    }

    /// Evaluates this condition against a document's field value.
    ///
    /// A missing field surfaces here as `Value::Null`; per the spec, only
    /// `$ne` and `$nin` can match against it (and do so trivially, since
    /// `null` is never a member of a real operand unless explicitly listed).
    /// Unknown operators make the condition fail rather than error, so a
    /// single malformed clause in a query only drops that clause's matches.
    pub fn evaluate(&self, value: &Value) -> bool {
        match self {
            Condition::Literal(expected) => value == &expected.0,
            Condition::Ops(ops) => ops.iter().all(|(op, operand)| {
                eval_op(op, value, &operand.0).unwrap_or(false)
            }),
        }
    }
}

fn eval_op(op: &str, value: &Value, operand: &Value) -> Option<bool> {
    match op {
        "$eq" => Some(value == operand),
        "$ne" => Some(value != operand),
        "$lt" => compare(value, operand).map(|o| o == Ordering::Less),
        "$lte" => compare(value, operand).map(|o| o != Ordering::Greater),
        "$gt" => compare(value, operand).map(|o| o == Ordering::Greater),
        "$gte" => compare(value, operand).map(|o| o != Ordering::Less),
        "$in" => Some(operand.as_array()?.iter().any(|v| v == value)),
        "$nin" => Some(!operand.as_array()?.iter().any(|v| v == value)),
        "$regex" => {
            let re = regex::Regex::new(operand.as_str()?).ok()?;
            Some(re.is_match(value.as_str()?))
        }
        "$sw" => Some(value.as_str()?.starts_with(operand.as_str()?)),
        _ => None,
    }
}

/// Numeric comparison first, falling back to lexicographic string
/// comparison, mirroring MongoDB-like matcher semantics.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    if let (Some(a), Some(b)) = (a.as_f64(), b.as_f64()) {
        return a.partial_cmp(&b);
    }
    if let (Some(a), Some(b)) = (a.as_str(), b.as_str()) {
        return Some(a.cmp(b));
    }
    None
}

/// A [`Value`] wrapper with a total order, so predicates (which embed
/// operands) can live in a [`std::collections::BTreeMap`] key and be sorted
/// deterministically for [`Predicate::canonical_key`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct OrdValue(pub Value);

impl PartialOrd for OrdValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrdValue {
    fn cmp(&self, other: &Self) -> Ordering {
        // Values are only ever compared by their canonical JSON text; this
        // never needs to be fast, just total and deterministic.
        serde_json::to_string(&self.0)
            .unwrap_or_default()
            .cmp(&serde_json::to_string(&other.0).unwrap_or_default())
    }
}
