//! Label and field selectors evaluated locally by listers.
//!
//! Grammar follows the usual API server conventions:
//! `a=b`, `a==b`, `a!=b`, `a`, `!a`, `a in (x,y)`, `a notin (x,y)`; commas AND terms.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Object, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    In(String, BTreeSet<String>),
    NotIn(String, BTreeSet<String>),
    Exists(String),
    DoesNotExist(String),
}

impl Requirement {
    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        let get = |k: &str| labels.and_then(|l| l.get(k));
        match self {
            Requirement::Equals(k, v) => get(k) == Some(v),
            Requirement::NotEquals(k, v) => get(k) != Some(v),
            Requirement::In(k, set) => get(k).is_some_and(|v| set.contains(v)),
            Requirement::NotIn(k, set) => get(k).map_or(true, |v| !set.contains(v)),
            Requirement::Exists(k) => get(k).is_some(),
            Requirement::DoesNotExist(k) => get(k).is_none(),
        }
    }

    fn parse(term: &str) -> Result<Self> {
        let invalid = || Error::InvalidSelector(term.to_string());
        if let Some((lhs, rest)) = term.split_once('(') {
            let values = rest.strip_suffix(')').ok_or_else(invalid)?;
            let set: BTreeSet<String> = values
                .split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .collect();
            let (key, op) = lhs.trim().rsplit_once(char::is_whitespace).ok_or_else(invalid)?;
            return match op {
                "in" => Ok(Requirement::In(valid_key(key.trim(), term)?, set)),
                "notin" => Ok(Requirement::NotIn(valid_key(key.trim(), term)?, set)),
                _ => Err(invalid()),
            };
        }
        if let Some(key) = term.strip_prefix('!') {
            return Ok(Requirement::DoesNotExist(valid_key(key.trim(), term)?));
        }
        if let Some((k, v)) = term.split_once("!=") {
            return Ok(Requirement::NotEquals(valid_key(k.trim(), term)?, v.trim().to_string()));
        }
        if let Some((k, v)) = term.split_once("==").or_else(|| term.split_once('=')) {
            return Ok(Requirement::Equals(valid_key(k.trim(), term)?, v.trim().to_string()));
        }
        Ok(Requirement::Exists(valid_key(term, term)?))
    }
}

fn valid_key(key: &str, term: &str) -> Result<String> {
    if key.is_empty() || key.contains(char::is_whitespace) {
        return Err(Error::InvalidSelector(term.to_string()));
    }
    Ok(key.to_string())
}

/// Split on commas that are not inside `( … )`.
fn split_terms(s: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                out.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&s[start..]);
    out.into_iter().map(str::trim).filter(|t| !t.is_empty()).collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn is_everything(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}

impl FromStr for LabelSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let requirements = split_terms(s).into_iter().map(Requirement::parse).collect::<Result<_>>()?;
        Ok(Self { requirements })
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |set: &BTreeSet<String>| set.iter().cloned().collect::<Vec<_>>().join(",");
        let parts: Vec<String> = self
            .requirements
            .iter()
            .map(|r| match r {
                Requirement::Equals(k, v) => format!("{}={}", k, v),
                Requirement::NotEquals(k, v) => format!("{}!={}", k, v),
                Requirement::In(k, set) => format!("{} in ({})", k, join(set)),
                Requirement::NotIn(k, set) => format!("{} notin ({})", k, join(set)),
                Requirement::Exists(k) => k.clone(),
                Requirement::DoesNotExist(k) => format!("!{}", k),
            })
            .collect();
        f.write_str(&parts.join(","))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Name,
    Namespace,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FieldRequirement {
    field: Field,
    value: String,
    negate: bool,
}

/// Field selector over the generic metadata fields every object carries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSelector {
    requirements: Vec<FieldRequirement>,
}

impl FieldSelector {
    pub fn is_everything(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches<K: Object>(&self, obj: &K) -> bool {
        self.requirements.iter().all(|r| {
            let actual = match r.field {
                Field::Name => obj.name().unwrap_or(""),
                Field::Namespace => obj.namespace().unwrap_or(""),
            };
            (actual == r.value) != r.negate
        })
    }
}

impl FromStr for FieldSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut requirements = Vec::new();
        for term in split_terms(s) {
            let (field, value, negate) = if let Some((f, v)) = term.split_once("!=") {
                (f, v, true)
            } else if let Some((f, v)) = term.split_once("==").or_else(|| term.split_once('=')) {
                (f, v, false)
            } else {
                return Err(Error::InvalidSelector(term.to_string()));
            };
            let field = match field.trim() {
                "metadata.name" => Field::Name,
                "metadata.namespace" => Field::Namespace,
                _ => return Err(Error::InvalidSelector(format!("unsupported field in {}", term))),
            };
            requirements.push(FieldRequirement { field, value: value.trim().to_string(), negate });
        }
        Ok(Self { requirements })
    }
}

/// Combined label + field predicate used by `list` queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    pub labels: LabelSelector,
    pub fields: FieldSelector,
}

impl Selector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn parse(labels: &str, fields: &str) -> Result<Self> {
        Ok(Self { labels: labels.parse()?, fields: fields.parse()? })
    }

    pub fn from_labels(labels: &str) -> Result<Self> {
        Self::parse(labels, "")
    }

    pub fn is_everything(&self) -> bool {
        self.labels.is_everything() && self.fields.is_everything()
    }

    pub fn matches<K: Object>(&self, obj: &K) -> bool {
        self.labels.matches(obj.labels()) && self.fields.matches(obj)
    }
}
