//! Label selectors with Kubernetes semantics.
//!
//! [`LabelSelector`] is the declarative form stored in a job spec. It is compiled into a
//! [`Selector`] once per reconciliation cycle; compilation is where invalid operators, keys
//! and values are rejected, so a job with a broken selector can be reported as failed instead
//! of silently matching nothing.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::ModelError;

const MAX_NAME_LEN: usize = 63;
const MAX_PREFIX_LEN: usize = 253;

/// Declarative pod selector: `matchLabels` and `matchExpressions` are ANDed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

/// One `matchExpressions` entry; `operator` is validated on compile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelectorRequirement {
    pub key: String,
    pub operator: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// A single compiled requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    key: String,
    operator: SelectorOperator,
    values: BTreeSet<String>,
}

/// Compiled selector. An empty selector matches every pod.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    pub fn match_labels<K, V>(labels: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            match_labels: labels
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            match_expressions: Vec::new(),
        }
    }

    pub fn with_expression(
        mut self,
        key: impl Into<String>,
        operator: impl Into<String>,
        values: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.match_expressions.push(LabelSelectorRequirement {
            key: key.into(),
            operator: operator.into(),
            values: values.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Validate and compile into a matchable [`Selector`].
    pub fn compile(&self) -> Result<Selector, ModelError> {
        let mut requirements = Vec::with_capacity(self.match_labels.len() + self.match_expressions.len());

        for (key, value) in &self.match_labels {
            validate_key(key)?;
            validate_value(value)?;
            requirements.push(Requirement {
                key: key.clone(),
                operator: SelectorOperator::In,
                values: BTreeSet::from([value.clone()]),
            });
        }

        for expr in &self.match_expressions {
            validate_key(&expr.key)?;
            let operator = match expr.operator.as_str() {
                "In" => SelectorOperator::In,
                "NotIn" => SelectorOperator::NotIn,
                "Exists" => SelectorOperator::Exists,
                "DoesNotExist" => SelectorOperator::DoesNotExist,
                other => {
                    return Err(ModelError::InvalidSelector(format!(
                        "{other:?} is not a valid label selector operator"
                    )));
                }
            };
            match operator {
                SelectorOperator::In | SelectorOperator::NotIn if expr.values.is_empty() => {
                    return Err(ModelError::InvalidSelector(format!(
                        "values: must be non-empty for operator {} on key {:?}",
                        expr.operator, expr.key
                    )));
                }
                SelectorOperator::Exists | SelectorOperator::DoesNotExist
                    if !expr.values.is_empty() =>
                {
                    return Err(ModelError::InvalidSelector(format!(
                        "values: must be empty for operator {} on key {:?}",
                        expr.operator, expr.key
                    )));
                }
                _ => {}
            }
            for value in &expr.values {
                validate_value(value)?;
            }
            requirements.push(Requirement {
                key: expr.key.clone(),
                operator,
                values: expr.values.iter().cloned().collect(),
            });
        }

        Ok(Selector { requirements })
    }
}

impl Requirement {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            SelectorOperator::In => value.is_some_and(|v| self.values.contains(v)),
            SelectorOperator::NotIn => value.is_none_or(|v| !self.values.contains(v)),
            SelectorOperator::Exists => value.is_some(),
            SelectorOperator::DoesNotExist => value.is_none(),
        }
    }
}

impl Selector {
    /// Selector that matches every label set.
    pub fn everything() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}

fn validate_key(key: &str) -> Result<(), ModelError> {
    let (prefix, name) = match key.split_once('/') {
        Some((prefix, name)) => (Some(prefix), name),
        None => (None, key),
    };
    if let Some(prefix) = prefix
        && !is_dns_subdomain(prefix)
    {
        return Err(ModelError::InvalidSelector(format!(
            "key {key:?}: prefix must be a DNS subdomain of at most {MAX_PREFIX_LEN} characters"
        )));
    }
    if name.is_empty() || !is_label_token(name) {
        return Err(ModelError::InvalidSelector(format!(
            "key {key:?}: name must be at most {MAX_NAME_LEN} alphanumeric characters, '-', '_' or '.', starting and ending with an alphanumeric character"
        )));
    }
    Ok(())
}

fn validate_value(value: &str) -> Result<(), ModelError> {
    if value.is_empty() || is_label_token(value) {
        return Ok(());
    }
    Err(ModelError::InvalidSelector(format!(
        "value {value:?}: must be at most {MAX_NAME_LEN} alphanumeric characters, '-', '_' or '.', starting and ending with an alphanumeric character"
    )))
}

fn is_label_token(s: &str) -> bool {
    let bytes = s.as_bytes();
    s.len() <= MAX_NAME_LEN
        && bytes.first().is_some_and(u8::is_ascii_alphanumeric)
        && bytes.last().is_some_and(u8::is_ascii_alphanumeric)
        && bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

fn is_dns_subdomain(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= MAX_PREFIX_LEN
        && s.split('.').all(|part| {
            let bytes = part.as_bytes();
            !part.is_empty()
                && part.len() <= MAX_NAME_LEN
                && bytes.first().is_some_and(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
                && bytes.last().is_some_and(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
                && bytes
                    .iter()
                    .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
        })
}
