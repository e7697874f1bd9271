//! Structured messages emitted by a sampling run.
//!
//! A worker writes loosely-typed [`WriterRecord`]s (a topic plus a row of
//! numbers or strings). [`crate::protocol::parser::WriterParser`] turns them
//! into [`WriterMessage`]s, which is what a stored fit contains.

use serde::{Deserialize, Serialize};

/// Logical output channel of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Topic {
    /// Free-text log lines (progress, warnings, rejection notices).
    Logger,
    /// Initial values of the parameters on the unconstrained scale.
    Initialization,
    /// Parameter names, then one row per draw.
    Sample,
    /// Diagnostic names, then one row per draw.
    Diagnostic,
}

impl Topic {
    pub fn as_str(self) -> &'static str {
        match self {
            Topic::Logger => "LOGGER",
            Topic::Initialization => "INITIALIZATION",
            Topic::Sample => "SAMPLE",
            Topic::Diagnostic => "DIAGNOSTIC",
        }
    }
}

/// One value in a raw worker row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Number(f64),
    Text(String),
}

impl RawValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            RawValue::Number(n) => Some(*n),
            RawValue::Text(_) => None,
        }
    }

    /// Render as text; numbers use their shortest round-tripping form.
    pub fn to_text(&self) -> String {
        match self {
            RawValue::Number(n) => n.to_string(),
            RawValue::Text(s) => s.clone(),
        }
    }
}

impl From<f64> for RawValue {
    fn from(value: f64) -> Self {
        RawValue::Number(value)
    }
}

impl From<&str> for RawValue {
    fn from(value: &str) -> Self {
        RawValue::Text(value.to_string())
    }
}

impl From<String> for RawValue {
    fn from(value: String) -> Self {
        RawValue::Text(value)
    }
}

/// A row as the worker wrote it, before header reconstruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriterRecord {
    pub topic: Topic,
    pub values: Vec<RawValue>,
}

impl WriterRecord {
    pub fn new(topic: Topic, values: Vec<RawValue>) -> Self {
        Self { topic, values }
    }

    pub fn text(topic: Topic, line: impl Into<String>) -> Self {
        Self::new(topic, vec![RawValue::Text(line.into())])
    }

    pub fn numbers(topic: Topic, values: impl IntoIterator<Item = f64>) -> Self {
        Self::new(topic, values.into_iter().map(RawValue::Number).collect())
    }

    pub fn names<S: AsRef<str>>(topic: Topic, names: impl IntoIterator<Item = S>) -> Self {
        Self::new(
            topic,
            names
                .into_iter()
                .map(|n| RawValue::Text(n.as_ref().to_string()))
                .collect(),
        )
    }

    /// True when every value is numeric (and there is at least one).
    pub fn is_numeric(&self) -> bool {
        !self.values.is_empty() && self.values.iter().all(|v| matches!(v, RawValue::Number(_)))
    }

    /// True when the row carries nothing worth keeping.
    pub fn is_blank(&self) -> bool {
        self.values.iter().all(|v| match v {
            RawValue::Text(s) => s.trim().is_empty(),
            RawValue::Number(_) => false,
        })
    }
}

/// Payload of a feature.
///
/// Decoding tries the numeric form first and falls back to strings, so a
/// body is never classified by looking at its content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    DoubleList(Vec<f64>),
    StringList(Vec<String>),
}

/// A (possibly named) value inside a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub value: FeatureValue,
}

impl Feature {
    pub fn named(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value: FeatureValue::DoubleList(vec![value]),
        }
    }

    pub fn double(value: f64) -> Self {
        Self {
            name: String::new(),
            value: FeatureValue::DoubleList(vec![value]),
        }
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self {
            name: String::new(),
            value: FeatureValue::StringList(vec![value.into()]),
        }
    }
}

/// A decoded message as stored in a fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriterMessage {
    pub topic: Topic,
    pub feature: Vec<Feature>,
}

impl WriterMessage {
    pub fn new(topic: Topic, feature: Vec<Feature>) -> Self {
        Self { topic, feature }
    }

    /// Message whose features are plain strings.
    pub fn strings<S: Into<String>>(topic: Topic, lines: impl IntoIterator<Item = S>) -> Self {
        Self::new(topic, lines.into_iter().map(Feature::string).collect())
    }

    /// All string values in order.
    pub fn texts(&self) -> impl Iterator<Item = &str> {
        self.feature.iter().flat_map(|f| match &f.value {
            FeatureValue::StringList(values) => values.iter().map(String::as_str).collect(),
            FeatureValue::DoubleList(_) => Vec::new(),
        })
    }

    /// First numeric value of the feature called `name`.
    pub fn value(&self, name: &str) -> Option<f64> {
        self.feature
            .iter()
            .find(|f| f.name == name)
            .and_then(|f| match &f.value {
                FeatureValue::DoubleList(values) => values.first().copied(),
                FeatureValue::StringList(_) => None,
            })
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.feature.iter().any(|f| f.name == name)
    }
}
