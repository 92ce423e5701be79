//! Typed description of the controllable units an agent exposes.
//!
//! Agents describe their elements as loosely typed JSON. [`parse_elements`] is the
//! single boundary where that description is validated and converted; everything
//! past it works on [`Element`].

use std::collections::HashSet;

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use serde_json::{Map, Value};

use crate::SchemaError;

/// Granularity of a slider.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Step {
    /// Values move in increments of this size.
    Fixed(f64),
    /// Any value in range is allowed.
    #[default]
    Continuous,
}

impl Serialize for Step {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Fixed(step) => serializer.serialize_f64(*step),
            Self::Continuous => serializer.serialize_str("continuous"),
        }
    }
}

impl<'de> Deserialize<'de> for Step {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(f64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(step) if step == 0.0 => Ok(Self::Continuous),
            Raw::Number(step) => Ok(Self::Fixed(step)),
            Raw::Text(text) if is_continuous_marker(&text) => Ok(Self::Continuous),
            Raw::Text(text) => Err(de::Error::custom(format!("invalid step {text:?}"))),
        }
    }
}

fn is_continuous_marker(text: &str) -> bool {
    matches!(text, "continuous" | "any")
}

/// A controllable unit exposed by an agent.
///
/// The derived `Deserialize` is strict and meant for broker output. Untrusted
/// agent input goes through [`parse_elements`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Element {
    /// Fire-and-acknowledge action.
    Action {
        name: String,
        #[serde(alias = "disp")]
        label: String,
    },
    /// Numeric value with a range and step.
    Slider {
        name: String,
        #[serde(alias = "disp")]
        label: String,
        min: f64,
        max: f64,
        #[serde(default)]
        step: Step,
        #[serde(alias = "val")]
        value: f64,
    },
}

impl Element {
    /// Create an action element.
    #[must_use]
    pub fn action(name: impl Into<String>, label: impl Into<String>) -> Self {
        Self::Action {
            name: name.into(),
            label: label.into(),
        }
    }

    /// Create a slider element.
    #[must_use]
    pub fn slider(
        name: impl Into<String>,
        label: impl Into<String>,
        min: f64,
        max: f64,
        step: Step,
        value: f64,
    ) -> Self {
        Self::Slider {
            name: name.into(),
            label: label.into(),
            min,
            max,
            step,
            value,
        }
    }

    /// Element name, unique within one agent.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Action { name, .. } | Self::Slider { name, .. } => name,
        }
    }

    /// Human-readable label.
    #[must_use]
    pub fn label(&self) -> &str {
        match self {
            Self::Action { label, .. } | Self::Slider { label, .. } => label,
        }
    }

    /// Current value, for sliders.
    #[must_use]
    pub const fn slider_value(&self) -> Option<f64> {
        match self {
            Self::Slider { value, .. } => Some(*value),
            Self::Action { .. } => None,
        }
    }

    /// Overwrite a slider's current value. Returns `false` for actions.
    ///
    /// No clamping to `[min, max]` happens here; range is the agent's business.
    pub fn set_value(&mut self, new_value: f64) -> bool {
        match self {
            Self::Slider { value, .. } => {
                *value = new_value;
                true
            }
            Self::Action { .. } => false,
        }
    }

    /// Parse the untyped description at position `index` of an element list.
    fn parse_at(index: usize, raw: &Value) -> Result<Self, SchemaError> {
        let obj = raw.as_object().ok_or(SchemaError::NotAnObject { index })?;

        let kind = string_field(obj, index, "type", &["type"])?;
        let name = string_field(obj, index, "name", &["name"])?;
        if name.is_empty() {
            return Err(SchemaError::EmptyName { index });
        }
        let label = string_field(obj, index, "label", &["label", "disp"])?;

        match kind.as_str() {
            "action" => Ok(Self::Action { name, label }),
            "slider" => Ok(Self::Slider {
                name,
                label,
                min: number_field(obj, index, "min", &["min"])?,
                max: number_field(obj, index, "max", &["max"])?,
                step: step_field(obj, index)?,
                value: number_field(obj, index, "value", &["value", "val"])?,
            }),
            _ => Err(SchemaError::UnknownType { index, kind }),
        }
    }
}

/// Parse an agent's element list, preserving declaration order.
///
/// # Errors
/// Fails on the first invalid element or on a repeated name.
pub fn parse_elements(raw: &Value) -> Result<Vec<Element>, SchemaError> {
    let list = raw.as_array().ok_or(SchemaError::NotAList)?;

    let mut seen = HashSet::with_capacity(list.len());
    let mut elements = Vec::with_capacity(list.len());
    for (index, item) in list.iter().enumerate() {
        let element = Element::parse_at(index, item)?;
        if !seen.insert(element.name().to_owned()) {
            return Err(SchemaError::DuplicateName(element.name().to_owned()));
        }
        elements.push(element);
    }
    Ok(elements)
}

/// Coerce a JSON number or decimal string to a finite `f64`.
#[must_use]
pub fn coerce_number(raw: &Value) -> Option<f64> {
    let number = match raw {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    number.is_finite().then_some(number)
}

/// First non-null value among `keys` (the canonical key first, then aliases).
fn lookup<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| obj.get(*key))
        .find(|v| !v.is_null())
}

fn string_field(
    obj: &Map<String, Value>,
    index: usize,
    field: &'static str,
    keys: &[&str],
) -> Result<String, SchemaError> {
    match lookup(obj, keys) {
        None => Err(SchemaError::MissingField { index, field }),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(SchemaError::NotAString { index, field }),
    }
}

fn number_field(
    obj: &Map<String, Value>,
    index: usize,
    field: &'static str,
    keys: &[&str],
) -> Result<f64, SchemaError> {
    let raw = lookup(obj, keys).ok_or(SchemaError::MissingField { index, field })?;
    coerce_number(raw).ok_or(SchemaError::NotNumeric { index, field })
}

fn step_field(obj: &Map<String, Value>, index: usize) -> Result<Step, SchemaError> {
    let Some(raw) = lookup(obj, &["step"]) else {
        return Ok(Step::Continuous);
    };
    if raw.as_str().is_some_and(is_continuous_marker) {
        return Ok(Step::Continuous);
    }

    let step = coerce_number(raw).ok_or(SchemaError::NotNumeric { index, field: "step" })?;
    if step < 0.0 {
        Err(SchemaError::NegativeStep { index })
    } else if step == 0.0 {
        Ok(Step::Continuous)
    } else {
        Ok(Step::Fixed(step))
    }
}
