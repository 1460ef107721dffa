//! Columnar query results as handed over by the host.

use crate::error::FrameError;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Value type tag of a field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Number,
    String,
    Time,
    Boolean,
    #[default]
    Other,
}

/// Formatted form of a raw value.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DisplayValue {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,
}

pub type DisplayProcessor = Arc<dyn Fn(&Value) -> DisplayValue + Send + Sync>;

/// One step of a threshold color scale. `value: None` marks the base step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdStep {
    #[serde(default)]
    pub value: Option<f64>,
    pub color: String,
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub values: Vec<Value>,
    #[serde(skip)]
    pub display: Option<DisplayProcessor>,
}

impl fmt::Debug for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Field")
            .field("name", &self.name)
            .field("display_name", &self.display_name)
            .field("field_type", &self.field_type)
            .field("values", &self.values)
            .field("display", &self.display.as_ref().map(|_| "<processor>"))
            .finish()
    }
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType, values: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            display_name: None,
            field_type,
            values,
            display: None,
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    pub fn with_display<F>(mut self, display: F) -> Self
    where
        F: Fn(&Value) -> DisplayValue + Send + Sync + 'static,
    {
        self.display = Some(Arc::new(display));
        self
    }

    /// Attaches a display processor that colors numeric values by threshold.
    pub fn with_thresholds(self, steps: Vec<ThresholdStep>) -> Self {
        self.with_display(move |value| threshold_display(&steps, value))
    }

    /// Key the field contributes to a record.
    pub fn key(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn threshold_display(steps: &[ThresholdStep], value: &Value) -> DisplayValue {
    let number = value.as_f64();
    let mut color = None;
    for step in steps {
        match (step.value, number) {
            (None, _) => color = Some(step.color.clone()),
            (Some(limit), Some(n)) if n >= limit => color = Some(step.color.clone()),
            _ => {}
        }
    }
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    };
    DisplayValue {
        text,
        color,
        ..DisplayValue::default()
    }
}

/// Wire shape of a field; `thresholds` turns into a display processor.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FieldSpec {
    name: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default, rename = "type")]
    field_type: FieldType,
    #[serde(default)]
    values: Vec<Value>,
    #[serde(default)]
    thresholds: Option<Vec<ThresholdStep>>,
}

impl<'de> Deserialize<'de> for Field {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let spec = FieldSpec::deserialize(deserializer)?;
        let mut field = Field::new(spec.name, spec.field_type, spec.values);
        field.display_name = spec.display_name;
        if let Some(steps) = spec.thresholds {
            field = field.with_thresholds(steps);
        }
        Ok(field)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataFrame {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ref_id: Option<String>,
    pub fields: Vec<Field>,
}

impl DataFrame {
    /// Builds a frame, rejecting fields of unequal length.
    pub fn new(fields: Vec<Field>) -> Result<Self, FrameError> {
        validate_lengths(&fields)?;
        Ok(Self {
            name: None,
            ref_id: None,
            fields,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_ref_id(mut self, ref_id: impl Into<String>) -> Self {
        self.ref_id = Some(ref_id.into());
        self
    }

    /// Row count; zero for a frame without fields.
    pub fn len(&self) -> usize {
        self.fields.first().map(Field::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn validate_lengths(fields: &[Field]) -> Result<(), FrameError> {
    let Some(first) = fields.first() else {
        return Ok(());
    };
    let expected = first.len();
    for field in &fields[1..] {
        if field.len() != expected {
            return Err(FrameError::LengthMismatch {
                field: field.name.clone(),
                expected,
                actual: field.len(),
            });
        }
    }
    Ok(())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FrameSpec {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    ref_id: Option<String>,
    #[serde(default)]
    fields: Vec<Field>,
}

impl<'de> Deserialize<'de> for DataFrame {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let spec = FrameSpec::deserialize(deserializer)?;
        validate_lengths(&spec.fields).map_err(serde::de::Error::custom)?;
        Ok(DataFrame {
            name: spec.name,
            ref_id: spec.ref_id,
            fields: spec.fields,
        })
    }
}

/// Full query result set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PanelData {
    #[serde(default)]
    pub series: Vec<DataFrame>,
}

impl PanelData {
    pub fn new(series: Vec<DataFrame>) -> Self {
        Self { series }
    }
}
