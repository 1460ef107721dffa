//! Row projection: columnar frames to flat per-row records.

use crate::frame::{DataFrame, Field};
use crate::options::RenderMode;
use serde::Serialize;
use serde_json::{Map, Value};

/// One table row keyed by field, plus the status color when configured.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Record {
    #[serde(flatten)]
    pub fields: Map<String, Value>,
    #[serde(rename = "statusColor", skip_serializing_if = "Option::is_none")]
    pub status_color: Option<String>,
}

impl Record {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn to_value(&self) -> Value {
        let mut map = self.fields.clone();
        if let Some(color) = &self.status_color {
            map.insert("statusColor".to_string(), Value::String(color.clone()));
        }
        Value::Object(map)
    }
}

fn is_status_field(field: &Field, status_field: Option<&str>) -> bool {
    match status_field {
        Some(name) if !name.is_empty() => field.name == name || field.key() == name,
        _ => false,
    }
}

/// Projects every row of `frame` into a record, in row order.
pub fn project_rows(frame: &DataFrame, status_field: Option<&str>) -> Vec<Record> {
    let rows = frame.len();
    let mut records: Vec<Record> = (0..rows).map(|_| Record::default()).collect();

    for field in &frame.fields {
        let colors_status = is_status_field(field, status_field);
        for (record, value) in records.iter_mut().zip(&field.values) {
            record.fields.insert(field.key().to_string(), value.clone());

            // first status field to assign a color keeps it
            if colors_status && record.status_color.is_none() {
                if let Some(display) = &field.display {
                    record.status_color = display(value).color;
                }
            }
        }
    }

    records
}

/// Projects every frame of the result set, one inner vector per frame.
pub fn project_series(series: &[DataFrame], status_field: Option<&str>) -> Vec<Vec<Record>> {
    series
        .iter()
        .map(|frame| project_rows(frame, status_field))
        .collect()
}

/// Active frame for a render pass.
pub fn select_frame(mode: RenderMode, frame_index: usize, series: &[DataFrame]) -> Option<&DataFrame> {
    if mode == RenderMode::Data {
        return series.iter().find(|frame| !frame.fields.is_empty());
    }
    series.get(frame_index)
}

/// Entry of the host's frame selector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameChoice {
    pub label: String,
    pub value: String,
}

pub fn frame_choices(series: &[DataFrame]) -> Vec<FrameChoice> {
    series
        .iter()
        .enumerate()
        .map(|(index, frame)| FrameChoice {
            label: frame
                .name
                .clone()
                .or_else(|| frame.ref_id.clone())
                .unwrap_or_else(|| format!("Frame {}", index + 1)),
            value: frame.ref_id.clone().unwrap_or_else(|| index.to_string()),
        })
        .collect()
}

/// Reverse lookup of a selector value.
pub fn frame_index_for(series: &[DataFrame], value: &str) -> Option<usize> {
    frame_choices(series)
        .iter()
        .position(|choice| choice.value == value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{DisplayValue, FieldType};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn people() -> DataFrame {
        DataFrame::new(vec![
            Field::new("name", FieldType::String, vec![json!("Erik"), json!("Natasha")]),
            Field::new("age", FieldType::Number, vec![json!(42), json!(36)]),
        ])
        .unwrap()
    }

    fn color_by_value(value: &Value) -> DisplayValue {
        let n = value.as_f64().unwrap_or_default();
        DisplayValue {
            text: n.to_string(),
            color: Some(if n > 80.0 { "red" } else { "green" }.to_string()),
            ..DisplayValue::default()
        }
    }

    #[test]
    fn test_project_preserves_row_order() {
        let records = project_rows(&people(), None);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("name"), Some(&json!("Erik")));
        assert_eq!(records[0].get("age"), Some(&json!(42)));
        assert_eq!(records[1].get("name"), Some(&json!("Natasha")));
        assert_eq!(records[1].get("age"), Some(&json!(36)));
    }

    #[test]
    fn test_project_uses_display_name_as_key() {
        let frame = DataFrame::new(vec![Field::new("host", FieldType::String, vec![json!("a")])
            .with_display_name("Host")])
        .unwrap();
        let records = project_rows(&frame, None);
        assert_eq!(records[0].get("Host"), Some(&json!("a")));
        assert_eq!(records[0].get("host"), None);
    }

    #[test]
    fn test_empty_frame_yields_no_records() {
        let frame = DataFrame::new(vec![Field::new("name", FieldType::String, vec![])]).unwrap();
        assert!(project_rows(&frame, Some("name")).is_empty());
    }

    #[test]
    fn test_status_color_absent_without_status_field() {
        let frame = DataFrame::new(vec![Field::new("value", FieldType::Number, vec![json!(80)])
            .with_display(color_by_value)])
        .unwrap();
        let records = project_rows(&frame, None);
        assert_eq!(records[0].status_color, None);
        assert_eq!(records[0].to_value(), json!({"value": 80}));
    }

    #[test]
    fn test_status_color_absent_without_display() {
        let frame = DataFrame::new(vec![Field::new("value", FieldType::Number, vec![json!(80)])]).unwrap();
        let records = project_rows(&frame, Some("value"));
        assert_eq!(records[0].status_color, None);
    }

    #[test]
    fn test_status_color_from_display() {
        let frame = DataFrame::new(vec![Field::new(
            "value",
            FieldType::Number,
            vec![json!(80), json!(90)],
        )
        .with_display(color_by_value)])
        .unwrap();
        let records = project_rows(&frame, Some("value"));
        assert_eq!(records[0].status_color.as_deref(), Some("green"));
        assert_eq!(records[1].status_color.as_deref(), Some("red"));
        assert_eq!(
            serde_json::to_value(&records[1]).unwrap(),
            json!({"value": 90, "statusColor": "red"})
        );
    }

    #[test]
    fn test_first_status_color_wins() {
        let frame = DataFrame::new(vec![
            Field::new("value", FieldType::Number, vec![json!(90)]).with_display(color_by_value),
            Field::new("value", FieldType::Number, vec![json!(10)])
                .with_display_name("Value")
                .with_display(color_by_value),
        ])
        .unwrap();
        let records = project_rows(&frame, Some("value"));
        assert_eq!(records[0].status_color.as_deref(), Some("red"));
    }

    #[test]
    fn test_select_frame_by_mode() {
        let empty = DataFrame::default().with_ref_id("A");
        let series = vec![empty, people().with_ref_id("B")];
        assert_eq!(
            select_frame(RenderMode::EveryRow, 0, &series).and_then(|f| f.ref_id.as_deref()),
            Some("A")
        );
        assert_eq!(
            select_frame(RenderMode::Data, 0, &series).and_then(|f| f.ref_id.as_deref()),
            Some("B")
        );
        assert!(select_frame(RenderMode::AllRows, 5, &series).is_none());
    }

    #[test]
    fn test_frame_choices() {
        let series = vec![
            people().with_name("People").with_ref_id("A"),
            people().with_ref_id("B"),
            people(),
        ];
        let choices = frame_choices(&series);
        assert_eq!(
            choices,
            vec![
                FrameChoice { label: "People".to_string(), value: "A".to_string() },
                FrameChoice { label: "B".to_string(), value: "B".to_string() },
                FrameChoice { label: "Frame 3".to_string(), value: "2".to_string() },
            ]
        );
        assert_eq!(frame_index_for(&series, "B"), Some(1));
        assert_eq!(frame_index_for(&series, "Z"), None);
    }
}
