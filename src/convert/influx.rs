use chrono::{DateTime, Utc};
use stream_frame::{Field, FieldType, FieldValue, Frame, Labels, Vector};

use super::ConvertError;
use super::line_protocol::{self, LineValue, Point};
use crate::pipeline::{ChannelFrame, Vars};
use crate::rule::{AutoInfluxConverterConfig, InfluxFrameFormat};

/// Turns line protocol into one frame per measurement (labels-column
/// format) or per measurement and timestamp (wide format).
#[derive(Debug, Clone, Default)]
pub struct AutoInfluxConverter {
    config: AutoInfluxConverterConfig,
}

#[derive(Debug)]
struct Column {
    name: String,
    labels: Labels,
    cells: Vec<Option<LineValue>>,
}

#[derive(Debug)]
struct Group {
    name: String,
    timestamp: i64,
    times: Vec<DateTime<Utc>>,
    label_rows: Vec<String>,
    columns: Vec<Column>,
}

impl Group {
    fn new(name: &str, timestamp: i64) -> Self {
        Self {
            name: name.to_string(),
            timestamp,
            times: Vec::new(),
            label_rows: Vec::new(),
            columns: Vec::new(),
        }
    }

    fn push_row(&mut self, time: DateTime<Utc>, fields: Vec<((String, Labels), LineValue)>) {
        let row = self.times.len();
        self.times.push(time);
        for column in &mut self.columns {
            column.cells.push(None);
        }
        for ((name, labels), value) in fields {
            let idx = match self
                .columns
                .iter()
                .position(|c| c.name == name && c.labels == labels)
            {
                Some(idx) => idx,
                None => {
                    self.columns.push(Column {
                        name,
                        labels,
                        cells: vec![None; row + 1],
                    });
                    self.columns.len() - 1
                }
            };
            self.columns[idx].cells[row] = Some(value);
        }
    }
}

impl AutoInfluxConverter {
    pub fn new(config: AutoInfluxConverterConfig) -> Self {
        Self { config }
    }

    pub fn convert(&self, _vars: &Vars, body: &[u8]) -> Result<Vec<ChannelFrame>, ConvertError> {
        let text = std::str::from_utf8(body)?;
        let points = line_protocol::parse(text)?;
        let now = Utc::now();

        let groups = match self.config.frame_format {
            InfluxFrameFormat::Wide => wide_groups(points, now),
            InfluxFrameFormat::LabelsColumn => labels_column_groups(points, now),
        };
        let labels_column = self.config.frame_format == InfluxFrameFormat::LabelsColumn;
        groups
            .into_iter()
            .map(|g| self.to_frame(g, labels_column).map(ChannelFrame::here))
            .collect()
    }

    fn to_frame(&self, group: Group, labels_column: bool) -> Result<Frame, ConvertError> {
        let mut frame = Frame::new(group.name);
        if labels_column {
            let labels = group.label_rows.into_iter().map(Some).collect();
            frame
                .fields
                .push(Field::from_vector("labels", Vector::String(labels)));
        }
        let times = group.times.into_iter().map(Some).collect();
        frame
            .fields
            .push(Field::from_vector("time", Vector::Time(times)));

        for column in group.columns {
            let field_type = self.column_type(&column.cells);
            let mut field = Field::new_nullable(column.name, field_type).with_labels(column.labels);
            for cell in column.cells {
                field.append(cell_value(cell, field_type))?;
            }
            frame.fields.push(field);
        }
        Ok(frame)
    }

    /// Ints and floats widen to float64; any other mix falls back to string.
    fn column_type(&self, cells: &[Option<LineValue>]) -> FieldType {
        let mut seen: Option<FieldType> = None;
        for value in cells.iter().flatten() {
            let t = match value {
                LineValue::Float(_) => FieldType::Float64,
                LineValue::Int(_) | LineValue::UInt(_) if self.config.float64_numbers => {
                    FieldType::Float64
                }
                LineValue::Int(_) => FieldType::Int64,
                LineValue::UInt(u) if i64::try_from(*u).is_ok() => FieldType::Int64,
                LineValue::UInt(_) => FieldType::Float64,
                LineValue::Bool(_) => FieldType::Bool,
                LineValue::Str(_) => FieldType::String,
            };
            seen = Some(match seen {
                None => t,
                Some(prev) if prev == t => t,
                Some(prev) if prev.is_numeric() && t.is_numeric() => FieldType::Float64,
                Some(_) => FieldType::String,
            });
        }
        seen.unwrap_or(FieldType::Float64)
    }
}

fn cell_value(cell: Option<LineValue>, field_type: FieldType) -> FieldValue {
    let Some(value) = cell else {
        return FieldValue::Null;
    };
    match (field_type, value) {
        (FieldType::Float64, LineValue::Float(f)) => FieldValue::Float64(f),
        (FieldType::Float64, LineValue::Int(i)) => FieldValue::Float64(i as f64),
        (FieldType::Float64, LineValue::UInt(u)) => FieldValue::Float64(u as f64),
        (FieldType::Int64, LineValue::Int(i)) => FieldValue::Int64(i),
        (FieldType::Int64, LineValue::UInt(u)) => {
            i64::try_from(u).map(FieldValue::Int64).unwrap_or(FieldValue::Null)
        }
        (FieldType::Bool, LineValue::Bool(b)) => FieldValue::Bool(b),
        (_, LineValue::Str(s)) => FieldValue::String(s),
        (_, LineValue::Float(f)) => FieldValue::String(f.to_string()),
        (_, LineValue::Int(i)) => FieldValue::String(i.to_string()),
        (_, LineValue::UInt(u)) => FieldValue::String(u.to_string()),
        (_, LineValue::Bool(b)) => FieldValue::String(b.to_string()),
    }
}

fn point_time(point: &Point, now: DateTime<Utc>) -> (i64, DateTime<Utc>) {
    match point.timestamp {
        Some(ns) => (ns, DateTime::from_timestamp_nanos(ns)),
        None => (now.timestamp_nanos_opt().unwrap_or_default(), now),
    }
}

fn wide_groups(points: Vec<Point>, now: DateTime<Utc>) -> Vec<Group> {
    let mut groups: Vec<Group> = Vec::new();
    for point in points {
        let (ts, time) = point_time(&point, now);
        let idx = match groups
            .iter()
            .position(|g| g.name == point.measurement && g.timestamp == ts)
        {
            Some(idx) => idx,
            None => {
                groups.push(Group::new(&point.measurement, ts));
                groups.len() - 1
            }
        };
        let tags = point.tags;
        let fields = point
            .fields
            .into_iter()
            .map(|(name, value)| ((name, tags.clone()), value))
            .collect();
        groups[idx].push_row(time, fields);
    }
    groups
}

fn labels_column_groups(points: Vec<Point>, now: DateTime<Utc>) -> Vec<Group> {
    let mut groups: Vec<Group> = Vec::new();
    for point in points {
        let (_, time) = point_time(&point, now);
        let idx = match groups.iter().position(|g| g.name == point.measurement) {
            Some(idx) => idx,
            None => {
                groups.push(Group::new(&point.measurement, 0));
                groups.len() - 1
            }
        };
        let labels = point
            .tags
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        let fields = point
            .fields
            .into_iter()
            .map(|(name, value)| ((name, Labels::new()), value))
            .collect();
        let group = &mut groups[idx];
        group.label_rows.push(labels);
        group.push_row(time, fields);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn convert(config: AutoInfluxConverterConfig, body: &str) -> Vec<Frame> {
        let vars = Vars::new(1, "stream/telegraf/all").unwrap();
        AutoInfluxConverter::new(config)
            .convert(&vars, body.as_bytes())
            .unwrap()
            .into_iter()
            .map(|cf| {
                assert!(cf.channel.is_empty());
                cf.frame
            })
            .collect()
    }

    #[test]
    fn wide_mode_unions_fields_at_the_same_time() {
        let frames = convert(
            AutoInfluxConverterConfig::default(),
            "cpu,host=a user=1.5 1000000000\ncpu,host=a system=2i 1000000000",
        );
        assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        assert_eq!(frame.name, "cpu");
        let names: Vec<&str> = frame.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["time", "user", "system"]);
        assert_eq!(frame.fields[1].labels["host"], "a");

        let user = frame.field_by_name("user").unwrap();
        let system = frame.field_by_name("system").unwrap();
        assert_eq!(user.at(0), FieldValue::Float64(1.5));
        assert_eq!(user.at(1), FieldValue::Null);
        assert_eq!(system.at(0), FieldValue::Null);
        assert_eq!(system.at(1), FieldValue::Int64(2));
        frame.validate().unwrap();
    }

    #[test]
    fn wide_mode_splits_on_timestamp() {
        let frames = convert(
            AutoInfluxConverterConfig::default(),
            "cpu v=1 1000\nmem v=2 1000\ncpu v=3 2000",
        );
        let summary: Vec<(&str, FieldValue)> = frames
            .iter()
            .map(|f| (f.name.as_str(), f.fields[0].at(0)))
            .collect();
        assert_eq!(summary.len(), 3);
        assert_eq!(summary[0].0, "cpu");
        assert_eq!(summary[1].0, "mem");
        assert_eq!(
            summary[2].1,
            FieldValue::Time(DateTime::from_timestamp_nanos(2000))
        );
    }

    #[test]
    fn mixed_types_widen_or_degrade() {
        let frames = convert(
            AutoInfluxConverterConfig {
                frame_format: InfluxFrameFormat::LabelsColumn,
                float64_numbers: false,
            },
            "m a=1i,b=1i 1\nm a=2.5,b=\"x\" 2",
        );
        let frame = &frames[0];
        let a = frame.field_by_name("a").unwrap();
        assert_eq!(a.field_type(), FieldType::Float64);
        assert_eq!(a.at(0), FieldValue::Float64(1.0));
        let b = frame.field_by_name("b").unwrap();
        assert_eq!(b.field_type(), FieldType::String);
        assert_eq!(b.at(0), FieldValue::String("1".to_string()));
    }

    #[test]
    fn float64_numbers_forces_float_columns() {
        let frames = convert(
            AutoInfluxConverterConfig {
                frame_format: InfluxFrameFormat::Wide,
                float64_numbers: true,
            },
            "m a=1i,b=2u,c=t 1",
        );
        let frame = &frames[0];
        assert_eq!(frame.field_by_name("a").unwrap().field_type(), FieldType::Float64);
        assert_eq!(frame.field_by_name("b").unwrap().field_type(), FieldType::Float64);
        assert_eq!(frame.field_by_name("c").unwrap().field_type(), FieldType::Bool);
    }

    #[test]
    fn labels_column_accumulates_per_measurement() {
        let frames = convert(
            AutoInfluxConverterConfig {
                frame_format: InfluxFrameFormat::LabelsColumn,
                float64_numbers: false,
            },
            "cpu,host=b,dc=x v=1 1000\ncpu,host=a v=2 2000\nmem free=3 1000",
        );
        assert_eq!(frames.len(), 2);
        let cpu = &frames[0];
        let names: Vec<&str> = cpu.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["labels", "time", "v"]);
        assert_eq!(cpu.rows(), 2);
        assert_eq!(cpu.fields[0].at(0), FieldValue::String("dc=x,host=b".to_string()));
        assert_eq!(cpu.fields[0].at(1), FieldValue::String("host=a".to_string()));
        assert_eq!(frames[1].name, "mem");
    }

    #[test]
    fn invalid_lines_fail_the_whole_payload() {
        let vars = Vars::new(1, "stream/telegraf/all").unwrap();
        let err = AutoInfluxConverter::default()
            .convert(&vars, b"cpu v=1\ncpu v=oops")
            .unwrap_err();
        assert!(matches!(err, ConvertError::LineProtocol { line: 2, .. }));
    }
}
