//! The normalized record envelope.
//!
//! Parsers produce [`Record`]s; the core only ever looks at the data type and
//! the timestamps. Attribute contents are opaque to everything between the
//! parser and the downstream reporting collaborators.

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

use crate::{
    error::{ModelError, Result},
    ids::TaskId,
    source::EventSource,
    timestamp::{Timestamp, TimestampDesc},
};

/// Lower-cased data type tag, e.g. `windows:prefetch:execution`.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct DataType(String);

impl DataType {
    pub const EXTRACTION_WARNING: &'static str = "strata:warning:extraction";
    pub const RECOVERY_WARNING: &'static str = "strata:warning:recovery";

    pub fn new(raw: impl AsRef<str>) -> Result<Self> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            return Err(ModelError::InvalidDataType(raw.as_ref().to_string()));
        }
        Ok(Self(trimmed.to_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_warning(&self) -> bool {
        self.0 == Self::EXTRACTION_WARNING || self.0 == Self::RECOVERY_WARNING
    }
}

impl TryFrom<String> for DataType {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<DataType> for String {
    fn from(value: DataType) -> Self {
        value.0
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Typed attribute value. Date strings found inside artifacts stay `Text`;
/// the only time type the engine understands is [`Timestamp`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AttributeValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<AttributeValue>),
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Integer(value)
    }
}

impl From<u32> for AttributeValue {
    fn from(value: u32) -> Self {
        AttributeValue::Integer(i64::from(value))
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Float(value)
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::Text(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::Text(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordTimestamp {
    pub value: Timestamp,
    pub description: TimestampDesc,
}

/// Where a record came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub source: EventSource,
    pub parser: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub data_type: DataType,
    /// Set by the worker when the record is written to a task segment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, AttributeValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub timestamps: Vec<RecordTimestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
}

impl Record {
    pub fn new(data_type: DataType) -> Self {
        Self {
            data_type,
            task_id: None,
            attributes: BTreeMap::new(),
            timestamps: Vec::new(),
            provenance: None,
        }
    }

    /// Convenience constructor for parsers with a literal data type.
    pub fn of_type(data_type: &str) -> Result<Self> {
        Ok(Self::new(DataType::new(data_type)?))
    }

    pub fn with_attribute(
        mut self,
        name: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_timestamp(
        mut self,
        value: Timestamp,
        description: impl Into<TimestampDesc>,
    ) -> Self {
        self.timestamps.push(RecordTimestamp {
            value,
            description: description.into(),
        });
        self
    }

    /// Warning raised while extracting one source. Attached to the task, never
    /// fatal to it.
    pub fn extraction_warning(
        source: &EventSource,
        parser: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        let data_type = DataType(DataType::EXTRACTION_WARNING.into());
        let mut record = Self::new(data_type)
            .with_attribute("message", message.into())
            .with_attribute("path", source.display_name());
        if let Some(parser) = parser {
            record = record.with_attribute("parser", parser);
        }
        record.provenance = Some(Provenance {
            source: source.clone(),
            parser: parser.unwrap_or("strata").to_string(),
        });
        record
    }

    /// Warning raised by the engine itself: abandoned attempts, unreadable
    /// segments, exhausted retries.
    pub fn recovery_warning(
        task_id: TaskId,
        message: impl Into<String>,
    ) -> Self {
        let mut record = Self::new(DataType(DataType::RECOVERY_WARNING.into()))
            .with_attribute("message", message.into());
        record.task_id = Some(task_id);
        record
    }

    pub fn is_time_bound(&self) -> bool {
        !self.timestamps.is_empty()
    }

    /// Chronological ordering key; `None` for non-time-bound artifacts.
    pub fn earliest_timestamp(&self) -> Option<Timestamp> {
        self.timestamps.iter().map(|ts| ts.value).min()
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_type_is_lowercased_and_trimmed() {
        let dt = DataType::new("  Windows:Prefetch ").unwrap();
        assert_eq!(dt.as_str(), "windows:prefetch");
        assert!(DataType::new("   ").is_err());
    }

    #[test]
    fn deserializing_normalizes_data_type() {
        let record: Record =
            serde_json::from_str(r#"{"data_type":"TEST:A"}"#).unwrap();
        assert_eq!(record.data_type.as_str(), "test:a");
        assert!(serde_json::from_str::<Record>(r#"{"data_type":""}"#).is_err());
    }

    #[test]
    fn earliest_timestamp_picks_minimum() {
        let record = Record::of_type("fs:stat")
            .unwrap()
            .with_timestamp(Timestamp(30), TimestampDesc::MODIFICATION)
            .with_timestamp(Timestamp(10), TimestampDesc::CREATION);
        assert_eq!(record.earliest_timestamp(), Some(Timestamp(10)));

        let bare = Record::of_type("registry:key").unwrap();
        assert!(!bare.is_time_bound());
        assert_eq!(bare.earliest_timestamp(), None);
    }

    #[test]
    fn warnings_carry_their_tags() {
        let source = EventSource::file("/evidence/a.log");
        let warning =
            Record::extraction_warning(&source, Some("syslog"), "bad header");
        assert!(warning.data_type.is_warning());
        assert_eq!(
            warning.attribute("path"),
            Some(&AttributeValue::Text("/evidence/a.log".into()))
        );

        let recovery = Record::recovery_warning(TaskId(4), "attempt abandoned");
        assert_eq!(recovery.data_type.as_str(), DataType::RECOVERY_WARNING);
        assert_eq!(recovery.task_id, Some(TaskId(4)));
    }
}
