use std::io::{BufRead, BufReader};

use serde_json::{Map, Value};
use strata_model::{
    AttributeValue, EventSource, Record, Timestamp, TimestampDesc,
};

use crate::{
    parser::{ParseOutcome, Parser, ParserError, RecordEmitter},
    resolver::SourceRead,
};

/// JSON-lines event dumps: one object per line with an integer
/// `timestamp_us` (microseconds since the epoch) and an optional
/// `data_type`. Every other member becomes an attribute.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEventsParser;

impl JsonEventsParser {
    pub const FORMAT: &'static str = "json/events";
    pub const DEFAULT_DATA_TYPE: &'static str = "json:event";
}

fn to_attribute(value: Value) -> AttributeValue {
    match value {
        Value::Null => AttributeValue::Null,
        Value::Bool(value) => AttributeValue::Bool(value),
        Value::Number(number) => match number.as_i64() {
            Some(int) => AttributeValue::Integer(int),
            None => AttributeValue::Float(number.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(text) => AttributeValue::Text(text),
        Value::Array(items) => {
            AttributeValue::List(items.into_iter().map(to_attribute).collect())
        }
        nested @ Value::Object(_) => AttributeValue::Text(nested.to_string()),
    }
}

fn to_record(mut object: Map<String, Value>) -> Result<Record, String> {
    let data_type = match object.remove("data_type") {
        None => JsonEventsParser::DEFAULT_DATA_TYPE.to_string(),
        Some(Value::String(data_type)) => data_type,
        Some(other) => {
            return Err(format!("data_type must be a string, got {other}"));
        }
    };
    let mut record =
        Record::of_type(&data_type).map_err(|err| err.to_string())?;

    match object.remove("timestamp_us") {
        None | Some(Value::Null) => {}
        Some(Value::Number(number)) => {
            let micros = number.as_i64().ok_or_else(|| {
                format!("timestamp_us must be an integer, got {number}")
            })?;
            record = record.with_timestamp(
                Timestamp::from_micros(micros),
                TimestampDesc::RECORDED,
            );
        }
        Some(other) => {
            return Err(format!(
                "timestamp_us must be an integer, got {other}"
            ));
        }
    }

    for (name, value) in object {
        record = record.with_attribute(name, to_attribute(value));
    }
    Ok(record)
}

impl Parser for JsonEventsParser {
    fn name(&self) -> &str {
        "json_events"
    }

    fn parse(
        &self,
        _source: &EventSource,
        input: &mut dyn SourceRead,
        emitter: &mut RecordEmitter<'_>,
    ) -> ParseOutcome {
        let reader = BufReader::new(input);
        let mut warnings = Vec::new();
        let mut matched = false;

        for (index, line) in reader.lines().enumerate() {
            let line_number = index + 1;
            let line = match line {
                Ok(line) => line,
                Err(_) if !matched => return ParseOutcome::NotApplicable,
                Err(err) => return ParseOutcome::Fatal(ParserError::from(err)),
            };
            if line.trim().is_empty() {
                continue;
            }

            let object = match serde_json::from_str::<Value>(&line) {
                Ok(Value::Object(object)) => object,
                Ok(_) | Err(_) if !matched => {
                    return ParseOutcome::NotApplicable;
                }
                Ok(_) => {
                    warnings
                        .push(format!("line {line_number}: not a JSON object"));
                    continue;
                }
                Err(err) => {
                    warnings.push(format!("line {line_number}: {err}"));
                    continue;
                }
            };
            if !matched && !object.contains_key("timestamp_us") {
                return ParseOutcome::NotApplicable;
            }
            matched = true;

            match to_record(object) {
                Ok(record) => {
                    if let Err(err) = emitter.emit(record) {
                        return ParseOutcome::Fatal(err.into());
                    }
                }
                Err(reason) => {
                    warnings.push(format!("line {line_number}: {reason}"))
                }
            }
        }

        if !matched {
            ParseOutcome::NotApplicable
        } else if warnings.is_empty() {
            ParseOutcome::Success
        } else {
            ParseOutcome::Warning(warnings)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsers::testing::run;

    #[test]
    fn objects_become_records() {
        let input = concat!(
            r#"{"timestamp_us": 1700000000000000, "#,
            r#""data_type": "Browser:Visit", "url": "https://a", "count": 3}"#,
            "\n",
            r#"{"timestamp_us": 1700000000000001, "tags": ["x", 1]}"#,
            "\n",
        );
        let (outcome, records) = run(&JsonEventsParser, input);

        assert_eq!(outcome, ParseOutcome::Success);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].data_type.as_str(), "browser:visit");
        assert_eq!(
            records[0].attribute("count"),
            Some(&AttributeValue::Integer(3))
        );
        assert_eq!(
            records[0].earliest_timestamp(),
            Some(Timestamp(1_700_000_000_000_000))
        );
        assert_eq!(
            records[1].data_type.as_str(),
            JsonEventsParser::DEFAULT_DATA_TYPE
        );
        assert_eq!(
            records[1].attribute("tags"),
            Some(&AttributeValue::List(vec![
                AttributeValue::Text("x".into()),
                AttributeValue::Integer(1),
            ]))
        );
    }

    #[test]
    fn requires_timestamp_on_the_first_object() {
        let (outcome, _) = run(&JsonEventsParser, "{\"name\": \"x\"}\n");
        assert_eq!(outcome, ParseOutcome::NotApplicable);

        let (outcome, _) =
            run(&JsonEventsParser, "2024-01-01T00:00:00Z text\n");
        assert_eq!(outcome, ParseOutcome::NotApplicable);
    }

    #[test]
    fn later_bad_lines_are_warnings() {
        let input = concat!(
            r#"{"timestamp_us": 1}"#,
            "\n{broken\n",
            r#"{"timestamp_us": "soon"}"#,
            "\n",
            r#"{"timestamp_us": 2}"#,
            "\n",
        );
        let (outcome, records) = run(&JsonEventsParser, input);

        assert_eq!(records.len(), 2);
        let ParseOutcome::Warning(messages) = outcome else {
            panic!("expected warnings");
        };
        assert_eq!(messages.len(), 2);
        assert!(messages[0].starts_with("line 2:"));
        assert!(messages[1].contains("timestamp_us must be an integer"));
    }
}
