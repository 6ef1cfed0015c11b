use std::io::{BufRead, BufReader};

use chrono::{DateTime, Utc};
use strata_model::{EventSource, Record, Timestamp, TimestampDesc};

use crate::{
    parser::{ParseOutcome, Parser, ParserError, RecordEmitter},
    resolver::SourceRead,
};

/// Plain text logs where every line starts with an RFC 3339 timestamp
/// followed by a space and the message.
///
/// The first non-blank line decides applicability. After that, lines that do
/// not parse are skipped and reported as warnings.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimestampedLinesParser;

impl TimestampedLinesParser {
    pub const FORMAT: &'static str = "text/timestamped-lines";
    pub const DATA_TYPE: &'static str = "text:log:line";
}

fn split_line(line: &str) -> Option<(Timestamp, &str)> {
    let (stamp, message) = line.split_once(' ')?;
    let parsed = DateTime::parse_from_rfc3339(stamp).ok()?;
    Some((Timestamp::from(parsed.with_timezone(&Utc)), message.trim_end()))
}

impl Parser for TimestampedLinesParser {
    fn name(&self) -> &str {
        "timestamped_lines"
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
            let line_number = index as i64 + 1;
            let line = match line {
                Ok(line) => line,
                Err(err) if !matched => {
                    // Binary input fails UTF-8 decoding before any match.
                    tracing::trace!(error = %err, "not a text log");
                    return ParseOutcome::NotApplicable;
                }
                Err(err) => return ParseOutcome::Fatal(ParserError::from(err)),
            };
            if line.trim().is_empty() {
                continue;
            }

            let Some((timestamp, message)) = split_line(&line) else {
                if !matched {
                    return ParseOutcome::NotApplicable;
                }
                warnings.push(format!(
                    "line {line_number}: no leading RFC 3339 timestamp"
                ));
                continue;
            };
            matched = true;

            let record = match Record::of_type(Self::DATA_TYPE) {
                Ok(record) => record,
                Err(err) => {
                    return ParseOutcome::Fatal(ParserError::new(
                        err.to_string(),
                    ));
                }
            };
            let record = record
                .with_attribute("message", message)
                .with_attribute("line", line_number)
                .with_timestamp(timestamp, TimestampDesc::RECORDED);

            if let Err(err) = emitter.emit(record) {
                return ParseOutcome::Fatal(err.into());
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
    use strata_model::AttributeValue;

    use super::*;
    use crate::parsers::testing::run;

    #[test]
    fn parses_each_line_into_a_record() {
        let input = "2024-03-01T10:00:00Z service started\n\
                     2024-03-01T10:00:01.5+01:00 listening on :80\n";
        let (outcome, records) = run(&TimestampedLinesParser, input);

        assert_eq!(outcome, ParseOutcome::Success);
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0].attribute("message"),
            Some(&AttributeValue::Text("service started".into()))
        );
        assert_eq!(
            records[0].earliest_timestamp(),
            Some(Timestamp(1_709_287_200_000_000))
        );
        // +01:00 offset is normalised to UTC.
        assert_eq!(
            records[1].earliest_timestamp(),
            Some(Timestamp(1_709_283_601_500_000))
        );
    }

    #[test]
    fn unrecognised_first_line_is_not_applicable() {
        let (outcome, records) = run(&TimestampedLinesParser, "hello world\n");
        assert_eq!(outcome, ParseOutcome::NotApplicable);
        assert!(records.is_empty());
    }

    #[test]
    fn bad_lines_after_a_match_become_warnings() {
        let input = concat!(
            "2024-03-01T10:00:00Z ok\n",
            "garbage\n",
            "\n",
            "2024-03-01T10:00:02Z ok again\n",
        );
        let (outcome, records) = run(&TimestampedLinesParser, input);

        assert_eq!(records.len(), 2);
        match outcome {
            ParseOutcome::Warning(messages) => {
                assert_eq!(
                    messages,
                    vec!["line 2: no leading RFC 3339 timestamp"]
                );
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
