use thiserror::Error;

use super::{Label, Sample, TimeSeries};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("line {0}: missing metric name")]
    MissingName(usize),
    #[error("line {0}: malformed labels")]
    MalformedLabels(usize),
    #[error("line {0}: invalid value {1:?}")]
    InvalidValue(usize, String),
    #[error("line {0}: invalid timestamp {1:?}")]
    InvalidTimestamp(usize, String),
}

/// Parses a Prometheus text exposition payload into one `TimeSeries` per
/// sample line. Comment (`#`) and blank lines are skipped; `HELP`/`TYPE`
/// metadata is not retained.
pub fn parse_text(input: &str) -> Result<Vec<TimeSeries>, ParseError> {
    let mut out = Vec::new();

    for (no, raw) in input.lines().enumerate() {
        let no = no + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let name_end = line
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == ':'))
            .unwrap_or(line.len());
        if name_end == 0 {
            return Err(ParseError::MissingName(no));
        }
        let name = &line[..name_end];
        let mut rest = line[name_end..].trim_start();

        let mut labels = vec![Label::new("__name__", name)];
        if let Some(inner) = rest.strip_prefix('{') {
            let (parsed, remain) = parse_labels(inner, no)?;
            labels.extend(parsed);
            rest = remain.trim_start();
        }

        let mut fields = rest.split_whitespace();
        let value = fields
            .next()
            .ok_or_else(|| ParseError::InvalidValue(no, rest.to_string()))?;
        let value = value
            .parse::<f64>()
            .map_err(|_| ParseError::InvalidValue(no, value.to_string()))?;
        let timestamp = match fields.next() {
            Some(field) => field
                .parse::<i64>()
                .map_err(|_| ParseError::InvalidTimestamp(no, field.to_string()))?,
            None => 0,
        };

        labels.sort_by(|a, b| a.name.cmp(&b.name));
        out.push(TimeSeries {
            labels,
            samples: vec![Sample { value, timestamp }],
        });
    }

    Ok(out)
}

/// Parses the `name="value",...}` tail of a label set, handling the `\\`,
/// `\"` and `\n` escapes the format allows in label values. Returns the
/// labels and the text after the closing brace.
fn parse_labels(mut s: &str, no: usize) -> Result<(Vec<Label>, &str), ParseError> {
    let mut labels = Vec::new();

    loop {
        s = s.trim_start();
        if let Some(remain) = s.strip_prefix('}') {
            return Ok((labels, remain));
        }

        let eq = s.find('=').ok_or(ParseError::MalformedLabels(no))?;
        let name = s[..eq].trim();
        if name.is_empty() {
            return Err(ParseError::MalformedLabels(no));
        }

        let rest = s[eq + 1..]
            .trim_start()
            .strip_prefix('"')
            .ok_or(ParseError::MalformedLabels(no))?;

        let mut value = String::new();
        let mut chars = rest.char_indices();
        let mut end = None;
        while let Some((i, c)) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some((_, 'n')) => value.push('\n'),
                    Some((_, '\\')) => value.push('\\'),
                    Some((_, '"')) => value.push('"'),
                    Some((_, other)) => {
                        value.push('\\');
                        value.push(other);
                    }
                    None => return Err(ParseError::MalformedLabels(no)),
                },
                '"' => {
                    end = Some(i);
                    break;
                }
                other => value.push(other),
            }
        }
        let end = end.ok_or(ParseError::MalformedLabels(no))?;

        labels.push(Label {
            name: name.to_string(),
            value,
        });

        s = rest[end + 1..].trim_start();
        if let Some(remain) = s.strip_prefix(',') {
            s = remain;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(labels: &[(&str, &str)], value: f64, timestamp: i64) -> TimeSeries {
        let mut labels = labels
            .iter()
            .map(|(n, v)| Label::new(*n, *v))
            .collect::<Vec<_>>();
        labels.sort_by(|a, b| a.name.cmp(&b.name));

        TimeSeries {
            labels,
            samples: vec![Sample { value, timestamp }],
        }
    }

    #[test]
    fn parse_simple() {
        let got = parse_text("up 1\n").unwrap();
        assert_eq!(got, vec![series(&[("__name__", "up")], 1.0, 0)]);
    }

    #[test]
    fn parse_skips_comments_and_blanks() {
        let input = "\
# HELP node_load1 1m load average.
# TYPE node_load1 gauge

node_load1 0.21
";
        let got = parse_text(input).unwrap();
        assert_eq!(got, vec![series(&[("__name__", "node_load1")], 0.21, 0)]);
    }

    #[test]
    fn parse_labels_and_timestamp() {
        let input = r#"http_requests_total{method="post",code="200"} 1027 1395066363000"#;
        let got = parse_text(input).unwrap();
        assert_eq!(
            got,
            vec![series(
                &[
                    ("__name__", "http_requests_total"),
                    ("method", "post"),
                    ("code", "200"),
                ],
                1027.0,
                1395066363000,
            )]
        );
    }

    #[test]
    fn parse_escaped_label_values() {
        let input = r#"msg{path="C:\\temp",text="say \"hi\"\n"} 1"#;
        let got = parse_text(input).unwrap();
        assert_eq!(
            got,
            vec![series(
                &[
                    ("__name__", "msg"),
                    ("path", r"C:\temp"),
                    ("text", "say \"hi\"\n"),
                ],
                1.0,
                0,
            )]
        );
    }

    #[test]
    fn parse_special_values() {
        let got = parse_text("a NaN\nb +Inf\nc -2.5e3\n").unwrap();
        assert_eq!(got.len(), 3);
        assert!(got[0].samples[0].value.is_nan());
        assert_eq!(got[1].samples[0].value, f64::INFINITY);
        assert_eq!(got[2].samples[0].value, -2500.0);
    }

    #[test]
    fn parse_empty_label_set() {
        let got = parse_text("up{} 1\n").unwrap();
        assert_eq!(got, vec![series(&[("__name__", "up")], 1.0, 0)]);
    }

    #[test]
    fn parse_errors() {
        assert_eq!(parse_text("{a=\"b\"} 1"), Err(ParseError::MissingName(1)));
        assert_eq!(
            parse_text("up{a=\"b\" 1"),
            Err(ParseError::MalformedLabels(1))
        );
        assert_eq!(
            parse_text("up one"),
            Err(ParseError::InvalidValue(1, "one".into()))
        );
        assert_eq!(
            parse_text("up 1 soon"),
            Err(ParseError::InvalidTimestamp(1, "soon".into()))
        );
    }
}
