//! Prometheus text exposition (format version 0.0.4).

use std::fmt::{self, Write};

use super::registry::{MetricSnapshot, SampleValue};

pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Writes every metric of `snapshot`, in order, into `out`.
pub fn encode<W: Write>(out: &mut W, snapshot: &[MetricSnapshot]) -> fmt::Result {
    for metric in snapshot {
        writeln!(out, "# HELP {} {}", metric.name, escape_help(&metric.help))?;
        writeln!(out, "# TYPE {} {}", metric.name, metric.kind)?;
        for sample in &metric.samples {
            match &sample.value {
                SampleValue::Counter(v) => {
                    writeln!(out, "{}{} {}", metric.name, LabelSet(None, &sample.labels), v)?;
                }
                SampleValue::Gauge(v) => {
                    writeln!(out, "{}{} {}", metric.name, LabelSet(None, &sample.labels), Number(*v))?;
                }
                SampleValue::Histogram(h) => {
                    for (bound, count) in &h.buckets {
                        let le = Number(*bound).to_string();
                        writeln!(out, "{}_bucket{} {}", metric.name, LabelSet(Some(("le", le.as_str())), &sample.labels), count)?;
                    }
                    writeln!(out, "{}_sum{} {}", metric.name, LabelSet(None, &sample.labels), Number(h.sum))?;
                    writeln!(out, "{}_count{} {}", metric.name, LabelSet(None, &sample.labels), h.count)?;
                }
            }
        }
    }
    Ok(())
}

/// [`encode`] into a fresh `String`.
pub fn render(snapshot: &[MetricSnapshot]) -> String {
    let mut buffer = String::new();
    // Writing into a String cannot fail.
    let _ = encode(&mut buffer, snapshot);
    buffer
}

/// `{k="v",...}`, or nothing when there are no labels. The optional pair is written first.
struct LabelSet<'a>(Option<(&'a str, &'a str)>, &'a [(String, String)]);

impl fmt::Display for LabelSet<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs = self.0.into_iter().chain(self.1.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        let mut first = true;
        for (key, value) in pairs {
            f.write_str(if first { "{" } else { "," })?;
            first = false;
            write!(f, "{key}=\"{}\"", escape_label_value(value))?;
        }
        if !first {
            f.write_str("}")?;
        }
        Ok(())
    }
}

/// Locale independent float, with the special values spelled the Prometheus way.
struct Number(f64);

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            v if v.is_nan() => f.write_str("NaN"),
            v if v == f64::INFINITY => f.write_str("+Inf"),
            v if v == f64::NEG_INFINITY => f.write_str("-Inf"),
            v => write!(f, "{v}"),
        }
    }
}

fn escape_label_value(v: &str) -> String {
    v.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

fn escape_help(v: &str) -> String {
    v.replace('\\', "\\\\").replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::registry::{
        HTTP_RESPONSE_TIME_SECONDS, HistogramSample, MetricKind, MetricRegistry, RESPONSE_TIME_BUCKETS, Sample,
    };

    fn labels(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn renders_counters_gauges_and_histograms() {
        let snapshot = vec![
            MetricSnapshot {
                name: "cats_logins_total".to_string(),
                help: "Total number of logins".to_string(),
                kind: MetricKind::Counter,
                samples: vec![Sample {
                    labels: vec![],
                    value: SampleValue::Counter(1),
                }],
            },
            MetricSnapshot {
                name: "logged_in_users".to_string(),
                help: "Currently logged in users".to_string(),
                kind: MetricKind::Gauge,
                samples: vec![Sample {
                    labels: labels(&[("environment", "production")]),
                    value: SampleValue::Gauge(-2.5),
                }],
            },
            MetricSnapshot {
                name: "latency_seconds".to_string(),
                help: "Latency".to_string(),
                kind: MetricKind::Histogram,
                samples: vec![Sample {
                    labels: labels(&[("app", "cats"), ("method", "GET")]),
                    value: SampleValue::Histogram(HistogramSample {
                        buckets: vec![(0.1, 1), (1.0, 2), (f64::INFINITY, 3)],
                        sum: 2.5,
                        count: 3,
                    }),
                }],
            },
        ];

        let expected = "\
# HELP cats_logins_total Total number of logins
# TYPE cats_logins_total counter
cats_logins_total 1
# HELP logged_in_users Currently logged in users
# TYPE logged_in_users gauge
logged_in_users{environment=\"production\"} -2.5
# HELP latency_seconds Latency
# TYPE latency_seconds histogram
latency_seconds_bucket{le=\"0.1\",app=\"cats\",method=\"GET\"} 1
latency_seconds_bucket{le=\"1\",app=\"cats\",method=\"GET\"} 2
latency_seconds_bucket{le=\"+Inf\",app=\"cats\",method=\"GET\"} 3
latency_seconds_sum{app=\"cats\",method=\"GET\"} 2.5
latency_seconds_count{app=\"cats\",method=\"GET\"} 3
";
        assert_eq!(render(&snapshot), expected);
    }

    #[test]
    fn metric_without_samples_still_has_help_and_type() {
        let snapshot = vec![MetricSnapshot {
            name: "http_requests_total".to_string(),
            help: "Total HTTP requests".to_string(),
            kind: MetricKind::Counter,
            samples: vec![],
        }];
        assert_eq!(
            render(&snapshot),
            "# HELP http_requests_total Total HTTP requests\n# TYPE http_requests_total counter\n"
        );
    }

    #[test]
    fn escapes_label_values_and_help() {
        let snapshot = vec![MetricSnapshot {
            name: "odd".to_string(),
            help: "line one\nline \\two".to_string(),
            kind: MetricKind::Gauge,
            samples: vec![Sample {
                labels: labels(&[("path", "a\"b\\c\nd")]),
                value: SampleValue::Gauge(f64::NAN),
            }],
        }];
        let text = render(&snapshot);
        assert!(text.contains("# HELP odd line one\\nline \\\\two\n"));
        assert!(text.contains("odd{path=\"a\\\"b\\\\c\\nd\"} NaN\n"));
    }

    #[test]
    fn renders_registry_histogram_buckets() {
        let registry = MetricRegistry::with_well_known_metrics();
        let route = [("method", "GET"), ("path", "/")];
        for value in [0.05, 0.4, 1.5, 7.0] {
            registry.observe(HTTP_RESPONSE_TIME_SECONDS, &route, value).unwrap();
        }
        let text = render(&registry.snapshot());

        let expected_counts = [1, 2, 2, 3, 3, 4];
        for (bound, count) in RESPONSE_TIME_BUCKETS.iter().zip(expected_counts) {
            let line = format!("http_response_time_seconds_bucket{{le=\"{bound}\",method=\"GET\",path=\"/\"}} {count}\n");
            assert!(text.contains(&line), "missing {line:?} in\n{text}");
        }
        assert!(text.contains("http_response_time_seconds_bucket{le=\"+Inf\",method=\"GET\",path=\"/\"} 4\n"));
        assert!(text.contains("http_response_time_seconds_count{method=\"GET\",path=\"/\"} 4\n"));

        let sum_line = text
            .lines()
            .find(|l| l.starts_with("http_response_time_seconds_sum{method=\"GET\",path=\"/\"} "))
            .unwrap();
        let sum: f64 = sum_line.rsplit(' ').next().unwrap().parse().unwrap();
        assert!((sum - 8.95).abs() < 1e-9);
    }

    /// Parses one sample line, unescaping label values and rejecting repeated label names.
    fn parse_sample(line: &str) -> Result<(String, Vec<(String, String)>, f64), String> {
        let name_end = line.find(['{', ' ']).ok_or("no value")?;
        let (name, mut rest) = line.split_at(name_end);
        let mut first = name.chars();
        let name_ok = first.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_' || c == ':')
            && first.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':');
        if !name_ok {
            return Err(format!("bad metric name {name:?}"));
        }

        let mut labels: Vec<(String, String)> = Vec::new();
        if let Some(block) = rest.strip_prefix('{') {
            let mut chars = block.char_indices();
            loop {
                let key: String = chars.by_ref().map(|(_, c)| c).take_while(|c| *c != '=').collect();
                if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                    return Err(format!("bad label name {key:?}"));
                }
                if labels.iter().any(|(k, _)| *k == key) {
                    return Err(format!("label {key:?} repeated"));
                }
                if chars.next().map(|(_, c)| c) != Some('"') {
                    return Err("unquoted label value".to_string());
                }
                let mut value = String::new();
                loop {
                    match chars.next().map(|(_, c)| c) {
                        Some('"') => break,
                        Some('\\') => match chars.next().map(|(_, c)| c) {
                            Some('n') => value.push('\n'),
                            Some(c @ ('\\' | '"')) => value.push(c),
                            other => return Err(format!("bad escape {other:?}")),
                        },
                        Some('\n') | None => return Err("unterminated label value".to_string()),
                        Some(c) => value.push(c),
                    }
                }
                labels.push((key, value));
                match chars.next() {
                    Some((_, ',')) => continue,
                    Some((idx, '}')) => {
                        rest = &block[idx + 1..];
                        break;
                    }
                    other => return Err(format!("expected , or }} after label, got {other:?}")),
                }
            }
        }

        let value = rest.strip_prefix(' ').ok_or("missing space before value")?;
        let value = match value {
            "+Inf" => f64::INFINITY,
            "-Inf" => f64::NEG_INFINITY,
            "NaN" => f64::NAN,
            v => v.parse().map_err(|_| format!("bad value {v:?}"))?,
        };
        Ok((name.to_string(), labels, value))
    }

    #[test]
    fn sample_parser_rejects_malformed_lines() {
        assert!(parse_sample("a{x=\"1\",x=\"2\"} 1").is_err());
        assert!(parse_sample("bad name-1 0").is_err());
        assert!(parse_sample("a{x=\"1\",} 1").is_err());
        assert!(parse_sample("a{x=1} 1").is_err());
        let (_, labels, _) = parse_sample("a{x=\"q\\\"\\\\\\n\"} 1").unwrap();
        assert_eq!(labels, [("x".to_string(), "q\"\\\n".to_string())]);
    }

    #[test]
    fn every_line_follows_the_text_grammar() {
        let registry = MetricRegistry::with_well_known_metrics();
        registry.increment("http_requests_total", &[("method", "GET"), ("path", "/a\"b\\c\nd"), ("status", "200")]).unwrap();
        registry.set_gauge("logged_in_users", &[("environment", "development")], 1.0).unwrap();
        registry.observe(HTTP_RESPONSE_TIME_SECONDS, &[("method", "GET"), ("path", "/")], 0.3).unwrap();
        let text = render(&registry.snapshot());

        let mut family: Option<(String, String)> = None;
        let mut samples = 0;
        for line in text.lines() {
            if let Some(help) = line.strip_prefix("# HELP ") {
                assert!(help.split_once(' ').is_some(), "{line}");
                continue;
            }
            if let Some(ty) = line.strip_prefix("# TYPE ") {
                let (name, kind) = ty.split_once(' ').unwrap();
                assert!(["counter", "gauge", "histogram"].contains(&kind), "{line}");
                family = Some((name.to_string(), kind.to_string()));
                continue;
            }
            let (name, labels, _) = parse_sample(line).unwrap_or_else(|e| panic!("{e}: {line}"));
            let (family_name, kind) = family.as_ref().expect("sample before its TYPE line");
            let suffix = name.strip_prefix(family_name.as_str()).unwrap_or_else(|| panic!("{line} outside {family_name}"));
            if kind == "histogram" {
                assert!(["_bucket", "_sum", "_count"].contains(&suffix), "{line}");
                assert_eq!(suffix == "_bucket", labels.iter().any(|(k, _)| k == "le"), "{line}");
            } else {
                assert_eq!(suffix, "", "{line}");
            }
            samples += 1;
        }
        assert!(samples > 0);
        assert!(text.contains("path=\"/a\\\"b\\\\c\\nd\""), "{text}");
    }
}
