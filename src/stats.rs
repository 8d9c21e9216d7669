//! Parsing of administrative stats payloads
//!
//! Two shapes are consumed: the flat JSON listing
//! (`{"stats":[{"name":..,"value":..}]}`) and the Prometheus text exposition
//! format.

use crate::error::{HarnessError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Counter reporting listeners accepted but not yet active
pub const LISTENERS_WARMING: &str = "listener_manager.total_listeners_warming";
/// Gauge reporting clusters accepted but not yet active
pub const CLUSTERS_WARMING: &str = "cluster_manager.warming_clusters";

#[derive(Debug, Deserialize)]
struct StatsPayload {
    #[serde(default)]
    stats: Vec<StatEntry>,
}

#[derive(Debug, Deserialize)]
struct StatEntry {
    name: Option<String>,
    // Histogram entries carry no scalar value
    value: Option<serde_json::Value>,
}

/// Integer value of one stat. Non-numeric values are skipped, fractional ones rejected.
fn integer_value(name: &str, value: &serde_json::Value) -> Result<Option<i64>> {
    if let Some(v) = value.as_i64() {
        return Ok(Some(v));
    }
    if let Some(v) = value.as_u64() {
        return Ok(Some(i64::try_from(v).unwrap_or(i64::MAX)));
    }
    match value.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() <= i64::MAX as f64 => Ok(Some(f as i64)),
        Some(f) => Err(HarnessError::Parse(format!(
            "stat {} has non-integer value {}",
            name, f
        ))),
        None => Ok(None),
    }
}

/// Flat name to integer value view of the JSON stats listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    values: BTreeMap<String, i64>,
}

impl StatsSnapshot {
    pub fn parse_json(body: &str) -> Result<Self> {
        let payload: StatsPayload = serde_json::from_str(body)
            .map_err(|e| HarnessError::Parse(format!("stats JSON: {}", e)))?;

        let mut values = BTreeMap::new();
        for entry in payload.stats {
            let (Some(name), Some(value)) = (entry.name, entry.value) else {
                continue;
            };
            if let Some(value) = integer_value(&name, &value)? {
                values.insert(name, value);
            }
        }

        Ok(Self { values })
    }

    pub fn get(&self, name: &str) -> Option<i64> {
        self.values.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl FromIterator<(String, i64)> for StatsSnapshot {
    fn from_iter<I: IntoIterator<Item = (String, i64)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// Prometheus metric type as declared by `# TYPE`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
    Summary,
    Untyped,
}

impl MetricKind {
    fn parse(s: &str) -> Self {
        match s {
            "counter" => MetricKind::Counter,
            "gauge" => MetricKind::Gauge,
            "histogram" => MetricKind::Histogram,
            "summary" => MetricKind::Summary,
            _ => MetricKind::Untyped,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
            MetricKind::Summary => "summary",
            MetricKind::Untyped => "untyped",
        }
    }
}

/// One labeled sample of a metric family
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Full sample name (differs from the family for histogram/summary parts)
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub value: f64,
}

/// All samples sharing one metric name
#[derive(Debug, Clone, PartialEq)]
pub struct MetricFamily {
    pub name: String,
    pub kind: MetricKind,
    pub samples: Vec<Sample>,
}

/// Metric families keyed by name
pub type MetricFamilies = BTreeMap<String, MetricFamily>;

/// Parse the Prometheus text exposition format
pub fn parse_prometheus(text: &str) -> Result<MetricFamilies> {
    let mut families = MetricFamilies::new();

    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(comment) = line.strip_prefix('#') {
            let mut parts = comment.split_whitespace();
            if parts.next() == Some("TYPE") {
                if let (Some(name), Some(kind)) = (parts.next(), parts.next()) {
                    families
                        .entry(name.to_string())
                        .or_insert_with(|| MetricFamily {
                            name: name.to_string(),
                            kind: MetricKind::Untyped,
                            samples: Vec::new(),
                        })
                        .kind = MetricKind::parse(kind);
                }
            }
            continue;
        }

        let sample = parse_sample(line)
            .map_err(|e| HarnessError::Parse(format!("prometheus line {}: {}", lineno + 1, e)))?;
        let family_name = family_of(&families, &sample.name);
        families
            .entry(family_name.clone())
            .or_insert_with(|| MetricFamily {
                name: family_name,
                kind: MetricKind::Untyped,
                samples: Vec::new(),
            })
            .samples
            .push(sample);
    }

    Ok(families)
}

/// Histogram and summary parts belong to the family declared without their suffix
fn family_of(families: &MetricFamilies, sample_name: &str) -> String {
    for suffix in ["_bucket", "_sum", "_count"] {
        if let Some(base) = sample_name.strip_suffix(suffix) {
            if let Some(family) = families.get(base) {
                if matches!(family.kind, MetricKind::Histogram | MetricKind::Summary) {
                    return base.to_string();
                }
            }
        }
    }
    sample_name.to_string()
}

fn parse_sample(line: &str) -> std::result::Result<Sample, String> {
    let name_end = line
        .find(|c: char| c == '{' || c.is_whitespace())
        .ok_or_else(|| "missing value".to_string())?;
    let name = &line[..name_end];
    if name.is_empty() {
        return Err("missing metric name".to_string());
    }

    let mut rest = &line[name_end..];
    let mut labels = BTreeMap::new();
    if rest.starts_with('{') {
        let (parsed, remaining) = parse_labels(&rest[1..])?;
        labels = parsed;
        rest = remaining;
    }

    // Value, optionally followed by a timestamp
    let value_str = rest
        .split_whitespace()
        .next()
        .ok_or_else(|| format!("missing value for {}", name))?;
    let value = parse_value(value_str)?;

    Ok(Sample {
        name: name.to_string(),
        labels,
        value,
    })
}

fn parse_value(s: &str) -> std::result::Result<f64, String> {
    match s {
        "+Inf" | "Inf" => Ok(f64::INFINITY),
        "-Inf" => Ok(f64::NEG_INFINITY),
        "NaN" => Ok(f64::NAN),
        _ => s
            .parse::<f64>()
            .map_err(|_| format!("invalid sample value {:?}", s)),
    }
}

/// Parse `key="value",...}` and return the labels plus the text after `}`
fn parse_labels(mut s: &str) -> std::result::Result<(BTreeMap<String, String>, &str), String> {
    let mut labels = BTreeMap::new();

    loop {
        s = s.trim_start();
        if let Some(rest) = s.strip_prefix('}') {
            return Ok((labels, rest));
        }

        let eq = s.find('=').ok_or_else(|| "label without '='".to_string())?;
        let key = s[..eq].trim().to_string();
        s = s[eq + 1..].trim_start();
        let quoted = s
            .strip_prefix('"')
            .ok_or_else(|| format!("label {} value is not quoted", key))?;

        let mut value = String::new();
        let mut chars = quoted.char_indices();
        let mut end = None;
        while let Some((i, c)) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some((_, 'n')) => value.push('\n'),
                    Some((_, escaped)) => value.push(escaped),
                    None => break,
                },
                '"' => {
                    end = Some(i);
                    break;
                }
                c => value.push(c),
            }
        }
        let end = end.ok_or_else(|| format!("unterminated value for label {}", key))?;
        labels.insert(key, value);

        s = quoted[end + 1..].trim_start();
        if let Some(rest) = s.strip_prefix(',') {
            s = rest;
        }
    }
}
