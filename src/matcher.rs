//! Stat expectations evaluated against fetched stats
//!
//! The set of matchers is closed: exact values against the flat JSON
//! listing, labeled values against the Prometheus exposition, and a strict
//! upper bound against the flat listing.

use crate::stats::{MetricFamilies, MetricKind, StatsSnapshot, CLUSTERS_WARMING, LISTENERS_WARMING};
use std::collections::BTreeMap;
use thiserror::Error;

/// Expected value and labels of one Prometheus metric
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    pub value: i64,
    pub labels: BTreeMap<String, String>,
}

impl Stat {
    pub fn new(value: i64) -> Self {
        Self {
            value,
            labels: BTreeMap::new(),
        }
    }

    /// Add an expected label (builder pattern)
    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }
}

/// Which administrative stats endpoint an expectation reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsEndpoint {
    Json,
    Prometheus,
}

/// Stats fetched from one endpoint
#[derive(Debug, Clone, Copy)]
pub enum Observed<'a> {
    Flat(&'a StatsSnapshot),
    Families(&'a MetricFamilies),
}

/// Why one evaluation did not hold
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Mismatch {
    #[error("failed to find expected stat {name}")]
    Missing { name: String },

    #[error("stat {name} does not match, expected vs actual: {expected} vs {actual}")]
    Value {
        name: String,
        expected: i64,
        actual: f64,
    },

    #[error("metric {name} label {label} differs, got: {actual}, want: {expected}")]
    Label {
        name: String,
        label: String,
        expected: String,
        actual: String,
    },

    #[error("metric {name}: {missing} required labels missing")]
    MissingLabels { name: String, missing: usize },

    #[error("metric {name}: expected exactly one series, found {series}")]
    Cardinality { name: String, series: usize },

    #[error("metric {name}: unsupported type {kind}")]
    UnsupportedKind { name: String, kind: &'static str },

    #[error("stat {name} does not match, expected value < {bound}, actual stat value is {actual}")]
    NotLess { name: String, bound: i64, actual: i64 },

    #[error("still warming: listeners {listeners}, clusters {clusters}")]
    Warming { listeners: String, clusters: String },

    #[error("expectation reads the {expected:?} endpoint but was given {given:?} stats")]
    WrongEndpoint {
        expected: StatsEndpoint,
        given: StatsEndpoint,
    },
}

/// A named-metric assertion, constructed by a test body and evaluated transiently
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatExpectation {
    /// Every named stat equals its value; a missing stat counts as zero
    Exact(BTreeMap<String, i64>),
    /// Every named metric has exactly this value and labels
    Labeled(BTreeMap<String, Stat>),
    /// The named stat is present and strictly below the bound
    LessThan { name: String, bound: i64 },
}

impl StatExpectation {
    /// Exact expectation from `(name, value)` pairs
    pub fn exact<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, i64)>,
        S: Into<String>,
    {
        StatExpectation::Exact(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Labeled expectation from `(name, stat)` pairs
    pub fn labeled<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, Stat)>,
        S: Into<String>,
    {
        StatExpectation::Labeled(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn less_than(name: &str, bound: i64) -> Self {
        StatExpectation::LessThan {
            name: name.to_string(),
            bound,
        }
    }

    pub fn endpoint(&self) -> StatsEndpoint {
        match self {
            StatExpectation::Exact(_) | StatExpectation::LessThan { .. } => StatsEndpoint::Json,
            StatExpectation::Labeled(_) => StatsEndpoint::Prometheus,
        }
    }

    pub fn evaluate(&self, observed: Observed<'_>) -> Result<(), Mismatch> {
        match (self, observed) {
            (StatExpectation::Exact(expected), Observed::Flat(actual)) => {
                check_exact(expected, actual)
            }
            (StatExpectation::LessThan { name, bound }, Observed::Flat(actual)) => {
                check_less_than(name, *bound, actual)
            }
            (StatExpectation::Labeled(expected), Observed::Families(actual)) => {
                check_labeled(expected, actual)
            }
            (_, observed) => Err(Mismatch::WrongEndpoint {
                expected: self.endpoint(),
                given: observed.endpoint(),
            }),
        }
    }
}

impl Observed<'_> {
    pub fn endpoint(&self) -> StatsEndpoint {
        match self {
            Observed::Flat(_) => StatsEndpoint::Json,
            Observed::Families(_) => StatsEndpoint::Prometheus,
        }
    }
}

fn check_exact(expected: &BTreeMap<String, i64>, actual: &StatsSnapshot) -> Result<(), Mismatch> {
    for (name, &want) in expected {
        let got = match actual.get(name) {
            Some(got) => got,
            None if want == 0 => 0,
            None => return Err(Mismatch::Missing { name: name.clone() }),
        };
        if got != want {
            return Err(Mismatch::Value {
                name: name.clone(),
                expected: want,
                actual: got as f64,
            });
        }
    }
    Ok(())
}

fn check_less_than(name: &str, bound: i64, actual: &StatsSnapshot) -> Result<(), Mismatch> {
    let got = actual.get(name).ok_or_else(|| Mismatch::Missing {
        name: name.to_string(),
    })?;
    if got >= bound {
        return Err(Mismatch::NotLess {
            name: name.to_string(),
            bound,
            actual: got,
        });
    }
    Ok(())
}

fn check_labeled(expected: &BTreeMap<String, Stat>, actual: &MetricFamilies) -> Result<(), Mismatch> {
    for (name, want) in expected {
        let family = actual
            .get(name)
            .ok_or_else(|| Mismatch::Missing { name: name.clone() })?;

        match family.kind {
            MetricKind::Counter | MetricKind::Gauge => {}
            other => {
                return Err(Mismatch::UnsupportedKind {
                    name: name.clone(),
                    kind: other.as_str(),
                })
            }
        }
        if family.samples.len() != 1 {
            return Err(Mismatch::Cardinality {
                name: name.clone(),
                series: family.samples.len(),
            });
        }

        let sample = &family.samples[0];
        if sample.value != want.value as f64 {
            return Err(Mismatch::Value {
                name: name.clone(),
                expected: want.value,
                actual: sample.value,
            });
        }

        let mut found = 0;
        for (label, value) in &sample.labels {
            let Some(expected_value) = want.labels.get(label) else {
                continue;
            };
            if expected_value != value {
                return Err(Mismatch::Label {
                    name: name.clone(),
                    label: label.clone(),
                    expected: expected_value.clone(),
                    actual: value.clone(),
                });
            }
            found += 1;
        }
        if found != want.labels.len() {
            return Err(Mismatch::MissingLabels {
                name: name.clone(),
                missing: want.labels.len() - found,
            });
        }
    }
    Ok(())
}

/// Readiness holds once both warming stats are present and zero
pub fn check_warmed(actual: &StatsSnapshot) -> Result<(), Mismatch> {
    let listeners = actual.get(LISTENERS_WARMING);
    let clusters = actual.get(CLUSTERS_WARMING);
    if listeners == Some(0) && clusters == Some(0) {
        return Ok(());
    }
    let show = |v: Option<i64>| v.map_or_else(|| "absent".to_string(), |v| v.to_string());
    Err(Mismatch::Warming {
        listeners: show(listeners),
        clusters: show(clusters),
    })
}
