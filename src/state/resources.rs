//! Resource quantity arithmetic
//!
//! Kubernetes expresses requests and allocatable capacity as quantity strings
//! ("100m", "2", "512Mi"). The simulator needs to add, subtract, and compare
//! them, so everything is normalized to integer milli-units at parse time:
//! cpu "2" is 2000, memory "1Ki" is 1_024_000.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

/// Parse a Kubernetes quantity string into milli-units
pub fn parse_quantity(s: &str) -> Result<i64, crate::Error> {
    let s = s.trim();
    if s.is_empty() {
        return Err(crate::Error::validation("quantity cannot be empty"));
    }

    let split = s
        .find(|c: char| !c.is_ascii_digit() && c != '.' && c != '-')
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    let value: f64 = number
        .parse()
        .map_err(|_| crate::Error::validation(format!("invalid quantity '{s}'")))?;

    let scale: f64 = match suffix {
        "" => 1000.0,
        "m" => 1.0,
        "k" => 1000.0 * 1e3,
        "M" => 1000.0 * 1e6,
        "G" => 1000.0 * 1e9,
        "T" => 1000.0 * 1e12,
        "Ki" => 1000.0 * 1024.0,
        "Mi" => 1000.0 * 1024.0 * 1024.0,
        "Gi" => 1000.0 * 1024.0 * 1024.0 * 1024.0,
        "Ti" => 1000.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0,
        other => {
            return Err(crate::Error::validation(format!(
                "unknown quantity suffix '{other}' in '{s}'"
            )))
        }
    };

    Ok((value * scale).round() as i64)
}

/// A set of named resource quantities in milli-units
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Resources(BTreeMap<String, i64>);

impl Resources {
    /// Empty resource set
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(name, quantity-string)` pairs; used by tests and fixtures
    pub fn from_pairs<'a>(
        pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<Self, crate::Error> {
        let mut out = Self::new();
        for (name, quantity) in pairs {
            out.0.insert(name.to_string(), parse_quantity(quantity)?);
        }
        Ok(out)
    }

    /// Build from a Kubernetes resource list (requests, allocatable, ...)
    ///
    /// Unparseable quantities are skipped rather than failing the whole node;
    /// a node reporting a bad extended resource should not hide its cpu.
    pub fn from_resource_list(list: &BTreeMap<String, Quantity>) -> Self {
        let mut out = Self::new();
        for (name, quantity) in list {
            if let Ok(v) = parse_quantity(&quantity.0) {
                out.0.insert(name.clone(), v);
            }
        }
        out
    }

    /// Milli-units of a named resource, zero when absent
    pub fn get(&self, name: &str) -> i64 {
        self.0.get(name).copied().unwrap_or(0)
    }

    /// Set a named resource in milli-units
    pub fn set(&mut self, name: &str, value: i64) {
        self.0.insert(name.to_string(), value);
    }

    /// Whether no resources are recorded
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Add every quantity in `other` into self
    pub fn add(&mut self, other: &Resources) {
        for (name, value) in &other.0 {
            *self.0.entry(name.clone()).or_insert(0) += value;
        }
    }

    /// Take the element-wise maximum with `other`
    ///
    /// Daemon overhead for a group of nodes folds this way: the replacement
    /// runs each daemonset once, so the largest per-node footprint wins.
    pub fn max_with(&mut self, other: &Resources) {
        for (name, value) in &other.0 {
            let entry = self.0.entry(name.clone()).or_insert(0);
            *entry = (*entry).max(*value);
        }
    }

    /// Subtract every quantity in `other`, clamping at zero
    pub fn saturating_sub(&mut self, other: &Resources) {
        for (name, value) in &other.0 {
            let entry = self.0.entry(name.clone()).or_insert(0);
            *entry = (*entry - value).max(0);
        }
    }

    /// Whether `requests` fits inside self for every requested resource
    ///
    /// Resources absent from self are treated as zero capacity, so a pod
    /// requesting a GPU never fits a node that does not report one.
    pub fn fits(&self, requests: &Resources) -> bool {
        requests.0.iter().all(|(name, v)| self.get(name) >= *v)
    }
}
