//! User-defined derived metrics.
//!
//! Metrics are an ordered list of `(name, function)` pairs. Each function sees
//! an immutable [`MetricScope`]: the configuration, the mean `time` in
//! milliseconds, the launch geometry and every metric computed before it.
//! Values are inserted in declaration order, so a metric can build on an
//! earlier one but never on a later one.

use crate::errors::{Result, TunerError};
use crate::expr::{Expr, Scope, Value};
use crate::feasibility::{LaunchGeometry, GEOMETRY_VARIABLES};
use crate::space::Configuration;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Metric values in declaration order. NaN round-trips through JSON as `null`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricValues(Vec<(String, f64)>);

impl MetricValues {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(n, v)| (n.as_str(), *v))
    }

    pub fn push(&mut self, name: &str, value: f64) {
        self.0.push((name.to_string(), value));
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for MetricValues {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, value) in &self.0 {
            let v = if value.is_nan() { None } else { Some(*value) };
            map.serialize_entry(name, &v)?;
        }
        map.end()
    }
}

struct MetricValuesVisitor;

impl<'de> Visitor<'de> for MetricValuesVisitor {
    type Value = MetricValues;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a map from metric name to number")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<MetricValues, A::Error> {
        let mut values = Vec::new();
        while let Some((name, value)) = access.next_entry::<String, Option<f64>>()? {
            values.push((name, value.unwrap_or(f64::NAN)));
        }
        Ok(MetricValues(values))
    }
}

impl<'de> Deserialize<'de> for MetricValues {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_map(MetricValuesVisitor)
    }
}

/// Read-only view handed to a metric function.
pub struct MetricScope<'a> {
    pub config: &'a Configuration,
    pub time_ms: f64,
    pub geometry: &'a LaunchGeometry,
    pub metrics: &'a MetricValues,
}

impl MetricScope<'_> {
    /// Numeric lookup: earlier metrics, `time`, geometry, then parameters.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.lookup(name).and_then(|v| v.as_f64())
    }
}

impl Scope for MetricScope<'_> {
    fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(v) = self.metrics.get(name) {
            return Some(Value::Float(v));
        }
        if name == "time" {
            return Some(Value::Float(self.time_ms));
        }
        self.geometry
            .lookup(name)
            .or_else(|| self.config.lookup(name))
    }
}

type MetricClosure = dyn Fn(&MetricScope) -> f64 + Send + Sync;

#[derive(Clone)]
enum MetricFn {
    Expr { source: String, expr: Expr },
    Closure(Arc<MetricClosure>),
}

/// Job-file representation of one metric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricEntry {
    pub name: String,
    pub expr: String,
}

#[derive(Clone, Default, Deserialize)]
#[serde(try_from = "Vec<MetricEntry>")]
pub struct Metrics {
    entries: Vec<(String, MetricFn)>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an expression metric, e.g. `"gflops", "2 * n / (time / 1e3) / 1e9"`.
    pub fn expr(mut self, name: &str, source: &str) -> Result<Self> {
        self.check_name(name)?;
        let expr = Expr::parse(source)?;
        self.entries.push((
            name.to_string(),
            MetricFn::Expr {
                source: source.to_string(),
                expr,
            },
        ));
        Ok(self)
    }

    pub fn closure<F>(mut self, name: &str, f: F) -> Result<Self>
    where
        F: Fn(&MetricScope) -> f64 + Send + Sync + 'static,
    {
        self.check_name(name)?;
        self.entries
            .push((name.to_string(), MetricFn::Closure(Arc::new(f))));
        Ok(self)
    }

    fn check_name(&self, name: &str) -> Result<()> {
        if name.is_empty() || name == "time" {
            return Err(TunerError::config(format!(
                "`{}` is not a valid metric name",
                name
            )));
        }
        if self.contains(name) {
            return Err(TunerError::config(format!(
                "metric `{}` is declared twice",
                name
            )));
        }
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every name an expression metric reads must be a parameter, `time`, a
    /// geometry variable or a metric declared before it.
    pub fn validate(&self, params: &[String]) -> Result<()> {
        for (i, (name, f)) in self.entries.iter().enumerate() {
            let MetricFn::Expr { source, expr } = f else {
                continue;
            };
            for var in expr.variables() {
                let earlier = self.entries[..i].iter().any(|(n, _)| *n == var);
                if earlier
                    || var == "time"
                    || GEOMETRY_VARIABLES.contains(&var.as_str())
                    || params.contains(&var)
                {
                    continue;
                }
                let later = self.entries[i..].iter().any(|(n, _)| *n == var);
                let msg = if later {
                    format!(
                        "metric `{}` (`{}`) reads `{}`, which is not computed before it",
                        name, source, var
                    )
                } else {
                    format!(
                        "metric `{}` (`{}`) references unknown name `{}`",
                        name, source, var
                    )
                };
                return Err(TunerError::config(msg));
            }
        }
        Ok(())
    }

    /// Evaluate every metric in declaration order.
    pub fn evaluate(
        &self,
        config: &Configuration,
        time_ms: f64,
        geometry: &LaunchGeometry,
    ) -> MetricValues {
        let mut values = MetricValues::default();
        for (name, f) in &self.entries {
            let scope = MetricScope {
                config,
                time_ms,
                geometry,
                metrics: &values,
            };
            let v = match f {
                MetricFn::Expr { source, expr } => match expr.eval_f64(&scope) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("metric `{}` = `{}` failed for [{}]: {}", name, source, config, e);
                        f64::NAN
                    }
                },
                MetricFn::Closure(f) => f(&scope),
            };
            values.push(name, v);
        }
        values
    }
}

impl TryFrom<Vec<MetricEntry>> for Metrics {
    type Error = TunerError;

    fn try_from(entries: Vec<MetricEntry>) -> Result<Self> {
        entries
            .into_iter()
            .try_fold(Metrics::new(), |m, e| m.expr(&e.name, &e.expr))
    }
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for (name, func) in &self.entries {
            match func {
                MetricFn::Expr { source, .. } => list.entry(&format_args!("{} = {}", name, source)),
                MetricFn::Closure(_) => list.entry(&format_args!("{} = <closure>", name)),
            };
        }
        list.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> LaunchGeometry {
        LaunchGeometry {
            block: [128, 1, 1],
            grid: [8, 1, 1],
            shared_memory: 0,
        }
    }

    #[test]
    fn later_metrics_see_earlier_values() {
        let metrics = Metrics::new()
            .expr("gflops", "1000 / time")
            .unwrap()
            .expr("double", "gflops * 2")
            .unwrap()
            .closure("triple", |s| s.get("gflops").unwrap_or(f64::NAN) * 3.0)
            .unwrap();
        let cfg = Configuration::from_pairs([("block_size_x", 128)]);
        let v = metrics.evaluate(&cfg, 2.0, &geometry());
        assert_eq!(v.get("gflops"), Some(500.0));
        assert_eq!(v.get("double"), Some(1000.0));
        assert_eq!(v.get("triple"), Some(1500.0));
        let order: Vec<&str> = v.iter().map(|(n, _)| n).collect();
        assert_eq!(order, vec!["gflops", "double", "triple"]);
    }

    #[test]
    fn forward_reference_is_rejected() {
        let metrics = Metrics::new()
            .expr("a", "b + 1")
            .unwrap()
            .expr("b", "time")
            .unwrap();
        let err = metrics.validate(&["block_size_x".to_string()]).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("not computed before"));
    }

    #[test]
    fn runtime_failure_yields_nan() {
        let metrics = Metrics::new().expr("bad", "1 / (block_size_x - 128)").unwrap();
        let cfg = Configuration::from_pairs([("block_size_x", 128)]);
        let v = metrics.evaluate(&cfg, 1.0, &geometry());
        assert!(v.get("bad").unwrap().is_nan());
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, r#"{"bad":null}"#);
        let back: MetricValues = serde_json::from_str(&json).unwrap();
        assert!(back.get("bad").unwrap().is_nan());
    }
}
