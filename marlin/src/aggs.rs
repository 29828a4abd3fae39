//! Aggregations over the numbers of matched documents.
//!
//! Request shape:
//!
//! ```json
//! {
//!   "top": {"max": {"field": "likes"}},
//!   "buckets": {
//!     "range": {"field": "likes", "ranges": [{"to": 10}, {"from": 10, "key": "many"}]},
//!     "aggs": {"avg_likes": {"avg": {"field": "likes"}}}
//!   }
//! }
//! ```
//!
//! Every shard consumes its own documents into a copy of the parsed tree,
//! then the copies are merged.

use serde_json::{json, Map, Value};
use std::collections::HashSet;

use crate::blob::DocData;
use crate::error::Error;
use crate::mapping::{FieldType, Mapping};

pub trait Aggregator {
    fn consume(&mut self, data: &DocData);

    fn merge(&mut self, other: Self)
    where
        Self: Sized;

    fn to_json(&self) -> Value;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetricKind {
    Max,
    Min,
    Sum,
    Avg,
    Stats,
    Cardinality,
}

impl MetricKind {
    fn parse(name: &str) -> Option<MetricKind> {
        match name {
            "max" => Some(MetricKind::Max),
            "min" => Some(MetricKind::Min),
            "sum" => Some(MetricKind::Sum),
            "avg" => Some(MetricKind::Avg),
            "stats" => Some(MetricKind::Stats),
            "cardinality" => Some(MetricKind::Cardinality),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Metric {
    kind: MetricKind,
    priority: usize,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    distinct: HashSet<u64>,
}

impl Metric {
    fn new(kind: MetricKind, priority: usize) -> Metric {
        Metric {
            kind,
            priority,
            count: 0,
            sum: 0.0,
            min: std::f64::INFINITY,
            max: std::f64::NEG_INFINITY,
            distinct: HashSet::new(),
        }
    }

    fn value(&self) -> Value {
        if self.count == 0 {
            return match self.kind {
                MetricKind::Sum | MetricKind::Cardinality => json!(0),
                _ => Value::Null,
            };
        }
        match self.kind {
            MetricKind::Max => json!(self.max),
            MetricKind::Min => json!(self.min),
            MetricKind::Sum => json!(self.sum),
            MetricKind::Avg => json!(self.sum / self.count as f64),
            MetricKind::Cardinality => json!(self.distinct.len()),
            MetricKind::Stats => Value::Null,
        }
    }
}

impl Aggregator for Metric {
    fn consume(&mut self, data: &DocData) {
        let v = match data.number(self.priority) {
            Some(v) => v,
            None => return,
        };
        self.count += 1;
        self.sum += v;
        self.min = self.min.min(v);
        self.max = self.max.max(v);
        if self.kind == MetricKind::Cardinality {
            self.distinct.insert(v.to_bits());
        }
    }

    fn merge(&mut self, other: Metric) {
        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.distinct.extend(other.distinct);
    }

    fn to_json(&self) -> Value {
        if self.kind != MetricKind::Stats {
            return json!({ "value": self.value() });
        }
        if self.count == 0 {
            return json!({"count": 0, "min": null, "max": null, "sum": 0, "avg": null});
        }
        json!({
            "count": self.count,
            "min": self.min,
            "max": self.max,
            "sum": self.sum,
            "avg": self.sum / self.count as f64,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RangeBucket {
    key: String,
    from: Option<f64>,
    to: Option<f64>,
    count: u64,
    aggs: Aggs,
}

impl RangeBucket {
    fn holds(&self, v: f64) -> bool {
        self.from.map_or(true, |f| v >= f) && self.to.map_or(true, |t| v < t)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RangeAgg {
    priority: usize,
    buckets: Vec<RangeBucket>,
}

impl RangeAgg {
    fn parse(body: &Value, nested: Option<&Value>, mapping: &Mapping) -> Result<RangeAgg, Error> {
        let path = body.get("field").and_then(Value::as_str).unwrap_or("");
        let priority =
            number_priority(mapping, path).ok_or_else(|| Error::invalid(format!("Invalid field {} in ranges", path)))?;
        let ranges = match body.get("ranges") {
            Some(Value::Array(items)) => items,
            _ => return Err(Error::invalid("Failed to parse range aggr: ranges expected")),
        };
        let template = match nested {
            Some(n) => Aggs::parse(n, mapping)?,
            None => Aggs::default(),
        };
        let mut buckets = Vec::with_capacity(ranges.len());
        for r in ranges {
            let from = r.get("from").and_then(Value::as_f64);
            let to = r.get("to").and_then(Value::as_f64);
            if from.is_none() && to.is_none() {
                return Err(Error::invalid("From or to values missing in a range bucket"));
            }
            let key = match r.get("key") {
                Some(Value::String(k)) => k.clone(),
                _ => bucket_key(from, to),
            };
            buckets.push(RangeBucket {
                key,
                from,
                to,
                count: 0,
                aggs: template.clone(),
            });
        }
        Ok(RangeAgg { priority, buckets })
    }
}

fn bucket_key(from: Option<f64>, to: Option<f64>) -> String {
    let end = |v: Option<f64>| v.map_or_else(|| "*".to_string(), |v| format!("{:.6}", v));
    format!("{}-{}", end(from), end(to))
}

impl Aggregator for RangeAgg {
    fn consume(&mut self, data: &DocData) {
        let v = match data.number(self.priority) {
            Some(v) => v,
            None => return,
        };
        for b in self.buckets.iter_mut().filter(|b| b.holds(v)) {
            b.count += 1;
            b.aggs.consume(data);
        }
    }

    fn merge(&mut self, other: RangeAgg) {
        for (mine, theirs) in self.buckets.iter_mut().zip(other.buckets) {
            mine.count += theirs.count;
            mine.aggs.merge(theirs.aggs);
        }
    }

    fn to_json(&self) -> Value {
        let buckets: Vec<Value> = self
            .buckets
            .iter()
            .map(|b| {
                let mut obj = Map::new();
                obj.insert("key".into(), json!(b.key));
                obj.insert("count".into(), json!(b.count));
                if let Some(f) = b.from {
                    obj.insert("from".into(), json!(f));
                }
                if let Some(t) = b.to {
                    obj.insert("to".into(), json!(t));
                }
                for (name, agg) in &b.aggs.items {
                    obj.insert(name.clone(), agg.to_json());
                }
                Value::Object(obj)
            })
            .collect();
        json!({ "buckets": buckets })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Aggregation {
    Metric(Metric),
    Range(RangeAgg),
}

impl Aggregator for Aggregation {
    fn consume(&mut self, data: &DocData) {
        match self {
            Aggregation::Metric(m) => m.consume(data),
            Aggregation::Range(r) => r.consume(data),
        }
    }

    fn merge(&mut self, other: Aggregation) {
        match (self, other) {
            (Aggregation::Metric(a), Aggregation::Metric(b)) => a.merge(b),
            (Aggregation::Range(a), Aggregation::Range(b)) => a.merge(b),
            _ => {}
        }
    }

    fn to_json(&self) -> Value {
        match self {
            Aggregation::Metric(m) => m.to_json(),
            Aggregation::Range(r) => r.to_json(),
        }
    }
}

/// Named aggregations, in request order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Aggs {
    items: Vec<(String, Aggregation)>,
}

fn number_priority(mapping: &Mapping, path: &str) -> Option<usize> {
    match mapping.index_field(path) {
        Some(f) if f.indexed && f.ftype == FieldType::Number => Some(f.i_priority as usize),
        _ => None,
    }
}

impl Aggs {
    pub fn parse(json: &Value, mapping: &Mapping) -> Result<Aggs, Error> {
        let obj = match json {
            Value::Object(obj) => obj,
            _ => return Err(Error::invalid("Aggregations must be a JSON object")),
        };
        let mut items = Vec::with_capacity(obj.len());
        for (name, body) in obj {
            let def = match body {
                Value::Object(def) => def,
                _ => return Err(Error::invalid(format!("Could not parse agg {}", name))),
            };
            let (kind, inner) = def
                .iter()
                .find(|(k, _)| k.as_str() != "aggs")
                .ok_or_else(|| Error::invalid(format!("Could not parse agg {}", name)))?;
            let agg = if kind == "range" {
                Aggregation::Range(RangeAgg::parse(inner, def.get("aggs"), mapping)?)
            } else if let Some(mk) = MetricKind::parse(kind) {
                let path = inner.get("field").and_then(Value::as_str).unwrap_or("");
                let priority = number_priority(mapping, path)
                    .ok_or_else(|| Error::invalid(format!("Failed to parse {} aggr {}", kind, name)))?;
                Aggregation::Metric(Metric::new(mk, priority))
            } else {
                return Err(Error::invalid(format!("Could not parse agg {}", name)));
            };
            items.push((name.clone(), agg));
        }
        Ok(Aggs { items })
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn consume(&mut self, data: &DocData) {
        for (_, agg) in self.items.iter_mut() {
            agg.consume(data);
        }
    }

    /// Folds in the same aggregations computed elsewhere.
    pub fn merge(&mut self, other: Aggs) {
        for ((_, mine), (_, theirs)) in self.items.iter_mut().zip(other.items) {
            mine.merge(theirs);
        }
    }

    pub fn to_json(&self) -> Map<String, Value> {
        self.items.iter().map(|(name, agg)| (name.clone(), agg.to_json())).collect()
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::config::Settings;

    fn mapping() -> Mapping {
        let mut m = Mapping::new();
        let doc = json!({"likes": 1, "title": "x", "tags": [1, 2]});
        m.extract(doc.as_object().unwrap());
        let settings = Settings {
            indexed_fields: vec!["title".into(), "likes".into(), "tags".into()],
            ..Settings::default()
        };
        assert!(m.apply_config(&settings).unwrap());
        m
    }

    fn data(v: Option<f64>) -> DocData {
        let mut d = DocData::new(2, 0);
        if let Some(v) = v {
            d.numbers[0] = v;
        }
        d
    }

    fn run(req: Value, values: &[Option<f64>]) -> Map<String, Value> {
        let mut aggs = Aggs::parse(&req, &mapping()).unwrap();
        for v in values {
            aggs.consume(&data(*v));
        }
        aggs.to_json()
    }

    #[test]
    fn metrics() {
        let out = run(
            json!({
                "mx": {"max": {"field": "likes"}},
                "mn": {"min": {"field": "likes"}},
                "s": {"sum": {"field": "likes"}},
                "a": {"avg": {"field": "likes"}},
                "c": {"cardinality": {"field": "likes"}},
                "st": {"stats": {"field": "likes"}},
            }),
            &[Some(2.0), None, Some(4.0), Some(4.0)],
        );
        assert_eq!(json!({"value": 4.0}), out["mx"]);
        assert_eq!(json!({"value": 2.0}), out["mn"]);
        assert_eq!(json!({"value": 10.0}), out["s"]);
        assert_eq!(json!({"value": 10.0 / 3.0}), out["a"]);
        assert_eq!(json!({"value": 2}), out["c"]);
        assert_eq!(json!({"count": 3, "min": 2.0, "max": 4.0, "sum": 10.0, "avg": 10.0 / 3.0}), out["st"]);
    }

    #[test]
    fn empty_metrics() {
        let out = run(json!({"mx": {"max": {"field": "likes"}}, "s": {"sum": {"field": "likes"}}}), &[None]);
        assert_eq!(json!({"value": null}), out["mx"]);
        assert_eq!(json!({"value": 0}), out["s"]);
    }

    #[test]
    fn ranges_with_nested_metrics() {
        let out = run(
            json!({"r": {
                "range": {"field": "likes", "ranges": [{"to": 3}, {"from": 3, "to": 5, "key": "mid"}, {"from": 5}]},
                "aggs": {"top": {"max": {"field": "likes"}}}
            }}),
            &[Some(1.0), Some(3.0), Some(4.0), Some(5.0), None],
        );
        assert_eq!(
            json!({"buckets": [
                {"key": "*-3.000000", "count": 1, "to": 3.0, "top": {"value": 1.0}},
                {"key": "mid", "count": 2, "from": 3.0, "to": 5.0, "top": {"value": 4.0}},
                {"key": "5.000000-*", "count": 1, "from": 5.0, "top": {"value": 5.0}},
            ]}),
            out["r"]
        );
    }

    #[test]
    fn merge_across_shards() {
        let m = mapping();
        let req = json!({"a": {"avg": {"field": "likes"}}, "r": {"range": {"field": "likes", "ranges": [{"from": 0}]}}});
        let mut one = Aggs::parse(&req, &m).unwrap();
        let mut two = one.clone();
        one.consume(&data(Some(1.0)));
        two.consume(&data(Some(3.0)));
        two.consume(&data(Some(5.0)));
        one.merge(two);
        let out = one.to_json();
        assert_eq!(json!({"value": 3.0}), out["a"]);
        assert_eq!(json!(3), out["r"]["buckets"][0]["count"]);
    }

    #[test]
    fn parse_errors() {
        let m = mapping();
        let msg = |req: Value| match Aggs::parse(&req, &m) {
            Err(Error::InvalidInput(msg)) => msg,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!("Failed to parse max aggr x", msg(json!({"x": {"max": {"field": "title"}}})));
        assert_eq!("Failed to parse avg aggr x", msg(json!({"x": {"avg": {"field": "tags"}}})));
        assert_eq!("Could not parse agg x", msg(json!({"x": {"median": {"field": "likes"}}})));
        assert_eq!("Could not parse agg x", msg(json!({"x": 1})));
        assert_eq!("Invalid field nope in ranges", msg(json!({"x": {"range": {"field": "nope", "ranges": []}}})));
        assert_eq!(
            "From or to values missing in a range bucket",
            msg(json!({"x": {"range": {"field": "likes", "ranges": [{"key": "k"}]}}}))
        );
    }
}
