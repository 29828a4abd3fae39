//! Evaluates a parsed filter against one shard's indexes.
//!
//! Evaluation is post-order: children first, then the node combines their
//! bitmaps. The tree itself is never mutated, so one parsed filter can be
//! applied to every shard at once.

use std::ops::Bound;

use crate::bmap::Bitmap;
use crate::error::Error;
use crate::filter::{Cmp, FieldRef, Filter, Literal};
use crate::kv::{Dbi, KvRead};
use crate::mbmap::load_or_empty;
use crate::sindex::{bool_key, facet_key, number_key, number_prefix, NUMBER_KEY_LEN};
use crate::util::{hash32, number_facet_string};
use crate::DocId;

/// Documents matching `filter`. `universe` is the set `$ne` and `$nin`
/// invert against.
pub fn apply<T: KvRead>(filter: &Filter, txn: &T, universe: &Bitmap) -> Result<Bitmap, Error> {
    match filter {
        Filter::And(children) => {
            let mut iter = children.iter();
            let mut acc = match iter.next() {
                Some(first) => apply(first, txn, universe)?,
                None => return Ok(universe.clone()),
            };
            for child in iter {
                if acc.is_empty() {
                    break;
                }
                acc.and_inplace(&apply(child, txn, universe)?);
            }
            Ok(acc)
        }
        Filter::Or(children) => union(children, txn, universe),
        Filter::NotIn(children) => Ok(Bitmap::and_not(universe, &union(children, txn, universe)?)),
        Filter::Cmp { op, field, value } => match op {
            Cmp::Eq => eq(field, value, txn),
            Cmp::Ne => Ok(eq(field, value, txn)?.invert(universe)),
            Cmp::Gt | Cmp::Gte | Cmp::Lt | Cmp::Lte => {
                let v = match value {
                    Literal::Num(v) => *v,
                    _ => return Err(Error::invalid(format!("Number expected for field {}", field.path))),
                };
                let (from, to) = match op {
                    Cmp::Gt => (Bound::Excluded(v), Bound::Unbounded),
                    Cmp::Gte => (Bound::Included(v), Bound::Unbounded),
                    Cmp::Lt => (Bound::Unbounded, Bound::Excluded(v)),
                    _ => (Bound::Unbounded, Bound::Included(v)),
                };
                range(field, from, to, txn)
            }
        },
        Filter::Range { field, from, to } => range(field, *from, *to, txn),
    }
}

fn union<T: KvRead>(children: &[Filter], txn: &T, universe: &Bitmap) -> Result<Bitmap, Error> {
    let mut parts = Vec::with_capacity(children.len());
    for child in children {
        parts.push(apply(child, txn, universe)?);
    }
    let refs: Vec<&Bitmap> = parts.iter().collect();
    Ok(Bitmap::or(&refs))
}

fn eq<T: KvRead>(field: &FieldRef, value: &Literal, txn: &T) -> Result<Bitmap, Error> {
    match value {
        Literal::Str(s) => load_or_empty(txn, Dbi::FacetBmap, facet_key(hash32(s), field.f_priority)),
        Literal::Bool(b) => load_or_empty(txn, Dbi::BoolBmap, bool_key(*b, field.i_priority)),
        Literal::Num(v) if field.indexed => {
            let prefix = number_prefix(field.i_priority, *v);
            let mut out = Bitmap::new();
            txn.scan(Dbi::Numbers, Bound::Included(&prefix[..]), Bound::Unbounded, |k, _| {
                if !k.starts_with(&prefix) {
                    return Ok(false);
                }
                out.add(docid_of(k)?);
                Ok(true)
            })?;
            Ok(out)
        }
        Literal::Num(v) => {
            let id = hash32(&number_facet_string(*v));
            load_or_empty(txn, Dbi::FacetBmap, facet_key(id, field.f_priority))
        }
    }
}

fn docid_of(key: &[u8]) -> Result<DocId, Error> {
    if key.len() != NUMBER_KEY_LEN {
        return Err(Error::corrupt("bad numeric index key"));
    }
    Ok(u32::from_be_bytes([key[10], key[11], key[12], key[13]]))
}

fn range<T: KvRead>(field: &FieldRef, from: Bound<f64>, to: Bound<f64>, txn: &T) -> Result<Bitmap, Error> {
    if !field.indexed {
        return Err(Error::invalid(format!("Range filter on non-indexed field {}", field.path)));
    }
    let p = field.i_priority;
    let field_start = u16::from(p).to_be_bytes();
    let field_end = (u16::from(p) + 1).to_be_bytes();
    let low;
    let from_key = match from {
        Bound::Included(v) => {
            low = number_key(p, v, 0);
            Bound::Included(&low[..])
        }
        Bound::Excluded(v) => {
            low = number_key(p, v, DocId::max_value());
            Bound::Excluded(&low[..])
        }
        Bound::Unbounded => Bound::Included(&field_start[..]),
    };
    let high;
    let to_key = match to {
        Bound::Included(v) => {
            high = number_key(p, v, DocId::max_value());
            Bound::Included(&high[..])
        }
        Bound::Excluded(v) => {
            high = number_key(p, v, 0);
            Bound::Excluded(&high[..])
        }
        Bound::Unbounded => Bound::Excluded(&field_end[..]),
    };
    let mut out = Bitmap::new();
    if let (Some(a), Some(b)) = (bound_value(&from), bound_value(&to)) {
        if a > b {
            return Ok(out);
        }
    }
    txn.scan(Dbi::Numbers, from_key, to_key, |k, _| {
        out.add(docid_of(k)?);
        Ok(true)
    })?;
    Ok(out)
}

fn bound_value(b: &Bound<f64>) -> Option<f64> {
    match b {
        Bound::Included(v) | Bound::Excluded(v) => Some(*v),
        Bound::Unbounded => None,
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::analyzer::DefaultAnalyzer;
    use crate::config::Settings;
    use crate::mapping::Mapping;
    use crate::sindex::{ShardIndex, DOCS_KEY};
    use serde_json::{json, Value};
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        si: ShardIndex,
        mapping: Mapping,
        docs: Vec<Value>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let colors = ["red", "blue", "green"];
        let docs: Vec<Value> = (1..=30)
            .map(|i| {
                json!({
                    "color": colors[i % 3],
                    "likes": i,
                    "ok": i % 2 == 0,
                    "sizes": [i % 4, 10 + i % 5],
                })
            })
            .collect();
        let mut mapping = Mapping::new();
        for d in &docs {
            if let Value::Object(obj) = d {
                mapping.extract(obj);
            }
        }
        let settings = Settings {
            indexed_fields: vec!["likes".into(), "ok".into(), "sizes".into()],
            facet_fields: vec!["color".into()],
            ..Settings::default()
        };
        mapping.apply_config(&settings).unwrap();
        let si = ShardIndex::open(dir.path(), Box::new(DefaultAnalyzer), false).unwrap();
        let mut batch = si.batch(&mapping).unwrap();
        for (i, d) in docs.iter().enumerate() {
            batch.add(i as u32 + 1, d).unwrap();
        }
        batch.commit().unwrap();
        Fixture {
            _dir: dir,
            si,
            mapping,
            docs,
        }
    }

    impl Fixture {
        fn run(&self, filter: Value) -> BTreeSet<u32> {
            let f = Filter::parse(&filter, &self.mapping).unwrap();
            let txn = self.si.read().unwrap();
            let universe = load_or_empty(&txn, Dbi::Docs, DOCS_KEY).unwrap();
            apply(&f, &txn, &universe).unwrap().iter().collect()
        }

        fn brute<F: Fn(&Value) -> bool>(&self, pred: F) -> BTreeSet<u32> {
            self.docs
                .iter()
                .enumerate()
                .filter(|(_, d)| pred(d))
                .map(|(i, _)| i as u32 + 1)
                .collect()
        }
    }

    fn likes(d: &Value) -> f64 {
        d["likes"].as_f64().unwrap()
    }

    #[test]
    fn facet_and_bool_equality() {
        let f = fixture();
        assert_eq!(f.brute(|d| d["color"] == "red"), f.run(json!({"color": "red"})));
        assert_eq!(f.brute(|d| d["ok"] == true), f.run(json!({"ok": true})));
        assert_eq!(f.brute(|d| d["color"] != "red"), f.run(json!({"color": {"$ne": "red"}})));
        assert_eq!(
            f.brute(|d| d["color"] == "red" || d["color"] == "blue"),
            f.run(json!({"color": {"$in": ["red", "blue"]}}))
        );
        assert_eq!(
            f.brute(|d| d["color"] == "green"),
            f.run(json!({"color": {"$nin": ["red", "blue"]}}))
        );
        assert!(f.run(json!({"color": "purple"})).is_empty());
    }

    #[test]
    fn numeric_comparisons() {
        let f = fixture();
        assert_eq!(f.brute(|d| likes(d) == 7.0), f.run(json!({"likes": 7})));
        assert_eq!(f.brute(|d| likes(d) > 7.0), f.run(json!({"likes": {"$gt": 7}})));
        assert_eq!(f.brute(|d| likes(d) >= 7.0), f.run(json!({"likes": {"$gte": 7}})));
        assert_eq!(f.brute(|d| likes(d) < 7.0), f.run(json!({"likes": {"$lt": 7}})));
        assert_eq!(f.brute(|d| likes(d) <= 7.0), f.run(json!({"likes": {"$lte": 7}})));
        assert_eq!(
            f.brute(|d| likes(d) >= 5.0 && likes(d) < 12.0),
            f.run(json!({"likes": {"$gte": 5, "$lt": 12}}))
        );
        assert!(f.run(json!({"likes": {"$gte": 12, "$lt": 5}})).is_empty());
        assert_eq!(f.brute(|d| likes(d) != 7.0), f.run(json!({"likes": {"$ne": 7}})));
    }

    #[test]
    fn number_lists_match_any_value() {
        let f = fixture();
        let has = |d: &Value, v: f64| d["sizes"].as_array().unwrap().iter().any(|x| x.as_f64() == Some(v));
        assert_eq!(f.brute(|d| has(d, 3.0)), f.run(json!({"sizes": 3})));
        assert_eq!(
            f.brute(|d| has(d, 13.0) || has(d, 14.0)),
            f.run(json!({"sizes": {"$gt": 12, "$lt": 20}}))
        );
    }

    #[test]
    fn composition() {
        let f = fixture();
        assert_eq!(
            f.brute(|d| d["color"] == "red" && d["ok"] == true && likes(d) > 10.0),
            f.run(json!({"color": "red", "ok": true, "likes": {"$gt": 10}}))
        );
        assert_eq!(
            f.brute(|d| d["color"] == "red" || likes(d) < 3.0),
            f.run(json!({"$or": [{"color": "red"}, {"likes": {"$lt": 3}}]}))
        );
        assert_eq!(
            f.brute(|d| !(d["color"] == "red" || d["ok"] == true)),
            f.run(json!({"$nin": [{"color": "red"}, {"ok": true}]}))
        );
    }
}
