//! Filter DSL parsing.
//!
//! ```text
//! {"color": "red"}                            equality on a facet
//! {"color": {"$in": ["red", "blue"]}}         any of
//! {"likes": {"$gte": 10, "$lt": 20}}          numeric range
//! {"ok": {"$ne": true}}                       inverted equality
//! {"$or": [{"color": "red"}, {"likes": 3}]}   boolean composition
//! ```
//!
//! Several keys in one object are ANDed. A bare array is ANDed as well.

use serde_json::{Map, Value};
use std::ops::Bound;

use crate::error::Error;
use crate::mapping::{Field, FieldType, Mapping};

#[derive(Clone, Debug, PartialEq)]
pub enum Literal {
    Str(String),
    Num(f64),
    Bool(bool),
}

/// The parts of a schema field a filter needs at evaluation time.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldRef {
    pub path: String,
    pub ftype: FieldType,
    pub indexed: bool,
    pub facet: bool,
    pub i_priority: u8,
    pub f_priority: u8,
}

impl FieldRef {
    fn new(path: &str, field: &Field) -> FieldRef {
        FieldRef {
            path: path.to_string(),
            ftype: field.ftype,
            indexed: field.indexed,
            facet: field.facet,
            i_priority: field.i_priority,
            f_priority: field.f_priority,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cmp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    NotIn(Vec<Filter>),
    Cmp {
        op: Cmp,
        field: FieldRef,
        value: Literal,
    },
    Range {
        field: FieldRef,
        from: Bound<f64>,
        to: Bound<f64>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Oper {
    And,
    Or,
    NotIn,
    Cmp(Cmp),
}

fn operator(name: &str) -> Option<Oper> {
    Some(match name {
        "$eq" => Oper::Cmp(Cmp::Eq),
        "$ne" => Oper::Cmp(Cmp::Ne),
        "$and" => Oper::And,
        "$or" | "$in" => Oper::Or,
        "$nin" => Oper::NotIn,
        "$gt" => Oper::Cmp(Cmp::Gt),
        "$gte" => Oper::Cmp(Cmp::Gte),
        "$lt" => Oper::Cmp(Cmp::Lt),
        "$lte" => Oper::Cmp(Cmp::Lte),
        _ => return None,
    })
}

fn error(msg: &str, name: &str) -> Error {
    Error::invalid(format!("{} {}", msg, name))
}

impl Filter {
    pub fn parse(json: &Value, mapping: &Mapping) -> Result<Filter, Error> {
        let obj = match json {
            Value::Object(obj) => obj,
            _ => return Err(Error::invalid("Filter must be a JSON object")),
        };
        if mapping.index_schema().is_none() {
            return Err(Error::invalid("Index is not ready for filtering"));
        }
        parse_object(mapping, obj)
    }

    /// Number of nodes in the tree.
    pub fn size(&self) -> usize {
        match self {
            Filter::And(c) | Filter::Or(c) | Filter::NotIn(c) => 1 + c.iter().map(Filter::size).sum::<usize>(),
            _ => 1,
        }
    }
}

fn parse_object(mapping: &Mapping, obj: &Map<String, Value>) -> Result<Filter, Error> {
    let mut children = Vec::with_capacity(obj.len());
    for (key, value) in obj {
        children.push(parse_key(mapping, key, value)?);
    }
    if children.len() == 1 {
        Ok(children.remove(0))
    } else {
        Ok(Filter::And(children))
    }
}

fn parse_key(mapping: &Mapping, key: &str, value: &Value) -> Result<Filter, Error> {
    if let Some(field) = mapping.index_field(key) {
        return parse_value(&FieldRef::new(key, field), value);
    }
    let oper = match operator(key) {
        Some(op @ Oper::And) | Some(op @ Oper::Or) | Some(op @ Oper::NotIn) => op,
        _ => return Err(error("Invalid field or operator", key)),
    };
    let items = match value {
        Value::Array(items) => items,
        _ => return Err(error("Array expected for operator", key)),
    };
    let mut children = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::Object(obj) => children.push(parse_object(mapping, obj)?),
            _ => return Err(error("Object expected in", key)),
        }
    }
    Ok(compose(oper, children))
}

fn compose(oper: Oper, children: Vec<Filter>) -> Filter {
    match oper {
        Oper::Or => Filter::Or(children),
        Oper::NotIn => Filter::NotIn(children),
        _ => Filter::And(children),
    }
}

fn validate(field: &FieldRef, value: &Value) -> Result<(), Error> {
    match value {
        Value::String(_) => {
            if !field.ftype.is_string() {
                return Err(error("String value for non-string field", &field.path));
            }
            if !field.facet {
                return Err(error("String filter for non-faceted string field", &field.path));
            }
        }
        Value::Number(_) => {
            if !field.ftype.is_number() {
                return Err(error("Number value for non-numeric field", &field.path));
            }
        }
        Value::Bool(_) => {
            if field.ftype != FieldType::Boolean {
                return Err(error("Boolean value for non-boolean field", &field.path));
            }
            if !field.indexed {
                return Err(error("Boolean filter for non-indexed field", &field.path));
            }
        }
        _ => {}
    }
    Ok(())
}

fn literal(value: &Value) -> Option<Literal> {
    match value {
        Value::String(s) => Some(Literal::Str(s.clone())),
        Value::Number(n) => n.as_f64().map(Literal::Num),
        Value::Bool(b) => Some(Literal::Bool(*b)),
        _ => None,
    }
}

fn parse_value(field: &FieldRef, value: &Value) -> Result<Filter, Error> {
    validate(field, value)?;
    match value {
        Value::Object(obj) => parse_field_object(field, obj),
        Value::Array(items) => parse_array(field, items, Oper::And),
        _ => match literal(value) {
            Some(value) => Ok(Filter::Cmp {
                op: Cmp::Eq,
                field: field.clone(),
                value,
            }),
            None => Err(error("Json parse failure for field", &field.path)),
        },
    }
}

fn parse_array(field: &FieldRef, items: &[Value], oper: Oper) -> Result<Filter, Error> {
    let mut children = Vec::with_capacity(items.len());
    for item in items {
        children.push(parse_value(field, item)?);
    }
    Ok(compose(oper, children))
}

fn lower_bound(f: &Filter) -> Option<Bound<f64>> {
    match f {
        Filter::Cmp {
            op: Cmp::Gt,
            value: Literal::Num(v),
            ..
        } => Some(Bound::Excluded(*v)),
        Filter::Cmp {
            op: Cmp::Gte,
            value: Literal::Num(v),
            ..
        } => Some(Bound::Included(*v)),
        _ => None,
    }
}

fn upper_bound(f: &Filter) -> Option<Bound<f64>> {
    match f {
        Filter::Cmp {
            op: Cmp::Lt,
            value: Literal::Num(v),
            ..
        } => Some(Bound::Excluded(*v)),
        Filter::Cmp {
            op: Cmp::Lte,
            value: Literal::Num(v),
            ..
        } => Some(Bound::Included(*v)),
        _ => None,
    }
}

fn parse_field_object(field: &FieldRef, obj: &Map<String, Value>) -> Result<Filter, Error> {
    if obj.is_empty() {
        return Err(error("Failed to parse field", &field.path));
    }
    let mut children = Vec::with_capacity(obj.len());
    for (key, value) in obj {
        children.push(parse_operator(field, key, value)?);
    }
    if children.len() == 1 {
        return Ok(children.remove(0));
    }
    if field.ftype.is_number() && children.len() == 2 {
        let (a, b) = (&children[0], &children[1]);
        let bounds = match (lower_bound(a), upper_bound(b)) {
            (Some(from), Some(to)) => Some((from, to)),
            _ => match (lower_bound(b), upper_bound(a)) {
                (Some(from), Some(to)) => Some((from, to)),
                _ => None,
            },
        };
        if let Some((from, to)) = bounds {
            return Ok(Filter::Range {
                field: field.clone(),
                from,
                to,
            });
        }
    }
    Ok(Filter::And(children))
}

fn parse_operator(field: &FieldRef, key: &str, value: &Value) -> Result<Filter, Error> {
    validate(field, value)?;
    let invalid = || Error::invalid(format!("Invalid operator {} specified for field {}", key, field.path));
    let oper = operator(key).ok_or_else(invalid)?;
    match oper {
        Oper::Cmp(Cmp::Gt) | Oper::Cmp(Cmp::Gte) | Oper::Cmp(Cmp::Lt) | Oper::Cmp(Cmp::Lte) => {
            if !field.ftype.is_number() || !field.indexed {
                return Err(invalid());
            }
        }
        _ => {}
    }
    match (oper, value) {
        (Oper::And, Value::Array(items)) | (Oper::Or, Value::Array(items)) | (Oper::NotIn, Value::Array(items)) => {
            parse_array(field, items, oper)
        }
        (Oper::And, _) | (Oper::Or, _) | (Oper::NotIn, _) => Err(Error::invalid(format!(
            "Array expected for operator {} field {}",
            key, field.path
        ))),
        (Oper::Cmp(_), Value::Array(_)) => Err(Error::invalid(format!(
            "Array not expected for operator {} field {}",
            key, field.path
        ))),
        (Oper::Cmp(_), Value::Null) => Err(Error::invalid(format!(
            "NULL not expected for operator {} field {}",
            key, field.path
        ))),
        (Oper::Cmp(op), v) => match literal(v) {
            Some(value) => Ok(Filter::Cmp {
                op,
                field: field.clone(),
                value,
            }),
            None => Err(error("Failed to parse field", &field.path)),
        },
    }
}
