//! Field schema discovered from documents and narrowed by configuration.
//!
//! Fields live in an arena: node 0 is the unnamed root, every other node
//! keeps its children as arena indices in insertion order. `full` holds
//! everything ever seen, `index` is rebuilt from `full` each time the
//! configuration is applied.

use serde_json::{Map, Value};
use std::fs::File;
use std::path::Path;

use crate::config::Settings;
use crate::error::Error;

pub const MAPPING_FILE: &str = "mapping";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Null,
    String,
    StrList,
    Number,
    NumList,
    Boolean,
    Object,
    ObjList,
    List,
}

impl FieldType {
    pub fn name(self) -> &'static str {
        match self {
            FieldType::Null => "null",
            FieldType::String => "string",
            FieldType::StrList => "string array",
            FieldType::Number => "number",
            FieldType::NumList => "number array",
            FieldType::Boolean => "boolean",
            FieldType::Object => "object",
            FieldType::ObjList => "object array",
            FieldType::List => "array",
        }
    }

    pub fn is_string(self) -> bool {
        self == FieldType::String || self == FieldType::StrList
    }

    pub fn is_number(self) -> bool {
        self == FieldType::Number || self == FieldType::NumList
    }

    pub fn is_object(self) -> bool {
        self == FieldType::Object || self == FieldType::ObjList
    }

    fn can_facet(self) -> bool {
        self.is_string() || self.is_number() || self.is_object()
    }

    fn of(value: &Value) -> FieldType {
        match value {
            Value::String(_) => FieldType::String,
            Value::Number(_) => FieldType::Number,
            Value::Bool(_) => FieldType::Boolean,
            Value::Object(_) => FieldType::Object,
            Value::Array(items) => match items.first() {
                Some(Value::String(_)) => FieldType::StrList,
                Some(Value::Number(_)) => FieldType::NumList,
                Some(Value::Object(_)) => FieldType::ObjList,
                Some(Value::Array(_)) => FieldType::List,
                _ => FieldType::Null,
            },
            Value::Null => FieldType::Null,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub ftype: FieldType,
    pub indexed: bool,
    pub facet: bool,
    pub field_id: u32,
    /// Position among indexed fields of the same kind.
    pub i_priority: u8,
    /// Position among facet fields.
    pub f_priority: u8,
    pub children: Vec<usize>,
}

impl Field {
    fn new(name: &str, field_id: u32) -> Field {
        Field {
            name: name.to_string(),
            ftype: FieldType::Null,
            indexed: false,
            facet: false,
            field_id,
            i_priority: 0,
            f_priority: 0,
            children: Vec::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Schema {
    nodes: Vec<Field>,
}

impl Default for Schema {
    fn default() -> Schema {
        Schema {
            nodes: vec![Field::new("", 0)],
        }
    }
}

impl Schema {
    pub const ROOT: usize = 0;

    pub fn field(&self, id: usize) -> &Field {
        &self.nodes[id]
    }

    pub fn children(&self, id: usize) -> &[usize] {
        &self.nodes[id].children
    }

    fn child_named(&self, parent: usize, name: &str) -> Option<usize> {
        self.nodes[parent]
            .children
            .iter()
            .cloned()
            .find(|&c| self.nodes[c].name == name)
    }

    /// Resolves a top level name or a dotted path.
    pub fn find(&self, path: &str) -> Option<usize> {
        if let Some(id) = self.child_named(Schema::ROOT, path) {
            return Some(id);
        }
        if !path.contains('.') {
            return None;
        }
        let mut node = Schema::ROOT;
        for part in path.split('.') {
            node = self.child_named(node, part)?;
        }
        Some(node)
    }

    /// The arena path from the root to `id`, excluding the root.
    fn ancestors(&self, id: usize) -> Vec<usize> {
        let mut parent = vec![usize::max_value(); self.nodes.len()];
        for (i, f) in self.nodes.iter().enumerate() {
            for &c in &f.children {
                parent[c] = i;
            }
        }
        let mut path = Vec::new();
        let mut cur = id;
        while cur != Schema::ROOT && cur < parent.len() {
            path.push(cur);
            cur = parent[cur];
        }
        path.reverse();
        path
    }

    fn add_child(&mut self, parent: usize, field: Field) -> usize {
        let id = self.nodes.len();
        self.nodes.push(field);
        self.nodes[parent].children.push(id);
        id
    }

    fn to_json(&self, id: usize) -> Value {
        let mut out = Map::new();
        for &c in self.children(id) {
            let f = self.field(c);
            let mut node = Map::new();
            node.insert("type".into(), Value::from(f.ftype.name()));
            node.insert("fieldId".into(), Value::from(f.field_id));
            if f.ftype.is_object() {
                node.insert("properties".into(), self.to_json(c));
            }
            if f.indexed {
                node.insert("isIndexed".into(), Value::Bool(true));
            }
            if f.facet {
                node.insert("isFacet".into(), Value::Bool(true));
            }
            out.insert(f.name.clone(), Value::Object(node));
        }
        Value::Object(out)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FacetInfo {
    pub name: String,
    pub ftype: FieldType,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Mapping {
    full: Schema,
    index: Option<Schema>,
    num_fields: u32,
    /// Indexed field paths per kind, in priority order.
    pub strings: Vec<String>,
    pub numbers: Vec<String>,
    pub bools: Vec<String>,
    pub facets: Vec<FacetInfo>,
}

impl Mapping {
    pub fn new() -> Mapping {
        Mapping::default()
    }

    pub fn full_schema(&self) -> &Schema {
        &self.full
    }

    pub fn index_schema(&self) -> Option<&Schema> {
        self.index.as_ref()
    }

    pub fn ready_to_index(&self) -> bool {
        self.index.is_some()
    }

    /// Learns the fields of a document. Returns true if anything changed.
    pub fn extract(&mut self, doc: &Map<String, Value>) -> bool {
        self.extract_under(Schema::ROOT, doc)
    }

    fn extract_under(&mut self, parent: usize, obj: &Map<String, Value>) -> bool {
        let mut updated = false;
        for (key, value) in obj {
            let child = match self.full.child_named(parent, key) {
                Some(c) => c,
                None => {
                    self.num_fields += 1;
                    updated = true;
                    self.full.add_child(parent, Field::new(key, self.num_fields))
                }
            };
            let ftype = self.full.nodes[child].ftype;
            if ftype == FieldType::Null {
                let learnt = FieldType::of(value);
                if learnt != FieldType::Null {
                    self.full.nodes[child].ftype = learnt;
                    updated = true;
                }
            }
            let inner = match (self.full.nodes[child].ftype, value) {
                (FieldType::Object, Value::Object(o)) => Some(o),
                (FieldType::ObjList, Value::Array(items)) | (FieldType::List, Value::Array(items)) => {
                    match items.first() {
                        Some(Value::Object(o)) => Some(o),
                        _ => None,
                    }
                }
                _ => None,
            };
            if let Some(o) = inner {
                updated |= self.extract_under(child, o);
            }
        }
        updated
    }

    /// Marks configured fields and builds the index schema. Returns false,
    /// and drops any previous index schema, while some configured field has
    /// no known type yet.
    pub fn apply_config(&mut self, settings: &Settings) -> Result<bool, Error> {
        let mut indexed = Vec::with_capacity(settings.indexed_fields.len());
        for name in &settings.indexed_fields {
            match self.full.find(name) {
                Some(id) if self.full.nodes[id].ftype != FieldType::Null => indexed.push(id),
                _ => {
                    self.index = None;
                    return Ok(false);
                }
            }
        }
        let mut facets = Vec::with_capacity(settings.facet_fields.len());
        for name in &settings.facet_fields {
            match self.full.find(name) {
                Some(id) if self.full.nodes[id].ftype != FieldType::Null => {
                    let ftype = self.full.nodes[id].ftype;
                    if !ftype.can_facet() {
                        return Err(Error::invalid(format!(
                            "Field {} of type {} cannot be a facet",
                            name,
                            ftype.name()
                        )));
                    }
                    facets.push(id)
                }
                _ => {
                    self.index = None;
                    return Ok(false);
                }
            }
        }

        for f in self.full.nodes.iter_mut() {
            f.indexed = false;
            f.facet = false;
            f.i_priority = 0;
            f.f_priority = 0;
        }
        self.strings.clear();
        self.numbers.clear();
        self.bools.clear();
        self.facets.clear();

        for (name, &id) in settings.indexed_fields.iter().zip(indexed.iter()) {
            let f = &mut self.full.nodes[id];
            f.indexed = true;
            let group = match f.ftype {
                FieldType::String | FieldType::StrList => Some(&mut self.strings),
                FieldType::Number | FieldType::NumList => Some(&mut self.numbers),
                FieldType::Boolean => Some(&mut self.bools),
                _ => None,
            };
            if let Some(group) = group {
                f.i_priority = group.len() as u8;
                group.push(name.clone());
            }
        }
        for (name, &id) in settings.facet_fields.iter().zip(facets.iter()) {
            let f = &mut self.full.nodes[id];
            f.facet = true;
            f.f_priority = self.facets.len() as u8;
            self.facets.push(FacetInfo {
                name: name.clone(),
                ftype: f.ftype,
            });
        }

        let mut keep = vec![false; self.full.nodes.len()];
        for &id in indexed.iter().chain(facets.iter()) {
            for a in self.full.ancestors(id) {
                keep[a] = true;
            }
        }
        let mut index = Schema::default();
        copy_kept(&self.full, Schema::ROOT, &keep, &mut index, Schema::ROOT);
        self.index = Some(index);
        Ok(true)
    }

    /// Looks a configured field up in the index schema.
    pub fn index_field(&self, path: &str) -> Option<&Field> {
        let schema = self.index.as_ref()?;
        schema.find(path).map(|id| schema.field(id))
    }

    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "fullSchema": self.full.to_json(Schema::ROOT),
            "indexSchema": match self.index {
                Some(ref s) => s.to_json(Schema::ROOT),
                None => Value::Null,
            },
            "ready": self.ready_to_index(),
        })
    }
}

fn copy_kept(from: &Schema, fid: usize, keep: &[bool], to: &mut Schema, tid: usize) {
    for &c in from.children(fid) {
        if !keep[c] {
            continue;
        }
        let mut field = from.field(c).clone();
        field.children = Vec::new();
        let nid = to.add_child(tid, field);
        copy_kept(from, c, keep, to, nid);
    }
}

pub fn read_mapping(path: &Path) -> Result<Option<Mapping>, Error> {
    let file = match File::open(path.join(MAPPING_FILE)) {
        Ok(file) => file,
        Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(rmps::from_read(file)?))
}

pub fn write_mapping(path: &Path, mapping: &Mapping) -> Result<(), Error> {
    let mut file = File::create(path.join(MAPPING_FILE))?;
    Ok(rmps::encode::write_named(&mut file, mapping)?)
}

#[cfg(test)]
mod tests {

    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    fn settings(indexed: &[&str], facets: &[&str]) -> Settings {
        Settings {
            indexed_fields: indexed.iter().map(|s| s.to_string()).collect(),
            facet_fields: facets.iter().map(|s| s.to_string()).collect(),
            ..Settings::default()
        }
    }

    #[test]
    fn infers_types() {
        let mut m = Mapping::new();
        assert!(m.extract(&obj(json!({
            "title": "x", "likes": 3, "ok": true, "tags": ["a"], "nums": [1.5],
            "meta": {"author": "me"}, "refs": [{"url": "u"}], "empty": [], "nothing": null
        }))));
        let s = m.full_schema();
        let t = |p: &str| s.field(s.find(p).unwrap()).ftype;
        assert_eq!(FieldType::String, t("title"));
        assert_eq!(FieldType::Number, t("likes"));
        assert_eq!(FieldType::Boolean, t("ok"));
        assert_eq!(FieldType::StrList, t("tags"));
        assert_eq!(FieldType::NumList, t("nums"));
        assert_eq!(FieldType::Object, t("meta"));
        assert_eq!(FieldType::String, t("meta.author"));
        assert_eq!(FieldType::ObjList, t("refs"));
        assert_eq!(FieldType::String, t("refs.url"));
        assert_eq!(FieldType::Null, t("empty"));
        assert_eq!(FieldType::Null, t("nothing"));
        assert!(!m.extract(&obj(json!({"title": "y"}))));
        assert!(m.extract(&obj(json!({"empty": ["now"]}))));
        assert_eq!(FieldType::StrList, t_of(&m, "empty"));
    }

    fn t_of(m: &Mapping, p: &str) -> FieldType {
        let s = m.full_schema();
        s.field(s.find(p).unwrap()).ftype
    }

    #[test]
    fn field_ids_are_sequential() {
        let mut m = Mapping::new();
        m.extract(&obj(json!({"a": 1, "b": {"c": 2}})));
        let s = m.full_schema();
        let ids: Vec<u32> = ["a", "b", "b.c"].iter().map(|p| s.field(s.find(p).unwrap()).field_id).collect();
        assert_eq!(vec![1, 2, 3], ids);
    }

    #[test]
    fn apply_config_assigns_priorities() {
        let mut m = Mapping::new();
        m.extract(&obj(json!({"title": "t", "body": "b", "likes": 1, "ok": false, "color": "red", "meta": {"lang": "en"}})));
        assert!(!m.apply_config(&settings(&["title", "missing"], &[])).unwrap());
        assert!(!m.ready_to_index());
        assert!(m
            .apply_config(&settings(&["body", "likes", "title", "ok", "meta.lang"], &["color", "likes"]))
            .unwrap());
        assert_eq!(vec!["body", "title", "meta.lang"], m.strings);
        assert_eq!(vec!["likes"], m.numbers);
        assert_eq!(vec!["ok"], m.bools);
        assert_eq!(1, m.index_field("title").unwrap().i_priority);
        assert_eq!(2, m.index_field("meta.lang").unwrap().i_priority);
        assert_eq!(1, m.index_field("likes").unwrap().f_priority);
        assert!(m.index_field("likes").unwrap().indexed);
        assert!(m.index_field("meta").is_some());
        let idx = m.index_schema().unwrap();
        assert_eq!(7, idx.children(Schema::ROOT).len() + idx.children(idx.find("meta").unwrap()).len());
    }

    #[test]
    fn facet_on_boolean_is_rejected() {
        let mut m = Mapping::new();
        m.extract(&obj(json!({"ok": true})));
        assert!(m.apply_config(&settings(&[], &["ok"])).is_err());
    }

    #[test]
    fn reapply_rebuilds_index_schema() {
        let mut m = Mapping::new();
        m.extract(&obj(json!({"a": "x", "b": "y"})));
        m.apply_config(&settings(&["a"], &[])).unwrap();
        m.apply_config(&settings(&["b"], &[])).unwrap();
        assert!(m.index_field("a").is_none());
        assert_eq!(0, m.index_field("b").unwrap().i_priority);
        let json = m.to_json();
        assert_eq!(json!(true), json["ready"]);
        assert_eq!(json!(true), json["fullSchema"]["b"]["isIndexed"]);
        assert!(json["fullSchema"]["a"].get("isIndexed").is_none());
    }

    #[test]
    fn unknown_configured_field_unreadies() {
        let mut m = Mapping::new();
        m.extract(&obj(json!({"a": "x"})));
        assert!(m.apply_config(&settings(&["a"], &[])).unwrap());
        assert!(!m.apply_config(&settings(&["a", "later"], &[])).unwrap());
        assert!(!m.ready_to_index());
    }
}
