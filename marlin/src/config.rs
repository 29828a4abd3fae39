//! Index settings. Constructed by the caller, persisted next to the index
//! and handed to every component that needs it.

use serde_json::Value;
use std::fs::File;
use std::path::Path;

use crate::error::Error;
use crate::sort::Rule;

pub const SETTINGS_FILE: &str = "settings";
pub const MAX_SHARDS: usize = 256;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub num_shards: usize,
    /// Order gives the field priority, first is best.
    pub indexed_fields: Vec<String>,
    pub facet_fields: Vec<String>,
    pub hits_per_page: usize,
    pub max_hits: usize,
    pub max_facet_results: usize,
    pub rank_by: Option<String>,
    pub rank_asc: bool,
    pub rules: Vec<String>,
    pub prefix_search: bool,
    pub typos: bool,
    pub full_scan_threshold: usize,
    pub queue_length: usize,
    pub batch_size: usize,
    pub analyzer: String,
    pub id_field: String,
    pub durable: bool,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            num_shards: 1,
            indexed_fields: Vec::new(),
            facet_fields: Vec::new(),
            hits_per_page: 25,
            max_hits: 500,
            max_facet_results: 10,
            rank_by: None,
            rank_asc: false,
            rules: Rule::DEFAULT.iter().map(|r| r.name().to_string()).collect(),
            prefix_search: true,
            typos: true,
            full_scan_threshold: 10_000,
            queue_length: 1024,
            batch_size: 1000,
            analyzer: "default".to_string(),
            id_field: "_id".to_string(),
            durable: true,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), Error> {
        if self.num_shards == 0 || self.num_shards > MAX_SHARDS {
            return Err(Error::invalid(format!(
                "numShards must be between 1 and {}",
                MAX_SHARDS
            )));
        }
        if self.hits_per_page == 0 {
            return Err(Error::invalid("hitsPerPage must be positive"));
        }
        if self.batch_size == 0 || self.queue_length == 0 {
            return Err(Error::invalid("batchSize and queueLength must be positive"));
        }
        if self.indexed_fields.len() > 255 || self.facet_fields.len() > 255 {
            return Err(Error::invalid("Too many fields configured"));
        }
        Rule::parse_all(&self.rules)?;
        if self.id_field.is_empty() {
            return Err(Error::invalid("idField must not be empty"));
        }
        Ok(())
    }

    pub fn sort_rules(&self) -> Result<Vec<Rule>, Error> {
        Rule::parse_all(&self.rules)
    }

    /// Applies the keys of a JSON object on top of these settings.
    pub fn merged(&self, update: &Value) -> Result<Settings, Error> {
        let changes = match update {
            Value::Object(map) => map,
            _ => return Err(Error::invalid("Settings must be a JSON object")),
        };
        let mut current = serde_json::to_value(self)?;
        if let Value::Object(ref mut map) = current {
            for (key, value) in changes {
                if !map.contains_key(key) {
                    return Err(Error::invalid(format!("Unknown setting {}", key)));
                }
                map.insert(key.clone(), value.clone());
            }
        }
        let next: Settings = serde_json::from_value(current)
            .map_err(|e| Error::invalid(format!("Invalid settings: {}", e)))?;
        if next.num_shards != self.num_shards {
            return Err(Error::invalid("numShards cannot be changed"));
        }
        next.validate()?;
        Ok(next)
    }

    /// True if the change requires the index schema to be rebuilt.
    pub fn fields_changed(&self, other: &Settings) -> bool {
        self.indexed_fields != other.indexed_fields || self.facet_fields != other.facet_fields
    }
}

pub fn read_settings(path: &Path) -> Result<Settings, Error> {
    let file = File::open(path.join(SETTINGS_FILE))?;
    Ok(rmps::from_read(file)?)
}

pub fn write_settings(path: &Path, settings: &Settings) -> Result<(), Error> {
    let mut file = File::create(path.join(SETTINGS_FILE))?;
    Ok(rmps::encode::write_named(&mut file, settings)?)
}

#[cfg(test)]
mod tests {

    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_from_empty_json() {
        let s: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(Settings::default(), s);
        assert_eq!(vec!["typos", "proximity", "position", "exact"], s.rules);
        s.validate().unwrap();
    }

    #[test]
    fn camel_case_names() {
        let s: Settings =
            serde_json::from_str(r#"{"numShards": 3, "indexedFields": ["title"], "rankBy": "likes"}"#).unwrap();
        assert_eq!(3, s.num_shards);
        assert_eq!(vec!["title".to_string()], s.indexed_fields);
        assert_eq!(Some("likes".to_string()), s.rank_by);
    }

    #[test]
    fn merge_rejects_shard_change_and_unknown_keys() {
        let s = Settings::default();
        assert!(s.merged(&serde_json::json!({"numShards": 4})).is_err());
        assert!(s.merged(&serde_json::json!({"bogus": 1})).is_err());
        assert!(s.merged(&serde_json::json!({"rules": ["nope"]})).is_err());
        let m = s.merged(&serde_json::json!({"facetFields": ["color"]})).unwrap();
        assert!(s.fields_changed(&m));
        assert_eq!(25, m.hits_per_page);
    }

    #[test]
    fn persist_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut s = Settings::default();
        s.rank_by = Some("score".to_string());
        s.facet_fields.push("tags".to_string());
        write_settings(dir.path(), &s).unwrap();
        assert_eq!(s, read_settings(dir.path()).unwrap());
    }
}
