extern crate marlin;

#[cfg(test)]
#[macro_use]
extern crate serde_json;

#[cfg(test)]
extern crate tempfile;

#[cfg(test)]
mod tests {

    use marlin::kv::{Dbi, Store, INDEX_DBIS};
    use marlin::mbmap::encode_key;
    use marlin::{Error, Index, QueryRequest, QueryResponse, Settings};
    use serde_json::Value;
    use std::collections::{HashMap, HashSet};
    use std::path::Path;
    use tempfile::TempDir;

    const COLORS: [&str; 5] = ["red", "blue", "green", "black", "white"];
    const WORDS: [&str; 8] = ["river", "stone", "harbor", "lantern", "meadow", "copper", "violet", "summit"];

    fn settings(num_shards: usize) -> Settings {
        Settings {
            num_shards,
            indexed_fields: vec!["title".into(), "body".into(), "likes".into()],
            facet_fields: vec!["color".into(), "tag".into()],
            durable: false,
            ..Settings::default()
        }
    }

    fn doc(i: usize) -> Value {
        json!({
            "_id": format!("d{}", i),
            "title": format!("{} {}", WORDS[i % WORDS.len()], WORDS[(i / 3) % WORDS.len()]),
            "body": "plain text",
            "likes": (i * 7) % 100,
            "color": COLORS[i % COLORS.len()],
            "tag": format!("t{}", i),
        })
    }

    fn create(dir: &Path, settings: Settings, docs: Vec<Value>) -> Index {
        let index = Index::create(&dir.join("idx"), settings).unwrap();
        index.add_documents(docs).unwrap();
        index.wait_for_writes();
        index
    }

    fn search(index: &Index, req: Value) -> QueryResponse {
        index.search(&QueryRequest::from_json(&req).unwrap()).unwrap()
    }

    fn ids(res: &QueryResponse) -> Vec<String> {
        res.hits
            .iter()
            .map(|h| h["_id"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn facet_filter_matches_brute_force() {
        let dir = TempDir::new().unwrap();
        let docs: Vec<Value> = (0..10_000).map(doc).collect();
        let index = create(dir.path(), settings(4), docs.clone());
        assert_eq!(10_000, index.num_docs().unwrap());

        let res = search(
            &index,
            json!({"filter": {"color": {"$in": ["red", "blue"]}}, "facets": ["color"], "maxFacetResults": 10}),
        );
        let mut expected: HashMap<String, u64> = HashMap::new();
        for d in &docs {
            let color = d["color"].as_str().unwrap();
            if color == "red" || color == "blue" {
                *expected.entry(color.to_string()).or_insert(0) += 1;
            }
        }
        assert_eq!(expected.values().sum::<u64>(), res.total_hits);
        let facets = res.facets["color"].as_array().unwrap();
        assert_eq!(2, facets.len());
        for f in facets {
            let value = f["value"].as_str().unwrap();
            assert_eq!(expected[value], f["count"].as_u64().unwrap());
        }

        let res = search(&index, json!({"filter": {"tag": {"$nin": ["t1", "t2", "t3"]}}, "facets": []}));
        assert_eq!(9_997, res.total_hits);

        let res = search(
            &index,
            json!({"filter": {"$and": [{"color": "green"}, {"likes": {"$gte": 50, "$lt": 60}}]}}),
        );
        let brute = docs
            .iter()
            .filter(|d| {
                let likes = d["likes"].as_u64().unwrap();
                d["color"] == "green" && likes >= 50 && likes < 60
            })
            .count() as u64;
        assert_eq!(brute, res.total_hits);
    }

    #[test]
    fn many_distinct_facet_values_are_truncated() {
        let dir = TempDir::new().unwrap();
        let index = create(dir.path(), settings(2), (0..300).map(doc).collect());
        let res = search(&index, json!({"facets": ["tag"], "maxFacetResults": 5}));
        let tags = res.facets["tag"].as_array().unwrap();
        assert_eq!(5, tags.len());
        // all counts tie at one, so values come in order
        assert_eq!(json!({"value": "t0", "count": 1}), tags[0]);
        assert_eq!(json!({"value": "t10", "count": 1}), tags[2]);

        match index.search(&QueryRequest {
            facets: Some(vec!["nope".into()]),
            ..QueryRequest::default()
        }) {
            Err(Error::InvalidInput(msg)) => assert_eq!("Unknown facet field nope", msg),
            other => panic!("unexpected {:?}", other.map(|r| r.total_hits)),
        }
    }

    #[test]
    fn deleting_everything_leaves_no_hits_or_facets() {
        let dir = TempDir::new().unwrap();
        let docs: Vec<Value> = (0..50).map(doc).collect();
        let index = create(dir.path(), settings(3), docs);
        assert_eq!(50, search(&index, json!({})).total_hits);

        index
            .delete_documents((0..50).map(|i| format!("d{}", i)).collect())
            .unwrap();
        index.wait_for_writes();
        assert_eq!(0, index.num_docs().unwrap());
        for q in &["", "river", "stone harbor"] {
            let res = search(&index, json!({ "q": q, "facets": ["color"] }));
            assert_eq!(0, res.total_hits);
            assert!(res.hits.is_empty());
            assert_eq!(json!([]), res.facets["color"]);
        }

        index.add_documents(vec![doc(3)]).unwrap();
        index.wait_for_writes();
        assert_eq!(vec!["d3"], ids(&search(&index, json!({"q": "lantern"}))));
    }

    #[test]
    fn clear_then_reuse() {
        let dir = TempDir::new().unwrap();
        let index = create(dir.path(), settings(2), (0..20).map(doc).collect());
        index.clear().unwrap();
        index.wait_for_writes();
        assert_eq!(0, index.num_docs().unwrap());
        assert_eq!(0, search(&index, json!({"q": "river"})).total_hits);
        index.add_documents(vec![doc(0)]).unwrap();
        index.wait_for_writes();
        assert_eq!(1, search(&index, json!({"q": "river"})).total_hits);
    }

    #[test]
    fn paging() {
        let dir = TempDir::new().unwrap();
        let docs: Vec<Value> = (0..30)
            .map(|i| json!({"_id": i.to_string(), "title": "same words", "body": "b", "likes": i, "color": "red", "tag": "x"}))
            .collect();
        let index = create(dir.path(), settings(3), docs);

        let mut seen = HashSet::new();
        for page in 1..=3 {
            let res = search(&index, json!({"q": "same", "page": page, "hitsPerPage": 10}));
            assert_eq!(30, res.total_hits);
            assert_eq!(3, res.num_pages);
            assert_eq!(10, res.num_hits);
            seen.extend(ids(&res));
        }
        assert_eq!(30, seen.len());
        let res = search(&index, json!({"q": "same", "page": 4, "hitsPerPage": 10}));
        assert_eq!(0, res.num_hits);

        let res = search(&index, json!({"q": "same", "page": 3, "hitsPerPage": 10, "maxHits": 25}));
        assert_eq!(3, res.num_pages);
        assert_eq!(5, res.num_hits);

        assert!(QueryRequest::from_json(&json!({"page": 0})).is_err());
        assert!(QueryRequest::from_json(&json!({"bogus": 1})).is_err());
    }

    #[test]
    fn ranking_is_deterministic_and_follows_rules() {
        let dir = TempDir::new().unwrap();
        let mut s = settings(4);
        s.rank_by = Some("likes".into());
        let docs = vec![
            json!({"_id": "typo", "title": "lanturn", "likes": 100, "color": "red", "tag": "a"}),
            json!({"_id": "body", "title": "other", "body": "lantern", "likes": 90, "color": "red", "tag": "a"}),
            json!({"_id": "low", "title": "lantern", "likes": 1, "color": "red", "tag": "a"}),
            json!({"_id": "high", "title": "lantern", "likes": 50, "color": "red", "tag": "a"}),
        ];
        let index = create(dir.path(), s, docs);

        let first = ids(&search(&index, json!({"q": "lantern"})));
        assert_eq!(vec!["body", "high", "low", "typo"], first);
        for _ in 0..5 {
            assert_eq!(first, ids(&search(&index, json!({"q": "lantern"}))));
        }

        let res = search(&index, json!({"q": "lantern", "explain": true, "hitsPerPage": 1}));
        assert_eq!(json!(0), res.hits[0]["_rank"]["typos"]);
        assert_eq!(json!(1), res.hits[0]["_rank"]["field"]);

        let res = search(&index, json!({"q": "lantern", "rules": ["field", "typos"]}));
        assert_eq!(vec!["high", "low", "typo", "body"], ids(&res));
        assert!(index
            .search(&QueryRequest::from_json(&json!({"q": "x", "rules": ["loud"]})).unwrap())
            .is_err());
    }

    #[test]
    fn aggregations_through_search() {
        let dir = TempDir::new().unwrap();
        let docs: Vec<Value> = (0..40).map(doc).collect();
        let index = create(dir.path(), settings(3), docs.clone());
        let res = search(
            &index,
            json!({
                "q": "river",
                "aggs": {
                    "top": {"max": {"field": "likes"}},
                    "spread": {"stats": {"field": "likes"}},
                    "buckets": {"range": {"field": "likes", "ranges": [{"to": 50}, {"from": 50}]}}
                }
            }),
        );
        let matching: Vec<f64> = docs
            .iter()
            .filter(|d| d["title"].as_str().unwrap().split(' ').any(|w| w == "river"))
            .map(|d| d["likes"].as_f64().unwrap())
            .collect();
        assert_eq!(matching.len() as u64, res.total_hits);
        let max = matching.iter().cloned().fold(f64::MIN, f64::max);
        assert_eq!(json!({ "value": max }), res.aggs["top"]);
        assert_eq!(json!(matching.len()), res.aggs["spread"]["count"]);
        let below = matching.iter().filter(|&&v| v < 50.0).count();
        let buckets = res.aggs["buckets"]["buckets"].as_array().unwrap();
        assert_eq!(json!(below), buckets[0]["count"]);
        assert_eq!(json!(matching.len() - below), buckets[1]["count"]);

        assert!(QueryRequest::from_json(&json!({"aggs": {"x": {"max": {"field": "color"}}}}))
            .and_then(|r| index.search(&r))
            .is_err());
    }

    fn corrupt_universe(index_dir: &Path, shard: usize) {
        let kv = index_dir.join(format!("s_{}", shard)).join("index").join("index");
        let store = Store::open(&kv, INDEX_DBIS, false).unwrap();
        let txn = store.write().unwrap();
        txn.put(Dbi::Docs, &encode_key(0), &[0xFF]).unwrap();
        txn.commit().unwrap();
    }

    #[test]
    fn failing_shard_fails_the_query() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("idx");
        drop(create(dir.path(), settings(2), (0..10).map(doc).collect()));
        corrupt_universe(&path, 0);

        let index = Index::open(&path).unwrap();
        match index.search(&QueryRequest::new("river")) {
            Err(Error::ShardsFailed(errors)) => {
                assert_eq!(1, errors.len());
                match errors[0] {
                    Error::ShardFailed { shard, .. } => assert_eq!(0, shard),
                    ref other => panic!("unexpected {:?}", other),
                }
            }
            other => panic!("unexpected {:?}", other.map(|r| r.total_hits)),
        }
    }

    #[test]
    fn failing_single_shard() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("idx");
        drop(create(dir.path(), settings(1), (0..10).map(doc).collect()));
        corrupt_universe(&path, 0);

        let index = Index::open(&path).unwrap();
        match index.search(&QueryRequest::default()) {
            Err(Error::ShardFailed { shard: 0, error }) => match *error {
                Error::CorruptData(_) => {}
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other.map(|r| r.total_hits)),
        }
    }

    #[test]
    fn reopen_keeps_documents_and_mapping() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("idx");
        drop(create(dir.path(), settings(2), (0..20).map(doc).collect()));
        let index = Index::open(&path).unwrap();
        assert_eq!(20, index.num_docs().unwrap());
        assert_eq!(json!(true), index.mapping_json()["ready"]);
        assert_eq!(json!("river river"), index.get_document("d0").unwrap().unwrap()["title"]);
        assert!(search(&index, json!({"q": "river"})).total_hits > 0);
    }
}
