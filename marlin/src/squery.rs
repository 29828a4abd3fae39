//! Query execution on one shard: term lookup, set composition, filtering,
//! ranking, facet counting and aggregation.

use std::collections::HashMap;
use std::ops::Bound;
use std::time::Instant;

use crate::aggs::Aggs;
use crate::bmap::{Bitmap, Oper};
use crate::docrank::{DocRank, MatchedTerm, Ranker};
use crate::error::Error;
use crate::filter::Filter;
use crate::filter_apply;
use crate::kv::{Dbi, KvRead};
use crate::mbmap::load_or_empty;
use crate::query::{Query, Term, TermKind};
use crate::sindex::{doc_data, doc_words, lookup_facet, word_key, ShardIndex, DOCS_KEY, NUMBER_KEY_LEN};
use crate::sort::RankOrder;
use crate::DocId;

/// Zero typo documents are always examined if they are at most this many
/// times the hit limit.
const ZERO_TYPO_FACTOR: usize = 4;
/// The stride sample of the remaining candidates is about this many times
/// the hit limit.
const SAMPLE_FACTOR: usize = 4;

/// Everything a shard needs to run one query. Shared by all shards.
pub struct ShardQuery<'a> {
    pub query: &'a Query,
    pub filter: Option<&'a Filter>,
    /// Facet priorities to count.
    pub facets: &'a [u8],
    pub aggs: Option<&'a Aggs>,
    pub order: &'a RankOrder,
    /// Number priority of the custom ranking field.
    pub rank_by: Option<u8>,
    pub rank_asc: bool,
    /// How many ranked documents to keep.
    pub keep: usize,
    pub max_hits: usize,
    pub full_scan_threshold: usize,
    pub force_full_scan: bool,
}

#[derive(Debug)]
pub struct ShardHits {
    pub total: u64,
    /// Best first, at most `keep` long.
    pub ranks: Vec<DocRank>,
    /// Value to count, one map per requested facet.
    pub facets: Vec<HashMap<String, u64>>,
    pub aggs: Option<Aggs>,
    pub full_scan: bool,
}

impl<'a> ShardQuery<'a> {
    pub fn run(&self, si: &ShardIndex, shard: u16) -> Result<ShardHits, Error> {
        let started = Instant::now();
        let txn = si.read()?;
        let universe = load_or_empty(&txn, Dbi::Docs, DOCS_KEY)?;

        let mut matched = Vec::with_capacity(self.query.terms.len());
        let mut candidates = if self.query.is_empty() {
            universe.clone()
        } else {
            let mut docs = Vec::with_capacity(self.query.terms.len());
            let mut hits = Vec::with_capacity(self.query.terms.len());
            for term in &self.query.terms {
                let (m, d, hit) = lookup(si, &txn, term)?;
                matched.push(m);
                docs.push(d);
                hits.push(hit);
            }
            compose(self.query, &docs, &hits)
        };
        if let Some(filter) = self.filter {
            let allowed = filter_apply::apply(filter, &txn, &universe)?;
            candidates.and_inplace(&allowed);
        }
        let total = candidates.cardinality();

        let fast = !self.force_full_scan && self.rank_by.is_some() && total > self.full_scan_threshold as u64;
        let examined: Vec<DocId> = match self.rank_by {
            Some(priority) if fast => self.sample(&txn, &candidates, &matched, priority)?,
            _ => candidates.iter().collect(),
        };

        let ranker = Ranker::new(&matched, self.query.words.len(), shard);
        let mut aggs = self.aggs.cloned();
        let mut counts: Vec<HashMap<u32, u64>> = vec![HashMap::new(); self.facets.len()];
        let needs_data = self.rank_by.is_some() || !self.facets.is_empty() || aggs.is_some();
        let mut ranks = Vec::with_capacity(examined.len());
        for docid in examined {
            let blob = if self.query.is_empty() {
                None
            } else {
                doc_words(&txn, docid)?
            };
            let mut rank = ranker.rank(docid, blob.as_deref())?;
            if needs_data {
                if let Some(data) = doc_data(&txn, docid)? {
                    if let Some(p) = self.rank_by {
                        rank.comp = data.numbers.get(p as usize).cloned().unwrap_or(std::f64::NAN);
                    }
                    for (slot, &p) in self.facets.iter().enumerate() {
                        if let Some(ids) = data.facets.get(p as usize) {
                            for (i, id) in ids.iter().enumerate() {
                                if !ids[..i].contains(id) {
                                    *counts[slot].entry(*id).or_insert(0) += 1;
                                }
                            }
                        }
                    }
                    if let Some(ref mut a) = aggs {
                        a.consume(&data);
                    }
                }
            }
            ranks.push(rank);
        }
        let ranked = ranks.len();
        self.order.partial_sort(&mut ranks, self.keep);

        let mut facets = Vec::with_capacity(counts.len());
        for field in counts {
            let mut named = HashMap::with_capacity(field.len());
            for (id, count) in field {
                match lookup_facet(&txn, id)? {
                    Some(value) => *named.entry(value).or_insert(0) += count,
                    None => tracing::warn!(shard, facet_id = id, "facet id without a string"),
                }
            }
            facets.push(named);
        }

        tracing::debug!(
            shard,
            candidates = total,
            ranked,
            full_scan = !fast,
            elapsed_us = started.elapsed().as_micros() as u64,
            "shard query"
        );
        Ok(ShardHits {
            total,
            ranks,
            facets,
            aggs,
            full_scan: !fast,
        })
    }

    /// Picks a bounded subset of a large candidate set: the zero typo
    /// documents, the best documents by the ranking number and an even
    /// sample of the rest.
    fn sample<T: KvRead>(
        &self,
        txn: &T,
        candidates: &Bitmap,
        matched: &[MatchedTerm],
        priority: u8,
    ) -> Result<Vec<DocId>, Error> {
        let limit = self.max_hits.max(1);
        let mut picked = Bitmap::new();

        for exact in matched.iter().filter_map(|m| m.exact.as_ref()) {
            let zero = Bitmap::and(exact, candidates);
            if picked.cardinality() + zero.cardinality() <= (ZERO_TYPO_FACTOR * limit) as u64 {
                for docid in zero.iter() {
                    picked.add(docid);
                }
            }
        }

        let start = u16::from(priority).to_be_bytes();
        let end = (u16::from(priority) + 1).to_be_bytes();
        let mut taken = 0;
        let mut visit = |k: &[u8], _: &[u8]| {
            if k.len() != NUMBER_KEY_LEN {
                return Err(Error::corrupt("bad numeric index key"));
            }
            let docid = u32::from_be_bytes([k[10], k[11], k[12], k[13]]);
            if candidates.contains(docid) {
                picked.add(docid);
                taken += 1;
            }
            Ok(taken < limit)
        };
        let (from, to) = (Bound::Included(&start[..]), Bound::Excluded(&end[..]));
        if self.rank_asc {
            txn.scan(Dbi::Numbers, from, to, &mut visit)?;
        } else {
            txn.scan_rev(Dbi::Numbers, from, to, &mut visit)?;
        }

        let total = candidates.cardinality() as usize;
        let stride = (total / (SAMPLE_FACTOR * limit)).max(1);
        for (i, docid) in candidates.iter().enumerate() {
            if i % stride == 0 {
                picked.add(docid);
            }
        }
        Ok(picked.iter().collect())
    }
}

/// Resolves a term in the dictionary and loads its documents. The flag is
/// false when the dictionary knows nothing for it.
fn lookup<T: KvRead>(si: &ShardIndex, txn: &T, term: &Term) -> Result<(MatchedTerm, Bitmap, bool), Error> {
    let found = si.trie().lookup_term(&term.word, term.prefix, term.typos)?;
    let hit = !found.is_empty();
    let exact_wid = match term.kind {
        TermKind::Word(_) => si.trie().exact_lookup(&term.word)?.wid,
        _ => 0,
    };
    let mut wids = found.wids;
    let mut parts = Vec::with_capacity(wids.len() + 1);
    let mut exact = None;
    for &wid in wids.keys() {
        let docs = load_or_empty(txn, Dbi::WidDocs, word_key(wid, None))?;
        if wid == exact_wid {
            exact = Some(docs.clone());
        }
        parts.push(docs);
    }
    if let Some(twid) = found.twid {
        parts.push(load_or_empty(txn, Dbi::TwidDocs, word_key(twid, None))?);
        for wid in load_or_empty(txn, Dbi::TwidWids, word_key(twid, None))?.iter() {
            wids.entry(wid).or_insert(0);
        }
    }
    if exact.is_none() && exact_wid != 0 {
        exact = Some(load_or_empty(txn, Dbi::WidDocs, word_key(exact_wid, None))?);
    }
    let refs: Vec<&Bitmap> = parts.iter().collect();
    let docs = Bitmap::or(&refs);
    Ok((
        MatchedTerm {
            kind: term.kind,
            wids,
            exact,
        },
        docs,
        hit,
    ))
}

/// One word: its documents. More: the intersection of every word group
/// the dictionary knows anything for, plus the documents of the joined
/// words.
fn compose(query: &Query, docs: &[Bitmap], hits: &[bool]) -> Bitmap {
    if query.words.len() == 1 {
        return docs[0].clone();
    }
    let mut groups = Vec::with_capacity(query.words.len());
    for (i, group) in query.groups().iter().enumerate() {
        if !group.iter().any(|&t| hits[t]) {
            tracing::debug!(word = i, "dropping unknown word from query");
            continue;
        }
        let refs: Vec<&Bitmap> = group.iter().map(|&t| &docs[t]).collect();
        groups.push(Bitmap::or(&refs));
    }
    let mut oper = Oper::new();
    for g in &groups {
        oper.add(g);
    }
    let all = if oper.is_empty() { Bitmap::new() } else { oper.and() };
    match query.full_term() {
        Some(f) => Bitmap::or(&[&all, &docs[f]]),
        None => all,
    }
}
