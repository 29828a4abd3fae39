//! Per document ranking signals, computed from the word position blob.

use std::collections::HashMap;

use crate::blob::WordBlob;
use crate::bmap::Bitmap;
use crate::error::Error;
use crate::query::TermKind;
use crate::DocId;

pub const MISSING_TYPOS: u8 = 0xFF;
pub const MISSING_PROXIMITY: u16 = 0xFFFF;
pub const MISSING_POSITION: u16 = 0xFFFF;
pub const MISSING_FIELD: u8 = 0xFF;

/// Lower is better for every signal except `exact`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct DocRank {
    pub docid: DocId,
    pub shard: u16,
    pub typos: u8,
    pub proximity: u16,
    pub position: u16,
    pub exact: u8,
    pub field: u8,
    /// Value of the custom ranking number, NaN when absent.
    pub comp: f64,
}

impl DocRank {
    /// Signals of a document that matched no words, e.g. a pure filter.
    pub fn unranked(docid: DocId, shard: u16) -> DocRank {
        DocRank {
            docid,
            shard,
            comp: std::f64::NAN,
            ..DocRank::default()
        }
    }

    fn missing(docid: DocId, shard: u16) -> DocRank {
        DocRank {
            docid,
            shard,
            typos: MISSING_TYPOS,
            proximity: MISSING_PROXIMITY,
            position: MISSING_POSITION,
            exact: 0,
            field: MISSING_FIELD,
            comp: std::f64::NAN,
        }
    }
}

/// What one query term matched in the dictionary.
#[derive(Clone, Debug)]
pub struct MatchedTerm {
    pub kind: TermKind,
    /// Word id to edit distance.
    pub wids: HashMap<u32, u8>,
    /// Documents containing the word exactly, for single word terms.
    pub exact: Option<Bitmap>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Hit {
    distance: u8,
    priority: u8,
    position: u32,
}

impl Hit {
    fn better(self, other: Option<Hit>) -> Hit {
        match other {
            Some(o) if o < self => o,
            _ => self,
        }
    }
}

pub struct Ranker<'a> {
    terms: &'a [MatchedTerm],
    words: usize,
    shard: u16,
}

impl<'a> Ranker<'a> {
    pub fn new(terms: &'a [MatchedTerm], words: usize, shard: u16) -> Ranker<'a> {
        Ranker { terms, words, shard }
    }

    pub fn rank(&self, docid: DocId, blob: Option<&[u8]>) -> Result<DocRank, Error> {
        if self.words == 0 {
            return Ok(DocRank::unranked(docid, self.shard));
        }
        let blob = match blob {
            Some(buf) => WordBlob::parse(buf)?,
            None => return Ok(DocRank::missing(docid, self.shard)),
        };
        let n = self.words;
        let mut best: Vec<Option<Hit>> = vec![None; n];
        let mut positions: Vec<Vec<u64>> = vec![Vec::new(); n];
        let mut joined = vec![false; n.saturating_sub(1)];
        let mut full = false;

        for info in blob.infos() {
            for term in self.terms {
                let distance = match term.wids.get(&info.wid) {
                    Some(&d) => d,
                    None => continue,
                };
                let (priority, position) = blob.first(&info)?;
                let hit = Hit {
                    distance,
                    priority,
                    position,
                };
                match term.kind {
                    TermKind::Word(i) => {
                        best[i] = Some(hit.better(best[i]));
                        positions[i].extend(
                            blob.positions(&info)?
                                .into_iter()
                                .map(|(p, pos)| u64::from(p) << 32 | u64::from(pos)),
                        );
                    }
                    TermKind::Bigram(i) => {
                        joined[i] = true;
                        let hit = Hit { distance: 0, ..hit };
                        best[i] = Some(hit.better(best[i]));
                        best[i + 1] = Some(hit.better(best[i + 1]));
                        for (p, pos) in blob.positions(&info)? {
                            let at = u64::from(p) << 32 | u64::from(pos);
                            positions[i].push(at);
                            positions[i + 1].push(at);
                        }
                    }
                    TermKind::Full => {
                        full = true;
                        let hit = Hit { distance: 0, ..hit };
                        for b in best.iter_mut() {
                            *b = Some(hit.better(*b));
                        }
                    }
                }
            }
        }

        let mut exact = 0u8;
        for term in self.terms {
            if let (TermKind::Word(i), Some(bmap)) = (term.kind, &term.exact) {
                if bmap.contains(docid) {
                    exact = exact.saturating_add(1);
                    if let Some(ref mut hit) = best[i] {
                        hit.distance = 0;
                    }
                }
            }
        }

        let mut typos = 0u8;
        let mut top: Option<(u8, u32)> = None;
        for hit in best.iter().flatten() {
            typos = typos.saturating_add(hit.distance);
            let at = (hit.priority, hit.position);
            if top.map_or(true, |t| at < t) {
                top = Some(at);
            }
        }
        let (field, position) = match top {
            Some((f, p)) => (f, p.min(u32::from(MISSING_POSITION)) as u16),
            None => return Ok(DocRank::missing(docid, self.shard)),
        };

        // Only words found in this document take part, each paired with the
        // next found word.
        for p in positions.iter_mut() {
            p.sort_unstable();
        }
        let found: Vec<usize> = (0..n).filter(|&i| best[i].is_some()).collect();
        let mut proximity = 0u16;
        for pair in found.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            let step = if full || (b == a + 1 && joined[a]) {
                1
            } else {
                min_distance(&positions[a], &positions[b])
            };
            proximity = proximity.saturating_add(step);
        }

        Ok(DocRank {
            docid,
            shard: self.shard,
            typos,
            proximity,
            position,
            exact,
            field,
            comp: std::f64::NAN,
        })
    }
}

/// Smallest gap between two sorted position lists.
fn min_distance(a: &[u64], b: &[u64]) -> u16 {
    if a.is_empty() || b.is_empty() {
        return MISSING_PROXIMITY;
    }
    let (mut i, mut j) = (0, 0);
    let mut best = u64::max_value();
    while i < a.len() && j < b.len() {
        let (x, y) = (a[i], b[j]);
        best = best.min(if x > y { x - y } else { y - x });
        if x < y {
            i += 1;
        } else {
            j += 1;
        }
    }
    best.min(u64::from(MISSING_PROXIMITY)) as u16
}
