//! Per document binary blobs.
//!
//! Word positions:
//!
//! ```text
//! u16 word count
//! word count x { u32 wid, u8 single, u8 priority, u32 position or offset }
//! per multi word, at its offset:
//!     u8 frequency
//!     per priority { u8 priority, u8 count, count x vint position, 0xFF }
//! ```
//!
//! A word seen once keeps its position inline. Records are sorted by wid.
//!
//! Numbers and facets:
//!
//! ```text
//! u16 number count, u16 facet count
//! number count x f64
//! facet count x { u32 count, count x u32 facet id }
//! ```
//!
//! All integers are little endian.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::io::Cursor;

use crate::error::Error;
use crate::util::{read_vint, write_vint};

const INFO_SIZE: usize = 10;
const GROUP_END: u8 = 0xFF;
/// Frequency and group counts are single bytes.
pub const MAX_POSITIONS: usize = 255;

/// Collects `(wid, priority, position)` triples for one document.
#[derive(Debug, Default)]
pub struct WordBlobBuilder {
    positions: Vec<(u32, u8, u32)>,
}

impl WordBlobBuilder {
    pub fn new() -> WordBlobBuilder {
        WordBlobBuilder::default()
    }

    pub fn add(&mut self, wid: u32, priority: u8, position: u32) {
        self.positions.push((wid, priority, position));
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn clear(&mut self) {
        self.positions.clear();
    }

    pub fn encode(&mut self) -> Result<Vec<u8>, Error> {
        self.positions.sort_unstable();
        self.positions.dedup();
        let mut words: Vec<&[(u32, u8, u32)]> = Vec::new();
        let mut start = 0;
        for i in 1..=self.positions.len() {
            if i == self.positions.len() || self.positions[i].0 != self.positions[start].0 {
                let end = i.min(start + MAX_POSITIONS);
                words.push(&self.positions[start..end]);
                start = i;
            }
        }
        if words.len() > usize::from(u16::max_value()) {
            return Err(Error::invalid("too many distinct words in document"));
        }
        let head = 2 + words.len() * INFO_SIZE;
        let mut out = Vec::with_capacity(head + self.positions.len() * 2);
        out.write_u16::<LittleEndian>(words.len() as u16)?;
        out.resize(head, 0);
        for (i, word) in words.iter().enumerate() {
            let at = 2 + i * INFO_SIZE;
            let (wid, priority, position) = word[0];
            LittleEndian::write_u32(&mut out[at..at + 4], wid);
            if word.len() == 1 {
                out[at + 4] = 1;
                out[at + 5] = priority;
                LittleEndian::write_u32(&mut out[at + 6..at + 10], position);
                continue;
            }
            let offset = out.len() as u32;
            out[at + 4] = 0;
            out[at + 5] = 0;
            LittleEndian::write_u32(&mut out[at + 6..at + 10], offset);
            out.push(word.len() as u8);
            for group in word.chunk_by_priority() {
                out.push(group[0].1);
                out.push(group.len() as u8);
                for &(_, _, pos) in group {
                    write_vint(&mut out, u64::from(pos))?;
                }
                out.push(GROUP_END);
            }
        }
        Ok(out)
    }
}

trait ChunkByPriority {
    fn chunk_by_priority(&self) -> Vec<&[(u32, u8, u32)]>;
}

impl ChunkByPriority for [(u32, u8, u32)] {
    fn chunk_by_priority(&self) -> Vec<&[(u32, u8, u32)]> {
        let mut out = Vec::new();
        let mut start = 0;
        for i in 1..=self.len() {
            if i == self.len() || self[i].1 != self[start].1 {
                out.push(&self[start..i]);
                start = i;
            }
        }
        out
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WidInfo {
    pub wid: u32,
    single: bool,
    priority: u8,
    value: u32,
}

/// Read view over a word position blob.
#[derive(Clone, Copy, Debug)]
pub struct WordBlob<'a> {
    buf: &'a [u8],
    count: usize,
}

impl<'a> WordBlob<'a> {
    pub fn parse(buf: &'a [u8]) -> Result<WordBlob<'a>, Error> {
        if buf.len() < 2 {
            return Err(Error::corrupt("truncated word blob"));
        }
        let count = LittleEndian::read_u16(&buf[0..2]) as usize;
        if buf.len() < 2 + count * INFO_SIZE {
            return Err(Error::corrupt("truncated word blob header"));
        }
        Ok(WordBlob { buf, count })
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn info(&self, i: usize) -> WidInfo {
        let at = 2 + i * INFO_SIZE;
        let b = &self.buf[at..at + INFO_SIZE];
        WidInfo {
            wid: LittleEndian::read_u32(&b[0..4]),
            single: b[4] == 1,
            priority: b[5],
            value: LittleEndian::read_u32(&b[6..10]),
        }
    }

    pub fn infos(&self) -> impl Iterator<Item = WidInfo> + 'a {
        let blob = *self;
        (0..self.count).map(move |i| blob.info(i))
    }

    pub fn find(&self, wid: u32) -> Option<WidInfo> {
        let (mut lo, mut hi) = (0, self.count);
        while lo < hi {
            let mid = (lo + hi) / 2;
            let info = self.info(mid);
            if info.wid == wid {
                return Some(info);
            } else if info.wid < wid {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        None
    }

    /// Best (lowest) priority and its first position.
    pub fn first(&self, info: &WidInfo) -> Result<(u8, u32), Error> {
        if info.single {
            return Ok((info.priority, info.value));
        }
        let at = info.value as usize + 1;
        if at + 2 >= self.buf.len() {
            return Err(Error::corrupt("word blob offset out of range"));
        }
        let priority = self.buf[at];
        let mut cur = Cursor::new(&self.buf[at + 2..]);
        let pos = read_vint(&mut cur).map_err(|_| Error::corrupt("truncated position"))?;
        Ok((priority, pos as u32))
    }

    /// All `(priority, position)` pairs, sorted.
    pub fn positions(&self, info: &WidInfo) -> Result<Vec<(u8, u32)>, Error> {
        if info.single {
            return Ok(vec![(info.priority, info.value)]);
        }
        let start = info.value as usize;
        let freq = match self.buf.get(start) {
            Some(&f) => usize::from(f),
            None => return Err(Error::corrupt("word blob offset out of range")),
        };
        let mut out = Vec::with_capacity(freq);
        let mut cur = Cursor::new(self.buf);
        cur.set_position(start as u64 + 1);
        let truncated = |_| Error::corrupt("truncated word blob");
        while out.len() < freq {
            let mut hdr = [0u8; 2];
            std::io::Read::read_exact(&mut cur, &mut hdr).map_err(truncated)?;
            let (priority, count) = (hdr[0], hdr[1]);
            for _ in 0..count {
                let pos = read_vint(&mut cur).map_err(truncated)?;
                out.push((priority, pos as u32));
            }
            let mut end = [0u8; 1];
            std::io::Read::read_exact(&mut cur, &mut end).map_err(truncated)?;
            if end[0] != GROUP_END || count == 0 {
                return Err(Error::corrupt("bad position group"));
            }
        }
        Ok(out)
    }
}

/// Numbers and facet ids of one document.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DocData {
    /// By number priority, NaN when absent.
    pub numbers: Vec<f64>,
    /// By facet priority.
    pub facets: Vec<Vec<u32>>,
}

impl DocData {
    pub fn new(num_numbers: usize, num_facets: usize) -> DocData {
        DocData {
            numbers: vec![std::f64::NAN; num_numbers],
            facets: vec![Vec::new(); num_facets],
        }
    }

    pub fn number(&self, priority: usize) -> Option<f64> {
        match self.numbers.get(priority) {
            Some(v) if !v.is_nan() => Some(*v),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let size = 4 + self.numbers.len() * 8 + self.facets.iter().map(|f| 4 + f.len() * 4).sum::<usize>();
        let mut out = Vec::with_capacity(size);
        out.write_u16::<LittleEndian>(self.numbers.len() as u16)?;
        out.write_u16::<LittleEndian>(self.facets.len() as u16)?;
        for &n in &self.numbers {
            out.write_f64::<LittleEndian>(n)?;
        }
        for ids in &self.facets {
            out.write_u32::<LittleEndian>(ids.len() as u32)?;
            for &id in ids {
                out.write_u32::<LittleEndian>(id)?;
            }
        }
        Ok(out)
    }

    pub fn decode(buf: &[u8]) -> Result<DocData, Error> {
        if buf.len() < 4 {
            return Err(Error::corrupt("truncated doc data"));
        }
        let nn = LittleEndian::read_u16(&buf[0..2]) as usize;
        let nf = LittleEndian::read_u16(&buf[2..4]) as usize;
        let mut at = 4;
        if buf.len() < at + nn * 8 {
            return Err(Error::corrupt("truncated doc numbers"));
        }
        let mut numbers = vec![0f64; nn];
        LittleEndian::read_f64_into(&buf[at..at + nn * 8], &mut numbers);
        at += nn * 8;
        let mut facets = Vec::with_capacity(nf);
        for _ in 0..nf {
            if buf.len() < at + 4 {
                return Err(Error::corrupt("truncated doc facets"));
            }
            let count = LittleEndian::read_u32(&buf[at..at + 4]) as usize;
            at += 4;
            if buf.len() < at + count * 4 {
                return Err(Error::corrupt("truncated doc facets"));
            }
            let mut ids = vec![0u32; count];
            LittleEndian::read_u32_into(&buf[at..at + count * 4], &mut ids);
            at += count * 4;
            facets.push(ids);
        }
        Ok(DocData { numbers, facets })
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use proptest::prelude::*;
    use proptest::test_runner::Config;
    use std::collections::BTreeMap;

    #[test]
    fn single_and_multi_words() {
        let mut b = WordBlobBuilder::new();
        b.add(7, 0, 3);
        b.add(2, 1, 0);
        b.add(2, 0, 9);
        b.add(2, 0, 300);
        let buf = b.encode().unwrap();
        let blob = WordBlob::parse(&buf).unwrap();
        assert_eq!(2, blob.len());
        let two = blob.find(2).unwrap();
        assert_eq!((0, 9), blob.first(&two).unwrap());
        assert_eq!(vec![(0, 9), (0, 300), (1, 0)], blob.positions(&two).unwrap());
        let seven = blob.find(7).unwrap();
        assert_eq!((0, 3), blob.first(&seven).unwrap());
        assert!(blob.find(5).is_none());
    }

    #[test]
    fn frequent_words_are_capped() {
        let mut b = WordBlobBuilder::new();
        for p in 0..1000 {
            b.add(1, 0, p);
        }
        let buf = b.encode().unwrap();
        let blob = WordBlob::parse(&buf).unwrap();
        let info = blob.find(1).unwrap();
        let positions = blob.positions(&info).unwrap();
        assert_eq!(MAX_POSITIONS, positions.len());
        assert_eq!((0, 254), positions[254]);
    }

    #[test]
    fn corrupt_blobs_are_errors() {
        assert!(WordBlob::parse(&[5, 0, 1]).is_err());
        assert!(DocData::decode(&[1, 0, 0, 0, 1]).is_err());
    }

    #[test]
    fn doc_data_round_trip() {
        let mut d = DocData::new(2, 2);
        d.numbers[1] = 4.5;
        d.facets[0] = vec![10, 20];
        let back = DocData::decode(&d.encode().unwrap()).unwrap();
        assert_eq!(None, back.number(0));
        assert_eq!(Some(4.5), back.number(1));
        assert_eq!(d.facets, back.facets);
    }

    proptest! {
        #![proptest_config(Config::with_cases(200))]
        #[test]
        fn positions_match_input(
            input in prop::collection::vec((1u32..50, 0u8..4, 0u32..100_000), 1..200)
        ) {
            let mut b = WordBlobBuilder::new();
            let mut expected: BTreeMap<u32, Vec<(u8, u32)>> = BTreeMap::new();
            for &(w, p, pos) in &input {
                b.add(w, p, pos);
                expected.entry(w).or_insert_with(Vec::new).push((p, pos));
            }
            let buf = b.encode().unwrap();
            let blob = WordBlob::parse(&buf).unwrap();
            prop_assert_eq!(expected.len(), blob.len());
            for (w, mut list) in expected {
                list.sort();
                list.dedup();
                let info = blob.find(w).unwrap();
                prop_assert_eq!(&list, &blob.positions(&info).unwrap());
                prop_assert_eq!(list[0], blob.first(&info).unwrap());
            }
        }
    }
}
