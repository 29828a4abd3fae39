//! Chunked bitmap: a sparse set of u32 values kept as containers sorted by the
//! high 16 bits of each value.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::iter::FromIterator;

use crate::cont::Container;
use crate::error::Error;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Bitmap {
    conts: Vec<Container>,
}

#[inline]
fn split(item: u32) -> (u16, u16) {
    ((item >> 16) as u16, (item & 0xFFFF) as u16)
}

/// First index at or after `from` whose container id is >= `cid`.
fn advance(conts: &[Container], from: usize, cid: u16) -> usize {
    if from >= conts.len() || conts[from].id() >= cid {
        return from;
    }
    let mut lo = from;
    let mut step = 1;
    let mut hi = from + 1;
    while hi < conts.len() && conts[hi].id() < cid {
        lo = hi;
        step <<= 1;
        hi = from + step;
    }
    let hi = hi.min(conts.len());
    lo + 1 + conts[lo + 1..hi].partition_point(|c| c.id() < cid)
}

/// Walks the containers two bitmaps have in common.
fn for_each_pair<'a>(a: &'a Bitmap, b: &'a Bitmap, mut f: impl FnMut(&'a Container, &'a Container)) {
    let (mut i, mut j) = (0, 0);
    while i < a.conts.len() && j < b.conts.len() {
        let (ia, ib) = (a.conts[i].id(), b.conts[j].id());
        if ia == ib {
            f(&a.conts[i], &b.conts[j]);
            i += 1;
            j += 1;
        } else if ia < ib {
            i = advance(&a.conts, i, ib);
        } else {
            j = advance(&b.conts, j, ia);
        }
    }
}

impl Bitmap {
    pub fn new() -> Bitmap {
        Bitmap { conts: Vec::new() }
    }

    pub(crate) fn from_containers(conts: Vec<Container>) -> Bitmap {
        Bitmap { conts }
    }

    pub fn containers(&self) -> &[Container] {
        &self.conts
    }

    fn find(&self, cid: u16) -> Result<usize, usize> {
        match self.conts.last() {
            None => Err(0),
            Some(last) if last.id() < cid => Err(self.conts.len()),
            _ => self.conts.binary_search_by_key(&cid, |c| c.id()),
        }
    }

    pub fn add(&mut self, item: u32) -> bool {
        let (cid, low) = split(item);
        match self.find(cid) {
            Ok(pos) => self.conts[pos].add(low),
            Err(pos) => {
                let mut c = Container::new(cid);
                c.add(low);
                self.conts.insert(pos, c);
                true
            }
        }
    }

    /// Returns true if the item was present.
    pub fn remove(&mut self, item: u32) -> bool {
        let (cid, low) = split(item);
        match self.find(cid) {
            Ok(pos) => {
                let had = self.conts[pos].contains(low);
                if self.conts[pos].remove(low) {
                    self.conts.remove(pos);
                }
                had
            }
            Err(_) => false,
        }
    }

    pub fn contains(&self, item: u32) -> bool {
        let (cid, low) = split(item);
        match self.find(cid) {
            Ok(pos) => self.conts[pos].contains(low),
            Err(_) => false,
        }
    }

    pub fn cardinality(&self) -> u64 {
        self.conts.iter().map(|c| u64::from(c.cardinality())).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.conts.is_empty()
    }

    /// Smallest member, `None` for an empty bitmap.
    pub fn get_first(&self) -> Option<u32> {
        self.conts
            .first()
            .and_then(|c| c.first().map(|low| (u32::from(c.id()) << 16) | u32::from(low)))
    }

    pub fn iter<'a>(&'a self) -> impl Iterator<Item = u32> + 'a {
        self.conts.iter().flat_map(|c| {
            let base = u32::from(c.id()) << 16;
            c.iter().map(move |low| base | u32::from(low))
        })
    }

    pub fn and(a: &Bitmap, b: &Bitmap) -> Bitmap {
        let mut conts = Vec::new();
        for_each_pair(a, b, |x, y| {
            let c = Container::and(x, y);
            if !c.is_empty() {
                conts.push(c);
            }
        });
        Bitmap { conts }
    }

    pub fn and_cardinality(a: &Bitmap, b: &Bitmap) -> u64 {
        let mut count = 0;
        for_each_pair(a, b, |x, y| count += u64::from(Container::and_cardinality(x, y)));
        count
    }

    pub fn and_inplace(&mut self, other: &Bitmap) {
        let mut kept = Vec::with_capacity(self.conts.len());
        let mut j = 0;
        for mut c in self.conts.drain(..) {
            j = advance(&other.conts, j, c.id());
            if j < other.conts.len() && other.conts[j].id() == c.id() {
                c.and_inplace(&other.conts[j]);
                if !c.is_empty() {
                    kept.push(c);
                }
            }
        }
        self.conts = kept;
    }

    /// Members of `a` that are not in `b`.
    pub fn and_not(a: &Bitmap, b: &Bitmap) -> Bitmap {
        let mut conts = Vec::with_capacity(a.conts.len());
        let mut j = 0;
        for c in &a.conts {
            j = advance(&b.conts, j, c.id());
            if j < b.conts.len() && b.conts[j].id() == c.id() {
                let d = Container::and_not(c, &b.conts[j]);
                if !d.is_empty() {
                    conts.push(d);
                }
            } else {
                conts.push(c.clone());
            }
        }
        Bitmap { conts }
    }

    /// `universe \ self`.
    pub fn invert(&self, universe: &Bitmap) -> Bitmap {
        Bitmap::and_not(universe, self)
    }

    /// N-ary union. The first non-empty input seeds a bitset accumulator, the
    /// rest are folded in container by container and the result is shrunk back
    /// to arrays where the cardinality allows.
    pub fn or(inputs: &[&Bitmap]) -> Bitmap {
        let mut rest = inputs.iter().filter(|b| !b.is_empty());
        let mut acc: Vec<Container> = match rest.next() {
            Some(first) => first
                .conts
                .iter()
                .map(|c| {
                    let mut c = c.clone();
                    c.to_bitset();
                    c
                }).collect(),
            None => return Bitmap::new(),
        };
        for b in rest {
            let mut merged = Vec::with_capacity(acc.len() + b.conts.len());
            let mut current = acc.into_iter().peekable();
            for c in &b.conts {
                while let Some(a) = current.next_if(|a| a.id() < c.id()) {
                    merged.push(a);
                }
                match current.next_if(|a| a.id() == c.id()) {
                    Some(mut a) => {
                        a.union_lazy(c);
                        merged.push(a);
                    }
                    None => {
                        let mut n = c.clone();
                        n.to_bitset();
                        merged.push(n);
                    }
                }
            }
            merged.extend(current);
            acc = merged;
        }
        for c in acc.iter_mut() {
            c.repair();
        }
        Bitmap { conts: acc }
    }

    /// Flat encoding: u16 container count followed by each container's dump.
    pub fn dump(&self) -> Result<Vec<u8>, Error> {
        if self.conts.len() > u16::max_value() as usize {
            return Err(Error::invalid("bitmap has too many containers to dump"));
        }
        let size = 2 + self.conts.iter().map(|c| c.dump_size()).sum::<usize>();
        let mut out = Vec::with_capacity(size);
        out.write_u16::<LittleEndian>(self.conts.len() as u16)?;
        for c in &self.conts {
            c.dump(&mut out)?;
        }
        Ok(out)
    }

    pub fn load(buf: &[u8]) -> Result<Bitmap, Error> {
        if buf.len() < 2 {
            return Err(Error::corrupt("truncated bitmap"));
        }
        let count = LittleEndian::read_u16(&buf[0..2]) as usize;
        let mut conts: Vec<Container> = Vec::with_capacity(count);
        let mut pos = 2;
        for _ in 0..count {
            let (c, used) = Container::load(&buf[pos..])?;
            if let Some(prev) = conts.last() {
                if prev.id() >= c.id() {
                    return Err(Error::corrupt("bitmap containers out of order"));
                }
            }
            conts.push(c);
            pos += used;
        }
        Ok(Bitmap { conts })
    }
}

impl FromIterator<u32> for Bitmap {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Bitmap {
        let mut b = Bitmap::new();
        for item in iter {
            b.add(item);
        }
        b
    }
}

/// Collects bitmaps and combines them all at once.
pub struct Oper<'a> {
    inputs: Vec<&'a Bitmap>,
}

impl<'a> Oper<'a> {
    pub fn new() -> Oper<'a> {
        Oper { inputs: Vec::new() }
    }

    pub fn add(&mut self, b: &'a Bitmap) {
        self.inputs.push(b);
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn and(&self) -> Bitmap {
        match self.inputs.len() {
            0 => Bitmap::new(),
            1 => self.inputs[0].clone(),
            _ => {
                let mut res = Bitmap::and(self.inputs[0], self.inputs[1]);
                for b in &self.inputs[2..] {
                    if res.is_empty() {
                        break;
                    }
                    res.and_inplace(b);
                }
                res
            }
        }
    }

    pub fn or(&self) -> Bitmap {
        Bitmap::or(&self.inputs)
    }
}

impl<'a> Default for Oper<'a> {
    fn default() -> Oper<'a> {
        Oper::new()
    }
}
