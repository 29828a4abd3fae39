//! A set over the 16-bit domain, stored as a sorted array while small and as a
//! fixed 4096-word bitset once it holds more than `CUTOFF` values.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::io::Write;
use std::slice;

use crate::error::Error;

pub const CUTOFF: usize = 4096;
pub const BITSET_WORDS: usize = 4096;
const FULL: u32 = 65536;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Store {
    Array(Vec<u16>),
    Bitset(Vec<u16>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Container {
    id: u16,
    card: u32,
    store: Store,
}

#[inline]
fn test_bit(words: &[u16], v: u16) -> bool {
    words[(v >> 4) as usize] & (1 << (v & 0xF)) != 0
}

#[inline]
fn set_bit(words: &mut [u16], v: u16) -> bool {
    let w = &mut words[(v >> 4) as usize];
    let mask = 1 << (v & 0xF);
    let absent = *w & mask == 0;
    *w |= mask;
    absent
}

#[inline]
fn clear_bit(words: &mut [u16], v: u16) -> bool {
    let w = &mut words[(v >> 4) as usize];
    let mask = 1 << (v & 0xF);
    let present = *w & mask != 0;
    *w &= !mask;
    present
}

fn popcount(words: &[u16]) -> u32 {
    words.iter().map(|w| w.count_ones()).sum()
}

fn bits_to_array(words: &[u16]) -> Vec<u16> {
    BitIter::new(words).collect()
}

/// Insert position for `v`, or None if already present. Checks the tail first
/// since ids mostly arrive in increasing order.
#[inline]
fn array_insert_pos(vals: &[u16], v: u16) -> Option<usize> {
    match vals.last() {
        None => Some(0),
        Some(&last) if v > last => Some(vals.len()),
        _ => vals.binary_search(&v).err(),
    }
}

/// First index at or after `from` holding a value >= `target`.
fn advance(vals: &[u16], from: usize, target: u16) -> usize {
    if from >= vals.len() || vals[from] >= target {
        return from;
    }
    let mut lo = from;
    let mut step = 1;
    let mut hi = from + 1;
    while hi < vals.len() && vals[hi] < target {
        lo = hi;
        step <<= 1;
        hi = from + step;
    }
    let hi = hi.min(vals.len());
    lo + 1 + vals[lo + 1..hi].partition_point(|&x| x < target)
}

fn intersect_arrays(a: &[u16], b: &[u16], mut emit: impl FnMut(u16)) {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    let mut pos = 0;
    for &v in small {
        pos = advance(large, pos, v);
        if pos == large.len() {
            break;
        }
        if large[pos] == v {
            emit(v);
            pos += 1;
        }
    }
}

impl Container {
    pub fn new(id: u16) -> Container {
        Container {
            id,
            card: 0,
            store: Store::Array(Vec::new()),
        }
    }

    fn from_words(id: u16, words: Vec<u16>) -> Container {
        let card = popcount(&words);
        let mut c = Container {
            id,
            card,
            store: Store::Bitset(words),
        };
        c.normalize();
        c
    }

    fn from_sorted(id: u16, vals: Vec<u16>) -> Container {
        let mut c = Container {
            id,
            card: vals.len() as u32,
            store: Store::Array(vals),
        };
        c.normalize();
        c
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn cardinality(&self) -> u32 {
        self.card
    }

    pub fn is_empty(&self) -> bool {
        self.card == 0
    }

    pub fn is_bitset(&self) -> bool {
        match self.store {
            Store::Bitset(_) => true,
            Store::Array(_) => false,
        }
    }

    pub fn contains(&self, v: u16) -> bool {
        match self.store {
            Store::Array(ref vals) => vals.binary_search(&v).is_ok(),
            Store::Bitset(ref words) => test_bit(words, v),
        }
    }

    /// Returns true if the value was not already present.
    pub fn add(&mut self, v: u16) -> bool {
        let added = match self.store {
            Store::Array(ref mut vals) => match array_insert_pos(vals, v) {
                Some(pos) => {
                    vals.insert(pos, v);
                    true
                }
                None => false,
            },
            Store::Bitset(ref mut words) => set_bit(words, v),
        };
        if added {
            self.card += 1;
            if !self.is_bitset() && self.card as usize > CUTOFF {
                self.to_bitset();
            }
        }
        added
    }

    /// Removes `v` and reports whether the container is now empty.
    pub fn remove(&mut self, v: u16) -> bool {
        let removed = match self.store {
            Store::Array(ref mut vals) => match vals.binary_search(&v) {
                Ok(pos) => {
                    vals.remove(pos);
                    true
                }
                Err(_) => false,
            },
            Store::Bitset(ref mut words) => clear_bit(words, v),
        };
        if removed {
            self.card -= 1;
            if self.is_bitset() && self.card as usize <= CUTOFF {
                self.to_array();
            }
        }
        self.card == 0
    }

    pub fn first(&self) -> Option<u16> {
        match self.store {
            Store::Array(ref vals) => vals.first().cloned(),
            Store::Bitset(ref words) => BitIter::new(words).next(),
        }
    }

    pub fn iter(&self) -> ContainerIter {
        match self.store {
            Store::Array(ref vals) => ContainerIter::Array(vals.iter()),
            Store::Bitset(ref words) => ContainerIter::Bitset(BitIter::new(words)),
        }
    }

    pub fn to_bitset(&mut self) {
        if let Store::Array(ref vals) = self.store {
            let mut words = vec![0u16; BITSET_WORDS];
            for &v in vals {
                set_bit(&mut words, v);
            }
            self.store = Store::Bitset(words);
        }
    }

    pub fn to_array(&mut self) {
        if let Store::Bitset(ref words) = self.store {
            self.store = Store::Array(bits_to_array(words));
        }
    }

    /// Restores the array/bitset split after bulk changes.
    fn normalize(&mut self) {
        if self.card as usize > CUTOFF {
            self.to_bitset();
        } else {
            self.to_array();
        }
    }

    pub fn and(a: &Container, b: &Container) -> Container {
        match (&a.store, &b.store) {
            (Store::Array(x), Store::Array(y)) => {
                let mut out = Vec::with_capacity(x.len().min(y.len()));
                intersect_arrays(x, y, |v| out.push(v));
                Container::from_sorted(a.id, out)
            }
            (Store::Bitset(x), Store::Bitset(y)) => {
                let words = x.iter().zip(y.iter()).map(|(p, q)| p & q).collect();
                Container::from_words(a.id, words)
            }
            (Store::Array(vals), Store::Bitset(words))
            | (Store::Bitset(words), Store::Array(vals)) => {
                let out = vals.iter().cloned().filter(|&v| test_bit(words, v)).collect();
                Container::from_sorted(a.id, out)
            }
        }
    }

    pub fn and_cardinality(a: &Container, b: &Container) -> u32 {
        match (&a.store, &b.store) {
            (Store::Array(x), Store::Array(y)) => {
                let mut count = 0;
                intersect_arrays(x, y, |_| count += 1);
                count
            }
            (Store::Bitset(x), Store::Bitset(y)) => x
                .iter()
                .zip(y.iter())
                .map(|(p, q)| (p & q).count_ones())
                .sum(),
            (Store::Array(vals), Store::Bitset(words))
            | (Store::Bitset(words), Store::Array(vals)) => {
                vals.iter().filter(|&&v| test_bit(words, v)).count() as u32
            }
        }
    }

    pub fn and_inplace(&mut self, other: &Container) {
        *self = Container::and(self, other);
    }

    /// Values of `a` not present in `b`.
    pub fn and_not(a: &Container, b: &Container) -> Container {
        match (&a.store, &b.store) {
            (Store::Array(vals), _) => {
                let out = vals.iter().cloned().filter(|&v| !b.contains(v)).collect();
                Container::from_sorted(a.id, out)
            }
            (Store::Bitset(x), Store::Bitset(y)) => {
                let words = x.iter().zip(y.iter()).map(|(p, q)| p & !q).collect();
                Container::from_words(a.id, words)
            }
            (Store::Bitset(x), Store::Array(vals)) => {
                let mut words = x.clone();
                for &v in vals {
                    clear_bit(&mut words, v);
                }
                Container::from_words(a.id, words)
            }
        }
    }

    /// Ors `other` into this container, which must already be a bitset.
    /// Cardinality is stale until `repair` is called.
    pub fn union_lazy(&mut self, other: &Container) {
        if let Store::Bitset(ref mut words) = self.store {
            match other.store {
                Store::Bitset(ref theirs) => {
                    for (w, t) in words.iter_mut().zip(theirs.iter()) {
                        *w |= *t;
                    }
                }
                Store::Array(ref vals) => {
                    for &v in vals {
                        set_bit(words, v);
                    }
                }
            }
        }
    }

    /// Recomputes cardinality and drops back to an array if small enough.
    pub fn repair(&mut self) {
        if let Store::Bitset(ref words) = self.store {
            self.card = popcount(words);
        }
        self.normalize();
    }

    pub fn union_inplace(&mut self, other: &Container) {
        self.to_bitset();
        self.union_lazy(other);
        self.repair();
    }

    /// Writes `id, cardinality, data` as little endian u16 words. A full
    /// container stores cardinality 0; its first bitset word is then 0xFFFF.
    pub fn dump(&self, out: &mut dyn Write) -> Result<(), Error> {
        out.write_u16::<LittleEndian>(self.id)?;
        out.write_u16::<LittleEndian>((self.card & 0xFFFF) as u16)?;
        match self.store {
            Store::Array(ref vals) => {
                for &v in vals {
                    out.write_u16::<LittleEndian>(v)?;
                }
            }
            Store::Bitset(ref words) => {
                for &w in words {
                    out.write_u16::<LittleEndian>(w)?;
                }
            }
        }
        Ok(())
    }

    pub fn dump_size(&self) -> usize {
        4 + 2 * match self.store {
            Store::Array(ref vals) => vals.len(),
            Store::Bitset(_) => BITSET_WORDS,
        }
    }

    /// Reads one container from the head of `buf`, returning it with the
    /// number of bytes consumed.
    pub fn load(buf: &[u8]) -> Result<(Container, usize), Error> {
        if buf.len() < 4 {
            return Err(Error::corrupt("truncated container header"));
        }
        let id = LittleEndian::read_u16(&buf[0..2]);
        let mut card = u32::from(LittleEndian::read_u16(&buf[2..4]));
        let body = &buf[4..];
        if card == 0 {
            if body.len() < 2 || LittleEndian::read_u16(&body[0..2]) != 0xFFFF {
                return Err(Error::corrupt(format!("empty container {}", id)));
            }
            card = FULL;
        }
        if card as usize <= CUTOFF {
            let len = card as usize * 2;
            if body.len() < len {
                return Err(Error::corrupt(format!("truncated array container {}", id)));
            }
            let mut vals = vec![0u16; card as usize];
            LittleEndian::read_u16_into(&body[..len], &mut vals);
            if vals.windows(2).any(|w| w[0] >= w[1]) {
                return Err(Error::corrupt(format!("unsorted container {}", id)));
            }
            let c = Container {
                id,
                card,
                store: Store::Array(vals),
            };
            Ok((c, 4 + len))
        } else {
            let len = BITSET_WORDS * 2;
            if body.len() < len {
                return Err(Error::corrupt(format!("truncated bitset container {}", id)));
            }
            let mut words = vec![0u16; BITSET_WORDS];
            LittleEndian::read_u16_into(&body[..len], &mut words);
            if popcount(&words) != card {
                return Err(Error::corrupt(format!(
                    "bitset container {} cardinality mismatch",
                    id
                )));
            }
            let c = Container {
                id,
                card,
                store: Store::Bitset(words),
            };
            Ok((c, 4 + len))
        }
    }
}

pub struct BitIter<'a> {
    words: &'a [u16],
    next_word: usize,
    base: u32,
    cur: u16,
}

impl<'a> BitIter<'a> {
    fn new(words: &'a [u16]) -> BitIter<'a> {
        BitIter {
            words,
            next_word: 0,
            base: 0,
            cur: 0,
        }
    }
}

impl<'a> Iterator for BitIter<'a> {
    type Item = u16;

    fn next(&mut self) -> Option<u16> {
        while self.cur == 0 {
            if self.next_word >= self.words.len() {
                return None;
            }
            self.cur = self.words[self.next_word];
            self.base = (self.next_word as u32) << 4;
            self.next_word += 1;
        }
        let bit = self.cur.trailing_zeros();
        self.cur &= self.cur - 1;
        Some((self.base + bit) as u16)
    }
}

pub enum ContainerIter<'a> {
    Array(slice::Iter<'a, u16>),
    Bitset(BitIter<'a>),
}

impl<'a> Iterator for ContainerIter<'a> {
    type Item = u16;

    fn next(&mut self) -> Option<u16> {
        match *self {
            ContainerIter::Array(ref mut it) => it.next().cloned(),
            ContainerIter::Bitset(ref mut it) => it.next(),
        }
    }
}
