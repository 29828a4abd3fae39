//! Disk-resident prefix trie over code points, mapping words to word ids.
//!
//! The trie lives in a single memory mapped file. Page 0 holds the meta
//! header, the remaining pages are carved into nodes of eight size classes
//! (16 bytes up to a full page) or span several pages for very wide nodes.
//! Nodes are addressed by byte offset. A node is a packed u32 header
//! followed by its sorted `(code point, child offset)` pairs and then the
//! optional word id and top word id.
//!
//! Free node slots per class are tracked as bitmaps of offsets and persisted
//! in the KV store rather than the mapped file.

use byteorder::{ByteOrder, LittleEndian};
use memmap::MmapMut;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::Path;

use crate::bmap::Bitmap;
use crate::error::Error;
use crate::kv::{Dbi, KvRead, WriteTxn};

pub const MAGIC: u32 = 0xBEDE_ADFE;
pub const VERSION: u32 = 1;
pub const PSIZE: usize = 4096;
/// Depth up to which new nodes get a top word id.
pub const LEVLIMIT: usize = 3;

const NS_MAX: u32 = 9;
const LARGEST_CLASS: u32 = 8;
/// Node types are four bits wide, so multi-page nodes stop at six pages.
const MAX_TYPE: u32 = 15;
const NUM_TYPES: usize = 90;
const NODE_SIZE: [usize; 9] = [0, 16, 32, 64, 128, 256, 512, 1024, 4096];

const M_MAGIC: usize = 0;
const M_VERSION: usize = 4;
const M_NUM_PAGES: usize = 8;
const M_WORD_COUNT: usize = 12;
const M_TWORD_COUNT: usize = 16;
const M_ROOT: usize = 20;
const M_USED: usize = 24;
const M_FREE: usize = M_USED + 4 * NUM_TYPES;

const CHILD_SIZE: usize = 8;
const ID_SIZE: usize = 4;
const GROW_PAGES: usize = 256;

fn node_size(ntype: u32) -> usize {
    if ntype <= LARGEST_CLASS {
        NODE_SIZE[ntype as usize]
    } else {
        (ntype - NS_MAX) as usize * PSIZE
    }
}

fn pages_for(ntype: u32) -> usize {
    if ntype <= LARGEST_CLASS {
        1
    } else {
        (ntype - NS_MAX) as usize
    }
}

/// Node offsets are stored as u32, so the file must stay addressable by one.
fn check_page_limit(pages: usize) -> Result<(), Error> {
    let bytes = pages as u64 * PSIZE as u64;
    if bytes > u64::from(u32::max_value()) {
        return Err(Error::TrieFull(format!(
            "trie file would grow to {} bytes, past the {} byte offset range",
            bytes,
            u32::max_value()
        )));
    }
    Ok(())
}

fn next_type(ntype: u32) -> Result<u32, Error> {
    let next = if ntype == LARGEST_CLASS {
        NS_MAX + 2
    } else {
        ntype + 1
    };
    if next > MAX_TYPE {
        return Err(Error::TrieFull(format!(
            "node of type {} cannot grow further",
            ntype
        )));
    }
    Ok(next)
}

/// Max edit distance tolerated for a term of `len` code points.
pub fn max_distance(len: usize) -> u8 {
    if len > 7 {
        2
    } else {
        1
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct NodeHeader {
    ntype: u32,
    has_wid: bool,
    has_twid: bool,
    num_child: u32,
}

impl NodeHeader {
    fn decode(raw: u32) -> NodeHeader {
        NodeHeader {
            ntype: raw & 0xF,
            has_wid: raw & 0x10 != 0,
            has_twid: raw & 0x20 != 0,
            num_child: raw >> 6,
        }
    }

    fn encode(&self) -> u32 {
        (self.ntype & 0xF)
            | if self.has_wid { 0x10 } else { 0 }
            | if self.has_twid { 0x20 } else { 0 }
            | (self.num_child << 6)
    }

    fn used_bytes(&self) -> usize {
        4 + CHILD_SIZE * self.num_child as usize
            + if self.has_wid { ID_SIZE } else { 0 }
            + if self.has_twid { ID_SIZE } else { 0 }
    }

    fn fits(&self, extra: usize) -> bool {
        self.used_bytes() + extra <= node_size(self.ntype)
    }

    fn trailer(&self, off: usize) -> usize {
        off + 4 + CHILD_SIZE * self.num_child as usize
    }
}

/// Result of inserting or looking up a word.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WordIds {
    /// Zero when the word is unknown.
    pub wid: u32,
    /// Top word ids of the first `min(len, LEVLIMIT)` code points.
    pub twids: Vec<u32>,
    /// True if this call created the word id.
    pub created: bool,
}

/// Word ids matched by a term, with their edit distance.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TermMatch {
    /// Set when a short prefix term resolved to a top word id.
    pub twid: Option<u32>,
    pub wids: HashMap<u32, u8>,
}

impl TermMatch {
    fn record(&mut self, wid: u32, distance: u8) {
        let d = self.wids.entry(wid).or_insert(distance);
        if distance < *d {
            *d = distance;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.twid.is_none() && self.wids.is_empty()
    }
}

pub struct DiskTrie {
    inner: RwLock<TrieFile>,
}

struct TrieFile {
    file: File,
    map: MmapMut,
    free: Vec<Bitmap>,
    free_dirty: Vec<bool>,
}

impl DiskTrie {
    /// Opens the trie at `path`, creating and seeding it if the file is new.
    /// Free lists are read through `kv`.
    pub fn open<T: KvRead>(path: &Path, kv: &T) -> Result<DiskTrie, Error> {
        let fresh = match path.metadata() {
            Ok(meta) => meta.len() == 0,
            Err(_) => true,
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        if fresh {
            file.set_len(((NS_MAX as usize + 2 + GROW_PAGES) * PSIZE) as u64)?;
        }
        let map = unsafe { MmapMut::map_mut(&file)? };
        let mut trie = TrieFile {
            file,
            map,
            free: vec![Bitmap::new(); MAX_TYPE as usize + 1],
            free_dirty: vec![false; MAX_TYPE as usize + 1],
        };
        if fresh {
            trie.init()?;
            tracing::debug!(path = ?path, "created trie");
        } else {
            trie.check_meta()?;
            trie.load_free_lists(kv)?;
        }
        Ok(DiskTrie {
            inner: RwLock::new(trie),
        })
    }

    /// Returns the ids of `word`, inserting it if needed.
    pub fn insert(&self, word: &[char]) -> Result<WordIds, Error> {
        self.inner.write().insert(word)
    }

    /// Pure walk: wid 0 when the word is absent.
    pub fn exact_lookup(&self, word: &[char]) -> Result<WordIds, Error> {
        self.inner.read().exact_lookup(word)
    }

    pub fn lookup_term(&self, word: &[char], prefix: bool, typos: bool) -> Result<TermMatch, Error> {
        self.inner.read().lookup_term(word, prefix, typos)
    }

    pub fn word_count(&self) -> Result<u32, Error> {
        self.inner.read().meta(M_WORD_COUNT)
    }

    pub fn top_word_count(&self) -> Result<u32, Error> {
        self.inner.read().meta(M_TWORD_COUNT)
    }

    /// Persists the free lists that changed and syncs the mapped file.
    pub fn save(&self, txn: &WriteTxn) -> Result<(), Error> {
        let mut trie = self.inner.write();
        trie.save_free_lists(txn)?;
        trie.map.flush()?;
        Ok(())
    }
}

impl TrieFile {
    fn u32_at(&self, off: usize) -> Result<u32, Error> {
        match self.map.get(off..off + 4) {
            Some(buf) => Ok(LittleEndian::read_u32(buf)),
            None => Err(Error::corrupt(format!("trie offset {} out of range", off))),
        }
    }

    fn set_u32(&mut self, off: usize, value: u32) -> Result<(), Error> {
        match self.map.get_mut(off..off + 4) {
            Some(buf) => {
                LittleEndian::write_u32(buf, value);
                Ok(())
            }
            None => Err(Error::corrupt(format!("trie offset {} out of range", off))),
        }
    }

    fn meta(&self, field: usize) -> Result<u32, Error> {
        self.u32_at(field)
    }

    fn bump_meta(&mut self, field: usize, delta: i64) -> Result<u32, Error> {
        let value = (i64::from(self.meta(field)?) + delta) as u32;
        self.set_u32(field, value)?;
        Ok(value)
    }

    fn init(&mut self) -> Result<(), Error> {
        self.set_u32(M_MAGIC, MAGIC)?;
        self.set_u32(M_VERSION, VERSION)?;
        self.set_u32(M_NUM_PAGES, NS_MAX + 2)?;
        self.set_u32(M_WORD_COUNT, 0)?;
        self.set_u32(M_TWORD_COUNT, 0)?;
        // one starter page per class
        for ntype in 1..=LARGEST_CLASS {
            let page = ntype as usize * PSIZE;
            let size = node_size(ntype);
            for slot in 0..PSIZE / size {
                self.free[ntype as usize].add((page + slot * size) as u32);
                self.bump_meta(M_FREE + 4 * ntype as usize, 1)?;
            }
            self.free_dirty[ntype as usize] = true;
        }
        let root = PSIZE * (NS_MAX as usize + 1);
        self.write_header(
            root,
            NodeHeader {
                ntype: LARGEST_CLASS,
                has_wid: false,
                has_twid: false,
                num_child: 0,
            },
        )?;
        self.bump_meta(M_USED + 4 * LARGEST_CLASS as usize, 1)?;
        self.set_u32(M_ROOT, root as u32)
    }

    fn check_meta(&self) -> Result<(), Error> {
        if self.map.len() < PSIZE {
            return Err(Error::corrupt("trie file too small"));
        }
        if self.meta(M_MAGIC)? != MAGIC {
            return Err(Error::corrupt("bad trie magic"));
        }
        if self.meta(M_VERSION)? != VERSION {
            return Err(Error::corrupt("unsupported trie version"));
        }
        let pages = self.meta(M_NUM_PAGES)? as usize;
        if pages * PSIZE > self.map.len() {
            return Err(Error::corrupt("trie page count exceeds file size"));
        }
        Ok(())
    }

    fn load_free_lists<T: KvRead>(&mut self, kv: &T) -> Result<(), Error> {
        for ntype in 1..=MAX_TYPE {
            if let Some(buf) = kv.get(Dbi::TrieFree, &ntype.to_be_bytes())? {
                self.free[ntype as usize] = Bitmap::load(&buf)?;
            }
        }
        Ok(())
    }

    fn save_free_lists(&mut self, txn: &WriteTxn) -> Result<(), Error> {
        for ntype in 1..=MAX_TYPE {
            let idx = ntype as usize;
            if !self.free_dirty[idx] {
                continue;
            }
            let key = ntype.to_be_bytes();
            if self.free[idx].is_empty() {
                txn.del(Dbi::TrieFree, &key)?;
            } else {
                txn.put(Dbi::TrieFree, &key, &self.free[idx].dump()?)?;
            }
            self.free_dirty[idx] = false;
        }
        Ok(())
    }

    fn root(&self) -> Result<usize, Error> {
        Ok(self.meta(M_ROOT)? as usize)
    }

    fn header(&self, off: usize) -> Result<NodeHeader, Error> {
        let hdr = NodeHeader::decode(self.u32_at(off)?);
        if hdr.ntype == 0 || hdr.ntype == NS_MAX || hdr.ntype == NS_MAX + 1 || !hdr.fits(0) {
            return Err(Error::corrupt(format!("bad trie node at {}", off)));
        }
        Ok(hdr)
    }

    fn write_header(&mut self, off: usize, hdr: NodeHeader) -> Result<(), Error> {
        self.set_u32(off, hdr.encode())
    }

    fn child_at(&self, off: usize, idx: usize) -> Result<(u32, usize), Error> {
        let pos = off + 4 + idx * CHILD_SIZE;
        Ok((self.u32_at(pos)?, self.u32_at(pos + 4)? as usize))
    }

    fn children(&self, off: usize, hdr: &NodeHeader) -> Result<Vec<(u32, usize)>, Error> {
        (0..hdr.num_child as usize)
            .map(|i| self.child_at(off, i))
            .collect()
    }

    /// Binary search for `cp` among the children of the node.
    fn search_child(&self, off: usize, hdr: &NodeHeader, cp: u32) -> Result<Result<usize, usize>, Error> {
        let (mut lo, mut hi) = (0, hdr.num_child as usize);
        while lo < hi {
            let mid = (lo + hi) / 2;
            let (mcp, _) = self.child_at(off, mid)?;
            if mcp == cp {
                return Ok(Ok(mid));
            } else if mcp < cp {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(Err(lo))
    }

    fn find_child(&self, off: usize, cp: u32) -> Result<Option<usize>, Error> {
        let hdr = self.header(off)?;
        match self.search_child(off, &hdr, cp)? {
            Ok(idx) => Ok(Some(self.child_at(off, idx)?.1)),
            Err(_) => Ok(None),
        }
    }

    fn wid(&self, off: usize, hdr: &NodeHeader) -> Result<Option<u32>, Error> {
        if hdr.has_wid {
            Ok(Some(self.u32_at(hdr.trailer(off))?))
        } else {
            Ok(None)
        }
    }

    fn twid(&self, off: usize, hdr: &NodeHeader) -> Result<Option<u32>, Error> {
        if hdr.has_twid {
            let pos = hdr.trailer(off) + if hdr.has_wid { ID_SIZE } else { 0 };
            Ok(Some(self.u32_at(pos)?))
        } else {
            Ok(None)
        }
    }

    fn set_ids(&mut self, off: usize, mut hdr: NodeHeader, wid: Option<u32>, twid: Option<u32>) -> Result<(), Error> {
        hdr.has_wid = wid.is_some();
        hdr.has_twid = twid.is_some();
        let mut pos = hdr.trailer(off);
        if let Some(w) = wid {
            self.set_u32(pos, w)?;
            pos += ID_SIZE;
        }
        if let Some(t) = twid {
            self.set_u32(pos, t)?;
        }
        self.write_header(off, hdr)
    }

    fn ensure_pages(&mut self, pages: usize) -> Result<(), Error> {
        let needed = pages * PSIZE;
        if needed <= self.map.len() {
            return Ok(());
        }
        let new_len = needed.max(self.map.len() + GROW_PAGES * PSIZE);
        self.map.flush()?;
        self.file.set_len(new_len as u64)?;
        self.map = unsafe { MmapMut::map_mut(&self.file)? };
        tracing::trace!(bytes = new_len, "grew trie file");
        Ok(())
    }

    /// Appends a page (or run of pages) for a node of `ntype`. Remaining
    /// slots of a shared page go on the free list.
    fn create_new_node(&mut self, ntype: u32) -> Result<usize, Error> {
        let pages = self.meta(M_NUM_PAGES)? as usize;
        let want = pages_for(ntype);
        check_page_limit(pages + want)?;
        self.ensure_pages(pages + want)?;
        self.set_u32(M_NUM_PAGES, (pages + want) as u32)?;
        let off = pages * PSIZE;
        if ntype <= LARGEST_CLASS {
            let size = node_size(ntype);
            for slot in 1..PSIZE / size {
                self.free[ntype as usize].add((off + slot * size) as u32);
                self.bump_meta(M_FREE + 4 * ntype as usize, 1)?;
            }
            self.free_dirty[ntype as usize] = true;
        }
        Ok(off)
    }

    fn alloc(&mut self, ntype: u32) -> Result<usize, Error> {
        let idx = ntype as usize;
        let off = match self.free[idx].get_first() {
            Some(off) => {
                self.free[idx].remove(off);
                self.free_dirty[idx] = true;
                self.bump_meta(M_FREE + 4 * idx, -1)?;
                off as usize
            }
            None => self.create_new_node(ntype)?,
        };
        self.bump_meta(M_USED + 4 * idx, 1)?;
        let size = node_size(ntype);
        match self.map.get_mut(off..off + size) {
            Some(buf) => {
                for b in buf.iter_mut() {
                    *b = 0;
                }
            }
            None => return Err(Error::corrupt(format!("free node {} out of range", off))),
        }
        self.write_header(
            off,
            NodeHeader {
                ntype,
                has_wid: false,
                has_twid: false,
                num_child: 0,
            },
        )?;
        Ok(off)
    }

    fn free_node(&mut self, off: usize, ntype: u32) -> Result<(), Error> {
        let idx = ntype as usize;
        self.free[idx].add(off as u32);
        self.free_dirty[idx] = true;
        self.bump_meta(M_FREE + 4 * idx, 1)?;
        self.bump_meta(M_USED + 4 * idx, -1)?;
        Ok(())
    }

    /// Moves a node into the next larger class and repoints its parent (or
    /// the root) at the copy.
    fn upsize_node(&mut self, off: usize, link: Option<(usize, usize)>) -> Result<usize, Error> {
        let mut hdr = self.header(off)?;
        let old_type = hdr.ntype;
        hdr.ntype = next_type(old_type)?;
        let new = self.alloc(hdr.ntype)?;
        let used = hdr.used_bytes();
        self.map.copy_within(off..off + used, new);
        self.write_header(new, hdr)?;
        self.free_node(off, old_type)?;
        match link {
            Some((parent, idx)) => self.set_u32(parent + 4 + idx * CHILD_SIZE + 4, new as u32)?,
            None => self.set_u32(M_ROOT, new as u32)?,
        }
        tracing::trace!(from = off, to = new, ntype = hdr.ntype, "upsized trie node");
        Ok(new)
    }

    fn insert_child(&mut self, off: usize, idx: usize, cp: u32, child: usize) -> Result<(), Error> {
        let mut hdr = self.header(off)?;
        let start = off + 4 + idx * CHILD_SIZE;
        let end = off + hdr.used_bytes();
        self.map.copy_within(start..end, start + CHILD_SIZE);
        self.set_u32(start, cp)?;
        self.set_u32(start + 4, child as u32)?;
        hdr.num_child += 1;
        self.write_header(off, hdr)
    }

    fn insert(&mut self, word: &[char]) -> Result<WordIds, Error> {
        if word.is_empty() {
            return Err(Error::invalid("cannot insert an empty word"));
        }
        let mut node = self.root()?;
        let mut link: Option<(usize, usize)> = None;
        let mut twids = Vec::with_capacity(LEVLIMIT);
        for (depth, &ch) in word.iter().enumerate() {
            let cp = ch as u32;
            let hdr = self.header(node)?;
            let (idx, child) = match self.search_child(node, &hdr, cp)? {
                Ok(idx) => (idx, self.child_at(node, idx)?.1),
                Err(idx) => {
                    if !hdr.fits(CHILD_SIZE) {
                        node = self.upsize_node(node, link)?;
                    }
                    let child = self.alloc(1)?;
                    if depth < LEVLIMIT {
                        let twid = self.bump_meta(M_TWORD_COUNT, 1)?;
                        let chdr = self.header(child)?;
                        self.set_ids(child, chdr, None, Some(twid))?;
                    }
                    self.insert_child(node, idx, cp, child)?;
                    (idx, child)
                }
            };
            link = Some((node, idx));
            node = child;
            if depth < LEVLIMIT {
                let hdr = self.header(node)?;
                twids.push(self.twid(node, &hdr)?.unwrap_or(0));
            }
        }
        let hdr = self.header(node)?;
        if let Some(wid) = self.wid(node, &hdr)? {
            return Ok(WordIds {
                wid,
                twids,
                created: false,
            });
        }
        let twid = self.twid(node, &hdr)?;
        if !hdr.fits(ID_SIZE) {
            node = self.upsize_node(node, link)?;
        }
        let wid = self.bump_meta(M_WORD_COUNT, 1)?;
        let hdr = self.header(node)?;
        self.set_ids(node, hdr, Some(wid), twid)?;
        Ok(WordIds {
            wid,
            twids,
            created: true,
        })
    }

    fn exact_lookup(&self, word: &[char]) -> Result<WordIds, Error> {
        let mut node = self.root()?;
        let mut twids = Vec::with_capacity(LEVLIMIT);
        for (depth, &ch) in word.iter().enumerate() {
            node = match self.find_child(node, ch as u32)? {
                Some(child) => child,
                None => return Ok(WordIds { wid: 0, twids, created: false }),
            };
            if depth < LEVLIMIT {
                let hdr = self.header(node)?;
                twids.push(self.twid(node, &hdr)?.unwrap_or(0));
            }
        }
        let hdr = self.header(node)?;
        Ok(WordIds {
            wid: self.wid(node, &hdr)?.unwrap_or(0),
            twids,
            created: false,
        })
    }

    fn walk(&self, word: &[char]) -> Result<Option<usize>, Error> {
        let mut node = self.root()?;
        for &ch in word {
            match self.find_child(node, ch as u32)? {
                Some(child) => node = child,
                None => return Ok(None),
            }
        }
        Ok(Some(node))
    }

    /// Adds every word id at or below `off` with the given distance.
    fn collect(&self, off: usize, distance: u8, out: &mut TermMatch) -> Result<(), Error> {
        let mut stack = vec![off];
        while let Some(node) = stack.pop() {
            let hdr = self.header(node)?;
            if let Some(wid) = self.wid(node, &hdr)? {
                out.record(wid, distance);
            }
            for (_, child) in self.children(node, &hdr)? {
                stack.push(child);
            }
        }
        Ok(())
    }

    fn lookup_term(&self, word: &[char], prefix: bool, typos: bool) -> Result<TermMatch, Error> {
        let mut out = TermMatch::default();
        if word.is_empty() {
            return Ok(out);
        }
        if word.len() <= LEVLIMIT || !typos {
            if let Some(node) = self.walk(word)? {
                let hdr = self.header(node)?;
                if prefix && word.len() <= LEVLIMIT {
                    out.twid = self.twid(node, &hdr)?;
                    if let Some(wid) = self.wid(node, &hdr)? {
                        out.record(wid, 0);
                    }
                } else if prefix {
                    self.collect(node, 0, &mut out)?;
                } else if let Some(wid) = self.wid(node, &hdr)? {
                    out.record(wid, 0);
                }
            }
            return Ok(out);
        }
        let query: Vec<u32> = word.iter().map(|&c| c as u32).collect();
        let walk = TypoWalk {
            query: &query,
            max: max_distance(query.len()),
            prefix,
        };
        let row: Vec<u8> = (0..=query.len()).map(|j| j.min(255) as u8).collect();
        let root = self.root()?;
        let best = row[query.len()];
        walk.visit(self, root, 0, None, &row, best, &mut out)?;
        Ok(out)
    }
}

/// Bounded Damerau-Levenshtein walk (optimal string alignment) over the
/// trie. Each step extends the distance row of the parent by one code point.
struct TypoWalk<'q> {
    query: &'q [u32],
    max: u8,
    prefix: bool,
}

impl<'q> TypoWalk<'q> {
    #[allow(clippy::too_many_arguments)]
    fn visit(
        &self,
        trie: &TrieFile,
        node: usize,
        prev_cp: u32,
        prev_row: Option<&[u8]>,
        row: &[u8],
        best: u8,
        out: &mut TermMatch,
    ) -> Result<(), Error> {
        let n = self.query.len();
        let hdr = trie.header(node)?;
        for (cp, child) in trie.children(node, &hdr)? {
            let mut next = vec![0u8; n + 1];
            next[0] = row[0].saturating_add(1);
            for j in 1..=n {
                let cost = if self.query[j - 1] == cp { 0 } else { 1 };
                let mut v = row[j]
                    .saturating_add(1)
                    .min(next[j - 1].saturating_add(1))
                    .min(row[j - 1].saturating_add(cost));
                if let Some(pr) = prev_row {
                    if j > 1 && cp == self.query[j - 2] && prev_cp == self.query[j - 1] {
                        v = v.min(pr[j - 2].saturating_add(1));
                    }
                }
                next[j] = v;
            }
            let here = next[n];
            let child_best = if self.prefix { best.min(here) } else { here };
            let chdr = trie.header(child)?;
            if child_best <= self.max {
                if let Some(wid) = trie.wid(child, &chdr)? {
                    out.record(wid, child_best);
                }
            }
            let alive = next.iter().any(|&d| d <= self.max);
            if alive {
                self.visit(trie, child, cp, Some(row), &next, child_best, out)?;
            } else if self.prefix && child_best <= self.max {
                for (_, grandchild) in trie.children(child, &chdr)? {
                    trie.collect(grandchild, child_best, out)?;
                }
            }
        }
        Ok(())
    }
}
