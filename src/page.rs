//! Index page encoding (spec §3 "Index page", §4.B page mutation).
//!
//! On-disk layout, a 20-byte header followed by `num` 9-byte items:
//!
//! ```text
//! magic: u32 | bid: u32 | oid: u64 | num: u32 | items[num]
//! item := packed_hash: u24 (LE) | virtual_offset: u48 (LE)
//! ```
//!
//! `ooff`/`osize` (the page's own previous on-disk location, carried
//! forward across copy-on-grow so the old image's bytes can be charged to
//! junk) and `cap` (allocated item slots) are in-memory bookkeeping only,
//! matching `CDBPAGE.ooff/osize/cap` in the original, which the `PAGEHSIZE`
//! macro excludes from the persisted header.

use crate::error::{Error, Result};
use crate::types::{PackedHash, VirtualOffset};

pub const PAGE_MAGIC: u32 = 0x1989_0604;
pub const PAGE_HEADER_SIZE: usize = 20;
pub const ITEM_SIZE: usize = 9;
/// Page capacity grows by this many slots on overflow (spec §3 Lifecycle).
pub const PAGE_CAP_INCREMENT: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageItem {
    pub hash: PackedHash,
    pub offset: VirtualOffset,
}

impl PageItem {
    fn encode(self, out: &mut Vec<u8>) {
        let h = self.hash.raw().to_le_bytes();
        out.extend_from_slice(&h[0..3]);
        let o = self.offset.raw().to_le_bytes();
        out.extend_from_slice(&o[0..6]);
    }

    fn decode(buf: &[u8]) -> Self {
        let hash = (buf[0] as u32) | (buf[1] as u32) << 8 | (buf[2] as u32) << 16;
        let mut off_bytes = [0u8; 8];
        off_bytes[0..6].copy_from_slice(&buf[3..9]);
        let offset = u64::from_le_bytes(off_bytes);
        PageItem {
            hash: PackedHash::from_hash64(hash as u64),
            offset: VirtualOffset::from_raw(offset),
        }
    }
}

/// An in-memory index page: every record whose bucket equals `bid`.
#[derive(Debug, Clone)]
pub struct Page {
    pub bid: u32,
    pub oid: u64,
    pub items: Vec<PageItem>,
    pub cap: u32,
    /// Where this page's previous disk image lived, `NULL` if it has never
    /// been written (a freshly materialized page).
    pub ooff: VirtualOffset,
    pub osize: u32,
}

impl Page {
    pub fn new_empty(bid: u32, oid: u64) -> Self {
        Self {
            bid,
            oid,
            items: Vec::with_capacity(PAGE_CAP_INCREMENT as usize),
            cap: PAGE_CAP_INCREMENT,
            ooff: VirtualOffset::NULL,
            osize: 0,
        }
    }

    pub fn num(&self) -> u32 {
        self.items.len() as u32
    }

    pub fn on_disk_len(&self) -> u64 {
        (PAGE_HEADER_SIZE + self.items.len() * ITEM_SIZE) as u64
    }

    /// Grows the page by [`PAGE_CAP_INCREMENT`] slots, carrying the old
    /// page's `ooff`/`osize` forward and assigning a new oid, as in
    /// `cdb_updatepage`'s copy-on-grow path.
    pub fn grown(&self, new_oid: u64) -> Self {
        Self {
            bid: self.bid,
            oid: new_oid,
            items: self.items.clone(),
            cap: self.cap + PAGE_CAP_INCREMENT,
            ooff: self.ooff,
            osize: self.osize,
        }
    }

    pub fn is_full(&self) -> bool {
        self.items.len() as u32 >= self.cap
    }

    /// Appends an item unless an identical `(hash, offset)` pair already
    /// exists (spec §8 "Duplicate (hash, offset) item is not reinserted").
    pub fn insert(&mut self, item: PageItem) -> bool {
        if self.items.iter().any(|i| *i == item) {
            return false;
        }
        self.items.push(item);
        true
    }

    /// Removes the item matching `(hash, offset)` via shift-left
    /// compaction. Returns whether anything was removed.
    pub fn remove(&mut self, hash: PackedHash, offset: VirtualOffset) -> bool {
        if let Some(pos) = self
            .items
            .iter()
            .position(|i| i.hash == hash && i.offset == offset)
        {
            self.items.remove(pos);
            true
        } else {
            false
        }
    }

    /// Replaces the offset of the item matching `(hash, old_offset)` in
    /// place, preserving item order.
    pub fn replace_offset(
        &mut self,
        hash: PackedHash,
        old_offset: VirtualOffset,
        new_offset: VirtualOffset,
    ) -> bool {
        if let Some(item) = self
            .items
            .iter_mut()
            .find(|i| i.hash == hash && i.offset == old_offset)
        {
            item.offset = new_offset;
            true
        } else {
            false
        }
    }

    /// All item offsets whose packed hash matches; multiple matches are
    /// expected (24-bit hash collisions), disambiguated by the caller
    /// re-reading each candidate record's key.
    pub fn offsets_for(&self, hash: PackedHash) -> Vec<VirtualOffset> {
        self.items
            .iter()
            .filter(|i| i.hash == hash)
            .map(|i| i.offset)
            .collect()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.on_disk_len() as usize);
        buf.extend_from_slice(&PAGE_MAGIC.to_le_bytes());
        buf.extend_from_slice(&self.bid.to_le_bytes());
        buf.extend_from_slice(&self.oid.to_le_bytes());
        buf.extend_from_slice(&self.num().to_le_bytes());
        for item in &self.items {
            item.encode(&mut buf);
        }
        buf
    }

    pub fn decode(buf: &[u8], fid: u32, offset: u64) -> Result<Self> {
        if buf.len() < PAGE_HEADER_SIZE {
            return Err(Error::IndexFileContentError {
                fid,
                offset,
                reason: "buffer shorter than page header",
            });
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != PAGE_MAGIC {
            return Err(Error::IndexFileContentError {
                fid,
                offset,
                reason: "bad page magic",
            });
        }
        let bid = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let oid = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        let num = u32::from_le_bytes(buf[16..20].try_into().unwrap()) as usize;
        let needed = PAGE_HEADER_SIZE + num * ITEM_SIZE;
        if buf.len() < needed {
            return Err(Error::IndexFileContentError {
                fid,
                offset,
                reason: "buffer shorter than page body",
            });
        }
        let mut items = Vec::with_capacity(num);
        for i in 0..num {
            let start = PAGE_HEADER_SIZE + i * ITEM_SIZE;
            items.push(PageItem::decode(&buf[start..start + ITEM_SIZE]));
        }
        let cap = (num as u32).max(PAGE_CAP_INCREMENT);
        Ok(Page {
            bid,
            oid,
            items,
            cap,
            ooff: VirtualOffset::new(fid, offset),
            osize: needed as u32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(hash: u32, fid: u32, off: u64) -> PageItem {
        PageItem {
            hash: PackedHash::from_hash64(hash as u64),
            offset: VirtualOffset::new(fid, off),
        }
    }

    #[test]
    fn encode_decode_roundtrip() {
        let mut page = Page::new_empty(7, 1);
        page.insert(item(1, 1, 0));
        page.insert(item(2, 1, 16));
        let encoded = page.encode();
        let decoded = Page::decode(&encoded, 1, 0).unwrap();
        assert_eq!(decoded.bid, 7);
        assert_eq!(decoded.num(), 2);
        assert_eq!(decoded.items[1].offset.real_offset(), 16);
    }

    #[test]
    fn duplicate_insert_is_noop() {
        let mut page = Page::new_empty(0, 1);
        assert!(page.insert(item(1, 1, 0)));
        assert!(!page.insert(item(1, 1, 0)));
        assert_eq!(page.num(), 1);
    }

    #[test]
    fn grow_preserves_old_offset_for_junk_accounting() {
        let mut page = Page::new_empty(0, 1);
        page.ooff = VirtualOffset::new(2, 32);
        page.osize = 29;
        for i in 0..4 {
            page.insert(item(i, 1, (i as u64) * 16));
        }
        assert!(page.is_full());
        let grown = page.grown(2);
        assert_eq!(grown.cap, 8);
        assert_eq!(grown.ooff, page.ooff);
        assert_eq!(grown.osize, page.osize);
    }

    #[test]
    fn remove_shifts_left() {
        let mut page = Page::new_empty(0, 1);
        page.insert(item(1, 1, 0));
        page.insert(item(2, 1, 16));
        page.insert(item(3, 1, 32));
        assert!(page.remove(PackedHash::from_hash64(2), VirtualOffset::new(1, 16)));
        assert_eq!(page.num(), 2);
        assert_eq!(page.offsets_for(PackedHash::from_hash64(2)).len(), 0);
    }
}
