//! Binary format of a settled [`BlockUpdates`] node.
//!
//! Layout, big-endian:
//!
//! ```text
//! magic "BSUP" | version u16 | reserved u16
//! block_id u64 | start_ts u64 | commit_ts u64
//! base_len u32 | base roaring bytes
//! local_len u32 | local roaring bytes
//! ncols u32 | { col u16 | nvals u32 | { row u32 | len u32 | bytes } }
//! crc32 u32 over everything before it
//! ```

use std::collections::BTreeMap;

use bytes::Bytes;
use roaring::RoaringBitmap;

use crate::storage::updates::{BlockUpdates, ColumnUpdates};
use crate::types::checksum::crc32;
use crate::types::{BasaltError, ObjectId, Result};

const MAGIC: [u8; 4] = *b"BSUP";
const FORMAT_VERSION: u16 = 1;

/// Serializes `updates`. The owner reference is not part of the format.
pub fn encode_block_updates(updates: &BlockUpdates) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(64 + updates.payload_bytes());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&updates.block_id().0.to_be_bytes());
    out.extend_from_slice(&updates.start_ts().to_be_bytes());
    out.extend_from_slice(&updates.commit_ts().to_be_bytes());
    put_bitmap(&mut out, updates.base_deletes())?;
    put_bitmap(&mut out, updates.local_deletes())?;
    put_len(&mut out, updates.columns().len())?;
    for (col, overlay) in updates.columns() {
        out.extend_from_slice(&col.to_be_bytes());
        put_len(&mut out, overlay.len())?;
        for (row, value) in overlay.iter() {
            out.extend_from_slice(&row.to_be_bytes());
            put_len(&mut out, value.len())?;
            out.extend_from_slice(value);
        }
    }
    let crc = crc32(&out);
    out.extend_from_slice(&crc.to_be_bytes());
    Ok(out)
}

/// Parses bytes produced by [`encode_block_updates`].
pub fn decode_block_updates(src: &[u8]) -> Result<BlockUpdates> {
    if src.len() < 4 {
        return Err(BasaltError::Corruption("block updates truncated"));
    }
    let (body, trailer) = src.split_at(src.len() - 4);
    let stored = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    if crc32(body) != stored {
        return Err(BasaltError::Corruption("block updates crc mismatch"));
    }
    let mut cursor = Cursor { buf: body, pos: 0 };
    if cursor.take(4)? != MAGIC {
        return Err(BasaltError::Corruption("block updates magic mismatch"));
    }
    if cursor.u16()? != FORMAT_VERSION {
        return Err(BasaltError::Corruption("block updates version mismatch"));
    }
    if cursor.u16()? != 0 {
        return Err(BasaltError::Corruption("block updates reserved bytes non-zero"));
    }
    let block_id = ObjectId(cursor.u64()?);
    let start_ts = cursor.u64()?;
    let commit_ts = cursor.u64()?;
    let base = cursor.bitmap()?;
    let local = cursor.bitmap()?;
    let ncols = cursor.u32()?;
    let mut columns = BTreeMap::new();
    for _ in 0..ncols {
        let col = cursor.u16()?;
        let nvals = cursor.u32()?;
        let mut overlay = ColumnUpdates::new();
        for _ in 0..nvals {
            let row = cursor.u32()?;
            let len = cursor.u32()? as usize;
            overlay.set(row, Bytes::copy_from_slice(cursor.take(len)?));
        }
        columns.insert(col, overlay);
    }
    if cursor.pos != body.len() {
        return Err(BasaltError::Corruption("block updates trailing bytes"));
    }
    Ok(BlockUpdates::from_parts(
        block_id, start_ts, commit_ts, base, local, columns,
    ))
}

fn put_len(out: &mut Vec<u8>, len: usize) -> Result<()> {
    let len = u32::try_from(len).map_err(|_| BasaltError::Invalid("block updates too large"))?;
    out.extend_from_slice(&len.to_be_bytes());
    Ok(())
}

fn put_bitmap(out: &mut Vec<u8>, bitmap: &RoaringBitmap) -> Result<()> {
    put_len(out, bitmap.serialized_size())?;
    bitmap.serialize_into(&mut *out)?;
    Ok(())
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or(BasaltError::Corruption("block updates truncated"))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(raw))
    }

    fn bitmap(&mut self) -> Result<RoaringBitmap> {
        let len = self.u32()? as usize;
        let raw = self.take(len)?;
        RoaringBitmap::deserialize_from(raw)
            .map_err(|_| BasaltError::Corruption("block updates bitmap malformed"))
    }
}
