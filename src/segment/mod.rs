//! Compressed key/value segments (`.kv`, `.v`, `.ef` payload carrier).
//!
//! File layout:
//! ```text
//! [data blocks...]
//! [index block]
//! [properties block]
//! [footer][magic]
//! ```
//!
//! A data block is a zstd-compressed payload
//! `[count u32] repeated { [klen u32][key][vlen u32][val] }`
//! followed by a trailer of `crc32c(u32)` and `blake3(32)` over the
//! compressed bytes. The index block maps the last key of each block to
//! its handle. Iteration order is lexicographic on key; the writer
//! rejects out-of-order input.
//!
//! Publication discipline: everything is written to `<name>.tmp`,
//! fsynced, renamed to the final name, and the parent directory is
//! fsynced. A crash can leave behind only `.tmp` files.

use std::io::{Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum SegmentError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("segment corrupt: {0}")]
    Corrupt(&'static str),
}

/// Position of an entry inside a segment: `(block << 32) | entry`.
pub type Pos = u64;

#[inline]
pub fn pos(block: usize, entry: usize) -> Pos {
    ((block as u64) << 32) | entry as u64
}

#[inline]
fn pos_parts(p: Pos) -> (usize, usize) {
    ((p >> 32) as usize, (p & u32::MAX as u64) as usize)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRoot(pub [u8; 32]);

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct BlockHandle {
    offset: u64,
    len: u32,
    raw_len: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    last_key: Vec<u8>,
    handle: BlockHandle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentProps {
    pub smallest_key: Vec<u8>,
    pub largest_key: Vec<u8>,
    pub entries: u64,
    pub data_bytes: u64,
    pub table_root: TableRoot,

    /// Bumped when the block layout changes.
    #[serde(default = "default_format_version")]
    pub format_version: u32,
}

fn default_format_version() -> u32 {
    1
}

#[derive(Debug, Clone, Copy)]
struct Footer {
    index_offset: u64,
    index_len: u32,
    props_offset: u64,
    props_len: u32,
    table_root: TableRoot,
}

const MAGIC: &[u8; 8] = b"STRATAKV";
const FOOTER_SIZE: usize = 8 + 4 + 8 + 4 + 32;
const BLOCK_TRAILER_SIZE: usize = 4 + 32;

pub struct SegmentWriter {
    block_size: usize,
    level: i32,
    fsync: bool,
    file: std::fs::File,
    path_tmp: PathBuf,
    path_final: PathBuf,
    buf: Vec<u8>,
    entries_in_block: u32,
    blocks_flushed: usize,
    last_key: Option<Vec<u8>>,
    index: Vec<IndexEntry>,
    smallest_key: Option<Vec<u8>>,
    entries: u64,
    data_bytes: u64,
    table_hasher: blake3::Hasher,
}

impl SegmentWriter {
    pub fn create(
        path_final: impl Into<PathBuf>,
        block_size: usize,
        level: i32,
        fsync: bool,
    ) -> Result<Self, SegmentError> {
        let path_final = path_final.into();
        if let Some(parent) = path_final.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let path_tmp = tmp_path(&path_final);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .read(true)
            .open(&path_tmp)?;
        Ok(Self {
            block_size,
            level,
            fsync,
            file,
            path_tmp,
            path_final,
            buf: Vec::with_capacity(block_size + 256),
            entries_in_block: 0,
            blocks_flushed: 0,
            last_key: None,
            index: Vec::new(),
            smallest_key: None,
            entries: 0,
            data_bytes: 0,
            table_hasher: blake3::Hasher::new(),
        })
    }

    pub fn entries(&self) -> u64 {
        self.entries
    }

    pub fn final_path(&self) -> &Path {
        &self.path_final
    }

    /// Appends a pair. Keys must arrive in ascending order; equal keys
    /// are rejected too, a segment holds one value per key.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<Pos, SegmentError> {
        if let Some(last) = &self.last_key {
            if key <= last.as_slice() {
                return Err(SegmentError::Corrupt("keys must be added in sorted order"));
            }
        }

        if self.smallest_key.is_none() {
            self.smallest_key = Some(key.to_vec());
        }
        self.last_key = Some(key.to_vec());

        if self.entries_in_block == 0 {
            self.buf.extend_from_slice(&0u32.to_le_bytes());
        }
        let klen: u32 = key
            .len()
            .try_into()
            .map_err(|_| SegmentError::Corrupt("key too large"))?;
        let vlen: u32 = value
            .len()
            .try_into()
            .map_err(|_| SegmentError::Corrupt("value too large"))?;
        self.buf.extend_from_slice(&klen.to_le_bytes());
        self.buf.extend_from_slice(key);
        self.buf.extend_from_slice(&vlen.to_le_bytes());
        self.buf.extend_from_slice(value);

        let p = pos(self.blocks_flushed, self.entries_in_block as usize);
        self.entries_in_block += 1;
        self.entries += 1;
        let count = self.entries_in_block;
        self.buf[0..4].copy_from_slice(&count.to_le_bytes());

        if self.buf.len() >= self.block_size {
            self.flush_block()?;
        }
        Ok(p)
    }

    pub fn finish(mut self) -> Result<SegmentProps, SegmentError> {
        if self.entries_in_block > 0 {
            self.flush_block()?;
        }

        let index_offset = self.file.stream_position()?;
        let index_bytes = bincode::serialize(&self.index)
            .map_err(|_| SegmentError::Corrupt("index serialize"))?;
        self.file.write_all(&index_bytes)?;
        let index_len: u32 = index_bytes
            .len()
            .try_into()
            .map_err(|_| SegmentError::Corrupt("index too large"))?;

        self.table_hasher.update(&index_bytes);
        let table_root = TableRoot(*self.table_hasher.finalize().as_bytes());

        let props = SegmentProps {
            smallest_key: self.smallest_key.clone().unwrap_or_default(),
            largest_key: self.last_key.clone().unwrap_or_default(),
            entries: self.entries,
            data_bytes: self.data_bytes,
            table_root,
            format_version: default_format_version(),
        };
        let props_offset = self.file.stream_position()?;
        let props_bytes =
            bincode::serialize(&props).map_err(|_| SegmentError::Corrupt("props serialize"))?;
        let props_len: u32 = props_bytes
            .len()
            .try_into()
            .map_err(|_| SegmentError::Corrupt("props too large"))?;
        self.file.write_all(&props_bytes)?;

        let footer = Footer {
            index_offset,
            index_len,
            props_offset,
            props_len,
            table_root,
        };
        self.file.write_all(&encode_footer(&footer))?;
        self.file.write_all(MAGIC)?;
        if self.fsync {
            self.file.sync_data()?;
        }
        let Self {
            path_tmp,
            path_final,
            fsync,
            file,
            ..
        } = self;
        drop(file);

        std::fs::rename(&path_tmp, &path_final)?;
        if fsync {
            fsync_parent_dir(&path_final)?;
        }
        Ok(props)
    }

    /// Drops the in-progress output. Used on cancellation.
    pub fn abort(self) {
        let path = self.path_tmp.clone();
        drop(self.file);
        let _ = std::fs::remove_file(path);
    }

    fn flush_block(&mut self) -> Result<(), SegmentError> {
        let raw_len: u32 = self
            .buf
            .len()
            .try_into()
            .map_err(|_| SegmentError::Corrupt("block too large"))?;
        let compressed = zstd::bulk::compress(&self.buf, self.level)?;
        let crc = crc32c::crc32c(&compressed);
        let hash = blake3::hash(&compressed);
        self.table_hasher.update(hash.as_bytes());

        let offset = self.file.stream_position()?;
        self.file.write_all(&compressed)?;
        self.file.write_all(&crc.to_le_bytes())?;
        self.file.write_all(hash.as_bytes())?;
        let len: u32 = (compressed.len() + BLOCK_TRAILER_SIZE)
            .try_into()
            .map_err(|_| SegmentError::Corrupt("block too large"))?;

        let last_key = self
            .last_key
            .clone()
            .ok_or(SegmentError::Corrupt("missing last key"))?;
        self.index.push(IndexEntry {
            last_key,
            handle: BlockHandle {
                offset,
                len,
                raw_len,
            },
        });

        self.data_bytes += self.buf.len() as u64;
        self.buf.clear();
        self.entries_in_block = 0;
        self.blocks_flushed += 1;
        Ok(())
    }
}

type Block = Arc<Vec<(Vec<u8>, Vec<u8>)>>;

pub struct SegmentReader {
    path: PathBuf,
    mmap: memmap2::Mmap,
    index: Vec<IndexEntry>,
    props: SegmentProps,
    // Last decoded block; prefix scans revisit the same block often.
    cached: Mutex<Option<(usize, Block)>>,
}

impl SegmentReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SegmentError> {
        let path = path.as_ref().to_path_buf();
        let file = std::fs::File::open(&path)?;
        let mmap = unsafe { memmap2::Mmap::map(&file)? };
        if mmap.len() < MAGIC.len() + FOOTER_SIZE {
            return Err(SegmentError::Corrupt("file too small"));
        }
        if &mmap[mmap.len() - MAGIC.len()..] != MAGIC {
            return Err(SegmentError::Corrupt("bad magic"));
        }
        let footer_offset = mmap.len() - MAGIC.len() - FOOTER_SIZE;
        let footer = decode_footer(&mmap[footer_offset..footer_offset + FOOTER_SIZE])?;

        let index_start = footer.index_offset as usize;
        let index_end = index_start + footer.index_len as usize;
        let props_start = footer.props_offset as usize;
        let props_end = props_start + footer.props_len as usize;
        if index_end > mmap.len() || props_end > mmap.len() {
            return Err(SegmentError::Corrupt("bad footer offsets"));
        }

        let index: Vec<IndexEntry> = bincode::deserialize(&mmap[index_start..index_end])
            .map_err(|_| SegmentError::Corrupt("index decode"))?;
        let props: SegmentProps = bincode::deserialize(&mmap[props_start..props_end])
            .map_err(|_| SegmentError::Corrupt("props decode"))?;
        if props.table_root != footer.table_root {
            return Err(SegmentError::Corrupt("table root mismatch"));
        }

        Ok(Self {
            path,
            mmap,
            index,
            props,
            cached: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn properties(&self) -> &SegmentProps {
        &self.props
    }

    pub fn entries(&self) -> u64 {
        self.props.entries
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Exact-match point lookup.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, SegmentError> {
        let Some(block_idx) = self.find_block(key) else {
            return Ok(None);
        };
        let block = self.read_block(block_idx)?;
        match block.binary_search_by(|(k, _)| k.as_slice().cmp(key)) {
            Ok(i) => Ok(Some(block[i].1.clone())),
            Err(_) => Ok(None),
        }
    }

    /// Reads the entry at a position produced by the writer or an index.
    /// Returns the stored `(key, value)` so callers can verify the key.
    pub fn get_at(&self, p: Pos) -> Result<Option<(Vec<u8>, Vec<u8>)>, SegmentError> {
        let (block_idx, entry_idx) = pos_parts(p);
        if block_idx >= self.index.len() {
            return Ok(None);
        }
        let block = self.read_block(block_idx)?;
        Ok(block.get(entry_idx).cloned())
    }

    pub fn cursor(&self) -> SegmentCursor<'_> {
        SegmentCursor {
            reader: self,
            block_idx: 0,
            entry_idx: 0,
            block: None,
        }
    }

    /// Visits every entry in order with its position. Used by index
    /// builders.
    pub fn for_each_entry(
        &self,
        mut f: impl FnMut(&[u8], Pos) -> Result<(), SegmentError>,
    ) -> Result<(), SegmentError> {
        for block_idx in 0..self.index.len() {
            let block = self.read_block(block_idx)?;
            for (entry_idx, (k, _)) in block.iter().enumerate() {
                f(k, pos(block_idx, entry_idx))?;
            }
        }
        Ok(())
    }

    /// First block that may contain `key` (its last key is `>= key`).
    fn find_block(&self, key: &[u8]) -> Option<usize> {
        if self.index.is_empty() {
            return None;
        }
        let idx = self
            .index
            .partition_point(|e| e.last_key.as_slice() < key);
        (idx < self.index.len()).then_some(idx)
    }

    fn read_block(&self, block_idx: usize) -> Result<Block, SegmentError> {
        {
            let cached = self.cached.lock();
            if let Some((idx, block)) = cached.as_ref() {
                if *idx == block_idx {
                    return Ok(block.clone());
                }
            }
        }

        let handle = self.index[block_idx].handle;
        let start = handle.offset as usize;
        let end = start + handle.len as usize;
        if end > self.mmap.len() || (handle.len as usize) <= BLOCK_TRAILER_SIZE {
            return Err(SegmentError::Corrupt("block handle out of bounds"));
        }

        let payload_end = end - BLOCK_TRAILER_SIZE;
        let compressed = &self.mmap[start..payload_end];
        let crc_expected = u32::from_le_bytes(
            self.mmap[payload_end..payload_end + 4]
                .try_into()
                .unwrap(),
        );
        if crc32c::crc32c(compressed) != crc_expected {
            return Err(SegmentError::Corrupt("block crc mismatch"));
        }
        let hash_expected: [u8; 32] = self.mmap[payload_end + 4..end].try_into().unwrap();
        if blake3::hash(compressed).as_bytes() != &hash_expected {
            return Err(SegmentError::Corrupt("block hash mismatch"));
        }

        let payload = zstd::bulk::decompress(compressed, handle.raw_len as usize)?;
        if payload.len() != handle.raw_len as usize || payload.len() < 4 {
            return Err(SegmentError::Corrupt("block payload size"));
        }

        let count = u32::from_le_bytes(payload[0..4].try_into().unwrap()) as usize;
        let mut offset = 4usize;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            if offset + 4 > payload.len() {
                return Err(SegmentError::Corrupt("truncated key length"));
            }
            let klen = u32::from_le_bytes(payload[offset..offset + 4].try_into().unwrap()) as usize;
            offset += 4;
            if offset + klen + 4 > payload.len() {
                return Err(SegmentError::Corrupt("truncated key"));
            }
            let key = payload[offset..offset + klen].to_vec();
            offset += klen;
            let vlen = u32::from_le_bytes(payload[offset..offset + 4].try_into().unwrap()) as usize;
            offset += 4;
            if offset + vlen > payload.len() {
                return Err(SegmentError::Corrupt("truncated value"));
            }
            let value = payload[offset..offset + vlen].to_vec();
            offset += vlen;
            out.push((key, value));
        }

        let block: Block = Arc::new(out);
        *self.cached.lock() = Some((block_idx, block.clone()));
        Ok(block)
    }
}

impl std::fmt::Debug for SegmentReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentReader")
            .field("path", &self.path)
            .field("entries", &self.props.entries)
            .finish()
    }
}

/// Ordered cursor over a segment.
pub struct SegmentCursor<'a> {
    reader: &'a SegmentReader,
    block_idx: usize,
    entry_idx: usize,
    block: Option<Block>,
}

impl SegmentCursor<'_> {
    /// Positions at the first entry with key `>= from`.
    pub fn seek(&mut self, from: &[u8]) -> Result<(), SegmentError> {
        self.block = None;
        match self.reader.find_block(from) {
            None => {
                self.block_idx = self.reader.index.len();
                self.entry_idx = 0;
            }
            Some(block_idx) => {
                let block = self.reader.read_block(block_idx)?;
                self.entry_idx = block.partition_point(|(k, _)| k.as_slice() < from);
                self.block_idx = block_idx;
                self.block = Some(block);
            }
        }
        Ok(())
    }

    pub fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, SegmentError> {
        loop {
            if self.block.is_none() {
                if self.block_idx >= self.reader.index.len() {
                    return Ok(None);
                }
                self.block = Some(self.reader.read_block(self.block_idx)?);
                self.entry_idx = 0;
            }
            let block = self.block.as_ref().unwrap();
            if self.entry_idx < block.len() {
                let (k, v) = block[self.entry_idx].clone();
                self.entry_idx += 1;
                return Ok(Some((k, v)));
            }
            self.block = None;
            self.block_idx += 1;
        }
    }
}

fn encode_footer(footer: &Footer) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FOOTER_SIZE);
    buf.extend_from_slice(&footer.index_offset.to_le_bytes());
    buf.extend_from_slice(&footer.index_len.to_le_bytes());
    buf.extend_from_slice(&footer.props_offset.to_le_bytes());
    buf.extend_from_slice(&footer.props_len.to_le_bytes());
    buf.extend_from_slice(&footer.table_root.0);
    debug_assert_eq!(buf.len(), FOOTER_SIZE);
    buf
}

fn decode_footer(input: &[u8]) -> Result<Footer, SegmentError> {
    if input.len() != FOOTER_SIZE {
        return Err(SegmentError::Corrupt("bad footer size"));
    }
    Ok(Footer {
        index_offset: u64::from_le_bytes(input[0..8].try_into().unwrap()),
        index_len: u32::from_le_bytes(input[8..12].try_into().unwrap()),
        props_offset: u64::from_le_bytes(input[12..20].try_into().unwrap()),
        props_len: u32::from_le_bytes(input[20..24].try_into().unwrap()),
        table_root: TableRoot(input[24..56].try_into().unwrap()),
    })
}

pub(crate) fn tmp_path(path_final: &Path) -> PathBuf {
    let mut name = path_final
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path_final.with_file_name(name)
}

pub(crate) fn fsync_parent_dir(path: &Path) -> Result<(), SegmentError> {
    let parent = path
        .parent()
        .ok_or(SegmentError::Corrupt("missing parent dir"))?;
    let dir_fd = std::fs::File::open(parent)?;
    dir_fd.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(dir: &Path, pairs: &[(&[u8], &[u8])]) -> SegmentReader {
        let path = dir.join("test.kv");
        let mut w = SegmentWriter::create(&path, 256, 1, false).expect("create");
        for (k, v) in pairs {
            w.add(k, v).expect("add");
        }
        w.finish().expect("finish");
        SegmentReader::open(&path).expect("open")
    }

    #[test]
    fn roundtrip_and_point_lookup() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let pairs: Vec<(Vec<u8>, Vec<u8>)> = (0u32..500)
            .map(|i| (format!("key{i:05}").into_bytes(), i.to_le_bytes().to_vec()))
            .collect();
        let borrowed: Vec<(&[u8], &[u8])> = pairs
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
            .collect();
        let r = build(dir.path(), &borrowed);

        assert_eq!(r.entries(), 500);
        assert_eq!(r.get(b"key00042").expect("get"), Some(42u32.to_le_bytes().to_vec()));
        assert_eq!(r.get(b"missing").expect("get"), None);
    }

    #[test]
    fn writer_rejects_unsorted_input() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("bad.kv");
        let mut w = SegmentWriter::create(&path, 256, 1, false).expect("create");
        w.add(b"b", b"1").expect("add");
        assert!(w.add(b"a", b"2").is_err());
    }

    #[test]
    fn cursor_seek_iterates_in_order() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let pairs: &[(&[u8], &[u8])] =
            &[(b"aa", b"1"), (b"ab", b"2"), (b"b", b"3"), (b"c", b"4")];
        let r = build(dir.path(), pairs);
        let mut c = r.cursor();
        c.seek(b"ab").expect("seek");
        let mut seen = Vec::new();
        while let Some((k, _)) = c.next().expect("next") {
            seen.push(k);
        }
        assert_eq!(seen, vec![b"ab".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn abort_removes_tmp_output() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("gone.kv");
        let mut w = SegmentWriter::create(&path, 256, 1, false).expect("create");
        w.add(b"k", b"v").expect("add");
        w.abort();
        assert!(!path.exists());
        assert!(!tmp_path(&path).exists());
    }
}
