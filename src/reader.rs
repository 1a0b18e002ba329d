//! Streaming ZIP reader over any seekable byte source
//!
//! The reader keeps no decompressed data in memory: validation walks the
//! central directory once and records one small header per entry, and each
//! [`EntryReader`] inflates through a fixed 4 KiB staging buffer, re-seeking
//! the shared source before every refill.
//!
//! The byte source is owned by a [`SharedSource`] host on the ownership
//! kernel. Entry streams hold their own [`Strong`] handle to it, so they stay
//! readable after the [`ZipReader`] that produced them is gone.

use std::cell::{Cell, RefCell};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use flate2::{Decompress, FlushDecompress, Status};
use log::{debug, trace, warn};

use crate::error::{Result, ZipError};
use crate::refcount::{Host, Strong};
use crate::spec::{
    CentralFileHeader, EndOfCentralDirectory, LocalFileHeader, Zip64EndOfCentralDirectory,
    Zip64EndOfCentralDirectoryLocator, Zip64ExtraField, CENTRAL_FILE_HEADER_SIG,
    END_OF_CENTRAL_DIRECTORY_SIG, ENTRY_COUNT_SENTINEL, METHOD_DEFLATE, METHOD_STORE,
    VERSION_ZIP64,
};

const BUF_SIZE: usize = 4096;

/// Seekable byte source shared between a reader and its entry streams.
///
/// Interior mutability keeps the host `!Sync`, so handles to it cannot cross
/// threads; one archive, one thread.
pub struct SharedSource<R> {
    inner: RefCell<R>,
}

impl<R> Host for SharedSource<R> {}

impl<R: Read + Seek> SharedSource<R> {
    fn new(inner: R) -> SharedSource<R> {
        SharedSource {
            inner: RefCell::new(inner),
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Validity {
    Unvalidated,
    Valid,
    Invalid,
}

/// Summary of one archive entry, in declaration order.
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub name: String,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub method: u16,
    pub folder: bool,
}

/// ZIP archive reader over a seekable stream.
///
/// Validation is lazy: the central directory is located and walked on the
/// first call to [`good`](ZipReader::good), [`exist`](ZipReader::exist) or
/// [`item`](ZipReader::item), and the verdict is memoized.
pub struct ZipReader<R: Read + Seek> {
    source: Strong<SharedSource<R>>,
    /// Stream position at construction; the archive may be embedded after a
    /// preamble, all record offsets are relative to this.
    base: u64,
    strict: bool,
    validity: Cell<Validity>,
    entries: RefCell<Vec<(String, CentralFileHeader)>>,
}

impl ZipReader<File> {
    /// Opens a ZIP archive file for reading.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<ZipReader<File>> {
        ZipReader::from_stream(File::open(path)?)
    }
}

impl<R: Read + Seek> ZipReader<R> {
    /// Wraps an arbitrary seekable stream. The current stream position
    /// becomes the archive's base offset.
    pub fn from_stream(mut source: R) -> Result<ZipReader<R>> {
        let base = source.stream_position()?;
        Ok(ZipReader {
            source: Strong::new(SharedSource::new(source)),
            base,
            strict: true,
            validity: Cell::new(Validity::Unvalidated),
            entries: RefCell::new(Vec::new()),
        })
    }

    /// Switches to lenient validation: malformed central directory records
    /// are skipped with a warning instead of failing the whole archive.
    pub fn lenient(mut self) -> ZipReader<R> {
        self.strict = false;
        self
    }

    /// Whether the stream holds a structurally valid archive.
    pub fn good(&self) -> bool {
        self.ensure_valid()
    }

    /// Whether an entry with this exact name exists.
    pub fn exist(&self, name: &str) -> bool {
        if !self.ensure_valid() {
            return false;
        }
        self.entries.borrow().iter().any(|(n, _)| n == name)
    }

    /// All entries in the order the central directory lists them.
    pub fn entries(&self) -> Vec<EntryInfo> {
        if !self.ensure_valid() {
            return Vec::new();
        }
        self.entries
            .borrow()
            .iter()
            .map(|(name, header)| EntryInfo {
                name: name.clone(),
                compressed_size: header.compressed_size,
                uncompressed_size: header.uncompressed_size,
                method: header.method,
                folder: header.is_folder(),
            })
            .collect()
    }

    /// Opens the named entry for streaming decompression.
    ///
    /// Returns `None` when the archive is invalid, the name is absent, or the
    /// entry's local header cannot be used; the cause is logged.
    pub fn item(&self, name: &str) -> Option<EntryReader<R>> {
        if !self.ensure_valid() {
            return None;
        }
        let header = {
            let entries = self.entries.borrow();
            entries.iter().find(|(n, _)| n == name)?.1.clone()
        };
        match self.open_entry(&header) {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!("cannot open entry {:?}: {}", name, e);
                None
            }
        }
    }

    fn ensure_valid(&self) -> bool {
        match self.validity.get() {
            Validity::Valid => true,
            Validity::Invalid => false,
            Validity::Unvalidated => {
                let verdict = match self.validate() {
                    Ok(()) => Validity::Valid,
                    Err(e) => {
                        debug!("archive validation failed: {}", e);
                        Validity::Invalid
                    }
                };
                self.validity.set(verdict);
                verdict == Validity::Valid
            }
        }
    }

    fn validate(&self) -> Result<()> {
        let mut src = self.source.inner.borrow_mut();
        let end = src.seek(SeekFrom::End(0))?;
        let len = end
            .checked_sub(self.base)
            .ok_or(ZipError::InvalidFormat("stream shorter than base offset"))?;

        let eocd_pos = find_end_of_central_directory(&mut *src, self.base, len)?;
        trace!("end of central directory at offset {}", eocd_pos);

        src.seek(SeekFrom::Start(self.base + eocd_pos))?;
        let eocd = EndOfCentralDirectory::parse(&mut *src)?;

        let (total_entries, cd_start, cd_size) = if eocd.total_entries == ENTRY_COUNT_SENTINEL {
            let locator_pos = eocd_pos
                .checked_sub(Zip64EndOfCentralDirectoryLocator::SIZE)
                .ok_or(ZipError::InvalidFormat("no room for zip64 locator"))?;
            src.seek(SeekFrom::Start(self.base + locator_pos))?;
            let locator = Zip64EndOfCentralDirectoryLocator::parse(&mut *src)?;
            src.seek(SeekFrom::Start(self.base + locator.record_offset))?;
            let record = Zip64EndOfCentralDirectory::parse(&mut *src)?;
            debug!("zip64 directory: {} entries", record.total_entries);
            (
                record.total_entries,
                record.central_directory_start,
                record.central_directory_size,
            )
        } else {
            (
                eocd.total_entries as u64,
                eocd.central_directory_start as u64,
                eocd.central_directory_size as u64,
            )
        };

        src.seek(SeekFrom::Start(self.base + cd_start))?;
        let cd_end = self.base + cd_start + cd_size;
        let mut entries = self.entries.borrow_mut();
        entries.clear();
        for _ in 0..total_entries {
            let record_pos = src.stream_position()?;
            match read_central_record(&mut *src) {
                Ok((name, header)) => {
                    if entries.iter().any(|(n, _)| *n == name) {
                        warn!("duplicate central directory name {:?}, keeping first", name);
                        continue;
                    }
                    trace!("entry {:?}, {} bytes", name, header.uncompressed_size);
                    entries.push((name, header));
                }
                Err(e) if self.strict => return Err(e),
                Err(e) => {
                    warn!("skipping malformed central directory record: {}", e);
                    // A failed parse leaves the position mid-record; resync
                    // on the next record signature or give up on the rest.
                    match forward_scan_central(&mut *src, record_pos + 1, cd_end)? {
                        Some(next) => {
                            src.seek(SeekFrom::Start(next))?;
                        }
                        None => break,
                    }
                }
            }
        }
        Ok(())
    }

    fn open_entry(&self, header: &CentralFileHeader) -> Result<EntryReader<R>> {
        if header.method != METHOD_DEFLATE && header.method != METHOD_STORE {
            return Err(ZipError::UnsupportedCompression(header.method));
        }

        let mut src = self.source.inner.borrow_mut();
        src.seek(SeekFrom::Start(self.base + header.local_header_offset))?;
        let local = LocalFileHeader::parse(&mut *src)?;

        let extra_offset =
            self.base + header.local_header_offset + LocalFileHeader::SIZE + local.name_len as u64;

        let mut compressed_size = header.compressed_size;
        let mut uncompressed_size = header.uncompressed_size;
        if local.version_needed == VERSION_ZIP64 {
            src.seek(SeekFrom::Start(extra_offset))?;
            let extra = Zip64ExtraField::parse(&mut *src)?;
            compressed_size = extra.compressed_size;
            uncompressed_size = extra.uncompressed_size;
        }
        let data_offset = extra_offset + local.extra_len as u64;
        drop(src);

        Ok(EntryReader::new(
            self.source.clone(),
            header.method,
            header.crc32,
            data_offset,
            compressed_size,
            uncompressed_size,
        ))
    }
}

/// Locates the end-of-central-directory record by scanning backward from the
/// stream end in fixed windows, with an overlap margin so a record straddling
/// a window boundary is still seen whole.
///
/// A candidate only wins if its declared comment length matches the distance
/// from the end of the record to the end of the stream, which rejects
/// signature look-alikes embedded in entry data or comments.
fn find_end_of_central_directory<R: Read + Seek>(src: &mut R, base: u64, len: u64) -> Result<u64> {
    const RECORD: usize = EndOfCentralDirectory::SIZE as usize;
    let magic = END_OF_CENTRAL_DIRECTORY_SIG.to_le_bytes();

    let mut window_end = len as i64;
    while window_end > 0 {
        let start = (window_end - BUF_SIZE as i64).max(0) as u64;
        let want = ((len - start) as usize).min(BUF_SIZE + RECORD);
        let mut buf = vec![0u8; want];
        src.seek(SeekFrom::Start(base + start))?;
        src.read_exact(&mut buf)?;

        if buf.len() >= RECORD {
            for j in (0..=buf.len() - RECORD).rev() {
                if buf[j..j + 4] != magic {
                    continue;
                }
                let comment_len = u16::from_le_bytes([buf[j + 20], buf[j + 21]]) as u64;
                let record_end = start + j as u64 + RECORD as u64;
                if record_end + comment_len == len {
                    return Ok(start + j as u64);
                }
                trace!("rejecting eocd candidate at {}: comment length mismatch", start + j as u64);
            }
        }
        window_end -= BUF_SIZE as i64;
    }
    Err(ZipError::InvalidFormat(
        "end of central directory record not found",
    ))
}

/// Scans forward (in fixed windows, with a signature-sized overlap) for the
/// next central directory record between `from` and `limit`, both absolute.
fn forward_scan_central<R: Read + Seek>(src: &mut R, from: u64, limit: u64) -> Result<Option<u64>> {
    let magic = CENTRAL_FILE_HEADER_SIG.to_le_bytes();
    let mut pos = from;
    while pos + 4 <= limit {
        let want = ((limit - pos) as usize).min(BUF_SIZE);
        let mut buf = vec![0u8; want];
        src.seek(SeekFrom::Start(pos))?;
        src.read_exact(&mut buf)?;
        for j in 0..=want - 4 {
            if buf[j..j + 4] == magic {
                return Ok(Some(pos + j as u64));
            }
        }
        pos += (want - 3) as u64;
    }
    Ok(None)
}

fn read_central_record<R: Read + Seek>(src: &mut R) -> Result<(String, CentralFileHeader)> {
    let header = CentralFileHeader::parse(src)?;
    let mut name = vec![0u8; header.name_len as usize];
    src.read_exact(&mut name)?;
    src.seek(SeekFrom::Current(
        header.extra_len as i64 + header.comment_len as i64,
    ))?;
    Ok((String::from_utf8_lossy(&name).into_owned(), header))
}

/// Bounded streaming decompressor for one archive entry.
///
/// Holds its own strong handle to the shared source; the source is re-seeked
/// before every refill, so entry streams and their parent reader can
/// interleave freely.
pub struct EntryReader<R: Read + Seek> {
    source: Strong<SharedSource<R>>,
    method: u16,
    crc32: u32,
    data_offset: u64,
    consumed: u64,
    rest_compressed: u64,
    rest_uncompressed: u64,
    size: u64,
    inflate: Decompress,
    buffer: Box<[u8; BUF_SIZE]>,
    buf_pos: usize,
    buf_len: usize,
}

impl<R: Read + Seek> EntryReader<R> {
    fn new(
        source: Strong<SharedSource<R>>,
        method: u16,
        crc32: u32,
        data_offset: u64,
        compressed_size: u64,
        uncompressed_size: u64,
    ) -> EntryReader<R> {
        EntryReader {
            source,
            method,
            crc32,
            data_offset,
            consumed: 0,
            rest_compressed: compressed_size,
            rest_uncompressed: uncompressed_size,
            size: uncompressed_size,
            // Raw deflate stream, no zlib header.
            inflate: Decompress::new(false),
            buffer: Box::new([0u8; BUF_SIZE]),
            buf_pos: 0,
            buf_len: 0,
        }
    }

    /// Total uncompressed size of the entry.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// CRC-32 of the uncompressed data, as recorded in the central directory.
    pub fn crc32(&self) -> u32 {
        self.crc32
    }

    fn refill(&mut self) -> io::Result<()> {
        let take = (self.rest_compressed as usize).min(BUF_SIZE);
        let mut src = self.source.inner.borrow_mut();
        src.seek(SeekFrom::Start(self.data_offset + self.consumed))?;
        src.read_exact(&mut self.buffer[..take])?;
        self.consumed += take as u64;
        self.rest_compressed -= take as u64;
        self.buf_pos = 0;
        self.buf_len = take;
        Ok(())
    }

    fn read_stored(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let want = (out.len() as u64).min(self.rest_compressed) as usize;
        if want == 0 {
            return Ok(0);
        }
        let mut src = self.source.inner.borrow_mut();
        src.seek(SeekFrom::Start(self.data_offset + self.consumed))?;
        src.read_exact(&mut out[..want])?;
        self.consumed += want as u64;
        self.rest_compressed -= want as u64;
        self.rest_uncompressed = self.rest_uncompressed.saturating_sub(want as u64);
        Ok(want)
    }

    fn read_deflated(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let want = (out.len() as u64).min(self.rest_uncompressed) as usize;
        if want == 0 {
            return Ok(0);
        }
        let mut written = 0;
        while written < want {
            if self.buf_pos == self.buf_len && self.rest_compressed > 0 {
                self.refill()?;
            }
            let before_in = self.inflate.total_in();
            let before_out = self.inflate.total_out();
            let status = self
                .inflate
                .decompress(
                    &self.buffer[self.buf_pos..self.buf_len],
                    &mut out[written..want],
                    FlushDecompress::None,
                )
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            self.buf_pos += (self.inflate.total_in() - before_in) as usize;
            let produced = (self.inflate.total_out() - before_out) as usize;
            written += produced;
            self.rest_uncompressed -= produced as u64;

            if status == Status::StreamEnd {
                break;
            }
            if produced == 0 && self.buf_pos == self.buf_len && self.rest_compressed == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "deflate stream ended before declared size",
                ));
            }
        }
        Ok(written)
    }
}

impl<R: Read + Seek> Read for EntryReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.method == METHOD_STORE {
            self.read_stored(out)
        } else {
            self.read_deflated(out)
        }
    }
}
