//! Streaming ZIP writer over any seekable byte sink
//!
//! Entry data is deflated through a fixed 4 KiB staging buffer, so memory use
//! is independent of entry size. Each entry's local header is written
//! provisionally when the entry is declared and patched in place once its
//! CRC and sizes are known; the central directory is held in memory and
//! emitted by [`flush`](ZipWriter::flush).
//!
//! Open entries are exposed as [`Weak`] handles to an [`EntrySink`] host: the
//! writer keeps the only [`Strong`], so the moment it finalizes the entry the
//! caller's handle stops promoting. The ownership kernel, not a runtime
//! check, enforces that at most one entry is writable at a time.

use std::cell::RefCell;
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::Path;

use crc32fast::Hasher;
use flate2::{Compress, Compression, FlushCompress, Status};
use log::{trace, warn};

use crate::error::{Result, ZipError};
use crate::refcount::{Host, Strong, Weak};
use crate::spec::{
    CentralFileHeader, EndOfCentralDirectory, LocalFileHeader, Zip64EndOfCentralDirectory,
    Zip64EndOfCentralDirectoryLocator, ENTRY_COUNT_SENTINEL,
};

const BUF_SIZE: usize = 4096;

/// Seekable byte sink shared between the writer and its open entry.
pub struct SharedSink<W> {
    inner: RefCell<W>,
}

impl<W> Host for SharedSink<W> {}

struct DirRecord {
    name: String,
    header: CentralFileHeader,
}

pub(crate) struct EntryTotals {
    pub crc32: u32,
    pub compressed: u64,
    pub uncompressed: u64,
}

struct EntryState {
    deflate: Compress,
    buffer: Box<[u8; BUF_SIZE]>,
    pending: usize,
    crc: Hasher,
    compressed: u64,
    uncompressed: u64,
    finished: bool,
}

/// Compressing byte sink for a single open entry.
///
/// Obtained from [`ZipWriter::add_item`] as a [`Weak`] handle; promote it to
/// write. Promotion fails once the writer has finalized the entry.
pub struct EntrySink<W: Write + Seek> {
    sink: Strong<SharedSink<W>>,
    /// Absolute offset of this entry's provisional local header.
    header_offset: u64,
    name_len: u16,
    state: RefCell<EntryState>,
}

impl<W: Write + Seek> Host for EntrySink<W> {}

impl<W: Write + Seek> EntrySink<W> {
    fn new(sink: Strong<SharedSink<W>>, header_offset: u64, name_len: u16) -> EntrySink<W> {
        EntrySink {
            sink,
            header_offset,
            name_len,
            state: RefCell::new(EntryState {
                // Raw deflate stream, no zlib header.
                deflate: Compress::new(Compression::default(), false),
                buffer: Box::new([0u8; BUF_SIZE]),
                pending: 0,
                crc: Hasher::new(),
                compressed: 0,
                uncompressed: 0,
                finished: false,
            }),
        }
    }

    /// Appends uncompressed bytes to the entry.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.finished {
            return Err(ZipError::InvalidFormat("write to a finalized entry"));
        }
        state.crc.update(data);
        state.uncompressed += data.len() as u64;
        self.deflate_chunk(&mut state, data, false)
    }

    /// Runs `data` through the deflate state machine, draining the staging
    /// buffer to the sink whenever it fills (always, when finishing).
    fn deflate_chunk(&self, state: &mut EntryState, data: &[u8], finish: bool) -> Result<()> {
        let flush = if finish {
            FlushCompress::Finish
        } else {
            FlushCompress::None
        };
        let mut consumed = 0;
        loop {
            let before_in = state.deflate.total_in();
            let before_out = state.deflate.total_out();
            let pending = state.pending;
            let status =
                state
                    .deflate
                    .compress(&data[consumed..], &mut state.buffer[pending..], flush)?;
            consumed += (state.deflate.total_in() - before_in) as usize;
            state.pending += (state.deflate.total_out() - before_out) as usize;

            if finish || state.pending == state.buffer.len() {
                let mut out = self.sink.inner.borrow_mut();
                out.write_all(&state.buffer[..state.pending])?;
                state.compressed += state.pending as u64;
                state.pending = 0;
            }
            if consumed == data.len() && (!finish || status == Status::StreamEnd) {
                return Ok(());
            }
        }
    }

    /// Finalizes the entry: drains the compressor, patches the provisional
    /// local header with the real CRC and sizes, and restores the stream
    /// position for whatever is appended next. Idempotent.
    fn finish(&self) -> Result<EntryTotals> {
        let mut state = self.state.borrow_mut();
        if !state.finished {
            self.deflate_chunk(&mut state, &[], true)?;
            state.finished = true;

            let crc32 = state.crc.clone().finalize();
            let mut local = LocalFileHeader::new(false);
            local.crc32 = crc32;
            local.compressed_size = state.compressed as u32;
            local.uncompressed_size = state.uncompressed as u32;
            local.name_len = self.name_len;

            let mut out = self.sink.inner.borrow_mut();
            let resume = out.stream_position()?;
            out.seek(SeekFrom::Start(self.header_offset))?;
            local.write(&mut *out)?;
            out.seek(SeekFrom::Start(resume))?;
        }
        Ok(EntryTotals {
            crc32: state.crc.clone().finalize(),
            compressed: state.compressed,
            uncompressed: state.uncompressed,
        })
    }
}

impl<W: Write + Seek> io::Write for &EntrySink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        EntrySink::write(*self, buf).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// ZIP archive writer over a seekable stream.
pub struct ZipWriter<W: Write + Seek> {
    sink: Strong<SharedSink<W>>,
    /// Stream position at construction; record offsets are relative to it.
    base: u64,
    records: Vec<DirRecord>,
    names: HashSet<String>,
    current: Option<(usize, Strong<EntrySink<W>>)>,
    /// Running end of entry data, relative to `base`; where the central
    /// directory will start.
    cd_start: u64,
    flushed: bool,
}

impl ZipWriter<File> {
    /// Creates (truncating) an archive file for writing.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<ZipWriter<File>> {
        ZipWriter::from_stream(File::create(path)?)
    }
}

impl<W: Write + Seek> ZipWriter<W> {
    /// Wraps an arbitrary seekable stream. The current stream position
    /// becomes the archive's base offset.
    pub fn from_stream(mut sink: W) -> Result<ZipWriter<W>> {
        let base = sink.stream_position()?;
        Ok(ZipWriter {
            sink: Strong::new(SharedSink {
                inner: RefCell::new(sink),
            }),
            base,
            records: Vec::new(),
            names: HashSet::new(),
            current: None,
            cd_start: 0,
            flushed: false,
        })
    }

    /// Declares a new entry and returns a weak handle to its byte sink.
    ///
    /// Folder records for every `/`-separated prefix of `name` are created
    /// first, shallowest to deepest. Returns `Ok(None)` without touching the
    /// archive when the name is empty, longer than the 16-bit name-length
    /// field can record, already present, names a folder (trailing `/`), or
    /// the archive is already flushed.
    ///
    /// Any previously open entry is finalized; its handle stops promoting.
    pub fn add_item(&mut self, name: &str) -> Result<Option<Weak<EntrySink<W>>>> {
        if name.is_empty() || name.len() > u16::MAX as usize || self.names.contains(name) {
            return Ok(None);
        }
        if self.flushed {
            warn!("add_item({:?}) after flush ignored", name);
            return Ok(None);
        }

        self.close_current()?;
        self.add_folders(name)?;
        if name.ends_with('/') {
            return Ok(None);
        }

        let index = match self.declare(name, false)? {
            Some(index) => index,
            None => return Ok(None),
        };
        let header_offset = self.base + self.records[index].header.local_header_offset;
        let entry = Strong::new(EntrySink::new(
            self.sink.clone(),
            header_offset,
            name.len() as u16,
        ));
        let handle = entry.downgrade();
        self.current = Some((index, entry));
        Ok(Some(handle))
    }

    /// Creates a folder record for each `/`-terminated prefix of `name` that
    /// does not exist yet.
    fn add_folders(&mut self, name: &str) -> Result<()> {
        let mut pos = 0;
        while let Some(i) = name[pos..].find('/') {
            pos += i + 1;
            let folder = &name[..pos];
            if !self.names.contains(folder) {
                self.declare(folder, true)?;
            }
        }
        Ok(())
    }

    /// Appends a provisional local header + name and allocates the matching
    /// central directory record. Returns the record index for file entries.
    fn declare(&mut self, name: &str, folder: bool) -> Result<Option<usize>> {
        let mut local = LocalFileHeader::new(folder);
        local.name_len = name.len() as u16;
        {
            let mut out = self.sink.inner.borrow_mut();
            out.seek(SeekFrom::Start(self.base + self.cd_start))?;
            local.write(&mut *out)?;
            out.write_all(name.as_bytes())?;
        }

        let mut header = CentralFileHeader::new(folder);
        header.name_len = name.len() as u16;
        header.local_header_offset = self.cd_start;
        trace!("declared {:?} at offset {}", name, self.cd_start);

        self.cd_start += LocalFileHeader::SIZE + name.len() as u64;
        self.names.insert(name.to_string());
        self.records.push(DirRecord {
            name: name.to_string(),
            header,
        });
        if folder {
            Ok(None)
        } else {
            Ok(Some(self.records.len() - 1))
        }
    }

    /// Finalizes the open entry, if any, dropping the writer's strong handle
    /// so the caller's weak handle stops promoting.
    fn close_current(&mut self) -> Result<()> {
        if let Some((index, entry)) = self.current.take() {
            let totals = entry.finish()?;
            let header = &mut self.records[index].header;
            header.crc32 = totals.crc32;
            header.compressed_size = totals.compressed;
            header.uncompressed_size = totals.uncompressed;
            self.cd_start += totals.compressed;
        }
        Ok(())
    }

    /// Writes the central directory and end records, completing the archive.
    /// Idempotent: a second call emits nothing.
    pub fn flush(&mut self) -> Result<()> {
        if self.flushed {
            return Ok(());
        }
        self.close_current()?;

        let mut out = self.sink.inner.borrow_mut();
        out.seek(SeekFrom::Start(self.base + self.cd_start))?;
        let mut cd_size = 0u64;
        for record in &self.records {
            record.header.write(&mut *out)?;
            out.write_all(record.name.as_bytes())?;
            cd_size += CentralFileHeader::SIZE + record.header.name_len as u64;
        }

        let total = self.records.len() as u64;
        let total_16 = if total >= ENTRY_COUNT_SENTINEL as u64 {
            // The 16-bit count saturates; readers follow the locator to the
            // 64-bit record instead.
            let record_offset = self.cd_start + cd_size;
            Zip64EndOfCentralDirectory {
                record_size: Zip64EndOfCentralDirectory::FIXED_RECORD_SIZE,
                version_made_by: 45,
                version_needed: 45,
                disk_number: 0,
                cd_disk_number: 0,
                entries_on_disk: total,
                total_entries: total,
                central_directory_size: cd_size,
                central_directory_start: self.cd_start,
            }
            .write(&mut *out)?;
            Zip64EndOfCentralDirectoryLocator {
                disk_number: 0,
                record_offset,
                total_disks: 1,
            }
            .write(&mut *out)?;
            ENTRY_COUNT_SENTINEL
        } else {
            total as u16
        };

        EndOfCentralDirectory {
            disk_number: 0,
            cd_disk_number: 0,
            entries_on_disk: total_16,
            total_entries: total_16,
            central_directory_size: cd_size as u32,
            central_directory_start: self.cd_start as u32,
            comment_len: 0,
        }
        .write(&mut *out)?;
        out.flush()?;

        self.flushed = true;
        Ok(())
    }
}

impl<W: Write + Seek> Drop for ZipWriter<W> {
    fn drop(&mut self) {
        if !self.flushed {
            if let Err(e) = self.flush() {
                warn!("archive flush on drop failed: {}", e);
            }
        }
    }
}
