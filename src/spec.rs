//! Fixed binary layouts of the ZIP container records
//!
//! Everything that touches the on-disk byte format lives here; the higher
//! level logic stays in [`reader`](crate::reader) and
//! [`writer`](crate::writer). All multi-byte fields are little-endian.
//!
//! In-memory size and offset fields are widened to `u64` so the ZIP64
//! overrides parsed elsewhere can be stored without truncation; `write`
//! narrows them back to their on-disk width.

use std::io::{self, Read, Write};

use crate::error::{Result, ZipError};

pub const LOCAL_FILE_HEADER_SIG: u32 = 0x0403_4B50;
pub const CENTRAL_FILE_HEADER_SIG: u32 = 0x0201_4B50;
pub const END_OF_CENTRAL_DIRECTORY_SIG: u32 = 0x0605_4B50;
pub const ZIP64_END_OF_CENTRAL_DIRECTORY_SIG: u32 = 0x0606_4B50;
pub const ZIP64_LOCATOR_SIG: u32 = 0x0706_4B50;

/// Stored (no compression); used for folder records.
pub const METHOD_STORE: u16 = 0;
/// Raw DEFLATE; used for file entries.
pub const METHOD_DEFLATE: u16 = 8;

/// "Version needed" value signalling the ZIP64 local extra field format.
pub const VERSION_ZIP64: u16 = 45;

/// Sentinel in the 16-bit entry-count field meaning "consult the ZIP64 record".
pub const ENTRY_COUNT_SENTINEL: u16 = 0xFFFF;

/// Fixed DOS datetime stamped on every entry; the codec does not track
/// modification times.
const DOS_DATETIME: u32 = 0x40E2_4E87;

fn read_u16<R: Read>(r: &mut R) -> io::Result<u16> {
    let mut b = [0u8; 2];
    r.read_exact(&mut b)?;
    Ok(u16::from_le_bytes(b))
}

fn read_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

fn read_u64<R: Read>(r: &mut R) -> io::Result<u64> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(u64::from_le_bytes(b))
}

fn write_u16<W: Write>(w: &mut W, v: u16) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_u32<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_u64<W: Write>(w: &mut W, v: u64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

/// Per-entry header written immediately before the entry's data.
///
/// Written provisionally (zero CRC and sizes) when an entry is declared and
/// patched in place once the entry's data has been fully produced.
#[derive(Debug, Clone)]
pub struct LocalFileHeader {
    pub version_needed: u16,
    pub flags: u16,
    pub method: u16,
    pub datetime: u32,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub name_len: u16,
    pub extra_len: u16,
}

impl LocalFileHeader {
    /// Fixed prefix size in the file, including the signature.
    pub const SIZE: u64 = 30;

    pub fn new(folder: bool) -> LocalFileHeader {
        LocalFileHeader {
            version_needed: if folder { 10 } else { 20 },
            flags: 0,
            method: if folder { METHOD_STORE } else { METHOD_DEFLATE },
            datetime: DOS_DATETIME,
            crc32: 0,
            compressed_size: 0,
            uncompressed_size: 0,
            name_len: 0,
            extra_len: 0,
        }
    }

    pub fn parse<R: Read>(r: &mut R) -> Result<LocalFileHeader> {
        if read_u32(r)? != LOCAL_FILE_HEADER_SIG {
            return Err(ZipError::InvalidFormat("bad local file header signature"));
        }
        Ok(LocalFileHeader {
            version_needed: read_u16(r)?,
            flags: read_u16(r)?,
            method: read_u16(r)?,
            datetime: read_u32(r)?,
            crc32: read_u32(r)?,
            compressed_size: read_u32(r)?,
            uncompressed_size: read_u32(r)?,
            name_len: read_u16(r)?,
            extra_len: read_u16(r)?,
        })
    }

    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        write_u32(w, LOCAL_FILE_HEADER_SIG)?;
        write_u16(w, self.version_needed)?;
        write_u16(w, self.flags)?;
        write_u16(w, self.method)?;
        write_u32(w, self.datetime)?;
        write_u32(w, self.crc32)?;
        write_u32(w, self.compressed_size)?;
        write_u32(w, self.uncompressed_size)?;
        write_u16(w, self.name_len)?;
        write_u16(w, self.extra_len)?;
        Ok(())
    }
}

/// Per-entry record in the central directory, the archive's durable index.
#[derive(Debug, Clone)]
pub struct CentralFileHeader {
    pub version_made_by: u16,
    pub version_needed: u16,
    pub flags: u16,
    pub method: u16,
    pub datetime: u32,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub name_len: u16,
    pub extra_len: u16,
    pub comment_len: u16,
    pub disk_number: u16,
    pub internal_attrs: u16,
    pub external_attrs: u32,
    pub local_header_offset: u64,
}

impl CentralFileHeader {
    /// Fixed prefix size in the file, including the signature.
    pub const SIZE: u64 = 46;

    pub fn new(folder: bool) -> CentralFileHeader {
        CentralFileHeader {
            version_made_by: 20,
            version_needed: if folder { 10 } else { 20 },
            flags: 0,
            method: if folder { METHOD_STORE } else { METHOD_DEFLATE },
            datetime: DOS_DATETIME,
            crc32: 0,
            compressed_size: 0,
            uncompressed_size: 0,
            name_len: 0,
            extra_len: 0,
            comment_len: 0,
            disk_number: 0,
            internal_attrs: if folder { 0 } else { 1 },
            external_attrs: if folder { 0x10 } else { 0x20 },
            local_header_offset: 0,
        }
    }

    pub fn is_folder(&self) -> bool {
        self.internal_attrs == 0
    }

    pub fn parse<R: Read>(r: &mut R) -> Result<CentralFileHeader> {
        if read_u32(r)? != CENTRAL_FILE_HEADER_SIG {
            return Err(ZipError::InvalidFormat("bad central directory signature"));
        }
        Ok(CentralFileHeader {
            version_made_by: read_u16(r)?,
            version_needed: read_u16(r)?,
            flags: read_u16(r)?,
            method: read_u16(r)?,
            datetime: read_u32(r)?,
            crc32: read_u32(r)?,
            compressed_size: read_u32(r)? as u64,
            uncompressed_size: read_u32(r)? as u64,
            name_len: read_u16(r)?,
            extra_len: read_u16(r)?,
            comment_len: read_u16(r)?,
            disk_number: read_u16(r)?,
            internal_attrs: read_u16(r)?,
            external_attrs: read_u32(r)?,
            local_header_offset: read_u32(r)? as u64,
        })
    }

    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        write_u32(w, CENTRAL_FILE_HEADER_SIG)?;
        write_u16(w, self.version_made_by)?;
        write_u16(w, self.version_needed)?;
        write_u16(w, self.flags)?;
        write_u16(w, self.method)?;
        write_u32(w, self.datetime)?;
        write_u32(w, self.crc32)?;
        write_u32(w, self.compressed_size as u32)?;
        write_u32(w, self.uncompressed_size as u32)?;
        write_u16(w, self.name_len)?;
        write_u16(w, self.extra_len)?;
        write_u16(w, self.comment_len)?;
        write_u16(w, self.disk_number)?;
        write_u16(w, self.internal_attrs)?;
        write_u32(w, self.external_attrs)?;
        write_u32(w, self.local_header_offset as u32)?;
        Ok(())
    }
}

/// The archive's root pointer, found by scanning backward from the file end.
#[derive(Debug, Clone)]
pub struct EndOfCentralDirectory {
    pub disk_number: u16,
    pub cd_disk_number: u16,
    pub entries_on_disk: u16,
    pub total_entries: u16,
    pub central_directory_size: u32,
    pub central_directory_start: u32,
    pub comment_len: u16,
}

impl EndOfCentralDirectory {
    /// Fixed prefix size in the file, including the signature.
    pub const SIZE: u64 = 22;

    pub fn parse<R: Read>(r: &mut R) -> Result<EndOfCentralDirectory> {
        if read_u32(r)? != END_OF_CENTRAL_DIRECTORY_SIG {
            return Err(ZipError::InvalidFormat(
                "bad end of central directory signature",
            ));
        }
        Ok(EndOfCentralDirectory {
            disk_number: read_u16(r)?,
            cd_disk_number: read_u16(r)?,
            entries_on_disk: read_u16(r)?,
            total_entries: read_u16(r)?,
            central_directory_size: read_u32(r)?,
            central_directory_start: read_u32(r)?,
            comment_len: read_u16(r)?,
        })
    }

    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        write_u32(w, END_OF_CENTRAL_DIRECTORY_SIG)?;
        write_u16(w, self.disk_number)?;
        write_u16(w, self.cd_disk_number)?;
        write_u16(w, self.entries_on_disk)?;
        write_u16(w, self.total_entries)?;
        write_u32(w, self.central_directory_size)?;
        write_u32(w, self.central_directory_start)?;
        write_u16(w, self.comment_len)?;
        Ok(())
    }
}

/// 64-bit variant of the end-of-central-directory record, used once the
/// 16-bit entry count saturates.
#[derive(Debug, Clone)]
pub struct Zip64EndOfCentralDirectory {
    pub record_size: u64,
    pub version_made_by: u16,
    pub version_needed: u16,
    pub disk_number: u32,
    pub cd_disk_number: u32,
    pub entries_on_disk: u64,
    pub total_entries: u64,
    pub central_directory_size: u64,
    pub central_directory_start: u64,
}

impl Zip64EndOfCentralDirectory {
    /// Fixed prefix size in the file, including the signature.
    pub const SIZE: u64 = 56;

    /// Value of `record_size` for the fixed form written here (everything
    /// after the leading signature + size fields).
    pub const FIXED_RECORD_SIZE: u64 = 44;

    pub fn parse<R: Read>(r: &mut R) -> Result<Zip64EndOfCentralDirectory> {
        if read_u32(r)? != ZIP64_END_OF_CENTRAL_DIRECTORY_SIG {
            return Err(ZipError::InvalidFormat(
                "bad zip64 end of central directory signature",
            ));
        }
        Ok(Zip64EndOfCentralDirectory {
            record_size: read_u64(r)?,
            version_made_by: read_u16(r)?,
            version_needed: read_u16(r)?,
            disk_number: read_u32(r)?,
            cd_disk_number: read_u32(r)?,
            entries_on_disk: read_u64(r)?,
            total_entries: read_u64(r)?,
            central_directory_size: read_u64(r)?,
            central_directory_start: read_u64(r)?,
        })
    }

    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        write_u32(w, ZIP64_END_OF_CENTRAL_DIRECTORY_SIG)?;
        write_u64(w, self.record_size)?;
        write_u16(w, self.version_made_by)?;
        write_u16(w, self.version_needed)?;
        write_u32(w, self.disk_number)?;
        write_u32(w, self.cd_disk_number)?;
        write_u64(w, self.entries_on_disk)?;
        write_u64(w, self.total_entries)?;
        write_u64(w, self.central_directory_size)?;
        write_u64(w, self.central_directory_start)?;
        Ok(())
    }
}

/// Points at the [`Zip64EndOfCentralDirectory`]; sits immediately before the
/// classic end-of-central-directory record.
#[derive(Debug, Clone)]
pub struct Zip64EndOfCentralDirectoryLocator {
    pub disk_number: u32,
    pub record_offset: u64,
    pub total_disks: u32,
}

impl Zip64EndOfCentralDirectoryLocator {
    /// Full size in the file, including the signature.
    pub const SIZE: u64 = 20;

    pub fn parse<R: Read>(r: &mut R) -> Result<Zip64EndOfCentralDirectoryLocator> {
        if read_u32(r)? != ZIP64_LOCATOR_SIG {
            return Err(ZipError::InvalidFormat("bad zip64 locator signature"));
        }
        Ok(Zip64EndOfCentralDirectoryLocator {
            disk_number: read_u32(r)?,
            record_offset: read_u64(r)?,
            total_disks: read_u32(r)?,
        })
    }

    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        write_u32(w, ZIP64_LOCATOR_SIG)?;
        write_u32(w, self.disk_number)?;
        write_u64(w, self.record_offset)?;
        write_u32(w, self.total_disks)?;
        Ok(())
    }
}

/// ZIP64 local extra field (tag `0x0001`) carrying true 64-bit sizes for an
/// entry whose local header signals [`VERSION_ZIP64`].
#[derive(Debug, Clone)]
pub struct Zip64ExtraField {
    pub uncompressed_size: u64,
    pub compressed_size: u64,
    pub local_header_offset: u64,
    pub disk_number: u32,
}

impl Zip64ExtraField {
    pub fn parse<R: Read>(r: &mut R) -> Result<Zip64ExtraField> {
        if read_u16(r)? != 0x0001 {
            return Err(ZipError::InvalidFormat("bad zip64 extra field tag"));
        }
        let _size = read_u16(r)?;
        Ok(Zip64ExtraField {
            uncompressed_size: read_u64(r)?,
            compressed_size: read_u64(r)?,
            local_header_offset: read_u64(r)?,
            disk_number: read_u32(r)?,
        })
    }
}
