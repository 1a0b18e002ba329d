//! # refzip
//!
//! Intrusive dual-refcounted handles and a streaming ZIP codec built on them.
//!
//! Two coupled pieces:
//!
//! - An ownership kernel ([`Strong`] / [`Weak`] handles over a [`Host`]):
//!   atomic strong/weak reference counting with host callbacks, lock-free
//!   weak-to-strong promotion, and a choice of which count governs the host's
//!   lifetime.
//! - A ZIP archive codec ([`ZipReader`] / [`ZipWriter`]) that streams through
//!   fixed 4 KiB buffers over any `Read + Seek` / `Write + Seek` stream, with
//!   ZIP64 directories for large entry counts. Shared streams and open-entry
//!   exclusivity are expressed through the kernel's handles rather than ad hoc
//!   bookkeeping.
//!
//! ## Writing
//!
//! ```no_run
//! # fn main() -> refzip::Result<()> {
//! let mut writer = refzip::ZipWriter::create("out.zip")?;
//! let item = writer.add_item("docs/readme.txt")?.unwrap();
//! let sink = item.promote().unwrap();
//! sink.write(b"hello")?;
//! drop(sink);
//! writer.flush()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Reading
//!
//! ```no_run
//! use std::io::Read;
//!
//! # fn main() -> refzip::Result<()> {
//! let reader = refzip::ZipReader::open("out.zip")?;
//! if let Some(mut entry) = reader.item("docs/readme.txt") {
//!     let mut data = Vec::new();
//!     entry.read_to_end(&mut data)?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod reader;
pub mod refcount;
pub mod spec;
pub mod writer;

pub use error::{Result, ZipError};
pub use reader::{EntryInfo, EntryReader, SharedSource, ZipReader};
pub use refcount::{HolderId, Host, Lifetime, Strong, Weak};
pub use writer::{EntrySink, SharedSink, ZipWriter};
