use std::io::{Cursor, Read};

use tempfile::tempdir;

use refzip::{ZipReader, ZipWriter};

fn sample_archive() -> Vec<u8> {
    let dir = tempdir().unwrap();
    let path = dir.path().join("sample.zip");
    let mut writer = ZipWriter::create(&path).unwrap();
    let item = writer.add_item("a.txt").unwrap().unwrap();
    item.promote().unwrap().write(b"alpha").unwrap();
    writer.flush().unwrap();
    drop(writer);
    std::fs::read(&path).unwrap()
}

// An archive comment may contain the end-record signature. Such a look-alike
// fails the comment-length cross-check and the scan must keep going until it
// reaches the real record.
#[test]
fn signature_look_alike_in_comment_is_rejected() {
    let mut bytes = sample_archive();
    let eocd_pos = bytes.len() - 22;

    // Declare a 22-byte comment on the real end record, then append a fake
    // end record as that comment. The fake claims a 7-byte comment, which
    // does not reach the end of the stream.
    bytes[eocd_pos + 20..eocd_pos + 22].copy_from_slice(&22u16.to_le_bytes());
    let mut fake = Vec::new();
    fake.extend_from_slice(&[0x50, 0x4b, 0x05, 0x06]);
    fake.extend_from_slice(&[0u8; 16]);
    fake.extend_from_slice(&7u16.to_le_bytes());
    bytes.extend_from_slice(&fake);

    let reader = ZipReader::from_stream(Cursor::new(bytes)).unwrap();
    assert!(reader.good());
    assert!(reader.exist("a.txt"));

    let mut content = String::new();
    reader
        .item("a.txt")
        .unwrap()
        .read_to_string(&mut content)
        .unwrap();
    assert_eq!(content, "alpha");
}

// Trailing bytes after the end record make its declared comment length
// wrong; the archive is no longer well formed.
#[test]
fn trailing_garbage_invalidates_archive() {
    let mut bytes = sample_archive();
    bytes.extend_from_slice(b"garbage past the end record");

    let reader = ZipReader::from_stream(Cursor::new(bytes)).unwrap();
    assert!(!reader.good());
    assert!(!reader.exist("a.txt"));
    assert!(reader.item("a.txt").is_none());
}

#[test]
fn stream_without_end_record_is_invalid() {
    let reader = ZipReader::from_stream(Cursor::new(vec![0u8; 10_000])).unwrap();
    assert!(!reader.good());

    // Too short to even hold an end record.
    let reader = ZipReader::from_stream(Cursor::new(vec![0u8; 5])).unwrap();
    assert!(!reader.good());
}

// The verdict is computed once; later queries reuse it.
#[test]
fn validation_is_memoized() {
    let bytes = sample_archive();
    let reader = ZipReader::from_stream(Cursor::new(bytes)).unwrap();
    assert!(reader.good());
    assert!(reader.good());
    assert!(reader.exist("a.txt"));
    assert!(!reader.exist("missing.txt"));
}
