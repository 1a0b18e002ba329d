use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::process::Command;

use tempfile::tempdir;

use refzip::{ZipReader, ZipWriter};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn round_trip_bytes_and_crc() {
    init_logging();
    let dir = tempdir().unwrap();
    let path = dir.path().join("roundtrip.zip");

    let payload: Vec<u8> = (0..100_000u32).flat_map(|i| i.to_le_bytes()).collect();

    {
        let mut writer = ZipWriter::create(&path).unwrap();
        let item = writer.add_item("data.bin").unwrap().unwrap();
        let sink = item.promote().unwrap();
        for chunk in payload.chunks(7000) {
            sink.write(chunk).unwrap();
        }
        drop(sink);
        writer.flush().unwrap();
    }

    let reader = ZipReader::open(&path).unwrap();
    assert!(reader.good());
    assert!(reader.exist("data.bin"));

    let mut entry = reader.item("data.bin").unwrap();
    assert_eq!(entry.size(), payload.len() as u64);
    assert_eq!(entry.crc32(), crc32fast::hash(&payload));

    let mut out = Vec::new();
    entry.read_to_end(&mut out).unwrap();
    assert_eq!(out, payload);
}

#[test]
fn nested_path_creates_folder_records() {
    init_logging();
    let dir = tempdir().unwrap();
    let path = dir.path().join("folders.zip");

    {
        let mut writer = ZipWriter::create(&path).unwrap();
        let a = writer.add_item("a.txt").unwrap().unwrap();
        a.promote().unwrap().write(b"alpha").unwrap();
        let b = writer.add_item("dir/b.txt").unwrap().unwrap();
        b.promote().unwrap().write(b"beta").unwrap();
        writer.flush().unwrap();
    }

    let reader = ZipReader::open(&path).unwrap();
    let entries = reader.entries();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].name, "a.txt");
    assert_eq!(entries[1].name, "dir/");
    assert_eq!(entries[2].name, "dir/b.txt");

    let folder = &entries[1];
    assert!(folder.folder);
    assert_eq!(folder.method, 0);
    assert_eq!(folder.compressed_size, 0);
    assert_eq!(folder.uncompressed_size, 0);

    let mut content = String::new();
    reader
        .item("dir/b.txt")
        .unwrap()
        .read_to_string(&mut content)
        .unwrap();
    assert_eq!(content, "beta");
}

#[test]
fn duplicate_add_item_returns_no_handle() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("dup.zip");

    {
        let mut writer = ZipWriter::create(&path).unwrap();
        let first = writer.add_item("a.txt").unwrap().unwrap();
        first.promote().unwrap().write(b"once").unwrap();

        assert!(writer.add_item("a.txt").unwrap().is_none());
        assert!(writer.add_item("").unwrap().is_none());
        writer.flush().unwrap();
    }

    let reader = ZipReader::open(&path).unwrap();
    assert_eq!(reader.entries().len(), 1);
    let mut content = String::new();
    reader
        .item("a.txt")
        .unwrap()
        .read_to_string(&mut content)
        .unwrap();
    assert_eq!(content, "once");
}

#[test]
fn overlong_name_returns_no_handle() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("longname.zip");

    {
        let mut writer = ZipWriter::create(&path).unwrap();
        // The name-length field is 16 bits; a longer name cannot be recorded.
        let long = "x".repeat(u16::MAX as usize + 1);
        assert!(writer.add_item(&long).unwrap().is_none());

        let ok = writer.add_item("short.txt").unwrap().unwrap();
        ok.promote().unwrap().write(b"fits").unwrap();
        writer.flush().unwrap();
    }

    let reader = ZipReader::open(&path).unwrap();
    assert!(reader.good());
    assert_eq!(reader.entries().len(), 1);
    assert!(reader.exist("short.txt"));
}

#[test]
fn double_flush_emits_no_additional_bytes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("flush.zip");

    let mut writer = ZipWriter::create(&path).unwrap();
    let item = writer.add_item("a.txt").unwrap().unwrap();
    item.promote().unwrap().write(b"payload").unwrap();
    writer.flush().unwrap();
    let len_after_first = fs::metadata(&path).unwrap().len();

    writer.flush().unwrap();
    drop(writer); // drop also re-flushes, and must also be a no-op
    assert_eq!(fs::metadata(&path).unwrap().len(), len_after_first);
}

#[test]
fn entry_handle_stops_promoting_after_finalize() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("exclusive.zip");

    let mut writer = ZipWriter::create(&path).unwrap();
    let first = writer.add_item("a.txt").unwrap().unwrap();
    first.promote().unwrap().write(b"alpha").unwrap();

    // Declaring the next entry finalizes the previous one; the old handle
    // must no longer promote.
    let second = writer.add_item("b.txt").unwrap().unwrap();
    assert!(first.promote().is_none());
    second.promote().unwrap().write(b"beta").unwrap();

    writer.flush().unwrap();
    assert!(second.promote().is_none());

    let reader = ZipReader::open(&path).unwrap();
    assert!(reader.exist("a.txt"));
    assert!(reader.exist("b.txt"));
}

#[test]
fn write_to_finalized_entry_fails() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("stale.zip");

    let mut writer = ZipWriter::create(&path).unwrap();
    let first = writer.add_item("a.txt").unwrap().unwrap();
    let sink = first.promote().unwrap();
    sink.write(b"alpha").unwrap();

    writer.add_item("b.txt").unwrap().unwrap();
    // The caller kept a promoted handle across the finalize; the host is
    // still alive but refuses further data.
    assert!(sink.write(b"late").is_err());
}

#[test]
fn entry_reader_outlives_its_reader() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("extend.zip");

    {
        let mut writer = ZipWriter::create(&path).unwrap();
        let item = writer.add_item("a.txt").unwrap().unwrap();
        item.promote().unwrap().write(b"still readable").unwrap();
        writer.flush().unwrap();
    }

    let reader = ZipReader::open(&path).unwrap();
    let mut entry = reader.item("a.txt").unwrap();
    drop(reader);

    // The entry stream holds its own strong handle to the byte source.
    let mut content = String::new();
    entry.read_to_string(&mut content).unwrap();
    assert_eq!(content, "still readable");
}

#[test]
fn archive_embedded_at_an_offset() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("embedded.bin");

    let preamble = b"not-a-zip-preamble";
    {
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(preamble).unwrap();
        let mut writer = ZipWriter::from_stream(file).unwrap();
        let item = writer.add_item("a.txt").unwrap().unwrap();
        item.promote().unwrap().write(b"embedded").unwrap();
        writer.flush().unwrap();
    }

    let mut file = fs::File::open(&path).unwrap();
    file.seek(SeekFrom::Start(preamble.len() as u64)).unwrap();
    let reader = ZipReader::from_stream(file).unwrap();
    assert!(reader.good());
    let mut content = String::new();
    reader
        .item("a.txt")
        .unwrap()
        .read_to_string(&mut content)
        .unwrap();
    assert_eq!(content, "embedded");
}

#[test]
fn corrupt_central_record_strict_vs_lenient() {
    init_logging();
    let dir = tempdir().unwrap();
    let path = dir.path().join("corrupt.zip");

    {
        let mut writer = ZipWriter::create(&path).unwrap();
        let a = writer.add_item("a.txt").unwrap().unwrap();
        a.promote().unwrap().write(b"alpha").unwrap();
        let b = writer.add_item("b.txt").unwrap().unwrap();
        b.promote().unwrap().write(b"beta").unwrap();
        writer.flush().unwrap();
    }

    // Smash the signature of the second central directory record.
    let mut bytes = fs::read(&path).unwrap();
    let sig = 0x0201_4B50u32.to_le_bytes();
    let second = bytes
        .windows(4)
        .enumerate()
        .filter(|(_, w)| *w == sig)
        .map(|(i, _)| i)
        .nth(1)
        .unwrap();
    bytes[second] ^= 0xFF;
    fs::write(&path, &bytes).unwrap();

    let strict = ZipReader::open(&path).unwrap();
    assert!(!strict.good());
    assert!(!strict.exist("a.txt"));

    let lenient = ZipReader::open(&path).unwrap().lenient();
    assert!(lenient.good());
    assert!(lenient.exist("a.txt"));
    assert!(!lenient.exist("b.txt"));
}

// A corrupt record in the middle of the directory must not take the records
// after it down too: lenient mode resyncs on the next record signature.
#[test]
fn lenient_recovers_records_after_a_corrupt_one() {
    init_logging();
    let dir = tempdir().unwrap();
    let path = dir.path().join("resync.zip");

    {
        let mut writer = ZipWriter::create(&path).unwrap();
        for name in ["a.txt", "b.txt", "c.txt"] {
            let item = writer.add_item(name).unwrap().unwrap();
            item.promote().unwrap().write(name.as_bytes()).unwrap();
        }
        writer.flush().unwrap();
    }

    // Smash the signature of the first central directory record.
    let mut bytes = fs::read(&path).unwrap();
    let sig = 0x0201_4B50u32.to_le_bytes();
    let first = bytes
        .windows(4)
        .position(|w| w == sig)
        .unwrap();
    bytes[first] ^= 0xFF;
    fs::write(&path, &bytes).unwrap();

    let lenient = ZipReader::open(&path).unwrap().lenient();
    assert!(lenient.good());
    assert!(!lenient.exist("a.txt"));
    assert!(lenient.exist("b.txt"));
    assert!(lenient.exist("c.txt"));

    let mut content = String::new();
    lenient
        .item("c.txt")
        .unwrap()
        .read_to_string(&mut content)
        .unwrap();
    assert_eq!(content, "c.txt");
}

// Writes an archive and verifies it with `unzip -t`; skipped when `unzip`
// is not installed.
#[test]
fn unzip_compatibility() {
    if Command::new("unzip").arg("-v").output().is_err() {
        eprintln!("skipping test: `unzip` not found");
        return;
    }

    let dir = tempdir().unwrap();
    let path = dir.path().join("compat.zip");

    {
        let mut writer = ZipWriter::create(&path).unwrap();
        let hello = writer.add_item("hello.txt").unwrap().unwrap();
        hello.promote().unwrap().write(b"hello from test").unwrap();
        let big = writer.add_item("nested/big.bin").unwrap().unwrap();
        let sink = big.promote().unwrap();
        for _ in 0..1024 {
            sink.write(&[0u8; 1024]).unwrap();
        }
        drop(sink);
        writer.flush().unwrap();
    }

    let output = Command::new("unzip")
        .arg("-t")
        .arg(&path)
        .output()
        .expect("failed to run unzip");
    assert!(
        output.status.success(),
        "unzip reported failure: {} {}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}
