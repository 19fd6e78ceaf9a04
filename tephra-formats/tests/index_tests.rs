//! Archive-index round trips through the public API.

use tempfile::TempDir;
use tephra_formats::group::test_support::write_index;
use tephra_formats::index::{IndexFile, IndexKind};

#[test]
fn archive_index_lookup_round_trip() {
    let _ = tracing_subscriber::fmt::try_init();
    let dir = TempDir::new().unwrap();

    let entries: Vec<(Vec<u8>, u64, u64)> = vec![
        (vec![0x11; 16], 100, 0),
        (vec![0x22; 16], 100, 100),
        (vec![0x33; 16], 50, 200),
    ];
    let path = dir.path().join("a.index");
    let name = write_index(&path, &entries, 4, 16, 4, 4);
    assert_eq!(name.len(), 32);

    let index = IndexFile::open(&path).unwrap();
    assert_eq!(index.footer().kind(), IndexKind::Archive);
    assert_eq!(index.footer().num_elements, 3);

    let hit = index.lookup(&[0x22; 16]).unwrap();
    assert_eq!((hit.offset, hit.size), (100, 100));
    assert_eq!(hit.archive_index, None);

    assert!(index.lookup(&[0x44; 16]).is_none());

    // Enumeration yields exactly the entries lookup can find.
    let listed: Vec<_> = index.iter().collect();
    assert_eq!(listed.len(), 3);
    for entry in listed {
        assert_eq!(index.lookup(&entry.key), Some(entry.location));
    }
}

#[test]
fn group_flavor_decodes_archive_and_offset() {
    let dir = TempDir::new().unwrap();

    // Group entries pack (archive << 32) | offset into the offset field.
    let entries: Vec<(Vec<u8>, u64, u64)> = vec![
        (vec![0x10; 16], 64, (3u64 << 32) | 4096),
        (vec![0x20; 16], 128, (0u64 << 32) | 512),
    ];
    let path = dir.path().join("g.index");
    write_index(&path, &entries, 4, 16, 4, 6);

    let index = IndexFile::open(&path).unwrap();
    assert_eq!(index.footer().kind(), IndexKind::Group);

    let hit = index.lookup(&[0x10; 16]).unwrap();
    assert_eq!(hit.archive_index, Some(3));
    assert_eq!((hit.offset, hit.size), (4096, 64));

    let hit = index.lookup(&[0x20; 16]).unwrap();
    assert_eq!(hit.archive_index, Some(0));
    assert_eq!((hit.offset, hit.size), (512, 128));
}
