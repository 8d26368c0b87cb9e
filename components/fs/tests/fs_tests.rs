//! File-system integration: format/mount, the block cache's PTE-derived
//! dirty tracking, the bitmap allocator, direct/indirect file layout, and
//! path resolution, all against the simulated disk.

use kestrel_fs::layout::{self, BLKSIZE, NDIRECT};
use kestrel_fs::{FileHandle, FileSystem, FileType, PathResolution, RecordLoc};
use kestrel_kernel::config::MachineConfig;
use kestrel_kernel::error::KernelError;
use kestrel_kernel::Kernel;

const NBLOCKS: u32 = 64;

fn setup() -> (Kernel, FileSystem) {
    let mut k = Kernel::boot(MachineConfig::with_disk(layout::format(NBLOCKS)));
    let id = k.env_create(None).expect("fs env");
    k.run(id).expect("run fs env");
    let fs = FileSystem::mount(&mut k).expect("mount");
    (k, fs)
}

fn data_start() -> u32 {
    2 + layout::nbitblocks(NBLOCKS)
}

#[test]
fn mount_reads_the_superblock() {
    let (mut k, fs) = setup();
    assert_eq!(fs.nblocks(), NBLOCKS);
    let root = fs.load_rec(&mut k, &FileHandle::root()).unwrap();
    assert_eq!(root.ftype, FileType::Dir);
    assert_eq!(root.size, BLKSIZE);
}

#[test]
fn create_write_read_round_trip() {
    let (mut k, fs) = setup();

    let f = fs.file_create(&mut k, "/hello").expect("create");
    fs.file_set_size(&mut k, &f, 6).unwrap();
    fs.file_write(&mut k, &f, b"hello\n", 0).unwrap();

    let g = fs.file_open(&mut k, "/hello").expect("open");
    let rec = fs.load_rec(&mut k, &g).unwrap();
    assert_eq!(rec.name, "hello");
    assert_eq!(rec.size, 6);

    let mut buf = [0u8; 6];
    assert_eq!(fs.file_read(&mut k, &g, &mut buf, 0).unwrap(), 6);
    assert_eq!(&buf, b"hello\n");

    // Reads past the end are bounded by the size.
    assert_eq!(fs.file_read(&mut k, &g, &mut buf, 6).unwrap(), 0);
}

#[test]
fn contents_survive_a_cache_drop() {
    let (mut k, fs) = setup();

    let f = fs.file_create(&mut k, "/persist").unwrap();
    fs.file_write(&mut k, &f, b"written through", 0).unwrap();
    fs.file_close(&mut k, &f).unwrap();
    fs.sync(&mut k).unwrap();

    // Drop every data block from the cache; metadata blocks stay resident
    // so the bitmap remains consultable.
    for blockno in data_start()..NBLOCKS {
        fs.unmap_block(&mut k, blockno).unwrap();
    }

    let g = fs.file_open(&mut k, "/persist").unwrap();
    let mut buf = [0u8; 15];
    fs.file_read(&mut k, &g, &mut buf, 0).unwrap();
    assert_eq!(&buf, b"written through");
}

#[test]
fn write_block_round_trips_through_the_disk() {
    let (mut k, fs) = setup();

    // Back the superblock up into the reserved block's cache slot.
    let sb = fs.read_block(&mut k, 1).unwrap();
    let backup = fs.read_block(&mut k, 0).unwrap();
    let mut page = vec![0u8; BLKSIZE as usize];
    k.user_read(sb, &mut page).unwrap();
    k.user_write(backup, &page).unwrap();

    // Smash it, write it out, drop it, read it back.
    k.user_write(sb, b"OOPS!\n").unwrap();
    fs.write_block(&mut k, 1).unwrap();
    assert!(!fs.block_is_dirty(&mut k, 1).unwrap());
    fs.unmap_block(&mut k, 1).unwrap();
    assert!(!fs.block_is_mapped(&mut k, 1).unwrap());

    let sb = fs.read_block(&mut k, 1).unwrap();
    let mut smashed = [0u8; 6];
    k.user_read(sb, &mut smashed).unwrap();
    assert_eq!(&smashed, b"OOPS!\n");

    // Put the world back.
    let mut saved = vec![0u8; BLKSIZE as usize];
    k.user_read(backup, &mut saved).unwrap();
    k.user_write(sb, &saved).unwrap();
    fs.write_block(&mut k, 1).unwrap();
}

#[test]
fn bitmap_round_trip() {
    let (mut k, fs) = setup();

    let a = fs.alloc_block(&mut k).unwrap();
    let b = fs.alloc_block(&mut k).unwrap();
    assert_ne!(a, b, "successive allocations are distinct");
    assert!(!fs.block_is_free(&mut k, a).unwrap());

    // The bitmap block was written back as part of the allocation.
    assert!(!fs.block_is_dirty(&mut k, 2).unwrap());

    fs.free_block(&mut k, a).unwrap();
    assert!(fs.block_is_free(&mut k, a).unwrap());

    // LSB-first scan hands the lowest free block - the one just freed -
    // right back.
    assert_eq!(fs.alloc_block(&mut k).unwrap(), a);
}

#[test]
fn bitmap_exhaustion_and_recovery() {
    let (mut k, fs) = setup();

    let mut held = Vec::new();
    loop {
        match fs.alloc_block(&mut k) {
            Ok(b) => held.push(b),
            Err(KernelError::NoDisk) => break,
            Err(e) => panic!("unexpected allocation failure: {}", e),
        }
    }
    assert!(!held.is_empty());

    let victim = held[held.len() / 2];
    fs.free_block(&mut k, victim).unwrap();
    assert_eq!(fs.alloc_block(&mut k).unwrap(), victim);
}

#[test]
fn large_file_uses_and_releases_the_indirect_block() {
    let (mut k, fs) = setup();

    let nblocks_file = NDIRECT as u32 + 5;
    let f = fs.file_create(&mut k, "/big").unwrap();
    let chunk = vec![0xabu8; BLKSIZE as usize];
    for i in 0..nblocks_file {
        fs.file_write(&mut k, &f, &chunk, i * BLKSIZE).unwrap();
    }

    let rec = fs.load_rec(&mut k, &f).unwrap();
    assert_eq!(rec.size, nblocks_file * BLKSIZE);
    assert_ne!(rec.indirect, 0, "indirect block allocated past NDIRECT");
    let indirect = rec.indirect;
    assert!(rec.direct.iter().all(|&d| d != 0));

    // Shrink back into the direct pointers: the indirect block is freed
    // and its pointer zeroed.
    fs.file_set_size(&mut k, &f, NDIRECT as u32 * BLKSIZE).unwrap();
    let rec = fs.load_rec(&mut k, &f).unwrap();
    assert_eq!(rec.indirect, 0);
    assert!(fs.block_is_free(&mut k, indirect).unwrap());

    // Direct data is untouched.
    let mut buf = vec![0u8; BLKSIZE as usize];
    fs.file_read(&mut k, &f, &mut buf, 0).unwrap();
    assert_eq!(buf, chunk);
}

#[test]
fn truncate_then_restore_reads_zeros() {
    let (mut k, fs) = setup();

    let f = fs.file_create(&mut k, "/trunc").unwrap();
    let pattern = vec![0x77u8; 2 * BLKSIZE as usize];
    fs.file_write(&mut k, &f, &pattern, 0).unwrap();

    fs.file_set_size(&mut k, &f, BLKSIZE / 2).unwrap();
    fs.file_set_size(&mut k, &f, 2 * BLKSIZE).unwrap();

    let mut buf = vec![0u8; BLKSIZE as usize];
    // The formerly-truncated second block reads as zero fill.
    fs.file_read(&mut k, &f, &mut buf, BLKSIZE).unwrap();
    assert!(buf.iter().all(|&b| b == 0));
    // The surviving prefix is intact.
    let mut head = vec![0u8; (BLKSIZE / 2) as usize];
    fs.file_read(&mut k, &f, &mut head, 0).unwrap();
    assert!(head.iter().all(|&b| b == 0x77));
}

#[test]
fn walk_path_is_total() {
    let (mut k, fs) = setup();
    fs.file_create(&mut k, "/hello").unwrap();

    // Found, with and without a containing directory.
    match fs.walk_path(&mut k, "/").unwrap() {
        PathResolution::Found { dir: None, file } => assert_eq!(file.loc, RecordLoc::Root),
        other => panic!("root walk: {:?}", other),
    }
    match fs.walk_path(&mut k, "/hello").unwrap() {
        PathResolution::Found {
            dir: Some(dir),
            file,
        } => {
            assert_eq!(dir.loc, RecordLoc::Root);
            assert_eq!(file.parent, Some(RecordLoc::Root));
        }
        other => panic!("file walk: {:?}", other),
    }

    // Missing final component: the parent comes back for create's sake.
    match fs.walk_path(&mut k, "/nope").unwrap() {
        PathResolution::Missing {
            dir: Some(dir),
            last: Some(last),
        } => {
            assert_eq!(dir.loc, RecordLoc::Root);
            assert_eq!(last, "nope");
        }
        other => panic!("missing final: {:?}", other),
    }

    // Missing mid-path, and descent through a non-directory: no parent.
    for path in ["/nope/x", "/hello/x"] {
        match fs.walk_path(&mut k, path).unwrap() {
            PathResolution::Missing {
                dir: None,
                last: None,
            } => {}
            other => panic!("{}: {:?}", path, other),
        }
    }

    // Overlong component.
    let long = format!("/{}", "x".repeat(200));
    assert!(matches!(
        fs.walk_path(&mut k, &long),
        Err(KernelError::BadPath)
    ));

    // Slash runs collapse.
    assert!(matches!(
        fs.walk_path(&mut k, "//hello//").unwrap(),
        PathResolution::Found { .. }
    ));
}

#[test]
fn create_rejects_duplicates_and_missing_parents() {
    let (mut k, fs) = setup();
    fs.file_create(&mut k, "/once").unwrap();
    assert_eq!(
        fs.file_create(&mut k, "/once"),
        Err(KernelError::Exists)
    );
    assert_eq!(
        fs.file_create(&mut k, "/no/dir/here"),
        Err(KernelError::NotFound)
    );
}

#[test]
fn directory_grows_by_whole_blocks() {
    let (mut k, fs) = setup();

    // The root block holds BLKFILES records; one more forces growth.
    for i in 0..layout::BLKFILES + 1 {
        fs.file_create(&mut k, &format!("/f{}", i)).unwrap();
    }
    let root = fs.load_rec(&mut k, &FileHandle::root()).unwrap();
    assert_eq!(root.size, 2 * BLKSIZE);
    assert_eq!(root.size % BLKSIZE, 0);

    for i in 0..layout::BLKFILES + 1 {
        fs.file_open(&mut k, &format!("/f{}", i)).unwrap();
    }
}

#[test]
fn remove_frees_the_slot_for_reuse() {
    let (mut k, fs) = setup();

    let f = fs.file_create(&mut k, "/victim").unwrap();
    fs.file_write(&mut k, &f, b"data", 0).unwrap();
    fs.file_remove(&mut k, "/victim").unwrap();
    assert_eq!(
        fs.file_open(&mut k, "/victim"),
        Err(KernelError::NotFound)
    );

    // The record slot is reusable and the directory did not grow.
    fs.file_create(&mut k, "/fresh").unwrap();
    let root = fs.load_rec(&mut k, &FileHandle::root()).unwrap();
    assert_eq!(root.size, BLKSIZE);
}

#[test]
fn dirty_tracking_follows_the_pte() {
    let (mut k, fs) = setup();

    let f = fs.file_create(&mut k, "/d").unwrap();
    fs.file_write(&mut k, &f, b"x", 0).unwrap();
    let blockno = fs.file_map_block(&mut k, &f, 0, false).unwrap();
    assert!(fs.block_is_dirty(&mut k, blockno).unwrap());

    fs.write_block(&mut k, blockno).unwrap();
    assert!(!fs.block_is_dirty(&mut k, blockno).unwrap());

    // Touching the file dirties it again without changing contents.
    fs.file_dirty(&mut k, &f, 0).unwrap();
    assert!(fs.block_is_dirty(&mut k, blockno).unwrap());

    fs.file_flush(&mut k, &f).unwrap();
    assert!(!fs.block_is_dirty(&mut k, blockno).unwrap());
}

#[test]
#[should_panic(expected = "unmapping dirty block")]
fn unmapping_a_dirty_block_panics() {
    let (mut k, fs) = setup();
    let f = fs.file_create(&mut k, "/d").unwrap();
    fs.file_write(&mut k, &f, b"x", 0).unwrap();
    let blockno = fs.file_map_block(&mut k, &f, 0, false).unwrap();
    fs.unmap_block(&mut k, blockno).unwrap();
}

#[test]
#[should_panic(expected = "reading free block")]
fn reading_a_free_block_panics() {
    let (mut k, fs) = setup();
    let _ = fs.read_block(&mut k, NBLOCKS - 1);
}

#[test]
fn file_block_walk_rejects_out_of_range() {
    let (mut k, fs) = setup();
    let f = fs.file_create(&mut k, "/r").unwrap();
    assert!(matches!(
        fs.block_walk(&mut k, &f, layout::NINDIRECT as u32, false),
        Err(KernelError::Inval)
    ));
}
