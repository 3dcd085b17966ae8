//! Crash safety: cut the power at every point in a commit and check
//! that remounting always lands on exactly the pre- or post-transaction
//! state.

use ox6_kernel::{Config, Kernel, MemDisk, OpenFlags};

/// Runs the overwrite workload on a disk that dies after `cut` writes.
/// Returns the platter contents at the moment of death.
fn run_with_cut(image: &[u8], cut: u64) -> Vec<u8> {
    let disk = MemDisk::from_image(image);
    disk.cut_power_after(cut);

    let k = Kernel::boot(Config::default(), disk.clone());
    let init = k
        .user_init(|u| {
            let fd = u.open("f", OpenFlags::RDWR);
            assert!(fd >= 0);
            assert_eq!(u.write(fd, &[b'b'; 512]), 512);
            u.close(fd);
            0
        })
        .unwrap();
    assert_eq!(init.wait(), Some(0));
    k.shutdown();

    disk.snapshot()
}

/// Boots a fresh kernel on `image` (which replays the log) and reads
/// back the single file.
fn remount_and_read(image: &[u8]) -> Vec<u8> {
    let disk = MemDisk::from_image(image);
    let k = Kernel::boot(Config::default(), disk);
    let init = k
        .user_init(|u| {
            let fd = u.open("f", OpenFlags::RDONLY);
            assert!(fd >= 0, "file lost after crash");
            let mut buf = [0_u8; 512];
            assert_eq!(u.read(fd, &mut buf), 512, "file truncated after crash");
            // Smuggle the content out through the exit status: all-a,
            // all-b, or corrupt.
            if buf.iter().all(|&b| b == b'a') {
                return 1;
            }
            if buf.iter().all(|&b| b == b'b') {
                return 2;
            }
            3
        })
        .unwrap();
    let verdict = init.wait().expect("recovery kernel died");
    k.shutdown();
    match verdict {
        1 => vec![b'a'; 512],
        2 => vec![b'b'; 512],
        _ => panic!("file content is a mix of old and new"),
    }
}

// The workload performs a fixed write sequence:
//   1 write  -- mount clears the (empty) log header
//   2 writes -- commit copies the data and inode blocks into the log
//   1 write  -- commit writes the log header: the commit point
//   2 writes -- install copies the log onto the home blocks
//   1 write  -- the header is cleared
const TOTAL_WRITES: u64 = 7;
const COMMIT_POINT: u64 = 4;

#[test]
fn every_cut_point_recovers_to_old_or_new() {
    let image = ox6_mkfs::build_image(&[("f", &[b'a'; 512])]);

    // With power on throughout, the new content lands.
    let full = run_with_cut(&image, TOTAL_WRITES);
    assert_eq!(remount_and_read(&full), vec![b'b'; 512]);

    for cut in 0..TOTAL_WRITES {
        let after_crash = run_with_cut(&image, cut);
        let got = remount_and_read(&after_crash);
        let want = if cut >= COMMIT_POINT { b'b' } else { b'a' };
        assert_eq!(
            got,
            vec![want; 512],
            "cut after {cut} writes recovered to the wrong state"
        );
    }
}

#[test]
fn power_cut_between_header_and_install_replays_on_mount() {
    // The spec's scenario 4: die right after the header write, before
    // any install write. The header names the transaction, so the mount
    // replays it.
    let image = ox6_mkfs::build_image(&[("f", &[b'a'; 512])]);
    let after_crash = run_with_cut(&image, COMMIT_POINT);

    // The on-disk header still carries the committed transaction.
    let logstart = u32::from_le_bytes(
        after_crash[512 + 16..512 + 20].try_into().unwrap(),
    ) as usize;
    let n = u32::from_le_bytes(
        after_crash[logstart * 512..logstart * 512 + 4]
            .try_into()
            .unwrap(),
    );
    assert_eq!(n, 2, "commit header should name both blocks");

    assert_eq!(remount_and_read(&after_crash), vec![b'b'; 512]);
}

#[test]
fn repeated_writes_to_one_block_absorb_into_one_slot() {
    // Creating a file updates the new inode and the root directory's
    // inode, which share one inode block: several log_writes, one log
    // slot. The header written at the commit point shows the collapse.
    let image = ox6_mkfs::build_image(&[]);
    let disk = MemDisk::from_image(&image);

    let k = Kernel::boot(Config::default(), disk.clone());
    let init = k
        .user_init(|u| {
            // mount header-clear is 1 write; then this create commits.
            let fd = u.open("newfile", OpenFlags::CREATE.union(OpenFlags::RDWR));
            assert!(fd >= 0);
            u.close(fd);
            0
        })
        .unwrap();
    assert_eq!(init.wait(), Some(0));
    k.shutdown();
    let full = disk.snapshot();

    // Replay the same workload, dying right at the commit point:
    // 1 (mount) + n bodies + 1 header.
    let logstart =
        u32::from_le_bytes(full[512 + 16..512 + 20].try_into().unwrap()) as usize;

    let disk = MemDisk::from_image(&image);
    let k = Kernel::boot(Config::default(), disk.clone());
    // The create logs the shared inode block and the root data block.
    disk.cut_power_after(1 + 2 + 1);
    let init = k
        .user_init(|u| {
            let fd = u.open("newfile", OpenFlags::CREATE.union(OpenFlags::RDWR));
            assert!(fd >= 0);
            u.close(fd);
            0
        })
        .unwrap();
    assert_eq!(init.wait(), Some(0));
    k.shutdown();

    let snap = disk.snapshot();
    let n = u32::from_le_bytes(
        snap[logstart * 512..logstart * 512 + 4].try_into().unwrap(),
    );
    assert_eq!(n, 2, "absorption should collapse the inode-block writes");

    // And the replay makes the file appear.
    let disk = MemDisk::from_image(&snap);
    let k = Kernel::boot(Config::default(), disk);
    let init = k
        .user_init(|u| {
            let fd = u.open("newfile", OpenFlags::RDONLY);
            assert!(fd >= 0, "created file lost");
            0
        })
        .unwrap();
    assert_eq!(init.wait(), Some(0));
    k.shutdown();
}
