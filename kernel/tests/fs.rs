//! File system behavior through the system-call surface.

mod common;

use common::boot;
use ox6_kernel::OpenFlags;

const RW_CREATE: OpenFlags = OpenFlags::RDWR.union(OpenFlags::CREATE);

#[test]
fn writetest() {
    let k = boot(&[]);
    let init = k
        .user_init(|u| {
            let fd = u.open("small", RW_CREATE);
            assert!(fd >= 0, "create small failed");
            for _ in 0..50 {
                assert_eq!(u.write(fd, b"aaaaaaaaaa"), 10);
                assert_eq!(u.write(fd, b"bbbbbbbbbb"), 10);
            }
            u.close(fd);

            let fd = u.open("small", OpenFlags::RDONLY);
            assert!(fd >= 0, "open small failed");
            let mut buf = [0_u8; 2000];
            let mut got = Vec::new();
            loop {
                let n = u.read(fd, &mut buf);
                assert!(n >= 0);
                if n == 0 {
                    break;
                }
                got.extend_from_slice(&buf[..n as usize]);
            }
            assert_eq!(got.len(), 1000);
            assert!(got.chunks(10).enumerate().all(|(i, c)| {
                c.iter().all(|&b| b == if i % 2 == 0 { b'a' } else { b'b' })
            }));
            u.close(fd);
            assert_eq!(u.unlink("small"), 0);
            0
        })
        .unwrap();
    assert_eq!(init.wait(), Some(0));
    assert!(k.bcache_identities_unique());
    k.shutdown();
}

#[test]
fn write_read_at_offset_round_trip() {
    let k = boot(&[]);
    let init = k
        .user_init(|u| {
            let fd = u.open("data", RW_CREATE);
            assert!(fd >= 0);
            // Lay down 600 bytes in two writes straddling a block.
            assert_eq!(u.write(fd, &[1_u8; 400]), 400);
            assert_eq!(u.write(fd, &[2_u8; 200]), 200);
            u.close(fd);

            let st_fd = u.open("data", OpenFlags::RDONLY);
            let st = u.fstat(st_fd).expect("fstat failed");
            assert_eq!(st.size, 600);
            assert_eq!(st.ty, 2); // regular file
            assert_eq!(st.nlink, 1);

            let mut buf = [0_u8; 600];
            assert_eq!(u.read(st_fd, &mut buf), 600);
            assert!(buf[..400].iter().all(|&b| b == 1));
            assert!(buf[400..].iter().all(|&b| b == 2));
            u.close(st_fd);
            0
        })
        .unwrap();
    assert_eq!(init.wait(), Some(0));
    k.shutdown();
}

#[test]
fn opentest() {
    let k = boot(&[("exists", b"x")]);
    let init = k
        .user_init(|u| {
            let fd = u.open("exists", OpenFlags::RDONLY);
            assert!(fd >= 0);
            u.close(fd);
            assert_eq!(u.open("doesnotexist", OpenFlags::RDONLY), -1);
            // A directory cannot be opened for writing.
            assert_eq!(u.open("/", OpenFlags::RDWR), -1);
            assert!(u.open("/", OpenFlags::RDONLY) >= 0);
            0
        })
        .unwrap();
    assert_eq!(init.wait(), Some(0));
    k.shutdown();
}

#[test]
fn sharedfd() {
    // A descriptor shared across fork advances one offset.
    let k = boot(&[]);
    let init = k
        .user_init(|u| {
            let fd = u.open("sharedfd", RW_CREATE);
            assert!(fd >= 0);

            let pid = u.fork(move |c| {
                for _ in 0..100 {
                    assert_eq!(c.write(fd, b"cccccccccc"), 10);
                }
                0
            });
            assert!(pid > 0);
            for _ in 0..100 {
                assert_eq!(u.write(fd, b"pppppppppp"), 10);
            }
            assert_eq!(u.wait(), pid);
            u.close(fd);

            let fd = u.open("sharedfd", OpenFlags::RDONLY);
            let mut nc = 0_usize;
            let mut np = 0_usize;
            let mut buf = [0_u8; 1000];
            loop {
                let n = u.read(fd, &mut buf);
                assert!(n >= 0);
                if n == 0 {
                    break;
                }
                for &b in &buf[..n as usize] {
                    match b {
                        b'c' => nc += 1,
                        b'p' => np += 1,
                        _ => panic!("unexpected byte {b}"),
                    }
                }
            }
            u.close(fd);
            assert_eq!(nc, 1000);
            assert_eq!(np, 1000);
            assert_eq!(u.unlink("sharedfd"), 0);
            0
        })
        .unwrap();
    assert_eq!(init.wait(), Some(0));
    k.shutdown();
}

#[test]
fn unlinkread() {
    // Unlink of an open file: the holder keeps reading and writing; the
    // storage dies with the last close.
    let k = boot(&[("unlinkread", b"hello")]);
    {
        let init = k
            .user_init(|u| {
                let fd = u.open("unlinkread", OpenFlags::RDWR);
                assert!(fd >= 0);
                assert_eq!(u.unlink("unlinkread"), 0);

                // The name is gone; a new file by the same name is
                // someone else.
                let fd1 = u.open("unlinkread", RW_CREATE);
                assert_eq!(u.write(fd1, b"yyy"), 3);
                u.close(fd1);

                let mut buf = [0_u8; 5];
                assert_eq!(u.read(fd, &mut buf), 5);
                assert_eq!(&buf, b"hello");
                assert_eq!(u.write(fd, b"more"), 4);
                u.close(fd);

                assert_eq!(u.unlink("unlinkread"), 0);
                0
            })
            .unwrap();
        assert_eq!(init.wait(), Some(0));
    }
    k.shutdown();
}

#[test]
fn linktest() {
    let k = boot(&[]);
    let init = k
        .user_init(|u| {
            let fd = u.open("lf1", RW_CREATE);
            assert!(fd >= 0);
            assert_eq!(u.write(fd, b"hello"), 5);
            u.close(fd);

            assert_eq!(u.link("lf1", "lf2"), 0);
            assert_eq!(u.unlink("lf1"), 0);
            assert_eq!(u.open("lf1", OpenFlags::RDONLY), -1);

            let fd = u.open("lf2", OpenFlags::RDONLY);
            assert!(fd >= 0);
            let mut buf = [0_u8; 5];
            assert_eq!(u.read(fd, &mut buf), 5);
            assert_eq!(&buf, b"hello");
            u.close(fd);

            assert_eq!(u.link("lf2", "lf2"), -1, "self link allowed");
            assert_eq!(u.unlink("lf2"), 0);
            assert_eq!(u.link("lf2", "lf1"), -1, "link of missing file");
            assert_eq!(u.link("/", "lfdir"), -1, "directory link allowed");
            0
        })
        .unwrap();
    assert_eq!(init.wait(), Some(0));
    k.shutdown();
}

#[test]
fn subdir() {
    let k = boot(&[]);
    let init = k
        .user_init(|u| {
            assert_eq!(u.mkdir("dd"), 0);
            let fd = u.open("dd/ff", RW_CREATE);
            assert!(fd >= 0);
            assert_eq!(u.write(fd, b"ff"), 2);
            u.close(fd);

            assert_eq!(u.mkdir("dd/dd"), 0);
            let fd = u.open("dd/dd/ff", RW_CREATE);
            assert!(fd >= 0);
            assert_eq!(u.write(fd, b"FF"), 2);
            u.close(fd);

            // Walks through . and .. resolve.
            let fd = u.open("dd/dd/../ff", OpenFlags::RDONLY);
            assert!(fd >= 0);
            let mut buf = [0_u8; 2];
            assert_eq!(u.read(fd, &mut buf), 2);
            assert_eq!(&buf, b"ff");
            u.close(fd);

            // chdir moves the base for relative paths.
            assert_eq!(u.chdir("dd"), 0);
            let fd = u.open("dd/ff", OpenFlags::RDONLY);
            assert!(fd >= 0);
            u.close(fd);
            assert_eq!(u.chdir("/"), 0);

            // A non-empty directory cannot be unlinked.
            assert_eq!(u.unlink("dd"), -1);
            assert_eq!(u.unlink("dd/dd/ff"), 0);
            assert_eq!(u.unlink("dd/dd"), 0);
            assert_eq!(u.unlink("dd/ff"), 0);
            assert_eq!(u.unlink("dd"), 0);

            // . and .. are never unlinkable.
            assert_eq!(u.mkdir("ee"), 0);
            assert_eq!(u.unlink("ee/."), -1);
            assert_eq!(u.unlink("ee/.."), -1);
            assert_eq!(u.unlink("ee"), 0);
            0
        })
        .unwrap();
    assert_eq!(init.wait(), Some(0));
    k.shutdown();
}

#[test]
fn bigfile() {
    // Crossing from the direct blocks into the indirect block, and the
    // hard size limit past it.
    let k = boot(&[]);
    let init = k
        .user_init(|u| {
            use ox6_kernel::fs::repr::{BSIZE, MAXFILE, NDIRECT};

            let fd = u.open("big", RW_CREATE);
            assert!(fd >= 0);

            let chunk = [0x42_u8; BSIZE];
            // Exactly to the end of the direct blocks...
            for _ in 0..NDIRECT {
                assert_eq!(u.write(fd, &chunk), BSIZE as i32);
            }
            let st = u.fstat(fd).expect("fstat");
            assert_eq!(st.size as usize, NDIRECT * BSIZE);

            // ...then one more write allocates through the indirect
            // block.
            assert_eq!(u.write(fd, &chunk), BSIZE as i32);
            let st = u.fstat(fd).expect("fstat");
            assert_eq!(st.size as usize, (NDIRECT + 1) * BSIZE);

            // Fill to the maximum file size.
            for _ in NDIRECT + 1..MAXFILE {
                assert_eq!(u.write(fd, &chunk), BSIZE as i32);
            }
            let st = u.fstat(fd).expect("fstat");
            assert_eq!(st.size as usize, MAXFILE * BSIZE);

            // One byte past the end fails and the size stays put.
            assert_eq!(u.write(fd, &[1]), -1);
            let st = u.fstat(fd).expect("fstat");
            assert_eq!(st.size as usize, MAXFILE * BSIZE);
            u.close(fd);

            // Read the whole thing back.
            let fd = u.open("big", OpenFlags::RDONLY);
            let mut total = 0_usize;
            let mut buf = [0_u8; BSIZE];
            loop {
                let n = u.read(fd, &mut buf);
                assert!(n >= 0);
                if n == 0 {
                    break;
                }
                assert!(buf[..n as usize].iter().all(|&b| b == 0x42));
                total += n as usize;
            }
            assert_eq!(total, MAXFILE * BSIZE);
            u.close(fd);
            assert_eq!(u.unlink("big"), 0);
            0
        })
        .unwrap();
    assert_eq!(init.wait_timeout(std::time::Duration::from_secs(120)), Some(0));
    k.shutdown();
}

#[test]
fn fourfiles() {
    // Four processes each write their own file concurrently; every file
    // comes back intact.
    let k = boot(&[]);
    let init = k
        .user_init(|u| {
            let names = ["stressfs0", "stressfs1", "stressfs2", "stressfs3"];
            let mut pids = Vec::new();
            for (i, name) in names.iter().enumerate() {
                let name = name.to_string();
                let pid = u.fork(move |c| {
                    let fd = c.open(&name, RW_CREATE);
                    assert!(fd >= 0, "create {name} failed");
                    let data = [b'a' + i as u8; 512];
                    for _ in 0..20 {
                        assert_eq!(c.write(fd, &data), 512);
                    }
                    c.close(fd);
                    0
                });
                assert!(pid > 0);
                pids.push(pid);
            }
            for _ in &pids {
                assert!(u.wait() > 0);
            }

            for (i, name) in names.iter().enumerate() {
                let fd = u.open(name, OpenFlags::RDONLY);
                assert!(fd >= 0);
                let mut total = 0;
                let mut buf = [0_u8; 512];
                loop {
                    let n = u.read(fd, &mut buf);
                    assert!(n >= 0);
                    if n == 0 {
                        break;
                    }
                    assert!(
                        buf[..n as usize].iter().all(|&b| b == b'a' + i as u8),
                        "file {name} corrupted"
                    );
                    total += n;
                }
                assert_eq!(total, 20 * 512, "file {name} has wrong length");
                u.close(fd);
                assert_eq!(u.unlink(name), 0);
            }
            0
        })
        .unwrap();
    assert_eq!(init.wait_timeout(std::time::Duration::from_secs(120)), Some(0));
    assert!(k.bcache_identities_unique());
    k.shutdown();
}

#[test]
fn createdelete_reuses_slots() {
    let k = boot(&[]);
    let init = k
        .user_init(|u| {
            for round in 0..3 {
                for i in 0..20 {
                    let name = format!("x{round}_{i}");
                    let fd = u.open(&name, RW_CREATE);
                    assert!(fd >= 0, "create {name} failed");
                    u.close(fd);
                }
                for i in 0..20 {
                    let name = format!("x{round}_{i}");
                    assert_eq!(u.unlink(&name), 0, "unlink {name} failed");
                }
            }
            0
        })
        .unwrap();
    assert_eq!(init.wait(), Some(0));
    k.shutdown();
}

#[test]
fn mknod_console_round_trip() {
    let k = boot(&[]);
    let init = k
        .user_init(|u| {
            assert_eq!(u.mknod("console", 1, 1), 0);
            let fd = u.open("console", OpenFlags::RDWR);
            assert!(fd >= 0);
            assert_eq!(u.write(fd, b"to the console\n"), 15);
            u.close(fd);
            0
        })
        .unwrap();
    assert_eq!(init.wait(), Some(0));
    let out = k.console().take_output();
    assert!(out.ends_with(b"to the console\n"));
    k.shutdown();
}
