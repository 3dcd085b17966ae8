//! exec, the ELF loader, and the classic shell pipeline.

mod common;

use common::{boot, tiny_elf};
use ox6_kernel::OpenFlags;

#[test]
fn exec_loads_image_and_passes_args() {
    let echo = tiny_elf(b"echo program text");
    let k = boot(&[("echo", &echo)]);

    k.register_prog("echo", |u| {
        let args = u.args();
        assert_eq!(args, ["echo", "one", "two"]);
        // The image bytes exec loaded are readable at address 0.
        let mut buf = [0_u8; 17];
        assert!(u.peek(0, &mut buf), "loaded segment unreadable");
        assert_eq!(&buf, b"echo program text");
        42
    });

    let init = k
        .user_init(|u| {
            let pid = u.fork(|c| c.exec("echo", &["echo", "one", "two"]));
            assert!(pid > 0);
            assert_eq!(u.wait(), pid);
            0
        })
        .unwrap();
    assert_eq!(init.wait(), Some(0));
    k.shutdown();
}

#[test]
fn exec_failure_leaves_old_image_intact() {
    let k = boot(&[("notanelf", b"#!/bin/nope")]);
    let init = k
        .user_init(|u| {
            // Plant a marker in our memory.
            let a = u.sbrk(4096);
            assert!(a >= 0);
            assert!(u.poke(a as u32, b"survivor"));

            assert_eq!(u.exec("notanelf", &["notanelf"]), -1);
            assert_eq!(u.exec("missing", &["missing"]), -1);

            // Still us: the marker survived the failed execs.
            let mut buf = [0_u8; 8];
            assert!(u.peek(a as u32, &mut buf));
            assert_eq!(&buf, b"survivor");
            0
        })
        .unwrap();
    assert_eq!(init.wait(), Some(0));
    k.shutdown();
}

#[test]
fn truncated_elf_is_rejected() {
    let whole = tiny_elf(b"payload bytes here");
    let truncated = &whole[..60]; // header survives, program header does not
    let k = boot(&[("bad", truncated)]);
    let init = k
        .user_init(|u| {
            assert_eq!(u.exec("bad", &["bad"]), -1);
            0
        })
        .unwrap();
    assert_eq!(init.wait(), Some(0));
    k.shutdown();
}

#[test]
fn shell_pipeline() {
    // `ls | wc`: the shell forks twice, wires a pipe via dup/close,
    // execs both sides, and waits for both.
    let ls = tiny_elf(b"ls image");
    let wc = tiny_elf(b"wc image");
    let k = boot(&[("ls", &ls), ("wc", &wc)]);

    k.register_prog("ls", |u| {
        // Three "directory entries" on stdout.
        u.write(1, b"README\nkernel\nmkfs\n");
        0
    });
    k.register_prog("wc", |u| {
        let mut lines = 0;
        let mut buf = [0_u8; 64];
        loop {
            let n = u.read(0, &mut buf);
            assert!(n >= 0, "wc read failed");
            if n == 0 {
                break;
            }
            lines += buf[..n as usize].iter().filter(|&&b| b == b'\n').count();
        }
        lines as i32
    });

    let init = k
        .user_init(|u| {
            assert_eq!(u.mknod("console", 1, 1), 0);
            let con = u.open("console", OpenFlags::RDWR);
            assert_eq!(con, 0);
            assert_eq!(u.dup(con), 1);
            assert_eq!(u.dup(con), 2);

            let (rfd, wfd) = u.pipe().expect("pipe failed");

            let left = u.fork(move |c| {
                // stdout -> pipe write end
                c.close(1);
                assert_eq!(c.dup(wfd), 1);
                c.close(rfd);
                c.close(wfd);
                c.exec("ls", &["ls"])
            });
            assert!(left > 0);

            let right = u.fork(move |c| {
                // stdin -> pipe read end
                c.close(0);
                assert_eq!(c.dup(rfd), 0);
                c.close(rfd);
                c.close(wfd);
                c.exec("wc", &["wc"])
            });
            assert!(right > 0);

            u.close(rfd);
            u.close(wfd);

            let a = u.wait();
            let b = u.wait();
            assert!(a > 0 && b > 0);
            assert!(u.wait() == -1, "no third child");
            0
        })
        .unwrap();
    assert_eq!(init.wait(), Some(0));
    k.shutdown();
}
