//! Process and pipe behavior, driven through the system-call surface.

mod common;

use std::time::Duration;

use common::boot;

#[test]
fn exitwait() {
    let k = boot(&[]);
    let init = k
        .user_init(|u| {
            // fork followed by wait returns the child's pid.
            for _ in 0..10 {
                let pid = u.fork(|c| c.exit(0));
                assert!(pid > 0, "fork failed");
                assert_eq!(u.wait(), pid, "wait got the wrong child");
            }
            0
        })
        .unwrap();
    assert_eq!(init.wait(), Some(0));
    k.shutdown();
}

#[test]
fn forktest() {
    let k = boot(&[]);
    let init = k
        .user_init(|u| {
            // Fork until failure; the table must run out before NPROC
            // since init and the forker occupy slots.
            let mut n = 0;
            loop {
                let pid = u.fork(|c| {
                    c.sleep(2);
                    c.exit(0)
                });
                if pid < 0 {
                    break;
                }
                n += 1;
                assert!(n <= ox6_kernel::param::NPROC as i32, "fork never failed");
            }
            assert!(n > 0, "no forks succeeded at all");

            // Every forked child can be reaped, and then one more wait
            // fails.
            for _ in 0..n {
                assert!(u.wait() > 0, "wait lost a child");
            }
            assert_eq!(u.wait(), -1, "extra wait found a phantom child");
            0
        })
        .unwrap();
    assert_eq!(init.wait(), Some(0));
    k.shutdown();
}

#[test]
fn pipe1() {
    let k = boot(&[]);
    let init = k
        .user_init(|u| {
            let (rfd, wfd) = u.pipe().expect("pipe failed");

            let pid = u.fork(move |c| {
                c.close(rfd);
                let mut seq = 0_u8;
                let mut buf = [0_u8; 129];
                for _ in 0..5 {
                    for b in buf.iter_mut() {
                        *b = seq;
                        seq = seq.wrapping_add(1);
                    }
                    if c.write(wfd, &buf) != buf.len() as i32 {
                        return 1;
                    }
                }
                c.close(wfd);
                0
            });
            assert!(pid > 0);
            u.close(wfd);

            let mut seq = 0_u8;
            let mut total = 0;
            let mut buf = [0_u8; 233];
            loop {
                let n = u.read(rfd, &mut buf);
                if n == 0 {
                    break;
                }
                assert!(n > 0, "pipe read failed");
                for &b in &buf[..n as usize] {
                    assert_eq!(b, seq, "pipe bytes out of order");
                    seq = seq.wrapping_add(1);
                }
                total += n;
            }
            assert_eq!(total, 5 * 129, "pipe lost bytes");
            u.close(rfd);
            assert_eq!(u.wait(), pid);
            0
        })
        .unwrap();
    assert_eq!(init.wait(), Some(0));
    k.shutdown();
}

#[test]
fn killstatus() {
    // Kill a reader blocked on an empty pipe: it observes the kill on
    // wakeup, its read returns -1, and its parent reaps it.
    let k = boot(&[]);
    let init = k
        .user_init(|u| {
            let (rfd, _wfd) = u.pipe().expect("pipe failed");

            let pid = u.fork(move |c| {
                let mut buf = [0_u8; 16];
                let r = c.read(rfd, &mut buf);
                // The blocked read fails once this process is killed.
                if r == -1 { 3 } else { 111 }
            });
            assert!(pid > 0);

            u.sleep(3); // let the child block
            assert_eq!(u.kill(pid), 0);
            assert_eq!(u.wait(), pid);
            0
        })
        .unwrap();
    assert_eq!(init.wait(), Some(0));
    k.shutdown();
}

#[test]
fn kill_no_such_pid() {
    let k = boot(&[]);
    let init = k
        .user_init(|u| {
            assert_eq!(u.kill(31337), -1);
            0
        })
        .unwrap();
    assert_eq!(init.wait(), Some(0));
    k.shutdown();
}

#[test]
fn sbrkbasic() {
    let k = boot(&[]);
    let init = k
        .user_init(|u| {
            let start = u.sbrk(0);
            assert!(start >= 0);

            // Growth is visible and writable page by page.
            let a = u.sbrk(8192);
            assert_eq!(a, start);
            assert!(u.poke(a as u32 + 8191, &[0x5a]));

            // Negative sbrk gives the memory back; the old top is gone.
            let top = u.sbrk(0);
            assert_eq!(top, start + 8192);
            let r = u.sbrk(-8192);
            assert_eq!(r, top);
            assert!(!u.poke(start as u32, &[1]), "freed page still mapped");

            // The kernel half is never reachable.
            assert!(!u.poke(0x8000_0000, &[1]));
            let mut b = [0_u8];
            assert!(!u.peek(0x8000_0000, &mut b));
            0
        })
        .unwrap();
    assert_eq!(init.wait(), Some(0));
    k.shutdown();
}

#[test]
fn sleep_advances_with_time() {
    let k = boot(&[]);
    let init = k
        .user_init(|u| {
            let t0 = u.uptime();
            assert_eq!(u.sleep(5), 0);
            let t1 = u.uptime();
            assert!(t1 - t0 >= 5, "sleep returned early: {t0}..{t1}");
            0
        })
        .unwrap();
    assert_eq!(init.wait(), Some(0));
    k.shutdown();
}

#[test]
fn preempt_two_cpu_children() {
    // Two busy children plus the parent make progress concurrently and
    // all exit.
    let k = boot(&[]);
    let init = k
        .user_init(|u| {
            let mut pids = Vec::new();
            for _ in 0..3 {
                let pid = u.fork(|c| {
                    for _ in 0..50 {
                        c.pause();
                        c.getpid();
                    }
                    0
                });
                assert!(pid > 0);
                pids.push(pid);
            }
            for _ in 0..pids.len() {
                let got = u.wait();
                assert!(pids.contains(&got));
            }
            0
        })
        .unwrap();
    assert_eq!(init.wait_timeout(Duration::from_secs(60)), Some(0));
    k.shutdown();
}

#[test]
fn bad_user_pointers_are_rejected() {
    let k = boot(&[]);
    let init = k
        .user_init(|u| {
            let (rfd, wfd) = u.pipe().expect("pipe failed");
            // read/write into kernel space or unmapped space fail
            // without harming anyone.
            assert_eq!(u.read_at(rfd, 0x8000_0000, 16), -1);
            assert_eq!(u.write_at(wfd, 0xf000_0000, 16), -1);
            // a wild syscall number fails the call
            assert_eq!(u.syscall_raw(9999), -1);
            0
        })
        .unwrap();
    assert_eq!(init.wait(), Some(0));
    k.shutdown();
}

#[test]
fn no_frames_leak_across_process_lifetimes() {
    // The steady-state frame count after a storm of fork/sbrk/exit/wait
    // matches a kernel whose init did nothing at all.
    let baseline = {
        let k = boot(&[]);
        let init = k.user_init(|_| 0).unwrap();
        assert_eq!(init.wait(), Some(0));
        let free = k.free_pages();
        k.shutdown();
        free
    };

    let k = boot(&[]);
    let init = k
        .user_init(|u| {
            for _ in 0..12 {
                let pid = u.fork(|c| {
                    c.sbrk(6 * 4096);
                    0
                });
                assert!(pid > 0);
                assert_eq!(u.wait(), pid);
            }
            0
        })
        .unwrap();
    assert_eq!(init.wait(), Some(0));
    assert_eq!(k.free_pages(), baseline, "page frames leaked");
    k.shutdown();
}
