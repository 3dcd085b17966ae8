//! Fatal assertions take the CPU down and freeze other consoles.
//!
//! A panicked kernel cannot be shut down cleanly (its scheduler never
//! gets its CPU back), so this file intentionally leaks the kernel and
//! keeps exactly one such test.

mod common;

use common::boot;

#[test]
fn init_exiting_is_fatal() {
    let k = boot(&[]);
    let init = k
        .user_init(|u| {
            // The first process may never exit through the system call.
            u.exit(0);
            unreachable!("exit returned to init");
        })
        .unwrap();

    // The kernel thread died instead of delivering an exit status.
    assert_eq!(init.wait(), None);
    assert!(k.has_panicked());

    // The dying CPU got its message out before the freeze.
    let out = String::from_utf8_lossy(&k.console().take_output()).into_owned();
    assert!(out.contains("panic: init exiting"), "no panic banner: {out}");

    // A frozen console drops all further output, including the echo of
    // injected input.
    k.serial_input(b"should vanish\n");
    assert!(k.console().take_output().is_empty());
}
