//! Console line discipline, end to end: injected input interrupts,
//! cooked editing, EOF, and the display model.

mod common;

use common::boot;
use ox6_kernel::OpenFlags;

fn init_with_console(
    k: &std::sync::Arc<ox6_kernel::Kernel>,
    f: impl FnOnce(&mut ox6_kernel::UserCtx<'_>) -> i32 + Send + 'static,
) -> ox6_kernel::InitHandle {
    k.user_init(move |u| {
        assert_eq!(u.mknod("console", 1, 1), 0);
        assert_eq!(u.open("console", OpenFlags::RDWR), 0);
        assert_eq!(u.dup(0), 1);
        assert_eq!(u.dup(0), 2);
        f(u)
    })
    .unwrap()
}

#[test]
fn cooked_line_with_erase_and_kill() {
    let k = boot(&[]);
    let k2 = k.clone();
    let init = init_with_console(&k, move |u| {
        // typed: "hxe" backspace backspace "ello\n" -> "hello\n"
        k2.serial_input(b"hxe\x08\x08ello\n");
        let mut buf = [0_u8; 32];
        let n = u.read(0, &mut buf);
        assert_eq!(&buf[..n as usize], b"hello\n");

        // a killed line never reaches the reader
        k2.serial_input(b"garbage\x15kept\n"); // ^U
        let n = u.read(0, &mut buf);
        assert_eq!(&buf[..n as usize], b"kept\n");
        0
    });
    assert_eq!(init.wait(), Some(0));
    k.shutdown();
}

#[test]
fn ctrl_d_at_start_reads_zero_bytes() {
    let k = boot(&[]);
    let k2 = k.clone();
    let init = init_with_console(&k, move |u| {
        k2.serial_input(&[0x04]); // ^D, nothing else
        let mut buf = [0_u8; 8];
        assert_eq!(u.read(0, &mut buf), 0, "^D at start is EOF");

        // After EOF the console reads normally again.
        k2.serial_input(b"more\n");
        let n = u.read(0, &mut buf);
        assert_eq!(&buf[..n as usize], b"more\n");

        // ^D mid-line returns the partial line without the ^D, and the
        // next read is the 0-byte EOF.
        k2.serial_input(b"par\x04");
        let n = u.read(0, &mut buf);
        assert_eq!(&buf[..n as usize], b"par");
        assert_eq!(u.read(0, &mut buf), 0);
        0
    });
    assert_eq!(init.wait(), Some(0));
    k.shutdown();
}

#[test]
fn keyboard_scancodes_cook_into_lines() {
    let k = boot(&[]);
    let k2 = k.clone();
    let init = init_with_console(&k, move |u| {
        // 'h' 'i' with a shifted '!' (shift-1), then enter:
        // h=0x23, i=0x17, shift=0x2A, 1=0x02, enter=0x1C; releases carry
        // bit 7.
        k2.kbd_input(&[
            0x23, 0xA3, 0x17, 0x97, 0x2A, 0x02, 0x82, 0xAA, 0x1C, 0x9C,
        ]);
        let mut buf = [0_u8; 8];
        let n = u.read(0, &mut buf);
        assert_eq!(&buf[..n as usize], b"hi!\n");
        0
    });
    assert_eq!(init.wait(), Some(0));
    k.shutdown();
}

#[test]
fn output_reaches_display_and_serial() {
    let k = boot(&[]);
    let init = init_with_console(&k, |u| {
        u.write(1, b"first line\nsecond\n");
        0
    });
    assert_eq!(init.wait(), Some(0));

    let out = k.console().take_output();
    assert_eq!(out, b"first line\nsecond\n");
    assert_eq!(k.console().display_row(0), "first line");
    assert_eq!(k.console().display_row(1), "second");
    k.shutdown();
}

#[test]
fn echo_appears_on_the_display() {
    let k = boot(&[]);
    let k2 = k.clone();
    let init = init_with_console(&k, move |u| {
        k2.serial_input(b"typed\n");
        let mut buf = [0_u8; 8];
        let n = u.read(0, &mut buf);
        assert_eq!(&buf[..n as usize], b"typed\n");
        0
    });
    assert_eq!(init.wait(), Some(0));
    assert_eq!(k.console().display_row(0), "typed");
    k.shutdown();
}
