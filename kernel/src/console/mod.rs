//! Console input and output.
//!
//! Reads are a line at a time, with the classic editing keys:
//!
//! * newline / carriage return -- end of line
//! * control-h, delete -- backspace
//! * control-u -- kill line
//! * control-d -- end of file
//! * control-p -- print process list
//!
//! Input arrives from the keyboard (scancodes, decoded in [`kbd`]) or
//! the serial line (plain bytes); both land in a 128-byte ring with
//! read, write and edit indices. Output is mirrored to the CGA text
//! buffer and the serial sink.

#[macro_use]
pub mod print;

pub mod kbd;
pub mod vga;

use std::sync::Mutex;

use crate::{
    error::{KernelError, Result},
    file::device::{DevSw, CONSOLE},
    kernel::Kernel,
    memory::vm_user::{DstBuf, SrcBuf},
    proc,
    sync::{SpinLock, SpinLockCondVar},
};

use self::{kbd::KbdState, vga::Vga};

const fn ctrl(x: u8) -> u8 {
    x - b'@'
}

const CTRL_D: u8 = ctrl(b'D');
const CTRL_H: u8 = ctrl(b'H');
const CTRL_P: u8 = ctrl(b'P');
const CTRL_U: u8 = ctrl(b'U');
const DEL: u8 = 0x7F;

const INPUT_BUF: usize = 128;

struct Cons {
    buf: [u8; INPUT_BUF],
    /// Read index
    r: usize,
    /// Write index
    w: usize,
    /// Edit index
    e: usize,
}

pub struct Console {
    cons: SpinLock<Cons>,
    written: SpinLockCondVar,
    /// Display hardware; a host mutex, like the platter in `MemDisk`,
    /// so tests can inspect it without claiming a CPU.
    vga: Mutex<Vga>,
    kbd: SpinLock<KbdState>,
    /// The serial line's transmit side; host-visible for tests and the
    /// demo binary.
    serial_out: Mutex<Vec<u8>>,
    echo_host: bool,
}

impl Console {
    pub fn new(echo_host: bool) -> Self {
        Self {
            cons: SpinLock::new(Cons {
                buf: [0; INPUT_BUF],
                r: 0,
                w: 0,
                e: 0,
            }),
            written: SpinLockCondVar::new(),
            vga: Mutex::new(Vga::new()),
            kbd: SpinLock::new(KbdState::new()),
            serial_out: Mutex::new(Vec::new()),
            echo_host,
        }
    }

    /// One character to both output devices.
    pub(crate) fn putc(&self, k: &Kernel, c: u16) {
        if k.has_panicked() && !std::thread::panicking() {
            return;
        }

        self.vga.lock().unwrap().putc(c);

        let mut serial = self.serial_out.lock().unwrap();
        if c == vga::BACKSPACE {
            serial.extend_from_slice(b"\x08 \x08");
        } else {
            serial.push((c & 0xff) as u8);
        }
        if self.echo_host {
            use std::io::Write as _;
            let bytes = if c == vga::BACKSPACE {
                b"\x08 \x08".to_vec()
            } else {
                vec![(c & 0xff) as u8]
            };
            let _ = std::io::stdout().write_all(&bytes);
            let _ = std::io::stdout().flush();
        }
    }

    /// Drains everything written to the serial line so far.
    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut self.serial_out.lock().unwrap())
    }

    /// The CGA row at `row`, as text.
    pub fn display_row(&self, row: usize) -> String {
        self.vga.lock().unwrap().row_text(row)
    }
}

/// Handles one input character, from either keyboard or serial
/// interrupt: do erase/kill processing, append to the ring, wake up
/// readers when a whole line has arrived.
pub(crate) fn intr(k: &Kernel, c: u8) {
    let mut cons = k.console.cons.lock();
    match c {
        CTRL_P => {
            // Print the process table.
            drop(cons);
            proc::dump(k);
        }
        CTRL_U => {
            // Kill line.
            while cons.e != cons.w && cons.buf[(cons.e - 1) % INPUT_BUF] != b'\n' {
                cons.e -= 1;
                k.console.putc(k, vga::BACKSPACE);
            }
        }
        CTRL_H | DEL => {
            // Backspace.
            if cons.e != cons.w {
                cons.e -= 1;
                k.console.putc(k, vga::BACKSPACE);
            }
        }
        _ => {
            if c != 0 && cons.e - cons.r < INPUT_BUF {
                let c = if c == b'\r' { b'\n' } else { c };

                // Echo back to the user.
                k.console.putc(k, u16::from(c));

                let e = cons.e;
                cons.buf[e % INPUT_BUF] = c;
                cons.e += 1;

                if c == b'\n' || c == CTRL_D || cons.e - cons.r == INPUT_BUF {
                    // A whole line (or end-of-file) has arrived.
                    cons.w = cons.e;
                    k.console.written.notify(k);
                }
            }
        }
    }
}

/// A keyboard interrupt: one scancode.
pub(crate) fn kbd_intr(k: &Kernel, scancode: u8) {
    let c = k.console.kbd.lock().decode(scancode);
    if let Some(c) = c {
        intr(k, c);
    }
}

/// User reads from the console: copy up to a whole input line.
fn console_read(k: &Kernel, mut dst: DstBuf<'_>) -> Result<usize> {
    let p = proc::myproc(k);
    let n = dst.len();
    let mut i = 0;

    let mut cons = k.console.cons.lock();
    while i < n {
        // Wait until the interrupt handler has put some input into the
        // ring.
        while cons.r == cons.w {
            if proc::killed(k, p) {
                return Err(KernelError::Killed);
            }
            cons = k.console.written.wait(k, cons);
        }

        let c = cons.buf[cons.r % INPUT_BUF];
        cons.r += 1;

        if c == CTRL_D {
            // End of file.
            if i > 0 {
                // Save ^D for next time, to make sure the caller gets a
                // 0-byte result.
                cons.r -= 1;
            }
            break;
        }

        if dst.write(&k.mem, i, &[c]).is_err() {
            if i > 0 {
                break;
            }
            return Err(KernelError::BadAddress(crate::memory::VirtAddr::ZERO));
        }
        i += 1;

        if c == b'\n' {
            // A whole line has arrived; return to the user-level read.
            break;
        }
    }
    Ok(i)
}

/// User writes to the console.
fn console_write(k: &Kernel, src: SrcBuf<'_>) -> Result<usize> {
    for i in 0..src.len() {
        let mut c = [0_u8; 1];
        if src.read(&k.mem, i, &mut c).is_err() {
            if i > 0 {
                return Ok(i);
            }
            return Err(KernelError::BadAddress(crate::memory::VirtAddr::ZERO));
        }
        k.console.putc(k, u16::from(c[0]));
    }
    Ok(src.len())
}

/// Registers the console as a device so that device inodes with the
/// console major dispatch here.
pub(crate) fn init(k: &Kernel) {
    k.devsw.register(
        CONSOLE,
        DevSw {
            read: console_read,
            write: console_write,
        },
    );
}
