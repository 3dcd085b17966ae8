//! Kernel console output.
//!
//! `kprintln!` formats into the console, which mirrors every byte to
//! the CGA text buffer and the serial sink. Once the kernel has
//! panicked, the output path goes quiet on every other CPU so the dying
//! message stays legible.

use core::fmt::{self, Write as _};

use crate::kernel::Kernel;

macro_rules! kprintln {
    ($k:expr) => {
        $crate::console::print::print($k, core::format_args!("\n"))
    };
    ($k:expr, $($arg:tt)*) => {{
        $crate::console::print::print($k, core::format_args!($($arg)*));
        $crate::console::print::print($k, core::format_args!("\n"));
    }};
}

struct ConsoleWriter<'a> {
    k: &'a Kernel,
}

impl fmt::Write for ConsoleWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for b in s.bytes() {
            self.k.console.putc(self.k, b as u16);
        }
        Ok(())
    }
}

pub fn print(k: &Kernel, args: fmt::Arguments<'_>) {
    if k.has_panicked() && !std::thread::panicking() {
        // A panicked kernel freezes everyone else's console.
        return;
    }
    let _ = ConsoleWriter { k }.write_fmt(args);
}
