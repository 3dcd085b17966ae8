//! Boots a kernel on an in-memory disk, runs a tiny init, and shows the
//! console.
//!
//! ```text
//! cargo run --example boot
//! ```

use ox6_kernel::{Config, Kernel, MemDisk, OpenFlags};

fn main() {
    let image = ox6_mkfs::build_image(&[("motd", b"hello from the disk\n")]);
    let disk = MemDisk::from_image(&image);

    let k = Kernel::boot(
        Config {
            echo_console: true,
            ..Config::default()
        },
        disk,
    );

    let init = k
        .user_init(|u| {
            // Wire up stdin/stdout/stderr to the console device.
            u.mknod("console", 1, 1);
            let fd = u.open("console", OpenFlags::RDWR);
            u.dup(fd);
            u.dup(fd);

            u.write(1, b"ox6 booted\n");

            let fd = u.open("motd", OpenFlags::RDONLY);
            let mut buf = [0_u8; 64];
            let n = u.read(fd, &mut buf);
            if n > 0 {
                u.write(1, &buf[..n as usize]);
            }
            u.close(fd);

            let pid = u.fork(|child| {
                child.write(1, b"child says hi\n");
                7
            });
            u.wait();
            u.write(1, format!("reaped child {pid}\n").as_bytes());
            0
        })
        .expect("cannot start init");

    init.wait();
    k.shutdown();
}
