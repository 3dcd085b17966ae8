//! Pipes: a bounded in-memory byte channel with two endpoints.

use core::ptr;
use std::sync::Arc;

use crate::{
    error::{KernelError, Result},
    kernel::Kernel,
    memory::vm_user::{DstBuf, SrcBuf},
    param::PIPESIZE,
    proc,
    sync::SpinLock,
};

pub struct Pipe {
    data: SpinLock<PipeData>,
}

struct PipeData {
    buf: [u8; PIPESIZE],
    /// Number of bytes read; `nread % PIPESIZE` is the next read index.
    nread: u32,
    /// Number of bytes written.
    nwrite: u32,
    /// Read fd is still open.
    readopen: bool,
    /// Write fd is still open.
    writeopen: bool,
}

impl Pipe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            data: SpinLock::new(PipeData {
                buf: [0; PIPESIZE],
                nread: 0,
                nwrite: 0,
                readopen: true,
                writeopen: true,
            }),
        })
    }

    fn read_chan(&self) -> usize {
        ptr::from_ref(&self.data) as usize
    }

    fn write_chan(&self) -> usize {
        ptr::from_ref(&self.data) as usize + 1
    }

    /// Closes one end; when both ends are closed the `Arc` reclaims the
    /// buffer.
    pub fn close(&self, k: &Kernel, writable: bool) {
        let mut pi = self.data.lock();
        if writable {
            pi.writeopen = false;
            drop(pi);
            proc::wakeup(k, self.read_chan());
        } else {
            pi.readopen = false;
            drop(pi);
            proc::wakeup(k, self.write_chan());
        }
    }

    pub fn write(&self, k: &Kernel, src: SrcBuf<'_>) -> Result<usize> {
        let p = proc::myproc(k);
        let n = src.len();
        let mut i = 0;

        let mut pi = self.data.lock();
        while i < n {
            if !pi.readopen || proc::killed(k, p) {
                return Err(KernelError::BrokenPipe);
            }
            if pi.nwrite == pi.nread + PIPESIZE as u32 {
                // Buffer full: let readers drain, then wait for room.
                proc::wakeup(k, self.read_chan());
                pi = proc::sleep(k, self.write_chan(), pi);
                continue;
            }

            let mut byte = [0_u8; 1];
            if src.read(&k.mem, i, &mut byte).is_err() {
                break;
            }
            let idx = pi.nwrite as usize % PIPESIZE;
            pi.buf[idx] = byte[0];
            pi.nwrite += 1;
            i += 1;
        }
        drop(pi);
        proc::wakeup(k, self.read_chan());
        Ok(i)
    }

    pub fn read(&self, k: &Kernel, mut dst: DstBuf<'_>) -> Result<usize> {
        let p = proc::myproc(k);
        let n = dst.len();

        let mut pi = self.data.lock();
        while pi.nread == pi.nwrite && pi.writeopen {
            if proc::killed(k, p) {
                return Err(KernelError::Killed);
            }
            pi = proc::sleep(k, self.read_chan(), pi);
        }

        let mut i = 0;
        while i < n && pi.nread != pi.nwrite {
            let idx = pi.nread as usize % PIPESIZE;
            let byte = [pi.buf[idx]];
            if dst.write(&k.mem, i, &byte).is_err() {
                break;
            }
            pi.nread += 1;
            i += 1;
        }
        drop(pi);
        proc::wakeup(k, self.write_chan());
        Ok(i)
    }
}
