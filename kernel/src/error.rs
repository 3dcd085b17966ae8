use crate::memory::VirtAddr;

pub type Result<T> = core::result::Result<T, KernelError>;

/// Internal failure currency.
///
/// Every surfaced failure (spec class 1) is one of these; the system-call
/// boundary collapses them all to -1 in `eax`. Invariant violations are a
/// separate channel (`Kernel::panic`) and never appear here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    #[error("no free process slot")]
    NoFreeProc,
    #[error("out of physical pages")]
    NoFreePage,
    #[error("no child process")]
    NoChildProcess,
    #[error("process not found")]
    ProcessNotFound,
    #[error("caller has been killed")]
    Killed,

    #[error("virtual address out of range: {0:#x}")]
    BadAddress(VirtAddr),
    #[error("unterminated user string at {0:#x}")]
    UnterminatedString(VirtAddr),

    #[error("bad file descriptor")]
    BadFileDescriptor,
    #[error("file descriptor not readable")]
    NotReadable,
    #[error("file descriptor not writable")]
    NotWritable,
    #[error("too many open files in system")]
    TooManyOpenFilesSystem,
    #[error("too many open files")]
    TooManyOpenFiles,

    #[error("non-directory component in path")]
    NotADirectory,
    #[error("file system entry not found")]
    EntryNotFound,
    #[error("directory not empty")]
    DirectoryNotEmpty,
    #[error("entry already exists")]
    AlreadyExists,
    #[error("file too large")]
    FileTooLarge,
    #[error("out of data blocks")]
    OutOfBlocks,
    #[error("out of inodes")]
    OutOfInodes,
    #[error("operation not permitted on this inode type")]
    BadInodeType,
    #[error("no such device")]
    NoDevice,

    #[error("broken pipe")]
    BrokenPipe,

    #[error("argument list too long")]
    ArgumentListTooLong,
    #[error("invalid executable")]
    InvalidExecutable,
}
