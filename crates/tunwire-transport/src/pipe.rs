use std::fs::File;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use tokio::net::unix::pipe;
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::traits::Connection;

/// One read pipe end plus one write pipe end, registered with the tokio reactor.
///
/// This is what each side of a manager/tunnel session holds: it reads what
/// the peer writes into the other pipe, and writes into a pipe the peer reads.
pub struct DuplexPipe {
    reader: pipe::Receiver,
    writer: pipe::Sender,
}

impl DuplexPipe {
    /// Create two cross-connected duplex pipes within this process.
    ///
    /// Must be called from within a tokio runtime.
    pub fn pair() -> Result<(Self, Self)> {
        let (left_read, right_write) = create_pipe()?;
        let (right_read, left_write) = create_pipe()?;
        let left = Self::from_fds(left_read, left_write)?;
        let right = Self::from_fds(right_read, right_write)?;
        debug!("created in-process pipe pair");
        Ok((left, right))
    }

    /// Adopt an owned read end and an owned write end.
    ///
    /// Both descriptors are switched to close-on-exec and non-blocking mode.
    /// Must be called from within a tokio runtime.
    pub fn from_fds(read: OwnedFd, write: OwnedFd) -> Result<Self> {
        let read_raw = read.as_raw_fd();
        let write_raw = write.as_raw_fd();
        set_cloexec(read.as_fd(), true)?;
        set_cloexec(write.as_fd(), true)?;

        let reader = pipe::Receiver::from_file(File::from(read)).map_err(|source| {
            TransportError::InvalidDescriptor {
                fd: read_raw,
                source,
            }
        })?;
        let writer = pipe::Sender::from_file(File::from(write)).map_err(|source| {
            TransportError::InvalidDescriptor {
                fd: write_raw,
                source,
            }
        })?;

        Ok(Self { reader, writer })
    }

    /// Adopt descriptors inherited from a parent process.
    ///
    /// # Safety
    ///
    /// `read` and `write` must be open pipe descriptors that nothing else in
    /// this process owns or will close.
    pub unsafe fn from_raw_fds(read: RawFd, write: RawFd) -> Result<Self> {
        for fd in [read, write] {
            if fd < 0 {
                return Err(TransportError::InvalidDescriptor {
                    fd,
                    source: std::io::Error::from(std::io::ErrorKind::InvalidInput),
                });
            }
        }
        // SAFETY: the caller guarantees exclusive ownership of both open descriptors.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(read), OwnedFd::from_raw_fd(write)) };
        debug!(
            read_fd = read.as_raw_fd(),
            write_fd = write.as_raw_fd(),
            "adopting inherited pipe descriptors"
        );
        Self::from_fds(read, write)
    }

    /// Split into the read end and the write end.
    pub fn into_split(self) -> (pipe::Receiver, pipe::Sender) {
        (self.reader, self.writer)
    }
}

impl From<DuplexPipe> for Connection {
    fn from(pipe: DuplexPipe) -> Self {
        let (reader, writer) = pipe.into_split();
        Connection::new(reader, writer)
    }
}

impl std::fmt::Debug for DuplexPipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplexPipe")
            .field("read_fd", &self.reader.as_raw_fd())
            .field("write_fd", &self.writer.as_raw_fd())
            .finish()
    }
}

/// Pipe ends a host process keeps for itself plus the ends it hands to a child.
///
/// The host creates these before spawning the tunnel daemon, marks the remote
/// ends inheritable, spawns, then drops [`RemoteEnds`] so that end-of-stream
/// propagates when the child exits.
#[derive(Debug)]
pub struct HostPipes {
    pub local: DuplexPipe,
    pub remote: RemoteEnds,
}

impl HostPipes {
    /// Create the two pipes. Must be called from within a tokio runtime.
    pub fn new() -> Result<Self> {
        let (remote_read, local_write) = create_pipe()?;
        let (local_read, remote_write) = create_pipe()?;
        let local = DuplexPipe::from_fds(local_read, local_write)?;
        Ok(Self {
            local,
            remote: RemoteEnds {
                read: remote_read,
                write: remote_write,
            },
        })
    }
}

/// The child's blocking pipe ends, still owned by the host until spawn.
#[derive(Debug)]
pub struct RemoteEnds {
    read: OwnedFd,
    write: OwnedFd,
}

impl RemoteEnds {
    /// Descriptor the child reads from.
    pub fn read_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    /// Descriptor the child writes to.
    pub fn write_fd(&self) -> RawFd {
        self.write.as_raw_fd()
    }

    /// Allow (or forbid) both ends to survive `exec` in a spawned child.
    pub fn set_inheritable(&self, inheritable: bool) -> Result<()> {
        set_cloexec(self.read.as_fd(), !inheritable)?;
        set_cloexec(self.write.as_fd(), !inheritable)
    }
}

fn create_pipe() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds: [libc::c_int; 2] = [-1, -1];
    // SAFETY: `fds` is a valid, writable two-element buffer as pipe(2) requires.
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if rc != 0 {
        return Err(TransportError::Pipe {
            op: "pipe",
            source: std::io::Error::last_os_error(),
        });
    }
    // SAFETY: pipe(2) succeeded, so both descriptors are open and unowned.
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    set_cloexec(read.as_fd(), true)?;
    set_cloexec(write.as_fd(), true)?;
    Ok((read, write))
}

fn set_cloexec(fd: BorrowedFd<'_>, cloexec: bool) -> Result<()> {
    let raw = fd.as_raw_fd();
    // SAFETY: `raw` comes from a live borrowed descriptor; F_GETFD takes no argument.
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFD) };
    if flags < 0 {
        return Err(TransportError::Pipe {
            op: "fcntl(F_GETFD)",
            source: std::io::Error::last_os_error(),
        });
    }

    let updated = if cloexec {
        flags | libc::FD_CLOEXEC
    } else {
        flags & !libc::FD_CLOEXEC
    };
    if updated == flags {
        return Ok(());
    }

    // SAFETY: same live descriptor; F_SETFD takes an int flag set.
    let rc = unsafe { libc::fcntl(raw, libc::F_SETFD, updated) };
    if rc < 0 {
        return Err(TransportError::Pipe {
            op: "fcntl(F_SETFD)",
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(())
}
