//! Native stream socket ownership and raw non-blocking syscalls.
//!
//! [`NativeSocket`] owns exactly one descriptor. It is validated when it is
//! created, switched to non-blocking mode and closed when dropped.

use crate::error::ChannelError;

use libc::{F_GETFL, F_SETFL, O_NONBLOCK, S_IFMT, S_IFSOCK, fcntl, fstat, read};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

/// A non-blocking byte stream the channel can drive.
///
/// `read` and `write` perform exactly one attempt each and must report
/// "try again later" as [`io::ErrorKind::WouldBlock`].
pub trait Socket: AsRawFd + Send + 'static {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
}

/// An already-connected OS stream socket.
#[derive(Debug)]
pub struct NativeSocket {
    fd: OwnedFd,
}

impl NativeSocket {
    /// Takes ownership of `fd` after checking it is a socket.
    ///
    /// The descriptor is put into non-blocking mode. On failure the
    /// descriptor is closed.
    pub fn new(fd: OwnedFd) -> Result<Self, ChannelError> {
        let raw = fd.as_raw_fd();

        let mut stat: libc::stat = unsafe { mem::zeroed() };
        if unsafe { fstat(raw, &mut stat) } < 0 {
            return Err(invalid(raw, io::Error::last_os_error().to_string()));
        }

        if stat.st_mode & S_IFMT != S_IFSOCK {
            return Err(invalid(raw, "descriptor is not a socket".to_string()));
        }

        set_nonblocking(raw).map_err(|err| invalid(raw, err.to_string()))?;
        suppress_sigpipe(raw).map_err(|err| invalid(raw, err.to_string()))?;

        Ok(Self { fd })
    }
}

impl AsRawFd for NativeSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Socket for NativeSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let res = unsafe { read(self.fd.as_raw_fd(), buf.as_mut_ptr() as *mut _, buf.len()) };

        if res < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(res as usize)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let res = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                buf.as_ptr() as *const _,
                buf.len(),
                SEND_FLAGS,
            )
        };

        if res < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(res as usize)
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;

#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { fcntl(fd, F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }

    if flags & O_NONBLOCK != 0 {
        return Ok(());
    }

    if unsafe { fcntl(fd, F_SETFL, flags | O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn suppress_sigpipe(fd: RawFd) -> io::Result<()> {
    let on: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_NOSIGPIPE,
            &on as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };

    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

// MSG_NOSIGNAL on every send covers the other targets.
#[cfg(not(any(target_os = "macos", target_os = "ios")))]
fn suppress_sigpipe(_fd: RawFd) -> io::Result<()> {
    Ok(())
}

fn invalid(fd: RawFd, reason: String) -> ChannelError {
    ChannelError::InvalidHandle { fd, reason }
}
