//! Stdout capture for text the engine prints instead of returning.
//!
//! libiperf writes its JSON report straight to file descriptor 1. To collect
//! it, [`StdoutCapture::redirect`] points fd 1 at a pipe for the duration of a
//! run and the returned [`Redirect`] guard puts the original descriptors back.
//! Afterwards [`StdoutCapture::drain`] collects whatever the engine left in the
//! pipe without ever blocking.
//!
//! Stdout is process-wide, so only one redirection may be active in the whole
//! process at a time; a second attempt fails with [`Error::CaptureBusy`].

use crate::{Error, Result};
use log::{debug, error, warn};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::raw::c_int;
use std::sync::atomic::{AtomicBool, Ordering};

static CAPTURE_ACTIVE: AtomicBool = AtomicBool::new(false);

const READ_CHUNK: usize = 1024;

#[cfg(target_os = "linux")]
const PIPE_CAPACITY: c_int = 1 << 20;

/// An anonymous pipe that can stand in for stdout.
pub struct StdoutCapture {
    reader: File,
    writer: OwnedFd,
}

impl StdoutCapture {
    /// Creates the pipe. The read end is non-blocking; both ends are
    /// close-on-exec.
    pub fn new() -> Result<Self> {
        let mut fds: [c_int; 2] = [-1, -1];
        // SAFETY: `fds` has room for the two descriptors pipe() writes.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error().into());
        }
        // SAFETY: pipe() succeeded, so both descriptors are open and ours.
        let (reader, writer) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

        set_fd_flag(reader.as_raw_fd(), libc::F_GETFD, libc::F_SETFD, libc::FD_CLOEXEC)?;
        set_fd_flag(writer.as_raw_fd(), libc::F_GETFD, libc::F_SETFD, libc::FD_CLOEXEC)?;
        set_fd_flag(reader.as_raw_fd(), libc::F_GETFL, libc::F_SETFL, libc::O_NONBLOCK)?;

        #[cfg(target_os = "linux")]
        {
            // SAFETY: F_SETPIPE_SZ on a pipe we own; failure is harmless.
            let size = unsafe { libc::fcntl(writer.as_raw_fd(), libc::F_SETPIPE_SZ, PIPE_CAPACITY) };
            if size < 0 {
                debug!(
                    "Could not enlarge capture pipe: {}",
                    io::Error::last_os_error()
                );
            }
        }

        Ok(Self {
            reader: File::from(reader),
            writer,
        })
    }

    /// Points stdout at the pipe until the returned guard is restored or
    /// dropped.
    ///
    /// The current stdout and stderr targets are duplicated first, so
    /// restoring returns exactly to what was installed at this call.
    pub fn redirect(&self) -> Result<Redirect<'_>> {
        if CAPTURE_ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::CaptureBusy);
        }

        match self.install() {
            Ok(redirect) => Ok(redirect),
            Err(e) => {
                CAPTURE_ACTIVE.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    fn install(&self) -> Result<Redirect<'_>> {
        flush_stdio();
        let stdout = io::stdout().as_fd().try_clone_to_owned()?;
        let stderr = io::stderr().as_fd().try_clone_to_owned()?;
        dup2(self.writer.as_raw_fd(), libc::STDOUT_FILENO)?;
        Ok(Redirect {
            _capture: self,
            stdout,
            stderr,
            restored: false,
        })
    }

    /// Collects everything currently buffered in the pipe.
    ///
    /// Polls with a zero timeout and reads until nothing more is immediately
    /// available, so a slow writer never stalls the caller. Invalid UTF-8 is
    /// replaced rather than rejected.
    pub fn drain(&self) -> Result<String> {
        let mut captured = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];

        while self.has_pending()? {
            match (&self.reader).read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => captured.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        match String::from_utf8(captured) {
            Ok(text) => Ok(text),
            Err(e) => {
                warn!("Captured engine output is not valid UTF-8, replacing invalid bytes");
                Ok(String::from_utf8_lossy(e.as_bytes()).into_owned())
            }
        }
    }

    fn has_pending(&self) -> io::Result<bool> {
        let mut pollfd = libc::pollfd {
            fd: self.reader.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        loop {
            // SAFETY: one valid pollfd, zero timeout.
            let ready = unsafe { libc::poll(&mut pollfd, 1, 0) };
            if ready < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            return Ok(ready > 0 && pollfd.revents & libc::POLLIN != 0);
        }
    }
}

/// Active stdout redirection. Restores the saved descriptors on
/// [`Redirect::restore`] or, failing that, on drop.
pub struct Redirect<'a> {
    _capture: &'a StdoutCapture,
    stdout: OwnedFd,
    stderr: OwnedFd,
    restored: bool,
}

impl Redirect<'_> {
    /// Reinstates the stdout and stderr targets saved by `redirect`.
    pub fn restore(mut self) -> Result<()> {
        self.reinstate()
    }

    fn reinstate(&mut self) -> Result<()> {
        if self.restored {
            return Ok(());
        }
        self.restored = true;

        // Push anything the engine left in C stdio buffers into the pipe.
        flush_stdio();
        let stdout = dup2(self.stdout.as_raw_fd(), libc::STDOUT_FILENO);
        let stderr = dup2(self.stderr.as_raw_fd(), libc::STDERR_FILENO);
        CAPTURE_ACTIVE.store(false, Ordering::Release);

        stdout?;
        stderr?;
        Ok(())
    }
}

impl Drop for Redirect<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.reinstate() {
            error!("Failed to restore stdout after capture: {}", e);
        }
    }
}

fn flush_stdio() {
    let _ = io::stdout().flush();
    // SAFETY: fflush(NULL) flushes every open C output stream.
    unsafe {
        libc::fflush(std::ptr::null_mut());
    }
}

fn dup2(src: RawFd, dst: RawFd) -> io::Result<()> {
    loop {
        // SAFETY: both descriptors are open for the duration of the call.
        if unsafe { libc::dup2(src, dst) } >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn set_fd_flag(fd: RawFd, get: c_int, set: c_int, flag: c_int) -> io::Result<()> {
    // SAFETY: plain fcntl flag manipulation on a descriptor we own.
    unsafe {
        let flags = libc::fcntl(fd, get);
        if flags < 0 || libc::fcntl(fd, set, flags | flag) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
