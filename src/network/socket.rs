//! Socket helpers shared by server and client
//!
//! Handles option tuning, backlog setup and the liveness probe. The probe
//! works on a duplicated handle so it can be used from any thread while the
//! driver keeps exclusive ownership of the registered mio socket.

use std::io;
use std::net::{Shutdown, TcpListener as StdTcpListener, TcpStream as StdTcpStream};

use mio::net::TcpStream;
use tracing::{debug, warn};

/// Apply per-socket options to a freshly accepted or connected stream
pub(crate) fn tune(
    stream: &TcpStream,
    nodelay: bool,
    buffer_size: Option<usize>,
) -> io::Result<()> {
    // Disable Nagle's algorithm untuk lower latency
    stream.set_nodelay(nodelay)?;

    if let Some(size) = buffer_size {
        set_buffer_sizes(stream, size);
    }
    Ok(())
}

/// Set SO_SNDBUF and SO_RCVBUF. Failures are logged, not fatal.
#[cfg(unix)]
fn set_buffer_sizes(stream: &TcpStream, size: usize) {
    use std::os::unix::io::AsRawFd;

    let fd = stream.as_raw_fd();
    let optval = size.min(libc::c_int::MAX as usize) as libc::c_int;

    for (name, option) in [("SO_SNDBUF", libc::SO_SNDBUF), ("SO_RCVBUF", libc::SO_RCVBUF)] {
        // SAFETY: fd is a live socket borrowed from `stream`, optval outlives the call
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                option,
                &optval as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            warn!(option = name, size, err = ?io::Error::last_os_error(), "setsockopt failed");
        }
    }
}

#[cfg(not(unix))]
fn set_buffer_sizes(_stream: &TcpStream, size: usize) {
    debug!(size, "Socket buffer sizing not supported on this platform");
}

/// Re-issue listen(2) so the backlog matches the configured queue length.
///
/// std binds with a fixed backlog; calling listen again on a listening
/// socket only updates the queue length.
#[cfg(unix)]
pub(crate) fn set_backlog(listener: &StdTcpListener, backlog: u32) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let backlog = backlog.min(libc::c_int::MAX as u32) as libc::c_int;
    // SAFETY: the fd is a bound listening socket owned by `listener`
    let rc = unsafe { libc::listen(listener.as_raw_fd(), backlog) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn set_backlog(_listener: &StdTcpListener, backlog: u32) -> io::Result<()> {
    debug!(backlog, "Custom backlog not supported on this platform, using default");
    Ok(())
}

/// Duplicate the OS handle behind a mio stream
#[cfg(unix)]
pub(crate) fn duplicate(stream: &TcpStream) -> io::Result<StdTcpStream> {
    use std::os::fd::AsFd;

    let owned = stream.as_fd().try_clone_to_owned()?;
    let probe = StdTcpStream::from(owned);
    probe.set_nonblocking(true)?;
    Ok(probe)
}

#[cfg(windows)]
pub(crate) fn duplicate(stream: &TcpStream) -> io::Result<StdTcpStream> {
    use std::os::windows::io::AsSocket;

    let owned = stream.as_socket().try_clone_to_owned()?;
    let probe = StdTcpStream::from(owned);
    probe.set_nonblocking(true)?;
    Ok(probe)
}

/// Liveness check: the socket has a peer and a non-consuming peek does not
/// report end-of-stream or an error.
pub(crate) fn is_alive(probe: &StdTcpStream) -> bool {
    if probe.peer_addr().is_err() {
        return false;
    }

    let mut byte = [0u8; 1];
    match probe.peek(&mut byte) {
        Ok(0) => false,
        Ok(_) => true,
        Err(ref e)
            if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted =>
        {
            true
        }
        Err(_) => false,
    }
}

/// Shut down both directions, ignoring sockets that are already gone
pub(crate) fn shutdown(probe: &StdTcpStream) {
    report_shutdown(probe.shutdown(Shutdown::Both));
}

/// `shutdown` for the registered mio stream
pub(crate) fn shutdown_stream(stream: &TcpStream) {
    report_shutdown(stream.shutdown(Shutdown::Both));
}

fn report_shutdown(result: io::Result<()>) {
    match result {
        Ok(()) => {}
        Err(ref e) if e.kind() == io::ErrorKind::NotConnected => {}
        Err(e) => debug!(err = ?e, "Socket shutdown failed"),
    }
}
