// Kernel socket buffer sizing.
//
// Media frames arrive in bursts (a JPEG video frame is tens of kilobytes) and
// the default UDP receive buffer drops them under load. Both the relay's media
// socket and the client transceiver enlarge SO_RCVBUF and SO_SNDBUF through
// `setsockopt`. The kernel may clamp or double the requested size; failure is
// logged and otherwise ignored, since the socket still works at default size.

use tracing::warn;

/// Request `bytes` for both kernel buffers. 0 leaves the OS defaults.
#[cfg(unix)]
pub fn apply_buffer_size(socket: &impl std::os::unix::io::AsRawFd, bytes: usize) {
    if bytes == 0 {
        return;
    }
    let fd = socket.as_raw_fd();
    for (option, label) in [(libc::SO_RCVBUF, "SO_RCVBUF"), (libc::SO_SNDBUF, "SO_SNDBUF")] {
        if let Err(e) = set_option(fd, option, bytes) {
            warn!(option = label, bytes, error = %e, "could not size socket buffer");
        }
    }
}

#[cfg(not(unix))]
pub fn apply_buffer_size<S>(_socket: &S, bytes: usize) {
    if bytes != 0 {
        warn!(bytes, "socket buffer sizing is not supported on this platform");
    }
}

#[cfg(unix)]
fn set_option(fd: libc::c_int, option: libc::c_int, bytes: usize) -> std::io::Result<()> {
    let value = libc::c_int::try_from(bytes).unwrap_or(libc::c_int::MAX);
    // SAFETY: fd is a live socket borrowed from the caller; value outlives the call.
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            option,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
