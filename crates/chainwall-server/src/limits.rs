//! Process resource limits.

use std::io;

use tracing::{info, warn};

/// Below this many descriptors a busy server runs out of sockets.
const LOW_FILE_LIMIT: u64 = 8192;

/// Raise the open file soft limit to the hard limit.
///
/// Returns the soft limit before and after.
#[cfg(unix)]
pub fn raise_file_limit() -> io::Result<(u64, u64)> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `limit` is a valid, writable rlimit.
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let before = limit.rlim_cur as u64;
    if limit.rlim_cur < limit.rlim_max {
        let raised = libc::rlimit {
            rlim_cur: limit.rlim_max,
            rlim_max: limit.rlim_max,
        };
        // SAFETY: `raised` is a valid rlimit that does not exceed the hard limit.
        if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &raised) } != 0 {
            return Err(io::Error::last_os_error());
        }
        return Ok((before, raised.rlim_cur as u64));
    }
    Ok((before, before))
}

#[cfg(not(unix))]
pub fn raise_file_limit() -> io::Result<(u64, u64)> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "file limits are not adjustable on this platform",
    ))
}

/// Raise the open file limit and log the outcome.
pub fn log_file_limit() {
    match raise_file_limit() {
        Ok((before, after)) if after < LOW_FILE_LIMIT => warn!(
            before,
            after, "open file limit is below {LOW_FILE_LIMIT}; raise the hard limit for busy servers"
        ),
        Ok((before, after)) => info!(before, after, "open file limit"),
        Err(e) => warn!(error = %e, "failed to raise the open file limit"),
    }
}
