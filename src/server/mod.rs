//! Listening socket setup and accept-loop sizing.
//!
//! Socket options are applied through raw `setsockopt` calls on the
//! listener and on every accepted socket. Option failures on the listener
//! are logged and ignored; option failures on an accepted socket close it.

pub(crate) mod connection;

use crate::config::SocketConfig;
use crate::error::{Error, Result};
use may::net::{TcpListener, TcpStream};
use std::io;
use tracing::{debug, warn};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// How the configured worker count is split between accept coroutines and
/// regular workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WorkerPlan {
    /// Scheduler thread-pool size.
    pub workers: usize,
    /// Accept coroutines to spawn.
    pub acceptors: usize,
    /// Workers left for request processing (informational; the scheduler
    /// is shared).
    pub regular: usize,
}

/// Derive the worker split. Zero or negative `configured` means hardware
/// concurrency.
pub(crate) fn worker_plan(configured: i32) -> WorkerPlan {
    let workers = if configured <= 0 {
        num_cpus::get().max(1) as i32
    } else {
        configured
    };

    let mut acceptors = if workers <= 4 {
        1
    } else if workers <= 16 {
        (workers / 6).max(2)
    } else {
        (workers / 8).max(3)
    };
    acceptors = acceptors.max(1);

    let mut regular = workers - acceptors;
    if regular < 1 {
        regular = 1;
        if workers == 1 {
            acceptors = 1;
        }
    }

    WorkerPlan {
        workers: workers as usize,
        acceptors: acceptors as usize,
        regular: regular as usize,
    }
}

#[cfg(unix)]
fn set_option_i32(fd: i32, level: i32, name: i32, value: i32) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const i32 as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Bind the listening socket and apply listener-level options. Option
/// failures are warnings; bind and listen failures abort startup.
pub(crate) fn bind_listener(host: &str, port: u16, max_connections: i32) -> Result<TcpListener> {
    let listener = TcpListener::bind((host, port))
        .map_err(|e| Error::server(format!("Failed to bind {host}:{port}: {e}")))?;

    #[cfg(unix)]
    {
        let fd = listener.as_raw_fd();

        if let Err(e) = set_option_i32(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1) {
            warn!(error = %e, "Failed to set REUSEADDR option");
        }

        #[cfg(any(target_os = "linux", target_os = "macos"))]
        if let Err(e) = set_option_i32(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, 1) {
            warn!(error = %e, "Failed to set REUSEPORT option");
        }

        #[cfg(target_os = "linux")]
        if let Err(e) = set_option_i32(fd, libc::IPPROTO_TCP, libc::TCP_FASTOPEN, 5) {
            warn!(error = %e, "Failed to set TCP_FASTOPEN option");
        }

        // widen the backlog to the connection cap
        let rc = unsafe { libc::listen(fd, max_connections.max(1)) };
        if rc != 0 {
            return Err(Error::server(format!(
                "Failed to listen: {}",
                io::Error::last_os_error()
            )));
        }
    }
    #[cfg(not(unix))]
    let _ = max_connections;

    debug!(max_connections, "Acceptor listening");
    Ok(listener)
}

/// Apply per-connection options to an accepted socket. Any failure is
/// reported back so the caller can drop the connection.
pub(crate) fn apply_connection_options(stream: &TcpStream, cfg: &SocketConfig) -> io::Result<()> {
    if cfg.tcp_no_delay {
        stream.set_nodelay(true)?;

        #[cfg(target_os = "linux")]
        set_option_i32(
            stream.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_QUICKACK,
            1,
        )?;
    }

    #[cfg(unix)]
    {
        let fd = stream.as_raw_fd();
        if cfg.rcv_buf_size > 0 {
            set_option_i32(fd, libc::SOL_SOCKET, libc::SO_RCVBUF, cfg.rcv_buf_size as i32)?;
        }
        if cfg.snd_buf_size > 0 {
            set_option_i32(fd, libc::SOL_SOCKET, libc::SO_SNDBUF, cfg.snd_buf_size as i32)?;
        }
    }

    Ok(())
}
