// Port allocation for server instances
// Probes the preferred port, then the fallback list, with a bind-and-release test

use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, ErrorKind};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener};

const LISTEN_BACKLOG: i32 = 128;

/// Find the first bindable port among `preferred` and `fallbacks`.
///
/// "Address in use" and "permission denied" move on to the next candidate.
/// Any other bind error aborts the search. `Ok(None)` means every candidate
/// was taken. Nothing is held open after a successful probe, so another
/// process may still win the port before the real bind.
pub fn allocate_port(preferred: u16, fallbacks: &[u16]) -> io::Result<Option<u16>> {
    let mut tried: Vec<u16> = Vec::with_capacity(fallbacks.len() + 1);

    for port in std::iter::once(preferred).chain(fallbacks.iter().copied()) {
        if tried.contains(&port) {
            continue;
        }
        tried.push(port);

        match probe(port) {
            Ok(()) => return Ok(Some(port)),
            Err(e) if is_unavailable(&e) => {
                if port == preferred {
                    let reason = if e.kind() == ErrorKind::PermissionDenied {
                        "reserved or permission denied"
                    } else {
                        "in use"
                    };
                    tracing::warn!(port, reason, "preferred port unavailable, trying fallbacks");
                } else {
                    tracing::debug!(port, error = %e, "fallback port unavailable");
                }
            }
            Err(e) => return Err(e),
        }
    }

    Ok(None)
}

/// Bind the real listening socket for a server instance.
///
/// Uses the same addressing convention as the allocation probe: a dual-stack
/// `[::]` socket on POSIX-like systems, IPv4 loopback on Windows.
pub fn bind_listener(port: u16) -> io::Result<TcpListener> {
    let socket = bind_socket(port)?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}

/// Errors that mean "try the next candidate"
pub fn is_unavailable(err: &io::Error) -> bool {
    matches!(err.kind(), ErrorKind::AddrInUse | ErrorKind::PermissionDenied)
}

fn probe(port: u16) -> io::Result<()> {
    // Dropping the socket releases the port immediately.
    bind_socket(port).map(drop)
}

#[cfg(windows)]
fn bind_socket(port: u16) -> io::Result<Socket> {
    bind_v4(Ipv4Addr::LOCALHOST, port)
}

#[cfg(not(windows))]
fn bind_socket(port: u16) -> io::Result<Socket> {
    let socket = match Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP)) {
        Ok(socket) => socket,
        Err(e) if ipv6_unsupported(&e) => {
            tracing::debug!("IPv6 unavailable, binding IPv4 only");
            return bind_v4(Ipv4Addr::UNSPECIFIED, port);
        }
        Err(e) => return Err(e),
    };
    // Accept IPv4 clients on the same socket.
    socket.set_only_v6(false)?;
    reuse_address(&socket)?;
    socket.bind(&SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)).into())?;
    Ok(socket)
}

fn bind_v4(addr: Ipv4Addr, port: u16) -> io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    reuse_address(&socket)?;
    socket.bind(&SocketAddr::from((addr, port)).into())?;
    Ok(socket)
}

/// Lets a restarted server reclaim a port whose old connections are still in
/// TIME_WAIT. Only Linux keeps refusing the bind while another socket is
/// listening on an overlapping address; BSD and macOS would let a wildcard
/// bind slip past a loopback listener, so the option stays off elsewhere.
fn reuse_address(socket: &Socket) -> io::Result<()> {
    if cfg!(target_os = "linux") {
        socket.set_reuse_address(true)
    } else {
        Ok(())
    }
}

#[cfg(unix)]
fn ipv6_unsupported(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EAFNOSUPPORT)
}

#[cfg(not(any(unix, windows)))]
fn ipv6_unsupported(_err: &io::Error) -> bool {
    false
}
