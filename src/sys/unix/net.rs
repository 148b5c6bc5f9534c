//! Raw non-blocking TCP socket calls backing [`crate::runtime::Runtime::listen`]
//! and [`crate::runtime::Runtime::connect`].
//!
//! Grounded on `tokio-rs-mio`'s `src/sys/unix/net.rs` (the
//! `SocketAddr`↔`sockaddr` conversion helpers) and `src/sys/unix/tcp.rs`
//! (socket/bind/listen/connect/accept shape), adapted to open every socket
//! non-blocking up front rather than relying on a caller to flip it
//! afterward, since this crate's reactor never wants a blocking fd in its
//! table.

use crate::error::{Error, ErrorKind, Result};
use std::mem::{size_of, MaybeUninit};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;

macro_rules! syscall {
    ($fn:ident ( $($arg:expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

fn map_err(err: std::io::Error) -> Error {
    if err.kind() == std::io::ErrorKind::WouldBlock
        || err.raw_os_error() == Some(libc::EINPROGRESS)
    {
        Error::with_io(ErrorKind::WouldBlock, err)
    } else {
        Error::with_io(ErrorKind::PollerFailure, err)
    }
}

/// Either C sockaddr shape this crate binds/connects with, laid out so a
/// pointer to either field is also a valid `*const libc::sockaddr`.
///
/// `std::net::SocketAddrV4`/`V6` stopped being layout-compatible with
/// `sockaddr_in`/`sockaddr_in6` well before this crate's declared
/// `rust-version` (current libstd represents them as a bare `{ ip, port }`
/// pair in host order, not the C struct), so the two are built explicitly
/// here field-by-field rather than reinterpreted by pointer cast - the way
/// modern `mio`'s own `sys::unix::net::socket_addr` does it.
#[repr(C)]
union SocketAddrCRepr {
    v4: libc::sockaddr_in,
    v6: libc::sockaddr_in6,
}

fn socket_addr_c(addr: &SocketAddr) -> (SocketAddrCRepr, libc::socklen_t) {
    match addr {
        SocketAddr::V4(a) => {
            let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = a.port().to_be();
            sin.sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(a.ip().octets()),
            };
            #[cfg(any(
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "ios",
                target_os = "macos",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "tvos",
                target_os = "visionos",
                target_os = "watchos",
            ))]
            {
                sin.sin_len = size_of::<libc::sockaddr_in>() as u8;
            }
            (SocketAddrCRepr { v4: sin }, size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(a) => {
            let mut sin6: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = a.port().to_be();
            sin6.sin6_addr = libc::in6_addr {
                s6_addr: a.ip().octets(),
            };
            sin6.sin6_flowinfo = a.flowinfo();
            sin6.sin6_scope_id = a.scope_id();
            #[cfg(any(
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "ios",
                target_os = "macos",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "tvos",
                target_os = "visionos",
                target_os = "watchos",
            ))]
            {
                sin6.sin6_len = size_of::<libc::sockaddr_in6>() as u8;
            }
            (SocketAddrCRepr { v6: sin6 }, size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

unsafe fn to_socket_addr(storage: &libc::sockaddr_storage) -> Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = &*(storage as *const libc::sockaddr_storage as *const libc::sockaddr_in);
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            let port = u16::from_be(sin.sin_port);
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        libc::AF_INET6 => {
            let sin6 = &*(storage as *const libc::sockaddr_storage as *const libc::sockaddr_in6);
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            let port = u16::from_be(sin6.sin6_port);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                port,
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => Err(Error::new(ErrorKind::PollerFailure)),
    }
}

fn new_nonblocking_socket(addr: &SocketAddr) -> Result<RawFd> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = syscall!(socket(
        domain,
        libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        0
    ))
    .map_err(map_err)?;
    Ok(fd)
}

/// Binds and listens on `addr`, returning the non-blocking listening fd.
pub fn bind(addr: SocketAddr) -> Result<RawFd> {
    let fd = new_nonblocking_socket(&addr)?;
    let one: libc::c_int = 1;
    syscall!(setsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_REUSEADDR,
        &one as *const _ as *const libc::c_void,
        size_of::<libc::c_int>() as libc::socklen_t
    ))
    .map_err(map_err)?;
    let (raw_addr, len) = socket_addr_c(&addr);
    syscall!(bind(fd, &raw_addr as *const SocketAddrCRepr as *const libc::sockaddr, len)).map_err(map_err)?;
    syscall!(listen(fd, 1024)).map_err(map_err)?;
    Ok(fd)
}

/// Accepts one pending connection from `listener_fd`, returning the new
/// connection's non-blocking fd and its peer address. Returns
/// [`ErrorKind::WouldBlock`] if none is pending.
pub fn accept(listener_fd: RawFd) -> Result<(RawFd, SocketAddr)> {
    let mut storage = MaybeUninit::<libc::sockaddr_storage>::zeroed();
    let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let fd = syscall!(accept4(
        listener_fd,
        storage.as_mut_ptr() as *mut libc::sockaddr,
        &mut len,
        libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC
    ))
    .map_err(map_err)?;
    let addr = unsafe { to_socket_addr(&storage.assume_init())? };
    Ok((fd, addr))
}

/// Starts a non-blocking connect to `addr`, returning the fd immediately.
/// The connect itself completes asynchronously; the caller must watch the
/// fd for writability and then check `take_error` to see whether it
/// actually succeeded.
pub fn connect(addr: SocketAddr) -> Result<RawFd> {
    let fd = new_nonblocking_socket(&addr)?;
    let (raw_addr, len) = socket_addr_c(&addr);
    match syscall!(connect(fd, &raw_addr as *const SocketAddrCRepr as *const libc::sockaddr, len)) {
        Ok(_) => Ok(fd),
        Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => Ok(fd),
        Err(err) => {
            crate::sys::unix::io::close(fd);
            Err(map_err(err))
        }
    }
}

/// Checks `SO_ERROR` on a fd whose non-blocking connect just became
/// writable, distinguishing "connected" from "failed."
pub fn take_error(fd: RawFd) -> Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = size_of::<libc::c_int>() as libc::socklen_t;
    syscall!(getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut err as *mut _ as *mut libc::c_void,
        &mut len
    ))
    .map_err(map_err)?;
    if err == 0 {
        Ok(())
    } else {
        Err(Error::with_io(
            ErrorKind::ConnectionClosed,
            std::io::Error::from_raw_os_error(err),
        ))
    }
}

pub fn peer_addr(fd: RawFd) -> Result<SocketAddr> {
    let mut storage = MaybeUninit::<libc::sockaddr_storage>::zeroed();
    let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(getpeername(
        fd,
        storage.as_mut_ptr() as *mut libc::sockaddr,
        &mut len
    ))
    .map_err(map_err)?;
    unsafe { to_socket_addr(&storage.assume_init()) }
}

/// The address a listening or connected fd is actually bound to - needed
/// once a caller binds to port `0` and wants to know which ephemeral port
/// the kernel picked.
pub fn local_addr(fd: RawFd) -> Result<SocketAddr> {
    let mut storage = MaybeUninit::<libc::sockaddr_storage>::zeroed();
    let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(getsockname(
        fd,
        storage.as_mut_ptr() as *mut libc::sockaddr,
        &mut len
    ))
    .map_err(map_err)?;
    unsafe { to_socket_addr(&storage.assume_init()) }
}
