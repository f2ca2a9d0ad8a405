/// Host-side BSD sockets for the card emulations.
///
/// Every socket is non-blocking from creation; the only waiting the
/// cards ever do is through [`HostSocket::poll_readable`] /
/// [`HostSocket::poll_writable`] with bounded timeouts (0, 50 or
/// 100 ms), so a bus access can never stall the emulated CPU for
/// longer than one such window.
use std::io;
use std::mem;
use std::os::unix::io::RawFd;

/// Outcome of starting a non-blocking connect.
#[derive(Debug, PartialEq)]
pub enum Connect {
    /// The connect completed immediately (loopback usually does).
    Done,
    /// EINPROGRESS — completion is reported later via
    /// `poll_writable` + `take_error`.
    InProgress,
}

pub struct HostSocket {
    fd: RawFd,
}

impl HostSocket {
    /// Non-blocking TCP socket.
    pub fn stream() -> io::Result<Self> {
        Self::new(libc::SOCK_STREAM)
    }

    /// Non-blocking UDP socket.
    pub fn dgram() -> io::Result<Self> {
        Self::new(libc::SOCK_DGRAM)
    }

    fn new(kind: libc::c_int) -> io::Result<Self> {
        let fd = unsafe { libc::socket(libc::AF_INET, kind, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let sock = Self { fd };
        sock.set_nonblocking()?;
        Ok(sock)
    }

    fn from_fd(fd: RawFd) -> Self {
        Self { fd }
    }

    fn set_nonblocking(&self) -> io::Result<()> {
        unsafe {
            let flags = libc::fcntl(self.fd, libc::F_GETFL, 0);
            if flags < 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::fcntl(self.fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    fn sockaddr(ip: [u8; 4], port: u16) -> libc::sockaddr_in {
        let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_port = port.to_be();
        // s_addr holds the octets in network order.
        addr.sin_addr.s_addr = u32::from_ne_bytes(ip);
        addr
    }

    /// Start a connect to `ip:port`. Returns `Connect::InProgress` on
    /// EINPROGRESS; any other failure is an error.
    pub fn connect(&self, ip: [u8; 4], port: u16) -> io::Result<Connect> {
        let addr = Self::sockaddr(ip, port);
        let ret = unsafe {
            libc::connect(
                self.fd,
                &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if ret == 0 {
            return Ok(Connect::Done);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINPROGRESS) {
            Ok(Connect::InProgress)
        } else {
            Err(err)
        }
    }

    /// Bind to `INADDR_ANY:port` and listen with backlog 1.
    pub fn bind_listen(&self, port: u16) -> io::Result<()> {
        let addr = Self::sockaddr([0, 0, 0, 0], port);
        unsafe {
            if libc::bind(
                self.fd,
                &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            ) < 0
            {
                return Err(io::Error::last_os_error());
            }
            if libc::listen(self.fd, 1) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    /// Accept a pending connection. The returned socket is set
    /// non-blocking.
    pub fn accept(&self) -> io::Result<HostSocket> {
        let fd = unsafe { libc::accept(self.fd, std::ptr::null_mut(), std::ptr::null_mut()) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let sock = HostSocket::from_fd(fd);
        sock.set_nonblocking()?;
        Ok(sock)
    }

    fn poll(&self, events: libc::c_short, timeout_ms: i32) -> bool {
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events,
            revents: 0,
        };
        unsafe { libc::poll(&mut pfd, 1, timeout_ms) > 0 }
    }

    /// True if the socket becomes readable within `timeout_ms`.
    pub fn poll_readable(&self, timeout_ms: i32) -> bool {
        self.poll(libc::POLLIN, timeout_ms)
    }

    /// True if the socket becomes writable within `timeout_ms`.
    pub fn poll_writable(&self, timeout_ms: i32) -> bool {
        self.poll(libc::POLLOUT, timeout_ms)
    }

    /// Fetch and clear the pending SO_ERROR, if any. Used to learn
    /// the outcome of a non-blocking connect.
    pub fn take_error(&self) -> Option<io::Error> {
        let mut err: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut libc::c_int as *mut libc::c_void,
                &mut len,
            )
        };
        if ret < 0 {
            return Some(io::Error::last_os_error());
        }
        if err == 0 {
            None
        } else {
            Some(io::Error::from_raw_os_error(err))
        }
    }

    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe { libc::send(self.fd, buf.as_ptr() as *const libc::c_void, buf.len(), 0) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    /// Read into `buf`. `Ok(0)` means the peer closed the connection.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

impl Drop for HostSocket {
    fn drop(&mut self) {
        // The standard descriptors belong to the terminal glue, not
        // to us; a card reset must never take them down.
        if self.fd > 2 {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};

    #[test]
    fn nonblocking_connect_to_loopback_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let sock = HostSocket::stream().unwrap();
        let started = sock.connect([127, 0, 0, 1], port).unwrap();

        // Loopback connects either complete at once or within one
        // writability window.
        if started == Connect::InProgress {
            assert!(sock.poll_writable(1000));
        }
        assert!(sock.take_error().is_none());

        let (mut peer, _) = listener.accept().unwrap();
        assert_eq!(sock.send(b"hi").unwrap(), 2);
        let mut buf = [0u8; 2];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[test]
    fn connect_to_dead_port_reports_so_error() {
        // Bind then immediately drop a listener to find a port with
        // nothing behind it.
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };

        let sock = HostSocket::stream().unwrap();
        match sock.connect([127, 0, 0, 1], port) {
            Ok(Connect::Done) => panic!("connect to dead port succeeded"),
            Ok(Connect::InProgress) => {
                assert!(sock.poll_writable(1000));
                assert!(sock.take_error().is_some());
            }
            Err(_) => {} // some platforms refuse synchronously
        }
    }

    #[test]
    fn listen_accept_and_peer_close_is_zero_read() {
        let sock = HostSocket::stream().unwrap();
        sock.bind_listen(0).unwrap();

        // Recover the bound port.
        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockname(
                sock.fd,
                &mut addr as *mut libc::sockaddr_in as *mut libc::sockaddr,
                &mut len,
            )
        };
        assert_eq!(ret, 0);
        let port = u16::from_be(addr.sin_port);

        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        assert!(sock.poll_readable(1000));
        let conn = sock.accept().unwrap();

        client.write_all(b"x").unwrap();
        drop(client);

        assert!(conn.poll_readable(1000));
        let mut buf = [0u8; 16];
        assert_eq!(conn.recv(&mut buf).unwrap(), 1);
        assert!(conn.poll_readable(1000));
        assert_eq!(conn.recv(&mut buf).unwrap(), 0, "peer close reads as zero");
    }
}
