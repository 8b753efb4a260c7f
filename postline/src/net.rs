//! Sockets for both execution modes.
use std::{
    io::{self, Read, Write},
    net::{Shutdown, TcpStream, ToSocketAddrs},
    time::Duration,
};

use crate::{connection::Config, transport::socket_path};

/// Either a std `TcpStream` or `UnixStream`.
#[derive(Debug)]
pub(crate) enum BlockingSocket {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixStream),
}

impl BlockingSocket {
    pub(crate) fn connect(config: &Config) -> io::Result<BlockingSocket> {
        #[cfg(unix)]
        if let Some(dir) = &config.socket {
            let path = socket_path(dir, config.port);
            let socket = std::os::unix::net::UnixStream::connect(path)?;
            return Ok(BlockingSocket::Unix(socket));
        }

        let mut last_err = None;
        for addr in (&*config.host, config.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, config.connect_timeout) {
                Ok(socket) => {
                    socket.set_nodelay(true)?;
                    return Ok(BlockingSocket::Tcp(socket));
                }
                Err(err) => last_err = Some(err),
            }
        }

        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "host resolved to no address")
        }))
    }

    pub(crate) fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            BlockingSocket::Tcp(t) => t.set_read_timeout(timeout),
            #[cfg(unix)]
            BlockingSocket::Unix(u) => u.set_read_timeout(timeout),
        }
    }

    pub(crate) fn shutdown(&self) -> io::Result<()> {
        match self {
            BlockingSocket::Tcp(t) => t.shutdown(Shutdown::Both),
            #[cfg(unix)]
            BlockingSocket::Unix(u) => u.shutdown(Shutdown::Both),
        }
    }
}

impl Read for BlockingSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            BlockingSocket::Tcp(t) => t.read(buf),
            #[cfg(unix)]
            BlockingSocket::Unix(u) => u.read(buf),
        }
    }
}

impl Write for BlockingSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            BlockingSocket::Tcp(t) => t.write(buf),
            #[cfg(unix)]
            BlockingSocket::Unix(u) => u.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            BlockingSocket::Tcp(t) => t.flush(),
            #[cfg(unix)]
            BlockingSocket::Unix(u) => u.flush(),
        }
    }
}

#[cfg(feature = "tokio")]
pub(crate) use socket::Socket;

#[cfg(feature = "tokio")]
mod socket {
    use std::{
        io,
        pin::Pin,
        task::{Context, Poll},
    };
    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

    use crate::{connection::Config, transport::socket_path};

    /// Either a tokio `TcpStream` or `UnixStream`, which implement
    /// `AsyncRead` and `AsyncWrite` transparently.
    #[derive(Debug)]
    pub(crate) enum Socket {
        Tcp(tokio::net::TcpStream),
        #[cfg(unix)]
        Unix(tokio::net::UnixStream),
    }

    impl Socket {
        pub(crate) async fn connect(config: &Config) -> io::Result<Socket> {
            let connect = async {
                #[cfg(unix)]
                if let Some(dir) = &config.socket {
                    let socket = tokio::net::UnixStream::connect(socket_path(dir, config.port)).await?;
                    return Ok(Socket::Unix(socket));
                }

                let socket = tokio::net::TcpStream::connect((&*config.host, config.port)).await?;
                socket.set_nodelay(true)?;
                Ok::<_, io::Error>(Socket::Tcp(socket))
            };

            match tokio::time::timeout(config.connect_timeout, connect).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
            }
        }
    }

    impl AsyncRead for Socket {
        fn poll_read(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            match self.get_mut() {
                Socket::Tcp(t) => Pin::new(t).poll_read(cx, buf),
                #[cfg(unix)]
                Socket::Unix(u) => Pin::new(u).poll_read(cx, buf),
            }
        }
    }

    impl AsyncWrite for Socket {
        fn poll_write(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            match self.get_mut() {
                Socket::Tcp(t) => Pin::new(t).poll_write(cx, buf),
                #[cfg(unix)]
                Socket::Unix(u) => Pin::new(u).poll_write(cx, buf),
            }
        }

        fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            match self.get_mut() {
                Socket::Tcp(t) => Pin::new(t).poll_flush(cx),
                #[cfg(unix)]
                Socket::Unix(u) => Pin::new(u).poll_flush(cx),
            }
        }

        fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            match self.get_mut() {
                Socket::Tcp(t) => Pin::new(t).poll_shutdown(cx),
                #[cfg(unix)]
                Socket::Unix(u) => Pin::new(u).poll_shutdown(cx),
            }
        }
    }
}
