//! Connected TCP stream and its read/write awaitables.

use std::future::Future;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::AsRawFd;
use std::pin::Pin;
use std::task::{Context, Poll};

use weft_runtime::{Fiber, Scheduler};

/// Non-blocking TCP stream bound to a scheduler's reactor.
pub struct AsyncTcpStream {
    stream: TcpStream,
    scheduler: Scheduler,
}

impl AsyncTcpStream {
    /// Adopt a std stream, switching it to non-blocking mode.
    pub fn from_std(stream: TcpStream, scheduler: &Scheduler) -> io::Result<AsyncTcpStream> {
        stream.set_nonblocking(true)?;
        Ok(AsyncTcpStream {
            stream,
            scheduler: scheduler.clone(),
        })
    }

    /// Read into `buf`. Resolves to the number of bytes read; `Ok(0)` is
    /// end of stream (the peer closed its end).
    pub fn read<'a>(&'a self, buf: &'a mut [u8]) -> Readable<'a> {
        Readable { stream: self, buf }
    }

    /// Write from `buf`. Resolves to the number of bytes accepted, which
    /// may be short; see [`AsyncTcpStream::write_all`].
    pub fn write<'a>(&'a self, buf: &'a [u8]) -> Writable<'a> {
        Writable { stream: self, buf }
    }

    /// Write the whole buffer.
    pub async fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut written = 0;
        while written < buf.len() {
            let n = self.write(&buf[written..]).await?;
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            written += n;
        }
        Ok(())
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }
}

/// Future returned by [`AsyncTcpStream::read`].
pub struct Readable<'a> {
    stream: &'a AsyncTcpStream,
    buf: &'a mut [u8],
}

impl Future for Readable<'_> {
    type Output = io::Result<usize>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            match (&this.stream.stream).read(this.buf) {
                Ok(n) => return Poll::Ready(Ok(n)),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    // Also re-arms after a wake that found no data.
                    let fd = this.stream.stream.as_raw_fd();
                    return match this
                        .stream
                        .scheduler
                        .reactor()
                        .register_read(fd, Fiber::current())
                    {
                        Ok(()) => Poll::Pending,
                        Err(err) => Poll::Ready(Err(err)),
                    };
                }
                Err(err) => return Poll::Ready(Err(err)),
            }
        }
    }
}

/// Future returned by [`AsyncTcpStream::write`].
pub struct Writable<'a> {
    stream: &'a AsyncTcpStream,
    buf: &'a [u8],
}

impl Future for Writable<'_> {
    type Output = io::Result<usize>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            match (&this.stream.stream).write(this.buf) {
                Ok(n) => return Poll::Ready(Ok(n)),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    let fd = this.stream.stream.as_raw_fd();
                    return match this
                        .stream
                        .scheduler
                        .reactor()
                        .register_write(fd, Fiber::current())
                    {
                        Ok(()) => Poll::Pending,
                        Err(err) => Poll::Ready(Err(err)),
                    };
                }
                Err(err) => return Poll::Ready(Err(err)),
            }
        }
    }
}
