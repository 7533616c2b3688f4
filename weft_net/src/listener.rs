//! Listening socket and the accept awaitable.

use std::future::Future;
use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::os::unix::io::AsRawFd;
use std::pin::Pin;
use std::task::{Context, Poll};

use weft_runtime::{Fiber, Scheduler};

use crate::stream::AsyncTcpStream;

/// Non-blocking TCP listener bound to a scheduler's reactor.
pub struct AsyncTcpListener {
    listener: TcpListener,
    scheduler: Scheduler,
}

impl AsyncTcpListener {
    pub fn bind<A: ToSocketAddrs>(addr: A, scheduler: &Scheduler) -> io::Result<AsyncTcpListener> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        tracing::debug!(addr = ?listener.local_addr(), "listener bound");
        Ok(AsyncTcpListener {
            listener,
            scheduler: scheduler.clone(),
        })
    }

    /// Accept one connection. An idle listener arms read interest; a
    /// connection arriving is readiness on the listening socket.
    pub fn accept(&self) -> Accept<'_> {
        Accept { listener: self }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

/// Future returned by [`AsyncTcpListener::accept`].
pub struct Accept<'a> {
    listener: &'a AsyncTcpListener,
}

impl Future for Accept<'_> {
    type Output = io::Result<(AsyncTcpStream, SocketAddr)>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            match this.listener.listener.accept() {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "accepted connection");
                    let stream = AsyncTcpStream::from_std(stream, &this.listener.scheduler);
                    return Poll::Ready(stream.map(|stream| (stream, peer)));
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    let fd = this.listener.listener.as_raw_fd();
                    return match this
                        .listener
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
