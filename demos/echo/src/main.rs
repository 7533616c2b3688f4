//! TCP echo server on the weft runtime.
//!
//! Every connection gets its own fiber; read and write readiness flow
//! through the shared reactor. Try it with `nc 127.0.0.1 7070`.

use std::time::Duration;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use weft::{AsyncTcpListener, AsyncTcpStream, Scheduler};

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::Layer::default().with_ansi(true))
        .init();

    let scheduler = Scheduler::new(0);
    let listener = AsyncTcpListener::bind("127.0.0.1:7070", &scheduler)
        .expect("failed to bind 127.0.0.1:7070");
    tracing::info!(addr = ?listener.local_addr(), "echo server listening");

    let accept_loop = scheduler.clone();
    scheduler.spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    tracing::info!(%peer, "connected");
                    accept_loop.spawn(echo(stream));
                }
                Err(err) => {
                    tracing::error!(%err, "accept failed");
                    break;
                }
            }
        }
    });

    loop {
        std::thread::sleep(Duration::from_secs(1));
    }
}

async fn echo(stream: AsyncTcpStream) {
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => {
                tracing::info!(peer = ?stream.peer_addr(), "disconnected");
                break;
            }
            Ok(n) => {
                if let Err(err) = stream.write_all(&buf[..n]).await {
                    tracing::warn!(%err, "write failed");
                    break;
                }
            }
            Err(err) => {
                tracing::warn!(%err, "read failed");
                break;
            }
        }
    }
}
