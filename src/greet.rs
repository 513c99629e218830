use std::{
    future::Future,
    io::{self, ErrorKind},
    net::SocketAddr,
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpSocket},
    task::{JoinError, JoinSet},
};

/// What every client gets back once it sent something.
pub const GREETING: &[u8] = b"Hello from the server!";

/// A single read of at most that many bytes is the whole message.
pub const MAX_MESSAGE_LEN: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("cannot listen on {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
    #[error("failed to accept a new connection: {0}")]
    Accept(#[source] io::Error),
    #[error("connection with {peer} failed: {source}")]
    Connection { peer: SocketAddr, source: io::Error },
}

impl ServerError {
    /// Accept errors caused by a single client going away before we got to it.
    /// Anything else means the listener itself is in trouble.
    pub fn is_transient_accept(err: &io::Error) -> bool {
        matches!(
            err.kind(),
            ErrorKind::ConnectionAborted
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionRefused
                | ErrorKind::Interrupted
                | ErrorKind::WouldBlock
                | ErrorKind::TimedOut
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// accept, handle, then accept the next one
    Sequential,
    /// one task per connection
    Concurrent,
}

impl Mode {
    fn max_in_flight(self) -> usize {
        match self {
            Mode::Sequential => 1,
            Mode::Concurrent => usize::MAX,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub addr: SocketAddr,
    pub mode: Mode,
    pub backlog: u32,
    pub max_len: usize,
    /// how long in-flight connections get to finish once shutdown is requested
    pub shutdown_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: ([127, 0, 0, 1], 8080).into(),
            mode: Mode::Concurrent,
            backlog: 1024,
            max_len: MAX_MESSAGE_LEN,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// How a connection ended when nothing went wrong.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    /// the peer closed without sending anything
    Empty,
    Replied(Bytes),
}

pub struct Server {
    listener: TcpListener,
    config: Config,
}

impl Server {
    pub async fn bind(config: Config) -> Result<Self, ServerError> {
        let addr = config.addr;
        let bind_err = |source| ServerError::Bind { addr, source };
        let listener = listen(addr, config.backlog).map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;
        tracing::info!("Server listening on {local_addr}");
        Ok(Server { listener, config })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until the process is killed or the listener fails.
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` completes. The listener is closed right away,
    /// connections already accepted get `shutdown_grace` to finish before
    /// they're aborted.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let Server { listener, config } = self;
        let max_in_flight = config.mode.max_in_flight();
        let max_len = config.max_len.max(1);
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        let result = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("shutdown requested, closing the listener");
                    break Ok(());
                }
                x = listener.accept(), if connections.len() < max_in_flight => {
                    let (stream, peer) = match x {
                        Ok(x) => x,
                        Err(err) if ServerError::is_transient_accept(&err) => {
                            tracing::warn!("could not accept a connection: {err}");
                            continue;
                        }
                        Err(err) => {
                            tracing::error!("listener failed, stopping: {err}");
                            break Err(ServerError::Accept(err));
                        }
                    };
                    connections.spawn(async move {
                        match handle_connection(stream, peer, max_len).await {
                            Ok(Outcome::Empty) => {
                                tracing::info!("{peer} closed without sending data")
                            }
                            Ok(Outcome::Replied(msg)) => {
                                tracing::debug!("replied to {peer}, read {} bytes", msg.len())
                            }
                            Err(err) => tracing::warn!("{err}"),
                        }
                    });
                }
                Some(res) = connections.join_next(), if !connections.is_empty() => {
                    check_join(res);
                }
            }
        };

        drop(listener);
        if !connections.is_empty() {
            tracing::info!(
                "waiting on {} connection(s) before exiting",
                connections.len()
            );
            let drain = async {
                while let Some(res) = connections.join_next().await {
                    check_join(res);
                }
            };
            if tokio::time::timeout(config.shutdown_grace, drain)
                .await
                .is_err()
            {
                tracing::warn!(
                    "grace period over, dropping {} connection(s)",
                    connections.len()
                );
                connections.shutdown().await;
            }
        }

        result
    }
}

fn listen(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    // lets a restarted server take the port back while old connections sit in TIME_WAIT
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

fn check_join(res: Result<(), JoinError>) {
    if let Err(err) = res {
        if err.is_panic() {
            tracing::error!("connection task panicked: {err}");
        }
    }
}

/// Read once, greet back if anything came in, then close.
pub async fn handle_connection<S>(
    mut stream: S,
    peer: SocketAddr,
    max_len: usize,
) -> Result<Outcome, ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tracing::info!("Accepted connection from {peer}");
    let io_err = |source| ServerError::Connection { peer, source };

    let mut buf = BytesMut::zeroed(max_len);
    let n = stream.read(&mut buf).await.map_err(io_err)?;
    if n == 0 {
        stream.shutdown().await.map_err(io_err)?;
        return Ok(Outcome::Empty);
    }

    buf.truncate(n);
    let msg = buf.freeze();
    tracing::info!("Received data: {}", String::from_utf8_lossy(&msg));

    stream.write_all(GREETING).await.map_err(io_err)?;
    stream.shutdown().await.map_err(io_err)?;
    Ok(Outcome::Replied(msg))
}
