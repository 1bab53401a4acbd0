//! TCP front end of the status board
//!
//! Clients connect, send one message, close their write side and read the
//! reply (if the command has one). Every connection runs on its own task;
//! reading is bounded in both time and size so a slow or misbehaving client
//! never holds up the board.

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info, instrument, warn};

use crate::config::ServerConfig;
use crate::error::{BoardError, BoardResult};

use super::actor::BoardHandle;

const READ_CHUNK: usize = 16 * 1024;

/// Read a whole message up to end of input.
///
/// Fails with [`BoardError::Oversized`] once more than `limit` bytes
/// arrived and with a timed out I/O error when the client takes longer
/// than `timeout` in total.
pub async fn read_request<R>(reader: &mut R, limit: usize, timeout: Duration) -> BoardResult<String>
where
    R: AsyncRead + Unpin,
{
    let read_all = async {
        let mut buf = Vec::new();
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                return Ok(buf);
            }
            if buf.len() + n > limit {
                return Err(BoardError::Oversized { limit });
            }
            buf.extend_from_slice(&chunk[..n]);
        }
    };
    let buf = tokio::time::timeout(timeout, read_all)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "client too slow"))??;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Handle one client connection from start to finish.
pub async fn serve_connection<S>(
    mut stream: S,
    sender: IpAddr,
    board: &BoardHandle,
    config: &ServerConfig,
) -> BoardResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let timeout = Duration::from_secs(config.connection_timeout_secs);
    let text = match read_request(&mut stream, config.max_message_size, timeout).await {
        Ok(text) => text,
        Err(e) => {
            board.rejected().await;
            return Err(e);
        }
    };
    if text.trim().is_empty() {
        return Ok(());
    }
    if let Some(reply) = board.submit(text, sender).await? {
        stream.write_all(reply.as_bytes()).await?;
    }
    stream.shutdown().await?;
    Ok(())
}

pub struct Server {
    listener: TcpListener,
    board: BoardHandle,
    config: ServerConfig,
}

impl Server {
    pub async fn bind(addr: SocketAddr, board: BoardHandle, config: ServerConfig) -> BoardResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            board,
            config,
        })
    }

    pub fn local_addr(&self) -> BoardResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `stop` completes.
    #[instrument(skip_all, fields(addr = ?self.listener.local_addr().ok()))]
    pub async fn run(self, stop: impl Future<Output = ()>) {
        info!("accepting connections");
        tokio::pin!(stop);
        loop {
            tokio::select! {
                accept = self.listener.accept() => {
                    let (stream, peer) = match accept {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("accept failed: {e}");
                            continue;
                        }
                    };
                    let board = self.board.clone();
                    let config = self.config.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, peer.ip(), &board, &config).await {
                            warn!(%peer, "connection dropped: {e}");
                        }
                    });
                }
                _ = &mut stop => break,
            }
        }
        debug!("listener closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;
    use crate::daemon::actor::BoardActor;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;
    use tokio::net::TcpStream;
    use tokio_test::io::Builder;

    const AGENT: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5));

    fn board() -> BoardHandle {
        let config: DaemonConfig = serde_json::from_str("{}").unwrap();
        BoardHandle::spawn(BoardActor::new(config))
    }

    #[tokio::test]
    async fn test_read_request_joins_chunks() {
        let mut mock = Builder::new()
            .read(b"status web1.http ")
            .read(b"green all fine")
            .build();
        let text = read_request(&mut mock, 1024, Duration::from_secs(5)).await.unwrap();
        assert_eq!(text, "status web1.http green all fine");
    }

    #[tokio::test]
    async fn test_read_request_size_limit() {
        let mut mock = Builder::new().read(b"status web1.http red way too long").build();
        assert_matches!(
            read_request(&mut mock, 8, Duration::from_secs(5)).await,
            Err(BoardError::Oversized { limit: 8 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_request_timeout() {
        let mut mock = Builder::new()
            .read(b"status web1")
            .wait(Duration::from_secs(60))
            .build();
        let result = read_request(&mut mock, 1024, Duration::from_secs(30)).await;
        assert_matches!(result, Err(BoardError::Io(e)) if e.kind() == io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_connection_reply() {
        let board = board();
        let config = ServerConfig::default();
        let (mut client, server_side) = tokio::io::duplex(1024);
        client.write_all(b"ping").await.unwrap();
        client.shutdown().await.unwrap();

        serve_connection(server_side, AGENT, &board, &config).await.unwrap();
        let mut reply = String::new();
        client.read_to_string(&mut reply).await.unwrap();
        assert_eq!(reply, format!("boardwatchd {}\n", env!("CARGO_PKG_VERSION")));
        board.shutdown().await;
    }

    #[tokio::test]
    async fn test_over_tcp() {
        let board = board();
        let server = Server::bind(
            SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            board.clone(),
            ServerConfig::default(),
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(server.run(async move {
            let _ = stop_rx.await;
        }));

        let send = |text: &'static str| async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(text.as_bytes()).await.unwrap();
            stream.shutdown().await.unwrap();
            let mut reply = String::new();
            stream.read_to_string(&mut reply).await.unwrap();
            reply
        };

        assert_eq!(send("status web1.disk yellow 91% full").await, "");
        assert_eq!(send("query web1.disk").await, "yellow 91% full");

        let _ = stop_tx.send(());
        server.await.unwrap();
        board.shutdown().await;
    }
}
