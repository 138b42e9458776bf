//! The data channel: a second TCP socket opened per command, relaying raw
//! SASL-wrapped bytes between the peer and whatever local stdio the command
//! driver hands it (a child process's stdio pipes on the server, the
//! terminal/pipe on the client).
//!
//! A read/write-half split pump, generalized to a byte-oriented relay since
//! the data channel carries command stdout/stdin rather than line-framed
//! text.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::error::ArcError;
use crate::sasl;

/// Fixed relay chunk size.
pub const CHUNK_SIZE: usize = 16 * 1024;

pub struct DataChannel {
    socket: TcpStream,
}

impl DataChannel {
    /// Server side of `CMDPASV`: binds an ephemeral port and returns it
    /// alongside a future that completes once the client connects.
    pub async fn listen() -> Result<(TcpListener, u16), ArcError> {
        let listener = TcpListener::bind(("0.0.0.0", 0))
            .await
            .map_err(|e| ArcError::Bind("data channel".into(), e))?;
        let port = listener
            .local_addr()
            .map_err(|e| ArcError::Bind("data channel".into(), e))?
            .port();
        Ok((listener, port))
    }

    pub async fn accept(listener: TcpListener) -> Result<Self, ArcError> {
        let (socket, _) = listener
            .accept()
            .await
            .map_err(|e| ArcError::Protocol(format!("data channel accept failed: {e}")))?;
        Ok(Self { socket })
    }

    /// Client side of `CMDPORT`: connects out to the server-advertised
    /// port on the same host as the control channel.
    pub async fn connect(host: &str, port: u16) -> Result<Self, ArcError> {
        let socket = TcpStream::connect((host, port))
            .await
            .map_err(|e| ArcError::Protocol(format!("data channel connect failed: {e}")))?;
        Ok(Self { socket })
    }

    /// Relays bytes bidirectionally between this data channel and
    /// `local` (a child's stdio, or the process's own stdin/stdout) until
    /// either side reaches EOF, unwrapping/wrapping each chunk through the
    /// negotiated SASL layer -- the data channel must not carry plaintext
    /// once authentication has completed.
    ///
    /// Returns once both directions have drained.
    pub async fn relay<L>(mut self, local: L) -> Result<(), ArcError>
    where
        L: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut peer_rd, mut peer_wr) = self.socket.split();
        let (mut local_rd, mut local_wr) = tokio::io::split(local);

        let peer_to_local = async {
            let mut buf = [0u8; CHUNK_SIZE];
            loop {
                let n = peer_rd
                    .read(&mut buf)
                    .await
                    .map_err(|e| ArcError::Protocol(format!("data channel read failed: {e}")))?;
                if n == 0 {
                    break;
                }
                let plain = sasl::unwrap(&buf[..n]);
                local_wr
                    .write_all(&plain)
                    .await
                    .map_err(|e| ArcError::Protocol(format!("local write failed: {e}")))?;
            }
            local_wr
                .shutdown()
                .await
                .map_err(|e| ArcError::Protocol(format!("local shutdown failed: {e}")))?;
            Ok::<(), ArcError>(())
        };

        let local_to_peer = async {
            let mut buf = [0u8; CHUNK_SIZE];
            loop {
                let n = local_rd
                    .read(&mut buf)
                    .await
                    .map_err(|e| ArcError::Protocol(format!("local read failed: {e}")))?;
                if n == 0 {
                    break;
                }
                let wrapped = sasl::wrap(&buf[..n]);
                peer_wr
                    .write_all(&wrapped)
                    .await
                    .map_err(|e| ArcError::Protocol(format!("data channel write failed: {e}")))?;
            }
            peer_wr
                .shutdown()
                .await
                .map_err(|e| ArcError::Protocol(format!("data channel shutdown failed: {e}")))?;
            Ok::<(), ArcError>(())
        };

        let (a, b) = tokio::join!(peer_to_local, local_to_peer);
        a?;
        b?;
        Ok(())
    }

    /// Same relay as `relay`, but for a child process's already-split
    /// stdin/stdout pipes rather than a single combined `AsyncRead +
    /// AsyncWrite` handle: the server side relays against a spawned
    /// command's stdio, not its own.
    pub async fn relay_child<R, W>(mut self, mut child_stdout: R, mut child_stdin: W) -> Result<(), ArcError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (mut peer_rd, mut peer_wr) = self.socket.split();

        let peer_to_child = async {
            let mut buf = [0u8; CHUNK_SIZE];
            loop {
                let n = peer_rd
                    .read(&mut buf)
                    .await
                    .map_err(|e| ArcError::Protocol(format!("data channel read failed: {e}")))?;
                if n == 0 {
                    break;
                }
                let plain = sasl::unwrap(&buf[..n]);
                child_stdin
                    .write_all(&plain)
                    .await
                    .map_err(|e| ArcError::Protocol(format!("child stdin write failed: {e}")))?;
            }
            child_stdin
                .shutdown()
                .await
                .map_err(|e| ArcError::Protocol(format!("child stdin shutdown failed: {e}")))?;
            Ok::<(), ArcError>(())
        };

        let child_to_peer = async {
            let mut buf = [0u8; CHUNK_SIZE];
            loop {
                let n = child_stdout
                    .read(&mut buf)
                    .await
                    .map_err(|e| ArcError::Protocol(format!("child stdout read failed: {e}")))?;
                if n == 0 {
                    break;
                }
                let wrapped = sasl::wrap(&buf[..n]);
                peer_wr
                    .write_all(&wrapped)
                    .await
                    .map_err(|e| ArcError::Protocol(format!("data channel write failed: {e}")))?;
            }
            peer_wr
                .shutdown()
                .await
                .map_err(|e| ArcError::Protocol(format!("data channel shutdown failed: {e}")))?;
            Ok::<(), ArcError>(())
        };

        let (a, b) = tokio::join!(peer_to_child, child_to_peer);
        a?;
        b?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn relays_bytes_both_directions() {
        let (listener, port) = DataChannel::listen().await.unwrap();

        let server_task = tokio::spawn(async move {
            let channel = DataChannel::accept(listener).await.unwrap();
            let (local, mut test_end) = duplex(1024);
            let relay = tokio::spawn(channel.relay(local));
            test_end.write_all(b"from local").await.unwrap();
            let mut out = [0u8; 32];
            let n = test_end.read(&mut out).await.unwrap();
            drop(test_end);
            relay.await.unwrap().unwrap();
            out[..n].to_vec()
        });

        let mut client = DataChannel::connect("127.0.0.1", port).await.unwrap();
        let mut buf = [0u8; 32];
        let n = client.socket.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"from local");
        client.socket.write_all(b"from peer").await.unwrap();
        client.socket.shutdown().await.unwrap();

        let echoed = server_task.await.unwrap();
        assert_eq!(&echoed, b"from peer");
    }
}
