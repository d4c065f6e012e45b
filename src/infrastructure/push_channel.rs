// Push channel transport - newline-delimited JSON over TCP
use crate::domain::error::ChannelError;
use futures::StreamExt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

const LINE_BUFFER: usize = 64;

/// Longest accepted line in bytes, newline excluded.
const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Connect to `address` (`host:port`) and forward every non-empty line.
///
/// The receiver yields raw lines; parsing is the consumer's job. It closes
/// when the peer disconnects, a read fails, a line exceeds
/// [`MAX_LINE_LENGTH`], or `cancel` fires.
pub async fn connect(
    address: &str,
    timeout: Duration,
    cancel: CancellationToken,
) -> Result<mpsc::Receiver<String>, ChannelError> {
    tracing::info!(address = %address, "Connecting to push channel");

    let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
        .await
        .map_err(|_| ChannelError::Timeout(address.to_string()))?
        .map_err(|e| ChannelError::Connect(format!("{address}: {e}")))?;

    tracing::info!(address = %address, "Push channel connected");

    let (tx, rx) = mpsc::channel(LINE_BUFFER);
    let address = address.to_string();
    tokio::spawn(async move {
        let mut lines = FramedRead::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(address = %address, "Push channel cancelled");
                    break;
                }
                line = lines.next() => match line {
                    Some(Ok(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        if tx.send(line).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        tracing::info!(address = %address, "Push channel closed by peer");
                        break;
                    }
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        tracing::warn!(address = %address, limit = MAX_LINE_LENGTH, "Push line too long, closing channel");
                        break;
                    }
                    Some(Err(LinesCodecError::Io(e))) => {
                        tracing::warn!(address = %address, error = %e, "Push channel read failed");
                        break;
                    }
                }
            }
        }
    });

    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_forwards_lines_until_peer_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket
                .write_all(b"{\"deviceId\":\"a\"}\n\n{\"sensors\":[]}\n")
                .await
                .unwrap();
        });

        let mut rx = connect(&address, Duration::from_secs(2), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("{\"deviceId\":\"a\"}"));
        assert_eq!(rx.recv().await.as_deref(), Some("{\"sensors\":[]}"));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_oversized_line_closes_channel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let _ = socket.write_all(b"{\"deviceId\":\"a\"}\r\n").await;
            let _ = socket.write_all(&vec![b'x'; MAX_LINE_LENGTH + 1]).await;
            let _ = socket.write_all(b"\n{\"sensors\":[]}\n").await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut rx = connect(&address, Duration::from_secs(2), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("{\"deviceId\":\"a\"}"));
        let closed = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(closed, None);
        server.abort();
    }

    #[tokio::test]
    async fn test_connect_failure() {
        // Bind then drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = connect(&address, Duration::from_secs(2), CancellationToken::new()).await;
        assert!(matches!(result, Err(ChannelError::Connect(_))));
    }

    #[tokio::test]
    async fn test_cancel_closes_receiver() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let cancel = CancellationToken::new();
        let mut rx = connect(&address, Duration::from_secs(2), cancel.clone()).await.unwrap();
        cancel.cancel();
        assert_eq!(rx.recv().await, None);
        server.abort();
    }
}
