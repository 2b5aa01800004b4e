//! Framed message stream over an ordered reliable byte stream
//!
//! Works over TCP in production and `tokio::io::duplex` in tests. The
//! stream can be split so one task owns the send side while another owns
//! the receive side.

use crate::codec::{CodecError, MessageCodec};
use bytes::BytesMut;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

/// Framed stream errors
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Stream closed mid-message")]
    TruncatedMessage,
}

const READ_CHUNK: usize = 8 * 1024;

/// A framed, typed message stream
#[derive(Debug)]
pub struct FramedStream<S> {
    io: S,
    buf: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> FramedStream<S> {
    pub fn new(io: S) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Send one message, flushing the underlying stream
    pub async fn send<M: Serialize>(&mut self, msg: &M) -> Result<(), StreamError> {
        let encoded = MessageCodec::encode(msg)?;
        self.io.write_all(&encoded).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// Receive one message
    ///
    /// Returns `None` when the peer closed the stream at a message boundary.
    pub async fn recv<M: DeserializeOwned>(&mut self) -> Result<Option<M>, StreamError> {
        loop {
            if let Some(msg) = MessageCodec::decode(&mut self.buf)? {
                return Ok(Some(msg));
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.io.read(&mut chunk).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(StreamError::TruncatedMessage);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Split into independently owned send and receive halves
    pub fn split(self) -> (SendHalf<S>, RecvHalf<S>) {
        let (r, w) = tokio::io::split(self.io);
        (
            SendHalf { io: w },
            RecvHalf {
                io: r,
                buf: self.buf,
            },
        )
    }
}

/// Owned send half of a framed stream
pub struct SendHalf<S> {
    io: WriteHalf<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> SendHalf<S> {
    pub async fn send<M: Serialize>(&mut self, msg: &M) -> Result<(), StreamError> {
        let encoded = MessageCodec::encode(msg)?;
        self.io.write_all(&encoded).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// Gracefully shut down the write side
    pub async fn shutdown(&mut self) -> Result<(), StreamError> {
        self.io.shutdown().await?;
        Ok(())
    }
}

/// Owned receive half of a framed stream
pub struct RecvHalf<S> {
    io: ReadHalf<S>,
    buf: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> RecvHalf<S> {
    pub async fn recv<M: DeserializeOwned>(&mut self) -> Result<Option<M>, StreamError> {
        loop {
            if let Some(msg) = MessageCodec::decode(&mut self.buf)? {
                return Ok(Some(msg));
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.io.read(&mut chunk).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(StreamError::TruncatedMessage);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ClientMessage, Mirror, ServerMessage};

    #[tokio::test]
    async fn test_send_recv_roundtrip() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut client = FramedStream::new(a);
        let mut server = FramedStream::new(b);

        let msg = ClientMessage::CreateTunnel {
            mirrors: vec![Mirror::tcp("m1", 9000)],
        };
        client.send(&msg).await.unwrap();

        let received: Option<ClientMessage> = server.recv().await.unwrap();
        assert_eq!(received, Some(msg));
    }

    #[tokio::test]
    async fn test_recv_none_on_clean_close() {
        let (a, b) = tokio::io::duplex(1024);
        let client = FramedStream::new(a);
        let mut server = FramedStream::new(b);

        drop(client);

        let received: Option<ClientMessage> = server.recv().await.unwrap();
        assert!(received.is_none());
    }

    #[tokio::test]
    async fn test_split_halves_work_concurrently() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (mut client_tx, mut client_rx) = FramedStream::new(a).split();
        let (mut server_tx, mut server_rx) = FramedStream::new(b).split();

        let echo = tokio::spawn(async move {
            while let Some(msg) = server_rx.recv::<ClientMessage>().await.unwrap() {
                if let ClientMessage::TunnelData {
                    to_id,
                    to_remote_addr,
                    data,
                    close,
                } = msg
                {
                    server_tx
                        .send(&ServerMessage::TunnelData {
                            from_id: to_id,
                            remote_addr: to_remote_addr,
                            data,
                            close,
                        })
                        .await
                        .unwrap();
                }
            }
        });

        for i in 0..10u8 {
            client_tx
                .send(&ClientMessage::TunnelData {
                    to_id: "m1".to_string(),
                    to_remote_addr: "1.2.3.4:5".to_string(),
                    data: vec![i; 32],
                    close: false,
                })
                .await
                .unwrap();
        }

        for i in 0..10u8 {
            let msg: ServerMessage = server_loop_recv(&mut client_rx).await;
            if let ServerMessage::TunnelData { data, .. } = msg {
                assert_eq!(data, vec![i; 32]);
            } else {
                panic!("Expected TunnelData");
            }
        }

        client_tx.shutdown().await.unwrap();
        echo.await.unwrap();
    }

    async fn server_loop_recv<S: AsyncRead + AsyncWrite + Unpin + Send>(
        rx: &mut RecvHalf<S>,
    ) -> ServerMessage {
        rx.recv().await.unwrap().expect("stream closed early")
    }

    #[tokio::test]
    async fn test_large_payload_preserved() {
        let (a, b) = tokio::io::duplex(16 * 1024);
        let mut client = FramedStream::new(a);
        let mut server = FramedStream::new(b);

        let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();
        let msg = ClientMessage::TunnelData {
            to_id: "bulk".to_string(),
            to_remote_addr: "9.9.9.9:9".to_string(),
            data: payload.clone(),
            close: false,
        };

        let send = tokio::spawn(async move {
            client.send(&msg).await.unwrap();
            client
        });

        let received: Option<ClientMessage> = server.recv().await.unwrap();
        if let Some(ClientMessage::TunnelData { data, .. }) = received {
            assert_eq!(data, payload);
        } else {
            panic!("Expected TunnelData");
        }
        send.await.unwrap();
    }
}
