//! TCP links: frames are bincode-encoded and prefixed with a big-endian u32 length

use super::abstraction::{Link, LinkAcceptor, LinkKind, TransportError};
use super::frame::{Frame, MAX_FRAME_LEN};
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Read one length-prefixed frame
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, TransportError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await? as usize;
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(TransportError::Frame(format!("Invalid frame length {}", len)));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Frame::from_bytes(&buf)?)
}

/// Write one length-prefixed frame
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let payload = frame.to_bytes()?;
    write_payload(writer, &payload).await
}

async fn write_payload<W>(writer: &mut W, payload: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Turn a connected stream into a link, spawning its reader and writer tasks
pub fn spawn_link(stream: TcpStream) -> Link {
    let remote = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let _ = stream.set_nodelay(true);
    let (mut read_half, mut write_half) = stream.into_split();

    let (inbound_tx, inbound) = mpsc::unbounded_channel();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();

    let reader_remote = remote.clone();
    tokio::spawn(async move {
        loop {
            match read_frame(&mut read_half).await {
                Ok(frame) => {
                    if inbound_tx.send(frame).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("tcp link {} read ended: {}", reader_remote, e);
                    break;
                }
            }
        }
    });

    tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let last = matches!(frame, Frame::Disconnect { .. });
            // An unencodable frame costs only itself, never the link
            let payload = match frame.to_bytes() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("tcp link {} dropping {} frame: {}", remote, frame.frame_type(), e);
                    continue;
                }
            };
            if let Err(e) = write_payload(&mut write_half, &payload).await {
                debug!("tcp link {} write failed: {}", remote, e);
                break;
            }
            if last {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    Link {
        kind: LinkKind::Tcp,
        outbound,
        inbound,
    }
}

/// Dial a relay. Accepts `host:port` or `tcp://host:port`.
pub async fn connect(address: &str) -> Result<Link, TransportError> {
    let dial_addr = address.strip_prefix("tcp://").unwrap_or(address);
    let stream = TcpStream::connect(dial_addr)
        .await
        .map_err(|e| TransportError::Io(format!("connect {}: {}", dial_addr, e)))?;
    Ok(spawn_link(stream))
}

/// Accepts TCP links for a relay
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    pub async fn bind(address: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }
}

#[async_trait]
impl LinkAcceptor for TcpAcceptor {
    async fn accept(&mut self) -> Option<Result<Link, TransportError>> {
        match self.listener.accept().await {
            Ok((stream, addr)) => {
                debug!("accepted tcp connection from {}", addr);
                Some(Ok(spawn_link(stream)))
            }
            Err(e) => {
                warn!("tcp accept error: {}", e);
                Some(Err(e.into()))
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::frame::{AddressEncoding, PROTOCOL_VERSION};
    use crate::transport::value::Value;

    #[tokio::test]
    async fn test_frame_codec_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let frame = Frame::Event {
            event: "e".to_string(),
            args: vec![Value::Bytes(vec![7; 100])],
            ack: None,
        };
        write_frame(&mut a, &frame).await.unwrap();
        assert_eq!(read_frame(&mut b).await.unwrap(), frame);
    }

    #[tokio::test]
    async fn test_rejects_oversized_length() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32((MAX_FRAME_LEN + 1) as u32).await.unwrap();
        assert!(matches!(
            read_frame(&mut b).await,
            Err(TransportError::Frame(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_does_not_kill_link() {
        let mut acceptor = TcpAcceptor::bind("127.0.0.1:0").await.unwrap();
        let addr = acceptor.local_addr().unwrap();

        let client = connect(&format!("tcp://{}", addr)).await.unwrap();
        let mut server = acceptor.accept().await.unwrap().unwrap();

        client
            .send_frame(Frame::Event {
                event: "big".to_string(),
                args: vec![Value::Bytes(vec![0; MAX_FRAME_LEN])],
                ack: None,
            })
            .unwrap();
        client
            .send_frame(Frame::Event {
                event: "small".to_string(),
                args: vec![],
                ack: None,
            })
            .unwrap();

        match server.recv_frame().await.unwrap() {
            Frame::Event { event, .. } => assert_eq!(event, "small"),
            other => panic!("Wrong frame type: {}", other.frame_type()),
        }
    }

    #[tokio::test]
    async fn test_tcp_link_round_trip() {
        let mut acceptor = TcpAcceptor::bind("127.0.0.1:0").await.unwrap();
        let addr = acceptor.local_addr().unwrap();

        let client = connect(&format!("tcp://{}", addr)).await.unwrap();
        let mut server = acceptor.accept().await.unwrap().unwrap();

        client
            .send_frame(Frame::Hello {
                version: PROTOCOL_VERSION,
                peer_id: "alice".to_string(),
                encoding: AddressEncoding::LeadingArg,
            })
            .unwrap();

        match server.recv_frame().await.unwrap() {
            Frame::Hello { peer_id, .. } => assert_eq!(peer_id, "alice"),
            other => panic!("Wrong frame type: {}", other.frame_type()),
        }
    }
}
