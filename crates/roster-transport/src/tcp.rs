use std::io;
use std::net::SocketAddr;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use roster_codec::{decode_cbor, encode_cbor, CodecError, MAX_FRAME_LEN};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::debug;

use crate::connection::{ConnectionSender, MessageConnection};
use crate::error::TransportError;

const QUEUE_DEPTH: usize = 128;

/// 4-byte big-endian length prefix, bounded by [`MAX_FRAME_LEN`].
fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// Opens a TCP connection carrying length-prefixed CBOR messages.
pub async fn connect<T>(addr: &str) -> Result<MessageConnection<T>, TransportError>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(wrap(stream, addr.to_string()))
}

/// Listening socket producing one [`MessageConnection`] per accepted peer.
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        Ok(Self {
            listener: TcpListener::bind(addr).await?,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn accept<T>(&self) -> Result<MessageConnection<T>, TransportError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let (stream, addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        debug!(%addr, "accepted connection");
        Ok(wrap(stream, addr.to_string()))
    }
}

/// Bridges a socket to a connection with one reader and one writer task.
fn wrap<T>(stream: TcpStream, peer: String) -> MessageConnection<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    let (read, write) = stream.into_split();
    let (out_tx, out_rx) = mpsc::channel(QUEUE_DEPTH);
    let (in_tx, in_rx) = mpsc::channel(QUEUE_DEPTH);
    tokio::spawn(write_loop(write, out_rx, peer.clone()));
    tokio::spawn(read_loop(read, in_tx, peer.clone()));
    MessageConnection::new(peer, ConnectionSender::new(out_tx), in_rx)
}

async fn write_loop<T: Serialize>(
    write: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Result<T, TransportError>>,
    peer: String,
) {
    let mut sink = FramedWrite::new(write, frame_codec());
    while let Some(item) = rx.recv().await {
        let Ok(message) = item else {
            break;
        };
        let body = match encode_frame(&message) {
            Ok(body) => body,
            Err(err) => {
                debug!(%peer, error = %err, "dropping unencodable message");
                continue;
            }
        };
        if let Err(err) = sink.send(Bytes::from(body)).await {
            debug!(%peer, error = %err, "write failed");
            break;
        }
    }
    let _ = SinkExt::<Bytes>::close(&mut sink).await;
}

fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>, CodecError> {
    let body = encode_cbor(message)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge {
            size: body.len(),
            max: MAX_FRAME_LEN,
        });
    }
    Ok(body)
}

async fn read_loop<T: DeserializeOwned>(
    read: OwnedReadHalf,
    tx: mpsc::Sender<Result<T, TransportError>>,
    peer: String,
) {
    let mut frames = FramedRead::new(read, frame_codec());
    while let Some(next) = frames.next().await {
        let item = match next {
            Ok(bytes) => decode_cbor(&bytes).map_err(TransportError::from),
            Err(err) => Err(read_error(err)),
        };
        let failed = item.is_err();
        if tx.send(item).await.is_err() || failed {
            break;
        }
    }
    debug!(%peer, "reader finished");
}

/// The codec reports oversized or malformed frames as `InvalidData`.
fn read_error(err: io::Error) -> TransportError {
    if err.kind() == io::ErrorKind::InvalidData {
        CodecError::Decode(err.to_string()).into()
    } else {
        err.into()
    }
}
