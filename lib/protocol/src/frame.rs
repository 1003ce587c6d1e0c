use crate::codec::Codec;
use crate::message::{MessageKind, RpcMessage};
use bytes::{BufMut, BytesMut};
use common::{ErrorKind, TxError, TxResult};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{error, trace};

pub struct FrameCodec;

impl FrameCodec {
    pub const MAGIC: u16 = 0xCAFE;
    pub const VERSION: u8 = 1;
    pub const HEADER_LENGTH: usize = 12;
    /// Upper bound for a body; anything larger is a framing violation.
    pub const MAX_BODY_LENGTH: u32 = 4 * 1024 * 1024;

    /// Serializes a message into one frame.
    pub fn encode(message: &RpcMessage, codec: &dyn Codec) -> TxResult<BytesMut> {
        let body = codec.encode(message.payload())?;
        let mut buffer = BytesMut::with_capacity(Self::HEADER_LENGTH + body.len());

        buffer.put_u16(Self::MAGIC);
        buffer.put_u8(Self::VERSION);
        buffer.put_u8(message.kind().to_u8());
        buffer.put_u32(*message.id());
        buffer.put_u32(body.len() as u32);
        buffer.extend_from_slice(&body);

        Ok(buffer)
    }

    /// Reads one frame from the stream. `Ok(None)` means the peer closed the
    /// connection cleanly between frames; a header violation is a
    /// `Wire` error and the caller must drop the connection.
    pub async fn read<R: AsyncReadExt + Unpin>(
        stream: &mut R,
        codec: &dyn Codec,
    ) -> TxResult<Option<RpcMessage>> {
        let mut header = [0_u8; Self::HEADER_LENGTH];
        if stream.read_exact(&mut header).await.is_err() {
            return Ok(None); // Connection closed between frames
        }

        let magic = u16::from_be_bytes([header[0], header[1]]);
        if magic != Self::MAGIC {
            error!("Bad magic 0x{:04X}. Closing connection.", magic);
            return Err(TxError::new(ErrorKind::Wire, format!("bad magic 0x{:04X}", magic)));
        }

        let version = header[2];
        if version > Self::VERSION {
            error!("Unsupported protocol version {}. Closing connection.", version);
            return Err(TxError::new(
                ErrorKind::Wire,
                format!("unsupported version {}", version),
            ));
        }

        let kind = MessageKind::from_u8(header[3]).ok_or_else(|| {
            TxError::new(ErrorKind::Wire, format!("unknown message type {}", header[3]))
        })?;
        let id = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        let body_length = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);

        trace!(
            "Received frame: `{}` #{} ({} body bytes)",
            kind,
            id,
            body_length
        );

        if body_length > Self::MAX_BODY_LENGTH {
            error!("Invalid body length: {}. Closing connection.", body_length);
            return Err(TxError::new(
                ErrorKind::Wire,
                format!("body length {} exceeds limit", body_length),
            ));
        }

        let mut body = vec![0_u8; body_length as usize];
        if body_length > 0 {
            stream
                .read_exact(&mut body)
                .await
                .map_err(|e| TxError::new(ErrorKind::Network, e.to_string()))?;
        }

        let payload = codec.decode(kind, &body)?;
        Ok(Some(RpcMessage::new(id, payload)))
    }

    /// Serializes and writes one frame.
    pub async fn write<W: AsyncWriteExt + Unpin>(
        stream: &mut W,
        message: &RpcMessage,
        codec: &dyn Codec,
    ) -> TxResult<()> {
        let buffer = Self::encode(message, codec)?;

        trace!(
            "Sending frame: {} ({} bytes) over the wire.",
            message,
            buffer.len()
        );

        stream
            .write_all(&buffer)
            .await
            .map_err(|e| TxError::new(ErrorKind::Network, e.to_string()))?;
        Ok(())
    }
}
