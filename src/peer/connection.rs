use super::{Handshake, PeerMessage, HANDSHAKE_LEN};
use crate::error::{PeerError, Result};
use crate::piece::PieceLayout;
use std::io::ErrorKind;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// A freshly opened TCP connection to a neighbor, before the handshake
pub struct PeerConnection {
    addr: SocketAddr,
    stream: TcpStream,
}

impl PeerConnection {
    /// Connect to a neighbor
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        info!("Connecting to peer: {}", addr);

        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;

        Ok(Self { addr, stream })
    }

    /// Wrap a connection accepted by the listener
    pub fn accepted(stream: TcpStream, addr: SocketAddr) -> Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self { addr, stream })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Split into a frame reader and the raw write half
    pub fn into_split(self, layout: PieceLayout) -> (FrameReader<OwnedReadHalf>, OwnedWriteHalf) {
        let (read, write) = self.stream.into_split();
        (FrameReader::new(read, layout), write)
    }
}

/// Reads handshake and message frames off a byte stream
pub struct FrameReader<R> {
    reader: R,
    layout: PieceLayout,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, layout: PieceLayout) -> Self {
        Self { reader, layout }
    }

    /// Receive and decode the 32 byte handshake
    pub async fn read_handshake(&mut self) -> Result<Handshake> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        read_exact(&mut self.reader, &mut buf).await?;
        Handshake::from_bytes(&buf)
    }

    /// Receive one length-prefixed message
    pub async fn read_message(&mut self) -> Result<PeerMessage> {
        // Read length prefix (4 bytes)
        let mut length_buf = [0u8; 4];
        read_exact(&mut self.reader, &mut length_buf).await?;

        let length = u32::from_be_bytes(length_buf) as usize;
        if length == 0 || length > self.layout.max_frame_len() {
            return Err(PeerError::MalformedMessage(format!(
                "declared frame length {} out of bounds",
                length
            )));
        }

        // Reconstruct full frame for parsing
        let mut frame = vec![0u8; 4 + length];
        frame[..4].copy_from_slice(&length_buf);
        read_exact(&mut self.reader, &mut frame[4..]).await?;

        PeerMessage::from_bytes(&frame, &self.layout)
    }
}

/// Fill `buf` completely; a stream ending early is `ConnectionClosed`
async fn read_exact<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(PeerError::ConnectionClosed),
        Err(e) => Err(e.into()),
    }
}

/// Write our handshake
pub async fn write_handshake<W: AsyncWrite + Unpin>(writer: &mut W, peer_id: u32) -> Result<()> {
    writer.write_all(&Handshake::new(peer_id).to_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Write one message frame
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &PeerMessage,
) -> Result<()> {
    writer.write_all(&message.to_bytes()).await?;
    writer.flush().await?;
    debug!("Sent message: {}", message);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    fn layout() -> PieceLayout {
        PieceLayout::new(10, 4)
    }

    #[tokio::test]
    async fn test_reads_frames_split_across_chunks() {
        let have = PeerMessage::Have { piece_index: 1 }.to_bytes();
        let mock = Builder::new()
            .read(&have[..2])
            .read(&have[2..6])
            .read(&have[6..])
            .read(&PeerMessage::Unchoke.to_bytes())
            .build();

        let mut reader = FrameReader::new(mock, layout());
        assert_eq!(
            reader.read_message().await.unwrap(),
            PeerMessage::Have { piece_index: 1 }
        );
        assert_eq!(reader.read_message().await.unwrap(), PeerMessage::Unchoke);
    }

    #[tokio::test]
    async fn test_reads_handshake() {
        let bytes = Handshake::new(1002).to_bytes();
        let mock = Builder::new().read(&bytes[..10]).read(&bytes[10..]).build();

        let mut reader = FrameReader::new(mock, layout());
        assert_eq!(reader.read_handshake().await.unwrap().peer_id, 1002);
    }

    #[tokio::test]
    async fn test_close_mid_frame_is_connection_closed() {
        let piece = PeerMessage::Piece {
            piece_index: 0,
            data: bytes::Bytes::from_static(b"abcd"),
        }
        .to_bytes();
        let mock = Builder::new().read(&piece[..7]).build();

        let mut reader = FrameReader::new(mock, layout());
        assert!(matches!(
            reader.read_message().await,
            Err(PeerError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_close_mid_handshake_is_connection_closed() {
        let bytes = Handshake::new(1).to_bytes();
        let mock = Builder::new().read(&bytes[..20]).build();

        let mut reader = FrameReader::new(mock, layout());
        assert!(matches!(
            reader.read_handshake().await,
            Err(PeerError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_rejects_oversized_frame() {
        let mock = Builder::new().read(&[0, 1, 0, 0]).build();

        let mut reader = FrameReader::new(mock, layout());
        assert!(matches!(
            reader.read_message().await,
            Err(PeerError::MalformedMessage(_))
        ));
    }

    #[tokio::test]
    async fn test_writes_frames() {
        let mut mock = Builder::new()
            .write(&Handshake::new(5).to_bytes())
            .write(&PeerMessage::Interested.to_bytes())
            .build();

        write_handshake(&mut mock, 5).await.unwrap();
        write_message(&mut mock, &PeerMessage::Interested).await.unwrap();
    }
}
