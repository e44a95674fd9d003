use thiserror::Error;

#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Malformed handshake: {0}")]
    MalformedHandshake(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Invalid piece index {index} (piece count is {piece_count})")]
    InvalidPieceIndex { index: u32, piece_count: u32 },

    #[error("Piece {index} has length {actual}, expected {expected}")]
    PieceLengthMismatch {
        index: u32,
        expected: usize,
        actual: usize,
    },

    #[error("Handshake from peer {received}, expected {expected}")]
    HandshakeIdentityMismatch { expected: String, received: u32 },

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Unexpected piece {received} (outstanding request: {outstanding:?})")]
    UnexpectedPiece {
        received: u32,
        outstanding: Option<u32>,
    },

    #[error("Connection closed by remote peer")]
    ConnectionClosed,

    #[error("Piece {0} is not held locally")]
    PieceNotHeld(u32),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Local piece store fault: {0}")]
    Store(Box<PeerError>),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl PeerError {
    /// Mark an error raised by the local piece store
    pub fn store(err: PeerError) -> Self {
        match err {
            PeerError::Store(_) => err,
            other => PeerError::Store(Box::new(other)),
        }
    }

    /// Whether this error must take the whole process down rather than just
    /// the neighbor session that raised it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PeerError::Store(_))
    }
}

pub type Result<T> = std::result::Result<T, PeerError>;
