use crate::error::{PeerError, Result};
use crate::piece::{Bitfield, PieceLayout};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};

/// The local copy of the shared file and the bitfield of pieces it holds
pub struct PieceStore {
    path: PathBuf,
    file: File,
    layout: PieceLayout,
    bitfield: Bitfield,
}

impl PieceStore {
    /// Open the store.
    ///
    /// A seeding peer opens its existing file, which must be exactly the
    /// configured size, and starts out holding every piece. Anyone else gets
    /// a fresh pre-sized file and holds nothing.
    pub async fn open<P: AsRef<Path>>(path: P, layout: PieceLayout, has_file: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let (file, bitfield) = if has_file {
            let file = OpenOptions::new().read(true).write(true).open(&path).await?;
            let len = file.metadata().await?.len();
            if len != layout.file_size() {
                return Err(PeerError::Config(format!(
                    "{} is {} bytes, expected {}",
                    path.display(),
                    len,
                    layout.file_size()
                )));
            }
            (file, Bitfield::full(layout.piece_count()))
        } else {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)
                .await?;
            file.set_len(layout.file_size()).await?;
            (file, Bitfield::new(layout.piece_count()))
        };

        info!(
            "Storage initialized: {} ({} bytes, {}/{} pieces)",
            path.display(),
            layout.file_size(),
            bitfield.count(),
            layout.piece_count()
        );

        Ok(Self {
            path,
            file,
            layout,
            bitfield,
        })
    }

    pub fn has(&self, piece_index: u32) -> bool {
        self.bitfield.has(piece_index)
    }

    pub fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }

    /// Number of pieces held
    pub fn count(&self) -> u32 {
        self.bitfield.count()
    }

    pub fn is_empty(&self) -> bool {
        self.bitfield.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.bitfield.is_complete()
    }

    /// Read a held piece from disk
    pub async fn read(&mut self, piece_index: u32) -> Result<Vec<u8>> {
        self.layout.check_index(piece_index)?;
        if !self.has(piece_index) {
            return Err(PeerError::PieceNotHeld(piece_index));
        }

        let offset = self.layout.offset(piece_index);
        let length = self.layout.piece_len(piece_index);
        self.read_at_offset(offset, length).await
    }

    /// Store a piece. Returns whether the piece was newly acquired; writing
    /// a piece already held changes nothing.
    pub async fn write(&mut self, piece_index: u32, data: &[u8]) -> Result<bool> {
        self.layout.check_index(piece_index)?;

        let expected = self.layout.piece_len(piece_index);
        if data.len() != expected {
            return Err(PeerError::PieceLengthMismatch {
                index: piece_index,
                expected,
                actual: data.len(),
            });
        }

        if self.has(piece_index) {
            debug!("Piece {} already held, ignoring write", piece_index);
            return Ok(false);
        }

        let offset = self.layout.offset(piece_index);
        self.write_at_offset(offset, data).await?;
        self.bitfield.set(piece_index);

        debug!(
            "Piece {} written to {} at offset {} ({} bytes)",
            piece_index,
            self.path.display(),
            offset,
            data.len()
        );

        Ok(true)
    }

    async fn write_at_offset(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(data).await?;
        self.file.flush().await?;
        Ok(())
    }

    async fn read_at_offset(&mut self, offset: u64, length: usize) -> Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        let mut buffer = vec![0u8; length];
        self.file.read_exact(&mut buffer).await?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn layout() -> PieceLayout {
        PieceLayout::new(10, 4)
    }

    #[tokio::test]
    async fn test_fresh_store_holds_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("peer_2").join("file.dat");
        let mut store = PieceStore::open(&path, layout(), false).await.unwrap();

        assert!(store.is_empty());
        assert!(!store.is_complete());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 10);
        assert!(matches!(store.read(0).await, Err(PeerError::PieceNotHeld(0))));
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file.dat");
        let mut store = PieceStore::open(&path, layout(), false).await.unwrap();

        assert!(store.write(2, b"ij").await.unwrap());
        assert!(store.write(0, b"abcd").await.unwrap());
        assert!(store.has(0));
        assert!(!store.has(1));
        assert!(store.has(2));
        assert_eq!(store.count(), 2);
        assert_eq!(store.read(2).await.unwrap(), b"ij");

        assert!(store.write(1, b"efgh").await.unwrap());
        assert!(store.is_complete());
        assert_eq!(std::fs::read(&path).unwrap(), b"abcdefghij");
    }

    #[tokio::test]
    async fn test_rewrite_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut store = PieceStore::open(dir.path().join("f"), layout(), false)
            .await
            .unwrap();

        assert!(store.write(1, b"efgh").await.unwrap());
        assert!(!store.write(1, b"efgh").await.unwrap());
        assert!(store.has(1));
        assert_eq!(store.count(), 1);
        assert_eq!(store.read(1).await.unwrap(), b"efgh");
    }

    #[tokio::test]
    async fn test_rejects_wrong_length() {
        let dir = TempDir::new().unwrap();
        let mut store = PieceStore::open(dir.path().join("f"), layout(), false)
            .await
            .unwrap();

        assert!(matches!(
            store.write(2, b"ijkl").await,
            Err(PeerError::PieceLengthMismatch {
                index: 2,
                expected: 2,
                actual: 4
            })
        ));
        assert!(!store.has(2));
    }

    #[tokio::test]
    async fn test_rejects_out_of_range_index() {
        let dir = TempDir::new().unwrap();
        let mut store = PieceStore::open(dir.path().join("f"), layout(), false)
            .await
            .unwrap();

        assert!(matches!(
            store.write(3, b"ab").await,
            Err(PeerError::InvalidPieceIndex { .. })
        ));
    }

    #[tokio::test]
    async fn test_seeding_store_opens_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file.dat");
        std::fs::write(&path, b"abcdefghij").unwrap();

        let mut store = PieceStore::open(&path, layout(), true).await.unwrap();
        assert!(store.is_complete());
        assert_eq!(store.read(1).await.unwrap(), b"efgh");
        assert_eq!(store.read(2).await.unwrap(), b"ij");
    }

    #[tokio::test]
    async fn test_seeding_store_checks_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file.dat");
        std::fs::write(&path, b"short").unwrap();

        assert!(matches!(
            PieceStore::open(&path, layout(), true).await,
            Err(PeerError::Config(_))
        ));
    }
}
