use crate::error::Result;
use crate::peer::PeerId;
use std::path::{Path, PathBuf};
use time::macros::format_description;
use time::OffsetDateTime;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Append-only protocol event log, `log_peer_<id>.log`.
///
/// Every line is `[YYYY-MM-DD HH:MM:SS]: <event>`. Failing to write a line
/// is reported through `tracing` and otherwise ignored.
#[derive(Debug)]
pub struct EventLog {
    peer_id: PeerId,
    path: PathBuf,
    file: Mutex<File>,
}

impl EventLog {
    pub async fn open<P: AsRef<Path>>(dir: P, peer_id: PeerId) -> Result<Self> {
        let path = dir.as_ref().join(format!("log_peer_{}.log", peer_id));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            peer_id,
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one timestamped event
    pub async fn write(&self, text: impl AsRef<str>) {
        let text = text.as_ref();
        info!(target: "event", peer = self.peer_id, "{}", text);

        let line = format!("[{}]: {}\n", timestamp(), text);
        let mut file = self.file.lock().await;
        let written = match file.write_all(line.as_bytes()).await {
            Ok(()) => file.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            warn!("Failed to write event log {}: {}", self.path.display(), e);
        }
    }
}

fn timestamp() -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    now.format(format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second]"
    ))
    .unwrap_or_default()
}

/// Render a set of peer ids as `a, b, c`
pub fn id_list(ids: &[PeerId]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_appends_timestamped_lines() {
        let dir = tempfile::TempDir::new().unwrap();
        let log = EventLog::open(dir.path(), 1001).await.unwrap();

        log.write("Peer 1001 started.").await;
        log.write(format!("Peer {} has downloaded the complete file.", 1001))
            .await;

        let text = std::fs::read_to_string(dir.path().join("log_peer_1001.log")).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        for line in &lines {
            // [YYYY-MM-DD HH:MM:SS]: ...
            assert_eq!(&line[0..1], "[");
            assert_eq!(&line[20..23], "]: ");
            assert_eq!(&line[5..6], "-");
            assert_eq!(&line[14..15], ":");
        }
        assert!(lines[0].ends_with("Peer 1001 started."));
        assert!(lines[1].ends_with("has downloaded the complete file."));
    }

    #[tokio::test]
    async fn test_reopen_appends() {
        let dir = tempfile::TempDir::new().unwrap();
        EventLog::open(dir.path(), 7).await.unwrap().write("one").await;
        EventLog::open(dir.path(), 7).await.unwrap().write("two").await;

        let text = std::fs::read_to_string(dir.path().join("log_peer_7.log")).unwrap();
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn test_id_list() {
        assert_eq!(id_list(&[1002, 1005]), "1002, 1005");
        assert_eq!(id_list(&[]), "");
    }
}
