//! Write-ahead log backing the local store's pre-commit durability.
//!
//! Every batch is framed and synced here before it is applied to the
//! sled-backed data trees, so a crash between the two never loses an
//! acknowledged write.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tracing::{debug, info};

use venice_common::error::{Error, Result, StorageError};

/// Write-ahead log for durability of batch commits.
pub struct WriteAheadLog {
    path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
    segment: AtomicU64,
    offset: AtomicU64,
    max_segment_size: u64,
}

impl WriteAheadLog {
    pub async fn new(path: &Path) -> Result<Self> {
        info!("initializing WAL at {:?}", path);
        tokio::fs::create_dir_all(path).await?;

        let wal = Self {
            path: path.to_path_buf(),
            writer: Mutex::new(None),
            segment: AtomicU64::new(0),
            offset: AtomicU64::new(0),
            max_segment_size: 64 * 1024 * 1024,
        };

        wal.recover().await?;
        wal.open_new_segment().await?;
        Ok(wal)
    }

    async fn recover(&self) -> Result<()> {
        let mut max_segment = 0u64;
        let mut entries = tokio::fs::read_dir(&self.path).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(segment) = name.trim_end_matches(".wal").parse::<u64>() {
                    max_segment = max_segment.max(segment);
                }
            }
        }
        self.segment.store(max_segment + 1, Ordering::SeqCst);
        info!("WAL recovered, starting from segment {}", max_segment + 1);
        Ok(())
    }

    async fn open_new_segment(&self) -> Result<()> {
        let segment = self.segment.load(Ordering::SeqCst);
        let path = self.path.join(format!("{:020}.wal", segment));
        debug!("opening new WAL segment: {:?}", path);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        *self.writer.lock().await = Some(BufWriter::new(file));
        self.offset.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Append a framed `len(4) | crc(4) | data` entry and return its
    /// offset within the current segment. Does not sync; call `sync`
    /// once the caller is ready to acknowledge durability.
    pub async fn append(&self, data: &[u8]) -> Result<u64> {
        let entry_size = (data.len() + 8) as u64;
        let current_offset = self.offset.load(Ordering::SeqCst);
        if current_offset + entry_size > self.max_segment_size {
            self.rotate().await?;
        }

        let len = data.len() as u32;
        let crc = crc32fast::hash(data);

        let mut writer_guard = self.writer.lock().await;
        let writer = writer_guard.as_mut().ok_or_else(|| {
            Error::Storage(StorageError::WalError("WAL not initialized".to_string()))
        })?;

        writer.write_all(&len.to_le_bytes()).await?;
        writer.write_all(&crc.to_le_bytes()).await?;
        writer.write_all(data).await?;

        let offset = self.offset.fetch_add(entry_size, Ordering::SeqCst);
        Ok(offset)
    }

    pub async fn sync(&self) -> Result<()> {
        let mut writer_guard = self.writer.lock().await;
        if let Some(ref mut writer) = *writer_guard {
            writer.flush().await?;
            writer.get_ref().sync_all().await?;
        }
        Ok(())
    }

    async fn rotate(&self) -> Result<()> {
        self.sync().await?;
        self.segment.fetch_add(1, Ordering::SeqCst);
        self.open_new_segment().await?;
        Ok(())
    }

    pub fn current_segment(&self) -> u64 {
        self.segment.load(Ordering::SeqCst)
    }
}
