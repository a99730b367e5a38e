use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::info;
use wayfare_core::{CoreError, CoreResult, TxnJournal};
use wayfare_shared::models::{JournalRecord, JOURNAL_VERSION};

/// Journal kept as one JSON document, replaced atomically on every save.
pub struct FileJournal {
    path: PathBuf,
    // Serializes writers so a slower save never overwrites a newer one
    write_lock: Mutex<()>,
}

impl FileJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl TxnJournal for FileJournal {
    async fn load(&self) -> CoreResult<Option<JournalRecord>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("No journal at {}. Starting empty", self.path.display());
                return Ok(None);
            }
            Err(e) => return Err(CoreError::Journal(format!("reading {}: {}", self.path.display(), e))),
        };

        let record: JournalRecord = serde_json::from_slice(&bytes)
            .map_err(|e| CoreError::Journal(format!("parsing {}: {}", self.path.display(), e)))?;

        if record.version > JOURNAL_VERSION {
            return Err(CoreError::Journal(format!(
                "journal version {} is newer than supported version {}",
                record.version, JOURNAL_VERSION
            )));
        }

        info!(
            "Journal {} loaded: next id {}, {} live transactions",
            self.path.display(),
            record.next_id,
            record.transactions.len()
        );
        Ok(Some(record))
    }

    async fn save(&self, record: &JournalRecord) -> CoreResult<()> {
        let body = serde_json::to_vec_pretty(record)
            .map_err(|e| CoreError::Journal(format!("encoding journal: {}", e)))?;

        let _guard = self.write_lock.lock().await;
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| CoreError::Journal(format!("creating {}: {}", dir.display(), e)))?;
        }

        let tmp = self.temp_path();
        tokio::fs::write(&tmp, &body)
            .await
            .map_err(|e| CoreError::Journal(format!("writing {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| CoreError::Journal(format!("replacing {}: {}", self.path.display(), e)))?;
        Ok(())
    }
}

/// Journal that lives only as long as the process. Used in tests and when
/// durability is not wanted.
#[derive(Default)]
pub struct MemoryJournal {
    record: Mutex<Option<JournalRecord>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> Option<JournalRecord> {
        self.record.lock().await.clone()
    }
}

#[async_trait]
impl TxnJournal for MemoryJournal {
    async fn load(&self) -> CoreResult<Option<JournalRecord>> {
        Ok(self.record.lock().await.clone())
    }

    async fn save(&self, record: &JournalRecord) -> CoreResult<()> {
        *self.record.lock().await = Some(record.clone());
        Ok(())
    }
}
