use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use canvas_core::CanvasState;
use tokio::fs;

use crate::archive::{ArchiveBackend, ArchiveError, ArchiveMeta, ArchiveRecord};

const NAME: &str = "file";

/// One `{id}.json` file per archive in a local directory. Last resort when nothing
/// durable is configured.
pub struct FileArchiveBackend {
    dir: PathBuf,
}

impl FileArchiveBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, ArchiveError> {
        // Ids become file names, so only accept the generated form.
        let meta = ArchiveMeta::from_id(id)
            .ok_or_else(|| ArchiveError::backend(NAME, format!("invalid archive id {id:?}")))?;
        Ok(self.dir.join(format!("{}.json", meta.id)))
    }
}

#[async_trait]
impl ArchiveBackend for FileArchiveBackend {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn put(&self, meta: &ArchiveMeta, state: &CanvasState) -> Result<(), ArchiveError> {
        let path = self.path_for(&meta.id)?;
        let body = serde_json::to_vec(&ArchiveRecord::new(meta, state))
            .map_err(|e| ArchiveError::backend(NAME, e))?;
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| ArchiveError::backend(NAME, e))?;
        // Write next to the target and rename so readers never see a partial file.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, body)
            .await
            .map_err(|e| ArchiveError::backend(NAME, e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| ArchiveError::backend(NAME, e))
    }

    async fn get(&self, id: &str) -> Result<Option<CanvasState>, ArchiveError> {
        let path = self.path_for(id)?;
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(ArchiveError::backend(NAME, err)),
        };
        let record: ArchiveRecord =
            serde_json::from_slice(&raw).map_err(|e| ArchiveError::backend(NAME, e))?;
        Ok(Some(record.into_state()))
    }

    async fn list(&self) -> Result<Vec<ArchiveMeta>, ArchiveError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(ArchiveError::backend(NAME, err)),
        };
        let mut listing = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ArchiveError::backend(NAME, e))?
        {
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if let Some(meta) = ArchiveMeta::from_id(id) {
                listing.push(meta);
            }
        }
        listing.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(listing)
    }
}
