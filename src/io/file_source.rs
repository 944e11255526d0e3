use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use super::range_source::{check_bounds, RangeSource};
use crate::error::TransportError;

/// Local file implementation of [`RangeSource`].
///
/// The file size is read once on creation. Each read opens the file again,
/// so a source can serve overlapping reads.
#[derive(Debug, Clone)]
pub struct FileRangeSource {
    path: PathBuf,
    size: u64,
    identifier: String,
}

impl FileRangeSource {
    /// Open `path`. Returns `NotFound` if it does not exist.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, TransportError> {
        let path = path.as_ref().to_path_buf();
        let identifier = format!("file://{}", path.display());

        let metadata = tokio::fs::metadata(&path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => TransportError::NotFound(identifier.clone()),
            _ => TransportError::Read(e.to_string()),
        })?;

        if !metadata.is_file() {
            return Err(TransportError::Read(format!("{} is not a file", identifier)));
        }

        Ok(Self {
            path,
            size: metadata.len(),
            identifier,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RangeSource for FileRangeSource {
    async fn read_range(&self, offset: u64, len: usize) -> Result<Bytes, TransportError> {
        check_bounds(offset, len, self.size)?;

        if len == 0 {
            return Ok(Bytes::new());
        }

        let mut file = File::open(&self.path)
            .await
            .map_err(|e| TransportError::Read(e.to_string()))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| TransportError::Read(e.to_string()))?;

        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)
            .await
            .map_err(|e| TransportError::Read(e.to_string()))?;

        Ok(Bytes::from(buf))
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }
}
