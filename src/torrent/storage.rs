use crate::torrent::TorrentFile;
use log::trace;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};

/// The filesystem backed payload storage of a single torrent.
/// It maps global payload byte offsets onto the torrent's file list.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dest: PathBuf,
}

impl FileStorage {
    /// Create a new file storage rooted at the given destination directory.
    /// The destination directory is created when it doesn't exist yet.
    pub fn new<P: AsRef<Path>>(dest: P) -> io::Result<Self> {
        let dest = dest.as_ref().to_path_buf();
        std::fs::create_dir_all(&dest)?;
        Ok(Self { dest })
    }

    /// Get the destination directory of the storage.
    pub fn dest(&self) -> &Path {
        &self.dest
    }

    /// Write the given data at the global payload offset, spanning files where needed.
    pub async fn write(
        &self,
        files: &[TorrentFile],
        offset: u64,
        data: &[u8],
    ) -> io::Result<()> {
        let end = offset + data.len() as u64;

        for file in files {
            let file_end = file.offset + file.length;
            if file_end <= offset || file.offset >= end {
                continue;
            }

            let write_begin = offset.max(file.offset);
            let write_end = end.min(file_end);
            let data_begin = (write_begin - offset) as usize;
            let data_end = (write_end - offset) as usize;

            self.write_file(
                &file.path,
                write_begin - file.offset,
                &data[data_begin..data_end],
            )
            .await?;
        }

        Ok(())
    }

    async fn write_file(&self, path: &str, offset: u64, data: &[u8]) -> io::Result<()> {
        let path = self.dest.join(path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        trace!("Writing {} bytes at offset {} to {:?}", data.len(), offset, path);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;

        Ok(())
    }
}
