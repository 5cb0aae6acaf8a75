pub mod codec;
pub mod debounce;

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::core::source::Source;
use codec::{CodecError, DocumentExtension};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("could not create {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("could not read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("could not write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("malformed document: {0}")]
    Malformed(#[from] CodecError),
}

/// File name for a source's document. Path separators in account ids are replaced.
pub fn document_file_name(source_id: &str) -> String {
    source_id
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | '\0') { '_' } else { c })
        .collect()
}

/// Write `content` to `path` atomically using a temp file + rename.
pub fn atomic_write(path: &Path, content: &[u8]) -> io::Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Where one Source lives on disk, and the extension used to read and write it.
pub struct SourceStore {
    path: PathBuf,
    extension: Box<dyn DocumentExtension>,
}

impl SourceStore {
    pub fn new(directory: &Path, source_id: &str, extension: Box<dyn DocumentExtension>) -> Self {
        Self {
            path: directory.join(document_file_name(source_id)),
            extension,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `Ok(false)` when there is no document yet. On error the Source
    /// is left exactly as it was.
    pub fn load(&self, source: &mut Source) -> Result<bool, StoreError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!("No document at {}, starting empty", self.path.display());
                return Ok(false);
            }
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        codec::load_into(source, &text, self.extension.as_ref())?;
        log::info!(
            "Loaded {} lists, {} tasks from {}",
            source.lists.len(),
            source.task_count(),
            self.path.display()
        );
        Ok(true)
    }

    pub fn save(&self, source: &Source) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|source| StoreError::CreateDir {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let json = codec::encode_string(source, self.extension.as_ref())?;
        atomic_write(&self.path, json.as_bytes()).map_err(|source| StoreError::Write {
            path: self.path.clone(),
            source,
        })?;
        log::debug!("Saved source {} to {}", source.id(), self.path.display());
        Ok(())
    }
}
