//! Part and final archive assembly with content hashing
//!
//! Part archives hold the converted files of one part; the final archive is
//! a flat merge of every part's entries in part order. Hashes are SHA-256
//! over the archive file bytes and serve as the resume checkpoint.

use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Archive I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Archive format error at {path}: {source}")]
    Zip {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("Archive task failed: {0}")]
    Join(String),
}

impl ArchiveError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn zip(path: &Path, source: zip::result::ZipError) -> Self {
        Self::Zip {
            path: path.to_path_buf(),
            source,
        }
    }
}

fn entry_options() -> SimpleFileOptions {
    // MP3 data does not compress; storing keeps packing cheap
    SimpleFileOptions::default().compression_method(CompressionMethod::Stored)
}

/// Entry name not yet in `taken`: `name`, then `stem (2).ext`, `stem (3).ext`, ...
fn unique_entry_name(taken: &HashSet<String>, name: &str) -> String {
    if !taken.contains(name) {
        return name.to_string();
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    };
    (2..)
        .map(|n| match ext {
            Some(ext) => format!("{} ({}).{}", stem, n, ext),
            None => format!("{} ({})", stem, n),
        })
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or_else(|| name.to_string())
}

/// Archive under construction for one part
pub struct PartArchive {
    path: PathBuf,
    writer: ZipWriter<BufWriter<File>>,
    names: HashSet<String>,
}

impl PartArchive {
    /// Create (or truncate) the archive file at `path`
    pub fn create(path: &Path) -> Result<Self, ArchiveError> {
        let file = File::create(path).map_err(|e| ArchiveError::io(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: ZipWriter::new(BufWriter::new(file)),
            names: HashSet::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Store `source` under its file name and return the entry name used
    pub fn add_file(&mut self, source: &Path) -> Result<String, ArchiveError> {
        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "item".to_string());
        let entry = unique_entry_name(&self.names, &file_name);

        let mut input = BufReader::new(File::open(source).map_err(|e| ArchiveError::io(source, e))?);
        self.writer
            .start_file(entry.as_str(), entry_options())
            .map_err(|e| ArchiveError::zip(&self.path, e))?;
        io::copy(&mut input, &mut self.writer).map_err(|e| ArchiveError::io(&self.path, e))?;

        self.names.insert(entry.clone());
        Ok(entry)
    }

    /// Write the central directory and flush to disk
    pub fn finish(self) -> Result<PathBuf, ArchiveError> {
        let path = self.path;
        let buffered = self.writer.finish().map_err(|e| ArchiveError::zip(&path, e))?;
        let file = buffered
            .into_inner()
            .map_err(|e| ArchiveError::io(&path, e.into_error()))?;
        file.sync_all().map_err(|e| ArchiveError::io(&path, e))?;
        Ok(path)
    }
}

/// Merge the entries of every part, in order, into one flat archive
///
/// Returns the number of entries written.
pub fn merge_parts(parts: &[PathBuf], dest: &Path) -> Result<usize, ArchiveError> {
    let mut merged = PartArchive::create(dest)?;

    for part in parts {
        let file = File::open(part).map_err(|e| ArchiveError::io(part, e))?;
        let mut archive = ZipArchive::new(BufReader::new(file)).map_err(|e| ArchiveError::zip(part, e))?;

        for i in 0..archive.len() {
            let mut entry = archive.by_index(i).map_err(|e| ArchiveError::zip(part, e))?;
            if entry.is_dir() {
                continue;
            }
            let name = unique_entry_name(&merged.names, entry.name());
            merged
                .writer
                .start_file(name.as_str(), entry_options())
                .map_err(|e| ArchiveError::zip(dest, e))?;
            io::copy(&mut entry, &mut merged.writer).map_err(|e| ArchiveError::io(dest, e))?;
            merged.names.insert(name);
        }
        debug!(part = %part.display(), "Part merged");
    }

    let count = merged.len();
    merged.finish()?;
    Ok(count)
}

/// Entry names of an archive, in stored order
pub fn entry_names(path: &Path) -> Result<Vec<String>, ArchiveError> {
    let file = File::open(path).map_err(|e| ArchiveError::io(path, e))?;
    let archive = ZipArchive::new(BufReader::new(file)).map_err(|e| ArchiveError::zip(path, e))?;
    Ok(archive.file_names().map(String::from).collect())
}

/// SHA-256 of a file, hex encoded
pub fn hash_file_blocking(path: &Path) -> Result<String, ArchiveError> {
    let mut file = File::open(path).map_err(|e| ArchiveError::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];

    loop {
        let read = file.read(&mut buffer).map_err(|e| ArchiveError::io(path, e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

pub async fn hash_file(path: &Path) -> Result<String, ArchiveError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || hash_file_blocking(&path))
        .await
        .map_err(|e| ArchiveError::Join(e.to_string()))?
}

/// True when the file exists and hashes to `expected`
pub async fn verify_hash(path: &Path, expected: &str) -> bool {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        return false;
    }
    match hash_file(path).await {
        Ok(actual) => actual == expected,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Hash verification failed");
            false
        }
    }
}
