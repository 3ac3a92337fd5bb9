use std::collections::BTreeMap;
use std::io::{Cursor, Read};

use thiserror::Error;
use zip::ZipArchive;

use crate::JobHandle;

/// Largest single entry `decode` will inflate.
pub const MAX_ENTRY_BYTES: u64 = 16 * 1024 * 1024;
/// Largest total of inflated entries `decode` will hold at once.
pub const MAX_TOTAL_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("not a readable archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("failed to read entry {name}: {source}")]
    Entry {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("entry {name} is not valid UTF-8 text")]
    NotText { name: String },

    #[error("entry {name} is larger than {limit} bytes")]
    EntryTooLarge { name: String, limit: u64 },

    #[error("archive inflates to more than {limit} bytes")]
    ArchiveTooLarge { limit: u64 },

    #[error("archive has no entry named {name}")]
    MissingEntry { name: String },

    #[error("decoding task stopped: {0}")]
    Interrupted(String),
}

/// Decodes every file entry of a zip archive as UTF-8 text.
///
/// Sizes declared in the archive are not trusted: entries are read through
/// [`MAX_ENTRY_BYTES`] and [`MAX_TOTAL_BYTES`] bounds.
pub fn decode(bytes: &[u8]) -> Result<BTreeMap<String, String>, DecodeError> {
    decode_bounded(bytes, MAX_ENTRY_BYTES, MAX_TOTAL_BYTES)
}

fn decode_bounded(
    bytes: &[u8],
    entry_limit: u64,
    total_limit: u64,
) -> Result<BTreeMap<String, String>, DecodeError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    let mut files = BTreeMap::new();
    let mut total = 0u64;

    for index in 0..archive.len() {
        let entry = archive.by_index(index)?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        if entry.size() > entry_limit {
            return Err(DecodeError::EntryTooLarge {
                name,
                limit: entry_limit,
            });
        }

        let mut raw = Vec::new();
        entry
            .take(entry_limit + 1)
            .read_to_end(&mut raw)
            .map_err(|source| DecodeError::Entry {
                name: name.clone(),
                source,
            })?;
        if raw.len() as u64 > entry_limit {
            return Err(DecodeError::EntryTooLarge {
                name,
                limit: entry_limit,
            });
        }
        total += raw.len() as u64;
        if total > total_limit {
            return Err(DecodeError::ArchiveTooLarge { limit: total_limit });
        }

        let text = String::from_utf8(raw).map_err(|_| DecodeError::NotText { name: name.clone() })?;
        files.insert(name, text);
    }

    Ok(files)
}

/// Pulls the `<handle>.txt` entry out of a decoded archive.
pub fn extract_output(
    mut files: BTreeMap<String, String>,
    handle: &JobHandle,
) -> Result<String, DecodeError> {
    let name = handle.artifact_entry();
    files
        .remove(&name)
        .ok_or(DecodeError::MissingEntry { name })
}
