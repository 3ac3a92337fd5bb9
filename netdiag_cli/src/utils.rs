use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::info;

use crate::CacheKey;

pub fn save_json(data: &serde_json::Value, path: impl AsRef<Path>) -> io::Result<()> {
    let path = path.as_ref();
    let mut file = File::create(path)?;
    file.write_all(serde_json::to_string_pretty(data)?.as_bytes())?;
    info!("{} written", path.display());
    Ok(())
}

pub fn save_text(content: &str, path: impl AsRef<Path>) -> io::Result<()> {
    let path = path.as_ref();
    let mut file = File::create(path)?;
    file.write_all(content.as_bytes())?;
    info!("{} written", path.display());
    Ok(())
}

/// Saves one result as `<dir>/<tool>-<target>.txt`, creating `dir` if needed.
pub fn save_output(dir: &Path, key: &CacheKey, output: &str) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}.txt", file_stem(key)));
    save_text(output, &path)?;
    Ok(path)
}

/// Keeps file names portable whatever the user typed as target.
fn file_stem(key: &CacheKey) -> String {
    key.to_string()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_') { c } else { '_' })
        .collect()
}
