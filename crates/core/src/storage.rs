//! Saving output images: filename sanitisation and atomic writes.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::info;

const WINDOWS_RESERVED: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Upper bound on ` (n)` suffixes tried before giving up.
const MAX_NAME_COLLISIONS: usize = 10_000;

/// Reduces `raw` to a bare file name safe on every platform and appends
/// `.{default_ext}` when it has no extension.
pub fn sanitize_filename(raw: &str, default_ext: &str) -> Result<String> {
    let no_controls: String = raw.chars().filter(|ch| !ch.is_control()).collect();
    let normalized = no_controls.replace('\\', "/");
    let leaf = normalized
        .split('/')
        .filter(|segment| !segment.trim().is_empty() && *segment != "." && *segment != "..")
        .next_back()
        .unwrap_or("")
        .trim();

    if leaf.is_empty() {
        bail!("invalid filename: {raw:?}");
    }

    let bytes = leaf.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        bail!("filename contains drive letter: {raw:?}");
    }

    let stem = leaf.split('.').next().unwrap_or(leaf).trim();
    if WINDOWS_RESERVED
        .iter()
        .any(|reserved| stem.eq_ignore_ascii_case(reserved))
    {
        bail!("filename uses Windows reserved name: {raw:?}");
    }

    let cleaned: String = leaf
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | ' ' | '-') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim().trim_matches('.').to_string();

    if cleaned.is_empty() {
        bail!("invalid filename: {raw:?}");
    }

    let has_extension = Path::new(&cleaned).extension().is_some();
    if has_extension || default_ext.is_empty() {
        Ok(cleaned)
    } else {
        Ok(format!("{cleaned}.{}", default_ext.trim_start_matches('.')))
    }
}

/// Expands a leading `~` or `~/` to the user's home directory. `~user` forms
/// are left untouched.
pub fn expand_home(path: &Path) -> PathBuf {
    let Some(raw) = path.to_str() else {
        return path.to_path_buf();
    };
    if raw != "~" && !raw.starts_with("~/") && !raw.starts_with("~\\") {
        return path.to_path_buf();
    }

    #[cfg(windows)]
    let home = std::env::var_os("USERPROFILE");
    #[cfg(not(windows))]
    let home = std::env::var_os("HOME");

    match home {
        Some(home) if raw == "~" => PathBuf::from(home),
        Some(home) => PathBuf::from(home).join(&raw[2..]),
        None => path.to_path_buf(),
    }
}

/// First path in `dir` not taken, appending ` (n)` before the extension.
fn unique_destination(dir: &Path, filename: &str) -> Result<PathBuf> {
    let candidate = dir.join(filename);
    if !candidate.exists() {
        return Ok(candidate);
    }

    let as_path = Path::new(filename);
    let stem = as_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename);
    let ext = as_path.extension().and_then(|e| e.to_str());

    for n in 1..=MAX_NAME_COLLISIONS {
        let name = match ext {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        let candidate = dir.join(name);
        if !candidate.exists() {
            return Ok(candidate);
        }
    }

    bail!(
        "no free file name for {filename} in {} after {MAX_NAME_COLLISIONS} attempts",
        dir.display()
    )
}

/// Writes `bytes` into `dir` under an already-sanitised `filename` and
/// returns the final path. The file appears atomically; an existing file is
/// never overwritten.
pub fn save_image(bytes: &[u8], dir: &Path, filename: &str) -> Result<PathBuf> {
    let dir = expand_home(dir);
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create directory {}", dir.display()))?;

    let final_path = unique_destination(&dir, filename)?;
    let tmp_path = dir.join(format!(".{}.{}.part", filename, uuid::Uuid::new_v4().simple()));

    let mut tmp_file = fs::File::create(&tmp_path)
        .with_context(|| format!("failed to create temp file: {}", tmp_path.display()))?;
    let mut tmp_guard = TempFileCleanupGuard::new(&tmp_path);

    tmp_file
        .write_all(bytes)
        .with_context(|| format!("failed to write temp file: {}", tmp_path.display()))?;
    tmp_file
        .sync_all()
        .with_context(|| format!("failed to fsync temp file: {}", tmp_path.display()))?;
    drop(tmp_file);

    fs::rename(&tmp_path, &final_path).with_context(|| {
        format!(
            "failed to atomically move {} -> {}",
            tmp_path.display(),
            final_path.display()
        )
    })?;
    tmp_guard.disarm();

    info!(path = %final_path.display(), bytes = bytes.len(), "Image saved");
    Ok(final_path)
}

struct TempFileCleanupGuard<'a> {
    path: &'a Path,
    keep: bool,
}

impl<'a> TempFileCleanupGuard<'a> {
    fn new(path: &'a Path) -> Self {
        Self { path, keep: false }
    }

    fn disarm(&mut self) {
        self.keep = true;
    }
}

impl Drop for TempFileCleanupGuard<'_> {
    fn drop(&mut self) {
        if !self.keep {
            let _ = fs::remove_file(self.path);
        }
    }
}
