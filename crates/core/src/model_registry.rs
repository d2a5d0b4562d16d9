use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::inference::ValueRange;

pub const DEFAULT_MODEL: &str = "realcugan-pro";
const DEFAULT_TILE_SIZE: u32 = 512;

/// Content family used to pick a model. Classification happens upstream.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ImageKind {
    Anime,
    Photo,
    #[default]
    Unknown,
}

impl std::fmt::Display for ImageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Anime => write!(f, "anime"),
            Self::Photo => write!(f, "photo"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelEntry {
    pub name: String,
    /// Alternative lookup names.
    #[serde(default)]
    pub aliases: Vec<String>,
    pub kind: ImageKind,
    /// Path relative to the models directory.
    pub filename: String,
    pub sha256: Option<String>,
    /// Fixed integer enlargement factor.
    pub scale: u32,
    /// Side length of the square input tile the network is run on.
    pub tile_size: u32,
    pub value_range: ValueRange,
    pub description: String,
}

impl ModelEntry {
    fn matches(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
            || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(name))
    }
}

fn builtin_catalog() -> Vec<ModelEntry> {
    vec![
        ModelEntry {
            name: "realcugan-pro".into(),
            aliases: vec!["realcugan".into()],
            kind: ImageKind::Anime,
            filename: "realcugan/realcugan-pro.onnx".into(),
            sha256: None,
            scale: 4,
            tile_size: DEFAULT_TILE_SIZE,
            value_range: ValueRange::ZERO_TO_ONE,
            description: "Real-CUGAN Pro 4x, tuned for anime and illustrations".into(),
        },
        ModelEntry {
            name: "4xLSDIR".into(),
            aliases: vec!["lsdir".into()],
            kind: ImageKind::Photo,
            filename: "lsdir/4xLSDIR.onnx".into(),
            sha256: None,
            scale: 4,
            tile_size: DEFAULT_TILE_SIZE,
            value_range: ValueRange::ZERO_TO_ONE,
            description: "4xLSDIR, general-purpose 4x for photographs".into(),
        },
    ]
}

fn builtin_entries() -> &'static [ModelEntry] {
    static CATALOG: OnceLock<Vec<ModelEntry>> = OnceLock::new();
    CATALOG.get_or_init(builtin_catalog)
}

/// Looks up a built-in model by name or alias (case-insensitive).
pub fn find_entry(name: &str) -> Option<&'static ModelEntry> {
    builtin_entries().iter().find(|e| e.matches(name))
}

/// Built-in model for a content family; unknown content gets the default.
pub fn recommended_for(kind: ImageKind) -> &'static ModelEntry {
    let name = match kind {
        ImageKind::Photo => "4xLSDIR",
        ImageKind::Anime | ImageKind::Unknown => DEFAULT_MODEL,
    };
    let entries = builtin_entries();
    entries
        .iter()
        .find(|e| e.name == name)
        .unwrap_or(&entries[0])
}

pub struct ModelRegistry {
    models_dir: PathBuf,
    entries: Vec<ModelEntry>,
}

impl ModelRegistry {
    pub fn with_builtin_models(models_dir: PathBuf) -> Self {
        Self {
            models_dir,
            entries: builtin_catalog(),
        }
    }

    /// Registers `.onnx` files under the models directory (one level of
    /// subdirectories) that the catalogue does not know yet. Scale and tile
    /// size are guessed from the file name.
    pub fn discover(&mut self) -> Result<()> {
        let root = self.models_dir.clone();
        if !root.exists() {
            return Ok(());
        }

        let mut candidates = Vec::new();
        let read_dir = fs::read_dir(&root)
            .with_context(|| format!("Failed to read models directory: {}", root.display()))?;
        for entry in read_dir {
            let path = entry?.path();
            if path.is_dir() {
                if let Ok(nested) = fs::read_dir(&path) {
                    candidates.extend(nested.flatten().map(|e| e.path()));
                }
            } else {
                candidates.push(path);
            }
        }
        candidates.sort();

        for path in candidates {
            let is_onnx = path
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("onnx"))
                .unwrap_or(false);
            if !is_onnx || !path.is_file() {
                continue;
            }

            let Ok(relative) = path.strip_prefix(&root) else {
                continue;
            };
            let filename = relative.to_string_lossy().replace('\\', "/");
            if self.entries.iter().any(|e| e.filename == filename) {
                continue;
            }

            let name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or(&filename)
                .to_string();

            info!(filename = %filename, "Discovered unknown ONNX model");

            self.entries.push(ModelEntry {
                scale: guess_scale(&name),
                name,
                aliases: Vec::new(),
                kind: ImageKind::Unknown,
                filename,
                sha256: None,
                tile_size: DEFAULT_TILE_SIZE,
                value_range: ValueRange::ZERO_TO_ONE,
                description: "Discovered model (metadata unknown)".into(),
            });
        }

        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ModelEntry> {
        self.entries.iter().find(|e| e.matches(name))
    }

    /// Path of an installed model file, or an error naming where it was
    /// expected.
    pub fn resolve(&self, name: &str) -> Result<(ModelEntry, PathBuf)> {
        let entry = self.get(name).with_context(|| {
            let known: Vec<&str> = self.entries.iter().map(|e| e.name.as_str()).collect();
            format!("Unknown model: {name} (known: {})", known.join(", "))
        })?;
        let path = resolve_model_path(&self.models_dir, entry)?;
        Ok((entry.clone(), path))
    }

}

/// Checks a model file against `expected_sha256`. Without a hash the check
/// is skipped with a warning.
pub fn verify_model_file(name: &str, path: &Path, expected_sha256: Option<&str>) -> Result<()> {
    let Some(expected_hash) = expected_sha256 else {
        warn!(model = %name, "No SHA256 hash configured, skipping verification");
        return Ok(());
    };

    info!(model = %name, "Verifying SHA256 hash");
    let actual_hash = sha256_file(path)?;
    if !actual_hash.eq_ignore_ascii_case(expected_hash.trim()) {
        bail!("SHA256 mismatch for {name}: expected {expected_hash}, got {actual_hash}");
    }
    info!(model = %name, "Hash verified OK");
    Ok(())
}

pub fn resolve_model_path(models_dir: &Path, entry: &ModelEntry) -> Result<PathBuf> {
    let path = models_dir.join(&entry.filename);
    if !path.is_file() {
        bail!(
            "Model file for {} not found at {}; place the ONNX file there or set [model].file",
            entry.name,
            path.display()
        );
    }
    Ok(path)
}

fn guess_scale(name: &str) -> u32 {
    let lower = name.to_ascii_lowercase();
    for scale in [8, 4, 3, 2] {
        if lower.contains(&format!("{scale}x")) || lower.contains(&format!("x{scale}")) {
            return scale;
        }
    }
    4
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        fs::File::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.write_all(&buf[..n])?;
    }
    let hash = hasher.finalize();
    Ok(format!("{hash:x}"))
}
