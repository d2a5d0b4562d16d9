//! Locating the ONNX Runtime shared library.
//!
//! `ort` is built with `load-dynamic`, so the library is opened at the first
//! session build from `ORT_DYLIB_PATH`. This module fills that variable in
//! from the usual install locations when the user has not set it.

use std::env;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

const ORT_DYLIB_ENV: &str = "ORT_DYLIB_PATH";

#[cfg(all(unix, not(target_os = "macos")))]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(target_os = "macos")]
const ORT_LIB_NAME: &str = "libonnxruntime.dylib";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

/// Where the ORT library path came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrtLibrarySource {
    /// `ORT_DYLIB_PATH` was already set.
    Environment(PathBuf),
    /// Found in one of the candidate directories and exported.
    Discovered(PathBuf),
    NotFound,
}

/// Directories probed, in order:
///   1. `<exe_dir>/` (Windows only)
///   2. `<exe_dir>/lib/`
///   3. `<exe_dir>/../lib/`
///   4. `<cwd>/lib/`
///   5. `/usr/local/lib/`, `/usr/lib/` (Unix only)
fn candidate_lib_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            #[cfg(windows)]
            dirs.push(exe_dir.to_path_buf());
            dirs.push(exe_dir.join("lib"));
            if let Some(parent) = exe_dir.parent() {
                dirs.push(parent.join("lib"));
            }
        }
    }
    if let Ok(cwd) = env::current_dir() {
        let cwd_lib = cwd.join("lib");
        if !dirs.contains(&cwd_lib) {
            dirs.push(cwd_lib);
        }
    }
    #[cfg(unix)]
    {
        dirs.push(PathBuf::from("/usr/local/lib"));
        dirs.push(PathBuf::from("/usr/lib"));
    }
    dirs
}

fn find_ort_dylib_in_dirs(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

/// Exports `ORT_DYLIB_PATH` when it is unset and the library can be found.
///
/// Call at the very start of `main()`, before any session is built.
pub fn setup_runtime_libs() -> OrtLibrarySource {
    if let Some(existing) = env::var_os(ORT_DYLIB_ENV) {
        return OrtLibrarySource::Environment(PathBuf::from(existing));
    }

    match find_ort_dylib_in_dirs(&candidate_lib_dirs()) {
        Some(path) => {
            env::set_var(ORT_DYLIB_ENV, &path);
            OrtLibrarySource::Discovered(path)
        }
        None => OrtLibrarySource::NotFound,
    }
}

/// Logs the outcome of [`setup_runtime_libs`]. Call after tracing is up.
pub fn log_runtime_lib_status(source: &OrtLibrarySource) {
    match source {
        OrtLibrarySource::Environment(path) | OrtLibrarySource::Discovered(path)
            if !Path::new(path).is_file() =>
        {
            warn!(path = %path.display(), "ORT library path does not point to a file");
        }
        OrtLibrarySource::Environment(path) => {
            info!(path = %path.display(), "ORT library from {ORT_DYLIB_ENV}");
        }
        OrtLibrarySource::Discovered(path) => {
            info!(path = %path.display(), "ORT library discovered");
        }
        OrtLibrarySource::NotFound => {
            warn!("{ORT_DYLIB_ENV} not set and {ORT_LIB_NAME} not found; ORT will use the default loader search path");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_candidate_lib_dirs_contains_system_paths() {
        let dirs = candidate_lib_dirs();
        assert!(dirs.contains(&PathBuf::from("/usr/local/lib")));
        assert!(dirs.contains(&PathBuf::from("/usr/lib")));
    }

    #[test]
    fn test_candidate_lib_dirs_includes_cwd_lib() {
        let dirs = candidate_lib_dirs();
        if let Ok(cwd) = env::current_dir() {
            assert!(dirs.contains(&cwd.join("lib")));
        }
    }

    #[test]
    fn test_find_ort_dylib_prefers_first_dir() {
        let temp = tempfile::tempdir().unwrap();
        let empty = temp.path().join("empty");
        let first = temp.path().join("first");
        let second = temp.path().join("second");
        for dir in [&empty, &first, &second] {
            std::fs::create_dir_all(dir).unwrap();
        }
        std::fs::write(first.join(ORT_LIB_NAME), b"first").unwrap();
        std::fs::write(second.join(ORT_LIB_NAME), b"second").unwrap();

        let found = find_ort_dylib_in_dirs(&[empty.clone(), first.clone(), second]);
        assert_eq!(found, Some(first.join(ORT_LIB_NAME)));
        assert_eq!(find_ort_dylib_in_dirs(&[empty]), None);
    }
}
