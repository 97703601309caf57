// Root directory resolution
// Shared by the launcher (validate before spawning) and the server (validate before binding)

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("not a directory: {}", .0.display())]
    NotADirectory(PathBuf),
    #[error("failed to resolve {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The shell's working directory.
///
/// MSYS/Git Bash shells export a `PWD` that may be a UNC path
/// (`//server/share/...`) which the process cwd cannot represent.
pub fn working_directory() -> std::io::Result<PathBuf> {
    if let Ok(pwd) = std::env::var("PWD") {
        if is_unc(&pwd) {
            return Ok(PathBuf::from(pwd));
        }
    }
    std::env::current_dir()
}

fn is_unc(path: &str) -> bool {
    path.starts_with("//") || path.starts_with("\\\\")
}

/// Resolve a `--directory` argument against the working directory
pub fn resolve_target_directory(arg: &Path) -> std::io::Result<PathBuf> {
    let target = if arg.as_os_str() == "." {
        working_directory()?
    } else if arg.is_absolute() || is_unc(&arg.to_string_lossy()) {
        arg.to_path_buf()
    } else {
        working_directory()?.join(arg)
    };
    Ok(target)
}

/// Resolve and validate a server root, returning its canonical form.
///
/// Errors name the path exactly as the user gave it.
pub fn validate_root(arg: &Path) -> Result<PathBuf, DirectoryError> {
    let target = resolve_target_directory(arg).map_err(|source| DirectoryError::Io {
        path: arg.to_path_buf(),
        source,
    })?;

    if !target.exists() {
        return Err(DirectoryError::NotFound(arg.to_path_buf()));
    }
    if !target.is_dir() {
        return Err(DirectoryError::NotADirectory(arg.to_path_buf()));
    }

    // UNC shares are kept verbatim; canonicalize would rewrite them.
    if is_unc(&target.to_string_lossy()) {
        return Ok(target);
    }
    target.canonicalize().map_err(|source| DirectoryError::Io {
        path: arg.to_path_buf(),
        source,
    })
}
