use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::InstallerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Root,
    User,
}

impl FileKind {
    fn mode(self) -> u32 {
        match self {
            Self::Root => 0o644,
            Self::User => 0o755,
        }
    }
}

/// Inert file artifacts are already on disk after the download step; placing
/// one just settles its permissions.
pub struct FilePlacer {
    dry_run: bool,
}

impl FilePlacer {
    pub fn new(dry_run: bool) -> Self {
        Self { dry_run }
    }

    pub fn place(&self, path: &Path, kind: FileKind) -> Result<(), InstallerError> {
        if self.dry_run {
            tracing::info!(file = %path.display(), "[dry run] would place file");
            return Ok(());
        }

        if !path.exists() {
            return Err(InstallerError::FileMissing(path.to_path_buf()));
        }

        let mut permissions = fs::metadata(path)
            .map_err(|source| InstallerError::PlaceFailed {
                path: path.to_path_buf(),
                source,
            })?
            .permissions();
        permissions.set_mode(kind.mode());
        fs::set_permissions(path, permissions).map_err(|source| InstallerError::PlaceFailed {
            path: path.to_path_buf(),
            source,
        })?;

        tracing::info!(file = %path.display(), mode = format!("{:o}", kind.mode()), "file placed");
        Ok(())
    }
}
