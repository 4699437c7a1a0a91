/// Installs the worker binary and its auxiliary files from the bundled
/// asset directory into the worker's working directory.
///
/// The binary is selected from an architecture-specific asset subdirectory
/// and is reinstalled whenever its content hash differs from the installed
/// copy. Auxiliary files are copied only when missing unless marked as
/// overwritable.
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::AuxFileConfig;

const EXECUTABLE_MODE: u32 = 0o755;

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("failed to create install directory {}: {source}", .path.display())]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("failed to install {} from {}: {source}", .target.display(), .source_path.display())]
    Copy { source_path: PathBuf, target: PathBuf, source: io::Error },
}

/// Worker builds shipped in the asset directory, one per CPU family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Arm64,
    X86_64,
    Arm,
    X86,
}

impl Platform {
    /// Maps an architecture string (`uname -m` style) to a platform.
    /// Unrecognized architectures fall back to 32-bit ARM.
    pub fn from_arch(arch: &str) -> Self {
        let normalized = arch.to_uppercase();
        if normalized.contains("ARM64") || normalized.contains("AARCH64") {
            Platform::Arm64
        } else if normalized.contains("X86_64") || normalized.contains("AMD64") {
            Platform::X86_64
        } else if normalized.contains("ARM") {
            Platform::Arm
        } else if normalized.contains("86") {
            Platform::X86
        } else {
            warn!("could not map architecture '{arch}' to a platform, defaulting to arm");
            Platform::Arm
        }
    }

    pub fn asset_subdir(self) -> &'static str {
        match self {
            Platform::Arm64 => "arm64-v8a",
            Platform::X86_64 => "x86_64",
            Platform::Arm => "armeabi-v7a",
            Platform::X86 => "x86",
        }
    }
}

/// Where the worker binary comes from and where it goes.
#[derive(Debug, Clone)]
pub struct WorkerBinaryDescriptor {
    pub source_path: PathBuf,
    pub installed_path: PathBuf,
    pub executable: bool,
}

impl WorkerBinaryDescriptor {
    /// Hash of the bundled binary. `None` when it cannot be read.
    pub fn expected_hash(&self) -> Option<Vec<u8>> {
        hash_file(&self.source_path).ok()
    }
}

/// SHA-256 of the file at `path`.
pub fn hash_file(path: &Path) -> io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize().to_vec())
}

pub struct Installer {
    install_dir: PathBuf,
    asset_dir: PathBuf,
    binary: WorkerBinaryDescriptor,
    aux_files: Vec<AuxFileConfig>,
}

impl Installer {
    pub fn new(
        install_dir: PathBuf,
        asset_dir: PathBuf,
        binary_name: &str,
        platform: Platform,
        aux_files: Vec<AuxFileConfig>,
    ) -> Self {
        let binary = WorkerBinaryDescriptor {
            source_path: asset_dir.join(platform.asset_subdir()).join(binary_name),
            installed_path: install_dir.join(binary_name),
            executable: true,
        };
        Self { install_dir, asset_dir, binary, aux_files }
    }

    pub fn binary(&self) -> &WorkerBinaryDescriptor {
        &self.binary
    }

    /// True when the installed binary matches the bundled one. An absent
    /// installed file, or an unreadable bundled one, never matches.
    pub fn is_current(&self) -> bool {
        let expected = match self.binary.expected_hash() {
            Some(hash) => hash,
            None => {
                warn!(path = %self.binary.source_path.display(), "bundled worker binary unreadable");
                return false;
            }
        };
        match hash_file(&self.binary.installed_path) {
            Ok(installed) => {
                debug!(
                    expected = %hex::encode(&expected),
                    installed = %hex::encode(&installed),
                    "compared worker binary hashes"
                );
                installed == expected
            }
            Err(_) => false,
        }
    }

    /// Installs the binary if stale, missing or `force`d. Returns `false`
    /// when any copy step fails; the worker must not be launched then.
    pub fn ensure_installed(&self, force: bool) -> bool {
        if !force && self.is_current() {
            return true;
        }
        match self.install() {
            Ok(()) => true,
            Err(e) => {
                warn!("worker installation failed: {e}");
                false
            }
        }
    }

    /// Unconditionally reinstalls the binary and installs auxiliary files.
    pub fn install(&self) -> Result<(), InstallError> {
        self.prepare_install_dir()?;
        copy_atomic(&self.binary.source_path, &self.binary.installed_path, self.binary.executable)?;
        info!(path = %self.binary.installed_path.display(), "installed worker binary");

        for aux in &self.aux_files {
            let source = self.asset_dir.join(&aux.name);
            let target = self.install_dir.join(aux.target_name());
            if target.exists() && !aux.overwrite {
                debug!(path = %target.display(), "keeping existing file");
                continue;
            }
            copy_atomic(&source, &target, false)?;
            debug!(path = %target.display(), "installed auxiliary file");
        }
        Ok(())
    }

    fn prepare_install_dir(&self) -> Result<(), InstallError> {
        let dir = &self.install_dir;
        let err = |source| InstallError::CreateDir { path: dir.clone(), source };
        if !dir.exists() {
            fs::create_dir_all(dir).map_err(err)?;
        }
        let mut perms = fs::metadata(dir).map_err(err)?.permissions();
        if perms.mode() & 0o200 == 0 {
            perms.set_mode(perms.mode() | 0o700);
            fs::set_permissions(dir, perms).map_err(err)?;
        }
        Ok(())
    }
}

/// Copies `source` to a temporary sibling of `target` and renames it into
/// place, so a failure part way leaves any existing `target` untouched.
fn copy_atomic(source: &Path, target: &Path, executable: bool) -> Result<(), InstallError> {
    let err = |e| InstallError::Copy {
        source_path: source.to_path_buf(),
        target: target.to_path_buf(),
        source: e,
    };
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let partial = target.with_file_name(format!(".{file_name}.partial"));

    let result = (|| {
        fs::copy(source, &partial)?;
        if executable {
            fs::set_permissions(&partial, fs::Permissions::from_mode(EXECUTABLE_MODE))?;
        }
        fs::rename(&partial, target)
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&partial);
        return Err(err(e));
    }
    Ok(())
}
