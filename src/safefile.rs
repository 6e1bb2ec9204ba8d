//! Symlink-refusing, escape-refusing file access.
//!
//! Every file the runner reads for verification (and every output file it
//! creates) goes through this module. On Linux the open is a single
//! `openat2` call with `RESOLVE_NO_SYMLINKS`, so the kernel rejects any
//! symlink anywhere in the path. Kernels without `openat2` (and non-Linux
//! targets) fall back to a manual component walk that lstats each prefix
//! and opens the final component with `O_NOFOLLOW`.
//!
//! All paths must be absolute and must not contain `.` or `..` components;
//! callers are expected to hand in already-normalized paths.

use std::fs::File;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Why a safe open was refused.
#[derive(Debug, Error)]
pub enum SafeOpenError {
    #[error("path is not absolute")]
    NotAbsolute,

    #[error("path contains '.' or '..' components")]
    Traversal,

    #[error("symlink in path at {0}")]
    Symlink(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Open an existing file read-only, refusing symlinks in every component.
pub fn safe_open(path: &Path) -> Result<File, SafeOpenError> {
    check_path(path)?;
    open_impl(path, OpenKind::Read)
}

/// Create (or truncate) a file for writing with mode 0600, refusing
/// symlinks in every component. Used for command output files, which are
/// always created by the real uid before any elevation happens.
pub fn safe_create(path: &Path) -> Result<File, SafeOpenError> {
    check_path(path)?;
    open_impl(path, OpenKind::Create)
}

#[derive(Clone, Copy)]
enum OpenKind {
    Read,
    Create,
}

fn check_path(path: &Path) -> Result<(), SafeOpenError> {
    if !path.is_absolute() {
        return Err(SafeOpenError::NotAbsolute);
    }
    for comp in path.components() {
        match comp {
            Component::CurDir | Component::ParentDir => return Err(SafeOpenError::Traversal),
            _ => {}
        }
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn open_impl(path: &Path, kind: OpenKind) -> Result<File, SafeOpenError> {
    use nix::fcntl::{OFlag, OpenHow, ResolveFlag, openat2};
    use nix::sys::stat::Mode;
    use std::os::fd::{AsRawFd, FromRawFd};

    let flags = match kind {
        OpenKind::Read => OFlag::O_RDONLY | OFlag::O_CLOEXEC,
        OpenKind::Create => {
            OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC | OFlag::O_CLOEXEC
        }
    };
    let mode = match kind {
        OpenKind::Read => Mode::empty(),
        OpenKind::Create => Mode::from_bits_truncate(0o600),
    };

    // openat2 ignores the dirfd for absolute paths, so anchor at "/" and
    // resolve the path relative to it. RESOLVE_NO_SYMLINKS covers every
    // component, including the final one.
    let root = File::open("/")?;
    let rel = path.strip_prefix("/").unwrap_or(path);
    let how = OpenHow::new()
        .flags(flags)
        .mode(mode)
        .resolve(ResolveFlag::RESOLVE_NO_SYMLINKS);

    match openat2(root.as_raw_fd(), rel, how) {
        // SAFETY: openat2 returned a freshly opened fd that nothing else owns.
        Ok(fd) => Ok(unsafe { File::from_raw_fd(fd) }),
        Err(nix::errno::Errno::ELOOP) => Err(SafeOpenError::Symlink(path.to_path_buf())),
        // Kernel predates openat2 (< 5.6): degrade to the manual walk.
        Err(nix::errno::Errno::ENOSYS) => open_walk(path, kind),
        Err(e) => Err(SafeOpenError::Io(std::io::Error::from(e))),
    }
}

#[cfg(not(target_os = "linux"))]
fn open_impl(path: &Path, kind: OpenKind) -> Result<File, SafeOpenError> {
    open_walk(path, kind)
}

/// Manual equivalent of `RESOLVE_NO_SYMLINKS`: lstat every prefix of the
/// path, rejecting any symlink, then open the final component with
/// `O_NOFOLLOW` so a last-moment symlink swap is also refused.
fn open_walk(path: &Path, kind: OpenKind) -> Result<File, SafeOpenError> {
    let mut current = PathBuf::from("/");
    let parent = path.parent().unwrap_or(Path::new("/"));
    for comp in parent.components() {
        if let Component::Normal(part) = comp {
            current.push(part);
            let meta = std::fs::symlink_metadata(&current)?;
            if meta.file_type().is_symlink() {
                return Err(SafeOpenError::Symlink(current));
            }
        }
    }

    // For reads, the final component must not be a symlink either.
    // O_NOFOLLOW enforces this at open time; the lstat below gives a
    // clearer error than the raw ELOOP.
    if matches!(kind, OpenKind::Read) {
        let meta = std::fs::symlink_metadata(path)?;
        if meta.file_type().is_symlink() {
            return Err(SafeOpenError::Symlink(path.to_path_buf()));
        }
    }

    use std::os::unix::fs::OpenOptionsExt;
    let mut opts = std::fs::OpenOptions::new();
    match kind {
        OpenKind::Read => {
            opts.read(true);
        }
        OpenKind::Create => {
            opts.write(true).create(true).truncate(true).mode(0o600);
        }
    }
    opts.custom_flags(nix::fcntl::OFlag::O_NOFOLLOW.bits());
    match opts.open(path) {
        Ok(file) => Ok(file),
        Err(e) if e.raw_os_error() == Some(nix::errno::Errno::ELOOP as i32) => {
            Err(SafeOpenError::Symlink(path.to_path_buf()))
        }
        Err(e) => Err(SafeOpenError::Io(e)),
    }
}
