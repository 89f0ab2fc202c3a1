// keg-aio/src/extract.rs
// Unpacks a fetched source into a build directory.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use keg_common::error::{KegError, Result};
use tracing::debug;
use xz2::read::XzDecoder;

const STAGING_DIR: &str = ".keg-unpack";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Tar,
    TarGz,
    TarXz,
    TarBz2,
    /// Not an archive; copied into place as-is.
    Plain,
}

/// Sniffs the archive type from magic bytes, falling back to the extension.
pub fn detect_archive_kind(path: &Path) -> Result<ArchiveKind> {
    let mut head = Vec::with_capacity(512);
    fs::File::open(path)?.take(512).read_to_end(&mut head)?;
    let by_magic = infer::get(&head).and_then(|kind| match kind.mime_type() {
        "application/gzip" => Some(ArchiveKind::TarGz),
        "application/x-xz" => Some(ArchiveKind::TarXz),
        "application/x-bzip2" => Some(ArchiveKind::TarBz2),
        "application/x-tar" => Some(ArchiveKind::Tar),
        _ => None,
    });
    if let Some(kind) = by_magic {
        return Ok(kind);
    }

    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let kind = if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        ArchiveKind::TarGz
    } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
        ArchiveKind::TarXz
    } else if name.ends_with(".tar.bz2") || name.ends_with(".tbz2") || name.ends_with(".tbz") {
        ArchiveKind::TarBz2
    } else if name.ends_with(".tar") {
        ArchiveKind::Tar
    } else {
        ArchiveKind::Plain
    };
    Ok(kind)
}

/// Unpacks `archive_path` into `target_dir`. When every entry lives under a
/// single top-level directory that directory is stripped, so
/// `gcc-10.2.0/configure` lands at `<target_dir>/configure`. Non-archives are
/// copied under their own file name.
pub async fn extract_archive_async(archive_path: &Path, target_dir: &Path) -> Result<()> {
    let archive_path = archive_path.to_path_buf();
    let target_dir = target_dir.to_path_buf();
    tokio::task::spawn_blocking(move || extract_archive(&archive_path, &target_dir))
        .await
        .map_err(|e| KegError::Generic(format!("JoinError in archive extraction: {e}")))?
}

pub fn extract_archive(archive_path: &Path, target_dir: &Path) -> Result<()> {
    let kind = detect_archive_kind(archive_path)?;
    debug!(
        "Extracting '{}' ({:?}) to '{}'",
        archive_path.display(),
        kind,
        target_dir.display()
    );
    fs::create_dir_all(target_dir)?;

    if kind == ArchiveKind::Plain {
        let name = archive_path
            .file_name()
            .ok_or_else(|| KegError::Generic(format!("No file name in {}", archive_path.display())))?;
        fs::copy(archive_path, target_dir.join(name))?;
        return Ok(());
    }

    let staging = target_dir.join(STAGING_DIR);
    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }
    fs::create_dir_all(&staging)?;

    let file = fs::File::open(archive_path)?;
    let reader: Box<dyn Read> = match kind {
        ArchiveKind::TarGz => Box::new(GzDecoder::new(file)),
        ArchiveKind::TarXz => Box::new(XzDecoder::new(file)),
        ArchiveKind::TarBz2 => Box::new(BzDecoder::new(file)),
        _ => Box::new(file),
    };
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    // `unpack` refuses entries that would land outside `staging`.
    archive.unpack(&staging).map_err(|e| {
        KegError::Generic(format!("Failed to unpack {}: {e}", archive_path.display()))
    })?;

    let root = single_root(&staging)?.unwrap_or_else(|| staging.clone());
    for entry in fs::read_dir(&root)? {
        let entry = entry?;
        fs::rename(entry.path(), target_dir.join(entry.file_name()))?;
    }
    fs::remove_dir_all(&staging)?;
    Ok(())
}

fn single_root(dir: &Path) -> Result<Option<PathBuf>> {
    let entries: Vec<_> = fs::read_dir(dir)?.collect::<std::io::Result<_>>()?;
    match entries.as_slice() {
        [only] if only.file_type()?.is_dir() => Ok(Some(only.path())),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn tar_gz(path: &Path, files: &[(&str, &str)]) {
        let gz = GzEncoder::new(fs::File::create(path).unwrap(), Compression::default());
        let mut builder = tar::Builder::new(gz);
        for (name, body) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append_data(&mut header, name, body.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn strips_single_root_directory() {
        let dir = tempfile::tempdir().unwrap();
        // Misleading extension: detection goes by magic bytes.
        let archive = dir.path().join("src.bin");
        tar_gz(&archive, &[("pkg-1.0/configure", "#!/bin/sh\n"), ("pkg-1.0/src/main.c", "int main;")]);
        assert_eq!(detect_archive_kind(&archive).unwrap(), ArchiveKind::TarGz);

        let out = dir.path().join("build");
        extract_archive(&archive, &out).unwrap();
        assert!(out.join("configure").is_file());
        assert!(out.join("src/main.c").is_file());
        assert!(!out.join(STAGING_DIR).exists());
    }

    #[test]
    fn keeps_multiple_roots() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("flat.tar.gz");
        tar_gz(&archive, &[("a.txt", "a"), ("b/c.txt", "c")]);
        let out = dir.path().join("build");
        extract_archive(&archive, &out).unwrap();
        assert!(out.join("a.txt").is_file());
        assert!(out.join("b/c.txt").is_file());
    }

    #[tokio::test]
    async fn plain_files_are_copied() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("fix.diff");
        fs::write(&src, "--- a\n+++ b\n").unwrap();
        let out = dir.path().join("build");
        extract_archive_async(&src, &out).await.unwrap();
        assert_eq!(fs::read_to_string(out.join("fix.diff")).unwrap(), "--- a\n+++ b\n");
    }
}
