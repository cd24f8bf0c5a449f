//! Canonical tar archives
//!
//! Layer identity is the SHA-256 of the uncompressed tar stream, so the
//! writer must be deterministic: fixed mtime, fixed ownership, stable
//! lexicographic traversal. Entry names carry the source directory's full
//! path (minus the leading `/`) so extracting into `/` reconstructs it.

use crate::error::{KilnError, KilnResult};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Writes to an inner writer while hashing every byte
struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    fn finish(self) -> (W, String) {
        (self.inner, hex::encode(self.hasher.finalize()))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Tar `src_dir` into a file at `tar_path`, returning the diff ID
/// (`sha256:<hex>` of the uncompressed stream).
pub fn write_tar_file(
    src_dir: &Path,
    tar_path: &Path,
    uid: u32,
    gid: u32,
) -> KilnResult<String> {
    let file = File::create(tar_path)
        .map_err(|e| KilnError::io(format!("creating tar file {}", tar_path.display()), e))?;
    let sha = write_tar(file, src_dir, uid, gid)?;
    Ok(sha)
}

/// Stream a canonical tar of `src_dir` into `out`, returning the diff ID.
pub fn write_tar<W: Write>(out: W, src_dir: &Path, uid: u32, gid: u32) -> KilnResult<String> {
    let src_dir = src_dir
        .canonicalize()
        .map_err(|e| KilnError::io(format!("resolving {}", src_dir.display()), e))?;

    let writer = HashingWriter::new(out);
    let mut builder = tar::Builder::new(writer);
    builder.follow_symlinks(false);

    let walker = WalkDir::new(&src_dir)
        .min_depth(0)
        .sort_by_file_name()
        .into_iter();

    for entry in walker {
        let entry = entry.map_err(|e| {
            KilnError::io(
                format!("walking {}", src_dir.display()),
                std::io::Error::other(e),
            )
        })?;
        let name = entry_name(entry.path());
        append_entry(&mut builder, entry.path(), &name, uid, gid)
            .map_err(|e| KilnError::io(format!("archiving {}", entry.path().display()), e))?;
    }

    let writer = builder
        .into_inner()
        .map_err(|e| KilnError::io("finishing tar stream", e))?;
    let (mut inner, sha) = writer.finish();
    inner
        .flush()
        .map_err(|e| KilnError::io("flushing tar stream", e))?;
    Ok(format!("sha256:{sha}"))
}

/// Tar entry name: the absolute path with the leading `/` removed
fn entry_name(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::RootDir))
        .collect()
}

fn append_entry<W: Write>(
    builder: &mut tar::Builder<W>,
    path: &Path,
    name: &Path,
    uid: u32,
    gid: u32,
) -> std::io::Result<()> {
    use std::os::unix::fs::{MetadataExt, PermissionsExt};

    let meta = path.symlink_metadata()?;
    let mut header = tar::Header::new_gnu();
    header.set_uid(u64::from(uid));
    header.set_gid(u64::from(gid));
    header.set_mtime(0);
    header.set_mode(meta.permissions().mode() & 0o7777);

    if meta.file_type().is_symlink() {
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        let target = std::fs::read_link(path)?;
        builder.append_link(&mut header, name, target)?;
    } else if meta.is_dir() {
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        builder.append_data(&mut header, name, std::io::empty())?;
    } else {
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(meta.size());
        let file = File::open(path)?;
        builder.append_data(&mut header, name, file)?;
    }
    Ok(())
}

/// Extract a tar stream into `dest`, preserving relative paths.
///
/// Entries that would land outside `dest` are rejected rather than
/// silently skipped.
pub fn untar<R: Read>(reader: R, dest: &Path) -> KilnResult<()> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);

    let entries = archive
        .entries()
        .map_err(|e| KilnError::io("reading tar entries", e))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| KilnError::io("reading tar entry", e))?;
        let entry_path = entry
            .path()
            .map_err(|e| KilnError::io("reading tar entry path", e))?
            .into_owned();

        let unpacked = entry.unpack_in(dest).map_err(|e| {
            KilnError::io(format!("extracting tar entry {}", entry_path.display()), e)
        })?;
        if !unpacked {
            return Err(KilnError::TarPathEscape(
                entry_path.to_string_lossy().into_owned(),
            ));
        }
    }
    Ok(())
}

/// Open a tar file and extract it into `dest`
pub fn untar_file(tar_path: &Path, dest: &Path) -> KilnResult<()> {
    let file = File::open(tar_path)
        .map_err(|e| KilnError::io(format!("opening tar file {}", tar_path.display()), e))?;
    untar(file, dest)
}
