use std::ffi::CStr;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use log::error;
use oci_spec::image::{Descriptor, Digest};
use rustix::{
    fd::OwnedFd,
    fs::{AtFlags, Dir, FileType, Mode, OFlags, ResolveFlags},
    io::Errno,
};
use sha2::{Digest as _, Sha256};
use tokio::io::AsyncReadExt;

use crate::{
    BlobStatter, BlobStore, BlobStream, DriverError, LinkKind, LinkStore, ManifestStore,
    OCTET_STREAM, UploadStore, Walker, check_repo_path,
};
use sroci::digest::{digest_eq, parse_digest, payload_digest, verify_payload};

// filesystem layout, all content addressed two levels deep:
//   blobs/<algo>/<hex>
//   manifests/<algo>/<hex> and <hex>_type holding the media type
//   uploads/<uuid>
//   repositories/<name...>/_layers/<algo>/<hex>
//   repositories/<name...>/_manifests/<algo>/<hex>
// writes go through a _tmp file and rename so a crashed upload never leaves a
// half blob under its final name

const READ_CHUNK: usize = 64 * 1024;

// a digest rendered as a path-safe two-component key. the grammar technically
// allows . in the algo separator but we don't accept it since this makes the
// no-traversal check trivial
#[derive(Hash, Eq, PartialEq, Clone)]
pub struct DigestKey(String);

impl DigestKey {
    pub fn new(s: String) -> Option<Self> {
        if s.contains('.') || s.contains('/') {
            return None;
        }
        match s.split_once(':') {
            Some((l, r)) if l.is_empty() || r.is_empty() => None,
            None => None,
            _ => Some(Self(s)),
        }
    }

    fn from_cstr_parts(a: &CStr, b: &CStr) -> Option<Self> {
        let a = a.to_str().ok()?;
        let b = b.to_str().ok()?;
        DigestKey::new(format!("{}:{}", a, b))
    }

    fn as_path(&self) -> String {
        self.0.replacen(':', "/", 1)
    }

    fn parts(&self) -> (&str, &str) {
        // checked in constructor
        self.0.split_once(':').unwrap()
    }

    fn with_suffix(&self, suffix: &str) -> Self {
        Self(format!("{}{}", self.0, suffix))
    }
}

impl TryFrom<&Digest> for DigestKey {
    type Error = DriverError;
    fn try_from(digest: &Digest) -> Result<Self, DriverError> {
        Self::new(digest.to_string()).ok_or_else(|| DriverError::BadPath(digest.to_string()))
    }
}

impl std::fmt::Display for DigestKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub struct FileGuard<'a> {
    dir: &'a OwnedFd,
    key: Option<&'a DigestKey>,
}

impl<'a> FileGuard<'a> {
    fn new(dir: &'a OwnedFd, key: &'a DigestKey) -> FileGuard<'a> {
        Self {
            dir,
            key: Some(key),
        }
    }

    pub fn success(mut self) -> Result<(), Errno> {
        if let Some(key) = self.key.take() {
            rustix::fs::renameat(
                self.dir,
                key.with_suffix("_tmp").as_path(),
                self.dir,
                key.as_path(),
            )?;
        }
        Ok(())
    }
}

impl Drop for FileGuard<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            match unlinkat(self.dir, key) {
                Ok(()) => {}
                Err(e) => {
                    error!("error on FileGuard drop trying to delete {} {:?}", key, e);
                }
            }
        }
    }
}

pub struct FsDriver {
    root: PathBuf,
    blobs: OwnedFd,
    manifests: OwnedFd,
    uploads: OwnedFd,
    repositories: OwnedFd,
}

impl FsDriver {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, DriverError> {
        let root = root.into();
        let top = open_or_create_dir_at(None, &root)?;
        let blobs = open_or_create_dir_at(Some(&top), "blobs")?;
        let manifests = open_or_create_dir_at(Some(&top), "manifests")?;
        let uploads = open_or_create_dir_at(Some(&top), "uploads")?;
        let repositories = open_or_create_dir_at(Some(&top), "repositories")?;
        Ok(Self {
            root,
            blobs,
            manifests,
            uploads,
            repositories,
        })
    }

    fn link_dir(&self, repo: &str, kind: LinkKind) -> Result<OwnedFd, DriverError> {
        check_repo_path(repo)?;
        let sub = match kind {
            LinkKind::Layer => "_layers",
            LinkKind::Manifest => "_manifests",
        };
        let mut dir = mkdirat_recursive(&self.repositories, repo)?;
        dir = open_or_create_dir_at(Some(&dir), sub)?;
        Ok(dir)
    }

    fn write_file(dir: &OwnedFd, key: &DigestKey, data: &[u8]) -> Result<(), DriverError> {
        let tmp = key.with_suffix("_tmp");
        let file = openat_create_write(dir, &tmp)?;
        let guard = FileGuard::new(dir, key);
        use std::io::Write;
        let mut file = file;
        file.write_all(data)?;
        file.flush()?;
        drop(file);
        guard.success()?;
        Ok(())
    }

    fn read_file(dir: &OwnedFd, key: &DigestKey) -> Result<Option<Vec<u8>>, DriverError> {
        let Some(mut file) = openat_read(dir, key.as_path())? else {
            return Ok(None);
        };
        use std::io::Read;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Ok(Some(buf))
    }
}

#[async_trait]
impl BlobStatter for FsDriver {
    async fn stat(&self, digest: &Digest) -> Result<Descriptor, DriverError> {
        let key = DigestKey::try_from(digest)?;
        match rustix::fs::statat(&self.blobs, key.as_path(), AtFlags::empty()) {
            Ok(stat) => Ok(Descriptor::new(
                OCTET_STREAM.into(),
                stat.st_size as u64,
                digest.clone(),
            )),
            Err(e) if e == Errno::NOENT => Err(DriverError::NotFound),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl BlobStore for FsDriver {
    async fn get(&self, digest: &Digest) -> Result<Bytes, DriverError> {
        let key = DigestKey::try_from(digest)?;
        Self::read_file(&self.blobs, &key)?
            .map(Bytes::from)
            .ok_or(DriverError::NotFound)
    }

    async fn open(&self, digest: &Digest) -> Result<(Descriptor, BlobStream), DriverError> {
        let key = DigestKey::try_from(digest)?;
        let Some(file) = openat_read(&self.blobs, key.as_path())? else {
            return Err(DriverError::NotFound);
        };
        let stat = rustix::fs::fstat(&file)?;
        let descriptor = Descriptor::new(OCTET_STREAM.into(), stat.st_size as u64, digest.clone());
        let file = tokio::fs::File::from_std(file);
        let stream = futures::stream::unfold(file, |mut file| async move {
            let mut buf = vec![0u8; READ_CHUNK];
            match file.read(&mut buf).await {
                Ok(0) => None,
                Ok(n) => {
                    buf.truncate(n);
                    Some((Ok(Bytes::from(buf)), file))
                }
                Err(e) => Some((Err(e), file)),
            }
        })
        .boxed();
        Ok((descriptor, stream))
    }

    async fn put(&self, data: Bytes) -> Result<Descriptor, DriverError> {
        let digest = payload_digest(&data);
        let key = DigestKey::try_from(&digest)?;
        ensure_algo_dir(&self.blobs, &key)?;
        Self::write_file(&self.blobs, &key, &data)?;
        Ok(Descriptor::new(
            OCTET_STREAM.into(),
            data.len() as u64,
            digest,
        ))
    }

    async fn delete(&self, digest: &Digest) -> Result<u64, DriverError> {
        let key = DigestKey::try_from(digest)?;
        let size = match rustix::fs::statat(&self.blobs, key.as_path(), AtFlags::empty()) {
            Ok(stat) => stat.st_size as u64,
            Err(e) if e == Errno::NOENT => return Err(DriverError::NotFound),
            Err(e) => return Err(e.into()),
        };
        unlinkat(&self.blobs, &key)?;
        Ok(size)
    }
}

#[async_trait]
impl UploadStore for FsDriver {
    async fn create_upload(&self) -> Result<String, DriverError> {
        let id = uuid::Uuid::new_v4().to_string();
        let fd = rustix::fs::openat2(
            &self.uploads,
            &id,
            OFlags::RDWR | OFlags::CREATE | OFlags::TRUNC | OFlags::CLOEXEC,
            Mode::from_bits_truncate(0o644),
            ResolveFlags::BENEATH,
        )?;
        drop(fd);
        Ok(id)
    }

    async fn append_upload(&self, id: &str, chunk: Bytes) -> Result<u64, DriverError> {
        let Some(file) = openat_upload(&self.uploads, id, OFlags::WRONLY | OFlags::APPEND)? else {
            return Err(DriverError::NotFound);
        };
        use std::io::Write;
        let mut file = file;
        file.write_all(&chunk)?;
        file.flush()?;
        let stat = rustix::fs::fstat(&file)?;
        Ok(stat.st_size as u64)
    }

    async fn commit_upload(&self, id: &str, expected: &Digest) -> Result<Descriptor, DriverError> {
        let Some(mut file) = openat_upload(&self.uploads, id, OFlags::RDONLY)? else {
            return Err(DriverError::NotFound);
        };
        // hash incrementally, uploads can be large
        use std::io::Read;
        let mut hasher = Sha256::new();
        let mut size: u64 = 0;
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            size += n as u64;
            hasher.update(&buf[..n]);
        }
        drop(file);
        let ok = match expected.algorithm() {
            oci_spec::image::DigestAlgorithm::Sha256 => digest_eq(expected.digest(), hasher),
            // non-sha256 uploads are rare enough that re-reading is fine
            _ => match openat_upload(&self.uploads, id, OFlags::RDONLY)? {
                Some(mut file) => {
                    let mut data = Vec::new();
                    file.read_to_end(&mut data)?;
                    verify_payload(expected, &data).is_ok()
                }
                None => false,
            },
        };
        if !ok {
            return Err(DriverError::Digest(sroci::digest::Error::DigestMismatch));
        }
        let key = DigestKey::try_from(expected)?;
        ensure_algo_dir(&self.blobs, &key)?;
        rustix::fs::renameat(&self.uploads, id, &self.blobs, key.as_path())?;
        Ok(Descriptor::new(OCTET_STREAM.into(), size, expected.clone()))
    }

    async fn cancel_upload(&self, id: &str) -> Result<(), DriverError> {
        if id.contains('/') || id.contains("..") {
            return Err(DriverError::BadPath(id.to_string()));
        }
        match rustix::fs::unlinkat(&self.uploads, id, AtFlags::empty()) {
            Ok(()) => Ok(()),
            Err(e) if e == Errno::NOENT => Err(DriverError::NotFound),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ManifestStore for FsDriver {
    async fn get_manifest(&self, digest: &Digest) -> Result<(String, Bytes), DriverError> {
        let key = DigestKey::try_from(digest)?;
        let Some(payload) = Self::read_file(&self.manifests, &key)? else {
            return Err(DriverError::NotFound);
        };
        let media_type = Self::read_file(&self.manifests, &key.with_suffix("_type"))?
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .unwrap_or_else(|| OCTET_STREAM.to_string());
        Ok((media_type, Bytes::from(payload)))
    }

    async fn put_manifest(
        &self,
        digest: &Digest,
        media_type: &str,
        payload: Bytes,
    ) -> Result<(), DriverError> {
        let key = DigestKey::try_from(digest)?;
        ensure_algo_dir(&self.manifests, &key)?;
        Self::write_file(&self.manifests, &key, &payload)?;
        Self::write_file(
            &self.manifests,
            &key.with_suffix("_type"),
            media_type.as_bytes(),
        )?;
        Ok(())
    }

    async fn delete_manifest(&self, digest: &Digest) -> Result<(), DriverError> {
        let key = DigestKey::try_from(digest)?;
        match unlinkat(&self.manifests, &key) {
            Ok(()) => {}
            Err(e) if e == Errno::NOENT => return Err(DriverError::NotFound),
            Err(e) => return Err(e.into()),
        }
        let _ = unlinkat(&self.manifests, &key.with_suffix("_type"));
        Ok(())
    }
}

#[async_trait]
impl LinkStore for FsDriver {
    async fn link(&self, repo: &str, kind: LinkKind, digest: &Digest) -> Result<(), DriverError> {
        let dir = self.link_dir(repo, kind)?;
        let key = DigestKey::try_from(digest)?;
        ensure_algo_dir(&dir, &key)?;
        let fd = rustix::fs::openat2(
            &dir,
            key.as_path(),
            OFlags::WRONLY | OFlags::CREATE | OFlags::CLOEXEC,
            Mode::from_bits_truncate(0o644),
            ResolveFlags::BENEATH,
        )?;
        drop(fd);
        Ok(())
    }

    async fn unlink(
        &self,
        repo: &str,
        kind: LinkKind,
        digest: &Digest,
    ) -> Result<(), DriverError> {
        let dir = self.link_dir(repo, kind)?;
        let key = DigestKey::try_from(digest)?;
        match unlinkat(&dir, &key) {
            Ok(()) => Ok(()),
            Err(e) if e == Errno::NOENT => Err(DriverError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    async fn linked(
        &self,
        repo: &str,
        kind: LinkKind,
        digest: &Digest,
    ) -> Result<bool, DriverError> {
        let dir = self.link_dir(repo, kind)?;
        let key = DigestKey::try_from(digest)?;
        match rustix::fs::statat(&dir, key.as_path(), AtFlags::empty()) {
            Ok(_) => Ok(true),
            Err(e) if e == Errno::NOENT => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn links(&self, repo: &str, kind: LinkKind) -> Result<Vec<Digest>, DriverError> {
        let dir = self.link_dir(repo, kind)?;
        let mut acc = Vec::new();
        read_digest_tree(&dir, |key, _size| {
            if let Ok(d) = parse_digest(&key.0) {
                acc.push(d);
            }
        })?;
        Ok(acc)
    }
}

#[async_trait]
impl Walker for FsDriver {
    async fn all_blobs(&self) -> Result<Vec<(Digest, u64)>, DriverError> {
        let mut acc = Vec::new();
        read_digest_tree(&self.blobs, |key, size| {
            if let Ok(d) = parse_digest(&key.0) {
                acc.push((d, size));
            }
        })?;
        Ok(acc)
    }

    async fn all_repositories(&self) -> Result<Vec<String>, DriverError> {
        let mut acc = Vec::new();
        let root = self.root.join("repositories");
        walk_repositories(&root, String::new(), &mut acc)?;
        Ok(acc)
    }
}

// a repository is any directory under repositories/ that has a _layers or
// _manifests child; everything above it is namespace nesting
fn walk_repositories(
    dir: &std::path::Path,
    prefix: String,
    acc: &mut Vec<String>,
) -> Result<(), DriverError> {
    let mut is_repo = false;
    let mut subdirs = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == "_layers" || name == "_manifests" {
            is_repo = true;
        } else if !name.starts_with('_') {
            subdirs.push(name);
        }
    }
    if is_repo && !prefix.is_empty() {
        acc.push(prefix.clone());
    }
    for name in subdirs {
        let child_prefix = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{}/{}", prefix, name)
        };
        walk_repositories(&dir.join(&name), child_prefix, acc)?;
    }
    Ok(())
}

// we only care about reading two levels deep
fn read_digest_tree(dir: &OwnedFd, mut f: impl FnMut(DigestKey, u64)) -> Result<(), Errno> {
    let mut dir_reader = Dir::read_from(dir)?;
    dir_reader.rewind();
    while let Some(entry_dir) = dir_reader.read() {
        let entry_dir = entry_dir?;
        if entry_dir.file_name() == c"." || entry_dir.file_name() == c".." {
            continue;
        }
        if entry_dir.file_type() != FileType::Directory {
            continue;
        }
        let sub_dir = rustix::fs::openat(
            dir,
            entry_dir.file_name(),
            OFlags::DIRECTORY | OFlags::RDONLY | OFlags::CLOEXEC,
            Mode::empty(),
        )?;
        let mut sub_dir_reader = Dir::read_from(&sub_dir)?;
        while let Some(entry_file) = sub_dir_reader.read() {
            let entry_file = entry_file?;
            if entry_file.file_name() == c"." || entry_file.file_name() == c".." {
                continue;
            }
            if let Some(key) =
                DigestKey::from_cstr_parts(entry_dir.file_name(), entry_file.file_name())
            {
                let stat = rustix::fs::statat(&sub_dir, entry_file.file_name(), AtFlags::empty())?;
                f(key, stat.st_size as u64);
            } else {
                error!(
                    "got weird path {:?} {:?}",
                    entry_dir.file_name(),
                    entry_file.file_name()
                );
            }
        }
    }
    Ok(())
}

fn open_or_create_dir_at(
    dir: Option<&OwnedFd>,
    path: impl rustix::path::Arg + Copy,
) -> Result<OwnedFd, Errno> {
    if let Some(dir) = dir {
        match rustix::fs::mkdirat(dir, path, Mode::from_bits_truncate(0o755)) {
            Ok(_) => Ok(()),
            Err(e) if e == Errno::EXIST => Ok(()),
            e => e,
        }?;
        rustix::fs::openat2(
            dir,
            path,
            OFlags::DIRECTORY | OFlags::RDONLY | OFlags::CLOEXEC,
            Mode::empty(),
            ResolveFlags::BENEATH,
        )
    } else {
        match rustix::fs::mkdir(path, Mode::from_bits_truncate(0o755)) {
            Ok(_) => Ok(()),
            Err(e) if e == Errno::EXIST => Ok(()),
            e => e,
        }?;
        rustix::fs::open(
            path,
            OFlags::DIRECTORY | OFlags::RDONLY | OFlags::CLOEXEC,
            Mode::empty(),
        )
    }
}

fn mkdirat_recursive(dir: &OwnedFd, path: &str) -> Result<OwnedFd, DriverError> {
    let mut current = dir.try_clone().map_err(std::io::Error::from)?;
    for seg in path.split('/') {
        current = open_or_create_dir_at(Some(&current), seg)?;
    }
    Ok(current)
}

fn ensure_algo_dir(dir: &OwnedFd, key: &DigestKey) -> Result<(), Errno> {
    match rustix::fs::mkdirat(dir, key.parts().0, Mode::from_bits_truncate(0o755)) {
        Ok(()) => Ok(()),
        Err(e) if e == Errno::EXIST => Ok(()),
        Err(e) => Err(e),
    }
}

fn openat_create_write(dir: &OwnedFd, key: &DigestKey) -> Result<std::fs::File, Errno> {
    let fd = rustix::fs::openat2(
        dir,
        key.as_path(),
        OFlags::RDWR | OFlags::CREATE | OFlags::TRUNC | OFlags::CLOEXEC,
        Mode::from_bits_truncate(0o644),
        ResolveFlags::BENEATH,
    )?;
    Ok(fd.into())
}

fn openat_read(
    dir: &OwnedFd,
    name: impl rustix::path::Arg,
) -> Result<Option<std::fs::File>, Errno> {
    match rustix::fs::openat2(
        dir,
        name,
        OFlags::RDONLY | OFlags::CLOEXEC,
        Mode::empty(),
        ResolveFlags::BENEATH,
    ) {
        Ok(f) => Ok(Some(f.into())),
        Err(e) if e == Errno::NOENT => Ok(None),
        Err(e) => Err(e),
    }
}

fn openat_upload(
    dir: &OwnedFd,
    id: &str,
    flags: OFlags,
) -> Result<Option<std::fs::File>, DriverError> {
    if id.contains('/') || id.contains("..") {
        return Err(DriverError::BadPath(id.to_string()));
    }
    match rustix::fs::openat2(
        dir,
        id,
        flags | OFlags::CLOEXEC,
        Mode::empty(),
        ResolveFlags::BENEATH,
    ) {
        Ok(f) => Ok(Some(f.into())),
        Err(e) if e == Errno::NOENT => Ok(None),
        Err(e) => Err(e.into()),
    }
}

// wish there was unlinkat2 with BENEATH
fn unlinkat(dir: &OwnedFd, key: &DigestKey) -> Result<(), Errno> {
    rustix::fs::unlinkat(dir, key.as_path(), AtFlags::empty())
}
