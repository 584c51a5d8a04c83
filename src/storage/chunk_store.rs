//! Local chunk persistence with checksum sidecars.
//!
//! Each chunk lives in `<dir>/<filename>-chunk<N>` next to
//! `<filename>-chunk<N>.md5`, whose content is `"<checksum>  <chunk file>\n"`.
//! The pair is self-describing: the inventory can be rebuilt from the
//! directory alone, and every read re-hashes the bytes against the sidecar.

use crate::chunking::{chunk_file_name, parse_chunk_file_name, validate_filename};
use crate::error::{DfsError, Result};
use crate::observability;
use crate::types::{checksum, Chunk, ChunkKey, Inventory, SequenceNo};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

const SIDECAR_EXT: &str = "md5";
const TMP_EXT: &str = "tmp";

/// Chunks held by one storage node.
pub struct ChunkStore {
    dir: PathBuf,
    /// Verified chunks, keyed by filename then sequence number.
    chunks: RwLock<BTreeMap<String, BTreeMap<SequenceNo, Chunk>>>,
}

impl ChunkStore {
    /// Open (or create) a store, rebuilding the inventory from disk.
    ///
    /// Chunks whose bytes no longer match their sidecar, or that have no
    /// sidecar, are left on disk but not advertised.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let store = Self {
            dir,
            chunks: RwLock::new(BTreeMap::new()),
        };
        store.load_existing()?;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist a chunk received from a client or a peer.
    ///
    /// The bytes and the supplied checksum are always written, so nothing
    /// already on the wire is lost. If the bytes do not hash to `expected`,
    /// the chunk is not added to the inventory and `ChecksumMismatch` is
    /// returned; a later [`retrieve`](Self::retrieve) will report the same.
    pub fn store(
        &self,
        filename: &str,
        sequence_no: SequenceNo,
        data: &[u8],
        expected: &str,
    ) -> Result<Chunk> {
        validate_filename(filename)?;

        let name = chunk_file_name(filename, sequence_no);
        let path = self.dir.join(&name);
        let sidecar = sidecar_path(&path);

        write_atomic(&path, data)?;
        write_atomic(&sidecar, format!("{}  {}\n", expected, name).as_bytes())?;

        let actual = checksum(data);
        if actual != expected {
            self.forget(filename, sequence_no);
            observability::record_checksum_mismatch();
            warn!(
                filename,
                sequence_no,
                expected,
                actual = %actual,
                "Stored chunk does not match its checksum"
            );
            return Err(DfsError::ChecksumMismatch {
                expected: expected.to_string(),
                actual,
            });
        }

        let chunk = Chunk::new(filename, sequence_no, data.len() as u64, expected)
            .with_local_path(path);
        self.chunks
            .write()
            .entry(filename.to_string())
            .or_default()
            .insert(sequence_no, chunk.clone());

        observability::record_chunk_stored(data.len() as u64);
        debug!(filename, sequence_no, size = data.len(), "Stored chunk");

        Ok(chunk)
    }

    /// Read a chunk back, re-verifying it against its sidecar.
    ///
    /// Returns `ChunkNotFound` when the chunk is absent and
    /// `ChecksumMismatch` / `DataCorruption` when it is present but bad.
    pub fn retrieve(&self, filename: &str, sequence_no: SequenceNo) -> Result<(Chunk, Vec<u8>)> {
        validate_filename(filename)?;

        let key = ChunkKey::new(filename, sequence_no);
        let path = self.dir.join(chunk_file_name(filename, sequence_no));

        let data = fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DfsError::ChunkNotFound(key.to_string())
            } else {
                e.into()
            }
        })?;

        let expected = read_sidecar(&sidecar_path(&path))?
            .ok_or_else(|| DfsError::DataCorruption(format!("no checksum recorded for {}", key)))?;

        let chunk = Chunk::new(filename, sequence_no, data.len() as u64, expected)
            .with_local_path(path);

        if let Err(e) = chunk.verify(&data) {
            observability::record_checksum_mismatch();
            error!(chunk = %key, error = %e, "Chunk on disk is corrupted");
            return Err(e);
        }

        observability::record_chunk_served(data.len() as u64);
        Ok((chunk, data))
    }

    /// Whether a verified copy of the chunk is advertised.
    pub fn contains(&self, filename: &str, sequence_no: SequenceNo) -> bool {
        self.chunks
            .read()
            .get(filename)
            .is_some_and(|seqs| seqs.contains_key(&sequence_no))
    }

    /// Snapshot of every advertised chunk, for heartbeats.
    pub fn inventory(&self) -> Inventory {
        self.chunks
            .read()
            .iter()
            .map(|(filename, seqs)| (filename.clone(), seqs.keys().copied().collect()))
            .collect()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.read().values().map(|seqs| seqs.len()).sum()
    }

    /// Bytes available to unprivileged writers on the store's filesystem.
    pub fn free_space(&self) -> Result<u64> {
        available_space(&self.dir)
    }

    fn forget(&self, filename: &str, sequence_no: SequenceNo) {
        let mut chunks = self.chunks.write();
        if let Some(seqs) = chunks.get_mut(filename) {
            seqs.remove(&sequence_no);
            if seqs.is_empty() {
                chunks.remove(filename);
            }
        }
    }

    fn load_existing(&self) -> Result<()> {
        let mut loaded = 0usize;

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            if path.extension().is_some_and(|ext| ext == TMP_EXT) {
                debug!(path = %path.display(), "Removing leftover temporary file");
                let _ = fs::remove_file(&path);
                continue;
            }

            let Some((filename, sequence_no)) = parse_chunk_file_name(name) else {
                continue;
            };

            match self.retrieve(&filename, sequence_no) {
                Ok((chunk, _)) => {
                    self.chunks
                        .write()
                        .entry(filename)
                        .or_default()
                        .insert(sequence_no, chunk);
                    loaded += 1;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unverifiable chunk");
                }
            }
        }

        info!(dir = %self.dir.display(), chunks = loaded, "Chunk store opened");
        Ok(())
    }
}

fn sidecar_path(chunk_path: &Path) -> PathBuf {
    let mut name = chunk_path.as_os_str().to_os_string();
    name.push(".");
    name.push(SIDECAR_EXT);
    PathBuf::from(name)
}

/// Read the checksum token from a sidecar file, if there is one.
fn read_sidecar(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(content.split_whitespace().next().map(str::to_string)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(".");
    tmp_name.push(TMP_EXT);
    let tmp_path = PathBuf::from(tmp_name);

    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(unix)]
fn available_space(path: &Path) -> Result<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| DfsError::InvalidArgument(format!("invalid path {}", path.display())))?;

    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) } != 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    #[allow(clippy::unnecessary_cast)]
    Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(not(unix))]
fn available_space(_path: &Path) -> Result<u64> {
    Err(DfsError::Internal(
        "free space query is only supported on unix".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_store_and_retrieve() {
        let dir = tempdir().unwrap();
        let store = ChunkStore::open(dir.path()).unwrap();

        let data = b"Hello, World!";
        let chunk = store.store("hello.txt", 0, data, &checksum(data)).unwrap();
        assert_eq!(chunk.size, 13);

        let (read_chunk, read_data) = store.retrieve("hello.txt", 0).unwrap();
        assert_eq!(read_data, data);
        assert_eq!(read_chunk.checksum, checksum(data));
        assert!(store.contains("hello.txt", 0));
    }

    #[test]
    fn test_sidecar_format() {
        let dir = tempdir().unwrap();
        let store = ChunkStore::open(dir.path()).unwrap();

        let data = b"abc";
        store.store("a.txt", 4, data, &checksum(data)).unwrap();

        let sidecar = fs::read_to_string(dir.path().join("a.txt-chunk4.md5")).unwrap();
        assert_eq!(sidecar, format!("{}  a.txt-chunk4\n", checksum(data)));
        assert_eq!(fs::read(dir.path().join("a.txt-chunk4")).unwrap(), data);
    }

    #[test]
    fn test_missing_chunk_is_not_found() {
        let dir = tempdir().unwrap();
        let store = ChunkStore::open(dir.path()).unwrap();

        let err = store.retrieve("nope", 0).unwrap_err();
        assert!(matches!(err, DfsError::ChunkNotFound(_)));
    }

    #[test]
    fn test_bit_flip_on_disk_detected() {
        let dir = tempdir().unwrap();
        let store = ChunkStore::open(dir.path()).unwrap();

        let data = vec![42u8; 4096];
        store.store("f", 0, &data, &checksum(&data)).unwrap();

        let path = dir.path().join("f-chunk0");
        let mut on_disk = fs::read(&path).unwrap();
        on_disk[1000] ^= 0x80;
        fs::write(&path, &on_disk).unwrap();

        let err = store.retrieve("f", 0).unwrap_err();
        assert!(matches!(err, DfsError::ChecksumMismatch { .. }));
        assert!(err.is_corruption());
    }

    #[test]
    fn test_mismatched_store_persists_but_reports() {
        let dir = tempdir().unwrap();
        let store = ChunkStore::open(dir.path()).unwrap();

        let data = b"payload";
        let err = store.store("f", 1, data, "0123456789abcdef").unwrap_err();
        assert!(matches!(err, DfsError::ChecksumMismatch { .. }));

        assert_eq!(fs::read(dir.path().join("f-chunk1")).unwrap(), data);
        assert!(!store.contains("f", 1));
        assert!(store.inventory().is_empty());
        assert!(store.retrieve("f", 1).is_err());
    }

    #[test]
    fn test_overwrite_with_bad_copy_withdraws_chunk() {
        let dir = tempdir().unwrap();
        let store = ChunkStore::open(dir.path()).unwrap();

        let good = b"good";
        store.store("f", 0, good, &checksum(good)).unwrap();
        assert!(store.contains("f", 0));

        assert!(store.store("f", 0, b"evil", &checksum(good)).is_err());
        assert!(!store.contains("f", 0));
    }

    #[test]
    fn test_missing_sidecar_is_corruption() {
        let dir = tempdir().unwrap();
        let store = ChunkStore::open(dir.path()).unwrap();

        let data = b"x";
        store.store("f", 0, data, &checksum(data)).unwrap();
        fs::remove_file(dir.path().join("f-chunk0.md5")).unwrap();

        let err = store.retrieve("f", 0).unwrap_err();
        assert!(matches!(err, DfsError::DataCorruption(_)));
    }

    #[test]
    fn test_inventory_groups_by_file() {
        let dir = tempdir().unwrap();
        let store = ChunkStore::open(dir.path()).unwrap();

        for (name, seq) in [("a", 2), ("a", 0), ("b", 5)] {
            let data = format!("{}{}", name, seq);
            store
                .store(name, seq, data.as_bytes(), &checksum(data.as_bytes()))
                .unwrap();
        }

        let inventory = store.inventory();
        assert_eq!(inventory.len(), 2);
        assert_eq!(inventory["a"].iter().copied().collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(inventory["b"].iter().copied().collect::<Vec<_>>(), vec![5]);
        assert_eq!(store.chunk_count(), 3);
    }

    #[test]
    fn test_reopen_rebuilds_inventory_and_skips_corrupt() {
        let dir = tempdir().unwrap();
        {
            let store = ChunkStore::open(dir.path()).unwrap();
            for seq in 0..3 {
                let data = vec![seq as u8; 100];
                store.store("file", seq, &data, &checksum(&data)).unwrap();
            }
        }

        fs::write(dir.path().join("file-chunk1"), b"tampered").unwrap();

        let store = ChunkStore::open(dir.path()).unwrap();
        assert!(store.contains("file", 0));
        assert!(!store.contains("file", 1));
        assert!(store.contains("file", 2));
    }

    #[test]
    fn test_rejects_path_traversal() {
        let dir = tempdir().unwrap();
        let store = ChunkStore::open(dir.path()).unwrap();

        let err = store.store("../escape", 0, b"x", &checksum(b"x")).unwrap_err();
        assert!(matches!(err, DfsError::InvalidArgument(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_free_space_reports_something() {
        let dir = tempdir().unwrap();
        let store = ChunkStore::open(dir.path()).unwrap();
        assert!(store.free_space().unwrap() > 0);
    }
}
