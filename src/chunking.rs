//! Splitting files into chunks and reassembling them.
//!
//! Chunk files are named `<filename>-chunk<N>`, both in client scratch
//! directories and on storage nodes.

use crate::error::{DfsError, Result};
use crate::types::{checksum, Chunk, SequenceNo};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

const CHUNK_MARKER: &str = "-chunk";

/// File name for one chunk of `filename`.
pub fn chunk_file_name(filename: &str, sequence_no: SequenceNo) -> String {
    format!("{}{}{}", filename, CHUNK_MARKER, sequence_no)
}

/// Inverse of [`chunk_file_name`].
pub fn parse_chunk_file_name(name: &str) -> Option<(String, SequenceNo)> {
    let (filename, seq) = name.rsplit_once(CHUNK_MARKER)?;
    if filename.is_empty() || seq.is_empty() || !seq.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((filename.to_string(), seq.parse().ok()?))
}

/// Reject names that could escape a chunk directory.
pub fn validate_filename(filename: &str) -> Result<()> {
    if filename.is_empty()
        || filename == "."
        || filename == ".."
        || filename.contains('/')
        || filename.contains('\\')
        || filename.contains('\0')
    {
        return Err(DfsError::InvalidArgument(format!(
            "invalid file name '{}'",
            filename
        )));
    }
    Ok(())
}

/// Split `source` into chunks of at most `chunk_size` bytes under `out_dir`.
///
/// Chunks are named after `filename` (the name the file will carry in the
/// store), each with its checksum computed at creation. An empty source
/// yields one zero-length chunk.
pub fn split_file(
    source: &Path,
    filename: &str,
    chunk_size: usize,
    out_dir: &Path,
) -> Result<Vec<Chunk>> {
    validate_filename(filename)?;
    if chunk_size == 0 {
        return Err(DfsError::InvalidArgument("chunk size must be non-zero".into()));
    }
    fs::create_dir_all(out_dir)?;

    let mut input = File::open(source)?;
    let mut chunks = Vec::new();
    let mut buf = vec![0u8; chunk_size];

    loop {
        let n = read_full(&mut input, &mut buf)?;
        if n == 0 && !chunks.is_empty() {
            break;
        }

        let sequence_no = chunks.len() as SequenceNo;
        let data = &buf[..n];
        let path = out_dir.join(chunk_file_name(filename, sequence_no));
        fs::write(&path, data)?;

        chunks.push(
            Chunk::new(filename, sequence_no, n as u64, checksum(data)).with_local_path(path),
        );

        if n < chunk_size {
            break;
        }
    }

    debug!(filename, chunks = chunks.len(), chunk_size, "Split file into chunks");
    Ok(chunks)
}

/// Concatenate chunk files into `dest`, strictly by ascending sequence number.
///
/// Every chunk must carry a `local_path`. Sequence numbers must form the
/// contiguous range `0..n`; a gap would silently produce a truncated file.
/// Writes to a temporary file first so `dest` never holds a partial result.
/// Returns the number of bytes written.
pub fn reassemble(chunks: &[Chunk], dest: &Path) -> Result<u64> {
    let mut ordered: Vec<&Chunk> = chunks.iter().collect();
    ordered.sort();

    for (expected, chunk) in ordered.iter().enumerate() {
        if chunk.sequence_no as usize != expected {
            return Err(DfsError::InvalidArgument(format!(
                "missing chunk #{} of {}",
                expected, chunk.filename
            )));
        }
    }

    let tmp_path = temp_path(dest);
    let mut written = 0u64;
    {
        let mut out = File::create(&tmp_path)?;
        for chunk in &ordered {
            let path = chunk.local_path.as_ref().ok_or_else(|| {
                DfsError::Internal(format!("chunk {} has no local path", chunk.key()))
            })?;
            let data = fs::read(path)?;
            out.write_all(&data)?;
            written += data.len() as u64;
        }
        out.sync_all()?;
    }
    fs::rename(&tmp_path, dest)?;

    Ok(written)
}

/// Remove the local copies of `chunks`, ignoring ones already gone.
pub fn remove_local_copies(chunks: &[Chunk]) {
    for path in chunks.iter().filter_map(|c| c.local_path.as_ref()) {
        if let Err(e) = fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(path = %path.display(), error = %e, "Failed to remove chunk file");
            }
        }
    }
}

fn temp_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

/// Read until `buf` is full or EOF.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
