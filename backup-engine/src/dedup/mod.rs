//! Content-addressed chunk store with reference counting.
//!
//! Files are split into fixed-size chunks keyed by their SHA-256 digest.
//! Each unique chunk is stored once as `<digest>.chunk`; `refcount.index`
//! tracks how many stored file occurrences reference it. A chunk file exists
//! exactly while its count is positive.
//!
//! All mutations of the reference table go through one mutex.

pub mod manifest;

pub use manifest::{ChunkManifest, ChunkRef, CHUNK_POINTER_SUFFIX};

use crate::config::DedupConfig;
use crate::utils::errors::{EngineError, Result};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

const INDEX_FILE: &str = "refcount.index";
const CHUNK_EXTENSION: &str = "chunk";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Compression {
    None,
    Zstd(i32),
}

/// Outcome of reassembling a file from its chunks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetrieveReport {
    pub bytes_written: u64,
    /// Digests that were absent and left as zero-filled holes (best-effort mode only)
    pub missing: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupStats {
    pub unique_chunks: usize,
    pub total_references: u64,
    pub stored_bytes: u64,
}

pub struct DedupStore {
    root: PathBuf,
    chunk_size: usize,
    compression: Compression,
    best_effort: bool,
    refs: Mutex<BTreeMap<String, u64>>,
}

impl DedupStore {
    /// Open (or create) the store at `root` and load its reference table.
    pub fn open(root: impl Into<PathBuf>, config: &DedupConfig) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;

        let compression = match config.compression.as_str() {
            "none" => Compression::None,
            _ => Compression::Zstd(config.compression_level),
        };

        let store = Self {
            root,
            chunk_size: config.chunk_size.max(1),
            compression,
            best_effort: config.best_effort_retrieval,
            refs: Mutex::new(BTreeMap::new()),
        };
        store.load_index()?;
        Ok(store)
    }

    fn load_index(&self) -> Result<()> {
        let mut indexed = BTreeMap::new();
        let index_path = self.root.join(INDEX_FILE);
        if index_path.exists() {
            for line in std::fs::read_to_string(&index_path)?.lines() {
                let Some((digest, count)) = line.split_once(':') else {
                    continue;
                };
                match count.trim().parse::<u64>() {
                    Ok(count) if count > 0 => {
                        indexed.insert(digest.to_string(), count);
                    }
                    _ => warn!(line = %line, "Ignoring malformed refcount entry"),
                }
            }
        }

        let mut refs = BTreeMap::new();
        for entry in std::fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CHUNK_EXTENSION) {
                continue;
            }
            let Some(digest) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            // Chunks on disk without an index entry are assumed referenced once
            let count = indexed.get(digest).copied().unwrap_or(1);
            refs.insert(digest.to_string(), count);
        }

        let stale = indexed.keys().filter(|d| !refs.contains_key(*d)).count();
        if stale > 0 {
            warn!(stale, "Dropping refcount entries without chunk files");
        }

        info!(
            chunks = refs.len(),
            root = %self.root.display(),
            "Loaded dedup store"
        );
        *self.lock_refs() = refs;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn chunk_path(&self, digest: &str) -> PathBuf {
        chunk_path_in(&self.root, digest)
    }

    fn lock_refs(&self) -> MutexGuard<'_, BTreeMap<String, u64>> {
        self.refs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Split `path` into chunks, storing each unique chunk once and
    /// incrementing its reference count per occurrence.
    pub fn store_file(&self, path: &Path) -> Result<ChunkManifest> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut refs = self.lock_refs();
        let mut manifest = ChunkManifest::default();

        let outcome = self.store_chunks(&mut reader, &mut refs, &mut manifest);
        if let Err(e) = outcome {
            // Roll back the references this call already took
            self.release(&mut refs, manifest.digests());
            self.persist_index(&refs)?;
            return Err(e);
        }

        self.persist_index(&refs)?;
        debug!(
            path = %path.display(),
            chunks = manifest.chunks.len(),
            bytes = manifest.total_size,
            "Stored file in dedup store"
        );
        Ok(manifest)
    }

    fn store_chunks<R: Read>(
        &self,
        reader: &mut R,
        refs: &mut BTreeMap<String, u64>,
        manifest: &mut ChunkManifest,
    ) -> Result<()> {
        let mut buf = Vec::with_capacity(self.chunk_size);
        loop {
            buf.clear();
            let read = reader.by_ref().take(self.chunk_size as u64).read_to_end(&mut buf)?;
            if read == 0 {
                break;
            }

            let digest = sha256_hex(&buf);
            let count = refs.get(&digest).copied().unwrap_or(0);
            let chunk_path = self.chunk_path(&digest);
            if count == 0 || !chunk_path.exists() {
                crate::fs::write_atomic(&chunk_path, &self.encode(&buf)?)?;
            }
            refs.insert(digest.clone(), count + 1);
            manifest.push(digest, read as u64);
        }
        Ok(())
    }

    /// Reassemble a file from `manifest` into `output`.
    ///
    /// A missing chunk fails with [`EngineError::ChunkMissing`] unless the
    /// store is in best-effort mode, where the gap is left zero-filled and
    /// reported.
    pub fn retrieve_file(&self, manifest: &ChunkManifest, output: &Path) -> Result<RetrieveReport> {
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut tmp_name = output.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".partial");
        let tmp = output.with_file_name(tmp_name);

        let result = self.write_chunks(manifest, &tmp);
        match result {
            Ok(report) => {
                std::fs::rename(&tmp, output)?;
                Ok(report)
            }
            Err(e) => {
                let _ = std::fs::remove_file(&tmp);
                Err(e)
            }
        }
    }

    fn write_chunks(&self, manifest: &ChunkManifest, target: &Path) -> Result<RetrieveReport> {
        let file = File::create(target)?;
        let mut writer = BufWriter::new(file);
        let mut report = RetrieveReport::default();

        for chunk in &manifest.chunks {
            let data = match self.read_chunk(&chunk.digest) {
                Ok(data) => data,
                Err(EngineError::ChunkMissing { digest }) if self.best_effort => {
                    warn!(digest = %digest, offset = chunk.offset, "Chunk missing, leaving gap");
                    report.missing.push(digest);
                    continue;
                }
                Err(e) => return Err(e),
            };
            writer.seek(SeekFrom::Start(chunk.offset))?;
            writer.write_all(&data)?;
            report.bytes_written += data.len() as u64;
        }

        writer.flush()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.set_len(manifest.total_size)?;
        file.sync_all()?;
        Ok(report)
    }

    /// Read and verify one chunk payload.
    pub fn read_chunk(&self, digest: &str) -> Result<Vec<u8>> {
        read_chunk_at(&self.chunk_path(digest), digest)
    }

    /// Drop one reference per chunk occurrence in `manifest`. Returns the
    /// number of chunk files physically deleted.
    pub fn remove_file(&self, manifest: &ChunkManifest) -> Result<usize> {
        self.remove_files(std::slice::from_ref(manifest))
    }

    /// Release every manifest in one step. The new table is persisted before
    /// it replaces the live one, so a failed write leaves all counts as they
    /// were.
    pub fn remove_files(&self, manifests: &[ChunkManifest]) -> Result<usize> {
        let mut refs = self.lock_refs();
        let mut next = refs.clone();
        let freed = decrement(&mut next, manifests.iter().flat_map(|m| m.digests()));
        self.persist_index(&next)?;
        *refs = next;
        Ok(self.delete_chunk_files(&freed))
    }

    fn release<'a>(
        &self,
        refs: &mut BTreeMap<String, u64>,
        digests: impl Iterator<Item = &'a str>,
    ) -> usize {
        let freed = decrement(refs, digests);
        self.delete_chunk_files(&freed)
    }

    fn delete_chunk_files(&self, digests: &[String]) -> usize {
        let mut removed = 0;
        for digest in digests {
            match std::fs::remove_file(self.chunk_path(digest)) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(digest = %digest, error = %e, "Failed to delete chunk file"),
            }
        }
        removed
    }

    /// Copy the chunks referenced by `manifest` into `dest`, skipping any
    /// already present. Returns the number copied.
    pub fn export_chunks(&self, manifest: &ChunkManifest, dest: &Path) -> Result<usize> {
        std::fs::create_dir_all(dest)?;
        let mut copied = 0;
        for digest in manifest.digests() {
            let target = chunk_path_in(dest, digest);
            if target.exists() {
                continue;
            }
            let source = self.chunk_path(digest);
            if !source.exists() {
                return Err(EngineError::ChunkMissing {
                    digest: digest.to_string(),
                });
            }
            std::fs::copy(&source, &target)?;
            copied += 1;
        }
        Ok(copied)
    }

    /// Take references for every manifest, pulling absent chunks from
    /// `source`. All or nothing: on failure no reference is taken and chunk
    /// files copied in by this call are removed again. Returns the number of
    /// chunk files copied in.
    pub fn import_chunks(&self, manifests: &[ChunkManifest], source: &Path) -> Result<usize> {
        let mut refs = self.lock_refs();
        let mut next = refs.clone();
        let mut copied: Vec<String> = Vec::new();

        let outcome = self
            .pull_references(manifests, source, &mut next, &mut copied)
            .and_then(|()| self.persist_index(&next));

        if let Err(e) = outcome {
            self.delete_chunk_files(&copied);
            return Err(e);
        }

        *refs = next;
        Ok(copied.len())
    }

    fn pull_references(
        &self,
        manifests: &[ChunkManifest],
        source: &Path,
        refs: &mut BTreeMap<String, u64>,
        copied: &mut Vec<String>,
    ) -> Result<()> {
        for digest in manifests.iter().flat_map(|m| m.digests()) {
            let local = self.chunk_path(digest);
            if !local.exists() {
                let payload = read_chunk_raw_verified(&chunk_path_in(source, digest), digest)?;
                crate::fs::write_atomic(&local, &payload)?;
                copied.push(digest.to_string());
            }
            *refs.entry(digest.to_string()).or_insert(0) += 1;
        }
        Ok(())
    }

    pub fn ref_count(&self, digest: &str) -> u64 {
        self.lock_refs().get(digest).copied().unwrap_or(0)
    }

    pub fn contains(&self, digest: &str) -> bool {
        self.chunk_path(digest).exists()
    }

    /// Number of chunk files currently on disk.
    pub fn unique_chunks(&self) -> Result<usize> {
        let mut count = 0;
        for entry in std::fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(CHUNK_EXTENSION) {
                count += 1;
            }
        }
        Ok(count)
    }

    pub fn stats(&self) -> Result<DedupStats> {
        let refs = self.lock_refs();
        let mut stored_bytes = 0;
        for digest in refs.keys() {
            if let Ok(meta) = std::fs::metadata(self.chunk_path(digest)) {
                stored_bytes += meta.len();
            }
        }
        Ok(DedupStats {
            unique_chunks: self.unique_chunks()?,
            total_references: refs.values().sum(),
            stored_bytes,
        })
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self.compression {
            Compression::None => Ok(data.to_vec()),
            Compression::Zstd(level) => {
                let compressed = zstd::encode_all(data, level)?;
                // Incompressible chunks are kept raw
                if compressed.len() < data.len() {
                    Ok(compressed)
                } else {
                    Ok(data.to_vec())
                }
            }
        }
    }

    fn persist_index(&self, refs: &BTreeMap<String, u64>) -> Result<()> {
        let mut content = String::new();
        for (digest, count) in refs {
            content.push_str(digest);
            content.push(':');
            content.push_str(&count.to_string());
            content.push('\n');
        }
        crate::fs::write_atomic(&self.root.join(INDEX_FILE), content.as_bytes())?;
        Ok(())
    }
}

/// Drop one reference per digest. Returns the digests whose count reached zero.
fn decrement<'a>(refs: &mut BTreeMap<String, u64>, digests: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut freed = Vec::new();
    for digest in digests {
        match refs.get_mut(digest) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                refs.remove(digest);
                freed.push(digest.to_string());
            }
            None => warn!(digest = %digest, "Release of unreferenced chunk ignored"),
        }
    }
    freed
}

fn chunk_path_in(root: &Path, digest: &str) -> PathBuf {
    root.join(format!("{digest}.{CHUNK_EXTENSION}"))
}

pub(crate) fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn read_chunk_raw_verified(path: &Path, digest: &str) -> Result<Vec<u8>> {
    // Verify before accepting, but keep the stored encoding
    let raw = read_raw(path, digest)?;
    decode_verified(&raw, digest)?;
    Ok(raw)
}

fn read_chunk_at(path: &Path, digest: &str) -> Result<Vec<u8>> {
    let raw = read_raw(path, digest)?;
    decode_verified(&raw, digest)
}

fn read_raw(path: &Path, digest: &str) -> Result<Vec<u8>> {
    match std::fs::read(path) {
        Ok(raw) => Ok(raw),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(EngineError::ChunkMissing {
            digest: digest.to_string(),
        }),
        Err(e) => Err(e.into()),
    }
}

fn decode_verified(raw: &[u8], digest: &str) -> Result<Vec<u8>> {
    if sha256_hex(raw) == digest {
        return Ok(raw.to_vec());
    }
    if let Ok(decoded) = zstd::decode_all(raw) {
        if sha256_hex(&decoded) == digest {
            return Ok(decoded);
        }
    }
    Err(EngineError::ChunkCorrupt {
        digest: digest.to_string(),
    })
}
