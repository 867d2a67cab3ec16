//! Radix file array: bucketed append-only storage for pipeline stages.
//!
//! A `RadixFileArray` owns one directory per bucket under a stage directory.
//! Every worker process appends to its own file inside each bucket (named by
//! worker id), so concurrent workers never contend on a file; a consumer
//! reads a bucket by concatenating all files in its directory. Per-thread
//! `BucketWriter`s buffer whole records and flush under the bucket's file
//! lock, which keeps appends atomic at record boundaries.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};

use crate::error::PipelineError;
use crate::types::WireRecord;

/// Default per-radix buffer in a `BucketWriter`.
pub const DEFAULT_BUF_SIZE: usize = 4096;

// Appends go straight to the file descriptor: buffering lives in the
// per-thread `BucketWriter`, and an unbuffered append is visible to every
// other worker process the moment it returns, which the stage barriers
// rely on.
struct FileSlot {
    file: Option<File>,
    written: u64,
    rotation: u32,
}

/// A set of append-only bucket files shared by all threads of one worker.
pub struct RadixFileArray {
    base_dir: PathBuf,
    worker_id: i64,
    max_file_size: Option<u64>,
    extension: &'static str,
    slots: Vec<Mutex<FileSlot>>,
}

impl RadixFileArray {
    /// Create (or attach to) a radix file array with `count` buckets.
    ///
    /// `max_file_size` rotates a worker's file within a bucket once it grows
    /// past the limit; rotation only ever splits between whole appends.
    pub fn create(
        base_dir: impl Into<PathBuf>,
        count: usize,
        worker_id: i64,
        max_file_size: Option<u64>,
        extension: &'static str,
    ) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)
            .map_err(|e| PipelineError::io(&base_dir, "create stage dir", e))?;
        let mut slots = Vec::with_capacity(count);
        for radix in 0..count {
            let dir = base_dir.join(radix.to_string());
            fs::create_dir_all(&dir).map_err(|e| PipelineError::io(&dir, "create bucket", e))?;
            slots.push(Mutex::new(FileSlot {
                file: None,
                written: 0,
                rotation: 0,
            }));
        }
        Ok(RadixFileArray {
            base_dir,
            worker_id,
            max_file_size,
            extension,
            slots,
        })
    }

    pub fn count(&self) -> usize {
        self.slots.len()
    }

    /// Ordered list of bucket directories.
    pub fn buckets(&self) -> Vec<PathBuf> {
        (0..self.slots.len())
            .map(|r| self.base_dir.join(r.to_string()))
            .collect()
    }

    /// Append `bytes` to bucket `radix`. Called with whole records only.
    pub fn append(&self, radix: usize, bytes: &[u8]) -> Result<()> {
        let mut slot = self.slots[radix].lock().unwrap();
        if let Some(max) = self.max_file_size {
            if slot.file.is_some() && slot.written > 0 && slot.written + bytes.len() as u64 > max
            {
                slot.file = None;
                slot.rotation += 1;
                slot.written = 0;
            }
        }
        if slot.file.is_none() {
            let path = self.file_path(radix, slot.rotation);
            let file = OpenOptions::new()
                .append(true)
                .create(true)
                .open(&path)
                .map_err(|e| PipelineError::io(&path, "open bucket file", e))?;
            slot.file = Some(file);
        }
        slot.file
            .as_mut()
            .unwrap()
            .write_all(bytes)
            .map_err(|e| PipelineError::io(&self.base_dir, "append bucket", e))?;
        slot.written += bytes.len() as u64;
        Ok(())
    }

    /// Close every bucket file, returning the bucket directories.
    pub fn close(self) -> Result<Vec<PathBuf>> {
        let buckets = self.buckets();
        for slot in &self.slots {
            let mut slot = slot.lock().unwrap();
            slot.file = None;
        }
        Ok(buckets)
    }

    fn file_path(&self, radix: usize, rotation: u32) -> PathBuf {
        let dir = self.base_dir.join(radix.to_string());
        if rotation == 0 {
            dir.join(format!("{}.{}", self.worker_id, self.extension))
        } else {
            dir.join(format!("{}.{}.{}", self.worker_id, rotation, self.extension))
        }
    }
}

/// Per-thread buffered writer over a `RadixFileArray`.
///
/// Records accumulate in a per-radix buffer that is handed to the shared
/// array once it fills. Buffers always contain whole records, so flushes
/// never split an entry across a lock release.
pub struct BucketWriter<'a> {
    files: &'a RadixFileArray,
    bufs: Vec<Vec<u8>>,
    capacity: usize,
}

impl<'a> BucketWriter<'a> {
    pub fn new(files: &'a RadixFileArray, capacity: usize) -> Self {
        let bufs = (0..files.count()).map(|_| Vec::new()).collect();
        BucketWriter {
            files,
            bufs,
            capacity,
        }
    }

    pub fn write<T: WireRecord>(&mut self, radix: usize, record: &T) -> Result<()> {
        record.write_to(&mut self.bufs[radix]);
        if self.bufs[radix].len() >= self.capacity {
            self.flush_radix(radix)?;
        }
        Ok(())
    }

    /// Append a raw byte run (a formatted sequence record, for the chunk
    /// materializer) that must stay contiguous in the output.
    pub fn write_bytes(&mut self, radix: usize, bytes: &[u8]) -> Result<()> {
        self.bufs[radix].extend_from_slice(bytes);
        if self.bufs[radix].len() >= self.capacity {
            self.flush_radix(radix)?;
        }
        Ok(())
    }

    fn flush_radix(&mut self, radix: usize) -> Result<()> {
        if !self.bufs[radix].is_empty() {
            self.files.append(radix, &self.bufs[radix])?;
            self.bufs[radix].clear();
        }
        Ok(())
    }

    /// Flush all remaining buffers. Must be called before the writer is
    /// dropped on the success path; `Drop` only covers the error path.
    pub fn finish(mut self) -> Result<()> {
        self.flush_all()
    }

    fn flush_all(&mut self) -> Result<()> {
        for radix in 0..self.bufs.len() {
            self.flush_radix(radix)?;
        }
        Ok(())
    }
}

impl Drop for BucketWriter<'_> {
    fn drop(&mut self) {
        if self.bufs.iter().any(|b| !b.is_empty()) {
            if let Err(e) = self.flush_all() {
                log::warn!("bucket writer flush on drop failed: {e:#}");
            }
        }
    }
}

/// Files of one bucket, sorted by name so every consumer sees the same order.
pub fn bucket_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let entries =
        fs::read_dir(dir).map_err(|e| PipelineError::io(dir, "read bucket dir", e))?;
    for entry in entries {
        let entry = entry.map_err(|e| PipelineError::io(dir, "read bucket dir", e))?;
        if entry
            .file_type()
            .map_err(|e| PipelineError::io(dir, "stat bucket file", e))?
            .is_file()
        {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Concatenated raw content of a bucket.
pub fn read_bucket_bytes(dir: &Path) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    for path in bucket_files(dir)? {
        let mut f =
            File::open(&path).map_err(|e| PipelineError::io(&path, "open bucket file", e))?;
        f.read_to_end(&mut data)
            .map_err(|e| PipelineError::io(&path, "read bucket file", e))?;
    }
    Ok(data)
}

/// Decode a whole bucket into records, validating the stream length.
pub fn load_records<T: WireRecord>(dir: &Path) -> Result<Vec<T>> {
    let data = read_bucket_bytes(dir)?;
    decode_records(&data, dir)
}

pub fn decode_records<T: WireRecord>(data: &[u8], origin: &Path) -> Result<Vec<T>> {
    if data.len() % T::WIRE_SIZE != 0 {
        return Err(PipelineError::format(
            origin,
            format!(
                "truncated record stream: {} bytes is not a multiple of {}",
                data.len(),
                T::WIRE_SIZE
            ),
        )
        .into());
    }
    Ok(data.chunks_exact(T::WIRE_SIZE).map(T::read_from).collect())
}

/// Delete the data files of a consumed bucket, keeping the directory.
pub fn remove_bucket_files(dir: &Path) -> Result<()> {
    for path in bucket_files(dir)? {
        fs::remove_file(&path)
            .with_context(|| format!("removing consumed bucket file {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SeedEntry;
    use tempfile::tempdir;

    #[test]
    fn test_roundtrip_multiset() -> Result<()> {
        let dir = tempdir()?;
        let rfa = RadixFileArray::create(dir.path().join("stage"), 4, 0, None, "bin")?;

        let mut writer = BucketWriter::new(&rfa, 64);
        let mut expected: Vec<Vec<SeedEntry>> = vec![Vec::new(); 4];
        for i in 0..100i64 {
            let radix = (i % 4) as usize;
            let rec = SeedEntry::new(i as u64 * 31, i, 100 + i as i32);
            writer.write(radix, &rec)?;
            expected[radix].push(rec);
        }
        writer.finish()?;
        let buckets = rfa.close()?;

        for (radix, bucket) in buckets.iter().enumerate() {
            let mut got: Vec<SeedEntry> = load_records(bucket)?;
            got.sort();
            let mut want = expected[radix].clone();
            want.sort();
            assert_eq!(got, want);
        }
        Ok(())
    }

    #[test]
    fn test_two_writers_concatenate() -> Result<()> {
        let dir = tempdir()?;
        let base = dir.path().join("stage");
        let a = RadixFileArray::create(&base, 2, 0, None, "bin")?;
        let b = RadixFileArray::create(&base, 2, 1, None, "bin")?;

        let mut wa = BucketWriter::new(&a, 16);
        let mut wb = BucketWriter::new(&b, 16);
        for i in 0..10i64 {
            wa.write(0, &SeedEntry::new(i as u64, i, 1))?;
            wb.write(0, &SeedEntry::new(1000 + i as u64, i, 1))?;
        }
        wa.finish()?;
        wb.finish()?;
        a.close()?;
        let buckets = b.close()?;

        let got: Vec<SeedEntry> = load_records(&buckets[0])?;
        assert_eq!(got.len(), 20);
        Ok(())
    }

    #[test]
    fn test_rotation_respects_max_file_size() -> Result<()> {
        let dir = tempdir()?;
        let base = dir.path().join("stage");
        // 100 bytes per file, 20-byte records: 5 records per file.
        let rfa = RadixFileArray::create(&base, 1, 0, Some(100), "bin")?;
        let mut w = BucketWriter::new(&rfa, SeedEntry::WIRE_SIZE); // flush every record
        for i in 0..12i64 {
            w.write(0, &SeedEntry::new(i as u64, i, 1))?;
        }
        w.finish()?;
        let buckets = rfa.close()?;

        let files = bucket_files(&buckets[0])?;
        assert!(files.len() >= 2, "expected rotated files, got {files:?}");
        let got: Vec<SeedEntry> = load_records(&buckets[0])?;
        assert_eq!(got.len(), 12);
        Ok(())
    }

    #[test]
    fn test_truncated_stream_is_an_error() {
        let dir = tempdir().unwrap();
        let bucket = dir.path().join("0");
        fs::create_dir_all(&bucket).unwrap();
        fs::write(bucket.join("0.bin"), [0u8; 7]).unwrap();
        assert!(load_records::<SeedEntry>(&bucket).is_err());
    }

    #[test]
    fn test_empty_bucket_loads_empty() -> Result<()> {
        let dir = tempdir()?;
        let rfa = RadixFileArray::create(dir.path().join("stage"), 2, 0, None, "bin")?;
        let buckets = rfa.close()?;
        let got: Vec<SeedEntry> = load_records(&buckets[1])?;
        assert!(got.is_empty());
        Ok(())
    }
}
