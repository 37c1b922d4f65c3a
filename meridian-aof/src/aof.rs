//! The append-only command log.
//!
//! The file is a bare concatenation of RESP-encoded command records. The
//! byte offset of a record in the *logical* stream is the replication
//! offset: `logical = base + position_in_file`. A freshly created log has
//! `base = 0`; after a shrink the file covers only a suffix of the logical
//! stream and records its own base as a fixed-width `REPLBASE` record at
//! position 0, so the log stays self-describing across rotation.
//!
//! Writers hold the store's write lock across `append` (and the fsync when
//! the policy demands one), so a successful reply implies the record
//! reached the OS buffer at minimum.

use crate::error::{AofError, Result};
use meridian_protocol::{decode_record, encode_array};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing::{info, warn};

/// Byte length of the fixed-width REPLBASE record.
const REPLBASE_RECORD_LEN: u64 = 45;

/// Offset of the 20 base-offset digits inside the REPLBASE record.
const REPLBASE_DIGITS_AT: u64 = 23;

fn replbase_record(base: u64) -> Vec<u8> {
    let rec = encode_array(&["REPLBASE".as_bytes(), format!("{base:020}").as_bytes()]);
    debug_assert_eq!(rec.len() as u64, REPLBASE_RECORD_LEN);
    rec
}

/// Durability policy for appends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FsyncPolicy {
    /// fsync after every record, inside the write lock.
    Always,
    /// fsync at most once per second from a background tick.
    #[default]
    EverySecond,
    /// Leave flushing entirely to the OS.
    Never,
}

impl FsyncPolicy {
    pub fn parse(s: &str) -> Option<FsyncPolicy> {
        Some(match s.to_ascii_lowercase().as_str() {
            "always" | "every-command" => FsyncPolicy::Always,
            "everysec" | "every-second" => FsyncPolicy::EverySecond,
            "never" | "no" => FsyncPolicy::Never,
            _ => return None,
        })
    }
}

/// Log position advertised to followers and the fence pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    /// Logical end offset (== replication offset of the next record).
    pub len: u64,
    /// Logical offset of file byte 0.
    pub base: u64,
    /// Bumped on every shrink rotation; tailing readers reopen on change.
    pub epoch: u64,
}

/// Writer half of the append-only log.
#[derive(Debug)]
pub struct Aof {
    path: PathBuf,
    file: File,
    base: u64,
    file_len: u64,
    policy: FsyncPolicy,
    dirty: bool,
    epoch: u64,
    shrinking: bool,
    progress: watch::Sender<Progress>,
}

impl Aof {
    /// Open (creating if absent) and replay the log. Every decoded record
    /// is handed to `apply` in file order. A torn record at the tail is
    /// discarded with a warning; anything else malformed aborts the open.
    pub fn open(
        path: impl Into<PathBuf>,
        policy: FsyncPolicy,
        mut apply: impl FnMut(Vec<Vec<u8>>),
    ) -> Result<Aof> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        let mut base = 0u64;
        let mut valid: u64 = 0;
        {
            let mut reader = File::open(&path)?;
            let mut buf: Vec<u8> = Vec::with_capacity(64 * 1024);
            let mut chunk = [0u8; 64 * 1024];
            let mut start = 0usize;
            let mut first = true;
            'outer: loop {
                loop {
                    match decode_record(&buf[start..]) {
                        Ok(Some((args, consumed))) => {
                            if first {
                                first = false;
                                if args.len() == 2 && args[0] == b"REPLBASE" {
                                    base = parse_base(&args[1], valid)?;
                                }
                            }
                            apply(args);
                            start += consumed;
                            valid += consumed as u64;
                        }
                        Ok(None) => break,
                        Err(e) => {
                            return Err(AofError::Corrupt {
                                offset: valid,
                                reason: e.to_string(),
                            })
                        }
                    }
                }
                buf.drain(..start);
                start = 0;
                let n = reader.read(&mut chunk)?;
                if n == 0 {
                    if !buf.is_empty() {
                        warn!(
                            path = %path.display(),
                            at = valid,
                            bytes = buf.len(),
                            "discarding torn record at aof tail"
                        );
                        file.set_len(valid)?;
                    }
                    break 'outer;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
        }

        let (progress, _) = watch::channel(Progress {
            len: base + valid,
            base,
            epoch: 0,
        });
        info!(path = %path.display(), len = base + valid, base, "aof opened");
        Ok(Aof {
            path,
            file,
            base,
            file_len: valid,
            policy,
            dirty: false,
            epoch: 0,
            shrinking: false,
            progress,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn policy(&self) -> FsyncPolicy {
        self.policy
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    /// Logical end offset; equal to the replication offset of the next
    /// record to be appended.
    pub fn logical_len(&self) -> u64 {
        self.base + self.file_len
    }

    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.progress.subscribe()
    }

    fn publish(&self) {
        self.progress.send_replace(Progress {
            len: self.logical_len(),
            base: self.base,
            epoch: self.epoch,
        });
    }

    /// Append one encoded record, returning the new logical end offset.
    /// A failed write truncates back to the last record boundary so the
    /// log never carries torn bytes.
    pub fn append(&mut self, record: &[u8]) -> Result<u64> {
        if let Err(e) = self.file.write_all(record) {
            let _ = self.file.set_len(self.file_len);
            return Err(e.into());
        }
        self.file_len += record.len() as u64;
        self.dirty = true;
        if self.policy == FsyncPolicy::Always {
            self.file.sync_data()?;
            self.dirty = false;
        }
        self.publish();
        Ok(self.logical_len())
    }

    /// Flush pending bytes to disk if any were written since the last sync.
    pub fn sync(&mut self) -> Result<()> {
        if self.dirty {
            self.file.sync_data()?;
            self.dirty = false;
        }
        Ok(())
    }

    /// Discard the file and restart it at `base`. Used by a follower when
    /// the leader answers a sync with a full state dump.
    pub fn reset(&mut self, base: u64) -> Result<()> {
        self.file.set_len(0)?;
        self.file.sync_data()?;
        self.base = base;
        self.file_len = 0;
        self.dirty = false;
        self.epoch += 1;
        self.publish();
        Ok(())
    }

    /// Start a shrink: creates the replacement file seeded with a
    /// placeholder REPLBASE record and pins the current logical offset as
    /// the snapshot point. Appends may continue; bytes past the snapshot
    /// point are the tail and get copied in at swap time.
    pub fn begin_shrink(&mut self) -> Result<ShrinkJob> {
        if self.shrinking {
            return Err(AofError::ShrinkInProgress);
        }
        let tmp_path = self.path.with_extension("shrink");
        let mut tmp = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        tmp.write_all(&replbase_record(0))?;
        self.shrinking = true;
        Ok(ShrinkJob {
            tmp,
            tmp_path,
            snapshot_len: self.logical_len(),
            bytes: REPLBASE_RECORD_LEN,
        })
    }

    pub fn abort_shrink(&mut self, job: ShrinkJob) {
        self.shrinking = false;
        drop(job.tmp);
        let _ = std::fs::remove_file(&job.tmp_path);
    }

    /// Swap in the shrunken file. Copies the tail (records appended since
    /// the snapshot), patches the REPLBASE record so the logical end offset
    /// is preserved, fsyncs, and atomically renames over the live log.
    pub fn finish_shrink(&mut self, mut job: ShrinkJob) -> Result<()> {
        let tail_pos = job.snapshot_len - self.base;
        let mut reader = File::open(&self.path)?;
        reader.seek(SeekFrom::Start(tail_pos))?;
        let copied = std::io::copy(&mut reader.take(self.file_len - tail_pos), &mut job.tmp)?;
        let tmp_len = job.bytes + copied;

        let logical_end = self.logical_len();
        let new_base = logical_end - tmp_len;
        job.tmp.seek(SeekFrom::Start(REPLBASE_DIGITS_AT))?;
        job.tmp.write_all(format!("{new_base:020}").as_bytes())?;
        job.tmp.sync_data()?;
        drop(job.tmp);

        std::fs::rename(&job.tmp_path, &self.path)?;
        self.file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        self.base = new_base;
        self.file_len = tmp_len;
        self.dirty = false;
        self.epoch += 1;
        self.shrinking = false;
        self.publish();
        info!(
            len = logical_end,
            base = new_base,
            file_bytes = tmp_len,
            "aof shrink complete"
        );
        Ok(())
    }
}

fn parse_base(digits: &[u8], offset: u64) -> Result<u64> {
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(AofError::Corrupt {
            offset,
            reason: "bad REPLBASE payload".into(),
        })
}

/// In-flight shrink state: the replacement file being written.
#[derive(Debug)]
pub struct ShrinkJob {
    tmp: File,
    tmp_path: PathBuf,
    snapshot_len: u64,
    bytes: u64,
}

impl ShrinkJob {
    pub fn append_record(&mut self, record: &[u8]) -> Result<()> {
        self.tmp.write_all(record)?;
        self.bytes += record.len() as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_protocol::encode_array;
    use tempfile::tempdir;

    fn rec(parts: &[&str]) -> Vec<u8> {
        encode_array(parts)
    }

    fn replay_all(path: &Path) -> Vec<Vec<String>> {
        let mut out = Vec::new();
        let _aof = Aof::open(path, FsyncPolicy::Never, |args| {
            out.push(
                args.iter()
                    .map(|a| String::from_utf8_lossy(a).to_string())
                    .collect(),
            );
        })
        .unwrap();
        out
    }

    #[test]
    fn append_and_replay_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("appendonly.aof");
        {
            let mut aof = Aof::open(&path, FsyncPolicy::Always, |_| {}).unwrap();
            aof.append(&rec(&["SET", "fleet", "bus1", "POINT", "33.5", "-115.5"]))
                .unwrap();
            aof.append(&rec(&["DEL", "fleet", "bus1"])).unwrap();
            assert_eq!(aof.base(), 0);
        }
        let records = replay_all(&path);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0][0], "SET");
        assert_eq!(records[1][0], "DEL");
    }

    #[test]
    fn torn_tail_is_discarded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("appendonly.aof");
        {
            let mut aof = Aof::open(&path, FsyncPolicy::Never, |_| {}).unwrap();
            aof.append(&rec(&["SET", "k", "a", "STRING", "x"])).unwrap();
            aof.sync().unwrap();
        }
        // Simulate a crash mid-append.
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"*3\r\n$3\r\nDEL\r\n$1").unwrap();
        drop(f);

        let records = replay_all(&path);
        assert_eq!(records.len(), 1);

        // The log stays appendable afterwards.
        let mut aof = Aof::open(&path, FsyncPolicy::Never, |_| {}).unwrap();
        let len = aof.logical_len();
        aof.append(&rec(&["DEL", "k", "a"])).unwrap();
        assert!(aof.logical_len() > len);
        assert_eq!(replay_all(&path).len(), 2);
    }

    #[test]
    fn shrink_preserves_logical_offset_and_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("appendonly.aof");
        let mut aof = Aof::open(&path, FsyncPolicy::Never, |_| {}).unwrap();
        for i in 0..100 {
            aof.append(&rec(&["SET", "k", "a", "STRING", &format!("v{i}")]))
                .unwrap();
        }
        let logical = aof.logical_len();

        // Minimal state: only the last value survives.
        let mut job = aof.begin_shrink().unwrap();
        job.append_record(&rec(&["SET", "k", "a", "STRING", "v99"]))
            .unwrap();
        // A concurrent append lands in the tail.
        aof.append(&rec(&["SET", "k", "b", "STRING", "tail"])).unwrap();
        let logical_after_tail = aof.logical_len();
        aof.finish_shrink(job).unwrap();

        assert_eq!(aof.logical_len(), logical_after_tail);
        assert!(aof.base() > 0);
        assert!(logical < logical_after_tail);

        let records = replay_all(&path);
        // REPLBASE + one SET + the tail record.
        assert_eq!(records.len(), 3);
        assert_eq!(records[0][0], "REPLBASE");
        assert_eq!(records[1][4], "v99");
        assert_eq!(records[2][4], "tail");

        // Reopen sees the same logical offset.
        drop(aof);
        let aof = Aof::open(&path, FsyncPolicy::Never, |_| {}).unwrap();
        assert_eq!(aof.logical_len(), logical_after_tail);
    }

    #[test]
    fn reset_restarts_at_base() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("appendonly.aof");
        let mut aof = Aof::open(&path, FsyncPolicy::Never, |_| {}).unwrap();
        aof.append(&rec(&["SET", "k", "a", "STRING", "x"])).unwrap();
        aof.reset(5000).unwrap();
        assert_eq!(aof.logical_len(), 5000);
        let len = aof.append(&rec(&["PING"])).unwrap();
        assert!(len > 5000);
    }
}
