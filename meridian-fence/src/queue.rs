//! The durable outbound queue (`queue.db`).
//!
//! A single append-only file shared by all hooks. Two record kinds:
//! enqueued events carrying `(seq, hook, payload)` and ack tombstones
//! carrying `(seq)`. Pending state on restart is enqueues minus acks.
//! Every push and ack is fsynced before it is acknowledged to the caller,
//! which is what makes delivery at-least-once rather than at-most-once.
//!
//! When acked records dominate the file it is compacted: pending events
//! are rewritten to a fresh file which is atomically renamed over the old
//! one.

use crate::error::{FenceError, Result};
use std::collections::{BTreeMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const KIND_EVENT: u8 = 1;
const KIND_ACK: u8 = 2;

/// Compact only once the file passes this size.
const COMPACT_MIN_BYTES: u64 = 256 * 1024;

/// A pending event for one hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedEvent {
    pub seq: u64,
    pub payload: String,
    rec_len: u64,
}

#[derive(Debug)]
pub struct OutboundQueue {
    file: File,
    path: PathBuf,
    pending: BTreeMap<String, VecDeque<QueuedEvent>>,
    next_seq: u64,
    total_bytes: u64,
    live_bytes: u64,
}

fn event_record(seq: u64, hook: &str, payload: &str) -> Vec<u8> {
    let mut rec = Vec::with_capacity(15 + hook.len() + payload.len());
    rec.push(KIND_EVENT);
    rec.extend_from_slice(&seq.to_le_bytes());
    rec.extend_from_slice(&(hook.len() as u16).to_le_bytes());
    rec.extend_from_slice(hook.as_bytes());
    rec.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    rec.extend_from_slice(payload.as_bytes());
    rec
}

fn ack_record(seq: u64) -> Vec<u8> {
    let mut rec = Vec::with_capacity(9);
    rec.push(KIND_ACK);
    rec.extend_from_slice(&seq.to_le_bytes());
    rec
}

enum Scanned {
    Event { seq: u64, hook: String, payload: String, rec_len: u64 },
    Ack { seq: u64 },
}

/// Decode one record from the front of `data`. `Ok(None)` = torn tail.
fn scan_record(data: &[u8], offset: u64) -> Result<Option<(Scanned, usize)>> {
    if data.is_empty() {
        return Ok(None);
    }
    match data[0] {
        KIND_ACK => {
            if data.len() < 9 {
                return Ok(None);
            }
            let seq = u64::from_le_bytes(data[1..9].try_into().expect("sized"));
            Ok(Some((Scanned::Ack { seq }, 9)))
        }
        KIND_EVENT => {
            if data.len() < 11 {
                return Ok(None);
            }
            let seq = u64::from_le_bytes(data[1..9].try_into().expect("sized"));
            let hook_len = u16::from_le_bytes(data[9..11].try_into().expect("sized")) as usize;
            if data.len() < 11 + hook_len + 4 {
                return Ok(None);
            }
            let hook = String::from_utf8(data[11..11 + hook_len].to_vec()).map_err(|_| {
                FenceError::Corrupt {
                    offset,
                    reason: "hook name not utf-8".into(),
                }
            })?;
            let at = 11 + hook_len;
            let payload_len =
                u32::from_le_bytes(data[at..at + 4].try_into().expect("sized")) as usize;
            let end = at + 4 + payload_len;
            if data.len() < end {
                return Ok(None);
            }
            let payload = String::from_utf8(data[at + 4..end].to_vec()).map_err(|_| {
                FenceError::Corrupt {
                    offset,
                    reason: "payload not utf-8".into(),
                }
            })?;
            Ok(Some((
                Scanned::Event {
                    seq,
                    hook,
                    payload,
                    rec_len: end as u64,
                },
                end,
            )))
        }
        kind => Err(FenceError::Corrupt {
            offset,
            reason: format!("unknown record kind {kind}"),
        }),
    }
}

impl OutboundQueue {
    pub fn open(path: impl Into<PathBuf>) -> Result<OutboundQueue> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        let mut data = Vec::new();
        File::open(&path)?.read_to_end(&mut data)?;

        let mut events: BTreeMap<u64, (String, String, u64)> = BTreeMap::new();
        let mut next_seq = 1u64;
        let mut pos = 0usize;
        loop {
            match scan_record(&data[pos..], pos as u64)? {
                Some((Scanned::Event { seq, hook, payload, rec_len }, n)) => {
                    next_seq = next_seq.max(seq + 1);
                    events.insert(seq, (hook, payload, rec_len));
                    pos += n;
                }
                Some((Scanned::Ack { seq }, n)) => {
                    events.remove(&seq);
                    pos += n;
                }
                None => {
                    if pos < data.len() {
                        warn!(
                            path = %path.display(),
                            at = pos,
                            "discarding torn record at queue tail"
                        );
                        file.set_len(pos as u64)?;
                    }
                    break;
                }
            }
        }

        let mut pending: BTreeMap<String, VecDeque<QueuedEvent>> = BTreeMap::new();
        let mut live_bytes = 0u64;
        for (seq, (hook, payload, rec_len)) in events {
            live_bytes += rec_len;
            pending.entry(hook).or_default().push_back(QueuedEvent {
                seq,
                payload,
                rec_len,
            });
        }

        Ok(OutboundQueue {
            file,
            path,
            pending,
            next_seq,
            total_bytes: pos as u64,
            live_bytes,
        })
    }

    /// Durably enqueue an event for a hook. Returns its sequence number.
    pub fn push(&mut self, hook: &str, payload: &str) -> Result<u64> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let rec = event_record(seq, hook, payload);
        self.file.write_all(&rec)?;
        self.file.sync_data()?;
        self.total_bytes += rec.len() as u64;
        self.live_bytes += rec.len() as u64;
        self.pending
            .entry(hook.to_string())
            .or_default()
            .push_back(QueuedEvent {
                seq,
                payload: payload.to_string(),
                rec_len: rec.len() as u64,
            });
        Ok(seq)
    }

    /// Head of a hook's FIFO.
    pub fn peek(&self, hook: &str) -> Option<QueuedEvent> {
        self.pending.get(hook).and_then(|q| q.front().cloned())
    }

    pub fn pending(&self, hook: &str) -> usize {
        self.pending.get(hook).map_or(0, VecDeque::len)
    }

    pub fn total_pending(&self) -> usize {
        self.pending.values().map(VecDeque::len).sum()
    }

    /// Durably pop a delivered event. Out-of-order seqs are ignored: only
    /// the head can be acked, which keeps per-hook FIFO strict.
    pub fn ack(&mut self, hook: &str, seq: u64) -> Result<bool> {
        let Some(q) = self.pending.get_mut(hook) else {
            return Ok(false);
        };
        if q.front().map(|e| e.seq) != Some(seq) {
            return Ok(false);
        }
        let ev = q.pop_front().expect("checked front");
        if q.is_empty() {
            self.pending.remove(hook);
        }
        let rec = ack_record(seq);
        self.file.write_all(&rec)?;
        self.file.sync_data()?;
        self.total_bytes += rec.len() as u64;
        self.live_bytes -= ev.rec_len;
        self.maybe_compact()?;
        Ok(true)
    }

    /// Drop every pending event for a deleted hook.
    pub fn purge_hook(&mut self, hook: &str) -> Result<usize> {
        let Some(q) = self.pending.remove(hook) else {
            return Ok(0);
        };
        let mut recs = Vec::new();
        for ev in &q {
            recs.extend_from_slice(&ack_record(ev.seq));
            self.live_bytes -= ev.rec_len;
        }
        self.file.write_all(&recs)?;
        self.file.sync_data()?;
        self.total_bytes += recs.len() as u64;
        self.maybe_compact()?;
        Ok(q.len())
    }

    fn maybe_compact(&mut self) -> Result<()> {
        if self.total_bytes < COMPACT_MIN_BYTES || self.live_bytes * 2 > self.total_bytes {
            return Ok(());
        }
        let tmp_path = self.path.with_extension("compact");
        let mut tmp = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut written = 0u64;
        for (hook, q) in &self.pending {
            for ev in q {
                let rec = event_record(ev.seq, hook, &ev.payload);
                tmp.write_all(&rec)?;
                written += rec.len() as u64;
            }
        }
        tmp.sync_data()?;
        drop(tmp);
        std::fs::rename(&tmp_path, &self.path)?;
        self.file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        debug!(
            before = self.total_bytes,
            after = written,
            "outbound queue compacted"
        );
        self.total_bytes = written;
        self.live_bytes = written;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fifo_per_hook_and_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.db");
        {
            let mut q = OutboundQueue::open(&path).unwrap();
            q.push("a", "1").unwrap();
            q.push("b", "x").unwrap();
            q.push("a", "2").unwrap();
            assert_eq!(q.pending("a"), 2);
            let head = q.peek("a").unwrap();
            assert_eq!(head.payload, "1");
            assert!(q.ack("a", head.seq).unwrap());
            assert_eq!(q.peek("a").unwrap().payload, "2");
        }
        // Acked events stay gone across restart; pending ones survive.
        let q = OutboundQueue::open(&path).unwrap();
        assert_eq!(q.pending("a"), 1);
        assert_eq!(q.peek("a").unwrap().payload, "2");
        assert_eq!(q.peek("b").unwrap().payload, "x");
    }

    #[test]
    fn only_head_can_be_acked() {
        let dir = tempdir().unwrap();
        let mut q = OutboundQueue::open(dir.path().join("queue.db")).unwrap();
        let s1 = q.push("a", "1").unwrap();
        let s2 = q.push("a", "2").unwrap();
        assert!(!q.ack("a", s2).unwrap());
        assert!(q.ack("a", s1).unwrap());
        assert!(q.ack("a", s2).unwrap());
        assert_eq!(q.total_pending(), 0);
    }

    #[test]
    fn purge_clears_hook() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.db");
        {
            let mut q = OutboundQueue::open(&path).unwrap();
            q.push("a", "1").unwrap();
            q.push("a", "2").unwrap();
            assert_eq!(q.purge_hook("a").unwrap(), 2);
        }
        let q = OutboundQueue::open(&path).unwrap();
        assert_eq!(q.total_pending(), 0);
    }

    #[test]
    fn compaction_preserves_pending() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let mut q = OutboundQueue::open(&path).unwrap();
        let big = "x".repeat(4096);
        let mut seqs = Vec::new();
        for _ in 0..80 {
            seqs.push(q.push("a", &big).unwrap());
        }
        q.push("keep", "payload").unwrap();
        for seq in seqs {
            assert!(q.ack("a", seq).unwrap());
        }
        assert!(q.total_bytes < COMPACT_MIN_BYTES, "compacted");
        drop(q);
        let q = OutboundQueue::open(&path).unwrap();
        assert_eq!(q.total_pending(), 1);
        assert_eq!(q.peek("keep").unwrap().payload, "payload");
    }
}
