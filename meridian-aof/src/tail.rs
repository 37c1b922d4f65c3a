//! Tailing reader used by the replication sender.
//!
//! Follows the log from a logical offset, waiting on the writer's progress
//! channel when caught up and reopening the file after a shrink rotation.
//! The reader never touches writer state; it works from the path and the
//! published `Progress` alone.

use crate::aof::Progress;
use crate::error::Result;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use tokio::sync::watch;

/// Outcome of a chunk read.
#[derive(Debug, PartialEq, Eq)]
pub enum Tail {
    /// `n` bytes were copied into the buffer.
    Data(usize),
    /// The requested offset predates the file's base: the log was shrunk
    /// past it and the follower needs a full resync.
    Hole,
    /// The writer is gone; no more data will ever arrive.
    Closed,
}

pub struct TailReader {
    path: PathBuf,
    rx: watch::Receiver<Progress>,
    pos: u64,
    file: Option<(File, u64)>,
}

impl TailReader {
    pub fn new(path: PathBuf, rx: watch::Receiver<Progress>, pos: u64) -> Self {
        Self {
            path,
            rx,
            pos,
            file: None,
        }
    }

    /// Current logical read offset.
    pub fn pos(&self) -> u64 {
        self.pos
    }

    /// Read the next run of bytes, waiting for appends when caught up.
    pub async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<Tail> {
        loop {
            let progress = *self.rx.borrow();
            if self.pos < progress.base {
                return Ok(Tail::Hole);
            }
            if self.pos < progress.len {
                let reopen = !matches!(&self.file, Some((_, epoch)) if *epoch == progress.epoch);
                if reopen {
                    self.file = Some((File::open(&self.path)?, progress.epoch));
                }
                if let Some((file, _)) = self.file.as_mut() {
                    file.seek(SeekFrom::Start(self.pos - progress.base))?;
                    let want = ((progress.len - self.pos) as usize).min(buf.len());
                    let n = file.read(&mut buf[..want])?;
                    if n > 0 {
                        self.pos += n as u64;
                        return Ok(Tail::Data(n));
                    }
                }
            }
            if self.rx.changed().await.is_err() {
                return Ok(Tail::Closed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aof::{Aof, FsyncPolicy};
    use meridian_protocol::encode_array;
    use tempfile::tempdir;

    #[tokio::test]
    async fn tails_appends_and_reports_hole_after_deep_shrink() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("appendonly.aof");
        let mut aof = Aof::open(&path, FsyncPolicy::Never, |_| {}).unwrap();
        let rx = aof.subscribe();

        aof.append(&encode_array(&["SET", "k", "a", "STRING", "1"]))
            .unwrap();
        let mut reader = TailReader::new(path.clone(), rx.clone(), 0);
        let mut buf = vec![0u8; 4096];
        let Tail::Data(n) = reader.read_chunk(&mut buf).await.unwrap() else {
            panic!("expected data");
        };
        assert_eq!(reader.pos(), n as u64);
        assert_eq!(reader.pos(), aof.logical_len());

        // Shrink away the prefix; a reader at offset 0 now falls in the hole.
        for _ in 0..50 {
            aof.append(&encode_array(&["SET", "k", "a", "STRING", "2"]))
                .unwrap();
        }
        let mut job = aof.begin_shrink().unwrap();
        job.append_record(&encode_array(&["SET", "k", "a", "STRING", "2"]))
            .unwrap();
        aof.finish_shrink(job).unwrap();

        let mut stale = TailReader::new(path.clone(), rx.clone(), 0);
        assert_eq!(stale.read_chunk(&mut buf).await.unwrap(), Tail::Hole);

        // A reader at the preserved offset keeps streaming across rotation.
        let mut current = TailReader::new(path.clone(), rx, aof.base());
        let Tail::Data(_) = current.read_chunk(&mut buf).await.unwrap() else {
            panic!("expected data after rotation");
        };
    }
}
