//! Two-file on-disk FIFO queue.
//!
//! Items are appended to a put-file; `get` drains a get-file and, once it
//! runs dry, swaps the put-file in as the new get-file under both locks and
//! retries once. No position file is kept: each swap starts the new
//! get-file's reader at position zero rather than resuming a prior run —
//! crash recovery simply re-reads whatever is on disk from the top.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{CrawlError, Result};

/// A FIFO queue for `T: Serialize + DeserializeOwned` backed by two
/// newline-delimited-JSON files. Safe for concurrent `put`/`get` from
/// multiple async tasks via an internal `std::sync::Mutex` per side (file
/// I/O here is synchronous and kept off the async executor by callers using
/// `tokio::task::spawn_blocking` where it matters for large queues).
pub struct SpillQueue<T> {
    put_path: PathBuf,
    get_path: PathBuf,
    persistent: bool,
    put_lock: Mutex<PutState>,
    get_lock: Mutex<GetState>,
    _marker: std::marker::PhantomData<T>,
}

struct PutState {
    len: usize,
    closed: bool,
}

struct GetState {
    reader: Option<BufReader<File>>,
    len: usize,
}

impl<T> SpillQueue<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Open (or create) a spill queue rooted at `directory` with base name
    /// `name`. `persistent` controls `close()` behaviour: a non-persistent
    /// queue deletes its files on close, a persistent one merges the
    /// get-file's remaining tail back into the put-file so a later re-open
    /// under the same name picks the tail back up.
    pub fn open(directory: &Path, name: &str, persistent: bool) -> Result<Self> {
        fs::create_dir_all(directory)?;
        let put_path = directory.join(format!("put_{name}.queue"));
        let get_path = directory.join(format!("get_{name}.queue"));

        if !put_path.exists() {
            File::create(&put_path)?;
        }
        if !get_path.exists() {
            File::create(&get_path)?;
        }

        let get_len = count_lines(&get_path)?;
        let put_len = count_lines(&put_path)?;

        Ok(Self {
            put_path,
            get_path,
            persistent,
            put_lock: Mutex::new(PutState {
                len: put_len,
                closed: false,
            }),
            get_lock: Mutex::new(GetState {
                reader: None,
                len: get_len,
            }),
            _marker: std::marker::PhantomData,
        })
    }

    /// Append `item` to the put-file. Errors with `CrawlError::QueueClosed`
    /// once `close()` has run on a non-persistent queue.
    pub fn put(&self, item: &T) -> Result<()> {
        let mut state = self.put_lock.lock().unwrap();
        if state.closed {
            return Err(CrawlError::QueueClosed);
        }
        let line = serde_json::to_string(item)
            .map_err(|e| CrawlError::Parse { url: String::new(), reason: e.to_string() })?;
        let mut f = OpenOptions::new().append(true).open(&self.put_path)?;
        writeln!(f, "{line}")?;
        state.len += 1;
        Ok(())
    }

    /// Remove and return the next item. Returns `CrawlError::QueueEmpty`
    /// when both files have been exhausted.
    pub fn get(&self) -> Result<T> {
        let mut get_state = self.get_lock.lock().unwrap();
        if let Some(item) = self.try_read_line(&mut get_state)? {
            get_state.len = get_state.len.saturating_sub(1);
            return Ok(item);
        }

        // get-file exhausted: swap put-file in as the new get-file.
        {
            let mut put_state = self.put_lock.lock().unwrap();
            get_state.reader = None;
            fs::rename(&self.put_path, &self.get_path)?;
            File::create(&self.put_path)?;
            get_state.len = put_state.len;
            put_state.len = 0;
        }

        match self.try_read_line(&mut get_state)? {
            Some(item) => {
                get_state.len = get_state.len.saturating_sub(1);
                Ok(item)
            }
            None => Err(CrawlError::QueueEmpty),
        }
    }

    fn try_read_line(&self, get_state: &mut GetState) -> Result<Option<T>> {
        if get_state.reader.is_none() {
            get_state.reader = Some(BufReader::new(File::open(&self.get_path)?));
        }
        let reader = get_state.reader.as_mut().unwrap();
        let mut line = String::new();
        loop {
            line.clear();
            let n = reader.read_line(&mut line)?;
            if n == 0 {
                return Ok(None);
            }
            let trimmed = line.trim_end_matches('\n');
            if trimmed.is_empty() {
                continue;
            }
            let item = serde_json::from_str(trimmed)
                .map_err(|e| CrawlError::Parse { url: String::new(), reason: e.to_string() })?;
            return Ok(Some(item));
        }
    }

    /// Approximate combined length of both files.
    pub fn size(&self) -> usize {
        let put_len = self.put_lock.lock().unwrap().len;
        let get_len = self.get_lock.lock().unwrap().len;
        put_len + get_len
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Close the queue. Non-persistent: delete both files. Persistent:
    /// merge whatever remains unread in the get-file back onto the end of
    /// the put-file so a future `open` with the same name resumes from it.
    pub fn close(&self) -> Result<()> {
        let mut put_state = self.put_lock.lock().unwrap();
        let mut get_state = self.get_lock.lock().unwrap();

        if !self.persistent {
            put_state.closed = true;
            get_state.reader = None;
            let _ = fs::remove_file(&self.put_path);
            let _ = fs::remove_file(&self.get_path);
            return Ok(());
        }

        // Drain any remaining unread lines from the in-progress reader
        // (if present) plus the rest of the get-file, and append them to
        // put-file, preserving their relative order as the tail.
        let mut tail = Vec::new();
        if let Some(reader) = get_state.reader.take() {
            let mut reader = reader;
            let mut line = String::new();
            loop {
                line.clear();
                let n = reader.read_line(&mut line)?;
                if n == 0 {
                    break;
                }
                let trimmed = line.trim_end_matches('\n').to_string();
                if !trimmed.is_empty() {
                    tail.push(trimmed);
                }
            }
        } else if self.get_path.exists() {
            let reader = BufReader::new(File::open(&self.get_path)?);
            for line in reader.lines() {
                let line = line?;
                if !line.is_empty() {
                    tail.push(line);
                }
            }
        }

        if !tail.is_empty() {
            let mut f = OpenOptions::new().append(true).open(&self.put_path)?;
            for line in &tail {
                writeln!(f, "{line}")?;
            }
            put_state.len += tail.len();
        }

        let _ = fs::remove_file(&self.get_path);
        Ok(())
    }
}

fn count_lines(path: &Path) -> Result<usize> {
    let reader = BufReader::new(File::open(path)?);
    Ok(reader.lines().filter(|l| l.as_ref().map(|s| !s.is_empty()).unwrap_or(true)).count())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Item(String, usize);

    #[test]
    fn put_then_get_preserves_fifo_order() {
        let dir = TempDir::new().unwrap();
        let q: SpillQueue<Item> = SpillQueue::open(dir.path(), "a", false).unwrap();
        q.put(&Item("one".into(), 1)).unwrap();
        q.put(&Item("two".into(), 2)).unwrap();
        assert_eq!(q.get().unwrap(), Item("one".into(), 1));
        assert_eq!(q.get().unwrap(), Item("two".into(), 2));
        assert!(matches!(q.get(), Err(CrawlError::QueueEmpty)));
    }

    #[test]
    fn swaps_put_into_get_when_get_exhausted() {
        let dir = TempDir::new().unwrap();
        let q: SpillQueue<Item> = SpillQueue::open(dir.path(), "b", false).unwrap();
        q.put(&Item("x".into(), 1)).unwrap();
        assert_eq!(q.get().unwrap(), Item("x".into(), 1));
        q.put(&Item("y".into(), 2)).unwrap();
        assert_eq!(q.get().unwrap(), Item("y".into(), 2));
    }

    #[test]
    fn size_reflects_unread_items() {
        let dir = TempDir::new().unwrap();
        let q: SpillQueue<Item> = SpillQueue::open(dir.path(), "c", false).unwrap();
        assert_eq!(q.size(), 0);
        q.put(&Item("a".into(), 1)).unwrap();
        q.put(&Item("b".into(), 2)).unwrap();
        assert_eq!(q.size(), 2);
        q.get().unwrap();
        assert_eq!(q.size(), 1);
    }

    #[test]
    fn non_persistent_close_removes_files_and_rejects_put() {
        let dir = TempDir::new().unwrap();
        let q: SpillQueue<Item> = SpillQueue::open(dir.path(), "d", false).unwrap();
        q.put(&Item("a".into(), 1)).unwrap();
        q.close().unwrap();
        assert!(matches!(q.put(&Item("b".into(), 2)), Err(CrawlError::QueueClosed)));
    }

    #[test]
    fn persistent_close_merges_tail_and_reopen_resumes() {
        let dir = TempDir::new().unwrap();
        {
            let q: SpillQueue<Item> = SpillQueue::open(dir.path(), "e", true).unwrap();
            q.put(&Item("a".into(), 1)).unwrap();
            q.put(&Item("b".into(), 2)).unwrap();
            q.get().unwrap(); // consume "a", leaving "b" unread in the get-file
            q.close().unwrap();
        }
        let q2: SpillQueue<Item> = SpillQueue::open(dir.path(), "e", true).unwrap();
        assert_eq!(q2.get().unwrap(), Item("b".into(), 2));
    }
}
