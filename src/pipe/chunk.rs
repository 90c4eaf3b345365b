use super::MemoryBudget;
use crate::error::AbortReason;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use tempfile::NamedTempFile;

// One segment of a pipe's buffer: a fixed block of memory, or a bounded
// temporary file once the process-wide memory budget is exhausted.
//
// A chunk is written by the connection reader and read by the application
// thread. Each chunk has its own lock and condition variable; a blocked
// read wakes when bytes arrive, the chunk is sealed, or the pipe aborts.
pub(crate) struct Chunk {
    state: Mutex<State>,
    readable: Condvar,
    budget: Arc<MemoryBudget>,
}

struct State {
    store: Store,
    sealed: bool,
    aborted: Option<AbortReason>,
}

enum Store {
    Memory {
        buf: Box<[u8]>,
        read: usize,
        write: usize,
    },
    File {
        file: NamedTempFile,
        read: u64,
        write: u64,
        max_size: u64,
    },
}

impl Chunk {
    pub fn memory(capacity: usize, budget: Arc<MemoryBudget>) -> Self {
        Self {
            state: Mutex::new(State {
                store: Store::Memory {
                    buf: vec![0; capacity].into_boxed_slice(),
                    read: 0,
                    write: 0,
                },
                sealed: false,
                aborted: None,
            }),
            readable: Condvar::new(),
            budget,
        }
    }

    pub fn file(
        dir: &Path,
        prefix: &str,
        suffix: &str,
        max_size: u64,
        budget: Arc<MemoryBudget>,
    ) -> io::Result<Self> {
        let file = tempfile::Builder::new()
            .prefix(prefix)
            .suffix(suffix)
            .tempfile_in(dir)?;

        Ok(Self {
            state: Mutex::new(State {
                store: Store::File {
                    file,
                    read: 0,
                    write: 0,
                    max_size,
                },
                sealed: false,
                aborted: None,
            }),
            readable: Condvar::new(),
            budget,
        })
    }

    /// Appends as much of `data` as fits, returning how much was taken.
    ///
    /// A return of 0 with a non-empty `data` means the chunk is full and the
    /// caller must allocate a new one. Writes to an aborted chunk pretend to
    /// succeed; the consumer is gone.
    pub fn write(&self, data: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();

        if state.aborted.is_some() {
            return Ok(data.len());
        }
        if state.sealed {
            return Ok(0);
        }

        let taken = match &mut state.store {
            Store::Memory { buf, read, write } => {
                // Slide unread bytes to the front when the tail is too
                // small but earlier reads freed space at the head.
                if buf.len() - *write < data.len() && *read > 0 {
                    buf.copy_within(*read..*write, 0);
                    *write -= *read;
                    *read = 0;
                }

                let n = data.len().min(buf.len() - *write);
                buf[*write..*write + n].copy_from_slice(&data[..n]);
                *write += n;
                if n > 0 {
                    self.budget.charge(n);
                }
                n
            }
            Store::File {
                file,
                write,
                max_size,
                ..
            } => {
                let room = *max_size - *write;
                let n = (data.len() as u64).min(room) as usize;
                if n > 0 {
                    let mut f = file.as_file();
                    f.seek(SeekFrom::Start(*write))?;
                    f.write_all(&data[..n])?;
                    *write += n as u64;
                }
                n
            }
        };

        if taken > 0 {
            self.readable.notify_all();
        }
        Ok(taken)
    }

    /// Blocks until bytes are available, then drains up to `buf.len()`.
    ///
    /// Returns `Ok(0)` only once the chunk is sealed and fully drained.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();

        loop {
            if let Some(reason) = state.aborted {
                return Err(reason.into());
            }

            let n = match &mut state.store {
                Store::Memory {
                    buf: mem,
                    read,
                    write,
                } => {
                    let n = (*write - *read).min(buf.len());
                    if n > 0 {
                        buf[..n].copy_from_slice(&mem[*read..*read + n]);
                        *read += n;
                        self.budget.credit(n);
                    }
                    n
                }
                Store::File {
                    file, read, write, ..
                } => {
                    let n = (*write - *read).min(buf.len() as u64) as usize;
                    if n > 0 {
                        let mut f = file.as_file();
                        f.seek(SeekFrom::Start(*read))?;
                        f.read_exact(&mut buf[..n])?;
                        *read += n as u64;
                    }
                    n
                }
            };

            if n > 0 {
                return Ok(n);
            }
            if state.sealed {
                return Ok(0);
            }

            state = self.readable.wait(state).unwrap();
        }
    }

    /// Marks the chunk as complete. Idempotent.
    pub fn seal(&self) {
        let mut state = self.state.lock().unwrap();
        state.sealed = true;
        drop(state);
        self.readable.notify_all();
    }

    pub fn abort(&self, reason: AbortReason) {
        let mut state = self.state.lock().unwrap();
        if state.aborted.is_none() {
            state.aborted = Some(reason);
        }
        drop(state);
        self.readable.notify_all();
    }

    #[cfg(test)]
    pub fn is_file(&self) -> bool {
        matches!(self.state.lock().unwrap().store, Store::File { .. })
    }

    #[cfg(test)]
    pub fn spill_path(&self) -> Option<std::path::PathBuf> {
        match &self.state.lock().unwrap().store {
            Store::File { file, .. } => Some(file.path().to_path_buf()),
            Store::Memory { .. } => None,
        }
    }

    #[cfg(test)]
    pub fn buffered(&self) -> usize {
        match &self.state.lock().unwrap().store {
            Store::Memory { read, write, .. } => *write - *read,
            Store::File { read, write, .. } => (*write - *read) as usize,
        }
    }
}

impl Drop for Chunk {
    // An abandoned memory chunk returns its undrained bytes to the budget.
    // A file chunk's temporary file is removed by its own drop.
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap();
        if let Store::Memory { read, write, .. } = &state.store {
            if write > read {
                self.budget.credit(write - read);
            }
        }
    }
}
