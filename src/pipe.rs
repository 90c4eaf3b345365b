//! The elastic byte channel between a connection's reader and a session.
//!
//! The web server may push a session's entire input as fast as the wire
//! permits, long before the application starts reading. A [`Pipe`] absorbs
//! that burst: it buffers in fixed-size memory chunks while the process-wide
//! memory budget allows, then spills new chunks to temporary files. The
//! application drains the chunks strictly in submission order through a
//! [`PipeReader`].

mod chunk;

use crate::error::AbortReason;
use chunk::Chunk;
use std::collections::VecDeque;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// Process-wide accounting of bytes resident in memory chunks.
///
/// The counter is advisory: the threshold check is lock-free and a brief
/// overshoot while concurrent writes race it is acceptable.
pub(crate) struct MemoryBudget {
    used: AtomicI64,
    threshold: i64,
}

impl MemoryBudget {
    pub fn new(threshold: usize) -> Self {
        Self {
            used: AtomicI64::new(0),
            threshold: i64::try_from(threshold).unwrap_or(i64::MAX),
        }
    }

    fn charge(&self, bytes: usize) {
        self.used.fetch_add(bytes as i64, Ordering::Relaxed);
    }

    fn credit(&self, bytes: usize) {
        self.used.fetch_sub(bytes as i64, Ordering::Relaxed);
    }

    fn over_threshold(&self) -> bool {
        self.used.load(Ordering::Relaxed) >= self.threshold
    }

    #[cfg(test)]
    pub fn used(&self) -> i64 {
        self.used.load(Ordering::Relaxed)
    }
}

/// How a pipe sizes its chunks and where it spills.
#[derive(Debug, Clone)]
pub(crate) struct PipeConfig {
    pub memory_chunk_size: usize,
    pub file_chunk_size: u64,
    pub spill_dir: Option<PathBuf>,
    pub spill_prefix: String,
    pub spill_suffix: String,
}

struct Shared {
    chunks: VecDeque<Arc<Chunk>>,
    complete: bool,
    aborted: Option<AbortReason>,
}

/// A one-producer, one-consumer FIFO of bytes.
///
/// The connection reader writes; writes never block on the consumer (they
/// allocate chunks instead). The application reads through [`Pipe::reader`];
/// reads block until bytes arrive, the pipe completes, or it aborts.
pub(crate) struct Pipe {
    shared: Mutex<Shared>,
    next_chunk: Condvar,
    budget: Arc<MemoryBudget>,
    config: PipeConfig,
}

impl Pipe {
    pub fn new(config: PipeConfig, budget: Arc<MemoryBudget>) -> Arc<Self> {
        Arc::new(Self {
            shared: Mutex::new(Shared {
                chunks: VecDeque::new(),
                complete: false,
                aborted: None,
            }),
            next_chunk: Condvar::new(),
            budget,
            config,
        })
    }

    /// The consuming end. Chunks are presented strictly in submission order.
    pub fn reader(self: &Arc<Self>) -> PipeReader {
        PipeReader {
            pipe: Arc::clone(self),
            current: None,
        }
    }

    /// Appends `data`, allocating chunks as needed.
    ///
    /// Writes after an abort are silently discarded: the consumer already
    /// said it no longer cares. An error here can only come from spill-file
    /// i/o and poisons nothing; the caller decides what to do with the
    /// session.
    pub fn write(&self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            let tail = {
                let shared = self.shared.lock().unwrap();
                if shared.aborted.is_some() || shared.complete {
                    return Ok(());
                }
                shared.chunks.back().cloned()
            };

            if let Some(chunk) = tail {
                let taken = chunk.write(data)?;
                data = &data[taken..];
                if data.is_empty() {
                    break;
                }
            }

            // Tail chunk full (or none yet): open a fresh one.
            self.grow()?;
        }
        Ok(())
    }

    // Picks the variant by the current global memory usage: under the
    // threshold a new chunk is memory, at or over it spills to a file.
    fn grow(&self) -> io::Result<()> {
        let chunk = if self.budget.over_threshold() {
            let dir = match &self.config.spill_dir {
                Some(dir) => dir.clone(),
                None => std::env::temp_dir(),
            };
            Chunk::file(
                &dir,
                &self.config.spill_prefix,
                &self.config.spill_suffix,
                self.config.file_chunk_size,
                Arc::clone(&self.budget),
            )?
        } else {
            Chunk::memory(self.config.memory_chunk_size, Arc::clone(&self.budget))
        };

        let mut shared = self.shared.lock().unwrap();
        if let Some(last) = shared.chunks.back() {
            last.seal();
        }
        shared.chunks.push_back(Arc::new(chunk));
        drop(shared);
        self.next_chunk.notify_all();
        Ok(())
    }

    /// Marks the end of the stream. Idempotent.
    pub fn close(&self) {
        let mut shared = self.shared.lock().unwrap();
        if shared.complete {
            return;
        }
        shared.complete = true;
        if let Some(last) = shared.chunks.back() {
            last.seal();
        }
        drop(shared);
        self.next_chunk.notify_all();
    }

    /// Fails all subsequent reads with `reason` and discards future writes.
    pub fn abort(&self, reason: AbortReason) {
        let mut shared = self.shared.lock().unwrap();
        if shared.aborted.is_none() {
            shared.aborted = Some(reason);
        }
        for chunk in shared.chunks.iter() {
            chunk.abort(reason);
        }
        drop(shared);
        self.next_chunk.notify_all();
    }

    #[cfg(test)]
    fn chunk_snapshot(&self) -> Vec<Arc<Chunk>> {
        self.shared.lock().unwrap().chunks.iter().cloned().collect()
    }
}

/// Blocking cursor over a pipe's chunks in submission order.
pub(crate) struct PipeReader {
    pipe: Arc<Pipe>,
    current: Option<Arc<Chunk>>,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            let chunk = match self.current.take() {
                Some(chunk) => chunk,
                None => {
                    let mut shared = self.pipe.shared.lock().unwrap();
                    loop {
                        if let Some(reason) = shared.aborted {
                            return Err(reason.into());
                        }
                        if let Some(front) = shared.chunks.front() {
                            break Arc::clone(front);
                        }
                        if shared.complete {
                            return Ok(0);
                        }
                        shared = self.pipe.next_chunk.wait(shared).unwrap();
                    }
                }
            };

            match chunk.read(buf) {
                Ok(0) => {
                    // Sealed and drained: release it and move to the next.
                    let mut shared = self.pipe.shared.lock().unwrap();
                    if shared
                        .chunks
                        .front()
                        .is_some_and(|front| Arc::ptr_eq(front, &chunk))
                    {
                        shared.chunks.pop_front();
                    }
                }
                Ok(n) => {
                    self.current = Some(chunk);
                    return Ok(n);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Read;
    use std::thread;
    use std::time::Duration;

    fn test_config() -> PipeConfig {
        PipeConfig {
            memory_chunk_size: 1024,
            file_chunk_size: 64 * 1024,
            spill_dir: None,
            spill_prefix: "switchboard-test-".to_string(),
            spill_suffix: ".spill".to_string(),
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn delivers_bytes_in_order_across_chunks() {
        let budget = Arc::new(MemoryBudget::new(usize::MAX));
        let pipe = Pipe::new(test_config(), budget);
        let mut reader = pipe.reader();

        let payload = pattern(10_000);
        pipe.write(&payload).unwrap();
        pipe.close();

        let mut received = vec![];
        reader.read_to_end(&mut received).unwrap();
        assert_eq!(received, payload);
    }

    #[test]
    fn blocked_reader_wakes_on_write() {
        let budget = Arc::new(MemoryBudget::new(usize::MAX));
        let pipe = Pipe::new(test_config(), budget);
        let mut reader = pipe.reader();

        let writer = {
            let pipe = Arc::clone(&pipe);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                pipe.write(b"wake up").unwrap();
                pipe.close();
            })
        };

        let mut received = vec![];
        reader.read_to_end(&mut received).unwrap();
        writer.join().unwrap();
        assert_eq!(received, b"wake up");
    }

    #[test]
    fn spills_to_files_over_the_memory_threshold() {
        let budget = Arc::new(MemoryBudget::new(4096));
        let config = PipeConfig {
            memory_chunk_size: 1024,
            file_chunk_size: 64 * 1024,
            ..test_config()
        };
        let pipe = Pipe::new(config, Arc::clone(&budget));

        let payload = pattern(1 << 20);
        pipe.write(&payload).unwrap();
        pipe.close();

        let chunks = pipe.chunk_snapshot();
        assert!(chunks.len() > 4);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.is_file(), i >= 4, "chunk {i} variant");
        }
        let spill_paths: Vec<_> = chunks.iter().filter_map(|c| c.spill_path()).collect();
        assert!(!spill_paths.is_empty());
        assert!(spill_paths.iter().all(|p| p.exists()));
        assert_eq!(budget.used(), 4096);

        let mut received = vec![];
        pipe.reader().read_to_end(&mut received).unwrap();
        assert_eq!(received, payload);

        // Fully drained: the budget is repaid and the spill files are gone.
        drop(pipe);
        assert_eq!(budget.used(), 0);
        assert!(spill_paths.iter().all(|p| !p.exists()));
    }

    #[test]
    fn compaction_keeps_a_fast_reader_in_one_chunk() {
        let budget = Arc::new(MemoryBudget::new(usize::MAX));
        let pipe = Pipe::new(test_config(), Arc::clone(&budget));
        let mut reader = pipe.reader();

        // Alternating write/read far beyond one chunk's capacity never
        // allocates a second chunk because reads keep freeing the head.
        let mut buf = [0u8; 512];
        for round in 0..100 {
            let data = pattern(512);
            pipe.write(&data).unwrap();
            reader.read_exact(&mut buf).unwrap();
            assert_eq!(buf[..], data[..], "round {round}");
        }
        assert_eq!(pipe.chunk_snapshot().len(), 1);
        assert_eq!(budget.used(), 0);
    }

    #[test]
    fn abort_fails_reads_and_discards_writes() {
        let budget = Arc::new(MemoryBudget::new(usize::MAX));
        let pipe = Pipe::new(test_config(), Arc::clone(&budget));
        let mut reader = pipe.reader();

        pipe.write(b"before").unwrap();
        pipe.abort(AbortReason::SessionAborted);

        let err = reader.read(&mut [0u8; 8]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);

        // Discarded without raising.
        pipe.write(b"after").unwrap();

        // Every subsequent read keeps failing with the same reason.
        let err = reader.read(&mut [0u8; 8]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }

    #[test]
    fn abort_wakes_a_blocked_reader() {
        let budget = Arc::new(MemoryBudget::new(usize::MAX));
        let pipe = Pipe::new(test_config(), budget);
        let mut reader = pipe.reader();

        let aborter = {
            let pipe = Arc::clone(&pipe);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                pipe.abort(AbortReason::SessionAborted);
            })
        };

        let err = reader.read(&mut [0u8; 8]).unwrap_err();
        aborter.join().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }

    #[test]
    fn abandoning_a_pipe_repays_the_budget() {
        let budget = Arc::new(MemoryBudget::new(usize::MAX));
        let pipe = Pipe::new(test_config(), Arc::clone(&budget));

        pipe.write(&pattern(5000)).unwrap();
        assert_eq!(budget.used(), 5000);

        drop(pipe);
        assert_eq!(budget.used(), 0);
    }

    #[test]
    fn budget_tracks_undrained_memory_bytes() {
        let budget = Arc::new(MemoryBudget::new(usize::MAX));
        let pipe = Pipe::new(test_config(), Arc::clone(&budget));
        let mut reader = pipe.reader();

        pipe.write(&pattern(3000)).unwrap();
        assert_eq!(budget.used(), 3000);

        let mut buf = [0u8; 1200];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(budget.used(), 1800);

        // At quiescence the counter matches the undrained bytes actually
        // resident in memory chunks.
        let resident: usize = pipe
            .chunk_snapshot()
            .iter()
            .filter(|chunk| !chunk.is_file())
            .map(|chunk| chunk.buffered())
            .sum();
        assert_eq!(budget.used(), resident as i64);

        pipe.close();
        let mut rest = vec![];
        reader.read_to_end(&mut rest).unwrap();
        assert_eq!(rest.len(), 1800);
        assert_eq!(budget.used(), 0);
    }

    proptest! {
        // Any interleaving of writes and reads preserves the byte sequence.
        #[test]
        fn fifo_under_arbitrary_interleaving(
            ops in proptest::collection::vec((any::<bool>(), 1usize..3000), 1..60)
        ) {
            let budget = Arc::new(MemoryBudget::new(2048));
            let pipe = Pipe::new(test_config(), Arc::clone(&budget));
            let mut reader = pipe.reader();

            let mut submitted = vec![];
            let mut received = vec![];
            let mut next = 0u8;

            for (is_write, size) in ops {
                if is_write {
                    let data: Vec<u8> = (0..size).map(|_| {
                        next = next.wrapping_add(1);
                        next
                    }).collect();
                    pipe.write(&data).unwrap();
                    submitted.extend_from_slice(&data);
                } else {
                    // Only read what is known to be buffered, so the
                    // single-threaded test never blocks.
                    let available = submitted.len() - received.len();
                    let take = size.min(available);
                    if take > 0 {
                        let mut buf = vec![0u8; take];
                        reader.read_exact(&mut buf).unwrap();
                        received.extend_from_slice(&buf);
                    }
                }
            }

            pipe.close();
            reader.read_to_end(&mut received).unwrap();
            prop_assert_eq!(received, submitted);
            prop_assert_eq!(budget.used(), 0);
        }
    }
}
