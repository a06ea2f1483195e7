//! Reader/writer spin lock living in shared memory
//!
//! The whole lock is one `u32`: bit 31 is the writer, bit 30 marks a
//! waiting writer so new readers back off, the low bits count readers.
//! Waits are bounded; a peer that died holding the lock turns into a
//! timeout error instead of a hang.

use framelink_common::{Error, Result};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

const WRITER: u32 = 1 << 31;
const WRITER_WAITING: u32 = 1 << 30;
const READER_MASK: u32 = WRITER_WAITING - 1;

const SPINS_BEFORE_YIELD: u32 = 64;

pub struct SharedRwLock<'a> {
    word: &'a AtomicU32,
}

pub struct WriteGuard<'a> {
    word: &'a AtomicU32,
}

pub struct ReadGuard<'a> {
    word: &'a AtomicU32,
}

struct Backoff {
    spins: u32,
}

impl Backoff {
    fn new() -> Self {
        Self { spins: 0 }
    }

    fn snooze(&mut self) {
        if self.spins < SPINS_BEFORE_YIELD {
            self.spins += 1;
            std::hint::spin_loop();
        } else {
            std::thread::yield_now();
        }
    }
}

impl<'a> SharedRwLock<'a> {
    pub fn new(word: &'a AtomicU32) -> Self {
        Self { word }
    }

    /// Exclusive access, waiting at most `timeout`
    pub fn write(&self, timeout: Duration) -> Result<WriteGuard<'a>> {
        let deadline = Instant::now() + timeout;
        let mut backoff = Backoff::new();
        loop {
            let state = self.word.load(Ordering::Relaxed);
            if state & (WRITER | READER_MASK) == 0 {
                if self
                    .word
                    .compare_exchange_weak(state, WRITER, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return Ok(WriteGuard { word: self.word });
                }
                continue;
            }
            if state & WRITER_WAITING == 0 {
                self.word.fetch_or(WRITER_WAITING, Ordering::Relaxed);
            }
            if Instant::now() >= deadline {
                // Let readers in again; other waiting writers re-mark on their next pass
                self.word.fetch_and(!WRITER_WAITING, Ordering::Relaxed);
                return Err(Error::Transport("timed out waiting for the write lock".into()));
            }
            backoff.snooze();
        }
    }

    /// Shared access, waiting at most `timeout`
    pub fn read(&self, timeout: Duration) -> Result<ReadGuard<'a>> {
        let deadline = Instant::now() + timeout;
        let mut backoff = Backoff::new();
        loop {
            let state = self.word.load(Ordering::Relaxed);
            if state & (WRITER | WRITER_WAITING) == 0 && state & READER_MASK < READER_MASK {
                if self
                    .word
                    .compare_exchange_weak(state, state + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return Ok(ReadGuard { word: self.word });
                }
                continue;
            }
            if Instant::now() >= deadline {
                return Err(Error::Transport("timed out waiting for the read lock".into()));
            }
            backoff.snooze();
        }
    }

    pub fn is_locked(&self) -> bool {
        self.word.load(Ordering::Relaxed) & (WRITER | READER_MASK) != 0
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.word.fetch_and(!WRITER, Ordering::Release);
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.word.fetch_sub(1, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const WAIT: Duration = Duration::from_millis(200);

    #[test]
    fn test_readers_share() {
        let word = AtomicU32::new(0);
        let lock = SharedRwLock::new(&word);
        let a = lock.read(WAIT).unwrap();
        let b = lock.read(WAIT).unwrap();
        assert_eq!(word.load(Ordering::SeqCst), 2);
        drop(a);
        drop(b);
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_writer_excludes_readers() {
        let word = AtomicU32::new(0);
        let lock = SharedRwLock::new(&word);
        let guard = lock.write(WAIT).unwrap();
        assert!(lock.read(Duration::from_millis(10)).is_err());
        assert!(lock.write(Duration::from_millis(10)).is_err());
        drop(guard);
        assert!(lock.read(WAIT).is_ok());
    }

    #[test]
    fn test_waiting_writer_blocks_new_readers() {
        let word = AtomicU32::new(0);
        let lock = SharedRwLock::new(&word);
        let reader = lock.read(WAIT).unwrap();
        word.fetch_or(WRITER_WAITING, Ordering::SeqCst);
        assert!(lock.read(Duration::from_millis(5)).is_err());
        drop(reader);
        let writer = lock.write(WAIT).unwrap();
        drop(writer);
        assert_eq!(word.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_writer_timeout_clears_waiting_mark() {
        let word = AtomicU32::new(0);
        let lock = SharedRwLock::new(&word);
        let reader = lock.read(WAIT).unwrap();
        assert!(lock.write(Duration::from_millis(5)).is_err());
        // A second reader is not starved by the abandoned writer
        let second = lock.read(WAIT).unwrap();
        drop(second);
        drop(reader);
    }

    #[test]
    fn test_exclusive_under_contention() {
        let word = Arc::new(AtomicU32::new(0));
        let counter = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let word = word.clone();
                let counter = counter.clone();
                std::thread::spawn(move || {
                    let lock = SharedRwLock::new(&word);
                    for _ in 0..500 {
                        let _guard = lock.write(Duration::from_secs(5)).unwrap();
                        // Non-atomic read-modify-write made safe by the lock
                        let v = counter.load(Ordering::Relaxed);
                        counter.store(v + 1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 2000);
    }
}
