//! Raw block sources and the overlapped reader.
//!
//! A [`BlockSource`] knows how to pull the next raw block of a frame from the
//! device. It is driven either directly by the session or by an
//! [`OverlappedReader`] worker thread that keeps a bounded number of filled
//! blocks ahead of the consumer.

use crate::{
    result::{Result, SaneError},
    transport::Link,
    wait::{wait_until_ready, Probe, RetryPolicy, Sleeper, ThreadSleeper},
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, SyncSender},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

pub const BUSY_RETRIES: u32 = 10;
pub const BUSY_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    Data(Vec<u8>),
    /// The device has no data ready yet.
    Busy,
    End,
}

pub trait BlockSource: Send {
    /// Length of one raw line. Reads are sized to whole lines.
    fn line_len(&self) -> usize;

    /// Raw bytes still expected for this frame.
    fn remaining(&self) -> usize;

    /// Read up to `max` bytes.
    fn next_block(&mut self, link: &mut Link, max: usize) -> Result<Block>;

    /// How long to keep asking while the device has no data ready.
    fn busy_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(BUSY_RETRIES, BUSY_DELAY)
    }
}

/// Largest whole-line read not above `block_size`, at least one line.
pub fn block_len(line_len: usize, block_size: usize) -> usize {
    if line_len == 0 {
        return block_size.max(1);
    }

    (block_size / line_len).max(1) * line_len
}

/// Read a block, retrying busy replies within the source's policy. A raised
/// `cancel` flag ends the wait with `Cancelled` before the next attempt.
pub fn read_block(
    source: &mut dyn BlockSource,
    link: &mut Link,
    max: usize,
    sleeper: &mut dyn Sleeper,
    cancel: Option<&AtomicBool>,
) -> Result<Block> {
    let policy = source.busy_policy();

    let (block, _) = wait_until_ready(&policy, sleeper, "Image data", || {
        if cancel.is_some_and(|cancel| cancel.load(Ordering::SeqCst)) {
            return Err(SaneError::Cancelled);
        }

        match source.next_block(link, max)? {
            Block::Busy => Ok(Probe::Busy),
            block => Ok(Probe::Ready(block)),
        }
    })?;

    Ok(block)
}

/// Frame data already held in memory, such as a split infrared channel.
#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Vec<u8>,
    position: usize,
    line_len: usize,
}

impl MemorySource {
    pub fn new(data: Vec<u8>, line_len: usize) -> Self {
        Self {
            data,
            position: 0,
            line_len,
        }
    }
}

impl BlockSource for MemorySource {
    fn line_len(&self) -> usize {
        self.line_len
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    fn next_block(&mut self, _link: &mut Link, max: usize) -> Result<Block> {
        if self.position >= self.data.len() {
            return Ok(Block::End);
        }

        let end = (self.position + max).min(self.data.len());
        let block = self.data[self.position..end].to_vec();
        self.position = end;

        Ok(Block::Data(block))
    }
}

enum Message {
    Block(Vec<u8>),
    End,
    Failed(SaneError),
}

type WorkerResult = (Link, Box<dyn BlockSource>);

/// Worker thread reading ahead into a bounded queue of blocks.
pub struct OverlappedReader {
    blocks: Receiver<Message>,
    cancel: Arc<AtomicBool>,
    worker: Option<JoinHandle<WorkerResult>>,
    finished: bool,
}

impl OverlappedReader {
    pub fn spawn(
        link: Link,
        source: Box<dyn BlockSource>,
        buffers: usize,
        block_size: usize,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::sync_channel(buffers.max(1));
        let cancel = Arc::new(AtomicBool::new(false));
        let max = block_len(source.line_len(), block_size);

        log::debug!("Start reader with {buffers} buffers of {max} bytes");

        let worker = thread::Builder::new()
            .name("reader".to_owned())
            .spawn({
                let cancel = Arc::clone(&cancel);
                move || Self::run(link, source, tx, cancel, max)
            })
            .map_err(|err| {
                log::error!("Failed to spawn reader: {err}");
                SaneError::NoMem
            })?;

        Ok(Self {
            blocks: rx,
            cancel,
            worker: Some(worker),
            finished: false,
        })
    }

    fn run(
        mut link: Link,
        mut source: Box<dyn BlockSource>,
        tx: SyncSender<Message>,
        cancel: Arc<AtomicBool>,
        max: usize,
    ) -> WorkerResult {
        let mut sleeper = ThreadSleeper;

        loop {
            if cancel.load(Ordering::SeqCst) {
                log::debug!("Reader cancelled");
                break;
            }

            let message = match read_block(source.as_mut(), &mut link, max, &mut sleeper, Some(&*cancel)) {
                Ok(Block::Data(data)) => Message::Block(data),
                Ok(Block::End) => Message::End,
                Ok(Block::Busy) => continue,
                Err(SaneError::Cancelled) if cancel.load(Ordering::SeqCst) => {
                    log::debug!("Reader cancelled while waiting for data");
                    break;
                }
                Err(err) => Message::Failed(err),
            };

            let last = !matches!(message, Message::Block(_));
            if tx.send(message).is_err() || last {
                break;
            }
        }

        (link, source)
    }

    /// Next filled block, `None` at the end of the frame.
    pub fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        if self.finished {
            return Ok(None);
        }

        match self.blocks.recv() {
            Ok(Message::Block(data)) => Ok(Some(data)),
            Ok(Message::End) => {
                self.finished = true;
                Ok(None)
            }
            Ok(Message::Failed(err)) => {
                self.finished = true;
                Err(err)
            }
            Err(_) => {
                log::warn!("Reader stopped unexpectedly");
                self.finished = true;
                Err(SaneError::IO)
            }
        }
    }

    /// Stop the worker and take the link back.
    pub fn cancel(self) -> Result<WorkerResult> {
        self.cancel.store(true, Ordering::SeqCst);
        self.join()
    }

    /// Wait for the worker after the frame ended and take the link back.
    pub fn join(mut self) -> Result<WorkerResult> {
        // Drain so a worker blocked on a full queue can observe the flag.
        while self.blocks.recv().is_ok() {}

        let worker = self.worker.take().ok_or(SaneError::IO)?;
        worker.join().map_err(|_| {
            log::error!("Reader thread panicked");
            SaneError::IO
        })
    }
}

impl Drop for OverlappedReader {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.cancel.store(true, Ordering::SeqCst);
            while self.blocks.recv().is_ok() {}
            _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{command, transport::mock::MockTransport, wait::RecordingSleeper};
    use pretty_assertions::assert_eq;

    /// Source reading fixed-size lines with READ(10), busy on a check condition.
    struct LineSource {
        remaining: usize,
        line_len: usize,
    }

    impl BlockSource for LineSource {
        fn line_len(&self) -> usize {
            self.line_len
        }

        fn remaining(&self) -> usize {
            self.remaining
        }

        fn next_block(&mut self, link: &mut Link, max: usize) -> Result<Block> {
            if self.remaining == 0 {
                return Ok(Block::End);
            }

            let len = max.min(self.remaining);
            let reply = link.exchange(&command::read_10(0, 0, len)?)?;
            if reply.sense.is_some() {
                return Ok(Block::Busy);
            }

            self.remaining -= reply.data.len();
            Ok(Block::Data(reply.data))
        }
    }

    /// Source whose device never has data ready.
    struct StalledSource;

    impl BlockSource for StalledSource {
        fn line_len(&self) -> usize {
            16
        }

        fn remaining(&self) -> usize {
            16
        }

        fn next_block(&mut self, _link: &mut Link, _max: usize) -> Result<Block> {
            Ok(Block::Busy)
        }

        fn busy_policy(&self) -> RetryPolicy {
            RetryPolicy::fixed(600, Duration::from_millis(100))
        }
    }

    fn open_link(mock: MockTransport) -> Link {
        let mut link = Link::new(Box::new(mock));
        link.open("mock").unwrap();
        link
    }

    #[test]
    fn test_block_len_whole_lines() {
        assert_eq!(block_len(100, 1050), 1000);
        assert_eq!(block_len(100, 50), 100);
        assert_eq!(block_len(0, 64), 64);
    }

    #[test]
    fn test_busy_retried() {
        let mut mock = MockTransport::new();
        mock.push_check_condition(&[0x28], MockTransport::sense(0x02, 0x04, 0x01));
        mock.push_check_condition(&[0x28], MockTransport::sense(0x02, 0x04, 0x01));
        let mut link = open_link(mock);

        let mut source = LineSource {
            remaining: 4,
            line_len: 4,
        };
        let mut sleeper = RecordingSleeper::default();

        let block = read_block(&mut source, &mut link, 4, &mut sleeper, None).unwrap();

        assert_eq!(block, Block::Data(vec![0; 4]));
        assert_eq!(sleeper.delays(), vec![BUSY_DELAY; 2]);
    }

    #[test]
    fn test_overlapped_reads_whole_frame() {
        let mut mock = MockTransport::new();
        mock.reply(&[0x28], vec![7; 64]);
        let link = open_link(mock);

        let source = Box::new(LineSource {
            remaining: 40,
            line_len: 8,
        });
        let mut reader = OverlappedReader::spawn(link, source, 2, 20).unwrap();

        let mut frame = Vec::new();
        while let Some(block) = reader.recv().unwrap() {
            assert_eq!(block.len() % 8, 0);
            frame.extend(block);
        }

        assert_eq!(frame, vec![7; 40]);

        let (link, source) = reader.join().unwrap();
        assert!(link.is_open());
        assert_eq!(source.remaining(), 0);
    }

    #[test]
    fn test_overlapped_cancel_joins_worker() {
        let mock = MockTransport::new();
        let log = mock.log();
        let link = open_link(mock);

        let source = Box::new(LineSource {
            remaining: 1 << 20,
            line_len: 16,
        });
        let mut reader = OverlappedReader::spawn(link, source, 2, 16).unwrap();
        assert!(reader.recv().unwrap().is_some());

        let (link, source) = reader.cancel().unwrap();

        assert!(link.is_open());
        assert!(source.remaining() > 0);
        let reads = log.lock().unwrap().len();
        assert!(reads < (1 << 20) / 16);
    }

    #[test]
    fn test_raised_flag_ends_busy_wait() {
        let mut link = open_link(MockTransport::new());
        let mut sleeper = RecordingSleeper::default();
        let cancel = AtomicBool::new(true);

        let result = read_block(&mut StalledSource, &mut link, 16, &mut sleeper, Some(&cancel));

        assert_eq!(result, Err(SaneError::Cancelled));
        assert!(sleeper.delays().is_empty());
    }

    #[test]
    fn test_cancel_during_busy_wait_returns_promptly() {
        let link = open_link(MockTransport::new());
        let reader = OverlappedReader::spawn(link, Box::new(StalledSource), 1, 16).unwrap();
        thread::sleep(Duration::from_millis(250));

        let started = std::time::Instant::now();
        let (link, _) = reader.cancel().unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(link.is_open());
    }
}
