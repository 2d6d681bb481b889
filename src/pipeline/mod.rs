//! The frame pipeline: a fixed pool of frame slots and the bounded token
//! queues linking the service stages.
//!
//! Tokens flow one way around the ring: `available` → `captured` →
//! `differenced` → `selected` (→ `blurred`) and back to `available`, except
//! that the writer consumes the tokens it persists. Each queue holds up to
//! `N` tokens, so a send can only find a queue full if the at-most-one-owner
//! invariant has already been broken — which is why a full queue is fatal
//! rather than a backpressure condition.

mod frame;

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use color_eyre::eyre::{eyre, Result};
use crossbeam::utils::CachePadded;
use serde::{Deserialize, Serialize};

pub use frame::{Frame, FrameToken};

/// Static description of a pipeline: pool size, frame geometry, and whether
/// the blur link exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub frame_count: usize,
    pub width: u32,
    pub height: u32,
    pub blur: bool,
}

/// Names one of the token queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueId {
    Available,
    Captured,
    Differenced,
    Selected,
    Blurred,
}

impl QueueId {
    fn label(self) -> &'static str {
        match self {
            QueueId::Available => "available_frame_queue",
            QueueId::Captured => "captured_frame_queue",
            QueueId::Differenced => "differenced_frame_queue",
            QueueId::Selected => "selected_frame_queue",
            QueueId::Blurred => "blurred_frame_queue",
        }
    }
}

struct TokenQueue {
    tx: flume::Sender<FrameToken>,
    rx: flume::Receiver<FrameToken>,
}

impl TokenQueue {
    fn bounded(capacity: usize) -> Self {
        let (tx, rx) = flume::bounded(capacity);
        Self { tx, rx }
    }
}

#[derive(Default)]
struct Stats {
    sent: std::sync::atomic::AtomicU64,
    received: std::sync::atomic::AtomicU64,
    consumed: std::sync::atomic::AtomicU64,
}

pub struct FramePipeline {
    config: PipelineConfig,
    frames: Box<[Mutex<Frame>]>,
    available: TokenQueue,
    captured: TokenQueue,
    differenced: TokenQueue,
    selected: TokenQueue,
    blurred: Option<TokenQueue>,
    stats: CachePadded<Stats>,
}

fn recover<T>(result: Result<T, PoisonError<T>>) -> T {
    result.unwrap_or_else(PoisonError::into_inner)
}

impl FramePipeline {
    /// Allocate the frame pool and open the queues. Rejects pools too small
    /// for the difference stage's previous/current pair.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        if config.frame_count < 2 {
            return Err(eyre!(
                "frame pool of {} is too small: at least 2 slots are required",
                config.frame_count
            ));
        }
        if config.frame_count > u16::MAX as usize {
            return Err(eyre!(
                "frame pool of {} exceeds the token index range",
                config.frame_count
            ));
        }
        if config.width == 0 || config.height == 0 {
            return Err(eyre!(
                "frame dimensions {}x{} are degenerate",
                config.width,
                config.height
            ));
        }

        let frames = (0..config.frame_count)
            .map(|_| Mutex::new(Frame::new(config.width, config.height)))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            frames,
            available: TokenQueue::bounded(config.frame_count),
            captured: TokenQueue::bounded(config.frame_count),
            differenced: TokenQueue::bounded(config.frame_count),
            selected: TokenQueue::bounded(config.frame_count),
            blurred: config
                .blur
                .then(|| TokenQueue::bounded(config.frame_count)),
            stats: CachePadded::new(Stats::default()),
            config,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.config.width, self.config.height)
    }

    /// All tokens of the pool, for the capture stage's warmup fill.
    pub fn tokens(&self) -> impl Iterator<Item = FrameToken> + '_ {
        (0..self.frames.len()).map(FrameToken::new)
    }

    /// Access the slot a token stands for. The token-handoff protocol keeps
    /// every slot single-owner, so this lock is never contended.
    pub fn frame(&self, token: FrameToken) -> MutexGuard<'_, Frame> {
        recover(self.frames[token.index()].lock())
    }

    fn queue(&self, id: QueueId) -> Result<&TokenQueue> {
        match id {
            QueueId::Available => Ok(&self.available),
            QueueId::Captured => Ok(&self.captured),
            QueueId::Differenced => Ok(&self.differenced),
            QueueId::Selected => Ok(&self.selected),
            QueueId::Blurred => self
                .blurred
                .as_ref()
                .ok_or_else(|| eyre!("pipeline was built without the blur link")),
        }
    }

    /// Deposit a token. A full or closed queue is an ownership-invariant
    /// violation and therefore fatal to the run.
    pub fn send(&self, id: QueueId, token: FrameToken) -> Result<()> {
        let queue = self.queue(id)?;
        queue
            .tx
            .try_send(token)
            .map_err(|err| eyre!("mq_send-equivalent failed on {}: {err}", id.label()))?;
        self.stats
            .sent
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }

    /// Take the next token, blocking until one arrives.
    pub fn recv(&self, id: QueueId) -> Result<FrameToken> {
        let queue = self.queue(id)?;
        let token = queue
            .rx
            .recv()
            .map_err(|err| eyre!("receive failed on {}: {err}", id.label()))?;
        self.stats
            .received
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(token)
    }

    /// Take the next token, waiting at most `timeout`. `None` on timeout.
    pub fn recv_timeout(&self, id: QueueId, timeout: Duration) -> Result<Option<FrameToken>> {
        let queue = self.queue(id)?;
        match queue.rx.recv_timeout(timeout) {
            Ok(token) => {
                self.stats
                    .received
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                Ok(Some(token))
            }
            Err(flume::RecvTimeoutError::Timeout) => Ok(None),
            Err(err) => Err(eyre!("receive failed on {}: {err}", id.label())),
        }
    }

    /// Retire a token permanently (writer-side ownership consumption).
    pub fn consume(&self, token: FrameToken) {
        let _ = token;
        self.stats
            .consumed
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn queue_len(&self, id: QueueId) -> usize {
        match self.queue(id) {
            Ok(queue) => queue.rx.len(),
            Err(_) => 0,
        }
    }

    pub fn consumed_count(&self) -> u64 {
        self.stats
            .consumed
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    /// (sends, receives, consumed) across all queues.
    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.stats.sent.load(std::sync::atomic::Ordering::Relaxed),
            self.stats
                .received
                .load(std::sync::atomic::Ordering::Relaxed),
            self.stats
                .consumed
                .load(std::sync::atomic::Ordering::Relaxed),
        )
    }

    /// Tokens currently visible in queues, plus tokens retired by the
    /// writer. The remainder of the pool is held inside stages.
    pub fn accounted_tokens(&self) -> usize {
        let queued = self.queue_len(QueueId::Available)
            + self.queue_len(QueueId::Captured)
            + self.queue_len(QueueId::Differenced)
            + self.queue_len(QueueId::Selected)
            + self.queue_len(QueueId::Blurred);
        queued + self.consumed_count() as usize
    }
}
