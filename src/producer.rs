//! Producer worker threads.
//!
//! Each producer loops WaitingForToken -> Synthesizing -> Depositing. The
//! produce-token semaphore is a typed channel of `()`; finished frames travel
//! through a bounded channel that doubles as the frames-available semaphore
//! and the FIFO handoff deque. A producer observes the stop flag only at the
//! top of its loop: a stop requested mid-synthesis lets the current frame
//! finish, matching the no-mid-synthesis-preemption rule.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};

use crate::context::PipelineContext;
use crate::frame::Frame;
use crate::synth::FrameSynthesizer;

/// Scheduler-side handle to one producer thread.
///
/// `pending` counts tokens granted but not yet answered by a popped frame,
/// i.e. queued frames plus in-flight work. Only the scheduler thread touches
/// it, so it needs no synchronization of its own.
pub struct ProducerHandle {
    index: usize,
    tokens: mpsc::Sender<()>,
    frames: mpsc::Receiver<Frame>,
    stop: Arc<AtomicBool>,
    pending: usize,
    worker: Option<JoinHandle<()>>,
}

impl ProducerHandle {
    /// Spawn a producer with its own synthesizer (and therefore its own
    /// entropy stream, seeded from the context's incrementing counter).
    pub fn spawn(index: usize, ctx: Arc<PipelineContext>, queue_depth: usize) -> Result<Self> {
        let (token_tx, token_rx) = mpsc::channel::<()>();
        let (frame_tx, frame_rx) = mpsc::sync_channel::<Frame>(queue_depth.max(1));
        let stop = Arc::new(AtomicBool::new(false));

        let worker_stop = Arc::clone(&stop);
        let worker = thread::Builder::new()
            .name(format!("checkflicker-producer-{index}"))
            .spawn(move || {
                let mut synth = FrameSynthesizer::new(ctx);
                while token_rx.recv().is_ok() {
                    if worker_stop.load(Ordering::Acquire) {
                        break;
                    }
                    let frame = synth.synthesize();
                    if frame_tx.send(frame).is_err() {
                        break;
                    }
                }
            })
            .with_context(|| format!("failed to spawn producer thread {index}"))?;

        Ok(Self {
            index,
            tokens: token_tx,
            frames: frame_rx,
            stop,
            pending: 0,
            worker: Some(worker),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Queued frames plus in-flight token count.
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Release one produce-token to this worker.
    pub fn grant_token(&mut self) {
        if self.tokens.send(()).is_ok() {
            self.pending += 1;
        }
    }

    /// Pop the oldest queued frame without blocking.
    pub fn try_take_frame(&mut self) -> Option<Frame> {
        match self.frames.try_recv() {
            Ok(frame) => {
                self.pending = self.pending.saturating_sub(1);
                Some(frame)
            }
            Err(_) => None,
        }
    }

    /// Blocking pop; allowed only in simulated (non-real-time) mode.
    pub fn take_frame_blocking(&mut self) -> Option<Frame> {
        match self.frames.recv() {
            Ok(frame) => {
                self.pending = self.pending.saturating_sub(1);
                Some(frame)
            }
            Err(_) => None,
        }
    }

    /// Stop flag, wake token, join, then drain residual frames.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.tokens.send(());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        while self.frames.try_recv().is_ok() {}
        self.pending = 0;
    }
}

impl Drop for ProducerHandle {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}
