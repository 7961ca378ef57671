//! Background Threads
//!
//! ```text
//!  commit (async) ──► [ bounded channel (1) ] ──► atlasmv-serializer
//!                                                   builds + writes chunks
//!
//!  atlasmv-writer: every auto_commit_delay / 10
//!      └─► trigger_auto_save: commit when the delay passed, maybe compact
//! ```
//!
//! The serializer never takes the store lock, so a committer holding it may
//! always wait for the serializer to drain.

use std::sync::Weak;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, SendError, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{AtlasError, ErrorCode, Result};

use super::StoreCore;

/// Work handed to the serializer thread
pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Job),
    /// Answered once everything queued before it has run
    Barrier(Sender<()>),
    Stop,
}

// =============================================================================
// Serializer
// =============================================================================

/// Single worker that runs chunk writes in submission order
pub(crate) struct Serializer {
    sender: Sender<Message>,
    handle: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl Serializer {
    pub(crate) fn start() -> Result<Self> {
        let (sender, receiver) = channel::bounded::<Message>(1);
        let handle = thread::Builder::new()
            .name("atlasmv-serializer".into())
            .spawn(move || {
                debug!("Serializer started");
                for message in receiver.iter() {
                    match message {
                        Message::Run(job) => job(),
                        Message::Barrier(done) => {
                            let _ = done.send(());
                        }
                        Message::Stop => break,
                    }
                }
                debug!("Serializer stopped");
            })
            .map_err(|e| AtlasError::io(ErrorCode::Internal, "Could not start the serializer", e))?;
        let thread_id = handle.thread().id();
        Ok(Self {
            sender,
            handle: Mutex::new(Some(handle)),
            thread_id,
        })
    }

    fn is_current_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Queue `job`; hands it back if the worker is gone
    pub(crate) fn submit(&self, job: Job) -> std::result::Result<(), Job> {
        match self.sender.send(Message::Run(job)) {
            Ok(()) => Ok(()),
            Err(SendError(Message::Run(job))) => Err(job),
            Err(_) => Ok(()),
        }
    }

    /// Block until every job submitted so far has finished
    pub(crate) fn wait(&self) {
        if self.is_current_thread() {
            return;
        }
        let (done, finished) = channel::bounded(1);
        if self.sender.send(Message::Barrier(done)).is_ok() {
            let _ = finished.recv();
        }
    }

    /// Finish queued jobs and end the thread
    pub(crate) fn stop(&self) {
        let _ = self.sender.send(Message::Stop);
        if self.is_current_thread() {
            return;
        }
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                warn!("Serializer thread panicked");
            }
        }
    }
}

// =============================================================================
// Background Writer
// =============================================================================

/// Periodic auto-save
pub(crate) struct BackgroundWriter {
    stop: Sender<()>,
    handle: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl BackgroundWriter {
    pub(crate) fn start(store: Weak<StoreCore>, delay_ms: u64) -> Result<Self> {
        let (stop, stopped) = channel::bounded::<()>(1);
        let interval = Duration::from_millis((delay_ms / 10).max(1));
        let handle = thread::Builder::new()
            .name("atlasmv-writer".into())
            .spawn(move || {
                debug!(interval_ms = interval.as_millis() as u64, "Background writer started");
                loop {
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        _ => break,
                    }
                    let Some(store) = store.upgrade() else {
                        break;
                    };
                    if let Err(e) = store.trigger_auto_save(false) {
                        warn!(error = %e, "Background auto-save failed");
                        store.handle_error(&e);
                    }
                }
                debug!("Background writer stopped");
            })
            .map_err(|e| AtlasError::io(ErrorCode::Internal, "Could not start the background writer", e))?;
        let thread_id = handle.thread().id();
        Ok(Self {
            stop,
            handle: Some(handle),
            thread_id,
        })
    }

    fn stop(mut self) {
        let _ = self.stop.send(());
        if thread::current().id() == self.thread_id {
            return;
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Background writer thread panicked");
            }
        }
    }
}

// =============================================================================
// Store Side
// =============================================================================

impl StoreCore {
    pub(crate) fn start_background(&self) -> Result<()> {
        let serializer = Serializer::start()?;
        *self.serializer.lock() = Some(std::sync::Arc::new(serializer));
        let writer = BackgroundWriter::start(self.weak_self.clone(), self.config.auto_commit_delay_ms)?;
        *self.writer.lock() = Some(writer);
        info!(
            delay_ms = self.config.auto_commit_delay_ms,
            "Started background serializer and writer"
        );
        Ok(())
    }

    /// Stop both threads; queued chunk writes still complete
    pub(crate) fn stop_background(&self) {
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            writer.stop();
        }
        let serializer = self.serializer.lock().take();
        if let Some(serializer) = serializer {
            serializer.stop();
        }
    }

    pub(crate) fn has_serializer(&self) -> bool {
        self.serializer.lock().is_some()
    }

    /// Wait for the in-flight background chunk write, if any
    pub(crate) fn wait_for_serializer(&self) {
        let serializer = self.serializer.lock().clone();
        if let Some(serializer) = serializer {
            serializer.wait();
        }
    }
}
