//! # Listener Dispatch
//!
//! Each session owns one [`DeliveryExecutor`]: a worker thread draining an
//! unbounded channel of tasks in submission order. Listener invocations of
//! all consumers of a session run on it, one at a time.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc;

use crate::errors::{BridgeError, BridgeResult};
use crate::message::Message;
use crate::observability::Logger;

/// Asynchronous message callback
pub trait MessageListener: Send + Sync {
    fn on_message(&self, message: Message);
}

impl<F> MessageListener for F
where
    F: Fn(Message) + Send + Sync,
{
    fn on_message(&self, message: Message) {
        self(message)
    }
}

/// Unit of work run on the executor
pub type DispatchTask = Box<dyn FnOnce() + Send + 'static>;

/// Ordered single-thread task runner
pub struct DeliveryExecutor {
    name: String,
    sender: Mutex<Option<mpsc::UnboundedSender<DispatchTask>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DeliveryExecutor {
    /// Spawn the worker thread
    pub fn spawn(name: impl Into<String>) -> BridgeResult<Self> {
        let name = name.into();
        let (sender, mut receiver) = mpsc::unbounded_channel::<DispatchTask>();
        let worker = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                while let Some(task) = receiver.blocking_recv() {
                    task();
                }
            })
            .map_err(|e| BridgeError::IllegalState(format!("cannot spawn {}: {}", name, e)))?;

        Ok(Self {
            name,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queue a task behind every task submitted before it
    pub fn execute(&self, task: DispatchTask) -> BridgeResult<()> {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref() {
            Some(tx) => tx
                .send(task)
                .map_err(|_| BridgeError::IllegalState(format!("{} stopped", self.name))),
            None => Err(BridgeError::IllegalState(format!("{} stopped", self.name))),
        }
    }

    /// Stop accepting tasks, let queued tasks finish and join the worker.
    ///
    /// When called from a task on this executor the worker is not joined;
    /// it exits after the current task returns.
    pub fn shutdown(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(sender);

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if worker.thread().id() == thread::current().id() {
                return;
            }
            if worker.join().is_err() {
                Logger::error("DISPATCH_WORKER_PANICKED", &[("executor", &self.name)]);
            }
        }
    }

    /// True until `shutdown` is called
    pub fn is_running(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl Drop for DeliveryExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Wrap a listener so it can be shared with dispatch tasks
pub fn listener<L: MessageListener + 'static>(listener: L) -> Arc<dyn MessageListener> {
    Arc::new(listener)
}
