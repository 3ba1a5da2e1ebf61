//! Chain event listeners and the fire-and-forget command executor.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Sender, TrySendError};
use kestrel_consensus::Hash256;
use kestrel_primitives::{Block, Transaction};

/// Receives chain events. Callbacks run synchronously under the chain
/// lock and in a fixed order, so implementations must return quickly.
pub trait ChainListener: Send + Sync {
    fn block_connected(&self, _hash: &Hash256, _block: &Block) {}
    fn block_disconnected(&self, _hash: &Hash256, _block: &Block) {}
    fn transaction_accepted(&self, _txid: &Hash256, _tx: &Transaction) {}
    /// A confirmed transaction conflicted with a pool transaction.
    fn double_spend_detected(&self, _pool_txid: &Hash256, _confirmed_txid: &Hash256) {}
    fn tip_changed(&self, _hash: &Hash256, _height: i32) {}
}

#[derive(Clone, Default)]
pub struct Listeners {
    listeners: Vec<Arc<dyn ChainListener>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, listener: Arc<dyn ChainListener>) {
        self.listeners.push(listener);
    }

    pub fn block_connected(&self, hash: &Hash256, block: &Block) {
        for listener in &self.listeners {
            listener.block_connected(hash, block);
        }
    }

    pub fn block_disconnected(&self, hash: &Hash256, block: &Block) {
        for listener in &self.listeners {
            listener.block_disconnected(hash, block);
        }
    }

    pub fn transaction_accepted(&self, txid: &Hash256, tx: &Transaction) {
        for listener in &self.listeners {
            listener.transaction_accepted(txid, tx);
        }
    }

    pub fn double_spend_detected(&self, pool_txid: &Hash256, confirmed_txid: &Hash256) {
        for listener in &self.listeners {
            listener.double_spend_detected(pool_txid, confirmed_txid);
        }
    }

    pub fn tip_changed(&self, hash: &Hash256, height: i32) {
        for listener in &self.listeners {
            listener.tip_changed(hash, height);
        }
    }
}

/// Bounded worker that runs notification commands off the chain lock.
/// Commands are fire-and-forget: when the queue is full they are
/// dropped, and no ordering is guaranteed across commands.
pub struct CommandExecutor {
    sender: Option<Sender<Box<dyn FnOnce() + Send>>>,
    worker: Option<JoinHandle<()>>,
}

impl CommandExecutor {
    pub fn new(queue_depth: usize) -> Self {
        let (sender, receiver) = bounded::<Box<dyn FnOnce() + Send>>(queue_depth.max(1));
        let worker = std::thread::Builder::new()
            .name("notify-exec".to_string())
            .spawn(move || {
                while let Ok(command) = receiver.recv() {
                    command();
                }
            })
            .ok();
        Self {
            sender: Some(sender),
            worker,
        }
    }

    /// Queues a command; returns false when it was dropped.
    pub fn fire(&self, command: impl FnOnce() + Send + 'static) -> bool {
        match &self.sender {
            Some(sender) => !matches!(
                sender.try_send(Box::new(command)),
                Err(TrySendError::Full(_) | TrySendError::Disconnected(_))
            ),
            None => false,
        }
    }
}

impl Drop for CommandExecutor {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl ChainListener for Recorder {
        fn block_connected(&self, _hash: &Hash256, _block: &Block) {
            self.events.lock().unwrap().push("connect".to_string());
        }

        fn tip_changed(&self, _hash: &Hash256, height: i32) {
            self.events.lock().unwrap().push(format!("tip {height}"));
        }
    }

    #[test]
    fn listeners_fire_in_registration_order() {
        let recorder = Arc::new(Recorder::default());
        let mut listeners = Listeners::new();
        listeners.register(recorder.clone());

        let block = Block {
            header: kestrel_primitives::BlockHeader {
                version: 2,
                prev_block: [0u8; 32],
                merkle_root: [0u8; 32],
                time: 0,
                bits: 0,
                nonce: 0,
            },
            transactions: Vec::new(),
        };
        listeners.block_connected(&[0x01; 32], &block);
        listeners.tip_changed(&[0x01; 32], 9);
        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec!["connect".to_string(), "tip 9".to_string()]
        );
    }

    #[test]
    fn executor_runs_queued_commands() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let executor = CommandExecutor::new(16);
            for _ in 0..8 {
                let counter = Arc::clone(&counter);
                assert!(executor.fire(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }));
            }
            // Drop joins the worker, draining the queue.
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }
}
