use std::sync::{Arc, Barrier, Mutex};
use std::thread;

use eyre::{eyre, Result};

use super::{Communicator, Payload};

struct Exchange {
    slots: Mutex<Vec<Option<Payload>>>,
    barrier: Barrier,
}

/// One worker of an in-process [LocalGroup]
#[derive(Clone)]
pub struct LocalComm {
    rank: usize,
    size: usize,
    exchange: Arc<Exchange>,
}

impl std::fmt::Debug for LocalComm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalComm")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish()
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn allgather(&self, payload: Payload) -> Result<Vec<Payload>> {
        {
            let mut slots = self
                .exchange
                .slots
                .lock()
                .map_err(|_| eyre!("exchange poisoned by a panicking worker"))?;
            slots[self.rank] = Some(payload);
        }
        // Everyone has written
        self.exchange.barrier.wait();
        let gathered = {
            let slots = self
                .exchange
                .slots
                .lock()
                .map_err(|_| eyre!("exchange poisoned by a panicking worker"))?;
            slots
                .iter()
                .enumerate()
                .map(|(rank, slot)| {
                    slot.clone()
                        .ok_or_else(|| eyre!("rank {} did not contribute to the collective", rank))
                })
                .collect::<Result<Vec<_>>>()?
        };
        // Everyone has read, slots may be reused
        self.exchange.barrier.wait();
        Ok(gathered)
    }
}

/// A group of workers living on threads of the current process.
///
/// Used to simulate a distributed run: each worker gets its own [LocalComm] and shard,
/// and collectives synchronize through a shared slot table and a barrier.
pub struct LocalGroup;

impl LocalGroup {
    /// Create the communicators of a group of `size` workers
    pub fn new(size: usize) -> Vec<LocalComm> {
        let size = size.max(1);
        let exchange = Arc::new(Exchange {
            slots: Mutex::new(vec![None; size]),
            barrier: Barrier::new(size),
        });
        (0..size)
            .map(|rank| LocalComm {
                rank,
                size,
                exchange: Arc::clone(&exchange),
            })
            .collect()
    }

    /// Run `worker` on `size` threads, one per rank, and collect the results in rank order
    pub fn run<T, F>(size: usize, worker: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(LocalComm) -> Result<T> + Sync,
    {
        let comms = Self::new(size);
        let worker = &worker;
        thread::scope(|scope| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| scope.spawn(move || worker(comm)))
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .map_err(|_| eyre!("worker thread panicked"))?
                })
                .collect()
        })
    }
}
