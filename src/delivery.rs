//! Bounded hand-off between driver threads and receive handlers.
//!
//! Driver threads push deliveries into the queue; spawned workers and any
//! thread donated through [`DeliveryQueue::serve`] pop and run them.
use std::{
    sync::{
        Arc, Mutex,
        mpsc::{self, Receiver, SyncSender},
    },
    thread::{self, JoinHandle},
};

use log::debug;

use crate::sync::lock;

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug)]
pub(crate) struct DeliveryQueue {
    sender: Mutex<Option<SyncSender<Job>>>,
    receiver: Arc<Mutex<Receiver<Job>>>,
    workers: Mutex<Vec<Worker>>,
}

impl DeliveryQueue {
    pub fn new(capacity: usize, workers: usize) -> Self {
        let (sender, receiver) = mpsc::sync_channel(capacity);
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..workers)
            .filter_map(|id| Worker::new(id, Arc::clone(&receiver)))
            .collect();

        Self {
            sender: Mutex::new(Some(sender)),
            receiver,
            workers: Mutex::new(workers),
        }
    }

    /// Queues `job`, blocking while the queue is full. The job is handed
    /// back once the queue is closed.
    pub fn push(&self, job: Job) -> Result<(), Job> {
        let sender = lock(&self.sender).clone();
        match sender {
            Some(sender) => sender.send(job).map_err(|e| e.0),
            None => Err(job),
        }
    }

    /// Runs queued jobs on the calling thread until the queue is closed.
    pub fn serve(&self) {
        debug!("thread {:?} donated to delivery", thread::current().id());
        drain(&self.receiver);
    }

    /// Stops accepting jobs, lets the workers finish what is queued and joins
    /// them.
    pub fn close(&self) {
        drop(lock(&self.sender).take());

        let workers: Vec<_> = lock(&self.workers).drain(..).collect();
        for worker in workers {
            debug!("shutting down delivery worker {}", worker.id);
            if worker.thread.thread().id() != thread::current().id() {
                let _ = worker.thread.join();
            }
        }
    }
}

fn drain(receiver: &Mutex<Receiver<Job>>) {
    loop {
        let job = lock(receiver).recv();
        match job {
            Ok(job) => job(),
            Err(_) => return,
        }
    }
}

#[derive(Debug)]
struct Worker {
    id: usize,
    thread: JoinHandle<()>,
}

impl Worker {
    fn new(id: usize, receiver: Arc<Mutex<Receiver<Job>>>) -> Option<Self> {
        let spawned = thread::Builder::new()
            .name(format!("delivery-{id}"))
            .spawn(move || {
                drain(&receiver);
                debug!("delivery worker {id} disconnected");
            });
        match spawned {
            Ok(thread) => Some(Self { id, thread }),
            Err(e) => {
                log::warn!("failed to start delivery worker {id}: {e}");
                None
            }
        }
    }
}
