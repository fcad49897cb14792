use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::client::{Client, ClientOps};
use crate::hub::Hub;
use crate::{listener, source};

/// What a tick decided about its client.
#[derive(Debug)]
pub enum Disposition {
    /// Reschedule at `client.schedule_ms`.
    Continue,
    /// Drop the client; release work already ran.
    Release,
    /// Hand the client to another worker.
    Move(Arc<WorkerHandle>),
}

pub enum WorkerCmd {
    Attach(Box<Client>),
    Wake,
    Shutdown,
}

/// Shared face of one worker loop. Time fields are cached once per loop
/// pass so ticks read a consistent clock without syscalls.
#[derive(Debug)]
pub struct WorkerHandle {
    pub id: usize,
    time_ms: AtomicU64,
    time_sec: AtomicU64,
    count: AtomicUsize,
    tx: mpsc::UnboundedSender<WorkerCmd>,
}

impl WorkerHandle {
    fn new(id: usize, tx: mpsc::UnboundedSender<WorkerCmd>) -> Self {
        Self {
            id,
            time_ms: AtomicU64::new(0),
            time_sec: AtomicU64::new(0),
            count: AtomicUsize::new(0),
            tx,
        }
    }

    /// Handle with no loop behind it, for driving ticks by hand.
    pub fn detached(id: usize) -> Arc<Self> {
        let (tx, _rx) = mpsc::unbounded_channel();
        Arc::new(Self::new(id, tx))
    }

    pub fn time_ms(&self) -> u64 {
        self.time_ms.load(Ordering::Acquire)
    }

    pub fn time_sec(&self) -> u64 {
        self.time_sec.load(Ordering::Acquire)
    }

    pub fn set_time(&self, ms: u64) {
        self.time_ms.store(ms, Ordering::Release);
        self.time_sec.store(ms / 1000, Ordering::Release);
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn wakeup(&self) {
        let _ = self.tx.send(WorkerCmd::Wake);
    }

    /// Move a client onto this worker. Gives the client back when the
    /// loop is gone.
    pub fn attach(&self, client: Box<Client>) -> Result<(), Box<Client>> {
        self.tx.send(WorkerCmd::Attach(client)).map_err(|e| match e.0 {
            WorkerCmd::Attach(c) => c,
            _ => unreachable!(),
        })
    }

    fn shutdown(&self) {
        let _ = self.tx.send(WorkerCmd::Shutdown);
    }
}

struct Scheduled {
    due_ms: u64,
    seq: u64,
    client: Box<Client>,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due_ms == other.due_ms && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // min-heap on (due_ms, seq)
        other
            .due_ms
            .cmp(&self.due_ms)
            .then(other.seq.cmp(&self.seq))
    }
}

/// The fixed set of cooperative workers. Read-locked for consultation,
/// write-locked only while workers come and go.
pub struct WorkerPool {
    pub workers: RwLock<Vec<Arc<WorkerHandle>>>,
    next_id: AtomicUsize,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self {
            workers: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }

    pub fn spawn_worker(&self, hub: &Arc<Hub>) -> Arc<WorkerHandle> {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Arc::new(WorkerHandle::new(id, tx));
        handle.set_time(hub.now_ms());
        self.workers.write().push(handle.clone());
        tokio::spawn(worker_loop(hub.clone(), handle.clone(), rx));
        handle
    }

    pub fn get(&self, id: usize) -> Option<Arc<WorkerHandle>> {
        self.workers.read().iter().find(|w| w.id == id).cloned()
    }

    pub fn least_busy(&self) -> Option<Arc<WorkerHandle>> {
        self.workers
            .read()
            .iter()
            .min_by_key(|w| w.count())
            .cloned()
    }

    pub fn attach(&self, client: Box<Client>) -> Result<(), Box<Client>> {
        match self.least_busy() {
            Some(w) => {
                let r = w.attach(client);
                if r.is_ok() {
                    w.wakeup();
                }
                r
            }
            None => Err(client),
        }
    }

    pub fn shutdown(&self) {
        for w in self.workers.read().iter() {
            w.shutdown();
        }
    }

    pub fn total_clients(&self) -> usize {
        self.workers.read().iter().map(|w| w.count()).sum()
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Run one client tick.
pub fn process_client(hub: &Arc<Hub>, worker: &Arc<WorkerHandle>, client: &mut Client) -> Disposition {
    match client.ops {
        ClientOps::SourceHttpSend => source::http_send_tick(hub, worker, client),
        ClientOps::SourceRead => source::producer_tick(hub, worker, client),
        ClientOps::SourceTerminate => source::terminate_tick(hub, worker, client),
        ClientOps::Listener => listener::listener_tick(hub, worker, client),
        ClientOps::ListenerPause => listener::pause_tick(hub, worker, client),
        ClientOps::ListenerWait => listener::wait_tick(hub, worker, client),
        ClientOps::Fserve => {
            client.fold_signals();
            if client.connection.error || hub.hooks.fserve.tick(client, worker.time_ms()) < 0 {
                hub.stats
                    .update_global(|g| g.listeners = g.listeners.saturating_sub(1));
                Disposition::Release
            } else {
                Disposition::Continue
            }
        }
    }
}

async fn worker_loop(
    hub: Arc<Hub>,
    me: Arc<WorkerHandle>,
    mut rx: mpsc::UnboundedReceiver<WorkerCmd>,
) {
    let mut heap: BinaryHeap<Scheduled> = BinaryHeap::new();
    let mut seq: u64 = 0;
    tracing::debug!("worker {} starting", me.id);
    loop {
        let now = hub.now_ms();
        me.set_time(now);

        let mut rescan = false;
        loop {
            match rx.try_recv() {
                Ok(WorkerCmd::Attach(client)) => {
                    adopt(&me, &mut heap, &mut seq, client, now);
                }
                Ok(WorkerCmd::Wake) => rescan = true,
                Ok(WorkerCmd::Shutdown) => {
                    tracing::debug!("worker {} stopping with {} clients", me.id, heap.len());
                    return;
                }
                Err(_) => break,
            }
        }
        if rescan {
            let mut parked: Vec<Scheduled> = heap.drain().collect();
            for s in &mut parked {
                if s.client.signal.wake.swap(false, Ordering::AcqRel) {
                    s.due_ms = now;
                    s.client.schedule_ms = now;
                }
            }
            heap = parked.into_iter().collect();
        }

        while let Some(top) = heap.peek() {
            if top.due_ms > now {
                break;
            }
            let mut entry = heap.pop().expect("peeked entry");
            entry.client.signal.wake.store(false, Ordering::Release);
            match process_client(&hub, &me, &mut entry.client) {
                Disposition::Continue => {
                    // minimum nap between ticks of the same client
                    entry.due_ms = entry.client.schedule_ms.max(now + 5);
                    entry.seq = seq;
                    seq += 1;
                    entry
                        .client
                        .signal
                        .next_due_ms
                        .store(entry.due_ms, Ordering::Release);
                    heap.push(entry);
                }
                Disposition::Release => {
                    me.count.fetch_sub(1, Ordering::AcqRel);
                    tracing::debug!(
                        "worker {} released client {}",
                        me.id,
                        entry.client.connection.id
                    );
                }
                Disposition::Move(target) => match target.attach(entry.client) {
                    Ok(()) => {
                        me.count.fetch_sub(1, Ordering::AcqRel);
                        target.wakeup();
                    }
                    Err(client) => {
                        // target loop is gone, keep the client here
                        adopt(&me, &mut heap, &mut seq, client, now);
                        me.count.fetch_sub(1, Ordering::AcqRel);
                    }
                },
            }
        }

        let next_due = heap.peek().map(|s| s.due_ms).unwrap_or(now + 500);
        let deadline = hub.instant_at(next_due);
        tokio::select! {
            cmd = rx.recv() => {
                let now = hub.now_ms();
                me.set_time(now);
                match cmd {
                    Some(WorkerCmd::Attach(client)) => adopt(&me, &mut heap, &mut seq, client, now),
                    Some(WorkerCmd::Wake) => {
                        let mut parked: Vec<Scheduled> = heap.drain().collect();
                        for s in &mut parked {
                            if s.client.signal.wake.swap(false, Ordering::AcqRel) {
                                s.due_ms = now;
                                s.client.schedule_ms = now;
                            }
                        }
                        heap = parked.into_iter().collect();
                    }
                    Some(WorkerCmd::Shutdown) | None => {
                        tracing::debug!("worker {} stopping with {} clients", me.id, heap.len());
                        return;
                    }
                }
            }
            _ = tokio::time::sleep_until(deadline) => {}
        }
    }
}

fn adopt(
    me: &Arc<WorkerHandle>,
    heap: &mut BinaryHeap<Scheduled>,
    seq: &mut u64,
    client: Box<Client>,
    now: u64,
) {
    me.count.fetch_add(1, Ordering::AcqRel);
    client.signal.worker.store(me.id, Ordering::Release);
    let due_ms = if client.schedule_ms == 0 {
        now
    } else {
        client.schedule_ms
    };
    client.signal.next_due_ms.store(due_ms, Ordering::Release);
    heap.push(Scheduled {
        due_ms,
        seq: *seq,
        client,
    });
    *seq += 1;
}

/// Every few seconds a source checks whether a less busy worker should
/// take its producer. Listeners stay put; they migrate towards the
/// source on their own schedule.
pub fn source_change_worker(
    hub: &Arc<Hub>,
    current: &Arc<WorkerHandle>,
    listeners: u64,
) -> Option<Arc<WorkerHandle>> {
    let workers = hub.pool.workers.read();
    let target = workers.iter().min_by_key(|w| w.count())?.clone();
    drop(workers);
    if target.id != current.id
        && target.count() + listeners as usize + 10 < current.count()
    {
        tracing::debug!("moving source from worker {} to {}", current.id, target.id);
        return Some(target);
    }
    None
}

/// Move a listener onto its source's worker for locality, unless that
/// worker is already heavily loaded relative to this one.
pub fn listener_change_worker(
    hub: &Arc<Hub>,
    current: &Arc<WorkerHandle>,
    source_worker_id: usize,
    listeners: u64,
) -> Option<Arc<WorkerHandle>> {
    if source_worker_id == current.id {
        return None;
    }
    let dest = hub.pool.get(source_worker_id)?;
    let trigger = (listeners + 10).max(1000) as i64;
    let diff = dest.count() as i64 - current.count() as i64;
    if diff < trigger {
        tracing::debug!("moving listener from worker {} to {}", current.id, dest.id);
        return Some(dest);
    }
    None
}
