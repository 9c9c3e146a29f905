// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The scheduler: machines, processors, spawn routing and the wake chain.
//!
//! The [`Executor`] owns a fixed set of [`Processor`]s and a grow-on-demand
//! set of [`Machine`]s (OS threads). A machine binds to at most one
//! processor at a time and drives it through the state machine in
//! [`Executor::next_task`]; unbound machines park. The count of machines
//! grows up to the processor count, plus transient extras while processors
//! sit blocked inside their reactors.
//!
//! The no-lost-wakeup chain lives in [`Executor::need_spinning`]: whenever a
//! task becomes ready, either a running processor will find it in its next
//! loop iteration, or a waiting-spinning processor is notified, or an idle
//! processor is promoted, or a polling processor is kicked out of the
//! kernel. Dropping a task on the floor is impossible because both the
//! waiting-spinning and the polling transitions re-check the `need_spinning`
//! flag *after* publishing their state.

pub(crate) mod processor;
pub(crate) mod queue;
pub(crate) mod steal;

use crate::error::SpawnError;
use crate::executor::processor::{ProcState, Processor};
use crate::executor::queue::{StealBatch, MAX_STEAL_BATCH};
use crate::executor::steal::Injector;
use crate::reactor::Reactor;
use crate::task::{JoinHandle, PollResult, TaskRef};
use core::cell::{Cell, RefCell};
use core::future::Future;
use core::fmt;
use core::ptr::NonNull;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// The interface a task uses to hand itself back to its runtime when woken.
///
/// Factored into a trait so the task machinery can be exercised against a
/// mock scheduler in unit tests.
pub(crate) trait Schedule: Clone + Send + Sync + 'static {
    /// Enqueue a woken task.
    fn schedule(&self, task: TaskRef);
}

/// An M:N task runtime: a fixed pool of processors multiplexing tasks over a
/// demand-grown pool of OS threads, with a per-processor io_uring reactor.
///
/// The processor count is a construction parameter with no default; it caps
/// parallelism for the lifetime of the executor.
pub struct Executor {
    processors: Box<[Processor]>,
    /// The global run queue.
    injector: Injector,
    /// Idle processor / machine lists and the machine registry; the "global
    /// lock" of the scheduler.
    shared: Mutex<Shared>,

    // hot-path mirrors of `shared`, so routing decisions don't take the lock
    idle_processor_count: AtomicUsize,
    /// Bit per processor in the `Running` state; only running processors are
    /// worth stealing from.
    running_mask: AtomicU64,
    /// Bit per processor blocked inside its reactor; cleared by whoever
    /// kicks it.
    polling_mask: AtomicU64,
    num_spinning: AtomicUsize,
    /// Set when a newly-ready task wants a spinner; consumed by the first
    /// processor that takes up the search.
    need_spinning: AtomicBool,
    /// Set while some processor is parked in `WaitingSpinning`.
    waiting_spinning: AtomicBool,
    spin_lot: Mutex<()>,
    spin_cv: Condvar,

    stop: AtomicBool,
    started: AtomicBool,
}

struct Shared {
    idle_processors: VecDeque<usize>,
    idle_machines: VecDeque<Arc<Machine>>,
    /// Every machine ever created, including the entry machine. Grow-only.
    machines: Vec<Arc<Machine>>,
}

/// An OS thread participating in the scheduler loop: the "M" of the triad.
struct Machine {
    id: usize,
    lot: Mutex<MachineState>,
    cv: Condvar,
}

struct MachineState {
    /// Index of the bound processor. Handed over by whoever wakes a parked
    /// machine.
    processor: Option<usize>,
    ready: bool,
}

struct Context {
    executor: Arc<Executor>,
    processor: Cell<Option<NonNull<Processor>>>,
}

std::thread_local! {
    static CONTEXT: RefCell<Option<Context>> = const { RefCell::new(None) };
}

/// Run `f` with the reactor of the processor bound to the calling machine.
///
/// # Panics
///
/// Panics when the calling thread is not a runtime machine.
pub(crate) fn with_current_reactor<R>(f: impl FnOnce(&Reactor) -> R) -> R {
    CONTEXT.with(|cx| {
        let cx = cx.borrow();
        let cx = cx
            .as_ref()
            .expect("I/O operations must be awaited from a runtime task");
        let p = cx
            .processor
            .get()
            .expect("machine has no processor bound while polling a task");
        // Safety: the pointer targets the executor's boxed processor slice,
        // kept alive by the `Arc` stored alongside it
        f(&unsafe { p.as_ref() }.reactor)
    })
}

// === impl Executor ===

impl Executor {
    /// Create an executor with `num_processors` execution contexts.
    ///
    /// Parallelism is capped at `num_processors` for the lifetime of the
    /// executor. Machines (threads) are created on demand, one per processor
    /// at steady state plus transient extras while processors block in their
    /// reactors.
    ///
    /// # Errors
    ///
    /// Returns an error when an io_uring instance or eventfd cannot be
    /// created.
    ///
    /// # Panics
    ///
    /// Panics when `num_processors` is zero or greater than 64 (the state
    /// bitmasks are a single word).
    pub fn new(num_processors: usize) -> io::Result<Arc<Self>> {
        assert!(
            (1..=64).contains(&num_processors),
            "num_processors must be between 1 and 64"
        );

        let processors = (0..num_processors)
            .map(Processor::new)
            .collect::<io::Result<Vec<_>>>()?
            .into_boxed_slice();

        // processor 0 is reserved for the entry machine; the rest start idle
        let idle_processors: VecDeque<usize> = (1..num_processors).collect();
        let idle_processor_count = AtomicUsize::new(idle_processors.len());

        Ok(Arc::new(Self {
            processors,
            injector: Injector::new(),
            shared: Mutex::new(Shared {
                idle_processors,
                idle_machines: VecDeque::new(),
                machines: Vec::new(),
            }),
            idle_processor_count,
            running_mask: AtomicU64::new(0),
            polling_mask: AtomicU64::new(0),
            num_spinning: AtomicUsize::new(0),
            need_spinning: AtomicBool::new(false),
            waiting_spinning: AtomicBool::new(false),
            spin_lot: Mutex::new(()),
            spin_cv: Condvar::new(),
            stop: AtomicBool::new(false),
            started: AtomicBool::new(false),
        }))
    }

    /// Spawn a task, fire-and-forget.
    ///
    /// When called from a runtime task, the new task lands on the current
    /// processor's hot slot; from any other thread it goes to the global
    /// queue.
    ///
    /// # Errors
    ///
    /// Fails once the executor has been [stopped](Self::stop).
    #[track_caller]
    pub fn spawn<F>(self: &Arc<Self>, future: F) -> Result<JoinHandle<F::Output>, SpawnError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.stop.load(Ordering::Acquire) {
            return Err(SpawnError::Stopped);
        }

        let (task, join) = TaskRef::new_allocated(future, self.clone());
        tracing::trace!(task.tid = join.id().as_u64(), "spawning task");
        self.schedule(task);
        Ok(join)
    }

    /// Bind the calling thread as the entry machine to processor 0 and run
    /// the scheduler loop.
    ///
    /// Returns only after [`Self::stop`]. The entry machine must outlive the
    /// scheduler loop, so this consumes the calling thread until shutdown.
    ///
    /// # Panics
    ///
    /// Panics when called a second time.
    pub fn run(self: &Arc<Self>) {
        assert!(
            !self.started.swap(true, Ordering::SeqCst),
            "Executor::run may only be called once"
        );

        let machine = {
            let mut shared = self.shared.lock();
            let machine = self.new_machine(&mut shared);
            machine.lot.lock().processor = Some(0);
            machine
        };

        self.processors[0].set_state(ProcState::Running);
        self.running_mask.fetch_or(1, Ordering::SeqCst);

        self.machine_main(&machine);

        // shutdown: drop whatever never got to run, so no task keeps a
        // reference cycle to the executor alive
        for p in self.processors.iter() {
            p.drain();
        }
        loop {
            let batch = self.injector.pop_batch(1, MAX_STEAL_BATCH);
            if batch.is_empty() {
                break;
            }
            drop(batch);
        }
    }

    /// Run `future` as the root task, driving the scheduler loop on the
    /// calling thread until it completes, then stop the executor and return
    /// the output.
    ///
    /// This is the application (and test) entry point; it may be called once
    /// per executor.
    pub fn block_on<F>(self: &Arc<Self>, future: F) -> F::Output
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (tx, rx) = std::sync::mpsc::channel();
        let exec = self.clone();
        let handle = self
            .spawn(async move {
                let output = future.await;
                let _ = tx.send(output);
                exec.stop();
            })
            .expect("executor already stopped");
        drop(handle);

        self.run();

        rx.recv().expect("root task did not produce an output")
    }

    /// Stop the executor: machines exit their loops, parked machines are
    /// woken, polling reactors are kicked, and further spawns fail.
    pub fn stop(&self) {
        if self.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("stopping executor");

        {
            let _guard = self.spin_lot.lock();
            self.spin_cv.notify_all();
        }

        for p in self.processors.iter() {
            p.reactor.wake();
        }

        let shared = self.shared.lock();
        for machine in shared.machines.iter() {
            machine.wake(None);
        }
    }

    /// `true` once [`Self::stop`] has been called.
    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// The machine loop: fetch a task, poll it, repeat until stop.
    fn machine_main(self: &Arc<Self>, machine: &Arc<Machine>) {
        let _span = tracing::debug_span!("machine", machine = machine.id).entered();

        CONTEXT.with(|cx| {
            *cx.borrow_mut() = Some(Context {
                executor: self.clone(),
                processor: Cell::new(None),
            });
        });

        while let Some(task) = self.next_task(machine) {
            match task.poll() {
                PollResult::PendingSchedule => {
                    // the task yielded (or a wake raced with its poll); route
                    // it through the global queue so its local siblings and
                    // other processors get a turn
                    if self.stop.load(Ordering::Acquire) {
                        drop(task);
                        continue;
                    }
                    self.injector.push(task);
                    if self.num_spinning.load(Ordering::SeqCst) == 0 {
                        self.need_spinning();
                    }
                }
                PollResult::Ready | PollResult::ReadyJoined | PollResult::Pending => drop(task),
            }
        }

        CONTEXT.with(|cx| {
            *cx.borrow_mut() = None;
        });
        tracing::debug!(machine = machine.id, "machine exiting");
    }

    /// Drive the bound processor's state machine until a task is found.
    /// Returns `None` on stop.
    fn next_task(self: &Arc<Self>, machine: &Arc<Machine>) -> Option<TaskRef> {
        let mut pid = machine.lot.lock().processor;

        loop {
            if self.stop.load(Ordering::Acquire) {
                return None;
            }

            let Some(id) = pid else {
                // unbound: park until somebody hands us a processor
                pid = self.sleep(machine, None);
                continue;
            };
            let p = &self.processors[id];
            self.set_tls_processor(Some(p));

            match p.state() {
                ProcState::Running => {
                    if let Some(task) = p.next_local_task() {
                        return Some(task);
                    }
                    self.running_mask.fetch_and(!(1 << id), Ordering::SeqCst);
                    p.set_state(if self.can_spin() {
                        ProcState::Spinning
                    } else {
                        ProcState::NotFound
                    });
                }

                ProcState::Spinning => {
                    let mut task = self.spin_once(p);
                    let last_spinning = self.num_spinning.fetch_sub(1, Ordering::SeqCst) == 1;
                    if task.is_none() && last_spinning {
                        // the final spinner checks one more time, so a task
                        // enqueued while everyone was giving up is not
                        // stranded
                        task = self.spin_once(p);
                    }

                    if let Some(task) = task {
                        p.set_state(ProcState::Running);
                        self.running_mask.fetch_or(1 << id, Ordering::SeqCst);
                        return Some(task);
                    }
                    p.set_state(ProcState::NotFound);
                }

                ProcState::NotFound => {
                    if p.reactor.has_work() {
                        p.set_state(ProcState::Polling);
                    } else if !self.waiting_spinning.swap(true, Ordering::SeqCst) {
                        p.set_state(ProcState::WaitingSpinning);
                    } else {
                        p.set_state(ProcState::Idle);
                    }
                }

                ProcState::WaitingSpinning => {
                    self.wait_for_spin_request();
                    self.waiting_spinning.store(false, Ordering::SeqCst);
                    p.set_state(if self.can_spin() {
                        ProcState::Spinning
                    } else {
                        ProcState::NotFound
                    });
                }

                ProcState::Polling => {
                    self.polling_mask.fetch_or(1 << id, Ordering::SeqCst);
                    // re-check after publishing the bit: otherwise every
                    // processor could block in its reactor with a task
                    // already queued and nobody left to kick them
                    if self.need_spinning.swap(false, Ordering::SeqCst) {
                        self.polling_mask.fetch_and(!(1 << id), Ordering::SeqCst);
                        self.num_spinning.fetch_add(1, Ordering::SeqCst);
                        p.set_state(ProcState::Spinning);
                        continue;
                    }

                    tracing::trace!(processor = id, "blocking in reactor");
                    let woken = p.reactor.poll(true);
                    self.polling_mask.fetch_and(!(1 << id), Ordering::SeqCst);

                    if woken > 0 || p.has_local_work() {
                        p.set_state(ProcState::Running);
                        self.running_mask.fetch_or(1 << id, Ordering::SeqCst);
                    } else {
                        p.set_state(if self.can_spin() {
                            ProcState::Spinning
                        } else {
                            ProcState::NotFound
                        });
                    }
                }

                ProcState::Idle => {
                    pid = self.sleep(machine, Some(id));
                    // on wake the processor (possibly a different one) has
                    // its state set by whoever woke us
                }
            }
        }
    }

    /// One spinning round: a fair batch from the global queue, else steal
    /// from a running sibling, else a non-blocking reactor drain.
    fn spin_once(self: &Arc<Self>, p: &Processor) -> Option<TaskRef> {
        let mut batch = self.injector.pop_batch(self.processors.len(), MAX_STEAL_BATCH);

        if batch.is_empty() {
            batch = self.steal(p);
            if batch.is_empty() {
                if p.reactor.has_work() && p.reactor.poll(false) > 0 {
                    // completions woke tasks onto this processor
                    return p.next_local_task();
                }
                return None;
            }
        }

        let mut tasks = batch.into_iter();
        let first = tasks.next();
        p.enqueue_batch(tasks, &self.injector);
        first
    }

    /// Steal half a run queue from a random running processor; when every
    /// queue is empty, retry against the `run_next` slots.
    fn steal(&self, thief: &Processor) -> StealBatch {
        let n = self.processors.len();
        let start = fastrand::usize(..n);

        for i in 0..n {
            let victim = &self.processors[(start + i) % n];
            if victim.id == thief.id
                || self.running_mask.load(Ordering::SeqCst) & (1 << victim.id) == 0
            {
                continue;
            }
            let batch = victim.queue.pop_front_half();
            if !batch.is_empty() {
                tracing::trace!(
                    thief = thief.id,
                    victim = victim.id,
                    stolen = batch.len(),
                    "stole tasks"
                );
                return batch;
            }
        }

        for i in 0..n {
            let victim = &self.processors[(start + i) % n];
            if victim.id == thief.id
                || self.running_mask.load(Ordering::SeqCst) & (1 << victim.id) == 0
            {
                continue;
            }
            if let Some(task) = victim.take_run_next() {
                tracing::trace!(thief = thief.id, victim = victim.id, "stole run_next");
                let mut batch = StealBatch::new();
                batch.push(task);
                return batch;
            }
        }

        StealBatch::new()
    }

    /// Decide whether this processor should take up (another) spinning
    /// round, keeping the spinning-processor accounting balanced: every
    /// `true` increments `num_spinning` exactly once, and every spinning
    /// round decrements it exactly once.
    fn can_spin(&self) -> bool {
        if self.need_spinning.swap(false, Ordering::SeqCst) {
            self.num_spinning.fetch_add(1, Ordering::SeqCst);
            return true;
        }

        let count = self.num_spinning.load(Ordering::SeqCst);
        if 2 * count <= self.idle_processor_count.load(Ordering::SeqCst) {
            self.num_spinning.fetch_add(1, Ordering::SeqCst);
            return true;
        }
        false
    }

    /// Make sure some processor will search for newly queued work. The
    /// escalation ladder: notify a waiting-spinning processor, else promote
    /// an idle processor (growing a machine if none is parked), else kick a
    /// polling processor out of the kernel.
    fn need_spinning(self: &Arc<Self>) {
        self.need_spinning.store(true, Ordering::SeqCst);

        // a waiting-spinning processor re-checks the flag under the lock, so
        // notifying is enough even if it has not started waiting yet
        if self.waiting_spinning.load(Ordering::SeqCst) {
            let _guard = self.spin_lot.lock();
            self.spin_cv.notify_one();
            return;
        }

        if self.idle_processor_count.load(Ordering::SeqCst) > 0 {
            let mut claimed = None;
            {
                let mut shared = self.shared.lock();
                if !shared.idle_processors.is_empty()
                    && self.need_spinning.swap(false, Ordering::SeqCst)
                {
                    let pid = shared.idle_processors.pop_front().expect("checked non-empty");
                    self.idle_processor_count.fetch_sub(1, Ordering::SeqCst);

                    claimed = Some(match shared.idle_machines.pop_front() {
                        Some(machine) => (pid, machine, false),
                        None => (pid, self.new_machine(&mut shared), true),
                    });
                }
            }

            if let Some((pid, machine, is_new)) = claimed {
                tracing::trace!(processor = pid, machine = machine.id, "promoting idle processor");
                self.processors[pid].set_state(ProcState::Spinning);
                self.num_spinning.fetch_add(1, Ordering::SeqCst);

                if is_new {
                    machine.lot.lock().processor = Some(pid);
                    self.spawn_machine_thread(machine);
                } else {
                    machine.wake(Some(pid));
                }
                return;
            }
        }

        // kick the lowest-bit polling processor; clearing its bit hands us
        // the exclusive right to ring its doorbell
        let mask = self.polling_mask.load(Ordering::SeqCst);
        let low = mask & mask.wrapping_neg();
        if low != 0
            && self
                .polling_mask
                .compare_exchange(mask, mask & !low, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            let pid = low.trailing_zeros() as usize;
            tracing::trace!(processor = pid, "kicking polling processor");
            self.processors[pid].reactor.wake();
        }
    }

    fn wait_for_spin_request(&self) {
        let mut guard = self.spin_lot.lock();
        while !self.need_spinning.load(Ordering::SeqCst) && !self.stop.load(Ordering::SeqCst) {
            self.spin_cv.wait(&mut guard);
        }
    }

    /// Release the bound processor (if any), park the machine, and return
    /// the processor assignment it wakes up with.
    fn sleep(self: &Arc<Self>, machine: &Arc<Machine>, release: Option<usize>) -> Option<usize> {
        self.set_tls_processor(None);
        {
            let mut state = machine.lot.lock();
            state.ready = false;
            state.processor = None;
        }
        {
            let mut shared = self.shared.lock();
            if let Some(pid) = release {
                tracing::trace!(processor = pid, machine = machine.id, "releasing processor");
                self.processors[pid].set_state(ProcState::Idle);
                shared.idle_processors.push_back(pid);
                self.idle_processor_count.fetch_add(1, Ordering::SeqCst);
            }
            shared.idle_machines.push_back(machine.clone());
        }

        if self.stop.load(Ordering::SeqCst) {
            // the stop broadcast may have run before we enqueued ourselves
            return None;
        }

        machine.park()
    }

    fn set_tls_processor(&self, p: Option<&Processor>) {
        CONTEXT.with(|cx| {
            if let Some(cx) = cx.borrow().as_ref() {
                cx.processor.set(p.map(NonNull::from));
            }
        });
    }

    fn new_machine(&self, shared: &mut Shared) -> Arc<Machine> {
        let machine = Arc::new(Machine {
            id: shared.machines.len(),
            lot: Mutex::new(MachineState {
                processor: None,
                ready: false,
            }),
            cv: Condvar::new(),
        });
        shared.machines.push(machine.clone());
        machine
    }

    fn spawn_machine_thread(self: &Arc<Self>, machine: Arc<Machine>) {
        let exec = self.clone();
        std::thread::Builder::new()
            .name(format!("goro-machine-{}", machine.id))
            .spawn(move || exec.machine_main(&machine))
            .expect("failed to spawn machine thread");
    }
}

impl Schedule for Arc<Executor> {
    /// Route a spawned or woken task: current processor's hot slot when
    /// called on a machine of this executor, the global queue otherwise; then
    /// make sure somebody is searching.
    fn schedule(&self, task: TaskRef) {
        if self.stop.load(Ordering::Acquire) {
            // late wakeups during shutdown; release the reference
            drop(task);
            return;
        }

        let mut task = Some(task);
        CONTEXT.with(|cx| {
            if let Some(cx) = cx.borrow().as_ref() {
                if Arc::ptr_eq(&cx.executor, self) {
                    if let Some(p) = cx.processor.get() {
                        // Safety: the pointer targets this executor's boxed
                        // processor slice, alive as long as `self`
                        let p = unsafe { p.as_ref() };
                        p.enqueue(task.take().expect("task taken twice"), &self.injector);
                    }
                }
            }
        });
        if let Some(task) = task {
            self.injector.push(task);
        }

        if self.num_spinning.load(Ordering::SeqCst) == 0 {
            self.need_spinning();
        }
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("processors", &self.processors.len())
            .field("injector", &self.injector)
            .field("num_spinning", &self.num_spinning.load(Ordering::Relaxed))
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

// === impl Machine ===

impl Machine {
    /// Wake a parked machine, optionally handing it a processor.
    fn wake(&self, processor: Option<usize>) {
        let mut state = self.lot.lock();
        if let Some(pid) = processor {
            state.processor = Some(pid);
        }
        state.ready = true;
        self.cv.notify_one();
    }

    /// Park until woken; returns the processor assignment, if any.
    fn park(&self) -> Option<usize> {
        let mut state = self.lot.lock();
        while !state.ready {
            self.cv.wait(&mut state);
        }
        state.processor
    }
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine").field("id", &self.id).finish_non_exhaustive()
    }
}
