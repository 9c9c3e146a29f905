// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod id;
mod join_handle;
mod state;
mod yield_now;

use core::future::Future;
use crate::executor::Schedule;
use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::Ordering;
use crate::task::state::{StartPollAction, State, WakeByRefAction, WakeByValAction};
use core::any::type_name;
use core::mem;
use core::panic::{AssertUnwindSafe, Location};
use core::pin::Pin;
use core::ptr::NonNull;
use core::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};
use core::{fmt, mem::MaybeUninit};
use static_assertions::assert_impl_all;

pub use id::Id;
pub use join_handle::{JoinError, JoinHandle};
pub use yield_now::yield_now;

/// Outcome of calling [`TaskRef::poll`].
///
/// This type describes how to proceed with a given task, whether it needs to
/// be rescheduled or can be dropped etc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollResult {
    /// The task has completed, without waking a [`JoinHandle`] waker.
    ///
    /// The machine can drop its [`TaskRef`].
    Ready,

    /// The task has completed and a [`JoinHandle`] waker has been woken.
    ///
    /// The machine can drop its [`TaskRef`].
    ReadyJoined,

    /// The task is pending, but not woken.
    ///
    /// The machine can drop its [`TaskRef`], as whoever intends to wake the
    /// task later is holding a clone of its [`Waker`].
    Pending,

    /// The task has woken itself during the poll (an explicit yield, or a
    /// wake that raced with the poll).
    ///
    /// The machine must re-enqueue the task rather than dropping its
    /// [`TaskRef`]; re-enqueueing goes through the global queue so that the
    /// yielding task does not starve its local siblings.
    PendingSchedule,
}

/// A type-erased, reference-counted pointer to a spawned task.
///
/// Once spawned, a task is pinned in memory (a requirement of [`Future`]).
/// Instead of moving tasks around, the run queues hold `TaskRef`s, which are
/// just pointers to the pinned allocation. `TaskRef`s are type-erased and
/// interact with the allocation through its [`VTable`], so that the scheduler
/// is compiled exactly once rather than per future type.
///
/// A `TaskRef` is the *resumption handle* of its task: placing it on a run
/// queue is the one-shot "resume" permission, and the state protocol in
/// [`state`] guarantees a task is never enqueued twice for the same wakeup.
///
/// `TaskRef`s are reference-counted; the allocation is freed when the last
/// one (including those embedded in [`Waker`]s and the [`JoinHandle`]) is
/// dropped.
#[derive(Eq, PartialEq)]
pub struct TaskRef(NonNull<Header>);

assert_impl_all!(TaskRef: Send, Sync);

// the `Header` must live at offset 0 of the allocation so that a
// `NonNull<Header>` and a `NonNull<Task>` are interchangeable; every struct
// on that path is `repr(C)` with the header chain as its first field.
#[repr(C)]
pub(crate) struct Task<F: Future, S>(TaskInner<F, S>);

#[repr(C)]
struct TaskInner<F: Future, S> {
    /// This must be the first field of the `TaskInner` struct!
    schedulable: Schedulable<S>,

    /// The future, or its output once it has completed.
    ///
    /// If COMPLETED is zero, the POLLING bit functions as a lock for this
    /// field, and it may only be accessed by the machine that set POLLING.
    /// If COMPLETED is one, the slot is read exactly once, by whoever the
    /// join handshake designated (see [`state`]).
    stage: UnsafeCell<Stage<F>>,

    /// Waker of the task awaiting this task's [`JoinHandle`].
    ///
    /// Ownership is arbitrated by the JOIN_WAKER bit: while the task is
    /// incomplete the `JoinHandle` may (re)register a waker here after
    /// clearing the bit; once COMPLETED is set, the completing machine reads
    /// the slot if and only if the bit was set.
    join_waker: UnsafeCell<Option<Waker>>,
}

#[repr(C)]
struct Schedulable<S> {
    /// This must be the first field of the `Schedulable` struct!
    header: Header,
    /// The scheduler this task belongs to, bound at spawn time and never
    /// changed: tasks migrate between processors, not executors.
    scheduler: S,
}

/// The current lifecycle stage of the future: the future itself, then its
/// output, then nothing.
#[repr(C)]
enum Stage<F: Future> {
    Pending(F),
    Ready(F::Output),
    Consumed,
}

pub(crate) struct Header {
    /// The task's state.
    ///
    /// This field is accessed with atomic instructions, so it's always safe
    /// to access it.
    state: State,
    /// The task vtable for this task.
    vtable: &'static VTable,
    /// The task's ID.
    id: Id,
    /// The tracing span associated with this task, for debugging purposes.
    span: tracing::Span,
}

struct VTable {
    /// Poll the future, returning a [`PollResult`] that indicates what the
    /// machine should do with the polled task.
    poll: unsafe fn(NonNull<Header>) -> PollResult,

    /// Poll the task's [`JoinHandle`] for completion, storing the output at
    /// the provided pointer if the task has completed.
    poll_join: unsafe fn(
        ptr: NonNull<Header>,
        outptr: NonNull<()>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), JoinError>>,

    /// Drops the task and deallocates its memory.
    deallocate: unsafe fn(NonNull<Header>),

    /// The `wake_by_ref` function from the task's [`RawWakerVTable`].
    ///
    /// Duplicated here so a task can be woken through a bare [`TaskRef`]
    /// (used by cancellation).
    wake_by_ref: unsafe fn(*const ()),
}

// === impl TaskRef ===

impl TaskRef {
    /// Allocate a new task for `future`, bound to `scheduler`.
    #[track_caller]
    pub(crate) fn new_allocated<F, S>(future: F, scheduler: S) -> (Self, JoinHandle<F::Output>)
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
        S: Schedule,
    {
        let id = Id::next();
        let loc = Location::caller();
        let span = tracing::trace_span!(
            "task",
            task.tid = id.as_u64(),
            task.output = %type_name::<F::Output>(),
            loc.file = loc.file(),
            loc.line = loc.line(),
        );

        let task = Box::new(Task::<F, S>::new(future, id, scheduler, span));
        debug_assert_eq!(task.state().load(Ordering::Relaxed).ref_count(), 1);

        let ptr = NonNull::from(Box::leak(task)).cast::<Header>();
        let task = Self(ptr);
        let join = JoinHandle::new(task.clone());

        (task, join)
    }

    /// Returns the task's unique[^1] identifier.
    ///
    /// [^1]: Unique relative to all *currently live* tasks, *not* unique
    ///     across spacetime. See [`Id`] for details.
    pub fn id(&self) -> Id {
        self.header().id
    }

    /// Returns `true` when this task has run to completion.
    pub fn is_complete(&self) -> bool {
        self.state().load(Ordering::Acquire).is_completed()
    }

    /// Requests cancellation, waking the task so it can clean up after
    /// itself. Returns `true` if this call was the one that cancelled it.
    pub fn cancel(&self) -> bool {
        let cancelled = self.state().cancel();
        if cancelled {
            tracing::trace!(task.tid = self.id().as_u64(), "woke cancelled task");
            self.wake_by_ref();
        }
        cancelled
    }

    /// Polls the task.
    pub(crate) fn poll(&self) -> PollResult {
        let poll_fn = self.header().vtable.poll;
        // Safety: the vtable belongs to this allocation
        unsafe { poll_fn(self.0) }
    }

    pub(crate) fn wake_by_ref(&self) {
        let wake_by_ref_fn = self.header().vtable.wake_by_ref;
        // Safety: the vtable belongs to this allocation
        unsafe { wake_by_ref_fn(self.0.as_ptr().cast::<()>()) }
    }

    /// Poll for this task's completion on behalf of its [`JoinHandle`].
    ///
    /// # Safety
    ///
    /// `T` must be the output type this task was created with.
    pub(crate) unsafe fn poll_join<T>(&self, cx: &mut Context<'_>) -> Poll<Result<T, JoinError>> {
        let poll_join_fn = self.header().vtable.poll_join;
        let mut slot = MaybeUninit::<T>::uninit();

        // Safety: called through the vtable; the caller guarantees `T` is the
        // right output type
        let result = unsafe { poll_join_fn(self.0, NonNull::from(&mut slot).cast::<()>(), cx) };

        result.map(|result| {
            result.map(|()| {
                // Safety: on `Ok` the callee wrote the output into the slot
                unsafe { slot.assume_init_read() }
            })
        })
    }

    pub(crate) fn header(&self) -> &Header {
        // Safety: constructor ensures the pointer is always valid
        unsafe { self.0.as_ref() }
    }

    /// Returns a reference to the task's state.
    pub(crate) fn state(&self) -> &State {
        &self.header().state
    }

    /// Leak this `TaskRef` into a raw header pointer, without touching the
    /// reference count. Used by the run queues, which store raw pointers.
    pub(crate) fn into_ptr(self) -> NonNull<Header> {
        let ptr = self.0;
        mem::forget(self);
        ptr
    }

    /// Reconstruct a `TaskRef` from a pointer produced by [`Self::into_ptr`],
    /// adopting the reference it carried.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from `into_ptr` and must not be used again.
    pub(crate) unsafe fn from_ptr(ptr: NonNull<Header>) -> Self {
        Self(ptr)
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRef")
            .field("id", &self.id())
            .field("addr", &self.0)
            .finish()
    }
}

impl fmt::Pointer for TaskRef {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&self.0, f)
    }
}

impl Clone for TaskRef {
    #[inline]
    fn clone(&self) -> Self {
        self.state().clone_ref();
        Self(self.0)
    }
}

impl Drop for TaskRef {
    #[inline]
    fn drop(&mut self) {
        if !self.state().drop_ref() {
            return;
        }

        let deallocate = self.header().vtable.deallocate;
        // Safety: `drop_ref` returned true, so this was the last reference
        unsafe {
            deallocate(self.0);
        }
    }
}

// Safety: the state protocol synchronizes access to the inner task
unsafe impl Send for TaskRef {}
// Safety: the state protocol synchronizes access to the inner task
unsafe impl Sync for TaskRef {}

// === impl Task ===

impl<F, S> Task<F, S>
where
    F: Future,
    S: Schedule,
{
    const TASK_VTABLE: VTable = VTable {
        poll: Self::poll,
        poll_join: Self::poll_join,
        deallocate: Self::deallocate,
        wake_by_ref: Schedulable::<S>::wake_by_ref,
    };

    fn new(future: F, task_id: Id, scheduler: S, span: tracing::Span) -> Self {
        Self(TaskInner {
            schedulable: Schedulable {
                header: Header {
                    state: State::new(),
                    vtable: &Self::TASK_VTABLE,
                    id: task_id,
                    span,
                },
                scheduler,
            },
            stage: UnsafeCell::new(Stage::Pending(future)),
            join_waker: UnsafeCell::new(None),
        })
    }

    /// Poll the future, returning a [`PollResult`] that indicates what the
    /// machine should do with the polled task.
    ///
    /// This is a type-erased function called through the task's [`VTable`].
    ///
    /// # Safety
    ///
    /// `ptr` must point to the [`Header`] of a task of type `Self`.
    unsafe fn poll(ptr: NonNull<Header>) -> PollResult {
        // Safety: ensured by caller
        unsafe {
            let this = ptr.cast::<Self>().as_ref();

            tracing::trace!(task.tid = this.id().as_u64(), "Task::poll");

            match this.state().start_poll() {
                StartPollAction::Poll => {}
                StartPollAction::DontPoll => {
                    tracing::warn!(task.tid = this.id().as_u64(), "stale wakeup for completed task");
                    return PollResult::Ready;
                }
                StartPollAction::Cancelled { wake_join_waker } => {
                    tracing::trace!(task.tid = this.id().as_u64(), "task cancelled");
                    // drop the future without polling it
                    this.0.stage.with_mut(|stage| *stage = Stage::Consumed);
                    if wake_join_waker {
                        this.wake_join_waker();
                        return PollResult::ReadyJoined;
                    }
                    return PollResult::Ready;
                }
            }

            // wrap the waker in `ManuallyDrop` because it borrows this
            // machine's task reference rather than owning one of its own; if
            // the future clones it during the poll, the clone takes a real
            // reference.
            let waker = {
                let raw = Schedulable::<S>::raw_waker(ptr.as_ptr().cast());
                mem::ManuallyDrop::new(Waker::from_raw(raw))
            };

            let poll = {
                let mut cx = Context::from_waker(&waker);
                this.poll_inner(&mut cx)
            };

            let result = this.state().end_poll(poll.is_ready());

            if result == PollResult::ReadyJoined {
                this.wake_join_waker();
            }

            result
        }
    }

    /// Poll to join the task pointed to by `ptr`, taking its output if it has
    /// completed. Called by [`JoinHandle`]s through the task's [`VTable`].
    ///
    /// # Safety
    ///
    /// - `ptr` must point to the [`Header`] of a task of type `Self`.
    /// - `outptr` must point to a valid `MaybeUninit<F::Output>`.
    unsafe fn poll_join(
        ptr: NonNull<Header>,
        outptr: NonNull<()>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), JoinError>> {
        // Safety: ensured by caller
        unsafe {
            let this = ptr.cast::<Self>().as_ref();
            tracing::trace!(task.tid = this.id().as_u64(), "Task::poll_join");

            // Register (or refresh) the join waker unless the task has
            // already completed. The JOIN_WAKER bit is the slot lock: clear
            // it to write, re-set it to publish. Both CAS steps fail once
            // COMPLETED is set, in which case the completing machine saw no
            // registered waker and it is on us to take the output below.
            let mut s = this.state().load(Ordering::Acquire);
            'register: {
                if s.is_completed() {
                    break 'register;
                }

                if s.has_join_waker() {
                    match this.state().try_clear_join_waker() {
                        Ok(()) => {}
                        Err(actual) => {
                            s = actual;
                            break 'register;
                        }
                    }
                }

                // Safety: JOIN_WAKER is clear and the task is incomplete, so
                // this `JoinHandle` has exclusive access to the slot.
                this.0.join_waker.with_mut(|waker| {
                    let waker = &mut *waker;
                    match waker {
                        Some(old) if old.will_wake(cx.waker()) => {}
                        _ => *waker = Some(cx.waker().clone()),
                    }
                });

                match this.state().try_set_join_waker() {
                    Ok(()) => return Poll::Pending,
                    Err(actual) => {
                        // completed mid-registration; it won't wake us, take
                        // the output ourselves
                        s = actual;
                    }
                }
            }
            debug_assert!(s.is_completed());

            if s.is_cancelled() {
                return Poll::Ready(Err(JoinError::cancelled(this.id())));
            }

            // Safety: COMPLETED is set and the `JoinHandle` is the designated
            // (sole) consumer of the output.
            this.take_output(outptr);
            Poll::Ready(Ok(()))
        }
    }

    /// Drops the task and deallocates its memory.
    ///
    /// This is a type-erased function called through the task's [`VTable`].
    ///
    /// # Safety
    ///
    /// `ptr` must point to the [`Header`] of a task of type `Self`, with a
    /// reference count of zero.
    unsafe fn deallocate(ptr: NonNull<Header>) {
        // Safety: ensured by caller
        unsafe {
            let this = ptr.cast::<Self>();
            tracing::trace!(task.tid = this.as_ref().id().as_u64(), "Task::deallocate");
            debug_assert_eq!(
                ptr.as_ref().state.load(Ordering::Acquire).ref_count(),
                0,
                "a task may not be deallocated while references to it exist"
            );
            drop(Box::from_raw(this.as_ptr()));
        }
    }

    /// Polls the future. If the future completes, the output is written to
    /// the stage field.
    ///
    /// # Safety
    ///
    /// The caller must hold the POLLING "lock" on the stage field.
    unsafe fn poll_inner(&self, cx: &mut Context<'_>) -> Poll<()> {
        let _span = self.span().enter();

        self.0.stage.with_mut(|stage| {
            // Safety: ensured by caller
            let stage = unsafe { &mut *stage };
            stage.poll(cx, self.id())
        })
    }

    /// Wakes the task's [`JoinHandle`], if it has one.
    ///
    /// # Safety
    ///
    /// The caller must have observed a state transition granting it the join
    /// waker slot (COMPLETED set with JOIN_WAKER set).
    unsafe fn wake_join_waker(&self) {
        // Safety: ensured by caller
        unsafe {
            self.0.join_waker.with_mut(|waker| {
                if let Some(join_waker) = (*waker).take() {
                    join_waker.wake();
                } else {
                    tracing::trace!("called wake_join_waker on non-existing waker");
                }
            });
        }
    }

    /// # Safety
    ///
    /// - the task must have completed and the caller must be its designated
    ///   output consumer
    /// - `dst` must point to a valid `MaybeUninit<F::Output>`
    unsafe fn take_output(&self, dst: NonNull<()>) {
        // Safety: ensured by caller
        unsafe {
            self.0.stage.with_mut(|stage| {
                match mem::replace(&mut *stage, Stage::Consumed) {
                    Stage::Ready(output) => {
                        // safety: the caller promises that this points to a
                        // `MaybeUninit<F::Output>`.
                        dst.cast::<MaybeUninit<F::Output>>().as_mut().write(output);
                    }
                    _ => panic!("JoinHandle polled after completion"),
                }
            });
        }
    }

    fn id(&self) -> Id {
        self.0.schedulable.header.id
    }
    fn state(&self) -> &State {
        &self.0.schedulable.header.state
    }
    #[inline]
    fn span(&self) -> &tracing::Span {
        &self.0.schedulable.header.span
    }
}

// === impl Stage ===

impl<F> Stage<F>
where
    F: Future,
{
    fn poll(&mut self, cx: &mut Context<'_>, id: Id) -> Poll<()> {
        let poll = AssertUnwindSafe(|| -> Poll<F::Output> {
            let Stage::Pending(future) = self else {
                unreachable!("polled a task in an unexpected stage");
            };

            // Safety: tasks are pinned on the heap from allocation until
            // deallocation; the stage is never moved out of the allocation.
            let future = unsafe { Pin::new_unchecked(future) };
            future.poll(cx)
        });

        // a panicking task takes the whole process down; the runtime makes no
        // attempt to hand the panic to a joiner.
        match std::panic::catch_unwind(poll) {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(ready)) => {
                *self = Stage::Ready(ready);
                Poll::Ready(())
            }
            Err(_err) => {
                tracing::error!(task.tid = id.as_u64(), "task panicked, aborting");
                std::process::abort();
            }
        }
    }
}

// === impl Schedulable ===

impl<S: Schedule> Schedulable<S> {
    const WAKER_VTABLE: RawWakerVTable = RawWakerVTable::new(
        Self::clone_waker,
        Self::wake_by_val,
        Self::wake_by_ref,
        Self::drop_waker,
    );

    // `Waker::will_wake` is used all over the place to optimize waker code
    // (e.g. only update wakers if they have a different wake target). Problem
    // is `will_wake` only checks for pointer equality and since the
    // `raw_waker` would usually be inlined in release mode (and with it
    // `WAKER_VTABLE`) the Waker identity would be different before and after
    // calling `.clone()`. This isn't a correctness problem since it's still
    // the same waker in the end, it just causes a lot of unnecessary wake
    // ups. the `inline(never)` below is therefore quite load-bearing
    #[inline(never)]
    fn raw_waker(this: *const Self) -> RawWaker {
        RawWaker::new(this.cast::<()>(), &Self::WAKER_VTABLE)
    }

    #[inline(always)]
    fn state(&self) -> &State {
        &self.header.state
    }

    /// Hand a woken task back to its scheduler.
    unsafe fn schedule(this: TaskRef) {
        // Safety: ensured by caller
        unsafe {
            // clone the scheduler out of the allocation first: the queue this
            // task lands on may run and free it before `schedule` returns.
            let scheduler = this.0.cast::<Self>().as_ref().scheduler.clone();
            scheduler.schedule(this);
        }
    }

    #[inline]
    unsafe fn drop_ref(this: NonNull<Self>) {
        // Safety: ensured by caller
        unsafe {
            if !this.as_ref().state().drop_ref() {
                return;
            }

            let deallocate = this.as_ref().header.vtable.deallocate;
            deallocate(this.cast::<Header>());
        }
    }

    // === Waker vtable methods ===

    unsafe fn wake_by_val(ptr: *const ()) {
        // Safety: called through the RawWakerVTable
        unsafe {
            let this = NonNull::new_unchecked(ptr.cast::<Self>().cast_mut());
            tracing::trace!(
                target: "executor::waker",
                { task.tid = this.as_ref().header.id.as_u64() },
                "Task::wake_by_val"
            );

            match this.as_ref().state().wake_by_val() {
                WakeByValAction::Enqueue => {
                    // the waker's reference transfers to the run queue.
                    Self::schedule(TaskRef(this.cast::<Header>()));
                }
                WakeByValAction::Drop => Self::drop_ref(this),
            }
        }
    }

    unsafe fn wake_by_ref(ptr: *const ()) {
        // Safety: called through the RawWakerVTable
        unsafe {
            let this = NonNull::new_unchecked(ptr.cast::<Self>().cast_mut());
            tracing::trace!(
                target: "executor::waker",
                { task.tid = this.as_ref().header.id.as_u64() },
                "Task::wake_by_ref"
            );

            if this.as_ref().state().wake_by_ref() == WakeByRefAction::Enqueue {
                // the transition minted a reference for the run queue.
                Self::schedule(TaskRef(this.cast::<Header>()));
            }
        }
    }

    unsafe fn clone_waker(ptr: *const ()) -> RawWaker {
        // Safety: called through the RawWakerVTable
        unsafe {
            let ptr = ptr.cast::<Self>();
            (*ptr).header.state.clone_ref();
            Self::raw_waker(ptr)
        }
    }

    unsafe fn drop_waker(ptr: *const ()) {
        // Safety: called through the RawWakerVTable
        unsafe {
            let this = ptr.cast::<Self>().cast_mut();
            Self::drop_ref(NonNull::new_unchecked(this));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom::sync::Arc;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// A scheduler that just collects woken tasks.
    #[derive(Clone, Default)]
    struct MockSchedule {
        queue: Arc<Mutex<VecDeque<TaskRef>>>,
    }

    impl Schedule for MockSchedule {
        fn schedule(&self, task: TaskRef) {
            self.queue.lock().push_back(task);
        }
    }

    impl MockSchedule {
        fn pop(&self) -> Option<TaskRef> {
            self.queue.lock().pop_front()
        }
    }

    #[test]
    fn spawn_poll_complete() {
        let sched = MockSchedule::default();
        let (task, join) = TaskRef::new_allocated(async { 39 + 3 }, sched.clone());

        assert_eq!(task.poll(), PollResult::Ready);
        drop(task);

        let mut join = tokio_test::task::spawn(join);
        assert_eq!(join.poll(), Poll::Ready(Ok(42)));
        assert!(sched.pop().is_none());
    }

    #[test]
    fn join_waker_is_woken_on_completion() {
        let sched = MockSchedule::default();
        let (task, join) = TaskRef::new_allocated(async { "hello" }, sched.clone());

        let mut join = tokio_test::task::spawn(join);
        assert!(join.poll().is_pending());

        assert_eq!(task.poll(), PollResult::ReadyJoined);
        drop(task);

        assert!(join.is_woken());
        assert_eq!(join.poll(), Poll::Ready(Ok("hello")));
    }

    #[test]
    fn yield_reschedules() {
        let sched = MockSchedule::default();
        let (task, join) = TaskRef::new_allocated(
            async {
                yield_now().await;
                7
            },
            sched.clone(),
        );

        assert_eq!(task.poll(), PollResult::PendingSchedule);
        assert_eq!(task.poll(), PollResult::Ready);
        drop(task);

        let mut join = tokio_test::task::spawn(join);
        assert_eq!(join.poll(), Poll::Ready(Ok(7)));
    }

    #[test]
    fn wake_from_elsewhere_enqueues_once() {
        let sched = MockSchedule::default();
        let (task, join) = TaskRef::new_allocated(
            async {
                futures::future::pending::<()>().await;
            },
            sched.clone(),
        );
        drop(join);

        assert_eq!(task.poll(), PollResult::Pending);

        // an external wake enqueues exactly once, duplicates coalesce
        task.wake_by_ref();
        task.wake_by_ref();
        let woken = sched.pop().expect("wake should have enqueued the task");
        assert!(sched.pop().is_none());

        drop(woken);
        drop(task);
    }

    #[test]
    fn cancel_before_poll_drops_future() {
        struct SetOnDrop(Arc<Mutex<bool>>);
        impl Drop for SetOnDrop {
            fn drop(&mut self) {
                *self.0.lock() = true;
            }
        }

        let dropped = Arc::new(Mutex::new(false));
        let guard = SetOnDrop(dropped.clone());

        let sched = MockSchedule::default();
        let (task, join) = TaskRef::new_allocated(
            async move {
                let _guard = guard;
                futures::future::pending::<()>().await;
            },
            sched.clone(),
        );

        // the task was never enqueued-and-polled, so the cancel wake
        // coalesces with the initial (spawn) wakeup held by `task`
        assert!(task.cancel());
        assert!(sched.pop().is_none());
        assert_eq!(task.poll(), PollResult::ReadyJoined);
        drop(task);

        assert!(*dropped.lock());

        let mut join = tokio_test::task::spawn(join);
        assert!(matches!(join.poll(), Poll::Ready(Err(_))));
    }
}
