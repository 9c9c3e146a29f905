// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::task::{Id, TaskRef};
use core::future::Future;
use core::fmt;
use core::marker::PhantomData;
use core::pin::Pin;
use core::task::{Context, Poll};

/// An owned permission to await a spawned task's output.
///
/// A `JoinHandle` *detaches* its task when dropped: the task keeps running,
/// its output is discarded on completion. Awaiting the handle resolves with
/// the task's output once it completes, making the awaiting task the child's
/// sole awaiter.
///
/// This `struct` is created by [`crate::Executor::spawn`].
#[must_use = "dropping a JoinHandle detaches the task"]
pub struct JoinHandle<T> {
    task: Option<TaskRef>,
    // logically owns the task's output, so the auto traits require `T: Send`
    _output: PhantomData<T>,
}

/// Error returned by awaiting a [`JoinHandle`] whose task was cancelled
/// before it could run to completion.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct JoinError {
    id: Id,
}

// === impl JoinHandle ===

impl<T> JoinHandle<T> {
    pub(crate) fn new(task: TaskRef) -> Self {
        Self {
            task: Some(task),
            _output: PhantomData,
        }
    }

    /// Returns the [`Id`] of the task this handle refers to.
    pub fn id(&self) -> Id {
        self.task_ref().id()
    }

    /// Returns `true` when the task has run to completion.
    pub fn is_complete(&self) -> bool {
        self.task_ref().is_complete()
    }

    /// Requests cancellation of the task.
    ///
    /// A task that has not yet completed will be dropped at its next
    /// scheduling point without being polled again; awaiting the handle then
    /// resolves to a [`JoinError`]. Returns `true` if this call was the one
    /// that cancelled the task.
    pub fn cancel(&self) -> bool {
        self.task_ref().cancel()
    }

    fn task_ref(&self) -> &TaskRef {
        self.task.as_ref().expect("polled after completion")
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Safety: `JoinHandle` holds no address-sensitive state; the
        // `PhantomData<T>` marker is the only reason `Self` isn't `Unpin`.
        let this = unsafe { self.get_unchecked_mut() };
        let task = this.task.as_ref().expect("polled after completion");
        // Safety: the `PhantomData` pins `T` to the output type the task was
        // allocated with in `TaskRef::new_allocated`.
        let result = core::task::ready!(unsafe { task.poll_join::<T>(cx) });
        // the output has been taken, later polls must not touch the stage
        this.task = None;
        Poll::Ready(result)
    }
}

impl<T> Drop for JoinHandle<T> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.state().drop_join_interest();
        }
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("JoinHandle");
        match &self.task {
            Some(task) => s.field("task", task).finish(),
            None => s.field("task", &"<completed>").finish(),
        }
    }
}

// === impl JoinError ===

impl JoinError {
    pub(crate) fn cancelled(id: Id) -> Self {
        Self { id }
    }

    /// The [`Id`] of the cancelled task.
    pub fn id(&self) -> Id {
        self.id
    }
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task {} was cancelled", self.id)
    }
}

impl core::error::Error for JoinError {}
