//! Hierarchical progress and completion tracking.
//!
//! A [`Task`] is a cheap-to-clone handle shared between the operation that
//! drives it and the observers that display it. The handle separates the two
//! historical roles of a task object: progress counters are a plain value
//! object mutated by the operation, while completion is awaited through
//! [`Task::wait`] like any future. Child tasks are attached for display
//! nesting only and never propagate completion to their parent.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;


/// A handle over one tracked unit of work.
#[derive(Debug, Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

#[derive(Debug)]
struct TaskInner {
    name: Box<str>,
    counter: Counter,
    /// False until a total is known, progress is hidden meanwhile.
    determinate: AtomicBool,
    children: Mutex<Vec<Task>>,
    status: watch::Sender<Status>,
}

#[derive(Debug)]
struct Counter {
    success: AtomicU32,
    failed: AtomicU32,
    total: AtomicU32,
}

/// The lifecycle status of a task, terminal states are reached exactly once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Status {
    #[default]
    Running,
    Done,
    Failed(Arc<str>),
}

/// A snapshot of a task's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub success: u32,
    pub failed: u32,
    pub total: u32,
}

impl Progress {

    /// The completed fraction in `0.0..=1.0`, counting failed items as
    /// completed for display purposes.
    pub fn fraction(&self) -> f32 {
        if self.total == 0 {
            1.0
        } else {
            (self.success + self.failed) as f32 / self.total as f32
        }
    }

}

/// Error returned by [`Task::wait`] when the task terminated with a failure.
#[derive(thiserror::Error, Debug, Clone)]
#[error("{0}")]
pub struct TaskError(pub Arc<str>);

impl Task {

    /// Create a new running task, a total of `None` makes the task
    /// indeterminate until [`Self::set_total`] is called: it reports no
    /// progress and no computable percentage.
    pub fn new(name: impl Into<Box<str>>, total: Option<u32>) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                name: name.into(),
                counter: Counter {
                    success: AtomicU32::new(0),
                    failed: AtomicU32::new(0),
                    total: AtomicU32::new(total.unwrap_or(0)),
                },
                determinate: AtomicBool::new(total.is_some()),
                children: Mutex::new(Vec::new()),
                status: watch::Sender::new(Status::Running),
            }),
        }
    }

    /// The display name of this task.
    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Give this task a known item total, a task created indeterminate
    /// reports progress from this point on. Batch operations use this once
    /// they know how many items they carry.
    pub fn set_total(&self, total: u32) {
        self.inner.counter.total.store(total, Ordering::Relaxed);
        self.inner.determinate.store(true, Ordering::Relaxed);
    }

    /// Record one more finished item without terminating the task.
    pub fn advance(&self, success: bool) {
        let counter = &self.inner.counter;
        if success {
            counter.success.fetch_add(1, Ordering::Relaxed);
        } else {
            counter.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// The current counters, none for an indeterminate task.
    pub fn progress(&self) -> Option<Progress> {
        if !self.inner.determinate.load(Ordering::Relaxed) {
            return None;
        }
        let counter = &self.inner.counter;
        Some(Progress {
            success: counter.success.load(Ordering::Relaxed),
            failed: counter.failed.load(Ordering::Relaxed),
            total: counter.total.load(Ordering::Relaxed),
        })
    }

    /// The current status of this task.
    pub fn status(&self) -> Status {
        self.inner.status.borrow().clone()
    }

    /// True once the task reached a terminal status.
    pub fn is_finished(&self) -> bool {
        !matches!(&*self.inner.status.borrow(), Status::Running)
    }

    /// Terminate this task successfully, a no-op if already terminal.
    pub fn complete(&self) {
        self.inner.status.send_if_modified(|status| {
            match status {
                Status::Running => {
                    *status = Status::Done;
                    true
                }
                _ => false,
            }
        });
    }

    /// Terminate this task with a failure reason, a no-op if already terminal.
    pub fn abort(&self, reason: impl Into<Arc<str>>) {
        let reason = reason.into();
        self.inner.status.send_if_modified(|status| {
            match status {
                Status::Running => {
                    *status = Status::Failed(reason);
                    true
                }
                _ => false,
            }
        });
    }

    /// Wait until this task reaches a terminal status, returning immediately
    /// if it is already terminal.
    pub async fn wait(&self) -> Result<(), TaskError> {
        let mut rx = self.inner.status.subscribe();
        // The sender lives in our own inner so the channel cannot close here.
        let status = rx.wait_for(|status| !matches!(status, Status::Running)).await
            .map(|status| status.clone())
            .unwrap_or(Status::Done);
        match status {
            Status::Failed(reason) => Err(TaskError(reason)),
            _ => Ok(()),
        }
    }

    /// Attach this task as a display child of the given parent. The parent's
    /// completion stays independent of its children.
    pub fn attach(&self, parent: &Task) {
        parent.inner.children.lock().unwrap().push(self.clone());
    }

    /// Create a new task attached as a display child of this one.
    pub fn child(&self, name: impl Into<Box<str>>, total: Option<u32>) -> Task {
        let child = Task::new(name, total);
        child.attach(self);
        child
    }

    /// A snapshot of the currently attached children.
    pub fn children(&self) -> Vec<Task> {
        self.inner.children.lock().unwrap().clone()
    }

}

#[cfg(test)]
mod tests {

    use super::*;

    #[tokio::test]
    async fn terminal_once() {

        let task = Task::new("test", Some(2));
        task.advance(true);
        task.advance(false);

        let progress = task.progress().unwrap();
        assert_eq!(progress.success, 1);
        assert_eq!(progress.failed, 1);
        assert_eq!(progress.fraction(), 1.0);

        task.abort("boom");
        task.complete();  // Ignored, already terminal.
        assert_eq!(task.status(), Status::Failed(Arc::from("boom")));

        // Waiting after termination resolves immediately.
        let err = task.wait().await.unwrap_err();
        assert_eq!(&*err.0, "boom");

    }

    #[test]
    fn late_total() {

        let task = Task::new("test", None);
        task.advance(true);
        assert!(task.progress().is_none());

        task.set_total(2);
        let progress = task.progress().unwrap();
        assert_eq!(progress.success, 1);
        assert_eq!(progress.total, 2);
        assert_eq!(progress.fraction(), 0.5);

    }

    #[tokio::test]
    async fn indeterminate_and_children() {

        let parent = Task::new("parent", None);
        assert!(parent.progress().is_none());

        let child = parent.child("child", Some(1));
        child.advance(true);
        child.complete();

        assert_eq!(parent.children().len(), 1);
        assert!(!parent.is_finished());  // Children never complete the parent.

        parent.complete();
        parent.wait().await.unwrap();

    }

}
