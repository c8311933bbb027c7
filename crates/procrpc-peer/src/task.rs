//! Timed callbacks sharing the event loop's wait.

use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{PeerError, Result};

/// Task lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting; the minimum bound is not honored yet.
    Idle,
    /// Armed: due once the minimum bound has passed.
    Hit,
    /// Executed; never fires again.
    Done,
}

/// A callback with optional time bounds.
///
/// - no bounds: due immediately
/// - `max`: due once `max` has passed, armed or not
/// - `min`: due once `min` has passed, but only after [`arm`](Self::arm)
pub struct Task {
    min: Option<Instant>,
    max: Option<Instant>,
    state: Cell<TaskState>,
    callback: Rc<dyn Fn(&Task)>,
}

impl Task {
    pub fn new<F>(min: Option<Instant>, max: Option<Instant>, callback: F) -> Self
    where
        F: Fn(&Task) + 'static,
    {
        Self {
            min,
            max,
            state: Cell::new(TaskState::Idle),
            callback: Rc::new(callback),
        }
    }

    /// Run on the next loop iteration.
    pub fn asap<F>(callback: F) -> Self
    where
        F: Fn(&Task) + 'static,
    {
        let task = Self::new(None, None, callback);
        task.state.set(TaskState::Hit);
        task
    }

    /// Run once `at` has passed.
    pub fn once<F>(at: Instant, callback: F) -> Self
    where
        F: Fn(&Task) + 'static,
    {
        Self::new(None, Some(at), callback)
    }

    /// Run once `delay` from now has passed.
    pub fn after<F>(delay: Duration, callback: F) -> Self
    where
        F: Fn(&Task) + 'static,
    {
        Self::once(Instant::now() + delay, callback)
    }

    /// Run no earlier than `min` once armed, and no later than `max` in any
    /// case.
    pub fn window<F>(min: Instant, max: Instant, callback: F) -> Self
    where
        F: Fn(&Task) + 'static,
    {
        Self::new(Some(min), Some(max), callback)
    }

    pub fn state(&self) -> TaskState {
        self.state.get()
    }

    pub fn min(&self) -> Option<Instant> {
        self.min
    }

    pub fn max(&self) -> Option<Instant> {
        self.max
    }

    /// Request execution, honoring the minimum bound. Executes right away if
    /// the task is already due.
    pub fn arm(&self) {
        if self.state.get() != TaskState::Idle {
            return;
        }
        self.state.set(TaskState::Hit);
        if self.is_due(Instant::now()) {
            self.execute();
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        if self.min.is_none() && self.max.is_none() {
            return true;
        }
        if self.max.is_some_and(|max| now > max) {
            return true;
        }
        self.state.get() == TaskState::Hit && self.min.is_some_and(|min| now > min)
    }

    /// Invoke the callback. A task with any bound becomes [`TaskState::Done`].
    pub fn execute(&self) {
        if self.min.is_some() || self.max.is_some() {
            self.state.set(TaskState::Done);
        }
        let callback = Rc::clone(&self.callback);
        callback(self);
    }

    pub fn is_active(&self) -> bool {
        self.state.get() != TaskState::Done
    }

    /// When the task becomes due without further action: the minimum bound
    /// once armed, otherwise the maximum bound.
    pub fn next_due(&self) -> Option<Instant> {
        if self.state.get() == TaskState::Hit && self.min.is_some() {
            return self.min;
        }
        self.max
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("min", &self.min)
            .field("max", &self.max)
            .field("state", &self.state.get())
            .finish()
    }
}

/// The scheduled tasks of one event loop.
#[derive(Debug, Default)]
pub struct TaskSet {
    tasks: Vec<Rc<Task>>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `task`; scheduling the same task twice is rejected.
    pub fn add(&mut self, task: Rc<Task>) -> Result<Rc<Task>> {
        if self.contains(&task) {
            return Err(PeerError::DuplicateTask);
        }
        self.tasks.push(Rc::clone(&task));
        Ok(task)
    }

    pub fn remove(&mut self, task: &Rc<Task>) -> Result<Rc<Task>> {
        let pos = self
            .tasks
            .iter()
            .position(|t| Rc::ptr_eq(t, task))
            .ok_or(PeerError::UnknownTask)?;
        Ok(self.tasks.remove(pos))
    }

    pub fn contains(&self, task: &Rc<Task>) -> bool {
        self.tasks.iter().any(|t| Rc::ptr_eq(t, task))
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Earliest instant at which an active task becomes due.
    pub fn next_deadline(&self, now: Instant) -> Option<Instant> {
        self.tasks
            .iter()
            .filter(|t| t.is_active())
            .filter_map(|t| if t.is_due(now) { Some(now) } else { t.next_due() })
            .min()
    }

    /// Execute every due task and drop it, along with tasks that finished
    /// elsewhere (for instance through [`Task::arm`]). Returns the number
    /// executed.
    pub fn run_due(&mut self, now: Instant) -> usize {
        let due: Vec<Rc<Task>> = self
            .tasks
            .iter()
            .filter(|t| t.is_active() && t.is_due(now))
            .cloned()
            .collect();
        self.tasks
            .retain(|t| t.is_active() && !due.iter().any(|d| Rc::ptr_eq(d, t)));

        for task in &due {
            debug!(?task, "running task");
            task.execute();
        }
        due.len()
    }
}
