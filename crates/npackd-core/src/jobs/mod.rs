use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

/// Point-in-time view of the root job, published on every change for
/// progress consumers (CLI, GUI).
#[derive(Clone, Debug, PartialEq)]
pub struct JobSnapshot {
    pub title: String,
    pub hint: String,
    pub progress: f64,
    pub error: Option<String>,
    pub completed: bool,
    pub cancelled: bool,
}

#[derive(Debug)]
struct JobState {
    title: String,
    hint: String,
    progress: f64,
    error: Option<String>,
    completed: bool,
}

struct ParentLink {
    parent: Arc<JobInner>,
    /// Share of the parent's progress owned by this sub-job (0..1).
    weight: f64,
    /// Parent progress at sub-job creation; the sub-job advances the
    /// parent within `[start, start + weight]`.
    start: f64,
    /// Parent hint at sub-job creation; sub-job hints are appended to it.
    hint_base: String,
}

struct JobInner {
    state: Mutex<JobState>,
    cancel: AtomicBool,
    parent: Option<ParentLink>,
    events: watch::Sender<JobSnapshot>,
    root: Option<Arc<JobInner>>,
}

/// One node of the hierarchical progress tree.
///
/// A long-running operation receives a `Job`, subdivides its work with
/// [`Job::new_sub_job`] and polls [`Job::should_proceed`] at reasonable
/// intervals; nothing is preempted asynchronously.
#[derive(Clone)]
pub struct Job {
    inner: Arc<JobInner>,
}

impl Job {
    pub fn new(title: impl Into<String>) -> Self {
        let title = title.into();
        let (events, _) = watch::channel(JobSnapshot {
            title: title.clone(),
            hint: String::new(),
            progress: 0.0,
            error: None,
            completed: false,
            cancelled: false,
        });

        Self {
            inner: Arc::new(JobInner {
                state: Mutex::new(JobState {
                    title,
                    hint: String::new(),
                    progress: 0.0,
                    error: None,
                    completed: false,
                }),
                cancel: AtomicBool::new(false),
                parent: None,
                events,
                root: None,
            }),
        }
    }

    /// Creates a child contributing `weight × child.progress` to this
    /// job's progress, starting from the current progress value.
    pub fn new_sub_job(&self, weight: f64, title: impl Into<String>) -> Job {
        let title = title.into();
        let (start, hint_base) = {
            let state = self.inner.state.lock().unwrap();
            (state.progress, state.hint.clone())
        };

        let child = Job {
            inner: Arc::new(JobInner {
                state: Mutex::new(JobState {
                    title: title.clone(),
                    hint: String::new(),
                    progress: 0.0,
                    error: None,
                    completed: false,
                }),
                cancel: AtomicBool::new(false),
                parent: Some(ParentLink {
                    parent: self.inner.clone(),
                    weight,
                    start,
                    hint_base,
                }),
                events: self.inner.events.clone(),
                root: Some(self.root_inner()),
            }),
        };

        propagate_hint(&child.inner, title);
        child.fire();
        child
    }

    /// False iff this job or any ancestor was cancelled or errored.
    pub fn should_proceed(&self) -> bool {
        let mut current = Some(self.inner.clone());
        while let Some(inner) = current {
            if inner.cancel.load(Ordering::SeqCst) {
                return false;
            }
            if inner.state.lock().unwrap().error.is_some() {
                return false;
            }
            current = inner.parent.as_ref().map(|link| link.parent.clone());
        }
        true
    }

    /// Requests cooperative cancellation of this job and its descendants.
    pub fn cancel(&self) {
        self.inner.cancel.store(true, Ordering::SeqCst);
        self.fire();
    }

    pub fn is_cancelled(&self) -> bool {
        let mut current = Some(self.inner.clone());
        while let Some(inner) = current {
            if inner.cancel.load(Ordering::SeqCst) {
                return true;
            }
            current = inner.parent.as_ref().map(|link| link.parent.clone());
        }
        false
    }

    /// Records the first error; later calls keep the original message.
    pub fn set_error(&self, message: impl Into<String>) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.error.is_none() {
                state.error = Some(message.into());
            }
        }
        self.fire();
    }

    pub fn error_message(&self) -> Option<String> {
        self.inner.state.lock().unwrap().error.clone()
    }

    pub fn set_progress(&self, progress: f64) {
        let progress = progress.clamp(0.0, 1.0);
        self.inner.state.lock().unwrap().progress = progress;
        propagate_progress(&self.inner, progress);
        self.fire();
    }

    pub fn progress(&self) -> f64 {
        self.inner.state.lock().unwrap().progress
    }

    pub fn set_hint(&self, hint: impl Into<String>) {
        let hint = hint.into();
        self.inner.state.lock().unwrap().hint = hint;
        let effective = self.effective_hint();
        propagate_hint(&self.inner, effective);
        self.fire();
    }

    pub fn hint(&self) -> String {
        self.inner.state.lock().unwrap().hint.clone()
    }

    pub fn set_title(&self, title: impl Into<String>) {
        self.inner.state.lock().unwrap().title = title.into();
        self.fire();
    }

    pub fn title(&self) -> String {
        self.inner.state.lock().unwrap().title.clone()
    }

    /// Marks the job terminal and clamps its progress to 1.0.
    pub fn complete(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.completed = true;
            state.progress = 1.0;
        }
        propagate_progress(&self.inner, 1.0);
        self.fire();
    }

    pub fn is_completed(&self) -> bool {
        self.inner.state.lock().unwrap().completed
    }

    /// Change events of the whole tree, observed at the root.
    pub fn subscribe(&self) -> watch::Receiver<JobSnapshot> {
        self.inner.events.subscribe()
    }

    fn effective_hint(&self) -> String {
        let state = self.inner.state.lock().unwrap();
        if state.hint.is_empty() {
            state.title.clone()
        } else {
            format!("{} / {}", state.title, state.hint)
        }
    }

    fn root_inner(&self) -> Arc<JobInner> {
        self.inner.root.clone().unwrap_or_else(|| self.inner.clone())
    }

    fn fire(&self) {
        let root = self.root_inner();
        let cancelled = root.cancel.load(Ordering::SeqCst);
        let state = root.state.lock().unwrap();
        let snapshot = JobSnapshot {
            title: state.title.clone(),
            hint: state.hint.clone(),
            progress: state.progress,
            error: state.error.clone(),
            completed: state.completed,
            cancelled,
        };
        drop(state);
        let _ = root.events.send(snapshot);
    }
}

/// Pushes a child's progress into its ancestors, scaled by the sub-job
/// weight at each level.
fn propagate_progress(inner: &Arc<JobInner>, child_progress: f64) {
    let mut child = inner.clone();
    let mut progress = child_progress;
    while let Some(link) = child.parent.as_ref() {
        let parent_progress = (link.start + link.weight * progress).clamp(0.0, 1.0);
        link.parent.state.lock().unwrap().progress = parent_progress;
        progress = parent_progress;
        let next = link.parent.clone();
        child = next;
    }
}

/// Composes `parent hint / child title / child hint` breadcrumbs up to
/// the root, the form progress consumers render.
fn propagate_hint(inner: &Arc<JobInner>, child_hint: String) {
    let mut child = inner.clone();
    let mut hint = child_hint;
    while let Some(link) = child.parent.as_ref() {
        let parent_hint = if link.hint_base.is_empty() {
            hint.clone()
        } else {
            format!("{} / {}", link.hint_base, hint)
        };
        link.parent.state.lock().unwrap().hint = parent_hint.clone();
        hint = parent_hint;
        let next = link.parent.clone();
        child = next;
    }
}
