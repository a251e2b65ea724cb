//! Named callable submitted to a Processor

/// A unit of work bound for a Processor.
///
/// Tasks are how callables cross threads: the closure must be `Send`,
/// and it is wrapped in a coroutine only once it reaches the owning
/// thread of the Processor it was placed on.
pub struct Task {
    name: String,
    call: Box<dyn FnOnce() + Send + 'static>,
}

impl Task {
    pub fn new<F>(call: F, name: impl Into<String>) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            name: name.into(),
            call: Box::new(call),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Split into the parts a Processor needs to build a coroutine.
    pub fn into_parts(self) -> (Box<dyn FnOnce() + Send + 'static>, String) {
        (self.call, self.name)
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_runs() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let hit = Arc::new(AtomicBool::new(false));
        let flag = hit.clone();
        let task = Task::new(move || flag.store(true, Ordering::Relaxed), "probe");
        assert_eq!(task.name(), "probe");
        let (call, name) = task.into_parts();
        call();
        assert_eq!(name, "probe");
        assert!(hit.load(Ordering::Relaxed));
    }
}
