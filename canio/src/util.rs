use tokio::task::JoinHandle;

/// Aborts the wrapped task when dropped.
pub struct KillJoinHandle<T> {
    handle: Option<JoinHandle<T>>,
}

impl<T> KillJoinHandle<T> {
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |handle| handle.is_finished())
    }
}

impl<T> Drop for KillJoinHandle<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

pub fn kill_task_on_drop<T>(handle: JoinHandle<T>) -> KillJoinHandle<T> {
    KillJoinHandle {
        handle: Some(handle),
    }
}
