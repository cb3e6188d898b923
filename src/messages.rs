use std::collections::VecDeque;
use std::sync::Mutex;

/// Thread-safe FIFO of progress and warning lines.
///
/// The producing side is the reduction worker; the consuming side is
/// whichever thread polls the instance. Draining is destructive: each
/// message is handed out exactly once, in push order.
#[derive(Debug, Default)]
pub struct MessageQueue {
    queue: Mutex<VecDeque<String>>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: String) {
        self.queue.lock().unwrap().push_back(message);
    }

    /// Removes and returns every queued message, oldest first.
    pub fn drain(&self) -> Vec<String> {
        self.queue.lock().unwrap().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
