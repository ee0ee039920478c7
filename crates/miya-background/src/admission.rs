use std::collections::VecDeque;

/// Bounds how many tasks may sit in their start sequence at once. Tasks over
/// the limit wait in launch order.
#[derive(Debug, Default)]
pub struct AdmissionController {
    limit: Option<usize>,
    in_flight: usize,
    queue: VecDeque<String>,
}

impl AdmissionController {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            limit,
            in_flight: 0,
            queue: VecDeque::new(),
        }
    }

    fn has_capacity(&self) -> bool {
        self.limit.map_or(true, |limit| self.in_flight < limit)
    }

    /// Takes a slot for `task_id` if one is free and nobody is waiting ahead
    /// of it, otherwise queues it. Returns whether the task may start now.
    pub fn admit(&mut self, task_id: &str) -> bool {
        if self.queue.is_empty() && self.has_capacity() {
            self.in_flight += 1;
            return true;
        }
        self.queue.push_back(task_id.to_string());
        false
    }

    pub fn release(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    /// Pops the next waiting task and takes a slot for it.
    pub fn next_ready(&mut self) -> Option<String> {
        if !self.has_capacity() {
            return None;
        }
        let next = self.queue.pop_front()?;
        self.in_flight += 1;
        Some(next)
    }

    pub fn remove(&mut self, task_id: &str) -> bool {
        let before = self.queue.len();
        self.queue.retain(|queued| queued != task_id);
        self.queue.len() != before
    }

    pub fn clear_queue(&mut self) -> Vec<String> {
        self.queue.drain(..).collect()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }
}
