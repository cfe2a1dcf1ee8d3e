//! Main and priority job queues.

use std::collections::VecDeque;

use crate::job::JobSpec;

/// Which queue a job was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Priority,
    Main,
}

/// FIFO main queue plus an always-first FIFO priority queue.
///
/// Only the main queue is ever cleared.
#[derive(Debug, Default)]
pub struct WorkQueue {
    main: VecDeque<JobSpec>,
    priority: VecDeque<JobSpec>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_main(&mut self, job: JobSpec) {
        self.main.push_back(job);
    }

    pub fn extend_main(&mut self, jobs: impl IntoIterator<Item = JobSpec>) {
        self.main.extend(jobs);
    }

    pub fn push_priority(&mut self, job: JobSpec) {
        self.priority.push_back(job);
    }

    /// Next job, priority queue first.
    pub fn pop_next(&mut self) -> Option<(JobSpec, QueueKind)> {
        if let Some(job) = self.priority.pop_front() {
            return Some((job, QueueKind::Priority));
        }
        self.main.pop_front().map(|job| (job, QueueKind::Main))
    }

    /// Next priority job only; main-queue jobs stay put.
    pub fn pop_priority(&mut self) -> Option<JobSpec> {
        self.priority.pop_front()
    }

    /// Drop all pending main-queue jobs; returns how many were removed.
    pub fn clear_main(&mut self) -> usize {
        let n = self.main.len();
        self.main.clear();
        n
    }

    pub fn main_len(&self) -> usize {
        self.main.len()
    }

    pub fn priority_len(&self) -> usize {
        self.priority.len()
    }

    pub fn is_empty(&self) -> bool {
        self.main.is_empty() && self.priority.is_empty()
    }
}
