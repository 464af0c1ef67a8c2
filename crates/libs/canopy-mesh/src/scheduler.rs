//! Cooperative task list.
//!
//! Tasks are plain records tagged with a caller-supplied kind; a scheduler
//! pass returns the kinds that came due so the owner can dispatch them with
//! full access to its own state. Nothing here calls back into anything,
//! which is what lets the whole mesh run single-threaded without `Rc`
//! cycles between timers and the core.

use std::collections::BTreeMap;

use crate::clock::{deadline, is_due};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Iterations {
    Forever,
    Count(u32),
}

#[derive(Debug, Clone)]
struct Task<K> {
    kind: K,
    interval_ms: u32,
    iterations: Iterations,
    next_due: u32,
    enabled: bool,
}

#[derive(Debug)]
pub struct Scheduler<K> {
    tasks: BTreeMap<TaskId, Task<K>>,
    next_id: u32,
}

impl<K: Clone> Scheduler<K> {
    pub fn new() -> Self {
        Self { tasks: BTreeMap::new(), next_id: 1 }
    }

    /// Register a task, disabled until enabled.
    pub fn add(&mut self, kind: K, interval_ms: u32, iterations: Iterations) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1).max(1);
        self.tasks.insert(id, Task { kind, interval_ms, iterations, next_due: 0, enabled: false });
        id
    }

    /// Recurring task enabled immediately; first run on the next pass.
    pub fn schedule_every(&mut self, kind: K, interval_ms: u32, now: u32) -> TaskId {
        let id = self.add(kind, interval_ms, Iterations::Forever);
        self.enable(id, now);
        id
    }

    /// One-shot task firing `delay_ms` from now.
    pub fn schedule_once(&mut self, kind: K, delay_ms: u32, now: u32) -> TaskId {
        let id = self.add(kind, delay_ms, Iterations::Count(1));
        self.enable_delayed(id, delay_ms, now);
        id
    }

    pub fn enable(&mut self, id: TaskId, now: u32) {
        if let Some(task) = self.tasks.get_mut(&id) {
            task.enabled = true;
            task.next_due = now;
        }
    }

    pub fn enable_delayed(&mut self, id: TaskId, delay_ms: u32, now: u32) {
        if let Some(task) = self.tasks.get_mut(&id) {
            task.enabled = true;
            task.next_due = deadline(now, delay_ms);
        }
    }

    pub fn disable(&mut self, id: TaskId) {
        if let Some(task) = self.tasks.get_mut(&id) {
            task.enabled = false;
        }
    }

    pub fn force_next_iteration(&mut self, id: TaskId, now: u32) {
        if let Some(task) = self.tasks.get_mut(&id) {
            if task.enabled {
                task.next_due = now;
            }
        }
    }

    pub fn remove(&mut self, id: TaskId) {
        self.tasks.remove(&id);
    }

    pub fn is_enabled(&self, id: TaskId) -> bool {
        self.tasks.get(&id).is_some_and(|task| task.enabled)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// One pass: collect every due task kind, re-arm recurring tasks, and
    /// retire exhausted one-shots.
    pub fn execute(&mut self, now: u32) -> Vec<K> {
        let mut due = Vec::new();
        let mut retired = Vec::new();

        for (id, task) in self.tasks.iter_mut() {
            if !task.enabled || !is_due(now, task.next_due) {
                continue;
            }
            due.push(task.kind.clone());
            match task.iterations {
                Iterations::Forever => task.next_due = deadline(now, task.interval_ms),
                Iterations::Count(remaining) => {
                    if remaining <= 1 {
                        retired.push(*id);
                    } else {
                        task.iterations = Iterations::Count(remaining - 1);
                        task.next_due = deadline(now, task.interval_ms);
                    }
                }
            }
        }

        for id in retired {
            self.tasks.remove(&id);
        }
        due
    }
}

impl<K: Clone> Default for Scheduler<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_tasks_never_fire() {
        let mut sched: Scheduler<u8> = Scheduler::new();
        sched.add(1, 100, Iterations::Forever);
        assert!(sched.execute(1_000).is_empty());
    }

    #[test]
    fn recurring_task_rearms_on_interval() {
        let mut sched: Scheduler<u8> = Scheduler::new();
        sched.schedule_every(7, 100, 0);
        assert_eq!(sched.execute(0), vec![7]);
        assert!(sched.execute(50).is_empty());
        assert_eq!(sched.execute(100), vec![7]);
        assert_eq!(sched.execute(250), vec![7]);
    }

    #[test]
    fn one_shot_retires_after_firing() {
        let mut sched: Scheduler<u8> = Scheduler::new();
        sched.schedule_once(3, 500, 0);
        assert!(sched.execute(499).is_empty());
        assert_eq!(sched.execute(500), vec![3]);
        assert!(sched.execute(1_000).is_empty());
        assert!(sched.is_empty());
    }

    #[test]
    fn enable_delayed_pushes_first_run_out() {
        let mut sched: Scheduler<u8> = Scheduler::new();
        let id = sched.add(9, 100, Iterations::Forever);
        sched.enable_delayed(id, 10_000, 0);
        assert!(sched.execute(9_999).is_empty());
        assert_eq!(sched.execute(10_000), vec![9]);
    }

    #[test]
    fn force_next_iteration_runs_early() {
        let mut sched: Scheduler<u8> = Scheduler::new();
        let id = sched.schedule_every(4, 60_000, 0);
        assert_eq!(sched.execute(0), vec![4]);
        sched.force_next_iteration(id, 10);
        assert_eq!(sched.execute(10), vec![4]);
    }

    #[test]
    fn timeout_rearm_by_enable_delayed_resets_deadline() {
        let mut sched: Scheduler<u8> = Scheduler::new();
        let id = sched.add(5, 0, Iterations::Count(1));
        sched.enable_delayed(id, 1_000, 0);
        // Re-arm before expiry, as every NodeSync does for its timeout task.
        sched.enable_delayed(id, 1_000, 900);
        assert!(sched.execute(1_000).is_empty());
        assert_eq!(sched.execute(1_900), vec![5]);
    }

    #[test]
    fn execute_works_across_clock_wrap() {
        let mut sched: Scheduler<u8> = Scheduler::new();
        let id = sched.add(6, 100, Iterations::Forever);
        sched.enable_delayed(id, 50, u32::MAX - 20);
        assert!(sched.execute(u32::MAX - 1).is_empty());
        assert_eq!(sched.execute(29), vec![6]);
    }
}
