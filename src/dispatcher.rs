// Copyright 2025 Strata ECS contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Worker pool with priority-ordered queues.
//!
//! A fixed set of workers (default: hardware concurrency minus one) drains
//! two kinds of work:
//!
//! - the built-in *parallel* queue, a FIFO any idle worker may pop;
//! - user-created *named* queues with integer priorities. A worker draining
//!   a named queue holds it until the task finishes, which serialises that
//!   queue while the others stay available.
//!
//! Named queues with positive priority preempt the parallel queue; the
//! parallel queue preempts priorities at or below the default (0).
//!
//! Worker threads carry stable ids `1..=worker_count`; any thread outside
//! the pool (the submitter included) reports id 0 via
//! [`current_thread_id`]. In single-thread mode every submission executes
//! inline on the submitting thread.

use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::sync::WaitGroup;
use parking_lot::{Condvar, Mutex};
use tracing::debug;

/// Standard queue priorities
pub mod priority {
    pub const DEFAULT: i32 = 0;
    pub const HIGH: i32 = 100;
    pub const LOW: i32 = -100;
    pub const BACKGROUND: i32 = -1000;
}

type Task = Box<dyn FnOnce(u32) + Send + 'static>;

thread_local! {
    static CURRENT_THREAD_ID: Cell<u32> = const { Cell::new(0) };
}

/// Id of the calling thread: `1..=worker_count` inside the pool, 0 outside.
pub fn current_thread_id() -> u32 {
    CURRENT_THREAD_ID.with(|id| id.get())
}

struct NamedQueue {
    name: String,
    priority: i32,
    tasks: VecDeque<Task>,
    held: bool,
    pending: usize,
}

#[derive(Default)]
struct State {
    parallel: VecDeque<Task>,
    parallel_pending: usize,
    queues: Vec<NamedQueue>,
}

struct Shared {
    state: Mutex<State>,
    work_cv: Condvar,
    done_cv: Condvar,
    shutdown: AtomicBool,
    single_thread: AtomicBool,
}

enum Picked {
    Parallel(Task),
    Named(usize, Task),
}

impl Shared {
    fn pick(&self, state: &mut State) -> Option<Picked> {
        // the parallel queue competes at priority 0; positive-priority named
        // queues go first, held queues are skipped
        let mut best: Option<usize> = None;
        for (index, queue) in state.queues.iter().enumerate() {
            if queue.held || queue.tasks.is_empty() {
                continue;
            }
            if best.map(|b| state.queues[b].priority < queue.priority).unwrap_or(true) {
                best = Some(index);
            }
        }
        if let Some(index) = best {
            if state.queues[index].priority > priority::DEFAULT || state.parallel.is_empty() {
                let task = state.queues[index].tasks.pop_front().unwrap();
                state.queues[index].held = true;
                return Some(Picked::Named(index, task));
            }
        }
        state.parallel.pop_front().map(Picked::Parallel)
    }

    fn worker_loop(&self, worker_id: u32) {
        CURRENT_THREAD_ID.with(|id| id.set(worker_id));
        debug!(worker_id, "worker started");
        loop {
            let picked = {
                let mut state = self.state.lock();
                loop {
                    if let Some(picked) = self.pick(&mut state) {
                        break picked;
                    }
                    if self.shutdown.load(Ordering::Acquire) {
                        return;
                    }
                    self.work_cv.wait(&mut state);
                }
            };
            match picked {
                Picked::Parallel(task) => {
                    task(worker_id);
                    let mut state = self.state.lock();
                    state.parallel_pending -= 1;
                }
                Picked::Named(index, task) => {
                    task(worker_id);
                    let mut state = self.state.lock();
                    state.queues[index].held = false;
                    state.queues[index].pending -= 1;
                    // releasing the hold may unblock this queue for others
                    self.work_cv.notify_all();
                }
            }
            self.done_cv.notify_all();
        }
    }
}

/// Fixed-size worker pool. See the module docs for the queue model.
pub struct Dispatcher {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    thread_count: u32,
}

impl Dispatcher {
    /// Pool with the default worker count (hardware concurrency minus one)
    pub fn new() -> Self {
        Self::with_threads(Self::max_thread_count().saturating_sub(1))
    }

    /// Pool with an explicit worker count. Zero workers means every
    /// submission runs inline.
    pub fn with_threads(thread_count: u32) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            work_cv: Condvar::new(),
            done_cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
            single_thread: AtomicBool::new(false),
        });
        let workers = (1..=thread_count)
            .map(|worker_id| {
                let shared = shared.clone();
                std::thread::Builder::new()
                    .name(format!("strata-worker-{worker_id}"))
                    .spawn(move || shared.worker_loop(worker_id))
                    .expect("failed to start worker thread")
            })
            .collect();
        Self {
            shared,
            workers,
            thread_count,
        }
    }

    /// Number of pool workers
    pub fn thread_count(&self) -> u32 {
        self.thread_count
    }

    /// Hardware concurrency
    pub fn max_thread_count() -> u32 {
        std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1)
    }

    /// Force all submissions to execute inline on the submitting thread
    pub fn set_single_thread_mode(&self, on: bool) {
        self.shared.single_thread.store(on, Ordering::Release);
    }

    fn inline_mode(&self) -> bool {
        self.thread_count == 0 || self.shared.single_thread.load(Ordering::Acquire)
    }

    /// Submit a task to the built-in parallel queue
    pub fn add_parallel_task(&self, task: impl FnOnce(u32) + Send + 'static) {
        if self.inline_mode() {
            task(current_thread_id());
            return;
        }
        let mut state = self.shared.state.lock();
        state.parallel.push_back(Box::new(task));
        state.parallel_pending += 1;
        drop(state);
        self.shared.work_cv.notify_one();
    }

    /// Block the calling thread until the parallel queue is empty.
    ///
    /// Must not be called from a pool worker.
    pub fn wait_for_parallel(&self) {
        let mut state = self.shared.state.lock();
        while state.parallel_pending > 0 {
            self.shared.done_cv.wait(&mut state);
        }
    }

    /// Split `[begin, end)` into `task_count` contiguous sub-ranges, submit
    /// each as a parallel task, and block until all are done.
    ///
    /// `task_count == 0` picks `min(size, worker_count)`.
    pub fn parallel_for<F>(&self, begin: usize, end: usize, task_count: u32, function: F)
    where
        F: Fn(usize, u32) + Send + Sync,
    {
        let size = end.saturating_sub(begin);
        if size == 0 {
            return;
        }
        if self.inline_mode() {
            let id = current_thread_id();
            for i in begin..end {
                function(i, id);
            }
            return;
        }
        let task_count = if task_count == 0 {
            (size as u32).min(self.thread_count.max(1))
        } else {
            task_count
        };

        let per_task = size / task_count as usize;
        let tasks_with_extra = size - per_task * task_count as usize;

        // SAFETY: the function pointer is only dereferenced by tasks that
        // this call waits on below; the reference cannot outlive the frame.
        let function_addr = &function as *const F as usize;
        let wait_group = WaitGroup::new();
        let mut task_begin = begin;
        for task in 0..task_count as usize {
            let task_size = if task < tasks_with_extra {
                per_task + 1
            } else {
                per_task
            };
            let task_end = task_begin + task_size;
            let wg = wait_group.clone();
            let start = task_begin;
            self.add_parallel_task(move |worker_id| {
                // SAFETY: see above; F is Sync so shared calls are allowed
                let function = unsafe { &*(function_addr as *const F) };
                for i in start..task_end {
                    function(i, worker_id);
                }
                drop(wg);
            });
            task_begin = task_end;
        }
        wait_group.wait();
    }

    /// Create a named queue with the given priority
    pub fn create_queue(&self, name: impl Into<String>, priority: i32) -> Queue {
        let name = name.into();
        let mut state = self.shared.state.lock();
        let id = state.queues.len();
        debug!(queue = %name, priority, "queue created");
        state.queues.push(NamedQueue {
            name,
            priority,
            tasks: VecDeque::new(),
            held: false,
            pending: 0,
        });
        Queue {
            shared: self.shared.clone(),
            id,
            inline: self.thread_count == 0,
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.work_cv.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Handle to a named queue.
pub struct Queue {
    shared: Arc<Shared>,
    id: usize,
    inline: bool,
}

impl Queue {
    pub fn name(&self) -> String {
        self.shared.state.lock().queues[self.id].name.clone()
    }

    /// Submit a task. Tasks of one queue never run concurrently.
    pub fn submit(&self, task: impl FnOnce(u32) + Send + 'static) {
        if self.inline || self.shared.single_thread.load(Ordering::Acquire) {
            task(current_thread_id());
            return;
        }
        let mut state = self.shared.state.lock();
        let queue = &mut state.queues[self.id];
        queue.tasks.push_back(Box::new(task));
        queue.pending += 1;
        drop(state);
        self.shared.work_cv.notify_one();
    }

    /// Block until every task submitted so far has completed.
    ///
    /// Must not be called from a pool worker.
    pub fn wait(&self) {
        let mut state = self.shared.state.lock();
        while state.queues[self.id].pending > 0 {
            self.shared.done_cv.wait(&mut state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_parallel_for_covers_range() {
        let dispatcher = Dispatcher::with_threads(3);
        let hits: Vec<AtomicUsize> = (0..100).map(|_| AtomicUsize::new(0)).collect();
        dispatcher.parallel_for(0, 100, 0, |i, _thread| {
            hits[i].fetch_add(1, Ordering::Relaxed);
        });
        assert!(hits.iter().all(|h| h.load(Ordering::Relaxed) == 1));
    }

    #[test]
    fn test_parallel_for_split_sizes() {
        // 10 items over 4 tasks: sizes 3,3,2,2
        let dispatcher = Dispatcher::with_threads(0); // inline, deterministic
        let count = AtomicUsize::new(0);
        dispatcher.parallel_for(5, 15, 4, |_i, _t| {
            count.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(count.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn test_named_queue_serializes() {
        let dispatcher = Dispatcher::with_threads(4);
        let queue = dispatcher.create_queue("io", priority::HIGH);
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        for _ in 0..32 {
            let running = running.clone();
            let max_seen = max_seen.clone();
            queue.submit(move |_thread| {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_micros(200));
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }
        queue.wait();
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_worker_ids_stable_and_in_range() {
        let dispatcher = Dispatcher::with_threads(2);
        assert_eq!(current_thread_id(), 0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..16 {
            let seen = seen.clone();
            dispatcher.add_parallel_task(move |worker_id| {
                seen.lock().push(worker_id);
            });
        }
        dispatcher.wait_for_parallel();
        for id in seen.lock().iter() {
            assert!((1..=2).contains(id));
        }
    }

    #[test]
    fn test_single_thread_mode_runs_inline() {
        let dispatcher = Dispatcher::with_threads(2);
        dispatcher.set_single_thread_mode(true);
        let count = AtomicUsize::new(0);
        dispatcher.parallel_for(0, 10, 0, |_i, thread| {
            assert_eq!(thread, 0);
            count.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(count.load(Ordering::Relaxed), 10);
        dispatcher.set_single_thread_mode(false);
    }

    #[test]
    fn test_queue_wait_drains() {
        let dispatcher = Dispatcher::with_threads(2);
        let queue = dispatcher.create_queue("bg", priority::BACKGROUND);
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let count = count.clone();
            queue.submit(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        queue.wait();
        assert_eq!(count.load(Ordering::SeqCst), 8);
    }
}
