//! The filter session: registries, running filters, the task queue the
//! external scheduler drains, and the link-graph cache.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::debug;

use crate::error::Error;
use crate::filter::Filter;
use crate::graph::GraphNode;
use crate::registry::FilterRegister;
use crate::task::{Task, TaskResult, REQUEUE_DELAY_US};

/// Session tunables. Separator characters drive the arg syntax used for
/// pid properties and source-id directives.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Longest intermediate chain resolution may build; 0 disables
    /// resolution entirely.
    pub max_resolve_chain_len: u32,
    /// Default time-based buffer threshold, microseconds.
    pub default_pid_buffer_max_us: u64,
    /// Default unit-count buffer threshold.
    pub default_pid_buffer_max_units: u32,
    /// Time-based threshold applied to decoder input pids.
    pub decoder_pid_buffer_max_us: u64,
    /// Disables backpressure entirely (pids never block).
    pub disable_blocking: bool,
    pub sep_args: char,
    pub sep_name: char,
    pub sep_frag: char,
    pub sep_list: char,
    pub sep_neg: char,
}

impl Default for SessionConfig {
    fn default() -> SessionConfig {
        SessionConfig {
            max_resolve_chain_len: 6,
            default_pid_buffer_max_us: 1_000,
            default_pid_buffer_max_units: 1,
            decoder_pid_buffer_max_us: 1_000_000,
            disable_blocking: false,
            sep_args: ':',
            sep_name: '=',
            sep_frag: '#',
            sep_list: ',',
            sep_neg: '!',
        }
    }
}

/// A filter session. Owns the registries, the running filters and the
/// task queue; never spawns threads. The embedding scheduler pops tasks
/// (respecting deadlines and per-filter exclusion) and calls
/// [`Task::run`]; [`Session::run_tasks`] is a bundled single-threaded
/// pump doing exactly that.
pub struct Session {
    cfg: SessionConfig,
    registries: Mutex<Vec<Arc<FilterRegister>>>,
    filters: Mutex<Vec<Arc<Filter>>>,
    links: Mutex<Vec<GraphNode>>,
    tasks: Mutex<VecDeque<Task>>,
    start: Instant,
    /// Virtual time advanced past requeue deadlines by the pump.
    clock_skew_us: AtomicU64,
    last_connect_error: Mutex<Option<Error>>,
    pub(crate) pid_connect_tasks_pending: AtomicU32,
}

impl Session {
    pub fn new() -> Arc<Session> {
        Session::with_config(SessionConfig::default())
    }

    pub fn with_config(cfg: SessionConfig) -> Arc<Session> {
        Arc::new(Session {
            cfg,
            registries: Mutex::new(Vec::new()),
            filters: Mutex::new(Vec::new()),
            links: Mutex::new(Vec::new()),
            tasks: Mutex::new(VecDeque::new()),
            start: Instant::now(),
            clock_skew_us: AtomicU64::new(0),
            last_connect_error: Mutex::new(None),
            pid_connect_tasks_pending: AtomicU32::new(0),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.cfg
    }

    /// Monotonic session time in microseconds.
    pub fn now_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64 + self.clock_skew_us.load(Ordering::Acquire)
    }

    /// Registers a filter implementation; invalidates the link-graph
    /// cache, rebuilt lazily on the next resolution.
    pub fn add_registry(self: &Arc<Self>, reg: Arc<FilterRegister>) {
        self.registries.lock().unwrap().push(reg);
        self.links.lock().unwrap().clear();
    }

    pub fn registries(&self) -> Vec<Arc<FilterRegister>> {
        self.registries.lock().unwrap().clone()
    }

    pub(crate) fn links(&self) -> &Mutex<Vec<GraphNode>> {
        &self.links
    }

    /// Explicitly loads a filter instance. Source filters get their
    /// first process task queued immediately.
    pub fn load_filter(self: &Arc<Self>, reg: &Arc<FilterRegister>) -> Arc<Filter> {
        let filter = Filter::new(self, reg.clone());
        self.add_filter(&filter);
        if reg.configure.is_none() && reg.process.is_some() {
            filter.post_process_task();
        }
        filter
    }

    pub(crate) fn add_filter(&self, filter: &Arc<Filter>) {
        self.filters.lock().unwrap().push(filter.clone());
    }

    pub fn filters(&self) -> Vec<Arc<Filter>> {
        self.filters.lock().unwrap().clone()
    }

    pub(crate) fn remove_filter(&self, filter: &Arc<Filter>) {
        debug!("destroying filter {}", filter.name());
        self.filters
            .lock()
            .unwrap()
            .retain(|f| !Arc::ptr_eq(f, filter));
    }

    /// Queues a task for the scheduler.
    pub fn post_task(&self, mut task: Task) {
        if task.schedule_at_us == 0 {
            task.schedule_at_us = self.now_us();
        }
        self.tasks.lock().unwrap().push_back(task);
    }

    /// Pops the next runnable task, advancing virtual time to the
    /// earliest deadline when every queued task is deferred.
    pub fn pop_task(&self) -> Option<Task> {
        let mut tasks = self.tasks.lock().unwrap();
        if tasks.is_empty() {
            return None;
        }
        let now = self.now_us();
        if let Some(idx) = tasks.iter().position(|t| t.schedule_at_us <= now) {
            return tasks.remove(idx);
        }
        // all tasks deferred: jump the clock to the earliest deadline
        let min_at = tasks.iter().map(|t| t.schedule_at_us).min().unwrap_or(now);
        if min_at > now {
            self.clock_skew_us
                .fetch_add(min_at - now, Ordering::AcqRel);
        }
        let now = self.now_us();
        tasks
            .iter()
            .position(|t| t.schedule_at_us <= now)
            .and_then(|idx| tasks.remove(idx))
    }

    /// Single-threaded reference pump: drains the queue to quiescence.
    /// Returns the number of executed tasks; the iteration cap guards
    /// against requeue livelocks.
    pub fn run_tasks(self: &Arc<Self>) -> usize {
        const MAX_TASKS: usize = 100_000;
        let mut count = 0;
        while count < MAX_TASKS {
            let task = match self.pop_task() {
                Some(t) => t,
                None => break,
            };
            count += 1;
            match task.run(self) {
                TaskResult::Done => {}
                TaskResult::Requeue => {
                    let mut task = task;
                    task.schedule_at_us = self.now_us() + REQUEUE_DELAY_US;
                    self.tasks.lock().unwrap().push_back(task);
                }
            }
        }
        count
    }

    pub fn queued_tasks(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    pub(crate) fn set_last_connect_error(&self, e: Error) {
        let mut last = self.last_connect_error.lock().unwrap();
        if last.is_none() {
            *last = Some(e);
        }
    }

    pub(crate) fn clear_last_connect_error(&self) {
        *self.last_connect_error.lock().unwrap() = None;
    }

    /// Last connection error recorded by a failed resolution, if any.
    pub fn last_connect_error(&self) -> Option<Error> {
        *self.last_connect_error.lock().unwrap()
    }

    /// JSON dump of per-filter pipeline state and input statistics.
    pub fn stats_json(&self) -> String {
        let filters = self.filters();
        let entries: Vec<serde_json::Value> = filters
            .iter()
            .map(|f| {
                let inputs: Vec<serde_json::Value> = f
                    .input_pids()
                    .iter()
                    .map(|inst| {
                        serde_json::json!({
                            "pid": inst.pid_name(),
                            "stats": inst.stats(),
                        })
                    })
                    .collect();
                let outputs: Vec<serde_json::Value> = f
                    .output_pids()
                    .iter()
                    .map(|pid| {
                        let (max_units, nb_units, max_dur, dur) = pid.buffer_occupancy();
                        serde_json::json!({
                            "pid": pid.name(),
                            "destinations": pid.num_destinations(),
                            "buffer": {
                                "max_units": max_units,
                                "units": nb_units,
                                "max_duration_us": max_dur,
                                "duration_us": dur,
                            },
                        })
                    })
                    .collect();
                serde_json::json!({
                    "filter": f.name(),
                    "register": f.register().name,
                    "inputs": inputs,
                    "outputs": outputs,
                })
            })
            .collect();
        serde_json::to_string_pretty(&serde_json::Value::Array(entries))
            .unwrap_or_else(|_| "[]".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskKind;

    #[test]
    fn deferred_tasks_advance_virtual_clock() {
        let session = Session::new();
        let reg = FilterRegister::builder("noop").build();
        let filter = Filter::new(&session, reg);
        session.add_filter(&filter);

        let mut task = Task::new(TaskKind::FilterRemove {
            filter: filter.clone(),
        });
        task.schedule_at_us = session.now_us() + 10_000;
        session.post_task(task);

        let before = session.now_us();
        assert!(session.pop_task().is_some());
        assert!(session.now_us() >= before + 10_000);
    }

    #[test]
    fn run_tasks_drains_queue() {
        let session = Session::new();
        let reg = FilterRegister::builder("noop").build();
        let filter = Filter::new(&session, reg);
        session.add_filter(&filter);
        session.post_task(Task::new(TaskKind::FilterRemove { filter }));
        assert_eq!(session.run_tasks(), 1);
        assert_eq!(session.queued_tasks(), 0);
        assert!(session.filters().is_empty());
    }
}
