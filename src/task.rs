//! Explicit task objects: the unit of work handed to the embedding
//! scheduler. Tasks never block; deferral is expressed by returning
//! [`TaskResult::Requeue`], which reschedules the task with a small
//! deadline bump.

use std::sync::Arc;

use crate::events::{self, Event};
use crate::filter::Filter;
use crate::flow;
use crate::link;
use crate::pid::{Pid, PidInst};
use crate::registry::RegFlags;
use crate::session::Session;

/// Backoff applied when a task requeues itself, in microseconds.
pub const REQUEUE_DELAY_US: u64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskResult {
    Done,
    /// Run again after [`REQUEUE_DELAY_US`].
    Requeue,
}

pub enum TaskKind {
    PidInit {
        pid: Arc<Pid>,
    },
    PidConnect {
        filter: Arc<Filter>,
        pid: Arc<Pid>,
    },
    PidReconfigure {
        filter: Arc<Filter>,
        pid: Arc<Pid>,
    },
    PidDisconnect {
        filter: Arc<Filter>,
        pid: Arc<Pid>,
    },
    PidDetach {
        filter: Arc<Filter>,
        pid: Arc<Pid>,
        new_chain_input: Arc<Filter>,
    },
    PidInstDelete {
        pid: Arc<Pid>,
        inst: Arc<PidInst>,
    },
    PidInstSwapDelete {
        inst: Arc<PidInst>,
    },
    PidReset {
        inst: Arc<PidInst>,
    },
    EventTowardSource {
        filter: Arc<Filter>,
        pid: Option<Arc<Pid>>,
        event: Event,
    },
    EventTowardSinks {
        filter: Arc<Filter>,
        event: Event,
    },
    FilterProcess {
        filter: Arc<Filter>,
    },
    FilterRemove {
        filter: Arc<Filter>,
    },
}

pub struct Task {
    pub(crate) kind: TaskKind,
    /// Absolute session time before which the task must not run.
    pub(crate) schedule_at_us: u64,
}

impl Task {
    pub(crate) fn new(kind: TaskKind) -> Task {
        Task {
            kind,
            schedule_at_us: 0,
        }
    }

    pub fn name(&self) -> &'static str {
        match &self.kind {
            TaskKind::PidInit { .. } => "pid_init",
            TaskKind::PidConnect { .. } => "pid_connect",
            TaskKind::PidReconfigure { .. } => "pid_reconfigure",
            TaskKind::PidDisconnect { .. } => "pidinst_disconnect",
            TaskKind::PidDetach { .. } => "pidinst_detach",
            TaskKind::PidInstDelete { .. } => "pid_inst_delete",
            TaskKind::PidInstSwapDelete { .. } => "pid_inst_swap_delete",
            TaskKind::PidReset { .. } => "reset_pid",
            TaskKind::EventTowardSource { .. } => "upstream_flow_event",
            TaskKind::EventTowardSinks { .. } => "downstream_flow_event",
            TaskKind::FilterProcess { .. } => "process",
            TaskKind::FilterRemove { .. } => "filter_destroy",
        }
    }

    /// The filter whose state this task touches; schedulers serialize
    /// tasks sharing one. Init and teardown tasks resolve their filter
    /// dynamically and return `None`.
    pub fn filter(&self) -> Option<&Arc<Filter>> {
        match &self.kind {
            TaskKind::PidInit { .. } => None,
            TaskKind::PidConnect { filter, .. }
            | TaskKind::PidReconfigure { filter, .. }
            | TaskKind::PidDisconnect { filter, .. }
            | TaskKind::PidDetach { filter, .. }
            | TaskKind::EventTowardSource { filter, .. }
            | TaskKind::EventTowardSinks { filter, .. }
            | TaskKind::FilterProcess { filter }
            | TaskKind::FilterRemove { filter } => Some(filter),
            TaskKind::PidInstDelete { .. }
            | TaskKind::PidInstSwapDelete { .. }
            | TaskKind::PidReset { .. } => None,
        }
    }

    /// True when the target filter demands main-thread callbacks.
    pub fn main_thread_only(&self) -> bool {
        self.filter()
            .map(|f| f.register().flags.contains(RegFlags::MAIN_THREAD))
            .unwrap_or(false)
    }

    pub fn schedule_at_us(&self) -> u64 {
        self.schedule_at_us
    }

    /// Executes the task body.
    pub fn run(&self, session: &Arc<Session>) -> TaskResult {
        match &self.kind {
            TaskKind::PidInit { pid } => link::init_task(session, pid),
            TaskKind::PidConnect { filter, pid } => link::connect_task(session, filter, pid),
            TaskKind::PidReconfigure { filter, pid } => {
                link::reconfigure_task(session, filter, pid)
            }
            TaskKind::PidDisconnect { filter, pid } => {
                link::disconnect_task(session, filter, pid)
            }
            TaskKind::PidDetach {
                filter,
                pid,
                new_chain_input,
            } => link::detach_task(session, filter, pid, new_chain_input),
            TaskKind::PidInstDelete { pid, inst } => link::inst_delete_task(session, pid, inst),
            TaskKind::PidInstSwapDelete { inst } => link::inst_swap_delete_task(session, inst),
            TaskKind::PidReset { inst } => {
                flow::reset_task(inst);
                TaskResult::Done
            }
            TaskKind::EventTowardSource { filter, pid, event } => {
                events::toward_source_task(session, filter, pid.as_ref(), event)
            }
            TaskKind::EventTowardSinks { filter, event } => {
                events::toward_sinks_task(session, filter, event)
            }
            TaskKind::FilterProcess { filter } => link::process_task(session, filter),
            TaskKind::FilterRemove { filter } => {
                session.remove_filter(filter);
                TaskResult::Done
            }
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name())
            .field("schedule_at_us", &self.schedule_at_us)
            .finish()
    }
}
