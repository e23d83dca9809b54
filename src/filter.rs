use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::debug;

use crate::error::{Error, Result};
use crate::props::PropValue;
use crate::registry::FilterRegister;
use crate::pid::{Pid, PidInst};
use crate::session::Session;
use crate::task::{Task, TaskKind};
use crate::util::FourCC;

/// A running filter instance, as far as the core owns it.
///
/// The filter's processing logic is opaque; the core only manages pid
/// lists, connection bookkeeping and the pending counters that gate
/// teardown. Counter fields are atomics so the scheduler and producer
/// paths can read them without taking the list mutexes.
pub struct Filter {
    pub(crate) session: Weak<Session>,
    pub(crate) register: Arc<FilterRegister>,
    pub(crate) name: Mutex<String>,
    /// Explicit identifier used by source-id link directives.
    pub(crate) id: Mutex<Option<String>>,
    /// Restricts which source filters may feed this one.
    pub(crate) source_ids: Mutex<Option<String>>,
    /// Original argument string; `#Prop=value` fragments become pid
    /// properties, `gfreg=` names preferred registries.
    pub(crate) args: Mutex<Option<String>>,

    pub(crate) inputs: Mutex<Vec<Arc<PidInst>>>,
    pub(crate) outputs: Mutex<Vec<Arc<Pid>>>,
    pub(crate) num_inputs: AtomicUsize,
    pub(crate) num_outputs: AtomicUsize,

    /// Registers that failed to (re)configure against our pids.
    pub(crate) blacklist: Mutex<Vec<Arc<FilterRegister>>>,
    pub(crate) cloned_from: Mutex<Option<Weak<Filter>>>,
    /// Next filter in a resolved chain (destination hint).
    pub(crate) dst_filter: Mutex<Option<Weak<Filter>>>,
    /// Original resolution target, kept to recover from wrong chains.
    pub(crate) target_filter: Mutex<Option<Weak<Filter>>>,

    /// Instantiated by chain resolution rather than explicitly loaded.
    pub(crate) dynamic: AtomicBool,
    pub(crate) is_adaptation: AtomicBool,
    pub(crate) sticky: AtomicBool,
    pub(crate) clonable: AtomicBool,
    pub(crate) removed: AtomicBool,
    pub(crate) finalized: AtomicBool,

    pub(crate) would_block: AtomicU32,
    pub(crate) num_out_pids_not_connected: AtomicU32,
    pub(crate) num_out_pids_eos: AtomicU32,
    pub(crate) pending_packets: AtomicU32,
    pub(crate) stream_reset_pending: AtomicU32,
    pub(crate) out_pid_connection_pending: AtomicU32,
    pub(crate) in_pid_connection_pending: AtomicU32,
    pub(crate) nb_caps_renegotiate: AtomicU32,
    pub(crate) num_events_queued: AtomicU32,
    pub(crate) process_task_queued: AtomicU32,

    /// Pids created during a callback, flushed into init tasks when the
    /// callback returns.
    pub(crate) pending_pids: Mutex<VecDeque<Arc<Pid>>>,
    /// Instances parked by a detach, awaiting reattachment by a swap.
    pub(crate) detached: Mutex<Vec<Arc<PidInst>>>,
    pub(crate) swap_src: Mutex<Option<Arc<PidInst>>>,
    pub(crate) swap_dst: Mutex<Option<Arc<PidInst>>>,
    pub(crate) swap_needs_init: AtomicBool,

    /// Cap bundle selected for this filter during chain resolution, -1
    /// when not resolved.
    pub(crate) cap_idx_at_resolution: AtomicI64,

    /// Clock reference pending re-dispatch on our outputs.
    pub(crate) pending_clock: Mutex<Option<(u64, u32, crate::packet::ClockType)>>,

    /// Filter-private scratch state.
    pub(crate) state: Mutex<Option<Box<dyn Any + Send>>>,
}

impl Filter {
    pub(crate) fn new(session: &Arc<Session>, register: Arc<FilterRegister>) -> Arc<Filter> {
        Arc::new(Filter {
            session: Arc::downgrade(session),
            name: Mutex::new(register.name.clone()),
            register,
            id: Mutex::new(None),
            source_ids: Mutex::new(None),
            args: Mutex::new(None),
            inputs: Mutex::new(Vec::new()),
            outputs: Mutex::new(Vec::new()),
            num_inputs: AtomicUsize::new(0),
            num_outputs: AtomicUsize::new(0),
            blacklist: Mutex::new(Vec::new()),
            cloned_from: Mutex::new(None),
            dst_filter: Mutex::new(None),
            target_filter: Mutex::new(None),
            dynamic: AtomicBool::new(false),
            is_adaptation: AtomicBool::new(false),
            sticky: AtomicBool::new(false),
            clonable: AtomicBool::new(false),
            removed: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            would_block: AtomicU32::new(0),
            num_out_pids_not_connected: AtomicU32::new(0),
            num_out_pids_eos: AtomicU32::new(0),
            pending_packets: AtomicU32::new(0),
            stream_reset_pending: AtomicU32::new(0),
            out_pid_connection_pending: AtomicU32::new(0),
            in_pid_connection_pending: AtomicU32::new(0),
            nb_caps_renegotiate: AtomicU32::new(0),
            num_events_queued: AtomicU32::new(0),
            process_task_queued: AtomicU32::new(0),
            pending_pids: Mutex::new(VecDeque::new()),
            detached: Mutex::new(Vec::new()),
            swap_src: Mutex::new(None),
            swap_dst: Mutex::new(None),
            swap_needs_init: AtomicBool::new(false),
            cap_idx_at_resolution: AtomicI64::new(-1),
            pending_clock: Mutex::new(None),
            state: Mutex::new(None),
        })
    }

    pub fn name(&self) -> String {
        self.name.lock().unwrap().clone()
    }

    pub fn set_name(&self, name: &str) {
        *self.name.lock().unwrap() = name.to_string();
    }

    pub fn register(&self) -> &Arc<FilterRegister> {
        &self.register
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.upgrade()
    }

    pub fn set_id(&self, id: &str) {
        *self.id.lock().unwrap() = Some(id.to_string());
    }

    pub fn set_source_ids(&self, source_ids: &str) {
        *self.source_ids.lock().unwrap() = Some(source_ids.to_string());
    }

    pub fn set_args(&self, args: &str) {
        *self.args.lock().unwrap() = Some(args.to_string());
    }

    /// A sticky filter survives losing its last input.
    pub fn set_sticky(&self, sticky: bool) {
        self.sticky.store(sticky, Ordering::Relaxed);
    }

    /// A clonable filter may be duplicated when all instances are busy.
    pub fn set_clonable(&self, clonable: bool) {
        self.clonable.store(clonable, Ordering::Relaxed);
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    pub fn num_input_pids(&self) -> usize {
        self.num_inputs.load(Ordering::Acquire)
    }

    pub fn num_output_pids(&self) -> usize {
        self.num_outputs.load(Ordering::Acquire)
    }

    pub fn input_pids(&self) -> Vec<Arc<PidInst>> {
        self.inputs.lock().unwrap().clone()
    }

    pub fn output_pids(&self) -> Vec<Arc<Pid>> {
        self.outputs.lock().unwrap().clone()
    }

    /// Filter-private state storage.
    pub fn set_state<T: Any + Send>(&self, value: T) {
        *self.state.lock().unwrap() = Some(Box::new(value));
    }

    pub fn with_state<T: Any + Send, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut guard = self.state.lock().unwrap();
        guard.as_mut().and_then(|b| b.downcast_mut::<T>()).map(f)
    }

    pub(crate) fn dst_filter(&self) -> Option<Arc<Filter>> {
        self.dst_filter.lock().unwrap().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn target_filter(&self) -> Option<Arc<Filter>> {
        self.target_filter.lock().unwrap().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn cloned_from(&self) -> Option<Arc<Filter>> {
        self.cloned_from.lock().unwrap().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn is_blacklisted(&self, reg: &Arc<FilterRegister>) -> bool {
        self.blacklist
            .lock()
            .unwrap()
            .iter()
            .any(|r| FilterRegister::same(r, reg))
    }

    /// Creates a new output pid. The pid is parked on the pending queue
    /// and its init task fires once the current callback returns.
    pub fn new_output_pid(self: &Arc<Self>) -> Arc<Pid> {
        let pid = Pid::new(self);
        {
            let mut outputs = self.outputs.lock().unwrap();
            outputs.push(pid.clone());
            self.num_outputs.store(outputs.len(), Ordering::Release);
        }
        pid.set_default_name(self.num_outputs.load(Ordering::Acquire));
        self.pending_pids.lock().unwrap().push_back(pid.clone());

        // default property copy when the filter has a single input
        if self.num_input_pids() == 1 {
            if let Some(src) = self.inputs.lock().unwrap().first() {
                if let Some(src_pid) = src.pid() {
                    let _ = pid.copy_properties(&src_pid);
                }
            }
        }
        pid
    }

    /// Flushes pids created during a callback into init tasks.
    pub(crate) fn flush_pending_pids(self: &Arc<Self>) {
        let session = match self.session() {
            Some(s) => s,
            None => return,
        };
        loop {
            let pid = self.pending_pids.lock().unwrap().pop_front();
            match pid {
                Some(pid) => Pid::post_init_task(&session, self, &pid),
                None => break,
            }
        }
    }

    /// Requests a process task unless one is already queued.
    pub fn post_process_task(self: &Arc<Self>) {
        if self.finalized.load(Ordering::Acquire) {
            return;
        }
        if self.process_task_queued.fetch_add(1, Ordering::AcqRel) > 0 {
            return;
        }
        if let Some(session) = self.session() {
            session.post_task(Task::new(TaskKind::FilterProcess {
                filter: self.clone(),
            }));
        }
    }

    /// Informational property lookup walking outputs then inputs.
    pub fn get_info(&self, code: FourCC) -> Option<PropValue> {
        for pid in self.output_pids() {
            if let Some(v) = pid.get_info(code) {
                return Some(v);
            }
        }
        for inst in self.input_pids() {
            if let Some(pid) = inst.pid() {
                if let Some(v) = pid.get_info(code) {
                    return Some(v);
                }
            }
        }
        None
    }

    /// Clones a filter for `RequiresNewInstance` handling.
    pub(crate) fn clone_instance(
        session: &Arc<Session>,
        from: &Arc<Filter>,
    ) -> Result<Arc<Filter>> {
        if from.register.configure.is_none() {
            return Err(Error::OutOfMem);
        }
        let new_filter = Filter::new(session, from.register.clone());
        *new_filter.cloned_from.lock().unwrap() = Some(Arc::downgrade(from));
        *new_filter.source_ids.lock().unwrap() = from.source_ids.lock().unwrap().clone();
        *new_filter.args.lock().unwrap() = from.args.lock().unwrap().clone();
        new_filter
            .dynamic
            .store(from.dynamic.load(Ordering::Relaxed), Ordering::Relaxed);
        new_filter
            .clonable
            .store(from.clonable.load(Ordering::Relaxed), Ordering::Relaxed);
        *new_filter.dst_filter.lock().unwrap() = from.dst_filter.lock().unwrap().clone();
        session.add_filter(&new_filter);
        debug!("cloned filter {} for new pid instance", from.name());
        Ok(new_filter)
    }

}

impl std::fmt::Debug for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filter")
            .field("name", &self.name())
            .field("register", &self.register.name)
            .field("inputs", &self.num_input_pids())
            .field("outputs", &self.num_output_pids())
            .field("removed", &self.is_removed())
            .field("finalized", &self.is_finalized())
            .finish()
    }
}

/// Walks the input chain of `parent` looking for `filter`; used to reject
/// re-entrant connections.
pub(crate) fn filter_in_parent_chain(parent: &Arc<Filter>, filter: &Arc<Filter>) -> bool {
    if Arc::ptr_eq(parent, filter) {
        return true;
    }
    for inst in parent.input_pids() {
        if let Some(pid) = inst.pid() {
            if let Some(src) = pid.filter() {
                if filter_in_parent_chain(&src, filter) {
                    return true;
                }
            }
        }
    }
    false
}
