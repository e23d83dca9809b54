//! Connection lifecycle: init, connect, reconfigure, disconnect, detach,
//! swap, filter cloning and caps renegotiation.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::caps;
use crate::error::{Error, Result};
use crate::events::{self, Event};
use crate::filter::{filter_in_parent_chain, Filter};
use crate::flow;
use crate::graph::{self, bundle_start_idx, pid_match};
use crate::pid::{Pid, PidInst};
use crate::props::{
    prop_code_by_name, prop_type_of, PropValue, StreamType, PID_DEPENDENCY_ID, PID_ESID, PID_ID,
    PID_STREAM_TYPE,
};
use crate::registry::FilterRegister;
use crate::session::Session;
use crate::task::{Task, TaskKind, TaskResult};
use crate::util::fourcc_from_str;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectType {
    Connect,
    Reconfigure,
    Remove,
}

/// Unlinks an instance from both the consumer's input list and the pid's
/// destination list.
fn unlink_inst(filter: &Arc<Filter>, pid: &Arc<Pid>, inst: &Arc<PidInst>) {
    {
        let mut inputs = filter.inputs.lock().unwrap();
        inputs.retain(|i| !Arc::ptr_eq(i, inst));
        filter.num_inputs.store(inputs.len(), Ordering::Release);
    }
    {
        let mut dests = pid.destinations.lock().unwrap();
        dests.retain(|i| !Arc::ptr_eq(i, inst));
        pid.num_destinations.store(dests.len(), Ordering::Release);
    }
}

/// Registers an instance on both lists.
fn link_inst(filter: &Arc<Filter>, pid: &Arc<Pid>, inst: &Arc<PidInst>) {
    debug!(
        "registering {}::{} as destination for {}",
        pid.filter_name(),
        pid.name(),
        filter.name()
    );
    {
        let mut inputs = filter.inputs.lock().unwrap();
        inputs.push(inst.clone());
        filter.num_inputs.store(inputs.len(), Ordering::Release);
    }
    {
        let mut dests = pid.destinations.lock().unwrap();
        dests.push(inst.clone());
        pid.num_destinations.store(dests.len(), Ordering::Release);
    }
}

/// Runs the destination's `configure_pid` for a connect, reconfigure or
/// removal, handling every failure transition.
pub(crate) fn configure(
    session: &Arc<Session>,
    filter: &Arc<Filter>,
    pid: &Arc<Pid>,
    ctype: ConnectType,
) -> Result<()> {
    let cb = match filter.register().configure.as_ref() {
        Some(cb) => cb,
        None => return Err(Error::BadParam),
    };

    let mut new_pid_inst = false;
    // reattach a parked instance from a swap, if any
    let mut inst = {
        let mut detached = filter.detached.lock().unwrap();
        detached.pop().map(|i| {
            *i.filter.lock().unwrap() = Some(Arc::downgrade(filter));
            *i.pid.lock().unwrap() = Some(pid.clone());
            if ctype == ConnectType::Connect {
                new_pid_inst = true;
            }
            i.detach_pending.fetch_sub(1, Ordering::AcqRel);
            i
        })
    };
    if inst.is_none() {
        inst = pid
            .destinations()
            .into_iter()
            .find(|i| i.filter().map(|f| Arc::ptr_eq(&f, filter)).unwrap_or(false));
    }
    let inst = match inst {
        Some(i) => i,
        None => {
            if ctype != ConnectType::Connect {
                error!(
                    "pid {} not found in filter {} inputs",
                    pid.name(),
                    filter.name()
                );
                return Err(Error::ServiceError);
            }
            new_pid_inst = true;
            PidInst::new(filter, pid)
        }
    };

    if new_pid_inst {
        link_inst(filter, pid, &inst);
        flow::update_caps(pid);
    }

    // a pending instance swap must complete before reconfiguring, so the
    // new instance sees the transferred packets and properties
    let has_swap = filter.swap_src.lock().unwrap().is_some()
        || filter.swap_dst.lock().unwrap().is_some();
    if has_swap {
        swap_inst(session, filter, &inst);
    }

    let res = cb(filter, &inst, ctype == ConnectType::Remove);

    match res {
        Ok(()) => {
            if new_pid_inst {
                info!(
                    "connected filter {} pid {} ({} fan-out) to filter {}",
                    pid.filter_name(),
                    pid.name(),
                    pid.num_destinations(),
                    filter.name()
                );
            }
            session.clear_last_connect_error();
        }
        Err(e) if ctype == ConnectType::Reconfigure => {
            error!(
                "failed to reconfigure pid {} in filter {}: {}, reloading filter graph",
                pid.name(),
                filter.name(),
                e
            );
            retry_caps_negotiate(session, pid, filter);
            return Err(e);
        }
        Err(mut e) => {
            unlink_inst(filter, pid, &inst);
            *inst.filter.lock().unwrap() = None;

            if e == Error::RequiresNewInstance {
                match Filter::clone_instance(session, filter) {
                    Ok(new_filter) => {
                        debug!("cloned filter {} for pid {}", filter.name(), pid.name());
                        post_connect_task(session, &new_filter, pid);
                        return Ok(());
                    }
                    Err(_) => {
                        error!("failed to clone filter {}", filter.name());
                        e = Error::OutOfMem;
                    }
                }
            }
            if ctype == ConnectType::Remove {
                error!(
                    "failed to disconnect pid {} from filter {}: {}",
                    pid.name(),
                    filter.name(),
                    e
                );
            } else if filter.register().has_out_caps() {
                error!(
                    "failed to connect pid {} to filter {}: {}",
                    pid.name(),
                    filter.name(),
                    e
                );
                // blacklist this register on the source and retry the
                // whole resolution
                if let Some(src_filter) = pid.filter() {
                    src_filter
                        .blacklist
                        .lock()
                        .unwrap()
                        .push(filter.register().clone());
                }
                let mut unload_filter = true;
                let others: Vec<Arc<PidInst>> = filter.input_pids();
                for a_inst in others {
                    let _ = cb(filter, &a_inst, true);
                    if let Some(a_pid) = a_inst.pid() {
                        if let Some(a_src) = a_pid.filter() {
                            Pid::post_init_task(session, &a_src, &a_pid);
                        }
                        session.post_task(Task::new(TaskKind::PidInstDelete {
                            pid: a_pid,
                            inst: a_inst.clone(),
                        }));
                    }
                    unlink_inst(filter, a_inst.pid().as_ref().unwrap_or(pid), &a_inst);
                    unload_filter = false;
                }
                session.set_last_connect_error(e);
                if ctype == ConnectType::Connect {
                    if let Some(src_filter) = pid.filter() {
                        src_filter
                            .out_pid_connection_pending
                            .fetch_sub(1, Ordering::AcqRel);
                    }
                }
                if let Some(src_filter) = pid.filter() {
                    Pid::post_init_task(session, &src_filter, pid);
                }
                if unload_filter && !filter.finalized.swap(true, Ordering::AcqRel) {
                    session.post_task(Task::new(TaskKind::FilterRemove {
                        filter: filter.clone(),
                    }));
                }
                return Err(e);
            } else {
                error!(
                    "failed to configure input of sink {}, cannot rebuild graph",
                    filter.name()
                );
            }
        }
    }

    filter.flush_pending_pids();

    if ctype == ConnectType::Remove {
        unlink_inst(filter, pid, &inst);
        *inst.filter.lock().unwrap() = None;
        if filter.num_input_pids() == 0 && !filter.sticky.load(Ordering::Acquire) {
            filter.removed.store(true, Ordering::Release);
        }
        session.post_task(Task::new(TaskKind::PidInstDelete {
            pid: pid.clone(),
            inst,
        }));
        return res;
    }

    if ctype == ConnectType::Connect {
        if let Some(src_filter) = pid.filter() {
            if src_filter
                .out_pid_connection_pending
                .fetch_sub(1, Ordering::AcqRel)
                == 1
            {
                // packets postponed during setup flow through process()
                if src_filter.pending_packets.load(Ordering::Acquire) > 0
                    || src_filter.nb_caps_renegotiate.load(Ordering::Acquire) > 0
                {
                    src_filter.post_process_task();
                }
            }
        }
        // adaptation connected, negotiation round is over
        if filter.is_adaptation.load(Ordering::Acquire) {
            let had_neg = pid.caps_negotiate.lock().unwrap().take().is_some();
            if had_neg {
                *pid.caps_neg_dst.lock().unwrap() = None;
            }
        }
    }
    flow::update_caps(pid);
    res
}

pub(crate) fn post_connect_task(session: &Arc<Session>, filter: &Arc<Filter>, pid: &Arc<Pid>) {
    filter.in_pid_connection_pending.fetch_add(1, Ordering::AcqRel);
    session.pid_connect_tasks_pending.fetch_add(1, Ordering::AcqRel);
    session.post_task(Task::new(TaskKind::PidConnect {
        filter: filter.clone(),
        pid: pid.clone(),
    }));
}

/// Task body: connect a pid to a destination filter, cloning it first if
/// it cannot take more inputs.
pub(crate) fn connect_task(
    session: &Arc<Session>,
    task_filter: &Arc<Filter>,
    pid: &Arc<Pid>,
) -> TaskResult {
    info!(
        "pid {} from {} connecting to {}",
        pid.name(),
        pid.filter_name(),
        task_filter.name()
    );
    let mut filter = task_filter.clone();
    let num_inputs = filter.num_input_pids();
    if num_inputs > 0 && (filter.register().max_extra_pids as usize) <= num_inputs - 1 {
        match Filter::clone_instance(session, &filter) {
            Ok(f) => filter = f,
            Err(_) => {
                error!("failed to clone filter {}", filter.name());
                task_filter
                    .in_pid_connection_pending
                    .fetch_sub(1, Ordering::AcqRel);
                session
                    .pid_connect_tasks_pending
                    .fetch_sub(1, Ordering::AcqRel);
                return TaskResult::Done;
            }
        }
    }
    let _ = configure(session, &filter, pid, ConnectType::Connect);
    // any property change from now on must allocate a new map and
    // trigger a reconfigure
    pid.request_property_map.store(true, Ordering::Release);
    pid.pid_info_changed.store(false, Ordering::Release);

    task_filter
        .in_pid_connection_pending
        .fetch_sub(1, Ordering::AcqRel);
    session
        .pid_connect_tasks_pending
        .fetch_sub(1, Ordering::AcqRel);
    TaskResult::Done
}

pub(crate) fn reconfigure_task(
    session: &Arc<Session>,
    filter: &Arc<Filter>,
    pid: &Arc<Pid>,
) -> TaskResult {
    info!(
        "pid {} from {} reconfigure on {}",
        pid.name(),
        pid.filter_name(),
        filter.name()
    );
    let _ = configure(session, filter, pid, ConnectType::Reconfigure);
    TaskResult::Done
}

pub(crate) fn disconnect_task(
    session: &Arc<Session>,
    filter: &Arc<Filter>,
    pid: &Arc<Pid>,
) -> TaskResult {
    info!(
        "pid {} from {} disconnect from {}",
        pid.name(),
        pid.filter_name(),
        filter.name()
    );
    let _ = configure(session, filter, pid, ConnectType::Remove);

    if filter.is_removed() && filter.num_input_pids() == 0 && filter.num_output_pids() == 0 {
        if !filter.finalized.swap(true, Ordering::AcqRel) {
            session.post_task(Task::new(TaskKind::FilterRemove {
                filter: filter.clone(),
            }));
        }
    }
    TaskResult::Done
}

/// Task body: unlink an instance but park it for later reattachment.
pub(crate) fn detach_task(
    session: &Arc<Session>,
    filter: &Arc<Filter>,
    pid: &Arc<Pid>,
    new_chain_input: &Arc<Filter>,
) -> TaskResult {
    let _ = session;
    // concurrent resets (play/stop/seek) must settle before detaching
    if let Some(src) = pid.filter() {
        if src.stream_reset_pending.load(Ordering::Acquire) > 0 {
            return TaskResult::Requeue;
        }
    }
    if new_chain_input.in_pid_connection_pending.load(Ordering::Acquire) > 0 {
        return TaskResult::Requeue;
    }
    info!(
        "pid {} from {} detach from {}",
        pid.name(),
        pid.filter_name(),
        filter.name()
    );

    let inst = pid
        .destinations()
        .into_iter()
        .find(|i| i.filter().map(|f| Arc::ptr_eq(&f, filter)).unwrap_or(false));
    let inst = match inst {
        Some(i) => i,
        None => {
            error!(
                "pid {} to detach not found in filter {} inputs",
                pid.name(),
                filter.name()
            );
            new_chain_input.swap_needs_init.store(false, Ordering::Release);
            *new_chain_input.swap_src.lock().unwrap() = None;
            *new_chain_input.swap_dst.lock().unwrap() = None;
            return TaskResult::Done;
        }
    };

    *inst.props.lock().unwrap() = None;
    flow::reset_inst(&inst);
    unlink_inst(filter, pid, &inst);
    *inst.pid.lock().unwrap() = None;
    filter.detached.lock().unwrap().push(inst);

    if new_chain_input.swap_needs_init.load(Ordering::Acquire) {
        *new_chain_input.swap_src.lock().unwrap() = None;
        *new_chain_input.swap_dst.lock().unwrap() = None;
        new_chain_input.swap_needs_init.store(false, Ordering::Release);
    }
    TaskResult::Done
}

/// Transfers queue, framing state, EOS and property snapshot from the
/// instance being replaced to `dst`, preserving packet order.
pub(crate) fn swap_inst(session: &Arc<Session>, filter: &Arc<Filter>, dst: &Arc<PidInst>) {
    let swap_src_saved = filter.swap_src.lock().unwrap().clone();
    let src = swap_src_saved
        .clone()
        .or_else(|| filter.swap_dst.lock().unwrap().clone());
    let src = match src {
        Some(s) => s,
        None => return,
    };
    if Arc::ptr_eq(&src, dst) {
        // nothing to transfer, clear the swap state
        *filter.swap_src.lock().unwrap() = None;
        *filter.swap_dst.lock().unwrap() = None;
        return;
    }
    debug!(
        "filter {} swapping pid instance {} packets",
        filter.name(),
        src.pid_name()
    );

    let swap_needs_init = filter.swap_needs_init.load(Ordering::Acquire);
    if !swap_needs_init {
        // same-pid swap: replace the instance in the destination list
        if let Some(pid) = dst.pid() {
            let mut dests = pid.destinations.lock().unwrap();
            dests.retain(|i| !Arc::ptr_eq(i, &src));
            if !dests.iter().any(|i| Arc::ptr_eq(i, dst)) {
                dests.push(dst.clone());
            }
            pid.num_destinations.store(dests.len(), Ordering::Release);
        }
        if let Some(f) = dst.filter() {
            let mut inputs = f.inputs.lock().unwrap();
            if !inputs.iter().any(|i| Arc::ptr_eq(i, dst)) {
                inputs.push(dst.clone());
            }
            f.num_inputs.store(inputs.len(), Ordering::Release);
        }
    }

    // transfer queued packets in order
    let mut nb_transfer = 0usize;
    {
        let mut src_q = src.packets.lock().unwrap();
        let mut dst_q = dst.packets.lock().unwrap();
        while let Some(pi) = src_q.pop_front() {
            dst_q.push_back(pi);
            nb_transfer += 1;
        }
    }
    if nb_transfer > 0 {
        if let Some(sf) = src.filter() {
            for _ in 0..nb_transfer {
                sf.pending_packets.fetch_sub(1, Ordering::AcqRel);
            }
        }
        if let Some(df) = dst.filter() {
            for _ in 0..nb_transfer {
                df.pending_packets.fetch_add(1, Ordering::AcqRel);
            }
        }
    }
    if src.requires_full_data_block.load(Ordering::Acquire) {
        let mut src_r = src.reassembly.lock().unwrap();
        if !src_r.is_empty() {
            dst.requires_full_data_block.store(true, Ordering::Release);
            dst.last_block_ended
                .store(src.last_block_ended.load(Ordering::Acquire), Ordering::Release);
            dst.first_block_started
                .store(src.first_block_started.load(Ordering::Acquire), Ordering::Release);
            dst.reassembly.lock().unwrap().append(&mut src_r);
        }
    }
    dst.is_end_of_stream
        .store(src.is_end_of_stream.load(Ordering::Acquire), Ordering::Release);
    dst.nb_eos_signaled
        .store(src.nb_eos_signaled.swap(0, Ordering::AcqRel), Ordering::Release);
    dst.buffer_duration_us
        .store(src.buffer_duration_us.swap(0, Ordering::AcqRel), Ordering::Release);

    // keep the previous map as active so already dispatched packets keep
    // their snapshot; the dst props seen so far are merged on top
    let src_props = src.props.lock().unwrap().take();
    if let Some(sp) = src_props {
        let prev = dst.props.lock().unwrap().replace(sp.clone());
        if let Some(prev) = prev {
            sp.merge_from(&prev);
        }
    }

    if nb_transfer > 0 {
        if let Some(df) = dst.filter() {
            df.post_process_task();
        }
    }

    let parked = filter.swap_dst.lock().unwrap().clone();
    if let Some(parked) = parked {
        if swap_needs_init {
            if let Some(pf) = parked.pid().and_then(|p| p.filter()) {
                pf.stream_reset_pending.fetch_sub(1, Ordering::AcqRel);
            }
            if let (Some(pfilter), Some(ppid)) = (parked.filter(), parked.pid()) {
                session.post_task(Task::new(TaskKind::PidDetach {
                    filter: pfilter,
                    pid: ppid,
                    new_chain_input: filter.clone(),
                }));
            }
        } else {
            // direct replacement: the old instance's source filter is no
            // longer used
            let src_filter = parked.filter();
            if let (Some(sf), Some(spid)) = (src_filter, parked.pid()) {
                unlink_inst(&sf, &spid, &parked);
            }
            *filter.swap_src.lock().unwrap() = None;
            *filter.swap_dst.lock().unwrap() = None;
            if let Some(sf) = parked.pid().and_then(|p| p.filter()) {
                if !sf.sticky.load(Ordering::Acquire)
                    && !sf.finalized.swap(true, Ordering::AcqRel)
                {
                    session.post_task(Task::new(TaskKind::FilterRemove { filter: sf }));
                }
            }
        }
    }

    // a replaced upstream chain is torn down once its packets drained
    let remaining_src = filter.swap_src.lock().unwrap().take();
    if let Some(s) = remaining_src {
        if !Arc::ptr_eq(&s, dst) {
            let parked_dst = filter.swap_dst.lock().unwrap().clone();
            if let Some(sf) = s.filter() {
                if !Arc::ptr_eq(&sf, filter) {
                    *sf.swap_dst.lock().unwrap() = parked_dst;
                }
            }
            session.post_task(Task::new(TaskKind::PidInstSwapDelete { inst: s }));
        }
    }
}

/// Task body: drop an instance once no packet of its pid is in flight.
pub(crate) fn inst_delete_task(
    session: &Arc<Session>,
    pid: &Arc<Pid>,
    inst: &Arc<PidInst>,
) -> TaskResult {
    // reset in process on the consumer side
    if inst.discard_packets.load(Ordering::Acquire) {
        return TaskResult::Requeue;
    }
    if let Some(src) = pid.filter() {
        if src.stream_reset_pending.load(Ordering::Acquire) > 0 {
            return TaskResult::Requeue;
        }
    }
    flow::reset_inst(inst);
    // shared packets still referenced downstream
    if pid.nb_pck_instances_out.load(Ordering::Acquire) > 0 {
        return TaskResult::Requeue;
    }

    let filter = match pid.filter() {
        Some(f) => f,
        None => return TaskResult::Done,
    };
    info!("pid instance {} destruction", pid.name());
    {
        let mut dests = pid.destinations.lock().unwrap();
        dests.retain(|i| !Arc::ptr_eq(i, inst));
        pid.num_destinations.store(dests.len(), Ordering::Release);
    }
    if inst.is_decoder_input.load(Ordering::Acquire) {
        pid.nb_decoder_inputs.fetch_sub(1, Ordering::AcqRel);
    }
    flow::recompute_buffer_totals(pid);
    if pid.would_block.load(Ordering::Acquire) {
        flow::check_unblock(pid);
    } else {
        flow::pid_would_block(pid);
    }

    // other filters still feed this one, keep the pid alive
    if filter.num_input_pids() > 0 {
        return TaskResult::Done;
    }
    if pid.num_destinations() == 0 {
        let mut outputs = filter.outputs.lock().unwrap();
        outputs.retain(|p| !Arc::ptr_eq(p, pid));
        filter.num_outputs.store(outputs.len(), Ordering::Release);
        pid.destroyed.store(true, Ordering::Release);
    }
    if filter.num_output_pids() == 0 && filter.num_input_pids() == 0 {
        if !filter.finalized.swap(true, Ordering::AcqRel) {
            session.post_task(Task::new(TaskKind::FilterRemove { filter }));
        }
    }
    TaskResult::Done
}

/// Task body: teardown of a replaced chain after a swap completed.
pub(crate) fn inst_swap_delete_task(session: &Arc<Session>, inst: &Arc<PidInst>) -> TaskResult {
    if inst.discard_packets.load(Ordering::Acquire) {
        return TaskResult::Requeue;
    }
    let filter = match inst.filter() {
        Some(f) => f,
        None => return TaskResult::Done,
    };
    if filter.stream_reset_pending.load(Ordering::Acquire) > 0 {
        return TaskResult::Requeue;
    }
    let dst_swapinst = filter.swap_dst.lock().unwrap().take();
    swap_delete(session, &filter, inst, dst_swapinst.as_ref());
    TaskResult::Done
}

fn swap_delete(
    session: &Arc<Session>,
    filter: &Arc<Filter>,
    inst: &Arc<PidInst>,
    dst_swapinst: Option<&Arc<PidInst>>,
) {
    flow::reset_inst(inst);
    info!("pid instance {} swap destruction", inst.pid_name());
    if let Some(pid) = inst.pid() {
        unlink_inst(filter, &pid, inst);
        if inst.is_decoder_input.load(Ordering::Acquire) {
            pid.nb_decoder_inputs.fetch_sub(1, Ordering::AcqRel);
        }
    }
    if filter.num_input_pids() > 0 {
        return;
    }
    // filter no longer used, disconnect the chain downstream
    for pid in filter.output_pids() {
        for a_inst in pid.destinations() {
            if let Some(d) = dst_swapinst {
                if Arc::ptr_eq(&a_inst, d) {
                    continue;
                }
            }
            if let Some(af) = a_inst.filter() {
                swap_delete(session, &af, &a_inst, dst_swapinst);
            }
        }
    }
    if !filter.finalized.swap(true, Ordering::AcqRel) {
        session.post_task(Task::new(TaskKind::FilterRemove {
            filter: filter.clone(),
        }));
    }
}

/// Arms caps renegotiation after a reconfigure failure: publish the
/// desired map on the source pid, blacklist the failing adaptor and tear
/// the link down; the source filter reruns resolution on its next cycle.
pub(crate) fn retry_caps_negotiate(
    session: &Arc<Session>,
    pid: &Arc<Pid>,
    dst_filter: &Arc<Filter>,
) {
    {
        let mut neg = pid.caps_negotiate.lock().unwrap();
        if neg.is_none() {
            *neg = Some(pid.latest_props());
        }
    }
    *pid.caps_neg_dst.lock().unwrap() = Some(Arc::downgrade(dst_filter));
    pid.adapters_blacklist
        .lock()
        .unwrap()
        .push(dst_filter.register().clone());
    if let Some(src) = pid.filter() {
        src.nb_caps_renegotiate.fetch_add(1, Ordering::AcqRel);
    }
    session.post_task(Task::new(TaskKind::PidDisconnect {
        filter: dst_filter.clone(),
        pid: pid.clone(),
    }));
}

/// Handles pending output caps renegotiation before a process cycle:
/// either the filter reconfigures its output in place, or an adaptation
/// chain is inserted and the consumer instance swapped onto it.
pub(crate) fn renegotiate_outputs(session: &Arc<Session>, filter: &Arc<Filter>) {
    if filter.nb_caps_renegotiate.load(Ordering::Acquire) == 0 {
        return;
    }
    for pid in filter.output_pids() {
        let has_neg = pid.caps_negotiate.lock().unwrap().is_some();
        if !has_neg {
            continue;
        }
        filter.nb_caps_renegotiate.fetch_sub(1, Ordering::AcqRel);

        if let Some(rcb) = filter.register().reconfigure_output.as_ref() {
            if rcb(filter, &pid).is_ok() {
                info!(
                    "filter {} reconfigured output pid {} in place",
                    filter.name(),
                    pid.name()
                );
                *pid.caps_negotiate.lock().unwrap() = None;
                *pid.caps_neg_dst.lock().unwrap() = None;
                continue;
            }
        }

        let dst = pid
            .caps_neg_dst
            .lock()
            .unwrap()
            .as_ref()
            .and_then(std::sync::Weak::upgrade);
        let dst = match dst {
            Some(d) => d,
            None => {
                *pid.caps_negotiate.lock().unwrap() = None;
                continue;
            }
        };
        let chain = graph::resolve_link(session, &pid, &dst, "", true);
        if chain.is_empty() {
            error!(
                "no adaptation filter for reconfiguring pid {} from {}",
                pid.name(),
                filter.name()
            );
            *pid.caps_negotiate.lock().unwrap() = None;
            *pid.caps_neg_dst.lock().unwrap() = None;
            session.post_task(Task::new(TaskKind::PidDisconnect {
                filter: dst,
                pid: pid.clone(),
            }));
            continue;
        }
        if chain.len() > 1 {
            warn!(
                "adaptation chains longer than one filter are not supported for pid {}",
                pid.name()
            );
        }
        let adapt = instantiate_chain(session, &pid, &dst, &chain[..1], true);
        if let Some(adapt) = adapt {
            // the consumer's instance is handed over to the adaptation
            // filter: transfer packets, then detach it from this pid
            let old_inst = pid
                .destinations()
                .into_iter()
                .find(|i| i.filter().map(|f| Arc::ptr_eq(&f, &dst)).unwrap_or(false));
            if let Some(old_inst) = old_inst {
                *adapt.swap_dst.lock().unwrap() = Some(old_inst.clone());
                adapt.swap_needs_init.store(true, Ordering::Release);
                old_inst.detach_pending.fetch_add(1, Ordering::AcqRel);
                if let Some(src) = old_inst.pid().and_then(|p| p.filter()) {
                    src.stream_reset_pending.fetch_add(1, Ordering::AcqRel);
                }
            }
            if let Some(src) = pid.filter() {
                src.out_pid_connection_pending.fetch_add(1, Ordering::AcqRel);
            }
            post_connect_task(session, &adapt, &pid);
        }
    }
}

/// Loads the filters of a resolved chain, wiring destination hints and
/// inherited source ids. Returns the chain input filter.
fn instantiate_chain(
    session: &Arc<Session>,
    pid: &Arc<Pid>,
    dst: &Arc<Filter>,
    chain: &[graph::ResolvedLink],
    adaptation: bool,
) -> Option<Arc<Filter>> {
    let mut chain_input = None;
    let mut prev: Option<Arc<Filter>> = None;
    info!(
        "solved {}filter chain from {} pid {} to {}: {}",
        if adaptation { "adaptation " } else { "" },
        pid.filter_name(),
        pid.name(),
        dst.name(),
        chain
            .iter()
            .map(|l| l.register.name.as_str())
            .collect::<Vec<_>>()
            .join(" -> ")
    );
    for (i, step) in chain.iter().enumerate() {
        // a first filter with undecided outputs (demuxer) truncates the
        // chain: resolution continues when its pids appear
        let load_first_only =
            i == 0 && caps::out_caps_solved_by_connection(&step.register.caps, step.cap_bundle_idx);

        let af = Filter::new(session, step.register.clone());
        session.add_filter(&af);
        af.dynamic.store(true, Ordering::Release);
        if adaptation {
            af.is_adaptation.store(true, Ordering::Release);
        }
        af.cap_idx_at_resolution.store(
            bundle_start_idx(&step.register.caps, step.cap_bundle_idx) as i64,
            Ordering::Release,
        );
        if let Some(sid) = dst.source_ids.lock().unwrap().clone() {
            *af.source_ids.lock().unwrap() = Some(sid);
        }
        if let Some(p) = prev.as_ref() {
            *p.dst_filter.lock().unwrap() = Some(Arc::downgrade(&af));
        }
        if i + 1 == chain.len() {
            *af.dst_filter.lock().unwrap() = Some(Arc::downgrade(dst));
        }
        if let Some(t) = pid.filter().and_then(|f| f.target_filter()) {
            *af.target_filter.lock().unwrap() = Some(Arc::downgrade(&t));
        }
        if chain_input.is_none() {
            chain_input = Some(af.clone());
        }
        prev = Some(af);
        if load_first_only {
            debug!(
                "filter {} must run before deciding its outputs, truncating chain",
                step.register.name
            );
            break;
        }
    }
    chain_input
}

/// Swaps a source filter's register when resolution failed, probing
/// another source implementation for the same origin.
fn swap_source_register(session: &Arc<Session>, filter: &Arc<Filter>) -> bool {
    let current = filter.register().clone();
    filter.blacklist.lock().unwrap().push(current.clone());
    let candidate = session.registries().into_iter().find(|r| {
        r.configure.is_none()
            && r.process.is_some()
            && !FilterRegister::same(r, &current)
            && !r.flags.contains(crate::registry::RegFlags::EXPLICIT_ONLY)
            && !filter.is_blacklisted(r)
    });
    match candidate {
        Some(reg) => {
            info!("swapping source filter {} to register {}", filter.name(), reg.name);
            let new_filter = Filter::new(session, reg);
            *new_filter.args.lock().unwrap() = filter.args.lock().unwrap().clone();
            *new_filter.id.lock().unwrap() = filter.id.lock().unwrap().clone();
            session.add_filter(&new_filter);
            new_filter.post_process_task();
            // old filter's pids are torn down with it
            for pid in filter.output_pids() {
                pid.destroyed.store(true, Ordering::Release);
            }
            filter.outputs.lock().unwrap().clear();
            filter.num_outputs.store(0, Ordering::Release);
            if !filter.finalized.swap(true, Ordering::AcqRel) {
                session.post_task(Task::new(TaskKind::FilterRemove {
                    filter: filter.clone(),
                }));
            }
            true
        }
        None => false,
    }
}

/// Transmodality (audio to video, ...) requires an explicit filter; only
/// file streams freely cross types.
fn needs_explicit_resolution(pid: &Arc<Pid>, dst: &Arc<Filter>) -> bool {
    let stype = match pid.get_property(PID_STREAM_TYPE).and_then(|v| v.stream_type()) {
        Some(t) => t,
        None => return true,
    };
    if stype == StreamType::File {
        return false;
    }
    for cap in &dst.register().caps {
        if !cap.flags.contains(crate::caps::CapFlags::INPUT) {
            continue;
        }
        if cap.key != crate::props::PropKey::Code(PID_STREAM_TYPE) {
            continue;
        }
        match cap.value.stream_type() {
            Some(t) if t == StreamType::File || t == stype => return false,
            _ => {}
        }
    }
    true
}

/// Reroutes dependent streams (scalable layers) to the decoder already
/// consuming their base stream.
pub(crate) fn check_dependencies(inst: &Arc<PidInst>) {
    let pid = match inst.pid() {
        Some(p) => p,
        None => return,
    };
    let dep_id = match pid.get_property(PID_DEPENDENCY_ID).and_then(|v| v.as_uint()) {
        Some(id) if id != 0 => id,
        _ => return,
    };
    let filter = match pid.filter() {
        Some(f) => f,
        None => return,
    };
    let session = match filter.session() {
        Some(s) => s,
        None => return,
    };
    let inst_filter = match inst.filter() {
        Some(f) => f,
        None => return,
    };

    for a_pid in filter.output_pids() {
        if Arc::ptr_eq(&a_pid, &pid) {
            continue;
        }
        let id = a_pid
            .get_property(PID_ID)
            .or_else(|| a_pid.get_property(PID_ESID))
            .and_then(|v| v.as_uint());
        if id != Some(dep_id) {
            continue;
        }
        for a_inst in a_pid.destinations() {
            if Arc::ptr_eq(&a_inst, inst) {
                continue;
            }
            if !a_inst.is_decoder_input.load(Ordering::Acquire) {
                continue;
            }
            let a_filter = match a_inst.filter() {
                Some(f) => f,
                None => continue,
            };
            if Arc::ptr_eq(&a_filter, &inst_filter) {
                continue;
            }
            warn!(
                "pid {} connected to decoder {} but dependent stream {} goes to {}, rerouting",
                a_pid.name(),
                a_filter.name(),
                pid.name(),
                inst_filter.name()
            );
            session.post_task(Task::new(TaskKind::PidDisconnect {
                filter: a_filter,
                pid: a_pid.clone(),
            }));
            filter.out_pid_connection_pending.fetch_add(1, Ordering::AcqRel);
            post_connect_task(&session, &inst_filter, &a_pid);
        }
    }
}

/// Parses `#Prop=value` fragments of the filter argument string into pid
/// properties, honoring quoting and separator protection.
pub(crate) fn set_pid_args(filter: &Arc<Filter>, pid: &Arc<Pid>) {
    let args = match filter.args.lock().unwrap().clone() {
        Some(a) => a,
        None => return,
    };
    let session = match filter.session() {
        Some(s) => s,
        None => return,
    };
    let cfg = session.config();
    for part in split_protected(&args, cfg.sep_args) {
        let part = match part.strip_prefix(cfg.sep_frag) {
            Some(p) => p,
            None => continue,
        };
        let (name, value) = match part.split_once(cfg.sep_name) {
            Some(kv) => kv,
            None => continue,
        };
        let code = if name.len() == 4 {
            fourcc_from_str(name).filter(|c| prop_type_of(*c).is_some())
        } else {
            None
        }
        .or_else(|| prop_code_by_name(name));

        match code.and_then(|c| prop_type_of(c).map(|t| (c, t))) {
            Some((code, ptype)) => {
                if let Some(v) = PropValue::parse(ptype, value, cfg.sep_list) {
                    let _ = pid.set_property(code, v);
                }
            }
            None => {
                let _ = pid.set_property_str(name, PropValue::String(value.to_string()));
            }
        }
    }
}

/// Splits on `sep` while protecting quoted segments, `<...>` blocks and
/// `://` URLs.
fn split_protected(input: &str, sep: char) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut in_quote = false;
    let mut angle_depth = 0usize;
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' | '"' => {
                in_quote = !in_quote;
                cur.push(c);
            }
            '<' => {
                angle_depth += 1;
                cur.push(c);
            }
            '>' => {
                angle_depth = angle_depth.saturating_sub(1);
                cur.push(c);
            }
            _ if c == sep && !in_quote && angle_depth == 0 => {
                // keep "://" intact when ':' separates args
                if sep == ':' && chars.get(i + 1) == Some(&'/') && chars.get(i + 2) == Some(&'/') {
                    cur.push(c);
                } else {
                    out.push(std::mem::take(&mut cur));
                }
            }
            _ => cur.push(c),
        }
        i += 1;
    }
    if !cur.is_empty() {
        out.push(cur);
    }
    out
}

/// Collects `gfreg=` directives naming preferred registries.
fn preferred_registries(session: &Arc<Session>, pid: &Arc<Pid>, dst: &Arc<Filter>) -> String {
    let cfg = session.config();
    let mut pref = String::new();
    let mut sources = Vec::new();
    if let Some(f) = pid.filter() {
        if let Some(a) = f.args.lock().unwrap().clone() {
            sources.push(a);
        }
    }
    if let Some(a) = dst.args.lock().unwrap().clone() {
        sources.push(a);
    }
    for args in sources {
        for part in split_protected(&args, cfg.sep_args) {
            let part = part.strip_prefix(cfg.sep_frag).unwrap_or(&part);
            if let Some((k, v)) = part.split_once(cfg.sep_name) {
                if k == "gfreg" {
                    if !pref.is_empty() {
                        pref.push(cfg.sep_args);
                    }
                    pref.push_str(v);
                }
            }
        }
    }
    pref
}

/// Explicit identifier carried through a dynamically inserted chain.
fn last_id_in_chain(filter: &Arc<Filter>) -> Option<String> {
    if let Some(id) = filter.id.lock().unwrap().clone() {
        return Some(id);
    }
    if !filter.dynamic.load(Ordering::Acquire) {
        return None;
    }
    for inst in filter.input_pids() {
        if let Some(src) = inst.pid().and_then(|p| p.filter()) {
            if let Some(id) = src.id.lock().unwrap().clone() {
                return Some(id);
            }
            if !src.dynamic.load(Ordering::Acquire) {
                continue;
            }
            if let Some(id) = last_id_in_chain(&src) {
                return Some(id);
            }
        }
    }
    None
}

/// Matches one fragment of a source-id directive against the pid.
fn check_fragment(pid: &Arc<Pid>, frag: &str, neg_sep: char, pid_excluded: &mut bool) -> bool {
    let (frag, is_neg) = match frag.strip_prefix(neg_sep) {
        Some(f) => (f, true),
        None => (frag, false),
    };
    let matched = if let Some(st) = StreamType::from_name(frag) {
        pid.get_property(PID_STREAM_TYPE).and_then(|v| v.stream_type()) == Some(st)
    } else if let Some((name, value)) = frag.split_once('=') {
        let code = if name.len() == 4 {
            fourcc_from_str(name)
        } else {
            prop_code_by_name(name)
        };
        let prop = match code {
            Some(c) => pid.get_property(c),
            None => pid.get_property_str(name),
        };
        match prop {
            Some(p) => p.dump() == value,
            None => false,
        }
    } else {
        pid.name() == frag
    };
    let matched = if is_neg { !matched } else { matched };
    if !matched {
        *pid_excluded = true;
    }
    matched
}

/// Matches a pid against a destination's `source_ids` directive list.
/// Returns (matched, pid_excluded).
pub(crate) fn source_id_match(
    pid: &Arc<Pid>,
    id: &str,
    source_ids: &str,
    sep_list: char,
    sep_frag: char,
    neg_sep: char,
) -> (bool, bool) {
    let mut pid_excluded = false;
    for entry in source_ids.split(sep_list) {
        let (ident, frags) = match entry.split_once(sep_frag) {
            Some((i, f)) => (i, Some(f)),
            None => (entry, None),
        };
        if ident != "*" && ident != id {
            continue;
        }
        let frags = match frags {
            Some(f) => f,
            None => return (true, false),
        };
        // a fragment naming the pid always wins
        if pid.name() == frags {
            return (true, false);
        }
        let mut all_matched = true;
        for frag in frags.split(sep_frag) {
            if !check_fragment(pid, frag, neg_sep, &mut pid_excluded) {
                all_matched = false;
                break;
            }
        }
        return (all_matched, pid_excluded);
    }
    (false, pid_excluded)
}

/// Task body: find destinations for a freshly created or re-initialized
/// pid, directly or through chain resolution.
pub(crate) fn init_task(session: &Arc<Session>, pid: &Arc<Pid>) -> TaskResult {
    let filter = match pid.filter() {
        Some(f) => f,
        None => {
            pid.init_task_pending.fetch_sub(1, Ordering::AcqRel);
            return TaskResult::Done;
        }
    };
    if pid.destroyed.load(Ordering::Acquire) {
        pid.init_task_pending.fetch_sub(1, Ordering::AcqRel);
        return TaskResult::Done;
    }
    pid.props_changed_since_connect.store(false, Ordering::Release);

    // a swap is pending on the possible destination, retry later
    if filter.swap_src.lock().unwrap().is_some() || filter.swap_dst.lock().unwrap().is_some() {
        return TaskResult::Requeue;
    }

    set_pid_args(&filter, pid);

    let filter_id = last_id_in_chain(&filter)
        .or_else(|| filter.cloned_from().and_then(|c| last_id_in_chain(&c)));

    let cfg = session.config();
    let mut first_pass = true;
    let mut filter_found_but_pid_excluded = false;

    loop {
        let mut found_dest = false;
        let mut can_try_resolution = false;
        let mut loaded_filters: Vec<Arc<Filter>> = Vec::new();

        for filter_dst in session.filters() {
            if filter_dst.register().configure.is_none() {
                continue;
            }
            if filter_dst.is_finalized() || filter_dst.is_removed() {
                continue;
            }
            // destination accepts a single input and is already taken
            if filter_dst.register().max_extra_pids == 0
                && (filter_dst.num_input_pids() > 0
                    || filter_dst.in_pid_connection_pending.load(Ordering::Acquire) > 0)
            {
                if !filter_dst.clonable.load(Ordering::Acquire) {
                    continue;
                }
                if pid_match(pid, filter_dst.register(), false, None).is_none() {
                    continue;
                }
            }
            if filter.is_blacklisted(filter_dst.register()) {
                continue;
            }
            // no re-entrant registers
            if FilterRegister::same(filter.register(), filter_dst.register()) {
                continue;
            }
            // filters loaded for another chain only take their own link
            let hint = filter.dst_filter();
            if filter_dst.dynamic.load(Ordering::Acquire)
                && hint.as_ref().map(|h| !Arc::ptr_eq(h, &filter_dst)).unwrap_or(true)
            {
                if hint.is_some() {
                    continue;
                }
                if filter_dst.register().max_extra_pids == 0 {
                    continue;
                }
            }
            if hint.is_none() {
                if let Some(target) = filter.target_filter() {
                    if !Arc::ptr_eq(&filter_dst, &target) {
                        let dst_target = filter_dst.target_filter();
                        if dst_target.map(|t| !Arc::ptr_eq(&t, &target)).unwrap_or(true) {
                            continue;
                        }
                    }
                }
            }
            if filter_dst.source_ids.lock().unwrap().is_none()
                && filter.dynamic.load(Ordering::Acquire)
                && hint.is_some()
                && hint.as_ref().map(|h| !Arc::ptr_eq(h, &filter_dst)).unwrap_or(false)
            {
                continue;
            }
            // re-entrant pid: destination already in our parent chain
            if filter_in_parent_chain(&filter, &filter_dst) {
                continue;
            }
            if let Some(cf) = filter_dst.cloned_from() {
                if filter_in_parent_chain(&filter, &cf) {
                    continue;
                }
            }
            if let Some(cf) = filter.cloned_from() {
                if filter_in_parent_chain(&cf, &filter_dst) {
                    continue;
                }
            }

            let source_ids = filter_dst.source_ids.lock().unwrap().clone();
            if let Some(fid) = filter_id.as_deref() {
                if let Some(sids) = source_ids.as_deref() {
                    let (matched, excluded) = source_id_match(
                        pid,
                        fid,
                        sids,
                        cfg.sep_list,
                        cfg.sep_frag,
                        cfg.sep_neg,
                    );
                    if !matched {
                        if excluded && first_pass {
                            filter_found_but_pid_excluded = true;
                        }
                        continue;
                    }
                }
            } else if let Some(sids) = source_ids.as_deref() {
                if !sids.starts_with('*') {
                    continue;
                }
                let (matched, excluded) =
                    source_id_match(pid, "*", sids, cfg.sep_list, cfg.sep_frag, cfg.sep_neg);
                if !matched {
                    if excluded && first_pass {
                        filter_found_but_pid_excluded = true;
                    }
                    continue;
                }
            }

            can_try_resolution = true;

            let mut cap_matched = pid_match(pid, filter_dst.register(), true, None).is_some();
            if !cap_matched && filter_dst.clonable.load(Ordering::Acquire) {
                cap_matched = pid_match(pid, filter_dst.register(), false, None).is_some();
            }

            let mut connect_to = filter_dst.clone();
            if !cap_matched {
                // transmodality only through explicit filters
                if needs_explicit_resolution(pid, &filter_dst) {
                    continue;
                }
                // wrong resolved chain: drop the hint and the unused
                // dynamic destination
                if let Some(h) = filter.dst_filter() {
                    if Arc::ptr_eq(&h, &filter_dst) {
                        *filter.dst_filter.lock().unwrap() = None;
                        if filter_dst.dynamic.load(Ordering::Acquire)
                            && filter_dst.num_input_pids() == 0
                            && filter_dst.in_pid_connection_pending.load(Ordering::Acquire) == 0
                        {
                            if !filter_dst.finalized.swap(true, Ordering::AcqRel) {
                                session.post_task(Task::new(TaskKind::FilterRemove {
                                    filter: filter_dst.clone(),
                                }));
                            }
                        }
                    }
                }
                if first_pass {
                    continue;
                }
                filter_found_but_pid_excluded = false;

                // an already loaded chain filter may take this pid
                if loaded_filters
                    .iter()
                    .any(|f| pid_match(pid, f.register(), true, None).is_some())
                {
                    debug!(
                        "skip link from {}:{} to {}: a loaded chain filter handles it",
                        filter.name(),
                        pid.name(),
                        filter_dst.name()
                    );
                    continue;
                }

                let pref = preferred_registries(session, pid, &filter_dst);
                let chain = graph::resolve_link(session, pid, &filter_dst, &pref, false);
                if chain.is_empty() {
                    if can_reassign_source(&filter, pid) {
                        if swap_source_register(session, &filter) {
                            pid.init_task_pending.fetch_sub(1, Ordering::AcqRel);
                            return TaskResult::Done;
                        }
                    }
                    continue;
                }
                match instantiate_chain(session, pid, &filter_dst, &chain, false) {
                    Some(f) => {
                        loaded_filters.push(f.clone());
                        connect_to = f;
                    }
                    None => continue,
                }
            }

            filter.out_pid_connection_pending.fetch_add(1, Ordering::AcqRel);
            post_connect_task(session, &connect_to, pid);
            found_dest = true;
        }

        if found_dest {
            // a demuxer may have several pids resolving to different
            // chains, clear the hint for the next ones
            *filter.dst_filter.lock().unwrap() = None;
            pid.init_task_pending.fetch_sub(1, Ordering::AcqRel);
            return TaskResult::Done;
        }
        if first_pass && can_try_resolution && cfg.max_resolve_chain_len > 0 {
            first_pass = false;
            continue;
        }
        break;
    }

    if filter_found_but_pid_excluded {
        info!(
            "pid {} in filter {} not connected due to source directives",
            pid.name(),
            filter.name()
        );
    } else {
        if pid.not_connected_ok.load(Ordering::Acquire) {
            debug!(
                "no filter chain found for pid {} in filter {} - not connected",
                pid.name(),
                filter.name()
            );
        } else {
            warn!(
                "no filter chain found for pid {} in filter {} - not connected",
                pid.name(),
                filter.name()
            );
        }
        if let Some(cb) = filter.register().process_event.as_ref() {
            cb(&filter, &Event::ConnectFail);
        }
        // fold any fuse state with a play/stop cycle
        events::post_event_toward_source(session, pid, Event::Play { start: 0.0, speed: 1.0 });
        events::post_event_toward_source(session, pid, Event::Stop);

        if !pid.not_connected_ok.load(Ordering::Acquire) && cfg.max_resolve_chain_len == 0 {
            session.set_last_connect_error(Error::FilterNotFound);
        }
        filter.num_out_pids_not_connected.fetch_add(1, Ordering::AcqRel);
    }
    pid.init_task_pending.fetch_sub(1, Ordering::AcqRel);
    TaskResult::Done
}

/// Source filters with no live downstream may probe another register.
fn can_reassign_source(filter: &Arc<Filter>, pid: &Arc<Pid>) -> bool {
    if filter.num_input_pids() > 0 {
        return false;
    }
    if filter.sticky.load(Ordering::Acquire) {
        return false;
    }
    if filter.out_pid_connection_pending.load(Ordering::Acquire) > 0 {
        return false;
    }
    for apid in filter.output_pids() {
        if apid.num_destinations() > 0 {
            return false;
        }
        let pending = apid.init_task_pending.load(Ordering::Acquire);
        if Arc::ptr_eq(&apid, pid) {
            if pending > 1 {
                return false;
            }
        } else if pending > 0 {
            return false;
        }
    }
    true
}

/// Task body: run the filter's process callback, gated on blocking
/// state, after settling any pending output renegotiation.
pub(crate) fn process_task(session: &Arc<Session>, filter: &Arc<Filter>) -> TaskResult {
    filter.process_task_queued.store(0, Ordering::Release);
    if filter.is_finalized() {
        return TaskResult::Done;
    }
    renegotiate_outputs(session, filter);
    if filter.is_removed() {
        return TaskResult::Done;
    }
    // all outputs blocked, unable to accept data: wait for an unblock
    let nb_out = filter.num_output_pids();
    if nb_out > 0 {
        let blocked = filter.would_block.load(Ordering::Acquire) as usize
            + filter.num_out_pids_not_connected.load(Ordering::Acquire) as usize
            + filter.num_out_pids_eos.load(Ordering::Acquire) as usize;
        if blocked >= nb_out {
            return TaskResult::Done;
        }
    }
    if let Some(cb) = filter.register().process.as_ref() {
        if let Err(e) = cb(filter) {
            if e != Error::Eos {
                warn!("filter {} process error: {}", filter.name(), e);
            }
        }
    }
    filter.flush_pending_pids();
    TaskResult::Done
}
