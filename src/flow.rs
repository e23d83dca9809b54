//! Backpressure and flow control: per-pid buffer accounting, blocking
//! decisions, internal control packets and buffering defaults.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::link;
use crate::packet::{ClockType, Packet, PacketBuilder, PacketFlags, PacketInst};
use crate::pid::{Pid, PidInst, SPEED_SCALER};
use crate::props::{StreamType, CODEC_RAW, PID_CODEC_ID, PID_STREAM_TYPE};
use crate::task::{Task, TaskKind};

/// True when the pid's occupancy exceeds its thresholds, speed-scaled.
fn block_condition(pid: &Pid) -> bool {
    let speed = pid.speed_scaler.load(Ordering::Acquire) as u64;
    let max_units = pid.max_buffer_units.load(Ordering::Acquire) as u64;
    if max_units > 0 {
        let nb = pid.nb_buffer_units.load(Ordering::Acquire) as u64;
        if nb * SPEED_SCALER as u64 >= max_units * speed {
            return true;
        }
    }
    let max_time = pid.max_buffer_time_us.load(Ordering::Acquire).max(0) as u64;
    if max_time > 0 {
        let dur = pid.buffer_duration_us.load(Ordering::Acquire).max(0) as u64;
        if dur * SPEED_SCALER as u64 > max_time * speed {
            return true;
        }
    }
    false
}

/// Evaluates and records the blocking state of an output pid.
pub(crate) fn pid_would_block(pid: &Arc<Pid>) -> bool {
    let filter = match pid.filter() {
        Some(f) => f,
        None => return false,
    };
    if let Some(session) = filter.session() {
        if session.config().disable_blocking {
            return false;
        }
    }
    let blocked = block_condition(pid);
    if blocked && !pid.would_block.swap(true, Ordering::AcqRel) {
        filter.would_block.fetch_add(1, Ordering::AcqRel);
        debug!(
            "pid {} in filter {} blocked ({} units / {} us buffered)",
            pid.name(),
            filter.name(),
            pid.nb_buffer_units.load(Ordering::Relaxed),
            pid.buffer_duration_us.load(Ordering::Relaxed)
        );
    }
    blocked
}

/// Clears the blocking state once occupancy drops below thresholds and
/// reposts a process task when the filter has an output able to accept
/// data again.
pub(crate) fn check_unblock(pid: &Arc<Pid>) {
    if block_condition(pid) {
        return;
    }
    if !pid.would_block.swap(false, Ordering::AcqRel) {
        return;
    }
    let filter = match pid.filter() {
        Some(f) => f,
        None => return,
    };
    filter.would_block.fetch_sub(1, Ordering::AcqRel);
    debug!("pid {} in filter {} unblocked", pid.name(), filter.name());

    let blocked = filter.would_block.load(Ordering::Acquire) as usize;
    let not_connected = filter.num_out_pids_not_connected.load(Ordering::Acquire) as usize;
    let eos = filter.num_out_pids_eos.load(Ordering::Acquire) as usize;
    if blocked + not_connected + eos < filter.num_output_pids() {
        filter.post_process_task();
    }
}

/// Recomputes the pid aggregates as the maxima across destinations.
pub(crate) fn recompute_buffer_totals(pid: &Arc<Pid>) {
    let mut nb_pck = 0usize;
    let mut buf_dur = 0i64;
    for inst in pid.destinations() {
        let n = inst.packets.lock().unwrap().len();
        if n > nb_pck {
            nb_pck = n;
        }
        let d = inst.buffer_duration_us.load(Ordering::Acquire);
        if d > buf_dur {
            buf_dur = d;
        }
    }
    pid.nb_buffer_units.store(nb_pck as u32, Ordering::Release);
    pid.buffer_duration_us.store(buf_dur, Ordering::Release);
}

/// Producer-side packet dispatch: fans the packet out to every
/// destination queue, updates buffer occupancy and blocking state.
pub(crate) fn dispatch(pid: &Arc<Pid>, mut pck: Packet) -> Result<()> {
    let filter = pid.filter().ok_or(Error::BadParam)?;
    if filter.is_finalized() {
        return Err(Error::ServiceError);
    }

    if pck.flags.contains(PacketFlags::CMD_EOS)
        && !pid.has_seen_eos.swap(true, Ordering::AcqRel)
    {
        filter.num_out_pids_eos.fetch_add(1, Ordering::AcqRel);
    }

    if !pck.is_command() && !pck.is_clock() {
        // first packet carrying a new map flags the change; from now on
        // property writes must allocate a fresh map
        let mut last = pid.last_dispatched_props.lock().unwrap();
        let changed = match last.as_ref() {
            Some(p) => !Arc::ptr_eq(p, pck.props()),
            None => false,
        };
        if changed || last.is_none() {
            *last = Some(pck.props().clone());
        }
        if changed {
            pck.flags |= PacketFlags::PROPS_CHANGED;
        }
        pid.request_property_map.store(true, Ordering::Release);

        if pid.pid_info_changed.swap(false, Ordering::AcqRel) {
            pck.flags |= PacketFlags::INFO_CHANGED;
        }
        if pck.duration > 0 {
            let min = pid.min_pck_duration.load(Ordering::Acquire);
            if min == 0 || pck.duration < min {
                pid.min_pck_duration.store(pck.duration, Ordering::Release);
            }
        }
    }

    let dur_us = pck.duration_us() as i64;
    let is_cmd = pck.is_command();
    let is_clock = pck.is_clock();
    let has_eos_cmd = pck.flags.contains(PacketFlags::CMD_EOS);
    let pck = Arc::new(pck);

    let dests = pid.destinations();
    // EOS or data on a pid with no destination is absorbed
    for dest in &dests {
        let discarding = dest.discard_packets.load(Ordering::Acquire)
            || dest.discard_inputs.load(Ordering::Acquire);
        if discarding && !is_cmd {
            continue;
        }
        if has_eos_cmd {
            dest.nb_eos_signaled.fetch_add(1, Ordering::AcqRel);
        }
        if is_clock {
            dest.nb_clocks_signaled.fetch_add(1, Ordering::AcqRel);
        }

        let inst = PacketInst::new(pck.clone());
        if dest.requires_full_data_block.load(Ordering::Acquire) && !is_cmd && !is_clock {
            if pck.flags().contains(PacketFlags::BLOCK_END) {
                let mut queue = dest.packets.lock().unwrap();
                let mut partial = dest.reassembly.lock().unwrap();
                for p in partial.drain(..) {
                    queue.push_back(p);
                }
                queue.push_back(inst);
                dest.last_block_ended.store(true, Ordering::Release);
            } else {
                dest.reassembly.lock().unwrap().push(inst);
                dest.first_block_started.store(true, Ordering::Release);
                dest.last_block_ended.store(false, Ordering::Release);
            }
        } else {
            dest.packets.lock().unwrap().push_back(inst);
        }
        pid.nb_pck_instances_out.fetch_add(1, Ordering::AcqRel);
        dest.buffer_duration_us.fetch_add(dur_us, Ordering::AcqRel);

        if let Some(dst_filter) = dest.filter() {
            dst_filter.pending_packets.fetch_add(1, Ordering::AcqRel);
            dst_filter.post_process_task();
        }
    }

    recompute_buffer_totals(pid);
    pid_would_block(pid);
    Ok(())
}

/// Consumer-side drop of the head packet: updates stats, decrements
/// occupancy and re-evaluates the blocking state.
pub(crate) fn drop_packet(inst: &Arc<PidInst>) {
    let pi = inst.packets.lock().unwrap().pop_front();
    let pi = match pi {
        Some(p) => p,
        None => {
            warn!("attempt to drop an already discarded packet");
            return;
        }
    };
    let pck = pi.pck;
    let nb_pck = inst.packets.lock().unwrap().len();

    let pid = inst.pid();
    let consumer = inst.filter();

    if let Some(f) = consumer.as_ref() {
        if let Some(session) = f.session() {
            inst.update_stats(&pck, session.now_us());
        }
    }

    if let Some(pid) = pid.as_ref() {
        if (nb_pck as u32) < pid.nb_buffer_units.load(Ordering::Acquire) {
            pid.nb_buffer_units.store(nb_pck as u32, Ordering::Release);
        }
        if nb_pck == 0 {
            inst.buffer_duration_us.store(0, Ordering::Release);
        } else if pck.duration() > 0 && pck.flags().contains(PacketFlags::BLOCK_START) {
            let mut d = pck.duration_us() as i64;
            let cur = inst.buffer_duration_us.load(Ordering::Acquire);
            if d > cur {
                d = cur;
            }
            inst.buffer_duration_us.fetch_sub(d, Ordering::AcqRel);
        }
        let inst_dur = inst.buffer_duration_us.load(Ordering::Acquire);
        let pid_dur = pid.buffer_duration_us.load(Ordering::Acquire);
        if pid_dur == 0 || inst_dur < pid_dur {
            pid.buffer_duration_us.store(inst_dur, Ordering::Release);
        }
        pid.nb_pck_instances_out.fetch_sub(1, Ordering::AcqRel);
        check_unblock(pid);
    }

    drop(pck);

    if let Some(f) = consumer {
        f.pending_packets.fetch_sub(1, Ordering::AcqRel);
        forward_clock(&f);
    }
}

/// Filters internal control packets out of the consumer-visible stream.
/// Returns true when the head packet was internal and has been consumed.
pub(crate) fn filter_internal_packet(inst: &Arc<PidInst>, pck: &Arc<Packet>) -> bool {
    let mut is_internal = false;
    let flags = pck.flags();

    if flags.contains(PacketFlags::CMD_EOS) {
        let seen = inst.pid().map(|p| p.has_seen_eos()).unwrap_or(false);
        inst.is_end_of_stream.store(seen, Ordering::Release);
        inst.nb_eos_signaled.fetch_sub(1, Ordering::AcqRel);
        info!(
            "EOS packet on pid {} in filter {}",
            inst.pid_name(),
            inst.filter().map(|f| f.name()).unwrap_or_default()
        );
        is_internal = true;
    }
    if flags.contains(PacketFlags::CMD_REMOVE) {
        if let (Some(filter), Some(pid)) = (inst.filter(), inst.pid()) {
            if let Some(session) = filter.session() {
                session.post_task(Task::new(TaskKind::PidDisconnect { filter, pid }));
            }
        }
        is_internal = true;
    }

    if pck.is_clock() {
        if inst.handles_clock_references.load(Ordering::Acquire) {
            return false;
        }
        inst.nb_clocks_signaled.fetch_sub(1, Ordering::AcqRel);
        let value = pck.cts().unwrap_or(0);
        let timescale = pck.clock_timescale();
        inst.last_clock_value.store(value, Ordering::Release);
        inst.last_clock_timescale.store(timescale, Ordering::Release);
        let ctype = match pck.clock_type() {
            ClockType::Disc => 2u8,
            _ => 1u8,
        };
        // keep a pending discontinuity sticky until read
        if inst.last_clock_type.load(Ordering::Acquire) != 2 || ctype == 2 {
            inst.last_clock_type.store(ctype, Ordering::Release);
        }
        if let Some(filter) = inst.filter() {
            *filter.pending_clock.lock().unwrap() =
                Some((value, timescale, pck.clock_type()));
        }
        debug!(
            "clock reference filtered on pid {}: {}/{}",
            inst.pid_name(),
            value,
            timescale
        );
        is_internal = true;
    }

    if is_internal {
        drop_packet(inst);
    }
    is_internal
}

/// Re-dispatches a consumed clock reference on every output of the
/// consuming filter.
pub(crate) fn forward_clock(filter: &Arc<Filter>) {
    let pending = filter.pending_clock.lock().unwrap().take();
    let (value, timescale, ctype) = match pending {
        Some(p) => p,
        None => return,
    };
    for pid in filter.output_pids() {
        let b = PacketBuilder::new(Bytes::new(), pid.latest_props()).clock(ctype, value, timescale);
        let _ = dispatch(&pid, b.pck);
    }
}

/// Applies stream-type buffering defaults on (re)configuration and
/// detects decoder inputs.
pub(crate) fn update_caps(pid: &Arc<Pid>) {
    let filter = match pid.filter() {
        Some(f) => f,
        None => return,
    };
    let session = match filter.session() {
        Some(s) => s,
        None => return,
    };
    let cfg = session.config();

    pid.raw_media.store(false, Ordering::Release);
    pid.max_buffer_time_us
        .store(cfg.default_pid_buffer_max_us as i64, Ordering::Release);
    pid.max_buffer_units
        .store(cfg.default_pid_buffer_max_units, Ordering::Release);

    let codecid = pid
        .get_property(PID_CODEC_ID)
        .and_then(|v| v.as_uint())
        .unwrap_or(0);
    if codecid != CODEC_RAW {
        return;
    }

    let user_time = pid.user_max_buffer_time_us.load(Ordering::Acquire);
    if user_time > 0 {
        pid.max_buffer_time_us.store(user_time, Ordering::Release);
        pid.max_buffer_units.store(0, Ordering::Release);
    }

    let mtype = pid
        .get_property(PID_STREAM_TYPE)
        .and_then(|v| v.stream_type());

    // a raw output whose input has the same stream type but another
    // codec marks this filter as a decoder
    let inputs = filter.input_pids();
    for inst in &inputs {
        let in_pid = match inst.pid() {
            Some(p) => p,
            None => continue,
        };
        let i_type = in_pid
            .get_property(PID_STREAM_TYPE)
            .and_then(|v| v.stream_type());
        let i_codec = in_pid
            .get_property(PID_CODEC_ID)
            .and_then(|v| v.as_uint())
            .unwrap_or(0);

        if mtype.is_some() && mtype == i_type && i_codec != codecid {
            let in_user = in_pid.user_max_buffer_time_us.load(Ordering::Acquire);
            let buf = if in_user > 0 {
                in_user
            } else {
                cfg.decoder_pid_buffer_max_us as i64
            };
            in_pid.max_buffer_time_us.store(buf, Ordering::Release);
            in_pid.max_buffer_units.store(0, Ordering::Release);

            match mtype {
                Some(StreamType::Visual) => pid.max_buffer_units.store(4, Ordering::Release),
                Some(StreamType::Audio) => pid.max_buffer_units.store(20, Ordering::Release),
                _ => {}
            }

            if !inst.is_decoder_input.swap(true, Ordering::AcqRel) {
                debug!(
                    "pid instance {} marked as decoder input",
                    in_pid.name()
                );
                in_pid.nb_decoder_inputs.fetch_add(1, Ordering::AcqRel);
                if matches!(i_type, Some(StreamType::Audio) | Some(StreamType::Visual)) {
                    link::check_dependencies(inst);
                }
            }
        } else if mtype.is_some() && mtype == i_type {
            pid.raw_media.store(true, Ordering::Release);
        }
    }
    // source pid dispatching raw media
    if inputs.is_empty() && pid.num_destinations() > 0 {
        pid.raw_media.store(true, Ordering::Release);
    }
}

/// Drains an instance without running consumer stats, fixing up the
/// shared counters. Used by teardown and reset paths.
pub(crate) fn reset_inst(inst: &Arc<PidInst>) {
    let pid = inst.pid();
    let consumer = inst.filter();
    let mut drained = 0usize;
    {
        let mut queue = inst.packets.lock().unwrap();
        drained += queue.len();
        queue.clear();
    }
    {
        let mut partial = inst.reassembly.lock().unwrap();
        drained += partial.len();
        partial.clear();
    }
    if let Some(pid) = pid.as_ref() {
        for _ in 0..drained {
            pid.nb_pck_instances_out.fetch_sub(1, Ordering::AcqRel);
        }
    }
    if let Some(f) = consumer.as_ref() {
        for _ in 0..drained {
            f.pending_packets.fetch_sub(1, Ordering::AcqRel);
        }
    }
    inst.buffer_duration_us.store(0, Ordering::Release);
    inst.nb_eos_signaled.store(0, Ordering::Release);
    inst.nb_clocks_signaled.store(0, Ordering::Release);
}

/// Task body for stream resets triggered by play/stop/seek events.
pub(crate) fn reset_task(inst: &Arc<PidInst>) {
    info!(
        "resetting input pid {} buffers in filter {}",
        inst.pid_name(),
        inst.filter().map(|f| f.name()).unwrap_or_default()
    );
    reset_inst(inst);
    inst.reset_stats();

    inst.discard_packets.store(false, Ordering::Release);
    inst.last_block_ended.store(true, Ordering::Release);
    inst.first_block_started.store(false, Ordering::Release);
    inst.is_end_of_stream.store(false, Ordering::Release);

    if let Some(pid) = inst.pid() {
        if pid.has_seen_eos.swap(false, Ordering::AcqRel) {
            if let Some(f) = pid.filter() {
                f.num_out_pids_eos.fetch_sub(1, Ordering::AcqRel);
            }
        }
        recompute_buffer_totals(&pid);
        if let Some(f) = pid.filter() {
            f.stream_reset_pending.fetch_sub(1, Ordering::AcqRel);
        }
        let cur = pid.discard_input_packets.load(Ordering::Acquire);
        if cur > 0 {
            pid.discard_input_packets.fetch_sub(1, Ordering::AcqRel);
        }
        check_unblock(&pid);
    }
}
