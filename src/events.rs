//! Event taxonomy and propagation along the pid graph.
//!
//! Events raised on an input pid travel toward the source (against the
//! media flow): play, stop, seek, buffer requirements. Events raised on
//! an output pid travel toward the sinks.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::info;

use crate::filter::Filter;
use crate::flow;
use crate::pid::{Pid, PidInst, SPEED_SCALER};
use crate::session::Session;
use crate::task::{Task, TaskKind, TaskResult};

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Play { start: f64, speed: f64 },
    SetSpeed { speed: f64 },
    Stop,
    SourceSeek { start: f64 },
    Pause,
    Resume,
    /// Buffer requirements, travels toward the source until a pid
    /// feeding a decoder or raw media absorbs it.
    BufferReq {
        max_buffer_us: u64,
        max_playout_us: u64,
        pid_only: bool,
    },
    AttachScene,
    ResetScene,
    QualitySwitch { up: bool },
    VisibilityHint { min_x: u32, max_x: u32, min_y: u32, max_y: u32 },
    InfoUpdate,
    Mouse { x: i32, y: i32 },
    SegmentSize { seg_url: String, media_start_time: u64, media_end_time: u64 },
    CapsChange,
    ConnectFail,
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Play { .. } => "PLAY",
            Event::SetSpeed { .. } => "SET_SPEED",
            Event::Stop => "STOP",
            Event::SourceSeek { .. } => "SOURCE_SEEK",
            Event::Pause => "PAUSE",
            Event::Resume => "RESUME",
            Event::BufferReq { .. } => "BUFFER_REQ",
            Event::AttachScene => "ATTACH_SCENE",
            Event::ResetScene => "RESET_SCENE",
            Event::QualitySwitch { .. } => "QUALITY_SWITCH",
            Event::VisibilityHint { .. } => "VISIBILITY_HINT",
            Event::InfoUpdate => "INFO_UPDATE",
            Event::Mouse { .. } => "MOUSE",
            Event::SegmentSize { .. } => "SEGMENT_SIZE",
            Event::CapsChange => "CAPS_CHANGED",
            Event::ConnectFail => "CONNECT_FAIL",
        }
    }
}

/// Queues an event on the producing filter of `pid`, flowing toward the
/// source.
pub(crate) fn post_event_toward_source(session: &Arc<Session>, pid: &Arc<Pid>, event: Event) {
    let filter = match pid.filter() {
        Some(f) => f,
        None => return,
    };
    if filter.is_finalized() {
        return;
    }
    info!(
        "pid {} in filter {} queuing upstream-flow event {}",
        pid.name(),
        filter.name(),
        event.name()
    );

    // stop and seek flag every destination for discard before the reset
    // tasks run
    match event {
        Event::Stop | Event::SourceSeek { .. } => {
            for inst in pid.destinations() {
                inst.discard_packets.store(true, Ordering::Release);
                pid.discard_input_packets.fetch_add(1, Ordering::AcqRel);
            }
        }
        Event::Play { .. } => {
            for inst in pid.destinations() {
                inst.is_end_of_stream.store(false, Ordering::Release);
            }
        }
        _ => {}
    }

    filter.num_events_queued.fetch_add(1, Ordering::AcqRel);
    session.post_task(Task::new(TaskKind::EventTowardSource {
        filter,
        pid: Some(pid.clone()),
        event,
    }));
}

impl PidInst {
    /// Sends an event from this consumer toward the source.
    pub fn send_event(self: &Arc<Self>, event: Event) {
        let pid = match self.pid() {
            Some(p) => p,
            None => return,
        };
        let session = match pid.filter().and_then(|f| f.session()) {
            Some(s) => s,
            None => return,
        };
        post_event_toward_source(&session, &pid, event);
    }

    /// Runs the producer's event callback synchronously; reserved for
    /// main-thread-only filters.
    pub fn exec_event(self: &Arc<Self>, event: &Event) {
        let filter = match self.pid().and_then(|p| p.filter()) {
            Some(f) => f,
            None => return,
        };
        if filter.is_finalized() {
            return;
        }
        if let Some(cb) = filter.register().process_event.as_ref() {
            cb(&filter, event);
        }
    }
}

impl Pid {
    /// Sends an event from the producer toward the sinks.
    pub fn send_event(self: &Arc<Self>, event: Event) {
        let session = match self.filter().and_then(|f| f.session()) {
            Some(s) => s,
            None => return,
        };
        for inst in self.destinations() {
            if let Some(dst) = inst.filter() {
                session.post_task(Task::new(TaskKind::EventTowardSinks {
                    filter: dst,
                    event: event.clone(),
                }));
            }
        }
    }
}

impl Filter {
    /// Sends an event from this filter toward its sources.
    pub fn send_event(self: &Arc<Self>, event: Event) {
        if self.is_finalized() {
            return;
        }
        let session = match self.session() {
            Some(s) => s,
            None => return,
        };
        session.post_task(Task::new(TaskKind::EventTowardSource {
            filter: self.clone(),
            pid: None,
            event,
        }));
    }
}

/// Task body for events flowing toward the source.
pub(crate) fn toward_source_task(
    session: &Arc<Session>,
    filter: &Arc<Filter>,
    pid: Option<&Arc<Pid>>,
    event: &Event,
) -> TaskResult {
    // wait for any pending stream reset or detached pid before touching
    // the queues
    if filter.stream_reset_pending.load(Ordering::Acquire) > 0 {
        return TaskResult::Requeue;
    }
    if !filter.detached.lock().unwrap().is_empty() {
        return TaskResult::Requeue;
    }
    if pid.is_some() {
        filter.num_events_queued.fetch_sub(1, Ordering::AcqRel);
    }

    let mut canceled = false;
    match event {
        Event::BufferReq {
            max_buffer_us,
            max_playout_us,
            pid_only,
        } => {
            let _ = max_playout_us;
            let pid = match pid {
                Some(p) => p,
                None => return TaskResult::Done,
            };
            if pid.nb_decoder_inputs.load(Ordering::Acquire) > 0
                || pid.raw_media.load(Ordering::Acquire)
                || *pid_only
            {
                pid.max_buffer_time_us
                    .store(*max_buffer_us as i64, Ordering::Release);
                pid.user_max_buffer_time_us
                    .store(*max_buffer_us as i64, Ordering::Release);
                pid.max_buffer_units.store(0, Ordering::Release);
                if pid.would_block.load(Ordering::Acquire) {
                    flow::check_unblock(pid);
                } else {
                    flow::pid_would_block(pid);
                }
                canceled = true;
            }
        }
        Event::Play { .. } if pid.map(|p| p.is_playing.load(Ordering::Acquire)).unwrap_or(false) => {
            info!("filter {} event PLAY but pid already playing, discarding", filter.name());
            return TaskResult::Done;
        }
        Event::Stop if pid.map(|p| !p.is_playing.load(Ordering::Acquire)).unwrap_or(false) => {
            info!("filter {} event STOP but pid not playing, discarding", filter.name());
            return TaskResult::Done;
        }
        _ => {
            if let Some(cb) = filter.register().process_event.as_ref() {
                canceled = cb(filter, event);
            }
        }
    }

    info!(
        "filter {} processed event {} - canceled {}",
        filter.name(),
        event.name(),
        canceled
    );

    if let Some(pid) = pid {
        match event {
            Event::Play { start, .. } | Event::SourceSeek { start } => {
                let mut do_reset = true;
                let mut is_play_reset = false;
                if matches!(event, Event::Play { .. }) {
                    pid.is_playing.store(true, Ordering::Release);
                    if pid.initial_play_done.load(Ordering::Acquire) {
                        do_reset = false;
                    } else {
                        pid.initial_play_done.store(true, Ordering::Release);
                        is_play_reset = true;
                        // packets dispatched during setup stay valid for
                        // a play at the origin
                        if *start < 0.1 {
                            do_reset = false;
                        }
                    }
                } else {
                    pid.is_playing.store(true, Ordering::Release);
                }
                if do_reset {
                    reset_destinations(session, pid, is_play_reset);
                }
            }
            Event::Stop => {
                pid.is_playing.store(false, Ordering::Release);
                reset_destinations(session, pid, false);
            }
            _ => {}
        }
        // speed changes rescale the blocking thresholds
        if let Event::Play { speed, .. } | Event::SetSpeed { speed } = event {
            let mut scaler = (speed.abs() * SPEED_SCALER as f64) as u32;
            if scaler == 0 {
                scaler = SPEED_SCALER;
            }
            let prev = pid.speed_scaler.swap(scaler, Ordering::AcqRel);
            if scaler != prev {
                if scaler < prev {
                    flow::pid_would_block(pid);
                } else {
                    flow::check_unblock(pid);
                }
            }
        }
    }

    // sources or filters with queued packets restart on play/seek
    if filter.num_input_pids() == 0 || filter.pending_packets.load(Ordering::Acquire) > 0 {
        if matches!(event, Event::Play { .. } | Event::SourceSeek { .. }) {
            filter.post_process_task();
        }
    }

    if filter.num_input_pids() == 0 {
        canceled = true;
    }
    if canceled {
        return TaskResult::Done;
    }

    // forward to each input pid, deduplicating source filters for
    // filter-wide events
    let mut dispatched: Vec<Arc<Filter>> = Vec::new();
    for inst in filter.input_pids() {
        let in_pid = match inst.pid() {
            Some(p) => p,
            None => continue,
        };
        let src = match in_pid.filter() {
            Some(f) => f,
            None => continue,
        };
        if pid.is_none() {
            if dispatched.iter().any(|f| Arc::ptr_eq(f, &src)) {
                continue;
            }
            dispatched.push(src.clone());
        }
        if matches!(event, Event::Stop | Event::SourceSeek { .. }) {
            inst.discard_packets.store(true, Ordering::Release);
            in_pid.discard_input_packets.fetch_add(1, Ordering::AcqRel);
        }
        let target = if pid.is_some() { Some(in_pid.clone()) } else { None };
        if target.is_some() {
            src.num_events_queued.fetch_add(1, Ordering::AcqRel);
        }
        session.post_task(Task::new(TaskKind::EventTowardSource {
            filter: src,
            pid: target,
            event: event.clone(),
        }));
    }
    TaskResult::Done
}

/// Flags destinations for discard and posts the per-instance reset
/// tasks.
fn reset_destinations(session: &Arc<Session>, pid: &Arc<Pid>, is_play_reset: bool) {
    for inst in pid.destinations() {
        inst.discard_packets.store(true, Ordering::Release);
        if is_play_reset {
            pid.discard_input_packets.fetch_add(1, Ordering::AcqRel);
        }
        if let Some(f) = pid.filter() {
            f.stream_reset_pending.fetch_add(1, Ordering::AcqRel);
        }
        session.post_task(Task::new(TaskKind::PidReset { inst }));
    }
}

/// Task body for events flowing toward the sinks.
pub(crate) fn toward_sinks_task(
    session: &Arc<Session>,
    filter: &Arc<Filter>,
    event: &Event,
) -> TaskResult {
    if filter.stream_reset_pending.load(Ordering::Acquire) > 0 {
        return TaskResult::Requeue;
    }
    let canceled = match filter.register().process_event.as_ref() {
        Some(cb) => cb(filter, event),
        None => true,
    };
    if canceled {
        return TaskResult::Done;
    }
    for pid in filter.output_pids() {
        for inst in pid.destinations() {
            if let Some(dst) = inst.filter() {
                session.post_task(Task::new(TaskKind::EventTowardSinks {
                    filter: dst,
                    event: event.clone(),
                }));
            }
        }
    }
    TaskResult::Done
}
