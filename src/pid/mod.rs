mod instance;
pub use self::instance::*;

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use log::{info, warn};

use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::flow;
use crate::packet::{PacketBuilder, PacketFlags};
use crate::props::{PropKey, PropValue, PropertyMap, PID_ID};
use crate::registry::FilterRegister;
use crate::session::Session;
use crate::task::{Task, TaskKind};
use crate::util::FourCC;

/// Scale factor for playback speed: a speed of 1.0 is stored as 1000.
pub const SPEED_SCALER: u32 = 1000;

/// An output channel of a filter.
///
/// The producing filter owns its pids; each consumer sees the pid through
/// a [`PidInst`]. Buffer aggregates (`nb_buffer_units`,
/// `buffer_duration_us`) are the maxima across destination queues and
/// drive the blocking state.
pub struct Pid {
    pub(crate) filter: Mutex<Weak<Filter>>,
    pub(crate) name: Mutex<String>,
    pub(crate) destinations: Mutex<Vec<Arc<PidInst>>>,
    pub(crate) num_destinations: AtomicUsize,

    /// Ordered chain of property snapshots; the last entry is current.
    pub(crate) properties: Mutex<Vec<Arc<PropertyMap>>>,
    /// Info properties, written without invalidating packet snapshots.
    pub(crate) info: Mutex<Option<Arc<PropertyMap>>>,
    pub(crate) last_dispatched_props: Mutex<Option<Arc<PropertyMap>>>,
    pub(crate) request_property_map: AtomicBool,
    pub(crate) props_changed_since_connect: AtomicBool,
    pub(crate) pid_info_changed: AtomicBool,

    pub(crate) max_buffer_units: AtomicU32,
    pub(crate) max_buffer_time_us: AtomicI64,
    pub(crate) user_max_buffer_time_us: AtomicI64,
    pub(crate) nb_buffer_units: AtomicU32,
    pub(crate) buffer_duration_us: AtomicI64,
    pub(crate) would_block: AtomicBool,
    pub(crate) speed_scaler: AtomicU32,

    pub(crate) has_seen_eos: AtomicBool,
    pub(crate) is_playing: AtomicBool,
    pub(crate) initial_play_done: AtomicBool,
    pub(crate) removed: AtomicBool,
    pub(crate) destroyed: AtomicBool,
    pub(crate) not_connected_ok: AtomicBool,
    pub(crate) raw_media: AtomicBool,
    pub(crate) forced_cap: AtomicU32,
    pub(crate) nb_decoder_inputs: AtomicU32,
    pub(crate) init_task_pending: AtomicU32,
    pub(crate) discard_input_packets: AtomicU32,
    /// Packet instances alive on any destination of this pid.
    pub(crate) nb_pck_instances_out: AtomicU32,
    pub(crate) min_pck_duration: AtomicU32,

    /// Properties a consumer asks the producer to switch to.
    pub(crate) caps_negotiate: Mutex<Option<Arc<PropertyMap>>>,
    pub(crate) caps_neg_dst: Mutex<Option<Weak<Filter>>>,
    /// Adaptation registers already tried for this pid.
    pub(crate) adapters_blacklist: Mutex<Vec<Arc<FilterRegister>>>,
}

impl Pid {
    pub(crate) fn new(filter: &Arc<Filter>) -> Arc<Pid> {
        let pid = Arc::new(Pid {
            filter: Mutex::new(Arc::downgrade(filter)),
            name: Mutex::new("PID".to_string()),
            destinations: Mutex::new(Vec::new()),
            num_destinations: AtomicUsize::new(0),
            properties: Mutex::new(vec![Arc::new(PropertyMap::new())]),
            info: Mutex::new(None),
            last_dispatched_props: Mutex::new(None),
            request_property_map: AtomicBool::new(false),
            props_changed_since_connect: AtomicBool::new(false),
            pid_info_changed: AtomicBool::new(false),
            max_buffer_units: AtomicU32::new(0),
            max_buffer_time_us: AtomicI64::new(0),
            user_max_buffer_time_us: AtomicI64::new(0),
            nb_buffer_units: AtomicU32::new(0),
            buffer_duration_us: AtomicI64::new(0),
            would_block: AtomicBool::new(false),
            speed_scaler: AtomicU32::new(SPEED_SCALER),
            has_seen_eos: AtomicBool::new(false),
            is_playing: AtomicBool::new(false),
            initial_play_done: AtomicBool::new(false),
            removed: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            not_connected_ok: AtomicBool::new(false),
            raw_media: AtomicBool::new(false),
            forced_cap: AtomicU32::new(0),
            nb_decoder_inputs: AtomicU32::new(0),
            init_task_pending: AtomicU32::new(0),
            discard_input_packets: AtomicU32::new(0),
            nb_pck_instances_out: AtomicU32::new(0),
            min_pck_duration: AtomicU32::new(0),
            caps_negotiate: Mutex::new(None),
            caps_neg_dst: Mutex::new(None),
            adapters_blacklist: Mutex::new(Vec::new()),
        });
        pid
    }

    pub(crate) fn set_default_name(&self, idx: usize) {
        *self.name.lock().unwrap() = format!("PID{}", idx);
    }

    pub fn name(&self) -> String {
        self.name.lock().unwrap().clone()
    }

    pub fn set_name(&self, name: &str) {
        *self.name.lock().unwrap() = name.to_string();
    }

    pub fn filter(&self) -> Option<Arc<Filter>> {
        self.filter.lock().unwrap().upgrade()
    }

    pub fn filter_name(&self) -> String {
        self.filter().map(|f| f.name()).unwrap_or_default()
    }

    pub fn num_destinations(&self) -> usize {
        self.num_destinations.load(Ordering::Acquire)
    }

    /// Snapshot of the consumer instances attached to this pid.
    pub fn destinations(&self) -> Vec<Arc<PidInst>> {
        self.destinations.lock().unwrap().clone()
    }

    /// Current property snapshot.
    pub(crate) fn latest_props(&self) -> Arc<PropertyMap> {
        let props = self.properties.lock().unwrap();
        props
            .last()
            .cloned()
            .unwrap_or_else(|| Arc::new(PropertyMap::new()))
    }

    /// Returns the map new properties should be written into. A fresh
    /// copy-on-write map is allocated only after the current one has been
    /// dispatched with a packet; otherwise the current map is reused,
    /// making same-map reconfigure a no-op.
    pub(crate) fn ensure_new_props(&self, merge: bool) -> Arc<PropertyMap> {
        self.props_changed_since_connect.store(true, Ordering::Release);

        let mut chain = self.properties.lock().unwrap();
        if let Some(last) = chain.last() {
            if !self.request_property_map.load(Ordering::Acquire) {
                return last.clone();
            }
        }
        self.request_property_map.store(false, Ordering::Release);
        self.pid_info_changed.store(false, Ordering::Release);

        let map = Arc::new(PropertyMap::new());
        if merge {
            if let Some(old) = chain.last() {
                map.merge_from(old);
            }
        }
        chain.push(map.clone());
        // drop snapshots nothing references anymore (neither packets nor
        // pinned instances)
        chain.retain(|m| Arc::strong_count(m) > 1 || Arc::ptr_eq(m, &map));
        map
    }

    fn set_property_full(&self, key: PropKey, value: PropValue, is_info: bool) -> Result<()> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(Error::BadParam);
        }
        if is_info {
            let mut info = self.info.lock().unwrap();
            let map = info.get_or_insert_with(|| Arc::new(PropertyMap::new()));
            map.set(key, value);
            self.pid_info_changed.store(true, Ordering::Release);
            return Ok(());
        }
        if key == PropKey::Code(PID_ID) {
            if let Some(id) = value.as_uint() {
                self.set_name(&format!("PID{}", id));
            }
        }
        let map = self.ensure_new_props(true);
        map.set(key, value);
        Ok(())
    }

    pub fn set_property(&self, code: FourCC, value: PropValue) -> Result<()> {
        self.set_property_full(PropKey::Code(code), value, false)
    }

    pub fn set_property_str(&self, name: &str, value: PropValue) -> Result<()> {
        self.set_property_full(PropKey::Name(name.to_string()), value, false)
    }

    /// Writes to the separate info map; dispatched packet snapshots stay
    /// untouched.
    pub fn set_info(&self, code: FourCC, value: PropValue) -> Result<()> {
        self.set_property_full(PropKey::Code(code), value, true)
    }

    pub fn set_info_str(&self, name: &str, value: PropValue) -> Result<()> {
        self.set_property_full(PropKey::Name(name.to_string()), value, true)
    }

    pub fn get_property(&self, code: FourCC) -> Option<PropValue> {
        self.latest_props().get_code(code)
    }

    pub fn get_property_str(&self, name: &str) -> Option<PropValue> {
        self.latest_props().get_str(name)
    }

    /// Informational lookup: current map, then info map, then upstream
    /// input pids of the producing filter.
    pub fn get_info(&self, code: FourCC) -> Option<PropValue> {
        if let Some(v) = self.get_property(code) {
            return Some(v);
        }
        if let Some(map) = self.info.lock().unwrap().as_ref() {
            if let Some(v) = map.get_code(code) {
                return Some(v);
            }
        }
        let filter = self.filter()?;
        for inst in filter.input_pids() {
            if let Some(pid) = inst.pid() {
                if let Some(v) = pid.get_info(code) {
                    return Some(v);
                }
            }
        }
        None
    }

    /// Replaces the current map with a fresh merge of `src`'s latest.
    pub fn copy_properties(&self, src: &Arc<Pid>) -> Result<()> {
        let dst_props = self.ensure_new_props(false);
        dst_props.reset();
        dst_props.merge_from(&src.latest_props());
        self.set_name(&src.name());
        Ok(())
    }

    pub fn reset_properties(&self) -> Result<()> {
        self.ensure_new_props(false).reset();
        Ok(())
    }

    /// Snapshot of the current property entries.
    pub fn enum_properties(&self) -> Vec<(PropKey, PropValue)> {
        self.latest_props().snapshot()
    }

    /// Requires the named capability code to be present in any matched
    /// input bundle. Rejected once the pid is connected.
    pub fn force_cap(&self, code: FourCC) -> Result<()> {
        if self.num_destinations() > 0 {
            warn!("cannot force cap on connected pid {}", self.name());
            return Err(Error::BadParam);
        }
        self.forced_cap.store(code, Ordering::Release);
        Ok(())
    }

    pub(crate) fn forced_cap(&self) -> Option<FourCC> {
        match self.forced_cap.load(Ordering::Acquire) {
            0 => None,
            c => Some(c),
        }
    }

    /// Sets the time-based buffer threshold, in microseconds.
    pub fn set_max_buffer(&self, total_duration_us: u64) {
        self.max_buffer_time_us
            .store(total_duration_us as i64, Ordering::Release);
        self.user_max_buffer_time_us
            .store(total_duration_us as i64, Ordering::Release);
    }

    pub fn max_buffer(&self) -> u64 {
        self.user_max_buffer_time_us.load(Ordering::Acquire).max(0) as u64
    }

    /// Downgrades connection failures on this pid to a debug-level event.
    pub fn set_loose_connect(&self) {
        self.not_connected_ok.store(true, Ordering::Release);
    }

    /// Current occupancy: (max units, queued units, max duration µs,
    /// queued duration µs).
    pub fn buffer_occupancy(&self) -> (u32, u32, u64, u64) {
        (
            self.max_buffer_units.load(Ordering::Acquire),
            self.nb_buffer_units.load(Ordering::Acquire),
            self.max_buffer_time_us.load(Ordering::Acquire).max(0) as u64,
            self.buffer_duration_us.load(Ordering::Acquire).max(0) as u64,
        )
    }

    /// Backpressure state following downstream occupancy vs thresholds.
    pub fn would_block(self: &Arc<Self>) -> bool {
        flow::pid_would_block(self)
    }

    pub fn has_seen_eos(&self) -> bool {
        self.has_seen_eos.load(Ordering::Acquire)
    }

    /// Builds a packet carrying the current property snapshot.
    pub fn new_packet(&self, payload: Bytes) -> PacketBuilder {
        PacketBuilder::new(payload, self.latest_props())
    }

    /// Dispatches a packet to every destination queue.
    pub fn send(self: &Arc<Self>, builder: PacketBuilder) -> Result<()> {
        flow::dispatch(self, builder.pck)
    }

    /// Signals end of stream; consumers observe it after draining.
    pub fn set_eos(self: &Arc<Self>) {
        if self.has_seen_eos.load(Ordering::Acquire) {
            return;
        }
        info!("EOS signaled on pid {} in filter {}", self.name(), self.filter_name());
        let mut b = PacketBuilder::new(Bytes::new(), self.latest_props());
        b.pck.flags |= PacketFlags::CMD_EOS;
        let _ = flow::dispatch(self, b.pck);
    }

    /// Removes the pid: destinations receive an internal remove command
    /// and disconnect after draining.
    pub fn remove(self: &Arc<Self>) {
        if let Some(f) = self.filter() {
            if f.is_removed() {
                return;
            }
        }
        if self.removed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("removal requested on pid {} in filter {}", self.name(), self.filter_name());
        let mut b = PacketBuilder::new(Bytes::new(), self.latest_props());
        b.pck.flags |= PacketFlags::CMD_EOS | PacketFlags::CMD_REMOVE;
        let _ = flow::dispatch(self, b.pck);
    }

    /// Queries a capability value during output reconfiguration: the
    /// pending negotiation map first, then the resolved destination
    /// chain's input caps.
    pub fn caps_query(&self, code: FourCC) -> Option<PropValue> {
        if let Some(map) = self.caps_negotiate.lock().unwrap().as_ref() {
            if let Some(v) = map.get_code(code) {
                return Some(v);
            }
        }
        for inst in self.destinations() {
            if let Some(f) = inst.filter() {
                for apid in f.output_pids() {
                    if let Some(v) = apid.caps_query(code) {
                        return Some(v);
                    }
                }
            }
        }
        let filter = self.filter()?;
        let mut dst = filter.dst_filter();
        while let Some(d) = dst {
            let cap_idx = d.cap_idx_at_resolution.load(Ordering::Acquire);
            if cap_idx >= 0 {
                if let Some(v) = input_cap_value(&d.register().caps, cap_idx as usize, code) {
                    return Some(v);
                }
            }
            dst = d.dst_filter();
        }
        None
    }

    /// Name of the origin filter of this pid's chain (the first filter
    /// with no inputs).
    pub fn source_filter_name(&self) -> Option<String> {
        let mut filter = self.filter()?;
        loop {
            let inputs = filter.input_pids();
            let next = inputs
                .first()
                .and_then(|inst| inst.pid())
                .and_then(|p| p.filter());
            match next {
                Some(f) if filter.num_input_pids() > 0 => filter = f,
                _ => break,
            }
        }
        Some(filter.name())
    }

    /// Argument string of the original source in this pid's chain.
    pub fn orig_src_args(&self) -> Option<String> {
        let filter = self.filter()?;
        let args = filter.args.lock().unwrap().clone();
        if let Some(a) = args.as_ref() {
            if a.contains("src") {
                return args;
            }
        }
        for inst in filter.input_pids() {
            if let Some(pid) = inst.pid() {
                if let Some(a) = pid.orig_src_args() {
                    return Some(a);
                }
            }
        }
        args
    }

    /// Destination string (`dst=...`) requested by the filters consuming
    /// this pid, walking down the chain.
    pub fn destination_string(&self) -> Option<String> {
        fn dst_of_args(args: &str, sep_name: char) -> Option<String> {
            let key = format!("dst{}", sep_name);
            let pos = args.find(&key)?;
            let rest = &args[pos + key.len()..];
            // a URL scheme keeps its colon
            let end = match rest.find("://") {
                Some(scheme) => rest[scheme + 3..]
                    .find(':')
                    .map(|p| scheme + 3 + p)
                    .unwrap_or(rest.len()),
                None => rest.find(':').unwrap_or(rest.len()),
            };
            Some(rest[..end].to_string())
        }
        let filter = self.filter()?;
        let sep_name = filter.session().map(|s| s.config().sep_name).unwrap_or('=');
        if let Some(args) = filter.args.lock().unwrap().as_deref() {
            if let Some(d) = dst_of_args(args, sep_name) {
                return Some(d);
            }
        }
        for inst in self.destinations() {
            let dst_filter = match inst.filter() {
                Some(f) => f,
                None => continue,
            };
            if let Some(args) = dst_filter.args.lock().unwrap().as_deref() {
                if let Some(d) = dst_of_args(args, sep_name) {
                    return Some(d);
                }
            }
            for apid in dst_filter.output_pids() {
                if let Some(d) = apid.destination_string() {
                    return Some(d);
                }
            }
        }
        None
    }

    /// Forces a reconfigure of every destination with the current
    /// property map, for producers changing properties between packets.
    pub fn reconfigure_destinations(self: &Arc<Self>) {
        let session = match self.filter().and_then(|f| f.session()) {
            Some(s) => s,
            None => return,
        };
        for inst in self.destinations() {
            if let Some(dst) = inst.filter() {
                session.post_task(Task::new(TaskKind::PidReconfigure {
                    filter: dst,
                    pid: self.clone(),
                }));
            }
        }
    }

    /// Posts an init task unless one is already pending.
    pub(crate) fn post_init_task(session: &Arc<Session>, _filter: &Arc<Filter>, pid: &Arc<Pid>) {
        if pid.init_task_pending.fetch_add(1, Ordering::AcqRel) > 0 {
            pid.init_task_pending.fetch_sub(1, Ordering::AcqRel);
            return;
        }
        session.post_task(Task::new(TaskKind::PidInit { pid: pid.clone() }));
    }
}

impl std::fmt::Debug for Pid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pid")
            .field("name", &self.name())
            .field("filter", &self.filter_name())
            .field("destinations", &self.num_destinations())
            .field("would_block", &self.would_block.load(Ordering::Relaxed))
            .finish()
    }
}

/// Reads the value of an input cap with the given code starting at a
/// bundle position in a flat caps list.
fn input_cap_value(
    caps: &[crate::caps::Capability],
    start_idx: usize,
    code: FourCC,
) -> Option<PropValue> {
    use crate::caps::CapFlags;
    for cap in caps.iter().skip(start_idx) {
        if !cap.flags.contains(CapFlags::IN_BUNDLE) {
            return None;
        }
        if !cap.flags.contains(CapFlags::INPUT) || cap.flags.contains(CapFlags::OPTIONAL) {
            continue;
        }
        if cap.key == PropKey::Code(code) {
            return Some(cap.value.clone());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::props::PID_SAMPLE_RATE;

    fn test_pid() -> Arc<Pid> {
        let session = Session::new();
        let reg = crate::registry::FilterRegister::builder("src")
            .process(|_| Ok(()))
            .build();
        let filter = session.load_filter(&reg);
        filter.new_output_pid()
    }

    #[test]
    fn property_writes_reuse_undispatched_map() {
        let pid = test_pid();
        pid.set_property(PID_SAMPLE_RATE, PropValue::Uint(48_000)).unwrap();
        let m1 = pid.latest_props();
        pid.set_property(PID_SAMPLE_RATE, PropValue::Uint(44_100)).unwrap();
        let m2 = pid.latest_props();
        assert!(Arc::ptr_eq(&m1, &m2), "no packet dispatched, same map mutated");
        assert_eq!(m2.get_code(PID_SAMPLE_RATE), Some(PropValue::Uint(44_100)));
    }

    #[test]
    fn dispatched_map_is_copied_on_write() {
        let pid = test_pid();
        pid.set_property(PID_SAMPLE_RATE, PropValue::Uint(48_000)).unwrap();
        let snapshot = pid.latest_props();
        // a dispatch freezes the current map
        pid.request_property_map.store(true, Ordering::Release);
        pid.set_property(PID_SAMPLE_RATE, PropValue::Uint(44_100)).unwrap();
        let fresh = pid.latest_props();
        assert!(!Arc::ptr_eq(&snapshot, &fresh));
        // the frozen snapshot keeps its value, the new map carries the
        // merge plus the change
        assert_eq!(snapshot.get_code(PID_SAMPLE_RATE), Some(PropValue::Uint(48_000)));
        assert_eq!(fresh.get_code(PID_SAMPLE_RATE), Some(PropValue::Uint(44_100)));
    }

    #[test]
    fn info_map_leaves_snapshot_untouched() {
        let pid = test_pid();
        pid.set_property(PID_SAMPLE_RATE, PropValue::Uint(48_000)).unwrap();
        let snapshot = pid.latest_props();
        pid.set_info(PID_SAMPLE_RATE, PropValue::Uint(1)).unwrap();
        assert!(Arc::ptr_eq(&snapshot, &pid.latest_props()));
        // info reachable through the info lookup only
        assert_eq!(pid.get_property(PID_SAMPLE_RATE), Some(PropValue::Uint(48_000)));
    }

    #[test]
    fn pid_id_property_renames() {
        let pid = test_pid();
        pid.set_property(PID_ID, PropValue::Uint(12)).unwrap();
        assert_eq!(pid.name(), "PID12");
    }
}
