use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::info;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::flow;
use crate::link;
use crate::packet::{ClockType, Packet, PacketFlags, PacketInst};
use crate::pid::Pid;
use crate::props::{PropValue, PropertyMap};
use crate::util::FourCC;

/// Consumption statistics kept per pid instance, with bitrate estimates
/// over one-second windows.
#[derive(Debug, Default, Clone, Serialize)]
pub struct PidStats {
    pub nb_processed: u64,
    pub nb_sap_processed: u64,
    pub total_process_time_us: u64,
    pub max_process_time_us: u64,
    pub total_sap_process_time_us: u64,
    pub max_sap_process_time_us: u64,
    pub first_frame_time_us: u64,
    pub last_fetch_time_us: u64,
    pub avg_bit_rate: u32,
    pub max_bit_rate: u32,
    pub avg_process_rate: u32,
    pub max_process_rate: u32,
    #[serde(skip)]
    pub(crate) cur_bit_size: u64,
    #[serde(skip)]
    pub(crate) stats_start_ts_us: u64,
    #[serde(skip)]
    pub(crate) stats_start_us: u64,
}

/// One consumer's view of a pid: the packet queue and all per-link state.
pub struct PidInst {
    /// Severed while the instance is parked in a detach.
    pub(crate) pid: Mutex<Option<Arc<Pid>>>,
    pub(crate) filter: Mutex<Option<Weak<Filter>>>,
    pub(crate) packets: Mutex<VecDeque<PacketInst>>,
    pub(crate) reassembly: Mutex<Vec<PacketInst>>,
    /// Property snapshot pinned at the last consumed packet.
    pub(crate) props: Mutex<Option<Arc<PropertyMap>>>,
    pub(crate) buffer_duration_us: AtomicI64,

    pub(crate) is_decoder_input: AtomicBool,
    pub(crate) requires_full_data_block: AtomicBool,
    pub(crate) last_block_ended: AtomicBool,
    pub(crate) first_block_started: AtomicBool,
    pub(crate) is_end_of_stream: AtomicBool,
    pub(crate) nb_eos_signaled: AtomicU32,
    pub(crate) nb_clocks_signaled: AtomicU32,
    pub(crate) detach_pending: AtomicU32,
    pub(crate) discard_packets: AtomicBool,
    pub(crate) discard_inputs: AtomicBool,

    pub(crate) stats: Mutex<PidStats>,

    pub(crate) last_clock_value: AtomicU64,
    pub(crate) last_clock_timescale: AtomicU32,
    /// 0 = none, 1 = clock, 2 = discontinuity.
    pub(crate) last_clock_type: AtomicU8,
    pub(crate) handles_clock_references: AtomicBool,
}

impl PidInst {
    pub(crate) fn new(filter: &Arc<Filter>, pid: &Arc<Pid>) -> Arc<PidInst> {
        Arc::new(PidInst {
            pid: Mutex::new(Some(pid.clone())),
            filter: Mutex::new(Some(Arc::downgrade(filter))),
            packets: Mutex::new(VecDeque::new()),
            reassembly: Mutex::new(Vec::new()),
            props: Mutex::new(None),
            buffer_duration_us: AtomicI64::new(0),
            is_decoder_input: AtomicBool::new(false),
            requires_full_data_block: AtomicBool::new(false),
            last_block_ended: AtomicBool::new(true),
            first_block_started: AtomicBool::new(false),
            is_end_of_stream: AtomicBool::new(false),
            nb_eos_signaled: AtomicU32::new(0),
            nb_clocks_signaled: AtomicU32::new(0),
            detach_pending: AtomicU32::new(0),
            discard_packets: AtomicBool::new(false),
            discard_inputs: AtomicBool::new(false),
            stats: Mutex::new(PidStats::default()),
            last_clock_value: AtomicU64::new(0),
            last_clock_timescale: AtomicU32::new(0),
            last_clock_type: AtomicU8::new(0),
            handles_clock_references: AtomicBool::new(false),
        })
    }

    pub fn pid(&self) -> Option<Arc<Pid>> {
        self.pid.lock().unwrap().clone()
    }

    pub fn filter(&self) -> Option<Arc<Filter>> {
        self.filter.lock().unwrap().as_ref().and_then(Weak::upgrade)
    }

    pub fn pid_name(&self) -> String {
        self.pid().map(|p| p.name()).unwrap_or_default()
    }

    /// Pinned property snapshot, initialized from the oldest map of the
    /// pid on first access.
    pub(crate) fn pinned_props(&self) -> Option<Arc<PropertyMap>> {
        let mut props = self.props.lock().unwrap();
        if props.is_none() {
            let pid = self.pid.lock().unwrap().clone()?;
            let chain = pid.properties.lock().unwrap();
            *props = chain.first().cloned();
        }
        props.clone()
    }

    pub fn get_property(&self, code: FourCC) -> Option<PropValue> {
        self.pinned_props()?.get_code(code)
    }

    pub fn get_property_str(&self, name: &str) -> Option<PropValue> {
        self.pinned_props()?.get_str(name)
    }

    /// Informational lookup, falling through to the producing pid and its
    /// upstream chain.
    pub fn get_info(&self, code: FourCC) -> Option<PropValue> {
        if let Some(map) = self.pinned_props() {
            if let Some(v) = map.get_code(code) {
                return Some(v);
            }
        }
        self.pid()?.get_info(code)
    }

    /// When enabled, `get_packet` only returns completed data blocks.
    pub fn set_framing_mode(&self, requires_full_blocks: bool) {
        self.requires_full_data_block
            .store(requires_full_blocks, Ordering::Release);
    }

    /// Queued packets visible to the consumer (commands excluded).
    pub fn packet_count(&self) -> usize {
        if self.discard_packets.load(Ordering::Acquire) {
            return 0;
        }
        let n = self.packets.lock().unwrap().len();
        n.saturating_sub(self.nb_eos_signaled.load(Ordering::Acquire) as usize)
            .saturating_sub(self.nb_clocks_signaled.load(Ordering::Acquire) as usize)
    }

    /// Fetches the head packet, interpreting internal packets and
    /// running reconfiguration when the head carries new properties.
    pub fn get_packet(self: &Arc<Self>) -> Option<Arc<Packet>> {
        if self.discard_packets.load(Ordering::Acquire) {
            return None;
        }
        if self.detach_pending.load(Ordering::Acquire) > 0 {
            return None;
        }
        loop {
            let head = {
                let queue = self.packets.lock().unwrap();
                queue.front().map(|pi| (pi.pck.clone(), pi.props_change_done, pi.info_change_done))
            };
            let (pck, props_done, info_done) = match head {
                Some(h) => h,
                None => {
                    let pid = self.pid()?;
                    if !self.is_end_of_stream.load(Ordering::Acquire) {
                        if let Some(f) = pid.filter() {
                            if f.would_block.load(Ordering::Acquire) > 0 {
                                flow::check_unblock(&pid);
                            }
                        }
                    }
                    return None;
                }
            };

            if flow::filter_internal_packet(self, &pck) {
                continue;
            }
            self.is_end_of_stream.store(false, Ordering::Release);

            if pck.flags().contains(PacketFlags::PROPS_CHANGED) && !props_done {
                if let Some(pi) = self.packets.lock().unwrap().front_mut() {
                    pi.props_change_done = true;
                }
                let pid = self.pid()?;
                let filter = self.filter()?;
                let mut skip_props = false;
                {
                    let mut pinned = self.props.lock().unwrap();
                    match pinned.as_ref() {
                        Some(cur) if Arc::ptr_eq(cur, pck.props()) => {
                            // destination was configured after dispatch,
                            // nothing to do
                            skip_props = true;
                        }
                        _ => {
                            *pinned = Some(pck.props().clone());
                        }
                    }
                }
                if !skip_props {
                    info!(
                        "pid {} properties changed at packet, reconfiguring {}",
                        pid.name(),
                        filter.name()
                    );
                    // a previously failing register may work for the new
                    // format
                    filter.blacklist.lock().unwrap().clear();
                    let session = filter.session()?;
                    if link::configure(&session, &filter, &pid, link::ConnectType::Reconfigure)
                        .is_err()
                    {
                        return None;
                    }
                    if pid.caps_negotiate.lock().unwrap().is_some() {
                        return None;
                    }
                }
            }

            if pck.flags().contains(PacketFlags::INFO_CHANGED) && !info_done {
                if let Some(pi) = self.packets.lock().unwrap().front_mut() {
                    pi.info_change_done = true;
                }
                if let Some(filter) = self.filter() {
                    if let Some(cb) = filter.register().process_event.as_ref() {
                        cb(&filter, &crate::events::Event::InfoUpdate);
                    }
                }
            }

            if let Some(filter) = self.filter() {
                if let Some(session) = filter.session() {
                    self.stats.lock().unwrap().last_fetch_time_us = session.now_us();
                }
            }
            return Some(pck);
        }
    }

    /// Drops the head packet and updates flow accounting.
    pub fn drop_packet(self: &Arc<Self>) {
        flow::drop_packet(self);
    }

    /// True once the pid signaled EOS and the queue is drained to it.
    pub fn is_eos(self: &Arc<Self>) -> bool {
        if self.detach_pending.load(Ordering::Acquire) > 0 {
            return false;
        }
        let pid = match self.pid() {
            Some(p) => p,
            None => return false,
        };
        if !pid.has_seen_eos() {
            self.is_end_of_stream.store(false, Ordering::Release);
            return false;
        }
        let head = self.packets.lock().unwrap().front().map(|pi| pi.pck.clone());
        if let Some(pck) = head {
            flow::filter_internal_packet(self, &pck);
        }
        self.is_end_of_stream.load(Ordering::Acquire)
    }

    pub fn clear_eos(&self) {
        self.is_end_of_stream.store(false, Ordering::Release);
    }

    /// Recursive EOS probe through the upstream chain.
    pub fn has_seen_eos(&self) -> bool {
        let pid = match self.pid() {
            Some(p) => p,
            None => return false,
        };
        if pid.has_seen_eos() {
            return true;
        }
        if let Some(f) = pid.filter() {
            for inst in f.input_pids() {
                if inst.has_seen_eos() {
                    return true;
                }
            }
        }
        false
    }

    /// Drains and discards queued packets until cleared; the instance
    /// reads as EOS while discarding.
    pub fn set_discard(self: &Arc<Self>, discard_on: bool) -> Result<()> {
        let pid = self.pid().ok_or(Error::BadParam)?;
        if discard_on {
            info!("discarding packets on pid {} in filter {}", pid.name(), pid.filter_name());
            while self.get_packet().is_some() {
                self.drop_packet();
            }
            self.is_end_of_stream.store(true, Ordering::Release);
        } else {
            self.is_end_of_stream
                .store(pid.has_seen_eos(), Ordering::Release);
        }
        self.discard_inputs.store(discard_on, Ordering::Release);
        Ok(())
    }

    /// CTS of the head data packet, without consuming it.
    pub fn first_packet_cts(&self) -> Option<u64> {
        let queue = self.packets.lock().unwrap();
        for pi in queue.iter() {
            if pi.pck.is_command() || pi.pck.is_clock() {
                continue;
            }
            return pi.pck.cts();
        }
        None
    }

    pub fn first_packet_is_empty(&self) -> bool {
        let queue = self.packets.lock().unwrap();
        match queue.front() {
            Some(pi) => !pi.pck.is_command() && !pi.pck.is_clock() && pi.pck.payload().is_empty(),
            None => false,
        }
    }

    /// Requests a property change on the producer; publishes into the
    /// pid's negotiation map and arms renegotiation on the source filter.
    pub fn negotiate_property(&self, code: FourCC, value: PropValue) -> Result<()> {
        let pid = self.pid().ok_or(Error::BadParam)?;
        let mut neg = pid.caps_negotiate.lock().unwrap();
        let map = match neg.as_ref() {
            Some(m) => m.clone(),
            None => {
                let m = Arc::new(PropertyMap::new());
                *neg = Some(m.clone());
                // new negotiation round: previously tried adapters are
                // fair game again
                pid.adapters_blacklist.lock().unwrap().clear();
                *pid.caps_neg_dst.lock().unwrap() = self.filter.lock().unwrap().clone();
                if let Some(f) = pid.filter() {
                    f.nb_caps_renegotiate.fetch_add(1, Ordering::AcqRel);
                }
                m
            }
        };
        map.set(code.into(), value);
        Ok(())
    }

    /// Last clock reference seen; reading consumes the clock type.
    pub fn clock_info(&self) -> (ClockType, u64, u32) {
        let ctype = match self.last_clock_type.swap(0, Ordering::AcqRel) {
            1 => ClockType::Clock,
            2 => ClockType::Disc,
            _ => ClockType::None,
        };
        (
            ctype,
            self.last_clock_value.load(Ordering::Acquire),
            self.last_clock_timescale.load(Ordering::Acquire),
        )
    }

    /// Declares this filter the clock handler: clock packets are kept
    /// rather than filtered and forwarded.
    pub fn set_clock_mode(&self, filter_in_charge: bool) {
        self.handles_clock_references
            .store(filter_in_charge, Ordering::Release);
    }

    pub fn stats(&self) -> PidStats {
        self.stats.lock().unwrap().clone()
    }

    /// Total buffered duration from this instance up through the source,
    /// in microseconds.
    pub fn query_buffer_duration(&self, check_decoder_output: bool) -> u64 {
        let pid = match self.pid() {
            Some(p) => p,
            None => return 0,
        };
        if check_decoder_output {
            let max_units = pid.max_buffer_units.load(Ordering::Acquire);
            let nb_units = pid.nb_buffer_units.load(Ordering::Acquire);
            if max_units > 0 && max_units > nb_units {
                return 0;
            }
        }
        let mut duration = 0u64;
        if let Some(f) = pid.filter() {
            for inst in f.input_pids() {
                duration = duration.max(inst.query_buffer_duration(check_decoder_output));
            }
        }
        duration + self.buffer_duration_us.load(Ordering::Acquire).max(0) as u64
    }

    pub(crate) fn update_stats(&self, pck: &Packet, now_us: u64) {
        if pck.is_command() {
            return;
        }
        let mut st = self.stats.lock().unwrap();
        let dec_time = now_us.saturating_sub(st.last_fetch_time_us);

        if st.nb_processed == 0 {
            st.first_frame_time_us = st.last_fetch_time_us;
        }
        st.nb_processed += 1;
        st.total_process_time_us += dec_time;
        if dec_time > st.max_process_time_us {
            st.max_process_time_us = dec_time;
        }
        if pck.is_sap() {
            st.nb_sap_processed += 1;
            st.total_sap_process_time_us += dec_time;
            if dec_time > st.max_sap_process_time_us {
                st.max_sap_process_time_us = dec_time;
            }
        }

        if pck.payload().is_empty() {
            return;
        }
        let ts_us = match (pck.dts().or(pck.cts()), pck.props().timescale()) {
            (Some(ts), scale) if scale > 0 => Some(ts * 1_000_000 / scale as u64),
            _ => None,
        };
        if st.cur_bit_size == 0 {
            st.stats_start_ts_us = ts_us.unwrap_or(0);
            st.stats_start_us = now_us;
            st.cur_bit_size = 8 * pck.payload().len() as u64;
            return;
        }
        st.cur_bit_size += 8 * pck.payload().len() as u64;
        let flush = match ts_us {
            Some(ts) => st.stats_start_ts_us + 1_000_000 <= ts,
            None => st.stats_start_us + 1_000_000 <= now_us,
        };
        if !flush {
            return;
        }
        if let Some(ts) = ts_us {
            let span = ts - st.stats_start_ts_us;
            if span > 0 {
                st.avg_bit_rate = (st.cur_bit_size * 1_000_000 / span) as u32;
                if st.avg_bit_rate > st.max_bit_rate {
                    st.max_bit_rate = st.avg_bit_rate;
                }
            }
        }
        let span = now_us - st.stats_start_us;
        if span > 0 {
            st.avg_process_rate = (st.cur_bit_size * 1_000_000 / span) as u32;
            if st.avg_process_rate > st.max_process_rate {
                st.max_process_rate = st.avg_process_rate;
            }
        }
        st.cur_bit_size = 0;
    }

    pub(crate) fn reset_stats(&self) {
        *self.stats.lock().unwrap() = PidStats::default();
    }
}

impl std::fmt::Debug for PidInst {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PidInst")
            .field("pid", &self.pid_name())
            .field("filter", &self.filter().map(|f| f.name()))
            .field("queued", &self.packets.lock().unwrap().len())
            .field("eos", &self.is_end_of_stream.load(Ordering::Relaxed))
            .finish()
    }
}
