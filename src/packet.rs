use std::sync::Arc;

use bitflags::bitflags;
use bytes::Bytes;

use crate::props::PropertyMap;
use crate::util;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PacketFlags: u32 {
        const BLOCK_START = 1;
        const BLOCK_END = 1 << 1;
        /// Synchronization access point.
        const SAP = 1 << 2;
        const SEEK = 1 << 3;
        /// First packet carrying a new property map.
        const PROPS_CHANGED = 1 << 4;
        /// Info-map changed since the previous packet.
        const INFO_CHANGED = 1 << 5;
        /// Internal end-of-stream command.
        const CMD_EOS = 1 << 6;
        /// Internal pid-removal command.
        const CMD_REMOVE = 1 << 7;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockType {
    None,
    Clock,
    /// Clock discontinuity.
    Disc,
}

/// A packet dispatched on a pid, shared by every destination through
/// `Arc`. The strong count is the packet's reference count; the last
/// consumer drop releases the payload.
#[derive(Debug)]
pub struct Packet {
    payload: Bytes,
    props: Arc<PropertyMap>,
    pub(crate) flags: PacketFlags,
    pub(crate) dts: Option<u64>,
    pub(crate) cts: Option<u64>,
    pub(crate) duration: u32,
    pub(crate) clock_type: ClockType,
    /// Timescale of a clock reference value; 0 falls back to the map's.
    pub(crate) clock_timescale: u32,
}

impl Packet {
    pub(crate) fn new(payload: Bytes, props: Arc<PropertyMap>) -> Packet {
        Packet {
            payload,
            props,
            flags: PacketFlags::BLOCK_START | PacketFlags::BLOCK_END,
            dts: None,
            cts: None,
            duration: 0,
            clock_type: ClockType::None,
            clock_timescale: 0,
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Property map active when the packet was created. Packets keep
    /// their snapshot across later reconfigurations of the pid.
    pub fn props(&self) -> &Arc<PropertyMap> {
        &self.props
    }

    pub fn flags(&self) -> PacketFlags {
        self.flags
    }

    pub fn dts(&self) -> Option<u64> {
        self.dts
    }

    pub fn cts(&self) -> Option<u64> {
        self.cts
    }

    pub fn duration(&self) -> u32 {
        self.duration
    }

    pub fn clock_type(&self) -> ClockType {
        self.clock_type
    }

    pub fn clock_timescale(&self) -> u32 {
        if self.clock_timescale != 0 {
            self.clock_timescale
        } else {
            self.props.timescale()
        }
    }

    pub fn is_sap(&self) -> bool {
        self.flags.contains(PacketFlags::SAP)
    }

    /// True for internal command packets (EOS, remove) that consumers
    /// never see through `get_packet`.
    pub fn is_command(&self) -> bool {
        self.flags
            .intersects(PacketFlags::CMD_EOS | PacketFlags::CMD_REMOVE)
    }

    pub fn is_clock(&self) -> bool {
        self.clock_type != ClockType::None
    }

    /// Packet duration in microseconds, following the map's timescale.
    pub fn duration_us(&self) -> u64 {
        util::duration_us(self.duration as u64, self.props.timescale())
    }
}

/// Builder handed to producers; finalized by `Pid::send`.
#[derive(Debug)]
pub struct PacketBuilder {
    pub(crate) pck: Packet,
}

impl PacketBuilder {
    pub(crate) fn new(payload: Bytes, props: Arc<PropertyMap>) -> PacketBuilder {
        PacketBuilder {
            pck: Packet::new(payload, props),
        }
    }

    pub fn dts(mut self, dts: u64) -> Self {
        self.pck.dts = Some(dts);
        self
    }

    pub fn cts(mut self, cts: u64) -> Self {
        self.pck.cts = Some(cts);
        self
    }

    pub fn duration(mut self, duration: u32) -> Self {
        self.pck.duration = duration;
        self
    }

    pub fn sap(mut self) -> Self {
        self.pck.flags |= PacketFlags::SAP;
        self
    }

    pub fn seek(mut self) -> Self {
        self.pck.flags |= PacketFlags::SEEK;
        self
    }

    /// Marks the packet as a fragment of a larger block.
    pub fn framing(mut self, block_start: bool, block_end: bool) -> Self {
        self.pck.flags.remove(PacketFlags::BLOCK_START | PacketFlags::BLOCK_END);
        if block_start {
            self.pck.flags |= PacketFlags::BLOCK_START;
        }
        if block_end {
            self.pck.flags |= PacketFlags::BLOCK_END;
        }
        self
    }

    pub fn clock(mut self, clock_type: ClockType, cts: u64, timescale: u32) -> Self {
        self.pck.clock_type = clock_type;
        self.pck.cts = Some(cts);
        self.pck.clock_timescale = timescale;
        self
    }
}

/// One destination's view of a shared packet.
#[derive(Debug, Clone)]
pub(crate) struct PacketInst {
    pub pck: Arc<Packet>,
    pub props_change_done: bool,
    pub info_change_done: bool,
}

impl PacketInst {
    pub fn new(pck: Arc<Packet>) -> PacketInst {
        PacketInst {
            pck,
            props_change_done: false,
            info_change_done: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_follows_timescale() {
        let props = Arc::new(PropertyMap::new());
        props.set(crate::props::PID_TIMESCALE.into(), crate::props::PropValue::Uint(90_000));
        let b = PacketBuilder::new(Bytes::from_static(b"x"), props).duration(45_000);
        assert_eq!(b.pck.duration_us(), 500_000);
    }

    #[test]
    fn framing_flags() {
        let props = Arc::new(PropertyMap::new());
        let b = PacketBuilder::new(Bytes::new(), props).framing(true, false);
        assert!(b.pck.flags().contains(PacketFlags::BLOCK_START));
        assert!(!b.pck.flags().contains(PacketFlags::BLOCK_END));
    }
}
