use bitflags::bitflags;

use crate::props::{PropKey, PropValue, PropertyMap, StreamType, PID_FILE_EXT, PID_MIME, PID_STREAM_TYPE};
use crate::util::FourCC;

bitflags! {
    /// Flags qualifying one capability entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CapFlags: u32 {
        /// Entry belongs to the current bundle. Entries without this flag
        /// are bundle separators.
        const IN_BUNDLE = 1;
        const INPUT = 1 << 1;
        const OUTPUT = 1 << 2;
        /// Matches when the pid value differs from the cap value.
        const EXCLUDED = 1 << 3;
        /// Only applies when the candidate filter was loaded specifically
        /// for this link.
        const LOADED_FILTER = 1 << 4;
        /// Applies across all bundles of the register.
        const STATIC = 1 << 5;
        /// Never causes a bundle rejection when absent from the pid.
        const OPTIONAL = 1 << 6;
    }
}

/// One capability constraint: `(key, value, flags)` plus a priority used
/// to break ties during link selection.
#[derive(Debug, Clone)]
pub struct Capability {
    pub flags: CapFlags,
    pub key: PropKey,
    pub value: PropValue,
    pub priority: u8,
}

impl Capability {
    pub fn input(code: FourCC, value: PropValue) -> Capability {
        Capability {
            flags: CapFlags::IN_BUNDLE | CapFlags::INPUT,
            key: PropKey::Code(code),
            value,
            priority: 0,
        }
    }

    pub fn output(code: FourCC, value: PropValue) -> Capability {
        Capability {
            flags: CapFlags::IN_BUNDLE | CapFlags::OUTPUT,
            key: PropKey::Code(code),
            value,
            priority: 0,
        }
    }

    pub fn in_out(code: FourCC, value: PropValue) -> Capability {
        Capability {
            flags: CapFlags::IN_BUNDLE | CapFlags::INPUT | CapFlags::OUTPUT,
            key: PropKey::Code(code),
            value,
            priority: 0,
        }
    }

    pub fn input_str(name: &str, value: PropValue) -> Capability {
        Capability {
            flags: CapFlags::IN_BUNDLE | CapFlags::INPUT,
            key: PropKey::Name(name.to_string()),
            value,
            priority: 0,
        }
    }

    /// Bundle separator.
    pub fn separator() -> Capability {
        Capability {
            flags: CapFlags::empty(),
            key: PropKey::Code(0),
            value: PropValue::Bool(false),
            priority: 0,
        }
    }

    pub fn excluded(mut self) -> Capability {
        self.flags |= CapFlags::EXCLUDED;
        self
    }

    pub fn optional(mut self) -> Capability {
        self.flags |= CapFlags::OPTIONAL;
        self
    }

    pub fn static_cap(mut self) -> Capability {
        self.flags |= CapFlags::STATIC;
        self
    }

    pub fn loaded_filter(mut self) -> Capability {
        self.flags |= CapFlags::LOADED_FILTER;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Capability {
        self.priority = priority;
        self
    }

    fn is_separator(&self) -> bool {
        !self.flags.contains(CapFlags::IN_BUNDLE)
    }
}

/// Splits a flat capability list into bundle index ranges.
fn bundle_ranges(caps: &[Capability]) -> Vec<std::ops::Range<usize>> {
    let mut out = Vec::new();
    if caps.is_empty() {
        return out;
    }
    let mut start = 0;
    for (i, cap) in caps.iter().enumerate() {
        if cap.is_separator() {
            out.push(start..i);
            start = i + 1;
        }
    }
    out.push(start..caps.len());
    out
}

pub fn bundle_count(caps: &[Capability]) -> usize {
    bundle_ranges(caps).len()
}

pub fn has_out_caps(caps: &[Capability]) -> bool {
    caps.iter().any(|c| c.flags.contains(CapFlags::OUTPUT))
}

/// Result of matching a pid against a register's input capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapsMatch {
    pub bundle_idx: usize,
    pub priority: u8,
}

/// Decides whether a pid's current properties satisfy one of the input
/// capability bundles in `caps`.
///
/// `skip_explicit_load` disables LOADED_FILTER restrictions (the
/// candidate is an already-loaded instance of the register);
/// `is_resolved_destination` states that the candidate is the exact
/// filter the pid was resolved against. `for_bundle` restricts the test
/// to a single bundle, which resolution uses to validate a specific edge.
pub fn pid_caps_match(
    props: &PropertyMap,
    forced_cap: Option<FourCC>,
    caps: &[Capability],
    default_priority: u8,
    skip_explicit_load: bool,
    is_resolved_destination: bool,
    for_bundle: Option<usize>,
) -> Option<CapsMatch> {
    // filters with no declared input caps accept anything
    if caps.is_empty() {
        return Some(CapsMatch {
            bundle_idx: 0,
            priority: default_priority,
        });
    }

    let ranges = bundle_ranges(caps);
    // the forced-cap requirement is satisfied once any scanned bundle
    // names the code, in declaration order
    let mut forced_found = forced_cap.is_none();

    for (bidx, range) in ranges.iter().enumerate() {
        let in_target = for_bundle.map(|fb| fb == bidx).unwrap_or(true);

        let mut all_matched = true;
        let mut nb_subcaps = 0usize;
        let mut priority = default_priority;

        for cap in &caps[range.clone()] {
            if !cap.flags.contains(CapFlags::INPUT) {
                // an output-only cap restricted to loaded filters poisons
                // the bundle for generic resolution
                if !skip_explicit_load && cap.flags.contains(CapFlags::LOADED_FILTER) {
                    all_matched = false;
                }
                continue;
            }
            nb_subcaps += 1;

            if !forced_found {
                if let (Some(forced), PropKey::Code(code)) = (forced_cap, &cap.key) {
                    if *code == forced {
                        forced_found = true;
                    }
                }
            }

            if cap.flags.contains(CapFlags::OPTIONAL) {
                continue;
            }
            if !all_matched {
                continue;
            }

            match props.get(&cap.key) {
                Some(pid_val) => {
                    // disjunction across all same-key caps: static ones
                    // anywhere, plus the ones in this bundle
                    let mut prop_equal = false;
                    let mut prop_excluded = false;
                    for (j, a_cap) in caps.iter().enumerate() {
                        if !a_cap.flags.contains(CapFlags::INPUT) {
                            continue;
                        }
                        if a_cap.flags.contains(CapFlags::OPTIONAL) {
                            continue;
                        }
                        if !a_cap.flags.contains(CapFlags::STATIC) && !range.contains(&j) {
                            continue;
                        }
                        if a_cap.key != cap.key {
                            continue;
                        }
                        if !skip_explicit_load
                            && a_cap.flags.contains(CapFlags::LOADED_FILTER)
                            && !is_resolved_destination
                        {
                            prop_equal = false;
                            break;
                        }
                        let equal = pid_val == a_cap.value;
                        if a_cap.flags.contains(CapFlags::EXCLUDED) {
                            if equal {
                                prop_equal = false;
                                prop_excluded = false;
                                break;
                            }
                            prop_excluded = true;
                        } else if equal {
                            prop_equal = true;
                            break;
                        }
                    }
                    if !prop_equal && !prop_excluded {
                        all_matched = false;
                    } else if cap.priority != 0 {
                        priority = cap.priority;
                    }
                }
                None => {
                    if !cap.flags.contains(CapFlags::EXCLUDED) {
                        all_matched = false;
                    }
                }
            }
        }

        if in_target && nb_subcaps > 0 && all_matched && forced_found {
            return Some(CapsMatch {
                bundle_idx: bidx,
                priority,
            });
        }
    }
    None
}

/// Which side of an edge must have been loaded specifically for the link.
pub const EDGE_LOADED_SOURCE_ONLY: u8 = 1;
pub const EDGE_LOADED_DEST_ONLY: u8 = 1 << 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapsToCapsMatch {
    /// Count of matched source output caps, 0 never returned.
    pub score: u32,
    pub dst_bundle_idx: usize,
    pub loaded_filter_flags: u8,
}

/// Scores one source output bundle against every input bundle of a
/// destination capability list.
///
/// Every distinct output capability key of the selected source bundle
/// must find a matching input capability in a destination bundle for that
/// bundle to stay eligible; the surviving bundle with the most matched
/// keys wins.
pub fn caps_to_caps_match(
    src_caps: &[Capability],
    src_bundle_idx: usize,
    dst_caps: &[Capability],
    dst_has_configure: bool,
    for_dst_bundle: Option<usize>,
) -> Option<CapsToCapsMatch> {
    if !has_out_caps(src_caps) {
        return None;
    }

    let dst_ranges = bundle_ranges(dst_caps);
    if dst_ranges.is_empty() {
        // no input caps but a configure callback: assume the connection
        // is possible
        if dst_has_configure {
            return Some(CapsToCapsMatch {
                score: 1,
                dst_bundle_idx: 0,
                loaded_filter_flags: 0,
            });
        }
        return None;
    }

    let src_ranges = bundle_ranges(src_caps);
    let src_range = src_ranges.get(src_bundle_idx)?.clone();

    let nb_in_bundles = dst_ranges.len();
    let mut bundles_in_ok = vec![1u8; nb_in_bundles];
    let mut bundles_in_scores = vec![0u32; nb_in_bundles];

    // candidate source output caps: selected bundle plus static ones
    let src_out_idx: Vec<usize> = src_caps
        .iter()
        .enumerate()
        .filter(|(i, c)| {
            c.flags.contains(CapFlags::OUTPUT)
                && (src_range.contains(i) || c.flags.contains(CapFlags::STATIC))
        })
        .map(|(i, _)| i)
        .collect();

    let mut tested_keys: Vec<&PropKey> = Vec::new();

    for &i in &src_out_idx {
        let out_cap = &src_caps[i];
        if tested_keys.iter().any(|k| **k == out_cap.key) {
            continue;
        }
        tested_keys.push(&out_cap.key);

        // 0 = not found, 1 = found, 2 = found but only for loaded filters
        let mut bundles_cap_found = vec![0u8; nb_in_bundles];
        let mut out_is_loaded_only = false;

        // all output caps with this key in the candidate set form a
        // disjunction
        for &k in &src_out_idx {
            let an_out_cap = &src_caps[k];
            if an_out_cap.key != out_cap.key {
                continue;
            }
            if an_out_cap.flags.contains(CapFlags::LOADED_FILTER) {
                out_is_loaded_only = true;
            }

            for (didx, drange) in dst_ranges.iter().enumerate() {
                if let Some(fd) = for_dst_bundle {
                    if fd != didx {
                        continue;
                    }
                }
                let mut matched = false;
                let mut excluded = false;
                let mut prop_found = false;
                let mut nb_tested = 0usize;
                let mut loaded_only = false;

                for (j, in_cap) in dst_caps.iter().enumerate() {
                    if !in_cap.flags.contains(CapFlags::INPUT) {
                        continue;
                    }
                    if in_cap.flags.contains(CapFlags::OPTIONAL) {
                        continue;
                    }
                    if !drange.contains(&j) && !in_cap.flags.contains(CapFlags::STATIC) {
                        continue;
                    }
                    if excluded || matched {
                        continue;
                    }
                    if in_cap.key != an_out_cap.key {
                        continue;
                    }
                    nb_tested += 1;
                    let equal = in_cap.value == an_out_cap.value;
                    let in_excl = in_cap.flags.contains(CapFlags::EXCLUDED);
                    let out_excl = an_out_cap.flags.contains(CapFlags::EXCLUDED);
                    if in_excl != out_excl {
                        // one side excludes the value: an equal value is a
                        // definitive reject, a different one is acceptable
                        if equal {
                            matched = false;
                            excluded = true;
                            prop_found = false;
                        } else {
                            prop_found = true;
                        }
                    } else if equal {
                        matched = true;
                    } else if in_excl && out_excl {
                        prop_found = true;
                    }
                    if prop_found && in_cap.flags.contains(CapFlags::LOADED_FILTER) {
                        loaded_only = true;
                    }
                }

                if nb_tested > 0 {
                    if !matched && prop_found {
                        matched = true;
                    }
                    if matched && bundles_cap_found[didx] == 0 {
                        bundles_cap_found[didx] = if loaded_only { 2 } else { 1 };
                    }
                }
            }
        }

        for didx in 0..nb_in_bundles {
            if bundles_cap_found[didx] == 0 {
                bundles_in_ok[didx] = 0;
            } else if bundles_in_ok[didx] != 0 {
                bundles_in_scores[didx] += 1;
                if bundles_cap_found[didx] == 2 {
                    bundles_in_ok[didx] |= 1 << 1;
                }
                if out_is_loaded_only {
                    bundles_in_ok[didx] |= 1 << 2;
                }
            }
        }
    }

    let mut best: Option<CapsToCapsMatch> = None;
    for didx in 0..nb_in_bundles {
        if bundles_in_ok[didx] == 0 {
            continue;
        }
        if best.map(|b| b.score < bundles_in_scores[didx]).unwrap_or(true)
            && bundles_in_scores[didx] > 0
        {
            let mut flags = 0u8;
            if bundles_in_ok[didx] & (1 << 1) != 0 {
                flags |= EDGE_LOADED_DEST_ONLY;
            }
            if bundles_in_ok[didx] & (1 << 2) != 0 {
                flags |= EDGE_LOADED_SOURCE_ONLY;
            }
            best = Some(CapsToCapsMatch {
                score: bundles_in_scores[didx],
                dst_bundle_idx: didx,
                loaded_filter_flags: flags,
            });
        }
    }
    best
}

/// Stream type resolved for a source output bundle, used to rule out
/// implicit transmodality during chain resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeStreamType {
    /// No stream type declared.
    Unspecified,
    /// Several distinct types declared (demuxers, codec bundles).
    Ambiguous,
    Known(StreamType),
}

/// Infers the stream type produced by one output bundle: `MIME` and file
/// extension caps imply `File`.
pub fn output_stream_type(caps: &[Capability], out_bundle_idx: usize) -> EdgeStreamType {
    let ranges = bundle_ranges(caps);
    let range = match ranges.get(out_bundle_idx) {
        Some(r) => r.clone(),
        None => return EdgeStreamType::Unspecified,
    };
    let mut seen: Option<StreamType> = None;
    let mut nb_types = 0;
    for (i, cap) in caps.iter().enumerate() {
        if !cap.flags.contains(CapFlags::OUTPUT) {
            continue;
        }
        if !range.contains(&i) && !cap.flags.contains(CapFlags::STATIC) {
            continue;
        }
        if cap.flags.contains(CapFlags::EXCLUDED) {
            continue;
        }
        let stype = match &cap.key {
            PropKey::Code(c) if *c == PID_STREAM_TYPE => match cap.value.stream_type() {
                Some(s) if s != StreamType::Unknown => Some(s),
                _ => None,
            },
            PropKey::Code(c) if *c == PID_MIME || *c == PID_FILE_EXT => Some(StreamType::File),
            _ => None,
        };
        if let Some(s) = stype {
            if seen != Some(s) {
                seen = Some(s);
                nb_types += 1;
            }
        }
    }
    match (nb_types, seen) {
        (1, Some(s)) => EdgeStreamType::Known(s),
        (0, _) => EdgeStreamType::Unspecified,
        _ => EdgeStreamType::Ambiguous,
    }
}

/// True when the bundle declares several output caps with the same key,
/// i.e. the filter cannot decide its output format until it runs.
pub fn out_caps_solved_by_connection(caps: &[Capability], bundle_idx: usize) -> bool {
    let ranges = bundle_ranges(caps);
    let range = match ranges.get(bundle_idx) {
        Some(r) => r.clone(),
        None => return false,
    };
    for (i, cap) in caps.iter().enumerate() {
        if !cap.flags.contains(CapFlags::OUTPUT) {
            continue;
        }
        if !range.contains(&i) && !cap.flags.contains(CapFlags::STATIC) {
            continue;
        }
        let mut nb_same = 0;
        for (j, acap) in caps.iter().enumerate() {
            if !acap.flags.contains(CapFlags::OUTPUT) {
                continue;
            }
            if !range.contains(&j) && !acap.flags.contains(CapFlags::STATIC) {
                continue;
            }
            if acap.key == cap.key {
                nb_same += 1;
            }
            if nb_same > 1 {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::props::{PID_CODEC_ID, PID_STREAM_TYPE};

    fn props(stype: u32, codec: u32) -> PropertyMap {
        let m = PropertyMap::new();
        m.set(PID_STREAM_TYPE.into(), PropValue::Uint(stype));
        m.set(PID_CODEC_ID.into(), PropValue::Uint(codec));
        m
    }

    fn video_raw_inputs() -> Vec<Capability> {
        vec![
            Capability::input(PID_STREAM_TYPE, PropValue::Uint(StreamType::Visual as u32)),
            Capability::input(PID_CODEC_ID, PropValue::Uint(1)),
        ]
    }

    #[test]
    fn direct_bundle_match() {
        let caps = video_raw_inputs();
        let m = pid_caps_match(
            &props(StreamType::Visual as u32, 1),
            None,
            &caps,
            0,
            false,
            false,
            None,
        );
        assert_eq!(m, Some(CapsMatch { bundle_idx: 0, priority: 0 }));
    }

    #[test]
    fn mismatch_rejects() {
        let caps = video_raw_inputs();
        assert!(pid_caps_match(
            &props(StreamType::Audio as u32, 1),
            None,
            &caps,
            0,
            false,
            false,
            None
        )
        .is_none());
    }

    #[test]
    fn second_bundle_selected() {
        let mut caps = video_raw_inputs();
        caps.push(Capability::separator());
        caps.push(Capability::input(
            PID_STREAM_TYPE,
            PropValue::Uint(StreamType::Audio as u32),
        ));
        let m = pid_caps_match(
            &props(StreamType::Audio as u32, 7),
            None,
            &caps,
            0,
            false,
            false,
            None,
        )
        .unwrap();
        assert_eq!(m.bundle_idx, 1);
    }

    #[test]
    fn excluded_cap_inverts() {
        let caps = vec![Capability::input(PID_CODEC_ID, PropValue::Uint(1)).excluded()];
        assert!(pid_caps_match(&props(3, 1), None, &caps, 0, false, false, None).is_none());
        assert!(pid_caps_match(&props(3, 2), None, &caps, 0, false, false, None).is_some());
    }

    #[test]
    fn optional_cap_never_rejects() {
        let caps = vec![
            Capability::input(PID_STREAM_TYPE, PropValue::Uint(StreamType::Visual as u32)),
            Capability::input(crate::props::PID_SAMPLE_RATE, PropValue::Uint(48000)).optional(),
        ];
        assert!(pid_caps_match(
            &props(StreamType::Visual as u32, 1),
            None,
            &caps,
            0,
            false,
            false,
            None
        )
        .is_some());
    }

    #[test]
    fn forced_cap_must_be_named() {
        let caps = video_raw_inputs();
        assert!(pid_caps_match(
            &props(StreamType::Visual as u32, 1),
            Some(crate::props::PID_SAMPLE_RATE),
            &caps,
            0,
            false,
            false,
            None
        )
        .is_none());
        assert!(pid_caps_match(
            &props(StreamType::Visual as u32, 1),
            Some(PID_CODEC_ID),
            &caps,
            0,
            false,
            false,
            None
        )
        .is_some());
    }

    #[test]
    fn caps_to_caps_scores() {
        // demuxer output: video/h264
        let src = vec![
            Capability::output(PID_STREAM_TYPE, PropValue::Uint(StreamType::Visual as u32)),
            Capability::output(PID_CODEC_ID, PropValue::Uint(27)),
        ];
        // decoder input: video/h264 -> video/raw
        let dst = vec![
            Capability::input(PID_STREAM_TYPE, PropValue::Uint(StreamType::Visual as u32)),
            Capability::input(PID_CODEC_ID, PropValue::Uint(27)),
            Capability::output(PID_CODEC_ID, PropValue::Uint(1)),
        ];
        let m = caps_to_caps_match(&src, 0, &dst, true, None).unwrap();
        assert_eq!(m.score, 2);
        assert_eq!(m.dst_bundle_idx, 0);

        // sink wanting raw only does not accept the demuxer output
        let sink = vec![
            Capability::input(PID_STREAM_TYPE, PropValue::Uint(StreamType::Visual as u32)),
            Capability::input(PID_CODEC_ID, PropValue::Uint(1)),
        ];
        assert!(caps_to_caps_match(&src, 0, &sink, true, None).is_none());
    }

    #[test]
    fn stream_type_inference() {
        let demux = vec![
            Capability::input(PID_MIME, PropValue::String("video/mp4".into())),
            Capability::output(PID_STREAM_TYPE, PropValue::Uint(StreamType::Visual as u32)),
            Capability::output(PID_STREAM_TYPE, PropValue::Uint(StreamType::Audio as u32)),
        ];
        assert_eq!(output_stream_type(&demux, 0), EdgeStreamType::Ambiguous);

        let enc = vec![Capability::output(
            PID_STREAM_TYPE,
            PropValue::Uint(StreamType::Audio as u32),
        )];
        assert_eq!(
            output_stream_type(&enc, 0),
            EdgeStreamType::Known(StreamType::Audio)
        );

        let mux = vec![Capability::output(PID_MIME, PropValue::String("video/mp4".into()))];
        assert_eq!(
            output_stream_type(&mux, 0),
            EdgeStreamType::Known(StreamType::File)
        );
    }

    #[test]
    fn undecided_outputs_detected() {
        let demux = vec![
            Capability::output(PID_STREAM_TYPE, PropValue::Uint(StreamType::Visual as u32)),
            Capability::output(PID_STREAM_TYPE, PropValue::Uint(StreamType::Audio as u32)),
        ];
        assert!(out_caps_solved_by_connection(&demux, 0));
        let single = vec![Capability::output(
            PID_STREAM_TYPE,
            PropValue::Uint(StreamType::Audio as u32),
        )];
        assert!(!out_caps_solved_by_connection(&single, 0));
    }
}
