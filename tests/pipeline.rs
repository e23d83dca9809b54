//! End-to-end pipeline scenarios driven through the reference task pump.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use pipegraph::caps::Capability;
use pipegraph::props::{
    PropValue, StreamType, CODEC_RAW, PID_CODEC_ID, PID_MIME, PID_SAMPLE_RATE, PID_STREAM_TYPE,
};
use pipegraph::{Error, FilterRegister, Pid, Session, SessionConfig};

fn init_logger() {
    let _ = env_logger::try_init();
}

type PidSlot = Arc<Mutex<Option<Arc<Pid>>>>;

fn new_slot() -> PidSlot {
    Arc::new(Mutex::new(None))
}

fn uint(v: u32) -> PropValue {
    PropValue::Uint(v)
}

fn stype(t: StreamType) -> PropValue {
    PropValue::Uint(t as u32)
}

/// A source register: creates one output pid with the given properties
/// on its first process cycle and parks it in `slot` for the test to
/// drive.
fn source_register(
    name: &str,
    out_caps: Vec<Capability>,
    props: Vec<(pipegraph::util::FourCC, PropValue)>,
    slot: PidSlot,
) -> Arc<FilterRegister> {
    FilterRegister::builder(name)
        .caps(out_caps)
        .process(move |f| {
            let mut slot = slot.lock().unwrap();
            if slot.is_none() {
                let pid = f.new_output_pid();
                for (code, value) in &props {
                    pid.set_property(*code, value.clone())?;
                }
                *slot = Some(pid);
            }
            Ok(())
        })
        .build()
}

/// A sink register draining its inputs into `seen`.
fn sink_register(
    name: &str,
    in_caps: Vec<Capability>,
    seen: Arc<Mutex<Vec<Bytes>>>,
) -> Arc<FilterRegister> {
    FilterRegister::builder(name)
        .caps(in_caps)
        .configure(|_, _, _| Ok(()))
        .process(move |f| {
            for inst in f.input_pids() {
                while let Some(pck) = inst.get_packet() {
                    seen.lock().unwrap().push(pck.payload().clone());
                    inst.drop_packet();
                }
            }
            Ok(())
        })
        .build()
}

/// A transform register forwarding payloads onto a fresh output pid with
/// the given properties, created when the first packet arrives.
fn transform_register(
    name: &str,
    caps: Vec<Capability>,
    out_props: Vec<(pipegraph::util::FourCC, PropValue)>,
    out_slot: PidSlot,
) -> Arc<FilterRegister> {
    FilterRegister::builder(name)
        .caps(caps)
        .max_extra_pids(4)
        .configure(|_, _, _| Ok(()))
        .process(move |f| {
            for inst in f.input_pids() {
                let out = {
                    let mut slot = out_slot.lock().unwrap();
                    if slot.is_none() && inst.packet_count() > 0 {
                        let pid = f.new_output_pid();
                        for (code, value) in &out_props {
                            pid.set_property(*code, value.clone())?;
                        }
                        *slot = Some(pid);
                    }
                    slot.clone()
                };
                let out = match out {
                    Some(o) => o,
                    None => continue,
                };
                // hold inputs until our output is wired
                if out.num_destinations() == 0 {
                    continue;
                }
                while let Some(pck) = inst.get_packet() {
                    let payload = pck.payload().clone();
                    inst.drop_packet();
                    out.send(out.new_packet(payload))?;
                }
            }
            Ok(())
        })
        .build()
}

fn file_source_caps() -> Vec<Capability> {
    vec![
        Capability::output(PID_STREAM_TYPE, stype(StreamType::File)),
        Capability::output(PID_MIME, PropValue::String("video/mp4".into())),
    ]
}

fn send_data(pid: &Arc<Pid>, data: &'static [u8]) {
    pid.send(pid.new_packet(Bytes::from_static(data))).unwrap();
}

#[test]
fn direct_match_connects_once() {
    init_logger();
    let session = Session::new();
    let src_slot = new_slot();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let src_reg = source_register(
        "rawsrc",
        vec![
            Capability::output(PID_STREAM_TYPE, stype(StreamType::Visual)),
            Capability::output(PID_CODEC_ID, uint(CODEC_RAW)),
        ],
        vec![
            (PID_STREAM_TYPE, stype(StreamType::Visual)),
            (PID_CODEC_ID, uint(CODEC_RAW)),
        ],
        src_slot.clone(),
    );
    let sink_reg = sink_register(
        "vout",
        vec![
            Capability::input(PID_STREAM_TYPE, stype(StreamType::Visual)),
            Capability::input(PID_CODEC_ID, uint(CODEC_RAW)),
        ],
        seen.clone(),
    );
    session.add_registry(src_reg.clone());
    session.add_registry(sink_reg.clone());

    let _src = session.load_filter(&src_reg);
    let sink = session.load_filter(&sink_reg);
    session.run_tasks();

    let pid = src_slot.lock().unwrap().clone().expect("pid created");
    let dests = pid.destinations();
    assert_eq!(dests.len(), 1, "sink connected exactly once");
    let dst_filter = dests[0].filter().unwrap();
    assert!(Arc::ptr_eq(&dst_filter, &sink));
    assert_eq!(sink.num_input_pids(), 1);

    send_data(&pid, b"frame");
    session.run_tasks();
    assert_eq!(seen.lock().unwrap().len(), 1);

    let stats = session.stats_json();
    assert!(stats.contains("vout"));
    assert!(stats.contains("rawsrc"));
}

#[test]
fn chain_resolution_inserts_demux_and_decoder() {
    init_logger();
    let session = Session::new();
    let src_slot = new_slot();
    let demux_out = new_slot();
    let dec_out = new_slot();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let src_reg = source_register(
        "filesrc",
        file_source_caps(),
        vec![
            (PID_STREAM_TYPE, stype(StreamType::File)),
            (PID_MIME, PropValue::String("video/mp4".into())),
        ],
        src_slot.clone(),
    );
    // file -> h264 video
    let demux_reg = transform_register(
        "mp4dmx",
        vec![
            Capability::input(PID_STREAM_TYPE, stype(StreamType::File)),
            Capability::input(PID_MIME, PropValue::String("video/mp4".into())),
            Capability::output(PID_STREAM_TYPE, stype(StreamType::Visual)),
            Capability::output(PID_CODEC_ID, uint(27)),
        ],
        vec![
            (PID_STREAM_TYPE, stype(StreamType::Visual)),
            (PID_CODEC_ID, uint(27)),
        ],
        demux_out.clone(),
    );
    // h264 -> raw video
    let dec_reg = transform_register(
        "vdec",
        vec![
            Capability::input(PID_STREAM_TYPE, stype(StreamType::Visual)),
            Capability::input(PID_CODEC_ID, uint(27)),
            Capability::output(PID_STREAM_TYPE, stype(StreamType::Visual)),
            Capability::output(PID_CODEC_ID, uint(CODEC_RAW)),
        ],
        vec![
            (PID_STREAM_TYPE, stype(StreamType::Visual)),
            (PID_CODEC_ID, uint(CODEC_RAW)),
        ],
        dec_out.clone(),
    );
    let sink_reg = sink_register(
        "vout",
        vec![
            Capability::input(PID_STREAM_TYPE, stype(StreamType::Visual)),
            Capability::input(PID_CODEC_ID, uint(CODEC_RAW)),
        ],
        seen.clone(),
    );

    session.add_registry(src_reg.clone());
    session.add_registry(demux_reg);
    session.add_registry(dec_reg);
    session.add_registry(sink_reg.clone());

    let _src = session.load_filter(&src_reg);
    let sink = session.load_filter(&sink_reg);
    session.run_tasks();

    let pid = src_slot.lock().unwrap().clone().expect("pid created");
    // the demuxer was instantiated dynamically and consumes the source
    assert_eq!(pid.num_destinations(), 1);
    let first_hop = pid.destinations()[0].filter().unwrap();
    assert_eq!(first_hop.register().name, "mp4dmx");

    // push a few file blocks through, the sink must see decoded data
    let src_pid = pid;
    send_data(&src_pid, b"moov");
    send_data(&src_pid, b"mdat");
    session.run_tasks();

    assert_eq!(seen.lock().unwrap().len(), 2);
    assert_eq!(sink.num_input_pids(), 1);
    let sink_in = &sink.input_pids()[0];
    assert_eq!(
        sink_in.get_property(PID_CODEC_ID).and_then(|v| v.as_uint()),
        Some(CODEC_RAW)
    );
    // the decoder output pid feeds the sink
    let dec_pid = dec_out.lock().unwrap().clone().unwrap();
    assert!(Arc::ptr_eq(&dec_pid, &sink_in.pid().unwrap()));
}

#[test]
fn caps_renegotiation_inserts_adaptation_filter() -> anyhow::Result<()> {
    init_logger();
    let session = Session::new();
    let src_slot = new_slot();
    let resample_out = new_slot();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let asked_rate = Arc::new(Mutex::new(None::<u32>));

    // encoder-like source: reconfigure_output refuses, forcing the core
    // to insert an adapter
    let enc_reg = FilterRegister::builder("aenc")
        .caps(vec![Capability::output(
            PID_STREAM_TYPE,
            stype(StreamType::Audio),
        )])
        .process({
            let slot = src_slot.clone();
            move |f| {
                let mut slot = slot.lock().unwrap();
                if slot.is_none() {
                    let pid = f.new_output_pid();
                    pid.set_property(PID_STREAM_TYPE, stype(StreamType::Audio))?;
                    pid.set_property(PID_SAMPLE_RATE, uint(48_000))?;
                    *slot = Some(pid);
                }
                Ok(())
            }
        })
        .reconfigure_output(|_, _| Err(Error::NotSupported))
        .build();

    // resampler: picks the negotiated rate up during configure
    let resample_reg = FilterRegister::builder("resample")
        .caps(vec![
            Capability::input(PID_STREAM_TYPE, stype(StreamType::Audio)),
            Capability::output(PID_STREAM_TYPE, stype(StreamType::Audio)),
        ])
        .configure({
            let asked = asked_rate.clone();
            move |_, inst, is_remove| {
                if !is_remove {
                    if let Some(pid) = inst.pid() {
                        if let Some(rate) = pid.caps_query(PID_SAMPLE_RATE).and_then(|v| v.as_uint())
                        {
                            *asked.lock().unwrap() = Some(rate);
                        }
                    }
                }
                Ok(())
            }
        })
        .process({
            let out_slot = resample_out.clone();
            let asked = asked_rate.clone();
            move |f| {
                for inst in f.input_pids() {
                    let out = {
                        let mut slot = out_slot.lock().unwrap();
                        if slot.is_none() && inst.packet_count() > 0 {
                            let pid = f.new_output_pid();
                            pid.set_property(PID_STREAM_TYPE, stype(StreamType::Audio))?;
                            let rate = asked.lock().unwrap().unwrap_or(48_000);
                            pid.set_property(PID_SAMPLE_RATE, uint(rate))?;
                            *slot = Some(pid);
                        }
                        slot.clone()
                    };
                    let out = match out {
                        Some(o) => o,
                        None => continue,
                    };
                    if out.num_destinations() == 0 {
                        continue;
                    }
                    while let Some(pck) = inst.get_packet() {
                        let payload = pck.payload().clone();
                        inst.drop_packet();
                        out.send(out.new_packet(payload))?;
                    }
                }
                Ok(())
            }
        })
        .reconfigure_output(|_, _| Ok(()))
        .build();

    let sink_reg = sink_register(
        "aout",
        vec![Capability::input(PID_STREAM_TYPE, stype(StreamType::Audio))],
        seen.clone(),
    );

    session.add_registry(enc_reg.clone());
    session.add_registry(resample_reg);
    session.add_registry(sink_reg.clone());

    let enc = session.load_filter(&enc_reg);
    let sink = session.load_filter(&sink_reg);
    session.run_tasks();

    let pid = src_slot.lock().unwrap().clone().expect("pid created");
    assert_eq!(pid.num_destinations(), 1);
    // a couple of packets flow at 48 kHz first
    send_data(&pid, b"pcm0");
    session.run_tasks();
    assert_eq!(seen.lock().unwrap().len(), 1);

    // downstream asks for 44.1 kHz
    let sink_in = sink.input_pids()[0].clone();
    sink_in.negotiate_property(PID_SAMPLE_RATE, uint(44_100))?;
    enc.post_process_task();
    session.run_tasks();

    // the encoder's pid now feeds the resampler, which feeds the sink
    let dests = pid.destinations();
    assert_eq!(dests.len(), 1);
    let adapter = dests[0].filter().unwrap();
    assert_eq!(adapter.register().name, "resample");
    assert_eq!(*asked_rate.lock().unwrap(), Some(44_100));

    // upstream was not reset: the encoder keeps dispatching on the same
    // pid, packets now reach the sink through the adapter
    send_data(&pid, b"pcm1");
    session.run_tasks();
    assert_eq!(seen.lock().unwrap().len(), 2);

    let sink_in = sink.input_pids()[0].clone();
    assert_eq!(
        sink_in.get_property(PID_SAMPLE_RATE).and_then(|v| v.as_uint()),
        Some(44_100)
    );
    // the encoder itself still lives in the session
    assert!(session.filters().iter().any(|f| Arc::ptr_eq(f, &enc)));
    Ok(())
}

#[test]
fn producer_blocks_after_threshold_and_unblocks_on_drop() {
    init_logger();
    let cfg = SessionConfig {
        default_pid_buffer_max_units: 4,
        default_pid_buffer_max_us: 0,
        ..SessionConfig::default()
    };
    let session = Session::with_config(cfg);
    let src_slot = new_slot();
    let produced = Arc::new(AtomicUsize::new(0));

    // producer pushing one packet per process cycle, reposting itself
    let src_reg = FilterRegister::builder("pump")
        .caps(vec![
            Capability::output(PID_STREAM_TYPE, stype(StreamType::Visual)),
            Capability::output(PID_CODEC_ID, uint(CODEC_RAW)),
        ])
        .process({
            let slot = src_slot.clone();
            let produced = produced.clone();
            move |f| {
                let pid = {
                    let mut slot = slot.lock().unwrap();
                    if slot.is_none() {
                        let pid = f.new_output_pid();
                        pid.set_property(PID_STREAM_TYPE, stype(StreamType::Visual))?;
                        pid.set_property(PID_CODEC_ID, uint(CODEC_RAW))?;
                        *slot = Some(pid.clone());
                        pid
                    } else {
                        slot.clone().unwrap()
                    }
                };
                if pid.num_destinations() == 0 {
                    return Ok(());
                }
                pid.send(pid.new_packet(Bytes::from_static(b"payload")))?;
                produced.fetch_add(1, Ordering::SeqCst);
                f.post_process_task();
                Ok(())
            }
        })
        .build();

    // sink that never drops until told to
    let sink_reg = FilterRegister::builder("lazysink")
        .caps(vec![
            Capability::input(PID_STREAM_TYPE, stype(StreamType::Visual)),
            Capability::input(PID_CODEC_ID, uint(CODEC_RAW)),
        ])
        .configure(|_, _, _| Ok(()))
        .process(|_| Ok(()))
        .build();

    session.add_registry(src_reg.clone());
    session.add_registry(sink_reg.clone());
    let src = session.load_filter(&src_reg);
    let sink = session.load_filter(&sink_reg);
    session.run_tasks();

    let pid = src_slot.lock().unwrap().clone().expect("pid created");
    assert_eq!(pid.num_destinations(), 1);

    // kick the pump; it self-reposts and must stop at the threshold
    src.post_process_task();
    session.run_tasks();
    assert_eq!(produced.load(Ordering::SeqCst), 4);
    assert!(pid.would_block());
    let (_, nb_units, _, _) = pid.buffer_occupancy();
    assert_eq!(nb_units, 4);

    // one consumer drop unblocks the producer for exactly one more unit
    let sink_in = sink.input_pids()[0].clone();
    let pck = sink_in.get_packet().expect("queued packet");
    drop(pck);
    sink_in.drop_packet();
    session.run_tasks();
    assert_eq!(produced.load(Ordering::SeqCst), 5);
    assert!(pid.would_block());
}

#[test]
fn zero_thresholds_never_block() {
    init_logger();
    let cfg = SessionConfig {
        default_pid_buffer_max_units: 0,
        default_pid_buffer_max_us: 0,
        ..SessionConfig::default()
    };
    let session = Session::with_config(cfg);
    let src_slot = new_slot();

    let src_reg = source_register(
        "src",
        vec![
            Capability::output(PID_STREAM_TYPE, stype(StreamType::Visual)),
            Capability::output(PID_CODEC_ID, uint(CODEC_RAW)),
        ],
        vec![
            (PID_STREAM_TYPE, stype(StreamType::Visual)),
            (PID_CODEC_ID, uint(CODEC_RAW)),
        ],
        src_slot.clone(),
    );
    let sink_reg = FilterRegister::builder("lazysink")
        .caps(vec![Capability::input(PID_STREAM_TYPE, stype(StreamType::Visual))])
        .configure(|_, _, _| Ok(()))
        .process(|_| Ok(()))
        .build();

    session.add_registry(src_reg.clone());
    session.add_registry(sink_reg.clone());
    let _src = session.load_filter(&src_reg);
    let _sink = session.load_filter(&sink_reg);
    session.run_tasks();

    let pid = src_slot.lock().unwrap().clone().unwrap();
    for _ in 0..64 {
        send_data(&pid, b"x");
    }
    assert!(!pid.would_block());
}

#[test]
fn eos_reaches_every_destination() {
    init_logger();
    let session = Session::new();
    let src_slot = new_slot();
    let seen_a = Arc::new(Mutex::new(Vec::new()));
    let seen_b = Arc::new(Mutex::new(Vec::new()));

    let src_reg = source_register(
        "src",
        vec![
            Capability::output(PID_STREAM_TYPE, stype(StreamType::Audio)),
            Capability::output(PID_CODEC_ID, uint(CODEC_RAW)),
        ],
        vec![
            (PID_STREAM_TYPE, stype(StreamType::Audio)),
            (PID_CODEC_ID, uint(CODEC_RAW)),
        ],
        src_slot.clone(),
    );
    let sink_a = sink_register(
        "sink_a",
        vec![Capability::input(PID_STREAM_TYPE, stype(StreamType::Audio))],
        seen_a.clone(),
    );
    let sink_b = sink_register(
        "sink_b",
        vec![Capability::input(PID_STREAM_TYPE, stype(StreamType::Audio))],
        seen_b.clone(),
    );

    session.add_registry(src_reg.clone());
    session.add_registry(sink_a.clone());
    session.add_registry(sink_b.clone());
    let _src = session.load_filter(&src_reg);
    let fa = session.load_filter(&sink_a);
    let fb = session.load_filter(&sink_b);
    session.run_tasks();

    let pid = src_slot.lock().unwrap().clone().unwrap();
    assert_eq!(pid.num_destinations(), 2);

    send_data(&pid, b"tail");
    pid.set_eos();
    session.run_tasks();

    assert_eq!(seen_a.lock().unwrap().len(), 1);
    assert_eq!(seen_b.lock().unwrap().len(), 1);
    for f in [&fa, &fb] {
        let inst = f.input_pids()[0].clone();
        assert!(inst.is_eos(), "{} did not observe EOS", f.name());
    }
}

#[test]
fn eos_with_no_destination_is_absorbed() {
    init_logger();
    let session = Session::new();
    let src_slot = new_slot();
    let src_reg = source_register(
        "loner",
        vec![Capability::output(PID_STREAM_TYPE, stype(StreamType::Audio))],
        vec![(PID_STREAM_TYPE, stype(StreamType::Audio))],
        src_slot.clone(),
    );
    session.add_registry(src_reg.clone());
    let _src = session.load_filter(&src_reg);
    session.run_tasks();

    let pid = src_slot.lock().unwrap().clone().unwrap();
    pid.set_eos();
    assert!(pid.has_seen_eos());
    assert_eq!(pid.num_destinations(), 0);
}

#[test]
fn cycle_candidates_are_skipped() {
    init_logger();
    let session = Session::new();
    let src_slot = new_slot();
    let mid_out = new_slot();
    let back_out = new_slot();

    // src(audio) -> mid(audio->text) -> back(text->audio). The audio pid
    // produced by `back` matches mid's inputs, but mid sits in its
    // parent chain and must be skipped without a configure call.
    let src_reg = source_register(
        "src",
        vec![Capability::output(PID_STREAM_TYPE, stype(StreamType::Audio))],
        vec![(PID_STREAM_TYPE, stype(StreamType::Audio))],
        src_slot.clone(),
    );
    let mid_reg = transform_register(
        "totext",
        vec![
            Capability::input(PID_STREAM_TYPE, stype(StreamType::Audio)),
            Capability::output(PID_STREAM_TYPE, stype(StreamType::Text)),
        ],
        vec![(PID_STREAM_TYPE, stype(StreamType::Text))],
        mid_out.clone(),
    );
    let back_reg = transform_register(
        "toaudio",
        vec![
            Capability::input(PID_STREAM_TYPE, stype(StreamType::Text)),
            Capability::output(PID_STREAM_TYPE, stype(StreamType::Audio)),
        ],
        vec![(PID_STREAM_TYPE, stype(StreamType::Audio))],
        back_out.clone(),
    );

    session.add_registry(src_reg.clone());
    session.add_registry(mid_reg.clone());
    session.add_registry(back_reg.clone());
    let _src = session.load_filter(&src_reg);
    let mid = session.load_filter(&mid_reg);
    let back = session.load_filter(&back_reg);
    session.run_tasks();

    let src_pid = src_slot.lock().unwrap().clone().unwrap();
    send_data(&src_pid, b"a");
    session.run_tasks();
    // drive until the back filter has produced its audio pid
    send_data(&src_pid, b"b");
    session.run_tasks();

    assert_eq!(mid.num_input_pids(), 1, "mid keeps its single source input");
    assert_eq!(back.num_input_pids(), 1);
    let back_pid = back_out.lock().unwrap().clone().expect("back pid created");
    // the audio pid matches mid's caps but mid is in its parent chain
    assert_eq!(back_pid.num_destinations(), 0);
}

#[test]
fn pid_remove_round_trip_restores_producer_state() {
    init_logger();
    let session = Session::new();
    let src_slot = new_slot();
    let mid_out = new_slot();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let src_reg = source_register(
        "src",
        vec![
            Capability::output(PID_STREAM_TYPE, stype(StreamType::Audio)),
            Capability::output(PID_CODEC_ID, uint(7)),
        ],
        vec![
            (PID_STREAM_TYPE, stype(StreamType::Audio)),
            (PID_CODEC_ID, uint(7)),
        ],
        src_slot.clone(),
    );
    let mid_reg = transform_register(
        "adec",
        vec![
            Capability::input(PID_STREAM_TYPE, stype(StreamType::Audio)),
            Capability::input(PID_CODEC_ID, uint(7)),
            Capability::output(PID_STREAM_TYPE, stype(StreamType::Audio)),
            Capability::output(PID_CODEC_ID, uint(CODEC_RAW)),
        ],
        vec![
            (PID_STREAM_TYPE, stype(StreamType::Audio)),
            (PID_CODEC_ID, uint(CODEC_RAW)),
        ],
        mid_out.clone(),
    );
    let sink_reg = sink_register(
        "aout",
        vec![
            Capability::input(PID_STREAM_TYPE, stype(StreamType::Audio)),
            Capability::input(PID_CODEC_ID, uint(CODEC_RAW)),
        ],
        seen.clone(),
    );
    session.add_registry(src_reg.clone());
    session.add_registry(mid_reg.clone());
    session.add_registry(sink_reg.clone());
    let _src = session.load_filter(&src_reg);
    let mid = session.load_filter(&mid_reg);
    let _sink = session.load_filter(&sink_reg);
    session.run_tasks();

    let src_pid = src_slot.lock().unwrap().clone().unwrap();
    send_data(&src_pid, b"au");
    session.run_tasks();
    assert_eq!(seen.lock().unwrap().len(), 1);

    // the decoder's output pid goes away; its producer keeps its input
    let mid_pid = mid_out.lock().unwrap().clone().unwrap();
    assert_eq!(mid_pid.num_destinations(), 1);
    mid_pid.remove();
    session.run_tasks();

    assert_eq!(mid_pid.num_destinations(), 0);
    let (_, nb_units, _, dur) = mid_pid.buffer_occupancy();
    assert_eq!((nb_units, dur), (0, 0));
    // the decoder still consumes the source
    assert_eq!(mid.num_input_pids(), 1);
    assert_eq!(src_pid.num_destinations(), 1);
}

#[test]
fn property_snapshots_survive_reconfiguration() {
    init_logger();
    let session = Session::new();
    let src_slot = new_slot();
    let flags_seen = Arc::new(Mutex::new(Vec::new()));
    let props_seen = Arc::new(Mutex::new(Vec::new()));

    let src_reg = source_register(
        "src",
        vec![
            Capability::output(PID_STREAM_TYPE, stype(StreamType::Audio)),
            Capability::output(PID_CODEC_ID, uint(CODEC_RAW)),
        ],
        vec![
            (PID_STREAM_TYPE, stype(StreamType::Audio)),
            (PID_CODEC_ID, uint(CODEC_RAW)),
            (PID_SAMPLE_RATE, uint(48_000)),
        ],
        src_slot.clone(),
    );
    let sink_reg = FilterRegister::builder("probe")
        .caps(vec![Capability::input(PID_STREAM_TYPE, stype(StreamType::Audio))])
        .configure(|_, _, _| Ok(()))
        .process({
            let flags_seen = flags_seen.clone();
            let props_seen = props_seen.clone();
            move |f| {
                for inst in f.input_pids() {
                    while let Some(pck) = inst.get_packet() {
                        flags_seen.lock().unwrap().push(pck.flags());
                        props_seen
                            .lock()
                            .unwrap()
                            .push(pck.props().get_code(PID_SAMPLE_RATE));
                        inst.drop_packet();
                    }
                }
                Ok(())
            }
        })
        .build();

    session.add_registry(src_reg.clone());
    session.add_registry(sink_reg.clone());
    let _src = session.load_filter(&src_reg);
    let _sink = session.load_filter(&sink_reg);
    session.run_tasks();

    let pid = src_slot.lock().unwrap().clone().unwrap();
    send_data(&pid, b"a");
    session.run_tasks();

    // info writes do not invalidate the dispatched snapshot
    pid.set_info(PID_SAMPLE_RATE, uint(1)).unwrap();

    // a real property change applies only from the next packet on
    pid.set_property(PID_SAMPLE_RATE, uint(44_100)).unwrap();
    send_data(&pid, b"b");
    session.run_tasks();

    let props = props_seen.lock().unwrap();
    assert_eq!(props[0].clone().and_then(|v| v.as_uint()), Some(48_000));
    assert_eq!(props[1].clone().and_then(|v| v.as_uint()), Some(44_100));
    let flags = flags_seen.lock().unwrap();
    assert!(!flags[0].contains(pipegraph::PacketFlags::PROPS_CHANGED));
    assert!(flags[1].contains(pipegraph::PacketFlags::PROPS_CHANGED));
}

#[test]
fn buffer_units_track_slowest_consumer() {
    init_logger();
    let cfg = SessionConfig {
        default_pid_buffer_max_units: 0,
        default_pid_buffer_max_us: 0,
        ..SessionConfig::default()
    };
    let session = Session::with_config(cfg);
    let src_slot = new_slot();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let src_reg = source_register(
        "src",
        vec![Capability::output(PID_STREAM_TYPE, stype(StreamType::Audio))],
        vec![(PID_STREAM_TYPE, stype(StreamType::Audio))],
        src_slot.clone(),
    );
    // one draining sink, one lazy sink
    let fast_reg = sink_register(
        "fast",
        vec![Capability::input(PID_STREAM_TYPE, stype(StreamType::Audio))],
        seen.clone(),
    );
    let lazy_reg = FilterRegister::builder("lazy")
        .caps(vec![Capability::input(PID_STREAM_TYPE, stype(StreamType::Audio))])
        .configure(|_, _, _| Ok(()))
        .process(|_| Ok(()))
        .build();

    session.add_registry(src_reg.clone());
    session.add_registry(fast_reg.clone());
    session.add_registry(lazy_reg.clone());
    let _src = session.load_filter(&src_reg);
    let _fast = session.load_filter(&fast_reg);
    let _lazy = session.load_filter(&lazy_reg);
    session.run_tasks();

    let pid = src_slot.lock().unwrap().clone().unwrap();
    assert_eq!(pid.num_destinations(), 2);

    for _ in 0..3 {
        send_data(&pid, b"x");
    }
    session.run_tasks();
    // the draining sink consumed everything, the lazy one still holds 3
    assert_eq!(seen.lock().unwrap().len(), 3);

    // the next enqueue reaggregates: the pid count is the maximum across
    // destinations, driven by the slowest consumer
    send_data(&pid, b"x");
    let (_, nb_units, _, _) = pid.buffer_occupancy();
    assert_eq!(nb_units, 4);
    session.run_tasks();
    assert_eq!(seen.lock().unwrap().len(), 4);
}

#[test]
fn clonable_filter_takes_second_stream() {
    init_logger();
    let session = Session::new();
    let slot_a = new_slot();
    let slot_b = new_slot();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let src_a = source_register(
        "src_a",
        vec![Capability::output(PID_STREAM_TYPE, stype(StreamType::Audio))],
        vec![(PID_STREAM_TYPE, stype(StreamType::Audio))],
        slot_a.clone(),
    );
    let src_b = source_register(
        "src_b",
        vec![Capability::output(PID_STREAM_TYPE, stype(StreamType::Audio))],
        vec![(PID_STREAM_TYPE, stype(StreamType::Audio))],
        slot_b.clone(),
    );
    let sink_reg = sink_register(
        "single_in",
        vec![Capability::input(PID_STREAM_TYPE, stype(StreamType::Audio))],
        seen.clone(),
    );
    session.add_registry(src_a.clone());
    session.add_registry(src_b.clone());
    session.add_registry(sink_reg.clone());

    let _fa = session.load_filter(&src_a);
    let _fb = session.load_filter(&src_b);
    let sink = session.load_filter(&sink_reg);
    sink.set_clonable(true);
    session.run_tasks();

    let pid_a = slot_a.lock().unwrap().clone().unwrap();
    let pid_b = slot_b.lock().unwrap().clone().unwrap();
    assert_eq!(pid_a.num_destinations(), 1);
    assert_eq!(pid_b.num_destinations(), 1);
    let fa = pid_a.destinations()[0].filter().unwrap();
    let fb = pid_b.destinations()[0].filter().unwrap();
    // same register, two distinct instances
    assert!(FilterRegister::same(fa.register(), fb.register()));
    assert!(!Arc::ptr_eq(&fa, &fb));
}

#[test]
fn requires_new_instance_clones_destination() {
    init_logger();
    let session = Session::new();
    let slot_a = new_slot();
    let slot_b = new_slot();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let src_a = source_register(
        "src_a",
        vec![Capability::output(PID_STREAM_TYPE, stype(StreamType::Audio))],
        vec![(PID_STREAM_TYPE, stype(StreamType::Audio))],
        slot_a.clone(),
    );
    let src_b = source_register(
        "src_b",
        vec![Capability::output(PID_STREAM_TYPE, stype(StreamType::Audio))],
        vec![(PID_STREAM_TYPE, stype(StreamType::Audio))],
        slot_b.clone(),
    );
    // accepts extra pids per register, but each instance refuses a
    // second one at configure time
    let sink_reg = FilterRegister::builder("one_shot")
        .max_extra_pids(8)
        .caps(vec![Capability::input(PID_STREAM_TYPE, stype(StreamType::Audio))])
        .configure({
            move |f, _inst, is_remove| {
                if !is_remove && f.num_input_pids() > 1 {
                    return Err(Error::RequiresNewInstance);
                }
                Ok(())
            }
        })
        .process({
            let seen = seen.clone();
            move |f| {
                for inst in f.input_pids() {
                    while let Some(pck) = inst.get_packet() {
                        seen.lock().unwrap().push(pck.payload().clone());
                        inst.drop_packet();
                    }
                }
                Ok(())
            }
        })
        .build();

    session.add_registry(src_a.clone());
    session.add_registry(src_b.clone());
    session.add_registry(sink_reg.clone());
    let _fa = session.load_filter(&src_a);
    let _fb = session.load_filter(&src_b);
    let _sink = session.load_filter(&sink_reg);
    session.run_tasks();

    let pid_a = slot_a.lock().unwrap().clone().unwrap();
    let pid_b = slot_b.lock().unwrap().clone().unwrap();
    assert_eq!(pid_a.num_destinations(), 1);
    assert_eq!(pid_b.num_destinations(), 1);
    let fa = pid_a.destinations()[0].filter().unwrap();
    let fb = pid_b.destinations()[0].filter().unwrap();
    assert!(!Arc::ptr_eq(&fa, &fb), "second pid went to a clone");
}

#[test]
fn source_id_directives_gate_connections() {
    init_logger();
    let session = Session::new();
    let slot = new_slot();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let src_reg = source_register(
        "src",
        vec![Capability::output(PID_STREAM_TYPE, stype(StreamType::Audio))],
        vec![(PID_STREAM_TYPE, stype(StreamType::Audio))],
        slot.clone(),
    );
    let sink_reg = sink_register(
        "aout",
        vec![Capability::input(PID_STREAM_TYPE, stype(StreamType::Audio))],
        seen.clone(),
    );
    session.add_registry(src_reg.clone());
    session.add_registry(sink_reg.clone());

    let src = session.load_filter(&src_reg);
    src.set_id("A");
    let sink = session.load_filter(&sink_reg);
    // sink only accepts video pids from A
    sink.set_source_ids("A#video");
    session.run_tasks();

    let pid = slot.lock().unwrap().clone().unwrap();
    assert_eq!(pid.num_destinations(), 0, "audio pid was excluded");

    // matching directive connects
    let session2 = Session::new();
    let slot2 = new_slot();
    let src_reg2 = source_register(
        "src",
        vec![Capability::output(PID_STREAM_TYPE, stype(StreamType::Audio))],
        vec![(PID_STREAM_TYPE, stype(StreamType::Audio))],
        slot2.clone(),
    );
    let sink_reg2 = sink_register(
        "aout",
        vec![Capability::input(PID_STREAM_TYPE, stype(StreamType::Audio))],
        Arc::new(Mutex::new(Vec::new())),
    );
    session2.add_registry(src_reg2.clone());
    session2.add_registry(sink_reg2.clone());
    let src2 = session2.load_filter(&src_reg2);
    src2.set_id("A");
    let sink2 = session2.load_filter(&sink_reg2);
    sink2.set_source_ids("A#audio");
    session2.run_tasks();
    let pid2 = slot2.lock().unwrap().clone().unwrap();
    assert_eq!(pid2.num_destinations(), 1);
}

#[test]
fn play_event_travels_to_source() {
    init_logger();
    let session = Session::new();
    let slot = new_slot();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let events = Arc::new(Mutex::new(Vec::<String>::new()));

    let src_reg = FilterRegister::builder("src")
        .caps(vec![Capability::output(PID_STREAM_TYPE, stype(StreamType::Audio))])
        .process({
            let slot = slot.clone();
            move |f| {
                let mut slot = slot.lock().unwrap();
                if slot.is_none() {
                    let pid = f.new_output_pid();
                    pid.set_property(PID_STREAM_TYPE, stype(StreamType::Audio))?;
                    *slot = Some(pid);
                }
                Ok(())
            }
        })
        .process_event({
            let events = events.clone();
            move |_, evt| {
                events.lock().unwrap().push(evt.name().to_string());
                false
            }
        })
        .build();
    let sink_reg = sink_register(
        "aout",
        vec![Capability::input(PID_STREAM_TYPE, stype(StreamType::Audio))],
        seen.clone(),
    );
    session.add_registry(src_reg.clone());
    session.add_registry(sink_reg.clone());
    let _src = session.load_filter(&src_reg);
    let sink = session.load_filter(&sink_reg);
    session.run_tasks();

    let inst = sink.input_pids()[0].clone();
    inst.send_event(pipegraph::Event::Play { start: 0.0, speed: 1.0 });
    session.run_tasks();

    assert!(events.lock().unwrap().iter().any(|e| e == "PLAY"));
    let pid = slot.lock().unwrap().clone().unwrap();
    send_data(&pid, b"x");
    pid.set_eos();
    session.run_tasks();
    assert_eq!(seen.lock().unwrap().len(), 1);
}
