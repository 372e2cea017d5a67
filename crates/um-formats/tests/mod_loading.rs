//! End-to-end loads of small synthetic Protracker modules.

use um_formats::{
    load_module, load_title, ByteReader, LoadOptions, MemReader, ModError, Registry,
};
use um_formats::samples::UNCLICK_FRAMES;
use um_ir::{Opcode, SampleFlags};

const PATTERN_BYTES: usize = 64 * 4 * 4;

/// A "M.K." module with `patterns` empty patterns and the given order list.
fn build_mod(title: &str, orders: &[u8], song_length: u8, patterns: usize) -> Vec<u8> {
    let mut data = vec![0u8; 1084];
    data[..title.len()].copy_from_slice(title.as_bytes());
    data[950] = song_length;
    data[952..952 + orders.len()].copy_from_slice(orders);
    data[1080..1084].copy_from_slice(b"M.K.");
    data.resize(1084 + patterns * PATTERN_BYTES, 0);
    data
}

fn set_cell(data: &mut [u8], pattern: usize, row: usize, channel: usize, cell: [u8; 4]) {
    let at = 1084 + pattern * PATTERN_BYTES + (row * 4 + channel) * 4;
    data[at..at + 4].copy_from_slice(&cell);
}

#[test]
fn minimal_module_loads() {
    let data = build_mod("TESTSONG", &[0], 1, 1);
    let reg = Registry::with_all();
    assert_eq!(reg.identify(&mut MemReader::new(&data)), Some("MOD"));

    let loaded = load_module(&data, LoadOptions::default()).expect("load");
    let m = &loaded.module;
    assert_eq!(loaded.loader, "MOD");
    assert_eq!(m.title, "TESTSONG");
    assert_eq!(m.format, "Protracker");
    assert_eq!(m.num_channels, 4);
    assert_eq!(m.num_patterns, 1);
    assert_eq!(m.num_tracks, 4);
    assert_eq!(m.num_positions, 1);
    assert_eq!((m.initial_speed, m.initial_tempo), (6, 125));
    assert!(m.tracks.iter().all(|t| t.is_some()));
}

#[test]
fn corrupted_magic_is_not_a_module() {
    let mut data = build_mod("TESTSONG", &[0], 1, 1);
    data[1080..1084].copy_from_slice(b"XXXX");
    let reg = Registry::with_all();
    assert_eq!(reg.identify(&mut MemReader::new(&data)), None);
    assert_eq!(
        load_module(&data, LoadOptions::default()).err(),
        Some(ModError::NotAModule)
    );
}

#[test]
fn too_many_channels_is_not_a_module() {
    let mut data = build_mod("wide", &[0], 1, 1);
    data[1080..1084].copy_from_slice(b"99CH");
    let reg = Registry::with_all();
    assert_eq!(reg.identify(&mut MemReader::new(&data)), None);
    assert_eq!(
        load_module(&data, LoadOptions::default()).err(),
        Some(ModError::NotAModule)
    );
}

#[test]
fn empty_rows_collapse_into_runs() {
    let data = build_mod("runs", &[0], 1, 1);
    let loaded = load_module(&data, LoadOptions::default()).expect("load");
    let track = loaded.module.tracks[0].as_ref().expect("track");
    let rows: Vec<_> = track.rows().collect();
    // 64 identical rows, at most 8 per stored row
    assert_eq!(rows.len(), 8);
    assert!(rows.iter().all(|r| r.repeat == 7));
    assert_eq!(track.row_count(), 64);
}

#[test]
fn notes_become_bytecode() {
    let mut data = build_mod("notes", &[0], 1, 1);
    // sample 1 needs a body or the note is cut
    data[42..44].copy_from_slice(&1u16.to_be_bytes());
    // sample 1, period 428 (C-3), effect C 0x20
    set_cell(&mut data, 0, 0, 1, [0x01, 0xac, 0x1c, 0x20]);
    data.extend_from_slice(&[0, 0]);
    let loaded = load_module(&data, LoadOptions::default()).expect("load");
    let track = loaded.module.pattern_track(0, 1).expect("track");
    let first = track.rows().next().expect("row");
    let events: Vec<_> = first.events().map(|e| e.opcode).collect();
    assert_eq!(events, vec![Opcode::Instrument, Opcode::Note, Opcode::PtEffectC]);
    assert_eq!(first.repeat, 0);
}

#[test]
fn short_pattern_is_corrupt() {
    let mut data = build_mod("short", &[0], 1, 1);
    data.pop();
    assert_eq!(
        load_module(&data, LoadOptions::default()).err(),
        Some(ModError::LoadingPattern)
    );
}

#[test]
fn curious_keeps_trailing_orders() {
    let data = build_mod("tail", &[0, 1], 1, 2);
    let strict = load_module(&data, LoadOptions::default()).expect("load");
    assert_eq!(strict.module.num_positions, 1);
    assert_eq!(strict.module.num_patterns, 2);

    let curious = load_module(&data, LoadOptions::default().curious(true)).expect("load");
    assert_eq!(curious.module.num_positions, 2);
    assert_eq!(curious.module.order(), &[0, 1]);
}

#[test]
fn loop_end_is_clamped_to_length() {
    let mut data = build_mod("loop", &[0], 1, 1);
    // sample 1: 2 words long, loop from word 1 for 4 words, volume 64
    let s = 20;
    data[s + 22..s + 24].copy_from_slice(&2u16.to_be_bytes());
    data[s + 25] = 64;
    data[s + 26..s + 28].copy_from_slice(&1u16.to_be_bytes());
    data[s + 28..s + 30].copy_from_slice(&4u16.to_be_bytes());
    data.extend_from_slice(&[0, 10, 20, 30]);

    let loaded = load_module(&data, LoadOptions::default()).expect("load");
    let q = &loaded.module.samples[0];
    assert_eq!(q.length, 4);
    assert_eq!((q.loop_start, q.loop_end), (2, 4));
    assert!(q.in_flags.contains(SampleFlags::LOOP));
    assert_eq!(q.pcm.len(), q.length as usize + UNCLICK_FRAMES);
    assert_eq!(&q.pcm[..4], &[0, 10 << 8, 20 << 8, 30 << 8]);
    // the margin replays the loop from its start
    assert_eq!(&q.pcm[4..8], &[20 << 8, 30 << 8, 20 << 8, 30 << 8]);
    assert!(loaded.skipped_samples.is_empty());
}

#[test]
fn title_matches_full_load() {
    let data = build_mod("same title", &[0], 1, 1);
    let full = load_module(&data, LoadOptions::default()).expect("load");
    assert_eq!(load_title(&data).as_deref(), Some(full.module.title.as_str()));
}

#[test]
fn probing_is_repeatable() {
    let data = build_mod("probe", &[0], 1, 1);
    let reg = Registry::with_all();
    let mut r = MemReader::new(&data);
    for loader in reg.loaders() {
        r.rewind_to_start();
        let first = loader.test(&mut r);
        r.rewind_to_start();
        assert_eq!(loader.test(&mut r), first, "{} probe changed", loader.tag());
    }
}
