//! End-to-end loads of small synthetic Scream Tracker 3 and Impulse
//! Tracker modules.

use um_formats::samples::UNCLICK_FRAMES;
use um_formats::{load_module, LoadOptions, ModError};
use um_ir::{Opcode, SampleFlags};

fn put_u16(data: &mut [u8], at: usize, v: u16) {
    data[at..at + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(data: &mut [u8], at: usize, v: u32) {
    data[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

/// Grow `data` to the next 16-byte boundary.
fn align_paragraph(data: &mut Vec<u8>) {
    let len = (data.len() + 15) & !15;
    data.resize(len, 0);
}

/// One channel, one empty sample and one pattern with C-4 on row 0.
fn scream3(orders: &[u8]) -> Vec<u8> {
    let mut data = vec![0u8; 0x60];
    data[..6].copy_from_slice(b"orders");
    data[0x1c] = 0x1a;
    data[0x1d] = 16;
    put_u16(&mut data, 0x20, orders.len() as u16);
    put_u16(&mut data, 0x22, 1);
    put_u16(&mut data, 0x24, 1);
    put_u16(&mut data, 0x28, 0x1320);
    put_u16(&mut data, 0x2a, 2);
    data[0x2c..0x30].copy_from_slice(b"SCRM");
    data[0x30] = 64;
    data[0x31] = 6;
    data[0x32] = 125;
    // only the first channel is enabled
    data[0x40..0x60].fill(255);
    data[0x40] = 0;

    data.extend_from_slice(orders);
    let para_at = data.len();
    data.extend_from_slice(&[0; 4]);
    align_paragraph(&mut data);

    let sample_at = data.len();
    data.resize(sample_at + 80, 0);
    data[sample_at] = 1;
    data[sample_at + 0x1c] = 64;
    data[sample_at + 0x4c..sample_at + 0x50].copy_from_slice(b"SCRS");
    align_paragraph(&mut data);

    let pattern_at = data.len();
    let mut packed = vec![0x20, 0x40, 1, 0];
    packed.resize(packed.len() + 63, 0);
    data.extend_from_slice(&((packed.len() + 2) as u16).to_le_bytes());
    data.extend_from_slice(&packed);

    put_u16(&mut data, para_at, (sample_at >> 4) as u16);
    put_u16(&mut data, para_at + 2, (pattern_at >> 4) as u16);
    data
}

/// One channel, one IT-packed 8-bit sample and one pattern.
fn impulse(orders: &[u8]) -> Vec<u8> {
    let mut data = vec![0u8; 0xc0];
    data[..4].copy_from_slice(b"IMPM");
    data[4..11].copy_from_slice(b"packing");
    put_u16(&mut data, 0x20, orders.len() as u16);
    put_u16(&mut data, 0x22, 0);
    put_u16(&mut data, 0x24, 1);
    put_u16(&mut data, 0x26, 1);
    put_u16(&mut data, 0x28, 0x0214);
    put_u16(&mut data, 0x2a, 0x0214);
    // stereo, no instruments
    put_u16(&mut data, 0x2c, 1);
    data[0x30] = 128;
    data[0x32] = 6;
    data[0x33] = 125;
    data[0x40..0x80].fill(32);
    data[0x80..0xc0].fill(64);

    data.extend_from_slice(orders);
    let para_at = data.len();
    data.extend_from_slice(&[0; 8]);

    let sample_at = data.len();
    data.resize(sample_at + 80, 0);
    data[sample_at..sample_at + 4].copy_from_slice(b"IMPS");
    data[sample_at + 0x11] = 64;
    // has data, compressed
    data[sample_at + 0x12] = 1 | 8;
    data[sample_at + 0x13] = 64;
    data[sample_at + 0x14..sample_at + 0x19].copy_from_slice(b"delta");
    // signed
    data[sample_at + 0x2e] = 1;
    data[sample_at + 0x2f] = 32;
    put_u32(&mut data, sample_at + 0x30, 2);
    put_u32(&mut data, sample_at + 0x3c, 8363);

    let pattern_at = data.len();
    // channel 1 with a new mask: note 60, instrument 1
    let mut packed = vec![0x81, 0x03, 60, 1, 0];
    packed.resize(packed.len() + 63, 0);
    data.extend_from_slice(&(packed.len() as u16).to_le_bytes());
    data.extend_from_slice(&64u16.to_le_bytes());
    data.extend_from_slice(&[0; 4]);
    data.extend_from_slice(&packed);

    // one block of two 9-bit deltas of +1
    let body_at = data.len();
    data.extend_from_slice(&[0x03, 0x00, 0x01, 0x02, 0x00]);

    put_u32(&mut data, sample_at + 0x48, body_at as u32);
    put_u32(&mut data, para_at, sample_at as u32);
    put_u32(&mut data, para_at + 4, pattern_at as u32);
    data
}

fn first_row(m: &um_ir::Module) -> Vec<(Opcode, u16)> {
    let track = m.pattern_track(0, 0).expect("track");
    let row = track.rows().next().expect("row");
    row.events().map(|e| (e.opcode, e.operand)).collect()
}

#[test]
fn s3m_loads_used_channels_only() {
    let data = scream3(&[0, 255]);
    let loaded = load_module(&data, LoadOptions::default()).expect("load");
    let m = &loaded.module;
    assert_eq!(loaded.loader, "S3M");
    assert_eq!(m.title, "orders");
    assert_eq!(m.format, "Screamtracker 3.20");
    assert_eq!(m.num_channels, 1);
    assert_eq!(m.num_tracks, 1);
    assert_eq!(m.order(), &[0]);
    assert_eq!(
        first_row(m),
        vec![(Opcode::Instrument, 0), (Opcode::Note, 48)]
    );
}

#[test]
fn s3m_end_marker_stops_orders_unless_curious() {
    let data = scream3(&[0, 255, 0, 255]);
    let strict = load_module(&data, LoadOptions::default()).expect("load");
    assert_eq!(strict.module.order(), &[0]);

    let curious = load_module(&data, LoadOptions::default().curious(true)).expect("load");
    assert_eq!(curious.module.num_positions, 2);
    assert_eq!(curious.module.order(), &[0, 0]);
}

#[test]
fn s3m_leading_end_marker_has_no_positions() {
    let data = scream3(&[255, 0]);
    assert_eq!(
        load_module(&data, LoadOptions::default()).err(),
        Some(ModError::LoadingHeader)
    );
    let curious = load_module(&data, LoadOptions::default().curious(true)).expect("load");
    assert_eq!(curious.module.order(), &[0]);
}

#[test]
fn it_packed_sample_is_decoded() {
    let data = impulse(&[0, 255]);
    let loaded = load_module(&data, LoadOptions::default()).expect("load");
    let m = &loaded.module;
    assert_eq!(loaded.loader, "IT");
    assert_eq!(m.title, "packing");
    assert_eq!(m.num_channels, 1);
    assert_eq!(m.num_tracks, 1);
    assert_eq!(
        first_row(m),
        vec![(Opcode::Note, 60), (Opcode::Instrument, 0)]
    );

    let s = &m.samples[0];
    assert_eq!(s.name, "delta");
    assert!(s.in_flags.contains(SampleFlags::ITPACKED));
    assert!(s.flags.contains(SampleFlags::BITS16 | SampleFlags::SIGNED));
    assert_eq!(s.pcm.len(), 2 + UNCLICK_FRAMES);
    assert_eq!(&s.pcm[..2], &[256, 512]);
    assert!(s.pcm[2..].iter().all(|&v| v == 0));
}

#[test]
fn it_end_marker_stops_orders_unless_curious() {
    let data = impulse(&[0, 255, 0, 255]);
    let strict = load_module(&data, LoadOptions::default()).expect("load");
    assert_eq!(strict.module.order(), &[0]);

    let curious = load_module(&data, LoadOptions::default().curious(true)).expect("load");
    assert_eq!(curious.module.order(), &[0, 0]);
}

#[test]
fn it_leading_end_marker_has_no_positions() {
    let data = impulse(&[255]);
    assert_eq!(
        load_module(&data, LoadOptions::default()).err(),
        Some(ModError::LoadingHeader)
    );
}
