//! Signature probing across the registry and a small chunked load.

use um_formats::{load_module, LoadOptions, MemReader, ModError, Registry};
use um_formats::samples::UNCLICK_FRAMES;
use um_ir::ModuleFlags;

fn with_signature(at: usize, sig: &[u8]) -> Vec<u8> {
    let mut data = vec![0u8; 2048];
    data[at..at + sig.len()].copy_from_slice(sig);
    data
}

#[test]
fn signatures_pick_their_loader() {
    let mut gdm = with_signature(0, b"GDM\xfe");
    gdm[71..75].copy_from_slice(b"GMFS");
    let cases = [
        (with_signature(0, b"IMPM"), "IT"),
        (with_signature(0x2c, b"SCRM"), "S3M"),
        (with_signature(0, b"MMD1"), "MED"),
        (with_signature(0, b"OKTASONG"), "OKT"),
        (with_signature(0, b"AMF\x0e"), "AMF"),
        (gdm, "GDM"),
        (with_signature(0x3c, b"IM10"), "IMF"),
        (with_signature(0, b"MTM"), "MTM"),
        (with_signature(0, b"UN05"), "UNI"),
        (with_signature(0, b"APUN\x01\x04"), "UNI"),
    ];
    let reg = Registry::with_all();
    for (data, tag) in &cases {
        assert_eq!(reg.identify(&mut MemReader::new(data)), Some(*tag));
    }
}

#[test]
fn unknown_uni_revision_is_rejected() {
    let reg = Registry::with_all();
    let data = with_signature(0, b"UN07");
    assert_eq!(reg.identify(&mut MemReader::new(&data)), None);
}

fn chunk(out: &mut Vec<u8>, id: &[u8; 4], body: &[u8]) {
    out.extend_from_slice(id);
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(body);
}

fn oktalyzer(rows: u16) -> Vec<u8> {
    let mut data = b"OKTASONG".to_vec();
    // second voice doubled
    chunk(&mut data, b"CMOD", &[0, 0, 0, 1, 0, 0, 0, 0]);
    let mut samp = vec![0u8; 32];
    samp[..5].copy_from_slice(b"bassy");
    samp[20..24].copy_from_slice(&4u32.to_be_bytes());
    samp[29] = 40;
    chunk(&mut data, b"SAMP", &samp);
    chunk(&mut data, b"SPEE", &[0, 4]);
    chunk(&mut data, b"SLEN", &[0, 1]);
    chunk(&mut data, b"PLEN", &[0, 1]);
    chunk(&mut data, b"PATT", &[0u8; 128]);
    let mut body = rows.to_be_bytes().to_vec();
    body.resize(2 + rows as usize * 5 * 4, 0);
    chunk(&mut data, b"PBOD", &body);
    chunk(&mut data, b"SBOD", &[1, 2, 3, 4]);
    data
}

#[test]
fn oktalyzer_chunks_load() {
    let data = oktalyzer(16);
    let loaded = load_module(&data, LoadOptions::default()).expect("load");
    let m = &loaded.module;
    assert_eq!(loaded.loader, "OKT");
    assert_eq!(m.format, "Amiga Oktalyzer");
    assert_eq!(m.num_channels, 5);
    assert_eq!(m.num_tracks, 5);
    assert_eq!(m.pattern_rows[0], 16);
    assert_eq!(m.initial_speed, 4);
    assert!(m.flags.contains(ModuleFlags::PANNING));
    assert_eq!(m.samples[0].name, "bassy");
    assert_eq!(m.samples[0].length, 3);
    assert_eq!(m.samples[0].pcm.len(), 3 + UNCLICK_FRAMES);
}

#[test]
fn oktalyzer_without_order_list_fails() {
    let mut data = oktalyzer(16);
    let at = data
        .windows(4)
        .position(|w| w == b"PATT")
        .expect("PATT chunk");
    data[at..at + 4].copy_from_slice(b"XATT");
    assert_eq!(
        load_module(&data, LoadOptions::default()).err(),
        Some(ModError::LoadingHeader)
    );
}

#[test]
fn oktalyzer_zero_speed_keeps_default() {
    let mut data = oktalyzer(16);
    let at = data
        .windows(4)
        .position(|w| w == b"SPEE")
        .expect("SPEE chunk");
    data[at + 8..at + 10].copy_from_slice(&[0, 0]);
    let loaded = load_module(&data, LoadOptions::default()).expect("load");
    assert_eq!(loaded.module.initial_speed, 6);
}
