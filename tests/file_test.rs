use std::{fmt::Write as _, path::Path};

use anyhow::{bail, Context};
use mp4_atoms::{Atom, ErrorKind, Mp4File};
use tempfile::TempDir;

const AUDIO_TIME_SCALE: u32 = 8000;
const AUDIO_SAMPLE_DURATION: u64 = 160;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn hex_window(bytes: &[u8], at: usize) -> String {
    let start = at.saturating_sub(8);
    let end = (at + 8).min(bytes.len());
    bytes[start..end]
        .iter()
        .enumerate()
        .fold(String::new(), |mut out, (i, b)| {
            let marker = if start + i == at { "*" } else { "" };
            let _ = write!(out, "{marker}{b:02x} ");
            out
        })
}

fn assert_bytes_equal(actual: &[u8], expected: &[u8]) -> anyhow::Result<()> {
    if let Some(at) = actual.iter().zip(expected).position(|(a, e)| a != e) {
        bail!(
            "bytes differ at offset {at}\n  actual:   {}\n  expected: {}",
            hex_window(actual, at),
            hex_window(expected, at)
        );
    }
    if actual.len() != expected.len() {
        bail!("length differs: actual {} expected {}", actual.len(), expected.len());
    }
    Ok(())
}

fn sample(index: u8) -> Vec<u8> {
    (0..20).map(|i| index.wrapping_mul(31).wrapping_add(i)).collect()
}

/// Writes the audio file used by most tests: 10 samples of 20 bytes, only the first is sync.
fn write_audio_file(path: &Path) -> anyhow::Result<u32> {
    let mut file = Mp4File::create(path).call()?;
    let track = file
        .add_audio_track()
        .time_scale(AUDIO_TIME_SCALE)
        .sample_duration(AUDIO_SAMPLE_DURATION)
        .call()?;
    for i in 0..10 {
        file.write_sample(track, &sample(i)).sync(i == 0).call()?;
    }
    file.close()?;
    Ok(track)
}

/// Checks that every atom's children tile its body.
fn check_layout(atom: &Atom) -> anyhow::Result<()> {
    assert_eq!(atom.start() + atom.size(), atom.end());
    let mut position = atom.children().first().map(Atom::start);
    for child in atom.children() {
        if position != Some(child.start()) {
            bail!("{} starts at {} instead of {:?}", child.atom_type(), child.start(), position);
        }
        position = Some(child.end());
        check_layout(child)?;
    }
    if let Some(end) = position {
        if end > atom.end() && atom.size() > 0 {
            bail!("children of {} overrun it", atom.atom_type());
        }
    }
    Ok(())
}

#[test]
fn test_next_track_id_after_create_and_add() -> anyhow::Result<()> {
    init_tracing();
    let dir = TempDir::new()?;
    let mut file = Mp4File::create(&dir.path().join("ids.mp4")).call()?;
    assert_eq!(file.integer_property("moov.mvhd.nextTrackId")?, 1);
    let track = file.add_track("video", 90000)?;
    assert_eq!(track, 1);
    assert_eq!(file.integer_property("moov.mvhd.nextTrackId")?, 2);
    Ok(())
}

#[test]
fn test_audio_scenario() -> anyhow::Result<()> {
    init_tracing();
    let dir = TempDir::new()?;
    let path = dir.path().join("audio.mp4");
    let track = write_audio_file(&path)?;

    let file = Mp4File::read(&path)?;
    assert_eq!(file.number_of_tracks(None), 1);
    assert_eq!(file.number_of_samples(track)?, 10);
    assert_eq!(file.track_duration(track)?, 1600);
    assert_eq!(file.track_time_scale(track)?, AUDIO_TIME_SCALE);
    assert_eq!(file.track_fixed_sample_duration(track)?, AUDIO_SAMPLE_DURATION);
    assert_eq!(file.duration()?, 200);
    assert_eq!(file.track_integer_property(track, "mdia.minf.stbl.stsz.sampleSize")?, 20);
    assert_eq!(file.track_integer_property(track, "mdia.minf.stbl.stss.entryCount")?, 1);
    assert!(file.is_sync_sample(track, 1)?);
    for id in 2..=10 {
        assert!(!file.is_sync_sample(track, id)?, "sample {id} should not be sync");
    }
    for i in 0..10u8 {
        let id = u32::from(i) + 1;
        assert_eq!(file.sample_size(track, id)?, 20);
        assert_eq!(file.read_sample(track, id)?, sample(i));
        assert_eq!(file.sample_time(track, id)?, u64::from(i) * AUDIO_SAMPLE_DURATION);
    }
    assert_eq!(file.sample_id_from_time(track, 170, false)?, 2);
    assert_eq!(file.sample_id_from_time(track, 0, true)?, 1);
    assert!(file.sample_id_from_time(track, 170, true).is_err());
    Ok(())
}

#[test]
fn test_reserialize_is_byte_identical() -> anyhow::Result<()> {
    init_tracing();
    let dir = TempDir::new()?;
    let path = dir.path().join("roundtrip.mp4");
    write_audio_file(&path)?;
    let bytes = std::fs::read(&path)?;

    let file = Mp4File::read(&path)?;
    check_layout(file.root())?;
    for atom in file.root().children() {
        let start = atom.start() as usize;
        let serialized = atom.to_bytes();
        let original = &bytes[start..start + serialized.len()];
        assert_bytes_equal(&serialized, original)
            .with_context(|| format!("re-serializing {}", atom.atom_type()))?;
    }
    Ok(())
}

#[test]
fn test_track_registry_matches_trak_atoms() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let mut file = Mp4File::create(&dir.path().join("registry.mp4")).call()?;
    file.add_od_track()?;
    file.add_audio_track().time_scale(48000).sample_duration(1024).call()?;
    file.add_video_track()
        .time_scale(90000)
        .sample_duration(3000)
        .width(640)
        .height(480)
        .call()?;
    for index in 0..file.number_of_tracks(None) {
        let id = file.find_track_id(index, None)?;
        let stored = file.integer_property(&format!("moov.trak[{index}].tkhd.trackId"))?;
        assert_eq!(u64::from(id), stored);
    }
    let ids: Vec<u32> = file.track_ids().collect();
    assert_eq!(ids, vec![1, 2, 3]);
    Ok(())
}

#[test]
fn test_add_then_delete_track() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let mut file = Mp4File::create(&dir.path().join("delete.mp4")).call()?;
    file.add_track("audio", 8000)?;
    let before = file.number_of_tracks(None);
    let next = file.integer_property("moov.mvhd.nextTrackId")?;

    let track = file.add_track("video", 90000)?;
    file.delete_track(track)?;
    assert_eq!(file.number_of_tracks(None), before);
    assert!(file.find_atom("moov.trak[1]").is_none());
    assert!(file.integer_property("moov.mvhd.nextTrackId")? > next);
    assert_eq!(file.delete_track(track).unwrap_err().kind(), ErrorKind::InvalidArgument);
    Ok(())
}

#[test]
fn test_session_sdp_round_trip() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("sdp.mp4");
    let mut file = Mp4File::create(&path).call()?;
    assert!(file.find_atom("moov.udta").is_none());
    file.set_session_sdp("v=0\r\n")?;
    file.append_session_sdp("s=session\r\n")?;
    assert!(file.find_atom("moov.udta.hnti.rtp ").is_some());
    file.close()?;

    let file = Mp4File::read(&path)?;
    assert_eq!(file.session_sdp()?, "v=0\r\ns=session\r\n");
    Ok(())
}

#[test]
fn test_modify_appends_track() -> anyhow::Result<()> {
    init_tracing();
    let dir = TempDir::new()?;
    let path = dir.path().join("modify.mp4");
    let audio = write_audio_file(&path)?;

    let mut file = Mp4File::modify(&path)?;
    let video = file.add_track("video", 90000)?;
    file.write_sample(video, b"frame").duration(3000).call()?;
    file.close()?;

    let file = Mp4File::read(&path)?;
    check_layout(file.root())?;
    assert_eq!(file.number_of_tracks(None), 2);
    let last = file.root().children().last().context("empty file")?;
    assert_eq!(last.atom_type().to_string(), "moov");
    assert_eq!(file.read_sample(audio, 10)?, sample(9));
    assert_eq!(file.read_sample(video, 1)?, b"frame");
    Ok(())
}

#[test]
fn test_optimize_puts_hint_chunks_first() -> anyhow::Result<()> {
    init_tracing();
    let dir = TempDir::new()?;
    let path = dir.path().join("hinted.mp4");
    let optimized = dir.path().join("optimized.mp4");

    let mut file = Mp4File::create(&path).call()?;
    let audio = file
        .add_audio_track()
        .time_scale(AUDIO_TIME_SCALE)
        .sample_duration(AUDIO_SAMPLE_DURATION)
        .call()?;
    let hint = file.add_hint_track(audio)?;
    file.set_hint_track_rtp_payload(hint, "L16").call()?;
    file.set_track_samples_per_chunk(audio, 1)?;
    file.set_track_samples_per_chunk(hint, 1)?;
    for i in 0..3u8 {
        let id = file.write_sample(audio, &sample(i)).call()?;
        file.add_rtp_hint(hint).call()?;
        file.add_rtp_packet(hint).marker(true).call()?;
        file.add_rtp_sample_data(hint, id, 0, 20)?;
        file.write_rtp_hint(hint).duration(AUDIO_SAMPLE_DURATION).call()?;
    }
    file.close()?;

    Mp4File::optimize(&path, Some(&optimized))?;
    let file = Mp4File::read(&optimized)?;
    check_layout(file.root())?;
    let order: Vec<String> = file
        .root()
        .children()
        .iter()
        .map(|atom| atom.atom_type().to_string())
        .collect();
    assert_eq!(order, ["ftyp", "moov", "mdat"]);

    let chunk = |track: u32, chunk: u32| -> anyhow::Result<u64> {
        Ok(file.track_integer_property(
            track,
            &format!("mdia.minf.stbl.stco.entries[{}].chunkOffset", chunk - 1),
        )?)
    };
    for id in 1..=3 {
        assert!(chunk(hint, id)? < chunk(audio, id)?, "hint chunk {id} follows its media");
        assert_eq!(file.read_sample(audio, id)?, sample(id as u8 - 1));
    }
    Ok(())
}

#[test]
fn test_optimize_in_place() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("inplace.mp4");
    let track = write_audio_file(&path)?;
    Mp4File::optimize(&path, None)?;

    let file = Mp4File::read(&path)?;
    assert_eq!(file.root().children()[1].atom_type().to_string(), "moov");
    for i in 0..10u8 {
        assert_eq!(file.read_sample(track, u32::from(i) + 1)?, sample(i));
    }
    Ok(())
}

macro_rules! test_property_error {
    ($( $name:ident: $access:ident($path:literal) => $kind:ident ),+ $(,)?) => {
        $(
            #[test]
            fn $name() -> anyhow::Result<()> {
                let dir = TempDir::new()?;
                let path = dir.path().join("errors.mp4");
                write_audio_file(&path)?;
                let file = Mp4File::read(&path)?;
                let err = file.$access($path).unwrap_err();
                assert_eq!(err.kind(), ErrorKind::$kind, "{err}");
                Ok(())
            }
        )+
    };
}

test_property_error!(
    test_missing_atom_not_found: integer_property("moov.nope.value") => NotFound,
    test_missing_property_not_found: integer_property("moov.mvhd.nope") => NotFound,
    test_string_as_integer_mismatch: integer_property("moov.trak.mdia.hdlr.handlerType") => TypeMismatch,
    test_integer_as_string_mismatch: string_property("moov.mvhd.timeScale") => TypeMismatch,
    test_integer_as_float_mismatch: float_property("moov.mvhd.duration") => TypeMismatch,
);

#[test]
fn test_read_mode_rejects_track_changes() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("readonly.mp4");
    write_audio_file(&path)?;
    let mut file = Mp4File::read(&path)?;
    let err = file.add_track("video", 90000).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WriteProtected);
    assert_eq!(err.to_string(), "operation not permitted in read mode: add_track");
    Ok(())
}

#[test]
fn test_missing_file_reports_errno() {
    let err = Mp4File::read("/nonexistent/file.mp4").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);
    assert_eq!(err.errno(), Some(2));
}

#[test]
fn test_top_level_insert_keeps_media_in_mdat() -> anyhow::Result<()> {
    init_tracing();
    let dir = TempDir::new()?;
    let path = dir.path().join("insert.mp4");
    let mut file = Mp4File::create(&path).call()?;
    let track = file
        .add_audio_track()
        .time_scale(AUDIO_TIME_SCALE)
        .sample_duration(AUDIO_SAMPLE_DURATION)
        .call()?;
    for index in [0, 1] {
        let err = file.insert_atom("", b"free", index).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }
    file.insert_atom("", b"free", 2)?;
    for i in 0..5u8 {
        file.write_sample(track, &[i; 100]).call()?;
    }
    file.close()?;

    let file = Mp4File::read(&path)?;
    check_layout(file.root())?;
    let layout: Vec<(String, u64)> = file
        .root()
        .children()
        .iter()
        .map(|atom| (atom.atom_type().to_string(), atom.size()))
        .collect();
    let types: Vec<&str> = layout.iter().map(|(t, _)| t.as_str()).collect();
    assert_eq!(types, ["ftyp", "mdat", "free", "moov"]);
    assert_eq!(layout[1].1, 8 + 500);
    assert_eq!(layout[2].1, 8);
    assert_eq!(file.read_sample(track, 5)?, vec![4; 100]);
    Ok(())
}

#[test]
fn test_setters_reject_mismatched_kinds() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let mut file = Mp4File::create(&dir.path().join("setters.mp4")).call()?;
    file.add_track("audio", 8000)?;

    let err = file
        .set_string_property("moov.mvhd.timeScale", "x")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TypeMismatch, "{err}");
    assert_eq!(file.integer_property("moov.mvhd.timeScale")?, 1000);

    let handler = "moov.trak.mdia.hdlr.handlerType";
    let err = file.set_integer_property(handler, 7).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TypeMismatch, "{err}");
    assert_eq!(file.string_property(handler)?, "soun");
    Ok(())
}

#[test]
fn test_generic_sample_entry_add_leaves_entry_count() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let mut file = Mp4File::create(&dir.path().join("stsd.mp4")).call()?;
    file.add_audio_track().time_scale(8000).sample_duration(160).call()?;
    let stsd = "moov.trak.mdia.minf.stbl.stsd";
    assert_eq!(file.integer_property(&format!("{stsd}.entryCount"))?, 1);

    file.add_atom(stsd, b"mp4a")?;
    assert_eq!(file.find_atom(stsd).context("no stsd")?.children().len(), 2);
    assert_eq!(file.integer_property(&format!("{stsd}.entryCount"))?, 1);
    Ok(())
}

#[test]
fn test_insert_atom_clamps_index() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let mut file = Mp4File::create(&dir.path().join("clamp.mp4")).call()?;
    let inserted = file.insert_atom("moov", b"udta", 99)?;
    assert_eq!(inserted.atom_type().to_string(), "udta");
    let moov = file.find_atom("moov").context("no moov")?;
    let last = moov.children().last().context("empty moov")?;
    assert_eq!(last.atom_type().to_string(), "udta");
    Ok(())
}

#[test]
fn test_moov_insert_keeps_movie_and_tracks_addressable() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let mut file = Mp4File::create(&dir.path().join("moov.mp4")).call()?;
    let audio = file.add_track("audio", 8000)?;

    // ahead of mvhd and of the audio trak
    file.insert_atom("moov", b"udta", 0)?;
    file.insert_atom("moov", b"trak", 1)?;
    file.set_time_scale(600)?;
    assert_eq!(file.integer_property("moov.mvhd.timeScale")?, 600);

    assert_eq!(file.number_of_tracks(None), 1);
    assert_eq!(file.track_integer_property(audio, "tkhd.trackId")?, u64::from(audio));
    assert_eq!(file.integer_property("moov.trak[1].tkhd.trackId")?, u64::from(audio));

    let video = file.add_track("video", 90000)?;
    assert_eq!(file.track_type(video)?, "vide");
    assert_eq!(file.integer_property("moov.trak[2].tkhd.trackId")?, u64::from(video));
    file.delete_track(audio)?;
    assert_eq!(file.track_integer_property(video, "tkhd.trackId")?, u64::from(video));
    Ok(())
}
