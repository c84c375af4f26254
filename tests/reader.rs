//! Tail and rotation behaviour against real files.

use std::{collections::HashMap, fs, io::Write, path::PathBuf, sync::Arc, time::Duration};

use logship::{
    config::{FileSpec, StartFrom},
    reader::FileReader,
    record::{parse_wire, MetaEvent, WireMessage},
    shared::Shared,
    transform::Pipeline,
    RecordBatch,
};

fn spec(path: PathBuf) -> FileSpec {
    FileSpec {
        file: path,
        topic: "basic".into(),
        startpos: StartFrom::Start,
        partition: None,
        autoparti: false,
        rawcopy: false,
        autocreat: false,
        file_with_time_format: false,
        timeidx: None,
        withhost: true,
        withtime: true,
        autonl: true,
        pkey: None,
        md5sum: true,
        filter: None,
        grep: None,
        transform: None,
        aggregate: None,
        script: None,
    }
}

fn reader_for(spec_value: FileSpec) -> FileReader {
    let host: Arc<str> = Arc::from("H");
    let pipeline = Pipeline::new(&spec_value, Arc::clone(&host), None);
    FileReader::new(0, spec_value, host, pipeline, false)
}

fn collect(reader: &mut FileReader, shared: &Shared) -> Vec<RecordBatch> {
    let mut batches = Vec::new();
    reader
        .tail(shared, &mut |batch| batches.push(batch))
        .unwrap();
    batches
}

fn payloads(batches: &[RecordBatch]) -> Vec<Vec<u8>> {
    batches
        .iter()
        .flat_map(|b| b.records.iter().map(|r| r.payload.to_vec()))
        .collect()
}

#[test]
fn plain_copy_frames_each_line_with_its_offset() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("basic.log");
    fs::write(&path, b"abc\ndef\n").unwrap();

    let shared = Shared::new();
    let mut reader = reader_for(spec(path));
    reader.open(&HashMap::new()).unwrap();
    let batches = collect(&mut reader, &shared);

    assert_eq!(
        payloads(&batches),
        vec![
            b"*H@0000000000000 abc\n".to_vec(),
            b"*H@0000000000004 def\n".to_vec(),
        ]
    );
    assert!(reader.eof);
    assert_eq!(reader.position(), 8);
}

#[test]
fn raw_copy_ships_the_window_as_one_record() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("basic.log");
    fs::write(&path, b"abc\ndef\n").unwrap();

    let mut raw_spec = spec(path);
    raw_spec.rawcopy = true;
    let shared = Shared::new();
    let mut reader = reader_for(raw_spec);
    reader.open(&HashMap::new()).unwrap();
    let batches = collect(&mut reader, &shared);

    assert_eq!(payloads(&batches), vec![b"*H@0000000000000 abc\ndef\n".to_vec()]);
}

#[test]
fn empty_file_at_end_policy_is_silent_until_append() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("quiet.log");
    fs::write(&path, b"").unwrap();

    let mut end_spec = spec(path.clone());
    end_spec.startpos = StartFrom::End;
    let shared = Shared::new();
    let mut reader = reader_for(end_spec);
    reader.open(&HashMap::new()).unwrap();
    assert!(collect(&mut reader, &shared).is_empty());

    let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(b"late\n").unwrap();
    let batches = collect(&mut reader, &shared);
    assert_eq!(payloads(&batches), vec![b"*H@0000000000000 late\n".to_vec()]);
}

#[test]
fn log_start_resumes_from_saved_offset() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("resume.log");
    fs::write(&path, b"old\nnew\n").unwrap();
    let inode = std::os::unix::fs::MetadataExt::ino(&fs::metadata(&path).unwrap());

    let mut resume_spec = spec(path);
    resume_spec.startpos = StartFrom::LogStart;
    let shared = Shared::new();
    let mut reader = reader_for(resume_spec);
    reader.open(&HashMap::from([(inode, 4u64)])).unwrap();
    let batches = collect(&mut reader, &shared);
    assert_eq!(payloads(&batches), vec![b"*H@0000000000004 new\n".to_vec()]);
}

#[test]
fn rename_rotation_emits_end_then_start() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hello.log");
    fs::write(&path, b"hello\n").unwrap();

    let shared = Shared::new();
    let mut reader = reader_for(spec(path.clone()));
    reader.open(&HashMap::new()).unwrap();
    let first = collect(&mut reader, &shared);
    assert_eq!(payloads(&first), vec![b"*H@0000000000000 hello\n".to_vec()]);
    let old_inode = reader.inode();

    // Rotate: rename away, then recreate with fresh content.
    let moved = dir.path().join("hello.log.old");
    fs::rename(&path, &moved).unwrap();
    reader.flag_moved();
    fs::write(&path, b"world\n").unwrap();

    // Old descriptor is drained; the rotation commits after the delay.
    assert!(collect(&mut reader, &shared).is_empty());
    assert!(reader.rotation_due(Duration::from_secs(0)));

    let mut batches = Vec::new();
    let meta = reader
        .commit_rotation(&shared, &mut |batch| batches.push(batch))
        .expect("rotation must emit END");
    assert_eq!(meta.event, MetaEvent::End);
    assert_eq!(meta.size, Some(6));
    assert_eq!(meta.lines, Some(1));
    assert_eq!(meta.file.as_deref(), Some(moved.to_str().unwrap()));
    // md5 of "hello\n".
    assert_eq!(meta.md5.as_deref(), Some("b1946ac92492d2347c6235b4d2611184"));

    let end_payload = batches[0].records[0].payload.clone();
    match parse_wire(&end_payload).unwrap() {
        WireMessage::Meta { host, meta } => {
            assert_eq!(host, "H");
            assert_eq!(meta.event, MetaEvent::End);
        }
        other => panic!("unexpected {other:?}"),
    }

    // Reopen picks up the replacement and announces START.
    let mut batches = Vec::new();
    assert!(reader
        .reopen(&shared, &mut |batch| batches.push(batch))
        .unwrap());
    assert_ne!(reader.inode(), old_inode);
    match parse_wire(&batches[0].records[0].payload).unwrap() {
        WireMessage::Meta { meta, .. } => assert_eq!(meta.event, MetaEvent::Start),
        other => panic!("unexpected {other:?}"),
    }

    let batches = collect(&mut reader, &shared);
    let records: Vec<_> = batches.iter().flat_map(|b| b.records.iter()).collect();
    assert_eq!(&records[0].payload[..], b"*H@0000000000000 world\n");
    assert_eq!(records[0].advance, Some(6));
    assert_eq!(records[0].inode, reader.inode());
}

#[test]
fn truncation_rotates_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trunc.log");
    fs::write(&path, b"one\ntwo\n").unwrap();

    let shared = Shared::new();
    let mut reader = reader_for(spec(path.clone()));
    reader.open(&HashMap::new()).unwrap();
    collect(&mut reader, &shared);

    fs::write(&path, b"x\n").unwrap();
    reader.inspect_rotation();
    assert!(reader.flags.truncated || reader.flags.inode_changed);
    assert!(reader.rotation_due(Duration::from_secs(3600)));

    let mut batches = Vec::new();
    reader.commit_rotation(&shared, &mut |batch| batches.push(batch));
    assert!(reader
        .reopen(&shared, &mut |batch| batches.push(batch))
        .unwrap());
    let after = collect(&mut reader, &shared);
    let last = payloads(&after);
    assert_eq!(last, vec![b"*H@0000000000000 x\n".to_vec()]);
}

#[test]
fn partial_trailing_line_is_delivered_before_end() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("partial.log");
    fs::write(&path, b"full\npartial").unwrap();

    let shared = Shared::new();
    let mut reader = reader_for(spec(path.clone()));
    reader.open(&HashMap::new()).unwrap();
    let first = collect(&mut reader, &shared);
    assert_eq!(payloads(&first), vec![b"*H@0000000000000 full\n".to_vec()]);

    fs::rename(&path, dir.path().join("partial.log.1")).unwrap();
    reader.flag_moved();
    collect(&mut reader, &shared);

    let mut batches = Vec::new();
    let meta = reader
        .commit_rotation(&shared, &mut |batch| batches.push(batch))
        .unwrap();
    // The buffered tail goes out before END, newline appended on the
    // wire but counted at its true size.
    assert_eq!(meta.size, Some(12));
    assert_eq!(meta.lines, Some(2));
    let all = payloads(&batches);
    assert_eq!(all[0], b"*H@0000000000005 partial\n".to_vec());
}

#[test]
fn fanout_successors_see_identical_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.log");
    fs::write(&path, b"alpha\nbeta\n").unwrap();

    let host: Arc<str> = Arc::from("H");
    let primary_spec = spec(path.clone());
    let mut successor_spec = spec(path);
    successor_spec.topic = "copy".into();

    let mut primary = FileReader::new(
        0,
        primary_spec.clone(),
        Arc::clone(&host),
        Pipeline::new(&primary_spec, Arc::clone(&host), None),
        false,
    );
    primary.successors.push(FileReader::new(
        1,
        successor_spec.clone(),
        Arc::clone(&host),
        Pipeline::new(&successor_spec, Arc::clone(&host), None).for_successor(),
        true,
    ));

    let shared = Shared::new();
    primary.open(&HashMap::new()).unwrap();
    let batches = collect(&mut primary, &shared);

    let by_spec = |idx: usize| -> Vec<Vec<u8>> {
        batches
            .iter()
            .filter(|b| b.spec == idx)
            .flat_map(|b| b.records.iter().map(|r| r.payload.to_vec()))
            .collect()
    };
    // Byte-identical framing, independent pipelines.
    assert_eq!(by_spec(0), by_spec(1));
    assert!(!by_spec(0).is_empty());

    // Only the primary drives the offset store.
    let successor_advances: Vec<_> = batches
        .iter()
        .filter(|b| b.spec == 1)
        .flat_map(|b| b.records.iter().map(|r| r.advance))
        .collect();
    assert!(successor_advances.iter().all(Option::is_none));
    let primary_advances: Vec<_> = batches
        .iter()
        .filter(|b| b.spec == 0)
        .flat_map(|b| b.records.iter().map(|r| r.advance))
        .collect();
    assert_eq!(primary_advances.last(), Some(&Some(11)));
}

#[test]
fn digest_covers_the_exact_source_range() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("digest.log");
    let content = b"one\n\ntwo\nthree\n";
    fs::write(&path, content).unwrap();

    let shared = Shared::new();
    let mut reader = reader_for(spec(path.clone()));
    reader.open(&HashMap::new()).unwrap();
    collect(&mut reader, &shared);

    fs::rename(&path, dir.path().join("digest.log.1")).unwrap();
    reader.flag_moved();
    let meta = reader
        .commit_rotation(&shared, &mut |_| {})
        .expect("end marker");

    use md5::Digest as _;
    let expected = format!("{:x}", md5::Md5::digest(content));
    assert_eq!(meta.md5.as_deref(), Some(expected.as_str()));
    assert_eq!(meta.size, Some(content.len() as u64));
}
