//! Receiver behaviour over real record streams: the mirror fed by an
//! actual tailing reader, ordering anomalies, and bucket rotation.

use std::{collections::HashMap, fs, path::Path, sync::Arc};

use logship::{
    config::{FileSpec, StartFrom},
    notify_cmd::CmdNotify,
    reader::FileReader,
    receiver::{
        bucket::{BucketWriter, InputFormat, Schema},
        mirror::MirrorWriter,
        Disposition, PartitionWriter, ReceiveError,
    },
    record::encode_nmsg,
    script::ScriptHost,
    shared::Shared,
    transform::Pipeline,
};

fn spec(path: std::path::PathBuf) -> FileSpec {
    FileSpec {
        file: path,
        topic: "t".into(),
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

fn mirror(dir: &Path) -> MirrorWriter {
    let notify = CmdNotify::new(None, dir, "t", 0);
    MirrorWriter::new(dir, "t", notify).unwrap()
}

/// Round-trip law: the mirror applied to the stream a sender produces
/// yields files byte-identical to the source rotations that ended.
#[test]
fn mirror_round_trips_a_sender_rotation() {
    let source_dir = tempfile::tempdir().unwrap();
    let path = source_dir.path().join("hello.log");
    fs::write(&path, b"hello\n").unwrap();

    let shared = Shared::new();
    let mut reader = reader_for(spec(path.clone()));
    reader.open(&HashMap::new()).unwrap();

    // Two full rotations: hello -> .1, then world -> .2, collecting the
    // wire stream exactly as it would hit the partition.
    let mut payloads: Vec<Vec<u8>> = Vec::new();
    let mut emit = |batch: logship::RecordBatch| {
        payloads.extend(batch.records.iter().map(|r| r.payload.to_vec()));
    };

    reader.tail(&shared, &mut emit).unwrap();
    fs::rename(&path, source_dir.path().join("hello.log.1")).unwrap();
    reader.flag_moved();
    reader.tail(&shared, &mut emit).unwrap();
    reader.commit_rotation(&shared, &mut emit).unwrap();

    fs::write(&path, b"world\n").unwrap();
    assert!(reader.reopen(&shared, &mut emit).unwrap());
    reader.tail(&shared, &mut emit).unwrap();
    fs::rename(&path, source_dir.path().join("hello.log.2")).unwrap();
    reader.flag_moved();
    reader.tail(&shared, &mut emit).unwrap();
    reader.commit_rotation(&shared, &mut emit).unwrap();

    // NMSG hello, END, START, NMSG world, END.
    assert_eq!(payloads.len(), 5);

    let out_dir = tempfile::tempdir().unwrap();
    let mut writer = mirror(out_dir.path());
    for (offset, payload) in payloads.iter().enumerate() {
        writer.write(offset as i64, payload).unwrap();
    }

    let first = fs::read(out_dir.path().join("t/H_hello.log.1")).unwrap();
    assert_eq!(first, b"hello\n");
    let second = fs::read(out_dir.path().join("t/H_hello.log.2")).unwrap();
    assert_eq!(second, b"world\n");
    assert!(!out_dir.path().join("t/H").exists());
}

#[test]
fn mirror_drops_duplicates_and_aborts_on_gaps() {
    let dir = tempfile::tempdir().unwrap();
    let mut writer = mirror(dir.path());

    writer.write(0, &encode_nmsg("H", 0, b"abc\n")).unwrap();
    writer.write(1, &encode_nmsg("H", 4, b"def\n")).unwrap();
    // A replay below the expected position is dropped, not rewritten.
    let disposition = writer.write(2, &encode_nmsg("H", 0, b"abc\n")).unwrap();
    assert_eq!(disposition, Disposition::Ignore);
    writer.on_shutdown().unwrap();
    assert_eq!(fs::read(dir.path().join("t/H")).unwrap(), b"abc\ndef\n");

    // A position past the expected one means lost data: fatal.
    let result = writer.write(3, &encode_nmsg("H", 99, b"zzz\n"));
    assert!(matches!(result, Err(ReceiveError::Gap { .. })));
}

const SCRIPT: &str = r#"
    informat = {"remote_addr", "time_local", "request", "status"}
    timestamp_format = "timelocal"
    delete_request_field = true
    request_map = {uri = "__uri__", method = "__method__"}
    request_type = {status = "i"}
"#;

fn nginx_line(time: &str, uri: &str) -> Vec<u8> {
    let line = format!(r#"10.0.0.1 [02/Apr/2015:{time} +0800] "GET {uri} HTTP/1.1" 200"#);
    encode_nmsg("H", 0, line.as_bytes()).to_vec()
}

/// Scenario: interval 60, delay 10. The 12:05 bucket is finalised once
/// the watermark passes 12:06:00 + 10; the late 12:05:59 record still
/// reaches it through `.last`.
#[test]
fn bucket_rotation_finalises_behind_the_watermark() {
    let dir = tempfile::tempdir().unwrap();
    let script = ScriptHost::from_source(SCRIPT).unwrap();
    let schema = Schema::from_script(&script, InputFormat::Nginx).unwrap();
    let notify = CmdNotify::new(None, dir.path(), "t", 0);
    let mut writer =
        BucketWriter::new(dir.path(), "t", 0, InputFormat::Nginx, schema, 60, 10, notify)
            .unwrap();

    assert_eq!(
        writer.write(10, &nginx_line("12:05:00", "/a")).unwrap(),
        Disposition::Ignore
    );
    assert_eq!(
        writer.write(11, &nginx_line("12:06:05", "/b")).unwrap(),
        Disposition::Ignore
    );
    assert_eq!(
        writer.write(12, &nginx_line("12:05:59", "/late")).unwrap(),
        Disposition::Ignore
    );
    // The watermark passes the grace period: the 12:05 bucket becomes
    // final and its offset commits durably.
    assert_eq!(
        writer.write(13, &nginx_line("12:06:11", "/c")).unwrap(),
        Disposition::Global(12)
    );

    let finished: Vec<_> = fs::read_dir(dir.path().join("t"))
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| {
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            !name.ends_with(".current") && !name.ends_with(".last")
        })
        .collect();
    assert_eq!(finished.len(), 1);
    assert!(finished[0]
        .file_name()
        .unwrap()
        .to_string_lossy()
        .contains("2015-04-02_12-05-00"));

    let content = fs::read_to_string(&finished[0]).unwrap();
    let lines: Vec<_> = content.lines().collect();
    assert_eq!(lines.len(), 2);
    for json_line in &lines {
        let value: serde_json::Value = serde_json::from_str(json_line).unwrap();
        assert_eq!(value["status"], 200);
        assert_eq!(value["method"], "GET");
        assert!(value.get("request").is_none());
    }
    assert!(lines[1].contains("/late"));
}
