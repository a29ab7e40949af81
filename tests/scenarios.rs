//! End-to-end scenarios exercising a channel as an external caller would:
//! through `Reader`/`Writer`/`duplex` only, never the crate's private ring
//! math directly.

use serial_test::serial;
use std::process::Command;
use std::time::Duration;

use zerobuffer::duplex::{Client, ImmutableServer};
use zerobuffer::{BufferConfig, ChannelOptions, ProcessingMode, Reader, Writer, ZeroBufferError};

fn unique_name(tag: &str) -> String {
    format!(
        "zb-scenario-{}-{}-{}",
        tag,
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .subsec_nanos()
    )
}

fn pattern(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
}

/// S1: simple write/read with a metadata slab and one frame.
#[test]
#[serial]
fn s1_simple_write_read() {
    let name = unique_name("s1");
    let reader = Reader::create(
        &name,
        BufferConfig::new(1024, 10240),
        ChannelOptions::default(),
    )
    .unwrap();
    let writer = Writer::connect(&name, ChannelOptions::default()).unwrap();

    let metadata = pattern(0, 500);
    writer.set_metadata(&metadata).unwrap();

    let payload = pattern(1, 1024);
    writer.write_frame(&payload).unwrap();

    let view = reader.read_frame(Duration::from_secs(1)).unwrap();
    assert!(view.is_valid());
    assert_eq!(view.len(), 1024);
    assert_eq!(&view.data()[..10], &payload[..10]);
    assert_eq!(view.sequence(), 1);
    drop(view);

    assert_eq!(reader.frames_written(), 1);
    assert_eq!(reader.frames_read(), 1);
    assert_eq!(reader.oieb_snapshot().payload_free_bytes, 10240);
    assert_eq!(reader.get_metadata(), metadata.as_slice());
}

/// S2: 100 frames arrive with strictly increasing sequence numbers.
#[test]
#[serial]
fn s2_sequential_ordering() {
    let name = unique_name("s2");
    let reader = Reader::create(
        &name,
        BufferConfig::new(1024, 10240),
        ChannelOptions::default(),
    )
    .unwrap();
    let writer = Writer::connect(&name, ChannelOptions::default()).unwrap();

    std::thread::spawn(move || {
        for seq in 1u8..=100 {
            writer.write_frame(&pattern(seq, 1024)).unwrap();
        }
    });

    let mut last_sequence = 0u64;
    for seq in 1u8..=100 {
        let view = reader.read_frame(Duration::from_secs(2)).unwrap();
        assert!(view.is_valid());
        assert_eq!(view.sequence(), last_sequence + 1);
        assert_eq!(view.data(), pattern(seq, 1024).as_slice());
        last_sequence = view.sequence();
    }
    assert_eq!(last_sequence, 100);
}

/// S3: a writer blocked on a full ring gets `BufferFull`, and the write that
/// follows a reader's release succeeds immediately.
#[test]
#[serial]
fn s3_backpressure_then_recovery() {
    let name = unique_name("s3");
    let reader = Reader::create(
        &name,
        BufferConfig::new(64, 102400),
        ChannelOptions::default(),
    )
    .unwrap();
    let options = ChannelOptions {
        write_timeout: Duration::from_millis(100),
        ..ChannelOptions::default()
    };
    let writer = Writer::connect(&name, options).unwrap();

    let frame = vec![0xABu8; 1024];
    let mut written = 0;
    let err = loop {
        match writer.write_frame(&frame) {
            Ok(()) => written += 1,
            Err(e) => break e,
        }
    };
    assert!(matches!(err, ZeroBufferError::BufferFull { .. }));
    assert!(written > 0);

    let view = reader.read_frame(Duration::from_secs(1)).unwrap();
    assert!(view.is_valid());
    drop(view);

    writer.write_frame(&frame).unwrap();
}

/// S4: a zero-copy reservation is filled in place and round-trips intact.
#[test]
#[serial]
fn s4_zero_copy() {
    let name = unique_name("s4");
    let reader = Reader::create(
        &name,
        BufferConfig::new(64, 16384),
        ChannelOptions::default(),
    )
    .unwrap();
    let writer = Writer::connect(&name, ChannelOptions::default()).unwrap();

    let expected = pattern(7, 4096);
    {
        let buf = writer.acquire_buffer(4096).unwrap();
        buf.copy_from_slice(&expected);
    }
    writer.commit_frame().unwrap();

    let view = reader.read_frame(Duration::from_secs(1)).unwrap();
    assert!(view.is_valid());
    assert_eq!(view.len(), 4096);
    assert_eq!(view.data(), expected.as_slice());
    assert_eq!(view.data(), pattern(7, 4096).as_slice());
}

/// S5: writing a ninth 100-byte frame after draining the first eight forces
/// a wrap marker traversal, and the frame still arrives intact.
#[test]
#[serial]
fn s5_wrap_around() {
    let name = unique_name("s5");
    let reader = Reader::create(
        &name,
        BufferConfig::new(100, 1000),
        ChannelOptions::default(),
    )
    .unwrap();
    let writer = Writer::connect(&name, ChannelOptions::default()).unwrap();

    for seq in 1u8..=8 {
        writer.write_frame(&pattern(seq, 100)).unwrap();
        let view = reader.read_frame(Duration::from_secs(1)).unwrap();
        assert_eq!(view.data(), pattern(seq, 100).as_slice());
    }

    let ninth = pattern(9, 100);
    writer.write_frame(&ninth).unwrap();
    let view = reader.read_frame(Duration::from_secs(1)).unwrap();
    assert!(view.is_valid());
    assert_eq!(view.data(), ninth.as_slice());
    assert_eq!(view.sequence(), 9);
}

/// S6: a reader detects its writer's death within one liveness tick once the
/// ring has nothing left to deliver.
#[test]
#[serial]
fn s6_writer_crash_is_detected() {
    let name = unique_name("s6");
    let reader = Reader::create(
        &name,
        BufferConfig::new(64, 4096),
        ChannelOptions::default(),
    )
    .unwrap();

    let mut child = Command::new(env!("CARGO_BIN_EXE_zb-crash-writer"))
        .arg(&name)
        .spawn()
        .unwrap();

    let view = reader.read_frame(Duration::from_secs(2)).unwrap();
    assert!(view.is_valid());
    drop(view);

    child.kill().unwrap();
    child.wait().unwrap();

    let err = reader.read_frame(Duration::from_secs(2)).unwrap_err();
    assert!(matches!(err, ZeroBufferError::WriterDead { .. }));
}

/// S7: ten duplex requests of varying sizes all echo back with their
/// request's own sequence number.
#[test]
#[serial]
fn s7_duplex_echo() {
    let name = unique_name("s7");
    let cfg = BufferConfig::new(4096, 1024 * 1024);
    let options = ChannelOptions {
        read_timeout: Duration::from_millis(200),
        ..ChannelOptions::default()
    };

    let server_name = name.clone();
    let (ready_tx, ready_rx) = std::sync::mpsc::channel();
    let handle = std::thread::spawn(move || {
        let server =
            std::sync::Arc::new(ImmutableServer::create(&server_name, cfg, options).unwrap());
        ready_tx.send(std::sync::Arc::clone(&server)).unwrap();
        server
            .start(ProcessingMode::SingleThread, |req| req.to_vec())
            .unwrap();
    });

    let client = Client::create(&name, cfg, options).unwrap();
    let sizes = [1, 1024, 65536, 1024, 1, 65536, 1024, 1, 1, 65536];
    for (i, &size) in sizes.iter().enumerate() {
        let request = pattern(i as u8, size);
        let seq = client.send_request(&request).unwrap();
        let view = client.read(Duration::from_secs(2)).unwrap();
        assert!(view.is_valid());
        assert_eq!(view.data(), request.as_slice());
        assert_eq!(view.sequence(), seq);
    }

    let server = ready_rx.recv().unwrap();
    server.stop();
    drop(client);
    handle.join().unwrap();
}
