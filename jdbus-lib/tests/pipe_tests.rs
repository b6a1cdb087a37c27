//! Inbound pipe reassembly through the bus

mod common;

use common::*;
use std::sync::{Arc, Mutex};

#[test]
fn in_order_chunks_are_delivered() {
    let mut bus = core_bus();
    let (descriptor, mut handle) = bus.open_pipe(0).unwrap();
    let host = descriptor.device_id;
    let port = descriptor.port;
    assert_eq!(host, bus.host_device_id());

    bus.process_frame(pipe_frame(host, port, 0, false, b"hello "), 10);
    bus.process_frame(pipe_frame(host, port, 1, false, b"world"), 20);
    bus.process_frame(pipe_frame(host, port, 2, true, b""), 30);

    assert_eq!(
        handle.try_recv(),
        Some(PipeChunk::Data(Bytes::from_static(b"hello ")))
    );
    assert_eq!(
        handle.try_recv(),
        Some(PipeChunk::Data(Bytes::from_static(b"world")))
    );
    assert_eq!(handle.try_recv(), Some(PipeChunk::End(PipeClose::Done)));
    assert_eq!(handle.try_recv(), None);

    // closing removed the pipe; its port is free again
    assert_eq!(bus.open_pipe_count(), 0);
    assert_eq!(bus.stats().pipe_frames, 3);
}

#[test]
fn counter_gap_faults_the_pipe() {
    let mut bus = core_bus();
    let misses: Arc<Mutex<Vec<DispatchMiss>>> = Arc::new(Mutex::new(Vec::new()));
    let tap = misses.clone();
    bus.set_miss_handler(Box::new(move |_, m| tap.lock().unwrap().push(m.clone())));

    let (descriptor, mut handle) = bus.open_pipe(0).unwrap();
    let (host, port) = (descriptor.device_id, descriptor.port);

    bus.process_frame(pipe_frame(host, port, 0, false, b"one"), 10);
    // counter 1 never arrives
    bus.process_frame(pipe_frame(host, port, 2, false, b"three"), 20);

    assert_eq!(
        handle.try_recv(),
        Some(PipeChunk::Data(Bytes::from_static(b"one")))
    );
    assert_eq!(
        handle.try_recv(),
        Some(PipeChunk::End(PipeClose::OutOfOrder {
            expected: 1,
            received: 2
        }))
    );
    // exactly one terminal chunk, then silence
    assert_eq!(handle.try_recv(), None);

    // the fault tore the pipe down, so later frames miss
    bus.process_frame(pipe_frame(host, port, 3, false, b"four"), 30);
    assert!(matches!(
        misses.lock().unwrap()[0],
        DispatchMiss::UnknownPipePort { .. }
    ));
}

#[test]
fn counter_wraps_at_32() {
    let mut bus = core_bus();
    let (descriptor, mut handle) = bus.open_pipe(0).unwrap();
    let (host, port) = (descriptor.device_id, descriptor.port);

    for counter in 0..32u8 {
        bus.process_frame(pipe_frame(host, port, counter, false, &[counter]), 10);
    }
    // after 31 the counter folds back to 0
    bus.process_frame(pipe_frame(host, port, 0, false, b"wrapped"), 20);

    for _ in 0..32 {
        assert!(matches!(handle.try_recv(), Some(PipeChunk::Data(_))));
    }
    assert_eq!(
        handle.try_recv(),
        Some(PipeChunk::Data(Bytes::from_static(b"wrapped")))
    );
}

#[test]
fn idle_pipes_time_out() {
    let mut bus = core_bus();
    let (descriptor, mut handle) = bus.open_pipe(0).unwrap();
    let (host, port) = (descriptor.device_id, descriptor.port);

    bus.process_frame(pipe_frame(host, port, 0, false, b"x"), 10);

    // idle for exactly the timeout is still fine
    bus.sweep(10 + DEFAULT_PIPE_IDLE_TIMEOUT_MS);
    assert_eq!(bus.open_pipe_count(), 1);

    bus.sweep(10 + DEFAULT_PIPE_IDLE_TIMEOUT_MS + 1);
    assert_eq!(bus.open_pipe_count(), 0);
    assert_eq!(bus.stats().pipe_timeouts, 1);

    assert!(matches!(handle.try_recv(), Some(PipeChunk::Data(_))));
    assert_eq!(handle.try_recv(), Some(PipeChunk::End(PipeClose::Timeout)));
    assert_eq!(handle.try_recv(), None);
}

#[test]
fn open_pipe_limit_is_enforced() {
    let registry = Registry::core().unwrap();
    let config = BusConfig {
        max_open_pipes: 2,
        ..BusConfig::default()
    };
    let mut bus = Bus::new(registry, &config);

    let _first = bus.open_pipe(0).unwrap();
    let _second = bus.open_pipe(0).unwrap();
    assert!(matches!(
        bus.open_pipe(0),
        Err(JdError::PipeLimitReached { limit: 2 })
    ));
}

#[test]
fn ports_are_not_reused_while_open() {
    let mut bus = core_bus();
    let (first, _h1) = bus.open_pipe(0).unwrap();
    let (second, _h2) = bus.open_pipe(0).unwrap();
    assert_ne!(first.port, second.port);
}

#[test]
fn dropped_consumer_cancels_the_pipe() {
    let mut bus = core_bus();
    let (descriptor, handle) = bus.open_pipe(0).unwrap();
    let (host, port) = (descriptor.device_id, descriptor.port);
    drop(handle);

    bus.process_frame(pipe_frame(host, port, 0, false, b"into the void"), 10);
    assert_eq!(bus.open_pipe_count(), 0);
}

#[test]
fn frames_for_unopened_ports_miss() {
    let mut bus = core_bus();
    let misses: Arc<Mutex<Vec<DispatchMiss>>> = Arc::new(Mutex::new(Vec::new()));
    let tap = misses.clone();
    bus.set_miss_handler(Box::new(move |_, m| tap.lock().unwrap().push(m.clone())));

    let host = bus.host_device_id();
    bus.process_frame(pipe_frame(host, 42, 0, false, b"nobody home"), 0);

    assert!(matches!(
        misses.lock().unwrap()[0],
        DispatchMiss::UnknownPipePort { port: 42 }
    ));
    assert_eq!(bus.stats().dispatch_misses, 1);
    assert_eq!(bus.stats().pipe_frames, 1);
}

#[test]
fn metadata_frames_are_tagged() {
    let mut bus = core_bus();
    let (descriptor, mut handle) = bus.open_pipe(0).unwrap();
    let (host, port) = (descriptor.device_id, descriptor.port);

    let word = PipeCommand::new()
        .with_counter(0)
        .with_close(false)
        .with_metadata(true)
        .with_port(port)
        .to_command_word();
    bus.process_frame(
        Frame::command(host, SERVICE_INDEX_PIPE, word, Bytes::from_static(b"meta")),
        10,
    );
    bus.process_frame(pipe_frame(host, port, 1, false, b"data"), 20);

    assert_eq!(
        handle.try_recv(),
        Some(PipeChunk::Meta(Bytes::from_static(b"meta")))
    );
    assert_eq!(
        handle.try_recv(),
        Some(PipeChunk::Data(Bytes::from_static(b"data")))
    );
}
