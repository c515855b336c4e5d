//! End-to-end behaviour of the rewind buffer through its public API.
//!
//! Run with: cargo test -p streamcast-rewind --test rewind_scenarios

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use streamcast_rewind::{
    Activity, BufferEvent, Chunk, CodecError, CursorOptions, DisconnectReason, InsertOutcome,
    Position, RewindBuffer, RewindError, RewindSettings, Source, SourceEvent, SourceKind, StreamMetadata,
};

fn settings(seconds: u32, burst: u32) -> RewindSettings {
    RewindSettings {
        seconds,
        burst,
        chunk_duration: 1000,
        hls: false,
    }
}

fn chunk(ts: i64) -> Chunk {
    Chunk::new(ts, 1000, Bytes::from(format!("audio@{ts}")))
}

fn timestamps(buffer: &RewindBuffer) -> Vec<i64> {
    // Offset past the oldest chunk clamps to it; the count covers everything
    buffer
        .range(Position::Offset(i64::MAX), usize::MAX)
        .iter()
        .map(|c| c.ts)
        .collect()
}

#[test]
fn test_basic_retention_evicts_oldest_first() {
    let buffer = RewindBuffer::new("retention", settings(5, 0));
    let evicted = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&evicted);
    buffer.subscribe(Arc::new(move |event: &BufferEvent| {
        if let BufferEvent::Evict(c) = event {
            sink.lock().push(c.ts);
        }
    }));

    for i in 1..=10 {
        assert_eq!(buffer.insert(chunk(i * 1000)), InsertOutcome::Appended);
        assert!(buffer.len() <= 5);
    }

    assert_eq!(timestamps(&buffer), vec![6000, 7000, 8000, 9000, 10000]);
    assert_eq!(*evicted.lock(), vec![1000, 2000, 3000, 4000, 5000]);
}

#[test]
fn test_concurrent_directions_keep_order() {
    let forward = [5000, 6000, 7000];
    let backward = [4000, 3000, 2000];

    // Every interleaving of the two producers, by choosing which steps go first
    for mask in 0u32..(1 << 6) {
        if mask.count_ones() != 3 {
            continue;
        }
        let buffer = RewindBuffer::new("directions", settings(60, 0));
        let (mut f, mut b) = (forward.iter(), backward.iter());
        for step in 0..6 {
            let ts = if mask & (1 << step) != 0 { f.next() } else { b.next() };
            buffer.insert(chunk(*ts.unwrap()));
        }
        assert_eq!(
            timestamps(&buffer),
            vec![2000, 3000, 4000, 5000, 6000, 7000],
            "interleaving {mask:06b}"
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_producers_on_threads() {
    let buffer = RewindBuffer::new("threads", settings(600, 0));
    buffer.insert(chunk(100_000));

    let live = Arc::clone(&buffer);
    let appender = tokio::spawn(async move {
        for i in 1..=100 {
            live.insert(chunk(100_000 + i * 1000));
            tokio::task::yield_now().await;
        }
    });
    let history = Arc::clone(&buffer);
    let prepender = tokio::spawn(async move {
        for i in 1..=99 {
            history.insert(chunk(100_000 - i * 1000));
            tokio::task::yield_now().await;
        }
    });
    appender.await.unwrap();
    prepender.await.unwrap();

    let ts = timestamps(&buffer);
    assert_eq!(ts.len(), 200);
    assert!(ts.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn test_duplicate_insert_keeps_original() {
    let buffer = RewindBuffer::new("dup", settings(60, 0));
    buffer.insert(Chunk::new(1000, 1000, Bytes::from_static(b"original")));
    let outcome = buffer.insert(Chunk::new(1000, 1000, Bytes::from_static(b"impostor")));

    assert_eq!(outcome, InsertOutcome::Duplicate);
    assert_eq!(buffer.len(), 1);
    assert_eq!(buffer.first().unwrap().data, Bytes::from_static(b"original"));
    assert_eq!(buffer.stats().snapshot().duplicates_dropped, 1);
}

#[test]
fn test_mid_range_insert_is_dropped() {
    let buffer = RewindBuffer::new("gap", settings(60, 0));
    buffer.insert(chunk(1000));
    buffer.insert(chunk(3000));

    assert_eq!(buffer.insert(chunk(2000)), InsertOutcome::OutOfOrder);
    assert_eq!(timestamps(&buffer), vec![1000, 3000]);
}

#[tokio::test]
async fn test_snapshot_round_trip_over_stream() {
    let source = RewindBuffer::new("roundtrip", settings(60, 0));
    // Built out of order on purpose
    source.insert(
        Chunk::new(2000, 1000, Bytes::from_static(b"two")).with_meta(StreamMetadata::titled("B")),
    );
    source.insert(
        Chunk::new(3000, 1000, Bytes::from_static(b"three")).with_meta(StreamMetadata {
            title: Some("C".to_string()),
            url: Some("https://example.org/c".to_string()),
        }),
    );
    source.insert(
        Chunk::new(1000, 1000, Bytes::from_static(b"one")).with_meta(StreamMetadata::titled("A")),
    );

    let (mut tx, rx) = tokio::io::duplex(16);
    let writer = source.dump_buffer();
    let write = tokio::spawn(async move { writer.write_to(&mut tx).await });

    let target = RewindBuffer::new("roundtrip", settings(60, 0));
    let summary = target.load_buffer(rx).await.unwrap();
    let written = write.await.unwrap().unwrap();

    assert_eq!(written.records, 3);
    assert_eq!(summary.records, 3);
    for ts in [1000, 2000, 3000] {
        assert_eq!(target.find(ts).unwrap(), source.find(ts).unwrap());
    }
    assert_eq!(target.len(), 3);
}

#[tokio::test]
async fn test_empty_buffer_dumps_nothing() {
    let buffer = RewindBuffer::new("empty", settings(60, 0));
    let writer = buffer.dump_buffer();
    assert!(writer.is_empty());
    assert!(writer.header().is_none());

    let mut out = Vec::new();
    let summary = writer.write_to(&mut out).await.unwrap();
    assert!(out.is_empty());
    assert_eq!(summary.records, 0);
}

#[tokio::test]
async fn test_replay_into_overlapping_store_is_idempotent() {
    let history = RewindBuffer::new("replay", settings(60, 0));
    for i in 1..=4 {
        history.insert(chunk(i * 1000));
    }

    let live = RewindBuffer::new("replay", settings(60, 0));
    for i in 3..=6 {
        live.insert(Chunk::new(i * 1000, 1000, Bytes::from(format!("live@{i}"))));
    }

    let summary = live
        .load_buffer(history.dump_buffer().into_reader())
        .await
        .unwrap();
    assert_eq!(summary.duplicates, 2);
    assert_eq!(summary.inserted, 2);
    assert_eq!(timestamps(&live), vec![1000, 2000, 3000, 4000, 5000, 6000]);
    // Chunks the live side already held are untouched
    assert_eq!(live.find(3000).unwrap().data, Bytes::from("live@3"));

    // A second replay changes nothing
    let again = live
        .load_buffer(history.dump_buffer().into_reader())
        .await
        .unwrap();
    assert_eq!(again.inserted, 0);
    assert_eq!(live.len(), 6);
}

#[tokio::test]
async fn test_truncated_snapshot_keeps_decoded_records() {
    let source = RewindBuffer::new("cut", settings(60, 0));
    for i in 1..=3 {
        source.insert(chunk(i * 1000));
    }
    let mut bytes = Vec::new();
    source.dump_buffer().write_to(&mut bytes).await.unwrap();
    bytes.truncate(bytes.len() - 3);

    let target = RewindBuffer::new("cut", settings(60, 0));
    let err = target.load_buffer(bytes.as_slice()).await.unwrap_err();

    assert!(matches!(err, RewindError::Codec(CodecError::Truncated(_))));
    assert_eq!(timestamps(&target), vec![2000, 3000]);
    assert_eq!(target.activity(), Activity::Idle);
}

#[tokio::test]
async fn test_load_excludes_second_load() {
    let buffer = RewindBuffer::new("busy", settings(60, 0));
    let (tx, rx) = tokio::io::duplex(64);

    let loading = Arc::clone(&buffer);
    let load = tokio::spawn(async move { loading.load_buffer(rx).await });
    tokio::time::timeout(Duration::from_secs(5), async {
        while buffer.activity() != Activity::Loading {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    let err = buffer.load_buffer(&b""[..]).await.unwrap_err();
    assert!(matches!(err, RewindError::AlreadyLoading(_)));
    assert!(matches!(buffer.begin_dump(), Err(RewindError::AlreadyLoading(_))));

    drop(tx);
    load.await.unwrap().unwrap();
    assert!(buffer.begin_dump().is_ok());
}

#[tokio::test]
async fn test_handoff_style_load_while_live() {
    let buffer = RewindBuffer::new("handoff", settings(60, 0));
    let mut listener = buffer.get_cursor("listener", CursorOptions::live());

    let (tx, source) = Source::channel(SourceKind::Primary, 16);
    buffer.attach_source(source);
    tx.send(SourceEvent::Chunk(chunk(10_000))).await.unwrap();

    let first = tokio::time::timeout(Duration::from_secs(5), listener.next_chunk())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.ts, 10_000);

    // History from the outgoing process prepends behind the live edge
    let previous = RewindBuffer::new("handoff", settings(60, 0));
    for i in 5..=9 {
        previous.insert(chunk(i * 1000));
    }
    buffer
        .load_buffer(previous.dump_buffer().into_reader())
        .await
        .unwrap();
    tx.send(SourceEvent::Chunk(chunk(11_000))).await.unwrap();

    let next = tokio::time::timeout(Duration::from_secs(5), listener.next_chunk())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next.ts, 11_000);
    assert_eq!(buffer.first().unwrap().ts, 5000);

    // A late listener gets the restored history through a pump window
    let mut pump = buffer.get_cursor("late", CursorOptions::pump(Some(3)));
    let mut window = Vec::new();
    while let Some(c) = pump.next_chunk().await {
        window.push(c.ts);
    }
    assert_eq!(window, vec![9000, 10_000, 11_000]);
    assert_eq!(pump.disconnect_reason(), Some(DisconnectReason::PumpComplete));

    buffer.close();
    assert_eq!(listener.disconnect_reason(), Some(DisconnectReason::BufferClosed));
    assert!(listener.next_chunk().await.is_none());
}

#[tokio::test]
async fn test_backpressure_monitor_disconnects_slow_listener() {
    let buffer = RewindBuffer::new("slow", settings(60, 5));
    for i in 1..=10 {
        buffer.insert(chunk(i * 1000));
    }
    let mut slow = buffer.get_cursor("slow", CursorOptions::live());
    let mut fast = buffer.get_cursor("fast", CursorOptions::live());
    for _ in 0..5 {
        slow.next_chunk().await.unwrap();
        let c = fast.next_chunk().await.unwrap();
        fast.flushed(c.len());
    }

    let token = tokio_util::sync::CancellationToken::new();
    let monitor = buffer.spawn_backpressure_monitor(Duration::from_millis(10), 16, token.clone());
    tokio::time::timeout(Duration::from_secs(5), slow.closed())
        .await
        .unwrap();
    token.cancel();
    monitor.await.unwrap();

    assert_eq!(slow.disconnect_reason(), Some(DisconnectReason::SlowConsumer));
    assert!(fast.is_connected());
    assert_eq!(buffer.listener_count(), 1);
}
