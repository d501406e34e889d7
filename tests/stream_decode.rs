//! Streamed aggregates arriving as raw rows: readable streams, byte streams,
//! and async iterables.

use filament::decode::{DecodeOptions, Decoder};
use filament::error::WireError;
use filament::{StreamKind, Value};

fn feed(decoder: &mut Decoder, wire: &[u8]) {
    decoder.feed_bytes(wire).expect("rows parse");
}

#[tokio::test]
async fn values_stream_emits_in_row_order() {
    let mut decoder = Decoder::new(DecodeOptions::default());
    feed(&mut decoder, b"0:R\n0:1\n0:\"two\"\n0:{\"n\":3}\n0:C\n");

    let root = decoder.root().try_value().expect("settled").expect("decodes");
    let Value::Stream(stream) = root else {
        panic!("root is not a stream: {root:?}");
    };
    assert_eq!(stream.kind(), StreamKind::Values);

    let items = stream.collect().await.expect("stream closes cleanly");
    assert_eq!(items.len(), 3);
    assert_eq!(items[0], Value::Number(1.0));
    assert_eq!(items[1], Value::from("two"));
    assert_eq!(items[2].member("n"), Value::Number(3.0));
}

#[tokio::test]
async fn blocked_entry_preserves_order() {
    let mut decoder = Decoder::new(DecodeOptions::default());
    // The first entry references chunk 1, which has not arrived; the second
    // is immediately ready. Order must still be first, second.
    feed(&mut decoder, b"0:R\n0:\"$1\"\n0:\"second\"\n0:C\n");

    let root = decoder.root().try_value().expect("settled").expect("decodes");
    let Value::Stream(stream) = root else {
        panic!("root is not a stream");
    };

    feed(&mut decoder, b"1:\"first\"\n");
    let items = stream.collect().await.expect("stream closes cleanly");
    assert_eq!(items, vec![Value::from("first"), Value::from("second")]);
}

#[tokio::test]
async fn byte_stream_carries_binary_rows() {
    let mut decoder = Decoder::new(DecodeOptions::default());
    let mut wire = Vec::new();
    wire.extend_from_slice(b"0:r\n");
    wire.extend_from_slice(b"0:o3,");
    wire.extend_from_slice(b"abc");
    wire.extend_from_slice(b"0:o2,");
    wire.extend_from_slice(b"de");
    wire.extend_from_slice(b"0:C\n");
    feed(&mut decoder, &wire);

    let root = decoder.root().try_value().expect("settled").expect("decodes");
    let Value::Stream(stream) = root else {
        panic!("root is not a stream");
    };
    assert_eq!(stream.kind(), StreamKind::Bytes);

    let items = stream.collect().await.expect("stream closes cleanly");
    let buffers: Vec<&[u8]> = items
        .iter()
        .map(|item| match item {
            Value::Bytes(bytes) => &bytes.data[..],
            other => panic!("not bytes: {other:?}"),
        })
        .collect();
    assert_eq!(buffers, vec![&b"abc"[..], &b"de"[..]]);
}

#[tokio::test]
async fn stream_error_reports_after_buffered_items() {
    let mut decoder = Decoder::new(DecodeOptions::default());
    feed(
        &mut decoder,
        b"0:R\n0:\"ok\"\n0:E{\"name\":\"Boom\",\"message\":\"upstream died\"}\n",
    );

    let root = decoder.root().try_value().expect("settled").expect("decodes");
    let Value::Stream(stream) = root else {
        panic!("root is not a stream");
    };

    match stream.next().await {
        Some(Ok(value)) => assert_eq!(value, Value::from("ok")),
        other => panic!("first item wrong: {other:?}"),
    }
    match stream.next().await {
        Some(Err(error)) => {
            assert!(matches!(&*error, WireError::Remote { message, .. } if message == "upstream died"));
        }
        other => panic!("expected the terminal error: {other:?}"),
    }
}

#[tokio::test]
async fn multi_shot_iterable_replays_from_the_start() {
    let mut decoder = Decoder::new(DecodeOptions::default());
    feed(&mut decoder, b"0:X\n0:10\n0:20\n0:C\n");

    let root = decoder.root().try_value().expect("settled").expect("decodes");
    let Value::AsyncIter(iter) = root else {
        panic!("root is not an iterable: {root:?}");
    };
    assert!(!iter.is_single_shot());

    for _ in 0..2 {
        let mut reader = iter.iterate();
        assert_eq!(reader.next().await.unwrap().unwrap(), Value::Number(10.0));
        assert_eq!(reader.next().await.unwrap().unwrap(), Value::Number(20.0));
        assert!(reader.next().await.is_none());
    }
}

#[tokio::test]
async fn single_shot_iterator_shares_one_cursor() {
    let mut decoder = Decoder::new(DecodeOptions::default());
    feed(&mut decoder, b"0:x\n0:10\n0:20\n0:C\n");

    let root = decoder.root().try_value().expect("settled").expect("decodes");
    let Value::AsyncIter(iter) = root else {
        panic!("root is not an iterator");
    };
    assert!(iter.is_single_shot());

    let mut first = iter.iterate();
    let mut second = iter.iterate();
    assert_eq!(first.next().await.unwrap().unwrap(), Value::Number(10.0));
    // The second reader continues where the first left off.
    assert_eq!(second.next().await.unwrap().unwrap(), Value::Number(20.0));
    assert!(first.next().await.is_none());
}

#[tokio::test]
async fn iterator_close_row_finishes_readers() {
    let mut decoder = Decoder::new(DecodeOptions::default());
    feed(&mut decoder, b"0:x\n0:\"item\"\n");

    let root = decoder.root().try_value().expect("settled").expect("decodes");
    let Value::AsyncIter(iter) = root else {
        panic!("root is not an iterator");
    };
    let mut reader = iter.iterate();
    assert_eq!(reader.next().await.unwrap().unwrap(), Value::from("item"));

    // The close row carries the producer's return value, which is not a
    // yielded item.
    feed(&mut decoder, b"0:C\"done\"\n");
    assert!(reader.next().await.is_none());
}

#[tokio::test]
async fn entries_resolve_references_to_other_chunks() {
    let mut decoder = Decoder::new(DecodeOptions::default());
    feed(
        &mut decoder,
        b"1:{\"kind\":\"shared\"}\n0:X\n0:{\"ref\":\"$1\"}\n0:C\n",
    );

    let root = decoder.root().try_value().expect("settled").expect("decodes");
    let Value::AsyncIter(iter) = root else {
        panic!("root is not an iterable");
    };
    let mut reader = iter.iterate();
    let entry = reader.next().await.unwrap().unwrap();
    assert_eq!(entry.member("ref").member("kind"), Value::from("shared"));
    assert!(reader.next().await.is_none());
}

#[tokio::test]
async fn reading_ahead_of_rows_waits() {
    let mut decoder = Decoder::new(DecodeOptions::default());
    feed(&mut decoder, b"0:x\n");

    let root = decoder.root().try_value().expect("settled").expect("decodes");
    let Value::AsyncIter(iter) = root else {
        panic!("root is not an iterator");
    };
    let mut reader = iter.iterate();

    let pending = tokio::spawn(async move { reader.next().await });
    tokio::task::yield_now().await;
    feed(&mut decoder, b"0:42\n0:C\n");

    let item = pending.await.expect("task runs");
    assert_eq!(item.unwrap().unwrap(), Value::Number(42.0));
}
