//! End-to-end round trips: encode a value graph, replay the reply as wire
//! rows, decode it back, and compare.

use std::sync::Arc;

use filament::decode::{DecodeOptions, Decoder};
use filament::encode::{encode, EncodeOptions};
use filament::error::WireError;
use filament::value::Callable;
use filament::{ElementKind, TemporaryReferenceSet, Value};

async fn roundtrip(value: &Value) -> Value {
    roundtrip_with(value, EncodeOptions::default(), DecodeOptions::default()).await
}

async fn roundtrip_with(
    value: &Value,
    encode_options: EncodeOptions,
    decode_options: DecodeOptions,
) -> Value {
    let reply = encode(value, encode_options).await.expect("encode succeeds");
    let mut decoder = Decoder::new(decode_options);
    decoder.feed_bytes(&reply.into_wire()).expect("wire replays");
    decoder
        .root()
        .try_value()
        .expect("root settles from a complete reply")
        .expect("root decodes")
}

#[tokio::test]
async fn nested_document_round_trips() {
    let value = Value::object(vec![
        ("title", Value::from("quarterly report")),
        (
            "sections",
            Value::list(vec![
                Value::object(vec![
                    ("heading", Value::from("revenue")),
                    ("total", Value::Number(1_284_550.75)),
                ]),
                Value::object(vec![
                    ("heading", Value::from("notes")),
                    ("total", Value::Null),
                ]),
            ]),
        ),
        (
            "tags",
            Value::set(vec![Value::from("q3"), Value::from("final")]),
        ),
        (
            "index",
            Value::map(vec![
                (Value::Number(1.0), Value::from("revenue")),
                (Value::Number(2.0), Value::from("notes")),
            ]),
        ),
        (
            "generated",
            Value::Date(
                chrono::DateTime::from_timestamp_millis(1_714_979_289_100)
                    .expect("valid timestamp"),
            ),
        ),
        ("serial", Value::BigInt("123456789012345678901".into())),
        (
            "checksum",
            Value::bytes(ElementKind::U8, vec![0xde, 0xad, 0xbe, 0xef]),
        ),
        ("missing", Value::Undefined),
    ]);

    let back = roundtrip(&value).await;
    assert!(back.deep_eq(&value), "decoded graph differs: {back:?}");
}

#[tokio::test]
async fn shared_subtree_keeps_identity() {
    let author = Value::object(vec![("name", Value::from("ada"))]);
    let value = Value::object(vec![
        ("created_by", author.clone()),
        ("updated_by", author.clone()),
    ]);

    let back = roundtrip(&value).await;
    assert_eq!(
        back.member("created_by").ptr_token(),
        back.member("updated_by").ptr_token(),
        "both slots must resolve to the same cell"
    );
}

#[tokio::test]
async fn remote_callable_survives_and_invokes() {
    let callable = Value::Callable(Callable::remote(
        "actions#submit",
        Some(Value::list(vec![Value::from("bound-arg")])),
        None,
    ));
    let value = Value::object(vec![("submit", callable)]);
    let reply = encode(&value, EncodeOptions::default())
        .await
        .expect("encode succeeds");

    let mut decoder = Decoder::new(DecodeOptions {
        call_remote: Some(Arc::new(|id, args| {
            Box::pin(async move {
                Ok(Value::list(vec![Value::String(id), Value::Number(args.len() as f64)]))
            })
        })),
        ..Default::default()
    });
    decoder.feed_bytes(&reply.into_wire()).expect("wire replays");

    let root = decoder.root().try_value().expect("settled").expect("decodes");
    let Value::Callable(callable) = root.member("submit") else {
        panic!("submit is not callable: {root:?}");
    };
    assert_eq!(callable.remote_id(), Some("actions#submit"));

    // Bound arguments splice in ahead of call-site arguments.
    let result = callable
        .call(vec![Value::Number(7.0)])
        .await
        .expect("call succeeds");
    assert_eq!(result.member("0"), Value::from("actions#submit"));
    assert_eq!(result.member("1"), Value::Number(2.0));
}

#[tokio::test]
async fn stub_callable_cannot_cross_without_refs() {
    let value = Value::Callable(Callable::stub("() => {}"));
    let err = encode(&value, EncodeOptions::default())
        .await
        .expect_err("local callables must not encode");
    assert!(matches!(err, filament::EncodeError::LocalCallable));
}

#[tokio::test]
async fn symbol_echoes_through_temporary_refs() {
    let refs = Arc::new(TemporaryReferenceSet::new());
    let value = Value::object(vec![("kind", Value::Symbol("custom.marker".into()))]);

    let back = roundtrip_with(
        &value,
        EncodeOptions {
            temporary_refs: Some(refs.clone()),
        },
        DecodeOptions {
            temporary_refs: Some(refs),
            ..Default::default()
        },
    )
    .await;
    assert!(matches!(back.member("kind"), Value::Symbol(name) if name == "custom.marker"));
}

#[tokio::test]
async fn error_value_carries_across() {
    let value = Value::object(vec![(
        "failure",
        Value::Error(
            WireError::Remote {
                name: "RangeError".into(),
                message: "out of bounds".into(),
                digest: Some("abc123".into()),
                env: None,
            }
            .shared(),
        ),
    )]);

    let back = roundtrip(&value).await;
    let Value::Error(error) = back.member("failure") else {
        panic!("failure slot is not an error");
    };
    match &*error {
        WireError::Remote { name, message, digest, .. } => {
            assert_eq!(name, "RangeError");
            assert_eq!(message, "out of bounds");
            assert_eq!(digest.as_deref(), Some("abc123"));
        }
        other => panic!("wrong error family: {other}"),
    }
}

#[tokio::test]
async fn blob_concatenates_on_decode() {
    let value = Value::Blob(filament::value::BlobValue {
        media_type: Some("text/plain".into()),
        data: b"hello blob".to_vec().into(),
    });
    let back = roundtrip(&value).await;
    let Value::Blob(blob) = back else {
        panic!("not a blob: {back:?}");
    };
    assert_eq!(blob.media_type.as_deref(), Some("text/plain"));
    assert_eq!(&blob.data[..], b"hello blob");
}

#[tokio::test]
async fn deferred_parts_flush_before_finish_returns() {
    let value = Value::object(vec![
        ("eager", Value::Number(1.0)),
        (
            "later",
            Value::promise_ready(Value::object(vec![("inner", Value::from("deep"))])),
        ),
    ]);

    let back = roundtrip(&value).await;
    let Value::Promise(handle) = back.member("later") else {
        panic!("later is not a promise");
    };
    let resolved = handle.value().await.expect("promise resolves");
    assert_eq!(resolved.member("inner"), Value::from("deep"));
}

#[tokio::test]
async fn module_rows_load_through_the_hook() {
    let mut decoder = Decoder::new(DecodeOptions {
        load_module: Some(Box::new(|descriptor| {
            let name = match descriptor.member("0") {
                Value::String(s) => s,
                other => panic!("descriptor head: {other:?}"),
            };
            Ok(Value::object(vec![("module", Value::String(name))]))
        })),
        ..Default::default()
    });
    decoder
        .feed_text("1:I[\"widgets\",[\"widgets.js\"],\"default\"]\n0:{\"view\":\"$1\"}\n")
        .expect("rows parse");

    let root = decoder.root().try_value().expect("settled").expect("decodes");
    assert_eq!(root.member("view").member("module"), Value::from("widgets"));
}
