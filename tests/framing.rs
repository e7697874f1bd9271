use fitserve::protocol::{
    Feature, FeatureValue, FrameReader, FrameWriter, RawValue, Topic, WriterMessage, WriterParser,
    WriterRecord, decode_messages, encode_messages,
};
use proptest::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn topic() -> impl Strategy<Value = Topic> {
    prop_oneof![
        Just(Topic::Logger),
        Just(Topic::Initialization),
        Just(Topic::Sample),
        Just(Topic::Diagnostic),
    ]
}

fn feature() -> impl Strategy<Value = Feature> {
    let name = prop_oneof![Just(String::new()), "[a-z_]{1,12}"];
    let value = prop_oneof![
        prop::collection::vec(-1.0e12f64..1.0e12, 1..4).prop_map(FeatureValue::DoubleList),
        prop::collection::vec(".{0,40}", 1..4).prop_map(FeatureValue::StringList),
    ];
    (name, value).prop_map(|(name, value)| Feature { name, value })
}

fn message() -> impl Strategy<Value = WriterMessage> {
    (topic(), prop::collection::vec(feature(), 0..6))
        .prop_map(|(topic, feature)| WriterMessage::new(topic, feature))
}

/// Mixed numeric and text messages, deterministic for a given seed.
fn synthetic(n: usize, seed: u64) -> Vec<WriterMessage> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..n)
        .map(|i| {
            if rng.gen_bool(0.3) {
                WriterMessage::strings(Topic::Logger, [format!("Iteration: {i} / {n}")])
            } else {
                WriterMessage::new(
                    Topic::Sample,
                    vec![
                        Feature::named("lp__", rng.gen_range(-10.0..0.0)),
                        Feature::named("y", rng.gen_range(-3.0..3.0)),
                    ],
                )
            }
        })
        .collect()
}

#[test]
fn round_trip_for_empty_single_and_large_sequences() {
    for n in [0, 1, 1000] {
        let messages = synthetic(n, 42);
        let stream = encode_messages(&messages).unwrap();
        assert_eq!(stream.is_empty(), n == 0);
        assert_eq!(decode_messages(&stream).unwrap(), messages, "n = {n}");
    }
}

#[test]
fn appended_streams_concatenate() {
    let first = synthetic(10, 1);
    let second = synthetic(5, 2);
    let mut stream = encode_messages(&first).unwrap();
    stream.extend(encode_messages(&second).unwrap());

    let decoded = decode_messages(&stream).unwrap();
    assert_eq!(decoded.len(), 15);
    assert_eq!(&decoded[..10], first.as_slice());
    assert_eq!(&decoded[10..], second.as_slice());
}

#[test]
fn reader_stops_after_first_bad_frame() {
    let mut stream = encode_messages(&synthetic(3, 7)).unwrap();
    stream.truncate(stream.len() - 1);
    let results: Vec<_> = FrameReader::new(&stream).collect();
    assert_eq!(results.len(), 3);
    assert!(results[..2].iter().all(Result::is_ok));
    assert!(results[2].is_err());
}

#[test]
fn parsed_worker_rows_survive_storage() {
    let mut parser = WriterParser::new();
    let rows = vec![
        WriterRecord::names(Topic::Sample, ["lp__", "y"]),
        WriterRecord::text(Topic::Sample, "Adaptation terminated"),
        WriterRecord::text(Topic::Sample, "Step size = 0.81"),
        WriterRecord::text(Topic::Sample, "Diagonal elements of inverse mass matrix:"),
        WriterRecord::numbers(Topic::Sample, [0.96]),
        WriterRecord::new(Topic::Sample, vec![RawValue::Number(-0.2), RawValue::Number(0.4)]),
    ];
    let mut writer = FrameWriter::new(Vec::new());
    for row in rows {
        if let Some(message) = parser.parse(row) {
            writer.write(&message).unwrap();
        }
    }
    assert_eq!(writer.messages_written(), 5);

    let decoded = decode_messages(&writer.into_inner()).unwrap();
    assert_eq!(decoded[3].feature, vec![Feature::double(0.96)]);
    assert_eq!(decoded[4].value("y"), Some(0.4));
    assert!(!decoded[3].has_field("y"));
}

proptest! {
    #[test]
    fn arbitrary_sequences_round_trip(messages in prop::collection::vec(message(), 0..40)) {
        let stream = encode_messages(&messages).unwrap();
        prop_assert_eq!(decode_messages(&stream).unwrap(), messages);
    }

    #[test]
    fn truncation_is_always_detected(messages in prop::collection::vec(message(), 1..10), cut in 1usize..64) {
        let stream = encode_messages(&messages).unwrap();
        let cut = cut.min(stream.len());
        let truncated = &stream[..stream.len() - cut];
        let decoded: Vec<_> = FrameReader::new(truncated).collect();
        let whole: Vec<WriterMessage> = decoded
            .into_iter()
            .take_while(Result::is_ok)
            .map(Result::unwrap)
            .collect();
        prop_assert!(whole.len() < messages.len());
        prop_assert_eq!(whole.as_slice(), &messages[..whole.len()]);
    }
}
