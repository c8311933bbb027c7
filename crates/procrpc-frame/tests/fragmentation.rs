//! Packet assembly must not depend on how the byte stream is split.

use bytes::BytesMut;
use procrpc_frame::{FrameConfig, Framer};
use proptest::prelude::*;
use serde_json::{json, Value};

fn packet_values() -> impl Strategy<Value = Vec<Value>> {
    prop::collection::vec(
        prop_oneof![
            any::<i64>().prop_map(|n| json!(n)),
            any::<bool>().prop_map(|b| json!(b)),
            ".{0,40}".prop_map(|s| json!(s)),
            (any::<u64>(), "[a-z]{1,12}").prop_map(|(id, name)| {
                json!({"type": "job", "handle": id, "method": name, "args": [id % 100]})
            }),
        ],
        1..12,
    )
}

fn encode_all(framer: &Framer, values: &[Value]) -> Vec<u8> {
    let mut stream = BytesMut::new();
    for value in values {
        framer
            .encode_into(value, &mut stream)
            .expect("values should encode");
    }
    stream.to_vec()
}

proptest! {
    #[test]
    fn packets_survive_any_fragmentation(
        values in packet_values(),
        cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..20),
    ) {
        let mut framer = Framer::with_config(FrameConfig { max_buffer: 1 << 20 });
        let stream = encode_all(&framer, &values);

        let mut points: Vec<usize> = cuts.iter().map(|i| i.index(stream.len() + 1)).collect();
        points.push(0);
        points.push(stream.len());
        points.sort_unstable();
        points.dedup();

        let mut decoded = Vec::new();
        for window in points.windows(2) {
            framer
                .feed(&stream[window[0]..window[1]])
                .expect("feed should stay under the limit");
            while framer.has_packet() {
                decoded.push(framer.take_packet().expect("packet should decode"));
            }
        }

        prop_assert_eq!(decoded, values);
        prop_assert!(framer.is_empty());
    }

    #[test]
    fn byte_at_a_time_matches_single_feed(values in packet_values()) {
        let mut whole = Framer::with_config(FrameConfig { max_buffer: 1 << 20 });
        let mut split = Framer::with_config(FrameConfig { max_buffer: 1 << 20 });
        let stream = encode_all(&whole, &values);

        whole.feed(&stream).expect("feed should succeed");
        let mut from_whole = Vec::new();
        while whole.has_packet() {
            from_whole.push(whole.take_packet().expect("packet should decode"));
        }

        let mut from_split = Vec::new();
        for byte in &stream {
            split.feed(std::slice::from_ref(byte)).expect("feed should succeed");
            if split.has_packet() {
                from_split.push(split.take_packet().expect("packet should decode"));
            }
        }

        prop_assert_eq!(from_whole, from_split);
    }
}
