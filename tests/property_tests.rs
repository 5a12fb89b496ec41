//! Property-based tests for the envelope codec, stream framing and selection

use gametunnel_client::selection::{rank, select};
use gametunnel_core::frame::split_frame;
use gametunnel_core::{
    CandidateEndpoint, Control, Destination, Envelope, EnvelopeError, Frame, decode, encode,
};
use proptest::prelude::*;

fn destination() -> impl Strategy<Value = Destination> {
    prop_oneof![
        ("[a-z][a-z0-9.-]{0,40}", any::<u16>()).prop_map(|(host, port)| Destination::new(host, port)),
        any::<std::net::SocketAddr>().prop_map(Destination::from),
    ]
}

fn envelope() -> impl Strategy<Value = Envelope> {
    (destination(), prop::collection::vec(any::<u8>(), 0..512))
        .prop_map(|(destination, payload)| Envelope::new(destination, payload))
}

proptest! {
    #[test]
    fn prop_decode_inverts_encode(
        destination in destination(),
        payload in prop::collection::vec(any::<u8>(), 0..2048),
    ) {
        let wire = encode(&payload, &destination);
        prop_assert_eq!(wire.len(), 8 + destination.to_string().len() + payload.len());

        let (decoded_payload, decoded_destination) = decode(&wire).unwrap();
        prop_assert_eq!(decoded_payload, payload);
        prop_assert_eq!(decoded_destination, destination);
    }

    #[test]
    fn prop_strict_prefix_never_decodes(envelope in envelope(), cut in any::<prop::sample::Index>()) {
        let wire = envelope.encode();
        let cut = cut.index(wire.len());
        prop_assert!(Envelope::decode(&wire[..cut]).is_err());
    }

    #[test]
    fn prop_trailing_bytes_rejected(
        envelope in envelope(),
        extra in prop::collection::vec(any::<u8>(), 1..32),
    ) {
        let mut wire = envelope.encode();
        wire.extend_from_slice(&extra);

        prop_assert_eq!(
            Envelope::decode(&wire),
            Err(EnvelopeError::TrailingBytes(extra.len()))
        );
        let (prefix, consumed) = Envelope::decode_prefix(&wire).unwrap();
        prop_assert_eq!(prefix, envelope);
        prop_assert_eq!(consumed, wire.len() - extra.len());
    }

    #[test]
    fn prop_arbitrary_bytes_never_panic(data in prop::collection::vec(any::<u8>(), 0..256)) {
        if let Ok(envelope) = Envelope::decode(&data) {
            prop_assert_eq!(Envelope::decode(&envelope.encode()).unwrap(), envelope);
        }
    }

    #[test]
    fn prop_stream_reassembly_any_chunking(
        envelopes in prop::collection::vec(envelope(), 1..8),
        keepalives in prop::collection::vec(any::<bool>(), 8),
        chunk in 1usize..64,
    ) {
        let mut stream = Vec::new();
        let mut expected = Vec::new();
        for (envelope, keepalive) in envelopes.into_iter().zip(keepalives) {
            if keepalive {
                stream.extend_from_slice(Control::Keepalive.as_bytes());
                expected.push(Frame::Control(Control::Keepalive));
            }
            stream.extend_from_slice(&envelope.encode());
            expected.push(Frame::Envelope(envelope));
        }

        let mut buf = Vec::new();
        let mut frames = Vec::new();
        for piece in stream.chunks(chunk) {
            buf.extend_from_slice(piece);
            while let Some(frame) = split_frame(&mut buf, Control::Keepalive).unwrap() {
                frames.push(frame);
            }
        }

        prop_assert!(buf.is_empty());
        prop_assert_eq!(frames, expected);
    }

    #[test]
    fn prop_select_picks_minimum_finite_latency(
        latencies in prop::collection::vec(
            prop_oneof![3 => 0.0f64..1000.0, 1 => Just(f64::INFINITY)],
            0..12,
        ),
    ) {
        let endpoints: Vec<CandidateEndpoint> = latencies
            .iter()
            .enumerate()
            .map(|(i, ms)| {
                CandidateEndpoint::new(format!("relay-{i}"), "127.0.0.1", 8080).with_latency(*ms)
            })
            .collect();

        let best = latencies
            .iter()
            .copied()
            .filter(|ms| ms.is_finite())
            .fold(None, |acc: Option<f64>, ms| Some(acc.map_or(ms, |a| a.min(ms))));

        match (select(&endpoints), best) {
            (Ok(chosen), Some(min)) => prop_assert_eq!(chosen.latency_ms, min),
            (Err(_), None) => {}
            (result, best) => prop_assert!(false, "select {:?} vs minimum {:?}", result.map(|e| &e.name), best),
        }

        let ranked = rank(&endpoints);
        prop_assert!(ranked.windows(2).all(|w| w[0].latency_ms <= w[1].latency_ms));
        prop_assert_eq!(ranked.len(), latencies.iter().filter(|ms| ms.is_finite()).count());
    }
}
