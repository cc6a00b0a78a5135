//! Property tests for the MessagePack message codec.

use proptest::prelude::*;
use tbus_protocol::{Message, MessageLimits};

fn text() -> impl Strategy<Value = String> {
    // Pipes and empty strings are the interesting cases for list payloads.
    prop_oneof![
        Just(String::new()),
        Just("|".to_string()),
        "[a-z|]{1,12}",
        "\\PC{0,24}",
    ]
}

fn token() -> impl Strategy<Value = Option<String>> {
    prop_oneof![Just(None), "[0-9a-f-]{1,36}".prop_map(Some)]
}

proptest! {
    #[test]
    fn decode_inverts_encode(
        topic in text(),
        origin in text(),
        payload in proptest::collection::vec(any::<u8>(), 0..256),
        request in token(),
        response in token(),
    ) {
        let message = Message::from_parts(topic, origin, payload, request, response);
        let bytes = message.to_bytes().unwrap();
        prop_assert_eq!(Message::from_bytes(&bytes).unwrap(), message);
    }

    #[test]
    fn garbage_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..128)) {
        let _ = Message::from_bytes(&bytes);
    }

    #[test]
    fn valid_messages_never_carry_both_tokens(
        topic in "[a-z]{1,8}",
        request in "[0-9a-f]{1,8}",
        response in "[0-9a-f]{1,8}",
    ) {
        let message = Message::from_parts(topic, "n", Vec::new(), Some(request), Some(response));
        prop_assert!(message.validate(&MessageLimits::default()).is_err());
    }
}
