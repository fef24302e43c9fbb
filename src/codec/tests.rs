#[cfg(test)]
mod tests {
    use crate::codec::header::{MessageType, ReturnCode, SomeIpHeader};
    use crate::codec::message::{decode, decode_all, encode, Decoded, Message, ServiceKey};
    use crate::error::CodecError;

    const KEY: ServiceKey = ServiceKey::new(0x1234, 0x5678);

    fn sample_request() -> Message {
        Message::request(KEY, 0x0421)
            .client_id(0x0001)
            .session_id(0x0002)
            .payload((0u8..10).collect::<Vec<u8>>())
            .build()
    }

    #[test]
    fn test_header_layout() {
        let bytes = encode(&sample_request());

        assert_eq!(bytes.len(), 18 + 10);
        assert_eq!(bytes[0..2], [0x12, 0x34]); // service
        assert_eq!(bytes[2..4], [0x56, 0x78]); // instance
        assert_eq!(bytes[4..6], [0x04, 0x21]); // method
        assert_eq!(bytes[6..10], [0, 0, 0, 18]); // 10 + 8
        assert_eq!(bytes[10..12], [0x00, 0x01]); // client
        assert_eq!(bytes[12..14], [0x00, 0x02]); // session
        assert_eq!(bytes[14], 0x01); // protocol version
        assert_eq!(bytes[15], 0x01); // interface version
        assert_eq!(bytes[16], 0x00); // request
        assert_eq!(bytes[17], 0x00); // E_OK
        assert_eq!(bytes[18..], [0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn test_round_trip_message_kinds() {
        let request = sample_request();
        let response = Message::response_to(&request, vec![9u8, 8, 7]);
        let error = Message::error_to(&request, ReturnCode::UnknownMethod);
        let notification = Message::notification(KEY, 0x8778)
            .session_id(7)
            .payload(vec![0x10])
            .build();
        let empty = Message::request_no_return(KEY, 0x0001).build();

        for m in [request, response, error, notification, empty] {
            assert_eq!(decode(&encode(&m)).unwrap(), m);
        }
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let m = sample_request();
        assert_eq!(encode(&m), encode(&m.clone()));
    }

    #[test]
    fn test_response_correlation() {
        let request = sample_request();
        let response = Message::response_to(&request, vec![1u8]);

        assert_eq!(response.message_type(), MessageType::Response);
        assert_eq!(response.client_id(), request.client_id());
        assert_eq!(response.session_id(), request.session_id());
        assert_eq!(response.key(), request.key());
        assert_eq!(response.method_id(), request.method_id());
    }

    #[test]
    fn test_decode_short_header() {
        let bytes = encode(&sample_request());
        let err = decode(&bytes[..10]).unwrap_err();
        assert_eq!(err, CodecError::Truncated { needed: 18, available: 10 });
    }

    #[test]
    fn test_decode_short_payload() {
        let bytes = encode(&sample_request());
        // Header declares 10 payload bytes, only 4 present
        let err = decode(&bytes[..22]).unwrap_err();
        assert_eq!(err, CodecError::Truncated { needed: 28, available: 22 });
    }

    #[test]
    fn test_decode_huge_declared_length() {
        let mut bytes = encode(&sample_request());
        bytes[6..10].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(decode(&bytes), Err(CodecError::Truncated { .. })));
    }

    #[test]
    fn test_decode_unsupported_version() {
        let mut bytes = encode(&sample_request());
        bytes[14] = 0x02;
        assert_eq!(decode(&bytes).unwrap_err(), CodecError::UnsupportedVersion(0x02));
    }

    #[test]
    fn test_decode_malformed_header() {
        let mut bytes = encode(&sample_request());
        bytes[16] = 0x42;
        assert!(matches!(decode(&bytes), Err(CodecError::MalformedHeader(_))));

        let mut bytes = encode(&sample_request());
        bytes[6..10].copy_from_slice(&4u32.to_be_bytes());
        assert!(matches!(decode(&bytes), Err(CodecError::MalformedHeader(_))));

        let mut bytes = encode(&sample_request());
        bytes[17] = 0xEE;
        assert!(matches!(decode(&bytes), Err(CodecError::MalformedHeader(_))));
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        let m = sample_request();
        let mut bytes = encode(&m);
        bytes.extend_from_slice(&[0xAA, 0xBB]);
        assert_eq!(decode(&bytes).unwrap(), m);
    }

    #[test]
    fn test_decode_all_back_to_back() {
        let a = sample_request();
        let b = Message::notification(KEY, 0x8778).payload(vec![0x10]).build();
        let mut bytes = encode(&a);
        bytes.extend_from_slice(&encode(&b));

        let decoded = decode_all(&bytes);
        assert_eq!(decoded.messages, vec![a.clone(), b.clone()]);
        assert_eq!(decoded.leftover, None);

        // Padding after the last message is reported; the messages are kept
        bytes.extend_from_slice(&[0x12, 0x34]);
        let decoded = decode_all(&bytes);
        assert_eq!(decoded.messages, vec![a, b]);
        assert!(matches!(decoded.leftover, Some(CodecError::Truncated { .. })));
    }

    #[test]
    fn test_decode_all_garbage_only() {
        let decoded = decode_all(&[0xFF; 4]);
        assert!(decoded.messages.is_empty());
        assert!(decoded.leftover.is_some());
        assert_eq!(decode_all(&[]), Decoded::default());
    }

    #[test]
    fn test_header_payload_length() {
        let header = SomeIpHeader::deserialize(&encode(&sample_request())).unwrap();
        assert_eq!(header.payload_length(), 10);
        assert_eq!(header.length, 18);
    }
}
