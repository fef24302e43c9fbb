use someip_middleware::codec::{self, SomeIpSerialize};
use someip_middleware::sd::entries::SdEntry;
use someip_middleware::sd::options::SdOption;
use someip_middleware::sd::packet::SdPacket;
use someip_middleware::ServiceKey;
use std::net::Ipv4Addr;

const KEY: ServiceKey = ServiceKey::new(0x1234, 0x0001);

#[test]
/// Offer entry with one IPv4 endpoint option
fn test_sd_packet_binary_layout() {
    let mut packet = SdPacket::new(0x80);
    packet.push(
        SdEntry::offer_service(KEY, 1, 10, 0xFFFFFF),
        vec![SdOption::Ipv4Endpoint {
            address: Ipv4Addr::new(127, 0, 0, 1),
            transport_proto: 0x11,
            port: 30500,
        }],
    );

    let mut buf = Vec::new();
    packet.serialize(&mut buf);

    // [0..4] Flags:1, Res:3
    assert_eq!(buf[0], 0x80);
    assert_eq!(buf[1..4], [0, 0, 0]);

    // [4..8] Entries length, one entry
    assert_eq!(buf[4..8], [0, 0, 0, 16]);

    // [8..24] Entry
    assert_eq!(buf[8], 0x01); // Offer
    assert_eq!(buf[9], 0); // Index 1
    assert_eq!(buf[11], 0x10); // NumOpts (1 << 4 | 0)
    assert_eq!(buf[12..14], [0x12, 0x34]);
    assert_eq!(buf[14..16], [0x00, 0x01]);
    assert_eq!(buf[16], 0x01); // major
    assert_eq!(buf[17..20], [0xFF, 0xFF, 0xFF]); // TTL
    assert_eq!(buf[20..24], [0, 0, 0, 10]); // minor

    // [24..28] Options length
    assert_eq!(buf[24..28], [0, 0, 0, 12]);

    // [28..40] IPv4 endpoint option
    assert_eq!(buf[28..30], [0, 9]);
    assert_eq!(buf[30], 0x04);
    assert_eq!(buf[31], 0x00);
    assert_eq!(buf[32..36], [127, 0, 0, 1]);
    assert_eq!(buf[37], 0x11);
    assert_eq!(buf[38..40], [0x77, 0x24]); // 30500

    assert_eq!(buf.len(), 4 + 4 + 16 + 4 + 12);
}

#[test]
/// Subscribe entry: reserved, counter and eventgroup in the last four bytes
fn test_subscribe_entry_binary_layout() {
    let mut packet = SdPacket::new(0xC0);
    packet.push(SdEntry::subscribe(KEY, 1, 0x4465, 3), vec![]);

    let mut buf = Vec::new();
    packet.serialize(&mut buf);

    assert_eq!(buf[8], 0x06);
    assert_eq!(buf[11], 0x00); // no options
    assert_eq!(buf[17..20], [0, 0, 3]);
    assert_eq!(buf[20..24], [0x00, 0x00, 0x44, 0x65]);
    assert_eq!(buf[24..28], [0, 0, 0, 0]);
}

#[test]
/// Full SD message: header fields of the carrying notification
fn test_sd_message_header() {
    let mut packet = SdPacket::new(0xC0);
    packet.push(SdEntry::find_service(KEY, 1, 3), vec![]);

    let bytes = codec::encode(&packet.to_message(7));

    assert_eq!(bytes[0..2], [0xFF, 0xFF]); // service
    assert_eq!(bytes[4..6], [0x81, 0x00]); // method
    assert_eq!(bytes[12..14], [0x00, 0x07]); // session
    assert_eq!(bytes[16], 0x02); // notification
    assert_eq!(bytes.len(), 18 + 28);

    let message = codec::decode(&bytes).unwrap();
    assert_eq!(SdPacket::from_message(&message).unwrap(), packet);
}
