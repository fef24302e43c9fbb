#[cfg(test)]
mod tests {
    use crate::codec::{self, Message, ServiceKey, SomeIpDeserialize, SomeIpSerialize};
    use crate::error::CodecError;
    use crate::logging::CollectingSink;
    use crate::registry::ServiceRegistry;
    use crate::sd::entries::{EntryBody, EntryType, SdEntry};
    use crate::sd::machine::{RemoteState, SdTiming, ServiceDiscovery};
    use crate::sd::options::{SdOption, PROTO_UDP};
    use crate::sd::packet::{SdPacket, FLAG_REBOOT, FLAG_UNICAST};
    use crate::subscription::{SubscriptionManager, UnavailablePolicy};
    use crate::transport::{MemoryNetwork, MemoryTransport, SomeIpTransport};
    use bytes::Bytes;
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    const KEY: ServiceKey = ServiceKey::new(0x1234, 0x5678);
    const EVENT: u16 = 0x8778;
    const GROUP: u16 = 0x4465;

    fn encode_packet(packet: &SdPacket) -> Vec<u8> {
        let mut buf = Vec::new();
        packet.serialize(&mut buf);
        buf
    }

    #[test]
    fn test_sd_packet_serialization() {
        let mut packet = SdPacket::new(0x80);
        packet.push(SdEntry::offer_service(KEY, 1, 2, 0x100), vec![]);

        let buf = encode_packet(&packet);

        // Flags(1) + Res(3) + EntLen(4) + Entry(16) + OptLen(4)
        assert_eq!(buf.len(), 28);
        assert_eq!(buf.len(), packet.encoded_len());
        assert_eq!(buf[0], 0x80);
        assert_eq!(buf[4..8], [0, 0, 0, 16]);
        assert_eq!(buf[24..28], [0, 0, 0, 0]);
    }

    #[test]
    fn test_sd_packet_round_trip() {
        let mut packet = SdPacket::new(FLAG_REBOOT | FLAG_UNICAST);
        packet.push(
            SdEntry::offer_service(KEY, 1, 2, 0x00AB_CDEF),
            vec![SdOption::Ipv4Endpoint {
                address: Ipv4Addr::new(192, 168, 1, 1),
                transport_proto: PROTO_UDP,
                port: 30490,
            }],
        );
        packet.push(
            SdEntry::subscribe(KEY, 1, GROUP, 3),
            vec![SdOption::Ipv6Endpoint {
                address: Ipv6Addr::LOCALHOST,
                transport_proto: PROTO_UDP,
                port: 30501,
            }],
        );
        let any_instance = ServiceKey::new(0x4321, SdEntry::ANY_INSTANCE);
        packet.push(SdEntry::find_service(any_instance, 1, 3), vec![]);

        let buf = encode_packet(&packet);
        let decoded = SdPacket::deserialize(&mut Bytes::from(buf)).unwrap();

        assert_eq!(decoded, packet);
        assert_eq!(decoded.entries[1].entry_type, EntryType::SubscribeEventgroup);
        assert_eq!(decoded.entries[1].eventgroup_id(), Some(GROUP));
        assert_eq!(decoded.entries[0].ttl, 0x00AB_CDEF);
    }

    #[test]
    fn test_eventgroup_entry_layout() {
        let mut entry = SdEntry::subscribe(KEY, 1, GROUP, 3);
        entry.body = EntryBody::Eventgroup { counter: 0x2, eventgroup_id: GROUP };
        let mut buf = Vec::new();
        entry.serialize(&mut buf);

        assert_eq!(buf.len(), 16);
        assert_eq!(buf[0], 0x06);
        assert_eq!(buf[4..6], [0x12, 0x34]);
        assert_eq!(buf[6..8], [0x56, 0x78]);
        assert_eq!(buf[8], 0x01);
        assert_eq!(buf[9..12], [0, 0, 3]);
        assert_eq!(buf[12], 0x00);
        assert_eq!(buf[13], 0x02);
        assert_eq!(buf[14..16], [0x44, 0x65]);
    }

    #[test]
    fn test_stop_entries_carry_zero_ttl() {
        assert!(SdEntry::stop_offer_service(KEY, 1, 0).is_stop());
        assert!(SdEntry::stop_subscribe(KEY, 1, GROUP).is_stop());
        assert!(SdEntry::subscribe_nack(KEY, 1, GROUP).is_stop());
        assert!(!SdEntry::subscribe_ack(KEY, 1, GROUP, 3).is_stop());
        assert_eq!(SdEntry::offer_service(KEY, 1, 0, u32::MAX).ttl, SdEntry::MAX_TTL);
    }

    #[test]
    fn test_unknown_option_preserved() {
        let mut packet = SdPacket::new(0);
        packet.push(
            SdEntry::offer_service(KEY, 1, 0, 3),
            vec![SdOption::Unknown {
                type_id: 0x20,
                data: Bytes::from_static(&[0x00, 0xAA, 0xBB]),
            }],
        );
        let buf = encode_packet(&packet);
        let decoded = SdPacket::deserialize(&mut Bytes::from(buf)).unwrap();

        assert_eq!(decoded.options, packet.options);
        assert_eq!(decoded.options[0].endpoint(), None);
    }

    #[test]
    fn test_truncated_entries_array() {
        let mut packet = SdPacket::new(0);
        packet.push(SdEntry::offer_service(KEY, 1, 0, 3), vec![]);
        let buf = encode_packet(&packet);

        let err = SdPacket::deserialize(&mut &buf[..20]).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { .. }));
    }

    #[test]
    fn test_entries_length_must_be_multiple_of_entry_size() {
        let mut buf = vec![0u8, 0, 0, 0, 0, 0, 0, 10];
        buf.extend_from_slice(&[0u8; 14]);

        let err = SdPacket::deserialize(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, CodecError::MalformedHeader(_)));
    }

    #[test]
    fn test_options_for_ignores_out_of_range_run() {
        let mut packet = SdPacket::new(0);
        let endpoint = SdOption::udp_endpoint("10.0.0.1:1000".parse().unwrap());
        packet.push(SdEntry::offer_service(KEY, 1, 0, 3), vec![endpoint]);
        packet.entries[0].index_2 = 5;
        packet.entries[0].number_of_opts_2 = 1;

        let options = packet.options_for(&packet.entries[0]);
        assert_eq!(options.len(), 1);
        assert_eq!(options[0].endpoint(), Some("10.0.0.1:1000".parse().unwrap()));
    }

    #[test]
    fn test_from_message_rejects_other_services() {
        let message = Message::notification(KEY, 0x8100).build();
        assert!(SdPacket::from_message(&message).is_err());

        let packet = SdPacket::new(0);
        let message = packet.to_message(1);
        assert!(SdPacket::is_sd_message(&message));
        assert_eq!(SdPacket::from_message(&message).unwrap(), packet);
    }

    // ---- State machine over the in-memory network ----

    fn group() -> SocketAddr {
        "224.224.224.245:30490".parse().unwrap()
    }

    struct Node {
        sd: ServiceDiscovery,
        sd_socket: Arc<MemoryTransport>,
        data: Arc<MemoryTransport>,
        registry: Arc<ServiceRegistry>,
        subscriptions: Arc<SubscriptionManager>,
    }

    impl Node {
        fn new(net: &MemoryNetwork, host: u8) -> Node {
            let sd_socket = Arc::new(net.bind_host(host, 30490).unwrap());
            sd_socket.set_receive_timeout(Duration::from_millis(20)).unwrap();
            net.join(group(), sd_socket.local_addr().unwrap()).unwrap();
            let data = Arc::new(net.bind_host(host, 0).unwrap());
            data.set_receive_timeout(Duration::from_millis(50)).unwrap();

            let sink = CollectingSink::new();
            let registry = ServiceRegistry::new(sink.clone());
            let subscriptions = Arc::new(SubscriptionManager::new(
                registry.clone(),
                data.clone(),
                UnavailablePolicy::Suppress,
                sink.clone(),
            ));
            let sd = ServiceDiscovery::new(
                sd_socket.clone(),
                group(),
                data.local_addr().unwrap(),
                SdTiming::default(),
                registry.clone(),
                subscriptions.clone(),
                sink,
            );
            Node { sd, sd_socket, data, registry, subscriptions }
        }

        fn data_addr(&self) -> SocketAddr {
            self.data.local_addr().unwrap()
        }

        // Feed every queued SD datagram to the state machine.
        fn pump(&mut self, now: Instant) -> usize {
            let mut buf = [0u8; 1500];
            let mut handled = 0;
            while let Ok((len, source)) = self.sd_socket.receive(&mut buf) {
                let message = codec::decode(&buf[..len]).unwrap();
                self.sd.handle_message(&message, source, now).unwrap();
                handled += 1;
            }
            handled
        }
    }

    fn observer(net: &MemoryNetwork, host: u8) -> MemoryTransport {
        let t = net.bind_host(host, 30490).unwrap();
        t.set_receive_timeout(Duration::from_millis(20)).unwrap();
        net.join(group(), t.local_addr().unwrap()).unwrap();
        t
    }

    fn receive_packet(t: &MemoryTransport) -> Option<(Message, SdPacket)> {
        let mut buf = [0u8; 1500];
        let (len, _) = t.receive(&mut buf).ok()?;
        let message = codec::decode(&buf[..len]).ok()?;
        let packet = SdPacket::from_message(&message).ok()?;
        Some((message, packet))
    }

    fn drain(t: &MemoryTransport) -> usize {
        std::iter::from_fn(|| receive_packet(t)).count()
    }

    #[test]
    fn test_offer_makes_requested_service_available() {
        let net = MemoryNetwork::new();
        let mut server = Node::new(&net, 1);
        let mut client = Node::new(&net, 2);
        let now = Instant::now();

        client.sd.request_service(KEY, now);
        server.registry.offer(KEY, [0x0421], []).unwrap();
        server.sd.offer_service(KEY, now);

        // Find is answered with a unicast offer
        assert_eq!(server.pump(now), 1);
        assert_eq!(client.pump(now), 2);

        assert_eq!(client.sd.remote_state(KEY), RemoteState::Available);
        assert!(client.registry.is_available(KEY));
        assert_eq!(client.registry.remote_endpoint(KEY), Some(server.data_addr()));
    }

    #[test]
    fn test_unrequested_offer_becomes_available_on_request() {
        let net = MemoryNetwork::new();
        let mut server = Node::new(&net, 1);
        let mut client = Node::new(&net, 2);
        let now = Instant::now();

        server.sd.offer_service(KEY, now);
        client.pump(now);
        assert_eq!(client.sd.remote_state(KEY), RemoteState::Offered);
        assert!(!client.registry.is_available(KEY));

        client.sd.request_service(KEY, now);
        assert_eq!(client.sd.remote_state(KEY), RemoteState::Available);
        assert!(client.registry.is_available(KEY));

        client.sd.release_service(KEY);
        assert_eq!(client.sd.remote_state(KEY), RemoteState::Offered);
        assert!(!client.registry.is_available(KEY));
    }

    #[test]
    fn test_stop_offer_makes_service_unavailable() {
        let net = MemoryNetwork::new();
        let mut server = Node::new(&net, 1);
        let mut client = Node::new(&net, 2);
        let now = Instant::now();

        client.sd.request_service(KEY, now);
        server.sd.offer_service(KEY, now);
        client.pump(now);
        assert!(client.registry.is_available(KEY));

        assert!(server.sd.stop_offer_service(KEY));
        assert!(!server.sd.stop_offer_service(KEY));
        client.pump(now);

        assert_eq!(client.sd.remote_state(KEY), RemoteState::Unknown);
        assert!(!client.registry.is_available(KEY));
    }

    #[test]
    fn test_missed_refresh_deadline_drops_service() {
        let net = MemoryNetwork::new();
        let mut server = Node::new(&net, 1);
        let mut client = Node::new(&net, 2);
        let now = Instant::now();

        client.sd.request_service(KEY, now);
        server.sd.offer_service(KEY, now);
        client.pump(now);
        let deadline = client.sd.remote_service(KEY).unwrap().deadline;
        // min(liveness 5 s, TTL 3 s)
        assert_eq!(deadline, now + Duration::from_secs(3));

        client.sd.poll(now + Duration::from_secs(2));
        assert_eq!(client.sd.remote_state(KEY), RemoteState::Available);

        client.sd.poll(now + Duration::from_secs(3));
        assert_eq!(client.sd.remote_state(KEY), RemoteState::Unknown);
        assert!(!client.registry.is_available(KEY));

        // Searching resumes: the server sees a fresh find
        drain(&server.sd_socket);
        client.sd.poll(now + Duration::from_secs(3));
        let (_, packet) = receive_packet(&server.sd_socket).unwrap();
        assert_eq!(packet.entries[0].entry_type, EntryType::FindService);
    }

    #[test]
    fn test_find_answered_with_unicast_offer() {
        let net = MemoryNetwork::new();
        let mut server = Node::new(&net, 1);
        let now = Instant::now();
        server.sd.offer_service(KEY, now);

        let asker = net.bind_host(9, 30490).unwrap();
        asker.set_receive_timeout(Duration::from_millis(50)).unwrap();
        let mut find = SdPacket::new(0);
        let any_instance = ServiceKey::new(0x1234, SdEntry::ANY_INSTANCE);
        find.push(SdEntry::find_service(any_instance, 1, 3), vec![]);
        asker
            .send(&codec::encode(&find.to_message(1)), server.sd_socket.local_addr().unwrap())
            .unwrap();

        server.pump(now);
        let (_, reply) = receive_packet(&asker).unwrap();
        assert_eq!(reply.entries.len(), 1);
        assert_eq!(reply.entries[0].entry_type, EntryType::OfferService);
        assert_eq!(reply.entries[0].key(), KEY);
        let endpoint = reply.options_for(&reply.entries[0])[0].endpoint();
        assert_eq!(endpoint, Some(server.data_addr()));
    }

    #[test]
    fn test_offer_repetition_schedule() {
        let net = MemoryNetwork::new();
        let mut server = Node::new(&net, 1);
        let watcher = observer(&net, 8);
        let start = Instant::now();

        server.sd.offer_service(KEY, start);
        assert_eq!(drain(&watcher), 1);

        let ms = Duration::from_millis;
        let expected = [(50, 0), (100, 1), (250, 0), (300, 1), (700, 1), (1500, 0), (1700, 1)];
        for (offset, count) in expected {
            server.sd.poll(start + ms(offset));
            assert_eq!(drain(&watcher), count, "at +{} ms", offset);
        }
    }

    #[test]
    fn test_reboot_flag_and_session_ids() {
        let net = MemoryNetwork::new();
        let mut server = Node::new(&net, 1);
        let watcher = observer(&net, 8);
        let now = Instant::now();

        server.sd.offer_service(KEY, now);
        server.sd.poll(now + Duration::from_millis(100));

        let (first, packet) = receive_packet(&watcher).unwrap();
        let (second, _) = receive_packet(&watcher).unwrap();
        assert_eq!(packet.flags, FLAG_REBOOT | FLAG_UNICAST);
        assert_eq!(first.session_id(), 1);
        assert_eq!(second.session_id(), 2);
    }

    // Client requests, subscribes and completes the handshake with the server.
    fn subscribed_pair(net: &MemoryNetwork, eventgroup_id: u16, now: Instant) -> (Node, Node) {
        let mut server = Node::new(net, 1);
        let mut client = Node::new(net, 2);

        server.registry.offer(KEY, [], [(EVENT, GROUP)]).unwrap();
        server.sd.offer_service(KEY, now);
        client.sd.request_service(KEY, now);
        client.sd.subscribe_eventgroup(KEY, eventgroup_id);

        client.pump(now); // offer -> subscribe
        server.pump(now); // find + subscribe -> offer + ack
        client.pump(now);
        server.pump(now); // renewal from the unicast offer
        client.pump(now);
        (server, client)
    }

    #[test]
    fn test_subscription_is_acked_and_receives_notifications() {
        let net = MemoryNetwork::new();
        let now = Instant::now();
        let (server, client) = subscribed_pair(&net, GROUP, now);

        assert_eq!(client.sd.subscription_acked(KEY, GROUP), Some(true));
        assert_eq!(server.subscriptions.subscribers(KEY, GROUP), vec![client.data_addr()]);

        let report = server.subscriptions.notify(KEY, EVENT, vec![0x10]).unwrap();
        assert_eq!(report.delivered, vec![client.data_addr()]);

        let mut buf = [0u8; 256];
        let (len, _) = client.data.receive(&mut buf).unwrap();
        let message = codec::decode(&buf[..len]).unwrap();
        assert_eq!(message.method_id(), EVENT);
        assert_eq!(message.payload().as_ref(), &[0x10]);
    }

    #[test]
    fn test_subscription_to_unknown_eventgroup_is_nacked() {
        let net = MemoryNetwork::new();
        let now = Instant::now();
        let (server, client) = subscribed_pair(&net, 0x0999, now);

        assert_eq!(client.sd.subscription_acked(KEY, 0x0999), Some(false));
        assert!(server.subscriptions.all().is_empty());
    }

    #[test]
    fn test_stop_subscribe_removes_subscriber() {
        let net = MemoryNetwork::new();
        let now = Instant::now();
        let (mut server, mut client) = subscribed_pair(&net, GROUP, now);

        client.sd.unsubscribe_eventgroup(KEY, GROUP);
        server.pump(now);

        assert!(server.subscriptions.subscribers(KEY, GROUP).is_empty());
        assert_eq!(client.sd.subscription_acked(KEY, GROUP), None);
        client.pump(now);
    }

    #[test]
    fn test_subscription_resent_when_service_returns() {
        let net = MemoryNetwork::new();
        let now = Instant::now();
        let (mut server, mut client) = subscribed_pair(&net, GROUP, now);

        server.sd.stop_offer_service(KEY);
        client.pump(now);
        assert_eq!(client.sd.subscription_acked(KEY, GROUP), None);

        server.sd.offer_service(KEY, now);
        client.pump(now);
        server.pump(now);
        client.pump(now);

        assert_eq!(client.sd.remote_state(KEY), RemoteState::Available);
        assert_eq!(client.sd.subscription_acked(KEY, GROUP), Some(true));
    }

    #[test]
    fn test_expired_subscriber_is_dropped_on_poll() {
        let net = MemoryNetwork::new();
        let now = Instant::now();
        let (mut server, _client) = subscribed_pair(&net, GROUP, now);
        assert_eq!(server.subscriptions.all().len(), 1);

        // Subscribe TTL is 3 s
        server.sd.poll(Instant::now() + Duration::from_secs(4));
        assert!(server.subscriptions.all().is_empty());
    }

    #[test]
    fn test_shutdown_withdraws_offers() {
        let net = MemoryNetwork::new();
        let mut server = Node::new(&net, 1);
        let watcher = observer(&net, 8);
        let now = Instant::now();

        server.sd.offer_service(KEY, now);
        drain(&watcher);
        server.sd.shutdown();

        let (_, packet) = receive_packet(&watcher).unwrap();
        assert_eq!(packet.entries[0].entry_type, EntryType::OfferService);
        assert!(packet.entries[0].is_stop());
        assert!(!server.sd.is_offering(KEY));
    }
}
