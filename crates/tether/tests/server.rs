mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use common::*;
use tether::{
    ChannelConfig, ChannelKind, ClientState, ConnectionConfig, Context, DisconnectReason,
    PoolConfig, PoolError, ServerConfig, ServerEvent, ServerInterface,
};

#[test]
fn test_clients_connect_into_lowest_free_slots() {
    let mut harness = Harness::start(4, config());
    for index in 0..4 {
        assert!(!harness.server.is_client_connected(index));
    }
    assert_eq!(harness.server.num_connected_clients(), 0);

    harness.connect_clients(3);
    assert_eq!(harness.server.num_connected_clients(), 3);
    let indices: Vec<usize> = (0..3).map(|client| harness.server_index(client)).collect();
    assert_eq!(indices, vec![0, 1, 2]);
    assert!(!harness.server.is_client_connected(3));

    let events = harness.server.drain_events();
    assert_eq!(events, vec![
        ServerEvent::ClientConnected { client_index: 0 },
        ServerEvent::ClientConnected { client_index: 1 },
        ServerEvent::ClientConnected { client_index: 2 },
    ]);
}

#[test]
fn test_full_server_and_wrong_key_are_denied() {
    let mut harness = Harness::start(1, config());
    harness.connect_clients(1);

    let extra = harness.add_client();
    let impostor = harness.add_client_with_key(&[0; 32]);
    harness.run(2);

    assert_eq!(harness.clients[extra].state(), ClientState::Denied);
    assert_eq!(harness.clients[impostor].state(), ClientState::Denied);
    assert_eq!(harness.server.num_connected_clients(), 1);
}

#[test]
fn test_ordered_round_trip_survives_reorder_and_duplicates() {
    let mut harness = Harness::start(2, config());
    harness.connect_clients(1);
    let index = harness.server_index(0);

    harness.server.set_latency(50.0);
    harness.server.set_jitter(40.0);
    harness.server.set_duplicates(30.0);
    harness.server.set_packet_loss(10.0);
    let client = &mut harness.clients[0];
    client.set_latency(50.0);
    client.set_jitter(40.0);
    client.set_duplicates(30.0);
    client.set_packet_loss(10.0);

    for value in 0..100 {
        client_send(client, 0, TestMessage::Sequence { value }, None);
    }

    let mut received = Vec::new();
    let done = harness.run_until(600, |harness| {
        received.extend(drain_server(&mut harness.server, index, 0));
        received.len() >= 100
    });
    assert!(done, "only {} messages arrived", received.len());

    // Late duplicates must not surface again.
    harness.run(60);
    received.extend(drain_server(&mut harness.server, index, 0));
    assert_eq!(sequence_values(&received), (0..100).collect::<Vec<_>>());
}

#[test]
fn test_unordered_channel_delivers_each_message_once() {
    let config = ServerConfig {
        connection: ConnectionConfig {
            channels: vec![
                ChannelConfig::new(ChannelKind::ReliableOrdered),
                ChannelConfig::new(ChannelKind::ReliableUnordered),
            ],
            ..Default::default()
        },
        ..config()
    };
    let mut harness = Harness::start(1, config);
    harness.connect_clients(1);
    let index = harness.server_index(0);

    harness.server.set_latency(30.0);
    harness.server.set_jitter(30.0);
    harness.server.set_packet_loss(20.0);
    for value in 0..50 {
        server_send(&mut harness.server, index, 1, TestMessage::Sequence { value }, None);
    }

    let mut received = Vec::new();
    let done = harness.run_until(600, |harness| {
        received.extend(drain_client(&mut harness.clients[0], 1));
        received.len() >= 50
    });
    assert!(done, "only {} messages arrived", received.len());
    harness.run(60);
    received.extend(drain_client(&mut harness.clients[0], 1));

    let values = sequence_values(&received);
    let unique: BTreeSet<u32> = values.iter().copied().collect();
    assert_eq!(values.len(), 50);
    assert_eq!(unique, (0..50).collect());
}

#[test]
fn test_loss_blocks_unreliable_but_not_reliable() {
    let mut harness = Harness::start(1, config());
    harness.connect_clients(1);
    let index = harness.server_index(0);

    let client = &mut harness.clients[0];
    client.set_packet_loss(100.0);
    client_send(client, 1, TestMessage::Text("lost".into()), None);
    client_send(client, 0, TestMessage::Sequence { value: 7 }, None);

    harness.run(60);
    assert!(drain_server(&mut harness.server, index, 0).is_empty());
    assert!(drain_server(&mut harness.server, index, 1).is_empty());

    harness.clients[0].set_packet_loss(0.0);
    let mut reliable = Vec::new();
    let mut unreliable = Vec::new();
    let done = harness.run_until(120, |harness| {
        reliable.extend(drain_server(&mut harness.server, index, 0));
        unreliable.extend(drain_server(&mut harness.server, index, 1));
        !reliable.is_empty()
    });
    assert!(done);
    harness.run(30);
    reliable.extend(drain_server(&mut harness.server, index, 0));
    unreliable.extend(drain_server(&mut harness.server, index, 1));

    assert_eq!(sequence_values(&reliable), vec![7]);
    assert!(unreliable.is_empty());
}

#[test]
fn test_context_reaches_encode_and_decode() {
    let mut harness = Harness::start(2, config());
    harness.connect_clients(2);
    let (keyed, plain) = (harness.server_index(0), harness.server_index(1));

    let cipher: Arc<Context> = Arc::new(Cipher(0x5a));
    harness.server.set_context(Some(Arc::clone(&cipher)));
    harness.clients[0].set_context(Some(cipher));

    let text = TestMessage::Text("hello over the wire".into());
    client_send(&mut harness.clients[0], 0, text.clone(), None);
    server_send(&mut harness.server, keyed, 0, text.clone(), None);
    server_send(&mut harness.server, plain, 0, text.clone(), None);

    let mut at_server = Vec::new();
    let mut at_keyed = Vec::new();
    let mut at_plain = Vec::new();
    let done = harness.run_until(120, |harness| {
        at_server.extend(drain_server(&mut harness.server, keyed, 0));
        at_keyed.extend(drain_client(&mut harness.clients[0], 0));
        at_plain.extend(drain_client(&mut harness.clients[1], 0));
        !at_server.is_empty() && !at_keyed.is_empty() && !at_plain.is_empty()
    });
    assert!(done);

    assert_eq!(at_server, vec![(text.clone(), None)]);
    assert_eq!(at_keyed, vec![(text.clone(), None)]);
    // A peer without the context sees the scrambled bytes.
    assert_eq!(at_plain.len(), 1);
    assert_ne!(at_plain[0].0, text);
}

#[test]
fn test_fragmented_block_arrives_intact() {
    let mut harness = Harness::start(1, config());
    harness.connect_clients(1);
    let index = harness.server_index(0);

    let upload = pattern(20_000);
    client_send(&mut harness.clients[0], 0, TestMessage::Blob { tag: 9 }, Some(&upload));
    let download = pattern(5_000);
    server_send(&mut harness.server, index, 1, TestMessage::Blob { tag: 3 }, Some(&download));

    let mut at_server = Vec::new();
    let mut at_client = Vec::new();
    let done = harness.run_until(300, |harness| {
        at_server.extend(drain_server(&mut harness.server, index, 0));
        at_client.extend(drain_client(&mut harness.clients[0], 1));
        !at_server.is_empty() && !at_client.is_empty()
    });
    assert!(done);

    assert_eq!(at_server, vec![(TestMessage::Blob { tag: 9 }, Some(upload))]);
    assert_eq!(at_client, vec![(TestMessage::Blob { tag: 3 }, Some(download))]);
}

#[test]
fn test_disconnect_frees_slot_for_next_client() {
    let mut harness = Harness::start(2, config());
    harness.connect_clients(2);
    let index = harness.server_index(1);
    harness.server.drain_events();

    server_send(&mut harness.server, index, 0, TestMessage::Blob { tag: 1 }, Some(&pattern(4096)));
    assert!(harness.server.client_memory(index).unwrap().used > 4096);

    harness.server.disconnect_client(index);
    assert!(!harness.server.is_client_connected(index));
    assert_eq!(harness.server.num_connected_clients(), 1);
    assert_eq!(harness.server.client_memory(index).unwrap().used, 0);
    assert_eq!(harness.server.drain_events(), vec![ServerEvent::ClientDisconnected {
        client_index: index,
        reason: DisconnectReason::Requested,
    }]);

    // A second disconnect of the idle slot is ignored.
    harness.server.disconnect_client(index);
    assert!(harness.server.drain_events().is_empty());

    harness.step();
    assert!(!harness.clients[1].is_connected());

    let next = harness.add_client();
    assert!(harness.run_until(10, |harness| harness.clients[next].is_connected()));
    assert_eq!(harness.server_index(next), index);

    server_send(&mut harness.server, index, 0, TestMessage::Sequence { value: 5 }, None);
    let mut received = Vec::new();
    assert!(harness.run_until(60, |harness| {
        received.extend(drain_client(&mut harness.clients[next], 0));
        !received.is_empty()
    }));
    assert_eq!(sequence_values(&received), vec![5]);
}

#[test]
fn test_dropped_client_is_reported_by_transport() {
    let mut harness = Harness::start(2, config());
    harness.connect_clients(2);
    let index = harness.server_index(1);
    harness.server.drain_events();

    harness.clients.remove(1);
    harness.step();

    assert!(!harness.server.is_client_connected(index));
    assert_eq!(harness.server.drain_events(), vec![ServerEvent::ClientDisconnected {
        client_index: index,
        reason: DisconnectReason::Transport,
    }]);
}

#[test]
fn test_message_pool_exhaustion_is_per_client() {
    let config = ServerConfig {
        pool: PoolConfig::default().with_capacity(SEQUENCE, 4),
        ..config()
    };
    let mut harness = Harness::start(2, config);
    harness.connect_clients(2);
    let (first, second) = (harness.server_index(0), harness.server_index(1));

    let handles: Vec<_> = (0..4)
        .map(|_| harness.server.create_message(first, SEQUENCE).unwrap())
        .collect();
    assert!(matches!(
        harness.server.create_message(first, SEQUENCE),
        Err(PoolError::Exhausted { capacity: 4, .. })
    ));
    assert!(harness.server.create_message(second, SEQUENCE).is_ok());
    assert!(harness.server.create_message(first, TEXT).is_ok());

    harness.server.release_message(first, handles[0]);
    assert!(harness.server.create_message(first, SEQUENCE).is_ok());
}

#[test]
fn test_stop_disconnects_everyone_and_is_idempotent() {
    let mut harness = Harness::start(2, config());
    harness.connect_clients(2);
    harness.server.drain_events();

    harness.server.stop();
    assert!(!harness.server.is_running());
    assert_eq!(harness.server.drain_events(), vec![
        ServerEvent::ClientDisconnected {
            client_index: 0,
            reason: DisconnectReason::ServerStopped,
        },
        ServerEvent::ClientDisconnected {
            client_index: 1,
            reason: DisconnectReason::ServerStopped,
        },
    ]);
    assert_eq!(harness.allocator.usage().used, 2 * 4 * 1024 * 1024);

    harness.server.stop();
    assert!(!harness.server.is_running());
    assert!(harness.server.drain_events().is_empty());

    harness.step();
    assert!(harness.clients.iter().all(|client| !client.is_connected()));

    harness.server.start(2).unwrap();
    assert!(harness.server.is_running());
    harness.connect_clients(1);
    assert_eq!(harness.server.num_connected_clients(), 1);
}
