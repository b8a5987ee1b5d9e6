// End-to-end tests: real relay server, real `RelayClient`s.
//
// Each test starts a server on a random port, connects participants through
// `TestParticipant`, and checks what each one receives on each channel.
// Group (multicast) scenarios join on loopback with a fixed port per test.

use std::net::{Ipv4Addr, SocketAddr};
use std::thread;
use std::time::{Duration, Instant};

use tricast_protocol::ParticipantId;
use tricast_relay::client::GroupConfig;
use tricast_relay::server::{ServerConfig, ServerHandle, start_server};
use tricast_tests::{TestParticipant, WAIT_TIMEOUT};

fn start_test_server() -> (ServerHandle, SocketAddr) {
    start_server(ServerConfig {
        host: "127.0.0.1".into(),
        port: 0,
    })
    .unwrap()
}

fn wait_for_participants(handle: &ServerHandle, expected: usize) {
    let start = Instant::now();
    while handle.registry().len() != expected {
        assert!(
            start.elapsed() < WAIT_TIMEOUT,
            "registry has {} participants, expected {expected}",
            handle.registry().len()
        );
        thread::sleep(Duration::from_millis(10));
    }
}

/// Group settings for multicast tests: an administratively scoped address
/// on a fixed port, joined on loopback.
fn test_group(port: u16) -> GroupConfig {
    GroupConfig {
        address: Ipv4Addr::new(239, 255, 42, 99),
        port,
        interface: Ipv4Addr::LOCALHOST,
    }
}

// ---------------------------------------------------------------------------
// Test scenarios
// ---------------------------------------------------------------------------

/// Two participants connect and chat over the reliable channel.
#[test]
fn two_participant_reliable_chat() {
    let (handle, addr) = start_test_server();
    let mut alice = TestParticipant::connect(addr, "alice");
    let mut bob = TestParticipant::connect(addr, "bob");
    assert_eq!(alice.id(), ParticipantId(1));
    assert_eq!(bob.id(), ParticipantId(2));

    alice.say("hi");
    assert_eq!(bob.expect_reliable(), "alice#1> hi");
    alice.expect_nothing();

    bob.say("hello alice");
    assert_eq!(alice.expect_reliable(), "bob#2> hello alice");

    handle.stop();
}

/// Unicast datagrams go through the server to everyone else.
#[test]
fn unicast_goes_through_server() {
    let (handle, addr) = start_test_server();
    let mut alice = TestParticipant::connect(addr, "alice");
    let mut bob = TestParticipant::connect(addr, "bob");
    let mut carol = TestParticipant::connect(addr, "carol");

    carol.whisper("over udp");
    assert_eq!(alice.expect_unicast(), "carol#3> over udp");
    assert_eq!(bob.expect_unicast(), "carol#3> over udp");
    carol.expect_nothing();

    handle.stop();
}

/// Reliable and unicast traffic arrive on their own channels even when
/// interleaved.
#[test]
fn channels_are_kept_apart() {
    let (handle, addr) = start_test_server();
    let alice = TestParticipant::connect(addr, "alice");
    let mut bob = TestParticipant::connect(addr, "bob");

    alice.whisper("u1");
    alice.say("t1");
    alice.whisper("u2");
    alice.say("t2");

    assert_eq!(bob.expect_reliable(), "alice#1> t1");
    assert_eq!(bob.expect_reliable(), "alice#1> t2");
    let mut datagrams = vec![bob.expect_unicast(), bob.expect_unicast()];
    datagrams.sort();
    assert_eq!(datagrams, vec!["alice#1> u1", "alice#1> u2"]);

    handle.stop();
}

/// A participant leaves; its id is freed and reused, and the rest of the
/// room keeps working.
#[test]
fn leave_and_rejoin_reuses_id() {
    let (handle, addr) = start_test_server();
    let alice = TestParticipant::connect(addr, "alice");
    let bob = TestParticipant::connect(addr, "bob");
    let mut carol = TestParticipant::connect(addr, "carol");
    wait_for_participants(&handle, 3);

    bob.leave();
    wait_for_participants(&handle, 2);

    let mut dave = TestParticipant::connect(addr, "dave");
    assert_eq!(dave.id(), ParticipantId(2));

    alice.say("welcome");
    assert_eq!(carol.expect_reliable(), "alice#1> welcome");
    assert_eq!(dave.expect_reliable(), "alice#1> welcome");

    handle.stop();
}

/// Many participants; one message reaches exactly the others.
#[test]
fn fan_out_to_many() {
    let (handle, addr) = start_test_server();
    let mut room: Vec<_> = (0..6)
        .map(|i| TestParticipant::connect(addr, &format!("p{i}")))
        .collect();

    room[3].say("hello room");
    for (i, participant) in room.iter_mut().enumerate() {
        if i == 3 {
            participant.expect_nothing();
        } else {
            assert_eq!(participant.expect_reliable(), "p3#4> hello room");
        }
    }

    handle.stop();
}

/// Concurrent senders: each recipient sees every sender's messages in that
/// sender's order.
#[test]
fn per_sender_order_under_concurrency() {
    let (handle, addr) = start_test_server();
    let a = TestParticipant::connect(addr, "a");
    let b = TestParticipant::connect(addr, "b");
    let mut observer = TestParticipant::connect(addr, "observer");

    thread::scope(|s| {
        for sender in [&a, &b] {
            s.spawn(move || {
                for i in 0..50 {
                    sender.say(&format!("{i}"));
                }
            });
        }
    });

    let mut next = [0, 0];
    for _ in 0..100 {
        let line = observer.expect_reliable();
        let (who, n) = line.split_once("> ").unwrap();
        let slot = match who {
            "a#1" => 0,
            "b#2" => 1,
            other => panic!("unexpected sender {other}"),
        };
        assert_eq!(n.parse::<usize>().unwrap(), next[slot]);
        next[slot] += 1;
    }
    assert_eq!(next, [50, 50]);

    handle.stop();
}

/// Server shutdown is reported to clients as a disconnect.
#[test]
fn server_stop_disconnects_clients() {
    let (handle, addr) = start_test_server();
    let mut alice = TestParticipant::connect(addr, "alice");
    let mut bob = TestParticipant::connect(addr, "bob");
    wait_for_participants(&handle, 2);

    handle.stop();
    alice.expect_disconnected();
    bob.expect_disconnected();
}

/// Group datagrams go straight between clients, labelled without a space.
#[test]
fn group_datagrams_bypass_server() {
    let (handle, addr) = start_test_server();
    let group = test_group(48_301);
    let mut alice = TestParticipant::connect_with_group(addr, "alice", Some(group.clone()));
    let mut bob = TestParticipant::connect_with_group(addr, "bob", Some(group));

    bob.shout("everyone");
    assert_eq!(alice.expect_group(), "bob#2>everyone");
    // Multicast loopback delivers to the sender too.
    assert_eq!(bob.expect_group(), "bob#2>everyone");

    // Nothing about group traffic reaches the server's channels.
    alice.expect_nothing();
    handle.stop();
}
