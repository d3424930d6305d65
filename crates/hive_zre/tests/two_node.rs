//! Two real nodes on loopback: discovery, handshake, groups and messaging.

use std::net::Ipv4Addr;
use std::time::Duration;

use hive_zre::beacon::Beacon;
use hive_zre::{NodeConfig, ZreEvent, ZreNode};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedReceiver;

const WAIT: Duration = Duration::from_secs(5);

fn loopback_config(name: &str) -> NodeConfig {
    NodeConfig {
        name: Some(name.into()),
        address: Some(Ipv4Addr::LOCALHOST),
        broadcast: Some(Ipv4Addr::LOCALHOST),
        port: 0,
        // The listener gets an OS-assigned port; beacons are injected below.
        beacon_port: 0,
        ..NodeConfig::default()
    }
}

fn mailbox_port(node: &ZreNode) -> u16 {
    node.endpoint()
        .and_then(|e| e.rsplit(':').next())
        .and_then(|p| p.parse().ok())
        .expect("running node has a tcp://host:port endpoint")
}

/// Deliver `from`'s beacon to `to`'s beacon listener.
async fn announce(from: &ZreNode, to: &ZreNode) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let beacon = Beacon::new(from.identity(), mailbox_port(from)).to_bytes();
    let target = (Ipv4Addr::LOCALHOST, to.beacon_port().unwrap());
    socket.send_to(&beacon, target).await.unwrap();
}

/// Wait for the first event matching `pred`, skipping the rest.
async fn wait_for(
    events: &mut UnboundedReceiver<ZreEvent>,
    pred: impl Fn(&ZreEvent) -> bool,
) -> ZreEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event stream open");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn test_two_nodes_chat() {
    let mut alice = ZreNode::new(loopback_config("alice"));
    let mut bob = ZreNode::new(loopback_config("bob"));
    let mut alice_events = alice.start().await.unwrap();
    let mut bob_events = bob.start().await.unwrap();
    let (alice_id, bob_id) = (alice.identity(), bob.identity());

    // Bob hears Alice's beacon, connects and says HELLO; Alice answers.
    announce(&alice, &bob).await;

    let event = wait_for(&mut alice_events, |e| matches!(e, ZreEvent::Connect { .. })).await;
    assert!(matches!(event, ZreEvent::Connect { peer, ref name, .. } if peer == bob_id && name == "bob"));
    let event = wait_for(&mut bob_events, |e| matches!(e, ZreEvent::Connect { .. })).await;
    assert!(matches!(event, ZreEvent::Connect { peer, ref name, .. } if peer == alice_id && name == "alice"));

    // Both join; each sees the other's JOIN.
    assert!(alice.join("CHAT").await.unwrap());
    assert!(bob.join("CHAT").await.unwrap());
    wait_for(&mut bob_events, |e| {
        matches!(e, ZreEvent::Join { peer, group, .. } if *peer == alice_id && group == "CHAT")
    })
    .await;
    wait_for(&mut alice_events, |e| {
        matches!(e, ZreEvent::Join { peer, group, .. } if *peer == bob_id && group == "CHAT")
    })
    .await;

    let group = alice.group("CHAT").await.unwrap().unwrap();
    assert_eq!(group.members.len(), 1);
    assert_eq!(group.members[0].id, bob_id);

    // Shout reaches the joined peer.
    assert_eq!(alice.shout("CHAT", "hello bob").await.unwrap(), 1);
    let event = wait_for(&mut bob_events, |e| matches!(e, ZreEvent::Shout { .. })).await;
    assert_eq!(
        event,
        ZreEvent::Shout {
            peer: alice_id,
            name: "alice".into(),
            group: "CHAT".into(),
            content: b"hello bob".to_vec(),
        }
    );

    // Whisper goes point to point.
    bob.whisper(alice_id, vec![0u8, 1, 2, 255]).await.unwrap();
    let event = wait_for(&mut alice_events, |e| matches!(e, ZreEvent::Whisper { .. })).await;
    assert_eq!(
        event,
        ZreEvent::Whisper {
            peer: bob_id,
            name: "bob".into(),
            content: vec![0, 1, 2, 255],
        }
    );

    let peers = bob.peers().await.unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].groups, vec!["CHAT".to_string()]);
    assert_eq!(peers[0].status, 1);

    tokio::time::timeout(WAIT, async {
        alice.stop().await;
        bob.stop().await;
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_silent_peer_expires() {
    let mut alice = ZreNode::new(loopback_config("alice"));
    let mut bob = ZreNode::new(NodeConfig {
        evasive_timeout: Duration::from_millis(150),
        expired_timeout: Duration::from_millis(400),
        ..loopback_config("bob")
    });
    let _alice_events = alice.start().await.unwrap();
    let mut bob_events = bob.start().await.unwrap();
    let alice_id = alice.identity();

    announce(&alice, &bob).await;
    wait_for(&mut bob_events, |e| matches!(e, ZreEvent::Connect { .. })).await;

    // Alice vanishes without a departure beacon reaching Bob.
    alice.stop().await;

    let event = wait_for(&mut bob_events, |e| matches!(e, ZreEvent::Expired { .. })).await;
    assert!(matches!(event, ZreEvent::Expired { peer, .. } if peer == alice_id));
    assert!(bob.peer(alice_id).await.unwrap().is_none());

    bob.stop().await;
}
