//! Multi-node pubsub scenarios over loopback UDP.

use std::time::Duration;

use bytes::Bytes;
use marlin_core::SocketAddress;
use marlin_crypto::StaticKeypair;
use marlin_lpf::LengthFramer;
use marlin_pubsub::{
    LpfBloomWitnesser, MessageFrame, PubSubConfig, PubSubHandle, PubSubNode, PubsubEvent,
    PubsubFrame, SigAttester, Witnesser,
};
use marlin_stream::{StreamTransportFactory, TransportEvent};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

struct Node {
    handle: PubSubHandle,
    events: mpsc::Receiver<PubsubEvent>,
    addr: SocketAddress,
    static_pk: [u8; 32],
}

async fn spawn_node(secp_seed: u8) -> Node {
    let keypair = StaticKeypair::generate();
    let (factory, transport_events) =
        StreamTransportFactory::bind(SocketAddress::loopback(0), keypair.clone())
            .await
            .unwrap();
    let addr = factory.local_addr();
    let static_pk = keypair.public_bytes();

    let attester = SigAttester::new(&[secp_seed; 32]).unwrap();
    let witnesser = LpfBloomWitnesser::new(static_pk);
    let config = PubSubConfig {
        max_sol_conns: 4,
        channels: vec![0],
        ..Default::default()
    };
    let (node, handle, events) =
        PubSubNode::new(factory, transport_events, attester, witnesser, static_pk, config);
    node.start();

    Node {
        handle,
        events,
        addr,
        static_pk,
    }
}

async fn next_message(node: &mut Node) -> Option<(u64, u16, Bytes)> {
    loop {
        let event = timeout(WAIT, node.events.recv()).await.ok()??;
        if let PubsubEvent::DidRecvMessage {
            message_id,
            channel,
            payload,
            ..
        } = event
        {
            return Some((message_id, channel, payload));
        }
    }
}

async fn no_message_within(node: &mut Node, window: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + window;
    loop {
        match tokio::time::timeout_at(deadline, node.events.recv()).await {
            Err(_) => return true,
            Ok(None) => return true,
            Ok(Some(PubsubEvent::DidRecvMessage { .. })) => return false,
            Ok(Some(_)) => continue,
        }
    }
}

#[tokio::test]
async fn fanout_delivers_exactly_once() {
    let mut n1 = spawn_node(11).await;
    let mut n2 = spawn_node(12).await;
    let mut n3 = spawn_node(13).await;

    // N2 solicits N1, N3 solicits N2.
    n2.handle.subscribe(n1.addr, n1.static_pk).await.unwrap();
    n3.handle.subscribe(n2.addr, n2.static_pk).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let payload = Bytes::from_static(b"a hundred byte block body ................................");
    n1.handle.publish(0, payload.clone()).await.unwrap();

    let (id2, ch2, p2) = next_message(&mut n2).await.unwrap();
    assert_eq!(ch2, 0);
    assert_eq!(p2, payload);

    let (id3, ch3, p3) = next_message(&mut n3).await.unwrap();
    assert_eq!(ch3, 0);
    assert_eq!(p3, payload);
    assert_eq!(id2, id3);

    // No duplicates anywhere, no echo at the origin.
    assert!(no_message_within(&mut n2, Duration::from_millis(500)).await);
    assert!(no_message_within(&mut n3, Duration::from_millis(500)).await);
    assert!(no_message_within(&mut n1, Duration::from_millis(500)).await);
}

#[tokio::test]
async fn ring_does_not_redeliver_at_origin() {
    let mut n1 = spawn_node(21).await;
    let mut n2 = spawn_node(22).await;
    let mut n3 = spawn_node(23).await;

    // Ring: N2←N1 traffic via N2.subscribe(N1), and onward so the
    // message can travel N1 → N2 → N3 → N1.
    n2.handle.subscribe(n1.addr, n1.static_pk).await.unwrap();
    n3.handle.subscribe(n2.addr, n2.static_pk).await.unwrap();
    n1.handle.subscribe(n3.addr, n3.static_pk).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    n1.handle
        .publish(0, Bytes::from_static(b"looping message"))
        .await
        .unwrap();

    assert!(next_message(&mut n2).await.is_some());
    assert!(next_message(&mut n3).await.is_some());
    // The origin never re-delivers its own message.
    assert!(no_message_within(&mut n1, Duration::from_millis(700)).await);
}

#[tokio::test]
async fn forged_attestation_is_dropped() {
    let mut n1 = spawn_node(31).await;

    // A raw peer that speaks the wire protocol directly.
    let keypair = StaticKeypair::generate();
    let (factory, mut events) =
        StreamTransportFactory::bind(SocketAddress::loopback(0), keypair.clone())
            .await
            .unwrap();
    factory.listen();
    let transport = factory.dial(n1.addr, n1.static_pk);
    timeout(WAIT, async {
        loop {
            if let Some(TransportEvent::DidDial(_)) = events.recv().await {
                break;
            }
        }
    })
    .await
    .unwrap();

    let attester = SigAttester::new(&[32u8; 32]).unwrap();
    let witnesser = LpfBloomWitnesser::new(keypair.public_bytes());
    let payload = Bytes::from_static(b"forged block");

    let mut attestation = Vec::new();
    use marlin_pubsub::Attester as _;
    attester.attest(7, 0, &payload, &[], &mut attestation).unwrap();
    let mut witness = Vec::new();
    witnesser.witness(&[], &mut witness).unwrap();

    // Flip one signature byte.
    let mut forged = attestation.clone();
    forged[10] ^= 0x01;

    let frame = PubsubFrame::Message(MessageFrame {
        message_id: 7,
        channel: 0,
        attestation: forged.into(),
        witness: witness.clone().into(),
        payload: payload.clone(),
    });
    transport
        .send(LengthFramer::encode(&frame.encode()).into(), 0)
        .unwrap();

    assert!(no_message_within(&mut n1, Duration::from_millis(700)).await);

    // The untampered frame goes through.
    let frame = PubsubFrame::Message(MessageFrame {
        message_id: 7,
        channel: 0,
        attestation: attestation.into(),
        witness: witness.into(),
        payload: payload.clone(),
    });
    transport
        .send(LengthFramer::encode(&frame.encode()).into(), 0)
        .unwrap();

    let (id, ch, p) = next_message(&mut n1).await.unwrap();
    assert_eq!((id, ch), (7, 0));
    assert_eq!(p, payload);
}

#[tokio::test]
async fn witnessed_message_is_not_forwarded() {
    let mut n1 = spawn_node(41).await;

    let keypair = StaticKeypair::generate();
    let (factory, mut events) =
        StreamTransportFactory::bind(SocketAddress::loopback(0), keypair.clone())
            .await
            .unwrap();
    factory.listen();
    let transport = factory.dial(n1.addr, n1.static_pk);
    timeout(WAIT, async {
        loop {
            if let Some(TransportEvent::DidDial(_)) = events.recv().await {
                break;
            }
        }
    })
    .await
    .unwrap();

    // Witness already contains N1's key bits: N1 must treat it as a loop.
    let attester = SigAttester::new(&[42u8; 32]).unwrap();
    let payload = Bytes::from_static(b"already seen");
    let mut attestation = Vec::new();
    use marlin_pubsub::Attester as _;
    attester.attest(9, 0, &payload, &[], &mut attestation).unwrap();

    let n1_witnesser = LpfBloomWitnesser::new(n1.static_pk);
    let mut witness = Vec::new();
    n1_witnesser.witness(&[], &mut witness).unwrap();

    let frame = PubsubFrame::Message(MessageFrame {
        message_id: 9,
        channel: 0,
        attestation: attestation.into(),
        witness: witness.into(),
        payload,
    });
    transport
        .send(LengthFramer::encode(&frame.encode()).into(), 0)
        .unwrap();

    assert!(no_message_within(&mut n1, Duration::from_millis(700)).await);
}
