//! End-to-end stream transport tests over loopback UDP.

use std::time::Duration;

use bytes::Bytes;
use marlin_core::SocketAddress;
use marlin_crypto::StaticKeypair;
use marlin_stream::{StreamTransportFactory, TransportEvent};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

async fn wait_for<F, T>(events: &mut mpsc::Receiver<TransportEvent>, mut f: F) -> T
where
    F: FnMut(TransportEvent) -> Option<T>,
{
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if let Some(out) = f(event) {
                return out;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn handshake_and_bidirectional_data() {
    let ka = StaticKeypair::generate();
    let kb = StaticKeypair::generate();

    let (fa, mut ea) = StreamTransportFactory::bind(SocketAddress::loopback(0), ka.clone())
        .await
        .unwrap();
    let (fb, mut eb) = StreamTransportFactory::bind(SocketAddress::loopback(0), kb.clone())
        .await
        .unwrap();
    fa.listen();
    fb.listen();

    let a_to_b = fa.dial(fb.local_addr(), kb.public_bytes());

    // Both sides establish.
    wait_for(&mut ea, |e| match e {
        TransportEvent::DidDial(_) => Some(()),
        _ => None,
    })
    .await;
    let b_to_a = wait_for(&mut eb, |e| match e {
        TransportEvent::DidDial(t) => Some(t),
        _ => None,
    })
    .await;

    assert_eq!(b_to_a.remote_static_pk(), Some(ka.public_bytes()));

    // A -> B on stream 0.
    let payload = Bytes::from((0..20_000u32).map(|i| i as u8).collect::<Vec<u8>>());
    a_to_b.send(payload.clone(), 0).unwrap();
    a_to_b.flush_stream(0).unwrap();

    let mut received = Vec::new();
    while received.len() < payload.len() {
        let chunk = wait_for(&mut eb, |e| match e {
            TransportEvent::DidRecv {
                stream_id: 0, data, ..
            } => Some(data),
            _ => None,
        })
        .await;
        received.extend_from_slice(&chunk);
    }
    assert_eq!(received, payload);

    // Sender learns completion.
    wait_for(&mut ea, |e| match e {
        TransportEvent::DidSend { stream_id: 0, .. } => Some(()),
        _ => None,
    })
    .await;

    // B -> A on stream 3.
    b_to_a.send(Bytes::from_static(b"reply"), 3).unwrap();
    let reply = wait_for(&mut ea, |e| match e {
        TransportEvent::DidRecv {
            stream_id: 3, data, ..
        } => Some(data),
        _ => None,
    })
    .await;
    assert_eq!(&reply[..], b"reply");
}

#[tokio::test]
async fn skip_stream_reaches_receiver() {
    let ka = StaticKeypair::generate();
    let kb = StaticKeypair::generate();

    let (fa, mut ea) = StreamTransportFactory::bind(SocketAddress::loopback(0), ka)
        .await
        .unwrap();
    let (fb, mut eb) = StreamTransportFactory::bind(SocketAddress::loopback(0), kb.clone())
        .await
        .unwrap();
    fa.listen();
    fb.listen();

    let a_to_b = fa.dial(fb.local_addr(), kb.public_bytes());
    wait_for(&mut ea, |e| match e {
        TransportEvent::DidDial(_) => Some(()),
        _ => None,
    })
    .await;

    a_to_b.send(Bytes::from(vec![5u8; 4000]), 1).unwrap();
    a_to_b.skip_stream(1).unwrap();

    wait_for(&mut eb, |e| match e {
        TransportEvent::DidRecvSkipStream { stream_id: 1, .. } => Some(()),
        _ => None,
    })
    .await;
}

#[tokio::test]
async fn close_rejects_further_sends_and_notifies_peer() {
    let ka = StaticKeypair::generate();
    let kb = StaticKeypair::generate();

    let (fa, mut ea) = StreamTransportFactory::bind(SocketAddress::loopback(0), ka)
        .await
        .unwrap();
    let (fb, mut eb) = StreamTransportFactory::bind(SocketAddress::loopback(0), kb.clone())
        .await
        .unwrap();
    fa.listen();
    fb.listen();

    let a_to_b = fa.dial(fb.local_addr(), kb.public_bytes());
    wait_for(&mut ea, |e| match e {
        TransportEvent::DidDial(_) => Some(()),
        _ => None,
    })
    .await;
    wait_for(&mut eb, |e| match e {
        TransportEvent::DidDial(_) => Some(()),
        _ => None,
    })
    .await;

    a_to_b.close();
    a_to_b.close();
    assert!(a_to_b.send(Bytes::from_static(b"x"), 0).is_err());

    wait_for(&mut eb, |e| match e {
        TransportEvent::DidClose { .. } => Some(()),
        _ => None,
    })
    .await;

    // The factory forgets the transport once the task unwinds.
    timeout(WAIT, async {
        loop {
            if fa.get_transport(&fb.local_addr()).is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("transport not erased after close");
}

#[tokio::test]
async fn dial_returns_same_transport_for_same_peer() {
    let ka = StaticKeypair::generate();
    let kb = StaticKeypair::generate();

    let (fa, _ea) = StreamTransportFactory::bind(SocketAddress::loopback(0), ka)
        .await
        .unwrap();
    let (fb, _eb) = StreamTransportFactory::bind(SocketAddress::loopback(0), kb.clone())
        .await
        .unwrap();
    fa.listen();
    fb.listen();

    let t1 = fa.dial(fb.local_addr(), kb.public_bytes());
    let t2 = fa.dial(fb.local_addr(), kb.public_bytes());
    assert_eq!(t1.dst_addr(), t2.dst_addr());
    assert_eq!(fa.transport_count(), 1);
}
