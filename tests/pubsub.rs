//! End-to-end pub/sub scenarios across two bus processes on loopback.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use simbus::prelude::*;

#[derive(Debug, Clone, PartialEq, Eq)]
struct ChatMsg(String);

impl Message for ChatMsg {
    const TYPE_NAME: &'static str = "e2e.chat.v1";

    fn encode(&self) -> Vec<u8> {
        self.0.as_bytes().to_vec()
    }

    fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let s = std::str::from_utf8(data)
            .map_err(|e| DecodeError::InvalidEncoding(e.to_string()))?;
        Ok(ChatMsg(s.to_owned()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StepMsg(u64);

impl Message for StepMsg {
    const TYPE_NAME: &'static str = "e2e.step.v1";

    fn encode(&self) -> Vec<u8> {
        self.0.to_le_bytes().to_vec()
    }

    fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let bytes: [u8; 8] = data.try_into().map_err(|_| DecodeError::UnexpectedEof)?;
        Ok(StepMsg(u64::from_le_bytes(bytes)))
    }
}

async fn bus_pair() -> (Arc<Bus>, Arc<Bus>) {
    let a = Bus::init(BusConfig::default()).await.unwrap();
    let b = Bus::init(BusConfig::default()).await.unwrap();
    (a, b)
}

/// Poll `tick` until `done` returns true or the deadline passes.
async fn drive(mut tick: impl FnMut(), done: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            tick();
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("scenario did not complete in time");
}

#[tokio::test(flavor = "multi_thread")]
async fn latched_message_reaches_late_subscriber_exactly_once() {
    let (bus_a, bus_b) = bus_pair().await;

    let node_a = bus_a.create_node("a");
    let publisher = node_a.advertise::<ChatMsg>("/t", 1, true).unwrap();
    publisher.publish(&ChatMsg("hello".into()));
    node_a.process_publishers();

    // The subscriber shows up well after the publish.
    tokio::time::sleep(Duration::from_millis(500)).await;

    bus_b
        .connect_peer("127.0.0.1", bus_a.listen_addr().port())
        .await
        .unwrap();

    let node_b = bus_b.create_node("b");
    let received = Arc::new(Mutex::new(Vec::new()));
    let r = Arc::clone(&received);
    let _sub = node_b
        .subscribe("/t", move |msg: ChatMsg| r.lock().unwrap().push(msg.0), false)
        .await
        .unwrap();

    let r = Arc::clone(&received);
    drive(
        || node_b.process_incoming(),
        move || !r.lock().unwrap().is_empty(),
    )
    .await;
    assert_eq!(*received.lock().unwrap(), vec!["hello".to_owned()]);

    // No spurious replays afterwards.
    tokio::time::sleep(Duration::from_millis(200)).await;
    node_b.process_incoming();
    assert_eq!(received.lock().unwrap().len(), 1);

    // Live messages arrive after the latched one, strictly in order.
    publisher.publish(&ChatMsg("world".into()));
    publisher.publish(&ChatMsg("again".into()));
    node_a.process_publishers();

    let r = Arc::clone(&received);
    drive(
        || node_b.process_incoming(),
        move || r.lock().unwrap().len() >= 3,
    )
    .await;
    assert_eq!(
        *received.lock().unwrap(),
        vec!["hello".to_owned(), "world".to_owned(), "again".to_owned()]
    );

    bus_a.fini();
    bus_b.fini();
}

#[tokio::test(flavor = "multi_thread")]
async fn messages_arrive_in_publish_order() {
    let (bus_a, bus_b) = bus_pair().await;
    bus_b
        .connect_peer("127.0.0.1", bus_a.listen_addr().port())
        .await
        .unwrap();

    let node_a = bus_a.create_node("a");
    let node_b = bus_b.create_node("b");

    let publisher = node_a.advertise::<StepMsg>("/steps", 0, false).unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let r = Arc::clone(&received);
    let _sub = node_b
        .subscribe("/steps", move |msg: StepMsg| r.lock().unwrap().push(msg.0), false)
        .await
        .unwrap();

    // Wait until the subscriber is attached on the publisher side;
    // messages published before that are not queued for it.
    let topics_a = Arc::clone(bus_a.topics());
    drive(
        || {},
        move || {
            topics_a
                .publication("/steps")
                .is_some_and(|p| p.remote_sub_count() >= 1)
        },
    )
    .await;

    const COUNT: u64 = 100;
    for i in 0..COUNT {
        publisher.publish(&StepMsg(i));
    }
    node_a.process_publishers();

    let r = Arc::clone(&received);
    drive(
        || node_b.process_incoming(),
        move || r.lock().unwrap().len() as u64 >= COUNT,
    )
    .await;
    let got = received.lock().unwrap().clone();
    assert_eq!(got, (0..COUNT).collect::<Vec<_>>());

    bus_a.fini();
    bus_b.fini();
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_advertise_creates_no_duplicate_streams() {
    let (bus_a, bus_b) = bus_pair().await;
    bus_b
        .connect_peer("127.0.0.1", bus_a.listen_addr().port())
        .await
        .unwrap();

    let node_a = bus_a.create_node("a");
    // Same (topic, type) twice: independent handles, one record.
    let pub1 = node_a.advertise::<ChatMsg>("/dup", 10, false).unwrap();
    let pub2 = node_a.advertise::<ChatMsg>("/dup", 10, false).unwrap();

    let node_b = bus_b.create_node("b");
    let count = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&count);
    let _sub = node_b
        .subscribe("/dup", move |_msg: ChatMsg| {
            c.fetch_add(1, Ordering::SeqCst);
        }, false)
        .await
        .unwrap();

    // Exactly one inbound stream despite the duplicate advertisement.
    let topics_b = Arc::clone(bus_b.topics());
    drive(|| {}, move || topics_b.transport_count() >= 1).await;
    assert_eq!(bus_b.topics().transport_count(), 1);

    // One subscriber attachment on the publisher side.
    let publication = bus_a.topics().publication("/dup").unwrap();
    let p = Arc::clone(&publication);
    drive(|| {}, move || p.remote_sub_count() >= 1).await;
    assert_eq!(publication.remote_sub_count(), 1);

    // Both handles deliver, each message once.
    pub1.publish(&ChatMsg("from-first".into()));
    pub2.publish(&ChatMsg("from-second".into()));
    node_a.process_publishers();

    let c = Arc::clone(&count);
    drive(
        || node_b.process_incoming(),
        move || c.load(Ordering::SeqCst) >= 2,
    )
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    node_b.process_incoming();
    assert_eq!(count.load(Ordering::SeqCst), 2);

    bus_a.fini();
    bus_b.fini();
}

#[tokio::test(flavor = "multi_thread")]
async fn publisher_teardown_closes_subscriber_stream() {
    let (bus_a, bus_b) = bus_pair().await;
    bus_b
        .connect_peer("127.0.0.1", bus_a.listen_addr().port())
        .await
        .unwrap();

    let node_a = bus_a.create_node("a");
    let _publisher = node_a.advertise::<ChatMsg>("/gone", 1, false).unwrap();

    let node_b = bus_b.create_node("b");
    let _sub = node_b
        .subscribe("/gone", |_msg: ChatMsg| {}, false)
        .await
        .unwrap();

    let topics_b = Arc::clone(bus_b.topics());
    drive(|| {}, move || topics_b.transport_count() == 1).await;

    // Publisher process goes away; the inbound stream must wind down.
    bus_a.fini();
    let topics_b = Arc::clone(bus_b.topics());
    drive(|| {}, move || topics_b.transport_count() == 0).await;

    bus_b.fini();
}

#[tokio::test(flavor = "multi_thread")]
async fn unsubscribe_detaches_remote_stream() {
    let (bus_a, bus_b) = bus_pair().await;
    bus_b
        .connect_peer("127.0.0.1", bus_a.listen_addr().port())
        .await
        .unwrap();

    let node_a = bus_a.create_node("a");
    let _publisher = node_a.advertise::<ChatMsg>("/leave", 1, false).unwrap();

    let node_b = bus_b.create_node("b");
    let sub = node_b
        .subscribe("/leave", |_msg: ChatMsg| {}, false)
        .await
        .unwrap();

    let topics_b = Arc::clone(bus_b.topics());
    drive(|| {}, move || topics_b.transport_count() == 1).await;

    sub.unsubscribe();
    assert_eq!(bus_b.topics().transport_count(), 0);

    bus_a.fini();
    bus_b.fini();
}

#[tokio::test(flavor = "multi_thread")]
async fn subscribe_before_advertise_still_connects() {
    let (bus_a, bus_b) = bus_pair().await;
    bus_b
        .connect_peer("127.0.0.1", bus_a.listen_addr().port())
        .await
        .unwrap();

    // Subscription first; the advertisement arrives later and the data
    // link is negotiated on receipt.
    let node_b = bus_b.create_node("b");
    let received = Arc::new(Mutex::new(Vec::new()));
    let r = Arc::clone(&received);
    let _sub = node_b
        .subscribe("/late", move |msg: ChatMsg| r.lock().unwrap().push(msg.0), false)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;

    let node_a = bus_a.create_node("a");
    let publisher = node_a.advertise::<ChatMsg>("/late", 1, false).unwrap();

    let topics_a = Arc::clone(bus_a.topics());
    drive(
        || {},
        move || {
            topics_a
                .publication("/late")
                .is_some_and(|p| p.remote_sub_count() >= 1)
        },
    )
    .await;

    publisher.publish(&ChatMsg("made it".into()));
    node_a.process_publishers();

    let r = Arc::clone(&received);
    drive(
        || node_b.process_incoming(),
        move || !r.lock().unwrap().is_empty(),
    )
    .await;
    assert_eq!(*received.lock().unwrap(), vec!["made it".to_owned()]);

    bus_a.fini();
    bus_b.fini();
}
