use std::{cell::Cell, cell::RefCell, collections::VecDeque, convert::Infallible, rc::Rc};

use embedded_io_async::{ErrorType, Read, Write};
use embedded_time::{Instant, rate::Fraction};
use futures::executor::block_on;
use mqtt_engine::{
    Address, Client, ConnectOptions, ConnectReturnCode, Connector, Error, Event, QoS,
    ReconnectPolicy, State, SubAckReturnCode,
    packet::{self, Decoded, Packet},
    protocol::PacketType,
};

const CONNACK: &[u8] = &[0x20, 0x02, 0x00, 0x00];
const CONNACK_SESSION_PRESENT: &[u8] = &[0x20, 0x02, 0x01, 0x00];

#[derive(Clone, Default)]
struct TestClock(Rc<Cell<u64>>);

impl embedded_time::Clock for TestClock {
    type T = u64;

    const SCALING_FACTOR: Fraction = Fraction::new(1, 1000);

    fn try_now(&self) -> Result<Instant<Self>, embedded_time::clock::Error> {
        Ok(Instant::new(self.0.get()))
    }
}

/// Replays scripted reads and records writes. An exhausted script reads as
/// end of stream, or never completes when `idle` is set.
struct TestTransport {
    reads: VecDeque<Vec<u8>>,
    written: Rc<RefCell<Vec<u8>>>,
    idle: bool,
}

impl ErrorType for TestTransport {
    type Error = Infallible;
}

impl Read for TestTransport {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let Some(chunk) = self.reads.pop_front() else {
            if self.idle {
                return core::future::pending().await;
            }

            return Ok(0);
        };

        buf[..chunk.len()].copy_from_slice(&chunk);
        Ok(chunk.len())
    }
}

impl Write for TestTransport {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.written.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Hands out one scripted transport per `open`.
struct TestConnector {
    clock: TestClock,
    scripts: VecDeque<Result<Vec<&'static [u8]>, Error>>,
    opened: Rc<RefCell<Vec<Rc<RefCell<Vec<u8>>>>>>,
    backoffs: Rc<RefCell<Vec<u64>>>,
    idle: bool,
}

impl Connector for TestConnector {
    type Transport = TestTransport;

    async fn open(&mut self, _address: &Address) -> Result<TestTransport, Error> {
        let reads = self.scripts.pop_front().unwrap_or(Err(Error::TransportError))?;
        let written = Rc::new(RefCell::new(Vec::new()));
        self.opened.borrow_mut().push(written.clone());

        Ok(TestTransport {
            reads: reads.into_iter().map(<[u8]>::to_vec).collect(),
            written,
            idle: self.idle,
        })
    }

    async fn backoff(&mut self, delay_ms: u64) {
        self.backoffs.borrow_mut().push(delay_ms);
        self.clock.0.set(self.clock.0.get() + delay_ms);
    }
}

struct Harness {
    client: Client<TestClock, TestConnector, 4, 4, 4, 256>,
    clock: TestClock,
    opened: Rc<RefCell<Vec<Rc<RefCell<Vec<u8>>>>>>,
    backoffs: Rc<RefCell<Vec<u64>>>,
}

impl Harness {
    fn new(scripts: Vec<Result<Vec<&'static [u8]>, Error>>) -> Self {
        Self::build(scripts, false)
    }

    /// Transports stay open and silent once their script is played.
    fn idle(scripts: Vec<Result<Vec<&'static [u8]>, Error>>) -> Self {
        Self::build(scripts, true)
    }

    fn build(scripts: Vec<Result<Vec<&'static [u8]>, Error>>, idle: bool) -> Self {
        let clock = TestClock::default();
        let opened = Rc::new(RefCell::new(Vec::new()));
        let backoffs = Rc::new(RefCell::new(Vec::new()));

        let connector = TestConnector {
            clock: clock.clone(),
            scripts: scripts.into(),
            opened: opened.clone(),
            backoffs: backoffs.clone(),
            idle,
        };

        Self {
            client: Client::new(clock.clone(), connector),
            clock,
            opened,
            backoffs,
        }
    }

    /// Raw bytes written on the `n`th opened transport.
    fn written(&self, n: usize) -> Vec<u8> {
        self.opened.borrow()[n].borrow().clone()
    }
}

fn address() -> Address {
    "mqtt://broker.local".parse().unwrap()
}

/// Splits recorded bytes back into packets and hands them to `f`.
fn for_each_packet(mut bytes: &[u8], mut f: impl FnMut(Packet<'_>)) {
    while !bytes.is_empty() {
        match packet::decode(bytes).unwrap() {
            Decoded::Packet(packet, consumed) => {
                f(packet);
                bytes = &bytes[consumed..];
            }
            Decoded::NeedMoreData => panic!("truncated write"),
        }
    }
}

#[test]
fn resends_unacknowledged_publish_after_reconnect() {
    let mut harness = Harness::new(vec![
        Ok(vec![CONNACK]),
        // PUBACK for packet 1
        Ok(vec![CONNACK_SESSION_PRESENT, &[0x40, 0x02, 0x00, 0x01]]),
    ]);

    let options = ConnectOptions::new("c1").clean_session(false);

    block_on(async {
        assert_eq!(harness.client.connect(address(), options).await, Ok(false));

        // the first transport ends before the PUBACK arrives
        let id = harness
            .client
            .publish("a/b", b"hello", QoS::AtLeastOnce, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id.get(), 1);

        assert_eq!(harness.client.state(), State::Connected);
        assert_eq!(harness.client.poll().await, Ok(Event::Closed));
        assert_eq!(
            harness.client.poll().await,
            Ok(Event::Reconnecting {
                attempt: 1,
                delay_ms: 1000
            })
        );
        assert_eq!(
            harness.client.poll().await,
            Ok(Event::Connected {
                session_present: true
            })
        );
    });

    assert_eq!(*harness.backoffs.borrow(), vec![1000]);

    let mut first = Vec::new();
    for_each_packet(&harness.written(0), |packet| first.push(packet.packet_type()));
    assert_eq!(first.len(), 2);

    let mut publishes = Vec::new();
    for_each_packet(&harness.written(1), |packet| {
        if let Packet::Publish(publish) = packet {
            publishes.push((publish.flags.dup, publish.packet_id, publish.payload.to_vec()));
        }
    });

    assert_eq!(publishes.len(), 1);
    let (dup, packet_id, payload) = &publishes[0];
    assert!(dup);
    assert_eq!(packet_id.map(|id| id.get()), Some(1));
    assert_eq!(payload, b"hello");
}

#[test]
fn refused_connack_is_not_retried() {
    let mut harness = Harness::new(vec![Ok(vec![&[0x20, 0x02, 0x00, 0x05]]), Ok(vec![CONNACK])]);

    let result = block_on(harness.client.connect(address(), ConnectOptions::new("c1")));

    assert_eq!(
        result,
        Err(Error::ConnectionRefused(ConnectReturnCode::NotAuthorized))
    );
    assert_eq!(harness.client.state(), State::Disconnected);
    assert_eq!(harness.opened.borrow().len(), 1);

    block_on(async {
        assert_eq!(
            harness.client.poll().await,
            Ok(Event::Error(Error::ConnectionRefused(
                ConnectReturnCode::NotAuthorized
            )))
        );
        assert_eq!(harness.client.poll().await, Ok(Event::Closed));
        assert_eq!(harness.client.poll().await, Err(Error::NotConnected));
    });
}

#[test]
fn initial_open_failure() {
    let mut harness = Harness::new(vec![Err(Error::TransportError)]);

    let result = block_on(harness.client.connect(address(), ConnectOptions::new("c1")));

    assert_eq!(result, Err(Error::TransportError));
    assert_eq!(harness.client.state(), State::Disconnected);
    assert!(harness.backoffs.borrow().is_empty());
}

#[test]
fn framing_error_closes_and_reconnects() {
    let mut harness = Harness::new(vec![
        // reserved packet type 0
        Ok(vec![CONNACK, &[0x00, 0x00]]),
        Ok(vec![CONNACK]),
    ]);

    block_on(async {
        harness
            .client
            .connect(address(), ConnectOptions::new("c1"))
            .await
            .unwrap();

        assert_eq!(
            harness.client.poll().await,
            Ok(Event::Error(Error::InvalidPacketType))
        );
        assert_eq!(harness.client.poll().await, Ok(Event::Closed));
        assert!(matches!(
            harness.client.poll().await,
            Ok(Event::Reconnecting { attempt: 1, .. })
        ));
        assert_eq!(
            harness.client.poll().await,
            Ok(Event::Connected {
                session_present: false
            })
        );
    });

    assert_eq!(harness.opened.borrow().len(), 2);
}

#[test]
fn subscribe_then_receive() {
    let mut harness = Harness::new(vec![Ok(vec![
        CONNACK,
        // SUBACK 1, granted QoS 1
        &[0x90, 0x03, 0x00, 0x01, 0x01],
        // QoS 0 PUBLISH on a/b
        &[0x30, 0x07, 0x00, 0x03, b'a', b'/', b'b', b'h', b'i'],
    ])]);

    block_on(async {
        harness
            .client
            .connect(address(), ConnectOptions::new("c1"))
            .await
            .unwrap();

        let codes = harness
            .client
            .subscribe(&[("a/+", QoS::AtLeastOnce)])
            .await
            .unwrap();
        assert_eq!(codes.as_slice(), &[SubAckReturnCode::Success(QoS::AtLeastOnce)]);

        match harness.client.poll().await {
            Ok(Event::Message(message)) => {
                assert_eq!(message.topic, "a/b");
                assert_eq!(message.payload, b"hi");
                assert_eq!(message.qos, QoS::AtMostOnce);
                assert_eq!(message.granted, Some(QoS::AtLeastOnce));
            }
            other => panic!("unexpected {other:?}"),
        }
    });
}

#[test]
fn disconnect_sends_disconnect_and_stays_down() {
    let mut harness = Harness::new(vec![Ok(vec![CONNACK])]);

    let options = ConnectOptions::new("c1").reconnect(ReconnectPolicy::Fixed { delay_ms: 10 });

    block_on(async {
        harness.client.connect(address(), options).await.unwrap();
        harness.client.disconnect().await.unwrap();

        assert_eq!(harness.client.state(), State::Disconnected);
        assert_eq!(harness.client.poll().await, Ok(Event::Closed));
        assert_eq!(harness.client.poll().await, Err(Error::NotConnected));
    });

    let written = harness.written(0);
    assert_eq!(&written[written.len() - 2..], &[0xe0, 0x00]);
    assert!(harness.backoffs.borrow().is_empty());
}

#[test]
fn keep_alive_on_idle_link() {
    let mut harness = Harness::idle(vec![Ok(vec![CONNACK]), Ok(vec![CONNACK])]);

    let options = ConnectOptions::new("c1").keep_alive(10);

    block_on(async {
        harness.client.connect(address(), options).await.unwrap();

        // PINGREQ goes out at 10 s, nothing answers it by 20 s
        assert_eq!(
            harness.client.poll().await,
            Ok(Event::Error(Error::KeepAliveTimeout))
        );
    });

    assert_eq!(harness.clock.0.get(), 20_000);
    assert_eq!(*harness.backoffs.borrow(), vec![10_000, 10_000]);
    assert_eq!(harness.client.state(), State::Reconnecting);

    let mut sent = Vec::new();
    for_each_packet(&harness.written(0), |packet| sent.push(packet.packet_type()));
    assert_eq!(sent, [PacketType::Connect, PacketType::PingReq]);
}

#[test]
fn connack_timeout_on_idle_link() {
    let mut harness = Harness::idle(vec![Ok(vec![])]);

    let options = ConnectOptions::new("c1").connect_timeout_ms(3_000);
    let result = block_on(harness.client.connect(address(), options));

    assert_eq!(result, Err(Error::TimedOut));
    assert_eq!(harness.client.state(), State::Disconnected);
    assert_eq!(harness.clock.0.get(), 3_000);
}

#[test]
fn ack_timeout_on_idle_link() {
    let mut harness = Harness::idle(vec![Ok(vec![CONNACK])]);

    let options = ConnectOptions::new("c1").ack_timeout_ms(Some(5_000));

    block_on(async {
        harness.client.connect(address(), options).await.unwrap();

        assert_eq!(
            harness
                .client
                .publish("a/b", b"hello", QoS::AtLeastOnce, false)
                .await,
            Err(Error::TimedOut)
        );
    });

    assert_eq!(harness.clock.0.get(), 5_000);
    assert_eq!(harness.client.state(), State::Connected);
    assert_eq!(harness.client.session().in_flight(), 0);
}
