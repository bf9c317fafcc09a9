//! The MQTT client state machine.
//!
//! [`Session`] performs no I/O and never reads a clock. Every operation takes
//! the current time in milliseconds, encoded frames pile up in an ordered
//! outbox ([`Session::take_outgoing`]) and notifications in an event queue
//! ([`Session::poll_event`]). [`crate::Client`] wires it to a transport.

use alloc::{
    collections::{BTreeMap, VecDeque},
    string::String,
    vec::Vec,
};

use heapless::Vec as BoundedVec;

use crate::{
    ErrorKind,
    incoming::{Incoming, Track},
    keep_alive::{Due, KeepAlive},
    options::ConnectOptions,
    packet::{
        Packet, PacketId, QoS,
        connect::{ConnAck, Connect, ConnectReturnCode, Will},
        publish::{Flags, Publish},
        subscribe::{SubAck, SubAckReturnCode, Subscribe, Subscription},
        unsubscribe::Unsubscribe,
    },
    packet_id_pool::{Filters, PacketIdPool, PendingPublish, PendingRequest, PubState, RequestKind},
    protocol::MAX_TOPICS_PER_REQUEST,
    topics,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum State {
    #[default]
    Disconnected,
    /// CONNECT is being sent or awaits its CONNACK.
    Connecting,
    Connected,
    /// A local disconnect is in progress. Never followed by a reconnect.
    Disconnecting,
    /// The connection dropped and another attempt is scheduled.
    Reconnecting,
}

/// Application message received from the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    /// Highest QoS granted to a subscription matching `topic`, if any.
    pub granted: Option<QoS>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Connected {
        session_present: bool,
    },
    Message(Message),
    /// The terminating acknowledgement of a QoS 1 or 2 publish arrived.
    Published {
        packet_id: PacketId,
    },
    Subscribed {
        packet_id: PacketId,
        return_codes: BoundedVec<SubAckReturnCode, MAX_TOPICS_PER_REQUEST>,
    },
    Unsubscribed {
        packet_id: PacketId,
    },
    /// The operation behind `packet_id` was abandoned.
    Failed {
        packet_id: PacketId,
        error: crate::Error,
    },
    Reconnecting {
        attempt: u32,
        delay_ms: u64,
    },
    Error(crate::Error),
    /// The transport went away. Emitted once per opened transport.
    Closed,
}

impl Event {
    /// Identifier of the operation this event completes.
    pub fn packet_id(&self) -> Option<PacketId> {
        match self {
            Self::Published { packet_id }
            | Self::Subscribed { packet_id, .. }
            | Self::Unsubscribed { packet_id }
            | Self::Failed { packet_id, .. } => Some(*packet_id),
            _ => None,
        }
    }
}

/// Work accepted while no connection was up, replayed in call order after
/// the next successful CONNACK.
enum Queued {
    Frame(Vec<u8>),
    Publish(PacketId),
    Request(RequestKind, PacketId),
}

pub struct Session<const N_PUB_IN: usize, const N_PUB_OUT: usize, const N_SUB: usize> {
    options: ConnectOptions,
    state: State,
    /// Reconnect attempt counter; zero while the first connect is running.
    attempt: u32,
    transport_open: bool,
    session_present: bool,
    connect_deadline: Option<u64>,
    reconnect_at: Option<u64>,
    last_error: Option<crate::Error>,
    keep_alive: KeepAlive,
    pool: PacketIdPool<N_PUB_OUT, N_SUB>,
    incoming: Incoming<N_PUB_IN>,
    subscriptions: BTreeMap<String, QoS>,
    offline: VecDeque<Queued>,
    outbox: VecDeque<Vec<u8>>,
    events: VecDeque<Event>,
}

impl<const N_PUB_IN: usize, const N_PUB_OUT: usize, const N_SUB: usize> Default
    for Session<N_PUB_IN, N_PUB_OUT, N_SUB>
{
    fn default() -> Self {
        Self::new()
    }
}

impl<const N_PUB_IN: usize, const N_PUB_OUT: usize, const N_SUB: usize>
    Session<N_PUB_IN, N_PUB_OUT, N_SUB>
{
    pub fn new() -> Self {
        Self {
            options: ConnectOptions::default(),
            state: State::Disconnected,
            attempt: 0,
            transport_open: false,
            session_present: false,
            connect_deadline: None,
            reconnect_at: None,
            last_error: None,
            keep_alive: KeepAlive::new(0, 0),
            pool: PacketIdPool::new(),
            incoming: Incoming::new(),
            subscriptions: BTreeMap::new(),
            offline: VecDeque::new(),
            outbox: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    /// Why the session last left the connected path.
    pub fn last_error(&self) -> Option<crate::Error> {
        self.last_error
    }

    pub fn session_present(&self) -> bool {
        self.session_present
    }

    pub fn is_transport_open(&self) -> bool {
        self.transport_open
    }

    /// Outgoing QoS 1 and 2 publishes not yet fully acknowledged.
    pub fn in_flight(&self) -> usize {
        self.pool.in_flight_publishes()
    }

    /// Inbound QoS 2 messages waiting for PUBREL.
    pub fn pending_inbound(&self) -> usize {
        self.incoming.len()
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = (&str, QoS)> {
        self.subscriptions
            .iter()
            .map(|(filter, qos)| (filter.as_str(), *qos))
    }

    pub fn granted_qos(&self, topic: &str) -> Option<QoS> {
        self.subscriptions
            .iter()
            .filter(|(filter, _)| topics::matches(filter, topic))
            .map(|(_, qos)| *qos)
            .max()
    }

    /// Starts connecting. The transport is opened by the driver, which polls
    /// [`Session::transport_due`] and reports back through
    /// [`Session::transport_opened`] or [`Session::open_failed`].
    pub fn connect(&mut self, options: ConnectOptions) -> Result<(), crate::Error> {
        if self.state != State::Disconnected {
            return Err(crate::Error::AlreadyConnected);
        }

        options.validate()?;

        info!("connecting as {}", options.client_id.as_str());

        self.options = options;
        self.state = State::Connecting;
        self.attempt = 0;
        self.last_error = None;

        Ok(())
    }

    /// Whether the driver should open a transport now.
    pub fn transport_due(&self, now: u64) -> bool {
        if self.transport_open {
            return false;
        }

        match self.state {
            State::Connecting => true,
            State::Reconnecting => self.reconnect_at.map_or(true, |at| now >= at),
            _ => false,
        }
    }

    pub fn reconnect_at(&self) -> Option<u64> {
        self.reconnect_at
    }

    /// A fresh transport is up: queue CONNECT and arm the CONNACK timeout.
    pub fn transport_opened(&mut self, now: u64) -> Result<(), crate::Error> {
        if self.transport_open {
            return Err(crate::Error::AlreadyConnected);
        }

        if !matches!(self.state, State::Connecting | State::Reconnecting) {
            return Err(crate::Error::NotConnected);
        }

        self.state = State::Connecting;
        self.transport_open = true;
        self.reconnect_at = None;
        self.outbox.clear();

        let frame = connect_frame(&self.options)?;
        self.enqueue(frame, now);
        self.connect_deadline = Some(now.saturating_add(self.options.effective_connect_timeout_ms()));

        debug!("CONNECT queued, attempt {}", self.attempt);

        Ok(())
    }

    /// Opening the transport did not succeed.
    pub fn open_failed(&mut self, error: crate::Error, now: u64) {
        if self.transport_open || !matches!(self.state, State::Connecting | State::Reconnecting) {
            return;
        }

        warn!("transport open failed: {:?}", error);
        self.after_loss(Some(error), now);
    }

    /// The transport closed, locally (`None`) or because of `error`.
    ///
    /// Safe to call more than once: only the first call after
    /// [`Session::transport_opened`] has an effect.
    pub fn transport_closed(&mut self, error: Option<crate::Error>, now: u64) {
        if !self.transport_open {
            return;
        }

        self.transport_open = false;
        self.connect_deadline = None;
        self.outbox.clear();

        if let Some(err) = error {
            if err.kind() != ErrorKind::Transport {
                self.events.push_back(Event::Error(err));
            }
        }

        self.events.push_back(Event::Closed);
        info!("connection closed in state {:?}", self.state);

        self.after_loss(error, now);
    }

    fn after_loss(&mut self, error: Option<crate::Error>, now: u64) {
        let retry = match self.state {
            State::Disconnecting | State::Disconnected => false,
            State::Connecting if self.attempt == 0 => false,
            _ => !matches!(error.map(|e| e.kind()), Some(ErrorKind::ConnectRejected)),
        };

        if retry {
            self.schedule_reconnect(error, now);
        } else {
            self.settle_disconnected(error);
        }
    }

    fn schedule_reconnect(&mut self, error: Option<crate::Error>, now: u64) {
        self.attempt = self.attempt.saturating_add(1);
        self.last_error = error;

        match self.options.reconnect.delay_ms(self.attempt) {
            Some(delay_ms) => {
                info!("reconnect attempt {} in {} ms", self.attempt, delay_ms);

                self.state = State::Reconnecting;
                self.reconnect_at = Some(now.saturating_add(delay_ms));
                self.events.push_back(Event::Reconnecting {
                    attempt: self.attempt,
                    delay_ms,
                });
            }
            None => self.settle_disconnected(error),
        }
    }

    fn settle_disconnected(&mut self, error: Option<crate::Error>) {
        info!("disconnected");

        self.state = State::Disconnected;
        self.attempt = 0;
        self.connect_deadline = None;
        self.reconnect_at = None;
        self.last_error = error;
        self.outbox.clear();

        // nothing left to complete pending operations
        for entry in self.pool.publishes() {
            self.events.push_back(Event::Failed {
                packet_id: entry.id,
                error: crate::Error::NotConnected,
            });
        }

        for kind in [RequestKind::Subscribe, RequestKind::Unsubscribe] {
            for request in self.pool.requests(kind) {
                self.events.push_back(Event::Failed {
                    packet_id: request.id,
                    error: crate::Error::NotConnected,
                });
            }
        }

        self.pool.clear();
        self.offline.clear();
        self.incoming.clear();
        self.subscriptions.clear();
    }

    /// Sends PUBLISH. Returns the packet identifier for QoS 1 and 2, whose
    /// completion is reported as [`Event::Published`].
    pub fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
        now: u64,
    ) -> Result<Option<PacketId>, crate::Error> {
        topics::validate_topic(topic)?;
        let online = self.accepts_requests()?;

        if qos == QoS::AtMostOnce {
            let frame = publish_frame(topic, payload, qos, retain, None, false)?;

            if online {
                self.enqueue(frame, now);
            } else if self.options.queue_qos0 {
                self.offline.push_back(Queued::Frame(frame));
            } else {
                return Err(crate::Error::NotConnected);
            }

            return Ok(None);
        }

        let id = self.pool.insert_publish(topic, payload, qos, retain)?;

        if online {
            if let Err(err) = self.send_publish(id, false, now) {
                self.pool.remove_publish(id);
                return Err(err);
            }
        } else {
            // surface oversized payloads now rather than at flush time
            if let Err(err) = publish_frame(topic, payload, qos, retain, Some(id), false) {
                self.pool.remove_publish(id);
                return Err(err);
            }

            self.offline.push_back(Queued::Publish(id));
        }

        Ok(Some(id))
    }

    pub fn subscribe(
        &mut self,
        filters: &[(&str, QoS)],
        now: u64,
    ) -> Result<PacketId, crate::Error> {
        let mut owned = Filters::new();

        for (filter, qos) in filters {
            topics::validate_filter(filter)?;
            owned
                .push(((*filter).into(), *qos))
                .map_err(|_| crate::Error::SubVectorIsFull)?;
        }

        self.request(RequestKind::Subscribe, owned, now)
    }

    pub fn unsubscribe(&mut self, filters: &[&str], now: u64) -> Result<PacketId, crate::Error> {
        let mut owned = Filters::new();

        for filter in filters {
            topics::validate_filter(filter)?;
            owned
                .push(((*filter).into(), QoS::AtMostOnce))
                .map_err(|_| crate::Error::SubVectorIsFull)?;
        }

        self.request(RequestKind::Unsubscribe, owned, now)
    }

    fn request(
        &mut self,
        kind: RequestKind,
        filters: Filters,
        now: u64,
    ) -> Result<PacketId, crate::Error> {
        if filters.is_empty() {
            return Err(crate::Error::InvalidTopic);
        }

        let online = self.accepts_requests()?;
        let id = self.pool.insert_request(kind, filters)?;

        if online {
            if let Err(err) = self.send_request(kind, id, now) {
                self.pool.take_request(kind, id);
                return Err(err);
            }
        } else {
            self.offline.push_back(Queued::Request(kind, id));
        }

        Ok(id)
    }

    /// `Ok(true)` when requests go straight out, `Ok(false)` when they are
    /// queued until the connection is back.
    fn accepts_requests(&self) -> Result<bool, crate::Error> {
        match self.state {
            State::Connected => Ok(true),
            State::Connecting | State::Reconnecting => Ok(false),
            State::Disconnecting | State::Disconnected => Err(crate::Error::NotConnected),
        }
    }

    /// Sends DISCONNECT when connected, or cancels a pending (re)connect.
    pub fn disconnect(&mut self, now: u64) -> Result<(), crate::Error> {
        match self.state {
            State::Disconnected => Err(crate::Error::NotConnected),
            State::Disconnecting => Ok(()),
            State::Connected => {
                self.send(Packet::Disconnect, now)?;
                self.state = State::Disconnecting;
                Ok(())
            }
            State::Connecting | State::Reconnecting => {
                if self.transport_open {
                    self.state = State::Disconnecting;
                } else {
                    self.settle_disconnected(None);
                }
                Ok(())
            }
        }
    }

    /// Handles one packet from the broker.
    ///
    /// An error means the connection has been torn down already and the
    /// transport must be dropped.
    pub fn handle_packet(&mut self, packet: Packet<'_>, now: u64) -> Result<(), crate::Error> {
        if !self.transport_open {
            return Err(crate::Error::NotConnected);
        }

        let packet_type = packet.packet_type();

        if !packet_type.is_server_to_client() {
            warn!("broker sent {:?}", packet_type);
            return self.violation(now);
        }

        self.keep_alive.on_receive();

        match (self.state, packet) {
            (State::Connecting, Packet::ConnAck(ack)) => self.on_connack(ack, now),
            (State::Connecting, _) => {
                warn!("{:?} before CONNACK", packet_type);
                self.violation(now)
            }
            (_, Packet::ConnAck(_)) => {
                warn!("unexpected CONNACK");
                self.violation(now)
            }
            (_, Packet::Publish(publish)) => self.on_publish(publish, now),
            (_, Packet::PubAck(id)) => {
                self.on_puback(id);
                Ok(())
            }
            (_, Packet::PubRec(id)) => self.on_pubrec(id, now),
            (_, Packet::PubRel(id)) => self.on_pubrel(id, now),
            (_, Packet::PubComp(id)) => {
                self.on_pubcomp(id);
                Ok(())
            }
            (_, Packet::SubAck(ack)) => {
                self.on_suback(ack);
                Ok(())
            }
            (_, Packet::UnsubAck(id)) => {
                self.on_unsuback(id);
                Ok(())
            }
            (_, Packet::PingResp) => {
                trace!("PINGRESP");
                Ok(())
            }
            // rejected above
            (
                _,
                Packet::Connect(_)
                | Packet::Subscribe(_)
                | Packet::Unsubscribe(_)
                | Packet::PingReq
                | Packet::Disconnect,
            ) => Ok(()),
        }
    }

    fn violation(&mut self, now: u64) -> Result<(), crate::Error> {
        self.transport_closed(Some(crate::Error::ProtocolViolation), now);
        Err(crate::Error::ProtocolViolation)
    }

    fn on_connack(&mut self, ack: ConnAck, now: u64) -> Result<(), crate::Error> {
        self.connect_deadline = None;

        if ack.return_code != ConnectReturnCode::Accepted {
            let err = crate::Error::ConnectionRefused(ack.return_code);
            warn!("connection refused: {:?}", ack.return_code);

            self.transport_closed(Some(err), now);
            return Err(err);
        }

        info!("connected, session present: {}", ack.session_present);

        self.state = State::Connected;
        self.attempt = 0;
        self.last_error = None;
        self.session_present = ack.session_present;
        self.keep_alive = KeepAlive::new(self.options.keep_alive_ms(), now);
        self.events.push_back(Event::Connected {
            session_present: ack.session_present,
        });

        if let Err(err) = self.resume(ack.session_present, now) {
            error!("cannot resume session: {:?}", err);
            self.transport_closed(Some(err), now);
            return Err(err);
        }

        Ok(())
    }

    /// Puts the previous connection's work back on the wire.
    fn resume(&mut self, session_present: bool, now: u64) -> Result<(), crate::Error> {
        self.retransmit(now)?;

        if !session_present {
            // the broker holds neither our subscriptions nor our PUBRELs
            self.incoming.clear();
            let granted = core::mem::take(&mut self.subscriptions);

            if self.options.resubscribe {
                self.resubscribe(granted, now);
            }
        }

        self.flush_offline(now)
    }

    /// Re-sends everything that was on the wire when the last connection
    /// dropped.
    fn retransmit(&mut self, now: u64) -> Result<(), crate::Error> {
        let clean = self.options.clean_session;

        let ids: Vec<PacketId> = self
            .pool
            .publishes()
            .iter()
            .filter(|entry| entry.last_sent.is_some())
            .map(|entry| entry.id)
            .collect();

        for id in ids {
            let Some(entry) = self.pool.publish_mut(id) else {
                continue;
            };

            entry.retries += 1;
            entry.last_sent = Some(now);
            debug!("retransmitting {:?}, retry {}", id, entry.retries);

            let frame = match entry.state {
                PubState::AwaitPubComp if !clean => Packet::PubRel(id).to_vec()?,
                PubState::AwaitPubComp => {
                    entry.state = PubState::AwaitPubRec;
                    pending_publish_frame(entry, true)?
                }
                PubState::AwaitPubAck | PubState::AwaitPubRec => pending_publish_frame(entry, true)?,
            };

            self.enqueue(frame, now);
        }

        for kind in [RequestKind::Subscribe, RequestKind::Unsubscribe] {
            let ids: Vec<PacketId> = self
                .pool
                .requests(kind)
                .iter()
                .filter(|request| request.last_sent.is_some())
                .map(|request| request.id)
                .collect();

            for id in ids {
                if let Some(request) = self.pool.request_mut(kind, id) {
                    request.retries += 1;
                    debug!("resending {:?} request {:?}, retry {}", kind, id, request.retries);
                }

                self.send_request(kind, id, now)?;
            }
        }

        Ok(())
    }

    fn resubscribe(&mut self, granted: BTreeMap<String, QoS>, now: u64) {
        let mut filters = Filters::new();

        for (filter, qos) in granted {
            if filters.is_full() {
                self.resubscribe_batch(core::mem::take(&mut filters), now);
            }

            // just drained if it was full
            let _ = filters.push((filter, qos));
        }

        if !filters.is_empty() {
            self.resubscribe_batch(filters, now);
        }
    }

    fn resubscribe_batch(&mut self, filters: Filters, now: u64) {
        let id = match self.pool.insert_request(RequestKind::Subscribe, filters) {
            Ok(id) => id,
            Err(err) => {
                warn!("cannot restore subscriptions: {:?}", err);
                return;
            }
        };

        debug!("restoring subscriptions with {:?}", id);

        if let Err(err) = self.send_request(RequestKind::Subscribe, id, now) {
            warn!("cannot restore subscriptions: {:?}", err);
            self.pool.take_request(RequestKind::Subscribe, id);
        }
    }

    fn flush_offline(&mut self, now: u64) -> Result<(), crate::Error> {
        while let Some(queued) = self.offline.pop_front() {
            match queued {
                Queued::Frame(frame) => self.enqueue(frame, now),
                Queued::Publish(id) => self.send_publish(id, false, now)?,
                Queued::Request(kind, id) => self.send_request(kind, id, now)?,
            }
        }

        Ok(())
    }

    fn on_publish(&mut self, publish: Publish<'_>, now: u64) -> Result<(), crate::Error> {
        let granted = self.granted_qos(publish.topic);

        match (publish.flags.qos, publish.packet_id) {
            (QoS::AtMostOnce, _) => {
                self.deliver(message(&publish, granted));
                Ok(())
            }
            (QoS::AtLeastOnce, Some(id)) => {
                self.deliver(message(&publish, granted));
                self.send(Packet::PubAck(id), now)
            }
            (QoS::ExactlyOnce, Some(id)) => {
                match self.incoming.track(id, || message(&publish, granted)) {
                    Ok(Track::New) => self.send(Packet::PubRec(id), now),
                    Ok(Track::Duplicate) => {
                        debug!("duplicate QoS 2 publish {:?}", id);
                        self.send(Packet::PubRec(id), now)
                    }
                    Err(err) => {
                        // no PUBREC, so the broker delivers it again later
                        warn!("dropping QoS 2 publish {:?}: {:?}", id, err);
                        Ok(())
                    }
                }
            }
            // decoding guarantees an identifier above QoS 0
            (_, None) => self.violation(now),
        }
    }

    fn deliver(&mut self, message: Message) {
        trace!("message on {}", message.topic.as_str());
        self.events.push_back(Event::Message(message));
    }

    fn on_puback(&mut self, id: PacketId) {
        match self.pool.on_puback(id) {
            Ok(_) => self.events.push_back(Event::Published { packet_id: id }),
            Err(_) => warn!("ignoring PUBACK for {:?}", id),
        }
    }

    fn on_pubrec(&mut self, id: PacketId, now: u64) -> Result<(), crate::Error> {
        if self.pool.on_pubrec(id).is_err() {
            warn!("ignoring PUBREC for {:?}", id);
            return Ok(());
        }

        if let Some(entry) = self.pool.publish_mut(id) {
            entry.last_sent = Some(now);
        }

        self.send(Packet::PubRel(id), now)
    }

    fn on_pubrel(&mut self, id: PacketId, now: u64) -> Result<(), crate::Error> {
        match self.incoming.release(id) {
            Some(message) => self.deliver(message),
            None => debug!("PUBREL for released {:?}", id),
        }

        self.send(Packet::PubComp(id), now)
    }

    fn on_pubcomp(&mut self, id: PacketId) {
        match self.pool.on_pubcomp(id) {
            Ok(_) => self.events.push_back(Event::Published { packet_id: id }),
            Err(_) => warn!("ignoring PUBCOMP for {:?}", id),
        }
    }

    fn on_suback(&mut self, ack: SubAck) {
        let Some(request) = self.pool.take_request(RequestKind::Subscribe, ack.packet_id) else {
            warn!("ignoring SUBACK for {:?}", ack.packet_id);
            return;
        };

        if request.filters.len() != ack.return_codes.len() {
            warn!(
                "SUBACK for {:?} carries {} codes for {} filters",
                ack.packet_id,
                ack.return_codes.len(),
                request.filters.len()
            );
        }

        for ((filter, _), code) in request.filters.into_iter().zip(ack.return_codes.iter()) {
            match code {
                SubAckReturnCode::Success(qos) => {
                    self.subscriptions.insert(filter, *qos);
                }
                SubAckReturnCode::Failure => warn!("subscription to {} refused", filter.as_str()),
            }
        }

        self.events.push_back(Event::Subscribed {
            packet_id: ack.packet_id,
            return_codes: ack.return_codes,
        });
    }

    fn on_unsuback(&mut self, id: PacketId) {
        let Some(request) = self.pool.take_request(RequestKind::Unsubscribe, id) else {
            warn!("ignoring UNSUBACK for {:?}", id);
            return;
        };

        for (filter, _) in &request.filters {
            self.subscriptions.remove(filter);
        }

        self.events.push_back(Event::Unsubscribed { packet_id: id });
    }

    /// Drives keep-alive, the CONNACK timeout and acknowledgement timeouts.
    ///
    /// An error means the connection has been torn down already and the
    /// transport must be dropped.
    pub fn poll_timers(&mut self, now: u64) -> Result<(), crate::Error> {
        match self.state {
            State::Connecting if self.transport_open => {
                if self.connect_deadline.is_some_and(|at| now >= at) {
                    warn!("no CONNACK in time");
                    self.transport_closed(Some(crate::Error::TimedOut), now);
                    return Err(crate::Error::TimedOut);
                }
            }
            State::Connected => {
                match self.keep_alive.poll(now) {
                    Due::Ping => {
                        debug!("sending PINGREQ");
                        self.send(Packet::PingReq, now)?;
                        self.keep_alive.on_ping_sent(now);
                    }
                    Due::Dead => {
                        warn!("no PINGRESP within keep-alive");
                        self.transport_closed(Some(crate::Error::KeepAliveTimeout), now);
                        return Err(crate::Error::KeepAliveTimeout);
                    }
                    Due::Nothing => {}
                }

                self.expire_acks(now);
            }
            _ => {}
        }

        Ok(())
    }

    fn expire_acks(&mut self, now: u64) {
        let Some(timeout) = self.options.ack_timeout_ms else {
            return;
        };

        let expired = |last_sent: Option<u64>| {
            last_sent.is_some_and(|sent| now.saturating_sub(sent) >= timeout)
        };

        let ids: Vec<PacketId> = self
            .pool
            .publishes()
            .iter()
            .filter(|entry| expired(entry.last_sent))
            .map(|entry| entry.id)
            .collect();

        for id in ids {
            warn!("{:?} not acknowledged in time", id);
            self.pool.remove_publish(id);
            self.events.push_back(Event::Failed {
                packet_id: id,
                error: crate::Error::TimedOut,
            });
        }

        for kind in [RequestKind::Subscribe, RequestKind::Unsubscribe] {
            let ids: Vec<PacketId> = self
                .pool
                .requests(kind)
                .iter()
                .filter(|request| expired(request.last_sent))
                .map(|request| request.id)
                .collect();

            for id in ids {
                warn!("{:?} not acknowledged in time", id);
                self.pool.take_request(kind, id);
                self.events.push_back(Event::Failed {
                    packet_id: id,
                    error: crate::Error::TimedOut,
                });
            }
        }
    }

    /// Earliest instant at which [`Session::poll_timers`] or a reconnect has
    /// work to do.
    pub fn next_deadline(&self) -> Option<u64> {
        match self.state {
            State::Connecting => self.connect_deadline,
            State::Reconnecting => self.reconnect_at,
            State::Connected => {
                let ack = self
                    .options
                    .ack_timeout_ms
                    .and_then(|timeout| self.pool.oldest_sent().map(|sent| sent.saturating_add(timeout)));

                [self.keep_alive.deadline(), ack].into_iter().flatten().min()
            }
            State::Disconnecting | State::Disconnected => None,
        }
    }

    /// Next encoded frame to write, in the order frames were produced.
    pub fn take_outgoing(&mut self) -> Option<Vec<u8>> {
        self.outbox.pop_front()
    }

    pub fn has_outgoing(&self) -> bool {
        !self.outbox.is_empty()
    }

    /// Number of events waiting for [`Session::poll_event`].
    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Removes the first queued event matching `f`, leaving the rest in order.
    pub fn take_event_where<F>(&mut self, mut f: F) -> Option<Event>
    where
        F: FnMut(&Event) -> bool,
    {
        let index = self.events.iter().position(|event| f(event))?;
        self.events.remove(index)
    }

    fn send(&mut self, packet: Packet<'_>, now: u64) -> Result<(), crate::Error> {
        let frame = packet.to_vec()?;
        self.enqueue(frame, now);
        Ok(())
    }

    fn enqueue(&mut self, frame: Vec<u8>, now: u64) {
        self.outbox.push_back(frame);
        self.keep_alive.on_send(now);
    }

    fn send_publish(&mut self, id: PacketId, dup: bool, now: u64) -> Result<(), crate::Error> {
        let frame = match self.pool.publish(id) {
            Some(entry) => pending_publish_frame(entry, dup)?,
            None => return Ok(()),
        };

        self.enqueue(frame, now);

        if let Some(entry) = self.pool.publish_mut(id) {
            entry.last_sent = Some(now);
        }

        Ok(())
    }

    fn send_request(&mut self, kind: RequestKind, id: PacketId, now: u64) -> Result<(), crate::Error> {
        let frame = match self.pool.request(kind, id) {
            Some(request) => request_frame(kind, request)?,
            None => return Ok(()),
        };

        self.enqueue(frame, now);

        if let Some(request) = self.pool.request_mut(kind, id) {
            request.last_sent = Some(now);
        }

        Ok(())
    }
}

fn message(publish: &Publish<'_>, granted: Option<QoS>) -> Message {
    Message {
        topic: publish.topic.into(),
        payload: publish.payload.into(),
        qos: publish.flags.qos,
        retain: publish.flags.retain,
        dup: publish.flags.dup,
        granted,
    }
}

fn connect_frame(options: &ConnectOptions) -> Result<Vec<u8>, crate::Error> {
    let will = options.will.as_ref().map(|will| Will {
        qos: will.qos,
        retain: will.retain,
        topic: &will.topic,
        payload: &will.payload,
    });

    Packet::Connect(Connect {
        protocol: options.protocol,
        clean_session: options.clean_session,
        keep_alive: options.keep_alive,
        client_id: &options.client_id,
        will,
        username: options.username.as_deref(),
        password: options.password.as_deref(),
    })
    .to_vec()
}

fn publish_frame(
    topic: &str,
    payload: &[u8],
    qos: QoS,
    retain: bool,
    packet_id: Option<PacketId>,
    dup: bool,
) -> Result<Vec<u8>, crate::Error> {
    Packet::Publish(Publish {
        flags: Flags { dup, qos, retain },
        topic,
        packet_id,
        payload,
    })
    .to_vec()
}

fn pending_publish_frame(entry: &PendingPublish, dup: bool) -> Result<Vec<u8>, crate::Error> {
    publish_frame(
        &entry.topic,
        &entry.payload,
        entry.qos,
        entry.retain,
        Some(entry.id),
        dup,
    )
}

fn request_frame(kind: RequestKind, request: &PendingRequest) -> Result<Vec<u8>, crate::Error> {
    match kind {
        RequestKind::Subscribe => {
            let mut topics = BoundedVec::new();

            for (filter, qos) in &request.filters {
                topics
                    .push(Subscription {
                        topic_filter: filter.as_str(),
                        qos: *qos,
                    })
                    .map_err(|_| crate::Error::SubVectorIsFull)?;
            }

            Packet::Subscribe(Subscribe {
                packet_id: request.id,
                topics,
            })
            .to_vec()
        }
        RequestKind::Unsubscribe => {
            let mut topics = BoundedVec::new();

            for (filter, _) in &request.filters {
                topics
                    .push(filter.as_str())
                    .map_err(|_| crate::Error::SubVectorIsFull)?;
            }

            Packet::Unsubscribe(Unsubscribe {
                packet_id: request.id,
                topics,
            })
            .to_vec()
        }
    }
}
