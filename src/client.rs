use embassy_futures::select::{Either, select};
use embedded_io_async::{Read, Write};
use embedded_time::Clock;
use heapless::Vec;

use crate::{
    Address,
    connection::Connection,
    options::ConnectOptions,
    packet::{PacketId, QoS, subscribe::SubAckReturnCode},
    protocol::MAX_TOPICS_PER_REQUEST,
    session::{Event, Session, State},
    time::now_ms,
};

/// Opens transports to a broker. TLS transports implement the same trait.
#[allow(async_fn_in_trait)]
pub trait Connector {
    type Transport: Read + Write;

    async fn open(&mut self, address: &Address) -> Result<Self::Transport, crate::Error>;

    /// Sleeps for `delay_ms`. Used between reconnect attempts and to wake
    /// for keep-alive and timeout deadlines while a read is pending.
    async fn backoff(&mut self, delay_ms: u64);
}

/// Async MQTT client driving a [`Session`] over transports from `K`.
///
/// Operations that wait for the broker keep servicing the connection while
/// they wait. Events they do not consume stay queued for [`Client::poll`].
///
/// A pending read is raced against [`Connector::backoff`] up to the session's
/// next deadline, so timers fire on an idle link too.
pub struct Client<
    C,
    K,
    const N_PUB_IN: usize = 8,
    const N_PUB_OUT: usize = 8,
    const N_SUB: usize = 8,
    const BUF: usize = 1024,
> where
    C: Clock,
    K: Connector,
{
    clock: C,
    connector: K,
    address: Address,
    session: Session<N_PUB_IN, N_PUB_OUT, N_SUB>,
    connection: Option<Connection<K::Transport, BUF>>,
}

impl<C, K, const N_PUB_IN: usize, const N_PUB_OUT: usize, const N_SUB: usize, const BUF: usize>
    Client<C, K, N_PUB_IN, N_PUB_OUT, N_SUB, BUF>
where
    C: Clock,
    C::T: Into<u64>,
    K: Connector,
{
    pub fn new(clock: C, connector: K) -> Self {
        Self {
            clock,
            connector,
            address: Address::default(),
            session: Session::new(),
            connection: None,
        }
    }

    pub fn state(&self) -> State {
        self.session.state()
    }

    pub fn session(&self) -> &Session<N_PUB_IN, N_PUB_OUT, N_SUB> {
        &self.session
    }

    /// Connects to `address` and waits for the broker's CONNACK.
    ///
    /// Returns the broker's session-present flag. A refused CONNACK fails
    /// with [`crate::Error::ConnectionRefused`] and is not retried.
    pub async fn connect(
        &mut self,
        address: Address,
        options: ConnectOptions,
    ) -> Result<bool, crate::Error> {
        self.session.connect(options)?;
        self.address = address;

        loop {
            match self.session.state() {
                State::Connected => {
                    let event = self
                        .session
                        .take_event_where(|event| matches!(event, Event::Connected { .. }));

                    if let Some(Event::Connected { session_present }) = event {
                        return Ok(session_present);
                    }

                    return Ok(self.session.session_present());
                }
                State::Disconnected => {
                    return Err(self
                        .session
                        .last_error()
                        .unwrap_or(crate::Error::NotConnected));
                }
                _ => self.drive().await?,
            }
        }
    }

    /// Publishes and, for QoS 1 and 2, waits for the terminating
    /// acknowledgement. Returns the packet identifier used, if any.
    pub async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<Option<PacketId>, crate::Error> {
        let now = self.now()?;
        let Some(id) = self.session.publish(topic, payload, qos, retain, now)? else {
            self.flush().await?;
            return Ok(None);
        };

        match self.completion(id).await? {
            Event::Published { .. } => Ok(Some(id)),
            Event::Failed { error, .. } => Err(error),
            _ => Err(crate::Error::ProtocolViolation),
        }
    }

    /// Subscribes and returns the broker's per-filter return codes.
    pub async fn subscribe(
        &mut self,
        filters: &[(&str, QoS)],
    ) -> Result<Vec<SubAckReturnCode, MAX_TOPICS_PER_REQUEST>, crate::Error> {
        let now = self.now()?;
        let id = self.session.subscribe(filters, now)?;

        match self.completion(id).await? {
            Event::Subscribed { return_codes, .. } => Ok(return_codes),
            Event::Failed { error, .. } => Err(error),
            _ => Err(crate::Error::ProtocolViolation),
        }
    }

    pub async fn unsubscribe(&mut self, filters: &[&str]) -> Result<(), crate::Error> {
        let now = self.now()?;
        let id = self.session.unsubscribe(filters, now)?;

        match self.completion(id).await? {
            Event::Unsubscribed { .. } => Ok(()),
            Event::Failed { error, .. } => Err(error),
            _ => Err(crate::Error::ProtocolViolation),
        }
    }

    /// Sends DISCONNECT if connected and closes the transport. Cancels any
    /// scheduled reconnect.
    pub async fn disconnect(&mut self) -> Result<(), crate::Error> {
        let now = self.now()?;
        self.session.disconnect(now)?;

        while self.session.state() != State::Disconnected {
            self.drive().await?;
        }

        Ok(())
    }

    /// Next event, servicing the connection until one is available.
    ///
    /// Fails with [`crate::Error::NotConnected`] once the client has settled
    /// in [`State::Disconnected`] and every event has been taken.
    pub async fn poll(&mut self) -> Result<Event, crate::Error> {
        loop {
            if let Some(event) = self.session.poll_event() {
                return Ok(event);
            }

            if self.session.state() == State::Disconnected {
                return Err(crate::Error::NotConnected);
            }

            self.drive().await?;
        }
    }

    async fn completion(&mut self, id: PacketId) -> Result<Event, crate::Error> {
        loop {
            if let Some(event) = self
                .session
                .take_event_where(|event| event.packet_id() == Some(id))
            {
                return Ok(event);
            }

            self.drive().await?;
        }
    }

    /// Writes whatever is queued without waiting for input.
    async fn flush(&mut self) -> Result<(), crate::Error> {
        let Some(mut connection) = self.connection.take() else {
            return Ok(());
        };

        match connection.write_outgoing(&mut self.session).await {
            Ok(_) => self.connection = Some(connection),
            Err(err) => self.teardown(Some(err))?,
        }

        Ok(())
    }

    /// One step of work: timers, writes and a read on an open transport, or
    /// the next (re)connect attempt otherwise.
    async fn drive(&mut self) -> Result<(), crate::Error> {
        let now = self.now()?;

        let Some(mut connection) = self.connection.take() else {
            return self.reconnect_step(now).await;
        };

        let queued = self.session.pending_events();

        // a timer error has already closed the session side
        if self.session.poll_timers(now).is_err() {
            return Ok(());
        }

        if let Err(err) = connection.write_outgoing(&mut self.session).await {
            return self.teardown(Some(err));
        }

        if self.session.state() == State::Disconnecting {
            debug!("DISCONNECT written, closing transport");
            return self.teardown(None);
        }

        // a timer fired, let the caller look at it before blocking on a read
        if self.session.pending_events() > queued {
            self.connection = Some(connection);
            return Ok(());
        }

        let delay = self
            .session
            .next_deadline()
            .map(|at| at.saturating_sub(now));
        let clock = &self.clock;
        let read = connection.read_into(&mut self.session, || now_ms(clock));

        // the read gives way to the next timer, which the following call serves
        let result = match delay {
            Some(delay_ms) => match select(read, self.connector.backoff(delay_ms)).await {
                Either::First(result) => result,
                Either::Second(()) => Ok(0),
            },
            None => read.await,
        };

        match result {
            Ok(_) if self.session.is_transport_open() => {
                self.connection = Some(connection);
                Ok(())
            }
            // the session closed itself while handling a packet
            Ok(_) => Ok(()),
            Err(err) => self.teardown(Some(err)),
        }
    }

    async fn reconnect_step(&mut self, now: u64) -> Result<(), crate::Error> {
        if self.session.transport_due(now) {
            debug!("opening transport to {}", self.address.host.as_str());

            match self.connector.open(&self.address).await {
                Ok(transport) => {
                    let now = self.now()?;

                    if let Err(err) = self.session.transport_opened(now) {
                        self.session.transport_closed(Some(err), now);
                        return Err(err);
                    }

                    self.connection = Some(Connection::new(transport));
                }
                Err(err) => {
                    let now = self.now()?;
                    self.session.open_failed(err, now);
                }
            }

            return Ok(());
        }

        match self.session.reconnect_at() {
            Some(at) => {
                self.connector.backoff(at.saturating_sub(now)).await;
                Ok(())
            }
            None => Err(crate::Error::NotConnected),
        }
    }

    /// Drops the transport and reports the loss to the session.
    fn teardown(&mut self, error: Option<crate::Error>) -> Result<(), crate::Error> {
        self.connection = None;

        let now = self.now()?;
        self.session.transport_closed(error, now);

        Ok(())
    }

    fn now(&self) -> Result<u64, crate::Error> {
        now_ms(&self.clock)
    }
}
