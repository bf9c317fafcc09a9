use alloc::{string::String, vec::Vec};

use heapless::Vec as BoundedVec;

use crate::{
    packet::{PacketId, QoS},
    protocol::MAX_TOPICS_PER_REQUEST,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PubState {
    AwaitPubAck,
    AwaitPubRec,
    AwaitPubComp,
}

/// Outgoing QoS 1/2 publish kept until its terminating acknowledgement.
#[derive(Debug)]
pub(crate) struct PendingPublish {
    pub(crate) id: PacketId,
    pub(crate) topic: String,
    pub(crate) payload: Vec<u8>,
    pub(crate) qos: QoS,
    pub(crate) retain: bool,
    pub(crate) state: PubState,
    pub(crate) retries: u32,
    /// `None` while the publish sits in the offline queue.
    pub(crate) last_sent: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum RequestKind {
    Subscribe,
    Unsubscribe,
}

pub(crate) type Filters = BoundedVec<(String, QoS), MAX_TOPICS_PER_REQUEST>;

/// SUBSCRIBE or UNSUBSCRIBE waiting for its acknowledgement.
#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub(crate) id: PacketId,
    /// QoS is ignored for UNSUBSCRIBE.
    pub(crate) filters: Filters,
    pub(crate) retries: u32,
    pub(crate) last_sent: Option<u64>,
}

/// Owns every outgoing packet identifier currently in flight.
pub(crate) struct PacketIdPool<const N_PUB_OUT: usize, const N_SUB: usize> {
    pubs: BoundedVec<PendingPublish, N_PUB_OUT>,
    subs: BoundedVec<PendingRequest, N_SUB>,
    unsubs: BoundedVec<PendingRequest, N_SUB>,
    next_id: u16,
}

impl<const N_PUB_OUT: usize, const N_SUB: usize> PacketIdPool<N_PUB_OUT, N_SUB> {
    pub(crate) fn new() -> Self {
        Self {
            pubs: BoundedVec::new(),
            subs: BoundedVec::new(),
            unsubs: BoundedVec::new(),
            next_id: 1,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.pubs.clear();
        self.subs.clear();
        self.unsubs.clear();
    }

    pub(crate) fn in_flight_publishes(&self) -> usize {
        self.pubs.len()
    }

    pub(crate) fn insert_publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<PacketId, crate::Error> {
        let state = match qos {
            QoS::AtMostOnce => return Err(crate::Error::InvalidQoS),
            QoS::AtLeastOnce => PubState::AwaitPubAck,
            QoS::ExactlyOnce => PubState::AwaitPubRec,
        };

        if self.pubs.is_full() {
            return Err(crate::Error::NoPacketIdAvailable);
        }

        let id = self.next_id()?;

        self.pubs
            .push(PendingPublish {
                id,
                topic: topic.into(),
                payload: payload.into(),
                qos,
                retain,
                state,
                retries: 0,
                last_sent: None,
            })
            .map_err(|_| crate::Error::NoPacketIdAvailable)?;

        Ok(id)
    }

    pub(crate) fn insert_request(
        &mut self,
        kind: RequestKind,
        filters: Filters,
    ) -> Result<PacketId, crate::Error> {
        if self.requests(kind).is_full() {
            return Err(crate::Error::NoPacketIdAvailable);
        }

        let id = self.next_id()?;

        self.requests_mut(kind)
            .push(PendingRequest {
                id,
                filters,
                retries: 0,
                last_sent: None,
            })
            .map_err(|_| crate::Error::NoPacketIdAvailable)?;

        Ok(id)
    }

    /// Next free identifier after the last one handed out, wrapping from
    /// 65535 to 1.
    fn next_id(&mut self) -> Result<PacketId, crate::Error> {
        for _ in 0..u16::MAX {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);

            if self.next_id == 0 {
                self.next_id = 1;
            }

            if self.contains(id) {
                continue;
            }

            return PacketId::try_from(id);
        }

        Err(crate::Error::NoPacketIdAvailable)
    }

    fn contains(&self, id: u16) -> bool {
        self.pubs.iter().any(|p| p.id.get() == id)
            || self.subs.iter().any(|r| r.id.get() == id)
            || self.unsubs.iter().any(|r| r.id.get() == id)
    }

    pub(crate) fn publish(&self, id: PacketId) -> Option<&PendingPublish> {
        self.pubs.iter().find(|p| p.id == id)
    }

    pub(crate) fn publish_mut(&mut self, id: PacketId) -> Option<&mut PendingPublish> {
        self.pubs.iter_mut().find(|p| p.id == id)
    }

    pub(crate) fn publishes(&self) -> &[PendingPublish] {
        &self.pubs
    }

    pub(crate) fn remove_publish(&mut self, id: PacketId) -> Option<PendingPublish> {
        let index = self.pubs.iter().position(|p| p.id == id)?;
        Some(self.pubs.remove(index))
    }

    /// PUBACK terminates a QoS 1 publish.
    pub(crate) fn on_puback(&mut self, id: PacketId) -> Result<PendingPublish, crate::Error> {
        self.complete(id, PubState::AwaitPubAck)
    }

    /// PUBREC moves a QoS 2 publish on to awaiting PUBCOMP. A repeated PUBREC
    /// is accepted so the PUBREL can be sent again.
    pub(crate) fn on_pubrec(&mut self, id: PacketId) -> Result<(), crate::Error> {
        let entry = self
            .publish_mut(id)
            .ok_or(crate::Error::ProtocolViolation)?;

        match entry.state {
            PubState::AwaitPubRec => {
                entry.state = PubState::AwaitPubComp;
                Ok(())
            }
            PubState::AwaitPubComp => Ok(()),
            PubState::AwaitPubAck => Err(crate::Error::ProtocolViolation),
        }
    }

    pub(crate) fn on_pubcomp(&mut self, id: PacketId) -> Result<PendingPublish, crate::Error> {
        self.complete(id, PubState::AwaitPubComp)
    }

    fn complete(
        &mut self,
        id: PacketId,
        expected: PubState,
    ) -> Result<PendingPublish, crate::Error> {
        match self.pubs.iter().position(|p| p.id == id) {
            Some(index) if self.pubs[index].state == expected => Ok(self.pubs.remove(index)),
            _ => Err(crate::Error::ProtocolViolation),
        }
    }

    pub(crate) fn request(&self, kind: RequestKind, id: PacketId) -> Option<&PendingRequest> {
        self.requests(kind).iter().find(|r| r.id == id)
    }

    pub(crate) fn request_mut(
        &mut self,
        kind: RequestKind,
        id: PacketId,
    ) -> Option<&mut PendingRequest> {
        self.requests_mut(kind).iter_mut().find(|r| r.id == id)
    }

    pub(crate) fn take_request(&mut self, kind: RequestKind, id: PacketId) -> Option<PendingRequest> {
        let requests = self.requests_mut(kind);
        let index = requests.iter().position(|r| r.id == id)?;
        Some(requests.remove(index))
    }

    pub(crate) fn requests(&self, kind: RequestKind) -> &BoundedVec<PendingRequest, N_SUB> {
        match kind {
            RequestKind::Subscribe => &self.subs,
            RequestKind::Unsubscribe => &self.unsubs,
        }
    }

    pub(crate) fn requests_mut(
        &mut self,
        kind: RequestKind,
    ) -> &mut BoundedVec<PendingRequest, N_SUB> {
        match kind {
            RequestKind::Subscribe => &mut self.subs,
            RequestKind::Unsubscribe => &mut self.unsubs,
        }
    }

    /// Earliest `last_sent` among transmitted entries.
    pub(crate) fn oldest_sent(&self) -> Option<u64> {
        let pubs = self.pubs.iter().filter_map(|p| p.last_sent);
        let subs = self.subs.iter().filter_map(|r| r.last_sent);
        let unsubs = self.unsubs.iter().filter_map(|r| r.last_sent);

        pubs.chain(subs).chain(unsubs).min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filters(names: &[&str]) -> Filters {
        let mut filters = Filters::new();
        for name in names {
            filters.push(((*name).into(), QoS::AtLeastOnce)).unwrap();
        }
        filters
    }

    #[test]
    fn ids_are_unique_across_tables() {
        let mut pool = PacketIdPool::<4, 2>::new();

        let a = pool
            .insert_publish("t", b"1", QoS::AtLeastOnce, false)
            .unwrap();
        let b = pool
            .insert_request(RequestKind::Subscribe, filters(&["a"]))
            .unwrap();
        let c = pool
            .insert_request(RequestKind::Unsubscribe, filters(&["a"]))
            .unwrap();

        assert_eq!((a.get(), b.get(), c.get()), (1, 2, 3));
    }

    #[test]
    fn wraps_and_skips_in_use() {
        let mut pool = PacketIdPool::<4, 2>::new();
        pool.next_id = u16::MAX;

        let last = pool
            .insert_publish("t", b"", QoS::AtLeastOnce, false)
            .unwrap();
        assert_eq!(last.get(), u16::MAX);

        // 1 is free again and handed out after the wrap
        let first = pool
            .insert_publish("t", b"", QoS::AtLeastOnce, false)
            .unwrap();
        assert_eq!(first.get(), 1);

        pool.next_id = u16::MAX;
        let next = pool
            .insert_publish("t", b"", QoS::AtLeastOnce, false)
            .unwrap();
        assert_eq!(next.get(), 2);
    }

    #[test]
    fn table_full() {
        let mut pool = PacketIdPool::<1, 1>::new();

        pool.insert_publish("t", b"", QoS::ExactlyOnce, false)
            .unwrap();
        assert_eq!(
            pool.insert_publish("t", b"", QoS::ExactlyOnce, false),
            Err(crate::Error::NoPacketIdAvailable)
        );
    }

    #[test]
    fn qos0_is_not_tracked() {
        let mut pool = PacketIdPool::<1, 1>::new();

        assert_eq!(
            pool.insert_publish("t", b"", QoS::AtMostOnce, false),
            Err(crate::Error::InvalidQoS)
        );
        assert_eq!(pool.in_flight_publishes(), 0);
    }

    #[test]
    fn qos1_flow() {
        let mut pool = PacketIdPool::<4, 1>::new();
        let id = pool
            .insert_publish("t", b"m", QoS::AtLeastOnce, false)
            .unwrap();

        assert!(pool.on_pubrec(id).is_err());
        assert_eq!(pool.on_puback(id).unwrap().payload, b"m");
        assert!(pool.on_puback(id).is_err());
        assert_eq!(pool.in_flight_publishes(), 0);
    }

    #[test]
    fn qos2_flow() {
        let mut pool = PacketIdPool::<4, 1>::new();
        let id = pool
            .insert_publish("t", b"m", QoS::ExactlyOnce, false)
            .unwrap();

        assert!(pool.on_pubcomp(id).is_err());
        assert!(pool.on_puback(id).is_err());

        pool.on_pubrec(id).unwrap();
        pool.on_pubrec(id).unwrap();
        assert_eq!(pool.publish(id).unwrap().state, PubState::AwaitPubComp);

        pool.on_pubcomp(id).unwrap();
        assert!(pool.publish(id).is_none());
    }

    #[test]
    fn requests_by_kind() {
        let mut pool = PacketIdPool::<1, 2>::new();
        let id = pool
            .insert_request(RequestKind::Subscribe, filters(&["a", "b"]))
            .unwrap();

        assert!(pool.take_request(RequestKind::Unsubscribe, id).is_none());

        let request = pool.take_request(RequestKind::Subscribe, id).unwrap();
        assert_eq!(request.filters.len(), 2);
        assert!(pool.requests(RequestKind::Subscribe).is_empty());
    }

    #[test]
    fn oldest_sent_ignores_queued() {
        let mut pool = PacketIdPool::<4, 1>::new();
        let a = pool
            .insert_publish("t", b"", QoS::AtLeastOnce, false)
            .unwrap();
        pool.insert_publish("t", b"", QoS::AtLeastOnce, false)
            .unwrap();

        assert_eq!(pool.oldest_sent(), None);

        pool.publish_mut(a).unwrap().last_sent = Some(40);
        assert_eq!(pool.oldest_sent(), Some(40));
    }
}
