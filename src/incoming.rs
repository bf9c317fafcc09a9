use heapless::Vec;

use crate::{packet::PacketId, session::Message};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Track {
    New,
    /// Already recorded and still waiting for PUBREL.
    Duplicate,
}

/// Inbound QoS 2 messages held between PUBLISH and PUBREL.
///
/// An identifier stays recorded until its PUBREL arrives, which is the window
/// in which a redelivered PUBLISH must not reach the application twice.
pub(crate) struct Incoming<const N_PUB_IN: usize> {
    records: Vec<(PacketId, Message), N_PUB_IN>,
}

impl<const N_PUB_IN: usize> Incoming<N_PUB_IN> {
    pub(crate) fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    pub(crate) fn clear(&mut self) {
        self.records.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    /// Records `packet_id`, building the message only for a first receipt.
    pub(crate) fn track<F>(&mut self, packet_id: PacketId, message: F) -> Result<Track, crate::Error>
    where
        F: FnOnce() -> Message,
    {
        if self.records.iter().any(|(id, _)| *id == packet_id) {
            return Ok(Track::Duplicate);
        }

        self.records
            .push((packet_id, message()))
            .map_err(|_| crate::Error::VectorIsFull)?;

        Ok(Track::New)
    }

    /// Retires `packet_id` on PUBREL, yielding the message to deliver.
    pub(crate) fn release(&mut self, packet_id: PacketId) -> Option<Message> {
        let index = self.records.iter().position(|(id, _)| *id == packet_id)?;
        Some(self.records.remove(index).1)
    }
}
