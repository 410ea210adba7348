//! Routes a batch of raw datagrams to the sender they belong to

use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::Bytes;
use log::debug;

use crate::protocol::sender::SenderBody;
use crate::protocol::{AudioFragment, FloorPlane, Fragment, SenderPacket};

/// Everything one sender delivered during a single receive pass.
#[derive(Debug, Clone, Default)]
pub struct PacketSet {
    /// Any packet at all arrived, including a bare heartbeat
    pub received_any: bool,
    pub video: Vec<Fragment>,
    pub parity: Vec<Fragment>,
    pub audio: Vec<AudioFragment>,
    /// Latest calibration blob, if a VideoInit arrived
    pub init: Option<Bytes>,
    pub floors: Vec<FloorPlane>,
}

impl PacketSet {
    pub fn is_empty(&self) -> bool {
        !self.received_any
    }
}

/// A Confirm from a sender, answering one of our Connect requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmPacket {
    pub sender_session_id: u32,
    pub receiver_session_id: u32,
    pub endpoint: SocketAddr,
}

#[derive(Debug, Default)]
pub struct DemuxOutput {
    /// One entry per known sender session id, present even when empty
    pub sets: HashMap<u32, PacketSet>,
    pub confirms: Vec<ConfirmPacket>,
    pub malformed: u64,
    /// Datagrams carrying a session id nobody is tracking
    pub unknown: u64,
}

/// Classify `datagrams` by session id and packet kind.
///
/// Confirm packets are always collected, whether or not the sender is known.
/// Any other packet from an unknown session id is dropped: it is either a
/// stale sender that restarted under a new id, or a duplicate stream.
/// Ordering and duplicates are left to the assembler.
pub fn demultiplex<I, K>(datagrams: I, known_senders: K) -> DemuxOutput
where
    I: IntoIterator<Item = (Bytes, SocketAddr)>,
    K: IntoIterator<Item = u32>,
{
    let mut output = DemuxOutput {
        sets: known_senders
            .into_iter()
            .map(|id| (id, PacketSet::default()))
            .collect(),
        ..Default::default()
    };

    for (datagram, endpoint) in datagrams {
        let packet = match SenderPacket::parse(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("dropping malformed datagram from {}: {}", endpoint, e);
                output.malformed += 1;
                continue;
            }
        };

        if let SenderBody::Confirm {
            receiver_session_id,
        } = packet.body
        {
            output.confirms.push(ConfirmPacket {
                sender_session_id: packet.session_id,
                receiver_session_id,
                endpoint,
            });
            continue;
        }

        let Some(set) = output.sets.get_mut(&packet.session_id) else {
            output.unknown += 1;
            continue;
        };

        set.received_any = true;
        match packet.body {
            SenderBody::Confirm { .. } | SenderBody::Heartbeat => {}
            SenderBody::VideoInit { calibration } => set.init = Some(calibration),
            SenderBody::Video(fragment) => set.video.push(fragment),
            SenderBody::Parity(fragment) => set.parity.push(fragment),
            SenderBody::Audio(audio) => set.audio.push(audio),
            SenderBody::Floor(floor) => set.floors.push(floor),
        }
    }

    output
}
