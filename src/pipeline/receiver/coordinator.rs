//! Receiver coordinator
//!
//! Owns the UDP socket and every sender session. Each `poll` drains the
//! socket, routes datagrams to their session, advances every session once and
//! retires the ones that died.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{info, warn};

use super::demux::demultiplex;
use super::session::SenderSession;
use crate::config::ReceiverConfig;
use crate::decoder::{AudioDecoder, PcmDecoder};
use crate::display::AudioRingBuffer;
use crate::error::{SessionError, TransportError};
use crate::protocol::ReceiverPacket;
use crate::transport::{DatagramSink, UdpTransport};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(30);

type DecoderFactory = Box<dyn Fn(&ReceiverConfig) -> Box<dyn AudioDecoder> + Send + Sync>;

/// Something that changed during a poll.
#[derive(Debug, Clone)]
pub enum ReceiverEvent {
    SessionStarted {
        sender_session_id: u32,
        receiver_session_id: u32,
        endpoint: SocketAddr,
        audio_ring: Arc<AudioRingBuffer>,
    },
    SessionEnded {
        sender_session_id: u32,
        reason: String,
    },
    /// A Connect was never confirmed.
    ConnectFailed { endpoint: SocketAddr },
}

#[derive(Debug)]
struct PendingConnect {
    endpoint: SocketAddr,
    requested_at: Instant,
    last_sent: Instant,
}

pub struct ReceiverCoordinator {
    transport: UdpTransport,
    config: ReceiverConfig,
    decoder_factory: DecoderFactory,
    next_receiver_id: u32,
    pending: HashMap<u32, PendingConnect>,
    /// Keyed by sender session id
    sessions: HashMap<u32, SenderSession>,
    malformed_packets: u64,
    unknown_packets: u64,
    last_health_log: Option<Instant>,
}

impl ReceiverCoordinator {
    pub fn new(transport: UdpTransport, config: ReceiverConfig) -> Self {
        Self {
            transport,
            config,
            decoder_factory: Box::new(|config| {
                Box::new(PcmDecoder::new(config.audio_samples_per_frame))
            }),
            next_receiver_id: 1,
            pending: HashMap::new(),
            sessions: HashMap::new(),
            malformed_packets: 0,
            unknown_packets: 0,
            last_health_log: None,
        }
    }

    /// Replace the audio decoder used for sessions created from now on.
    pub fn set_decoder_factory<F>(&mut self, factory: F)
    where
        F: Fn(&ReceiverConfig) -> Box<dyn AudioDecoder> + Send + Sync + 'static,
    {
        self.decoder_factory = Box::new(factory);
    }

    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn sink(&self) -> &dyn DatagramSink {
        &self.transport
    }

    pub fn sessions(&self) -> impl Iterator<Item = &SenderSession> {
        self.sessions.values()
    }

    pub fn sessions_mut(&mut self) -> impl Iterator<Item = &mut SenderSession> {
        self.sessions.values_mut()
    }

    pub fn session_mut(&mut self, sender_session_id: u32) -> Option<&mut SenderSession> {
        self.sessions.get_mut(&sender_session_id)
    }

    pub fn pending_connects(&self) -> usize {
        self.pending.len()
    }

    pub fn malformed_packets(&self) -> u64 {
        self.malformed_packets
    }

    /// No session is running and nothing is waiting for a Confirm.
    pub fn is_idle(&self) -> bool {
        self.sessions.is_empty() && self.pending.is_empty()
    }

    /// Ask the sender at `endpoint` to start streaming. Returns the receiver
    /// session id the sender will echo in its Confirm.
    pub fn connect(&mut self, endpoint: SocketAddr, now: Instant) -> Result<u32, SessionError> {
        let receiver_session_id = self.next_receiver_id;
        self.next_receiver_id = self.next_receiver_id.wrapping_add(1).max(1);

        self.send_connect(receiver_session_id, endpoint)?;
        info!("connecting to {} as receiver session {}", endpoint, receiver_session_id);
        self.pending.insert(
            receiver_session_id,
            PendingConnect {
                endpoint,
                requested_at: now,
                last_sent: now,
            },
        );
        Ok(receiver_session_id)
    }

    fn send_connect(&self, receiver_session_id: u32, endpoint: SocketAddr) -> Result<(), TransportError> {
        let packet = ReceiverPacket::connect(
            receiver_session_id,
            self.config.request_video,
            self.config.request_audio,
        );
        self.transport
            .send_datagram(&packet.to_bytes(), endpoint)
            .map(|_| ())
            .map_err(TransportError::Send)
    }

    /// Run one receive tick.
    pub fn poll(&mut self, now: Instant) -> Vec<ReceiverEvent> {
        let mut events = Vec::new();

        let batch = match self.transport.recv_batch() {
            Ok(batch) => batch,
            Err(e) => {
                warn!("receive failed, closing all sessions: {}", e);
                let reason = e.to_string();
                for (sender_session_id, _) in self.sessions.drain() {
                    events.push(ReceiverEvent::SessionEnded {
                        sender_session_id,
                        reason: reason.clone(),
                    });
                }
                return events;
            }
        };

        let demuxed = demultiplex(batch, self.sessions.keys().copied().collect::<Vec<_>>());
        self.malformed_packets += demuxed.malformed;
        self.unknown_packets += demuxed.unknown;

        for confirm in demuxed.confirms {
            if self.sessions.contains_key(&confirm.sender_session_id) {
                continue;
            }
            let Some(pending) = self.pending.remove(&confirm.receiver_session_id) else {
                continue;
            };
            if pending.endpoint != confirm.endpoint {
                info!(
                    "sender at {} confirmed a connect sent to {}",
                    confirm.endpoint, pending.endpoint
                );
            }

            let session = SenderSession::new(
                confirm.receiver_session_id,
                confirm.sender_session_id,
                confirm.endpoint,
                &self.config,
                (self.decoder_factory)(&self.config),
                now,
            );
            info!(
                "sender session {} started from {}",
                confirm.sender_session_id, confirm.endpoint
            );
            events.push(ReceiverEvent::SessionStarted {
                sender_session_id: confirm.sender_session_id,
                receiver_session_id: confirm.receiver_session_id,
                endpoint: confirm.endpoint,
                audio_ring: session.audio_ring().clone(),
            });
            self.sessions.insert(confirm.sender_session_id, session);
        }

        let mut sets = demuxed.sets;
        let mut ended = Vec::new();
        for (&sender_session_id, session) in self.sessions.iter_mut() {
            let packets = sets.remove(&sender_session_id).unwrap_or_default();
            if let Err(e) = session.update(now, packets, &self.transport)
                && e.is_fatal()
            {
                ended.push((sender_session_id, e));
            }
        }
        for (sender_session_id, e) in ended {
            if let Some(session) = self.sessions.remove(&sender_session_id) {
                info!(
                    "sender session {} ended: {} ({})",
                    sender_session_id,
                    e,
                    session.health().summary()
                );
            }
            events.push(ReceiverEvent::SessionEnded {
                sender_session_id,
                reason: e.to_string(),
            });
        }

        self.retry_pending(now, &mut events);
        self.log_health(now);

        events
    }

    /// Re-send unanswered Connects once per heartbeat interval and give up
    /// after the receive timeout.
    fn retry_pending(&mut self, now: Instant, events: &mut Vec<ReceiverEvent>) {
        let timeout = self.config.receive_timeout();
        let interval = self.config.heartbeat_interval();

        let expired: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.requested_at) > timeout)
            .map(|(&id, _)| id)
            .collect();
        for id in expired {
            if let Some(pending) = self.pending.remove(&id) {
                warn!("no confirm from {} after {:?}", pending.endpoint, timeout);
                events.push(ReceiverEvent::ConnectFailed {
                    endpoint: pending.endpoint,
                });
            }
        }

        let due: Vec<(u32, SocketAddr)> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.last_sent) >= interval)
            .map(|(&id, p)| (id, p.endpoint))
            .collect();
        for (id, endpoint) in due {
            if let Err(e) = self.send_connect(id, endpoint) {
                warn!("failed to resend connect to {}: {}", endpoint, e);
            }
            if let Some(pending) = self.pending.get_mut(&id) {
                pending.last_sent = now;
            }
        }
    }

    fn log_health(&mut self, now: Instant) {
        let last = *self.last_health_log.get_or_insert(now);
        if now.saturating_duration_since(last) < HEALTH_LOG_INTERVAL {
            return;
        }
        self.last_health_log = Some(now);
        for session in self.sessions.values() {
            info!(
                "sender session {}: {}",
                session.sender_session_id(),
                session.health().summary()
            );
        }
        if self.malformed_packets > 0 || self.unknown_packets > 0 {
            info!(
                "{} malformed and {} unrouted datagrams so far",
                self.malformed_packets, self.unknown_packets
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::receiver::ReceiverBody;
    use crate::protocol::sender::SenderBody;
    use crate::protocol::SenderPacket;
    use bytes::Bytes;
    use std::net::UdpSocket;

    fn coordinator() -> ReceiverCoordinator {
        let transport = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        ReceiverCoordinator::new(transport, ReceiverConfig::default())
    }

    fn sender() -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        socket
    }

    fn recv_packet(socket: &UdpSocket) -> ReceiverPacket {
        let mut buf = [0u8; 1500];
        let (len, _) = socket.recv_from(&mut buf).unwrap();
        ReceiverPacket::parse(Bytes::copy_from_slice(&buf[..len])).unwrap()
    }

    /// Poll until an event shows up or we give up.
    fn poll_until_event(coordinator: &mut ReceiverCoordinator, now: Instant) -> Vec<ReceiverEvent> {
        for _ in 0..200 {
            let events = coordinator.poll(now);
            if !events.is_empty() {
                return events;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        Vec::new()
    }

    #[test]
    fn test_confirm_promotes_pending_connect() {
        let mut coordinator = coordinator();
        let sender = sender();
        let now = Instant::now();

        let receiver_id = coordinator.connect(sender.local_addr().unwrap(), now).unwrap();
        let connect = recv_packet(&sender);
        assert_eq!(connect.session_id, receiver_id);
        assert!(matches!(connect.body, ReceiverBody::Connect { .. }));

        let confirm = SenderPacket::new(
            900,
            SenderBody::Confirm {
                receiver_session_id: receiver_id,
            },
        );
        sender
            .send_to(&confirm.to_bytes(), coordinator.local_addr().unwrap())
            .unwrap();

        let events = poll_until_event(&mut coordinator, now);
        assert!(matches!(
            events.as_slice(),
            [ReceiverEvent::SessionStarted { sender_session_id: 900, .. }]
        ));
        assert_eq!(coordinator.pending_connects(), 0);
        assert_eq!(coordinator.sessions().count(), 1);
    }

    #[test]
    fn test_confirm_for_unknown_receiver_id_ignored() {
        let mut coordinator = coordinator();
        let sender = sender();
        let confirm = SenderPacket::new(
            5,
            SenderBody::Confirm {
                receiver_session_id: 77,
            },
        );
        sender
            .send_to(&confirm.to_bytes(), coordinator.local_addr().unwrap())
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert!(coordinator.poll(Instant::now()).is_empty());
        assert!(coordinator.is_idle());
    }

    #[test]
    fn test_silent_session_times_out() {
        let mut coordinator = coordinator();
        let sender = sender();
        let start = Instant::now();

        let receiver_id = coordinator.connect(sender.local_addr().unwrap(), start).unwrap();
        let confirm = SenderPacket::new(
            3,
            SenderBody::Confirm {
                receiver_session_id: receiver_id,
            },
        );
        sender
            .send_to(&confirm.to_bytes(), coordinator.local_addr().unwrap())
            .unwrap();
        poll_until_event(&mut coordinator, start);

        assert!(coordinator.poll(start + Duration::from_secs(5)).is_empty());
        let events = coordinator.poll(start + Duration::from_millis(5001));
        assert!(matches!(
            events.as_slice(),
            [ReceiverEvent::SessionEnded { sender_session_id: 3, .. }]
        ));
        assert!(coordinator.is_idle());
    }

    #[test]
    fn test_unanswered_connect_retried_then_abandoned() {
        let mut coordinator = coordinator();
        let sender = sender();
        let start = Instant::now();
        coordinator.connect(sender.local_addr().unwrap(), start).unwrap();
        recv_packet(&sender);

        coordinator.poll(start + Duration::from_secs(1));
        assert!(matches!(recv_packet(&sender).body, ReceiverBody::Connect { .. }));

        let events = coordinator.poll(start + Duration::from_secs(6));
        assert!(matches!(events.as_slice(), [ReceiverEvent::ConnectFailed { .. }]));
        assert!(coordinator.is_idle());
    }
}
