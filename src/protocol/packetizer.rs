//! Sender-side fragmentation of a video message

use bytes::Bytes;

use super::sender::{Fragment, SenderBody, SenderPacket};
use super::{ProtocolParams, xor_into};

/// Split a serialized video message into video fragments plus one parity
/// fragment per FEC group.
///
/// Video fragments come first in index order, followed by the parity
/// fragments. A parity payload is the XOR of its group, with shorter
/// fragments treated as zero-padded.
pub fn split_video_message(
    session_id: u32,
    frame_id: u32,
    message: &Bytes,
    params: &ProtocolParams,
) -> Vec<SenderPacket> {
    let chunk = params.max_fragment_payload().max(1);
    let video_count = message.len().div_ceil(chunk).max(1);
    let parity_count = params.parity_count(video_count);

    let payloads: Vec<Bytes> = (0..video_count)
        .map(|i| {
            let start = (i * chunk).min(message.len());
            let end = ((i + 1) * chunk).min(message.len());
            message.slice(start..end)
        })
        .collect();

    let mut packets = Vec::with_capacity(video_count + parity_count);
    for (index, payload) in payloads.iter().enumerate() {
        packets.push(SenderPacket::new(
            session_id,
            SenderBody::Video(Fragment {
                frame_id,
                index: index as u32,
                count: video_count as u32,
                payload: payload.clone(),
            }),
        ));
    }

    for parity_index in 0..parity_count {
        let mut parity = Vec::new();
        for payload in &payloads[params.group_range(parity_index, video_count)] {
            xor_into(&mut parity, payload);
        }
        packets.push(SenderPacket::new(
            session_id,
            SenderBody::Parity(Fragment {
                frame_id,
                index: parity_index as u32,
                count: video_count as u32,
                payload: Bytes::from(parity),
            }),
        ));
    }

    packets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MAX_PACKET_SIZE;

    #[test]
    fn test_fragments_fit_datagram() {
        let params = ProtocolParams::default();
        let message = Bytes::from(vec![0xAB; 10_000]);
        let packets = split_video_message(1, 1, &message, &params);

        let video: Vec<_> = packets
            .iter()
            .filter_map(|p| match &p.body {
                SenderBody::Video(f) => Some(f),
                _ => None,
            })
            .collect();
        assert_eq!(video.len(), 10_000usize.div_ceil(params.max_fragment_payload()));
        assert!(packets.iter().all(|p| p.to_bytes().len() <= MAX_PACKET_SIZE));

        let joined: Vec<u8> = video.iter().flat_map(|f| f.payload.to_vec()).collect();
        assert_eq!(joined, message.to_vec());
    }

    #[test]
    fn test_parity_is_group_xor() {
        let params = ProtocolParams {
            fec_group_size: 2,
            max_packet_size: 17 + 4,
        };
        let message = Bytes::from_static(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        let packets = split_video_message(1, 1, &message, &params);

        // 3 video fragments of 4, 4, 2 bytes; 2 parity fragments.
        assert_eq!(packets.len(), 5);
        let SenderBody::Parity(first) = &packets[3].body else {
            panic!("expected parity");
        };
        assert_eq!(first.payload.as_ref(), &[1 ^ 5, 2 ^ 6, 3 ^ 7, 4 ^ 8]);
        let SenderBody::Parity(second) = &packets[4].body else {
            panic!("expected parity");
        };
        assert_eq!(second.payload.as_ref(), &[9, 10]);
        assert_eq!(second.count, 3);
    }

    #[test]
    fn test_empty_message_still_has_one_fragment() {
        let packets = split_video_message(1, 1, &Bytes::new(), &ProtocolParams::default());
        assert_eq!(packets.len(), 2);
    }
}
