use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;

use crate::message::{HandshakeHeader, HandshakeType};

/// Upper bound of concurrently buffered partial messages across all peers.
const MAX_PARTIAL_MESSAGES: usize = 64;

/// Reassembles fragmented handshake messages.
///
/// DTLS handshake messages can exceed the datagram budget and arrive as
/// overlapping fragments in any order. Fragments are buffered per
/// `(peer, message_seq)` until the declared total length is covered, then
/// the whole message is emitted and the entry evicted.
///
/// Keying by peer address keeps concurrent handshakes from different peers
/// apart even when their `message_seq` numbers collide.
#[derive(Debug, Default)]
pub struct FragmentBuffer {
    partial: HashMap<(SocketAddr, u16), Partial>,
}

#[derive(Debug)]
struct Partial {
    msg_type: HandshakeType,
    total_length: u32,
    // fragment_offset -> fragment bytes, walked in offset order
    fragments: BTreeMap<u32, Vec<u8>>,
}

impl FragmentBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment. Returns the fully serialized handshake message
    /// (header with `fragment_offset == 0` and `fragment_length == length`)
    /// once all bytes are present.
    ///
    /// A fragment whose declared type or total length conflicts with the
    /// already buffered fragments of the same `message_seq` discards the
    /// whole partial message.
    pub fn add(
        &mut self,
        peer: SocketAddr,
        header: &HandshakeHeader,
        fragment: &[u8],
    ) -> Option<Vec<u8>> {
        let key = (peer, header.message_seq);

        if let Some(existing) = self.partial.get(&key) {
            if existing.msg_type != header.msg_type || existing.total_length != header.length {
                debug!(
                    "Conflicting fragment for message_seq {} from [{}], discarding buffered fragments",
                    header.message_seq, peer
                );
                self.partial.remove(&key);
                return None;
            }
        } else {
            if self.partial.len() >= MAX_PARTIAL_MESSAGES {
                warn!(
                    "Fragment buffer full, dropping fragment for message_seq {} from [{}]",
                    header.message_seq, peer
                );
                return None;
            }
            self.partial.insert(
                key,
                Partial {
                    msg_type: header.msg_type,
                    total_length: header.length,
                    fragments: BTreeMap::new(),
                },
            );
        }

        // Unwrap is ok, the entry was inserted above.
        let partial = self.partial.get_mut(&key).unwrap();
        partial
            .fragments
            .entry(header.fragment_offset)
            .or_insert_with(|| fragment.to_vec());

        let Some(reassembled) = partial.reassemble() else {
            return None;
        };

        self.partial.remove(&key);

        let mut message = Vec::with_capacity(HandshakeHeader::LEN + reassembled.len());
        let whole = HandshakeHeader {
            msg_type: header.msg_type,
            length: header.length,
            message_seq: header.message_seq,
            fragment_offset: 0,
            fragment_length: header.length,
        };
        whole.serialize(&mut message);
        message.extend_from_slice(&reassembled);

        Some(message)
    }

    /// Drop all partial messages buffered for `peer`.
    pub fn evict_peer(&mut self, peer: SocketAddr) {
        self.partial.retain(|(addr, _), _| *addr != peer);
    }

    pub fn is_empty(&self) -> bool {
        self.partial.is_empty()
    }
}

impl Partial {
    /// Walk fragments in offset order, appending bytes that continue the
    /// current tail. Overlapping fragments contribute only the suffix
    /// beyond the tail; a gap stalls reassembly until it is filled.
    fn reassemble(&self) -> Option<Vec<u8>> {
        let mut assembly: Vec<u8> = Vec::new();

        for (&offset, bytes) in &self.fragments {
            let tail = assembly.len() as u32;
            let end = offset + bytes.len() as u32;

            if offset == tail {
                assembly.extend_from_slice(bytes);
            } else if offset < tail && end > tail {
                assembly.extend_from_slice(&bytes[(tail - offset) as usize..]);
            }
            // offset > tail: gap, a later fragment cannot help; offset and
            // end both below the tail: duplicate data, nothing new.
        }

        if assembly.len() as u32 == self.total_length {
            Some(assembly)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:5684".parse().unwrap()
    }

    fn header(seq: u16, total: u32, offset: u32, len: u32) -> HandshakeHeader {
        HandshakeHeader {
            msg_type: HandshakeType::ClientHello,
            length: total,
            message_seq: seq,
            fragment_offset: offset,
            fragment_length: len,
        }
    }

    fn body(total: usize) -> Vec<u8> {
        (0..total).map(|i| (i % 251) as u8).collect()
    }

    fn whole_message(seq: u16, body: &[u8]) -> Vec<u8> {
        let mut expected = Vec::new();
        header(seq, body.len() as u32, 0, body.len() as u32).serialize(&mut expected);
        expected.extend_from_slice(body);
        expected
    }

    #[test]
    fn in_order_fragments() {
        let mut buf = FragmentBuffer::new();
        let data = body(250);

        assert!(buf
            .add(peer(), &header(0, 250, 0, 100), &data[..100])
            .is_none());
        assert!(buf
            .add(peer(), &header(0, 250, 100, 100), &data[100..200])
            .is_none());
        let message = buf
            .add(peer(), &header(0, 250, 200, 50), &data[200..])
            .expect("complete");

        assert_eq!(message, whole_message(0, &data));
        assert!(buf.is_empty());
    }

    #[test]
    fn overlapping_out_of_order_fragments() {
        let mut buf = FragmentBuffer::new();
        let data = body(250);

        // [80..200] then [200..250] then [0..100]: 20 byte overlap, out of order
        assert!(buf
            .add(peer(), &header(1, 250, 80, 120), &data[80..200])
            .is_none());
        assert!(buf
            .add(peer(), &header(1, 250, 200, 50), &data[200..])
            .is_none());
        let message = buf
            .add(peer(), &header(1, 250, 0, 100), &data[..100])
            .expect("complete");

        assert_eq!(message, whole_message(1, &data));
    }

    #[test]
    fn any_permutation_reassembles_identically() {
        let data = body(300);
        let pieces: [(u32, u32); 4] = [(0, 120), (100, 100), (150, 100), (250, 50)];

        // A sample of arrival orders for the four fragments
        let orders = [
            [0, 1, 2, 3],
            [3, 2, 1, 0],
            [1, 3, 0, 2],
            [2, 0, 3, 1],
            [3, 0, 1, 2],
            [1, 0, 3, 2],
        ];

        for order in orders {
            let mut buf = FragmentBuffer::new();
            let mut result = None;
            for &i in &order {
                let (off, len) = pieces[i];
                let h = header(2, 300, off, len);
                let frag = &data[off as usize..(off + len) as usize];
                if let Some(m) = buf.add(peer(), &h, frag) {
                    result = Some(m);
                }
            }
            assert_eq!(result.expect("complete"), whole_message(2, &data));
        }
    }

    #[test]
    fn duplicate_fragment_is_idempotent() {
        let mut buf = FragmentBuffer::new();
        let data = body(200);

        assert!(buf
            .add(peer(), &header(0, 200, 0, 100), &data[..100])
            .is_none());
        assert!(buf
            .add(peer(), &header(0, 200, 0, 100), &data[..100])
            .is_none());
        let message = buf
            .add(peer(), &header(0, 200, 100, 100), &data[100..])
            .expect("complete");
        assert_eq!(message, whole_message(0, &data));
    }

    #[test]
    fn gap_stalls_until_filled() {
        let mut buf = FragmentBuffer::new();
        let data = body(200);

        assert!(buf
            .add(peer(), &header(0, 200, 100, 100), &data[100..])
            .is_none());
        // Gap [0..100) still open
        assert!(!buf.is_empty());
        assert!(buf
            .add(peer(), &header(0, 200, 0, 100), &data[..100])
            .is_some());
    }

    #[test]
    fn conflicting_total_length_discards_buffered() {
        let mut buf = FragmentBuffer::new();
        let data = body(200);

        assert!(buf
            .add(peer(), &header(0, 200, 0, 100), &data[..100])
            .is_none());
        // Same message_seq, different declared total length
        assert!(buf
            .add(peer(), &header(0, 300, 100, 100), &data[100..])
            .is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn peers_do_not_collide_on_message_seq() {
        let other: SocketAddr = "127.0.0.2:5684".parse().unwrap();
        let mut buf = FragmentBuffer::new();
        let data_a = body(200);
        let data_b: Vec<u8> = (0..200u32).map(|i| (255 - (i % 251)) as u8).collect();

        assert!(buf
            .add(peer(), &header(0, 200, 0, 100), &data_a[..100])
            .is_none());
        assert!(buf
            .add(other, &header(0, 200, 0, 100), &data_b[..100])
            .is_none());

        let a = buf
            .add(peer(), &header(0, 200, 100, 100), &data_a[100..])
            .expect("peer a complete");
        let b = buf
            .add(other, &header(0, 200, 100, 100), &data_b[100..])
            .expect("peer b complete");

        assert_eq!(a, whole_message(0, &data_a));
        assert_eq!(b, whole_message(0, &data_b));
    }

    #[test]
    fn evict_peer_drops_partials() {
        let mut buf = FragmentBuffer::new();
        let data = body(200);
        assert!(buf
            .add(peer(), &header(0, 200, 0, 100), &data[..100])
            .is_none());
        buf.evict_peer(peer());
        assert!(buf.is_empty());
    }
}
