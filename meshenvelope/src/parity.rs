//! XOR parity windows.
//!
//! Every window of `k` data chunks gets one parity chunk: the byte-wise
//! XOR of the window's payloads, each padded with zeros to the longest.
//! A single missing chunk inside a window is then the XOR of the parity
//! with the surviving chunks, recovered with no retransmission round
//! trip. (The padding is harmless: chunk payloads are slices of one zlib
//! stream, and inflate ignores trailing zeros on the final chunk.)

use bytes::Bytes;
use std::ops::RangeInclusive;

/// 1-based window index for a 1-based data sequence.
pub fn window_index(sequence: u16, k: u16) -> u16 {
    (sequence - 1) / k + 1
}

/// Data sequences covered by the 1-based window `index`.
pub fn window_range(index: u16, k: u16, total: u16) -> RangeInclusive<u16> {
    let start = (index - 1) * k + 1;
    let end = (index * k).min(total);
    start..=end
}

/// Number of parity windows covering `total` data chunks.
pub fn window_count(total: u16, k: u16) -> u16 {
    total.div_ceil(k)
}

fn xor_into(acc: &mut Vec<u8>, payload: &[u8]) {
    if payload.len() > acc.len() {
        acc.resize(payload.len(), 0);
    }
    for (a, b) in acc.iter_mut().zip(payload) {
        *a ^= b;
    }
}

/// XOR of all payloads, padded to the longest.
pub fn build_parity<'a>(payloads: impl IntoIterator<Item = &'a Bytes>) -> Bytes {
    let mut acc = Vec::new();
    for payload in payloads {
        xor_into(&mut acc, payload);
    }
    Bytes::from(acc)
}

/// Recover the one missing payload of a window from the parity chunk and
/// the surviving payloads.
pub fn recover<'a>(parity: &Bytes, present: impl IntoIterator<Item = &'a Bytes>) -> Bytes {
    let mut acc = parity.to_vec();
    for payload in present {
        xor_into(&mut acc, payload);
    }
    Bytes::from(acc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_geometry() {
        assert_eq!(window_index(1, 4), 1);
        assert_eq!(window_index(4, 4), 1);
        assert_eq!(window_index(5, 4), 2);
        assert_eq!(window_range(1, 4, 10), 1..=4);
        assert_eq!(window_range(3, 4, 10), 9..=10);
        assert_eq!(window_count(10, 4), 3);
        assert_eq!(window_count(8, 4), 2);
    }

    #[test]
    fn parity_recovers_any_single_loss() {
        let chunks: Vec<Bytes> = vec![
            Bytes::from_static(b"alpha chunk"),
            Bytes::from_static(b"beta"),
            Bytes::from_static(b"gamma chunk longer"),
            Bytes::from_static(b"delta!"),
        ];
        let parity = build_parity(&chunks);

        for missing in 0..chunks.len() {
            let survivors: Vec<&Bytes> = chunks
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != missing)
                .map(|(_, c)| c)
                .collect();
            let recovered = recover(&parity, survivors.into_iter());
            // Recovered payload is the original padded to the window max.
            assert_eq!(
                &recovered[..chunks[missing].len()],
                &chunks[missing][..],
                "chunk {missing} not recovered"
            );
            assert!(recovered[chunks[missing].len()..].iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn parity_of_single_chunk_is_the_chunk() {
        let only = Bytes::from_static(b"solo");
        let parity = build_parity(std::iter::once(&only));
        assert_eq!(recover(&parity, std::iter::empty()), only);
    }
}
