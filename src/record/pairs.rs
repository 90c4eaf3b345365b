//! The FastCGI name-value stream.
//!
//! A pair is transmitted as the length of the name, the length of the value,
//! the name bytes, then the value bytes. Lengths of 127 and less are encoded
//! in one byte; longer lengths take four bytes with the top bit set.
//!
//! `PARAMS` pairs may straddle record boundaries, so decoding is driven
//! incrementally through [`PairDecoder`]: bytes go in as records arrive,
//! complete pairs come out as soon as they close.

use std::collections::BTreeMap;

fn write_len(len: usize, out: &mut Vec<u8>) {
    if len > 127 {
        let mut len_bytes = (len as u32).to_be_bytes();
        len_bytes[0] |= 0b1000_0000;
        out.extend_from_slice(&len_bytes);
    } else {
        out.push(len as u8);
    }
}

/// Encodes `pairs` onto `out` in the name-value stream format.
pub(crate) fn encode(pairs: &BTreeMap<String, String>, out: &mut Vec<u8>) {
    for (name, value) in pairs.iter() {
        write_len(name.len(), out);
        write_len(value.len(), out);
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(value.as_bytes());
    }
}

// The high-order bit of the first byte selects the encoding: clear means the
// low 7 bits are the length, set means the low 31 bits of a 4-byte
// big-endian field are.
fn parse_len(bytes: &[u8]) -> Option<(usize, usize)> {
    let first = *bytes.first()?;

    if first <= 127 {
        return Some((first as usize, 1));
    }

    if bytes.len() < 4 {
        return None;
    }

    let len = u32::from_be_bytes([first & 0b0111_1111, bytes[1], bytes[2], bytes[3]]);
    Some((len as usize, 4))
}

fn into_string(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => {
            log::warn!("name-value bytes are not valid utf-8, replacing bad sequences");
            String::from_utf8_lossy(bytes).into_owned()
        }
    }
}

/// Incremental decoder for a name-value stream split across records.
///
/// The scratch buffer is borrowed from the engine's buffer pool and handed
/// back by [`PairDecoder::finish`].
pub(crate) struct PairDecoder {
    buf: Vec<u8>,
}

impl PairDecoder {
    pub fn new(buf: Vec<u8>) -> Self {
        Self { buf }
    }

    /// Feeds `bytes` to the decoder, calling `emit` for every pair that
    /// completes.
    pub fn push(&mut self, bytes: &[u8], emit: &mut dyn FnMut(String, String)) {
        self.buf.extend_from_slice(bytes);

        let mut pos = 0;
        while let Some((name, value, consumed)) = next_pair(&self.buf[pos..]) {
            emit(name, value);
            pos += consumed;
        }

        self.buf.drain(..pos);
    }

    /// Ends the stream and reclaims the scratch buffer.
    ///
    /// Returns the number of residual bytes that never formed a complete
    /// pair; anything non-zero means the peer truncated the stream.
    pub fn finish(mut self) -> (Vec<u8>, usize) {
        let residue = self.buf.len();
        self.buf.clear();
        (self.buf, residue)
    }
}

fn next_pair(bytes: &[u8]) -> Option<(String, String, usize)> {
    let (name_len, n) = parse_len(bytes)?;
    let (value_len, m) = parse_len(&bytes[n..])?;

    let start = n + m;
    let total = start + name_len + value_len;
    if bytes.len() < total {
        return None;
    }

    let name = into_string(&bytes[start..start + name_len]);
    let value = into_string(&bytes[start + name_len..total]);
    Some((name, value, total))
}

/// Decodes a complete name-value buffer, keeping only the names.
///
/// `GET_VALUES` queries are transmitted as pairs with empty values.
pub(crate) fn decode_names(bytes: &[u8]) -> Vec<String> {
    let mut names = vec![];
    let mut decoder = PairDecoder::new(Vec::new());
    decoder.push(bytes, &mut |name, _| names.push(name));
    let (_, residue) = decoder.finish();
    if residue > 0 {
        log::warn!(residue = residue; "truncated name-value content in management record");
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn decode_all(bytes: &[u8]) -> BTreeMap<String, String> {
        let mut pairs = BTreeMap::new();
        let mut decoder = PairDecoder::new(Vec::new());
        decoder.push(bytes, &mut |name, value| {
            pairs.insert(name, value);
        });
        let (_, residue) = decoder.finish();
        assert_eq!(residue, 0);
        pairs
    }

    #[test]
    fn one_byte_form_is_used_iff_both_lengths_are_short() {
        let mut short = BTreeMap::new();
        short.insert("a".repeat(127), "b".repeat(127));
        let mut out = vec![];
        encode(&short, &mut out);
        assert_eq!(out.len(), 1 + 1 + 127 + 127);

        let mut long = BTreeMap::new();
        long.insert("a".repeat(128), String::new());
        out.clear();
        encode(&long, &mut out);
        assert_eq!(out.len(), 4 + 1 + 128);
        assert_eq!(out[0] & 0b1000_0000, 0b1000_0000);
    }

    #[test]
    fn pairs_split_across_pushes_are_reassembled() {
        let mut pairs = BTreeMap::new();
        pairs.insert("REQUEST_METHOD".to_string(), "GET".to_string());
        pairs.insert("LONG".to_string(), "v".repeat(1000));
        let mut encoded = vec![];
        encode(&pairs, &mut encoded);

        // Feed the stream one byte at a time.
        let mut decoded = BTreeMap::new();
        let mut decoder = PairDecoder::new(Vec::new());
        for byte in &encoded {
            decoder.push(std::slice::from_ref(byte), &mut |name, value| {
                decoded.insert(name, value);
            });
        }
        let (_, residue) = decoder.finish();

        assert_eq!(residue, 0);
        assert_eq!(decoded, pairs);
    }

    #[test]
    fn truncated_stream_leaves_residue() {
        let mut pairs = BTreeMap::new();
        pairs.insert("NAME".to_string(), "value".to_string());
        let mut encoded = vec![];
        encode(&pairs, &mut encoded);
        encoded.pop();

        let mut decoder = PairDecoder::new(Vec::new());
        decoder.push(&encoded, &mut |_, _| panic!("pair should not complete"));
        let (_, residue) = decoder.finish();
        assert!(residue > 0);
    }

    #[test]
    fn names_only_decoding() {
        let mut query = BTreeMap::new();
        query.insert("FCGI_MPXS_CONNS".to_string(), String::new());
        query.insert("FCGI_MAX_REQS".to_string(), String::new());
        let mut encoded = vec![];
        encode(&query, &mut encoded);

        let names = decode_names(&encoded);
        assert_eq!(names, vec!["FCGI_MAX_REQS", "FCGI_MPXS_CONNS"]);
    }

    proptest! {
        // Encoding then decoding an arbitrary map yields exactly the map.
        #[test]
        fn name_value_duality(
            pairs in proptest::collection::btree_map(".{0,40}", ".{0,200}", 0..20)
        ) {
            let mut encoded = vec![];
            encode(&pairs, &mut encoded);
            prop_assert_eq!(decode_all(&encoded), pairs);
        }

        // The split point never affects the decoded result.
        #[test]
        fn duality_is_split_invariant(
            pairs in proptest::collection::btree_map("[a-z]{1,160}", ".{0,160}", 1..8),
            split in 0usize..4096,
        ) {
            let mut encoded = vec![];
            encode(&pairs, &mut encoded);
            let split = split.min(encoded.len());

            let mut decoded = BTreeMap::new();
            let mut decoder = PairDecoder::new(Vec::new());
            let mut emit = |name, value| { decoded.insert(name, value); };
            decoder.push(&encoded[..split], &mut emit);
            decoder.push(&encoded[split..], &mut emit);
            let (_, residue) = decoder.finish();

            prop_assert_eq!(residue, 0);
            prop_assert_eq!(decoded, pairs);
        }
    }
}
