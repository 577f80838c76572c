//! HPACK header compression (RFC 7541).
//!
//! The decoder implements the full representation set including dynamic
//! table size updates and Huffman-coded string literals. The encoder uses
//! static-table matches and literal representations without indexing; it
//! never grows the peer's dynamic table.

use std::collections::VecDeque;

use bytes::{BufMut, Bytes, BytesMut};

use super::huffman;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HpackError {
    #[error("truncated header block")]
    Truncated,
    #[error("invalid table index")]
    InvalidIndex,
    #[error("integer overflow in header block")]
    IntegerOverflow,
    #[error("invalid huffman coding")]
    InvalidHuffman,
    #[error("dynamic table size update above the negotiated maximum")]
    InvalidSizeUpdate,
    #[error("decoded header list larger than {limit} bytes")]
    HeaderListTooLarge { limit: usize },
}

/// Per-entry overhead defined by RFC 7541 §4.1.
const ENTRY_OVERHEAD: usize = 32;

#[rustfmt::skip]
static STATIC_TABLE: [(&[u8], &[u8]); 61] = [
    (b":authority", b""),
    (b":method", b"GET"),
    (b":method", b"POST"),
    (b":path", b"/"),
    (b":path", b"/index.html"),
    (b":scheme", b"http"),
    (b":scheme", b"https"),
    (b":status", b"200"),
    (b":status", b"204"),
    (b":status", b"206"),
    (b":status", b"304"),
    (b":status", b"400"),
    (b":status", b"404"),
    (b":status", b"500"),
    (b"accept-charset", b""),
    (b"accept-encoding", b"gzip, deflate"),
    (b"accept-language", b""),
    (b"accept-ranges", b""),
    (b"accept", b""),
    (b"access-control-allow-origin", b""),
    (b"age", b""),
    (b"allow", b""),
    (b"authorization", b""),
    (b"cache-control", b""),
    (b"content-disposition", b""),
    (b"content-encoding", b""),
    (b"content-language", b""),
    (b"content-length", b""),
    (b"content-location", b""),
    (b"content-range", b""),
    (b"content-type", b""),
    (b"cookie", b""),
    (b"date", b""),
    (b"etag", b""),
    (b"expect", b""),
    (b"expires", b""),
    (b"from", b""),
    (b"host", b""),
    (b"if-match", b""),
    (b"if-modified-since", b""),
    (b"if-none-match", b""),
    (b"if-range", b""),
    (b"if-unmodified-since", b""),
    (b"last-modified", b""),
    (b"link", b""),
    (b"location", b""),
    (b"max-forwards", b""),
    (b"proxy-authenticate", b""),
    (b"proxy-authorization", b""),
    (b"range", b""),
    (b"referer", b""),
    (b"refresh", b""),
    (b"retry-after", b""),
    (b"server", b""),
    (b"set-cookie", b""),
    (b"strict-transport-security", b""),
    (b"transfer-encoding", b""),
    (b"user-agent", b""),
    (b"vary", b""),
    (b"via", b""),
    (b"www-authenticate", b""),
];

#[derive(Debug)]
struct DynamicTable {
    entries: VecDeque<(Bytes, Bytes)>,
    size: usize,
    max_size: usize,
    /// Upper bound from our SETTINGS_HEADER_TABLE_SIZE; size updates above
    /// this are protocol errors.
    protocol_max_size: usize,
}

impl DynamicTable {
    fn new(protocol_max_size: usize) -> Self {
        DynamicTable {
            entries: VecDeque::new(),
            size: 0,
            max_size: protocol_max_size,
            protocol_max_size,
        }
    }

    fn insert(&mut self, name: Bytes, value: Bytes) {
        let entry_size = name.len() + value.len() + ENTRY_OVERHEAD;
        while self.size + entry_size > self.max_size {
            match self.entries.pop_back() {
                Some((n, v)) => self.size -= n.len() + v.len() + ENTRY_OVERHEAD,
                None => break,
            }
        }
        if entry_size <= self.max_size {
            self.size += entry_size;
            self.entries.push_front((name, value));
        }
    }

    fn resize(&mut self, max_size: usize) {
        self.max_size = max_size;
        while self.size > self.max_size {
            if let Some((n, v)) = self.entries.pop_back() {
                self.size -= n.len() + v.len() + ENTRY_OVERHEAD;
            }
        }
    }

    fn get(&self, index: usize) -> Option<(Bytes, Bytes)> {
        self.entries.get(index).cloned()
    }
}

fn lookup(table: &DynamicTable, index: usize) -> Result<(Bytes, Bytes), HpackError> {
    if index == 0 {
        return Err(HpackError::InvalidIndex);
    }
    if index <= STATIC_TABLE.len() {
        let (name, value) = STATIC_TABLE[index - 1];
        return Ok((Bytes::from_static(name), Bytes::from_static(value)));
    }
    table
        .get(index - STATIC_TABLE.len() - 1)
        .ok_or(HpackError::InvalidIndex)
}

pub(crate) fn encode_varint(value: usize, prefix_bits: u8, first_byte: u8, out: &mut BytesMut) {
    let limit = (1usize << prefix_bits) - 1;
    if value < limit {
        out.put_u8(first_byte | value as u8);
        return;
    }
    out.put_u8(first_byte | limit as u8);
    let mut value = value - limit;
    while value >= 0x80 {
        out.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    out.put_u8(value as u8);
}

fn decode_varint(input: &mut &[u8], prefix_bits: u8) -> Result<usize, HpackError> {
    let limit = (1usize << prefix_bits) - 1;
    let first = *input.first().ok_or(HpackError::Truncated)?;
    *input = &input[1..];
    let mut value = (first as usize) & limit;
    if value < limit {
        return Ok(value);
    }
    let mut shift = 0u32;
    loop {
        let byte = *input.first().ok_or(HpackError::Truncated)?;
        *input = &input[1..];
        value = (byte as usize & 0x7f)
            .checked_shl(shift)
            .and_then(|v| value.checked_add(v))
            .ok_or(HpackError::IntegerOverflow)?;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 56 {
            return Err(HpackError::IntegerOverflow);
        }
    }
}

fn decode_string(input: &mut &[u8]) -> Result<Bytes, HpackError> {
    let huffman_coded = input.first().ok_or(HpackError::Truncated)? & 0x80 != 0;
    let length = decode_varint(input, 7)?;
    if input.len() < length {
        return Err(HpackError::Truncated);
    }
    let raw = &input[..length];
    *input = &input[length..];
    if huffman_coded {
        Ok(Bytes::from(huffman::decode(raw)?))
    } else {
        Ok(Bytes::copy_from_slice(raw))
    }
}

fn encode_string(value: &[u8], out: &mut BytesMut) {
    encode_varint(value.len(), 7, 0, out);
    out.put_slice(value);
}

#[derive(Debug)]
pub(crate) struct Decoder {
    table: DynamicTable,
    max_header_list_size: usize,
}

impl Decoder {
    pub(crate) fn new(protocol_max_table_size: usize, max_header_list_size: usize) -> Self {
        Decoder {
            table: DynamicTable::new(protocol_max_table_size),
            max_header_list_size,
        }
    }

    pub(crate) fn decode(&mut self, block: &[u8]) -> Result<Vec<(Bytes, Bytes)>, HpackError> {
        let mut input = block;
        let mut headers = Vec::new();
        let mut list_size = 0usize;
        while let Some(&first) = input.first() {
            let (name, value) = if first & 0x80 != 0 {
                // Indexed header field
                let index = decode_varint(&mut input, 7)?;
                lookup(&self.table, index)?
            } else if first & 0xc0 == 0x40 {
                // Literal with incremental indexing
                let index = decode_varint(&mut input, 6)?;
                let name = if index == 0 {
                    decode_string(&mut input)?
                } else {
                    lookup(&self.table, index)?.0
                };
                let value = decode_string(&mut input)?;
                self.table.insert(name.clone(), value.clone());
                (name, value)
            } else if first & 0xe0 == 0x20 {
                // Dynamic table size update
                let size = decode_varint(&mut input, 5)?;
                if size > self.table.protocol_max_size {
                    return Err(HpackError::InvalidSizeUpdate);
                }
                self.table.resize(size);
                continue;
            } else {
                // Literal without indexing / never indexed
                let index = decode_varint(&mut input, 4)?;
                let name = if index == 0 {
                    decode_string(&mut input)?
                } else {
                    lookup(&self.table, index)?.0
                };
                let value = decode_string(&mut input)?;
                (name, value)
            };
            list_size += name.len() + value.len() + ENTRY_OVERHEAD;
            if list_size > self.max_header_list_size {
                return Err(HpackError::HeaderListTooLarge {
                    limit: self.max_header_list_size,
                });
            }
            headers.push((name, value));
        }
        Ok(headers)
    }

    #[cfg(test)]
    fn table_size(&self) -> usize {
        self.table.size
    }
}

/// Stateless encoder: indexed representations for exact static matches,
/// literals without indexing otherwise.
#[derive(Debug, Default)]
pub(crate) struct Encoder;

impl Encoder {
    pub(crate) fn encode(&mut self, headers: &[(Bytes, Bytes)], out: &mut BytesMut) {
        for (name, value) in headers {
            if let Some(index) = STATIC_TABLE
                .iter()
                .position(|&(n, v)| n == name.as_ref() && v == value.as_ref() && !v.is_empty())
            {
                encode_varint(index + 1, 7, 0x80, out);
                continue;
            }
            match STATIC_TABLE.iter().position(|&(n, _)| n == name.as_ref()) {
                Some(index) => encode_varint(index + 1, 4, 0, out),
                None => {
                    out.put_u8(0);
                    encode_string(name, out);
                }
            }
            encode_string(value, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unhex(hex: &str) -> Vec<u8> {
        let digits: Vec<u8> = hex
            .chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| c.to_digit(16).unwrap() as u8)
            .collect();
        digits.chunks(2).map(|p| (p[0] << 4) | p[1]).collect()
    }

    fn pairs(headers: &[(Bytes, Bytes)]) -> Vec<(&[u8], &[u8])> {
        headers
            .iter()
            .map(|(n, v)| (n.as_ref(), v.as_ref()))
            .collect()
    }

    #[test]
    fn literal_with_indexing() {
        // RFC 7541 Appendix C.2.1
        let mut decoder = Decoder::new(4096, 65535);
        let block = unhex("400a637573746f6d2d6b65790d637573746f6d2d686561646572");
        let headers = decoder.decode(&block).unwrap();
        assert_eq!(pairs(&headers), vec![(&b"custom-key"[..], &b"custom-header"[..])]);
        assert_eq!(decoder.table_size(), 55);
    }

    #[test]
    fn literal_without_indexing_and_indexed() {
        // RFC 7541 Appendix C.2.2 and C.2.4
        let mut decoder = Decoder::new(4096, 65535);
        let headers = decoder.decode(&unhex("040c2f73616d706c652f70617468")).unwrap();
        assert_eq!(pairs(&headers), vec![(&b":path"[..], &b"/sample/path"[..])]);
        assert_eq!(decoder.table_size(), 0);

        let headers = decoder.decode(&unhex("82")).unwrap();
        assert_eq!(pairs(&headers), vec![(&b":method"[..], &b"GET"[..])]);
    }

    #[test]
    fn request_sequence_builds_dynamic_table() {
        // RFC 7541 Appendix C.3
        let mut decoder = Decoder::new(4096, 65535);
        let headers = decoder
            .decode(&unhex("828684410f7777772e6578616d706c652e636f6d"))
            .unwrap();
        assert_eq!(
            pairs(&headers),
            vec![
                (&b":method"[..], &b"GET"[..]),
                (&b":scheme"[..], &b"http"[..]),
                (&b":path"[..], &b"/"[..]),
                (&b":authority"[..], &b"www.example.com"[..]),
            ]
        );
        assert_eq!(decoder.table_size(), 57);

        let headers = decoder.decode(&unhex("828684be58086e6f2d6361636865")).unwrap();
        assert_eq!(headers.last().unwrap().1.as_ref(), b"no-cache");
        assert_eq!(decoder.table_size(), 110);

        let headers = decoder
            .decode(&unhex("828785bf400a637573746f6d2d6b65790c637573746f6d2d76616c7565"))
            .unwrap();
        assert_eq!(
            headers.last().unwrap(),
            &(Bytes::from_static(b"custom-key"), Bytes::from_static(b"custom-value"))
        );
        assert_eq!(decoder.table_size(), 164);
    }

    #[test]
    fn huffman_request_sequence() {
        // RFC 7541 Appendix C.4
        let mut decoder = Decoder::new(4096, 65535);
        let headers = decoder
            .decode(&unhex("828684418cf1e3c2e5f23a6ba0ab90f4ff"))
            .unwrap();
        assert_eq!(
            headers.last().unwrap(),
            &(Bytes::from_static(b":authority"), Bytes::from_static(b"www.example.com"))
        );
        let headers = decoder.decode(&unhex("828684be5886a8eb10649cbf")).unwrap();
        assert_eq!(headers.last().unwrap().1.as_ref(), b"no-cache");
    }

    #[test]
    fn response_sequence_with_eviction() {
        // RFC 7541 Appendix C.5 with a 256 byte table
        let mut decoder = Decoder::new(256, 65535);
        let headers = decoder
            .decode(&unhex(
                "4803333032580770726976617465611d4d6f6e2c203231204f637420323031332032303a31333a\
                 323120474d546e1768747470733a2f2f7777772e6578616d706c652e636f6d",
            ))
            .unwrap();
        assert_eq!(
            pairs(&headers),
            vec![
                (&b":status"[..], &b"302"[..]),
                (&b"cache-control"[..], &b"private"[..]),
                (&b"date"[..], &b"Mon, 21 Oct 2013 20:13:21 GMT"[..]),
                (&b"location"[..], &b"https://www.example.com"[..]),
            ]
        );
        assert_eq!(decoder.table_size(), 222);

        let headers = decoder.decode(&unhex("4803333037c1c0bf")).unwrap();
        assert_eq!(headers[0].1.as_ref(), b"307");
        assert_eq!(decoder.table_size(), 222);
    }

    #[test]
    fn size_update_above_protocol_max_is_rejected() {
        let mut decoder = Decoder::new(128, 65535);
        // 0x3f + varint continuation: update to 256
        let mut block = BytesMut::new();
        encode_varint(256, 5, 0x20, &mut block);
        assert_eq!(
            decoder.decode(&block),
            Err(HpackError::InvalidSizeUpdate)
        );
    }

    #[test]
    fn header_list_size_limit() {
        let mut decoder = Decoder::new(4096, 40);
        let block = unhex("400a637573746f6d2d6b65790d637573746f6d2d686561646572");
        assert_eq!(
            decoder.decode(&block),
            Err(HpackError::HeaderListTooLarge { limit: 40 })
        );
    }

    #[test]
    fn encoder_output_round_trips() {
        let headers = vec![
            (Bytes::from_static(b":status"), Bytes::from_static(b"200")),
            (Bytes::from_static(b"content-length"), Bytes::from_static(b"5")),
            (Bytes::from_static(b"x-custom"), Bytes::from_static(b"yes")),
        ];
        let mut block = BytesMut::new();
        Encoder.encode(&headers, &mut block);
        let mut decoder = Decoder::new(4096, 65535);
        assert_eq!(decoder.decode(&block).unwrap(), headers);
        // Exact static matches use the single-byte indexed form.
        assert_eq!(block[0], 0x88);
    }
}
