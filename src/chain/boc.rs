//! Minimal bag-of-cells reader.
//!
//! Get-method results come back as serialized cells. The only value this
//! crate needs out of them is a standard address stored at the start of the
//! root cell, so this reads the root cell's data bits and nothing else.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use super::{Address, ChainError};

const MAGIC: [u8; 4] = [0xb5, 0xee, 0x9c, 0x72];

fn decode_err(msg: &str) -> ChainError {
    ChainError::Decode(format!("boc: {msg}"))
}

/// Byte length of `count` fields of `size` bytes each
fn span(count: usize, size: usize) -> Result<usize, ChainError> {
    count
        .checked_mul(size)
        .ok_or_else(|| decode_err("length overflow"))
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], ChainError> {
        let end = self
            .pos
            .checked_add(n)
            .ok_or_else(|| decode_err("truncated"))?;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or_else(|| decode_err("truncated"))?;
        self.pos = end;
        Ok(slice)
    }

    fn uint(&mut self, n: usize) -> Result<usize, ChainError> {
        if n > std::mem::size_of::<usize>() {
            return Err(decode_err("integer too wide"));
        }
        Ok(self
            .take(n)?
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | *b as usize))
    }
}

/// Data bits of the root cell
fn root_cell_bits(bytes: &[u8]) -> Result<(Vec<u8>, usize), ChainError> {
    let mut cur = Cursor { bytes, pos: 0 };
    if cur.take(4)? != MAGIC {
        return Err(decode_err("bad magic"));
    }

    let flags = cur.take(1)?[0];
    let has_idx = flags & 0x80 != 0;
    let ref_size = (flags & 0x07) as usize;
    let off_size = cur.uint(1)?;
    if ref_size == 0 || off_size == 0 {
        return Err(decode_err("bad header"));
    }

    let cells = cur.uint(ref_size)?;
    let roots = cur.uint(ref_size)?;
    let _absent = cur.uint(ref_size)?;
    let _total = cur.uint(off_size)?;
    if roots == 0 {
        return Err(decode_err("no root"));
    }
    let root = cur.uint(ref_size)?;
    cur.take(span(roots - 1, ref_size)?)?;
    if has_idx {
        cur.take(span(cells, off_size)?)?;
    }

    for idx in 0..cells {
        let d1 = cur.uint(1)?;
        let d2 = cur.uint(1)?;
        let data = cur.take(d2.div_ceil(2))?;
        cur.take(span(d1 & 0x07, ref_size)?)?;

        if idx == root {
            let bits = if d2 % 2 == 0 {
                data.len() * 8
            } else {
                // strip the completion tag
                let last = *data.last().ok_or_else(|| decode_err("empty cell"))?;
                if last == 0 {
                    return Err(decode_err("missing completion tag"));
                }
                data.len() * 8 - last.trailing_zeros() as usize - 1
            };
            return Ok((data.to_vec(), bits));
        }
    }

    Err(decode_err("root index out of range"))
}

struct BitReader {
    data: Vec<u8>,
    len: usize,
    pos: usize,
}

impl BitReader {
    fn bit(&mut self) -> Result<bool, ChainError> {
        if self.pos >= self.len {
            return Err(decode_err("cell underflow"));
        }
        let byte = self.data[self.pos / 8];
        let bit = (byte >> (7 - self.pos % 8)) & 1 == 1;
        self.pos += 1;
        Ok(bit)
    }

    fn uint(&mut self, n: usize) -> Result<u64, ChainError> {
        (0..n).try_fold(0u64, |acc, _| Ok((acc << 1) | self.bit()? as u64))
    }
}

/// Reads the `MsgAddress` stored at the start of a serialized slice.
/// `addr_none` yields `None`
pub(super) fn parse_address(boc: &str) -> Result<Option<Address>, ChainError> {
    let bytes = STANDARD
        .decode(boc.trim())
        .map_err(|e| decode_err(&e.to_string()))?;
    let (data, len) = root_cell_bits(&bytes)?;
    let mut reader = BitReader { data, len, pos: 0 };

    match reader.uint(2)? {
        0b00 => Ok(None),
        0b10 => {
            if reader.bit()? {
                return Err(decode_err("anycast addresses are not supported"));
            }
            let workchain = reader.uint(8)? as u8 as i8 as i32;
            let mut hash = [0u8; 32];
            for byte in hash.iter_mut() {
                *byte = reader.uint(8)? as u8;
            }
            Ok(Some(Address::new(workchain, hash)))
        }
        _ => Err(decode_err("unsupported address kind")),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[derive(Default)]
    struct BitWriter {
        bytes: Vec<u8>,
        len: usize,
    }

    impl BitWriter {
        fn bit(&mut self, b: bool) {
            if self.len % 8 == 0 {
                self.bytes.push(0);
            }
            if b {
                let last = self.bytes.len() - 1;
                self.bytes[last] |= 1 << (7 - self.len % 8);
            }
            self.len += 1;
        }

        fn uint(&mut self, v: u64, n: usize) {
            for i in (0..n).rev() {
                self.bit((v >> i) & 1 == 1);
            }
        }
    }

    /// Serializes a single-cell bag holding `address` as an `addr_std`
    pub(crate) fn address_boc(address: &Address) -> String {
        let mut w = BitWriter::default();
        w.uint(0b10, 2);
        w.bit(false);
        w.uint(address.workchain() as i8 as u8 as u64, 8);
        for b in address.hash() {
            w.uint(*b as u64, 8);
        }
        let bits = w.len;
        if bits % 8 != 0 {
            w.bit(true);
        }

        let d2 = (bits / 8 + bits.div_ceil(8)) as u8;
        let mut cell = vec![0u8, d2];
        cell.extend_from_slice(&w.bytes);

        let mut boc = MAGIC.to_vec();
        boc.push(0x01); // no index, 1-byte refs
        boc.push(0x01); // 1-byte offsets
        boc.extend_from_slice(&[1, 1, 0]); // cells, roots, absent
        boc.push(cell.len() as u8);
        boc.push(0); // root index
        boc.extend_from_slice(&cell);

        STANDARD.encode(boc)
    }

    #[test]
    fn reads_std_address() {
        let address = Address::new(0, [0x5a; 32]);
        let parsed = parse_address(&address_boc(&address)).unwrap();
        assert_eq!(parsed, Some(address));
    }

    #[test]
    fn reads_negative_workchain() {
        let address = Address::new(-1, [0x01; 32]);
        let parsed = parse_address(&address_boc(&address)).unwrap();
        assert_eq!(parsed, Some(address));
    }

    #[test]
    fn rejects_garbage() {
        let boc = STANDARD.encode([0u8; 12]);
        assert!(parse_address(&boc).is_err());
    }

    #[test]
    fn huge_counts_are_a_decode_error() {
        let mut boc = MAGIC.to_vec();
        boc.push(0x80 | 0x07); // index present, 7-byte refs
        boc.push(0x08); // 8-byte offsets
        boc.extend_from_slice(&[0xff; 7]); // cells
        boc.extend_from_slice(&[0xff; 7]); // roots
        boc.extend_from_slice(&[0; 7]); // absent
        boc.extend_from_slice(&[0xff; 8]); // total
        boc.extend_from_slice(&[0; 7]); // root index

        let err = parse_address(&STANDARD.encode(boc)).unwrap_err();
        assert!(matches!(err, ChainError::Decode(_)));
    }

    #[test]
    fn oversized_offsets_are_rejected() {
        let mut boc = MAGIC.to_vec();
        boc.push(0x01);
        boc.push(0x40); // 64-byte offsets
        boc.extend_from_slice(&[1, 1, 0]);
        boc.extend_from_slice(&[0xff; 64]);

        assert!(matches!(
            parse_address(&STANDARD.encode(boc)),
            Err(ChainError::Decode(_))
        ));
    }
}
