//! Tar header blocks and extended header records.

use crate::{Error, Result};

/// Size of a tar record block.
pub const BLOCK_SIZE: usize = 512;

/// POSIX ustar magic and version.
const USTAR_MAGIC: &[u8] = b"ustar\0";
/// Old GNU magic; the `prefix` field holds other data in this format.
const GNU_MAGIC: &[u8] = b"ustar ";

const CHECKSUM: std::ops::Range<usize> = 148..156;

/// The fields of one 512-byte header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RawHeader {
    pub name: Vec<u8>,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub size: u64,
    pub mtime: i64,
    pub typeflag: u8,
    pub linkname: Vec<u8>,
    pub uname: Vec<u8>,
    pub gname: Vec<u8>,
}

impl RawHeader {
    /// Parses a header block that starts at decoded `offset`.
    pub(crate) fn parse(block: &[u8; BLOCK_SIZE], offset: u64) -> Result<Self> {
        if !checksum_matches(block) {
            return Err(Error::corrupt(offset, "header checksum mismatch"));
        }

        let field = |name: &str, range: std::ops::Range<usize>| -> Result<i64> {
            parse_numeric(&block[range])
                .ok_or_else(|| Error::corrupt(offset, format!("invalid numeric field `{name}`")))
        };
        let unsigned = |name: &str, range: std::ops::Range<usize>| -> Result<u64> {
            u64::try_from(field(name, range)?)
                .map_err(|_| Error::corrupt(offset, format!("negative field `{name}`")))
        };

        let mut name = cstr(&block[0..100]).to_vec();
        if &block[257..263] == USTAR_MAGIC {
            let prefix = cstr(&block[345..500]);
            if !prefix.is_empty() {
                let mut joined = prefix.to_vec();
                joined.push(b'/');
                joined.extend_from_slice(&name);
                name = joined;
            }
        }

        Ok(Self {
            name,
            mode: (unsigned("mode", 100..108)? & 0o7777) as u32,
            uid: unsigned("uid", 108..116)?,
            gid: unsigned("gid", 116..124)?,
            size: unsigned("size", 124..136)?,
            mtime: field("mtime", 136..148)?,
            typeflag: block[156],
            linkname: cstr(&block[157..257]).to_vec(),
            uname: cstr(&block[265..297]).to_vec(),
            gname: cstr(&block[297..329]).to_vec(),
        })
    }
}

/// Returns true if every byte of the block is zero.
pub(crate) fn is_zero_block(block: &[u8]) -> bool {
    block.iter().all(|&b| b == 0)
}

/// Verifies the header checksum.
///
/// Both the POSIX unsigned sum and the signed sum written by some historic
/// implementations are accepted.
pub(crate) fn checksum_matches(block: &[u8]) -> bool {
    if block.len() < BLOCK_SIZE {
        return false;
    }
    let Some(stored) = parse_octal(&block[CHECKSUM]) else {
        return false;
    };
    let mut unsigned: i64 = 0;
    let mut signed: i64 = 0;
    for (i, &byte) in block[..BLOCK_SIZE].iter().enumerate() {
        let byte = if CHECKSUM.contains(&i) { b' ' } else { byte };
        unsigned += i64::from(byte);
        signed += i64::from(byte as i8);
    }
    stored == unsigned || stored == signed
}

/// Cheap plausibility check used by format detection.
pub fn looks_like_header(block: &[u8]) -> bool {
    if block.len() < BLOCK_SIZE || is_zero_block(&block[..BLOCK_SIZE]) {
        return false;
    }
    let magic = &block[257..263];
    magic == USTAR_MAGIC || magic == GNU_MAGIC || checksum_matches(block)
}

/// Parses an octal or GNU base-256 numeric field.
pub(crate) fn parse_numeric(field: &[u8]) -> Option<i64> {
    match field.first() {
        Some(&first) if first & 0x80 != 0 => parse_base256(field),
        _ => parse_octal(field),
    }
}

fn parse_octal(field: &[u8]) -> Option<i64> {
    let trimmed = trim_numeric(field);
    let mut value: i64 = 0;
    for &b in trimmed {
        if !(b'0'..=b'7').contains(&b) {
            return None;
        }
        value = value.checked_mul(8)?.checked_add(i64::from(b - b'0'))?;
    }
    Some(value)
}

fn trim_numeric(field: &[u8]) -> &[u8] {
    let end = field
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(field.len());
    let field = &field[..end];
    let start = field.iter().position(|&b| b != b' ').unwrap_or(field.len());
    let field = &field[start..];
    let end = field.iter().rposition(|&b| b != b' ').map_or(0, |i| i + 1);
    &field[..end]
}

fn parse_base256(field: &[u8]) -> Option<i64> {
    let negative = field[0] & 0x40 != 0;
    if negative {
        // Two's complement; the leading bits are all ones.
        let mut value: i64 = -1;
        for &b in &field[1..] {
            value = value.wrapping_shl(8) | i64::from(b);
        }
        return Some(value);
    }
    let mut value = i64::from(field[0] & 0x7f);
    for &b in &field[1..] {
        if value > (i64::MAX >> 8) {
            return None;
        }
        value = (value << 8) | i64::from(b);
    }
    Some(value)
}

/// The bytes of a NUL-terminated field.
pub(crate) fn cstr(field: &[u8]) -> &[u8] {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    &field[..end]
}

/// Parses the records of a PAX extended header (`"<len> <key>=<value>\n"`).
pub(crate) fn parse_pax(data: &[u8], offset: u64) -> Result<Vec<(String, Vec<u8>)>> {
    let bad = |reason: &str| Error::corrupt(offset, format!("malformed PAX record: {reason}"));
    let mut records = Vec::new();
    let mut rest = data;
    while !rest.is_empty() && rest[0] != 0 {
        let space = rest
            .iter()
            .position(|&b| b == b' ')
            .ok_or_else(|| bad("missing length"))?;
        let len: usize = std::str::from_utf8(&rest[..space])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| bad("invalid length"))?;
        if len <= space + 1 || len > rest.len() || rest[len - 1] != b'\n' {
            return Err(bad("length out of range"));
        }
        let record = &rest[space + 1..len - 1];
        let eq = record
            .iter()
            .position(|&b| b == b'=')
            .ok_or_else(|| bad("missing `=`"))?;
        let key = String::from_utf8_lossy(&record[..eq]).into_owned();
        records.push((key, record[eq + 1..].to_vec()));
        rest = &rest[len..];
    }
    Ok(records)
}
