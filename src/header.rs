//! Gzip member header encoding and parsing (RFC 1952 §2.3).
//!
//! The writer emits the 10-byte fixed header plus FEXTRA/FNAME/FCOMMENT
//! as set on [`Header`]; it never emits FTEXT or FHCRC. The parser is
//! strict: bad magic, a non-deflate method, oversized strings, or a
//! failed header CRC-16 all reject the stream.

use std::io::{self, BufRead, Write};

use crc32fast::Hasher;

use crate::error::{PargzError, PargzResult};
use crate::{BEST_COMPRESSION, BEST_SPEED};

pub(crate) const GZIP_ID1: u8 = 0x1f;
pub(crate) const GZIP_ID2: u8 = 0x8b;
pub(crate) const CM_DEFLATE: u8 = 8;

const FLG_HDR_CRC: u8 = 1 << 1;
const FLG_EXTRA: u8 = 1 << 2;
const FLG_NAME: u8 = 1 << 3;
const FLG_COMMENT: u8 = 1 << 4;

/// OS byte for "unknown".
pub(crate) const OS_UNKNOWN: u8 = 255;

/// Longest NUL-terminated header string the parser will accept.
const MAX_HEADER_STRING: usize = 512;

/// Metadata stored in a gzip member header.
///
/// On the writer, fields may be set freely until the first byte is
/// written; after that the header is frozen until `reset`. On the
/// reader, the fields reflect the first stream's header.
///
/// `name` and `comment` must be representable as ISO 8859-1 (Latin-1)
/// without an embedded NUL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    /// File comment (FCOMMENT).
    pub comment: Option<String>,
    /// Raw extra field (FEXTRA), at most 65535 bytes.
    pub extra: Option<Vec<u8>>,
    /// Modification time in seconds since the Unix epoch; 0 means unset.
    pub mod_time: u32,
    /// Original file name (FNAME).
    pub name: Option<String>,
    /// Originating operating system (RFC 1952 OS codes).
    pub os: u8,
}

impl Default for Header {
    fn default() -> Self {
        Header {
            comment: None,
            extra: None,
            mod_time: 0,
            name: None,
            os: OS_UNKNOWN,
        }
    }
}

/// Encode a string as NUL-terminated Latin-1.
fn encode_latin1(s: &str) -> PargzResult<Vec<u8>> {
    let mut out = Vec::with_capacity(s.len() + 1);
    for ch in s.chars() {
        let code = ch as u32;
        if code == 0 || code > 0xff {
            return Err(PargzError::InvalidHeader(format!(
                "non-Latin-1 header string: {s:?}"
            )));
        }
        out.push(code as u8);
    }
    out.push(0);
    Ok(out)
}

/// Serialize `header` to `sink`, including the XFL byte for `level`.
///
/// Strings are validated before any byte reaches the sink, so a
/// metadata error leaves the sink untouched.
pub(crate) fn write_header<W: Write>(
    sink: &mut W,
    header: &Header,
    level: i32,
) -> PargzResult<()> {
    let name = header.name.as_deref().map(encode_latin1).transpose()?;
    let comment = header.comment.as_deref().map(encode_latin1).transpose()?;
    if let Some(extra) = &header.extra {
        if extra.len() > 0xffff {
            return Err(PargzError::InvalidHeader(format!(
                "extra data too large: {} bytes",
                extra.len()
            )));
        }
    }

    let mut flg = 0u8;
    if header.extra.is_some() {
        flg |= FLG_EXTRA;
    }
    if name.is_some() {
        flg |= FLG_NAME;
    }
    if comment.is_some() {
        flg |= FLG_COMMENT;
    }

    let mut fixed = [0u8; 10];
    fixed[0] = GZIP_ID1;
    fixed[1] = GZIP_ID2;
    fixed[2] = CM_DEFLATE;
    fixed[3] = flg;
    fixed[4..8].copy_from_slice(&header.mod_time.to_le_bytes());
    fixed[8] = match level {
        BEST_COMPRESSION => 2,
        BEST_SPEED => 4,
        _ => 0,
    };
    fixed[9] = header.os;
    sink.write_all(&fixed).map_err(PargzError::SinkWrite)?;

    if let Some(extra) = &header.extra {
        sink.write_all(&(extra.len() as u16).to_le_bytes())
            .map_err(PargzError::SinkWrite)?;
        sink.write_all(extra).map_err(PargzError::SinkWrite)?;
    }
    if let Some(name) = &name {
        sink.write_all(name).map_err(PargzError::SinkWrite)?;
    }
    if let Some(comment) = &comment {
        sink.write_all(comment).map_err(PargzError::SinkWrite)?;
    }
    Ok(())
}

fn read_err(e: io::Error) -> PargzError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        PargzError::InvalidHeader("truncated header".to_string())
    } else {
        PargzError::SourceRead(e)
    }
}

fn read_u8<R: BufRead>(src: &mut R, digest: &mut Hasher) -> PargzResult<u8> {
    let mut b = [0u8; 1];
    src.read_exact(&mut b).map_err(read_err)?;
    digest.update(&b);
    Ok(b[0])
}

fn read_u16_le<R: BufRead>(src: &mut R, digest: &mut Hasher) -> PargzResult<u16> {
    let mut b = [0u8; 2];
    src.read_exact(&mut b).map_err(read_err)?;
    digest.update(&b);
    Ok(u16::from_le_bytes(b))
}

/// Read a NUL-terminated Latin-1 string, mapping each byte to the
/// corresponding Unicode code point.
fn read_latin1<R: BufRead>(src: &mut R, digest: &mut Hasher) -> PargzResult<String> {
    let mut raw = Vec::new();
    loop {
        let b = read_u8(src, digest)?;
        if b == 0 {
            break;
        }
        if raw.len() >= MAX_HEADER_STRING {
            return Err(PargzError::InvalidHeader(
                "header string too long".to_string(),
            ));
        }
        raw.push(b);
    }
    Ok(raw.iter().map(|&b| b as char).collect())
}

/// Parse one member header from `src`.
///
/// The CRC-16 in an FHCRC field covers every header byte before it, per
/// the RFC. Errors: `InvalidHeader` for malformed or truncated headers,
/// `SourceRead` for underlying I/O failures.
pub(crate) fn read_header<R: BufRead>(src: &mut R) -> PargzResult<Header> {
    let mut digest = Hasher::new();

    let mut fixed = [0u8; 10];
    src.read_exact(&mut fixed).map_err(read_err)?;
    digest.update(&fixed);
    if fixed[0] != GZIP_ID1 || fixed[1] != GZIP_ID2 {
        return Err(PargzError::InvalidHeader("bad magic bytes".to_string()));
    }
    if fixed[2] != CM_DEFLATE {
        return Err(PargzError::InvalidHeader(format!(
            "unsupported compression method {}",
            fixed[2]
        )));
    }
    // FTEXT and XFL are advisory; both are accepted and ignored.
    let flg = fixed[3];

    let mut header = Header {
        mod_time: u32::from_le_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]),
        os: fixed[9],
        ..Header::default()
    };

    if flg & FLG_EXTRA != 0 {
        let len = read_u16_le(src, &mut digest)? as usize;
        let mut extra = vec![0u8; len];
        src.read_exact(&mut extra).map_err(read_err)?;
        digest.update(&extra);
        header.extra = Some(extra);
    }
    if flg & FLG_NAME != 0 {
        header.name = Some(read_latin1(src, &mut digest)?);
    }
    if flg & FLG_COMMENT != 0 {
        header.comment = Some(read_latin1(src, &mut digest)?);
    }
    if flg & FLG_HDR_CRC != 0 {
        let expect = digest.clone().finalize() & 0xffff;
        let mut b = [0u8; 2];
        src.read_exact(&mut b).map_err(read_err)?;
        if u16::from_le_bytes(b) as u32 != expect {
            return Err(PargzError::InvalidHeader(
                "header checksum mismatch".to_string(),
            ));
        }
    }

    Ok(header)
}
