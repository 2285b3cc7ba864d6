//! Git packfile reading and writing.
//!
//! A packfile is a `PACK` magic, a big-endian version and object count,
//! one record per object (a varint type+size header and a zlib-compressed
//! body, preceded for delta records by a base reference), and a trailing
//! SHA-1 of everything before it.

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::io::{Read, Write};

use crate::delta::Delta;
use crate::object::{Object, ObjectId, ObjectType};
use crate::repo::Repository;
use crate::varint;
use crate::{Error, Result};

const SIGNATURE: &[u8; 4] = b"PACK";
/// Version written by `PackWriter`; versions 2 and 3 are readable.
const WRITE_VERSION: u32 = 3;

/// Packfile type code for a delta whose base is named by byte offset.
const OFS_DELTA: u8 = 6;
/// Packfile type code for a delta whose base is named by object ID.
const REF_DELTA: u8 = 7;

/// A streamed cursor over the objects of a packfile.
///
/// Every decoded body is retained for the lifetime of the reader, keyed
/// by both stream offset and object ID, because any later record may
/// name it as a delta base. The memory cost is a property of the format.
pub struct PackReader<'a> {
    data: &'a [u8],
    pos: usize,
    remaining: u64,
    repo: Option<&'a dyn Repository>,
    bases: Vec<(ObjectType, Vec<u8>)>,
    by_offset: HashMap<u64, usize>,
    by_id: HashMap<ObjectId, usize>,
}

impl<'a> PackReader<'a> {
    /// Open a packfile, validating magic, version and object count.
    /// Deltas may only reference earlier objects in the stream.
    pub fn new(data: &'a [u8]) -> Result<Self> {
        Self::open(data, None)
    }

    /// Like `new`, but a ref-delta whose base is not in the stream is
    /// resolved against `repo` ("thin" packs, as produced by pushes).
    pub fn with_repository(data: &'a [u8], repo: &'a dyn Repository) -> Result<Self> {
        Self::open(data, Some(repo))
    }

    fn open(data: &'a [u8], repo: Option<&'a dyn Repository>) -> Result<Self> {
        if data.len() < 12 {
            return Err(Error::BadHeader);
        }
        if &data[..4] != SIGNATURE {
            return Err(Error::BadHeader);
        }
        let version = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if !(2..=3).contains(&version) {
            return Err(Error::UnsupportedVersion(version));
        }
        let count = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
        Ok(Self {
            data,
            pos: 12,
            remaining: u64::from(count),
            repo,
            bases: Vec::new(),
            by_offset: HashMap::new(),
            by_id: HashMap::new(),
        })
    }

    /// Objects not yet decoded.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Decode the next object record.
    pub fn read_object(&mut self) -> Result<(ObjectId, Object)> {
        if self.remaining == 0 {
            return Err(Error::UnexpectedEof);
        }
        let start = self.pos as u64;
        let (code, size) = self.read_record_header()?;

        let base = match code {
            OFS_DELTA => {
                let neg = varint::read_mbe(self.data, &mut self.pos)?;
                let base_pos = start.checked_sub(neg).ok_or(Error::BadBase)?;
                Some(*self.by_offset.get(&base_pos).ok_or(Error::BadBase)?)
            }
            REF_DELTA => {
                if self.pos + 20 > self.data.len() {
                    return Err(Error::UnexpectedEof);
                }
                let base_id = ObjectId::from_bytes(&self.data[self.pos..self.pos + 20]).unwrap();
                self.pos += 20;
                Some(self.resolve_ref_base(base_id)?)
            }
            _ => {
                ObjectType::from_code(code).ok_or(Error::BadTypeCode(code))?;
                None
            }
        };

        let body = self.inflate(size as usize)?;
        let (kind, body) = match base {
            Some(idx) => {
                let (base_kind, base_body) = &self.bases[idx];
                (*base_kind, Delta::parse(&body)?.apply(base_body)?)
            }
            None => (ObjectType::from_code(code).unwrap(), body),
        };

        let obj = Object::decode_body(kind, &body)?;
        let id = ObjectId::hash_body(kind, &body);

        let idx = self.bases.len();
        self.bases.push((kind, body));
        self.by_offset.insert(start, idx);
        self.by_id.insert(id, idx);
        self.remaining -= 1;
        Ok((id, obj))
    }

    /// Consume the SHA-1 footer and verify it against the bytes read.
    pub fn close(self) -> Result<()> {
        if self.pos + 20 > self.data.len() {
            return Err(Error::UnexpectedEof);
        }
        let mut hasher = Sha1::new();
        hasher.update(&self.data[..self.pos]);
        if hasher.finalize().as_slice() != &self.data[self.pos..self.pos + 20] {
            return Err(Error::Checksum);
        }
        Ok(())
    }

    /// A record header is a little-endian base128 number with the type
    /// code in bits 4-6 of the first byte.
    fn read_record_header(&mut self) -> Result<(u8, u64)> {
        let mut b = *self.data.get(self.pos).ok_or(Error::UnexpectedEof)?;
        self.pos += 1;
        let code = (b >> 4) & 0x7;
        let mut size = u64::from(b & 0xF);
        let mut shift = 4u32;
        while b & 0x80 != 0 {
            b = *self.data.get(self.pos).ok_or(Error::UnexpectedEof)?;
            self.pos += 1;
            if shift > 63 {
                return Err(Error::VarintOverflow);
            }
            size |= u64::from(b & 0x7F) << shift;
            shift += 7;
        }
        Ok((code, size))
    }

    fn resolve_ref_base(&mut self, base_id: ObjectId) -> Result<usize> {
        if let Some(&idx) = self.by_id.get(&base_id) {
            return Ok(idx);
        }
        let repo = self.repo.ok_or(Error::BadBase)?;
        let obj = repo.get_object(&base_id).map_err(|_| Error::BadBase)?;
        let idx = self.bases.len();
        self.bases.push((obj.kind(), obj.encode_body()));
        self.by_id.insert(base_id, idx);
        Ok(idx)
    }

    /// Inflate exactly `size` bytes of zlib data and step past the zlib
    /// checksum, which read_exact alone leaves unconsumed.
    fn inflate(&mut self, size: usize) -> Result<Vec<u8>> {
        let mut z = ZlibDecoder::new(&self.data[self.pos..]);
        let mut body = vec![0u8; size];
        z.read_exact(&mut body)?;
        let mut excess = [0u8; 1];
        if z.read(&mut excess)? != 0 {
            return Err(Error::ObjectSize {
                expected: size,
                actual: size + 1,
            });
        }
        self.pos += z.total_in() as usize;
        Ok(body)
    }
}

/// Writes objects to a packfile buffer. All objects are emitted as full
/// bodies; no delta compression is attempted.
pub struct PackWriter {
    buf: Vec<u8>,
    remaining: u64,
}

impl PackWriter {
    /// Start a packfile that will hold `count` objects.
    pub fn new(count: u64) -> Result<Self> {
        let count32 = u32::try_from(count).map_err(|_| Error::TooManyObjects)?;
        let mut buf = Vec::new();
        buf.extend_from_slice(SIGNATURE);
        buf.extend_from_slice(&WRITE_VERSION.to_be_bytes());
        buf.extend_from_slice(&count32.to_be_bytes());
        Ok(Self {
            buf,
            remaining: count,
        })
    }

    /// Append one object record.
    pub fn write_object(&mut self, obj: &Object) -> Result<()> {
        if self.remaining == 0 {
            return Err(Error::TooManyObjects);
        }
        let body = obj.encode_body();
        self.write_record_header(obj.kind().code(), body.len() as u64);
        let mut z = ZlibEncoder::new(Vec::new(), Compression::default());
        z.write_all(&body)?;
        self.buf.extend_from_slice(&z.finish()?);
        self.remaining -= 1;
        Ok(())
    }

    /// Seal the packfile with its SHA-1 footer and return the bytes.
    pub fn close(mut self) -> Vec<u8> {
        let mut hasher = Sha1::new();
        hasher.update(&self.buf);
        let digest = hasher.finalize();
        self.buf.extend_from_slice(&digest);
        self.buf
    }

    fn write_record_header(&mut self, code: u8, size: u64) {
        let mut first = (code << 4) | (size & 0xF) as u8;
        let mut rest = size >> 4;
        if rest > 0 {
            first |= 0x80;
        }
        self.buf.push(first);
        while rest > 0 {
            let mut b = (rest & 0x7F) as u8;
            rest >>= 7;
            if rest > 0 {
                b |= 0x80;
            }
            self.buf.push(b);
        }
    }
}
