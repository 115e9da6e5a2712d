//! Persisted client state for grace recovery (§6 "Persisted state"): a
//! versioned binary format written atomically so a crash mid-write never
//! corrupts the previous snapshot.

use crate::ids::ClientId;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};
use std::path::Path;

const MAGIC: u32 = 0x4e_46_53_34; // "NFS4"
const VERSION: u32 = 1;

/// One confirmed client as recorded for the next startup's grace window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub client_id: u64,
    pub name: Vec<u8>,
    pub verifier: [u8; 8],
    pub addr: String,
}

fn write_opaque(dst: &mut impl Write, bytes: &[u8]) -> io::Result<()> {
    dst.write_u32::<BigEndian>(bytes.len() as u32)?;
    dst.write_all(bytes)
}

fn read_opaque(src: &mut impl Read) -> io::Result<Vec<u8>> {
    let len = src.read_u32::<BigEndian>()? as usize;
    let mut buf = vec![0u8; len];
    src.read_exact(&mut buf)?;
    Ok(buf)
}

fn write_record(dst: &mut impl Write, record: &SnapshotRecord) -> io::Result<()> {
    dst.write_u64::<BigEndian>(record.client_id)?;
    write_opaque(dst, &record.name)?;
    dst.write_all(&record.verifier)?;
    write_opaque(dst, record.addr.as_bytes())
}

fn read_record(src: &mut impl Read) -> io::Result<SnapshotRecord> {
    let client_id = src.read_u64::<BigEndian>()?;
    let name = read_opaque(src)?;
    let mut verifier = [0u8; 8];
    src.read_exact(&mut verifier)?;
    let addr = String::from_utf8(read_opaque(src)?)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(SnapshotRecord { client_id, name, verifier, addr })
}

/// Serializes a snapshot to bytes: 4-byte magic, 4-byte version, 4-byte
/// record count, then the records.
pub fn encode(records: &[SnapshotRecord]) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.write_u32::<BigEndian>(MAGIC)?;
    buf.write_u32::<BigEndian>(VERSION)?;
    buf.write_u32::<BigEndian>(records.len() as u32)?;
    for record in records {
        write_record(&mut buf, record)?;
    }
    Ok(buf)
}

pub fn decode(bytes: &[u8]) -> io::Result<Vec<SnapshotRecord>> {
    let mut cursor = io::Cursor::new(bytes);
    let magic = cursor.read_u32::<BigEndian>()?;
    if magic != MAGIC {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad snapshot magic"));
    }
    let version = cursor.read_u32::<BigEndian>()?;
    if version != VERSION {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "unsupported snapshot version"));
    }
    let count = cursor.read_u32::<BigEndian>()?;
    let mut records = Vec::with_capacity(count as usize);
    for _ in 0..count {
        records.push(read_record(&mut cursor)?);
    }
    Ok(records)
}

/// Writes a snapshot atomically: encode to a temp file in the same
/// directory, then rename over the destination.
pub fn write_atomic(path: &Path, records: &[SnapshotRecord]) -> io::Result<()> {
    let bytes = encode(records)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp = dir.join(format!(
        ".{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("snapshot")
    ));
    std::fs::write(&tmp, &bytes)?;
    std::fs::rename(&tmp, path)
}

pub fn read_from(path: &Path) -> io::Result<Vec<SnapshotRecord>> {
    let bytes = std::fs::read(path)?;
    decode(&bytes)
}

pub fn expected_client_ids(records: &[SnapshotRecord]) -> Vec<ClientId> {
    records.iter().map(|r| ClientId(r.client_id)).collect()
}
