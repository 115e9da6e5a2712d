//! Big-endian XDR primitives for the core's own callback wire surface
//! (CB_COMPOUND and its RPC envelope), adapted from the forward-protocol
//! codec's primitive style but narrowed to what callbacks need (§1, §4.7).

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

const ALIGNMENT: usize = 4;

fn padding_len(n: usize) -> usize {
    (ALIGNMENT - n % ALIGNMENT) % ALIGNMENT
}

pub fn read_padding(src: &mut impl Read, n: usize) -> io::Result<()> {
    let mut buf = [0u8; ALIGNMENT];
    src.read_exact(&mut buf[..padding_len(n)])
}

pub fn write_padding(dst: &mut impl Write, n: usize) -> io::Result<()> {
    dst.write_all(&[0u8; ALIGNMENT][..padding_len(n)])
}

pub fn read_u32(src: &mut impl Read) -> io::Result<u32> {
    src.read_u32::<BigEndian>()
}

pub fn write_u32(dst: &mut impl Write, v: u32) -> io::Result<()> {
    dst.write_u32::<BigEndian>(v)
}

pub fn read_u64(src: &mut impl Read) -> io::Result<u64> {
    src.read_u64::<BigEndian>()
}

pub fn write_u64(dst: &mut impl Write, v: u64) -> io::Result<()> {
    dst.write_u64::<BigEndian>(v)
}

pub fn read_bool(src: &mut impl Read) -> io::Result<bool> {
    Ok(read_u32(src)? != 0)
}

pub fn write_bool(dst: &mut impl Write, v: bool) -> io::Result<()> {
    write_u32(dst, v as u32)
}

/// Reads an XDR `opaque<>`: 4-byte big-endian length, bytes, zero padding.
pub fn read_opaque(src: &mut impl Read) -> io::Result<Vec<u8>> {
    let len = read_u32(src)? as usize;
    let mut buf = vec![0u8; len];
    src.read_exact(&mut buf)?;
    read_padding(src, len)?;
    Ok(buf)
}

pub fn write_opaque(dst: &mut impl Write, bytes: &[u8]) -> io::Result<()> {
    write_u32(dst, bytes.len() as u32)?;
    dst.write_all(bytes)?;
    write_padding(dst, bytes.len())
}

pub fn read_fixed<const N: usize>(src: &mut impl Read) -> io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    src.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn write_fixed(dst: &mut impl Write, bytes: &[u8]) -> io::Result<()> {
    dst.write_all(bytes)
}

/// A record-marked fragment header (§6 "RPC record mark"): bit 31 is the
/// last-fragment flag, bits 0-30 are the fragment length.
pub fn record_mark(fragment_len: u32, last: bool) -> u32 {
    let last_bit = if last { 1u32 << 31 } else { 0 };
    last_bit | (fragment_len & 0x7FFF_FFFF)
}

pub fn parse_record_mark(mark: u32) -> (u32, bool) {
    (mark & 0x7FFF_FFFF, mark & 0x8000_0000 != 0)
}
