//! Bit and byte level helpers shared by every decoder.
//!
//! Everything here is bounds-checked: asking for bytes or bits past the end of a buffer is
//! an error, never a silent truncation.

use crate::{Error, Result};
use byteorder::{BigEndian, ByteOrder, LittleEndian};

/// Borrows `length` bytes at `offset`.
pub fn slice(buf: &[u8], offset: usize, length: usize) -> Result<&[u8]> {
    offset
        .checked_add(length)
        .and_then(|end| buf.get(offset..end))
        .ok_or(Error::ByteRange {
            offset,
            length,
            len: buf.len(),
        })
}

/// Reads `width` bits starting at `offset`, counting from the most significant bit of the
/// first byte.
pub fn bits(buf: &[u8], offset: usize, width: usize) -> Result<u32> {
    if width > 32 || offset + width > buf.len() * 8 {
        return Err(Error::BitRange {
            offset,
            width,
            len: buf.len(),
        });
    }
    let mut v: u64 = 0;
    for bit in offset..offset + width {
        let byte = buf[bit / 8];
        v = (v << 1) | u64::from((byte >> (7 - bit % 8)) & 1);
    }
    Ok(v as u32)
}

/// Like [`bits`], but interprets the field as two's complement.
pub fn bits_signed(buf: &[u8], offset: usize, width: usize) -> Result<i32> {
    let v = bits(buf, offset, width)?;
    if width == 0 || width == 32 {
        return Ok(v as i32);
    }
    if v & (1 << (width - 1)) != 0 {
        Ok((i64::from(v) - (1i64 << width)) as i32)
    } else {
        Ok(v as i32)
    }
}

fn check_width(buf: &[u8], offset: usize, length: usize) -> Result<&[u8]> {
    if length == 0 || length > 8 {
        return Err(Error::ByteRange {
            offset,
            length,
            len: buf.len(),
        });
    }
    slice(buf, offset, length)
}

/// Big endian unsigned integer, 1-8 bytes wide.
pub fn int_be(buf: &[u8], offset: usize, length: usize) -> Result<u64> {
    Ok(BigEndian::read_uint(check_width(buf, offset, length)?, length))
}

/// Little endian unsigned integer, 1-8 bytes wide.
pub fn int_le(buf: &[u8], offset: usize, length: usize) -> Result<u64> {
    Ok(LittleEndian::read_uint(check_width(buf, offset, length)?, length))
}

/// Copies a sub-range with its byte order flipped.
pub fn reverse(buf: &[u8], offset: usize, length: usize) -> Result<Vec<u8>> {
    let mut out = slice(buf, offset, length)?.to_vec();
    out.reverse();
    Ok(out)
}

/// Decodes one packed BCD byte (0x42 => 42).
pub fn bcd_to_int(b: u8) -> Result<u8> {
    let (hi, lo) = (b >> 4, b & 0x0F);
    if hi > 9 || lo > 9 {
        return Err(Error::InvalidBcd(b));
    }
    Ok(hi * 10 + lo)
}

/// Decodes a run of packed BCD bytes as one decimal number.
///
/// Runs too long to fit a `u64` are a `ByteRange` error.
pub fn bcd_number(buf: &[u8], offset: usize, length: usize) -> Result<u64> {
    let len = buf.len();
    slice(buf, offset, length)?.iter().try_fold(0u64, |acc, &b| {
        let digits = u64::from(bcd_to_int(b)?);
        acc.checked_mul(100)
            .and_then(|v| v.checked_add(digits))
            .ok_or(Error::ByteRange {
                offset,
                length,
                len,
            })
    })
}

fn luhn_sum(digits: &str) -> Result<u32> {
    digits
        .chars()
        .rev()
        .enumerate()
        .try_fold(0u32, |acc, (i, c)| {
            let mut d = c
                .to_digit(10)
                .ok_or_else(|| Error::Corrupt(format!("not a decimal number: {:?}", digits)))?;
            if i % 2 == 1 {
                d *= 2;
                if d > 9 {
                    d -= 9;
                }
            }
            Ok(acc + d)
        })
        .map(|sum| sum % 10)
}

/// Computes the Luhn check digit to append to `digits`.
pub fn luhn_check_digit(digits: &str) -> Result<u8> {
    let sum = luhn_sum(&format!("{}0", digits))?;
    Ok(((10 - sum) % 10) as u8)
}

/// True if `digits` (check digit included) passes the Luhn check.
pub fn luhn_valid(digits: &str) -> bool {
    !digits.is_empty() && matches!(luhn_sum(digits), Ok(0))
}

/// Zero-pads `value` to fill `groups` and joins the groups with `separator`.
///
/// `format_number(123456789, " ", &[4, 4, 3])` => `"0012 3456 789"`. Digits that don't
/// fit are kept in the first group.
pub fn format_number(value: u64, separator: &str, groups: &[usize]) -> String {
    let total: usize = groups.iter().sum();
    let digits = format!("{:0width$}", value, width = total);
    let overflow = digits.len() - total;

    let mut out = Vec::with_capacity(groups.len());
    let mut rest = digits.as_str();
    for (i, &group) in groups.iter().enumerate() {
        let width = if i == 0 { group + overflow } else { group };
        let (head, tail) = rest.split_at(width.min(rest.len()));
        out.push(head);
        rest = tail;
    }
    out.join(separator)
}

/// Rebuilds a balance stored as a 31-bit magnitude whose top bit is garbage: bit 30 is
/// copied into bit 31.
pub fn sign_merge_31(value: u32) -> i32 {
    (value | ((value & 0x4000_0000) << 1)) as i32
}

/// True if every byte of `buf` equals `b`.
pub fn is_filled(buf: &[u8], b: u8) -> bool {
    buf.iter().all(|&v| v == b)
}
