//! Little-endian field primitives shared by every FTMS characteristic.
//!
//! FTMS fields are 1 to 4 byte integers, optionally signed, optionally scaled
//! by a fixed resolution (0.01 km/h, 0.1 %, 0.5 rpm, ...). A resolution is
//! stored as its integer divisor so decoded values are the nearest `f64` to the
//! decimal the device meant.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use crate::error::{FtmsError, Result};

/// Largest field width used by the profile, in bytes
pub const MAX_FIELD_WIDTH: usize = 4;

/// Wire format of one numeric field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldFormat {
    width: usize,
    signed: bool,
    divisor: u32,
}

impl FieldFormat {
    /// uint8
    pub const U8: Self = Self::unsigned(1, 1);
    /// uint16
    pub const U16: Self = Self::unsigned(2, 1);
    /// uint24
    pub const U24: Self = Self::unsigned(3, 1);
    /// uint32
    pub const U32: Self = Self::unsigned(4, 1);
    /// sint16
    pub const S16: Self = Self::signed(2, 1);

    /// Unsigned field of `width` bytes whose raw value is divided by `divisor`
    #[must_use]
    pub const fn unsigned(width: usize, divisor: u32) -> Self {
        Self {
            width,
            signed: false,
            divisor,
        }
    }

    /// Signed field of `width` bytes whose raw value is divided by `divisor`
    #[must_use]
    pub const fn signed(width: usize, divisor: u32) -> Self {
        Self {
            width,
            signed: true,
            divisor,
        }
    }

    /// Width in bytes
    #[must_use]
    pub const fn width(self) -> usize {
        self.width
    }

    /// Whether the raw value is two's complement
    #[must_use]
    pub const fn is_signed(self) -> bool {
        self.signed
    }

    /// Smallest step between two representable values
    #[must_use]
    pub fn resolution(self) -> f64 {
        1.0 / f64::from(self.divisor)
    }

    fn raw_bounds(self) -> (f64, f64) {
        let span = match self.width {
            1 => 256.0,
            2 => 65_536.0,
            3 => 16_777_216.0,
            _ => 4_294_967_296.0,
        };
        if self.signed {
            (-span / 2.0, span / 2.0 - 1.0)
        } else {
            (0.0, span - 1.0)
        }
    }

    /// Smallest value the field can carry after scaling
    #[must_use]
    pub fn min_value(self) -> f64 {
        self.raw_bounds().0 / f64::from(self.divisor)
    }

    /// Largest value the field can carry after scaling
    #[must_use]
    pub fn max_value(self) -> f64 {
        self.raw_bounds().1 / f64::from(self.divisor)
    }
}

impl fmt::Display for FieldFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.signed { 's' } else { 'u' };
        write!(f, "{kind}{}", self.width)?;
        if self.divisor != 1 {
            write!(f, "/{}", self.divisor)?;
        }
        Ok(())
    }
}

/// Check whether `bit` is set in a presence or feature mask
#[must_use]
pub const fn flag_set(flags: u32, bit: u8) -> bool {
    bit < 32 && flags & (1 << bit) != 0
}

fn check_width(width: usize) -> Result<()> {
    if width == 0 || width > MAX_FIELD_WIDTH {
        return Err(FtmsError::InvalidParameters(format!(
            "Field width {width} is not in 1..={MAX_FIELD_WIDTH}"
        )));
    }
    Ok(())
}

/// Cursor over a notification or read buffer
///
/// Every read advances the cursor by the field width. A read that would run
/// past the end fails with [`FtmsError::TruncatedBuffer`] and leaves the
/// cursor where it was.
#[derive(Debug, Clone)]
pub struct FieldReader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> FieldReader<'a> {
    /// Start reading at the beginning of `buf`
    #[must_use]
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    /// Bytes consumed so far
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// Bytes left to read
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    /// Whether the whole buffer has been consumed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.buf.has_remaining()
    }

    fn ensure(&self, width: usize) -> Result<()> {
        if self.buf.remaining() < width {
            return Err(FtmsError::TruncatedBuffer {
                offset: self.offset,
                needed: width,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    /// Read an unsigned little-endian integer of `width` bytes
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::TruncatedBuffer`] if fewer than `width` bytes remain,
    /// or [`FtmsError::InvalidParameters`] for a width outside 1..=4.
    pub fn decode_uint(&mut self, width: usize) -> Result<u32> {
        let raw = self.take_le(width)?;
        Ok(u32::from_le_bytes(raw))
    }

    /// Read a signed little-endian integer of `width` bytes
    ///
    /// # Errors
    ///
    /// Same conditions as [`FieldReader::decode_uint`].
    pub fn decode_sint(&mut self, width: usize) -> Result<i32> {
        let mut raw = self.take_le(width)?;
        if raw[width - 1] & 0x80 != 0 {
            raw[width..].fill(0xFF);
        }
        Ok(i32::from_le_bytes(raw))
    }

    fn take_le(&mut self, width: usize) -> Result<[u8; MAX_FIELD_WIDTH]> {
        check_width(width)?;
        self.ensure(width)?;
        let mut raw = [0u8; MAX_FIELD_WIDTH];
        self.buf.copy_to_slice(&mut raw[..width]);
        self.offset += width;
        Ok(raw)
    }

    /// Read a uint16
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::TruncatedBuffer`] if fewer than two bytes remain.
    pub fn decode_u16(&mut self) -> Result<u16> {
        self.ensure(2)?;
        self.offset += 2;
        Ok(self.buf.get_u16_le())
    }

    /// Read a sint16
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::TruncatedBuffer`] if fewer than two bytes remain.
    pub fn decode_i16(&mut self) -> Result<i16> {
        self.ensure(2)?;
        self.offset += 2;
        Ok(self.buf.get_i16_le())
    }

    /// Read a field and apply its resolution
    ///
    /// # Errors
    ///
    /// Same conditions as [`FieldReader::decode_uint`].
    pub fn decode_scaled(&mut self, format: FieldFormat) -> Result<f64> {
        let raw = if format.signed {
            f64::from(self.decode_sint(format.width)?)
        } else {
            f64::from(self.decode_uint(format.width)?)
        };
        Ok(raw / f64::from(format.divisor))
    }

    /// Read a single byte
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::TruncatedBuffer`] on an empty buffer.
    pub fn decode_u8(&mut self) -> Result<u8> {
        self.ensure(1)?;
        self.offset += 1;
        Ok(self.buf.get_u8())
    }

    /// Consume everything that is left
    pub fn rest(&mut self) -> &'a [u8] {
        let rest = self.buf;
        self.offset += rest.len();
        self.buf = &[];
        rest
    }
}

/// Builder for control point requests
#[derive(Debug, Default)]
pub struct FieldWriter {
    buf: BytesMut,
}

impl FieldWriter {
    /// Create an empty writer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a raw byte
    pub fn put_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    /// Append an unsigned little-endian integer of `width` bytes
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::ValueOutOfRange`] if `value` does not fit in `width`
    /// bytes. Values are never truncated.
    pub fn encode_uint(&mut self, value: u32, width: usize) -> Result<()> {
        self.encode_scaled(f64::from(value), FieldFormat::unsigned(width, 1))
    }

    /// Append a signed little-endian integer of `width` bytes
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::ValueOutOfRange`] if `value` does not fit.
    pub fn encode_sint(&mut self, value: i32, width: usize) -> Result<()> {
        self.encode_scaled(f64::from(value), FieldFormat::signed(width, 1))
    }

    /// Scale `value` by the field resolution and append it
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::ValueOutOfRange`] for non-finite values or values
    /// outside the field's range after rounding to the nearest step.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn encode_scaled(&mut self, value: f64, format: FieldFormat) -> Result<()> {
        check_width(format.width)?;

        let raw = (value * f64::from(format.divisor)).round();
        let (min, max) = format.raw_bounds();
        if !raw.is_finite() || raw < min || raw > max {
            return Err(FtmsError::ValueOutOfRange {
                value,
                field: format.to_string(),
            });
        }

        // raw is integral and within the field bounds here
        if format.signed {
            self.buf.put_int_le(raw as i64, format.width);
        } else {
            self.buf.put_uint_le(raw as u64, format.width);
        }
        Ok(())
    }

    /// Bytes written so far
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Finish and hand out the encoded bytes
    #[must_use]
    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_little_endian() {
        let data = [0xC4, 0x09, 0x10, 0x27, 0x00, 0xFF];
        let mut reader = FieldReader::new(&data);

        assert_eq!(reader.decode_uint(2).unwrap(), 2500);
        assert_eq!(reader.decode_uint(3).unwrap(), 10_000);
        assert_eq!(reader.offset(), 5);
        assert_eq!(reader.decode_sint(1).unwrap(), -1);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_decode_typed_and_sign_extension() {
        let data = [0x38, 0xFF, 0xC4, 0x09, 0xFE, 0xFF, 0xFF, 0xFF, 0x7F];
        let mut reader = FieldReader::new(&data);

        assert_eq!(reader.decode_i16().unwrap(), -200);
        assert_eq!(reader.decode_u16().unwrap(), 2500);
        assert_eq!(reader.decode_sint(3).unwrap(), -2);
        assert_eq!(reader.decode_sint(1).unwrap(), -1);
        assert_eq!(reader.decode_sint(1).unwrap(), 127);
        assert!(reader.decode_u16().is_err());
        assert_eq!(reader.offset(), 9);
    }

    #[test]
    fn test_decode_scaled() {
        let data = [0xC4, 0x09, 0xF6, 0xFF, 0x2D];
        let mut reader = FieldReader::new(&data);

        assert_eq!(
            reader.decode_scaled(FieldFormat::unsigned(2, 100)).unwrap(),
            25.0
        );
        assert_eq!(
            reader.decode_scaled(FieldFormat::signed(2, 10)).unwrap(),
            -1.0
        );
        assert_eq!(
            reader.decode_scaled(FieldFormat::unsigned(1, 2)).unwrap(),
            22.5
        );
    }

    #[test]
    fn test_truncated_read_keeps_cursor() {
        let data = [0x01, 0x02, 0x03];
        let mut reader = FieldReader::new(&data);
        reader.decode_uint(2).unwrap();

        let err = reader.decode_uint(2).unwrap_err();
        assert!(matches!(
            err,
            FtmsError::TruncatedBuffer {
                offset: 2,
                needed: 2,
                remaining: 1
            }
        ));
        assert_eq!(reader.offset(), 2);
        assert_eq!(reader.decode_u8().unwrap(), 0x03);
    }

    #[test]
    fn test_invalid_width() {
        let data = [0u8; 8];
        let mut reader = FieldReader::new(&data);
        assert!(reader.decode_uint(0).is_err());
        assert!(reader.decode_uint(5).is_err());
        assert_eq!(reader.offset(), 0);
    }

    #[test]
    fn test_scaled_round_trip_over_field_range() {
        let formats = [
            FieldFormat::unsigned(2, 100),
            FieldFormat::signed(2, 10),
            FieldFormat::unsigned(1, 2),
            FieldFormat::signed(2, 1000),
        ];

        for format in formats {
            let (min, max) = format.raw_bounds();
            let (min, max) = (min as i64, max as i64);
            for raw in (min..=max).step_by(97).chain([min, max]) {
                let value = raw as f64 / f64::from(format.divisor);

                let mut writer = FieldWriter::new();
                writer.encode_scaled(value, format).unwrap();
                let bytes = writer.freeze();
                assert_eq!(bytes.len(), format.width());

                let decoded = FieldReader::new(&bytes).decode_scaled(format).unwrap();
                assert_eq!(decoded, value, "round trip failed for {format} raw {raw}");
            }
        }
    }

    #[test]
    fn test_encode_decimal_literals() {
        let mut writer = FieldWriter::new();
        writer
            .encode_scaled(20.01, FieldFormat::unsigned(2, 100))
            .unwrap();
        writer.encode_scaled(-2.5, FieldFormat::signed(2, 10)).unwrap();
        assert_eq!(&writer.freeze()[..], &[0xD1, 0x07, 0xE7, 0xFF]);
    }

    #[test]
    fn test_encode_out_of_range_fails() {
        let mut writer = FieldWriter::new();
        assert!(writer.encode_uint(256, 1).is_err());
        assert!(writer.encode_uint(0x0100_0000, 3).is_err());
        assert!(writer.encode_sint(-32_769, 2).is_err());
        assert!(writer
            .encode_scaled(655.36, FieldFormat::unsigned(2, 100))
            .is_err());
        assert!(writer
            .encode_scaled(-0.01, FieldFormat::unsigned(2, 100))
            .is_err());
        assert!(writer
            .encode_scaled(f64::NAN, FieldFormat::unsigned(2, 100))
            .is_err());
        assert!(writer.is_empty());

        writer.encode_uint(0x00FF_FFFF, 3).unwrap();
        assert_eq!(writer.len(), 3);
    }

    #[test]
    fn test_flag_set() {
        assert!(flag_set(0b10, 1));
        assert!(!flag_set(0b10, 0));
        assert!(!flag_set(u32::MAX, 32));
    }

    #[test]
    fn test_format_display() {
        assert_eq!(FieldFormat::unsigned(2, 100).to_string(), "u2/100");
        assert_eq!(FieldFormat::S16.to_string(), "s2");
        assert_eq!(FieldFormat::U24.max_value(), 16_777_215.0);
        assert_eq!(FieldFormat::signed(2, 10).min_value(), -3276.8);
    }
}
