//! MSB-first bit packing for the header codecs. Fields are written in wire order, the first bit
//!  of a byte being its most significant bit.

use bytes::{BufMut, BytesMut};
use crate::error::AmError;

pub struct BitWriter {
    buf: BytesMut,
    num_bits: usize,
}

impl BitWriter {
    pub fn with_capacity(num_bytes: usize) -> BitWriter {
        BitWriter {
            buf: BytesMut::with_capacity(num_bytes),
            num_bits: 0,
        }
    }

    pub fn put_bit(&mut self, bit: bool) {
        if self.num_bits % 8 == 0 {
            self.buf.put_u8(0);
        }
        if bit {
            let last = self.buf.len() - 1;
            self.buf[last] |= 0x80 >> (self.num_bits % 8);
        }
        self.num_bits += 1;
    }

    /// write the `width` least significant bits of `value`, most significant first
    pub fn put_bits(&mut self, value: u32, width: u32) {
        debug_assert!(width <= 32);
        debug_assert!(width == 32 || value >> width == 0, "value {} does not fit into {} bits", value, width);

        for i in (0..width).rev() {
            self.put_bit((value >> i) & 1 != 0);
        }
    }

    /// pads with zero bits up to the next byte boundary
    pub fn finish(self) -> BytesMut {
        self.buf
    }
}


pub struct BitReader<'a> {
    buf: &'a [u8],
    bit_pos: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(buf: &'a [u8]) -> BitReader<'a> {
        BitReader {
            buf,
            bit_pos: 0,
        }
    }

    pub fn get_bit(&mut self) -> Result<bool, AmError> {
        if self.bit_pos >= self.buf.len() * 8 {
            return Err(AmError::MalformedHeader("header extends past the end of the PDU"));
        }
        let byte = self.buf[self.bit_pos / 8];
        let bit = byte & (0x80 >> (self.bit_pos % 8)) != 0;
        self.bit_pos += 1;
        Ok(bit)
    }

    pub fn get_bits(&mut self, width: u32) -> Result<u32, AmError> {
        let mut result = 0u32;
        for _ in 0..width {
            result = (result << 1) | self.get_bit()? as u32;
        }
        Ok(result)
    }

    /// skips to the next byte boundary, returning the value of the skipped padding bits
    pub fn align(&mut self) -> u32 {
        let mut padding = 0;
        while self.bit_pos % 8 != 0 {
            let bit = self.buf[self.bit_pos / 8] & (0x80 >> (self.bit_pos % 8)) != 0;
            padding = (padding << 1) | bit as u32;
            self.bit_pos += 1;
        }
        padding
    }

    /// the number of bytes consumed so far, counting a partially consumed byte as consumed
    pub fn byte_pos(&self) -> usize {
        self.bit_pos.div_ceil(8)
    }
}
