use std::fmt::Debug;
use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};
use crate::bits::{BitReader, BitWriter};
use crate::error::AmError;
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::sn::Sn;
use crate::status_pdu::StatusPdu;

bitflags! {
    /// The two-bit FI field, describing whether the ends of a PDU's data field coincide with
    ///  unit boundaries
    #[derive(Debug, Default, PartialEq, Eq, Copy, Clone)]
    pub struct FramingInfo: u8 {
        /// the first byte of the data field is *not* the first byte of a unit
        const CONTINUES_PREVIOUS = 0b10;
        /// the last byte of the data field is *not* the last byte of a unit
        const CONTINUES_NEXT     = 0b01;
    }
}

impl FramingInfo {
    pub fn starts_unit(&self) -> bool {
        !self.contains(FramingInfo::CONTINUES_PREVIOUS)
    }

    pub fn ends_unit(&self) -> bool {
        !self.contains(FramingInfo::CONTINUES_NEXT)
    }
}

/// Present iff the PDU is an AMD PDU segment (RF=1), i.e. a fragment of a previously built PDU
///  that is retransmitted in a smaller grant.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SegmentInfo {
    pub last_segment: bool,
    /// byte offset of the segment's data field inside the original PDU's data field
    pub offset: u16,
}

#[derive(Clone, PartialEq, Eq)]
pub struct DataHeader {
    pub poll: bool,
    pub fi: FramingInfo,
    pub sn: Sn,
    /// one entry per data field element except the last, each the element's length in bytes
    pub li: Vec<u16>,
    pub segment: Option<SegmentInfo>,
}

impl Debug for DataHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let segment = self.segment
            .map(|s| format!("@{}{}", s.offset, if s.last_segment { "L" } else { "" }))
            .unwrap_or_default();

        write!(f, "AMD{{{}{}:{:02b}{}{:?}}}",
               self.sn,
               segment,
               self.fi.bits(),
               if self.poll { ":P" } else { "" },
               self.li,
        )
    }
}

impl DataHeader {
    pub const FIXED_LEN: usize = 2;
    pub const SEGMENT_INFO_LEN: usize = 2;
    pub const MAX_LI: usize = 0x7FF;
    pub const MAX_SO: usize = 0x7FFF;
    /// the largest data field whose every byte can be addressed by a segment offset
    pub const MAX_DATA_FIELD: usize = Self::MAX_SO + 1;

    const LI_BITS: u32 = 11;
    const SO_BITS: u32 = 15;

    pub fn new(sn: Sn, fi: FramingInfo, li: Vec<u16>) -> DataHeader {
        DataHeader {
            poll: false,
            fi,
            sn,
            li,
            segment: None,
        }
    }

    pub fn is_segment(&self) -> bool {
        self.segment.is_some()
    }

    /// number of bytes needed for `num_li` length indicators: 12 bits each, padded to a full byte
    pub fn li_len(num_li: usize) -> usize {
        (3 * num_li + 1) / 2
    }

    pub fn serialized_len_for(num_li: usize, is_segment: bool) -> usize {
        Self::FIXED_LEN
            + if is_segment { Self::SEGMENT_INFO_LEN } else { 0 }
            + Self::li_len(num_li)
    }

    pub fn serialized_len(&self) -> usize {
        Self::serialized_len_for(self.li.len(), self.is_segment())
    }

    /// the sum of all LI entries, i.e. the offset where the data field's last element starts
    pub fn li_sum(&self) -> usize {
        self.li.iter().map(|&li| <u16 as SafeCast<usize>>::safe_cast(li)).sum()
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        let mut w = BitWriter::with_capacity(self.serialized_len());

        w.put_bit(true); // D/C: data
        w.put_bit(self.is_segment());
        w.put_bit(self.poll);
        w.put_bits(self.fi.bits() as u32, 2);
        w.put_bit(!self.li.is_empty());
        w.put_bits(self.sn.to_raw() as u32, Sn::BITS);

        if let Some(segment) = self.segment {
            w.put_bit(segment.last_segment);
            w.put_bits(segment.offset as u32, Self::SO_BITS);
        }

        for (i, &li) in self.li.iter().enumerate() {
            debug_assert!(li > 0 && li as usize <= Self::MAX_LI, "LI {} out of range", li);
            w.put_bit(i + 1 < self.li.len());
            w.put_bits(li as u32, Self::LI_BITS);
        }

        buf.put(w.finish());
    }

    /// Parses a data PDU header, returning it together with the offset of the data field.
    ///
    /// NB: This checks the header's internal structure only - LI values are checked against the
    ///      actual data field in [DataPdu::decode]
    pub fn deser(buf: &[u8]) -> Result<(DataHeader, usize), AmError> {
        let mut r = BitReader::new(buf);

        if !r.get_bit()? {
            return Err(AmError::MalformedHeader("not a data PDU"));
        }
        let is_segment = r.get_bit()?;
        let poll = r.get_bit()?;
        let fi = FramingInfo::from_bits_truncate(r.get_bits(2)?.prechecked_cast());
        let mut extension = r.get_bit()?;
        let sn = Sn::new(r.get_bits(Sn::BITS)?.prechecked_cast());

        let segment = if is_segment {
            let last_segment = r.get_bit()?;
            let offset = r.get_bits(Self::SO_BITS)?.prechecked_cast();
            Some(SegmentInfo { last_segment, offset })
        }
        else {
            None
        };

        let mut li = Vec::new();
        while extension {
            extension = r.get_bit()?;
            let value: u16 = r.get_bits(Self::LI_BITS)?.prechecked_cast();
            if value == 0 {
                return Err(AmError::MalformedHeader("length indicator is zero"));
            }
            li.push(value);
        }

        if r.align() != 0 {
            return Err(AmError::MalformedHeader("nonzero padding after length indicators"));
        }

        Ok((DataHeader { poll, fi, sn, li, segment }, r.byte_pos()))
    }
}


/// A data PDU (or AMD PDU segment) with its data field
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct DataPdu {
    pub header: DataHeader,
    pub payload: Bytes,
}

impl DataPdu {
    pub fn serialized_len(&self) -> usize {
        self.header.serialized_len() + self.payload.len()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.serialized_len());
        self.header.ser(&mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(buf: Bytes) -> Result<DataPdu, AmError> {
        let (header, payload_offset) = DataHeader::deser(&buf)?;
        let payload = buf.slice(payload_offset..);

        if payload.is_empty() {
            return Err(AmError::MalformedHeader("data PDU without data field"));
        }
        if header.li_sum() >= payload.len() {
            return Err(AmError::MalformedHeader("length indicators exceed the data field"));
        }
        if let Some(segment) = header.segment {
            if segment.offset as usize + payload.len() > DataHeader::MAX_DATA_FIELD {
                return Err(AmError::MalformedHeader("segment extends past the maximum segment offset"));
            }
        }

        Ok(DataPdu { header, payload })
    }

    /// the data field split into its elements, as delimited by the LI entries
    pub fn elements(&self) -> Vec<Bytes> {
        let mut result = Vec::with_capacity(self.header.li.len() + 1);
        let mut offs = 0;
        for &li in &self.header.li {
            let len: usize = li.safe_cast();
            result.push(self.payload.slice(offs..offs + len));
            offs += len;
        }
        result.push(self.payload.slice(offs..));
        result
    }
}


/// Any PDU exchanged between peer AM entities, discriminated by the D/C bit
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Pdu {
    Data(DataPdu),
    Status(StatusPdu),
}

impl Pdu {
    pub fn decode(buf: Bytes) -> Result<Pdu, AmError> {
        match buf.first() {
            None => Err(AmError::MalformedHeader("empty PDU")),
            Some(&b) if b & 0x80 != 0 => Ok(Pdu::Data(DataPdu::decode(buf)?)),
            Some(_) => Ok(Pdu::Status(StatusPdu::deser(&buf)?)),
        }
    }

    pub fn encode(&self) -> Bytes {
        match self {
            Pdu::Data(pdu) => pdu.encode(),
            Pdu::Status(status) => {
                let mut buf = BytesMut::with_capacity(status.serialized_len());
                status.ser(&mut buf);
                buf.freeze()
            }
        }
    }
}
