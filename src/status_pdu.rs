use bytes::{BufMut, BytesMut};
use crate::bits::{BitReader, BitWriter};
use crate::error::AmError;
use crate::safe_converter::PrecheckedCast;
use crate::sn::Sn;

/// A byte range of an AMD PDU's data field that is reported missing. `end` is inclusive;
///  [SoRange::END_OF_PDU] as `end` means 'up to the end of the PDU'.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SoRange {
    pub start: u16,
    pub end: u16,
}

impl SoRange {
    pub const END_OF_PDU: u16 = 0x7FFF;

    /// converts to a half-open byte range, given the length of the PDU's data field
    pub fn to_byte_range(&self, payload_len: usize) -> (usize, usize) {
        let end = if self.end == Self::END_OF_PDU {
            payload_len
        }
        else {
            (self.end as usize + 1).min(payload_len)
        };
        (self.start as usize, end)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct NackEntry {
    pub sn: Sn,
    /// `None` if the entire PDU is missing
    pub so: Option<SoRange>,
}

impl NackEntry {
    pub fn full(sn: Sn) -> NackEntry {
        NackEntry { sn, so: None }
    }

    pub fn partial(sn: Sn, start: u16, end: u16) -> NackEntry {
        NackEntry { sn, so: Some(SoRange { start, end }) }
    }

    fn serialized_bits(&self) -> usize {
        StatusPdu::NACK_BITS + if self.so.is_some() { StatusPdu::SO_RANGE_BITS } else { 0 }
    }
}

/// The STATUS PDU, the only control PDU type of the AM entity.
///
/// ```ascii
/// D/C(1)=0  CPT(3)=000  ACK_SN(10)  E1(1)
/// repeated while E1=1:
///     NACK_SN(10)  E1(1)  E2(1)  [SOstart(15)  SOend(15)  if E2=1]
/// zero padding to a byte boundary
/// ```
///
/// All SNs before `ack_sn` are positively acknowledged except those listed in `nacks`.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct StatusPdu {
    pub ack_sn: Sn,
    pub nacks: Vec<NackEntry>,
}

impl StatusPdu {
    const CPT_STATUS: u32 = 0;
    const SO_BITS: u32 = 15;

    const FIXED_BITS: usize = 1 + 3 + 10 + 1;
    const NACK_BITS: usize = 10 + 1 + 1;
    const SO_RANGE_BITS: usize = 2 * 15;

    /// the smallest possible STATUS PDU: no NACKs
    pub const MIN_LEN: usize = Self::FIXED_BITS.div_ceil(8);

    pub fn serialized_len_for_bits(num_bits: usize) -> usize {
        num_bits.div_ceil(8)
    }

    pub fn serialized_bits(&self) -> usize {
        Self::FIXED_BITS + self.nacks.iter().map(NackEntry::serialized_bits).sum::<usize>()
    }

    pub fn serialized_len(&self) -> usize {
        Self::serialized_len_for_bits(self.serialized_bits())
    }

    /// the encoded length after appending `nack`
    pub fn serialized_len_with(&self, nack: &NackEntry) -> usize {
        Self::serialized_len_for_bits(self.serialized_bits() + nack.serialized_bits())
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        let mut w = BitWriter::with_capacity(self.serialized_len());

        w.put_bit(false); // D/C: control
        w.put_bits(Self::CPT_STATUS, 3);
        w.put_bits(self.ack_sn.to_raw() as u32, Sn::BITS);
        w.put_bit(!self.nacks.is_empty());

        for (i, nack) in self.nacks.iter().enumerate() {
            w.put_bits(nack.sn.to_raw() as u32, Sn::BITS);
            w.put_bit(i + 1 < self.nacks.len());
            w.put_bit(nack.so.is_some());
            if let Some(so) = nack.so {
                w.put_bits(so.start as u32, Self::SO_BITS);
                w.put_bits(so.end as u32, Self::SO_BITS);
            }
        }

        buf.put(w.finish());
    }

    pub fn deser(buf: &[u8]) -> Result<StatusPdu, AmError> {
        let mut r = BitReader::new(buf);

        if r.get_bit()? {
            return Err(AmError::MalformedHeader("not a control PDU"));
        }
        if r.get_bits(3)? != Self::CPT_STATUS {
            return Err(AmError::MalformedHeader("unsupported control PDU type"));
        }
        let ack_sn = Sn::new(r.get_bits(Sn::BITS)?.prechecked_cast());

        let mut nacks = Vec::new();
        let mut extension = r.get_bit()?;
        while extension {
            let sn = Sn::new(r.get_bits(Sn::BITS)?.prechecked_cast());
            extension = r.get_bit()?;
            let has_so = r.get_bit()?;
            let so = if has_so {
                let start = r.get_bits(Self::SO_BITS)?.prechecked_cast();
                let end = r.get_bits(Self::SO_BITS)?.prechecked_cast();
                Some(SoRange { start, end })
            }
            else {
                None
            };
            nacks.push(NackEntry { sn, so });
        }

        if r.align() != 0 {
            return Err(AmError::MalformedHeader("nonzero padding in status PDU"));
        }

        Ok(StatusPdu { ack_sn, nacks })
    }
}
