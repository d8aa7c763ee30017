//! Splitting units into PDU data fields and back.
//!
//! On the transmit side, units wait in a [UnitQueue] until their bytes are pulled into PDUs. A
//!  PDU's data field is a sequence of *elements*, each a contiguous byte range of one unit; the
//!  LI list holds the length of each element but the last, and FI says whether the data field's
//!  ends coincide with unit boundaries.
//!
//! On the receive side, the [Reassembler] is fed complete PDUs in SN order and glues elements
//!  back together.

use std::collections::VecDeque;
use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};
use crate::error::AmError;
use crate::pdu_header::{DataHeader, DataPdu, FramingInfo, SegmentInfo};
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::sn::Sn;


/// An upper layer data unit, identified by a caller-assigned id
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Unit {
    pub id: u64,
    pub data: Bytes,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct UnitChunk {
    pub data: Bytes,
    pub is_first: bool,
    pub is_last: bool,
}

/// Lazily splits a unit into chunks of at most `max` bytes. Clones replay from the current
///  position.
#[derive(Clone, Debug)]
pub struct Segments {
    data: Bytes,
    offset: usize,
    max: usize,
}

pub fn segment(unit: &Unit, max_payload_size: usize) -> Segments {
    Segments {
        data: unit.data.clone(),
        offset: 0,
        max: max_payload_size,
    }
}

impl Segments {
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    /// the next chunk, limited to `limit` bytes instead of the configured maximum
    pub fn next_within(&mut self, limit: usize) -> Option<UnitChunk> {
        let len = limit.min(self.remaining());
        if len == 0 {
            return None;
        }

        let chunk = UnitChunk {
            data: self.data.slice(self.offset..self.offset + len),
            is_first: self.offset == 0,
            is_last: self.offset + len == self.data.len(),
        };
        self.offset += len;
        Some(chunk)
    }
}

impl Iterator for Segments {
    type Item = UnitChunk;

    fn next(&mut self) -> Option<UnitChunk> {
        self.next_within(self.max)
    }
}


struct PendingUnit {
    id: u64,
    segments: Segments,
}

/// Units submitted for transmission that were not yet (completely) placed into PDUs
pub struct UnitQueue {
    units: VecDeque<PendingUnit>,
    capacity: usize,
    queued_bytes: usize,
}

impl UnitQueue {
    pub fn new(capacity: usize) -> UnitQueue {
        UnitQueue {
            units: VecDeque::new(),
            capacity,
            queued_bytes: 0,
        }
    }

    pub fn push(&mut self, unit: Unit) -> Result<(), AmError> {
        if self.units.len() >= self.capacity {
            return Err(AmError::UnitRejected(format!("transmit queue is full ({} units)", self.capacity)));
        }
        self.queued_bytes += unit.data.len();
        self.units.push_back(PendingUnit {
            id: unit.id,
            segments: segment(&unit, unit.data.len()),
        });
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// unsent bytes, not counting headers
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// rough size of the PDUs needed to send everything that is queued, headers included
    pub fn estimated_pdu_bytes(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        self.queued_bytes + DataHeader::serialized_len_for(self.units.len() - 1, false)
    }

    pub fn clear(&mut self) {
        self.units.clear();
        self.queued_bytes = 0;
    }

    /// Greedily fills a data field for a PDU of at most `max_pdu_size` bytes, returning the
    ///  data field together with the matching FI and LI values.
    ///
    /// A new element is only started if the previous one can be described by an LI, and if the
    ///  data field including the additional LI still has room for at least one byte. The data
    ///  field never exceeds [DataHeader::MAX_DATA_FIELD] so that it can be resegmented later.
    pub fn take_payload(&mut self, max_pdu_size: usize) -> Option<(FramingInfo, Vec<u16>, Bytes)> {
        let mut payload = BytesMut::new();
        let mut li = Vec::new();
        let mut fi = FramingInfo::empty();
        let mut prev_len = 0usize;
        let mut ends_unit = true;

        while let Some(front) = self.units.front_mut() {
            let num_li = if payload.is_empty() { 0 } else { li.len() + 1 };
            if num_li > 0 && prev_len > DataHeader::MAX_LI {
                break;
            }

            let used = DataHeader::serialized_len_for(num_li, false) + payload.len();
            let room = max_pdu_size.saturating_sub(used)
                .min(DataHeader::MAX_DATA_FIELD - payload.len());

            let Some(chunk) = front.segments.next_within(room) else {
                break;
            };
            trace!("placing {} bytes of unit #{} into PDU", chunk.data.len(), front.id);

            if payload.is_empty() {
                if !chunk.is_first {
                    fi |= FramingInfo::CONTINUES_PREVIOUS;
                }
            }
            else {
                li.push(prev_len.prechecked_cast());
            }

            prev_len = chunk.data.len();
            self.queued_bytes -= prev_len;
            payload.extend_from_slice(&chunk.data);
            ends_unit = chunk.is_last;

            if chunk.is_last {
                self.units.pop_front();
            }
            else {
                break;
            }
        }

        if payload.is_empty() {
            return None;
        }
        if !ends_unit {
            fi |= FramingInfo::CONTINUES_NEXT;
        }
        Some((fi, li, payload.freeze()))
    }
}


/// Rebuilds units from the data fields of complete PDUs, which must be fed in SN order.
#[derive(Default)]
pub struct Reassembler {
    partial: Option<BytesMut>,
    num_discarded: u64,
}

impl Reassembler {
    pub fn new() -> Reassembler {
        Reassembler::default()
    }

    /// number of elements that were dropped because they did not fit into a consistent unit
    pub fn num_discarded(&self) -> u64 {
        self.num_discarded
    }

    pub fn has_partial(&self) -> bool {
        self.partial.is_some()
    }

    pub fn reset(&mut self) {
        self.partial = None;
    }

    pub fn reassemble(&mut self, sn: Sn, payload: &Bytes, fi: FramingInfo, li: &[u16]) -> Vec<Bytes> {
        let mut result = Vec::new();

        let mut offs = 0usize;
        let num_elements = li.len() + 1;
        for i in 0..num_elements {
            let end = match li.get(i) {
                Some(&len) => offs + <u16 as SafeCast<usize>>::safe_cast(len),
                None => payload.len(),
            };
            let element = &payload[offs..end];
            offs = end;

            let starts_unit = i > 0 || fi.starts_unit();
            let ends_unit = i + 1 < num_elements || fi.ends_unit();

            if starts_unit {
                if self.partial.take().is_some() {
                    warn!("PDU {}: new unit starts while the previous one is incomplete - dropping the incomplete unit", sn);
                    self.num_discarded += 1;
                }
                self.partial = Some(BytesMut::new());
            }

            let Some(partial) = self.partial.as_mut() else {
                debug!("PDU {}: dropping continuation of a unit whose start was lost", sn);
                self.num_discarded += 1;
                continue;
            };
            partial.extend_from_slice(element);

            if ends_unit {
                if let Some(unit) = self.partial.take() {
                    trace!("PDU {}: reassembled unit of {} bytes", sn, unit.len());
                    result.push(unit.freeze());
                }
            }
        }

        result
    }
}


/// Builds an AMD PDU segment for the byte range `[start, end)` of a previously sent PDU's data
///  field, shortening the range so the segment fits into `max_pdu_size`. Returns `None` if not
///  even a single data byte fits.
pub fn next_segment(original: &DataHeader, payload: &Bytes, start: usize, end: usize, max_pdu_size: usize) -> Option<DataPdu> {
    debug_assert!(!original.is_segment());
    debug_assert!(start < end && end <= payload.len());

    let boundaries = element_boundaries(&original.li);
    let inner = |s: usize, e: usize| boundaries.iter().copied().filter(move |&b| b > s && b < e);

    let header_len = |e: usize| DataHeader::serialized_len_for(inner(start, e).count(), true);
    let fits = |e: usize| header_len(e) + (e - start) <= max_pdu_size;

    if !fits(start + 1) {
        return None;
    }

    let limit = end;
    let mut end = end;
    while !fits(end) {
        end = start + max_pdu_size.saturating_sub(header_len(end)).max(1);
    }
    // shortening may have dropped LIs, leaving room for more data
    let grown = limit.min(start + max_pdu_size - header_len(end));
    if fits(grown) {
        end = end.max(grown);
    }

    let mut li = Vec::new();
    let mut prev = start;
    for b in inner(start, end) {
        li.push((b - prev).prechecked_cast());
        prev = b;
    }

    let mut fi = FramingInfo::empty();
    let starts_unit = if start == 0 { original.fi.starts_unit() } else { boundaries.contains(&start) };
    if !starts_unit {
        fi |= FramingInfo::CONTINUES_PREVIOUS;
    }
    let ends_unit = if end == payload.len() { original.fi.ends_unit() } else { boundaries.contains(&end) };
    if !ends_unit {
        fi |= FramingInfo::CONTINUES_NEXT;
    }

    Some(DataPdu {
        header: DataHeader {
            poll: false,
            fi,
            sn: original.sn,
            li,
            segment: Some(SegmentInfo {
                last_segment: end == payload.len(),
                offset: start.prechecked_cast(),
            }),
        },
        payload: payload.slice(start..end),
    })
}

/// absolute offsets inside the data field where one element ends and the next one starts
pub fn element_boundaries(li: &[u16]) -> Vec<usize> {
    let mut result = Vec::with_capacity(li.len());
    let mut offs = 0usize;
    for &len in li {
        let len: usize = len.safe_cast();
        offs += len;
        result.push(offs);
    }
    result
}

/// Splits an entire previously sent PDU into AMD PDU segments of at most `max_pdu_size` bytes
pub fn resplit<'a>(original: &'a DataHeader, payload: &'a Bytes, max_pdu_size: usize) -> Resplit<'a> {
    Resplit {
        original,
        payload,
        offset: 0,
        max_pdu_size,
    }
}

pub struct Resplit<'a> {
    original: &'a DataHeader,
    payload: &'a Bytes,
    offset: usize,
    max_pdu_size: usize,
}

impl Iterator for Resplit<'_> {
    type Item = DataPdu;

    fn next(&mut self) -> Option<DataPdu> {
        if self.offset >= self.payload.len() {
            return None;
        }
        let segment = next_segment(self.original, self.payload, self.offset, self.payload.len(), self.max_pdu_size)?;
        self.offset += segment.payload.len();
        Some(segment)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn unit(id: u64, len: usize) -> Unit {
        Unit {
            id,
            data: (0..len).map(|i| (id as usize * 31 + i) as u8).collect::<Vec<_>>().into(),
        }
    }

    #[rstest]
    #[case::exact(10, 5, vec![(5, true, false), (5, false, true)])]
    #[case::remainder(11, 5, vec![(5, true, false), (5, false, false), (1, false, true)])]
    #[case::single(3, 5, vec![(3, true, true)])]
    #[case::zero_max(3, 0, vec![])]
    fn test_segment(#[case] len: usize, #[case] max: usize, #[case] expected: Vec<(usize, bool, bool)>) {
        let unit = unit(1, len);
        let segments = segment(&unit, max);

        let actual = segments.clone()
            .map(|c| (c.data.len(), c.is_first, c.is_last))
            .collect::<Vec<_>>();
        assert_eq!(actual, expected);

        let concatenated = segments.flat_map(|c| c.data.to_vec()).collect::<Vec<_>>();
        if max > 0 {
            assert_eq!(concatenated, unit.data.to_vec());
        }
    }

    #[test]
    fn test_unit_queue_capacity() {
        let mut queue = UnitQueue::new(2);
        queue.push(unit(1, 10)).unwrap();
        queue.push(unit(2, 20)).unwrap();
        assert!(matches!(queue.push(unit(3, 1)), Err(AmError::UnitRejected(_))));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.queued_bytes(), 30);
        assert_eq!(queue.estimated_pdu_bytes(), 30 + 4);

        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.queued_bytes(), 0);
        assert_eq!(queue.estimated_pdu_bytes(), 0);
    }

    #[rstest]
    #[case::one_unit_fits(vec![10], 20, vec![(0b00, vec![], 10)])]
    #[case::one_unit_exact(vec![10], 12, vec![(0b00, vec![], 10)])]
    #[case::one_unit_split(vec![10], 7, vec![(0b01, vec![], 5), (0b10, vec![], 5)])]
    #[case::one_unit_split_three(vec![10], 6, vec![(0b01, vec![], 4), (0b11, vec![], 4), (0b10, vec![], 2)])]
    #[case::two_units_one_pdu(vec![3, 4], 20, vec![(0b00, vec![3], 7)])]
    #[case::two_units_second_split(vec![3, 10], 10, vec![(0b01, vec![3], 6), (0b10, vec![], 7)])]
    #[case::no_room_after_li(vec![3, 10], 7, vec![(0b00, vec![], 3), (0b01, vec![], 5), (0b10, vec![], 5)])]
    #[case::three_units(vec![2, 2, 2], 100, vec![(0b00, vec![2, 2], 6)])]
    fn test_take_payload(#[case] unit_lens: Vec<usize>, #[case] max_pdu_size: usize, #[case] expected: Vec<(u8, Vec<u16>, usize)>) {
        let mut queue = UnitQueue::new(10);
        let mut all_bytes = Vec::new();
        for (i, len) in unit_lens.into_iter().enumerate() {
            let u = unit(i as u64, len);
            all_bytes.extend_from_slice(&u.data);
            queue.push(u).unwrap();
        }

        let mut actual = Vec::new();
        let mut sent_bytes = Vec::new();
        while let Some((fi, li, payload)) = queue.take_payload(max_pdu_size) {
            assert!(DataHeader::serialized_len_for(li.len(), false) + payload.len() <= max_pdu_size);
            sent_bytes.extend_from_slice(&payload);
            actual.push((fi.bits(), li, payload.len()));
        }

        assert_eq!(actual, expected);
        assert_eq!(sent_bytes, all_bytes);
        assert!(queue.is_empty());
        assert_eq!(queue.queued_bytes(), 0);
    }

    #[test]
    fn test_take_payload_long_element_ends_pdu() {
        let mut queue = UnitQueue::new(10);
        queue.push(unit(1, 3000)).unwrap();
        queue.push(unit(2, 10)).unwrap();

        // the first unit's 3000 bytes can not be described by an LI, so the second unit goes
        //  into the next PDU
        let (fi, li, payload) = queue.take_payload(5000).unwrap();
        assert_eq!(fi, FramingInfo::empty());
        assert!(li.is_empty());
        assert_eq!(payload.len(), 3000);

        let (_, _, payload) = queue.take_payload(5000).unwrap();
        assert_eq!(payload.len(), 10);
    }

    #[rstest]
    #[case::one_long_unit(vec![40_000], vec![DataHeader::MAX_DATA_FIELD, 40_000 - DataHeader::MAX_DATA_FIELD])]
    #[case::many_units(vec![2_000; 20], vec![DataHeader::MAX_DATA_FIELD, 40_000 - DataHeader::MAX_DATA_FIELD])]
    fn test_take_payload_limits_data_field(#[case] unit_lens: Vec<usize>, #[case] expected: Vec<usize>) {
        let mut queue = UnitQueue::new(100);
        for (id, len) in unit_lens.into_iter().enumerate() {
            queue.push(unit(id as u64, len)).unwrap();
        }

        let mut actual = Vec::new();
        while let Some((_, _, payload)) = queue.take_payload(100_000) {
            actual.push(payload.len());
        }
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_take_payload_no_room() {
        let mut queue = UnitQueue::new(10);
        queue.push(unit(1, 3)).unwrap();
        assert!(queue.take_payload(2).is_none());
        assert!(queue.take_payload(0).is_none());
        assert_eq!(queue.queued_bytes(), 3);
    }

    #[test]
    fn test_reassemble_across_pdus() {
        let units = vec![unit(1, 7), unit(2, 30), unit(3, 2)];
        let mut queue = UnitQueue::new(10);
        for u in &units {
            queue.push(u.clone()).unwrap();
        }

        let mut reassembler = Reassembler::new();
        let mut delivered = Vec::new();
        let mut sn = Sn::ZERO;
        while let Some((fi, li, payload)) = queue.take_payload(12) {
            delivered.extend(reassembler.reassemble(sn, &payload, fi, &li));
            sn = sn.next();
        }

        assert_eq!(delivered, units.into_iter().map(|u| u.data).collect::<Vec<_>>());
        assert!(!reassembler.has_partial());
        assert_eq!(reassembler.num_discarded(), 0);
    }

    #[rstest]
    #[case::orphan_continuation(vec![(0b10, vec![], vec![1, 2])], vec![], 1)]
    #[case::orphan_then_complete(vec![(0b10, vec![2], vec![1, 2, 3])], vec![vec![3]], 1)]
    #[case::start_replaces_partial(vec![(0b01, vec![], vec![1, 2]), (0b00, vec![], vec![3])], vec![vec![3]], 1)]
    #[case::middle_piece(vec![(0b01, vec![], vec![1]), (0b11, vec![], vec![2]), (0b10, vec![], vec![3])], vec![vec![1, 2, 3]], 0)]
    fn test_reassemble_inconsistent(#[case] pdus: Vec<(u8, Vec<u16>, Vec<u8>)>, #[case] expected: Vec<Vec<u8>>, #[case] expected_discarded: u64) {
        let mut reassembler = Reassembler::new();
        let mut delivered = Vec::new();
        for (i, (fi, li, payload)) in pdus.into_iter().enumerate() {
            delivered.extend(reassembler.reassemble(Sn::new(i as u16), &Bytes::from(payload), FramingInfo::from_bits_truncate(fi), &li));
        }
        assert_eq!(delivered.into_iter().map(|b| b.to_vec()).collect::<Vec<_>>(), expected);
        assert_eq!(reassembler.num_discarded(), expected_discarded);
    }

    fn original(fi: u8, li: Vec<u16>, len: usize) -> (DataHeader, Bytes) {
        let header = DataHeader::new(Sn::new(17), FramingInfo::from_bits_truncate(fi), li);
        let payload: Bytes = (0..len).map(|i| i as u8).collect::<Vec<_>>().into();
        (header, payload)
    }

    #[rstest]
    #[case::whole_fits(0b00, vec![], 10, 0, 10, 100, Some((0b00, vec![], 10, true)))]
    #[case::shortened(0b00, vec![], 10, 0, 10, 8, Some((0b01, vec![], 4, false)))]
    #[case::tail(0b00, vec![], 10, 4, 10, 100, Some((0b10, vec![], 6, true)))]
    #[case::keeps_original_fi(0b11, vec![], 10, 0, 10, 100, Some((0b11, vec![], 10, true)))]
    #[case::inner_boundary(0b00, vec![4], 10, 0, 10, 100, Some((0b00, vec![4], 10, true)))]
    #[case::starts_at_boundary(0b00, vec![4], 10, 4, 10, 100, Some((0b00, vec![], 6, true)))]
    #[case::ends_at_boundary(0b00, vec![4], 10, 0, 10, 8, Some((0b00, vec![], 4, false)))]
    #[case::drops_li_when_shortened(0b00, vec![2, 2], 10, 1, 10, 9, Some((0b10, vec![1], 3, false)))]
    #[case::no_data_fits(0b00, vec![], 10, 0, 10, 4, None)]
    fn test_next_segment(
        #[case] fi: u8, #[case] li: Vec<u16>, #[case] len: usize,
        #[case] start: usize, #[case] end: usize, #[case] max_pdu_size: usize,
        #[case] expected: Option<(u8, Vec<u16>, usize, bool)>,
    ) {
        let (header, payload) = original(fi, li, len);
        let segment = next_segment(&header, &payload, start, end, max_pdu_size);

        match (segment, expected) {
            (None, None) => {}
            (Some(segment), Some((fi, li, seg_len, lsf))) => {
                assert!(segment.serialized_len() <= max_pdu_size);
                assert_eq!(segment.header.sn, header.sn);
                assert_eq!(segment.header.fi.bits(), fi);
                assert_eq!(segment.header.li, li);
                assert_eq!(segment.payload.len(), seg_len);
                assert_eq!(segment.payload, payload.slice(start..start + seg_len));
                assert_eq!(segment.header.segment, Some(SegmentInfo { last_segment: lsf, offset: start as u16 }));
            }
            (actual, expected) => panic!("expected {:?}, got {:?}", expected, actual),
        }
    }

    #[test]
    fn test_resplit_covers_pdu() {
        let (header, payload) = original(0b10, vec![300, 200, 250], 1000);
        let segments = resplit(&header, &payload, 120).collect::<Vec<_>>();

        let mut offs = 0;
        for (i, segment) in segments.iter().enumerate() {
            assert!(segment.serialized_len() <= 120);
            let info = segment.header.segment.unwrap();
            assert_eq!(info.offset as usize, offs);
            assert_eq!(info.last_segment, i + 1 == segments.len());
            offs += segment.payload.len();
        }
        assert_eq!(offs, 1000);
        assert!(segments[0].header.fi.contains(FramingInfo::CONTINUES_PREVIOUS));

        let rejoined = segments.iter().flat_map(|s| s.payload.to_vec()).collect::<Vec<_>>();
        assert_eq!(rejoined, payload.to_vec());
    }

    #[test]
    fn test_resplit_too_small() {
        let (header, payload) = original(0b00, vec![], 10);
        assert_eq!(resplit(&header, &payload, 4).count(), 0);
    }

    #[test]
    fn test_element_boundaries() {
        assert_eq!(element_boundaries(&[]), Vec::<usize>::new());
        assert_eq!(element_boundaries(&[3, 4, 5]), vec![3, 7, 12]);
    }
}
