use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};
use crate::config::AmConfig;
use crate::error::AmError;
use crate::pdu_header::{DataHeader, DataPdu, FramingInfo};
use crate::safe_converter::PrecheckedCast;
use crate::segmentation::{element_boundaries, Reassembler};
use crate::sn::{Sn, SnWindow};
use crate::status_pdu::{NackEntry, SoRange};
use crate::timers::LogicalTimer;


enum RxEntry {
    Complete { header: DataHeader, payload: Bytes },
    /// AMD PDU segments received so far, keyed by segment offset
    Partial(BTreeMap<usize, DataPdu>),
}

/// The receiver side of an AM entity.
///
/// State variables:
/// * `rx_next` - the oldest SN that was not completely received; everything before it was
///   delivered to reassembly
/// * `rx_highest` - one past the highest SN received
/// * `rx_highest_status` - the highest SN that may be reported as ACK_SN: gaps before it were
///   missing for at least t-Reordering
/// * `rx_reorder_trigger` - `rx_highest` at the time t-Reordering was started
///
/// NB: The reordering timer is owned by the caller and passed in, so the entity can poll all
///      of its timers in one place.
pub struct RxWindow {
    window_size: u16,

    rx_next: Sn,
    rx_highest: Sn,
    rx_highest_status: Sn,
    rx_reorder_trigger: Option<Sn>,
    status_requested: bool,

    buffer: FxHashMap<Sn, RxEntry>,
    reassembler: Reassembler,
}

impl RxWindow {
    pub fn new(config: &AmConfig) -> RxWindow {
        RxWindow {
            window_size: config.window_size,
            rx_next: Sn::ZERO,
            rx_highest: Sn::ZERO,
            rx_highest_status: Sn::ZERO,
            rx_reorder_trigger: None,
            status_requested: false,
            buffer: FxHashMap::default(),
            reassembler: Reassembler::new(),
        }
    }

    pub fn rx_next(&self) -> Sn {
        self.rx_next
    }

    pub fn rx_highest(&self) -> Sn {
        self.rx_highest
    }

    pub fn rx_highest_status(&self) -> Sn {
        self.rx_highest_status
    }

    fn window(&self) -> SnWindow {
        SnWindow::new(self.rx_next, self.window_size)
    }

    pub fn num_buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn num_discarded_fragments(&self) -> u64 {
        self.reassembler.num_discarded()
    }

    pub fn status_requested(&self) -> bool {
        self.status_requested
    }

    pub fn request_status(&mut self) {
        self.status_requested = true;
    }

    pub fn clear_status_request(&mut self) {
        self.status_requested = false;
    }

    fn is_complete(&self, sn: Sn) -> bool {
        matches!(self.buffer.get(&sn), Some(RxEntry::Complete { .. }))
    }

    fn first_incomplete_from(&self, start: Sn) -> Sn {
        let mut sn = start;
        while sn != self.rx_highest && self.is_complete(sn) {
            sn = sn.next();
        }
        sn
    }

    /// Handles a received data PDU or AMD PDU segment, returning the units it completes.
    pub fn on_pdu(&mut self, pdu: DataPdu, reordering: &mut LogicalTimer, now: Instant) -> Result<Vec<Bytes>, AmError> {
        let sn = pdu.header.sn;
        if pdu.header.poll {
            trace!("PDU {} carries a poll", sn);
            self.status_requested = true;
        }

        let window = self.window();
        if !window.contains(sn) {
            // the most recent window_size SNs before the window are old news
            let duplicate = window.position(sn) >= -(self.window_size as i32);
            return Err(AmError::DuplicateOrOutOfWindow { sn, duplicate });
        }
        let offset = sn - self.rx_next;

        if !self.store(pdu) {
            return Err(AmError::DuplicateOrOutOfWindow { sn, duplicate: true });
        }

        if offset >= self.rx_highest - self.rx_next {
            self.rx_highest = sn.next();
        }

        let mut units = Vec::new();
        if self.is_complete(sn) {
            if sn == self.rx_highest_status {
                self.rx_highest_status = self.first_incomplete_from(sn.next());
            }
            if sn == self.rx_next {
                units = self.deliver_in_order();
            }
        }

        self.update_reordering(reordering, now);
        Ok(units)
    }

    /// returns false for a duplicate
    fn store(&mut self, pdu: DataPdu) -> bool {
        let sn = pdu.header.sn;

        let Some(segment) = pdu.header.segment else {
            if self.is_complete(sn) {
                return false;
            }
            self.buffer.insert(sn, RxEntry::Complete { header: pdu.header, payload: pdu.payload });
            return true;
        };

        let segments = match self.buffer.entry(sn).or_insert_with(|| RxEntry::Partial(BTreeMap::new())) {
            RxEntry::Complete { .. } => return false,
            RxEntry::Partial(segments) => segments,
        };

        let so = segment.offset as usize;
        if covers(segments, so, so + pdu.payload.len()) {
            return false;
        }
        let keep_existing = segments.get(&so)
            .is_some_and(|existing| existing.payload.len() >= pdu.payload.len());
        if !keep_existing {
            segments.insert(so, pdu);
        }

        if let Some((header, payload)) = merge_segments(segments) {
            debug!("PDU {} completed from {} segments", sn, segments.len());
            self.buffer.insert(sn, RxEntry::Complete { header, payload });
        }
        true
    }

    fn deliver_in_order(&mut self) -> Vec<Bytes> {
        let mut units = Vec::new();
        while self.is_complete(self.rx_next) {
            if let Some(RxEntry::Complete { header, payload }) = self.buffer.remove(&self.rx_next) {
                units.extend(self.reassembler.reassemble(header.sn, &payload, header.fi, &header.li));
            }
            self.rx_next = self.rx_next.next();
        }
        trace!("receive window now starts at {}", self.rx_next);
        units
    }

    fn update_reordering(&mut self, reordering: &mut LogicalTimer, now: Instant) {
        if reordering.is_running() {
            if let Some(trigger) = self.rx_reorder_trigger {
                let offset = trigger - self.rx_next;
                if offset == 0 || offset > self.window_size {
                    trace!("gap before {} closed - stopping t-Reordering", trigger);
                    reordering.cancel();
                    self.rx_reorder_trigger = None;
                }
            }
        }

        if !reordering.is_running() && self.rx_highest != self.rx_next {
            trace!("gap detected between {} and {} - starting t-Reordering", self.rx_next, self.rx_highest);
            reordering.arm(now);
            self.rx_reorder_trigger = Some(self.rx_highest);
        }
    }

    /// t-Reordering expired: all gaps before the trigger SN are reported as missing from now on
    pub fn on_reordering_timeout(&mut self, reordering: &mut LogicalTimer, now: Instant) {
        let Some(trigger) = self.rx_reorder_trigger.take() else {
            return;
        };

        self.rx_highest_status = self.first_incomplete_from(trigger);
        debug!("t-Reordering expired - reporting gaps up to {}", self.rx_highest_status);

        if self.rx_highest - self.rx_next > self.rx_highest_status - self.rx_next {
            reordering.arm(now);
            self.rx_reorder_trigger = Some(self.rx_highest);
        }
        self.status_requested = true;
    }

    /// NACK entries for everything missing before `rx_highest_status`, in SN order
    pub fn missing(&self) -> Vec<NackEntry> {
        let mut result = Vec::new();
        for sn in self.rx_next.to(self.rx_highest_status) {
            match self.buffer.get(&sn) {
                None => result.push(NackEntry::full(sn)),
                Some(RxEntry::Complete { .. }) => {}
                Some(RxEntry::Partial(segments)) => {
                    result.extend(missing_ranges(segments).into_iter()
                        .map(|(start, end)| NackEntry::partial(sn, start, end)));
                }
            }
        }
        result
    }

    pub fn reset(&mut self) {
        self.rx_next = Sn::ZERO;
        self.rx_highest = Sn::ZERO;
        self.rx_highest_status = Sn::ZERO;
        self.rx_reorder_trigger = None;
        self.status_requested = false;
        self.buffer.clear();
        self.reassembler.reset();
    }
}

/// true if the segments together contain all bytes in `[start, end)`
fn covers(segments: &BTreeMap<usize, DataPdu>, start: usize, end: usize) -> bool {
    let mut covered = start;
    for (&so, segment) in segments.range(..end) {
        if so > covered {
            return false;
        }
        covered = covered.max(so + segment.payload.len());
        if covered >= end {
            return true;
        }
    }
    false
}

/// the missing byte ranges as (SOstart, SOend) with inclusive end, the last one open-ended if no
///  last segment was received
fn missing_ranges(segments: &BTreeMap<usize, DataPdu>) -> Vec<(u16, u16)> {
    let mut result = Vec::new();
    let mut covered = 0usize;
    let mut has_last = false;
    for (&so, segment) in segments {
        if so > covered {
            result.push((covered.prechecked_cast(), (so - 1).prechecked_cast()));
        }
        covered = covered.max(so + segment.payload.len());
        has_last |= segment.header.segment.is_some_and(|s| s.last_segment);
    }
    if !has_last && covered <= DataHeader::MAX_SO {
        result.push((covered.prechecked_cast(), SoRange::END_OF_PDU));
    }
    result
}

/// Rebuilds the original PDU's header and data field if the segments cover it completely
fn merge_segments(segments: &BTreeMap<usize, DataPdu>) -> Option<(DataHeader, Bytes)> {
    let mut covered = 0usize;
    let mut total = None;
    for (&so, segment) in segments {
        if so > covered {
            return None;
        }
        covered = covered.max(so + segment.payload.len());
        if segment.header.segment.is_some_and(|s| s.last_segment) {
            total = Some(so + segment.payload.len());
            break;
        }
    }
    let total = total?;

    let mut payload = BytesMut::with_capacity(total);
    let mut boundaries = BTreeSet::new();
    let mut fi = FramingInfo::empty();

    for (&so, segment) in segments.range(..total) {
        let end = so + segment.payload.len();
        if end > payload.len() {
            payload.extend_from_slice(&segment.payload[payload.len() - so..]);
        }

        boundaries.extend(element_boundaries(&segment.header.li).into_iter().map(|b| so + b));
        if segment.header.fi.starts_unit() {
            boundaries.insert(so);
        }
        if segment.header.fi.ends_unit() {
            boundaries.insert(end);
        }

        if so == 0 && !segment.header.fi.starts_unit() {
            fi |= FramingInfo::CONTINUES_PREVIOUS;
        }
        if end == total && !segment.header.fi.ends_unit() {
            fi |= FramingInfo::CONTINUES_NEXT;
        }
    }

    let mut li = Vec::new();
    let mut prev = 0;
    for b in boundaries.into_iter().filter(|&b| b > 0 && b < total) {
        li.push((b - prev).prechecked_cast());
        prev = b;
    }

    let sn = segments.values().next()?.header.sn;
    Some((DataHeader::new(sn, fi, li), payload.freeze()))
}
