use std::collections::VecDeque;
use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, error, trace, warn};
use crate::config::AmConfig;
use crate::error::AmError;
use crate::pdu_header::{DataHeader, DataPdu};
use crate::segmentation::{next_segment, Unit, UnitQueue};
use crate::sn::Sn;
use crate::status_pdu::StatusPdu;


/// A sent PDU that was not yet acknowledged
struct RetxEntry {
    /// the header as originally sent, without poll bit
    header: DataHeader,
    payload: Bytes,
    /// number of times this PDU was scheduled for retransmission
    retx_count: u32,
}

impl RetxEntry {
    fn len(&self) -> usize {
        self.payload.len()
    }
}

/// a byte range `[so_start, so_end)` of a buffered PDU's data field that is waiting to be resent
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct RetxRequest {
    sn: Sn,
    so_start: usize,
    so_end: usize,
}

/// The result of applying a peer's STATUS PDU
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct StatusOutcome {
    /// the report covers the last poll, so t-PollRetransmit should be stopped
    pub poll_answered: bool,
    pub num_acked: usize,
    pub num_nacked: usize,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct TxBufferState {
    /// queued new data including estimated header overhead
    pub new_data_bytes: usize,
    /// pending retransmissions including estimated header overhead
    pub retx_bytes: usize,
}

/// The sender side of an AM entity: SN assignment, the retransmission buffer, polling and the
///  transmit window.
///
/// Terminology follows the usual state variables: `tx_ack` is the oldest SN not yet positively
///  acknowledged, `tx_next` the SN for the next new PDU, and no new SN is assigned once
///  `tx_next` reaches `tx_ack + window_size`.
pub struct TxWindow {
    window_size: u16,
    poll_pdu: Option<u32>,
    poll_byte: Option<usize>,
    max_retx_threshold: u32,
    max_unit_size: usize,

    tx_ack: Sn,
    tx_next: Sn,
    poll_sn: Sn,
    pdu_without_poll: u32,
    byte_without_poll: usize,
    poll_pending: bool,
    failed: bool,

    unit_queue: UnitQueue,
    retx_buffer: FxHashMap<Sn, RetxEntry>,
    retx_queue: VecDeque<RetxRequest>,
}

impl TxWindow {
    pub fn new(config: &AmConfig) -> TxWindow {
        TxWindow {
            window_size: config.window_size,
            poll_pdu: config.poll_pdu,
            poll_byte: config.poll_byte,
            max_retx_threshold: config.max_retx_threshold,
            max_unit_size: config.max_unit_size,
            tx_ack: Sn::ZERO,
            tx_next: Sn::ZERO,
            poll_sn: Sn::ZERO,
            pdu_without_poll: 0,
            byte_without_poll: 0,
            poll_pending: false,
            failed: false,
            unit_queue: UnitQueue::new(config.tx_queue_capacity),
            retx_buffer: FxHashMap::default(),
            retx_queue: VecDeque::new(),
        }
    }

    pub fn tx_ack(&self) -> Sn {
        self.tx_ack
    }

    pub fn tx_next(&self) -> Sn {
        self.tx_next
    }

    pub fn num_outstanding(&self) -> u16 {
        self.tx_next - self.tx_ack
    }

    pub fn is_stalled(&self) -> bool {
        self.num_outstanding() >= self.window_size
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn has_pending_retransmission(&self) -> bool {
        !self.retx_queue.is_empty()
    }

    pub fn has_new_data(&self) -> bool {
        !self.unit_queue.is_empty()
    }

    pub fn submit(&mut self, unit: Unit) -> Result<(), AmError> {
        if unit.data.is_empty() {
            return Err(AmError::UnitRejected("empty unit".to_string()));
        }
        if unit.data.len() > self.max_unit_size {
            return Err(AmError::UnitRejected(format!("unit of {} bytes exceeds the maximum of {} bytes", unit.data.len(), self.max_unit_size)));
        }
        trace!("queueing unit #{} with {} bytes", unit.id, unit.data.len());
        self.unit_queue.push(unit)
    }

    /// Builds a PDU with the next SN from queued units
    pub fn build_pdu(&mut self, max_size: usize) -> Result<DataPdu, AmError> {
        if self.failed {
            return Err(AmError::Halted);
        }
        if self.unit_queue.is_empty() {
            return Err(AmError::NothingToSend);
        }
        if self.is_stalled() {
            debug!("transmit window stalled at {}..{}", self.tx_ack, self.tx_next);
            return Err(AmError::WindowStall);
        }

        let Some((fi, li, payload)) = self.unit_queue.take_payload(max_size) else {
            return Err(AmError::NothingToSend);
        };

        let sn = self.tx_next;
        let mut header = DataHeader::new(sn, fi, li);
        self.retx_buffer.insert(sn, RetxEntry {
            header: header.clone(),
            payload: payload.clone(),
            retx_count: 0,
        });
        self.tx_next = sn.next();

        self.pdu_without_poll += 1;
        self.byte_without_poll += payload.len();
        header.poll = self.decide_poll();

        trace!("built {:?} with {} bytes", header, payload.len());
        Ok(DataPdu { header, payload })
    }

    fn decide_poll(&mut self) -> bool {
        let poll = self.poll_pending
            || self.poll_pdu.is_some_and(|n| self.pdu_without_poll >= n)
            || self.poll_byte.is_some_and(|n| self.byte_without_poll >= n)
            || (self.unit_queue.is_empty() && self.retx_queue.is_empty())
            || self.is_stalled();

        if poll {
            self.pdu_without_poll = 0;
            self.byte_without_poll = 0;
            self.poll_pending = false;
            self.poll_sn = self.tx_next.prev();
        }
        poll
    }

    /// Resends (part of) the oldest PDU that is waiting for retransmission, as an AMD PDU segment
    ///  if the original does not fit into `max_size`
    pub fn next_retransmission(&mut self, max_size: usize) -> Result<DataPdu, AmError> {
        if self.failed {
            return Err(AmError::Halted);
        }

        let (request, entry) = loop {
            let Some(&request) = self.retx_queue.front() else {
                return Err(AmError::NothingToSend);
            };
            match self.retx_buffer.get(&request.sn) {
                Some(entry) => break (request, entry),
                None => {
                    self.retx_queue.pop_front();
                }
            }
        };

        let whole = request.so_start == 0
            && request.so_end == entry.len()
            && entry.header.serialized_len() + entry.len() <= max_size;

        let mut pdu = if whole {
            self.retx_queue.pop_front();
            DataPdu { header: entry.header.clone(), payload: entry.payload.clone() }
        }
        else {
            let Some(segment) = next_segment(&entry.header, &entry.payload, request.so_start, request.so_end, max_size) else {
                return Err(AmError::NothingToSend);
            };
            let segment_end = request.so_start + segment.payload.len();
            if segment_end == request.so_end {
                self.retx_queue.pop_front();
            }
            else if let Some(front) = self.retx_queue.front_mut() {
                front.so_start = segment_end;
            }
            segment
        };

        pdu.header.poll = self.decide_poll();
        trace!("retransmitting {:?} with {} bytes", pdu.header, pdu.payload.len());
        Ok(pdu)
    }

    /// Schedules a byte range of a buffered PDU for retransmission, merging with a pending request
    ///  for the same SN.
    fn schedule_retransmission(&mut self, sn: Sn, so_start: usize, so_end: usize) -> Result<(), AmError> {
        if let Some(pending) = self.retx_queue.iter_mut().find(|r| r.sn == sn) {
            pending.so_start = pending.so_start.min(so_start);
            pending.so_end = pending.so_end.max(so_end);
            return Ok(());
        }

        let Some(entry) = self.retx_buffer.get_mut(&sn) else {
            return Ok(());
        };
        entry.retx_count += 1;
        if entry.retx_count > self.max_retx_threshold {
            error!("PDU {} exceeded the maximum number of retransmissions ({}) - halting", sn, self.max_retx_threshold);
            self.failed = true;
            return Err(AmError::MaxRetransmissionsExceeded { sn });
        }

        debug!("scheduling retransmission #{} of PDU {}, bytes {}..{}", entry.retx_count, sn, so_start, so_end);
        self.retx_queue.push_back(RetxRequest { sn, so_start, so_end });
        Ok(())
    }

    /// true if `sn` lies within one window before `tx_ack`, i.e. it was acknowledged already
    fn is_behind_window(&self, sn: Sn) -> bool {
        let distance = self.tx_ack - sn;
        distance > 0 && distance <= self.window_size
    }

    /// Returns `Ok(false)` for an outdated report, i.e. one overtaken by a report that moved
    ///  `tx_ack` past its ACK_SN.
    fn validate_status(&self, status: &StatusPdu) -> Result<bool, AmError> {
        let ack_offset = status.ack_sn - self.tx_ack;
        if ack_offset > self.num_outstanding() {
            if self.is_behind_window(status.ack_sn) {
                return Ok(false);
            }
            return Err(AmError::ProtocolAnomaly(format!("ACK_SN {} outside of {}..={}", status.ack_sn, self.tx_ack, self.tx_next)));
        }
        for nack in &status.nacks {
            // NACKs for SNs before tx_ack come from outdated reports and are ignored later
            if nack.sn - self.tx_ack >= ack_offset && !self.is_behind_window(nack.sn) {
                return Err(AmError::ProtocolAnomaly(format!("NACK_SN {} not before ACK_SN {}", nack.sn, status.ack_sn)));
            }
            if let Some(so) = nack.so {
                if so.start > so.end {
                    return Err(AmError::ProtocolAnomaly(format!("NACK for {} with inverted range {}..{}", nack.sn, so.start, so.end)));
                }
            }
        }
        Ok(true)
    }

    /// Applies a peer's STATUS PDU. A report that is inconsistent with the local window is
    ///  rejected as a whole, leaving the window untouched.
    pub fn on_status(&mut self, status: &StatusPdu) -> Result<StatusOutcome, AmError> {
        if self.failed {
            return Err(AmError::Halted);
        }
        if !self.validate_status(status)? {
            debug!("ignoring outdated status report with ACK_SN {} before {}", status.ack_sn, self.tx_ack);
            return Ok(StatusOutcome::default());
        }

        let mut outcome = StatusOutcome {
            poll_answered: self.poll_sn - self.tx_ack < status.ack_sn - self.tx_ack,
            ..StatusOutcome::default()
        };

        let nacked = status.nacks.iter().map(|n| n.sn).collect::<FxHashSet<_>>();

        for sn in self.tx_ack.to(status.ack_sn) {
            if nacked.contains(&sn) {
                continue;
            }
            if self.retx_buffer.remove(&sn).is_some() {
                outcome.num_acked += 1;
            }
        }
        self.retx_queue.retain(|r| self.retx_buffer.contains_key(&r.sn));

        for nack in &status.nacks {
            let Some(len) = self.retx_buffer.get(&nack.sn).map(RetxEntry::len) else {
                debug!("NACK for {} which is no longer buffered - ignoring", nack.sn);
                continue;
            };
            let (so_start, so_end) = match nack.so {
                Some(so) => so.to_byte_range(len),
                None => (0, len),
            };
            if so_start >= so_end {
                warn!("NACK for {} with range {:?} outside of the PDU's {} bytes - ignoring", nack.sn, nack.so, len);
                continue;
            }
            self.schedule_retransmission(nack.sn, so_start, so_end)?;
            outcome.num_nacked += 1;
        }

        let new_tx_ack = self.tx_ack.to(status.ack_sn)
            .find(|sn| self.retx_buffer.contains_key(sn))
            .unwrap_or(status.ack_sn);
        if new_tx_ack != self.tx_ack {
            debug!("transmit window advanced from {} to {}", self.tx_ack, new_tx_ack);
            self.tx_ack = new_tx_ack;
        }

        trace!("applied status {:?}: {:?}", status, outcome);
        Ok(outcome)
    }

    /// t-PollRetransmit expired: make sure the next PDU carries a poll, queueing the most recent
    ///  outstanding PDU for retransmission if there is nothing else to carry it
    pub fn on_poll_retransmit_timeout(&mut self) -> Result<(), AmError> {
        if self.failed {
            return Err(AmError::Halted);
        }
        self.poll_pending = true;

        let nothing_else_to_send = self.unit_queue.is_empty() || self.is_stalled();
        if self.retx_queue.is_empty() && nothing_else_to_send {
            let highest_outstanding = (0..self.num_outstanding())
                .map(|i| self.tx_next.prev() + (Sn::MODULUS - i))
                .find(|sn| self.retx_buffer.contains_key(sn));

            if let Some(sn) = highest_outstanding {
                debug!("poll retransmit timer expired - retransmitting PDU {} to carry the poll", sn);
                let len = self.retx_buffer.get(&sn).map(RetxEntry::len).unwrap_or_default();
                self.schedule_retransmission(sn, 0, len)?;
            }
        }
        Ok(())
    }

    pub fn buffer_state(&self) -> TxBufferState {
        let retx_bytes = self.retx_queue.iter()
            .filter_map(|r| self.retx_buffer.get(&r.sn).map(|e| (r, e)))
            .map(|(r, e)| {
                let header_len = if r.so_start == 0 && r.so_end == e.len() {
                    e.header.serialized_len()
                }
                else {
                    DataHeader::serialized_len_for(e.header.li.len(), true)
                };
                header_len + r.so_end - r.so_start
            })
            .sum();

        TxBufferState {
            new_data_bytes: self.unit_queue.estimated_pdu_bytes(),
            retx_bytes,
        }
    }

    /// back to the initial state, discarding all queued and buffered data
    pub fn reset(&mut self) {
        self.tx_ack = Sn::ZERO;
        self.tx_next = Sn::ZERO;
        self.poll_sn = Sn::ZERO;
        self.pdu_without_poll = 0;
        self.byte_without_poll = 0;
        self.poll_pending = false;
        self.failed = false;
        self.unit_queue.clear();
        self.retx_buffer.clear();
        self.retx_queue.clear();
    }
}
