//! The AM entity: transmit window, receive window and timers of one bearer combined into a
//!  single state machine.
//!
//! An entity does no I/O and never looks at a clock. Its owner hands in received PDUs, asks for
//!  PDUs at every transmit opportunity and calls [AmEntity::on_tick] so timers can fire. All
//!  methods take `&mut self`, so serializing access is the owner's business (see
//!  [crate::bearer::AmBearer]).

use std::time::Instant;
use bytes::Bytes;
use tracing::{debug, error, trace, warn};
use crate::config::AmConfig;
use crate::error::AmError;
use crate::metrics::AmMetrics;
use crate::pdu_header::{DataPdu, Pdu};
use crate::segmentation::Unit;
use crate::sn::Sn;
use crate::status_pdu::StatusPdu;
use crate::status_report;
use crate::timers::{TimerId, TimerSet};
use crate::tx_window::TxWindow;
use crate::rx_window::RxWindow;


#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EntityState {
    Active,
    /// no new SN can be assigned until the peer acknowledges
    Stalled,
    /// maximum retransmissions exceeded; nothing is sent until [AmEntity::reestablish]
    Failed,
}

/// What the entity has to send, for a scheduler deciding on transmit opportunities
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct BufferState {
    pub new_data_bytes: usize,
    pub retx_bytes: usize,
    /// size of the STATUS PDU that is waiting to be sent, 0 if there is none
    pub status_bytes: usize,
}

impl BufferState {
    pub fn total(&self) -> usize {
        self.new_data_bytes + self.retx_bytes + self.status_bytes
    }
}

pub struct AmEntity {
    tx: TxWindow,
    rx: RxWindow,
    timers: TimerSet,
    metrics: AmMetrics,
}

impl AmEntity {
    pub fn new(config: &AmConfig) -> anyhow::Result<AmEntity> {
        config.validate()?;

        Ok(AmEntity {
            tx: TxWindow::new(config),
            rx: RxWindow::new(config),
            timers: TimerSet::new(config.t_poll_retransmit, config.t_reordering, config.t_status_prohibit),
            metrics: AmMetrics::default(),
        })
    }

    pub fn state(&self) -> EntityState {
        if self.tx.is_failed() {
            EntityState::Failed
        }
        else if self.tx.is_stalled() {
            EntityState::Stalled
        }
        else {
            EntityState::Active
        }
    }

    pub fn metrics(&self) -> AmMetrics {
        self.metrics.snapshot()
    }

    pub fn tx_window(&self) -> &TxWindow {
        &self.tx
    }

    pub fn rx_window(&self) -> &RxWindow {
        &self.rx
    }

    /// a STATUS PDU was requested and t-StatusProhibit does not hold it back
    pub fn status_pending(&self) -> bool {
        self.rx.status_requested() && !self.timers.status_prohibit.is_running()
    }

    pub fn buffer_state(&self) -> BufferState {
        let tx = self.tx.buffer_state();
        let status_bytes = if self.status_pending() {
            status_report::build(&self.rx, usize::MAX).serialized_len()
        }
        else {
            0
        };

        BufferState {
            new_data_bytes: tx.new_data_bytes,
            retx_bytes: tx.retx_bytes,
            status_bytes,
        }
    }

    pub fn next_timer_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub fn submit(&mut self, unit: Unit) -> Result<(), AmError> {
        if self.tx.is_failed() {
            return Err(AmError::Halted);
        }
        self.tx.submit(unit)?;
        self.metrics.units_submitted += 1;
        Ok(())
    }

    /// Fills a transmit opportunity of `max_size` bytes: a pending STATUS PDU goes first, then
    ///  retransmissions, then new data.
    pub fn pull_pdu(&mut self, max_size: usize, now: Instant) -> Result<Pdu, AmError> {
        if self.tx.is_failed() {
            return Err(AmError::Halted);
        }

        if self.status_pending() && max_size >= StatusPdu::MIN_LEN {
            return self.build_status(max_size, now).map(Pdu::Status);
        }

        if self.tx.has_pending_retransmission() {
            match self.next_retransmission(max_size, now) {
                Err(AmError::NothingToSend) => {}
                other => return other.map(Pdu::Data),
            }
        }

        self.build_pdu(max_size, now).map(Pdu::Data)
    }

    /// Builds a STATUS PDU regardless of t-StatusProhibit, and (re)starts it
    pub fn build_status(&mut self, max_size: usize, now: Instant) -> Result<StatusPdu, AmError> {
        if max_size < StatusPdu::MIN_LEN {
            return Err(AmError::NothingToSend);
        }

        let status = status_report::build(&self.rx, max_size);
        self.rx.clear_status_request();
        if !self.timers.status_prohibit.duration().is_zero() {
            self.timers.status_prohibit.arm(now);
        }

        self.metrics.status_pdus_sent += 1;
        trace!("sending status {:?}", status);
        Ok(status)
    }

    pub fn build_pdu(&mut self, max_size: usize, now: Instant) -> Result<DataPdu, AmError> {
        let pdu = self.tx.build_pdu(max_size)?;
        self.on_data_pdu_sent(&pdu, now);
        Ok(pdu)
    }

    pub fn next_retransmission(&mut self, max_size: usize, now: Instant) -> Result<DataPdu, AmError> {
        let pdu = self.tx.next_retransmission(max_size)?;
        self.metrics.retransmitted_pdus += 1;
        self.on_data_pdu_sent(&pdu, now);
        Ok(pdu)
    }

    fn on_data_pdu_sent(&mut self, pdu: &DataPdu, now: Instant) {
        self.metrics.data_pdus_sent += 1;
        self.metrics.data_bytes_sent += pdu.payload.len() as u64;
        if pdu.header.poll {
            trace!("PDU {} carries a poll - (re)starting t-PollRetransmit", pdu.header.sn);
            self.timers.poll_retransmit.arm(now);
        }
    }

    /// Handles a PDU received from the peer, returning the units it completes in order.
    ///
    /// PDUs that can not be used (malformed, duplicate, outside the window, contradictory status
    ///  reports) are logged, counted and otherwise ignored. The only error is the fatal
    ///  [AmError::MaxRetransmissionsExceeded], which is returned exactly once.
    pub fn on_received(&mut self, buf: Bytes, now: Instant) -> Result<Vec<Bytes>, AmError> {
        let pdu = match Pdu::decode(buf) {
            Ok(pdu) => pdu,
            Err(e) => {
                warn!("discarding PDU: {}", e);
                self.metrics.malformed += 1;
                return Ok(Vec::new());
            }
        };

        match pdu {
            Pdu::Data(pdu) => Ok(self.on_data_pdu(pdu, now)),
            Pdu::Status(status) => {
                self.on_status_pdu(&status)?;
                Ok(Vec::new())
            }
        }
    }

    fn on_data_pdu(&mut self, pdu: DataPdu, now: Instant) -> Vec<Bytes> {
        self.metrics.data_pdus_received += 1;
        self.metrics.data_bytes_received += pdu.payload.len() as u64;

        let discarded_before = self.rx.num_discarded_fragments();
        let units = match self.rx.on_pdu(pdu, &mut self.timers.reordering, now) {
            Ok(units) => units,
            Err(AmError::DuplicateOrOutOfWindow { sn, duplicate: true }) => {
                debug!("discarding duplicate PDU {}", sn);
                self.metrics.duplicates += 1;
                Vec::new()
            }
            Err(e) => {
                warn!("discarding PDU: {}", e);
                self.metrics.out_of_window += 1;
                Vec::new()
            }
        };
        self.metrics.dropped_fragments += self.rx.num_discarded_fragments() - discarded_before;
        self.metrics.units_delivered += units.len() as u64;
        units
    }

    fn on_status_pdu(&mut self, status: &StatusPdu) -> Result<(), AmError> {
        self.metrics.status_pdus_received += 1;

        let result = status_report::validate(status)
            .and_then(|_| self.tx.on_status(status));

        match result {
            Ok(outcome) => {
                if outcome.poll_answered {
                    trace!("status covers the last poll - stopping t-PollRetransmit");
                    self.timers.poll_retransmit.cancel();
                }
                Ok(())
            }
            Err(AmError::Halted) => {
                trace!("ignoring status report while halted");
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(self.on_fatal(e)),
            Err(e) => {
                warn!("discarding status report: {}", e);
                self.metrics.protocol_anomalies += 1;
                Ok(())
            }
        }
    }

    /// Lets expired timers take effect
    pub fn on_tick(&mut self, now: Instant) -> Result<(), AmError> {
        for id in self.timers.expired(now) {
            match id {
                TimerId::StatusProhibit => {
                    if self.rx.status_requested() {
                        debug!("t-StatusProhibit expired - deferred status report can be sent");
                    }
                }
                TimerId::Reordering => {
                    self.rx.on_reordering_timeout(&mut self.timers.reordering, now);
                }
                TimerId::PollRetransmit => {
                    if self.tx.is_failed() {
                        continue;
                    }
                    debug!("t-PollRetransmit expired");
                    if let Err(e) = self.tx.on_poll_retransmit_timeout() {
                        return Err(self.on_fatal(e));
                    }
                }
            }
        }
        Ok(())
    }

    fn on_fatal(&mut self, e: AmError) -> AmError {
        error!("AM entity failed: {} - waiting for re-establishment", e);
        self.timers.poll_retransmit.cancel();
        e
    }

    /// Back to the initial state: window variables, buffers, queues and timers are reset, and a
    ///  failed entity becomes active again. Metrics are kept.
    pub fn reestablish(&mut self) {
        debug!("re-establishing AM entity (tx at {}..{}, rx at {})", self.tx.tx_ack(), self.tx.tx_next(), self.rx.rx_next());
        self.tx.reset();
        self.rx.reset();
        self.timers.cancel_all();
    }

    /// SN of the next new PDU
    pub fn tx_next(&self) -> Sn {
        self.tx.tx_next()
    }
}
