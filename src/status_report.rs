//! Building STATUS PDUs from the receive window, and checking received ones before they are
//!  applied to the transmit window.

use tracing::{debug, trace};
use crate::error::AmError;
use crate::rx_window::RxWindow;
use crate::sn::Sn;
use crate::status_pdu::{NackEntry, StatusPdu};


/// Builds a STATUS PDU of at most `max_size` bytes.
///
/// ACK_SN is `rx_highest_status`, and every gap before it is NACKed. If the NACK list does not
///  fit, it is cut before the first NACK that does not fit, and ACK_SN becomes that NACK's SN so
///  that nothing unreported is acknowledged. Partial NACKs for that SN are dropped as well.
pub fn build(rx: &RxWindow, max_size: usize) -> StatusPdu {
    let mut status = StatusPdu {
        ack_sn: rx.rx_highest_status(),
        nacks: Vec::new(),
    };

    for nack in rx.missing() {
        if status.serialized_len_with(&nack) > max_size {
            debug!("status report truncated at NACK for {} to fit into {} bytes", nack.sn, max_size);
            status.ack_sn = nack.sn;
            while status.nacks.last().is_some_and(|n| n.sn == nack.sn) {
                status.nacks.pop();
            }
            break;
        }
        status.nacks.push(nack);
    }

    trace!("built status report {:?}", status);
    status
}

/// Decodes and validates a STATUS PDU
pub fn parse(buf: &[u8]) -> Result<StatusPdu, AmError> {
    let status = StatusPdu::deser(buf)?;
    validate(&status)?;
    Ok(status)
}

/// Structural checks that do not depend on the receiving side's state: NACK SNs are in ascending
///  order before ACK_SN and no more than half the SN space away from it, and byte ranges are
///  ascending and not inverted.
pub fn validate(status: &StatusPdu) -> Result<(), AmError> {
    let mut prev: Option<&NackEntry> = None;
    for nack in &status.nacks {
        let distance = status.ack_sn - nack.sn;
        if distance == 0 || distance > Sn::MODULUS / 2 {
            return Err(AmError::ProtocolAnomaly(format!("NACK_SN {} is not before ACK_SN {}", nack.sn, status.ack_sn)));
        }
        if let Some(so) = nack.so {
            if so.start > so.end {
                return Err(AmError::ProtocolAnomaly(format!("NACK for {} with inverted range {}..{}", nack.sn, so.start, so.end)));
            }
        }

        if let Some(prev) = prev {
            let prev_distance = status.ack_sn - prev.sn;
            let ordered = if prev.sn == nack.sn {
                match (prev.so, nack.so) {
                    (Some(p), Some(n)) => p.end < n.start,
                    _ => false,
                }
            }
            else {
                prev_distance > distance
            };
            if !ordered {
                return Err(AmError::ProtocolAnomaly(format!("NACK entries out of order: {:?} followed by {:?}", prev, nack)));
            }
        }
        prev = Some(nack);
    }
    Ok(())
}
