//! An LTE RLC acknowledged mode (AM) entity: it turns an unreliable, reordering and duplicating
//!  lower layer into reliable, in-order delivery of upper-layer units ('SDUs').
//!
//! ## Overview
//!
//! * The sender combines queued units into data PDUs of whatever size the current transmit
//!   opportunity allows, splitting units across PDUs and packing several units into one PDU.
//!   Every data PDU gets a sequence number (SN) and is kept until the peer acknowledges it.
//! * The receiver buffers PDUs that arrive out of order and delivers units in order once all
//!   their bytes are there. Gaps that survive t-Reordering are reported in a STATUS PDU.
//! * The sender polls for STATUS PDUs and retransmits what is reported missing. Retransmissions
//!   that no longer fit the transmit opportunity are re-segmented into AMD PDU segments.
//! * SNs are 10 bits wide and wrap around, so 'before' and 'after' are always relative to a
//!   window of at most 512 SNs.
//!
//! [entity::AmEntity] is the single-threaded state machine, driven by explicit time. It is
//!  built from [tx_window], [rx_window], [status_report] and [timers]. [bearer::AmBearer] wraps
//!  it for async use.
//!
//! ## Data PDU
//!
//! All numbers are big endian, bits are numbered MSB first.
//!
//! ```ascii
//! byte 0: D/C (1) = 1
//!         RF (1): 1 for an AMD PDU segment
//!         P (1): poll
//!         FI (2): bit 1 - first byte of the data field does not start a unit
//!                 bit 0 - last byte of the data field does not end a unit
//!         E (1): an LI chain follows
//!         SN (2): bits 9..8
//! byte 1: SN (8): bits 7..0
//!
//! only if RF = 1:
//!         LSF (1): this segment contains the last byte of the original PDU
//!         SO (15): offset of the segment's first byte in the original PDU's data field
//!
//! only if E = 1, repeated:
//!         E (1): another LI follows
//!         LI (11): length of one element of the data field; the last element has no LI
//!         (the chain is padded with zero bits to a full byte)
//!
//! data field
//! ```
//!
//! ## STATUS PDU
//!
//! ```ascii
//! D/C (1) = 0
//! CPT (3) = 000
//! ACK_SN (10): first SN that is neither acknowledged nor reported missing
//! E1 (1): a NACK follows
//!
//! repeated while E1 = 1:
//!     NACK_SN (10)
//!     E1 (1): another NACK follows
//!     E2 (1): this NACK is for a byte range only
//!     only if E2 = 1:
//!         SOstart (15)
//!         SOend (15): last missing byte, inclusive; 0x7FFF for 'up to the end of the PDU'
//!
//! zero padding to a full byte
//! ```

pub mod bearer;
pub mod bits;
pub mod config;
pub mod entity;
pub mod error;
pub mod metrics;
pub mod pdu_header;
pub mod rx_window;
pub mod safe_converter;
pub mod segmentation;
pub mod sn;
pub mod status_pdu;
pub mod status_report;
pub mod timers;
pub mod tx_window;
