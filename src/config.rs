use std::time::Duration;
use anyhow::bail;
use crate::pdu_header::DataHeader;
use crate::sn::Sn;

pub struct AmConfig {
    /// The number of SNs that may be outstanding (sender side) or buffered out of order (receiver
    ///  side). Half the SN space at most, so that 'before' and 'after' in the window remain
    ///  unambiguous.
    pub window_size: u16,

    /// Time to wait for a STATUS PDU after sending a poll before polling again
    pub t_poll_retransmit: Duration,
    /// Poll after this many PDUs without a poll; `None` disables the trigger
    pub poll_pdu: Option<u32>,
    /// Poll after this many data field bytes without a poll; `None` disables the trigger
    pub poll_byte: Option<usize>,
    /// A PDU is scheduled for retransmission at most this many times. Exceeding this is fatal for
    ///  the entity.
    pub max_retx_threshold: u32,

    /// Time to wait for a missing PDU before reporting it in a STATUS PDU
    pub t_reordering: Duration,
    /// Minimum time between two STATUS PDUs; zero for no limit
    pub t_status_prohibit: Duration,

    pub max_unit_size: usize,
    /// Maximum number of units waiting for transmission
    pub tx_queue_capacity: usize,
}

impl AmConfig {
    /// values from the typical LTE default configuration for data radio bearers
    pub fn default_lte() -> AmConfig {
        AmConfig {
            window_size: 512,
            t_poll_retransmit: Duration::from_millis(45),
            poll_pdu: Some(4),
            poll_byte: Some(25_000),
            max_retx_threshold: 4,
            t_reordering: Duration::from_millis(35),
            t_status_prohibit: Duration::ZERO,
            max_unit_size: 9_000,
            tx_queue_capacity: 128,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.window_size == 0 || self.window_size > Sn::MODULUS / 2 {
            bail!("window size must be between 1 and {}", Sn::MODULUS / 2);
        }
        if self.t_poll_retransmit.is_zero() {
            bail!("t-PollRetransmit must not be zero");
        }
        if self.t_reordering.is_zero() {
            bail!("t-Reordering must not be zero");
        }
        if self.poll_pdu == Some(0) {
            bail!("pollPDU must be positive - use None to disable it");
        }
        if self.poll_byte == Some(0) {
            bail!("pollByte must be positive - use None to disable it");
        }
        if self.max_retx_threshold == 0 {
            bail!("maxRetxThreshold must be positive");
        }
        if self.max_unit_size == 0 {
            bail!("maximum unit size must be positive");
        }
        if self.tx_queue_capacity == 0 {
            bail!("transmit queue capacity must be positive");
        }

        Ok(())
    }
}


#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CipherDirection {
    Uplink,
    Downlink,
}

impl CipherDirection {
    pub fn reverse(self) -> CipherDirection {
        match self {
            CipherDirection::Uplink => CipherDirection::Downlink,
            CipherDirection::Downlink => CipherDirection::Uplink,
        }
    }
}

pub struct BearerConfig {
    pub bearer_id: u8,
    /// This is the size of a transmit opportunity, i.e. the maximum size of PDUs handed to the
    ///  transport. A real scheduler would vary this per opportunity.
    pub max_pdu_size: usize,
    /// interval for polling timers and transmit opportunities
    pub tick_interval: Duration,
    /// direction of the PDUs this side sends, used as cipher input
    pub direction: CipherDirection,
}

impl BearerConfig {
    /// the largest data field plus room for a segment header
    pub const MAX_PDU_SIZE: usize = DataHeader::MAX_DATA_FIELD + DataHeader::FIXED_LEN + DataHeader::SEGMENT_INFO_LEN;

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_pdu_size < 5 {
            bail!("PDU size must leave room for a segment header and at least one data byte");
        }
        if self.max_pdu_size > Self::MAX_PDU_SIZE {
            bail!("PDU size must not exceed {} bytes: larger data fields can not be resegmented", Self::MAX_PDU_SIZE);
        }
        if self.tick_interval.is_zero() {
            bail!("tick interval must not be zero");
        }
        Ok(())
    }
}
