use std::collections::VecDeque;
use std::time::{Duration, Instant};
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rlc_am::config::AmConfig;
use rlc_am::entity::{AmEntity, EntityState};
use rlc_am::error::AmError;
use rlc_am::segmentation::Unit;
use rlc_am::status_report;


/// An unreliable channel in one direction: PDUs are dropped, duplicated and delayed by a random
///  amount, which reorders them.
struct LossyChannel {
    rng: StdRng,
    loss: f64,
    duplication: f64,
    max_delay_millis: u64,
    in_flight: Vec<(Instant, Bytes)>,
}

impl LossyChannel {
    fn new(seed: u64, loss: f64, duplication: f64, max_delay_millis: u64) -> LossyChannel {
        LossyChannel {
            rng: StdRng::seed_from_u64(seed),
            loss,
            duplication,
            max_delay_millis,
            in_flight: Vec::new(),
        }
    }

    fn send(&mut self, pdu: Bytes, now: Instant) {
        let copies = if self.rng.gen_bool(self.duplication) { 2 } else { 1 };
        for _ in 0..copies {
            if self.rng.gen_bool(self.loss) {
                continue;
            }
            let delay = Duration::from_millis(self.rng.gen_range(0..=self.max_delay_millis));
            self.in_flight.push((now + delay, pdu.clone()));
        }
    }

    fn receive(&mut self, now: Instant) -> Vec<Bytes> {
        let (mut due, pending): (Vec<_>, Vec<_>) = self.in_flight.drain(..)
            .partition(|(at, _)| *at <= now);
        self.in_flight = pending;
        due.sort_by_key(|(at, _)| *at);
        due.into_iter().map(|(_, pdu)| pdu).collect()
    }
}

fn config() -> AmConfig {
    AmConfig {
        max_retx_threshold: 64,
        t_status_prohibit: Duration::from_millis(10),
        ..AmConfig::default_lte()
    }
}

fn random_units(rng: &mut StdRng, n: u64) -> VecDeque<Unit> {
    (0..n)
        .map(|id| {
            let len = rng.gen_range(1..3_000);
            let data = (0..len).map(|_| rng.gen::<u8>()).collect::<Vec<_>>();
            Unit { id, data: data.into() }
        })
        .collect()
}

/// sends everything `entity` has to send right now through `channel`
fn transmit(entity: &mut AmEntity, channel: &mut LossyChannel, rng: &mut StdRng, now: Instant) {
    loop {
        let grant = rng.gen_range(8..400);
        match entity.pull_pdu(grant, now) {
            Ok(pdu) => {
                let buf = pdu.encode();
                assert!(buf.len() <= grant);
                if buf[0] & 0x80 == 0 {
                    status_report::parse(&buf).unwrap();
                }
                channel.send(buf, now);
            }
            Err(e) if e.is_retryable() => break,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
}

/// Runs a link between two entities until every unit is delivered and acknowledged
fn run_link(seed: u64, num_units: u64, loss: f64, duplication: f64, max_delay_millis: u64) -> (Vec<Unit>, Vec<Bytes>, AmEntity, AmEntity) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut to_receiver = LossyChannel::new(seed + 1, loss, duplication, max_delay_millis);
    let mut to_sender = LossyChannel::new(seed + 2, loss, duplication, max_delay_millis);

    let mut sender = AmEntity::new(&config()).unwrap();
    let mut receiver = AmEntity::new(&config()).unwrap();

    let mut pending = random_units(&mut rng, num_units);
    let submitted = pending.iter().cloned().collect::<Vec<_>>();
    let mut delivered = Vec::new();

    let start = Instant::now();
    for step in 0..200_000u64 {
        let now = start + Duration::from_millis(step);

        while let Some(unit) = pending.pop_front() {
            match sender.submit(unit.clone()) {
                Ok(()) => {}
                Err(AmError::UnitRejected(_)) => {
                    pending.push_front(unit);
                    break;
                }
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        sender.on_tick(now).unwrap();
        receiver.on_tick(now).unwrap();

        transmit(&mut sender, &mut to_receiver, &mut rng, now);
        transmit(&mut receiver, &mut to_sender, &mut rng, now);

        for pdu in to_receiver.receive(now) {
            delivered.extend(receiver.on_received(pdu, now).unwrap());
        }
        for pdu in to_sender.receive(now) {
            sender.on_received(pdu, now).unwrap();
        }

        if pending.is_empty()
            && delivered.len() as u64 == num_units
            && sender.tx_window().num_outstanding() == 0
            && !sender.tx_window().has_new_data()
        {
            return (submitted, delivered, sender, receiver);
        }
    }
    panic!("link did not settle: {} of {} units delivered", delivered.len(), num_units);
}

fn assert_delivered_in_order(submitted: &[Unit], delivered: &[Bytes]) {
    assert_eq!(delivered.len(), submitted.len());
    for (unit, received) in submitted.iter().zip(delivered) {
        assert_eq!(&unit.data, received, "unit #{} differs", unit.id);
    }
}

#[test]
fn test_reliable_channel() {
    let (submitted, delivered, sender, receiver) = run_link(1, 300, 0.0, 0.0, 0);
    assert_delivered_in_order(&submitted, &delivered);

    assert_eq!(sender.metrics().retransmitted_pdus, 0);
    assert_eq!(receiver.metrics().duplicates, 0);
    assert_eq!(receiver.metrics().units_delivered, 300);
}

#[test]
fn test_lossy_reordering_duplicating_channel() {
    for seed in [7, 99, 12345] {
        let (submitted, delivered, sender, receiver) = run_link(seed, 500, 0.2, 0.1, 30);
        assert_delivered_in_order(&submitted, &delivered);

        assert_eq!(sender.state(), EntityState::Active);
        assert!(sender.metrics().retransmitted_pdus > 0);
        assert!(receiver.metrics().status_pdus_sent > 0);
        assert_eq!(receiver.metrics().malformed, 0);
        assert_eq!(receiver.metrics().dropped_fragments, 0);
        assert_eq!(sender.metrics().protocol_anomalies, 0);
    }
}

#[test]
fn test_sn_wraparound() {
    // well over 1024 PDUs with small grants
    let (submitted, delivered, sender, _) = run_link(3, 1_500, 0.05, 0.05, 30);
    assert_delivered_in_order(&submitted, &delivered);
    assert!(sender.metrics().data_pdus_sent > 1024);
}
