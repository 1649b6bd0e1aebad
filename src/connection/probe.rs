//! Path discovery: exchange rate and maximum packet size
//!
//! Before any real value moves, the connection volleys unfulfillable test
//! packets. Rejections from the far endpoint reveal how much of each probe
//! arrived (yielding the exchange rate); F08 rejections from the path reveal
//! the bottleneck's packet-size ceiling.

use super::{Connection, ConnectionError, MAX_RETRY_DELAY};
use crate::crypto::random_condition;
use crate::packet::{Packet, PacketType};
use crate::rate::Rate;
use crate::transport::{MaxPacketDetails, PacketOutcome, PacketSender, Prepare, RejectCode};
use tracing::{debug, trace, warn};

/// Source amounts of the initial volley, spanning the plausible range of
/// asset scales.
const PROBE_AMOUNTS: [u64; 5] = [1, 1_000, 1_000_000, 1_000_000_000, 1_000_000_000_000];

/// Upper bound on discovery rounds before giving up.
const MAX_PROBE_ATTEMPTS: u32 = 20;

/// What one test packet taught us.
enum ProbeReply {
    /// The far endpoint reported this much arriving.
    Delivered(u64),
    /// The path reported its packet-size ceiling.
    Capacity(MaxPacketDetails),
    /// Temporary failure; retry with backoff.
    Temporary,
}

fn decimal_digits(value: u64) -> u32 {
    if value == 0 {
        0
    } else {
        value.ilog10() + 1
    }
}

fn scale_by_ratio(amount: u64, numerator: u64, denominator: u64) -> u64 {
    let scaled = amount as u128 * numerator as u128 / denominator as u128;
    scaled.min(u64::MAX as u128) as u64
}

impl<T: PacketSender> Connection<T> {
    /// Learn the path's exchange rate to the required precision, and its
    /// maximum packet amount along the way.
    pub(crate) async fn discover_path(&mut self) -> Result<(), ConnectionError> {
        let mut amounts: Vec<u64> = PROBE_AMOUNTS.to_vec();

        for attempt in 0..MAX_PROBE_ATTEMPTS {
            if self.is_closed() {
                return Err(ConnectionError::Closed);
            }
            trace!(attempt, ?amounts, "probing path");

            let smallest = amounts.iter().copied().min().unwrap_or(1);
            let mut best: Option<(u64, u64)> = None;
            let mut caps: Vec<u64> = Vec::new();
            let mut saw_temporary = false;

            for &amount in &amounts {
                match self.send_test_packet(amount).await? {
                    ProbeReply::Delivered(delivered) => {
                        let better = match best {
                            Some((current, _)) => {
                                decimal_digits(delivered) > decimal_digits(current)
                            }
                            None => true,
                        };
                        if better {
                            best = Some((delivered, amount));
                        }
                    }
                    ProbeReply::Capacity(details) => {
                        if details.received > 0 {
                            caps.push(scale_by_ratio(amount, details.maximum, details.received));
                        }
                    }
                    ProbeReply::Temporary => saw_temporary = true,
                }
            }

            if let Some(&cap) = caps.iter().min() {
                self.reduce_max_packet(cap)?;
            }

            if let Some((delivered, source)) = best {
                if decimal_digits(delivered) >= self.config().min_exchange_rate_precision {
                    let rate = Rate::from_amounts(delivered, source).ok_or_else(|| {
                        ConnectionError::RateProbe("delivered amount with zero source".to_string())
                    })?;
                    debug!(%rate, max_packet = ?self.max_packet_amount(), "path discovered");
                    self.set_exchange_rate(rate);
                    return Ok(());
                }
            }

            // Refine the volley: the capacities just learned, plus a step
            // below the smallest attempt when the path flaked.
            let mut next: Vec<u64> = caps;
            if saw_temporary {
                next.push(smallest - smallest / 3);
                self.backoff_probe().await;
            }
            next.retain(|&a| a > 0);
            next.sort_unstable();
            next.dedup();

            if next.is_empty() {
                return Err(ConnectionError::RateProbe(
                    "no viable probe amounts remain".to_string(),
                ));
            }
            amounts = next;
        }

        Err(ConnectionError::RateProbe(format!(
            "exchange rate not measurable within {} attempts",
            MAX_PROBE_ATTEMPTS
        )))
    }

    /// Send one unfulfillable packet and classify the response.
    async fn send_test_packet(&mut self, amount: u64) -> Result<ProbeReply, ConnectionError> {
        let sequence = self.take_sequence();
        let mut packet = Packet::new(sequence, PacketType::Prepare, 0);
        packet.frames.extend(self.handshake_frames());

        let data = self
            .seal_packet(&packet)
            .map_err(|e| ConnectionError::RateProbe(e.to_string()))?;
        let prepare = Prepare {
            amount,
            execution_condition: random_condition(),
            data,
        };

        let outcome = self
            .send_via_transport(prepare)
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;

        match outcome {
            PacketOutcome::Fulfilled(_) => {
                // Nobody holds the preimage of a random condition.
                warn!(sequence, "test packet was fulfilled; path is misbehaving");
                Ok(ProbeReply::Temporary)
            }
            PacketOutcome::Rejected(reject) if reject.code == RejectCode::PACKET_TOO_LARGE => {
                match MaxPacketDetails::from_bytes(&reject.data) {
                    Some(details) => Ok(ProbeReply::Capacity(details)),
                    None => Ok(ProbeReply::Temporary),
                }
            }
            PacketOutcome::Rejected(reject) if reject.code == RejectCode::APPLICATION_ERROR => {
                match self.open_response_packet(&reject.data, sequence, PacketType::Reject) {
                    Some(response) => {
                        self.mark_remote_knows_address();
                        let frames = response.frames;
                        self.apply_control_frames(&frames);
                        Ok(ProbeReply::Delivered(response.prepare_amount))
                    }
                    None => Ok(ProbeReply::Temporary),
                }
            }
            PacketOutcome::Rejected(reject) if reject.code.is_temporary() => {
                trace!(code = %reject.code, "temporary error while probing");
                Ok(ProbeReply::Temporary)
            }
            PacketOutcome::Rejected(reject) => Err(ConnectionError::Path {
                code: reject.code.to_string(),
                message: reject.message,
            }),
        }
    }

    /// Probe backoff grows gently (×1.5) since volleys are cheap.
    async fn backoff_probe(&mut self) {
        let delay = self.retry_delay();
        trace!(?delay, "backing off before next volley");
        tokio::time::sleep(delay).await;
        self.set_retry_delay((delay + delay / 2).min(MAX_RETRY_DELAY));
    }
}
