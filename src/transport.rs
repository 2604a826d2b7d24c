//! Probe transport
//!
//! This module sends one probe request several times over a caller-supplied
//! UDP socket and tallies what came back:
//! - Send failures (local write errors, no read attempted)
//! - Timeouts (no usable reply before the per-attempt deadline)
//! - Decode failures (only malformed replies before the deadline)
//! - Replies whose observed address equals a reference address
//!
//! Attempts are strictly sequential and every read is bounded by the
//! per-attempt deadline, so a batch never takes longer than
//! `attempts x timeout`.

use crate::protocol::{ProbeMessage, MAX_DATAGRAM_SIZE};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

/// Which reply sources count toward an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyFilter {
    /// Any datagram arriving on the socket
    Any,
    /// Only datagrams whose source is exactly this responder listener
    From(SocketAddr),
}

impl ReplyFilter {
    fn accepts(&self, source: SocketAddr) -> bool {
        match self {
            ReplyFilter::Any => true,
            ReplyFilter::From(expected) => *expected == source,
        }
    }
}

/// Tally of one probe batch
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProbeOutcome {
    /// Attempts made
    pub attempts: u32,
    /// Attempts whose write failed
    pub send_failures: u32,
    /// Attempts that saw nothing from an accepted source
    pub timeouts: u32,
    /// Attempts that saw only undecodable replies
    pub decode_failures: u32,
    /// Usable replies whose observed address matched the reference
    pub address_matches: u32,
    /// Observed addresses from usable replies, in arrival order
    pub observed: Vec<String>,
}

impl ProbeOutcome {
    /// Number of usable replies
    pub fn replies(&self) -> u32 {
        self.observed.len() as u32
    }

    /// At least one usable reply arrived
    pub fn got_reply(&self) -> bool {
        !self.observed.is_empty()
    }

    /// Every attempt failed at the write
    pub fn all_sends_failed(&self) -> bool {
        self.attempts > 0 && self.send_failures == self.attempts
    }

    /// Every attempt got a reply echoing the reference address
    ///
    /// A lost or undecodable attempt breaks the run, so partial loss never
    /// counts as a full match.
    pub fn every_attempt_matched(&self) -> bool {
        self.attempts > 0 && self.address_matches == self.attempts
    }

    /// First observed address, if any reply arrived
    pub fn first_observed(&self) -> Option<&str> {
        self.observed.first().map(String::as_str)
    }
}

enum AttemptResult {
    Reply(ProbeMessage),
    Malformed,
    TimedOut,
}

/// Send `message` to `destination` up to `attempts` times and classify each attempt
///
/// Each attempt writes the encoded message and then waits up to
/// `per_attempt_timeout` for a reply from a source accepted by `filter`.
/// Datagrams from other sources are discarded without ending the attempt.
/// A reply counts as an address match when its observed address is exactly
/// `reference` (normally the socket's own bound address).
pub async fn send_probe(
    socket: &UdpSocket,
    destination: SocketAddr,
    message: &ProbeMessage,
    attempts: u32,
    per_attempt_timeout: Duration,
    filter: ReplyFilter,
    reference: &str,
) -> ProbeOutcome {
    let mut outcome = ProbeOutcome {
        attempts,
        ..ProbeOutcome::default()
    };

    let payload = match message.encode() {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Failed to encode {:?} probe: {}", message.request_type, e);
            outcome.send_failures = attempts;
            return outcome;
        }
    };

    for attempt in 1..=attempts {
        if let Err(e) = socket.send_to(&payload, destination).await {
            debug!(
                "Attempt {}/{}: {:?} send to {} failed: {}",
                attempt, attempts, message.request_type, destination, e
            );
            outcome.send_failures += 1;
            continue;
        }

        let deadline = Instant::now() + per_attempt_timeout;
        match await_reply(socket, deadline, filter).await {
            AttemptResult::Reply(reply) => {
                let observed = reply.observed_address.unwrap_or_default();
                let matched = observed == reference;
                debug!(
                    "Attempt {}/{}: {:?} reply observed {} (matches local: {})",
                    attempt, attempts, message.request_type, observed, matched
                );
                if matched {
                    outcome.address_matches += 1;
                }
                outcome.observed.push(observed);
            }
            AttemptResult::Malformed => {
                debug!(
                    "Attempt {}/{}: {:?} only malformed replies",
                    attempt, attempts, message.request_type
                );
                outcome.decode_failures += 1;
            }
            AttemptResult::TimedOut => {
                debug!(
                    "Attempt {}/{}: {:?} timed out after {:?}",
                    attempt, attempts, message.request_type, per_attempt_timeout
                );
                outcome.timeouts += 1;
            }
        }
    }

    outcome
}

async fn await_reply(socket: &UdpSocket, deadline: Instant, filter: ReplyFilter) -> AttemptResult {
    // One spare byte so oversized datagrams reach the size check untruncated.
    let mut buf = [0u8; MAX_DATAGRAM_SIZE + 1];
    let mut saw_malformed = false;

    loop {
        let (len, source) = match timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Ok(Ok(received)) => received,
            Ok(Err(e)) => {
                debug!("Receive error while awaiting reply: {}", e);
                break;
            }
            Err(_) => break,
        };

        if !filter.accepts(source) {
            debug!("Ignoring datagram from unexpected source {}", source);
            continue;
        }

        match ProbeMessage::decode(&buf[..len]) {
            Ok(reply) => return AttemptResult::Reply(reply),
            Err(e) => {
                debug!("Discarding malformed reply from {}: {}", source, e);
                saw_malformed = true;
            }
        }
    }

    if saw_malformed {
        AttemptResult::Malformed
    } else {
        AttemptResult::TimedOut
    }
}
