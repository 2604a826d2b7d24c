//! NAT discovery client
//!
//! Runs a fixed sequence of probes against a [`NatResponder`](crate::NatResponder)
//! and folds the evidence into a [`NatClassification`]:
//!
//! 1. Reachability: `Ping` the primary listener. No usable reply means
//!    `Unreachable`. Every attempt echoing our own bound address means there
//!    is no NAT in the way (step 2); anything less means NAT (step 3).
//! 2. Firewall: `PublicCheck`, answered from the secondary listener. A reply
//!    means `Public`, silence means `SymmetricFirewall`.
//! 3. Full cone: `FullConeCheck`, answered from the secondary listener through
//!    the existing mapping. A reply means `FullCone`, silence goes to step 4.
//! 4. Symmetric: `Ping` from the original socket and from a second local
//!    socket. Different mapped addresses mean `SymmetricNat`, the same mapping
//!    goes to step 5.
//! 5. Port restriction: `PortRestrictedCheck`, answered from the receiving
//!    listener and from the tertiary listener. Only the tertiary reply counts:
//!    received means `Restricted`, never received means `PortRestricted`.
//!
//! Steps run strictly in order and stop at the first terminal classification.
//! Every socket is owned by the step (or run) that opened it and is closed when
//! that scope ends, on every exit path.

mod types;

pub use types::{DiscoveryReport, DiscoveryStep, NatClassification, StepRecord};

use crate::config::ProbeConfig;
use crate::protocol::{ProbeMessage, ProbeRequestType};
use crate::responder::ResponderAddrs;
use crate::transport::{send_probe, ProbeOutcome, ReplyFilter};
use crate::{Error, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Classify the local host's NAT behavior against the configured responder
///
/// Only failure to bind a local probe socket is returned as an error; every
/// network-facing failure is folded into the classification.
///
/// # Example
///
/// ```no_run
/// use natprobe::{discover_nat_type, ProbeConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let classification = discover_nat_type(ProbeConfig::for_server("stun.example.net")).await?;
/// if classification.requires_relay() {
///     println!("{}: direct UDP not possible, use a relay", classification);
/// }
/// # Ok(())
/// # }
/// ```
pub async fn discover_nat_type(config: ProbeConfig) -> Result<NatClassification> {
    NatDiscovery::new(config)?.discover().await
}

/// Run discovery but give up after `deadline`
///
/// Returns `Ok(None)` when the deadline elapses first. The in-flight run is
/// dropped, which closes its sockets.
pub async fn discover_with_deadline(
    config: ProbeConfig,
    deadline: Duration,
) -> Result<Option<NatClassification>> {
    let discovery = NatDiscovery::new(config)?;
    match tokio::time::timeout(deadline, discovery.discover()).await {
        Ok(result) => result.map(Some),
        Err(_) => {
            warn!("NAT discovery did not finish within {:?}", deadline);
            Ok(None)
        }
    }
}

/// Result of one step: either a terminal classification or the next step
enum Transition {
    Classified(NatClassification),
    Next(DiscoveryStep),
}

/// Sockets and addresses shared by every step of one run
struct Session {
    socket: UdpSocket,
    local_ip: IpAddr,
    local_addr: String,
    server: ResponderAddrs,
}

/// Discovery client for one responder
#[derive(Debug, Clone)]
pub struct NatDiscovery {
    config: ProbeConfig,
}

impl NatDiscovery {
    /// Create a discovery client, validating the configuration
    pub fn new(config: ProbeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Configuration this client probes with
    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Run discovery and return only the classification
    pub async fn discover(&self) -> Result<NatClassification> {
        Ok(self.run().await?.classification)
    }

    /// Run discovery and return the full step-by-step report
    pub async fn run(&self) -> Result<DiscoveryReport> {
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        let started_at_ms = chrono::Utc::now().timestamp_millis();

        info!(
            "NAT discovery {} against {} (attempts: {}, timeout: {:?})",
            run_id,
            self.config.server_host,
            self.config.max_probe_attempts,
            self.config.probe_timeout()
        );

        let mut report = DiscoveryReport {
            run_id,
            started_at_ms,
            elapsed_ms: 0,
            local_addr: None,
            steps: Vec::new(),
            classification: NatClassification::Unreachable,
        };

        let Some(server) = self.resolve_server().await else {
            return Ok(finish_unreachable(report, started, "server address unresolved"));
        };
        let Some(local_ip) = outbound_ip(server.primary).await? else {
            return Ok(finish_unreachable(report, started, "no route to server"));
        };

        let session = open_session(server, local_ip, self.config.local_port).await?;
        report.local_addr = Some(session.local_addr.clone());

        let mut step = DiscoveryStep::Reachability;
        report.classification = loop {
            let (record, transition) = match step {
                DiscoveryStep::Reachability => self.step_reachability(&session).await,
                DiscoveryStep::Firewall => self.step_firewall(&session).await,
                DiscoveryStep::FullCone => self.step_full_cone(&session).await,
                DiscoveryStep::SymmetricNat => self.step_symmetric(&session).await?,
                DiscoveryStep::PortRestriction => self.step_port_restriction(&session).await,
            };
            info!("NAT discovery {}: {} → {}", run_id, record.step, record.verdict);
            report.steps.push(record);

            match transition {
                Transition::Classified(classification) => break classification,
                Transition::Next(next) => step = next,
            }
        };

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            "NAT discovery {} finished in {} ms: {}",
            run_id, report.elapsed_ms, report.classification
        );

        Ok(report)
    }

    async fn resolve_server(&self) -> Option<ResponderAddrs> {
        let host = self.config.server_host.as_str();
        let resolved = match tokio::net::lookup_host((host, self.config.primary_port)).await {
            Ok(addrs) => preferred_server_addr(addrs),
            Err(e) => {
                warn!("Failed to resolve discovery server {}: {}", host, e);
                None
            }
        };
        let primary = resolved?;
        let ip = primary.ip();

        Some(ResponderAddrs {
            primary,
            secondary: SocketAddr::new(ip, self.config.secondary_port),
            tertiary: SocketAddr::new(ip, self.config.tertiary_port),
        })
    }

    async fn probe(
        &self,
        socket: &UdpSocket,
        destination: SocketAddr,
        request_type: ProbeRequestType,
        filter: ReplyFilter,
        reference: &str,
    ) -> ProbeOutcome {
        send_probe(
            socket,
            destination,
            &ProbeMessage::request(request_type),
            self.config.max_probe_attempts,
            self.config.probe_timeout(),
            filter,
            reference,
        )
        .await
    }

    async fn step_reachability(&self, session: &Session) -> (StepRecord, Transition) {
        let outcome = self
            .probe(
                &session.socket,
                session.server.primary,
                ProbeRequestType::Ping,
                ReplyFilter::From(session.server.primary),
                &session.local_addr,
            )
            .await;

        let (verdict, transition) = if !outcome.got_reply() {
            let verdict = if outcome.all_sends_failed() {
                "every send failed"
            } else {
                "no reply"
            };
            (verdict, Transition::Classified(NatClassification::Unreachable))
        } else if outcome.every_attempt_matched() {
            ("local address echoed", Transition::Next(DiscoveryStep::Firewall))
        } else {
            ("mapped address differs", Transition::Next(DiscoveryStep::FullCone))
        };

        (record(DiscoveryStep::Reachability, vec![outcome], verdict), transition)
    }

    async fn step_firewall(&self, session: &Session) -> (StepRecord, Transition) {
        let outcome = self
            .probe(
                &session.socket,
                session.server.primary,
                ProbeRequestType::PublicCheck,
                ReplyFilter::From(session.server.secondary),
                &session.local_addr,
            )
            .await;

        let (verdict, classification) = if outcome.got_reply() {
            ("alternate port reached us", NatClassification::Public)
        } else {
            ("alternate port blocked", NatClassification::SymmetricFirewall)
        };

        (
            record(DiscoveryStep::Firewall, vec![outcome], verdict),
            Transition::Classified(classification),
        )
    }

    async fn step_full_cone(&self, session: &Session) -> (StepRecord, Transition) {
        let outcome = self
            .probe(
                &session.socket,
                session.server.primary,
                ProbeRequestType::FullConeCheck,
                ReplyFilter::From(session.server.secondary),
                &session.local_addr,
            )
            .await;

        let (verdict, transition) = if outcome.got_reply() {
            (
                "alternate port reached us",
                Transition::Classified(NatClassification::FullCone),
            )
        } else {
            ("alternate port blocked", Transition::Next(DiscoveryStep::SymmetricNat))
        };

        (record(DiscoveryStep::FullCone, vec![outcome], verdict), transition)
    }

    async fn step_symmetric(&self, session: &Session) -> Result<(StepRecord, Transition)> {
        // Closed when this step returns.
        let second = bind_probe_socket(session.local_ip, 0).await?;
        let second_local = second.local_addr()?.to_string();
        debug!("Second probe socket bound to {}", second_local);

        let first_outcome = self
            .probe(
                &session.socket,
                session.server.primary,
                ProbeRequestType::Ping,
                ReplyFilter::From(session.server.primary),
                &session.local_addr,
            )
            .await;
        let second_outcome = self
            .probe(
                &second,
                session.server.primary,
                ProbeRequestType::Ping,
                ReplyFilter::From(session.server.primary),
                &second_local,
            )
            .await;

        let (verdict, transition) = match (
            first_outcome.first_observed(),
            second_outcome.first_observed(),
        ) {
            (Some(first), Some(second)) if first == second => (
                "same mapping for both sockets".to_string(),
                Transition::Next(DiscoveryStep::PortRestriction),
            ),
            (Some(first), Some(second)) => (
                format!("mappings differ ({} vs {})", first, second),
                Transition::Classified(NatClassification::SymmetricNat),
            ),
            _ => (
                "no mapping observed for one socket".to_string(),
                Transition::Classified(NatClassification::SymmetricNat),
            ),
        };

        Ok((
            StepRecord {
                step: DiscoveryStep::SymmetricNat,
                outcomes: vec![first_outcome, second_outcome],
                verdict,
            },
            transition,
        ))
    }

    async fn step_port_restriction(&self, session: &Session) -> (StepRecord, Transition) {
        let outcome = self
            .probe(
                &session.socket,
                session.server.primary,
                ProbeRequestType::PortRestrictedCheck,
                ReplyFilter::From(session.server.tertiary),
                &session.local_addr,
            )
            .await;

        let (verdict, classification) = if outcome.got_reply() {
            ("tertiary port reached us", NatClassification::Restricted)
        } else {
            ("tertiary port blocked", NatClassification::PortRestricted)
        };

        (
            record(DiscoveryStep::PortRestriction, vec![outcome], verdict),
            Transition::Classified(classification),
        )
    }
}

async fn open_session(server: ResponderAddrs, local_ip: IpAddr, local_port: u16) -> Result<Session> {
    let socket = bind_probe_socket(local_ip, local_port).await?;
    let local_addr = socket.local_addr()?.to_string();
    debug!("Primary probe socket bound to {}", local_addr);

    Ok(Session {
        socket,
        local_ip,
        local_addr,
        server,
    })
}

fn finish_unreachable(mut report: DiscoveryReport, started: Instant, verdict: &str) -> DiscoveryReport {
    report.steps.push(record(DiscoveryStep::Reachability, Vec::new(), verdict));
    report.classification = NatClassification::Unreachable;
    report.elapsed_ms = started.elapsed().as_millis() as u64;
    info!("NAT discovery {}: {}", report.run_id, verdict);
    report
}

fn record(step: DiscoveryStep, outcomes: Vec<ProbeOutcome>, verdict: &str) -> StepRecord {
    StepRecord {
        step,
        outcomes,
        verdict: verdict.to_string(),
    }
}

/// Pick the responder address to probe from a resolved list
///
/// IPv4 wins over IPv6: the responder binds the IPv4 wildcard by default, so a
/// name like `localhost` resolving to `::1` first would otherwise look
/// unreachable.
pub(crate) fn preferred_server_addr(
    resolved: impl IntoIterator<Item = SocketAddr>,
) -> Option<SocketAddr> {
    let mut fallback = None;
    for addr in resolved {
        if addr.is_ipv4() {
            return Some(addr);
        }
        fallback.get_or_insert(addr);
    }
    fallback
}

/// Local interface IP the OS routes traffic to `server` through
///
/// Connecting a UDP socket sends nothing; it only fixes the route, which makes
/// the bound local address concrete instead of the unspecified address.
/// `None` means there is no route to the server.
async fn outbound_ip(server: SocketAddr) -> Result<Option<IpAddr>> {
    let unspecified = match server {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    let probe = UdpSocket::bind(SocketAddr::new(unspecified, 0))
        .await
        .map_err(|e| Error::Bind(format!("Failed to bind route probe socket: {}", e)))?;
    if let Err(e) = probe.connect(server).await {
        warn!("No route to discovery server {}: {}", server, e);
        return Ok(None);
    }
    Ok(Some(probe.local_addr()?.ip()))
}

async fn bind_probe_socket(ip: IpAddr, port: u16) -> Result<UdpSocket> {
    let addr = SocketAddr::new(ip, port);
    UdpSocket::bind(addr)
        .await
        .map_err(|e| Error::Bind(format!("Failed to bind probe socket on {}: {}", addr, e)))
}
