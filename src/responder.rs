//! NAT responder (server side of the probe protocol)
//!
//! The responder holds three long-lived UDP listeners on distinct ports of the
//! same host. Each listener runs its own receive loop and hands every datagram
//! to an independent task, so a slow reply to one peer never stalls another.
//! Replies are sent either from the listener that received the request or from
//! a different listener, which is what exposes NAT filtering rules:
//!
//! | Request               | Replies from                     |
//! |-----------------------|----------------------------------|
//! | `Ping`                | receiving listener               |
//! | `PublicCheck`         | secondary                        |
//! | `FullConeCheck`       | secondary                        |
//! | `PortRestrictedCheck` | receiving listener, then tertiary|
//!
//! The responder keeps no per-client state. Malformed datagrams are logged and
//! dropped; a bad packet never closes a listener.

use crate::config::ResponderConfig;
use crate::protocol::{ProbeMessage, ProbeRequestType, MAX_DATAGRAM_SIZE};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Pause after a failed receive before the listener reads again
pub(crate) const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Identity of one of the three responder listeners
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ListenerRole {
    /// Listener every probe is sent to
    Primary,
    /// Alternate-port listener used for unsolicited replies
    Secondary,
    /// Alternate-port listener simulating an unrelated second peer
    Tertiary,
}

impl ListenerRole {
    /// All roles in binding order
    pub const ALL: [ListenerRole; 3] = [
        ListenerRole::Primary,
        ListenerRole::Secondary,
        ListenerRole::Tertiary,
    ];
}

/// Addresses of the three responder listeners
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponderAddrs {
    /// Primary listener
    pub primary: SocketAddr,
    /// Secondary listener
    pub secondary: SocketAddr,
    /// Tertiary listener
    pub tertiary: SocketAddr,
}

impl ResponderAddrs {
    /// Address of the listener with the given role
    pub fn get(&self, role: ListenerRole) -> SocketAddr {
        match role {
            ListenerRole::Primary => self.primary,
            ListenerRole::Secondary => self.secondary,
            ListenerRole::Tertiary => self.tertiary,
        }
    }
}

/// Listeners a reply to `request_type` is sent from, in send order
pub fn reply_plan(request_type: ProbeRequestType, received_on: ListenerRole) -> Vec<ListenerRole> {
    match request_type {
        ProbeRequestType::Ping => vec![received_on],
        ProbeRequestType::PublicCheck | ProbeRequestType::FullConeCheck => {
            vec![ListenerRole::Secondary]
        }
        ProbeRequestType::PortRestrictedCheck => vec![received_on, ListenerRole::Tertiary],
    }
}

struct Listeners {
    primary: UdpSocket,
    secondary: UdpSocket,
    tertiary: UdpSocket,
}

impl Listeners {
    fn get(&self, role: ListenerRole) -> &UdpSocket {
        match role {
            ListenerRole::Primary => &self.primary,
            ListenerRole::Secondary => &self.secondary,
            ListenerRole::Tertiary => &self.tertiary,
        }
    }
}

/// Three-listener NAT responder
pub struct NatResponder {
    listeners: Arc<Listeners>,
    addrs: ResponderAddrs,
    max_in_flight: usize,
}

impl NatResponder {
    /// Bind all three listeners
    ///
    /// Fails with [`Error::Bind`] if any listener cannot be bound; nothing is
    /// left bound in that case.
    pub async fn bind(config: &ResponderConfig) -> Result<Self> {
        config.validate()?;

        let primary = bind_listener(config, config.primary_port).await?;
        let secondary = bind_listener(config, config.secondary_port).await?;
        let tertiary = bind_listener(config, config.tertiary_port).await?;

        let addrs = ResponderAddrs {
            primary: primary.local_addr()?,
            secondary: secondary.local_addr()?,
            tertiary: tertiary.local_addr()?,
        };

        info!(
            "NAT responder bound: primary {}, secondary {}, tertiary {}",
            addrs.primary, addrs.secondary, addrs.tertiary
        );

        Ok(Self {
            listeners: Arc::new(Listeners {
                primary,
                secondary,
                tertiary,
            }),
            addrs,
            max_in_flight: config.max_in_flight_per_listener,
        })
    }

    /// Bound listener addresses
    pub fn local_addrs(&self) -> ResponderAddrs {
        self.addrs
    }

    /// Start one receive loop per listener
    pub fn spawn(self) -> ResponderHandle {
        let tasks = ListenerRole::ALL
            .into_iter()
            .map(|role| {
                let listeners = self.listeners.clone();
                let permits = Arc::new(Semaphore::new(self.max_in_flight));
                tokio::spawn(receive_loop(role, listeners, permits))
            })
            .collect();

        ResponderHandle {
            addrs: self.addrs,
            tasks,
        }
    }

    /// Serve until the receive loops stop
    pub async fn run(self) {
        self.spawn().join().await;
    }
}

/// Handle to a running responder
///
/// Dropping the handle stops the receive loops.
pub struct ResponderHandle {
    addrs: ResponderAddrs,
    tasks: Vec<JoinHandle<()>>,
}

impl ResponderHandle {
    /// Bound listener addresses
    pub fn addrs(&self) -> ResponderAddrs {
        self.addrs
    }

    /// Stop all receive loops
    pub fn shutdown(&self) {
        info!("Stopping NAT responder on {}", self.addrs.primary);
        for task in &self.tasks {
            task.abort();
        }
    }

    /// Wait for the receive loops to finish
    pub async fn join(mut self) {
        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!("Responder listener task failed: {}", e);
                }
            }
        }
    }
}

impl Drop for ResponderHandle {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn bind_listener(config: &ResponderConfig, port: u16) -> Result<UdpSocket> {
    let addr = SocketAddr::new(config.bind_ip, port);
    UdpSocket::bind(addr)
        .await
        .map_err(|e| Error::Bind(format!("Failed to bind listener on {}: {}", addr, e)))
}

async fn receive_loop(role: ListenerRole, listeners: Arc<Listeners>, permits: Arc<Semaphore>) {
    // One spare byte so oversized datagrams reach the size check untruncated.
    let mut buf = [0u8; MAX_DATAGRAM_SIZE + 1];

    loop {
        // Waiting here applies back-pressure once the in-flight cap is reached.
        let permit = match permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        match listeners.get(role).recv_from(&mut buf).await {
            Ok((len, source)) => {
                let datagram = buf[..len].to_vec();
                let listeners = listeners.clone();
                tokio::spawn(async move {
                    handle_datagram(&listeners, role, source, &datagram).await;
                    drop(permit);
                });
            }
            Err(e) => {
                drop(permit);
                backoff_after_receive_error(role, &e).await;
            }
        }
    }
}

pub(crate) async fn backoff_after_receive_error(role: ListenerRole, e: &std::io::Error) {
    error!(
        "{:?} listener receive error: {} (retrying in {:?})",
        role, e, RECEIVE_ERROR_BACKOFF
    );
    tokio::time::sleep(RECEIVE_ERROR_BACKOFF).await;
}

async fn handle_datagram(
    listeners: &Listeners,
    received_on: ListenerRole,
    source: SocketAddr,
    datagram: &[u8],
) {
    let request = match ProbeMessage::decode(datagram) {
        Ok(request) => request,
        Err(e) => {
            warn!("Dropping malformed probe from {} on {:?}: {}", source, received_on, e);
            return;
        }
    };

    let payload = match ProbeMessage::reply(request.request_type, source).encode() {
        Ok(payload) => payload,
        Err(e) => {
            error!("Failed to encode reply for {}: {}", source, e);
            return;
        }
    };

    for role in reply_plan(request.request_type, received_on) {
        match listeners.get(role).send_to(&payload, source).await {
            Ok(n) => debug!(
                "{:?} reply: {} bytes to {} from {:?}",
                request.request_type, n, source, role
            ),
            Err(e) => warn!(
                "{:?} reply to {} from {:?} failed: {}",
                request.request_type, source, role, e
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_echoes_from_receiving_listener() {
        for role in ListenerRole::ALL {
            assert_eq!(reply_plan(ProbeRequestType::Ping, role), vec![role]);
        }
    }

    #[test]
    fn test_public_and_full_cone_use_secondary() {
        for request_type in [ProbeRequestType::PublicCheck, ProbeRequestType::FullConeCheck] {
            assert_eq!(
                reply_plan(request_type, ListenerRole::Primary),
                vec![ListenerRole::Secondary]
            );
        }
    }

    #[test]
    fn test_port_restricted_replies_twice() {
        assert_eq!(
            reply_plan(ProbeRequestType::PortRestrictedCheck, ListenerRole::Primary),
            vec![ListenerRole::Primary, ListenerRole::Tertiary]
        );
    }
}
