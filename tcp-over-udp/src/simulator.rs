//! In-memory network simulator for deterministic testing.
//!
//! Real networks drop, reorder and duplicate packets.  To exercise the
//! reliability mechanisms without depending on actual network conditions,
//! this module provides a [`Simulator`]: a set of hosts keyed by datagram
//! address, joined by a fault model:
//!
//! | Fault            | Description                                      |
//! |------------------|--------------------------------------------------|
//! | Packet loss      | Drop a packet with probability `loss_rate`.      |
//! | Reordering       | Delay a packet by `reorder_delay`, letting later |
//! |                  | packets overtake it.                             |
//! | Duplication      | Deliver a packet twice.                          |
//! | Targeted drops   | Drop the next N packets matching a predicate.    |
//!
//! Every random choice comes from one `StdRng` seeded from
//! [`SimulatorConfig::seed`], so a failing run replays exactly.  Each
//! segment is encoded and decoded on its way through, and every transmission
//! is recorded with its [`Fate`] for later inspection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;

use crate::segment::Segment;
use crate::socket::DatagramSender;

/// Configuration for the fault-injection model.
///
/// All probabilities are in the range `[0.0, 1.0]`.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Probability that any given packet is silently dropped.
    pub loss_rate: f64,
    /// Probability that a packet is reordered.
    pub reorder_rate: f64,
    /// Fixed delay applied to reordered packets.
    pub reorder_delay: Duration,
    /// Probability that a packet is duplicated.
    pub duplicate_rate: f64,
    /// Seed for every random decision.
    pub seed: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        // No faults by default: the simulator is a transparent pass-through.
        Self {
            loss_rate: 0.0,
            reorder_rate: 0.0,
            reorder_delay: Duration::ZERO,
            duplicate_rate: 0.0,
            seed: 0,
        }
    }
}

/// What the network did with one transmitted segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fate {
    Delivered,
    Dropped,
    Duplicated,
    Delayed,
    /// No host is attached at the destination address.
    Unroutable,
}

/// One segment as it entered the network.
#[derive(Debug, Clone)]
pub struct Transmission {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub segment: Segment,
    pub fate: Fate,
}

type Delivery = (Segment, SocketAddr);

struct DropRule {
    remaining: usize,
    matches: Box<dyn Fn(&Segment) -> bool + Send>,
}

struct Network {
    config: SimulatorConfig,
    rng: StdRng,
    hosts: HashMap<SocketAddr, mpsc::UnboundedSender<Delivery>>,
    rules: Vec<DropRule>,
    history: Vec<Transmission>,
}

impl Network {
    fn chance(&mut self, p: f64) -> bool {
        p > 0.0 && self.rng.random_bool(p.min(1.0))
    }

    fn decide(&mut self, segment: &Segment) -> Fate {
        if let Some(i) = self.rules.iter().position(|r| (r.matches)(segment)) {
            self.rules[i].remaining -= 1;
            if self.rules[i].remaining == 0 {
                self.rules.remove(i);
            }
            return Fate::Dropped;
        }
        let (loss, dup, reorder) = (
            self.config.loss_rate,
            self.config.duplicate_rate,
            self.config.reorder_rate,
        );
        if self.chance(loss) {
            Fate::Dropped
        } else if self.chance(dup) {
            Fate::Duplicated
        } else if self.chance(reorder) {
            Fate::Delayed
        } else {
            Fate::Delivered
        }
    }
}

/// A shared simulated network.  Clones refer to the same network.
#[derive(Clone)]
pub struct Simulator {
    net: Arc<Mutex<Network>>,
}

impl Simulator {
    pub fn new(config: SimulatorConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            net: Arc::new(Mutex::new(Network {
                config,
                rng,
                hosts: HashMap::new(),
                rules: Vec::new(),
                history: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Network> {
        self.net.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attach a host at `addr`, returning its send and receive halves.
    ///
    /// Re-attaching an address replaces the previous host.
    pub fn attach(&self, addr: SocketAddr) -> (SimLink, SimInbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().hosts.insert(addr, tx);
        (
            SimLink {
                addr,
                sim: self.clone(),
            },
            SimInbox { rx },
        )
    }

    /// Drop the next `count` segments for which `matches` returns `true`.
    ///
    /// Rules are consulted in the order they were added, before the random
    /// fault model.
    pub fn drop_next<F>(&self, count: usize, matches: F)
    where
        F: Fn(&Segment) -> bool + Send + 'static,
    {
        if count == 0 {
            return;
        }
        self.lock().rules.push(DropRule {
            remaining: count,
            matches: Box::new(matches),
        });
    }

    /// Every transmission so far, oldest first.
    pub fn history(&self) -> Vec<Transmission> {
        self.lock().history.clone()
    }

    /// How many transmissions satisfy `pred`.
    pub fn count<F>(&self, pred: F) -> usize
    where
        F: Fn(&Transmission) -> bool,
    {
        self.lock().history.iter().filter(|t| pred(t)).count()
    }

    fn transmit(&self, segment: &Segment, from: SocketAddr, to: SocketAddr) {
        let segment = match segment.encode().and_then(|bytes| Segment::decode(&bytes)) {
            Ok(s) => s,
            Err(e) => {
                log::warn!("[sim] {from} -> {to}: unencodable segment: {e}");
                return;
            }
        };

        let mut net = self.lock();
        let inbox = net.hosts.get(&to).cloned();
        let fate = match inbox {
            Some(_) => net.decide(&segment),
            None => Fate::Unroutable,
        };
        log::trace!("[sim] {from} -> {to}: {segment} {fate:?}");
        net.history.push(Transmission {
            from,
            to,
            segment: segment.clone(),
            fate,
        });
        let delay = net.config.reorder_delay;
        drop(net);

        let Some(inbox) = inbox else {
            return;
        };
        match fate {
            Fate::Dropped | Fate::Unroutable => {}
            Fate::Delivered => {
                let _ = inbox.send((segment, from));
            }
            Fate::Duplicated => {
                let _ = inbox.send((segment.clone(), from));
                let _ = inbox.send((segment, from));
            }
            Fate::Delayed => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = inbox.send((segment, from));
                });
            }
        }
    }
}

/// Send half of a simulated host.
#[derive(Clone)]
pub struct SimLink {
    addr: SocketAddr,
    sim: Simulator,
}

impl DatagramSender for SimLink {
    fn send(&self, segment: &Segment, dest: SocketAddr) {
        self.sim.transmit(segment, self.addr, dest);
    }
}

/// Receive half of a simulated host.
pub struct SimInbox {
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl SimInbox {
    /// The next segment delivered to this host and its sender's address.
    ///
    /// `None` once the host has been replaced or the network dropped.
    pub async fn recv(&mut self) -> Option<(Segment, SocketAddr)> {
        self.rx.recv().await
    }
}
