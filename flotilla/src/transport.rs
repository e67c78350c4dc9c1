// SPDX-License-Identifier: AGPL-3.0-or-later

//! Message-passing substrate — the seam between pipeline and cluster.
//!
//! The placement pipeline needs five operations from its communication
//! layer: blocking send, immediate synchronous send, blocking metadata
//! probe, receive, and wait. [`Substrate`] captures exactly those, with
//! integer error codes of the underlying layer mapped into
//! [`TransportError`].
//!
//! [`Loopback`] is the in-process implementation: every rank is a thread
//! and rank-to-rank links are channels. It backs single-node runs and all
//! tests; a cluster binding (MPI or similar) implements the same trait.
//!
//! # Send discipline
//!
//! Asynchronous senders track *one outstanding request per destination*
//! ([`SendSlots`]): before a new send to `dest` is issued, the previous
//! in-flight send to `dest` is awaited. This bounds per-rank send buffers
//! at one message per destination and keeps memory flat under load.

use std::collections::HashMap;
use std::fmt;
use std::sync::mpsc::{Receiver, Sender, channel};

/// Error taxonomy of the message-passing layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// Invalid communicator.
    InvalidCommunicator,
    /// Invalid datatype argument.
    InvalidDatatype,
    /// Invalid count argument.
    InvalidCount,
    /// Invalid tag argument.
    InvalidTag,
    /// Invalid source or destination rank.
    InvalidRank,
    /// Any other substrate failure, with the raw code.
    Unknown(i32),
}

/// Result alias for substrate operations.
pub type Result<T> = std::result::Result<T, TransportError>;

// raw error codes of the substrate's C ABI
const ERR_COUNT: i32 = 2;
const ERR_TYPE: i32 = 3;
const ERR_TAG: i32 = 4;
const ERR_COMM: i32 = 5;
const ERR_RANK: i32 = 6;

impl From<i32> for TransportError {
    fn from(code: i32) -> Self {
        match code {
            ERR_COMM => Self::InvalidCommunicator,
            ERR_TYPE => Self::InvalidDatatype,
            ERR_COUNT => Self::InvalidCount,
            ERR_TAG => Self::InvalidTag,
            ERR_RANK => Self::InvalidRank,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidCommunicator => write!(f, "invalid communicator"),
            Self::InvalidDatatype => write!(f, "invalid datatype argument"),
            Self::InvalidCount => write!(f, "invalid count argument"),
            Self::InvalidTag => write!(f, "invalid tag argument"),
            Self::InvalidRank => write!(f, "invalid source or destination rank"),
            Self::Unknown(code) => write!(f, "unknown transport failure (code {code})"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Handle for an immediate send that has not yet completed.
///
/// Completion means the receiving rank has started taking the message.
#[derive(Debug)]
pub struct InFlight {
    ack: Receiver<()>,
}

impl InFlight {
    /// Wrap a completion channel. Substrate implementations signal
    /// completion by sending `()` on the paired [`Sender`].
    #[must_use]
    pub fn from_ack(ack: Receiver<()>) -> Self {
        Self { ack }
    }
}

/// The five operations the pipeline requires of its communication layer.
pub trait Substrate {
    /// Blocking send of `payload` to `dest`.
    fn send(&mut self, dest: u32, payload: Vec<u8>) -> Result<()>;

    /// Immediate synchronous send; completes once the receiver matches it.
    fn issend(&mut self, dest: u32, payload: Vec<u8>) -> Result<InFlight>;

    /// Blocking metadata peek: byte size of the next message from `source`
    /// without consuming it.
    fn probe(&mut self, source: u32) -> Result<usize>;

    /// Blocking receive of the next message from `source`.
    fn recv(&mut self, source: u32) -> Result<Vec<u8>>;

    /// Block until an in-flight send has completed.
    fn wait(&mut self, inflight: InFlight) -> Result<()>;
}

/// One-outstanding-request-per-destination bookkeeping for async sends.
#[derive(Debug, Default)]
pub struct SendSlots {
    slots: HashMap<u32, InFlight>,
}

impl SendSlots {
    /// Fresh slot table with nothing in flight.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Async-send `payload` to `dest`, first awaiting any previous
    /// in-flight send to the same destination.
    ///
    /// # Errors
    ///
    /// Propagates substrate failures from the wait or the send.
    pub fn isend<S: Substrate>(
        &mut self,
        substrate: &mut S,
        dest: u32,
        payload: Vec<u8>,
    ) -> Result<()> {
        if let Some(prev) = self.slots.remove(&dest) {
            substrate.wait(prev)?;
        }
        let inflight = substrate.issend(dest, payload)?;
        self.slots.insert(dest, inflight);
        Ok(())
    }

    /// Await every outstanding send.
    ///
    /// # Errors
    ///
    /// Propagates the first substrate failure; remaining slots are dropped.
    pub fn wait_all<S: Substrate>(&mut self, substrate: &mut S) -> Result<()> {
        for (_, inflight) in self.slots.drain() {
            substrate.wait(inflight)?;
        }
        Ok(())
    }

    /// Number of destinations with a send in flight.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.slots.len()
    }
}

struct Message {
    payload: Vec<u8>,
    ack: Sender<()>,
}

/// One rank's endpoint of an in-process loopback cluster.
///
/// Links are channels; `issend` completes when the destination rank takes
/// the message out of its link (probe alone does not complete it).
pub struct Loopback {
    rank: u32,
    outgoing: Vec<Sender<Message>>,
    incoming: Vec<Receiver<Message>>,
    peeked: Vec<Option<Message>>,
}

impl Loopback {
    /// Build a fully connected cluster of `ranks` endpoints. Endpoint `i`
    /// of the returned vector belongs to rank `i`; move each into its own
    /// thread.
    #[must_use]
    pub fn cluster(ranks: usize) -> Vec<Self> {
        // links[src][dest]
        let mut senders: Vec<Vec<Sender<Message>>> = Vec::with_capacity(ranks);
        let mut receivers: Vec<Vec<Receiver<Message>>> = (0..ranks).map(|_| Vec::new()).collect();

        for _src in 0..ranks {
            let mut row = Vec::with_capacity(ranks);
            for dest_links in receivers.iter_mut() {
                let (tx, rx) = channel();
                row.push(tx);
                dest_links.push(rx);
            }
            senders.push(row);
        }

        senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (outgoing, incoming))| Self {
                #[allow(clippy::cast_possible_truncation)] // rank counts are small
                rank: rank as u32,
                outgoing,
                incoming,
                peeked: (0..ranks).map(|_| None).collect(),
            })
            .collect()
    }

    /// This endpoint's rank id.
    #[must_use]
    pub fn rank(&self) -> u32 {
        self.rank
    }

    /// Number of ranks in the cluster.
    #[must_use]
    pub fn ranks(&self) -> usize {
        self.outgoing.len()
    }

    fn link_to(&self, dest: u32) -> Result<&Sender<Message>> {
        self.outgoing
            .get(dest as usize)
            .ok_or(TransportError::InvalidRank)
    }

    fn fill_peek(&mut self, source: u32) -> Result<()> {
        let src = source as usize;
        if src >= self.incoming.len() {
            return Err(TransportError::InvalidRank);
        }
        if self.peeked[src].is_none() {
            let msg = self.incoming[src]
                .recv()
                .map_err(|_| TransportError::Unknown(-1))?;
            self.peeked[src] = Some(msg);
        }
        Ok(())
    }
}

impl Substrate for Loopback {
    fn send(&mut self, dest: u32, payload: Vec<u8>) -> Result<()> {
        let (ack, _ack_rx) = channel();
        self.link_to(dest)?
            .send(Message { payload, ack })
            .map_err(|_| TransportError::Unknown(-1))
    }

    fn issend(&mut self, dest: u32, payload: Vec<u8>) -> Result<InFlight> {
        let (ack, ack_rx) = channel();
        self.link_to(dest)?
            .send(Message { payload, ack })
            .map_err(|_| TransportError::Unknown(-1))?;
        Ok(InFlight::from_ack(ack_rx))
    }

    fn probe(&mut self, source: u32) -> Result<usize> {
        self.fill_peek(source)?;
        let src = source as usize;
        Ok(self.peeked[src].as_ref().map_or(0, |m| m.payload.len()))
    }

    fn recv(&mut self, source: u32) -> Result<Vec<u8>> {
        self.fill_peek(source)?;
        let src = source as usize;
        let msg = self.peeked[src]
            .take()
            .ok_or(TransportError::Unknown(-1))?;
        // sender may have already given up waiting; that is not our error
        let _ = msg.ack.send(());
        Ok(msg.payload)
    }

    fn wait(&mut self, inflight: InFlight) -> Result<()> {
        inflight
            .ack
            .recv()
            .map_err(|_| TransportError::Unknown(-1))
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn error_codes_map_to_taxonomy() {
        assert_eq!(TransportError::from(5), TransportError::InvalidCommunicator);
        assert_eq!(TransportError::from(3), TransportError::InvalidDatatype);
        assert_eq!(TransportError::from(2), TransportError::InvalidCount);
        assert_eq!(TransportError::from(4), TransportError::InvalidTag);
        assert_eq!(TransportError::from(6), TransportError::InvalidRank);
        assert_eq!(TransportError::from(99), TransportError::Unknown(99));
    }

    #[test]
    fn display_names_every_kind() {
        let kinds = [
            TransportError::InvalidCommunicator,
            TransportError::InvalidDatatype,
            TransportError::InvalidCount,
            TransportError::InvalidTag,
            TransportError::InvalidRank,
            TransportError::Unknown(7),
        ];
        for kind in kinds {
            assert!(!kind.to_string().is_empty());
        }
    }

    #[test]
    fn send_and_recv_between_two_ranks() {
        let mut cluster = Loopback::cluster(2);
        let mut rank1 = cluster.pop().expect("rank 1");
        let mut rank0 = cluster.pop().expect("rank 0");

        let worker = thread::spawn(move || {
            rank1.recv(0).expect("payload from rank 0")
        });

        rank0.send(1, vec![1, 2, 3]).expect("send ok");
        assert_eq!(worker.join().expect("join"), vec![1, 2, 3]);
    }

    #[test]
    fn probe_reports_size_without_consuming() {
        let mut cluster = Loopback::cluster(2);
        let mut rank1 = cluster.pop().expect("rank 1");
        let mut rank0 = cluster.pop().expect("rank 0");

        rank0.send(1, vec![9; 42]).expect("send ok");
        assert_eq!(rank1.probe(0).expect("probe"), 42);
        assert_eq!(rank1.probe(0).expect("probe again"), 42);
        assert_eq!(rank1.recv(0).expect("recv").len(), 42);
    }

    #[test]
    fn issend_completes_when_received() {
        let mut cluster = Loopback::cluster(2);
        let mut rank1 = cluster.pop().expect("rank 1");
        let mut rank0 = cluster.pop().expect("rank 0");

        let inflight = rank0.issend(1, vec![5, 5]).expect("issend");
        let receiver = thread::spawn(move || rank1.recv(0).expect("recv"));
        rank0.wait(inflight).expect("wait for ack");
        assert_eq!(receiver.join().expect("join"), vec![5, 5]);
    }

    #[test]
    fn invalid_rank_is_rejected() {
        let mut cluster = Loopback::cluster(1);
        let mut rank0 = cluster.pop().expect("rank 0");
        assert_eq!(
            rank0.send(3, vec![]).unwrap_err(),
            TransportError::InvalidRank
        );
        assert_eq!(rank0.probe(3).unwrap_err(), TransportError::InvalidRank);
    }

    #[test]
    fn send_slots_hold_one_request_per_destination() {
        let mut cluster = Loopback::cluster(2);
        let mut rank1 = cluster.pop().expect("rank 1");
        let mut rank0 = cluster.pop().expect("rank 0");

        let receiver = thread::spawn(move || {
            let first = rank1.recv(0).expect("first");
            let second = rank1.recv(0).expect("second");
            (first, second)
        });

        let mut slots = SendSlots::new();
        slots.isend(&mut rank0, 1, vec![1]).expect("first isend");
        assert_eq!(slots.outstanding(), 1);
        // awaits the first send before issuing the second
        slots.isend(&mut rank0, 1, vec![2]).expect("second isend");
        assert_eq!(slots.outstanding(), 1);
        slots.wait_all(&mut rank0).expect("drain");
        assert_eq!(slots.outstanding(), 0);

        let (first, second) = receiver.join().expect("join");
        assert_eq!(first, vec![1]);
        assert_eq!(second, vec![2]);
    }

    #[test]
    fn self_send_roundtrips() {
        let mut cluster = Loopback::cluster(1);
        let mut rank0 = cluster.pop().expect("rank 0");
        rank0.send(0, vec![7]).expect("send to self");
        assert_eq!(rank0.recv(0).expect("recv from self"), vec![7]);
    }
}
