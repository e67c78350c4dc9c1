// SPDX-License-Identifier: AGPL-3.0-or-later

//! Collective operations over the substrate: split-send and
//! receive-merge.
//!
//! A stage hands its outgoing token to [`split_send`], which partitions
//! the payload across the destination ranks, stamps every part with the
//! originating status, and issues one async send per destination through
//! the [`SendSlots`] discipline. On the receiving side, [`receive_merge`]
//! folds one incoming part per source rank into an accumulator token,
//! adopting the (shared) originating status. Together they make the
//! fan-out/fan-in between stages transparent to the stage code.

use crate::token::{Merge, Split, Status, Token};
use crate::transport::{Result, SendSlots, Substrate, TransportError};

/// Payloads that can cross the substrate as bytes.
pub trait Wire: Sized {
    /// Serialise to a byte buffer.
    fn to_bytes(&self) -> Vec<u8>;
    /// Deserialise from a byte buffer.
    fn from_bytes(bytes: &[u8]) -> Option<Self>;
}

impl Wire for Vec<u8> {
    fn to_bytes(&self) -> Vec<u8> {
        self.clone()
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        Some(bytes.to_vec())
    }
}

const STATUS_DATA: u8 = 0;
const STATUS_EOF: u8 = 1;
const STATUS_FLUSH: u8 = 2;

fn encode<T: Wire>(token: &Token<T>) -> Vec<u8> {
    let status = match token.status {
        Status::Data => STATUS_DATA,
        Status::Eof => STATUS_EOF,
        Status::Flush => STATUS_FLUSH,
    };
    let mut out = vec![status];
    out.extend_from_slice(&token.payload.to_bytes());
    out
}

fn decode<T: Wire>(bytes: &[u8]) -> Result<Token<T>> {
    let (&status_byte, payload_bytes) = bytes
        .split_first()
        .ok_or(TransportError::InvalidCount)?;
    let status = match status_byte {
        STATUS_DATA => Status::Data,
        STATUS_EOF => Status::Eof,
        STATUS_FLUSH => Status::Flush,
        _ => return Err(TransportError::InvalidDatatype),
    };
    let payload = T::from_bytes(payload_bytes).ok_or(TransportError::InvalidDatatype)?;
    Ok(Token { payload, status })
}

/// Split a token across `dests` and async-send one part to each, the
/// originating status stamped on every part.
///
/// # Errors
///
/// Propagates substrate failures from the per-destination sends.
pub fn split_send<T, S>(
    token: Token<T>,
    dests: &[u32],
    substrate: &mut S,
    slots: &mut SendSlots,
) -> Result<()>
where
    T: Split + Wire,
    S: Substrate,
{
    let parts = crate::token::split_token(token, dests.len());
    for (part, &dest) in parts.iter().zip(dests) {
        slots.isend(substrate, dest, encode(part))?;
    }
    Ok(())
}

/// Receive one part from every source rank and fold them into `acc`,
/// adopting the parts' status.
///
/// # Errors
///
/// Propagates substrate failures and malformed frames.
pub fn receive_merge<T, S>(acc: &mut Token<T>, sources: &[u32], substrate: &mut S) -> Result<()>
where
    T: Merge + Wire,
    S: Substrate,
{
    for &source in sources {
        let size = substrate.probe(source)?;
        let bytes = substrate.recv(source)?;
        debug_assert_eq!(size, bytes.len());
        let part: Token<T> = decode(&bytes)?;
        acc.status = part.status;
        acc.payload.merge(part.payload);
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::transport::Loopback;
    use std::thread;

    #[test]
    fn roundtrip_preserves_status_and_payload() {
        for status in [Status::Data, Status::Eof, Status::Flush] {
            let token = Token {
                payload: vec![1u8, 2, 3],
                status,
            };
            let decoded: Token<Vec<u8>> = decode(&encode(&token)).expect("decode");
            assert_eq!(decoded.status, status);
            assert_eq!(decoded.payload, vec![1, 2, 3]);
        }
    }

    #[test]
    fn empty_frame_is_invalid() {
        assert!(decode::<Vec<u8>>(&[]).is_err());
        assert!(decode::<Vec<u8>>(&[9]).is_err());
    }

    #[test]
    fn split_send_receive_merge_across_ranks() {
        let mut cluster = Loopback::cluster(3);
        let mut rank2 = cluster.pop().expect("rank 2");
        let mut rank1 = cluster.pop().expect("rank 1");
        let mut rank0 = cluster.pop().expect("rank 0");

        let worker1 = thread::spawn(move || {
            let mut acc = Token::data(Vec::new());
            receive_merge(&mut acc, &[0], &mut rank1).expect("merge at rank 1");
            acc
        });
        let worker2 = thread::spawn(move || {
            let mut acc = Token::data(Vec::new());
            receive_merge(&mut acc, &[0], &mut rank2).expect("merge at rank 2");
            acc
        });

        let token = Token::eof(vec![10u8, 20, 30, 40, 50]);
        let mut slots = SendSlots::new();
        split_send(token, &[1, 2], &mut rank0, &mut slots).expect("split send");
        slots.wait_all(&mut rank0).expect("drain slots");

        let at1 = worker1.join().expect("join 1");
        let at2 = worker2.join().expect("join 2");
        assert_eq!(at1.status, Status::Eof, "status must survive the split");
        assert_eq!(at2.status, Status::Eof);
        let mut all = at1.payload;
        all.extend(at2.payload);
        all.sort_unstable();
        assert_eq!(all, vec![10, 20, 30, 40, 50]);
    }

    #[test]
    fn receive_merge_accumulates_multiple_sources() {
        let mut cluster = Loopback::cluster(3);
        let mut rank2 = cluster.pop().expect("rank 2");
        let mut rank1 = cluster.pop().expect("rank 1");
        let mut rank0 = cluster.pop().expect("rank 0");

        let sender1 = thread::spawn(move || {
            rank1
                .send(0, encode(&Token::data(vec![1u8])))
                .expect("send from 1");
        });
        let sender2 = thread::spawn(move || {
            rank2
                .send(0, encode(&Token::data(vec![2u8])))
                .expect("send from 2");
        });
        sender1.join().expect("join 1");
        sender2.join().expect("join 2");

        let mut acc = Token::data(Vec::new());
        receive_merge(&mut acc, &[1, 2], &mut rank0).expect("merge");
        let mut got = acc.payload;
        got.sort_unstable();
        assert_eq!(got, vec![1, 2]);
    }
}
