//! Rank-to-rank message passing used by the distributed particle store.
//!
//! A [`Communicator`] only has to provide blocking point-to-point transfer of
//! byte payloads. Every collective the store needs (broadcast, gather,
//! scatter, all-to-all, all-reduce) has a default implementation on top of
//! that, which a transport may override. All collectives must be entered by
//! every rank in the same order.
//!
//! Two transports ship with the crate:
//!
//! - [`SerialCommunicator`] for a single rank
//! - [`LocalCluster`] for several ranks running as threads of one process

mod error;
mod local;
mod serial;

pub use error::CommError;
pub use local::{LocalCluster, LocalCommunicator};
pub use serial::SerialCommunicator;

use bytemuck::Pod;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Channel on which a message travels.
///
/// Messages between a fixed pair of ranks with the same tag are delivered in
/// the order they were sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageTag {
    Broadcast,
    Gather,
    Scatter,
    AllToAll,
    /// Application-defined point-to-point channel.
    User(u32),
}

/// Blocking message passing between a fixed set of ranks.
pub trait Communicator {
    /// Rank of the calling process, in `0..size()`.
    fn rank(&self) -> u32;

    /// Number of ranks.
    fn size(&self) -> u32;

    /// Sends `payload` to `dest`. Does not wait for the receiver.
    fn send(&self, dest: u32, tag: MessageTag, payload: Vec<u8>) -> Result<(), CommError>;

    /// Blocks until a message from `source` on `tag` arrives.
    fn recv(&self, source: u32, tag: MessageTag) -> Result<Vec<u8>, CommError>;

    /// Distributes the root's payload to every rank; non-root payloads are
    /// ignored.
    fn broadcast(&self, root: u32, payload: Vec<u8>) -> Result<Vec<u8>, CommError> {
        check_rank(self, root)?;
        if self.rank() != root {
            return self.recv(root, MessageTag::Broadcast);
        }
        for dest in (0..self.size()).filter(|&r| r != root) {
            self.send(dest, MessageTag::Broadcast, payload.clone())?;
        }
        Ok(payload)
    }

    /// Collects one payload per rank on `root`, ordered by rank.
    ///
    /// Returns `None` on every rank except the root.
    fn gather(&self, root: u32, payload: Vec<u8>) -> Result<Option<Vec<Vec<u8>>>, CommError> {
        check_rank(self, root)?;
        if self.rank() != root {
            self.send(root, MessageTag::Gather, payload)?;
            return Ok(None);
        }
        let mut own = Some(payload);
        let mut parts = Vec::with_capacity(self.size() as usize);
        for source in 0..self.size() {
            if source == root {
                parts.push(own.take().unwrap_or_default());
            } else {
                parts.push(self.recv(source, MessageTag::Gather)?);
            }
        }
        Ok(Some(parts))
    }

    /// Hands part `r` of the root's parts to rank `r`.
    ///
    /// Only the root's `parts` are read; it must hold one entry per rank.
    fn scatter(&self, root: u32, parts: Option<Vec<Vec<u8>>>) -> Result<Vec<u8>, CommError> {
        check_rank(self, root)?;
        if self.rank() != root {
            return self.recv(root, MessageTag::Scatter);
        }
        let parts = parts.unwrap_or_default();
        if parts.len() != self.size() as usize {
            return Err(CommError::PartCount {
                expected: self.size() as usize,
                got: parts.len(),
            });
        }
        let mut own = Vec::new();
        for (dest, part) in (0..self.size()).zip(parts) {
            if dest == root {
                own = part;
            } else {
                self.send(dest, MessageTag::Scatter, part)?;
            }
        }
        Ok(own)
    }

    /// Sends `outgoing[r]` to rank `r` and returns what every rank sent to
    /// the caller, ordered by source rank.
    fn all_to_all(&self, outgoing: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>, CommError> {
        if outgoing.len() != self.size() as usize {
            return Err(CommError::PartCount {
                expected: self.size() as usize,
                got: outgoing.len(),
            });
        }
        let me = self.rank();
        let mut own = Vec::new();
        for (dest, part) in (0..self.size()).zip(outgoing) {
            if dest == me {
                own = part;
            } else {
                self.send(dest, MessageTag::AllToAll, part)?;
            }
        }
        let mut own = Some(own);
        let mut incoming = Vec::with_capacity(self.size() as usize);
        for source in 0..self.size() {
            if source == me {
                incoming.push(own.take().unwrap_or_default());
            } else {
                incoming.push(self.recv(source, MessageTag::AllToAll)?);
            }
        }
        Ok(incoming)
    }

    /// Sum of `value` over all ranks, returned on every rank.
    fn all_reduce_sum(&self, value: u64) -> Result<u64, CommError> {
        let gathered = self.gather_pod(0, &[value])?;
        let total = gathered.map(|parts| parts.iter().flatten().sum::<u64>());
        self.broadcast_pod(0, total.unwrap_or_default())
    }

    /// Maximum of `value` over all ranks, returned on every rank.
    fn all_reduce_max(&self, value: i64) -> Result<i64, CommError> {
        let gathered = self.gather_pod(0, &[value])?;
        let max = gathered.and_then(|parts| parts.iter().flatten().copied().max());
        self.broadcast_pod(0, max.unwrap_or(value))
    }
}

/// Typed helpers layered over the byte-level [`Communicator`] operations.
pub trait CommunicatorExt: Communicator {
    fn send_pod<T: Pod>(&self, dest: u32, tag: MessageTag, values: &[T]) -> Result<(), CommError> {
        self.send(dest, tag, bytemuck::cast_slice::<T, u8>(values).to_vec())
    }

    fn recv_pod<T: Pod>(&self, source: u32, tag: MessageTag) -> Result<Vec<T>, CommError> {
        decode_pod(&self.recv(source, tag)?)
    }

    fn broadcast_pod<T: Pod>(&self, root: u32, value: T) -> Result<T, CommError> {
        let bytes = self.broadcast(root, bytemuck::bytes_of(&value).to_vec())?;
        decode_one(&bytes)
    }

    /// Broadcasts a structured value from `root` as JSON.
    fn broadcast_value<T: Serialize + DeserializeOwned>(
        &self,
        root: u32,
        value: &T,
    ) -> Result<T, CommError> {
        let payload = if self.rank() == root {
            serde_json::to_vec(value)?
        } else {
            Vec::new()
        };
        let bytes = self.broadcast(root, payload)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn gather_pod<T: Pod>(&self, root: u32, values: &[T]) -> Result<Option<Vec<Vec<T>>>, CommError> {
        let gathered = self.gather(root, bytemuck::cast_slice::<T, u8>(values).to_vec())?;
        gathered
            .map(|parts| parts.iter().map(|p| decode_pod(p)).collect::<Result<Vec<_>, _>>())
            .transpose()
    }

    fn scatter_pod<T: Pod>(&self, root: u32, parts: Option<Vec<Vec<T>>>) -> Result<Vec<T>, CommError> {
        let parts = parts.map(|parts| {
            parts
                .iter()
                .map(|p| bytemuck::cast_slice::<T, u8>(p).to_vec())
                .collect()
        });
        decode_pod(&self.scatter(root, parts)?)
    }

    fn all_to_all_pod<T: Pod>(&self, outgoing: Vec<Vec<T>>) -> Result<Vec<Vec<T>>, CommError> {
        let outgoing = outgoing
            .iter()
            .map(|p| bytemuck::cast_slice::<T, u8>(p).to_vec())
            .collect();
        self.all_to_all(outgoing)?
            .iter()
            .map(|p| decode_pod(p))
            .collect()
    }
}

impl<C: Communicator + ?Sized> CommunicatorExt for C {}

/// Reinterprets a byte payload as a sequence of plain-old-data records.
///
/// The payload need not be aligned for `T`.
pub fn decode_pod<T: Pod>(bytes: &[u8]) -> Result<Vec<T>, CommError> {
    let record_size = std::mem::size_of::<T>();
    if record_size == 0 || bytes.len() % record_size != 0 {
        return Err(CommError::PayloadLength {
            len: bytes.len(),
            record_size,
        });
    }
    Ok(bytes
        .chunks_exact(record_size)
        .map(bytemuck::pod_read_unaligned)
        .collect())
}

fn decode_one<T: Pod>(bytes: &[u8]) -> Result<T, CommError> {
    match decode_pod::<T>(bytes)?.as_slice() {
        [value] => Ok(*value),
        _ => Err(CommError::PayloadLength {
            len: bytes.len(),
            record_size: std::mem::size_of::<T>(),
        }),
    }
}

fn check_rank<C: Communicator + ?Sized>(comm: &C, rank: u32) -> Result<(), CommError> {
    if rank < comm.size() {
        Ok(())
    } else {
        Err(CommError::InvalidRank {
            rank,
            size: comm.size(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_pod_rejects_partial_records() {
        let bytes = [0u8; 12];
        assert_eq!(
            decode_pod::<u64>(&bytes),
            Err(CommError::PayloadLength {
                len: 12,
                record_size: 8
            })
        );
        assert_eq!(decode_pod::<u32>(&bytes).unwrap(), vec![0, 0, 0]);
    }

    #[test]
    fn decode_pod_accepts_empty_payload() {
        assert!(decode_pod::<u64>(&[]).unwrap().is_empty());
    }

    #[test]
    fn decode_one_requires_exactly_one_record() {
        assert_eq!(decode_one::<u32>(&7u32.to_ne_bytes()).unwrap(), 7);
        assert!(decode_one::<u32>(&[]).is_err());
        assert!(decode_one::<u32>(&[0u8; 8]).is_err());
    }
}
