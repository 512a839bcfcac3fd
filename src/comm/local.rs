use super::{CommError, Communicator, MessageTag};
use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::Duration;

/// How often a blocked receive re-checks whether its peer is still alive.
const LIVENESS_POLL: Duration = Duration::from_millis(20);

struct Envelope {
    source: u32,
    tag: MessageTag,
    payload: Vec<u8>,
}

/// Several ranks running as threads of one process, connected by channels.
pub struct LocalCluster;

impl LocalCluster {
    /// Creates one connected communicator per rank.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    pub fn communicators(size: u32) -> Vec<LocalCommunicator> {
        assert!(size > 0, "a cluster needs at least one rank");
        let (senders, inboxes): (Vec<_>, Vec<_>) =
            (0..size).map(|_| mpsc::channel::<Envelope>()).unzip();
        let alive: Arc<Vec<AtomicBool>> =
            Arc::new((0..size).map(|_| AtomicBool::new(true)).collect());

        inboxes
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| LocalCommunicator {
                rank: rank as u32,
                size,
                senders: senders.clone(),
                inbox,
                pending: RefCell::new(Vec::new()),
                alive: Arc::clone(&alive),
            })
            .collect()
    }

    /// Runs `f` once per rank, each on its own thread, and returns the
    /// results ordered by rank.
    ///
    /// A panic on any rank is re-raised on the calling thread after every
    /// rank has finished.
    pub fn run<F, R>(size: u32, f: F) -> Vec<R>
    where
        F: Fn(LocalCommunicator) -> R + Sync,
        R: Send,
    {
        let comms = Self::communicators(size);
        let f = &f;
        thread::scope(|scope| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| scope.spawn(move || f(comm)))
                .collect();
            let joined: Vec<_> = handles.into_iter().map(|h| h.join()).collect();
            joined
                .into_iter()
                .map(|result| result.unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect()
        })
    }
}

/// One rank's endpoint in a [`LocalCluster`].
pub struct LocalCommunicator {
    rank: u32,
    size: u32,
    senders: Vec<Sender<Envelope>>,
    inbox: Receiver<Envelope>,
    // received but not yet claimed, in arrival order
    pending: RefCell<Vec<Envelope>>,
    alive: Arc<Vec<AtomicBool>>,
}

impl LocalCommunicator {
    fn take_pending(&self, source: u32, tag: MessageTag) -> Option<Vec<u8>> {
        let mut pending = self.pending.borrow_mut();
        let pos = pending
            .iter()
            .position(|e| e.source == source && e.tag == tag)?;
        Some(pending.remove(pos).payload)
    }

    fn check_rank(&self, rank: u32) -> Result<(), CommError> {
        if rank < self.size {
            Ok(())
        } else {
            Err(CommError::InvalidRank {
                rank,
                size: self.size,
            })
        }
    }
}

impl Communicator for LocalCommunicator {
    fn rank(&self) -> u32 {
        self.rank
    }

    fn size(&self) -> u32 {
        self.size
    }

    fn send(&self, dest: u32, tag: MessageTag, payload: Vec<u8>) -> Result<(), CommError> {
        self.check_rank(dest)?;
        let envelope = Envelope {
            source: self.rank,
            tag,
            payload,
        };
        self.senders[dest as usize]
            .send(envelope)
            .map_err(|_| CommError::Disconnected { rank: dest })
    }

    fn recv(&self, source: u32, tag: MessageTag) -> Result<Vec<u8>, CommError> {
        self.check_rank(source)?;
        if let Some(payload) = self.take_pending(source, tag) {
            return Ok(payload);
        }
        loop {
            match self.inbox.recv_timeout(LIVENESS_POLL) {
                Ok(envelope) if envelope.source == source && envelope.tag == tag => {
                    return Ok(envelope.payload);
                }
                Ok(envelope) => self.pending.borrow_mut().push(envelope),
                Err(RecvTimeoutError::Timeout) => {
                    if !self.alive[source as usize].load(Ordering::Acquire) {
                        // the peer may have sent right before leaving
                        while let Ok(envelope) = self.inbox.try_recv() {
                            self.pending.borrow_mut().push(envelope);
                        }
                        return self
                            .take_pending(source, tag)
                            .ok_or(CommError::Disconnected { rank: source });
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(CommError::Disconnected { rank: source });
                }
            }
        }
    }
}

impl Drop for LocalCommunicator {
    fn drop(&mut self) {
        self.alive[self.rank as usize].store(false, Ordering::Release);
    }
}
