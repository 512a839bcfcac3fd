use super::{CommError, Communicator, MessageTag};
use std::cell::RefCell;
use std::collections::VecDeque;

/// Communicator for a single rank.
///
/// Messages addressed to rank 0 are queued and handed back by `recv`, so
/// every collective degenerates to a local copy.
#[derive(Debug, Default)]
pub struct SerialCommunicator {
    mailbox: RefCell<VecDeque<(MessageTag, Vec<u8>)>>,
}

impl SerialCommunicator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Communicator for SerialCommunicator {
    fn rank(&self) -> u32 {
        0
    }

    fn size(&self) -> u32 {
        1
    }

    fn send(&self, dest: u32, tag: MessageTag, payload: Vec<u8>) -> Result<(), CommError> {
        if dest != 0 {
            return Err(CommError::InvalidRank { rank: dest, size: 1 });
        }
        self.mailbox.borrow_mut().push_back((tag, payload));
        Ok(())
    }

    fn recv(&self, source: u32, tag: MessageTag) -> Result<Vec<u8>, CommError> {
        if source != 0 {
            return Err(CommError::InvalidRank {
                rank: source,
                size: 1,
            });
        }
        let mut mailbox = self.mailbox.borrow_mut();
        let pos = mailbox
            .iter()
            .position(|(t, _)| *t == tag)
            // nothing queued means the call would block forever
            .ok_or(CommError::Disconnected { rank: 0 })?;
        Ok(mailbox.remove(pos).map(|(_, payload)| payload).unwrap_or_default())
    }
}
