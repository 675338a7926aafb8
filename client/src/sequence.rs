//! Client sequence numbering for correlating acknowledgements with actions

/// Issues strictly increasing client sequence numbers for one client session.
///
/// The counter is never reset on reconnect: the server correlates
/// confirmations and rejections by absolute clientSeq.
#[derive(Debug)]
pub struct SequenceAllocator {
    initial: u64,
    next_sequence: u64,
    last_issued: Option<u64>,
}

impl SequenceAllocator {
    pub fn new(initial: u64) -> Self {
        Self {
            initial,
            next_sequence: initial,
            last_issued: None,
        }
    }

    pub fn next(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.last_issued = Some(sequence);
        sequence
    }

    /// The value the next call to [`SequenceAllocator::next`] will return
    pub fn peek(&self) -> u64 {
        self.next_sequence
    }

    pub fn last_issued(&self) -> Option<u64> {
        self.last_issued
    }

    pub fn has_issued(&self, sequence: u64) -> bool {
        sequence >= self.initial && sequence < self.next_sequence
    }
}

impl Default for SequenceAllocator {
    fn default() -> Self {
        Self::new(crate::config::INITIAL_CLIENT_SEQ)
    }
}
