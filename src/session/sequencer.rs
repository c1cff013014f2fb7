//! Response ordering
//!
//! Devices must hear replies in the order they spoke. Pipelines run
//! concurrently and may finish out of order, so frames are funneled through
//! this sequencer: frames for the oldest unfinished utterance pass straight
//! through, frames for later utterances buffer until every earlier utterance
//! has finished (completed, aborted, or cancelled). Ordinals are dense —
//! every started utterance is eventually finished exactly once.

use std::collections::{BTreeMap, BTreeSet};

use crate::protocol::ResponseFrame;

/// Orders response streams by utterance start
#[derive(Debug, Default)]
pub struct ResponseSequencer {
    /// Oldest ordinal not yet finished; its frames flush immediately
    head: u64,
    /// Ordinals past the head that already finished
    finished: BTreeSet<u64>,
    /// Buffered frames for ordinals past the head
    buffered: BTreeMap<u64, Vec<ResponseFrame>>,
}

impl ResponseSequencer {
    /// Create a sequencer starting at ordinal zero
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The oldest ordinal whose stream is currently allowed out
    #[must_use]
    pub const fn head(&self) -> u64 {
        self.head
    }

    /// Whether any frames are waiting behind unfinished utterances
    #[must_use]
    pub fn has_buffered(&self) -> bool {
        !self.buffered.is_empty()
    }

    /// Offer a frame for an utterance; returns the frames releasable now
    pub fn push_frame(&mut self, ordinal: u64, frame: ResponseFrame) -> Vec<ResponseFrame> {
        if ordinal < self.head {
            // Stream for an utterance that already finished (late frames
            // after an abort); nothing downstream wants these.
            tracing::debug!(ordinal, head = self.head, "dropping late response frame");
            return Vec::new();
        }
        if ordinal == self.head {
            return vec![frame];
        }
        self.buffered.entry(ordinal).or_default().push(frame);
        Vec::new()
    }

    /// Mark an utterance finished; returns frames releasable as a result
    pub fn finish(&mut self, ordinal: u64) -> Vec<ResponseFrame> {
        if ordinal < self.head {
            return Vec::new();
        }
        self.finished.insert(ordinal);

        let mut released = Vec::new();
        while self.finished.remove(&self.head) {
            self.head += 1;
            // The new head's backlog flushes; its further frames stream live
            if let Some(frames) = self.buffered.remove(&self.head) {
                released.extend(frames);
            }
        }
        released
    }

    /// Drop everything buffered (device aborted playback)
    pub fn clear_buffered(&mut self) {
        self.buffered.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(ordinal: u64, chunk: u32) -> ResponseFrame {
        ResponseFrame::audio(ordinal, chunk, vec![0u8; 4])
    }

    fn end(ordinal: u64, chunk: u32) -> ResponseFrame {
        ResponseFrame::end_marker(ordinal, chunk)
    }

    #[test]
    fn head_frames_pass_through() {
        let mut seq = ResponseSequencer::new();
        let released = seq.push_frame(0, frame(0, 0));
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].ordinal, 0);
    }

    #[test]
    fn later_utterance_buffers_until_earlier_finishes() {
        let mut seq = ResponseSequencer::new();

        // Utterance 1 finishes its whole stream before utterance 0 produces
        // anything; none of it may leave yet.
        assert!(seq.push_frame(1, frame(1, 0)).is_empty());
        assert!(seq.push_frame(1, end(1, 1)).is_empty());
        assert!(seq.finish(1).is_empty());

        // Utterance 0 streams and finishes; released frames must be all of
        // 0's, then all of 1's.
        assert_eq!(seq.push_frame(0, frame(0, 0)).len(), 1);
        assert_eq!(seq.push_frame(0, end(0, 1)).len(), 1);

        let released = seq.finish(0);
        assert_eq!(released.len(), 2);
        assert!(released.iter().all(|f| f.ordinal == 1));
        assert!(released[1].is_end());
        assert_eq!(seq.head(), 2);
    }

    #[test]
    fn aborted_head_unblocks_successor() {
        let mut seq = ResponseSequencer::new();
        assert!(seq.push_frame(1, frame(1, 0)).is_empty());

        // Utterance 0 aborted without frames
        let released = seq.finish(0);
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].ordinal, 1);

        // Utterance 1 now streams live
        assert_eq!(seq.push_frame(1, frame(1, 1)).len(), 1);
    }

    #[test]
    fn chain_of_finished_ordinals_flushes_in_order() {
        let mut seq = ResponseSequencer::new();
        for ordinal in 1..4u64 {
            seq.push_frame(ordinal, frame(ordinal, 0));
            seq.push_frame(ordinal, end(ordinal, 1));
            seq.finish(ordinal);
        }

        let released = seq.finish(0);
        let ordinals: Vec<u64> = released.iter().map(|f| f.ordinal).collect();
        assert_eq!(ordinals, vec![1, 1, 2, 2, 3, 3]);
        assert_eq!(seq.head(), 4);
    }

    #[test]
    fn late_frames_are_dropped() {
        let mut seq = ResponseSequencer::new();
        seq.finish(0);
        assert!(seq.push_frame(0, frame(0, 0)).is_empty());
        assert!(seq.finish(0).is_empty());
        assert_eq!(seq.head(), 1);
    }

    #[test]
    fn clear_buffered_drops_pending_only() {
        let mut seq = ResponseSequencer::new();
        seq.push_frame(1, frame(1, 0));
        assert!(seq.has_buffered());
        seq.clear_buffered();
        assert!(!seq.has_buffered());
        assert!(seq.finish(0).is_empty());
    }
}
