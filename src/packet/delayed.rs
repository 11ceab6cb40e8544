//! Warmup delayer
//!
//! At session start, packets are held back until the buffered span
//! covers the target latency. Only then does playback begin; afterwards
//! the stage is a permanent pass-through. Without this the session
//! would start with an empty jitter buffer and immediately underrun.

use std::collections::VecDeque;

use tracing::debug;

use super::{PacketHandle, PacketReader};
use crate::units::{timestamp_diff, StreamTimestampDiff};

/// Holds packets until `delay` samples are buffered, then passes through.
pub struct DelayedReader<R> {
    reader: R,
    held: VecDeque<PacketHandle>,
    delay: StreamTimestampDiff,
    started: bool,
}

impl<R: PacketReader> DelayedReader<R> {
    /// Wrap `reader`, delaying start until `delay` samples (per channel)
    /// are buffered.
    pub fn new(reader: R, delay: StreamTimestampDiff) -> Self {
        DelayedReader {
            reader,
            held: VecDeque::new(),
            delay,
            started: false,
        }
    }

    /// True once the warmup span has been accumulated.
    pub fn started(&self) -> bool {
        self.started
    }

    fn buffered_span(&self) -> StreamTimestampDiff {
        match (self.held.front(), self.held.back()) {
            (Some(first), Some(last)) => {
                timestamp_diff(last.rtp().end(), first.rtp().begin())
            }
            _ => 0,
        }
    }

    fn accumulate(&mut self) -> bool {
        while let Some(packet) = self.reader.read() {
            self.held.push_back(packet);
        }

        let span = self.buffered_span();
        if span < self.delay {
            return false;
        }

        debug!(
            "delayed reader: warmup complete: packets={} span={} delay={}",
            self.held.len(),
            span,
            self.delay
        );
        true
    }
}

impl<R: PacketReader> PacketReader for DelayedReader<R> {
    fn read(&mut self) -> Option<PacketHandle> {
        if !self.started {
            if !self.accumulate() {
                return None;
            }
            // Warmup never reoccurs, even if the queue later drains.
            self.started = true;
        }

        if let Some(packet) = self.held.pop_front() {
            return Some(packet);
        }
        self.reader.read()
    }
}
