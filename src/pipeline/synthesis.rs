//! Ordered synthesis of segments
//!
//! Requests are issued in emission order, up to `concurrency` at a time.
//! Completions pass through a reorder buffer so audio is delivered in the
//! order the segments were emitted, whatever order the provider answers in.

use std::collections::BTreeMap;
use std::future::Future;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::segmenter::TextSegment;
use crate::persona::VoiceSettings;
use crate::voice::Synthesizer;

/// Releases items strictly in sequence order
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    next: usize,
    pending: BTreeMap<usize, T>,
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ReorderBuffer<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: 0,
            pending: BTreeMap::new(),
        }
    }

    /// Insert item `seq`; returns every item now releasable, in order
    pub fn push(&mut self, seq: usize, item: T) -> Vec<T> {
        self.pending.insert(seq, item);

        let mut ready = Vec::new();
        while let Some(item) = self.pending.remove(&self.next) {
            ready.push(item);
            self.next += 1;
        }
        ready
    }

    /// Items waiting on an earlier sequence number
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.pending.len()
    }
}

/// Outcome counts of one response's synthesis
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SynthesisReport {
    pub synthesized: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Synthesize segments from `segments` and hand audio to `deliver` in order
///
/// A failed segment is logged and dropped; later segments continue. Segments
/// not marked speakable are skipped. Stops early when `cancel` fires.
pub async fn run_ordered<F, Fut>(
    synthesizer: &dyn Synthesizer,
    voice: &VoiceSettings,
    concurrency: usize,
    mut segments: mpsc::Receiver<TextSegment>,
    cancel: &CancellationToken,
    mut deliver: F,
) -> SynthesisReport
where
    F: FnMut(TextSegment, Vec<u8>) -> Fut,
    Fut: Future<Output = ()>,
{
    let concurrency = concurrency.max(1);
    let mut report = SynthesisReport::default();
    let mut in_flight = FuturesUnordered::new();
    let mut reorder = ReorderBuffer::new();
    let mut next_order = 0;
    let mut input_open = true;

    loop {
        if !input_open && in_flight.is_empty() {
            break;
        }

        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                tracing::debug!(in_flight = in_flight.len(), "synthesis cancelled");
                break;
            }
            Some((order, segment, result)) = in_flight.next(), if !in_flight.is_empty() => {
                for (segment, result) in reorder.push(order, (segment, result)) {
                    match result {
                        Ok(audio) => {
                            report.synthesized += 1;
                            deliver(segment, audio).await;
                        }
                        Err(e) => {
                            report.failed += 1;
                            tracing::warn!(
                                error = %e,
                                segment = %segment.source_id,
                                "segment synthesis failed, continuing"
                            );
                        }
                    }
                }
            }
            segment = segments.recv(), if input_open && in_flight.len() < concurrency => {
                match segment {
                    Some(segment) if !segment.speakable => {
                        report.skipped += 1;
                        tracing::debug!(segment = %segment.source_id, "segment too short to speak");
                    }
                    Some(segment) => {
                        let order = next_order;
                        next_order += 1;
                        in_flight.push(async move {
                            let result = synthesizer.synthesize(&segment.content, voice).await;
                            (order, segment, result)
                        });
                    }
                    None => input_open = false,
                }
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::{Error, Result};

    /// Answers after a delay encoded in the text: "<ms>:<label>"
    struct DelayedSynth;

    #[async_trait]
    impl Synthesizer for DelayedSynth {
        async fn synthesize(&self, text: &str, _voice: &VoiceSettings) -> Result<Vec<u8>> {
            let (ms, label) = text.split_once(':').unwrap();
            tokio::time::sleep(Duration::from_millis(ms.parse().unwrap())).await;
            if label == "fail" {
                return Err(Error::Tts("500".into()));
            }
            Ok(label.as_bytes().to_vec())
        }
    }

    fn segment(seq: usize, content: &str, speakable: bool) -> TextSegment {
        TextSegment {
            content: content.to_string(),
            source_id: format!("r1:{seq}"),
            seq,
            speakable,
        }
    }

    async fn run(concurrency: usize, inputs: Vec<TextSegment>) -> (Vec<String>, SynthesisReport) {
        let (tx, rx) = mpsc::channel(16);
        for input in inputs {
            tx.send(input).await.unwrap();
        }
        drop(tx);

        let delivered = Mutex::new(Vec::new());
        let report = run_ordered(
            &DelayedSynth,
            &VoiceSettings::default(),
            concurrency,
            rx,
            &CancellationToken::new(),
            |_segment, audio| {
                delivered
                    .lock()
                    .unwrap()
                    .push(String::from_utf8(audio).unwrap());
                async {}
            },
        )
        .await;
        (delivered.into_inner().unwrap(), report)
    }

    #[test]
    fn test_reorder_buffer_releases_in_sequence() {
        let mut buffer = ReorderBuffer::new();
        assert!(buffer.push(2, "c").is_empty());
        assert!(buffer.push(1, "b").is_empty());
        assert_eq!(buffer.waiting(), 2);
        assert_eq!(buffer.push(0, "a"), ["a", "b", "c"]);
        assert_eq!(buffer.push(3, "d"), ["d"]);
        assert_eq!(buffer.waiting(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_completions_delivered_in_order() {
        let (delivered, report) = run(
            3,
            vec![
                segment(0, "300:a", true),
                segment(1, "10:b", true),
                segment(2, "100:c", true),
            ],
        )
        .await;

        assert_eq!(delivered, ["a", "b", "c"]);
        assert_eq!(report.synthesized, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_segment_is_isolated() {
        let (delivered, report) = run(
            1,
            vec![
                segment(0, "10:a", true),
                segment(1, "10:fail", true),
                segment(2, "10:c", true),
            ],
        )
        .await;

        assert_eq!(delivered, ["a", "c"]);
        assert_eq!(report.failed, 1);
        assert_eq!(report.synthesized, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unspeakable_segments_skipped() {
        let (delivered, report) = run(
            2,
            vec![segment(0, "10:a", true), segment(1, "!", false)],
        )
        .await;

        assert_eq!(delivered, ["a"]);
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_delivery() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(segment(0, "1000:a", true)).await.unwrap();

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let mut delivered = 0;
        let report = run_ordered(
            &DelayedSynth,
            &VoiceSettings::default(),
            1,
            rx,
            &cancel,
            |_, _| {
                delivered += 1;
                async {}
            },
        )
        .await;

        assert_eq!(delivered, 0);
        assert_eq!(report, SynthesisReport::default());
        drop(tx);
    }
}
