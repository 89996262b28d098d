//! Correlation of several captures into one chronological timeline.
//!
//! Each capture's packets are already time-ordered, so the merge is a k-way
//! heap merge keyed on (absolute time, input position, sequence index).
//! Equal timestamps therefore keep the order the captures were supplied in.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::debug;

use super::render;
use crate::error::ValidationError;
use crate::model::{DecodedCapture, PacketRecord};

pub const MIN_CAPTURES: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineOptions {
    pub min_count: usize,
    /// Cap on rendered event rows; omitted rows are counted in the report.
    pub max_rendered_events: Option<usize>,
}

impl Default for TimelineOptions {
    fn default() -> Self {
        Self {
            min_count: MIN_CAPTURES,
            max_rendered_events: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineEvent {
    pub absolute_us: i64,
    /// Position of the originating capture in the input.
    pub capture: usize,
    pub sequence_index: usize,
    pub protocol: &'static str,
    pub source: String,
    pub destination: String,
    pub wire_length: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureShare {
    pub name: String,
    pub packets: u64,
    pub first_us: Option<i64>,
    pub last_us: Option<i64>,
    pub decode_warning: Option<String>,
}

/// Largest silence between two consecutive merged events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    /// Index into `events` of the event the gap follows.
    pub after_event: usize,
    pub duration_us: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationFlow {
    pub endpoints: (String, String),
    pub packets: u64,
    pub bytes: u64,
    /// Direction changes plus one.
    pub turns: u64,
    pub first_event: usize,
    pub captures: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineStats {
    pub captures: Vec<CaptureShare>,
    pub events: Vec<TimelineEvent>,
    pub largest_gap: Option<Gap>,
    /// Time during which two or more capture windows were open.
    pub overlap_us: i64,
    pub conversations: Vec<ConversationFlow>,
}

impl TimelineStats {
    pub fn start_us(&self) -> Option<i64> {
        self.events.first().map(|e| e.absolute_us)
    }

    pub fn end_us(&self) -> Option<i64> {
        self.events.last().map(|e| e.absolute_us)
    }

    pub fn span_us(&self) -> i64 {
        match (self.start_us(), self.end_us()) {
            (Some(start), Some(end)) => end - start,
            _ => 0,
        }
    }

    fn build(captures: &[DecodedCapture]) -> Self {
        let names: Vec<String> = captures.iter().map(|c| c.name()).collect();
        let mut tracker = FlowTracker::default();
        let events = merge(captures, |idx, ci, packet| tracker.observe(idx, &names[ci], packet));

        let total = events.len() as u64;
        let shares: Vec<CaptureShare> = captures
            .iter()
            .zip(&names)
            .map(|(capture, name)| CaptureShare {
                name: name.clone(),
                packets: capture.packets.len() as u64,
                first_us: capture.packets.first().map(|p| capture.absolute_us(p)),
                last_us: capture.packets.last().map(|p| capture.absolute_us(p)),
                decode_warning: capture.truncation.as_ref().map(|e| e.to_string()),
            })
            .collect();
        debug!("Merged {} events from {} captures", total, captures.len());

        let largest_gap = events
            .windows(2)
            .enumerate()
            .map(|(idx, pair)| Gap {
                after_event: idx,
                duration_us: pair[1].absolute_us - pair[0].absolute_us,
            })
            // earliest gap wins a tie
            .fold(None, |best: Option<Gap>, gap| match best {
                Some(b) if b.duration_us >= gap.duration_us => Some(b),
                _ => Some(gap),
            });

        let overlap_us = overlap(&shares);
        let conversations = tracker.finish();

        TimelineStats {
            captures: shares,
            events,
            largest_gap,
            overlap_us,
            conversations,
        }
    }

    pub fn render(&self, max_events: Option<usize>) -> String {
        let mut out = String::new();
        render::heading(&mut out, 1, "Capture Timeline");

        let total = self.events.len() as u64;
        let mut summary = vec![
            ("Captures".to_string(), self.captures.len().to_string()),
            ("Total Events".to_string(), total.to_string()),
        ];
        if let (Some(start), Some(end)) = (self.start_us(), self.end_us()) {
            summary.push(("Timeline Start".to_string(), timestamp(start)));
            summary.push(("Timeline End".to_string(), timestamp(end)));
        }
        summary.push(("Time Span (s)".to_string(), render::seconds(self.span_us())));
        summary.push((
            "Largest Gap (s)".to_string(),
            render::seconds(self.largest_gap.map_or(0, |g| g.duration_us)),
        ));
        if let Some(gap) = self.largest_gap {
            summary.push(("Largest Gap After Event".to_string(), (gap.after_event + 1).to_string()));
        }
        summary.push(("Capture Overlap (s)".to_string(), render::seconds(self.overlap_us)));
        summary.push(("Conversations".to_string(), self.conversations.len().to_string()));
        let turns: u64 = self.conversations.iter().map(|flow| flow.turns).sum();
        summary.push(("Total Turns".to_string(), turns.to_string()));
        render::metric_table(&mut out, &summary);

        let origin = self.start_us().unwrap_or(0);
        let offset = |us: Option<i64>| us.map_or_else(|| "-".to_string(), |us| render::seconds(us - origin));

        render::heading(&mut out, 2, "Capture Share");
        let shares: Vec<Vec<String>> = self
            .captures
            .iter()
            .map(|share| {
                vec![
                    share.name.clone(),
                    share.packets.to_string(),
                    render::percent(share.packets, total),
                    offset(share.first_us),
                    offset(share.last_us),
                ]
            })
            .collect();
        render::ranked_table(
            &mut out,
            &["Packets", "Share", "First Event (s)", "Last Event (s)"],
            &shares,
        );

        let warnings: Vec<(String, String)> = self
            .captures
            .iter()
            .filter_map(|share| {
                share
                    .decode_warning
                    .as_ref()
                    .map(|w| (format!("Decode Warning {}", share.name), w.clone()))
            })
            .collect();
        if !warnings.is_empty() {
            render::heading(&mut out, 2, "Decode Warnings");
            render::metric_table(&mut out, &warnings);
        }

        render::heading(&mut out, 2, "Conversations");
        let flows: Vec<Vec<String>> = self
            .conversations
            .iter()
            .enumerate()
            .map(|(idx, flow)| {
                vec![
                    format!("Conversation {}", idx + 1),
                    format!("{} <-> {}", flow.endpoints.0, flow.endpoints.1),
                    flow.packets.to_string(),
                    flow.bytes.to_string(),
                    render::average(flow.bytes, flow.packets),
                    flow.turns.to_string(),
                    flow.captures.iter().cloned().collect::<Vec<_>>().join(", "),
                ]
            })
            .collect();
        render::ranked_table(
            &mut out,
            &["Endpoints", "Packets", "Bytes", "Avg Size", "Turns", "Captures"],
            &flows,
        );

        render::heading(&mut out, 2, "Events");
        let shown = max_events.map_or(self.events.len(), |cap| cap.min(self.events.len()));
        let rows: Vec<Vec<String>> = self.events[..shown]
            .iter()
            .enumerate()
            .map(|(idx, event)| {
                vec![
                    format!("Event {}", idx + 1),
                    render::seconds(event.absolute_us - origin),
                    self.captures[event.capture].name.clone(),
                    event.protocol.to_string(),
                    event.source.clone(),
                    event.destination.clone(),
                    event.wire_length.to_string(),
                ]
            })
            .collect();
        render::ranked_table(
            &mut out,
            &["Offset (s)", "Capture", "Protocol", "Source", "Destination", "Length"],
            &rows,
        );

        let omitted = self.events.len() - shown;
        if omitted > 0 {
            render::metric_table(&mut out, &[("Events Omitted", omitted.to_string())]);
        }

        out
    }
}

fn timestamp(us: i64) -> String {
    DateTime::<Utc>::from_timestamp_micros(us)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Micros, true))
        .unwrap_or_else(|| us.to_string())
}

fn merge<F>(captures: &[DecodedCapture], mut observe: F) -> Vec<TimelineEvent>
where
    F: FnMut(usize, usize, &PacketRecord),
{
    let total: usize = captures.iter().map(|c| c.packets.len()).sum();
    let mut events = Vec::with_capacity(total);

    // (absolute time, capture position, sequence index, position within capture)
    let mut heap = BinaryHeap::with_capacity(captures.len());
    for (ci, capture) in captures.iter().enumerate() {
        if let Some(first) = capture.packets.first() {
            heap.push(Reverse((capture.absolute_us(first), ci, first.sequence_index, 0usize)));
        }
    }

    while let Some(Reverse((absolute_us, ci, sequence_index, pos))) = heap.pop() {
        let capture = &captures[ci];
        let packet = &capture.packets[pos];
        observe(events.len(), ci, packet);
        events.push(TimelineEvent {
            absolute_us,
            capture: ci,
            sequence_index,
            protocol: packet.protocol_label(),
            source: packet.source_endpoint(),
            destination: packet.destination_endpoint(),
            wire_length: packet.wire_length,
        });

        if let Some(next) = capture.packets.get(pos + 1) {
            heap.push(Reverse((capture.absolute_us(next), ci, next.sequence_index, pos + 1)));
        }
    }
    events
}

/// Total time covered by at least two capture windows.
fn overlap(shares: &[CaptureShare]) -> i64 {
    let mut edges: Vec<(i64, i32)> = Vec::new();
    for share in shares {
        if let (Some(first), Some(last)) = (share.first_us, share.last_us) {
            if last > first {
                edges.push((first, 1));
                edges.push((last, -1));
            }
        }
    }
    // closing edges sort before opening ones at the same instant
    edges.sort();

    let mut open = 0;
    let mut covered = 0;
    let mut previous = 0;
    for (at, delta) in edges {
        if open >= 2 {
            covered += at - previous;
        }
        open += delta;
        previous = at;
    }
    covered
}

struct FlowState {
    flow: ConversationFlow,
    last_sender: String,
}

/// Per-pair conversation accounting over the merged order.
#[derive(Default)]
struct FlowTracker {
    pairs: HashMap<(String, String), FlowState>,
}

impl FlowTracker {
    fn observe(&mut self, event_idx: usize, capture_name: &str, packet: &PacketRecord) {
        if !packet.source.is_known() || !packet.destination.is_known() {
            return;
        }
        let src = packet.source.to_string();
        let dst = packet.destination.to_string();
        let key = if src <= dst { (src.clone(), dst) } else { (dst, src.clone()) };

        let state = self.pairs.entry(key.clone()).or_insert_with(|| FlowState {
            flow: ConversationFlow {
                endpoints: key,
                packets: 0,
                bytes: 0,
                turns: 1,
                first_event: event_idx,
                captures: BTreeSet::new(),
            },
            last_sender: src.clone(),
        });

        state.flow.packets += 1;
        state.flow.bytes += u64::from(packet.wire_length);
        if !state.flow.captures.contains(capture_name) {
            state.flow.captures.insert(capture_name.to_string());
        }
        if state.last_sender != src {
            state.flow.turns += 1;
            state.last_sender = src;
        }
    }

    fn finish(self) -> Vec<ConversationFlow> {
        let mut flows: Vec<ConversationFlow> = self.pairs.into_values().map(|state| state.flow).collect();
        flows.sort_by_key(|flow| flow.first_event);
        flows
    }
}

/// Multi-capture report: the aggregates and the text rendered from them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineReport {
    pub stats: TimelineStats,
    text: String,
}

impl TimelineReport {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }
}

pub fn correlate(captures: &[DecodedCapture], min_count: usize) -> Result<TimelineReport, ValidationError> {
    correlate_with(
        captures,
        &TimelineOptions {
            min_count,
            ..TimelineOptions::default()
        },
    )
}

pub fn correlate_with(
    captures: &[DecodedCapture],
    options: &TimelineOptions,
) -> Result<TimelineReport, ValidationError> {
    let required = options.min_count.max(1);
    if captures.len() < required {
        return Err(ValidationError::TooFewCaptures {
            required,
            supplied: captures.len(),
        });
    }

    let stats = TimelineStats::build(captures);
    let text = stats.render(options.max_rendered_events);
    Ok(TimelineReport { stats, text })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{capture, tcp_frame, tcp_series};

    const BASE: i64 = 1_700_000_000_000_000;

    fn a_and_b() -> (DecodedCapture, DecodedCapture) {
        // A: t=0..2s, B: t=1..3s, five packets each
        let a = capture("a.pcap", &tcp_series(BASE, 500_000, 5, [10, 0, 0, 1], [10, 0, 0, 2]));
        let b = capture("b.pcap", &tcp_series(BASE + 1_000_000, 500_000, 5, [10, 0, 0, 3], [10, 0, 0, 4]));
        (a, b)
    }

    #[test]
    fn fewer_than_two_captures_is_rejected() {
        let (a, _) = a_and_b();
        assert_eq!(
            correlate(&[a], MIN_CAPTURES).unwrap_err(),
            ValidationError::TooFewCaptures { required: 2, supplied: 1 }
        );
        assert_eq!(
            correlate(&[], MIN_CAPTURES).unwrap_err(),
            ValidationError::TooFewCaptures { required: 2, supplied: 0 }
        );
    }

    #[test]
    fn overlapping_captures_interleave() {
        let (a, b) = a_and_b();
        let report = correlate(&[a, b], MIN_CAPTURES).unwrap();
        let events = &report.stats.events;

        assert_eq!(events.len(), 10);
        assert!(events.windows(2).all(|w| w[0].absolute_us <= w[1].absolute_us));

        let overlap: Vec<usize> = events
            .iter()
            .filter(|e| e.absolute_us >= BASE + 1_000_000 && e.absolute_us <= BASE + 2_000_000)
            .map(|e| e.capture)
            .collect();
        assert!(overlap.contains(&0) && overlap.contains(&1));

        assert_eq!(report.stats.span_us(), 3_000_000);
        assert_eq!(report.stats.overlap_us, 1_000_000);
        assert_eq!(report.stats.captures[0].packets, 5);
    }

    #[test]
    fn equal_timestamps_follow_input_order() {
        let a = capture("first.pcap", &tcp_series(BASE, 1_000, 3, [10, 0, 0, 1], [10, 0, 0, 2]));
        let b = capture("second.pcap", &tcp_series(BASE, 1_000, 3, [10, 0, 0, 1], [10, 0, 0, 2]));

        let forward = correlate(&[a.clone(), b.clone()], 2).unwrap();
        let order: Vec<usize> = forward.stats.events.iter().map(|e| e.capture).collect();
        assert_eq!(order, vec![0, 1, 0, 1, 0, 1]);

        let reversed = correlate(&[b, a], 2).unwrap();
        assert_eq!(reversed.stats.events[0].capture, 0);
        assert!(reversed.text().contains("| Event 1 | 0.000000 | second.pcap |"));
    }

    #[test]
    fn merge_uses_absolute_not_relative_time() {
        // later capture listed first
        let late = capture("late.pcap", &tcp_series(BASE + 10_000_000, 1_000, 2, [10, 0, 0, 1], [10, 0, 0, 2]));
        let early = capture("early.pcap", &tcp_series(BASE, 1_000, 2, [10, 0, 0, 1], [10, 0, 0, 2]));
        let report = correlate(&[late, early], 2).unwrap();

        let order: Vec<usize> = report.stats.events.iter().map(|e| e.capture).collect();
        assert_eq!(order, vec![1, 1, 0, 0]);
        let gap = report.stats.largest_gap.unwrap();
        assert_eq!(gap.after_event, 1);
        assert_eq!(gap.duration_us, 10_000_000 - 1_000);
        assert_eq!(report.stats.overlap_us, 0);
    }

    #[test]
    fn conversations_count_turns_across_captures() {
        let client = [192, 168, 1, 10];
        let server = [192, 168, 1, 1];
        let a = capture(
            "client.pcap",
            &[
                (BASE, tcp_frame(client, server, 5000, 80, b"req")),
                (BASE + 20, tcp_frame(client, server, 5000, 80, b"req")),
            ],
        );
        let b = capture("server.pcap", &[(BASE + 10, tcp_frame(server, client, 80, 5000, b"resp"))]);
        let report = correlate(&[a, b], 2).unwrap();

        assert_eq!(report.stats.conversations.len(), 1);
        let flow = &report.stats.conversations[0];
        assert_eq!(flow.packets, 3);
        // client, server, client
        assert_eq!(flow.turns, 3);
        assert_eq!(flow.captures.len(), 2);
    }

    #[test]
    fn conversation_table_shows_average_size_and_total_turns() {
        let client = [192, 168, 1, 10];
        let server = [192, 168, 1, 1];
        let a = capture(
            "client.pcap",
            &[
                (BASE, tcp_frame(client, server, 5000, 80, b"")),
                (BASE + 20, tcp_frame(client, server, 5000, 80, b"")),
            ],
        );
        let b = capture("server.pcap", &[(BASE + 10, tcp_frame(server, client, 80, 5000, b"0123456789"))]);
        let report = correlate(&[a, b], 2).unwrap();

        let flow = &report.stats.conversations[0];
        let expected = format!("{:.2}", flow.bytes as f64 / 3.0);
        let text = report.text();
        assert!(text.contains("| Metric | Endpoints | Packets | Bytes | Avg Size | Turns | Captures |"));
        assert!(text.contains(&format!("| 3 | {} | {} | 3 |", flow.bytes, expected)));
        assert!(text.contains("| Total Turns | 3 |"));
    }

    #[test]
    fn rendering_is_deterministic_and_pipe_safe() {
        let (a, b) = a_and_b();
        let first = correlate(&[a.clone(), b.clone()], 2).unwrap();
        let second = correlate(&[a, b], 2).unwrap();
        assert_eq!(first.text(), second.text());

        for line in first.text().lines().filter(|l| l.contains('|')) {
            assert!(line.starts_with('|') && line.ends_with('|'), "bad row: {}", line);
        }
        assert!(first.text().contains("| Metric | Value |"));
        assert!(first.text().contains("| Total Events | 10 |"));
        assert!(first.text().contains("| a.pcap | 5 | 50.00% |"));
    }

    #[test]
    fn event_rows_can_be_capped() {
        let (a, b) = a_and_b();
        let options = TimelineOptions {
            max_rendered_events: Some(4),
            ..TimelineOptions::default()
        };
        let report = correlate_with(&[a, b], &options).unwrap();

        assert_eq!(report.stats.events.len(), 10);
        assert!(report.text().contains("| Event 4 |"));
        assert!(!report.text().contains("| Event 5 |"));
        assert!(report.text().contains("| Events Omitted | 6 |"));
    }
}
