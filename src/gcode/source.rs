// src/gcode/source.rs - command sources, reply routing and arbitration
use std::collections::VecDeque;

/// Identifies one registered command source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(pub usize);

/// Per-source interpreter context. Mutated only while its source is the
/// active selection for a tick; saved and restored by the macro stack.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecContext {
    /// Last commanded feed rate, in distance units per minute.
    pub feed_rate: f64,
    pub axes_relative: bool,
    pub drives_relative: bool,
    /// 1.0 for millimetres, 25.4 for inches (G21/G20).
    pub distance_scale: f64,
}

impl ExecContext {
    pub fn new(default_feed_rate: f64) -> Self {
        Self {
            feed_rate: default_feed_rate,
            axes_relative: false,
            drives_relative: true,
            distance_scale: 1.0,
        }
    }
}

/// One channel of complete G-code lines with its reply sink. Front-ends
/// push whole lines in and drain replies out; nothing here blocks.
#[derive(Debug)]
pub struct Source {
    pub id: SourceId,
    pub label: String,
    pub ctx: ExecContext,
    lines: VecDeque<String>,
    replies: VecDeque<String>,
}

impl Source {
    /// The line currently at the head of the queue. It stays there until the
    /// command it holds reports completion, which is how an unfinished
    /// command is retried on a later tick.
    pub fn peek_line(&self) -> Option<&str> {
        self.lines.front().map(|s| s.as_str())
    }

    pub fn pop_line(&mut self) -> Option<String> {
        self.lines.pop_front()
    }

    pub fn has_line(&self) -> bool {
        !self.lines.is_empty()
    }

    pub fn push_reply(&mut self, reply: String) {
        self.replies.push_back(reply);
    }
}

/// Which source gets polled when several have work ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourcePolicy {
    /// Strict rotation over every registered source.
    #[default]
    RoundRobin,
    /// Interactive sources rotate first; the print-file source is polled
    /// only when none of them has a complete line.
    FileLast,
}

/// The registered sources plus the rotation cursor used for fair selection.
#[derive(Debug)]
pub struct SourceSet {
    sources: Vec<Source>,
    cursor: usize,
    policy: SourcePolicy,
    file_source: Option<SourceId>,
    default_feed_rate: f64,
}

impl SourceSet {
    pub fn new(policy: SourcePolicy, default_feed_rate: f64) -> Self {
        Self {
            sources: Vec::new(),
            cursor: 0,
            policy,
            file_source: None,
            default_feed_rate,
        }
    }

    pub fn register(&mut self, label: &str) -> SourceId {
        let id = SourceId(self.sources.len());
        self.sources.push(Source {
            id,
            label: label.to_string(),
            ctx: ExecContext::new(self.default_feed_rate),
            lines: VecDeque::new(),
            replies: VecDeque::new(),
        });
        tracing::debug!("registered command source {} ({})", id.0, label);
        id
    }

    /// Marks one registered source as the print-file source, which the
    /// `FileLast` policy de-prioritizes.
    pub fn set_file_source(&mut self, id: SourceId) {
        self.file_source = Some(id);
    }

    pub fn source(&self, id: SourceId) -> &Source {
        &self.sources[id.0]
    }

    pub fn source_mut(&mut self, id: SourceId) -> &mut Source {
        &mut self.sources[id.0]
    }

    pub fn push_line(&mut self, id: SourceId, line: &str) {
        self.sources[id.0].lines.push_back(line.to_string());
    }

    pub fn reply(&mut self, id: SourceId, text: String) {
        self.sources[id.0].push_reply(text);
    }

    pub fn drain_replies(&mut self, id: SourceId) -> Vec<String> {
        self.sources[id.0].replies.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// True if any source has a complete line buffered.
    pub fn any_ready(&self) -> bool {
        self.sources.iter().any(|s| s.has_line())
    }

    /// Pick the source that wins this tick: the first eligible source with a
    /// complete buffered line, scanning round-robin from just past the last
    /// winner. Returns `None` when nothing is ready.
    pub fn select(&mut self, eligible: impl Fn(&Source) -> bool) -> Option<SourceId> {
        let n = self.sources.len();
        if n == 0 {
            return None;
        }
        let file = self.file_source;
        let mut winner = None;
        for i in 0..n {
            let idx = (self.cursor + i) % n;
            let src = &self.sources[idx];
            if self.policy == SourcePolicy::FileLast && Some(src.id) == file {
                continue;
            }
            if src.has_line() && eligible(src) {
                winner = Some(idx);
                break;
            }
        }
        if winner.is_none() && self.policy == SourcePolicy::FileLast {
            if let Some(fid) = file {
                let src = &self.sources[fid.0];
                if src.has_line() && eligible(src) {
                    winner = Some(fid.0);
                }
            }
        }
        let idx = winner?;
        self.cursor = (idx + 1) % n;
        Some(SourceId(idx))
    }
}
