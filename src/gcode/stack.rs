// src/gcode/stack.rs - macro call stack and resumable file readers
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::source::SourceId;
use super::state::GCodeState;

/// Maximum nesting depth for macro files and context pushes.
pub const STACK_DEPTH: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StackError {
    #[error("macro stack overflow (depth limit {STACK_DEPTH})")]
    Overflow,
    #[error("macro stack underflow")]
    Underflow,
}

/// A line-oriented reader over a G-code text file that tracks its byte
/// offset, so execution can be bookmarked and resumed mid-file.
#[derive(Debug)]
pub struct FileReader {
    path: PathBuf,
    reader: BufReader<File>,
    offset: u64,
    len: u64,
}

impl FileReader {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            offset: 0,
            len,
        })
    }

    /// Next line with its trailing newline removed, or `None` at EOF.
    pub fn read_line(&mut self) -> std::io::Result<Option<String>> {
        let mut buf = String::new();
        let n = self.reader.read_line(&mut buf)?;
        if n == 0 {
            return Ok(None);
        }
        self.offset += n as u64;
        while buf.ends_with('\n') || buf.ends_with('\r') {
            buf.pop();
        }
        Ok(Some(buf))
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn seek_to(&mut self, offset: u64) -> std::io::Result<()> {
        self.reader.seek(SeekFrom::Start(offset))?;
        self.offset = offset;
        Ok(())
    }

    pub fn fraction_read(&self) -> f64 {
        if self.len == 0 {
            1.0
        } else {
            self.offset as f64 / self.len as f64
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// What popping a frame does to the interpreter's macro-file slot.
#[derive(Debug)]
pub enum FrameFile {
    /// M120-style context push: the file context is untouched on pop.
    Inherit,
    /// Macro call: the caller's macro file (if any) is reinstated on pop,
    /// resuming at the position it had reached.
    Restore(Option<FileReader>),
}

/// Interpreter context saved when entering a macro file or executing an
/// explicit context push.
#[derive(Debug)]
pub struct MacroFrame {
    pub state: GCodeState,
    pub source: SourceId,
    pub feed_rate: f64,
    pub axes_relative: bool,
    pub drives_relative: bool,
    pub doing_macro: bool,
    pub file: FrameFile,
}

/// Bounded stack of saved interpreter contexts. A push beyond the depth
/// limit fails and hands the frame back untouched; a pop on an empty stack
/// reports underflow.
#[derive(Debug, Default)]
pub struct MacroStack {
    frames: Vec<MacroFrame>,
}

impl MacroStack {
    pub fn new() -> Self {
        Self { frames: Vec::with_capacity(STACK_DEPTH) }
    }

    pub fn push(&mut self, frame: MacroFrame) -> Result<(), MacroFrame> {
        if self.frames.len() >= STACK_DEPTH {
            return Err(frame);
        }
        self.frames.push(frame);
        Ok(())
    }

    pub fn pop(&mut self) -> Result<MacroFrame, StackError> {
        self.frames.pop().ok_or(StackError::Underflow)
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn top(&self) -> Option<&MacroFrame> {
        self.frames.last()
    }
}
