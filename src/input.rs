//! Shared query input source
//!
//! One `QueryInput` feeds every sender thread; `next()` is internally
//! serialized so the descriptors are handed out exactly once per pass.
//! File sources rewind at EOF until the configured pass count is reached;
//! stdin is single-pass. Blocking stdin reads first poll the interrupt
//! descriptor so a termination wakes them.

use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;

use crate::net::poll::{wait_readable, Wait};

/// Input source errors
#[derive(Debug, Error)]
pub enum InputError {
    /// The configured number of passes has been completed. Terminal for
    /// the sender loop, not an error of the run.
    #[error("end of input")]
    EndOfInput,

    /// A full pass produced no usable line. Fatal.
    #[error("input contains no data")]
    InvalidFile,

    /// A blocking read was cancelled through the interrupt descriptor.
    #[error("input read cancelled")]
    Cancelled,

    #[error("input I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type InputResult<T> = Result<T, InputError>;

enum Source {
    File(BufReader<File>),
    Stdin(StdinLines),
}

struct Inner {
    source: Source,
    max_passes: u32,
    passes_done: u32,
    line_seen_this_pass: bool,
    interrupt_fd: Option<RawFd>,
}

/// Thread-safe source of query descriptors.
pub struct QueryInput {
    inner: Mutex<Inner>,
    path: Option<PathBuf>,
}

impl QueryInput {
    /// Open `path`, or stdin when `None`.
    pub fn open(path: Option<&Path>) -> std::io::Result<Self> {
        let source = match path {
            Some(p) => Source::File(BufReader::new(File::open(p)?)),
            None => Source::Stdin(StdinLines::new()),
        };
        Ok(QueryInput {
            inner: Mutex::new(Inner {
                source,
                max_passes: 1,
                passes_done: 0,
                line_seen_this_pass: false,
                interrupt_fd: None,
            }),
            path: path.map(Path::to_path_buf),
        })
    }

    /// Limit the number of passes over the input (0 = unlimited). Stdin
    /// is always single-pass regardless.
    pub fn set_max_passes(&self, n: u32) {
        self.inner.lock().unwrap().max_passes = n;
    }

    /// Register a descriptor that cancels blocking stdin reads when it
    /// becomes readable.
    pub fn set_interrupt_fd(&self, fd: RawFd) {
        self.inner.lock().unwrap().interrupt_fd = Some(fd);
    }

    /// Number of completed passes so far.
    pub fn passes(&self) -> u32 {
        self.inner.lock().unwrap().passes_done
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Fetch the next descriptor into `line`. Blank lines and `#`
    /// comments are skipped.
    pub fn next(&self, line: &mut String) -> InputResult<()> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            line.clear();
            let n = inner.read_line(line)?;
            if n == 0 {
                // End of a pass.
                if !inner.line_seen_this_pass {
                    return Err(InputError::InvalidFile);
                }
                inner.passes_done += 1;
                if inner.max_passes > 0 && inner.passes_done >= inner.max_passes {
                    return Err(InputError::EndOfInput);
                }
                let rewound = match &mut inner.source {
                    Source::File(reader) => {
                        reader.seek(SeekFrom::Start(0))?;
                        true
                    }
                    // Stdin cannot rewind.
                    Source::Stdin(_) => false,
                };
                if !rewound {
                    return Err(InputError::EndOfInput);
                }
                inner.line_seen_this_pass = false;
                continue;
            }
            let end = line.trim_end().len();
            line.truncate(end);
            let start = line.len() - line.trim_start().len();
            line.drain(..start);
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            inner.line_seen_this_pass = true;
            return Ok(());
        }
    }
}

impl Inner {
    fn read_line(&mut self, line: &mut String) -> InputResult<usize> {
        match &mut self.source {
            Source::File(reader) => Ok(reader.read_line(line)?),
            Source::Stdin(stdin) => stdin.read_line(line, self.interrupt_fd),
        }
    }
}

/// Line reader over the raw stdin descriptor.
///
/// `BufReader<Stdin>` cannot be polled without losing buffered bytes, so
/// stdin keeps its own buffer and polls the raw descriptor (together with
/// the interrupt descriptor) before every read(2).
struct StdinLines {
    buf: Vec<u8>,
    pos: usize,
    eof: bool,
}

impl StdinLines {
    fn new() -> Self {
        StdinLines {
            buf: Vec::new(),
            pos: 0,
            eof: false,
        }
    }

    fn read_line(&mut self, line: &mut String, interrupt_fd: Option<RawFd>) -> InputResult<usize> {
        loop {
            if let Some(nl) = self.buf[self.pos..].iter().position(|&b| b == b'\n') {
                let end = self.pos + nl + 1;
                line.push_str(&String::from_utf8_lossy(&self.buf[self.pos..end]));
                let n = end - self.pos;
                self.pos = end;
                if self.pos == self.buf.len() {
                    self.buf.clear();
                    self.pos = 0;
                }
                return Ok(n);
            }
            if self.eof {
                // Final unterminated line, if any.
                let n = self.buf.len() - self.pos;
                if n > 0 {
                    line.push_str(&String::from_utf8_lossy(&self.buf[self.pos..]));
                    self.buf.clear();
                    self.pos = 0;
                }
                return Ok(n);
            }
            self.fill(interrupt_fd)?;
        }
    }

    fn fill(&mut self, interrupt_fd: Option<RawFd>) -> InputResult<()> {
        if let Some(fd) = interrupt_fd {
            match wait_readable(&[libc::STDIN_FILENO], Some(fd), u64::MAX)? {
                Wait::Cancelled => return Err(InputError::Cancelled),
                Wait::Readable | Wait::TimedOut => {}
            }
        }
        let mut chunk = [0u8; 4096];
        let n = unsafe {
            libc::read(
                libc::STDIN_FILENO,
                chunk.as_mut_ptr() as *mut libc::c_void,
                chunk.len(),
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(InputError::Io(err));
        }
        if n == 0 {
            self.eof = true;
        } else {
            self.buf.extend_from_slice(&chunk[..n as usize]);
        }
        Ok(())
    }
}
