use crate::helpe::*;

/// Column the echoed trace line is padded to before the comment.
pub const DEFAULT_WIDTH: usize = 49;

struct Side<'a>(&'a str, Option<Neighbour>);

impl fmt::Display for Side<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.1 {
            Some(n) => write!(f, "{} {:x}, gap {}", self.0, n.address, n.gap),
            None    => write!(f, "{} none, gap none", self.0),
        }
    }
}

/// Turns a [Report] into the comment appended to its trace line.
/// `None` means the line is echoed bare.
pub fn describe(report: &Report, mode: Mode) -> Option<String> {
    match (report, mode) {
        (Report::Malloc(_), Mode::Lifetimes) => None,
        (Report::Malloc(r), Mode::Overhead) => {
            Some(format!("{}, {}, pages [{}, {}], {} more pages",
                Side("prev", r.prev),
                Side("next", r.next),
                r.pages.first,
                r.pages.last,
                r.new_pages,
            ))
        },
        (Report::Free(r), Mode::Lifetimes) => {
            Some(format!("{} bytes, allocated {} lines ago", r.size, r.age))
        },
        (Report::Free(r), Mode::Overhead) => {
            Some([
                format!("{} bytes, allocated {} lines ago", r.size, r.age),
                Side("prev", r.prev).to_string(),
                Side("next", r.next).to_string(),
                format!("pages [{}-{}]", r.pages.first, r.pages.last),
            ].iter().join(", "))
        },
    }
}

/// The driver: counts lines, parses them, feeds the [HeapTracker]
/// and echoes every line with its annotation.
///
/// Lines must come in trace order, one [Annotator] per trace.
pub struct Annotator {
    heap:   HeapTracker,
    mode:   Mode,
    width:  usize,
    line:   LineNo,
}

impl Annotator {
    pub fn new(heap: HeapTracker, mode: Mode, width: usize) -> Self {
        Self {
            heap,
            mode,
            width,
            line: 0,
        }
    }

    pub fn heap(&self) -> &HeapTracker {
        &self.heap
    }

    /// Number of lines consumed so far.
    pub fn lines_seen(&self) -> LineNo {
        self.line
    }

    /// Consumes the next trace line, returning what should be printed
    /// in its place. Trailing whitespace is not echoed.
    pub fn annotate_line(&mut self, text: &str) -> Result<String, TraceError> {
        self.line += 1;
        let line = self.line;
        let text = text.trim_end();
        let event = parse_event(text).map_err(|source| TraceError::Parse { line, source })?;
        let report = self.heap
            .apply(&event, line)
            .map_err(|source| TraceError::Heap { line, source })?;

        Ok(match describe(&report, self.mode) {
            Some(note)  => format!("{:width$} # {}", text, note, width = self.width),
            None        => text.to_string(),
        })
    }

    /// Annotates a whole trace. Whatever was written before a failing
    /// line stays written.
    pub fn run<R: BufRead, W: Write>(&mut self, input: R, mut out: W) -> Result<LineNo, TraceError> {
        for l in input.lines() {
            let res = match l {
                Ok(text)    => self.annotate_line(&text),
                Err(source) => {
                    self.line += 1;
                    Err(TraceError::Read { line: self.line, source })
                },
            };
            match res {
                Ok(s)   => { writeln!(out, "{}", s)?; },
                Err(e)  => {
                    out.flush()?;
                    return Err(e);
                }
            }
        }
        out.flush()?;

        Ok(self.line)
    }
}
