use std::fmt;
use std::io;
use std::process::ExitStatus;

/// Kinds of line-scoped problems found while scanning a dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParseErrorKind {
    /// `*` with no table name.
    MalformedTableHeader,
    /// Chain header without exactly three fields, or with an empty name.
    MalformedChainHeader,
    /// Counter token missing or not `[packets:bytes]`.
    MalformedCounters,
    /// Rule line without an `-A <chain>` pair.
    MissingTarget,
    /// Chain header or rule seen while no table is open.
    OutsideTable,
    /// Line matches none of the known shapes.
    UnhandledLineKind,
}

impl ParseErrorKind {
    pub fn message(&self) -> &'static str {
        match self {
            Self::MalformedTableHeader => "expected *table",
            Self::MalformedChainHeader => "expected 3 fields",
            Self::MalformedCounters => "expected [packets:bytes]",
            Self::MissingTarget => "expected -A chain ...",
            Self::OutsideTable => "expected *table before chains and rules",
            Self::UnhandledLineKind => "unhandled line",
        }
    }
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// One malformed line. `line_text` is the line after whitespace trimming.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} at line {line_number}: {line_text:?}")]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub line_number: usize,
    pub line_text: String,
}

impl ParseError {
    pub fn new(kind: ParseErrorKind, line_number: usize, line_text: &str) -> Self {
        Self {
            kind,
            line_number,
            line_text: line_text.to_string(),
        }
    }
}

/// Every line-scoped error of one scan, in the order they were found.
///
/// A non-empty accumulator fails the whole parse.
#[derive(Debug, Clone, PartialEq, Eq, Default, thiserror::Error)]
#[error("{}", join_lines(.0))]
pub struct ParseErrors(Vec<ParseError>);

fn join_lines(errors: &[ParseError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

impl ParseErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: ParseError) {
        self.0.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ParseError> {
        self.0.iter()
    }

    /// Distinct offending line numbers, ascending.
    pub fn line_numbers(&self) -> Vec<usize> {
        let mut lines: Vec<usize> = self.0.iter().map(|e| e.line_number).collect();
        lines.sort_unstable();
        lines.dedup();
        lines
    }

    pub fn into_vec(self) -> Vec<ParseError> {
        self.0
    }
}

impl<'a> IntoIterator for &'a ParseErrors {
    type Item = &'a ParseError;
    type IntoIter = std::slice::Iter<'a, ParseError>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Failure of one collection cycle.
///
/// Process and stream failures are kept apart from grammar failures so
/// a missing binary is distinguishable from unparseable output.
#[derive(Debug, thiserror::Error)]
pub enum SaveError {
    #[error("failed to read iptables-save output: {0}")]
    Read(#[from] io::Error),

    #[error("failed to start {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to wait for {command}: {source}")]
    Wait {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("{command} exited with {status}: {stderr}")]
    Exit {
        command: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("failed to parse iptables-save output:\n{0}")]
    Parse(#[from] ParseErrors),
}

impl SaveError {
    /// Line-scoped errors, when the failure was a grammar failure.
    pub fn parse_errors(&self) -> Option<&ParseErrors> {
        match self {
            Self::Parse(errors) => Some(errors),
            _ => None,
        }
    }

    /// Short label for logs and metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Read(_) => "read",
            Self::Spawn { .. } => "spawn",
            Self::Wait { .. } | Self::Exit { .. } => "exit",
            Self::Parse(_) => "parse",
        }
    }
}
