//! Annotated-SQL statement parser
//!
//! Turns one migration file into ordered apply/revert statement lists plus a
//! transaction-mode flag. This is not a SQL parser: it only understands
//! line-oriented directive comments (`-- +goose Up`, `-- +goose Down`,
//! `-- +goose StatementBegin`, `-- +goose StatementEnd`,
//! `-- +goose NO TRANSACTION`) and semicolon statement boundaries.
//!
//! The parser is an explicit finite-state machine: a file must begin with
//! `Up`, may switch to `Down` exactly once, and may suspend semicolon
//! splitting inside a `StatementBegin`/`StatementEnd` block so that bodies
//! with embedded semicolons (procedural SQL functions, triggers) are captured
//! verbatim as a single statement.

use crate::migration::Direction;

/// Comment prefix introducing a parser directive.
const ANNOTATION_PREFIX: &str = "+goose";

/// Errors produced while parsing a migration file
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// The file did not start with an `Up` annotation
    #[error("no '-- +goose Up' annotation found")]
    MissingUpAnnotation,

    /// A second `Up` annotation before `Down`
    #[error("line {0}: duplicate '-- +goose Up' annotation")]
    DuplicateUp(usize),

    /// `Down` before `Up`, or a second `Down`
    #[error("line {0}: '-- +goose Down' must come after a single '-- +goose Up' annotation")]
    OutOfOrderDown(usize),

    /// `StatementBegin` outside an `Up`/`Down` section or nested
    #[error("line {0}: '-- +goose StatementBegin' must be directly inside an Up or Down section")]
    MisplacedStatementBegin(usize),

    /// `StatementEnd` without an open `StatementBegin`
    #[error("line {0}: '-- +goose StatementEnd' without a matching '-- +goose StatementBegin'")]
    MisplacedStatementEnd(usize),

    /// End of input inside a `StatementBegin` block
    #[error("missing '-- +goose StatementEnd' before end of file")]
    UnterminatedBlock,

    /// A `+goose` annotation the parser does not recognize
    #[error("line {line}: unknown annotation '{annotation}'")]
    UnknownAnnotation { line: usize, annotation: String },

    /// SQL before the first annotation
    #[error("line {0}: statement outside of any '-- +goose Up' or '-- +goose Down' section")]
    StatementOutsideSection(usize),

    /// End of input with a non-empty, unflushed statement buffer
    #[error("unexpected unfinished SQL query: {0:?}: missing semicolon?")]
    UnfinishedStatement(String),
}

/// The fully parsed form of a migration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSql {
    /// Statements for the apply direction, in file order
    pub up: Vec<String>,
    /// Statements for the revert direction, in file order
    pub down: Vec<String>,
    /// Whether statements should run inside a transaction.
    ///
    /// `-- +goose NO TRANSACTION` clears this for the whole file, so the
    /// up and down halves can never disagree.
    pub use_tx: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    Up,
    StatementBeginUp,
    Down,
    StatementBeginDown,
}

/// Parse both directions of a migration file.
pub fn parse_migration(input: &str) -> Result<ParsedSql, ParseError> {
    parse_inner(input, None)
}

/// Parse a single direction, skipping statement collection for the other.
///
/// The whole file is still validated; only the unused half is not built.
pub fn parse_direction(input: &str, direction: Direction) -> Result<ParsedSql, ParseError> {
    parse_inner(input, Some(direction))
}

fn parse_inner(input: &str, only: Option<Direction>) -> Result<ParsedSql, ParseError> {
    let mut state = State::Start;
    let mut use_tx = true;
    let mut up: Vec<String> = Vec::new();
    let mut down: Vec<String> = Vec::new();
    let mut buf: Vec<&str> = Vec::new();

    for (idx, line) in input.lines().enumerate() {
        let line_no = idx + 1;
        let trimmed = line.trim();

        if let Some(comment) = trimmed.strip_prefix("--") {
            let comment = comment.trim_start();
            if let Some(annotation) = comment.strip_prefix(ANNOTATION_PREFIX) {
                let annotation = annotation.trim();
                state = apply_annotation(state, annotation, line_no, &mut use_tx, |dir| {
                    // StatementEnd flushes the open block as one statement.
                    flush_statement(&mut buf, dir, only, &mut up, &mut down);
                })?;
                continue;
            }
            // Plain comment: ignored between statements, kept verbatim once a
            // statement buffer is open.
            if buf.is_empty() && !in_block(state) {
                continue;
            }
            buf.push(line);
            continue;
        }

        if trimmed.is_empty() {
            if buf.is_empty() {
                continue;
            }
            buf.push(line);
            continue;
        }

        match state {
            State::Start => return Err(ParseError::StatementOutsideSection(line_no)),
            State::Up | State::Down => {
                let dir = section_direction(state);
                buf.push(line);
                if ends_with_semicolon(line) {
                    flush_statement(&mut buf, dir, only, &mut up, &mut down);
                }
            }
            State::StatementBeginUp | State::StatementBeginDown => {
                // Semicolon splitting is suspended inside the block.
                buf.push(line);
            }
        }
    }

    match state {
        State::Start => return Err(ParseError::MissingUpAnnotation),
        State::StatementBeginUp | State::StatementBeginDown => {
            return Err(ParseError::UnterminatedBlock)
        }
        State::Up | State::Down => {}
    }
    let leftover = buf.join("\n");
    if !leftover.trim().is_empty() {
        return Err(ParseError::UnfinishedStatement(leftover.trim().to_string()));
    }

    Ok(ParsedSql { up, down, use_tx })
}

fn apply_annotation(
    state: State,
    annotation: &str,
    line_no: usize,
    use_tx: &mut bool,
    mut flush: impl FnMut(Direction),
) -> Result<State, ParseError> {
    match annotation {
        "Up" => match state {
            State::Start => Ok(State::Up),
            _ => Err(ParseError::DuplicateUp(line_no)),
        },
        "Down" => match state {
            State::Up => Ok(State::Down),
            _ => Err(ParseError::OutOfOrderDown(line_no)),
        },
        "StatementBegin" => match state {
            State::Up => Ok(State::StatementBeginUp),
            State::Down => Ok(State::StatementBeginDown),
            _ => Err(ParseError::MisplacedStatementBegin(line_no)),
        },
        "StatementEnd" => match state {
            State::StatementBeginUp => {
                flush(Direction::Up);
                Ok(State::Up)
            }
            State::StatementBeginDown => {
                flush(Direction::Down);
                Ok(State::Down)
            }
            _ => Err(ParseError::MisplacedStatementEnd(line_no)),
        },
        "NO TRANSACTION" => {
            *use_tx = false;
            Ok(state)
        }
        other => Err(ParseError::UnknownAnnotation {
            line: line_no,
            annotation: other.to_string(),
        }),
    }
}

fn in_block(state: State) -> bool {
    matches!(state, State::StatementBeginUp | State::StatementBeginDown)
}

fn section_direction(state: State) -> Direction {
    match state {
        State::Down | State::StatementBeginDown => Direction::Down,
        _ => Direction::Up,
    }
}

fn flush_statement(
    buf: &mut Vec<&str>,
    dir: Direction,
    only: Option<Direction>,
    up: &mut Vec<String>,
    down: &mut Vec<String>,
) {
    let stmt = buf.join("\n").trim().to_string();
    buf.clear();
    if stmt.is_empty() || only.is_some_and(|o| o != dir) {
        return;
    }
    match dir {
        Direction::Up => up.push(stmt),
        Direction::Down => down.push(stmt),
    }
}

/// Whether a line terminates a statement: the last word before a trailing
/// comment must end with `;`. Only a whitespace-delimited word starting with
/// `--` opens a comment, so `--` inside a quoted literal stays part of the
/// statement.
fn ends_with_semicolon(line: &str) -> bool {
    let mut last = None;
    for word in line.split_whitespace() {
        if word.starts_with("--") {
            break;
        }
        last = Some(word);
    }
    last.is_some_and(|word| word.ends_with(';'))
}
