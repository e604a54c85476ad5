// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The textual command surface: a line-oriented grammar `verb(arg, ...)`
//! with `/` and `#` comment lines, a dispatcher that feeds parsed commands
//! to the [Coordinator], and the blocking run loop the binary uses.
//!
//! Parse failures are reported as `Error:` lines and never reach the
//! coordinator, so a malformed line does not advance the logical clock.

use crate::{placement, Coordinator, Error, Event, SiteId, VarId};
use std::io::{self, BufRead, Write};

/// One parsed command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Begin { txn: String },
    Read { txn: String, var: VarId },
    Write { txn: String, var: VarId, value: i64 },
    End { txn: String },
    Fail { site: SiteId },
    Recover { site: SiteId },
    Dump,
}

/// Parse one input line. `Ok(None)` for blanks and comments.
pub fn parse_line(line: &str) -> Result<Option<Command>, Error> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('/') || line.starts_with('#') {
        return Ok(None);
    }
    let open = match line.find('(') {
        None => return Err(Error::InvalidCommand(line.to_string())),
        Some(i) => i,
    };
    let close = match line.rfind(')') {
        None => return Err(Error::InvalidCommand(line.to_string())),
        Some(i) if i > open => i,
        Some(_) => return Err(Error::InvalidCommand(line.to_string())),
    };
    let verb = line[..open].trim();
    let args: Vec<&str> = line[open + 1..close]
        .split(',')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .collect();

    let arity = |expected: usize| -> Result<(), Error> {
        if args.len() == expected {
            Ok(())
        } else {
            Err(Error::WrongArity {
                verb: verb.to_string(),
                expected,
            })
        }
    };

    match verb {
        "begin" => {
            arity(1)?;
            Ok(Some(Command::Begin {
                txn: args[0].to_string(),
            }))
        }
        "R" => {
            arity(2)?;
            Ok(Some(Command::Read {
                txn: args[0].to_string(),
                var: parse_var(args[1])?,
            }))
        }
        "W" => {
            arity(3)?;
            Ok(Some(Command::Write {
                txn: args[0].to_string(),
                var: parse_var(args[1])?,
                value: args[2]
                    .parse()
                    .map_err(|_| Error::BadValue(args[2].to_string()))?,
            }))
        }
        "end" => {
            arity(1)?;
            Ok(Some(Command::End {
                txn: args[0].to_string(),
            }))
        }
        "fail" => {
            arity(1)?;
            Ok(Some(Command::Fail {
                site: parse_site(args[0])?,
            }))
        }
        "recover" => {
            arity(1)?;
            Ok(Some(Command::Recover {
                site: parse_site(args[0])?,
            }))
        }
        "dump" => {
            arity(0)?;
            Ok(Some(Command::Dump))
        }
        _ => Err(Error::UnknownCommand(verb.to_string())),
    }
}

/// A variable literal is `xN` or bare `N`, with `N` in range.
fn parse_var(tok: &str) -> Result<VarId, Error> {
    let digits = tok.strip_prefix('x').unwrap_or(tok);
    match digits.parse::<u32>() {
        Ok(n) if n >= 1 && n <= placement::NUM_VARIABLES => Ok(VarId(n)),
        _ => Err(Error::BadVariable(tok.to_string())),
    }
}

fn parse_site(tok: &str) -> Result<SiteId, Error> {
    match tok.parse::<u32>() {
        Ok(n) if n >= 1 && n <= placement::NUM_SITES => Ok(SiteId(n)),
        _ => Err(Error::BadSite(tok.to_string())),
    }
}

/// Owns a [Coordinator] and applies commands to it in input order.
pub struct Dispatcher {
    coordinator: Coordinator,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Dispatcher::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Dispatcher {
            coordinator: Coordinator::new(),
        }
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn apply(&mut self, command: Command) -> Vec<Event> {
        match command {
            Command::Begin { txn } => self.coordinator.begin(&txn),
            Command::Read { txn, var } => self.coordinator.read(&txn, var),
            Command::Write { txn, var, value } => self.coordinator.write(&txn, var, value),
            Command::End { txn } => self.coordinator.end(&txn),
            Command::Fail { site } => self.coordinator.fail(site),
            Command::Recover { site } => self.coordinator.recover(site),
            Command::Dump => self.coordinator.dump(),
        }
    }

    /// Parse and apply one line; a parse failure becomes a single
    /// diagnostic event.
    pub fn dispatch_line(&mut self, line: &str) -> Vec<Event> {
        match parse_line(line) {
            Ok(None) => Vec::new(),
            Ok(Some(command)) => self.apply(command),
            Err(e) => vec![Event::Failed(e)],
        }
    }
}

/// Drain `input` line by line, writing each operation's output lines to
/// `output`. Returns on end of stream.
pub fn run<R: BufRead, W: Write>(input: R, output: &mut W) -> io::Result<()> {
    let mut dispatcher = Dispatcher::new();
    for line in input.lines() {
        let line = line?;
        for event in dispatcher.dispatch_line(&line) {
            writeln!(output, "{}", event)?;
        }
    }
    Ok(())
}
