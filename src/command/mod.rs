pub mod handlers;

use crate::trie::Trie;
use std::collections::HashMap;

/// Broad behavior class of a command, used by the dispatch chain to
/// decide on propagation and offset accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    Read,
    Write,
    Info,
    Repl,
}

/// How a request token is matched against a table entry's name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchPolicy {
    Exact,
    /// The entry matches any token it prefixes; trailing characters are
    /// ignored. This is how the `+FULLRESYNC <id> <offset>` status line
    /// resolves to the FULLRESYNC entry.
    Prefix,
}

/// A named option and the arity of sub-arguments it consumes.
#[derive(Debug)]
pub struct OptionSpec {
    pub name: &'static str,
    pub args: &'static [&'static str],
}

/// One command table entry.
#[derive(Debug)]
pub struct CommandSpec {
    pub name: &'static str,
    pub args: &'static [&'static str],
    pub options: &'static [OptionSpec],
    pub class: CommandClass,
    pub policy: MatchPolicy,
}

/// The shipped command table.
///
/// INFO's sections are modeled as zero-arity options so both `INFO` and
/// `INFO replication` resolve against a fixed positional arity.
static SPECS: &[CommandSpec] = &[
    CommandSpec {
        name: "PING",
        args: &[],
        options: &[],
        class: CommandClass::Read,
        policy: MatchPolicy::Exact,
    },
    CommandSpec {
        name: "ECHO",
        args: &["message"],
        options: &[],
        class: CommandClass::Read,
        policy: MatchPolicy::Exact,
    },
    CommandSpec {
        name: "GET",
        args: &["key"],
        options: &[],
        class: CommandClass::Read,
        policy: MatchPolicy::Exact,
    },
    CommandSpec {
        name: "SET",
        args: &["key", "value"],
        options: &[OptionSpec {
            name: "PX",
            args: &["milliseconds"],
        }],
        class: CommandClass::Write,
        policy: MatchPolicy::Exact,
    },
    CommandSpec {
        name: "INFO",
        args: &[],
        options: &[
            OptionSpec {
                name: "replication",
                args: &[],
            },
            OptionSpec {
                name: "server",
                args: &[],
            },
            OptionSpec {
                name: "stats",
                args: &[],
            },
        ],
        class: CommandClass::Info,
        policy: MatchPolicy::Exact,
    },
    CommandSpec {
        name: "REPLCONF",
        args: &[],
        options: &[
            OptionSpec {
                name: "listening-port",
                args: &["port"],
            },
            OptionSpec {
                name: "capa",
                args: &["capability"],
            },
            OptionSpec {
                name: "GETACK",
                args: &["target"],
            },
            OptionSpec {
                name: "ACK",
                args: &["offset"],
            },
        ],
        class: CommandClass::Repl,
        policy: MatchPolicy::Exact,
    },
    CommandSpec {
        name: "PSYNC",
        args: &["replication-id", "offset"],
        options: &[],
        class: CommandClass::Repl,
        policy: MatchPolicy::Exact,
    },
    CommandSpec {
        name: "WAIT",
        args: &["numreplicas", "timeout"],
        options: &[],
        class: CommandClass::Info,
        policy: MatchPolicy::Exact,
    },
    CommandSpec {
        name: "OK",
        args: &[],
        options: &[],
        class: CommandClass::Repl,
        policy: MatchPolicy::Exact,
    },
    CommandSpec {
        name: "PONG",
        args: &[],
        options: &[],
        class: CommandClass::Repl,
        policy: MatchPolicy::Exact,
    },
    CommandSpec {
        name: "FULLRESYNC",
        args: &[],
        options: &[],
        class: CommandClass::Repl,
        policy: MatchPolicy::Prefix,
    },
];

/// A resolved request.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// Canonical upper-case name from the table.
    pub name: &'static str,
    pub args: Vec<String>,
    /// Keyed by the canonical option name as declared in the table.
    pub options: HashMap<&'static str, Vec<String>>,
    pub class: CommandClass,
}

impl Command {
    pub fn option(&self, name: &str) -> Option<&[String]> {
        self.options.get(name).map(|v| v.as_slice())
    }

    pub fn has_option(&self, name: &str) -> bool {
        self.options.contains_key(name)
    }
}

/// Resolves flattened request tokens against the command table.
///
/// Exact entries live in a map, prefix entries in a byte trie; the map
/// is consulted first so an exact match always wins.
pub struct CommandTable {
    exact: HashMap<&'static str, &'static CommandSpec>,
    prefix: Trie<&'static CommandSpec>,
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl CommandTable {
    /// Load the static shipped table.
    pub fn standard() -> Self {
        let mut exact = HashMap::new();
        let mut prefix = Trie::new();
        for spec in SPECS {
            match spec.policy {
                MatchPolicy::Exact => {
                    exact.insert(spec.name, spec);
                }
                MatchPolicy::Prefix => {
                    prefix.insert(spec.name, spec);
                }
            }
        }
        CommandTable { exact, prefix }
    }

    fn lookup(&self, name: &str) -> Option<&'static CommandSpec> {
        if let Some(spec) = self.exact.get(name) {
            return Some(*spec);
        }
        self.prefix.longest_prefix(name).map(|(_, spec)| *spec)
    }

    /// Resolve a flat token sequence into a structured command.
    pub fn resolve(&self, tokens: &[String]) -> Result<Command, CommandError> {
        let first = tokens.first().ok_or(CommandError::EmptyRequest)?;
        let name = first.to_uppercase();

        let spec = self
            .lookup(&name)
            .ok_or_else(|| CommandError::UnknownCommand(name.clone()))?;

        let rest = &tokens[1..];
        if rest.len() < spec.args.len() {
            return Err(CommandError::TooFewArguments {
                command: spec.name,
                expected: spec.args.len(),
                got: rest.len(),
            });
        }
        let args: Vec<String> = rest[..spec.args.len()].to_vec();

        let mut options = HashMap::new();
        let mut cursor = spec.args.len();
        while cursor < rest.len() {
            let token = &rest[cursor];
            let opt = spec
                .options
                .iter()
                .find(|o| o.name.eq_ignore_ascii_case(token))
                .ok_or_else(|| CommandError::UnknownOption {
                    command: spec.name,
                    option: token.clone(),
                })?;
            cursor += 1;

            let remaining = rest.len() - cursor;
            if remaining < opt.args.len() {
                return Err(CommandError::TooFewOptionArgs {
                    command: spec.name,
                    option: opt.name,
                    expected: opt.args.len(),
                    got: remaining,
                });
            }
            let opt_args = rest[cursor..cursor + opt.args.len()].to_vec();
            cursor += opt.args.len();
            options.insert(opt.name, opt_args);
        }

        Ok(Command {
            name: spec.name,
            args,
            options,
            class: spec.class,
        })
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CommandError {
    #[error("empty request")]
    EmptyRequest,

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("wrong number of arguments for '{command}', expected {expected}, got {got}")]
    TooFewArguments {
        command: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("unknown option '{option}' for '{command}'")]
    UnknownOption {
        command: &'static str,
        option: String,
    },

    #[error("option '{option}' of '{command}' expects {expected} arguments, got {got}")]
    TooFewOptionArgs {
        command: &'static str,
        option: &'static str,
        expected: usize,
        got: usize,
    },
}
