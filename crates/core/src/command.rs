//! Command construction and sanitisation
//!
//! Docker invocations are accumulated as ordered argument groups so optional
//! flags (DNS entries, env vars) can be spliced in without string surgery,
//! then flattened once: [`CommandBuilder::to_argv`] for local subprocesses and
//! [`CommandBuilder::to_shell_string`] for transports that only accept a
//! single command string.

use std::borrow::Cow;
use std::collections::BTreeMap;
use tracing::warn;

/// Quoting dialect of the shell that will receive a joined command string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quoting {
    /// POSIX sh / bash
    Posix,
    /// Windows PowerShell
    PowerShell,
    /// `cmd.exe`, which only understands double quotes
    Cmd,
}

/// One logical argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    /// Single token, quoted when joined into a shell string
    Literal(String),
    /// Operator passed through unescaped (`|`, `>`, `&&`)
    Raw(String),
    /// Untrusted single-string command: one argv element, sanitised token by
    /// token when joined into a shell string
    UserCommand(String),
}

/// Builder accumulating argument groups for one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandBuilder {
    program: String,
    groups: Vec<Vec<Arg>>,
}

impl CommandBuilder {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            groups: Vec::new(),
        }
    }

    /// Append a single literal argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.groups.push(vec![Arg::Literal(arg.into())]);
        self
    }

    /// Append several literal arguments as one group
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups
            .push(args.into_iter().map(|a| Arg::Literal(a.into())).collect());
        self
    }

    /// Append `flag value` once per value, e.g. `--env A=1 --env B=2`
    pub fn repeated<I, S>(mut self, flag: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for value in values {
            self.groups.push(vec![
                Arg::Literal(flag.to_string()),
                Arg::Literal(value.into()),
            ]);
        }
        self
    }

    /// Append an unescaped shell operator
    pub fn raw(mut self, operator: impl Into<String>) -> Self {
        self.groups.push(vec![Arg::Raw(operator.into())]);
        self
    }

    /// Append a user-supplied command string
    pub fn user_command(mut self, command: impl Into<String>) -> Self {
        self.groups.push(vec![Arg::UserCommand(command.into())]);
        self
    }

    /// Append another command after a raw operator, e.g. `a | b`
    pub fn pipe_into(self, operator: &str, next: CommandBuilder) -> Self {
        let mut combined = self.raw(operator).arg(next.program);
        combined.groups.extend(next.groups);
        combined
    }

    /// Flatten into an argv vector, program first
    ///
    /// Raw operators are passed through as-is; only meaningful for builders
    /// that will be joined into a shell string.
    pub fn to_argv(&self) -> Vec<String> {
        let mut argv = vec![self.program.clone()];
        for arg in self.groups.iter().flatten() {
            match arg {
                Arg::Literal(s) | Arg::Raw(s) | Arg::UserCommand(s) => argv.push(s.clone()),
            }
        }
        argv
    }

    /// Join into one command string for a remote shell
    pub fn to_shell_string(&self, quoting: Quoting) -> String {
        let mut parts = vec![quote(&self.program, quoting).into_owned()];
        for arg in self.groups.iter().flatten() {
            match arg {
                Arg::Literal(s) => parts.push(quote(s, quoting).into_owned()),
                Arg::Raw(s) => parts.push(s.clone()),
                Arg::UserCommand(s) => {
                    let sanitized = sanitize(s, quoting);
                    if !sanitized.is_empty() {
                        parts.push(sanitized);
                    }
                }
            }
        }
        parts.join(" ")
    }
}

/// Split a raw command on whitespace, drop empty tokens, quote each token and
/// rejoin
pub fn sanitize(raw: &str, quoting: Quoting) -> String {
    raw.split_whitespace()
        .map(|token| quote(token, quoting))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Quote a single token for the given shell
pub fn quote(token: &str, quoting: Quoting) -> Cow<'_, str> {
    match quoting {
        Quoting::Posix => shell_words::quote(token),
        Quoting::PowerShell => powershell_quote(token),
        Quoting::Cmd => cmd_quote(token),
    }
}

fn cmd_quote(token: &str) -> Cow<'_, str> {
    let safe = !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:\\".contains(c));
    if safe {
        Cow::Borrowed(token)
    } else {
        Cow::Owned(format!("\"{}\"", token.replace('"', "\"\"")))
    }
}

fn powershell_quote(token: &str) -> Cow<'_, str> {
    let safe = !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=\\,".contains(c));
    if safe {
        Cow::Borrowed(token)
    } else {
        Cow::Owned(format!("'{}'", token.replace('\'', "''")))
    }
}

/// Whether `name` is a portable environment variable name
/// (`[A-Za-z_][A-Za-z0-9_]*`)
pub fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Prefix `command` with one quoted `export NAME=value;` per variable
///
/// Variables with invalid names are dropped; names cannot be quoted.
pub fn with_env_exports(command: &str, env: &BTreeMap<String, String>) -> String {
    let mut prefixed = String::new();
    for (name, value) in env {
        if !is_env_name(name) {
            warn!("Not exporting invalid variable name {:?}", name);
            continue;
        }
        prefixed.push_str(&format!("export {}={}; ", name, shell_words::quote(value)));
    }
    prefixed.push_str(command);
    prefixed
}

/// Wrap `command` so it runs inside `dir`
pub fn in_directory(dir: &str, command: &str) -> String {
    format!("cd {} && {}", shell_words::quote(dir), command)
}
