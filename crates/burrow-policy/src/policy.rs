use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::paths::{is_within, normalize, resolve_within};

/// Command names refused wherever they appear as a token: elevation, permission changes, remote access.
const BLOCKED_WORDS: &[&str] = &[
    "sudo", "su", "doas", "chmod", "chown", "ssh", "scp", "telnet", "curl", "wget", "nc", "ncat",
    "nmap",
];

/// Fragments refused anywhere in the whitespace-collapsed command.
const BLOCKED_PHRASES: &[&str] = &["rm -rf /", "rm -fr /", "rm -rf ~", "rm -rf *", ":(){"];

/// Chaining, piping, redirection, and substitution operators. Longer operators come first.
const SHELL_OPERATORS: &[&str] = &["&&", "||", "$(", ";", "|", ">", "<", "`"];

/// Commands that move the working directory.
const DIRECTORY_CHANGE: &[&str] = &["cd", "chdir"];

/// Why a command or path was refused. The display text is shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Denial {
    #[error("'{0}' is not allowed for security reasons")]
    Blocked(String),
    #[error("shell operator '{0}' is not allowed; run one command at a time")]
    ShellOperator(String),
    #[error("cannot use absolute paths for security reasons: {0}")]
    AbsolutePath(String),
    #[error("home directory expansion is not allowed: {0}")]
    HomeExpansion(String),
    #[error("cannot navigate outside of project directory")]
    EscapesSandbox,
    #[error("current directory is outside of project directory")]
    OutsideSandbox,
    #[error("{0}")]
    InvalidArguments(String),
}

/// Outcome of evaluating one command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandDecision {
    pub allowed: bool,
    pub reason: Option<Denial>,
    /// Target directory for an allowed directory-change command.
    pub resolved_cwd: Option<PathBuf>,
}

impl CommandDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            resolved_cwd: None,
        }
    }

    fn change_dir(target: PathBuf) -> Self {
        Self {
            allowed: true,
            reason: None,
            resolved_cwd: Some(target),
        }
    }

    fn deny(reason: Denial) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            resolved_cwd: None,
        }
    }
}

/// Pure allow/deny predicate over raw command lines.
#[derive(Debug, Clone)]
pub struct CommandPolicy {
    blocked_words: Vec<String>,
    blocked_phrases: Vec<String>,
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self {
            blocked_words: BLOCKED_WORDS.iter().map(|w| w.to_string()).collect(),
            blocked_phrases: BLOCKED_PHRASES.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl CommandPolicy {
    /// Adds an extra command name to refuse.
    pub fn with_blocked_word(mut self, word: impl Into<String>) -> Self {
        self.blocked_words.push(word.into());
        self
    }

    /// Decides whether `command`, typed in `current_dir`, may run inside `sandbox_root`.
    pub fn evaluate(&self, command: &str, current_dir: &Path, sandbox_root: &Path) -> CommandDecision {
        let command = command.trim();

        if let Some(denial) = self.blocked_fragment(command) {
            return CommandDecision::deny(denial);
        }
        if let Some(operator) = SHELL_OPERATORS.iter().find(|op| command.contains(**op)) {
            return CommandDecision::deny(Denial::ShellOperator(operator.to_string()));
        }

        match base_command(command) {
            Some(base) if DIRECTORY_CHANGE.contains(&base) => {
                match change_directory(command, current_dir, sandbox_root) {
                    Ok(target) => CommandDecision::change_dir(target),
                    Err(denial) => CommandDecision::deny(denial),
                }
            }
            _ => CommandDecision::allow(),
        }
    }

    /// Matches blocked words against both the raw tokens and the shell-unquoted argv,
    /// so `c''url` and `s\udo` are caught the same as their plain spellings.
    fn blocked_fragment(&self, command: &str) -> Option<Denial> {
        let argv = match shell_words::split(command) {
            Ok(argv) => argv,
            Err(err) => {
                return Some(Denial::InvalidArguments(format!("cannot parse command: {err}")));
            }
        };

        let raw = command
            .split_whitespace()
            .map(|token| token.trim_matches(|ch| ch == '"' || ch == '\''));
        for token in raw.chain(argv.iter().map(String::as_str)) {
            if let Some(word) = self.blocked_word(token) {
                return Some(Denial::Blocked(word.to_string()));
            }
        }

        let collapsed = command.split_whitespace().collect::<Vec<_>>().join(" ");
        let unquoted = argv.join(" ");
        self.blocked_phrases
            .iter()
            .find(|phrase| collapsed.contains(phrase.as_str()) || unquoted.contains(phrase.as_str()))
            .map(|phrase| Denial::Blocked(phrase.clone()))
    }

    fn blocked_word(&self, token: &str) -> Option<&str> {
        let name = token.rsplit(['/', '\\']).next().unwrap_or(token);
        self.blocked_words
            .iter()
            .find(|word| *word == token || *word == name)
            .map(String::as_str)
    }
}

/// Returns the first whitespace-separated token of a command line.
pub fn base_command(command: &str) -> Option<&str> {
    command.split_whitespace().next()
}

fn change_directory(command: &str, current_dir: &Path, sandbox_root: &Path) -> Result<PathBuf, Denial> {
    let current = normalize(current_dir);
    if !is_within(&current, sandbox_root) {
        return Err(Denial::OutsideSandbox);
    }

    let argv = shell_words::split(command)
        .map_err(|err| Denial::InvalidArguments(format!("cd: {err}")))?;

    match argv.as_slice() {
        [_] => Ok(normalize(sandbox_root)),
        [_, target] if target == "-" => Err(Denial::InvalidArguments(
            "cd: previous directory is not tracked".to_string(),
        )),
        [_, target] => resolve_within(&current, target, sandbox_root),
        _ => Err(Denial::InvalidArguments("cd: too many arguments".to_string())),
    }
}
