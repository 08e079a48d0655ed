//! Command Validation Module
//!
//! Command text from a tool call is forwarded to the CLI as argument tokens,
//! never as a shell line. Any shell syntax in it is therefore an injection
//! attempt and is rejected outright, even where the CLI itself would accept
//! the characters.
//!
//! Policy (allow / confirm / forbid lists) is loaded once from configuration
//! into a [`CommandPolicy`]; malformed patterns fail at startup.

use crate::config::PolicyConfig;
use std::path::{Component, Path, PathBuf};

/// Characters that indicate shell interpretation:
/// - ; : Command separator
/// - | : Pipe
/// - & : Background execution / AND list
/// - $ : Variable expansion
/// - ` : Command substitution
/// - ( ) : Subshell
/// - < > : Redirection
const SHELL_METACHARACTERS: [char; 9] = [';', '|', '&', '$', '`', '(', ')', '<', '>'];

/// Global switches the CLI accepts before the command words
const GLOBAL_SWITCHES: [&str; 5] = ["--debug", "--verbose", "--only-show-errors", "--help", "-h"];

/// Global options that take a value, accepted before the command words
const GLOBAL_OPTIONS: [&str; 4] = ["--output", "-o", "--query", "--subscription"];

/// Flags whose value is a local file path
const PATH_FLAGS: [&str; 4] = ["--file", "--template-file", "--output-file", "--local-path"];

/// Error types for policy construction
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("command pattern '{pattern}' is malformed: {reason}")]
    MalformedPattern { pattern: String, reason: String },

    #[error("file root '{0}' must not contain '..'")]
    InvalidFileRoot(String),
}

/// Outcome of validating one command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationVerdict {
    /// The command may run; carries the tokenized arguments
    Allowed(SafeCommand),

    /// The command must not run
    Rejected { reason: String },
}

impl ValidationVerdict {
    fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed(_))
    }
}

/// What the gateway should do with an allowed command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandAction {
    /// Run through the executor
    Execute,

    /// Route to the managed authentication flow
    Login,

    /// Run through the executor, then reset the session
    Logout,
}

/// Safe command wrapper that has been validated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafeCommand {
    /// Arguments passed to the CLI binary
    pub args: Vec<String>,

    /// Whether an authenticated session is required before running
    pub requires_auth: bool,

    action: CommandAction,
}

impl SafeCommand {
    pub fn action(&self) -> CommandAction {
        self.action
    }
}

impl CommandAction {
    fn of(command_words: &[String]) -> Self {
        match command_words.first().map(String::as_str) {
            Some("login") => Self::Login,
            Some("logout") => Self::Logout,
            _ => Self::Execute,
        }
    }
}

/// A subcommand pattern such as `group delete` or `account *`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPattern {
    words: Vec<String>,
}

impl CommandPattern {
    /// Parse a pattern, rejecting anything that is not plain command words
    pub fn parse(raw: &str) -> Result<Self, PolicyError> {
        let malformed = |reason: &str| PolicyError::MalformedPattern {
            pattern: raw.to_string(),
            reason: reason.to_string(),
        };

        let words: Vec<String> = raw.split_whitespace().map(str::to_lowercase).collect();
        if words.is_empty() {
            return Err(malformed("empty pattern"));
        }
        for word in &words {
            if word == "*" {
                continue;
            }
            let valid = word
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
            if !valid {
                return Err(malformed("only letters, digits, '-', '_', '.' and '*' are allowed"));
            }
        }
        if words.len() > 1 && words.iter().any(|w| w.starts_with('-')) {
            return Err(malformed("flags are only allowed as single-word patterns"));
        }

        Ok(Self { words })
    }

    fn word_matches(pattern: &str, token: &str) -> bool {
        pattern == "*" || pattern.eq_ignore_ascii_case(token)
    }

    /// Pattern words are a prefix of `tokens`
    pub fn matches_prefix(&self, tokens: &[String]) -> bool {
        tokens.len() >= self.words.len()
            && self
                .words
                .iter()
                .zip(tokens)
                .all(|(p, t)| Self::word_matches(p, t))
    }

    /// Pattern words appear contiguously anywhere in `tokens`
    pub fn matches_anywhere(&self, tokens: &[String]) -> bool {
        if tokens.len() < self.words.len() {
            return false;
        }
        tokens
            .windows(self.words.len())
            .any(|window| self.matches_prefix(window))
    }

    /// Match a deny or forbid rule against a tokenized command
    ///
    /// Word patterns look only at the command words. A single-flag pattern
    /// such as `--force` matches that flag anywhere, with or without `=value`.
    pub fn matches_command(&self, command_words: &[String], args: &[String]) -> bool {
        match self.words.as_slice() {
            [flag] if flag.starts_with('-') => args.iter().any(|arg| {
                let name = arg.split_once('=').map_or(arg.as_str(), |(name, _)| name);
                name.eq_ignore_ascii_case(flag)
            }),
            _ => self.matches_anywhere(command_words),
        }
    }
}

impl std::fmt::Display for CommandPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.words.join(" "))
    }
}

/// Enumerated command policy, built once at startup
#[derive(Debug, Clone, Default)]
pub struct CommandPolicy {
    allowed: Vec<CommandPattern>,
    confirm_required: Vec<CommandPattern>,
    forbidden: Vec<CommandPattern>,
    unauthenticated: Vec<CommandPattern>,
    file_roots: Vec<PathBuf>,
    max_length: usize,
}

impl CommandPolicy {
    /// Build and validate a policy from configuration
    pub fn from_config(config: &PolicyConfig) -> Result<Self, PolicyError> {
        let parse_all = |raw: &[String]| -> Result<Vec<CommandPattern>, PolicyError> {
            raw.iter().map(|p| CommandPattern::parse(p)).collect()
        };

        for root in &config.allowed_file_roots {
            if root.components().any(|c| matches!(c, Component::ParentDir)) {
                return Err(PolicyError::InvalidFileRoot(root.display().to_string()));
            }
        }

        Ok(Self {
            allowed: parse_all(&config.allowed_commands)?,
            confirm_required: parse_all(&config.denied_commands)?,
            forbidden: parse_all(&config.forbidden_commands)?,
            unauthenticated: parse_all(&config.unauthenticated_commands)?,
            file_roots: config.allowed_file_roots.clone(),
            max_length: config.max_command_length,
        })
    }
}

/// Command validator that enforces the security policy
///
/// # Security Principles
///
/// 1. **No Shell Injection**: shell metacharacters and control characters
///    are rejected before tokenizing
/// 2. **Policy Lists**: forbidden commands never run, confirmation-gated
///    commands run only with an explicit confirmation
/// 3. **Path Validation**: `@file` and path-valued arguments must stay
///    inside the configured roots
#[derive(Debug, Clone)]
pub struct CommandValidator {
    policy: CommandPolicy,

    /// Binary name tolerated (and stripped) as the first token
    binary_name: String,
}

impl CommandValidator {
    /// Create a validator for the given policy and wrapped binary
    pub fn new(policy: CommandPolicy, binary: &str) -> Self {
        let binary_name = Path::new(binary)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| binary.to_string());
        Self {
            policy,
            binary_name,
        }
    }

    /// Validate a command line
    ///
    /// # Arguments
    ///
    /// * `command` - Command text, optionally prefixed with the binary name
    /// * `confirmed` - Whether the request carries an explicit confirmation
    ///
    /// # Example
    ///
    /// ```
    /// use azure_cli_mcp::config::PolicyConfig;
    /// use azure_cli_mcp::tools::{CommandPolicy, CommandValidator};
    ///
    /// let policy = CommandPolicy::from_config(&PolicyConfig::default()).unwrap();
    /// let validator = CommandValidator::new(policy, "az");
    /// assert!(validator.validate("group list", false).is_allowed());
    /// assert!(!validator.validate("group list; rm -rf /", false).is_allowed());
    /// ```
    pub fn validate(&self, command: &str, confirmed: bool) -> ValidationVerdict {
        let trimmed = command.trim();
        if trimmed.is_empty() {
            return ValidationVerdict::rejected("command is empty");
        }
        if command.len() > self.policy.max_length {
            return ValidationVerdict::rejected(format!(
                "command exceeds maximum length of {} bytes",
                self.policy.max_length
            ));
        }
        if let Some(reason) = check_shell_metacharacters(command) {
            return ValidationVerdict::rejected(reason);
        }

        let mut args = match shell_words::split(trimmed) {
            Ok(args) => args,
            Err(e) => return ValidationVerdict::rejected(format!("command could not be tokenized: {}", e)),
        };
        if args
            .first()
            .is_some_and(|first| first.eq_ignore_ascii_case(&self.binary_name))
        {
            args.remove(0);
        }
        if args.is_empty() {
            return ValidationVerdict::rejected("command has no arguments after the binary name");
        }

        if let Some(reason) = self.check_file_arguments(&args) {
            return ValidationVerdict::rejected(reason);
        }

        let words = match command_words(&args) {
            Ok(words) => words,
            Err(reason) => return ValidationVerdict::rejected(reason),
        };

        if let Some(pattern) = self
            .policy
            .forbidden
            .iter()
            .find(|p| p.matches_command(&words, &args))
        {
            return ValidationVerdict::rejected(format!("command '{}' is forbidden by policy", pattern));
        }
        if !self.policy.allowed.is_empty()
            && !self.policy.allowed.iter().any(|p| p.matches_prefix(&words))
        {
            return ValidationVerdict::rejected("command is not in the allowed command list");
        }
        if !confirmed {
            if let Some(pattern) = self
                .policy
                .confirm_required
                .iter()
                .find(|p| p.matches_command(&words, &args))
            {
                return ValidationVerdict::rejected(format!(
                    "command '{}' is destructive and requires explicit confirmation (set \"confirm\": true)",
                    pattern
                ));
            }
        }

        let requires_auth = !self.policy.unauthenticated.iter().any(|p| p.matches_prefix(&args));
        ValidationVerdict::Allowed(SafeCommand {
            action: CommandAction::of(&words),
            args,
            requires_auth,
        })
    }

    /// Check `@file` references and path-valued flags against the file roots
    fn check_file_arguments(&self, args: &[String]) -> Option<String> {
        let mut expect_path = false;
        for arg in args {
            if expect_path {
                expect_path = false;
                if let Some(reason) = self.check_path(arg) {
                    return Some(reason);
                }
                continue;
            }

            let (flag, value) = match arg.split_once('=') {
                Some((flag, value)) if flag.starts_with('-') => (flag, Some(value)),
                _ => (arg.as_str(), None),
            };

            if PATH_FLAGS.contains(&flag) {
                match value {
                    Some(path) => {
                        if let Some(reason) = self.check_path(path) {
                            return Some(reason);
                        }
                    }
                    None => expect_path = true,
                }
                continue;
            }

            let candidate = value.unwrap_or(arg);
            if let Some(path) = candidate.strip_prefix('@') {
                if path == "-" {
                    return Some("reading arguments from stdin ('@-') is not supported".to_string());
                }
                if let Some(reason) = self.check_path(path) {
                    return Some(reason);
                }
            }
        }
        None
    }

    fn check_path(&self, raw: &str) -> Option<String> {
        // URLs are not local files
        if raw.contains("://") {
            return None;
        }
        let path = Path::new(raw);
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Some(format!("path '{}' contains directory traversal", raw));
        }
        if !self.policy.file_roots.iter().any(|root| path.starts_with(root)) {
            return Some(format!("path '{}' is outside the allowed file roots", raw));
        }
        None
    }
}

/// The command words, e.g. `["group", "delete"]` for `group delete --name rg`
///
/// Words end at the first option, so option values never count as command
/// words. Global switches and options (with their values) may come first.
/// Any other option ahead of the command words is rejected, since the rules
/// could not see the words behind it.
fn command_words(args: &[String]) -> Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut rest = args.iter();

    while let Some(arg) = rest.next() {
        let (name, inline_value) = match arg.split_once('=') {
            Some((name, _)) if name.starts_with('-') => (name, true),
            _ => (arg.as_str(), false),
        };
        if GLOBAL_SWITCHES.contains(&name) {
            continue;
        }
        if GLOBAL_OPTIONS.contains(&name) {
            if !inline_value {
                rest.next();
            }
            continue;
        }
        if arg.starts_with('-') {
            if words.is_empty() && rest.any(|later| !later.starts_with('-')) {
                return Err(format!("option '{}' must come after the command words", arg));
            }
            break;
        }
        words.push(arg.clone());
    }
    Ok(words)
}

/// Reject shell metacharacters and control characters
fn check_shell_metacharacters(input: &str) -> Option<String> {
    if let Some(c) = input.chars().find(|c| SHELL_METACHARACTERS.contains(c)) {
        return Some(format!("command contains shell metacharacter '{}'", c));
    }
    if input.chars().any(|c| c.is_control() && c != '\t') {
        return Some("command contains control characters".to_string());
    }
    None
}
