//! Audit Logging
//!
//! One structured `audit` event per handled request. Secret-bearing
//! argument values are replaced before anything is logged.

use lazy_static::lazy_static;
use regex::Regex;
use std::time::Duration;
use tracing::info;

const REDACTED: &str = "***";

/// Flags whose following value is a secret
const SECRET_FLAGS: &[&str] = &[
    "--password",
    "-p",
    "--client-secret",
    "--secret",
    "--sas-token",
    "--account-key",
    "--connection-string",
];

lazy_static! {
    static ref SECRET_ASSIGNMENT: Regex = Regex::new(r"(?i)^([A-Za-z0-9_.-]*(?:password|secret|token|key|sas)[A-Za-z0-9_.-]*)=.+$")
        .expect("Failed to compile secret assignment regex");

    /// Long flags named like a secret, e.g. `--admin-password`
    static ref SECRET_FLAG_NAME: Regex = Regex::new(r"(?i)^--[a-z0-9-]*(?:password|secret|token|key|sas|connection-string)[a-z0-9-]*$")
        .expect("Failed to compile secret flag regex");
}

/// Whether the value following `flag` must be hidden
fn is_secret_flag(flag: &str, secret_value_command: bool) -> bool {
    SECRET_FLAGS.contains(&flag)
        || SECRET_FLAG_NAME.is_match(flag)
        || (secret_value_command && flag == "--value")
}

/// `keyvault secret set` and friends carry the secret in `--value`
fn is_secret_value_command<S: AsRef<str>>(args: &[S]) -> bool {
    let words: Vec<&str> = args
        .iter()
        .map(|arg| arg.as_ref())
        .take_while(|arg| !arg.starts_with('-'))
        .collect();
    words.windows(2).any(|pair| pair == ["keyvault", "secret"])
}

/// Replace secret values in an argument list
pub fn redact_args<S: AsRef<str>>(args: &[S]) -> Vec<String> {
    let secret_value_command = is_secret_value_command(args);
    let mut redacted = Vec::with_capacity(args.len());
    let mut hide_next = false;

    for arg in args {
        let arg = arg.as_ref();
        // A flag right after a flag means the first one took no value
        if hide_next && !arg.starts_with("--") {
            hide_next = false;
            redacted.push(REDACTED.to_string());
            continue;
        }
        hide_next = false;

        if let Some((flag, _)) = arg.split_once('=') {
            if is_secret_flag(flag, secret_value_command) {
                redacted.push(format!("{}={}", flag, REDACTED));
                continue;
            }
        }
        if is_secret_flag(arg, secret_value_command) {
            hide_next = true;
            redacted.push(arg.to_string());
            continue;
        }
        if let Some(caps) = SECRET_ASSIGNMENT.captures(arg) {
            redacted.push(format!("{}={}", &caps[1], REDACTED));
            continue;
        }
        redacted.push(arg.to_string());
    }
    redacted
}

/// Redact a raw command line for logging
///
/// Text that does not tokenize is split on whitespace instead.
pub fn redact_command(command: &str) -> String {
    let tokens = shell_words::split(command).unwrap_or_else(|_| {
        command.split_whitespace().map(str::to_string).collect()
    });
    redact_args(&tokens).join(" ")
}

/// Emit the audit record for one request
pub fn record(request_id: &str, command: &str, outcome: &str, exit_code: Option<i32>, elapsed: Duration) {
    info!(
        target: "audit",
        request_id = %request_id,
        command = %redact_command(command),
        outcome = %outcome,
        exit_code = ?exit_code,
        elapsed_ms = elapsed.as_millis() as u64,
        "command handled"
    );
}
