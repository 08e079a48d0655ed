//! Parsing of CLI authentication output
//!
//! The CLI reports login progress as free text on stderr and account
//! details as JSON on stdout. These helpers turn both into typed outcomes.

use super::session::DeviceCodeChallenge;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

lazy_static! {
    static ref VERIFICATION_URI: Regex =
        Regex::new(r"https://[^\s'\x22]+").expect("Failed to compile verification URI regex");
    static ref USER_CODE: Regex =
        Regex::new(r"(?i)enter the code\s+([A-Z0-9-]+)").expect("Failed to compile user code regex");
    static ref LOGIN_ERROR: Regex =
        Regex::new(r"(?m)^ERROR:.*$|AADSTS\d+[^\r\n]*").expect("Failed to compile login error regex");
    static ref LOGIN_SUCCESS: Regex = Regex::new(r"(?i)you have logged in|login successful")
        .expect("Failed to compile login success regex");
    static ref AUTH_EXPIRED: Regex = Regex::new(
        r"(?i)AADSTS700082|AADSTS70043|AADSTS50173|refresh token has expired|please run 'az login'|interactive authentication is needed|no subscription found"
    )
    .expect("Failed to compile auth expiry regex");
}

/// What a chunk of login output says about the attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    /// The CLI is waiting for the user to enter a code
    DeviceCode(DeviceCodeChallenge),

    /// Login completed; carries the default subscription when reported
    Success { account: Option<String> },

    /// The CLI reported an error
    Failed { reason: String },

    /// Nothing conclusive yet
    Pending,
}

/// Classify login output
///
/// Failure wins over success, and success over a device-code prompt, since
/// a completed login's output still contains the original prompt.
pub fn parse_login_output(text: &str) -> LoginOutcome {
    if let Some(m) = LOGIN_ERROR.find(text) {
        return LoginOutcome::Failed {
            reason: m.as_str().trim().to_string(),
        };
    }

    if let Some(accounts) = first_json_array(text) {
        return LoginOutcome::Success {
            account: default_account(&accounts),
        };
    }
    if LOGIN_SUCCESS.is_match(text) {
        return LoginOutcome::Success { account: None };
    }

    if let Some(challenge) = parse_device_code(text) {
        return LoginOutcome::DeviceCode(challenge);
    }
    LoginOutcome::Pending
}

/// Extract the verification URI and user code from a device-code prompt
pub fn parse_device_code(text: &str) -> Option<DeviceCodeChallenge> {
    let code = USER_CODE.captures(text)?;
    let user_code = code.get(1)?.as_str().to_string();

    let line = text
        .lines()
        .find(|l| l.contains(&user_code))
        .unwrap_or(text)
        .trim();
    let uri = VERIFICATION_URI
        .find(line)
        .or_else(|| VERIFICATION_URI.find(text))?
        .as_str()
        .trim_end_matches(['.', ',', ')'])
        .to_string();

    Some(DeviceCodeChallenge::new(uri, user_code, line))
}

/// Token details reported by `account get-access-token`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AccessTokenInfo {
    pub expires_at: Option<DateTime<Utc>>,
    pub account: Option<String>,
}

/// Parse the JSON printed by `account get-access-token --output json`
///
/// Returns `None` when stdout is not a JSON object. The token itself is
/// never extracted.
pub fn parse_probe_output(stdout: &str) -> Option<AccessTokenInfo> {
    let value: Value = serde_json::from_str(stdout.trim()).ok()?;
    let object = value.as_object()?;

    let expires_at = object
        .get("expires_on")
        .and_then(epoch_seconds)
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .or_else(|| {
            object
                .get("expiresOn")
                .and_then(Value::as_str)
                .and_then(parse_local_timestamp)
        });

    let account = ["subscription", "tenant"]
        .iter()
        .find_map(|key| object.get(*key).and_then(Value::as_str))
        .map(str::to_string);

    Some(AccessTokenInfo {
        expires_at,
        account,
    })
}

/// Whether CLI output indicates the cached credentials are no longer valid
pub fn is_auth_expired(text: &str) -> bool {
    AUTH_EXPIRED.is_match(text)
}

fn epoch_seconds(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_local_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(text.trim(), "%Y-%m-%d %H:%M:%S%.f").ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
}

/// Parse the first JSON array that starts at the beginning of a line
fn first_json_array(text: &str) -> Option<Value> {
    let start = if text.starts_with('[') {
        0
    } else {
        text.find("\n[")? + 1
    };
    let value = serde_json::Deserializer::from_str(&text[start..])
        .into_iter::<Value>()
        .next()?
        .ok()?;
    value.is_array().then_some(value)
}

fn default_account(accounts: &Value) -> Option<String> {
    let list = accounts.as_array()?;
    let chosen = list
        .iter()
        .find(|a| a["isDefault"].as_bool() == Some(true))
        .or_else(|| list.first())?;
    chosen["id"]
        .as_str()
        .or_else(|| chosen["tenantId"].as_str())
        .map(str::to_string)
}
