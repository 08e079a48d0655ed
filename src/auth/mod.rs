//! CLI Authentication
//!
//! Tracks the single login session of the wrapped CLI and drives logins
//! (device code or service principal) when a command needs one.
//!
//! - `session.rs`: Session state and device-code challenge types
//! - `parser.rs`: Classification of CLI login and token output
//! - `manager.rs`: Single-flight session manager

mod manager;
mod parser;
mod session;

pub use manager::{AuthOutcome, AuthSessionManager};
pub use parser::{
    is_auth_expired, parse_device_code, parse_login_output, parse_probe_output, AccessTokenInfo,
    LoginOutcome,
};
pub use session::{AuthSession, AuthStatus, DeviceCodeChallenge};
