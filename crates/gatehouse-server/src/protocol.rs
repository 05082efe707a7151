//! Line protocol spoken over the TLS socket
//!
//! Every message is one newline-terminated line. `>>` separates the verb from
//! its payload and `<>` separates fields inside the payload.
//!
//! ```text
//! client                              server
//!   AUTH>>alice<>secret        ──►
//!                              ◄──   AUTH>>alice
//!   PROC>>timetable<>4a<>mon   ──►
//!                              ◄──   RES>>{"columns":[..],"rows":[..],"rows_affected":0}
//!   FOO                        ──►
//!                              ◄──   STOP>>UNK_CMD
//! ```

use crate::db::QueryResult;
use gatehouse_common::{GatehouseError, Result};
use std::fmt;

pub const DELIMITER: &str = ">>";
pub const SEPARATOR: &str = "<>";

/// Credential pair that requests guest access
pub const GUEST_SENTINEL: &str = "NO_AUTH";

pub const AUTH_ROOT: &str = "AUTH>>ROOT";
pub const SUCCESS: &str = "SUC";
pub const UNKNOWN_USER: &str = "ERR>>UNK_USR";
pub const UNKNOWN_COMMAND: &str = "STOP>>UNK_CMD";
pub const UNKNOWN_ERROR: &str = "STOP>>UNK_ERR";
pub const FLOOD_REJECTED: &str = "ERR>>DDOS";

const VERB_AUTH: &str = "AUTH";
const VERB_PROC: &str = "PROC";
const VERB_SQL: &str = "SQL";
const VERB_RESULT: &str = "RES";

/// Permission level of an authenticated principal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    /// Unauthenticated, restricted to procedure calls
    Guest,
    /// Password-verified user
    Standard,
    /// Loopback administrator
    Root,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Guest => "guest",
            Permission::Standard => "standard",
            Permission::Root => "root",
        }
    }

    pub fn may_call_procedures(&self) -> bool {
        true
    }

    pub fn may_run_sql(&self) -> bool {
        matches!(self, Permission::Root)
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved identity of a session
///
/// The password is never kept once authentication finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub username: String,
    pub permission: Permission,
}

impl Principal {
    pub fn root() -> Self {
        Self {
            username: "root".into(),
            permission: Permission::Root,
        }
    }

    pub fn guest() -> Self {
        Self {
            username: GUEST_SENTINEL.into(),
            permission: Permission::Guest,
        }
    }

    pub fn standard(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            permission: Permission::Standard,
        }
    }

    /// Check that this principal may issue `command`
    pub fn authorize(&self, command: &Command) -> Result<()> {
        let allowed = match command {
            Command::Procedure { .. } => self.permission.may_call_procedures(),
            Command::Sql { .. } => self.permission.may_run_sql(),
        };
        if allowed {
            Ok(())
        } else {
            Err(GatehouseError::PermissionDenied(format!(
                "{} may not issue {} commands",
                self.permission,
                command.verb()
            )))
        }
    }
}

/// Parsed authentication line
#[derive(Clone, PartialEq, Eq)]
pub enum AuthRequest {
    Guest,
    Credentials { username: String, password: String },
}

impl fmt::Debug for AuthRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthRequest::Guest => f.write_str("Guest"),
            AuthRequest::Credentials { username, .. } => f
                .debug_struct("Credentials")
                .field("username", username)
                .finish_non_exhaustive(),
        }
    }
}

/// Parse `AUTH>><user><><password>`
///
/// Returns `None` for anything that is not a well-formed auth line.
pub fn parse_auth_line(line: &str) -> Option<AuthRequest> {
    let payload = strip_verb(line, VERB_AUTH)?;
    let (username, password) = payload.split_once(SEPARATOR)?;
    if username.is_empty() {
        return None;
    }
    if username == GUEST_SENTINEL && password == GUEST_SENTINEL {
        return Some(AuthRequest::Guest);
    }
    Some(AuthRequest::Credentials {
        username: username.to_string(),
        password: password.to_string(),
    })
}

/// A command line received while serving
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Procedure { name: String, args: Vec<String> },
    Sql { text: String },
}

impl Command {
    /// Parse one command line; `None` means unknown command
    pub fn parse(line: &str) -> Option<Self> {
        if let Some(payload) = strip_verb(line, VERB_PROC) {
            let mut fields = payload.split(SEPARATOR);
            let name = fields.next().filter(|n| !n.is_empty())?;
            return Some(Command::Procedure {
                name: name.to_string(),
                args: fields.map(str::to_string).collect(),
            });
        }
        if let Some(text) = strip_verb(line, VERB_SQL) {
            if text.trim().is_empty() {
                return None;
            }
            return Some(Command::Sql {
                text: text.to_string(),
            });
        }
        None
    }

    pub fn verb(&self) -> &'static str {
        match self {
            Command::Procedure { .. } => VERB_PROC,
            Command::Sql { .. } => VERB_SQL,
        }
    }
}

fn strip_verb<'a>(line: &'a str, verb: &str) -> Option<&'a str> {
    line.strip_prefix(verb)?.strip_prefix(DELIMITER)
}

/// `AUTH>><user>` acknowledgement
pub fn auth_ack(username: &str) -> String {
    format!("{}{}{}", VERB_AUTH, DELIMITER, username)
}

/// `RES>><json>` payload; serde_json output never contains a raw newline
pub fn result_payload(result: &QueryResult) -> std::result::Result<String, serde_json::Error> {
    Ok(format!("{}{}{}", VERB_RESULT, DELIMITER, serde_json::to_string(result)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_auth_line() {
        assert_eq!(
            parse_auth_line("AUTH>>alice<>s3<>cret"),
            Some(AuthRequest::Credentials {
                username: "alice".into(),
                password: "s3<>cret".into(),
            })
        );
        assert_eq!(parse_auth_line("AUTH>>NO_AUTH<>NO_AUTH"), Some(AuthRequest::Guest));
        // only the exact sentinel pair selects guest mode
        assert!(matches!(
            parse_auth_line("AUTH>>NO_AUTH<>x"),
            Some(AuthRequest::Credentials { .. })
        ));
        assert_eq!(parse_auth_line("AUTH>>alice"), None);
        assert_eq!(parse_auth_line("AUTH>><>pw"), None);
        assert_eq!(parse_auth_line("HELLO"), None);
    }

    #[test]
    fn test_auth_debug_hides_password() {
        let req = parse_auth_line("AUTH>>alice<>hunter2").unwrap();
        assert!(!format!("{:?}", req).contains("hunter2"));
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            Command::parse("PROC>>timetable<>4a<>mon"),
            Some(Command::Procedure {
                name: "timetable".into(),
                args: vec!["4a".into(), "mon".into()],
            })
        );
        assert_eq!(
            Command::parse("PROC>>get_motd"),
            Some(Command::Procedure {
                name: "get_motd".into(),
                args: vec![],
            })
        );
        assert_eq!(
            Command::parse("SQL>>SELECT a >> 1 FROM t"),
            Some(Command::Sql {
                text: "SELECT a >> 1 FROM t".into(),
            })
        );
        assert_eq!(Command::parse("PROC>>"), None);
        assert_eq!(Command::parse("SQL>>   "), None);
        assert_eq!(Command::parse("FOO"), None);
        assert_eq!(Command::parse("proc>>x"), None);
    }

    #[test]
    fn test_permissions() {
        assert!(Permission::Guest.may_call_procedures());
        assert!(!Permission::Guest.may_run_sql());
        assert!(!Permission::Standard.may_run_sql());
        assert!(Permission::Root.may_run_sql());
    }

    #[test]
    fn test_authorize_by_permission() {
        let sql = Command::parse("SQL>>SELECT 1").unwrap();
        let proc = Command::parse("PROC>>get_motd").unwrap();

        assert!(Principal::root().authorize(&sql).is_ok());
        assert!(Principal::guest().authorize(&proc).is_ok());
        assert!(Principal::standard("alice").authorize(&proc).is_ok());

        let err = Principal::standard("alice").authorize(&sql).unwrap_err();
        assert!(matches!(err, GatehouseError::PermissionDenied(_)));
        assert_eq!(err.code(), "PERMISSION_DENIED");
        assert!(err.is_session_scoped());
        assert!(Principal::guest().authorize(&sql).is_err());
    }

    #[test]
    fn test_result_payload_is_single_line() {
        let result = QueryResult {
            columns: vec!["motd".into()],
            rows: vec![vec![Some("line one\nline two".into())], vec![None]],
            rows_affected: 0,
        };
        let payload = result_payload(&result).unwrap();
        assert!(payload.starts_with("RES>>{"));
        assert!(!payload.contains('\n'));
        assert!(payload.contains(r#""rows":[["line one\nline two"],[null]]"#));
    }
}
