//! Registry of the stored procedures clients may call
//!
//! Definitions file, one return type per line:
//!
//! ```text
//! # NO_RET procedures are fire-and-forget
//! NO_RET = {log_visit(user, page)}
//! VARCHAR = {get_name(id)=name; get_motd()}
//! MULTIPLE_RETS = {timetable(class, day)=plan}
//! INTEGER = {}
//! ```

use super::mysql::is_identifier;
use gatehouse_common::{GatehouseError, Result};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

/// Declared return type of a procedure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnType {
    NoRet,
    Bit,
    TinyInt,
    SmallInt,
    Integer,
    BigInt,
    Float,
    Double,
    Numeric,
    Decimal,
    Char,
    VarChar,
    LongVarChar,
    Date,
    Time,
    Timestamp,
    Binary,
    VarBinary,
    LongVarBinary,
    Blob,
    Clob,
    MultipleRets,
}

impl ReturnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReturnType::NoRet => "NO_RET",
            ReturnType::Bit => "BIT",
            ReturnType::TinyInt => "TINYINT",
            ReturnType::SmallInt => "SMALLINT",
            ReturnType::Integer => "INTEGER",
            ReturnType::BigInt => "BIGINT",
            ReturnType::Float => "FLOAT",
            ReturnType::Double => "DOUBLE",
            ReturnType::Numeric => "NUMERIC",
            ReturnType::Decimal => "DECIMAL",
            ReturnType::Char => "CHAR",
            ReturnType::VarChar => "VARCHAR",
            ReturnType::LongVarChar => "LONGVARCHAR",
            ReturnType::Date => "DATE",
            ReturnType::Time => "TIME",
            ReturnType::Timestamp => "TIMESTAMP",
            ReturnType::Binary => "BINARY",
            ReturnType::VarBinary => "VARBINARY",
            ReturnType::LongVarBinary => "LONGVARBINARY",
            ReturnType::Blob => "BLOB",
            ReturnType::Clob => "CLOB",
            ReturnType::MultipleRets => "MULTIPLE_RETS",
        }
    }

    /// Callers of these procedures do not wait for a result
    pub fn is_fire_and_forget(&self) -> bool {
        matches!(self, ReturnType::NoRet)
    }
}

impl FromStr for ReturnType {
    type Err = GatehouseError;

    fn from_str(s: &str) -> Result<Self> {
        let parsed = match s.trim().to_ascii_uppercase().as_str() {
            "NO_RET" => ReturnType::NoRet,
            "BIT" => ReturnType::Bit,
            "TINYINT" => ReturnType::TinyInt,
            "SMALLINT" => ReturnType::SmallInt,
            "INTEGER" => ReturnType::Integer,
            "BIGINT" => ReturnType::BigInt,
            "FLOAT" => ReturnType::Float,
            "DOUBLE" => ReturnType::Double,
            "NUMERIC" => ReturnType::Numeric,
            "DECIMAL" => ReturnType::Decimal,
            "CHAR" => ReturnType::Char,
            "VARCHAR" => ReturnType::VarChar,
            "LONGVARCHAR" => ReturnType::LongVarChar,
            "DATE" => ReturnType::Date,
            "TIME" => ReturnType::Time,
            "TIMESTAMP" => ReturnType::Timestamp,
            "BINARY" => ReturnType::Binary,
            "VARBINARY" => ReturnType::VarBinary,
            "LONGVARBINARY" => ReturnType::LongVarBinary,
            "BLOB" => ReturnType::Blob,
            "CLOB" => ReturnType::Clob,
            "MULTIPLE_RETS" => ReturnType::MultipleRets,
            other => {
                return Err(GatehouseError::ConfigError(format!(
                    "unknown procedure return type '{}'",
                    other
                )))
            }
        };
        Ok(parsed)
    }
}

impl fmt::Display for ReturnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One callable procedure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Procedure {
    pub name: String,
    pub return_type: ReturnType,
    pub params: Vec<String>,
    pub alias: Option<String>,
}

impl Procedure {
    /// Parse `name(p1, p2)=alias`
    pub fn parse(return_type: ReturnType, definition: &str) -> Result<Self> {
        let definition = definition.trim();
        let invalid = |why: &str| {
            GatehouseError::ConfigError(format!("procedure '{}': {}", definition, why))
        };

        let open = definition.find('(').ok_or_else(|| invalid("missing '('"))?;
        let close = definition.rfind(')').ok_or_else(|| invalid("missing ')'"))?;
        if close < open {
            return Err(invalid("')' before '('"));
        }

        let name = definition[..open].trim();
        if !is_identifier(name) {
            return Err(invalid("name must be a plain identifier"));
        }

        let params = definition[open + 1..close]
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();

        let tail = definition[close + 1..].trim();
        let alias = match tail.strip_prefix('=') {
            Some(alias) if !alias.trim().is_empty() => Some(alias.trim().to_string()),
            Some(_) => return Err(invalid("empty alias")),
            None if tail.is_empty() => None,
            None => return Err(invalid("unexpected text after ')'")),
        };

        Ok(Self {
            name: name.to_string(),
            return_type,
            params,
            alias,
        })
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }
}

impl fmt::Display for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}({})", self.return_type, self.name, self.params.join(", "))?;
        if let Some(alias) = &self.alias {
            write!(f, "={}", alias)?;
        }
        Ok(())
    }
}

/// Procedures indexed by name and by alias
#[derive(Debug, Default)]
pub struct ProcedureRegistry {
    by_key: HashMap<String, Arc<Procedure>>,
    count: usize,
}

impl ProcedureRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            GatehouseError::ConfigError(format!(
                "cannot read procedures file {}: {}",
                path.display(),
                e
            ))
        })?;
        let (registry, failures) = Self::parse(&content);
        if failures > 0 {
            warn!(
                path = %path.display(),
                failures,
                "Could not load every procedure due to definition errors"
            );
        }
        info!(path = %path.display(), procedures = registry.len(), "Procedure registry loaded");
        Ok(registry)
    }

    /// Parse definitions, skipping malformed entries
    ///
    /// Returns the registry and the number of entries that were skipped.
    pub fn parse(content: &str) -> (Self, usize) {
        let mut registry = Self::default();
        let mut failures = 0;

        for (lineno, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((type_name, body)) = line.split_once('=') else {
                warn!(line = lineno + 1, "Procedure line has no '='");
                failures += 1;
                continue;
            };
            let return_type = match type_name.parse::<ReturnType>() {
                Ok(t) => t,
                Err(e) => {
                    warn!(line = lineno + 1, error = %e, "Skipping procedure line");
                    failures += 1;
                    continue;
                }
            };

            let body = body.trim();
            let Some(inner) = body.strip_prefix('{').and_then(|b| b.strip_suffix('}')) else {
                warn!(line = lineno + 1, "Procedure list must be wrapped in braces");
                failures += 1;
                continue;
            };

            for definition in inner.split(';').map(str::trim).filter(|d| !d.is_empty()) {
                match Procedure::parse(return_type, definition) {
                    Ok(procedure) => registry.insert(procedure),
                    Err(e) => {
                        warn!(line = lineno + 1, error = %e, "Skipping procedure definition");
                        failures += 1;
                    }
                }
            }
        }

        (registry, failures)
    }

    fn insert(&mut self, procedure: Procedure) {
        let procedure = Arc::new(procedure);
        let mut keys = vec![procedure.name.clone()];
        keys.extend(procedure.alias.clone());
        for key in keys {
            if self.by_key.contains_key(&key) {
                warn!(key = %key, "Duplicate procedure name or alias; keeping the first");
                continue;
            }
            self.by_key.insert(key, procedure.clone());
        }
        self.count += 1;
    }

    /// Look up by name or alias
    pub fn lookup(&self, name_or_alias: &str) -> Option<Arc<Procedure>> {
        self.by_key.get(name_or_alias).cloned()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}
