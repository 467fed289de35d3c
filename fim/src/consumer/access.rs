//! Login access rules in `access.conf` form: `permission : users : origins`.

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::{Commit, State};
use crate::error::FimError;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    Allow,
    Deny,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Permission::Allow => "+",
            Permission::Deny => "-",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rule {
    pub permission: Permission,
    pub principal: String,
    pub origin: String,
}

impl Rule {
    pub fn new(permission: Permission, principal: &str, origin: &str) -> Self {
        Self {
            permission,
            principal: principal.to_string(),
            origin: origin.to_string(),
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} : {} : {}", self.permission, self.principal, self.origin)
    }
}

/// Rules in file order.
pub type Access = Vec<Rule>;

pub struct LogAccess<'a>(pub &'a [Rule]);

impl fmt::Display for LogAccess<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, rule) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{rule}")?;
        }
        f.write_str("]")
    }
}

/// `(added, removed)`, each in the order of the snapshot it came from.
pub fn access_diff(current: &[Rule], next: &[Rule]) -> (Access, Access) {
    let before: HashSet<&Rule> = current.iter().collect();
    let after: HashSet<&Rule> = next.iter().collect();
    let added = next.iter().filter(|r| !before.contains(r)).cloned().collect();
    let removed = current.iter().filter(|r| !after.contains(r)).cloned().collect();
    (added, removed)
}

#[derive(Debug, Clone)]
pub struct AccessListener {
    pub path: PathBuf,
}

impl AccessListener {
    /// A missing file has no rules.
    pub fn parse(&self) -> Result<Access, FimError> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => parse_rules(&self.path, &text),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("{} does not exist", self.path.display());
                Ok(Access::new())
            }
            Err(err) => Err(FimError::io(&self.path, err)),
        }
    }
}

/// One rule per (principal, origin) pair of every line.
pub fn parse_rules(path: &Path, text: &str) -> Result<Access, FimError> {
    let mut rules = Access::new();
    for (i, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.splitn(3, ':').map(str::trim).collect();
        let &[permission, principals, origins] = fields.as_slice() else {
            return Err(FimError::parse(path, i + 1, "expected permission : users : origins"));
        };
        let permission = match permission {
            "+" => Permission::Allow,
            "-" => Permission::Deny,
            other => {
                return Err(FimError::parse(
                    path,
                    i + 1,
                    format!("unknown permission {other:?}"),
                ))
            }
        };
        if principals.is_empty() || origins.is_empty() {
            return Err(FimError::parse(path, i + 1, "empty users or origins"));
        }
        for principal in principals.split_whitespace() {
            for origin in origins.split_whitespace() {
                rules.push(Rule::new(permission, principal, origin));
            }
        }
    }
    Ok(rules)
}

pub struct AccessState {
    listener: AccessListener,
    current: Access,
    next: Access,
}

impl AccessState {
    pub fn new(listener: AccessListener) -> Self {
        Self {
            listener,
            current: Access::new(),
            next: Access::new(),
        }
    }

    pub fn diff(&self) -> (Access, Access) {
        access_diff(&self.current, &self.next)
    }
}

impl State for AccessState {
    fn parse(&mut self) -> Result<(), FimError> {
        self.next = self.listener.parse()?;
        Ok(())
    }

    fn changed(&self) -> bool {
        let (add, del) = self.diff();
        !add.is_empty() || !del.is_empty()
    }

    fn created(&self) -> bool {
        self.current.is_empty()
    }

    fn notify(&self, actor: &str) {
        let (add, del) = self.diff();
        warn!(
            "access entries access={} add={} del={} processName={:?}",
            LogAccess(&self.next),
            LogAccess(&add),
            LogAccess(&del),
            actor
        );
    }

    fn teardown(&mut self) -> Commit {
        self.current.clone_from(&self.next);
        Commit::Committed
    }

    fn save(&self, store: &dyn Store) -> Result<(), FimError> {
        debug!("save access {}", LogAccess(&self.next));
        store.save_access(&self.next)
    }

    fn load(&mut self, store: &dyn Store) -> Result<(), FimError> {
        self.current = store.load_access()?;
        Ok(())
    }

    fn register(&self) -> Vec<PathBuf> {
        vec![self.listener.path.clone()]
    }
}
