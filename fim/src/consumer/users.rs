//! Local accounts: passwd + shadow + each login user's `authorized_keys`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{Commit, State};
use crate::error::FimError;
use crate::store::Store;

/// One account.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub gecos: String,
    pub home: String,
    pub shell: String,
    /// SHA-256 of the password hash, hex encoded. Still never logged.
    pub hash: String,
    /// authorized public keys, one per line of the user's include file
    pub keys: Vec<String>,
}

impl User {
    fn can_login(&self) -> bool {
        !self.home.is_empty()
            && !self.shell.is_empty()
            && !self.shell.ends_with("nologin")
            && !self.shell.ends_with("false")
    }

    fn authorized_keys(&self) -> Option<PathBuf> {
        self.can_login()
            .then(|| Path::new(&self.home).join(".ssh").join("authorized_keys"))
    }
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("User")
            .field("name", &self.name)
            .field("uid", &self.uid)
            .field("gid", &self.gid)
            .field("gecos", &self.gecos)
            .field("home", &self.home)
            .field("shell", &self.shell)
            .field("hash", &"<redacted>")
            .field("keys", &self.keys)
            .finish()
    }
}

/// Digest kept in place of a password hash, so the baseline never holds
/// crackable material.
pub fn hash_digest(hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(hash.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub type Users = BTreeSet<User>;

/// Structural view of a user set for logging.
pub struct LogUsers<'a>(pub &'a Users);

impl fmt::Display for LogUsers<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, user) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(
                f,
                "{}({}:{} {} {} keys={})",
                user.name,
                user.uid,
                user.gid,
                user.home,
                user.shell,
                user.keys.len()
            )?;
        }
        f.write_str("]")
    }
}

/// Returns `(added, removed)` comparing whole records, so a changed hash or
/// key for an existing name shows up on both sides.
pub fn user_diff(current: &Users, next: &Users) -> (Users, Users) {
    let added = next.difference(current).cloned().collect();
    let removed = current.difference(next).cloned().collect();
    (added, removed)
}

/// Where account data is read from.
#[derive(Debug, Clone)]
pub struct UsersListener {
    pub passwd: PathBuf,
    pub shadow: Option<PathBuf>,
}

impl UsersListener {
    /// Parses every source into users plus the include list derived from them.
    pub fn parse(&self) -> Result<(Users, Vec<PathBuf>), FimError> {
        let passwd = read_source(&self.passwd)?;
        let hashes = match &self.shadow {
            Some(shadow) => parse_shadow(shadow, &read_source(shadow)?)?,
            None => HashMap::new(),
        };
        let mut users = parse_passwd(&self.passwd, &passwd)?;
        let mut includes = BTreeSet::new();
        for user in users.values_mut() {
            if let Some(hash) = hashes.get(&user.name) {
                user.hash.clone_from(hash);
            }
            user.hash = hash_digest(&user.hash);
            if let Some(path) = user.authorized_keys() {
                // an unreadable include only loses its own keys
                match read_source(&path) {
                    Ok(text) => user.keys = parse_keys(&text),
                    Err(err) => warn!("skipping keys of {}: {}", user.name, err),
                }
                includes.insert(path);
            }
        }
        Ok((users.into_values().collect(), includes.into_iter().collect()))
    }

    /// Account sources followed by the include files.
    pub fn register(&self, includes: &[PathBuf]) -> Vec<PathBuf> {
        let mut files = vec![self.passwd.clone()];
        files.extend(self.shadow.iter().cloned());
        files.extend(includes.iter().cloned());
        files
    }
}

/// A missing file reads as empty; it will be watched until it shows up.
fn read_source(path: &Path) -> Result<String, FimError> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(text),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            debug!("{} does not exist", path.display());
            Ok(String::new())
        }
        Err(err) => Err(FimError::io(path, err)),
    }
}

fn records(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim_end()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
}

fn parse_passwd(path: &Path, text: &str) -> Result<BTreeMap<String, User>, FimError> {
    let mut users = BTreeMap::new();
    for (line, record) in records(text) {
        let fields: Vec<&str> = record.split(':').collect();
        let &[name, hash, uid, gid, gecos, home, shell] = fields.as_slice() else {
            return Err(FimError::parse(
                path,
                line,
                format!("expected 7 fields, found {}", fields.len()),
            ));
        };
        let id = |field: &str, what: &str| {
            field
                .parse::<u32>()
                .map_err(|_| FimError::parse(path, line, format!("invalid {what} {field:?}")))
        };
        let user = User {
            name: name.to_string(),
            uid: id(uid, "uid")?,
            gid: id(gid, "gid")?,
            gecos: gecos.to_string(),
            home: home.to_string(),
            shell: shell.to_string(),
            hash: hash.to_string(),
            keys: Vec::new(),
        };
        if users.insert(user.name.clone(), user).is_some() {
            return Err(FimError::parse(path, line, format!("duplicate user {name}")));
        }
    }
    Ok(users)
}

fn parse_shadow(path: &Path, text: &str) -> Result<HashMap<String, String>, FimError> {
    let mut hashes = HashMap::new();
    for (line, record) in records(text) {
        let mut fields = record.split(':');
        match (fields.next(), fields.next()) {
            (Some(name), Some(hash)) if !name.is_empty() => {
                hashes.insert(name.to_string(), hash.to_string());
            }
            _ => return Err(FimError::parse(path, line, "expected name:hash")),
        }
    }
    Ok(hashes)
}

fn parse_keys(text: &str) -> Vec<String> {
    records(text)
        .map(|(_, key)| key.trim().to_string())
        .collect()
}

#[derive(Debug, Clone, Default)]
struct Snapshot {
    users: Users,
    includes: Vec<PathBuf>,
}

pub struct UsersState {
    listener: UsersListener,
    current: Snapshot,
    next: Snapshot,
}

impl UsersState {
    pub fn new(listener: UsersListener) -> Self {
        Self {
            listener,
            current: Snapshot::default(),
            next: Snapshot::default(),
        }
    }

    pub fn diff(&self) -> (Users, Users) {
        user_diff(&self.current.users, &self.next.users)
    }
}

impl State for UsersState {
    fn parse(&mut self) -> Result<(), FimError> {
        let (users, includes) = self.listener.parse()?;
        self.next = Snapshot { users, includes };
        Ok(())
    }

    fn changed(&self) -> bool {
        let (add, del) = self.diff();
        !add.is_empty() || !del.is_empty()
    }

    fn created(&self) -> bool {
        self.current.users.is_empty()
    }

    fn notify(&self, actor: &str) {
        let (add, del) = self.diff();
        warn!(
            "Users Modified users={} add={} del={} processName={:?}",
            LogUsers(&self.next.users),
            LogUsers(&add),
            LogUsers(&del),
            actor
        );
    }

    fn teardown(&mut self) -> Commit {
        let previous = std::mem::replace(&mut self.current, self.next.clone());
        if previous.includes == self.current.includes {
            return Commit::Committed;
        }
        debug!(
            "includes changed old={:?} new={:?}",
            previous.includes, self.current.includes
        );
        Commit::CommittedNeedsReload
    }

    fn save(&self, store: &dyn Store) -> Result<(), FimError> {
        debug!("save users {}", LogUsers(&self.next.users));
        store.save_users(&self.next.users)
    }

    fn load(&mut self, store: &dyn Store) -> Result<(), FimError> {
        self.current = Snapshot {
            users: store.load_users()?,
            includes: Vec::new(),
        };
        Ok(())
    }

    fn register(&self) -> Vec<PathBuf> {
        self.listener.register(&self.current.includes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str, uid: u32) -> User {
        User {
            name: name.into(),
            uid,
            gid: uid,
            gecos: String::new(),
            home: format!("/home/{name}"),
            shell: "/bin/bash".into(),
            hash: format!("$6${name}$secret"),
            keys: Vec::new(),
        }
    }

    fn names(users: &Users) -> Vec<&str> {
        users.iter().map(|u| u.name.as_str()).collect()
    }

    struct Fixture {
        dir: tempfile::TempDir,
        state: UsersState,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let listener = UsersListener {
                passwd: dir.path().join("passwd"),
                shadow: Some(dir.path().join("shadow")),
            };
            Self {
                dir,
                state: UsersState::new(listener),
            }
        }

        fn home(&self, name: &str) -> PathBuf {
            self.dir.path().join("home").join(name)
        }

        fn write_passwd(&self, names: &[&str]) {
            let mut passwd = String::from("root:x:0:0:root:/root:/usr/sbin/nologin\n");
            let mut shadow = String::from("root:*:19000:0:99999:7:::\n");
            for (i, name) in names.iter().enumerate() {
                passwd.push_str(&format!(
                    "{name}:x:{uid}:{uid}::{home}:/bin/bash\n",
                    uid = 1000 + i,
                    home = self.home(name).display()
                ));
                shadow.push_str(&format!("{name}:$6${name}$hash:19000:0:99999:7:::\n"));
            }
            std::fs::write(&self.state.listener.passwd, passwd).unwrap();
            std::fs::write(self.dir.path().join("shadow"), shadow).unwrap();
        }
    }

    #[test]
    fn diff_reports_added_and_removed() {
        let current = Users::from([user("alice", 1000), user("bob", 1001)]);
        let next = Users::from([user("alice", 1000), user("carol", 1002)]);
        let (added, removed) = user_diff(&current, &next);
        assert_eq!(names(&added), ["carol"]);
        assert_eq!(names(&removed), ["bob"]);

        let (added, removed) = user_diff(&current, &current);
        assert!(added.is_empty() && removed.is_empty());
    }

    #[test]
    fn hash_rotation_is_a_diff() {
        let current = Users::from([user("alice", 1000)]);
        let mut rotated = user("alice", 1000);
        rotated.hash = "$6$new$hash".into();
        let (added, removed) = user_diff(&current, &Users::from([rotated]));
        assert_eq!(names(&added), ["alice"]);
        assert_eq!(names(&removed), ["alice"]);
    }

    #[test]
    fn log_view_hides_hashes() {
        let users = Users::from([user("alice", 1000)]);
        let line = LogUsers(&users).to_string();
        assert!(line.contains("alice(1000:1000"));
        assert!(!line.contains("secret"));
    }

    #[test]
    fn parse_merges_shadow_and_keys() {
        let fx = Fixture::new();
        fx.write_passwd(&["alice"]);
        let ssh = fx.home("alice").join(".ssh");
        std::fs::create_dir_all(&ssh).unwrap();
        std::fs::write(
            ssh.join("authorized_keys"),
            "# laptop\nssh-ed25519 AAAAC3 alice@laptop\n\n",
        )
        .unwrap();

        let (users, includes) = fx.state.listener.parse().unwrap();
        let alice = users.iter().find(|u| u.name == "alice").unwrap();
        assert_eq!(alice.uid, 1000);
        assert_eq!(alice.hash, hash_digest("$6$alice$hash"));
        assert!(!alice.hash.contains("$6$"));
        assert_eq!(alice.keys, ["ssh-ed25519 AAAAC3 alice@laptop"]);
        // root has nologin, so only alice contributes an include
        assert_eq!(includes, [ssh.join("authorized_keys")]);
    }

    #[test]
    fn parse_rejects_duplicates_and_garbage() {
        let fx = Fixture::new();
        std::fs::write(
            &fx.state.listener.passwd,
            "a:x:1:1::/:/bin/sh\na:x:2:2::/:/bin/sh\n",
        )
        .unwrap();
        let err = fx.state.listener.parse().unwrap_err();
        assert!(err.to_string().contains("duplicate user a"));

        std::fs::write(&fx.state.listener.passwd, "broken line\n").unwrap();
        assert!(matches!(
            fx.state.listener.parse(),
            Err(FimError::Parse { line: 1, .. })
        ));

        std::fs::write(&fx.state.listener.passwd, "a:x:one:1::/:/bin/sh\n").unwrap();
        assert!(fx.state.listener.parse().is_err());
    }

    #[test]
    fn unreadable_keys_do_not_fail_the_parse() {
        let fx = Fixture::new();
        fx.write_passwd(&["alice"]);
        let mut passwd = std::fs::read_to_string(&fx.state.listener.passwd).unwrap();
        passwd.push_str("svc:x:999:999::/dev/null:/bin/sh\n");
        std::fs::write(&fx.state.listener.passwd, passwd).unwrap();
        // alice's authorized_keys is a directory
        std::fs::create_dir_all(fx.home("alice").join(".ssh/authorized_keys")).unwrap();

        let (users, includes) = fx.state.listener.parse().unwrap();
        assert_eq!(names(&users), ["alice", "root", "svc"]);
        assert!(users.iter().all(|u| u.keys.is_empty()));
        assert!(includes.contains(&PathBuf::from("/dev/null/.ssh/authorized_keys")));
        assert!(includes.contains(&fx.home("alice").join(".ssh/authorized_keys")));
    }

    #[test]
    fn debug_redacts_the_hash() {
        let line = format!("{:?}", user("alice", 1000));
        assert!(line.contains("alice"));
        assert!(line.contains("<redacted>"));
        assert!(!line.contains("secret"));
    }

    #[test]
    fn missing_sources_read_as_empty() {
        let fx = Fixture::new();
        let (users, includes) = fx.state.listener.parse().unwrap();
        assert!(users.is_empty());
        assert!(includes.is_empty());
    }

    #[test]
    fn lifecycle_flags_and_reload() {
        let mut fx = Fixture::new();
        fx.write_passwd(&["alice"]);
        let state = &mut fx.state;

        state.parse().unwrap();
        assert!(state.created());
        assert!(state.changed());
        // first commit introduces alice's include file
        assert_eq!(state.teardown(), Commit::CommittedNeedsReload);
        assert!(!state.created());
        assert!(state
            .register()
            .iter()
            .any(|p| p.ends_with("alice/.ssh/authorized_keys")));

        state.parse().unwrap();
        assert!(!state.changed());
        assert_eq!(state.teardown(), Commit::Committed);
    }

    #[test]
    fn new_login_user_requests_reload() {
        let mut fx = Fixture::new();
        fx.write_passwd(&["alice", "bob"]);
        fx.state.parse().unwrap();
        fx.state.teardown();

        fx.write_passwd(&["alice", "carol"]);
        fx.state.parse().unwrap();
        let (added, removed) = fx.state.diff();
        assert_eq!(names(&added), ["carol"]);
        assert_eq!(names(&removed), ["bob"]);
        assert!(fx.state.changed());
        assert_eq!(fx.state.teardown(), Commit::CommittedNeedsReload);
    }

    #[test]
    fn current_survives_parse() {
        let mut fx = Fixture::new();
        fx.write_passwd(&["alice"]);
        fx.state.parse().unwrap();
        fx.state.teardown();

        fx.write_passwd(&[]);
        fx.state.parse().unwrap();
        assert!(!fx.state.created());
        assert_eq!(fx.state.current.users.len(), 2);
    }
}
