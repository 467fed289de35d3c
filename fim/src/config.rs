use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::consumer::access::AccessListener;
use crate::consumer::users::UsersListener;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// compiled eBPF object carrying the vfs kprobes
    #[arg(short, long, default_value = "/usr/lib/fim/fim-ebpf.o")]
    pub probe: PathBuf,
    /// baseline database
    #[arg(short, long, default_value = "/var/lib/fim/fim.db")]
    pub db: PathBuf,
    /// user account file
    #[arg(long, default_value = "/etc/passwd")]
    pub passwd: PathBuf,
    /// shadow password file
    #[arg(long, default_value = "/etc/shadow")]
    pub shadow: PathBuf,
    /// do not read password hashes
    #[arg(long, default_value_t = false)]
    pub no_shadow: bool,
    /// login access rules
    #[arg(short, long, default_value = "/etc/security/access.conf")]
    pub access: PathBuf,
    /// seconds between checks for a missing watched file
    #[arg(long, default_value_t = 10)]
    pub poll_interval: u64,
}

impl Args {
    pub fn users_listener(&self) -> UsersListener {
        UsersListener {
            passwd: self.passwd.clone(),
            shadow: (!self.no_shadow).then(|| self.shadow.clone()),
        }
    }

    pub fn access_listener(&self) -> AccessListener {
        AccessListener {
            path: self.access.clone(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval.max(1))
    }
}
