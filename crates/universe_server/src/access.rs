//! Accounts and bans.
//!
//! The handshake consults an [`AccessControl`] implementation for named
//! accounts and ban lookups. [`StaticAccessControl`] keeps configured
//! accounts and in-memory bans.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use tracing::info;
use uuid::Uuid;

/// A named account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub password: String,
    #[serde(default)]
    pub admin: bool,
}

/// Which identity a ban applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BanScope {
    Ip,
    Uuid,
    Both,
}

impl BanScope {
    pub fn covers_ip(self) -> bool {
        matches!(self, BanScope::Ip | BanScope::Both)
    }

    pub fn covers_uuid(self) -> bool {
        matches!(self, BanScope::Uuid | BanScope::Both)
    }
}

pub trait AccessControl: Send + Sync {
    fn account(&self, name: &str) -> Option<Account>;

    /// Ban reason for a connecting client, if either identity is banned.
    fn ban_reason(&self, ip: Option<IpAddr>, uuid: Uuid) -> Option<String>;

    fn ban(&self, ip: Option<IpAddr>, uuid: Option<Uuid>, reason: &str);
}

#[derive(Debug, Default)]
pub struct StaticAccessControl {
    accounts: HashMap<String, Account>,
    ip_bans: DashMap<IpAddr, String>,
    uuid_bans: DashMap<Uuid, String>,
}

impl StaticAccessControl {
    pub fn new(accounts: HashMap<String, Account>) -> Self {
        Self {
            accounts,
            ip_bans: DashMap::new(),
            uuid_bans: DashMap::new(),
        }
    }

    pub fn unban_ip(&self, ip: IpAddr) -> bool {
        self.ip_bans.remove(&ip).is_some()
    }

    pub fn unban_uuid(&self, uuid: Uuid) -> bool {
        self.uuid_bans.remove(&uuid).is_some()
    }
}

impl AccessControl for StaticAccessControl {
    fn account(&self, name: &str) -> Option<Account> {
        self.accounts.get(name).cloned()
    }

    fn ban_reason(&self, ip: Option<IpAddr>, uuid: Uuid) -> Option<String> {
        if let Some(reason) = self.uuid_bans.get(&uuid) {
            return Some(reason.clone());
        }
        ip.and_then(|ip| self.ip_bans.get(&ip).map(|reason| reason.clone()))
    }

    fn ban(&self, ip: Option<IpAddr>, uuid: Option<Uuid>, reason: &str) {
        if let Some(ip) = ip {
            info!("🔨 Banned address {}: {}", ip, reason);
            self.ip_bans.insert(ip, reason.to_string());
        }
        if let Some(uuid) = uuid {
            info!("🔨 Banned player {}: {}", uuid, reason);
            self.uuid_bans.insert(uuid, reason.to_string());
        }
    }
}
