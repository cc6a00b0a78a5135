use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, PoisonError, RwLock};

/// A shared, mutable set of IP addresses.
///
/// Clones share the same set, so a config handler can edit the list a
/// listener is consulting.
#[derive(Clone, Default)]
pub struct AccessList(Arc<RwLock<HashSet<String>>>);

impl AccessList {
    pub fn new<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(Arc::new(RwLock::new(
            addresses.into_iter().map(Into::into).collect(),
        )))
    }

    pub fn add(&self, address: impl Into<String>) {
        self.0
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address.into());
    }

    pub fn remove(&self, address: &str) {
        self.0
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(address);
    }

    pub fn contains(&self, address: &str) -> bool {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(address)
    }

    pub fn count(&self) -> usize {
        self.0.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn snapshot(&self) -> Vec<String> {
        let mut items: Vec<String> = self
            .0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();
        items.sort();
        items
    }
}

impl fmt::Debug for AccessList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.snapshot()).finish()
    }
}

/// Why a connection was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Source address is on the deny list.
    Denied,
    /// The allow list is non-empty and does not contain the source address.
    NotAllowed,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::Denied => f.write_str("address is denied"),
            Rejection::NotAllowed => f.write_str("address is not allowed"),
        }
    }
}

/// Deny list consulted first, then the allow list if it has entries.
#[derive(Debug, Clone, Default)]
pub struct AccessControl {
    pub allow: AccessList,
    pub deny: AccessList,
}

impl AccessControl {
    pub fn new(allow: AccessList, deny: AccessList) -> Self {
        Self { allow, deny }
    }

    pub fn check(&self, ip: &IpAddr) -> Result<(), Rejection> {
        let ip = ip.to_string();
        if self.deny.contains(&ip) {
            return Err(Rejection::Denied);
        }
        if !self.allow.is_empty() && !self.allow.contains(&ip) {
            return Err(Rejection::NotAllowed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn empty_lists_admit_everyone() {
        let access = AccessControl::default();
        assert!(access.check(&ip("10.1.2.3")).is_ok());
        assert!(access.check(&ip("::1")).is_ok());
    }

    #[test]
    fn deny_wins_over_allow() {
        let access = AccessControl::new(
            AccessList::new(["127.0.0.1"]),
            AccessList::new(["127.0.0.1"]),
        );
        assert_eq!(access.check(&ip("127.0.0.1")), Err(Rejection::Denied));
    }

    #[test]
    fn non_empty_allow_list_is_exclusive() {
        let access = AccessControl::new(AccessList::new(["127.0.0.1"]), AccessList::default());
        assert!(access.check(&ip("127.0.0.1")).is_ok());
        assert_eq!(access.check(&ip("127.0.0.2")), Err(Rejection::NotAllowed));
    }

    #[test]
    fn clones_share_edits() {
        let list = AccessList::default();
        let access = AccessControl::new(AccessList::default(), list.clone());
        list.add("192.168.1.9");
        assert_eq!(access.check(&ip("192.168.1.9")), Err(Rejection::Denied));
        assert_eq!(access.deny.count(), 1);

        list.remove("192.168.1.9");
        assert!(access.check(&ip("192.168.1.9")).is_ok());
        assert!(list.is_empty());
    }

    #[test]
    fn snapshot_is_sorted() {
        let list = AccessList::new(["b", "a", "c"]);
        assert_eq!(list.snapshot(), vec!["a", "b", "c"]);
    }
}
