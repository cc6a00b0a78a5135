//! Reserved topic names and the pipe-delimited list format used by
//! config payloads.

use tbus_transport::AccessList;

use crate::error::TbusError;

pub const CONNECT: &str = "connect";
pub const CONNECTED: &str = "connected";
pub const SUBSCRIBE: &str = "subscribe";
pub const SUBSCRIBED: &str = "subscribed";
pub const UNSUBSCRIBE: &str = "unsubscribe";
pub const UNSUBSCRIBED: &str = "unsubscribed";
pub const HEARTBEAT: &str = "heartbeat";
pub const RESOLVE: &str = "resolve";
pub const RESOLUTION: &str = "resolution";
pub const SUCCESS: &str = "success";
pub const ERROR: &str = "error";

// ── Resolver config commands ──────────────────────────────────────────
pub const ADD_TOPICS: &str = "addTopics";
pub const REMOVE_TOPICS: &str = "removeTopics";
pub const ADD_ALLOW_RESOLVER: &str = "addAllowResolver";
pub const REMOVE_ALLOW_RESOLVER: &str = "removeAllowResolver";
pub const ADD_DENY_RESOLVER: &str = "addDenyResolver";
pub const REMOVE_DENY_RESOLVER: &str = "removeDenyResolver";

// ── Broker config commands ────────────────────────────────────────────
pub const ADD_SYNC_TOPICS: &str = "addSyncTopics";
pub const REMOVE_SYNC_TOPICS: &str = "removeSyncTopics";
pub const ADD_ASYNC_TOPICS: &str = "addAsyncTopics";
pub const REMOVE_ASYNC_TOPICS: &str = "removeAsyncTopics";
pub const ADD_ALLOW_NODE: &str = "addAllowNode";
pub const REMOVE_ALLOW_NODE: &str = "removeAllowNode";
pub const ADD_DENY_NODE: &str = "addDenyNode";
pub const REMOVE_DENY_NODE: &str = "removeDenyNode";

// ── Shared by both config endpoints ───────────────────────────────────
pub const ADD_ALLOW_CONFIG: &str = "addAllowConfig";
pub const REMOVE_ALLOW_CONFIG: &str = "removeAllowConfig";
pub const ADD_DENY_CONFIG: &str = "addDenyConfig";
pub const REMOVE_DENY_CONFIG: &str = "removeDenyConfig";

pub const LIST_SEPARATOR: char = '|';

/// Topics a broker always serves and a node can never subscribe to.
pub fn is_reserved(topic: &str) -> bool {
    matches!(topic, SUBSCRIBE | UNSUBSCRIBE | HEARTBEAT)
}

/// Split a `a|b|c` payload, dropping empty segments.
pub fn split_list(payload: &str) -> Vec<String> {
    payload
        .split(LIST_SEPARATOR)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn join_list<I, S>(items: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = String::new();
    for (i, item) in items.into_iter().enumerate() {
        if i > 0 {
            out.push(LIST_SEPARATOR);
        }
        out.push_str(item.as_ref());
    }
    out
}

/// Parse a non-empty `a|b|c` command payload.
pub(crate) fn require_list(payload: &str) -> Result<Vec<String>, TbusError> {
    let items = split_list(payload);
    if items.is_empty() {
        return Err(TbusError::invalid("empty list"));
    }
    Ok(items)
}

pub(crate) fn edit_list(list: &AccessList, payload: &str, add: bool) -> Result<(), TbusError> {
    for address in require_list(payload)? {
        if add {
            list.add(address);
        } else {
            list.remove(&address);
        }
    }
    Ok(())
}
