//! # Admin Command Dispatcher
//!
//! The `FREEZER` administrative command: a single entry point with four
//! case-insensitive subcommands.
//!
//! | Subcommand   | Effect                                  | Reply     |
//! |--------------|-----------------------------------------|-----------|
//! | `SNAPSHOT`   | Start a flush+snapshot                  | Deferred  |
//! | `FLUSH`      | Start a background flush                | Deferred  |
//! | `CLEARSTATS` | Zero the hit/miss counters              | Immediate |
//! | `PRELOAD`    | Load all freezer keys into memory       | Immediate |
//!
//! Deferred replies resolve when the background worker completes; the
//! receiver is handed back to the caller, which owns delivering it to the
//! client. A busy coordinator or a malformed command produces an
//! immediate error reply — errors here are protocol replies, not `Err`
//! values, because the dispatcher's caller is a command loop that always
//! has to answer something.

#[cfg(test)]
mod tests;

use tracing::debug;

use crate::flush::DeferredReply;
use crate::store::Store;

/// Reply produced by [`dispatch`].
pub enum AdminReply {
    /// Immediate success.
    Ok,
    /// The operation is running in the background; the reply arrives on
    /// this receiver when it completes.
    Deferred(DeferredReply),
    /// Immediate error reply.
    Error(String),
}

const SUBCOMMANDS: &str = "SNAPSHOT, FLUSH, CLEARSTATS or PRELOAD";

/// Dispatch one `FREEZER` command.
///
/// `args` is the argument vector after the command name itself. The
/// `service` callback is forwarded to `PRELOAD` so a long freezer walk
/// can keep servicing file events.
pub fn dispatch(store: &mut Store, args: &[&str], service: &mut dyn FnMut()) -> AdminReply {
    let Some((sub, rest)) = args.split_first() else {
        return AdminReply::Error(format!(
            "wrong number of arguments for FREEZER; expected a subcommand: {SUBCOMMANDS}"
        ));
    };

    debug!(sub, args = rest.len(), "admin command dispatched");

    if sub.eq_ignore_ascii_case("SNAPSHOT") {
        if !rest.is_empty() {
            return arity_error("SNAPSHOT");
        }
        match store.snapshot_begin() {
            Ok(reply) => AdminReply::Deferred(reply),
            Err(e) => AdminReply::Error(e.to_string()),
        }
    } else if sub.eq_ignore_ascii_case("FLUSH") {
        if !rest.is_empty() {
            return arity_error("FLUSH");
        }
        match store.flush_request() {
            Ok(reply) => AdminReply::Deferred(reply),
            Err(e) => AdminReply::Error(e.to_string()),
        }
    } else if sub.eq_ignore_ascii_case("CLEARSTATS") {
        if !rest.is_empty() {
            return arity_error("CLEARSTATS");
        }
        store.clear_stats();
        AdminReply::Ok
    } else if sub.eq_ignore_ascii_case("PRELOAD") {
        if !rest.is_empty() {
            return arity_error("PRELOAD");
        }
        match store.preload(service) {
            Ok(()) => AdminReply::Ok,
            Err(e) => AdminReply::Error(e.to_string()),
        }
    } else {
        AdminReply::Error(format!(
            "unknown FREEZER subcommand '{sub}'; must be {SUBCOMMANDS}"
        ))
    }
}

fn arity_error(sub: &str) -> AdminReply {
    AdminReply::Error(format!("wrong number of arguments for FREEZER {sub}"))
}
