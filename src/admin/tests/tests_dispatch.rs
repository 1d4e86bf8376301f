#[cfg(test)]
mod tests {
    use crate::admin::{AdminReply, dispatch};
    use crate::store::{Store, StoreConfig};
    use tempfile::TempDir;
    use tracing::Level;
    use tracing_subscriber::fmt::Subscriber;

    fn init_tracing() {
        let _ = Subscriber::builder()
            .with_max_level(Level::TRACE)
            .try_init();
    }

    fn open_store(tmp: &TempDir) -> Store {
        Store::open(
            tmp.path().join("store"),
            StoreConfig {
                databases: 2,
                snapshot_dir: tmp.path().join("snapshot"),
                ..StoreConfig::default()
            },
        )
        .unwrap()
    }

    fn wait_background(store: &mut Store) {
        for _ in 0..1000 {
            if store.poll_background().is_some() {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        panic!("background worker never completed");
    }

    fn no_service() -> impl FnMut() {
        || {}
    }

    #[test]
    fn clearstats_replies_immediately() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let mut store = open_store(&tmp);
        store.set(0, b"k", b"v").unwrap();
        store.get(0, b"k").unwrap();
        assert_eq!(store.stats().hits, 1);

        let reply = dispatch(&mut store, &["CLEARSTATS"], &mut no_service());
        assert!(matches!(reply, AdminReply::Ok));
        assert_eq!(store.stats().hits, 0);
    }

    #[test]
    fn subcommands_are_case_insensitive() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let mut store = open_store(&tmp);

        assert!(matches!(
            dispatch(&mut store, &["clearstats"], &mut no_service()),
            AdminReply::Ok
        ));
        assert!(matches!(
            dispatch(&mut store, &["Preload"], &mut no_service()),
            AdminReply::Ok
        ));
        let reply = dispatch(&mut store, &["fLuSh"], &mut no_service());
        assert!(matches!(reply, AdminReply::Deferred(_)));
        wait_background(&mut store);
    }

    #[test]
    fn flush_reply_is_deferred_until_completion() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let mut store = open_store(&tmp);
        store.set(0, b"a", b"1").unwrap();

        let AdminReply::Deferred(reply) = dispatch(&mut store, &["FLUSH"], &mut no_service())
        else {
            panic!("expected a deferred reply");
        };

        assert!(reply.try_recv().is_err());
        wait_background(&mut store);
        assert_eq!(reply.recv().unwrap(), Ok("flush complete".to_string()));
    }

    #[test]
    fn snapshot_reply_is_deferred_until_completion() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let mut store = open_store(&tmp);
        store.set(0, b"a", b"1").unwrap();

        let AdminReply::Deferred(reply) = dispatch(&mut store, &["SNAPSHOT"], &mut no_service())
        else {
            panic!("expected a deferred reply");
        };

        wait_background(&mut store);
        assert_eq!(reply.recv().unwrap(), Ok("snapshot complete".to_string()));
    }

    #[test]
    fn preload_replies_immediately_and_completes() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let mut store = open_store(&tmp);

        let reply = dispatch(&mut store, &["PRELOAD"], &mut no_service());
        assert!(matches!(reply, AdminReply::Ok));
        assert!(store.stats().preload_complete);

        // Second call is a cheap no-op (preload is idempotent).
        let reply = dispatch(&mut store, &["PRELOAD"], &mut no_service());
        assert!(matches!(reply, AdminReply::Ok));
    }

    #[test]
    fn arity_mismatch_names_the_subcommand() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let mut store = open_store(&tmp);

        let AdminReply::Error(message) =
            dispatch(&mut store, &["FLUSH", "extra"], &mut no_service())
        else {
            panic!("expected an error reply");
        };
        assert_eq!(message, "wrong number of arguments for FREEZER FLUSH");

        let AdminReply::Error(message) =
            dispatch(&mut store, &["SNAPSHOT", "x", "y"], &mut no_service())
        else {
            panic!("expected an error reply");
        };
        assert_eq!(message, "wrong number of arguments for FREEZER SNAPSHOT");
    }

    #[test]
    fn unknown_subcommand_enumerates_the_valid_ones() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let mut store = open_store(&tmp);

        let AdminReply::Error(message) =
            dispatch(&mut store, &["DEFROST"], &mut no_service())
        else {
            panic!("expected an error reply");
        };
        assert!(message.contains("DEFROST"));
        for sub in ["SNAPSHOT", "FLUSH", "CLEARSTATS", "PRELOAD"] {
            assert!(message.contains(sub), "missing {sub} in: {message}");
        }
    }

    #[test]
    fn missing_subcommand_is_an_error() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let mut store = open_store(&tmp);
        assert!(matches!(
            dispatch(&mut store, &[], &mut no_service()),
            AdminReply::Error(_)
        ));
    }

    #[test]
    fn busy_coordinator_surfaces_as_error_reply() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let mut store = open_store(&tmp);
        store.set(0, b"a", b"1").unwrap();

        let AdminReply::Deferred(_reply) = dispatch(&mut store, &["FLUSH"], &mut no_service())
        else {
            panic!("expected a deferred reply");
        };

        let AdminReply::Error(message) = dispatch(&mut store, &["FLUSH"], &mut no_service())
        else {
            panic!("expected an error reply");
        };
        assert!(message.contains("busy"), "unexpected: {message}");
        wait_background(&mut store);
    }
}
