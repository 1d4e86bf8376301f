#[cfg(test)]
mod tests {
    use crate::store::{Store, StoreConfig, StoreError};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn base_config(tmp: &TempDir) -> StoreConfig {
        StoreConfig {
            snapshot_dir: tmp.path().join("snapshot"),
            ..StoreConfig::default()
        }
    }

    #[test]
    fn default_config_opens() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(tmp.path().join("store"), base_config(&tmp)).unwrap();
        assert_eq!(store.stats().dirty_keys, 0);
    }

    #[test]
    fn zero_databases_rejected() {
        let tmp = TempDir::new().unwrap();
        let err = Store::open(
            tmp.path().join("store"),
            StoreConfig {
                databases: 0,
                ..base_config(&tmp)
            },
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
    }

    #[test]
    fn zero_write_buffer_rejected() {
        let tmp = TempDir::new().unwrap();
        let err = Store::open(
            tmp.path().join("store"),
            StoreConfig {
                txn_write_buffer: 0,
                ..base_config(&tmp)
            },
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
    }

    #[test]
    fn zero_yield_rate_rejected() {
        let tmp = TempDir::new().unwrap();
        let err = Store::open(
            tmp.path().join("store"),
            StoreConfig {
                preload_yield_every: 0,
                ..base_config(&tmp)
            },
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
    }

    #[test]
    fn empty_snapshot_dir_rejected() {
        let tmp = TempDir::new().unwrap();
        let err = Store::open(
            tmp.path().join("store"),
            StoreConfig {
                snapshot_dir: PathBuf::new(),
                ..StoreConfig::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
    }
}
