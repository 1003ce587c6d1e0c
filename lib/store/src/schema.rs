//! Relational schema for deployments that back [`crate::TransactionStore`]
//! with a database instead of the bundled in-memory store. Kept in code so
//! the store and its tables cannot drift apart.

/// Durable global-transaction records.
pub const GLOBAL_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS global_table (
    xid              VARCHAR(128) NOT NULL PRIMARY KEY,
    status           VARCHAR(32)  NOT NULL,
    application_id   VARCHAR(64)  NOT NULL,
    transaction_name VARCHAR(128) NOT NULL,
    timeout_ms       BIGINT       NOT NULL,
    begin_time_ms    BIGINT       NOT NULL,
    application_data TEXT,
    INDEX idx_status_begin (status, begin_time_ms)
);
"#;

/// One row per branch, indexed by owning xid.
pub const BRANCH_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS branch_table (
    branch_id         BIGINT       NOT NULL PRIMARY KEY,
    xid               VARCHAR(128) NOT NULL,
    resource_group_id VARCHAR(64)  NOT NULL,
    resource_id       VARCHAR(256) NOT NULL,
    branch_type       VARCHAR(8)   NOT NULL,
    lock_key          TEXT,
    status            VARCHAR(32)  NOT NULL,
    application_data  TEXT,
    begin_time_ms     BIGINT       NOT NULL,
    end_time_ms       BIGINT,
    timeout_ms        BIGINT       NOT NULL,
    INDEX idx_xid (xid)
);
"#;

/// AT-mode global row locks. `row_key` is `resource_id:table:pk`.
pub const GLOBAL_LOCK_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS global_lock (
    row_key        VARCHAR(256) NOT NULL PRIMARY KEY,
    xid            VARCHAR(128) NOT NULL,
    branch_id      BIGINT       NOT NULL,
    acquired_at_ms BIGINT       NOT NULL,
    INDEX idx_xid (xid)
);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ddl_names_every_record_field() {
        for column in [
            "xid", "status", "application_id", "transaction_name", "timeout_ms",
            "begin_time_ms", "application_data",
        ] {
            assert!(GLOBAL_TABLE_DDL.contains(column), "missing {}", column);
        }
        for column in [
            "branch_id", "xid", "resource_group_id", "resource_id", "branch_type",
            "lock_key", "status", "begin_time_ms", "end_time_ms", "timeout_ms",
        ] {
            assert!(BRANCH_TABLE_DDL.contains(column), "missing {}", column);
        }
        for column in ["row_key", "xid", "branch_id", "acquired_at_ms"] {
            assert!(GLOBAL_LOCK_DDL.contains(column), "missing {}", column);
        }
    }
}
