use anyhow::Context;
use rusqlite::Connection;
use std::path::Path;

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;

        // Enable WAL mode for crash safety
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    fn migrate(&self) -> anyhow::Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }
}

const SCHEMA: &str = r#"
-- One row per channel evaluated by a fee-setting run
CREATE TABLE IF NOT EXISTS fee_decisions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_at INTEGER NOT NULL,
    channel_id TEXT NOT NULL,
    channel_point TEXT NOT NULL,
    capacity_sats INTEGER NOT NULL,
    unbalancedness REAL NOT NULL,
    flow_direction REAL NOT NULL,
    fees_total_msat INTEGER NOT NULL DEFAULT 0,
    number_forwardings INTEGER NOT NULL DEFAULT 0,
    forwarded_in_sats INTEGER NOT NULL DEFAULT 0,
    forwarded_out_sats INTEGER NOT NULL DEFAULT 0,
    factor_demand REAL NOT NULL,
    factor_unbalancedness REAL NOT NULL,
    factor_flow REAL NOT NULL,
    weighted_change REAL NOT NULL,
    applied_change REAL NOT NULL,
    fee_rate_old REAL NOT NULL,
    fee_rate_new REAL NOT NULL,
    applied INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_fee_decisions_run
    ON fee_decisions(run_at);

-- Channels a run could not evaluate
CREATE TABLE IF NOT EXISTS fee_decision_errors (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_at INTEGER NOT NULL,
    channel_id TEXT NOT NULL,
    reason TEXT NOT NULL
);
"#;
