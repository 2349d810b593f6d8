//! Database schema constants for the SQLite version store.
//!
//! Identifiers are stored as TEXT (hyphenated UUIDs) and timestamps as
//! RFC 3339 TEXT so rows stay readable with the sqlite3 shell.

/// Tracks which schema statements have been applied.
pub const CREATE_MIGRATIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS _migrations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    applied_at TEXT NOT NULL
)
"#;

/// SQL schema for the pipelines table.
pub const CREATE_PIPELINES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS pipelines (
    id TEXT PRIMARY KEY,
    domain TEXT NOT NULL,
    domain_version INTEGER NOT NULL,
    stage TEXT NOT NULL,
    status TEXT NOT NULL,
    error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)
"#;

/// SQL schema for the stage_versions table.
///
/// The unique constraint backs the "never reused" version-number invariant.
pub const CREATE_STAGE_VERSIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS stage_versions (
    id TEXT PRIMARY KEY,
    pipeline_id TEXT NOT NULL REFERENCES pipelines(id),
    stage TEXT NOT NULL,
    version_number INTEGER NOT NULL,
    batch INTEGER NOT NULL,
    source TEXT,
    status TEXT NOT NULL,
    error TEXT,
    output_path TEXT,
    checksum TEXT,
    created_at TEXT NOT NULL,
    finished_at TEXT,
    UNIQUE(pipeline_id, stage, version_number)
)
"#;

/// SQL schema for lineage edges between stage versions.
pub const CREATE_VERSION_INPUTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS version_inputs (
    version_id TEXT NOT NULL REFERENCES stage_versions(id),
    input_id TEXT NOT NULL REFERENCES stage_versions(id),
    position INTEGER NOT NULL,
    PRIMARY KEY (version_id, input_id)
)
"#;

/// Highest reserved batch per (pipeline, stage).
///
/// Batches are reserved before any version of the batch exists, so the
/// reservation is recorded separately from the versions themselves.
pub const CREATE_STAGE_BATCHES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS stage_batches (
    pipeline_id TEXT NOT NULL REFERENCES pipelines(id),
    stage TEXT NOT NULL,
    last_batch INTEGER NOT NULL,
    PRIMARY KEY (pipeline_id, stage)
)
"#;

pub const CREATE_VERSIONS_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_stage_versions_pipeline_stage
    ON stage_versions(pipeline_id, stage, version_number)
"#;

/// One pipeline per (domain, domain_version): its stage versions own the
/// artifact directories under that pair.
pub const CREATE_PIPELINES_DOMAIN_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS idx_pipelines_domain_version
    ON pipelines(domain, domain_version)
"#;

/// Returns all schema statements in creation order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_PIPELINES_TABLE,
        CREATE_STAGE_VERSIONS_TABLE,
        CREATE_VERSION_INPUTS_TABLE,
        CREATE_STAGE_BATCHES_TABLE,
        CREATE_VERSIONS_INDEX,
        CREATE_PIPELINES_DOMAIN_INDEX,
    ]
}

/// Table names in the schema.
pub mod tables {
    pub const PIPELINES: &str = "pipelines";
    pub const STAGE_VERSIONS: &str = "stage_versions";
    pub const VERSION_INPUTS: &str = "version_inputs";
    pub const STAGE_BATCHES: &str = "stage_batches";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_schema_statements_order() {
        let statements = all_schema_statements();
        assert_eq!(statements.len(), 6);
        // Pipelines come first (everything references them)
        assert!(statements[0].contains(tables::PIPELINES));
        assert!(statements[1].contains(tables::STAGE_VERSIONS));
        assert!(statements[4].contains("CREATE INDEX"));
        assert!(statements[5].contains("UNIQUE INDEX"));
    }
}
