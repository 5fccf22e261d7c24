pub const SCHEMA_VERSION: u32 = 1;

pub const PRAGMAS: &str = "
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA busy_timeout = 5000;
";

pub const CREATE_TABLES: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS property_values (
    namespace_id INTEGER NOT NULL,
    property_id  INTEGER NOT NULL,
    name         TEXT NOT NULL,
    type_def     TEXT NOT NULL,
    value        BLOB NOT NULL,
    updated_at   TEXT NOT NULL,
    PRIMARY KEY (namespace_id, property_id)
);
";
