/// Schema for the cache tables.
///
/// Every record table shares one shape: a primary key, the JSON document and the
/// cache schema version it was written under. Multi-valued lookups (barcodes,
/// keywords, serials, batches, groups, price lists) go through `search_terms`.
pub const SCHEMA: &str = r#"
-- Scalar mirror slots
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    schema_version INTEGER NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Offline mutation queue slots
CREATE TABLE IF NOT EXISTS queues (
    key TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    schema_version INTEGER NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Items keyed by item_code
CREATE TABLE IF NOT EXISTS items (
    key TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    schema_version INTEGER NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Customers keyed by name
CREATE TABLE IF NOT EXISTS customers (
    key TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    schema_version INTEGER NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Price list rates keyed by (price_list, item_code)
CREATE TABLE IF NOT EXISTS item_prices (
    key TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    schema_version INTEGER NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Derived lookup terms
CREATE TABLE IF NOT EXISTS search_terms (
    tbl TEXT NOT NULL,
    field TEXT NOT NULL,
    term TEXT NOT NULL,
    key TEXT NOT NULL,
    PRIMARY KEY (tbl, field, term, key)
);

CREATE INDEX IF NOT EXISTS idx_search_terms_key ON search_terms(tbl, key);
"#;
