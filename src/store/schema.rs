/// Schema version recorded in `schema_meta`. Bump when the DDL changes.
pub const SCHEMA_VERSION: u32 = 1;

/// Inventory schema, executed as one batch against an empty database.
///
/// `instances.id` is not unique: a retired id that reappears
/// gets a fresh row next to its terminated predecessor. The one active row
/// per id rule is enforced by the store, not by a constraint.
pub const SCHEMA_SQL: &str = r"
CREATE TABLE schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE instances (
    row_id INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL,
    account TEXT NOT NULL,
    region TEXT NOT NULL,
    cloud_provider TEXT NOT NULL,
    ami TEXT NOT NULL,
    name TEXT NOT NULL,
    keypair_name TEXT NOT NULL,
    launch_time TEXT NOT NULL,
    size TEXT NOT NULL,
    subnet TEXT NOT NULL,
    vpc TEXT NOT NULL,
    state TEXT NOT NULL,
    os TEXT NOT NULL,
    private_ip TEXT NOT NULL,
    public_ip TEXT NOT NULL,
    ssh_key TEXT NOT NULL,
    ssh_port INTEGER,
    user TEXT NOT NULL,
    env TEXT NOT NULL,
    notes TEXT NOT NULL,
    skip INTEGER NOT NULL DEFAULT 0 CHECK(skip IN (0, 1)),
    last_seen TEXT
);

CREATE INDEX idx_instances_id_state ON instances(id, state);

CREATE TABLE tags (
    instance_id TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (instance_id, key)
);
";
