//! SQLite schema for the folio engine.
//!
//! Tables:
//! - `authorization_ranges`: authority-approved number blocks (CAFs)
//! - `folios`: one row per number, retained forever for audit
//! - `replenishment_requests`: authority requests and their outcome
//! - `locks`: TTL-bounded named locks with fencing tokens
//!
//! Timestamps are stored as unix milliseconds.

/// DDL for all engine tables.
///
/// Schema version: 1
pub const FOLIO_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS authorization_ranges (
    range_id                   TEXT PRIMARY KEY,
    issuer                     TEXT NOT NULL,
    doc_type                   TEXT NOT NULL,
    start_number               INTEGER NOT NULL,
    end_number                 INTEGER NOT NULL,
    authorized_at_ms           INTEGER NOT NULL,
    expires_at_ms              INTEGER NOT NULL,
    status                     TEXT NOT NULL
        CHECK (status IN ('ACTIVE', 'EXPIRED', 'EXHAUSTED')),
    artifact_hash              TEXT,
    source_tracking_id         TEXT,
    registered_at_ms           INTEGER NOT NULL,
    status_changed_at_ms       INTEGER,
    near_expiry_alerted_at_ms  INTEGER,
    CHECK (start_number >= 1 AND end_number >= start_number),
    CHECK (expires_at_ms > authorized_at_ms)
);

CREATE TABLE IF NOT EXISTS folios (
    issuer        TEXT NOT NULL,
    doc_type      TEXT NOT NULL,
    number        INTEGER NOT NULL,
    range_id      TEXT NOT NULL REFERENCES authorization_ranges(range_id),
    status        TEXT NOT NULL DEFAULT 'AVAILABLE'
        CHECK (status IN ('AVAILABLE', 'USED', 'VOID')),
    used_at_ms    INTEGER,
    document_id   TEXT,
    voided_at_ms  INTEGER,
    void_reason   TEXT,
    PRIMARY KEY (issuer, doc_type, number)
);

CREATE TABLE IF NOT EXISTS replenishment_requests (
    tracking_id       TEXT PRIMARY KEY,
    issuer            TEXT NOT NULL,
    doc_type          TEXT NOT NULL,
    start_number      INTEGER NOT NULL,
    end_number        INTEGER NOT NULL,
    status            TEXT NOT NULL
        CHECK (status IN ('PENDING', 'ACCEPTED', 'REJECTED', 'TIMED_OUT')),
    reason            TEXT,
    range_id          TEXT,
    requested_at_ms   INTEGER NOT NULL,
    resolved_at_ms    INTEGER
);

CREATE TABLE IF NOT EXISTS locks (
    lock_key        TEXT PRIMARY KEY,
    holder_token    TEXT NOT NULL,
    fencing_token   INTEGER NOT NULL,
    acquired_at_ms  INTEGER NOT NULL,
    -- 0 = released
    deadline_ms     INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_ranges_series
    ON authorization_ranges(issuer, doc_type, status);
CREATE INDEX IF NOT EXISTS idx_folios_next
    ON folios(issuer, doc_type, status, number);
CREATE INDEX IF NOT EXISTS idx_folios_range
    ON folios(range_id, status);
CREATE UNIQUE INDEX IF NOT EXISTS idx_requests_one_pending
    ON replenishment_requests(issuer, doc_type) WHERE status = 'PENDING';

-- Folio status only moves out of AVAILABLE, once.
CREATE TRIGGER IF NOT EXISTS trg_folios_status_forward
BEFORE UPDATE OF status ON folios
WHEN OLD.status <> NEW.status AND OLD.status <> 'AVAILABLE'
BEGIN
    SELECT RAISE(ABORT, 'folio status is terminal');
END;

-- Folios are never deleted.
CREATE TRIGGER IF NOT EXISTS trg_folios_no_delete
BEFORE DELETE ON folios
BEGIN
    SELECT RAISE(ABORT, 'folios are retained for audit');
END;

-- EXPIRED and EXHAUSTED are terminal.
CREATE TRIGGER IF NOT EXISTS trg_ranges_status_terminal
BEFORE UPDATE OF status ON authorization_ranges
WHEN OLD.status <> NEW.status AND OLD.status <> 'ACTIVE'
BEGIN
    SELECT RAISE(ABORT, 'range status is terminal');
END;
"#;
