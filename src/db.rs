//! SQLite lifecycle store
//!
//! Single source of truth for VM records. Every mutation runs inside a
//! `BEGIN IMMEDIATE` transaction, so the check-then-write sequences below
//! (name uniqueness, pool selection, token numbering) are serialized across
//! processes sharing the same file. Live addresses and identifiers are also
//! backed by partial unique indexes.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::models::*;
use crate::pool::{next_token_id, Allocation, AllocationPools, HeldSet};
use crate::{Error, Result};

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

const VM_COLUMNS: &str = "name, vmid, ip, ipv6, status, owner, username, created_at, expires_at, token_id, mint_status, updated_at";

/// Fields chosen by the caller when reserving a new record
#[derive(Debug, Clone)]
pub struct NewVm {
    pub name: String,
    pub owner: String,
    pub username: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// A row of the token ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenReservation {
    pub id: u64,
    pub vm_name: String,
    pub status: MintStatus,
    pub reserved_at: DateTime<Utc>,
}

/// Handle to the lifecycle store. Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

/// Untyped row, converted to a [`VmRecord`] outside the rusqlite closure so
/// malformed values surface as `StateCorruption`
struct RawVm {
    name: String,
    vmid: i64,
    ip: String,
    ipv6: Option<String>,
    status: String,
    owner: String,
    username: String,
    created_at: String,
    expires_at: String,
    token_id: Option<i64>,
    mint_status: String,
    updated_at: String,
}

impl Database {
    /// Open or create the store
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        tracing::debug!(path = %path.display(), "Lifecycle store opened");
        Ok(db)
    }

    /// Create in-memory store (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        {
            let conn = self.conn.lock();
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS vms (
                    name TEXT PRIMARY KEY,
                    vmid INTEGER NOT NULL,
                    ip TEXT NOT NULL,
                    ipv6 TEXT,
                    status TEXT NOT NULL,
                    owner TEXT NOT NULL,
                    username TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    expires_at TEXT NOT NULL,
                    token_id INTEGER,
                    mint_status TEXT NOT NULL DEFAULT 'unminted',
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS token_ids (
                    id INTEGER PRIMARY KEY,
                    vm_name TEXT NOT NULL,
                    status TEXT NOT NULL,
                    reserved_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_vms_status ON vms(status);
                "#,
            )?;
        }

        // Refuse to build the unique indexes over a file that already breaks them
        self.verify_invariants()?;

        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_vms_live_ip ON vms(ip) WHERE status != 'destroyed';
            CREATE UNIQUE INDEX IF NOT EXISTS idx_vms_live_ipv6 ON vms(ipv6) WHERE status != 'destroyed';
            CREATE UNIQUE INDEX IF NOT EXISTS idx_vms_live_vmid ON vms(vmid) WHERE status != 'destroyed';
            CREATE UNIQUE INDEX IF NOT EXISTS idx_vms_token ON vms(token_id);
            "#,
        )?;
        Ok(())
    }

    /// Check that no two live records share an address or identifier and
    /// that no token id is bound to two records. Never repairs anything.
    pub fn verify_invariants(&self) -> Result<()> {
        let conn = self.conn.lock();
        let checks = [
            ("address", "SELECT ip FROM vms WHERE status != 'destroyed' GROUP BY ip HAVING COUNT(*) > 1"),
            ("ipv6 address", "SELECT ipv6 FROM vms WHERE status != 'destroyed' AND ipv6 IS NOT NULL GROUP BY ipv6 HAVING COUNT(*) > 1"),
            ("vmid", "SELECT CAST(vmid AS TEXT) FROM vms WHERE status != 'destroyed' GROUP BY vmid HAVING COUNT(*) > 1"),
            ("token id", "SELECT CAST(token_id AS TEXT) FROM vms WHERE token_id IS NOT NULL GROUP BY token_id HAVING COUNT(*) > 1"),
        ];
        for (what, sql) in checks {
            let dup: Option<String> = conn.query_row(sql, [], |row| row.get(0)).optional()?;
            if let Some(value) = dup {
                return Err(Error::StateCorruption(format!(
                    "{} {} is held by more than one record",
                    what, value
                )));
            }
        }
        Ok(())
    }

    // ===== Reservation =====

    /// Atomically check the name, pick free pool values and insert the
    /// record as `provisioning`
    pub fn reserve_vm(&self, new: &NewVm, pools: &AllocationPools) -> Result<VmRecord> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        Self::ensure_name_free(&tx, &new.name)?;
        let held = Self::held_set(&tx)?;
        let alloc = pools.allocate(&held)?;

        let now = Utc::now();
        tx.execute(
            &format!(
                "INSERT INTO vms ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL, ?10, ?11)",
                VM_COLUMNS
            ),
            params![
                new.name,
                alloc.vmid,
                alloc.ip.to_string(),
                alloc.ipv6.map(|v| v.to_string()),
                VmStatus::Provisioning.to_string(),
                new.owner,
                new.username,
                new.created_at.to_rfc3339(),
                new.expires_at.to_rfc3339(),
                MintStatus::Unminted.to_string(),
                now.to_rfc3339(),
            ],
        )
        .map_err(|e| constraint_to_conflict(e, &new.name))?;
        tx.commit()?;

        tracing::info!(
            vm = %new.name,
            vmid = alloc.vmid,
            ip = %alloc.ip,
            "VM record reserved"
        );

        Ok(VmRecord {
            name: new.name.clone(),
            vmid: alloc.vmid,
            ip: alloc.ip,
            ipv6: alloc.ipv6,
            status: VmStatus::Provisioning,
            owner: new.owner.clone(),
            username: new.username.clone(),
            created_at: parse_time(&new.created_at.to_rfc3339())?,
            expires_at: parse_time(&new.expires_at.to_rfc3339())?,
            token_id: None,
            mint_status: MintStatus::Unminted,
            updated_at: parse_time(&now.to_rfc3339())?,
        })
    }

    /// What `reserve_vm` would pick right now, without writing anything
    pub fn preview_allocation(&self, name: &str, pools: &AllocationPools) -> Result<Allocation> {
        let conn = self.conn.lock();
        Self::ensure_name_free(&conn, name)?;
        let held = Self::held_set(&conn)?;
        pools.allocate(&held)
    }

    fn ensure_name_free(conn: &Connection, name: &str) -> Result<()> {
        let existing: Option<String> = conn
            .query_row("SELECT status FROM vms WHERE name = ?1", params![name], |row| row.get(0))
            .optional()?;
        match existing.as_deref() {
            None => Ok(()),
            Some("destroyed") => Err(Error::Conflict(format!(
                "name '{}' belonged to a destroyed VM and cannot be reused",
                name
            ))),
            Some(status) => Err(Error::Conflict(format!(
                "VM '{}' already exists ({})",
                name, status
            ))),
        }
    }

    fn held_set(conn: &Connection) -> Result<HeldSet> {
        let mut held = HeldSet::default();
        let mut stmt = conn.prepare("SELECT ip, ipv6, vmid FROM vms WHERE status != 'destroyed'")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for (ip, ipv6, vmid) in rows {
            held.ips.insert(parse_ipv4(&ip)?);
            if let Some(v6) = ipv6 {
                held.ipv6s.insert(parse_ipv6(&v6)?);
            }
            held.vmids.insert(to_vmid(vmid)?);
        }
        Ok(held)
    }

    // ===== Queries =====

    pub fn get_vm_by_name(&self, name: &str) -> Result<Option<VmRecord>> {
        let conn = self.conn.lock();
        Self::fetch(&conn, name)
    }

    fn fetch(conn: &Connection, name: &str) -> Result<Option<VmRecord>> {
        let raw = conn
            .query_row(
                &format!("SELECT {} FROM vms WHERE name = ?1", VM_COLUMNS),
                params![name],
                Self::row_to_raw,
            )
            .optional()?;
        raw.map(RawVm::into_record).transpose()
    }

    /// All records including tombstones, oldest first
    pub fn list_vms(&self) -> Result<Vec<VmRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM vms ORDER BY created_at, name",
            VM_COLUMNS
        ))?;
        let raws = stmt
            .query_map([], Self::row_to_raw)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        raws.into_iter().map(RawVm::into_record).collect()
    }

    pub fn list_by_status(&self, status: VmStatus) -> Result<Vec<VmRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM vms WHERE status = ?1 ORDER BY expires_at, name",
            VM_COLUMNS
        ))?;
        let raws = stmt
            .query_map(params![status.to_string()], Self::row_to_raw)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        raws.into_iter().map(RawVm::into_record).collect()
    }

    // ===== Transitions =====

    /// Move a record to `to` only if its current status is one of `from`
    pub fn transition(&self, name: &str, from: &[VmStatus], to: VmStatus) -> Result<VmRecord> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let record = Self::fetch(&tx, name)?.ok_or_else(|| Error::NotFound(name.to_string()))?;
        if !from.contains(&record.status) {
            return Err(Error::Conflict(format!(
                "VM '{}' is {}, cannot move to {}",
                name, record.status, to
            )));
        }
        let now = Utc::now();
        tx.execute(
            "UPDATE vms SET status = ?1, updated_at = ?2 WHERE name = ?3",
            params![to.to_string(), now.to_rfc3339(), name],
        )?;
        tx.commit()?;
        tracing::debug!(vm = %name, from = %record.status, to = %to, "VM status changed");
        Ok(VmRecord {
            status: to,
            updated_at: now,
            ..record
        })
    }

    /// Tombstone the record, releasing its address and identifier.
    /// Returns false when it was already destroyed.
    pub fn mark_destroyed(&self, name: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE vms SET status = 'destroyed', updated_at = ?1 WHERE name = ?2 AND status != 'destroyed'",
            params![Utc::now().to_rfc3339(), name],
        )?;
        if rows == 0 && Self::fetch(&conn, name)?.is_none() {
            return Err(Error::NotFound(name.to_string()));
        }
        Ok(rows > 0)
    }

    pub fn extend_expiry(&self, name: &str, expires_at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE vms SET expires_at = ?1, updated_at = ?2 WHERE name = ?3",
            params![expires_at.to_rfc3339(), Utc::now().to_rfc3339(), name],
        )?;
        if rows == 0 {
            return Err(Error::NotFound(name.to_string()));
        }
        Ok(())
    }

    /// Bring a tombstone back as `suspended` with a new expiry. Its original
    /// address and identifier must still be free; nothing is re-allocated.
    pub fn reactivate(&self, name: &str, expires_at: DateTime<Utc>) -> Result<VmRecord> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let record = Self::fetch(&tx, name)?.ok_or_else(|| Error::NotFound(name.to_string()))?;
        if record.status != VmStatus::Destroyed {
            return Err(Error::Conflict(format!(
                "VM '{}' is {}, not destroyed",
                name, record.status
            )));
        }

        let held = Self::held_set(&tx)?;
        if held.ips.contains(&record.ip) {
            return Err(Error::Conflict(format!(
                "address {} of '{}' has been reassigned",
                record.ip, name
            )));
        }
        if held.vmids.contains(&record.vmid) {
            return Err(Error::Conflict(format!(
                "vmid {} of '{}' has been reassigned",
                record.vmid, name
            )));
        }
        if let Some(v6) = record.ipv6 {
            if held.ipv6s.contains(&v6) {
                return Err(Error::Conflict(format!(
                    "ipv6 address {} of '{}' has been reassigned",
                    v6, name
                )));
            }
        }

        let now = Utc::now();
        tx.execute(
            "UPDATE vms SET status = 'suspended', expires_at = ?1, updated_at = ?2 WHERE name = ?3",
            params![expires_at.to_rfc3339(), now.to_rfc3339(), name],
        )
        .map_err(|e| constraint_to_conflict(e, name))?;
        tx.commit()?;
        tracing::info!(vm = %name, vmid = record.vmid, "Destroyed VM record reclaimed");

        Ok(VmRecord {
            status: VmStatus::Suspended,
            expires_at: parse_time(&expires_at.to_rfc3339())?,
            updated_at: now,
            ..record
        })
    }

    // ===== Ownership tokens =====

    /// Reserve the next token id for a record. The id is consumed even if
    /// the mint later fails.
    pub fn reserve_token_id(&self, vm_name: &str, first_id: u64) -> Result<u64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if Self::fetch(&tx, vm_name)?.is_none() {
            return Err(Error::NotFound(vm_name.to_string()));
        }
        let highest: Option<i64> = tx.query_row("SELECT MAX(id) FROM token_ids", [], |row| row.get(0))?;
        let highest = highest.map(to_token_id).transpose()?;
        let id = next_token_id(highest, first_id);
        let sql_id = i64::try_from(id)
            .map_err(|_| Error::Conflict("token id space exhausted".into()))?;

        tx.execute(
            "INSERT INTO token_ids (id, vm_name, status, reserved_at) VALUES (?1, ?2, ?3, ?4)",
            params![sql_id, vm_name, MintStatus::Unminted.to_string(), Utc::now().to_rfc3339()],
        )?;
        tx.execute(
            "UPDATE vms SET token_id = ?1, mint_status = ?2, updated_at = ?3 WHERE name = ?4",
            params![sql_id, MintStatus::Unminted.to_string(), Utc::now().to_rfc3339(), vm_name],
        )?;
        tx.commit()?;
        tracing::info!(vm = %vm_name, token_id = id, "Token id reserved");
        Ok(id)
    }

    pub fn mark_token_minted(&self, vm_name: &str, token_id: u64) -> Result<()> {
        self.set_token_status(vm_name, token_id, MintStatus::Minted)
    }

    /// Burn the id: it stays in the ledger and is never handed out again
    pub fn mark_token_failed(&self, vm_name: &str, token_id: u64) -> Result<()> {
        self.set_token_status(vm_name, token_id, MintStatus::Failed)
    }

    fn set_token_status(&self, vm_name: &str, token_id: u64, status: MintStatus) -> Result<()> {
        let sql_id = i64::try_from(token_id)
            .map_err(|_| Error::Validation(format!("token id {} out of range", token_id)))?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let rows = tx.execute(
            "UPDATE token_ids SET status = ?1 WHERE id = ?2 AND vm_name = ?3",
            params![status.to_string(), sql_id, vm_name],
        )?;
        if rows == 0 {
            return Err(Error::NotFound(format!("token {} for '{}'", token_id, vm_name)));
        }
        tx.execute(
            "UPDATE vms SET mint_status = ?1, updated_at = ?2 WHERE name = ?3 AND token_id = ?4",
            params![status.to_string(), Utc::now().to_rfc3339(), vm_name, sql_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Full token ledger, lowest id first
    pub fn list_tokens(&self) -> Result<Vec<TokenReservation>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id, vm_name, status, reserved_at FROM token_ids ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(id, vm_name, status, reserved_at)| {
                Ok(TokenReservation {
                    id: to_token_id(id)?,
                    vm_name,
                    status: status.parse().map_err(Error::StateCorruption)?,
                    reserved_at: parse_time(&reserved_at)?,
                })
            })
            .collect()
    }

    fn row_to_raw(row: &rusqlite::Row) -> rusqlite::Result<RawVm> {
        Ok(RawVm {
            name: row.get(0)?,
            vmid: row.get(1)?,
            ip: row.get(2)?,
            ipv6: row.get(3)?,
            status: row.get(4)?,
            owner: row.get(5)?,
            username: row.get(6)?,
            created_at: row.get(7)?,
            expires_at: row.get(8)?,
            token_id: row.get(9)?,
            mint_status: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }
}

impl RawVm {
    fn into_record(self) -> Result<VmRecord> {
        Ok(VmRecord {
            vmid: to_vmid(self.vmid)?,
            ip: parse_ipv4(&self.ip)?,
            ipv6: self.ipv6.as_deref().map(parse_ipv6).transpose()?,
            status: self.status.parse().map_err(Error::StateCorruption)?,
            created_at: parse_time(&self.created_at)?,
            expires_at: parse_time(&self.expires_at)?,
            token_id: self.token_id.map(to_token_id).transpose()?,
            mint_status: self.mint_status.parse().map_err(Error::StateCorruption)?,
            updated_at: parse_time(&self.updated_at)?,
            name: self.name,
            owner: self.owner,
            username: self.username,
        })
    }
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::StateCorruption(format!("bad timestamp '{}': {}", s, e)))
}

fn parse_ipv4(s: &str) -> Result<Ipv4Addr> {
    s.parse()
        .map_err(|_| Error::StateCorruption(format!("bad address '{}' in store", s)))
}

fn parse_ipv6(s: &str) -> Result<Ipv6Addr> {
    s.parse()
        .map_err(|_| Error::StateCorruption(format!("bad ipv6 address '{}' in store", s)))
}

fn to_vmid(v: i64) -> Result<u32> {
    u32::try_from(v).map_err(|_| Error::StateCorruption(format!("bad vmid {} in store", v)))
}

fn to_token_id(v: i64) -> Result<u64> {
    u64::try_from(v).map_err(|_| Error::StateCorruption(format!("bad token id {} in store", v)))
}

fn constraint_to_conflict(e: rusqlite::Error, name: &str) -> Error {
    match e {
        rusqlite::Error::SqliteFailure(ref f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Error::Conflict(format!("allocation for '{}' collides with a live record", name))
        }
        other => other.into(),
    }
}
