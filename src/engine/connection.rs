use crate::policy::{Command, TENANT_COLUMN};
use crate::tenant::TenantId;

use super::{
    Affected, ConnectionId, Database, EngineError, Filter, NewRow, Patch, Row, RowId, Settings,
    ID_COLUMN,
};

#[derive(Debug)]
enum Undo {
    Inserted { table: String, id: RowId },
    Updated { table: String, before: Row },
    Deleted { table: String, row: Row },
}

/// A physical connection to a [`Database`].
///
/// Settings written with `set_config` are what row policies read.
/// Session-level settings live until overwritten or `reset_all`;
/// transaction-local settings vanish at commit or rollback.
///
/// Only the pool and the binder hold one. Everything outside the crate
/// reaches rows through a `ScopedConnection`.
///
/// Transactions are atomic on rollback (an undo log restores every row the
/// transaction touched) but are not isolated from other connections.
#[derive(Debug)]
pub(crate) struct Connection {
    id: ConnectionId,
    db: Database,
    settings: Settings,
    txn: Option<Vec<Undo>>,
}

impl Connection {
    pub(super) fn new(id: ConnectionId, db: Database) -> Self {
        Self {
            id,
            db,
            settings: Settings::default(),
            txn: None,
        }
    }

    /// Returns the physical connection id.
    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    /// Sets (or with `None`, resets) a setting.
    ///
    /// With `is_local` the value lasts until the current transaction ends;
    /// outside a transaction a local set has no effect.
    pub(crate) fn set_config(&mut self, name: &str, value: Option<&str>, is_local: bool) {
        match (value, is_local) {
            (None, _) => self.settings.remove(name),
            (Some(_), true) if self.txn.is_none() => {
                tracing::warn!(
                    connection = %self.id,
                    setting = name,
                    "transaction-local setting outside a transaction has no effect"
                );
            }
            (Some(v), true) => self.settings.set_local(name, v),
            (Some(v), false) => self.settings.set_session(name, v),
        }
    }

    /// Returns the effective value of a setting.
    pub(crate) fn current_setting(&self, name: &str) -> Option<&str> {
        self.settings.get(name)
    }

    /// Rolls back any open transaction and clears every setting.
    ///
    /// Calling it repeatedly is harmless.
    pub(crate) fn reset_all(&mut self) {
        if self.txn.is_some() {
            self.rollback_inner();
        }
        self.settings.clear();
    }

    /// Returns true if no settings are bound and no transaction is open.
    pub(crate) fn is_clean(&self) -> bool {
        self.txn.is_none() && self.settings.is_empty()
    }

    /// Returns true if a transaction is open.
    pub(crate) fn in_transaction(&self) -> bool {
        self.txn.is_some()
    }

    /// Starts a transaction.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::TransactionInProgress` if one is already open.
    pub(crate) fn begin(&mut self) -> Result<(), EngineError> {
        if self.txn.is_some() {
            return Err(EngineError::TransactionInProgress);
        }
        self.txn = Some(Vec::new());
        Ok(())
    }

    /// Commits the open transaction and drops its local settings.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::NoTransaction` if none is open.
    pub(crate) fn commit(&mut self) -> Result<(), EngineError> {
        if self.txn.take().is_none() {
            return Err(EngineError::NoTransaction);
        }
        self.settings.clear_local();
        Ok(())
    }

    /// Rolls back the open transaction, restoring every touched row.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::NoTransaction` if none is open.
    pub(crate) fn rollback(&mut self) -> Result<(), EngineError> {
        if self.txn.is_none() {
            return Err(EngineError::NoTransaction);
        }
        self.rollback_inner();
        Ok(())
    }

    fn rollback_inner(&mut self) {
        let undo = self.txn.take().unwrap_or_default();
        let mut tables = self.db.tables().write();
        for entry in undo.into_iter().rev() {
            match entry {
                Undo::Inserted { table, id } => {
                    if let Some(t) = tables.get_mut(&table) {
                        t.remove(id);
                    }
                }
                Undo::Updated { table, before: row } | Undo::Deleted { table, row } => {
                    if let Some(t) = tables.get_mut(&table) {
                        t.put(row);
                    }
                }
            }
        }
        self.settings.clear_local();
    }

    fn record(&mut self, undo: Undo) {
        if let Some(log) = self.txn.as_mut() {
            log.push(undo);
        }
    }

    /// Returns every row the SELECT policy and the filter both admit.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::UnknownTable` if the table does not exist.
    pub(crate) fn select(&self, table: &str, filter: &Filter) -> Result<Vec<Row>, EngineError> {
        let tables = self.db.tables().read();
        let t = tables
            .get(table)
            .ok_or_else(|| EngineError::UnknownTable(table.to_string()))?;
        let policy = &t.schema().policy().select;
        let vars = self.db.vars();

        Ok(t.rows()
            .filter(|row| policy.evaluate(&row.tenant_id, &self.settings, vars))
            .filter(|row| filter.matches(row))
            .cloned()
            .collect())
    }

    /// Inserts a row and returns its id.
    ///
    /// A row without an explicit tenant takes the bound tenant setting.
    ///
    /// # Errors
    ///
    /// - `PolicyViolation` if the row fails the INSERT check
    /// - `NotNullViolation` if no tenant is given or bound
    /// - `ReservedColumn` if the data names an engine-managed column
    pub(crate) fn insert(&mut self, table: &str, row: NewRow) -> Result<RowId, EngineError> {
        reject_reserved(&row.data)?;

        let id = {
            let mut tables = self.db.tables().write();
            let t = tables
                .get_mut(table)
                .ok_or_else(|| EngineError::UnknownTable(table.to_string()))?;
            let vars = self.db.vars();

            let tenant = match row.tenant_id {
                Some(tenant) => tenant,
                None => self
                    .settings
                    .get(&vars.tenant_var)
                    .and_then(TenantId::parse)
                    .ok_or_else(|| EngineError::NotNullViolation {
                        table: table.to_string(),
                        column: TENANT_COLUMN,
                    })?,
            };

            if !t
                .schema()
                .policy()
                .insert_check
                .evaluate(&tenant, &self.settings, vars)
            {
                return Err(EngineError::PolicyViolation {
                    table: table.to_string(),
                    command: Command::Insert,
                });
            }

            let id = t.allocate_id();
            t.put(Row {
                id,
                tenant_id: tenant,
                data: row.data,
            });
            id
        };

        self.record(Undo::Inserted {
            table: table.to_string(),
            id,
        });
        tracing::trace!(connection = %self.id, table, row = id, "row inserted");
        Ok(id)
    }

    /// Updates every row the UPDATE policy and the filter admit.
    ///
    /// The statement is all-or-nothing: if any new row image fails the
    /// UPDATE check, no row is changed. Rows a targeted filter names but the
    /// USING policy hides are counted as denied.
    ///
    /// # Errors
    ///
    /// - `PolicyViolation` if a new row image fails the UPDATE check
    /// - `ImmutableColumn` if the patch changes a row's tenant
    /// - `ReservedColumn` if the data names an engine-managed column
    pub(crate) fn update(
        &mut self,
        table: &str,
        filter: &Filter,
        patch: &Patch,
    ) -> Result<Affected, EngineError> {
        reject_reserved(&patch.data)?;

        let (changed, denied) = {
            let mut tables = self.db.tables().write();
            let t = tables
                .get_mut(table)
                .ok_or_else(|| EngineError::UnknownTable(table.to_string()))?;
            let vars = self.db.vars();

            let mut changes = Vec::new();
            let mut denied = 0;
            {
                let policy = t.schema().policy();
                for row in t.rows() {
                    if !filter.matches(row) {
                        continue;
                    }
                    if !policy.update_using.evaluate(&row.tenant_id, &self.settings, vars) {
                        if filter.is_targeted() {
                            denied += 1;
                        }
                        continue;
                    }
                    let mut after = row.clone();
                    if let Some(tenant) = &patch.tenant_id {
                        after.tenant_id = tenant.clone();
                    }
                    for (column, value) in &patch.data {
                        after.data.insert(column.clone(), value.clone());
                    }

                    if !policy
                        .update_check
                        .evaluate(&after.tenant_id, &self.settings, vars)
                    {
                        return Err(EngineError::PolicyViolation {
                            table: table.to_string(),
                            command: Command::Update,
                        });
                    }
                    if after.tenant_id != row.tenant_id {
                        return Err(EngineError::ImmutableColumn {
                            table: table.to_string(),
                            column: TENANT_COLUMN,
                        });
                    }
                    changes.push((row.clone(), after));
                }
            }

            for (_, after) in &changes {
                t.put(after.clone());
            }
            (changes, denied)
        };

        let count = changed.len() as u64;
        for (before, _) in changed {
            self.record(Undo::Updated {
                table: table.to_string(),
                before,
            });
        }
        tracing::trace!(connection = %self.id, table, rows = count, denied, "rows updated");
        Ok(Affected {
            rows: count,
            denied,
        })
    }

    /// Deletes every row the DELETE policy and the filter admit.
    ///
    /// Rows a targeted filter names but the policy hides are counted as
    /// denied.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::UnknownTable` if the table does not exist.
    pub(crate) fn delete(&mut self, table: &str, filter: &Filter) -> Result<Affected, EngineError> {
        let (removed, denied) = {
            let mut tables = self.db.tables().write();
            let t = tables
                .get_mut(table)
                .ok_or_else(|| EngineError::UnknownTable(table.to_string()))?;
            let vars = self.db.vars();

            let mut ids: Vec<RowId> = Vec::new();
            let mut denied = 0;
            {
                let policy = &t.schema().policy().delete;
                for row in t.rows().filter(|row| filter.matches(row)) {
                    if policy.evaluate(&row.tenant_id, &self.settings, vars) {
                        ids.push(row.id);
                    } else if filter.is_targeted() {
                        denied += 1;
                    }
                }
            }
            let removed = ids
                .into_iter()
                .filter_map(|id| t.remove(id))
                .collect::<Vec<Row>>();
            (removed, denied)
        };

        let count = removed.len() as u64;
        for row in removed {
            self.record(Undo::Deleted {
                table: table.to_string(),
                row,
            });
        }
        tracing::trace!(connection = %self.id, table, rows = count, denied, "rows deleted");
        Ok(Affected {
            rows: count,
            denied,
        })
    }
}

fn reject_reserved(data: &serde_json::Map<String, serde_json::Value>) -> Result<(), EngineError> {
    for column in [ID_COLUMN, TENANT_COLUMN] {
        if data.contains_key(column) {
            return Err(EngineError::ReservedColumn(column.to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TableSchema;
    use crate::policy::PolicySet;

    fn tid(s: &str) -> TenantId {
        TenantId::parse(s).unwrap()
    }

    fn seeded() -> Database {
        let db = Database::default();
        db.create_table(TableSchema::new("patients")).unwrap();
        let mut admin = db.connect();
        admin.begin().unwrap();
        admin.set_config("app.role", Some("platform_admin"), true);
        admin
            .insert("patients", NewRow::for_tenant(tid("a")).set("name", "Ada"))
            .unwrap();
        admin
            .insert("patients", NewRow::for_tenant(tid("b")).set("name", "Bo"))
            .unwrap();
        admin.commit().unwrap();
        db
    }

    fn bound(db: &Database, tenant: &str, role: &str) -> Connection {
        let mut conn = db.connect();
        conn.set_config("app.tenant_id", Some(tenant), false);
        conn.set_config("app.role", Some(role), false);
        conn
    }

    #[test]
    fn select_applies_policy_without_statement_filter() {
        let db = seeded();
        let conn = bound(&db, "a", "member");
        let rows = conn.select("patients", &Filter::All).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].tenant_id, tid("a"));
    }

    #[test]
    fn unbound_connection_sees_nothing() {
        let db = seeded();
        let conn = db.connect();
        assert!(conn.select("patients", &Filter::All).unwrap().is_empty());
    }

    #[test]
    fn unbound_connection_writes_nothing() {
        let db = seeded();
        let mut conn = db.connect();
        assert!(matches!(
            conn.insert("patients", NewRow::for_tenant(tid("a"))),
            Err(EngineError::PolicyViolation { .. })
        ));
        assert_eq!(
            conn.update("patients", &Filter::All, &Patch::new().set("x", 1)),
            Ok(Affected::default())
        );
        assert_eq!(conn.delete("patients", &Filter::All), Ok(Affected::default()));
    }

    #[test]
    fn insert_defaults_tenant_from_setting() {
        let db = seeded();
        let mut conn = bound(&db, "a", "member");
        let id = conn.insert("patients", NewRow::new().set("name", "Al")).unwrap();
        let rows = conn.select("patients", &Filter::Id(id)).unwrap();
        assert_eq!(rows[0].tenant_id, tid("a"));
    }

    #[test]
    fn insert_without_any_tenant_is_not_null_violation() {
        let db = seeded();
        let mut conn = db.connect();
        conn.set_config("app.role", Some("platform_admin"), false);
        assert!(matches!(
            conn.insert("patients", NewRow::new()),
            Err(EngineError::NotNullViolation { .. })
        ));
    }

    #[test]
    fn insert_for_foreign_tenant_is_policy_violation() {
        let db = seeded();
        let mut conn = bound(&db, "b", "tenant_admin");
        assert_eq!(
            conn.insert("patients", NewRow::for_tenant(tid("a"))),
            Err(EngineError::PolicyViolation {
                table: "patients".to_string(),
                command: Command::Insert,
            })
        );
    }

    #[test]
    fn reserved_columns_are_rejected() {
        let db = seeded();
        let mut conn = bound(&db, "a", "member");
        assert_eq!(
            conn.insert("patients", NewRow::new().set("tenant_id", "b")),
            Err(EngineError::ReservedColumn("tenant_id".to_string()))
        );
    }

    #[test]
    fn update_cannot_touch_foreign_rows() {
        let db = seeded();
        let mut conn = bound(&db, "a", "member");
        let affected = conn
            .update("patients", &Filter::eq("name", "Bo"), &Patch::new().set("name", "X"))
            .unwrap();
        assert_eq!(affected, Affected { rows: 0, denied: 1 });
    }

    #[test]
    fn targeted_writes_count_hidden_rows_as_denied() {
        let db = seeded();
        let mut admin = db.connect();
        admin.set_config("app.role", Some("platform_admin"), false);
        let b_row = admin.select("patients", &Filter::eq("name", "Bo")).unwrap()[0].id;

        let mut conn = bound(&db, "a", "member");
        assert_eq!(
            conn.update("patients", &Filter::Id(b_row), &Patch::new().set("name", "X")),
            Ok(Affected { rows: 0, denied: 1 })
        );
        assert_eq!(
            conn.delete("patients", &Filter::Id(b_row)),
            Ok(Affected { rows: 0, denied: 1 })
        );
        let untouched = admin.select("patients", &Filter::Id(b_row)).unwrap();
        assert_eq!(untouched[0].get("name"), Some(serde_json::json!("Bo")));
    }

    #[test]
    fn sweeping_writes_never_count_denials() {
        let db = seeded();
        let mut conn = bound(&db, "a", "member");
        assert_eq!(
            conn.update("patients", &Filter::All, &Patch::new().set("seen", true)),
            Ok(Affected { rows: 1, denied: 0 })
        );
        assert_eq!(
            conn.delete("patients", &Filter::All),
            Ok(Affected { rows: 1, denied: 0 })
        );
    }

    #[test]
    fn update_moving_row_to_other_tenant_is_rejected() {
        let db = seeded();
        let mut conn = bound(&db, "a", "member");
        let err = conn
            .update("patients", &Filter::All, &Patch::new().reassign_tenant(tid("b")))
            .unwrap_err();
        assert!(matches!(err, EngineError::PolicyViolation { command: Command::Update, .. }));
    }

    #[test]
    fn tenant_column_is_immutable_even_for_bypass() {
        let db = seeded();
        let mut conn = db.connect();
        conn.set_config("app.role", Some("platform_admin"), false);
        let err = conn
            .update("patients", &Filter::eq("name", "Ada"), &Patch::new().reassign_tenant(tid("b")))
            .unwrap_err();
        assert!(matches!(err, EngineError::ImmutableColumn { .. }));
    }

    #[test]
    fn delete_is_limited_to_visible_rows() {
        let db = seeded();
        let mut conn = bound(&db, "a", "member");
        assert_eq!(conn.delete("patients", &Filter::All).unwrap().rows, 1);

        let mut admin = db.connect();
        admin.set_config("app.role", Some("platform_admin"), false);
        assert_eq!(admin.select("patients", &Filter::All).unwrap().len(), 1);
    }

    #[test]
    fn local_settings_end_with_transaction() {
        let db = seeded();
        let mut conn = db.connect();
        conn.begin().unwrap();
        conn.set_config("app.role", Some("platform_admin"), true);
        assert_eq!(conn.select("patients", &Filter::All).unwrap().len(), 2);
        conn.commit().unwrap();
        assert!(conn.select("patients", &Filter::All).unwrap().is_empty());
        assert!(conn.is_clean());
    }

    #[test]
    fn local_setting_outside_transaction_is_ignored() {
        let db = seeded();
        let mut conn = db.connect();
        conn.set_config("app.role", Some("platform_admin"), true);
        assert_eq!(conn.current_setting("app.role"), None);
    }

    #[test]
    fn rollback_restores_rows() {
        let db = seeded();
        let mut conn = bound(&db, "a", "member");
        conn.begin().unwrap();
        conn.insert("patients", NewRow::new().set("name", "Temp")).unwrap();
        conn.update("patients", &Filter::eq("name", "Ada"), &Patch::new().set("name", "Ann"))
            .unwrap();
        conn.delete("patients", &Filter::eq("name", "Ann")).unwrap();
        conn.rollback().unwrap();

        let rows = conn.select("patients", &Filter::All).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("name"), Some(serde_json::json!("Ada")));
    }

    #[test]
    fn reset_all_rolls_back_and_clears() {
        let db = seeded();
        let mut conn = bound(&db, "a", "member");
        conn.begin().unwrap();
        conn.insert("patients", NewRow::new()).unwrap();
        conn.reset_all();
        conn.reset_all();
        assert!(conn.is_clean());

        let mut admin = db.connect();
        admin.set_config("app.role", Some("platform_admin"), false);
        assert_eq!(admin.select("patients", &Filter::All).unwrap().len(), 2);
    }

    #[test]
    fn transaction_state_errors() {
        let db = Database::default();
        let mut conn = db.connect();
        assert_eq!(conn.commit(), Err(EngineError::NoTransaction));
        assert_eq!(conn.rollback(), Err(EngineError::NoTransaction));
        conn.begin().unwrap();
        assert_eq!(conn.begin(), Err(EngineError::TransactionInProgress));
    }

    #[test]
    fn admin_writes_policy_blocks_member_inserts() {
        let db = Database::default();
        db.create_table(TableSchema::new("price_lists").with_policy(PolicySet::admin_writes()))
            .unwrap();
        let mut member = bound(&db, "a", "member");
        assert!(matches!(
            member.insert("price_lists", NewRow::new()),
            Err(EngineError::PolicyViolation { .. })
        ));
        let mut admin = bound(&db, "a", "tenant_admin");
        assert!(admin.insert("price_lists", NewRow::new()).is_ok());
        assert_eq!(member.select("price_lists", &Filter::All).unwrap().len(), 1);
    }

    #[test]
    fn unknown_table_is_reported() {
        let db = Database::default();
        let conn = db.connect();
        assert_eq!(
            conn.select("nope", &Filter::All),
            Err(EngineError::UnknownTable("nope".to_string()))
        );
    }
}
