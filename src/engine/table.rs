use std::collections::BTreeMap;

use super::{Row, RowId, TableSchema};

/// Rows of one table plus the schema (and so the policies) bound to it.
#[derive(Debug)]
pub(crate) struct Table {
    schema: TableSchema,
    rows: BTreeMap<RowId, Row>,
    next_id: RowId,
}

impl Table {
    pub(crate) fn new(schema: TableSchema) -> Self {
        Self {
            schema,
            rows: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub(crate) fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub(crate) fn rows(&self) -> impl Iterator<Item = &Row> {
        self.rows.values()
    }

    pub(crate) fn allocate_id(&mut self) -> RowId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub(crate) fn put(&mut self, row: Row) -> Option<Row> {
        self.rows.insert(row.id, row)
    }

    pub(crate) fn remove(&mut self, id: RowId) -> Option<Row> {
        self.rows.remove(&id)
    }
}
