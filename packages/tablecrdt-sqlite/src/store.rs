use rusqlite::{types::Value as SqlValue, Connection};
use serde_json::Value;
use tablecrdt_core::{DerivedStore, Error, FieldType, Result, RowData, TableSchema};

/// SQLite-backed [`DerivedStore`].
///
/// One SQL table per mirrored logical table, with columns derived from the
/// table's schema (`id TEXT PRIMARY KEY` plus one typed column per declared
/// field). The engine drives `begin`/`clear_all`/`insert_many`/`commit`, so a
/// reader only ever sees a fully-committed snapshot.
pub struct SqliteIndex {
    conn: Connection,
    tables: Vec<(String, TableSchema)>,
}

impl SqliteIndex {
    pub fn new_in_memory(tables: Vec<(String, TableSchema)>) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::Store(e.to_string()))?;
        Self::with_connection(conn, tables)
    }

    pub fn new(path: &str, tables: Vec<(String, TableSchema)>) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| Error::Store(e.to_string()))?;
        Self::with_connection(conn, tables)
    }

    fn with_connection(conn: Connection, tables: Vec<(String, TableSchema)>) -> Result<Self> {
        let index = Self { conn, tables };
        index.ensure_schema()?;
        Ok(index)
    }

    fn ensure_schema(&self) -> Result<()> {
        for (name, schema) in &self.tables {
            let mut columns = vec!["\"id\" TEXT PRIMARY KEY".to_string()];
            for (field, spec) in schema.fields() {
                columns.push(format!("{} {}", quote_ident(field), sql_type(spec.field_type)));
            }
            let ddl = format!(
                "CREATE TABLE IF NOT EXISTS {} ({})",
                quote_ident(name),
                columns.join(", ")
            );
            self.conn
                .execute_batch(&ddl)
                .map_err(|e| Error::Store(e.to_string()))?;
        }
        Ok(())
    }

    fn schema_for(&self, table: &str) -> Result<&TableSchema> {
        self.tables
            .iter()
            .find(|(name, _)| name == table)
            .map(|(_, schema)| schema)
            .ok_or_else(|| Error::Store(format!("unknown mirrored table `{table}`")))
    }

    /// Read every mirrored row of `table` back as JSON, in id order. This is
    /// the read side of the index; anything richer is plain SQL on the
    /// underlying file.
    pub fn rows(&self, table: &str) -> Result<Vec<RowData>> {
        let schema = self.schema_for(table)?.clone();
        let fields: Vec<(String, FieldType)> = schema
            .fields()
            .map(|(name, spec)| (name.to_string(), spec.field_type))
            .collect();

        let column_list: Vec<String> = std::iter::once("\"id\"".to_string())
            .chain(fields.iter().map(|(name, _)| quote_ident(name)))
            .collect();
        let sql = format!(
            "SELECT {} FROM {} ORDER BY \"id\" ASC",
            column_list.join(", "),
            quote_ident(table)
        );

        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|e| Error::Store(e.to_string()))?;
        let mapped = stmt
            .query_map([], |row| {
                let mut data = RowData::new();
                let id: String = row.get(0)?;
                data.insert("id".to_string(), Value::String(id));
                for (i, (name, field_type)) in fields.iter().enumerate() {
                    let value: SqlValue = row.get(i + 1)?;
                    if let Some(json) = sql_to_json(*field_type, value) {
                        data.insert(name.clone(), json);
                    }
                }
                Ok(data)
            })
            .map_err(|e| Error::Store(e.to_string()))?;

        let mut rows = Vec::new();
        for row in mapped {
            rows.push(row.map_err(|e| Error::Store(e.to_string()))?);
        }
        Ok(rows)
    }

    pub fn count(&self, table: &str) -> Result<u64> {
        self.schema_for(table)?;
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
        self.conn
            .query_row(&sql, [], |row| row.get::<_, i64>(0))
            .map(|n| n.max(0) as u64)
            .map_err(|e| Error::Store(e.to_string()))
    }
}

impl DerivedStore for SqliteIndex {
    fn begin(&mut self) -> Result<()> {
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| Error::Store(e.to_string()))
    }

    fn clear_all(&mut self) -> Result<()> {
        for (name, _) in &self.tables {
            let sql = format!("DELETE FROM {}", quote_ident(name));
            self.conn
                .execute(&sql, [])
                .map_err(|e| Error::Store(e.to_string()))?;
        }
        Ok(())
    }

    fn insert_many(&mut self, table: &str, rows: &[RowData]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let schema = self.schema_for(table)?.clone();
        let fields: Vec<(String, FieldType)> = schema
            .fields()
            .map(|(name, spec)| (name.to_string(), spec.field_type))
            .collect();

        let columns: Vec<String> = std::iter::once("\"id\"".to_string())
            .chain(fields.iter().map(|(name, _)| quote_ident(name)))
            .collect();
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(table),
            columns.join(", "),
            placeholders.join(", ")
        );

        let mut stmt = self
            .conn
            .prepare_cached(&sql)
            .map_err(|e| Error::Store(e.to_string()))?;
        for row in rows {
            let id = match row.get("id") {
                Some(Value::String(id)) => id.clone(),
                _ => return Err(Error::Store("mirrored row is missing its `id`".into())),
            };
            let mut params: Vec<SqlValue> = vec![SqlValue::Text(id)];
            for (name, field_type) in &fields {
                params.push(json_to_sql(*field_type, row.get(name))?);
            }
            stmt.execute(rusqlite::params_from_iter(params))
                .map_err(|e| Error::Store(e.to_string()))?;
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.conn
            .execute_batch("COMMIT")
            .map_err(|e| Error::Store(e.to_string()))
    }

    fn rollback(&mut self) -> Result<()> {
        self.conn
            .execute_batch("ROLLBACK")
            .map_err(|e| Error::Store(e.to_string()))
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn sql_type(field_type: FieldType) -> &'static str {
    match field_type {
        FieldType::Text | FieldType::Json => "TEXT",
        FieldType::Integer | FieldType::Bool => "INTEGER",
        FieldType::Real => "REAL",
    }
}

fn json_to_sql(field_type: FieldType, value: Option<&Value>) -> Result<SqlValue> {
    let Some(value) = value else {
        return Ok(SqlValue::Null);
    };
    let converted = match (field_type, value) {
        (FieldType::Text, Value::String(s)) => Some(SqlValue::Text(s.clone())),
        (FieldType::Integer, v) => v.as_i64().map(SqlValue::Integer),
        (FieldType::Real, v) => v.as_f64().map(SqlValue::Real),
        (FieldType::Bool, Value::Bool(b)) => Some(SqlValue::Integer(i64::from(*b))),
        (FieldType::Json, v) => Some(SqlValue::Text(
            serde_json::to_string(v).map_err(|e| Error::Store(e.to_string()))?,
        )),
        _ => None,
    };
    converted.ok_or_else(|| {
        Error::Store(format!(
            "cell value {value} does not fit its declared column type"
        ))
    })
}

fn sql_to_json(field_type: FieldType, value: SqlValue) -> Option<Value> {
    match (field_type, value) {
        (_, SqlValue::Null) => None,
        (FieldType::Text, SqlValue::Text(s)) => Some(Value::String(s)),
        (FieldType::Integer, SqlValue::Integer(n)) => Some(Value::from(n)),
        (FieldType::Real, SqlValue::Real(f)) => Some(Value::from(f)),
        (FieldType::Real, SqlValue::Integer(n)) => Some(Value::from(n)),
        (FieldType::Bool, SqlValue::Integer(n)) => Some(Value::Bool(n != 0)),
        (FieldType::Json, SqlValue::Text(s)) => serde_json::from_str(&s).ok(),
        _ => None,
    }
}
