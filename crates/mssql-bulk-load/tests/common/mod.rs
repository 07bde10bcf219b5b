//! In-memory `BulkConnection` used by the integration tests.
//!
//! Records every call, tracks the session's temp tables, and simulates the
//! store's side of the staged load: `MERGE` inserts the staged rows into the
//! target and writes `(correlation key, generated id)` pairs to the output
//! table.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use mssql_bulk_load::{
    BulkConnection, BulkError, BulkRecord, ColumnDefinition, Field, IdentityField, Result,
    SqlValue, TableSchema,
};
use mssql_bulk_load::CancellationToken;

/// Route engine logs to the test harness; `RUST_LOG=debug` shows every statement.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// First identity value handed out by the mock.
pub const FIRST_IDENTITY: i32 = 1000;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Open,
    Execute(String),
    TableSchema,
    BulkInsert { table: String, rows: usize },
    InsertRows { table: String, rows: usize },
    Query(String),
}

/// Where the mock fails.
#[derive(Debug, Clone)]
pub enum Fault {
    /// Any statement containing the pattern.
    Execute(&'static str),
    /// Only the statement equal to this text.
    Statement(String),
    /// Bulk insert into the named table.
    BulkInsertInto(&'static str),
    /// Row INSERT into the named table, e.g. a constraint violation.
    InsertRowsInto(&'static str),
    /// Reading generated keys.
    Query,
}

pub struct MockConnection {
    pub open: bool,
    pub events: Vec<Event>,
    pub schema: TableSchema,
    pub target_rows: Vec<Vec<SqlValue<'static>>>,
    pub temp_tables: BTreeSet<String>,
    pub fault: Option<Fault>,
    /// Cancelled as soon as rows land in the staging table.
    pub cancel_after_staging: Option<CancellationToken>,
    /// Number of output rows the MERGE "forgets" to write.
    pub lose_output_rows: usize,
    /// Latency of every row transfer (bulk or INSERT).
    pub insert_delay: Option<Duration>,
    staged: Vec<Vec<SqlValue<'static>>>,
    output: Vec<(i64, SqlValue<'static>)>,
    next_identity: i32,
}

impl MockConnection {
    pub fn new(schema: TableSchema) -> Self {
        Self {
            open: false,
            events: Vec::new(),
            schema,
            target_rows: Vec::new(),
            temp_tables: BTreeSet::new(),
            fault: None,
            cancel_after_staging: None,
            lose_output_rows: 0,
            insert_delay: None,
            staged: Vec::new(),
            output: Vec::new(),
            next_identity: FIRST_IDENTITY,
        }
    }

    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.fault = Some(fault);
        self
    }

    pub fn opened(mut self) -> Self {
        self.open = true;
        self
    }

    /// Executed statements, in order.
    pub fn statements(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Execute(sql) => Some(sql.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Number of executed statements containing `pattern`.
    pub fn executed(&self, pattern: &str) -> usize {
        self.statements().iter().filter(|s| s.contains(pattern)).count()
    }

    /// Position of the first event matching `pred`.
    pub fn position(&self, pred: impl Fn(&Event) -> bool) -> Option<usize> {
        self.events.iter().position(pred)
    }

    /// Position of the last event matching `pred`.
    pub fn last_position(&self, pred: impl Fn(&Event) -> bool) -> Option<usize> {
        self.events.iter().rposition(pred)
    }

    fn simulated_fault(what: &str) -> BulkError {
        BulkError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            format!("simulated fault during {}", what),
        ))
    }

    fn merge(&mut self) -> Result<()> {
        if !self.temp_tables.contains("#BulkStaging") || !self.temp_tables.contains("#BulkOutput") {
            return Err(Self::simulated_fault("merge without staging tables"));
        }
        let staged = std::mem::take(&mut self.staged);
        let keep = staged.len().saturating_sub(self.lose_output_rows);
        for (i, mut row) in staged.into_iter().enumerate() {
            let key = row
                .pop()
                .and_then(|v| v.as_i64())
                .ok_or_else(|| Self::simulated_fault("merge of a row without correlation key"))?;
            let id = self.next_identity;
            self.next_identity += 1;
            self.target_rows.push(row);
            if i < keep {
                self.output.push((key, SqlValue::I32(id)));
            }
        }
        Ok(())
    }

    async fn store_rows(&mut self, table: &str, rows: Vec<Vec<SqlValue<'static>>>) -> Result<u64> {
        if let Some(delay) = self.insert_delay {
            tokio::time::sleep(delay).await;
        }
        let count = rows.len() as u64;
        if table.starts_with('#') {
            if !self.temp_tables.contains(table) {
                return Err(Self::simulated_fault("insert into a missing temp table"));
            }
            self.staged.extend(rows);
            if let Some(token) = &self.cancel_after_staging {
                token.cancel();
            }
        } else {
            self.target_rows.extend(rows);
        }
        Ok(count)
    }
}

#[async_trait]
impl BulkConnection for MockConnection {
    fn is_open(&self) -> bool {
        self.open
    }

    async fn open(&mut self) -> Result<()> {
        self.events.push(Event::Open);
        self.open = true;
        Ok(())
    }

    async fn execute(&mut self, sql: &str) -> Result<()> {
        self.events.push(Event::Execute(sql.to_string()));
        match &self.fault {
            Some(Fault::Execute(pattern)) if sql.contains(pattern) => {
                return Err(Self::simulated_fault(pattern));
            }
            Some(Fault::Statement(statement)) if sql == statement => {
                return Err(Self::simulated_fault("statement"));
            }
            _ => {}
        }

        for table in ["#BulkStaging", "#BulkOutput"] {
            if sql.contains(&format!("DROP TABLE {}", table)) {
                self.temp_tables.remove(table);
                if table == "#BulkStaging" {
                    self.staged.clear();
                } else {
                    self.output.clear();
                }
            }
            if sql.contains(&format!("CREATE TABLE {}", table)) {
                self.temp_tables.insert(table.to_string());
            }
        }

        if sql.starts_with("MERGE INTO") {
            self.merge()?;
        }
        Ok(())
    }

    async fn table_schema(&mut self, _schema: &str, _table: &str) -> Result<TableSchema> {
        self.events.push(Event::TableSchema);
        Ok(self.schema.clone())
    }

    async fn bulk_insert(
        &mut self,
        table: &str,
        _columns: &[ColumnDefinition],
        rows: Vec<Vec<SqlValue<'static>>>,
    ) -> Result<u64> {
        self.events.push(Event::BulkInsert {
            table: table.to_string(),
            rows: rows.len(),
        });
        if let Some(Fault::BulkInsertInto(target)) = &self.fault {
            if table == *target {
                return Err(Self::simulated_fault("bulk insert"));
            }
        }
        self.store_rows(table, rows).await
    }

    async fn insert_rows(
        &mut self,
        table: &str,
        _columns: &[ColumnDefinition],
        rows: Vec<Vec<SqlValue<'static>>>,
    ) -> Result<u64> {
        self.events.push(Event::InsertRows {
            table: table.to_string(),
            rows: rows.len(),
        });
        if let Some(Fault::InsertRowsInto(target)) = &self.fault {
            if table == *target {
                return Err(Self::simulated_fault("insert"));
            }
        }
        self.store_rows(table, rows).await
    }

    async fn query_generated_keys(
        &mut self,
        sql: &str,
        _value_type: &str,
    ) -> Result<Vec<(i64, SqlValue<'static>)>> {
        self.events.push(Event::Query(sql.to_string()));
        if matches!(self.fault, Some(Fault::Query)) || !self.temp_tables.contains("#BulkOutput") {
            return Err(Self::simulated_fault("read back"));
        }
        let mut rows = self.output.clone();
        rows.sort_by_key(|(key, _)| *key);
        Ok(rows)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Customer {
    pub id: i32,
    pub first_name: String,
    pub email: Option<String>,
}

impl Customer {
    pub fn new(first_name: &str, email: Option<&str>) -> Self {
        Self {
            id: 0,
            first_name: first_name.to_string(),
            email: email.map(str::to_string),
        }
    }
}

impl BulkRecord for Customer {
    fn fields() -> Vec<Field<Self>> {
        vec![
            Field::new("Id", |c: &Customer| c.id.into()),
            Field::new("FirstName", |c: &Customer| c.first_name.clone().into()),
            Field::new("Email", |c: &Customer| c.email.clone().into()),
        ]
    }
}

pub fn customer_id() -> IdentityField<Customer> {
    IdentityField::new(
        "Id",
        |c: &Customer| c.id.into(),
        |c: &mut Customer, v: SqlValue<'static>| match v.as_i64() {
            Some(id) => {
                c.id = id as i32;
                Ok(())
            }
            None => Err(BulkError::Config(format!("identity is not an integer: {:?}", v))),
        },
    )
}

pub fn customers_table() -> TableSchema {
    TableSchema::new(
        "dbo",
        "Customers",
        vec![
            ColumnDefinition::new("Id", "int").identity(),
            ColumnDefinition::new("FirstName", "nvarchar").with_length(200).not_null(),
            ColumnDefinition::new("Email", "nvarchar").with_length(400),
        ],
    )
}

/// `customers_table()` without the `Email` column.
pub fn customers_table_without_email() -> TableSchema {
    TableSchema::new(
        "dbo",
        "Customers",
        vec![
            ColumnDefinition::new("Id", "int").identity(),
            ColumnDefinition::new("FirstName", "nvarchar").with_length(200).not_null(),
        ],
    )
}

pub fn customers(n: usize) -> Vec<Customer> {
    (0..n)
        .map(|i| Customer::new(&format!("customer-{}", i), (i % 2 == 0).then_some("c@example.com")))
        .collect()
}
