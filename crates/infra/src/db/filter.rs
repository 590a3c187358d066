//! Tenant filter applied to every statement built for a registered table.
//!
//! Given an [`OperationContext`], a [`Statement`] on a tenant-scoped table gets a
//! conjunctive `tenant_id = $n` predicate unless the context explicitly opted out
//! or carries no tenant. [`Insert`] fills in `tenant_id` from the context when the
//! caller did not provide one and never overrides one that was provided.

use std::collections::HashSet;

use sqlx::{Encode, Postgres, QueryBuilder, Type};
use tracing::{debug, warn};
use atlas_core::{OperationContext, TenantId};

/// Tables whose rows belong to a tenant.
#[derive(Debug, Clone, Default)]
pub struct TenantTables {
    tables: HashSet<&'static str>,
}

impl TenantTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, table: &'static str) -> Self {
        self.tables.insert(table);
        self
    }

    pub fn contains(&self, table: &str) -> bool {
        self.tables.contains(table)
    }
}

/// What the filter did to a statement.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    Applied(TenantId),
    SkippedByContext,
    GlobalTable,
    NoTenant,
}

impl FilterDecision {
    fn tenant(self) -> Option<TenantId> {
        match self {
            FilterDecision::Applied(id) => Some(id),
            _ => None,
        }
    }
}

/// Binds an [`OperationContext`] to the registered tenant tables.
#[derive(Debug, Clone, Copy)]
pub struct TenantFilter<'c> {
    ctx: &'c OperationContext,
    tables: &'c TenantTables,
}

impl<'c> TenantFilter<'c> {
    pub fn new(ctx: &'c OperationContext, tables: &'c TenantTables) -> Self {
        Self { ctx, tables }
    }

    pub fn decide(&self, table: &str) -> FilterDecision {
        if self.ctx.skips_tenant_filter() {
            return FilterDecision::SkippedByContext;
        }
        if !self.tables.contains(table) {
            return FilterDecision::GlobalTable;
        }
        match self.ctx.tenant() {
            Some(tenant) => FilterDecision::Applied(tenant.id()),
            None => {
                debug!(table, "no tenant in context, statement is not tenant filtered");
                FilterDecision::NoTenant
            }
        }
    }

    pub fn select<'a>(&self, table: &str, columns: &str) -> Statement<'a> {
        Statement::open(format!("SELECT {columns} FROM {table}"), self.decide(table), false)
    }

    pub fn update<'a>(&self, table: &str) -> Statement<'a> {
        Statement::open(format!("UPDATE {table} SET "), self.decide(table), true)
    }

    pub fn delete<'a>(&self, table: &str) -> Statement<'a> {
        Statement::open(format!("DELETE FROM {table}"), self.decide(table), false)
    }

    /// `columns` are the caller-supplied columns, bound in order with [`Insert::value`].
    pub fn insert<'a>(&self, table: &str, columns: &[&str]) -> Insert<'a> {
        Insert::open(table, columns, self)
    }
}

/// SELECT / UPDATE / DELETE under construction.
pub struct Statement<'a> {
    sql: QueryBuilder<'a, Postgres>,
    decision: FilterDecision,
    in_set: bool,
    sets: usize,
    has_where: bool,
}

impl<'a> Statement<'a> {
    fn open(head: String, decision: FilterDecision, in_set: bool) -> Self {
        let mut stmt = Self {
            sql: QueryBuilder::new(head),
            decision,
            in_set,
            sets: 0,
            has_where: false,
        };
        if !in_set {
            stmt.apply_filter();
        }
        stmt
    }

    fn apply_filter(&mut self) {
        if let Some(tenant) = self.decision.tenant() {
            self.sql.push(" WHERE tenant_id = ");
            self.sql.push_bind(*tenant.as_uuid());
            self.has_where = true;
        }
    }

    fn close_set(&mut self) {
        if self.in_set {
            self.in_set = false;
            self.apply_filter();
        }
    }

    pub fn decision(&self) -> FilterDecision {
        self.decision
    }

    /// `column = value` in an UPDATE's SET list. Must precede any predicate.
    pub fn set<T>(mut self, column: &str, value: T) -> Self
    where
        T: 'a + Encode<'a, Postgres> + Type<Postgres> + Send,
    {
        debug_assert!(self.in_set, "set() after the WHERE clause");
        if self.sets > 0 {
            self.sql.push(", ");
        }
        self.sql.push(column);
        self.sql.push(" = ");
        self.sql.push_bind(value);
        self.sets += 1;
        self
    }

    /// Unbound assignment in an UPDATE's SET list (`version = version + 1`).
    pub fn set_expr(mut self, assignment: &str) -> Self {
        debug_assert!(self.in_set, "set_expr() after the WHERE clause");
        if self.sets > 0 {
            self.sql.push(", ");
        }
        self.sql.push(assignment);
        self.sets += 1;
        self
    }

    /// Append `column <op> value` as a conjunctive predicate.
    pub fn and_where<T>(mut self, column: &str, op: &str, value: T) -> Self
    where
        T: 'a + Encode<'a, Postgres> + Type<Postgres> + Send,
    {
        self.close_set();
        self.sql.push(if self.has_where { " AND " } else { " WHERE " });
        self.sql.push(column);
        self.sql.push(format_args!(" {op} "));
        self.sql.push_bind(value);
        self.has_where = true;
        self
    }

    /// `(column IS NULL OR column <op> value)`.
    pub fn and_where_null_or<T>(mut self, column: &str, op: &str, value: T) -> Self
    where
        T: 'a + Encode<'a, Postgres> + Type<Postgres> + Send,
    {
        self.close_set();
        self.sql.push(if self.has_where { " AND " } else { " WHERE " });
        self.sql.push(format_args!("({column} IS NULL OR {column} {op} "));
        self.sql.push_bind(value);
        self.sql.push(")");
        self.has_where = true;
        self
    }

    /// Append a predicate with no bound values (`logout_time IS NULL`).
    pub fn and_where_raw(mut self, predicate: &str) -> Self {
        self.close_set();
        self.sql.push(if self.has_where { " AND " } else { " WHERE " });
        self.sql.push(predicate);
        self.has_where = true;
        self
    }

    /// Trailing clauses such as `ORDER BY` or `RETURNING`.
    pub fn suffix(mut self, clause: &str) -> Self {
        self.close_set();
        self.sql.push(" ");
        self.sql.push(clause);
        self
    }

    pub fn limit(mut self, n: i64) -> Self {
        self.close_set();
        self.sql.push(" LIMIT ");
        self.sql.push_bind(n);
        self
    }

    pub fn sql(&self) -> &str {
        self.sql.sql()
    }

    pub fn finish(mut self) -> QueryBuilder<'a, Postgres> {
        self.close_set();
        self.sql
    }
}

/// INSERT under construction.
pub struct Insert<'a> {
    sql: QueryBuilder<'a, Postgres>,
    remaining: usize,
    bound: usize,
}

impl<'a> Insert<'a> {
    fn open(table: &str, columns: &[&str], filter: &TenantFilter<'_>) -> Self {
        let supplied = columns.contains(&"tenant_id");
        let inject = match filter.decide(table) {
            FilterDecision::Applied(tenant) if !supplied => {
                warn!(table, tenant_id = %tenant, "insert without tenant_id, using the context tenant");
                Some(tenant)
            }
            _ => None,
        };

        let mut sql = QueryBuilder::new(format!("INSERT INTO {table} ("));
        if inject.is_some() {
            sql.push("tenant_id");
            if !columns.is_empty() {
                sql.push(", ");
            }
        }
        sql.push(columns.join(", "));
        sql.push(") VALUES (");
        let mut bound = 0;
        if let Some(tenant) = inject {
            sql.push_bind(*tenant.as_uuid());
            bound = 1;
        }
        Self {
            sql,
            remaining: columns.len(),
            bound,
        }
    }

    /// Bind the next column's value.
    pub fn value<T>(mut self, value: T) -> Self
    where
        T: 'a + Encode<'a, Postgres> + Type<Postgres> + Send,
    {
        debug_assert!(self.remaining > 0, "more values than columns");
        if self.bound > 0 {
            self.sql.push(", ");
        }
        self.sql.push_bind(value);
        self.bound += 1;
        self.remaining = self.remaining.saturating_sub(1);
        self
    }

    pub fn sql(&self) -> &str {
        self.sql.sql()
    }

    /// Close the VALUES list; `suffix` is appended verbatim (`RETURNING id`, `ON CONFLICT ...`).
    pub fn finish(mut self, suffix: Option<&str>) -> QueryBuilder<'a, Postgres> {
        self.sql.push(")");
        if let Some(suffix) = suffix {
            self.sql.push(" ");
            self.sql.push(suffix);
        }
        self.sql
    }
}
