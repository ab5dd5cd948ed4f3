use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::models::{
    CardioSession, DailyLogRecord, MealLog, ProtocolPhase, ProtocolRoutine, StrengthSet,
    Timestamp, UserProfile, format_date, format_timestamp,
};

/// The tables exposed by the remote tabular API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteTable {
    Profile,
    DailyLogs,
    MealLogs,
    StrengthLogs,
    CardioLogs,
    ProtocolPhases,
    ProtocolRoutines,
}

impl RemoteTable {
    pub const ALL: [RemoteTable; 7] = [
        RemoteTable::Profile,
        RemoteTable::DailyLogs,
        RemoteTable::MealLogs,
        RemoteTable::StrengthLogs,
        RemoteTable::CardioLogs,
        RemoteTable::ProtocolPhases,
        RemoteTable::ProtocolRoutines,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Profile => "profile",
            Self::DailyLogs => "daily_logs",
            Self::MealLogs => "meal_logs",
            Self::StrengthLogs => "strength_logs",
            Self::CardioLogs => "cardio_logs",
            Self::ProtocolPhases => "protocol_phases",
            Self::ProtocolRoutines => "protocol_routines",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.name() == name)
    }

    /// Column holding the per-user natural key of a row.
    pub fn key_column(self) -> &'static str {
        match self {
            Self::DailyLogs => "date",
            _ => "id",
        }
    }

    /// Column identifying the owning user. Profiles are owned by themselves.
    pub fn user_column(self) -> &'static str {
        match self {
            Self::Profile => "id",
            _ => "user_id",
        }
    }

    /// Columns forming the upsert conflict target.
    pub fn conflict_columns(self) -> &'static [&'static str] {
        match self {
            Self::Profile => &["id"],
            Self::DailyLogs => &["user_id", "date"],
            _ => &["id"],
        }
    }
}

impl fmt::Display for RemoteTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("remote unreachable: {0}")]
    Unreachable(String),
    #[error("remote refused credentials")]
    Unauthorized,
    #[error("remote rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("row already exists")]
    Conflict,
    #[error("could not decode remote response: {0}")]
    Decode(String),
}

impl RemoteError {
    /// True when the failure means "no network", as opposed to the remote
    /// answering with an error.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

// --- Row filters ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Gte,
    Lte,
}

impl FilterOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Gte => "gte",
            Self::Lte => "lte",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "eq" => Some(Self::Eq),
            "gte" => Some(Self::Gte),
            "lte" => Some(Self::Lte),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub descending: bool,
}

/// A conjunction of column filters plus an optional ordering, in the shape of
/// a `?col=op.value&order=col.asc` query string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowQuery {
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
    pub limit: Option<usize>,
}

impl RowQuery {
    pub fn new() -> Self {
        Self::default()
    }

    fn filter(mut self, column: &str, op: FilterOp, value: impl Into<String>) -> Self {
        self.filters.push(Filter {
            column: column.to_string(),
            op,
            value: value.into(),
        });
        self
    }

    #[must_use]
    pub fn eq(self, column: &str, value: impl Into<String>) -> Self {
        self.filter(column, FilterOp::Eq, value)
    }

    #[must_use]
    pub fn gte(self, column: &str, value: impl Into<String>) -> Self {
        self.filter(column, FilterOp::Gte, value)
    }

    #[must_use]
    pub fn lte(self, column: &str, value: impl Into<String>) -> Self {
        self.filter(column, FilterOp::Lte, value)
    }

    #[must_use]
    pub fn order_by(mut self, column: &str, descending: bool) -> Self {
        self.order = Some(Order {
            column: column.to_string(),
            descending,
        });
        self
    }

    #[must_use]
    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn to_query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = self
            .filters
            .iter()
            .map(|f| (f.column.clone(), format!("{}.{}", f.op.as_str(), f.value)))
            .collect();
        if let Some(order) = &self.order {
            let dir = if order.descending { "desc" } else { "asc" };
            pairs.push(("order".to_string(), format!("{}.{dir}", order.column)));
        }
        if let Some(limit) = self.limit {
            pairs.push(("limit".to_string(), limit.to_string()));
        }
        pairs
    }

    /// Parse query-string pairs back into a query. Unknown operators are an error.
    pub fn from_query_pairs<I, K, V>(pairs: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut query = RowQuery::new();
        for (key, value) in pairs {
            let (key, value) = (key.as_ref(), value.as_ref());
            match key {
                "order" => {
                    let (column, dir) = value.rsplit_once('.').unwrap_or((value, "asc"));
                    let descending = match dir {
                        "asc" => false,
                        "desc" => true,
                        other => return Err(format!("Invalid order direction '{other}'")),
                    };
                    query = query.order_by(column, descending);
                }
                "limit" => {
                    let n = value
                        .parse::<usize>()
                        .map_err(|_| format!("Invalid limit '{value}'"))?;
                    query = query.limit(n);
                }
                "select" | "on_conflict" | "columns" => {}
                column => {
                    let (op, operand) = value
                        .split_once('.')
                        .ok_or_else(|| format!("Invalid filter '{column}={value}'"))?;
                    let op = FilterOp::from_name(op)
                        .ok_or_else(|| format!("Unsupported operator '{op}'"))?;
                    query = query.filter(column, op, operand);
                }
            }
        }
        Ok(query)
    }
}

// --- Transport contract ---

/// Untyped access to the remote tabular API. Implementations carry no
/// business logic.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn ping(&self) -> Result<(), RemoteError>;

    async fn select(&self, table: RemoteTable, query: &RowQuery)
    -> Result<Vec<Value>, RemoteError>;

    /// Insert a new row. Fails with `Conflict` if the key is taken.
    async fn insert(&self, table: RemoteTable, row: Value) -> Result<Value, RemoteError>;

    /// Insert or merge rows on the table's conflict columns.
    async fn upsert(&self, table: RemoteTable, rows: Vec<Value>) -> Result<(), RemoteError>;

    async fn update(
        &self,
        table: RemoteTable,
        query: &RowQuery,
        patch: Value,
    ) -> Result<Vec<Value>, RemoteError>;

    async fn delete(&self, table: RemoteTable, query: &RowQuery)
    -> Result<Vec<Value>, RemoteError>;
}

/// Stand-in used when no remote is configured: every call reports no network.
pub struct Disconnected;

#[async_trait]
impl RemoteStore for Disconnected {
    async fn ping(&self) -> Result<(), RemoteError> {
        Err(Self::unreachable())
    }

    async fn select(&self, _: RemoteTable, _: &RowQuery) -> Result<Vec<Value>, RemoteError> {
        Err(Self::unreachable())
    }

    async fn insert(&self, _: RemoteTable, _: Value) -> Result<Value, RemoteError> {
        Err(Self::unreachable())
    }

    async fn upsert(&self, _: RemoteTable, _: Vec<Value>) -> Result<(), RemoteError> {
        Err(Self::unreachable())
    }

    async fn update(
        &self,
        _: RemoteTable,
        _: &RowQuery,
        _: Value,
    ) -> Result<Vec<Value>, RemoteError> {
        Err(Self::unreachable())
    }

    async fn delete(&self, _: RemoteTable, _: &RowQuery) -> Result<Vec<Value>, RemoteError> {
        Err(Self::unreachable())
    }
}

impl Disconnected {
    fn unreachable() -> RemoteError {
        RemoteError::Unreachable("no remote configured".to_string())
    }
}

// --- Typed records ---

/// A record type stored in one remote table.
pub trait RemoteRecord: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const TABLE: RemoteTable;

    /// Natural key, unique per user.
    fn key(&self) -> String;
    fn user_id(&self) -> &str;
    fn updated_at(&self) -> Timestamp;
}

impl RemoteRecord for UserProfile {
    const TABLE: RemoteTable = RemoteTable::Profile;

    fn key(&self) -> String {
        self.id.clone()
    }
    fn user_id(&self) -> &str {
        &self.id
    }
    fn updated_at(&self) -> Timestamp {
        self.updated_at
    }
}

impl RemoteRecord for DailyLogRecord {
    const TABLE: RemoteTable = RemoteTable::DailyLogs;

    fn key(&self) -> String {
        format_date(self.date)
    }
    fn user_id(&self) -> &str {
        &self.user_id
    }
    fn updated_at(&self) -> Timestamp {
        self.updated_at
    }
}

impl RemoteRecord for MealLog {
    const TABLE: RemoteTable = RemoteTable::MealLogs;

    fn key(&self) -> String {
        self.meal.id.clone()
    }
    fn user_id(&self) -> &str {
        &self.user_id
    }
    fn updated_at(&self) -> Timestamp {
        self.meal.updated_at
    }
}

macro_rules! id_keyed_record {
    ($ty:ty, $table:expr) => {
        impl RemoteRecord for $ty {
            const TABLE: RemoteTable = $table;

            fn key(&self) -> String {
                self.id.clone()
            }
            fn user_id(&self) -> &str {
                &self.user_id
            }
            fn updated_at(&self) -> Timestamp {
                self.updated_at
            }
        }
    };
}

id_keyed_record!(StrengthSet, RemoteTable::StrengthLogs);
id_keyed_record!(CardioSession, RemoteTable::CardioLogs);
id_keyed_record!(ProtocolPhase, RemoteTable::ProtocolPhases);
id_keyed_record!(ProtocolRoutine, RemoteTable::ProtocolRoutines);

/// Typed per-table client over a shared transport.
#[derive(Clone)]
pub struct RemoteClient {
    store: Arc<dyn RemoteStore>,
}

impl RemoteClient {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self { store }
    }

    pub fn disconnected() -> Self {
        Self::new(Arc::new(Disconnected))
    }

    pub fn table<T: RemoteRecord>(&self) -> Table<'_, T> {
        Table {
            store: self.store.as_ref(),
            _record: PhantomData,
        }
    }

    pub async fn ping(&self) -> Result<(), RemoteError> {
        self.store.ping().await
    }
}

pub struct Table<'a, T> {
    store: &'a dyn RemoteStore,
    _record: PhantomData<T>,
}

impl<T: RemoteRecord> Table<'_, T> {
    fn decode(rows: Vec<Value>) -> Result<Vec<T>, RemoteError> {
        rows.into_iter()
            .map(|row| serde_json::from_value(row).map_err(|e| RemoteError::Decode(e.to_string())))
            .collect()
    }

    fn encode(record: &T) -> Result<Value, RemoteError> {
        serde_json::to_value(record).map_err(|e| RemoteError::Decode(e.to_string()))
    }

    fn owned(user_id: &str) -> RowQuery {
        RowQuery::new().eq(T::TABLE.user_column(), user_id)
    }

    fn keyed(user_id: &str, key: &str) -> RowQuery {
        let query = Self::owned(user_id);
        if T::TABLE.key_column() == T::TABLE.user_column() {
            query
        } else {
            query.eq(T::TABLE.key_column(), key)
        }
    }

    pub async fn select(&self, query: &RowQuery) -> Result<Vec<T>, RemoteError> {
        Self::decode(self.store.select(T::TABLE, query).await?)
    }

    pub async fn get(&self, user_id: &str, key: &str) -> Result<Option<T>, RemoteError> {
        let rows = self.select(&Self::keyed(user_id, key).limit(1)).await?;
        Ok(rows.into_iter().next())
    }

    pub async fn get_all(&self, user_id: &str) -> Result<Vec<T>, RemoteError> {
        self.select(&Self::owned(user_id).order_by(T::TABLE.key_column(), false))
            .await
    }

    /// Rows changed at or after `since`.
    pub async fn get_since(&self, user_id: &str, since: &Timestamp) -> Result<Vec<T>, RemoteError> {
        self.select(
            &Self::owned(user_id)
                .gte("updated_at", format_timestamp(since))
                .order_by("updated_at", false),
        )
        .await
    }

    pub async fn create(&self, record: &T) -> Result<T, RemoteError> {
        let row = self.store.insert(T::TABLE, Self::encode(record)?).await?;
        serde_json::from_value(row).map_err(|e| RemoteError::Decode(e.to_string()))
    }

    /// Apply a partial update. Returns the updated row, or `None` if no row
    /// has that key.
    pub async fn update(
        &self,
        user_id: &str,
        key: &str,
        patch: Value,
    ) -> Result<Option<T>, RemoteError> {
        let rows = self
            .store
            .update(T::TABLE, &Self::keyed(user_id, key), patch)
            .await?;
        Ok(Self::decode(rows)?.into_iter().next())
    }

    pub async fn upsert_batch(&self, records: &[T]) -> Result<(), RemoteError> {
        if records.is_empty() {
            return Ok(());
        }
        let rows = records
            .iter()
            .map(Self::encode)
            .collect::<Result<Vec<_>, _>>()?;
        self.store.upsert(T::TABLE, rows).await
    }

    pub async fn delete(&self, user_id: &str, key: &str) -> Result<bool, RemoteError> {
        let rows = self
            .store
            .delete(T::TABLE, &Self::keyed(user_id, key))
            .await?;
        Ok(!rows.is_empty())
    }

    /// Rows whose `date` falls in `from..=to`. Only meaningful for dated tables.
    pub async fn between(
        &self,
        user_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<T>, RemoteError> {
        self.select(
            &Self::owned(user_id)
                .gte("date", format_date(from))
                .lte("date", format_date(to))
                .order_by("date", false),
        )
        .await
    }

    pub async fn by_date(&self, user_id: &str, date: NaiveDate) -> Result<Vec<T>, RemoteError> {
        self.select(
            &Self::owned(user_id)
                .eq("date", format_date(date))
                .order_by("updated_at", false),
        )
        .await
    }
}

impl Table<'_, ProtocolPhase> {
    pub async fn active_phase(&self, user_id: &str) -> Result<Option<ProtocolPhase>, RemoteError> {
        let rows = self
            .select(
                &Self::owned(user_id)
                    .eq("is_active", "true")
                    .order_by("start_date", true)
                    .limit(1),
            )
            .await?;
        Ok(rows.into_iter().next())
    }
}

impl Table<'_, ProtocolRoutine> {
    pub async fn for_phase(
        &self,
        user_id: &str,
        phase_id: &str,
    ) -> Result<Vec<ProtocolRoutine>, RemoteError> {
        self.select(
            &Self::owned(user_id)
                .eq("phase_id", phase_id)
                .order_by("day_of_week", false),
        )
        .await
    }
}
