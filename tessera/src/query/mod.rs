//! Query module - filters, predicate resolution and result shaping
//!
//! ```text
//!   Filter (names) ──bind──► Predicate (indexes) ──resolve per block──► rows
//!                                 │
//!                                 └──translate──► metadata predicate (block pruning)
//! ```

mod filter;
pub mod predicate;
pub mod range;
pub(crate) mod sort;

pub use filter::{CompareOp, Filter};
pub use predicate::Predicate;

/// A read request against one table
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub(crate) table: String,
    pub(crate) filter: Filter,
    pub(crate) columns: Option<Vec<String>>,
    pub(crate) order_by: Vec<OrderBy>,
    pub(crate) limit: Option<usize>,
}

/// Sort key of a query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub column: String,
    pub descending: bool,
}

impl Query {
    /// Every user column of every visible row, ordered by record id
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: Filter::True,
            columns: None,
            order_by: Vec::new(),
            limit: None,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    /// Project the named columns; `$rid`, `$row` and `$block` are allowed
    pub fn select<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, descending: bool) -> Self {
        self.order_by.push(OrderBy {
            column: column.into(),
            descending,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}
