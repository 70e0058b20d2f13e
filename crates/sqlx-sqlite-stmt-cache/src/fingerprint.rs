//! Structural fingerprints for SQL query shapes.
//!
//! A shape captures the *structure* of a query: target table, projected
//! columns, the ordered list of (predicate column, operator) pairs, and
//! whether ordering/limit/offset are present. Literal bound values never
//! participate, so `WHERE id = 5` and `WHERE id = 500` share one fingerprint
//! and one compiled statement, while a different predicate column or operator
//! produces a different fingerprint.

use std::hash::{Hash, Hasher};

/// Comparison operator in a predicate position.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Operator {
   Eq,
   Ne,
   Lt,
   Le,
   Gt,
   Ge,
   Like,
   /// IN-list with a fixed placeholder count.
   ///
   /// The count participates in the fingerprint: an IN-list with a different
   /// number of keys compiles a different statement.
   In(usize),
}

impl Operator {
   fn write_sql(&self, out: &mut String) {
      match self {
         Operator::Eq => out.push_str(" = ?"),
         Operator::Ne => out.push_str(" != ?"),
         Operator::Lt => out.push_str(" < ?"),
         Operator::Le => out.push_str(" <= ?"),
         Operator::Gt => out.push_str(" > ?"),
         Operator::Ge => out.push_str(" >= ?"),
         Operator::Like => out.push_str(" LIKE ?"),
         Operator::In(count) => {
            out.push_str(" IN (");
            out.push_str(&placeholders(*count));
            out.push(')');
         }
      }
   }
}

/// Fingerprint of a query's structural identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShapeFingerprint(u64);

impl ShapeFingerprint {
   /// Fingerprint for ad hoc SQL text, hashed as-is.
   ///
   /// Used for hand-supplied statements where no structural shape exists.
   /// Text fingerprints and shape fingerprints live in disjoint hash
   /// domains so an ad hoc query can never collide with a built shape.
   pub fn of_text(sql: &str) -> Self {
      let mut hasher = std::collections::hash_map::DefaultHasher::new();
      1u8.hash(&mut hasher);
      sql.hash(&mut hasher);
      Self(hasher.finish())
   }

   /// The raw 64-bit key.
   pub fn as_u64(&self) -> u64 {
      self.0
   }
}

/// Builder for a query's structural identity and its SQL text.
///
/// ```
/// use sqlx_sqlite_stmt_cache::{Operator, QueryShape};
///
/// let shape = QueryShape::select("users").where_col("id", Operator::Eq).with_limit();
/// assert_eq!(shape.sql(), "SELECT * FROM users WHERE id = ? LIMIT ?");
/// ```
#[derive(Debug, Clone, Hash)]
pub struct QueryShape {
   table: String,
   columns: Vec<String>,
   predicates: Vec<(String, Operator)>,
   order_by: Option<String>,
   limit: bool,
   offset: bool,
}

impl QueryShape {
   /// Shape selecting all columns from `table`.
   pub fn select(table: impl Into<String>) -> Self {
      Self {
         table: table.into(),
         columns: Vec::new(),
         predicates: Vec::new(),
         order_by: None,
         limit: false,
         offset: false,
      }
   }

   /// Project specific columns instead of `*`.
   pub fn columns<I, S>(mut self, columns: I) -> Self
   where
      I: IntoIterator<Item = S>,
      S: Into<String>,
   {
      self.columns = columns.into_iter().map(Into::into).collect();
      self
   }

   /// Append a predicate. Order matters: the same predicates in a
   /// different order are a different shape.
   pub fn where_col(mut self, column: impl Into<String>, op: Operator) -> Self {
      self.predicates.push((column.into(), op));
      self
   }

   /// Order results by the given column.
   pub fn order_by(mut self, column: impl Into<String>) -> Self {
      self.order_by = Some(column.into());
      self
   }

   /// Add a positional LIMIT parameter.
   pub fn with_limit(mut self) -> Self {
      self.limit = true;
      self
   }

   /// Add a positional OFFSET parameter.
   pub fn with_offset(mut self) -> Self {
      self.offset = true;
      self
   }

   /// Structural fingerprint of this shape.
   pub fn fingerprint(&self) -> ShapeFingerprint {
      let mut hasher = std::collections::hash_map::DefaultHasher::new();
      2u8.hash(&mut hasher);
      self.hash(&mut hasher);
      ShapeFingerprint(hasher.finish())
   }

   /// Render the SQL text for this shape with positional placeholders.
   pub fn sql(&self) -> String {
      let mut sql = String::from("SELECT ");
      if self.columns.is_empty() {
         sql.push('*');
      } else {
         sql.push_str(&self.columns.join(", "));
      }
      sql.push_str(" FROM ");
      sql.push_str(&self.table);

      for (i, (column, op)) in self.predicates.iter().enumerate() {
         sql.push_str(if i == 0 { " WHERE " } else { " AND " });
         sql.push_str(column);
         op.write_sql(&mut sql);
      }

      if let Some(ref column) = self.order_by {
         sql.push_str(" ORDER BY ");
         sql.push_str(column);
      }
      if self.limit {
         sql.push_str(" LIMIT ?");
      }
      if self.offset {
         sql.push_str(" OFFSET ?");
      }

      sql
   }
}

/// Compute `count` comma-separated positional markers: `?, ?, ?`.
pub fn placeholders(count: usize) -> String {
   let mut out = String::with_capacity(count.saturating_mul(3));
   for i in 0..count {
      if i > 0 {
         out.push_str(", ");
      }
      out.push('?');
   }
   out
}
