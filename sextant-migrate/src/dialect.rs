//! Vendor capability records.
//!
//! Each supported product is described by a plain [`Dialect`] value instead of
//! a subclass: how identifiers are quoted, whether DDL can run inside a
//! transaction, and which error codes mean "try again". A
//! [`DialectRegistry`] maps the product name a connection reports to one of
//! these records.

use std::sync::LazyLock;

static BUILTIN: LazyLock<DialectRegistry> = LazyLock::new(DialectRegistry::default);

/// Capabilities of one database product.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dialect {
    /// Product name, e.g. `PostgreSQL`.
    pub name: &'static str,
    /// Opening and closing identifier quote.
    pub quote: (char, char),
    /// Whether DDL statements participate in transactions.
    pub supports_ddl_transactions: bool,
    /// Schema used when none is configured.
    pub default_schema: Option<&'static str>,
    /// Error codes classified as transient serialization/deadlock conflicts.
    pub transient_codes: &'static [&'static str],
}

impl Dialect {
    /// PostgreSQL.
    pub const POSTGRES: Dialect = Dialect {
        name: "PostgreSQL",
        quote: ('"', '"'),
        supports_ddl_transactions: true,
        default_schema: Some("public"),
        transient_codes: &["40001", "40P01"],
    };

    /// CockroachDB. Serialization conflicts are routine here.
    pub const COCKROACH: Dialect = Dialect {
        name: "CockroachDB",
        quote: ('"', '"'),
        supports_ddl_transactions: false,
        default_schema: Some("public"),
        transient_codes: &["40001"],
    };

    /// MySQL and MariaDB.
    pub const MYSQL: Dialect = Dialect {
        name: "MySQL",
        quote: ('`', '`'),
        supports_ddl_transactions: false,
        default_schema: None,
        transient_codes: &["40001", "1213"],
    };

    /// Microsoft SQL Server.
    pub const SQL_SERVER: Dialect = Dialect {
        name: "SQL Server",
        quote: ('[', ']'),
        supports_ddl_transactions: true,
        default_schema: Some("dbo"),
        transient_codes: &["40001", "1205"],
    };

    /// SQLite.
    pub const SQLITE: Dialect = Dialect {
        name: "SQLite",
        quote: ('"', '"'),
        supports_ddl_transactions: true,
        default_schema: Some("main"),
        transient_codes: &["SQLITE_BUSY", "SQLITE_LOCKED"],
    };

    /// A dialect with no vendor knowledge, used by the in-memory backend.
    pub const GENERIC: Dialect = Dialect {
        name: "Generic",
        quote: ('"', '"'),
        supports_ddl_transactions: true,
        default_schema: None,
        transient_codes: &["40001"],
    };

    /// Quote an identifier, doubling any embedded closing quote.
    pub fn quote(&self, identifier: &str) -> String {
        let (open, close) = self.quote;
        let mut out = String::with_capacity(identifier.len() + 2);
        out.push(open);
        for c in identifier.chars() {
            if c == close {
                out.push(close);
            }
            out.push(c);
        }
        out.push(close);
        out
    }

    /// Quote a possibly schema-qualified table name.
    pub fn quote_table(&self, schema: Option<&str>, table: &str) -> String {
        match schema {
            Some(schema) => format!("{}.{}", self.quote(schema), self.quote(table)),
            None => self.quote(table),
        }
    }

    /// Whether `code` is one of this dialect's transient conflict codes.
    pub fn is_transient(&self, code: &str) -> bool {
        self.transient_codes.contains(&code)
    }
}

/// Maps product names reported by a driver to capability records.
#[derive(Debug, Clone)]
pub struct DialectRegistry {
    entries: Vec<(&'static str, Dialect)>,
}

impl Default for DialectRegistry {
    fn default() -> Self {
        Self {
            // CockroachDB speaks the PostgreSQL protocol, so it is matched first.
            entries: vec![
                ("cockroach", Dialect::COCKROACH),
                ("postgres", Dialect::POSTGRES),
                ("mariadb", Dialect::MYSQL),
                ("mysql", Dialect::MYSQL),
                ("sql server", Dialect::SQL_SERVER),
                ("sqlserver", Dialect::SQL_SERVER),
                ("sqlite", Dialect::SQLITE),
            ],
        }
    }
}

impl DialectRegistry {
    /// Create a registry with the built-in dialects.
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared registry of built-in dialects.
    pub fn builtin() -> &'static DialectRegistry {
        &BUILTIN
    }

    /// Register an additional dialect, consulted before the built-in ones.
    pub fn register(&mut self, product_fragment: &'static str, dialect: Dialect) {
        self.entries.insert(0, (product_fragment, dialect));
    }

    /// Find the dialect for a product name such as `PostgreSQL 15.4`.
    pub fn detect(&self, product: &str) -> Option<Dialect> {
        let product = product.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(fragment, _)| product.contains(fragment))
            .map(|(_, dialect)| *dialect)
    }
}
