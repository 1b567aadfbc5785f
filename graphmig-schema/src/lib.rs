//! graphmig Schema Source
//!
//! Declarative descriptors for a graph-shaped relational model: node tables,
//! edge tables, and the indexes each requires. This crate holds pure data
//! plus DDL rendering, with no database access. The admin layer consumes the
//! descriptors to create tables idempotently, reconcile indexes, and stamp
//! a deterministic content fingerprint into the version tracker.
//!
//! Tables are statically supplied (typically loaded from a JSON document)
//! rather than discovered from live model types, so the set of descriptors
//! is explicit and stable for fingerprinting.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use thiserror::Error;

// ============================================================================
// ERRORS
// ============================================================================

/// Schema definition errors.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("invalid {what} identifier: {value:?}")]
    InvalidIdentifier { what: &'static str, value: String },

    #[error("duplicate table name: {name}")]
    DuplicateTable { name: String },

    #[error("duplicate index name: {name}")]
    DuplicateIndex { name: String },

    #[error("index {index} references unknown table {table}")]
    UnknownTable { index: String, table: String },

    #[error("edge table {edge} references unknown node table {table}")]
    UnknownEndpoint { edge: String, table: String },

    #[error("failed to read schema document: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse schema document: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================================
// FINGERPRINT REVISION
// ============================================================================

/// Revision suffix folded into the schema fingerprint.
///
/// Bump this when a software upgrade changes the generated DDL for the same
/// schema document, so that existing databases are migrated again even
/// though the document itself did not change.
pub const SCHEMA_REVISION: &str = "2";

// ============================================================================
// TABLE AND INDEX DESCRIPTORS
// ============================================================================

/// Whether a table stores graph nodes or graph edges.
///
/// Edge tables reference the node tables at both endpoints, so they must be
/// created after their endpoints. [`GraphSchema`] orders nodes before edges
/// to guarantee this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TableKind {
    Node,
    Edge {
        /// Node table at the source end of the edge.
        src_table: String,
        /// Node table at the destination end of the edge.
        dst_table: String,
    },
}

/// A single index required by the schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    /// Index name, unique across the whole schema.
    pub name: String,
    /// Owning table name.
    pub table: String,
    /// Whether the index enforces uniqueness. A change in this flag on an
    /// existing index triggers drop-and-recreate during reconciliation.
    #[serde(default)]
    pub unique: bool,
    /// Indexed columns, in order.
    pub columns: Vec<String>,
}

impl IndexSpec {
    /// Render the `CREATE INDEX` statement for this spec.
    pub fn create_sql(&self) -> String {
        let unique = if self.unique { "UNIQUE " } else { "" };
        let columns = self
            .columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "CREATE {unique}INDEX {} ON {} ( {columns} )",
            quote_ident(&self.name),
            quote_ident(&self.table),
        )
    }

    /// Render the `DROP INDEX` statement for this spec.
    pub fn drop_sql(&self) -> String {
        format!("DROP INDEX {}", quote_ident(&self.name))
    }
}

/// A single table required by the schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: String,
    pub kind: TableKind,
    /// Indexes owned by this table.
    #[serde(default)]
    pub indexes: Vec<IndexSpec>,
}

impl TableSpec {
    /// Render the idempotent `CREATE TABLE` statement for this table.
    ///
    /// All graph tables share a fixed column shape: nodes carry an id plus
    /// acl/system-annotation/property payloads, edges carry the endpoint
    /// ids plus the same payload columns.
    pub fn create_sql(&self) -> String {
        match &self.kind {
            TableKind::Node => format!(
                "CREATE TABLE IF NOT EXISTS {name} (\n\
                 \x20   node_id TEXT NOT NULL,\n\
                 \x20   created TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT now(),\n\
                 \x20   acl TEXT[] NOT NULL DEFAULT '{{}}',\n\
                 \x20   _sysan JSONB NOT NULL DEFAULT '{{}}',\n\
                 \x20   _props JSONB NOT NULL DEFAULT '{{}}',\n\
                 \x20   PRIMARY KEY (node_id)\n\
                 )",
                name = quote_ident(&self.name),
            ),
            TableKind::Edge { src_table, dst_table } => format!(
                "CREATE TABLE IF NOT EXISTS {name} (\n\
                 \x20   src_id TEXT NOT NULL,\n\
                 \x20   dst_id TEXT NOT NULL,\n\
                 \x20   created TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT now(),\n\
                 \x20   acl TEXT[] NOT NULL DEFAULT '{{}}',\n\
                 \x20   _sysan JSONB NOT NULL DEFAULT '{{}}',\n\
                 \x20   _props JSONB NOT NULL DEFAULT '{{}}',\n\
                 \x20   PRIMARY KEY (src_id, dst_id),\n\
                 \x20   FOREIGN KEY (src_id) REFERENCES {src} (node_id),\n\
                 \x20   FOREIGN KEY (dst_id) REFERENCES {dst} (node_id)\n\
                 )",
                name = quote_ident(&self.name),
                src = quote_ident(src_table),
                dst = quote_ident(dst_table),
            ),
        }
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

/// Raw on-disk schema document, before validation.
#[derive(Debug, Deserialize)]
struct SchemaDocument {
    tables: Vec<TableSpec>,
}

/// The full set of tables and indexes the database must carry.
///
/// Construction validates identifiers and cross-references and sorts tables
/// into a canonical order (nodes first, then edges, each alphabetically), so
/// two schemas with the same content always serialize (and fingerprint)
/// identically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphSchema {
    tables: Vec<TableSpec>,
}

impl GraphSchema {
    /// Validate and canonicalize a set of table descriptors.
    pub fn new(mut tables: Vec<TableSpec>) -> Result<Self, SchemaError> {
        tables.sort_by(|a, b| {
            let rank = |t: &TableSpec| matches!(t.kind, TableKind::Edge { .. }) as u8;
            (rank(a), a.name.as_str()).cmp(&(rank(b), b.name.as_str()))
        });

        let mut table_names = std::collections::HashSet::new();
        let mut node_names = std::collections::HashSet::new();
        for table in &tables {
            check_ident("table", &table.name)?;
            if !table_names.insert(table.name.clone()) {
                return Err(SchemaError::DuplicateTable {
                    name: table.name.clone(),
                });
            }
            if matches!(table.kind, TableKind::Node) {
                node_names.insert(table.name.clone());
            }
        }

        let mut index_names = std::collections::HashSet::new();
        for table in &tables {
            if let TableKind::Edge { src_table, dst_table } = &table.kind {
                for endpoint in [src_table, dst_table] {
                    if !node_names.contains(endpoint.as_str()) {
                        return Err(SchemaError::UnknownEndpoint {
                            edge: table.name.clone(),
                            table: endpoint.clone(),
                        });
                    }
                }
            }
            for index in &table.indexes {
                check_ident("index", &index.name)?;
                for column in &index.columns {
                    check_ident("column", column)?;
                }
                if index.table != table.name {
                    return Err(SchemaError::UnknownTable {
                        index: index.name.clone(),
                        table: index.table.clone(),
                    });
                }
                if !index_names.insert(index.name.clone()) {
                    return Err(SchemaError::DuplicateIndex {
                        name: index.name.clone(),
                    });
                }
            }
        }

        Ok(Self { tables })
    }

    /// Parse and validate a JSON schema document.
    pub fn from_json(document: &str) -> Result<Self, SchemaError> {
        let doc: SchemaDocument = serde_json::from_str(document)?;
        Self::new(doc.tables)
    }

    /// Load and validate a JSON schema document from disk.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let document = std::fs::read_to_string(path)?;
        Self::from_json(&document)
    }

    /// Tables in creation order (node tables before edge tables).
    pub fn tables(&self) -> &[TableSpec] {
        &self.tables
    }

    /// All declared indexes across all tables.
    pub fn indexes(&self) -> impl Iterator<Item = &IndexSpec> {
        self.tables.iter().flat_map(|t| t.indexes.iter())
    }

    /// Deterministic content fingerprint of this schema.
    ///
    /// SHA-256 over the canonical serialization plus [`SCHEMA_REVISION`],
    /// hex encoded. Stable across process restarts for the same schema
    /// content, so the version tracker can compare it against the stamped
    /// value to decide whether migration is needed.
    pub fn fingerprint(&self) -> String {
        // Canonical order is established in new(), and serde_json emits
        // struct fields in declaration order, so this serialization is
        // deterministic.
        let serialized =
            serde_json::to_string(self).expect("schema serialization cannot fail");
        let mut hasher = Sha256::new();
        hasher.update(serialized.as_bytes());
        hasher.update(SCHEMA_REVISION.as_bytes());
        hex::encode(hasher.finalize())
    }
}

// ============================================================================
// IDENTIFIER HELPERS
// ============================================================================

/// Quote a SQL identifier.
///
/// Identifiers are validated against a conservative pattern before use, but
/// rendered DDL still quotes them so reserved words remain usable as table
/// or column names.
fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident)
}

/// Whether `value` is a conservative unquoted SQL identifier (letters,
/// digits, underscores, not starting with a digit).
pub fn valid_ident(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

fn check_ident(what: &'static str, value: &str) -> Result<(), SchemaError> {
    if valid_ident(value) {
        Ok(())
    } else {
        Err(SchemaError::InvalidIdentifier {
            what,
            value: value.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> TableSpec {
        TableSpec {
            name: name.to_string(),
            kind: TableKind::Node,
            indexes: Vec::new(),
        }
    }

    fn edge(name: &str, src: &str, dst: &str) -> TableSpec {
        TableSpec {
            name: name.to_string(),
            kind: TableKind::Edge {
                src_table: src.to_string(),
                dst_table: dst.to_string(),
            },
            indexes: Vec::new(),
        }
    }

    fn index(name: &str, table: &str, unique: bool) -> IndexSpec {
        IndexSpec {
            name: name.to_string(),
            table: table.to_string(),
            unique,
            columns: vec!["node_id".to_string()],
        }
    }

    #[test]
    fn nodes_sort_before_edges() {
        let schema = GraphSchema::new(vec![
            edge("edge_member_of", "node_case", "node_project"),
            node("node_project"),
            node("node_case"),
        ])
        .unwrap();

        let names: Vec<_> = schema.tables().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["node_case", "node_project", "edge_member_of"]);
    }

    #[test]
    fn fingerprint_is_order_independent() {
        let a = GraphSchema::new(vec![node("node_a"), node("node_b")]).unwrap();
        let b = GraphSchema::new(vec![node("node_b"), node("node_a")]).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_changes_with_content() {
        let mut with_index = node("node_case");
        with_index.indexes.push(index("idx_case_id", "node_case", false));
        let a = GraphSchema::new(vec![node("node_case")]).unwrap();
        let b = GraphSchema::new(vec![with_index]).unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());

        // Uniqueness is part of the fingerprint too.
        let mut unique_index = node("node_case");
        unique_index
            .indexes
            .push(index("idx_case_id", "node_case", true));
        let c = GraphSchema::new(vec![unique_index]).unwrap();
        assert_ne!(b.fingerprint(), c.fingerprint());
    }

    #[test]
    fn fingerprint_is_stable_across_calls() {
        let schema = GraphSchema::new(vec![node("node_case")]).unwrap();
        assert_eq!(schema.fingerprint(), schema.fingerprint());
    }

    #[test]
    fn rejects_duplicate_tables_and_indexes() {
        let err = GraphSchema::new(vec![node("node_case"), node("node_case")]).unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateTable { .. }));

        let mut a = node("node_a");
        a.indexes.push(index("idx_shared", "node_a", false));
        let mut b = node("node_b");
        b.indexes.push(index("idx_shared", "node_b", false));
        let err = GraphSchema::new(vec![a, b]).unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateIndex { .. }));
    }

    #[test]
    fn rejects_dangling_edge_endpoints() {
        let err = GraphSchema::new(vec![
            node("node_case"),
            edge("edge_member_of", "node_case", "node_project"),
        ])
        .unwrap_err();
        assert!(matches!(err, SchemaError::UnknownEndpoint { .. }));
    }

    #[test]
    fn rejects_index_owned_by_other_table() {
        let mut t = node("node_case");
        t.indexes.push(index("idx_other", "node_project", false));
        let err = GraphSchema::new(vec![t, node("node_project")]).unwrap_err();
        assert!(matches!(err, SchemaError::UnknownTable { .. }));
    }

    #[test]
    fn rejects_bad_identifiers() {
        let err = GraphSchema::new(vec![node("node case; DROP TABLE x")]).unwrap_err();
        assert!(matches!(err, SchemaError::InvalidIdentifier { .. }));

        let err = GraphSchema::new(vec![node("1node")]).unwrap_err();
        assert!(matches!(err, SchemaError::InvalidIdentifier { .. }));
    }

    #[test]
    fn node_create_sql_shape() {
        let sql = node("node_case").create_sql();
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS \"node_case\""));
        assert!(sql.contains("node_id TEXT NOT NULL"));
        assert!(sql.contains("PRIMARY KEY (node_id)"));
        assert!(!sql.contains("FOREIGN KEY"));
    }

    #[test]
    fn edge_create_sql_references_endpoints() {
        let sql = edge("edge_member_of", "node_case", "node_project").create_sql();
        assert!(sql.contains("PRIMARY KEY (src_id, dst_id)"));
        assert!(sql.contains("FOREIGN KEY (src_id) REFERENCES \"node_case\" (node_id)"));
        assert!(sql.contains("FOREIGN KEY (dst_id) REFERENCES \"node_project\" (node_id)"));
    }

    #[test]
    fn index_sql_round_trip() {
        let idx = IndexSpec {
            name: "idx_props".to_string(),
            table: "node_case".to_string(),
            unique: true,
            columns: vec!["node_id".to_string(), "created".to_string()],
        };
        assert_eq!(
            idx.create_sql(),
            "CREATE UNIQUE INDEX \"idx_props\" ON \"node_case\" ( \"node_id\", \"created\" )"
        );
        assert_eq!(idx.drop_sql(), "DROP INDEX \"idx_props\"");
    }

    #[test]
    fn loads_schema_from_json() {
        let document = r#"{
            "tables": [
                {
                    "name": "node_case",
                    "kind": { "type": "node" },
                    "indexes": [
                        {
                            "name": "idx_case_created",
                            "table": "node_case",
                            "columns": ["created"]
                        }
                    ]
                },
                {
                    "name": "edge_case_project",
                    "kind": {
                        "type": "edge",
                        "src_table": "node_case",
                        "dst_table": "node_case"
                    }
                }
            ]
        }"#;

        let schema = GraphSchema::from_json(document).unwrap();
        assert_eq!(schema.tables().len(), 2);
        let idx: Vec<_> = schema.indexes().collect();
        assert_eq!(idx.len(), 1);
        assert!(!idx[0].unique);
    }
}
