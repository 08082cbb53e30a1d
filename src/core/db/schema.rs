/// Schema Collections Module
///
/// This module exposes database metadata as `DataTable`s, one per schema
/// collection. Every collection declares the columns its restrictions apply
/// to; a restriction at position `i` filters on the `i`th of those columns.

use crate::core::db::query::{DataTable, Value};
use crate::core::DriverError;
use rusqlite::{params, Connection, Row};

/// Collection listing every available collection
pub const METADATA_COLLECTIONS: &str = "MetaDataCollections";

struct Collection {
    name: &'static str,
    restrictions: &'static [&'static str],
    build: fn(&Connection) -> Result<DataTable, DriverError>,
}

const COLLECTIONS: &[Collection] = &[
    Collection {
        name: METADATA_COLLECTIONS,
        restrictions: &[],
        build: metadata_collections,
    },
    Collection {
        name: "Tables",
        restrictions: &["TABLE_NAME", "TABLE_TYPE"],
        build: tables,
    },
    Collection {
        name: "Columns",
        restrictions: &["TABLE_NAME", "COLUMN_NAME"],
        build: columns,
    },
    Collection {
        name: "Indexes",
        restrictions: &["TABLE_NAME", "INDEX_NAME"],
        build: indexes,
    },
    Collection {
        name: "ForeignKeys",
        restrictions: &["TABLE_NAME"],
        build: foreign_keys,
    },
];

/// Fetches a schema collection.
///
/// # Arguments
///
/// * `collection` - Collection name, matched case-insensitively; `None` for `MetaDataCollections`
/// * `restrictions` - Positional filters; `None` entries match everything
///
/// # Errors
///
/// `DriverError::Schema` for unknown collections or more restrictions than
/// the collection supports; SQLite errors from the metadata queries.
pub fn get_schema(
    conn: &Connection,
    collection: Option<&str>,
    restrictions: &[Option<&str>],
) -> Result<DataTable, DriverError> {
    let requested = collection.unwrap_or(METADATA_COLLECTIONS);
    let collection = COLLECTIONS
        .iter()
        .find(|c| c.name.eq_ignore_ascii_case(requested))
        .ok_or_else(|| {
            DriverError::Schema(format!("the requested collection '{requested}' is not defined"))
        })?;

    if restrictions.len() > collection.restrictions.len() {
        return Err(DriverError::Schema(format!(
            "more restrictions were provided than the '{}' collection supports",
            collection.name
        )));
    }

    let mut table = (collection.build)(conn)?;
    for (column, restriction) in collection.restrictions.iter().zip(restrictions) {
        if let Some(wanted) = restriction {
            retain_matching(&mut table, column, wanted);
        }
    }
    Ok(table)
}

fn retain_matching(table: &mut DataTable, column: &str, wanted: &str) {
    let Some(index) = table.column_index(column) else {
        return;
    };
    table.rows.retain(|row| match row.get(index) {
        Some(Value::Text(value)) => value.eq_ignore_ascii_case(wanted),
        _ => false,
    });
}

fn new_table(name: &str, columns: &[&str]) -> DataTable {
    DataTable::new(name, columns.iter().map(|c| c.to_string()).collect())
}

fn metadata_collections(_conn: &Connection) -> Result<DataTable, DriverError> {
    let mut table = new_table(METADATA_COLLECTIONS, &["CollectionName", "NumberOfRestrictions"]);
    for collection in COLLECTIONS {
        table.rows.push(vec![
            Value::from(collection.name),
            Value::Integer(collection.restrictions.len() as i64),
        ]);
    }
    Ok(table)
}

/// Helper function to retrieve all user-defined table and view names
fn table_names(conn: &Connection) -> Result<Vec<(String, String)>, DriverError> {
    let mut stmt = conn.prepare(
        "SELECT name, type FROM sqlite_master
         WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%'
         ORDER BY name",
    )?;
    let names = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names)
}

fn tables(conn: &Connection) -> Result<DataTable, DriverError> {
    let mut table = new_table("Tables", &["TABLE_CATALOG", "TABLE_NAME", "TABLE_TYPE"]);
    for (name, kind) in table_names(conn)? {
        table
            .rows
            .push(vec![Value::from("main"), Value::from(name), Value::from(kind)]);
    }
    Ok(table)
}

/// Creates a Columns row from a `pragma_table_info` result row
fn column_row(table_name: &str, row: &Row) -> rusqlite::Result<Vec<Value>> {
    let notnull: bool = row.get(3)?;
    let pk: i64 = row.get(5)?;
    Ok(vec![
        Value::from(table_name),
        Value::Text(row.get(1)?),
        Value::Integer(row.get(0)?),
        Value::Text(row.get(2)?),
        Value::Integer(i64::from(!notnull)),
        Value::from(row.get::<_, Option<String>>(4)?),
        Value::Integer(i64::from(pk > 0)),
    ])
}

fn columns(conn: &Connection) -> Result<DataTable, DriverError> {
    let mut table = new_table(
        "Columns",
        &[
            "TABLE_NAME",
            "COLUMN_NAME",
            "ORDINAL_POSITION",
            "DATA_TYPE",
            "IS_NULLABLE",
            "COLUMN_DEFAULT",
            "PRIMARY_KEY",
        ],
    );

    let mut stmt = conn.prepare(
        "SELECT cid, name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?1) ORDER BY cid",
    )?;
    for (table_name, _) in table_names(conn)? {
        let rows = stmt
            .query_map(params![table_name], |row| column_row(&table_name, row))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        table.rows.extend(rows);
    }
    Ok(table)
}

/// Helper function to retrieve the column names making up an index
fn index_columns(conn: &Connection, index_name: &str) -> Result<Vec<String>, DriverError> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_index_info(?1) ORDER BY seqno")?;
    let names = stmt
        .query_map(params![index_name], |row| row.get::<_, Option<String>>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    // Expression columns have no name
    Ok(names
        .into_iter()
        .map(|name| name.unwrap_or_else(|| "<expression>".to_string()))
        .collect())
}

fn indexes(conn: &Connection) -> Result<DataTable, DriverError> {
    let mut table = new_table("Indexes", &["TABLE_NAME", "INDEX_NAME", "UNIQUE", "COLUMNS"]);

    let mut stmt = conn.prepare("SELECT name, \"unique\" FROM pragma_index_list(?1) ORDER BY name")?;
    for (table_name, kind) in table_names(conn)? {
        if kind != "table" {
            continue;
        }
        let list = stmt
            .query_map(params![table_name], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        for (index_name, unique) in list {
            let columns = index_columns(conn, &index_name)?.join(", ");
            table.rows.push(vec![
                Value::from(table_name.as_str()),
                Value::from(index_name),
                Value::Integer(i64::from(unique)),
                Value::from(columns),
            ]);
        }
    }
    Ok(table)
}

fn foreign_keys(conn: &Connection) -> Result<DataTable, DriverError> {
    let mut table = new_table(
        "ForeignKeys",
        &["TABLE_NAME", "FROM_COLUMN", "REFERENCED_TABLE", "TO_COLUMN"],
    );

    let mut stmt = conn.prepare(
        "SELECT \"from\", \"table\", \"to\" FROM pragma_foreign_key_list(?1) ORDER BY id, seq",
    )?;
    for (table_name, kind) in table_names(conn)? {
        if kind != "table" {
            continue;
        }
        let rows = stmt
            .query_map(params![table_name], |row| {
                Ok(vec![
                    Value::from(table_name.as_str()),
                    Value::Text(row.get(0)?),
                    Value::Text(row.get(1)?),
                    // NULL when the key targets the referenced table's primary key
                    Value::from(row.get::<_, Option<String>>(2)?),
                ])
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        table.rows.extend(rows);
    }
    Ok(table)
}
