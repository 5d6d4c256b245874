#[cfg(test)]
mod tests;

use super::models::*;
use crate::schema::{TableDescriptor, quote_identifier};
use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use tracing::debug;

pub struct TargetQueries;

impl TargetQueries {
    /// All canonical options ordered by id; the order defines embedding positions.
    #[inline]
    pub async fn list_options(
        conn: &mut SqliteConnection,
        target: &TableDescriptor,
    ) -> Result<Vec<CanonicalOption>> {
        let sql = format!(
            "SELECT \"id\", CAST(\"name\" AS TEXT) AS name FROM {} WHERE \"name\" IS NOT NULL ORDER BY \"id\"",
            target.quoted_name()
        );

        let rows = sqlx::query(&sql)
            .fetch_all(&mut *conn)
            .await
            .with_context(|| format!("Failed to list options of {}", target.name))?;

        rows.iter()
            .map(|row| {
                Ok(CanonicalOption {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                })
            })
            .collect()
    }

    /// Case-sensitive exact match on the name column
    #[inline]
    pub async fn find_id_by_name(
        conn: &mut SqliteConnection,
        target: &TableDescriptor,
        name: &str,
    ) -> Result<Option<i64>> {
        let sql = format!(
            "SELECT \"id\" FROM {} WHERE \"name\" = ? ORDER BY \"id\" LIMIT 1",
            target.quoted_name()
        );

        let id = sqlx::query_scalar::<_, i64>(&sql)
            .bind(name)
            .fetch_optional(&mut *conn)
            .await
            .with_context(|| format!("Failed to look up {} by name", target.name))?;

        Ok(id)
    }

    #[cfg(test)]
    pub async fn insert(
        conn: &mut SqliteConnection,
        target: &TableDescriptor,
        name: &str,
    ) -> Result<i64> {
        let sql = format!("INSERT INTO {} (\"name\") VALUES (?)", target.quoted_name());

        let id = sqlx::query(&sql)
            .bind(name)
            .execute(&mut *conn)
            .await
            .with_context(|| format!("Failed to insert into {}", target.name))?
            .last_insert_rowid();

        Ok(id)
    }
}

pub struct SynonymQueries;

impl SynonymQueries {
    /// Exact, untrimmed, case-sensitive lookup within a scope
    #[inline]
    pub async fn find_exact(
        conn: &mut SqliteConnection,
        synonyms: &TableDescriptor,
        scope: &str,
        name: &str,
    ) -> Result<Option<Synonym>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE \"table_name\" = ? AND \"name\" = ? ORDER BY \"id\" LIMIT 1",
            SYNONYM_COLUMNS,
            synonyms.quoted_name()
        );

        let row = sqlx::query(&sql)
            .bind(scope)
            .bind(name)
            .fetch_optional(&mut *conn)
            .await
            .context("Failed to look up synonym")?;

        row.as_ref().map(synonym_from_row).transpose()
    }

    /// First synonym in scope whose trimmed, lowercased name equals `name`'s.
    ///
    /// SQLite's `TRIM` and `NOCASE` only handle spaces and ASCII, so the
    /// comparison runs here over the scope's rows.
    #[inline]
    pub async fn find_normalized(
        conn: &mut SqliteConnection,
        synonyms: &TableDescriptor,
        scope: &str,
        name: &str,
    ) -> Result<Option<Synonym>> {
        let key = synonym_key(name);
        let found = Self::list_for_scope(conn, synonyms, scope)
            .await
            .context("Failed to look up normalized synonym")?
            .into_iter()
            .find(|synonym| synonym_key(&synonym.name) == key);

        Ok(found)
    }

    #[inline]
    pub async fn insert(
        conn: &mut SqliteConnection,
        synonyms: &TableDescriptor,
        synonym: &NewSynonym,
    ) -> Result<Synonym> {
        let now = Utc::now().naive_utc();
        let sql = format!(
            "INSERT INTO {} (\"table_name\", \"table_name_id\", \"name\", \"ai_match_message\", \"created\", \"modified\") VALUES (?, ?, ?, ?, ?, ?)",
            synonyms.quoted_name()
        );

        let id = sqlx::query(&sql)
            .bind(&synonym.target_table)
            .bind(synonym.target_id)
            .bind(&synonym.name)
            .bind(&synonym.origin_note)
            .bind(now)
            .bind(now)
            .execute(&mut *conn)
            .await
            .context("Failed to insert synonym")?
            .last_insert_rowid();

        debug!(
            "Inserted synonym {} '{}' -> {}.{}",
            id, synonym.name, synonym.target_table, synonym.target_id
        );

        Ok(Synonym {
            id,
            target_table: synonym.target_table.clone(),
            target_id: synonym.target_id,
            name: synonym.name.clone(),
            origin_note: synonym.origin_note.clone(),
        })
    }

    #[inline]
    pub async fn list_for_scope(
        conn: &mut SqliteConnection,
        synonyms: &TableDescriptor,
        scope: &str,
    ) -> Result<Vec<Synonym>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE \"table_name\" = ? ORDER BY \"id\"",
            SYNONYM_COLUMNS,
            synonyms.quoted_name()
        );

        let rows = sqlx::query(&sql)
            .bind(scope)
            .fetch_all(&mut *conn)
            .await
            .context("Failed to list synonyms")?;

        rows.iter().map(synonym_from_row).collect()
    }
}

/// Uniqueness key of a synonym name within its scope
#[inline]
fn synonym_key(name: &str) -> String {
    name.trim().to_lowercase()
}

const SYNONYM_COLUMNS: &str = "\"id\", \"table_name\", \"table_name_id\", \"name\", \"ai_match_message\"";

fn synonym_from_row(row: &SqliteRow) -> Result<Synonym> {
    Ok(Synonym {
        id: row.try_get("id")?,
        target_table: row.try_get("table_name")?,
        target_id: row.try_get("table_name_id")?,
        name: row.try_get("name")?,
        origin_note: row.try_get("ai_match_message")?,
    })
}

pub struct SourceQueries;

impl SourceQueries {
    /// Unmapped rows with a non-null value, ordered by id, after `after_id` when given.
    #[inline]
    pub async fn fetch_unmapped(
        conn: &mut SqliteConnection,
        select: &SourceSelect,
        after_id: Option<i64>,
        limit: u32,
    ) -> Result<Vec<SourceRecord>> {
        let mut sql = format!(
            "{} WHERE {} AND s.{} IS NOT NULL",
            select_clause(select),
            pending_clause(&select.pending),
            quote_identifier(&select.value_field)
        );
        if after_id.is_some() {
            sql.push_str(" AND s.\"id\" > ?");
        }
        sql.push_str(" ORDER BY s.\"id\" LIMIT ?");

        let mut query = sqlx::query(&sql);
        if let Some(after_id) = after_id {
            query = query.bind(after_id);
        }

        let rows = query
            .bind(i64::from(limit))
            .fetch_all(&mut *conn)
            .await
            .with_context(|| format!("Failed to fetch unmapped rows from {}", select.table_name))?;

        rows.iter()
            .map(|row| source_record_from_row(row, select))
            .collect()
    }

    /// Re-read one row inside the caller's transaction; `None` once it no longer needs mapping.
    #[inline]
    pub async fn reload_unmapped(
        conn: &mut SqliteConnection,
        select: &SourceSelect,
        id: i64,
    ) -> Result<Option<SourceRecord>> {
        let sql = format!(
            "{} WHERE {} AND s.\"id\" = ?",
            select_clause(select),
            pending_clause(&select.pending)
        );

        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .with_context(|| format!("Failed to reload row {} of {}", id, select.table_name))?;

        row.as_ref()
            .map(|row| source_record_from_row(row, select))
            .transpose()
    }

    #[inline]
    pub async fn count_unmapped(conn: &mut SqliteConnection, select: &SourceSelect) -> Result<i64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} s WHERE {} AND s.{} IS NOT NULL",
            quote_identifier(&select.table_name),
            pending_clause(&select.pending),
            quote_identifier(&select.value_field)
        );

        let count = sqlx::query_scalar::<_, i64>(&sql)
            .fetch_one(&mut *conn)
            .await
            .with_context(|| format!("Failed to count unmapped rows of {}", select.table_name))?;

        Ok(count)
    }

    #[inline]
    pub async fn set_mapping_id(
        conn: &mut SqliteConnection,
        table_name: &str,
        mapping_id_field: &str,
        id: i64,
        target_id: i64,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET {} = ? WHERE \"id\" = ?",
            quote_identifier(table_name),
            quote_identifier(mapping_id_field)
        );

        let affected = sqlx::query(&sql)
            .bind(target_id)
            .bind(id)
            .execute(&mut *conn)
            .await
            .with_context(|| format!("Failed to set {} on row {}", mapping_id_field, id))?
            .rows_affected();

        if affected != 1 {
            return Err(anyhow::anyhow!(
                "Expected to update one row of {} with id {}, updated {}",
                table_name,
                id,
                affected
            ));
        }

        Ok(())
    }
}

fn select_clause(select: &SourceSelect) -> String {
    let mut columns = vec![
        "s.\"id\" AS id".to_string(),
        format!(
            "CAST(s.{} AS TEXT) AS value",
            quote_identifier(&select.value_field)
        ),
    ];
    columns.extend(
        select
            .context_fields
            .iter()
            .enumerate()
            .map(|(i, field)| format!("CAST(s.{} AS TEXT) AS ctx_{}", quote_identifier(field), i)),
    );

    format!(
        "SELECT {} FROM {} s",
        columns.join(", "),
        quote_identifier(&select.table_name)
    )
}

fn pending_clause(pending: &PendingFilter) -> String {
    match pending {
        PendingFilter::NullMappingId { mapping_id_field } => {
            format!("s.{} IS NULL", quote_identifier(mapping_id_field))
        }
        PendingFilter::NoJunctionRow {
            junction_table,
            source_field,
        } => format!(
            "NOT EXISTS (SELECT 1 FROM {} j WHERE j.{} = s.\"id\")",
            quote_identifier(junction_table),
            quote_identifier(source_field)
        ),
    }
}

fn source_record_from_row(row: &SqliteRow, select: &SourceSelect) -> Result<SourceRecord> {
    let context = select
        .context_fields
        .iter()
        .enumerate()
        .map(|(i, field)| {
            let value: Option<String> = row.try_get(format!("ctx_{}", i).as_str())?;
            Ok((field.clone(), value))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(SourceRecord {
        id: row.try_get("id")?,
        value: row.try_get("value")?,
        context,
    })
}

pub struct JunctionQueries;

impl JunctionQueries {
    #[inline]
    pub async fn insert(
        conn: &mut SqliteConnection,
        junction_table: &str,
        source_field: &str,
        target_field: &str,
        source_id: i64,
        target_id: i64,
    ) -> Result<i64> {
        let sql = format!(
            "INSERT INTO {} ({}, {}) VALUES (?, ?)",
            quote_identifier(junction_table),
            quote_identifier(source_field),
            quote_identifier(target_field)
        );

        let id = sqlx::query(&sql)
            .bind(source_id)
            .bind(target_id)
            .execute(&mut *conn)
            .await
            .with_context(|| {
                format!(
                    "Failed to link row {} to {} in {}",
                    source_id, target_id, junction_table
                )
            })?
            .last_insert_rowid();

        Ok(id)
    }

    #[cfg(test)]
    pub async fn targets_for(
        conn: &mut SqliteConnection,
        junction_table: &str,
        source_field: &str,
        target_field: &str,
        source_id: i64,
    ) -> Result<Vec<i64>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ? ORDER BY \"id\"",
            quote_identifier(target_field),
            quote_identifier(junction_table),
            quote_identifier(source_field)
        );

        let ids = sqlx::query_scalar::<_, i64>(&sql)
            .bind(source_id)
            .fetch_all(&mut *conn)
            .await
            .context("Failed to list junction targets")?;

        Ok(ids)
    }
}
