//! PostgreSQL backend. Every collection is a table holding one JSONB
//! document per row; filters are JSONB containment queries and indexes are
//! expression indexes over the document fields.

use std::sync::Arc;

use async_stream::stream;
use async_trait::async_trait;
use futures::TryStreamExt;
use log::debug;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};

use super::{
    ensure_id, Collection, Database, DbError, DocumentStream, FindOptions, IndexModel, SortOrder,
};
use crate::document::json::encode_key;
use crate::document::{Document, Value};

const INDEX_CATALOG: &str = "gridstore_indexes";

#[derive(Clone)]
pub struct PgDatabase {
    pool: Pool<Postgres>,
}

impl PgDatabase {
    pub async fn connect(database_url: &str) -> Result<Self, DbError> {
        let pool = Pool::<Postgres>::connect(database_url).await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: Pool<Postgres>) -> Result<Self, DbError> {
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                collection TEXT NOT NULL,
                name TEXT NOT NULL,
                keys JSONB NOT NULL,
                is_unique BOOLEAN NOT NULL,
                PRIMARY KEY (collection, name)
            )",
            INDEX_CATALOG
        ))
        .execute(&pool)
        .await?;
        Ok(PgDatabase { pool })
    }
}

#[async_trait]
impl Database for PgDatabase {
    async fn collection(&self, name: &str) -> Result<Arc<dyn Collection>, DbError> {
        let table = quote_ident(name)?;
        sqlx::query(&create_table_sql(&table))
            .execute(&self.pool)
            .await?;
        sqlx::query(&id_index_sql(name, &table)?)
            .execute(&self.pool)
            .await?;
        debug!("bound collection {}", name);

        Ok(Arc::new(PgCollection {
            name: name.to_string(),
            table,
            pool: self.pool.clone(),
        }))
    }
}

pub struct PgCollection {
    name: String,
    table: String,
    pool: Pool<Postgres>,
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Double-quoted identifier for a collection or index name.
pub(crate) fn quote_ident(name: &str) -> Result<String, DbError> {
    if !valid_name(name) {
        return Err(DbError::InvalidName(name.to_string()));
    }
    Ok(format!("\"{}\"", name))
}

fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn field_expr(field: &str) -> String {
    format!("(doc -> {})", quote_literal(&encode_key(field)))
}

/// Keeps `_id` and the listed fields that are present; absent fields are
/// left out rather than turned into nulls.
fn projection_expr(fields: &[String]) -> String {
    let keys: Vec<String> = std::iter::once("_id")
        .chain(fields.iter().map(String::as_str))
        .map(|f| quote_literal(&encode_key(f)))
        .collect();
    format!(
        "COALESCE((SELECT jsonb_object_agg(key, value) FROM jsonb_each(doc) WHERE key IN ({})), '{{}}'::jsonb)",
        keys.join(", ")
    )
}

fn direction(order: SortOrder) -> &'static str {
    match order {
        SortOrder::Ascending => "ASC",
        SortOrder::Descending => "DESC",
    }
}

pub(crate) fn create_table_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (pk BIGSERIAL PRIMARY KEY, doc JSONB NOT NULL)",
        table
    )
}

fn id_index_sql(name: &str, table: &str) -> Result<String, DbError> {
    Ok(format!(
        "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} ((doc -> '_id'))",
        quote_ident(&format!("{}__id_", name))?,
        table
    ))
}

pub(crate) fn create_index_sql(collection: &str, table: &str, index: &IndexModel) -> Result<String, DbError> {
    let index_name = quote_ident(&format!("{}_{}", collection, index.name))?;
    let columns: Vec<String> = index
        .keys
        .iter()
        .map(|(field, order)| format!("{} {}", field_expr(field), direction(*order)))
        .collect();
    Ok(format!(
        "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
        if index.unique { "UNIQUE " } else { "" },
        index_name,
        table,
        columns.join(", ")
    ))
}

/// `$1` is bound to the JSONB filter document.
pub(crate) fn select_sql(table: &str, options: &FindOptions) -> String {
    let columns = match &options.projection {
        Some(fields) => format!("{} AS doc", projection_expr(fields)),
        None => "doc".to_string(),
    };
    let mut sql = format!("SELECT {} FROM {} WHERE doc @> $1", columns, table);

    let mut order: Vec<String> = options
        .sort
        .iter()
        .map(|(field, o)| format!("{} {}", field_expr(field), direction(*o)))
        .collect();
    order.push("pk ASC".to_string());
    sql.push_str(" ORDER BY ");
    sql.push_str(&order.join(", "));

    if options.limit > 0 {
        sql.push_str(&format!(" LIMIT {}", options.limit));
    }
    if options.skip > 0 {
        sql.push_str(&format!(" OFFSET {}", options.skip));
    }
    sql
}

fn decode_row(row: &PgRow) -> Result<Document, DbError> {
    let json: serde_json::Value = row.try_get("doc")?;
    Ok(Document::try_from(json)?)
}

fn index_keys_json(index: &IndexModel) -> serde_json::Value {
    index
        .keys
        .iter()
        .map(|(field, order)| serde_json::json!([field, direction(*order)]))
        .collect()
}

fn index_keys_from_json(json: &serde_json::Value) -> Vec<(String, SortOrder)> {
    json.as_array()
        .map(|pairs| {
            pairs
                .iter()
                .filter_map(|pair| {
                    let field = pair.get(0)?.as_str()?;
                    let order = match pair.get(1)?.as_str()? {
                        "DESC" => SortOrder::Descending,
                        _ => SortOrder::Ascending,
                    };
                    Some((field.to_string(), order))
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl Collection for PgCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn insert(&self, mut doc: Document) -> Result<Value, DbError> {
        let id = ensure_id(&mut doc);
        let json: serde_json::Value = doc.into();

        sqlx::query(&format!("INSERT INTO {} (doc) VALUES ($1)", self.table))
            .bind(json)
            .execute(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db) if db.is_unique_violation() => DbError::DuplicateKey {
                    index: db.constraint().unwrap_or("unknown").to_string(),
                    key: id.to_string(),
                },
                other => DbError::Sqlx(other),
            })?;
        Ok(id)
    }

    async fn find(&self, filter: Document, options: FindOptions) -> Result<DocumentStream, DbError> {
        let sql = select_sql(&self.table, &options);
        let filter: serde_json::Value = filter.into();
        let pool = self.pool.clone();

        // The row stream holds a pooled connection until it is dropped.
        let docs = stream! {
            let mut rows = sqlx::query(&sql).bind(filter).fetch(&pool);
            loop {
                match rows.try_next().await {
                    Ok(Some(row)) => yield decode_row(&row),
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(DbError::from(e));
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(docs))
    }

    async fn find_one(&self, filter: Document) -> Result<Option<Document>, DbError> {
        let sql = select_sql(&self.table, &FindOptions::default().limit(1));
        let filter: serde_json::Value = filter.into();
        let row = sqlx::query(&sql)
            .bind(filter)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| decode_row(&r)).transpose()
    }

    async fn create_index(&self, index: IndexModel) -> Result<(), DbError> {
        let existing = self
            .list_indexes()
            .await?
            .into_iter()
            .find(|i| i.name == index.name);
        if let Some(existing) = existing {
            if existing.same_definition(&index) {
                return Ok(());
            }
            return Err(DbError::IndexConflict(index.name));
        }

        sqlx::query(&create_index_sql(&self.name, &self.table, &index)?)
            .execute(&self.pool)
            .await?;
        sqlx::query(&format!(
            "INSERT INTO {} (collection, name, keys, is_unique) VALUES ($1, $2, $3, $4)
             ON CONFLICT (collection, name) DO NOTHING",
            INDEX_CATALOG
        ))
        .bind(&self.name)
        .bind(&index.name)
        .bind(index_keys_json(&index))
        .bind(index.unique)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_indexes(&self) -> Result<Vec<IndexModel>, DbError> {
        let rows = sqlx::query(&format!(
            "SELECT name, keys, is_unique FROM {} WHERE collection = $1 ORDER BY name",
            INDEX_CATALOG
        ))
        .bind(&self.name)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let keys: serde_json::Value = row.try_get("keys")?;
                Ok(IndexModel {
                    name: row.try_get("name")?,
                    keys: index_keys_from_json(&keys),
                    unique: row.try_get("is_unique")?,
                    background: true,
                })
            })
            .collect()
    }

    async fn delete_many(&self, filter: Document) -> Result<u64, DbError> {
        let filter: serde_json::Value = filter.into();
        let result = sqlx::query(&format!("DELETE FROM {} WHERE doc @> $1", self.table))
            .bind(filter)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unsafe_names() {
        assert!(quote_ident("fs.chunks").is_ok());
        assert!(matches!(
            quote_ident("fs\"; DROP TABLE x; --"),
            Err(DbError::InvalidName(_))
        ));
        assert!(quote_ident("").is_err());
    }

    #[test]
    fn select_orders_then_paginates() {
        let opts = FindOptions::sorted_by("n", SortOrder::Ascending)
            .skip(1)
            .limit(1);
        assert_eq!(
            select_sql("\"fs.chunks\"", &opts),
            "SELECT doc FROM \"fs.chunks\" WHERE doc @> $1 \
             ORDER BY (doc -> 'n') ASC, pk ASC LIMIT 1 OFFSET 1"
        );
    }

    #[test]
    fn select_without_options_keeps_insertion_order() {
        assert_eq!(
            select_sql("\"fs.files\"", &FindOptions::default()),
            "SELECT doc FROM \"fs.files\" WHERE doc @> $1 ORDER BY pk ASC"
        );
    }

    #[test]
    fn projection_is_built_in_sql() {
        let opts = FindOptions::sorted_by("n", SortOrder::Ascending).project(&["data"]);
        assert_eq!(
            select_sql("\"fs.chunks\"", &opts),
            "SELECT COALESCE((SELECT jsonb_object_agg(key, value) FROM jsonb_each(doc) \
             WHERE key IN ('_id', 'data')), '{}'::jsonb) AS doc \
             FROM \"fs.chunks\" WHERE doc @> $1 ORDER BY (doc -> 'n') ASC, pk ASC"
        );
    }

    #[test]
    fn dollar_fields_use_their_stored_names() {
        assert_eq!(field_expr("$weird"), "(doc -> '$$weird')");
        assert_eq!(field_expr("it's"), "(doc -> 'it''s')");
    }

    #[test]
    fn compound_unique_index() {
        let index = IndexModel::new(
            "chunksindex",
            &[("files_id", SortOrder::Ascending), ("n", SortOrder::Ascending)],
        )
        .unique();
        assert_eq!(
            create_index_sql("fs.chunks", "\"fs.chunks\"", &index).unwrap(),
            "CREATE UNIQUE INDEX IF NOT EXISTS \"fs.chunks_chunksindex\" ON \"fs.chunks\" \
             ((doc -> 'files_id') ASC, (doc -> 'n') ASC)"
        );
    }

    #[test]
    fn index_keys_survive_the_catalog() {
        let index = IndexModel::new(
            "filesindex",
            &[("filename", SortOrder::Ascending), ("uploadDate", SortOrder::Descending)],
        );
        assert_eq!(index_keys_from_json(&index_keys_json(&index)), index.keys);
    }

    /// Needs a reachable server in DATABASE_URL.
    #[tokio::test]
    #[ignore]
    async fn insert_and_find_against_postgres() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let db = PgDatabase::connect(&url).await.expect("connect");
        let coll = db
            .collection(&format!("test-{}.chunks", uuid::Uuid::new_v4().simple()))
            .await
            .expect("bind");

        let files_id = uuid::Uuid::new_v4();
        for n in [2, 0, 1] {
            coll.insert(Document::new().with("files_id", files_id).with("n", n))
                .await
                .expect("insert");
        }

        let docs: Vec<Document> = coll
            .find(
                Document::new().with("files_id", files_id),
                FindOptions::sorted_by("n", SortOrder::Ascending),
            )
            .await
            .expect("find")
            .try_collect()
            .await
            .expect("collect");
        let ns: Vec<i32> = docs.iter().filter_map(|d| d.get_i32("n")).collect();
        assert_eq!(ns, vec![0, 1, 2]);
    }
}
