use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::bson::{doc, oid::ObjectId};
use mongodb::options::{ClientOptions, FindOptions};
use mongodb::{Client, Collection};
use serde::{Serialize, Deserialize};
use thiserror::Error;
use tracing::debug;

use crate::cli::config::StorageSettings;

/// Errors raised by the document store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("mongodb error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    #[error("store did not return an ObjectId for the inserted document")]
    MissingId,

    #[error("invalid document id: {0}")]
    InvalidId(String),
}

/// A fetched page about to be persisted
#[derive(Debug, Clone, PartialEq)]
pub struct NewDocument {
    pub url: String,
    pub html: String,
    pub created_at: DateTime<Utc>,
}

/// A persisted page
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    /// Hex ObjectId
    pub id: String,
    pub url: String,
    pub html: String,

    /// Unix seconds
    pub created_at: i64,
}

/// One page of stored documents plus the collection total
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentPage {
    pub total: u64,
    pub documents: Vec<StoredDocument>,
}

/// Durable sink for fetched pages
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Persist a document and return its assigned id
    async fn insert_document(&self, document: &NewDocument) -> Result<String, StoreError>;

    async fn find_document(&self, id: &str) -> Result<Option<StoredDocument>, StoreError>;

    /// Documents ordered by creation time; `page` is 1-based
    async fn list_documents(&self, page: u64, page_size: u64) -> Result<DocumentPage, StoreError>;
}

/// Layout of one page in the collection
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PageRecord {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    id: Option<ObjectId>,
    url: String,
    html: String,
    #[serde(rename = "createdAt")]
    created_at: i64,
}

impl PageRecord {
    fn into_stored(self) -> Result<StoredDocument, StoreError> {
        let id = self.id.ok_or(StoreError::MissingId)?;

        Ok(StoredDocument {
            id: id.to_hex(),
            url: self.url,
            html: self.html,
            created_at: self.created_at,
        })
    }
}

impl From<&NewDocument> for PageRecord {
    fn from(document: &NewDocument) -> Self {
        Self {
            id: None,
            url: document.url.clone(),
            html: document.html.clone(),
            created_at: document.created_at.timestamp(),
        }
    }
}

/// Offset of a 1-based page; page 0 is treated as page 1
fn page_offset(page: u64, page_size: u64) -> u64 {
    page.saturating_sub(1).saturating_mul(page_size)
}

/// MongoDB implementation of the document store
pub struct MongoDocumentStore {
    collection: Collection<PageRecord>,
}

impl MongoDocumentStore {
    /// Connect to the collection described by `settings`
    pub async fn new(settings: &StorageSettings) -> anyhow::Result<Self> {
        use anyhow::Context;

        let client_options = ClientOptions::parse(&settings.connection_string)
            .await
            .context("Failed to parse MongoDB connection string")?;

        let client = Client::with_options(client_options)
            .context("Failed to create MongoDB client")?;

        let database = client.database(&settings.database_name);

        // Test connection
        database.list_collection_names(None)
            .await
            .context("Failed to connect to MongoDB")?;

        debug!(
            "Connected to MongoDB collection {}.{}",
            settings.database_name, settings.collection
        );

        Ok(Self {
            collection: database.collection(&settings.collection),
        })
    }
}

#[async_trait]
impl DocumentStore for MongoDocumentStore {
    async fn insert_document(&self, document: &NewDocument) -> Result<String, StoreError> {
        let result = self.collection.insert_one(PageRecord::from(document), None).await?;

        let id = result.inserted_id.as_object_id().ok_or(StoreError::MissingId)?;
        debug!("Stored document {} for URL: {}", id, document.url);

        Ok(id.to_hex())
    }

    async fn find_document(&self, id: &str) -> Result<Option<StoredDocument>, StoreError> {
        let oid = ObjectId::parse_str(id).map_err(|_| StoreError::InvalidId(id.to_string()))?;

        match self.collection.find_one(doc! { "_id": oid }, None).await? {
            Some(record) => Ok(Some(record.into_stored()?)),
            None => Ok(None),
        }
    }

    async fn list_documents(&self, page: u64, page_size: u64) -> Result<DocumentPage, StoreError> {
        let total = self.collection.count_documents(None, None).await?;

        let options = FindOptions::builder()
            .sort(doc! { "createdAt": 1 })
            .skip(page_offset(page, page_size))
            .limit(page_size as i64)
            .build();

        let records: Vec<PageRecord> = self.collection.find(None, options).await?.try_collect().await?;
        let documents = records
            .into_iter()
            .map(PageRecord::into_stored)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(DocumentPage { total, documents })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_record_field_names() {
        let document = NewDocument {
            url: "https://example.com/".to_string(),
            html: "<html></html>".to_string(),
            created_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        };

        let bson = mongodb::bson::to_document(&PageRecord::from(&document)).unwrap();

        assert_eq!(bson.get_str("url").unwrap(), "https://example.com/");
        assert_eq!(bson.get_str("html").unwrap(), "<html></html>");
        assert_eq!(bson.get_i64("createdAt").unwrap(), 1_700_000_000);
        assert!(!bson.contains_key("_id"));
    }

    #[test]
    fn test_record_converts_to_hex_id() {
        let oid = ObjectId::new();
        let record = PageRecord {
            id: Some(oid),
            url: "https://example.com/a".to_string(),
            html: String::new(),
            created_at: 42,
        };

        let stored = record.into_stored().unwrap();
        assert_eq!(stored.id, oid.to_hex());
        assert_eq!(stored.created_at, 42);

        let orphan = PageRecord { id: None, url: String::new(), html: String::new(), created_at: 0 };
        assert!(matches!(orphan.into_stored(), Err(StoreError::MissingId)));
    }

    #[test]
    fn test_page_offset() {
        assert_eq!(page_offset(1, 10), 0);
        assert_eq!(page_offset(3, 10), 20);
        assert_eq!(page_offset(0, 10), 0);
    }
}
