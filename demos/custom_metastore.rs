use appencryption::{
    envelope::EnvelopeKeyRecord,
    kms::StaticKeyManagementService,
    policy::CryptoPolicy,
    session::{Session, SessionFactory},
    Error, Metastore, Result,
};
use async_trait::async_trait;
use securememory::protected_memory::DefaultSecretFactory;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Example demonstrating how to implement a custom Metastore for Asherah.
///
/// This example shows:
/// 1. How to create a custom Metastore implementation
/// 2. How to integrate the custom Metastore with Asherah
/// 3. Basic encrypt/decrypt operations using the custom Metastore

#[derive(Error, Debug)]
enum RedisMetastoreError {
    #[error("Failed to acquire lock: {0}")]
    LockError(String),

    #[error("System time error: {0}")]
    TimeError(#[from] std::time::SystemTimeError),
}

impl From<RedisMetastoreError> for Error {
    fn from(error: RedisMetastoreError) -> Self {
        Error::Metastore(error.to_string())
    }
}

/// A simple Redis-like Metastore implementation.
///
/// This is a simplified example that stores keys in memory with Redis-like TTL features.
/// In a real application, this would connect to a Redis server.
#[derive(Debug)]
struct RedisMetastore {
    /// In-memory storage map for keys
    store: RwLock<HashMap<String, (EnvelopeKeyRecord, i64, Option<i64>)>>,
}

impl RedisMetastore {
    /// Create a new RedisMetastore
    fn new() -> Self {
        Self {
            store: RwLock::new(HashMap::new()),
        }
    }

    /// Generate a key string from id and created timestamp
    fn generate_key(id: &str, created: i64) -> String {
        format!("{}_{}", id, created)
    }

    /// Set a TTL (time-to-live) for a key in seconds
    async fn expire(
        &self,
        id: &str,
        created: i64,
        ttl_seconds: i64,
    ) -> std::result::Result<bool, RedisMetastoreError> {
        let key = Self::generate_key(id, created);
        let mut store = self
            .store
            .write()
            .map_err(|e| RedisMetastoreError::LockError(e.to_string()))?;

        if let Some(entry) = store.get_mut(&key) {
            let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;
            entry.2 = Some(now + ttl_seconds);
            return Ok(true);
        }

        Ok(false)
    }

    /// Check if a key is expired
    fn is_expired_at(expire_at: Option<i64>) -> std::result::Result<bool, RedisMetastoreError> {
        if let Some(expire_time) = expire_at {
            let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;
            return Ok(now >= expire_time);
        }
        Ok(false)
    }
}

#[async_trait]
impl Metastore for RedisMetastore {
    async fn load(&self, id: &str, created: i64) -> Result<Option<EnvelopeKeyRecord>> {
        let key = Self::generate_key(id, created);
        let store = self
            .store
            .read()
            .map_err(|e| Error::Metastore(format!("Failed to acquire read lock: {}", e)))?;

        match store.get(&key) {
            Some((record, _, expire_at)) => {
                if Self::is_expired_at(*expire_at)
                    .map_err(|e| Error::Metastore(format!("Error checking expiration: {}", e)))?
                {
                    return Ok(None);
                }
                Ok(Some(record.clone()))
            }
            None => Ok(None),
        }
    }

    async fn load_latest(&self, id: &str) -> Result<Option<EnvelopeKeyRecord>> {
        let store = self
            .store
            .read()
            .map_err(|e| Error::Metastore(format!("Failed to acquire read lock: {}", e)))?;

        let mut latest_created = 0;
        let mut latest_record = None;
        let prefix = format!("{}_", id);

        for (key, (record, created, expire_at)) in store.iter() {
            if key.starts_with(&prefix) && *created > latest_created {
                if Self::is_expired_at(*expire_at)
                    .map_err(|e| Error::Metastore(format!("Error checking expiration: {}", e)))?
                {
                    continue;
                }

                latest_created = *created;
                latest_record = Some(record.clone());
            }
        }

        Ok(latest_record)
    }

    async fn store(&self, id: &str, created: i64, envelope: &EnvelopeKeyRecord) -> Result<bool> {
        let key = Self::generate_key(id, created);
        let mut store = self
            .store
            .write()
            .map_err(|e| Error::Metastore(format!("Failed to acquire write lock: {}", e)))?;

        if !store.contains_key(&key) {
            store.insert(key, (envelope.clone(), created, None));
            return Ok(true);
        }

        Ok(false)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("Custom Metastore Example");
    println!("=======================");

    let metastore = Arc::new(RedisMetastore::new());

    use chrono::TimeDelta;
    let expire_after = TimeDelta::hours(24);
    let cache_max_age = TimeDelta::hours(2);
    let create_date_precision = TimeDelta::minutes(1);

    let policy = CryptoPolicy::new()
        .with_expire_after(expire_after.to_std().unwrap())
        .with_session_cache()
        .with_session_cache_duration(cache_max_age.to_std().unwrap())
        .with_create_date_precision(create_date_precision.to_std().unwrap());

    let master_key = vec![0_u8; 32]; // In a real app, use a secure key
    let kms = Arc::new(StaticKeyManagementService::new(master_key));
    let secret_factory = Arc::new(DefaultSecretFactory::new());

    let factory = Arc::new(SessionFactory::new(
        "service",
        "product",
        policy,
        kms,
        metastore.clone(),
        secret_factory,
        vec![],
    ));

    let alice_session = factory.session("alice").await?;
    let bob_session = factory.session("bob").await?;

    let alice_data = b"Alice's secret data".to_vec();
    let alice_encrypted = alice_session.encrypt(&alice_data).await?;
    println!(
        "Encrypted Alice's data: {} bytes",
        alice_encrypted.data.len()
    );

    let bob_data = b"Bob's confidential information".to_vec();
    let bob_encrypted = bob_session.encrypt(&bob_data).await?;
    println!("Encrypted Bob's data: {} bytes", bob_encrypted.data.len());

    let alice_decrypted = alice_session.decrypt(&alice_encrypted).await?;
    let bob_decrypted = bob_session.decrypt(&bob_encrypted).await?;

    println!(
        "Alice's decrypted data: {}",
        String::from_utf8_lossy(&alice_decrypted)
    );
    println!(
        "Bob's decrypted data: {}",
        String::from_utf8_lossy(&bob_decrypted)
    );

    // Demonstration of Redis-like TTL feature
    let system_key_id = "_SK_service_product".to_string();

    let store = metastore
        .store
        .read()
        .map_err(|e| format!("Failed to acquire read lock: {}", e))?;
    let mut some_key_created = None;
    let prefix = format!("{}_", system_key_id);

    for (key, (_, created, _)) in store.iter() {
        if key.starts_with(&prefix) {
            some_key_created = Some(*created);
            break;
        }
    }

    drop(store);

    if let Some(created) = some_key_created {
        println!("Setting a TTL of 60 seconds on a system key...");
        metastore
            .expire(&system_key_id, created, 60)
            .await
            .map_err(|e| format!("Failed to set TTL: {}", e))?;
    }

    alice_session.close().await?;
    bob_session.close().await?;

    println!("Sessions closed. All operations successful!");

    Ok(())
}
