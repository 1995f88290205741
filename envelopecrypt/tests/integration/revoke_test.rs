// Tests verifying that revoking a stored intermediate key record propagates: once the
// revoke-check interval elapses, the cache stops serving the revoked key and the next
// encrypt mints a fresh one, while ciphertext produced under the revoked key remains
// decryptable.

use crate::integration::common::{
    create_static_kms, ORIGINAL_DATA, PARTITION_ID, PRODUCT, SERVICE,
};
use appencryption::{envelope::EnvelopeKeyRecord, CryptoPolicy, Error, Metastore, Session, SessionFactory};
use async_trait::async_trait;
use securememory::protected_memory::DefaultSecretFactory;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::sleep;

/// A minimal in-memory metastore that, unlike `InMemoryMetastore`, exposes a way to
/// flip a stored record's `revoked` flag directly -- something only an out-of-band
/// admin tool would do against a real metastore, never the library itself.
#[derive(Debug)]
struct RevokableMetastore {
    store: RwLock<HashMap<(String, i64), EnvelopeKeyRecord>>,
}

impl RevokableMetastore {
    fn new() -> Self {
        Self {
            store: RwLock::new(HashMap::new()),
        }
    }

    /// Marks the record for `(id, created)` as revoked. Returns whether it existed.
    fn revoke(&self, id: &str, created: i64) -> bool {
        let mut store = self.store.write().unwrap();
        match store.get_mut(&(id.to_string(), created)) {
            Some(record) => {
                record.revoked = Some(true);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl Metastore for RevokableMetastore {
    async fn load(&self, id: &str, created: i64) -> Result<Option<EnvelopeKeyRecord>, Error> {
        let store = self.store.read().unwrap();
        Ok(store.get(&(id.to_string(), created)).cloned())
    }

    async fn load_latest(&self, id: &str) -> Result<Option<EnvelopeKeyRecord>, Error> {
        let store = self.store.read().unwrap();
        Ok(store
            .iter()
            .filter(|((rid, _), _)| rid == id)
            .max_by_key(|((_, created), _)| *created)
            .map(|(_, record)| record.clone()))
    }

    async fn store(
        &self,
        id: &str,
        created: i64,
        envelope: &EnvelopeKeyRecord,
    ) -> Result<bool, Error> {
        let mut store = self.store.write().unwrap();
        let key = (id.to_string(), created);
        if store.contains_key(&key) {
            return Ok(false);
        }
        store.insert(key, envelope.clone());
        Ok(true)
    }
}

#[tokio::test]
async fn test_revoke_propagation() {
    if option_env!("SKIP_SLOW_TESTS").is_some() {
        return;
    }

    // Short revoke-check interval so the test doesn't wait on the default hour-long
    // one, and zero create-date precision so the two minted intermediate keys get
    // distinct second-resolution timestamps instead of colliding on the same rounded
    // minute (see `new_key_timestamp`).
    let mut policy = CryptoPolicy::new();
    policy.revoke_check_interval = Duration::from_secs(1);
    policy.create_date_precision = Duration::from_secs(0);

    let kms = create_static_kms().await;
    let metastore = Arc::new(RevokableMetastore::new());
    let metastore_arc: Arc<dyn Metastore> = metastore.clone();

    let factory = SessionFactory::new(
        SERVICE,
        PRODUCT,
        policy,
        kms,
        metastore_arc,
        Arc::new(DefaultSecretFactory::new()),
        vec![],
    );

    let session = factory
        .session(PARTITION_ID)
        .await
        .expect("Failed to get session");

    let data = ORIGINAL_DATA.as_bytes().to_vec();
    let first = session
        .encrypt(&data)
        .await
        .expect("Failed to encrypt data");

    let ik_meta = first
        .key
        .parent_key_meta
        .clone()
        .expect("DRR must carry intermediate key metadata");

    assert!(
        metastore.revoke(&ik_meta.id, ik_meta.created),
        "expected a stored intermediate key record at {}:{}",
        ik_meta.id,
        ik_meta.created
    );

    // Ciphertext already produced under the now-revoked key must stay decryptable.
    let decrypted = session
        .decrypt(&first)
        .await
        .expect("decrypting with a revoked intermediate key must still succeed");
    assert_eq!(ORIGINAL_DATA.as_bytes(), decrypted.as_slice());

    // Wait past the revoke-check interval so the cached "latest" intermediate key is
    // treated as stale and re-resolved against the metastore on the next encrypt.
    sleep(Duration::from_secs(2)).await;

    let second = session
        .encrypt(&data)
        .await
        .expect("Failed to encrypt data");
    let second_meta = second
        .key
        .parent_key_meta
        .clone()
        .expect("DRR must carry intermediate key metadata");

    assert_ne!(
        second_meta.created, ik_meta.created,
        "revoking the intermediate key should force a new one to be minted on the next encrypt"
    );

    // The freshly minted key must itself be usable for new data.
    let redecrypted = session
        .decrypt(&second)
        .await
        .expect("decrypting with the freshly minted intermediate key must succeed");
    assert_eq!(ORIGINAL_DATA.as_bytes(), redecrypted.as_slice());
}
