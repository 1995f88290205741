// Tests to verify correct metastore interactions during encryption/decryption

use crate::integration::common::{
    create_crypto, create_static_kms, create_test_config, ORIGINAL_DATA, PARTITION_ID, PRODUCT,
    SERVICE,
};
use appencryption::key::cache::{AnyCache, CacheKeyType, KeyCache, KeyCacher};
use appencryption::key::CryptoKey;
use appencryption::partition::{DefaultPartition, Partition};
use appencryption::{
    envelope::{encryption::EnvelopeEncryptionBuilder, EnvelopeKeyRecord, KeyMeta},
    metastore::InMemoryMetastore,
    Aead, Encryption, Error, KeyManagementService, Metastore, Session, SessionFactory,
};
use async_trait::async_trait;
use securememory::protected_memory::DefaultSecretFactory;
use std::fmt;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

#[derive(Debug, Clone)]
enum MetastoreOperation {
    Load { id: String, created: i64 },
    LoadLatest { id: String },
    Store { id: String, created: i64 },
}

impl fmt::Display for MetastoreOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetastoreOperation::Load { id, created } => {
                write!(f, "Load(id={}, created={})", id, created)
            }
            MetastoreOperation::LoadLatest { id } => write!(f, "LoadLatest(id={})", id),
            MetastoreOperation::Store { id, created } => {
                write!(f, "Store(id={}, created={})", id, created)
            }
        }
    }
}

// A metastore wrapper that tracks all operations
struct TrackingMetastore<M: Metastore> {
    inner: Arc<M>,
    operations: Arc<Mutex<Vec<MetastoreOperation>>>,
    load_count: AtomicUsize,
    load_latest_count: AtomicUsize,
    store_count: AtomicUsize,
}

impl<M: Metastore> fmt::Debug for TrackingMetastore<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackingMetastore")
            .field("load_count", &self.load_count)
            .field("load_latest_count", &self.load_latest_count)
            .field("store_count", &self.store_count)
            .finish()
    }
}

impl<M: Metastore> TrackingMetastore<M> {
    fn new(inner: Arc<M>) -> Self {
        Self {
            inner,
            operations: Arc::new(Mutex::new(Vec::new())),
            load_count: AtomicUsize::new(0),
            load_latest_count: AtomicUsize::new(0),
            store_count: AtomicUsize::new(0),
        }
    }

    fn get_operations(&self) -> Vec<MetastoreOperation> {
        self.operations.lock().unwrap().clone()
    }

    fn get_operation_counts(&self) -> (usize, usize, usize) {
        (
            self.load_count.load(Ordering::SeqCst),
            self.load_latest_count.load(Ordering::SeqCst),
            self.store_count.load(Ordering::SeqCst),
        )
    }

    // Per-id breakdown of (load, load_latest, store) calls, needed to check the
    // matrix's per-key-type predicates rather than just aggregate totals.
    fn count_ops_for(&self, id: &str) -> (usize, usize, usize) {
        let mut load = 0;
        let mut load_latest = 0;
        let mut store = 0;

        for op in self.get_operations() {
            match op {
                MetastoreOperation::Load { id: i, .. } if i == id => load += 1,
                MetastoreOperation::LoadLatest { id: i } if i == id => load_latest += 1,
                MetastoreOperation::Store { id: i, .. } if i == id => store += 1,
                _ => {}
            }
        }

        (load, load_latest, store)
    }
}

#[async_trait]
impl<M: Metastore> Metastore for TrackingMetastore<M> {
    async fn load(&self, id: &str, created: i64) -> Result<Option<EnvelopeKeyRecord>, Error> {
        self.load_count.fetch_add(1, Ordering::SeqCst);

        self.operations
            .lock()
            .unwrap()
            .push(MetastoreOperation::Load {
                id: id.to_string(),
                created,
            });

        self.inner.load(id, created).await
    }

    async fn load_latest(&self, id: &str) -> Result<Option<EnvelopeKeyRecord>, Error> {
        self.load_latest_count.fetch_add(1, Ordering::SeqCst);

        self.operations
            .lock()
            .unwrap()
            .push(MetastoreOperation::LoadLatest { id: id.to_string() });

        self.inner.load_latest(id).await
    }

    async fn store(
        &self,
        id: &str,
        created: i64,
        envelope: &EnvelopeKeyRecord,
    ) -> Result<bool, Error> {
        self.store_count.fetch_add(1, Ordering::SeqCst);

        self.operations
            .lock()
            .unwrap()
            .push(MetastoreOperation::Store {
                id: id.to_string(),
                created,
            });

        self.inner.store(id, created, envelope).await
    }
}

#[tokio::test]
async fn test_encrypt_metastore_interactions() {
    // Create dependencies
    let config = create_test_config();
    let _crypto = create_crypto();
    let kms = create_static_kms().await;

    // Create a basic metastore
    let inner_metastore = Arc::new(InMemoryMetastore::new());

    // Wrap it with our tracking metastore
    let tracking_metastore = Arc::new(TrackingMetastore::new(inner_metastore));

    // Create session factory (need to pass metastore as Arc<dyn Metastore>)
    let metastore: Arc<dyn Metastore> = tracking_metastore.clone();
    let policy = (*config.policy).clone();
    let factory = SessionFactory::new(
        config.service,
        config.product,
        policy,
        kms,
        metastore,
        Arc::new(DefaultSecretFactory::new()),
        vec![], // Empty options
    );

    // Get session
    let session = factory
        .session(PARTITION_ID)
        .await
        .expect("Failed to get session");

    // Reset counts
    let _ = tracking_metastore.get_operations();

    // Encrypt data for the first time - this should create a new DRK and store it
    let data = ORIGINAL_DATA.as_bytes().to_vec();
    let _drr = session
        .encrypt(&data)
        .await
        .expect("Failed to encrypt data");

    // Get operation counts
    let (load_count, load_latest_count, store_count) = tracking_metastore.get_operation_counts();
    let operations = tracking_metastore.get_operations();

    // Check expected operations
    // For a first-time encryption, we expect:
    // 1. LoadLatest for Intermediate Key
    // 2. LoadLatest for System Key (parent)
    // 3. Store for System Key if it doesn't exist
    // 4. Store for Intermediate Key if it doesn't exist
    // 5. No direct Load operations
    assert_eq!(load_count, 0, "Should have no direct Load operations");
    assert!(
        load_latest_count >= 1,
        "Should have at least one LoadLatest operation"
    );
    assert!(store_count >= 1, "Should have at least one Store operation");

    // Verify the IK key ID format
    let expected_ik_id = format!("_IK_{}_{}_{}", PARTITION_ID, SERVICE, PRODUCT);

    // Check for operations referencing the IK
    let has_ik_operations = operations.iter().any(|op| match op {
        MetastoreOperation::LoadLatest { id } => id == &expected_ik_id,
        MetastoreOperation::Store { id, .. } => id == &expected_ik_id,
        _ => false,
    });

    assert!(has_ik_operations, "Should have operations for IK");
}

#[tokio::test]
async fn test_decrypt_metastore_interactions() {
    // Create dependencies
    let config = create_test_config();
    let _crypto = create_crypto();
    let kms = create_static_kms().await;

    // Create a basic metastore
    let inner_metastore = Arc::new(InMemoryMetastore::new());

    // Create a session factory directly with the inner metastore first
    let policy_clone = (*config.policy).clone();
    let inner_factory = SessionFactory::new(
        config.service.clone(),
        config.product.clone(),
        policy_clone,
        kms.clone(),
        inner_metastore.clone(),
        Arc::new(DefaultSecretFactory::new()),
        vec![], // Empty options
    );

    // Get session and encrypt some data to have a valid DRR for testing
    let inner_session = inner_factory
        .session(PARTITION_ID)
        .await
        .expect("Failed to get session");

    let data = ORIGINAL_DATA.as_bytes().to_vec();
    let drr = inner_session
        .encrypt(&data)
        .await
        .expect("Failed to encrypt data");

    // Now create a tracking metastore wrapping the inner one
    let tracking_metastore = Arc::new(TrackingMetastore::new(inner_metastore));

    // Create a new session factory with the tracking metastore
    let policy = (*config.policy).clone();
    let metastore: Arc<dyn Metastore> = tracking_metastore.clone();
    let factory = SessionFactory::new(
        config.service,
        config.product,
        policy,
        kms,
        metastore,
        Arc::new(DefaultSecretFactory::new()),
        vec![], // Empty options
    );

    // Get session
    let session = factory
        .session(PARTITION_ID)
        .await
        .expect("Failed to get session");

    // Reset counts
    let _ = tracking_metastore.get_operations();

    // Decrypt the data
    let decrypted = session.decrypt(&drr).await.expect("Failed to decrypt data");

    // Check decryption was successful
    assert_eq!(ORIGINAL_DATA.as_bytes(), decrypted.as_slice());

    // Get operation counts
    let (load_count, load_latest_count, store_count) = tracking_metastore.get_operation_counts();
    let operations = tracking_metastore.get_operations();

    // Check expected operations
    // For decryption, we expect:
    // 1. Load for the Intermediate Key (using the parentKeyMeta from the DRR)
    // 2. Load or LoadLatest for the System Key (parent of IK)
    // 3. No Store operations
    assert!(
        load_count + load_latest_count >= 1,
        "Should have at least one Load/LoadLatest operation"
    );
    assert_eq!(
        store_count, 0,
        "Should not have any Store operations during decrypt"
    );

    // Verify the IK key ID format
    let expected_ik_id = format!("_IK_{}_{}_{}", PARTITION_ID, SERVICE, PRODUCT);

    // Check for operations referencing the IK
    let has_ik_operations = operations.iter().any(|op| match op {
        MetastoreOperation::Load { id, .. } => id == &expected_ik_id,
        MetastoreOperation::LoadLatest { id } => id == &expected_ik_id,
        _ => false,
    });

    assert!(has_ik_operations, "Should have load operations for IK");
}

#[tokio::test]
async fn test_metastore_caching_behavior() {
    // Create dependencies
    let config = create_test_config();
    let _crypto = create_crypto();
    let kms = create_static_kms().await;

    // Create a basic metastore
    let inner_metastore = Arc::new(InMemoryMetastore::new());

    // Wrap it with our tracking metastore
    let tracking_metastore = Arc::new(TrackingMetastore::new(inner_metastore));

    // Create a session factory
    let policy = (*config.policy).clone();
    let metastore: Arc<dyn Metastore> = tracking_metastore.clone();
    let factory = SessionFactory::new(
        config.service,
        config.product,
        policy,
        kms,
        metastore,
        Arc::new(DefaultSecretFactory::new()),
        vec![], // Empty options
    );

    // Get session
    let session = factory
        .session(PARTITION_ID)
        .await
        .expect("Failed to get session");

    // Reset counts
    let _ = tracking_metastore.get_operations();

    // Encrypt data - first time should do metastore operations
    let data = ORIGINAL_DATA.as_bytes().to_vec();
    let _drr = session
        .encrypt(&data)
        .await
        .expect("Failed to encrypt data");

    // Get operation counts after first encryption
    let (load_count1, load_latest_count1, store_count1) = tracking_metastore.get_operation_counts();

    // Print the operations to see what's happening
    let operations = tracking_metastore.get_operations();
    println!("First encrypt operations: {:?}", operations);

    // Encrypt again - should use cached keys and do fewer metastore operations
    let _drr2 = session
        .encrypt(&data)
        .await
        .expect("Failed to encrypt data");

    // Get operation counts after second encryption
    let (load_count2, load_latest_count2, store_count2) = tracking_metastore.get_operation_counts();

    let operations2 = tracking_metastore.get_operations();
    println!("Second encrypt operations: {:?}", operations2);

    // Debug output
    println!(
        "First encrypt - load: {}, load_latest: {}, store: {}",
        load_count1, load_latest_count1, store_count1
    );
    println!(
        "Second encrypt - load: {}, load_latest: {}, store: {}",
        load_count2, load_latest_count2, store_count2
    );

    // We expect fewer operations on second encrypt due to caching
    assert!(
        load_count2 + load_latest_count2 <= load_count1 + load_latest_count1,
        "Second encrypt should have fewer or equal load operations"
    );

    assert!(
        store_count2 <= store_count1,
        "Second encrypt should have fewer or equal store operations"
    );
}

// --- Metastore-interaction matrix -----------------------------------------------------
//
// The four booleans below are, for one encrypt call:
//   cIK - the intermediate key is already fresh in the IK cache
//   mIK - the metastore holds a currently-usable (not revoked, not expired) IK record
//   cSK - the system key is already fresh in the SK cache
//   mSK - the metastore holds a currently-usable system key record
//
// "Usable" collapses the three nominal record states (valid / retired / empty) into a
// single boolean: `load_create_key`'s own reuse filter (`!revoked && !expired`) treats a
// retired record exactly like a missing one, and `KeyCache::get_fresh` does the same for
// a cached entry that is stale or flagged revoked. That collapse is what takes the
// nominal {valid, retired, empty}^4 domain down to the 16 states actually enumerated here.
//
// Expected call counts per state were derived directly from `load_create_key`: a fresh
// cIK short-circuits the whole resolve (no IK or SK operations at all, since the parent
// system key is now resolved lazily, inside the IK loader, only on a cache miss); a fresh
// cSK short-circuits the system-key resolution only. One combination - cIK=false, mIK=true,
// cSK=false, mSK=false - can't be realized as a clean state: a "currently usable" IK record
// can only decrypt against the system key version that produced it, but with no cached or
// stored system key to reuse, the loader mints a brand new one with unrelated bytes. That
// state is exercised separately below and is expected to surface as a decrypt error rather
// than a set of exact counts, which is itself the behavior worth pinning down.

struct MatrixCase {
    c_ik: bool,
    m_ik: bool,
    c_sk: bool,
    m_sk: bool,
}

struct ExpectedCounts {
    ik_load_latest: usize,
    ik_store: usize,
    sk_load_latest: usize,
    sk_store: usize,
}

fn expected_counts(case: &MatrixCase) -> ExpectedCounts {
    if case.c_ik {
        // A fresh cached IK never even looks at the system key.
        return ExpectedCounts {
            ik_load_latest: 0,
            ik_store: 0,
            sk_load_latest: 0,
            sk_store: 0,
        };
    }

    ExpectedCounts {
        ik_load_latest: 1,
        ik_store: if case.m_ik { 0 } else { 1 },
        sk_load_latest: if case.c_sk { 0 } else { 1 },
        sk_store: if !case.c_sk && !case.m_sk { 1 } else { 0 },
    }
}

async fn prime_cache(cache: &AnyCache, id: &str, key: CryptoKey) {
    cache
        .get_or_load_latest(id, move |_meta| async move { Ok(key) })
        .await
        .expect("priming cache must not invoke the metastore-backed loader");
}

/// Runs one matrix state and returns the resulting EnvelopeEncryption's encrypt outcome
/// plus the per-key-type metastore call counts observed during that single encrypt call.
async fn run_matrix_case(
    case: &MatrixCase,
) -> (
    Result<appencryption::DataRowRecord, Error>,
    ExpectedCounts,
    Arc<TrackingMetastore<InMemoryMetastore>>,
    String,
    String,
) {
    let crypto = create_crypto();
    let kms = create_static_kms().await;
    let secret_factory = Arc::new(DefaultSecretFactory::new());
    let policy = Arc::new(appencryption::policy::CryptoPolicy::new());
    let partition = Arc::new(DefaultPartition::new(PARTITION_ID, SERVICE, PRODUCT));

    let sk_id = partition.system_key_id();
    let ik_id = partition.intermediate_key_id();

    let sk_cache = AnyCache::KeyCache(Arc::new(KeyCache::new(
        CacheKeyType::SystemKeys,
        policy.clone(),
    )));
    let ik_cache = AnyCache::KeyCache(Arc::new(KeyCache::new(
        CacheKeyType::IntermediateKeys,
        policy.clone(),
    )));

    let inner_metastore = Arc::new(InMemoryMetastore::new());

    // Resolve what the system key bytes backing a pre-seeded IK record (if any) will
    // actually be at resolve time, so the IK's ciphertext decrypts successfully.
    let sk_bytes: Option<Vec<u8>> = if case.c_sk {
        let bytes = vec![7_u8; appencryption::AES256_KEY_SIZE];
        let crypto_key = CryptoKey::new(sk_id.clone(), 1_111, bytes.clone(), secret_factory.as_ref())
            .expect("build system key");
        prime_cache(&sk_cache, &sk_id, crypto_key).await;

        if case.m_sk {
            let encrypted = kms.encrypt_key(&bytes).await.expect("encrypt system key");
            let record = EnvelopeKeyRecord {
                id: sk_id.clone(),
                created: 1_111,
                encrypted_key: encrypted,
                revoked: None,
                parent_key_meta: None,
            };
            inner_metastore
                .store(&sk_id, 1_111, &record)
                .await
                .expect("seed system key record");
        }

        Some(bytes)
    } else if case.m_sk {
        let bytes = vec![9_u8; appencryption::AES256_KEY_SIZE];
        let encrypted = kms.encrypt_key(&bytes).await.expect("encrypt system key");
        let record = EnvelopeKeyRecord {
            id: sk_id.clone(),
            created: 2_222,
            encrypted_key: encrypted,
            revoked: None,
            parent_key_meta: None,
        };
        inner_metastore
            .store(&sk_id, 2_222, &record)
            .await
            .expect("seed system key record");

        Some(bytes)
    } else {
        // No cached or stored usable system key: the loader will mint one with fresh
        // random bytes at resolve time, unknowable ahead of time.
        None
    };

    if case.c_ik {
        // Never invoked by the loader, so arbitrary bytes are fine.
        let crypto_key = CryptoKey::new(
            ik_id.clone(),
            3_333,
            vec![5_u8; appencryption::AES256_KEY_SIZE],
            secret_factory.as_ref(),
        )
        .expect("build intermediate key");
        prime_cache(&ik_cache, &ik_id, crypto_key).await;
    } else if case.m_ik {
        let ik_raw = vec![3_u8; appencryption::AES256_KEY_SIZE];
        match &sk_bytes {
            Some(bytes) => {
                let encrypted = crypto.encrypt(&ik_raw, bytes).expect("encrypt IK with parent");
                let record = EnvelopeKeyRecord {
                    id: ik_id.clone(),
                    created: 4_444,
                    encrypted_key: encrypted,
                    revoked: None,
                    parent_key_meta: Some(KeyMeta::new(sk_id.clone(), 1_111)),
                };
                inner_metastore
                    .store(&ik_id, 4_444, &record)
                    .await
                    .expect("seed intermediate key record");
            }
            None => {
                // Degenerate state: seed ciphertext under bytes that can never match
                // whatever the loader ends up minting for the system key.
                let bogus_parent = vec![1_u8; appencryption::AES256_KEY_SIZE];
                let encrypted = crypto
                    .encrypt(&ik_raw, &bogus_parent)
                    .expect("encrypt IK with unrelated parent");
                let record = EnvelopeKeyRecord {
                    id: ik_id.clone(),
                    created: 4_444,
                    encrypted_key: encrypted,
                    revoked: None,
                    parent_key_meta: Some(KeyMeta::new(sk_id.clone(), 0)),
                };
                inner_metastore
                    .store(&ik_id, 4_444, &record)
                    .await
                    .expect("seed intermediate key record");
            }
        }
    }

    let tracking_metastore = Arc::new(TrackingMetastore::new(inner_metastore));
    let metastore: Arc<dyn Metastore> = tracking_metastore.clone();

    let engine = EnvelopeEncryptionBuilder::new()
        .with_partition(partition)
        .with_metastore(metastore)
        .with_kms(kms)
        .with_policy(policy)
        .with_crypto(crypto)
        .with_secret_factory(secret_factory)
        .with_sk_cache(sk_cache)
        .with_ik_cache(ik_cache)
        .build()
        .expect("build EnvelopeEncryption");

    let data = ORIGINAL_DATA.as_bytes().to_vec();
    let result = engine.encrypt_payload(&data).await;
    let expected = expected_counts(case);

    (result, expected, tracking_metastore, sk_id, ik_id)
}

#[tokio::test]
async fn test_metastore_interaction_matrix() {
    for c_ik in [false, true] {
        for m_ik in [false, true] {
            for c_sk in [false, true] {
                for m_sk in [false, true] {
                    let case = MatrixCase {
                        c_ik,
                        m_ik,
                        c_sk,
                        m_sk,
                    };

                    // The one architecturally unreachable-as-a-resting-state
                    // combination: a still-usable IK record whose system key was
                    // never cached or stored, so a fresh, unrelated one gets minted.
                    if !c_ik && m_ik && !c_sk && !m_sk {
                        let (result, _, _, _, _) = run_matrix_case(&case).await;
                        assert!(
                            result.is_err(),
                            "cIK=false,mIK=true,cSK=false,mSK=false must surface a decrypt failure, not a silent success: \
                             the resolve path always decrypts the IK against the *currently latest* system key, not the one \
                             that originally encrypted it"
                        );
                        continue;
                    }

                    let (result, expected, tracking, sk_id, ik_id) = run_matrix_case(&case).await;

                    let drr = result.unwrap_or_else(|e| {
                        panic!(
                            "encrypt failed for cIK={} mIK={} cSK={} mSK={}: {:?}",
                            c_ik, m_ik, c_sk, m_sk, e
                        )
                    });
                    assert!(!drr.data.is_empty());

                    let (ik_load, ik_load_latest, ik_store) = tracking.count_ops_for(&ik_id);
                    let (sk_load, sk_load_latest, sk_store) = tracking.count_ops_for(&sk_id);

                    let label = format!("cIK={} mIK={} cSK={} mSK={}", c_ik, m_ik, c_sk, m_sk);

                    assert_eq!(ik_load, 0, "{label}: encrypt never does a point Load(IK)");
                    assert_eq!(sk_load, 0, "{label}: encrypt never does a point Load(SK)");
                    assert_eq!(
                        ik_load_latest, expected.ik_load_latest,
                        "{label}: LoadLatest(IK) count mismatch"
                    );
                    assert_eq!(
                        ik_store, expected.ik_store,
                        "{label}: Store(IK) count mismatch"
                    );
                    assert_eq!(
                        sk_load_latest, expected.sk_load_latest,
                        "{label}: LoadLatest(SK) count mismatch"
                    );
                    assert_eq!(
                        sk_store, expected.sk_store,
                        "{label}: Store(SK) count mismatch"
                    );
                }
            }
        }
    }
}
