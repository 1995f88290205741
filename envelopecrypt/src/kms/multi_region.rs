use crate::error::{Error, Result};
use crate::timer;
use crate::Aead;
use crate::KeyManagementService;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use zeroize::Zeroize;

/// Response from a data-key generation call against a single region's master key.
#[derive(Clone)]
pub struct GenerateDataKeyResponse {
    /// The identifier (ARN or equivalent) of the master key that generated this data key
    pub key_id: String,

    /// The ciphertext form of the data key, as returned by that region's KMS
    pub ciphertext_blob: Vec<u8>,

    /// The plaintext data key; callers must zero this once it is no longer needed
    pub plaintext: Vec<u8>,
}

/// A client capable of performing KMS operations against a single region's master key.
///
/// This is the seam concrete KMS transports (AWS, GCP, a test double, ...) implement;
/// nothing in this module depends on a specific provider's SDK.
#[async_trait]
pub trait RegionalKmsClient: Send + Sync {
    /// Encrypts `plaintext` under the master key identified by `key_id`
    async fn encrypt(&self, key_id: &str, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Decrypts `ciphertext` that was encrypted under the master key identified by `key_id`
    async fn decrypt(&self, key_id: &str, ciphertext: &[u8]) -> Result<Vec<u8>>;

    /// Generates a new data key under the master key identified by `key_id`
    async fn generate_data_key(&self, key_id: &str) -> Result<GenerateDataKeyResponse>;

    /// The region this client talks to
    fn region(&self) -> &str;
}

/// One configured region: a client plus the master-key identifier to use with it.
#[derive(Clone)]
pub struct RegionalClient {
    client: Arc<dyn RegionalKmsClient>,
    pub(crate) region: String,
    pub(crate) master_key_arn: String,
}

impl std::fmt::Debug for RegionalClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionalClient")
            .field("region", &self.region)
            .field("master_key_arn", &self.master_key_arn)
            .finish()
    }
}

impl RegionalClient {
    /// Creates a new RegionalClient
    pub fn new(client: Arc<dyn RegionalKmsClient>, master_key_arn: String) -> Self {
        let region = client.region().to_string();
        Self {
            client,
            region,
            master_key_arn,
        }
    }

    async fn generate_data_key(&self) -> Result<GenerateDataKeyResponse> {
        let _timer = timer!("ael.kms.generatedatakey", "region" => self.region.clone());
        self.client.generate_data_key(&self.master_key_arn).await
    }

    async fn encrypt_key(&self, key_bytes: &[u8]) -> Result<Vec<u8>> {
        let _timer = timer!("ael.kms.encryptkey", "region" => self.region.clone());
        self.client.encrypt(&self.master_key_arn, key_bytes).await
    }

    async fn decrypt_key(&self, encrypted_key: &[u8]) -> Result<Vec<u8>> {
        let _timer = timer!("ael.kms.decryptkey", "region" => self.region.clone());
        self.client
            .decrypt(&self.master_key_arn, encrypted_key)
            .await
    }
}

/// A single region's wrapped copy of the shared data key protecting a System Key.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegionalKek {
    region: String,
    arn: String,
    #[serde(rename = "encryptedKek")]
    encrypted_kek: Vec<u8>,
}

/// The KMS envelope stored as the `encryptedKey` of a System-Key EKR.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "encryptedKey")]
    encrypted_key: Vec<u8>,
    #[serde(rename = "kmsKeks")]
    keks: Vec<RegionalKek>,
}

/// Multi-region KMS adapter: generates a data key in the preferred region,
/// fans out the encryption of that data key to every other configured region,
/// and on decrypt walks regions in priority order until one succeeds.
#[derive(Debug)]
pub struct MultiRegionKms {
    /// Preferred region first, remaining regions in configuration order
    clients: Vec<RegionalClient>,

    /// AEAD used to wrap/unwrap the System Key under the regional data key
    crypto: Arc<dyn Aead>,
}

impl MultiRegionKms {
    /// Creates a new MultiRegionKms from an already-ordered client list
    pub fn new(clients: Vec<RegionalClient>, crypto: Arc<dyn Aead>) -> Self {
        Self { clients, crypto }
    }

    /// Returns the preferred region, i.e. the first entry in the client list
    pub fn preferred_region(&self) -> &str {
        &self.clients[0].region
    }

    async fn generate_data_key(&self) -> Result<GenerateDataKeyResponse> {
        for client in &self.clients {
            match client.generate_data_key().await {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    log::debug!(
                        "error generating data key in region {}, trying next region: {}",
                        client.region,
                        e
                    );
                    continue;
                }
            }
        }

        Err(Error::KmsUnavailable(
            "all regions failed to generate a data key".into(),
        ))
    }

    /// Encrypts the shared data key's plaintext in every other configured region, concurrently.
    async fn encrypt_regional_keks(&self, data_key: &GenerateDataKeyResponse) -> Vec<RegionalKek> {
        let (tx, mut rx) = tokio::sync::mpsc::channel(self.clients.len());

        for client in &self.clients {
            // The source region already has the ciphertext from GenerateDataKey; reuse it.
            if client.master_key_arn == data_key.key_id {
                let kek = RegionalKek {
                    region: client.region.clone(),
                    arn: client.master_key_arn.clone(),
                    encrypted_kek: data_key.ciphertext_blob.clone(),
                };

                let tx_clone = tx.clone();
                tokio::spawn(async move {
                    drop(tx_clone.send(kek).await);
                });

                continue;
            }

            let client_clone = client.clone();
            let plaintext = data_key.plaintext.clone();
            let tx_clone = tx.clone();

            tokio::spawn(async move {
                match client_clone.encrypt_key(&plaintext).await {
                    Ok(encrypted_key) => {
                        let kek = RegionalKek {
                            region: client_clone.region,
                            arn: client_clone.master_key_arn,
                            encrypted_kek: encrypted_key,
                        };
                        drop(tx_clone.send(kek).await);
                    }
                    Err(e) => {
                        log::debug!(
                            "error encrypting data key in region {}: {}",
                            client_clone.region,
                            e
                        );
                    }
                }
            });
        }

        drop(tx);

        let mut result = Vec::new();
        while let Some(kek) = rx.recv().await {
            result.push(kek);
        }

        result
    }
}

#[async_trait]
impl KeyManagementService for MultiRegionKms {
    async fn encrypt_key(&self, key: &[u8]) -> Result<Vec<u8>> {
        let _timer = timer!("ael.kms.encryptkey");

        let data_key = self.generate_data_key().await?;
        let mut plaintext = data_key.plaintext.clone();

        let enc_key_result = self.crypto.encrypt(key, &plaintext);

        // Fan-out must run regardless of whether the wrap above succeeded, so the
        // plaintext data key is zeroed on every path before we return.
        let keks = self.encrypt_regional_keks(&data_key).await;
        plaintext.zeroize();

        let enc_key_bytes =
            enc_key_result.map_err(|e| Error::Kms(format!("error wrapping key: {}", e)))?;

        // At least the source region's entry must survive for the envelope to be decryptable.
        if keks.is_empty() {
            return Err(Error::KmsUnavailable(
                "no region produced a usable kmsKek for this system key".into(),
            ));
        }

        let envelope = Envelope {
            encrypted_key: enc_key_bytes,
            keks,
        };

        serde_json::to_vec(&envelope)
            .map_err(|e| Error::Kms(format!("error marshalling KMS envelope: {}", e)))
    }

    async fn decrypt_key(&self, encrypted_key: &[u8]) -> Result<Vec<u8>> {
        let _timer = timer!("ael.kms.decryptkey");

        let envelope: Envelope = serde_json::from_slice(encrypted_key)
            .map_err(|e| Error::Kms(format!("unable to unmarshal KMS envelope: {}", e)))?;

        let keks: HashMap<String, RegionalKek> = envelope
            .keks
            .into_iter()
            .map(|kek| (kek.region.clone(), kek))
            .collect();

        for client in &self.clients {
            let Some(kek) = keks.get(&client.region) else {
                log::debug!("no kmsKek found for region: {}", client.region);
                continue;
            };

            let mut plaintext = match client.decrypt_key(&kek.encrypted_kek).await {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    log::debug!("KMS decrypt failed in region {}: {}", client.region, e);
                    continue;
                }
            };

            let unwrapped = self.crypto.decrypt(&envelope.encrypted_key, &plaintext);
            plaintext.zeroize();

            match unwrapped {
                Ok(key_bytes) => return Ok(key_bytes),
                Err(e) => {
                    log::debug!("unwrap failed using region {} data key: {}", client.region, e);
                    continue;
                }
            }
        }

        Err(Error::KmsUnavailable(
            "decrypt failed in all configured regions".into(),
        ))
    }
}

/// Builds a [`MultiRegionKms`] from a map of region -> master key arn and a set of
/// per-region clients, ordering the preferred region first.
pub struct MultiRegionKmsBuilder {
    arn_map: HashMap<String, String>,
    crypto: Arc<dyn Aead>,
    preferred_region: Option<String>,
    clients: HashMap<String, Arc<dyn RegionalKmsClient>>,
}

impl MultiRegionKmsBuilder {
    /// Creates a new builder for the given AEAD implementation and region -> arn map
    pub fn new(crypto: Arc<dyn Aead>, arn_map: HashMap<String, String>) -> Result<Self> {
        if arn_map.is_empty() {
            return Err(Error::ConfigInvalid(
                "arn_map must contain at least one region".into(),
            ));
        }

        Ok(Self {
            arn_map,
            crypto,
            preferred_region: None,
            clients: HashMap::new(),
        })
    }

    /// Sets the preferred region, required whenever more than one region is configured
    pub fn with_preferred_region(mut self, region: impl Into<String>) -> Self {
        self.preferred_region = Some(region.into());
        self
    }

    /// Registers the client to use for `region`
    pub fn with_kms_client(
        mut self,
        region: impl Into<String>,
        client: Arc<dyn RegionalKmsClient>,
    ) -> Self {
        self.clients.insert(region.into(), client);
        self
    }

    /// Builds the MultiRegionKms, validating that every configured region has a client
    pub fn build(self) -> Result<MultiRegionKms> {
        if self.arn_map.len() > 1 && self.preferred_region.is_none() {
            return Err(Error::ConfigInvalid(
                "preferred_region must be set when more than one region is configured".into(),
            ));
        }

        let preferred_region = match self.preferred_region {
            Some(region) => region,
            None => self.arn_map.keys().next().unwrap().clone(),
        };

        let mut regional_clients = Vec::new();

        let arn = self.arn_map.get(&preferred_region).ok_or_else(|| {
            Error::ConfigInvalid(format!(
                "preferred region {} not found in arn_map",
                preferred_region
            ))
        })?;
        let client = self.clients.get(&preferred_region).ok_or_else(|| {
            Error::ConfigInvalid(format!(
                "no KMS client provided for preferred region: {}",
                preferred_region
            ))
        })?;
        regional_clients.push(RegionalClient::new(client.clone(), arn.clone()));

        for (region, arn) in &self.arn_map {
            if region == &preferred_region {
                continue;
            }

            let client = self.clients.get(region).ok_or_else(|| {
                Error::ConfigInvalid(format!("no KMS client provided for region: {}", region))
            })?;
            regional_clients.push(RegionalClient::new(client.clone(), arn.clone()));
        }

        Ok(MultiRegionKms::new(regional_clients, self.crypto))
    }
}
