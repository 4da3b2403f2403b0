//! Record-facing key lifecycle management.
//!
//! A [`Keyring`] holds the [`KeySlot`] declarations for one entity type
//! plus the provider registry, and drives envelope operations for record
//! instances: resolving the active version, computing the per-record
//! context, memoizing plaintext data keys, and rotation.
//!
//! The host persistence layer participates through the [`Record`] trait
//! (envelope storage only) and through the version/context functions
//! declared on each slot.

use crate::context::EncryptionContext;
use crate::envelope;
use crate::error::Error;
use crate::keybox::KeyBox;
use crate::provider::ProviderRegistry;
use secrecy::SecretVec;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

/// Storage operations the core requires from the host entity layer.
pub trait Record {
    /// Returns the stored envelope for a slot, if one has been written.
    fn stored_envelope(&self, slot: &str) -> Option<String>;

    /// Writes (or clears) the stored envelope for a slot. The host decides
    /// when the write is persisted.
    fn set_stored_envelope(&mut self, slot: &str, envelope: Option<String>);
}

/// How a slot's active version is determined.
pub enum VersionSource<R> {
    /// A fixed version number.
    Fixed(u32),
    /// Computed per call from record state.
    PerRecord(Arc<dyn Fn(&R) -> u32 + Send + Sync>),
}

type ContextFn<R> = Arc<dyn Fn(&R, u32) -> EncryptionContext + Send + Sync>;

/// Configuration for one logical named key on an entity type.
///
/// Declared once at setup time; read-only afterwards.
///
/// # Example
///
/// ```
/// use zarf::keyring::KeySlot;
/// # struct User;
///
/// let slot: KeySlot<User> = KeySlot::new("kms_key", "insecure-test-key")
///     .with_version(2)
///     .with_previous_version(1, "insecure-test-key")
///     .with_context_fn(|_user, version| {
///         zarf::context::EncryptionContext::new().with("version", i64::from(version))
///     });
/// ```
pub struct KeySlot<R> {
    name: String,
    key_id: String,
    version: VersionSource<R>,
    context: ContextFn<R>,
    previous_versions: BTreeMap<u32, String>,
    upgrade_context: bool,
    eager: bool,
}

impl<R> KeySlot<R> {
    /// Creates a slot with the given name and active key identifier, at
    /// version 1, with an empty context.
    pub fn new(name: impl Into<String>, key_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_id: key_id.into(),
            version: VersionSource::Fixed(1),
            context: Arc::new(|_, _| EncryptionContext::new()),
            previous_versions: BTreeMap::new(),
            upgrade_context: false,
            eager: false,
        }
    }

    /// Sets a fixed active version.
    #[must_use]
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = VersionSource::Fixed(version);
        self
    }

    /// Computes the active version per call from record state.
    #[must_use]
    pub fn with_version_fn(mut self, f: impl Fn(&R) -> u32 + Send + Sync + 'static) -> Self {
        self.version = VersionSource::PerRecord(Arc::new(f));
        self
    }

    /// Sets the encryption-context function. It receives the record and
    /// the version the context is being computed for.
    #[must_use]
    pub fn with_context_fn(
        mut self,
        f: impl Fn(&R, u32) -> EncryptionContext + Send + Sync + 'static,
    ) -> Self {
        self.context = Arc::new(f);
        self
    }

    /// Registers the key identifier that was active at a historical
    /// version.
    #[must_use]
    pub fn with_previous_version(mut self, version: u32, key_id: impl Into<String>) -> Self {
        self.previous_versions.insert(version, key_id.into());
        self
    }

    /// Decrypts legacy (un-versioned) envelopes with an empty context
    /// instead of the slot's context function.
    ///
    /// Historical deployments bound context differently before envelope
    /// versioning; whether their data needs this flag depends on which
    /// revision wrote it, so it is never inferred.
    #[must_use]
    pub const fn with_upgrade_context(mut self) -> Self {
        self.upgrade_context = true;
        self
    }

    /// Generates and wraps a fresh data key on first in-memory creation
    /// instead of lazily on first use.
    #[must_use]
    pub const fn eager(mut self) -> Self {
        self.eager = true;
        self
    }

    /// Returns the slot name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Per-instance memoization of plaintext data keys.
///
/// The host embeds one cache per entity instance and calls
/// [`DataKeyCache::invalidate_all`] from its reload hook. Each slot's key
/// is produced at most once per instance: concurrent first accesses
/// coalesce onto a single generate/decrypt call.
#[derive(Default)]
pub struct DataKeyCache {
    slots: Mutex<HashMap<String, Arc<OnceCell<Arc<SecretVec<u8>>>>>>,
}

impl DataKeyCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached plaintext data key for a slot, if present.
    #[must_use]
    pub fn get(&self, slot: &str) -> Option<Arc<SecretVec<u8>>> {
        let slots = self.slots.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        slots.get(slot).and_then(|cell| cell.get().cloned())
    }

    /// Discards the cached key for one slot.
    pub fn invalidate(&self, slot: &str) {
        let mut slots = self.slots.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        slots.remove(slot);
    }

    /// Discards every cached key. Call on record reload.
    pub fn invalidate_all(&self) {
        let mut slots = self.slots.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        slots.clear();
    }

    fn cell(&self, slot: &str) -> Arc<OnceCell<Arc<SecretVec<u8>>>> {
        let mut slots = self.slots.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(slots.entry(slot.to_string()).or_default())
    }
}

impl std::fmt::Debug for DataKeyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slots = self.slots.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        f.debug_struct("DataKeyCache").field("slots", &slots.keys().collect::<Vec<_>>()).finish()
    }
}

/// Key lifecycle manager for one entity type.
pub struct Keyring<R> {
    registry: Arc<ProviderRegistry>,
    slots: HashMap<String, KeySlot<R>>,
}

impl<R: Record> Keyring<R> {
    /// Creates a keyring with no slots.
    #[must_use]
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self { registry, slots: HashMap::new() }
    }

    /// Declares a key slot. Redeclaring a name replaces the slot.
    #[must_use]
    pub fn declare(mut self, slot: KeySlot<R>) -> Self {
        self.slots.insert(slot.name.clone(), slot);
        self
    }

    fn slot(&self, name: &str) -> Result<&KeySlot<R>, Error> {
        self.slots
            .get(name)
            .ok_or_else(|| Error::Configuration(format!("unknown key slot: {name}")))
    }

    /// Resolves the slot's active version for this record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for an unknown slot or a
    /// non-positive version.
    pub fn current_version(&self, record: &R, slot_name: &str) -> Result<u32, Error> {
        let slot = self.slot(slot_name)?;
        let version = match &slot.version {
            VersionSource::Fixed(version) => *version,
            VersionSource::PerRecord(f) => f(record),
        };
        if version == 0 {
            return Err(Error::Configuration(format!(
                "version for key slot {slot_name} must be positive"
            )));
        }
        Ok(version)
    }

    fn keybox(&self, slot: &KeySlot<R>, version: u32) -> KeyBox {
        KeyBox::new(Arc::clone(&self.registry), slot.key_id.clone())
            .with_version(version)
            .with_previous_versions(slot.previous_versions.clone())
            .for_data_keys()
    }

    /// Encrypts `plaintext` under the slot's currently active version.
    ///
    /// # Errors
    ///
    /// Returns configuration, context, or provider errors.
    pub async fn encrypt(
        &self,
        record: &R,
        slot_name: &str,
        plaintext: &[u8],
    ) -> Result<String, Error> {
        let slot = self.slot(slot_name)?;
        let version = self.current_version(record, slot_name)?;
        let context = (slot.context)(record, version);
        self.keybox(slot, version).encrypt(plaintext, &context).await
    }

    /// Decrypts a stored envelope, computing the context for the version
    /// the envelope embeds.
    ///
    /// For legacy envelopes on a slot declared with
    /// [`KeySlot::with_upgrade_context`], the context is empty regardless
    /// of the slot's context function.
    ///
    /// # Errors
    ///
    /// Returns format, version, or provider errors; provider rejections
    /// surface as the opaque [`Error::DecryptionFailed`].
    pub async fn decrypt(
        &self,
        record: &R,
        slot_name: &str,
        stored: &str,
    ) -> Result<SecretVec<u8>, Error> {
        let slot = self.slot(slot_name)?;
        let parsed = envelope::decode(stored)?;

        let context = if slot.upgrade_context && parsed.is_legacy() {
            EncryptionContext::new()
        } else {
            (slot.context)(record, parsed.version())
        };

        // the active version must still resolve the primary key id even
        // when it is absent from the previous-versions table
        let active_version = self.current_version(record, slot_name)?;
        self.keybox(slot, active_version).decrypt(stored, &context).await
    }

    /// Returns the plaintext data key for a slot, producing it on first
    /// access.
    ///
    /// When the record already stores an envelope, the key is unwrapped
    /// from it; otherwise a fresh key is generated under the active
    /// version and its envelope written back through
    /// [`Record::set_stored_envelope`]. The result is memoized in `cache`
    /// for the instance's lifetime, so repeated calls return the cached
    /// value without contacting the provider.
    ///
    /// # Errors
    ///
    /// Returns configuration, format, or provider errors.
    pub async fn data_key(
        &self,
        record: &mut R,
        cache: &DataKeyCache,
        slot_name: &str,
    ) -> Result<Arc<SecretVec<u8>>, Error> {
        let _ = self.slot(slot_name)?;
        let cell = cache.cell(slot_name);

        let key = cell
            .get_or_try_init(|| async move {
                match record.stored_envelope(slot_name) {
                    Some(stored) => {
                        self.decrypt(record, slot_name, &stored).await.map(Arc::new)
                    }
                    None => {
                        let slot = self.slot(slot_name)?;
                        let version = self.current_version(record, slot_name)?;
                        let context = (slot.context)(record, version);
                        let (plaintext, envelope) =
                            self.keybox(slot, version).generate_data_key(&context).await?;
                        record.set_stored_envelope(slot_name, Some(envelope));
                        Ok(Arc::new(plaintext))
                    }
                }
            })
            .await?;

        Ok(Arc::clone(key))
    }

    /// Generates data keys for every slot declared [`KeySlot::eager`],
    /// so the wrapped keys persist together with the creating write.
    ///
    /// # Errors
    ///
    /// Returns the first error from any slot's generation.
    pub async fn ensure_eager_keys(
        &self,
        record: &mut R,
        cache: &DataKeyCache,
    ) -> Result<(), Error> {
        let names: Vec<String> =
            self.slots.values().filter(|s| s.eager).map(|s| s.name.clone()).collect();
        for name in names {
            self.data_key(record, cache, &name).await?;
        }
        Ok(())
    }

    /// Rotates the slot's data key.
    ///
    /// The exact sequence: `collect` reads every plaintext value protected
    /// under the current data key (which is passed in when one exists);
    /// the old envelope and cached key are discarded; a fresh data key is
    /// minted under the currently active version; `restore` re-encrypts
    /// the collected values with the new key. The caller must persist the
    /// record's pending writes atomically: either the new envelope and
    /// every re-encrypted value are stored together, or none are.
    ///
    /// # Errors
    ///
    /// Returns errors from either closure or from the envelope
    /// operations; on error the record may hold partially updated
    /// in-memory state and must not be persisted.
    pub async fn rotate<T, C, S>(
        &self,
        record: &mut R,
        cache: &DataKeyCache,
        slot_name: &str,
        collect: C,
        restore: S,
    ) -> Result<(), Error>
    where
        C: FnOnce(&mut R, Option<&SecretVec<u8>>) -> Result<T, Error>,
        S: FnOnce(&mut R, T, &SecretVec<u8>) -> Result<(), Error>,
    {
        let _ = self.slot(slot_name)?;

        let old_key = if record.stored_envelope(slot_name).is_some() {
            Some(self.data_key(record, cache, slot_name).await?)
        } else {
            None
        };
        let plaintexts = collect(record, old_key.as_deref())?;
        drop(old_key);

        cache.invalidate(slot_name);
        record.set_stored_envelope(slot_name, None);

        let new_key = self.data_key(record, cache, slot_name).await?;
        restore(record, plaintexts, &new_key)
    }
}
