//! Integration tests for zarf with the local test provider.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use secrecy::{ExposeSecret, SecretVec};
use zarf::context::EncryptionContext;
use zarf::error::{Error, ProviderError};
use zarf::keybox::KeyBox;
use zarf::keyring::{DataKeyCache, KeySlot, Keyring, Record};
use zarf::provider::{DataKeyPair, KmsProvider, ProviderRegistry};
use zarf::router::ProviderKind;

#[derive(Default)]
struct User {
    name: String,
    envelopes: HashMap<String, String>,
}

impl Record for User {
    fn stored_envelope(&self, slot: &str) -> Option<String> {
        self.envelopes.get(slot).cloned()
    }

    fn set_stored_envelope(&mut self, slot: &str, envelope: Option<String>) {
        match envelope {
            Some(envelope) => self.envelopes.insert(slot.to_string(), envelope),
            None => self.envelopes.remove(slot),
        };
    }
}

fn user_keyring() -> Keyring<User> {
    Keyring::new(Arc::new(ProviderRegistry::new())).declare(
        KeySlot::new("kms_key", "insecure-test-key").with_context_fn(|user: &User, _version| {
            EncryptionContext::new().with("name", user.name.as_str())
        }),
    )
}

#[tokio::test]
async fn test_encrypt_decrypt_round_trip() {
    let keyring = user_keyring();
    let user = User { name: "Test".to_string(), ..User::default() };

    let plaintext = "hello".repeat(100);
    let stored = keyring.encrypt(&user, "kms_key", plaintext.as_bytes()).await.unwrap();
    let decrypted = keyring.decrypt(&user, "kms_key", &stored).await.unwrap();

    assert_eq!(decrypted.expose_secret(), plaintext.as_bytes());
}

#[tokio::test]
async fn test_context_order_does_not_matter() {
    let registry = Arc::new(ProviderRegistry::new());
    let keybox = KeyBox::new(registry, "insecure-test-key");

    let context1 = EncryptionContext::new().with("a", 1).with("b", 2);
    let context2 = EncryptionContext::new().with("b", 2).with("a", 1);

    let stored = keybox.encrypt(b"hello", &context1).await.unwrap();
    let decrypted = keybox.decrypt(&stored, &context2).await.unwrap();

    assert_eq!(decrypted.expose_secret(), b"hello");
}

#[tokio::test]
async fn test_context_binding() {
    let registry = Arc::new(ProviderRegistry::new());
    let keybox = KeyBox::new(registry, "insecure-test-key");

    let context = EncryptionContext::new().with("user_id", 1);
    let wrong = EncryptionContext::new().with("user_id", 2);

    let stored = keybox.encrypt(b"hello", &context).await.unwrap();
    let result = keybox.decrypt(&stored, &wrong).await;

    assert!(matches!(result, Err(Error::DecryptionFailed)));
}

#[tokio::test]
async fn test_rotation_across_versions() {
    let registry = Arc::new(ProviderRegistry::new());

    // version 1 only
    let keybox_v1 = KeyBox::new(Arc::clone(&registry), "insecure-test-key");
    let context = EncryptionContext::new().with("record", 1);
    let old_envelope = keybox_v1.encrypt(b"secret", &context).await.unwrap();
    assert!(old_envelope.starts_with("v1:"));

    // reconfigured to version 2 with version 1 kept as a previous version
    let keybox_v2 = KeyBox::new(registry, "insecure-test-key")
        .with_version(2)
        .with_previous_versions([(1, "insecure-test-key".to_string())].into());

    let new_envelope = keybox_v2.encrypt(b"secret", &context).await.unwrap();
    assert!(new_envelope.starts_with("v2:"));

    // both generations decrypt without reconfiguration
    assert_eq!(keybox_v2.decrypt(&old_envelope, &context).await.unwrap().expose_secret(), b"secret");
    assert_eq!(keybox_v2.decrypt(&new_envelope, &context).await.unwrap().expose_secret(), b"secret");
}

#[tokio::test]
async fn test_unregistered_version_fails() {
    let registry = Arc::new(ProviderRegistry::new());
    let keybox_v3 = KeyBox::new(Arc::clone(&registry), "insecure-test-key").with_version(3);
    let context = EncryptionContext::new();

    let envelope_v3 = keybox_v3.encrypt(b"secret", &context).await.unwrap();

    let keybox_v1 = KeyBox::new(registry, "insecure-test-key");
    let result = keybox_v1.decrypt(&envelope_v3, &context).await;
    assert!(matches!(result, Err(Error::VersionNotActive { version: 3 })));
}

// The example scenario: a test-key slot at version 1.
#[tokio::test]
async fn test_example_scenario() {
    let keyring = user_keyring();
    let user = User::default();

    let stored = keyring.encrypt(&user, "kms_key", b"hello").await.unwrap();
    assert!(stored.starts_with("v1:"));

    let decrypted = keyring.decrypt(&user, "kms_key", &stored).await.unwrap();
    assert_eq!(decrypted.expose_secret(), b"hello");

    // corrupt one byte of the base64 payload, keeping it valid base64 so
    // the failure comes from the provider, not the envelope codec
    let mut corrupted = stored.into_bytes();
    let index = corrupted.len() - 5;
    corrupted[index] = if corrupted[index] == b'A' { b'B' } else { b'A' };
    let corrupted = String::from_utf8(corrupted).unwrap();

    let result = keyring.decrypt(&user, "kms_key", &corrupted).await;
    assert!(matches!(result, Err(Error::DecryptionFailed)));
}

struct CapturingProvider {
    contexts: Mutex<Vec<Option<Vec<u8>>>>,
    key_ids: Mutex<Vec<String>>,
}

impl CapturingProvider {
    fn new() -> Arc<Self> {
        Arc::new(Self { contexts: Mutex::new(Vec::new()), key_ids: Mutex::new(Vec::new()) })
    }
}

#[async_trait::async_trait]
impl KmsProvider for CapturingProvider {
    async fn encrypt(
        &self,
        _key_id: &str,
        plaintext: &[u8],
        _context: Option<&[u8]>,
    ) -> Result<Vec<u8>, ProviderError> {
        Ok(plaintext.to_vec())
    }

    async fn decrypt(
        &self,
        key_id: &str,
        _ciphertext: &[u8],
        context: Option<&[u8]>,
    ) -> Result<SecretVec<u8>, ProviderError> {
        self.key_ids.lock().unwrap().push(key_id.to_string());
        self.contexts.lock().unwrap().push(context.map(<[u8]>::to_vec));
        Ok(SecretVec::new(b"plaintext".to_vec()))
    }

    async fn generate_data_key(
        &self,
        _key_id: &str,
        _context: Option<&[u8]>,
    ) -> Result<DataKeyPair, ProviderError> {
        Ok((SecretVec::new(vec![0u8; 32]), vec![0u8; 16]))
    }
}

#[tokio::test]
async fn test_legacy_google_envelope_decrypts_with_reconstructed_key() {
    let provider = CapturingProvider::new();
    let registry = Arc::new(
        ProviderRegistry::new().register(ProviderKind::Google, Arc::clone(&provider) as _),
    );

    let keyring: Keyring<User> = Keyring::new(registry).declare(KeySlot::new(
        "kms_key",
        "projects/p/locations/l/keyRings/r/cryptoKeys/k",
    ));

    // shortened form: odd path segments of the key version resource name
    let short = STANDARD.encode("my-project/us-east1/my-ring/my-key/2");
    let stored = format!("$gc${short}${}", STANDARD.encode(b"wrapped-bytes"));

    let user = User::default();
    keyring.decrypt(&user, "kms_key", &stored).await.unwrap();

    let key_ids = provider.key_ids.lock().unwrap();
    assert_eq!(
        key_ids[0],
        "projects/my-project/locations/us-east1/keyRings/my-ring/cryptoKeys/my-key"
    );
}

#[tokio::test]
async fn test_legacy_vault_upgrade_context_decrypts_with_empty_context() {
    let provider = CapturingProvider::new();
    let registry = Arc::new(
        ProviderRegistry::new().register(ProviderKind::Vault, Arc::clone(&provider) as _),
    );

    let keyring: Keyring<User> = Keyring::new(registry).declare(
        KeySlot::new("kms_key", "vault/app-key")
            .with_context_fn(|user: &User, _v| {
                EncryptionContext::new().with("name", user.name.as_str())
            })
            .with_upgrade_context(),
    );

    let user = User { name: "Test".to_string(), ..User::default() };
    keyring.decrypt(&user, "kms_key", "vault:v1:abcdef").await.unwrap();

    let contexts = provider.contexts.lock().unwrap();
    assert_eq!(contexts[0].as_deref(), Some(b"{}".as_slice()));
}

#[tokio::test]
async fn test_legacy_vault_without_upgrade_uses_real_context() {
    let provider = CapturingProvider::new();
    let registry = Arc::new(
        ProviderRegistry::new().register(ProviderKind::Vault, Arc::clone(&provider) as _),
    );

    let keyring: Keyring<User> = Keyring::new(registry).declare(
        KeySlot::new("kms_key", "vault/app-key").with_context_fn(|user: &User, _v| {
            EncryptionContext::new().with("name", user.name.as_str())
        }),
    );

    let user = User { name: "Test".to_string(), ..User::default() };
    keyring.decrypt(&user, "kms_key", "vault:v1:abcdef").await.unwrap();

    let contexts = provider.contexts.lock().unwrap();
    // legacy mode serialization of the slot context
    assert_eq!(contexts[0].as_deref(), Some(br#"{"name":"Test"}"#.as_slice()));
}

#[tokio::test]
async fn test_rotation_preserves_plaintext_values() {
    let keyring = user_keyring();
    let cache = DataKeyCache::new();
    let mut user = User { name: "Test".to_string(), ..User::default() };

    // simulate a field encrypted under the slot's data key: the "field
    // ciphertext" here is just the value XORed with the first key byte,
    // standing in for the host's local cipher
    let data_key = keyring.data_key(&mut user, &cache, "kms_key").await.unwrap();
    let key_byte = data_key.expose_secret()[0];
    let field_ciphertext: Vec<u8> = b"test@example.org".iter().map(|b| b ^ key_byte).collect();
    drop(data_key);

    let envelope_before = user.stored_envelope("kms_key").unwrap();

    let rotated_field = Mutex::new(Vec::new());
    keyring
        .rotate(
            &mut user,
            &cache,
            "kms_key",
            |_user, old_key| {
                let key_byte = old_key.expect("old key present").expose_secret()[0];
                Ok(field_ciphertext.iter().map(|b| b ^ key_byte).collect::<Vec<u8>>())
            },
            |_user, plaintext, new_key| {
                let key_byte = new_key.expose_secret()[0];
                *rotated_field.lock().unwrap() =
                    plaintext.iter().map(|b| b ^ key_byte).collect::<Vec<u8>>();
                Ok(())
            },
        )
        .await
        .unwrap();

    let envelope_after = user.stored_envelope("kms_key").unwrap();
    assert_ne!(envelope_after, envelope_before);

    // re-reading through the new key yields the original value
    let new_key = cache.get("kms_key").unwrap();
    let key_byte = new_key.expose_secret()[0];
    let recovered: Vec<u8> =
        rotated_field.lock().unwrap().iter().map(|b| b ^ key_byte).collect();
    assert_eq!(recovered, b"test@example.org");
}

#[tokio::test]
async fn test_data_key_is_generated_once_per_instance() {
    static GENERATE_CALLS: AtomicUsize = AtomicUsize::new(0);

    struct CountingProvider;

    #[async_trait::async_trait]
    impl KmsProvider for CountingProvider {
        async fn encrypt(
            &self,
            _key_id: &str,
            plaintext: &[u8],
            _context: Option<&[u8]>,
        ) -> Result<Vec<u8>, ProviderError> {
            Ok(plaintext.to_vec())
        }

        async fn decrypt(
            &self,
            _key_id: &str,
            ciphertext: &[u8],
            _context: Option<&[u8]>,
        ) -> Result<SecretVec<u8>, ProviderError> {
            Ok(SecretVec::new(ciphertext.to_vec()))
        }

        async fn generate_data_key(
            &self,
            _key_id: &str,
            _context: Option<&[u8]>,
        ) -> Result<DataKeyPair, ProviderError> {
            GENERATE_CALLS.fetch_add(1, Ordering::SeqCst);
            Ok((SecretVec::new(vec![9u8; 32]), vec![9u8; 32]))
        }
    }

    let registry = Arc::new(
        ProviderRegistry::new().register(ProviderKind::Aws, Arc::new(CountingProvider) as _),
    );
    let keyring: Keyring<User> =
        Keyring::new(registry).declare(KeySlot::new("kms_key", "alias/app-key"));

    let cache = DataKeyCache::new();
    let mut user = User::default();

    for _ in 0..3 {
        keyring.data_key(&mut user, &cache, "kms_key").await.unwrap();
    }
    assert_eq!(GENERATE_CALLS.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_reload_then_regenerate_unwraps_stored_envelope() {
    let keyring = user_keyring();
    let cache = DataKeyCache::new();
    let mut user = User { name: "Test".to_string(), ..User::default() };

    let key_before = keyring.data_key(&mut user, &cache, "kms_key").await.unwrap();
    let key_bytes = key_before.expose_secret().clone();
    drop(key_before);

    // reload clears every cached data key for the instance
    cache.invalidate_all();
    assert!(cache.get("kms_key").is_none());

    // next access unwraps the stored envelope instead of minting a new key
    let key_after = keyring.data_key(&mut user, &cache, "kms_key").await.unwrap();
    assert_eq!(key_after.expose_secret(), &key_bytes);
}

#[tokio::test]
async fn test_fresh_envelopes_never_use_legacy_forms() {
    let keyring = user_keyring();
    let user = User { name: "Test".to_string(), ..User::default() };

    for _ in 0..4 {
        let stored = keyring.encrypt(&user, "kms_key", b"payload").await.unwrap();
        assert!(stored.starts_with("v1:"));
        assert!(!stored.starts_with("$gc$"));
        assert!(!stored.starts_with("vault:"));
        assert!(!zarf::envelope::decode(&stored).unwrap().is_legacy());
    }
}
