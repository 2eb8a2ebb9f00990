use super::*;
use crate::cache::{CacheError, MemoryCache};
use crate::config::{ProviderAConfig, ProviderBConfig};
use crate::providers::ProviderError;
use async_trait::async_trait;
use mockito::{Mock, Server, ServerGuard};
use std::collections::HashMap;
use std::time::Duration as StdDuration;

// 32 zero bytes, base64
const TEST_KEY: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";

/// Cache whose backend is always down
struct FailingCache;

#[async_trait]
impl TransientCache for FailingCache {
    async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
        Err(CacheError::Backend("connection refused".to_string()))
    }
    async fn set(&self, _key: &str, _value: &str, _ttl: u64) -> Result<(), CacheError> {
        Err(CacheError::Backend("connection refused".to_string()))
    }
    async fn delete(&self, _key: &str) -> Result<bool, CacheError> {
        Err(CacheError::Backend("connection refused".to_string()))
    }
    async fn expire(&self, _key: &str, _ttl: u64) -> Result<bool, CacheError> {
        Err(CacheError::Backend("connection refused".to_string()))
    }
    async fn take(&self, _key: &str) -> Result<Option<String>, CacheError> {
        Err(CacheError::Backend("connection refused".to_string()))
    }
    async fn hash_get_all(&self, _key: &str) -> Result<HashMap<String, String>, CacheError> {
        Err(CacheError::Backend("connection refused".to_string()))
    }
    async fn hash_set(&self, _key: &str, _fields: &[(&str, &str)]) -> Result<(), CacheError> {
        Err(CacheError::Backend("connection refused".to_string()))
    }
    async fn hash_create_if_absent(
        &self,
        _key: &str,
        _fields: &[(&str, &str)],
        _ttl: u64,
    ) -> Result<bool, CacheError> {
        Err(CacheError::Backend("connection refused".to_string()))
    }
}

struct Harness {
    service: OAuthService,
    cache: MemoryCache,
    store: Arc<ConnectionStore>,
    server: ServerGuard,
}

fn build_service(server: &ServerGuard, cache: Arc<dyn TransientCache>, store: Arc<ConnectionStore>) -> OAuthService {
    let base = server.url();
    let provider_a = ClientCredentialsClient::new(
        &ProviderAConfig {
            client_id: "client-a".to_string(),
            client_secret: "secret-a".to_string(),
            oauth_base: base.clone(),
            api_base: base.clone(),
            scope: "ca".to_string(),
        },
        StdDuration::from_secs(5),
    )
    .unwrap();

    let provider_b = AuthCodeClient::new(
        &ProviderBConfig {
            client_id: "client-b".to_string(),
            client_secret: "secret-b".to_string(),
            redirect_uri: "http://localhost:3001/api/v1/oauth/providerB/callback".to_string(),
            authorize_url: format!("{}/oauth/2.0/authorize", base),
            token_url: format!("{}/oauth/2.0/token", base),
            api_base_url: base.clone(),
            org_code: "1101073389".to_string(),
            scope: "login inquiry".to_string(),
            auth_type: "0".to_string(),
        },
        StdDuration::from_secs(5),
    )
    .unwrap();

    OAuthService::new(
        cache,
        store,
        Cipher::new(TEST_KEY).unwrap(),
        provider_a,
        provider_b,
        300,
    )
}

async fn harness() -> Harness {
    let server = Server::new_async().await;
    let cache = MemoryCache::new();
    let store = Arc::new(ConnectionStore::new(":memory:").unwrap());
    let service = build_service(&server, Arc::new(cache.clone()), Arc::clone(&store));

    Harness {
        service,
        cache,
        store,
        server,
    }
}

async fn mock_provider_a_token(server: &mut ServerGuard, access_token: &str) -> Mock {
    server
        .mock("POST", "/token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(format!(
            r#"{{"access_token":"{}","token_type":"Bearer","expires_in":3600}}"#,
            access_token
        ))
        .create_async()
        .await
}

async fn mock_provider_b_token(server: &mut ServerGuard, hits: usize) -> Mock {
    server
        .mock("POST", "/oauth/2.0/token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{"access_token":"b-access","refresh_token":"b-refresh","token_type":"Bearer",
                "expires_in":7200,"scope":"login inquiry","user_seq_no":"1100000001"}"#,
        )
        .expect(hits)
        .create_async()
        .await
}

fn state_from_url(url: &str) -> String {
    url.split('&')
        .find_map(|pair| pair.strip_prefix("state="))
        .unwrap()
        .to_string()
}

#[tokio::test]
async fn test_client_credentials_persists_encrypted_and_mirrors() {
    let mut h = harness().await;
    let mock = mock_provider_a_token(&mut h.server, "a-access").await;

    let outcome = h.service.connect_client_credentials("u1").await.unwrap();
    assert_eq!(outcome.expires_in, 3600);
    assert_eq!(outcome.connection.provider, Provider::ProviderA);
    mock.assert_async().await;

    let row = h.store.find("u1", Provider::ProviderA).unwrap().unwrap();
    assert_ne!(row.access_token, "a-access");
    assert_eq!(Cipher::new(TEST_KEY).unwrap().decrypt(&row.access_token).unwrap(), "a-access");
    assert!(row.refresh_token.is_none());
    assert!(row.subject_id.is_none());
    assert!(row.expires_at.is_some());

    let key = keys::token_mirror("u1", Provider::ProviderA);
    let mirror = h.cache.get(&key).await.unwrap().unwrap();
    assert_eq!(mirror, r#"{"accessToken":"a-access"}"#);
    let ttl = h.cache.ttl(&key).unwrap().as_secs();
    assert!(ttl > 3590 && ttl <= 3600);
}

#[tokio::test]
async fn test_repeated_connect_keeps_one_row() {
    let mut h = harness().await;

    let first_mock = mock_provider_a_token(&mut h.server, "first").await;
    let first = h.service.connect_client_credentials("u1").await.unwrap();
    first_mock.remove_async().await;

    let _second_mock = mock_provider_a_token(&mut h.server, "second").await;
    let second = h.service.connect_client_credentials("u1").await.unwrap();

    assert_eq!(h.store.count().unwrap(), 1);
    assert_eq!(first.connection.id, second.connection.id);
    assert_eq!(first.connection.created_at, second.connection.created_at);

    let row = h.store.find("u1", Provider::ProviderA).unwrap().unwrap();
    assert_eq!(Cipher::new(TEST_KEY).unwrap().decrypt(&row.access_token).unwrap(), "second");
}

#[tokio::test]
async fn test_failed_exchange_persists_nothing() {
    let mut h = harness().await;
    let _mock = h
        .server
        .mock("POST", "/token")
        .with_status(500)
        .with_body("upstream exploded")
        .create_async()
        .await;

    let err = h.service.connect_client_credentials("u1").await.unwrap_err();
    match err {
        ConnectError::Provider(ProviderError::Upstream { status, body, .. }) => {
            assert_eq!(status, 500);
            assert_eq!(body, "upstream exploded");
        }
        other => panic!("expected provider error, got {:?}", other),
    }

    assert_eq!(h.store.count().unwrap(), 0);
    assert!(h.cache.is_empty());
}

#[tokio::test]
async fn test_out_of_range_lifetime_persists_nothing() {
    let mut h = harness().await;
    let _mock = h
        .server
        .mock("POST", "/token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token":"x","expires_in":100000000000000}"#)
        .create_async()
        .await;

    let err = h.service.connect_client_credentials("u1").await.unwrap_err();
    assert!(matches!(
        err,
        ConnectError::Provider(ProviderError::Decode {
            provider: Provider::ProviderA,
            ..
        })
    ));

    assert_eq!(h.store.count().unwrap(), 0);
    assert!(h.cache.is_empty());
}

#[tokio::test]
async fn test_callback_with_out_of_range_lifetime_fails_cleanly() {
    let mut h = harness().await;
    let _mock = h
        .server
        .mock("POST", "/oauth/2.0/token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{"access_token":"b-access","refresh_token":"b-refresh","expires_in":9223372036854775807}"#,
        )
        .create_async()
        .await;

    let url = h.service.begin_authorization("u1").await.unwrap();
    let state = state_from_url(&url);

    let err = h
        .service
        .complete_authorization("code-1", &state)
        .await
        .unwrap_err();
    assert_eq!(err.code(), CallbackErrorCode::TokenExchangeFailed);

    assert_eq!(h.store.count().unwrap(), 0);
    assert!(h
        .cache
        .get(&keys::token_mirror("u1", Provider::ProviderB))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_authorization_code_flow() {
    let mut h = harness().await;
    let mock = mock_provider_b_token(&mut h.server, 1).await;

    let url = h.service.begin_authorization("u1").await.unwrap();
    let state = state_from_url(&url);
    assert_eq!(state.len(), 32);
    assert!(h.cache.get(&keys::csrf_state(&state)).await.unwrap().is_some());

    let outcome = h.service.complete_authorization("code-1", &state).await.unwrap();
    assert_eq!(outcome.connection.user_id, "u1");
    assert_eq!(outcome.connection.provider, Provider::ProviderB);
    mock.assert_async().await;

    // State is gone after redemption
    assert!(h.cache.get(&keys::csrf_state(&state)).await.unwrap().is_none());

    let cipher = Cipher::new(TEST_KEY).unwrap();
    let row = h.store.find("u1", Provider::ProviderB).unwrap().unwrap();
    assert_eq!(cipher.decrypt(&row.access_token).unwrap(), "b-access");
    assert_eq!(cipher.decrypt(row.refresh_token.as_deref().unwrap()).unwrap(), "b-refresh");
    assert_eq!(cipher.decrypt(row.subject_id.as_deref().unwrap()).unwrap(), "1100000001");

    let mirror = h
        .cache
        .get(&keys::token_mirror("u1", Provider::ProviderB))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(mirror, r#"{"accessToken":"b-access","userSeqNo":"1100000001"}"#);
}

#[tokio::test]
async fn test_state_redeemed_once() {
    let mut h = harness().await;
    let mock = mock_provider_b_token(&mut h.server, 1).await;

    let url = h.service.begin_authorization("u1").await.unwrap();
    let state = state_from_url(&url);

    assert!(h.service.complete_authorization("code-1", &state).await.is_ok());
    let second = h.service.complete_authorization("code-1", &state).await;
    assert!(matches!(second, Err(CallbackError::InvalidState)));

    mock.assert_async().await;
    assert_eq!(h.store.count().unwrap(), 1);
}

#[tokio::test]
async fn test_concurrent_callbacks_exchange_once() {
    let mut h = harness().await;
    let mock = mock_provider_b_token(&mut h.server, 1).await;

    let url = h.service.begin_authorization("u1").await.unwrap();
    let state = state_from_url(&url);

    let (a, b) = tokio::join!(
        h.service.complete_authorization("code-1", &state),
        h.service.complete_authorization("code-1", &state)
    );

    let oks = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(oks, 1);
    assert!(matches!(a, Err(CallbackError::InvalidState)) || matches!(b, Err(CallbackError::InvalidState)));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_unknown_state_never_reaches_provider() {
    let mut h = harness().await;
    let mock = mock_provider_b_token(&mut h.server, 0).await;

    let err = h
        .service
        .complete_authorization("code-1", "ffffffffffffffffffffffffffffffff")
        .await
        .unwrap_err();
    assert_eq!(err.code(), CallbackErrorCode::InvalidState);

    mock.assert_async().await;
    assert_eq!(h.store.count().unwrap(), 0);
}

#[tokio::test]
async fn test_failed_code_exchange_consumes_state_and_persists_nothing() {
    let mut h = harness().await;
    let _mock = h
        .server
        .mock("POST", "/oauth/2.0/token")
        .with_status(401)
        .with_body(r#"{"rsp_code":"O0001"}"#)
        .create_async()
        .await;

    let url = h.service.begin_authorization("u1").await.unwrap();
    let state = state_from_url(&url);

    let err = h.service.complete_authorization("bad", &state).await.unwrap_err();
    assert_eq!(err.code(), CallbackErrorCode::TokenExchangeFailed);

    assert_eq!(h.store.count().unwrap(), 0);
    assert!(h.cache.is_empty());
}

#[tokio::test]
async fn test_disconnect_removes_row_and_mirror() {
    let mut h = harness().await;
    let _mock = mock_provider_a_token(&mut h.server, "a-access").await;
    h.service.connect_client_credentials("u1").await.unwrap();

    assert!(h.service.disconnect("u1", Provider::ProviderA).await.unwrap());
    assert!(h.store.find("u1", Provider::ProviderA).unwrap().is_none());
    assert!(h
        .cache
        .get(&keys::token_mirror("u1", Provider::ProviderA))
        .await
        .unwrap()
        .is_none());

    assert!(!h.service.disconnect("u1", Provider::ProviderA).await.unwrap());
}

#[tokio::test]
async fn test_list_connections_omits_tokens() {
    let mut h = harness().await;
    let _a = mock_provider_a_token(&mut h.server, "a-access").await;
    let _b = mock_provider_b_token(&mut h.server, 1).await;

    h.service.connect_client_credentials("u1").await.unwrap();
    let state = state_from_url(&h.service.begin_authorization("u1").await.unwrap());
    h.service.complete_authorization("code-1", &state).await.unwrap();
    h.service.connect_client_credentials("u2").await.unwrap();

    let list = h.service.list_connections("u1").unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(list[0].provider, Provider::ProviderA);
    assert_eq!(list[1].provider, Provider::ProviderB);
    assert!(list.iter().all(|c| !c.is_expired));

    let json = serde_json::to_string(&list).unwrap();
    assert!(!json.contains("a-access"));
    assert!(!json.contains("accessToken"));

    assert!(h.service.list_connections("nobody").unwrap().is_empty());
}

#[tokio::test]
async fn test_connection_tokens_prefers_mirror_then_store() {
    let mut h = harness().await;
    let _mock = mock_provider_b_token(&mut h.server, 1).await;
    let state = state_from_url(&h.service.begin_authorization("u1").await.unwrap());
    h.service.complete_authorization("code-1", &state).await.unwrap();

    let tokens = h
        .service
        .connection_tokens("u1", Provider::ProviderB)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tokens.access_token, "b-access");
    assert_eq!(tokens.subject_id.as_deref(), Some("1100000001"));

    // Without the mirror the stored row is decrypted
    h.cache
        .delete(&keys::token_mirror("u1", Provider::ProviderB))
        .await
        .unwrap();
    let tokens = h
        .service
        .connection_tokens("u1", Provider::ProviderB)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tokens.access_token, "b-access");
    assert_eq!(tokens.subject_id.as_deref(), Some("1100000001"));

    assert!(h
        .service
        .connection_tokens("u1", Provider::ProviderA)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_refresh_connection_keeps_subject() {
    let mut h = harness().await;
    let exchange = mock_provider_b_token(&mut h.server, 1).await;
    let state = state_from_url(&h.service.begin_authorization("u1").await.unwrap());
    let first = h.service.complete_authorization("code-1", &state).await.unwrap();
    exchange.remove_async().await;

    let _refresh = h
        .server
        .mock("POST", "/oauth/2.0/token")
        .match_body(mockito::Matcher::UrlEncoded(
            "refresh_token".into(),
            "b-refresh".into(),
        ))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token":"b-access-2","expires_in":7200}"#)
        .create_async()
        .await;

    let refreshed = h.service.refresh_connection("u1").await.unwrap().unwrap();
    assert_eq!(refreshed.connection.id, first.connection.id);

    let cipher = Cipher::new(TEST_KEY).unwrap();
    let row = h.store.find("u1", Provider::ProviderB).unwrap().unwrap();
    assert_eq!(cipher.decrypt(&row.access_token).unwrap(), "b-access-2");
    assert_eq!(cipher.decrypt(row.refresh_token.as_deref().unwrap()).unwrap(), "b-refresh");
    assert_eq!(cipher.decrypt(row.subject_id.as_deref().unwrap()).unwrap(), "1100000001");

    assert!(h.service.refresh_connection("u2").await.unwrap().is_none());
}

#[tokio::test]
async fn test_cache_outage_is_soft_for_mirror_and_hard_for_state() {
    let mut server = Server::new_async().await;
    let store = Arc::new(ConnectionStore::new(":memory:").unwrap());
    let service = build_service(&server, Arc::new(FailingCache), Arc::clone(&store));
    let _mock = mock_provider_a_token(&mut server, "a-access").await;

    // Mirror write fails, the stored row is still the outcome
    let outcome = service.connect_client_credentials("u1").await.unwrap();
    assert_eq!(outcome.connection.user_id, "u1");
    assert_eq!(store.count().unwrap(), 1);

    // Mirror read fails, store fallback answers
    let tokens = service
        .connection_tokens("u1", Provider::ProviderA)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tokens.access_token, "a-access");

    // A state that cannot be recorded cannot start a redirect
    assert!(matches!(
        service.begin_authorization("u1").await,
        Err(ConnectError::Cache(_))
    ));

    let err = service
        .complete_authorization("code", "ffffffffffffffffffffffffffffffff")
        .await
        .unwrap_err();
    assert_eq!(err.code(), CallbackErrorCode::CallbackFailed);

    // Disconnect still removes the row
    assert!(service.disconnect("u1", Provider::ProviderA).await.unwrap());
}
