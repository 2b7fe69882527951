use serde_json::json;
use vaultdump::broker::{BrokerSession, BrokerSettings};
use vaultdump::config::BrokerConfig;
use vaultdump::error::CredentialError;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn settings(server: &MockServer, token: Option<&str>, approle: Option<&str>) -> BrokerSettings {
    let options = BrokerConfig {
        address: Some(server.uri()),
        token: token.map(str::to_string),
        approle: approle.map(str::to_string),
        max_retries: 0,
        ..BrokerConfig::default()
    };
    BrokerSettings::resolve(|_| None, &options).expect("settings resolve")
}

#[tokio::test]
async fn static_token_needs_no_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/database/creds/pg-db1"))
        .and(header("X-Vault-Token", "root-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "lease_id": "database/creds/pg-db1/abc",
            "lease_duration": 3600,
            "data": { "username": "v-pg-db1-x", "password": "pw" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let session = BrokerSession::authenticate(settings(&server, Some("root-token"), None))
        .await
        .expect("token auth");
    assert!(server.received_requests().await.unwrap_or_default().is_empty());

    let cred = session
        .lease_dynamic_credential("database/creds/pg-db1")
        .await
        .expect("lease");
    assert_eq!(cred.username, "v-pg-db1-x");
    assert_eq!(cred.password(), "pw");
    assert_eq!(cred.ttl.as_secs(), 3600);
    assert_eq!(cred.lease_id.as_deref(), Some("database/creds/pg-db1/abc"));
    assert!(!cred.is_expired());
    assert!(!format!("{cred:?}").contains("pw\""));
}

#[tokio::test]
async fn approle_login_flow_issues_session_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/auth/approle/role/backup/role-id"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "data": { "role_id": "rid-1" } })),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/auth/approle/role/backup/secret-id"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "data": { "secret_id": "sid-1" } })),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/auth/approle/login"))
        .and(body_json(json!({ "role_id": "rid-1", "secret_id": "sid-1" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "auth": { "client_token": "session-token", "lease_duration": 1200 }
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/database/creds/mongo-app"))
        .and(header("X-Vault-Token", "session-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "lease_duration": 600,
            "data": { "username": "v-mongo", "password": "secret" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let session = BrokerSession::authenticate(settings(&server, None, Some("backup")))
        .await
        .expect("approle auth");
    let cred = session
        .lease_dynamic_credential("database/creds/mongo-app")
        .await
        .expect("lease with session token");
    assert_eq!(cred.username, "v-mongo");
}

#[tokio::test]
async fn failing_approle_step_aborts_authentication() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/auth/approle/role/backup/role-id"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "data": { "role_id": "rid-1" } })),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/auth/approle/role/backup/secret-id"))
        .respond_with(ResponseTemplate::new(403).set_body_string("permission denied"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/auth/approle/login"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let err = BrokerSession::authenticate(settings(&server, None, Some("backup")))
        .await
        .err()
        .expect("authentication must fail");
    match err {
        CredentialError::Status { status, body, .. } => {
            assert_eq!(status.as_u16(), 403);
            assert_eq!(body, "permission denied");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn missing_auth_method_is_rejected() {
    let server = MockServer::start().await;
    let err = BrokerSession::authenticate(settings(&server, None, None))
        .await
        .err()
        .expect("no token, no approle");
    assert!(matches!(err, CredentialError::MissingAuthMethod));
}

#[tokio::test]
async fn lease_without_password_is_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/database/creds/pg-db1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "lease_duration": 60,
            "data": { "username": "u", "password": 42 }
        })))
        .mount(&server)
        .await;

    let session = BrokerSession::authenticate(settings(&server, Some("t"), None))
        .await
        .expect("token auth");
    let err = session
        .lease_dynamic_credential("database/creds/pg-db1")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CredentialError::MalformedSecret { field: "password", .. }
    ));
}

#[tokio::test]
async fn transient_errors_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/database/creds/pg-db1"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/database/creds/pg-db1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "lease_duration": 60,
            "data": { "username": "u", "password": "p" }
        })))
        .mount(&server)
        .await;

    let options = BrokerConfig {
        address: Some(server.uri()),
        token: Some("t".into()),
        max_retries: 2,
        ..BrokerConfig::default()
    };
    let settings = BrokerSettings::resolve(|_| None, &options).expect("settings resolve");
    let session = BrokerSession::authenticate(settings).await.expect("token auth");
    let cred = session
        .lease_dynamic_credential("database/creds/pg-db1")
        .await
        .expect("second attempt succeeds");
    assert_eq!(cred.username, "u");
}

#[tokio::test]
async fn connection_facts_from_kv_v2() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/secret/data/postgres/db1"))
        .and(header("X-Vault-Namespace", "ops"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {
                "data": { "host": "pg-primary", "port": "5433", "database": "orders" },
                "metadata": { "version": 3 }
            }
        })))
        .mount(&server)
        .await;

    let options = BrokerConfig {
        address: Some(server.uri()),
        token: Some("t".into()),
        namespace: Some("ops".into()),
        max_retries: 0,
        ..BrokerConfig::default()
    };
    let settings = BrokerSettings::resolve(|_| None, &options).expect("settings resolve");
    let session = BrokerSession::authenticate(settings).await.expect("token auth");
    let facts = session
        .read_connection_facts("secret/data/postgres/db1")
        .await
        .expect("facts");
    assert_eq!(facts.host.as_deref(), Some("pg-primary"));
    assert_eq!(facts.port, Some(5433));
    assert_eq!(facts.database.as_deref(), Some("orders"));
}
