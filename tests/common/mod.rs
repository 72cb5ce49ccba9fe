//! Shared helpers for the HTTP-level tests: a scripted identity provider and
//! thin request/response wrappers around `tower::ServiceExt::oneshot`.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Request, Response, StatusCode, header},
};
use parking_lot::Mutex;
use serde_json::Value;
use tower::ServiceExt;
use url::Url;

use kartpark_auth::config::BrokerConfig;
use kartpark_auth::oauth::{IdentityProvider, IdpError, UpstreamTokens, UserIdentity};
use kartpark_auth::server::{AppState, create_router};
use kartpark_auth::store::InMemoryStore;

pub const BASE_URL: &str = "https://club.example.com";
pub const CLIENT_REDIRECT: &str = "http://localhost:7777/callback";
pub const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
pub const CHALLENGE: &str = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGEwiSm6-c";

/// Identity provider double.
///
/// IdP codes map to users through `codes`; access tokens are
/// `access-for-<user>`; refresh tokens are `refresh-for-<user>`.
#[derive(Default)]
pub struct FakeIdp {
    codes: Mutex<HashMap<String, String>>,
    token_status: Mutex<Option<u16>>,
    pub exchanges: Mutex<Vec<(String, String)>>,
}

impl FakeIdp {
    /// Make `code` log in as `user`.
    pub fn script_login(&self, code: &str, user: &str) {
        self.codes.lock().insert(code.to_string(), user.to_string());
    }

    /// Make every token endpoint call answer `status`.
    pub fn fail_token_endpoint(&self, status: u16) {
        *self.token_status.lock() = Some(status);
    }

    fn token_failure(&self) -> Result<(), IdpError> {
        match *self.token_status.lock() {
            Some(status) => Err(IdpError::Rejected { status }),
            None => Ok(()),
        }
    }
}

fn tokens_for(user: &str) -> UpstreamTokens {
    UpstreamTokens {
        access_token: format!("access-for-{user}"),
        refresh_token: Some(format!("refresh-for-{user}")),
    }
}

#[async_trait]
impl IdentityProvider for FakeIdp {
    fn authorize_url(&self, redirect_uri: &str, state: &str) -> Result<Url, IdpError> {
        let mut url = Url::parse("https://idp.example.com/oauth2/authorize")
            .map_err(|e| IdpError::Endpoint(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("state", state);
        Ok(url)
    }

    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<UpstreamTokens, IdpError> {
        self.token_failure()?;
        self.exchanges
            .lock()
            .push((code.to_string(), redirect_uri.to_string()));
        let user = self
            .codes
            .lock()
            .get(code)
            .cloned()
            .ok_or(IdpError::Rejected { status: 400 })?;
        Ok(tokens_for(&user))
    }

    async fn refresh(&self, refresh_token: &str) -> Result<UpstreamTokens, IdpError> {
        self.token_failure()?;
        let user = refresh_token
            .strip_prefix("refresh-for-")
            .ok_or(IdpError::Rejected { status: 400 })?;
        Ok(tokens_for(user))
    }

    async fn user_info(&self, access_token: &str) -> Result<UserIdentity, IdpError> {
        let user = access_token
            .strip_prefix("access-for-")
            .ok_or(IdpError::Rejected { status: 401 })?;
        Ok(UserIdentity {
            subject: user.to_string(),
            email: Some(format!("{user}@example.com")),
            name: Some(user.to_string()),
            picture: None,
        })
    }
}

/// A router wired to an in-memory store and a [`FakeIdp`].
pub struct TestApp {
    pub store: Arc<InMemoryStore>,
    pub idp: Arc<FakeIdp>,
    pub router: Router,
}

impl TestApp {
    pub fn new() -> Self {
        let store = Arc::new(InMemoryStore::new());
        let idp = Arc::new(FakeIdp::default());
        let config = BrokerConfig {
            base_url: BASE_URL.to_string(),
            ..Default::default()
        };
        let state = Arc::new(AppState::new(store.clone(), idp.clone(), config));
        let router = create_router(state, std::time::Duration::from_secs(5));
        Self { store, idp, router }
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }

    pub async fn get(&self, uri: &str) -> Response<Body> {
        self.send(Request::get(uri).body(Body::empty()).unwrap()).await
    }

    pub async fn get_authed(&self, uri: &str, token: &str) -> Response<Body> {
        self.send(
            Request::get(uri)
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    pub async fn post_json(&self, uri: &str, token: Option<&str>, body: &Value) -> Response<Body> {
        let mut builder = Request::post(uri).header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        self.send(builder.body(Body::from(body.to_string())).unwrap())
            .await
    }

    pub async fn post_form(&self, uri: &str, pairs: &[(&str, &str)]) -> Response<Body> {
        let body = serde_urlencoded::to_string(pairs).unwrap();
        self.send(
            Request::post(uri)
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
    }

    pub async fn delete_authed(&self, uri: &str, token: &str) -> Response<Body> {
        self.send(
            Request::delete(uri)
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    /// Register a client for [`CLIENT_REDIRECT`] and return its id.
    pub async fn register_client(&self) -> String {
        let response = self
            .post_json(
                "/oauth/register",
                None,
                &serde_json::json!({
                    "client_name": "Lap Timer",
                    "redirect_uris": [CLIENT_REDIRECT],
                }),
            )
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        json_body(response).await["client_id"]
            .as_str()
            .unwrap()
            .to_string()
    }

    /// Run authorize; return the session id the broker sent to the IdP.
    pub async fn start_authorization(&self, client_id: &str, state: &str) -> String {
        let response = self.get(&authorize_uri(client_id, state)).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        let location = location(&response);
        assert!(location.as_str().starts_with("https://idp.example.com/"));
        query_map(&location)["state"].clone()
    }

    /// Run authorize + callback as `user`; return the minted code.
    pub async fn obtain_code(&self, client_id: &str, user: &str) -> String {
        let idp_code = format!("idp-code-{user}");
        self.idp.script_login(&idp_code, user);
        let session = self.start_authorization(client_id, "xyz").await;

        let response = self
            .get(&format!("/oauth/callback?code={idp_code}&state={session}"))
            .await;
        assert_eq!(response.status(), StatusCode::FOUND);
        query_map(&location(&response))["code"].clone()
    }
}

pub fn authorize_uri(client_id: &str, state: &str) -> String {
    let query = serde_urlencoded::to_string([
        ("response_type", "code"),
        ("client_id", client_id),
        ("redirect_uri", CLIENT_REDIRECT),
        ("code_challenge", CHALLENGE),
        ("code_challenge_method", "S256"),
        ("state", state),
    ])
    .unwrap();
    format!("/oauth/authorize?{query}")
}

pub fn location(response: &Response<Body>) -> Url {
    let raw = response.headers()[header::LOCATION].to_str().unwrap();
    Url::parse(raw).unwrap()
}

pub fn query_map(url: &Url) -> HashMap<String, String> {
    url.query_pairs().into_owned().collect()
}

pub async fn json_body(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
