use super::traits::{ClaimMap, ClaimsProvider, ScopeSet};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Everything the token pipeline wants to know about a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl UserProfile {
    pub fn claims(&self) -> ClaimMap {
        let mut claims = ClaimMap::new();
        let mut put = |name: &str, value: &Option<String>| {
            if let Some(v) = value.as_deref().filter(|v| !v.is_empty()) {
                claims.insert(name.to_string(), Value::String(v.to_string()));
            }
        };
        put("first_name", &self.first_name);
        put("last_name", &self.last_name);
        put("email", &self.email);
        put("tenant_id", &self.tenant_id);
        claims.insert("user_id".into(), Value::String(self.id.clone()));
        if !self.roles.is_empty() {
            claims.insert(
                "role".into(),
                Value::Array(self.roles.iter().cloned().map(Value::String).collect()),
            );
        }
        claims
    }
}

/// Which enrichment claims each identity scope releases into an id token / userinfo
const IDENTITY_SCOPE_CLAIMS: &[(&str, &[&str])] = &[
    ("profile", &["first_name", "last_name", "user_id", "tenant_id"]),
    ("email", &["email"]),
    ("roles", &["role"]),
];

pub const IDENTITY_SCOPES: &[&str] = &["openid", "profile", "email", "roles"];

pub fn is_identity_scope(scope: &str) -> bool {
    IDENTITY_SCOPES.contains(&scope)
}

/// Narrow `claims` to what the granted identity scopes allow
pub fn identity_claims(claims: &ClaimMap, scopes: &ScopeSet) -> ClaimMap {
    IDENTITY_SCOPE_CLAIMS
        .iter()
        .filter(|(scope, _)| scopes.contains(*scope))
        .flat_map(|(_, names)| names.iter())
        .filter_map(|name| claims.get(*name).map(|v| (name.to_string(), v.clone())))
        .collect()
}

/// Profiles loaded from the catalog. Good enough for dev setups and tests; anything real
/// goes through [`HttpProfileService`].
#[derive(Debug, Default)]
pub struct StaticProfileStore {
    users: HashMap<String, UserProfile>,
}

impl StaticProfileStore {
    pub fn new(users: Vec<UserProfile>) -> Self {
        Self {
            users: users.into_iter().map(|u| (u.id.clone(), u)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }
}

#[async_trait]
impl ClaimsProvider for StaticProfileStore {
    async fn enrich(&self, subject_id: &str) -> Result<ClaimMap> {
        Ok(self
            .users
            .get(subject_id)
            .map(UserProfile::claims)
            .unwrap_or_default())
    }

    async fn is_active(&self, subject_id: &str) -> Result<bool> {
        Ok(self.users.get(subject_id).is_some_and(|u| u.is_active))
    }
}

/// `UserDto` as served by the users api
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserDto {
    id: String,
    email: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
    #[serde(default)]
    tenant_id: Option<String>,
    #[serde(default)]
    is_active: bool,
    #[serde(default)]
    roles: Vec<String>,
}

impl From<UserDto> for UserProfile {
    fn from(dto: UserDto) -> Self {
        Self {
            id: dto.id,
            first_name: dto.first_name,
            last_name: dto.last_name,
            email: dto.email,
            tenant_id: dto.tenant_id,
            roles: dto.roles,
            is_active: dto.is_active,
        }
    }
}

/// Claims provider backed by the users api (`GET {base}/api/users/{id}`)
#[derive(Clone)]
pub struct HttpProfileService {
    client: Client,
    base_url: url::Url,
    auth_header: Option<String>,
}

impl HttpProfileService {
    pub fn new(base_url: &str, token: Option<&str>, timeout: Duration) -> Result<Self> {
        let base_url = url::Url::parse(base_url)
            .map_err(|e| anyhow!("Invalid profile service url '{}': {}", base_url, e))?;
        if base_url.cannot_be_a_base() {
            return Err(anyhow!("Profile service url '{}' can't be a base", base_url));
        }

        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url,
            auth_header: token.map(|t| format!("Bearer {}", t)),
        })
    }

    fn user_url(&self, id: &str) -> url::Url {
        let mut url = self.base_url.clone();
        // cannot_be_a_base was ruled out in new(), so this always hands back segments
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(["api", "users", id]);
        }
        url
    }

    /// `None` when the api doesn't know the user
    pub async fn fetch(&self, id: &str) -> Result<Option<UserProfile>> {
        let mut request = self.client.get(self.user_url(id));
        if let Some(auth) = &self.auth_header {
            request = request.header("Authorization", auth);
        }
        let response = request.send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Failed to fetch user {}: {} - {}", id, status, body));
        }

        let dto: UserDto = response.json().await?;
        Ok(Some(dto.into()))
    }
}

#[async_trait]
impl ClaimsProvider for HttpProfileService {
    async fn enrich(&self, subject_id: &str) -> Result<ClaimMap> {
        Ok(self
            .fetch(subject_id)
            .await?
            .map(|u| u.claims())
            .unwrap_or_default())
    }

    async fn is_active(&self, subject_id: &str) -> Result<bool> {
        Ok(self.fetch(subject_id).await?.is_some_and(|u| u.is_active))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::traits::parse_scopes;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn alice() -> UserProfile {
        UserProfile {
            id: "alice".into(),
            first_name: Some("Alice".into()),
            last_name: Some("Smith".into()),
            email: Some("alice@example.com".into()),
            tenant_id: Some("tenant-1".into()),
            roles: vec!["Admin".into(), "User".into()],
            is_active: true,
        }
    }

    #[test]
    fn profile_claims_match_the_token_contract() {
        let claims = alice().claims();
        assert_eq!(claims["first_name"], "Alice");
        assert_eq!(claims["last_name"], "Smith");
        assert_eq!(claims["email"], "alice@example.com");
        assert_eq!(claims["user_id"], "alice");
        assert_eq!(claims["tenant_id"], "tenant-1");
        assert_eq!(claims["role"], serde_json::json!(["Admin", "User"]));
    }

    #[test]
    fn identity_claims_follow_granted_scopes() {
        let claims = alice().claims();

        let only_openid = identity_claims(&claims, &parse_scopes(Some("openid")));
        assert!(only_openid.is_empty());

        let email = identity_claims(&claims, &parse_scopes(Some("openid email")));
        assert_eq!(email.len(), 1);
        assert_eq!(email["email"], "alice@example.com");

        let all = identity_claims(&claims, &parse_scopes(Some("openid profile email roles")));
        assert_eq!(all.len(), claims.len());
    }

    #[tokio::test]
    async fn static_store_answers_activity_and_claims() {
        let mut bob = alice();
        bob.id = "bob".into();
        bob.is_active = false;
        let store = StaticProfileStore::new(vec![alice(), bob]);

        assert!(store.is_active("alice").await.unwrap());
        assert!(!store.is_active("bob").await.unwrap());
        assert!(!store.is_active("nobody").await.unwrap());
        assert!(store.enrich("nobody").await.unwrap().is_empty());
        assert_eq!(store.enrich("alice").await.unwrap()["user_id"], "alice");
    }

    #[tokio::test]
    async fn http_service_maps_user_dto() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/users/alice"))
            .and(header("authorization", "Bearer svc-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "alice",
                "email": "alice@example.com",
                "firstName": "Alice",
                "lastName": "Smith",
                "phoneNumber": null,
                "createdAt": "2024-01-01T00:00:00Z",
                "lastLoginAt": null,
                "isActive": true,
                "roles": ["User"]
            })))
            .mount(&server)
            .await;

        let service =
            HttpProfileService::new(&server.uri(), Some("svc-token"), Duration::from_secs(2)).unwrap();

        assert!(service.is_active("alice").await.unwrap());
        let claims = service.enrich("alice").await.unwrap();
        assert_eq!(claims["first_name"], "Alice");
        assert_eq!(claims["role"], serde_json::json!(["User"]));
    }

    #[tokio::test]
    async fn http_service_treats_404_as_inactive_and_5xx_as_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/users/ghost"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/users/broken"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let service = HttpProfileService::new(&server.uri(), None, Duration::from_secs(2)).unwrap();

        assert!(!service.is_active("ghost").await.unwrap());
        assert!(service.enrich("ghost").await.unwrap().is_empty());
        assert!(service.is_active("broken").await.is_err());
    }
}
