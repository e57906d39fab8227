pub mod chat;
pub mod model;
pub mod phq9;
pub mod results;

/// Shared connection details for the reqwest-backed collaborator clients.
/// Authenticated endpoints attach the bearer token when one is present.
#[derive(Clone)]
pub struct Endpoint {
    pub base_url: String,
    pub token: Option<String>,
    pub client: reqwest::Client,
}

impl Endpoint {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token,
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    pub fn authed(&self, rb: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(t) => rb.bearer_auth(t),
            None => rb,
        }
    }
}
