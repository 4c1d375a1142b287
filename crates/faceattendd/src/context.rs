use parking_lot::RwLock;
use reqwest::Url;

/// Where the attendance service lives and which admin token to present.
///
/// Shared by the recognition client and the gateway through an `Arc`.
#[derive(Debug)]
pub struct ApiContext {
    api_base: Url,
    recognize_path: String,
    admin_token: RwLock<Option<String>>,
}

impl ApiContext {
    pub fn new(api_base: Url, recognize_path: impl Into<String>) -> Self {
        Self {
            api_base,
            recognize_path: recognize_path.into(),
            admin_token: RwLock::new(None),
        }
    }

    pub fn api_base(&self) -> &Url {
        &self.api_base
    }

    /// `path` appended to the base URL's own path.
    pub fn endpoint(&self, path: &str) -> Url {
        let joined = format!(
            "{}/{}",
            self.api_base.path().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        let mut url = self.api_base.clone();
        url.set_path(&joined);
        url.set_query(None);
        url
    }

    pub fn recognize_url(&self) -> Url {
        self.endpoint(&self.recognize_path)
    }

    /// Use `token` for subsequent requests. Blank tokens log out.
    pub fn login(&self, token: impl Into<String>) {
        let token = token.into().trim().to_string();
        *self.admin_token.write() = (!token.is_empty()).then_some(token);
    }

    pub fn logout(&self) {
        *self.admin_token.write() = None;
    }

    pub fn token(&self) -> Option<String> {
        self.admin_token.read().clone()
    }
}
