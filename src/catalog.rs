//! Client for the upstream Patch Catalog service (spec §4.4).
//!
//! Shaped after the teacher's `spotify` module: a thin `reqwest`-backed
//! client behind a narrow trait, so workflow code never touches `reqwest`
//! directly and tests can swap in [`FakeCatalogClient`] the way the
//! teacher's `TokenManager` seam is faked out in its own tests. Connections
//! are opened per call and dropped at the end of it — `reqwest::Client`
//! internally pools, so there is no connection-per-request plumbing to
//! hand-roll on top.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::types::{KillApp, Requirement};

/// Failures a Catalog call can produce, collapsed to the three buckets
/// [`crate::error::XoloError`] cares about (spec §4.4).
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog: not found: {0}")]
    NotFound(String),
    #[error("catalog: conflict: {0}")]
    Conflict(String),
    #[error("catalog: unavailable: {0}")]
    Unavailable(String),
}

pub type CatalogResult<T> = std::result::Result<T, CatalogError>;

/// A patch's capability criteria (spec §4.4 `set_patch_capabilities`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PatchCapabilities {
    pub min_os: String,
    pub max_os: Option<String>,
}

/// A Catalog "patch" record — one version of a title as the Catalog knows it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogPatch {
    pub id: String,
    pub title_id: String,
    pub version: String,
    pub enabled: bool,
}

/// Everything Xolo needs from the Patch Catalog — a close mirror of spec
/// §4.4's interface list rather than a generic CRUD surface, since several
/// operations (requirement/component kind) carry cross-cutting semantics
/// that a flat `update` would hide.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    async fn title_exists(&self, slug: &str) -> CatalogResult<bool>;
    async fn create_title(&self, slug: &str, display_name: &str, publisher: &str) -> CatalogResult<String>;
    async fn update_title(&self, catalog_title_id: &str, display_name: &str) -> CatalogResult<()>;
    async fn delete_title(&self, catalog_title_id: &str) -> CatalogResult<()>;

    /// Sets (or switches) the title's detection mechanism. Dispatches on
    /// [`Requirement`]'s tag per Design Note §9.
    async fn set_requirement(&self, catalog_title_id: &str, requirement: &Requirement) -> CatalogResult<()>;

    async fn create_patch(&self, catalog_title_id: &str, version: &str) -> CatalogResult<CatalogPatch>;
    async fn update_patch(&self, patch_id: &str, version: &str) -> CatalogResult<()>;
    async fn enable_patch(&self, patch_id: &str) -> CatalogResult<()>;
    async fn delete_patch(&self, patch_id: &str) -> CatalogResult<()>;

    /// Rewrites the patch's detection component to match the title's
    /// current requirement kind (used on requirement switch, spec §4.6
    /// `Title.update` step 4).
    async fn set_patch_component(&self, patch_id: &str, requirement: &Requirement) -> CatalogResult<()>;
    async fn set_patch_capabilities(&self, patch_id: &str, caps: &PatchCapabilities) -> CatalogResult<()>;
    async fn set_patch_killapps(&self, patch_id: &str, killapps: &[KillApp]) -> CatalogResult<()>;

    /// Whether the patch is visible to clients yet — polled by the
    /// patch-visibility watcher (spec §4.7).
    async fn patch_is_visible(&self, patch_id: &str) -> CatalogResult<bool>;
}

pub struct HttpCatalogClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpCatalogClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("building the catalog reqwest client should never fail");
        HttpCatalogClient {
            http,
            base_url: base_url.into(),
            token: token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.bearer_auth(&self.token)
    }

    async fn handle(resp: reqwest::Response) -> CatalogResult<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        match status.as_u16() {
            404 => Err(CatalogError::NotFound(body)),
            409 => Err(CatalogError::Conflict(body)),
            _ => Err(CatalogError::Unavailable(format!("status {status}: {body}"))),
        }
    }

    async fn send_json<T: Serialize + Sync>(
        &self,
        req: reqwest::RequestBuilder,
        body: &T,
    ) -> CatalogResult<reqwest::Response> {
        let resp = self
            .auth(req)
            .json(body)
            .send()
            .await
            .map_err(|e| CatalogError::Unavailable(e.to_string()))?;
        Self::handle(resp).await
    }
}

#[derive(Serialize)]
struct TitleBody<'a> {
    slug: &'a str,
    display_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    publisher: Option<&'a str>,
}

#[derive(Deserialize)]
struct IdBody {
    id: String,
}

#[derive(Deserialize)]
struct ExistsBody {
    exists: bool,
}

#[derive(Deserialize)]
struct VisibilityBody {
    visible: bool,
}

#[async_trait]
impl CatalogClient for HttpCatalogClient {
    async fn title_exists(&self, slug: &str) -> CatalogResult<bool> {
        let resp = self
            .auth(self.http.get(self.url(&format!("/titles/{slug}/exists"))))
            .send()
            .await
            .map_err(|e| CatalogError::Unavailable(e.to_string()))?;
        let resp = Self::handle(resp).await?;
        let body: ExistsBody = resp
            .json()
            .await
            .map_err(|e| CatalogError::Unavailable(format!("decoding response: {e}")))?;
        Ok(body.exists)
    }

    async fn create_title(&self, slug: &str, display_name: &str, publisher: &str) -> CatalogResult<String> {
        let resp = self
            .send_json(
                self.http.post(self.url("/titles")),
                &TitleBody { slug, display_name, publisher: Some(publisher) },
            )
            .await?;
        let body: IdBody = resp
            .json()
            .await
            .map_err(|e| CatalogError::Unavailable(format!("decoding response: {e}")))?;
        Ok(body.id)
    }

    async fn update_title(&self, catalog_title_id: &str, display_name: &str) -> CatalogResult<()> {
        self.send_json(
            self.http.put(self.url(&format!("/titles/{catalog_title_id}"))),
            &TitleBody { slug: "", display_name, publisher: None },
        )
        .await?;
        Ok(())
    }

    async fn delete_title(&self, catalog_title_id: &str) -> CatalogResult<()> {
        let resp = self
            .auth(self.http.delete(self.url(&format!("/titles/{catalog_title_id}"))))
            .send()
            .await
            .map_err(|e| CatalogError::Unavailable(e.to_string()))?;
        Self::handle(resp).await?;
        Ok(())
    }

    async fn set_requirement(&self, catalog_title_id: &str, requirement: &Requirement) -> CatalogResult<()> {
        self.send_json(
            self.http
                .put(self.url(&format!("/titles/{catalog_title_id}/requirement"))),
            requirement,
        )
        .await?;
        Ok(())
    }

    async fn create_patch(&self, catalog_title_id: &str, version: &str) -> CatalogResult<CatalogPatch> {
        #[derive(Serialize)]
        struct Body<'a> {
            title_id: &'a str,
            version: &'a str,
        }
        let resp = self
            .send_json(
                self.http.post(self.url("/patches")),
                &Body { title_id: catalog_title_id, version },
            )
            .await?;
        resp.json()
            .await
            .map_err(|e| CatalogError::Unavailable(format!("decoding response: {e}")))
    }

    async fn update_patch(&self, patch_id: &str, version: &str) -> CatalogResult<()> {
        #[derive(Serialize)]
        struct Body<'a> {
            version: &'a str,
        }
        self.send_json(
            self.http.put(self.url(&format!("/patches/{patch_id}"))),
            &Body { version },
        )
        .await?;
        Ok(())
    }

    async fn enable_patch(&self, patch_id: &str) -> CatalogResult<()> {
        #[derive(Serialize)]
        struct Body {
            enabled: bool,
        }
        self.send_json(
            self.http.put(self.url(&format!("/patches/{patch_id}/enable"))),
            &Body { enabled: true },
        )
        .await?;
        Ok(())
    }

    async fn delete_patch(&self, patch_id: &str) -> CatalogResult<()> {
        let resp = self
            .auth(self.http.delete(self.url(&format!("/patches/{patch_id}"))))
            .send()
            .await
            .map_err(|e| CatalogError::Unavailable(e.to_string()))?;
        Self::handle(resp).await?;
        Ok(())
    }

    async fn set_patch_component(&self, patch_id: &str, requirement: &Requirement) -> CatalogResult<()> {
        self.send_json(
            self.http
                .put(self.url(&format!("/patches/{patch_id}/component"))),
            requirement,
        )
        .await?;
        Ok(())
    }

    async fn set_patch_capabilities(&self, patch_id: &str, caps: &PatchCapabilities) -> CatalogResult<()> {
        self.send_json(
            self.http
                .put(self.url(&format!("/patches/{patch_id}/capabilities"))),
            caps,
        )
        .await?;
        Ok(())
    }

    async fn set_patch_killapps(&self, patch_id: &str, killapps: &[KillApp]) -> CatalogResult<()> {
        #[derive(Serialize)]
        struct Body<'a> {
            killapps: &'a [KillApp],
        }
        self.send_json(
            self.http.put(self.url(&format!("/patches/{patch_id}/killapps"))),
            &Body { killapps },
        )
        .await?;
        Ok(())
    }

    async fn patch_is_visible(&self, patch_id: &str) -> CatalogResult<bool> {
        let resp = self
            .auth(self.http.get(self.url(&format!("/patches/{patch_id}/visibility"))))
            .send()
            .await
            .map_err(|e| CatalogError::Unavailable(e.to_string()))?;
        let resp = Self::handle(resp).await?;
        let body: VisibilityBody = resp
            .json()
            .await
            .map_err(|e| CatalogError::Unavailable(format!("decoding response: {e}")))?;
        Ok(body.visible)
    }
}

struct FakeTitle {
    display_name: String,
    requirement: Option<Requirement>,
}

struct FakePatch {
    title_id: String,
    version: String,
    enabled: bool,
    component: Option<Requirement>,
    capabilities: PatchCapabilities,
    killapps: Vec<KillApp>,
}

/// In-memory fake used by workflow tests so they never touch the network
/// (spec §4.4's client trait exists precisely to make this possible).
#[derive(Default)]
pub struct FakeCatalogClient {
    titles: Mutex<HashMap<String, FakeTitle>>,
    patches: Mutex<HashMap<String, FakePatch>>,
    visible: Mutex<HashMap<String, bool>>,
    next_id: Mutex<u64>,
}

impl FakeCatalogClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self, prefix: &str) -> String {
        let mut n = self.next_id.lock().unwrap();
        *n += 1;
        format!("{prefix}-{n}")
    }

    /// Test hook: simulates the Catalog's own asynchronous propagation of a
    /// patch becoming visible to clients.
    pub fn set_visible(&self, patch_id: &str, visible: bool) {
        self.visible.lock().unwrap().insert(patch_id.to_string(), visible);
    }
}

#[async_trait]
impl CatalogClient for FakeCatalogClient {
    async fn title_exists(&self, slug: &str) -> CatalogResult<bool> {
        Ok(self.titles.lock().unwrap().contains_key(slug))
    }

    async fn create_title(&self, slug: &str, display_name: &str, _publisher: &str) -> CatalogResult<String> {
        let id = self.next_id("cat-title");
        self.titles.lock().unwrap().insert(
            id.clone(),
            FakeTitle {
                display_name: display_name.to_string(),
                requirement: None,
            },
        );
        let _ = slug;
        Ok(id)
    }

    async fn update_title(&self, catalog_title_id: &str, display_name: &str) -> CatalogResult<()> {
        let mut titles = self.titles.lock().unwrap();
        let title = titles
            .get_mut(catalog_title_id)
            .ok_or_else(|| CatalogError::NotFound(catalog_title_id.to_string()))?;
        title.display_name = display_name.to_string();
        Ok(())
    }

    async fn delete_title(&self, catalog_title_id: &str) -> CatalogResult<()> {
        self.titles
            .lock()
            .unwrap()
            .remove(catalog_title_id)
            .ok_or_else(|| CatalogError::NotFound(catalog_title_id.to_string()))?;
        Ok(())
    }

    async fn set_requirement(&self, catalog_title_id: &str, requirement: &Requirement) -> CatalogResult<()> {
        let mut titles = self.titles.lock().unwrap();
        let title = titles
            .get_mut(catalog_title_id)
            .ok_or_else(|| CatalogError::NotFound(catalog_title_id.to_string()))?;
        title.requirement = Some(requirement.clone());
        Ok(())
    }

    async fn create_patch(&self, catalog_title_id: &str, version: &str) -> CatalogResult<CatalogPatch> {
        if !self.titles.lock().unwrap().contains_key(catalog_title_id) {
            return Err(CatalogError::NotFound(catalog_title_id.to_string()));
        }
        let id = self.next_id("patch");
        self.patches.lock().unwrap().insert(
            id.clone(),
            FakePatch {
                title_id: catalog_title_id.to_string(),
                version: version.to_string(),
                enabled: false,
                component: None,
                capabilities: PatchCapabilities::default(),
                killapps: Vec::new(),
            },
        );
        self.visible.lock().unwrap().insert(id.clone(), false);
        Ok(CatalogPatch {
            id,
            title_id: catalog_title_id.to_string(),
            version: version.to_string(),
            enabled: false,
        })
    }

    async fn update_patch(&self, patch_id: &str, version: &str) -> CatalogResult<()> {
        let mut patches = self.patches.lock().unwrap();
        let patch = patches
            .get_mut(patch_id)
            .ok_or_else(|| CatalogError::NotFound(patch_id.to_string()))?;
        patch.version = version.to_string();
        Ok(())
    }

    async fn enable_patch(&self, patch_id: &str) -> CatalogResult<()> {
        let mut patches = self.patches.lock().unwrap();
        let patch = patches
            .get_mut(patch_id)
            .ok_or_else(|| CatalogError::NotFound(patch_id.to_string()))?;
        patch.enabled = true;
        Ok(())
    }

    async fn delete_patch(&self, patch_id: &str) -> CatalogResult<()> {
        self.patches
            .lock()
            .unwrap()
            .remove(patch_id)
            .ok_or_else(|| CatalogError::NotFound(patch_id.to_string()))?;
        self.visible.lock().unwrap().remove(patch_id);
        Ok(())
    }

    async fn set_patch_component(&self, patch_id: &str, requirement: &Requirement) -> CatalogResult<()> {
        let mut patches = self.patches.lock().unwrap();
        let patch = patches
            .get_mut(patch_id)
            .ok_or_else(|| CatalogError::NotFound(patch_id.to_string()))?;
        patch.component = Some(requirement.clone());
        Ok(())
    }

    async fn set_patch_capabilities(&self, patch_id: &str, caps: &PatchCapabilities) -> CatalogResult<()> {
        let mut patches = self.patches.lock().unwrap();
        let patch = patches
            .get_mut(patch_id)
            .ok_or_else(|| CatalogError::NotFound(patch_id.to_string()))?;
        patch.capabilities = caps.clone();
        Ok(())
    }

    async fn set_patch_killapps(&self, patch_id: &str, killapps: &[KillApp]) -> CatalogResult<()> {
        let mut patches = self.patches.lock().unwrap();
        let patch = patches
            .get_mut(patch_id)
            .ok_or_else(|| CatalogError::NotFound(patch_id.to_string()))?;
        patch.killapps = killapps.to_vec();
        Ok(())
    }

    async fn patch_is_visible(&self, patch_id: &str) -> CatalogResult<bool> {
        Ok(*self.visible.lock().unwrap().get(patch_id).unwrap_or(&false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script_requirement() -> Requirement {
        Requirement::Script {
            version_script: "#!/bin/sh\necho 1".into(),
        }
    }

    #[tokio::test]
    async fn create_title_then_set_requirement() {
        let client = FakeCatalogClient::new();
        let id = client.create_title("firefox", "Firefox", "Mozilla").await.unwrap();
        client.set_requirement(&id, &script_requirement()).await.unwrap();
        assert!(client.title_exists("firefox").await.unwrap());
    }

    #[tokio::test]
    async fn patch_visibility_starts_false_then_flips() {
        let client = FakeCatalogClient::new();
        let id = client.create_title("firefox", "Firefox", "Mozilla").await.unwrap();
        let patch = client.create_patch(&id, "120.0").await.unwrap();
        assert!(!client.patch_is_visible(&patch.id).await.unwrap());
        client.set_visible(&patch.id, true);
        assert!(client.patch_is_visible(&patch.id).await.unwrap());
    }

    #[tokio::test]
    async fn delete_unknown_patch_is_not_found() {
        let client = FakeCatalogClient::new();
        let err = client.delete_patch("nonexistent").await.unwrap_err();
        assert!(matches!(err, CatalogError::NotFound(_)));
    }
}
