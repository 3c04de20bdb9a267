//! Client for the downstream Fleet Management service (spec §4.5).
//!
//! Fleet's interface is considerably wider than the Catalog's — it owns
//! scoping groups, installer packages, and every flavour of deployment
//! policy — so the trait below groups operations the way §4.5 lists them
//! rather than flattening everything into one verb. As with
//! [`crate::catalog`], a real `reqwest`-backed client and an in-memory fake
//! share one trait so workflow tests never touch the network.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::types::Requirement;

#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("fleet: not found: {0}")]
    NotFound(String),
    #[error("fleet: conflict: {0}")]
    Conflict(String),
    #[error("fleet: unavailable: {0}")]
    Unavailable(String),
}

pub type FleetResult<T> = std::result::Result<T, FleetError>;

/// Which deployment policy a call targets (spec §4.5's five policy
/// flavours, collapsed to a tag rather than five near-identical methods).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    ManualInstall,
    AutoInstall,
    Patch,
    Uninstall,
    Expire,
    ClientData,
}

/// The scoping inputs a policy is built from — target groups, excluded
/// groups, and whether the frozen group is folded into the exclusion set
/// (every policy spec §4.6 describes excludes the frozen group).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyScope {
    pub target_groups: Vec<String>,
    pub excluded_groups: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyOptions {
    pub package_id: Option<String>,
    pub self_service: bool,
    pub allow_downgrade: bool,
    pub reboot: bool,
}

impl Default for PolicyOptions {
    fn default() -> Self {
        PolicyOptions {
            package_id: None,
            self_service: false,
            allow_downgrade: false,
            reboot: false,
        }
    }
}

#[async_trait]
pub trait FleetClient: Send + Sync {
    /// Ensures a self-service category exists for the title, returning its id.
    async fn ensure_category(&self, name: &str) -> FleetResult<String>;
    async fn delete_category(&self, category_id: &str) -> FleetResult<()>;

    /// Creates the `installed` smart group, whose criteria are derived from
    /// the title's requirement kind (Design Note §9).
    async fn create_installed_smart_group(&self, name: &str, requirement: &Requirement) -> FleetResult<String>;
    async fn update_installed_smart_group(&self, group_id: &str, requirement: &Requirement) -> FleetResult<()>;
    async fn delete_smart_group(&self, group_id: &str) -> FleetResult<()>;

    /// Creates the `frozen` static group, initially empty.
    async fn create_frozen_static_group(&self, name: &str) -> FleetResult<String>;
    async fn add_to_static_group(&self, group_id: &str, host: &str) -> FleetResult<()>;
    async fn remove_from_static_group(&self, group_id: &str, host: &str) -> FleetResult<()>;
    async fn delete_static_group(&self, group_id: &str) -> FleetResult<()>;

    async fn create_package(&self, title_slug: &str, version: &str, filename: &str) -> FleetResult<String>;
    async fn fetch_package(&self, package_id: &str) -> FleetResult<Option<String>>;
    async fn update_package(&self, package_id: &str, filename: &str) -> FleetResult<()>;
    async fn delete_package(&self, package_id: &str) -> FleetResult<()>;

    async fn create_policy(
        &self,
        kind: PolicyKind,
        name: &str,
        scope: &PolicyScope,
        options: &PolicyOptions,
    ) -> FleetResult<String>;
    async fn fetch_policy(&self, policy_id: &str) -> FleetResult<Option<PolicyOptions>>;
    async fn update_policy(&self, policy_id: &str, scope: &PolicyScope, options: &PolicyOptions) -> FleetResult<()>;
    async fn delete_policy(&self, policy_id: &str) -> FleetResult<()>;

    /// Flushes a policy's run logs — used by `ClientDataBuilder` after each
    /// upload (spec §4.11).
    async fn flush_policy_logs(&self, policy_id: &str) -> FleetResult<()>;

    async fn create_ea(&self, name: &str, script: &str) -> FleetResult<String>;
    async fn update_ea(&self, ea_id: &str, script: &str) -> FleetResult<()>;
    async fn delete_ea(&self, ea_id: &str) -> FleetResult<()>;

    async fn activate_patch_title(&self, patch_title_id: &str) -> FleetResult<()>;
    /// Whether the Fleet side has noticed a Catalog-side EA change yet
    /// (spec §4.7 EA-acceptance watcher: "as soon as the Fleet side reports
    /// `accepted=false`").
    async fn ea_accepted(&self, ea_id: &str) -> FleetResult<bool>;
    async fn submit_ea_acceptance(&self, ea_id: &str) -> FleetResult<()>;

    async fn upload_icon(&self, title_slug: &str, bytes: &[u8]) -> FleetResult<String>;
    /// Uploads an installer package via the configured external tool (spec
    /// §1 Out-of-scope: "package signing and upload shell-outs" — this
    /// method is the seam where that external tool is invoked, not its
    /// implementation).
    async fn upload_package_via_external_tool(&self, package_id: &str, path: &std::path::Path) -> FleetResult<()>;

    async fn mdm_deploy(&self, package_id: &str, scope: &PolicyScope) -> FleetResult<()>;

    /// Membership check used by the auth layer (spec §6).
    async fn is_member_of_group(&self, username: &str, group: &str) -> FleetResult<bool>;
    /// Credential-validated session check against the upstream identity
    /// provider (spec §6: "attempting a credential-validated connection to
    /// the upstream identity provider").
    async fn authenticate(&self, username: &str, password: &str) -> FleetResult<bool>;
}

pub struct HttpFleetClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpFleetClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("building the fleet reqwest client should never fail");
        HttpFleetClient {
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

    async fn handle(resp: reqwest::Response) -> FleetResult<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        match status.as_u16() {
            404 => Err(FleetError::NotFound(body)),
            409 => Err(FleetError::Conflict(body)),
            _ => Err(FleetError::Unavailable(format!("status {status}: {body}"))),
        }
    }

    async fn post_for_id(&self, path: &str, body: &impl Serialize) -> FleetResult<String> {
        #[derive(Deserialize)]
        struct IdBody {
            id: String,
        }
        let resp = self
            .auth(self.http.post(self.url(path)))
            .json(body)
            .send()
            .await
            .map_err(|e| FleetError::Unavailable(e.to_string()))?;
        let resp = Self::handle(resp).await?;
        let body: IdBody = resp
            .json()
            .await
            .map_err(|e| FleetError::Unavailable(format!("decoding response: {e}")))?;
        Ok(body.id)
    }

    async fn delete(&self, path: &str) -> FleetResult<()> {
        let resp = self
            .auth(self.http.delete(self.url(path)))
            .send()
            .await
            .map_err(|e| FleetError::Unavailable(e.to_string()))?;
        Self::handle(resp).await?;
        Ok(())
    }

    async fn put(&self, path: &str, body: &impl Serialize) -> FleetResult<()> {
        let resp = self
            .auth(self.http.put(self.url(path)))
            .json(body)
            .send()
            .await
            .map_err(|e| FleetError::Unavailable(e.to_string()))?;
        Self::handle(resp).await?;
        Ok(())
    }
}

#[async_trait]
impl FleetClient for HttpFleetClient {
    async fn ensure_category(&self, name: &str) -> FleetResult<String> {
        #[derive(Serialize)]
        struct Body<'a> {
            name: &'a str,
        }
        self.post_for_id("/categories", &Body { name }).await
    }

    async fn delete_category(&self, category_id: &str) -> FleetResult<()> {
        self.delete(&format!("/categories/{category_id}")).await
    }

    async fn create_installed_smart_group(&self, name: &str, requirement: &Requirement) -> FleetResult<String> {
        #[derive(Serialize)]
        struct Body<'a> {
            name: &'a str,
            requirement: &'a Requirement,
        }
        self.post_for_id("/smart_groups", &Body { name, requirement }).await
    }

    async fn update_installed_smart_group(&self, group_id: &str, requirement: &Requirement) -> FleetResult<()> {
        self.put(&format!("/smart_groups/{group_id}"), requirement).await
    }

    async fn delete_smart_group(&self, group_id: &str) -> FleetResult<()> {
        self.delete(&format!("/smart_groups/{group_id}")).await
    }

    async fn create_frozen_static_group(&self, name: &str) -> FleetResult<String> {
        #[derive(Serialize)]
        struct Body<'a> {
            name: &'a str,
        }
        self.post_for_id("/static_groups", &Body { name }).await
    }

    async fn add_to_static_group(&self, group_id: &str, host: &str) -> FleetResult<()> {
        #[derive(Serialize)]
        struct Body<'a> {
            host: &'a str,
        }
        self.put(&format!("/static_groups/{group_id}/members"), &Body { host }).await
    }

    async fn remove_from_static_group(&self, group_id: &str, host: &str) -> FleetResult<()> {
        self.delete(&format!("/static_groups/{group_id}/members/{host}")).await
    }

    async fn delete_static_group(&self, group_id: &str) -> FleetResult<()> {
        self.delete(&format!("/static_groups/{group_id}")).await
    }

    async fn create_package(&self, title_slug: &str, version: &str, filename: &str) -> FleetResult<String> {
        #[derive(Serialize)]
        struct Body<'a> {
            title_slug: &'a str,
            version: &'a str,
            filename: &'a str,
        }
        self.post_for_id("/packages", &Body { title_slug, version, filename }).await
    }

    async fn fetch_package(&self, package_id: &str) -> FleetResult<Option<String>> {
        #[derive(Deserialize)]
        struct Body {
            filename: Option<String>,
        }
        let resp = self
            .auth(self.http.get(self.url(&format!("/packages/{package_id}"))))
            .send()
            .await
            .map_err(|e| FleetError::Unavailable(e.to_string()))?;
        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        let resp = Self::handle(resp).await?;
        let body: Body = resp
            .json()
            .await
            .map_err(|e| FleetError::Unavailable(format!("decoding response: {e}")))?;
        Ok(body.filename)
    }

    async fn update_package(&self, package_id: &str, filename: &str) -> FleetResult<()> {
        #[derive(Serialize)]
        struct Body<'a> {
            filename: &'a str,
        }
        self.put(&format!("/packages/{package_id}"), &Body { filename }).await
    }

    async fn delete_package(&self, package_id: &str) -> FleetResult<()> {
        self.delete(&format!("/packages/{package_id}")).await
    }

    async fn create_policy(
        &self,
        kind: PolicyKind,
        name: &str,
        scope: &PolicyScope,
        options: &PolicyOptions,
    ) -> FleetResult<String> {
        #[derive(Serialize)]
        struct Body<'a> {
            kind: PolicyKind,
            name: &'a str,
            scope: &'a PolicyScope,
            options: &'a PolicyOptions,
        }
        self.post_for_id("/policies", &Body { kind, name, scope, options }).await
    }

    async fn fetch_policy(&self, policy_id: &str) -> FleetResult<Option<PolicyOptions>> {
        let resp = self
            .auth(self.http.get(self.url(&format!("/policies/{policy_id}"))))
            .send()
            .await
            .map_err(|e| FleetError::Unavailable(e.to_string()))?;
        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        let resp = Self::handle(resp).await?;
        let body: PolicyOptions = resp
            .json()
            .await
            .map_err(|e| FleetError::Unavailable(format!("decoding response: {e}")))?;
        Ok(Some(body))
    }

    async fn update_policy(&self, policy_id: &str, scope: &PolicyScope, options: &PolicyOptions) -> FleetResult<()> {
        #[derive(Serialize)]
        struct Body<'a> {
            scope: &'a PolicyScope,
            options: &'a PolicyOptions,
        }
        self.put(&format!("/policies/{policy_id}"), &Body { scope, options }).await
    }

    async fn delete_policy(&self, policy_id: &str) -> FleetResult<()> {
        self.delete(&format!("/policies/{policy_id}")).await
    }

    async fn flush_policy_logs(&self, policy_id: &str) -> FleetResult<()> {
        let resp = self
            .auth(self.http.post(self.url(&format!("/policies/{policy_id}/flush_logs"))))
            .send()
            .await
            .map_err(|e| FleetError::Unavailable(e.to_string()))?;
        Self::handle(resp).await?;
        Ok(())
    }

    async fn create_ea(&self, name: &str, script: &str) -> FleetResult<String> {
        #[derive(Serialize)]
        struct Body<'a> {
            name: &'a str,
            script: &'a str,
        }
        self.post_for_id("/extension_attributes", &Body { name, script }).await
    }

    async fn update_ea(&self, ea_id: &str, script: &str) -> FleetResult<()> {
        #[derive(Serialize)]
        struct Body<'a> {
            script: &'a str,
        }
        self.put(&format!("/extension_attributes/{ea_id}"), &Body { script }).await
    }

    async fn delete_ea(&self, ea_id: &str) -> FleetResult<()> {
        self.delete(&format!("/extension_attributes/{ea_id}")).await
    }

    async fn activate_patch_title(&self, patch_title_id: &str) -> FleetResult<()> {
        let resp = self
            .auth(self.http.post(self.url(&format!("/patch_titles/{patch_title_id}/activate"))))
            .send()
            .await
            .map_err(|e| FleetError::Unavailable(e.to_string()))?;
        Self::handle(resp).await?;
        Ok(())
    }

    async fn ea_accepted(&self, ea_id: &str) -> FleetResult<bool> {
        #[derive(Deserialize)]
        struct Body {
            accepted: bool,
        }
        let resp = self
            .auth(self.http.get(self.url(&format!("/extension_attributes/{ea_id}/accepted"))))
            .send()
            .await
            .map_err(|e| FleetError::Unavailable(e.to_string()))?;
        let resp = Self::handle(resp).await?;
        let body: Body = resp
            .json()
            .await
            .map_err(|e| FleetError::Unavailable(format!("decoding response: {e}")))?;
        Ok(body.accepted)
    }

    async fn submit_ea_acceptance(&self, ea_id: &str) -> FleetResult<()> {
        let resp = self
            .auth(self.http.post(self.url(&format!("/extension_attributes/{ea_id}/accept"))))
            .send()
            .await
            .map_err(|e| FleetError::Unavailable(e.to_string()))?;
        Self::handle(resp).await?;
        Ok(())
    }

    async fn upload_icon(&self, title_slug: &str, bytes: &[u8]) -> FleetResult<String> {
        let resp = self
            .auth(self.http.post(self.url(&format!("/titles/{title_slug}/icon"))))
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| FleetError::Unavailable(e.to_string()))?;
        let resp = Self::handle(resp).await?;
        #[derive(Deserialize)]
        struct Body {
            icon_id: String,
        }
        let body: Body = resp
            .json()
            .await
            .map_err(|e| FleetError::Unavailable(format!("decoding response: {e}")))?;
        Ok(body.icon_id)
    }

    async fn upload_package_via_external_tool(&self, package_id: &str, path: &std::path::Path) -> FleetResult<()> {
        let _ = (package_id, path);
        Err(FleetError::Unavailable(
            "package upload shell-out is external-tooling, not implemented here".into(),
        ))
    }

    async fn mdm_deploy(&self, package_id: &str, scope: &PolicyScope) -> FleetResult<()> {
        self.put(&format!("/packages/{package_id}/mdm_deploy"), scope).await
    }

    async fn is_member_of_group(&self, username: &str, group: &str) -> FleetResult<bool> {
        #[derive(Deserialize)]
        struct Body {
            is_member: bool,
        }
        let resp = self
            .auth(
                self.http
                    .get(self.url(&format!("/groups/{group}/members/{username}"))),
            )
            .send()
            .await
            .map_err(|e| FleetError::Unavailable(e.to_string()))?;
        let resp = Self::handle(resp).await?;
        let body: Body = resp
            .json()
            .await
            .map_err(|e| FleetError::Unavailable(format!("decoding response: {e}")))?;
        Ok(body.is_member)
    }

    async fn authenticate(&self, username: &str, password: &str) -> FleetResult<bool> {
        #[derive(Serialize)]
        struct Body<'a> {
            username: &'a str,
            password: &'a str,
        }
        #[derive(Deserialize)]
        struct RespBody {
            ok: bool,
        }
        let resp = self
            .http
            .post(self.url("/auth/validate"))
            .json(&Body { username, password })
            .send()
            .await
            .map_err(|e| FleetError::Unavailable(e.to_string()))?;
        if resp.status().as_u16() == 401 {
            return Ok(false);
        }
        let resp = Self::handle(resp).await?;
        let body: RespBody = resp
            .json()
            .await
            .map_err(|e| FleetError::Unavailable(format!("decoding response: {e}")))?;
        Ok(body.ok)
    }
}

#[derive(Default)]
struct FakeState {
    categories: HashMap<String, String>,
    smart_groups: HashMap<String, Requirement>,
    static_groups: HashMap<String, Vec<String>>,
    packages: HashMap<String, String>,
    policies: HashMap<String, (PolicyScope, PolicyOptions)>,
    eas: HashMap<String, String>,
    ea_accepted: HashMap<String, bool>,
    icons: HashMap<String, Vec<u8>>,
    group_members: HashMap<String, Vec<String>>,
    next_id: u64,
}

/// In-memory fake implementing enough of Fleet's surface for workflow
/// tests. `group_members` lets a test pre-seed admin-group membership for
/// the auth layer's tests.
pub struct FakeFleetClient {
    state: Mutex<FakeState>,
}

impl FakeFleetClient {
    pub fn new() -> Self {
        FakeFleetClient {
            state: Mutex::new(FakeState::default()),
        }
    }

    fn next_id(&self, prefix: &str, state: &mut FakeState) -> String {
        state.next_id += 1;
        format!("{prefix}-{}", state.next_id)
    }

    /// Test hook: seeds a user as a member of a group.
    pub fn add_member(&self, group: &str, username: &str) {
        self.state
            .lock()
            .unwrap()
            .group_members
            .entry(group.to_string())
            .or_default()
            .push(username.to_string());
    }

    pub fn set_ea_accepted(&self, ea_id: &str, accepted: bool) {
        self.state.lock().unwrap().ea_accepted.insert(ea_id.to_string(), accepted);
    }
}

impl Default for FakeFleetClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FleetClient for FakeFleetClient {
    async fn ensure_category(&self, name: &str) -> FleetResult<String> {
        let mut state = self.state.lock().unwrap();
        let id = self.next_id("cat", &mut state);
        state.categories.insert(id.clone(), name.to_string());
        Ok(id)
    }

    async fn delete_category(&self, category_id: &str) -> FleetResult<()> {
        self.state
            .lock()
            .unwrap()
            .categories
            .remove(category_id)
            .ok_or_else(|| FleetError::NotFound(category_id.to_string()))?;
        Ok(())
    }

    async fn create_installed_smart_group(&self, _name: &str, requirement: &Requirement) -> FleetResult<String> {
        let mut state = self.state.lock().unwrap();
        let id = self.next_id("smart", &mut state);
        state.smart_groups.insert(id.clone(), requirement.clone());
        Ok(id)
    }

    async fn update_installed_smart_group(&self, group_id: &str, requirement: &Requirement) -> FleetResult<()> {
        let mut state = self.state.lock().unwrap();
        let group = state
            .smart_groups
            .get_mut(group_id)
            .ok_or_else(|| FleetError::NotFound(group_id.to_string()))?;
        *group = requirement.clone();
        Ok(())
    }

    async fn delete_smart_group(&self, group_id: &str) -> FleetResult<()> {
        self.state
            .lock()
            .unwrap()
            .smart_groups
            .remove(group_id)
            .ok_or_else(|| FleetError::NotFound(group_id.to_string()))?;
        Ok(())
    }

    async fn create_frozen_static_group(&self, _name: &str) -> FleetResult<String> {
        let mut state = self.state.lock().unwrap();
        let id = self.next_id("static", &mut state);
        state.static_groups.insert(id.clone(), Vec::new());
        Ok(id)
    }

    async fn add_to_static_group(&self, group_id: &str, host: &str) -> FleetResult<()> {
        let mut state = self.state.lock().unwrap();
        let members = state
            .static_groups
            .get_mut(group_id)
            .ok_or_else(|| FleetError::NotFound(group_id.to_string()))?;
        if !members.iter().any(|m| m == host) {
            members.push(host.to_string());
        }
        Ok(())
    }

    async fn remove_from_static_group(&self, group_id: &str, host: &str) -> FleetResult<()> {
        let mut state = self.state.lock().unwrap();
        let members = state
            .static_groups
            .get_mut(group_id)
            .ok_or_else(|| FleetError::NotFound(group_id.to_string()))?;
        members.retain(|m| m != host);
        Ok(())
    }

    async fn delete_static_group(&self, group_id: &str) -> FleetResult<()> {
        self.state
            .lock()
            .unwrap()
            .static_groups
            .remove(group_id)
            .ok_or_else(|| FleetError::NotFound(group_id.to_string()))?;
        Ok(())
    }

    async fn create_package(&self, _title_slug: &str, _version: &str, filename: &str) -> FleetResult<String> {
        let mut state = self.state.lock().unwrap();
        let id = self.next_id("pkg", &mut state);
        state.packages.insert(id.clone(), filename.to_string());
        Ok(id)
    }

    async fn fetch_package(&self, package_id: &str) -> FleetResult<Option<String>> {
        Ok(self.state.lock().unwrap().packages.get(package_id).cloned())
    }

    async fn update_package(&self, package_id: &str, filename: &str) -> FleetResult<()> {
        let mut state = self.state.lock().unwrap();
        let existing = state
            .packages
            .get_mut(package_id)
            .ok_or_else(|| FleetError::NotFound(package_id.to_string()))?;
        *existing = filename.to_string();
        Ok(())
    }

    async fn delete_package(&self, package_id: &str) -> FleetResult<()> {
        self.state
            .lock()
            .unwrap()
            .packages
            .remove(package_id)
            .ok_or_else(|| FleetError::NotFound(package_id.to_string()))?;
        Ok(())
    }

    async fn create_policy(
        &self,
        _kind: PolicyKind,
        _name: &str,
        scope: &PolicyScope,
        options: &PolicyOptions,
    ) -> FleetResult<String> {
        let mut state = self.state.lock().unwrap();
        let id = self.next_id("policy", &mut state);
        state.policies.insert(id.clone(), (scope.clone(), options.clone()));
        Ok(id)
    }

    async fn fetch_policy(&self, policy_id: &str) -> FleetResult<Option<PolicyOptions>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .policies
            .get(policy_id)
            .map(|(_, opts)| opts.clone()))
    }

    async fn update_policy(&self, policy_id: &str, scope: &PolicyScope, options: &PolicyOptions) -> FleetResult<()> {
        let mut state = self.state.lock().unwrap();
        let entry = state
            .policies
            .get_mut(policy_id)
            .ok_or_else(|| FleetError::NotFound(policy_id.to_string()))?;
        *entry = (scope.clone(), options.clone());
        Ok(())
    }

    async fn delete_policy(&self, policy_id: &str) -> FleetResult<()> {
        self.state
            .lock()
            .unwrap()
            .policies
            .remove(policy_id)
            .ok_or_else(|| FleetError::NotFound(policy_id.to_string()))?;
        Ok(())
    }

    async fn flush_policy_logs(&self, _policy_id: &str) -> FleetResult<()> {
        Ok(())
    }

    async fn create_ea(&self, _name: &str, script: &str) -> FleetResult<String> {
        let mut state = self.state.lock().unwrap();
        let id = self.next_id("ea", &mut state);
        state.eas.insert(id.clone(), script.to_string());
        state.ea_accepted.insert(id.clone(), false);
        Ok(id)
    }

    async fn update_ea(&self, ea_id: &str, script: &str) -> FleetResult<()> {
        let mut state = self.state.lock().unwrap();
        let existing = state
            .eas
            .get_mut(ea_id)
            .ok_or_else(|| FleetError::NotFound(ea_id.to_string()))?;
        *existing = script.to_string();
        state.ea_accepted.insert(ea_id.to_string(), false);
        Ok(())
    }

    async fn delete_ea(&self, ea_id: &str) -> FleetResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .eas
            .remove(ea_id)
            .ok_or_else(|| FleetError::NotFound(ea_id.to_string()))?;
        state.ea_accepted.remove(ea_id);
        Ok(())
    }

    async fn activate_patch_title(&self, _patch_title_id: &str) -> FleetResult<()> {
        Ok(())
    }

    async fn ea_accepted(&self, ea_id: &str) -> FleetResult<bool> {
        Ok(*self.state.lock().unwrap().ea_accepted.get(ea_id).unwrap_or(&true))
    }

    async fn submit_ea_acceptance(&self, ea_id: &str) -> FleetResult<()> {
        self.state.lock().unwrap().ea_accepted.insert(ea_id.to_string(), true);
        Ok(())
    }

    async fn upload_icon(&self, title_slug: &str, bytes: &[u8]) -> FleetResult<String> {
        let mut state = self.state.lock().unwrap();
        let id = self.next_id("icon", &mut state);
        state.icons.insert(id.clone(), bytes.to_vec());
        let _ = title_slug;
        Ok(id)
    }

    async fn upload_package_via_external_tool(&self, _package_id: &str, _path: &std::path::Path) -> FleetResult<()> {
        Ok(())
    }

    async fn mdm_deploy(&self, package_id: &str, _scope: &PolicyScope) -> FleetResult<()> {
        if !self.state.lock().unwrap().packages.contains_key(package_id) {
            return Err(FleetError::NotFound(package_id.to_string()));
        }
        Ok(())
    }

    async fn is_member_of_group(&self, username: &str, group: &str) -> FleetResult<bool> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .group_members
            .get(group)
            .is_some_and(|members| members.iter().any(|m| m == username)))
    }

    async fn authenticate(&self, username: &str, password: &str) -> FleetResult<bool> {
        Ok(!username.is_empty() && !password.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ea_acceptance_flow() {
        let fleet = FakeFleetClient::new();
        let ea_id = fleet.create_ea("xolo-firefox-ea", "#!/bin/sh\necho 1").await.unwrap();
        assert!(!fleet.ea_accepted(&ea_id).await.unwrap());
        fleet.submit_ea_acceptance(&ea_id).await.unwrap();
        assert!(fleet.ea_accepted(&ea_id).await.unwrap());
    }

    #[tokio::test]
    async fn static_group_membership() {
        let fleet = FakeFleetClient::new();
        let group = fleet.create_frozen_static_group("xolo-firefox-frozen").await.unwrap();
        fleet.add_to_static_group(&group, "host-1").await.unwrap();
        fleet.add_to_static_group(&group, "host-1").await.unwrap();
        fleet.remove_from_static_group(&group, "host-1").await.unwrap();
    }

    #[tokio::test]
    async fn group_membership_check() {
        let fleet = FakeFleetClient::new();
        fleet.add_member("xolo-admins", "alice");
        assert!(fleet.is_member_of_group("alice", "xolo-admins").await.unwrap());
        assert!(!fleet.is_member_of_group("bob", "xolo-admins").await.unwrap());
    }
}
