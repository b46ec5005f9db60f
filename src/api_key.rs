//! API key lifecycle: create, read, update and delete, each mutation
//! followed by polling until reads agree with what was written.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{info, instrument};
use validator::Validate;

use crate::client::{path_segment, same_members, Client, HEADER_ON_BEHALF_OF};
use crate::error::{ErrorContext, Result};
use crate::reconciler::{Convergence, Reconciler, ReconcilerConfig};
use crate::request::Operation;
use crate::secret::write_secret;

const STATUS_OK: u16 = 200;
const STATUS_CREATED: u16 = 201;
const STATUS_NO_CONTENT: u16 = 204;
const STATUS_NOT_FOUND: u16 = 404;

const DELETE_RETRIES: u32 = 5;

/// API key as returned by reads. The key material itself is only ever
/// present in the create response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKey {
    #[serde(default)]
    pub api_key_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Create response. The key is wiped when this is dropped.
#[derive(Debug, Deserialize)]
struct CreatedApiKey {
    api_key_id: String,
    api_key: SecretString,
}

#[derive(Serialize)]
struct ApiKeyPayload<'a> {
    name: &'a str,
    scopes: &'a [String],
}

/// Desired state of an API key.
#[derive(Debug, Clone, Validate, Serialize, Deserialize)]
pub struct ApiKeySpec {
    #[validate(length(min = 1, message = "name cannot be empty"))]
    pub name: String,

    #[validate(length(min = 1, message = "at least one scope is required"))]
    pub scopes: Vec<String>,

    /// Subuser account the key belongs to, if not the parent account.
    #[serde(default)]
    pub on_behalf_of: Option<String>,

    /// Where the generated key is written.
    pub destination: PathBuf,
}

impl ApiKeySpec {
    fn payload(&self) -> ApiKeyPayload<'_> {
        ApiKeyPayload {
            name: &self.name,
            scopes: &self.scopes,
        }
    }
}

fn api_key_path(id: &str) -> String {
    format!("/v3/api_keys/{}", path_segment(id))
}

impl Client {
    #[instrument(skip_all, fields(name = %spec.name))]
    pub async fn create_api_key(&self, spec: &ApiKeySpec) -> Result<ApiKey> {
        spec.validate()?;

        let operation = Operation::post("/v3/api_keys")
            .with_json(&spec.payload())?
            .with_optional_header(HEADER_ON_BEHALF_OF, spec.on_behalf_of.as_deref());
        let options = self
            .options()
            .with_status(STATUS_CREATED)
            .with_rate_limit(&self.limiters().create_api_key);

        let response = self
            .execute(&operation, &options)
            .await
            .context("failed to create API key")?;
        let created: CreatedApiKey = response
            .json()
            .context("failed to unmarshal created API key")?;

        write_secret(&spec.destination, created.api_key.expose_secret().as_bytes())
            .await
            .context("failed to write API key to destination")?;
        info!(id = %created.api_key_id, "API key created");

        self.wait_for_api_key(&created.api_key_id, spec, self.create_reconciler())
            .await
            .context(format!(
                "error waiting for key {} (id: {}) to be created",
                spec.name, created.api_key_id
            ))
    }

    /// `None` when the key does not exist. The backend sometimes answers a
    /// missing key with 200 and an error body, which also maps to `None`.
    #[instrument(skip(self))]
    pub async fn get_api_key(
        &self,
        id: &str,
        on_behalf_of: Option<&str>,
    ) -> Result<Option<ApiKey>> {
        let operation = Operation::get(api_key_path(id))
            .with_optional_header(HEADER_ON_BEHALF_OF, on_behalf_of);
        let options = self
            .options()
            .with_status(STATUS_OK)
            .with_status(STATUS_NOT_FOUND);

        let response = self
            .execute(&operation, &options)
            .await
            .context("failed to query API key")?;
        if response.status == STATUS_NOT_FOUND {
            return Ok(None);
        }

        let key: ApiKey = response
            .json()
            .context("failed to unmarshal API key query response")?;
        if key.name.is_empty() {
            return Ok(None);
        }

        Ok(Some(key))
    }

    #[instrument(skip_all, fields(id = %id, name = %spec.name))]
    pub async fn update_api_key(&self, id: &str, spec: &ApiKeySpec) -> Result<ApiKey> {
        spec.validate()?;

        let operation = Operation::put(api_key_path(id))
            .with_json(&spec.payload())?
            .with_optional_header(HEADER_ON_BEHALF_OF, spec.on_behalf_of.as_deref());
        let options = self.options().with_status(STATUS_OK);

        self.execute(&operation, &options)
            .await
            .context("failed to update API key")?;

        self.wait_for_api_key(id, spec, self.update_reconciler())
            .await
            .context(format!(
                "error waiting for key {} (id: {}) to be updated",
                spec.name, id
            ))
    }

    /// Deleting a key that is already gone succeeds.
    #[instrument(skip(self))]
    pub async fn delete_api_key(&self, id: &str, on_behalf_of: Option<&str>) -> Result<()> {
        let operation = Operation::delete(api_key_path(id))
            .with_optional_header(HEADER_ON_BEHALF_OF, on_behalf_of);
        let options = self
            .options()
            .with_status(STATUS_NO_CONTENT)
            .with_status(STATUS_NOT_FOUND)
            .with_rate_limit(&self.limiters().delete_api_key)
            .with_retry(DELETE_RETRIES);

        self.execute(&operation, &options)
            .await
            .context("failed to delete API key")?;
        Ok(())
    }

    async fn wait_for_api_key(
        &self,
        id: &str,
        spec: &ApiKeySpec,
        config: &ReconcilerConfig,
    ) -> Result<ApiKey> {
        Reconciler::new(format!("API key {}", id), config.clone())
            .wait_for(move || self.probe_api_key(id, spec))
            .await
    }

    async fn probe_api_key(&self, id: &str, spec: &ApiKeySpec) -> Result<Convergence<ApiKey>> {
        let observed = match self.get_api_key(id, spec.on_behalf_of.as_deref()).await? {
            Some(key) => key,
            None => return Ok(Convergence::Pending),
        };

        if observed.name != spec.name || !same_members(&observed.scopes, &spec.scopes) {
            return Ok(Convergence::Pending);
        }

        Ok(Convergence::Converged(observed))
    }
}
