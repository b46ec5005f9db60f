//! Subuser accounts.
//!
//! A subuser has three independently changing sub-properties (disabled flag,
//! authenticated domain, IP list). Updates apply each changed one and then
//! wait for all of them concurrently.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::LazyLock;
use tracing::{debug, info, instrument};
use validator::Validate;

use crate::client::{path_segment, same_members, Client};
use crate::error::{Error, ErrorContext, Result};
use crate::group::ReconciliationGroup;
use crate::reconciler::{Convergence, Reconciler};
use crate::request::Operation;
use crate::secret::{self, write_secret, DEFAULT_SECRET_LENGTH, MIN_SECRET_LENGTH};

pub const DEFAULT_DOMAIN_ID: &str = "0";

const STATUS_OK: u16 = 200;
const STATUS_CREATED: u16 = 201;
const STATUS_NO_CONTENT: u16 = 204;
const STATUS_NOT_FOUND: u16 = 404;

const DELETE_RETRIES: u32 = 5;
const IP_PAGE_LIMIT: &str = "500";

static USERNAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._@+-]+$").expect("username pattern is valid"));

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subuser {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub disabled: bool,
}

/// Everything a read reports about a subuser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubuserState {
    pub username: String,
    pub email: String,
    pub disabled: bool,
    pub domain: String,
    pub ips: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasswordSpec {
    /// Where the generated password is written.
    pub destination: PathBuf,
    #[serde(default = "default_password_length")]
    pub length: usize,
}

fn default_password_length() -> usize {
    DEFAULT_SECRET_LENGTH
}

fn default_domain() -> String {
    DEFAULT_DOMAIN_ID.to_string()
}

/// Desired state of a new subuser.
#[derive(Debug, Clone, Validate, Serialize, Deserialize)]
pub struct SubuserSpec {
    #[validate(length(min = 1, message = "username cannot be empty"))]
    pub username: String,

    #[validate(email(message = "email must be a valid address"))]
    pub email: String,

    #[validate(length(min = 1, message = "at least one IP is required"))]
    pub ips: Vec<String>,

    #[serde(default)]
    pub disabled: bool,

    /// Authenticated domain id; `"0"` means none.
    #[serde(default = "default_domain")]
    pub domain: String,

    pub password: PasswordSpec,
}

impl SubuserSpec {
    pub fn check(&self) -> Result<()> {
        self.validate()?;

        if !USERNAME.is_match(&self.username) {
            return Err(Error::Validation(format!(
                "username {:?} contains invalid characters",
                self.username
            )));
        }

        if self.password.length < MIN_SECRET_LENGTH {
            return Err(Error::Validation(format!(
                "password length must be at least {}",
                MIN_SECRET_LENGTH
            )));
        }

        Ok(())
    }
}

/// Sub-properties to change; `None` leaves a property untouched and skips
/// its reconciler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubuserUpdate {
    pub disabled: Option<bool>,
    pub ips: Option<Vec<String>>,
    pub domain: Option<String>,
}

impl SubuserUpdate {
    pub fn is_empty(&self) -> bool {
        self.disabled.is_none() && self.ips.is_none() && self.domain.is_none()
    }
}

#[derive(Serialize)]
struct CreatePayload<'a> {
    username: &'a str,
    email: &'a str,
    password: &'a str,
    ips: &'a [String],
}

#[derive(Deserialize)]
struct DomainResponse {
    #[serde(default)]
    id: i64,
}

#[derive(Deserialize)]
struct IpEntry {
    ip: String,
}

fn subuser_path(username: &str) -> String {
    format!("/v3/subusers/{}", path_segment(username))
}

impl Client {
    #[instrument(skip_all, fields(username = %spec.username))]
    pub async fn create_subuser(&self, spec: &SubuserSpec) -> Result<SubuserState> {
        spec.check()?;

        let password = secret::generate(spec.password.length)?;
        write_secret(&spec.password.destination, password.as_bytes())
            .await
            .context("unable to save generated password")?;

        let operation = Operation::post("/v3/subusers").with_json(&CreatePayload {
            username: &spec.username,
            email: &spec.email,
            password: password.expose(),
            ips: &spec.ips,
        })?;
        drop(password);

        let options = self
            .options()
            .with_status(STATUS_CREATED)
            .with_rate_limit(&self.limiters().create_subuser);
        self.execute(&operation, &options)
            .await
            .context("failed to create subuser")?;
        info!("subuser created");

        let username = spec.username.as_str();
        Reconciler::new(format!("subuser {}", username), self.create_reconciler().clone())
            .wait_for(move || self.probe_subuser_exists(username))
            .await
            .context(format!("error waiting for subuser ({}) to be created", username))?;

        if spec.disabled {
            self.set_disabled(username, true)
                .await
                .context("failed to disable subuser")?;
        }

        if spec.domain != DEFAULT_DOMAIN_ID {
            self.set_domain(username, &spec.domain)
                .await
                .context("failed to set authenticated domain")?;
        }

        self.read_subuser(username)
            .await?
            .ok_or_else(|| {
                Error::Validation(format!("subuser {} disappeared after creation", username))
            })
    }

    /// `None` when the subuser does not exist.
    #[instrument(skip(self))]
    pub async fn get_subuser(&self, username: &str) -> Result<Option<Subuser>> {
        let options = self
            .options()
            .with_status(STATUS_OK)
            .with_status(STATUS_NOT_FOUND);

        let response = self
            .execute(&Operation::get(subuser_path(username)), &options)
            .await
            .context("failed to query subuser")?;
        if response.status == STATUS_NOT_FOUND {
            return Ok(None);
        }

        let user: Subuser = response
            .json()
            .context("failed to unmarshal subuser query response")?;
        Ok(Some(user))
    }

    /// Subuser together with its domain and IP assignments.
    pub async fn read_subuser(&self, username: &str) -> Result<Option<SubuserState>> {
        let Some(user) = self.get_subuser(username).await? else {
            return Ok(None);
        };

        let domain = self
            .get_domain(&user.username)
            .await
            .context("unable to get domain authentication for subuser")?;
        let ips = self
            .get_ips(&user.username)
            .await
            .context("unable to get IPs for subuser")?;

        Ok(Some(SubuserState {
            username: user.username,
            email: user.email,
            disabled: user.disabled,
            domain,
            ips,
        }))
    }

    #[instrument(skip_all, fields(username = %username))]
    pub async fn update_subuser(
        &self,
        username: &str,
        update: &SubuserUpdate,
    ) -> Result<SubuserState> {
        if let Some(disabled) = update.disabled {
            self.set_disabled(username, disabled)
                .await
                .context("failed to set user.disabled")?;
        }

        if let Some(ips) = &update.ips {
            self.set_ips(username, ips)
                .await
                .context("failed to set subuser IPs")?;
        }

        if let Some(domain) = &update.domain {
            self.set_domain(username, domain)
                .await
                .context("failed to set user.domain")?;
        }

        if update.is_empty() {
            debug!("no sub-properties changed");
        } else {
            self.wait_for_update(username, update).await?;
        }

        self.read_subuser(username)
            .await?
            .ok_or_else(|| {
                Error::Validation(format!("subuser {} disappeared during update", username))
            })
    }

    /// Wait concurrently for every sub-property `update` touched.
    async fn wait_for_update(&self, username: &str, update: &SubuserUpdate) -> Result<()> {
        let config = self.update_reconciler();
        let mut group = ReconciliationGroup::new();

        if let Some(disabled) = update.disabled {
            let (client, username, config) = (self.clone(), username.to_string(), config.clone());
            group.spawn("disabled", move |token| async move {
                Reconciler::new(format!("subuser {}", username), config)
                    .with_cancellation(token)
                    .wait_for(|| client.probe_subuser_disabled(&username, disabled))
                    .await
                    .map(|_| ())
                    .context(format!(
                        "error waiting for subuser ({}) to become consistent",
                        username
                    ))
            });
        }

        if let Some(domain) = update.domain.clone() {
            let (client, username, config) = (self.clone(), username.to_string(), config.clone());
            group.spawn("domain", move |token| async move {
                Reconciler::new(format!("domain for subuser {}", username), config)
                    .with_cancellation(token)
                    .wait_for(|| client.probe_domain(&username, &domain))
                    .await
                    .map(|_| ())
                    .context(format!(
                        "error waiting for domain for subuser ({}) to become consistent",
                        username
                    ))
            });
        }

        if let Some(ips) = update.ips.clone() {
            let (client, username, config) = (self.clone(), username.to_string(), config.clone());
            group.spawn("ips", move |token| async move {
                Reconciler::new(format!("IPs for subuser {}", username), config)
                    .with_cancellation(token)
                    .wait_for(|| client.probe_ips(&username, &ips))
                    .await
                    .map(|_| ())
                    .context(format!(
                        "error waiting for IPs for subuser ({}) to become consistent",
                        username
                    ))
            });
        }

        group.wait_all().await
    }

    /// Deleting a subuser that is already gone succeeds.
    #[instrument(skip(self))]
    pub async fn delete_subuser(&self, username: &str) -> Result<()> {
        let options = self
            .options()
            .with_status(STATUS_NO_CONTENT)
            .with_status(STATUS_NOT_FOUND)
            .with_rate_limit(&self.limiters().delete_subuser)
            .with_retry(DELETE_RETRIES);

        self.execute(&Operation::delete(subuser_path(username)), &options)
            .await
            .context("failed to delete subuser")?;
        Ok(())
    }

    pub async fn set_disabled(&self, username: &str, disabled: bool) -> Result<()> {
        let operation = Operation::patch(subuser_path(username))
            .with_json(&serde_json::json!({ "disabled": disabled }))?;

        self.execute(&operation, &self.options().with_status(STATUS_NO_CONTENT))
            .await?;
        Ok(())
    }

    /// Assign an authenticated domain, or remove the assignment for `"0"`.
    pub async fn set_domain(&self, username: &str, domain: &str) -> Result<()> {
        let operation = if domain == DEFAULT_DOMAIN_ID {
            Operation::delete("/v3/whitelabel/domains/subuser").with_query("username", username)
        } else {
            Operation::post(format!("/v3/whitelabel/domains/{}/subuser", path_segment(domain)))
                .with_json(&serde_json::json!({ "username": username }))?
        };
        let options = self
            .options()
            .with_status(STATUS_CREATED)
            .with_status(STATUS_NO_CONTENT);

        self.execute(&operation, &options).await?;
        Ok(())
    }

    pub async fn set_ips(&self, username: &str, ips: &[String]) -> Result<()> {
        let operation = Operation::put(format!("{}/ips", subuser_path(username))).with_json(ips)?;

        self.execute(&operation, &self.options().with_status(STATUS_OK))
            .await?;
        Ok(())
    }

    /// Id of the subuser's authenticated domain, `"0"` when none is assigned.
    pub async fn get_domain(&self, username: &str) -> Result<String> {
        let operation =
            Operation::get("/v3/whitelabel/domains/subuser").with_query("username", username);
        let options = self
            .options()
            .with_status(STATUS_OK)
            .with_status(STATUS_NOT_FOUND);

        let response = self
            .execute(&operation, &options)
            .await
            .context("failed to query domain")?;
        if response.status == STATUS_NOT_FOUND {
            return Ok(default_domain());
        }

        let domain: DomainResponse = response
            .json()
            .context("failed to unmarshal domain query response")?;
        Ok(domain.id.to_string())
    }

    // TODO: follow pagination once a subuser can hold more than one page of IPs.
    pub async fn get_ips(&self, username: &str) -> Result<Vec<String>> {
        let operation = Operation::get("/v3/ips")
            .with_query("subuser", username)
            .with_query("limit", IP_PAGE_LIMIT);

        let response = self
            .execute(&operation, &self.options().with_status(STATUS_OK))
            .await
            .context("failed to query IPs")?;
        let entries: Vec<IpEntry> = response
            .json()
            .context("failed to unmarshal IP query response")?;

        Ok(entries.into_iter().map(|entry| entry.ip).collect())
    }

    async fn probe_subuser_exists(&self, username: &str) -> Result<Convergence<Subuser>> {
        Ok(match self.get_subuser(username).await? {
            Some(user) => Convergence::Converged(user),
            None => Convergence::Pending,
        })
    }

    async fn probe_subuser_disabled(
        &self,
        username: &str,
        disabled: bool,
    ) -> Result<Convergence<Subuser>> {
        Ok(match self.get_subuser(username).await? {
            Some(user) if user.username == username && user.disabled == disabled => {
                Convergence::Converged(user)
            }
            _ => Convergence::Pending,
        })
    }

    async fn probe_domain(&self, username: &str, domain: &str) -> Result<Convergence<String>> {
        let observed = self.get_domain(username).await?;
        Ok(if observed == domain {
            Convergence::Converged(observed)
        } else {
            Convergence::Pending
        })
    }

    async fn probe_ips(&self, username: &str, ips: &[String]) -> Result<Convergence<Vec<String>>> {
        let observed = self.get_ips(username).await?;
        Ok(if same_members(&observed, ips) {
            Convergence::Converged(observed)
        } else {
            Convergence::Pending
        })
    }
}
