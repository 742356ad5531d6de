use std::sync::Arc;

use hearth::role::Role;

use serde::{Deserialize, Serialize};

use uuid::Uuid;

use crate::error::{Error, ErrorKind, Result};
use crate::provider::ConfigStore;

/// The config-store key the settings are persisted under.
pub const SETTINGS_KEY: &str = "settings";

const SETTINGS_VERSION: u32 = 1;

/// Everything the device knows about itself and its cloud service.
///
/// The integrator fills in the defaults (vendor identity, endpoints, API
/// credentials); the fields acquired at registration time are loaded from
/// and persisted to the config store.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// OAuth client id of the vendor.
    pub client_id: String,
    /// OAuth client secret of the vendor.
    pub client_secret: String,
    /// Cloud API key of the vendor.
    pub api_key: String,
    /// Base URL of the OAuth service, with a trailing slash.
    pub oauth_url: String,
    /// Base URL of the cloud device service, with a trailing slash.
    pub service_url: String,
    /// Host and port of the notification endpoint.
    pub xmpp_endpoint: String,
    /// Cloud model manifest id of the product.
    pub model_id: String,
    /// Vendor name.
    pub oem_name: String,
    /// Product model name.
    pub model_name: String,
    /// Human-readable device name.
    pub name: String,
    /// Free-form device description.
    pub description: String,
    /// Free-form device location.
    pub location: String,
    /// The maximum role handed to unauthenticated local callers.
    pub local_anonymous_access_role: Role,
    /// Whether a registration request may replace the endpoint fields.
    pub allow_endpoints_override: bool,
    /// Locally generated device id, stable across restarts.
    pub device_id: String,
    /// Cloud id assigned at registration.
    pub cloud_id: Option<String>,
    /// OAuth refresh token obtained at registration.
    pub refresh_token: Option<String>,
    /// Robot account e-mail the refresh token authenticates as.
    pub robot_account: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            api_key: String::new(),
            oauth_url: String::new(),
            service_url: String::new(),
            xmpp_endpoint: String::new(),
            model_id: String::new(),
            oem_name: String::new(),
            model_name: String::new(),
            name: String::new(),
            description: String::new(),
            location: String::new(),
            local_anonymous_access_role: Role::Viewer,
            allow_endpoints_override: false,
            device_id: String::new(),
            cloud_id: None,
            refresh_token: None,
            robot_account: None,
        }
    }
}

// The persisted subset of the settings.
#[derive(Debug, Serialize, Deserialize)]
struct StoredSettings {
    version: u32,
    device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cloud_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    robot_account: Option<String>,
}

/// The payload of a registration request.
///
/// Every field except `ticket_id` is optional; an empty string means
/// "use the default from [`Settings`]". Non-empty endpoint fields are only
/// accepted when [`Settings::allow_endpoints_override`] is set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistrationData {
    /// The one-shot claim ticket handed to the device.
    pub ticket_id: String,
    /// Override for [`Settings::oauth_url`].
    pub oauth_url: String,
    /// Override for [`Settings::service_url`].
    pub service_url: String,
    /// Override for [`Settings::api_key`].
    pub api_key: String,
    /// Override for [`Settings::client_id`].
    pub client_id: String,
    /// Override for [`Settings::client_secret`].
    pub client_secret: String,
    /// Override for [`Settings::xmpp_endpoint`].
    pub xmpp_endpoint: String,
}

impl RegistrationData {
    /// Creates a [`RegistrationData`] carrying only a claim ticket.
    #[must_use]
    pub fn with_ticket(ticket_id: impl Into<String>) -> Self {
        Self {
            ticket_id: ticket_id.into(),
            ..Self::default()
        }
    }

    fn overrides(&self) -> [&String; 6] {
        [
            &self.oauth_url,
            &self.service_url,
            &self.api_key,
            &self.client_id,
            &self.client_secret,
            &self.xmpp_endpoint,
        ]
    }
}

/// The device settings bound to their persistent store.
pub struct Config {
    settings: Settings,
    store: Arc<dyn ConfigStore>,
}

impl core::fmt::Debug for Config {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Config")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Loads the persisted settings on top of the given defaults.
    ///
    /// A missing store entry leaves the defaults untouched; a fresh device
    /// id is generated when none was persisted.
    ///
    /// # Errors
    ///
    /// Fails with `invalidFormat` when the stored settings do not parse and
    /// with `invalidState` on an unsupported settings version.
    pub fn load(defaults: Settings, store: Arc<dyn ConfigStore>) -> Result<Self> {
        let mut settings = defaults;
        if let Some(json) = store.load(SETTINGS_KEY) {
            let stored: StoredSettings = serde_json::from_str(&json).map_err(|e| {
                Error::with_source(
                    ErrorKind::InvalidFormat,
                    "Stored settings are not valid JSON",
                    e,
                )
            })?;
            if stored.version != SETTINGS_VERSION {
                return Err(Error::new(
                    ErrorKind::InvalidState,
                    format!("Unsupported settings version {}", stored.version),
                ));
            }
            settings.device_id = stored.device_id;
            settings.cloud_id = stored.cloud_id;
            settings.refresh_token = stored.refresh_token;
            settings.robot_account = stored.robot_account;
        }
        if settings.device_id.is_empty() {
            settings.device_id = Uuid::new_v4().to_string();
        }
        Ok(Self { settings, store })
    }

    /// Returns the current settings.
    #[must_use]
    pub const fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Returns whether the device holds cloud credentials.
    #[must_use]
    pub fn have_credentials(&self) -> bool {
        self.settings.cloud_id.is_some() && self.settings.refresh_token.is_some()
    }

    /// Persists the registration-acquired settings.
    ///
    /// # Errors
    ///
    /// Propagates the store failure.
    pub async fn save(&self) -> Result<()> {
        let stored = StoredSettings {
            version: SETTINGS_VERSION,
            device_id: self.settings.device_id.clone(),
            cloud_id: self.settings.cloud_id.clone(),
            refresh_token: self.settings.refresh_token.clone(),
            robot_account: self.settings.robot_account.clone(),
        };
        let json = serde_json::to_string(&stored).map_err(|e| {
            Error::with_source(ErrorKind::InvalidState, "Failed to serialize settings", e)
        })?;
        self.store.save(SETTINGS_KEY, json).await
    }

    /// Merges a registration request into the settings.
    ///
    /// Endpoint fields from the request win only when
    /// [`Settings::allow_endpoints_override`] is set; otherwise any
    /// non-empty override fails the whole request and nothing is mutated.
    ///
    /// # Errors
    ///
    /// Fails with `invalidParams` on a missing ticket or a forbidden
    /// endpoint override.
    pub fn apply_registration(&mut self, data: &RegistrationData) -> Result<()> {
        if data.ticket_id.is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidParams,
                "Registration ticket is required",
            ));
        }
        let overridden = data.overrides().iter().any(|field| !field.is_empty());
        if overridden && !self.settings.allow_endpoints_override {
            return Err(Error::new(
                ErrorKind::InvalidParams,
                "Endpoint overrides are not allowed",
            ));
        }

        if !data.oauth_url.is_empty() {
            self.settings.oauth_url = data.oauth_url.clone();
        }
        if !data.service_url.is_empty() {
            self.settings.service_url = data.service_url.clone();
        }
        if !data.api_key.is_empty() {
            self.settings.api_key = data.api_key.clone();
        }
        if !data.client_id.is_empty() {
            self.settings.client_id = data.client_id.clone();
        }
        if !data.client_secret.is_empty() {
            self.settings.client_secret = data.client_secret.clone();
        }
        if !data.xmpp_endpoint.is_empty() {
            self.settings.xmpp_endpoint = data.xmpp_endpoint.clone();
        }
        Ok(())
    }

    /// Installs the credentials acquired by a completed registration.
    pub fn set_credentials(
        &mut self,
        cloud_id: impl Into<String>,
        refresh_token: impl Into<String>,
        robot_account: impl Into<String>,
    ) {
        self.settings.cloud_id = Some(cloud_id.into());
        self.settings.refresh_token = Some(refresh_token.into());
        self.settings.robot_account = Some(robot_account.into());
    }

    /// Drops all cloud credentials.
    pub fn clear_credentials(&mut self) {
        self.settings.cloud_id = None;
        self.settings.refresh_token = None;
        self.settings.robot_account = None;
    }
}
