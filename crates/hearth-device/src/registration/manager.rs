use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration as StdDuration;

use hearth::role::{Role, UserInfo};

use serde_json::{json, Value};

use tokio::sync::Mutex;
use tokio::time::sleep;

use tokio_util::sync::CancellationToken;

use tracing::{error, info, warn};

use url::form_urlencoded;

use crate::auth::AuthManager;
use crate::b64_encode;
use crate::components::ComponentManager;
use crate::error::{Error, ErrorKind, Result};
use crate::provider::{Clock, HttpClient, Method, Request, Response, CONTENT_TYPE_JSON};
use crate::settings::{Config, RegistrationData, Settings};

use super::Backoff;

// Refresh the access token this long before it expires.
const REFRESH_GUARD_SECS: u64 = 60;
const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

// The pseudo-user the cloud authenticates as on the local API.
const CLOUD_USER_ID: u64 = 0;

/// The device's cloud connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudState {
    /// No cloud credentials; the device waits for registration.
    Unconfigured,
    /// Credentials exist; the device works towards a live connection.
    Connecting,
    /// The device holds a valid access token and serves the cloud.
    Connected,
    /// The cloud rejected the credentials; only clearing them helps.
    InvalidCredentials,
}

impl std::fmt::Display for CloudState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Unconfigured => "unconfigured",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::InvalidCredentials => "invalid-credentials",
        }
        .fmt(f)
    }
}

struct CloudInner {
    state: CloudState,
    access_token: Option<String>,
    refresh_task: Option<CancellationToken>,
}

struct Shared {
    config: Mutex<Config>,
    components: Arc<StdMutex<ComponentManager>>,
    http: Arc<dyn HttpClient>,
    auth: Arc<AuthManager>,
    clock: Arc<dyn Clock>,
    inner: StdMutex<CloudInner>,
}

fn build_url(base: &str, suffix: &str, params: &[(&str, &str)]) -> String {
    let mut url = format!("{base}{suffix}");
    if !params.is_empty() {
        let query: String = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params)
            .finish();
        url.push('?');
        url.push_str(&query);
    }
    url
}

fn json_str(value: &Value, field: &str) -> Result<String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidFormat,
                format!("Response field '{field}' is missing"),
            )
        })
}

// Responses of the device service: any 2xx JSON body is a success.
fn service_response(response: &Response) -> Result<Value> {
    let json = response.json()?;
    if response.is_success() {
        return Ok(json);
    }
    Err(Error::new(
        ErrorKind::NetworkError,
        format!("Cloud request failed with HTTP status {}", response.status),
    ))
}

// Responses of the OAuth endpoint: failures carry an `error` field whose
// value is the error kind.
fn oauth_response(response: &Response) -> Result<Value> {
    let json = response.json()?;
    if response.is_success() {
        return Ok(json);
    }
    let kind = match json.get("error").and_then(Value::as_str) {
        Some("invalid_grant") => ErrorKind::InvalidGrant,
        _ => ErrorKind::UnableToAuthenticate,
    };
    Err(Error::new(
        kind,
        format!("OAuth request failed with HTTP status {}", response.status),
    ))
}

/// The registration state machine: turns an anonymous device into a
/// registered one and thereafter keeps its access token fresh, publishes
/// command and state updates, and pulls new commands from the cloud.
pub struct RegistrationManager {
    shared: Arc<Shared>,
}

impl RegistrationManager {
    /// Creates a [`RegistrationManager`] around the given configuration
    /// and component manager.
    ///
    /// A device whose settings already carry credentials starts in the
    /// `Connecting` state; call [`RegistrationManager::start`] to bring the
    /// connection up.
    #[must_use]
    pub fn new(
        config: Config,
        components: Arc<StdMutex<ComponentManager>>,
        http: Arc<dyn HttpClient>,
        auth: Arc<AuthManager>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let state = if config.have_credentials() {
            CloudState::Connecting
        } else {
            CloudState::Unconfigured
        };
        Self {
            shared: Arc::new(Shared {
                config: Mutex::new(config),
                components,
                http,
                auth,
                clock,
                inner: StdMutex::new(CloudInner {
                    state,
                    access_token: None,
                    refresh_task: None,
                }),
            }),
        }
    }

    /// Returns the current cloud connection state.
    #[must_use]
    pub fn cloud_state(&self) -> CloudState {
        self.shared.inner.lock().unwrap().state
    }

    /// Returns a snapshot of the current settings.
    pub async fn settings(&self) -> Settings {
        self.shared.config.lock().await.settings().clone()
    }

    /// Builds a device-service URL from a path suffix and query
    /// parameters, URL-encoded in the caller's order.
    pub async fn service_url(&self, suffix: &str, params: &[(&str, &str)]) -> String {
        let settings = self.settings().await;
        build_url(&settings.service_url, suffix, params)
    }

    /// Builds an OAuth-service URL from a path suffix and query
    /// parameters, URL-encoded in the caller's order.
    pub async fn oauth_url(&self, suffix: &str, params: &[(&str, &str)]) -> String {
        let settings = self.settings().await;
        build_url(&settings.oauth_url, suffix, params)
    }

    /// Brings up the cloud connection of an already-registered device by
    /// scheduling an immediate access-token refresh.
    pub fn start(&self) {
        if self.cloud_state() == CloudState::Connecting {
            self.schedule_refresh(StdDuration::ZERO);
        }
    }

    /// Registers the device with the cloud through a claim ticket.
    ///
    /// The flow claims the ticket with the device draft, finalizes it,
    /// trades the returned authorization code for OAuth tokens, and
    /// uploads the local auth info. On success the credentials are
    /// persisted and the state moves to `Connecting`.
    ///
    /// # Errors
    ///
    /// Fails with `already_registered` when credentials exist, with
    /// `invalidParams` on a forbidden endpoint override (nothing is
    /// mutated), and surfaces transport and cloud failures; the state
    /// stays `Unconfigured` on any failure.
    pub async fn register_device(&self, registration_data: RegistrationData) -> Result<()> {
        let (settings, draft) = {
            let mut config = self.shared.config.lock().await;
            if config.have_credentials() {
                return Err(Error::new(
                    ErrorKind::AlreadyRegistered,
                    "Device is already registered",
                ));
            }
            config.apply_registration(&registration_data)?;
            let settings = config.settings().clone();
            let draft = {
                let components = self.shared.components.lock().unwrap();
                json!({
                    "id": registration_data.ticket_id,
                    "oauthClientId": settings.client_id,
                    "deviceDraft": {
                        "modelManifestId": settings.model_id,
                        "channel": {"supportedType": "pull"},
                        "traits": components.traits_json()?,
                        "components": components.components_json()?,
                    }
                })
            };
            (settings, draft)
        };

        // Claim the ticket with the device draft.
        let ticket_url = build_url(
            &settings.service_url,
            &format!("registrationTickets/{}", registration_data.ticket_id),
            &[("key", settings.api_key.as_str())],
        );
        let response = self
            .shared
            .http
            .send(Request::new(Method::Patch, ticket_url).json(&draft))
            .await?;
        service_response(&response)?;

        // Finalize it; the cloud answers with the robot account.
        let finalize_url = build_url(
            &settings.service_url,
            &format!("registrationTickets/{}/finalize", registration_data.ticket_id),
            &[("key", settings.api_key.as_str())],
        );
        let response = self
            .shared
            .http
            .send(Request::new(Method::Post, finalize_url))
            .await?;
        let ticket = service_response(&response)?;
        let robot_account = json_str(&ticket, "robotAccountEmail")?;
        let auth_code = json_str(&ticket, "robotAccountAuthorizationCode")?;
        let cloud_id = ticket
            .pointer("/deviceDraft/id")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::InvalidFormat,
                    "Registration response carries no device id",
                )
            })?;

        // Trade the authorization code for the OAuth tokens.
        let form = form_urlencoded::Serializer::new(String::new())
            .append_pair("grant_type", "authorization_code")
            .append_pair("code", &auth_code)
            .append_pair("client_id", &settings.client_id)
            .append_pair("client_secret", &settings.client_secret)
            .append_pair("redirect_uri", "oob")
            .finish();
        let response = self
            .shared
            .http
            .send(Request::new(Method::Post, build_url(&settings.oauth_url, "token", &[])).form(form))
            .await?;
        let tokens = oauth_response(&response)?;
        let access_token = json_str(&tokens, "access_token")?;
        let refresh_token = json_str(&tokens, "refresh_token")?;
        let expires_in = tokens
            .get("expires_in")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_EXPIRES_IN_SECS);

        // Hand the cloud our local auth info.
        let client_token = self.shared.auth.create_access_token(
            &UserInfo::new(Role::Owner, CLOUD_USER_ID),
            self.shared.clock.now(),
        );
        let auth_info = json!({
            "localAuthInfo": {
                "certFingerprint": b64_encode(self.shared.auth.certificate_fingerprint()),
                "localId": settings.device_id,
                "clientToken": b64_encode(&client_token),
            }
        });
        let upsert_url = build_url(
            &settings.service_url,
            &format!("devices/{cloud_id}/upsertLocalAuthInfo"),
            &[],
        );
        let response = self
            .shared
            .http
            .send(
                Request::new(Method::Post, upsert_url)
                    .bearer(&access_token)
                    .json(&auth_info),
            )
            .await?;
        service_response(&response)?;

        {
            let mut config = self.shared.config.lock().await;
            config.set_credentials(cloud_id, refresh_token, robot_account);
            config.save().await?;
        }
        {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.state = CloudState::Connecting;
            inner.access_token = Some(access_token);
        }
        self.schedule_refresh(StdDuration::from_secs(
            expires_in.saturating_sub(REFRESH_GUARD_SECS),
        ));
        info!("Device registered with the cloud");
        Ok(())
    }

    /// Obtains a fresh access token from the refresh token.
    ///
    /// On success the state moves to `Connected` and the next refresh is
    /// scheduled shortly before the token expires.
    ///
    /// # Errors
    ///
    /// Fails with `invalid_grant` (state becomes `InvalidCredentials` and
    /// the access token is dropped; stored settings stay untouched), with
    /// `unable_to_authenticate` or `network_error` on recoverable failures
    /// (state falls back to `Connecting`), and with `invalidState` on an
    /// unregistered device.
    pub async fn refresh_access_token(&self) -> Result<()> {
        let delay = self.refresh_once().await?;
        self.schedule_refresh(delay);
        Ok(())
    }

    // One refresh round trip; returns how long to wait before the next.
    // Scheduling is the caller's business: the public entry point starts a
    // fresh refresh loop, the loop itself just keeps going.
    async fn refresh_once(&self) -> Result<StdDuration> {
        let settings = self.settings().await;
        let Some(refresh_token) = settings.refresh_token.clone() else {
            return Err(Error::new(
                ErrorKind::InvalidState,
                "Device is not registered",
            ));
        };

        let form = form_urlencoded::Serializer::new(String::new())
            .append_pair("grant_type", "refresh_token")
            .append_pair("refresh_token", &refresh_token)
            .append_pair("client_id", &settings.client_id)
            .append_pair("client_secret", &settings.client_secret)
            .finish();
        let request =
            Request::new(Method::Post, build_url(&settings.oauth_url, "token", &[])).form(form);

        let tokens = match self.shared.http.send(request).await.and_then(|response| {
            oauth_response(&response)
        }) {
            Ok(tokens) => tokens,
            Err(e) => {
                self.note_refresh_failure(&e);
                return Err(e);
            }
        };

        let access_token = json_str(&tokens, "access_token")?;
        let expires_in = tokens
            .get("expires_in")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.access_token = Some(access_token);
            inner.state = CloudState::Connected;
        }
        Ok(StdDuration::from_secs(
            expires_in.saturating_sub(REFRESH_GUARD_SECS),
        ))
    }

    /// Drops the cloud credentials and returns to `Unconfigured`.
    ///
    /// This is the only exit from `InvalidCredentials`.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub async fn clear_credentials(&self) -> Result<()> {
        {
            let mut config = self.shared.config.lock().await;
            config.clear_credentials();
            config.save().await?;
        }
        let mut inner = self.shared.inner.lock().unwrap();
        if let Some(task) = inner.refresh_task.take() {
            task.cancel();
        }
        inner.access_token = None;
        inner.state = CloudState::Unconfigured;
        Ok(())
    }

    /// Feeds a list of cloud-delivered command documents into the command
    /// pipeline; commands the component manager rejects are dropped with a
    /// warning, re-deliveries of known ids are ignored.
    pub fn ingest_cloud_commands(&self, commands: &[Value]) {
        let mut components = self.shared.components.lock().unwrap();
        for command in commands {
            if let Some(id) = command.get("id").and_then(Value::as_str) {
                if components.find_command(id).is_some() {
                    continue;
                }
            }
            if let Err(e) = components.add_cloud_command(command) {
                warn!("Dropping a cloud command: {e}");
            }
        }
    }

    /// Pulls the device's queued commands from the cloud and ingests
    /// them, returning how many arrived.
    ///
    /// # Errors
    ///
    /// Fails with `invalidState` without a token and surfaces transport
    /// failures.
    pub async fn fetch_commands(&self) -> Result<usize> {
        let (settings, access_token) = self.request_context().await?;
        let cloud_id = require_cloud_id(&settings)?;
        let url = build_url(
            &settings.service_url,
            "commands",
            &[("deviceId", cloud_id.as_str()), ("state", "queued")],
        );
        let response = self
            .shared
            .http
            .send(
                Request::new(Method::Get, url.as_str())
                    .bearer(&access_token)
                    .header("Content-Type", CONTENT_TYPE_JSON),
            )
            .await?;
        let json = service_response(&response)?;
        let commands = json
            .get("commands")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let count = commands.len();
        self.ingest_cloud_commands(&commands);
        Ok(count)
    }

    /// Publishes the status patches queued commands recorded since the
    /// last call, marking finished commands for delayed removal.
    ///
    /// # Errors
    ///
    /// Fails with `invalidState` without a token and surfaces transport
    /// failures; patches drained before a failure are lost.
    pub async fn publish_command_updates(&self) -> Result<()> {
        let updates = self
            .shared
            .components
            .lock()
            .unwrap()
            .take_command_updates();
        if updates.is_empty() {
            return Ok(());
        }
        let (settings, access_token) = self.request_context().await?;
        for update in updates {
            let url = build_url(&settings.service_url, &format!("commands/{}", update.id), &[]);
            for patch in &update.patches {
                let response = self
                    .shared
                    .http
                    .send(
                        Request::new(Method::Patch, url.as_str())
                            .bearer(&access_token)
                            .json(patch),
                    )
                    .await?;
                service_response(&response)?;
            }
            if update.terminal {
                self.shared
                    .components
                    .lock()
                    .unwrap()
                    .schedule_command_removal(update.id);
            }
        }
        Ok(())
    }

    /// Publishes the journalled state changes and acknowledges the
    /// covered update id back to the component manager.
    ///
    /// # Errors
    ///
    /// Fails with `invalidState` without a token and surfaces transport
    /// failures; drained journal entries are lost on failure.
    pub async fn publish_state_updates(&self) -> Result<()> {
        let snapshot = self
            .shared
            .components
            .lock()
            .unwrap()
            .get_and_clear_recorded_state_changes();
        if snapshot.state_changes.is_empty() {
            return Ok(());
        }
        let (settings, access_token) = self.request_context().await?;
        let cloud_id = require_cloud_id(&settings)?;

        let patches: Vec<Value> = snapshot
            .state_changes
            .iter()
            .map(|change| {
                json!({
                    "timeMs": change.timestamp.timestamp_millis(),
                    "component": change.component,
                    "patch": change.changed_properties,
                })
            })
            .collect();
        let body = json!({
            "requestTimeMs": self.shared.clock.now().timestamp_millis(),
            "patches": patches,
        });
        let url = build_url(
            &settings.service_url,
            &format!("devices/{cloud_id}/patchState"),
            &[],
        );
        let response = self
            .shared
            .http
            .send(Request::new(Method::Post, url.as_str()).bearer(&access_token).json(&body))
            .await?;
        service_response(&response)?;

        self.shared
            .components
            .lock()
            .unwrap()
            .notify_state_updated_on_server(snapshot.update_id);
        Ok(())
    }

    /// Fetches the cloud's view of the device document.
    ///
    /// # Errors
    ///
    /// Fails with `invalidState` without a token and surfaces transport
    /// failures.
    pub async fn get_device_info(&self) -> Result<Value> {
        let (settings, access_token) = self.request_context().await?;
        let cloud_id = require_cloud_id(&settings)?;
        let url = build_url(&settings.service_url, &format!("devices/{cloud_id}"), &[]);
        let response = self
            .shared
            .http
            .send(
                Request::new(Method::Get, url.as_str())
                    .bearer(&access_token)
                    .header("Content-Type", CONTENT_TYPE_JSON),
            )
            .await?;
        service_response(&response)
    }

    /// One pull-channel cycle: fetch new commands, then push pending
    /// command and state updates.
    ///
    /// # Errors
    ///
    /// Surfaces the first failing step.
    pub async fn poll(&self) -> Result<()> {
        self.fetch_commands().await?;
        self.publish_command_updates().await?;
        self.publish_state_updates().await
    }

    #[cfg(test)]
    pub(crate) fn set_access_token(&self, token: &str) {
        self.shared.inner.lock().unwrap().access_token = Some(token.to_owned());
    }

    async fn request_context(&self) -> Result<(Settings, String)> {
        let settings = self.settings().await;
        let access_token = self
            .shared
            .inner
            .lock()
            .unwrap()
            .access_token
            .clone()
            .ok_or_else(|| {
                Error::new(ErrorKind::InvalidState, "No cloud access token available")
            })?;
        Ok((settings, access_token))
    }

    fn note_refresh_failure(&self, e: &Error) {
        let mut inner = self.shared.inner.lock().unwrap();
        if e.kind() == ErrorKind::InvalidGrant {
            error!("Refresh token rejected; registration credentials are invalid");
            inner.state = CloudState::InvalidCredentials;
            // The state is terminal: any leftover access token must not
            // keep cloud calls alive.
            inner.access_token = None;
        } else if inner.state == CloudState::Connected {
            inner.state = CloudState::Connecting;
        }
    }

    // Runs the refresh loop: sleep, refresh, repeat shortly before the new
    // token expires. Transient failures retry with backoff; a successful
    // refresh resets it. Only `invalid_grant` ends the loop for good.
    fn schedule_refresh(&self, delay: StdDuration) {
        let token = CancellationToken::new();
        {
            let mut inner = self.shared.inner.lock().unwrap();
            if let Some(previous) = inner.refresh_task.take() {
                previous.cancel();
            }
            inner.refresh_task = Some(token.clone());
        }

        let weak = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            let mut backoff = Backoff::default();
            let mut delay = delay;
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    () = sleep(delay) => {}
                }
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                let manager = RegistrationManager { shared };
                match manager.refresh_once().await {
                    Ok(next) => {
                        backoff.reset();
                        delay = next;
                    }
                    Err(e) if e.kind() == ErrorKind::InvalidGrant => break,
                    Err(e) => {
                        delay = backoff.next_delay();
                        warn!("Access token refresh failed, retrying in {delay:?}: {e}");
                    }
                }
            }
        });
    }
}

fn require_cloud_id(settings: &Settings) -> Result<String> {
    settings
        .cloud_id
        .clone()
        .ok_or_else(|| Error::new(ErrorKind::InvalidState, "Device is not registered"))
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex as StdMutex};

    use serde_json::{json, Value};

    use crate::auth::AuthManager;
    use crate::components::ComponentManager;
    use crate::error::ErrorKind;
    use crate::provider::{MemoryConfigStore, Method, Request, Response};
    use crate::settings::{Config, RegistrationData, SETTINGS_KEY};
    use crate::tests::{
        default_settings, FixedClock, ScriptedHttpClient, TEST_AUTH_SECRET, TEST_CERT_FINGERPRINT,
    };
    use crate::b64_encode;

    use super::{CloudState, RegistrationManager};

    const CLOUD_ID: &str = "4a7ea2d1-b331-1e1f-b206-e863c7635196";
    const ACCESS_TOKEN: &str = "test-access-token";
    const REFRESH_TOKEN: &str = "test-refresh-token";
    const ROBOT_ACCOUNT: &str = "robot@devices.example";

    struct Fixture {
        manager: RegistrationManager,
        components: Arc<StdMutex<ComponentManager>>,
        http: Arc<ScriptedHttpClient>,
        store: Arc<MemoryConfigStore>,
        clock: Arc<FixedClock>,
    }

    fn fixture(registered: bool, allow_endpoints_override: bool) -> Fixture {
        let clock = Arc::new(FixedClock::at(1_450_000_000));
        let store = if registered {
            Arc::new(MemoryConfigStore::with_entry(
                SETTINGS_KEY,
                json!({
                    "version": 1,
                    "device_id": "f6885e46-b432-42d7-86a5-d759bfb61f62",
                    "cloud_id": CLOUD_ID,
                    "refresh_token": REFRESH_TOKEN,
                    "robot_account": ROBOT_ACCOUNT,
                })
                .to_string(),
            ))
        } else {
            Arc::new(MemoryConfigStore::new())
        };

        let mut defaults = default_settings();
        defaults.allow_endpoints_override = allow_endpoints_override;
        let config = Config::load(defaults, store.clone()).unwrap();

        let components = Arc::new(StdMutex::new(ComponentManager::new(clock.clone())));
        let http = ScriptedHttpClient::new();
        let auth = Arc::new(AuthManager::new(
            TEST_AUTH_SECRET,
            TEST_CERT_FINGERPRINT,
            clock.clone(),
        ));
        let manager = RegistrationManager::new(
            config,
            components.clone(),
            http.clone(),
            auth,
            clock.clone(),
        );
        Fixture {
            manager,
            components,
            http,
            store,
            clock,
        }
    }

    fn scenario_traits() -> Value {
        json!({
            "_foo": {
                "commands": {
                    "reboot": {
                        "parameters": {"delay": {"minimum": 10, "type": "integer"}},
                        "minimalRole": "user"
                    }
                },
                "state": {
                    "firmwareVersion": {"type": "string"}
                }
            },
            "_robot": {
                "commands": {
                    "jump": {
                        "parameters": {"_height": {"type": "integer"}},
                        "minimalRole": "user"
                    }
                }
            }
        })
    }

    fn load_scenario_components(components: &Arc<StdMutex<ComponentManager>>) {
        let mut components = components.lock().unwrap();
        components.load_traits(&scenario_traits()).unwrap();
        components
            .add_component("", "comp", vec!["_foo".into(), "_robot".into()])
            .unwrap();
        components
            .set_state_property("comp", "_foo.firmwareVersion", json!("1.0"))
            .unwrap();
    }

    fn body_json(request: &Request) -> Value {
        serde_json::from_slice(request.body.as_deref().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn url_builders_encode_parameters() {
        let fixture = fixture(false, false);
        let manager = &fixture.manager;

        assert_eq!(manager.service_url("", &[]).await, "http://cloud.server.example/");
        assert_eq!(
            manager.service_url("registrationTickets", &[]).await,
            "http://cloud.server.example/registrationTickets"
        );
        assert_eq!(
            manager
                .service_url("registrationTickets", &[("key", "test-api-key")])
                .await,
            "http://cloud.server.example/registrationTickets?key=test-api-key"
        );
        assert_eq!(
            manager
                .service_url(
                    "registrationTickets",
                    &[("key", "test-api-key"), ("restart", "true")]
                )
                .await,
            "http://cloud.server.example/registrationTickets?key=test-api-key&restart=true"
        );
        assert_eq!(
            manager
                .oauth_url(
                    "auth",
                    &[
                        ("redirect_uri", "urn:ietf:wg:oauth:2.0:oob"),
                        ("response_type", "code"),
                        ("client_id", "device-client-id"),
                    ]
                )
                .await,
            "http://oauth.server.example/auth?redirect_uri=urn%3Aietf%3Awg%3Aoauth%3A2.0%3Aoob&\
             response_type=code&client_id=device-client-id"
        );
    }

    #[tokio::test]
    async fn register_device_runs_the_claim_flow_in_order() {
        let fixture = fixture(false, false);
        load_scenario_components(&fixture.components);
        assert_eq!(fixture.manager.cloud_state(), CloudState::Unconfigured);

        fixture.http.expect(
            Method::Patch,
            "http://cloud.server.example/registrationTickets/RTcUE?key=test-api-key",
            |request| {
                let body = body_json(request);
                assert_eq!(body["id"], "RTcUE");
                assert_eq!(body["oauthClientId"], "device-client-id");
                assert_eq!(body["deviceDraft"]["channel"]["supportedType"], "pull");
                assert_eq!(body["deviceDraft"]["modelManifestId"], "AAAAA");
                assert_eq!(body["deviceDraft"]["traits"], scenario_traits());
                assert_eq!(
                    body["deviceDraft"]["components"],
                    json!({
                        "comp": {
                            "traits": ["_foo", "_robot"],
                            "state": {"_foo": {"firmwareVersion": "1.0"}}
                        }
                    })
                );
                Response::with_json(200, &json!({"id": "RTcUE"}))
            },
        );
        fixture.http.expect(
            Method::Post,
            "http://cloud.server.example/registrationTickets/RTcUE/finalize?key=test-api-key",
            |_| {
                Response::with_json(
                    200,
                    &json!({
                        "robotAccountEmail": ROBOT_ACCOUNT,
                        "robotAccountAuthorizationCode": "robot-auth-code",
                        "deviceDraft": {"id": CLOUD_ID},
                    }),
                )
            },
        );
        fixture.http.expect(
            Method::Post,
            "http://oauth.server.example/token",
            |request| {
                assert_eq!(request.form_field("grant_type").as_deref(), Some("authorization_code"));
                assert_eq!(request.form_field("code").as_deref(), Some("robot-auth-code"));
                assert_eq!(request.form_field("client_id").as_deref(), Some("device-client-id"));
                assert_eq!(
                    request.form_field("client_secret").as_deref(),
                    Some("device-client-secret")
                );
                assert_eq!(request.form_field("redirect_uri").as_deref(), Some("oob"));
                Response::with_json(
                    200,
                    &json!({
                        "access_token": ACCESS_TOKEN,
                        "refresh_token": REFRESH_TOKEN,
                        "expires_in": 3600,
                    }),
                )
            },
        );
        fixture.http.expect(
            Method::Post,
            format!("http://cloud.server.example/devices/{CLOUD_ID}/upsertLocalAuthInfo"),
            |request| {
                let body = body_json(request);
                assert_eq!(
                    body["localAuthInfo"]["certFingerprint"],
                    json!(b64_encode(&TEST_CERT_FINGERPRINT))
                );
                assert_eq!(
                    body["localAuthInfo"]["localId"],
                    "f6885e46-b432-42d7-86a5-d759bfb61f62"
                );
                assert!(body["localAuthInfo"]["clientToken"].is_string());
                Response::with_json(200, &json!({}))
            },
        );

        fixture
            .manager
            .register_device(RegistrationData::with_ticket("RTcUE"))
            .await
            .unwrap();
        fixture.http.verify_done();

        assert_eq!(fixture.manager.cloud_state(), CloudState::Connecting);
        let settings = fixture.manager.settings().await;
        assert_eq!(settings.cloud_id.as_deref(), Some(CLOUD_ID));
        assert_eq!(settings.refresh_token.as_deref(), Some(REFRESH_TOKEN));
        assert_eq!(settings.robot_account.as_deref(), Some(ROBOT_ACCOUNT));

        // The credentials survived into the store.
        let stored: Value =
            serde_json::from_str(&fixture.store.get(SETTINGS_KEY).unwrap()).unwrap();
        assert_eq!(stored["cloud_id"], CLOUD_ID);
        assert_eq!(stored["refresh_token"], REFRESH_TOKEN);
        assert_eq!(stored["robot_account"], ROBOT_ACCOUNT);
    }

    #[tokio::test]
    async fn re_registration_is_rejected() {
        let fixture = fixture(true, false);
        assert_eq!(fixture.manager.cloud_state(), CloudState::Connecting);

        let error = fixture
            .manager
            .register_device(RegistrationData::with_ticket("RTcUE"))
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::AlreadyRegistered);
        assert_eq!(fixture.manager.cloud_state(), CloudState::Connecting);

        let settings = fixture.manager.settings().await;
        assert_eq!(settings.cloud_id.as_deref(), Some(CLOUD_ID));
        assert_eq!(settings.refresh_token.as_deref(), Some(REFRESH_TOKEN));
    }

    #[tokio::test]
    async fn endpoint_override_without_permission_mutates_nothing() {
        let fixture = fixture(false, false);
        let before = fixture.manager.settings().await;

        let mut data = RegistrationData::with_ticket("RTcUE");
        data.service_url = "https://test.service/".to_owned();
        let error = fixture.manager.register_device(data).await.unwrap_err();

        assert_eq!(error.kind(), ErrorKind::InvalidParams);
        assert_eq!(fixture.manager.cloud_state(), CloudState::Unconfigured);
        assert_eq!(fixture.manager.settings().await, before);
        fixture.http.verify_done();
    }

    #[tokio::test]
    async fn refresh_with_invalid_grant_invalidates_credentials() {
        let fixture = fixture(true, false);
        // A previously issued token must not outlive the credentials.
        fixture.manager.set_access_token(ACCESS_TOKEN);
        fixture.http.expect(
            Method::Post,
            "http://oauth.server.example/token",
            |request| {
                assert_eq!(request.form_field("grant_type").as_deref(), Some("refresh_token"));
                assert_eq!(
                    request.form_field("refresh_token").as_deref(),
                    Some(REFRESH_TOKEN)
                );
                assert_eq!(request.form_field("client_id").as_deref(), Some("device-client-id"));
                assert_eq!(
                    request.form_field("client_secret").as_deref(),
                    Some("device-client-secret")
                );
                Response::with_json(400, &json!({"error": "invalid_grant"}))
            },
        );

        let error = fixture.manager.refresh_access_token().await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::InvalidGrant);
        assert_eq!(fixture.manager.cloud_state(), CloudState::InvalidCredentials);
        // The cloud id survives; only clearing the credentials resets it.
        assert_eq!(
            fixture.manager.settings().await.cloud_id.as_deref(),
            Some(CLOUD_ID)
        );

        // The state is terminal: no cloud call may replay the stale token.
        let error = fixture.manager.get_device_info().await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::InvalidState);
        fixture.http.verify_done();
    }

    #[tokio::test]
    async fn refresh_failure_stays_recoverable() {
        let fixture = fixture(true, false);
        fixture.http.expect(
            Method::Post,
            "http://oauth.server.example/token",
            |_| Response::with_json(400, &json!({"error": "unable_to_authenticate"})),
        );

        let error = fixture.manager.refresh_access_token().await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::UnableToAuthenticate);
        assert_eq!(fixture.manager.cloud_state(), CloudState::Connecting);
    }

    #[tokio::test]
    async fn refresh_success_connects() {
        let fixture = fixture(true, false);
        fixture.http.expect(
            Method::Post,
            "http://oauth.server.example/token",
            |_| {
                Response::with_json(
                    200,
                    &json!({"access_token": ACCESS_TOKEN, "expires_in": 3600}),
                )
            },
        );

        fixture.manager.refresh_access_token().await.unwrap();
        assert_eq!(fixture.manager.cloud_state(), CloudState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn start_refreshes_immediately_for_registered_devices() {
        let fixture = fixture(true, false);
        assert_eq!(fixture.manager.cloud_state(), CloudState::Connecting);
        fixture.http.expect(
            Method::Post,
            "http://oauth.server.example/token",
            |request| {
                assert_eq!(
                    request.form_field("grant_type").as_deref(),
                    Some("refresh_token")
                );
                assert_eq!(
                    request.form_field("refresh_token").as_deref(),
                    Some(REFRESH_TOKEN)
                );
                Response::with_json(
                    200,
                    &json!({"access_token": ACCESS_TOKEN, "expires_in": 3600}),
                )
            },
        );

        fixture.manager.start();
        // The refresh runs on a background task; give it a few polls.
        for _ in 0..50 {
            if fixture.manager.cloud_state() == CloudState::Connected {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(fixture.manager.cloud_state(), CloudState::Connected);
        fixture.http.verify_done();
    }

    #[tokio::test]
    async fn start_is_a_no_op_without_credentials() {
        let fixture = fixture(false, false);
        fixture.manager.start();
        assert_eq!(fixture.manager.cloud_state(), CloudState::Unconfigured);
        fixture.http.verify_done();
    }

    #[tokio::test]
    async fn command_updates_reach_the_cloud() {
        let fixture = fixture(true, false);
        fixture.manager.set_access_token(ACCESS_TOKEN);
        load_scenario_components(&fixture.components);
        fixture.manager.ingest_cloud_commands(&[json!({
            "name": "_robot.jump",
            "component": "comp",
            "id": "1234",
            "parameters": {"_height": 100},
        })]);

        let command = fixture
            .components
            .lock()
            .unwrap()
            .find_command("1234")
            .unwrap();
        command
            .lock()
            .unwrap()
            .set_progress(json!({"progress": 18}))
            .unwrap();

        fixture.http.expect(
            Method::Patch,
            "http://cloud.server.example/commands/1234",
            |request| {
                assert_eq!(
                    body_json(request),
                    json!({"state": "inProgress", "progress": {"progress": 18}})
                );
                Response::with_json(200, &json!({}))
            },
        );
        fixture.manager.publish_command_updates().await.unwrap();
        fixture.http.verify_done();

        command
            .lock()
            .unwrap()
            .complete(json!({"status": "Ok"}))
            .unwrap();
        fixture.http.expect(
            Method::Patch,
            "http://cloud.server.example/commands/1234",
            |request| {
                assert_eq!(
                    body_json(request),
                    json!({"state": "done", "results": {"status": "Ok"}})
                );
                Response::with_json(200, &json!({}))
            },
        );
        fixture.manager.publish_command_updates().await.unwrap();
        fixture.http.verify_done();

        // Done commands linger briefly, then leave the queue.
        assert!(fixture.components.lock().unwrap().find_command("1234").is_some());
        fixture.clock.advance(chrono::Duration::seconds(6));
        fixture
            .components
            .lock()
            .unwrap()
            .schedule_command_removal("nonexistent");
        assert!(fixture.components.lock().unwrap().find_command("1234").is_none());
    }

    #[tokio::test]
    async fn state_updates_reach_the_cloud() {
        let fixture = fixture(true, false);
        fixture.manager.set_access_token(ACCESS_TOKEN);
        load_scenario_components(&fixture.components);

        let acked: Arc<StdMutex<Vec<u64>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = acked.clone();
        fixture
            .components
            .lock()
            .unwrap()
            .add_server_state_updated_callback(move |id| sink.lock().unwrap().push(id));

        fixture.http.expect(
            Method::Post,
            format!("http://cloud.server.example/devices/{CLOUD_ID}/patchState"),
            |request| {
                let body = body_json(request);
                let patches = body["patches"].as_array().unwrap();
                assert_eq!(patches.len(), 1);
                assert_eq!(patches[0]["component"], "comp");
                assert_eq!(
                    patches[0]["patch"],
                    json!({"_foo": {"firmwareVersion": "1.0"}})
                );
                Response::with_json(200, &json!({}))
            },
        );
        fixture.manager.publish_state_updates().await.unwrap();
        fixture.http.verify_done();

        assert_eq!(acked.lock().unwrap().as_slice(), &[1]);
        // Nothing left to publish.
        fixture.manager.publish_state_updates().await.unwrap();
    }

    #[tokio::test]
    async fn fetch_commands_feeds_the_queue() {
        let fixture = fixture(true, false);
        fixture.manager.set_access_token(ACCESS_TOKEN);
        load_scenario_components(&fixture.components);

        fixture.http.expect(
            Method::Get,
            format!(
                "http://cloud.server.example/commands?deviceId={CLOUD_ID}&state=queued"
            ),
            |_| {
                Response::with_json(
                    200,
                    &json!({
                        "commands": [
                            {
                                "name": "_robot.jump",
                                "component": "comp",
                                "id": "1234",
                                "parameters": {"_height": 100},
                            },
                            // A command for an undeclared trait is dropped.
                            {"name": "_nosuch.trait", "component": "comp", "id": "1235"},
                        ]
                    }),
                )
            },
        );

        assert_eq!(fixture.manager.fetch_commands().await.unwrap(), 2);
        let components = fixture.components.lock().unwrap();
        assert!(components.find_command("1234").is_some());
        assert!(components.find_command("1235").is_none());
    }

    #[tokio::test]
    async fn get_device_info_returns_the_document() {
        let fixture = fixture(true, false);
        fixture.manager.set_access_token(ACCESS_TOKEN);

        fixture.http.expect(
            Method::Get,
            format!("http://cloud.server.example/devices/{CLOUD_ID}"),
            |request| {
                assert!(request
                    .headers
                    .contains(&("Authorization".to_owned(), format!("Bearer {ACCESS_TOKEN}"))));
                Response::with_json(200, &json!({"id": CLOUD_ID, "deviceKind": "vendor"}))
            },
        );

        let info = fixture.manager.get_device_info().await.unwrap();
        assert_eq!(info["id"], CLOUD_ID);
    }

    #[tokio::test]
    async fn clearing_credentials_unconfigures_the_device() {
        let fixture = fixture(true, false);
        fixture.manager.clear_credentials().await.unwrap();

        assert_eq!(fixture.manager.cloud_state(), CloudState::Unconfigured);
        let settings = fixture.manager.settings().await;
        assert_eq!(settings.cloud_id, None);
        assert_eq!(settings.refresh_token, None);

        let stored: Value =
            serde_json::from_str(&fixture.store.get(SETTINGS_KEY).unwrap()).unwrap();
        assert!(stored.get("cloud_id").is_none());
    }

    #[tokio::test]
    async fn publishing_without_a_token_fails_cleanly() {
        let fixture = fixture(true, false);
        load_scenario_components(&fixture.components);
        fixture.manager.ingest_cloud_commands(&[json!({
            "name": "_robot.jump",
            "component": "comp",
            "id": "1234",
        })]);
        fixture
            .components
            .lock()
            .unwrap()
            .find_command("1234")
            .unwrap()
            .lock()
            .unwrap()
            .set_progress(json!({"progress": 1}))
            .unwrap();

        let error = fixture.manager.publish_command_updates().await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::InvalidState);
    }
}
