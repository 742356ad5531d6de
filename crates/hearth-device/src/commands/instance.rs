use hearth::command::{CommandOrigin, CommandState};
use hearth::role::Role;
use hearth::traits::CommandName;

use serde_json::{json, Value};

use crate::error::{Error, ErrorKind, Result};

/// A single queued command: its identity, payload and life cycle.
///
/// Every state mutation records a patch describing the change; the
/// registration manager drains those patches and forwards them upstream.
#[derive(Debug)]
pub struct CommandInstance {
    id: String,
    name: CommandName,
    component: String,
    origin: CommandOrigin,
    state: CommandState,
    minimal_role: Role,
    parameters: Value,
    progress: Option<Value>,
    results: Option<Value>,
    pending_updates: Vec<Value>,
    pub(crate) dispatched: bool,
}

fn require_object(value: &Value, what: &str) -> Result<()> {
    if value.is_object() {
        Ok(())
    } else {
        Err(Error::new(
            ErrorKind::TypeMismatch,
            format!("{what} must be an object"),
        ))
    }
}

impl CommandInstance {
    /// Parses a command instance from its JSON form.
    ///
    /// `id` and `component` are optional; commands without them receive a
    /// queue-assigned id and target the first declared component.
    ///
    /// # Errors
    ///
    /// Fails with `typeMismatch` on a non-object instance or parameters,
    /// with `invalidParams` on a missing name, and with
    /// `invalidCommandName` on a name that is not `trait.command`.
    pub fn from_json(value: &Value, origin: CommandOrigin) -> Result<Self> {
        let Some(dict) = value.as_object() else {
            return Err(Error::new(
                ErrorKind::TypeMismatch,
                "Command instance must be an object",
            ));
        };
        let Some(name) = dict.get("name").and_then(Value::as_str) else {
            return Err(Error::new(
                ErrorKind::InvalidParams,
                "Command name is required",
            ));
        };
        let name = CommandName::parse(name).ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidCommandName,
                format!("Malformed command name '{name}'"),
            )
        })?;

        let parameters = match dict.get("parameters") {
            Some(parameters) => {
                require_object(parameters, "Command parameters")?;
                parameters.clone()
            }
            None => json!({}),
        };

        Ok(Self {
            id: dict
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            name,
            component: dict
                .get("component")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            origin,
            state: CommandState::Queued,
            minimal_role: Role::User,
            parameters,
            progress: None,
            results: None,
            pending_updates: Vec::new(),
            dispatched: false,
        })
    }

    /// Returns the command id; empty until assigned.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the fully qualified command name.
    #[must_use]
    pub const fn name(&self) -> &CommandName {
        &self.name
    }

    /// Returns the targeted component path; empty until resolved.
    #[must_use]
    pub fn component(&self) -> &str {
        &self.component
    }

    /// Returns where the command came from.
    #[must_use]
    pub const fn origin(&self) -> CommandOrigin {
        self.origin
    }

    /// Returns the current state.
    #[must_use]
    pub const fn state(&self) -> CommandState {
        self.state
    }

    /// Returns the least privileged role allowed to issue the command.
    #[must_use]
    pub const fn minimal_role(&self) -> Role {
        self.minimal_role
    }

    /// Returns the command parameters.
    #[must_use]
    pub const fn parameters(&self) -> &Value {
        &self.parameters
    }

    /// Returns the last reported progress.
    #[must_use]
    pub const fn progress(&self) -> Option<&Value> {
        self.progress.as_ref()
    }

    /// Returns the command results.
    #[must_use]
    pub const fn results(&self) -> Option<&Value> {
        self.results.as_ref()
    }

    pub(crate) fn set_id(&mut self, id: String) {
        self.id = id;
    }

    pub(crate) fn set_component(&mut self, component: String) {
        self.component = component;
    }

    pub(crate) fn set_minimal_role(&mut self, role: Role) {
        self.minimal_role = role;
    }

    /// Reports execution progress, moving the command to `inProgress`.
    ///
    /// # Errors
    ///
    /// Fails with `typeMismatch` on non-object progress and with
    /// `invalidState` from a terminal state.
    pub fn set_progress(&mut self, progress: Value) -> Result<()> {
        require_object(&progress, "Command progress")?;
        self.transition(CommandState::InProgress)?;
        self.pending_updates
            .push(json!({"state": "inProgress", "progress": progress}));
        self.progress = Some(progress);
        Ok(())
    }

    /// Finishes the command successfully with the given results.
    ///
    /// # Errors
    ///
    /// Fails with `typeMismatch` on non-object results and with
    /// `invalidState` from a terminal state.
    pub fn complete(&mut self, results: Value) -> Result<()> {
        require_object(&results, "Command results")?;
        self.transition(CommandState::Done)?;
        self.pending_updates
            .push(json!({"state": "done", "results": results}));
        self.results = Some(results);
        Ok(())
    }

    /// Suspends the command.
    ///
    /// # Errors
    ///
    /// Fails with `invalidState` from a terminal state.
    pub fn pause(&mut self) -> Result<()> {
        self.transition(CommandState::Paused)?;
        self.pending_updates.push(json!({"state": "paused"}));
        Ok(())
    }

    /// Marks the command as failed.
    ///
    /// # Errors
    ///
    /// Fails with `invalidState` from a terminal state.
    pub fn abort(&mut self, message: impl Into<String>) -> Result<()> {
        self.transition(CommandState::Error)?;
        self.pending_updates
            .push(json!({"state": "error", "error": {"message": message.into()}}));
        Ok(())
    }

    /// Cancels the command.
    ///
    /// # Errors
    ///
    /// Fails with `invalidState` from a terminal state.
    pub fn cancel(&mut self) -> Result<()> {
        self.transition(CommandState::Cancelled)?;
        self.pending_updates.push(json!({"state": "cancelled"}));
        Ok(())
    }

    /// Takes the patches recorded since the last call, oldest first.
    pub fn take_pending_updates(&mut self) -> Vec<Value> {
        std::mem::take(&mut self.pending_updates)
    }

    /// Returns the full JSON form of the command.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut value = json!({
            "id": self.id,
            "name": self.name.to_string(),
            "component": self.component,
            "state": self.state,
            "parameters": self.parameters,
        });
        if let Some(progress) = &self.progress {
            value["progress"] = progress.clone();
        }
        if let Some(results) = &self.results {
            value["results"] = results.clone();
        }
        value
    }

    fn transition(&mut self, next: CommandState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::new(
                ErrorKind::InvalidState,
                format!(
                    "Command '{}' cannot move from '{}' to '{next}'",
                    self.id, self.state
                ),
            ));
        }
        self.state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use hearth::command::{CommandOrigin, CommandState};

    use serde_json::json;

    use crate::error::ErrorKind;

    use super::CommandInstance;

    fn reboot() -> CommandInstance {
        CommandInstance::from_json(
            &json!({
                "name": "_foo.reboot",
                "component": "comp",
                "parameters": {"delay": 10}
            }),
            CommandOrigin::Local,
        )
        .unwrap()
    }

    #[test]
    fn parses_the_wire_form() {
        let command = reboot();
        assert_eq!(command.id(), "");
        assert_eq!(command.name().to_string(), "_foo.reboot");
        assert_eq!(command.component(), "comp");
        assert_eq!(command.origin(), CommandOrigin::Local);
        assert_eq!(command.state(), CommandState::Queued);
        assert_eq!(command.parameters(), &json!({"delay": 10}));
    }

    #[test]
    fn rejects_malformed_instances() {
        let parse = |value| CommandInstance::from_json(&value, CommandOrigin::Local);
        assert_eq!(
            parse(json!("reboot")).unwrap_err().kind(),
            ErrorKind::TypeMismatch
        );
        assert_eq!(
            parse(json!({"component": "comp"})).unwrap_err().kind(),
            ErrorKind::InvalidParams
        );
        assert_eq!(
            parse(json!({"name": "reboot"})).unwrap_err().kind(),
            ErrorKind::InvalidCommandName
        );
        assert_eq!(
            parse(json!({"name": "_foo.reboot", "parameters": [1, 2]}))
                .unwrap_err()
                .kind(),
            ErrorKind::TypeMismatch
        );
    }

    #[test]
    fn progress_and_completion_record_patches() {
        let mut command = reboot();
        command.set_progress(json!({"progress": 18})).unwrap();
        assert_eq!(command.state(), CommandState::InProgress);

        command.complete(json!({"status": "Ok"})).unwrap();
        assert_eq!(command.state(), CommandState::Done);

        assert_eq!(
            command.take_pending_updates(),
            vec![
                json!({"state": "inProgress", "progress": {"progress": 18}}),
                json!({"state": "done", "results": {"status": "Ok"}}),
            ]
        );
        // Drained.
        assert!(command.take_pending_updates().is_empty());
    }

    #[test]
    fn terminal_states_are_final() {
        let mut command = reboot();
        command.cancel().unwrap();
        assert_eq!(
            command.take_pending_updates(),
            vec![json!({"state": "cancelled"})]
        );
        assert_eq!(
            command.set_progress(json!({"progress": 1})).unwrap_err().kind(),
            ErrorKind::InvalidState
        );
        assert_eq!(command.cancel().unwrap_err().kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn full_json_form() {
        let mut command = reboot();
        command.set_id("1".to_owned());
        command.set_progress(json!({"progress": 50})).unwrap();
        assert_eq!(
            command.to_json(),
            json!({
                "id": "1",
                "name": "_foo.reboot",
                "component": "comp",
                "state": "inProgress",
                "parameters": {"delay": 10},
                "progress": {"progress": 50},
            })
        );
    }
}
