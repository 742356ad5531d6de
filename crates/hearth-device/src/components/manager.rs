use std::sync::Arc;

use hearth::command::CommandOrigin;
use hearth::component::{Component, ComponentNode, ComponentTree};
use hearth::role::Role;
use hearth::traits::{CommandDef, CommandName, TraitDef};

use indexmap::IndexMap;

use serde_json::Value;

use crate::commands::{CommandHandler, CommandInstance, CommandQueue, SharedCommand};
use crate::error::{Error, ErrorKind, Result};
use crate::provider::Clock;

use super::journal::{ComponentStateChange, StateChangeJournal, StateSnapshot};

type ChangeListener = Box<dyn Fn() + Send + Sync>;
type ServerStateListener = Box<dyn Fn(u64) + Send + Sync>;

/// The drained status patches of one command, oldest first.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandUpdate {
    /// The command the patches belong to.
    pub id: String,
    /// The recorded patches.
    pub patches: Vec<Value>,
    /// Whether the command has reached a terminal state.
    pub terminal: bool,
}

// Deep merge: objects union their keys, everything else (arrays included)
// is replaced by the new value.
fn merge_json(dest: &mut Value, src: &Value) {
    match (dest, src) {
        (Value::Object(dest_map), Value::Object(src_map)) => {
            for (key, value) in src_map {
                match dest_map.get_mut(key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        dest_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (dest, src) => *dest = src.clone(),
    }
}

fn split_state_name(name: &str) -> Result<(&str, &str)> {
    let mut parts = name.split('.');
    let package = parts.next().unwrap_or_default();
    if package.is_empty() {
        return Err(Error::new(
            ErrorKind::PropertyMissing,
            format!("Empty state package in '{name}'"),
        ));
    }
    let property = parts.next().unwrap_or_default();
    if property.is_empty() || parts.next().is_some() {
        return Err(Error::new(
            ErrorKind::PropertyMissing,
            format!("State property name not specified in '{name}'"),
        ));
    }
    Ok((package, property))
}

/// The typed component tree carrying declared traits, the trait/command
/// registry, the command queue and the state-change journal.
///
/// Everything a command or a state update must be validated against lives
/// here; the registration manager only serializes what this manager admits.
pub struct ComponentManager {
    clock: Arc<dyn Clock>,
    traits: IndexMap<String, TraitDef>,
    components: ComponentTree,
    queue: CommandQueue,
    journals: IndexMap<String, StateChangeJournal>,
    last_update_id: u64,
    next_command_id: u64,
    on_trait_changed: Vec<ChangeListener>,
    on_tree_changed: Vec<ChangeListener>,
    on_state_changed: Vec<ChangeListener>,
    on_server_state_updated: Vec<ServerStateListener>,
}

impl ComponentManager {
    /// Creates an empty [`ComponentManager`].
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            queue: CommandQueue::new(clock.clone()),
            clock,
            traits: IndexMap::new(),
            components: ComponentTree::default(),
            journals: IndexMap::new(),
            last_update_id: 0,
            next_command_id: 0,
            on_trait_changed: Vec::new(),
            on_tree_changed: Vec::new(),
            on_state_changed: Vec::new(),
            on_server_state_updated: Vec::new(),
        }
    }

    /// Loads trait definitions from a JSON object keyed by trait name.
    ///
    /// Traits are append-only: loading an already-defined trait is a no-op
    /// when the definitions are equal and an error otherwise. Definitions
    /// accepted before the failing one stay loaded.
    ///
    /// # Errors
    ///
    /// Fails with `typeMismatch` on a non-object document, a non-object
    /// trait body, or an attempted redefinition.
    pub fn load_traits(&mut self, dict: &Value) -> Result<()> {
        let Some(object) = dict.as_object() else {
            return Err(Error::new(
                ErrorKind::TypeMismatch,
                "Traits definition must be an object",
            ));
        };

        let mut modified = false;
        let mut failure = None;
        for (name, value) in object {
            match self.parse_trait(name, value) {
                Ok(Some(def)) => {
                    self.traits.insert(name.clone(), def);
                    modified = true;
                }
                Ok(None) => {}
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if modified {
            for listener in &self.on_trait_changed {
                listener();
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn parse_trait(&self, name: &str, value: &Value) -> Result<Option<TraitDef>> {
        if !value.is_object() {
            return Err(Error::new(
                ErrorKind::TypeMismatch,
                format!("Trait '{name}' must be an object"),
            ));
        }
        let def: TraitDef = serde_json::from_value(value.clone()).map_err(|e| {
            Error::with_source(
                ErrorKind::TypeMismatch,
                format!("Trait '{name}' has an invalid definition"),
                e,
            )
        })?;
        match self.traits.get(name) {
            Some(existing) if *existing == def => Ok(None),
            Some(_) => Err(Error::new(
                ErrorKind::TypeMismatch,
                format!("Trait '{name}' cannot be redefined"),
            )),
            None => Ok(Some(def)),
        }
    }

    /// Returns the loaded trait definitions.
    #[must_use]
    pub const fn traits(&self) -> &IndexMap<String, TraitDef> {
        &self.traits
    }

    /// Returns the definition of the given trait, when loaded.
    #[must_use]
    pub fn trait_definition(&self, name: &str) -> Option<&TraitDef> {
        self.traits.get(name)
    }

    /// Returns the definition of a `trait.command` name, when declared.
    #[must_use]
    pub fn find_command_definition(&self, name: &CommandName) -> Option<&CommandDef> {
        self.traits.get(&name.trait_name)?.command(&name.command)
    }

    /// Returns the minimal role of a `trait.command` name.
    ///
    /// # Errors
    ///
    /// Fails with `invalidCommandName` when no such command is declared.
    pub fn minimal_role(&self, name: &CommandName) -> Result<Role> {
        self.find_command_definition(name)
            .map(|def| def.minimal_role)
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::InvalidCommandName,
                    format!("Command definition for '{name}' not found"),
                )
            })
    }

    /// Adds a component under `parent_path` (empty for top level).
    ///
    /// # Errors
    ///
    /// Fails with `invalidPropValue` on an undefined trait, with
    /// `invalidState` when the name is taken, and propagates path
    /// navigation failures.
    pub fn add_component(
        &mut self,
        parent_path: &str,
        name: &str,
        traits: Vec<String>,
    ) -> Result<()> {
        self.validate_traits(&traits)?;
        let slots = self.graft_slots(parent_path)?;
        if slots.contains_key(name) {
            return Err(Error::new(
                ErrorKind::InvalidState,
                format!("Component '{name}' already exists at path '{parent_path}'"),
            ));
        }
        slots.insert(
            name.to_owned(),
            ComponentNode::Single(Component::with_traits(traits)),
        );
        for listener in &self.on_tree_changed {
            listener();
        }
        Ok(())
    }

    /// Appends a component to the array-valued child `name` under
    /// `parent_path`, creating the array when absent.
    ///
    /// # Errors
    ///
    /// Fails like [`ComponentManager::add_component`], plus `typeMismatch`
    /// when `name` holds a single component.
    pub fn add_component_array_item(
        &mut self,
        parent_path: &str,
        name: &str,
        traits: Vec<String>,
    ) -> Result<()> {
        self.validate_traits(&traits)?;
        let component = Component::with_traits(traits);
        let slots = self.graft_slots(parent_path)?;
        match slots.get_mut(name) {
            Some(ComponentNode::Array(items)) => items.push(component),
            Some(ComponentNode::Single(_)) => {
                return Err(Error::new(
                    ErrorKind::TypeMismatch,
                    format!("Component '{name}' is not an array"),
                ));
            }
            None => {
                slots.insert(name.to_owned(), ComponentNode::Array(vec![component]));
            }
        }
        for listener in &self.on_tree_changed {
            listener();
        }
        Ok(())
    }

    /// Returns the component at the given dotted path.
    ///
    /// # Errors
    ///
    /// Fails with `propertyMissing` or `typeMismatch` on mis-navigation.
    pub fn find_component(&self, path: &str) -> Result<&Component> {
        Ok(self.components.find(path)?)
    }

    /// Returns the component tree.
    #[must_use]
    pub const fn components(&self) -> &ComponentTree {
        &self.components
    }

    /// Parses and enqueues a command on behalf of a local caller with the
    /// given role, returning the assigned command id.
    ///
    /// # Errors
    ///
    /// Fails with `invalidCommandName` on an undeclared command, with
    /// `access_denied` when `role` is below the command's minimal role,
    /// with `component_not_found` when no component can be targeted, and
    /// with `trait_not_supported` when the target component does not
    /// declare the command's trait.
    pub fn add_command(&mut self, command: &Value, role: Role) -> Result<String> {
        self.add_command_from(command, CommandOrigin::Local, role)
    }

    /// Enqueues a command delivered by the cloud.
    ///
    /// The cloud is the trust root for its own commands, so admission runs
    /// at the owner role.
    ///
    /// # Errors
    ///
    /// Same failures as [`ComponentManager::add_command`].
    pub fn add_cloud_command(&mut self, command: &Value) -> Result<String> {
        self.add_command_from(command, CommandOrigin::Cloud, Role::Owner)
    }

    fn add_command_from(
        &mut self,
        command: &Value,
        origin: CommandOrigin,
        role: Role,
    ) -> Result<String> {
        let mut instance = CommandInstance::from_json(command, origin)?;

        let minimal_role = self.minimal_role(instance.name())?;
        if role < minimal_role {
            return Err(Error::new(
                ErrorKind::AccessDenied,
                format!("User role '{role}' less than minimal: '{minimal_role}'"),
            ));
        }
        instance.set_minimal_role(minimal_role);

        if instance.component().is_empty() {
            let first = self.components.first_root().ok_or_else(|| {
                Error::new(
                    ErrorKind::ComponentNotFound,
                    "There are no components defined",
                )
            })?;
            instance.set_component(first.to_owned());
        }

        let component = self.components.find(instance.component())?;
        if !component.has_trait(&instance.name().trait_name) {
            return Err(Error::new(
                ErrorKind::TraitNotSupported,
                format!(
                    "Component '{}' doesn't support trait '{}'",
                    instance.component(),
                    instance.name().trait_name
                ),
            ));
        }

        if instance.id().is_empty() {
            self.next_command_id += 1;
            instance.set_id(self.next_command_id.to_string());
        }
        let id = instance.id().to_owned();
        self.queue.add(instance)?;
        Ok(id)
    }

    /// Returns the queued command with the given id, when present.
    #[must_use]
    pub fn find_command(&self, id: &str) -> Option<SharedCommand> {
        self.queue.find(id)
    }

    /// Registers a handler for `command_name` on `component_path`
    /// (empty path for any component).
    ///
    /// # Errors
    ///
    /// Fails with `invalidCommandName` when the command is not declared by
    /// any loaded trait.
    pub fn add_command_handler(
        &mut self,
        component_path: &str,
        command_name: &str,
        handler: CommandHandler,
    ) -> Result<()> {
        let name = CommandName::parse(command_name).ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidCommandName,
                format!("Malformed command name '{command_name}'"),
            )
        })?;
        if self.find_command_definition(&name).is_none() {
            return Err(Error::new(
                ErrorKind::InvalidCommandName,
                format!("Command definition for '{name}' not found"),
            ));
        }
        self.queue.add_handler(component_path, command_name, handler);
        Ok(())
    }

    /// Registers the fallback handler receiving commands nothing else
    /// matches.
    pub fn add_default_command_handler(&mut self, handler: CommandHandler) {
        self.queue.add_default_handler(handler);
    }

    /// Registers a listener fired when a command enters the queue.
    pub fn add_command_added_callback(
        &mut self,
        callback: impl Fn(&SharedCommand) + Send + Sync + 'static,
    ) {
        self.queue.add_command_added_callback(callback);
    }

    /// Registers a listener fired when a command leaves the queue.
    pub fn add_command_removed_callback(
        &mut self,
        callback: impl Fn(&SharedCommand) + Send + Sync + 'static,
    ) {
        self.queue.add_command_removed_callback(callback);
    }

    /// Drains the status patches every queued command recorded since the
    /// last call.
    pub fn take_command_updates(&mut self) -> Vec<CommandUpdate> {
        let mut updates = Vec::new();
        for shared in self.queue.commands() {
            let mut command = shared.lock().unwrap();
            let patches = command.take_pending_updates();
            if !patches.is_empty() {
                updates.push(CommandUpdate {
                    id: command.id().to_owned(),
                    patches,
                    terminal: command.state().is_terminal(),
                });
            }
        }
        updates
    }

    /// Selects a command for removal from the queue after a short delay.
    pub fn schedule_command_removal(&mut self, id: impl Into<String>) {
        self.queue.delayed_remove(id);
    }

    /// Merges a property diff into a component's state and journals it.
    ///
    /// Objects union-merge with new values overwriting leaf keys; arrays
    /// are replaced. The global update id grows by one.
    ///
    /// # Errors
    ///
    /// Fails with `typeMismatch` on a non-object diff and propagates path
    /// navigation failures.
    pub fn set_state_properties(&mut self, component_path: &str, diff: &Value) -> Result<()> {
        let Some(diff_map) = diff.as_object() else {
            return Err(Error::new(
                ErrorKind::TypeMismatch,
                "State diff must be an object",
            ));
        };
        let component = self.components.find_mut(component_path)?;
        for (key, value) in diff_map {
            match component.state.get_mut(key) {
                Some(existing) => merge_json(existing, value),
                None => {
                    component.state.insert(key.clone(), value.clone());
                }
            }
        }

        self.last_update_id += 1;
        let timestamp = self.clock.now();
        self.journals
            .entry(component_path.to_owned())
            .or_default()
            .record(timestamp, diff.clone());

        for listener in &self.on_state_changed {
            listener();
        }
        Ok(())
    }

    /// Sets a single `trait.property` state value.
    ///
    /// # Errors
    ///
    /// Fails with `propertyMissing` unless the name has exactly two
    /// non-empty dotted parts, plus the failures of
    /// [`ComponentManager::set_state_properties`].
    pub fn set_state_property(
        &mut self,
        component_path: &str,
        name: &str,
        value: Value,
    ) -> Result<()> {
        let (package, property) = split_state_name(name)?;
        let diff = serde_json::json!({ package: { property: value } });
        self.set_state_properties(component_path, &diff)
    }

    /// Returns a single `trait.property` state value.
    ///
    /// # Errors
    ///
    /// Fails with `propertyMissing` on a malformed name or an absent
    /// property, and propagates path navigation failures.
    pub fn get_state_property(&self, component_path: &str, name: &str) -> Result<&Value> {
        let (package, property) = split_state_name(name)?;
        let component = self.components.find(component_path)?;
        component
            .state
            .get(package)
            .and_then(|package_state| package_state.get(property))
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::PropertyMissing,
                    format!("State property '{name}' not found in component '{component_path}'"),
                )
            })
    }

    /// Returns the frontier of recorded state changes.
    #[must_use]
    pub const fn last_state_change_id(&self) -> u64 {
        self.last_update_id
    }

    /// Drains all journals into a timestamp-sorted snapshot.
    pub fn get_and_clear_recorded_state_changes(&mut self) -> StateSnapshot {
        let mut state_changes = Vec::new();
        for (component, journal) in &mut self.journals {
            for change in journal.drain() {
                state_changes.push(ComponentStateChange {
                    timestamp: change.timestamp,
                    component: component.clone(),
                    changed_properties: change.changed_properties,
                });
            }
        }
        state_changes.sort_by_key(|change| change.timestamp);
        self.journals.clear();
        StateSnapshot {
            update_id: self.last_update_id,
            state_changes,
        }
    }

    /// Announces that changes up to and including `update_id` reached the
    /// cloud.
    pub fn notify_state_updated_on_server(&self, update_id: u64) {
        for listener in &self.on_server_state_updated {
            listener(update_id);
        }
    }

    /// Registers a listener for server-acknowledged update ids.
    ///
    /// With no unreported changes in the journals, the listener is called
    /// right away with the current update id.
    pub fn add_server_state_updated_callback(
        &mut self,
        callback: impl Fn(u64) + Send + Sync + 'static,
    ) {
        if self.journals.is_empty() {
            callback(self.last_update_id);
        }
        self.on_server_state_updated.push(Box::new(callback));
    }

    /// Registers a listener fired on trait registry changes; it runs once
    /// immediately to report the current registry.
    pub fn add_trait_changed_callback(&mut self, callback: impl Fn() + Send + Sync + 'static) {
        callback();
        self.on_trait_changed.push(Box::new(callback));
    }

    /// Registers a listener fired on component tree changes; it runs once
    /// immediately to report the current tree.
    pub fn add_component_tree_changed_callback(
        &mut self,
        callback: impl Fn() + Send + Sync + 'static,
    ) {
        callback();
        self.on_tree_changed.push(Box::new(callback));
    }

    /// Registers a listener fired on state changes; it runs once
    /// immediately to report the current state.
    pub fn add_state_changed_callback(&mut self, callback: impl Fn() + Send + Sync + 'static) {
        callback();
        self.on_state_changed.push(Box::new(callback));
    }

    /// Returns the trait registry as the JSON document the cloud expects.
    ///
    /// # Errors
    ///
    /// Fails with `invalidState` when serialization fails.
    pub fn traits_json(&self) -> Result<Value> {
        serde_json::to_value(&self.traits).map_err(|e| {
            Error::with_source(ErrorKind::InvalidState, "Failed to serialize traits", e)
        })
    }

    /// Returns the component tree as the JSON document the cloud expects.
    ///
    /// # Errors
    ///
    /// Fails with `invalidState` when serialization fails.
    pub fn components_json(&self) -> Result<Value> {
        serde_json::to_value(&self.components).map_err(|e| {
            Error::with_source(ErrorKind::InvalidState, "Failed to serialize components", e)
        })
    }

    fn validate_traits(&self, traits: &[String]) -> Result<()> {
        for name in traits {
            if !self.traits.contains_key(name) {
                return Err(Error::new(
                    ErrorKind::InvalidPropValue,
                    format!("Trait '{name}' is undefined"),
                ));
            }
        }
        Ok(())
    }

    fn graft_slots(
        &mut self,
        parent_path: &str,
    ) -> Result<&mut IndexMap<String, ComponentNode>> {
        if parent_path.is_empty() {
            Ok(self.components.roots_mut())
        } else {
            Ok(&mut self.components.find_mut(parent_path)?.components)
        }
    }
}
