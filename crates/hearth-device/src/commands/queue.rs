use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

use indexmap::IndexMap;

use crate::error::{Error, ErrorKind, Result};
use crate::provider::Clock;

use super::CommandInstance;

/// How long a command selected for removal stays findable, in seconds.
///
/// The delay lets in-flight status updates referring to the command finish
/// before it disappears.
pub const COMMAND_REMOVE_DELAY_SECS: i64 = 5;

/// A command instance shared between the queue, its handler and the
/// registration manager.
pub type SharedCommand = Arc<Mutex<CommandInstance>>;

/// A callback executing commands dispatched to it.
pub type CommandHandler = Arc<dyn Fn(SharedCommand) + Send + Sync>;

type CommandListener = Box<dyn Fn(&SharedCommand) + Send + Sync>;

/// Holds pending command instances by id and dispatches them to
/// per-component handlers.
///
/// Handlers are keyed by (component path, command name); dispatch picks the
/// most specific match and falls back to a handler registered for any
/// component, then to the default handler. Completed commands are removed
/// after a short delay through [`CommandQueue::delayed_remove`].
pub struct CommandQueue {
    clock: Arc<dyn Clock>,
    map: IndexMap<String, SharedCommand>,
    remove_queue: VecDeque<(DateTime<Utc>, String)>,
    handlers: IndexMap<(String, String), CommandHandler>,
    on_added: Vec<CommandListener>,
    on_removed: Vec<CommandListener>,
}

impl CommandQueue {
    /// Creates an empty [`CommandQueue`].
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            map: IndexMap::new(),
            remove_queue: VecDeque::new(),
            handlers: IndexMap::new(),
            on_added: Vec::new(),
            on_removed: Vec::new(),
        }
    }

    /// Returns whether the queue holds no commands.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Returns the number of queued commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Registers a listener fired when a command enters the queue.
    pub fn add_command_added_callback(
        &mut self,
        callback: impl Fn(&SharedCommand) + Send + Sync + 'static,
    ) {
        self.on_added.push(Box::new(callback));
    }

    /// Registers a listener fired when a command leaves the queue.
    pub fn add_command_removed_callback(
        &mut self,
        callback: impl Fn(&SharedCommand) + Send + Sync + 'static,
    ) {
        self.on_removed.push(Box::new(callback));
    }

    /// Registers a handler for commands named `command_name` targeting
    /// `component_path`; an empty path matches any component.
    ///
    /// Matching commands already in the queue that no handler has seen yet
    /// are dispatched to the new handler right away.
    pub fn add_handler(
        &mut self,
        component_path: impl Into<String>,
        command_name: impl Into<String>,
        handler: CommandHandler,
    ) {
        self.handlers
            .insert((component_path.into(), command_name.into()), handler);
        let queued: Vec<SharedCommand> = self.map.values().cloned().collect();
        for shared in queued {
            self.dispatch(&shared);
        }
    }

    /// Registers the fallback handler receiving commands nothing else
    /// matches.
    pub fn add_default_handler(&mut self, handler: CommandHandler) {
        self.add_handler("", "", handler);
    }

    /// Adds a command with an already-assigned id to the queue and
    /// dispatches it.
    ///
    /// # Errors
    ///
    /// Fails with `invalidParams` when the id is empty or already queued.
    pub fn add(&mut self, command: CommandInstance) -> Result<SharedCommand> {
        self.cleanup();
        let id = command.id().to_owned();
        if id.is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidParams,
                "Command id must be assigned before queueing",
            ));
        }
        if self.map.contains_key(&id) {
            return Err(Error::new(
                ErrorKind::InvalidParams,
                format!("Command '{id}' is already queued"),
            ));
        }

        let shared: SharedCommand = Arc::new(Mutex::new(command));
        self.map.insert(id, shared.clone());
        for listener in &self.on_added {
            listener(&shared);
        }
        self.dispatch(&shared);
        Ok(shared)
    }

    /// Returns the queued command with the given id, when present.
    #[must_use]
    pub fn find(&self, id: &str) -> Option<SharedCommand> {
        self.map.get(id).cloned()
    }

    /// Returns the queued commands in insertion order.
    pub fn commands(&self) -> impl Iterator<Item = &SharedCommand> {
        self.map.values()
    }

    /// Selects the command with the given id for removal after
    /// [`COMMAND_REMOVE_DELAY_SECS`].
    pub fn delayed_remove(&mut self, id: impl Into<String>) {
        let due = self.clock.now() + Duration::seconds(COMMAND_REMOVE_DELAY_SECS);
        self.remove_queue.push_back((due, id.into()));
        self.cleanup();
    }

    fn handler_for(&self, component: &str, name: &str) -> Option<CommandHandler> {
        self.handlers
            .get(&(component.to_owned(), name.to_owned()))
            .or_else(|| self.handlers.get(&(String::new(), name.to_owned())))
            .or_else(|| self.handlers.get(&(String::new(), String::new())))
            .cloned()
    }

    fn dispatch(&mut self, shared: &SharedCommand) {
        let (component, name, dispatched) = {
            let command = shared.lock().unwrap();
            (
                command.component().to_owned(),
                command.name().to_string(),
                command.dispatched,
            )
        };
        if dispatched {
            return;
        }
        if let Some(handler) = self.handler_for(&component, &name) {
            shared.lock().unwrap().dispatched = true;
            handler(shared.clone());
        }
    }

    // Removes commands whose removal delay has passed.
    fn cleanup(&mut self) {
        let now = self.clock.now();
        while let Some((due, _)) = self.remove_queue.front() {
            if *due > now {
                break;
            }
            if let Some((_, id)) = self.remove_queue.pop_front() {
                if let Some(removed) = self.map.shift_remove(&id) {
                    for listener in &self.on_removed {
                        listener(&removed);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use chrono::Duration;

    use hearth::command::{CommandOrigin, CommandState};

    use serde_json::json;

    use crate::commands::CommandInstance;
    use crate::error::ErrorKind;
    use crate::tests::FixedClock;

    use super::CommandQueue;

    fn command(id: &str, name: &str, component: &str) -> CommandInstance {
        CommandInstance::from_json(
            &json!({"name": name, "component": component, "id": id}),
            CommandOrigin::Local,
        )
        .unwrap()
    }

    fn queue_with_clock() -> (Arc<FixedClock>, CommandQueue) {
        let clock = Arc::new(FixedClock::at(1_412_121_212));
        let queue = CommandQueue::new(clock.clone());
        (clock, queue)
    }

    #[test]
    fn dispatches_to_the_matching_handler() {
        let (_, mut queue) = queue_with_clock();
        let handled = Arc::new(AtomicUsize::new(0));
        let counter = handled.clone();
        queue.add_handler(
            "comp",
            "_foo.reboot",
            Arc::new(move |shared| {
                counter.fetch_add(1, Ordering::SeqCst);
                shared
                    .lock()
                    .unwrap()
                    .set_progress(json!({"progress": 0}))
                    .unwrap();
            }),
        );

        queue.add(command("1", "_foo.reboot", "comp")).unwrap();
        assert_eq!(handled.load(Ordering::SeqCst), 1);
        assert_eq!(
            queue.find("1").unwrap().lock().unwrap().state(),
            CommandState::InProgress
        );

        // A command for another component does not match.
        queue.add(command("2", "_foo.reboot", "other")).unwrap();
        assert_eq!(handled.load(Ordering::SeqCst), 1);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn falls_back_to_wider_handlers() {
        let (_, mut queue) = queue_with_clock();
        let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        let sink = log.clone();
        queue.add_handler("", "_foo.reboot", Arc::new(move |_| sink.lock().unwrap().push("named")));
        let sink = log.clone();
        queue.add_default_handler(Arc::new(move |_| sink.lock().unwrap().push("default")));

        queue.add(command("1", "_foo.reboot", "comp")).unwrap();
        queue.add(command("2", "_robot.jump", "comp")).unwrap();
        assert_eq!(log.lock().unwrap().as_slice(), &["named", "default"]);
    }

    #[test]
    fn late_handler_receives_queued_commands_once() {
        let (_, mut queue) = queue_with_clock();
        queue.add(command("1", "_foo.reboot", "comp")).unwrap();

        let handled = Arc::new(AtomicUsize::new(0));
        let counter = handled.clone();
        queue.add_handler(
            "comp",
            "_foo.reboot",
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(handled.load(Ordering::SeqCst), 1);

        // Re-registering does not re-dispatch already handled commands.
        let counter = handled.clone();
        queue.add_handler(
            "comp",
            "_foo.reboot",
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(handled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn duplicate_and_missing_ids_are_rejected() {
        let (_, mut queue) = queue_with_clock();
        queue.add(command("1", "_foo.reboot", "comp")).unwrap();
        assert_eq!(
            queue
                .add(command("1", "_foo.reboot", "comp"))
                .unwrap_err()
                .kind(),
            ErrorKind::InvalidParams
        );

        let unassigned = CommandInstance::from_json(
            &json!({"name": "_foo.reboot"}),
            CommandOrigin::Local,
        )
        .unwrap();
        assert_eq!(queue.add(unassigned).unwrap_err().kind(), ErrorKind::InvalidParams);
    }

    #[test]
    fn delayed_removal_fires_listeners() {
        let (clock, mut queue) = queue_with_clock();
        let removed: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = removed.clone();
        queue.add_command_removed_callback(move |shared| {
            sink.lock().unwrap().push(shared.lock().unwrap().id().to_owned());
        });

        queue.add(command("1", "_foo.reboot", "comp")).unwrap();
        queue.delayed_remove("1");

        // Still findable within the grace period.
        assert!(queue.find("1").is_some());
        assert!(removed.lock().unwrap().is_empty());

        clock.advance(Duration::seconds(6));
        queue.add(command("2", "_foo.reboot", "comp")).unwrap();
        assert!(queue.find("1").is_none());
        assert_eq!(removed.lock().unwrap().as_slice(), &["1"]);
    }
}
