//! Protocol state machine
//!
//! A table driven finite state machine for instrument command/response
//! protocols. Handlers are registered per `(state, event)` pair, either up
//! front or later once sub-protocols are wired together. An event with no
//! handler in the current state is an [`StateMachineError::IllegalTransition`]:
//! that is a programming defect, never something to recover from.
//!
//! [`ReactiveMachine`] keeps several child machines in lock-step. A table
//! maps combinations of child states to an event for one child; the table is
//! re-evaluated after every child state change until no row matches or a
//! reaction leaves every child where it was.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::Hash;
use thiserror::Error;

/// Default number of transitions kept in the history
pub const DEFAULT_HISTORY: usize = 100;

/// Default bound on chained reactions per dispatch
pub const DEFAULT_REACTION_LIMIT: usize = 32;

/// State machine errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateMachineError {
    /// No handler for the event in the current state
    #[error("illegal transition: event {event} in state {state}")]
    IllegalTransition {
        /// Current state
        state: String,
        /// Rejected event
        event: String,
    },

    /// A handler failed
    #[error("handler failed: {0}")]
    Handler(String),

    /// Reaction table kept matching after too many steps
    #[error("reaction table did not settle after {0} steps")]
    ReactionLimit(usize),

    /// Reaction table names a child that does not exist
    #[error("unknown child machine {0}")]
    UnknownChild(String),
}

impl StateMachineError {
    /// Whether the owning session must stop
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::IllegalTransition { .. } | Self::ReactionLimit(_) | Self::UnknownChild(_))
    }
}

/// Marker for state and event token types
pub trait Token: Copy + Eq + Hash + fmt::Debug + Send + 'static {}

impl<T> Token for T where T: Copy + Eq + Hash + fmt::Debug + Send + 'static {}

/// What a handler returns
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerResult<S, O> {
    /// State to move to, `None` to stay
    pub next_state: Option<S>,
    /// Handler output
    pub output: O,
}

impl<S, O> HandlerResult<S, O> {
    /// Stay in the current state
    pub fn stay(output: O) -> Self {
        Self {
            next_state: None,
            output,
        }
    }

    /// Move to `state`
    pub fn goto(state: S, output: O) -> Self {
        Self {
            next_state: Some(state),
            output,
        }
    }
}

/// Event handler
pub type Handler<S, C, O> =
    Box<dyn FnMut(&mut C, &serde_json::Value) -> Result<HandlerResult<S, O>, StateMachineError> + Send>;

/// Enter/exit hook, called with the state being entered or left
pub type Hook<S, C> = Box<dyn FnMut(&mut C, S) + Send>;

/// One recorded state change
#[derive(Debug, Clone, PartialEq)]
pub struct Transition<S, E> {
    /// Previous state
    pub from: S,
    /// New state
    pub to: S,
    /// Event that caused it
    pub event: E,
    /// When it happened
    pub timestamp: DateTime<Utc>,
}

/// Generic protocol state machine over states `S`, events `E`, a mutable
/// context `C` handed to handlers, and handler output `O`
pub struct ProtocolStateMachine<S, E, C, O = ()> {
    state: S,
    handlers: HashMap<(S, E), Handler<S, C, O>>,
    enter_hooks: HashMap<S, Vec<Hook<S, C>>>,
    exit_hooks: HashMap<S, Vec<Hook<S, C>>>,
    history: VecDeque<Transition<S, E>>,
    max_history: usize,
}

impl<S: Token, E: Token, C, O> ProtocolStateMachine<S, E, C, O> {
    /// Create a machine in `initial` state. Enter hooks are not fired
    /// until [`start`](Self::start).
    pub fn new(initial: S) -> Self {
        Self {
            state: initial,
            handlers: HashMap::new(),
            enter_hooks: HashMap::new(),
            exit_hooks: HashMap::new(),
            history: VecDeque::new(),
            max_history: DEFAULT_HISTORY,
        }
    }

    /// Set the history size
    #[must_use]
    pub fn with_history(mut self, max: usize) -> Self {
        self.max_history = max;
        self
    }

    /// Register a handler, replacing any existing one for the pair
    pub fn add_handler<F>(&mut self, state: S, event: E, handler: F)
    where
        F: FnMut(&mut C, &serde_json::Value) -> Result<HandlerResult<S, O>, StateMachineError> + Send + 'static,
    {
        if self.handlers.insert((state, event), Box::new(handler)).is_some() {
            tracing::debug!(?state, ?event, "replaced state machine handler");
        }
    }

    /// Remove a handler; returns whether one existed
    pub fn remove_handler(&mut self, state: S, event: E) -> bool {
        self.handlers.remove(&(state, event)).is_some()
    }

    /// Whether a handler is registered for the pair
    pub fn has_handler(&self, state: S, event: E) -> bool {
        self.handlers.contains_key(&(state, event))
    }

    /// Events accepted in `state`
    pub fn events_for(&self, state: S) -> Vec<E> {
        self.handlers.keys().filter(|(s, _)| *s == state).map(|(_, e)| *e).collect()
    }

    /// Run `hook` whenever `state` is entered
    pub fn add_enter_hook<F>(&mut self, state: S, hook: F)
    where
        F: FnMut(&mut C, S) + Send + 'static,
    {
        self.enter_hooks.entry(state).or_default().push(Box::new(hook));
    }

    /// Run `hook` whenever `state` is left
    pub fn add_exit_hook<F>(&mut self, state: S, hook: F)
    where
        F: FnMut(&mut C, S) + Send + 'static,
    {
        self.exit_hooks.entry(state).or_default().push(Box::new(hook));
    }

    /// Current state
    pub fn state(&self) -> S {
        self.state
    }

    /// Recent transitions, oldest first
    pub fn history(&self) -> impl Iterator<Item = &Transition<S, E>> {
        self.history.iter()
    }

    /// Enter `state` and fire its enter hooks
    pub fn start(&mut self, ctx: &mut C, state: S) {
        self.state = state;
        Self::fire(&mut self.enter_hooks, ctx, state);
    }

    /// Handle an event in the current state.
    ///
    /// When the handler names a different next state the exit hooks of the
    /// old state run, then the enter hooks of the new one.
    pub fn on_event(&mut self, ctx: &mut C, event: E, args: &serde_json::Value) -> Result<O, StateMachineError> {
        let result = self.resolve(ctx, event, args)?;
        self.commit(ctx, event, result.next_state);
        Ok(result.output)
    }

    /// Run the handler for `event` without changing state. Pair with
    /// [`commit`](Self::commit) once the handler's output has been acted on.
    pub fn resolve(
        &mut self,
        ctx: &mut C,
        event: E,
        args: &serde_json::Value,
    ) -> Result<HandlerResult<S, O>, StateMachineError> {
        let from = self.state;
        let handler = self.handlers.get_mut(&(from, event)).ok_or_else(|| {
            tracing::error!(state = ?from, ?event, "no handler for event");
            StateMachineError::IllegalTransition {
                state: format!("{:?}", from),
                event: format!("{:?}", event),
            }
        })?;
        handler(ctx, args)
    }

    /// Move to `next_state`, firing hooks and recording history. Returns
    /// the `(from, to)` pair when the state actually changed.
    pub fn commit(&mut self, ctx: &mut C, event: E, next_state: Option<S>) -> Option<(S, S)> {
        let from = self.state;
        let to = next_state.filter(|to| *to != from)?;

        tracing::debug!(?from, ?to, ?event, "state transition");
        Self::fire(&mut self.exit_hooks, ctx, from);
        self.state = to;
        Self::fire(&mut self.enter_hooks, ctx, to);

        self.history.push_back(Transition {
            from,
            to,
            event,
            timestamp: Utc::now(),
        });
        while self.history.len() > self.max_history {
            self.history.pop_front();
        }
        Some((from, to))
    }

    fn fire(hooks: &mut HashMap<S, Vec<Hook<S, C>>>, ctx: &mut C, state: S) {
        if let Some(hooks) = hooks.get_mut(&state) {
            for hook in hooks.iter_mut() {
                hook(ctx, state);
            }
        }
    }
}

impl<S: Token, E: Token, C, O> fmt::Debug for ProtocolStateMachine<S, E, C, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolStateMachine")
            .field("state", &self.state)
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// One row of a reaction table
#[derive(Debug, Clone, PartialEq)]
pub struct ReactionRule<K, S, E> {
    /// Child states that must all hold
    pub when: Vec<(K, S)>,
    /// Child to notify
    pub target: K,
    /// Event to send it
    pub event: E,
}

/// An event sent by the reaction table
#[derive(Debug, Clone, PartialEq)]
pub struct Reaction<K, E, O> {
    /// Child that received the event
    pub target: K,
    /// The event
    pub event: E,
    /// Handler output
    pub output: O,
}

/// Result of dispatching to a reactive machine
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched<K, E, O> {
    /// Output of the directly dispatched event
    pub output: O,
    /// Follow-up events the table produced, in order
    pub reactions: Vec<Reaction<K, E, O>>,
}

/// Composite machine keeping several children in lock-step
pub struct ReactiveMachine<K, S, E, C, O = ()> {
    children: Vec<(K, ProtocolStateMachine<S, E, C, O>)>,
    rules: Vec<ReactionRule<K, S, E>>,
    limit: usize,
}

impl<K, S, E, C, O> ReactiveMachine<K, S, E, C, O>
where
    K: Copy + Eq + fmt::Debug,
    S: Token,
    E: Token,
{
    /// Create an empty composite
    pub fn new() -> Self {
        Self {
            children: Vec::new(),
            rules: Vec::new(),
            limit: DEFAULT_REACTION_LIMIT,
        }
    }

    /// Set the bound on chained reactions
    #[must_use]
    pub fn with_reaction_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Add a child machine
    pub fn add_child(&mut self, key: K, machine: ProtocolStateMachine<S, E, C, O>) {
        self.children.push((key, machine));
    }

    /// Add a reaction rule
    pub fn add_rule(&mut self, when: Vec<(K, S)>, target: K, event: E) {
        self.rules.push(ReactionRule { when, target, event });
    }

    /// Child machine
    pub fn child(&self, key: K) -> Option<&ProtocolStateMachine<S, E, C, O>> {
        self.children.iter().find(|(k, _)| *k == key).map(|(_, m)| m)
    }

    /// Child machine, mutable (e.g. to register handlers)
    pub fn child_mut(&mut self, key: K) -> Option<&mut ProtocolStateMachine<S, E, C, O>> {
        self.children.iter_mut().find(|(k, _)| *k == key).map(|(_, m)| m)
    }

    /// Current state of every child, in insertion order
    pub fn states(&self) -> Vec<(K, S)> {
        self.children.iter().map(|(k, m)| (*k, m.state())).collect()
    }

    /// Send an event to one child, then react to any state change
    pub fn dispatch(
        &mut self,
        ctx: &mut C,
        target: K,
        event: E,
        args: &serde_json::Value,
    ) -> Result<Dispatched<K, E, O>, StateMachineError> {
        let before = self.states();
        let output = self.send(ctx, target, event, args)?;
        let mut reactions = Vec::new();
        if self.states() != before {
            self.react(ctx, &mut reactions)?;
        }
        Ok(Dispatched { output, reactions })
    }

    fn send(&mut self, ctx: &mut C, target: K, event: E, args: &serde_json::Value) -> Result<O, StateMachineError> {
        let machine = self
            .child_mut(target)
            .ok_or_else(|| StateMachineError::UnknownChild(format!("{:?}", target)))?;
        machine.on_event(ctx, event, args)
    }

    fn react(&mut self, ctx: &mut C, reactions: &mut Vec<Reaction<K, E, O>>) -> Result<(), StateMachineError> {
        let args = serde_json::Value::Null;
        for _ in 0..self.limit {
            let states = self.states();
            let Some(rule) = self
                .rules
                .iter()
                .find(|rule| rule.when.iter().all(|cond| states.contains(cond)))
            else {
                return Ok(());
            };
            let (target, event) = (rule.target, rule.event);

            tracing::debug!(?target, ?event, "reaction");
            let output = self.send(ctx, target, event, &args)?;
            reactions.push(Reaction { target, event, output });
            if self.states() == states {
                return Ok(());
            }
        }
        tracing::error!(limit = self.limit, "reaction table did not settle");
        Err(StateMachineError::ReactionLimit(self.limit))
    }
}

impl<K, S, E, C, O> Default for ReactiveMachine<K, S, E, C, O>
where
    K: Copy + Eq + fmt::Debug,
    S: Token,
    E: Token,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum State {
        Unknown,
        Command,
        Autosample,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Event {
        Discover,
        StartAutosample,
        StopAutosample,
        GetParam,
    }

    type Log = Vec<String>;

    fn machine() -> ProtocolStateMachine<State, Event, Log, &'static str> {
        let mut fsm = ProtocolStateMachine::new(State::Unknown);
        fsm.add_handler(State::Unknown, Event::Discover, |_: &mut Log, _: &Value| {
            Ok(HandlerResult::goto(State::Command, "discovered"))
        });
        fsm.add_handler(State::Command, Event::StartAutosample, |_: &mut Log, _: &Value| {
            Ok(HandlerResult::goto(State::Autosample, "started"))
        });
        fsm.add_handler(State::Autosample, Event::StopAutosample, |_: &mut Log, _: &Value| {
            Ok(HandlerResult::goto(State::Command, "stopped"))
        });
        fsm
    }

    #[test]
    fn test_discover_only_from_unknown() {
        let mut log = Log::new();
        let mut fsm = machine();
        assert_eq!(fsm.on_event(&mut log, Event::Discover, &Value::Null).unwrap(), "discovered");
        fsm.on_event(&mut log, Event::StartAutosample, &Value::Null).unwrap();
        assert_eq!(fsm.state(), State::Autosample);

        let err = fsm.on_event(&mut log, Event::Discover, &Value::Null).unwrap_err();
        assert_eq!(
            err,
            StateMachineError::IllegalTransition {
                state: "Autosample".into(),
                event: "Discover".into()
            }
        );
        assert!(err.is_fatal());
        assert_eq!(fsm.state(), State::Autosample);
    }

    #[test]
    fn test_exit_fires_before_enter() {
        let mut log = Log::new();
        let mut fsm = machine();
        fsm.add_exit_hook(State::Unknown, |log: &mut Log, s| log.push(format!("exit {:?}", s)));
        fsm.add_enter_hook(State::Command, |log: &mut Log, s| log.push(format!("enter {:?}", s)));
        fsm.add_enter_hook(State::Unknown, |log: &mut Log, s| log.push(format!("enter {:?}", s)));

        fsm.start(&mut log, State::Unknown);
        fsm.on_event(&mut log, Event::Discover, &Value::Null).unwrap();
        assert_eq!(log, ["enter Unknown", "exit Unknown", "enter Command"]);
    }

    #[test]
    fn test_staying_fires_no_hooks() {
        let mut log = Log::new();
        let mut fsm = machine();
        fsm.add_handler(State::Unknown, Event::GetParam, |log: &mut Log, args: &Value| {
            log.push(args["name"].as_str().unwrap_or_default().to_string());
            Ok(HandlerResult::goto(State::Unknown, "value"))
        });
        fsm.add_exit_hook(State::Unknown, |log: &mut Log, _| log.push("exit".into()));

        fsm.on_event(&mut log, Event::GetParam, &json!({"name": "interval"})).unwrap();
        assert_eq!(log, ["interval"]);
        assert_eq!(fsm.history().count(), 0);
    }

    #[test]
    fn test_dynamic_registration() {
        let mut log = Log::new();
        let mut fsm = machine();
        fsm.on_event(&mut log, Event::Discover, &Value::Null).unwrap();
        assert!(fsm.on_event(&mut log, Event::GetParam, &Value::Null).is_err());

        for state in [State::Command, State::Autosample] {
            fsm.add_handler(state, Event::GetParam, |_: &mut Log, _: &Value| Ok(HandlerResult::stay("ok")));
        }
        assert_eq!(fsm.on_event(&mut log, Event::GetParam, &Value::Null).unwrap(), "ok");
        assert!(fsm.events_for(State::Autosample).contains(&Event::GetParam));
    }

    #[test]
    fn test_handler_error_keeps_state() {
        let mut log = Log::new();
        let mut fsm = machine();
        fsm.add_handler(State::Unknown, Event::GetParam, |_: &mut Log, _: &Value| {
            Err(StateMachineError::Handler("instrument said ?CMD".into()))
        });
        let err = fsm.on_event(&mut log, Event::GetParam, &Value::Null).unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(fsm.state(), State::Unknown);
    }

    #[test]
    fn test_resolve_defers_transition() {
        let mut log = Log::new();
        let mut fsm = machine();
        fsm.add_enter_hook(State::Command, |log: &mut Log, _| log.push("enter".into()));

        let result = fsm.resolve(&mut log, Event::Discover, &Value::Null).unwrap();
        assert_eq!(result.next_state, Some(State::Command));
        assert_eq!(fsm.state(), State::Unknown);
        assert!(log.is_empty());

        assert_eq!(fsm.commit(&mut log, Event::Discover, result.next_state), Some((State::Unknown, State::Command)));
        assert_eq!(fsm.state(), State::Command);
        assert_eq!(log, ["enter"]);
        assert_eq!(fsm.commit(&mut log, Event::GetParam, Some(State::Command)), None);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut log = Log::new();
        let mut fsm = machine().with_history(3);
        fsm.on_event(&mut log, Event::Discover, &Value::Null).unwrap();
        for _ in 0..3 {
            fsm.on_event(&mut log, Event::StartAutosample, &Value::Null).unwrap();
            fsm.on_event(&mut log, Event::StopAutosample, &Value::Null).unwrap();
        }
        let history: Vec<_> = fsm.history().collect();
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].event, Event::StopAutosample);
        assert_eq!(history[2].to, State::Command);
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Unit {
        Master,
        Pump,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Stage {
        Off,
        Armed,
        Ready,
        Running,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Cmd {
        Arm,
        Prime,
        Go,
        Spin,
    }

    fn composite() -> ReactiveMachine<Unit, Stage, Cmd, Log> {
        let mut master = ProtocolStateMachine::new(Stage::Off);
        master.add_handler(Stage::Off, Cmd::Arm, |_: &mut Log, _: &Value| Ok(HandlerResult::goto(Stage::Armed, ())));
        master.add_handler(Stage::Armed, Cmd::Go, |log: &mut Log, _: &Value| {
            log.push("master running".into());
            Ok(HandlerResult::goto(Stage::Running, ()))
        });

        let mut pump = ProtocolStateMachine::new(Stage::Off);
        pump.add_handler(Stage::Off, Cmd::Prime, |log: &mut Log, _: &Value| {
            log.push("pump primed".into());
            Ok(HandlerResult::goto(Stage::Ready, ()))
        });

        let mut rm = ReactiveMachine::new();
        rm.add_child(Unit::Master, master);
        rm.add_child(Unit::Pump, pump);
        rm.add_rule(vec![(Unit::Master, Stage::Armed), (Unit::Pump, Stage::Off)], Unit::Pump, Cmd::Prime);
        rm.add_rule(vec![(Unit::Master, Stage::Armed), (Unit::Pump, Stage::Ready)], Unit::Master, Cmd::Go);
        rm
    }

    #[test]
    fn test_reactions_run_until_table_settles() {
        let mut log = Log::new();
        let mut rm = composite();
        let out = rm.dispatch(&mut log, Unit::Master, Cmd::Arm, &Value::Null).unwrap();

        let sent: Vec<_> = out.reactions.iter().map(|r| (r.target, r.event)).collect();
        assert_eq!(sent, [(Unit::Pump, Cmd::Prime), (Unit::Master, Cmd::Go)]);
        assert_eq!(log, ["pump primed", "master running"]);
        assert_eq!(rm.states(), [(Unit::Master, Stage::Running), (Unit::Pump, Stage::Ready)]);
    }

    #[test]
    fn test_staying_reaction_settles() {
        let mut log = Log::new();
        let mut rm = composite();
        // Polling the pump leaves it where it is
        rm.child_mut(Unit::Pump)
            .unwrap()
            .add_handler(Stage::Ready, Cmd::Spin, |log: &mut Log, _: &Value| {
                log.push("pump polled".into());
                Ok(HandlerResult::stay(()))
            });
        rm.add_rule(vec![(Unit::Master, Stage::Running), (Unit::Pump, Stage::Ready)], Unit::Pump, Cmd::Spin);

        let out = rm.dispatch(&mut log, Unit::Master, Cmd::Arm, &Value::Null).unwrap();
        assert_eq!(out.reactions.len(), 3);
        assert_eq!(log, ["pump primed", "master running", "pump polled"]);
        assert_eq!(rm.states(), [(Unit::Master, Stage::Running), (Unit::Pump, Stage::Ready)]);
    }

    #[test]
    fn test_reaction_limit() {
        let mut log = Log::new();
        // Two rows that keep flipping the pump between states
        let mut rm = ReactiveMachine::<Unit, Stage, Cmd, Log>::new().with_reaction_limit(5);
        let mut pump = ProtocolStateMachine::new(Stage::Off);
        pump.add_handler(Stage::Off, Cmd::Arm, |_: &mut Log, _: &Value| Ok(HandlerResult::goto(Stage::Armed, ())));
        pump.add_handler(Stage::Armed, Cmd::Spin, |_: &mut Log, _: &Value| {
            Ok(HandlerResult::goto(Stage::Running, ()))
        });
        pump.add_handler(Stage::Running, Cmd::Prime, |_: &mut Log, _: &Value| {
            Ok(HandlerResult::goto(Stage::Armed, ()))
        });
        rm.add_child(Unit::Pump, pump);
        rm.add_rule(vec![(Unit::Pump, Stage::Armed)], Unit::Pump, Cmd::Spin);
        rm.add_rule(vec![(Unit::Pump, Stage::Running)], Unit::Pump, Cmd::Prime);

        let err = rm.dispatch(&mut log, Unit::Pump, Cmd::Arm, &Value::Null).unwrap_err();
        assert_eq!(err, StateMachineError::ReactionLimit(5));
    }

    #[test]
    fn test_unknown_child() {
        let mut log = Log::new();
        let mut rm = ReactiveMachine::<Unit, Stage, Cmd, Log>::new();
        assert!(matches!(
            rm.dispatch(&mut log, Unit::Pump, Cmd::Arm, &Value::Null),
            Err(StateMachineError::UnknownChild(_))
        ));
    }
}
