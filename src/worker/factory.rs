//! Named constructors for steps and sessions.
//!
//! Chains and steps create collaborators by name with JSON construction
//! arguments. A missing name or a constructor that declines the arguments
//! yields `None`; nothing here panics or returns an error.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use serde_json::Value;

use crate::session::{Session, SharedSession};
use crate::step::{SharedStep, Step};

type StepCtor = Box<dyn Fn(&Value) -> Option<SharedStep>>;
type SessionCtor = Box<dyn Fn(&Value) -> Option<SharedSession>>;

/// Constructor table owned by a worker
#[derive(Default)]
pub struct Registry {
    steps: HashMap<String, StepCtor>,
    sessions: HashMap<String, SessionCtor>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step constructor, replacing any previous one under `name`
    pub fn register_step<S, F>(&mut self, name: impl Into<String>, ctor: F)
    where
        S: Step + 'static,
        F: Fn(&Value) -> Option<S> + 'static,
    {
        self.steps.insert(
            name.into(),
            Box::new(move |args| ctor(args).map(|s| Rc::new(RefCell::new(s)) as SharedStep)),
        );
    }

    /// Register a session constructor, replacing any previous one under `name`
    pub fn register_session<S, F>(&mut self, name: impl Into<String>, ctor: F)
    where
        S: Session + 'static,
        F: Fn(&Value) -> Option<S> + 'static,
    {
        self.sessions.insert(
            name.into(),
            Box::new(move |args| ctor(args).map(|s| Rc::new(RefCell::new(s)) as SharedSession)),
        );
    }

    pub fn has_step(&self, name: &str) -> bool {
        self.steps.contains_key(name)
    }

    pub fn has_session(&self, name: &str) -> bool {
        self.sessions.contains_key(name)
    }

    pub(crate) fn build_step(&self, name: &str, args: &Value) -> Option<SharedStep> {
        self.steps.get(name).and_then(|ctor| ctor(args))
    }

    pub(crate) fn build_session(&self, name: &str, args: &Value) -> Option<SharedSession> {
        self.sessions.get(name).and_then(|ctor| ctor(args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{CmdStatus, StepEvent};
    use crate::worker::StepContext;
    use serde_json::json;

    struct Echo {
        label: String,
    }

    impl Step for Echo {
        fn name(&self) -> &str {
            &self.label
        }

        fn callback(&mut self, _ctx: &mut StepContext<'_>, _event: StepEvent) -> CmdStatus {
            CmdStatus::Done
        }
    }

    struct Probe;

    impl Session for Probe {
        fn name(&self) -> &str {
            "probe"
        }
    }

    fn make_registry() -> Registry {
        let mut registry = Registry::new();
        registry.register_step("echo", |args: &Value| {
            let label = args.get("label")?.as_str()?.to_string();
            Some(Echo { label })
        });
        registry.register_session("probe", |_: &Value| Some(Probe));
        registry
    }

    #[test]
    fn test_build_registered_step() {
        let registry = make_registry();
        let step = registry.build_step("echo", &json!({ "label": "first" }));
        assert_eq!(step.unwrap().borrow().name(), "first");
    }

    #[test]
    fn test_rejected_args_yield_none() {
        let registry = make_registry();
        assert!(registry.build_step("echo", &json!({})).is_none());
    }

    #[test]
    fn test_unknown_names_yield_none() {
        let registry = make_registry();
        assert!(registry.build_step("missing", &Value::Null).is_none());
        assert!(registry.build_session("missing", &Value::Null).is_none());
        assert!(registry.has_session("probe"));
        assert!(!registry.has_step("probe"));
    }
}
