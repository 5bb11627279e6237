//! Identity of the virtual machine whose console is attached.

use crate::config::ConsoleSettings;

/// A console target: VM name plus optional namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsoleTarget {
    name: String,
    namespace: Option<String>,
}

impl ConsoleTarget {
    /// Target in the current/default namespace.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
        }
    }

    /// Set the namespace.
    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// VM name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Namespace, if any.
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Program and arguments that attach to this target's console.
    pub fn command_line(&self, settings: &ConsoleSettings) -> (String, Vec<String>) {
        let mut args = settings.args.clone();
        args.push(self.name.clone());
        if let Some(ns) = &self.namespace {
            if !settings.namespace_flag.is_empty() {
                args.push(settings.namespace_flag.clone());
            }
            args.push(ns.clone());
        }
        (settings.command.clone(), args)
    }
}

impl std::fmt::Display for ConsoleTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}
