// Name -> task id table
// Owned by the Kernel and passed by reference; there is no global map.
// The scheduler owns the sandboxes themselves.

use alloc::collections::BTreeMap;
use alloc::string::String;
use core::fmt;

use crate::sandbox::TaskId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Name already taken, contains the task holding it
    Duplicate(TaskId),
    NotFound,
    /// Task must be dormant first
    Busy(TaskId),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::Duplicate(id) => write!(f, "name already registered to task {}", id),
            RegistryError::NotFound => write!(f, "no task registered under that name"),
            RegistryError::Busy(id) => write!(f, "task {} is not dormant", id),
        }
    }
}

#[derive(Debug, Default)]
pub struct TaskRegistry {
    names: BTreeMap<String, TaskId>,
}

impl TaskRegistry {
    pub const fn new() -> Self {
        Self {
            names: BTreeMap::new(),
        }
    }

    // existing entry is left untouched on conflict
    pub fn register(&mut self, name: &str, id: TaskId) -> Result<(), RegistryError> {
        if let Some(&held) = self.names.get(name) {
            return Err(RegistryError::Duplicate(held));
        }
        self.names.insert(String::from(name), id);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<TaskId> {
        self.names.get(name).copied()
    }

    pub fn remove(&mut self, name: &str) -> Result<TaskId, RegistryError> {
        self.names.remove(name).ok_or(RegistryError::NotFound)
    }

    /// Drops every name bound to `id`; returns how many there were.
    pub fn unbind(&mut self, id: TaskId) -> usize {
        let before = self.names.len();
        self.names.retain(|_, held| *held != id);
        before - self.names.len()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, TaskId)> {
        self.names.iter().map(|(n, &id)| (n.as_str(), id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_lookup() {
        let mut reg = TaskRegistry::new();
        reg.register("blink", TaskId::new(3)).unwrap();
        assert_eq!(reg.lookup("blink"), Some(TaskId::new(3)));
        assert_eq!(reg.lookup("blinky"), None);
    }

    #[test]
    fn duplicate_name_keeps_first_entry() {
        let mut reg = TaskRegistry::new();
        reg.register("task1", TaskId::new(1)).unwrap();
        assert_eq!(
            reg.register("task1", TaskId::new(2)),
            Err(RegistryError::Duplicate(TaskId::new(1)))
        );
        assert_eq!(reg.lookup("task1"), Some(TaskId::new(1)));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn remove_frees_the_name() {
        let mut reg = TaskRegistry::new();
        reg.register("a", TaskId::new(1)).unwrap();
        assert_eq!(reg.remove("a"), Ok(TaskId::new(1)));
        assert_eq!(reg.remove("a"), Err(RegistryError::NotFound));
        reg.register("a", TaskId::new(9)).unwrap();
        assert_eq!(reg.iter().collect::<alloc::vec::Vec<_>>(), [("a", TaskId::new(9))]);
    }

    #[test]
    fn unbind_drops_every_alias() {
        let mut reg = TaskRegistry::new();
        reg.register("a", TaskId::new(1)).unwrap();
        reg.register("b", TaskId::new(1)).unwrap();
        reg.register("c", TaskId::new(2)).unwrap();
        assert_eq!(reg.unbind(TaskId::new(1)), 2);
        assert_eq!(reg.unbind(TaskId::new(1)), 0);
        assert_eq!(reg.iter().collect::<alloc::vec::Vec<_>>(), [("c", TaskId::new(2))]);
    }
}
