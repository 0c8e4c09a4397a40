//! Name → procedure lookup.

use std::collections::HashMap;

use crate::Procedure;

/// The set of procedures a server exposes, keyed by name.
///
/// Names are unique; inserting an existing name replaces the old entry.
pub struct ProcedureTable<Ctx> {
    procedures: HashMap<String, Procedure<Ctx>>,
}

impl<Ctx> ProcedureTable<Ctx> {
    pub fn new() -> Self {
        Self {
            procedures: HashMap::new(),
        }
    }

    /// Adds a procedure, builder style.
    pub fn with(mut self, name: impl Into<String>, procedure: Procedure<Ctx>) -> Self {
        self.insert(name, procedure);
        self
    }

    /// Adds a procedure, returning the one it replaced.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        procedure: Procedure<Ctx>,
    ) -> Option<Procedure<Ctx>> {
        let name = name.into();
        let replaced = self.procedures.insert(name.clone(), procedure);
        if replaced.is_some() {
            tracing::warn!(%name, "procedure redefined");
        }
        replaced
    }

    pub fn get(&self, name: &str) -> Option<&Procedure<Ctx>> {
        self.procedures.get(name)
    }

    /// All registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> =
            self.procedures.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Moves every procedure of `other` into this table.
    pub fn extend(&mut self, other: ProcedureTable<Ctx>) {
        for (name, procedure) in other.procedures {
            self.insert(name, procedure);
        }
    }

    pub fn len(&self) -> usize {
        self.procedures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procedures.is_empty()
    }
}

impl<Ctx> Default for ProcedureTable<Ctx> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Ctx> std::fmt::Debug for ProcedureTable<Ctx> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcedureTable")
            .field("names", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use futures_util::stream;

    use super::*;
    use crate::{NoInput, ProcedureKind, input};

    fn ping() -> Procedure<()> {
        input(NoInput).resolve(|_, ()| async { Ok::<_, String>("pong") })
    }

    fn ticks() -> Procedure<()> {
        input(NoInput).stream_resolve(
            |_, ()| stream::iter([Ok::<_, String>(1)]),
            false,
        )
    }

    #[test]
    fn test_lookup_by_name() {
        let table = ProcedureTable::new().with("ping", ping()).with("ticks", ticks());

        assert_eq!(table.len(), 2);
        assert_eq!(table.names(), ["ping", "ticks"]);
        assert_eq!(
            table.get("ping").map(Procedure::kind),
            Some(ProcedureKind::Standard)
        );
        assert_eq!(
            table.get("ticks").map(Procedure::kind),
            Some(ProcedureKind::Streaming)
        );
        assert!(table.get("missing").is_none());
    }

    #[test]
    fn test_insert_replaces_existing_name() {
        let mut table = ProcedureTable::new();
        assert!(table.insert("p", ping()).is_none());

        let replaced = table.insert("p", ticks());
        assert_eq!(replaced.map(|p| p.kind()), Some(ProcedureKind::Standard));
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("p").map(Procedure::kind), Some(ProcedureKind::Streaming));
    }

    #[test]
    fn test_extend_merges_tables() {
        let mut table = ProcedureTable::new().with("ping", ping());
        table.extend(ProcedureTable::new().with("ticks", ticks()));

        assert_eq!(table.names(), ["ping", "ticks"]);
        assert!(!table.is_empty());
    }
}
