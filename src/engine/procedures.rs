//! Registry of stored procedures, replayed onto new channels.

use dashmap::DashMap;
use tracing::debug;

use crate::protocol::{Request, RequestType};

#[derive(Default)]
pub(crate) struct ProcedureRegistry {
    procedures: DashMap<String, Request>,
}

impl ProcedureRegistry {
    /// Track a store or delete request that was sent successfully.
    pub(crate) fn record(&self, request: &Request) {
        let Some(name) = request.procedure_name() else {
            return;
        };
        match request.kind {
            RequestType::StoreProcedure => {
                debug!(procedure = %name, "Registered procedure");
                self.procedures.insert(name, request.replay());
            }
            RequestType::DeleteProcedure => {
                debug!(procedure = %name, "Unregistered procedure");
                self.procedures.remove(&name);
            }
            _ => {}
        }
    }

    /// Creation requests of all registered procedures.
    pub(crate) fn snapshot(&self) -> Vec<(String, Request)> {
        self.procedures
            .iter()
            .map(|p| (p.key().clone(), p.value().clone()))
            .collect()
    }

    pub(crate) fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.procedures.iter().map(|p| p.key().clone()).collect();
        names.sort();
        names
    }
}
