use crate::{
    intercept::TypeGraph,
    AmbiguousRoute,
    BusResult,
    DuplicateRoute,
    NoRoute,
};
use std::{any::TypeId, collections::HashMap};

/// Message type to transport name lookup, built once at bus build and
/// immutable afterwards.
#[derive(Default)]
pub(crate) struct RoutingTable {
    routes: HashMap<TypeId, String>,
}

impl RoutingTable {
    /// Register a route; each message type may be claimed by one transport
    pub(crate) fn insert(
        &mut self,
        ty: TypeId,
        type_name: &'static str,
        transport: &str,
    ) -> BusResult<()> {
        if let Some(existing) = self.routes.get(&ty) {
            return DuplicateRoute {
                message_type: type_name,
                first: existing.clone(),
                second: transport,
            }
            .fail();
        }
        self.routes.insert(ty, transport.to_string());
        Ok(())
    }

    /// Resolve the transport for `ty`: exact match first, then the declared
    /// base kinds, nearest first. Two routed bases at the same distance are a
    /// configuration fault. `path` is the caller's requested destination,
    /// carried into the miss error.
    pub(crate) fn resolve(
        &self,
        ty: TypeId,
        type_name: &'static str,
        path: Option<&str>,
        graph: &TypeGraph,
    ) -> BusResult<&str> {
        for level in graph.levels(ty) {
            let mut matched: Option<&str> = None;
            for id in level {
                if let Some(transport) = self.routes.get(&id) {
                    match matched {
                        None => matched = Some(transport.as_str()),
                        Some(first) if first != transport => {
                            return AmbiguousRoute {
                                message_type: type_name,
                                first,
                                second: transport.clone(),
                            }
                            .fail()
                        }
                        Some(_) => {}
                    }
                }
            }
            if let Some(transport) = matched {
                return Ok(transport);
            }
        }
        NoRoute {
            message_type: type_name,
            path: path.map(str::to_string),
        }
        .fail()
    }
}
