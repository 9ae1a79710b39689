//! The static RPC dealer: a fixed, process-wide name to handler table. No
//! registration messages, no pattern matching — callees are compiled in.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;

use crate::error::{Error, ErrorKind};
use crate::messages::Message;
use crate::session::ClientConnection;
use crate::{Dict, List, WampResult};

/// One event a handler asks the dealer to fan out to a topic's subscribers
/// alongside its answer (§1, §4.5: "RPCs whose handlers may themselves emit
/// broadcasts").
pub struct Broadcast {
    pub topic: String,
    pub args: Option<List>,
    pub kwargs: Option<Dict>,
}

impl Broadcast {
    pub fn new(topic: impl Into<String>, args: Option<List>, kwargs: Option<Dict>) -> Broadcast {
        Broadcast {
            topic: topic.into(),
            args,
            kwargs,
        }
    }
}

pub type Handler = dyn Fn(&Message, &Arc<ClientConnection>, Option<List>, Option<Dict>) -> WampResult<(Option<List>, Option<Dict>, Vec<Broadcast>)>
    + Send
    + Sync;

/// `procedure -> handler`. Looked up on every `CALL`; a miss yields
/// `wamp.error.no_such_procedure`.
pub struct ProcedureTable {
    handlers: HashMap<String, Box<Handler>>,
}

impl Default for ProcedureTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcedureTable {
    pub fn new() -> ProcedureTable {
        let mut table = ProcedureTable {
            handlers: HashMap::new(),
        };
        table.register("ping", |_call_message, _connection, _args, _kwargs| {
            Ok((Some(vec![json!("Ping response")]), None, Vec::new()))
        });
        table
    }

    pub fn register<F>(&mut self, procedure: impl Into<String>, handler: F)
    where
        F: Fn(&Message, &Arc<ClientConnection>, Option<List>, Option<Dict>) -> WampResult<(Option<List>, Option<Dict>, Vec<Broadcast>)>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.insert(procedure.into(), Box::new(handler));
    }

    /// Invoke `procedure` with `(*args, call_message, connection, **kwargs)`
    /// and return `(answer, broadcasts[])`.
    pub fn call(
        &self,
        procedure: &str,
        call_message: &Message,
        connection: &Arc<ClientConnection>,
        args: Option<List>,
        kwargs: Option<Dict>,
    ) -> WampResult<(Option<List>, Option<Dict>, Vec<Broadcast>)> {
        match self.handlers.get(procedure) {
            Some(handler) => handler(call_message, connection, args, kwargs),
            None => Err(Error::new(ErrorKind::UnknownProcedure(procedure.to_string()))),
        }
    }
}
