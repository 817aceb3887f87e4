//! Routing state of the broker.
//!
//! The router runs as a single task fed by every client session, so all of
//! its state (connected clients, the dispatch table, running calls) is owned
//! here and needs no locking. Handling a command never blocks: outbound
//! envelopes go to per-client unbounded queues drained by writer tasks.

use crate::ipc::{Call, Envelope, HandlerId, Register, Response, Update};
use crate::registry::{DispatchKey, DispatchTable};
use crate::rpc::{ErrorKind, RpcResult};
use serde_json::json;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub(crate) type ClientId = u64;

/// Events from client sessions.
#[derive(Debug)]
pub(crate) enum RouterCommand {
    Connected(ClientId, mpsc::UnboundedSender<Envelope>),
    Received(ClientId, Envelope),
    Disconnected(ClientId),
}

/// A handler somewhere in the system: which client, which of its handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Route {
    client: ClientId,
    handler: HandlerId,
}

#[derive(Debug)]
struct RunningCall {
    caller: ClientId,
    callee: Route,
    key: DispatchKey,
    call: Call,
}

#[derive(Default)]
pub(crate) struct Router {
    clients: HashMap<ClientId, mpsc::UnboundedSender<Envelope>>,
    table: DispatchTable<Route>,
    running: HashMap<String, RunningCall>,
}

impl Router {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<RouterCommand>) {
        while let Some(command) = commands.recv().await {
            self.handle(command);
        }
        debug!("Router stopped");
    }

    pub(crate) fn handle(&mut self, command: RouterCommand) {
        match command {
            RouterCommand::Connected(client, outbound) => {
                debug!("Client {} connected", client);
                self.clients.insert(client, outbound);
            }
            RouterCommand::Received(client, envelope) => self.on_envelope(client, envelope),
            RouterCommand::Disconnected(client) => self.on_disconnect(client),
        }
    }

    fn on_envelope(&mut self, client: ClientId, envelope: Envelope) {
        match envelope {
            Envelope::Register(register) => self.on_register(client, register),
            Envelope::Call(call) => self.on_call(client, call),
            Envelope::Update(update) => self.on_update(client, update),
            Envelope::Result(response) => self.on_result(client, response),
            Envelope::Cancel(cancel) => self.on_cancel(client, &cancel.context),
        }
    }

    fn on_register(&mut self, client: ClientId, register: Register) {
        info!(
            "Client {} registered {} (priority {})",
            client, register.function, register.priority
        );
        self.table.insert(
            register.function,
            register.priority,
            Route {
                client,
                handler: register.handler,
            },
        );
        self.send(
            client,
            Envelope::result(register.context, RpcResult::ok(serde_json::Value::Null)),
        );
    }

    fn on_call(&mut self, caller: ClientId, mut call: Call) {
        if self.running.contains_key(&call.context) {
            warn!("Client {} reused running context {}", caller, call.context);
            self.send(
                caller,
                Envelope::result(
                    call.context.clone(),
                    RpcResult::error(
                        ErrorKind::InvalidArgs,
                        json!({"context": call.context}),
                    ),
                ),
            );
            return;
        }

        let Some(first) = self.table.first(&call.function) else {
            debug!("No handler for {}", call.function);
            let details = json!({"function": call.function});
            self.send(
                caller,
                Envelope::result(call.context, RpcResult::error(ErrorKind::UnknownRpc, details)),
            );
            return;
        };

        let (key, callee) = (first.key, first.value);
        call.handler = Some(callee.handler);
        let context = call.context.clone();
        debug!("Routing {} ({}) to client {}", call.function, context, callee.client);
        self.running.insert(
            context.clone(),
            RunningCall {
                caller,
                callee,
                key,
                call,
            },
        );
        if !self.forward(&context) {
            self.fall_through(&context);
        }
    }

    fn on_update(&mut self, client: ClientId, update: Update) {
        let caller = match self.running.get(&update.context) {
            Some(running) if running.callee.client == client => running.caller,
            _ => {
                debug!("Dropping update for inactive call {}", update.context);
                return;
            }
        };
        self.send(caller, Envelope::Update(update));
    }

    fn on_result(&mut self, client: ClientId, response: Response) {
        match self.running.get(&response.context) {
            Some(running) if running.callee.client == client => {}
            _ => {
                debug!("Dropping result for inactive call {}", response.context);
                return;
            }
        }

        if response.result.is_not_handled() {
            self.fall_through(&response.context);
            return;
        }
        if let Some(running) = self.running.remove(&response.context) {
            self.send(running.caller, Envelope::Result(response));
        }
    }

    fn on_cancel(&mut self, client: ClientId, context: &str) {
        match self.running.get(context) {
            Some(running) if running.caller == client => {}
            _ => return,
        }
        if let Some(running) = self.running.remove(context) {
            debug!("Call {} cancelled by client {}", context, client);
            self.send(running.callee.client, Envelope::cancel(context));
        }
    }

    fn on_disconnect(&mut self, client: ClientId) {
        info!("Client {} disconnected", client);
        self.clients.remove(&client);
        self.table.retain(|_, route| route.client != client);

        // Calls it made: nobody is waiting any more.
        let abandoned: Vec<String> = self
            .running
            .iter()
            .filter(|(_, running)| running.caller == client)
            .map(|(context, _)| context.clone())
            .collect();
        for context in abandoned {
            if let Some(running) = self.running.remove(&context) {
                self.send(running.callee.client, Envelope::cancel(context));
            }
        }

        // Calls it was serving: try whoever is next.
        let orphaned: Vec<String> = self
            .running
            .iter()
            .filter(|(_, running)| running.callee.client == client)
            .map(|(context, _)| context.clone())
            .collect();
        for context in orphaned {
            self.fall_through(&context);
        }
    }

    /// Route `context` to the handler after the current one, or tell the
    /// caller nobody handled it.
    fn fall_through(&mut self, context: &str) {
        loop {
            let Some(running) = self.running.get_mut(context) else {
                return;
            };
            match self.table.next_after(&running.call.function, running.key) {
                Some(next) => {
                    running.key = next.key;
                    running.callee = next.value;
                    running.call.handler = Some(next.value.handler);
                    debug!(
                        "Passing {} ({}) on to client {}",
                        running.call.function, context, next.value.client
                    );
                }
                None => {
                    if let Some(running) = self.running.remove(context) {
                        debug!("Nobody handled {} ({})", running.call.function, context);
                        self.send(
                            running.caller,
                            Envelope::result(context, RpcResult::not_handled()),
                        );
                    }
                    return;
                }
            }
            if self.forward(context) {
                return;
            }
        }
    }

    /// Send the running call to its current callee.
    fn forward(&self, context: &str) -> bool {
        match self.running.get(context) {
            Some(running) => self.send(running.callee.client, Envelope::Call(running.call.clone())),
            None => false,
        }
    }

    fn send(&self, client: ClientId, envelope: Envelope) -> bool {
        match self.clients.get(&client) {
            Some(outbound) => outbound.send(envelope).is_ok(),
            None => false,
        }
    }

    #[cfg(test)]
    fn running_len(&self) -> usize {
        self.running.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::Cancel;
    use serde_json::{json, Value};

    struct Harness {
        router: Router,
        outbound: HashMap<ClientId, mpsc::UnboundedReceiver<Envelope>>,
    }

    impl Harness {
        fn new(clients: &[ClientId]) -> Self {
            let mut harness = Harness {
                router: Router::new(),
                outbound: HashMap::new(),
            };
            for &client in clients {
                let (tx, rx) = mpsc::unbounded_channel();
                harness.router.handle(RouterCommand::Connected(client, tx));
                harness.outbound.insert(client, rx);
            }
            harness
        }

        fn recv(&mut self, client: ClientId, envelope: Envelope) {
            self.router.handle(RouterCommand::Received(client, envelope));
        }

        fn next(&mut self, client: ClientId) -> Option<Envelope> {
            self.outbound.get_mut(&client)?.try_recv().ok()
        }

        fn register(&mut self, client: ClientId, function: &str, priority: u16, handler: HandlerId) {
            self.recv(
                client,
                Envelope::Register(Register {
                    context: format!("reg-{client}-{handler}"),
                    function: function.into(),
                    priority,
                    handler,
                }),
            );
            match self.next(client) {
                Some(Envelope::Result(response)) => assert!(response.result.is_ok()),
                other => panic!("expected register ack, got {:?}", other),
            }
        }

        fn call(&mut self, client: ClientId, context: &str, function: &str) {
            self.recv(
                client,
                Envelope::Call(Call {
                    context: context.into(),
                    function: function.into(),
                    args: json!({}),
                    depth: 0,
                    handler: None,
                }),
            );
        }

        fn expect_call(&mut self, client: ClientId) -> Call {
            match self.next(client) {
                Some(Envelope::Call(call)) => call,
                other => panic!("expected call at client {}, got {:?}", client, other),
            }
        }

        fn expect_result(&mut self, client: ClientId) -> RpcResult {
            match self.next(client) {
                Some(Envelope::Result(response)) => response.result,
                other => panic!("expected result at client {}, got {:?}", client, other),
            }
        }
    }

    #[test]
    fn test_unknown_function() {
        let mut h = Harness::new(&[1]);
        h.call(1, "c1", "does.not.exist");

        match h.expect_result(1) {
            RpcResult::Error(err) => {
                assert_eq!(err.kind, ErrorKind::UnknownRpc);
                assert_eq!(err.details, json!({"function": "does.not.exist"}));
            }
            other => panic!("expected UnknownRpc, got {:?}", other),
        }
    }

    #[test]
    fn test_routes_to_highest_priority() {
        let mut h = Harness::new(&[1, 2, 3]);
        h.register(2, "f", 10, 7);
        h.register(3, "f", 200, 9);

        h.call(1, "c1", "f");
        let call = h.expect_call(3);
        assert_eq!(call.handler, Some(9));
        assert!(h.next(2).is_none());

        h.recv(3, Envelope::result("c1", RpcResult::ok(json!(42))));
        assert_eq!(h.expect_result(1), RpcResult::ok(json!(42)));
        assert_eq!(h.router.running_len(), 0);
    }

    #[test]
    fn test_not_handled_falls_through_in_order() {
        let mut h = Harness::new(&[1, 2, 3]);
        h.register(2, "f", 100, 1);
        h.register(3, "f", 50, 1);

        h.call(1, "c1", "f");
        h.expect_call(2);
        h.recv(2, Envelope::result("c1", RpcResult::not_handled()));

        h.expect_call(3);
        h.recv(3, Envelope::result("c1", RpcResult::not_handled()));

        assert!(h.expect_result(1).is_not_handled());
    }

    #[test]
    fn test_updates_are_relayed_to_caller() {
        let mut h = Harness::new(&[1, 2]);
        h.register(2, "f", 1, 1);
        h.call(1, "c1", "f");
        h.expect_call(2);

        for i in 0..3 {
            h.recv(
                2,
                Envelope::Update(Update {
                    context: "c1".into(),
                    value: json!(i),
                }),
            );
        }
        for i in 0..3 {
            match h.next(1) {
                Some(Envelope::Update(update)) => assert_eq!(update.value, json!(i)),
                other => panic!("expected update, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_results_from_non_callee_are_ignored() {
        let mut h = Harness::new(&[1, 2, 3]);
        h.register(2, "f", 1, 1);
        h.call(1, "c1", "f");
        h.expect_call(2);

        h.recv(3, Envelope::result("c1", RpcResult::ok(json!("spoofed"))));
        assert!(h.next(1).is_none());
        assert_eq!(h.router.running_len(), 1);
    }

    #[test]
    fn test_cancel_is_forwarded_to_callee() {
        let mut h = Harness::new(&[1, 2]);
        h.register(2, "f", 1, 1);
        h.call(1, "c1", "f");
        h.expect_call(2);

        h.recv(1, Envelope::Cancel(Cancel { context: "c1".into() }));
        assert_eq!(h.next(2), Some(Envelope::cancel("c1")));

        // The callee's late answer goes nowhere.
        h.recv(2, Envelope::result("c1", RpcResult::ok(Value::Null)));
        assert!(h.next(1).is_none());
    }

    #[test]
    fn test_callee_disconnect_falls_through() {
        let mut h = Harness::new(&[1, 2, 3]);
        h.register(2, "f", 100, 1);
        h.register(3, "f", 10, 1);

        h.call(1, "c1", "f");
        h.expect_call(2);
        h.router.handle(RouterCommand::Disconnected(2));

        h.expect_call(3);
        h.recv(3, Envelope::result("c1", RpcResult::ok(json!("backup"))));
        assert_eq!(h.expect_result(1), RpcResult::ok(json!("backup")));
    }

    #[test]
    fn test_last_callee_disconnect_reports_not_handled() {
        let mut h = Harness::new(&[1, 2]);
        h.register(2, "f", 1, 1);
        h.call(1, "c1", "f");
        h.expect_call(2);

        h.router.handle(RouterCommand::Disconnected(2));
        assert!(h.expect_result(1).is_not_handled());

        h.call(1, "c2", "f");
        assert!(h.expect_result(1).is_err());
    }

    #[test]
    fn test_caller_disconnect_cancels_at_callee() {
        let mut h = Harness::new(&[1, 2]);
        h.register(2, "f", 1, 1);
        h.call(1, "c1", "f");
        h.expect_call(2);

        h.router.handle(RouterCommand::Disconnected(1));
        assert_eq!(h.next(2), Some(Envelope::cancel("c1")));
        assert_eq!(h.router.running_len(), 0);
    }

    #[test]
    fn test_reused_context_is_rejected() {
        let mut h = Harness::new(&[1, 2]);
        h.register(2, "f", 1, 1);
        h.call(1, "c1", "f");
        h.expect_call(2);

        h.call(1, "c1", "f");
        match h.expect_result(1) {
            RpcResult::Error(err) => assert_eq!(err.kind, ErrorKind::InvalidArgs),
            other => panic!("expected error, got {:?}", other),
        }
        assert!(h.next(2).is_none());
    }
}
