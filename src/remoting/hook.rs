use std::sync::Arc;

use parking_lot::RwLock;

use crate::RemotingCommand;

/// Interceptor run around every invocation and every processed request.
pub trait RpcHook: Send + Sync + 'static {
    fn do_before_request(&self, remote_addr: &str, request: &mut RemotingCommand);

    fn do_after_response(
        &self,
        remote_addr: &str,
        request: &RemotingCommand,
        response: &mut RemotingCommand,
    );
}

/// Registered hooks, run in registration order.
#[derive(Default)]
pub struct RpcHooks {
    hooks: RwLock<Vec<Arc<dyn RpcHook>>>,
}

impl RpcHooks {
    pub fn register(&self, hook: Arc<dyn RpcHook>) {
        self.hooks.write().push(hook);
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.read().is_empty()
    }

    pub fn before_request(&self, remote_addr: &str, request: &mut RemotingCommand) {
        for hook in self.hooks.read().iter() {
            hook.do_before_request(remote_addr, request);
        }
    }

    pub fn after_response(
        &self,
        remote_addr: &str,
        request: &RemotingCommand,
        response: &mut RemotingCommand,
    ) {
        for hook in self.hooks.read().iter() {
            hook.do_after_response(remote_addr, request, response);
        }
    }
}
