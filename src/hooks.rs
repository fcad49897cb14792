use crate::client::{Client, Connection};
use crate::format::CodecType;
use crate::source::FallbackInfo;

use std::sync::Arc;

/// Authentication lifecycle callbacks. The actual credential checking
/// happened before a client reaches the core; these are the session
/// notifications the core owes the auth module.
pub trait AuthHook: Send + Sync {
    fn stream_start(&self, _mount: &str) {}
    fn stream_end(&self, _mount: &str) {}
    fn release_listener(&self, _mount: &str, _connection: &Connection) {}
}

pub struct NoopAuth;

impl AuthHook for NoopAuth {}

/// Stream directory registration.
pub trait YpDirectory: Send + Sync {
    fn add(&self, _mount: &str) {}
    fn remove(&self, _mount: &str) {}
}

pub struct NoopYp;

impl YpDirectory for NoopYp {}

/// Static file serving module. Adopts listeners that cannot be placed
/// on a live mount (rate-hinted fallback files, overrides of
/// unconnected mounts).
pub trait FileServe: Send + Sync {
    /// Take over `client`, streaming the fallback file at the descriptor's
    /// rate. Returns false when no file backs the request.
    fn serve(&self, _fb: &FallbackInfo, _client: &mut Client) -> bool {
        false
    }

    /// Override request for a mount with no live source.
    fn set_override(&self, _mount: &str, _dest: &str, _codec: CodecType) -> bool {
        false
    }

    /// Drive an adopted client one tick; a negative return releases it.
    fn tick(&self, _client: &mut Client, _now_ms: u64) -> i64 {
        -1
    }
}

pub struct NoopFileServe;

impl FileServe for NoopFileServe {}

/// External collaborators, injected at hub construction.
pub struct Hooks {
    pub auth: Arc<dyn AuthHook>,
    pub yp: Arc<dyn YpDirectory>,
    pub fserve: Arc<dyn FileServe>,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            auth: Arc::new(NoopAuth),
            yp: Arc::new(NoopYp),
            fserve: Arc::new(NoopFileServe),
        }
    }
}

/// Run an on_connect / on_disconnect script, detached. The child is
/// reaped by the runtime; the core never waits on it.
pub fn run_script(command: &str, mount: &str) {
    if tokio::runtime::Handle::try_current().is_err() {
        tracing::warn!("no runtime available, script {command} disabled");
        return;
    }
    match tokio::process::Command::new(command).arg(mount).spawn() {
        Ok(_child) => tracing::debug!("started command {command} for {mount}"),
        Err(e) => tracing::error!("unable to run command {command} ({e})"),
    }
}
