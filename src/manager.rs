//! Kernel Manager: cached connection options, kernelspec/running-kernel
//! enumeration with change detection, and a registry-first `connect_to` that
//! avoids opening a second websocket to a kernel this process already has a
//! live session for.

use std::sync::Mutex;

use crate::rest::RestClient;
use crate::session::KernelSession;
use crate::types::{KernelModel, KernelSpec};
use crate::{Error, Result};

/// Connection options shared by every kernel this manager starts or
/// connects to, with per-call overrides layered on top.
#[derive(Clone, Debug, Default)]
pub struct ManagerOptions {
    /// Base URL of the Jupyter server (e.g. `http://localhost:8888/`).
    pub base_url: String,
    /// Server auth token.
    pub token: String,
    /// Username stamped into message headers. Defaults to `"username"` if
    /// left empty, matching the notebook server's own default identity.
    pub username: String,
    /// Consecutive reconnect attempts before a session gives up. `None`
    /// uses [`crate::session::DEFAULT_RECONNECT_LIMIT`].
    pub reconnect_limit: Option<u32>,
}

impl ManagerOptions {
    fn effective_username(&self) -> String {
        if self.username.is_empty() {
            "username".to_string()
        } else {
            self.username.clone()
        }
    }
}

struct Cache {
    specs: Option<(Option<String>, Vec<(String, KernelSpec)>)>,
    running: Option<Vec<KernelModel>>,
}

/// Manages kernel lifecycle (enumerate kernelspecs, list/start/connect-to
/// running kernels) against one Jupyter server.
pub struct KernelManager {
    rest: RestClient,
    options: ManagerOptions,
    cache: Mutex<Cache>,
}

impl KernelManager {
    /// Build a manager for the given server, without making any requests.
    pub fn new(options: ManagerOptions) -> Result<Self> {
        let rest = RestClient::new(&options.base_url, &options.token)?;
        Ok(Self {
            rest,
            options,
            cache: Mutex::new(Cache {
                specs: None,
                running: None,
            }),
        })
    }

    /// The manager's effective connection options.
    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    /// List all kernelspecs the server knows about. Cached after the first
    /// successful fetch; pass `refresh: true` to bypass the cache.
    ///
    /// Returns `(default_name, specs)`. `specs_changed` (see
    /// [`KernelManager::refresh_specs`]) is how callers detect that this
    /// list is stale without polling this method in a loop.
    pub async fn kernelspecs(
        &self,
        refresh: bool,
    ) -> Result<(Option<String>, Vec<(String, KernelSpec)>)> {
        if !refresh {
            if let Some(cached) = self.cache.lock().unwrap().specs.clone() {
                return Ok(cached);
            }
        }
        let fetched = self.rest.list_kernelspecs().await?;
        self.cache.lock().unwrap().specs = Some(fetched.clone());
        Ok(fetched)
    }

    /// Refresh the kernelspecs cache and report whether it actually
    /// changed (deep equality against the previous cached value), so
    /// callers can gate a `specs_changed` notification on a real change
    /// rather than firing on every poll.
    pub async fn refresh_specs(&self) -> Result<bool> {
        let fresh = self.rest.list_kernelspecs().await?;
        let mut cache = self.cache.lock().unwrap();
        let changed = cache.specs.as_ref() != Some(&fresh);
        cache.specs = Some(fresh);
        Ok(changed)
    }

    /// Resolve the kernelspec to start when the caller doesn't name one:
    /// the server's own `default`, falling back leniently to the first
    /// valid entry if `default` is missing or doesn't name a real spec.
    pub async fn default_kernel_name(&self) -> Result<String> {
        let (default, specs) = self.kernelspecs(false).await?;
        if let Some(name) = &default {
            if specs.iter().any(|(n, _)| n == name) {
                return Ok(name.clone());
            }
        }
        specs
            .into_iter()
            .next()
            .map(|(name, _)| name)
            .ok_or_else(|| Error::InvalidResponse("server has no kernelspecs".to_string()))
    }

    /// List all currently running kernels. Cached after the first
    /// successful fetch; pass `refresh: true` to bypass the cache.
    pub async fn running_kernels(&self, refresh: bool) -> Result<Vec<KernelModel>> {
        if !refresh {
            if let Some(cached) = self.cache.lock().unwrap().running.clone() {
                return Ok(cached);
            }
        }
        let fetched: Vec<KernelModel> = self
            .rest
            .list_kernels()
            .await?
            .into_iter()
            .map(|k| KernelModel { id: k.id, name: k.name })
            .collect();
        self.cache.lock().unwrap().running = Some(fetched.clone());
        Ok(fetched)
    }

    /// Refresh the running-kernels cache and report whether the set of
    /// running kernels actually changed.
    pub async fn refresh_running(&self) -> Result<bool> {
        let fresh: Vec<KernelModel> = self
            .rest
            .list_kernels()
            .await?
            .into_iter()
            .map(|k| KernelModel { id: k.id, name: k.name })
            .collect();
        let mut cache = self.cache.lock().unwrap();
        let changed = cache.running.as_ref() != Some(&fresh);
        cache.running = Some(fresh);
        Ok(changed)
    }

    /// Start a new kernel (using the server's default kernelspec if `name`
    /// is `None`) and connect a session to it.
    pub async fn start_kernel(&self, name: Option<&str>) -> Result<KernelSession> {
        let name = match name {
            Some(n) => n.to_string(),
            None => self.default_kernel_name().await?,
        };
        let model = self.rest.start_kernel(&name).await?;
        self.cache.lock().unwrap().running = None;
        KernelSession::connect(
            self.rest.clone(),
            model.id,
            model.name,
            self.options.effective_username(),
            None,
            self.options.reconnect_limit,
        )
        .await
    }

    /// Connect to an already-running kernel by id.
    ///
    /// If `client_id` is passed and already names a live session in this
    /// process (see [`crate::registry`]), that exact session is resumed —
    /// same client id, same session object.
    ///
    /// Otherwise, if this process already holds a live session for
    /// `kernel_id` under some *other* client id, this returns a clone: a
    /// fresh session with a newly minted client id but the same kernel id
    /// and kernel name, opening its own websocket rather than sharing the
    /// existing session's. This avoids a redundant `get_kernel` REST call
    /// when the kernel is already known locally.
    ///
    /// Only when neither is true does this fall back to a REST lookup.
    pub async fn connect_to(&self, kernel_id: &str, client_id: Option<String>) -> Result<KernelSession> {
        if let Some(id) = client_id.as_deref() {
            if let Some(shared) = crate::registry::find(id) {
                return Ok(KernelSession::from_shared(shared));
            }
        }
        if let Some(existing) = crate::registry::find_by_kernel_id(kernel_id) {
            return KernelSession::connect(
                existing.rest().clone(),
                existing.kernel_id().to_string(),
                existing.kernel_name().to_string(),
                existing.username(),
                client_id,
                Some(existing.reconnect_limit()),
            )
            .await;
        }
        let model = self
            .rest
            .get_kernel(kernel_id)
            .await?
            .ok_or_else(|| Error::NoSuchKernel(kernel_id.to_string()))?;
        KernelSession::connect(
            self.rest.clone(),
            model.id,
            model.name,
            self.options.effective_username(),
            client_id,
            self.options.reconnect_limit,
        )
        .await
    }

    /// Shut down a kernel by id, without requiring a live session.
    pub async fn shutdown_kernel(&self, kernel_id: &str) -> Result<()> {
        self.rest.shutdown_kernel(kernel_id).await?;
        self.cache.lock().unwrap().running = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_username_defaults_when_empty() {
        let opts = ManagerOptions {
            base_url: "http://localhost:8888/".into(),
            token: String::new(),
            username: String::new(),
            reconnect_limit: None,
        };
        assert_eq!(opts.effective_username(), "username");
    }

    #[test]
    fn effective_username_passes_through_when_set() {
        let opts = ManagerOptions {
            base_url: "http://localhost:8888/".into(),
            token: String::new(),
            username: "alice".into(),
            reconnect_limit: None,
        };
        assert_eq!(opts.effective_username(), "alice");
    }

    #[test]
    fn new_rejects_invalid_base_url() {
        let opts = ManagerOptions {
            base_url: "not a url".into(),
            token: String::new(),
            username: String::new(),
            reconnect_limit: None,
        };
        assert!(KernelManager::new(opts).is_err());
    }
}
